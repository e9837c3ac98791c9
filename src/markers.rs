//! Marker line transforms.
//!
//! `@@ref`/`@@unref`/`@@important`/`@@ephemeral` enter the core as typed
//! calls from an outer marker parser everywhere except here: preparing a
//! summariser transcript requires stripping `@@ephemeral@@` lines and
//! pulling `@@important@@` lines out verbatim. These are the only two
//! places string scanning for markers happens in this crate.

const EPHEMERAL_MARKER: &str = "@@ephemeral@@";
const IMPORTANT_MARKER: &str = "@@important@@";

/// Remove every line containing the ephemeral marker from `text`.
pub fn strip_ephemeral_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.contains(EPHEMERAL_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collect every line containing the important marker, verbatim and in
/// order, for use as a preservation header.
pub fn extract_important_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| line.contains(IMPORTANT_MARKER))
        .map(|line| line.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_ephemeral_lines() {
        let text = "keep this\n@@ephemeral@@ drop this\nkeep too";
        let out = strip_ephemeral_lines(text);
        assert_eq!(out, "keep this\nkeep too");
    }

    #[test]
    fn extracts_important_lines_verbatim() {
        let text = "normal\n@@important@@ do not lose this\nnormal again";
        let out = extract_important_lines(text);
        assert_eq!(out, vec!["@@important@@ do not lose this".to_string()]);
    }

    #[test]
    fn no_markers_is_identity() {
        let text = "a\nb\nc";
        assert_eq!(strip_ephemeral_lines(text), text);
        assert!(extract_important_lines(text).is_empty());
    }
}
