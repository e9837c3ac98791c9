//! Virtual memory paging engine: context-window management for
//! long-running LLM agent sessions. Keeps a conversation buffer usable
//! under a fixed provider token limit by archiving older messages into
//! content-addressed pages on disk, represented in context by short
//! summaries the model can re-materialise by reference.

pub mod compactor;
pub mod concurrency;
pub mod config;
pub mod context_assembler;
pub mod error;
pub mod flattener;
pub mod fork_store;
pub mod importance;
pub mod lane;
pub mod markers;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod page;
pub mod page_slot;
pub mod page_store;
pub mod semantic_index;
pub mod summarizer;
pub mod tokenizer;
pub mod watermark;

pub use config::MemoryConfig;
pub use error::{EngineError, EngineResult};
pub use memory::VirtualMemory;
pub use message::{FunctionCall, Message, Role, ToolCall};
pub use metrics::MemoryStats;
pub use page::{Page, PageRef};
pub use semantic_index::{EmbeddingProvider, SearchHit};
pub use summarizer::Summariser;
