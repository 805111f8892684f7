//! Event transport and dead-letter adapters.

pub mod channel;
pub mod dead_letter;
pub mod jsonl;

pub use channel::ChannelTransport;
pub use dead_letter::{JsonlDeadLetterFile, MemoryDeadLetters};
pub use jsonl::{JsonLinesSource, JsonLinesTransport};
