pub mod chat_completions;
pub mod completions;
pub mod embeddings;
pub mod error;
pub mod models;

pub use error::{OpenAiError, OpenAiErrorBody};
