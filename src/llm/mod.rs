//! Text-completion provider abstraction and cost accounting.
//!
//! Backends implement [`TextCompletion`]; the multi-connector router wraps
//! several of them and implements the same trait.

pub mod costs;
mod provider;

pub use costs::CostCreditor;
pub use provider::{
    CompletionRequestSettings, FinishReason, StreamingTextChunk, TextCompletion,
    TextCompletionResult, TextCompletionStream,
};
