//! Multi-connector text completion router.
//!
//! Wraps several text-completion backends behind one [`TextCompletion`]
//! implementation. Every request is classified into a prompt shape and sent to
//! the connector currently selected for that shape. A background task samples
//! the main connector's answers, replays them on the other connectors, has the
//! main connector vet the replies, and moves each shape to the cheapest
//! connector that passed.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use multiconnector::llm::{CompletionRequestSettings, TextCompletion};
//! use multiconnector::multi_connector::{
//!     MultiTextCompletion, MultiTextCompletionSettings, NamedTextCompletion,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(big: Arc<dyn TextCompletion>, small: Arc<dyn TextCompletion>) -> multiconnector::Result<()> {
//! let shutdown = CancellationToken::new();
//! let router = MultiTextCompletion::new(
//!     MultiTextCompletionSettings::default(),
//!     vec![
//!         NamedTextCompletion::new("big", big),
//!         NamedTextCompletion::new("small", small),
//!     ],
//!     &shutdown,
//! )?;
//!
//! let _answer = router
//!     .get_completions("Translate to French: hello", &CompletionRequestSettings::new(), &shutdown)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod multi_connector;
pub mod observability;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use llm::TextCompletion;
pub use multi_connector::{MultiTextCompletion, MultiTextCompletionSettings, NamedTextCompletion};
