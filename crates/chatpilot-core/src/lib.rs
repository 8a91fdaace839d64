//! Core types for the chatpilot messaging hub.
//!
//! This crate provides the building blocks shared by the hub and its clients:
//! - `Intent` - Validated, structured user command
//! - `SessionSnapshot` - Consistent view of the shared session
//! - `ErrorKind` - Wire-level error taxonomy
//! - Collaborator traits (automation backend, language model, conversation store)
//! - Hub and client configuration

pub mod config;
pub mod context;
pub mod error;
pub mod intent;
pub mod traits;

pub use config::{FallbackConfig, HubConfig, MatchPolicy, RetryPolicy};
pub use context::{SessionChange, SessionSnapshot};
pub use error::ErrorKind;
pub use intent::{Intent, IntentError, IntentHint, SummaryTarget};
pub use traits::{AutomationBackend, BackendError, ConversationStore, LanguageModel, ModelError};
