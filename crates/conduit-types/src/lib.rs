//! Shared types and error hierarchy for Conduit.

pub mod credential;
pub mod error;
pub mod message;
pub mod util;

pub use credential::{Credential, CredentialProvider, StaticCredential};
pub use error::{ApiError, ConfigError};
pub use message::*;
