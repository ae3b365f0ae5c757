//! Top-level error type for the object runtime

use crate::config::ConfigError;
use crate::connection::LinkError;
use crate::registry::RegistrationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AliotError {
    /// Configuration could not be loaded or is incomplete
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid handler setup (duplicate hook, empty listener)
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The physical connection could not be opened
    #[error("Connection error: {0}")]
    Link(#[from] LinkError),

    /// The HTTP client for document reads could not be built
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}
