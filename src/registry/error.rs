//! Errors raised while configuring an object's handlers

use super::hooks::HookSlot;
use thiserror::Error;

/// Setup-time failures; all of these happen before any connection is attempted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// A lifecycle slot can only be filled once per object
    #[error("Configuration error: the {0} hook is already registered")]
    HookAlreadyRegistered(HookSlot),

    /// A listener must subscribe to at least one field
    #[error("Configuration error: a listener needs at least one field")]
    EmptyListener,
}
