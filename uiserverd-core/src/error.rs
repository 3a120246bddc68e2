//! Error space shared with the GnuPG tools this daemon fronts.
//!
//! Clients of the UI server speak libassuan, so failures travel as the
//! numeric codes defined by libgpg-error. We only list the codes the
//! daemon actually emits; everything else is mapped to GENERAL.

use thiserror::Error;

/// Numeric error codes as defined by libgpg-error.
pub mod codes {
    pub const GENERAL: u32 = 1;
    pub const UNEXPECTED: u32 = 38;
    pub const INV_ARG: u32 = 45;
    pub const INV_VALUE: u32 = 55;
    pub const NO_DATA: u32 = 58;
    pub const INTERNAL: u32 = 63;
    pub const NOT_IMPLEMENTED: u32 = 69;
    pub const CONFLICT: u32 = 70;
    pub const CANCELED: u32 = 99;
    pub const MISSING_VALUE: u32 = 228;

    // Assuan protocol range.
    pub const ASS_CONNECT_FAILED: u32 = 259;
    pub const ASS_LINE_TOO_LONG: u32 = 263;
    pub const ASS_NESTED_COMMANDS: u32 = 264;
    pub const ASS_UNKNOWN_CMD: u32 = 275;
    pub const ASS_SYNTAX: u32 = 276;
    pub const ASS_CANCELED: u32 = 277;
    pub const ASS_NO_INPUT: u32 = 278;
    pub const ASS_NO_OUTPUT: u32 = 279;
    pub const ASS_PARAMETER: u32 = 280;
}

/// Error source used when composing wire codes (the "user 1" space).
const ERROR_SOURCE: u32 = 32;

/// Compose a bare gpg-error code into the 32-bit value carried on ERR lines.
pub fn wire_code(code: u32) -> u32 {
    (ERROR_SOURCE << 24) | (code & 0x00ff_ffff)
}

/// Strip the source component from a wire code again.
pub fn bare_code(wire: u32) -> u32 {
    wire & 0x00ff_ffff
}

/// Failure of a dispatched command, reported to the client as an ERR line.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CommandError {
    pub code: u32,
    pub message: String,
}

impl CommandError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        CommandError {
            code,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        CommandError::new(codes::CANCELED, "User canceled")
    }

    /// Catch-all for failures that should never reach a client untyped.
    pub fn unexpected(detail: impl std::fmt::Display) -> Self {
        CommandError::new(
            codes::UNEXPECTED,
            format!("Caught unexpected exception: {detail}"),
        )
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::new(codes::GENERAL, format!("I/O error: {err}"))
    }
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;
