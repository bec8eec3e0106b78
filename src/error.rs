use serde::Serialize;
use thiserror::Error;

/// Failure of a G-code line, from tokenizing through execution.
///
/// Every variant has a stable numeric code used in `error:<code>` responses
/// and a stable display string used in reports.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcodeError {
    /// Malformed number after a recognized word letter.
    #[error("Parse error")]
    Parse,
    /// A required word is absent (feedrate before G1, P for G4, I/J/R for arcs).
    #[error("Missing parameter")]
    MissingParameter,
    /// Non-positive feedrate, negative dwell, conflicting words.
    #[error("Invalid parameter")]
    InvalidParameter,
    /// M code outside spindle control and program end.
    #[error("Unknown command")]
    UnknownCommand,
    /// G code recognized as G-code but not implemented here.
    #[error("Unsupported command")]
    UnsupportedCommand,
    /// Arc geometry has no solution.
    #[error("Invalid target")]
    InvalidTarget,
    /// Line too long or a queue is full.
    #[error("Overflow")]
    Overflow,
}

impl GcodeError {
    pub const fn code(self) -> u8 {
        match self {
            GcodeError::Parse => 1,
            GcodeError::MissingParameter => 2,
            GcodeError::InvalidParameter => 3,
            GcodeError::UnknownCommand => 4,
            GcodeError::UnsupportedCommand => 5,
            GcodeError::InvalidTarget => 6,
            GcodeError::Overflow => 7,
        }
    }
}
