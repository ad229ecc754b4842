//! Errors raised while setting up an analysis run.
//!
//! All of these are detected before any task is built, so a run that fails
//! here never starts.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetupError {
    /// One or more parameter fields are unset or unparsable
    #[error("The following arg(s) are invalid: {}.\nPlease set valid values and try again.", .fields.join(", "))]
    InvalidArgs { fields: Vec<String> },

    /// Central difference only works with zero-bandwidth detectors
    #[error("Central difference method can only be used with minimum bandwidth detectors (0Hz)")]
    IncompatibleMethod,

    #[error("Please select an audio input file")]
    MissingAudio,

    #[error("No segments to analyse")]
    NoSegments,

    #[error("Downsample factor must be at least 1")]
    InvalidDownsample,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_args_lists_every_field() {
        let err = SetupError::InvalidArgs {
            fields: vec!["Damping".into(), "Gain".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Damping, Gain"));
    }
}
