//! Error types for the nodekit CLI.
//!
//! Library failures arrive as `ToolchainError` wrapped in `anyhow`; this enum
//! only covers conditions the CLI itself decides on.

use thiserror::Error;

/// Errors raised by the CLI layer.
#[derive(Debug, Error)]
pub enum NodekitError {
    /// A command was given a version that is not an exact `x.y.z`.
    #[error("expected an exact version like 18.17.0, got '{given}'")]
    NotExactVersion {
        /// What the user passed.
        given: String,
    },

    /// `run` was given no command.
    #[error("no command given after '--'")]
    EmptyCommand,

    /// Subprocess exited with non-zero code.
    ///
    /// The exit code is propagated without printing an additional message;
    /// the subprocess already printed its output.
    #[error("process exited with code {code}")]
    ProcessExitCode {
        /// The exit code from the subprocess.
        code: i32,
    },
}

impl NodekitError {
    /// Creates a new `ProcessExitCode` error.
    #[must_use]
    pub fn process_exit_code(code: i32) -> Self {
        Self::ProcessExitCode { code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_exit_code_displays_code() {
        let err = NodekitError::process_exit_code(7);
        assert_eq!(err.to_string(), "process exited with code 7");
    }

    #[test]
    fn not_exact_version_names_input() {
        let err = NodekitError::NotExactVersion {
            given: "^18".to_string(),
        };
        assert!(err.to_string().contains("'^18'"));
    }
}
