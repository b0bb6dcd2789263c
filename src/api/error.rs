use thiserror::Error;

use crate::engine::EngineError;

/// Failure of a single command.
///
/// The `Display` output is placed verbatim in the `error` field of the
/// response envelope; [`CommandError::code`] is used for logging.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Missing or malformed request data. Raised before any side effect.
    #[error("Error: {0}")]
    Validation(String),

    /// Start parameters rejected before the framework is touched.
    #[error("InvalidFrameworkArguments: {0}")]
    InvalidFrameworkArguments(String),

    /// The command name is not in the command table.
    #[error("Error: Unknown command event `{0}`")]
    UnknownCommand(String),

    /// Failure reported by an engine collaborator, relayed verbatim.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Framework start/stop/build failure.
    #[error("{0}")]
    Process(String),

    /// Local processing step failed (image transform, file I/O, archive).
    #[error("ExecutionError: {0}")]
    Execution(String),
}

impl CommandError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn execution(message: impl std::fmt::Display) -> Self {
        Self::Execution(message.to_string())
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "validation",
            CommandError::InvalidFrameworkArguments(_) => "invalid_framework_arguments",
            CommandError::UnknownCommand(_) => "unknown_command",
            CommandError::Engine(_) => "engine",
            CommandError::Process(_) => "process",
            CommandError::Execution(_) => "execution",
        }
    }
}

impl From<crate::prefs::PrefsError> for CommandError {
    fn from(err: crate::prefs::PrefsError) -> Self {
        CommandError::execution(err)
    }
}

impl From<crate::archive::ArchiveError> for CommandError {
    fn from(err: crate::archive::ArchiveError) -> Self {
        CommandError::execution(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display() {
        let err = CommandError::validation("Unable to encrypt, invalid arguments");
        assert_eq!(err.to_string(), "Error: Unable to encrypt, invalid arguments");
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn unknown_command_display() {
        let err = CommandError::UnknownCommand("fly".into());
        assert_eq!(err.to_string(), "Error: Unknown command event `fly`");
    }

    #[test]
    fn engine_errors_pass_through_verbatim() {
        let err: CommandError = EngineError::failed("device offline").into();
        assert_eq!(err.to_string(), "device offline");
        assert_eq!(err.code(), "engine");
    }

    #[test]
    fn framework_argument_display() {
        let err = CommandError::InvalidFrameworkArguments("No project path specified".into());
        assert_eq!(
            err.to_string(),
            "InvalidFrameworkArguments: No project path specified"
        );
    }

    #[test]
    fn execution_display() {
        assert_eq!(
            CommandError::execution("rotate failed").to_string(),
            "ExecutionError: rotate failed"
        );
    }
}
