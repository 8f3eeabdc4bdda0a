//! Error types for the launcher

use thiserror::Error;

/// Main error type for the launcher
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("remote error: {0}")]
    Remote(String),

    /// The user interrupted an operation; exits with code 0.
    #[error("interrupted")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LaunchError>;

/// Configuration and template resolution errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("section not specified")]
    SectionNotSpecified,

    #[error("invalid section: {0}")]
    InvalidSection(String),

    #[error("cannot open config file: {0}")]
    CannotOpenConfig(String),

    #[error("HOME is not set")]
    NoHome,

    #[error("duplicate key '{key}' in section: [{section}]")]
    DuplicateKey { section: String, key: String },

    #[error("malformed line {line}: {text}")]
    MalformedLine { line: usize, text: String },

    #[error("unknown interpolation reference: ${{{0}}}")]
    UnknownReference(String),

    #[error("interpolation too deep in value: {0}")]
    InterpolationDepth(String),

    #[error("bad interpolation syntax in value: {0}")]
    BadInterpolation(String),

    #[error("@TMPFILE@ may only be used in a matched pair")]
    TempFileMisuse,

    #[error("--fcpu is missing")]
    MissingFrequency,

    #[error("unresolved file tag: {0}")]
    UnresolvedTag(String),

    #[error("missing configuration entry: {0}")]
    MissingKey(String),

    #[error("mode not specified in section: [{0}]")]
    ModeNotSpecified(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid rpc mode: {0}")]
    InvalidRpcMode(String),

    #[error("unparsable argument string: {0}")]
    BadArguments(String),

    #[error("spawn_process is not supported with a remote host")]
    SpawnWithRemote,

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl From<ConfigError> for LaunchError {
    fn from(error: ConfigError) -> Self {
        LaunchError::Config(error.to_string())
    }
}

/// Local process lifecycle errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{name} is already running with pid: {pid}")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("{name} prematurely exited with code: {code}")]
    PrematureExit { name: String, code: i32 },

    #[error("{name} returned: {code}")]
    ExitedWithError { name: String, code: i32 },

    #[error("failed to spawn {name}: {reason}")]
    SpawnFailed { name: String, reason: String },
}

impl From<ProcessError> for LaunchError {
    fn from(error: ProcessError) -> Self {
        LaunchError::Process(error.to_string())
    }
}

/// Remote channel and streaming errors
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("connection to {host} failed: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("channel closed before the call completed")]
    ChannelClosed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("remote agent reported: {0}")]
    Server(String),

    #[error("stream cancelled")]
    Cancelled,
}

impl From<RemoteError> for LaunchError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Cancelled => LaunchError::Cancelled,
            other => LaunchError::Remote(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err: LaunchError = ConfigError::MissingKey("gdb_executable".to_string()).into();
        assert_eq!(
            err.to_string(),
            "configuration error: missing configuration entry: gdb_executable"
        );
    }

    #[test]
    fn test_already_running_message() {
        let err = ProcessError::AlreadyRunning {
            name: "openocd".to_string(),
            pid: 4242,
        };
        assert_eq!(err.to_string(), "openocd is already running with pid: 4242");
    }

    #[test]
    fn test_remote_cancel_maps_to_cancelled() {
        let err: LaunchError = RemoteError::Cancelled.into();
        assert!(matches!(err, LaunchError::Cancelled));
    }
}
