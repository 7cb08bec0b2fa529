use thiserror::Error;

/// Crate-wide error taxonomy. Retryability is part of the contract:
/// `ConversionFailed` and `Provisioning` are retryable by re-running the
/// failed phase; `Config`, `NoCandidates` and `AdoptionUnsupported` need
/// operator intervention first.
#[derive(Error, Debug)]
pub enum ShiftError {
    /// Bad or missing input. Raised eagerly, before any command is built.
    #[error("configuration error: {0}")]
    Config(String),

    /// The destination cloud returned an empty flavor list.
    #[error("no flavor candidates available")]
    NoCandidates,

    /// The external conversion tool exited non-zero or hit its timeout
    /// (`exit_code` is `None` when the process was killed). Carries the raw
    /// diagnostic output so the failure surfaces verbatim.
    #[error("conversion failed (exit code {exit_code:?}): {stderr}")]
    ConversionFailed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The destination orchestration service cannot adopt resources.
    #[error("stack adoption unsupported: {0}")]
    AdoptionUnsupported(String),

    /// The destination API rejected a create or lookup call.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// Another worker holds the claim on this migration record.
    #[error("migration record locked: {0}")]
    RecordLocked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl From<serde_yml::Error> for ShiftError {
    fn from(err: serde_yml::Error) -> Self {
        ShiftError::Yaml(err.to_string())
    }
}

impl From<toml::de::Error> for ShiftError {
    fn from(err: toml::de::Error) -> Self {
        ShiftError::Config(err.to_string())
    }
}
