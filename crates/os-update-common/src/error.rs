use std::io;

use thiserror::Error;

/// Errors surfaced by the update tool.
///
/// No kind is recovered internally; every error propagates to the subcommand
/// handler, which logs it and exits non-zero.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    BadArguments(String),
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("utility `{0}` is not in the allow-list")]
    UnknownUtility(String),
    #[error("`{name} {}` failed with status {status}: {output}", args.join(" "))]
    UtilityFailed {
        name: String,
        args: Vec<String>,
        output: String,
        status: i32,
    },
    #[error("partition {device} already carries UUID {uuid}")]
    DuplicateUuid { device: String, uuid: String },
    #[error("unable to determine the active partition")]
    ActiveNotFound,
    #[error("unable to determine a target partition")]
    TargetNotFound,
    #[error("no UKI matches the active partition")]
    NoMatchingUki,
    #[error("no previous UKI to roll back to")]
    NoPreviousUki,
    #[error("no boot UUID embedded in {0}")]
    UuidNotInUki(String),
    #[error("nothing to apply: no staged UKI")]
    NothingToApply,
    #[error("nothing to commit: no staged UKI")]
    NothingToCommit,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ToolError>;
