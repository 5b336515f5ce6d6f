use thiserror::Error;

/// Reason an apply/reverse attempt was abandoned.
///
/// Every variant is terminal for the attempt that produced it. `CodeBusy` is
/// the only one the apply loop retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    #[error("reference code does not match the running image")]
    NoMatch,

    #[error("reference data disagrees with the running image")]
    BadReferenceData,

    #[error("code to be replaced is in use")]
    CodeBusy,

    #[error("update is still referenced by another module")]
    ModuleBusy,

    #[error("out of memory")]
    OutOfMemory,

    #[error("failed to find a unique value for {0}")]
    FailedToFind(String),

    #[error("update has already been reversed")]
    AlreadyReversed,

    #[error("missing export {0}")]
    MissingExport(String),

    #[error("found a running task that cannot be inspected")]
    UnexpectedRunningTask,

    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl AbortCause {
    /// Name reported by the status interface.
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortCause::NoMatch => "no_match",
            AbortCause::BadReferenceData => "bad_system_map",
            AbortCause::CodeBusy => "code_busy",
            AbortCause::ModuleBusy => "module_busy",
            AbortCause::OutOfMemory => "out_of_memory",
            AbortCause::FailedToFind(_) => "failed_to_find",
            AbortCause::AlreadyReversed => "already_reversed",
            AbortCause::MissingExport(_) => "missing_export",
            AbortCause::UnexpectedRunningTask => "unexpected_running_task",
            AbortCause::Unexpected(_) => "unexpected",
        }
    }

    pub(crate) fn unexpected(reason: impl Into<String>) -> Self {
        AbortCause::Unexpected(reason.into())
    }
}

impl From<std::collections::TryReserveError> for AbortCause {
    fn from(_: std::collections::TryReserveError) -> Self {
        AbortCause::OutOfMemory
    }
}

/// Error types for reading and writing the live image
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Invalid size parameter")]
    InvalidSize,

    #[error("Memory not mapped at address 0x{0:X}")]
    NotMapped(u64),

    #[error("Memory region is read-only at address 0x{0:X}")]
    ReadOnly(u64),

    #[error("Memory protection change failed with errno {0}")]
    ProtectionChangeFailed(i32),

    #[error("Memory write verification failed at address 0x{0:X}")]
    VerificationFailed(u64),
}

impl From<MemoryError> for AbortCause {
    fn from(err: MemoryError) -> Self {
        AbortCause::Unexpected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(AbortCause::NoMatch.as_str(), "no_match");
        assert_eq!(AbortCause::CodeBusy.as_str(), "code_busy");
        assert_eq!(
            AbortCause::FailedToFind("foo".into()).as_str(),
            "failed_to_find"
        );
        assert_eq!(
            AbortCause::UnexpectedRunningTask.as_str(),
            "unexpected_running_task"
        );
    }

    #[test]
    fn test_memory_error_is_unexpected() {
        let cause: AbortCause = MemoryError::NotMapped(0x1000).into();
        assert_eq!(cause.as_str(), "unexpected");
        assert!(cause.to_string().contains("0x1000"));
    }
}
