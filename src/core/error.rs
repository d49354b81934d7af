//! 机器实例 / 管理器的调用错误
//!
//! 可分类的执行结果（Rejected、Exception、各类上限）不在这里，它们放在 AdvanceResult / InspectResult 中。
//! 这里只有硬错误：前置条件违反、后端失败、提交失败（实例致命）以及仓库错误。

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::{BackendError, Hash};
use crate::repository::RepositoryError;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("invalid input index: expected {expected}, got {got}")]
    InvalidInputIndex { expected: u64, got: u64 },

    #[error("invalid snapshot point: machine has processed {expected} inputs, requested {got}")]
    InvalidSnapshotPoint { expected: u64, got: u64 },

    #[error("machine is closed")]
    Closed,

    /// 提交阶段失败后实例不可再用，调用方应丢弃
    #[error("machine is broken and must be discarded")]
    Broken,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid execution parameters: {0}")]
    InvalidParameters(String),

    #[error("machine hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },

    #[error("machine loaded from {0} is not at a manual yield")]
    NotAtManualYield(PathBuf),

    #[error("expected {expected} processed inputs to replay, repository returned {actual}")]
    InputCountMismatch { expected: u64, actual: u64 },

    #[error("invalid outputs hash length {0}")]
    InvalidOutputsHash(usize),

    #[error("{op} failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },

    /// 替换 runtime 时关闭旧连接失败（实例致命）
    #[error("failed to commit fork: {0}")]
    Commit(#[source] BackendError),

    /// 主错误之后关闭 fork 也失败
    #[error("{primary} (closing fork also failed: {close})")]
    WithCloseFailure {
        primary: Box<MachineError>,
        close: BackendError,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl MachineError {
    pub(crate) fn backend(op: &'static str) -> impl FnOnce(BackendError) -> MachineError {
        move |source| MachineError::Backend { op, source }
    }

    /// 主错误附加 fork 关闭结果
    pub(crate) fn with_close(self, close: Result<(), BackendError>) -> MachineError {
        match close {
            Ok(()) => self,
            Err(close) => MachineError::WithCloseFailure {
                primary: Box::new(self),
                close,
            },
        }
    }

    /// 实例是否已不可用（调用方应丢弃）
    pub fn is_fatal(&self) -> bool {
        match self {
            MachineError::Commit(_) | MachineError::Broken => true,
            MachineError::WithCloseFailure { primary, .. } => primary.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_close_keeps_primary_on_success() {
        let err = MachineError::Closed.with_close(Ok(()));
        assert!(matches!(err, MachineError::Closed));
    }

    #[test]
    fn test_with_close_wraps_both_causes() {
        let err = MachineError::Backend {
            op: "fork",
            source: BackendError::MachineFailed,
        }
        .with_close(Err(BackendError::Closed));
        let message = err.to_string();
        assert!(message.contains("fork failed"));
        assert!(message.contains("closing fork also failed"));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(MachineError::Commit(BackendError::Closed).is_fatal());
        assert!(MachineError::Broken.is_fatal());
        assert!(!MachineError::Closed.is_fatal());
        assert!(!MachineError::InvalidInputIndex { expected: 1, got: 2 }.is_fatal());
    }
}
