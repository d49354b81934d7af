//! 完成状态分类
//!
//! 引擎结果分两类：ExecutionFault（可分类的软结果，放进返回值）与 BackendError（硬错误，作为调用错误返回）。
//! CompletionStatus 是 Advance / Inspect 对 rollup 可见的封闭状态集合。

use serde::Serialize;
use thiserror::Error;

/// Advance / Inspect 的完成状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Accepted,
    Rejected,
    Exception,
    MachineHalted,
    OutputsLimitExceeded,
    CycleLimitExceeded,
    TimeLimitExceeded,
    PayloadLengthLimitExceeded,
}

impl CompletionStatus {
    pub fn is_accepted(self) -> bool {
        self == CompletionStatus::Accepted
    }
}

/// 可分类的执行结果（非调用错误）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFault {
    #[error("machine raised an exception")]
    Exception(Vec<u8>),

    #[error("machine halted")]
    MachineHalted,

    #[error("outputs limit exceeded")]
    OutputsLimitExceeded,

    #[error("cycle limit exceeded")]
    CycleLimitExceeded,

    #[error("time limit exceeded")]
    TimeLimitExceeded,

    #[error("payload length {len} exceeds limit {max}")]
    PayloadLengthLimitExceeded { len: usize, max: usize },
}

impl ExecutionFault {
    pub fn status(&self) -> CompletionStatus {
        match self {
            ExecutionFault::Exception(_) => CompletionStatus::Exception,
            ExecutionFault::MachineHalted => CompletionStatus::MachineHalted,
            ExecutionFault::OutputsLimitExceeded => CompletionStatus::OutputsLimitExceeded,
            ExecutionFault::CycleLimitExceeded => CompletionStatus::CycleLimitExceeded,
            ExecutionFault::TimeLimitExceeded => CompletionStatus::TimeLimitExceeded,
            ExecutionFault::PayloadLengthLimitExceeded { .. } => {
                CompletionStatus::PayloadLengthLimitExceeded
            }
        }
    }

    /// Exception 附带的负载
    pub fn exception_payload(&self) -> Option<&[u8]> {
        match self {
            ExecutionFault::Exception(payload) => Some(payload),
            _ => None,
        }
    }
}

/// 按 (accepted, fault) 分类；fault 优先
pub fn classify(accepted: bool, fault: Option<&ExecutionFault>) -> CompletionStatus {
    match fault {
        Some(fault) => fault.status(),
        None if accepted => CompletionStatus::Accepted,
        None => CompletionStatus::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_without_fault() {
        assert_eq!(classify(true, None), CompletionStatus::Accepted);
        assert_eq!(classify(false, None), CompletionStatus::Rejected);
    }

    #[test]
    fn test_fault_takes_precedence() {
        let fault = ExecutionFault::CycleLimitExceeded;
        assert_eq!(classify(true, Some(&fault)), CompletionStatus::CycleLimitExceeded);
    }

    #[test]
    fn test_every_fault_maps_to_its_status() {
        let cases = [
            (ExecutionFault::Exception(vec![1]), CompletionStatus::Exception),
            (ExecutionFault::MachineHalted, CompletionStatus::MachineHalted),
            (ExecutionFault::OutputsLimitExceeded, CompletionStatus::OutputsLimitExceeded),
            (ExecutionFault::CycleLimitExceeded, CompletionStatus::CycleLimitExceeded),
            (ExecutionFault::TimeLimitExceeded, CompletionStatus::TimeLimitExceeded),
            (
                ExecutionFault::PayloadLengthLimitExceeded { len: 2, max: 1 },
                CompletionStatus::PayloadLengthLimitExceeded,
            ),
        ];
        for (fault, status) in cases {
            assert_eq!(fault.status(), status);
        }
    }

    #[test]
    fn test_status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&CompletionStatus::PayloadLengthLimitExceeded).unwrap();
        assert_eq!(json, "\"PAYLOAD_LENGTH_LIMIT_EXCEEDED\"");
    }

    #[test]
    fn test_exception_payload() {
        let fault = ExecutionFault::Exception(b"boom".to_vec());
        assert_eq!(fault.exception_payload(), Some(&b"boom"[..]));
        assert_eq!(ExecutionFault::MachineHalted.exception_payload(), None);
    }
}
