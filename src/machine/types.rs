//! 应用、执行参数与请求结果

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::Hash;
use crate::core::MachineError;
use crate::engine::{CompletionStatus, ExecutionFault, PhaseLimits};

/// 每个应用的执行参数（周期增量 / 上限、各阶段超时、Inspect 并发数）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionParameters {
    pub advance_increment_cycles: u64,
    pub advance_max_cycles: u64,
    pub inspect_increment_cycles: u64,
    pub inspect_max_cycles: u64,
    pub advance_increment_deadline: Duration,
    pub advance_max_deadline: Duration,
    pub inspect_increment_deadline: Duration,
    pub inspect_max_deadline: Duration,
    pub load_deadline: Duration,
    pub store_deadline: Duration,
    /// 快速调用（哈希、fork、CMIO 收发、关闭）的超时
    pub fast_deadline: Duration,
    pub max_concurrent_inspects: u32,
}

impl Default for ExecutionParameters {
    fn default() -> Self {
        Self {
            advance_increment_cycles: 1 << 22,
            advance_max_cycles: 1 << 62,
            inspect_increment_cycles: 1 << 22,
            inspect_max_cycles: 1 << 62,
            advance_increment_deadline: Duration::from_secs(10),
            advance_max_deadline: Duration::from_secs(180),
            inspect_increment_deadline: Duration::from_secs(10),
            inspect_max_deadline: Duration::from_secs(180),
            load_deadline: Duration::from_secs(300),
            store_deadline: Duration::from_secs(180),
            fast_deadline: Duration::from_secs(5),
            max_concurrent_inspects: 10,
        }
    }
}

impl ExecutionParameters {
    /// 校验：并发数至少为 1，周期数与超时均不能为 0（Duration 本身不可能为负）
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.max_concurrent_inspects == 0 {
            return Err(MachineError::InvalidParameters(
                "max_concurrent_inspects must be at least 1".to_string(),
            ));
        }
        let cycles = [
            ("advance_increment_cycles", self.advance_increment_cycles),
            ("advance_max_cycles", self.advance_max_cycles),
            ("inspect_increment_cycles", self.inspect_increment_cycles),
            ("inspect_max_cycles", self.inspect_max_cycles),
        ];
        if let Some((name, _)) = cycles.iter().find(|(_, value)| *value == 0) {
            return Err(MachineError::InvalidParameters(format!("{name} must be positive")));
        }
        let deadlines = [
            ("advance_increment_deadline", self.advance_increment_deadline),
            ("advance_max_deadline", self.advance_max_deadline),
            ("inspect_increment_deadline", self.inspect_increment_deadline),
            ("inspect_max_deadline", self.inspect_max_deadline),
            ("load_deadline", self.load_deadline),
            ("store_deadline", self.store_deadline),
            ("fast_deadline", self.fast_deadline),
        ];
        if let Some((name, _)) = deadlines.iter().find(|(_, value)| value.is_zero()) {
            return Err(MachineError::InvalidParameters(format!("{name} must be positive")));
        }
        Ok(())
    }

    pub fn advance_limits(&self) -> PhaseLimits {
        PhaseLimits {
            increment_cycles: self.advance_increment_cycles,
            max_cycles: self.advance_max_cycles,
            increment_deadline: self.advance_increment_deadline,
            max_deadline: self.advance_max_deadline,
            fast_deadline: self.fast_deadline,
        }
    }

    pub fn inspect_limits(&self) -> PhaseLimits {
        PhaseLimits {
            increment_cycles: self.inspect_increment_cycles,
            max_cycles: self.inspect_max_cycles,
            increment_deadline: self.inspect_increment_deadline,
            max_deadline: self.inspect_max_deadline,
            fast_deadline: self.fast_deadline,
        }
    }
}

/// 一个 rollup 应用（外部持有，实例只保留不可变引用）
#[derive(Clone, Debug)]
pub struct Application {
    /// 唯一名称，作为机器池的键
    pub name: String,
    pub template_path: PathBuf,
    pub template_hash: Hash,
    /// 仓库中已处理的输入数
    pub processed_inputs: u64,
    pub enabled: bool,
    pub execution_parameters: ExecutionParameters,
}

impl Application {
    pub fn new(name: impl Into<String>, template_path: impl Into<PathBuf>, template_hash: Hash) -> Self {
        Self {
            name: name.into(),
            template_path: template_path.into(),
            template_hash,
            processed_inputs: 0,
            enabled: true,
            execution_parameters: ExecutionParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: ExecutionParameters) -> Self {
        self.execution_parameters = parameters;
        self
    }
}

/// Advance 结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvanceResult {
    pub input_index: u64,
    pub status: CompletionStatus,
    pub outputs: Vec<Vec<u8>>,
    pub reports: Vec<Vec<u8>>,
    pub outputs_hash: Hash,
    /// 接受时为新状态哈希，否则为原状态哈希
    pub machine_hash: Hash,
}

/// Inspect 结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectResult {
    /// fork 时实例已处理的输入数
    pub processed_inputs: u64,
    pub accepted: bool,
    pub status: CompletionStatus,
    pub reports: Vec<Vec<u8>>,
    /// 非致命的软错误（异常、停机、上限）
    pub error: Option<ExecutionFault>,
}

impl InspectResult {
    pub fn exception(&self) -> Option<&[u8]> {
        self.error.as_ref().and_then(ExecutionFault::exception_payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_are_valid() {
        assert!(ExecutionParameters::default().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let params = ExecutionParameters {
            max_concurrent_inspects: 0,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(MachineError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_zero_deadline_rejected() {
        let params = ExecutionParameters {
            store_deadline: Duration::ZERO,
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("store_deadline"));
    }

    #[test]
    fn test_phase_limits() {
        let params = ExecutionParameters {
            advance_max_cycles: 7,
            inspect_max_cycles: 9,
            ..Default::default()
        };
        assert_eq!(params.advance_limits().max_cycles, 7);
        assert_eq!(params.inspect_limits().max_cycles, 9);
        assert_eq!(params.inspect_limits().fast_deadline, params.fast_deadline);
    }
}
