//! 执行引擎：驱动一个 Backend 完成一次 Advance / Inspect 请求
//!
//! 流程：检查负载长度 → send_cmio_response → 步进循环（按增量 run，处理自动 yield）→ 手动 yield 时读取结果。
//! 硬错误（传输、超时、机器失败）作为 Err 返回；周期 / 时间 / 输出上限、异常、停机记入 Execution::fault。

pub mod status;

use std::time::{Duration, Instant};

use crate::backend::{
    AutomaticYield, Backend, BackendError, BreakReason, CmioRequest, ManualYield, RequestKind,
};

pub use status::{classify, CompletionStatus, ExecutionFault};

/// 单个请求允许的最大输出条数
pub const MAX_OUTPUTS: usize = 65_536;

/// 单个阶段（Advance / Inspect）的周期与时间限制
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseLimits {
    pub increment_cycles: u64,
    pub max_cycles: u64,
    /// 每次 run 调用的超时
    pub increment_deadline: Duration,
    /// 整个步进循环的墙钟上限
    pub max_deadline: Duration,
    /// 快速调用（读周期、收发 CMIO）的超时
    pub fast_deadline: Duration,
}

/// 一次请求的执行结果
#[derive(Debug, Default)]
pub struct Execution {
    pub accepted: bool,
    pub outputs: Vec<Vec<u8>>,
    pub reports: Vec<Vec<u8>>,
    /// 接受时的尾随数据（Advance 为 32 字节输出哈希）
    pub data: Vec<u8>,
    pub fault: Option<ExecutionFault>,
}

impl Execution {
    pub fn status(&self) -> CompletionStatus {
        classify(self.accepted, self.fault.as_ref())
    }
}

/// 在 backend 上执行一个请求
pub async fn process(
    backend: &dyn Backend,
    kind: RequestKind,
    payload: &[u8],
    limits: &PhaseLimits,
) -> Result<Execution, BackendError> {
    let mut execution = Execution::default();

    let max = backend.cmio_rx_buffer_size();
    if payload.len() > max {
        execution.fault = Some(ExecutionFault::PayloadLengthLimitExceeded {
            len: payload.len(),
            max,
        });
        return Ok(execution);
    }

    backend
        .send_cmio_response(kind, payload, limits.fast_deadline)
        .await?;

    if let Some(fault) = step_loop(backend, limits, &mut execution).await? {
        tracing::debug!(?kind, fault = %fault, "request aborted");
        execution.fault = Some(fault);
        return Ok(execution);
    }

    match backend.receive_cmio_request(limits.fast_deadline).await? {
        CmioRequest::Manual(ManualYield::Accepted(data)) => {
            execution.accepted = true;
            execution.data = data;
        }
        CmioRequest::Manual(ManualYield::Rejected(_)) => {}
        CmioRequest::Manual(ManualYield::Exception(data)) => {
            execution.fault = Some(ExecutionFault::Exception(data));
        }
        CmioRequest::Automatic(request) => {
            return Err(BackendError::UnexpectedRequest(format!(
                "{request:?} at manual yield"
            )));
        }
    }

    Ok(execution)
}

/// 步进直到手动 yield；返回 Some(fault) 表示请求被提前终止
async fn step_loop(
    backend: &dyn Backend,
    limits: &PhaseLimits,
    execution: &mut Execution,
) -> Result<Option<ExecutionFault>, BackendError> {
    let started = Instant::now();
    let start_cycle = backend.read_cycle(limits.fast_deadline).await?;
    let mut current = start_cycle;
    // 软 yield 期间运行的周期不计入预算
    let mut soft_cycles = 0u64;

    loop {
        let remaining = limits.max_deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(Some(ExecutionFault::TimeLimitExceeded));
        }

        let used = current
            .saturating_sub(start_cycle)
            .saturating_sub(soft_cycles);
        if used >= limits.max_cycles {
            return Ok(Some(ExecutionFault::CycleLimitExceeded));
        }
        let increment = limits.increment_cycles.min(limits.max_cycles - used);
        let target = current.saturating_add(increment);

        let run = backend.run(target, limits.increment_deadline);
        let reason = match tokio::time::timeout(remaining, run).await {
            Ok(reason) => reason?,
            Err(_) => return Ok(Some(ExecutionFault::TimeLimitExceeded)),
        };

        match reason {
            BreakReason::YieldedManually => return Ok(None),
            BreakReason::YieldedAutomatically => {
                match backend.receive_cmio_request(limits.fast_deadline).await? {
                    CmioRequest::Automatic(AutomaticYield::Progress(_)) => {}
                    CmioRequest::Automatic(AutomaticYield::Output(data)) => {
                        if execution.outputs.len() >= MAX_OUTPUTS {
                            return Ok(Some(ExecutionFault::OutputsLimitExceeded));
                        }
                        execution.outputs.push(data);
                    }
                    CmioRequest::Automatic(AutomaticYield::Report(data)) => {
                        execution.reports.push(data);
                    }
                    CmioRequest::Manual(request) => {
                        return Err(BackendError::UnexpectedRequest(format!(
                            "{request:?} at automatic yield"
                        )));
                    }
                }
            }
            BreakReason::YieldedSoftly | BreakReason::ReachedTargetMcycle => {}
            BreakReason::Halted => return Ok(Some(ExecutionFault::MachineHalted)),
            BreakReason::Failed => return Err(BackendError::MachineFailed),
        }

        let next = backend.read_cycle(limits.fast_deadline).await?;
        if reason == BreakReason::YieldedSoftly {
            soft_cycles += next.saturating_sub(current);
        }
        current = next;
    }
}
