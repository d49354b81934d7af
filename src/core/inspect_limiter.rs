//! Inspect 并发限制
//!
//! 每个机器实例持有一个 Semaphore（许可数 = MaxConcurrentInspects）；获取许可时可被 CancellationToken 取消。
//! Close 时先 drain 全部许可（等待在途 Inspect 结束），再 close 信号量，后续 Inspect 立即失败。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::core::MachineError;

/// Inspect 并发限制器
#[derive(Debug)]
pub struct InspectLimiter {
    semaphore: Arc<Semaphore>,
    permits: u32,
}

impl InspectLimiter {
    pub fn new(max_concurrent_inspects: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_inspects as usize)),
            permits: max_concurrent_inspects,
        }
    }

    /// 获取一个 Inspect 许可；取消返回 Cancelled，已关闭返回 Closed
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, MachineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MachineError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| MachineError::Closed)
            }
        }
    }

    /// 取走全部许可（等待在途 Inspect 全部结束）；已关闭时返回 None
    pub async fn drain(&self) -> Option<SemaphorePermit<'_>> {
        self.semaphore.acquire_many(self.permits).await.ok()
    }

    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// 当前可用许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
