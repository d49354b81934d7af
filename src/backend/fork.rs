//! Fork 句柄：从当前机器克隆出的独占连接
//!
//! 只能以两种方式结束：commit（成为新的 runtime）或 discard（关闭服务进程）。
//! 两者都消耗 self，因此结束后无法再使用；若直接 Drop，则在后台尽力关闭进程。

use std::time::Duration;

use crate::backend::{Backend, BackendError};

pub struct Fork {
    backend: Option<Box<dyn Backend>>,
    shutdown_timeout: Duration,
}

impl Fork {
    pub fn new(backend: Box<dyn Backend>, shutdown_timeout: Duration) -> Self {
        Self {
            backend: Some(backend),
            shutdown_timeout,
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        match &self.backend {
            Some(backend) => backend.as_ref(),
            // commit / discard 都消耗 self，Drop 之前 backend 总是存在
            None => unreachable!("fork used after commit or discard"),
        }
    }

    /// 交出连接所有权（成为新的 runtime）
    pub fn commit(mut self) -> Box<dyn Backend> {
        match self.backend.take() {
            Some(backend) => backend,
            None => unreachable!("fork committed twice"),
        }
    }

    /// 关闭 fork 的服务进程并释放本地句柄
    pub async fn discard(mut self) -> Result<(), BackendError> {
        match self.backend.take() {
            Some(backend) => backend.shutdown_server(self.shutdown_timeout).await,
            None => Ok(()),
        }
    }
}

impl Drop for Fork {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let timeout = self.shutdown_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Fork dropped without commit or discard, shutting it down");
                handle.spawn(async move {
                    if let Err(e) = backend.shutdown_server(timeout).await {
                        tracing::warn!("Failed to shut down dropped fork: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("Fork dropped outside of a runtime, server left running");
            }
        }
    }
}
