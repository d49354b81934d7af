//! 机器实例：一个应用的已加载机器及其并发协调
//!
//! - Advance 由 advance_lock 串行化，在 fork 上执行，接受后替换 runtime
//! - Inspect 受 InspectLimiter 限制并发，在 fork 上执行后总是丢弃
//! - runtime 只在高优先级锁下被替换（Advance 提交与 Close）；Inspect 只以低优先级短暂持锁做 fork

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, BackendFactory, CmioRequest, Fork, Hash, ManualYield, RequestKind,
    RuntimeConfig,
};
use crate::core::{InspectLimiter, MachineError, PriorityMutex};
use crate::engine::{self, CompletionStatus, Execution};
use crate::machine::{AdvanceResult, Application, ExecutionParameters, InspectResult};
use crate::repository::{Repository, SnapshotInfo};

/// 加载选项
#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub runtime: RuntimeConfig,
    /// 校验加载后的根哈希与模板 / 快照记录一致
    pub check_hash: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            check_hash: true,
        }
    }
}

struct Runtime {
    /// None 表示已关闭
    backend: Option<Box<dyn Backend>>,
    processed_inputs: u64,
}

/// Advance 在 fork 上解析出的结果（尚未提交）
struct Resolved {
    execution: Execution,
    status: CompletionStatus,
    outputs_hash: Hash,
    machine_hash: Hash,
}

pub struct MachineInstance {
    application: Arc<Application>,
    params: ExecutionParameters,
    runtime: PriorityMutex<Runtime>,
    advance_lock: Mutex<()>,
    inspects: InspectLimiter,
    broken: AtomicBool,
}

impl MachineInstance {
    /// 用一个已加载、处于手动 yield 的 backend 创建实例
    pub fn new(
        application: Arc<Application>,
        backend: Box<dyn Backend>,
        processed_inputs: u64,
    ) -> Result<Self, MachineError> {
        let params = application.execution_parameters.clone();
        params.validate()?;
        Ok(Self {
            inspects: InspectLimiter::new(params.max_concurrent_inspects),
            runtime: PriorityMutex::new(Runtime {
                backend: Some(backend),
                processed_inputs,
            }),
            advance_lock: Mutex::new(()),
            broken: AtomicBool::new(false),
            params,
            application,
        })
    }

    /// 从快照（若有）或应用模板加载实例
    pub async fn load(
        application: Arc<Application>,
        snapshot: Option<&SnapshotInfo>,
        factory: &dyn BackendFactory,
        options: &LoadOptions,
    ) -> Result<Self, MachineError> {
        application.execution_parameters.validate()?;
        let (dir, processed_inputs, expected) = match snapshot {
            Some(snapshot) => (
                snapshot.path.as_path(),
                snapshot.processed_inputs,
                snapshot.machine_hash,
            ),
            None => (
                application.template_path.as_path(),
                0,
                Some(application.template_hash),
            ),
        };
        info!(
            app = %application.name,
            dir = %dir.display(),
            processed_inputs,
            "Loading machine"
        );

        let params = &application.execution_parameters;
        let backend = factory
            .create(params.load_deadline)
            .await
            .map_err(MachineError::backend("create"))?;
        if let Err(e) = prepare(backend.as_ref(), dir, expected, params, options).await {
            let close = backend.shutdown_server(params.fast_deadline).await;
            return Err(e.with_close(close));
        }

        Self::new(application, backend, processed_inputs)
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    pub async fn processed_inputs(&self) -> u64 {
        self.runtime.lock_low().await.processed_inputs
    }

    /// 提交失败后实例不可再用
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// 对第 index 个输入执行 Advance
    pub async fn advance(
        &self,
        cancel: &CancellationToken,
        input: &[u8],
        index: u64,
    ) -> Result<AdvanceResult, MachineError> {
        let _advance = self.lock_advance(cancel).await?;
        self.ensure_usable()?;

        let fork = {
            let runtime = self.runtime.lock_high().await;
            let backend = runtime.backend.as_deref().ok_or(MachineError::Closed)?;
            if index != runtime.processed_inputs {
                return Err(MachineError::InvalidInputIndex {
                    expected: runtime.processed_inputs,
                    got: index,
                });
            }
            self.fork(backend).await?
        };

        let resolved = match self.resolve_advance(&fork, input).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let close = fork.discard().await;
                return Err(e.with_close(close));
            }
        };

        let Resolved {
            execution,
            status,
            outputs_hash,
            machine_hash,
        } = resolved;
        if status == CompletionStatus::Accepted {
            self.commit(fork).await?;
        } else {
            if let Err(e) = fork.discard().await {
                warn!(app = %self.application.name, index, "Failed to discard fork: {}", e);
            }
            self.runtime.lock_high().await.processed_inputs += 1;
        }

        info!(app = %self.application.name, index, status = ?status, "Input advanced");
        Ok(AdvanceResult {
            input_index: index,
            status,
            outputs: if status.is_accepted() {
                execution.outputs
            } else {
                Vec::new()
            },
            reports: execution.reports,
            outputs_hash,
            machine_hash,
        })
    }

    /// 在 fork 上执行 Advance 并读出哈希；接受时返回 fork 的新哈希，否则返回原哈希
    async fn resolve_advance(&self, fork: &Fork, input: &[u8]) -> Result<Resolved, MachineError> {
        let backend = fork.backend();
        let fast = self.params.fast_deadline;

        let pre_machine_hash = backend
            .root_hash(fast)
            .await
            .map_err(MachineError::backend("root_hash"))?;
        let pre_outputs_hash = match backend
            .receive_cmio_request(fast)
            .await
            .map_err(MachineError::backend("receive_cmio_request"))?
        {
            CmioRequest::Manual(ManualYield::Accepted(data)) => parse_outputs_hash(&data)?,
            // 上一次请求未被接受：输出哈希沿用零值
            CmioRequest::Manual(_) => Hash::default(),
            CmioRequest::Automatic(request) => {
                return Err(MachineError::Backend {
                    op: "receive_cmio_request",
                    source: BackendError::UnexpectedRequest(format!(
                        "{request:?} before advance"
                    )),
                })
            }
        };

        let execution = engine::process(
            backend,
            RequestKind::Advance,
            input,
            &self.params.advance_limits(),
        )
        .await
        .map_err(MachineError::backend("advance"))?;
        let status = execution.status();

        if !status.is_accepted() {
            return Ok(Resolved {
                execution,
                status,
                outputs_hash: pre_outputs_hash,
                machine_hash: pre_machine_hash,
            });
        }

        let outputs_hash = parse_outputs_hash(&execution.data)?;
        let machine_hash = backend
            .root_hash(fast)
            .await
            .map_err(MachineError::backend("root_hash"))?;
        Ok(Resolved {
            execution,
            status,
            outputs_hash,
            machine_hash,
        })
    }

    /// 关闭旧 runtime 并以 fork 替换；关闭失败时实例损坏
    async fn commit(&self, fork: Fork) -> Result<(), MachineError> {
        let mut runtime = self.runtime.lock_high().await;
        if let Some(old) = runtime.backend.as_deref() {
            if let Err(e) = old.shutdown_server(self.params.fast_deadline).await {
                self.broken.store(true, Ordering::SeqCst);
                warn!(app = %self.application.name, "Commit failed, machine is broken: {}", e);
                if let Err(close) = fork.discard().await {
                    warn!(app = %self.application.name, "Failed to discard fork: {}", close);
                }
                return Err(MachineError::Commit(e));
            }
        }
        runtime.backend = Some(fork.commit());
        runtime.processed_inputs += 1;
        Ok(())
    }

    /// 只读查询；不改变实例状态
    pub async fn inspect(
        &self,
        cancel: &CancellationToken,
        query: &[u8],
    ) -> Result<InspectResult, MachineError> {
        let _permit = self.inspects.acquire(cancel).await?;
        self.ensure_usable()?;

        let (fork, processed_inputs) = {
            let runtime = self.runtime.lock_low().await;
            let backend = runtime.backend.as_deref().ok_or(MachineError::Closed)?;
            (self.fork(backend).await?, runtime.processed_inputs)
        };

        let execution = engine::process(
            fork.backend(),
            RequestKind::Inspect,
            query,
            &self.params.inspect_limits(),
        )
        .await;
        let close = fork.discard().await;

        let execution = match execution {
            Ok(execution) => execution,
            Err(e) => return Err(MachineError::backend("inspect")(e).with_close(close)),
        };
        close.map_err(MachineError::backend("discard"))?;

        let status = execution.status();
        debug!(
            app = %self.application.name,
            processed_inputs,
            status = ?status,
            reports = execution.reports.len(),
            "Inspect finished"
        );
        Ok(InspectResult {
            processed_inputs,
            accepted: execution.accepted,
            status,
            reports: execution.reports,
            error: execution.fault,
        })
    }

    /// 把当前机器状态存到 path；processed_inputs 必须与实例一致
    pub async fn create_snapshot(
        &self,
        cancel: &CancellationToken,
        processed_inputs: u64,
        path: &Path,
    ) -> Result<(), MachineError> {
        let _advance = self.lock_advance(cancel).await?;
        self.ensure_usable()?;

        let runtime = self.runtime.lock_low().await;
        let backend = runtime.backend.as_deref().ok_or(MachineError::Closed)?;
        if processed_inputs != runtime.processed_inputs {
            return Err(MachineError::InvalidSnapshotPoint {
                expected: runtime.processed_inputs,
                got: processed_inputs,
            });
        }
        backend
            .store(path, self.params.store_deadline)
            .await
            .map_err(MachineError::backend("store"))?;

        info!(
            app = %self.application.name,
            processed_inputs,
            path = %path.display(),
            "Snapshot created"
        );
        Ok(())
    }

    /// 重放仓库中已处理但本实例尚未处理的输入
    pub async fn synchronize(
        &self,
        cancel: &CancellationToken,
        repository: &dyn Repository,
    ) -> Result<(), MachineError> {
        let name = &self.application.name;
        let from = self.processed_inputs().await;
        let expected = self.application.processed_inputs.checked_sub(from).ok_or(
            MachineError::InputCountMismatch {
                expected: self.application.processed_inputs,
                actual: from,
            },
        )?;

        let inputs = repository.processed_inputs(name, from).await?;
        if inputs.len() as u64 != expected {
            return Err(MachineError::InputCountMismatch {
                expected,
                actual: inputs.len() as u64,
            });
        }
        if expected > 0 {
            info!(app = %name, from, count = expected, "Synchronizing machine");
        }

        for input in inputs {
            let result = self.advance(cancel, &input.payload, input.index).await?;
            if let Some(stored) = input.status {
                if stored != result.status {
                    warn!(
                        app = %name,
                        index = input.index,
                        stored = ?stored,
                        replayed = ?result.status,
                        "Replayed status differs from stored status"
                    );
                }
            }
        }
        Ok(())
    }

    /// 关闭实例；等待在途 Advance / Inspect 结束。可重复调用
    pub async fn close(&self) -> Result<(), MachineError> {
        let _advance = self.advance_lock.lock().await;
        let Some(_drained) = self.inspects.drain().await else {
            return Ok(());
        };

        let backend = {
            let mut runtime = self.runtime.lock_high().await;
            runtime.backend.take()
        };
        self.inspects.close();

        if let Some(backend) = backend {
            backend
                .shutdown_server(self.params.fast_deadline)
                .await
                .map_err(MachineError::backend("shutdown"))?;
        }
        info!(app = %self.application.name, "Machine closed");
        Ok(())
    }

    async fn lock_advance(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>, MachineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MachineError::Cancelled),
            guard = self.advance_lock.lock() => Ok(guard),
        }
    }

    fn ensure_usable(&self) -> Result<(), MachineError> {
        if self.is_broken() {
            Err(MachineError::Broken)
        } else {
            Ok(())
        }
    }

    async fn fork(&self, backend: &dyn Backend) -> Result<Fork, MachineError> {
        let forked = backend
            .fork_server(self.params.fast_deadline)
            .await
            .map_err(MachineError::backend("fork"))?;
        debug!(
            app = %self.application.name,
            address = %forked.address,
            pid = forked.pid,
            "Forked machine"
        );
        Ok(Fork::new(forked.backend, self.params.fast_deadline))
    }
}

fn parse_outputs_hash(data: &[u8]) -> Result<Hash, MachineError> {
    Hash::try_from(data).map_err(MachineError::InvalidOutputsHash)
}

/// 加载目录并校验加载结果
async fn prepare(
    backend: &dyn Backend,
    dir: &Path,
    expected: Option<Hash>,
    params: &ExecutionParameters,
    options: &LoadOptions,
) -> Result<(), MachineError> {
    backend
        .load(dir, &options.runtime, params.load_deadline)
        .await
        .map_err(MachineError::backend("load"))?;

    if let (true, Some(expected)) = (options.check_hash, expected) {
        let actual = backend
            .root_hash(params.fast_deadline)
            .await
            .map_err(MachineError::backend("root_hash"))?;
        if actual != expected {
            return Err(MachineError::HashMismatch { expected, actual });
        }
    }

    let ready = backend
        .is_at_manual_yield(params.fast_deadline)
        .await
        .map_err(MachineError::backend("is_at_manual_yield"))?;
    if !ready {
        return Err(MachineError::NotAtManualYield(dir.to_path_buf()));
    }
    Ok(())
}
