//! 推进器：把仓库中未处理的输入交给对应实例，保存结果并按策略创建快照

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::MachineError;
use crate::machine::{MachineInstance, MachineManager};
use crate::repository::{Repository, SnapshotInfo};

/// 快照策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    #[default]
    None,
    EachInput,
    /// 每处理 n 个输入一次
    EveryN(u64),
}

impl SnapshotPolicy {
    pub fn should_snapshot(&self, processed_inputs: u64) -> bool {
        match self {
            SnapshotPolicy::None => false,
            SnapshotPolicy::EachInput => true,
            SnapshotPolicy::EveryN(0) => false,
            SnapshotPolicy::EveryN(n) => processed_inputs % n == 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdvancerOptions {
    pub snapshot_policy: SnapshotPolicy,
    /// 快照写到 snapshot_dir/<app>/<processed_inputs>
    pub snapshot_dir: PathBuf,
}

impl Default for AdvancerOptions {
    fn default() -> Self {
        Self {
            snapshot_policy: SnapshotPolicy::None,
            snapshot_dir: PathBuf::from("./snapshots"),
        }
    }
}

pub struct Advancer {
    manager: Arc<MachineManager>,
    repository: Arc<dyn Repository>,
    options: AdvancerOptions,
}

impl Advancer {
    pub fn new(
        manager: Arc<MachineManager>,
        repository: Arc<dyn Repository>,
        options: AdvancerOptions,
    ) -> Self {
        Self {
            manager,
            repository,
            options,
        }
    }

    /// 处理所有托管应用的未处理输入，返回本轮推进的输入数
    pub async fn step(&self, cancel: &CancellationToken) -> Result<usize, MachineError> {
        let mut advanced = 0;
        for name in self.manager.applications().await {
            if cancel.is_cancelled() {
                return Err(MachineError::Cancelled);
            }
            let Some(machine) = self.manager.get_machine(&name).await else {
                continue;
            };
            match self.advance_application(cancel, &name, &machine).await {
                Ok(count) => advanced += count,
                Err(MachineError::Cancelled) => return Err(MachineError::Cancelled),
                Err(e) if e.is_fatal() => {
                    error!(app = %name, "Machine is broken, removing it: {}", e);
                    if let Err(close) = self.manager.remove_machine(&name).await {
                        warn!(app = %name, "Failed to close broken machine: {}", close);
                    }
                }
                Err(e) => error!(app = %name, "Failed to advance application: {}", e),
            }
        }
        if advanced > 0 {
            debug!(advanced, "Advancer step finished");
        }
        Ok(advanced)
    }

    async fn advance_application(
        &self,
        cancel: &CancellationToken,
        name: &str,
        machine: &MachineInstance,
    ) -> Result<usize, MachineError> {
        let inputs = self.repository.unprocessed_inputs(name).await?;
        let mut advanced = 0;
        for input in inputs {
            if cancel.is_cancelled() {
                return Err(MachineError::Cancelled);
            }
            let result = machine.advance(cancel, &input.payload, input.index).await?;
            if let Err(e) = self.repository.store_advance_result(name, &result).await {
                // 机器已越过该输入而仓库没有记录；移除后由下一次刷新重新加载并同步
                warn!(app = %name, index = input.index, "Result not stored, dropping machine");
                if let Err(close) = self.manager.remove_machine(name).await {
                    warn!(app = %name, "Failed to close machine: {}", close);
                }
                return Err(e.into());
            }
            advanced += 1;

            let processed_inputs = input.index + 1;
            if self.options.snapshot_policy.should_snapshot(processed_inputs) {
                let snapshot = SnapshotInfo {
                    path: self
                        .options
                        .snapshot_dir
                        .join(name)
                        .join(processed_inputs.to_string()),
                    processed_inputs,
                    machine_hash: Some(result.machine_hash),
                };
                if let Err(e) = self.snapshot(cancel, name, machine, snapshot).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(app = %name, processed_inputs, "Failed to create snapshot: {}", e);
                }
            }
        }
        Ok(advanced)
    }

    async fn snapshot(
        &self,
        cancel: &CancellationToken,
        name: &str,
        machine: &MachineInstance,
        snapshot: SnapshotInfo,
    ) -> Result<(), MachineError> {
        machine
            .create_snapshot(cancel, snapshot.processed_inputs, &snapshot.path)
            .await?;
        info!(
            app = %name,
            processed_inputs = snapshot.processed_inputs,
            "Snapshot recorded"
        );
        self.repository.store_snapshot(name, snapshot).await?;
        Ok(())
    }
}
