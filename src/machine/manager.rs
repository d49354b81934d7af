//! 机器池：按应用名维护 MachineInstance
//!
//! update_machines 与仓库中启用的应用对齐：为新应用加载并同步实例，移除已停用应用与已损坏实例。
//! 被移出的实例在写锁内从表中删除，关闭在释放写锁之后进行。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::BackendFactory;
use crate::core::MachineError;
use crate::machine::{Application, LoadOptions, MachineInstance};
use crate::repository::{ApplicationFilter, Repository};

pub struct MachineManager {
    repository: Arc<dyn Repository>,
    factory: Arc<dyn BackendFactory>,
    options: LoadOptions,
    machines: RwLock<HashMap<String, Arc<MachineInstance>>>,
    /// 串行化 update_machines
    update_lock: Mutex<()>,
}

impl MachineManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        factory: Arc<dyn BackendFactory>,
        options: LoadOptions,
    ) -> Self {
        Self {
            repository,
            factory,
            options,
            machines: RwLock::new(HashMap::new()),
            update_lock: Mutex::new(()),
        }
    }

    /// 与仓库中的启用应用对齐；单个应用失败只记录日志
    pub async fn update_machines(&self, cancel: &CancellationToken) -> Result<(), MachineError> {
        let _update = self.update_lock.lock().await;
        let applications = self
            .repository
            .list_applications(&ApplicationFilter::enabled())
            .await?;
        let enabled: HashSet<String> = applications.iter().map(|app| app.name.clone()).collect();

        let broken = self.evict(|_, machine| machine.is_broken()).await;
        for machine in &broken {
            warn!(app = %machine.application().name, "Dropping broken machine");
        }
        close_all(broken).await;

        for application in applications {
            if cancel.is_cancelled() {
                return Err(MachineError::Cancelled);
            }
            if self.has_machine(&application.name).await {
                continue;
            }
            let name = application.name.clone();
            match self.create_machine(cancel, application).await {
                Ok(machine) => {
                    info!(app = %name, "Machine created");
                    self.machines.write().await.insert(name, Arc::new(machine));
                }
                Err(e) => error!(app = %name, "Failed to create machine: {}", e),
            }
        }

        let stale = self.evict(|name, _| !enabled.contains(name)).await;
        for machine in &stale {
            info!(app = %machine.application().name, "Application disabled, removing machine");
        }
        close_all(stale).await;
        Ok(())
    }

    async fn create_machine(
        &self,
        cancel: &CancellationToken,
        application: Application,
    ) -> Result<MachineInstance, MachineError> {
        let application = Arc::new(application);
        let snapshot = self.repository.latest_snapshot(&application.name).await?;
        let machine = MachineInstance::load(
            application,
            snapshot.as_ref(),
            self.factory.as_ref(),
            &self.options,
        )
        .await?;

        if let Err(e) = machine.synchronize(cancel, self.repository.as_ref()).await {
            if let Err(close) = machine.close().await {
                warn!(
                    app = %machine.application().name,
                    "Failed to close unsynchronized machine: {}", close
                );
            }
            return Err(e);
        }
        Ok(machine)
    }

    /// 在写锁内移出满足条件的实例
    async fn evict<F>(&self, predicate: F) -> Vec<Arc<MachineInstance>>
    where
        F: Fn(&str, &MachineInstance) -> bool,
    {
        let mut machines = self.machines.write().await;
        let names: Vec<String> = machines
            .iter()
            .filter(|(name, machine)| predicate(name.as_str(), machine.as_ref()))
            .map(|(name, _)| name.clone())
            .collect();
        names
            .iter()
            .filter_map(|name| machines.remove(name))
            .collect()
    }

    pub async fn get_machine(&self, name: &str) -> Option<Arc<MachineInstance>> {
        self.machines.read().await.get(name).cloned()
    }

    pub async fn has_machine(&self, name: &str) -> bool {
        self.machines.read().await.contains_key(name)
    }

    /// 当前托管的应用名（排序）
    pub async fn applications(&self) -> Vec<String> {
        let mut names: Vec<String> = self.machines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.machines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.machines.read().await.is_empty()
    }

    /// 移除并关闭一个实例；返回是否存在
    pub async fn remove_machine(&self, name: &str) -> Result<bool, MachineError> {
        let removed = self.machines.write().await.remove(name);
        match removed {
            Some(machine) => {
                machine.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 关闭全部实例
    pub async fn close(&self) -> Result<(), MachineError> {
        let machines: Vec<Arc<MachineInstance>> = {
            let mut machines = self.machines.write().await;
            machines.drain().map(|(_, machine)| machine).collect()
        };
        info!(count = machines.len(), "Closing all machines");

        let results = join_all(machines.iter().map(|machine| machine.close())).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}

async fn close_all(machines: Vec<Arc<MachineInstance>>) {
    let results = join_all(machines.iter().map(|machine| machine.close())).await;
    for (machine, result) in machines.iter().zip(results) {
        if let Err(e) = result {
            warn!(app = %machine.application().name, "Failed to close machine: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::template_hash;
    use crate::backend::{Hash, MockFactory};
    use crate::repository::MemoryRepository;

    struct Fixture {
        repo: Arc<MemoryRepository>,
        factory: Arc<MockFactory>,
        manager: MachineManager,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let repo = Arc::new(MemoryRepository::new());
            let factory = Arc::new(MockFactory::default());
            let manager = MachineManager::new(repo.clone(), factory.clone(), LoadOptions::default());
            Self {
                repo,
                factory,
                manager,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        async fn add_app(&self, name: &str) {
            let path = self.dir.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            self.repo
                .add_application(Application::new(name, &path, template_hash(&path)))
                .await;
        }
    }

    #[tokio::test]
    async fn test_update_tracks_enabled_applications() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        for name in ["a", "b", "c"] {
            fixture.add_app(name).await;
        }

        assert_eq!(fixture.manager.len().await, 0);
        fixture.manager.update_machines(&cancel).await.unwrap();
        assert_eq!(fixture.manager.len().await, 3);
        assert_eq!(fixture.manager.applications().await, vec!["a", "b", "c"]);

        fixture.repo.set_enabled("b", false).await.unwrap();
        fixture.manager.update_machines(&cancel).await.unwrap();
        assert_eq!(fixture.manager.len().await, 2);
        assert!(!fixture.manager.has_machine("b").await);
        assert_eq!(fixture.factory.stats().shutdowns(), 1);

        // 再次刷新不重复关闭
        fixture.manager.update_machines(&cancel).await.unwrap();
        assert_eq!(fixture.factory.stats().shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_failed_application_is_skipped() {
        let fixture = Fixture::new();
        fixture.add_app("good").await;
        let path = fixture.dir.path().join("bad");
        std::fs::create_dir_all(&path).unwrap();
        fixture
            .repo
            .add_application(Application::new("bad", &path, Hash([9; 32])))
            .await;

        fixture
            .manager
            .update_machines(&CancellationToken::new())
            .await
            .unwrap();
        assert!(fixture.manager.has_machine("good").await);
        assert!(!fixture.manager.has_machine("bad").await);
    }

    #[tokio::test]
    async fn test_new_machine_is_synchronized() {
        let fixture = Fixture::new();
        fixture.add_app("a").await;
        for payload in [b"x", b"y"] {
            fixture
                .repo
                .add_processed_input("a", payload.to_vec(), crate::engine::CompletionStatus::Accepted)
                .await
                .unwrap();
        }

        fixture
            .manager
            .update_machines(&CancellationToken::new())
            .await
            .unwrap();
        let machine = fixture.manager.get_machine("a").await.unwrap();
        assert_eq!(machine.processed_inputs().await, 2);
    }

    #[tokio::test]
    async fn test_broken_machine_is_recreated() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        fixture.add_app("a").await;
        fixture.manager.update_machines(&cancel).await.unwrap();
        let first = fixture.manager.get_machine("a").await.unwrap();

        fixture.factory.fail_shutdowns(true);
        assert!(first.advance(&cancel, b"in", 0).await.unwrap_err().is_fatal());
        fixture.factory.fail_shutdowns(false);

        fixture.manager.update_machines(&cancel).await.unwrap();
        let second = fixture.manager.get_machine("a").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_broken());
    }

    #[tokio::test]
    async fn test_remove_and_close() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        fixture.add_app("a").await;
        fixture.add_app("b").await;
        fixture.manager.update_machines(&cancel).await.unwrap();

        assert!(fixture.manager.remove_machine("a").await.unwrap());
        assert!(!fixture.manager.remove_machine("a").await.unwrap());
        assert_eq!(fixture.factory.stats().shutdowns(), 1);

        fixture.manager.close().await.unwrap();
        assert!(fixture.manager.is_empty().await);
        assert_eq!(fixture.factory.stats().shutdowns(), 2);
    }
}
