//! 内存仓库（测试与本地运行）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::engine::CompletionStatus;
use crate::machine::{AdvanceResult, Application};
use crate::repository::{
    ApplicationFilter, Input, Repository, RepositoryError, SnapshotInfo,
};

struct AppRecord {
    application: Application,
    inputs: Vec<Input>,
    results: Vec<AdvanceResult>,
    snapshots: Vec<SnapshotInfo>,
}

/// 基于 RwLock<HashMap> 的仓库
#[derive(Default)]
pub struct MemoryRepository {
    apps: RwLock<HashMap<String, AppRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册（或替换）应用
    pub async fn add_application(&self, application: Application) {
        let record = AppRecord {
            application: application.clone(),
            inputs: Vec::new(),
            results: Vec::new(),
            snapshots: Vec::new(),
        };
        self.apps.write().await.insert(application.name, record);
    }

    pub async fn set_enabled(&self, app: &str, enabled: bool) -> Result<(), RepositoryError> {
        let mut apps = self.apps.write().await;
        let record = record_mut(&mut apps, app)?;
        record.application.enabled = enabled;
        Ok(())
    }

    pub async fn application(&self, app: &str) -> Option<Application> {
        self.apps
            .read()
            .await
            .get(app)
            .map(|record| record.application.clone())
    }

    /// 追加一条未处理输入，返回其 index
    pub async fn add_input(&self, app: &str, payload: impl Into<Vec<u8>>) -> Result<u64, RepositoryError> {
        let mut apps = self.apps.write().await;
        let record = record_mut(&mut apps, app)?;
        let index = record.inputs.len() as u64;
        record.inputs.push(Input {
            index,
            payload: payload.into(),
            status: None,
        });
        Ok(index)
    }

    /// 追加一条已处理输入（模拟之前运行留下的持久化状态）
    pub async fn add_processed_input(
        &self,
        app: &str,
        payload: impl Into<Vec<u8>>,
        status: CompletionStatus,
    ) -> Result<u64, RepositoryError> {
        let mut apps = self.apps.write().await;
        let record = record_mut(&mut apps, app)?;
        let index = record.inputs.len() as u64;
        if index != record.application.processed_inputs {
            return Err(RepositoryError::OutOfOrder {
                app: app.to_string(),
                index,
                next: record.application.processed_inputs,
            });
        }
        record.inputs.push(Input {
            index,
            payload: payload.into(),
            status: Some(status),
        });
        record.application.processed_inputs += 1;
        Ok(index)
    }

    /// 已存储的 Advance 结果
    pub async fn results(&self, app: &str) -> Vec<AdvanceResult> {
        self.apps
            .read()
            .await
            .get(app)
            .map(|record| record.results.clone())
            .unwrap_or_default()
    }
}

fn record_mut<'a>(
    apps: &'a mut HashMap<String, AppRecord>,
    app: &str,
) -> Result<&'a mut AppRecord, RepositoryError> {
    apps.get_mut(app)
        .ok_or_else(|| RepositoryError::ApplicationNotFound(app.to_string()))
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError> {
        let apps = self.apps.read().await;
        let mut list: Vec<Application> = apps
            .values()
            .map(|record| &record.application)
            .filter(|application| filter.matches(application))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn processed_inputs(&self, app: &str, from_index: u64) -> Result<Vec<Input>, RepositoryError> {
        let apps = self.apps.read().await;
        let record = apps
            .get(app)
            .ok_or_else(|| RepositoryError::ApplicationNotFound(app.to_string()))?;
        Ok(record
            .inputs
            .iter()
            .filter(|input| input.index >= from_index && input.status.is_some())
            .cloned()
            .collect())
    }

    async fn unprocessed_inputs(&self, app: &str) -> Result<Vec<Input>, RepositoryError> {
        let apps = self.apps.read().await;
        let record = apps
            .get(app)
            .ok_or_else(|| RepositoryError::ApplicationNotFound(app.to_string()))?;
        Ok(record
            .inputs
            .iter()
            .filter(|input| input.status.is_none())
            .cloned()
            .collect())
    }

    async fn store_advance_result(&self, app: &str, result: &AdvanceResult) -> Result<(), RepositoryError> {
        let mut apps = self.apps.write().await;
        let record = record_mut(&mut apps, app)?;
        let next = record.application.processed_inputs;
        if result.input_index != next {
            return Err(RepositoryError::OutOfOrder {
                app: app.to_string(),
                index: result.input_index,
                next,
            });
        }
        let input = record
            .inputs
            .get_mut(result.input_index as usize)
            .ok_or_else(|| RepositoryError::InputNotFound {
                app: app.to_string(),
                index: result.input_index,
            })?;
        input.status = Some(result.status);
        record.results.push(result.clone());
        record.application.processed_inputs += 1;
        Ok(())
    }

    async fn latest_snapshot(&self, app: &str) -> Result<Option<SnapshotInfo>, RepositoryError> {
        let apps = self.apps.read().await;
        let record = apps
            .get(app)
            .ok_or_else(|| RepositoryError::ApplicationNotFound(app.to_string()))?;
        Ok(record
            .snapshots
            .iter()
            .max_by_key(|snapshot| snapshot.processed_inputs)
            .cloned())
    }

    async fn store_snapshot(&self, app: &str, snapshot: SnapshotInfo) -> Result<(), RepositoryError> {
        let mut apps = self.apps.write().await;
        record_mut(&mut apps, app)?.snapshots.push(snapshot);
        Ok(())
    }
}
