//! 仓库抽象：应用配置、输入流、Advance 结果与快照记录
//!
//! 机器层只消费该接口；数据库实现在外部。MemoryRepository 为内存实现，供测试与本地运行使用。

pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::Hash;
use crate::engine::CompletionStatus;
use crate::machine::{AdvanceResult, Application};

pub use memory::MemoryRepository;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("input {index} not found for application {app}")]
    InputNotFound { app: String, index: u64 },

    #[error("input {index} of application {app} is out of order (next is {next})")]
    OutOfOrder { app: String, index: u64, next: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

/// 应用查询条件
#[derive(Clone, Debug, Default)]
pub struct ApplicationFilter {
    pub enabled: Option<bool>,
}

impl ApplicationFilter {
    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
        }
    }

    pub fn matches(&self, application: &Application) -> bool {
        self.enabled.map_or(true, |enabled| application.enabled == enabled)
    }
}

/// 一条输入；status 为 None 表示尚未处理
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Input {
    pub index: u64,
    pub payload: Vec<u8>,
    pub status: Option<CompletionStatus>,
}

/// 已保存的机器快照
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub processed_inputs: u64,
    /// 若已知，加载时校验
    pub machine_hash: Option<Hash>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError>;

    /// index >= from_index 的已处理输入，按 index 升序
    async fn processed_inputs(&self, app: &str, from_index: u64) -> Result<Vec<Input>, RepositoryError>;

    /// 未处理输入，按 index 升序
    async fn unprocessed_inputs(&self, app: &str) -> Result<Vec<Input>, RepositoryError>;

    /// 记录 Advance 结果：标记输入已处理并推进应用的 processed_inputs
    async fn store_advance_result(&self, app: &str, result: &AdvanceResult) -> Result<(), RepositoryError>;

    async fn latest_snapshot(&self, app: &str) -> Result<Option<SnapshotInfo>, RepositoryError>;

    async fn store_snapshot(&self, app: &str, snapshot: SnapshotInfo) -> Result<(), RepositoryError>;
}
