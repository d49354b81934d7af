//! rollup-machine - Rollup 机器执行层
//!
//! 模块划分：
//! - **backend**: 机器后端抽象（CMIO 请求、fork、脚本化 Mock）
//! - **engine**: 单个请求的步进循环与完成状态分类
//! - **core**: 错误类型、双优先级锁、Inspect 并发限制、优雅关闭
//! - **machine**: 应用与执行参数、MachineInstance、MachineManager
//! - **repository**: 仓库接口与内存实现
//! - **advancer**: 推进未处理输入、保存结果、创建快照
//! - **service**: 刷新 / 推进主循环
//! - **http**: Inspect HTTP 端点（feature `web`）
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod advancer;
pub mod backend;
pub mod config;
pub mod core;
pub mod engine;
#[cfg(feature = "web")]
pub mod http;
pub mod machine;
pub mod observability;
pub mod repository;
pub mod service;

pub use crate::advancer::{Advancer, AdvancerOptions, SnapshotPolicy};
pub use crate::backend::{Backend, BackendError, BackendFactory, Hash};
pub use crate::config::{load_config, AppConfig};
pub use crate::core::{MachineError, ShutdownManager, ShutdownReason};
pub use crate::engine::{CompletionStatus, ExecutionFault};
pub use crate::machine::{
    AdvanceResult, Application, ExecutionParameters, InspectResult, LoadOptions, MachineInstance,
    MachineManager,
};
pub use crate::repository::{MemoryRepository, Repository, RepositoryError};
