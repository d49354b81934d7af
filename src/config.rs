//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ROLLUP__*` 覆盖（双下划线表示嵌套，如 `ROLLUP__HTTP__ADDRESS=0.0.0.0:10012`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::advancer::{AdvancerOptions, SnapshotPolicy};
use crate::backend::RuntimeConfig;
use crate::machine::LoadOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogSection,
    pub manager: ManagerSection,
    pub machine: MachineSection,
    pub advancer: AdvancerSection,
    pub http: HttpSection,
}

/// [log] 段：默认日志级别（RUST_LOG 优先）
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// [manager] 段：刷新周期、加载时的哈希校验
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    /// update_machines + 推进一轮的间隔（毫秒）
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_true")]
    pub check_template_hash: bool,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            check_template_hash: true,
        }
    }
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// [machine] 段：传给后端 load 的运行时配置
#[derive(Debug, Clone, Deserialize)]
pub struct MachineSection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub skip_root_hash_check: bool,
    #[serde(default)]
    pub skip_version_check: bool,
}

impl Default for MachineSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            skip_root_hash_check: false,
            skip_version_check: false,
        }
    }
}

/// 快照策略名（配置文件里的写法）
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    #[default]
    None,
    EachInput,
    EveryN,
}

/// [advancer] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AdvancerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub snapshot_policy: SnapshotMode,
    /// snapshot_policy = every_n 时的间隔
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
}

impl Default for AdvancerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_policy: SnapshotMode::None,
            snapshot_interval: default_snapshot_interval(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

fn default_snapshot_interval() -> u64 {
    100
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./snapshots")
}

/// [http] 段：Inspect 端点监听地址（feature web）
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_address")]
    pub address: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            address: default_http_address(),
        }
    }
}

fn default_http_address() -> String {
    "127.0.0.1:10012".to_string()
}

impl AppConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.manager.refresh_interval_ms.max(1))
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            log_level: self.machine.log_level.clone(),
            skip_root_hash_check: self.machine.skip_root_hash_check,
            skip_version_check: self.machine.skip_version_check,
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            runtime: self.runtime_config(),
            check_hash: self.manager.check_template_hash,
        }
    }

    pub fn advancer_options(&self) -> AdvancerOptions {
        let snapshot_policy = match self.advancer.snapshot_policy {
            SnapshotMode::None => SnapshotPolicy::None,
            SnapshotMode::EachInput => SnapshotPolicy::EachInput,
            SnapshotMode::EveryN => SnapshotPolicy::EveryN(self.advancer.snapshot_interval),
        };
        AdvancerOptions {
            snapshot_policy,
            snapshot_dir: self.advancer.snapshot_dir.clone(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ROLLUP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ROLLUP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ROLLUP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
        assert!(config.load_options().check_hash);
        assert!(config.advancer.enabled);
        assert_eq!(config.advancer_options().snapshot_policy, SnapshotPolicy::None);
        assert_eq!(config.http.address, "127.0.0.1:10012");
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            r#"
[manager]
refresh_interval_ms = 250
check_template_hash = false

[machine]
log_level = "debug"
skip_version_check = true

[advancer]
snapshot_policy = "every_n"
snapshot_interval = 7
snapshot_dir = "/var/lib/rollup/snapshots"
"#,
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_millis(250));
        assert!(!config.load_options().check_hash);

        let runtime = config.runtime_config();
        assert_eq!(runtime.log_level, "debug");
        assert!(runtime.skip_version_check);
        assert!(!runtime.skip_root_hash_check);

        let options = config.advancer_options();
        assert_eq!(options.snapshot_policy, SnapshotPolicy::EveryN(7));
        assert_eq!(options.snapshot_dir, PathBuf::from("/var/lib/rollup/snapshots"));
    }

    #[test]
    fn test_missing_explicit_file_is_ignored() {
        let config = load_config(Some(PathBuf::from("/nonexistent/node.toml"))).unwrap();
        assert_eq!(config.advancer.snapshot_interval, 100);
    }
}
