//! 机器后端抽象
//!
//! 每个 Backend 对应一个独立确定性机器进程的连接；所有远程调用都带显式超时。
//! 具体实现（远程模拟器 / 测试用脚本机 mock）实现 Backend，由 BackendFactory 创建。

pub mod fork;
pub mod mock;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use fork::Fork;
pub use mock::{MockBackend, MockFactory, MockStats, Step};

/// 机器根哈希 / 输出哈希（32 字节）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = usize;

    /// 长度不为 32 时返回实际长度
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; 32]>::try_from(bytes)
            .map(Hash)
            .map_err(|_| bytes.len())
    }
}

/// Run 返回的中断原因
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakReason {
    Failed,
    Halted,
    YieldedManually,
    YieldedAutomatically,
    YieldedSoftly,
    ReachedTargetMcycle,
}

/// 发往机器的请求类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestKind {
    Advance = 0,
    Inspect = 1,
}

/// 自动 yield：中间事件（进度 / 输出 / 报告）
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutomaticYield {
    Progress(Vec<u8>),
    Output(Vec<u8>),
    Report(Vec<u8>),
}

/// 手动 yield：请求完成
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManualYield {
    /// 附带尾随数据（Advance 时为 32 字节输出哈希）
    Accepted(Vec<u8>),
    Rejected(Vec<u8>),
    Exception(Vec<u8>),
}

/// CMIO 请求：机器在 yield 时向外部提出的请求
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmioRequest {
    Automatic(AutomaticYield),
    Manual(ManualYield),
}

/// 加载机器时传给后端的运行时配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub log_level: String,
    pub skip_root_hash_check: bool,
    pub skip_version_check: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            skip_root_hash_check: false,
            skip_version_check: false,
        }
    }
}

/// 后端调用错误（传输、超时、机器内部失败）
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("machine run failed")]
    MachineFailed,

    #[error("unexpected cmio request: {0}")]
    UnexpectedRequest(String),

    #[error("backend connection is closed")]
    Closed,

    #[error("internal backend error: {0}")]
    Internal(String),
}

/// fork_server 的结果：新连接与其服务进程信息
pub struct ForkedServer {
    pub backend: Box<dyn Backend>,
    pub address: String,
    pub pid: u32,
}

impl fmt::Debug for ForkedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkedServer")
            .field("address", &self.address)
            .field("pid", &self.pid)
            .finish()
    }
}

/// 一个机器进程连接；释放本地句柄即 Drop
#[async_trait]
pub trait Backend: Send + Sync {
    async fn load(
        &self,
        dir: &Path,
        config: &RuntimeConfig,
        timeout: Duration,
    ) -> Result<(), BackendError>;

    async fn store(&self, dir: &Path, timeout: Duration) -> Result<(), BackendError>;

    /// 运行到 target_cycle 或遇到中断
    async fn run(&self, target_cycle: u64, timeout: Duration) -> Result<BreakReason, BackendError>;

    async fn is_at_manual_yield(&self, timeout: Duration) -> Result<bool, BackendError>;

    async fn read_cycle(&self, timeout: Duration) -> Result<u64, BackendError>;

    async fn send_cmio_response(
        &self,
        kind: RequestKind,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), BackendError>;

    async fn receive_cmio_request(&self, timeout: Duration) -> Result<CmioRequest, BackendError>;

    async fn root_hash(&self, timeout: Duration) -> Result<Hash, BackendError>;

    /// 克隆当前机器状态到一个新的独立服务进程
    async fn fork_server(&self, timeout: Duration) -> Result<ForkedServer, BackendError>;

    async fn shutdown_server(&self, timeout: Duration) -> Result<(), BackendError>;

    /// 单个请求负载的最大字节数
    fn cmio_rx_buffer_size(&self) -> usize;
}

/// 后端工厂：启动一个新的空机器进程并返回其连接
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, timeout: Duration) -> Result<Box<dyn Backend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_try_from() {
        let bytes = [7u8; 32];
        let hash = Hash::try_from(&bytes[..]).unwrap();
        assert_eq!(hash.as_bytes(), &bytes);
        assert_eq!(Hash::try_from(&bytes[..31]), Err(31));
    }

    #[test]
    fn test_hash_display_is_prefixed_hex() {
        let hash = Hash([0xab; 32]);
        let shown = hash.to_string();
        assert!(shown.starts_with("0xabab"));
        assert_eq!(shown.len(), 2 + 64);
    }
}
