//! 脚本化 Mock 后端（用于测试与本地运行，无需真实模拟器）
//!
//! 每个请求由 behavior 生成一串 Step；run 每次消耗一个 Step 并返回对应的中断原因。
//! 默认 behavior 为回显：Advance 输出 payload 并接受，Inspect 报告 payload 并接受。

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::Hasher;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{
    AutomaticYield, Backend, BackendError, BackendFactory, BreakReason, CmioRequest, ForkedServer,
    Hash, ManualYield, RequestKind, RuntimeConfig,
};

/// 每个脚本步骤消耗的周期数
const STEP_CYCLES: u64 = 8;

const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

const SNAPSHOT_FILE: &str = "machine.json";

/// 脚本步骤
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Progress,
    Output(Vec<u8>),
    Report(Vec<u8>),
    Accept,
    Reject,
    Exception(Vec<u8>),
    Halt,
    Fail,
    /// 永不 yield，每次 run 都跑满目标周期
    Spin,
    /// 睡眠一次后软 yield
    Sleep(Duration),
    /// 每次 run 都睡眠并软 yield，永不结束
    Stall(Duration),
    Soft,
}

pub type Behavior = Arc<dyn Fn(RequestKind, &[u8]) -> Vec<Step> + Send + Sync>;

/// 回显 behavior
pub fn echo(kind: RequestKind, payload: &[u8]) -> Vec<Step> {
    match kind {
        RequestKind::Advance => vec![
            Step::Progress,
            Step::Output(payload.to_vec()),
            Step::Report(payload.to_vec()),
            Step::Accept,
        ],
        RequestKind::Inspect => vec![Step::Report(payload.to_vec()), Step::Accept],
    }
}

/// 模板目录对应的初始根哈希
pub fn template_hash(dir: &Path) -> Hash {
    digest(&[&b"template"[..], dir.to_string_lossy().as_bytes()])
}

fn digest(parts: &[&[u8]]) -> Hash {
    let mut out = [0u8; 32];
    for (lane, chunk) in out.chunks_mut(8).enumerate() {
        let mut hasher = DefaultHasher::new();
        hasher.write_usize(lane);
        for part in parts {
            hasher.write_usize(part.len());
            hasher.write(part);
        }
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    Hash(out)
}

fn outputs_hash(outputs: &[Vec<u8>]) -> Hash {
    let parts: Vec<&[u8]> = outputs.iter().map(Vec::as_slice).collect();
    digest(&parts)
}

/// 所有 Mock 后端共享的调用计数
#[derive(Debug, Default)]
pub struct MockStats {
    created: AtomicUsize,
    forks: AtomicUsize,
    shutdowns: AtomicUsize,
    runs: AtomicUsize,
    stores: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn forks(&self) -> usize {
        self.forks.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// 同时处于执行中的请求数峰值
    pub fn peak_executions(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Faults {
    forks: AtomicBool,
    shutdowns: AtomicBool,
}

struct Shared {
    behavior: Behavior,
    buffer_size: usize,
    stats: Arc<MockStats>,
    faults: Arc<Faults>,
    next_pid: AtomicU32,
}

/// 当前 yield 所携带的请求（可序列化，便于快照）
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Pending {
    Progress(Vec<u8>),
    Output(Vec<u8>),
    Report(Vec<u8>),
    Accepted(Vec<u8>),
    Rejected(Vec<u8>),
    Exception(Vec<u8>),
}

impl Pending {
    fn is_manual(&self) -> bool {
        matches!(
            self,
            Pending::Accepted(_) | Pending::Rejected(_) | Pending::Exception(_)
        )
    }

    fn to_request(&self) -> CmioRequest {
        match self.clone() {
            Pending::Progress(d) => CmioRequest::Automatic(AutomaticYield::Progress(d)),
            Pending::Output(d) => CmioRequest::Automatic(AutomaticYield::Output(d)),
            Pending::Report(d) => CmioRequest::Automatic(AutomaticYield::Report(d)),
            Pending::Accepted(d) => CmioRequest::Manual(ManualYield::Accepted(d)),
            Pending::Rejected(d) => CmioRequest::Manual(ManualYield::Rejected(d)),
            Pending::Exception(d) => CmioRequest::Manual(ManualYield::Exception(d)),
        }
    }
}

/// 持久化部分（store / load）
#[derive(Clone, Debug, Serialize, Deserialize)]
struct MachineState {
    root: [u8; 32],
    cycle: u64,
    halted: bool,
    pending: Pending,
}

impl MachineState {
    fn at(root: Hash) -> Self {
        Self {
            root: root.0,
            cycle: 0,
            halted: false,
            pending: Pending::Accepted(Hash::default().0.to_vec()),
        }
    }
}

#[derive(Clone)]
struct Machine {
    state: MachineState,
    kind: Option<RequestKind>,
    payload: Vec<u8>,
    script: VecDeque<Step>,
    outputs: Vec<Vec<u8>>,
    executing: bool,
}

impl Machine {
    fn new(state: MachineState) -> Self {
        Self {
            state,
            kind: None,
            payload: Vec::new(),
            script: VecDeque::new(),
            outputs: Vec::new(),
            executing: false,
        }
    }

    fn advance_cycle(&mut self, target: u64) {
        self.state.cycle = (self.state.cycle + STEP_CYCLES).min(target.max(self.state.cycle));
    }
}

/// 脚本化机器连接
pub struct MockBackend {
    shared: Arc<Shared>,
    machine: Mutex<Machine>,
    closed: AtomicBool,
}

impl MockBackend {
    fn new(shared: Arc<Shared>, machine: Machine) -> Self {
        shared.stats.created.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            machine: Mutex::new(machine),
            closed: AtomicBool::new(false),
        }
    }

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn finish(&self, machine: &mut Machine) {
        if machine.executing {
            machine.executing = false;
            self.shared.stats.leave();
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn load(
        &self,
        dir: &Path,
        _config: &RuntimeConfig,
        _timeout: Duration,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        let file = dir.join(SNAPSHOT_FILE);
        let state = if tokio::fs::try_exists(&file).await.unwrap_or(false) {
            let raw = tokio::fs::read(&file)
                .await
                .map_err(|e| BackendError::Internal(e.to_string()))?;
            serde_json::from_slice(&raw).map_err(|e| BackendError::Internal(e.to_string()))?
        } else if tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            MachineState::at(template_hash(dir))
        } else {
            return Err(BackendError::Internal(format!(
                "no machine found at {}",
                dir.display()
            )));
        };
        *self.machine() = Machine::new(state);
        Ok(())
    }

    async fn store(&self, dir: &Path, _timeout: Duration) -> Result<(), BackendError> {
        self.ensure_open()?;
        let raw = serde_json::to_vec(&self.machine().state)
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        tokio::fs::write(dir.join(SNAPSHOT_FILE), raw)
            .await
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        self.shared.stats.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, target_cycle: u64, timeout: Duration) -> Result<BreakReason, BackendError> {
        self.ensure_open()?;
        self.shared.stats.runs.fetch_add(1, Ordering::SeqCst);

        let delay = match self.machine().script.front() {
            Some(Step::Sleep(d)) | Some(Step::Stall(d)) => Some(*d),
            _ => None,
        };
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(BackendError::Timeout { op: "run", timeout });
            }
            tokio::time::sleep(delay).await;
        }

        let mut m = self.machine();
        if m.state.halted {
            return Ok(BreakReason::Halted);
        }
        let Some(step) = m.script.front().cloned() else {
            return Ok(if m.state.pending.is_manual() {
                BreakReason::YieldedManually
            } else {
                BreakReason::Failed
            });
        };

        let costs_cycles = !matches!(step, Step::Spin | Step::Sleep(_) | Step::Stall(_));
        if costs_cycles && m.state.cycle + STEP_CYCLES > target_cycle {
            m.state.cycle = target_cycle.max(m.state.cycle);
            return Ok(BreakReason::ReachedTargetMcycle);
        }

        match step {
            Step::Progress | Step::Output(_) | Step::Report(_) => {
                m.script.pop_front();
                m.advance_cycle(target_cycle);
                m.state.pending = match step {
                    Step::Output(data) => {
                        m.outputs.push(data.clone());
                        Pending::Output(data)
                    }
                    Step::Report(data) => Pending::Report(data),
                    _ => Pending::Progress(Vec::new()),
                };
                Ok(BreakReason::YieldedAutomatically)
            }
            Step::Accept => {
                m.script.pop_front();
                m.advance_cycle(target_cycle);
                let data = if m.kind == Some(RequestKind::Advance) {
                    let root = digest(&[&m.state.root[..], m.payload.as_slice()]);
                    m.state.root = root.0;
                    outputs_hash(&m.outputs).0.to_vec()
                } else {
                    Vec::new()
                };
                m.state.pending = Pending::Accepted(data);
                self.finish(&mut m);
                Ok(BreakReason::YieldedManually)
            }
            Step::Reject => {
                m.script.pop_front();
                m.advance_cycle(target_cycle);
                m.state.pending = Pending::Rejected(Vec::new());
                self.finish(&mut m);
                Ok(BreakReason::YieldedManually)
            }
            Step::Exception(data) => {
                m.script.pop_front();
                m.advance_cycle(target_cycle);
                m.state.pending = Pending::Exception(data);
                self.finish(&mut m);
                Ok(BreakReason::YieldedManually)
            }
            Step::Halt => {
                m.script.pop_front();
                m.state.halted = true;
                self.finish(&mut m);
                Ok(BreakReason::Halted)
            }
            Step::Fail => {
                m.script.pop_front();
                self.finish(&mut m);
                Ok(BreakReason::Failed)
            }
            Step::Spin => {
                m.state.cycle = target_cycle.max(m.state.cycle);
                Ok(BreakReason::ReachedTargetMcycle)
            }
            Step::Sleep(_) | Step::Soft => {
                m.script.pop_front();
                m.advance_cycle(target_cycle);
                Ok(BreakReason::YieldedSoftly)
            }
            Step::Stall(_) => {
                m.advance_cycle(target_cycle);
                Ok(BreakReason::YieldedSoftly)
            }
        }
    }

    async fn is_at_manual_yield(&self, _timeout: Duration) -> Result<bool, BackendError> {
        self.ensure_open()?;
        let m = self.machine();
        Ok(!m.executing && m.state.pending.is_manual())
    }

    async fn read_cycle(&self, _timeout: Duration) -> Result<u64, BackendError> {
        self.ensure_open()?;
        Ok(self.machine().state.cycle)
    }

    async fn send_cmio_response(
        &self,
        kind: RequestKind,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        if data.len() > self.shared.buffer_size {
            return Err(BackendError::Internal("payload exceeds rx buffer".to_string()));
        }
        let script = (self.shared.behavior)(kind, data);
        let mut m = self.machine();
        if m.executing || !m.state.pending.is_manual() {
            return Err(BackendError::UnexpectedRequest(
                "machine is not waiting for a request".to_string(),
            ));
        }
        m.script = script.into();
        m.kind = Some(kind);
        m.payload = data.to_vec();
        m.outputs.clear();
        m.executing = true;
        self.shared.stats.enter();
        Ok(())
    }

    async fn receive_cmio_request(&self, _timeout: Duration) -> Result<CmioRequest, BackendError> {
        self.ensure_open()?;
        Ok(self.machine().state.pending.to_request())
    }

    async fn root_hash(&self, _timeout: Duration) -> Result<Hash, BackendError> {
        self.ensure_open()?;
        Ok(Hash(self.machine().state.root))
    }

    async fn fork_server(&self, _timeout: Duration) -> Result<ForkedServer, BackendError> {
        self.ensure_open()?;
        if self.shared.faults.forks.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("fork refused".to_string()));
        }
        self.shared.stats.forks.fetch_add(1, Ordering::SeqCst);
        let machine = self.machine().clone();
        if machine.executing {
            self.shared.stats.enter();
        }
        let pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(ForkedServer {
            backend: Box::new(MockBackend::new(self.shared.clone(), machine)),
            address: format!("127.0.0.1:{}", 10_000 + pid),
            pid,
        })
    }

    async fn shutdown_server(&self, _timeout: Duration) -> Result<(), BackendError> {
        self.ensure_open()?;
        if self.shared.faults.shutdowns.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("shutdown refused".to_string()));
        }
        self.closed.store(true, Ordering::SeqCst);
        self.shared.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        let mut m = self.machine();
        self.finish(&mut m);
        Ok(())
    }

    fn cmio_rx_buffer_size(&self) -> usize {
        self.shared.buffer_size
    }
}

/// Mock 后端工厂
pub struct MockFactory {
    behavior: Behavior,
    buffer_size: usize,
    stats: Arc<MockStats>,
    faults: Arc<Faults>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new(echo)
    }
}

impl MockFactory {
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(RequestKind, &[u8]) -> Vec<Step> + Send + Sync + 'static,
    {
        Self {
            behavior: Arc::new(behavior),
            buffer_size: DEFAULT_BUFFER_SIZE,
            stats: Arc::new(MockStats::default()),
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    /// 之后所有 fork_server 调用都失败
    pub fn fail_forks(&self, fail: bool) {
        self.faults.forks.store(fail, Ordering::SeqCst);
    }

    /// 之后所有 shutdown_server 调用都失败
    pub fn fail_shutdowns(&self, fail: bool) {
        self.faults.shutdowns.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendFactory for MockFactory {
    async fn create(&self, _timeout: Duration) -> Result<Box<dyn Backend>, BackendError> {
        let shared = Arc::new(Shared {
            behavior: self.behavior.clone(),
            buffer_size: self.buffer_size,
            stats: self.stats.clone(),
            faults: self.faults.clone(),
            next_pid: AtomicU32::new(1),
        });
        Ok(Box::new(MockBackend::new(
            shared,
            Machine::new(MachineState::at(Hash::default())),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_template_load_uses_template_hash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockFactory::default().create(TIMEOUT).await.unwrap();
        backend
            .load(dir.path(), &RuntimeConfig::default(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(backend.root_hash(TIMEOUT).await.unwrap(), template_hash(dir.path()));
        assert!(backend.is_at_manual_yield(TIMEOUT).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockFactory::default().create(TIMEOUT).await.unwrap();
        let missing = dir.path().join("missing");
        assert!(backend
            .load(&missing, &RuntimeConfig::default(), TIMEOUT)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_store_then_load_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MockFactory::default();
        let backend = factory.create(TIMEOUT).await.unwrap();
        backend
            .load(dir.path(), &RuntimeConfig::default(), TIMEOUT)
            .await
            .unwrap();
        backend
            .send_cmio_response(RequestKind::Advance, b"hi", TIMEOUT)
            .await
            .unwrap();
        while backend.run(u64::MAX, TIMEOUT).await.unwrap() != BreakReason::YieldedManually {}
        let root = backend.root_hash(TIMEOUT).await.unwrap();

        let snapshot = dir.path().join("snap");
        backend.store(&snapshot, TIMEOUT).await.unwrap();
        let restored = factory.create(TIMEOUT).await.unwrap();
        restored
            .load(&snapshot, &RuntimeConfig::default(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(restored.root_hash(TIMEOUT).await.unwrap(), root);
        assert_eq!(factory.stats().stores(), 1);
    }

    #[tokio::test]
    async fn test_fork_is_independent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockFactory::default().create(TIMEOUT).await.unwrap();
        backend
            .load(dir.path(), &RuntimeConfig::default(), TIMEOUT)
            .await
            .unwrap();
        let before = backend.root_hash(TIMEOUT).await.unwrap();

        let fork = backend.fork_server(TIMEOUT).await.unwrap().backend;
        fork.send_cmio_response(RequestKind::Advance, b"x", TIMEOUT)
            .await
            .unwrap();
        while fork.run(u64::MAX, TIMEOUT).await.unwrap() != BreakReason::YieldedManually {}

        assert_ne!(fork.root_hash(TIMEOUT).await.unwrap(), before);
        assert_eq!(backend.root_hash(TIMEOUT).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_calls() {
        let backend = MockFactory::default().create(TIMEOUT).await.unwrap();
        backend.shutdown_server(TIMEOUT).await.unwrap();
        assert!(matches!(
            backend.read_cycle(TIMEOUT).await,
            Err(BackendError::Closed)
        ));
    }
}
