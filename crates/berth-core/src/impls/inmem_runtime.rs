//! InMemoryRuntime - 開発・テスト用のコンテナエンジン
//!
//! Docker daemon なしで RuntimeGateway の振る舞いを再現します。
//! drift（外部からの削除・停止・ポート変更）や失敗を注入できます。
//!
//! # 実装詳細
//! - 状態は `std::sync::Mutex` で保持（ロックを await 跨ぎで持たない）
//! - host port 未指定の run は 32768..=65535 を順に払い出す（末尾で先頭に戻る）
//! - 遅延は状態のロックを取る前に sleep する
//! - load のたびに新しい `sha256:` id を払い出す

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::ports::{RunOutcome, RunSpec, RuntimeError, RuntimeGateway, RuntimeState};

const FIRST_EPHEMERAL_PORT: u16 = 32768;
const EPHEMERAL_PORT_COUNT: u32 = 32768;

fn ephemeral_port(n: u32) -> u16 {
    // n % 32768 < 32768 なので u16 に収まる
    FIRST_EPHEMERAL_PORT + (n % EPHEMERAL_PORT_COUNT) as u16
}

#[derive(Debug, Clone)]
struct FakeContainer {
    image: String,
    internal_port: u16,
    host_port: Option<u16>,
    running: bool,
    logs: Vec<String>,
}

#[derive(Default)]
struct RuntimeStateTable {
    containers: HashMap<String, FakeContainer>,
    images: HashMap<String, String>,
    scripted_ids: VecDeque<String>,
    next_container: u64,
    next_image: u64,
    next_port: u32,
    fail_next_run: Option<RuntimeError>,
    fail_next_stop: Option<RuntimeError>,
    fail_next_start: Option<RuntimeError>,
    fail_next_load: Option<RuntimeError>,
    failing_status: HashSet<String>,
}

#[derive(Default, Clone, Copy)]
struct Delays {
    load: Option<Duration>,
    stop: Option<Duration>,
    status: Option<Duration>,
}

#[derive(Default)]
pub struct InMemoryRuntime {
    state: Mutex<RuntimeStateTable>,
    delays: Mutex<Delays>,
    run_calls: AtomicUsize,
    load_calls: AtomicUsize,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RuntimeStateTable> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Use `runtime_id` for the next successful `run`.
    pub fn script_next_runtime_id(&self, runtime_id: impl Into<String>) {
        self.state().scripted_ids.push_back(runtime_id.into());
    }

    pub fn fail_next_run(&self, error: RuntimeError) {
        self.state().fail_next_run = Some(error);
    }

    pub fn fail_next_stop(&self, error: RuntimeError) {
        self.state().fail_next_stop = Some(error);
    }

    pub fn fail_next_start(&self, error: RuntimeError) {
        self.state().fail_next_start = Some(error);
    }

    pub fn fail_next_load(&self, error: RuntimeError) {
        self.state().fail_next_load = Some(error);
    }

    /// Make `status` for this runtime id fail with `Unavailable` until cleared.
    pub fn fail_status_for(&self, runtime_id: &str) {
        self.state().failing_status.insert(runtime_id.to_string());
    }

    fn delays(&self) -> MutexGuard<'_, Delays> {
        self.delays.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every `load_image` sleeps this long before answering.
    pub fn set_load_delay(&self, delay: Duration) {
        self.delays().load = Some(delay);
    }

    /// Every `stop` sleeps this long before touching the container.
    pub fn set_stop_delay(&self, delay: Duration) {
        self.delays().stop = Some(delay);
    }

    /// Every `status` sleeps this long before inspecting the container.
    pub fn set_status_delay(&self, delay: Duration) {
        self.delays().status = Some(delay);
    }

    /// Start engine-assigned ports as if `n` had already been handed out.
    pub fn skip_ephemeral_ports(&self, n: u32) {
        self.state().next_port = n;
    }

    /// The container disappears behind our back.
    pub fn vanish(&self, runtime_id: &str) {
        self.state().containers.remove(runtime_id);
    }

    /// The container exits behind our back.
    pub fn halt(&self, runtime_id: &str) {
        if let Some(c) = self.state().containers.get_mut(runtime_id) {
            c.running = false;
        }
    }

    /// The engine rebinds the container to another host port.
    pub fn remap_port(&self, runtime_id: &str, port: u16) {
        if let Some(c) = self.state().containers.get_mut(runtime_id) {
            c.host_port = Some(port);
        }
    }

    /// The image disappears from the engine behind our back.
    pub fn forget_image(&self, runtime_image_id: &str) {
        self.state().images.remove(runtime_image_id);
    }

    pub fn push_log(&self, runtime_id: &str, line: impl Into<String>) {
        if let Some(c) = self.state().containers.get_mut(runtime_id) {
            c.logs.push(line.into());
        }
    }

    pub fn contains(&self, runtime_id: &str) -> bool {
        self.state().containers.contains_key(runtime_id)
    }

    pub fn is_running(&self, runtime_id: &str) -> bool {
        self.state()
            .containers
            .get(runtime_id)
            .is_some_and(|c| c.running)
    }

    pub fn image_of(&self, runtime_id: &str) -> Option<String> {
        self.state().containers.get(runtime_id).map(|c| c.image.clone())
    }

    pub fn has_image(&self, runtime_image_id: &str) -> bool {
        self.state().images.contains_key(runtime_image_id)
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

fn not_found(runtime_id: &str) -> RuntimeError {
    RuntimeError::NotFound(runtime_id.to_string())
}

#[async_trait]
impl RuntimeGateway for InMemoryRuntime {
    async fn run(&self, spec: &RunSpec) -> Result<RunOutcome, RuntimeError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(err) = state.fail_next_run.take() {
            return Err(err);
        }

        let runtime_id = match state.scripted_ids.pop_front() {
            Some(id) => id,
            None => {
                state.next_container += 1;
                format!("fake-{:012x}", state.next_container)
            }
        };
        let host_port = match spec.host_port {
            Some(port) => port,
            None => {
                let port = ephemeral_port(state.next_port);
                state.next_port = state.next_port.wrapping_add(1);
                port
            }
        };

        state.containers.insert(
            runtime_id.clone(),
            FakeContainer {
                image: spec.image.clone(),
                internal_port: spec.internal_port,
                host_port: Some(host_port),
                running: true,
                logs: Vec::new(),
            },
        );
        Ok(RunOutcome {
            runtime_id,
            exposed_port: Some(host_port),
        })
    }

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        let delay = self.delays().stop;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = state.fail_next_stop.take() {
            return Err(err);
        }
        let c = state
            .containers
            .get_mut(runtime_id)
            .ok_or_else(|| not_found(runtime_id))?;
        c.running = false;
        Ok(())
    }

    async fn start(&self, runtime_id: &str) -> Result<Option<u16>, RuntimeError> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_start.take() {
            return Err(err);
        }
        let c = state
            .containers
            .get_mut(runtime_id)
            .ok_or_else(|| not_found(runtime_id))?;
        c.running = true;
        Ok(c.host_port)
    }

    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.state()
            .containers
            .remove(runtime_id)
            .map(|_| ())
            .ok_or_else(|| not_found(runtime_id))
    }

    async fn exists(&self, runtime_id: &str) -> Result<bool, RuntimeError> {
        Ok(self.contains(runtime_id))
    }

    async fn logs(&self, runtime_id: &str, tail: usize) -> Result<String, RuntimeError> {
        let state = self.state();
        let c = state
            .containers
            .get(runtime_id)
            .ok_or_else(|| not_found(runtime_id))?;
        let skip = c.logs.len().saturating_sub(tail);
        Ok(c.logs[skip..].join("\n"))
    }

    async fn status(&self, runtime_id: &str) -> Result<Option<RuntimeState>, RuntimeError> {
        let delay = self.delays().status;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        if state.failing_status.contains(runtime_id) {
            return Err(RuntimeError::Unavailable(format!(
                "inspect {runtime_id} failed"
            )));
        }
        Ok(state.containers.get(runtime_id).map(|c| {
            if c.running {
                RuntimeState::Running
            } else {
                RuntimeState::Exited
            }
        }))
    }

    async fn exposed_port(
        &self,
        runtime_id: &str,
        internal_port: u16,
    ) -> Result<Option<u16>, RuntimeError> {
        let state = self.state();
        let c = state
            .containers
            .get(runtime_id)
            .ok_or_else(|| not_found(runtime_id))?;
        if !c.running || c.internal_port != internal_port {
            return Ok(None);
        }
        Ok(c.host_port)
    }

    async fn load_image(&self, path: &str) -> Result<String, RuntimeError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays().load;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = state.fail_next_load.take() {
            return Err(err);
        }
        state.next_image += 1;
        let runtime_image_id = format!("sha256:{:064x}", state.next_image);
        state
            .images
            .insert(runtime_image_id.clone(), path.to_string());
        Ok(runtime_image_id)
    }

    async fn remove_image(&self, runtime_image_id: &str) -> Result<(), RuntimeError> {
        self.state()
            .images
            .remove(runtime_image_id)
            .map(|_| ())
            .ok_or_else(|| not_found(runtime_image_id))
    }

    async fn image_exists(&self, runtime_image_id: &str) -> Result<bool, RuntimeError> {
        Ok(self.has_image(runtime_image_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(host_port: Option<u16>) -> RunSpec {
        RunSpec {
            image: "nginx:latest".into(),
            internal_port: 80,
            host_port,
            memory_limit_mb: 64,
            cpu_limit: 0.1,
        }
    }

    #[tokio::test]
    async fn run_uses_scripted_id_and_requested_port() {
        let rt = InMemoryRuntime::new();
        rt.script_next_runtime_id("abc123");

        let out = rt.run(&spec(Some(8080))).await.unwrap();

        assert_eq!(out.runtime_id, "abc123");
        assert_eq!(out.exposed_port, Some(8080));
        assert!(rt.is_running("abc123"));
    }

    #[tokio::test]
    async fn run_allocates_ephemeral_ports() {
        let rt = InMemoryRuntime::new();

        let a = rt.run(&spec(None)).await.unwrap();
        let b = rt.run(&spec(None)).await.unwrap();

        assert_eq!(a.exposed_port, Some(32768));
        assert_eq!(b.exposed_port, Some(32769));
        assert_ne!(a.runtime_id, b.runtime_id);
    }

    #[tokio::test]
    async fn ephemeral_ports_wrap_at_the_top_of_the_range() {
        let rt = InMemoryRuntime::new();
        rt.skip_ephemeral_ports(32767);

        let last = rt.run(&spec(None)).await.unwrap();
        let wrapped = rt.run(&spec(None)).await.unwrap();

        assert_eq!(last.exposed_port, Some(65535));
        assert_eq!(wrapped.exposed_port, Some(32768));
    }

    #[test]
    fn ephemeral_port_counter_survives_u32_wraparound() {
        assert_eq!(ephemeral_port(u32::MAX), 65535);
        assert_eq!(ephemeral_port(u32::MAX.wrapping_add(1)), 32768);
    }

    #[tokio::test]
    async fn injected_stop_and_start_failures_leave_container_as_is() {
        let rt = InMemoryRuntime::new();
        let out = rt.run(&spec(None)).await.unwrap();

        rt.fail_next_stop(RuntimeError::Unavailable("daemon down".into()));
        assert!(rt.stop(&out.runtime_id).await.is_err());
        assert!(rt.is_running(&out.runtime_id));

        rt.stop(&out.runtime_id).await.unwrap();
        rt.fail_next_start(RuntimeError::Timeout(Duration::from_secs(1)));
        assert!(rt.start(&out.runtime_id).await.is_err());
        assert!(!rt.is_running(&out.runtime_id));
    }

    #[tokio::test]
    async fn vanished_container_reports_absent_and_not_found() {
        let rt = InMemoryRuntime::new();
        let out = rt.run(&spec(None)).await.unwrap();
        rt.vanish(&out.runtime_id);

        assert_eq!(rt.status(&out.runtime_id).await.unwrap(), None);
        assert!(rt.stop(&out.runtime_id).await.unwrap_err().is_not_found());
        assert!(!rt.exists(&out.runtime_id).await.unwrap());
    }

    #[tokio::test]
    async fn logs_respect_tail() {
        let rt = InMemoryRuntime::new();
        let out = rt.run(&spec(None)).await.unwrap();
        for i in 0..5 {
            rt.push_log(&out.runtime_id, format!("line {i}"));
        }

        let logs = rt.logs(&out.runtime_id, 2).await.unwrap();
        assert_eq!(logs, "line 3\nline 4");
    }

    #[tokio::test]
    async fn each_load_yields_a_new_image_id() {
        let rt = InMemoryRuntime::new();

        let a = rt.load_image("/tmp/a.tar").await.unwrap();
        let b = rt.load_image("/tmp/a.tar").await.unwrap();

        assert_ne!(a, b);
        assert!(rt.image_exists(&a).await.unwrap());
        assert_eq!(rt.load_calls(), 2);

        rt.remove_image(&a).await.unwrap();
        assert!(!rt.image_exists(&a).await.unwrap());
        assert!(rt.remove_image(&a).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let rt = InMemoryRuntime::new();
        rt.fail_next_run(RuntimeError::Unavailable("daemon down".into()));

        assert!(rt.run(&spec(None)).await.is_err());
        assert!(rt.run(&spec(None)).await.is_ok());
        assert_eq!(rt.run_calls(), 2);
    }
}
