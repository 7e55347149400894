//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use serde_json::Value;
use tokio::sync::mpsc;

use skiff::api::{AppState, create_router};
use skiff::buffer::BufferConfig;
use skiff::persistence::{
    MemoryRecordStore, PersistenceConfig, PersistenceError, PersistenceResult, RecordStore,
};
use skiff::sandbox::{
    AgentChannel, AgentSender, ExecOutput, ProcessSpec, Sandbox, SandboxError, SandboxProvider,
    SandboxResult,
};
use skiff::session::{SessionConfig, SessionHandle, SessionRegistry, SessionServices};
use skiff::state::MemoryStateStore;
use skiff::storage::{
    CopyFromStatus, CopyToStatus, MountOptions, StorageError, StorageResult, WorkspaceStorage,
};
use skiff::supervisor::Supervisor;
use skiff::sync::SyncConfig;
use skiff_protocol::{BrowserEvent, NewRecord, RecordReceipt};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Sandbox
// ============================================================================

/// Test-side end of an agent channel.
pub struct FakeAgent {
    commands: mpsc::Receiver<String>,
    events: Option<mpsc::Sender<Value>>,
}

impl FakeAgent {
    /// Next command written by the actor.
    pub async fn next_command(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("timed out waiting for agent command")
            .expect("agent command channel closed");
        serde_json::from_str(&line).expect("agent command is JSON")
    }

    /// Next command, asserting its type.
    pub async fn expect_command(&mut self, command_type: &str) -> Value {
        let command = self.next_command().await;
        assert_eq!(command["type"], command_type, "unexpected command {command}");
        command
    }

    /// A command that is already queued, if any.
    pub fn try_command(&mut self) -> Option<Value> {
        self.commands
            .try_recv()
            .ok()
            .map(|line| serde_json::from_str(&line).expect("agent command is JSON"))
    }

    pub async fn emit(&self, event: Value) {
        self.events
            .as_ref()
            .expect("agent already disconnected")
            .send(event)
            .await
            .expect("actor dropped the agent channel");
    }

    /// Close the agent's output, as if the process died.
    pub fn disconnect(&mut self) {
        self.events = None;
    }
}

pub struct FakeSandbox {
    id: String,
    workdir: String,
    env: Mutex<HashMap<String, String>>,
    channel: Mutex<Option<AgentChannel>>,
    agents: mpsc::UnboundedSender<FakeAgent>,
    stopped: AtomicBool,
}

impl FakeSandbox {
    pub fn env(&self) -> HashMap<String, String> {
        self.env.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn set_env(&self, vars: HashMap<String, String>) -> SandboxResult<()> {
        self.env.lock().unwrap().extend(vars);
        Ok(())
    }

    async fn exec(&self, _command: &str, _timeout: Duration) -> SandboxResult<ExecOutput> {
        Ok(ExecOutput {
            success: true,
            exit_code: Some(0),
            ..Default::default()
        })
    }

    async fn start_process(&self, _spec: &ProcessSpec) -> SandboxResult<()> {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        *self.channel.lock().unwrap() = Some(AgentChannel {
            sender: AgentSender::new(command_tx),
            events: event_rx,
        });
        self.stopped.store(false, Ordering::SeqCst);
        let _ = self.agents.send(FakeAgent {
            commands: command_rx,
            events: Some(event_tx),
        });
        Ok(())
    }

    async fn open_channel(&self) -> SandboxResult<AgentChannel> {
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SandboxError::Connection("no process started".to_string()))
    }

    async fn stop(&self) -> SandboxResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeProvider {
    agents_tx: mpsc::UnboundedSender<FakeAgent>,
    agents_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeAgent>>,
    sandboxes: Mutex<Vec<Arc<FakeSandbox>>>,
    fail_provision: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Self {
        let (agents_tx, agents_rx) = mpsc::unbounded_channel();
        Self {
            agents_tx,
            agents_rx: tokio::sync::Mutex::new(agents_rx),
            sandboxes: Mutex::new(Vec::new()),
            fail_provision: AtomicBool::new(false),
        }
    }

    /// The agent started by the next (or a pending) connect.
    pub async fn next_agent(&self) -> FakeAgent {
        let mut rx = self.agents_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for agent start")
            .expect("provider dropped")
    }

    pub fn provision_count(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }

    pub fn last_sandbox(&self) -> Arc<FakeSandbox> {
        self.sandboxes
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no sandbox provisioned")
    }

    pub fn set_fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn provision(&self, session_id: &str) -> SandboxResult<Arc<dyn Sandbox>> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(SandboxError::Provisioning("no capacity".to_string()));
        }
        let sandbox = Arc::new(FakeSandbox {
            id: session_id.to_string(),
            workdir: format!("/sandbox/{session_id}/workspace"),
            env: Mutex::new(HashMap::new()),
            channel: Mutex::new(None),
            agents: self.agents_tx.clone(),
            stopped: AtomicBool::new(false),
        });
        self.sandboxes.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Storage that records calls and returns scripted results.
pub struct FakeStorage {
    copy_to_results: Mutex<VecDeque<CopyToStatus>>,
    copy_from_status: Mutex<CopyFromStatus>,
    fail_mount: AtomicBool,
    copy_delay: Mutex<Duration>,
    copies_in_flight: AtomicUsize,
    max_copies_in_flight: AtomicUsize,
    pub mounts: AtomicUsize,
    pub copy_to_calls: AtomicUsize,
    pub copy_from_calls: AtomicUsize,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self {
            copy_to_results: Mutex::new(VecDeque::new()),
            copy_from_status: Mutex::new(CopyFromStatus::NoRemoteData),
            fail_mount: AtomicBool::new(false),
            copy_delay: Mutex::new(Duration::ZERO),
            copies_in_flight: AtomicUsize::new(0),
            max_copies_in_flight: AtomicUsize::new(0),
            mounts: AtomicUsize::new(0),
            copy_to_calls: AtomicUsize::new(0),
            copy_from_calls: AtomicUsize::new(0),
        }
    }

    /// Queue results for the next `copy_to` calls; afterwards they succeed.
    pub fn push_copy_to(&self, status: CopyToStatus) {
        self.copy_to_results.lock().unwrap().push_back(status);
    }

    pub fn set_copy_from(&self, status: CopyFromStatus) {
        *self.copy_from_status.lock().unwrap() = status;
    }

    pub fn set_fail_mount(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    /// Make every `copy_to` take `delay`.
    pub fn set_copy_delay(&self, delay: Duration) {
        *self.copy_delay.lock().unwrap() = delay;
    }

    pub fn copy_to_count(&self) -> usize {
        self.copy_to_calls.load(Ordering::SeqCst)
    }

    /// Most `copy_to` calls ever observed running at once.
    pub fn max_concurrent_copies(&self) -> usize {
        self.max_copies_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceStorage for FakeStorage {
    async fn mount(&self, _sandbox: &dyn Sandbox, options: &MountOptions) -> StorageResult<()> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(StorageError::Mount {
                bucket: options.bucket.clone(),
                path: options.mount_path.clone(),
                code: Some(32),
                message: "mount helper failed".to_string(),
            });
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn copy_to(&self, _sandbox: &dyn Sandbox, _session_id: &str) -> StorageResult<CopyToStatus> {
        self.copy_to_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.copies_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_copies_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.copy_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.copies_in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(self
            .copy_to_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CopyToStatus::Synced))
    }

    async fn copy_from(
        &self,
        _sandbox: &dyn Sandbox,
        _session_id: &str,
    ) -> StorageResult<CopyFromStatus> {
        self.copy_from_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.copy_from_status.lock().unwrap().clone())
    }

    async fn flush(&self, _sandbox: &dyn Sandbox) -> StorageResult<()> {
        Ok(())
    }

    async fn source_exists(&self, _sandbox: &dyn Sandbox) -> StorageResult<bool> {
        Ok(true)
    }
}

// ============================================================================
// Record store
// ============================================================================

/// Fails the first `failures` appends with 503, then stores in memory.
pub struct FlakyRecordStore {
    pub inner: MemoryRecordStore,
    failures: AtomicU32,
}

impl FlakyRecordStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            failures: AtomicU32::new(failures),
        }
    }

    pub fn records(&self, session_id: &str) -> Vec<(String, NewRecord)> {
        self.inner.records(session_id)
    }
}

#[async_trait]
impl RecordStore for FlakyRecordStore {
    async fn append(&self, session_id: &str, record: &NewRecord) -> PersistenceResult<RecordReceipt> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PersistenceError::Status {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                message: "try again".to_string(),
            });
        }
        self.inner.append(session_id, record).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        agent: ProcessSpec {
            command: "agent".to_string(),
            args: Vec::new(),
            ready_timeout: Duration::from_secs(1),
        },
        sandbox_env: HashMap::from([("SKIFF_MODE".to_string(), "test".to_string())]),
        mount: MountOptions {
            bucket: "bucket".to_string(),
            mount_path: "/mnt/durable".to_string(),
            credentials: HashMap::new(),
        },
        persistence: PersistenceConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        sync: SyncConfig {
            debounce: Duration::from_millis(50),
            max_debounce: Duration::from_millis(200),
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        buffer: BufferConfig::default(),
        idle_timeout: Duration::from_secs(60),
    }
}

pub struct TestHarness {
    pub registry: SessionRegistry,
    pub provider: Arc<FakeProvider>,
    pub storage: Arc<FakeStorage>,
    pub records: Arc<FlakyRecordStore>,
    pub state: Arc<MemoryStateStore>,
    pub supervisor: Supervisor,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with(fast_config(), 0)
    }

    /// Harness whose record store fails the first `record_failures` writes.
    pub fn with(config: SessionConfig, record_failures: u32) -> Self {
        let provider = Arc::new(FakeProvider::new());
        let storage = Arc::new(FakeStorage::new());
        let records = Arc::new(FlakyRecordStore::new(record_failures));
        let state = Arc::new(MemoryStateStore::new());
        let supervisor = Supervisor::new();

        let services = SessionServices {
            sandboxes: provider.clone(),
            storage: storage.clone(),
            records: records.clone(),
            state: state.clone(),
            supervisor: supervisor.clone(),
            config,
        };

        Self {
            registry: SessionRegistry::new(services),
            provider,
            storage,
            records,
            state,
            supervisor,
        }
    }

    pub fn router(&self) -> Router {
        create_router(AppState::new(self.registry.clone()))
    }

    pub async fn connect(&self, session_id: &str) -> Browser {
        let handle = self.registry.get_or_spawn(session_id).unwrap();
        Browser::attach(handle).await
    }

    /// Wait for every queued record of the session to be written.
    pub async fn wait_for_records(&self, session_id: &str, count: usize) -> Vec<(String, NewRecord)> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let records = self.records.records(session_id);
            if records.len() >= count {
                return records;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} records, have {}",
                records.len()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// A browser attached directly to an actor handle.
pub struct Browser {
    pub handle: SessionHandle,
    pub connection_id: u64,
    events: mpsc::Receiver<BrowserEvent>,
}

impl Browser {
    pub async fn attach(handle: SessionHandle) -> Self {
        let (tx, events) = mpsc::channel(256);
        let connection_id = handle.attach_browser(tx).await.unwrap();
        Self {
            handle,
            connection_id,
            events,
        }
    }

    pub async fn send(&self, command: Value) {
        let command = serde_json::from_value(command).expect("valid client command");
        self.handle.send_client(command).await.unwrap();
    }

    pub async fn next_event(&mut self) -> Value {
        let event = tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for browser event")
            .expect("browser channel closed");
        serde_json::to_value(event).unwrap()
    }

    /// Skip events until one of `event_type` arrives.
    pub async fn expect_event(&mut self, event_type: &str) -> Value {
        loop {
            let event = self.next_event().await;
            if event["type"] == event_type {
                return event;
            }
        }
    }

    /// Skip events until the given status arrives.
    pub async fn expect_status(&mut self, status: &str) -> Value {
        loop {
            let event = self.expect_event("status").await;
            if event["status"] == status {
                return event;
            }
        }
    }

    pub async fn detach(self) {
        self.handle.detach_browser(self.connection_id).await.unwrap();
    }
}
