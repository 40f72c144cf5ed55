//! Authoritative in-memory session registry and the sandbox (container)
//! execution backend built on it.
//!
//! The registry serializes create/reuse/close per session id and owns the
//! per-session turn permit and cancellation handle. The sandbox backend
//! composes the registry with the port allocator, workspace provisioner,
//! container manager, and chat proxy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, watch};
use tracing::{info, warn};

use crate::session::models::{BackendKind, SessionRecord, SessionSpec, SessionStatus};
use crate::session::repository::SessionRepository;

use super::events::ChatEvent;
use super::manager::{ContainerHandle, ContainerManager};
use super::proxy::ChatProxy;
use super::workspace::WorkspaceProvisioner;
use super::{ChatBackend, EventStream, SandboxError, SandboxResult, TaskTag, TurnPolicy};

/// How many failed-session diagnostic copies to retain.
const FAILED_DIAGNOSTICS_CAPACITY: usize = 64;

/// Grace period for container stop during close.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Cancellation slot for the in-flight turn of one session.
#[derive(Debug, Default)]
pub struct TurnSlot {
    cancel: StdMutex<Option<watch::Sender<bool>>>,
}

impl TurnSlot {
    /// Install the cancellation sender for a starting turn.
    fn arm(&self, sender: watch::Sender<bool>) {
        *self.cancel.lock().unwrap() = Some(sender);
    }

    /// Fire the cancellation handle. Returns whether a turn was in flight.
    pub fn fire(&self) -> bool {
        match self.cancel.lock().unwrap().as_ref() {
            Some(sender) => sender.send(true).is_ok(),
            None => false,
        }
    }

    fn clear(&self) {
        *self.cancel.lock().unwrap() = None;
    }
}

/// Held by the turn producer for the duration of a turn. Dropping it clears
/// the cancellation slot and releases the per-session turn permit.
pub struct TurnGuard {
    _permit: OwnedMutexGuard<()>,
    slot: Arc<TurnSlot>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

/// One live session's shared state.
pub struct SessionEntry {
    record: RwLock<SessionRecord>,
    container: RwLock<Option<ContainerHandle>>,
    turn_permit: Arc<Mutex<()>>,
    turn_slot: Arc<TurnSlot>,
    degraded_passes: AtomicU32,
}

impl SessionEntry {
    fn new(record: SessionRecord) -> Arc<Self> {
        Arc::new(Self {
            record: RwLock::new(record),
            container: RwLock::new(None),
            turn_permit: Arc::new(Mutex::new(())),
            turn_slot: Arc::new(TurnSlot::default()),
            degraded_passes: AtomicU32::new(0),
        })
    }

    pub async fn record(&self) -> SessionRecord {
        self.record.read().await.clone()
    }

    async fn set_status(&self, status: SessionStatus) {
        self.record.write().await.status = status;
    }

    async fn container(&self) -> Option<ContainerHandle> {
        self.container.read().await.clone()
    }

    /// Fire the cancellation handle of this session's in-flight turn, if any.
    pub fn fire_cancel(&self) -> bool {
        self.turn_slot.fire()
    }
}

/// Authoritative map of session id to session state.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    /// Per-key creation locks so two concurrent first-use requests don't
    /// both provision.
    create_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Diagnostic copies of recently failed sessions.
    failed: StdMutex<VecDeque<SessionRecord>>,
    repo: SessionRepository,
}

impl SessionRegistry {
    pub fn new(repo: SessionRepository) -> Self {
        Self {
            sessions: DashMap::new(),
            create_locks: DashMap::new(),
            failed: StdMutex::new(VecDeque::new()),
            repo,
        }
    }

    /// The serialization lock for get-or-create on one session id.
    pub fn creation_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.create_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(session_id).map(|e| e.clone())
    }

    /// Insert a fresh entry for a record.
    pub fn insert_entry(&self, session_id: &str, record: SessionRecord) -> Arc<SessionEntry> {
        let entry = SessionEntry::new(record);
        self.sessions.insert(session_id.to_string(), entry.clone());
        entry
    }

    /// Remove an entry from the live map, returning it.
    pub fn remove_entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(session_id).map(|(_, e)| e)
    }

    /// The collaborator-owned persistence interface.
    pub fn repo(&self) -> &SessionRepository {
        &self.repo
    }

    /// Snapshot of live session records.
    pub async fn list(&self) -> Vec<SessionRecord> {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.record().await);
        }
        records
    }

    /// Update the last-activity timestamp; cheap.
    pub async fn touch(&self, session_id: &str) {
        if let Some(entry) = self.entry(session_id) {
            let now = Utc::now().to_rfc3339();
            entry.record.write().await.last_activity_at = now.clone();
            if let Err(e) = self.repo.touch(session_id, &now).await {
                warn!(session_id, error = %e, "failed to persist activity timestamp");
            }
        }
    }

    /// Begin a turn on a session: acquire the per-session permit and install
    /// a fresh cancellation handle.
    pub async fn begin_turn(
        &self,
        session_id: &str,
        policy: TurnPolicy,
    ) -> SandboxResult<(TurnGuard, watch::Receiver<bool>)> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;

        let permit = match policy {
            TurnPolicy::FailFast => entry
                .turn_permit
                .clone()
                .try_lock_owned()
                .map_err(|_| SandboxError::Busy(session_id.to_string()))?,
            TurnPolicy::Queue => entry.turn_permit.clone().lock_owned().await,
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        entry.turn_slot.arm(cancel_tx);

        Ok((
            TurnGuard {
                _permit: permit,
                slot: entry.turn_slot.clone(),
            },
            cancel_rx,
        ))
    }

    /// Fire the cancellation handle of the in-flight turn, if any.
    pub fn interrupt(&self, session_id: &str) -> SandboxResult<bool> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;
        Ok(entry.turn_slot.fire())
    }

    /// Retain a diagnostic copy of a failed session.
    fn record_failure(&self, record: SessionRecord) {
        let mut failed = self.failed.lock().unwrap();
        failed.retain(|r| r.id != record.id);
        if failed.len() >= FAILED_DIAGNOSTICS_CAPACITY {
            failed.pop_front();
        }
        failed.push_back(record);
    }

    fn failed_lookup(&self, session_id: &str) -> Option<SessionRecord> {
        self.failed
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == session_id)
            .cloned()
    }

    fn persist(&self, record: &SessionRecord) {
        let repo = self.repo.clone();
        let record = record.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.upsert(&record).await {
                warn!(session_id = %record.id, error = %e, "failed to persist session row");
            }
        });
    }
}

/// The container-backed execution backend.
pub struct SandboxBackend {
    registry: Arc<SessionRegistry>,
    workspaces: WorkspaceProvisioner,
    manager: ContainerManager,
    proxy: ChatProxy,
    turn_policy: TurnPolicy,
    degraded_threshold: u32,
}

impl SandboxBackend {
    pub fn new(
        registry: Arc<SessionRegistry>,
        workspaces: WorkspaceProvisioner,
        manager: ContainerManager,
        proxy: ChatProxy,
        turn_policy: TurnPolicy,
        degraded_threshold: u32,
    ) -> Self {
        Self {
            registry,
            workspaces,
            manager,
            proxy,
            turn_policy,
            degraded_threshold,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Remove containers left over from a previous run whose sessions are no
    /// longer live. Called once at startup.
    pub async fn startup_cleanup(&self) -> usize {
        let live: Vec<String> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        self.manager.reap_orphans(&live).await
    }

    async fn provision_session(&self, record: &mut SessionRecord) -> SandboxResult<()> {
        let session_id = record.id.clone();

        // Reattach to a retained workspace when one exists; otherwise create
        // and seed it, cloning the repository if requested.
        let fresh_workspace = !self.workspaces.exists(&session_id);
        let workspace_path = if fresh_workspace {
            let path = self.workspaces.create(&session_id).await?;
            if let Some(repo_url) = record.repo_url.clone() {
                let branch = record.branch.clone().unwrap_or_else(|| "main".to_string());
                if let Err(e) = self
                    .workspaces
                    .clone_repo(&path, &session_id, &repo_url, &branch)
                    .await
                {
                    // clone_repo already destroyed the partial directory
                    return Err(e);
                }
                record.branch = Some(branch);
            }
            path
        } else {
            info!(session_id = %session_id, "reusing retained workspace");
            self.workspaces.path_for(&session_id)
        };
        record.workspace_path = workspace_path.to_string_lossy().to_string();

        record.status = SessionStatus::Starting;
        if let Some(entry) = self.registry.entry(&session_id) {
            let mut guard = entry.record.write().await;
            guard.status = SessionStatus::Starting;
            guard.workspace_path = record.workspace_path.clone();
        }

        let handle = match self
            .manager
            .provision(&session_id, &record.workspace_path)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                if fresh_workspace {
                    let _ = self.workspaces.destroy(&workspace_path).await;
                }
                return Err(e);
            }
        };

        record.container_id = Some(handle.container_id.clone());
        record.container_name = Some(handle.container_name.clone());
        record.api_port = Some(handle.api_port as i64);
        record.code_port = Some(handle.code_port as i64);
        record.status = SessionStatus::Ready;

        if let Some(entry) = self.registry.entry(&session_id) {
            *entry.container.write().await = Some(handle);
            *entry.record.write().await = record.clone();
        }

        Ok(())
    }

    async fn close_entry(&self, entry: Arc<SessionEntry>, session_id: &str, reason: &str) {
        entry.set_status(SessionStatus::Stopping).await;
        entry.turn_slot.fire();

        if let Some(handle) = entry.container().await {
            self.manager.stop(&handle, STOP_GRACE).await;
            *entry.container.write().await = None;
        }

        let now = Utc::now().to_rfc3339();
        {
            let mut record = entry.record.write().await;
            record.status = SessionStatus::Stopped;
            record.stopped_at = Some(now.clone());
            record.container_id = None;
            record.container_name = None;
            record.api_port = None;
            record.code_port = None;
        }

        if let Err(e) = self.registry.repo.mark_stopped(session_id, &now).await {
            warn!(session_id, error = %e, "failed to persist stopped status");
        }

        info!(session_id, reason, "session closed");
    }

    /// Resolve a session that must be ready for chat traffic.
    async fn live_entry(&self, session_id: &str) -> SandboxResult<(Arc<SessionEntry>, u16)> {
        let entry = self
            .registry
            .entry(session_id)
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;

        let record = entry.record().await;
        if !record.status.is_live() {
            return Err(SandboxError::Unhealthy(format!(
                "session {} is {}",
                session_id, record.status
            )));
        }

        let api_port = entry
            .container()
            .await
            .map(|h| h.api_port)
            .ok_or_else(|| SandboxError::Unhealthy(format!("session {} has no container", session_id)))?;

        Ok((entry, api_port))
    }
}

#[async_trait]
impl ChatBackend for SandboxBackend {
    async fn open_session(&self, spec: SessionSpec) -> SandboxResult<(SessionRecord, bool)> {
        let session_id = spec
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Serialize the whole get-or-create step per session id
        let lock = self.registry.creation_lock(&session_id);
        let _guard = lock.lock().await;

        if let Some(entry) = self.registry.entry(&session_id) {
            let record = entry.record().await;
            if record.status.is_live() {
                self.registry.touch(&session_id).await;
                return Ok((record, false));
            }
            // A defunct entry under this id is superseded by a fresh one
            self.close_entry(entry, &session_id, "superseded").await;
            self.registry.remove_entry(&session_id);
        }

        let now = Utc::now().to_rfc3339();
        let mut record = SessionRecord {
            id: session_id.clone(),
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| format!("session-{}", session_id.chars().take(8).collect::<String>())),
            backend: BackendKind::Sandbox,
            status: SessionStatus::Provisioning,
            container_id: None,
            container_name: None,
            api_port: None,
            code_port: None,
            workspace_path: self
                .workspaces
                .path_for(&session_id)
                .to_string_lossy()
                .to_string(),
            repo_url: spec.repo_url.clone(),
            branch: spec.branch.clone(),
            created_at: now.clone(),
            last_activity_at: now,
            stopped_at: None,
            error_message: None,
        };

        self.registry.insert_entry(&session_id, record.clone());
        self.registry.persist(&record);

        match self.provision_session(&mut record).await {
            Ok(()) => {
                self.registry.persist(&record);
                info!(
                    session_id,
                    api_port = record.api_port,
                    code_port = record.code_port,
                    "session provisioned"
                );
                Ok((record, true))
            }
            Err(e) => {
                let now = Utc::now().to_rfc3339();
                record.status = SessionStatus::Failed;
                record.error_message = Some(e.to_string());
                record.stopped_at = Some(now.clone());

                self.registry.remove_entry(&session_id);
                self.registry.record_failure(record.clone());
                if let Err(persist_err) = self
                    .registry
                    .repo
                    .mark_failed(&session_id, &now, &e.to_string())
                    .await
                {
                    warn!(session_id = %session_id, error = %persist_err, "failed to persist failure");
                }

                Err(e)
            }
        }
    }

    async fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        if let Some(entry) = self.registry.entry(session_id) {
            return Some(entry.record().await);
        }
        if let Some(record) = self.registry.failed_lookup(session_id) {
            return Some(record);
        }
        self.registry.repo.get(session_id).await.ok().flatten()
    }

    async fn list_sessions(&self) -> Vec<SessionRecord> {
        self.registry.list().await
    }

    async fn close_session(&self, session_id: &str, reason: &str) -> SandboxResult<()> {
        // Idempotent: closing an unknown session is an acknowledged no-op
        let Some(entry) = self.registry.remove_entry(session_id) else {
            return Ok(());
        };
        self.close_entry(entry, session_id, reason).await;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> SandboxResult<()> {
        self.close_session(session_id, "deleted").await?;

        let path = self.workspaces.path_for(session_id);
        self.workspaces.destroy(&path).await?;

        if let Err(e) = self.registry.repo.delete(session_id).await {
            warn!(session_id, error = %e, "failed to delete session row");
        }

        Ok(())
    }

    async fn chat(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: Option<&str>,
    ) -> SandboxResult<Vec<ChatEvent>> {
        let (_entry, api_port) = self.live_entry(session_id).await?;
        self.registry.touch(session_id).await;

        let (guard, _cancel_rx) = self.registry.begin_turn(session_id, self.turn_policy).await?;
        let command = TaskTag::parse(task_tag).build_prompt(prompt);

        let result = self.proxy.execute_turn(api_port, session_id, &command).await;
        drop(guard);
        result
    }

    async fn chat_stream(
        &self,
        session_id: &str,
        prompt: &str,
        task_tag: Option<&str>,
    ) -> SandboxResult<EventStream> {
        let (_entry, api_port) = self.live_entry(session_id).await?;
        self.registry.touch(session_id).await;

        let (guard, cancel_rx) = self.registry.begin_turn(session_id, self.turn_policy).await?;
        let command = TaskTag::parse(task_tag).build_prompt(prompt);

        Ok(self.proxy.stream_turn(
            api_port,
            session_id.to_string(),
            command,
            cancel_rx,
            guard,
        ))
    }

    async fn interrupt(&self, session_id: &str) -> SandboxResult<bool> {
        self.registry.interrupt(session_id)
    }

    async fn probe_session(&self, session_id: &str) -> SandboxResult<()> {
        let Some(entry) = self.registry.entry(session_id) else {
            return Ok(());
        };

        let record = entry.record().await;
        if !record.status.is_live() {
            return Ok(());
        }

        let Some(handle) = entry.container().await else {
            return Ok(());
        };

        match self.manager.health(&handle).await {
            Ok(()) => {
                if record.status == SessionStatus::Degraded {
                    info!(session_id, "session recovered to ready");
                    entry.set_status(SessionStatus::Ready).await;
                    if let Err(e) = self
                        .registry
                        .repo
                        .update_status(session_id, SessionStatus::Ready)
                        .await
                    {
                        warn!(session_id, error = %e, "failed to persist recovery");
                    }
                }
                entry.degraded_passes.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(reason) => {
                let failures = entry.degraded_passes.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(session_id, failures, reason = %reason, "health probe failed");

                if failures >= self.degraded_threshold {
                    self.close_session(session_id, "unhealthy").await?;
                    return Err(SandboxError::Unhealthy(format!(
                        "session {} closed after {} consecutive probe failures",
                        session_id, failures
                    )));
                }

                if record.status == SessionStatus::Ready {
                    entry.set_status(SessionStatus::Degraded).await;
                    if let Err(e) = self
                        .registry
                        .repo
                        .update_status(session_id, SessionStatus::Degraded)
                        .await
                    {
                        warn!(session_id, error = %e, "failed to persist degradation");
                    }
                }
                Ok(())
            }
        }
    }

    fn mode(&self) -> &'static str {
        "sandbox"
    }
}
