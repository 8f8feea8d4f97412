//! Run Runtime: one Run per orchestrated unit of work, each owning its
//! sandbox instance, agent process and session set.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use acp_stdio_bridge::AgentBridge;
use run_proxy_error::RuntimeError;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

pub mod agent;
pub mod client;
pub mod init;
pub mod open;
pub mod retry;
pub mod session;
pub mod workspace;

pub use agent::{close_agent, ensure_initialized, initialize_params, start_agent, AgentLaunch};
pub use client::{PendingPermissions, PermissionChoice};
pub use init::{parse_init_step_line, run_init_script, InitStep, RunInit, INIT_STEP_PREFIX};
pub use open::{ensure_run_open, ensure_runtime, open_env, RuntimeRequest};
pub use retry::{classify_error, map_bridge_error, with_auth_retry, ErrorClass};
pub use session::{
    check_prompt_blocks, compose_prompt_with_context, ensure_session_for_prompt, send_prompt,
    EnsuredSession, PromptCapabilities, PromptOutcome, SessionTarget,
};
pub use workspace::{
    prepare_git_workspace, resolve_guest_home, resolve_run_paths, GitWorkspaceSpec, RunWorkspace,
};

/// Every field here is guarded by one short-lived lock; async work reads a
/// snapshot and never holds the guard across an await.
#[derive(Debug)]
pub struct RunState {
    pub(crate) keepalive_ttl: Duration,
    pub(crate) last_used_at: Instant,
    pub(crate) expires_at: Instant,
    pub(crate) workspace: Option<RunWorkspace>,
    pub(crate) default_cwd: Option<String>,
    pub(crate) bridge: Option<Arc<AgentBridge>>,
    pub(crate) agent_generation: u64,
    pub(crate) init_result: Option<Value>,
    pub(crate) seen_sessions: HashSet<String>,
    pub(crate) auto_mode_sessions: HashSet<String>,
    pub(crate) active_prompt_id: Option<String>,
}

impl RunState {
    fn new(keepalive_ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            keepalive_ttl,
            last_used_at: now,
            expires_at: now + keepalive_ttl,
            workspace: None,
            default_cwd: None,
            bridge: None,
            agent_generation: 0,
            init_result: None,
            seen_sessions: HashSet::new(),
            auto_mode_sessions: HashSet::new(),
            active_prompt_id: None,
        }
    }
}

pub struct Run {
    pub run_id: String,
    pub instance_name: String,
    queue: Mutex<()>,
    pub(crate) init_gate: Mutex<()>,
    busy: AtomicUsize,
    closed: AtomicBool,
    state: StdMutex<RunState>,
    pub(crate) permissions: PendingPermissions,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("run_id", &self.run_id)
            .field("instance_name", &self.instance_name)
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct BusyGuard<'a>(&'a AtomicUsize);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Run {
    fn new(run_id: String, instance_name: String, keepalive_ttl: Duration) -> Self {
        Self {
            run_id,
            instance_name,
            queue: Mutex::new(()),
            init_gate: Mutex::new(()),
            busy: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            state: StdMutex::new(RunState::new(keepalive_ttl)),
            permissions: PendingPermissions::default(),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` after every previously enqueued operation on this Run has
    /// finished. The tokio mutex is fair, so arrival order is preserved.
    /// Work reaching its turn on a closed Run is refused.
    pub async fn enqueue<F, T>(&self, op: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        self.busy.fetch_add(1, Ordering::SeqCst);
        let _busy = BusyGuard(&self.busy);
        let _turn = self.queue.lock().await;
        self.ensure_open()?;
        let out = op.await;
        self.touch();
        out
    }

    /// Terminal: no further queued work runs and no agent is started.
    pub fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(run_id = %self.run_id, "run marked closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::RunClosed {
                run_id: self.run_id.clone(),
            });
        }
        Ok(())
    }

    pub fn touch(&self) {
        let mut state = self.state();
        let now = Instant::now();
        state.last_used_at = now;
        state.expires_at = now + state.keepalive_ttl;
    }

    pub fn has_queued_work(&self) -> bool {
        self.busy.load(Ordering::SeqCst) > 0
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        !self.has_queued_work() && self.state().expires_at <= now
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state().last_used_at)
    }

    pub fn expires_at(&self) -> Instant {
        self.state().expires_at
    }

    pub fn keepalive_ttl(&self) -> Duration {
        self.state().keepalive_ttl
    }

    pub fn bridge(&self) -> Option<Arc<AgentBridge>> {
        self.state().bridge.clone()
    }

    pub fn is_initialized(&self) -> bool {
        let state = self.state();
        state.bridge.is_some() && state.init_result.is_some()
    }

    pub fn init_result(&self) -> Option<Value> {
        self.state().init_result.clone()
    }

    /// How many agents have been spawned for this Run so far.
    pub fn agent_generation(&self) -> u64 {
        self.state().agent_generation
    }

    pub fn workspace(&self) -> Option<RunWorkspace> {
        self.state().workspace.clone()
    }

    pub fn default_cwd(&self) -> Option<String> {
        self.state().default_cwd.clone()
    }

    pub fn has_seen_session(&self, session_id: &str) -> bool {
        self.state().seen_sessions.contains(session_id)
    }

    pub(crate) fn mark_session_seen(&self, session_id: &str) {
        self.state().seen_sessions.insert(session_id.to_string());
    }

    pub(crate) fn forget_session(&self, session_id: &str) {
        let mut state = self.state();
        state.seen_sessions.remove(session_id);
        state.auto_mode_sessions.remove(session_id);
    }

    /// `true` the first time it is called for `session_id`.
    pub(crate) fn claim_auto_mode(&self, session_id: &str) -> bool {
        self.state().auto_mode_sessions.insert(session_id.to_string())
    }

    pub fn active_prompt_id(&self) -> Option<String> {
        self.state().active_prompt_id.clone()
    }

    pub(crate) fn set_active_prompt_id(&self, prompt_id: Option<String>) {
        self.state().active_prompt_id = prompt_id;
    }

    pub fn permissions(&self) -> &PendingPermissions {
        &self.permissions
    }
}

// ---------------------------------------------------------------------------
// Run registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RunManager {
    runs: RwLock<HashMap<String, Arc<Run>>>,
}

impl RunManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<Run>> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Creates the Run on first sight. A known Run keeps its instance; the
    /// keepalive TTL is refreshed from the latest command. A closed Run still
    /// in the map is replaced by a fresh one.
    pub async fn get_or_create(
        &self,
        run_id: &str,
        instance_name: &str,
        keepalive_ttl: Duration,
    ) -> Result<Arc<Run>, RuntimeError> {
        let check = |run: &Arc<Run>| -> Result<Arc<Run>, RuntimeError> {
            if run.instance_name != instance_name {
                return Err(RuntimeError::Conflict {
                    message: format!(
                        "run {run_id} is bound to instance {}, not {instance_name}",
                        run.instance_name
                    ),
                });
            }
            {
                let mut state = run.state();
                state.keepalive_ttl = keepalive_ttl;
                state.expires_at = Instant::now() + keepalive_ttl;
            }
            Ok(run.clone())
        };

        if let Some(run) = self.runs.read().await.get(run_id).filter(|run| !run.is_closed()) {
            return check(run);
        }

        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get(run_id).filter(|run| !run.is_closed()) {
            return check(run);
        }
        let run = Arc::new(Run::new(
            run_id.to_string(),
            instance_name.to_string(),
            keepalive_ttl,
        ));
        runs.insert(run_id.to_string(), run.clone());
        tracing::info!(
            run_id = %run_id,
            instance_name = %instance_name,
            keepalive_ttl_seconds = keepalive_ttl.as_secs(),
            "run created"
        );
        Ok(run)
    }

    /// Closes `run` and drops it from the map, unless a newer Run has
    /// already taken its id.
    pub async fn remove(&self, run: &Arc<Run>) -> bool {
        run.mark_closed();
        let mut runs = self.runs.write().await;
        let current = runs.get(&run.run_id).is_some_and(|known| Arc::ptr_eq(known, run));
        if current {
            runs.remove(&run.run_id);
            tracing::info!(run_id = %run.run_id, "run deleted");
        }
        current
    }

    pub async fn find_by_instance(&self, instance_name: &str) -> Option<Arc<Run>> {
        self.runs
            .read()
            .await
            .values()
            .find(|run| run.instance_name == instance_name)
            .cloned()
    }

    pub async fn expired(&self, now: Instant) -> Vec<Arc<Run>> {
        self.runs
            .read()
            .await
            .values()
            .filter(|run| run.is_expired(now))
            .cloned()
            .collect()
    }

    /// Closes, removes and returns every Run.
    pub async fn drain(&self) -> Vec<Arc<Run>> {
        let drained: Vec<Arc<Run>> = self.runs.write().await.drain().map(|(_, run)| run).collect();
        for run in &drained {
            run.mark_closed();
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn get_or_create_rejects_a_different_instance() {
        let runs = RunManager::new();
        let first = runs
            .get_or_create("r1", "run-proxy-run-r1", Duration::from_secs(60))
            .await
            .expect("create");
        let again = runs
            .get_or_create("r1", "run-proxy-run-r1", Duration::from_secs(120))
            .await
            .expect("reuse");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.keepalive_ttl(), Duration::from_secs(120));

        let err = runs
            .get_or_create("r1", "other", Duration::from_secs(60))
            .await
            .expect_err("instance mismatch");
        assert!(matches!(err, RuntimeError::Conflict { .. }));
        assert_eq!(runs.len().await, 1);
    }

    #[tokio::test]
    async fn queued_operations_run_in_arrival_order() {
        let runs = RunManager::new();
        let run = runs
            .get_or_create("r1", "run-proxy-run-r1", Duration::from_secs(60))
            .await
            .expect("create");
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for index in 0..5u64 {
            let run = run.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                run.enqueue(async {
                    order.lock().expect("order").push(format!("start-{index}"));
                    tokio::time::sleep(Duration::from_millis(5 * (5 - index))).await;
                    order.lock().expect("order").push(format!("end-{index}"));
                    Ok(())
                })
                .await
                .expect("queued op");
            }));
            // Give each task time to reach the queue before the next one.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for task in tasks {
            task.await.expect("join");
        }

        let order = order.lock().expect("order").clone();
        let expected: Vec<String> = (0..5)
            .flat_map(|index| [format!("start-{index}"), format!("end-{index}")])
            .collect();
        assert_eq!(order, expected);
        assert!(!run.has_queued_work());
    }

    #[tokio::test]
    async fn runs_expire_only_when_idle() {
        let runs = RunManager::new();
        let run = runs
            .get_or_create("r1", "run-proxy-run-r1", Duration::from_millis(40))
            .await
            .expect("create");
        assert!(runs.expired(Instant::now()).await.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.expired(Instant::now()).await.len(), 1);

        let busy = {
            let run = run.clone();
            tokio::spawn(async move {
                run.enqueue(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
                .expect("queued op");
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(runs.expired(Instant::now()).await.is_empty(), "busy runs are skipped");
        busy.await.expect("join");

        run.touch();
        assert!(runs.expired(Instant::now()).await.is_empty());
    }

    #[tokio::test]
    async fn removal_refuses_queued_work_and_frees_the_id() {
        let runs = RunManager::new();
        let run = runs
            .get_or_create("r1", "run-proxy-run-r1", Duration::from_secs(60))
            .await
            .expect("create");

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let in_flight = {
            let run = run.clone();
            tokio::spawn(async move {
                run.enqueue(async {
                    let _ = release_rx.await;
                    Ok("first")
                })
                .await
            })
        };
        let queued = {
            let run = run.clone();
            tokio::spawn(async move { run.enqueue(async { Ok("second") }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(runs.remove(&run).await);
        let _ = release_tx.send(());
        assert_eq!(in_flight.await.expect("join").expect("started before close"), "first");
        let refused = queued.await.expect("join").expect_err("queued behind close");
        assert!(matches!(refused, RuntimeError::RunClosed { .. }));

        let fresh = runs
            .get_or_create("r1", "run-proxy-run-r1", Duration::from_secs(60))
            .await
            .expect("recreate");
        assert!(!Arc::ptr_eq(&fresh, &run));
        assert!(!fresh.is_closed());
        assert!(!runs.remove(&run).await, "stale handle leaves the new run alone");
        assert_eq!(runs.len().await, 1);
    }
}
