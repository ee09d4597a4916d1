//! Coordinator: schedules runnable steps across a worker pool, enforces
//! dependency semantics, maintains per-step status, drives listeners, and
//! supports reset/range-run.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tracing::{info, warn};

use crate::error::CoordinatorError;
use crate::flow::ProcessFlow;
use crate::listener::Listener;
use crate::model::{NodeKind, Status};
use crate::processor::{self, ProcessorConfig};
use crate::record::{StatusEvent, StatusRecord};

/// Fan-out listener: registered listeners are invoked directly from worker
/// tasks (per the concurrency model), serialized by an internal lock so
/// that any two listener calls never interleave mid-callback.
#[derive(Default)]
pub struct ListenerHub {
    listeners: std::sync::Mutex<Vec<Arc<dyn Listener>>>,
}

impl ListenerHub {
    pub fn add(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Removes listeners pointer-equal to `listener`.
    pub fn remove(&self, listener: &Arc<dyn Listener>) {
        let target = Arc::as_ptr(listener);
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| Arc::as_ptr(l) != target);
    }
}

impl Listener for ListenerHub {
    fn on_start(&self, step: &str, command: &str) {
        for l in self.listeners.lock().unwrap().iter() {
            l.on_start(step, command);
        }
    }

    fn on_output(&self, step: &str, line: &str) {
        for l in self.listeners.lock().unwrap().iter() {
            l.on_output(step, line);
        }
    }

    fn on_completion(&self, step: &str, status: Status) {
        for l in self.listeners.lock().unwrap().iter() {
            l.on_completion(step, status);
        }
    }

    fn on_aborted(&self) {
        for l in self.listeners.lock().unwrap().iter() {
            l.on_aborted();
        }
    }
}

struct Inner {
    status: HashMap<NodeIndex, Status>,
    /// Nodes marked SKIPPED because they fell outside an active subgraph on
    /// a range-run reset, as opposed to being doomed by a failed prereq.
    skipped_outside: HashSet<NodeIndex>,
    /// When each currently dispatched step started running, so a completion
    /// event can report `duration_ms`.
    dispatched_at: HashMap<NodeIndex, Instant>,
    halt_on_error: bool,
    halted: bool,
    record: StatusRecord,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    exit_code: Option<i32>,
}

enum Completion {
    Finished { idx: NodeIndex, status: Status },
}

/// The scheduler. Owns the compiled flow, per-step status, a worker pool,
/// and the listener fan-out.
pub struct Coordinator {
    flow: Arc<ProcessFlow>,
    inner: Mutex<Inner>,
    hub: Arc<ListenerHub>,
    processor_config: ProcessorConfig,
    log_dir: PathBuf,
    record_path: PathBuf,
    permits: Arc<Semaphore>,
    done: Notify,
    run_id: String,
}

impl Coordinator {
    pub fn new(
        flow: ProcessFlow,
        log_dir: PathBuf,
        workers: usize,
        processor_config: ProcessorConfig,
    ) -> Result<Arc<Self>, CoordinatorError> {
        std::fs::create_dir_all(&log_dir).map_err(|source| CoordinatorError::LogFile {
            step: "<log_dir>".into(),
            source,
        })?;
        let record_path = log_dir.join("status.record");
        let record = StatusRecord::open(&record_path)?;

        let status = flow.steps().map(|idx| (idx, Status::Waiting)).collect();

        Ok(Arc::new(Coordinator {
            flow: Arc::new(flow),
            inner: Mutex::new(Inner {
                status,
                skipped_outside: HashSet::new(),
                dispatched_at: HashMap::new(),
                halt_on_error: false,
                halted: false,
                record,
                started_at: None,
                finished_at: None,
                exit_code: None,
            }),
            hub: Arc::new(ListenerHub::default()),
            processor_config,
            log_dir,
            record_path,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            done: Notify::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }))
    }

    /// Unique identifier for this coordinator's lifetime, for correlating
    /// log lines across a single run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn flow(&self) -> &ProcessFlow {
        &self.flow
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.hub.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.hub.remove(listener);
    }

    pub async fn set_halt_on_error(&self, halt: bool) {
        self.inner.lock().await.halt_on_error = halt;
    }

    /// Resets every step to WAITING and truncates the status record.
    pub async fn reset(&self) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;
        inner.record.truncate()?;
        inner.skipped_outside.clear();
        inner.halted = false;
        inner.started_at = None;
        inner.finished_at = None;
        inner.exit_code = None;
        for idx in self.flow.steps() {
            inner.status.insert(idx, Status::Waiting);
        }
        Ok(())
    }

    /// Resets steps in `subgraph(from, to)` to WAITING and every other step
    /// to SKIPPED, recording that they were skipped for being outside the
    /// active subgraph (not for a failed prerequisite).
    pub async fn reset_range(&self, from: &[String], to: &[String]) -> Result<(), CoordinatorError> {
        let active = self
            .flow
            .subgraph(from, to)
            .map_err(|e| CoordinatorError::UnknownStep(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        inner.record.truncate()?;
        inner.skipped_outside.clear();
        inner.halted = false;
        inner.started_at = None;
        inner.finished_at = None;
        inner.exit_code = None;

        for idx in self.flow.steps() {
            if active.contains(&idx) {
                inner.status.insert(idx, Status::Waiting);
            } else {
                inner.status.insert(idx, Status::Skipped);
                inner.skipped_outside.insert(idx);
            }
        }
        Ok(())
    }

    pub async fn get_status(&self, name: &str) -> Option<Status> {
        let idx = self.flow.index_of(name)?;
        let inner = self.inner.lock().await;
        Some(self.status_of(idx, &inner.status))
    }

    pub fn get_steps(&self) -> Vec<String> {
        self.flow.steps().map(|idx| self.flow.node(idx).name.clone()).collect()
    }

    pub async fn duration(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        let start = inner.started_at?;
        Some(inner.finished_at.unwrap_or_else(Instant::now) - start)
    }

    pub async fn get_records(&self) -> Result<Vec<StatusEvent>, CoordinatorError> {
        StatusRecord::read_all(&self.record_path)
    }

    pub async fn get_failed_records(&self) -> Result<Vec<StatusEvent>, CoordinatorError> {
        StatusRecord::read_failed(&self.record_path)
    }

    /// Begins scheduling; returns immediately. The returned handle resolves
    /// when the run finishes, mirroring `waitFor` from the design.
    pub fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.inner.lock().await.started_at.get_or_insert_with(Instant::now);
            info!(run_id = %coordinator.run_id, "starting run");

            let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
            coordinator.dispatch(&tx).await;

            if !coordinator.all_terminal().await {
                while let Some(msg) = rx.recv().await {
                    let Completion::Finished { idx, status } = msg;
                    coordinator.apply_completion(idx, status).await;
                    coordinator.dispatch(&tx).await;
                    if coordinator.all_terminal().await {
                        break;
                    }
                }
            }

            coordinator.finish().await;
        });
    }

    async fn finish(&self) {
        let mut inner = self.inner.lock().await;
        inner.finished_at = Some(Instant::now());
        let any_failed = self
            .flow
            .steps()
            .filter(|&idx| !self.flow.node(idx).is_group())
            .any(|idx| matches!(inner.status.get(&idx), Some(Status::Failed)));
        inner.exit_code = Some(if any_failed { 1 } else { 0 });
        let exit_code = inner.exit_code;
        drop(inner);
        info!(run_id = %self.run_id, exit_code = ?exit_code, "run finished");
        self.done.notify_waiters();
    }

    /// Blocks until every step is terminal; returns the exit code.
    pub async fn wait_for(&self) -> i32 {
        loop {
            // Register interest before checking state: `Notify::notified()`
            // only wakes futures that already exist at the time of
            // `notify_waiters()`, so checking-then-subscribing would miss a
            // finish() that lands in between.
            let notified = self.done.notified();
            {
                let inner = self.inner.lock().await;
                if let Some(code) = inner.exit_code {
                    return code;
                }
            }
            notified.await;
        }
    }

    async fn all_terminal(&self) -> bool {
        let inner = self.inner.lock().await;
        self.flow.steps().all(|idx| {
            !self.flow.node(idx).is_group() && {
                let s = inner.status.get(&idx).copied().unwrap_or(Status::Waiting);
                s.is_terminal()
            }
        })
    }

    /// Derives a node's status: atomic nodes read the map directly; group
    /// nodes are computed from their children, worst-case precedence.
    fn status_of(&self, idx: NodeIndex, status: &HashMap<NodeIndex, Status>) -> Status {
        match &self.flow.node(idx).kind {
            NodeKind::Atomic(_) => status.get(&idx).copied().unwrap_or(Status::Waiting),
            NodeKind::Composite { children } => {
                if children.is_empty() {
                    return Status::Succeeded;
                }
                let mut all_terminal = true;
                let mut any_in_progress = false;
                let mut worst = Status::Succeeded;
                for &child in children {
                    let s = self.status_of(child, status);
                    if !s.is_terminal() {
                        all_terminal = false;
                    }
                    if matches!(s, Status::InProgress) {
                        any_in_progress = true;
                    }
                    worst = Status::worst_of(worst, s);
                }
                if all_terminal {
                    worst
                } else if any_in_progress {
                    Status::InProgress
                } else {
                    Status::Waiting
                }
            }
        }
    }

    /// Repeatedly scans for doomed/dispatchable steps until a pass finds no
    /// new skips: a skip can itself doom a dependent (P3), so the cascade
    /// must settle synchronously before we go back to waiting on a worker
    /// completion.
    async fn dispatch(self: &Arc<Self>, tx: &mpsc::UnboundedSender<Completion>) {
        loop {
            let (to_spawn, to_skip) = self.scan().await;

            for idx in &to_skip {
                self.skip_step(*idx).await;
            }
            for idx in &to_spawn {
                self.spawn_step(*idx, tx.clone()).await;
            }

            if to_skip.is_empty() {
                break;
            }
        }
    }

    /// One read-only scan over currently WAITING atomic steps, returning
    /// those ready to spawn and those doomed to SKIPPED.
    async fn scan(&self) -> (Vec<NodeIndex>, Vec<NodeIndex>) {
        let mut to_spawn = Vec::new();
        let mut to_skip = Vec::new();

        let inner = self.inner.lock().await;
        let mut waiting: Vec<NodeIndex> = self
            .flow
            .steps()
            .filter(|&idx| {
                !self.flow.node(idx).is_group()
                    && inner.status.get(&idx).copied().unwrap_or(Status::Waiting) == Status::Waiting
            })
            .collect();
        waiting.sort_by_key(|&idx| self.flow.node(idx).declaration_order);

        for idx in waiting {
            if inner.halted {
                to_skip.push(idx);
                continue;
            }

            let prereqs = self.flow.prerequisites(idx);
            let mut doomed = false;
            let mut dispatchable = true;
            for (prereq_idx, dep) in &prereqs {
                let prereq_status = self.status_of(*prereq_idx, &inner.status);
                if dep.soft {
                    if !prereq_status.is_terminal() {
                        dispatchable = false;
                    }
                } else {
                    let ok = prereq_status == Status::Succeeded
                        || (prereq_status == Status::Skipped && inner.skipped_outside.contains(prereq_idx));
                    if !ok {
                        dispatchable = false;
                    }
                    // A hard prerequisite that finished anything other than
                    // SUCCEEDED (or an outside-subgraph SKIPPED) dooms this
                    // step, per P3 — not only an outright FAILED prereq.
                    if prereq_status.is_terminal() && !ok {
                        doomed = true;
                    }
                }
            }

            if doomed {
                to_skip.push(idx);
            } else if dispatchable {
                to_spawn.push(idx);
            }
        }

        (to_spawn, to_skip)
    }

    async fn skip_step(&self, idx: NodeIndex) {
        let name = self.flow.node(idx).name.clone();
        let command = self.flow.node(idx).as_step().map(|s| s.command.clone());
        {
            let mut inner = self.inner.lock().await;
            inner.status.insert(idx, Status::Skipped);
            let _ = inner.record.append(&StatusEvent::now(name.clone(), Status::Skipped, command));
        }
        self.hub.on_completion(&name, Status::Skipped);
    }

    async fn spawn_step(self: &Arc<Self>, idx: NodeIndex, tx: mpsc::UnboundedSender<Completion>) {
        {
            let mut inner = self.inner.lock().await;
            inner.status.insert(idx, Status::InProgress);
            inner.dispatched_at.insert(idx, Instant::now());
            let step = self.flow.node(idx).as_step().cloned();
            if let Some(step) = &step {
                let _ = inner
                    .record
                    .append(&StatusEvent::now(step.name.clone(), Status::InProgress, Some(step.command.clone())));
            }
        }

        let coordinator = Arc::clone(self);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.expect("semaphore never closed");
            let status = coordinator.run_step(idx).await;
            let _ = tx.send(Completion::Finished { idx, status });
        });
    }

    async fn run_step(&self, idx: NodeIndex) -> Status {
        let step = match self.flow.node(idx).as_step() {
            Some(step) => step.clone(),
            None => return Status::Succeeded,
        };

        if let Some(predicate) = &step.if_predicate {
            match processor::run_predicate(predicate, step.cwd.as_deref(), &self.processor_config).await {
                Ok(true) => {}
                Ok(false) => return Status::Skipped,
                Err(e) => {
                    warn!(step = %step.name, error = %e, "failed to evaluate 'if' predicate");
                    return Status::Skipped;
                }
            }
        }
        if let Some(predicate) = &step.unless_predicate {
            match processor::run_predicate(predicate, step.cwd.as_deref(), &self.processor_config).await {
                Ok(false) => {}
                Ok(true) => return Status::Skipped,
                Err(e) => {
                    warn!(step = %step.name, error = %e, "failed to evaluate 'unless' predicate");
                    return Status::Skipped;
                }
            }
        }

        let log_path = processor::log_path(&self.log_dir, &step.name);
        let listener: Arc<dyn Listener> = self.hub.clone();
        match processor::run_step(
            &step.name,
            &step.command,
            step.cwd.as_deref(),
            &step.env,
            step.delay_seconds,
            &self.processor_config,
            &log_path,
            &listener,
        )
        .await
        {
            Ok(outcome) => outcome.status,
            Err(e) => {
                warn!(step = %step.name, error = %e, "failed to spawn step");
                Status::Failed
            }
        }
    }

    async fn apply_completion(&self, idx: NodeIndex, status: Status) {
        let name = self.flow.node(idx).name.clone();
        let command = self.flow.node(idx).as_step().map(|s| s.command.clone());
        let mut inner = self.inner.lock().await;
        inner.status.insert(idx, status);
        let mut event = StatusEvent::now(name.clone(), status, command);
        if let Some(started) = inner.dispatched_at.remove(&idx) {
            event = event.with_duration(started.elapsed().as_millis() as i64);
        }
        let _ = inner.record.append(&event);

        if matches!(status, Status::Failed) && inner.halt_on_error {
            inner.halted = true;
        }
        info!(step = %name, %status, "step completed");
    }

    /// Triggers the abort sequence: stop new dispatch, mark every signaled
    /// `IN_PROGRESS` step `FAILED` and every still-`WAITING` step `SKIPPED`
    /// (per §5(d)/§7: a running step is signaled and counted as failed, a
    /// pending one never ran at all), notify listeners.
    pub async fn abort(&self) {
        let mut inner = self.inner.lock().await;
        inner.halted = true;
        for idx in self.flow.steps() {
            if self.flow.node(idx).is_group() {
                continue;
            }
            let current = inner.status.get(&idx).copied().unwrap_or(Status::Waiting);
            let forced = match current {
                Status::InProgress => Some(Status::Failed),
                Status::Waiting => Some(Status::Skipped),
                _ => None,
            };
            if let Some(forced) = forced {
                inner.status.insert(idx, forced);
                let name = self.flow.node(idx).name.clone();
                let command = self.flow.node(idx).as_step().map(|s| s.command.clone());
                let mut event = StatusEvent::now(name, forced, command);
                if let Some(started) = inner.dispatched_at.remove(&idx) {
                    event = event.with_duration(started.elapsed().as_millis() as i64);
                }
                let _ = inner.record.append(&event);
            }
        }
        inner.finished_at = Some(Instant::now());
        inner.exit_code = Some(1);
        drop(inner);
        self.hub.on_aborted();
        self.done.notify_waiters();
    }
}

/// Convenience constructor mirroring the default worker-pool sizing rule:
/// number of logical CPUs.
pub fn default_worker_count() -> usize {
    num_cpus::get()
}
