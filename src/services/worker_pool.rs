//! Auto-scaling pool of OS-thread workers for CPU-bound tasks.
//!
//! A single supervisor task owns all pool state and is driven by commands,
//! worker reports and timeout expiries. Workers never touch shared state:
//! they receive one job at a time and report the outcome back.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, mpsc as std_mpsc},
    thread,
    time::Duration,
};

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tracing::{debug, error, info, warn};

use crate::{config::WorkerPoolConfig, dto::status::PoolStats};

/// Task type answered by every pool the binary builds; used by the health check.
pub const PING_TASK: &str = "ping";

/// Why a task produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The deadline, counted from submission, passed before a result arrived.
    #[error("task {task_id} exceeded its {after:?} timeout")]
    Timeout {
        /// Rejected task.
        task_id: u64,
        /// Timeout the task was submitted with.
        after: Duration,
    },
    /// The handler panicked; its worker thread was replaced.
    #[error("worker crashed while running task {task_id}: {message}")]
    Crashed {
        /// Task that was running.
        task_id: u64,
        /// Panic message.
        message: String,
    },
    /// The handler returned an error.
    #[error("task {task_id} failed: {message}")]
    Failed {
        /// Failed task.
        task_id: u64,
        /// Error returned by the handler.
        message: String,
    },
    /// No handler is registered under this name.
    #[error("no handler registered for task type `{0}`")]
    UnknownTaskType(String),
    /// The pool no longer accepts tasks.
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Value returned by a handler, or why there is none.
pub type TaskResult = Result<Value, WorkerError>;

/// CPU-bound work executed on a worker thread.
pub trait TaskHandler: Send + Sync + 'static {
    /// Run the task. An `Err` fails only this task.
    fn handle(&self, payload: Value) -> Result<Value, String>;
}

impl<F> TaskHandler for F
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
{
    fn handle(&self, payload: Value) -> Result<Value, String> {
        self(payload)
    }
}

/// Task handlers keyed by task type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `task_type`, replacing any previous one.
    pub fn register<H: TaskHandler>(&mut self, task_type: impl Into<String>, handler: H) -> &mut Self {
        self.handlers.insert(task_type.into(), Arc::new(handler));
        self
    }

    /// Builder form of [`Self::register`].
    pub fn with<H: TaskHandler>(mut self, task_type: impl Into<String>, handler: H) -> Self {
        self.register(task_type, handler);
        self
    }

    /// Registry containing only the `ping` echo task.
    pub fn with_ping(self) -> Self {
        self.with(PING_TASK, |payload: Value| -> Result<Value, String> { Ok(payload) })
    }

    /// Handler registered under `task_type`.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

enum Command {
    Execute {
        task_type: String,
        payload: Value,
        timeout: Duration,
        reply: oneshot::Sender<TaskResult>,
    },
    Stats(oneshot::Sender<PoolStats>),
    CullIdle,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the pool; clones share the same supervisor.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    default_timeout: Duration,
}

impl WorkerPool {
    /// Spawn the supervisor and the initial `min_workers` threads.
    pub fn start(config: WorkerPoolConfig, registry: HandlerRegistry) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let default_timeout = config.task_timeout();
        let supervisor = Supervisor::new(config, registry);
        tokio::spawn(supervisor.run(commands_rx));
        Self {
            commands,
            default_timeout,
        }
    }

    /// Run `task_type` with the configured timeout.
    pub async fn execute(&self, task_type: &str, payload: Value) -> TaskResult {
        self.execute_with_timeout(task_type, payload, self.default_timeout)
            .await
    }

    /// Run `task_type` and give up after `timeout`, queue time included.
    pub async fn execute_with_timeout(
        &self,
        task_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> TaskResult {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Execute {
                task_type: task_type.to_string(),
                payload,
                timeout,
                reply,
            })
            .map_err(|_| WorkerError::ShutDown)?;
        response.await.map_err(|_| WorkerError::ShutDown)?
    }

    /// Counters and current pool size.
    pub async fn stats(&self) -> Result<PoolStats, WorkerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stats(reply))
            .map_err(|_| WorkerError::ShutDown)?;
        response.await.map_err(|_| WorkerError::ShutDown)
    }

    /// Retire every idle worker above the minimum right away.
    pub fn cull_idle(&self) {
        let _ = self.commands.send(Command::CullIdle);
    }

    /// Reject queued and in-flight tasks and stop all workers.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

struct Job {
    task_id: u64,
    handler: Arc<dyn TaskHandler>,
    payload: Value,
}

enum Outcome {
    Completed(Value),
    Failed(String),
    Panicked(String),
}

struct Report {
    worker_id: u64,
    task_id: u64,
    outcome: Outcome,
}

/// Waiting task. Its deadline timer runs from submission, so time spent in
/// the queue counts against the timeout.
struct Queued {
    task_id: u64,
    handler: Arc<dyn TaskHandler>,
    payload: Value,
    timeout: Duration,
    reply: oneshot::Sender<TaskResult>,
    timer: JoinHandle<()>,
}

struct InFlight {
    task_id: u64,
    timeout: Duration,
    /// Taken when the task times out; a late result is then discarded.
    reply: Option<oneshot::Sender<TaskResult>>,
    started: Instant,
    timer: JoinHandle<()>,
}

impl InFlight {
    /// Still running a task whose caller was already told it timed out.
    fn is_stuck(&self) -> bool {
        self.reply.is_none()
    }
}

struct WorkerSlot {
    jobs: std_mpsc::Sender<Job>,
    busy: Option<InFlight>,
    task_count: u64,
    error_count: u32,
    last_active: Instant,
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    timed_out: u64,
    crashed: u64,
    processing: Duration,
}

struct Supervisor {
    config: WorkerPoolConfig,
    registry: HandlerRegistry,
    workers: IndexMap<u64, WorkerSlot>,
    queue: VecDeque<Queued>,
    counters: Counters,
    next_worker: u64,
    next_task: u64,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: mpsc::UnboundedReceiver<Report>,
    expiries_tx: mpsc::UnboundedSender<u64>,
    expiries_rx: mpsc::UnboundedReceiver<u64>,
}

impl Supervisor {
    fn new(config: WorkerPoolConfig, registry: HandlerRegistry) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (expiries_tx, expiries_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            workers: IndexMap::new(),
            queue: VecDeque::new(),
            counters: Counters::default(),
            next_worker: 1,
            next_task: 1,
            reports_tx,
            reports_rx,
            expiries_tx,
            expiries_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.replenish();
        info!(
            workers = self.workers.len(),
            max = self.config.max_workers,
            task_types = ?self.registry.task_types(),
            "worker pool started"
        );

        let mut maintenance = interval(self.config.maintenance_interval());
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        maintenance.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Execute { task_type, payload, timeout, reply }) => {
                        self.submit(&task_type, payload, timeout, reply);
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::CullIdle) => self.cull_idle(true),
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(report) = self.reports_rx.recv() => self.handle_report(report),
                Some(task_id) = self.expiries_rx.recv() => self.handle_expiry(task_id),
                _ = maintenance.tick() => self.cull_idle(false),
            }
        }
        info!("worker pool stopped");
    }

    fn submit(
        &mut self,
        task_type: &str,
        payload: Value,
        timeout: Duration,
        reply: oneshot::Sender<TaskResult>,
    ) {
        let Some(handler) = self.registry.get(task_type) else {
            let _ = reply.send(Err(WorkerError::UnknownTaskType(task_type.to_string())));
            return;
        };
        let task_id = self.next_task;
        self.next_task += 1;
        let expiries = self.expiries_tx.clone();
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            let _ = expiries.send(task_id);
        });
        self.queue.push_back(Queued {
            task_id,
            handler,
            payload,
            timeout,
            reply,
            timer,
        });
        self.pump();
    }

    /// Hand queued tasks to idle workers, growing the pool up to the maximum.
    /// Workers stuck on a timed-out task do not count toward the maximum.
    fn pump(&mut self) {
        while let Some(queued) = self.queue.pop_front() {
            let worker_id = match self.idle_worker() {
                Some(id) => id,
                None if self.serving_workers() < self.config.max_workers => {
                    match self.spawn_worker() {
                        Some(id) => id,
                        None => {
                            self.queue.push_front(queued);
                            break;
                        }
                    }
                }
                None => {
                    self.queue.push_front(queued);
                    break;
                }
            };
            if let Err(queued) = self.dispatch(worker_id, queued) {
                self.queue.push_front(queued);
                break;
            }
        }
    }

    fn serving_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|slot| !slot.busy.as_ref().is_some_and(InFlight::is_stuck))
            .count()
    }

    fn idle_worker(&self) -> Option<u64> {
        self.workers
            .iter()
            .find(|(_, slot)| slot.busy.is_none())
            .map(|(id, _)| *id)
    }

    fn dispatch(&mut self, worker_id: u64, queued: Queued) -> Result<(), Queued> {
        let Queued {
            task_id,
            handler,
            payload,
            timeout,
            reply,
            timer,
        } = queued;
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            return Err(Queued {
                task_id,
                handler,
                payload,
                timeout,
                reply,
                timer,
            });
        };

        if let Err(std_mpsc::SendError(job)) = slot.jobs.send(Job {
            task_id,
            handler,
            payload,
        }) {
            warn!(worker = worker_id, "worker thread gone; replacing");
            self.workers.shift_remove(&worker_id);
            self.counters.crashed += 1;
            self.replenish();
            return Err(Queued {
                task_id,
                handler: job.handler,
                payload: job.payload,
                timeout,
                reply,
                timer,
            });
        }

        slot.busy = Some(InFlight {
            task_id,
            timeout,
            reply: Some(reply),
            started: Instant::now(),
            timer,
        });
        debug!(worker = worker_id, task = task_id, "task dispatched");
        Ok(())
    }

    fn handle_report(&mut self, report: Report) {
        let Report {
            worker_id,
            task_id,
            outcome,
        } = report;
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            debug!(worker = worker_id, task = task_id, "report from retired worker discarded");
            return;
        };
        let in_flight = match slot.busy.take() {
            Some(in_flight) if in_flight.task_id == task_id => in_flight,
            other => {
                slot.busy = other;
                return;
            }
        };
        in_flight.timer.abort();
        slot.task_count += 1;
        slot.last_active = Instant::now();

        let crashed = matches!(outcome, Outcome::Panicked(_));
        match (outcome, in_flight.reply) {
            (Outcome::Completed(value), Some(reply)) => {
                self.counters.completed += 1;
                self.counters.processing += in_flight.started.elapsed();
                let _ = reply.send(Ok(value));
            }
            (Outcome::Failed(message), Some(reply)) => {
                self.counters.failed += 1;
                let _ = reply.send(Err(WorkerError::Failed { task_id, message }));
            }
            (Outcome::Panicked(message), reply) => {
                self.counters.crashed += 1;
                self.counters.failed += 1;
                error!(worker = worker_id, task = task_id, %message, "worker crashed");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(WorkerError::Crashed { task_id, message }));
                }
            }
            (_, None) => {
                debug!(worker = worker_id, task = task_id, "late result after timeout discarded");
            }
        }

        if crashed {
            self.workers.shift_remove(&worker_id);
            self.replenish();
        } else if self.workers.len() > self.config.max_workers {
            // A replacement was spawned while this worker was stuck.
            self.workers.shift_remove(&worker_id);
            debug!(worker = worker_id, "surplus worker retired after late result");
        }
        self.pump();
    }

    fn handle_expiry(&mut self, task_id: u64) {
        if let Some(position) = self.queue.iter().position(|queued| queued.task_id == task_id) {
            if let Some(queued) = self.queue.remove(position) {
                let _ = queued.reply.send(Err(WorkerError::Timeout {
                    task_id,
                    after: queued.timeout,
                }));
                self.counters.timed_out += 1;
                warn!(task = task_id, "task timed out before reaching a worker");
            }
            return;
        }

        let Some((&worker_id, slot)) = self.workers.iter_mut().find(|(_, slot)| {
            slot.busy
                .as_ref()
                .is_some_and(|in_flight| in_flight.task_id == task_id)
        }) else {
            return;
        };
        let Some(reply) = slot.busy.as_mut().and_then(|in_flight| in_flight.reply.take()) else {
            return;
        };

        let timeout = slot
            .busy
            .as_ref()
            .map(|in_flight| in_flight.timeout)
            .unwrap_or_default();
        let _ = reply.send(Err(WorkerError::Timeout {
            task_id,
            after: timeout,
        }));
        self.counters.timed_out += 1;
        slot.error_count += 1;
        warn!(worker = worker_id, task = task_id, errors = slot.error_count, "task timed out");

        if slot.error_count > self.config.error_threshold {
            warn!(worker = worker_id, "worker exceeded error threshold; retiring");
            // The thread exits once its current job returns and it sees the
            // closed job channel.
            self.workers.shift_remove(&worker_id);
            self.replenish();
        }
        self.pump();
    }

    fn spawn_worker(&mut self) -> Option<u64> {
        let worker_id = self.next_worker;
        let (jobs, jobs_rx) = std_mpsc::channel();
        let reports = self.reports_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("pool-worker-{worker_id}"))
            .spawn(move || worker_loop(worker_id, jobs_rx, reports));
        if let Err(err) = spawned {
            error!(error = %err, "failed to spawn worker thread");
            return None;
        }

        self.next_worker += 1;
        self.workers.insert(
            worker_id,
            WorkerSlot {
                jobs,
                busy: None,
                task_count: 0,
                error_count: 0,
                last_active: Instant::now(),
            },
        );
        debug!(worker = worker_id, workers = self.workers.len(), "worker spawned");
        Some(worker_id)
    }

    fn replenish(&mut self) {
        while self.workers.len() < self.config.min_workers {
            if self.spawn_worker().is_none() {
                break;
            }
        }
    }

    /// Retire idle workers above the minimum; with `force`, regardless of how
    /// long they have been idle.
    fn cull_idle(&mut self, force: bool) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut idle: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, slot)| {
                slot.busy.is_none()
                    && (force || now.saturating_duration_since(slot.last_active) >= idle_timeout)
            })
            .map(|(id, _)| *id)
            .collect();

        let surplus = self.workers.len().saturating_sub(self.config.min_workers);
        idle.truncate(surplus);
        for worker_id in &idle {
            if let Some(slot) = self.workers.shift_remove(worker_id) {
                debug!(worker = worker_id, tasks = slot.task_count, "idle worker culled");
            }
        }
        if !idle.is_empty() {
            info!(culled = idle.len(), workers = self.workers.len(), "worker pool shrunk");
        }
        self.pump();
    }

    fn stats(&self) -> PoolStats {
        let completed = self.counters.completed;
        PoolStats {
            workers: self.workers.len(),
            busy: self
                .workers
                .values()
                .filter(|slot| slot.busy.is_some())
                .count(),
            queued: self.queue.len(),
            completed,
            failed: self.counters.failed,
            timed_out: self.counters.timed_out,
            crashed: self.counters.crashed,
            avg_processing_ms: if completed == 0 {
                0.0
            } else {
                self.counters.processing.as_secs_f64() * 1_000.0 / completed as f64
            },
        }
    }

    fn shutdown(&mut self) {
        for queued in self.queue.drain(..) {
            queued.timer.abort();
            let _ = queued.reply.send(Err(WorkerError::ShutDown));
        }
        for (_, slot) in self.workers.drain(..) {
            if let Some(in_flight) = slot.busy {
                in_flight.timer.abort();
                if let Some(reply) = in_flight.reply {
                    let _ = reply.send(Err(WorkerError::ShutDown));
                }
            }
        }
    }
}

fn worker_loop(
    worker_id: u64,
    jobs: std_mpsc::Receiver<Job>,
    reports: mpsc::UnboundedSender<Report>,
) {
    while let Ok(Job {
        task_id,
        handler,
        payload,
    }) = jobs.recv()
    {
        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.handle(payload))) {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(message)) => Outcome::Failed(message),
            Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
        };
        let crashed = matches!(outcome, Outcome::Panicked(_));
        let delivered = reports
            .send(Report {
                worker_id,
                task_id,
                outcome,
            })
            .is_ok();
        if crashed || !delivered {
            break;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config(min_workers: usize, max_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers,
            max_workers,
            task_timeout_ms: 2_000,
            error_threshold: 3,
            idle_timeout_secs: 60,
            maintenance_interval_secs: 60,
        }
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .with_ping()
            .with("sleep", |payload: Value| -> Result<Value, String> {
                let ms = payload["ms"].as_u64().unwrap_or(0);
                thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "slept": ms }))
            })
            .with("fail", |_payload: Value| -> Result<Value, String> {
                Err("bad input".to_string())
            })
            .with("crash", |_payload: Value| -> Result<Value, String> {
                panic!("evaluator blew up")
            })
    }

    #[tokio::test]
    async fn executes_registered_task() {
        let pool = WorkerPool::start(config(1, 2), registry());
        let result = pool.execute(PING_TASK, json!({ "n": 7 })).await;
        assert_eq!(result, Ok(json!({ "n": 7 })));

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.workers, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_task_type_is_rejected() {
        let pool = WorkerPool::start(config(1, 1), registry());
        assert_eq!(
            pool.execute("rank", Value::Null).await,
            Err(WorkerError::UnknownTaskType("rank".into()))
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn handler_error_fails_only_that_task() {
        let pool = WorkerPool::start(config(1, 1), registry());
        assert!(matches!(
            pool.execute("fail", Value::Null).await,
            Err(WorkerError::Failed { ref message, .. }) if message == "bad input"
        ));
        assert!(pool.execute(PING_TASK, Value::Null).await.is_ok());

        let stats = pool.stats().await.unwrap();
        assert_eq!((stats.failed, stats.completed, stats.workers), (1, 1, 1));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_rejects_only_the_slow_task() {
        let pool = WorkerPool::start(config(2, 2), registry());

        let slow = pool.execute_with_timeout("sleep", json!({ "ms": 400 }), Duration::from_millis(50));
        let fast = pool.execute_with_timeout("sleep", json!({ "ms": 10 }), Duration::from_secs(2));
        let (slow, fast) = tokio::join!(slow, fast);

        assert!(matches!(slow, Err(WorkerError::Timeout { .. })));
        assert_eq!(fast, Ok(json!({ "slept": 10 })));

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 1);

        sleep(Duration::from_millis(500)).await;
        assert!(pool.execute(PING_TASK, Value::Null).await.is_ok());
        assert_eq!(pool.stats().await.unwrap().busy, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn crashed_worker_is_replaced() {
        let pool = WorkerPool::start(config(2, 2), registry());
        assert!(matches!(
            pool.execute("crash", Value::Null).await,
            Err(WorkerError::Crashed { .. })
        ));

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.crashed, 1);
        assert!(pool.execute(PING_TASK, Value::Null).await.is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn worker_over_error_threshold_is_retired() {
        let mut cfg = config(1, 1);
        cfg.error_threshold = 0;
        let pool = WorkerPool::start(cfg, registry());

        let slow = pool
            .execute_with_timeout("sleep", json!({ "ms": 1_000 }), Duration::from_millis(20))
            .await;
        assert!(matches!(slow, Err(WorkerError::Timeout { .. })));

        // The replacement serves immediately while the stuck thread finishes.
        let fast = pool
            .execute_with_timeout(PING_TASK, Value::Null, Duration::from_millis(500))
            .await;
        assert!(fast.is_ok());
        assert_eq!(pool.stats().await.unwrap().workers, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn stuck_worker_does_not_block_later_tasks() {
        let pool = WorkerPool::start(config(1, 1), registry());

        let hung = pool
            .execute_with_timeout("sleep", json!({ "ms": 1_500 }), Duration::from_millis(50))
            .await;
        assert!(matches!(
            hung,
            Err(WorkerError::Timeout { after, .. }) if after == Duration::from_millis(50)
        ));

        let started = Instant::now();
        let ping = pool
            .execute_with_timeout(PING_TASK, Value::Null, Duration::from_millis(300))
            .await;
        assert!(ping.is_ok());
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(pool.stats().await.unwrap().workers, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn queued_task_times_out_while_waiting() {
        let pool = WorkerPool::start(config(1, 1), registry());
        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.execute("sleep", json!({ "ms": 600 })).await }
        });
        sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let waiting = pool
            .execute_with_timeout(PING_TASK, Value::Null, Duration::from_millis(100))
            .await;
        assert!(matches!(waiting, Err(WorkerError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(400));

        let stats = pool.stats().await.unwrap();
        assert_eq!((stats.queued, stats.timed_out), (0, 1));
        assert_eq!(running.await.unwrap(), Ok(json!({ "slept": 600 })));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn tasks_queue_when_pool_is_saturated() {
        let pool = WorkerPool::start(config(1, 1), registry());
        let results = futures::future::join_all(
            (0..3).map(|_| pool.execute("sleep", json!({ "ms": 20 }))),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        let stats = pool.stats().await.unwrap();
        assert_eq!((stats.workers, stats.completed, stats.queued), (1, 3, 0));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn pool_grows_to_max_and_culls_back_to_min() {
        let pool = WorkerPool::start(config(1, 3), registry());
        let results = futures::future::join_all(
            (0..3).map(|_| pool.execute("sleep", json!({ "ms": 100 }))),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(pool.stats().await.unwrap().workers, 3);

        pool.cull_idle();
        assert_eq!(pool.stats().await.unwrap().workers, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_and_in_flight_tasks() {
        let pool = WorkerPool::start(config(1, 1), registry());
        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.execute("sleep", json!({ "ms": 300 })).await }
        });
        let queued = tokio::spawn({
            let pool = pool.clone();
            async move { pool.execute("sleep", json!({ "ms": 300 })).await }
        });
        sleep(Duration::from_millis(50)).await;

        pool.shutdown().await;
        assert_eq!(running.await.unwrap(), Err(WorkerError::ShutDown));
        assert_eq!(queued.await.unwrap(), Err(WorkerError::ShutDown));
        assert_eq!(pool.execute(PING_TASK, Value::Null).await, Err(WorkerError::ShutDown));
        assert!(pool.stats().await.is_err());
    }
}
