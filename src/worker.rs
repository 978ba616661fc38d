//! Worker lifecycle
//!
//! One OS process per worker. The main loop is strictly serial: resolve the
//! queue list, reserve one envelope, hand it to a dedicated executor task,
//! supervise that task to completion, then iterate. Workers cooperating on
//! the same queues coordinate only through Redis list atomicity, so no
//! cross-worker locks exist.
//!
//! Shutdown is signal driven. `TERM` starts a graceful countdown that
//! escalates from a cooperative stop request to killing the executor; `INT`
//! kills immediately; `QUIT` lets the current job finish. `USR2`/`CONT`
//! pause and resume reservation, and `PIPE` re-establishes the Redis
//! connection.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{ResqError, ResqResult};
use crate::events::{Hook, HookEvent};
use crate::job::{Context, Job, Payload, Perform};
use crate::resolver;
use crate::stats;
use crate::status::{self, Status};
use crate::store::Store;

const HUMAN_TIME: &str = "%a %b %d %H:%M:%S %Z %Y";

/// Tunables consumed by the worker loop
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Seconds between reservation attempts; `0` drains once and exits
    pub interval: u64,
    /// Use a blocking multi-queue pop instead of polling each queue
    pub blocking: bool,
    /// Seconds between `TERM` and the first escalation step
    pub graceful_delay: u64,
    /// Ask the executor to stop cooperatively before killing it
    pub graceful_stop: bool,
    /// Seconds between the cooperative stop request and the kill
    pub graceful_delay_two: u64,
    /// Exit the loop when reservation hits a Redis failure
    pub shutdown_on_reserve_error: bool,
    /// Override the host component of the worker id
    pub hostname: Option<String>,
    /// Override the pid component of the worker id
    pub pid: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: 5,
            blocking: false,
            graceful_delay: 5,
            graceful_stop: false,
            graceful_delay_two: 2,
            shutdown_on_reserve_error: false,
            hostname: None,
            pid: None,
        }
    }
}

/// Wire form of the `worker:<id>` currently-processing record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingOn {
    pub queue: String,
    pub run_at: String,
    pub payload: Payload,
}

struct ExecutorHandle {
    abort: AbortHandle,
    stop: Arc<Notify>,
}

/// State shared between the loop, the signal listener, and escalation timers
struct Shared {
    shutdown: AtomicBool,
    paused: AtomicBool,
    executor: Mutex<Option<ExecutorHandle>>,
    procline: Mutex<String>,
}

impl Shared {
    fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            executor: Mutex::new(None),
            procline: Mutex::new(String::new()),
        }
    }

    fn set_procline(&self, line: String) {
        debug!("worker status: {}", line);
        *self.procline.lock().expect("procline lock poisoned") = line;
    }

    fn procline(&self) -> String {
        self.procline.lock().expect("procline lock poisoned").clone()
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Abort the running executor, if any
    fn kill_executor(&self) {
        let handle = self.executor.lock().expect("executor lock poisoned").take();
        match handle {
            Some(handle) => {
                warn!("killing the running job executor");
                handle.abort.abort();
            }
            None => debug!("no running executor to kill"),
        }
    }

    /// Ask the running executor to stop at its next await point
    fn request_executor_stop(&self) -> bool {
        let stop = self
            .executor
            .lock()
            .expect("executor lock poisoned")
            .as_ref()
            .map(|handle| handle.stop.clone());
        match stop {
            Some(stop) => {
                info!("requesting graceful stop of the running job");
                stop.notify_one();
                true
            }
            None => false,
        }
    }
}

/// The `TERM` countdown: wait, optionally ask nicely, then kill
async fn escalate(shared: Arc<Shared>, graceful_stop: bool, first: u64, second: u64) {
    sleep(Duration::from_secs(first)).await;
    if graceful_stop {
        if !shared.request_executor_stop() {
            // executor already finished; nothing to escalate against
            return;
        }
        sleep(Duration::from_secs(second)).await;
    }
    shared.kill_executor();
}

/// A supervising worker bound to a queue pattern
pub struct Worker {
    ctx: Context,
    config: WorkerConfig,
    pattern: Vec<String>,
    id: String,
    hostname: String,
    pid: u32,
    shared: Arc<Shared>,
    current: Mutex<Option<Job>>,
}

/// Split a worker id into host, pid and the comma-joined queue pattern.
///
/// Queue names may themselves contain colons, so only the first two are
/// structural.
pub fn parse_worker_id(id: &str) -> Option<(&str, u32, &str)> {
    let mut parts = id.splitn(3, ':');
    let host = parts.next()?;
    let pid = parts.next()?.parse().ok()?;
    let queues = parts.next()?;
    Some((host, pid, queues))
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn human_now() -> String {
    chrono::Utc::now().format(HUMAN_TIME).to_string()
}

impl Worker {
    /// Create a worker for a queue pattern.
    ///
    /// The worker id `<host>:<pid>:<queues>` is fixed here and stays stable
    /// for the worker's lifetime.
    pub fn new(ctx: Context, queues: Vec<String>, config: WorkerConfig) -> ResqResult<Self> {
        if queues.is_empty() {
            return Err(ResqError::config("worker needs at least one queue"));
        }
        let hostname = config.hostname.clone().unwrap_or_else(default_hostname);
        let pid = config.pid.unwrap_or_else(std::process::id);
        let id = format!("{}:{}:{}", hostname, pid, queues.join(","));

        Ok(Self {
            ctx,
            config,
            pattern: queues,
            id,
            hostname,
            pid,
            shared: Arc::new(Shared::new()),
            current: Mutex::new(None),
        })
    }

    /// The stable worker id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status line ("Waiting for…", "Processing…", …)
    pub fn procline(&self) -> String {
        self.shared.procline()
    }

    /// Stop reserving new jobs
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Resume reserving jobs
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Finish the current job, then exit the loop
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Exit the loop and kill the running executor
    pub fn shutdown_now(&self) {
        self.shared.request_shutdown();
        self.shared.kill_executor();
    }

    /// Ids of every registered worker
    pub async fn all(store: &Store) -> ResqResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(store.keys().workers());
        store.run(&cmd).await
    }

    /// Whether a worker id is currently registered
    pub async fn exists(store: &Store, id: &str) -> ResqResult<bool> {
        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(store.keys().workers()).arg(id);
        store.run(&cmd).await
    }

    /// What a worker is currently processing, if anything
    pub async fn processing(store: &Store, id: &str) -> ResqResult<Option<WorkingOn>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(store.keys().worker(id));
        let raw: Option<String> = store.run(&cmd).await?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    /// Announce this worker in the registry
    pub async fn register(&self) -> ResqResult<()> {
        let mut sadd = redis::cmd("SADD");
        sadd.arg(self.ctx.store.keys().workers()).arg(&self.id);
        self.ctx.store.run::<()>(&sadd).await?;

        let mut set = redis::cmd("SET");
        set.arg(self.ctx.store.keys().worker_started(&self.id))
            .arg(human_now());
        self.ctx.store.run::<()>(&set).await?;

        info!("registered worker {}", self.id);
        Ok(())
    }

    /// Remove this worker from the registry, failing any in-flight job
    pub async fn unregister(&self) -> ResqResult<()> {
        let in_flight = self.current.lock().expect("current-job lock poisoned").take();
        if let Some(mut job) = in_flight {
            let err = ResqError::dirty_exit(format!("worker {} shut down mid-job", self.id));
            if let Err(record_err) = job.fail(&err).await {
                error!("could not record in-flight job failure: {}", record_err);
            }
        }
        Self::unregister_id(&self.ctx.store, &self.id).await
    }

    /// Registry cleanup shared by shutdown and the pruner
    pub async fn unregister_id(store: &Store, id: &str) -> ResqResult<()> {
        let mut srem = redis::cmd("SREM");
        srem.arg(store.keys().workers()).arg(id);
        store.run::<()>(&srem).await?;

        let mut del = redis::cmd("DEL");
        del.arg(store.keys().worker(id))
            .arg(store.keys().worker_started(id));
        store.run::<()>(&del).await?;

        stats::clear(store, &format!("processed:{}", id)).await?;
        stats::clear(store, &format!("failed:{}", id)).await?;

        info!("unregistered worker {}", id);
        Ok(())
    }

    /// Record the job this worker is about to run
    pub async fn working_on(&self, job: &Job) -> ResqResult<()> {
        let record = WorkingOn {
            queue: job.queue.clone(),
            run_at: human_now(),
            payload: job.payload.clone(),
        };
        let json = serde_json::to_string(&record)?;

        let mut set = redis::cmd("SET");
        set.arg(self.ctx.store.keys().worker(&self.id)).arg(json);
        self.ctx.store.run::<()>(&set).await?;

        if let Some(job_id) = &job.payload.id {
            status::update(&self.ctx.store, job_id, Status::Running).await?;
        }
        Ok(())
    }

    /// Clear the currently-processing record and bump the processed counters
    pub async fn done_working(&self) -> ResqResult<()> {
        let mut del = redis::cmd("DEL");
        del.arg(self.ctx.store.keys().worker(&self.id));
        self.ctx.store.run::<()>(&del).await?;

        stats::incr(&self.ctx.store, "processed").await?;
        stats::incr(&self.ctx.store, &format!("processed:{}", self.id)).await?;
        Ok(())
    }

    /// Drop registry entries of same-host workers whose process is gone.
    ///
    /// Only this host's entries are considered, this process is never a
    /// candidate, and any pid present in the host process table is left
    /// alone. The process table, not Redis, is authoritative for liveness.
    pub async fn prune_dead_workers(&self) -> ResqResult<u64> {
        let ids = Self::all(&self.ctx.store).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let alive = local_pids().await?;

        let mut pruned = 0u64;
        for id in ids {
            let Some((host, pid, _)) = parse_worker_id(&id) else {
                warn!("skipping unparsable worker id {}", id);
                continue;
            };
            if host != self.hostname || pid == self.pid || alive.contains(&pid) {
                continue;
            }
            warn!("pruning dead worker {}", id);
            Self::unregister_id(&self.ctx.store, &id).await?;
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Run the worker until shutdown is requested.
    ///
    /// With `interval == 0` the loop drains the queues once and returns,
    /// which is the mode the test seeds use.
    pub async fn work(&self) -> ResqResult<()> {
        self.startup().await?;

        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if self.shared.paused.load(Ordering::SeqCst) {
                self.shared.set_procline("Paused".to_string());
                if self.config.interval == 0 {
                    break;
                }
                self.sleep_interruptibly().await;
                continue;
            }

            let reserved = match self.reserve().await {
                Ok(reserved) => reserved,
                Err(err) if err.is_redis_unavailable() => {
                    error!("reservation failed, redis unavailable: {}", err);
                    if self.config.shutdown_on_reserve_error {
                        self.shared.request_shutdown();
                        break;
                    }
                    self.sleep_interruptibly().await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(mut job) = reserved else {
                if self.config.interval == 0 {
                    break;
                }
                if !self.config.blocking {
                    self.shared
                        .set_procline(format!("Waiting for {}", self.pattern.join(",")));
                    self.sleep_interruptibly().await;
                }
                continue;
            };

            job.worker_id = Some(self.id.clone());
            info!("reserved {}", job.describe());
            self.ctx.events.fire(Hook::BeforeFork, &job.hook_event(None));

            self.working_on(&job).await?;
            *self.current.lock().expect("current-job lock poisoned") = Some(job.clone());

            let stop = Arc::new(Notify::new());
            let handle = tokio::spawn(run_job(job.clone(), stop.clone(), self.shared.clone()));
            *self.shared.executor.lock().expect("executor lock poisoned") =
                Some(ExecutorHandle {
                    abort: handle.abort_handle(),
                    stop,
                });
            self.shared
                .set_procline(format!("Forked executor for {} at {}", job.describe(), human_now()));

            // the waitpid of this model: the join only errors when the
            // executor was killed or panicked, and either way the job is dirty
            if let Err(join_err) = handle.await {
                let reason = if join_err.is_cancelled() {
                    "executor task was killed".to_string()
                } else {
                    format!("executor task panicked: {}", join_err)
                };
                let err = ResqError::dirty_exit(reason);
                error!("{} exited dirty: {}", job.describe(), err);
                if let Err(record_err) = job.fail(&err).await {
                    error!("could not record dirty exit: {}", record_err);
                }
            }
            self.shared
                .executor
                .lock()
                .expect("executor lock poisoned")
                .take();
            self.current
                .lock()
                .expect("current-job lock poisoned")
                .take();

            self.done_working().await?;
        }

        self.shared.set_procline("Exiting".to_string());
        self.unregister().await
    }

    async fn startup(&self) -> ResqResult<()> {
        self.shared.set_procline("Starting".to_string());
        self.install_signal_handlers()?;
        self.prune_dead_workers().await?;
        self.ctx
            .events
            .fire(Hook::BeforeFirstFork, &HookEvent::for_worker(&self.id));
        self.register().await
    }

    async fn reserve(&self) -> ResqResult<Option<Job>> {
        let queues = resolver::resolved_queues(&self.ctx.store, &self.pattern).await?;
        if queues.is_empty() {
            return Ok(None);
        }

        if self.config.blocking {
            self.shared
                .set_procline(format!("Blocking on {}", queues.join(",")));
            let mut job = Job::reserve_blocking(&self.ctx, &queues, self.config.interval).await?;
            if let Some(job) = job.as_mut() {
                debug!("found job on {} via blocking pop", job.queue);
            }
            Ok(job)
        } else {
            for queue in &queues {
                debug!("checking {}", queue);
                if let Some(job) = Job::reserve(&self.ctx, queue).await? {
                    return Ok(Some(job));
                }
            }
            Ok(None)
        }
    }

    fn install_signal_handlers(&self) -> ResqResult<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut term = signal(SignalKind::terminate())?;
            let mut int = signal(SignalKind::interrupt())?;
            let mut quit = signal(SignalKind::quit())?;
            let mut usr1 = signal(SignalKind::user_defined1())?;
            let mut usr2 = signal(SignalKind::user_defined2())?;
            let mut cont = signal(SignalKind::from_raw(libc::SIGCONT))?;
            let mut alrm = signal(SignalKind::alarm())?;
            let mut pipe = signal(SignalKind::pipe())?;

            let shared = self.shared.clone();
            let store = self.ctx.store.clone();
            let graceful_stop = self.config.graceful_stop;
            let first = self.config.graceful_delay;
            let second = self.config.graceful_delay_two;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = term.recv() => {
                            info!("SIGTERM: shutting down gracefully");
                            shared.request_shutdown();
                            tokio::spawn(escalate(shared.clone(), graceful_stop, first, second));
                        }
                        _ = int.recv() => {
                            info!("SIGINT: shutting down immediately");
                            shared.request_shutdown();
                            shared.kill_executor();
                        }
                        _ = quit.recv() => {
                            info!("SIGQUIT: finishing the current job, then exiting");
                            shared.request_shutdown();
                        }
                        _ = usr1.recv() => {
                            warn!("SIGUSR1: killing the running job");
                            shared.kill_executor();
                        }
                        _ = alrm.recv() => {
                            warn!("SIGALRM: killing the running job");
                            shared.kill_executor();
                        }
                        _ = usr2.recv() => {
                            info!("SIGUSR2: pausing");
                            shared.paused.store(true, Ordering::SeqCst);
                        }
                        _ = cont.recv() => {
                            info!("SIGCONT: resuming");
                            shared.paused.store(false, Ordering::SeqCst);
                        }
                        _ = pipe.recv() => {
                            warn!("SIGPIPE: reconnecting to redis");
                            if let Err(err) = store.reconnect().await {
                                error!("redis reconnect failed: {}", err);
                            }
                        }
                    }
                }
            });
        }
        Ok(())
    }

    /// Sleep for the poll interval, waking early on shutdown
    async fn sleep_interruptibly(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.interval);
        while !self.shared.shutdown.load(Ordering::SeqCst) {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let step = std::cmp::min(deadline - now, Duration::from_millis(200));
            sleep(step).await;
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("config", &self.config)
            .finish()
    }
}

/// Executor body: run one job to completion, trapping every failure.
///
/// The same wrapper semantics apply whether the job runs here or inline:
/// duration is recorded, success marks the status record complete, skips are
/// not failures, and any error is routed to the job's failure path instead
/// of propagating.
async fn run_job(mut job: Job, stop: Arc<Notify>, shared: Arc<Shared>) {
    shared.set_procline(format!("Processing {} since {}", job.queue, human_now()));
    job.fire_hook(Hook::AfterFork);

    let started = std::time::Instant::now();
    let outcome = tokio::select! {
        result = job.perform() => result,
        _ = stop.notified() => Err(ResqError::dirty_exit("graceful stop requested during execution")),
    };

    match outcome {
        Ok(Perform::Ran) => {
            if let Err(err) = job.update_status(Status::Complete).await {
                warn!("could not mark {} complete: {}", job.describe(), err);
            }
            info!("done {} in {:?}", job.describe(), started.elapsed());
        }
        Ok(Perform::Skipped) => {
            info!("skipped {}", job.describe());
        }
        Err(err) => {
            error!("{} failed: {}", job.describe(), err);
            if let Err(record_err) = job.fail(&err).await {
                error!("could not record failure: {}", record_err);
            }
        }
    }
}

/// Pids currently alive on this host.
///
/// Shells out to a portable `ps` invocation, falling back to `/proc` when
/// `ps` is unavailable.
async fn local_pids() -> ResqResult<HashSet<u32>> {
    if let Ok(output) = tokio::process::Command::new("ps")
        .args(["-A", "-o", "pid="])
        .output()
        .await
    {
        if output.status.success() {
            return Ok(parse_pid_lines(&String::from_utf8_lossy(&output.stdout)));
        }
    }

    let entries = std::fs::read_dir("/proc")?;
    let mut pids = HashSet::new();
    for entry in entries.flatten() {
        if let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            pids.insert(pid);
        }
    }
    Ok(pids)
}

fn parse_pid_lines(output: &str) -> HashSet<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.interval, 5);
        assert!(!config.blocking);
        assert_eq!(config.graceful_delay, 5);
        assert_eq!(config.graceful_delay_two, 2);
        assert!(!config.graceful_stop);
        assert!(!config.shutdown_on_reserve_error);
    }

    #[test]
    fn test_worker_id_parsing() {
        let (host, pid, queues) = parse_worker_id("web-3:4242:high,default,low").unwrap();
        assert_eq!(host, "web-3");
        assert_eq!(pid, 4242);
        assert_eq!(queues, "high,default,low");
    }

    #[test]
    fn test_worker_id_parsing_keeps_colons_in_queue_names() {
        let (host, pid, queues) = parse_worker_id("web-3:7:system:high,*:low").unwrap();
        assert_eq!(host, "web-3");
        assert_eq!(pid, 7);
        assert_eq!(queues, "system:high,*:low");
    }

    #[test]
    fn test_worker_id_parsing_rejects_garbage() {
        assert!(parse_worker_id("no-pid-here").is_none());
        assert!(parse_worker_id("host:notanumber:q").is_none());
    }

    #[test]
    fn test_parse_pid_lines() {
        let pids = parse_pid_lines("    1\n  213\n94211\n\n garbage\n");
        assert!(pids.contains(&1));
        assert!(pids.contains(&213));
        assert!(pids.contains(&94211));
        assert_eq!(pids.len(), 3);
    }

    #[test]
    fn test_working_on_wire_shape() {
        let record = WorkingOn {
            queue: "critical".to_string(),
            run_at: "Mon Jan 01 00:00:00 UTC 2024".to_string(),
            payload: Payload::new("Email::Send", None, Some("abc".to_string())),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["queue"], "critical");
        assert!(json.get("run_at").is_some());
        assert_eq!(json["payload"]["class"], "Email::Send");
    }
}
