//! The scheduler: sole owner of the catalog and of every running worker.
//!
//! Each turn of [`Scheduler::run`]:
//!
//! 1. wait up to `poll_interval` for one control request and answer it;
//! 2. reap exited workers, committing or discarding what they left;
//! 3. launch a worker for every due `(node, path)` without one.
//!
//! Any error escaping steps 2-3 is fatal: every live worker is terminated
//! and the error is returned.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};

use backup_core::digest::sha256_file;
use backup_core::{DiskCatalog, FinishedTask, TaskKey};
use backup_wire::{ControlRequest, ControlResponse};

use crate::command::{self, Command};
use crate::config::DEFAULT_POLL_INTERVAL;
use crate::error::{io_err, CoordinatorError};
use crate::launcher::{WorkerHandle, WorkerLauncher};
use crate::paths::{self, ArchiveNamer};
use crate::sentinel::{
    classify, is_sentinel, remove_if_exists, sentinel_path, Sentinel, SentinelProbe,
    WorkerOutcome,
};
use crate::worker::WorkerJob;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// A control request travelling from the control server to the scheduler.
#[derive(Debug)]
pub struct ControlEnvelope {
    pub request: ControlRequest,
    pub respond_to: oneshot::Sender<ControlResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    pub worker_timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker_timeout: None,
        }
    }
}

/// One row of the in-memory schedule, flattened from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub node: String,
    pub address: String,
    pub port: u16,
    pub path: String,
    pub frequency: u32,
    pub last_backup: Option<DateTime<Utc>>,
    pub previous_checksum: String,
}

impl ScheduledTask {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.node, &self.path)
    }
}

/// True once more than `frequency` minutes have passed since `last`.
pub fn is_due(last: Option<DateTime<Utc>>, frequency: u32, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => (now - last).num_milliseconds() > i64::from(frequency) * 60_000,
    }
}

struct RunningWorker {
    write_path: PathBuf,
    handle: Box<dyn WorkerHandle>,
    started_at: Instant,
    terminated: bool,
}

pub struct Scheduler {
    catalog: DiskCatalog,
    backup_root: PathBuf,
    launcher: Arc<dyn WorkerLauncher>,
    options: SchedulerOptions,
    schedule: Vec<ScheduledTask>,
    running: HashMap<TaskKey, RunningWorker>,
    /// Last `.SAME` outcome per target; never persisted.
    last_attempt: HashMap<TaskKey, DateTime<Utc>>,
    namer: ArchiveNamer,
}

impl Scheduler {
    /// Take ownership of `catalog`, garbage-collect `backup_root`, and build
    /// the schedule.
    pub fn new(
        catalog: DiskCatalog,
        backup_root: impl Into<PathBuf>,
        launcher: Arc<dyn WorkerLauncher>,
        options: SchedulerOptions,
    ) -> Result<Self, CoordinatorError> {
        let backup_root = backup_root.into();
        fs::create_dir_all(&backup_root).map_err(|e| io_err(&backup_root, e))?;

        let mut scheduler = Self {
            catalog,
            namer: ArchiveNamer::new(&backup_root),
            backup_root,
            launcher,
            options,
            schedule: Vec::new(),
            running: HashMap::new(),
            last_attempt: HashMap::new(),
        };
        scheduler.clean_backup_root(Utc::now())?;
        scheduler.rebuild_schedule();
        Ok(scheduler)
    }

    pub fn catalog(&self) -> &DiskCatalog {
        &self.catalog
    }

    pub fn schedule(&self) -> &[ScheduledTask] {
        &self.schedule
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn is_running(&self, key: &TaskKey) -> bool {
        self.running.contains_key(key)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Serve requests and drive workers until shutdown or a fatal error.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControlEnvelope>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CoordinatorError> {
        tracing::info!(
            tasks = self.schedule.len(),
            backup_root = %self.backup_root.display(),
            "scheduler started",
        );
        let result = self.event_loop(&mut requests, &mut shutdown).await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "scheduler failed");
        }
        self.stop_workers().await;
        result
    }

    async fn event_loop(
        &mut self,
        requests: &mut mpsc::Receiver<ControlEnvelope>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), CoordinatorError> {
        let poll = self.options.poll_interval;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("scheduler shutting down");
                    return Ok(());
                }
                polled = tokio::time::timeout(poll, requests.recv()) => match polled {
                    Ok(Some(envelope)) => {
                        let response = self.handle_request(envelope.request);
                        if envelope.respond_to.send(response).is_err() {
                            tracing::warn!("control client went away before the reply");
                        }
                    }
                    Ok(None) => {
                        if shutdown.try_recv().is_ok() {
                            return Ok(());
                        }
                        return Err(CoordinatorError::ChannelClosed("control requests"));
                    }
                    Err(_) => {}
                },
            }

            self.tick(Utc::now())?;
        }
    }

    /// One reap + launch pass at time `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        self.reap(now)?;
        self.launch_due(now)
    }

    /// Apply one control request. Failures become `Error <msg>` replies.
    pub fn handle_request(&mut self, request: ControlRequest) -> ControlResponse {
        let ControlRequest { command: name, args } = request;
        let outcome = Command::parse(&name, args)
            .and_then(|parsed| command::apply(parsed, &mut self.catalog));
        match outcome {
            Ok(dispatch) => {
                if dispatch.schedule_changed {
                    self.rebuild_schedule();
                }
                tracing::debug!(command = %name, "control command applied");
                ControlResponse::ok(dispatch.data)
            }
            Err(err) => {
                tracing::warn!(command = %name, error = %err, "control command failed");
                ControlResponse::failure(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Schedule
    // -----------------------------------------------------------------------

    pub fn rebuild_schedule(&mut self) {
        let mut schedule = Vec::new();
        for (name, node) in &self.catalog.state().nodes {
            for task in &node.tasks {
                let latest = node.history.get(&task.path).and_then(|h| h.first());
                schedule.push(ScheduledTask {
                    node: name.clone(),
                    address: node.address.clone(),
                    port: node.port,
                    path: task.path.clone(),
                    frequency: task.frequency,
                    last_backup: latest.map(|t| t.timestamp),
                    previous_checksum: latest.map(|t| t.checksum.clone()).unwrap_or_default(),
                });
            }
        }
        self.last_attempt
            .retain(|key, _| schedule.iter().any(|task| task.key() == *key));
        self.schedule = schedule;
    }

    /// Start a worker for each due target that has none.
    pub fn launch_due(&mut self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        for task in &self.schedule {
            let key = task.key();
            if self.running.contains_key(&key) {
                continue;
            }
            let last = match (task.last_backup, self.last_attempt.get(&key).copied()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            if !is_due(last, task.frequency, now) {
                continue;
            }

            let write_path = self.namer.next(now, &task.node, &task.path);
            let job = WorkerJob {
                node: task.node.clone(),
                address: task.address.clone(),
                port: task.port,
                path: task.path.clone(),
                write_path: write_path.clone(),
                previous_checksum: task.previous_checksum.clone(),
            };
            let handle = self
                .launcher
                .launch(&job)
                .map_err(|source| CoordinatorError::Launch {
                    task: key.to_string(),
                    source,
                })?;
            tracing::info!(
                node = %task.node,
                path = %task.path,
                write_path = %write_path.display(),
                "backup started",
            );
            self.running.insert(
                key,
                RunningWorker {
                    write_path,
                    handle,
                    started_at: Instant::now(),
                    terminated: false,
                },
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reaping
    // -----------------------------------------------------------------------

    /// Settle every worker that has exited.
    pub fn reap(&mut self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let keys: Vec<TaskKey> = self.running.keys().cloned().collect();
        let mut changed = false;

        for key in keys {
            let Some(worker) = self.running.get_mut(&key) else {
                continue;
            };
            if worker.handle.is_alive() {
                if let Some(limit) = self.options.worker_timeout {
                    if !worker.terminated && worker.started_at.elapsed() > limit {
                        tracing::warn!(task = %key, timeout = ?limit, "worker timed out, terminating");
                        worker.handle.terminate();
                        worker.terminated = true;
                    }
                }
                continue;
            }

            let outcome = if worker.terminated {
                WorkerOutcome::Failed
            } else {
                classify(false, SentinelProbe::scan(&worker.write_path))
            };
            let Some(worker) = self.running.remove(&key) else {
                continue;
            };

            match outcome {
                WorkerOutcome::Committed => {
                    changed |= self.commit_archive(&key, &worker.write_path, now)?;
                }
                WorkerOutcome::Deduplicated => {
                    let marker = sentinel_path(&worker.write_path, Sentinel::Same);
                    remove_if_exists(&marker).map_err(|e| io_err(&marker, e))?;
                    self.last_attempt.insert(key.clone(), now);
                    tracing::info!(task = %key, "backup unchanged since last run");
                }
                WorkerOutcome::Failed => {
                    tracing::warn!(
                        task = %key,
                        write_path = %worker.write_path.display(),
                        "backup failed, discarding partial archive",
                    );
                    discard_archive(&worker.write_path)?;
                }
                WorkerOutcome::InProgress => {
                    self.running.insert(key, worker);
                }
            }
        }

        if changed {
            self.rebuild_schedule();
        }
        Ok(())
    }

    /// Register a verified archive. Returns whether the catalog changed.
    fn commit_archive(
        &mut self,
        key: &TaskKey,
        write_path: &Path,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        let marker = sentinel_path(write_path, Sentinel::Correct);
        remove_if_exists(&marker).map_err(|e| io_err(&marker, e))?;
        remove_if_exists(&sentinel_path(write_path, Sentinel::Wip))
            .map_err(|e| io_err(write_path, e))?;

        let task = finished_task(write_path, now)?;
        let kb_size = task.kb_size;
        match self.catalog.register_finished_task(&key.node, &key.path, task) {
            Ok(evicted) => {
                tracing::info!(
                    task = %key,
                    write_path = %write_path.display(),
                    kb_size,
                    "backup committed",
                );
                self.remove_evicted(&evicted, write_path)?;
                Ok(true)
            }
            Err(err) if err.is_unknown_node() => {
                tracing::warn!(task = %key, error = %err, "target removed while its backup ran, discarding archive");
                discard_archive(write_path)?;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn remove_evicted(
        &self,
        evicted: &[FinishedTask],
        keep: &Path,
    ) -> Result<(), CoordinatorError> {
        for old in evicted {
            if old.result_path == keep {
                continue;
            }
            if remove_if_exists(&old.result_path).map_err(|e| io_err(&old.result_path, e))? {
                tracing::debug!(path = %old.result_path.display(), "evicted archive removed");
            }
        }
        Ok(())
    }

    /// Terminate every live worker and wait until none is alive.
    async fn stop_workers(&mut self) {
        for (key, worker) in self.running.iter_mut() {
            if worker.handle.is_alive() {
                tracing::info!(task = %key, "terminating worker");
                worker.handle.terminate();
            }
        }
        loop {
            self.running.retain(|_, worker| worker.handle.is_alive());
            if self.running.is_empty() {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }

    // -----------------------------------------------------------------------
    // Startup cleanup
    // -----------------------------------------------------------------------

    /// Adopt verified archives the catalog never saw, then delete every
    /// other file under the backup root the catalog does not reference.
    pub fn clean_backup_root(&mut self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let mut archives = list_dir(&self.backup_root)?;
        archives.sort();

        let known = self.catalog.result_paths();
        for path in &archives {
            if is_sentinel(path) || known.contains(path) {
                continue;
            }
            if sentinel_path(path, Sentinel::Correct).exists() {
                self.adopt(path, now)?;
            }
        }

        let keep = self.catalog.result_paths();
        let mut removed = 0usize;
        for path in list_dir(&self.backup_root)? {
            if keep.contains(&path) {
                continue;
            }
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|e| io_err(&path, e))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, backup_root = %self.backup_root.display(), "removed orphaned files");
        }
        Ok(())
    }

    fn adopt(&mut self, path: &Path, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        let state = self.catalog.state();
        let Some(name) = paths::parse_archive_name(file_name).into_iter().find(|name| {
            state
                .nodes
                .get(&name.node)
                .is_some_and(|node| node.is_scheduled(&name.path))
        }) else {
            return Ok(());
        };

        let timestamp = Utc.timestamp_opt(name.timestamp, 0).single().unwrap_or(now);
        let task = finished_task(path, timestamp)?;
        let evicted = self
            .catalog
            .register_finished_task(&name.node, &name.path, task)?;
        self.remove_evicted(&evicted, path)?;
        let marker = sentinel_path(path, Sentinel::Correct);
        remove_if_exists(&marker).map_err(|e| io_err(&marker, e))?;
        tracing::info!(
            node = %name.node,
            path = %name.path,
            archive = %path.display(),
            "adopted verified archive left by a previous run",
        );
        Ok(())
    }
}

fn finished_task(write_path: &Path, at: DateTime<Utc>) -> Result<FinishedTask, CoordinatorError> {
    let size = fs::metadata(write_path)
        .map_err(|e| io_err(write_path, e))?
        .len();
    let checksum = sha256_file(write_path).map_err(|e| io_err(write_path, e))?;
    Ok(FinishedTask::new(
        write_path,
        size as f64 / 1024.0,
        at,
        checksum,
    ))
}

/// Remove a failed worker's partial archive and every marker it left.
fn discard_archive(write_path: &Path) -> Result<(), CoordinatorError> {
    remove_if_exists(write_path).map_err(|e| io_err(write_path, e))?;
    for sentinel in Sentinel::ALL {
        let marker = sentinel_path(write_path, sentinel);
        remove_if_exists(&marker).map_err(|e| io_err(&marker, e))?;
    }
    Ok(())
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, CoordinatorError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        paths.push(entry.map_err(|e| io_err(dir, e))?.path());
    }
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::archive_name;
    use crate::sentinel::touch;
    use rstest::rstest;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    // -- fake workers ---------------------------------------------------------

    /// What a fake worker leaves behind when it "exits".
    #[derive(Clone, Copy)]
    enum Script {
        Store(&'static [u8]),
        Same,
        Crash,
    }

    struct FakeHandle {
        alive: Arc<AtomicBool>,
    }

    impl WorkerHandle for FakeHandle {
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn terminate(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: Mutex<Vec<(WorkerJob, Arc<AtomicBool>)>>,
    }

    impl FakeLauncher {
        fn jobs(&self) -> Vec<WorkerJob> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .map(|(job, _)| job.clone())
                .collect()
        }

        /// Finish the most recent worker the way `script` says.
        fn finish_last(&self, script: Script) {
            let launched = self.launched.lock().unwrap();
            let (job, alive) = launched.last().expect("a launched worker");
            match script {
                Script::Store(bytes) => {
                    fs::write(&job.write_path, bytes).unwrap();
                    touch(&sentinel_path(&job.write_path, Sentinel::Correct)).unwrap();
                }
                Script::Same => touch(&sentinel_path(&job.write_path, Sentinel::Same)).unwrap(),
                Script::Crash => {
                    fs::write(&job.write_path, b"partial").unwrap();
                    touch(&sentinel_path(&job.write_path, Sentinel::Wip)).unwrap();
                }
            }
            alive.store(false, Ordering::SeqCst);
        }
    }

    impl WorkerLauncher for FakeLauncher {
        fn launch(&self, job: &WorkerJob) -> std::io::Result<Box<dyn WorkerHandle>> {
            let alive = Arc::new(AtomicBool::new(true));
            self.launched
                .lock()
                .unwrap()
                .push((job.clone(), alive.clone()));
            Ok(Box::new(FakeHandle { alive }))
        }
    }

    struct Fixture {
        _dir: TempDir,
        launcher: Arc<FakeLauncher>,
        scheduler: Scheduler,
    }

    fn fixture_with(options: SchedulerOptions, prepare: impl FnOnce(&Path)) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let backup_root = paths::backup_root(dir.path());
        fs::create_dir_all(&backup_root).unwrap();
        let mut catalog = DiskCatalog::open(dir.path()).expect("open");
        catalog.register_node("web", "127.0.0.1", 9000).unwrap();
        catalog.add_scheduled_task("web", "/srv", 5).unwrap();
        drop(catalog);
        prepare(dir.path());

        let catalog = DiskCatalog::open(dir.path()).expect("reopen");
        let launcher = Arc::new(FakeLauncher::default());
        let scheduler =
            Scheduler::new(catalog, backup_root, launcher.clone(), options).expect("scheduler");
        Fixture {
            _dir: dir,
            launcher,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SchedulerOptions::default(), |_| {})
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn request(command: &str, args: Value) -> ControlRequest {
        let Value::Object(map) = args else {
            panic!("args must be an object")
        };
        ControlRequest::new(command, map)
    }

    // -- freshness ------------------------------------------------------------

    #[rstest]
    #[case::never_backed_up(None, 5, 0, true)]
    #[case::just_now(Some(0), 5, 0, false)]
    #[case::exactly_frequency(Some(0), 5, 300, false)]
    #[case::one_second_past(Some(0), 5, 301, true)]
    #[case::days_later(Some(0), 5, 3 * 86_400, true)]
    #[case::clock_behind(Some(600), 5, 0, false)]
    fn due_only_when_elapsed_exceeds_frequency(
        #[case] last: Option<i64>,
        #[case] frequency: u32,
        #[case] now: i64,
        #[case] expected: bool,
    ) {
        assert_eq!(is_due(last.map(at), frequency, at(now)), expected);
    }

    // -- launching and reaping -----------------------------------------------

    #[test]
    fn schedule_is_built_from_catalog() {
        let fx = fixture();
        assert_eq!(fx.scheduler.schedule().len(), 1);
        let task = &fx.scheduler.schedule()[0];
        assert_eq!((task.node.as_str(), task.path.as_str()), ("web", "/srv"));
        assert_eq!(task.last_backup, None);
        assert_eq!(task.previous_checksum, "");
    }

    #[test]
    fn at_most_one_worker_per_target() {
        let mut fx = fixture();
        fx.scheduler.tick(at(0)).unwrap();
        fx.scheduler.tick(at(1)).unwrap();
        fx.scheduler.tick(at(10_000)).unwrap();
        assert_eq!(fx.launcher.jobs().len(), 1);
        assert!(fx.scheduler.is_running(&TaskKey::new("web", "/srv")));
    }

    #[test]
    fn committed_archive_is_catalogued_with_checksum() {
        let mut fx = fixture();
        fx.scheduler.tick(at(0)).unwrap();
        fx.launcher.finish_last(Script::Store(b"archive-bytes"));
        fx.scheduler.tick(at(1)).unwrap();

        let job = &fx.launcher.jobs()[0];
        let history = fx.scheduler.catalog().node_finished_tasks("web", "/srv");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result_path, job.write_path);
        assert_eq!(history[0].kb_size, 13.0 / 1024.0);
        assert_eq!(
            history[0].checksum,
            backup_core::digest::sha256_bytes(b"archive-bytes")
        );
        assert!(job.write_path.exists());
        assert!(!sentinel_path(&job.write_path, Sentinel::Correct).exists());
        assert_eq!(fx.scheduler.schedule()[0].last_backup, Some(at(1)));
        assert_eq!(fx.scheduler.running_count(), 0);
    }

    #[test]
    fn next_job_carries_previous_checksum_and_waits_for_frequency() {
        let mut fx = fixture();
        fx.scheduler.tick(at(0)).unwrap();
        fx.launcher.finish_last(Script::Store(b"v1"));
        fx.scheduler.tick(at(1)).unwrap();
        fx.scheduler.tick(at(301)).unwrap();
        assert_eq!(fx.launcher.jobs().len(), 1);

        fx.scheduler.tick(at(302)).unwrap();
        let jobs = fx.launcher.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(
            jobs[1].previous_checksum,
            backup_core::digest::sha256_bytes(b"v1")
        );
        assert_ne!(jobs[0].write_path, jobs[1].write_path);
    }

    #[test]
    fn same_outcome_defers_next_run_without_new_history() {
        let mut fx = fixture();
        fx.scheduler.tick(at(0)).unwrap();
        fx.launcher.finish_last(Script::Same);
        fx.scheduler.tick(at(10)).unwrap();

        let job = &fx.launcher.jobs()[0];
        assert!(fx.scheduler.catalog().node_finished_tasks("web", "/srv").is_empty());
        assert!(!sentinel_path(&job.write_path, Sentinel::Same).exists());

        // Freshness now counts from the dedup at t=10.
        fx.scheduler.tick(at(305)).unwrap();
        assert_eq!(fx.launcher.jobs().len(), 1);
        fx.scheduler.tick(at(311)).unwrap();
        assert_eq!(fx.launcher.jobs().len(), 2);
    }

    #[test]
    fn failed_worker_leaves_nothing_behind() {
        let mut fx = fixture();
        fx.scheduler.tick(at(0)).unwrap();
        fx.launcher.finish_last(Script::Crash);
        let job = fx.launcher.jobs()[0].clone();
        fx.scheduler.reap(at(1)).unwrap();

        assert!(!job.write_path.exists());
        assert!(!sentinel_path(&job.write_path, Sentinel::Wip).exists());
        assert!(fx.scheduler.catalog().node_finished_tasks("web", "/srv").is_empty());
        // A failure does not move freshness: the next tick retries.
        fx.scheduler.launch_due(at(2)).unwrap();
        assert_eq!(fx.launcher.jobs().len(), 2);
    }

    #[test]
    fn timed_out_worker_is_terminated_and_discarded() {
        let options = SchedulerOptions {
            worker_timeout: Some(Duration::ZERO),
            ..SchedulerOptions::default()
        };
        let mut fx = fixture_with(options, |_| {});
        fx.scheduler.launch_due(at(0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        fx.scheduler.reap(at(1)).unwrap();
        assert_eq!(fx.scheduler.running_count(), 1, "terminated, reaped next pass");
        fx.scheduler.reap(at(2)).unwrap();
        assert_eq!(fx.scheduler.running_count(), 0);
        assert!(fx.scheduler.catalog().node_finished_tasks("web", "/srv").is_empty());
    }

    #[test]
    fn archive_of_deleted_task_is_discarded() {
        let mut fx = fixture();
        fx.scheduler.tick(at(0)).unwrap();
        let response = fx.scheduler.handle_request(request(
            "delete_scheduled_task",
            json!({"name": "web", "path": "/srv"}),
        ));
        assert!(response.is_ok());

        fx.launcher.finish_last(Script::Store(b"late"));
        fx.scheduler.tick(at(1)).unwrap();
        let job = &fx.launcher.jobs()[0];
        assert!(!job.write_path.exists());
        assert!(fx.scheduler.schedule().is_empty());
        fx.scheduler.tick(at(100_000)).unwrap();
        assert_eq!(fx.launcher.jobs().len(), 1);
    }

    #[test]
    fn evicted_archives_are_deleted() {
        let mut fx = fixture();
        let mut first_path = None;
        for round in 0..11i64 {
            let start = round * 1_000;
            fx.scheduler.tick(at(start)).unwrap();
            fx.launcher.finish_last(Script::Store(b"data"));
            if first_path.is_none() {
                first_path = Some(fx.launcher.jobs()[0].write_path.clone());
            }
            fx.scheduler.tick(at(start + 1)).unwrap();
        }
        let history = fx.scheduler.catalog().node_finished_tasks("web", "/srv");
        assert_eq!(history.len(), 10);
        assert!(!first_path.unwrap().exists());
        assert!(history.iter().all(|task| task.result_path.exists()));
    }

    // -- control requests -----------------------------------------------------

    #[test]
    fn requests_are_answered_and_failures_reported() {
        let mut fx = fixture();
        let ok = fx.scheduler.handle_request(request(
            "add_node",
            json!({"name": "db", "address": "10.0.0.2", "port": 7000}),
        ));
        assert_eq!(ok, ControlResponse::ok(Value::Null));

        let unknown = fx.scheduler.handle_request(request("reboot", json!({})));
        assert_eq!(unknown.message, "Error unknown command 'reboot'");

        let missing = fx.scheduler.handle_request(request(
            "add_task",
            json!({"name": "ghost", "path": "/p", "frequency": 1}),
        ));
        assert_eq!(missing.message, "Error unknown node 'ghost'");
        assert_eq!(missing.data, Value::Null);
    }

    #[test]
    fn add_task_reaches_schedule_immediately() {
        let mut fx = fixture();
        fx.scheduler.handle_request(request(
            "add_task",
            json!({"name": "web", "path": "/etc", "frequency": 60}),
        ));
        let paths: Vec<_> = fx.scheduler.schedule().iter().map(|t| t.path.clone()).collect();
        assert_eq!(paths, vec!["/srv", "/etc"]);
    }

    #[tokio::test]
    async fn closed_request_channel_is_fatal() {
        let fx = fixture();
        let (tx, rx) = mpsc::channel::<ControlEnvelope>(1);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        drop(tx);

        let err = fx.scheduler.run(rx, shutdown_rx).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ChannelClosed(_)), "got: {err}");
    }

    #[tokio::test]
    async fn shutdown_terminates_live_workers() {
        let fx = fixture();
        let launcher = fx.launcher.clone();
        let (tx, rx) = mpsc::channel::<ControlEnvelope>(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ControlEnvelope {
            request: request("query_backups", json!({"name": "web", "path": "/srv"})),
            respond_to: reply_tx,
        })
        .await
        .unwrap();

        let task = tokio::spawn(fx.scheduler.run(rx, shutdown_rx));
        assert_eq!(reply_rx.await.unwrap(), ControlResponse::ok(json!([])));
        // The tick after the request launched the first backup.
        while launcher.jobs().is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        let launched = launcher.launched.lock().unwrap();
        assert!(launched.iter().all(|(_, alive)| !alive.load(Ordering::SeqCst)));
        drop(tx);
    }

    // -- startup cleanup ------------------------------------------------------

    #[test]
    fn startup_removes_orphans_but_keeps_catalogued_archives() {
        let mut kept = PathBuf::new();
        let fx = fixture_with(SchedulerOptions::default(), |root| {
            let data = paths::backup_root(root);
            kept = data.join(archive_name(1, "web", "/srv"));
            fs::write(&kept, b"kept").unwrap();
            let mut catalog = DiskCatalog::open(root).unwrap();
            let task = finished_task(&kept, at(0)).unwrap();
            catalog.register_finished_task("web", "/srv", task).unwrap();

            let partial = data.join(archive_name(2, "web", "/srv"));
            fs::write(&partial, b"partial").unwrap();
            touch(&sentinel_path(&partial, Sentinel::Wip)).unwrap();
            touch(&sentinel_path(&data.join(archive_name(3, "web", "/srv")), Sentinel::Same))
                .unwrap();
            fs::write(data.join("stray.txt"), b"x").unwrap();
        });

        let remaining = list_dir(fx.scheduler.backup_root()).unwrap();
        assert_eq!(remaining, vec![kept]);
    }

    #[test]
    fn startup_adopts_verified_archive_for_scheduled_task() {
        let fx = fixture_with(SchedulerOptions::default(), |root| {
            let archive = paths::backup_root(root).join(archive_name(1_700_000_042, "web", "/srv"));
            fs::write(&archive, b"verified").unwrap();
            touch(&sentinel_path(&archive, Sentinel::Correct)).unwrap();
        });

        let history = fx.scheduler.catalog().node_finished_tasks("web", "/srv");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, at(42));
        assert_eq!(
            history[0].checksum,
            backup_core::digest::sha256_bytes(b"verified")
        );
        assert!(history[0].result_path.exists());
        assert!(!sentinel_path(&history[0].result_path, Sentinel::Correct).exists());
        assert_eq!(fx.scheduler.schedule()[0].last_backup, Some(at(42)));
    }

    #[test]
    fn startup_discards_verified_archive_for_unknown_target() {
        let fx = fixture_with(SchedulerOptions::default(), |root| {
            let archive = paths::backup_root(root).join(archive_name(5, "gone", "/srv"));
            fs::write(&archive, b"verified").unwrap();
            touch(&sentinel_path(&archive, Sentinel::Correct)).unwrap();
        });
        assert!(list_dir(fx.scheduler.backup_root()).unwrap().is_empty());
    }
}
