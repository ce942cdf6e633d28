use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use secure_delivery::utils::now_millis;
use secure_delivery::{CancellationToken, DeliveryConfig, StorageAdapter};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{classify, RetryDecision};
use crate::job_store::{JobRecord, JobStore};
use crate::{Backoff, Job, JobContext, JobError, JobFactory, JobState, Result};

struct Entry {
    id: String,
    queue_key: String,
    job: Box<dyn Job>,
    attempt: u32,
    created_at: u64,
    persisted: bool,
    /// Someone is blocked on this job. It may also run on the reserved runner.
    synchronous: bool,
}

impl Entry {
    fn record(&self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id.clone(),
            factory_key: self.job.factory_key().to_string(),
            queue_key: self.queue_key.clone(),
            data: self.job.serialize()?,
            attempt: self.attempt,
            created_at: self.created_at,
        })
    }
}

/// Terminal states kept for `state`/`wait_for` after a job finishes.
const RETAINED_STATES: usize = 1024;

struct Scheduler {
    /// Jobs waiting for their queue key, in enqueue order.
    queues: HashMap<String, VecDeque<Entry>>,
    /// Queue keys with a job on a runner, including one waiting out a backoff.
    busy: HashSet<String>,
    states: HashMap<String, JobState>,
    waiters: HashMap<String, Vec<Sender<JobState>>>,
    /// Ids of finished jobs whose state is still in `states`, oldest first.
    finished: VecDeque<String>,
    retained_states: usize,
    /// Synchronous job currently queued or running under each queue key.
    in_flight: HashMap<String, String>,
    /// Strictly increasing, so persisted jobs reload in enqueue order.
    last_created_at: u64,
}

impl Scheduler {
    fn new(retained_states: usize) -> Self {
        Self {
            queues: HashMap::new(),
            busy: HashSet::new(),
            states: HashMap::new(),
            waiters: HashMap::new(),
            finished: VecDeque::new(),
            retained_states,
            in_flight: HashMap::new(),
            last_created_at: 0,
        }
    }

    fn retain_finished(&mut self, id: &str, state: JobState) {
        self.states.insert(id.to_string(), state);
        self.finished.push_back(id.to_string());
        while self.finished.len() > self.retained_states {
            if let Some(oldest) = self.finished.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }
}

struct Inner {
    scheduler: Mutex<Scheduler>,
    ready_tx: Sender<Entry>,
    ready_rx: Receiver<Entry>,
    sync_tx: Sender<Entry>,
    sync_rx: Receiver<Entry>,
    /// Never carries a message; disconnects when the manager shuts down.
    shutdown_rx: Receiver<()>,
    store: Option<JobStore>,
    factories: Mutex<HashMap<String, Arc<dyn JobFactory>>>,
    backoff: Backoff,
    cancel: CancellationToken,
}

pub struct JobManagerOptions {
    pub runners: usize,
    pub backoff: Backoff,
    /// Where queued jobs are persisted. `None` keeps them in memory only.
    pub storage: Option<Arc<dyn StorageAdapter>>,
}

impl JobManagerOptions {
    pub fn from_config(config: &DeliveryConfig, storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        Self {
            runners: config.job_runners,
            backoff: Backoff::from_config(config),
            storage,
        }
    }
}

/// Runs jobs on a fixed set of runner threads.
///
/// Jobs sharing a queue key run one at a time in enqueue order, including
/// their backoff waits; different queue keys run concurrently. One extra
/// runner only takes synchronous jobs, so a job blocked on
/// [`JobManager::run_synchronously`] cannot starve the job it waits for.
pub struct JobManager {
    inner: Arc<Inner>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(options: JobManagerOptions) -> Self {
        let (ready_tx, ready_rx) = unbounded();
        let (sync_tx, sync_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let inner = Arc::new(Inner {
            scheduler: Mutex::new(Scheduler::new(RETAINED_STATES)),
            ready_tx,
            ready_rx,
            sync_tx,
            sync_rx,
            shutdown_rx,
            store: options.storage.map(JobStore::new),
            factories: Mutex::new(HashMap::new()),
            backoff: options.backoff,
            cancel: CancellationToken::new(),
        });

        let mut runners = Vec::with_capacity(options.runners);
        for i in 0..options.runners.max(1) {
            let inner = inner.clone();
            match thread::Builder::new()
                .name(format!("job-runner-{}", i))
                .spawn(move || runner_loop(inner))
            {
                Ok(handle) => runners.push(handle),
                Err(e) => warn!(error = %e, "failed to spawn job runner"),
            }
        }
        let sync_inner = inner.clone();
        match thread::Builder::new()
            .name("job-runner-sync".to_string())
            .spawn(move || sync_runner_loop(sync_inner))
        {
            Ok(handle) => runners.push(handle),
            Err(e) => warn!(error = %e, "failed to spawn synchronous job runner"),
        }
        info!(runners = runners.len(), "job manager started");

        Self {
            inner,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            runners: Mutex::new(runners),
        }
    }

    pub fn from_config(config: &DeliveryConfig, storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        Self::new(JobManagerOptions::from_config(config, storage))
    }

    pub fn register_factory(&self, factory_key: &str, factory: Arc<dyn JobFactory>) {
        self.inner
            .factories
            .lock()
            .unwrap()
            .insert(factory_key.to_string(), factory);
    }

    /// Re-queues persisted jobs. Call after registering factories.
    pub fn resume(&self) -> Result<usize> {
        self.inner.resume()
    }

    /// Queues `job` behind every job already queued under `queue_key`.
    /// Fails with `QueueFull` when `max_instances` jobs are already waiting.
    pub fn enqueue(
        &self,
        job: Box<dyn Job>,
        queue_key: &str,
        max_instances: Option<usize>,
    ) -> Result<String> {
        self.inner.submit(job, queue_key, max_instances, true, None)
    }

    /// Runs `job` on its own queue and waits up to `timeout` for it to end.
    /// Returns `None` if it did not reach a terminal state in time.
    pub fn run_synchronously(
        &self,
        job: Box<dyn Job>,
        timeout: Duration,
    ) -> Result<Option<JobState>> {
        self.inner.run_synchronously(job, None, timeout)
    }

    /// Like [`JobManager::run_synchronously`], but at most one such job is in
    /// flight under `queue_key`. A caller arriving while one is queued or
    /// running drops `job` and waits for the in-flight one instead.
    pub fn run_synchronously_on(
        &self,
        job: Box<dyn Job>,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<Option<JobState>> {
        self.inner.run_synchronously(job, Some(queue_key), timeout)
    }

    /// Terminal states are forgotten once enough later jobs have finished.
    pub fn state(&self, id: &str) -> Option<JobState> {
        self.inner.scheduler.lock().unwrap().states.get(id).copied()
    }

    /// Blocks until job `id` is terminal or `timeout` passes.
    pub fn wait_for(&self, id: &str, timeout: Duration) -> Option<JobState> {
        let rx = {
            let mut scheduler = self.inner.scheduler.lock().unwrap();
            match scheduler.states.get(id) {
                None => return None,
                Some(state) if state.is_terminal() => return Some(*state),
                Some(_) => {}
            }
            let (tx, rx) = bounded(1);
            scheduler.waiters.entry(id.to_string()).or_default().push(tx);
            rx
        };
        rx.recv_timeout(timeout).ok()
    }

    /// Jobs waiting under `queue_key`, not counting one that is running.
    pub fn pending_count(&self, queue_key: &str) -> usize {
        self.inner
            .scheduler
            .lock()
            .unwrap()
            .queues
            .get(queue_key)
            .map_or(0, VecDeque::len)
    }

    /// A non-owning handle for jobs that need to schedule other jobs.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stops the runners. Running jobs see their cancellation token set;
    /// persisted jobs that have not finished stay in storage.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.shutdown_tx.lock().unwrap().take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.runners.lock().unwrap());
        if handles.is_empty() {
            return;
        }
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("job runner panicked");
            }
        }
        info!("job manager stopped");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Weak reference to a [`JobManager`]. Operations fail with
/// [`JobError::Shutdown`] once the manager is gone.
#[derive(Clone)]
pub struct JobHandle {
    inner: Weak<Inner>,
}

impl JobHandle {
    fn upgrade(&self) -> Result<Arc<Inner>> {
        self.inner.upgrade().ok_or(JobError::Shutdown)
    }

    pub fn enqueue(
        &self,
        job: Box<dyn Job>,
        queue_key: &str,
        max_instances: Option<usize>,
    ) -> Result<String> {
        self.upgrade()?
            .submit(job, queue_key, max_instances, true, None)
    }

    pub fn run_synchronously(
        &self,
        job: Box<dyn Job>,
        timeout: Duration,
    ) -> Result<Option<JobState>> {
        self.upgrade()?.run_synchronously(job, None, timeout)
    }

    pub fn run_synchronously_on(
        &self,
        job: Box<dyn Job>,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<Option<JobState>> {
        self.upgrade()?
            .run_synchronously(job, Some(queue_key), timeout)
    }
}

fn runner_loop(inner: Arc<Inner>) {
    loop {
        select! {
            recv(inner.ready_rx) -> entry => match entry {
                Ok(entry) if !inner.cancel.is_canceled() => inner.execute(entry),
                _ => return,
            },
            recv(inner.sync_rx) -> entry => match entry {
                Ok(entry) if !inner.cancel.is_canceled() => inner.execute(entry),
                _ => return,
            },
            recv(inner.shutdown_rx) -> _ => return,
        }
    }
}

fn sync_runner_loop(inner: Arc<Inner>) {
    loop {
        select! {
            recv(inner.sync_rx) -> entry => match entry {
                Ok(entry) if !inner.cancel.is_canceled() => inner.execute(entry),
                _ => return,
            },
            recv(inner.shutdown_rx) -> _ => return,
        }
    }
}

impl Inner {
    fn submit(
        &self,
        job: Box<dyn Job>,
        queue_key: &str,
        max_instances: Option<usize>,
        persist: bool,
        waiter: Option<Sender<JobState>>,
    ) -> Result<String> {
        let mut scheduler = self.scheduler.lock().unwrap();
        self.submit_locked(&mut scheduler, job, queue_key, max_instances, persist, waiter)
    }

    fn submit_locked(
        &self,
        scheduler: &mut Scheduler,
        job: Box<dyn Job>,
        queue_key: &str,
        max_instances: Option<usize>,
        persist: bool,
        waiter: Option<Sender<JobState>>,
    ) -> Result<String> {
        if self.cancel.is_canceled() {
            return Err(JobError::Shutdown);
        }
        if let Some(max) = max_instances {
            let pending = scheduler.queues.get(queue_key).map_or(0, VecDeque::len);
            if pending >= max {
                warn!(queue_key = %queue_key, pending, max, "queue is full, dropping job");
                return Err(JobError::QueueFull {
                    queue_key: queue_key.to_string(),
                });
            }
        }

        let created_at = now_millis().max(scheduler.last_created_at + 1);
        scheduler.last_created_at = created_at;
        let entry = Entry {
            id: Uuid::new_v4().to_string(),
            queue_key: queue_key.to_string(),
            job,
            attempt: 0,
            created_at,
            persisted: persist && self.store.is_some(),
            synchronous: !persist && waiter.is_some(),
        };
        let id = entry.id.clone();
        if entry.persisted {
            if let Some(store) = &self.store {
                store.put(&entry.record()?)?;
            }
        }

        debug!(job = %id, factory = entry.job.factory_key(), queue_key = %queue_key, "job enqueued");
        scheduler.states.insert(id.clone(), JobState::Pending);
        if let Some(waiter) = waiter {
            scheduler.waiters.entry(id.clone()).or_default().push(waiter);
        }
        scheduler
            .queues
            .entry(queue_key.to_string())
            .or_default()
            .push_back(entry);
        self.dispatch(scheduler, queue_key);
        Ok(id)
    }

    fn run_synchronously(
        &self,
        job: Box<dyn Job>,
        queue_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<JobState>> {
        let (tx, rx) = bounded(1);
        let id = match queue_key {
            None => {
                let queue_key = format!("sync/{}", Uuid::new_v4());
                self.submit(job, &queue_key, None, false, Some(tx))?
            }
            Some(queue_key) => {
                let mut scheduler = self.scheduler.lock().unwrap();
                match scheduler.in_flight.get(queue_key).cloned() {
                    Some(id) => {
                        debug!(job = %id, queue_key = %queue_key, "waiting for in-flight job");
                        scheduler.waiters.entry(id.clone()).or_default().push(tx);
                        id
                    }
                    None => {
                        let id = self.submit_locked(
                            &mut scheduler,
                            job,
                            queue_key,
                            Some(1),
                            false,
                            Some(tx),
                        )?;
                        scheduler
                            .in_flight
                            .insert(queue_key.to_string(), id.clone());
                        id
                    }
                }
            }
        };

        match rx.recv_timeout(timeout) {
            Ok(state) => Ok(Some(state)),
            Err(_) => {
                warn!(
                    job = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for job"
                );
                Ok(None)
            }
        }
    }

    fn resume(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.load_all()?;
        let factories = self.factories.lock().unwrap().clone();

        let mut scheduler = self.scheduler.lock().unwrap();
        let mut keys: Vec<String> = Vec::new();
        let mut resumed = 0;
        for record in records {
            if scheduler.states.contains_key(&record.id) {
                continue;
            }
            let Some(factory) = factories.get(&record.factory_key) else {
                warn!(job = %record.id, factory = %record.factory_key, "no factory for persisted job");
                continue;
            };
            let job = match factory.create(record.data.clone()) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job = %record.id, error = %e, "failed to restore persisted job");
                    continue;
                }
            };

            let entry = Entry {
                id: record.id.clone(),
                queue_key: record.queue_key.clone(),
                job,
                attempt: record.attempt,
                created_at: record.created_at,
                persisted: true,
                synchronous: false,
            };
            scheduler.last_created_at = scheduler.last_created_at.max(record.created_at);
            scheduler.states.insert(record.id, JobState::Pending);
            let queue = scheduler.queues.entry(record.queue_key.clone()).or_default();
            let position = queue
                .iter()
                .position(|e| e.created_at > entry.created_at)
                .unwrap_or(queue.len());
            queue.insert(position, entry);

            if !keys.contains(&record.queue_key) {
                keys.push(record.queue_key);
            }
            resumed += 1;
        }

        for key in &keys {
            self.dispatch(&mut scheduler, key);
        }
        info!(jobs = resumed, queues = keys.len(), "resumed persisted jobs");
        Ok(resumed)
    }

    fn dispatch(&self, scheduler: &mut Scheduler, queue_key: &str) {
        if scheduler.busy.contains(queue_key) {
            return;
        }
        let Some(queue) = scheduler.queues.get_mut(queue_key) else {
            return;
        };
        let Some(entry) = queue.pop_front() else {
            return;
        };
        if queue.is_empty() {
            scheduler.queues.remove(queue_key);
        }
        scheduler.busy.insert(queue_key.to_string());
        let runners = if entry.synchronous {
            &self.sync_tx
        } else {
            &self.ready_tx
        };
        if runners.send(entry).is_err() {
            warn!(queue_key = %queue_key, "runner channel closed");
        }
    }

    fn set_state(&self, id: &str, state: JobState) {
        self.scheduler
            .lock()
            .unwrap()
            .states
            .insert(id.to_string(), state);
    }

    fn persist(&self, entry: &Entry) {
        if !entry.persisted {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = entry.record().and_then(|record| store.put(&record)) {
            warn!(job = %entry.id, error = %e, "failed to persist job");
        }
    }

    fn execute(&self, mut entry: Entry) {
        loop {
            entry.attempt += 1;
            self.set_state(&entry.id, JobState::Running);
            self.persist(&entry);

            let ctx = JobContext {
                id: entry.id.clone(),
                attempt: entry.attempt,
                cancel: self.cancel.clone(),
            };
            debug!(
                job = %entry.id,
                factory = entry.job.factory_key(),
                queue_key = %entry.queue_key,
                attempt = entry.attempt,
                "running job"
            );

            let error = match entry.job.run(&ctx) {
                Ok(()) => {
                    info!(job = %entry.id, queue_key = %entry.queue_key, attempt = entry.attempt, "job succeeded");
                    self.finish(entry, JobState::Succeeded);
                    return;
                }
                Err(e) => e,
            };

            if self.cancel.is_canceled() {
                info!(job = %entry.id, error = %error, "job interrupted by shutdown");
                return;
            }

            let max_attempts = entry.job.max_attempts();
            match classify(&error) {
                RetryDecision::Retry {
                    backoff_override_ms,
                } if entry.attempt < max_attempts => {
                    let delay = self.backoff.delay(entry.attempt, backoff_override_ms);
                    warn!(
                        job = %entry.id,
                        queue_key = %entry.queue_key,
                        attempt = entry.attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "job attempt failed, retrying"
                    );
                    entry.job.on_retry(&error);
                    self.set_state(&entry.id, JobState::Retrying);
                    self.persist(&entry);

                    match self.shutdown_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => return,
                    }
                }
                decision => {
                    warn!(
                        job = %entry.id,
                        queue_key = %entry.queue_key,
                        attempt = entry.attempt,
                        retryable = decision != RetryDecision::Permanent,
                        error = %error,
                        "job failed permanently"
                    );
                    entry.job.on_failure(&error);
                    self.finish(entry, JobState::PermanentlyFailed);
                    return;
                }
            }
        }
    }

    fn finish(&self, entry: Entry, state: JobState) {
        if entry.persisted {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove(&entry.id) {
                    warn!(job = %entry.id, error = %e, "failed to remove finished job");
                }
            }
        }

        let mut scheduler = self.scheduler.lock().unwrap();
        for waiter in scheduler.waiters.remove(&entry.id).unwrap_or_default() {
            let _ = waiter.send(state);
        }
        if entry.synchronous {
            scheduler.states.remove(&entry.id);
            if scheduler.in_flight.get(&entry.queue_key) == Some(&entry.id) {
                scheduler.in_flight.remove(&entry.queue_key);
            }
        } else {
            scheduler.retain_finished(&entry.id, state);
        }
        scheduler.busy.remove(&entry.queue_key);
        self.dispatch(&mut scheduler, &entry.queue_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CountingJob, Outcome};
    use secure_delivery::InMemoryStorage;
    use std::sync::atomic::Ordering;

    fn manager(runners: usize) -> JobManager {
        JobManager::new(JobManagerOptions {
            runners,
            backoff: Backoff::new(1, 5),
            storage: None,
        })
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn succeeds_and_reports_state() {
        let manager = manager(2);
        let job = CountingJob::new(vec![Outcome::Ok]);
        let runs = job.runs.clone();

        let id = manager.enqueue(Box::new(job), "q", None).unwrap();
        assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::Succeeded));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(&id), Some(JobState::Succeeded));
    }

    #[test]
    fn retryable_failure_is_retried() {
        let manager = manager(1);
        let job = CountingJob::new(vec![Outcome::Network, Outcome::Network, Outcome::Ok]);
        let runs = job.runs.clone();

        let id = manager.enqueue(Box::new(job), "q", None).unwrap();
        assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::Succeeded));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let manager = manager(1);
        let job = CountingJob::new(vec![Outcome::ServerRejected, Outcome::Ok]);
        let runs = job.runs.clone();
        let failures = job.failures.clone();

        let id = manager.enqueue(Box::new(job), "q", None).unwrap();
        assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::PermanentlyFailed));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let manager = manager(1);
        let job = CountingJob::new(vec![Outcome::Network; 10]).with_max_attempts(3);
        let runs = job.runs.clone();

        let id = manager.enqueue(Box::new(job), "q", None).unwrap();
        assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::PermanentlyFailed));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn queue_limit_counts_waiting_jobs() {
        let manager = manager(1);
        let blocker = CountingJob::new(vec![Outcome::Block(200)]);
        manager.enqueue(Box::new(blocker), "q", None).unwrap();
        manager
            .enqueue(Box::new(CountingJob::new(vec![Outcome::Ok])), "q", Some(1))
            .unwrap();

        let result = manager.enqueue(Box::new(CountingJob::new(vec![Outcome::Ok])), "q", Some(1));
        assert!(matches!(result, Err(JobError::QueueFull { .. })));
    }

    #[test]
    fn run_synchronously_times_out() {
        let manager = manager(2);
        let slow = CountingJob::new(vec![Outcome::Block(500)]);
        let state = manager
            .run_synchronously(Box::new(slow), Duration::from_millis(20))
            .unwrap();
        assert_eq!(state, None);

        let fast = CountingJob::new(vec![Outcome::Ok]);
        let state = manager.run_synchronously(Box::new(fast), WAIT).unwrap();
        assert_eq!(state, Some(JobState::Succeeded));
    }

    #[test]
    fn handle_fails_after_manager_is_dropped() {
        let handle = {
            let manager = manager(1);
            manager.handle()
        };
        let result = handle.enqueue(Box::new(CountingJob::new(vec![Outcome::Ok])), "q", None);
        assert!(matches!(result, Err(JobError::Shutdown)));
    }

    #[test]
    fn synchronous_job_runs_while_every_runner_is_busy() {
        let manager = manager(1);
        let blocker = CountingJob::new(vec![Outcome::Block(500)]);
        manager.enqueue(Box::new(blocker), "q", None).unwrap();
        thread::sleep(Duration::from_millis(20));

        let state = manager
            .run_synchronously(
                Box::new(CountingJob::new(vec![Outcome::Ok])),
                Duration::from_millis(300),
            )
            .unwrap();
        assert_eq!(state, Some(JobState::Succeeded));
    }

    #[test]
    fn concurrent_synchronous_callers_share_one_job() {
        let manager = manager(2);
        let first = CountingJob::new(vec![Outcome::Block(200)]);
        let first_runs = first.runs.clone();
        let second = CountingJob::new(vec![Outcome::Ok]);
        let second_runs = second.runs.clone();

        let states = thread::scope(|s| {
            let a = s.spawn(|| manager.run_synchronously_on(Box::new(first), "refresh", WAIT));
            thread::sleep(Duration::from_millis(50));
            let b = s.spawn(|| manager.run_synchronously_on(Box::new(second), "refresh", WAIT));
            [a.join().unwrap().unwrap(), b.join().unwrap().unwrap()]
        });

        assert_eq!(states, [Some(JobState::Succeeded), Some(JobState::Succeeded)]);
        assert_eq!(first_runs.load(Ordering::SeqCst), 1);
        assert_eq!(second_runs.load(Ordering::SeqCst), 0);

        let third = CountingJob::new(vec![Outcome::Ok]);
        let third_runs = third.runs.clone();
        assert_eq!(
            manager.run_synchronously_on(Box::new(third), "refresh", WAIT).unwrap(),
            Some(JobState::Succeeded)
        );
        assert_eq!(third_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn synchronous_jobs_leave_no_state_behind() {
        let manager = manager(1);
        for _ in 0..5 {
            let job = CountingJob::new(vec![Outcome::Ok]);
            assert_eq!(
                manager.run_synchronously(Box::new(job), WAIT).unwrap(),
                Some(JobState::Succeeded)
            );
        }
        let job = CountingJob::new(vec![Outcome::Ok]);
        manager.run_synchronously_on(Box::new(job), "refresh", WAIT).unwrap();

        let scheduler = manager.inner.scheduler.lock().unwrap();
        assert!(scheduler.states.is_empty());
        assert!(scheduler.waiters.is_empty());
        assert!(scheduler.in_flight.is_empty());
        assert!(scheduler.queues.is_empty());
        assert!(scheduler.busy.is_empty());
    }

    #[test]
    fn finished_states_are_bounded() {
        let manager = manager(1);
        manager.inner.scheduler.lock().unwrap().retained_states = 2;

        let ids: Vec<String> = (0..5)
            .map(|_| {
                let id = manager
                    .enqueue(Box::new(CountingJob::new(vec![Outcome::Ok])), "q", None)
                    .unwrap();
                assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::Succeeded));
                id
            })
            .collect();

        assert_eq!(manager.inner.scheduler.lock().unwrap().states.len(), 2);
        assert_eq!(manager.state(&ids[0]), None);
        assert_eq!(manager.state(&ids[4]), Some(JobState::Succeeded));
    }

    #[test]
    fn finished_jobs_leave_storage() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let manager = JobManager::new(JobManagerOptions {
            runners: 1,
            backoff: Backoff::new(1, 5),
            storage: Some(storage.clone()),
        });

        let id = manager
            .enqueue(Box::new(CountingJob::new(vec![Outcome::Ok])), "q", None)
            .unwrap();
        assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::Succeeded));
        assert!(JobStore::new(storage).load_all().unwrap().is_empty());
    }
}
