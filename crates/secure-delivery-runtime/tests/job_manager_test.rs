use secure_delivery::{FileStorageAdapter, StorageAdapter};
use secure_delivery_runtime::test_utils::{
    CountingJob, CountingJobFactory, Outcome, RunLog, COUNTING_JOB_FACTORY_KEY,
};
use secure_delivery_runtime::{Backoff, JobManager, JobManagerOptions, JobState, JobStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn manager(runners: usize, storage: Option<Arc<dyn StorageAdapter>>) -> JobManager {
    JobManager::new(JobManagerOptions {
        runners,
        backoff: Backoff::new(1, 5),
        storage,
    })
}

fn run_of(log: &RunLog, name: &str) -> (Instant, Instant) {
    let runs = log.lock().unwrap();
    let first = runs.iter().find(|r| r.name == name).unwrap();
    let last = runs.iter().rev().find(|r| r.name == name).unwrap();
    (first.started, last.finished)
}

#[test]
fn same_queue_key_runs_in_enqueue_order_without_overlap() {
    let manager = manager(4, None);
    let log = RunLog::default();

    let ids: Vec<String> = [
        CountingJob::new(vec![Outcome::Block(80)]).with_name("a"),
        CountingJob::new(vec![Outcome::Network, Outcome::Block(10)]).with_name("b"),
        CountingJob::new(vec![Outcome::Ok]).with_name("c"),
    ]
    .into_iter()
    .map(|job| {
        manager
            .enqueue(Box::new(job.with_log(log.clone())), "peer-1", None)
            .unwrap()
    })
    .collect();

    for id in &ids {
        assert_eq!(manager.wait_for(id, WAIT), Some(JobState::Succeeded));
    }

    let order: Vec<String> = log.lock().unwrap().iter().map(|r| r.name.clone()).collect();
    assert_eq!(order, vec!["a", "b", "b", "c"]);

    let (_, a_end) = run_of(&log, "a");
    let (b_start, b_end) = run_of(&log, "b");
    let (c_start, _) = run_of(&log, "c");
    assert!(a_end <= b_start);
    assert!(b_end <= c_start);
}

#[test]
fn different_queue_keys_run_concurrently() {
    let manager = manager(2, None);
    let log = RunLog::default();

    let a = manager
        .enqueue(
            Box::new(CountingJob::new(vec![Outcome::Block(300)]).with_name("a").with_log(log.clone())),
            "peer-1",
            None,
        )
        .unwrap();
    let b = manager
        .enqueue(
            Box::new(CountingJob::new(vec![Outcome::Block(300)]).with_name("b").with_log(log.clone())),
            "peer-2",
            None,
        )
        .unwrap();

    assert_eq!(manager.wait_for(&a, WAIT), Some(JobState::Succeeded));
    assert_eq!(manager.wait_for(&b, WAIT), Some(JobState::Succeeded));

    let (a_start, a_end) = run_of(&log, "a");
    let (b_start, b_end) = run_of(&log, "b");
    assert!(a_start < b_end && b_start < a_end);
}

#[test]
fn server_retry_after_replaces_backoff() {
    let manager = manager(1, None);
    let log = RunLog::default();
    let job = CountingJob::new(vec![Outcome::RetryAfter(250), Outcome::Ok]).with_log(log.clone());

    let id = manager.enqueue(Box::new(job), "q", None).unwrap();
    assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::Succeeded));

    let runs = log.lock().unwrap();
    assert_eq!(runs.len(), 2);
    let gap = runs[1].started.duration_since(runs[0].finished);
    assert!(gap >= Duration::from_millis(250), "gap was {:?}", gap);
}

#[test]
fn persisted_jobs_resume_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn StorageAdapter> = Arc::new(FileStorageAdapter::new(dir.path().to_path_buf()).unwrap());

    {
        let first = JobManager::new(JobManagerOptions {
            runners: 1,
            backoff: Backoff::new(60_000, 60_000),
            storage: Some(storage.clone()),
        });
        let blocked = first
            .enqueue(
                Box::new(CountingJob::new(vec![Outcome::Network]).with_name("a")),
                "q",
                None,
            )
            .unwrap();
        first
            .enqueue(Box::new(CountingJob::new(vec![Outcome::Ok]).with_name("b")), "q", None)
            .unwrap();

        let deadline = Instant::now() + WAIT;
        while first.state(&blocked) != Some(JobState::Retrying) {
            assert!(Instant::now() < deadline, "job never started retrying");
            thread::sleep(Duration::from_millis(5));
        }
    }

    let records = JobStore::new(storage.clone()).load_all().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].attempt, 1);

    let second = manager(1, Some(storage.clone()));
    let factory = Arc::new(CountingJobFactory::default());
    second.register_factory(COUNTING_JOB_FACTORY_KEY, factory.clone());
    assert_eq!(second.resume().unwrap(), 2);

    for record in &records {
        assert_eq!(second.wait_for(&record.id, WAIT), Some(JobState::Succeeded));
    }
    let order: Vec<(String, u32)> = factory
        .log
        .lock()
        .unwrap()
        .iter()
        .map(|r| (r.name.clone(), r.attempt))
        .collect();
    assert_eq!(order, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    assert_eq!(factory.runs.load(Ordering::SeqCst), 2);
    assert!(JobStore::new(storage).load_all().unwrap().is_empty());
}
