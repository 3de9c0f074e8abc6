use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;

use serde_json::json;

use super::*;
use crate::testing::temp_db;

fn fast_settings(workers: usize) -> WorkerSettings {
    WorkerSettings {
        workers,
        lease: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
        cancel_poll_interval: Duration::from_millis(10),
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    }
}

#[derive(Default)]
struct Recorder {
    runs: AtomicUsize,
    order: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

enum Behaviour {
    Succeed,
    Retry,
    Terminal,
    Slow(Duration),
    WaitForCancel,
}

struct TestHandler {
    recorder: Arc<Recorder>,
    behaviour: Behaviour,
}

#[async_trait]
impl JobHandler for TestHandler {
    async fn handle(&self, context: &JobContext) -> Result<(), JobError> {
        self.recorder.runs.fetch_add(1, Ordering::SeqCst);
        let active = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_active.fetch_max(active, Ordering::SeqCst);
        let payload: serde_json::Value = context.payload()?;
        self.recorder
            .order
            .lock()
            .expect("order")
            .push(payload["name"].as_str().unwrap_or_default().to_string());

        let result = match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Retry => Err(JobError::Retryable("upstream unavailable".to_string())),
            Behaviour::Terminal => Err(JobError::Terminal("bad input".to_string())),
            Behaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Behaviour::WaitForCancel => {
                context.cancel_token().cancelled().await;
                Err(JobError::Cancelled)
            }
        };
        self.recorder.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn pool(jobs: &JobQueue, behaviour: Behaviour, workers: usize) -> (Arc<WorkerPool>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let handler = Arc::new(TestHandler {
        recorder: recorder.clone(),
        behaviour,
    });
    (
        Arc::new(WorkerPool::new("test-queue", handler, jobs.clone(), fast_settings(workers))),
        recorder,
    )
}

async fn wait_for_status(jobs: &JobQueue, job_id: &str, status: JobStatus) {
    for _ in 0..500 {
        let job = jobs.db().get_job(job_id).await.expect("get job").expect("job");
        if job.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {status}");
}

#[tokio::test]
async fn successful_job_is_marked_succeeded() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, recorder) = pool(&jobs, Behaviour::Succeed, 1);
    let job = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!({ "name": "a" }))
        .await
        .expect("enqueue");

    assert!(pool.run_next("worker-1", &CancellationToken::new()).await.expect("run"));
    assert!(!pool.run_next("worker-1", &CancellationToken::new()).await.expect("idle"));

    let stored = jobs.db().get_job(&job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retryable_failures_run_once_plus_the_configured_retries() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, recorder) = pool(&jobs, Behaviour::Retry, 1);
    let job = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!({ "name": "a" }))
        .await
        .expect("enqueue");

    let shutdown = CancellationToken::new();
    for _ in 0..4 {
        assert!(pool.run_next("worker-1", &shutdown).await.expect("run"));
    }
    assert!(!pool.run_next("worker-1", &shutdown).await.expect("nothing left"));

    let stored = jobs.db().get_job(&job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 4);
    assert_eq!(stored.last_error.as_deref(), Some("upstream unavailable"));
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn terminal_errors_are_not_retried() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, recorder) = pool(&jobs, Behaviour::Terminal, 1);
    let job = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!({ "name": "a" }))
        .await
        .expect("enqueue");

    pool.run_next("worker-1", &CancellationToken::new()).await.expect("run");
    assert!(!pool.run_next("worker-1", &CancellationToken::new()).await.expect("idle"));

    let stored = jobs.db().get_job(&job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn payload_decode_errors_are_terminal() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, _) = pool(&jobs, Behaviour::Succeed, 1);
    let job = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!("not an object"))
        .await
        .expect("enqueue");

    pool.run_next("worker-1", &CancellationToken::new()).await.expect("run");
    let stored = jobs.db().get_job(&job.id).await.expect("get").expect("job");
    // A string payload still decodes as a JSON value, so the handler runs.
    assert_eq!(stored.status, JobStatus::Succeeded);

    let context = JobContext::new(stored, CancellationToken::new());
    let decoded: Result<Vec<u32>, JobError> = context.payload();
    assert!(matches!(decoded, Err(JobError::Terminal(_))));
}

#[tokio::test]
async fn jobs_sharing_a_key_never_overlap_and_keep_fifo_order() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, recorder) = pool(&jobs, Behaviour::Slow(Duration::from_millis(40)), 3);

    let mut ids = Vec::new();
    for name in ["first", "second", "third"] {
        let job = jobs
            .enqueue("test-queue", "deploy:app-1", None, json!({ "name": name }))
            .await
            .expect("enqueue");
        ids.push(job.id);
    }

    let shutdown = CancellationToken::new();
    let handles = pool.spawn(&shutdown);
    for id in &ids {
        wait_for_status(&jobs, id, JobStatus::Succeeded).await;
    }
    shutdown.cancel();
    assert!(drain(handles, Duration::from_secs(5)).await);

    assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(
        *recorder.order.lock().expect("order"),
        vec!["first".to_string(), "second".to_string(), "third".to_string()]
    );
}

#[tokio::test]
async fn different_keys_run_concurrently() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, recorder) = pool(&jobs, Behaviour::Slow(Duration::from_millis(150)), 2);

    let a = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!({ "name": "a" }))
        .await
        .expect("enqueue");
    let b = jobs
        .enqueue("test-queue", "deploy:app-2", None, json!({ "name": "b" }))
        .await
        .expect("enqueue");

    let shutdown = CancellationToken::new();
    let handles = pool.spawn(&shutdown);
    wait_for_status(&jobs, &a.id, JobStatus::Succeeded).await;
    wait_for_status(&jobs, &b.id, JobStatus::Succeeded).await;
    shutdown.cancel();
    drain(handles, Duration::from_secs(5)).await;

    assert_eq!(recorder.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancel_request_reaches_a_running_handler() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, _) = pool(&jobs, Behaviour::WaitForCancel, 1);
    let job = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!({ "name": "a" }))
        .await
        .expect("enqueue");

    let shutdown = CancellationToken::new();
    let handles = pool.spawn(&shutdown);
    wait_for_status(&jobs, &job.id, JobStatus::Running).await;

    assert_eq!(jobs.cancel(&job.id).await.expect("cancel"), Some(JobStatus::Running));
    wait_for_status(&jobs, &job.id, JobStatus::Cancelled).await;

    shutdown.cancel();
    drain(handles, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn pending_jobs_are_cancelled_without_running() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, recorder) = pool(&jobs, Behaviour::Succeed, 1);
    let job = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!({ "name": "a" }))
        .await
        .expect("enqueue");

    assert_eq!(
        jobs.cancel_key("deploy:app-1").await.expect("cancel"),
        vec![job.id.clone()]
    );
    assert!(!pool.run_next("worker-1", &CancellationToken::new()).await.expect("idle"));
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_interrupts_and_requeues_in_flight_jobs() {
    let jobs = JobQueue::new(temp_db().await, 3);
    let (pool, _) = pool(&jobs, Behaviour::WaitForCancel, 1);
    let job = jobs
        .enqueue("test-queue", "deploy:app-1", None, json!({ "name": "a" }))
        .await
        .expect("enqueue");

    let shutdown = CancellationToken::new();
    let handles = pool.spawn(&shutdown);
    wait_for_status(&jobs, &job.id, JobStatus::Running).await;

    shutdown.cancel();
    assert!(drain(handles, Duration::from_secs(5)).await);

    let stored = jobs.db().get_job(&job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.last_error.as_deref(), Some("interrupted by shutdown"));
}

#[test]
fn backoff_grows_exponentially_within_jitter_and_cap() {
    let base = Duration::from_secs(2);
    let max = Duration::from_secs(60);

    for attempt in 1..=3 {
        let full = base * (1 << (attempt - 1));
        let delay = backoff_delay(attempt, base, max);
        assert!(delay <= full, "attempt {attempt}: {delay:?}");
        assert!(delay >= full - full / 4, "attempt {attempt}: {delay:?}");
    }
    assert!(backoff_delay(30, base, max) <= max);
    assert_eq!(backoff_delay(1, Duration::ZERO, max), Duration::ZERO);
}
