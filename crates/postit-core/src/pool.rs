use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::error::{JobError, TransportError};
use crate::job::{Job, OutputColumns, Outcome};
use crate::policy::OutputFilter;
use crate::progress::{NoProgress, Progress};
use crate::stats::Stats;
use crate::writer::ResultWriter;

/// How a [`Dispatcher::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub submitted: usize,
    /// Jobs that reached a terminal outcome
    pub completed: usize,
    /// Jobs never started because the run was cancelled
    pub skipped: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// Current and peak number of jobs executing.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Output {
    writer: Arc<ResultWriter>,
    filter: OutputFilter,
    columns: OutputColumns,
}

/// State every job task sees.
struct Shared {
    client: Arc<Client>,
    stats: Arc<Stats>,
    output: Option<Arc<Output>>,
    progress: Arc<dyn Progress>,
    in_flight: Arc<InFlight>,
}

/// Runs submitted jobs with at most `concurrency` executing at once.
pub struct Dispatcher {
    concurrency: usize,
    client: Arc<Client>,
    stats: Arc<Stats>,
    output: Option<Arc<Output>>,
    progress: Arc<dyn Progress>,
    in_flight: Arc<InFlight>,
    cancel: CancellationToken,
    jobs: Vec<Job>,
}

impl Dispatcher {
    pub fn new(concurrency: usize, client: Arc<Client>, stats: Arc<Stats>) -> Self {
        Self {
            concurrency: concurrency.max(1),
            client,
            stats,
            output: None,
            progress: Arc::new(NoProgress),
            in_flight: Arc::new(InFlight::default()),
            cancel: CancellationToken::new(),
            jobs: Vec::new(),
        }
    }

    pub fn with_writer(
        mut self,
        writer: Arc<ResultWriter>,
        filter: OutputFilter,
        columns: OutputColumns,
    ) -> Self {
        self.output = Some(Arc::new(Output {
            writer,
            filter,
            columns,
        }));
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn in_flight(&self) -> Arc<InFlight> {
        self.in_flight.clone()
    }

    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Queue a job. It runs exactly once on the next [`run`](Self::run).
    pub fn submit(&mut self, job: Job) {
        self.jobs.push(job);
    }

    /// Execute every queued job and wait for all of them. A freed slot is
    /// handed to the next queued job as soon as a job finishes. On
    /// cancellation no new jobs start; running ones are waited for.
    pub async fn run(&mut self) -> RunSummary {
        let start = Instant::now();
        let jobs = std::mem::take(&mut self.jobs);
        let submitted = jobs.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut launched = 0usize;
        let shared = Arc::new(Shared {
            client: self.client.clone(),
            stats: self.stats.clone(),
            output: self.output.clone(),
            progress: self.progress.clone(),
            in_flight: self.in_flight.clone(),
        });

        info!(jobs = submitted, concurrency = self.concurrency, "dispatching");

        for job in jobs {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            launched += 1;
            let shared = shared.clone();
            tasks.spawn(async move {
                let _permit = permit;
                shared.run_guarded(job).await;
            });

            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        let skipped = submitted - launched;
        let cancelled = self.cancel.is_cancelled();
        if skipped > 0 {
            warn!(skipped, "run cancelled before all jobs started");
        }

        RunSummary {
            submitted,
            completed: launched,
            skipped,
            elapsed: start.elapsed(),
            cancelled,
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "job guard task failed");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown error".to_string()
    }
}

tokio::task_local! {
    // set while a traced task is being polled; the panic hook fills it in
    static PANIC_TRACE: Arc<Mutex<Option<String>>>;
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the current one that captures a backtrace for
/// panics raised inside a traced task. Panics elsewhere are untouched.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_TRACE.try_with(|slot| {
                let trace = Backtrace::force_capture().to_string();
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(trace);
            });
            previous(info);
        }));
    });
}

/// Why a traced task produced no value.
#[derive(Debug)]
enum TaskFailure {
    /// `trace` is the stack at the panic site
    Panicked { message: String, trace: String },
    Aborted,
}

/// Run `fut` on its own task and turn a panic into a [`TaskFailure`].
async fn spawn_traced<F>(fut: F) -> Result<F::Output, TaskFailure>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    install_panic_hook();
    let slot = Arc::new(Mutex::new(None));
    let handle = tokio::spawn(PANIC_TRACE.scope(slot.clone(), fut));

    match handle.await {
        Ok(output) => Ok(output),
        Err(e) if e.is_panic() => {
            let trace = slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .unwrap_or_else(|| "backtrace unavailable".to_string());
            Err(TaskFailure::Panicked {
                message: panic_message(e.into_panic()),
                trace,
            })
        }
        Err(_) => Err(TaskFailure::Aborted),
    }
}

impl Shared {
    /// Run one job on its own task so a panic anywhere in it becomes an
    /// error outcome for that job alone.
    async fn run_guarded(self: Arc<Self>, job: Job) {
        let _in_flight = self.in_flight.enter();
        let id = job.id;
        let record = job.record.clone();
        let recorded = Arc::new(AtomicBool::new(false));
        let start = Instant::now();

        let task = {
            let shared = self.clone();
            let recorded = recorded.clone();
            async move { shared.execute(job, &recorded).await }
        };

        let error = match spawn_traced(task).await {
            Ok(()) => None,
            Err(TaskFailure::Panicked { message, trace }) => {
                error!(job_id = id, error = %message, stacktrace = %trace, "job panicked");
                Some(JobError::Panic(message))
            }
            Err(TaskFailure::Aborted) => {
                warn!(job_id = id, "job task cancelled");
                Some(JobError::Transport(TransportError::Cancelled))
            }
        };

        // a panic after stats were updated already has its outcome
        if let Some(error) = error {
            if !recorded.load(Ordering::SeqCst) {
                let outcome = Outcome {
                    job_id: id,
                    record,
                    result: Err(error),
                    elapsed: start.elapsed(),
                };
                self.finish(&outcome, &recorded);
            }
        }

        self.stats.record_completion();
        self.progress.inc();
    }

    async fn execute(&self, job: Job, recorded: &AtomicBool) {
        let start = Instant::now();
        let result = match &job.request {
            Ok(request) => self.client.execute(request).await.map_err(JobError::from),
            Err(e) => Err(JobError::from(e.clone())),
        };
        let elapsed = match &result {
            Ok(response) => response.duration,
            Err(_) => start.elapsed(),
        };

        let outcome = Outcome {
            job_id: job.id,
            record: job.record,
            result,
            elapsed,
        };
        self.finish(&outcome, recorded);
    }

    /// Stats update then write decision, in that order.
    fn finish(&self, outcome: &Outcome, recorded: &AtomicBool) {
        match &outcome.result {
            Ok(response) => {
                debug!(
                    job_id = outcome.job_id,
                    status = response.status,
                    attempts = response.attempts,
                    "job done"
                );
                self.stats.record_status(response.status, outcome.elapsed);
            }
            Err(e) => {
                warn!(
                    job_id = outcome.job_id,
                    category = e.category(),
                    error = %e,
                    "job failed"
                );
                self.stats.record_failure(&e.to_string());
            }
        }
        recorded.store(true, Ordering::SeqCst);

        let Some(output) = &self.output else {
            return;
        };
        if !output.filter.should_write(outcome.status()) {
            return;
        }
        if let Err(e) = output.writer.write(&outcome.to_row(&output.columns)) {
            error!(job_id = outcome.job_id, error = %e, "failed to write output row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Response, Transport, TransportFuture};
    use crate::metrics::TransportMetrics;
    use crate::record::Record;
    use crate::request::Request;
    use crate::writer::tests::SharedBuf;
    use rand::Rng;
    use reqwest::header::HeaderMap;
    use url::Url;

    fn job(id: usize) -> Job {
        let headers: Arc<[String]> = vec!["id".to_string()].into();
        let record = Record::new(headers, vec![id.to_string()], "request_body");
        let request = Request {
            method: reqwest::Method::GET,
            url: Url::parse(&format!("http://localhost/get/{id}")).unwrap(),
            headers: HeaderMap::new(),
            body: None,
        };
        Job::new(id, record, Ok(request))
    }

    fn ok(status: u16, duration: Duration) -> Response {
        Response {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
            duration,
            attempts: 1,
        }
    }

    /// Sleeps 0-50ms and tracks how many calls overlap.
    #[derive(Default)]
    struct Sleepy {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Transport for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        fn send<'a>(&'a self, _request: &'a Request) -> TransportFuture<'a> {
            Box::pin(async move {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                let ms = rand::thread_rng().gen_range(0..=50);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(ok(200, Duration::from_millis(ms)))
            })
        }
    }

    /// Panics for every third job id.
    struct Flaky;

    impl Transport for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
            Box::pin(async move {
                let id: usize = request
                    .url
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                if id % 3 == 0 {
                    panic!("boom on job {id}");
                }
                Ok(ok(if id % 2 == 0 { 200 } else { 404 }, Duration::from_millis(1)))
            })
        }
    }

    fn client(transport: Arc<dyn Transport>, stats: &Stats) -> Arc<Client> {
        Arc::new(Client::new(transport, stats.transport(), 0, Duration::ZERO))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bound_and_completion() {
        let stats = Arc::new(Stats::new());
        let transport = Arc::new(Sleepy::default());
        let mut dispatcher = Dispatcher::new(5, client(transport.clone(), &stats), stats.clone());
        for id in 1..=100 {
            dispatcher.submit(job(id));
        }
        assert_eq!(dispatcher.pending(), 100);

        let summary = dispatcher.run().await;
        assert_eq!(summary.completed, 100);
        assert_eq!(summary.skipped, 0);
        assert_eq!(stats.completed(), 100);
        assert_eq!(stats.snapshot(&[]).outcomes(), 100);
        assert!(transport.peak.load(Ordering::SeqCst) <= 5);
        assert!(dispatcher.in_flight().peak() <= 5);
        assert_eq!(dispatcher.in_flight().current(), 0);
    }

    #[tokio::test]
    async fn test_fewer_slots_than_jobs_does_not_deadlock() {
        let stats = Arc::new(Stats::new());
        let client = client(Arc::new(Sleepy::default()), &stats);
        let mut dispatcher = Dispatcher::new(1, client, stats.clone());
        for id in 1..=10 {
            dispatcher.submit(job(id));
        }
        let summary = dispatcher.run().await;
        assert_eq!(summary.completed, 10);
        assert_eq!(dispatcher.in_flight().peak(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panics_become_error_outcomes() {
        let stats = Arc::new(Stats::new());
        let buf = SharedBuf::default();
        let writer = Arc::new(ResultWriter::new(Box::new(buf.clone())));
        let columns = OutputColumns::default();
        writer.write_header(&columns.header_row(&["id".to_string()])).unwrap();

        let filter = OutputFilter::new(crate::OutputPolicy::All, false);
        let mut dispatcher = Dispatcher::new(3, client(Arc::new(Flaky), &stats), stats.clone())
            .with_writer(writer.clone(), filter, columns);
        for id in 1..=9 {
            dispatcher.submit(job(id));
        }
        let summary = dispatcher.run().await;
        writer.flush().unwrap();

        assert_eq!(summary.completed, 9);
        let snap = stats.snapshot(&[]);
        assert_eq!(snap.outcomes(), 9);
        assert_eq!(snap.codes[&0], 3);
        assert!(snap.errors.iter().all(|(e, _)| e.starts_with("worker panicked")));
        // header plus one row per job
        assert_eq!(buf.contents().lines().count(), 10);
    }

    #[tokio::test]
    async fn test_panic_trace_taken_at_panic_site() {
        fn explode(id: usize) -> usize {
            if id > 0 {
                panic!("exploded on {id}");
            }
            id
        }

        let (message, trace) = match spawn_traced(async { explode(4) }).await {
            Err(TaskFailure::Panicked { message, trace }) => (message, trace),
            other => panic!("expected a panic, got {other:?}"),
        };
        assert_eq!(message, "exploded on 4");
        // captured whatever RUST_BACKTRACE says
        assert!(!trace.contains("disabled backtrace"));
        assert_ne!(trace, "backtrace unavailable");
        assert!(trace.lines().count() > 1);
    }

    #[tokio::test]
    async fn test_traced_task_returns_output() {
        assert_eq!(spawn_traced(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_build_errors_are_outcomes() {
        let stats = Arc::new(Stats::new());
        let client = client(Arc::new(Sleepy::default()), &stats);
        let mut dispatcher = Dispatcher::new(2, client, stats.clone());
        let headers: Arc<[String]> = vec!["id".to_string()].into();
        let record = Record::new(headers, vec!["1".into()], "request_body");
        dispatcher.submit(Job::new(
            1,
            record,
            Err(crate::BuildError::UnresolvedToken("name".into())),
        ));
        dispatcher.submit(job(2));

        dispatcher.run().await;
        let snap = stats.snapshot(&[]);
        assert_eq!(snap.outcomes(), 2);
        assert_eq!(snap.codes[&0], 1);
        assert_eq!(snap.errors[0].0, "unresolved template token {name}");
        // only the job with a response has a latency sample
        assert_eq!(snap.latency.count, 1);
    }

    #[tokio::test]
    async fn test_cancel_skips_unstarted_jobs() {
        let stats = Arc::new(Stats::new());
        let cancel = CancellationToken::new();
        let client = client(Arc::new(Sleepy::default()), &stats);
        let mut dispatcher =
            Dispatcher::new(2, client, stats.clone()).with_cancellation(cancel.clone());
        for id in 1..=50 {
            dispatcher.submit(job(id));
        }

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            trigger.cancel();
        });

        let summary = dispatcher.run().await;
        assert!(summary.cancelled);
        assert!(summary.skipped > 0);
        assert_eq!(summary.completed + summary.skipped, 50);
        assert_eq!(stats.snapshot(&[]).outcomes(), summary.completed as u64);
    }

    #[tokio::test]
    async fn test_retried_attempts_stay_out_of_job_stats() {
        struct AlwaysBusy;
        impl Transport for AlwaysBusy {
            fn name(&self) -> &'static str {
                "busy"
            }
            fn send<'a>(&'a self, _request: &'a Request) -> TransportFuture<'a> {
                Box::pin(async { Ok(ok(503, Duration::from_millis(1))) })
            }
        }

        let stats = Arc::new(Stats::new());
        let metrics: Arc<TransportMetrics> = stats.transport();
        let client = Client::new(Arc::new(AlwaysBusy), metrics, 2, Duration::from_millis(1));
        let client = Arc::new(client);
        let mut dispatcher = Dispatcher::new(2, client, stats.clone());
        dispatcher.submit(job(1));
        dispatcher.submit(job(2));
        dispatcher.run().await;

        let snap = stats.snapshot(&[]);
        assert_eq!(snap.codes[&503], 2);
        assert_eq!(snap.latency.count, 2);
        assert_eq!(snap.transport.attempts(), 6);
    }
}
