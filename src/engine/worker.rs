// src/engine/worker.rs
//
// Preview/final dispatch: one background thread per worker, fed by a channel.
// Every submit gets an increasing id; when several requests are waiting, only
// the newest runs and the rest are reported as superseded.

use super::buffer::{PixelBuffer, TransformRequest, TransformResponse};
use super::common::{run_with_panic_policy, EngineResult};
use super::config::EngineConfig;
use super::pipeline;
use super::resize::downsample_for_preview;
use crate::error::MonotoneError;
use crate::ops::{FilterParameters, RenderMode};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Receipt for a submitted request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub id: u64,
    pub mode: RenderMode,
}

/// Outcome of one submitted request. Each ticket gets exactly one event.
#[derive(Debug)]
pub enum WorkerEvent {
    Completed {
        id: u64,
        response: TransformResponse,
    },
    Failed {
        id: u64,
        mode: RenderMode,
        error: MonotoneError,
    },
    /// A newer request was queued before this one started; it never ran.
    Superseded { id: u64, mode: RenderMode },
}

impl WorkerEvent {
    pub fn id(&self) -> u64 {
        match self {
            WorkerEvent::Completed { id, .. }
            | WorkerEvent::Failed { id, .. }
            | WorkerEvent::Superseded { id, .. } => *id,
        }
    }

    pub fn mode(&self) -> RenderMode {
        match self {
            WorkerEvent::Completed { response, .. } => response.mode,
            WorkerEvent::Failed { mode, .. } | WorkerEvent::Superseded { mode, .. } => *mode,
        }
    }

    /// The transformed buffer, or the error/supersession as an `Err`.
    pub fn into_result(self) -> EngineResult<TransformResponse> {
        match self {
            WorkerEvent::Completed { response, .. } => Ok(response),
            WorkerEvent::Failed { error, .. } => Err(error),
            WorkerEvent::Superseded { id, .. } => Err(MonotoneError::generic(format!(
                "request {id} was superseded by a newer request"
            ))),
        }
    }
}

struct Job {
    id: u64,
    request: TransformRequest,
}

/// Single-slot transform dispatcher.
///
/// Models one UI slot: a newer request always wins over an older one that has
/// not started yet, whatever the modes. Use a separate worker (or the batch
/// worker) when an export must never be dropped.
pub struct DispatchWorker {
    jobs: Option<Sender<Job>>,
    events: Receiver<WorkerEvent>,
    next_id: AtomicU64,
    latest: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    pub fn spawn() -> EngineResult<Self> {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> EngineResult<Self> {
        let preview_max = config.preview_max_dimension;
        let (job_tx, job_rx) = channel::unbounded::<Job>();
        let (event_tx, event_rx) = channel::unbounded::<WorkerEvent>();
        let handle = std::thread::Builder::new()
            .name("monotone-dispatch".to_string())
            .spawn(move || run_loop(job_rx, event_tx, preview_max))
            .map_err(|e| MonotoneError::generic(format!("failed to spawn dispatch worker: {e}")))?;
        Ok(Self {
            jobs: Some(job_tx),
            events: event_rx,
            next_id: AtomicU64::new(1),
            latest: Arc::new(AtomicU64::new(0)),
            handle: Some(handle),
        })
    }

    /// Hand `request` (and its buffer) to the worker.
    pub fn submit(&self, request: TransformRequest) -> EngineResult<Ticket> {
        let jobs = self.jobs.as_ref().ok_or_else(MonotoneError::worker_unavailable)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = Ticket {
            id,
            mode: request.mode,
        };
        // concurrent submitters may get here out of order
        self.latest.fetch_max(id, Ordering::AcqRel);
        jobs.send(Job { id, request })
            .map_err(|_| MonotoneError::worker_unavailable())?;
        debug!(target: "monotone::worker", id, mode = ticket.mode.as_str(), "request submitted");
        Ok(ticket)
    }

    pub fn submit_preview(&self, buffer: PixelBuffer, params: FilterParameters) -> EngineResult<Ticket> {
        self.submit(TransformRequest::preview(buffer, params))
    }

    pub fn submit_final(&self, buffer: PixelBuffer, params: FilterParameters) -> EngineResult<Ticket> {
        self.submit(TransformRequest::final_pass(buffer, params))
    }

    /// Highest id handed out so far (0 before the first submit).
    pub fn latest_id(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Next event in completion order, blocking.
    pub fn next_event(&self) -> EngineResult<WorkerEvent> {
        self.events
            .recv()
            .map_err(|_| MonotoneError::worker_unavailable())
    }

    pub fn try_event(&self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }

    /// Next event, or `Ok(None)` when nothing arrives within `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> EngineResult<Option<WorkerEvent>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(MonotoneError::worker_unavailable()),
        }
    }

    /// Block until the event for the latest submitted id arrives.
    ///
    /// Events for older ids are discarded on the way. A submit from another
    /// thread while waiting moves the target forward.
    pub fn wait_latest(&self) -> EngineResult<WorkerEvent> {
        loop {
            let event = self.next_event()?;
            let latest = self.latest_id();
            if event.id() >= latest {
                return Ok(event);
            }
            debug!(target: "monotone::worker", id = event.id(), latest, "discarding stale event");
        }
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        // Closing the job channel ends the loop after the current job
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "monotone::worker", "dispatch thread exited with a panic");
            }
        }
    }
}

/// Order two queued jobs by id: `(keep, stale)`. Arrival order is not id
/// order when several threads submit at once.
fn newest_of(current: Job, incoming: Job) -> (Job, Job) {
    if incoming.id > current.id {
        (incoming, current)
    } else {
        (current, incoming)
    }
}

fn supersede(events: &Sender<WorkerEvent>, stale: Job, newer: u64) -> bool {
    let mode = stale.request.mode;
    debug!(target: "monotone::worker", id = stale.id, newer, "superseded");
    events
        .send(WorkerEvent::Superseded { id: stale.id, mode })
        .is_ok()
}

fn run_loop(jobs: Receiver<Job>, events: Sender<WorkerEvent>, preview_max: u32) {
    // highest id already started; anything below it arriving late is stale
    let mut newest_started = 0u64;
    while let Ok(mut job) = jobs.recv() {
        loop {
            match jobs.try_recv() {
                Ok(incoming) => {
                    let (keep, stale) = newest_of(job, incoming);
                    job = keep;
                    if !supersede(&events, stale, job.id) {
                        return;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if job.id < newest_started {
            if !supersede(&events, job, newest_started) {
                return;
            }
            continue;
        }
        newest_started = job.id;

        let Job { id, request } = job;
        let mode = request.mode;
        let started = Instant::now();
        let event = match run_with_panic_policy("worker:transform", || process(request, preview_max)) {
            Ok(response) => {
                debug!(
                    target: "monotone::worker",
                    id,
                    mode = mode.as_str(),
                    width = response.buffer.width(),
                    height = response.buffer.height(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                );
                WorkerEvent::Completed { id, response }
            }
            Err(error) => {
                warn!(target: "monotone::worker", id, mode = mode.as_str(), %error, "request failed");
                WorkerEvent::Failed { id, mode, error }
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

fn process(request: TransformRequest, preview_max: u32) -> EngineResult<TransformResponse> {
    let TransformRequest {
        buffer,
        params,
        mode,
        grain_seed,
    } = request;
    let buffer = match mode {
        RenderMode::Preview => downsample_for_preview(buffer, preview_max)?,
        RenderMode::Final => buffer,
    };
    pipeline::run_request(TransformRequest {
        buffer,
        params,
        mode,
        grain_seed,
    })
}

/// Holds back preview requests until the sliders have been still for `delay`.
///
/// Clock-free: callers pass `now`, so it works with any event loop.
#[derive(Debug, Clone)]
pub struct PreviewDebouncer {
    delay: Duration,
    pending: Option<(FilterParameters, Instant)>,
}

impl PreviewDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.debounce)
    }

    /// Replace any pending parameters and restart the quiet period.
    pub fn schedule(&mut self, params: FilterParameters, now: Instant) {
        self.pending = Some((params, now));
    }

    /// Pending parameters once the quiet period has passed.
    pub fn take_ready(&mut self, now: Instant) -> Option<FilterParameters> {
        match self.pending {
            Some((params, at)) if now.saturating_duration_since(at) >= self.delay => {
                self.pending = None;
                Some(params)
            }
            _ => None,
        }
    }

    /// When the pending parameters become ready.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, at)| at + self.delay)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

impl Default for PreviewDebouncer {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Preset;
    use std::collections::HashMap;

    fn wait(worker: &DispatchWorker) -> WorkerEvent {
        worker
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
            .expect("worker did not answer in time")
    }

    #[test]
    fn final_request_keeps_resolution() {
        let worker = DispatchWorker::spawn().unwrap();
        let ticket = worker
            .submit_final(PixelBuffer::filled(900, 10, [200, 100, 50, 255]), Preset::Classic.params())
            .unwrap();
        assert_eq!(ticket.mode, RenderMode::Final);

        let event = wait(&worker);
        assert_eq!(event.id(), ticket.id);
        let response = event.into_result().unwrap();
        assert_eq!(response.mode, RenderMode::Final);
        assert_eq!(response.buffer.dimensions(), (900, 10));
        assert_eq!(response.buffer.pixel(0, 0), [124, 124, 124, 255]);
    }

    #[test]
    fn preview_request_is_downsampled() {
        let config = EngineConfig::default().with_preview_max_dimension(100);
        let worker = DispatchWorker::with_config(&config).unwrap();
        worker
            .submit_preview(PixelBuffer::filled(400, 200, [10, 10, 10, 255]), Preset::Soft.params())
            .unwrap();
        let response = wait(&worker).into_result().unwrap();
        assert_eq!(response.mode, RenderMode::Preview);
        assert_eq!(response.buffer.dimensions(), (100, 50));
    }

    #[test]
    fn ids_increase_monotonically() {
        let worker = DispatchWorker::spawn().unwrap();
        let a = worker.submit_preview(PixelBuffer::filled(2, 2, [0; 4]), FilterParameters::identity()).unwrap();
        let b = worker.submit_preview(PixelBuffer::filled(2, 2, [0; 4]), FilterParameters::identity()).unwrap();
        assert!(b.id > a.id);
        assert_eq!(worker.latest_id(), b.id);
    }

    #[test]
    fn every_ticket_gets_one_event_and_latest_completes() {
        let worker = DispatchWorker::spawn().unwrap();
        let tickets: Vec<Ticket> = (0..5)
            .map(|i| {
                worker
                    .submit_preview(
                        PixelBuffer::filled(300, 300, [i * 40, 0, 0, 255]),
                        Preset::FilmNoir.params(),
                    )
                    .unwrap()
            })
            .collect();

        let mut seen: HashMap<u64, WorkerEvent> = HashMap::new();
        for _ in 0..tickets.len() {
            let event = wait(&worker);
            assert!(seen.insert(event.id(), event).is_none(), "duplicate event");
        }
        for ticket in &tickets {
            assert!(seen.contains_key(&ticket.id));
        }
        let last = tickets.last().unwrap().id;
        assert!(matches!(seen.get(&last), Some(WorkerEvent::Completed { .. })));
    }

    #[test]
    fn wait_latest_skips_stale_results() {
        let worker = DispatchWorker::spawn().unwrap();
        for _ in 0..3 {
            worker
                .submit_preview(PixelBuffer::filled(64, 64, [1, 2, 3, 255]), Preset::Dramatic.params())
                .unwrap();
        }
        let last = worker
            .submit_final(PixelBuffer::filled(5, 5, [9, 9, 9, 255]), Preset::Classic.params())
            .unwrap();
        let event = worker.wait_latest().unwrap();
        assert_eq!(event.id(), last.id);
        assert_eq!(event.mode(), RenderMode::Final);
    }

    #[test]
    fn invalid_parameters_fail_without_killing_worker() {
        let worker = DispatchWorker::spawn().unwrap();
        let bad = FilterParameters::identity().with_brightness(f32::NAN);
        let ticket = worker.submit_final(PixelBuffer::filled(2, 2, [0; 4]), bad).unwrap();
        match wait(&worker) {
            WorkerEvent::Failed { id, mode, error } => {
                assert_eq!(id, ticket.id);
                assert_eq!(mode, RenderMode::Final);
                assert!(matches!(error, MonotoneError::InvalidArgument { .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let ok = worker
            .submit_final(PixelBuffer::filled(2, 2, [0; 4]), FilterParameters::identity())
            .unwrap();
        assert_eq!(wait(&worker).id(), ok.id);
    }

    #[test]
    fn recv_timeout_returns_none_when_idle() {
        let worker = DispatchWorker::spawn().unwrap();
        assert!(worker.recv_timeout(Duration::from_millis(20)).unwrap().is_none());
        assert!(worker.try_event().is_none());
    }

    fn job(id: u64) -> Job {
        Job {
            id,
            request: TransformRequest::preview(PixelBuffer::filled(1, 1, [0; 4]), FilterParameters::identity()),
        }
    }

    #[test]
    fn newest_job_is_chosen_by_id_not_arrival() {
        let (keep, stale) = newest_of(job(7), job(5));
        assert_eq!((keep.id, stale.id), (7, 5));
        let (keep, stale) = newest_of(job(5), job(7));
        assert_eq!((keep.id, stale.id), (7, 5));
    }

    #[test]
    fn late_lower_id_is_superseded_without_running() {
        let (job_tx, job_rx) = channel::unbounded();
        let (event_tx, event_rx) = channel::unbounded();
        job_tx.send(job(9)).unwrap();
        let handle = std::thread::spawn(move || run_loop(job_rx, event_tx, 800));

        let first = event_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(first, WorkerEvent::Completed { id: 9, .. }));

        job_tx.send(job(4)).unwrap();
        let late = event_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(late, WorkerEvent::Superseded { id: 4, mode: RenderMode::Preview }));

        drop(job_tx);
        handle.join().unwrap();
    }

    #[test]
    fn concurrent_submitters_converge_on_highest_id() {
        let worker = Arc::new(DispatchWorker::spawn().unwrap());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let worker = Arc::clone(&worker);
                std::thread::spawn(move || {
                    (0..20)
                        .map(|_| {
                            worker
                                .submit_preview(PixelBuffer::filled(8, 8, [3; 4]), Preset::Soft.params())
                                .unwrap()
                                .id
                        })
                        .max()
                        .unwrap()
                })
            })
            .collect();
        let highest = threads.into_iter().map(|t| t.join().unwrap()).max().unwrap();

        assert_eq!(worker.latest_id(), highest);
        let event = worker.wait_latest().unwrap();
        assert_eq!(event.id(), highest);
        assert!(matches!(event, WorkerEvent::Completed { .. }));
    }

    #[test]
    fn debouncer_waits_for_quiet_period() {
        let mut debouncer = PreviewDebouncer::new(Duration::from_millis(300));
        let t0 = Instant::now();
        debouncer.schedule(Preset::Soft.params(), t0);
        assert_eq!(debouncer.take_ready(t0 + Duration::from_millis(100)), None);

        // a new slider tick restarts the delay and replaces the params
        debouncer.schedule(Preset::Vintage.params(), t0 + Duration::from_millis(200));
        assert_eq!(debouncer.take_ready(t0 + Duration::from_millis(400)), None);
        assert_eq!(debouncer.deadline(), Some(t0 + Duration::from_millis(500)));

        assert_eq!(
            debouncer.take_ready(t0 + Duration::from_millis(500)),
            Some(Preset::Vintage.params())
        );
        assert!(!debouncer.is_pending());
        assert_eq!(debouncer.take_ready(t0 + Duration::from_secs(5)), None);
    }

    #[test]
    fn debouncer_default_uses_config_delay() {
        let mut debouncer = PreviewDebouncer::default();
        let t0 = Instant::now();
        debouncer.schedule(FilterParameters::identity(), t0);
        assert_eq!(debouncer.take_ready(t0 + Duration::from_millis(299)), None);
        debouncer.cancel();
        assert_eq!(debouncer.take_ready(t0 + Duration::from_millis(301)), None);
    }
}
