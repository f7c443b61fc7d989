// src/engine/batch.rs
//
// Batch processing: many independent items on the global rayon pool.
//
// BatchWorker only sees buffers, parameters and ids. BatchCoordinator owns the
// per-image records (source bytes, upload metadata, status) and drives the
// worker. One item failing never affects its siblings.

use super::buffer::PixelBuffer;
use super::common::{run_with_panic_policy, EngineResult};
use super::config::{EngineConfig, IntakeLimits};
use super::decoder::{decode_image, peek_dimensions};
use super::encoder::{EncodedPayload, Encoder, ExportPlan};
use super::io::{OriginalFileInfo, Source};
use super::memory;
use super::pipeline::{self, DEFAULT_GRAIN_SEED};
use super::pool;
use crate::error::MonotoneError;
use crate::ops::{FilterParameters, OutputFormat};
use crossbeam::channel::{self, Receiver, Sender};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One unit of batch work.
#[derive(Debug)]
pub struct BatchItem {
    pub id: u64,
    pub buffer: PixelBuffer,
    pub params: FilterParameters,
    pub grain_seed: Option<u64>,
}

impl BatchItem {
    pub fn new(id: u64, buffer: PixelBuffer, params: FilterParameters) -> Self {
        Self {
            id,
            buffer,
            params,
            grain_seed: None,
        }
    }
}

#[derive(Debug)]
pub struct BatchResponse {
    pub id: u64,
    pub result: EngineResult<PixelBuffer>,
}

/// Runs batch items on the shared pool and reports them in completion order.
pub struct BatchWorker {
    tx: Sender<BatchResponse>,
    rx: Receiver<BatchResponse>,
    in_flight: Arc<AtomicUsize>,
}

impl Default for BatchWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchWorker {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Worker whose pool is sized from `config` when the pool is not built yet.
    pub fn with_config(config: &EngineConfig) -> Self {
        pool::init(config);
        Self::new()
    }

    /// Queue one item. Its response arrives on [`BatchWorker::recv`].
    pub fn submit(&self, item: BatchItem) {
        self.submit_with(item, self.tx.clone());
    }

    /// Queue one item, answering on `tx` instead of the shared channel.
    fn submit_with(&self, item: BatchItem, tx: Sender<BatchResponse>) {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        pool::get_pool().spawn(move || {
            let id = item.id;
            let result = process_item(item);
            in_flight.fetch_sub(1, Ordering::AcqRel);
            // The receiver lives as long as the worker; a send error means nobody listens
            let _ = tx.send(BatchResponse { id, result });
        });
    }

    /// Items submitted but not yet reported.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Next finished item, blocking.
    pub fn recv(&self) -> EngineResult<BatchResponse> {
        self.rx
            .recv()
            .map_err(|_| MonotoneError::worker_unavailable())
    }

    pub fn try_recv(&self) -> Option<BatchResponse> {
        self.rx.try_recv().ok()
    }

    /// Submit every item and wait for all of them. Results are in completion order.
    pub fn run_all(&self, items: Vec<BatchItem>) -> EngineResult<Vec<BatchResponse>> {
        let count = items.len();
        for item in items {
            self.submit(item);
        }
        (0..count).map(|_| self.recv()).collect()
    }
}

fn process_item(item: BatchItem) -> EngineResult<PixelBuffer> {
    let BatchItem {
        id,
        buffer,
        params,
        grain_seed,
    } = item;
    let (width, height) = buffer.dimensions();
    let _permit = memory::memory_semaphore().acquire(memory::estimate_transform_memory(width, height));
    let started = Instant::now();
    let result = run_with_panic_policy("batch:transform", || {
        pipeline::transform_seeded(buffer, &params, grain_seed.unwrap_or(DEFAULT_GRAIN_SEED))
    });
    match &result {
        Ok(_) => debug!(
            target: "monotone::batch",
            id,
            width,
            height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "item transformed"
        ),
        Err(error) => warn!(target: "monotone::batch", id, %error, "item failed"),
    }
    result
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
            RecordStatus::Error => "error",
        }
    }
}

/// One uploaded image and everything known about it.
#[derive(Debug)]
pub struct ProcessedImageRecord {
    pub id: u64,
    pub source: Source,
    pub file_info: OriginalFileInfo,
    pub output_format: OutputFormat,
    pub processed: Option<PixelBuffer>,
    pub status: RecordStatus,
    pub error: Option<MonotoneError>,
}

impl ProcessedImageRecord {
    fn fail(&mut self, error: MonotoneError) {
        self.status = RecordStatus::Error;
        self.processed = None;
        self.error = Some(error);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.error
    }
}

/// Owns the records of one batch session.
pub struct BatchCoordinator {
    records: Vec<ProcessedImageRecord>,
    next_id: u64,
    intake: IntakeLimits,
    encoder: Encoder,
}

impl BatchCoordinator {
    /// Also seeds the batch pool from `config.batch_threads` if no pool exists yet.
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        pool::init(config);
        Ok(Self {
            records: Vec::new(),
            next_id: 1,
            intake: config.intake.clone(),
            encoder: Encoder::new(config.encoder)?,
        })
    }

    /// Add a pending record. The output format starts as the upload's own.
    pub fn enqueue(&mut self, source: Source, file_info: OriginalFileInfo) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let output_format = file_info.default_output_format();
        debug!(target: "monotone::batch", id, name = %file_info.name, "record enqueued");
        self.records.push(ProcessedImageRecord {
            id,
            source,
            file_info,
            output_format,
            processed: None,
            status: RecordStatus::Pending,
            error: None,
        });
        id
    }

    pub fn records(&self) -> &[ProcessedImageRecord] {
        &self.records
    }

    pub fn record(&self, id: u64) -> Option<&ProcessedImageRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn record_mut(&mut self, id: u64) -> Option<&mut ProcessedImageRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn set_output_format(&mut self, id: u64, format: OutputFormat) -> EngineResult<()> {
        let record = self
            .record_mut(id)
            .ok_or_else(|| MonotoneError::unknown_record(id))?;
        record.output_format = format;
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<ProcessedImageRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(index))
    }

    /// Decode and transform every pending record with `params`.
    ///
    /// Intake failures mark only that record `Error`; the rest still run.
    pub fn run(&mut self, worker: &BatchWorker, params: FilterParameters) -> EngineResult<BatchSummary> {
        params.validate()?;
        let started = Instant::now();
        let intake = &self.intake;

        let decoded: Vec<(u64, EngineResult<PixelBuffer>)> = pool::get_pool().install(|| {
            self.records
                .par_iter_mut()
                .filter(|r| r.status == RecordStatus::Pending)
                .map(|record| {
                    record.status = RecordStatus::Processing;
                    (record.id, decode_source(&record.source, intake))
                })
                .collect()
        });

        // Private reply channel: other users of `worker` never see our responses
        let (reply_tx, reply_rx) = channel::unbounded();
        let mut outstanding = HashSet::new();
        for (id, result) in decoded {
            match result {
                Ok(buffer) => {
                    worker.submit_with(BatchItem::new(id, buffer, params), reply_tx.clone());
                    outstanding.insert(id);
                }
                Err(error) => {
                    warn!(target: "monotone::batch", id, %error, "intake failed");
                    if let Some(record) = self.record_mut(id) {
                        record.fail(error);
                    }
                }
            }
        }

        drop(reply_tx);

        while !outstanding.is_empty() {
            let BatchResponse { id, result } = reply_rx
                .recv()
                .map_err(|_| MonotoneError::worker_unavailable())?;
            if !outstanding.remove(&id) {
                warn!(target: "monotone::batch", id, "ignoring response this run did not dispatch");
                continue;
            }
            let Some(record) = self.record_mut(id) else {
                warn!(target: "monotone::batch", id, "response for unknown record");
                continue;
            };
            match result {
                Ok(buffer) => {
                    record.processed = Some(buffer);
                    record.status = RecordStatus::Completed;
                    record.error = None;
                }
                Err(error) => record.fail(error),
            }
        }

        let summary = self.summary();
        info!(
            target: "monotone::batch",
            completed = summary.completed,
            failed = summary.error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(summary)
    }

    /// Put failed records back in the queue for the next `run`.
    pub fn retry_failed(&mut self) -> usize {
        let mut count = 0;
        for record in self.records.iter_mut().filter(|r| r.status == RecordStatus::Error) {
            record.status = RecordStatus::Pending;
            record.error = None;
            count += 1;
        }
        count
    }

    /// Encode a completed record in its output format, named after the upload.
    pub fn export(&self, id: u64) -> EngineResult<EncodedPayload> {
        let record = self.record(id).ok_or_else(|| MonotoneError::unknown_record(id))?;
        let buffer = match (&record.status, &record.processed) {
            (RecordStatus::Completed, Some(buffer)) => buffer,
            (status, _) => {
                return Err(MonotoneError::generic(format!(
                    "record {id} is {}, not completed",
                    status.as_str()
                )))
            }
        };
        let plan = ExportPlan::for_source(&record.file_info, record.output_format);
        self.encoder.export(buffer, &plan)
    }

    pub fn summary(&self) -> BatchSummary {
        self.records
            .iter()
            .fold(BatchSummary::default(), |mut acc, record| {
                match record.status {
                    RecordStatus::Pending => acc.pending += 1,
                    RecordStatus::Processing => acc.processing += 1,
                    RecordStatus::Completed => acc.completed += 1,
                    RecordStatus::Error => acc.error += 1,
                }
                acc
            })
    }
}

fn decode_source(source: &Source, intake: &IntakeLimits) -> EngineResult<PixelBuffer> {
    source.with_bytes(|bytes| {
        intake.enforce_source_len(bytes.len())?;
        // header check first so oversized uploads never allocate pixels
        if let Some((width, height)) = peek_dimensions(bytes) {
            intake.enforce_pixels(width, height)?;
        }
        let (buffer, _) = decode_image(bytes)?;
        intake.enforce_pixels(buffer.width(), buffer.height())?;
        Ok(buffer)
    })
}
