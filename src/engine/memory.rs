// src/engine/memory.rs
//
// Container memory limit detection and byte-weighted backpressure for batch work.
//
// Limits come from cgroup v2/v1 when running in a container, otherwise from
// /proc/meminfo. The batch worker acquires a permit sized to each item before
// transforming it, so a batch of large photos cannot exhaust memory at once.

use parking_lot::{Condvar, Mutex};
use std::fs;
use std::sync::{Arc, OnceLock};

/// Fallback per-item estimate when dimensions are unknown.
pub const ESTIMATED_MEMORY_PER_ITEM: u64 = 100 * 1024 * 1024;

const MIN_RESERVED_MEMORY: u64 = 64 * 1024 * 1024;
const MAX_RESERVED_MEMORY: u64 = 512 * 1024 * 1024;

/// Lower bound for any estimate to avoid zero-ish weights
const MIN_ESTIMATE_BYTES: u64 = 4 * 1024 * 1024;

/// Encoder scratch space and similar transient allocations.
const ITEM_OVERHEAD_BYTES: u64 = 8 * 1024 * 1024;

const MIN_SAFE_CONCURRENCY: usize = 1;
const MAX_MEMORY_BASED_CONCURRENCY: usize = 16;

const FALLBACK_SEMAPHORE_CAPACITY: u64 =
    ESTIMATED_MEMORY_PER_ITEM * MAX_MEMORY_BASED_CONCURRENCY as u64;

/// In-memory weighted semaphore for byte-based backpressure
#[derive(Debug)]
pub struct WeightedSemaphore {
    capacity: u64,
    state: Mutex<u64>, // available bytes
    cvar: Condvar,
}

#[derive(Debug)]
pub struct MemoryPermit {
    sem: Arc<WeightedSemaphore>,
    weight: u64,
}

impl WeightedSemaphore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(capacity),
            cvar: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        *self.state.lock()
    }

    /// Block until `weight` bytes are free. Weights above capacity are clamped
    /// so a single oversized item can still run alone.
    pub fn acquire(self: &Arc<Self>, weight: u64) -> MemoryPermit {
        let mut available = self.state.lock();
        let need = weight.min(self.capacity);
        while *available < need {
            self.cvar.wait(&mut available);
        }
        *available -= need;
        MemoryPermit {
            sem: Arc::clone(self),
            weight: need,
        }
    }

    fn release(&self, weight: u64) {
        let mut available = self.state.lock();
        *available = (*available).saturating_add(weight).min(self.capacity);
        // heterogeneous weights: notify_one could wake a waiter that still does not fit
        self.cvar.notify_all();
    }
}

impl MemoryPermit {
    pub fn weight(&self) -> u64 {
        self.weight
    }
}

impl Drop for MemoryPermit {
    fn drop(&mut self) {
        self.sem.release(self.weight);
    }
}

fn compute_semaphore_capacity() -> u64 {
    match detect_available_memory() {
        Some(mem) => mem
            .saturating_sub(compute_reserved_memory(mem))
            .max(MIN_ESTIMATE_BYTES),
        None => FALLBACK_SEMAPHORE_CAPACITY,
    }
}

static GLOBAL_MEMORY_SEMAPHORE: OnceLock<Arc<WeightedSemaphore>> = OnceLock::new();

/// Process-wide semaphore sized from detected memory.
pub fn memory_semaphore() -> Arc<WeightedSemaphore> {
    GLOBAL_MEMORY_SEMAPHORE
        .get_or_init(|| Arc::new(WeightedSemaphore::new(compute_semaphore_capacity())))
        .clone()
}

/// Peak bytes for transforming one RGBA image of this size.
///
/// The transform works in place, so the peak is the buffer itself plus
/// transient encoder/decoder scratch.
pub fn estimate_transform_memory(width: u32, height: u32) -> u64 {
    let pixels = width as u64 * height as u64;
    pixels
        .saturating_mul(4)
        .saturating_add(ITEM_OVERHEAD_BYTES)
        .max(MIN_ESTIMATE_BYTES)
}

/// Reserve 5% of total for the OS and runtime, clamped to [64MB, 512MB].
fn compute_reserved_memory(total_bytes: u64) -> u64 {
    (total_bytes / 20).clamp(MIN_RESERVED_MEMORY, MAX_RESERVED_MEMORY)
}

/// Bytes this process can use: the cgroup limit when one is set, else the
/// kernel's `MemAvailable` estimate.
pub fn detect_available_memory() -> Option<u64> {
    cgroup_memory_limit().or_else(|| {
        fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|m| parse_meminfo_available(&m))
    })
}

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

fn cgroup_memory_limit() -> Option<u64> {
    let own = fs::read_to_string("/proc/self/cgroup")
        .ok()
        .and_then(|c| unified_cgroup_path(&c))
        .unwrap_or_default();
    let candidates = [
        format!("{CGROUP_ROOT}{}/memory.max", own.trim_end_matches('/')),
        format!("{CGROUP_ROOT}/memory.max"),
        format!("{CGROUP_ROOT}/memory/memory.limit_in_bytes"),
    ];
    candidates
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .and_then(|content| parse_limit(&content))
}

/// `memory.max` / `memory.limit_in_bytes` content. "max" and the v1
/// near-`i64::MAX` sentinel both mean unlimited.
fn parse_limit(content: &str) -> Option<u64> {
    const UNLIMITED_V1: u64 = 1 << 60;
    match content.trim() {
        "max" => None,
        value => value.parse::<u64>().ok().filter(|&v| v < UNLIMITED_V1),
    }
}

/// Path of the unified (v2) hierarchy entry, e.g. `0::/user.slice/app.scope`.
fn unified_cgroup_path(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim().to_string())
}

fn parse_meminfo_available(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// How many items can run at once without risking OOM.
///
/// Takes the minimum of the CPU-based count and what fits in usable memory at
/// the conservative per-item estimate.
pub fn calculate_memory_based_concurrency(
    available_memory: Option<u64>,
    cpu_based_concurrency: usize,
) -> usize {
    let Some(mem) = available_memory else {
        return cpu_based_concurrency.max(MIN_SAFE_CONCURRENCY);
    };
    let usable = mem.saturating_sub(compute_reserved_memory(mem));
    let memory_limit = (usable / ESTIMATED_MEMORY_PER_ITEM)
        .clamp(1, MAX_MEMORY_BASED_CONCURRENCY as u64) as usize;
    memory_limit
        .min(cpu_based_concurrency)
        .max(MIN_SAFE_CONCURRENCY)
}
