// src/engine/pool.rs
//
// Global thread pool for batch processing.
//
// One pool for all batches instead of one per batch: threads are reused and
// the thread count stays predictable. The pool is built once, either by
// `init` with a caller's config or lazily on first use from the environment.
// Configuration changes after that have no effect.
//
// Thread count: `batch_threads` / `MONOTONE_BATCH_THREADS` when set, otherwise available
// parallelism minus one (the dispatch worker keeps its own thread), capped by
// what fits in detected memory.

use super::config::EngineConfig;
use super::memory;
use rayon::ThreadPool;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Minimum number of rayon threads to ensure at least some parallelism
const MIN_RAYON_THREADS: usize = 1;

/// Threads kept free for the dispatch worker and the host's own loop.
const RESERVED_THREADS: usize = 1;

static GLOBAL_THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();

pub fn get_pool() -> &'static ThreadPool {
    GLOBAL_THREAD_POOL.get_or_init(|| build_pool(thread_count(&EngineConfig::from_env())))
}

/// Build the pool from `config` unless it already exists. Returns the size of
/// the pool actually in use.
pub fn init(config: &EngineConfig) -> usize {
    let wanted = thread_count(config);
    let actual = GLOBAL_THREAD_POOL
        .get_or_init(|| build_pool(wanted))
        .current_num_threads();
    if actual != wanted {
        debug!(
            target: "monotone::batch",
            wanted,
            actual,
            "batch pool already running, keeping its size"
        );
    }
    actual
}

fn build_pool(num_threads: usize) -> ThreadPool {
    let builder = || {
        rayon::ThreadPoolBuilder::new().thread_name(|i| format!("monotone-batch-{i}"))
    };
    match builder().num_threads(num_threads).build() {
        Ok(pool) => {
            info!(target: "monotone::batch", num_threads, "batch pool ready");
            pool
        }
        Err(e) => {
            warn!(target: "monotone::batch", error = %e, num_threads, "falling back to single-thread pool");
            // A one-thread pool only fails if the OS refuses to spawn threads at all
            builder()
                .num_threads(MIN_RAYON_THREADS)
                .build()
                .unwrap_or_else(|e| panic!("cannot spawn batch thread pool: {e}"))
        }
    }
}

/// Pool size for `config`: explicit override, else CPU and memory aware.
pub fn thread_count(config: &EngineConfig) -> usize {
    if let Some(n) = config.batch_threads {
        return n.max(MIN_RAYON_THREADS);
    }
    calculate_optimal_concurrency()
}

/// Combines CPU-based parallelism with memory-aware limits so constrained
/// containers do not get OOM-killed.
pub fn calculate_optimal_concurrency() -> usize {
    let cpu_based = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_RAYON_THREADS)
        .saturating_sub(RESERVED_THREADS)
        .max(MIN_RAYON_THREADS);
    memory::calculate_memory_based_concurrency(memory::detect_available_memory(), cpu_based)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_thread_count_wins() {
        let config = EngineConfig {
            batch_threads: Some(3),
            ..EngineConfig::default()
        };
        assert_eq!(thread_count(&config), 3);
    }

    #[test]
    fn automatic_thread_count_is_positive() {
        assert!(thread_count(&EngineConfig::default()) >= 1);
    }

    #[test]
    fn init_reports_size_of_running_pool() {
        let first = init(&EngineConfig::default());
        assert_eq!(first, get_pool().current_num_threads());
        // later configs cannot resize a built pool
        let config = EngineConfig {
            batch_threads: Some(first + 5),
            ..EngineConfig::default()
        };
        assert_eq!(init(&config), first);
    }

    #[test]
    fn global_pool_runs_work() {
        let sum: u32 = get_pool().install(|| {
            use rayon::prelude::*;
            (1..=10u32).into_par_iter().sum()
        });
        assert_eq!(sum, 55);
    }
}
