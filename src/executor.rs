use std::ops::Range;

use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::abc::Result;

/// Runs the independent candidate evaluations of a round, either on the
/// calling thread or on a dedicated rayon pool.
///
/// Results always come back in index order, so the outcome of a round does
/// not depend on how many threads evaluated it.
#[derive(Debug)]
pub enum Executor {
    Sequential,
    Pool(ThreadPool),
}

impl Executor {
    /// A pool with `num_threads` workers, or the sequential executor for
    /// `num_threads <= 1`.
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads <= 1 {
            return Ok(Executor::Sequential);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("abc-worker-{}", i))
            .build()?;
        Ok(Executor::Pool(pool))
    }

    pub fn num_threads(&self) -> usize {
        match self {
            Executor::Sequential => 1,
            Executor::Pool(pool) => pool.current_num_threads(),
        }
    }

    pub(crate) fn map<T, F>(&self, range: Range<usize>, func: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        match self {
            Executor::Sequential => range.map(func).collect(),
            Executor::Pool(pool) => pool.install(|| range.into_par_iter().map(func).collect()),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::Sequential
    }
}
