//! A persistent worker pool distributing index ranges across threads.
//!
//! The pool implements a parallel for loop: the body receives the first
//! index and the length of a chunk and iterates over that range. Chunks are
//! handed out through a single atomic counter so that in-flight work never
//! contends on the pool mutex. Between calls the workers sleep on a
//! condition variable and consume no CPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::{bail, Result};

/// Empirical multiplier on the thread count to achieve acceptable load
/// balancing while keeping the chunk hand-out overhead low.
const CHUNKS_PER_THREAD: usize = 8;

type Job = Arc<dyn Fn(usize, usize) -> Result<()> + Send + Sync>;

struct PoolState {
    job: Option<Job>,
    chunk_size: usize,
    max_index: usize,
    /// One flag per thread (index 0 is the parent); true while working.
    active: Vec<bool>,
    /// First error raised by any thread during the current call.
    error: Option<anyhow::Error>,
    terminate: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Wakes the worker threads when new work is published.
    wake_workers: Condvar,
    /// Wakes the parent thread when all workers went idle.
    wake_parent: Condvar,
    /// First index of the next available chunk.
    next: AtomicUsize,
    /// Number of chunks in the current call; stored as an atomic so that a
    /// failing thread can revoke all remaining work, which every worker
    /// notices at its next chunk fetch.
    num_chunks: AtomicUsize,
}

impl PoolShared {
    /// Fetches and runs chunks until none are left or the body fails.
    fn do_work(&self, job: &Job, chunk_size: usize, max_index: usize) {
        loop {
            let chunk = self.next.fetch_add(1, Ordering::Relaxed);
            if chunk >= self.num_chunks.load(Ordering::Acquire) {
                break;
            }
            let first = chunk * chunk_size;
            let count = chunk_size.min(max_index - first);
            if let Err(error) = job(first, count) {
                self.report_error(error);
                break;
            }
        }
    }

    /// Stores the first error and revokes the remaining chunks so that the
    /// other threads drain at their next fetch. Later errors are discarded.
    fn report_error(&self, error: anyhow::Error) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(error);
            self.num_chunks.store(0, Ordering::Release);
        }
    }

    fn workers_active(state: &PoolState) -> bool {
        state.active.iter().skip(1).any(|&flag| flag)
    }

    /// The loop executed by each worker thread.
    fn run(&self, thread_index: usize) {
        loop {
            let (job, chunk_size, max_index) = {
                let mut state = self.state.lock().unwrap();

                // indicate that this thread is no longer doing work, and
                // tell the parent when it was the last one
                state.active[thread_index] = false;
                if !Self::workers_active(&state) {
                    self.wake_parent.notify_all();
                }

                // wait for new work
                loop {
                    state = self.wake_workers.wait(state).unwrap();
                    if state.terminate {
                        return;
                    }
                    if state.active[thread_index] {
                        break;
                    }
                }
                (
                    state.job.clone().expect("active worker without a job"),
                    state.chunk_size,
                    state.max_index,
                )
            };

            self.do_work(&job, chunk_size, max_index);
        }
    }
}

/// A fixed set of threads executing a caller-supplied body over an index
/// range, reusable across many calls.
///
/// The constructing thread is thread 0: it participates in the work during
/// [`WorkerPool::call`] and is the only thread allowed to invoke it.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    parent: ThreadId,
    thread_count: usize,
}

impl WorkerPool {
    /// Creates a pool with the given total number of threads (including the
    /// calling thread).
    pub fn new(thread_count: usize) -> Result<Self> {
        let thread_count = thread_count.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                job: None,
                chunk_size: 0,
                max_index: 0,
                active: vec![true; thread_count],
                error: None,
                terminate: false,
            }),
            wake_workers: Condvar::new(),
            wake_parent: Condvar::new(),
            next: AtomicUsize::new(0),
            num_chunks: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(thread_count - 1);
        for index in 1..thread_count {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || shared.run(index)));
        }

        let pool = Self {
            shared,
            handles,
            parent: thread::current().id(),
            thread_count,
        };
        pool.wait_for_workers();
        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Invokes `body(first_index, count)` over chunks that exactly cover
    /// `0..max_index`, distributed over all threads. Returns after every
    /// thread is idle again; the first error raised by any invocation of
    /// the body is returned and no further chunks are handed out after it.
    pub fn call<F>(&self, body: F, max_index: usize) -> Result<()>
    where
        F: Fn(usize, usize) -> Result<()> + Send + Sync + 'static,
    {
        self.call_chunked(body, max_index, false)
    }

    /// Same as [`WorkerPool::call`], optionally with single-index chunks so
    /// the body may ignore its count argument.
    pub fn call_chunked<F>(&self, body: F, max_index: usize, chunks_of_one: bool) -> Result<()>
    where
        F: Fn(usize, usize) -> Result<()> + Send + Sync + 'static,
    {
        if thread::current().id() != self.parent {
            bail!("worker pool call not invoked from the thread that constructed the pool");
        }

        // determine the chunk partition of the index range
        let (num_chunks, chunk_size) = if max_index == 0 {
            (0, 1)
        } else if chunks_of_one {
            (max_index, 1)
        } else {
            let chunk_size = max_index.div_ceil(CHUNKS_PER_THREAD * self.thread_count).max(1);
            (max_index.div_ceil(chunk_size), chunk_size)
        };

        let job: Job = Arc::new(body);
        {
            let mut state = self.shared.state.lock().unwrap();
            state.job = Some(Arc::clone(&job));
            state.chunk_size = chunk_size;
            state.max_index = max_index;
            state.active = vec![true; self.thread_count];
            state.error = None;
            self.shared.next.store(0, Ordering::Relaxed);
            self.shared.num_chunks.store(num_chunks, Ordering::Release);
            self.shared.wake_workers.notify_all();
        }

        // do some work ourselves as well
        self.shared.do_work(&job, chunk_size, max_index);
        self.wait_for_workers();

        let mut state = self.shared.state.lock().unwrap();
        state.active[0] = false;
        state.job = None;
        match state.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn wait_for_workers(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while PoolShared::workers_active(&state) {
            state = self.shared.wake_parent.wait(state).unwrap();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.terminate = true;
            self.shared.wake_workers.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// A value instantiated lazily once per thread: one instance per worker
/// plus one for the parent. Used for accumulation state that must not be
/// shared across threads.
pub struct PerThread<T> {
    slots: RwLock<HashMap<ThreadId, Arc<Mutex<T>>>>,
}

impl<T: Default> PerThread<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// The calling thread's instance, created on first use.
    pub fn local(&self) -> Arc<Mutex<T>> {
        let id = thread::current().id();
        if let Some(slot) = self.slots.read().unwrap().get(&id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap();
        Arc::clone(slots.entry(id).or_default())
    }

    /// All instances created so far, across threads.
    pub fn all(&self) -> Vec<Arc<Mutex<T>>> {
        self.slots.read().unwrap().values().cloned().collect()
    }
}

impl<T: Default> Default for PerThread<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_call_covers_range_exactly_once() -> Result<()> {
        let pool = WorkerPool::new(4)?;
        let chunks: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let threads: Arc<Mutex<std::collections::HashSet<ThreadId>>> =
            Arc::new(Mutex::new(std::collections::HashSet::new()));

        let chunks_clone = Arc::clone(&chunks);
        let threads_clone = Arc::clone(&threads);
        pool.call(
            move |first, count| {
                chunks_clone.lock().unwrap().push((first, count));
                threads_clone.lock().unwrap().insert(thread::current().id());
                Ok(())
            },
            100,
        )?;

        let mut seen = vec![false; 100];
        let recorded = chunks.lock().unwrap();
        let mut total = 0;
        for &(first, count) in recorded.iter() {
            total += count;
            for i in first..first + count {
                assert!(!seen[i], "index {i} visited twice");
                seen[i] = true;
            }
        }
        assert_eq!(total, 100);
        assert!(seen.iter().all(|&s| s));
        assert!(threads.lock().unwrap().len() <= 4);
        Ok(())
    }

    #[test]
    fn test_call_with_zero_indices_returns_immediately() -> Result<()> {
        let pool = WorkerPool::new(3)?;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        pool.call(
            move |_, _| {
                calls_clone.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            0,
        )?;
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        Ok(())
    }

    #[test]
    fn test_chunks_of_one() -> Result<()> {
        let pool = WorkerPool::new(2)?;
        let sum = Arc::new(AtomicU64::new(0));
        let sum_clone = Arc::clone(&sum);
        pool.call_chunked(
            move |first, count| {
                assert_eq!(count, 1);
                sum_clone.fetch_add(first as u64, Ordering::Relaxed);
                Ok(())
            },
            10,
            true,
        )?;
        assert_eq!(sum.load(Ordering::Relaxed), 45);
        Ok(())
    }

    #[test]
    fn test_first_error_is_returned_and_work_drains() -> Result<()> {
        let pool = WorkerPool::new(4)?;
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = Arc::clone(&invoked);
        let result = pool.call_chunked(
            move |first, _| {
                invoked_clone.fetch_add(1, Ordering::Relaxed);
                if first == 3 {
                    bail!("failure on index {first}");
                }
                Ok(())
            },
            1000,
            true,
        );

        let error = result.expect_err("error must propagate to the caller");
        assert!(error.to_string().contains("failure on index 3"));
        // after the failing index no further chunks are dispatched, so only
        // a small fraction of the range is visited
        assert!(invoked.load(Ordering::Relaxed) < 1000);

        // the pool remains usable after an error
        pool.call(|_, _| Ok(()), 10)?;
        Ok(())
    }

    #[test]
    fn test_pool_is_reusable_across_calls() -> Result<()> {
        let pool = WorkerPool::new(3)?;
        for round in 0..5 {
            let sum = Arc::new(AtomicU64::new(0));
            let sum_clone = Arc::clone(&sum);
            pool.call(
                move |first, count| {
                    let mut local = 0;
                    for i in first..first + count {
                        local += i as u64;
                    }
                    sum_clone.fetch_add(local, Ordering::Relaxed);
                    Ok(())
                },
                1000,
            )?;
            assert_eq!(sum.load(Ordering::Relaxed), 499_500, "round {round}");
        }
        Ok(())
    }

    #[test]
    fn test_call_from_foreign_thread_is_rejected() -> Result<()> {
        let pool = Arc::new(WorkerPool::new(2)?);
        let pool_clone = Arc::clone(&pool);
        let result = thread::spawn(move || pool_clone.call(|_, _| Ok(()), 10))
            .join()
            .unwrap();
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_single_threaded_pool_runs_in_parent() -> Result<()> {
        let pool = WorkerPool::new(1)?;
        let here = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let ran_on_clone = Arc::clone(&ran_on);
        pool.call(
            move |_, _| {
                *ran_on_clone.lock().unwrap() = Some(thread::current().id());
                Ok(())
            },
            5,
        )?;
        assert_eq!(*ran_on.lock().unwrap(), Some(here));
        Ok(())
    }

    #[test]
    fn test_per_thread_slots() {
        let per_thread: Arc<PerThread<Vec<usize>>> = Arc::new(PerThread::new());
        per_thread.local().lock().unwrap().push(1);
        per_thread.local().lock().unwrap().push(2);

        let clone = Arc::clone(&per_thread);
        thread::spawn(move || {
            clone.local().lock().unwrap().push(3);
        })
        .join()
        .unwrap();

        let all = per_thread.all();
        assert_eq!(all.len(), 2);
        let total: usize = all.iter().map(|s| s.lock().unwrap().len()).sum();
        assert_eq!(total, 3);
    }
}
