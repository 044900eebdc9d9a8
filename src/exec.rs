//! Managed execution context and native worker pool.
//!
//! The host runtime is single-threaded for managed code; native calls may
//! run on a worker. Completions and cross-thread callback invocations are
//! queued here and only ever executed when the context's home thread pumps
//! the queue, which stands in for the managed runtime's event-loop turn.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::Error;

/// Worker threads reserved for native calls.
const WORKER_COUNT: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;
type ErrorSink = Box<dyn Fn(Error) + Send + Sync + 'static>;

pub(crate) struct ContextShared {
    home: ThreadId,
    pending: Mutex<VecDeque<Job>>,
    wake: Condvar,
    error_sink: Mutex<Option<ErrorSink>>,
}

impl ContextShared {
    #[inline]
    pub(crate) fn is_home_thread(&self) -> bool {
        thread::current().id() == self.home
    }

    /// Queue a job for the next pump of the home thread.
    pub(crate) fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        self.pending.lock().push_back(Box::new(job));
        self.wake.notify_all();
    }

    /// Execute `job` on the home thread and wait for it to finish.
    ///
    /// Called from the home thread itself this dispatches inline; from any
    /// other thread it parks the caller until the home thread has pumped
    /// the job and signalled completion. This is the synchronous hand-off a
    /// native caller needs when it expects a return value from managed code.
    pub(crate) fn run_blocking(&self, job: impl FnOnce() + Send + 'static) {
        if self.is_home_thread() {
            job();
            return;
        }
        let gate = Arc::new(Gate::default());
        let opened = gate.clone();
        self.enqueue(move || {
            job();
            opened.open();
        });
        gate.wait();
    }

    /// Report a failure that must not unwind across the native boundary.
    pub(crate) fn report_error(&self, err: Error) {
        let sink = self.error_sink.lock();
        match sink.as_ref() {
            Some(f) => f(err),
            None => tracing::error!(target: "exec", error = %err, "unhandled interop failure"),
        }
    }
}

#[derive(Default)]
struct Gate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn open(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

/// The managed runtime's execution context.
///
/// Owns the completion queue and the native worker pool. Created on the
/// managed thread; `pump` and `pump_wait` must only be called from that
/// thread.
pub struct RuntimeContext {
    shared: Arc<ContextShared>,
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        let shared = Arc::new(ContextShared {
            home: thread::current().id(),
            pending: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            error_sink: Mutex::new(None),
        });
        let (tx, rx) = channel::unbounded::<Job>();
        let workers = (0..WORKER_COUNT)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
            })
            .collect();
        Self { shared, jobs: Some(tx), workers }
    }

    /// Install the sink that receives callback-side failures. Defaults to
    /// logging them.
    pub fn set_error_sink(&self, sink: impl Fn(Error) + Send + Sync + 'static) {
        *self.shared.error_sink.lock() = Some(Box::new(sink));
    }

    /// Run every queued completion and callback invocation. Returns the
    /// number of jobs executed.
    pub fn pump(&self) -> usize {
        debug_assert!(self.shared.is_home_thread(), "pump must run on the context thread");
        let mut executed = 0;
        loop {
            let job = self.shared.pending.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    executed += 1;
                }
                None => break,
            }
        }
        executed
    }

    /// Like `pump`, but parks up to `timeout` for work to arrive if the
    /// queue is empty.
    pub fn pump_wait(&self, timeout: Duration) -> usize {
        let executed = self.pump();
        if executed > 0 {
            return executed;
        }
        {
            let mut pending = self.shared.pending.lock();
            if pending.is_empty() {
                let _ = self.shared.wake.wait_for(&mut pending, timeout);
            }
        }
        self.pump()
    }

    /// Hand a native call off to the worker pool.
    pub(crate) fn spawn_native(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(jobs) = &self.jobs {
            // Send only fails when the pool is gone, i.e. during teardown.
            let _ = jobs.send(Box::new(job));
        }
    }

    pub(crate) fn shared(&self) -> Arc<ContextShared> {
        self.shared.clone()
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        // Disconnect the pool and wait for in-flight native calls to finish.
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pump_runs_enqueued_jobs_in_order() {
        let ctx = RuntimeContext::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            ctx.shared().enqueue(move || seen.lock().push(i));
        }
        assert_eq!(ctx.pump(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn run_blocking_from_home_thread_is_inline() {
        let ctx = RuntimeContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ctx.shared().run_blocking(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Nothing was queued.
        assert_eq!(ctx.pump(), 0);
    }

    #[test]
    fn run_blocking_from_foreign_thread_waits_for_the_pump() {
        let ctx = RuntimeContext::new();
        let shared = ctx.shared();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let caller = thread::spawn(move || {
            shared.run_blocking(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        });
        while !caller.is_finished() {
            ctx.pump_wait(Duration::from_millis(10));
        }
        caller.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_pool_executes_native_jobs() {
        let ctx = RuntimeContext::new();
        let gate = Arc::new(Gate::default());
        let opened = gate.clone();
        ctx.spawn_native(move || opened.open());
        gate.wait();
    }
}
