use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{VmError, VmResult};

/// Handle returned by [`crate::Process::run`].
pub type RunHandle = Arc<NativeThread>;

/// A named OS thread running one fallible job, observable through a done
/// flag so callers can wait with or without a deadline.
pub struct NativeThread {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: (Mutex<bool>, Condvar),
    outcome: Mutex<Option<VmResult<()>>>,
}

/// Raises the done flag when dropped, so a panicking job still wakes waiters.
struct DoneGuard<'a>(&'a (Mutex<bool>, Condvar));

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        let (ref mx, ref cv) = *self.0;
        *mx.lock() = true;
        cv.notify_all();
    }
}

impl NativeThread {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> VmResult<Arc<Self>>
    where
        F: FnOnce() -> VmResult<()>,
        F: Send + 'static,
    {
        let jt = Arc::new(Self {
            name: name.into(),
            handle: Mutex::new(None),
            done: (Mutex::new(false), Condvar::new()),
            outcome: Mutex::new(None),
        });

        let jt2 = Arc::clone(&jt);
        let h = thread::Builder::new()
            .name(jt.name.clone())
            .spawn(move || {
                let _done = DoneGuard(&jt2.done);
                let outcome = f();
                *jt2.outcome.lock() = Some(outcome);
            })?;
        *jt.handle.lock() = Some(h);
        Ok(jt)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the job has returned (or panicked).
    pub fn finished(&self) -> bool {
        *self.done.0.lock()
    }

    /// Waits at most `dur` for the job. Returns whether it finished.
    pub fn join_timeout(&self, dur: Duration) -> bool {
        // fast path
        {
            if *self.done.0.lock() {
                return true;
            }
        }
        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        if *done {
            return true;
        }
        let res = cv.wait_for(&mut done, dur);
        !res.timed_out() || *done
    }

    /// Blocks until the job finished and hands over its result. Only the first
    /// joiner receives the job's error; later joins report `Ok`.
    pub fn join(&self) -> VmResult<()> {
        let handle = self.handle.lock().take();
        if let Some(h) = handle {
            if h.join().is_err() {
                return Err(VmError::Panicked(self.name.clone()));
            }
        }

        let (ref mx, ref cv) = self.done;
        let mut done = mx.lock();
        while !*done {
            cv.wait(&mut done);
        }
        drop(done);
        self.outcome.lock().take().unwrap_or(Ok(()))
    }

    pub fn thread(&self) -> Option<thread::Thread> {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| handle.thread().clone())
    }
}

impl std::fmt::Debug for NativeThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeThread")
            .field("name", &self.name)
            .field("finished", &self.finished())
            .finish()
    }
}
