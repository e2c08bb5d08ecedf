//! Single-consumer background dispatchers.
//!
//! Each engine owns one: a worker thread draining a queue of boxed jobs so
//! that at most one refresh or start-level operation is in flight. Workers
//! are created lazily on first dispatch, destroyed by `close`, and reset by
//! `open`.

use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;

use crate::error::ContainerError;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
}

enum Slot {
    /// No worker yet; the next dispatch creates one.
    Idle,
    Running(Worker),
    /// `close` was called; dispatches fail until `open`.
    Closed,
}

/// A lazily started, single-consumer job queue.
pub(crate) struct Dispatcher {
    name: &'static str,
    slot: Mutex<Slot>,
}

impl Dispatcher {
    pub(crate) fn new(name: &'static str) -> Self {
        Dispatcher {
            name,
            slot: Mutex::new(Slot::Idle),
        }
    }

    fn spawn(name: &'static str) -> Worker {
        let (tx, rx) = unbounded::<Job>();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for job in &rx {
                    job();
                }
                tracing::debug!(worker = name, "dispatcher worker drained and exited");
            })
            .expect("failed to spawn dispatcher worker");
        Worker { tx, handle }
    }

    /// Queue a job, creating the worker on first use.
    ///
    /// # Errors
    /// [`ContainerError::Closed`] after `close` until the next `open`.
    pub(crate) fn dispatch(
        &self,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), ContainerError> {
        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Closed) {
            return Err(ContainerError::Closed);
        }
        let mut job: Job = Box::new(job);
        if let Slot::Running(worker) = &*slot {
            match worker.tx.send(job) {
                Ok(()) => return Ok(()),
                // The worker died (a job panicked); replace it and requeue.
                Err(returned) => job = returned.into_inner(),
            }
        }
        let worker = Self::spawn(self.name);
        worker
            .tx
            .send(job)
            .expect("freshly spawned worker cannot be disconnected");
        *slot = Slot::Running(worker);
        Ok(())
    }

    /// Allow dispatching again after a `close`.
    pub(crate) fn open(&self) {
        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Closed) {
            *slot = Slot::Idle;
        }
    }

    /// Drain the queue, stop the worker, and block further dispatches.
    pub(crate) fn close(&self) {
        let worker = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Closed) {
                Slot::Running(worker) => Some(worker),
                Slot::Idle | Slot::Closed => None,
            }
        };
        if let Some(worker) = worker {
            drop(worker.tx);
            if worker.handle.join().is_err() {
                tracing::warn!(worker = self.name, "dispatcher worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_in_order_on_one_worker() {
        let dispatcher = Dispatcher::new("test-dispatch");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let seen = Arc::clone(&seen);
            dispatcher.dispatch(move || seen.lock().push(i)).unwrap();
        }
        dispatcher.close();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn close_blocks_dispatch_until_open() {
        let dispatcher = Dispatcher::new("test-close");
        dispatcher.close();
        assert!(matches!(
            dispatcher.dispatch(|| {}),
            Err(ContainerError::Closed)
        ));
        dispatcher.open();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        dispatcher
            .dispatch(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        dispatcher.close();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_waits_for_queued_jobs() {
        let dispatcher = Dispatcher::new("test-drain");
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        dispatcher
            .dispatch(move || {
                std::thread::sleep(Duration::from_millis(30));
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        dispatcher.close();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
