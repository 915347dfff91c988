//! Free list of warm workers
//!
//! A plain LIFO stack: the most recently frozen worker is the first one
//! handed back out, keeping its pages warm. The pool has no capacity of its
//! own; the dispatcher's admission semaphore bounds how many workers can be
//! checked out at once.

use crate::errors::WorkerError;
use crate::worker::Worker;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cold-start factory: an async closure producing a booted, handshaken worker
pub type Factory =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Worker, WorkerError>> + Send>> + Send + Sync>;

pub struct WorkerPool {
    new: Factory,
    free: Mutex<Vec<Worker>>,
}

impl WorkerPool {
    pub fn new(factory: Factory) -> WorkerPool {
        WorkerPool {
            new: factory,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pop the most recently returned worker, or cold-start a fresh one.
    /// The lock is held across the cold start, which serializes worker
    /// construction (the shared region's named create/unlink window must not
    /// overlap itself).
    pub async fn get(&self) -> Result<Worker, WorkerError> {
        let mut free = self.free.lock().await;
        if let Some(worker) = free.pop() {
            return Ok(worker);
        }
        (self.new)().await
    }

    /// Return a worker to the top of the stack. The caller is responsible
    /// for only returning workers that are frozen and ready.
    pub async fn put(&self, worker: Worker) {
        self.free.lock().await.push(worker);
    }

    /// Drain the stack and close every worker. A close failure does not stop
    /// the drain; the last error is reported once the stack is empty.
    pub async fn purge(&self) -> Result<(), WorkerError> {
        let mut free = self.free.lock().await;
        let mut err = None;
        while let Some(worker) = free.pop() {
            if let Err(e) = worker.close().await {
                log::error!("closing purged worker: {}", e);
                err = Some(e);
            }
        }
        match err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    pub async fn len(&self) -> usize {
        self.free.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ControlError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_factory(calls: Arc<AtomicUsize>) -> Factory {
        Arc::new(move || {
            let calls = calls.clone();
            let boot: Pin<Box<dyn Future<Output = Result<Worker, WorkerError>> + Send>> =
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(WorkerError::Control(ControlError::Disconnected))
                });
            boot
        })
    }

    #[tokio::test]
    async fn purge_of_empty_pool_is_a_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(failing_factory(calls.clone()));
        pool.purge().await.unwrap();
        assert_eq!(pool.len().await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_on_empty_pool_calls_factory() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(failing_factory(calls.clone()));
        assert!(pool.get().await.is_err());
        assert!(pool.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
