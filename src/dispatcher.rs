//! Request dispatch: admission control in front of the pool, and the
//! debounced purge trigger behind the filesystem watcher

use crate::control::ControlState;
use crate::pool::WorkerPool;
use crate::worker::Worker;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;

pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    semaphore: Arc<Semaphore>,
    debug: bool,
}

impl Dispatcher {
    /// `workers` bounds how many invocations may be in flight, and therefore
    /// how many sandboxes ever exist at once.
    pub fn new(pool: Arc<WorkerPool>, workers: usize, debug: bool) -> Dispatcher {
        Dispatcher {
            pool,
            semaphore: Arc::new(Semaphore::new(workers)),
            debug,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/favicon.ico", any(|| async { StatusCode::NOT_FOUND }))
            .fallback(invoke)
            .with_state(Arc::new(self))
    }
}

async fn invoke(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> Response {
    let _permit = match dispatcher.semaphore.acquire().await {
        Ok(permit) => permit,
        Err(err) => {
            log::error!("{}", err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut worker = match dispatcher.pool.get().await {
        Ok(worker) => worker,
        Err(err) => {
            log::error!("{}", err);
            return error_response("function init failed");
        }
    };

    if worker.write(&body) == 0 {
        worker.write(b"{}");
    }

    if let Err(err) = worker.thaw() {
        log::error!("{}", err);
        close_worker(worker);
        return error_response("thaw failed");
    }

    if let Err(err) = worker.invoke().await {
        log::error!("{}", err);
        close_worker(worker);
        return error_response("invoke failed");
    }

    if let Err(err) = worker.freeze() {
        log::error!("{}", err);
        close_worker(worker);
        return error_response("freeze failed");
    }

    if dispatcher.debug {
        let debug = String::from_utf8_lossy(worker.debug()).into_owned();
        if !debug.is_empty() && debug != "{}" {
            log::info!("{} {}", debug.len(), debug);
        }
    }

    let response = worker.response().to_vec();
    worker.reset();

    // ERROR/FAULT poison the worker; only Ready ones go back
    if worker.state() == ControlState::Ready {
        dispatcher.pool.put(worker).await;
    } else {
        close_worker(worker);
    }

    response.into_response()
}

fn error_response(reason: &'static str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
}

fn close_worker(worker: Worker) {
    tokio::spawn(async move {
        if let Err(err) = worker.close().await {
            log::warn!("closing worker: {}", err);
        }
    });
}

/// Collapse bursts of purge signals into single purges. While signals keep
/// arriving the 200ms timer restarts; once the channel stays quiet for the
/// full window, `purge` runs exactly once and the count drains.
pub async fn purge_loop<F, Fut>(mut signals: mpsc::UnboundedReceiver<()>, mut purge: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut pending = 0u32;
    loop {
        if pending > 0 {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(()) => pending += 1,
                    None => return,
                },
                _ = sleep(Duration::from_millis(200)) => {
                    pending = 0;
                    log::info!("reload");
                    purge().await;
                }
            }
        } else {
            match signals.recv().await {
                Some(()) => pending += 1,
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn burst_of_signals_purges_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let purges = Arc::new(AtomicUsize::new(0));
        let counter = purges.clone();
        let task = tokio::spawn(purge_loop(rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        for _ in 0..50 {
            tx.send(()).unwrap();
            advance(Duration::from_millis(3)).await;
        }
        assert_eq!(purges.load(Ordering::SeqCst), 0);

        advance(Duration::from_millis(300)).await;
        assert_eq!(purges.load(Ordering::SeqCst), 1);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_purge_separately() {
        let (tx, rx) = mpsc::unbounded_channel();
        let purges = Arc::new(AtomicUsize::new(0));
        let counter = purges.clone();
        tokio::spawn(purge_loop(rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tx.send(()).unwrap();
        advance(Duration::from_millis(300)).await;
        tx.send(()).unwrap();
        advance(Duration::from_millis(300)).await;
        assert_eq!(purges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_channel_never_purges() {
        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let purges = Arc::new(AtomicUsize::new(0));
        let counter = purges.clone();
        tokio::spawn(purge_loop(rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        advance(Duration::from_secs(10)).await;
        assert_eq!(purges.load(Ordering::SeqCst), 0);
        drop(tx);
    }
}
