#![allow(clippy::arc_with_non_send_sync)]

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

#[derive(Debug)]
struct FlightInner<T> {
    inflight: Option<Weak<broadcast::Sender<T>>>,
}

impl<T> FlightInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn receiver(&self) -> Option<broadcast::Receiver<T>> {
        self.inflight
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|tx| tx.subscribe())
    }
}

pub(crate) struct Handle<T> {
    fut: BoxFut<'static, Result<T, RecvError>>,
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, RecvError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<T> Handle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(mut receiver: broadcast::Receiver<T>) -> Self {
        Self {
            fut: Box::pin(async move { receiver.recv().await }),
        }
    }
}

/// A coalesced fetch: while one is running, later callers wait for its
/// result instead of starting their own.
#[derive(Debug)]
pub(crate) struct Flight<T> {
    inner: Arc<Mutex<FlightInner<T>>>,
}

impl<T> Clone for Flight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Flight<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlightInner { inflight: None })),
        }
    }
}

impl<T> Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Join the running fetch, or start `f` if none is running.
    pub(crate) fn handle<F>(&self, f: F) -> Handle<T>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        // Held across the check and the launch so two callers can't both start.
        let mut inner = self.inner.lock();
        if let Some(rx) = inner.receiver() {
            tracing::trace!("joining inflight fetch");
            return Handle::new(rx);
        }

        let (tx, rx) = broadcast::channel::<T>(1);
        let tx = Arc::new(tx);
        inner.inflight = Some(Arc::downgrade(&tx));

        let fut = f();
        let shared = Arc::clone(&self.inner);
        tracing::trace!("launching fetch");
        tokio::spawn(async move {
            let res = fut.await;
            // Send under the lock so a late subscriber can't miss the result.
            let mut inner = shared.lock();
            inner.inflight = None;
            let _ = tx.send(res);
        });
        Handle::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let flight: Flight<u32> = Flight::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let start = |calls: Arc<AtomicUsize>| {
            flight.handle(move || {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    7
                })
            })
        };

        let a = start(Arc::clone(&calls));
        let b = start(Arc::clone(&calls));
        assert_eq!(a.await.unwrap(), 7);
        assert_eq!(b.await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
