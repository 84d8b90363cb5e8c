use crate::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

type Reply = oneshot::Sender<Result<u64, Error>>;

/// A monotonic `u64` allocator owned by a single background task.
///
/// Every [`next`](Self::next) call is a request/response exchange with the
/// owning task, so the counter is never touched by two callers at once and
/// no caller holds a lock. Clones share the same sequence.
#[derive(Debug, Clone)]
pub struct Allocator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    requests: mpsc::Sender<Reply>,
    /// The next value the owner will hand out. Written only by the owner.
    next_unissued: Arc<AtomicU64>,
    stop: watch::Sender<bool>,
}

impl Allocator {
    /// Creates an allocator whose first issued value is `start`.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, since the owning task is
    /// spawned immediately.
    pub fn new(start: u64) -> Self {
        let (requests, receiver) = mpsc::channel(1);
        let (stop, stopped) = watch::channel(false);
        let next_unissued = Arc::new(AtomicU64::new(start));

        tokio::spawn(run_owner(start, receiver, Arc::clone(&next_unissued), stopped));

        Self {
            inner: Arc::new(Inner {
                requests,
                next_unissued,
                stop,
            }),
        }
    }

    /// Returns the next value in the sequence.
    ///
    /// Suspends until the owning task serves this request. Fails only once
    /// the allocator has been shut down or the range is exhausted.
    pub async fn next(&self) -> Result<u64, Error> {
        let (reply, response) = oneshot::channel();
        self.inner
            .requests
            .send(reply)
            .await
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)?
    }

    /// Returns `true` iff `value` has already been handed out.
    pub fn is_issued(&self, value: u64) -> bool {
        value < self.next_unissued()
    }

    /// The value the next successful [`next`](Self::next) call will return.
    pub fn next_unissued(&self) -> u64 {
        self.inner.next_unissued.load(Ordering::Acquire)
    }

    /// Stops the owning task. Pending and later `next` calls fail with
    /// [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.stop.send_replace(true);
    }
}

async fn run_owner(
    mut next: u64,
    mut requests: mpsc::Receiver<Reply>,
    next_unissued: Arc<AtomicU64>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let reply = tokio::select! {
            biased;
            _ = stopped.changed() => break,
            reply = requests.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
        };

        if next == u64::MAX {
            let _ = reply.send(Err(Error::Exhausted));
            continue;
        }

        // Publish before replying so the caller never observes its own value
        // as unissued.
        next_unissued.store(next + 1, Ordering::Release);
        match reply.send(Ok(next)) {
            Ok(()) => next += 1,
            // The caller gave up waiting; the value was never handed out.
            Err(_) => next_unissued.store(next, Ordering::Release),
        }
    }

    debug!(next, "allocator stopped");
}
