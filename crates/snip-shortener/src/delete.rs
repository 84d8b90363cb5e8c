use crate::error::PipelineError;
use crate::request::parse_delete_request;
use parking_lot::Mutex;
use snip_core::{DeleteRequest, OwnerId, Storage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

/// Tuning knobs for a [`DeletionPipeline`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineSettings {
    /// Number of worker tasks committing batches.
    #[builder(default = 3)]
    pub workers: usize,
    /// Fixed pause before a failed batch is resubmitted.
    #[builder(default = Duration::from_millis(100))]
    pub retry_delay: Duration,
    /// Attempts per batch before it is dropped. `None` retries forever.
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<u32>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug)]
struct Batch {
    requests: Vec<DeleteRequest>,
    attempt: u32,
}

type Queue = Arc<AsyncMutex<mpsc::UnboundedReceiver<Batch>>>;

/// Asynchronous soft-delete pipeline.
///
/// [`add_batch`](Self::add_batch) hands a batch to a fixed pool of workers
/// and returns immediately. A worker calls
/// [`Storage::soft_delete`] and, when that fails with a retryable error,
/// waits [`PipelineSettings::retry_delay`] and puts the same batch back on
/// the queue. There is no ordering across batches.
///
/// Nothing is durable: batches still queued or waiting to be retried when
/// [`close`](Self::close) runs are dropped.
#[derive(Debug)]
pub struct DeletionPipeline {
    /// `None` once closed. Held while a batch is checked and sent, so no batch
    /// can slip in after [`close`](Self::close) has taken it.
    queue: Mutex<Option<mpsc::UnboundedSender<Batch>>>,
    stop: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeletionPipeline {
    /// Spawns the workers. Must be called from within a Tokio runtime.
    pub fn start<S>(storage: Arc<S>, settings: PipelineSettings) -> Self
    where
        S: Storage + ?Sized,
    {
        let (queue, receiver) = mpsc::unbounded_channel();
        let receiver: Queue = Arc::new(AsyncMutex::new(receiver));
        let (stop, _) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));
        let count = settings.workers.max(1);

        let workers = (0..count)
            .map(|id| {
                let worker = Worker {
                    id,
                    storage: Arc::clone(&storage),
                    queue: Arc::clone(&receiver),
                    resubmit: queue.clone(),
                    stop: stop.subscribe(),
                    settings: settings.clone(),
                    pending: Arc::clone(&pending),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = count,
            retry_delay_ms = settings.retry_delay.as_millis() as u64,
            max_attempts = ?settings.max_attempts,
            "deletion pipeline started"
        );

        Self {
            queue: Mutex::new(Some(queue)),
            stop,
            pending,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a batch without waiting for it to be committed.
    pub fn add_batch(&self, requests: Vec<DeleteRequest>) -> Result<(), PipelineError> {
        let queue = self.queue.lock();
        let Some(sender) = queue.as_ref() else {
            return Err(PipelineError::Closed);
        };
        if requests.is_empty() {
            return Ok(());
        }

        let size = requests.len();
        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(Batch { requests, attempt: 1 }).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(PipelineError::Closed);
        }

        debug!(size, "queued delete batch");
        Ok(())
    }

    /// Parses a raw JSON payload (see [`parse_delete_request`]) and enqueues
    /// it. Returns the number of requests accepted.
    pub fn submit_raw(
        &self,
        raw: &str,
        base_url: &str,
        owner: OwnerId,
    ) -> Result<usize, PipelineError> {
        let requests = parse_delete_request(raw, base_url, owner)?;
        let size = requests.len();
        self.add_batch(requests)?;
        Ok(size)
    }

    /// Number of batches accepted but not yet committed or dropped.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().is_none()
    }

    /// Stops accepting batches and waits for the workers to exit.
    ///
    /// A worker finishes the `soft_delete` call it is in, then exits; anything
    /// still pending is dropped.
    pub async fn close(&self) {
        if self.queue.lock().take().is_none() {
            return;
        }
        self.stop.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(error = %err, "deletion worker failed");
            }
        }

        info!(dropped = self.pending(), "deletion pipeline closed");
    }
}

struct Worker<S: ?Sized> {
    id: usize,
    storage: Arc<S>,
    queue: Queue,
    resubmit: mpsc::UnboundedSender<Batch>,
    stop: watch::Receiver<bool>,
    settings: PipelineSettings,
    pending: Arc<AtomicUsize>,
}

impl<S: Storage + ?Sized> Worker<S> {
    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }

            let batch = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                batch = next_batch(&self.queue) => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            self.commit(batch).await;
        }

        debug!(worker = self.id, "deletion worker stopped");
    }

    async fn commit(&mut self, mut batch: Batch) {
        let size = batch.requests.len();

        let err = match self.storage.soft_delete(&batch.requests).await {
            Ok(()) => {
                debug!(worker = self.id, size, attempt = batch.attempt, "committed delete batch");
                self.finish();
                return;
            }
            Err(err) => err,
        };

        if !err.is_retryable() || !self.may_retry(batch.attempt) {
            error!(
                worker = self.id,
                size,
                attempt = batch.attempt,
                error = %err,
                "dropping delete batch"
            );
            self.finish();
            return;
        }

        warn!(
            worker = self.id,
            size,
            attempt = batch.attempt,
            error = %err,
            "delete batch failed, retrying"
        );

        tokio::select! {
            biased;
            _ = self.stop.changed() => {
                self.finish();
                return;
            }
            _ = tokio::time::sleep(self.settings.retry_delay) => {}
        }

        batch.attempt += 1;
        if self.resubmit.send(batch).is_err() {
            self.finish();
        }
    }

    fn may_retry(&self, attempt: u32) -> bool {
        match self.settings.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }

    fn finish(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn next_batch(queue: &AsyncMutex<mpsc::UnboundedReceiver<Batch>>) -> Option<Batch> {
    queue.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snip_core::{Bootstrap, ReadStorage, Result, ShortKey, Stats, StorageError, UrlRecord};
    use snip_storage::InMemoryStorage;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    /// Fails the first `failures` soft deletes with `error`, then delegates.
    struct Flaky {
        inner: InMemoryStorage,
        failures: AtomicU32,
        error: StorageError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: StorageError) -> Self {
            Self {
                inner: InMemoryStorage::new(),
                failures: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadStorage for Flaky {
        async fn lookup(&self, key: ShortKey) -> Result<String> {
            self.inner.lookup(key).await
        }

        async fn list_by_owner(&self, owner: OwnerId) -> Vec<UrlRecord> {
            self.inner.list_by_owner(owner).await
        }

        async fn stats(&self) -> Result<Stats> {
            self.inner.stats().await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }

        fn bootstrap(&self) -> Bootstrap {
            self.inner.bootstrap()
        }
    }

    #[async_trait]
    impl Storage for Flaky {
        async fn create(&self, original_url: &str, owner: OwnerId) -> Result<ShortKey> {
            self.inner.create(original_url, owner).await
        }

        async fn create_batch(
            &self,
            original_urls: &[String],
            owner: OwnerId,
        ) -> Result<Vec<ShortKey>> {
            self.inner.create_batch(original_urls, owner).await
        }

        async fn soft_delete(&self, requests: &[DeleteRequest]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let injected = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if injected {
                return Err(self.error.clone());
            }
            self.inner.soft_delete(requests).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn del(key: u64, owner: u64) -> DeleteRequest {
        DeleteRequest::new(ShortKey::new(key), OwnerId::new(owner))
    }

    fn fast() -> PipelineSettings {
        PipelineSettings::builder()
            .retry_delay(Duration::from_millis(10))
            .build()
    }

    /// Stores keys 0..=6; key 5 belongs to owner 1 and key 6 to `owner_of_6`.
    async fn seeded(storage: &Flaky, owner_of_6: u64) {
        for i in 0..7u64 {
            let owner = match i {
                5 => 1,
                6 => owner_of_6,
                _ => 9,
            };
            let key = storage
                .create(&format!("http://example.com/{i}"), OwnerId::new(owner))
                .await
                .unwrap();
            assert_eq!(key, ShortKey::new(i));
        }
    }

    async fn drained(pipeline: &DeletionPipeline) {
        awaitility::at_most(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { pipeline.pending() == 0 })
            .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retries_after_transient_failure() {
        let storage = Arc::new(Flaky::new(1, StorageError::Unavailable("down".into())));
        seeded(&storage, 2).await;
        let pipeline = DeletionPipeline::start(Arc::clone(&storage), fast());

        pipeline.add_batch(vec![del(5, 1), del(6, 2)]).unwrap();
        drained(&pipeline).await;

        assert_eq!(storage.calls(), 2);
        assert_eq!(
            storage.lookup(ShortKey::new(5)).await,
            Err(StorageError::Gone(ShortKey::new(5)))
        );
        assert_eq!(
            storage.lookup(ShortKey::new(6)).await,
            Err(StorageError::Gone(ShortKey::new(6)))
        );
        pipeline.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retried_batch_still_checks_ownership() {
        let storage = Arc::new(Flaky::new(1, StorageError::Unavailable("down".into())));
        seeded(&storage, 3).await;
        let pipeline = DeletionPipeline::start(Arc::clone(&storage), fast());

        pipeline.add_batch(vec![del(5, 1), del(6, 2)]).unwrap();
        drained(&pipeline).await;

        assert_eq!(
            storage.lookup(ShortKey::new(5)).await,
            Err(StorageError::Gone(ShortKey::new(5)))
        );
        assert_eq!(
            storage.lookup(ShortKey::new(6)).await.unwrap(),
            "http://example.com/6"
        );
        pipeline.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_retryable_failure_drops_batch() {
        let storage = Arc::new(Flaky::new(1, StorageError::InvalidData("bad row".into())));
        seeded(&storage, 2).await;
        let pipeline = DeletionPipeline::start(Arc::clone(&storage), fast());

        pipeline.add_batch(vec![del(5, 1)]).unwrap();
        drained(&pipeline).await;

        assert_eq!(storage.calls(), 1);
        assert!(storage.lookup(ShortKey::new(5)).await.is_ok());
        pipeline.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_attempts_give_up() {
        let storage = Arc::new(Flaky::new(u32::MAX, StorageError::Timeout("slow".into())));
        let settings = PipelineSettings::builder()
            .retry_delay(Duration::from_millis(5))
            .max_attempts(3)
            .build();
        let pipeline = DeletionPipeline::start(Arc::clone(&storage), settings);

        pipeline.add_batch(vec![del(0, 1)]).unwrap();
        drained(&pipeline).await;

        assert_eq!(storage.calls(), 3);
        pipeline.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn many_batches_spread_over_workers() {
        let storage = Arc::new(Flaky::new(0, StorageError::Unavailable("unused".into())));
        for i in 0..30u64 {
            storage
                .create(&format!("http://example.com/{i}"), OwnerId::new(i % 3))
                .await
                .unwrap();
        }
        let pipeline = DeletionPipeline::start(Arc::clone(&storage), fast());

        for i in 0..30u64 {
            pipeline.add_batch(vec![del(i, i % 3)]).unwrap();
        }
        drained(&pipeline).await;

        assert_eq!(storage.stats().await.unwrap().urls, 0);
        assert_eq!(storage.calls(), 30);
        pipeline.close().await;
    }

    #[tokio::test]
    async fn closed_pipeline_rejects_batches() {
        let storage = Arc::new(Flaky::new(0, StorageError::Unavailable("unused".into())));
        let pipeline = DeletionPipeline::start(storage, fast());

        pipeline.close().await;
        pipeline.close().await;

        assert!(pipeline.is_closed());
        assert_eq!(
            pipeline.add_batch(vec![del(0, 1)]),
            Err(PipelineError::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_batch_is_accepted_once_close_returns() {
        let storage = Arc::new(Flaky::new(0, StorageError::Unavailable("unused".into())));
        let pipeline = Arc::new(DeletionPipeline::start(Arc::clone(&storage), fast()));
        let closed = Arc::new(AtomicBool::new(false));

        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let closed = Arc::clone(&closed);
                tokio::spawn(async move {
                    let mut late = 0;
                    loop {
                        let after_close = closed.load(Ordering::SeqCst);
                        match pipeline.add_batch(vec![del(0, 1)]) {
                            Ok(()) if after_close => late += 1,
                            Ok(()) => {}
                            Err(PipelineError::Closed) => break,
                            Err(err) => panic!("unexpected error: {err}"),
                        }
                        tokio::task::yield_now().await;
                    }
                    late
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.close().await;
        closed.store(true, Ordering::SeqCst);
        let dropped = pipeline.pending();

        for submitter in submitters {
            assert_eq!(submitter.await.unwrap(), 0);
        }
        assert_eq!(pipeline.pending(), dropped);
        assert_eq!(
            pipeline.add_batch(vec![del(0, 1)]),
            Err(PipelineError::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_abandons_endlessly_failing_batch() {
        let storage = Arc::new(Flaky::new(u32::MAX, StorageError::Unavailable("down".into())));
        let pipeline = DeletionPipeline::start(Arc::clone(&storage), fast());

        pipeline.add_batch(vec![del(0, 1)]).unwrap();
        awaitility::at_most(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { storage.calls() >= 2 })
            .await;

        tokio::time::timeout(Duration::from_secs(5), pipeline.close())
            .await
            .unwrap();
        assert!(pipeline.is_closed());
    }

    #[tokio::test]
    async fn malformed_raw_payload_enqueues_nothing() {
        let storage = Arc::new(Flaky::new(0, StorageError::Unavailable("unused".into())));
        let pipeline = DeletionPipeline::start(Arc::clone(&storage), fast());

        let err = pipeline
            .submit_raw(r#"["1", "nope"]"#, "http://localhost:8080", OwnerId::new(1))
            .unwrap_err();

        assert!(matches!(err, PipelineError::MalformedRequest(_)));
        assert_eq!(pipeline.pending(), 0);
        assert_eq!(
            pipeline
                .submit_raw("[]", "http://localhost:8080", OwnerId::new(1))
                .unwrap(),
            0
        );
        pipeline.close().await;
        assert_eq!(storage.calls(), 0);
    }
}
