//! The bundling engine.
//!
//! A [`Bundler`] accumulates items produced by upstream tailers and hands
//! fixed-shape batches to a downstream [`BundleHandler`] under four
//! constraints: elapsed time since the first buffered item, item count,
//! cumulative byte size, and a global cap on bytes outstanding across all
//! in-flight bundles. Sealed bundles are dispatched on spawned tasks whose
//! handler invocations start in seal order, gated by a [`Ticketer`].

mod ticket;

pub use ticket::Ticketer;

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::event::ByteSizeOf;

/// Flush triggers and hard limits for a [`Bundler`].
///
/// Thresholds are soft triggers that cause a seal when crossed; limits are
/// hard caps that constrain admission or dispatch. Settings are fixed once
/// the bundler is built.
#[derive(Clone, Copy, Debug)]
pub struct BundlerSettings {
    /// Maximum age of the oldest buffered item before an automatic flush.
    pub time_threshold: Duration,
    /// Seal when the open bundle reaches this many items.
    pub count_threshold: usize,
    /// Seal when the open bundle reaches this many bytes.
    pub size_threshold: usize,
    /// Hard cap on a single bundle's cumulative size. Items larger than this
    /// are rejected outright. Zero disables the cap.
    pub bundle_size_limit: usize,
    /// Global cap on bytes outstanding across the open bundle and every
    /// bundle whose handler has not yet returned.
    pub buffer_size_limit: usize,
    /// Maximum concurrent handler invocations.
    pub handler_limit: usize,
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            time_threshold: Duration::from_secs(1),
            count_threshold: 10,
            size_threshold: 1_000_000,
            bundle_size_limit: 10_000_000,
            buffer_size_limit: 1_000_000_000,
            handler_limit: 1,
        }
    }
}

/// Admission failures surfaced to producers.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum AddError {
    /// The item can never fit in a bundle. Not retriable.
    #[snafu(display("item size exceeds the bundle size limit"))]
    Oversize,
    /// The global buffer is saturated. Retry later, or switch to the
    /// blocking [`Bundler::add`].
    #[snafu(display("bundler exceeds the buffer size limit"))]
    Overflow,
    /// The caller's token was cancelled before buffer credit was acquired.
    #[snafu(display("add cancelled before buffer credit was acquired"))]
    Cancelled,
}

/// Consumes sealed bundles.
///
/// Invoked with a non-empty batch, in seal order, at most `handler_limit`
/// invocations at a time. The outcome is not reported back to producers;
/// implementations are expected to absorb their own failures (retries,
/// dead-lettering, metrics).
#[async_trait]
pub trait BundleHandler<T>: Send + Sync {
    async fn handle(&self, bundle: Vec<T>);
}

#[async_trait]
impl<T, F, Fut> BundleHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, bundle: Vec<T>) {
        (self)(bundle).await;
    }
}

/// The bundling engine.
///
/// Cloning is cheap and yields another producer handle to the same engine.
pub struct Bundler<T, H> {
    inner: Arc<Inner<T, H>>,
}

impl<T, H> Clone for Bundler<T, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, H> {
    settings: BundlerSettings,
    handler: H,
    /// Byte-granular buffer credit. Admission acquires, bundle completion
    /// releases.
    credits: Arc<Semaphore>,
    ticketer: Ticketer,
    open: Mutex<OpenBundle<T>>,
}

struct OpenBundle<T> {
    items: Vec<T>,
    size: usize,
    /// Buffer credit held by the open bundle, merged across admissions. Set
    /// whenever `items` is non-empty.
    permit: Option<OwnedSemaphorePermit>,
    /// Present while a flush timer is armed. Sending (or dropping) retires
    /// the timer task without a flush.
    timer_cancel: Option<oneshot::Sender<()>>,
}

impl<T, H> Bundler<T, H>
where
    T: ByteSizeOf + Send + 'static,
    H: BundleHandler<T> + Send + Sync + 'static,
{
    /// Builds a bundler that hands sealed bundles to `handler`.
    ///
    /// # Panics
    ///
    /// Panics if `settings.handler_limit` is zero.
    pub fn new(settings: BundlerSettings, handler: H) -> Self {
        assert!(
            settings.handler_limit > 0,
            "handler_limit must be at least 1",
        );
        Self {
            inner: Arc::new(Inner {
                handler,
                credits: Arc::new(Semaphore::new(
                    settings.buffer_size_limit.min(Semaphore::MAX_PERMITS),
                )),
                ticketer: Ticketer::new(settings.handler_limit),
                open: Mutex::new(OpenBundle {
                    items: Vec::with_capacity(bundle_capacity_hint(settings.count_threshold)),
                    size: 0,
                    permit: None,
                    timer_cancel: None,
                }),
                settings,
            }),
        }
    }

    /// Admits `item` without blocking.
    ///
    /// Returns [`AddError::Overflow`] when the global buffer cannot cover the
    /// item right now; the item is not enqueued and no credit is consumed.
    pub fn try_add(&self, item: T) -> Result<(), AddError> {
        let size = item.size_of();
        self.inner.check_oversize(size)?;
        let permit = Arc::clone(&self.inner.credits)
            .try_acquire_many_owned(permit_count(size))
            .map_err(|_| AddError::Overflow)?;
        self.inner.add_locked(item, size, permit);
        Ok(())
    }

    /// Admits `item`, waiting for buffer credit while the global buffer is
    /// saturated. Credit is granted in strict FIFO order, so a large waiter
    /// cannot be starved by a stream of small ones.
    ///
    /// Cancelling through `cancel` before credit is acquired leaves the
    /// bundler untouched. Once credit is acquired the item is committed and
    /// the call returns `Ok`.
    pub async fn add(&self, item: T, cancel: &CancellationToken) -> Result<(), AddError> {
        let size = item.size_of();
        self.inner.check_oversize(size)?;
        let acquire = Arc::clone(&self.inner.credits).acquire_many_owned(permit_count(size));
        let permit = tokio::select! {
            permit = acquire => permit
                .unwrap_or_else(|_| unreachable!("buffer credit semaphore is never closed")),
            () = cancel.cancelled() => return Err(AddError::Cancelled),
        };
        self.inner.add_locked(item, size, permit);
        Ok(())
    }

    /// Seals whatever is buffered, then waits until the handler has returned
    /// for every bundle sealed at or before this call.
    pub async fn flush(&self) {
        Inner::flush(&self.inner).await;
    }
}

impl<T, H> Inner<T, H>
where
    T: ByteSizeOf + Send + 'static,
    H: BundleHandler<T> + Send + Sync + 'static,
{
    fn check_oversize(&self, size: usize) -> Result<(), AddError> {
        let limit = self.settings.bundle_size_limit;
        if limit > 0 && size > limit {
            return Err(AddError::Oversize);
        }
        Ok(())
    }

    fn add_locked(self: &Arc<Self>, item: T, size: usize, permit: OwnedSemaphorePermit) {
        let mut open = self.lock_open();

        // Seal first if the insertion would blow the per-bundle cap, so that
        // every sealed bundle of individually admissible items respects it.
        let limit = self.settings.bundle_size_limit;
        if limit > 0 && open.size + size > limit {
            self.flush_locked(&mut open);
        }

        open.items.push(item);
        open.size += size;
        match open.permit.as_mut() {
            Some(held) => held.merge(permit),
            None => open.permit = Some(permit),
        }

        if open.timer_cancel.is_none() {
            self.arm_timer(&mut open);
        }

        if open.items.len() >= self.settings.count_threshold {
            self.flush_locked(&mut open);
        }
        if open.size >= self.settings.size_threshold {
            self.flush_locked(&mut open);
        }
    }

    /// Arms the one-shot flush timer for the item just buffered.
    ///
    /// The expiry path calls the public [`flush`](Self::flush), not
    /// `flush_locked`: a timer flush also waits out in-flight handlers. The
    /// bundler has been idle for a full `time_threshold` when that happens.
    fn arm_timer(self: &Arc<Self>, open: &mut OpenBundle<T>) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        open.timer_cancel = Some(cancel_tx);
        let inner = Arc::clone(self);
        let deadline = self.settings.time_threshold;
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(deadline) => Inner::flush(&inner).await,
                _ = &mut cancel_rx => {}
            }
        });
    }

    /// Seals the open bundle and spawns its dispatch task. Must be called
    /// with the `open` lock held.
    fn flush_locked(self: &Arc<Self>, open: &mut OpenBundle<T>) {
        if let Some(cancel) = open.timer_cancel.take() {
            // A timer that has already fired dropped its receiver; the send
            // result is irrelevant either way.
            let _ = cancel.send(());
        }
        if open.items.is_empty() {
            return;
        }

        let capacity = bundle_capacity_hint(self.settings.count_threshold);
        let bundle = mem::replace(&mut open.items, Vec::with_capacity(capacity));
        let size = mem::take(&mut open.size);
        let permit = open.permit.take();
        let ticket = self.ticketer.next_ticket();

        trace!(
            message = "Sealed bundle.",
            ticket,
            items = bundle.len(),
            bytes = size,
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            // The ticket is acquired outside the bundle seal lock: producers
            // keep sealing while this dispatch waits its turn.
            inner.ticketer.acquire(ticket).await;
            let _finish = FinishGuard {
                ticketer: &inner.ticketer,
                ticket,
                permit,
            };
            inner.handler.handle(bundle).await;
        });
    }

    async fn flush(self: &Arc<Self>) {
        {
            let mut open = self.lock_open();
            self.flush_locked(&mut open);
        }
        // Every ticket below the watermark has been issued, which covers all
        // bundles sealed at or before this call.
        let watermark = self.ticketer.watermark();
        self.ticketer.wait_all(watermark).await;
    }

    fn lock_open(&self) -> MutexGuard<'_, OpenBundle<T>> {
        self.open.lock().expect("bundler state poisoned")
    }
}

/// Finishes a dispatch on every exit path, including a panicking handler:
/// buffer credit goes back first, then the ticket is retired, so a completed
/// `wait_all` implies the buffer charge is gone too.
struct FinishGuard<'a> {
    ticketer: &'a Ticketer,
    ticket: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.ticketer.release(self.ticket);
    }
}

const fn bundle_capacity_hint(count_threshold: usize) -> usize {
    (count_threshold + 1) / 2
}

/// Buffer credit is byte granular and tokio counts permits in `u32`. Every
/// admissible item fits; a larger one saturates and is turned away by the
/// limits like any other huge item.
fn permit_count(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}
