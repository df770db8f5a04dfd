use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// FIFO ordered-dispatch gate for sealed bundles.
///
/// Tickets are issued in seal order by [`next_ticket`](Self::next_ticket).
/// [`acquire`](Self::acquire) admits tickets strictly in issue order, at most
/// `limit` concurrently. A plain semaphore cannot express this combination:
/// it would let ticket `t + 1` start before `t` when both arrive near
/// simultaneously. The explicit start barrier (`next_handled`) restores FIFO
/// starts, while the `active` set bounds concurrency after the start.
///
/// Misuse is a programming error and panics: acquiring a ticket that has
/// already passed the barrier, or releasing a ticket that is not active.
#[derive(Debug)]
pub struct Ticketer {
    limit: usize,
    /// Issuance is serialized by the caller (tickets are issued while the
    /// bundle seal lock is held), so the counter lives outside `state`.
    next: AtomicU64,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug)]
struct State {
    /// Tickets whose handler is currently running. Every member is below
    /// `next_handled`.
    active: BTreeSet<u64>,
    /// The start barrier: the smallest ticket that has not yet started.
    next_handled: u64,
}

impl Ticketer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            next: AtomicU64::new(0),
            state: Mutex::new(State {
                active: BTreeSet::new(),
                next_handled: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Issues the next ticket.
    pub fn next_ticket(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The ticket that would be issued next. Every ticket below this value
    /// has already been issued.
    pub fn watermark(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Waits until `ticket` is at the start barrier and a concurrency slot is
    /// free, then marks it active and advances the barrier.
    ///
    /// # Panics
    ///
    /// Panics if `ticket` is already behind the barrier: each ticket may be
    /// acquired exactly once.
    pub async fn acquire(&self, ticket: u64) {
        self.wait_for(|state| {
            assert!(
                ticket >= state.next_handled,
                "ticketer: acquire of ticket {ticket} behind the start barrier {}",
                state.next_handled,
            );
            if ticket == state.next_handled && state.active.len() < self.limit {
                state.active.insert(ticket);
                state.next_handled += 1;
                Some(())
            } else {
                None
            }
        })
        .await;
        self.notify.notify_waiters();
    }

    /// Retires an active ticket. Wait-free apart from the state lock.
    ///
    /// # Panics
    ///
    /// Panics if `ticket` is not active.
    pub fn release(&self, ticket: u64) {
        let mut state = self.lock();
        assert!(
            state.active.remove(&ticket),
            "ticketer: release of inactive ticket {ticket}",
        );
        drop(state);
        self.notify.notify_waiters();
    }

    /// Waits until every ticket strictly below `up_to` has started and
    /// finished.
    pub async fn wait_all(&self, up_to: u64) {
        self.wait_for(|state| {
            let oldest_active = state.active.first().copied().unwrap_or(u64::MAX);
            (state.next_handled >= up_to && oldest_active >= up_to).then_some(())
        })
        .await;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("ticketer state poisoned")
    }

    /// Runs `check` under the state lock until it yields a value, parking on
    /// the notifier between attempts. The `Notified` future is enabled before
    /// every check so a broadcast landing between the check and the await
    /// cannot be lost.
    async fn wait_for<F, R>(&self, mut check: F) -> R
    where
        F: FnMut(&mut State) -> Option<R>,
    {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(value) = check(&mut *state) {
                    return value;
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}
