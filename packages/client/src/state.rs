//! Observable state containers
//!
//! `StateChannel` is the single-writer state holder the rest of the crate is
//! built on: it keeps a current value that new subscribers can read
//! immediately, and delivers every published change, in order, to active
//! subscribers. "Waiting" for a condition means suspending on `wait_for`
//! until a matching value is published, never polling.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

struct Shared<T> {
    current: RwLock<T>,
    tx: broadcast::Sender<T>,
}

/// A state holder with replay-to-new-subscriber semantics.
///
/// Clones share the same underlying state. The current value is guarded by a
/// `parking_lot::RwLock`; change notifications ride a broadcast channel so
/// each subscriber observes emissions in publish order.
pub struct StateChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StateChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> StateChannel<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new(initial),
                tx,
            }),
        }
    }

    /// The value as of the last publish.
    pub fn get(&self) -> T {
        self.shared.current.read().clone()
    }

    /// Publish a new value: replaces the current value and notifies every
    /// active subscriber.
    pub fn set(&self, value: T) {
        *self.shared.current.write() = value.clone();
        // No receivers is fine; the current value still replays on subscribe.
        let _ = self.shared.tx.send(value);
    }

    /// Subscribe to subsequent emissions. The current value is read
    /// separately via [`get`](Self::get).
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.shared.tx.subscribe()
    }

    /// Suspend until the state satisfies `predicate`, returning the matching
    /// value. Resolves immediately when the current value already matches.
    ///
    /// Dropping the returned future tears the watcher down; racing two
    /// `wait_for` calls with `tokio::select!` is how first-one-wins
    /// cancellation is expressed throughout the crate.
    pub async fn wait_for<F>(&self, mut predicate: F) -> T
    where
        F: FnMut(&T) -> bool,
    {
        // Subscribe before inspecting the current value so a publish between
        // the two cannot be missed.
        let mut rx = self.shared.tx.subscribe();
        let current = self.get();
        if predicate(&current) {
            return current;
        }
        loop {
            match rx.recv().await {
                Ok(value) => {
                    if predicate(&value) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed intermediate emissions; the current value is
                    // still authoritative for the predicate.
                    let value = self.get();
                    if predicate(&value) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // The sender lives inside `self.shared`.
                    unreachable!("state channel sender dropped while borrowed")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn replays_current_value_to_new_subscribers() {
        let state = StateChannel::new(0u32);
        state.set(7);
        assert_eq!(state.get(), 7);
        let other = state.clone();
        assert_eq!(other.get(), 7);
    }

    #[tokio::test]
    async fn wait_for_resolves_immediately_on_current_value() {
        let state = StateChannel::new(3u32);
        let value = state.wait_for(|v| *v == 3).await;
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_future_emission() {
        let state = StateChannel::new(0u32);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for(|v| *v == 5).await })
        };
        tokio::task::yield_now().await;
        state.set(1);
        state.set(5);
        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_for timed out")
            .expect("waiter panicked");
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn subscribers_see_rapid_emissions_in_order() {
        let state = StateChannel::new("idle");
        let mut rx = state.subscribe();
        state.set("in-progress");
        state.set("error");
        assert_eq!(rx.recv().await.unwrap(), "in-progress");
        assert_eq!(rx.recv().await.unwrap(), "error");
    }

    #[tokio::test]
    async fn losing_watcher_is_cancelled_by_drop() {
        let state = StateChannel::new(0u32);
        let state2 = state.clone();
        let winner = tokio::select! {
            v = state.wait_for(|v| *v == 1) => ("one", v),
            v = state2.wait_for(|v| *v == 0) => ("zero", v),
        };
        assert_eq!(winner, ("zero", 0));
    }
}
