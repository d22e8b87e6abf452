//! In-process fan-out of [`BackupEvent`]s.
//!
//! Every subscription belongs to a named observer. Dropping a
//! [`Subscription`] ends it; [`EventBus::unsubscribe_all`] ends every
//! subscription an observer still holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use super::events::BackupEvent;

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BackupEvent>>,
    observers: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl EventBus {
    /// `capacity` is how many events a slow subscriber may fall behind
    /// before it starts missing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            observers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn publish(&self, event: BackupEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self, observer: &str) -> Subscription {
        let cancel = self
            .lock_observers()
            .entry(observer.to_string())
            .or_default()
            .clone();

        Subscription {
            observer: observer.to_string(),
            receiver: self.sender.subscribe(),
            cancel,
        }
    }

    /// Ends every subscription held by `observer`. Returns `false` if the
    /// observer had none.
    pub fn unsubscribe_all(&self, observer: &str) -> bool {
        match self.lock_observers().remove(observer) {
            Some(cancel) => {
                cancel.cancel();
                log::debug!("Unsubscribed all event listeners of '{}'", observer);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn lock_observers(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.observers.lock().unwrap_or_else(|poisoned| {
            log::warn!("Event bus observer lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A live subscription to the bus.
pub struct Subscription {
    observer: String,
    receiver: broadcast::Receiver<BackupEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn observer(&self) -> &str {
        &self.observer
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the next event. Returns `None` once the subscription was
    /// cancelled or the bus is gone. Missed events are logged and skipped.
    pub async fn recv(&mut self) -> Option<BackupEvent> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.receiver.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Subscriber '{}' lagged, missed {} events", self.observer, n);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Returns a pending event without waiting.
    pub fn try_recv(&mut self) -> Option<BackupEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    log::warn!("Subscriber '{}' lagged, missed {} events", self.observer, n);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
