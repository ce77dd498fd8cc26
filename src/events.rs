//! Events posted by a protocol instance.
//!
//! Every instance owns its registries, subscribers either register
//! callbacks (optionally filtered, optionally only once), wait for the next
//! matching event or take a broadcast receiver.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use crate::{channel::FullChannelState, transfer::FullTransferState};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

/// Posted whenever an update was applied and persisted, no matter which
/// side proposed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdateEvent {
    pub updated_channel_state: FullChannelState,
    /// Active transfers after the update.
    pub updated_transfers: Vec<FullTransferState>,
    /// Transfer created or resolved by the update.
    pub updated_transfer: Option<FullTransferState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;
type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    callback: Callback<T>,
    filter: Option<Filter<T>>,
    once: bool,
}

const BROADCAST_CAPACITY: usize = 64;

pub struct EventRegistry<T> {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber<T>>>,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventRegistry<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    fn add(&self, callback: Callback<T>, filter: Option<Filter<T>>, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Subscriber {
                    callback,
                    filter,
                    once,
                },
            );
        id
    }

    /// Call `callback` for every event passing `filter`.
    pub fn on<F>(&self, callback: F, filter: Option<Filter<T>>) -> SubscriptionId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.add(Arc::new(callback), filter, false)
    }

    /// Call `callback` for the next event passing `filter` only.
    pub fn once<F>(&self, callback: F, filter: Option<Filter<T>>) -> SubscriptionId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.add(Arc::new(callback), filter, true)
    }

    /// Remove one subscription, or all of them.
    pub fn off(&self, id: Option<SubscriptionId>) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match id {
            Some(id) => {
                subscribers.remove(&id);
            }
            None => subscribers.clear(),
        }
    }

    /// The next event passing `filter`, `None` if none was posted within
    /// `timeout`.
    pub async fn wait_for(&self, timeout: Duration, filter: Option<Filter<T>>) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.once(
            move |event| {
                if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(event);
                }
            },
            filter,
        );
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Some(event),
            _ => {
                self.off(Some(id));
                None
            }
        }
    }

    /// Receiver of all events posted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
            + self.tx.receiver_count()
    }

    pub fn post(&self, event: T) {
        let callbacks: Vec<Callback<T>> = {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let matching: Vec<SubscriptionId> = subscribers
                .iter()
                .filter(|(_, s)| s.filter.as_ref().map_or(true, |f| f(&event)))
                .map(|(id, _)| *id)
                .collect();
            matching
                .into_iter()
                .filter_map(|id| {
                    let once = subscribers.get(&id)?.once;
                    if once {
                        subscribers.remove(&id).map(|s| s.callback)
                    } else {
                        subscribers.get(&id).map(|s| Arc::clone(&s.callback))
                    }
                })
                .collect()
        };
        // Callbacks may subscribe again, so they run without the lock held.
        for callback in callbacks {
            callback(event.clone());
        }
        let _ = self.tx.send(event);
    }
}

/// All event registries of a protocol instance.
#[derive(Default)]
pub struct ProtocolEvents {
    pub channel_update: EventRegistry<ChannelUpdateEvent>,
}
