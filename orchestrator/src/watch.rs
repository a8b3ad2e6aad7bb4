use crate::cache::{Entry, Shared};
use crate::keyer::AggregationKey;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use upstream::DiscoveryResponse;

pub(crate) type WatchId = u64;

/// Capacity-one delivery slot. A newer response overwrites one the consumer has
/// not read yet.
pub(crate) type ResponseSlot = Option<Arc<DiscoveryResponse>>;

/// A downstream caller's registration on one aggregation key.
///
/// Dropping the watch cancels it.
pub struct Watch {
    id: WatchId,
    key: AggregationKey,
    receiver: watch::Receiver<ResponseSlot>,
    // Weak so a forgotten watch never keeps an entry or the cache alive.
    registration: Option<(Weak<Shared>, Weak<Entry>)>,
}

impl Watch {
    pub(crate) fn new(
        id: WatchId,
        key: AggregationKey,
        receiver: watch::Receiver<ResponseSlot>,
        shared: Weak<Shared>,
        entry: Weak<Entry>,
    ) -> Self {
        Watch {
            id,
            key,
            receiver,
            registration: Some((shared, entry)),
        }
    }

    pub fn key(&self) -> &AggregationKey {
        &self.key
    }

    /// Waits for the next response.
    ///
    /// Only the latest response is kept, so a slow reader skips intermediate
    /// versions. Returns `None` once the upstream subscription behind this watch
    /// has been torn down; the caller should watch again to resubscribe.
    pub async fn recv(&mut self) -> Option<Arc<DiscoveryResponse>> {
        loop {
            // An unseen value is still returned after the sender is gone.
            self.receiver.changed().await.ok()?;
            if let Some(response) = self.receiver.borrow_and_update().clone() {
                return Some(response);
            }
        }
    }

    /// Deregisters the watch. Shuts down the upstream stream when this was the
    /// last watch on its key.
    pub fn cancel(mut self) {
        self.deregister();
    }

    fn deregister(&mut self) {
        let Some((shared, entry)) = self.registration.take() else {
            return;
        };
        if let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) {
            shared.remove_watcher(&entry, self.id);
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}
