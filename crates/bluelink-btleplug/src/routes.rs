//! Notification routing for subscribed characteristics
//!
//! Routes are keyed by device handle plus the (service, characteristic) UUID
//! pair, so two services exposing the same characteristic UUID keep separate
//! subscriptions. btleplug 0.11 notifications name only the characteristic,
//! which means a value fans out to every subscribed service on the device
//! exposing that characteristic UUID.

use std::collections::HashMap;

use bluelink_core::driver::NotificationSink;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RouteKey {
    pub device: u64,
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Default)]
pub(crate) struct Routes {
    sinks: HashMap<RouteKey, NotificationSink>,
}

impl Routes {
    pub fn insert(&mut self, key: RouteKey, sink: NotificationSink) {
        self.sinks.insert(key, sink);
    }

    pub fn remove(&mut self, key: &RouteKey) -> bool {
        self.sinks.remove(key).is_some()
    }

    /// Drop every route of a device
    pub fn forget(&mut self, device: u64) {
        self.sinks.retain(|key, _| key.device != device);
    }

    /// Send `value` to every route matching the notifying characteristic,
    /// pruning routes whose subscriber has gone. Returns how many received it.
    pub fn deliver(&mut self, device: u64, characteristic: Uuid, value: &[u8]) -> usize {
        let mut delivered = 0;
        self.sinks.retain(|key, sink| {
            if key.device != device || key.characteristic != characteristic {
                return true;
            }
            let sent = sink.send(value.to_vec()).is_ok();
            if sent {
                delivered += 1;
            }
            sent
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}
