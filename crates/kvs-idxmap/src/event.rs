//! Change events and channel adapters for registry watchers
//!
//! Watch callbacks run synchronously in the mutator's call path. The
//! adapters here hand events over to a bounded channel instead and give up
//! after a timeout, so a slow consumer never blocks a mutation for long.
//! Undelivered events are dropped with a warning.

use crossbeam::channel::{self, Sender};
use std::time::Duration;
use tracing::warn;

/// How long the channel adapters wait for the consumer by default
pub const DEFAULT_NOTIF_TIMEOUT: Duration = Duration::from_millis(500);

/// Mapping change delivered to watchers
#[derive(Debug, Clone)]
pub struct NameToIdxEvent<M> {
    /// Title of the registry which changed
    pub registry_title: String,
    /// Affected name
    pub name: String,
    /// Index of the name (the removed index for deletes)
    pub idx: u32,
    /// New metadata, or the removed metadata for deletes
    pub metadata: M,
    pub(crate) del: bool,
    pub(crate) update: bool,
    pub(crate) ack: Option<Sender<()>>,
}

impl<M> NameToIdxEvent<M> {
    pub(crate) fn new(registry_title: &str, name: &str, idx: u32, metadata: M) -> Self {
        Self {
            registry_title: registry_title.to_owned(),
            name: name.to_owned(),
            idx,
            metadata,
            del: false,
            update: false,
            ack: None,
        }
    }

    /// True if the name was removed from the registry
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.del
    }

    /// True if an existing name had its metadata replaced
    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.update
    }

    /// Acknowledge the event.
    ///
    /// Only meaningful for events delivered through [`to_chan_with_ack`],
    /// where the producer waits for the acknowledgement; otherwise a no-op.
    pub fn done(&self) {
        if let Some(ack) = &self.ack {
            let _ = ack.try_send(());
        }
    }
}

/// Watch callback delivering events into `sender` within [`DEFAULT_NOTIF_TIMEOUT`]
pub fn to_chan<M: Send + 'static>(
    sender: Sender<NameToIdxEvent<M>>,
) -> impl Fn(NameToIdxEvent<M>) + Send + Sync + 'static {
    to_chan_with_timeout(sender, DEFAULT_NOTIF_TIMEOUT)
}

/// Watch callback delivering events into `sender` within `timeout`
pub fn to_chan_with_timeout<M: Send + 'static>(
    sender: Sender<NameToIdxEvent<M>>,
    timeout: Duration,
) -> impl Fn(NameToIdxEvent<M>) + Send + Sync + 'static {
    move |event| {
        let name = event.name.clone();
        if sender.send_timeout(event, timeout).is_err() {
            warn!(name = %name, timeout_ms = timeout.as_millis(), "Unable to deliver notification");
        }
    }
}

/// Watch callback which delivers into `sender` and then waits for the
/// consumer to call [`NameToIdxEvent::done`].
///
/// Both the delivery and the acknowledgement are bounded by `timeout`.
pub fn to_chan_with_ack<M: Send + 'static>(
    sender: Sender<NameToIdxEvent<M>>,
    timeout: Duration,
) -> impl Fn(NameToIdxEvent<M>) + Send + Sync + 'static {
    move |mut event| {
        let name = event.name.clone();
        let (ack_tx, ack_rx) = channel::bounded(1);
        event.ack = Some(ack_tx);
        if sender.send_timeout(event, timeout).is_err() {
            warn!(name = %name, timeout_ms = timeout.as_millis(), "Unable to deliver notification");
            return;
        }
        if ack_rx.recv_timeout(timeout).is_err() {
            warn!(name = %name, "Notification was not acknowledged in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_done_without_ack_is_noop() {
        let event = NameToIdxEvent::new("title", "eth0", 1, ());
        event.done();
        assert!(!event.is_delete());
        assert!(!event.is_update());
    }

    #[test]
    fn to_chan_drops_when_consumer_is_slow() {
        let (tx, rx) = channel::bounded(1);
        let callback = to_chan_with_timeout(tx, Duration::from_millis(10));
        callback(NameToIdxEvent::new("title", "eth0", 1, ()));
        callback(NameToIdxEvent::new("title", "eth1", 2, ()));

        assert_eq!(rx.try_recv().unwrap().name, "eth0");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn to_chan_with_ack_waits_for_done() {
        let (tx, rx) = channel::bounded::<NameToIdxEvent<()>>(0);
        let consumer = thread::spawn(move || {
            let event = rx.recv().unwrap();
            event.done();
            event.name
        });
        let callback = to_chan_with_ack(tx, Duration::from_secs(5));
        callback(NameToIdxEvent::new("title", "eth0", 1, ()));
        assert_eq!(consumer.join().unwrap(), "eth0");
    }
}
