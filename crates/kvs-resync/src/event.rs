//! Status events delivered to resync subscribers

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Resync status announced to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncStatus {
    /// Subscriber should resync now
    Started,
    /// No resync in progress
    NotActive,
}

impl fmt::Display for ResyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => f.write_str("STARTED"),
            Self::NotActive => f.write_str("NOT_ACTIVE"),
        }
    }
}

/// Status event with an acknowledgement handle.
///
/// The subscriber calls [`StatusEvent::ack`] once it has finished its
/// resync. Dropping the event without acking is reported as a missing ack.
#[derive(Debug)]
pub struct StatusEvent {
    status: ResyncStatus,
    ack: Option<oneshot::Sender<Instant>>,
    ack_rx: Option<oneshot::Receiver<Instant>>,
    taken: Option<oneshot::Sender<()>>,
}

impl StatusEvent {
    /// Create event
    #[must_use]
    pub fn new(status: ResyncStatus) -> Self {
        let (ack, ack_rx) = oneshot::channel();
        Self {
            status,
            ack: Some(ack),
            ack_rx: Some(ack_rx),
            taken: None,
        }
    }

    /// Announced status
    #[inline]
    #[must_use]
    pub fn status(&self) -> ResyncStatus {
        self.status
    }

    /// Acknowledge the event
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            // Orchestrator may have timed out already
            let _ = ack.send(Instant::now());
        }
    }

    /// Receiver of the acknowledgement time; handed out only once
    pub fn receive_ack(&mut self) -> Option<oneshot::Receiver<Instant>> {
        self.ack_rx.take()
    }

    /// Signal completing once a subscriber takes the event
    pub(crate) fn watch_taken(&mut self) -> oneshot::Receiver<()> {
        let (taken, taken_rx) = oneshot::channel();
        self.taken = Some(taken);
        taken_rx
    }

    /// Complete the handoff; false if nobody waits for it anymore
    fn hand_over(&mut self) -> bool {
        match self.taken.take() {
            Some(taken) => taken.send(()).is_ok(),
            None => true,
        }
    }
}

/// Receiving end of a subscriber's status channel.
///
/// Taking an event completes its handoff. Events the orchestrator stopped
/// waiting for are discarded, so a late reader never sees a resync which is
/// already over.
#[derive(Debug)]
pub struct StatusReceiver {
    events: mpsc::Receiver<StatusEvent>,
}

impl StatusReceiver {
    pub(crate) fn new(events: mpsc::Receiver<StatusEvent>) -> Self {
        Self { events }
    }

    /// Wait for the next event; `None` once the orchestrator is closed
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            let mut event = self.events.recv().await?;
            if event.hand_over() {
                return Some(event);
            }
        }
    }

    /// Take an event if one is waiting
    ///
    /// # Errors
    /// Returns [`TryRecvError::Empty`] if no event is waiting and
    /// [`TryRecvError::Disconnected`] once the orchestrator is closed
    pub fn try_recv(&mut self) -> Result<StatusEvent, TryRecvError> {
        loop {
            let mut event = self.events.try_recv()?;
            if event.hand_over() {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_is_received() {
        let mut event = StatusEvent::new(ResyncStatus::Started);
        let ack = event.receive_ack().unwrap();
        assert!(event.receive_ack().is_none());
        assert_eq!(event.status(), ResyncStatus::Started);

        let before = Instant::now();
        event.ack();
        assert!(ack.await.unwrap() >= before);
    }

    #[tokio::test]
    async fn dropped_event_is_not_an_ack() {
        let mut event = StatusEvent::new(ResyncStatus::Started);
        let ack = event.receive_ack().unwrap();
        drop(event);
        assert!(ack.await.is_err());
    }

    #[tokio::test]
    async fn abandoned_event_is_discarded() {
        let (sender, events) = mpsc::channel(2);
        let mut receiver = StatusReceiver::new(events);

        let mut abandoned = StatusEvent::new(ResyncStatus::Started);
        drop(abandoned.watch_taken());
        sender.send(abandoned).await.unwrap();
        assert!(matches!(receiver.try_recv(), Err(TryRecvError::Empty)));

        let mut awaited = StatusEvent::new(ResyncStatus::Started);
        let taken = awaited.watch_taken();
        sender.send(awaited).await.unwrap();
        assert!(receiver.recv().await.is_some());
        assert!(taken.await.is_ok());

        drop(sender);
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn status_display() {
        assert_eq!(ResyncStatus::Started.to_string(), "STARTED");
        assert_eq!(ResyncStatus::NotActive.to_string(), "NOT_ACTIVE");
    }
}
