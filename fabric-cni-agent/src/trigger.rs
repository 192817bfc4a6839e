use tokio::sync::mpsc::{self, Receiver, Sender};

/// Coalesced wake-up signal for resync loops.
///
/// The channel has capacity one and senders never block: kicking an
/// already-kicked trigger is a no-op. The contract is "at least one more
/// sync will run after this call", not one sync per kick.
pub fn trigger() -> (Trigger, TriggerReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger { tx }, TriggerReceiver { rx })
}

#[derive(Clone)]
pub struct Trigger {
    tx: Sender<()>,
}

impl Trigger {
    pub fn kick(&self) {
        // Full means a wake-up is already pending, which is exactly the
        // coalescing we want. Closed means the worker is shutting down.
        let _ = self.tx.try_send(());
    }
}

pub struct TriggerReceiver {
    rx: Receiver<()>,
}

impl TriggerReceiver {
    /// Waits for the next pending wake-up. Returns false once all
    /// triggers have been dropped.
    pub async fn triggered(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kicks_coalesce() {
        let (t, mut rx) = trigger();
        t.kick();
        t.kick();
        t.kick();
        assert!(rx.triggered().await);
        // the burst collapsed into a single pending wake-up
        assert!(rx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_kick_after_drain_wakes_again() {
        let (t, mut rx) = trigger();
        t.kick();
        assert!(rx.triggered().await);
        t.kick();
        assert!(rx.triggered().await);
    }

    #[tokio::test]
    async fn test_closed_when_senders_dropped() {
        let (t, mut rx) = trigger();
        drop(t);
        assert!(!rx.triggered().await);
    }
}
