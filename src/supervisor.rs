use crate::{
    error::Result,
    session::{DisconnectReason, Session},
    types::SupervisorState,
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff between reconnect attempts
///
/// Starts at the floor, doubles per attempt, saturates at the ceiling, and
/// resets to the floor after a successful reconnect.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Backoff {
    /// Create a backoff schedule
    #[must_use]
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            next: floor,
        }
    }

    /// Take the next wait interval and advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.ceiling.min(self.next.saturating_mul(2));
        delay
    }

    /// Reset to the floor after a successful connection
    pub fn reset(&mut self) {
        self.next = self.floor;
    }
}

/// Drive automatic reconnection for a session
///
/// Waits for disconnect notifications, then retries `reconnect` under the
/// backoff schedule until one attempt succeeds. A user-initiated disconnect
/// sets `suppressed`, which silences the supervisor until the host explicitly
/// reconnects. The supervisor only ever requests connection-state
/// transitions; the session remains the sole owner of its state.
pub(crate) async fn run<F, Fut>(
    session: Session,
    mut backoff: Backoff,
    state_tx: watch::Sender<SupervisorState>,
    mut lost_rx: mpsc::UnboundedReceiver<DisconnectReason>,
    suppressed: Arc<AtomicBool>,
    cancel: CancellationToken,
    mut reconnect: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        let reason = tokio::select! {
            () = cancel.cancelled() => return,
            reason = lost_rx.recv() => match reason {
                Some(reason) => reason,
                None => return,
            },
        };

        if suppressed.load(Ordering::SeqCst) {
            debug!(%reason, "disconnect while suppressed; not reconnecting");
            continue;
        }

        warn!(%reason, "connection lost; starting automatic reconnect");
        session.note_reconnecting().await;

        loop {
            let delay = backoff.next_delay();
            state_tx.send_replace(SupervisorState::WaitingToRetry);
            debug!(?delay, "waiting before reconnect attempt");

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            if suppressed.load(Ordering::SeqCst) {
                break;
            }

            state_tx.send_replace(SupervisorState::Retrying);
            match reconnect().await {
                Ok(()) => {
                    info!("reconnected");
                    backoff.reset();
                    break;
                }
                Err(err) => {
                    warn!(%err, "reconnect attempt failed");
                }
            }
        }

        state_tx.send_replace(SupervisorState::Idle);

        // events queued by the torn-down connection are stale now
        while lost_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_is_nondecreasing_and_bounded() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_doubles_from_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_resets_after_success() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
