use crate::types::{ActivityState, TelemetryRecord, TrainerConfig};
use std::time::{Duration, Instant};

/// Derives Active/Sleeping from incoming telemetry and rate-limits what is
/// forwarded to the host
///
/// The classifier tracks the last instant any of speed, cadence, or power was
/// non-zero. Once all three have been zero for `sleep_timeout` the trainer is
/// considered Sleeping, and updates are reduced to a heartbeat every
/// `last_seen_interval` so the host still knows the device is alive without
/// being flooded with zero-value records. While Active, `update_throttle`
/// optionally caps the forwarding rate; the most recent record is always the
/// one forwarded, never an average.
///
/// This is a presentation-layer rate limit. It sits on the telemetry path
/// only and never delays command responses or connection-state changes.
#[derive(Debug)]
pub struct ActivityClassifier {
    sleep_timeout: Duration,
    last_seen_interval: Duration,
    update_throttle: Duration,
    last_activity: Instant,
    last_publish: Option<Instant>,
    last_heartbeat: Option<Instant>,
}

impl ActivityClassifier {
    /// Create a classifier; the activity timer starts now
    #[must_use]
    pub fn new(
        sleep_timeout: Duration,
        last_seen_interval: Duration,
        update_throttle: Duration,
    ) -> Self {
        Self {
            sleep_timeout,
            last_seen_interval,
            update_throttle,
            last_activity: Instant::now(),
            last_publish: None,
            last_heartbeat: None,
        }
    }

    /// Create a classifier from the trainer configuration
    #[must_use]
    pub fn from_config(config: &TrainerConfig) -> Self {
        Self::new(
            config.sleep_timeout,
            config.last_seen_interval,
            config.update_throttle,
        )
    }

    /// Current state as of `now`
    #[must_use]
    pub fn state(&self, now: Instant) -> ActivityState {
        if now.duration_since(self.last_activity) >= self.sleep_timeout {
            ActivityState::Sleeping
        } else {
            ActivityState::Active
        }
    }

    /// Classify a record and decide whether to forward it
    ///
    /// Returns the activity state to annotate the record with when it should
    /// reach the host, or `None` when the record is suppressed by the
    /// throttle or the sleeping heartbeat interval.
    pub fn observe(&mut self, record: &TelemetryRecord, now: Instant) -> Option<ActivityState> {
        if record.has_activity() {
            self.last_activity = now;
        }

        match self.state(now) {
            ActivityState::Active => {
                self.last_heartbeat = None;

                if !self.update_throttle.is_zero() {
                    if let Some(last) = self.last_publish {
                        if now.duration_since(last) < self.update_throttle {
                            return None;
                        }
                    }
                }

                self.last_publish = Some(now);
                Some(ActivityState::Active)
            }
            ActivityState::Sleeping => {
                let due = match self.last_heartbeat {
                    None => true,
                    Some(last) => now.duration_since(last) >= self.last_seen_interval,
                };

                if due {
                    self.last_heartbeat = Some(now);
                    Some(ActivityState::Sleeping)
                } else {
                    None
                }
            }
        }
    }
}
