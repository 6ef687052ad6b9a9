use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Connection lifecycle state of a trainer session
///
/// Owned exclusively by the session; the reconnection supervisor requests
/// transitions but never mutates this directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection and none in progress
    Disconnected,
    /// TCP connect and FTMS initialization in progress
    Connecting,
    /// Session established, read loop running
    Connected,
    /// Connection lost, supervisor is driving reconnect attempts
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Derived rider-activity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    /// Recent non-zero speed, cadence, or power
    Active,
    /// All metrics have been zero for longer than the sleep timeout
    Sleeping,
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Sleeping => write!(f, "Sleeping"),
        }
    }
}

/// State of the reconnection supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    /// Not supervising a reconnect (connected, or manually disconnected)
    Idle,
    /// Disconnect detected, waiting out the backoff interval
    WaitingToRetry,
    /// A reconnect attempt is in flight
    Retrying,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::WaitingToRetry => write!(f, "Waiting to retry"),
            Self::Retrying => write!(f, "Retrying"),
        }
    }
}

/// A decoded telemetry snapshot
///
/// Fields are optional because not every Indoor Bike Data frame carries every
/// measurement; `None` means "unchanged", not zero. Records are handed to the
/// subscriber as they decode and are not retained.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Instantaneous speed in km/h
    pub speed_kmh: Option<f64>,
    /// Average speed in km/h
    pub avg_speed_kmh: Option<f64>,
    /// Instantaneous cadence in rpm
    pub cadence_rpm: Option<f64>,
    /// Average cadence in rpm
    pub avg_cadence_rpm: Option<f64>,
    /// Total distance in meters
    pub distance_m: Option<f64>,
    /// Resistance level (unitless)
    pub resistance_level: Option<f64>,
    /// Instantaneous power in watts
    pub power_w: Option<f64>,
}

impl TelemetryRecord {
    /// True if any of speed, cadence, or power is non-zero
    #[must_use]
    pub fn has_activity(&self) -> bool {
        [self.speed_kmh, self.cadence_rpm, self.power_w]
            .iter()
            .any(|v| v.is_some_and(|x| x != 0.0))
    }
}

/// Manufacturer and model strings read from the Device Information service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInformation {
    /// Manufacturer name (0x2A29), if the trainer exposes it
    pub manufacturer: Option<String>,
    /// Model number (0x2A24), if the trainer exposes it
    pub model: Option<String>,
}

/// Configuration for a trainer connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// All-zero telemetry for this long flips the classifier to Sleeping
    pub sleep_timeout: Duration,
    /// Minimum interval between heartbeat updates while Sleeping
    pub last_seen_interval: Duration,
    /// Minimum interval between forwarded records while Active; zero disables
    pub update_throttle: Duration,
    /// No bytes of any kind for this long marks the connection dead
    pub idle_window: Duration,
    /// TCP connection establishment timeout
    pub connect_timeout: Duration,
    /// Default timeout for WFTNP requests and control commands
    pub command_timeout: Duration,
    /// First reconnect backoff interval
    pub backoff_floor: Duration,
    /// Reconnect backoff ceiling
    pub backoff_ceiling: Duration,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            sleep_timeout: Duration::from_secs(10),
            last_seen_interval: Duration::from_secs(60),
            update_throttle: Duration::ZERO,
            idle_window: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(2),
            backoff_floor: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TrainerConfig::default();

        assert_eq!(config.sleep_timeout, Duration::from_secs(10));
        assert_eq!(config.last_seen_interval, Duration::from_secs(60));
        assert_eq!(config.update_throttle, Duration::ZERO);
        assert_eq!(config.idle_window, Duration::from_secs(30));
        assert_eq!(config.backoff_floor, Duration::from_secs(1));
        assert_eq!(config.backoff_ceiling, Duration::from_secs(60));
    }

    #[test]
    fn test_has_activity() {
        let mut record = TelemetryRecord::default();
        assert!(!record.has_activity());

        record.speed_kmh = Some(0.0);
        record.cadence_rpm = Some(0.0);
        record.power_w = Some(0.0);
        assert!(!record.has_activity());

        record.cadence_rpm = Some(85.0);
        assert!(record.has_activity());

        // distance alone does not count as rider activity
        let coasting = TelemetryRecord {
            distance_m: Some(1200.0),
            ..Default::default()
        };
        assert!(!coasting.has_activity());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
        assert_eq!(ActivityState::Sleeping.to_string(), "Sleeping");
        assert_eq!(SupervisorState::WaitingToRetry.to_string(), "Waiting to retry");
    }
}
