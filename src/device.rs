use crate::{
    activity::ActivityClassifier,
    error::{CommandError, ConnectError, Result, WftnpError},
    ftms::{
        ControlCommand, ControlResponse, DEVICE_INFORMATION_UUID, FTMS_CONTROL_POINT_UUID,
        FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID, MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID,
        PROP_NOTIFY,
    },
    session::{Session, SessionEvents},
    supervisor::{self, Backoff},
    types::{
        ActivityState, ConnectionState, DeviceInformation, SupervisorState, TelemetryRecord,
        TrainerConfig,
    },
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Highest ERG target the trainer accepts, in watts
pub const MAX_ERG_WATTS: u16 = 600;

/// Grade simulation clamp, percent
pub const GRADE_RANGE_PERCENT: (f64, f64) = (-10.0, 15.0);

/// Wind speed clamp, meters per second
pub const WIND_RANGE_MPS: (f64, f64) = (-50.0, 50.0);

/// Rolling resistance coefficient clamp (wire resolution 0.0001)
pub const CRR_RANGE: (f64, f64) = (0.0, 0.0255);

/// Wind resistance coefficient clamp in kg/m (wire resolution 0.01)
pub const CW_RANGE: (f64, f64) = (0.0, 2.55);

/// Typical rolling resistance for a road tire on a trainer
pub const DEFAULT_CRR: f64 = 0.004;

/// Typical wind resistance coefficient for a rider on the hoods
pub const DEFAULT_CW: f64 = 0.51;

/// Callbacks a host implements to receive trainer events
///
/// Handlers run on the dispatch task, decoupled from the socket read loop; a
/// slow handler delays further callbacks but never frame decoding or command
/// responses.
#[async_trait]
pub trait TrainerHandler: Send + Sync {
    /// A telemetry record passed the activity filter
    async fn on_telemetry(&self, record: TelemetryRecord, activity: ActivityState);

    /// The connection lifecycle state changed
    async fn on_connection_state_changed(&self, state: ConnectionState) {
        let _ = state;
    }
}

struct DeviceInner {
    host: String,
    port: u16,
    config: TrainerConfig,
    session: Session,
    handler: Arc<dyn TrainerHandler>,
    device_info: RwLock<DeviceInformation>,
    /// Set by a user disconnect; silences the reconnection supervisor
    suppressed: Arc<AtomicBool>,
    supervisor_rx: watch::Receiver<SupervisorState>,
    cancel: CancellationToken,
}

/// High-level handle to one smart trainer
///
/// Wraps a [`Session`] with FTMS initialization, clamped control commands,
/// activity classification, and supervised reconnection. Cheap to clone.
#[derive(Clone)]
pub struct TrainerDevice {
    inner: Arc<DeviceInner>,
}

impl TrainerDevice {
    /// Connect to a trainer and start the background tasks
    ///
    /// Establishes the TCP session, verifies the Fitness Machine service,
    /// subscribes to control point and Indoor Bike Data notifications, and
    /// spawns the dispatch and reconnection-supervisor tasks. Returns an
    /// error if the trainer is unreachable or does not speak FTMS.
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        config: TrainerConfig,
        handler: Arc<dyn TrainerHandler>,
    ) -> Result<Self> {
        let (session, events) = Session::new(&config);
        let (supervisor_tx, supervisor_rx) = watch::channel(SupervisorState::Idle);

        let inner = Arc::new(DeviceInner {
            host: host.into(),
            port,
            config,
            session,
            handler,
            device_info: RwLock::new(DeviceInformation::default()),
            suppressed: Arc::new(AtomicBool::new(false)),
            supervisor_rx,
            cancel: CancellationToken::new(),
        });

        inner.establish().await?;

        let SessionEvents {
            telemetry,
            lost,
            state,
        } = events;

        tokio::spawn(dispatch_events(Arc::clone(&inner), telemetry, state));

        let backoff = Backoff::new(inner.config.backoff_floor, inner.config.backoff_ceiling);
        let reconnect_inner = Arc::clone(&inner);
        tokio::spawn(supervisor::run(
            inner.session.clone(),
            backoff,
            supervisor_tx,
            lost,
            Arc::clone(&inner.suppressed),
            inner.cancel.child_token(),
            move || {
                let inner = Arc::clone(&reconnect_inner);
                async move { inner.establish().await }
            },
        ));

        Ok(Self { inner })
    }

    /// Hostname or address this device was created for
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Current connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    /// Current reconnection supervisor state
    #[must_use]
    pub fn supervisor_state(&self) -> SupervisorState {
        *self.inner.supervisor_rx.borrow()
    }

    /// True when the session is established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    /// Manufacturer and model strings, if the trainer exposed them
    pub async fn device_information(&self) -> DeviceInformation {
        self.inner.device_info.read().await.clone()
    }

    /// Disconnect and stay disconnected
    ///
    /// Idempotent. The supervisor will not reconnect until [`reconnect`] is
    /// called.
    ///
    /// [`reconnect`]: Self::reconnect
    pub async fn disconnect(&self) {
        self.inner.suppressed.store(true, Ordering::SeqCst);
        self.inner.session.disconnect().await;
        info!("disconnected by user");
    }

    /// Re-establish a connection after a user disconnect
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.suppressed.store(false, Ordering::SeqCst);
        self.inner.establish().await
    }

    /// Disconnect and stop all background tasks
    ///
    /// The device cannot be used afterwards.
    pub async fn shutdown(&self) {
        self.inner.suppressed.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        self.inner.session.disconnect().await;
    }

    /// Set an ERG mode power target
    ///
    /// The target is clamped to `0..=`[`MAX_ERG_WATTS`].
    pub async fn set_erg_watts(&self, watts: u16) -> Result<()> {
        let watts = watts.min(MAX_ERG_WATTS);
        self.execute(&ControlCommand::SetErgTarget { watts }).await
    }

    /// Set a simulated grade with default wind and resistance coefficients
    pub async fn set_grade(&self, grade_percent: f64) -> Result<()> {
        self.set_grade_simulation(grade_percent, 0.0, DEFAULT_CRR, DEFAULT_CW)
            .await
    }

    /// Set full simulation parameters: grade, wind, rolling and wind
    /// resistance coefficients
    ///
    /// All parameters are clamped to the ranges the wire encoding can carry.
    pub async fn set_grade_simulation(
        &self,
        grade_percent: f64,
        wind_mps: f64,
        crr: f64,
        cw: f64,
    ) -> Result<()> {
        self.execute(&ControlCommand::SetGradeSimulation {
            grade_percent: clamp(grade_percent, GRADE_RANGE_PERCENT),
            wind_mps: clamp(wind_mps, WIND_RANGE_MPS),
            crr: clamp(crr, CRR_RANGE),
            cw: clamp(cw, CW_RANGE),
        })
        .await
    }

    /// Set the wheel circumference used for speed calculation, in millimeters
    pub async fn set_wheel_circumference(&self, millimeters: f64) -> Result<()> {
        self.execute(&ControlCommand::SetWheelCircumference {
            millimeters: clamp(millimeters, (0.0, 6553.5)),
        })
        .await
    }

    /// Request control of the fitness machine
    pub async fn request_control(&self) -> Result<()> {
        self.execute(&ControlCommand::RequestControl).await
    }

    /// Reset the fitness machine
    pub async fn reset(&self) -> Result<()> {
        self.execute(&ControlCommand::Reset).await
    }

    /// Start or resume the training session
    pub async fn start_training(&self) -> Result<()> {
        self.execute(&ControlCommand::StartTraining).await
    }

    /// Stop the training session
    pub async fn stop_training(&self) -> Result<()> {
        self.execute(&ControlCommand::StopTraining).await
    }

    /// Send a raw control command and return the trainer's response
    ///
    /// Unlike the typed setters this does not interpret the result code.
    pub async fn send_command(
        &self,
        command: &ControlCommand,
    ) -> std::result::Result<ControlResponse, CommandError> {
        if !self.is_connected() {
            return Err(CommandError::Disconnected);
        }
        self.inner
            .session
            .send_command(command, self.inner.config.command_timeout)
            .await
    }

    async fn execute(&self, command: &ControlCommand) -> Result<()> {
        let response = self.send_command(command).await?;
        if response.result.is_success() {
            Ok(())
        } else {
            Err(WftnpError::Protocol(format!(
                "control point command {:#04x} refused: {}",
                response.request_opcode, response.result
            )))
        }
    }
}

impl DeviceInner {
    /// Connect the session and bring up FTMS
    async fn establish(&self) -> Result<()> {
        self.session.connect(&self.host, self.port).await?;

        if let Err(err) = self.initialize_ftms().await {
            self.session.disconnect().await;
            return Err(ConnectError::Handshake(err.to_string()).into());
        }

        self.control_handshake().await;
        self.refresh_device_information().await;
        Ok(())
    }

    /// Verify the Fitness Machine service and subscribe to its notifications
    async fn initialize_ftms(&self) -> Result<()> {
        let services = self.session.discover_services().await?;
        if !services.contains(&FTMS_SERVICE_UUID) {
            return Err(WftnpError::Protocol(
                "trainer does not expose the Fitness Machine service".into(),
            ));
        }

        let characteristics = self
            .session
            .discover_characteristics(FTMS_SERVICE_UUID)
            .await?;

        if !characteristics.contains_key(&FTMS_CONTROL_POINT_UUID) {
            return Err(WftnpError::Protocol(
                "Fitness Machine service has no control point".into(),
            ));
        }
        self.session
            .enable_notifications(FTMS_CONTROL_POINT_UUID, true)
            .await?;

        let bike_data_notifies = characteristics
            .get(&INDOOR_BIKE_DATA_UUID)
            .is_some_and(|props| props & PROP_NOTIFY != 0);
        if bike_data_notifies {
            self.session
                .enable_notifications(INDOOR_BIKE_DATA_UUID, true)
                .await?;
        } else {
            warn!("trainer does not notify Indoor Bike Data; no telemetry will arrive");
        }

        info!(characteristics = characteristics.len(), "FTMS initialized");
        Ok(())
    }

    /// Request control and start training
    ///
    /// Best effort: some firmware revisions grant control implicitly and
    /// reject the explicit request, so failures are logged, not fatal.
    async fn control_handshake(&self) {
        for command in [&ControlCommand::RequestControl, &ControlCommand::StartTraining] {
            match self
                .session
                .send_command(command, self.config.command_timeout)
                .await
            {
                Ok(response) if response.result.is_success() => {}
                Ok(response) => debug!(
                    opcode = response.request_opcode,
                    result = %response.result,
                    "control handshake command refused"
                ),
                Err(err) => debug!(%err, "control handshake command failed"),
            }
        }
    }

    /// Read manufacturer and model from the Device Information service
    ///
    /// Best effort: absence of the service leaves the fields unset.
    async fn refresh_device_information(&self) {
        let manufacturer = self.read_string(MANUFACTURER_NAME_UUID).await;
        let model = self.read_string(MODEL_NUMBER_UUID).await;

        if manufacturer.is_some() || model.is_some() {
            debug!(?manufacturer, ?model, "device information");
        } else {
            debug!(service = %DEVICE_INFORMATION_UUID, "device information unavailable");
        }

        let mut info = self.device_info.write().await;
        info.manufacturer = manufacturer.or(info.manufacturer.take());
        info.model = model.or(info.model.take());
    }

    async fn read_string(&self, characteristic: Uuid) -> Option<String> {
        match self.session.read_characteristic(characteristic).await {
            Ok(value) => {
                let text = String::from_utf8_lossy(&value)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string();
                (!text.is_empty()).then_some(text)
            }
            Err(err) => {
                debug!(%characteristic, %err, "characteristic read failed");
                None
            }
        }
    }
}

/// Forward telemetry and state changes to the handler
///
/// Runs until the device is shut down. Telemetry passes through the activity
/// classifier, which annotates records and applies the sleeping heartbeat and
/// optional throttle.
async fn dispatch_events(
    inner: Arc<DeviceInner>,
    mut telemetry: mpsc::UnboundedReceiver<TelemetryRecord>,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut classifier = ActivityClassifier::from_config(&inner.config);

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            record = telemetry.recv() => {
                let Some(record) = record else { return };
                if let Some(activity) = classifier.observe(&record, Instant::now()) {
                    inner.handler.on_telemetry(record, activity).await;
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = *state.borrow_and_update();
                inner.handler.on_connection_state_changed(current).await;
            }
        }
    }
}

fn clamp(value: f64, range: (f64, f64)) -> f64 {
    value.clamp(range.0, range.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_clamps() {
        assert_eq!(clamp(20.0, GRADE_RANGE_PERCENT), 15.0);
        assert_eq!(clamp(-12.5, GRADE_RANGE_PERCENT), -10.0);
        assert_eq!(clamp(4.5, GRADE_RANGE_PERCENT), 4.5);

        assert_eq!(clamp(-80.0, WIND_RANGE_MPS), -50.0);
        assert_eq!(clamp(0.5, CRR_RANGE), 0.0255);
        assert_eq!(clamp(3.0, CW_RANGE), 2.55);
    }

    #[test]
    fn test_erg_clamp() {
        assert_eq!(1000_u16.min(MAX_ERG_WATTS), 600);
        assert_eq!(250_u16.min(MAX_ERG_WATTS), 250);
    }
}
