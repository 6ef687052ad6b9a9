use crate::{
    error::{CommandError, ConnectError, WftnpError},
    frame::{Frame, FrameDecoder, MessageType},
    ftms::{
        parse_characteristics, parse_indoor_bike_data, parse_services, ControlCommand,
        ControlResponse, Notification, FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID,
    },
    types::{ConnectionState, TelemetryRecord, TrainerConfig},
};
use bytes::{Bytes, BytesMut};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, watch, Mutex},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the TCP stream
    PeerClosed,
    /// A socket read failed
    ReadFailed(String),
    /// Nothing arrived within the idle window
    IdleTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::ReadFailed(err) => write!(f, "socket read failed: {err}"),
            Self::IdleTimeout => write!(f, "no data within the idle window"),
        }
    }
}

/// Receiving ends of a session's event streams
///
/// Handed out once at construction; the dispatch and supervisor tasks own
/// them afterwards.
pub struct SessionEvents {
    /// Decoded Indoor Bike Data records, in arrival order
    pub telemetry: mpsc::UnboundedReceiver<TelemetryRecord>,
    /// Unexpected disconnects (never fired for user-initiated ones)
    pub lost: mpsc::UnboundedReceiver<DisconnectReason>,
    /// Connection lifecycle state
    pub state: watch::Receiver<ConnectionState>,
}

type PendingMap = HashMap<(u8, u8), oneshot::Sender<(u8, Bytes)>>;

struct SessionInner {
    state_tx: watch::Sender<ConnectionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    cancel: Mutex<Option<CancellationToken>>,
    /// In-flight WFTNP requests keyed by (message type, sequence)
    pending: Mutex<PendingMap>,
    /// In-flight control-point commands keyed by opcode; one slot per opcode
    cp_pending: Mutex<HashMap<u8, oneshot::Sender<ControlResponse>>>,
    seq: AtomicU8,
    idle_window: Duration,
    connect_timeout: Duration,
    command_timeout: Duration,
    telemetry_tx: mpsc::UnboundedSender<TelemetryRecord>,
    lost_tx: mpsc::UnboundedSender<DisconnectReason>,
}

/// A WFTNP session over one TCP connection
///
/// Owns the socket, the read-loop task, and the correlation state for
/// in-flight requests. All methods take `&self`; the handle is cheap to
/// clone and share across tasks.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a disconnected session and the receiving ends of its events
    #[must_use]
    pub fn new(config: &TrainerConfig) -> (Self, SessionEvents) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let session = Self {
            inner: Arc::new(SessionInner {
                state_tx,
                writer: Mutex::new(None),
                cancel: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                cp_pending: Mutex::new(HashMap::new()),
                seq: AtomicU8::new(0),
                idle_window: config.idle_window,
                connect_timeout: config.connect_timeout,
                command_timeout: config.command_timeout,
                telemetry_tx,
                lost_tx,
            }),
        };

        let events = SessionEvents {
            telemetry: telemetry_rx,
            lost: lost_rx,
            state: state_rx,
        };

        (session, events)
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// True when the read loop is running against a live socket
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Establish the TCP connection and start the read loop
    ///
    /// Any previous connection is torn down first. `TCP_NODELAY` is
    /// requested so small command frames are not held back by Nagle; failure
    /// to set it is logged and ignored.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.teardown(None).await;

        // preserve Reconnecting during supervisor-driven attempts
        self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });

        let result = self
            .open_stream(host, port, self.inner.connect_timeout)
            .await;

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                self.inner.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                return Err(err);
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "could not set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(write_half);

        let token = CancellationToken::new();
        *self.inner.cancel.lock().await = Some(token.clone());
        tokio::spawn(read_loop(Arc::clone(&self.inner), read_half, token));

        self.inner.state_tx.send_replace(ConnectionState::Connected);
        info!(host, port, "connected");
        Ok(())
    }

    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<TcpStream, ConnectError> {
        match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(ConnectError::Io(err)),
            Err(_) => Err(ConnectError::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            }),
        }
    }

    /// Tear down the connection
    ///
    /// Idempotent. Every in-flight request and command fails with
    /// [`CommandError::Disconnected`]. No disconnect event is emitted; this
    /// path is user-initiated and must not wake the supervisor.
    pub async fn disconnect(&self) {
        self.teardown(None).await;
        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    /// Mark the state as Reconnecting on behalf of the supervisor
    pub(crate) async fn note_reconnecting(&self) {
        self.inner
            .state_tx
            .send_replace(ConnectionState::Reconnecting);
    }

    async fn teardown(&self, reason: Option<DisconnectReason>) {
        if let Some(token) = self.inner.cancel.lock().await.take() {
            token.cancel();
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        // dropping the senders fails every waiter with Disconnected
        self.inner.pending.lock().await.clear();
        self.inner.cp_pending.lock().await.clear();

        if let Some(reason) = reason {
            let _ = self.inner.lost_tx.send(reason);
        }
    }

    /// List the services the trainer exposes
    pub async fn discover_services(&self) -> Result<Vec<Uuid>, WftnpError> {
        let data = self
            .request(MessageType::DiscoverServices, Bytes::new())
            .await?;
        Ok(parse_services(&data)?)
    }

    /// List the characteristics of one service with their property bits
    pub async fn discover_characteristics(
        &self,
        service: Uuid,
    ) -> Result<HashMap<Uuid, u8>, WftnpError> {
        let payload = Bytes::copy_from_slice(service.as_bytes());
        let data = self
            .request(MessageType::DiscoverCharacteristics, payload)
            .await?;
        Ok(parse_characteristics(&data, service)?)
    }

    /// Read a characteristic value
    pub async fn read_characteristic(&self, characteristic: Uuid) -> Result<Bytes, WftnpError> {
        let payload = Bytes::copy_from_slice(characteristic.as_bytes());
        let mut data = self
            .request(MessageType::ReadCharacteristic, payload)
            .await?;

        // response echoes the 16-byte UUID ahead of the value
        if data.len() < 16 {
            return Err(WftnpError::Protocol(format!(
                "read response too short: {} bytes",
                data.len()
            )));
        }
        Ok(data.split_off(16))
    }

    /// Write a characteristic value
    pub async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), CommandError> {
        let mut payload = BytesMut::with_capacity(16 + value.len());
        payload.extend_from_slice(characteristic.as_bytes());
        payload.extend_from_slice(value);
        self.request(MessageType::WriteCharacteristic, payload.freeze())
            .await?;
        Ok(())
    }

    /// Enable or disable notifications on a characteristic
    pub async fn enable_notifications(
        &self,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), CommandError> {
        let mut payload = BytesMut::with_capacity(17);
        payload.extend_from_slice(characteristic.as_bytes());
        payload.extend_from_slice(&[u8::from(enable)]);
        self.request(MessageType::EnableNotifications, payload.freeze())
            .await?;
        Ok(())
    }

    /// Send an FTMS control-point command and await the trainer's response
    ///
    /// At most one command per opcode may be in flight; a second one fails
    /// immediately with [`CommandError::Busy`]. The returned response carries
    /// the trainer's result code, which the caller inspects.
    pub async fn send_command(
        &self,
        command: &ControlCommand,
        command_timeout: Duration,
    ) -> Result<ControlResponse, CommandError> {
        let opcode = command.opcode();

        let rx = {
            let mut cp_pending = self.inner.cp_pending.lock().await;
            if cp_pending.contains_key(&opcode) {
                return Err(CommandError::Busy { opcode });
            }
            let (tx, rx) = oneshot::channel();
            cp_pending.insert(opcode, tx);
            rx
        };

        debug!(opcode, "sending control command");
        if let Err(err) = self
            .write_characteristic(FTMS_CONTROL_POINT_UUID, &command.encode())
            .await
        {
            self.inner.cp_pending.lock().await.remove(&opcode);
            return Err(err);
        }

        match timeout(command_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                self.inner.cp_pending.lock().await.remove(&opcode);
                Err(CommandError::Timeout {
                    timeout_ms: command_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Issue one WFTNP request and await its correlated response payload
    async fn request(&self, msg_type: MessageType, payload: Bytes) -> Result<Bytes, CommandError> {
        let seq = self
            .inner
            .seq
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let key = (msg_type as u8, seq);

        let rx = {
            let mut pending = self.inner.pending.lock().await;
            let (tx, rx) = oneshot::channel();
            pending.insert(key, tx);
            rx
        };

        let frame = Frame::request(msg_type, seq, payload).encode();
        {
            let mut writer = self.inner.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.inner.pending.lock().await.remove(&key);
                return Err(CommandError::Disconnected);
            };
            if let Err(err) = writer.write_all(&frame).await {
                warn!(%err, "socket write failed");
                self.inner.pending.lock().await.remove(&key);
                return Err(CommandError::Disconnected);
            }
        }

        let request_timeout = self.inner.command_timeout;
        match timeout(request_timeout, rx).await {
            Ok(Ok((0, data))) => Ok(data),
            Ok(Ok((code, _))) => Err(CommandError::Rejected { code }),
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().await.remove(&key);
                Err(CommandError::Timeout {
                    timeout_ms: request_timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Socket read loop
///
/// Sole owner of the read half and the frame decoder. Exits silently on
/// cancellation (user disconnect); any other exit tears the session down and
/// notifies the supervisor.
async fn read_loop(inner: Arc<SessionInner>, mut reader: OwnedReadHalf, token: CancellationToken) {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(4 * 1024);

    let reason = loop {
        let read = tokio::select! {
            () = token.cancelled() => return,
            read = timeout(inner.idle_window, reader.read_buf(&mut buf)) => read,
        };

        match read {
            Err(_) => break DisconnectReason::IdleTimeout,
            Ok(Ok(0)) => break DisconnectReason::PeerClosed,
            Ok(Ok(_)) => {
                for frame in decoder.push(&buf) {
                    dispatch(&inner, frame).await;
                }
                buf.clear();
            }
            Ok(Err(err)) => break DisconnectReason::ReadFailed(err.to_string()),
        }
    };

    warn!(%reason, "connection lost");
    token.cancel();
    if let Some(mut writer) = inner.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
    inner.cancel.lock().await.take();
    inner.pending.lock().await.clear();
    inner.cp_pending.lock().await.clear();
    inner
        .state_tx
        .send_replace(ConnectionState::Disconnected);
    let _ = inner.lost_tx.send(reason);
}

/// Route one decoded frame to its consumer
async fn dispatch(inner: &Arc<SessionInner>, frame: Frame) {
    if frame.msg_type == MessageType::Notification {
        dispatch_notification(inner, &frame).await;
        return;
    }

    let key = (frame.msg_type as u8, frame.seq);
    match inner.pending.lock().await.remove(&key) {
        Some(tx) => {
            let _ = tx.send((frame.resp_code, frame.payload));
        }
        None => debug!(
            msg_type = ?frame.msg_type,
            seq = frame.seq,
            "response with no matching request"
        ),
    }
}

async fn dispatch_notification(inner: &Arc<SessionInner>, frame: &Frame) {
    let notification = match Notification::parse(&frame.payload) {
        Ok(notification) => notification,
        Err(err) => {
            debug!(%err, "dropping malformed notification");
            return;
        }
    };

    if notification.char_uuid == INDOOR_BIKE_DATA_UUID {
        let record = parse_indoor_bike_data(&notification.value);
        let _ = inner.telemetry_tx.send(record);
    } else if notification.char_uuid == FTMS_CONTROL_POINT_UUID {
        let Some(response) = ControlResponse::parse(&notification.value) else {
            debug!("control point notification without response marker");
            return;
        };
        match inner
            .cp_pending
            .lock()
            .await
            .remove(&response.request_opcode)
        {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(
                opcode = response.request_opcode,
                "unsolicited control point response"
            ),
        }
    } else {
        debug!(characteristic = %notification.char_uuid, "unhandled notification");
    }
}
