use crate::{error::FrameError, types::TelemetryRecord};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{collections::HashMap, fmt};
use uuid::Uuid;

/// Expand a 16-bit GATT UUID onto the Bluetooth base UUID
#[must_use]
pub const fn ble_uuid16(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | ((short as u128) << 96))
}

/// Fitness Machine Service
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid16(0x1826);

/// Fitness Machine Control Point characteristic
pub const FTMS_CONTROL_POINT_UUID: Uuid = ble_uuid16(0x2AD9);

/// Fitness Machine Status characteristic (optional on most trainers)
pub const FTMS_STATUS_UUID: Uuid = ble_uuid16(0x2ADA);

/// Indoor Bike Data characteristic carrying telemetry broadcasts
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid16(0x2AD2);

/// Device Information Service
pub const DEVICE_INFORMATION_UUID: Uuid = ble_uuid16(0x180A);

/// Manufacturer Name String characteristic
pub const MANUFACTURER_NAME_UUID: Uuid = ble_uuid16(0x2A29);

/// Model Number String characteristic
pub const MODEL_NUMBER_UUID: Uuid = ble_uuid16(0x2A24);

/// Characteristic property bit: readable
pub const PROP_READ: u8 = 0x01;
/// Characteristic property bit: writable
pub const PROP_WRITE: u8 = 0x02;
/// Characteristic property bit: notifies
pub const PROP_NOTIFY: u8 = 0x04;

/// First byte of every Control Point response notification
pub const CP_RESPONSE_CODE: u8 = 0x80;

mod opcode {
    pub const REQUEST_CONTROL: u8 = 0x00;
    pub const RESET: u8 = 0x01;
    pub const SET_TARGET_POWER: u8 = 0x05;
    pub const START_TRAINING: u8 = 0x07;
    pub const STOP_TRAINING: u8 = 0x08;
    pub const SET_SIM_PARAMS: u8 = 0x11;
    pub const SET_WHEEL_CIRCUMFERENCE: u8 = 0x12;
}

/// Outbound Control Point command
///
/// Each variant serializes to its FTMS opcode plus little-endian fixed-point
/// parameters. The opcode doubles as the correlation key matching the
/// eventual `0x80` response notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Become the controlling client
    RequestControl,
    /// Reset the control session
    Reset,
    /// ERG mode: hold a fixed power target
    SetErgTarget {
        /// Target power in watts
        watts: u16,
    },
    /// Grade simulation parameters
    SetGradeSimulation {
        /// Road gradient in percent (0.01 % wire resolution)
        grade_percent: f64,
        /// Headwind in m/s (0.001 m/s wire resolution)
        wind_mps: f64,
        /// Rolling resistance coefficient (0.0001 wire resolution)
        crr: f64,
        /// Wind resistance coefficient in kg/m (0.01 wire resolution)
        cw: f64,
    },
    /// Wheel circumference used for speed derivation
    SetWheelCircumference {
        /// Circumference in millimeters (0.1 mm wire resolution)
        millimeters: f64,
    },
    /// Start or resume training
    StartTraining,
    /// Stop training; not all trainers support this opcode
    StopTraining,
    /// Any other control action, passed through unmodified
    Generic {
        /// Raw FTMS opcode
        opcode: u8,
        /// Raw parameter bytes
        parameters: Vec<u8>,
    },
}

impl ControlCommand {
    /// The command's correlation key
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Self::RequestControl => opcode::REQUEST_CONTROL,
            Self::Reset => opcode::RESET,
            Self::SetErgTarget { .. } => opcode::SET_TARGET_POWER,
            Self::SetGradeSimulation { .. } => opcode::SET_SIM_PARAMS,
            Self::SetWheelCircumference { .. } => opcode::SET_WHEEL_CIRCUMFERENCE,
            Self::StartTraining => opcode::START_TRAINING,
            Self::StopTraining => opcode::STOP_TRAINING,
            Self::Generic { opcode, .. } => *opcode,
        }
    }

    /// Serialize to a Control Point write value
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.opcode());

        match self {
            Self::RequestControl | Self::Reset | Self::StartTraining | Self::StopTraining => {}
            Self::SetErgTarget { watts } => buf.put_u16_le(*watts),
            Self::SetGradeSimulation {
                grade_percent,
                wind_mps,
                crr,
                cw,
            } => {
                buf.put_i16_le((wind_mps * 1000.0).round() as i16);
                buf.put_i16_le((grade_percent * 100.0).round() as i16);
                buf.put_u8((crr * 10000.0).round() as u8);
                buf.put_u8((cw * 100.0).round() as u8);
            }
            Self::SetWheelCircumference { millimeters } => {
                buf.put_u16_le((millimeters * 10.0).round() as u16);
            }
            Self::Generic { parameters, .. } => buf.extend_from_slice(parameters),
        }

        buf.freeze()
    }

    /// Deserialize a Control Point write value back into a command
    ///
    /// Opcodes without a typed variant decode to [`ControlCommand::Generic`].
    pub fn decode(value: &[u8]) -> Result<Self, FrameError> {
        let (&op, mut rest) = value
            .split_first()
            .ok_or_else(|| FrameError::Malformed("empty control point value".into()))?;

        let need = |n: usize| {
            if rest.len() < n {
                Err(FrameError::Malformed(format!(
                    "control point opcode {op:#04X} needs {n} parameter bytes, got {}",
                    rest.len()
                )))
            } else {
                Ok(())
            }
        };

        Ok(match op {
            opcode::REQUEST_CONTROL => Self::RequestControl,
            opcode::RESET => Self::Reset,
            opcode::START_TRAINING => Self::StartTraining,
            opcode::STOP_TRAINING => Self::StopTraining,
            opcode::SET_TARGET_POWER => {
                need(2)?;
                Self::SetErgTarget {
                    watts: rest.get_u16_le(),
                }
            }
            opcode::SET_SIM_PARAMS => {
                need(6)?;
                Self::SetGradeSimulation {
                    wind_mps: f64::from(rest.get_i16_le()) / 1000.0,
                    grade_percent: f64::from(rest.get_i16_le()) / 100.0,
                    crr: f64::from(rest.get_u8()) / 10000.0,
                    cw: f64::from(rest.get_u8()) / 100.0,
                }
            }
            opcode::SET_WHEEL_CIRCUMFERENCE => {
                need(2)?;
                Self::SetWheelCircumference {
                    millimeters: f64::from(rest.get_u16_le()) / 10.0,
                }
            }
            _ => Self::Generic {
                opcode: op,
                parameters: rest.to_vec(),
            },
        })
    }
}

/// Control Point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpResult {
    /// Command accepted
    Success,
    /// Trainer firmware does not implement the opcode
    OpCodeNotSupported,
    /// Parameter out of the trainer's accepted range
    InvalidParameter,
    /// Trainer could not carry out the command
    OperationFailed,
    /// Control has not been granted to this client
    ControlNotPermitted,
    /// Result code outside the FTMS-defined set
    Unknown(u8),
}

impl CpResult {
    /// Convert from the wire result code
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }

    /// True for [`CpResult::Success`]
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for CpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::OpCodeNotSupported => write!(f, "OP_CODE_NOT_SUPPORTED"),
            Self::InvalidParameter => write!(f, "INVALID_PARAMETER"),
            Self::OperationFailed => write!(f, "OPERATION_FAILED"),
            Self::ControlNotPermitted => write!(f, "CONTROL_NOT_PERMITTED"),
            Self::Unknown(code) => write!(f, "UNKNOWN_RESULT_{code:#04x}"),
        }
    }
}

/// A Control Point response correlated to an earlier command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    /// Opcode of the request this response answers
    pub request_opcode: u8,
    /// Outcome reported by the trainer
    pub result: CpResult,
}

impl ControlResponse {
    /// Parse a Control Point notification value
    ///
    /// Returns `None` for values that are not `0x80` responses; those are
    /// unsolicited status packets and are ignored by the session.
    #[must_use]
    pub fn parse(value: &[u8]) -> Option<Self> {
        if value.len() >= 3 && value[0] == CP_RESPONSE_CODE {
            Some(Self {
                request_opcode: value[1],
                result: CpResult::from_u8(value[2]),
            })
        } else {
            None
        }
    }
}

/// A notification split into characteristic identity and value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Source characteristic
    pub char_uuid: Uuid,
    /// Raw value bytes
    pub value: Bytes,
}

impl Notification {
    /// Parse a type-6 frame payload: 16-byte characteristic UUID + value
    pub fn parse(payload: &Bytes) -> Result<Self, FrameError> {
        if payload.len() < 16 {
            return Err(FrameError::Malformed(format!(
                "notification payload too short: {} bytes",
                payload.len()
            )));
        }

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&payload[..16]);

        Ok(Self {
            char_uuid: Uuid::from_bytes(uuid_bytes),
            value: payload.slice(16..),
        })
    }
}

/// Parse a Discover Services response: a flat list of 16-byte UUIDs
pub fn parse_services(data: &[u8]) -> Result<Vec<Uuid>, FrameError> {
    if data.len() % 16 != 0 {
        return Err(FrameError::Malformed(format!(
            "service list length {} is not a multiple of 16",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(16)
        .map(|c| {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(c);
            Uuid::from_bytes(bytes)
        })
        .collect())
}

/// Parse a Discover Characteristics response
///
/// Layout: the echoed 16-byte service UUID, then 17-byte records of
/// characteristic UUID + property bits.
pub fn parse_characteristics(
    data: &[u8],
    expected_service: Uuid,
) -> Result<HashMap<Uuid, u8>, FrameError> {
    if data.len() < 16 {
        return Err(FrameError::Malformed(
            "characteristic list missing service UUID".into(),
        ));
    }

    let mut svc_bytes = [0u8; 16];
    svc_bytes.copy_from_slice(&data[..16]);
    let svc = Uuid::from_bytes(svc_bytes);
    if svc != expected_service {
        return Err(FrameError::Malformed(format!(
            "characteristic list for service {svc}, expected {expected_service}"
        )));
    }

    let records = &data[16..];
    if records.len() % 17 != 0 {
        return Err(FrameError::Malformed(format!(
            "characteristic records length {} is not a multiple of 17",
            records.len()
        )));
    }

    let mut out = HashMap::new();
    for record in records.chunks_exact(17) {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&record[..16]);
        out.insert(Uuid::from_bytes(bytes), record[16]);
    }
    Ok(out)
}

/// Parse an Indoor Bike Data value into a telemetry record
///
/// The value opens with a u16 little-endian flags word; fields follow
/// conditionally. Instantaneous speed leads whenever any field is present,
/// which matches what trainers emit in practice even when flag bit 0 varies.
/// Absent fields stay `None`; absence means unchanged, not zero.
#[must_use]
pub fn parse_indoor_bike_data(value: &[u8]) -> TelemetryRecord {
    let mut record = TelemetryRecord::default();
    if value.len() < 2 {
        return record;
    }

    let flags = u16::from_le_bytes([value[0], value[1]]);
    let mut rest = &value[2..];

    let take_u16 = |rest: &mut &[u8]| {
        if rest.len() >= 2 {
            Some(rest.get_u16_le())
        } else {
            None
        }
    };

    if let Some(raw) = take_u16(&mut rest) {
        record.speed_kmh = Some(f64::from(raw) / 100.0);
    }
    if flags & (1 << 1) != 0 {
        record.avg_speed_kmh = take_u16(&mut rest).map(|raw| f64::from(raw) / 100.0);
    }
    if flags & (1 << 2) != 0 {
        record.cadence_rpm = take_u16(&mut rest).map(|raw| f64::from(raw) / 2.0);
    }
    if flags & (1 << 3) != 0 {
        record.avg_cadence_rpm = take_u16(&mut rest).map(|raw| f64::from(raw) / 2.0);
    }
    if flags & (1 << 4) != 0 && rest.len() >= 3 {
        let raw = u32::from(rest[0]) | u32::from(rest[1]) << 8 | u32::from(rest[2]) << 16;
        record.distance_m = Some(f64::from(raw));
        rest = &rest[3..];
    }
    if flags & (1 << 5) != 0 && rest.len() >= 2 {
        record.resistance_level = Some(f64::from(rest.get_i16_le()));
    }
    if flags & (1 << 6) != 0 && rest.len() >= 2 {
        record.power_w = Some(f64::from(rest.get_i16_le()));
    }

    record
}

/// Build an Indoor Bike Data value from speed, cadence, and power
///
/// Inverse of [`parse_indoor_bike_data`] for the fields trainers broadcast
/// by default. Used by tests and simulators.
#[must_use]
pub fn encode_indoor_bike_data(speed_kmh: f64, cadence_rpm: f64, power_w: i16) -> Bytes {
    let flags: u16 = (1 << 2) | (1 << 6);
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u16_le(flags);
    buf.put_u16_le((speed_kmh * 100.0).round() as u16);
    buf.put_u16_le((cadence_rpm * 2.0).round() as u16);
    buf.put_i16_le(power_w);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_expansion() {
        assert_eq!(
            FTMS_SERVICE_UUID.to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            FTMS_CONTROL_POINT_UUID.to_string(),
            "00002ad9-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_erg_target_encoding() {
        let cmd = ControlCommand::SetErgTarget { watts: 250 };
        let bytes = cmd.encode();

        assert_eq!(&bytes[..], &[0x05, 250, 0]);
    }

    #[test]
    fn test_sim_params_encoding() {
        let cmd = ControlCommand::SetGradeSimulation {
            grade_percent: 3.5,
            wind_mps: 0.0,
            crr: 0.0040,
            cw: 0.51,
        };
        let bytes = cmd.encode();

        // 0x11, wind=0 (i16), grade=350 (i16), crr=40, cw=51
        assert_eq!(&bytes[..], &[0x11, 0, 0, 0x5E, 0x01, 40, 51]);
    }

    #[test]
    fn test_wheel_circumference_encoding() {
        let cmd = ControlCommand::SetWheelCircumference {
            millimeters: 2105.0,
        };
        let bytes = cmd.encode();

        // 21050 = 0x523A in 0.1mm units
        assert_eq!(&bytes[..], &[0x12, 0x3A, 0x52]);
    }

    #[test]
    fn test_command_round_trip() {
        let commands = [
            ControlCommand::RequestControl,
            ControlCommand::Reset,
            ControlCommand::StartTraining,
            ControlCommand::StopTraining,
            ControlCommand::SetErgTarget { watts: 420 },
            ControlCommand::SetGradeSimulation {
                grade_percent: -2.25,
                wind_mps: 1.5,
                crr: 0.0051,
                cw: 0.63,
            },
            ControlCommand::SetWheelCircumference { millimeters: 2096.5 },
            ControlCommand::Generic {
                opcode: 0x30,
                parameters: vec![1, 2, 3],
            },
        ];

        for cmd in commands {
            let decoded = ControlCommand::decode(&cmd.encode()).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn test_truncated_command_rejected() {
        assert!(ControlCommand::decode(&[]).is_err());
        assert!(ControlCommand::decode(&[0x05, 0x10]).is_err());
        assert!(ControlCommand::decode(&[0x11, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_cp_response_parsing() {
        let resp = ControlResponse::parse(&[0x80, 0x05, 0x01]).unwrap();
        assert_eq!(resp.request_opcode, 0x05);
        assert!(resp.result.is_success());

        let resp = ControlResponse::parse(&[0x80, 0x08, 0x02]).unwrap();
        assert_eq!(resp.result, CpResult::OpCodeNotSupported);

        // unsolicited machine-status style packet is not a response
        assert!(ControlResponse::parse(&[0x04, 0x01]).is_none());
        assert!(ControlResponse::parse(&[0x80, 0x05]).is_none());
    }

    #[test]
    fn test_parse_indoor_bike_data_speed_cadence_power() {
        // flags: cadence (bit 2) + power (bit 6)
        let value = encode_indoor_bike_data(12.34, 80.0, 250);
        let record = parse_indoor_bike_data(&value);

        assert_eq!(record.speed_kmh, Some(12.34));
        assert_eq!(record.cadence_rpm, Some(80.0));
        assert_eq!(record.power_w, Some(250.0));
        assert_eq!(record.avg_speed_kmh, None);
        assert_eq!(record.distance_m, None);
    }

    #[test]
    fn test_parse_indoor_bike_data_absent_fields_stay_none() {
        let record = parse_indoor_bike_data(&[0x00, 0x00]);
        assert_eq!(record.speed_kmh, None);
        assert_eq!(record.power_w, None);

        let record = parse_indoor_bike_data(&[]);
        assert_eq!(record, TelemetryRecord::default());
    }

    #[test]
    fn test_parse_services() {
        let mut data = Vec::new();
        data.extend_from_slice(FTMS_SERVICE_UUID.as_bytes());
        data.extend_from_slice(DEVICE_INFORMATION_UUID.as_bytes());

        let services = parse_services(&data).unwrap();
        assert_eq!(services, vec![FTMS_SERVICE_UUID, DEVICE_INFORMATION_UUID]);

        assert!(parse_services(&data[..20]).is_err());
    }

    #[test]
    fn test_parse_characteristics() {
        let mut data = Vec::new();
        data.extend_from_slice(FTMS_SERVICE_UUID.as_bytes());
        data.extend_from_slice(FTMS_CONTROL_POINT_UUID.as_bytes());
        data.push(PROP_WRITE | PROP_NOTIFY);
        data.extend_from_slice(INDOOR_BIKE_DATA_UUID.as_bytes());
        data.push(PROP_NOTIFY);

        let chars = parse_characteristics(&data, FTMS_SERVICE_UUID).unwrap();
        assert_eq!(chars[&FTMS_CONTROL_POINT_UUID], PROP_WRITE | PROP_NOTIFY);
        assert_eq!(chars[&INDOOR_BIKE_DATA_UUID], PROP_NOTIFY);

        let wrong = parse_characteristics(&data, DEVICE_INFORMATION_UUID);
        assert!(wrong.is_err());
    }

    #[test]
    fn test_notification_parsing() {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(INDOOR_BIKE_DATA_UUID.as_bytes());
        payload.extend_from_slice(&[0x44, 0x00, 0xD2, 0x04]);

        let n = Notification::parse(&payload.freeze()).unwrap();
        assert_eq!(n.char_uuid, INDOOR_BIKE_DATA_UUID);
        assert_eq!(&n.value[..], &[0x44, 0x00, 0xD2, 0x04]);

        assert!(Notification::parse(&Bytes::from_static(&[0u8; 10])).is_err());
    }
}
