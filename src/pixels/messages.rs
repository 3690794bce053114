//! Messages exchanged with a Pixel over its write and notify characteristics.
//!
//! Every message starts with a one byte [`MessageType`] tag. Messages with a payload have a fixed,
//! packed little-endian layout; every other type is just the tag.

use crate::error::DecodeError;
use crate::pixels::types::{PixelBatteryState, PixelDesignAndColor, PixelRollState, TelemetryRequestMode};

macro_rules! message_types {
    ($($name:ident = $value:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($name = $value,)*
        }

        impl TryFrom<u8> for MessageType {
            type Error = DecodeError;

            fn try_from(value: u8) -> Result<Self, DecodeError> {
                match value {
                    $($value => Ok(MessageType::$name),)*
                    value => Err(DecodeError::UnknownMessageType(value)),
                }
            }
        }
    };
}

message_types! {
    None = 0,
    WhoAreYou = 1,
    IAmADie = 2,
    RollState = 3,
    Telemetry = 4,
    BulkSetup = 5,
    BulkSetupAck = 6,
    BulkData = 7,
    BulkDataAck = 8,
    TransferAnimSet = 9,
    TransferAnimSetAck = 10,
    TransferAnimSetFinished = 11,
    TransferSettings = 12,
    TransferSettingsAck = 13,
    TransferSettingsFinished = 14,
    TransferTestAnimSet = 15,
    TransferTestAnimSetAck = 16,
    TransferTestAnimSetFinished = 17,
    DebugLog = 18,
    PlayAnim = 19,
    PlayAnimEvent = 20,
    StopAnim = 21,
    RemoteAction = 22,
    RequestRollState = 23,
    RequestAnimSet = 24,
    RequestSettings = 25,
    RequestTelemetry = 26,
    ProgramDefaultAnimSet = 27,
    ProgramDefaultAnimSetFinished = 28,
    Blink = 29,
    BlinkAck = 30,
    RequestDefaultAnimSetColor = 31,
    DefaultAnimSetColor = 32,
    RequestBatteryLevel = 33,
    BatteryLevel = 34,
    RequestRssi = 35,
    Rssi = 36,
    Calibrate = 37,
    CalibrateFace = 38,
    NotifyUser = 39,
    NotifyUserAck = 40,
    TestHardware = 41,
    TestLedLoopback = 42,
    LedLoopback = 43,
    SetTopLevelState = 44,
    ProgramDefaultParameters = 45,
    ProgramDefaultParametersFinished = 46,
    SetDesignAndColor = 47,
    SetDesignAndColorAck = 48,
    SetCurrentBehavior = 49,
    SetCurrentBehaviorAck = 50,
    SetName = 51,
    SetNameAck = 52,
    Sleep = 53,
    ExitValidation = 54,
    TransferInstantAnimSet = 55,
    TransferInstantAnimSetAck = 56,
    TransferInstantAnimSetFinished = 57,
    PlayInstantAnim = 58,
    StopAllAnims = 59,
    RequestTemperature = 60,
    Temperature = 61,
    EnableCharging = 62,
    DisableCharging = 63,
    Discharge = 64,
    BlinkId = 65,
    BlinkIdAck = 66,
}

impl MessageType {
    /// Total encoded length, tag included.
    pub fn encoded_len(self) -> usize {
        match self {
            MessageType::IAmADie => 22,
            MessageType::RollState => 3,
            MessageType::Blink => 14,
            MessageType::BatteryLevel => 3,
            MessageType::RequestRssi => 4,
            MessageType::Rssi => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmADie {
    pub led_count: u8,
    pub design_and_color: PixelDesignAndColor,
    pub data_set_hash: u32,
    pub pixel_id: u32,
    pub available_flash: u16,
    /// Firmware build time, seconds since the UNIX epoch.
    pub build_timestamp: u32,
    pub roll_state: PixelRollState,
    pub current_face_index: u8,
    pub battery_level_percent: u8,
    pub battery_state: PixelBatteryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollState {
    pub state: PixelRollState,
    pub face_index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blink {
    pub count: u8,
    pub duration_ms: u16,
    /// 0x00RRGGBB
    pub color: u32,
    pub face_mask: u32,
    /// Amount of in and out fading, 0 = sharp, 255 = smooth.
    pub fade: u8,
    pub loop_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryLevel {
    pub level_percent: u8,
    pub state: PixelBatteryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRssi {
    pub request_mode: TelemetryRequestMode,
    pub min_interval_ms: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelMessage {
    IAmADie(IAmADie),
    RollState(RollState),
    Blink(Blink),
    BatteryLevel(BatteryLevel),
    RequestRssi(RequestRssi),
    Rssi(i8),
    /// A message without payload, such as `WhoAreYou`, `BlinkAck` or `Sleep`. Only valid for
    /// types whose [`MessageType::encoded_len`] is 1, other than `None`.
    Bare(MessageType),
}

/// Cursor over a payload whose length has already been checked.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        // skip the tag
        Reader { data, offset: 1 }
    }

    fn u8(&mut self) -> u8 {
        let value = self.data[self.offset];
        self.offset += 1;
        value
    }

    fn u16(&mut self) -> u16 {
        let value = u16::from_le_bytes([self.data[self.offset], self.data[self.offset + 1]]);
        self.offset += 2;
        value
    }

    fn u32(&mut self) -> u32 {
        let bytes = &self.data[self.offset..self.offset + 4];
        self.offset += 4;
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl PixelMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PixelMessage::IAmADie(_) => MessageType::IAmADie,
            PixelMessage::RollState(_) => MessageType::RollState,
            PixelMessage::Blink(_) => MessageType::Blink,
            PixelMessage::BatteryLevel(_) => MessageType::BatteryLevel,
            PixelMessage::RequestRssi(_) => MessageType::RequestRssi,
            PixelMessage::Rssi(_) => MessageType::Rssi,
            PixelMessage::Bare(message_type) => *message_type,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let message_type = self.message_type();
        let mut out = Vec::with_capacity(message_type.encoded_len());
        out.push(message_type as u8);

        match self {
            PixelMessage::IAmADie(m) => {
                out.push(m.led_count);
                out.push(m.design_and_color.to_byte());
                out.push(0); // padding
                out.extend_from_slice(&m.data_set_hash.to_le_bytes());
                out.extend_from_slice(&m.pixel_id.to_le_bytes());
                out.extend_from_slice(&m.available_flash.to_le_bytes());
                out.extend_from_slice(&m.build_timestamp.to_le_bytes());
                out.push(m.roll_state as u8);
                out.push(m.current_face_index);
                out.push(m.battery_level_percent);
                out.push(m.battery_state as u8);
            },
            PixelMessage::RollState(m) => {
                out.push(m.state as u8);
                out.push(m.face_index);
            },
            PixelMessage::Blink(m) => {
                out.push(m.count);
                out.extend_from_slice(&m.duration_ms.to_le_bytes());
                out.extend_from_slice(&m.color.to_le_bytes());
                out.extend_from_slice(&m.face_mask.to_le_bytes());
                out.push(m.fade);
                out.push(m.loop_count);
            },
            PixelMessage::BatteryLevel(m) => {
                out.push(m.level_percent);
                out.push(m.state as u8);
            },
            PixelMessage::RequestRssi(m) => {
                out.push(m.request_mode as u8);
                out.extend_from_slice(&m.min_interval_ms.to_le_bytes());
            },
            PixelMessage::Rssi(value) => out.push(*value as u8),
            PixelMessage::Bare(_) => {},
        }

        out
    }

    pub fn decode(data: &[u8]) -> Result<PixelMessage, DecodeError> {
        let tag = *data.first().ok_or(DecodeError::Empty)?;
        let message_type = MessageType::try_from(tag)?;
        if message_type == MessageType::None {
            return Err(DecodeError::UnknownMessageType(tag));
        }

        let expected = message_type.encoded_len();
        if data.len() != expected {
            return Err(DecodeError::InvalidLength {
                what: "message",
                expected,
                actual: data.len(),
            });
        }

        let mut reader = Reader::new(data);
        let message = match message_type {
            MessageType::IAmADie => {
                let led_count = reader.u8();
                let design_and_color = PixelDesignAndColor::from_byte(reader.u8());
                reader.u8(); // padding
                PixelMessage::IAmADie(IAmADie {
                    led_count,
                    design_and_color,
                    data_set_hash: reader.u32(),
                    pixel_id: reader.u32(),
                    available_flash: reader.u16(),
                    build_timestamp: reader.u32(),
                    roll_state: PixelRollState::try_from(reader.u8())?,
                    current_face_index: reader.u8(),
                    battery_level_percent: reader.u8(),
                    battery_state: PixelBatteryState::try_from(reader.u8())?,
                })
            },
            MessageType::RollState => PixelMessage::RollState(RollState {
                state: PixelRollState::try_from(reader.u8())?,
                face_index: reader.u8(),
            }),
            MessageType::Blink => PixelMessage::Blink(Blink {
                count: reader.u8(),
                duration_ms: reader.u16(),
                color: reader.u32(),
                face_mask: reader.u32(),
                fade: reader.u8(),
                loop_count: reader.u8(),
            }),
            MessageType::BatteryLevel => PixelMessage::BatteryLevel(BatteryLevel {
                level_percent: reader.u8(),
                state: PixelBatteryState::try_from(reader.u8())?,
            }),
            MessageType::RequestRssi => PixelMessage::RequestRssi(RequestRssi {
                request_mode: TelemetryRequestMode::try_from(reader.u8())?,
                min_interval_ms: reader.u16(),
            }),
            MessageType::Rssi => PixelMessage::Rssi(reader.u8() as i8),
            message_type => PixelMessage::Bare(message_type),
        };

        Ok(message)
    }
}
