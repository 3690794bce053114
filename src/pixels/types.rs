use std::fmt;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DieType {
    D20,
    D12,
    D10,
    D8,
    D6,
    D6Pipped,
    D6Fudge,
    D4,
}

impl DieType {
    /// Die type advertised through the LED count. Firmware that does not report a count (0) is a D20.
    pub fn from_led_count(led_count: u8) -> Option<DieType> {
        match led_count {
            0 | 20 => Some(DieType::D20),
            4 => Some(DieType::D4),
            6 => Some(DieType::D6),
            8 => Some(DieType::D8),
            10 => Some(DieType::D10),
            12 => Some(DieType::D12),
            21 => Some(DieType::D6Pipped),
            _ => None,
        }
    }

    pub fn face_count(self) -> u8 {
        match self {
            DieType::D20 => 20,
            DieType::D12 => 12,
            DieType::D10 => 10,
            DieType::D8 => 8,
            DieType::D6 | DieType::D6Pipped | DieType::D6Fudge => 6,
            DieType::D4 => 4,
        }
    }
}

impl fmt::Display for DieType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelDesignAndColor {
    Unknown,
    Generic,
    V3Orange,
    V4BlackClear,
    V4WhiteClear,
    V5Grey,
    V5White,
    V5Black,
    V5Gold,
    OnyxBlack,
    HematiteGrey,
    MidnightGalaxy,
    AuroraSky,
}

impl PixelDesignAndColor {
    /// Designs added by newer firmware map to `Unknown` rather than failing the decode.
    pub fn from_byte(value: u8) -> Self {
        match value {
            1 => PixelDesignAndColor::Generic,
            2 => PixelDesignAndColor::V3Orange,
            3 => PixelDesignAndColor::V4BlackClear,
            4 => PixelDesignAndColor::V4WhiteClear,
            5 => PixelDesignAndColor::V5Grey,
            6 => PixelDesignAndColor::V5White,
            7 => PixelDesignAndColor::V5Black,
            8 => PixelDesignAndColor::V5Gold,
            9 => PixelDesignAndColor::OnyxBlack,
            10 => PixelDesignAndColor::HematiteGrey,
            11 => PixelDesignAndColor::MidnightGalaxy,
            12 => PixelDesignAndColor::AuroraSky,
            _ => PixelDesignAndColor::Unknown,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelRollState {
    Unknown,
    OnFace,
    Handling,
    Rolling,
    Crooked,
}

impl TryFrom<u8> for PixelRollState {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(PixelRollState::Unknown),
            1 => Ok(PixelRollState::OnFace),
            2 => Ok(PixelRollState::Handling),
            3 => Ok(PixelRollState::Rolling),
            4 => Ok(PixelRollState::Crooked),
            value => Err(DecodeError::InvalidValue { field: "rollState", value }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelBatteryState {
    Ok,
    Low,
    Charging,
    Done,
    BadCharging,
    Error,
}

impl PixelBatteryState {
    pub fn is_charging_or_done(self) -> bool {
        matches!(self, PixelBatteryState::Charging | PixelBatteryState::Done)
    }
}

impl TryFrom<u8> for PixelBatteryState {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(PixelBatteryState::Ok),
            1 => Ok(PixelBatteryState::Low),
            2 => Ok(PixelBatteryState::Charging),
            3 => Ok(PixelBatteryState::Done),
            4 => Ok(PixelBatteryState::BadCharging),
            5 => Ok(PixelBatteryState::Error),
            value => Err(DecodeError::InvalidValue { field: "batteryState", value }),
        }
    }
}

/// How the die should report its signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryRequestMode {
    Off,
    Once,
    Automatic,
}

impl TryFrom<u8> for TelemetryRequestMode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(TelemetryRequestMode::Off),
            1 => Ok(TelemetryRequestMode::Once),
            2 => Ok(TelemetryRequestMode::Automatic),
            value => Err(DecodeError::InvalidValue { field: "requestMode", value }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelStatus {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Disconnecting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn led_count_maps_to_die_type() {
        assert_eq!(DieType::from_led_count(20), Some(DieType::D20));
        assert_eq!(DieType::from_led_count(0), Some(DieType::D20));
        assert_eq!(DieType::from_led_count(21), Some(DieType::D6Pipped));
        assert_eq!(DieType::from_led_count(6), Some(DieType::D6));
        assert_eq!(DieType::from_led_count(7), None);
        assert_eq!(DieType::D6Pipped.face_count(), 6);
        assert_eq!(DieType::D10.face_count(), 10);
    }

    #[test]
    fn design_and_color_round_trips_through_byte() {
        for byte in 0..=12u8 {
            assert_eq!(PixelDesignAndColor::from_byte(byte).to_byte(), byte);
        }
        assert_eq!(PixelDesignAndColor::from_byte(200), PixelDesignAndColor::Unknown);
    }

    #[test]
    fn out_of_range_states_are_decode_errors() {
        assert_eq!(PixelRollState::try_from(1), Ok(PixelRollState::OnFace));
        assert_eq!(
            PixelRollState::try_from(9),
            Err(DecodeError::InvalidValue { field: "rollState", value: 9 })
        );
        assert!(PixelBatteryState::try_from(6).is_err());
        assert!(TelemetryRequestMode::try_from(3).is_err());
    }
}
