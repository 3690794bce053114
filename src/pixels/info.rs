use std::time::{Duration, SystemTime, UNIX_EPOCH};
use serde::Serialize;

use crate::ble::scanner::ScannedPeripheral;
use crate::ble::types::PeripheralId;
use crate::error::DecodeError;
use crate::pixels::constants::{BATTERY_CHARGING_BIT, MANUFACTURER_DATA_LEN, PIXELS_SERVICE, SERVICE_DATA_LEN};
use crate::pixels::messages::IAmADie;
use crate::pixels::types::{DieType, PixelBatteryState, PixelDesignAndColor, PixelRollState};

/// Attributes of a die, shared by scan results and live sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedPixelData {
    pub system_id: PeripheralId,
    pub pixel_id: u32,
    pub name: String,
    pub led_count: u8,
    pub design_and_color: PixelDesignAndColor,
    pub roll_state: PixelRollState,
    /// Face that is up, starting at 1.
    pub current_face: u8,
    pub battery_level: u8,
    pub is_charging: bool,
    /// Firmware build time, seconds since the UNIX epoch.
    pub build_timestamp: u32,
    pub rssi: i16,
}

impl ScannedPixelData {
    /// Decodes the Pixel specific parts of an advertisement.
    ///
    /// Manufacturer data: `[led count, design and color, roll state, face index, battery]` where
    /// the battery byte holds the level in its low 7 bits and the charging flag in bit 7.
    /// Service data: `[pixel id: u32, build timestamp: u32]`, little endian.
    pub fn from_advertisement(peripheral: &ScannedPeripheral) -> Result<Self, DecodeError> {
        let advertisement = &peripheral.advertisement;
        let (_, manufacturer) = advertisement
            .first_manufacturer_data()
            .ok_or(DecodeError::MissingManufacturerData)?;

        if manufacturer.len() < MANUFACTURER_DATA_LEN {
            return Err(DecodeError::TooShort {
                what: "manufacturer data",
                expected: MANUFACTURER_DATA_LEN,
                actual: manufacturer.len(),
            });
        }

        let led_count = manufacturer[0];
        if DieType::from_led_count(led_count).is_none() {
            return Err(DecodeError::UnknownDieType(led_count));
        }

        let service = advertisement
            .service_data
            .get(&PIXELS_SERVICE)
            .or_else(|| advertisement.service_data.values().next());
        let (pixel_id, build_timestamp) = match service {
            Some(data) if data.len() >= SERVICE_DATA_LEN => (
                u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            ),
            _ => (0, 0),
        };

        Ok(ScannedPixelData {
            system_id: peripheral.id.clone(),
            pixel_id,
            name: peripheral.name().unwrap_or_default().to_string(),
            led_count,
            design_and_color: PixelDesignAndColor::from_byte(manufacturer[1]),
            roll_state: PixelRollState::try_from(manufacturer[2])?,
            current_face: manufacturer[3].saturating_add(1),
            battery_level: manufacturer[4] & !BATTERY_CHARGING_BIT,
            is_charging: manufacturer[4] & BATTERY_CHARGING_BIT != 0,
            build_timestamp,
            rssi: peripheral.rssi,
        })
    }

    /// Manufacturer data as the firmware advertises it, without the company identifier.
    pub fn manufacturer_payload(&self) -> Vec<u8> {
        let mut battery = self.battery_level.min(100);
        if self.is_charging {
            battery |= BATTERY_CHARGING_BIT;
        }

        vec![
            self.led_count,
            self.design_and_color.to_byte(),
            self.roll_state as u8,
            self.current_face.saturating_sub(1),
            battery,
        ]
    }

    pub fn service_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERVICE_DATA_LEN);
        out.extend_from_slice(&self.pixel_id.to_le_bytes());
        out.extend_from_slice(&self.build_timestamp.to_le_bytes());
        out
    }

    pub(crate) fn apply_identity(&mut self, message: &IAmADie) {
        self.pixel_id = message.pixel_id;
        self.led_count = message.led_count;
        self.design_and_color = message.design_and_color;
        self.build_timestamp = message.build_timestamp;
        self.roll_state = message.roll_state;
        self.current_face = message.current_face_index.saturating_add(1);
        self.battery_level = message.battery_level_percent;
        self.is_charging = message.battery_state.is_charging_or_done();
    }
}

/// Read-only view of a die, implemented by scan results and live sessions alike.
pub trait PixelInfo {
    /// Snapshot of the current attributes.
    fn data(&self) -> ScannedPixelData;

    fn system_id(&self) -> PeripheralId {
        self.data().system_id
    }

    fn pixel_id(&self) -> u32 {
        self.data().pixel_id
    }

    fn name(&self) -> String {
        self.data().name
    }

    fn led_count(&self) -> u8 {
        self.data().led_count
    }

    /// Falls back to `D6Fudge` for LED counts no other die uses.
    fn die_type(&self) -> DieType {
        DieType::from_led_count(self.led_count()).unwrap_or(DieType::D6Fudge)
    }

    fn face_count(&self) -> u8 {
        self.die_type().face_count()
    }

    fn design_and_color(&self) -> PixelDesignAndColor {
        self.data().design_and_color
    }

    fn firmware_date(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.data().build_timestamp as u64)
    }

    fn rssi(&self) -> i16 {
        self.data().rssi
    }

    fn battery_level(&self) -> u8 {
        self.data().battery_level
    }

    fn is_charging(&self) -> bool {
        self.data().is_charging
    }

    /// Advertisements only carry the charging flag, so this is either `Charging` or `Ok`.
    fn battery_state(&self) -> PixelBatteryState {
        if self.is_charging() {
            PixelBatteryState::Charging
        } else {
            PixelBatteryState::Ok
        }
    }

    fn roll_state(&self) -> PixelRollState {
        self.data().roll_state
    }

    fn current_face(&self) -> u8 {
        self.data().current_face
    }
}

/// Immutable snapshot of a die taken from its advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedPixel {
    data: ScannedPixelData,
}

impl ScannedPixel {
    pub fn new(data: ScannedPixelData) -> Self {
        ScannedPixel { data }
    }

    pub fn as_data(&self) -> &ScannedPixelData {
        &self.data
    }
}

impl PixelInfo for ScannedPixel {
    fn data(&self) -> ScannedPixelData {
        self.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertisement::AdvertisementData;

    fn sample() -> ScannedPixelData {
        ScannedPixelData {
            system_id: PeripheralId::new("AA:BB:CC:DD:EE:FF"),
            pixel_id: 0x0BADF00D,
            name: "Green Bean".to_string(),
            led_count: 20,
            design_and_color: PixelDesignAndColor::V5Black,
            roll_state: PixelRollState::OnFace,
            current_face: 20,
            battery_level: 76,
            is_charging: false,
            build_timestamp: 1_650_000_000,
            rssi: -58,
        }
    }

    fn advertise(data: &ScannedPixelData, manufacturer: Vec<u8>) -> ScannedPeripheral {
        let mut advertisement = AdvertisementData {
            local_name: Some(data.name.clone()),
            services: vec![PIXELS_SERVICE],
            ..Default::default()
        };
        advertisement.manufacturer_data.insert(0xFFFF, manufacturer);
        advertisement.service_data.insert(PIXELS_SERVICE, data.service_payload());

        ScannedPeripheral {
            id: data.system_id.clone(),
            advertisement: AdvertisementData::parse(&advertisement.encode()),
            rssi: data.rssi,
            last_seen: SystemTime::now(),
        }
    }

    #[test]
    fn advertisement_round_trip() {
        let data = sample();
        let scanned = ScannedPixel::new(
            ScannedPixelData::from_advertisement(&advertise(&data, data.manufacturer_payload())).unwrap(),
        );

        assert_eq!(scanned.die_type(), DieType::D20);
        assert_eq!(scanned.design_and_color(), PixelDesignAndColor::V5Black);
        assert_eq!(scanned.roll_state(), PixelRollState::OnFace);
        assert_eq!(scanned.battery_state(), PixelBatteryState::Ok);
        assert_eq!(scanned.as_data(), &data);
        assert_eq!(scanned.firmware_date(), UNIX_EPOCH + Duration::from_secs(1_650_000_000));
    }

    #[test]
    fn charging_bit_is_split_from_level() {
        let mut data = sample();
        data.is_charging = true;
        data.battery_level = 42;
        let payload = data.manufacturer_payload();
        assert_eq!(payload[4], 0x80 | 42);

        let decoded = ScannedPixelData::from_advertisement(&advertise(&data, payload)).unwrap();
        assert!(decoded.is_charging);
        assert_eq!(decoded.battery_level, 42);
        assert_eq!(ScannedPixel::new(decoded).battery_state(), PixelBatteryState::Charging);
    }

    #[test]
    fn short_header_is_rejected() {
        let data = sample();
        let err = ScannedPixelData::from_advertisement(&advertise(&data, vec![20, 7, 1, 19])).unwrap_err();
        assert_eq!(err, DecodeError::TooShort { what: "manufacturer data", expected: 5, actual: 4 });
    }

    #[test]
    fn unknown_led_count_is_rejected() {
        let data = sample();
        let err = ScannedPixelData::from_advertisement(&advertise(&data, vec![7, 7, 1, 0, 50])).unwrap_err();
        assert_eq!(err, DecodeError::UnknownDieType(7));
    }

    #[test]
    fn missing_service_data_leaves_identity_empty() {
        let data = sample();
        let mut peripheral = advertise(&data, data.manufacturer_payload());
        peripheral.advertisement.service_data.clear();

        let decoded = ScannedPixelData::from_advertisement(&peripheral).unwrap();
        assert_eq!(decoded.pixel_id, 0);
        assert_eq!(decoded.build_timestamp, 0);
    }
}
