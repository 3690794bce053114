//! Parsing and building of the AD structures carried by an advertisement packet.
//!
//! Each AD structure is `[length, type, data...]` where `length` counts the type byte and the data.

use indexmap::IndexMap;
use log::{debug, warn};
use uuid::Uuid;

pub const AD_FLAGS: u8 = 0x01;
pub const AD_INCOMPLETE_SERVICES_16: u8 = 0x02;
pub const AD_COMPLETE_SERVICES_16: u8 = 0x03;
pub const AD_INCOMPLETE_SERVICES_32: u8 = 0x04;
pub const AD_COMPLETE_SERVICES_32: u8 = 0x05;
pub const AD_INCOMPLETE_SERVICES_128: u8 = 0x06;
pub const AD_COMPLETE_SERVICES_128: u8 = 0x07;
pub const AD_SHORT_LOCAL_NAME: u8 = 0x08;
pub const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TX_POWER_LEVEL: u8 = 0x0A;
pub const AD_SERVICE_DATA_16: u8 = 0x16;
pub const AD_SERVICE_DATA_32: u8 = 0x20;
pub const AD_SERVICE_DATA_128: u8 = 0x21;
pub const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// The length byte also counts the type byte.
const MAX_STRUCTURE_VALUE: usize = u8::MAX as usize - 1;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BASE_UUID_MASK: u128 = (1 << 96) - 1;

/// Expands a 16 or 32 bit assigned number into a full UUID.
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_UUID_MASK != BLUETOOTH_BASE_UUID {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

fn uuid_from_le(bytes: &[u8]) -> Option<Uuid> {
    let mut bytes: [u8; 16] = bytes.try_into().ok()?;
    bytes.reverse();
    Some(Uuid::from_bytes(bytes))
}

fn uuid_to_le(uuid: &Uuid) -> [u8; 16] {
    let mut bytes = *uuid.as_bytes();
    bytes.reverse();
    bytes
}

/// Snapshot of a single advertisement packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub tx_power: Option<i8>,
    /// Keyed by company identifier, in the order they were advertised.
    pub manufacturer_data: IndexMap<u16, Vec<u8>>,
    pub service_data: IndexMap<Uuid, Vec<u8>>,
}

impl AdvertisementData {
    /// Parses AD structures. Unknown types are skipped and a truncated trailing structure is
    /// dropped, so this never fails.
    pub fn parse(payload: &[u8]) -> Self {
        let mut data = AdvertisementData::default();
        let mut offset = 0;

        while offset < payload.len() {
            let len = payload[offset] as usize;
            if len == 0 {
                // early terminator / zero padding
                break;
            }
            if offset + len >= payload.len() {
                warn!(
                    "Dropping truncated AD structure at offset {} (length {}, {} bytes left)",
                    offset, len, payload.len() - offset - 1
                );
                break;
            }

            let ad_type = payload[offset + 1];
            let value = &payload[offset + 2..offset + 1 + len];
            data.apply(ad_type, value);
            offset += len + 1;
        }

        data
    }

    fn apply(&mut self, ad_type: u8, value: &[u8]) {
        match ad_type {
            AD_FLAGS => self.flags = value.first().copied(),
            AD_INCOMPLETE_SERVICES_16 | AD_COMPLETE_SERVICES_16 => {
                for chunk in value.chunks_exact(2) {
                    self.push_service(uuid_from_short(u16::from_le_bytes([chunk[0], chunk[1]]) as u32));
                }
            },
            AD_INCOMPLETE_SERVICES_32 | AD_COMPLETE_SERVICES_32 => {
                for chunk in value.chunks_exact(4) {
                    self.push_service(uuid_from_short(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])));
                }
            },
            AD_INCOMPLETE_SERVICES_128 | AD_COMPLETE_SERVICES_128 => {
                for chunk in value.chunks_exact(16) {
                    if let Some(uuid) = uuid_from_le(chunk) {
                        self.push_service(uuid);
                    }
                }
            },
            AD_SHORT_LOCAL_NAME => {
                // a complete name always wins over a shortened one
                if self.local_name.is_none() {
                    self.local_name = Some(String::from_utf8_lossy(value).into_owned());
                }
            },
            AD_COMPLETE_LOCAL_NAME => {
                self.local_name = Some(String::from_utf8_lossy(value).into_owned());
            },
            AD_TX_POWER_LEVEL => self.tx_power = value.first().map(|v| *v as i8),
            AD_SERVICE_DATA_16 if value.len() >= 2 => {
                let uuid = uuid_from_short(u16::from_le_bytes([value[0], value[1]]) as u32);
                self.service_data.insert(uuid, value[2..].to_vec());
            },
            AD_SERVICE_DATA_32 if value.len() >= 4 => {
                let uuid = uuid_from_short(u32::from_le_bytes([value[0], value[1], value[2], value[3]]));
                self.service_data.insert(uuid, value[4..].to_vec());
            },
            AD_SERVICE_DATA_128 if value.len() >= 16 => {
                if let Some(uuid) = uuid_from_le(&value[..16]) {
                    self.service_data.insert(uuid, value[16..].to_vec());
                }
            },
            AD_MANUFACTURER_DATA if value.len() >= 2 => {
                let company_id = u16::from_le_bytes([value[0], value[1]]);
                self.manufacturer_data.insert(company_id, value[2..].to_vec());
            },
            _ => debug!("Skipping AD structure type {:#04x} ({} bytes)", ad_type, value.len()),
        }
    }

    fn push_service(&mut self, uuid: Uuid) {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
    }

    /// Builds AD structures: flags, name, tx power, services, service data, manufacturer data.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        if let Some(flags) = self.flags {
            push_structure(&mut out, AD_FLAGS, &[flags]);
        }
        if let Some(name) = &self.local_name {
            if name.len() <= MAX_STRUCTURE_VALUE {
                push_structure(&mut out, AD_COMPLETE_LOCAL_NAME, name.as_bytes());
            } else {
                let mut end = MAX_STRUCTURE_VALUE;
                while !name.is_char_boundary(end) {
                    end -= 1;
                }
                warn!("Local name of {} bytes does not fit, sending it shortened", name.len());
                push_structure(&mut out, AD_SHORT_LOCAL_NAME, &name.as_bytes()[..end]);
            }
        }
        if let Some(tx_power) = self.tx_power {
            push_structure(&mut out, AD_TX_POWER_LEVEL, &[tx_power as u8]);
        }

        let mut short_services = Vec::new();
        let mut long_services = Vec::new();
        for uuid in &self.services {
            match short_uuid(uuid) {
                Some(short) => short_services.extend_from_slice(&short.to_le_bytes()),
                None => long_services.extend_from_slice(&uuid_to_le(uuid)),
            }
        }
        push_list(&mut out, AD_COMPLETE_SERVICES_16, &short_services, 2);
        push_list(&mut out, AD_COMPLETE_SERVICES_128, &long_services, 16);

        for (uuid, value) in &self.service_data {
            let mut element = Vec::with_capacity(16 + value.len());
            let ad_type = match short_uuid(uuid) {
                Some(short) => {
                    element.extend_from_slice(&short.to_le_bytes());
                    AD_SERVICE_DATA_16
                },
                None => {
                    element.extend_from_slice(&uuid_to_le(uuid));
                    AD_SERVICE_DATA_128
                },
            };
            element.extend_from_slice(value);
            push_structure(&mut out, ad_type, &element);
        }

        for (company_id, value) in &self.manufacturer_data {
            let mut element = Vec::with_capacity(2 + value.len());
            element.extend_from_slice(&company_id.to_le_bytes());
            element.extend_from_slice(value);
            push_structure(&mut out, AD_MANUFACTURER_DATA, &element);
        }

        out
    }

    /// Manufacturer data of the first advertised company, without the company identifier.
    pub fn first_manufacturer_data(&self) -> Option<(u16, &[u8])> {
        self.manufacturer_data.first().map(|(id, data)| (*id, data.as_slice()))
    }

    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid) || self.service_data.contains_key(uuid)
    }
}

/// Splits a list of fixed size items over as many structures as needed; `parse` merges them.
fn push_list(out: &mut Vec<u8>, ad_type: u8, items: &[u8], item_len: usize) {
    let per_structure = MAX_STRUCTURE_VALUE / item_len * item_len;
    for chunk in items.chunks(per_structure) {
        push_structure(out, ad_type, chunk);
    }
}

fn push_structure(out: &mut Vec<u8>, ad_type: u8, value: &[u8]) {
    let value = if value.len() > MAX_STRUCTURE_VALUE {
        warn!("AD structure {:#04x} truncated from {} to {} bytes", ad_type, value.len(), MAX_STRUCTURE_VALUE);
        &value[..MAX_STRUCTURE_VALUE]
    } else {
        value
    };
    out.push(value.len() as u8 + 1);
    out.push(ad_type);
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIXELS_SERVICE: Uuid = Uuid::from_u128(0xa6b90001_7a5a_43f2_a962_350c8edc9b5b);

    #[test]
    fn parses_typical_pixel_advertisement() {
        let mut payload = vec![0x02, AD_FLAGS, 0x06];
        payload.extend_from_slice(&[0x11, AD_COMPLETE_SERVICES_128]);
        payload.extend_from_slice(&uuid_to_le(&PIXELS_SERVICE));
        payload.extend_from_slice(&[0x08, AD_MANUFACTURER_DATA, 0x34, 0x12, 20, 7, 1, 3, 0x55]);
        payload.extend_from_slice(&[0x06, AD_COMPLETE_LOCAL_NAME, b'P', b'i', b'x', b'e', b'l']);

        let data = AdvertisementData::parse(&payload);
        assert_eq!(data.flags, Some(0x06));
        assert_eq!(data.services, vec![PIXELS_SERVICE]);
        assert_eq!(data.local_name.as_deref(), Some("Pixel"));
        assert_eq!(data.first_manufacturer_data(), Some((0x1234, &[20u8, 7, 1, 3, 0x55][..])));
    }

    #[test]
    fn parses_short_uuids_and_service_data() {
        let payload = [
            0x05, AD_COMPLETE_SERVICES_16, 0x0F, 0x18, 0x0A, 0x18,
            0x05, AD_SERVICE_DATA_16, 0x0F, 0x18, 0x64, 0x01,
            0x02, AD_TX_POWER_LEVEL, 0xF6,
        ];

        let data = AdvertisementData::parse(&payload);
        let battery = uuid_from_short(0x180F);
        assert_eq!(battery.to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
        assert_eq!(data.services, vec![battery, uuid_from_short(0x180A)]);
        assert_eq!(data.service_data.get(&battery), Some(&vec![0x64, 0x01]));
        assert_eq!(data.tx_power, Some(-10));
    }

    #[test]
    fn truncated_structure_keeps_preceding_fields() {
        let payload = [0x03, AD_COMPLETE_LOCAL_NAME, b'D', b'6', 0x09, AD_MANUFACTURER_DATA, 0x01];
        let data = AdvertisementData::parse(&payload);
        assert_eq!(data.local_name.as_deref(), Some("D6"));
        assert!(data.manufacturer_data.is_empty());
    }

    #[test]
    fn zero_padding_terminates() {
        let payload = [0x02, AD_FLAGS, 0x04, 0x00, 0x00, 0x00];
        let data = AdvertisementData::parse(&payload);
        assert_eq!(data.flags, Some(0x04));
    }

    #[test]
    fn encode_is_understood_by_parse() {
        let mut data = AdvertisementData {
            flags: Some(0x06),
            local_name: Some("Green Bean".to_string()),
            services: vec![PIXELS_SERVICE, uuid_from_short(0x180F)],
            tx_power: Some(4),
            ..Default::default()
        };
        data.manufacturer_data.insert(0xFFFF, vec![20, 7, 1, 19, 0x80 | 42]);
        data.service_data.insert(PIXELS_SERVICE, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let parsed = AdvertisementData::parse(&data.encode());
        assert_eq!(parsed.flags, data.flags);
        assert_eq!(parsed.local_name, data.local_name);
        assert_eq!(parsed.tx_power, data.tx_power);
        assert_eq!(parsed.manufacturer_data, data.manufacturer_data);
        assert_eq!(parsed.service_data, data.service_data);
        // 16 bit services are grouped before 128 bit ones
        assert_eq!(parsed.services, vec![uuid_from_short(0x180F), PIXELS_SERVICE]);
        assert!(parsed.has_service(&PIXELS_SERVICE));
    }

    #[test]
    fn long_values_survive_encoding() {
        let services: Vec<Uuid> = (1..=20u128).map(|n| Uuid::from_u128(n << 64 | 0xABCD)).collect();
        let name = "é".repeat(130);
        let data = AdvertisementData {
            local_name: Some(name.clone()),
            services: services.clone(),
            ..Default::default()
        };

        let parsed = AdvertisementData::parse(&data.encode());
        assert_eq!(parsed.services, services);
        // shortened on a character boundary
        let shortened = parsed.local_name.unwrap();
        assert_eq!(shortened.len(), 254);
        assert!(name.starts_with(&shortened));
    }
}
