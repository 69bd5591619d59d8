//! Advertising data is a run of `(length, type, value)` records where `length`
//! counts the type byte plus the value.

pub const AD_SERVICES_16_INCOMPLETE: u8 = 0x02;
pub const AD_SERVICES_16_COMPLETE: u8 = 0x03;
pub const AD_NAME_SHORT: u8 = 0x08;
pub const AD_NAME_COMPLETE: u8 = 0x09;
pub const AD_MANUFACTURER: u8 = 0xFF;

/// Fields extracted from one payload. Borrowed straight from the payload bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Advertisement<'a> {
    pub name: Option<&'a str>,
    pub manufacturer: Option<&'a [u8]>,
    pub services: Option<&'a [u8]>,
}

impl<'a> Advertisement<'a> {
    /// Manufacturer payload starts with the little-endian company identifier.
    pub fn has_company_id(&self, company_id: u16) -> bool {
        self.manufacturer
            .is_some_and(|data| data.len() >= 2 && data[..2] == company_id.to_le_bytes())
    }

    pub fn service_ids(&self) -> impl Iterator<Item = u16> + 'a {
        self.services
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Parse until a zero length or the end of the buffer. A record whose declared
/// length runs past the buffer ends parsing; whatever was read so far is kept.
pub fn parse(payload: &[u8]) -> Advertisement<'_> {
    let mut parsed = Advertisement::default();
    let mut i = 0;
    while i < payload.len() {
        let length = payload[i] as usize;
        if length == 0 || i + 1 + length > payload.len() {
            break;
        }
        let ad_type = payload[i + 1];
        let value = &payload[i + 2..i + 1 + length];
        match ad_type {
            AD_NAME_SHORT | AD_NAME_COMPLETE => {
                if let Ok(name) = std::str::from_utf8(value) {
                    parsed.name = Some(name);
                }
            }
            AD_MANUFACTURER => parsed.manufacturer = Some(value),
            AD_SERVICES_16_INCOMPLETE | AD_SERVICES_16_COMPLETE => parsed.services = Some(value),
            _ => {}
        }
        i += 1 + length;
    }
    parsed
}

/// Append one record. Values too long for a single record are dropped.
pub fn push_record(payload: &mut Vec<u8>, ad_type: u8, value: &[u8]) {
    if value.len() > u8::MAX as usize - 1 {
        return;
    }
    payload.push(value.len() as u8 + 1);
    payload.push(ad_type);
    payload.extend_from_slice(value);
}
