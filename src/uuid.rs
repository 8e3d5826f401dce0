//! Bluetooth 16/32/128-bit UUID canonicalisation.

use std::{fmt, str::FromStr};

use uuid::Uuid;

use crate::{Error, ErrorKind, Result};

const BASE_UUID_HI: u64 = 0x0000_0000_0000_1000;
const BASE_UUID_LO: u64 = 0x8000_0080_5F9B_34FB;

/// A Bluetooth GATT UUID. Short (16/32-bit) forms are transparently
/// canonicalised to their full 128-bit Bluetooth Base UUID form.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct GattUuid(Uuid);

impl GattUuid {
    /// Builds a canonical UUID from a 16-bit short form.
    pub fn from_u16(short: u16) -> Self {
        Self(Uuid::from_fields(short as u32, 0x0000, BASE_UUID_HI as u16, &BASE_UUID_LO.to_be_bytes()))
    }

    /// Builds a canonical UUID from a 32-bit short form.
    pub fn from_u32(short: u32) -> Self {
        Self(Uuid::from_fields(short, 0x0000, BASE_UUID_HI as u16, &BASE_UUID_LO.to_be_bytes()))
    }

    /// Returns the 16-bit short form if this UUID is within the Bluetooth
    /// Base UUID range and its low 16 bits of the top 32-bit field are zero.
    pub fn as_u16(&self) -> Option<u16> {
        let u32_form = self.as_u32()?;
        if u32_form <= 0xFFFF {
            Some(u32_form as u16)
        } else {
            None
        }
    }

    /// Returns the 32-bit short form if this UUID is within the Bluetooth
    /// Base UUID range.
    pub fn as_u32(&self) -> Option<u32> {
        let (d1, d2, d3, d4) = self.0.as_fields();
        if d2 == 0x0000 && d3 == BASE_UUID_HI as u16 && u64::from_be_bytes(*d4) == BASE_UUID_LO {
            Some(d1)
        } else {
            None
        }
    }

    /// Parses `"XXXX"`, `"XXXXXXXX"`, or the full hyphenated 128-bit form.
    pub fn from_str_checked(s: &str) -> Result<Self> {
        let bad = || Error::new(ErrorKind::InvalidUuid, format!("invalid GATT UUID {s:?}"));
        if s.len() == 4 {
            let short = u16::from_str_radix(s, 16).map_err(|_| bad())?;
            return Ok(Self::from_u16(short));
        }
        if s.len() == 8 {
            let short = u32::from_str_radix(s, 16).map_err(|_| bad())?;
            return Ok(Self::from_u32(short));
        }
        Uuid::parse_str(s).map(Self).map_err(|_| bad())
    }

    /// Returns the rendered, uppercase, unbraced 36-character form, e.g.
    /// `0000180F-0000-1000-8000-00805F9B34FB`.
    pub fn to_canonical_string(&self) -> String {
        self.0.as_hyphenated().to_string().to_uppercase()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for GattUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_str_checked(s)
    }
}

impl fmt::Display for GattUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_string())
    }
}

impl fmt::Debug for GattUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GattUuid({})", self.to_canonical_string())
    }
}

impl From<Uuid> for GattUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_roundtrips() {
        let u = GattUuid::from_u16(0x180F);
        assert_eq!(u.to_canonical_string(), "0000180F-0000-1000-8000-00805F9B34FB");
        assert_eq!(u.as_u16(), Some(0x180F));
    }

    #[test]
    fn parses_all_three_forms() {
        assert_eq!(GattUuid::from_str_checked("180F").unwrap(), GattUuid::from_u16(0x180F));
        assert_eq!(GattUuid::from_str_checked("0000180F").unwrap(), GattUuid::from_u32(0x180F));
        let full = GattUuid::from_str_checked("0000180F-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(full, GattUuid::from_u16(0x180F));
    }

    #[test]
    fn rejects_garbage() {
        assert!(GattUuid::from_str_checked("").is_err());
        assert!(GattUuid::from_str_checked("zzzz").is_err());
        assert!(GattUuid::from_str_checked("not-a-uuid-at-all-nope").is_err());
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        for s in ["180F", "0000180F", "0000180F-0000-1000-8000-00805F9B34FB"] {
            let once = GattUuid::from_str_checked(s).unwrap();
            let twice = GattUuid::from_str_checked(&once.to_canonical_string()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn custom_128_bit_has_no_short_form() {
        let custom = GattUuid::from_str_checked("12345678-1234-5678-1234-56789abcdef0").unwrap();
        assert_eq!(custom.as_u16(), None);
        assert_eq!(custom.as_u32(), None);
    }
}
