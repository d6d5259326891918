use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::err::EtwError;

/// A Windows GUID in its native (mixed-endian) layout.
#[derive(PartialOrd, Ord, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

/// `68fdd900-4a3e-11d1-84f4-0000f80464e3`, the provider of trace header events.
pub const EVENT_TRACE_GUID: Guid = Guid::new(
    0x68fd_d900,
    0x4a3e,
    0x11d1,
    [0x84, 0xf4, 0x00, 0x00, 0xf8, 0x04, 0x64, 0xe3],
);

impl Guid {
    pub const NIL: Guid = Guid::new(0, 0, 0, [0; 8]);

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Guid {
        Guid {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Reads a GUID stored the way Windows lays it out in memory.
    pub fn from_le_bytes(bytes: [u8; 16]) -> Guid {
        let mut data4 = [0; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Guid {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Guid> {
        let bytes: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some(Guid::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }

    pub fn is_nil(&self) -> bool {
        *self == Guid::NIL
    }

    /// `{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}`, the form used for GUID-typed fields.
    pub fn to_braced_lower(&self) -> String {
        format!(
            "{{{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}}}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }

    /// The 32 lowercase hex digits of the in-memory byte sequence, in reversed-field order.
    ///
    /// This is how TraceLogging appends a provider GUID to a generated provider name.
    pub(crate) fn to_name_suffix(&self) -> String {
        let b = self.to_le_bytes();
        let order = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];
        let mut s = String::with_capacity(32);
        for i in order {
            s.push_str(&format!("{:02x}", b[i]));
        }
        s
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Guid {
    type Err = EtwError;

    /// Accepts `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`, optionally wrapped in braces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = EtwError::InvalidParameter { what: "guid string" };
        let s = s.trim();
        let s = s
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(s);

        let parts: Vec<&str> = s.split('-').collect();
        let expected = [8, 4, 4, 4, 12];
        if parts.len() != expected.len()
            || parts.iter().zip(expected).any(|(p, n)| p.len() != n)
        {
            return Err(invalid);
        }

        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| invalid.clone())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| invalid.clone())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| invalid.clone())?;

        let mut tail = [0u8; 8];
        hex::decode_to_slice(format!("{}{}", parts[3], parts[4]), &mut tail)
            .map_err(|_| invalid)?;

        Ok(Guid::new(data1, data2, data3, tail))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
