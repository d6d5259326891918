//! Rendering of one decoded value to text.
//!
//! The renderer is driven by the value's cooked input type plus its output hint and reports
//! how the produced text has to be embedded in JSON:
//!
//! | kind                | examples                                        | JSON form          |
//! |---------------------|-------------------------------------------------|--------------------|
//! | `Literal`           | `true`, `-5`, `1.5`                             | unquoted           |
//! | `CleanString`       | `0x1F`, GUIDs, IP addresses, timestamps, SIDs   | quoted             |
//! | `EscapableString`   | strings from the payload, mapped values         | quoted and escaped |

use std::fmt::Write;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use encoding::{DecoderTrap, EncodingRef};
use log::debug;

use crate::callbacks::{EnumeratorCallbacks, ResultCodeDomain, UnderlyingType};
use crate::err::{EtwError, Result};
use crate::guid::Guid;
use crate::model::{InType, MapInfo, OutType};
use crate::printf::format_general;
use crate::settings::{EnumeratorSettings, TimestampFlags, TimestampFormat, TimestampKind};
use crate::utils::bytes::utf16_lossy;
use crate::utils::{SystemTime, filetime_to_systemtime, systemtime_to_filetime};

const AF_INET: u16 = 2;
const AF_INET6: u16 = 23;
const AF_LINK: u16 = 33;

/// How rendered text must be embedded in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `true`, `false`, or a finite number.
    Literal,
    /// Text that never contains characters needing escapes.
    CleanString,
    /// Arbitrary text.
    EscapableString,
}

fn size_mismatch() -> EtwError {
    EtwError::InvalidParameter {
        what: "value size does not match its type",
    }
}

/// Adds `bias_minutes` to a FILETIME, clamping to `0..=i64::MAX`.
pub fn adjust_file_time(file_time: i64, bias_minutes: i32) -> i64 {
    match file_time.checked_add(i64::from(bias_minutes) * 600_000_000) {
        Some(adjusted) if adjusted >= 0 => adjusted,
        Some(_) => 0,
        None if bias_minutes > 0 => i64::MAX,
        None => 0,
    }
}

/// Decodes 8-bit text. XML, JSON and UTF8 hints mean UTF-8, anything else the ANSI codec.
pub(crate) fn decode_ansi(codec: EncodingRef, out_type: OutType, bytes: &[u8]) -> String {
    match out_type {
        OutType::XML | OutType::JSON | OutType::UTF8 => String::from_utf8_lossy(bytes).into_owned(),
        _ => match codec.decode(bytes, DecoderTrap::Replace) {
            Ok(s) => s,
            Err(_) => String::from_utf8_lossy(bytes).into_owned(),
        },
    }
}

pub(crate) fn append_hex_dump(out: &mut String, data: &[u8]) {
    out.reserve(2 + data.len() * 2);
    out.push_str("0x");
    out.push_str(&hex::encode_upper(data));
}

pub(crate) fn append_ipv4(out: &mut String, b: &[u8; 4]) {
    let _ = write!(out, "{}.{}.{}.{}", b[0], b[1], b[2], b[3]);
}

pub(crate) fn append_ipv6(out: &mut String, b: &[u8; 16]) {
    let word = |i: usize| BigEndian::read_u16(&b[i * 2..i * 2 + 2]);
    let tail = [b[12], b[13], b[14], b[15]];

    if b[..8].iter().all(|&x| x == 0) {
        if b[8..].iter().all(|&x| x == 0) {
            out.push_str("::");
            return;
        }
        if b[12] != 0 || b[13] != 0 {
            let prefix = match [b[8], b[9], b[10], b[11]] {
                [0, 0, 0, 0] => Some("::"),
                [0, 0, 0xff, 0xff] => Some("::ffff:"),
                [0xff, 0xff, 0, 0] => Some("::ffff:0:"),
                _ => None,
            };
            if let Some(prefix) = prefix {
                out.push_str(prefix);
                append_ipv4(out, &tail);
                return;
            }
        }
    }

    // ISATAP: middle 0000:5EFE or 0200:5EFE keeps the last 4 bytes as dotted quad.
    let end_hex = if b[8] & 0xfd == 0 && b[9] == 0 && b[10] == 0x5e && b[11] == 0xfe {
        6
    } else {
        8
    };

    // Longest run of zero words. A run must be at least 2 long to be compressed.
    let (mut max_first, mut max_len) = (end_hex, 1);
    let (mut cur_first, mut cur_len) = (0, 0);
    for i in 0..end_hex {
        if word(i) == 0 {
            cur_len += 1;
            if cur_len > max_len {
                max_first = cur_first;
                max_len = cur_len;
            }
        } else {
            cur_first = i + 1;
            cur_len = 0;
        }
    }

    for i in 0..max_first {
        if i != 0 {
            out.push(':');
        }
        let _ = write!(out, "{:x}", word(i));
    }

    if max_first + max_len < end_hex {
        for i in max_first + max_len..end_hex {
            out.push_str(if i == max_first + max_len { "::" } else { ":" });
            let _ = write!(out, "{:x}", word(i));
        }
    } else if max_first != end_hex {
        out.push_str("::");
    }

    if end_hex == 6 {
        out.push(':');
        append_ipv4(out, &tail);
    }
}

pub(crate) fn append_sockaddr(out: &mut String, data: &[u8]) {
    if data.len() >= 2 {
        match LittleEndian::read_u16(&data[..2]) {
            AF_INET if data.len() >= 8 => {
                let port = BigEndian::read_u16(&data[2..4]);
                append_ipv4(out, &[data[4], data[5], data[6], data[7]]);
                if port != 0 {
                    let _ = write!(out, ":{}", port);
                }
                return;
            }
            AF_INET6 if data.len() >= 24 => {
                let port = BigEndian::read_u16(&data[2..4]);
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&data[8..24]);

                if port != 0 {
                    out.push('[');
                }
                append_ipv6(out, &addr);
                if data.len() >= 28 {
                    let scope = LittleEndian::read_u32(&data[24..28]);
                    if scope != 0 {
                        let _ = write!(out, "%{}", scope);
                    }
                }
                if port != 0 {
                    let _ = write!(out, "]:{}", port);
                }
                return;
            }
            AF_LINK if data.len() >= 10 => {
                let mac = &data[2..8];
                let _ = write!(
                    out,
                    "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
                    mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                );
                return;
            }
            _ => {}
        }
    }

    append_hex_dump(out, data);
}

/// `S-1-5-21-...`, or a hex dump if the bytes are not a well-formed revision 1 SID.
pub(crate) fn append_sid(out: &mut String, data: &[u8]) -> Result<()> {
    if data.len() < 8 {
        return Err(size_mismatch());
    }

    let sub_authority_count = usize::from(data[1]);
    if data[0] != 1 || data.len() != 8 + 4 * sub_authority_count {
        append_hex_dump(out, data);
        return Ok(());
    }

    let high = BigEndian::read_u16(&data[2..4]);
    let low = BigEndian::read_u32(&data[4..8]);
    if high != 0 {
        let _ = write!(out, "S-1-0x{:X}", (u64::from(high) << 32) | u64::from(low));
    } else {
        let _ = write!(out, "S-1-{}", low);
    }

    for sub_authority in data[8..].chunks_exact(4) {
        let _ = write!(out, "-{}", LittleEndian::read_u32(sub_authority));
    }
    Ok(())
}

fn append_adjusted_system_time(
    out: &mut String,
    st: &SystemTime,
    format: TimestampFormat,
    bias_minutes: i32,
    subseconds: u32,
    subsecond_digits: usize,
) {
    let _ = match format.kind {
        TimestampKind::Wpp => write!(
            out,
            "{:02}/{:02}/{:04}-{:02}:{:02}:{:02}.{:0width$}",
            st.month,
            st.day,
            st.year,
            st.hour,
            st.minute,
            st.second,
            subseconds,
            width = subsecond_digits
        ),
        TimestampKind::Internet => write!(
            out,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:0width$}",
            st.year,
            st.month,
            st.day,
            st.hour,
            st.minute,
            st.second,
            subseconds,
            width = subsecond_digits
        ),
    };

    if format.contains(TimestampFlags::NO_TIME_ZONE_SUFFIX) {
        return;
    }

    if format.contains(TimestampFlags::LOCAL) {
        let sign = if bias_minutes < 0 { '-' } else { '+' };
        let abs = bias_minutes.unsigned_abs();
        let _ = write!(out, "{}{:02}:{:02}", sign, abs / 60, abs % 60);
    } else {
        out.push('Z');
    }
}

/// Appends a FILETIME. Times of unknown zone are never converted and never get a suffix.
pub(crate) fn append_file_time(
    out: &mut String,
    file_time: u64,
    format: TimestampFormat,
    bias_minutes: i32,
    is_utc: bool,
) {
    let mut format = format;
    let adjusted = if !is_utc {
        format = format.with_flags(TimestampFlags::NO_TIME_ZONE_SUFFIX);
        file_time
    } else if format.contains(TimestampFlags::LOCAL) {
        adjust_file_time(file_time as i64, bias_minutes) as u64
    } else {
        file_time
    };

    let st = filetime_to_systemtime(adjusted);
    let (subseconds, digits) = if format.contains(TimestampFlags::LOW_PRECISION) {
        (u32::from(st.milliseconds), 3)
    } else {
        ((adjusted % 10_000_000) as u32, 7)
    };

    append_adjusted_system_time(out, &st, format, bias_minutes, subseconds, digits);
}

pub(crate) fn append_system_time(
    out: &mut String,
    st: SystemTime,
    format: TimestampFormat,
    bias_minutes: i32,
    is_utc: bool,
) {
    let mut format = format;
    let adjusted = if !is_utc {
        format = format.with_flags(TimestampFlags::NO_TIME_ZONE_SUFFIX);
        st
    } else if format.contains(TimestampFlags::LOCAL) {
        let file_time = systemtime_to_filetime(&st).unwrap_or(0);
        filetime_to_systemtime(adjust_file_time(file_time as i64, bias_minutes) as u64)
    } else {
        st
    };

    append_adjusted_system_time(
        out,
        &adjusted,
        format,
        bias_minutes,
        u32::from(adjusted.milliseconds),
        3,
    );
}

/// Renders values using the configured timestamp format, zone, and ANSI codec, calling out
/// to `callbacks` for result codes and maps.
pub(crate) struct ValueRenderer<'r, C: ?Sized> {
    callbacks: &'r C,
    settings: &'r EnumeratorSettings,
}

impl<'r, C: EnumeratorCallbacks + ?Sized> ValueRenderer<'r, C> {
    pub(crate) fn new(callbacks: &'r C, settings: &'r EnumeratorSettings) -> Self {
        ValueRenderer {
            callbacks,
            settings,
        }
    }

    /// Appends a result-code description. `Ok(false)` means the callback reported
    /// `NotFound` and nothing was appended.
    fn result_code(
        &self,
        out: &mut String,
        domain: ResultCodeDomain,
        value_type: UnderlyingType,
        value: u32,
    ) -> Result<bool> {
        let start = out.len();
        match self
            .callbacks
            .format_result_code_value(domain, value_type, value, out)
        {
            Ok(()) => Ok(true),
            Err(EtwError::NotFound) => {
                debug!("no description for {:?} code 0x{:X}", domain, value);
                out.truncate(start);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn render(
        &self,
        out: &mut String,
        data: &[u8],
        in_type: InType,
        out_type: OutType,
    ) -> Result<ValueKind> {
        let len = data.len();
        let exact = |n: usize| if len == n { Ok(()) } else { Err(size_mismatch()) };

        let kind = match in_type {
            InType::NULL => ValueKind::CleanString,

            InType::UNICODESTRING
            | InType::MANIFEST_COUNTEDSTRING
            | InType::COUNTEDSTRING
            | InType::REVERSEDCOUNTEDSTRING
            | InType::NONNULLTERMINATEDSTRING
            | InType::UNICODECHAR => {
                out.push_str(&utf16_lossy(data));
                ValueKind::EscapableString
            }

            InType::ANSISTRING
            | InType::MANIFEST_COUNTEDANSISTRING
            | InType::COUNTEDANSISTRING
            | InType::REVERSEDCOUNTEDANSISTRING
            | InType::NONNULLTERMINATEDANSISTRING
            | InType::ANSICHAR => {
                out.push_str(&decode_ansi(self.settings.get_ansi_codec(), out_type, data));
                ValueKind::EscapableString
            }

            InType::INT8 => {
                exact(1)?;
                if out_type == OutType::STRING {
                    out.push_str(&decode_ansi(self.settings.get_ansi_codec(), out_type, data));
                    ValueKind::EscapableString
                } else {
                    let _ = write!(out, "{}", data[0] as i8);
                    ValueKind::Literal
                }
            }

            InType::UINT8 => {
                exact(1)?;
                match out_type {
                    OutType::HEXINT8 => {
                        let _ = write!(out, "0x{:X}", data[0]);
                        ValueKind::CleanString
                    }
                    OutType::STRING => {
                        out.push_str(&decode_ansi(self.settings.get_ansi_codec(), out_type, data));
                        ValueKind::EscapableString
                    }
                    _ => {
                        let _ = write!(out, "{}", data[0]);
                        ValueKind::Literal
                    }
                }
            }

            InType::INT16 => {
                exact(2)?;
                let _ = write!(out, "{}", LittleEndian::read_i16(data));
                ValueKind::Literal
            }

            InType::UINT16 => {
                exact(2)?;
                let value = LittleEndian::read_u16(data);
                match out_type {
                    OutType::HEXINT16 => {
                        let _ = write!(out, "0x{:X}", value);
                        ValueKind::CleanString
                    }
                    OutType::PORT => {
                        let _ = write!(out, "{}", value.swap_bytes());
                        ValueKind::Literal
                    }
                    OutType::STRING => {
                        out.push_str(&utf16_lossy(data));
                        ValueKind::EscapableString
                    }
                    _ => {
                        let _ = write!(out, "{}", value);
                        ValueKind::Literal
                    }
                }
            }

            InType::INT32 => {
                exact(4)?;
                let value = LittleEndian::read_i32(data);
                if out_type == OutType::HRESULT
                    && self.result_code(
                        out,
                        ResultCodeDomain::HResult,
                        UnderlyingType::Hexadecimal,
                        value as u32,
                    )?
                {
                    ValueKind::EscapableString
                } else {
                    let _ = write!(out, "{}", value);
                    ValueKind::Literal
                }
            }

            InType::UINT32 => {
                exact(4)?;
                let value = LittleEndian::read_u32(data);
                let code = match out_type {
                    OutType::WIN32ERROR => {
                        Some((ResultCodeDomain::Win32, UnderlyingType::Unsigned))
                    }
                    OutType::NTSTATUS => {
                        Some((ResultCodeDomain::NtStatus, UnderlyingType::Hexadecimal))
                    }
                    _ => None,
                };

                let described = match code {
                    Some((domain, value_type)) => self.result_code(out, domain, value_type, value)?,
                    None => false,
                };

                match out_type {
                    _ if described => ValueKind::EscapableString,
                    OutType::HEXINT32 | OutType::ERRORCODE | OutType::CODE_POINTER => {
                        let _ = write!(out, "0x{:X}", value);
                        ValueKind::CleanString
                    }
                    OutType::IPV4 => {
                        append_ipv4(out, &value.to_le_bytes());
                        ValueKind::CleanString
                    }
                    _ => {
                        let _ = write!(out, "{}", value);
                        ValueKind::Literal
                    }
                }
            }

            InType::HEXINT32 => {
                exact(4)?;
                let value = LittleEndian::read_u32(data);
                let domain = match out_type {
                    OutType::WIN32ERROR => Some(ResultCodeDomain::Win32),
                    OutType::NTSTATUS => Some(ResultCodeDomain::NtStatus),
                    _ => None,
                };

                let described = match domain {
                    Some(domain) => {
                        self.result_code(out, domain, UnderlyingType::Hexadecimal, value)?
                    }
                    None => false,
                };
                if described {
                    ValueKind::EscapableString
                } else {
                    let _ = write!(out, "0x{:X}", value);
                    ValueKind::CleanString
                }
            }

            InType::INT64 => {
                exact(8)?;
                let _ = write!(out, "{}", LittleEndian::read_i64(data));
                ValueKind::Literal
            }

            InType::UINT64 => {
                exact(8)?;
                let value = LittleEndian::read_u64(data);
                match out_type {
                    OutType::HEXINT64 | OutType::CODE_POINTER => {
                        let _ = write!(out, "0x{:X}", value);
                        ValueKind::CleanString
                    }
                    _ => {
                        let _ = write!(out, "{}", value);
                        ValueKind::Literal
                    }
                }
            }

            InType::HEXINT64 => {
                exact(8)?;
                let _ = write!(out, "0x{:X}", LittleEndian::read_u64(data));
                ValueKind::CleanString
            }

            InType::FLOAT => {
                exact(4)?;
                let bits = LittleEndian::read_u32(data);
                out.push_str(&format_general(f64::from(f32::from_bits(bits))));
                if bits & 0x7f80_0000 == 0x7f80_0000 {
                    ValueKind::CleanString
                } else {
                    ValueKind::Literal
                }
            }

            InType::DOUBLE => {
                exact(8)?;
                let bits = LittleEndian::read_u64(data);
                out.push_str(&format_general(f64::from_bits(bits)));
                if bits & 0x7ff0_0000_0000_0000 == 0x7ff0_0000_0000_0000 {
                    ValueKind::CleanString
                } else {
                    ValueKind::Literal
                }
            }

            InType::BOOLEAN => {
                exact(4)?;
                out.push_str(if LittleEndian::read_i32(data) != 0 {
                    "true"
                } else {
                    "false"
                });
                ValueKind::Literal
            }

            InType::POINTER | InType::SIZET => match (len, out_type) {
                (8, OutType::LONG) => {
                    let _ = write!(out, "{}", LittleEndian::read_i64(data));
                    ValueKind::Literal
                }
                (8, OutType::UNSIGNEDLONG) => {
                    let _ = write!(out, "{}", LittleEndian::read_u64(data));
                    ValueKind::Literal
                }
                (8, _) => {
                    let _ = write!(out, "0x{:X}", LittleEndian::read_u64(data));
                    ValueKind::CleanString
                }
                (4, OutType::LONG) => {
                    let _ = write!(out, "{}", LittleEndian::read_i32(data));
                    ValueKind::Literal
                }
                (4, OutType::UNSIGNEDLONG) => {
                    let _ = write!(out, "{}", LittleEndian::read_u32(data));
                    ValueKind::Literal
                }
                (4, _) => {
                    let _ = write!(out, "0x{:X}", LittleEndian::read_u32(data));
                    ValueKind::CleanString
                }
                _ => return Err(size_mismatch()),
            },

            InType::GUID => {
                exact(16)?;
                let guid = Guid::from_slice(data).ok_or_else(size_mismatch)?;
                out.push_str(&guid.to_braced_lower());
                ValueKind::CleanString
            }

            InType::FILETIME => {
                exact(8)?;
                let format = self.settings.get_timestamp_format();
                let is_utc = out_type == OutType::DATETIME_UTC
                    || format.contains(TimestampFlags::ASSUME_FILETIME_UTC);
                append_file_time(
                    out,
                    LittleEndian::read_u64(data),
                    format,
                    self.settings.get_timezone_bias_minutes(),
                    is_utc,
                );
                ValueKind::CleanString
            }

            InType::SYSTEMTIME => {
                let bytes: &[u8; 16] = data.try_into().map_err(|_| size_mismatch())?;
                append_system_time(
                    out,
                    SystemTime::from_le_bytes(bytes),
                    self.settings.get_timestamp_format(),
                    self.settings.get_timezone_bias_minutes(),
                    out_type == OutType::DATETIME_UTC,
                );
                ValueKind::CleanString
            }

            InType::SID | InType::WBEMSID => {
                append_sid(out, data)?;
                ValueKind::CleanString
            }

            // BINARY, MANIFEST_COUNTEDBINARY, HEXDUMP, and anything unrecognized.
            _ => {
                match out_type {
                    OutType::IPV6 if len == 16 => {
                        let mut addr = [0u8; 16];
                        addr.copy_from_slice(data);
                        append_ipv6(out, &addr);
                    }
                    OutType::SOCKETADDRESS => append_sockaddr(out, data),
                    _ => append_hex_dump(out, data),
                }
                ValueKind::CleanString
            }
        };

        Ok(kind)
    }

    /// Renders a small unsigned integer through `map`, falling back to [`render`](Self::render)
    /// when the type is not mappable or the callback reports `NotFound`.
    pub(crate) fn render_with_map(
        &self,
        out: &mut String,
        data: &[u8],
        in_type: InType,
        out_type: OutType,
        map: &MapInfo,
    ) -> Result<ValueKind> {
        let mapped = match (in_type, data.len()) {
            (InType::UINT8, 1) => Some((u32::from(data[0]), out_type == OutType::HEXINT8)),
            (InType::UINT16, 2) => Some((
                u32::from(LittleEndian::read_u16(data)),
                out_type == OutType::HEXINT16,
            )),
            (InType::UINT32, 4) => Some((LittleEndian::read_u32(data), out_type == OutType::HEXINT32)),
            (InType::HEXINT32, 4) => Some((LittleEndian::read_u32(data), true)),
            _ => None,
        };

        if let Some((value, hex)) = mapped {
            let value_type = if hex {
                UnderlyingType::Hexadecimal
            } else {
                UnderlyingType::Unsigned
            };

            let start = out.len();
            match self.callbacks.format_map_value(map, value_type, value, out) {
                Ok(()) => return Ok(ValueKind::EscapableString),
                Err(EtwError::NotFound) => {
                    debug!("map `{}` has no rendering for {}", map.name, value);
                    out.truncate(start);
                }
                Err(e) => return Err(e),
            }
        }

        self.render(out, data, in_type, out_type)
    }
}
