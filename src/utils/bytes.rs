//! Byte-slice utilities for bounds-oriented payload reads.
//!
//! There are two layers:
//! - **Option layer** (`read_*`): helpers that return `Option<T>`, used where a short read has
//!   a defined fallback (e.g. a counted string whose prefix is cut off).
//! - **Result layer** (`*_r`): wrappers that map `None` to [`EtwError::InvalidData`].
//!
//! Payload integers are little-endian, except for the length prefix of the "reversed"
//! counted string types, which is big-endian.

use crate::err::EtwError;

/// Read `N` raw bytes at `offset`.
pub(crate) fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    buf.get(offset..end)?.try_into().ok()
}

pub(crate) fn read_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(read_array::<2>(buf, offset)?))
}

pub(crate) fn read_u16_be(buf: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes(read_array::<2>(buf, offset)?))
}

pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(read_array::<4>(buf, offset)?))
}

pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(read_array::<8>(buf, offset)?))
}

pub(crate) fn slice_r<'a>(
    buf: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], EtwError> {
    let truncated = || EtwError::truncated(what, offset, len, buf.len().saturating_sub(offset));
    let end = offset.checked_add(len).ok_or_else(truncated)?;
    buf.get(offset..end).ok_or_else(truncated)
}

pub(crate) fn read_u32_le_r(buf: &[u8], offset: usize, what: &'static str) -> Result<u32, EtwError> {
    read_u32_le(buf, offset)
        .ok_or_else(|| EtwError::truncated(what, offset, 4, buf.len().saturating_sub(offset)))
}

/// Number of UTF-16 code units before the first nul in `buf`, or `None` if there is no nul.
pub(crate) fn utf16_nul_position(buf: &[u8]) -> Option<usize> {
    buf.chunks_exact(2).position(|unit| unit == [0, 0])
}

/// Decodes little-endian UTF-16, replacing unpaired surrogates with U+FFFD.
pub(crate) fn utf16_lossy(buf: &[u8]) -> String {
    let units = buf
        .chunks_exact(2)
        .map(|unit| u16::from_le_bytes([unit[0], unit[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Reads a nul-terminated UTF-16 string, or the whole slice if it has no terminator.
pub(crate) fn utf16_until_nul(buf: &[u8]) -> String {
    match utf16_nul_position(buf) {
        Some(units) => utf16_lossy(&buf[..units * 2]),
        None => utf16_lossy(buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_option_layer_is_bounds_checked() {
        let buf = [1u8, 2, 3];
        assert_eq!(read_u16_le(&buf, 1), Some(0x0302));
        assert_eq!(read_u16_be(&buf, 1), Some(0x0203));
        assert_eq!(read_u16_le(&buf, 2), None);
        assert_eq!(read_u32_le(&buf, 0), None);
        assert_eq!(read_u8(&buf, usize::MAX), None);
        assert_eq!(read_array::<2>(&buf, usize::MAX), None);
    }

    #[test]
    fn test_slice_r_reports_truncation() {
        let buf = [0u8; 4];
        assert_eq!(
            slice_r(&buf, 2, 4, "thing"),
            Err(EtwError::InvalidData {
                what: "thing",
                offset: 2,
                need: 4,
                have: 2
            })
        );
        assert_eq!(slice_r(&buf, 1, 3, "thing").unwrap().len(), 3);
    }

    #[test]
    fn test_utf16_helpers() {
        let buf = [b'h', 0, b'i', 0, 0, 0, b'x', 0];
        assert_eq!(utf16_nul_position(&buf), Some(2));
        assert_eq!(utf16_until_nul(&buf), "hi");
        assert_eq!(utf16_lossy(&[0x00, 0xD8]), "\u{FFFD}");
    }
}
