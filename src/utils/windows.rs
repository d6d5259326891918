use jiff::civil::DateTime;
use jiff::tz::{Offset, TimeZone};
use jiff::{Timestamp, ToSpan};

const WINDOWS_TO_UNIX_SECS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Broken-down calendar time, laid out like the 16-byte Windows `SYSTEMTIME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub milliseconds: u16,
}

impl SystemTime {
    pub fn from_le_bytes(bytes: &[u8; 16]) -> SystemTime {
        let field = |i: usize| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        SystemTime {
            year: field(0),
            month: field(1),
            day_of_week: field(2),
            day: field(3),
            hour: field(4),
            minute: field(5),
            second: field(6),
            milliseconds: field(7),
        }
    }
}

#[inline]
pub(crate) fn filetime_to_timestamp(filetime: u64) -> Option<Timestamp> {
    let secs = (filetime / FILETIME_TICKS_PER_SEC) as i64 - WINDOWS_TO_UNIX_SECS;
    let nanos = ((filetime % FILETIME_TICKS_PER_SEC) * 100) as i32;
    Timestamp::new(secs, nanos).ok()
}

/// Converts a FILETIME to UTC calendar fields.
///
/// Values outside the representable calendar range produce an all-zero `SystemTime`.
pub(crate) fn filetime_to_systemtime(filetime: u64) -> SystemTime {
    if filetime > i64::MAX as u64 {
        return SystemTime::default();
    }

    let Some(ts) = filetime_to_timestamp(filetime) else {
        return SystemTime::default();
    };

    let dt = ts.to_zoned(TimeZone::UTC).datetime();
    SystemTime {
        year: dt.year() as u16,
        month: dt.month() as u16,
        day_of_week: dt.weekday().to_sunday_zero_offset() as u16,
        day: dt.day() as u16,
        hour: dt.hour() as u16,
        minute: dt.minute() as u16,
        second: dt.second() as u16,
        milliseconds: (dt.subsec_nanosecond() / 1_000_000) as u16,
    }
}

/// Converts UTC calendar fields to a FILETIME, or `None` if the fields are not a valid date.
pub(crate) fn systemtime_to_filetime(st: &SystemTime) -> Option<u64> {
    if st.milliseconds > 999 {
        return None;
    }

    let dt = DateTime::new(
        i16::try_from(st.year).ok()?,
        i8::try_from(st.month).ok()?,
        i8::try_from(st.day).ok()?,
        i8::try_from(st.hour).ok()?,
        i8::try_from(st.minute).ok()?,
        i8::try_from(st.second).ok()?,
        0,
    )
    .ok()?;
    let ts = Offset::UTC.to_timestamp(dt).ok()?;
    let ts = ts.checked_add(i64::from(st.milliseconds).milliseconds()).ok()?;

    let secs = u64::try_from(ts.as_second() + WINDOWS_TO_UNIX_SECS).ok()?;
    let ticks = u64::try_from(ts.subsec_nanosecond() / 100).ok()?;
    secs.checked_mul(FILETIME_TICKS_PER_SEC)?.checked_add(ticks)
}

/// Minutes to add to UTC to get the local time of this machine, right now.
pub(crate) fn local_bias_minutes() -> i32 {
    let offset = TimeZone::system().to_offset(Timestamp::now());
    (offset.seconds() / 60).clamp(-1440, 1440)
}
