use std::fmt::{self, Debug};

use bitflags::bitflags;
use encoding::{Encoding, EncodingRef};

use crate::err::{EtwError, Result};
use crate::utils::local_bias_minutes;

const MAX_BIAS_MINUTES: i32 = 1440;

/// Layout of rendered timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimestampKind {
    /// `2018-04-01T00:23:38.6676037Z`
    #[default]
    Internet,
    /// `04/01/2018-00:23:38.6676037`
    Wpp,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TimestampFlags: u32 {
        /// Convert UTC times to local time using the configured bias.
        const LOCAL = 0x100;
        /// Milliseconds instead of 100ns ticks.
        const LOW_PRECISION = 0x200;
        const NO_TIME_ZONE_SUFFIX = 0x400;
        /// Treat FILETIME fields without a DATETIME_UTC hint as UTC.
        const ASSUME_FILETIME_UTC = 0x800;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimestampFormat {
    pub kind: TimestampKind,
    pub flags: TimestampFlags,
}

impl TimestampFormat {
    const TYPE_MASK: u32 = 0xff;

    pub fn new(kind: TimestampKind, flags: TimestampFlags) -> Self {
        TimestampFormat { kind, flags }
    }

    /// Decodes the packed form: type in the low byte, flags in `0xf00`.
    pub fn from_bits(bits: u32) -> Result<Self> {
        let kind = match bits & Self::TYPE_MASK {
            1 => TimestampKind::Internet,
            2 => TimestampKind::Wpp,
            _ => {
                return Err(EtwError::InvalidParameter {
                    what: "timestamp format type",
                });
            }
        };
        let flags = TimestampFlags::from_bits(bits & !Self::TYPE_MASK).ok_or(
            EtwError::InvalidParameter {
                what: "timestamp format flags",
            },
        )?;
        Ok(TimestampFormat { kind, flags })
    }

    pub fn bits(&self) -> u32 {
        let kind = match self.kind {
            TimestampKind::Internet => 1,
            TimestampKind::Wpp => 2,
        };
        kind | self.flags.bits()
    }

    pub fn with_flags(mut self, flags: TimestampFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn contains(&self, flags: TimestampFlags) -> bool {
        self.flags.contains(flags)
    }
}

#[derive(Clone)]
pub struct EnumeratorSettings {
    timestamp_format: TimestampFormat,
    timezone_bias_minutes: i32,
    pointer_size_fallback: u8,
    timer_resolution: u32,
    ansi_codec: EncodingRef,
}

impl Debug for EnumeratorSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EnumeratorSettings")
            .field("timestamp_format", &self.timestamp_format)
            .field("timezone_bias_minutes", &self.timezone_bias_minutes)
            .field("pointer_size_fallback", &self.pointer_size_fallback)
            .field("timer_resolution", &self.timer_resolution)
            .field("ansi_codec", &self.ansi_codec.name())
            .finish()
    }
}

impl PartialEq for EnumeratorSettings {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp_format == other.timestamp_format
            && self.timezone_bias_minutes == other.timezone_bias_minutes
            && self.pointer_size_fallback == other.pointer_size_fallback
            && self.timer_resolution == other.timer_resolution
            && self.ansi_codec.name() == other.ansi_codec.name()
    }
}

impl Default for EnumeratorSettings {
    fn default() -> Self {
        EnumeratorSettings {
            timestamp_format: TimestampFormat::default(),
            timezone_bias_minutes: local_bias_minutes(),
            pointer_size_fallback: std::mem::size_of::<usize>() as u8,
            timer_resolution: 0,
            ansi_codec: encoding::all::WINDOWS_1252,
        }
    }
}

impl EnumeratorSettings {
    pub fn new() -> Self {
        EnumeratorSettings::default()
    }

    pub fn timestamp_format(mut self, format: TimestampFormat) -> Self {
        self.timestamp_format = format;
        self
    }

    /// Minutes to add to UTC to get local time. Must be within one day.
    pub fn timezone_bias_minutes(mut self, bias: i32) -> Self {
        self.timezone_bias_minutes = bias;
        self
    }

    /// Pointer size used when the event header does not say. Must be 4 or 8.
    pub fn pointer_size_fallback(mut self, size: u8) -> Self {
        self.pointer_size_fallback = size;
        self
    }

    /// Timer resolution in 100ns units, as reported by the trace header event.
    pub fn timer_resolution(mut self, resolution: u32) -> Self {
        self.timer_resolution = resolution;
        self
    }

    pub fn ansi_codec(mut self, ansi_codec: EncodingRef) -> Self {
        self.ansi_codec = ansi_codec;
        self
    }

    pub fn get_timestamp_format(&self) -> TimestampFormat {
        self.timestamp_format
    }

    pub fn get_timezone_bias_minutes(&self) -> i32 {
        self.timezone_bias_minutes
    }

    pub fn get_pointer_size_fallback(&self) -> u8 {
        self.pointer_size_fallback
    }

    pub fn get_timer_resolution(&self) -> u32 {
        self.timer_resolution
    }

    pub fn get_ansi_codec(&self) -> EncodingRef {
        self.ansi_codec
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_bias(self.timezone_bias_minutes)?;
        validate_pointer_size(self.pointer_size_fallback)
    }
}

pub(crate) fn validate_bias(bias: i32) -> Result<()> {
    if (-MAX_BIAS_MINUTES..=MAX_BIAS_MINUTES).contains(&bias) {
        Ok(())
    } else {
        Err(EtwError::InvalidParameter {
            what: "time zone bias minutes",
        })
    }
}

pub(crate) fn validate_pointer_size(size: u8) -> Result<()> {
    if size == 4 || size == 8 {
        Ok(())
    } else {
        Err(EtwError::InvalidParameter {
            what: "pointer size fallback",
        })
    }
}
