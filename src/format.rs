//! Text output for the current event.
//!
//! Three renderings are available:
//!
//! - Message templates (`%1`, `%2!08x!`, `%%5`, `%!TIME!`) expanded against the event's
//!   top-level properties, or against the fixed nine header values for a line prefix.
//! - JSON: `{"Name":value,...}` for the payload, optionally followed by a `"meta"` object
//!   built from the event header.
//! - Single names and values: provider, event, keywords, level, function.
//!
//! Every public entry point returns a `&str` borrowed from the enumerator's output buffer,
//! which is reused by the next call.

use std::borrow::Cow;
use std::fmt::Write;

use bitflags::bitflags;
use log::{debug, trace};

use crate::callbacks::EnumeratorCallbacks;
use crate::enumerator::{
    EnumeratorState, EtwEnumerator, event_attributes, event_name, opcode_name, task_name,
};
use crate::err::{EtwError, Result};
use crate::guid::{EVENT_TRACE_GUID, Guid};
use crate::json_writer::JsonWriter;
use crate::model::{
    DecodingSource, EXT_TYPE_RELATED_ACTIVITYID, EventHeaderFlags, EventInfo, EventRecord, InType,
    MapInfo, OutType, PropertyFlags,
};
use crate::printf::{Category, ParsedPrintf};
use crate::settings::{TimestampFormat, TimestampKind};
use crate::utils::bytes::{read_u16_le, read_u32_le, read_u64_le, utf16_until_nul};
use crate::value_render::{ValueKind, ValueRenderer, append_file_time, decode_ansi};

/// Maximum nesting of messages that expand into further messages.
const MESSAGE_RECURSION_LIMIT: u8 = 3;
/// A trailing-space level that is never reached.
const KEEP_TRAILING_SPACE: u8 = u8::MAX;
/// `_` followed by 32 hex digits.
const PROVIDER_NAME_SUFFIX_LEN: usize = 33;
const FUNCTION_NAME_PROPERTY: &str = "!FUNC!";

bitflags! {
    /// Fields of the `"meta"` object appended by the JSON event formatters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct JsonSuffixFlags: u32 {
        const PROVIDER = 0x1;
        const EVENT = 0x2;
        const TIME = 0x4;
        const CPU = 0x8;
        const PID = 0x10;
        const TID = 0x20;
        const ID = 0x40;
        const VERSION = 0x80;
        const CHANNEL = 0x100;
        const LEVEL = 0x200;
        const OPCODE = 0x400;
        const TASK = 0x800;
        const KEYWORDS = 0x1000;
        const TAGS = 0x2000;
        const ACTIVITY = 0x4000;
        const RELATED_ACTIVITY = 0x8000;
        const KTIME = 0x10000;
        const UTIME = 0x20000;
        const PTIME = 0x40000;
        const ATTRIBS = 0x80000;
    }
}

impl JsonSuffixFlags {
    /// Everything except the event id and version.
    pub const DEFAULT: JsonSuffixFlags = JsonSuffixFlags::from_bits_truncate(0xff3f);
}

impl Default for JsonSuffixFlags {
    fn default() -> Self {
        JsonSuffixFlags::DEFAULT
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct JsonItemFlags: u32 {
        /// Emit `"name":` before the item.
        const NAME = 0x1;
        /// Use `", "` and `": "` separators.
        const SPACE = 0x2;
    }
}

#[derive(Debug, Clone)]
enum PropSource<'a> {
    /// A scalar rendered through the value renderer.
    Value {
        data: Cow<'a, [u8]>,
        in_type: InType,
        out_type: OutType,
        map_name: Option<String>,
    },
    /// Text computed up front (prefix provider and event names).
    Text(String),
    /// A `u32` shown as `%04X` unless the template gives its own format.
    Hex4(u32),
    /// A `u32` shown as `%08u` unless the template gives its own format.
    Dec8(u32),
    /// A struct or array, rendered as JSON after seeking back to it.
    Item { offset: usize, index: u16 },
}

#[derive(Debug)]
struct FormatProp<'a> {
    source: PropSource<'a>,
    /// Whether string results are expanded again as templates.
    recurse: bool,
    in_use: bool,
}

impl<'a> FormatProp<'a> {
    fn new(source: PropSource<'a>) -> Self {
        FormatProp {
            source,
            recurse: false,
            in_use: false,
        }
    }

    fn recursive(source: PropSource<'a>) -> Self {
        FormatProp {
            recurse: true,
            ..Self::new(source)
        }
    }

    fn uint32(value: u32) -> Self {
        Self::new(PropSource::Value {
            data: Cow::Owned(value.to_le_bytes().to_vec()),
            in_type: InType::UINT32,
            out_type: OutType::NULL,
            map_name: None,
        })
    }
}

/// State for one template expansion.
struct FormatContext<'a> {
    props: Vec<FormatProp<'a>>,
    /// Recursion level at which a template's final space is dropped.
    trim_level: u8,
    ktime: u32,
    utime: u32,
}

/// Strips a `_<32 hex digits>` suffix that spells out the provider GUID.
fn trim_provider_name<'n>(name: &'n str, provider: &Guid) -> &'n str {
    if name.len() > PROVIDER_NAME_SUFFIX_LEN {
        let split = name.len() - PROVIDER_NAME_SUFFIX_LEN;
        if name.as_bytes()[split] == b'_'
            && name[split + 1..].eq_ignore_ascii_case(&provider.to_name_suffix())
        {
            return &name[..split];
        }
    }
    name
}

fn replace_nul(text: &mut String) {
    if text.contains('\0') {
        *text = text.replace('\0', " ");
    }
}

/// Renders `data` as a 32- or 64-bit integer if the clause is an integer conversion.
fn write_printf_int(out: &mut String, printf: &ParsedPrintf, data: &[u8], size: usize) -> bool {
    if printf.category() != Category::Integer {
        return false;
    }
    let value = match size {
        8 => read_u64_le(data, 0).map(|v| (v, 64)),
        _ => read_u32_le(data, 0).map(|v| (u64::from(v), 32)),
    };
    match value {
        Some((value, bits)) => {
            printf.write_int(out, value, bits);
            true
        }
        None => false,
    }
}

impl<'a, C: EnumeratorCallbacks + ?Sized> EtwEnumerator<'a, C> {
    /// Formats the current event with its own message, or as JSON if it has none or a
    /// parameter message id is missing.
    ///
    /// `prefix` is expanded with the header values `%1`..`%9` (see
    /// [`format_current_event_prefix`](Self::format_current_event_prefix)).
    pub fn format_current_event(
        &mut self,
        prefix: Option<&str>,
        suffix: JsonSuffixFlags,
    ) -> Result<&str> {
        self.with_output(|e, out| e.write_current_event(out, prefix, suffix))
    }

    /// Formats the current event using `message` instead of the event's own message.
    pub fn format_current_event_with_message(
        &mut self,
        prefix: Option<&str>,
        message: &str,
    ) -> Result<&str> {
        self.with_output(|e, out| {
            e.reset()?;
            e.write_prefix(out, prefix)?;
            e.add_current_event(out, message, false)
        })
    }

    /// Expands `prefix` against the current event's header.
    ///
    /// | Index | Value |
    /// |-------|-------|
    /// | `%1` | provider name |
    /// | `%2` | event name |
    /// | `%3` | thread id, `%04X` |
    /// | `%4` | timestamp |
    /// | `%5` | kernel time in ms, `%08u` |
    /// | `%6` | user time in ms, `%08u` |
    /// | `%7` | sequence number, always 0 |
    /// | `%8` | process id, `%04X` |
    /// | `%9` | processor index |
    pub fn format_current_event_prefix(&mut self, prefix: &str) -> Result<&str> {
        self.with_output(|e, out| e.add_prefix(out, prefix))
    }

    pub fn format_current_event_as_json(
        &mut self,
        prefix: Option<&str>,
        suffix: JsonSuffixFlags,
    ) -> Result<&str> {
        self.with_output(|e, out| {
            e.reset()?;
            e.write_prefix(out, prefix)?;
            e.add_current_event_as_json(out, suffix)
        })
    }

    /// Renders the current item as JSON and moves past it.
    ///
    /// Before the first item this renders every top-level property (without enclosing
    /// braces) and moves to the end of the event.
    pub fn format_current_item_as_json_and_move_next_sibling(
        &mut self,
        flags: JsonItemFlags,
    ) -> Result<&str> {
        self.with_output(|e, out| e.add_item_as_json(out, flags))
    }

    /// Renders the current value, applying its map if it has one.
    pub fn format_current_value(&mut self) -> Result<&str> {
        self.with_output(|e, out| e.add_current_value(out).map(|_| ()))
    }

    /// Renders arbitrary data, looking `map_name` up through the callbacks.
    pub fn format_value_with_map_name(
        &mut self,
        data: &[u8],
        in_type: InType,
        out_type: OutType,
        record: &EventRecord,
        map_name: Option<&str>,
    ) -> Result<&str> {
        self.with_output(|e, out| {
            e.render_with_map_name(out, data, in_type, out_type, record, map_name)
                .map(|_| ())
        })
    }

    pub fn format_value_with_map_info(
        &mut self,
        data: &[u8],
        in_type: InType,
        out_type: OutType,
        map: Option<&MapInfo>,
    ) -> Result<&str> {
        self.with_output(|e, out| {
            let renderer = ValueRenderer::new(e.callbacks, &e.settings);
            match map {
                Some(map) => renderer.render_with_map(out, data, in_type, out_type, map),
                None => renderer.render(out, data, in_type, out_type),
            }
            .map(|_| ())
        })
    }

    pub fn format_value(&mut self, data: &[u8], in_type: InType, out_type: OutType) -> Result<&str> {
        self.format_value_with_map_info(data, in_type, out_type, None)
    }

    pub fn format_current_provider_name(&mut self) -> Result<&str> {
        self.with_output(|e, out| e.append_provider_name(out))
    }

    pub fn format_current_event_name(&mut self) -> Result<&str> {
        self.with_output(|e, out| e.append_event_name(out))
    }

    pub fn format_current_keywords_name(&mut self) -> Result<&str> {
        self.with_output(|e, out| e.append_keywords_name(out))
    }

    pub fn format_current_level_name(&mut self) -> Result<&str> {
        self.with_output(|e, out| e.append_level_name(out))
    }

    /// The `FUNC` attribute, or the leading `!FUNC!` string property of WPP-style events.
    pub fn format_current_function_name(&mut self) -> Result<&str> {
        self.with_output(|e, out| e.append_function_name(out))
    }

    /// Runs `f` against the cleared output buffer.
    fn with_output<F>(&mut self, f: F) -> Result<&str>
    where
        F: FnOnce(&mut Self, &mut String) -> Result<()>,
    {
        let mut out = std::mem::take(&mut self.output);
        out.clear();
        let result = f(self, &mut out);
        self.output = out;
        result?;
        Ok(self.output.as_str())
    }

    fn format_target(&self) -> Result<(&'a EventRecord, &EventInfo)> {
        match (self.record, self.info.as_deref()) {
            (Some(record), Some(info)) if self.state() != EnumeratorState::None => {
                Ok((record, info))
            }
            _ => Err(EtwError::InvalidState),
        }
    }

    fn check_move(&self) -> Result<()> {
        if self.state() == EnumeratorState::Error {
            Err(self.move_error())
        } else {
            Ok(())
        }
    }

    fn write_current_event(
        &mut self,
        out: &mut String,
        prefix: Option<&str>,
        suffix: JsonSuffixFlags,
    ) -> Result<()> {
        self.reset()?;
        self.write_prefix(out, prefix)?;
        let prefix_len = out.len();

        let info = self.info.clone().ok_or(EtwError::InvalidState)?;
        if let Some(message) = info.event_message.as_deref() {
            match self.add_current_event(out, message, true) {
                Ok(()) => return Ok(()),
                Err(EtwError::MessageIdNotFound { message_id }) => {
                    debug!(
                        "parameter message {} not found, formatting event {} as JSON",
                        message_id, info.descriptor.id
                    );
                    out.truncate(prefix_len);
                    self.reset()?;
                }
                Err(e) => return Err(e),
            }
        }

        self.add_current_event_as_json(out, suffix)
    }

    fn write_prefix(&mut self, out: &mut String, prefix: Option<&str>) -> Result<()> {
        match prefix {
            Some(prefix) if !prefix.is_empty() => self.add_prefix(out, prefix),
            _ => Ok(()),
        }
    }

    fn cpu_times(&self, record: &EventRecord) -> (u32, u32) {
        let header = &record.header;
        if header
            .flags
            .intersects(EventHeaderFlags::NO_CPUTIME | EventHeaderFlags::PRIVATE_SESSION)
        {
            (0, 0)
        } else {
            (
                self.ticks_to_milliseconds(header.kernel_time()),
                self.ticks_to_milliseconds(header.user_time()),
            )
        }
    }

    fn add_prefix(&mut self, out: &mut String, prefix: &str) -> Result<()> {
        let (record, _) = self.format_target()?;
        let header = &record.header;

        let mut provider = String::new();
        self.append_provider_name(&mut provider)?;
        let mut event = String::new();
        self.append_event_name(&mut event)?;
        let (ktime, utime) = self.cpu_times(record);

        let mut ctx = FormatContext {
            props: vec![
                FormatProp::new(PropSource::Text(provider)),
                FormatProp::new(PropSource::Text(event)),
                FormatProp::new(PropSource::Hex4(header.thread_id)),
                FormatProp::new(PropSource::Value {
                    data: Cow::Owned(header.timestamp.to_le_bytes().to_vec()),
                    in_type: InType::FILETIME,
                    out_type: OutType::DATETIME_UTC,
                    map_name: None,
                }),
                FormatProp::new(PropSource::Dec8(ktime)),
                FormatProp::new(PropSource::Dec8(utime)),
                FormatProp::uint32(0),
                FormatProp::new(PropSource::Hex4(header.process_id)),
                FormatProp::uint32(record.processor_index()),
            ],
            trim_level: KEEP_TRAILING_SPACE,
            ktime,
            utime,
        };

        self.expand(out, &mut ctx, prefix, 0)
    }

    /// Expands `message` against the top-level properties. Must be positioned before the
    /// first item.
    fn add_current_event(
        &mut self,
        out: &mut String,
        message: &str,
        remove_trailing_space: bool,
    ) -> Result<()> {
        if self.state() != EnumeratorState::BeforeFirstItem {
            return Err(EtwError::InvalidState);
        }
        let (record, info) = self.format_target()?;
        let top_level = info.top_level_property_count;
        let (ktime, utime) = self.cpu_times(record);

        let mut props = Vec::with_capacity(usize::from(top_level));
        self.move_next();
        self.check_move()?;

        for index in 0..top_level {
            if self.state() == EnumeratorState::Value {
                let item = self.item_info().ok_or(EtwError::InvalidState)?;
                let source = PropSource::Value {
                    data: Cow::Borrowed(self.item_data()),
                    in_type: item.in_type,
                    out_type: item.out_type,
                    map_name: item.map_name.map(str::to_owned),
                };
                props.push(FormatProp::recursive(source));
                self.move_next();
            } else {
                let offset = self.data_position();
                self.move_next_sibling();
                props.push(FormatProp::new(PropSource::Item { offset, index }));
            }
            self.check_move()?;
        }

        let mut ctx = FormatContext {
            props,
            trim_level: if remove_trailing_space {
                MESSAGE_RECURSION_LIMIT
            } else {
                KEEP_TRAILING_SPACE
            },
            ktime,
            utime,
        };

        self.expand(out, &mut ctx, message, MESSAGE_RECURSION_LIMIT)
    }

    fn expand(
        &mut self,
        out: &mut String,
        ctx: &mut FormatContext<'a>,
        template: &str,
        limit: u8,
    ) -> Result<()> {
        let bytes = template.as_bytes();
        let at = |i: usize| bytes.get(i).copied().unwrap_or(0);
        let mut i = 0;

        loop {
            let chunk_start = i;
            while i < bytes.len() && bytes[i] != b'%' {
                i += 1;
            }
            out.push_str(&template[chunk_start..i]);

            if i == bytes.len() {
                // Message tables end every message with a space.
                if limit == ctx.trim_level && template.ends_with(' ') && out.ends_with(' ') {
                    out.pop();
                }
                return Ok(());
            }

            let percent = i;
            i += 1;

            if at(i) == b'!' {
                i += 1;
                while at(i).is_ascii_uppercase() {
                    i += 1;
                }
                if at(i) == b'!' && i > percent + 2 {
                    i += 1;
                    self.append_variable(out, ctx, &template[percent + 2..i - 1])?;
                } else {
                    out.push_str(&template[percent..i]);
                }
                continue;
            }

            let double_percent = at(i) == b'%';
            if double_percent {
                i += 1;
            }

            if !at(i).is_ascii_digit() {
                if double_percent && at(i) == b'%' && at(i + 1).is_ascii_digit() {
                    // `%%%2` is a literal `%%` followed by `%2`.
                    out.push_str("%%");
                } else {
                    if double_percent {
                        i -= 1;
                    }
                    out.push('%');
                }
                continue;
            }

            let mut index: u32 = 0;
            while at(i).is_ascii_digit() {
                index = index
                    .saturating_mul(10)
                    .saturating_add(u32::from(at(i) - b'0'));
                i += 1;
            }

            if double_percent {
                self.add_parameter_message(out, ctx, &template[percent..i], index, limit)?;
            } else if at(i) != b'!' {
                self.add_property(out, ctx, index, limit, None)?;
            } else if at(i + 1) == b'S' && at(i + 2) == b'!' {
                i += 3;
                self.add_property(out, ctx, index, 0, None)?;
            } else {
                let printf = ParsedPrintf::parse(&template[i + 1..]);
                if printf.consumed() != 0 && at(i + 1 + printf.consumed()) == b'!' {
                    i += printf.consumed() + 2;
                    let printf = (!printf.is_plain_string()).then_some(printf);
                    self.add_property(out, ctx, index, 0, printf.as_ref())?;
                } else {
                    // Not a format clause; the `!...` text is left in place.
                    self.add_property(out, ctx, index, limit, None)?;
                }
            }
        }
    }

    fn add_parameter_message(
        &mut self,
        out: &mut String,
        ctx: &mut FormatContext<'a>,
        text: &str,
        message_id: u32,
        limit: u8,
    ) -> Result<()> {
        let (record, _) = self.format_target()?;
        let message = match self.callbacks.get_parameter_message(record, message_id) {
            Ok(message) => message,
            Err(EtwError::NotFound) => {
                debug!("parameter message {} has no text", message_id);
                out.push_str(text);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let message = message.trim_end_matches(|c| c == '\r' || c == '\n');
        // At the recursion limit the message text goes out unexpanded, with no placeholder.
        if limit == 0 {
            out.push_str(message);
            Ok(())
        } else {
            self.expand(out, ctx, message, limit - 1)
        }
    }

    fn add_property(
        &mut self,
        out: &mut String,
        ctx: &mut FormatContext<'a>,
        index: u32,
        limit: u8,
        printf: Option<&ParsedPrintf>,
    ) -> Result<()> {
        let slot = match index.checked_sub(1).and_then(|i| usize::try_from(i).ok()) {
            Some(slot) if slot < ctx.props.len() => slot,
            _ => {
                let _ = write!(out, "[IndexOutOfRange:%{}]", index);
                return Ok(());
            }
        };

        let prop = &mut ctx.props[slot];
        if prop.in_use {
            trace!("property %{} expands to itself", index);
            let _ = write!(out, "[IndexRecursion:%{}]", index);
            return Ok(());
        }
        prop.in_use = true;
        let source = prop.source.clone();
        let limit = if prop.recurse { limit } else { 0 };

        let result = self.add_prop_source(out, ctx, source, limit, printf);
        ctx.props[slot].in_use = false;
        result
    }

    fn add_prop_source(
        &mut self,
        out: &mut String,
        ctx: &mut FormatContext<'a>,
        source: PropSource<'a>,
        limit: u8,
        printf: Option<&ParsedPrintf>,
    ) -> Result<()> {
        match (source, printf) {
            (PropSource::Item { offset, index }, printf) => {
                if !self.seek_top_level_property(offset, index) {
                    return Err(self.move_error());
                }
                match printf {
                    None => self.add_item_as_json(out, JsonItemFlags::empty()),
                    Some(printf) => {
                        let mut json = String::new();
                        self.add_item_as_json(&mut json, JsonItemFlags::empty())?;
                        printf.write_str(out, &json);
                        Ok(())
                    }
                }
            }

            (PropSource::Hex4(value), None) => {
                let _ = write!(out, "{:04X}", value);
                Ok(())
            }
            (PropSource::Dec8(value), None) => {
                let _ = write!(out, "{:08}", value);
                Ok(())
            }
            (PropSource::Hex4(value) | PropSource::Dec8(value), Some(printf)) => {
                let data = value.to_le_bytes();
                self.add_value(out, ctx, &data, InType::UINT32, OutType::NULL, None, 0, Some(printf))
            }

            (PropSource::Text(mut text), printf) => {
                replace_nul(&mut text);
                match printf {
                    Some(printf) => printf.write_str(out, &text),
                    None => out.push_str(&text),
                }
                Ok(())
            }

            (
                PropSource::Value {
                    data,
                    in_type,
                    out_type,
                    map_name,
                },
                printf,
            ) => self.add_value(
                out,
                ctx,
                &data,
                in_type,
                out_type,
                map_name.as_deref(),
                limit,
                printf,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_value(
        &mut self,
        out: &mut String,
        ctx: &mut FormatContext<'a>,
        data: &[u8],
        in_type: InType,
        out_type: OutType,
        map_name: Option<&str>,
        limit: u8,
        printf: Option<&ParsedPrintf>,
    ) -> Result<()> {
        let (record, _) = self.format_target()?;

        if let Some(printf) = printf {
            if self.write_printf_value(out, printf, data, in_type, out_type) {
                return Ok(());
            }
            let mut text = String::new();
            self.render_with_map_name(&mut text, data, in_type, out_type, record, map_name)?;
            replace_nul(&mut text);
            printf.write_str(out, &text);
            return Ok(());
        }

        if limit == 0 {
            let start = out.len();
            let kind = self.render_with_map_name(out, data, in_type, out_type, record, map_name)?;
            if kind == ValueKind::EscapableString && out[start..].contains('\0') {
                let mut tail = out.split_off(start);
                replace_nul(&mut tail);
                out.push_str(&tail);
            }
            return Ok(());
        }

        let mut text = String::new();
        let kind = self.render_with_map_name(&mut text, data, in_type, out_type, record, map_name)?;
        if kind == ValueKind::EscapableString {
            replace_nul(&mut text);
            self.expand(out, ctx, &text, limit - 1)
        } else {
            out.push_str(&text);
            Ok(())
        }
    }

    /// Renders a value directly through a non-string printf clause. Returns false when the
    /// clause does not suit the value, which is then rendered as a string instead.
    fn write_printf_value(
        &self,
        out: &mut String,
        printf: &ParsedPrintf,
        data: &[u8],
        in_type: InType,
        out_type: OutType,
    ) -> bool {
        let category = printf.category();
        if category == Category::String {
            return false;
        }

        match in_type {
            InType::INT8 | InType::UINT8 | InType::ANSICHAR => match (category, data) {
                (Category::Integer, &[byte]) => {
                    printf.write_int(out, u64::from(byte), 8);
                    true
                }
                (Category::Character, &[byte]) => {
                    let decoded = decode_ansi(self.settings.get_ansi_codec(), out_type, &[byte]);
                    match decoded.chars().next() {
                        Some(ch) => {
                            printf.write_char(out, if ch == '\0' { ' ' } else { ch });
                            true
                        }
                        None => false,
                    }
                }
                _ => false,
            },

            InType::INT16 | InType::UINT16 | InType::UNICODECHAR => {
                match (category, read_u16_le(data, 0)) {
                    (Category::Integer, Some(value)) => {
                        let value = if out_type == OutType::PORT {
                            value.swap_bytes()
                        } else {
                            value
                        };
                        printf.write_int(out, u64::from(value), 16);
                        true
                    }
                    (Category::Character, Some(value)) => {
                        let ch = match char::from_u32(u32::from(value)) {
                            Some('\0') => ' ',
                            Some(ch) => ch,
                            None => char::REPLACEMENT_CHARACTER,
                        };
                        printf.write_char(out, ch);
                        true
                    }
                    _ => false,
                }
            }

            InType::INT32 | InType::UINT32 | InType::HEXINT32 | InType::BOOLEAN => {
                write_printf_int(out, printf, data, 4)
            }
            InType::INT64 | InType::UINT64 | InType::HEXINT64 | InType::FILETIME => {
                write_printf_int(out, printf, data, 8)
            }
            InType::POINTER | InType::SIZET => write_printf_int(out, printf, data, data.len()),

            InType::FLOAT => match (category, read_u32_le(data, 0)) {
                (Category::Float, Some(bits)) => {
                    printf.write_float(out, f64::from(f32::from_bits(bits)));
                    true
                }
                _ => false,
            },
            InType::DOUBLE => match (category, read_u64_le(data, 0)) {
                (Category::Float, Some(bits)) => {
                    printf.write_float(out, f64::from_bits(bits));
                    true
                }
                _ => false,
            },

            _ => false,
        }
    }

    fn append_variable(&self, out: &mut String, ctx: &FormatContext<'a>, name: &str) -> Result<()> {
        let (record, info) = self.format_target()?;
        let header = &record.header;

        match name {
            "ATTRIBS" => out.push_str(event_attributes(info).unwrap_or("")),
            "BANG" | "EXCLAMATION" => out.push('!'),
            "COMPNAME" | "MJ" => self.append_event_attribute(out, "MJ")?,
            "MN" | "SUBCOMP" => self.append_event_attribute(out, "MN")?,
            "FILE" | "LINE" => self.append_event_attribute(out, name)?,
            "CPU" => {
                let _ = write!(out, "{}", record.processor_index());
            }
            "EVENT" => self.append_event_name(out)?,
            "FLAGS" | "KEYWORDS" => self.append_keywords_name(out)?,
            "FUNC" => self.append_function_name(out)?,
            "KTIME" => {
                let _ = write!(out, "{}", ctx.ktime);
            }
            "UTIME" => {
                let _ = write!(out, "{}", ctx.utime);
            }
            "LEVEL" => self.append_level_name(out)?,
            "PROVIDER" => self.append_provider_name(out)?,
            "PID" => {
                let _ = write!(out, "{:04X}", header.process_id);
            }
            "TID" => {
                let _ = write!(out, "{:04X}", header.thread_id);
            }
            "PTIME" => {
                if header.flags.contains(EventHeaderFlags::PRIVATE_SESSION)
                    && header.provider_id != EVENT_TRACE_GUID
                {
                    let _ = write!(out, "{}", header.processor_time);
                }
            }
            "PCT" | "PERCENT" => out.push('%'),
            "SEQ" => out.push('0'),
            "TAGS" => {
                let _ = write!(out, "0x{:X}", info.tags);
            }
            "TIME" => append_file_time(
                out,
                header.timestamp as u64,
                self.settings.get_timestamp_format(),
                self.settings.get_timezone_bias_minutes(),
                true,
            ),
            _ => {
                out.push_str("%!");
                out.push_str(name);
                out.push('!');
            }
        }
        Ok(())
    }

    /// Appends an attribute value. Missing attributes append nothing.
    fn append_event_attribute(&self, out: &mut String, name: &str) -> Result<()> {
        match self.find_current_event_attribute(name) {
            Ok(value) => {
                out.push_str(&value);
                Ok(())
            }
            Err(EtwError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn append_provider_name(&self, out: &mut String) -> Result<()> {
        let (record, info) = self.format_target()?;
        let provider = &record.header.provider_id;
        match info.provider_name.as_deref() {
            Some(name) => out.push_str(trim_provider_name(name, provider)),
            None => {
                let _ = write!(out, "{}", provider);
            }
        }
        Ok(())
    }

    fn append_event_name(&self, out: &mut String) -> Result<()> {
        let (record, info) = self.format_target()?;
        if let Some(name) = event_name(info) {
            out.push_str(name);
            return Ok(());
        }

        if let (Ok(file), Ok(line)) = (
            self.find_current_event_attribute("FILE"),
            self.find_current_event_attribute("LINE"),
        ) {
            out.push_str(&file);
            out.push_str(&line);
            return Ok(());
        }

        let descriptor = &record.header.descriptor;
        let _ = write!(out, "{}v{}", descriptor.id, descriptor.version);
        Ok(())
    }

    fn append_keywords_name(&self, out: &mut String) -> Result<()> {
        let (record, info) = self.format_target()?;
        match info.keywords_name.as_deref() {
            Some(name) => out.push_str(name.trim_end_matches(' ')),
            None => {
                let _ = write!(out, "0x{:X}", record.header.descriptor.keyword);
            }
        }
        Ok(())
    }

    fn append_level_name(&self, out: &mut String) -> Result<()> {
        let (record, info) = self.format_target()?;
        match info.level_name.as_deref() {
            Some(name) => out.push_str(name.trim_end_matches(' ')),
            None => {
                let _ = write!(out, "{}", record.header.descriptor.level);
            }
        }
        Ok(())
    }

    fn append_function_name(&self, out: &mut String) -> Result<()> {
        match self.find_current_event_attribute("FUNC") {
            Ok(func) => {
                out.push_str(&func);
                return Ok(());
            }
            Err(EtwError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let (record, info) = self.format_target()?;
        let Some(prop) = info.properties.first() else {
            return Ok(());
        };
        if !prop
            .flags()
            .difference(PropertyFlags::HAS_CUSTOM_SCHEMA)
            .is_empty()
            || prop.name.as_deref() != Some(FUNCTION_NAME_PROPERTY)
        {
            return Ok(());
        }

        let data = record.user_data.as_slice();
        match prop.in_type() {
            InType::UNICODESTRING => out.push_str(&utf16_until_nul(data)),
            InType::ANSISTRING => {
                let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                out.push_str(&decode_ansi(
                    self.settings.get_ansi_codec(),
                    prop.out_type(),
                    &data[..len],
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Renders the current value, through its map if it has one.
    fn add_current_value(&self, out: &mut String) -> Result<ValueKind> {
        if self.state() != EnumeratorState::Value {
            return Err(EtwError::InvalidState);
        }
        let (record, _) = self.format_target()?;
        let item = self.item_info().ok_or(EtwError::InvalidState)?;
        self.render_with_map_name(out, item.data, item.in_type, item.out_type, record, item.map_name)
    }

    fn render_with_map_name(
        &self,
        out: &mut String,
        data: &[u8],
        in_type: InType,
        out_type: OutType,
        record: &EventRecord,
        map_name: Option<&str>,
    ) -> Result<ValueKind> {
        let renderer = ValueRenderer::new(self.callbacks, &self.settings);
        let Some(map_name) = map_name else {
            return renderer.render(out, data, in_type, out_type);
        };

        match self.callbacks.get_event_map_information(record, map_name) {
            Ok(map) => renderer.render_with_map(out, data, in_type, out_type, &map),
            Err(EtwError::NotFound) => {
                debug!("map `{}` not found, rendering value without it", map_name);
                renderer.render(out, data, in_type, out_type)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes the current item as JSON and moves past it.
    fn add_item_as_json(&mut self, out: &mut String, flags: JsonItemFlags) -> Result<()> {
        let mut include_name = flags.contains(JsonItemFlags::NAME);
        let mut depth: i32 = 0;
        let mut want_comma = false;

        match self.state() {
            EnumeratorState::BeforeFirstItem => {
                depth = 1;
                include_name = true;
                if !self.move_next() {
                    return self.check_move();
                }
            }
            EnumeratorState::Value | EnumeratorState::ArrayBegin | EnumeratorState::StructBegin => {}
            _ => return Err(EtwError::InvalidState),
        }

        let mut w = JsonWriter::new(out, flags.contains(JsonItemFlags::SPACE));
        let mut scratch = String::new();

        loop {
            let state = self.state();
            let named = include_name && !self.in_array();
            let name = self.item_info().map_or("", |item| item.name);

            match state {
                EnumeratorState::Value => {
                    if want_comma {
                        w.comma();
                    }
                    if named {
                        w.write_key(name);
                    }
                    scratch.clear();
                    let kind = self.add_current_value(&mut scratch)?;
                    w.write_value(&scratch, kind);
                    want_comma = true;
                }
                EnumeratorState::ArrayBegin => {
                    if want_comma {
                        w.comma();
                    }
                    // An array inside an array is still named.
                    if include_name {
                        w.write_key(name);
                    }
                    w.open_array();
                    depth += 1;
                    want_comma = false;
                }
                EnumeratorState::ArrayEnd => {
                    w.close_array();
                    depth -= 1;
                    want_comma = true;
                }
                EnumeratorState::StructBegin => {
                    if want_comma {
                        w.comma();
                    }
                    if named {
                        w.write_key(name);
                    }
                    w.open_object();
                    depth += 1;
                    want_comma = false;
                }
                EnumeratorState::StructEnd => {
                    w.close_object();
                    depth -= 1;
                    want_comma = true;
                }
                _ => return Err(EtwError::InvalidState),
            }

            include_name = true;
            if !self.move_next() || depth <= 0 {
                break;
            }
        }

        self.check_move()
    }

    /// Writes `{items,"meta":{...}}`. Must be positioned before the first item.
    fn add_current_event_as_json(&mut self, out: &mut String, suffix: JsonSuffixFlags) -> Result<()> {
        if self.state() != EnumeratorState::BeforeFirstItem {
            return Err(EtwError::InvalidState);
        }

        out.push('{');
        let items_start = out.len();
        self.add_item_as_json(out, JsonItemFlags::NAME)?;
        let mut first = out.len() == items_start;

        if !suffix.is_empty() {
            let mut w = JsonWriter::new(out, false);
            w.member(&mut first, "meta");
            w.open_object();
            self.write_meta(out, suffix)?;
            out.push('}');
        }

        out.push('}');
        Ok(())
    }

    fn write_meta(&self, out: &mut String, suffix: JsonSuffixFlags) -> Result<()> {
        let (record, info) = self.format_target()?;
        let header = &record.header;
        let descriptor = &header.descriptor;
        let is_wbem = info.decoding_source == DecodingSource::Wbem;

        let mut w = JsonWriter::new(out, false);
        let mut first = true;
        let mut scratch = String::new();

        if suffix.contains(JsonSuffixFlags::PROVIDER) {
            match info.provider_name.as_deref() {
                Some(name) => w.member_quoted(&mut first, "provider", name),
                None => w.member_clean(&mut first, "provider", &header.provider_id.to_string()),
            }
        }

        if suffix.contains(JsonSuffixFlags::EVENT) {
            scratch.clear();
            self.append_event_name(&mut scratch)?;
            w.member_quoted(&mut first, "event", &scratch);
        }

        if suffix.contains(JsonSuffixFlags::TIME) {
            scratch.clear();
            let format = TimestampFormat::new(
                TimestampKind::Internet,
                self.settings.get_timestamp_format().flags,
            );
            append_file_time(
                &mut scratch,
                header.timestamp as u64,
                format,
                self.settings.get_timezone_bias_minutes(),
                true,
            );
            w.member_clean(&mut first, "time", &scratch);
        }

        if suffix.contains(JsonSuffixFlags::CPU) {
            w.member_u64(&mut first, "cpu", u64::from(record.processor_index()));
        }

        if suffix.contains(JsonSuffixFlags::PID) && header.process_id != u32::MAX {
            w.member_u64(&mut first, "pid", u64::from(header.process_id));
        }

        if suffix.contains(JsonSuffixFlags::TID) && header.thread_id != u32::MAX {
            w.member_u64(&mut first, "tid", u64::from(header.thread_id));
        }

        if suffix.contains(JsonSuffixFlags::ID) {
            w.member_u64(&mut first, "id", u64::from(descriptor.id));
        }

        if suffix.contains(JsonSuffixFlags::VERSION) && descriptor.version != 0 {
            w.member_u64(&mut first, "version", u64::from(descriptor.version));
        }

        if suffix.contains(JsonSuffixFlags::CHANNEL) && descriptor.channel != 0 {
            match info.channel_name.as_deref() {
                Some(name) => w.member_quoted(&mut first, "channel", name),
                None => w.member_u64(&mut first, "channel", u64::from(descriptor.channel)),
            }
        }

        if suffix.contains(JsonSuffixFlags::LEVEL) && descriptor.level != 0 {
            match info.level_name.as_deref() {
                Some(name) => w.member_quoted(&mut first, "level", name),
                None => w.member_u64(&mut first, "level", u64::from(descriptor.level)),
            }
        }

        if suffix.contains(JsonSuffixFlags::OPCODE) && descriptor.opcode != 0 && !is_wbem {
            match opcode_name(info) {
                Some(name) => w.member_quoted(&mut first, "opcode", name),
                None => w.member_u64(&mut first, "opcode", u64::from(descriptor.opcode)),
            }
        }

        if suffix.contains(JsonSuffixFlags::TASK) && (descriptor.task != 0 || is_wbem) {
            match task_name(info) {
                Some(name) => w.member_quoted(&mut first, "task", name),
                None => w.member_u64(&mut first, "task", u64::from(descriptor.task)),
            }
        }

        if suffix.contains(JsonSuffixFlags::KEYWORDS) && descriptor.keyword != 0 {
            match info.keywords_name.as_deref() {
                Some(name) => w.member_quoted(&mut first, "keywords", name),
                None => {
                    w.member_clean(&mut first, "keywords", &format!("0x{:X}", descriptor.keyword))
                }
            }
        }

        if suffix.contains(JsonSuffixFlags::TAGS) && info.tags != 0 {
            w.member_clean(&mut first, "tags", &format!("0x{:X}", info.tags));
        }

        if suffix.contains(JsonSuffixFlags::ACTIVITY) && !header.activity_id.is_nil() {
            w.member_clean(&mut first, "activity", &header.activity_id.to_string());
        }

        if suffix.contains(JsonSuffixFlags::RELATED_ACTIVITY) {
            let related = record
                .extended_data
                .iter()
                .filter(|item| item.ext_type == EXT_TYPE_RELATED_ACTIVITYID && item.data.len() == 16)
                .find_map(|item| Guid::from_slice(&item.data));
            if let Some(related) = related {
                w.member_clean(&mut first, "relatedActivity", &related.to_string());
            }
        }

        if header.flags.contains(EventHeaderFlags::PRIVATE_SESSION) {
            if suffix.contains(JsonSuffixFlags::PTIME) && header.provider_id != EVENT_TRACE_GUID {
                w.member_u64(&mut first, "ptime", header.processor_time);
            }
        } else if !header.flags.contains(EventHeaderFlags::NO_CPUTIME) {
            if suffix.contains(JsonSuffixFlags::KTIME) {
                let ktime = self.ticks_to_milliseconds(header.kernel_time());
                w.member_u64(&mut first, "ktime", u64::from(ktime));
            }
            if suffix.contains(JsonSuffixFlags::UTIME) {
                let utime = self.ticks_to_milliseconds(header.user_time());
                w.member_u64(&mut first, "utime", u64::from(utime));
            }
        }

        if suffix.contains(JsonSuffixFlags::ATTRIBS) {
            if let Some(attributes) = event_attributes(info) {
                w.member_quoted(&mut first, "attribs", attributes);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::DefaultCallbacks;
    use crate::model::{
        EventDescriptor, EventHeader, ExtendedDataItem, MapEntry, MapFlags, PropertyInfo,
        PropertyParam,
    };
    use crate::settings::EnumeratorSettings;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn provider() -> Guid {
        Guid::new(0x1234_5678, 0x9abc, 0xdef0, [1, 2, 3, 4, 5, 6, 7, 8])
    }

    fn utf16z(s: &str) -> Vec<u8> {
        s.encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(|unit| unit.to_le_bytes())
            .collect()
    }

    fn record(user_data: Vec<u8>) -> EventRecord {
        let mut rec = EventRecord::new(
            EventHeader {
                flags: EventHeaderFlags::HEADER_64_BIT | EventHeaderFlags::NO_CPUTIME,
                thread_id: 0x2b,
                process_id: 0x1a,
                provider_id: provider(),
                descriptor: EventDescriptor {
                    id: 7,
                    level: 4,
                    ..Default::default()
                },
                ..Default::default()
            },
            user_data,
        );
        rec.buffer_context.processor_index = 3;
        rec
    }

    fn info(properties: Vec<PropertyInfo>) -> EventInfo {
        EventInfo::with_properties(provider(), EventDescriptor::default(), properties)
    }

    fn count_and_data() -> (EventInfo, EventRecord) {
        let info = info(vec![
            PropertyInfo::value("Count", InType::UINT32, OutType::NULL),
            PropertyInfo::value("Data", InType::UINT8, OutType::NULL)
                .with_count(PropertyParam::FromProperty(0)),
        ]);
        (info, record(vec![3, 0, 0, 0, 1, 2, 3]))
    }

    fn two_strings(message: &str, first: &str, second: &str) -> (EventInfo, EventRecord) {
        let mut info = info(vec![
            PropertyInfo::value("Who", InType::UNICODESTRING, OutType::NULL),
            PropertyInfo::value("What", InType::UNICODESTRING, OutType::NULL),
        ]);
        info.event_message = Some(message.to_string());
        let mut data = utf16z(first);
        data.extend(utf16z(second));
        (info, record(data))
    }

    fn settings() -> EnumeratorSettings {
        EnumeratorSettings::new().timezone_bias_minutes(0)
    }

    fn enumerator<'a>(
        callbacks: &'a DefaultCallbacks,
        rec: &'a EventRecord,
        info: EventInfo,
    ) -> EtwEnumerator<'a> {
        let mut e = EtwEnumerator::with_settings(callbacks, settings()).unwrap();
        e.start_event_with_event_info(rec, Arc::new(info)).unwrap();
        e
    }

    #[test]
    fn test_event_as_json() {
        let callbacks = DefaultCallbacks::new();
        let (info, rec) = count_and_data();
        let mut e = enumerator(&callbacks, &rec, info);

        assert_eq!(
            e.format_current_event_as_json(None, JsonSuffixFlags::empty())
                .unwrap(),
            r#"{"Count":3,"Data":[1,2,3]}"#
        );

        // Events without a message fall back to JSON.
        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::empty()).unwrap(),
            r#"{"Count":3,"Data":[1,2,3]}"#
        );
    }

    #[test]
    fn test_json_escapes_strings() {
        let callbacks = DefaultCallbacks::new();
        let rec = record(b"a\"b\x01\0".to_vec());
        let mut e = enumerator(
            &callbacks,
            &rec,
            info(vec![PropertyInfo::value("S", InType::ANSISTRING, OutType::NULL)]),
        );

        assert_eq!(
            e.format_current_event_as_json(None, JsonSuffixFlags::empty())
                .unwrap(),
            r#"{"S":"a\"b\u0001"}"#
        );
    }

    #[test]
    fn test_json_meta_suffix() {
        let callbacks = DefaultCallbacks::new();
        let (info, mut rec) = count_and_data();
        rec.header.descriptor.keyword = 0x10;
        rec.extended_data.push(ExtendedDataItem {
            ext_type: EXT_TYPE_RELATED_ACTIVITYID,
            data: Guid::new(1, 2, 3, [4; 8]).to_le_bytes().to_vec(),
        });
        let mut e = enumerator(&callbacks, &rec, info);

        let flags = JsonSuffixFlags::PROVIDER
            | JsonSuffixFlags::EVENT
            | JsonSuffixFlags::CPU
            | JsonSuffixFlags::PID
            | JsonSuffixFlags::ID
            | JsonSuffixFlags::VERSION
            | JsonSuffixFlags::LEVEL
            | JsonSuffixFlags::KEYWORDS
            | JsonSuffixFlags::RELATED_ACTIVITY
            | JsonSuffixFlags::KTIME;
        assert_eq!(
            e.format_current_event_as_json(None, flags).unwrap(),
            concat!(
                r#"{"Count":3,"Data":[1,2,3],"meta":{"#,
                r#""provider":"12345678-9ABC-DEF0-0102-030405060708","event":"7v0","cpu":3,"#,
                r#""pid":26,"id":7,"level":4,"keywords":"0x10","#,
                r#""relatedActivity":"00000001-0002-0003-0404-040404040404"}}"#
            )
        );
    }

    #[test]
    fn test_json_meta_time() {
        let callbacks = DefaultCallbacks::new();
        let (info, mut rec) = count_and_data();
        rec.header.timestamp = 131_670_158_186_676_037;
        let mut e = enumerator(&callbacks, &rec, info);

        assert_eq!(
            e.format_current_event_as_json(Some("%7 "), JsonSuffixFlags::TIME)
                .unwrap(),
            r#"0 {"Count":3,"Data":[1,2,3],"meta":{"time":"2018-04-01T00:23:38.6676037Z"}}"#
        );
    }

    #[test]
    fn test_item_json_with_spaces() {
        let callbacks = DefaultCallbacks::new();
        let (info, rec) = count_and_data();
        let mut e = enumerator(&callbacks, &rec, info);

        assert_eq!(
            e.format_current_item_as_json_and_move_next_sibling(
                JsonItemFlags::NAME | JsonItemFlags::SPACE
            )
            .unwrap(),
            r#""Count": 3, "Data": [1, 2, 3]"#
        );
        assert_eq!(e.state(), EnumeratorState::AfterLastItem);

        e.reset().unwrap();
        assert!(e.move_next());
        assert!(e.move_next());
        assert_eq!(
            e.format_current_item_as_json_and_move_next_sibling(JsonItemFlags::empty())
                .unwrap(),
            "[1,2,3]"
        );
        assert_eq!(e.state(), EnumeratorState::AfterLastItem);
    }

    #[test]
    fn test_message_expansion() {
        let callbacks = DefaultCallbacks::new();
        let (info, rec) = two_strings("%1 said %2 ", "Alice", "hi");
        let mut e = enumerator(&callbacks, &rec, info);

        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
            "Alice said hi"
        );
        assert_eq!(
            e.format_current_event_with_message(None, "[%2] ").unwrap(),
            "[hi] "
        );
    }

    #[test]
    fn test_values_expand_recursively() {
        let callbacks = DefaultCallbacks::new();
        let (info, rec) = two_strings("<%1>", "x%2y", "Z");
        let mut e = enumerator(&callbacks, &rec, info);
        assert_eq!(e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(), "<xZy>");

        // `!S!` turns recursion off for the item.
        assert_eq!(
            e.format_current_event_with_message(None, "<%1!S!>").unwrap(),
            "<x%2y>"
        );
    }

    #[test]
    fn test_self_reference_emits_placeholder() {
        let callbacks = DefaultCallbacks::new();
        let (info, rec) = two_strings("<%1>", "%1", "");
        let mut e = enumerator(&callbacks, &rec, info);
        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
            "<[IndexRecursion:%1]>"
        );
    }

    #[test]
    fn test_index_out_of_range() {
        let callbacks = DefaultCallbacks::new();
        let (info, rec) = two_strings("%0 %3 %2", "a", "b");
        let mut e = enumerator(&callbacks, &rec, info);
        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
            "[IndexOutOfRange:%0] [IndexOutOfRange:%3] b"
        );
    }

    #[test]
    fn test_percent_sequences() {
        let callbacks = DefaultCallbacks::new();
        let (info, rec) = two_strings("", "a", "b");
        let mut e = enumerator(&callbacks, &rec, info);
        assert_eq!(
            e.format_current_event_with_message(None, "100% %%%1 %x %!a!").unwrap(),
            "100% %%a %x %!a!"
        );
    }

    #[test]
    fn test_parameter_messages() {
        let mut callbacks = DefaultCallbacks::new();
        callbacks.register_parameter_message(7, "seven %2\r\n");
        let (info, rec) = two_strings("%%7!", "a", "b");
        let mut e = enumerator(&callbacks, &rec, info);
        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
            "seven b!"
        );
    }

    #[test]
    fn test_self_referential_parameter_message_terminates() {
        let mut callbacks = DefaultCallbacks::new();
        callbacks.register_parameter_message(1, "[%%1]");
        let (info, rec) = two_strings("%%1", "a", "b");
        let mut e = enumerator(&callbacks, &rec, info);
        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
            "[[[[%%1]]]]"
        );
    }

    /// Knows no parameter messages, but unlike a missing message id this is not fatal.
    struct NoParameterMessages;

    impl EnumeratorCallbacks for NoParameterMessages {
        fn get_parameter_message(&self, _record: &EventRecord, _message_id: u32) -> Result<String> {
            Err(EtwError::NotFound)
        }
    }

    #[test]
    fn test_unknown_parameter_message_is_left_as_written() {
        let callbacks = NoParameterMessages;
        let (info, rec) = two_strings("%1 %%9 %2", "a", "b");
        let mut e = EtwEnumerator::with_settings(&callbacks, settings()).unwrap();
        e.start_event_with_event_info(&rec, Arc::new(info)).unwrap();

        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
            "a %%9 b"
        );
        assert_eq!(
            e.format_current_event_with_message(None, "x %%9 y %1").unwrap(),
            "x %%9 y a"
        );
    }

    #[test]
    fn test_missing_parameter_message_falls_back_to_json() {
        let callbacks = DefaultCallbacks::new();
        let (mut info, rec) = count_and_data();
        info.event_message = Some("count %1 %%5".to_string());
        let mut e = enumerator(&callbacks, &rec, info);

        assert_eq!(
            e.format_current_event(Some("P "), JsonSuffixFlags::empty())
                .unwrap(),
            r#"P {"Count":3,"Data":[1,2,3]}"#
        );
        assert_eq!(
            e.format_current_event_with_message(None, "%%5"),
            Err(EtwError::MessageIdNotFound { message_id: 5 })
        );
    }

    #[test]
    fn test_printf_clauses() {
        let callbacks = DefaultCallbacks::new();
        let mut data = 255u32.to_le_bytes().to_vec();
        data.push(b'A');
        data.extend_from_slice(&(-2i16).to_le_bytes());
        data.extend_from_slice(&1.5f64.to_le_bytes());
        let rec = record(data);
        let mut e = enumerator(
            &callbacks,
            &rec,
            info(vec![
                PropertyInfo::value("N", InType::UINT32, OutType::NULL),
                PropertyInfo::value("C", InType::ANSICHAR, OutType::NULL),
                PropertyInfo::value("S", InType::INT16, OutType::NULL),
                PropertyInfo::value("D", InType::DOUBLE, OutType::NULL),
            ]),
        );

        assert_eq!(
            e.format_current_event_with_message(None, "%1!08x!|%1!-5d!|%1!5s!|%2!c!|%2!u!")
                .unwrap(),
            "000000ff|255  |  255|A|65"
        );
        assert_eq!(
            e.format_current_event_with_message(None, "%3!d!|%3!u!|%4!.2f!|%4!d!")
                .unwrap(),
            "-2|65534|1.50|1.5"
        );
        // An unparseable clause is left in place.
        assert_eq!(
            e.format_current_event_with_message(None, "%1!q!").unwrap(),
            "255!q!"
        );
    }

    #[test]
    fn test_complex_property_renders_as_json() {
        let callbacks = DefaultCallbacks::new();
        let rec = record(vec![1, 2, 3, 4, 9]);
        let mut e = enumerator(
            &callbacks,
            &rec,
            EventInfo {
                properties: vec![
                    PropertyInfo::structure("Pairs", 2, 2).with_count(PropertyParam::Fixed(2)),
                    PropertyInfo::value("Tail", InType::UINT8, OutType::NULL),
                    PropertyInfo::value("A", InType::UINT8, OutType::NULL),
                    PropertyInfo::value("B", InType::UINT8, OutType::NULL),
                ],
                top_level_property_count: 2,
                event_message: Some("%2 %1 %2".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
            r#"9 [{"A":1,"B":2},{"A":3,"B":4}] 9"#
        );
        assert_eq!(
            e.format_current_event_as_json(None, JsonSuffixFlags::empty())
                .unwrap(),
            r#"{"Pairs":[{"A":1,"B":2},{"A":3,"B":4}],"Tail":9}"#
        );
    }

    #[test]
    fn test_prefix() {
        let callbacks = DefaultCallbacks::new();
        let (mut info, mut rec) = count_and_data();
        rec.header.timestamp = 131_670_158_186_676_037;
        info.provider_name = Some("MyProvider".to_string());
        info.event_name = Some("Start".to_string());
        let mut e = enumerator(&callbacks, &rec, info);

        assert_eq!(
            e.format_current_event_prefix("[%9]%8!04X!.%3::%1 %2 %5 %7 ").unwrap(),
            "[3]001A.002B::MyProvider Start 00000000 0 "
        );
        assert_eq!(
            e.format_current_event_prefix("%4").unwrap(),
            "2018-04-01T00:23:38.6676037Z"
        );
        assert_eq!(
            e.format_current_event_prefix("%10").unwrap(),
            "[IndexOutOfRange:%10]"
        );
    }

    #[test]
    fn test_variables() {
        let callbacks = DefaultCallbacks::new();
        let (mut info, rec) = count_and_data();
        info.event_attributes = Some("FILE=a.c;LINE=12;MJ=Core".to_string());
        info.tags = 0x2a;
        let mut e = enumerator(&callbacks, &rec, info);

        assert_eq!(
            e.format_current_event_with_message(
                None,
                "%!PID!-%!TID! %!BANG!%!PCT! %!UNKNOWN! %!lower! %!FILE!:%!LINE! %!MJ!%!MN!"
            )
            .unwrap(),
            "001A-002B !% %!UNKNOWN! %!lower! a.c:12 Core"
        );
        assert_eq!(
            e.format_current_event_with_message(None, "%!CPU! %!SEQ! %!TAGS! %!EVENT! %!LEVEL!")
                .unwrap(),
            "3 0 0x2A a.c12 4"
        );
        assert_eq!(
            e.format_current_event_with_message(None, "%!ATTRIBS!").unwrap(),
            "FILE=a.c;LINE=12;MJ=Core"
        );
    }

    #[test]
    fn test_name_fallbacks() {
        let callbacks = DefaultCallbacks::new();
        let (mut info, mut rec) = count_and_data();
        rec.header.descriptor.keyword = 0xF0;
        info.provider_name = Some(format!("MyProv_{}", provider().to_name_suffix()));
        let mut e = enumerator(&callbacks, &rec, info.clone());

        assert_eq!(e.format_current_provider_name().unwrap(), "MyProv");
        assert_eq!(e.format_current_event_name().unwrap(), "7v0");
        assert_eq!(e.format_current_keywords_name().unwrap(), "0xF0");
        assert_eq!(e.format_current_level_name().unwrap(), "4");
        assert_eq!(e.format_current_function_name().unwrap(), "");

        info.provider_name = None;
        info.keywords_name = Some("Network  ".to_string());
        info.level_name = Some("Info ".to_string());
        info.event_attributes = Some("FUNC=main".to_string());
        e.start_event_with_event_info(&rec, Arc::new(info)).unwrap();

        assert_eq!(
            e.format_current_provider_name().unwrap(),
            "12345678-9ABC-DEF0-0102-030405060708"
        );
        assert_eq!(e.format_current_keywords_name().unwrap(), "Network");
        assert_eq!(e.format_current_level_name().unwrap(), "Info");
        assert_eq!(e.format_current_function_name().unwrap(), "main");
    }

    #[test]
    fn test_function_name_from_property() {
        let callbacks = DefaultCallbacks::new();
        let rec = record(b"DoWork\0rest".to_vec());
        let mut e = enumerator(
            &callbacks,
            &rec,
            info(vec![PropertyInfo::value(
                "!FUNC!",
                InType::ANSISTRING,
                OutType::NULL,
            )]),
        );
        assert_eq!(e.format_current_function_name().unwrap(), "DoWork");
    }

    #[test]
    fn test_values_and_maps() {
        let mut callbacks = DefaultCallbacks::new();
        let map = MapInfo {
            name: "Colors".to_string(),
            flags: MapFlags::MANIFEST_VALUEMAP,
            entries: vec![MapEntry {
                value: 1,
                output: "Red".to_string(),
            }],
        };
        callbacks.register_map(map.clone());

        let rec = record(vec![1, 0, 0, 0, 2, 0, 0, 0]);
        let mut e = enumerator(
            &callbacks,
            &rec,
            info(vec![
                PropertyInfo::value("Color", InType::UINT32, OutType::NULL).with_map_name("Colors"),
                PropertyInfo::value("Other", InType::UINT32, OutType::NULL).with_map_name("Missing"),
            ]),
        );

        assert_eq!(e.format_current_value(), Err(EtwError::InvalidState));
        assert!(e.move_next());
        assert_eq!(e.format_current_value().unwrap(), "1(Red)");
        assert!(e.move_next());
        assert_eq!(e.format_current_value().unwrap(), "2");

        assert_eq!(
            e.format_value(&[127, 0, 0, 1], InType::UINT32, OutType::IPV4)
                .unwrap(),
            "127.0.0.1"
        );
        assert_eq!(
            e.format_value_with_map_info(&[1, 0, 0, 0], InType::UINT32, OutType::NULL, Some(&map))
                .unwrap(),
            "1(Red)"
        );
        assert_eq!(
            e.format_value_with_map_name(
                &[1, 0, 0, 0],
                InType::UINT32,
                OutType::NULL,
                &rec,
                Some("Colors")
            )
            .unwrap(),
            "1(Red)"
        );

        e.reset().unwrap();
        assert_eq!(
            e.format_current_event_as_json(None, JsonSuffixFlags::empty())
                .unwrap(),
            r#"{"Color":"1(Red)","Other":2}"#
        );
    }

    #[test]
    fn test_requires_an_event() {
        let callbacks = DefaultCallbacks::new();
        let mut e = EtwEnumerator::new(&callbacks);
        assert_eq!(
            e.format_current_event(None, JsonSuffixFlags::DEFAULT),
            Err(EtwError::InvalidState)
        );
        assert_eq!(e.format_current_provider_name(), Err(EtwError::InvalidState));
    }
}
