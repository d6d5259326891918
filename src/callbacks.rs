//! Collaborators the enumerator calls out to.
//!
//! [`EnumeratorCallbacks`] is the seam between the decoder and whatever supplies decoding
//! information (an OS trace-decoding service, a manifest cache, a test fixture). Every method
//! has a default, so an implementation only overrides what it can actually provide.
//!
//! [`DefaultCallbacks`] is the zero-configuration implementation: an in-memory registry that
//! is populated up front and then handed to the enumerator explicitly.

use std::fmt::Write;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use log::trace;
use serde::{Deserialize, Serialize};

use crate::enumerator::EventCategory;
use crate::err::{EtwError, Result};
use crate::guid::Guid;
use crate::model::{DecodingSource, EventHeaderFlags, EventInfo, EventRecord, MapFlags, MapInfo};

/// Which family of system result codes a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCodeDomain {
    Win32,
    HResult,
    NtStatus,
}

impl ResultCodeDomain {
    pub fn label(self) -> &'static str {
        match self {
            ResultCodeDomain::Win32 => "WIN",
            ResultCodeDomain::HResult => "HR",
            ResultCodeDomain::NtStatus => "NT",
        }
    }
}

/// How the numeric part of a map or result-code rendering should be printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnderlyingType {
    Hexadecimal,
    Unsigned,
}

pub trait EnumeratorCallbacks {
    /// Invoked by `preview_event` after the enumerator has classified the event.
    ///
    /// Returning an error makes `preview_event` report [`EventCategory::Error`].
    fn on_preview_event(&self, _record: &EventRecord, _category: EventCategory) -> Result<()> {
        Ok(())
    }

    /// Looks up the descriptor for `record`.
    fn get_event_information(&self, _record: &EventRecord) -> Result<Arc<EventInfo>> {
        Err(EtwError::NotFound)
    }

    /// Looks up map metadata. `NotFound` makes the value render as a plain integer.
    fn get_event_map_information(
        &self,
        _record: &EventRecord,
        _map_name: &str,
    ) -> Result<Arc<MapInfo>> {
        Err(EtwError::NotFound)
    }

    /// Resolves a `%%N` parameter message.
    ///
    /// `MessageIdNotFound` makes `format_current_event` fall back to JSON.
    fn get_parameter_message(&self, _record: &EventRecord, message_id: u32) -> Result<String> {
        Err(EtwError::MessageIdNotFound { message_id })
    }

    /// Appends a description of a result code. `NotFound` makes it render as an integer.
    fn format_result_code_value(
        &self,
        domain: ResultCodeDomain,
        value_type: UnderlyingType,
        value: u32,
        out: &mut String,
    ) -> Result<()> {
        format_result_code(domain, value_type, value, None, out);
        Ok(())
    }

    /// Appends a map rendering of `value`. `NotFound` makes it render as an integer.
    fn format_map_value(
        &self,
        map: &MapInfo,
        value_type: UnderlyingType,
        value: u32,
        out: &mut String,
    ) -> Result<()> {
        format_map_value(map, value_type, value, out)
    }
}

impl<T: EnumeratorCallbacks + ?Sized> EnumeratorCallbacks for &T {
    fn on_preview_event(&self, record: &EventRecord, category: EventCategory) -> Result<()> {
        (**self).on_preview_event(record, category)
    }

    fn get_event_information(&self, record: &EventRecord) -> Result<Arc<EventInfo>> {
        (**self).get_event_information(record)
    }

    fn get_event_map_information(&self, record: &EventRecord, map_name: &str) -> Result<Arc<MapInfo>> {
        (**self).get_event_map_information(record, map_name)
    }

    fn get_parameter_message(&self, record: &EventRecord, message_id: u32) -> Result<String> {
        (**self).get_parameter_message(record, message_id)
    }

    fn format_result_code_value(
        &self,
        domain: ResultCodeDomain,
        value_type: UnderlyingType,
        value: u32,
        out: &mut String,
    ) -> Result<()> {
        (**self).format_result_code_value(domain, value_type, value, out)
    }

    fn format_map_value(
        &self,
        map: &MapInfo,
        value_type: UnderlyingType,
        value: u32,
        out: &mut String,
    ) -> Result<()> {
        (**self).format_map_value(map, value_type, value, out)
    }
}

fn write_number(out: &mut String, value_type: UnderlyingType, value: u32) {
    // Writing to a `String` cannot fail.
    let _ = match value_type {
        UnderlyingType::Hexadecimal => write!(out, "0x{:X}", value),
        UnderlyingType::Unsigned => write!(out, "{}", value),
    };
}

fn trim_map_string(s: &str) -> &str {
    s.trim_end_matches(' ')
}

/// The stock map rendering.
///
/// - Value maps: `5(Name)` or `5(??)` when no entry matches.
/// - Bit maps: `5[A,B]`, `5[A,0x2]` for leftover bits, `0[]` and `5[??]` when nothing matches.
///
/// Maps of any other kind report `NotFound`.
pub fn format_map_value(
    map: &MapInfo,
    value_type: UnderlyingType,
    value: u32,
    out: &mut String,
) -> Result<()> {
    let kind = map.flags & !MapFlags::WBEM_NO_MAP;

    if kind == MapFlags::MANIFEST_VALUEMAP || kind == MapFlags::WBEM_VALUEMAP {
        let found = if map.flags.contains(MapFlags::WBEM_NO_MAP) {
            map.entries.get(value as usize)
        } else {
            map.entries.iter().find(|e| e.value == value)
        };

        write_number(out, value_type, value);
        out.push('(');
        out.push_str(found.map_or("??", |e| trim_map_string(&e.output)));
        out.push(')');
        return Ok(());
    }

    if kind == MapFlags::MANIFEST_BITMAP
        || kind == MapFlags::WBEM_BITMAP
        || kind == (MapFlags::WBEM_VALUEMAP | MapFlags::WBEM_FLAG)
    {
        let mut matched_bits = 0u32;
        let mut any = false;
        for entry in &map.entries {
            let mask = entry.value;
            if value & mask == mask && (mask != 0 || value == 0) {
                if any {
                    out.push(',');
                } else {
                    write_number(out, value_type, value);
                    out.push('[');
                    any = true;
                }
                out.push_str(trim_map_string(&entry.output));
                matched_bits |= mask;
            }
        }

        if !any {
            write_number(out, value_type, value);
            out.push_str(if value == 0 { "[]" } else { "[??]" });
        } else if matched_bits != value {
            let _ = write!(out, ",0x{:X}]", value ^ matched_bits);
        } else {
            out.push(']');
        }
        return Ok(());
    }

    Err(EtwError::NotFound)
}

/// Trims a system message down to its first line, unwrapping a leading `{...}` title.
fn trim_result_message(message: &str) -> &str {
    if let Some(rest) = message.strip_prefix('{') {
        let end = rest.find(['}', '\r', '\n']).unwrap_or(rest.len());
        if rest[end..].starts_with('}') {
            return &rest[..end];
        }
        return &message[..end + 1];
    }

    let end = message.find(['\r', '\n']).unwrap_or(message.len());
    &message[..end]
}

/// The stock result-code rendering: `0x80070002(HR=message)` or `2(WIN=??)`.
pub fn format_result_code(
    domain: ResultCodeDomain,
    value_type: UnderlyingType,
    value: u32,
    message: Option<&str>,
    out: &mut String,
) {
    write_number(out, value_type, value);
    out.push('(');
    out.push_str(domain.label());
    out.push('=');
    out.push_str(message.map_or("??", trim_result_message));
    out.push(')');
}

const FACILITY_NT_BIT: u32 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EventKey {
    provider: Guid,
    id: u16,
    version: u8,
    // Only meaningful for classic (WBEM) events, where the opcode selects the event type.
    opcode: u8,
}

/// An in-memory registry of decoding information.
#[derive(Debug, Clone, Default)]
pub struct DefaultCallbacks {
    events: HashMap<EventKey, Arc<EventInfo>, RandomState>,
    maps: HashMap<String, Arc<MapInfo>, RandomState>,
    parameter_messages: HashMap<u32, String, RandomState>,
    result_messages: HashMap<(ResultCodeDomain, u32), String, RandomState>,
}

impl DefaultCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor under its provider GUID, event id, and version.
    pub fn register_event(&mut self, info: EventInfo) -> Arc<EventInfo> {
        let opcode = if info.decoding_source == DecodingSource::Wbem {
            info.descriptor.opcode
        } else {
            0
        };
        let key = EventKey {
            provider: info.provider_guid,
            id: info.descriptor.id,
            version: info.descriptor.version,
            opcode,
        };
        let info = Arc::new(info);
        self.events.insert(key, Arc::clone(&info));
        info
    }

    pub fn register_map(&mut self, map: MapInfo) {
        self.maps.insert(map.name.clone(), Arc::new(map));
    }

    pub fn register_parameter_message(&mut self, message_id: u32, message: impl Into<String>) {
        self.parameter_messages.insert(message_id, message.into());
    }

    pub fn register_result_message(
        &mut self,
        domain: ResultCodeDomain,
        code: u32,
        message: impl Into<String>,
    ) {
        self.result_messages.insert((domain, code), message.into());
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    fn result_message(&self, domain: ResultCodeDomain, value: u32) -> Option<&str> {
        let key = match domain {
            ResultCodeDomain::HResult if value & FACILITY_NT_BIT != 0 => {
                (ResultCodeDomain::NtStatus, value & !FACILITY_NT_BIT)
            }
            _ => (domain, value),
        };
        self.result_messages.get(&key).map(String::as_str)
    }
}

impl EnumeratorCallbacks for DefaultCallbacks {
    fn get_event_information(&self, record: &EventRecord) -> Result<Arc<EventInfo>> {
        let header = &record.header;
        let opcode = if header.flags.contains(EventHeaderFlags::CLASSIC_HEADER) {
            header.descriptor.opcode
        } else {
            0
        };
        let key = EventKey {
            provider: header.provider_id,
            id: header.descriptor.id,
            version: header.descriptor.version,
            opcode,
        };

        match self.events.get(&key) {
            Some(info) => Ok(Arc::clone(info)),
            None => {
                trace!(
                    "no descriptor registered for {} id {} v{}",
                    key.provider, key.id, key.version
                );
                Err(EtwError::NotFound)
            }
        }
    }

    fn get_event_map_information(&self, _record: &EventRecord, map_name: &str) -> Result<Arc<MapInfo>> {
        self.maps.get(map_name).cloned().ok_or(EtwError::NotFound)
    }

    fn get_parameter_message(&self, _record: &EventRecord, message_id: u32) -> Result<String> {
        self.parameter_messages
            .get(&message_id)
            .cloned()
            .ok_or(EtwError::MessageIdNotFound { message_id })
    }

    fn format_result_code_value(
        &self,
        domain: ResultCodeDomain,
        value_type: UnderlyingType,
        value: u32,
        out: &mut String,
    ) -> Result<()> {
        format_result_code(domain, value_type, value, self.result_message(domain, value), out);
        Ok(())
    }
}
