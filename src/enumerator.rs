//! The decoding state machine.
//!
//! An [`EtwEnumerator`] walks one event payload at a time according to the event's
//! descriptor. It is a pull-style cursor: every call to [`EtwEnumerator::move_next`] produces
//! the next item (a value, the beginning or end of an array, or the beginning or end of a
//! struct) in declaration order, depth first.
//!
//! Nesting is tracked with an explicit stack of saved frames, so arbitrarily deep structs
//! never recurse. Integer properties that may later supply a length or a count are
//! remembered as they are decoded, which lets a single forward scan resolve every
//! forward-referenced size.
//!
//! ```text
//! Count: UINT32 = 3, Data: UINT8[Count]
//!
//! BeforeFirstItem -> Value(Count) -> ArrayBegin(Data) -> Value(Data[0]) -> Value(Data[1])
//!                 -> Value(Data[2]) -> ArrayEnd(Data) -> AfterLastItem
//! ```

use std::sync::Arc;

use log::{trace, warn};
use serde::Serialize;

use crate::attributes::{EventAttribute, find_event_attribute, split_event_attributes};
use crate::buffer::GrowableBuffer;
use crate::callbacks::{DefaultCallbacks, EnumeratorCallbacks};
use crate::err::{EtwError, Result};
use crate::guid::{EVENT_TRACE_GUID, Guid};
use crate::model::{
    DecodingSource, EXT_TYPE_EVENT_SCHEMA_TL, EventHeaderFlags, EventInfo, EventRecord, InType,
    OutType, PropertyFlags, PropertyInfo, PropertyKind, PropertyParam, TemplateFlags,
};
use crate::settings::{self, EnumeratorSettings, TimestampFormat};
use crate::utils::bytes::{read_u16_be, read_u16_le, read_u32_le, utf16_nul_position};
use crate::value_render::adjust_file_time;

/// Value of a remembered integer that has not been decoded yet.
const NOT_SEEN: u16 = 0xFFFF;

/// Set in [`ItemInfo::tags`] when the item belongs to an array.
pub const ITEM_TAG_IS_ARRAY: u32 = 0x1000_0000;

const TRACELOGGING_CHANNEL: u8 = 11;
const EVENT_TRACE_TYPE_INFO: u8 = 0;
/// Size of the trace header payload and the offset of its timer resolution.
const LOGFILE_HEADER_MIN_SIZE: usize = 28;
const LOGFILE_HEADER_TIMER_RESOLUTION_OFFSET: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EnumeratorState {
    /// No event is loaded.
    None,
    /// Decoding failed. See [`EtwEnumerator::last_error`].
    Error,
    AfterLastItem,
    BeforeFirstItem,
    Value,
    ArrayBegin,
    ArrayEnd,
    StructBegin,
    StructEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    None,
    Error,
    AfterLastItem,
    BeforeFirstItem,
    ValueScalar,
    ValueSimpleArrayElement,
    ValueComplexArrayElement,
    ArrayBegin,
    ArrayEnd,
    StructBegin,
    StructEnd,
}

/// Family of an event, as determined from its header alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventCategory {
    /// The preview callback failed.
    Error,
    /// WPP events decoded with TMF files. Not supported by the enumerator.
    TmfWpp,
    /// Classic events described by MOF classes.
    Wbem,
    TraceLogging,
    Manifest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StackEntry {
    property_index: u16,
    property_end: u16,
    array_index: u16,
    array_count: u16,
    is_struct: bool,
    is_array: bool,
}

/// The current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo<'e> {
    /// Property name, or `""` for unnamed properties.
    pub name: &'e str,
    /// Property tags, plus [`ITEM_TAG_IS_ARRAY`] for arrays and array elements.
    pub tags: u32,
    /// Canonical input type. Counted and non-terminated strings report `UNICODESTRING` or
    /// `ANSISTRING`, hex dumps report `BINARY`, WBEM SIDs report `SID`, structs report `NULL`.
    pub in_type: InType,
    pub out_type: OutType,
    pub array_index: u16,
    pub array_count: u16,
    /// Size of one element for fixed-size types, otherwise 0.
    pub element_size: u16,
    /// The value's bytes, with any length prefix or header removed.
    pub data: &'e [u8],
    pub map_name: Option<&'e str>,
}

/// The current item as it is laid out in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawItemInfo<'e> {
    pub raw_in_type: InType,
    pub flags: PropertyFlags,
    pub raw_data: &'e [u8],
    pub custom_schema: Option<&'e [u8]>,
}

/// Descriptive strings and identifiers for the current event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDetails<'e> {
    pub name: Option<&'e str>,
    pub tags: u32,
    pub binary_xml: Option<&'e [u8]>,
    pub decoding_source: DecodingSource,
    pub provider_name: Option<&'e str>,
    pub level_name: Option<&'e str>,
    pub channel_name: Option<&'e str>,
    pub keywords_name: Option<&'e str>,
    pub task_name: Option<&'e str>,
    pub opcode_name: Option<&'e str>,
    pub event_message: Option<&'e str>,
    pub provider_message: Option<&'e str>,
    pub event_attributes: Option<&'e str>,
    pub activity_id_name: Option<&'e str>,
    pub related_activity_id_name: Option<&'e str>,
    /// GUID used to look up decoding information.
    pub decode_guid: Guid,
    /// GUID used to enable the provider.
    pub control_guid: Guid,
    pub event_guid: Option<Guid>,
}

/// Classifies an event by its header flags, channel, and extended data.
pub fn get_event_category(record: &EventRecord) -> EventCategory {
    let flags = record.header.flags;
    if flags.contains(EventHeaderFlags::TRACE_MESSAGE) {
        EventCategory::TmfWpp
    } else if flags.contains(EventHeaderFlags::CLASSIC_HEADER) {
        EventCategory::Wbem
    } else if record.header.descriptor.channel == TRACELOGGING_CHANNEL
        || record.extended_item(EXT_TYPE_EVENT_SCHEMA_TL).is_some()
    {
        EventCategory::TraceLogging
    } else {
        EventCategory::Manifest
    }
}

/// Decodes event payloads into a sequence of typed items.
///
/// One enumerator handles one event at a time. Items returned by [`item_info`] and the other
/// accessors borrow from the enumerator and are invalidated by the next call that moves it.
///
/// [`item_info`]: EtwEnumerator::item_info
pub struct EtwEnumerator<'a, C: EnumeratorCallbacks + ?Sized = DefaultCallbacks> {
    pub(crate) callbacks: &'a C,
    pub(crate) settings: EnumeratorSettings,
    ms_per_tick: u32,

    pub(crate) record: Option<&'a EventRecord>,
    pub(crate) info: Option<Arc<EventInfo>>,

    state: EnumeratorState,
    sub_state: SubState,
    last_error: Option<EtwError>,

    // Offsets into the record's user data.
    data_next: usize,
    cooked_offset: usize,
    cooked_len: usize,
    raw_len: usize,

    cooked_in_type: InType,
    element_size: u16,

    stack_top: StackEntry,
    stack: GrowableBuffer<StackEntry, 8>,
    integer_values: GrowableBuffer<u16, 32>,

    /// Scratch space for the formatting functions.
    pub(crate) output: String,
}

impl<'a, C: EnumeratorCallbacks + ?Sized> EtwEnumerator<'a, C> {
    pub fn new(callbacks: &'a C) -> Self {
        Self::build(callbacks, EnumeratorSettings::default())
    }

    /// Creates an enumerator with explicit settings. Fails if the settings are out of range.
    pub fn with_settings(callbacks: &'a C, settings: EnumeratorSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self::build(callbacks, settings))
    }

    fn build(callbacks: &'a C, settings: EnumeratorSettings) -> Self {
        let ms_per_tick = settings.get_timer_resolution() / 10000;
        EtwEnumerator {
            callbacks,
            settings,
            ms_per_tick,
            record: None,
            info: None,
            state: EnumeratorState::None,
            sub_state: SubState::None,
            last_error: None,
            data_next: 0,
            cooked_offset: 0,
            cooked_len: 0,
            raw_len: 0,
            cooked_in_type: InType::NULL,
            element_size: 0,
            stack_top: StackEntry::default(),
            stack: GrowableBuffer::new(),
            integer_values: GrowableBuffer::new(),
            output: String::new(),
        }
    }

    pub fn state(&self) -> EnumeratorState {
        self.state
    }

    /// The error that put the enumerator in the `None` or `Error` state, if any.
    pub fn last_error(&self) -> Option<&EtwError> {
        self.last_error.as_ref()
    }

    pub fn settings(&self) -> &EnumeratorSettings {
        &self.settings
    }

    /// Unloads the current event.
    pub fn clear(&mut self) {
        self.set_none_state(None);
    }

    /// Classifies `record` and runs the preview hook.
    ///
    /// For the trace header event this also picks up the session's timer resolution, which
    /// is needed to convert kernel and user times to milliseconds.
    pub fn preview_event(&mut self, record: &EventRecord) -> EventCategory {
        let category = get_event_category(record);

        if category == EventCategory::Wbem
            && record.header.provider_id == EVENT_TRACE_GUID
            && record.header.descriptor.opcode == EVENT_TRACE_TYPE_INFO
            && record.user_data.len() >= LOGFILE_HEADER_MIN_SIZE
        {
            if let Some(resolution) =
                read_u32_le(&record.user_data, LOGFILE_HEADER_TIMER_RESOLUTION_OFFSET)
            {
                trace!("trace header reports timer resolution {}", resolution);
                self.set_timer_resolution(resolution);
            }
        }

        match self.callbacks.on_preview_event(record, category) {
            Ok(()) => {
                self.last_error = None;
                category
            }
            Err(e) => {
                self.last_error = Some(e);
                EventCategory::Error
            }
        }
    }

    /// Looks up the descriptor for `record` and positions before its first item.
    pub fn start_event(&mut self, record: &'a EventRecord) -> Result<()> {
        match self.callbacks.get_event_information(record) {
            Ok(info) => self.start_event_with_event_info(record, info),
            Err(e) => {
                warn!(
                    "no decoding information for {} event {}: {}",
                    record.header.provider_id, record.header.descriptor.id, e
                );
                self.set_none_state(Some(e.clone()));
                Err(e)
            }
        }
    }

    /// Positions before the first item of `record`, decoded with `info`.
    pub fn start_event_with_event_info(
        &mut self,
        record: &'a EventRecord,
        info: Arc<EventInfo>,
    ) -> Result<()> {
        if info.decoding_source == DecodingSource::Wpp {
            self.set_none_state(Some(EtwError::UnsupportedFormat));
            return Err(EtwError::UnsupportedFormat);
        }

        if let Err(e) = self.integer_values.resize(info.properties.len(), NOT_SEEN) {
            self.set_none_state(Some(e.clone()));
            return Err(e);
        }
        self.integer_values.fill(NOT_SEEN);

        self.record = Some(record);
        self.info = Some(info);
        self.reset_impl();
        Ok(())
    }

    /// Rewinds to before the first item of the current event.
    pub fn reset(&mut self) -> Result<()> {
        if self.state == EnumeratorState::None {
            return Err(EtwError::InvalidState);
        }
        self.reset_impl();
        Ok(())
    }

    fn reset_impl(&mut self) {
        let top_level = self
            .info
            .as_ref()
            .map_or(0, |info| info.top_level_property_count);

        self.data_next = 0;
        self.stack.clear();
        self.stack_top = StackEntry {
            property_index: 0,
            property_end: top_level,
            ..StackEntry::default()
        };
        self.set_end_state(EnumeratorState::BeforeFirstItem, SubState::BeforeFirstItem);
        self.last_error = None;
    }

    /// Moves to the next item. Returns false at the end of the event or on error.
    pub fn move_next(&mut self) -> bool {
        let moved = match self.sub_state {
            SubState::None | SubState::Error | SubState::AfterLastItem => {
                self.set_error_state(EtwError::InvalidState)
            }

            SubState::BeforeFirstItem => self.next_property(),

            SubState::ValueScalar => {
                self.data_next += self.raw_len;
                self.stack_top.property_index += 1;
                self.next_property()
            }

            SubState::ValueSimpleArrayElement => {
                self.data_next += self.raw_len;
                self.stack_top.array_index += 1;
                if self.stack_top.array_index == self.stack_top.array_count {
                    self.set_end_state(EnumeratorState::ArrayEnd, SubState::ArrayEnd);
                } else {
                    // Lengths are unchanged; only the position moves.
                    self.cooked_offset = self.data_next;
                }
                self.last_error = None;
                true
            }

            SubState::ValueComplexArrayElement => {
                self.data_next += self.raw_len;
                self.stack_top.array_index += 1;
                if self.stack_top.array_index == self.stack_top.array_count {
                    self.set_end_state(EnumeratorState::ArrayEnd, SubState::ArrayEnd);
                    self.last_error = None;
                    true
                } else {
                    self.start_value()
                }
            }

            SubState::ArrayBegin => {
                if self.stack_top.array_count == 0 {
                    self.set_end_state(EnumeratorState::ArrayEnd, SubState::ArrayEnd);
                    self.last_error = None;
                    true
                } else if self.element_size != 0 {
                    self.cooked_len = usize::from(self.element_size);
                    self.raw_len = self.cooked_len;
                    self.cooked_offset = self.data_next;
                    self.set_state(EnumeratorState::Value, SubState::ValueSimpleArrayElement);
                    self.last_error = None;
                    true
                } else if !self.stack_top.is_struct {
                    self.set_state(EnumeratorState::Value, SubState::ValueComplexArrayElement);
                    self.start_value()
                } else {
                    self.start_struct();
                    self.last_error = None;
                    true
                }
            }

            SubState::ArrayEnd => {
                self.stack_top.property_index += 1;
                self.next_property()
            }

            SubState::StructBegin => self.enter_struct(),

            SubState::StructEnd => {
                self.stack_top.array_index += 1;
                if self.stack_top.array_index != self.stack_top.array_count {
                    self.start_struct();
                    self.last_error = None;
                    true
                } else if self.stack_top.is_array {
                    self.set_end_state(EnumeratorState::ArrayEnd, SubState::ArrayEnd);
                    self.last_error = None;
                    true
                } else {
                    self.stack_top.property_index += 1;
                    self.next_property()
                }
            }
        };

        trace!(
            "move_next -> {:?} (property {}, offset {})",
            self.state, self.stack_top.property_index, self.data_next
        );
        moved
    }

    /// Moves past the current item and its children, if any.
    ///
    /// At the beginning of an array of fixed-size elements this skips the whole array
    /// without visiting the elements.
    pub fn move_next_sibling(&mut self) -> bool {
        let mut depth: i32 = 0;
        loop {
            let moved = match self.sub_state {
                SubState::ArrayBegin if self.element_size != 0 => {
                    self.data_next +=
                        usize::from(self.element_size) * usize::from(self.stack_top.array_count);
                    self.stack_top.property_index += 1;
                    self.next_property()
                }
                sub_state => {
                    match sub_state {
                        SubState::ArrayEnd | SubState::StructEnd => depth -= 1,
                        SubState::ArrayBegin | SubState::StructBegin => depth += 1,
                        _ => {}
                    }
                    self.move_next()
                }
            };

            if depth <= 0 || !moved {
                return moved;
            }
        }
    }

    /// Details of the current item. `None` unless positioned on an item.
    pub fn item_info(&self) -> Option<ItemInfo<'_>> {
        let (record, info) = self.current_item_context()?;
        let prop = info.properties.get(usize::from(self.stack_top.property_index))?;
        let is_struct = self.stack_top.is_struct;
        let array_tag = if self.stack_top.is_array {
            ITEM_TAG_IS_ARRAY
        } else {
            0
        };

        Some(ItemInfo {
            name: prop.name.as_deref().unwrap_or(""),
            tags: array_tag | prop.tags.unwrap_or(0),
            in_type: self.cooked_in_type,
            out_type: if is_struct {
                OutType::NULL
            } else {
                prop.out_type()
            },
            array_index: self.stack_top.array_index,
            array_count: self.stack_top.array_count,
            element_size: self.element_size,
            data: record
                .user_data
                .get(self.cooked_offset..self.cooked_offset + self.cooked_len)
                .unwrap_or(&[]),
            map_name: if is_struct { None } else { prop.map_name() },
        })
    }

    /// The current item as laid out in the payload, including prefixes and headers.
    pub fn raw_item_info(&self) -> Option<RawItemInfo<'_>> {
        let (record, info) = self.current_item_context()?;
        let prop = info.properties.get(usize::from(self.stack_top.property_index))?;

        Some(RawItemInfo {
            raw_in_type: prop.in_type(),
            flags: prop.flags(),
            raw_data: record
                .user_data
                .get(self.data_next..self.data_next + self.raw_len)
                .unwrap_or(&[]),
            custom_schema: prop.custom_schema(),
        })
    }

    /// Payload bytes not yet consumed.
    pub fn remaining_data(&self) -> &'a [u8] {
        match self.record {
            Some(record) if self.state != EnumeratorState::None => {
                record.user_data.get(self.data_next..).unwrap_or(&[])
            }
            _ => &[],
        }
    }

    pub fn event_record(&self) -> Option<&'a EventRecord> {
        self.record
    }

    pub fn event_info(&self) -> Option<&Arc<EventInfo>> {
        self.info.as_ref()
    }

    pub fn event_details(&self) -> Option<EventDetails<'_>> {
        let info = self.info.as_deref()?;
        let is_wbem = info.decoding_source == DecodingSource::Wbem;

        let (decode_guid, control_guid, event_guid) = if is_wbem {
            let decode = if info.event_guid.is_nil() {
                info.provider_guid
            } else {
                info.event_guid
            };
            (decode, info.provider_guid, None)
        } else if info.flags.contains(TemplateFlags::CONTROL_GUID) {
            (info.provider_guid, info.event_guid, None)
        } else {
            let event = (!info.event_guid.is_nil()).then_some(info.event_guid);
            (info.provider_guid, info.provider_guid, event)
        };

        Some(EventDetails {
            name: event_name(info),
            tags: info.tags,
            binary_xml: (!info.binary_xml.is_empty()).then_some(info.binary_xml.as_slice()),
            decoding_source: info.decoding_source,
            provider_name: info.provider_name.as_deref(),
            level_name: info.level_name.as_deref(),
            channel_name: info.channel_name.as_deref(),
            keywords_name: info.keywords_name.as_deref(),
            task_name: task_name(info),
            opcode_name: opcode_name(info),
            event_message: info.event_message.as_deref(),
            provider_message: info.provider_message.as_deref(),
            event_attributes: event_attributes(info),
            activity_id_name: if is_wbem {
                info.activity_id_name.as_deref()
            } else {
                None
            },
            related_activity_id_name: if is_wbem {
                info.related_activity_id_name.as_deref()
            } else {
                None
            },
            decode_guid,
            control_guid,
            event_guid,
        })
    }

    pub fn current_event_has_event_message(&self) -> bool {
        self.info
            .as_ref()
            .is_some_and(|info| info.event_message.is_some())
    }

    /// Looks up one attribute of the current event.
    pub fn find_current_event_attribute(&self, name: &str) -> Result<String> {
        let info = self.info.as_deref().ok_or(EtwError::InvalidState)?;
        find_event_attribute(event_attributes(info).unwrap_or(""), name)
    }

    /// All attributes of the current event.
    pub fn split_current_event_attributes(&self) -> Result<Vec<EventAttribute>> {
        let info = self.info.as_deref().ok_or(EtwError::InvalidState)?;
        Ok(split_event_attributes(event_attributes(info).unwrap_or("")))
    }

    /// Timer resolution in 100ns units, rounded down to whole milliseconds.
    pub fn timer_resolution(&self) -> u32 {
        self.ms_per_tick.wrapping_mul(10000)
    }

    pub fn set_timer_resolution(&mut self, resolution: u32) {
        self.ms_per_tick = resolution / 10000;
        self.settings = self.settings.clone().timer_resolution(resolution);
    }

    pub fn ticks_to_milliseconds(&self, ticks: u32) -> u32 {
        ticks.wrapping_mul(self.ms_per_tick)
    }

    pub fn pointer_size_fallback(&self) -> u8 {
        self.settings.get_pointer_size_fallback()
    }

    pub fn set_pointer_size_fallback(&mut self, size: u8) -> Result<()> {
        settings::validate_pointer_size(size)?;
        self.settings = self.settings.clone().pointer_size_fallback(size);
        Ok(())
    }

    pub fn timestamp_format(&self) -> TimestampFormat {
        self.settings.get_timestamp_format()
    }

    pub fn set_timestamp_format(&mut self, format: TimestampFormat) {
        self.settings = self.settings.clone().timestamp_format(format);
    }

    /// Sets the timestamp format from its packed form (type in the low byte, flags above).
    pub fn set_timestamp_format_bits(&mut self, bits: u32) -> Result<()> {
        let format = TimestampFormat::from_bits(bits)?;
        self.set_timestamp_format(format);
        Ok(())
    }

    pub fn timezone_bias_minutes(&self) -> i32 {
        self.settings.get_timezone_bias_minutes()
    }

    pub fn set_timezone_bias_minutes(&mut self, bias: i32) -> Result<()> {
        settings::validate_bias(bias)?;
        self.settings = self.settings.clone().timezone_bias_minutes(bias);
        Ok(())
    }

    pub fn adjust_file_time_to_local(&self, utc_file_time: i64) -> i64 {
        adjust_file_time(utc_file_time, self.timezone_bias_minutes())
    }

    /// Size of pointer-sized values in the current event.
    pub(crate) fn pointer_size(&self) -> u8 {
        match self.record {
            Some(record) if record.header.flags.contains(EventHeaderFlags::HEADER_32_BIT) => 4,
            Some(record) if record.header.flags.contains(EventHeaderFlags::HEADER_64_BIT) => 8,
            _ => self.settings.get_pointer_size_fallback(),
        }
    }

    /// Payload offset of the current item's raw data.
    pub(crate) fn data_position(&self) -> usize {
        self.data_next
    }

    /// The current item's cooked bytes, borrowed from the record rather than the enumerator.
    pub(crate) fn item_data(&self) -> &'a [u8] {
        match self.record {
            Some(record) if self.state > EnumeratorState::BeforeFirstItem => record
                .user_data
                .get(self.cooked_offset..self.cooked_offset + self.cooked_len)
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    pub(crate) fn in_array(&self) -> bool {
        self.stack_top.is_array
    }

    /// Positions on top-level property `index`, whose raw data starts at `offset`.
    pub(crate) fn seek_top_level_property(&mut self, offset: usize, index: u16) -> bool {
        let top_level = self
            .info
            .as_ref()
            .map_or(0, |info| info.top_level_property_count);

        self.data_next = offset;
        self.stack.clear();
        self.stack_top = StackEntry {
            property_index: index,
            property_end: top_level,
            ..StackEntry::default()
        };
        self.next_property()
    }

    /// The error that stopped the last move, or `InvalidState` if none was recorded.
    pub(crate) fn move_error(&self) -> EtwError {
        self.last_error.clone().unwrap_or(EtwError::InvalidState)
    }

    fn current_item_context(&self) -> Option<(&'a EventRecord, &EventInfo)> {
        if self.state <= EnumeratorState::BeforeFirstItem {
            return None;
        }
        Some((self.record?, self.info.as_deref()?))
    }

    fn current_property(&self) -> Result<(&'a EventRecord, Arc<EventInfo>)> {
        match (self.record, &self.info) {
            (Some(record), Some(info)) => Ok((record, Arc::clone(info))),
            _ => Err(EtwError::InvalidState),
        }
    }

    /// Called after `stack_top.property_index` changes.
    fn next_property(&mut self) -> bool {
        if self.stack_top.property_index == self.stack_top.property_end {
            return match self.stack.pop() {
                None => {
                    self.set_end_state(EnumeratorState::AfterLastItem, SubState::AfterLastItem);
                    self.last_error = None;
                    false
                }
                Some(parent) => {
                    self.stack_top = parent;
                    self.cooked_in_type = InType::NULL;
                    self.element_size = 0;
                    self.set_end_state(EnumeratorState::StructEnd, SubState::StructEnd);
                    self.last_error = None;
                    true
                }
            };
        }

        let info = match self.current_property() {
            Ok((_, info)) => info,
            Err(e) => return self.set_error_state(e),
        };
        let Some(prop) = info.properties.get(usize::from(self.stack_top.property_index)) else {
            return self.set_error_state(EtwError::InvalidParameter {
                what: "property index beyond the descriptor's property array",
            });
        };

        self.stack_top.array_index = 0;

        let is_struct = prop.is_struct();
        if !is_struct && !prop.fixed_count && prop.count == PropertyParam::Fixed(1) {
            self.stack_top.array_count = 1;
            self.stack_top.is_struct = false;
            self.stack_top.is_array = false;
            self.set_state(EnumeratorState::Value, SubState::ValueScalar);
            return self.start_value();
        }

        self.stack_top.is_struct = is_struct;
        match prop.count {
            PropertyParam::FromProperty(index) => {
                let Some(&count) = self.integer_values.get(usize::from(index)) else {
                    return self.set_error_state(EtwError::InvalidParameter {
                        what: "count property index",
                    });
                };
                self.stack_top.array_count = count;
                self.stack_top.is_array = true;
                self.start_array(prop)
            }
            PropertyParam::Fixed(count) => {
                self.stack_top.array_count = count;
                if count != 1 || prop.fixed_count {
                    self.stack_top.is_array = true;
                    self.start_array(prop)
                } else {
                    self.stack_top.is_array = false;
                    self.start_struct();
                    self.last_error = None;
                    true
                }
            }
        }
    }

    fn enter_struct(&mut self) -> bool {
        let info = match self.current_property() {
            Ok((_, info)) => info,
            Err(e) => return self.set_error_state(e),
        };
        let range = match info
            .properties
            .get(usize::from(self.stack_top.property_index))
            .map(|prop| &prop.kind)
        {
            Some(PropertyKind::Struct {
                start_index,
                member_count,
            }) => start_index.checked_add(*member_count).map(|end| (*start_index, end)),
            _ => None,
        };
        let Some((start, end)) = range else {
            return self.set_error_state(EtwError::InvalidParameter {
                what: "struct member range",
            });
        };

        if let Err(e) = self.stack.push(self.stack_top) {
            return self.set_error_state(e);
        }
        self.stack_top.property_index = start;
        self.stack_top.property_end = end;
        self.next_property()
    }

    fn start_struct(&mut self) {
        self.cooked_offset = self.data_next;
        self.cooked_len = 0;
        self.raw_len = 0;
        self.cooked_in_type = InType::NULL;
        self.element_size = 0;
        self.set_state(EnumeratorState::StructBegin, SubState::StructBegin);
    }

    /// Determines the element type of an array, and for fixed-size elements validates the
    /// size of the whole array.
    fn start_array(&mut self, prop: &PropertyInfo) -> bool {
        let in_type = prop.in_type();

        self.cooked_offset = self.data_next;
        self.cooked_len = 0;
        self.raw_len = 0;
        self.cooked_in_type = in_type;
        self.element_size = 0;
        self.set_state(EnumeratorState::ArrayBegin, SubState::ArrayBegin);

        if self.stack_top.is_struct {
            self.cooked_in_type = InType::NULL;
            self.last_error = None;
            return true;
        }

        let element_size: u16 = match in_type {
            InType::INT8 | InType::UINT8 | InType::ANSICHAR => 1,
            InType::INT16 | InType::UINT16 | InType::UNICODECHAR => 2,
            InType::INT32 | InType::UINT32 | InType::HEXINT32 | InType::FLOAT | InType::BOOLEAN => 4,
            InType::INT64 | InType::UINT64 | InType::DOUBLE | InType::FILETIME | InType::HEXINT64 => 8,
            InType::GUID | InType::SYSTEMTIME => 16,
            InType::POINTER | InType::SIZET => u16::from(self.pointer_size()),

            InType::NULL
            | InType::UNICODESTRING
            | InType::ANSISTRING
            | InType::BINARY
            | InType::SID => 0,

            InType::MANIFEST_COUNTEDSTRING
            | InType::COUNTEDSTRING
            | InType::REVERSEDCOUNTEDSTRING
            | InType::NONNULLTERMINATEDSTRING => {
                self.cooked_in_type = InType::UNICODESTRING;
                0
            }
            InType::MANIFEST_COUNTEDANSISTRING
            | InType::COUNTEDANSISTRING
            | InType::REVERSEDCOUNTEDANSISTRING
            | InType::NONNULLTERMINATEDANSISTRING => {
                self.cooked_in_type = InType::ANSISTRING;
                0
            }
            InType::MANIFEST_COUNTEDBINARY | InType::HEXDUMP => {
                self.cooked_in_type = InType::BINARY;
                0
            }
            InType::WBEMSID => {
                self.cooked_in_type = InType::SID;
                0
            }

            other => {
                return self.set_error_state(EtwError::UnsupportedType { in_type: other.0 });
            }
        };

        if element_size != 0 {
            let need = usize::from(element_size) * usize::from(self.stack_top.array_count);
            let remaining = self.remaining_len();
            if remaining < need {
                return self.set_error_state(EtwError::truncated(
                    "array",
                    self.data_next,
                    need,
                    remaining,
                ));
            }
            self.element_size = element_size;
            self.raw_len = need;
            self.cooked_len = need;
        }

        self.last_error = None;
        true
    }

    /// Computes the cooked and raw spans of one value at `data_next`.
    fn start_value(&mut self) -> bool {
        let (record, info) = match self.current_property() {
            Ok(pair) => pair,
            Err(e) => return self.set_error_state(e),
        };
        let Some(prop) = info.properties.get(usize::from(self.stack_top.property_index)) else {
            return self.set_error_state(EtwError::InvalidParameter {
                what: "property index beyond the descriptor's property array",
            });
        };

        let data = record.user_data.get(self.data_next..).unwrap_or(&[]);
        let remaining = data.len();
        let in_type = prop.in_type();

        self.cooked_offset = self.data_next;
        self.cooked_in_type = in_type;
        self.element_size = 0;

        match in_type {
            InType::UINT8 | InType::UINT16 | InType::UINT32 | InType::HEXINT32 => {
                let size: u16 = match in_type {
                    InType::UINT8 => 1,
                    InType::UINT16 => 2,
                    _ => 4,
                };
                self.set_fixed_size(size);
                let remembered = match size {
                    1 => data.first().map(|&b| u16::from(b)),
                    2 => read_u16_le(data, 0),
                    _ => read_u32_le(data, 0).map(|v| u16::try_from(v).unwrap_or(NOT_SEEN)),
                };
                if let Some(value) = remembered {
                    self.integer_values[usize::from(self.stack_top.property_index)] = value;
                    self.last_error = None;
                    return true;
                }
            }

            InType::INT8 | InType::ANSICHAR => self.set_fixed_size(1),
            InType::INT16 | InType::UNICODECHAR => self.set_fixed_size(2),
            InType::INT32 | InType::FLOAT | InType::BOOLEAN => self.set_fixed_size(4),
            InType::INT64 | InType::UINT64 | InType::DOUBLE | InType::FILETIME | InType::HEXINT64 => {
                self.set_fixed_size(8)
            }
            InType::GUID | InType::SYSTEMTIME => self.set_fixed_size(16),
            InType::POINTER | InType::SIZET => {
                let size = u16::from(self.pointer_size());
                self.set_fixed_size(size)
            }

            InType::UNICODESTRING => match self.current_property_length(prop) {
                Some(len) => {
                    self.cooked_len = usize::from(len) * 2;
                    self.raw_len = self.cooked_len;
                }
                None => {
                    let max_units = remaining / 2;
                    let units = utf16_nul_position(data).unwrap_or(max_units);
                    self.cooked_len = units * 2;
                    // A missing terminator at the end of the payload is tolerated.
                    self.raw_len = if units == max_units {
                        remaining
                    } else {
                        self.cooked_len + 2
                    };
                }
            },

            InType::ANSISTRING => match self.current_property_length(prop) {
                Some(len) => {
                    self.cooked_len = usize::from(len);
                    self.raw_len = self.cooked_len;
                }
                None => {
                    let len = data.iter().position(|&b| b == 0).unwrap_or(remaining);
                    self.cooked_len = len;
                    self.raw_len = if len == remaining { remaining } else { len + 1 };
                }
            },

            InType::BINARY => {
                let len = match self.current_property_length(prop) {
                    Some(len) => usize::from(len),
                    None if prop.out_type() == OutType::IPV6 => 16,
                    None => 0,
                };
                self.cooked_len = len;
                self.raw_len = len;
            }

            InType::MANIFEST_COUNTEDSTRING | InType::COUNTEDSTRING => {
                self.cooked_in_type = InType::UNICODESTRING;
                self.start_counted(data, read_u16_le(data, 0));
                self.cooked_len &= !1;
            }
            InType::REVERSEDCOUNTEDSTRING => {
                self.cooked_in_type = InType::UNICODESTRING;
                self.start_counted(data, read_u16_be(data, 0));
                self.cooked_len &= !1;
            }
            InType::MANIFEST_COUNTEDANSISTRING | InType::COUNTEDANSISTRING => {
                self.cooked_in_type = InType::ANSISTRING;
                self.start_counted(data, read_u16_le(data, 0));
            }
            InType::REVERSEDCOUNTEDANSISTRING => {
                self.cooked_in_type = InType::ANSISTRING;
                self.start_counted(data, read_u16_be(data, 0));
            }
            InType::MANIFEST_COUNTEDBINARY => {
                self.cooked_in_type = InType::BINARY;
                self.start_counted(data, read_u16_le(data, 0));
            }

            InType::HEXDUMP => {
                self.cooked_in_type = InType::BINARY;
                if remaining < 4 {
                    self.cooked_len = 0;
                    self.raw_len = 4;
                } else {
                    // 32-bit length prefix; only the low 16 bits are honored.
                    let len = read_u16_le(data, 0).map_or(0, usize::from);
                    self.cooked_offset = self.data_next + 4;
                    self.cooked_len = len;
                    self.raw_len = len + 4;
                }
            }

            InType::NONNULLTERMINATEDSTRING => {
                self.cooked_in_type = InType::UNICODESTRING;
                self.cooked_len = remaining & !1;
                self.raw_len = remaining;
            }
            InType::NONNULLTERMINATEDANSISTRING => {
                self.cooked_in_type = InType::ANSISTRING;
                self.cooked_len = remaining;
                self.raw_len = remaining;
            }

            InType::NULL => {
                self.cooked_len = 0;
                self.raw_len = 0;
                self.last_error = None;
                return true;
            }

            InType::SID => {
                if remaining < 8 {
                    self.cooked_len = 0;
                    self.raw_len = 8;
                } else {
                    self.cooked_len = 8 + usize::from(data[1]) * 4;
                    self.raw_len = self.cooked_len;
                }
            }

            InType::WBEMSID => {
                // A TOKEN_USER (two pointers) followed by the SID.
                self.cooked_in_type = InType::SID;
                let header = 2 * usize::from(self.pointer_size());
                if remaining < header + 8 {
                    self.cooked_len = 0;
                    self.raw_len = header + 8;
                } else {
                    self.cooked_offset = self.data_next + header;
                    self.cooked_len = 8 + usize::from(data[header + 1]) * 4;
                    self.raw_len = header + self.cooked_len;
                }
            }

            other => {
                self.cooked_len = 0;
                self.raw_len = 0;
                return self.set_error_state(EtwError::UnsupportedType { in_type: other.0 });
            }
        }

        if remaining < self.raw_len {
            let need = self.raw_len;
            self.cooked_len = 0;
            self.raw_len = 0;
            return self.set_error_state(EtwError::truncated(
                "property value",
                self.data_next,
                need,
                remaining,
            ));
        }

        self.last_error = None;
        true
    }

    fn set_fixed_size(&mut self, size: u16) {
        self.element_size = size;
        self.cooked_len = usize::from(size);
        self.raw_len = usize::from(size);
    }

    /// Lays out a value with a 2-byte length prefix. `prefix` is `None` when fewer than two
    /// bytes remain, in which case the raw length alone makes the bounds check fail.
    fn start_counted(&mut self, data: &[u8], prefix: Option<u16>) {
        match prefix {
            Some(len) if data.len() >= 2 => {
                self.cooked_offset = self.data_next + 2;
                self.cooked_len = usize::from(len);
                self.raw_len = self.cooked_len + 2;
            }
            _ => {
                self.cooked_len = 0;
                self.raw_len = 2;
            }
        }
    }

    fn current_property_length(&self, prop: &PropertyInfo) -> Option<u16> {
        match prop.length {
            PropertyParam::FromProperty(index) => Some(
                self.integer_values
                    .get(usize::from(index))
                    .copied()
                    .unwrap_or(NOT_SEEN),
            ),
            PropertyParam::Fixed(len) if len != 0 || prop.fixed_length => Some(len),
            PropertyParam::Fixed(_) => None,
        }
    }

    fn remaining_len(&self) -> usize {
        self.record
            .map_or(0, |record| record.user_data.len().saturating_sub(self.data_next))
    }

    fn set_none_state(&mut self, error: Option<EtwError>) {
        self.record = None;
        self.info = None;
        self.data_next = 0;
        self.cooked_offset = 0;
        self.cooked_len = 0;
        self.raw_len = 0;
        self.state = EnumeratorState::None;
        self.sub_state = SubState::None;
        self.last_error = error;
    }

    fn set_error_state(&mut self, error: EtwError) -> bool {
        warn!(
            "decoding failed at property {} offset {}: {}",
            self.stack_top.property_index, self.data_next, error
        );
        self.state = EnumeratorState::Error;
        self.sub_state = SubState::Error;
        self.last_error = Some(error);
        false
    }

    fn set_end_state(&mut self, state: EnumeratorState, sub_state: SubState) {
        self.cooked_offset = self.data_next;
        self.cooked_len = 0;
        self.raw_len = 0;
        self.set_state(state, sub_state);
    }

    fn set_state(&mut self, state: EnumeratorState, sub_state: SubState) {
        self.state = state;
        self.sub_state = sub_state;
    }
}

/// WBEM events are named by their opcode, TraceLogging events by their task.
pub(crate) fn event_name(info: &EventInfo) -> Option<&str> {
    match info.decoding_source {
        DecodingSource::Wbem => info.opcode_name.as_deref(),
        DecodingSource::Tlg => info.task_name.as_deref(),
        _ => info.event_name.as_deref(),
    }
}

pub(crate) fn event_attributes(info: &EventInfo) -> Option<&str> {
    match info.decoding_source {
        DecodingSource::Wbem => None,
        _ => info.event_attributes.as_deref(),
    }
}

pub(crate) fn task_name(info: &EventInfo) -> Option<&str> {
    match info.decoding_source {
        DecodingSource::Tlg => None,
        _ => info.task_name.as_deref(),
    }
}

pub(crate) fn opcode_name(info: &EventInfo) -> Option<&str> {
    match info.decoding_source {
        DecodingSource::Wbem => None,
        _ => info.opcode_name.as_deref(),
    }
}
