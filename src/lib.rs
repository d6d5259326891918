#![forbid(unsafe_code)]
#![deny(unused_must_use)]
#![cfg_attr(not(debug_assertions), deny(clippy::dbg_macro))]
//! Decoding and formatting of self-describing ETW event payloads.
//!
//! An [`EtwEnumerator`] walks one event's payload according to its descriptor ([`EventInfo`]),
//! yielding values, arrays and structs in declaration order. On top of the walk it renders
//! individual values as text and whole events as expanded messages or as JSON.
//!
//! Descriptors, value maps and message strings are supplied through [`EnumeratorCallbacks`].
//! [`DefaultCallbacks`] is an in-memory registry that is enough for most uses.
//!
//! ```
//! use etw_decode::{
//!     DefaultCallbacks, EnumeratorSettings, EtwEnumerator, EventDescriptor, EventHeader,
//!     EventInfo, EventRecord, Guid, InType, JsonSuffixFlags, OutType, PropertyInfo,
//! };
//!
//! let provider = Guid::new(0x1234_5678, 0x9abc, 0xdef0, [1, 2, 3, 4, 5, 6, 7, 8]);
//! let descriptor = EventDescriptor { id: 1, ..Default::default() };
//!
//! let mut info = EventInfo::with_properties(
//!     provider,
//!     descriptor,
//!     vec![PropertyInfo::value("Port", InType::UINT16, OutType::NULL)],
//! );
//! info.event_message = Some("Listening on %1".to_string());
//!
//! let mut callbacks = DefaultCallbacks::new();
//! callbacks.register_event(info);
//!
//! let record = EventRecord::new(
//!     EventHeader { provider_id: provider, descriptor, ..Default::default() },
//!     8080u16.to_le_bytes().to_vec(),
//! );
//!
//! let settings = EnumeratorSettings::new().timezone_bias_minutes(0);
//! let mut enumerator = EtwEnumerator::with_settings(&callbacks, settings).unwrap();
//! enumerator.start_event(&record).unwrap();
//!
//! assert_eq!(
//!     enumerator.format_current_event(None, JsonSuffixFlags::DEFAULT).unwrap(),
//!     "Listening on 8080"
//! );
//! assert_eq!(
//!     enumerator
//!         .format_current_event_as_json(None, JsonSuffixFlags::empty())
//!         .unwrap(),
//!     r#"{"Port":8080}"#
//! );
//! ```

pub mod attributes;
mod buffer;
pub mod callbacks;
mod enumerator;
pub mod err;
mod format;
mod guid;
mod json_writer;
pub mod model;
mod printf;
mod settings;
mod utils;
mod value_render;

pub use attributes::{EventAttribute, find_event_attribute, split_event_attributes};
pub use callbacks::{
    DefaultCallbacks, EnumeratorCallbacks, ResultCodeDomain, UnderlyingType, format_map_value,
    format_result_code,
};
pub use enumerator::{
    EnumeratorState, EtwEnumerator, EventCategory, EventDetails, ITEM_TAG_IS_ARRAY, ItemInfo,
    RawItemInfo, get_event_category,
};
pub use err::{EtwError, Result};
pub use format::{JsonItemFlags, JsonSuffixFlags};
pub use guid::{EVENT_TRACE_GUID, Guid};
pub use model::{
    BufferContext, DecodingSource, EXT_TYPE_EVENT_SCHEMA_TL, EXT_TYPE_RELATED_ACTIVITYID,
    EventDescriptor, EventHeader, EventHeaderFlags, EventInfo, EventRecord, ExtendedDataItem,
    InType, MapEntry, MapFlags, MapInfo, OutType, PropertyFlags, PropertyInfo, PropertyKind,
    PropertyParam, TemplateFlags,
};
pub use settings::{EnumeratorSettings, TimestampFlags, TimestampFormat, TimestampKind};
pub use utils::SystemTime;
pub use value_render::{ValueKind, adjust_file_time};
