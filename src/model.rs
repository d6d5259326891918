//! Event descriptor and event record types.
//!
//! These mirror the information a trace-decoding facility hands out for one event: the
//! record header plus payload, and the descriptor that lists the payload's properties.
//! Both are immutable once built; the enumerator only ever borrows them.

use std::fmt::{self, Debug};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::guid::Guid;

/// Wire-level input type of a property.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InType(pub u16);

impl InType {
    pub const NULL: InType = InType(0);
    pub const UNICODESTRING: InType = InType(1);
    pub const ANSISTRING: InType = InType(2);
    pub const INT8: InType = InType(3);
    pub const UINT8: InType = InType(4);
    pub const INT16: InType = InType(5);
    pub const UINT16: InType = InType(6);
    pub const INT32: InType = InType(7);
    pub const UINT32: InType = InType(8);
    pub const INT64: InType = InType(9);
    pub const UINT64: InType = InType(10);
    pub const FLOAT: InType = InType(11);
    pub const DOUBLE: InType = InType(12);
    pub const BOOLEAN: InType = InType(13);
    pub const BINARY: InType = InType(14);
    pub const GUID: InType = InType(15);
    pub const POINTER: InType = InType(16);
    pub const FILETIME: InType = InType(17);
    pub const SYSTEMTIME: InType = InType(18);
    pub const SID: InType = InType(19);
    pub const HEXINT32: InType = InType(20);
    pub const HEXINT64: InType = InType(21);
    pub const MANIFEST_COUNTEDSTRING: InType = InType(22);
    pub const MANIFEST_COUNTEDANSISTRING: InType = InType(23);
    pub const MANIFEST_COUNTEDBINARY: InType = InType(25);
    pub const COUNTEDSTRING: InType = InType(300);
    pub const COUNTEDANSISTRING: InType = InType(301);
    pub const REVERSEDCOUNTEDSTRING: InType = InType(302);
    pub const REVERSEDCOUNTEDANSISTRING: InType = InType(303);
    pub const NONNULLTERMINATEDSTRING: InType = InType(304);
    pub const NONNULLTERMINATEDANSISTRING: InType = InType(305);
    pub const UNICODECHAR: InType = InType(306);
    pub const ANSICHAR: InType = InType(307);
    pub const SIZET: InType = InType(308);
    pub const HEXDUMP: InType = InType(309);
    pub const WBEMSID: InType = InType(310);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            InType::NULL => "NULL",
            InType::UNICODESTRING => "UNICODESTRING",
            InType::ANSISTRING => "ANSISTRING",
            InType::INT8 => "INT8",
            InType::UINT8 => "UINT8",
            InType::INT16 => "INT16",
            InType::UINT16 => "UINT16",
            InType::INT32 => "INT32",
            InType::UINT32 => "UINT32",
            InType::INT64 => "INT64",
            InType::UINT64 => "UINT64",
            InType::FLOAT => "FLOAT",
            InType::DOUBLE => "DOUBLE",
            InType::BOOLEAN => "BOOLEAN",
            InType::BINARY => "BINARY",
            InType::GUID => "GUID",
            InType::POINTER => "POINTER",
            InType::FILETIME => "FILETIME",
            InType::SYSTEMTIME => "SYSTEMTIME",
            InType::SID => "SID",
            InType::HEXINT32 => "HEXINT32",
            InType::HEXINT64 => "HEXINT64",
            InType::MANIFEST_COUNTEDSTRING => "MANIFEST_COUNTEDSTRING",
            InType::MANIFEST_COUNTEDANSISTRING => "MANIFEST_COUNTEDANSISTRING",
            InType::MANIFEST_COUNTEDBINARY => "MANIFEST_COUNTEDBINARY",
            InType::COUNTEDSTRING => "COUNTEDSTRING",
            InType::COUNTEDANSISTRING => "COUNTEDANSISTRING",
            InType::REVERSEDCOUNTEDSTRING => "REVERSEDCOUNTEDSTRING",
            InType::REVERSEDCOUNTEDANSISTRING => "REVERSEDCOUNTEDANSISTRING",
            InType::NONNULLTERMINATEDSTRING => "NONNULLTERMINATEDSTRING",
            InType::NONNULLTERMINATEDANSISTRING => "NONNULLTERMINATEDANSISTRING",
            InType::UNICODECHAR => "UNICODECHAR",
            InType::ANSICHAR => "ANSICHAR",
            InType::SIZET => "SIZET",
            InType::HEXDUMP => "HEXDUMP",
            InType::WBEMSID => "WBEMSID",
            _ => return None,
        })
    }
}

impl Debug for InType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "InType::{}", name),
            None => write!(f, "InType({})", self.0),
        }
    }
}

/// Rendering hint of a property, independent of its wire encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutType(pub u16);

impl OutType {
    pub const NULL: OutType = OutType(0);
    pub const STRING: OutType = OutType(1);
    pub const DATETIME: OutType = OutType(2);
    pub const BYTE: OutType = OutType(3);
    pub const UNSIGNEDBYTE: OutType = OutType(4);
    pub const SHORT: OutType = OutType(5);
    pub const UNSIGNEDSHORT: OutType = OutType(6);
    pub const INT: OutType = OutType(7);
    pub const UNSIGNEDINT: OutType = OutType(8);
    pub const LONG: OutType = OutType(9);
    pub const UNSIGNEDLONG: OutType = OutType(10);
    pub const FLOAT: OutType = OutType(11);
    pub const DOUBLE: OutType = OutType(12);
    pub const BOOLEAN: OutType = OutType(13);
    pub const GUID: OutType = OutType(14);
    pub const HEXBINARY: OutType = OutType(15);
    pub const HEXINT8: OutType = OutType(16);
    pub const HEXINT16: OutType = OutType(17);
    pub const HEXINT32: OutType = OutType(18);
    pub const HEXINT64: OutType = OutType(19);
    pub const PID: OutType = OutType(20);
    pub const TID: OutType = OutType(21);
    pub const PORT: OutType = OutType(22);
    pub const IPV4: OutType = OutType(23);
    pub const IPV6: OutType = OutType(24);
    pub const SOCKETADDRESS: OutType = OutType(25);
    pub const CIMDATETIME: OutType = OutType(26);
    pub const ETWTIME: OutType = OutType(27);
    pub const XML: OutType = OutType(28);
    pub const ERRORCODE: OutType = OutType(29);
    pub const WIN32ERROR: OutType = OutType(30);
    pub const NTSTATUS: OutType = OutType(31);
    pub const HRESULT: OutType = OutType(32);
    pub const CULTURE_INSENSITIVE_DATETIME: OutType = OutType(33);
    pub const JSON: OutType = OutType(34);
    pub const UTF8: OutType = OutType(35);
    pub const PKCS7: OutType = OutType(36);
    pub const CODE_POINTER: OutType = OutType(37);
    pub const DATETIME_UTC: OutType = OutType(38);
    pub const REDUCEDSTRING: OutType = OutType(300);
    pub const NOPRINT: OutType = OutType(301);
}

impl Debug for OutType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OutType({})", self.0)
    }
}

bitflags! {
    /// Property flags as reported to callers in [`RawItemInfo`](crate::RawItemInfo).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PropertyFlags: u32 {
        const STRUCT = 0x1;
        const PARAM_LENGTH = 0x2;
        const PARAM_COUNT = 0x4;
        const WBEM_XML_FRAGMENT = 0x8;
        const PARAM_FIXED_LENGTH = 0x10;
        const PARAM_FIXED_COUNT = 0x20;
        const HAS_TAGS = 0x40;
        const HAS_CUSTOM_SCHEMA = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EventHeaderFlags: u16 {
        const EXTENDED_INFO = 0x1;
        const PRIVATE_SESSION = 0x2;
        const STRING_ONLY = 0x4;
        const TRACE_MESSAGE = 0x8;
        const NO_CPUTIME = 0x10;
        const HEADER_32_BIT = 0x20;
        const HEADER_64_BIT = 0x40;
        const DECODE_GUID = 0x80;
        const CLASSIC_HEADER = 0x100;
        const PROCESSOR_INDEX = 0x200;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MapFlags: u32 {
        const MANIFEST_VALUEMAP = 0x1;
        const MANIFEST_BITMAP = 0x2;
        const MANIFEST_PATTERNMAP = 0x4;
        const WBEM_VALUEMAP = 0x8;
        const WBEM_BITMAP = 0x10;
        const WBEM_FLAG = 0x20;
        const WBEM_NO_MAP = 0x40;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TemplateFlags: u32 {
        const EMPTY = 0x1;
        const USER_DATA = 0x2;
        const CONTROL_GUID = 0x4;
    }
}

/// Where the event's decoding information came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodingSource {
    #[default]
    XmlFile,
    Wbem,
    Wpp,
    Tlg,
}

/// A count or length: either declared in the descriptor or read from an earlier property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyParam {
    Fixed(u16),
    FromProperty(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyKind {
    Value {
        in_type: InType,
        #[serde(default)]
        out_type: OutType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_name: Option<String>,
    },
    Struct {
        start_index: u16,
        member_count: u16,
    },
    /// A value carrying decoding information for an external deserializer.
    CustomSchema {
        in_type: InType,
        #[serde(default)]
        out_type: OutType,
        #[serde(default, with = "hex_bytes")]
        schema: Vec<u8>,
    },
}

/// One entry of an event descriptor's flattened property array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: PropertyKind,
    #[serde(default = "PropertyInfo::default_count")]
    pub count: PropertyParam,
    #[serde(default = "PropertyInfo::default_length")]
    pub length: PropertyParam,
    /// The property is an array even when its count is 1.
    #[serde(default)]
    pub fixed_count: bool,
    /// The declared length is exact, even when it is 0.
    #[serde(default)]
    pub fixed_length: bool,
    #[serde(default)]
    pub wbem_xml_fragment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<u32>,
}

impl PropertyInfo {
    fn default_count() -> PropertyParam {
        PropertyParam::Fixed(1)
    }

    fn default_length() -> PropertyParam {
        PropertyParam::Fixed(0)
    }

    pub fn value(name: impl Into<String>, in_type: InType, out_type: OutType) -> Self {
        PropertyInfo {
            name: Some(name.into()),
            kind: PropertyKind::Value {
                in_type,
                out_type,
                map_name: None,
            },
            count: Self::default_count(),
            length: Self::default_length(),
            fixed_count: false,
            fixed_length: false,
            wbem_xml_fragment: false,
            tags: None,
        }
    }

    pub fn structure(name: impl Into<String>, start_index: u16, member_count: u16) -> Self {
        PropertyInfo {
            kind: PropertyKind::Struct {
                start_index,
                member_count,
            },
            ..Self::value(name, InType::NULL, OutType::NULL)
        }
    }

    pub fn with_count(mut self, count: PropertyParam) -> Self {
        self.count = count;
        self
    }

    pub fn with_length(mut self, length: PropertyParam) -> Self {
        self.length = length;
        self
    }

    pub fn with_fixed_count(mut self) -> Self {
        self.fixed_count = true;
        self
    }

    pub fn with_fixed_length(mut self) -> Self {
        self.fixed_length = true;
        self
    }

    pub fn with_map_name(mut self, name: impl Into<String>) -> Self {
        if let PropertyKind::Value { map_name, .. } = &mut self.kind {
            *map_name = Some(name.into());
        }
        self
    }

    pub fn with_tags(mut self, tags: u32) -> Self {
        self.tags = Some(tags & 0x0FFF_FFFF);
        self
    }

    pub fn unnamed(mut self) -> Self {
        self.name = None;
        self
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind, PropertyKind::Struct { .. })
    }

    /// Raw input type. Structs report `NULL`.
    pub fn in_type(&self) -> InType {
        match self.kind {
            PropertyKind::Value { in_type, .. } | PropertyKind::CustomSchema { in_type, .. } => {
                in_type
            }
            PropertyKind::Struct { .. } => InType::NULL,
        }
    }

    pub fn out_type(&self) -> OutType {
        match self.kind {
            PropertyKind::Value { out_type, .. } | PropertyKind::CustomSchema { out_type, .. } => {
                out_type
            }
            PropertyKind::Struct { .. } => OutType::NULL,
        }
    }

    pub fn map_name(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::Value { map_name, .. } => map_name.as_deref(),
            _ => None,
        }
    }

    pub fn custom_schema(&self) -> Option<&[u8]> {
        match &self.kind {
            PropertyKind::CustomSchema { schema, .. } => Some(schema),
            _ => None,
        }
    }

    /// The descriptor flags this property would carry on the wire.
    pub fn flags(&self) -> PropertyFlags {
        let mut flags = PropertyFlags::empty();
        flags.set(PropertyFlags::STRUCT, self.is_struct());
        flags.set(
            PropertyFlags::PARAM_LENGTH,
            matches!(self.length, PropertyParam::FromProperty(_)),
        );
        flags.set(
            PropertyFlags::PARAM_COUNT,
            matches!(self.count, PropertyParam::FromProperty(_)),
        );
        flags.set(PropertyFlags::WBEM_XML_FRAGMENT, self.wbem_xml_fragment);
        flags.set(PropertyFlags::PARAM_FIXED_LENGTH, self.fixed_length);
        flags.set(PropertyFlags::PARAM_FIXED_COUNT, self.fixed_count);
        flags.set(PropertyFlags::HAS_TAGS, self.tags.is_some());
        flags.set(
            PropertyFlags::HAS_CUSTOM_SCHEMA,
            matches!(self.kind, PropertyKind::CustomSchema { .. }),
        );
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventDescriptor {
    pub id: u16,
    pub version: u8,
    pub channel: u8,
    pub level: u8,
    pub opcode: u8,
    pub task: u16,
    pub keyword: u64,
}

/// Decoding information for one kind of event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventInfo {
    pub provider_guid: Guid,
    pub event_guid: Guid,
    pub descriptor: EventDescriptor,
    pub decoding_source: DecodingSource,
    pub flags: TemplateFlags,
    pub provider_name: Option<String>,
    pub level_name: Option<String>,
    pub channel_name: Option<String>,
    pub keywords_name: Option<String>,
    pub task_name: Option<String>,
    pub opcode_name: Option<String>,
    pub event_message: Option<String>,
    pub provider_message: Option<String>,
    pub activity_id_name: Option<String>,
    pub event_name: Option<String>,
    pub event_attributes: Option<String>,
    pub related_activity_id_name: Option<String>,
    #[serde(with = "hex_bytes")]
    pub binary_xml: Vec<u8>,
    pub tags: u32,
    pub properties: Vec<PropertyInfo>,
    pub top_level_property_count: u16,
}

impl EventInfo {
    /// A descriptor whose top-level properties are exactly `properties`.
    pub fn with_properties(
        provider_guid: Guid,
        descriptor: EventDescriptor,
        properties: Vec<PropertyInfo>,
    ) -> Self {
        let top_level_property_count = properties.len() as u16;
        EventInfo {
            provider_guid,
            descriptor,
            properties,
            top_level_property_count,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub value: u32,
    pub output: String,
}

/// Value-map or bit-map metadata for rendering integers symbolically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapInfo {
    pub name: String,
    pub flags: MapFlags,
    pub entries: Vec<MapEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHeader {
    pub flags: EventHeaderFlags,
    pub thread_id: u32,
    pub process_id: u32,
    /// FILETIME, 100ns intervals since 1601-01-01.
    pub timestamp: i64,
    pub provider_id: Guid,
    pub descriptor: EventDescriptor,
    /// Kernel time in the low 32 bits and user time in the high 32 bits, or processor time
    /// for private sessions.
    pub processor_time: u64,
    pub activity_id: Guid,
}

impl EventHeader {
    pub fn kernel_time(&self) -> u32 {
        self.processor_time as u32
    }

    pub fn user_time(&self) -> u32 {
        (self.processor_time >> 32) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferContext {
    /// The processor index. Only the low byte is valid unless the header carries the
    /// `PROCESSOR_INDEX` flag.
    pub processor_index: u16,
    pub logger_id: u16,
}

pub const EXT_TYPE_RELATED_ACTIVITYID: u16 = 1;
pub const EXT_TYPE_EVENT_SCHEMA_TL: u16 = 11;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedDataItem {
    pub ext_type: u16,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// One event as delivered by a trace session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventRecord {
    pub header: EventHeader,
    pub buffer_context: BufferContext,
    pub extended_data: Vec<ExtendedDataItem>,
    #[serde(with = "hex_bytes")]
    pub user_data: Vec<u8>,
}

impl EventRecord {
    pub fn new(header: EventHeader, user_data: Vec<u8>) -> Self {
        EventRecord {
            header,
            user_data,
            ..Default::default()
        }
    }

    pub fn processor_index(&self) -> u32 {
        if self
            .header
            .flags
            .contains(EventHeaderFlags::PROCESSOR_INDEX)
        {
            u32::from(self.buffer_context.processor_index)
        } else {
            u32::from(self.buffer_context.processor_index & 0xFF)
        }
    }

    pub fn extended_item(&self, ext_type: u16) -> Option<&ExtendedDataItem> {
        self.extended_data.iter().find(|item| item.ext_type == ext_type)
    }
}

/// Serializes byte buffers as lowercase hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let compact: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        hex::decode(compact).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_property_flags_follow_params() {
        let p = PropertyInfo::value("Data", InType::UINT8, OutType::NULL)
            .with_count(PropertyParam::FromProperty(0))
            .with_tags(0x1234);
        assert_eq!(
            p.flags(),
            PropertyFlags::PARAM_COUNT | PropertyFlags::HAS_TAGS
        );

        let s = PropertyInfo::structure("S", 1, 2).with_fixed_count();
        assert_eq!(
            s.flags(),
            PropertyFlags::STRUCT | PropertyFlags::PARAM_FIXED_COUNT
        );
        assert_eq!(s.in_type(), InType::NULL);
    }

    #[test]
    fn test_property_info_from_json() {
        let p: PropertyInfo = serde_json::from_str(
            r#"{"name":"Len","kind":"value","in_type":8,"length":{"from_property":2}}"#,
        )
        .unwrap();
        assert_eq!(p.in_type(), InType::UINT32);
        assert_eq!(p.out_type(), OutType::NULL);
        assert_eq!(p.count, PropertyParam::Fixed(1));
        assert_eq!(p.length, PropertyParam::FromProperty(2));
    }

    #[test]
    fn test_record_payload_is_hex() {
        let record: EventRecord =
            serde_json::from_str(r#"{"user_data":"01 02 ff"}"#).unwrap();
        assert_eq!(record.user_data, vec![1, 2, 0xff]);
        assert_eq!(
            serde_json::to_value(&record).unwrap()["user_data"],
            serde_json::json!("0102ff")
        );
    }

    #[test]
    fn test_processor_index_respects_flag() {
        let mut record = EventRecord::default();
        record.buffer_context.processor_index = 0x0102;
        assert_eq!(record.processor_index(), 2);
        record.header.flags |= EventHeaderFlags::PROCESSOR_INDEX;
        assert_eq!(record.processor_index(), 0x0102);
    }
}
