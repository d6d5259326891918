mod fixtures;

use std::sync::Arc;

use etw_decode::{
    DecodingSource, DefaultCallbacks, EnumeratorState, EtwEnumerator, EtwError, EventCategory,
    EventHeaderFlags, EventInfo, ExtendedDataItem, EXT_TYPE_EVENT_SCHEMA_TL, ITEM_TAG_IS_ARRAY,
    InType, OutType, PropertyInfo, PropertyParam, TimestampFlags, TimestampFormat, TimestampKind,
    adjust_file_time, get_event_category,
};
use fixtures::*;
use pretty_assertions::assert_eq;

use EnumeratorState::{
    AfterLastItem, ArrayBegin, ArrayEnd, BeforeFirstItem, Error, StructBegin, StructEnd, Value,
};

fn items(list: &[(EnumeratorState, &str, &str)]) -> Vec<(EnumeratorState, String, String)> {
    list.iter()
        .map(|(state, name, value)| (*state, name.to_string(), value.to_string()))
        .collect()
}

#[test]
fn test_walks_structs_and_string_arrays() {
    ensure_env_logger_initialized();
    let callbacks = DefaultCallbacks::new();

    let mut info = event_info(
        4,
        vec![
            PropertyInfo::structure("Header", 2, 2),
            value("Names", InType::ANSISTRING).with_count(PropertyParam::Fixed(2)),
            value("Version", InType::UINT16),
            value("Flags", InType::HEXINT32),
        ],
    );
    info.top_level_property_count = 2;

    let mut payload = vec![1, 0, 0x0f, 0, 0, 0];
    payload.extend_from_slice(b"ab\0c\0");
    let rec = record(4, payload);

    let mut e = start(&callbacks, &rec, info);
    assert_eq!(e.state(), BeforeFirstItem);
    assert_eq!(
        walk(&mut e),
        items(&[
            (StructBegin, "Header", ""),
            (Value, "Version", "1"),
            (Value, "Flags", "0xF"),
            (StructEnd, "Header", ""),
            (ArrayBegin, "Names", ""),
            (Value, "Names", "ab"),
            (Value, "Names", "c"),
            (ArrayEnd, "Names", ""),
        ])
    );
    assert_eq!(e.state(), AfterLastItem);
    assert_eq!(e.last_error(), None);

    // Walking again after a reset yields the same items.
    e.reset().unwrap();
    assert_eq!(walk(&mut e).len(), 8);
}

#[test]
fn test_counts_and_lengths_from_properties() {
    ensure_env_logger_initialized();
    let callbacks = DefaultCallbacks::new();
    let info = event_info(
        5,
        vec![
            value("Count", InType::UINT16),
            value("Values", InType::UINT32).with_count(PropertyParam::FromProperty(0)),
            value("Size", InType::UINT8),
            value("Blob", InType::BINARY).with_length(PropertyParam::FromProperty(2)),
        ],
    );
    let rec = record(
        5,
        vec![2, 0, 10, 0, 0, 0, 20, 0, 0, 0, 3, 0xde, 0xad, 0xbe],
    );

    let mut e = start(&callbacks, &rec, info);
    assert_eq!(
        walk(&mut e),
        items(&[
            (Value, "Count", "2"),
            (ArrayBegin, "Values", ""),
            (Value, "Values", "10"),
            (Value, "Values", "20"),
            (ArrayEnd, "Values", ""),
            (Value, "Size", "3"),
            (Value, "Blob", "0xDEADBE"),
        ])
    );
}

#[test]
fn test_item_info_describes_array_elements() {
    let callbacks = DefaultCallbacks::new();
    let info = event_info(
        6,
        vec![
            value("Ports", InType::UINT16)
                .with_count(PropertyParam::Fixed(2))
                .with_tags(0x5),
        ],
    );
    let rec = record(6, vec![0x50, 0x00, 0xbb, 0x01]);
    let mut e = start(&callbacks, &rec, info);

    assert!(e.move_next());
    let begin = e.item_info().unwrap();
    assert_eq!(begin.array_count, 2);
    assert_eq!(begin.element_size, 2);
    assert_eq!(begin.data.len(), 4);
    assert_eq!(begin.tags, 0x5 | ITEM_TAG_IS_ARRAY);

    assert!(e.move_next());
    assert!(e.move_next());
    let second = e.item_info().unwrap();
    assert_eq!(second.name, "Ports");
    assert_eq!(second.array_index, 1);
    assert_eq!(second.in_type, InType::UINT16);
    assert_eq!(second.data, &[0xbb, 0x01]);
    assert_eq!(e.format_current_value().unwrap(), "443");

    let raw = e.raw_item_info().unwrap();
    assert_eq!(raw.raw_in_type, InType::UINT16);
    assert_eq!(raw.raw_data, &[0xbb, 0x01]);
}

#[test]
fn test_unnamed_properties_have_empty_names() {
    let callbacks = DefaultCallbacks::new();
    let info = event_info(7, vec![value("Hidden", InType::UINT8).unnamed()]);
    let rec = record(7, vec![9]);
    let mut e = start(&callbacks, &rec, info);

    assert_eq!(walk(&mut e), items(&[(Value, "", "9")]));
}

#[test]
fn test_truncated_payload_stops_the_walk() {
    ensure_env_logger_initialized();
    let callbacks = DefaultCallbacks::new();
    let info = event_info(
        8,
        vec![value("A", InType::UINT32), value("B", InType::UINT64)],
    );
    let rec = record(8, vec![1, 0, 0, 0, 2, 0]);
    let mut e = start(&callbacks, &rec, info.clone());

    assert!(e.move_next());
    assert!(!e.move_next());
    assert_eq!(e.state(), Error);
    assert!(matches!(e.last_error(), Some(EtwError::InvalidData { .. })));

    // Formatting reports the same failure instead of emitting partial output.
    let mut e = start(&callbacks, &rec, info);
    assert!(matches!(
        e.format_current_event(None, etw_decode::JsonSuffixFlags::DEFAULT),
        Err(EtwError::InvalidData { .. })
    ));
}

#[test]
fn test_start_event_without_descriptor() {
    let callbacks = DefaultCallbacks::new();
    let rec = record(42, vec![]);
    let mut e = EtwEnumerator::with_settings(&callbacks, settings()).unwrap();

    assert!(e.start_event(&rec).is_err());
    assert_eq!(e.state(), EnumeratorState::None);
    assert!(e.item_info().is_none());
    assert!(!e.move_next());
}

#[test]
fn test_registered_descriptors_are_found_by_header() {
    let mut callbacks = DefaultCallbacks::new();
    let mut info = event_info(1, vec![value("Pid", InType::UINT32)]);
    info.event_attributes = Some("FILE=\"svc;main.c\";LINE=12".to_string());
    callbacks.register_event(info);

    let rec = record(1, 512u32.to_le_bytes().to_vec());
    let mut e = EtwEnumerator::with_settings(&callbacks, settings()).unwrap();
    e.start_event(&rec).unwrap();

    let details = e.event_details().unwrap();
    assert_eq!(details.provider_name, Some("Contoso-Service"));
    assert_eq!(details.decode_guid, provider());
    assert_eq!(details.control_guid, provider());
    assert_eq!(details.event_guid, None);

    assert_eq!(e.find_current_event_attribute("FILE").unwrap(), "svc;main.c");
    assert_eq!(e.find_current_event_attribute("LINE").unwrap(), "12");
    assert_eq!(
        e.find_current_event_attribute("FUNC"),
        Err(EtwError::NotFound)
    );
    assert_eq!(e.split_current_event_attributes().unwrap().len(), 2);

    assert_eq!(walk(&mut e), items(&[(Value, "Pid", "512")]));
}

#[test]
fn test_wbem_events_use_event_guid_for_decoding() {
    let callbacks = DefaultCallbacks::new();
    let class: etw_decode::Guid = "{3d6fa8d0-fe05-11d0-9dda-00c04fd7ba7c}".parse().unwrap();
    let info = EventInfo {
        decoding_source: DecodingSource::Wbem,
        event_guid: class,
        activity_id_name: Some("ActivityId".to_string()),
        ..event_info(1, vec![])
    };

    let rec = record(1, vec![]);
    let mut e = EtwEnumerator::with_settings(&callbacks, settings()).unwrap();
    e.start_event_with_event_info(&rec, Arc::new(info)).unwrap();

    let details = e.event_details().unwrap();
    assert_eq!(details.decode_guid, class);
    assert_eq!(details.control_guid, provider());
    assert_eq!(details.activity_id_name, Some("ActivityId"));
    assert!(!e.move_next());
    assert_eq!(e.state(), AfterLastItem);
}

#[test]
fn test_event_categories() {
    let mut rec = record(1, vec![]);
    assert_eq!(get_event_category(&rec), EventCategory::Manifest);

    rec.extended_data.push(ExtendedDataItem {
        ext_type: EXT_TYPE_EVENT_SCHEMA_TL,
        data: vec![],
    });
    assert_eq!(get_event_category(&rec), EventCategory::TraceLogging);

    rec.header.flags |= EventHeaderFlags::CLASSIC_HEADER;
    assert_eq!(get_event_category(&rec), EventCategory::Wbem);

    rec.header.flags |= EventHeaderFlags::TRACE_MESSAGE;
    assert_eq!(get_event_category(&rec), EventCategory::TmfWpp);

    let callbacks = DefaultCallbacks::new();
    let mut e = EtwEnumerator::new(&callbacks);
    assert_eq!(e.preview_event(&rec), EventCategory::TmfWpp);
}

#[test]
fn test_timestamp_settings_apply_to_values() {
    let callbacks = DefaultCallbacks::new();
    let mut e = EtwEnumerator::with_settings(&callbacks, settings()).unwrap();
    let ft = SAMPLE_TIMESTAMP.to_le_bytes();

    assert_eq!(
        e.format_value(&ft, InType::FILETIME, OutType::DATETIME_UTC)
            .unwrap(),
        "2018-04-01T00:23:38.6676037Z"
    );

    e.set_timestamp_format(TimestampFormat::new(
        TimestampKind::Internet,
        TimestampFlags::LOW_PRECISION,
    ));
    assert_eq!(
        e.format_value(&ft, InType::FILETIME, OutType::DATETIME_UTC)
            .unwrap(),
        "2018-04-01T00:23:38.667Z"
    );

    e.set_timestamp_format(TimestampFormat::new(
        TimestampKind::Internet,
        TimestampFlags::LOCAL,
    ));
    e.set_timezone_bias_minutes(60).unwrap();
    assert_eq!(
        e.format_value(&ft, InType::FILETIME, OutType::DATETIME_UTC)
            .unwrap(),
        "2018-04-01T01:23:38.6676037+01:00"
    );

    assert!(e.set_timezone_bias_minutes(1441).is_err());
    assert_eq!(e.timezone_bias_minutes(), 60);
    assert!(e.set_timestamp_format_bits(0x7).is_err());
}

#[test]
fn test_adjust_file_time_clamps() {
    assert_eq!(adjust_file_time(SAMPLE_TIMESTAMP, 0), SAMPLE_TIMESTAMP);
    assert_eq!(
        adjust_file_time(SAMPLE_TIMESTAMP, -60),
        SAMPLE_TIMESTAMP - 36_000_000_000
    );
    assert_eq!(adjust_file_time(0, -1), 0);
    assert_eq!(adjust_file_time(i64::MAX, 1), i64::MAX);
}

#[test]
fn test_clear_forgets_the_event() {
    let callbacks = DefaultCallbacks::new();
    let rec = record(1, vec![1]);
    let mut e = start(&callbacks, &rec, event_info(1, vec![value("X", InType::UINT8)]));

    assert!(e.move_next());
    e.clear();
    assert_eq!(e.state(), EnumeratorState::None);
    assert!(e.event_info().is_none());
    assert_eq!(e.reset(), Err(EtwError::InvalidState));
}
