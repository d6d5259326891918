#![allow(dead_code)]
use std::path::PathBuf;
use std::sync::{Arc, Once};

use etw_decode::{
    DefaultCallbacks, EnumeratorSettings, EnumeratorState, EtwEnumerator, EventDescriptor,
    EventHeader, EventHeaderFlags, EventInfo, EventRecord, Guid, InType, MapInfo, OutType,
    PropertyInfo, ResultCodeDomain,
};
use serde::Deserialize;

static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
#[cfg(test)]
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}

pub fn samples_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("samples")
        .canonicalize()
        .unwrap()
}

pub fn service_events_bundle() -> PathBuf {
    samples_dir().join("service_events.json")
}

#[derive(Deserialize)]
struct ParameterMessage {
    id: u32,
    message: String,
}

#[derive(Deserialize)]
struct ResultMessage {
    domain: ResultCodeDomain,
    code: u32,
    message: String,
}

#[derive(Deserialize)]
struct Bundle {
    events: Vec<EventInfo>,
    maps: Vec<MapInfo>,
    parameter_messages: Vec<ParameterMessage>,
    result_messages: Vec<ResultMessage>,
    records: Vec<EventRecord>,
}

/// Registers the sample bundle's descriptors and messages, returning its records.
pub fn load_service_events() -> (DefaultCallbacks, Vec<EventRecord>) {
    let text = std::fs::read_to_string(service_events_bundle()).unwrap();
    let bundle: Bundle = serde_json::from_str(&text).unwrap();

    let mut callbacks = DefaultCallbacks::new();
    for info in bundle.events {
        callbacks.register_event(info);
    }
    for map in bundle.maps {
        callbacks.register_map(map);
    }
    for param in bundle.parameter_messages {
        callbacks.register_parameter_message(param.id, param.message);
    }
    for result in bundle.result_messages {
        callbacks.register_result_message(result.domain, result.code, result.message);
    }
    (callbacks, bundle.records)
}

/// 2018-04-01T00:23:38.6676037Z
pub const SAMPLE_TIMESTAMP: i64 = 131_670_158_186_676_037;

pub fn provider() -> Guid {
    "12345678-9ABC-DEF0-0102-030405060708".parse().unwrap()
}

pub fn descriptor(id: u16) -> EventDescriptor {
    EventDescriptor {
        id,
        level: 4,
        ..Default::default()
    }
}

pub fn value(name: &str, in_type: InType) -> PropertyInfo {
    PropertyInfo::value(name, in_type, OutType::NULL)
}

pub fn event_info(id: u16, properties: Vec<PropertyInfo>) -> EventInfo {
    let mut info = EventInfo::with_properties(provider(), descriptor(id), properties);
    info.provider_name = Some("Contoso-Service".to_string());
    info
}

/// A 64-bit record from thread 0x10 of process 0x200 on processor 1.
pub fn record(id: u16, user_data: Vec<u8>) -> EventRecord {
    let mut record = EventRecord::new(
        EventHeader {
            flags: EventHeaderFlags::HEADER_64_BIT | EventHeaderFlags::NO_CPUTIME,
            thread_id: 0x10,
            process_id: 0x200,
            timestamp: SAMPLE_TIMESTAMP,
            provider_id: provider(),
            descriptor: descriptor(id),
            ..Default::default()
        },
        user_data,
    );
    record.buffer_context.processor_index = 1;
    record
}

pub fn utf16z(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

/// Deterministic settings: UTC, default timestamp layout.
pub fn settings() -> EnumeratorSettings {
    EnumeratorSettings::new().timezone_bias_minutes(0)
}

pub fn start<'a>(
    callbacks: &'a DefaultCallbacks,
    record: &'a EventRecord,
    info: EventInfo,
) -> EtwEnumerator<'a> {
    let mut enumerator = EtwEnumerator::with_settings(callbacks, settings()).unwrap();
    enumerator
        .start_event_with_event_info(record, Arc::new(info))
        .unwrap();
    enumerator
}

/// Walks the rest of the event, returning `(state, name, rendered value)` for every item.
pub fn walk(enumerator: &mut EtwEnumerator<'_>) -> Vec<(EnumeratorState, String, String)> {
    let mut items = Vec::new();
    while enumerator.move_next() {
        let state = enumerator.state();
        let name = enumerator.item_info().unwrap().name.to_string();
        let value = if state == EnumeratorState::Value {
            enumerator.format_current_value().unwrap().to_string()
        } else {
            String::new()
        };
        items.push((state, name, value));
    }
    items
}
