#[macro_use]
extern crate criterion;
extern crate etw_decode;

use criterion::Criterion;
use etw_decode::{
    DefaultCallbacks, EnumeratorSettings, EtwEnumerator, EventDescriptor, EventHeader,
    EventHeaderFlags, EventInfo, EventRecord, Guid, InType, JsonSuffixFlags, OutType,
    PropertyInfo, PropertyParam,
};

fn provider() -> Guid {
    Guid::new(0x1234_5678, 0x9abc, 0xdef0, [1, 2, 3, 4, 5, 6, 7, 8])
}

fn callbacks() -> DefaultCallbacks {
    let descriptor = EventDescriptor {
        id: 1,
        level: 4,
        ..Default::default()
    };
    let mut info = EventInfo::with_properties(
        provider(),
        descriptor,
        vec![
            PropertyInfo::value("Name", InType::UNICODESTRING, OutType::NULL),
            PropertyInfo::value("Pid", InType::UINT32, OutType::NULL),
            PropertyInfo::value("Count", InType::UINT16, OutType::NULL),
            PropertyInfo::value("Samples", InType::UINT32, OutType::NULL)
                .with_count(PropertyParam::FromProperty(2)),
        ],
    );
    info.provider_name = Some("Bench-Provider".to_string());
    info.event_message = Some("Process %1 (%2) reported %3 samples: %4".to_string());

    let mut callbacks = DefaultCallbacks::new();
    callbacks.register_event(info);
    callbacks
}

fn records(count: usize) -> Vec<EventRecord> {
    (0..count)
        .map(|i| {
            let mut user_data: Vec<u8> = "worker"
                .encode_utf16()
                .chain(std::iter::once(0))
                .flat_map(|unit| unit.to_le_bytes())
                .collect();
            user_data.extend_from_slice(&(i as u32).to_le_bytes());
            user_data.extend_from_slice(&8u16.to_le_bytes());
            for sample in 0..8u32 {
                user_data.extend_from_slice(&(sample * 100).to_le_bytes());
            }

            EventRecord::new(
                EventHeader {
                    flags: EventHeaderFlags::HEADER_64_BIT | EventHeaderFlags::NO_CPUTIME,
                    thread_id: 4,
                    process_id: i as u32,
                    timestamp: 131_670_158_186_676_037 + i as i64,
                    provider_id: provider(),
                    descriptor: EventDescriptor {
                        id: 1,
                        level: 4,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                user_data,
            )
        })
        .collect()
}

fn format_records(callbacks: &DefaultCallbacks, records: &[EventRecord], json: bool) {
    let settings = EnumeratorSettings::new().timezone_bias_minutes(0);
    let mut enumerator = EtwEnumerator::with_settings(callbacks, settings).unwrap();

    for (i, record) in records.iter().enumerate() {
        if let Err(e) = enumerator.start_event(record) {
            println!("Error while starting record {}, {:?}", i, e);
            continue;
        }
        let formatted = if json {
            enumerator.format_current_event_as_json(None, JsonSuffixFlags::DEFAULT)
        } else {
            enumerator.format_current_event(Some("[%9]%8.%3::%4 "), JsonSuffixFlags::DEFAULT)
        };
        if let Err(e) = formatted {
            println!("Error while formatting record {}, {:?}", i, e);
        }
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let callbacks = callbacks();
    let records = records(100);

    c.bench_function("format 100 messages", |b| {
        b.iter(|| format_records(&callbacks, &records, false))
    });
    c.bench_function("format 100 records as json", |b| {
        b.iter(|| format_records(&callbacks, &records, true))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
