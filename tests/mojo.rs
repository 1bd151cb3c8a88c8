#[macro_use]
extern crate pretty_assertions;

mod common;

use std::fs::{self, File};
use std::io::{BufReader, Cursor};

use ember::collapsed;
use ember::mojo::{DecodeError, Decoder, Event, MetricType, Samples, Special, Writer};
use ember::sample::{Frame, Metrics, Record};

const FULL: &str = "./tests/data/mojo/full.mojo";
const FULL_COLLAPSED: &str = "./tests/data/mojo/full.austin";

fn events(bytes: &[u8]) -> Vec<Result<Event, String>> {
    Decoder::new(bytes)
        .unwrap()
        .map(|e| e.map_err(|e| e.to_string()))
        .collect()
}

#[test]
fn mojo_to_collapsed() {
    let samples = Samples::new(BufReader::new(File::open(FULL).unwrap())).unwrap();
    let mut out = Vec::new();
    for record in samples {
        collapsed::write_record(&mut out, &record.unwrap()).unwrap();
    }
    let expected = BufReader::new(File::open(FULL_COLLAPSED).unwrap());
    common::compare_results(Cursor::new(out), expected, FULL_COLLAPSED);
}

#[test]
fn hex_thread_ids_to_collapsed() {
    let input = "./tests/data/mojo/hex-tid.mojo";
    let expected_file = "./tests/data/mojo/hex-tid.austin";
    let samples = Samples::new(BufReader::new(File::open(input).unwrap())).unwrap();
    let mut out = Vec::new();
    for record in samples {
        collapsed::write_record(&mut out, &record.unwrap()).unwrap();
    }
    let expected = BufReader::new(File::open(expected_file).unwrap());
    common::compare_results(Cursor::new(out), expected, expected_file);
}

#[test]
fn thread_keys_agree_across_formats() {
    let from_mojo: Vec<_> = Samples::new(BufReader::new(
        File::open("./tests/data/mojo/hex-tid.mojo").unwrap(),
    ))
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap();
    let from_text: Vec<_> = collapsed::Reader::new(
        BufReader::new(File::open("./tests/data/mojo/hex-tid.austin").unwrap()),
        collapsed::Options { strict: true },
    )
    .collect::<Result<_, _>>()
    .unwrap();
    assert_eq!(from_mojo, from_text);
}

#[test]
fn decoding_is_deterministic() {
    let bytes = fs::read(FULL).unwrap();
    let first = events(&bytes);
    let second = events(&bytes);
    assert!(first.iter().all(Result::is_ok));
    assert_eq!(first, second);
}

#[test]
fn full_metrics_flush_before_next_stack() {
    let bytes = common::mojo(|w| {
        w.metadata("mode", "full")?;
        w.stack(1, "a")?;
        w.time(100)?;
        w.idle()?;
        w.memory(50)?;
        w.stack(1, "b")?;
        w.time(7)
    });
    let events: Vec<_> = Decoder::new(&bytes[..])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        events,
        vec![
            Event::Metadata {
                key: "mode".into(),
                value: "full".into()
            },
            Event::Stack {
                pid: 1,
                tid: "a".into()
            },
            Event::FullMetrics {
                time: 100,
                idle: true,
                memory: 50
            },
            Event::Stack {
                pid: 1,
                tid: "b".into()
            },
            Event::FullMetrics {
                time: 7,
                idle: false,
                memory: 0
            },
        ]
    );
}

#[test]
fn single_metric_events_pass_through() {
    let bytes = common::mojo(|w| {
        w.metadata("mode", "memory")?;
        w.stack(3, "t")?;
        w.idle()?;
        w.memory(-4096)
    });
    let events: Vec<_> = Decoder::new(&bytes[..])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(events[2], Event::Idle);
    assert_eq!(
        events[3],
        Event::Metric {
            kind: MetricType::Memory,
            value: -4096
        }
    );
}

#[test]
fn every_reference_resolves() {
    let bytes = fs::read(FULL).unwrap();
    let mut defined = std::collections::HashSet::new();
    for event in Decoder::new(&bytes[..]).unwrap() {
        match event.unwrap() {
            Event::FrameDef { key, .. } => {
                defined.insert(key);
            }
            Event::FrameRef { key, .. } => assert!(defined.contains(&key), "{} undefined", key),
            _ => {}
        }
    }
    assert_eq!(defined.len(), 6);
}

#[test]
fn dangling_reference() {
    let bytes = common::mojo(|w| {
        w.stack(1, "1")?;
        w.frame(1, &common::frame("main"))?;
        w.frame_ref(1)?;
        w.frame_ref(2)?;
        w.time(10)
    });
    let mut decoder = Decoder::new(&bytes[..]).unwrap();
    let mut last = None;
    for event in &mut decoder {
        if let Err(e) = event {
            last = Some(e);
            break;
        }
    }
    assert!(matches!(
        last,
        Some(DecodeError::UnresolvedFrameReference { key: 2, .. })
    ));
    assert!(decoder.next().is_none());
}

#[test]
fn truncation_is_an_error() {
    let bytes = fs::read(FULL).unwrap();
    // cut in the middle of the last memory metric
    let cut = &bytes[..bytes.len() - 1];
    let result: Result<Vec<_>, _> = Decoder::new(cut).unwrap().collect();
    assert!(matches!(result, Err(DecodeError::TruncatedInput { .. })));
}

#[test]
fn bad_headers() {
    assert!(matches!(
        Decoder::new(&b"MOX\x01"[..]),
        Err(DecodeError::InvalidFormat(_))
    ));
    assert!(matches!(
        Decoder::new(&b"MOJ"[..]),
        Err(DecodeError::InvalidFormat(_))
    ));
    assert!(matches!(
        Decoder::new(&b"MOJ\x03"[..]),
        Err(DecodeError::InvalidFormat(_))
    ));
}

#[test]
fn version_two_round_trip() {
    let mut frame = Frame::new("handler", "server.py", 30);
    frame.line_end = 32;
    frame.column = 4;
    frame.column_end = 17;

    let mut writer = Writer::with_version(Vec::new(), 2).unwrap();
    writer.stack(9, "0x7f").unwrap();
    writer.frame(1, &frame).unwrap();
    writer.frame_ref(1).unwrap();
    writer.kernel_frame("do_sys_poll").unwrap();
    writer.invalid_frame().unwrap();
    writer.time(250).unwrap();
    let bytes = writer.into_inner().unwrap();

    let samples = Samples::new(&bytes[..]).unwrap();
    assert_eq!(samples.decoder().version(), 2);
    let records: Vec<_> = samples.collect::<Result<_, _>>().unwrap();
    match &records[..] {
        [Record::Sample(sample)] => {
            assert_eq!(sample.pid, Some(9));
            assert_eq!(sample.tid, "127");
            assert_eq!(
                sample.frames,
                vec![
                    frame,
                    Frame::kernel("do_sys_poll"),
                    Frame::special(Special::Invalid.label())
                ]
            );
            assert_eq!(sample.metrics, Metrics::Single(250));
        }
        other => panic!("unexpected records {:?}", other),
    }
}

#[test]
fn unterminated_stack_is_dropped() {
    testing_logger::setup();
    let bytes = common::mojo(|w| {
        w.stack(1, "1")?;
        w.time(5)?;
        w.stack(1, "2")?;
        w.frame(1, &common::frame("main"))?;
        w.frame_ref(1)
    });
    let records: Vec<_> = Samples::new(&bytes[..])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    testing_logger::validate(|captured_logs| {
        let dropped = captured_logs
            .iter()
            .filter(|log| log.body == "Dropping stack of thread 2 with no metrics")
            .count();
        assert_eq!(dropped, 1);
        assert!(captured_logs
            .iter()
            .filter(|log| log.body.starts_with("Dropping"))
            .all(|log| log.level == log::Level::Warn));
    });
}
