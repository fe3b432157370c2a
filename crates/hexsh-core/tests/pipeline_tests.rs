//! Integration tests for data-channel pipelines.
//!
//! Stages are joined data-out → data-in; on Linux the edge rides the
//! splice fast path, elsewhere a copy relay. Either way the bytes and
//! the exit codes must be identical.

#![cfg(unix)]

use std::time::{Duration, Instant};

use hexsh_core::{Channel, Pipeline, ProcessConfig};

fn sh(script: &str) -> ProcessConfig {
    ProcessConfig::new("/bin/sh").arg("-c").arg(script)
}

#[test]
fn two_stage_pipeline_moves_payload() {
    const N: usize = 100_000;

    let mut pipeline = Pipeline::new();
    let producer = pipeline.add(sh(&format!(
        "head -c {N} /dev/zero | tr '\\0' 'P' >&5"
    )));
    let consumer = pipeline.add(sh("cat <&4"));
    pipeline.connect(producer, consumer);

    pipeline.spawn().unwrap();
    let codes = pipeline.wait_all();
    assert_eq!(codes, vec![0, 0]);

    // The consumer re-emits the payload on its control-out.
    let stage = pipeline.stage(consumer).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while stage.available(Channel::ControlOut) < N {
        assert!(
            Instant::now() < deadline,
            "only {} bytes reached the consumer",
            stage.available(Channel::ControlOut)
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stage.read_buffered(Channel::ControlOut, &mut buf);
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected.len(), N);
    assert!(collected.iter().all(|&b| b == b'P'));
}

#[test]
fn three_stage_pipeline_chains_edges() {
    let mut pipeline = Pipeline::new();
    let first = pipeline.add(sh("printf 'one two three' >&5"));
    let middle = pipeline.add(sh("tr ' ' '\\n' <&4 >&5"));
    let last = pipeline.add(sh("cat <&4"));
    pipeline.connect(first, middle);
    pipeline.connect(middle, last);

    pipeline.spawn().unwrap();
    assert_eq!(pipeline.wait_all(), vec![0, 0, 0]);

    let stage = pipeline.stage(last).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while stage.available(Channel::ControlOut) < 13 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut buf = [0u8; 64];
    let n = stage.read_buffered(Channel::ControlOut, &mut buf);
    assert_eq!(&buf[..n], b"one\ntwo\nthree");
}

#[test]
fn failed_stage_surfaces_its_exit_code() {
    let mut pipeline = Pipeline::new();
    pipeline.add(sh("exit 0"));
    pipeline.add(sh("exit 9"));

    pipeline.spawn().unwrap();
    assert_eq!(pipeline.wait_all(), vec![0, 9]);
}
