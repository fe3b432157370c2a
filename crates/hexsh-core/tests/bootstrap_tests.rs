//! Integration tests for channel identity at child entry.
//!
//! On POSIX the whole bootstrap contract is "logical index equals
//! descriptor number, and nothing else leaks in" — both are checked
//! against real children here. The handle-map payload itself is
//! covered by unit tests in `hexsh-types` and `hexsh-core::bootstrap`.

#![cfg(unix)]

use std::time::{Duration, Instant};

use hexsh_core::{Channel, HexProcess, ProcessConfig};

fn collect_stdout(process: &HexProcess, at_least: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process.available(Channel::ControlOut) < at_least && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = process.read_buffered(Channel::ControlOut, &mut buf);
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    collected
}

#[test]
fn logical_indices_are_descriptor_numbers() {
    // Write to each output by descriptor number only; the parent must
    // see the bytes on the matching channels.
    let mut process = HexProcess::spawn(
        ProcessConfig::new("/bin/sh")
            .arg("-c")
            .arg("printf o >&1; printf e >&2; printf t >&3; printf d >&5"),
    )
    .unwrap();
    assert_eq!(process.wait().unwrap(), 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while process.active_worker_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut buf = [0u8; 8];
    for (channel, expected) in [
        (Channel::ControlOut, b'o'),
        (Channel::ControlErr, b'e'),
        (Channel::Telemetry, b't'),
        (Channel::DataOut, b'd'),
    ] {
        let n = process.read_buffered(channel, &mut buf);
        assert_eq!(n, 1, "{channel}");
        assert_eq!(buf[0], expected, "{channel}");
    }
}

#[cfg(target_os = "linux")]
#[test]
fn no_unrelated_descriptors_reach_the_child() {
    // The child lists its own descriptor table. Everything it sees
    // must be one of the six logical descriptors, plus at most the
    // directory descriptor `ls` itself opens to read /proc/self/fd.
    let mut process = HexProcess::spawn(
        ProcessConfig::new("/bin/sh").arg("-c").arg("ls /proc/self/fd"),
    )
    .unwrap();
    assert_eq!(process.wait().unwrap(), 0);

    let listing = collect_stdout(&process, 1);
    let fds: Vec<i32> = String::from_utf8_lossy(&listing)
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect();

    assert!(!fds.is_empty());
    let stray: Vec<i32> = fds.iter().copied().filter(|fd| *fd > 5).collect();
    assert!(
        stray.len() <= 1,
        "unexpected descriptors leaked into the child: {stray:?}"
    );
    for fd in 0..=5 {
        assert!(fds.contains(&fd), "logical descriptor {fd} missing");
    }
}

#[test]
fn disabled_channels_leave_descriptors_closed() {
    let mut config = ProcessConfig::new("/bin/sh")
        .arg("-c")
        // Writing to a closed descriptor fails; that is the point.
        .arg("(printf x >&3) 2>/dev/null && echo open || echo closed");
    config.enable_telemetry = false;
    let mut process = HexProcess::spawn(config).unwrap();
    assert_eq!(process.wait().unwrap(), 0);

    let out = collect_stdout(&process, 6);
    assert_eq!(out, b"closed\n");
}
