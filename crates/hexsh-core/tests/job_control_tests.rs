//! Integration tests for job lifecycle: suspend/resume, background
//! TTY-read suspension, and observer ordering.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hexsh_core::{
    Channel, ChannelCaptures, JobId, JobManager, JobState, SpawnOptions, Terminal,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_for_state(manager: &JobManager, id: JobId, state: JobState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = manager.get(id).expect("job exists").state;
        if current == state {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {current}, wanted {state}"
        );
        manager.process_events(Duration::from_millis(20));
    }
}

fn recorded_transitions(manager: &JobManager) -> Arc<Mutex<Vec<(JobId, JobState, JobState)>>> {
    let log: Arc<Mutex<Vec<(JobId, JobState, JobState)>>> = Arc::default();
    {
        let log = Arc::clone(&log);
        manager.on_status_change(move |id, old, new| {
            log.lock().unwrap().push((id, old, new));
        });
    }
    log
}

// ============================================================================
// Scenario: suspend then continue
// ============================================================================

#[test]
fn ctrl_z_suspends_and_fg_resumes_cat() {
    init_logging();
    let manager = JobManager::new();
    let log = recorded_transitions(&manager);

    // Foreground cat; terminal passthrough stays quiet because cat
    // echoes nothing until fed.
    let id = manager.spawn(SpawnOptions::new("/bin/cat")).unwrap();
    assert_eq!(manager.get(id).unwrap().state, JobState::Foreground);
    assert_eq!(manager.foreground_job(), Some(id));

    manager.handle_ctrl_z();
    wait_for_state(&manager, id, JobState::Stopped);
    assert_eq!(manager.foreground_job(), None);
    assert_eq!(manager.last_stopped(), Some(id));

    // Consume the kernel's stop report before resuming, so a stale
    // WUNTRACED status cannot race the SIGCONT below.
    manager.process_events(Duration::from_millis(50));
    manager.process_events(Duration::from_millis(50));

    manager.foreground(id).unwrap();
    assert_eq!(manager.get(id).unwrap().state, JobState::Foreground);

    // The resumed child still processes input.
    manager.write_input(id, b"x\n").unwrap();
    manager.close_input(id).unwrap();
    let code = manager.wait(id, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(code, 0);

    let deadline = Instant::now() + Duration::from_secs(2);
    while manager.available(id, Channel::ControlOut).unwrap() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut buf = [0u8; 8];
    let n = manager
        .read_buffered(id, Channel::ControlOut, &mut buf)
        .unwrap();
    assert_eq!(&buf[..n], b"x\n");

    // Observed path: Foreground → Stopped → Foreground → Terminated.
    let log = log.lock().unwrap();
    let states: Vec<(JobState, JobState)> = log
        .iter()
        .filter(|(jid, _, _)| *jid == id)
        .map(|(_, old, new)| (*old, *new))
        .collect();
    assert_eq!(
        states,
        vec![
            (JobState::Foreground, JobState::Stopped),
            (JobState::Stopped, JobState::Foreground),
            (JobState::Foreground, JobState::Terminated),
        ]
    );
}

#[test]
fn stopped_job_resumes_in_background_without_terminal_transfer() {
    init_logging();
    let manager = JobManager::new();
    let id = manager
        .spawn(SpawnOptions::new("sleep").arg("10").background(true))
        .unwrap();

    manager.stop(id).unwrap();
    wait_for_state(&manager, id, JobState::Stopped);

    manager.background(id, true).unwrap();
    assert_eq!(manager.get(id).unwrap().state, JobState::Background);

    manager.terminate(id, true).unwrap();
    wait_for_state(&manager, id, JobState::Terminated);
}

// ============================================================================
// Scenario: background read suspension (needs a real TTY)
// ============================================================================

#[test]
fn background_tty_read_suspends_without_shell_involvement() {
    init_logging();
    // The kernel can only deliver SIGTTIN when the child actually has
    // the controlling terminal on its stdin. Without one (CI), this
    // scenario cannot be exercised.
    if Terminal::new().is_none() {
        eprintln!("skipping: no controlling terminal");
        return;
    }

    let manager = JobManager::new();
    let log = recorded_transitions(&manager);

    let mut options = SpawnOptions::new("/bin/sh")
        .arg("-c")
        .arg("read X; echo $X")
        .background(true);
    // Leave stdin on the TTY so the read triggers SIGTTIN.
    options.capture = ChannelCaptures {
        control_in: false,
        ..ChannelCaptures::default()
    };

    let id = manager.spawn(options).unwrap();
    wait_for_state(&manager, id, JobState::Stopped);

    let log = log.lock().unwrap();
    assert!(
        log.iter()
            .any(|(jid, old, new)| *jid == id
                && *old == JobState::Background
                && *new == JobState::Stopped),
        "expected Background → Stopped, saw {log:?}"
    );
    drop(log);
    manager.terminate(id, true).unwrap();
}

// ============================================================================
// Observer guarantees
// ============================================================================

#[test]
fn every_job_ends_with_exactly_one_terminated_transition() {
    init_logging();
    let manager = JobManager::new();
    let log = recorded_transitions(&manager);

    let ids: Vec<JobId> = (0..4)
        .map(|i| {
            manager
                .spawn(
                    SpawnOptions::new("/bin/sh")
                        .arg("-c")
                        .arg(format!("exit {i}"))
                        .background(true),
                )
                .unwrap()
        })
        .collect();

    for id in &ids {
        manager.wait(*id, Some(Duration::from_secs(5))).unwrap();
    }
    manager.process_events(Duration::from_millis(20));

    let log = log.lock().unwrap();
    for id in &ids {
        let terminal = log
            .iter()
            .filter(|(jid, _, new)| jid == id && *new == JobState::Terminated)
            .count();
        assert_eq!(terminal, 1, "job {id}");
    }
}

#[test]
fn exit_codes_are_recorded_per_job() {
    init_logging();
    let manager = JobManager::new();
    let a = manager
        .spawn(
            SpawnOptions::new("/bin/sh")
                .arg("-c")
                .arg("exit 11")
                .background(true),
        )
        .unwrap();
    let b = manager
        .spawn(
            SpawnOptions::new("/bin/sh")
                .arg("-c")
                .arg("exit 22")
                .background(true),
        )
        .unwrap();

    assert_eq!(manager.wait(a, Some(Duration::from_secs(5))).unwrap(), 11);
    assert_eq!(manager.wait(b, Some(Duration::from_secs(5))).unwrap(), 22);

    let infos = manager.list();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|i| i.state == JobState::Terminated));
    assert!(infos.iter().all(|i| i.ended_at_ms >= i.started_at_ms));
}
