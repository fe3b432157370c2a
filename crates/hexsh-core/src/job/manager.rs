//! The job table and its single point of policy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use hexsh_types::{transition, Channel, JobEvent, JobId, JobInfo, JobState};

use crate::error::{Error, Result};
use crate::process::{HexProcess, ProcessConfig};
use crate::terminal::Terminal;

use super::signals::SignalBridge;

/// Per-channel capture toggles for a spawned job.
///
/// Defaults: channels 1, 2, 3 captured; 4, 5 off. An uncaptured
/// control channel is inherited from the shell instead of piped.
#[derive(Debug, Clone, Copy)]
pub struct ChannelCaptures {
    /// Pipe channel 0 so the shell can feed the child input.
    pub control_in: bool,
    /// Capture channel 1 into a ring buffer.
    pub control_out: bool,
    /// Capture channel 2 into a ring buffer.
    pub control_err: bool,
    /// Capture channel 3 (telemetry).
    pub telemetry: bool,
    /// Wire channel 4 (data-in).
    pub data_in: bool,
    /// Wire channel 5 (data-out).
    pub data_out: bool,
}

impl Default for ChannelCaptures {
    fn default() -> Self {
        ChannelCaptures {
            control_in: true,
            control_out: true,
            control_err: true,
            telemetry: true,
            data_in: false,
            data_out: false,
        }
    }
}

/// Everything the manager needs to start a job.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Display string for listings; execution uses `program`/`args`.
    pub command: String,
    /// Executable path or name.
    pub program: String,
    /// Ordered arguments.
    pub args: Vec<String>,
    /// Environment additions.
    pub env: Vec<(String, String)>,
    /// Working directory; inherits when `None`.
    pub working_dir: Option<PathBuf>,
    /// Start in the background.
    pub background: bool,
    /// Put the job in its own process group (default true).
    pub new_process_group: bool,
    /// Channel capture toggles.
    pub capture: ChannelCaptures,
}

impl SpawnOptions {
    /// Options for `program`, displayed as itself.
    pub fn new(program: impl Into<String>) -> SpawnOptions {
        let program = program.into();
        SpawnOptions {
            command: program.clone(),
            program,
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            background: false,
            new_process_group: true,
            capture: ChannelCaptures::default(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the display string.
    pub fn command_text(mut self, text: impl Into<String>) -> Self {
        self.command = text.into();
        self
    }

    /// Start the job in the background.
    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    fn to_process_config(&self) -> ProcessConfig {
        let mut config = ProcessConfig::new(self.program.clone());
        config.args = self.args.clone();
        config.env = self.env.clone();
        config.working_dir = self.working_dir.clone();
        config.capture_control_in = self.capture.control_in;
        config.capture_control_out = self.capture.control_out;
        config.capture_control_err = self.capture.control_err;
        config.enable_telemetry = self.capture.telemetry;
        config.enable_data_in = self.capture.data_in;
        config.enable_data_out = self.capture.data_out;
        config.foreground = !self.background;
        config.new_process_group = self.new_process_group;
        config
    }
}

/// One managed child: process, fabric, state, terminal snapshot.
struct Job {
    id: JobId,
    command: String,
    state: AtomicU8,
    pgid: Pid,
    own_group: bool,
    process: HexProcess,
    saved_modes: Option<crate::terminal::TerminalModes>,
    started_at_ms: u64,
    ended_at_ms: u64,
}

impl Job {
    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn info(&self) -> JobInfo {
        let state = self.state();
        JobInfo {
            id: self.id,
            command: self.command.clone(),
            state,
            pid: Some(self.process.pid()),
            exit_code: (state == JobState::Terminated).then(|| self.process.exit_code()),
            started_at_ms: self.started_at_ms,
            ended_at_ms: self.ended_at_ms,
        }
    }

    /// Deliver `signal` to the job. Its own process group when it has
    /// one; never the shell's group.
    fn signal(&self, signal: Signal) -> Result<()> {
        let result = if self.own_group {
            killpg(self.pgid, signal)
        } else {
            nix::sys::signal::kill(Pid::from_raw(self.process.pid()), signal)
        };
        result.map_err(|e| Error::Signal(std::io::Error::from(e)))
    }
}

type StatusCallback = Box<dyn FnMut(JobId, JobState, JobState) + Send>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Owner of the job table; drives every lifecycle transition.
///
/// Single-threaded at the API boundary. The table mutex is held
/// briefly; observers are notified only after it is released, and a
/// job's state field is an atomic so listings never block on I/O.
pub struct JobManager {
    jobs: Mutex<HashMap<JobId, Job>>,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<StatusCallback>>,
    terminal: Option<Terminal>,
    bridge: Option<SignalBridge>,
}

impl JobManager {
    /// Set up terminal access, shell signal dispositions, and the
    /// SIGCHLD bridge.
    ///
    /// Job-control signals are ignored in the shell so terminal
    /// handoffs cannot suspend it; children reset their dispositions
    /// to default at exec.
    pub fn new() -> JobManager {
        use nix::sys::signal::{signal, SigHandler};
        // SIGPIPE too: a write to a dead child's pipe (or the SIGCHLD
        // self-pipe) must surface as EPIPE, not kill the shell.
        // Children reset all of these to default at exec.
        for sig in [
            Signal::SIGTTOU,
            Signal::SIGTTIN,
            Signal::SIGTSTP,
            Signal::SIGPIPE,
        ] {
            // SAFETY: installing SIG_IGN carries no handler code.
            unsafe {
                let _ = signal(sig, SigHandler::SigIgn);
            }
        }

        let terminal = Terminal::new();
        if let Some(term) = &terminal {
            let _ = term.reclaim_terminal();
        }

        let bridge = match SignalBridge::install() {
            Ok(bridge) => Some(bridge),
            Err(errno) => {
                tracing::warn!(%errno, "SIGCHLD bridge unavailable, relying on polling");
                None
            }
        };

        JobManager {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
            terminal,
            bridge,
        }
    }

    /// Does the shell have a controlling terminal?
    pub fn has_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    /// Spawn a new job and install it in the table.
    ///
    /// A foreground job is handed terminal ownership; failures before
    /// the job is observable surface here and create nothing.
    pub fn spawn(&self, options: SpawnOptions) -> Result<JobId> {
        let event = if options.background {
            JobEvent::SpawnBg
        } else {
            JobEvent::Spawn
        };
        let initial = transition(JobState::None, event)?;

        let process = HexProcess::spawn(options.to_process_config())?;
        let pgid = if options.new_process_group {
            Pid::from_raw(process.pid())
        } else {
            nix::unistd::getpgrp()
        };

        let mut saved_modes = None;
        if !options.background {
            if let Some(term) = &self.terminal {
                saved_modes = term.save_modes().ok();
                let _ = term.give_terminal_to(pgid);
            }
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            id,
            command: options.command,
            state: AtomicU8::new(initial as u8),
            pgid,
            own_group: options.new_process_group,
            process,
            saved_modes,
            started_at_ms: now_ms(),
            ended_at_ms: 0,
        };

        self.lock_jobs().insert(id, job);
        Ok(id)
    }

    /// Bring a job to the foreground, resuming it if stopped.
    pub fn foreground(&self, id: JobId) -> Result<()> {
        let notification = {
            let mut jobs = self.lock_jobs();
            let job = jobs.get_mut(&id).ok_or(Error::NoSuchJob(id))?;
            let current = job.state();
            let next = transition(current, JobEvent::FgCmd)?;

            if current == JobState::Stopped {
                job.signal(Signal::SIGCONT)?;
            }
            if let Some(term) = &self.terminal {
                let _ = term.give_terminal_to(job.pgid);
                if let Some(modes) = &job.saved_modes {
                    let _ = term.restore_modes(modes);
                }
            }
            job.process.streams().set_foreground(true);
            job.set_state(next);
            (id, current, next)
        };
        self.emit(notification);
        Ok(())
    }

    /// Move a job to the background, optionally resuming it.
    pub fn background(&self, id: JobId, resume: bool) -> Result<()> {
        let notification = {
            let mut jobs = self.lock_jobs();
            let job = jobs.get_mut(&id).ok_or(Error::NoSuchJob(id))?;
            let current = job.state();
            let next = transition(current, JobEvent::BgCmd)?;

            if resume && current == JobState::Stopped {
                job.signal(Signal::SIGCONT)?;
            }
            if let Some(term) = &self.terminal {
                let _ = term.reclaim_terminal();
            }
            job.process.streams().set_foreground(false);
            job.set_state(next);
            (id, current, next)
        };
        self.emit(notification);
        Ok(())
    }

    /// Suspend a job. The state change arrives through
    /// [`process_events`](Self::process_events) when the kernel
    /// reports the stop.
    pub fn stop(&self, id: JobId) -> Result<()> {
        self.signal_live_job(id, Signal::SIGTSTP)
    }

    /// Terminate a job: SIGTERM, or SIGKILL when `force`.
    pub fn terminate(&self, id: JobId, force: bool) -> Result<()> {
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let jobs = self.lock_jobs();
        let job = jobs.get(&id).ok_or(Error::NoSuchJob(id))?;
        let state = job.state();
        if !state.is_live() {
            return Err(Error::JobNotLive { id, state });
        }
        if state == JobState::Stopped {
            // A stopped process cannot act on SIGTERM; continue it so
            // the termination can be delivered.
            let _ = job.signal(Signal::SIGCONT);
        }
        job.signal(signal)
    }

    fn signal_live_job(&self, id: JobId, signal: Signal) -> Result<()> {
        let jobs = self.lock_jobs();
        let job = jobs.get(&id).ok_or(Error::NoSuchJob(id))?;
        let state = job.state();
        if !state.is_live() {
            return Err(Error::JobNotLive { id, state });
        }
        job.signal(signal)
    }

    /// Block until the job terminates; returns its exit code.
    pub fn wait(&self, id: JobId, timeout: Option<Duration>) -> Result<i32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let jobs = self.lock_jobs();
                let job = jobs.get(&id).ok_or(Error::NoSuchJob(id))?;
                if job.state() == JobState::Terminated {
                    return Ok(job.process.exit_code());
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::WaitTimeout(id));
                }
            }
            self.process_events(Duration::from_millis(100));
        }
    }

    // =====================================================================
    // Signal bridging (called from the line editor)
    // =====================================================================

    /// Ctrl+C: interrupt the foreground job. No-op without one.
    pub fn handle_ctrl_c(&self) {
        let jobs = self.lock_jobs();
        if let Some(job) = jobs.values().find(|j| j.state() == JobState::Foreground) {
            let _ = job.signal(Signal::SIGINT);
        }
    }

    /// Ctrl+Z: suspend the foreground job, reclaim the terminal, save
    /// the job's modes and restore the shell's. No-op without a
    /// foreground job.
    pub fn handle_ctrl_z(&self) {
        let notification = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.values_mut().find(|j| j.state() == JobState::Foreground)
            else {
                return;
            };
            let current = job.state();
            let Ok(next) = transition(current, JobEvent::CtrlZ) else {
                return;
            };
            let _ = job.signal(Signal::SIGTSTP);

            if let Some(term) = &self.terminal {
                let _ = term.reclaim_terminal();
                job.saved_modes = term.save_modes().ok();
                let _ = term.restore_shell_modes();
            }
            job.process.streams().set_foreground(false);
            job.set_state(next);
            (job.id, current, next)
        };
        self.emit(notification);
    }

    // =====================================================================
    // Event processing
    // =====================================================================

    /// Drain pending kernel events: child exits, stops, continues.
    ///
    /// Sleeps in `poll` over the SIGCHLD self-pipe and every live
    /// process descriptor for at most `timeout`, then reaps with a
    /// non-blocking sweep. Returns the number of state transitions.
    pub fn process_events(&self, timeout: Duration) -> usize {
        self.poll_wakeups(timeout);
        if let Some(bridge) = &self.bridge {
            bridge.drain();
        }
        self.reap_all()
    }

    #[cfg(unix)]
    fn poll_wakeups(&self, timeout: Duration) {
        use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        // Snapshot the descriptors to watch; the owning jobs stay in
        // the table for at least as long as this call (only shutdown
        // removes jobs, and the manager is single-threaded at the API
        // boundary).
        let pidfds: Vec<RawFd> = {
            let jobs = self.lock_jobs();
            jobs.values()
                .filter(|job| job.state().is_live())
                .filter_map(|job| job.process.pidfd().map(|fd| fd.as_raw_fd()))
                .collect()
        };

        let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        let mut fds: Vec<PollFd> = Vec::with_capacity(pidfds.len() + 1);
        if let Some(bridge) = &self.bridge {
            fds.push(PollFd::new(bridge.fd(), PollFlags::POLLIN));
        }
        for raw in &pidfds {
            // SAFETY: see snapshot note above; nothing closes these
            // descriptors while we poll.
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(*raw) },
                PollFlags::POLLIN,
            ));
        }
        if fds.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(u64::from(POLL_CAP_MS))));
            return;
        }
        let _ = poll(&mut fds, PollTimeout::from(ms));
    }

    /// Non-blocking reap over all live jobs.
    fn reap_all(&self) -> usize {
        use nix::errno::Errno;
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        let mut notifications: Vec<(JobId, JobState, JobState)> = Vec::new();
        {
            let mut jobs = self.lock_jobs();
            for job in jobs.values_mut() {
                if !job.state().is_live() {
                    continue;
                }
                let pid = Pid::from_raw(job.process.pid());
                let flags =
                    WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
                loop {
                    match waitpid(pid, Some(flags)) {
                        Ok(WaitStatus::StillAlive) => break,
                        Ok(WaitStatus::Exited(_, code)) => {
                            finish_job(self.terminal.as_ref(), job, code, &mut notifications);
                            break;
                        }
                        Ok(WaitStatus::Signaled(_, signal, _)) => {
                            finish_job(
                                self.terminal.as_ref(),
                                job,
                                128 + signal as i32,
                                &mut notifications,
                            );
                            break;
                        }
                        Ok(WaitStatus::Stopped(_, _signal)) => {
                            suspend_job(self.terminal.as_ref(), job, &mut notifications);
                            break;
                        }
                        Ok(WaitStatus::Continued(_)) => {
                            // Resumed outside fg/bg (e.g. external kill -CONT).
                            let current = job.state();
                            if let Ok(next) = transition(current, JobEvent::BgCmd) {
                                job.set_state(next);
                                notifications.push((job.id, current, next));
                            }
                            continue;
                        }
                        Ok(_) => break,
                        Err(Errno::EINTR) => continue,
                        Err(Errno::ECHILD) => {
                            // Already reaped elsewhere; close out with
                            // whatever code the process handle knows.
                            let code = job.process.exit_code();
                            finish_job(self.terminal.as_ref(), job, code, &mut notifications);
                            break;
                        }
                        Err(errno) => {
                            tracing::warn!(job = %job.id, %errno, "waitpid failed");
                            break;
                        }
                    }
                }
            }
        }

        let count = notifications.len();
        for notification in notifications {
            self.emit(notification);
        }
        count
    }

    /// Register a status observer. Observers see each transition of a
    /// job exactly once, in causal order.
    pub fn on_status_change(
        &self,
        callback: impl FnMut(JobId, JobState, JobState) + Send + 'static,
    ) {
        self.lock_callbacks().push(Box::new(callback));
    }

    // =====================================================================
    // Introspection & per-job I/O
    // =====================================================================

    /// All jobs, sorted by id.
    pub fn list(&self) -> Vec<JobInfo> {
        let jobs = self.lock_jobs();
        let mut infos: Vec<JobInfo> = jobs.values().map(Job::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Info for one job.
    pub fn get(&self, id: JobId) -> Option<JobInfo> {
        self.lock_jobs().get(&id).map(Job::info)
    }

    /// The current foreground job, if any.
    pub fn foreground_job(&self) -> Option<JobId> {
        self.lock_jobs()
            .values()
            .find(|job| job.state() == JobState::Foreground)
            .map(|job| job.id)
    }

    /// The most recently stopped job (highest id), for bare `fg`/`bg`.
    pub fn last_stopped(&self) -> Option<JobId> {
        self.lock_jobs()
            .values()
            .filter(|job| job.state() == JobState::Stopped)
            .map(|job| job.id)
            .max()
    }

    /// Write to a job's control input.
    pub fn write_input(&self, id: JobId, bytes: &[u8]) -> Result<usize> {
        self.with_job(id, |job| job.process.write_input(bytes))?
    }

    /// Close a job's control input (EOF).
    pub fn close_input(&self, id: JobId) -> Result<()> {
        self.with_job(id, |job| job.process.close_input())
    }

    /// Write to a job's data input (channel 4).
    pub fn write_data(&self, id: JobId, bytes: &[u8]) -> Result<usize> {
        self.with_job(id, |job| job.process.write_data(bytes))?
    }

    /// Drain buffered output from one of a job's channels.
    pub fn read_buffered(&self, id: JobId, channel: Channel, out: &mut [u8]) -> Result<usize> {
        self.with_job(id, |job| job.process.read_buffered(channel, out))
    }

    /// Bytes buffered for one of a job's channels.
    pub fn available(&self, id: JobId, channel: Channel) -> Result<usize> {
        self.with_job(id, |job| job.process.available(channel))
    }

    /// Telemetry (or other drop-policy) bytes discarded for a channel.
    pub fn bytes_dropped(&self, id: JobId, channel: Channel) -> Result<u64> {
        self.with_job(id, |job| job.process.streams().bytes_dropped(channel))
    }

    /// Register a data observer on one job's fabric.
    pub fn on_job_data(
        &self,
        id: JobId,
        callback: impl FnMut(Channel, &[u8]) + Send + 'static,
    ) -> Result<()> {
        self.with_job(id, |job| job.process.streams().on_data(callback))
    }

    /// Drain any remaining ring contents through the data observers.
    pub fn flush_job_buffers(&self, id: JobId) -> Result<()> {
        self.with_job(id, |job| job.process.streams().flush_buffers())
    }

    /// Drop terminated jobs from the table.
    pub fn cleanup(&self) {
        self.lock_jobs()
            .retain(|_, job| job.state() != JobState::Terminated);
    }

    /// Remove one job regardless of state. Live children are not
    /// signalled; callers terminate first.
    pub fn remove(&self, id: JobId) {
        self.lock_jobs().remove(&id);
    }

    /// Force-kill every live job, reap, restore the terminal.
    pub fn shutdown(&self) {
        let live: Vec<JobId> = self
            .lock_jobs()
            .values()
            .filter(|job| job.state().is_live())
            .map(|job| job.id)
            .collect();
        for id in &live {
            let _ = self.terminate(*id, true);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let still_live = self
                .lock_jobs()
                .values()
                .any(|job| job.state().is_live());
            if !still_live {
                break;
            }
            self.process_events(Duration::from_millis(50));
        }

        // Dropping the job records stops and joins every drainer, so
        // nothing is still forwarding to the terminal when the shell's
        // modes come back.
        self.lock_jobs().clear();

        if let Some(term) = &self.terminal {
            let _ = term.reclaim_terminal();
            let _ = term.restore_shell_modes();
        }
    }

    // =====================================================================
    // Internals
    // =====================================================================

    fn with_job<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Result<R> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(&id).ok_or(Error::NoSuchJob(id))?;
        Ok(f(job))
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Vec<StatusCallback>> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Observer notification runs strictly after the table lock is
    /// released.
    fn emit(&self, (id, old, new): (JobId, JobState, JobState)) {
        let mut callbacks = self.lock_callbacks();
        for callback in callbacks.iter_mut() {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(id, old, new)));
            if outcome.is_err() {
                tracing::warn!(job = %id, "status observer panicked");
            }
        }
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const POLL_CAP_MS: u16 = 100;

/// Close out a terminated job: record the exit, hand the terminal
/// back if it was foreground, apply the ChildExit transition.
fn finish_job(
    terminal: Option<&Terminal>,
    job: &mut Job,
    code: i32,
    notifications: &mut Vec<(JobId, JobState, JobState)>,
) {
    job.process.record_exit(code);
    job.ended_at_ms = now_ms();
    job.process.streams().set_foreground(false);

    let current = job.state();
    if current == JobState::Foreground {
        if let Some(term) = terminal {
            let _ = term.reclaim_terminal();
            let _ = term.restore_shell_modes();
        }
    }
    if let Ok(next) = transition(current, JobEvent::ChildExit) {
        job.set_state(next);
        notifications.push((job.id, current, next));
    }
}

/// A kernel-reported stop (SIGTSTP, or SIGTTIN from a background TTY
/// read). Invalid when the shell already handled Ctrl+Z itself.
fn suspend_job(
    terminal: Option<&Terminal>,
    job: &mut Job,
    notifications: &mut Vec<(JobId, JobState, JobState)>,
) {
    let current = job.state();
    let Ok(next) = transition(current, JobEvent::ChildStop) else {
        return;
    };
    if current == JobState::Foreground {
        if let Some(term) = terminal {
            let _ = term.reclaim_terminal();
            job.saved_modes = term.save_modes().ok();
            let _ = term.restore_shell_modes();
        }
    }
    job.process.streams().set_foreground(false);
    job.set_state(next);
    notifications.push((job.id, current, next));
}
