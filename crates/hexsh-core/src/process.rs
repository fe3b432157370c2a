//! Spawning and managing one hex-stream child.
//!
//! [`HexProcess`] glues the pieces together: endpoint creation, the
//! child-side redirection, platform process creation, drainer startup,
//! and the wait/signal surface. Platform specifics stay inside this
//! module and [`crate::stream::endpoints`]; everything above is
//! platform-neutral.
//!
//! Exit codes follow the shell convention: a normal exit returns the
//! program's status, a signal termination returns `128 + signo`, and
//! `-1` means the status could not be determined.

use std::path::PathBuf;

use hexsh_types::Channel;

use crate::error::{Error, Result};
use crate::stream::{ChannelEnables, Endpoint, StreamController};

#[cfg(windows)]
use crate::bootstrap::MapDelivery;

/// Configuration for one spawned child.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable path or name (resolved against PATH).
    pub program: String,
    /// Ordered arguments, not including the program itself.
    pub args: Vec<String>,
    /// Environment additions layered over the parent environment.
    pub env: Vec<(String, String)>,
    /// Working directory for the child; inherits when `None`.
    pub working_dir: Option<PathBuf>,
    /// Pipe channel 0; when false the child inherits the shell's stdin.
    pub capture_control_in: bool,
    /// Pipe channel 1; when false output goes straight to the terminal.
    pub capture_control_out: bool,
    /// Pipe channel 2; when false errors go straight to the terminal.
    pub capture_control_err: bool,
    /// Wire channel 3 (telemetry).
    pub enable_telemetry: bool,
    /// Wire channel 4 (data-in).
    pub enable_data_in: bool,
    /// Wire channel 5 (data-out).
    pub enable_data_out: bool,
    /// Forward channels 1/2 to the host terminal while buffering.
    pub foreground: bool,
    /// Put the child in a fresh process group (POSIX job control).
    pub new_process_group: bool,
    /// How to deliver the handle map on hosts that need one.
    #[cfg(windows)]
    pub map_delivery: MapDelivery,
}

impl ProcessConfig {
    /// Config for `program` with the default six-channel topology.
    pub fn new(program: impl Into<String>) -> ProcessConfig {
        ProcessConfig {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            capture_control_in: true,
            capture_control_out: true,
            capture_control_err: true,
            enable_telemetry: true,
            enable_data_in: true,
            enable_data_out: true,
            foreground: false,
            new_process_group: true,
            #[cfg(windows)]
            map_delivery: MapDelivery::default(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn enables(&self) -> ChannelEnables {
        ChannelEnables {
            control_in: self.capture_control_in,
            control_out: self.capture_control_out,
            control_err: self.capture_control_err,
            telemetry: self.enable_telemetry,
            data_in: self.enable_data_in,
            data_out: self.enable_data_out,
        }
    }
}

/// Map a wait status onto the exit-code convention.
#[cfg(unix)]
fn exit_code_of(status: nix::sys::wait::WaitStatus) -> Option<i32> {
    use nix::sys::wait::WaitStatus;
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// One child with the full six-channel topology attached.
pub struct HexProcess {
    program: String,
    #[cfg(unix)]
    pid: nix::unistd::Pid,
    #[cfg(unix)]
    pidfd: Option<std::os::fd::OwnedFd>,
    #[cfg(windows)]
    handles: windows_impl::ProcessHandles,
    controller: StreamController,
    running: bool,
    exit_code: i32,
    exit_callback: Option<Box<dyn FnOnce(i32) + Send>>,
}

impl HexProcess {
    /// Spawn a child wired to the hex-stream fabric.
    pub fn spawn(config: ProcessConfig) -> Result<HexProcess> {
        Self::spawn_detaching(config, &[]).map(|(process, _)| process)
    }

    /// Spawn while detaching the parent endpoints of the listed
    /// channels from the drain fabric; the caller receives them raw.
    /// Used by [`Pipeline`] to relay data channels between stages.
    pub(crate) fn spawn_detaching(
        config: ProcessConfig,
        detach: &[Channel],
    ) -> Result<(HexProcess, Vec<(Channel, Endpoint)>)> {
        #[cfg(unix)]
        {
            unix_impl::spawn(config, detach)
        }
        #[cfg(windows)]
        {
            windows_impl::spawn(config, detach)
        }
    }

    /// Block until the child terminates; returns its exit code.
    ///
    /// Uses the process descriptor (Linux `pidfd`) when available so a
    /// recycled PID can never be confused for this child.
    pub fn wait(&mut self) -> Result<i32> {
        if !self.running {
            return Ok(self.exit_code);
        }
        let code = self.platform_wait()?;
        self.record_exit(code);
        Ok(code)
    }

    /// Non-blocking status check; `Some(code)` once terminated.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        if !self.running {
            return Ok(Some(self.exit_code));
        }
        match self.platform_try_wait()? {
            Some(code) => {
                self.record_exit(code);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Is the child still running (as far as this handle knows)?
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Exit code once collected; `-1` until then.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// OS process ID.
    pub fn pid(&self) -> i32 {
        #[cfg(unix)]
        {
            self.pid.as_raw()
        }
        #[cfg(windows)]
        {
            self.handles.pid as i32
        }
    }

    /// Borrow the process descriptor, when the host provided one.
    #[cfg(unix)]
    pub fn pidfd(&self) -> Option<std::os::fd::BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        self.pidfd.as_ref().map(|fd| fd.as_fd())
    }

    /// The child's I/O hub.
    pub fn streams(&self) -> &StreamController {
        &self.controller
    }

    /// Register a callback fired exactly once when the exit status is
    /// collected.
    pub fn on_exit(&mut self, callback: impl FnOnce(i32) + Send + 'static) {
        self.exit_callback = Some(Box::new(callback));
    }

    /// Write to the child's control input (channel 0).
    pub fn write_input(&self, bytes: &[u8]) -> Result<usize> {
        self.controller.write_input(bytes)
    }

    /// Close control input, delivering EOF.
    pub fn close_input(&self) {
        self.controller.close_input();
    }

    /// Write to the child's data input (channel 4).
    pub fn write_data(&self, bytes: &[u8]) -> Result<usize> {
        self.controller.write_data(bytes)
    }

    /// Close data input.
    pub fn close_data(&self) {
        self.controller.close_data();
    }

    /// Drain buffered output from one channel.
    pub fn read_buffered(&self, channel: Channel, out: &mut [u8]) -> usize {
        self.controller.read_buffered(channel, out)
    }

    /// Bytes buffered for `channel`.
    pub fn available(&self, channel: Channel) -> usize {
        self.controller.available(channel)
    }

    /// Total bytes the drainers moved for this child.
    pub fn total_bytes_transferred(&self) -> u64 {
        self.controller.total_bytes_transferred()
    }

    /// Drainer workers still running.
    pub fn active_worker_count(&self) -> usize {
        self.controller.active_worker_count()
    }

    /// Record a collected exit status and fire the exit callback.
    /// Idempotent; used both by `wait` and by the job manager's
    /// reaping path.
    pub(crate) fn record_exit(&mut self, code: i32) {
        if !self.running {
            return;
        }
        self.running = false;
        self.exit_code = code;
        if let Some(callback) = self.exit_callback.take() {
            callback(code);
        }
    }

    /// Deliver a signal to the child process.
    #[cfg(unix)]
    pub fn send_signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        nix::sys::signal::kill(self.pid, signal)
            .map_err(|e| Error::Signal(std::io::Error::from(e)))
    }

    /// Terminate the child (Windows has no graceful signal surface).
    #[cfg(windows)]
    pub fn send_signal(&self, _signal: i32) -> Result<()> {
        self.handles.terminate()
    }

    #[cfg(unix)]
    fn platform_wait(&mut self) -> Result<i32> {
        use nix::errno::Errno;
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        loop {
            if let Some(pidfd) = &self.pidfd {
                use std::os::fd::AsFd;

                use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

                let mut fds = [PollFd::new(pidfd.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::NONE) {
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(errno.into()),
                    Ok(_) => {}
                }
                match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => continue,
                    Ok(status) => return Ok(exit_code_of(status).unwrap_or(-1)),
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => return Ok(-1), // reaped elsewhere
                    Err(errno) => return Err(errno.into()),
                }
            } else {
                match waitpid(self.pid, None) {
                    Ok(status) => match exit_code_of(status) {
                        Some(code) => return Ok(code),
                        None => continue,
                    },
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => return Ok(-1),
                    Err(errno) => return Err(errno.into()),
                }
            }
        }
    }

    #[cfg(unix)]
    fn platform_try_wait(&mut self) -> Result<Option<i32>> {
        use nix::errno::Errno;
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(exit_code_of(status)),
            Err(Errno::ECHILD) => Ok(Some(-1)),
            Err(errno) => Err(errno.into()),
        }
    }

    #[cfg(windows)]
    fn platform_wait(&mut self) -> Result<i32> {
        self.handles.wait(None)
    }

    #[cfg(windows)]
    fn platform_try_wait(&mut self) -> Result<Option<i32>> {
        self.handles.try_wait()
    }
}

impl std::fmt::Debug for HexProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HexProcess")
            .field("program", &self.program)
            .field("pid", &self.pid())
            .field("running", &self.running)
            .finish()
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::ffi::CString;
    use std::os::fd::OwnedFd;

    use nix::sys::signal::{signal, SigHandler, Signal};
    use nix::unistd::{execvpe, fork, setpgid, ForkResult, Pid};

    use hexsh_types::Channel;

    use crate::error::{Error, Result};
    use crate::stream::{ChannelSet, Endpoint, StreamController};

    use super::{HexProcess, ProcessConfig};

    pub(super) fn spawn(
        config: ProcessConfig,
        detach: &[Channel],
    ) -> Result<(HexProcess, Vec<(Channel, Endpoint)>)> {
        let channels = ChannelSet::create(&config.enables()).map_err(Error::EndpointCreation)?;

        // Everything the child touches after fork is pre-built here:
        // between fork and exec only async-signal-safe calls are legal.
        let exec = ExecImage::prepare(&config)?;

        // SAFETY: the child branch runs only async-signal-safe
        // operations (dup2/fcntl/setpgid/sigaction/chdir/execvpe) on
        // pre-built data, then _exits.
        match unsafe { fork() }.map_err(|e| Error::Spawn {
            program: config.program.clone(),
            source: std::io::Error::from(e),
        })? {
            ForkResult::Child => {
                if config.new_process_group {
                    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                }
                // The child must not inherit the shell's dispositions.
                for sig in [
                    Signal::SIGINT,
                    Signal::SIGQUIT,
                    Signal::SIGTSTP,
                    Signal::SIGTTIN,
                    Signal::SIGTTOU,
                    Signal::SIGCHLD,
                    Signal::SIGPIPE,
                ] {
                    unsafe {
                        let _ = signal(sig, SigHandler::SigDfl);
                    }
                }
                if channels.redirect_child_side().is_err() {
                    unsafe { libc::_exit(125) };
                }
                if let Some(dir) = &exec.working_dir {
                    if nix::unistd::chdir(dir.as_c_str()).is_err() {
                        unsafe { libc::_exit(126) };
                    }
                }
                let _ = execvpe(&exec.program, &exec.argv, &exec.envp);
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                let mut channels = channels;
                channels.close_child_side();
                let (controller, detached) =
                    match StreamController::start_detaching(channels, config.foreground, detach) {
                        Ok(started) => started,
                        Err(source) => {
                            // The child is already running; take it
                            // down and reap it before surfacing the
                            // failure. No job record exists yet.
                            let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
                            let _ = nix::sys::wait::waitpid(child, None);
                            return Err(Error::Spawn {
                                program: config.program,
                                source,
                            });
                        }
                    };
                let pidfd = pidfd_open(child);
                Ok((
                    HexProcess {
                        program: config.program,
                        pid: child,
                        pidfd,
                        controller,
                        running: true,
                        exit_code: -1,
                        exit_callback: None,
                    },
                    detached,
                ))
            }
        }
    }

    /// Pre-built exec vectors; nothing here allocates after fork.
    struct ExecImage {
        program: CString,
        argv: Vec<CString>,
        envp: Vec<CString>,
        working_dir: Option<CString>,
    }

    impl ExecImage {
        fn prepare(config: &ProcessConfig) -> Result<ExecImage> {
            let spawn_err = |msg: &str| Error::Spawn {
                program: config.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, msg),
            };

            let program =
                CString::new(config.program.as_str()).map_err(|_| spawn_err("NUL in program"))?;

            let mut argv = Vec::with_capacity(config.args.len() + 1);
            argv.push(program.clone());
            for arg in &config.args {
                argv.push(CString::new(arg.as_str()).map_err(|_| spawn_err("NUL in argument"))?);
            }

            // Parent environment with the config's additions layered on.
            let mut merged: Vec<(String, String)> = std::env::vars()
                .filter(|(key, _)| !config.env.iter().any(|(k, _)| k == key))
                .collect();
            merged.extend(config.env.iter().cloned());
            let mut envp = Vec::with_capacity(merged.len());
            for (key, value) in merged {
                envp.push(
                    CString::new(format!("{key}={value}"))
                        .map_err(|_| spawn_err("NUL in environment"))?,
                );
            }

            let working_dir = match &config.working_dir {
                Some(dir) => Some(
                    CString::new(dir.to_string_lossy().into_owned())
                        .map_err(|_| spawn_err("NUL in working directory"))?,
                ),
                None => None,
            };

            Ok(ExecImage {
                program,
                argv,
                envp,
                working_dir,
            })
        }
    }

    /// Acquire a Linux process descriptor for race-free waiting.
    /// Anything older than Linux 5.3 (or another unix) falls back to
    /// plain waitpid.
    #[cfg(target_os = "linux")]
    fn pidfd_open(pid: Pid) -> Option<OwnedFd> {
        use std::os::fd::FromRawFd;

        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0u32) };
        if fd < 0 {
            tracing::debug!(pid = pid.as_raw(), "pidfd_open unavailable, using waitpid");
            return None;
        }
        Some(unsafe { OwnedFd::from_raw_fd(fd as std::os::fd::RawFd) })
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn pidfd_open(_pid: Pid) -> Option<OwnedFd> {
        None
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::ptr;

    use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::processthreadsapi::{
        CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess, GetProcessId,
        InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
        PROCESS_INFORMATION, PROC_THREAD_ATTRIBUTE_LIST,
    };
    use winapi::shared::winerror::WAIT_TIMEOUT;
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::{
        EXTENDED_STARTUPINFO_PRESENT, INFINITE, STARTF_USESTDHANDLES, STARTUPINFOEXW,
        WAIT_OBJECT_0,
    };
    use winapi::um::winnt::HANDLE;

    use hexsh_types::{Channel, HandleMap};

    use crate::bootstrap::{env_entry, flag_entry, MapDelivery};
    use crate::error::{Error, Result};
    use crate::stream::{ChannelSet, Endpoint, StreamController};

    use super::{HexProcess, ProcessConfig};

    // PROC_THREAD_ATTRIBUTE_HANDLE_LIST — ProcThreadAttributeHandleList (2)
    // with the input flag (0x20000).
    const PROC_THREAD_ATTRIBUTE_HANDLE_LIST: usize = 0x0002_0002;

    /// Owned process/thread handles plus the cached PID.
    pub(super) struct ProcessHandles {
        pub process: HANDLE,
        pub thread: HANDLE,
        pub pid: DWORD,
    }

    unsafe impl Send for ProcessHandles {}

    impl Drop for ProcessHandles {
        fn drop(&mut self) {
            unsafe {
                if !self.process.is_null() {
                    CloseHandle(self.process);
                }
                if !self.thread.is_null() {
                    CloseHandle(self.thread);
                }
            }
        }
    }

    impl ProcessHandles {
        pub(super) fn wait(&self, timeout_ms: Option<u32>) -> Result<i32> {
            let timeout = timeout_ms.unwrap_or(INFINITE);
            let rc = unsafe { WaitForSingleObject(self.process, timeout) };
            if rc == WAIT_TIMEOUT {
                return Ok(-1);
            }
            if rc != WAIT_OBJECT_0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let mut code: DWORD = 0;
            let ok = unsafe { GetExitCodeProcess(self.process, &mut code) };
            if ok == 0 {
                return Ok(-1);
            }
            Ok(code as i32)
        }

        pub(super) fn try_wait(&self) -> Result<Option<i32>> {
            let rc = unsafe { WaitForSingleObject(self.process, 0) };
            if rc == WAIT_TIMEOUT {
                return Ok(None);
            }
            self.wait(Some(0)).map(Some)
        }

        pub(super) fn terminate(&self) -> Result<()> {
            let ok = unsafe { TerminateProcess(self.process, 1) };
            if ok == 0 {
                return Err(Error::Signal(std::io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    fn wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    }

    pub(super) fn spawn(
        config: ProcessConfig,
        detach: &[Channel],
    ) -> Result<(HexProcess, Vec<(Channel, Endpoint)>)> {
        let channels = ChannelSet::create(&config.enables()).map_err(Error::EndpointCreation)?;

        // Handle map for channels 3-5; 0-2 ride startup-info.
        let mut map = HandleMap::new();
        for channel in [Channel::Telemetry, Channel::DataIn, Channel::DataOut] {
            if let Some(handle) = channels.child_handle(channel) {
                map.insert(channel, handle as usize as u64);
            }
        }

        // Command line, with the flag fallback when requested.
        let mut cmdline = quote_arg(&config.program);
        for arg in &config.args {
            cmdline.push(' ');
            cmdline.push_str(&quote_arg(arg));
        }
        if config.map_delivery == MapDelivery::CommandLine {
            if let Some(flag) = flag_entry(&map) {
                cmdline.push(' ');
                cmdline.push_str(&flag);
            }
        }

        // Environment block: parent env + config additions + the map.
        let mut env_pairs: Vec<(String, String)> = std::env::vars()
            .filter(|(key, _)| !config.env.iter().any(|(k, _)| k == key))
            .collect();
        env_pairs.extend(config.env.iter().cloned());
        if config.map_delivery == MapDelivery::Env {
            if let Some(pair) = env_entry(&map) {
                env_pairs.retain(|(k, _)| k != &pair.0);
                env_pairs.push(pair);
            }
        }
        let mut env_block: Vec<u16> = Vec::new();
        for (key, value) in &env_pairs {
            env_block.extend(OsStr::new(&format!("{key}={value}")).encode_wide());
            env_block.push(0);
        }
        env_block.push(0);

        // Handle whitelist: exactly the six child-side endpoints.
        let mut inherit: Vec<HANDLE> = Channel::ALL
            .iter()
            .filter_map(|ch| channels.child_handle(*ch))
            .collect();

        let mut size: usize = 0;
        unsafe {
            InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size);
        }
        let mut attr_buf = vec![0u8; size];
        let attr_list = attr_buf.as_mut_ptr() as *mut PROC_THREAD_ATTRIBUTE_LIST;
        let ok = unsafe { InitializeProcThreadAttributeList(attr_list, 1, 0, &mut size) };
        if ok == 0 {
            return Err(Error::EndpointCreation(std::io::Error::last_os_error()));
        }
        let ok = unsafe {
            UpdateProcThreadAttribute(
                attr_list,
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST,
                inherit.as_mut_ptr().cast(),
                inherit.len() * std::mem::size_of::<HANDLE>(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            unsafe { DeleteProcThreadAttributeList(attr_list) };
            return Err(Error::EndpointCreation(std::io::Error::last_os_error()));
        }

        let mut si: STARTUPINFOEXW = unsafe { std::mem::zeroed() };
        si.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as DWORD;
        si.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        si.StartupInfo.hStdInput = channels
            .child_handle(Channel::ControlIn)
            .unwrap_or(INVALID_HANDLE_VALUE);
        si.StartupInfo.hStdOutput = channels
            .child_handle(Channel::ControlOut)
            .unwrap_or(INVALID_HANDLE_VALUE);
        si.StartupInfo.hStdError = channels
            .child_handle(Channel::ControlErr)
            .unwrap_or(INVALID_HANDLE_VALUE);
        si.lpAttributeList = attr_list;

        let mut cmdline_w = wide(&cmdline);
        let cwd_w = config.working_dir.as_ref().map(|d| wide(&d.to_string_lossy()));
        let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        let created = unsafe {
            CreateProcessW(
                ptr::null(),
                cmdline_w.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                TRUE, // inherit, scoped by the whitelist
                EXTENDED_STARTUPINFO_PRESENT | winapi::um::winbase::CREATE_UNICODE_ENVIRONMENT,
                env_block.as_mut_ptr().cast(),
                cwd_w.as_ref().map_or(ptr::null(), |w| w.as_ptr()),
                &mut si.StartupInfo,
                &mut pi,
            )
        };
        unsafe { DeleteProcThreadAttributeList(attr_list) };

        if created == FALSE {
            return Err(Error::Spawn {
                program: config.program.clone(),
                source: std::io::Error::last_os_error(),
            });
        }

        let handles = ProcessHandles {
            process: pi.hProcess,
            thread: pi.hThread,
            pid: unsafe { GetProcessId(pi.hProcess) },
        };

        let mut channels = channels;
        channels.close_child_side();
        let (controller, detached) =
            match StreamController::start_detaching(channels, config.foreground, detach) {
                Ok(started) => started,
                Err(source) => {
                    // The child is already running; take it down
                    // before surfacing the failure.
                    let _ = handles.terminate();
                    let _ = handles.wait(Some(5000));
                    return Err(Error::Spawn {
                        program: config.program,
                        source,
                    });
                }
            };

        Ok((
            HexProcess {
                program: config.program,
                handles,
                controller,
                running: true,
                exit_code: -1,
                exit_callback: None,
            },
            detached,
        ))
    }

    /// Minimal argv quoting for CreateProcessW command lines.
    fn quote_arg(arg: &str) -> String {
        if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
            arg.to_string()
        } else {
            format!("\"{}\"", arg.replace('"', "\\\""))
        }
    }
}

/// Several hex-stream children connected through their data channels.
///
/// `connect(src, dst)` joins stage `src`'s data-out (channel 5) to
/// stage `dst`'s data-in (channel 4). The edge is relayed with the
/// zero-copy fast path where the host offers one; engagement is always
/// explicit — captured channels elsewhere keep their drainers.
#[cfg(unix)]
#[derive(Default)]
pub struct Pipeline {
    configs: Vec<ProcessConfig>,
    connections: Vec<(usize, usize)>,
    stages: Vec<HexProcess>,
    relays: Vec<crate::stream::Relay>,
}

#[cfg(unix)]
impl Pipeline {
    /// Empty pipeline.
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    /// Add a stage; returns its index.
    pub fn add(&mut self, config: ProcessConfig) -> usize {
        self.configs.push(config);
        self.configs.len() - 1
    }

    /// Join `src`'s data-out to `dst`'s data-in.
    pub fn connect(&mut self, src: usize, dst: usize) {
        self.connections.push((src, dst));
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.configs.len().max(self.stages.len())
    }

    /// True when no stage has been added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access a spawned stage.
    pub fn stage(&self, index: usize) -> Option<&HexProcess> {
        self.stages.get(index)
    }

    /// Mutable access to a spawned stage.
    pub fn stage_mut(&mut self, index: usize) -> Option<&mut HexProcess> {
        self.stages.get_mut(index)
    }

    /// Spawn every stage and wire the connected edges.
    ///
    /// On failure, already-spawned stages are killed and reaped so no
    /// half-built pipeline leaks children.
    pub fn spawn(&mut self) -> Result<()> {
        use std::collections::HashMap;

        let configs = std::mem::take(&mut self.configs);
        let mut outs: HashMap<usize, Endpoint> = HashMap::new();
        let mut ins: HashMap<usize, Endpoint> = HashMap::new();

        for (index, mut config) in configs.into_iter().enumerate() {
            let mut detach = Vec::new();
            if self.connections.iter().any(|(src, _)| *src == index) {
                config.enable_data_out = true;
                detach.push(Channel::DataOut);
            }
            if self.connections.iter().any(|(_, dst)| *dst == index) {
                config.enable_data_in = true;
                detach.push(Channel::DataIn);
            }

            let (process, detached) = match HexProcess::spawn_detaching(config, &detach) {
                Ok(spawned) => spawned,
                Err(err) => {
                    self.abort_spawned();
                    return Err(err);
                }
            };
            for (channel, endpoint) in detached {
                match channel {
                    Channel::DataOut => {
                        outs.insert(index, endpoint);
                    }
                    Channel::DataIn => {
                        ins.insert(index, endpoint);
                    }
                    _ => {}
                }
            }
            self.stages.push(process);
        }

        for (src, dst) in self.connections.clone() {
            let (Some(out), Some(input)) = (outs.remove(&src), ins.remove(&dst)) else {
                continue;
            };
            match crate::stream::Relay::spawn(out, input) {
                Ok(relay) => self.relays.push(relay),
                Err(err) => {
                    self.abort_spawned();
                    return Err(Error::Io(err));
                }
            }
        }

        Ok(())
    }

    /// Wait for all stages in order; returns their exit codes.
    pub fn wait_all(&mut self) -> Vec<i32> {
        let codes = self
            .stages
            .iter_mut()
            .map(|stage| stage.wait().unwrap_or(-1))
            .collect();
        // Upstream EOF has propagated; relays drain and exit on their own.
        for relay in self.relays.drain(..) {
            let _ = relay.join();
        }
        codes
    }

    fn abort_spawned(&mut self) {
        for stage in &mut self.stages {
            let _ = stage.send_signal(nix::sys::signal::Signal::SIGKILL);
            let _ = stage.wait();
        }
        self.stages.clear();
        self.relays.clear();
    }
}
