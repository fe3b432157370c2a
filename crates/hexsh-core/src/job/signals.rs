//! SIGCHLD bridging via a self-pipe.
//!
//! The handler does no work: it writes a single byte to a nonblocking
//! pipe the manager polls alongside its process descriptors. No heap
//! allocation, no locks, no non-reentrant I/O runs in signal context.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;

/// Write end of the self-pipe, published to the handler. A later
/// install replaces it (the previous write end is intentionally left
/// to the new bridge's lifetime; one manager per process is the
/// expected shape).
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_signo: libc::c_int) {
    let fd = WAKEUP_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 1;
        // EAGAIN when the pipe is already full is fine; one pending
        // byte is enough to wake the manager.
        unsafe { libc::write(fd, std::ptr::addr_of!(byte).cast(), 1) };
    }
}

/// Receiving side of the SIGCHLD self-pipe.
pub(crate) struct SignalBridge {
    rx: OwnedFd,
}

impl SignalBridge {
    /// Create the pipe and install the SIGCHLD handler.
    ///
    /// The handler is installed without `SA_NOCLDSTOP`, so stops and
    /// continues wake the manager too — that is how Ctrl+Z and
    /// background TTY reads become observable promptly.
    pub(crate) fn install() -> nix::Result<SignalBridge> {
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        WAKEUP_FD.store(tx.into_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler is async-signal-safe (atomic load + write).
        unsafe { sigaction(Signal::SIGCHLD, &action)? };

        Ok(SignalBridge { rx })
    }

    /// Pollable read end.
    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }

    /// Consume pending wakeup bytes.
    pub(crate) fn drain(&self) {
        let mut sink = [0u8; 64];
        loop {
            match nix::unistd::read(self.rx.as_raw_fd(), &mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}
