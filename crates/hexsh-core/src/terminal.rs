//! Controlling-terminal arbitration between the shell and its jobs.
//!
//! On spawn-foreground the job's process group is given terminal
//! ownership; on Ctrl+Z the shell reclaims it, saving the job's
//! terminal modes and restoring its own; `fg` reverses that. Every
//! operation is a success no-op when no controlling terminal exists,
//! so job control degrades cleanly under pipes and CI harnesses.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::{getpgrp, isatty, tcsetpgrp, Pid};

use crate::error::{Error, Result};

/// Saved terminal modes for one job.
pub type TerminalModes = Termios;

/// The shell's handle on its controlling terminal.
///
/// Construct once at startup with [`Terminal::new`]; `None` means no
/// TTY is attached and the caller should skip arbitration entirely
/// (the manager does this by treating the operations as no-ops).
pub struct Terminal {
    tty: OwnedFd,
    shell_pgid: Pid,
    shell_modes: Termios,
    raw_mode: bool,
}

impl Terminal {
    /// Open the controlling terminal, falling back to stdin, and
    /// snapshot the shell's modes. Returns `None` without a TTY.
    pub fn new() -> Option<Terminal> {
        let tty = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")
            .map(OwnedFd::from)
            .ok()
            .or_else(|| {
                let stdin = std::io::stdin().as_fd().try_clone_to_owned().ok()?;
                isatty(stdin.as_raw_fd()).unwrap_or(false).then_some(stdin)
            })?;

        let shell_modes = tcgetattr(tty.as_fd()).ok()?;
        Some(Terminal {
            tty,
            shell_pgid: getpgrp(),
            shell_modes,
            raw_mode: false,
        })
    }

    /// The shell's own process group.
    pub fn shell_pgid(&self) -> Pid {
        self.shell_pgid
    }

    /// Hand terminal ownership to `pgid`.
    ///
    /// SIGTTOU must already be ignored in the shell (the job manager
    /// arranges this at startup) or this call would suspend us.
    pub fn give_terminal_to(&self, pgid: Pid) -> Result<()> {
        tcsetpgrp(self.tty.as_fd(), pgid)
            .map_err(|e| Error::Terminal(std::io::Error::from(e)))
    }

    /// Take terminal ownership back for the shell.
    pub fn reclaim_terminal(&self) -> Result<()> {
        self.give_terminal_to(self.shell_pgid)
    }

    /// Snapshot the current terminal modes (used when suspending a
    /// foreground job so they can be restored on `fg`).
    pub fn save_modes(&self) -> Result<TerminalModes> {
        tcgetattr(self.tty.as_fd()).map_err(|e| Error::Terminal(std::io::Error::from(e)))
    }

    /// Restore previously saved modes.
    pub fn restore_modes(&self, modes: &TerminalModes) -> Result<()> {
        tcsetattr(self.tty.as_fd(), SetArg::TCSADRAIN, modes)
            .map_err(|e| Error::Terminal(std::io::Error::from(e)))
    }

    /// Restore the modes captured at shell startup.
    pub fn restore_shell_modes(&self) -> Result<()> {
        self.restore_modes(&self.shell_modes)
    }

    /// Disable canonical mode, echo and signal generation so the line
    /// editor can see raw keystrokes (Ctrl+C/Z arrive as bytes and are
    /// forwarded to the job manager instead of raising signals).
    pub fn enter_raw_mode(&mut self) -> Result<()> {
        use nix::sys::termios::{InputFlags, LocalFlags};

        let mut raw = self.shell_modes.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
        raw.input_flags.remove(InputFlags::IXON | InputFlags::ICRNL);
        raw.control_chars[nix::sys::termios::SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[nix::sys::termios::SpecialCharacterIndices::VTIME as usize] = 0;

        tcsetattr(self.tty.as_fd(), SetArg::TCSAFLUSH, &raw)
            .map_err(|e| Error::Terminal(std::io::Error::from(e)))?;
        self.raw_mode = true;
        Ok(())
    }

    /// Leave raw mode, restoring the shell's startup modes.
    pub fn exit_raw_mode(&mut self) -> Result<()> {
        tcsetattr(self.tty.as_fd(), SetArg::TCSAFLUSH, &self.shell_modes)
            .map_err(|e| Error::Terminal(std::io::Error::from(e)))?;
        self.raw_mode = false;
        Ok(())
    }

    /// Is raw mode currently active?
    pub fn in_raw_mode(&self) -> bool {
        self.raw_mode
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("shell_pgid", &self.shell_pgid)
            .field("raw_mode", &self.raw_mode)
            .finish()
    }
}
