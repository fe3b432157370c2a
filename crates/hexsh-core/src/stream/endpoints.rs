//! Host-level endpoints for the six-channel fabric.
//!
//! A [`ChannelSet`] owns the 12 endpoints (6 channels × parent/child
//! side) for one child. Lifecycle: created before spawn; the child
//! redirects its side onto logical descriptors 0–5; the parent closes
//! the child side as soon as spawn returns; parent-side endpoints
//! close on teardown. No parent-side endpoint may remain open in the
//! child — that would leak a back-channel.

use hexsh_types::{Channel, ChannelDirection};

#[cfg(unix)]
pub use unix::{ChannelSet, Endpoint};
#[cfg(windows)]
pub use windows::{ChannelSet, Endpoint};

/// Which channels get pipes. A channel without a pipe keeps the
/// descriptor the child inherits from the shell — uncaptured control
/// output goes straight to the terminal, and an uncaptured control
/// input leaves the child reading the real TTY (which is what lets the
/// kernel stop a background reader with SIGTTIN).
#[derive(Debug, Clone, Copy)]
pub struct ChannelEnables {
    /// Pipe channel 0 (control-in).
    pub control_in: bool,
    /// Pipe channel 1 (control-out).
    pub control_out: bool,
    /// Pipe channel 2 (control-err).
    pub control_err: bool,
    /// Pipe channel 3 (telemetry).
    pub telemetry: bool,
    /// Pipe channel 4 (data-in).
    pub data_in: bool,
    /// Pipe channel 5 (data-out).
    pub data_out: bool,
}

impl ChannelEnables {
    /// True when `channel` should get a pipe.
    pub fn includes(&self, channel: Channel) -> bool {
        match channel {
            Channel::ControlIn => self.control_in,
            Channel::ControlOut => self.control_out,
            Channel::ControlErr => self.control_err,
            Channel::Telemetry => self.telemetry,
            Channel::DataIn => self.data_in,
            Channel::DataOut => self.data_out,
        }
    }
}

impl Default for ChannelEnables {
    fn default() -> Self {
        ChannelEnables {
            control_in: true,
            control_out: true,
            control_err: true,
            telemetry: true,
            data_in: true,
            data_out: true,
        }
    }
}

/// Which pipe end each side holds for a channel.
///
/// The child reads channels 0 and 4 (it gets the read end) and writes
/// the rest (it gets the write end); the parent holds the opposite end.
fn child_holds_read_end(channel: Channel) -> bool {
    channel.direction() == ChannelDirection::ChildReads
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use nix::unistd::{dup2, pipe2};

    use hexsh_types::Channel;

    use super::{child_holds_read_end, ChannelEnables};

    /// Parent-side endpoint handle on POSIX hosts.
    pub type Endpoint = OwnedFd;

    #[derive(Debug, Default)]
    struct Slot {
        read: Option<OwnedFd>,
        write: Option<OwnedFd>,
    }

    /// The 12 endpoints for one child on a POSIX host.
    #[derive(Debug, Default)]
    pub struct ChannelSet {
        slots: [Slot; 6],
    }

    impl ChannelSet {
        /// Create pipes for the control channels plus whichever of
        /// 3–5 are enabled. All descriptors are close-on-exec; the six
        /// logical endpoints are re-established in the child by
        /// duplication, which clears close-on-exec on the targets.
        pub fn create(enables: &ChannelEnables) -> io::Result<ChannelSet> {
            let mut set = ChannelSet::default();
            for channel in Channel::ALL {
                if !enables.includes(channel) {
                    continue;
                }
                let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
                set.slots[channel.index()] = Slot {
                    read: Some(read),
                    write: Some(write),
                };
            }
            Ok(set)
        }

        /// The raw descriptor the child will use for `channel`.
        pub fn child_fd(&self, channel: Channel) -> Option<RawFd> {
            let slot = &self.slots[channel.index()];
            let end = if child_holds_read_end(channel) {
                slot.read.as_ref()
            } else {
                slot.write.as_ref()
            };
            end.map(|fd| fd.as_raw_fd())
        }

        /// Borrow the parent-side endpoint for `channel`.
        pub fn parent_fd(&self, channel: Channel) -> Option<BorrowedFd<'_>> {
            let slot = &self.slots[channel.index()];
            let end = if child_holds_read_end(channel) {
                slot.write.as_ref()
            } else {
                slot.read.as_ref()
            };
            end.map(|fd| fd.as_fd())
        }

        /// Take ownership of the parent-side endpoint for `channel`.
        /// Used to hand output ends to drainers and input ends to the
        /// controller's writers.
        pub fn take_parent_fd(&mut self, channel: Channel) -> Option<OwnedFd> {
            let slot = &mut self.slots[channel.index()];
            if child_holds_read_end(channel) {
                slot.write.take()
            } else {
                slot.read.take()
            }
        }

        /// Re-establish the child side onto logical descriptors 0–5.
        ///
        /// Called in the child between fork and exec, so it must not
        /// allocate. Source descriptors that landed in 0–5 are first
        /// raised above 5 (keeping close-on-exec) so the dup2 ladder
        /// cannot clobber an end it still needs; every original closes
        /// at exec via close-on-exec.
        pub fn redirect_child_side(&self) -> nix::Result<()> {
            let mut sources: [RawFd; 6] = [-1; 6];

            for channel in Channel::ALL {
                let Some(fd) = self.child_fd(channel) else {
                    continue;
                };
                sources[channel.index()] = if fd <= 5 {
                    fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(6))?
                } else {
                    fd
                };
            }

            for channel in Channel::ALL {
                let src = sources[channel.index()];
                if src >= 0 {
                    dup2(src, channel.index() as RawFd)?;
                }
            }
            Ok(())
        }

        /// Drop the child-side endpoints. The parent calls this as
        /// soon as spawn returns.
        pub fn close_child_side(&mut self) {
            for channel in Channel::ALL {
                let slot = &mut self.slots[channel.index()];
                if child_holds_read_end(channel) {
                    slot.read = None;
                } else {
                    slot.write = None;
                }
            }
        }

        /// Drop everything still held.
        pub fn close_all(&mut self) {
            self.slots = Default::default();
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::io;
    use std::ptr;

    use winapi::shared::minwindef::{DWORD, TRUE};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
    use winapi::um::namedpipeapi::CreatePipe;
    use winapi::um::winbase::HANDLE_FLAG_INHERIT;
    use winapi::um::winnt::HANDLE;

    use hexsh_types::Channel;

    use super::{child_holds_read_end, ChannelEnables};

    /// Owned kernel handle; closed on drop.
    #[derive(Debug)]
    pub struct Endpoint(HANDLE);

    // Pipe handles are process-global kernel objects; the wrapper only
    // moves the close obligation between threads.
    unsafe impl Send for Endpoint {}
    unsafe impl Sync for Endpoint {}

    impl Endpoint {
        /// Raw handle value for startup-info and the handle map.
        pub fn as_raw(&self) -> HANDLE {
            self.0
        }
    }

    impl Drop for Endpoint {
        fn drop(&mut self) {
            if self.0 != INVALID_HANDLE_VALUE && !self.0.is_null() {
                unsafe { CloseHandle(self.0) };
            }
        }
    }

    #[derive(Debug, Default)]
    struct Slot {
        read: Option<Endpoint>,
        write: Option<Endpoint>,
    }

    /// The 12 endpoints for one child on Windows.
    ///
    /// Child-side handles stay inheritable; the parent's own ends are
    /// marked non-inheritable so they cannot leak into the child even
    /// before the handle whitelist is applied at process creation.
    #[derive(Debug, Default)]
    pub struct ChannelSet {
        slots: [Slot; 6],
    }

    impl ChannelSet {
        /// Create pipes for the control channels plus whichever of
        /// 3–5 are enabled.
        pub fn create(enables: &ChannelEnables) -> io::Result<ChannelSet> {
            let mut sa = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
                lpSecurityDescriptor: ptr::null_mut(),
                bInheritHandle: TRUE,
            };

            let mut set = ChannelSet::default();
            for channel in Channel::ALL {
                if !enables.includes(channel) {
                    continue;
                }
                let mut read: HANDLE = INVALID_HANDLE_VALUE;
                let mut write: HANDLE = INVALID_HANDLE_VALUE;
                let ok = unsafe { CreatePipe(&mut read, &mut write, &mut sa, 0) };
                if ok == 0 {
                    return Err(io::Error::last_os_error());
                }
                let (read, write) = (Endpoint(read), Endpoint(write));
                // Strip inheritance from the parent's end.
                let parent = if child_holds_read_end(channel) {
                    &write
                } else {
                    &read
                };
                unsafe {
                    winapi::um::handleapi::SetHandleInformation(
                        parent.as_raw(),
                        HANDLE_FLAG_INHERIT,
                        0,
                    );
                }
                set.slots[channel.index()] = Slot {
                    read: Some(read),
                    write: Some(write),
                };
            }
            Ok(set)
        }

        /// The handle the child will use for `channel`.
        pub fn child_handle(&self, channel: Channel) -> Option<HANDLE> {
            let slot = &self.slots[channel.index()];
            let end = if child_holds_read_end(channel) {
                slot.read.as_ref()
            } else {
                slot.write.as_ref()
            };
            end.map(Endpoint::as_raw)
        }

        /// Take ownership of the parent-side endpoint for `channel`.
        pub fn take_parent_fd(&mut self, channel: Channel) -> Option<Endpoint> {
            let slot = &mut self.slots[channel.index()];
            if child_holds_read_end(channel) {
                slot.write.take()
            } else {
                slot.read.take()
            }
        }

        /// Drop the child-side endpoints after process creation.
        pub fn close_child_side(&mut self) {
            for channel in Channel::ALL {
                let slot = &mut self.slots[channel.index()];
                if child_holds_read_end(channel) {
                    slot.read = None;
                } else {
                    slot.write = None;
                }
            }
        }

        /// Drop everything still held.
        pub fn close_all(&mut self) {
            self.slots = Default::default();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn create_wires_all_enabled_channels() {
        let set = ChannelSet::create(&ChannelEnables::default()).unwrap();
        for channel in Channel::ALL {
            assert!(set.child_fd(channel).is_some(), "{channel} missing");
            assert!(set.parent_fd(channel).is_some(), "{channel} missing");
        }
    }

    #[test]
    fn disabled_channels_get_no_pipes() {
        let enables = ChannelEnables {
            telemetry: false,
            data_in: false,
            data_out: false,
            ..Default::default()
        };
        let set = ChannelSet::create(&enables).unwrap();
        assert!(set.child_fd(Channel::Telemetry).is_none());
        assert!(set.child_fd(Channel::DataIn).is_none());
        assert!(set.child_fd(Channel::DataOut).is_none());
        assert!(set.child_fd(Channel::ControlOut).is_some());
    }

    #[test]
    fn parent_and_child_hold_opposite_ends() {
        let mut set = ChannelSet::create(&ChannelEnables::default()).unwrap();
        let child = set.child_fd(Channel::ControlOut).unwrap();
        let parent = set.take_parent_fd(Channel::ControlOut).unwrap();
        assert_ne!(child, parent.as_raw_fd());
    }

    #[test]
    fn close_child_side_keeps_parent_ends() {
        let mut set = ChannelSet::create(&ChannelEnables::default()).unwrap();
        set.close_child_side();
        for channel in Channel::ALL {
            assert!(set.child_fd(channel).is_none());
            assert!(set.parent_fd(channel).is_some());
        }
    }
}
