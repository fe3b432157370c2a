//! Drainer workers: one thread per output channel.
//!
//! Each drainer continuously moves bytes from its source endpoint into
//! its ring buffer so the kernel pipe can never fill up behind a slow
//! consumer — the deadlock a naive `wait()`-then-read design hits as
//! soon as a child writes more than one pipe buffer.
//!
//! ```text
//!   child writes ──▶ kernel pipe ──▶ Drainer thread ──▶ RingBuffer ──▶ consumer
//!                                    │ poll ≤ 100 ms (cancellation bound)
//!                                    │ overflow: block (1, 2, 5) / drop (3)
//!                                    └ EOF / hangup → thread exits
//! ```
//!
//! On Linux, [`Relay`] offers a zero-copy pipe-to-pipe fast path via
//! `splice(2)` for pipeline edges, degrading to a user-space copy loop
//! on any non-retryable error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use hexsh_types::{Channel, OverflowPolicy};

use super::controller::ChannelSink;
use super::endpoints::Endpoint;
use super::ring::RingBuffer;

/// Poll interval; also the upper bound on cancellation latency.
pub const POLL_INTERVAL_MS: u16 = 100;

/// Size of the per-drainer local read buffer.
pub const READ_CHUNK: usize = 8192;

/// Cooperative cancellation flag shared with a worker thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, un-cancelled token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Request cancellation. Workers observe it within
    /// [`POLL_INTERVAL_MS`] plus a scheduler quantum.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub(crate) struct DrainStats {
    pub bytes_transferred: AtomicU64,
    pub bytes_dropped: AtomicU64,
    pub active: AtomicBool,
}

/// A worker that drains one endpoint into one ring buffer.
///
/// Exactly one drainer reads from any given endpoint; the drainer owns
/// the endpoint outright. Dropping the drainer requests cancellation
/// and joins the worker.
pub struct Drainer {
    channel: Channel,
    stats: Arc<DrainStats>,
    token: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl Drainer {
    /// Start a worker draining `endpoint` into `ring` under `policy`.
    ///
    /// Fails when the host cannot create the thread (process limits);
    /// the endpoint is closed on the way out.
    pub(crate) fn spawn(
        channel: Channel,
        endpoint: Endpoint,
        ring: Arc<RingBuffer>,
        policy: OverflowPolicy,
        sink: Arc<ChannelSink>,
    ) -> std::io::Result<Drainer> {
        let stats = Arc::new(DrainStats::default());
        let token = CancelToken::new();

        let worker = {
            let stats = Arc::clone(&stats);
            let token = token.clone();
            std::thread::Builder::new()
                .name(format!("hexsh-drain-{}", channel.name()))
                .spawn(move || drain_loop(channel, endpoint, ring, policy, sink, stats, token))?
        };

        Ok(Drainer {
            channel,
            stats,
            token,
            worker: Some(worker),
        })
    }

    /// The channel this drainer serves.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Total bytes moved out of the endpoint into the ring.
    pub fn bytes_transferred(&self) -> u64 {
        self.stats.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Bytes discarded under the drop policy.
    pub fn bytes_dropped(&self) -> u64 {
        self.stats.bytes_dropped.load(Ordering::Relaxed)
    }

    /// Is the worker thread still running?
    pub fn is_active(&self) -> bool {
        self.stats.active.load(Ordering::Acquire)
    }

    /// Request cancellation without joining.
    pub(crate) fn request_stop(&self) {
        self.token.cancel();
    }
}

impl Drop for Drainer {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(worker) = self.worker.take() {
            // Joining during unwind must not abort; a drainer thread
            // never panics on I/O errors, it exits its loop.
            if worker.join().is_err() {
                tracing::warn!(channel = %self.channel, "drainer worker panicked");
            }
        }
    }
}

#[cfg(unix)]
fn drain_loop(
    channel: Channel,
    endpoint: Endpoint,
    ring: Arc<RingBuffer>,
    policy: OverflowPolicy,
    sink: Arc<ChannelSink>,
    stats: Arc<DrainStats>,
    token: CancelToken,
) {
    use std::os::fd::{AsFd, AsRawFd};

    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    stats.active.store(true, Ordering::Release);
    let mut buf = [0u8; READ_CHUNK];

    'drain: while !token.is_cancelled() {
        let mut fds = [PollFd::new(endpoint.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                tracing::debug!(channel = %channel, %errno, "drainer poll failed");
                break;
            }
            Ok(0) => continue, // timeout: re-check cancellation
            Ok(_) => {}
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLIN) {
            match nix::unistd::read(endpoint.as_raw_fd(), &mut buf) {
                Ok(0) => break, // EOF: producer closed the endpoint
                Ok(n) => {
                    let mut accepted = ring.write(&buf[..n]);
                    if accepted < n {
                        match policy {
                            OverflowPolicy::Drop => {
                                stats
                                    .bytes_dropped
                                    .fetch_add((n - accepted) as u64, Ordering::Relaxed);
                            }
                            OverflowPolicy::Block => {
                                while accepted < n {
                                    if token.is_cancelled() {
                                        break 'drain;
                                    }
                                    let chunk = ring.write(&buf[accepted..n]);
                                    if chunk == 0 {
                                        std::thread::yield_now();
                                    } else {
                                        accepted += chunk;
                                    }
                                }
                            }
                        }
                    }
                    stats
                        .bytes_transferred
                        .fetch_add(accepted as u64, Ordering::Relaxed);
                    sink.data_arrived(channel, &buf[..accepted]);
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(errno) => {
                    tracing::debug!(channel = %channel, %errno, "drainer read failed");
                    break;
                }
            }
        } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
        {
            // Hangup with no pending data; buffered bytes remain readable.
            break;
        }
    }

    stats.active.store(false, Ordering::Release);
}

#[cfg(windows)]
fn drain_loop(
    channel: Channel,
    endpoint: Endpoint,
    ring: Arc<RingBuffer>,
    policy: OverflowPolicy,
    sink: Arc<ChannelSink>,
    stats: Arc<DrainStats>,
    token: CancelToken,
) {
    use std::ptr;
    use winapi::um::fileapi::ReadFile;
    use winapi::um::namedpipeapi::PeekNamedPipe;

    stats.active.store(true, Ordering::Release);
    let mut buf = [0u8; READ_CHUNK];

    'drain: while !token.is_cancelled() {
        // Anonymous pipes have no readiness primitive; peek and sleep
        // keeps the cancellation bound.
        let mut avail: u32 = 0;
        let ok = unsafe {
            PeekNamedPipe(
                endpoint.as_raw(),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut avail,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            break; // writer side gone
        }
        if avail == 0 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            continue;
        }

        let mut n: u32 = 0;
        let ok = unsafe {
            ReadFile(
                endpoint.as_raw(),
                buf.as_mut_ptr().cast(),
                buf.len() as u32,
                &mut n,
                ptr::null_mut(),
            )
        };
        if ok == 0 || n == 0 {
            break;
        }
        let n = n as usize;

        let mut accepted = ring.write(&buf[..n]);
        if accepted < n {
            match policy {
                OverflowPolicy::Drop => {
                    stats
                        .bytes_dropped
                        .fetch_add((n - accepted) as u64, Ordering::Relaxed);
                }
                OverflowPolicy::Block => {
                    while accepted < n {
                        if token.is_cancelled() {
                            break 'drain;
                        }
                        let chunk = ring.write(&buf[accepted..n]);
                        if chunk == 0 {
                            std::thread::yield_now();
                        } else {
                            accepted += chunk;
                        }
                    }
                }
            }
        }
        stats
            .bytes_transferred
            .fetch_add(accepted as u64, Ordering::Relaxed);
        sink.data_arrived(channel, &buf[..accepted]);
    }

    stats.active.store(false, Ordering::Release);
}

/// A pipe-to-pipe relay for pipeline edges (data-out → data-in).
///
/// Engaged only when a pipeline explicitly connects two stages. On
/// Linux it moves pages in kernel space with `splice(2)`; elsewhere,
/// or when splice reports a non-retryable error, it degrades to a
/// user-space copy loop. Cancellation latency is bounded the same way
/// as for drainers.
#[cfg(unix)]
pub struct Relay {
    token: CancelToken,
    worker: Option<JoinHandle<u64>>,
}

#[cfg(unix)]
impl Relay {
    /// Start relaying from `src` (a pipe read end) into `dst` (a pipe
    /// write end). The relay owns both descriptors; dropping `dst` at
    /// exit delivers EOF downstream. Fails when the host cannot create
    /// the thread; both descriptors are closed on the way out.
    pub fn spawn(
        src: std::os::fd::OwnedFd,
        dst: std::os::fd::OwnedFd,
    ) -> std::io::Result<Relay> {
        let token = CancelToken::new();
        let worker = {
            let token = token.clone();
            std::thread::Builder::new()
                .name("hexsh-relay".into())
                .spawn(move || relay_loop(src, dst, token))?
        };
        Ok(Relay {
            token,
            worker: Some(worker),
        })
    }

    /// Wait for the relay to finish (EOF upstream) and return the byte
    /// count moved.
    pub fn join(mut self) -> u64 {
        self.worker
            .take()
            .map(|w| w.join().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(unix)]
impl Drop for Relay {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(unix)]
fn relay_loop(
    src: std::os::fd::OwnedFd,
    dst: std::os::fd::OwnedFd,
    token: CancelToken,
) -> u64 {
    #[cfg(target_os = "linux")]
    {
        match splice_pipe_to_pipe(&src, &dst, &token) {
            Ok(total) => return total,
            // Non-retryable splice failure: fall through to the copy loop.
            Err(err) => {
                tracing::debug!(%err, "splice fast path unavailable, copying");
            }
        }
    }
    copy_loop(&src, &dst, &token)
}

/// Kernel-space page moves between two pipes.
///
/// Returns the total byte count on EOF. `EAGAIN` waits for readiness
/// on either side; `EINTR` retries; anything else is returned to the
/// caller so it can fall back.
#[cfg(target_os = "linux")]
pub fn splice_pipe_to_pipe(
    src: &std::os::fd::OwnedFd,
    dst: &std::os::fd::OwnedFd,
    token: &CancelToken,
) -> std::io::Result<u64> {
    use std::os::fd::{AsFd, AsRawFd};

    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    const SPLICE_MAX: usize = 1024 * 1024;
    let flags = libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK | libc::SPLICE_F_MORE;

    let mut total: u64 = 0;
    while !token.is_cancelled() {
        let moved = unsafe {
            libc::splice(
                src.as_raw_fd(),
                std::ptr::null_mut(),
                dst.as_raw_fd(),
                std::ptr::null_mut(),
                SPLICE_MAX,
                flags,
            )
        };

        if moved > 0 {
            total += moved as u64;
            continue;
        }
        if moved == 0 {
            break; // EOF
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => {
                // Source empty or destination full; wait for either.
                let mut fds = [
                    PollFd::new(src.as_fd(), PollFlags::POLLIN),
                    PollFd::new(dst.as_fd(), PollFlags::POLLOUT),
                ];
                let _ = poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS));
                let hup = fds[0]
                    .revents()
                    .unwrap_or(PollFlags::empty())
                    .contains(PollFlags::POLLHUP);
                let gone = fds[1]
                    .revents()
                    .unwrap_or(PollFlags::empty())
                    .intersects(PollFlags::POLLERR | PollFlags::POLLNVAL);
                if gone || (hup && !fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN)) {
                    break;
                }
            }
            Some(libc::EINTR) => continue,
            // Downstream reader is gone; nothing more can be delivered.
            Some(libc::EPIPE) => break,
            _ => return Err(std::io::Error::last_os_error()),
        }
    }
    Ok(total)
}

/// Portable user-space relay: poll, read, write.
#[cfg(unix)]
fn copy_loop(
    src: &std::os::fd::OwnedFd,
    dst: &std::os::fd::OwnedFd,
    token: &CancelToken,
) -> u64 {
    use std::os::fd::{AsFd, AsRawFd};

    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let mut buf = [0u8; READ_CHUNK];
    let mut total: u64 = 0;

    while !token.is_cancelled() {
        let mut fds = [PollFd::new(src.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Err(Errno::EINTR) => continue,
            Err(_) => break,
            Ok(0) => continue,
            Ok(_) => {}
        }

        let n = match nix::unistd::read(src.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(_) => break,
        };

        let mut written = 0;
        while written < n {
            match nix::unistd::write(dst.as_fd(), &buf[written..n]) {
                Ok(w) => written += w,
                Err(Errno::EINTR) => continue,
                Err(_) => return total, // downstream gone
            }
        }
        total += n as u64;
    }
    total
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::{AsFd, OwnedFd};
    use std::time::{Duration, Instant};

    fn plain_pipe() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap()
    }

    fn write_all(fd: &OwnedFd, mut data: &[u8]) {
        while !data.is_empty() {
            let n = nix::unistd::write(fd.as_fd(), data).unwrap();
            data = &data[n..];
        }
    }

    #[test]
    fn drains_to_eof() {
        let (read, write) = plain_pipe();
        let ring = Arc::new(RingBuffer::new(64 * 1024));
        let sink = Arc::new(ChannelSink::default());

        let drainer = Drainer::spawn(
            Channel::ControlOut,
            read,
            Arc::clone(&ring),
            OverflowPolicy::Block,
            sink,
        )
        .unwrap();

        write_all(&write, b"six channels, four drainers\n");
        drop(write); // EOF

        let deadline = Instant::now() + Duration::from_secs(2);
        while drainer.is_active() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(!drainer.is_active(), "drainer should exit on EOF");
        assert_eq!(drainer.bytes_transferred(), 28);
        let mut out = [0u8; 64];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"six channels, four drainers\n");
    }

    #[test]
    fn cancellation_latency_is_bounded() {
        let (read, write) = plain_pipe();
        let ring = Arc::new(RingBuffer::new(4096));
        let sink = Arc::new(ChannelSink::default());

        let drainer = Drainer::spawn(
            Channel::ControlErr,
            read,
            ring,
            OverflowPolicy::Block,
            sink,
        )
        .unwrap();
        // Writer stays open: only cancellation can stop the worker.
        let start = Instant::now();
        drop(drainer);
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(u64::from(POLL_INTERVAL_MS) + 150),
            "join took {elapsed:?}"
        );
        drop(write);
    }

    #[test]
    fn drop_policy_counts_discarded_bytes() {
        let (read, write) = plain_pipe();
        // Tiny ring so a single chunk overflows.
        let ring = Arc::new(RingBuffer::new(128));
        let sink = Arc::new(ChannelSink::default());

        let drainer = Drainer::spawn(
            Channel::Telemetry,
            read,
            Arc::clone(&ring),
            OverflowPolicy::Drop,
            sink,
        )
        .unwrap();

        let payload = vec![0x7Eu8; 1024];
        write_all(&write, &payload);
        drop(write);

        let deadline = Instant::now() + Duration::from_secs(2);
        while drainer.is_active() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let observed = drainer.bytes_transferred();
        let dropped = drainer.bytes_dropped();
        assert_eq!(observed + dropped, 1024);
        assert!(dropped > 0, "128-byte ring must drop from a 1 KiB burst");
        assert_eq!(ring.available() as u64, observed);
    }

    #[test]
    fn relay_moves_bytes_between_pipes() {
        let (src_read, src_write) = plain_pipe();
        let (dst_read, dst_write) = plain_pipe();

        let relay = Relay::spawn(src_read, dst_write).unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let writer = {
            let payload = payload.clone();
            std::thread::spawn(move || {
                write_all(&src_write, &payload);
                drop(src_write);
            })
        };

        let mut collected = Vec::new();
        let mut file = std::fs::File::from(dst_read);
        use std::io::Read;
        file.read_to_end(&mut collected).unwrap();

        writer.join().unwrap();
        assert_eq!(relay.join(), payload.len() as u64);
        assert_eq!(collected, payload);
    }
}
