//! Per-child aggregation of endpoints, rings, and drainers.
//!
//! A [`StreamController`] owns everything the parent keeps for one
//! child: the input endpoints (channels 0 and 4), six ring buffers,
//! and one drainer per wired output channel. It is constructed after
//! the parent has closed the child-side endpoints; dropping it stops
//! all drainers cooperatively, joins them, and closes the endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hexsh_types::Channel;

use crate::error::{Error, Result};

use super::drain::Drainer;
use super::endpoints::{ChannelSet, Endpoint};
use super::ring::{RingBuffer, DEFAULT_RING_CAPACITY};

/// Observer callback: `(channel, bytes)` in source order per channel.
pub type DataCallback = Box<dyn FnMut(Channel, &[u8]) + Send>;

/// Shared fan-out state between the controller and its drainers.
///
/// Callback invocation serializes through the mutex, so callback order
/// within a channel is well-defined; order across channels is not.
/// Callbacks must not acquire any lock the controller holds.
#[derive(Default)]
pub(crate) struct ChannelSink {
    callbacks: Mutex<Vec<DataCallback>>,
    foreground: AtomicBool,
}

impl ChannelSink {
    /// Called by a drainer after bytes land in the ring.
    pub(crate) fn data_arrived(&self, channel: Channel, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.forward(channel, bytes);
        self.notify(channel, bytes);
    }

    /// In foreground mode, channels 1 and 2 are additionally forwarded
    /// to the host terminal as they are drained, while still being
    /// buffered.
    fn forward(&self, channel: Channel, bytes: &[u8]) {
        if !self.foreground.load(Ordering::Acquire) {
            return;
        }
        use std::io::Write;
        match channel {
            Channel::ControlOut => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(bytes);
                let _ = out.flush();
            }
            Channel::ControlErr => {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(bytes);
            }
            _ => {}
        }
    }

    /// Invoke every registered callback. A panicking observer is
    /// isolated; it must not take down the drainer thread.
    pub(crate) fn notify(&self, channel: Channel, bytes: &[u8]) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for cb in callbacks.iter_mut() {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(channel, bytes)));
            if outcome.is_err() {
                tracing::warn!(channel = %channel, "data observer panicked");
            }
        }
    }

    fn push_callback(&self, cb: DataCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cb);
    }

    fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::Release);
    }
}

/// Guarded input endpoint: distinguishes "never wired" from "closed".
struct InputSlot {
    wired: bool,
    endpoint: Mutex<Option<Endpoint>>,
}

impl InputSlot {
    fn new(endpoint: Option<Endpoint>) -> InputSlot {
        InputSlot {
            wired: endpoint.is_some(),
            endpoint: Mutex::new(endpoint),
        }
    }
}

/// I/O hub for a single child.
pub struct StreamController {
    control_in: InputSlot,
    data_in: InputSlot,
    rings: [Arc<RingBuffer>; 6],
    drainers: Vec<Drainer>,
    sink: Arc<ChannelSink>,
}

impl StreamController {
    /// Bind the parent-side endpoints and start one drainer per wired
    /// output channel. `channels` must already have its child side
    /// closed (done here again defensively).
    ///
    /// Fails when a drainer thread cannot be created; anything already
    /// started is stopped and every endpoint closes on the way out.
    pub fn start(channels: ChannelSet, foreground: bool) -> std::io::Result<StreamController> {
        let (controller, detached) = Self::start_detaching(channels, foreground, &[])?;
        debug_assert!(detached.is_empty());
        Ok(controller)
    }

    /// Like [`start`](Self::start), but hands back the parent-side
    /// endpoints of `detach` channels instead of wiring them, for
    /// pipeline edges that relay a channel elsewhere.
    pub(crate) fn start_detaching(
        mut channels: ChannelSet,
        foreground: bool,
        detach: &[Channel],
    ) -> std::io::Result<(StreamController, Vec<(Channel, Endpoint)>)> {
        channels.close_child_side();

        let sink = Arc::new(ChannelSink::default());
        sink.set_foreground(foreground);

        let rings: [Arc<RingBuffer>; 6] =
            std::array::from_fn(|_| Arc::new(RingBuffer::new(DEFAULT_RING_CAPACITY)));

        let mut detached = Vec::new();
        let mut drainers = Vec::new();
        for channel in Channel::OUTPUTS {
            let Some(endpoint) = channels.take_parent_fd(channel) else {
                continue;
            };
            if detach.contains(&channel) {
                detached.push((channel, endpoint));
                continue;
            }
            // On failure the early return drops `drainers` (joining
            // whatever already started), `detached`, and `channels`,
            // closing every endpoint.
            drainers.push(Drainer::spawn(
                channel,
                endpoint,
                Arc::clone(&rings[channel.index()]),
                channel.default_policy(),
                Arc::clone(&sink),
            )?);
        }

        let control_in = InputSlot::new(channels.take_parent_fd(Channel::ControlIn));
        let data_in = if detach.contains(&Channel::DataIn) {
            if let Some(endpoint) = channels.take_parent_fd(Channel::DataIn) {
                detached.push((Channel::DataIn, endpoint));
            }
            InputSlot::new(None)
        } else {
            InputSlot::new(channels.take_parent_fd(Channel::DataIn))
        };

        channels.close_all();

        Ok((
            StreamController {
                control_in,
                data_in,
                rings,
                drainers,
                sink,
            },
            detached,
        ))
    }

    /// Write to the child's control input (channel 0). May block
    /// briefly on pipe backpressure; returns the byte count written.
    pub fn write_input(&self, bytes: &[u8]) -> Result<usize> {
        Self::write_slot(&self.control_in, Channel::ControlIn, bytes)
    }

    /// Close the child's control input, signalling EOF.
    ///
    /// Mandatory for filters that read all input before emitting
    /// output (`cat`, `sort`, …); forgetting it deadlocks the child,
    /// not this process. Idempotent.
    pub fn close_input(&self) {
        Self::close_slot(&self.control_in);
    }

    /// Write to the child's binary data input (channel 4).
    pub fn write_data(&self, bytes: &[u8]) -> Result<usize> {
        Self::write_slot(&self.data_in, Channel::DataIn, bytes)
    }

    /// Close the child's data input, signalling end of payload.
    /// Closing channel 4 does not affect channels 1 or 2. Idempotent.
    pub fn close_data(&self) {
        Self::close_slot(&self.data_in);
    }

    fn write_slot(slot: &InputSlot, channel: Channel, bytes: &[u8]) -> Result<usize> {
        if !slot.wired {
            return Err(Error::ChannelDisabled(channel));
        }
        let guard = slot.endpoint.lock().unwrap_or_else(|e| e.into_inner());
        let Some(endpoint) = guard.as_ref() else {
            return Err(Error::InputClosed(channel));
        };
        write_endpoint(endpoint, bytes)
    }

    fn close_slot(slot: &InputSlot) {
        slot.endpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Drain up to `out.len()` buffered bytes from `channel`'s ring.
    pub fn read_buffered(&self, channel: Channel, out: &mut [u8]) -> usize {
        self.rings[channel.index()].read(out)
    }

    /// Bytes currently buffered for `channel`.
    pub fn available(&self, channel: Channel) -> usize {
        self.rings[channel.index()].available()
    }

    /// Does `channel` have buffered data?
    pub fn has_pending(&self, channel: Channel) -> bool {
        self.available(channel) > 0
    }

    /// Register a data observer. Within one channel, observers see
    /// bytes in source order; across channels no order is defined.
    pub fn on_data(&self, callback: impl FnMut(Channel, &[u8]) + Send + 'static) {
        self.sink.push_callback(Box::new(callback));
    }

    /// Toggle terminal passthrough for channels 1 and 2.
    pub fn set_foreground(&self, foreground: bool) {
        self.sink.set_foreground(foreground);
    }

    /// Drain every ring and hand the remainder to the observers.
    pub fn flush_buffers(&self) {
        let mut buf = [0u8; 4096];
        for channel in Channel::ALL {
            let ring = &self.rings[channel.index()];
            loop {
                let n = ring.read(&mut buf);
                if n == 0 {
                    break;
                }
                self.sink.notify(channel, &buf[..n]);
            }
        }
    }

    /// Total bytes all drainers have moved for this child.
    pub fn total_bytes_transferred(&self) -> u64 {
        self.drainers.iter().map(Drainer::bytes_transferred).sum()
    }

    /// Bytes moved for one channel.
    pub fn bytes_transferred(&self, channel: Channel) -> u64 {
        self.drainers
            .iter()
            .find(|d| d.channel() == channel)
            .map_or(0, Drainer::bytes_transferred)
    }

    /// Bytes discarded under the drop policy for one channel.
    pub fn bytes_dropped(&self, channel: Channel) -> u64 {
        self.drainers
            .iter()
            .find(|d| d.channel() == channel)
            .map_or(0, Drainer::bytes_dropped)
    }

    /// Number of drainer workers still running.
    pub fn active_worker_count(&self) -> usize {
        self.drainers.iter().filter(|d| d.is_active()).count()
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        // Request stop on every worker before joining any, so total
        // teardown latency is one poll interval, not one per drainer.
        for drainer in &self.drainers {
            drainer.request_stop();
        }
        self.drainers.clear(); // joins
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("drainers", &self.drainers.len())
            .field("active", &self.active_worker_count())
            .finish()
    }
}

#[cfg(unix)]
fn write_endpoint(endpoint: &Endpoint, bytes: &[u8]) -> Result<usize> {
    use std::os::fd::AsFd;

    use nix::errno::Errno;

    loop {
        match nix::unistd::write(endpoint.as_fd(), bytes) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(Error::Io(std::io::Error::from(errno))),
        }
    }
}

#[cfg(windows)]
fn write_endpoint(endpoint: &Endpoint, bytes: &[u8]) -> Result<usize> {
    use winapi::um::fileapi::WriteFile;

    let mut written: u32 = 0;
    let ok = unsafe {
        WriteFile(
            endpoint.as_raw(),
            bytes.as_ptr().cast(),
            bytes.len() as u32,
            &mut written,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(written as usize)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stream::endpoints::ChannelEnables;
    use std::io::Read;
    use std::time::{Duration, Instant};

    /// Build a controller and keep the child-side fds open, emulating
    /// a running child from the test itself.
    fn controller_with_child_fds() -> (StreamController, [Option<std::fs::File>; 6]) {
        let set = ChannelSet::create(&ChannelEnables::default()).unwrap();
        let mut child_files: [Option<std::fs::File>; 6] = Default::default();
        for channel in Channel::ALL {
            let raw = set.child_fd(channel).unwrap();
            // Duplicate so the set can close its copies.
            let dup = nix::unistd::dup(raw).unwrap();
            child_files[channel.index()] =
                Some(unsafe { std::os::fd::FromRawFd::from_raw_fd(dup) });
        }
        let controller = StreamController::start(set, false).unwrap();
        (controller, child_files)
    }

    fn wait_for<F: Fn() -> bool>(pred: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pred() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn output_lands_in_the_right_ring() {
        use std::io::Write;
        let (controller, mut child) = controller_with_child_fds();

        let mut out = child[Channel::ControlOut.index()].take().unwrap();
        out.write_all(b"to stdout").unwrap();
        drop(out);
        let mut err = child[Channel::ControlErr.index()].take().unwrap();
        err.write_all(b"to stderr").unwrap();
        drop(err);

        wait_for(|| controller.available(Channel::ControlOut) == 9
            && controller.available(Channel::ControlErr) == 9);

        let mut buf = [0u8; 32];
        let n = controller.read_buffered(Channel::ControlOut, &mut buf);
        assert_eq!(&buf[..n], b"to stdout");
        let n = controller.read_buffered(Channel::ControlErr, &mut buf);
        assert_eq!(&buf[..n], b"to stderr");
        assert!(!controller.has_pending(Channel::ControlOut));
    }

    #[test]
    fn write_input_reaches_child_side() {
        let (controller, mut child) = controller_with_child_fds();

        let n = controller.write_input(b"abc\n").unwrap();
        assert_eq!(n, 4);
        controller.close_input();

        let mut stdin = child[Channel::ControlIn.index()].take().unwrap();
        let mut collected = Vec::new();
        stdin.read_to_end(&mut collected).unwrap();
        assert_eq!(collected, b"abc\n");
    }

    #[test]
    fn write_after_close_is_input_closed() {
        let (controller, _child) = controller_with_child_fds();
        controller.close_input();
        match controller.write_input(b"late") {
            Err(Error::InputClosed(Channel::ControlIn)) => {}
            other => panic!("expected InputClosed, got {other:?}"),
        }
        // Closing twice is fine.
        controller.close_input();
    }

    #[test]
    fn disabled_data_channel_is_reported() {
        let set = ChannelSet::create(&ChannelEnables {
            telemetry: false,
            data_in: false,
            data_out: false,
            ..Default::default()
        })
        .unwrap();
        let controller = StreamController::start(set, false).unwrap();
        match controller.write_data(b"payload") {
            Err(Error::ChannelDisabled(Channel::DataIn)) => {}
            other => panic!("expected ChannelDisabled, got {other:?}"),
        }
    }

    #[test]
    fn observers_see_channel_and_bytes() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        let (controller, mut child) = controller_with_child_fds();
        let seen: Arc<Mutex<Vec<(Channel, Vec<u8>)>>> = Arc::default();
        {
            let seen = Arc::clone(&seen);
            controller.on_data(move |ch, bytes| {
                seen.lock().unwrap().push((ch, bytes.to_vec()));
            });
        }

        let mut out = child[Channel::ControlOut.index()].take().unwrap();
        out.write_all(b"observed").unwrap();
        drop(out);

        wait_for(|| !seen.lock().unwrap().is_empty());
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, Channel::ControlOut);
        assert_eq!(seen[0].1, b"observed");
    }

    #[test]
    fn panicking_observer_does_not_kill_the_drainer() {
        use std::io::Write;
        let (controller, mut child) = controller_with_child_fds();
        controller.on_data(|_, _| panic!("bad observer"));

        let mut out = child[Channel::ControlOut.index()].take().unwrap();
        out.write_all(b"first").unwrap();
        out.write_all(b"second").unwrap();
        drop(out);

        wait_for(|| controller.available(Channel::ControlOut) == 11);
        assert_eq!(controller.available(Channel::ControlOut), 11);
    }

    #[test]
    fn flush_buffers_delivers_the_remainder() {
        use std::io::Write;
        use std::sync::{Arc, Mutex};

        let (controller, mut child) = controller_with_child_fds();
        let mut dato = child[Channel::DataOut.index()].take().unwrap();
        dato.write_all(&[0xAB; 100]).unwrap();
        drop(dato);

        wait_for(|| controller.available(Channel::DataOut) == 100);

        let flushed: Arc<Mutex<usize>> = Arc::default();
        {
            let flushed = Arc::clone(&flushed);
            controller.on_data(move |ch, bytes| {
                if ch == Channel::DataOut {
                    *flushed.lock().unwrap() += bytes.len();
                }
            });
        }
        controller.flush_buffers();
        assert_eq!(*flushed.lock().unwrap(), 100);
        assert_eq!(controller.available(Channel::DataOut), 0);
    }

    #[test]
    fn workers_join_on_drop() {
        let (controller, child) = controller_with_child_fds();
        assert_eq!(controller.active_worker_count(), 4);
        let start = Instant::now();
        drop(controller);
        assert!(start.elapsed() < Duration::from_millis(400));
        drop(child);
    }

    #[test]
    fn metrics_accumulate_per_channel() {
        use std::io::Write;
        let (controller, mut child) = controller_with_child_fds();

        let mut out = child[Channel::ControlOut.index()].take().unwrap();
        out.write_all(&[b'A'; 500]).unwrap();
        drop(out);

        wait_for(|| controller.bytes_transferred(Channel::ControlOut) == 500);
        assert_eq!(controller.bytes_transferred(Channel::ControlOut), 500);
        assert_eq!(controller.total_bytes_transferred(), 500);
        assert_eq!(controller.bytes_dropped(Channel::ControlOut), 0);
    }
}
