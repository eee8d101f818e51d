/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use super::error::{MonitorError, Result};
use crate::guest::{GuestName, RunState, StateCell, StateReason};
use serde::Deserialize;
use serde_json::Value;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::unix::pipe,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

/// Events the VMM writes to its event monitor. Each source has its own
/// variants, `vmm` and `vm` both emit a `shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    VmmStarting,
    VmmShutdown,
    VmBooting,
    VmBooted,
    VmPausing,
    VmPaused,
    VmResuming,
    VmResumed,
    VmSnapshotting,
    VmSnapshotted,
    VmRestoring,
    VmRestored,
    VmResizing,
    VmResized,
    VmShutdown,
    VmDeleted,
    CpuCreateVcpu,
    DeviceActivated,
    DeviceReset,
}

impl Event {
    pub fn from_parts(source: &str, event: &str) -> Option<Self> {
        let event = match (source, event) {
            ("vmm", "starting") => Event::VmmStarting,
            ("vmm", "shutdown") => Event::VmmShutdown,
            ("vm", "booting") => Event::VmBooting,
            ("vm", "booted") => Event::VmBooted,
            ("vm", "pausing") => Event::VmPausing,
            ("vm", "paused") => Event::VmPaused,
            ("vm", "resuming") => Event::VmResuming,
            ("vm", "resumed") => Event::VmResumed,
            ("vm", "snapshotting") => Event::VmSnapshotting,
            ("vm", "snapshotted") => Event::VmSnapshotted,
            ("vm", "restoring") => Event::VmRestoring,
            ("vm", "restored") => Event::VmRestored,
            ("vm", "resizing") => Event::VmResizing,
            ("vm", "resized") => Event::VmResized,
            ("vm", "shutdown") => Event::VmShutdown,
            ("vm", "deleted") => Event::VmDeleted,
            ("cpu_manager", "vcpu-create" | "create-vcpu") => Event::CpuCreateVcpu,
            ("virtio-device", "activated" | "device-activated") => {
                Event::DeviceActivated
            }
            ("virtio-device", "reset" | "device-reset") => Event::DeviceReset,
            _ => return None,
        };
        Some(event)
    }

    /// The run state this event moves the guest to, if any.
    pub fn state_change(&self) -> Option<(RunState, StateReason)> {
        match self {
            Event::VmBooting => Some((RunState::Booting, StateReason::Event)),
            Event::VmBooted => Some((RunState::Running, StateReason::Booted)),
            Event::VmResumed => Some((RunState::Running, StateReason::Unpaused)),
            Event::VmRestored => Some((RunState::Running, StateReason::Event)),
            Event::VmPaused => Some((RunState::Paused, StateReason::Event)),
            Event::VmShutdown | Event::VmmShutdown => {
                Some((RunState::ShuttingDown, StateReason::Shutdown))
            }
            Event::VmDeleted => {
                Some((RunState::NotCreated, StateReason::Destroyed))
            }
            _ => None,
        }
    }

    /// Device and cpu events are handed to subscribers untouched.
    pub fn is_forwarded(&self) -> bool {
        matches!(
            self,
            Event::CpuCreateVcpu | Event::DeviceActivated | Event::DeviceReset
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmmEvent {
    pub event: Event,
    pub properties: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    source: String,
    event: String,
    #[serde(default)]
    properties: Option<Value>,
}

/// Splits the byte stream of the event monitor into events.
///
/// The VMM writes whole JSON objects, each at most `PIPE_BUF` bytes, so one
/// write is never split by the kernel. Reads may still end in the middle of
/// an object, the tail is kept for the next read.
#[derive(Debug)]
pub struct EventDecoder {
    buf: Box<[u8]>,
    filled: usize,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::with_capacity(libc::PIPE_BUF)
    }
}

impl EventDecoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity].into_boxed_slice(), filled: 0 }
    }

    /// Free space to read into.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// Marks `n` bytes of [Self::spare] as filled and decodes what is
    /// complete.
    pub fn commit(&mut self, n: usize) -> Vec<VmmEvent> {
        self.filled = (self.filled + n).min(self.buf.len());

        let mut events = vec![];
        let mut consumed = 0;
        let mut stream = serde_json::Deserializer::from_slice(
            &self.buf[..self.filled],
        )
        .into_iter::<Value>();

        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    consumed = stream.byte_offset();
                    match serde_json::from_value::<RawEvent>(value) {
                        Ok(raw) => match Event::from_parts(&raw.source, &raw.event) {
                            Some(event) => events.push(VmmEvent {
                                event,
                                properties: raw.properties,
                            }),
                            None => debug!(
                                "ignoring unknown event {}/{}",
                                raw.source, raw.event
                            ),
                        },
                        Err(e) => warn!("ignoring malformed event: {e}"),
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    warn!("event stream out of sync, dropping buffer: {e}");
                    consumed = self.filled;
                    break;
                }
                None => {
                    consumed = self.filled;
                    break;
                }
            }
        }

        self.buf.copy_within(consumed..self.filled, 0);
        self.filled -= consumed;

        if self.filled == self.buf.len() {
            warn!("event larger than {} bytes, dropping it", self.buf.len());
            self.filled = 0;
        }

        events
    }
}

/// Background tasks reading the event monitor of one VMM.
///
/// The reader owns the pipe and the buffer and hands decoded events to the
/// consumer, which applies state changes to the guest.
#[derive(Debug)]
pub(super) struct EventStream {
    stop: watch::Sender<bool>,
    reader: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl EventStream {
    /// Starts reading the fifo at `path`. A failed read marks the session
    /// as `closed`.
    pub(super) fn start(
        path: &Path,
        guest: GuestName,
        state: Arc<StateCell>,
        forward: broadcast::Sender<VmmEvent>,
        closed: Arc<AtomicBool>,
    ) -> Result<Self> {
        // read-write keeps the fifo open while the VMM restarts its writer
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)
            .map_err(|source| MonitorError::EventStream {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self::spawn(receiver, guest, state, forward, closed))
    }

    pub(super) fn spawn<R>(
        receiver: R,
        guest: GuestName,
        state: Arc<StateCell>,
        forward: broadcast::Sender<VmmEvent>,
        closed: Arc<AtomicBool>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(64);

        let reader =
            tokio::spawn(read_events(receiver, tx, stop_rx, closed, guest.clone()));
        let consumer = tokio::spawn(apply_events(rx, state, forward, guest));

        Self { stop, reader, consumer }
    }

    pub(super) async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.reader.await;
        // the consumer drains what is queued and ends with the channel
        let _ = self.consumer.await;
    }
}

async fn read_events<R: AsyncRead + Unpin>(
    mut receiver: R,
    events: mpsc::Sender<VmmEvent>,
    mut stop: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    guest: GuestName,
) {
    let mut decoder = EventDecoder::default();
    loop {
        let read = tokio::select! {
            _ = stop.changed() => break,
            read = receiver.read(decoder.spare()) => read,
        };

        match read {
            Ok(0) => {
                debug!("event stream of guest '{guest}' closed");
                break;
            }
            Ok(n) => {
                for event in decoder.commit(n) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("failed to read events of guest '{guest}': {e}");
                if !closed.swap(true, Ordering::SeqCst) {
                    debug!("monitor of guest '{guest}' closed by its event reader");
                }
                break;
            }
        }
    }
    trace!("event reader of guest '{guest}' stopped");
}

async fn apply_events(
    mut events: mpsc::Receiver<VmmEvent>,
    state: Arc<StateCell>,
    forward: broadcast::Sender<VmmEvent>,
    guest: GuestName,
) {
    while let Some(event) = events.recv().await {
        trace!("guest '{guest}' event {:?}", event.event);
        if let Some((run_state, reason)) = event.event.state_change() {
            debug!("guest '{guest}' is now {run_state} after {:?}", event.event);
            state.set(run_state, reason);
        }
        if event.event.is_forwarded() {
            // nobody listening is fine
            let _ = forward.send(event);
        }
    }
}


/// A fifo whose reads always fail.
#[cfg(test)]
#[derive(Debug)]
pub(super) struct BrokenFifo;

#[cfg(test)]
impl AsyncRead for BrokenFifo {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }
}
