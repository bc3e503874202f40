// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame decoder abstraction. A decoder owns the empty-buffer queue and the
//! map of frames currently being reassembled, and drives each frame through
//! `Empty -> Incomplete -> {Complete | Timedout | Error}`. Transport
//! variants differ only in how bytes arrive.

use framepipe_common::error::{ConfigError, DecoderError};
use framepipe_ipc::{IpcMessage, SharedBufferManager};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReceiveState {
    Empty,
    Incomplete,
    Complete,
    Timedout,
    Error,
}

/// Per-frame reassembly header written at the start of every frame buffer.
/// Downstream uses the packet-state bitmap to zero-fill missing packets of
/// force-completed frames.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferFrameHeader {
    pub frame_number: u64,
    pub frame_state: u32,
    pub total_packets: u32,
    pub packets_received: u32,
    pub _reserved: u32,
    pub packet_state: [u64; Self::PACKET_STATE_WORDS],
}

impl BufferFrameHeader {
    pub const PACKET_STATE_WORDS: usize = 4;
    pub const MAX_PACKETS: usize = Self::PACKET_STATE_WORDS * 64;

    pub fn new(frame_number: u64, total_packets: u32) -> Self {
        BufferFrameHeader {
            frame_number,
            frame_state: FrameReceiveState::Incomplete as u32,
            total_packets,
            packets_received: 0,
            _reserved: 0,
            packet_state: [0; Self::PACKET_STATE_WORDS],
        }
    }

    pub fn mark_packet(&mut self, packet_number: usize) -> bool {
        let word = packet_number / 64;
        let bit = 1u64 << (packet_number % 64);
        if word >= Self::PACKET_STATE_WORDS || self.packet_state[word] & bit != 0 {
            return false;
        }
        self.packet_state[word] |= bit;
        self.packets_received += 1;
        true
    }

    pub fn has_packet(&self, packet_number: usize) -> bool {
        let word = packet_number / 64;
        word < Self::PACKET_STATE_WORDS && self.packet_state[word] & (1 << (packet_number % 64)) != 0
    }
}

/// Counters and queue depths exposed through the receiver's status call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStatus {
    pub empty_buffers: usize,
    pub mapped_buffers: usize,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_timedout: u64,
    pub frames_errored: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
}

struct InProgressFrame {
    buffer_id: usize,
    started: Instant,
    last_packet: Instant,
}

/// State shared by every decoder variant: buffer queues, the in-progress
/// map, counters and the timeout monitor.
pub struct DecoderCore {
    buffer_manager: Option<Arc<SharedBufferManager>>,
    empty_buffers: VecDeque<usize>,
    in_progress: HashMap<u64, InProgressFrame>,
    ready: VecDeque<(u64, usize)>,
    pub frame_timeout: Duration,
    pub enable_packet_logging: bool,
    frames_received: u64,
    frames_dropped: u64,
    frames_timedout: u64,
    frames_errored: u64,
    packets_received: u64,
    packets_dropped: u64,
}

impl Default for DecoderCore {
    fn default() -> Self {
        DecoderCore {
            buffer_manager: None,
            empty_buffers: VecDeque::new(),
            in_progress: HashMap::new(),
            ready: VecDeque::new(),
            frame_timeout: Duration::from_millis(1000),
            enable_packet_logging: false,
            frames_received: 0,
            frames_dropped: 0,
            frames_timedout: 0,
            frames_errored: 0,
            packets_received: 0,
            packets_dropped: 0,
        }
    }
}

impl DecoderCore {
    pub fn register_buffer_manager(&mut self, manager: Arc<SharedBufferManager>) {
        self.buffer_manager = Some(manager);
    }

    pub fn buffer_manager(&self) -> Option<&Arc<SharedBufferManager>> {
        self.buffer_manager.as_ref()
    }

    pub fn push_empty_buffer(&mut self, buffer_id: usize) {
        self.empty_buffers.push_back(buffer_id);
    }

    pub fn num_empty_buffers(&self) -> usize {
        self.empty_buffers.len()
    }

    pub fn num_mapped_buffers(&self) -> usize {
        self.in_progress.len()
    }

    /// Map a buffer for a new in-flight frame, or report underflow.
    pub fn map_frame(&mut self, frame_number: u64, total_packets: u32) -> Option<usize> {
        let buffer_id = self.empty_buffers.pop_front()?;
        if let Some(manager) = &self.buffer_manager {
            if let Ok(address) = manager.buffer_address(buffer_id) {
                // SAFETY: buffer ownership transferred off the empty queue;
                // the header prefix is within the buffer.
                unsafe {
                    let header = address as *mut BufferFrameHeader;
                    header.write(BufferFrameHeader::new(frame_number, total_packets));
                }
            }
        }
        let now = Instant::now();
        self.in_progress.insert(
            frame_number,
            InProgressFrame {
                buffer_id,
                started: now,
                last_packet: now,
            },
        );
        debug!("mapped buffer {buffer_id} for frame {frame_number}");
        Some(buffer_id)
    }

    pub fn buffer_for_frame(&self, frame_number: u64) -> Option<usize> {
        self.in_progress.get(&frame_number).map(|f| f.buffer_id)
    }

    pub fn touch_frame(&mut self, frame_number: u64) {
        if let Some(frame) = self.in_progress.get_mut(&frame_number) {
            frame.last_packet = Instant::now();
        }
    }

    /// Mutable access to the reassembly header of an in-flight frame.
    pub fn frame_header_mut(&mut self, frame_number: u64) -> Option<&mut BufferFrameHeader> {
        let buffer_id = self.in_progress.get(&frame_number)?.buffer_id;
        let manager = self.buffer_manager.as_ref()?;
        let address = manager.buffer_address(buffer_id).ok()?;
        // SAFETY: the buffer is owned by this in-flight frame and begins
        // with a BufferFrameHeader written by map_frame.
        Some(unsafe { &mut *(address as *mut BufferFrameHeader) })
    }

    /// Move a frame from the in-progress map to the ready queue.
    pub fn complete_frame(&mut self, frame_number: u64, state: FrameReceiveState) {
        if let Some(frame) = self.in_progress.remove(&frame_number) {
            if let Some(header) = self.header_for_buffer(frame.buffer_id) {
                header.frame_state = state as u32;
            }
            match state {
                FrameReceiveState::Complete => self.frames_received += 1,
                FrameReceiveState::Timedout => {
                    self.frames_timedout += 1;
                    self.frames_received += 1;
                }
                _ => {}
            }
            self.ready.push_back((frame_number, frame.buffer_id));
        }
    }

    /// Fail an in-flight frame: count it and return its buffer to the empty
    /// queue without notifying downstream.
    pub fn fail_frame(&mut self, frame_number: u64) {
        self.frames_errored += 1;
        if let Some(frame) = self.in_progress.remove(&frame_number) {
            self.empty_buffers.push_back(frame.buffer_id);
        }
    }

    fn header_for_buffer(&self, buffer_id: usize) -> Option<&mut BufferFrameHeader> {
        let manager = self.buffer_manager.as_ref()?;
        let address = manager.buffer_address(buffer_id).ok()?;
        // SAFETY: as for frame_header_mut.
        Some(unsafe { &mut *(address as *mut BufferFrameHeader) })
    }

    pub fn take_ready_frames(&mut self) -> Vec<(u64, usize)> {
        self.ready.drain(..).collect()
    }

    pub fn count_error(&mut self) {
        self.frames_errored += 1;
    }

    pub fn count_dropped_packet(&mut self) {
        self.packets_dropped += 1;
        self.frames_dropped += 1;
    }

    pub fn count_packet(&mut self) {
        self.packets_received += 1;
    }

    /// Scan the in-progress map once per tick; frames older than the
    /// timeout are force-completed with their packet-state bitmap intact.
    pub fn monitor_buffers(&mut self) {
        let timeout = self.frame_timeout;
        let stale: Vec<(u64, Duration)> = self
            .in_progress
            .iter()
            .filter(|(_, f)| f.last_packet.elapsed() > timeout)
            .map(|(frame, f)| (*frame, f.started.elapsed()))
            .collect();
        for (frame_number, age) in stale {
            warn!(
                "frame {frame_number} timed out after {}ms, force completing",
                age.as_millis()
            );
            self.complete_frame(frame_number, FrameReceiveState::Timedout);
        }
    }

    /// Discard all queued and in-flight buffers ahead of an arena rebuild.
    pub fn drop_all_buffers(&mut self) {
        if !self.empty_buffers.is_empty() {
            info!(
                "dropping {} buffers from empty buffer queue",
                self.empty_buffers.len()
            );
            self.empty_buffers.clear();
        }
        if !self.in_progress.is_empty() {
            warn!(
                "dropping {} unreleased buffers from decoder - possible data loss",
                self.in_progress.len()
            );
            self.in_progress.clear();
        }
        self.ready.clear();
        self.buffer_manager = None;
    }

    pub fn status(&self) -> DecoderStatus {
        DecoderStatus {
            empty_buffers: self.empty_buffers.len(),
            mapped_buffers: self.in_progress.len(),
            frames_received: self.frames_received,
            frames_dropped: self.frames_dropped,
            frames_timedout: self.frames_timedout,
            frames_errored: self.frames_errored,
            packets_received: self.packets_received,
            packets_dropped: self.packets_dropped,
        }
    }

    pub fn reset_statistics(&mut self) {
        self.frames_received = 0;
        self.frames_dropped = 0;
        self.frames_timedout = 0;
        self.frames_errored = 0;
        self.packets_received = 0;
        self.packets_dropped = 0;
    }
}

/// Capability set common to every decoder variant.
pub trait FrameDecoder: Send {
    fn init(&mut self, config: &serde_json::Value) -> Result<(), ConfigError>;
    fn core(&self) -> &DecoderCore;
    fn core_mut(&mut self) -> &mut DecoderCore;

    /// Buffer size this decoder needs for one frame, header included.
    fn frame_buffer_size(&self) -> usize;
    fn frame_header_size(&self) -> usize {
        std::mem::size_of::<BufferFrameHeader>()
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        let core = self.core();
        reply.set_param(
            &format!("{prefix}frame_timeout_ms"),
            json!(core.frame_timeout.as_millis() as u64),
        );
        reply.set_param(
            &format!("{prefix}enable_packet_logging"),
            json!(core.enable_packet_logging),
        );
    }

    fn reset_statistics(&mut self) {
        self.core_mut().reset_statistics();
    }

    fn monitor_buffers(&mut self) {
        self.core_mut().monitor_buffers();
    }
}

/// UDP decoders reassemble datagrams, optionally peeking the fixed packet
/// header before the payload is received so payload bytes land in the right
/// buffer offset without copying.
pub trait UdpFrameDecoder: FrameDecoder {
    fn requires_header_peek(&self) -> bool;
    fn packet_header_size(&self) -> usize;
    /// Raw (pointer, length) of the scratch packet-header buffer.
    fn packet_header_raw(&mut self) -> (*mut u8, usize);
    /// Inspect the peeked header and select the payload destination.
    fn process_packet_header(&mut self, bytes_received: usize) -> Result<(), DecoderError>;
    /// Raw (pointer, length) of the destination for the next payload.
    fn next_payload(&mut self) -> (*mut u8, usize);
    fn process_packet(&mut self, bytes_received: usize) -> FrameReceiveState;
}

/// TCP decoders read a byte stream sequentially into one frame buffer.
pub trait TcpFrameDecoder: FrameDecoder {
    /// Raw (pointer, length) of the next read destination.
    fn next_message_buffer(&mut self) -> Result<(*mut u8, usize), DecoderError>;
    fn process_message(&mut self, bytes_received: usize) -> FrameReceiveState;
}

/// Stream decoders ingest framed message parts carrying an explicit
/// end-of-parts flag.
pub trait StreamDecoder: FrameDecoder {
    fn process_message(&mut self, part: &[u8], end_of_parts: bool) -> FrameReceiveState;
}

/// A constructed decoder, tagged by transport variant.
pub enum DecoderInstance {
    Udp(Box<dyn UdpFrameDecoder>),
    Tcp(Box<dyn TcpFrameDecoder>),
    Stream(Box<dyn StreamDecoder>),
}

impl DecoderInstance {
    pub fn as_decoder(&self) -> &dyn FrameDecoder {
        match self {
            DecoderInstance::Udp(d) => d.as_ref(),
            DecoderInstance::Tcp(d) => d.as_ref(),
            DecoderInstance::Stream(d) => d.as_ref(),
        }
    }

    pub fn as_decoder_mut(&mut self) -> &mut dyn FrameDecoder {
        match self {
            DecoderInstance::Udp(d) => d.as_mut(),
            DecoderInstance::Tcp(d) => d.as_mut(),
            DecoderInstance::Stream(d) => d.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_state_bitmap() {
        let mut header = BufferFrameHeader::new(17, 100);
        assert!(header.mark_packet(0));
        assert!(header.mark_packet(99));
        assert!(!header.mark_packet(0), "duplicate packets are rejected");
        assert!(header.has_packet(0));
        assert!(header.has_packet(99));
        assert!(!header.has_packet(50));
        assert_eq!(header.packets_received, 2);
    }

    #[test]
    fn empty_queue_accounting() {
        let mut core = DecoderCore::default();
        core.push_empty_buffer(0);
        core.push_empty_buffer(1);
        assert_eq!(core.num_empty_buffers(), 2);

        let buffer = core.map_frame(5, 10).unwrap();
        assert_eq!(buffer, 0);
        assert_eq!(core.num_empty_buffers(), 1);
        assert_eq!(core.num_mapped_buffers(), 1);
        assert_eq!(core.buffer_for_frame(5), Some(0));

        core.complete_frame(5, FrameReceiveState::Complete);
        assert_eq!(core.num_mapped_buffers(), 0);
        assert_eq!(core.take_ready_frames(), vec![(5, 0)]);
        assert_eq!(core.status().frames_received, 1);
    }

    #[test]
    fn underflow_returns_none() {
        let mut core = DecoderCore::default();
        assert!(core.map_frame(1, 4).is_none());
        core.count_dropped_packet();
        assert_eq!(core.status().frames_dropped, 1);
    }

    #[test]
    fn timeout_force_completes() {
        let mut core = DecoderCore::default();
        core.frame_timeout = Duration::from_millis(0);
        core.push_empty_buffer(3);
        core.map_frame(9, 10);
        std::thread::sleep(Duration::from_millis(5));
        core.monitor_buffers();
        assert_eq!(core.status().frames_timedout, 1);
        assert_eq!(core.take_ready_frames(), vec![(9, 3)]);
    }

    #[test]
    fn failed_frame_returns_buffer() {
        let mut core = DecoderCore::default();
        core.push_empty_buffer(2);
        core.map_frame(1, 1);
        core.fail_frame(1);
        assert_eq!(core.num_empty_buffers(), 1);
        assert_eq!(core.status().frames_errored, 1);
        assert!(core.take_ready_frames().is_empty());
    }
}
