// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP frame decoder: a byte stream of messages, each a 16-byte header
//! (frame number, payload size in the packet-number field, flags) followed
//! by the payload. Bytes are read sequentially into a single frame buffer;
//! the caller yields to its reactor after every read so one busy stream
//! cannot starve other sockets.

use crate::decoder::{DecoderCore, FrameDecoder, FrameReceiveState, TcpFrameDecoder};
use crate::decoders::PacketHeader;
use framepipe_common::error::{ConfigError, DecoderError};
use framepipe_ipc::IpcMessage;
use serde_json::json;
use tracing::{debug, warn};

const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

enum ReadPhase {
    /// Reading the 16-byte message header into scratch.
    Header { filled: usize },
    /// Reading payload bytes into the mapped frame buffer.
    Payload {
        frame_number: u64,
        expected: usize,
        read_so_far: usize,
    },
    /// Consuming and discarding payload after a buffer underflow.
    Discard { remaining: usize },
}

pub struct DummyTcpFrameDecoder {
    core: DecoderCore,
    max_frame_size: usize,
    header_scratch: [u8; PacketHeader::SIZE],
    discard_scratch: Vec<u8>,
    phase: ReadPhase,
}

impl Default for DummyTcpFrameDecoder {
    fn default() -> Self {
        DummyTcpFrameDecoder {
            core: DecoderCore::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_scratch: [0; PacketHeader::SIZE],
            discard_scratch: vec![0; 65536],
            phase: ReadPhase::Header { filled: 0 },
        }
    }
}

impl DummyTcpFrameDecoder {
    fn begin_frame(&mut self, header: PacketHeader) -> Result<(), DecoderError> {
        let expected = header.packet_number as usize;
        if expected == 0 || expected > self.max_frame_size {
            return Err(DecoderError::FrameOverrun {
                received: expected,
                expected: self.max_frame_size,
            });
        }
        match self.core.map_frame(header.frame_number, 1) {
            Some(_) => {
                self.phase = ReadPhase::Payload {
                    frame_number: header.frame_number,
                    expected,
                    read_so_far: 0,
                };
            }
            None => {
                warn!(
                    "no empty buffers available, discarding frame {} from stream",
                    header.frame_number
                );
                self.core.count_dropped_packet();
                self.phase = ReadPhase::Discard {
                    remaining: expected,
                };
            }
        }
        Ok(())
    }
}

impl FrameDecoder for DummyTcpFrameDecoder {
    fn init(&mut self, config: &serde_json::Value) -> Result<(), ConfigError> {
        if let Some(size) = config.get("max_frame_size") {
            self.max_frame_size = size
                .as_u64()
                .ok_or_else(|| ConfigError::new("max_frame_size must be an unsigned integer"))?
                as usize;
        }
        Ok(())
    }

    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn frame_buffer_size(&self) -> usize {
        self.frame_header_size() + self.max_frame_size
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        reply.set_param(
            &format!("{prefix}frame_timeout_ms"),
            json!(self.core.frame_timeout.as_millis() as u64),
        );
        reply.set_param(&format!("{prefix}max_frame_size"), json!(self.max_frame_size));
    }
}

impl TcpFrameDecoder for DummyTcpFrameDecoder {
    fn next_message_buffer(&mut self) -> Result<(*mut u8, usize), DecoderError> {
        match &self.phase {
            ReadPhase::Header { filled } => {
                let filled = *filled;
                Ok((
                    // SAFETY: scratch is owned and filled < SIZE in this phase.
                    unsafe { self.header_scratch.as_mut_ptr().add(filled) },
                    PacketHeader::SIZE - filled,
                ))
            }
            ReadPhase::Payload {
                frame_number,
                expected,
                read_so_far,
            } => {
                let remaining = expected - read_so_far;
                let offset = self.frame_header_size() + read_so_far;
                let buffer_id = self
                    .core
                    .buffer_for_frame(*frame_number)
                    .ok_or(DecoderError::NoBufferManager)?;
                let manager = self
                    .core
                    .buffer_manager()
                    .ok_or(DecoderError::NoBufferManager)?;
                let address = manager.buffer_address(buffer_id)?;
                // SAFETY: expected <= max_frame_size so the whole payload
                // fits behind the reassembly header.
                Ok((unsafe { address.add(offset) }, remaining))
            }
            ReadPhase::Discard { remaining } => {
                let len = (*remaining).min(self.discard_scratch.len());
                Ok((self.discard_scratch.as_mut_ptr(), len))
            }
        }
    }

    fn process_message(&mut self, bytes_received: usize) -> FrameReceiveState {
        match &mut self.phase {
            ReadPhase::Header { filled } => {
                *filled += bytes_received;
                if *filled < PacketHeader::SIZE {
                    return FrameReceiveState::Incomplete;
                }
                let header = match PacketHeader::from_bytes(&self.header_scratch) {
                    Some(header) => header,
                    None => return FrameReceiveState::Error,
                };
                self.phase = ReadPhase::Header { filled: 0 };
                match self.begin_frame(header) {
                    Ok(()) => FrameReceiveState::Incomplete,
                    Err(e) => {
                        warn!("stream decode error: {e}");
                        self.core.fail_frame(header.frame_number);
                        FrameReceiveState::Error
                    }
                }
            }
            ReadPhase::Payload {
                frame_number,
                expected,
                read_so_far,
            } => {
                *read_so_far += bytes_received;
                self.core.count_packet();
                let frame_number = *frame_number;
                if read_so_far < expected {
                    self.core.touch_frame(frame_number);
                    return FrameReceiveState::Incomplete;
                }
                if read_so_far > expected {
                    // More bytes arrived than the frame declared
                    warn!(
                        "{}",
                        DecoderError::FrameOverrun {
                            received: *read_so_far,
                            expected: *expected,
                        }
                    );
                    self.core.fail_frame(frame_number);
                    self.phase = ReadPhase::Header { filled: 0 };
                    return FrameReceiveState::Error;
                }
                if let Some(header) = self.core.frame_header_mut(frame_number) {
                    header.mark_packet(0);
                }
                debug!("stream frame {frame_number} complete");
                self.core
                    .complete_frame(frame_number, FrameReceiveState::Complete);
                self.phase = ReadPhase::Header { filled: 0 };
                FrameReceiveState::Complete
            }
            ReadPhase::Discard { remaining } => {
                *remaining = remaining.saturating_sub(bytes_received);
                if *remaining == 0 {
                    self.phase = ReadPhase::Header { filled: 0 };
                }
                FrameReceiveState::Empty
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_ipc::SharedBufferManager;
    use std::sync::Arc;

    fn decoder_with_arena(tag: &str) -> (DummyTcpFrameDecoder, Arc<SharedBufferManager>) {
        let mut decoder = DummyTcpFrameDecoder::default();
        decoder
            .init(&serde_json::json!({ "max_frame_size": 256 }))
            .unwrap();
        let name = format!("/fp_tcp_{tag}_{}", std::process::id());
        let size = decoder.frame_buffer_size();
        let manager =
            Arc::new(SharedBufferManager::create(&name, size * 2, size, true).unwrap());
        decoder.core_mut().register_buffer_manager(manager.clone());
        decoder.core_mut().push_empty_buffer(0);
        decoder.core_mut().push_empty_buffer(1);
        (decoder, manager)
    }

    /// Push a byte slice through the decoder in `chunk`-sized reads.
    fn feed(decoder: &mut DummyTcpFrameDecoder, mut data: &[u8], chunk: usize) -> FrameReceiveState {
        let mut state = FrameReceiveState::Incomplete;
        while !data.is_empty() {
            let (ptr, len) = decoder.next_message_buffer().unwrap();
            let n = chunk.min(len).min(data.len());
            // SAFETY: destination provided by the decoder.
            unsafe {
                std::slice::from_raw_parts_mut(ptr, n).copy_from_slice(&data[..n]);
            }
            state = decoder.process_message(n);
            data = &data[n..];
        }
        state
    }

    fn message(frame_number: u64, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            frame_number,
            packet_number: payload.len() as u32,
            flags: PacketHeader::FLAG_SOF | PacketHeader::FLAG_EOF,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn short_reads_reassemble() {
        let (mut decoder, manager) = decoder_with_arena("short");
        let payload = (0..100u8).collect::<Vec<_>>();
        let state = feed(&mut decoder, &message(3, &payload), 7);
        assert_eq!(state, FrameReceiveState::Complete);

        let ready = decoder.core_mut().take_ready_frames();
        assert_eq!(ready.len(), 1);
        let offset = decoder.frame_header_size();
        // SAFETY: frame complete, buffer owned by the test.
        let data = unsafe { manager.buffer(ready[0].1).unwrap() };
        assert_eq!(&data[offset..offset + 100], payload.as_slice());
    }

    #[test]
    fn two_frames_back_to_back() {
        let (mut decoder, _manager) = decoder_with_arena("two");
        let mut stream = message(1, &[1u8; 64]);
        stream.extend(message(2, &[2u8; 64]));
        feed(&mut decoder, &stream, 16);
        assert_eq!(decoder.core().status().frames_received, 2);
    }

    #[test]
    fn oversized_frame_is_decoder_error() {
        let (mut decoder, _manager) = decoder_with_arena("oversize");
        // Declared payload beyond max_frame_size
        let header = PacketHeader {
            frame_number: 4,
            packet_number: 1024,
            flags: 0,
        };
        let state = feed(&mut decoder, &header.to_bytes(), PacketHeader::SIZE);
        assert_eq!(state, FrameReceiveState::Error);
        // Both buffers still available
        assert_eq!(decoder.core().num_empty_buffers(), 2);
    }

    #[test]
    fn underflow_discards_stream_frame() {
        let (mut decoder, _manager) = decoder_with_arena("drop");
        // Drain the empty queue first
        decoder.core_mut().map_frame(90, 1);
        decoder.core_mut().map_frame(91, 1);

        let state = feed(&mut decoder, &message(5, &[9u8; 32]), 64);
        assert_eq!(state, FrameReceiveState::Empty);
        assert_eq!(decoder.core().status().frames_dropped, 1);
    }
}
