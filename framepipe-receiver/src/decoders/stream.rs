// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stream frame decoder: ingests pre-framed message parts. The first part
//! of a frame is the 16-byte header; payload parts follow and the transport
//! flags the final part of the multi-part message.

use crate::decoder::{DecoderCore, FrameDecoder, FrameReceiveState, StreamDecoder};
use crate::decoders::PacketHeader;
use framepipe_common::error::ConfigError;
use framepipe_ipc::IpcMessage;
use serde_json::json;
use tracing::warn;

const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

enum MessagePhase {
    Header,
    Payload { frame_number: u64, written: usize },
    Discard,
}

pub struct DummyStreamFrameDecoder {
    core: DecoderCore,
    max_frame_size: usize,
    phase: MessagePhase,
}

impl Default for DummyStreamFrameDecoder {
    fn default() -> Self {
        DummyStreamFrameDecoder {
            core: DecoderCore::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            phase: MessagePhase::Header,
        }
    }
}

impl FrameDecoder for DummyStreamFrameDecoder {
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

impl StreamDecoder for DummyStreamFrameDecoder {
    fn process_message(&mut self, part: &[u8], end_of_parts: bool) -> FrameReceiveState {
        let header_size = self.frame_header_size();
        match &mut self.phase {
            MessagePhase::Header => {
                let header = match PacketHeader::from_bytes(part) {
                    Some(header) => header,
                    None => {
                        warn!("malformed stream header part of {} bytes", part.len());
                        self.core.count_error();
                        return FrameReceiveState::Error;
                    }
                };
                match self.core.map_frame(header.frame_number, 1) {
                    Some(_) => {
                        self.phase = MessagePhase::Payload {
                            frame_number: header.frame_number,
                            written: 0,
                        };
                        if end_of_parts {
                            // Header-only frame: complete with no payload
                            let frame_number = header.frame_number;
                            self.finish(frame_number);
                            return FrameReceiveState::Complete;
                        }
                        FrameReceiveState::Incomplete
                    }
                    None => {
                        warn!(
                            "no empty buffers available, discarding stream frame {}",
                            header.frame_number
                        );
                        self.core.count_dropped_packet();
                        self.phase = if end_of_parts {
                            MessagePhase::Header
                        } else {
                            MessagePhase::Discard
                        };
                        FrameReceiveState::Empty
                    }
                }
            }
            MessagePhase::Payload {
                frame_number,
                written,
            } => {
                let frame_number = *frame_number;
                let offset = header_size + *written;
                let capacity = self.max_frame_size.saturating_sub(*written);
                if part.len() > capacity {
                    warn!(
                        "stream frame {frame_number} payload exceeds {} bytes",
                        self.max_frame_size
                    );
                    self.core.fail_frame(frame_number);
                    self.phase = MessagePhase::Header;
                    return FrameReceiveState::Error;
                }
                if let (Some(buffer_id), Some(manager)) = (
                    self.core.buffer_for_frame(frame_number),
                    self.core.buffer_manager().cloned(),
                ) {
                    if let Ok(address) = manager.buffer_address(buffer_id) {
                        // SAFETY: bounds checked against max_frame_size above.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                part.as_ptr(),
                                address.add(offset),
                                part.len(),
                            );
                        }
                    }
                }
                *written += part.len();
                self.core.count_packet();
                self.core.touch_frame(frame_number);
                if end_of_parts {
                    self.finish(frame_number);
                    FrameReceiveState::Complete
                } else {
                    FrameReceiveState::Incomplete
                }
            }
            MessagePhase::Discard => {
                if end_of_parts {
                    self.phase = MessagePhase::Header;
                }
                FrameReceiveState::Empty
            }
        }
    }
}

impl DummyStreamFrameDecoder {
    fn finish(&mut self, frame_number: u64) {
        if let Some(header) = self.core.frame_header_mut(frame_number) {
            header.mark_packet(0);
        }
        self.core
            .complete_frame(frame_number, FrameReceiveState::Complete);
        self.phase = MessagePhase::Header;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_ipc::SharedBufferManager;
    use std::sync::Arc;

    fn decoder_with_arena(tag: &str) -> (DummyStreamFrameDecoder, Arc<SharedBufferManager>) {
        let mut decoder = DummyStreamFrameDecoder::default();
        decoder
            .init(&serde_json::json!({ "max_frame_size": 128 }))
            .unwrap();
        let name = format!("/fp_stream_{tag}_{}", std::process::id());
        let size = decoder.frame_buffer_size();
        let manager = Arc::new(SharedBufferManager::create(&name, size, size, true).unwrap());
        decoder.core_mut().register_buffer_manager(manager.clone());
        decoder.core_mut().push_empty_buffer(0);
        (decoder, manager)
    }

    #[test]
    fn multi_part_message_completes_on_flag() {
        let (mut decoder, manager) = decoder_with_arena("multi");
        let header = PacketHeader {
            frame_number: 11,
            packet_number: 0,
            flags: 0,
        };
        assert_eq!(
            decoder.process_message(&header.to_bytes(), false),
            FrameReceiveState::Incomplete
        );
        assert_eq!(
            decoder.process_message(&[5u8; 64], false),
            FrameReceiveState::Incomplete
        );
        assert_eq!(
            decoder.process_message(&[6u8; 64], true),
            FrameReceiveState::Complete
        );
        let ready = decoder.core_mut().take_ready_frames();
        assert_eq!(ready, vec![(11, 0)]);

        let offset = decoder.frame_header_size();
        // SAFETY: frame complete, buffer owned by the test.
        let data = unsafe { manager.buffer(0).unwrap() };
        assert!(data[offset..offset + 64].iter().all(|&b| b == 5));
        assert!(data[offset + 64..offset + 128].iter().all(|&b| b == 6));
    }

    #[test]
    fn underflow_discards_whole_message() {
        let (mut decoder, _manager) = decoder_with_arena("drop");
        decoder.core_mut().map_frame(50, 1); // consume the only buffer

        let header = PacketHeader {
            frame_number: 12,
            packet_number: 0,
            flags: 0,
        };
        assert_eq!(
            decoder.process_message(&header.to_bytes(), false),
            FrameReceiveState::Empty
        );
        assert_eq!(
            decoder.process_message(&[1u8; 32], true),
            FrameReceiveState::Empty
        );
        // Next message starts a fresh header phase
        assert_eq!(decoder.core().status().frames_dropped, 1);
    }
}
