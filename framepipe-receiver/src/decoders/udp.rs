// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP frame decoder for the simulated detector format: fixed-size
//! datagrams carrying a 16-byte header (frame number, packet number, SOF/EOF
//! flags) followed by a slice of the image. The packet header is peeked
//! before the payload is received so the payload can be scattered straight
//! into its buffer offset.

use crate::decoder::{
    BufferFrameHeader, DecoderCore, FrameDecoder, FrameReceiveState, UdpFrameDecoder,
};
use crate::decoders::PacketHeader;
use framepipe_common::error::{ConfigError, DecoderError};
use framepipe_common::logging::PACKET_TARGET;
use framepipe_ipc::IpcMessage;
use serde_json::json;
use tracing::{debug, info, warn};

const DEFAULT_IMAGE_WIDTH: usize = 1024;
const DEFAULT_IMAGE_HEIGHT: usize = 768;
const DEFAULT_PIXEL_SIZE: usize = 2;
const DEFAULT_PACKET_PAYLOAD: usize = 8000;

enum PayloadTarget {
    Buffer { frame_number: u64, offset: usize },
    Discard,
}

pub struct DummyUdpFrameDecoder {
    core: DecoderCore,
    image_width: usize,
    image_height: usize,
    pixel_size: usize,
    packet_payload_size: usize,
    header_scratch: [u8; PacketHeader::SIZE],
    discard_scratch: Vec<u8>,
    target: PayloadTarget,
    current_header: Option<PacketHeader>,
}

impl Default for DummyUdpFrameDecoder {
    fn default() -> Self {
        let mut decoder = DummyUdpFrameDecoder {
            core: DecoderCore::default(),
            image_width: DEFAULT_IMAGE_WIDTH,
            image_height: DEFAULT_IMAGE_HEIGHT,
            pixel_size: DEFAULT_PIXEL_SIZE,
            packet_payload_size: DEFAULT_PACKET_PAYLOAD,
            header_scratch: [0; PacketHeader::SIZE],
            discard_scratch: Vec::new(),
            target: PayloadTarget::Discard,
            current_header: None,
        };
        decoder.discard_scratch = vec![0; decoder.packet_payload_size];
        decoder
    }
}

impl DummyUdpFrameDecoder {
    pub fn image_bytes(&self) -> usize {
        self.image_width * self.image_height * self.pixel_size
    }

    pub fn packets_per_frame(&self) -> u32 {
        self.image_bytes().div_ceil(self.packet_payload_size) as u32
    }

    fn payload_offset(&self, packet_number: u32) -> usize {
        self.frame_header_size() + packet_number as usize * self.packet_payload_size
    }
}

impl FrameDecoder for DummyUdpFrameDecoder {
    fn init(&mut self, config: &serde_json::Value) -> Result<(), ConfigError> {
        if let Some(width) = config.get("image_width") {
            self.image_width = width
                .as_u64()
                .ok_or_else(|| ConfigError::new("image_width must be an unsigned integer"))?
                as usize;
        }
        if let Some(height) = config.get("image_height") {
            self.image_height = height
                .as_u64()
                .ok_or_else(|| ConfigError::new("image_height must be an unsigned integer"))?
                as usize;
        }
        if let Some(size) = config.get("packet_payload_size") {
            self.packet_payload_size = size
                .as_u64()
                .ok_or_else(|| ConfigError::new("packet_payload_size must be an unsigned integer"))?
                as usize;
        }
        if self.packet_payload_size == 0 {
            return Err(ConfigError::new("packet_payload_size must be non-zero"));
        }
        if self.packets_per_frame() as usize > BufferFrameHeader::MAX_PACKETS {
            return Err(ConfigError::new(format!(
                "frame of {} packets exceeds the packet-state bitmap ({} packets)",
                self.packets_per_frame(),
                BufferFrameHeader::MAX_PACKETS
            )));
        }
        self.discard_scratch = vec![0; self.packet_payload_size];
        info!(
            "udp decoder configured for {}x{} images, {} packets per frame",
            self.image_width,
            self.image_height,
            self.packets_per_frame()
        );
        Ok(())
    }

    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn frame_buffer_size(&self) -> usize {
        self.frame_header_size() + self.image_bytes()
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        reply.set_param(
            &format!("{prefix}frame_timeout_ms"),
            json!(self.core.frame_timeout.as_millis() as u64),
        );
        reply.set_param(
            &format!("{prefix}enable_packet_logging"),
            json!(self.core.enable_packet_logging),
        );
        reply.set_param(&format!("{prefix}image_width"), json!(self.image_width));
        reply.set_param(&format!("{prefix}image_height"), json!(self.image_height));
        reply.set_param(
            &format!("{prefix}packet_payload_size"),
            json!(self.packet_payload_size),
        );
    }
}

impl UdpFrameDecoder for DummyUdpFrameDecoder {
    fn requires_header_peek(&self) -> bool {
        true
    }

    fn packet_header_size(&self) -> usize {
        PacketHeader::SIZE
    }

    fn packet_header_raw(&mut self) -> (*mut u8, usize) {
        (self.header_scratch.as_mut_ptr(), PacketHeader::SIZE)
    }

    fn process_packet_header(&mut self, bytes_received: usize) -> Result<(), DecoderError> {
        self.current_header = None;
        self.target = PayloadTarget::Discard;

        if bytes_received < PacketHeader::SIZE {
            return Err(DecoderError::MalformedPacket(format!(
                "short packet header: {bytes_received} bytes"
            )));
        }
        let header = PacketHeader::from_bytes(&self.header_scratch).ok_or_else(|| {
            DecoderError::MalformedPacket("unreadable packet header".to_string())
        })?;

        if header.packet_number >= self.packets_per_frame() {
            return Err(DecoderError::MalformedPacket(format!(
                "packet number {} beyond frame of {} packets",
                header.packet_number,
                self.packets_per_frame()
            )));
        }

        if self.core.enable_packet_logging {
            debug!(
                target: PACKET_TARGET,
                frame = header.frame_number,
                packet = header.packet_number,
                flags = header.flags,
                "packet header received"
            );
        }

        let mapped = match self.core.buffer_for_frame(header.frame_number) {
            Some(_) => true,
            None => self
                .core
                .map_frame(header.frame_number, self.packets_per_frame())
                .is_some(),
        };

        if mapped {
            self.target = PayloadTarget::Buffer {
                frame_number: header.frame_number,
                offset: self.payload_offset(header.packet_number),
            };
        }
        self.current_header = Some(header);
        Ok(())
    }

    fn next_payload(&mut self) -> (*mut u8, usize) {
        match &self.target {
            PayloadTarget::Buffer {
                frame_number,
                offset,
            } => {
                let buffer_id = self
                    .core
                    .buffer_for_frame(*frame_number)
                    .expect("target frame is mapped");
                let manager = self.core.buffer_manager().expect("decoder has an arena");
                let address = manager
                    .buffer_address(buffer_id)
                    .expect("mapped buffer id is in range");
                // SAFETY: offset stays inside the buffer; packet_number was
                // validated against packets_per_frame.
                let ptr = unsafe { address.add(*offset) };
                (ptr, self.packet_payload_size)
            }
            PayloadTarget::Discard => (
                self.discard_scratch.as_mut_ptr(),
                self.discard_scratch.len(),
            ),
        }
    }

    fn process_packet(&mut self, bytes_received: usize) -> FrameReceiveState {
        let header = match self.current_header.take() {
            Some(header) => header,
            None => return FrameReceiveState::Error,
        };

        if matches!(self.target, PayloadTarget::Discard) {
            // Empty buffer queue: the packet is dropped and counted
            warn!(
                "no empty buffers available, dropping packet {} of frame {}",
                header.packet_number, header.frame_number
            );
            self.core.count_dropped_packet();
            return FrameReceiveState::Empty;
        }

        if bytes_received < PacketHeader::SIZE {
            self.core.count_dropped_packet();
            return FrameReceiveState::Error;
        }

        self.core.count_packet();
        self.core.touch_frame(header.frame_number);

        let total = self.packets_per_frame();
        let (received, eof) = {
            let frame_header = match self.core.frame_header_mut(header.frame_number) {
                Some(frame_header) => frame_header,
                None => return FrameReceiveState::Error,
            };
            frame_header.mark_packet(header.packet_number as usize);
            (
                frame_header.packets_received,
                header.flags & PacketHeader::FLAG_EOF != 0,
            )
        };

        if eof || received == total {
            self.core
                .complete_frame(header.frame_number, FrameReceiveState::Complete);
            FrameReceiveState::Complete
        } else {
            FrameReceiveState::Incomplete
        }
    }
}
