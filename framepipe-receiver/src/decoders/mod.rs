// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod stream;
pub mod tcp;
pub mod udp;

use crate::config::RxType;
use crate::decoder::DecoderInstance;
use framepipe_common::error::ConfigError;

pub use stream::DummyStreamFrameDecoder;
pub use tcp::DummyTcpFrameDecoder;
pub use udp::DummyUdpFrameDecoder;

/// Construct a decoder by type name and transport variant.
pub fn create_decoder(decoder_type: &str, rx_type: RxType) -> Result<DecoderInstance, ConfigError> {
    match (decoder_type, rx_type) {
        ("dummy", RxType::Udp) => Ok(DecoderInstance::Udp(Box::new(
            DummyUdpFrameDecoder::default(),
        ))),
        ("dummy", RxType::Tcp) => Ok(DecoderInstance::Tcp(Box::new(
            DummyTcpFrameDecoder::default(),
        ))),
        ("dummy", RxType::Stream) => Ok(DecoderInstance::Stream(Box::new(
            DummyStreamFrameDecoder::default(),
        ))),
        (other, rx) => Err(ConfigError::new(format!(
            "no decoder of type '{other}' for rx_type '{}'",
            rx.name()
        ))),
    }
}

/// On-the-wire packet/message header shared by the dummy decoder family.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_number: u64,
    pub packet_number: u32,
    pub flags: u32,
}

impl PacketHeader {
    pub const SIZE: usize = std::mem::size_of::<PacketHeader>();
    pub const FLAG_SOF: u32 = 1;
    pub const FLAG_EOF: u32 = 2;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.frame_number.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.packet_number.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_ne_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<PacketHeader> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(PacketHeader {
            frame_number: u64::from_ne_bytes(bytes[0..8].try_into().ok()?),
            packet_number: u32::from_ne_bytes(bytes[8..12].try_into().ok()?),
            flags: u32::from_ne_bytes(bytes[12..16].try_into().ok()?),
        })
    }
}
