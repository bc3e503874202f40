// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised by the shared buffer arena.
#[derive(Debug, Error)]
pub enum BufferError {
    /// A buffer id outside the arena's range was dereferenced.
    #[error("illegal buffer index specified: {0}")]
    InvalidBuffer(usize),
    #[error("shared buffer region error: {0}")]
    Region(String),
}

/// A configuration message could not be applied. The component that raised
/// this keeps its previous good configuration.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        ConfigError(msg.into())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError(e.to_string())
    }
}

/// Errors raised while decoding incoming packet data into frames.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("received {received} bytes for frame of {expected} bytes")]
    FrameOverrun { received: usize, expected: usize },
    #[error("decoder not initialised with a buffer manager")]
    NoBufferManager,
    #[error(transparent)]
    Buffer(#[from] BufferError),
}
