// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod error;
pub mod logging;
pub mod signals;
pub mod types;

pub use error::{BufferError, ConfigError, DecoderError};
pub use types::{CompressionType, DataType};
