// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod controller;
pub mod decoder;
pub mod decoders;
pub mod rx_thread;

pub use config::{ReceiverConfig, RxType};
pub use controller::ReceiverController;
pub use decoder::{DecoderCore, DecoderInstance, DecoderStatus, FrameDecoder, FrameReceiveState};
