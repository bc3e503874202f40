// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod acquisition;
pub mod container;
pub mod controller;
pub mod file_writer;
pub mod frame;
pub mod meta;
pub mod metadata;
pub mod plugin;
pub mod plugins;
pub mod pool;
pub mod shared_mem;
pub mod watchdog;

pub use controller::ProcessorController;
pub use frame::{Frame, FrameRelease};
pub use metadata::{FrameMetaData, ParamValue};
pub use plugin::{FrameProcessorPlugin, PluginContext, PluginHandle};
