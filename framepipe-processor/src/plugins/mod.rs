// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod compress;
pub mod gap_fill;
pub mod live_view;
pub mod source;

use crate::file_writer::FileWriterPlugin;
use crate::meta::MetaPublisher;
use crate::plugin::FrameProcessorPlugin;
use crate::pool::DataBlockPools;
use framepipe_ipc::IoContext;
use tracing::debug;

pub use compress::CompressPlugin;
pub use gap_fill::GapFillPlugin;
pub use live_view::LiveViewPlugin;
pub use source::DummyProcessPlugin;

/// Shared services plugins are constructed with.
#[derive(Clone)]
pub struct PluginServices {
    pub meta: MetaPublisher,
    pub pools: DataBlockPools,
    pub io: IoContext,
}

/// Construct a plugin by class name. The registry is static: the `library`
/// the control plane names is recorded for the reply surface but classes
/// resolve in-process.
pub fn create_plugin(
    class_name: &str,
    library: &str,
    services: &PluginServices,
) -> Option<Box<dyn FrameProcessorPlugin>> {
    debug!("loading plugin class {class_name} (library {library})");
    match class_name {
        "FileWriterPlugin" => Some(Box::new(FileWriterPlugin::new(services.meta.clone()))),
        "GapFillPlugin" => Some(Box::new(GapFillPlugin::new(services.pools.clone()))),
        "CompressPlugin" | "BloscPlugin" => {
            Some(Box::new(CompressPlugin::new(services.pools.clone())))
        }
        "LiveViewPlugin" => Some(Box::new(LiveViewPlugin::new(services.io.clone()))),
        "DummyProcessPlugin" | "DummyUDPProcessPlugin" => {
            Some(Box::new(DummyProcessPlugin::new(services.pools.clone())))
        }
        _ => None,
    }
}
