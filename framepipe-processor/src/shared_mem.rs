// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory side of the processor: maps the receiver's arena when the
//! buffer-config notification names it, builds a shared-buffer frame for
//! every frame-ready notification and fans it out to the plugins registered
//! against the `frame_receiver` source. Dropping the last reference to one
//! of those frames sends the buffer id back on the release path.

use crate::frame::{Frame, FrameRelease, SharedBufferRef};
use crate::metadata::FrameMetaData;
use crate::plugin::PluginHandle;
use crossbeam_channel::Sender;
use framepipe_common::error::ConfigError;
use framepipe_ipc::{IpcMessage, SharedBufferManager};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Virtual source name plugins connect to for frames from the receiver.
pub const FRAME_RECEIVER_SOURCE: &str = "frame_receiver";

pub struct SharedMemoryController {
    manager: Option<Arc<SharedBufferManager>>,
    release_tx: Sender<FrameRelease>,
    callbacks: Vec<(String, Arc<PluginHandle>)>,
    frames_received: u64,
    frames_dropped: u64,
}

impl SharedMemoryController {
    pub fn new(release_tx: Sender<FrameRelease>) -> SharedMemoryController {
        SharedMemoryController {
            manager: None,
            release_tx,
            callbacks: Vec::new(),
            frames_received: 0,
            frames_dropped: 0,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.manager.is_some()
    }

    /// Map the named arena, replacing any previous mapping.
    pub fn set_shared_buffer(&mut self, shared_buffer_name: &str) -> Result<(), ConfigError> {
        self.manager = None;
        let manager = SharedBufferManager::open(shared_buffer_name)?;
        info!(
            "mapped shared buffer {shared_buffer_name}: {} buffers of {} bytes",
            manager.num_buffers(),
            manager.buffer_size()
        );
        self.manager = Some(Arc::new(manager));
        Ok(())
    }

    /// Register a plugin to receive raw frames from the receiver.
    pub fn register_callback(&mut self, name: &str, plugin: Arc<PluginHandle>) {
        if !self.callbacks.iter().any(|(n, _)| n == name) {
            debug!("connecting {name} to {FRAME_RECEIVER_SOURCE}");
            self.callbacks.push((name.to_string(), plugin));
        }
    }

    pub fn remove_callback(&mut self, name: &str) {
        self.callbacks.retain(|(n, _)| n != name);
    }

    /// Build a shared-buffer frame for a frame-ready notification and
    /// enqueue it with every registered plugin.
    pub fn handle_frame_ready(&mut self, frame_number: u64, buffer_id: usize) {
        let Some(manager) = &self.manager else {
            warn!("frame ready received before the shared buffer was configured");
            self.frames_dropped += 1;
            return;
        };
        if manager.buffer_address(buffer_id).is_err() {
            warn!("frame ready names invalid buffer {buffer_id}");
            self.frames_dropped += 1;
            // The id still goes back on the release path so nothing leaks
            let _ = self.release_tx.send(FrameRelease {
                frame_number,
                buffer_id,
            });
            return;
        }
        if self.callbacks.is_empty() {
            // No plugin wired yet: return the buffer straight away
            self.frames_dropped += 1;
            let _ = self.release_tx.send(FrameRelease {
                frame_number,
                buffer_id,
            });
            return;
        }

        let meta = FrameMetaData {
            dataset_name: "raw".to_string(),
            ..FrameMetaData::default()
        };
        let buffer = SharedBufferRef::new(
            manager.clone(),
            buffer_id,
            frame_number,
            self.release_tx.clone(),
        );
        let frame = Arc::new(Frame::from_shared_buffer(frame_number, meta, buffer, 0));
        self.frames_received += 1;

        for (_, plugin) in &self.callbacks {
            plugin.queue().add(frame.clone());
        }
    }

    /// Inject an end-of-acquisition sentinel at the head of the chain.
    pub fn inject_eoa(&self) {
        info!("injecting end of acquisition frame into plugin chain");
        let frame = Arc::new(Frame::end_of_acquisition());
        for (_, plugin) in &self.callbacks {
            plugin.queue().add(frame.clone());
        }
    }

    pub fn status(&self, reply: &mut IpcMessage) {
        reply.set_param("shared_memory/configured", json!(self.is_configured()));
        if let Some(manager) = &self.manager {
            reply.set_param("shared_memory/name", json!(manager.name()));
            reply.set_param("shared_memory/num_buffers", json!(manager.num_buffers()));
            reply.set_param("shared_memory/buffer_size", json!(manager.buffer_size()));
        }
        reply.set_param("shared_memory/frames_received", json!(self.frames_received));
        reply.set_param("shared_memory/frames_dropped", json!(self.frames_dropped));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaPublisher;
    use crate::plugin::{FrameProcessorPlugin, PluginContext};
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct CountingPlugin {
        count: Arc<AtomicUsize>,
    }

    impl FrameProcessorPlugin for CountingPlugin {
        fn process_frame(&mut self, _frame: Arc<Frame>, _ctx: &PluginContext<'_>) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn frame_ready_flows_and_buffer_releases() {
        let name = format!("/fp_shmc_{}", std::process::id());
        let arena = SharedBufferManager::create(&name, 4096, 1024, true).unwrap();
        let (release_tx, release_rx) = unbounded();
        let mut controller = SharedMemoryController::new(release_tx);
        controller.set_shared_buffer(&name).unwrap();
        assert!(controller.is_configured());

        let (meta, _rx) = MetaPublisher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let plugin = PluginHandle::new(
            "dummy",
            Box::new(CountingPlugin {
                count: count.clone(),
            }),
            meta,
        );
        plugin.start();
        controller.register_callback("dummy", plugin.clone());

        controller.handle_frame_ready(4, 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Once the plugin chain is done with the frame, the last drop
        // releases the buffer
        let release = release_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("buffer never released");
        assert_eq!(
            release,
            FrameRelease {
                frame_number: 4,
                buffer_id: 1
            }
        );
        plugin.stop();
        drop(arena);
    }

    #[test]
    fn unconnected_frames_release_immediately() {
        let name = format!("/fp_shmc_unc_{}", std::process::id());
        let _arena = SharedBufferManager::create(&name, 4096, 1024, true).unwrap();
        let (release_tx, release_rx) = unbounded();
        let mut controller = SharedMemoryController::new(release_tx);
        controller.set_shared_buffer(&name).unwrap();

        controller.handle_frame_ready(9, 3);
        let release = release_rx.try_recv().unwrap();
        assert_eq!(release.buffer_id, 3);
    }
}
