// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live view plugin: republishes a subsample of the frame stream on a
//! bound publish channel as two-part messages (JSON descriptor, raw image
//! bytes) for live display tools.

use crate::frame::Frame;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use framepipe_common::error::ConfigError;
use framepipe_ipc::{Endpoint, IoContext, IpcMessage, PubChannel};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub const CONFIG_FRAME_FREQ: &str = "frame_frequency";
pub const CONFIG_SOCKET_ADDR: &str = "live_view_socket_addr";
pub const CONFIG_DATASET_NAME: &str = "dataset_name";
const DEFAULT_SOCKET_ADDR: &str = "tcp://127.0.0.1:5020";

pub struct LiveViewPlugin {
    io: IoContext,
    channel: Option<PubChannel>,
    socket_addr: String,
    frame_frequency: u64,
    dataset_filter: Option<String>,
    frames_seen: u64,
    frames_published: u64,
}

impl LiveViewPlugin {
    pub fn new(io: IoContext) -> LiveViewPlugin {
        LiveViewPlugin {
            io,
            channel: None,
            socket_addr: DEFAULT_SOCKET_ADDR.to_string(),
            frame_frequency: 1,
            dataset_filter: None,
            frames_seen: 0,
            frames_published: 0,
        }
    }

    fn bind_channel(&mut self) -> Result<(), ConfigError> {
        let endpoint = Endpoint::parse(&self.socket_addr)
            .map_err(|e| ConfigError::new(e.to_string()))?;
        info!("live view publishing on {endpoint}");
        self.channel = Some(
            PubChannel::bind(&endpoint, &self.io)
                .map_err(|e| ConfigError::new(format!("failed to bind live view socket: {e}")))?,
        );
        Ok(())
    }

    fn descriptor(frame: &Frame) -> Vec<u8> {
        let meta = frame.meta_data();
        json!({
            "frame_num": frame.frame_number(),
            "acquisition_id": meta.acquisition_id,
            "dataset": meta.dataset_name,
            "dtype": meta.data_type.to_string(),
            "dsize": frame.image_size(),
            "compression": meta.compression.to_string(),
            "shape": meta.dimensions,
        })
        .to_string()
        .into_bytes()
    }
}

impl FrameProcessorPlugin for LiveViewPlugin {
    fn process_frame(&mut self, frame: Arc<Frame>, ctx: &PluginContext<'_>) {
        self.frames_seen += 1;
        let wanted_dataset = self
            .dataset_filter
            .as_ref()
            .map(|name| *name == frame.meta_data().dataset_name)
            .unwrap_or(true);
        let due = self.frame_frequency > 0 && self.frames_seen % self.frame_frequency == 0;
        if wanted_dataset && due {
            if let Some(channel) = &self.channel {
                channel.publish_parts(vec![
                    Self::descriptor(&frame),
                    frame.image().to_vec(),
                ]);
                self.frames_published += 1;
            }
        }
        // Live view is an observer; the frame always continues downstream
        if let Err(e) = ctx.push(frame) {
            ctx.set_error(e.to_string());
        }
    }

    fn configure(
        &mut self,
        config: &IpcMessage,
        _reply: &mut IpcMessage,
        _ctx: &PluginContext<'_>,
    ) -> Result<(), ConfigError> {
        if let Some(freq) = config.get_param(CONFIG_FRAME_FREQ).and_then(|v| v.as_u64()) {
            self.frame_frequency = freq;
            debug!("live view frame frequency set to {freq}");
        }
        if let Some(name) = config.get_param(CONFIG_DATASET_NAME).and_then(|v| v.as_str()) {
            self.dataset_filter = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
        }
        let rebind = match config.get_param(CONFIG_SOCKET_ADDR).and_then(|v| v.as_str()) {
            Some(addr) => {
                let changed = addr != self.socket_addr;
                self.socket_addr = addr.to_string();
                changed || self.channel.is_none()
            }
            None => self.channel.is_none(),
        };
        if rebind {
            self.bind_channel()?;
        }
        Ok(())
    }

    fn request_configuration(&self, reply: &mut IpcMessage) {
        reply.set_param(CONFIG_FRAME_FREQ, json!(self.frame_frequency));
        reply.set_param(CONFIG_SOCKET_ADDR, json!(self.socket_addr));
        if let Some(name) = &self.dataset_filter {
            reply.set_param(CONFIG_DATASET_NAME, json!(name));
        }
    }

    fn status(&self, status: &mut IpcMessage) {
        status.set_param("live_view/frames_seen", json!(self.frames_seen));
        status.set_param("live_view/frames_published", json!(self.frames_published));
    }

    fn reset_statistics(&mut self) -> bool {
        self.frames_seen = 0;
        self.frames_published = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaPublisher;
    use crate::metadata::FrameMetaData;
    use crate::plugin::PluginHandle;
    use crate::pool::DataBlockPools;
    use framepipe_common::{CompressionType, DataType};
    use framepipe_ipc::{HubEvent, MsgType, MsgVal, SubChannel};
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn publishes_subsampled_frames() {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let endpoint = format!("tcp://127.0.0.1:{port}");

        let io = IoContext::new(1);
        let pools = DataBlockPools::default();
        let (meta, _rx) = MetaPublisher::new();
        let live_view =
            PluginHandle::new("view", Box::new(LiveViewPlugin::new(io.clone())), meta);

        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param(CONFIG_SOCKET_ADDR, json!(endpoint));
        config.set_param(CONFIG_FRAME_FREQ, json!(2));
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        live_view.configure(&config, &mut reply).unwrap();

        let subscriber =
            SubChannel::connect(&Endpoint::parse(&endpoint).unwrap(), &io).unwrap();
        // Give the publisher time to accept the subscription
        std::thread::sleep(Duration::from_millis(200));

        for number in 0..4 {
            let frame_meta = FrameMetaData::new(
                "data",
                DataType::U16,
                "acq",
                vec![2, 2],
                CompressionType::None,
            );
            let frame = Arc::new(Frame::from_data_block(
                number,
                frame_meta,
                pools.take(8),
                &[number as u8; 8],
            ));
            live_view.callback(frame);
        }

        // Every second frame is published
        let mut received = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while received.len() < 2 && std::time::Instant::now() < deadline {
            if let Ok(HubEvent::Message(_, parts)) =
                subscriber.events().recv_timeout(Duration::from_millis(200))
            {
                received.push(parts);
            }
        }
        assert_eq!(received.len(), 2);
        let descriptor: serde_json::Value = serde_json::from_slice(&received[0][0]).unwrap();
        assert_eq!(descriptor["dataset"], "data");
        assert_eq!(descriptor["dtype"], "uint16");
        assert_eq!(received[0][1].len(), 8);
    }
}
