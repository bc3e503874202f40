// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Receiver control-plane. Owns the shared buffer arena, the decoder, the
//! rx I/O thread and the control / frame-ready / frame-release channels,
//! and applies configuration changes to only the components they touch.
//! Creating a new arena always stops the rx thread first so no decoder
//! pointer can outlive the region it points into.

use crate::config::{DirtySet, ReceiverConfig, CONFIG_DEBUG};
use crate::decoder::DecoderStatus;
use crate::decoders::create_decoder;
use crate::rx_thread::{start_rx_thread, RxCommand, RxEvent, RxThreadHandle};
use crossbeam_channel::{unbounded, Receiver, Sender};
use framepipe_common::error::ConfigError;
use framepipe_ipc::{
    Endpoint, HubEvent, IoContext, IpcMessage, MsgType, MsgVal, PubChannel, RouterChannel,
    SharedBufferManager, SubChannel,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const TICK_PERIOD: Duration = Duration::from_millis(100);

/// Delay before the initial buffer-config notification, giving subscribers
/// time to connect to a freshly bound ready channel.
const DEFERRED_ACTION_DELAY: Duration = Duration::from_millis(1000);

enum DeferredAction {
    NotifyBufferConfig,
}

pub struct ReceiverController {
    config: ReceiverConfig,
    io: IoContext,
    ctrl_channel: Option<RouterChannel>,
    ready_channel: Option<PubChannel>,
    release_channel: Option<SubChannel>,
    buffer_manager: Option<Arc<SharedBufferManager>>,
    rx_thread: Option<RxThreadHandle>,
    rx_events_tx: Sender<RxEvent>,
    rx_events_rx: Receiver<RxEvent>,
    rx_status: DecoderStatus,
    frames_released: u64,
    deferred: Vec<(Instant, DeferredAction)>,
    shutdown: Arc<AtomicBool>,
    ipc_configured: bool,
    decoder_configured: bool,
    buffer_manager_configured: bool,
    rx_thread_configured: bool,
}

impl ReceiverController {
    pub fn new(io_threads: usize) -> ReceiverController {
        let (rx_events_tx, rx_events_rx) = unbounded();
        ReceiverController {
            config: ReceiverConfig::default(),
            io: IoContext::new(io_threads),
            ctrl_channel: None,
            ready_channel: None,
            release_channel: None,
            buffer_manager: None,
            rx_thread: None,
            rx_events_tx,
            rx_events_rx,
            rx_status: DecoderStatus::default(),
            frames_released: 0,
            deferred: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            ipc_configured: false,
            decoder_configured: false,
            buffer_manager_configured: false,
            rx_thread_configured: false,
        }
    }

    /// Flag polled by the run loop; set from a signal handler for graceful
    /// shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Apply a configuration message. On failure the previous good
    /// configuration is retained and the error is returned for the nack.
    pub fn configure(&mut self, msg: &IpcMessage) -> Result<(), ConfigError> {
        if let Some(level) = msg.get_param(CONFIG_DEBUG).and_then(|v| v.as_u64()) {
            debug!("debug level requested: {level}");
        }

        let mut candidate = self.config.clone();
        candidate.apply(msg)?;

        let mut dirty = candidate.dirty_against(&self.config);
        if candidate.force_reconfig {
            dirty = DirtySet::all();
        }
        if !self.ipc_configured {
            dirty.ipc = true;
        }
        if !self.decoder_configured && !candidate.decoder_type.is_empty() {
            dirty.decoder = true;
        }
        if !self.buffer_manager_configured {
            dirty.buffer_manager = true;
        }
        if !self.rx_thread_configured {
            dirty.rx_thread = true;
        }

        // A new arena or decoder invalidates every pointer the rx thread
        // holds into the old region, so quiesce it first.
        if dirty.buffer_manager || dirty.decoder || dirty.rx_thread {
            self.stop_rx_thread();
        }

        if dirty.ipc {
            self.configure_ipc_channels(&candidate)?;
            self.ipc_configured = true;
        }

        self.config = candidate;

        if self.config.decoder_type.is_empty() {
            // Nothing further can be configured without a decoder
            return Ok(());
        }

        if dirty.buffer_manager || dirty.decoder || dirty.rx_thread {
            self.configure_buffer_manager_and_rx_thread()?;
        }

        Ok(())
    }

    fn configure_ipc_channels(&mut self, config: &ReceiverConfig) -> Result<(), ConfigError> {
        // Unbind any previous channels before rebinding their endpoints
        self.ctrl_channel = None;
        self.ready_channel = None;
        self.release_channel = None;
        let ctrl = Endpoint::parse(&config.ctrl_channel_endpoint)
            .map_err(|e| ConfigError::new(e.to_string()))?;
        let ready = Endpoint::parse(&config.frame_ready_endpoint)
            .map_err(|e| ConfigError::new(e.to_string()))?;
        let release = Endpoint::parse(&config.frame_release_endpoint)
            .map_err(|e| ConfigError::new(e.to_string()))?;

        info!("binding control channel to {ctrl}");
        self.ctrl_channel = Some(
            RouterChannel::bind(&ctrl, &self.io)
                .map_err(|e| ConfigError::new(format!("failed to bind control channel: {e}")))?,
        );
        info!("binding frame ready channel to {ready}");
        self.ready_channel = Some(
            PubChannel::bind(&ready, &self.io)
                .map_err(|e| ConfigError::new(format!("failed to bind ready channel: {e}")))?,
        );
        info!("binding frame release channel to {release}");
        self.release_channel = Some(
            SubChannel::bind(&release, &self.io)
                .map_err(|e| ConfigError::new(format!("failed to bind release channel: {e}")))?,
        );
        Ok(())
    }

    /// Create the arena sized for the configured decoder, then start a fresh
    /// rx thread with a new decoder bound to it.
    fn configure_buffer_manager_and_rx_thread(&mut self) -> Result<(), ConfigError> {
        // The rx thread was stopped by configure(); any frame decoder
        // references into the old arena died with it.
        self.buffer_manager = None;
        self.buffer_manager_configured = false;
        self.rx_thread_configured = false;
        self.decoder_configured = false;

        let mut decoder = create_decoder(&self.config.decoder_type, self.config.rx_type)?;
        {
            let d = decoder.as_decoder_mut();
            d.init(&self.config.decoder_config)?;
            let core = d.core_mut();
            core.frame_timeout = Duration::from_millis(self.config.frame_timeout_ms);
            core.enable_packet_logging = self.config.enable_packet_logging;
        }

        let buffer_size = decoder.as_decoder().frame_buffer_size();
        if buffer_size > self.config.max_buffer_mem {
            return Err(ConfigError::new(format!(
                "decoder frame buffer size {buffer_size} exceeds max_buffer_mem {}",
                self.config.max_buffer_mem
            )));
        }
        let manager = Arc::new(SharedBufferManager::create(
            &self.config.shared_buffer_name,
            self.config.max_buffer_mem,
            buffer_size,
            true,
        )?);
        decoder
            .as_decoder_mut()
            .core_mut()
            .register_buffer_manager(manager.clone());
        self.buffer_manager = Some(manager);
        self.buffer_manager_configured = true;
        self.decoder_configured = true;

        self.rx_thread = Some(start_rx_thread(
            &self.config,
            decoder,
            self.rx_events_tx.clone(),
        )?);
        self.rx_thread_configured = true;
        Ok(())
    }

    fn stop_rx_thread(&mut self) {
        if let Some(handle) = self.rx_thread.take() {
            info!("stopping rx thread");
            handle.stop();
        }
        self.rx_status = DecoderStatus::default();
    }

    /// Main reactor loop: control requests, frame releases, rx thread
    /// events and deferred timers, multiplexed on one thread.
    pub fn run(&mut self) {
        info!("receiver controller running");
        while !self.shutdown.load(Ordering::Acquire) {
            self.poll_once(TICK_PERIOD);
        }
        self.stop_rx_thread();
        info!("receiver controller exiting");
    }

    /// One multiplexing step; exposed for tests driving the loop manually.
    pub fn poll_once(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_deferred();

            // Collect pending work without holding borrows on the channels
            let ctrl_event = self
                .ctrl_channel
                .as_ref()
                .and_then(|c| c.events().try_recv().ok());
            if let Some(event) = ctrl_event {
                self.handle_ctrl_event(event);
                continue;
            }
            let release_event = self
                .release_channel
                .as_ref()
                .and_then(|c| c.events().try_recv().ok());
            if let Some(event) = release_event {
                self.handle_release_event(event);
                continue;
            }
            if let Ok(event) = self.rx_events_rx.try_recv() {
                self.handle_rx_event(event);
                continue;
            }

            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn process_deferred(&mut self) {
        let now = Instant::now();
        let due: Vec<DeferredAction> = {
            let mut remaining = Vec::new();
            let mut due = Vec::new();
            for (at, action) in self.deferred.drain(..) {
                if at <= now {
                    due.push(action);
                } else {
                    remaining.push((at, action));
                }
            }
            self.deferred = remaining;
            due
        };
        for action in due {
            match action {
                DeferredAction::NotifyBufferConfig => self.notify_buffer_config(false),
            }
        }
    }

    fn handle_ctrl_event(&mut self, event: HubEvent) {
        let (client, msg) = match event {
            HubEvent::Message(client, parts) => {
                match parts.first().map(|p| IpcMessage::decode(p)) {
                    Some(Ok(msg)) => (client, msg),
                    Some(Err(e)) => {
                        warn!("undecodable control message: {e}");
                        return;
                    }
                    None => return,
                }
            }
            HubEvent::Connected(id) => {
                debug!("control client {id} connected");
                return;
            }
            HubEvent::Disconnected(id) => {
                debug!("control client {id} disconnected");
                return;
            }
        };

        let reply = self.dispatch_ctrl(&msg);
        if let Some(ctrl) = &self.ctrl_channel {
            ctrl.send(client, &reply);
        }
    }

    fn dispatch_ctrl(&mut self, msg: &IpcMessage) -> IpcMessage {
        if msg.msg_type != MsgType::Cmd {
            return IpcMessage::nack(msg, "expected a cmd message");
        }
        match msg.msg_val {
            MsgVal::Configure => match self.configure(msg) {
                Ok(()) => IpcMessage::ack(msg),
                Err(e) => {
                    error!("configuration failed: {e}");
                    IpcMessage::nack(msg, e.to_string())
                }
            },
            MsgVal::RequestConfiguration => {
                let mut reply = IpcMessage::ack(msg);
                self.config.as_reply(&mut reply);
                reply
            }
            MsgVal::Status => {
                let mut reply = IpcMessage::ack(msg);
                self.get_status(&mut reply);
                reply
            }
            MsgVal::RequestVersion => {
                let mut reply = IpcMessage::ack(msg);
                reply.set_param("version/full", json!(env!("CARGO_PKG_VERSION")));
                reply
            }
            MsgVal::ResetStatistics => {
                if let Some(rx) = &self.rx_thread {
                    rx.send(RxCommand::ResetStatistics);
                }
                self.frames_released = 0;
                IpcMessage::ack(msg)
            }
            MsgVal::Shutdown => {
                info!("shutdown requested over control channel");
                self.shutdown.store(true, Ordering::Release);
                IpcMessage::ack(msg)
            }
            _ => IpcMessage::nack(msg, format!("unsupported command: {}", msg.msg_val)),
        }
    }

    fn handle_release_event(&mut self, event: HubEvent) {
        let msg = match event {
            HubEvent::Message(_, parts) => match parts.first().map(|p| IpcMessage::decode(p)) {
                Some(Ok(msg)) => msg,
                _ => {
                    warn!("undecodable message on frame release channel");
                    return;
                }
            },
            _ => return,
        };

        if msg.msg_type == MsgType::Notify && msg.msg_val == MsgVal::FrameRelease {
            let buffer_id = msg.get_u64("buffer_id").unwrap_or(u64::MAX);
            debug!(
                "frame {} released in buffer {buffer_id}",
                msg.get_u64("frame").unwrap_or(0)
            );
            if let Some(rx) = &self.rx_thread {
                rx.send(RxCommand::ReleaseBuffer {
                    buffer_id: buffer_id as usize,
                });
            }
            self.frames_released += 1;
            if self.config.frame_count > 0 && self.frames_released >= self.config.frame_count {
                info!(
                    "specified number of frames ({}) received and released, terminating",
                    self.config.frame_count
                );
                self.shutdown.store(true, Ordering::Release);
            }
        } else if msg.msg_type == MsgType::Cmd && msg.msg_val == MsgVal::BufferConfigRequest {
            debug!("shared buffer config requested by processor");
            self.notify_buffer_config(false);
        } else {
            warn!("unexpected message on frame release channel: {:?}", msg.msg_val);
        }
    }

    fn handle_rx_event(&mut self, event: RxEvent) {
        match event {
            RxEvent::Identity { thread_name } => {
                debug!("rx thread {thread_name} announced");
                self.precharge_buffers();
                self.notify_buffer_config(true);
            }
            RxEvent::FrameReady {
                frame_number,
                buffer_id,
            } => {
                if let Some(ready) = &self.ready_channel {
                    let mut notify = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
                    notify.set_param("frame", json!(frame_number));
                    notify.set_param("buffer_id", json!(buffer_id));
                    ready.publish(&notify);
                }
            }
            RxEvent::Status(status) => {
                self.rx_status = status;
            }
        }
    }

    /// Push every available buffer id onto the decoder's empty queue.
    fn precharge_buffers(&mut self) {
        match (&self.buffer_manager, &self.rx_thread) {
            (Some(manager), Some(rx)) => {
                rx.send(RxCommand::Precharge {
                    start_buffer_id: 0,
                    num_buffers: manager.num_buffers(),
                });
            }
            _ => {
                info!("buffer precharge not done as no buffer manager and/or rx thread configured");
            }
        }
    }

    /// Tell downstream processors which arena to map. Deferred on startup so
    /// subscribers have time to connect.
    fn notify_buffer_config(&mut self, deferred: bool) {
        if deferred {
            self.deferred.push((
                Instant::now() + DEFERRED_ACTION_DELAY,
                DeferredAction::NotifyBufferConfig,
            ));
            return;
        }
        if let Some(ready) = &self.ready_channel {
            debug!("notifying downstream processes of shared buffer configuration");
            let mut notify = IpcMessage::new(MsgType::Notify, MsgVal::BufferConfig);
            notify.set_param("shared_buffer_name", json!(self.config.shared_buffer_name));
            ready.publish(&notify);
        }
    }

    fn get_status(&self, reply: &mut IpcMessage) {
        reply.set_param("status/ipc_configured", json!(self.ipc_configured));
        reply.set_param("status/decoder_configured", json!(self.decoder_configured));
        reply.set_param(
            "status/buffer_manager_configured",
            json!(self.buffer_manager_configured),
        );
        reply.set_param("status/rx_thread_configured", json!(self.rx_thread_configured));
        reply.set_param(
            "status/configuration_complete",
            json!(
                self.ipc_configured
                    && self.decoder_configured
                    && self.buffer_manager_configured
                    && self.rx_thread_configured
            ),
        );
        reply.set_param("buffers/empty", json!(self.rx_status.empty_buffers));
        reply.set_param("buffers/mapped", json!(self.rx_status.mapped_buffers));
        if let Some(manager) = &self.buffer_manager {
            reply.set_param("buffers/total", json!(manager.num_buffers()));
        }
        reply.set_param("frames/received", json!(self.rx_status.frames_received));
        reply.set_param("frames/dropped", json!(self.rx_status.frames_dropped));
        reply.set_param("frames/timedout", json!(self.rx_status.frames_timedout));
        reply.set_param("frames/errored", json!(self.rx_status.frames_errored));
        reply.set_param("frames/released", json!(self.frames_released));
        reply.set_param("packets/received", json!(self.rx_status.packets_received));
        reply.set_param("packets/dropped", json!(self.rx_status.packets_dropped));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_without_decoder_is_partial() {
        let mut controller = ReceiverController::new(1);
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("ctrl_endpoint", json!("tcp://127.0.0.1:0"));
        msg.set_param("frame_ready_endpoint", json!("tcp://127.0.0.1:0"));
        msg.set_param("frame_release_endpoint", json!("tcp://127.0.0.1:0"));
        controller.configure(&msg).unwrap();
        assert!(controller.ipc_configured);
        assert!(!controller.decoder_configured);

        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        controller.get_status(&mut status);
        assert_eq!(
            status.get_param("status/configuration_complete").unwrap(),
            &json!(false)
        );
    }

    #[test]
    fn bad_configure_retains_previous_config() {
        let mut controller = ReceiverController::new(1);
        let mut good = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        good.set_param("ctrl_endpoint", json!("tcp://127.0.0.1:0"));
        good.set_param("frame_ready_endpoint", json!("tcp://127.0.0.1:0"));
        good.set_param("frame_release_endpoint", json!("tcp://127.0.0.1:0"));
        controller.configure(&good).unwrap();

        let mut bad = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        bad.set_param("rx_type", json!("smoke-signals"));
        assert!(controller.configure(&bad).is_err());
        assert_eq!(controller.config.rx_type, crate::config::RxType::Udp);
    }

    #[test]
    fn nack_for_unknown_command() {
        let mut controller = ReceiverController::new(1);
        let msg = IpcMessage::new(MsgType::Cmd, MsgVal::FrameRelease);
        let reply = controller.dispatch_ctrl(&msg);
        assert_eq!(reply.msg_type, MsgType::Nack);
    }
}
