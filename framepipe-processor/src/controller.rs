// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Processor control-plane. Owns the plugin map and its wiring, the
//! shared-memory controller and the control / ready / release / meta
//! channels. A configuration payload may also be stored under a name and
//! replayed later, so a client can preload an acquisition setup and apply
//! it atomically at start of run.

use crate::frame::FrameRelease;
use crate::meta::{MetaMessage, MetaPublisher};
use crate::plugin::PluginHandle;
use crate::plugins::{create_plugin, PluginServices};
use crate::pool::DataBlockPools;
use crate::shared_mem::{SharedMemoryController, FRAME_RECEIVER_SOURCE};
use crossbeam_channel::{unbounded, Receiver};
use framepipe_common::error::ConfigError;
use framepipe_ipc::{
    Endpoint, HubEvent, IoContext, IpcMessage, MsgType, MsgVal, PubChannel, RouterChannel,
    SubChannel,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const CONFIG_DEBUG: &str = "debug_level";
pub const CONFIG_CTRL_ENDPOINT: &str = "ctrl_endpoint";
pub const CONFIG_META_ENDPOINT: &str = "meta_endpoint";
pub const CONFIG_FR_SETUP: &str = "fr_setup";
pub const CONFIG_FR_READY: &str = "fr_ready_cnxn";
pub const CONFIG_FR_RELEASE: &str = "fr_release_cnxn";
pub const CONFIG_PLUGIN: &str = "plugin";
pub const CONFIG_STORE: &str = "store";
pub const CONFIG_EXECUTE: &str = "execute";
pub const CONFIG_INDEX: &str = "index";
pub const CONFIG_VALUE: &str = "value";
pub const CONFIG_EOA: &str = "inject_eoa";
pub const CONFIG_FRAMES: &str = "frames";
pub const CONFIG_MASTER: &str = "hdf/master";
pub const CONFIG_CLEAR_ERRORS: &str = "clear_errors";

const TICK_PERIOD: Duration = Duration::from_millis(100);

pub struct ProcessorController {
    io: IoContext,
    services: PluginServices,
    meta_rx: Receiver<MetaMessage>,
    release_rx: Receiver<FrameRelease>,
    ctrl_channel: Option<RouterChannel>,
    ready_channel: Option<SubChannel>,
    release_channel: Option<PubChannel>,
    meta_channel: Option<PubChannel>,
    shared_mem: SharedMemoryController,
    plugins: HashMap<String, Arc<PluginHandle>>,
    plugin_order: Vec<String>,
    stored_configs: HashMap<String, Value>,
    master_frame: Arc<Mutex<String>>,
    shutdown_frame_count: Arc<AtomicU64>,
    frames_counted: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    ctrl_endpoint: String,
    meta_endpoint: String,
    ready_endpoint: String,
    release_endpoint: String,
}

impl ProcessorController {
    pub fn new(io_threads: usize) -> ProcessorController {
        let io = IoContext::new(io_threads);
        let (meta_publisher, meta_rx) = MetaPublisher::new();
        let (release_tx, release_rx) = unbounded();
        let services = PluginServices {
            meta: meta_publisher,
            pools: DataBlockPools::default(),
            io: io.clone(),
        };
        let shared_mem = SharedMemoryController::new(release_tx);
        ProcessorController {
            io,
            services,
            meta_rx,
            release_rx,
            ctrl_channel: None,
            ready_channel: None,
            release_channel: None,
            meta_channel: None,
            shared_mem,
            plugins: HashMap::new(),
            plugin_order: Vec::new(),
            stored_configs: HashMap::new(),
            master_frame: Arc::new(Mutex::new(String::new())),
            shutdown_frame_count: Arc::new(AtomicU64::new(0)),
            frames_counted: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            ctrl_endpoint: String::new(),
            meta_endpoint: String::new(),
            ready_endpoint: String::new(),
            release_endpoint: String::new(),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Apply a configuration message; on error the reply is a nack and the
    /// previous good state is retained.
    pub fn configure(&mut self, msg: &IpcMessage) -> Result<(), ConfigError> {
        if let Some(level) = msg.get_param(CONFIG_DEBUG).and_then(|v| v.as_u64()) {
            debug!("debug level requested: {level}");
        }

        if msg.has_param(CONFIG_CLEAR_ERRORS) {
            for plugin in self.plugins.values() {
                plugin.clear_errors();
            }
        }

        if let Some(master) = msg.get_param(CONFIG_MASTER).and_then(|v| v.as_str()) {
            debug!("master frame specifier set to: {master}");
            *self.master_frame.lock().expect("master name poisoned") = master.to_string();
        }

        if let Some(frames) = msg.get_param(CONFIG_FRAMES).and_then(|v| v.as_u64()) {
            if frames != 0 {
                debug!("shutdown frame count set to: {frames}");
                self.shutdown_frame_count.store(frames, Ordering::Release);
            }
        }

        if let Some(endpoint) = msg.get_param(CONFIG_CTRL_ENDPOINT).and_then(|v| v.as_str()) {
            self.setup_control_channel(endpoint)?;
        }

        if let Some(endpoint) = msg.get_param(CONFIG_META_ENDPOINT).and_then(|v| v.as_str()) {
            self.setup_meta_channel(endpoint)?;
        }

        if msg.has_param(CONFIG_FR_SETUP) {
            let ready = msg
                .get_param(&format!("{CONFIG_FR_SETUP}/{CONFIG_FR_READY}"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let release = msg
                .get_param(&format!("{CONFIG_FR_SETUP}/{CONFIG_FR_RELEASE}"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let (Some(ready), Some(release)) = (ready, release) {
                self.setup_frame_receiver_interface(&ready, &release)?;
            }
        }

        if let Some(plugin_config) = msg.get_param(CONFIG_PLUGIN) {
            let plugin_config = plugin_config.clone();
            self.configure_plugin(&plugin_config)?;
        }

        if msg.has_param(CONFIG_STORE) {
            let index = msg
                .get_param(&format!("{CONFIG_STORE}/{CONFIG_INDEX}"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let value = msg.get_param(&format!("{CONFIG_STORE}/{CONFIG_VALUE}")).cloned();
            if let (Some(index), Some(value)) = (index, value) {
                info!("storing configuration under name {index}");
                self.stored_configs.insert(index, value);
            }
        }

        if msg.has_param(CONFIG_EXECUTE) {
            let index = msg
                .get_param(&format!("{CONFIG_EXECUTE}/{CONFIG_INDEX}"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(index) = index {
                self.execute_stored_config(&index)?;
            }
        }

        if msg.has_param(CONFIG_EOA) {
            self.shared_mem.inject_eoa();
        }

        // Remaining top-level keys address loaded plugins by index
        let plugin_sections: Vec<(String, Value)> = self
            .plugin_order
            .iter()
            .filter_map(|index| {
                msg.get_param(index)
                    .map(|section| (index.clone(), section.clone()))
            })
            .collect();
        for (index, section) in plugin_sections {
            let plugin = self.plugins.get(&index).expect("ordered index is loaded").clone();
            let mut sub_config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
            sub_config.params = section;
            let mut sub_reply = IpcMessage::ack(msg);
            plugin.configure(&sub_config, &mut sub_reply).map_err(|e| {
                plugin.set_error(e.to_string());
                e
            })?;
        }

        Ok(())
    }

    fn setup_control_channel(&mut self, endpoint: &str) -> Result<(), ConfigError> {
        let parsed = Endpoint::parse(endpoint).map_err(|e| ConfigError::new(e.to_string()))?;
        self.ctrl_channel = None;
        info!("binding control channel to {parsed}");
        self.ctrl_channel = Some(
            RouterChannel::bind(&parsed, &self.io)
                .map_err(|e| ConfigError::new(format!("failed to bind control channel: {e}")))?,
        );
        self.ctrl_endpoint = endpoint.to_string();
        Ok(())
    }

    fn setup_meta_channel(&mut self, endpoint: &str) -> Result<(), ConfigError> {
        let parsed = Endpoint::parse(endpoint).map_err(|e| ConfigError::new(e.to_string()))?;
        self.meta_channel = None;
        info!("binding meta data channel to {parsed}");
        self.meta_channel = Some(
            PubChannel::bind(&parsed, &self.io)
                .map_err(|e| ConfigError::new(format!("failed to bind meta channel: {e}")))?,
        );
        self.meta_endpoint = endpoint.to_string();
        Ok(())
    }

    /// Connect to the receiver's notification channels and ask for the
    /// current shared buffer configuration.
    pub fn setup_frame_receiver_interface(
        &mut self,
        ready_endpoint: &str,
        release_endpoint: &str,
    ) -> Result<(), ConfigError> {
        let ready = Endpoint::parse(ready_endpoint).map_err(|e| ConfigError::new(e.to_string()))?;
        let release =
            Endpoint::parse(release_endpoint).map_err(|e| ConfigError::new(e.to_string()))?;
        self.ready_channel = None;
        self.release_channel = None;

        // The receiver may still be binding its channels; retry briefly
        // rather than failing the whole configuration.
        info!("connecting frame ready channel to {ready}");
        self.ready_channel = Some(connect_with_retry(
            |io| SubChannel::connect(&ready, io),
            &self.io,
            "ready channel",
        )?);
        info!("connecting frame release channel to {release}");
        self.release_channel = Some(connect_with_retry(
            |io| PubChannel::connect(&release, io),
            &self.io,
            "release channel",
        )?);
        self.ready_endpoint = ready_endpoint.to_string();
        self.release_endpoint = release_endpoint.to_string();

        // Ask the receiver to (re)announce its buffer configuration
        if let Some(release) = &self.release_channel {
            release.publish(&IpcMessage::new(MsgType::Cmd, MsgVal::BufferConfigRequest));
        }
        Ok(())
    }

    /// Handle the `plugin` configuration block: load, connect, disconnect.
    fn configure_plugin(&mut self, config: &Value) -> Result<(), ConfigError> {
        if let Some(load) = config.get("load") {
            let index = json_str(load, "index")?;
            let name = json_str(load, "name")?;
            let library = json_str(load, "library").unwrap_or_default();
            self.load_plugin(&index, &name, &library)?;
        }
        if let Some(connect) = config.get("connect") {
            let index = json_str(connect, "index")?;
            let connection = json_str(connect, "connection")?;
            self.connect_plugin(&index, &connection)?;
        }
        if let Some(disconnect) = config.get("disconnect") {
            let index = json_str(disconnect, "index")?;
            let connection = json_str(disconnect, "connection")?;
            self.disconnect_plugin(&index, &connection);
        }
        Ok(())
    }

    /// Load a plugin under a unique index and start its worker thread. The
    /// same class may be loaded multiple times under distinct indices.
    pub fn load_plugin(
        &mut self,
        index: &str,
        class_name: &str,
        library: &str,
    ) -> Result<(), ConfigError> {
        if self.plugins.contains_key(index) {
            info!("plugin with index = {index}, already loaded");
            return Ok(());
        }
        let plugin = create_plugin(class_name, library, &self.services).ok_or_else(|| {
            ConfigError::new(format!(
                "cannot load plugin with index [{index}], name [{class_name}], check library"
            ))
        })?;
        let handle = PluginHandle::new(index, plugin, self.services.meta.clone());

        // The persistence plugin gets the controller's counting tail so
        // shutdown can trigger when the expected frames have been written
        if class_name == "FileWriterPlugin" {
            let counted = self.frames_counted.clone();
            let target = self.shutdown_frame_count.clone();
            let master = self.master_frame.clone();
            let shutdown = self.shutdown.clone();
            handle.register_listener(
                "controller",
                Arc::new(move |frame| {
                    if frame.end_of_acquisition_flag() {
                        return;
                    }
                    let master = master.lock().expect("master name poisoned");
                    if master.is_empty() || frame.meta_data().dataset_name == *master {
                        let total = counted.fetch_add(1, Ordering::AcqRel) + 1;
                        let expected = target.load(Ordering::Acquire);
                        if expected > 0 && total >= expected {
                            debug!("shutdown frame count reached");
                            shutdown.store(true, Ordering::Release);
                        }
                    }
                }),
            );
        }

        handle.start();
        info!("class {class_name} loaded as index = {index}");
        self.plugins.insert(index.to_string(), handle);
        self.plugin_order.push(index.to_string());
        Ok(())
    }

    /// Connect a plugin to another plugin, or to the frame receiver source.
    pub fn connect_plugin(&mut self, index: &str, connect_to: &str) -> Result<(), ConfigError> {
        let plugin = self
            .plugins
            .get(index)
            .cloned()
            .ok_or_else(|| ConfigError::new(format!("cannot connect unloaded plugin {index}")))?;
        if connect_to == FRAME_RECEIVER_SOURCE {
            self.shared_mem.register_callback(index, plugin);
            return Ok(());
        }
        let upstream = self.plugins.get(connect_to).ok_or_else(|| {
            ConfigError::new(format!("cannot connect {index} to unloaded plugin {connect_to}"))
        })?;
        // The persistence tail is always a blocking edge so backpressure
        // propagates; everything else enqueues.
        let blocking = index == "hdf";
        upstream.register_callback(index, plugin, blocking);
        Ok(())
    }

    pub fn disconnect_plugin(&mut self, index: &str, connect_from: &str) {
        if connect_from == FRAME_RECEIVER_SOURCE {
            self.shared_mem.remove_callback(index);
        } else if let Some(upstream) = self.plugins.get(connect_from) {
            upstream.remove_callback(index);
        }
    }

    /// Replay a stored configuration payload by name.
    fn execute_stored_config(&mut self, index: &str) -> Result<(), ConfigError> {
        let params = self
            .stored_configs
            .get(index)
            .cloned()
            .ok_or_else(|| ConfigError::new(format!("no stored configuration named {index}")))?;
        info!("executing stored configuration {index}");
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.params = params;
        self.configure(&msg)
    }

    pub fn stored_config(&self, index: &str) -> Option<&Value> {
        self.stored_configs.get(index)
    }

    /// Main reactor loop, multiplexing control requests, frame and buffer
    /// notifications, releases and meta messages on one thread.
    pub fn run(&mut self) {
        info!("processor controller running");
        while !self.shutdown.load(Ordering::Acquire) {
            self.poll_once(TICK_PERIOD);
        }
        self.stop_plugins();

        // Draining the plugin chain released buffers and produced meta
        // events; forward them before the channels close.
        while let Ok(release) = self.release_rx.try_recv() {
            self.publish_release(release);
        }
        while let Ok(meta) = self.meta_rx.try_recv() {
            if let Some(channel) = &self.meta_channel {
                channel.publish_parts(meta.to_parts());
            }
        }
        // Give the writer pool time to put the final notifications on the
        // wire before the connections drop.
        std::thread::sleep(Duration::from_millis(200));
        info!("processor controller exiting");
    }

    /// One multiplexing step; exposed for tests driving the loop manually.
    pub fn poll_once(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let ctrl_event = self
                .ctrl_channel
                .as_ref()
                .and_then(|c| c.events().try_recv().ok());
            if let Some(event) = ctrl_event {
                self.handle_ctrl_event(event);
                continue;
            }
            let ready_event = self
                .ready_channel
                .as_ref()
                .and_then(|c| c.events().try_recv().ok());
            if let Some(event) = ready_event {
                self.handle_ready_event(event);
                continue;
            }
            if let Ok(release) = self.release_rx.try_recv() {
                self.publish_release(release);
                continue;
            }
            if let Ok(meta) = self.meta_rx.try_recv() {
                if let Some(channel) = &self.meta_channel {
                    channel.publish_parts(meta.to_parts());
                }
                continue;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain plugin queues and stop every worker, then drop the plugins.
    fn stop_plugins(&mut self) {
        info!("stopping {} plugins", self.plugins.len());
        // Wait for in-flight frames to clear the chain
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.plugins.values().any(|p| p.is_working()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        for index in self.plugin_order.clone() {
            if let Some(plugin) = self.plugins.get(&index) {
                debug!("stopping plugin {index}");
                plugin.stop();
            }
        }
        for plugin in self.plugins.values() {
            plugin.remove_all_callbacks();
        }
        self.plugins.clear();
        self.plugin_order.clear();
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
            _ => return,
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
                self.request_configuration(&mut reply);
                reply
            }
            MsgVal::Status => {
                let mut reply = IpcMessage::ack(msg);
                self.provide_status(&mut reply);
                reply
            }
            MsgVal::RequestVersion => {
                let mut reply = IpcMessage::ack(msg);
                reply.set_param("version/full", json!(env!("CARGO_PKG_VERSION")));
                reply
            }
            MsgVal::RequestCommands => {
                let mut reply = IpcMessage::ack(msg);
                for (index, plugin) in &self.plugins {
                    for command in plugin.commands() {
                        reply.set_param(&format!("{index}/supported_commands[]"), json!(command));
                    }
                }
                reply
            }
            MsgVal::Execute => {
                let index = msg.get_str(CONFIG_INDEX).map(str::to_string);
                let command = msg.get_str("command").map(str::to_string);
                match (index, command) {
                    (Ok(index), Ok(command)) => match self.plugins.get(&index) {
                        Some(plugin) => {
                            let mut reply = IpcMessage::ack(msg);
                            match plugin.execute(&command, &mut reply) {
                                Ok(()) => reply,
                                Err(e) => IpcMessage::nack(msg, e.to_string()),
                            }
                        }
                        None => IpcMessage::nack(msg, format!("no plugin loaded as {index}")),
                    },
                    _ => IpcMessage::nack(msg, "execute requires index and command parameters"),
                }
            }
            MsgVal::ResetStatistics => {
                for plugin in self.plugins.values() {
                    plugin.reset_statistics();
                }
                self.frames_counted.store(0, Ordering::Release);
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

    fn handle_ready_event(&mut self, event: HubEvent) {
        let msg = match event {
            HubEvent::Message(_, parts) => match parts.first().map(|p| IpcMessage::decode(p)) {
                Some(Ok(msg)) => msg,
                _ => {
                    warn!("undecodable message on frame ready channel");
                    return;
                }
            },
            _ => return,
        };
        match (msg.msg_type, msg.msg_val) {
            (MsgType::Notify, MsgVal::FrameReady) => {
                let frame = msg.get_u64("frame").unwrap_or(0);
                let buffer_id = msg.get_u64("buffer_id").unwrap_or(u64::MAX) as usize;
                self.shared_mem.handle_frame_ready(frame, buffer_id);
            }
            (MsgType::Notify, MsgVal::BufferConfig) => {
                match msg.get_str("shared_buffer_name") {
                    Ok(name) => {
                        if let Err(e) = self.shared_mem.set_shared_buffer(name) {
                            error!("failed to map shared buffer {name}: {e}");
                        }
                    }
                    Err(e) => warn!("buffer config notification without a name: {e}"),
                }
            }
            other => {
                warn!("unexpected message on frame ready channel: {other:?}");
            }
        }
    }

    fn publish_release(&self, release: FrameRelease) {
        if let Some(channel) = &self.release_channel {
            let mut notify = IpcMessage::new(MsgType::Notify, MsgVal::FrameRelease);
            notify.set_param("frame", json!(release.frame_number));
            notify.set_param("buffer_id", json!(release.buffer_id));
            channel.publish(&notify);
        }
    }

    fn request_configuration(&self, reply: &mut IpcMessage) {
        reply.set_param(CONFIG_CTRL_ENDPOINT, json!(self.ctrl_endpoint));
        reply.set_param(CONFIG_META_ENDPOINT, json!(self.meta_endpoint));
        reply.set_param(
            &format!("{CONFIG_FR_SETUP}/{CONFIG_FR_READY}"),
            json!(self.ready_endpoint),
        );
        reply.set_param(
            &format!("{CONFIG_FR_SETUP}/{CONFIG_FR_RELEASE}"),
            json!(self.release_endpoint),
        );
        reply.set_param(
            CONFIG_FRAMES,
            json!(self.shutdown_frame_count.load(Ordering::Acquire)),
        );
        reply.set_param(
            CONFIG_MASTER,
            json!(*self.master_frame.lock().expect("master name poisoned")),
        );
        for (index, plugin) in &self.plugins {
            let mut sub_reply = IpcMessage::ack(reply);
            plugin.request_configuration(&mut sub_reply);
            reply.set_param(index, sub_reply.params);
        }
    }

    fn provide_status(&self, reply: &mut IpcMessage) {
        self.shared_mem.status(reply);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for index in &self.plugin_order {
            let Some(plugin) = self.plugins.get(index) else {
                continue;
            };
            reply.set_param("plugins/names[]", json!(index));
            plugin.status(reply);
            plugin.add_performance_stats(reply);
            errors.extend(plugin.errors());
            warnings.extend(plugin.warnings());
        }
        for error in errors {
            reply.set_param("error[]", json!(error));
        }
        for warning in warnings {
            reply.set_param("warning[]", json!(warning));
        }
        reply.set_param(
            "frames_processed",
            json!(self.frames_counted.load(Ordering::Acquire)),
        );
    }
}

fn connect_with_retry<T>(
    mut connect: impl FnMut(&IoContext) -> std::io::Result<T>,
    io: &IoContext,
    what: &str,
) -> Result<T, ConfigError> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match connect(io) {
            Ok(channel) => return Ok(channel),
            Err(e) if Instant::now() < deadline => {
                debug!("retrying {what} connection: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(ConfigError::new(format!("failed to connect {what}: {e}")));
            }
        }
    }
}

fn json_str(value: &Value, key: &str) -> Result<String, ConfigError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::new(format!("missing plugin parameter: {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configure(controller: &mut ProcessorController, params: Value) -> Result<(), ConfigError> {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.params = params;
        controller.configure(&msg)
    }

    #[test]
    fn load_and_connect_plugins() {
        let mut controller = ProcessorController::new(1);
        configure(
            &mut controller,
            json!({
                "plugin": {
                    "load": {"index": "dummy", "name": "DummyProcessPlugin", "library": "./lib.so"}
                }
            }),
        )
        .unwrap();
        configure(
            &mut controller,
            json!({
                "plugin": {
                    "load": {"index": "hdf", "name": "FileWriterPlugin", "library": "./lib.so"}
                }
            }),
        )
        .unwrap();
        configure(
            &mut controller,
            json!({
                "plugin": {"connect": {"index": "dummy", "connection": "frame_receiver"}}
            }),
        )
        .unwrap();
        configure(
            &mut controller,
            json!({
                "plugin": {"connect": {"index": "hdf", "connection": "dummy"}}
            }),
        )
        .unwrap();
        assert_eq!(controller.plugin_order, vec!["dummy", "hdf"]);

        // Unknown classes are a configuration error
        assert!(configure(
            &mut controller,
            json!({
                "plugin": {"load": {"index": "x", "name": "NoSuchPlugin", "library": ""}}
            }),
        )
        .is_err());

        controller.stop_plugins();
    }

    #[test]
    fn stored_config_replays_identically() {
        let mut controller = ProcessorController::new(1);
        let stored = json!({
            "plugin": {
                "load": {"index": "gap", "name": "GapFillPlugin", "library": ""}
            },
            "gap": {
                "grid_size": [2, 2],
                "chip_size": [4, 4],
                "x_gaps": [0, 1, 0],
                "y_gaps": [0, 1, 0]
            }
        });
        configure(
            &mut controller,
            json!({"store": {"index": "setup_a", "value": stored}}),
        )
        .unwrap();
        assert!(controller.stored_config("setup_a").is_some());
        // Nothing applied yet
        assert!(controller.plugins.is_empty());

        configure(&mut controller, json!({"execute": {"index": "setup_a"}})).unwrap();
        assert_eq!(controller.plugin_order, vec!["gap"]);

        // The stored payload produced the same state as applying it inline
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::RequestConfiguration);
        controller.request_configuration(&mut reply);
        assert_eq!(reply.get_param("gap/grid_size").unwrap(), &json!([2, 2]));

        // Replaying an unknown name is an error
        assert!(configure(&mut controller, json!({"execute": {"index": "missing"}})).is_err());
        controller.stop_plugins();
    }

    #[test]
    fn execute_dispatches_to_plugin() {
        let mut controller = ProcessorController::new(1);
        configure(
            &mut controller,
            json!({
                "plugin": {"load": {"index": "dummy", "name": "DummyProcessPlugin", "library": ""}}
            }),
        )
        .unwrap();

        let mut execute = IpcMessage::new(MsgType::Cmd, MsgVal::Execute);
        execute.set_param("index", json!("dummy"));
        execute.set_param("command", json!("print"));
        let reply = controller.dispatch_ctrl(&execute);
        assert!(reply.is_ack());

        let mut bad = IpcMessage::new(MsgType::Cmd, MsgVal::Execute);
        bad.set_param("index", json!("dummy"));
        bad.set_param("command", json!("levitate"));
        let reply = controller.dispatch_ctrl(&bad);
        assert_eq!(reply.msg_type, MsgType::Nack);

        let commands = controller.dispatch_ctrl(&IpcMessage::new(
            MsgType::Cmd,
            MsgVal::RequestCommands,
        ));
        assert_eq!(
            commands.get_param("dummy/supported_commands").unwrap(),
            &json!(["print"])
        );
        controller.stop_plugins();
    }
}
