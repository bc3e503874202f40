// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use framepipe_common::error::ConfigError;
use framepipe_ipc::IpcMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const CONFIG_MAX_BUFFER_MEM: &str = "max_buffer_mem";
pub const CONFIG_DECODER_TYPE: &str = "decoder_type";
pub const CONFIG_DECODER_CONFIG: &str = "decoder_config";
pub const CONFIG_RX_TYPE: &str = "rx_type";
pub const CONFIG_CTRL_ENDPOINT: &str = "ctrl_endpoint";
pub const CONFIG_RX_ENDPOINT: &str = "rx_endpoint";
pub const CONFIG_FRAME_READY_ENDPOINT: &str = "frame_ready_endpoint";
pub const CONFIG_FRAME_RELEASE_ENDPOINT: &str = "frame_release_endpoint";
pub const CONFIG_RX_PORTS: &str = "rx_ports";
pub const CONFIG_RX_ADDRESS: &str = "rx_address";
pub const CONFIG_RX_RECV_BUFFER_SIZE: &str = "rx_recv_buffer_size";
pub const CONFIG_SHARED_BUFFER_NAME: &str = "shared_buffer_name";
pub const CONFIG_FRAME_TIMEOUT_MS: &str = "frame_timeout_ms";
pub const CONFIG_FRAME_COUNT: &str = "frame_count";
pub const CONFIG_ENABLE_PACKET_LOGGING: &str = "enable_packet_logging";
pub const CONFIG_FORCE_RECONFIG: &str = "force_reconfig";
pub const CONFIG_DEBUG: &str = "debug_level";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RxType {
    #[default]
    Udp,
    Tcp,
    Stream,
}

impl RxType {
    pub fn parse(name: &str) -> Option<RxType> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Some(RxType::Udp),
            "tcp" => Some(RxType::Tcp),
            "stream" | "zmq" => Some(RxType::Stream),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RxType::Udp => "udp",
            RxType::Tcp => "tcp",
            RxType::Stream => "stream",
        }
    }
}

/// Storage container for receiver configuration parameters derived from the
/// command line and from control-channel configure messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub max_buffer_mem: usize,
    pub decoder_type: String,
    pub decoder_config: Value,
    pub rx_type: RxType,
    pub rx_ports: Vec<u16>,
    pub rx_address: String,
    pub rx_recv_buffer_size: usize,
    pub io_threads: usize,
    pub rx_channel_endpoint: String,
    pub ctrl_channel_endpoint: String,
    pub frame_ready_endpoint: String,
    pub frame_release_endpoint: String,
    pub shared_buffer_name: String,
    pub frame_timeout_ms: u64,
    pub frame_count: u64,
    pub enable_packet_logging: bool,
    pub force_reconfig: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            max_buffer_mem: 1_048_576,
            decoder_type: String::new(),
            decoder_config: json!({}),
            rx_type: RxType::Udp,
            rx_ports: vec![61649],
            rx_address: "0.0.0.0".to_string(),
            rx_recv_buffer_size: 30_000_000,
            io_threads: 1,
            rx_channel_endpoint: "inproc://rx_channel".to_string(),
            ctrl_channel_endpoint: "tcp://*:5000".to_string(),
            frame_ready_endpoint: "tcp://*:5001".to_string(),
            frame_release_endpoint: "tcp://*:5002".to_string(),
            shared_buffer_name: "FrameReceiverBuffer".to_string(),
            frame_timeout_ms: 1000,
            frame_count: 0,
            enable_packet_logging: false,
            force_reconfig: false,
        }
    }
}

impl ReceiverConfig {
    /// Apply the parameters present in a configure message. Unknown values
    /// for enumerated fields are a `ConfigError`; parameters not present are
    /// left unchanged.
    pub fn apply(&mut self, msg: &IpcMessage) -> Result<(), ConfigError> {
        if let Some(v) = msg.get_param(CONFIG_MAX_BUFFER_MEM) {
            self.max_buffer_mem = as_usize(v, CONFIG_MAX_BUFFER_MEM)?;
        }
        if let Some(v) = msg.get_param(CONFIG_DECODER_TYPE) {
            self.decoder_type = as_string(v, CONFIG_DECODER_TYPE)?;
        }
        if let Some(v) = msg.get_param(CONFIG_DECODER_CONFIG) {
            self.decoder_config = v.clone();
        }
        if let Some(v) = msg.get_param(CONFIG_RX_TYPE) {
            let name = as_string(v, CONFIG_RX_TYPE)?;
            self.rx_type = RxType::parse(&name)
                .ok_or_else(|| ConfigError::new(format!("unknown rx_type: {name}")))?;
        }
        if let Some(v) = msg.get_param(CONFIG_RX_PORTS) {
            self.rx_ports = parse_ports(v)?;
        }
        if let Some(v) = msg.get_param(CONFIG_RX_ADDRESS) {
            self.rx_address = as_string(v, CONFIG_RX_ADDRESS)?;
        }
        if let Some(v) = msg.get_param(CONFIG_RX_RECV_BUFFER_SIZE) {
            self.rx_recv_buffer_size = as_usize(v, CONFIG_RX_RECV_BUFFER_SIZE)?;
        }
        if let Some(v) = msg.get_param(CONFIG_CTRL_ENDPOINT) {
            self.ctrl_channel_endpoint = as_string(v, CONFIG_CTRL_ENDPOINT)?;
        }
        if let Some(v) = msg.get_param(CONFIG_RX_ENDPOINT) {
            self.rx_channel_endpoint = as_string(v, CONFIG_RX_ENDPOINT)?;
        }
        if let Some(v) = msg.get_param(CONFIG_FRAME_READY_ENDPOINT) {
            self.frame_ready_endpoint = as_string(v, CONFIG_FRAME_READY_ENDPOINT)?;
        }
        if let Some(v) = msg.get_param(CONFIG_FRAME_RELEASE_ENDPOINT) {
            self.frame_release_endpoint = as_string(v, CONFIG_FRAME_RELEASE_ENDPOINT)?;
        }
        if let Some(v) = msg.get_param(CONFIG_SHARED_BUFFER_NAME) {
            self.shared_buffer_name = as_string(v, CONFIG_SHARED_BUFFER_NAME)?;
        }
        if let Some(v) = msg.get_param(&format!("{CONFIG_DECODER_CONFIG}/{CONFIG_FRAME_TIMEOUT_MS}"))
        {
            self.frame_timeout_ms = as_u64(v, CONFIG_FRAME_TIMEOUT_MS)?;
        }
        if let Some(v) = msg.get_param(CONFIG_FRAME_COUNT) {
            self.frame_count = as_u64(v, CONFIG_FRAME_COUNT)?;
        }
        if let Some(v) =
            msg.get_param(&format!("{CONFIG_DECODER_CONFIG}/{CONFIG_ENABLE_PACKET_LOGGING}"))
        {
            self.enable_packet_logging = v
                .as_bool()
                .ok_or_else(|| ConfigError::new("enable_packet_logging must be a boolean"))?;
        }
        if let Some(v) = msg.get_param(CONFIG_FORCE_RECONFIG) {
            self.force_reconfig = v
                .as_bool()
                .ok_or_else(|| ConfigError::new("force_reconfig must be a boolean"))?;
        }
        Ok(())
    }

    /// Fill a reply with the current configuration.
    pub fn as_reply(&self, reply: &mut IpcMessage) {
        reply.set_param(CONFIG_CTRL_ENDPOINT, json!(self.ctrl_channel_endpoint));
        reply.set_param(CONFIG_RX_ENDPOINT, json!(self.rx_channel_endpoint));
        reply.set_param(CONFIG_FRAME_READY_ENDPOINT, json!(self.frame_ready_endpoint));
        reply.set_param(
            CONFIG_FRAME_RELEASE_ENDPOINT,
            json!(self.frame_release_endpoint),
        );
        reply.set_param(CONFIG_DECODER_TYPE, json!(self.decoder_type));
        reply.set_param(CONFIG_RX_TYPE, json!(self.rx_type.name()));
        reply.set_param(CONFIG_RX_ADDRESS, json!(self.rx_address));
        reply.set_param(CONFIG_RX_PORTS, json!(self.rx_ports));
        reply.set_param(CONFIG_RX_RECV_BUFFER_SIZE, json!(self.rx_recv_buffer_size));
        reply.set_param(CONFIG_SHARED_BUFFER_NAME, json!(self.shared_buffer_name));
        reply.set_param(CONFIG_MAX_BUFFER_MEM, json!(self.max_buffer_mem));
        reply.set_param(CONFIG_FRAME_COUNT, json!(self.frame_count));
        reply.set_param(
            &format!("{CONFIG_DECODER_CONFIG}/{CONFIG_FRAME_TIMEOUT_MS}"),
            json!(self.frame_timeout_ms),
        );
        reply.set_param(
            &format!("{CONFIG_DECODER_CONFIG}/{CONFIG_ENABLE_PACKET_LOGGING}"),
            json!(self.enable_packet_logging),
        );
    }

    /// Sections whose configuration differs from `other`, driving the
    /// partial-reconfiguration paths in the controller.
    pub fn dirty_against(&self, other: &ReceiverConfig) -> DirtySet {
        DirtySet {
            ipc: self.ctrl_channel_endpoint != other.ctrl_channel_endpoint
                || self.frame_ready_endpoint != other.frame_ready_endpoint
                || self.frame_release_endpoint != other.frame_release_endpoint
                || self.io_threads != other.io_threads,
            decoder: self.decoder_type != other.decoder_type
                || self.decoder_config != other.decoder_config
                || self.frame_timeout_ms != other.frame_timeout_ms
                || self.enable_packet_logging != other.enable_packet_logging,
            buffer_manager: self.shared_buffer_name != other.shared_buffer_name
                || self.max_buffer_mem != other.max_buffer_mem,
            rx_thread: self.rx_type != other.rx_type
                || self.rx_ports != other.rx_ports
                || self.rx_address != other.rx_address
                || self.rx_recv_buffer_size != other.rx_recv_buffer_size,
        }
    }
}

/// The components touched by a configuration change.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirtySet {
    pub ipc: bool,
    pub decoder: bool,
    pub buffer_manager: bool,
    pub rx_thread: bool,
}

impl DirtySet {
    pub fn all() -> DirtySet {
        DirtySet {
            ipc: true,
            decoder: true,
            buffer_manager: true,
            rx_thread: true,
        }
    }

    pub fn any(&self) -> bool {
        self.ipc || self.decoder || self.buffer_manager || self.rx_thread
    }
}

fn as_usize(v: &Value, name: &str) -> Result<usize, ConfigError> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| ConfigError::new(format!("{name} must be an unsigned integer")))
}

fn as_u64(v: &Value, name: &str) -> Result<u64, ConfigError> {
    v.as_u64()
        .ok_or_else(|| ConfigError::new(format!("{name} must be an unsigned integer")))
}

fn as_string(v: &Value, name: &str) -> Result<String, ConfigError> {
    v.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::new(format!("{name} must be a string")))
}

/// Ports arrive either as a JSON array or as a comma separated string.
fn parse_ports(v: &Value) -> Result<Vec<u16>, ConfigError> {
    if let Some(list) = v.as_array() {
        return list
            .iter()
            .map(|p| {
                p.as_u64()
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(|| ConfigError::new("rx_ports entries must be u16"))
            })
            .collect();
    }
    if let Some(s) = v.as_str() {
        let mut ports = Vec::new();
        for token in s.split(',').filter(|t| !t.is_empty()) {
            let port: u16 = token
                .trim()
                .parse()
                .map_err(|_| ConfigError::new(format!("invalid rx port: {token}")))?;
            ports.push(port);
        }
        return Ok(ports);
    }
    Err(ConfigError::new("rx_ports must be an array or string"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_ipc::{MsgType, MsgVal};

    #[test]
    fn apply_configure_message() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param(CONFIG_MAX_BUFFER_MEM, json!(40000));
        msg.set_param(CONFIG_DECODER_TYPE, json!("dummy"));
        msg.set_param(CONFIG_RX_TYPE, json!("udp"));
        msg.set_param(CONFIG_RX_PORTS, json!("61649,61650"));
        msg.set_param(
            &format!("{CONFIG_DECODER_CONFIG}/{CONFIG_FRAME_TIMEOUT_MS}"),
            json!(250),
        );

        let mut config = ReceiverConfig::default();
        config.apply(&msg).unwrap();
        assert_eq!(config.max_buffer_mem, 40000);
        assert_eq!(config.decoder_type, "dummy");
        assert_eq!(config.rx_ports, vec![61649, 61650]);
        assert_eq!(config.frame_timeout_ms, 250);
    }

    #[test]
    fn bad_rx_type_is_config_error() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param(CONFIG_RX_TYPE, json!("carrier-pigeon"));
        let mut config = ReceiverConfig::default();
        assert!(config.apply(&msg).is_err());
        // The previous good value is untouched
        assert_eq!(config.rx_type, RxType::Udp);
    }

    #[test]
    fn dirty_set_partition() {
        let base = ReceiverConfig::default();
        let mut changed = base.clone();
        changed.shared_buffer_name = "OtherBuffer".to_string();
        let dirty = changed.dirty_against(&base);
        assert!(dirty.buffer_manager);
        assert!(!dirty.ipc);
        assert!(!dirty.decoder);
        assert!(!dirty.rx_thread);
    }
}
