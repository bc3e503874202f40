// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control-plane message envelope. Every message carried on the control,
//! frame-ready and frame-release channels is one of these, encoded as JSON.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("message parameter missing: {0}")]
    MissingParam(String),
    #[error("message parameter has wrong type: {0}")]
    WrongParamType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Cmd,
    Ack,
    Nack,
    Notify,
    Illegal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgVal {
    Configure,
    RequestConfiguration,
    Execute,
    RequestCommands,
    Status,
    RequestVersion,
    ResetStatistics,
    Shutdown,
    FrameReady,
    FrameRelease,
    BufferConfig,
    BufferConfigRequest,
    BufferPrecharge,
    Identity,
    Illegal,
}

impl fmt::Display for MsgVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(s.as_str().unwrap_or("illegal"))
    }
}

/// Request/reply envelope: `msg_type`, `msg_val`, echoed `msg_id`, a
/// timestamp and a nested parameter block addressed by `/`-separated paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcMessage {
    pub msg_type: MsgType,
    pub msg_val: MsgVal,
    #[serde(default)]
    pub msg_id: u64,
    pub timestamp: String,
    #[serde(default)]
    pub params: Value,
}

impl IpcMessage {
    pub fn new(msg_type: MsgType, msg_val: MsgVal) -> Self {
        IpcMessage {
            msg_type,
            msg_val,
            msg_id: 0,
            timestamp: Utc::now().to_rfc3339(),
            params: Value::Object(Map::new()),
        }
    }

    pub fn with_id(mut self, msg_id: u64) -> Self {
        self.msg_id = msg_id;
        self
    }

    /// Build an `ack` reply, echoing value and id of the request.
    pub fn ack(request: &IpcMessage) -> Self {
        IpcMessage::new(MsgType::Ack, request.msg_val).with_id(request.msg_id)
    }

    /// Build a `nack` reply carrying an error string, echoing value and id.
    pub fn nack(request: &IpcMessage, error: impl Into<String>) -> Self {
        let mut reply = IpcMessage::new(MsgType::Nack, request.msg_val).with_id(request.msg_id);
        reply.set_param("error", json!(error.into()));
        reply
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serialization of this shape cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Set a parameter at a `/`-separated path, creating intermediate
    /// objects. A trailing `[]` appends to an array at that path.
    pub fn set_param(&mut self, path: &str, value: Value) {
        let mut node = &mut self.params;
        let (path, append) = match path.strip_suffix("[]") {
            Some(stripped) => (stripped.trim_end_matches('/'), true),
            None => (path, false),
        };
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let map = node.as_object_mut().expect("object ensured above");
            if last {
                if append {
                    let entry = map.entry(segment.to_string()).or_insert_with(|| json!([]));
                    if !entry.is_array() {
                        *entry = json!([]);
                    }
                    entry.as_array_mut().expect("array ensured above").push(value);
                    return;
                }
                map.insert(segment.to_string(), value);
                return;
            }
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }

    /// Get a parameter at a `/`-separated path.
    pub fn get_param(&self, path: &str) -> Option<&Value> {
        let mut node = &self.params;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    pub fn has_param(&self, path: &str) -> bool {
        self.get_param(path).is_some()
    }

    pub fn get_u64(&self, path: &str) -> Result<u64, MessageError> {
        self.get_param(path)
            .ok_or_else(|| MessageError::MissingParam(path.to_string()))?
            .as_u64()
            .ok_or_else(|| MessageError::WrongParamType(path.to_string()))
    }

    pub fn get_str(&self, path: &str) -> Result<&str, MessageError> {
        self.get_param(path)
            .ok_or_else(|| MessageError::MissingParam(path.to_string()))?
            .as_str()
            .ok_or_else(|| MessageError::WrongParamType(path.to_string()))
    }

    pub fn is_ack(&self) -> bool {
        self.msg_type == MsgType::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure).with_id(42);
        msg.set_param("max_buffer_mem", json!(40000));
        msg.set_param("decoder_config/frame_timeout_ms", json!(200));
        msg.set_param("rx_ports[]", json!(61649));
        msg.set_param("rx_ports[]", json!(61650));

        let decoded = IpcMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Cmd);
        assert_eq!(decoded.msg_val, MsgVal::Configure);
        assert_eq!(decoded.msg_id, 42);
        assert_eq!(decoded.get_u64("max_buffer_mem").unwrap(), 40000);
        assert_eq!(decoded.get_u64("decoder_config/frame_timeout_ms").unwrap(), 200);
        assert_eq!(
            decoded.get_param("rx_ports").unwrap(),
            &json!([61649, 61650])
        );
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ack_and_nack_echo_request() {
        let request = IpcMessage::new(MsgType::Cmd, MsgVal::Status).with_id(7);
        let ack = IpcMessage::ack(&request);
        assert_eq!(ack.msg_type, MsgType::Ack);
        assert_eq!(ack.msg_val, MsgVal::Status);
        assert_eq!(ack.msg_id, 7);

        let nack = IpcMessage::nack(&request, "no can do");
        assert_eq!(nack.msg_type, MsgType::Nack);
        assert_eq!(nack.get_str("error").unwrap(), "no can do");
    }

    #[test]
    fn nested_param_creation() {
        let mut msg = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
        msg.set_param("a/b/c", json!(1));
        msg.set_param("a/b/d", json!("two"));
        assert_eq!(msg.get_u64("a/b/c").unwrap(), 1);
        assert_eq!(msg.get_str("a/b/d").unwrap(), "two");
        assert!(msg.get_param("a/x").is_none());
    }

    #[test]
    fn missing_and_mistyped_params() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Execute);
        msg.set_param("command", json!("start"));
        assert!(matches!(
            msg.get_u64("command"),
            Err(MessageError::WrongParamType(_))
        ));
        assert!(matches!(
            msg.get_str("other"),
            Err(MessageError::MissingParam(_))
        ));
    }
}
