// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Meta-data channel. Plugins and the acquisition publish typed values on
//! an in-process channel; the controller forwards each as a two-part wire
//! message (JSON descriptor, then the raw value bytes).

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Integer(i32),
    UInt64(u64),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
}

impl MetaValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            MetaValue::Integer(_) => "integer",
            MetaValue::UInt64(_) => "uint64",
            MetaValue::Double(_) => "double",
            MetaValue::String(_) => "string",
            MetaValue::Raw(_) => "raw",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MetaValue::Integer(v) => v.to_ne_bytes().to_vec(),
            MetaValue::UInt64(v) => v.to_ne_bytes().to_vec(),
            MetaValue::Double(v) => v.to_ne_bytes().to_vec(),
            MetaValue::String(v) => v.as_bytes().to_vec(),
            MetaValue::Raw(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaMessage {
    pub source: String,
    pub parameter: String,
    pub header: String,
    pub value: MetaValue,
}

impl MetaMessage {
    /// First wire part: the JSON descriptor.
    pub fn descriptor(&self) -> Vec<u8> {
        json!({
            "plugin": self.source,
            "parameter": self.parameter,
            "type": self.value.type_name(),
            "header": self.header,
        })
        .to_string()
        .into_bytes()
    }

    /// Both wire parts, descriptor then raw value bytes.
    pub fn to_parts(&self) -> Vec<Vec<u8>> {
        vec![self.descriptor(), self.value.to_bytes()]
    }
}

/// Cloneable handle publishing onto the controller's meta channel.
#[derive(Clone)]
pub struct MetaPublisher {
    tx: Sender<MetaMessage>,
}

impl MetaPublisher {
    pub fn new() -> (MetaPublisher, Receiver<MetaMessage>) {
        let (tx, rx) = unbounded();
        (MetaPublisher { tx }, rx)
    }

    pub fn publish(&self, source: &str, parameter: &str, value: MetaValue, header: &str) {
        let _ = self.tx.send(MetaMessage {
            source: source.to_string(),
            parameter: parameter.to_string(),
            header: header.to_string(),
            value,
        });
    }

    pub fn publish_integer(&self, source: &str, parameter: &str, value: i32, header: &str) {
        self.publish(source, parameter, MetaValue::Integer(value), header);
    }

    pub fn publish_uint64(&self, source: &str, parameter: &str, value: u64, header: &str) {
        self.publish(source, parameter, MetaValue::UInt64(value), header);
    }

    pub fn publish_double(&self, source: &str, parameter: &str, value: f64, header: &str) {
        self.publish(source, parameter, MetaValue::Double(value), header);
    }

    pub fn publish_string(&self, source: &str, parameter: &str, value: &str, header: &str) {
        self.publish(
            source,
            parameter,
            MetaValue::String(value.to_string()),
            header,
        );
    }

    pub fn publish_raw(&self, source: &str, parameter: &str, value: Vec<u8>, header: &str) {
        self.publish(source, parameter, MetaValue::Raw(value), header);
    }
}
