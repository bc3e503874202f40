// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use framepipe_common::{CompressionType, DataType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed frame parameter. Recognized parameter names may be written as
/// companion 1-D datasets alongside the image data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    String(String),
    Raw(Vec<u8>),
}

impl ParamValue {
    /// Scalar bytes in host order, as written to a parameter dataset.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ParamValue::U8(v) => vec![*v],
            ParamValue::U16(v) => v.to_ne_bytes().to_vec(),
            ParamValue::U32(v) => v.to_ne_bytes().to_vec(),
            ParamValue::U64(v) => v.to_ne_bytes().to_vec(),
            ParamValue::F32(v) => v.to_ne_bytes().to_vec(),
            ParamValue::String(v) => v.as_bytes().to_vec(),
            ParamValue::Raw(v) => v.clone(),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::U8(v) => Some(*v as u64),
            ParamValue::U16(v) => Some(*v as u64),
            ParamValue::U32(v) => Some(*v as u64),
            ParamValue::U64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Frame metadata, immutable once attached to a frame copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetaData {
    pub dataset_name: String,
    pub data_type: DataType,
    pub acquisition_id: String,
    pub dimensions: Vec<u64>,
    pub compression: CompressionType,
    pub frame_offset: i64,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

impl FrameMetaData {
    pub fn new(
        dataset_name: impl Into<String>,
        data_type: DataType,
        acquisition_id: impl Into<String>,
        dimensions: Vec<u64>,
        compression: CompressionType,
    ) -> Self {
        FrameMetaData {
            dataset_name: dataset_name.into(),
            data_type,
            acquisition_id: acquisition_id.into(),
            dimensions,
            compression,
            frame_offset: 0,
            parameters: BTreeMap::new(),
        }
    }

    /// Number of image bytes implied by dimensions and element size.
    pub fn image_bytes(&self) -> usize {
        self.dimensions.iter().product::<u64>() as usize * self.data_type.size()
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: ParamValue) {
        self.parameters.insert(name.into(), value);
    }

    pub fn get_parameter(&self, name: &str) -> Option<&ParamValue> {
        self.parameters.get(name)
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn adjust_frame_offset(&mut self, increment: i64) {
        self.frame_offset += increment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_bytes_from_dimensions() {
        let meta = FrameMetaData::new(
            "data",
            DataType::U16,
            "acq1",
            vec![512, 768],
            CompressionType::None,
        );
        assert_eq!(meta.image_bytes(), 512 * 768 * 2);
    }

    #[test]
    fn parameters_round_trip() {
        let mut meta = FrameMetaData::default();
        meta.set_parameter("temperature", ParamValue::F32(36.5));
        meta.set_parameter("uid", ParamValue::U64(99));
        assert!(meta.has_parameter("temperature"));
        assert_eq!(meta.get_parameter("uid").unwrap().as_u64(), Some(99));
        assert!(!meta.has_parameter("missing"));
    }

    #[test]
    fn param_value_bytes() {
        assert_eq!(ParamValue::U8(7).to_bytes(), vec![7]);
        assert_eq!(ParamValue::U16(0x0102).to_bytes(), 0x0102u16.to_ne_bytes());
        assert_eq!(ParamValue::U64(1).to_bytes().len(), 8);
        assert_eq!(ParamValue::String("ab".into()).to_bytes(), b"ab");
    }
}
