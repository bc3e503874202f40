// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of raw frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "float")]
    F32,
    #[default]
    Unknown,
}

impl DataType {
    /// Size of one element in bytes. Unknown reports zero.
    pub fn size(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::U64 => 8,
            DataType::F32 => 4,
            DataType::Unknown => 0,
        }
    }

    pub fn parse(name: &str) -> Option<DataType> {
        match name {
            "uint8" | "u8" => Some(DataType::U8),
            "uint16" | "u16" => Some(DataType::U16),
            "uint32" | "u32" => Some(DataType::U32),
            "uint64" | "u64" => Some(DataType::U64),
            "float" | "f32" => Some(DataType::F32),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::F32 => "float",
            DataType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Compression applied to raw frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Lz4,
    #[serde(rename = "bslz4")]
    BsLz4,
    Blosc,
    #[default]
    Unknown,
}

impl CompressionType {
    pub fn parse(name: &str) -> Option<CompressionType> {
        match name {
            "none" => Some(CompressionType::None),
            "lz4" => Some(CompressionType::Lz4),
            "bslz4" => Some(CompressionType::BsLz4),
            "blosc" => Some(CompressionType::Blosc),
            _ => None,
        }
    }

    /// Registered container filter id for this compression, if any.
    pub fn filter_id(&self) -> Option<u32> {
        match self {
            CompressionType::Lz4 => Some(32004),
            CompressionType::BsLz4 => Some(32008),
            CompressionType::Blosc => Some(32001),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
            CompressionType::BsLz4 => "bslz4",
            CompressionType::Blosc => "blosc",
            CompressionType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::U8.size(), 1);
        assert_eq!(DataType::U16.size(), 2);
        assert_eq!(DataType::U32.size(), 4);
        assert_eq!(DataType::U64.size(), 8);
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::Unknown.size(), 0);
    }

    #[test]
    fn parse_round_trip() {
        for name in ["uint8", "uint16", "uint32", "uint64", "float"] {
            let dt = DataType::parse(name).unwrap();
            assert_eq!(dt.to_string(), name);
        }
        for name in ["none", "lz4", "bslz4", "blosc"] {
            let ct = CompressionType::parse(name).unwrap();
            assert_eq!(ct.to_string(), name);
        }
        assert!(DataType::parse("complex").is_none());
        assert!(CompressionType::parse("zip").is_none());
    }

    #[test]
    fn filter_ids() {
        assert_eq!(CompressionType::Lz4.filter_id(), Some(32004));
        assert_eq!(CompressionType::BsLz4.filter_id(), Some(32008));
        assert_eq!(CompressionType::Blosc.filter_id(), Some(32001));
        assert_eq!(CompressionType::None.filter_id(), None);
    }
}
