// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chunked container files. One writer appends dataset definitions, chunk
//! data and parameter elements as self-describing records; readers scan the
//! record stream, so a file is readable while it is still being written.
//! Frame payloads are appended as direct chunk writes with a filter mask of
//! zero because the data arrives already compressed; the registered filter
//! id and cd_values are recorded on the dataset so readers can decode.

use framepipe_common::{CompressionType, DataType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

const MAGIC: &[u8; 4] = b"FPCF";
const FORMAT_VERSION: u32 = 1;
const SUPERBLOCK_SIZE: u64 = 40;
const RECORD_HEADER_SIZE: u64 = 40;

const RECORD_DATASET: u32 = 1;
const RECORD_CHUNK: u32 = 2;
const RECORD_PARAMETER: u32 = 3;
const RECORD_CLOSE: u32 = 4;

/// Rate limit for parameter dataset flushes.
const PARAM_FLUSH_RATE_MS: u128 = 1000;

/// Blosc buffer format version recorded in cd_values.
const BLOSC_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container call failed ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Validation(String),
    #[error("attempted to access non-existent dataset: \"{0}\"")]
    UnknownDataset(String),
    #[error("write beyond dataset extent: {0}")]
    ExtentExceeded(String),
}

fn io_err(context: &str) -> impl FnOnce(std::io::Error) -> ContainerError + '_ {
    move |source| ContainerError::Io {
        context: context.to_string(),
        source,
    }
}

/// Definition of one dataset within an acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub name: String,
    pub data_type: DataType,
    pub frame_dimensions: Vec<u64>,
    pub chunk_dimensions: Vec<u64>,
    pub compression: CompressionType,
    #[serde(default)]
    pub blosc_compressor: u32,
    #[serde(default)]
    pub blosc_level: u32,
    #[serde(default)]
    pub blosc_shuffle: u32,
    /// Outer-axis extent; zero means unlimited.
    #[serde(default)]
    pub num_frames: u64,
    #[serde(default)]
    pub create_low_high_indexes: bool,
}

impl Default for DatasetDefinition {
    fn default() -> Self {
        DatasetDefinition {
            name: String::new(),
            data_type: DataType::U16,
            frame_dimensions: Vec::new(),
            chunk_dimensions: Vec::new(),
            compression: CompressionType::None,
            blosc_compressor: 1,
            blosc_level: 4,
            blosc_shuffle: 0,
            num_frames: 0,
            create_low_high_indexes: false,
        }
    }
}

impl DatasetDefinition {
    pub fn frame_bytes(&self) -> usize {
        self.frame_dimensions.iter().product::<u64>() as usize * self.data_type.size()
    }

    /// cd_values as documented for the registered filters.
    pub fn cd_values(&self) -> Vec<u32> {
        match self.compression {
            CompressionType::Lz4 => vec![3],
            CompressionType::BsLz4 => vec![0, 2],
            CompressionType::Blosc => vec![
                BLOSC_FORMAT_VERSION,
                2,
                self.data_type.size() as u32,
                self.frame_bytes() as u32,
                self.blosc_level,
                self.blosc_shuffle,
                self.blosc_compressor,
            ],
            _ => Vec::new(),
        }
    }
}

/// The JSON payload of a dataset-definition record.
#[derive(Debug, Serialize, Deserialize)]
struct DatasetRecord {
    definition: DatasetDefinition,
    filter_id: Option<u32>,
    cd_values: Vec<u32>,
    image_nr_low: Option<i32>,
    image_nr_high: Option<i32>,
}

struct DatasetState {
    id: u32,
    definition: DatasetDefinition,
    actual_size: u64,
    last_flushed: Option<Instant>,
}

struct RecordHeader {
    kind: u32,
    dataset_id: u32,
    filter_mask: u32,
    aux: u32,
    index: u64,
    data_len: u64,
    pad: u32,
}

impl RecordHeader {
    fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut bytes = [0u8; RECORD_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.kind.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.dataset_id.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.filter_mask.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.aux.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.index.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.data_len.to_le_bytes());
        bytes[32..36].copy_from_slice(&self.pad.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<RecordHeader> {
        if bytes.len() < RECORD_HEADER_SIZE as usize {
            return None;
        }
        Some(RecordHeader {
            kind: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            dataset_id: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            filter_mask: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            aux: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
            index: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
            data_len: u64::from_le_bytes(bytes[24..32].try_into().ok()?),
            pad: u32::from_le_bytes(bytes[32..36].try_into().ok()?),
        })
    }
}

/// Single-writer view of a container file.
pub struct ContainerFile {
    file: File,
    path: PathBuf,
    file_index: usize,
    alignment_threshold: u64,
    alignment_value: u64,
    datasets: HashMap<String, DatasetState>,
    next_dataset_id: u32,
    position: u64,
    closed: bool,
}

impl ContainerFile {
    /// Create (truncating) a container file with the given alignment hint.
    pub fn create(
        path: &Path,
        file_index: usize,
        alignment_threshold: u64,
        alignment_value: u64,
    ) -> Result<ContainerFile, ContainerError> {
        info!("creating file: {}", path.display());
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)
            .map_err(io_err("create file"))?;

        let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
        superblock[0..4].copy_from_slice(MAGIC);
        superblock[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        superblock[8..16].copy_from_slice(&alignment_threshold.to_le_bytes());
        superblock[16..24].copy_from_slice(&alignment_value.to_le_bytes());
        file.write_all(&superblock).map_err(io_err("write superblock"))?;

        Ok(ContainerFile {
            file,
            path: path.to_path_buf(),
            file_index,
            alignment_threshold,
            alignment_value: alignment_value.max(1),
            datasets: HashMap::new(),
            next_dataset_id: 0,
            position: SUPERBLOCK_SIZE,
            closed: false,
        })
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn filename(&self) -> String {
        self.path.display().to_string()
    }

    /// Create a dataset. Chunking is mandatory: the chunk rank must be one
    /// greater than the frame rank (the outer axis), and the outer chunk
    /// dimension is clamped to a bounded extent.
    pub fn create_dataset(
        &mut self,
        definition: &DatasetDefinition,
        low_index: i32,
        high_index: i32,
    ) -> Result<(), ContainerError> {
        self.ensure_open()?;
        if self.datasets.contains_key(&definition.name) {
            return Err(ContainerError::Validation(format!(
                "dataset {} already exists",
                definition.name
            )));
        }
        if definition.frame_dimensions.iter().any(|&d| d == 0) {
            return Err(ContainerError::Validation(
                "image dimensions must be non-zero".to_string(),
            ));
        }
        if definition.chunk_dimensions.iter().any(|&d| d == 0) {
            return Err(ContainerError::Validation(
                "chunk dimensions must be non-zero".to_string(),
            ));
        }
        if definition.chunk_dimensions.len() != definition.frame_dimensions.len() + 1 {
            return Err(ContainerError::Validation(
                "dataset chunk size not defined correctly".to_string(),
            ));
        }
        let mut definition = definition.clone();
        if definition.num_frames > 0 && definition.chunk_dimensions[0] > definition.num_frames {
            definition.chunk_dimensions[0] = definition.num_frames;
        }

        let id = self.next_dataset_id;
        self.next_dataset_id += 1;

        let record = DatasetRecord {
            filter_id: definition.compression.filter_id(),
            cd_values: definition.cd_values(),
            image_nr_low: definition.create_low_high_indexes.then_some(low_index),
            image_nr_high: definition.create_low_high_indexes.then_some(high_index),
            definition: definition.clone(),
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|e| ContainerError::Validation(format!("dataset record encoding: {e}")))?;

        info!("creating dataset: {}", definition.name);
        self.append_record(RECORD_DATASET, id, 0, 0, 0, &payload)?;
        self.datasets.insert(
            definition.name.clone(),
            DatasetState {
                id,
                definition,
                actual_size: 0,
                last_flushed: None,
            },
        );
        Ok(())
    }

    /// Direct chunk append: `offset` is the dataset's outer-axis element
    /// offset, `n_images` the images packed in this chunk. The payload is
    /// written as-is with the caller's filter mask.
    pub fn write_chunk(
        &mut self,
        dataset_name: &str,
        offset: u64,
        n_images: u64,
        filter_mask: u32,
        payload: &[u8],
    ) -> Result<(), ContainerError> {
        self.ensure_open()?;
        let (id, max_size) = {
            let state = self
                .datasets
                .get(dataset_name)
                .ok_or_else(|| ContainerError::UnknownDataset(dataset_name.to_string()))?;
            (state.id, state.definition.num_frames)
        };
        if max_size > 0 && offset + n_images > max_size {
            return Err(ContainerError::ExtentExceeded(format!(
                "offset {offset} + {n_images} images > extent {max_size} of dataset {dataset_name}"
            )));
        }
        debug!(
            "writing chunk at offset {offset} ({n_images} images) to dataset {dataset_name}"
        );
        self.append_record(RECORD_CHUNK, id, filter_mask, n_images as u32, offset, payload)?;
        let state = self
            .datasets
            .get_mut(dataset_name)
            .expect("dataset checked above");
        if offset + n_images > state.actual_size {
            state.actual_size = offset + n_images;
        }
        Ok(())
    }

    /// Write one element of a 1-D parameter dataset. Flushes are throttled
    /// to one per second per dataset.
    pub fn write_parameter(
        &mut self,
        dataset_name: &str,
        element_index: u64,
        value: &[u8],
    ) -> Result<(), ContainerError> {
        self.ensure_open()?;
        let (id, max_size) = {
            let state = self
                .datasets
                .get(dataset_name)
                .ok_or_else(|| ContainerError::UnknownDataset(dataset_name.to_string()))?;
            (state.id, state.definition.num_frames)
        };
        if max_size > 0 && element_index >= max_size {
            return Err(ContainerError::ExtentExceeded(format!(
                "element {element_index} >= extent {max_size} of dataset {dataset_name}"
            )));
        }
        self.append_record(RECORD_PARAMETER, id, 0, 0, element_index, value)?;

        let state = self
            .datasets
            .get_mut(dataset_name)
            .expect("dataset checked above");
        if element_index + 1 > state.actual_size {
            state.actual_size = element_index + 1;
        }
        let flush_due = match state.last_flushed {
            Some(last) => last.elapsed().as_millis() > PARAM_FLUSH_RATE_MS,
            None => true,
        };
        if flush_due {
            state.last_flushed = Some(Instant::now());
            debug!("flushing parameter [{dataset_name}]");
            self.file.sync_data().map_err(io_err("flush parameter"))?;
        }
        Ok(())
    }

    /// Flush appended data for readers.
    pub fn flush_dataset(&mut self, dataset_name: &str) -> Result<(), ContainerError> {
        self.ensure_open()?;
        if !self.datasets.contains_key(dataset_name) {
            return Err(ContainerError::UnknownDataset(dataset_name.to_string()));
        }
        self.file.sync_data().map_err(io_err("flush dataset"))
    }

    /// Frames written so far (up to the highest written offset).
    pub fn dataset_frames(&self, dataset_name: &str) -> Result<u64, ContainerError> {
        self.datasets
            .get(dataset_name)
            .map(|s| s.actual_size)
            .ok_or_else(|| ContainerError::UnknownDataset(dataset_name.to_string()))
    }

    /// Maximum outer extent; zero for unlimited datasets.
    pub fn dataset_max_size(&self, dataset_name: &str) -> Result<u64, ContainerError> {
        self.datasets
            .get(dataset_name)
            .map(|s| s.definition.num_frames)
            .ok_or_else(|| ContainerError::UnknownDataset(dataset_name.to_string()))
    }

    /// Strong close: a close record then a full sync. Further calls fail.
    pub fn close(&mut self) -> Result<(), ContainerError> {
        if self.closed {
            return Ok(());
        }
        self.append_record(RECORD_CLOSE, 0, 0, 0, 0, &[])?;
        self.file.sync_all().map_err(io_err("close file"))?;
        self.closed = true;
        info!("closed file {}", self.path.display());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), ContainerError> {
        if self.closed {
            return Err(ContainerError::Validation(format!(
                "file {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn append_record(
        &mut self,
        kind: u32,
        dataset_id: u32,
        filter_mask: u32,
        aux: u32,
        index: u64,
        payload: &[u8],
    ) -> Result<(), ContainerError> {
        // Large chunk payloads are aligned to the configured boundary
        let payload_start = self.position + RECORD_HEADER_SIZE;
        let pad = if kind == RECORD_CHUNK
            && payload.len() as u64 >= self.alignment_threshold
            && self.alignment_value > 1
        {
            (self.alignment_value - (payload_start % self.alignment_value)) % self.alignment_value
        } else {
            0
        };
        let header = RecordHeader {
            kind,
            dataset_id,
            filter_mask,
            aux,
            index,
            data_len: payload.len() as u64,
            pad: pad as u32,
        };
        self.file
            .write_all(&header.to_bytes())
            .map_err(io_err("write record header"))?;
        if pad > 0 {
            self.file
                .write_all(&vec![0u8; pad as usize])
                .map_err(io_err("write alignment padding"))?;
        }
        self.file.write_all(payload).map_err(io_err("write record"))?;
        self.position += RECORD_HEADER_SIZE + pad + payload.len() as u64;
        Ok(())
    }
}

impl Drop for ContainerFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct ChunkLocation {
    offset: u64,
    n_images: u64,
    file_offset: u64,
    data_len: u64,
    filter_mask: u32,
}

struct ReaderDataset {
    definition: DatasetDefinition,
    image_nr_low: Option<i32>,
    image_nr_high: Option<i32>,
    chunks: Vec<ChunkLocation>,
    parameters: HashMap<u64, Vec<u8>>,
}

/// Read-side view built by scanning the record stream.
pub struct ContainerReader {
    file: File,
    datasets: HashMap<String, ReaderDataset>,
    cleanly_closed: bool,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<ContainerReader, ContainerError> {
        let mut file = File::open(path).map_err(io_err("open file"))?;
        let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact(&mut superblock).map_err(io_err("read superblock"))?;
        if &superblock[0..4] != MAGIC {
            return Err(ContainerError::Validation(
                "not a container file".to_string(),
            ));
        }

        let mut datasets: HashMap<String, ReaderDataset> = HashMap::new();
        let mut names_by_id: HashMap<u32, String> = HashMap::new();
        let mut position = SUPERBLOCK_SIZE;
        let mut cleanly_closed = false;
        let mut header_bytes = [0u8; RECORD_HEADER_SIZE as usize];
        loop {
            match file.read_exact(&mut header_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err("read record header")(e)),
            }
            let header = RecordHeader::from_bytes(&header_bytes).ok_or_else(|| {
                ContainerError::Validation("unreadable record header".to_string())
            })?;
            let payload_offset = position + RECORD_HEADER_SIZE + header.pad as u64;
            match header.kind {
                RECORD_DATASET => {
                    let mut payload = vec![0u8; header.data_len as usize];
                    file.seek(SeekFrom::Start(payload_offset))
                        .map_err(io_err("seek record"))?;
                    file.read_exact(&mut payload).map_err(io_err("read record"))?;
                    let record: DatasetRecord = serde_json::from_slice(&payload)
                        .map_err(|e| {
                            ContainerError::Validation(format!("dataset record decoding: {e}"))
                        })?;
                    names_by_id.insert(header.dataset_id, record.definition.name.clone());
                    datasets.insert(
                        record.definition.name.clone(),
                        ReaderDataset {
                            definition: record.definition,
                            image_nr_low: record.image_nr_low,
                            image_nr_high: record.image_nr_high,
                            chunks: Vec::new(),
                            parameters: HashMap::new(),
                        },
                    );
                }
                RECORD_CHUNK => {
                    if let Some(name) = names_by_id.get(&header.dataset_id) {
                        if let Some(dataset) = datasets.get_mut(name) {
                            dataset.chunks.push(ChunkLocation {
                                offset: header.index,
                                n_images: header.aux as u64,
                                file_offset: payload_offset,
                                data_len: header.data_len,
                                filter_mask: header.filter_mask,
                            });
                        }
                    }
                    file.seek(SeekFrom::Start(payload_offset + header.data_len))
                        .map_err(io_err("seek record"))?;
                }
                RECORD_PARAMETER => {
                    let mut payload = vec![0u8; header.data_len as usize];
                    file.seek(SeekFrom::Start(payload_offset))
                        .map_err(io_err("seek record"))?;
                    file.read_exact(&mut payload).map_err(io_err("read record"))?;
                    if let Some(name) = names_by_id.get(&header.dataset_id) {
                        if let Some(dataset) = datasets.get_mut(name) {
                            dataset.parameters.insert(header.index, payload);
                        }
                    }
                }
                RECORD_CLOSE => {
                    cleanly_closed = true;
                }
                other => {
                    return Err(ContainerError::Validation(format!(
                        "unknown record kind {other}"
                    )));
                }
            }
            position = payload_offset + header.data_len;
            file.seek(SeekFrom::Start(position)).map_err(io_err("seek record"))?;
        }

        Ok(ContainerReader {
            file,
            datasets,
            cleanly_closed,
        })
    }

    pub fn cleanly_closed(&self) -> bool {
        self.cleanly_closed
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    pub fn definition(&self, dataset_name: &str) -> Option<&DatasetDefinition> {
        self.datasets.get(dataset_name).map(|d| &d.definition)
    }

    pub fn image_nr_attributes(&self, dataset_name: &str) -> Option<(i32, i32)> {
        let dataset = self.datasets.get(dataset_name)?;
        Some((dataset.image_nr_low?, dataset.image_nr_high?))
    }

    /// Frames present, counting gaps up to the highest written offset.
    pub fn dataset_frames(&self, dataset_name: &str) -> u64 {
        self.datasets
            .get(dataset_name)
            .map(|d| {
                d.chunks
                    .iter()
                    .map(|c| c.offset + c.n_images)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Payload bytes of one outer-axis entry. The last write to an offset
    /// wins, matching the writer's rewrite behavior.
    pub fn read_frame(
        &mut self,
        dataset_name: &str,
        outer_index: u64,
    ) -> Result<Vec<u8>, ContainerError> {
        let dataset = self
            .datasets
            .get(dataset_name)
            .ok_or_else(|| ContainerError::UnknownDataset(dataset_name.to_string()))?;
        let frame_bytes = dataset.definition.frame_bytes() as u64;
        let chunk = dataset
            .chunks
            .iter()
            .rev()
            .find(|c| outer_index >= c.offset && outer_index < c.offset + c.n_images.max(1))
            .ok_or_else(|| {
                ContainerError::Validation(format!(
                    "no chunk covers index {outer_index} of dataset {dataset_name}"
                ))
            })?;

        let mut payload = vec![0u8; chunk.data_len as usize];
        self.file
            .seek(SeekFrom::Start(chunk.file_offset))
            .map_err(io_err("seek chunk"))?;
        self.file
            .read_exact(&mut payload)
            .map_err(io_err("read chunk"))?;

        if chunk.filter_mask == 0
            && dataset.definition.compression == CompressionType::None
            && chunk.n_images > 1
        {
            let start = ((outer_index - chunk.offset) * frame_bytes) as usize;
            let end = (start + frame_bytes as usize).min(payload.len());
            return Ok(payload[start..end].to_vec());
        }
        Ok(payload)
    }

    pub fn parameter(&self, dataset_name: &str, element_index: u64) -> Option<&[u8]> {
        self.datasets
            .get(dataset_name)?
            .parameters
            .get(&element_index)
            .map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_def(name: &str, num_frames: u64) -> DatasetDefinition {
        DatasetDefinition {
            name: name.to_string(),
            data_type: DataType::U16,
            frame_dimensions: vec![4, 4],
            chunk_dimensions: vec![1, 4, 4],
            num_frames,
            ..DatasetDefinition::default()
        }
    }

    #[test]
    fn write_and_read_back_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acq_000001.fpc");
        let payload: Vec<u8> = (0..32).collect();
        {
            let mut file = ContainerFile::create(&path, 0, 1, 1).unwrap();
            file.create_dataset(&image_def("data", 10), -1, -1).unwrap();
            file.write_chunk("data", 3, 1, 0, &payload).unwrap();
            file.flush_dataset("data").unwrap();
            assert_eq!(file.dataset_frames("data").unwrap(), 4);
            assert_eq!(file.dataset_max_size("data").unwrap(), 10);
            file.close().unwrap();
        }
        let mut reader = ContainerReader::open(&path).unwrap();
        assert!(reader.cleanly_closed());
        assert_eq!(reader.dataset_frames("data"), 4);
        assert_eq!(reader.read_frame("data", 3).unwrap(), payload);
    }

    #[test]
    fn bounded_extent_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounded.fpc");
        let mut file = ContainerFile::create(&path, 0, 1, 1).unwrap();
        file.create_dataset(&image_def("data", 2), -1, -1).unwrap();
        file.write_chunk("data", 1, 1, 0, &[0; 32]).unwrap();
        assert!(matches!(
            file.write_chunk("data", 2, 1, 0, &[0; 32]),
            Err(ContainerError::ExtentExceeded(_))
        ));
        // dataset_frames never exceeds dataset_max_size
        assert!(file.dataset_frames("data").unwrap() <= file.dataset_max_size("data").unwrap());
    }

    #[test]
    fn unlimited_dataset_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unlimited.fpc");
        let mut file = ContainerFile::create(&path, 0, 1, 1).unwrap();
        file.create_dataset(&image_def("data", 0), -1, -1).unwrap();
        file.write_chunk("data", 100, 1, 0, &[7; 32]).unwrap();
        assert_eq!(file.dataset_frames("data").unwrap(), 101);
        assert_eq!(file.dataset_max_size("data").unwrap(), 0);
    }

    #[test]
    fn chunk_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invalid.fpc");
        let mut file = ContainerFile::create(&path, 0, 1, 1).unwrap();

        let mut bad_rank = image_def("a", 0);
        bad_rank.chunk_dimensions = vec![4, 4];
        assert!(file.create_dataset(&bad_rank, -1, -1).is_err());

        let mut zero_dim = image_def("b", 0);
        zero_dim.frame_dimensions = vec![0, 4];
        assert!(file.create_dataset(&zero_dim, -1, -1).is_err());

        // Outer chunk dimension is clamped to a bounded extent
        let mut fold = image_def("c", 2);
        fold.chunk_dimensions = vec![10, 4, 4];
        file.create_dataset(&fold, -1, -1).unwrap();
    }

    #[test]
    fn attributes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attrs.fpc");
        {
            let mut file = ContainerFile::create(&path, 0, 1, 1).unwrap();
            let mut def = image_def("data", 1000);
            def.create_low_high_indexes = true;
            file.create_dataset(&def, 1001, 2000).unwrap();
            file.close().unwrap();
        }
        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.image_nr_attributes("data"), Some((1001, 2000)));
    }

    #[test]
    fn parameters_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.fpc");
        {
            let mut file = ContainerFile::create(&path, 0, 1, 1).unwrap();
            let def = DatasetDefinition {
                name: "uid".to_string(),
                data_type: DataType::U64,
                frame_dimensions: vec![],
                chunk_dimensions: vec![1],
                num_frames: 0,
                ..DatasetDefinition::default()
            };
            file.create_dataset(&def, -1, -1).unwrap();
            file.write_parameter("uid", 0, &42u64.to_ne_bytes()).unwrap();
            file.write_parameter("uid", 5, &99u64.to_ne_bytes()).unwrap();
            file.close().unwrap();
        }
        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.parameter("uid", 0).unwrap(), 42u64.to_ne_bytes());
        assert_eq!(reader.parameter("uid", 5).unwrap(), 99u64.to_ne_bytes());
        assert!(reader.parameter("uid", 3).is_none());
    }

    #[test]
    fn alignment_pads_large_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.fpc");
        let payload = vec![1u8; 5000];
        {
            let mut file = ContainerFile::create(&path, 0, 4096, 4096).unwrap();
            file.create_dataset(&image_def("data", 0), -1, -1).unwrap();
            file.write_chunk("data", 0, 1, 0, &payload).unwrap();
            file.close().unwrap();
        }
        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.read_frame("data", 0).unwrap(), payload);
    }

    #[test]
    fn closed_file_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.fpc");
        let mut file = ContainerFile::create(&path, 0, 1, 1).unwrap();
        file.create_dataset(&image_def("data", 0), -1, -1).unwrap();
        file.close().unwrap();
        assert!(file.write_chunk("data", 0, 1, 0, &[0; 32]).is_err());
    }
}
