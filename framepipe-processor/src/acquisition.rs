// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Acquisition engine: maps each frame's logical offset to a
//! (file index, in-file offset) pair that is unique across the cooperating
//! processor ranks, and drives creation, extension and closure of the
//! container files along the way.

use crate::container::{ContainerFile, DatasetDefinition};
use crate::frame::Frame;
use crate::meta::MetaPublisher;
use crate::plugin::CallDuration;
use crate::watchdog::WatchdogTimer;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const META_NAME: &str = "acquisition";
const META_WRITE_ITEM: &str = "writeframe";
const META_CREATE_ITEM: &str = "createfile";
const META_CLOSE_ITEM: &str = "closefile";
const META_START_ITEM: &str = "startacquisition";
const META_STOP_ITEM: &str = "stopacquisition";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessFrameStatus {
    Ok,
    Complete,
    CompleteMissingFrames,
    Invalid,
}

/// Per-call watchdog thresholds for the container layer, in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogTimeouts {
    pub create_ms: u64,
    pub write_ms: u64,
    pub flush_ms: u64,
    pub close_ms: u64,
}

impl Default for WatchdogTimeouts {
    fn default() -> Self {
        WatchdogTimeouts {
            create_ms: 2000,
            write_ms: 1000,
            flush_ms: 1000,
            close_ms: 2000,
        }
    }
}

/// Duration aggregates for each watched container call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCallDurations {
    pub create: CallDuration,
    pub write: CallDuration,
    pub flush: CallDuration,
    pub close: CallDuration,
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// The frame's offset adjustment produced a negative logical offset.
    #[error("frame offset causes negative file offset (frame {frame}, adjustment {adjustment})")]
    OffsetOutOfRange { frame: u64, adjustment: i64 },
    /// The frame's logical offset is owned by a different rank.
    #[error("unexpected frame: {frame} in this process rank: {rank}")]
    WrongRank { frame: u64, rank: u64 },
}

pub struct Acquisition {
    meta: MetaPublisher,
    pub acquisition_id: String,
    pub file_path: PathBuf,
    pub configured_filename: String,
    pub file_extension: String,
    pub master_frame: String,
    pub frames_to_write: u64,
    pub total_frames: u64,
    pub frames_per_block: u64,
    pub blocks_per_file: u64,
    pub concurrent_rank: u64,
    pub concurrent_processes: u64,
    pub alignment_threshold: u64,
    pub alignment_value: u64,
    pub dataset_defs: HashMap<String, DatasetDefinition>,
    pub watchdog: Option<Arc<WatchdogTimer>>,
    pub timeouts: WatchdogTimeouts,
    durations: FileCallDurations,
    filename: String,
    frames_processed: u64,
    frames_written: u64,
    current_file: Option<ContainerFile>,
    previous_file: Option<ContainerFile>,
    last_error: String,
}

impl Acquisition {
    pub fn new(meta: MetaPublisher) -> Acquisition {
        Acquisition {
            meta,
            acquisition_id: String::new(),
            file_path: PathBuf::from("."),
            configured_filename: String::new(),
            file_extension: String::new(),
            master_frame: String::new(),
            frames_to_write: 0,
            total_frames: 0,
            frames_per_block: 1,
            blocks_per_file: 0,
            concurrent_rank: 0,
            concurrent_processes: 1,
            alignment_threshold: 1,
            alignment_value: 1,
            dataset_defs: HashMap::new(),
            watchdog: None,
            timeouts: WatchdogTimeouts::default(),
            durations: FileCallDurations::default(),
            filename: String::new(),
            frames_processed: 0,
            frames_written: 0,
            current_file: None,
            previous_file: None,
            last_error: String::new(),
        }
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn call_durations(&self) -> FileCallDurations {
        self.durations
    }

    fn start_watch(&self, function_name: &str, timeout_ms: u64) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.start_timer(function_name, timeout_ms);
        }
    }

    fn finish_watch(&self) -> u64 {
        match &self.watchdog {
            Some(watchdog) => watchdog.finish_timer(),
            None => 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current_file.is_some()
    }

    /// Start this acquisition: generate the first filename, publish the
    /// start event and create the first file in the series.
    pub fn start(&mut self) -> Result<(), String> {
        // The extension carries its dot if non-empty
        if !self.file_extension.is_empty() && !self.file_extension.starts_with('.') {
            self.file_extension.insert(0, '.');
        }
        self.frames_processed = 0;
        self.frames_written = 0;

        self.filename = self.generate_filename(self.concurrent_rank);
        if self.filename.is_empty() {
            self.last_error = "unable to start writing - no filename to write to".to_string();
            error!("{}", self.last_error);
            return Err(self.last_error.clone());
        }

        self.meta.publish_string(
            META_NAME,
            META_START_ITEM,
            "",
            &self.create_meta_header(),
        );
        self.create_file(self.concurrent_rank as usize)
            .map_err(|e| {
                self.last_error = e.clone();
                e
            })?;
        Ok(())
    }

    /// Stop this acquisition, closing off any open files.
    pub fn stop(&mut self) {
        let previous = self.previous_file.take();
        self.close_file(previous);
        let current = self.current_file.take();
        self.close_file(current);
        self.meta
            .publish_string(META_NAME, META_STOP_ITEM, "", &self.meta_header());
    }

    /// Combine the frame number with the frame's offset adjustment.
    pub fn adjust_frame_offset(&self, frame: &Frame) -> Result<u64, AcquisitionError> {
        let frame_number = frame.frame_number();
        let adjustment = frame.meta_data().frame_offset;
        let adjusted = frame_number as i64 + adjustment;
        trace!("raw frame number: {frame_number}, frame offset adjustment: {adjustment}");
        if adjusted < 0 {
            return Err(AcquisitionError::OffsetOutOfRange {
                frame: frame_number,
                adjustment,
            });
        }
        Ok(adjusted as u64)
    }

    /// File index owning a logical offset, for a block-striped series.
    /// Without a fold (`blocks_per_file = 0`) every offset stays in the
    /// rank's single file.
    pub fn get_file_index(&self, frame_offset: u64) -> u64 {
        if self.blocks_per_file == 0 {
            return self.concurrent_rank;
        }
        let block_number = frame_offset / self.frames_per_block;
        let block_row = block_number / self.concurrent_processes;
        let file_row = block_row / self.blocks_per_file;
        file_row * self.concurrent_processes + self.concurrent_rank
    }

    /// Offset of a logical frame within the file it lands in.
    pub fn get_frame_offset_in_file(&self, frame_offset: u64) -> u64 {
        let block_index = frame_offset / (self.frames_per_block * self.concurrent_processes);
        let mut first_frame_offset_of_block = block_index * self.frames_per_block;
        if self.blocks_per_file != 0 {
            first_frame_offset_of_block %=
                self.blocks_per_file * self.frames_per_block;
        }
        let offset_within_block = frame_offset % self.frames_per_block;
        first_frame_offset_of_block + offset_within_block
    }

    /// Process one frame: validate, locate its file and offset, write image
    /// and parameter data and update the frame counters.
    pub fn process_frame(&mut self, frame: &Frame) -> ProcessFrameStatus {
        if !self.check_frame_valid(frame) {
            return ProcessFrameStatus::Invalid;
        }
        let frame_dataset_name = frame.meta_data().dataset_name.clone();
        let frame_number = frame.frame_number();

        let frame_offset = match self.adjust_frame_offset(frame) {
            Ok(offset) => offset,
            Err(e) => {
                self.last_error = e.to_string();
                error!("{}", self.last_error);
                return ProcessFrameStatus::Invalid;
            }
        };

        if self.concurrent_processes > 1 {
            // Check whether this frame should really be in this process
            let owner = (frame_offset / self.frames_per_block) % self.concurrent_processes;
            if owner != self.concurrent_rank {
                let e = AcquisitionError::WrongRank {
                    frame: frame_number,
                    rank: self.concurrent_rank,
                };
                self.last_error = e.to_string();
                error!("{}", self.last_error);
                return ProcessFrameStatus::Invalid;
            }
        }

        if let Err(e) = self.ensure_file_for(frame_offset) {
            self.last_error = e;
            error!("{}", self.last_error);
            return ProcessFrameStatus::Invalid;
        }

        let frame_offset_in_file = self.get_frame_offset_in_file(frame_offset);
        let outer_chunk_dimension = self
            .dataset_defs
            .get(&frame_dataset_name)
            .map(|def| def.chunk_dimensions.first().copied().unwrap_or(1))
            .unwrap_or(1);

        let use_previous = self.frame_belongs_to_previous(frame_offset);
        let taken = if use_previous {
            self.previous_file.take()
        } else {
            self.current_file.take()
        };
        let Some(mut file) = taken else {
            self.last_error = "unable to get file for this frame".to_string();
            error!("{}", self.last_error);
            return ProcessFrameStatus::Invalid;
        };

        let write_result = self.write_frame_to_file(
            &mut file,
            frame,
            &frame_dataset_name,
            frame_offset_in_file,
            outer_chunk_dimension,
        );
        if use_previous {
            self.previous_file = Some(file);
        } else {
            self.current_file = Some(file);
        }
        if let Err(e) = write_result {
            self.last_error = e;
            error!("{}", self.last_error);
            return ProcessFrameStatus::Invalid;
        }

        let write_event = json!({
            "frame": frame_number,
            "offset": frame_offset,
            "rank": self.concurrent_rank,
            "proc": self.concurrent_processes,
        });
        self.meta.publish_string(
            META_NAME,
            META_WRITE_ITEM,
            &write_event.to_string(),
            &self.meta_header(),
        );

        // A master dataset, when set, gates the frame counters; otherwise
        // every frame advances them.
        if self.master_frame.is_empty() || self.master_frame == frame_dataset_name {
            self.frames_processed += 1;
            let file = if use_previous {
                self.previous_file.as_ref()
            } else {
                self.current_file.as_ref()
            };
            if let Some(file) = file {
                let dataset_frames = file
                    .dataset_frames(&frame_dataset_name)
                    .unwrap_or(0)
                    / outer_chunk_dimension.max(1);
                let current_file_index =
                    file.file_index() as u64 / self.concurrent_processes;
                let frames_written_to_previous_files =
                    current_file_index * self.frames_per_block * self.blocks_per_file;
                let total_frames_written = frames_written_to_previous_files + dataset_frames;
                if total_frames_written > self.frames_written {
                    self.frames_written = total_frames_written;
                } else if total_frames_written == self.frames_written {
                    trace!("frame rewritten");
                }
            }
        } else {
            trace!("non-master frame processed");
        }

        if self.frames_to_write > 0 && self.frames_written == self.frames_to_write {
            if self.frames_processed >= self.frames_to_write {
                return ProcessFrameStatus::Complete;
            }
            info!(
                "number of frames processed ({}) doesn't match expected ({})",
                self.frames_processed, self.frames_to_write
            );
            return ProcessFrameStatus::CompleteMissingFrames;
        }
        ProcessFrameStatus::Ok
    }

    /// Write image and parameter data, each container call wrapped by the
    /// watchdog and recorded in the per-call duration aggregates.
    fn write_frame_to_file(
        &mut self,
        file: &mut ContainerFile,
        frame: &Frame,
        dataset_name: &str,
        frame_offset_in_file: u64,
        outer_chunk_dimension: u64,
    ) -> Result<(), String> {
        let element_offset = frame_offset_in_file * outer_chunk_dimension;
        trace!(
            "writing frame offset={} ({frame_offset_in_file}) dset={dataset_name}",
            frame.frame_number()
        );

        self.start_watch("write_chunk", self.timeouts.write_ms);
        let write_result = file.write_chunk(
            dataset_name,
            element_offset,
            frame.outer_chunk_size().max(1),
            0,
            frame.image(),
        );
        let write_us = self.finish_watch();
        self.durations.write.update(write_us);
        write_result.map_err(|e| e.to_string())?;

        self.start_watch("flush_dataset", self.timeouts.flush_ms);
        let flush_result = file.flush_dataset(dataset_name);
        let flush_us = self.finish_watch();
        self.durations.flush.update(flush_us);
        flush_result.map_err(|e| e.to_string())?;

        // Companion parameter datasets for any matching frame parameter
        for (param_name, value) in &frame.meta_data().parameters {
            if self.dataset_defs.contains_key(param_name) {
                self.start_watch("write_parameter", self.timeouts.write_ms);
                let param_result =
                    file.write_parameter(param_name, frame_offset_in_file, &value.to_bytes());
                let param_us = self.finish_watch();
                self.durations.write.update(param_us);
                param_result.map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    fn frame_belongs_to_previous(&self, frame_offset: u64) -> bool {
        if self.blocks_per_file == 0 {
            return false;
        }
        let file_index = self.get_file_index(frame_offset);
        self.previous_file
            .as_ref()
            .is_some_and(|f| f.file_index() as u64 == file_index)
    }

    /// Make sure the file owning this offset is open, creating intermediate
    /// files for any skipped indices so gaps materialise as blank chunks.
    fn ensure_file_for(&mut self, frame_offset: u64) -> Result<(), String> {
        if self.blocks_per_file == 0 {
            return if self.current_file.is_some() {
                Ok(())
            } else {
                Err("no file open for this acquisition".to_string())
            };
        }
        let file_index = self.get_file_index(frame_offset);
        let current_index = match &self.current_file {
            Some(file) => file.file_index() as u64,
            None => return Err("no file open for this acquisition".to_string()),
        };
        if file_index == current_index || self.frame_belongs_to_previous(frame_offset) {
            return Ok(());
        }
        if file_index > current_index {
            trace!(
                "creating new file as frame {frame_offset} won't go into file index \
                 {current_index} as it requires {file_index}"
            );
            // Create any files that were skipped entirely
            let mut next_expected = current_index + self.concurrent_processes;
            while next_expected < file_index {
                debug!("creating missing file {next_expected}");
                self.filename = self.generate_filename(next_expected);
                self.create_file(next_expected as usize)?;
                next_expected += self.concurrent_processes;
            }
            self.filename = self.generate_filename(file_index);
            self.create_file(file_index as usize)?;
            Ok(())
        } else {
            warn!("unable to write frame offset {frame_offset} as no suitable file found");
            Err(format!(
                "no open file for frame offset {frame_offset} (file index {file_index})"
            ))
        }
    }

    /// Create the file with the given number, rolling current to previous
    /// and closing the file rolled off the pair.
    fn create_file(&mut self, file_number: usize) -> Result<(), String> {
        let rolled_off = self.previous_file.take();
        self.close_file(rolled_off);
        self.previous_file = self.current_file.take();

        let full_path = self.file_path.join(&self.filename);
        self.start_watch("create_file", self.timeouts.create_ms);
        let create_result = ContainerFile::create(
            &full_path,
            file_number,
            self.alignment_threshold,
            self.alignment_value,
        );
        let create_us = self.finish_watch();
        self.durations.create.update(create_us);
        let mut file = create_result.map_err(|e| e.to_string())?;

        self.meta.publish_string(
            META_NAME,
            META_CREATE_ITEM,
            &full_path.display().to_string(),
            &self.create_meta_header(),
        );

        for def in self.dataset_defs.values() {
            let mut def = def.clone();
            def.num_frames = self.frames_to_write;

            // Low and high frame indexes let out-of-band indexing tools
            // page block-striped files
            let mut low_index: i64 = -1;
            let mut high_index: i64 = -1;
            if def.create_low_high_indexes && self.frames_per_block > 1 {
                low_index = (file_number as u64 * self.frames_per_block + 1) as i64;
                high_index = low_index + self.frames_per_block as i64 - 1;
                if self.blocks_per_file == 0 || high_index > self.total_frames as i64 {
                    high_index = self.total_frames as i64;
                }
            }

            validate_dataset_definition(&def)?;
            file.create_dataset(&def, low_index as i32, high_index as i32)
                .map_err(|e| e.to_string())?;
        }

        self.current_file = Some(file);
        Ok(())
    }

    fn close_file(&mut self, file: Option<ContainerFile>) {
        if let Some(mut file) = file {
            let filename = file.filename();
            info!("closing file {filename}");
            self.start_watch("close_file", self.timeouts.close_ms);
            let close_result = file.close();
            let close_us = self.finish_watch();
            self.durations.close.update(close_us);
            if let Err(e) = close_result {
                error!("error closing {filename}: {e}");
            }
            self.meta
                .publish_string(META_NAME, META_CLOSE_ITEM, &filename, &self.meta_header());
        }
    }

    /// Check an incoming frame against its target dataset definition.
    fn check_frame_valid(&mut self, frame: &Frame) -> bool {
        let meta = frame.meta_data();
        let Some(dataset) = self.dataset_defs.get(&meta.dataset_name) else {
            self.last_error = format!(
                "invalid frame: no dataset definition for \"{}\"",
                meta.dataset_name
            );
            error!("{}", self.last_error);
            return false;
        };
        let mut invalid = false;
        if meta.compression != dataset.compression {
            self.last_error = format!(
                "invalid frame: frame has compression {}, expected {} for dataset {}",
                meta.compression, dataset.compression, dataset.name
            );
            error!("{}", self.last_error);
            invalid = true;
        }
        if meta.data_type != dataset.data_type {
            self.last_error = format!(
                "invalid frame: frame has data type {}, expected {} for dataset {}",
                meta.data_type, dataset.data_type, dataset.name
            );
            error!("{}", self.last_error);
            invalid = true;
        }
        if meta.dimensions != dataset.frame_dimensions {
            self.last_error = format!(
                "invalid frame: frame has dimensions {:?}, expected {:?} for dataset {}",
                meta.dimensions, dataset.frame_dimensions, dataset.name
            );
            error!("{}", self.last_error);
            invalid = true;
        }
        !invalid
    }

    /// Filename for a file number: a 6 digit, 1-indexed suffix on the
    /// configured stem, falling back to the acquisition id.
    pub fn generate_filename(&self, file_number: u64) -> String {
        let stem = if !self.configured_filename.is_empty() {
            &self.configured_filename
        } else if !self.acquisition_id.is_empty() {
            &self.acquisition_id
        } else {
            return String::new();
        };
        format!("{stem}_{:06}{}", file_number + 1, self.file_extension)
    }

    fn create_meta_header(&self) -> String {
        json!({
            "acqID": self.acquisition_id,
            "totalFrames": self.total_frames,
        })
        .to_string()
    }

    fn meta_header(&self) -> String {
        json!({ "acqID": self.acquisition_id }).to_string()
    }
}

fn validate_dataset_definition(definition: &DatasetDefinition) -> Result<(), String> {
    if definition.frame_dimensions.iter().any(|&d| d == 0) {
        return Err("image dimensions must be non-zero".to_string());
    }
    if definition.chunk_dimensions.iter().any(|&d| d == 0) {
        return Err("chunk dimensions must be non-zero".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FrameMetaData, ParamValue};
    use crate::pool::DataBlockPools;
    use framepipe_common::{CompressionType, DataType};

    fn image_def(name: &str) -> DatasetDefinition {
        DatasetDefinition {
            name: name.to_string(),
            data_type: DataType::U16,
            frame_dimensions: vec![4, 4],
            chunk_dimensions: vec![1, 4, 4],
            ..DatasetDefinition::default()
        }
    }

    fn acquisition() -> Acquisition {
        let (meta, _rx) = MetaPublisher::new();
        Acquisition::new(meta)
    }

    fn frame(pools: &DataBlockPools, number: u64, offset_adjustment: i64) -> Frame {
        let mut meta = FrameMetaData::new(
            "data",
            DataType::U16,
            "test_acq",
            vec![4, 4],
            CompressionType::None,
        );
        meta.frame_offset = offset_adjustment;
        Frame::from_data_block(number, meta, pools.take(32), &[1u8; 32])
    }

    #[test]
    fn file_index_four_ranks() {
        let mut acq = acquisition();
        acq.concurrent_processes = 4;
        acq.frames_per_block = 1000;
        acq.blocks_per_file = 1;

        acq.concurrent_rank = 0;
        assert_eq!(acq.get_file_index(0), 0);
        assert_eq!(acq.get_file_index(999), 0);
        assert_eq!(acq.get_file_index(4000), 4);
        acq.concurrent_rank = 1;
        assert_eq!(acq.get_file_index(1000), 1);
        acq.concurrent_rank = 2;
        assert_eq!(acq.get_file_index(2311), 2);
        acq.concurrent_rank = 3;
        assert_eq!(acq.get_file_index(7452), 7);
    }

    #[test]
    fn offset_in_file_four_ranks() {
        let mut acq = acquisition();
        acq.concurrent_processes = 4;
        acq.frames_per_block = 1000;
        acq.blocks_per_file = 1;

        assert_eq!(acq.get_frame_offset_in_file(0), 0);
        assert_eq!(acq.get_frame_offset_in_file(999), 999);
        assert_eq!(acq.get_frame_offset_in_file(4000), 0);
        assert_eq!(acq.get_frame_offset_in_file(1000), 0);
        assert_eq!(acq.get_frame_offset_in_file(2311), 311);
        assert_eq!(acq.get_frame_offset_in_file(7452), 452);
    }

    #[test]
    fn file_index_single_rank_folded() {
        let mut acq = acquisition();
        acq.concurrent_processes = 1;
        acq.frames_per_block = 3;
        acq.blocks_per_file = 5;

        assert_eq!(acq.get_file_index(14), 0);
        assert_eq!(acq.get_frame_offset_in_file(14), 14);
        assert_eq!(acq.get_file_index(15), 1);
        assert_eq!(acq.get_frame_offset_in_file(15), 0);
        assert_eq!(acq.get_file_index(30), 2);
        assert_eq!(acq.get_frame_offset_in_file(30), 0);
    }

    #[test]
    fn negative_adjusted_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pools = DataBlockPools::default();
        let mut acq = acquisition();
        acq.acquisition_id = "test_acq".to_string();
        acq.file_path = dir.path().to_path_buf();
        acq.dataset_defs.insert("data".to_string(), image_def("data"));
        acq.start().unwrap();

        let bad = frame(&pools, 0, -1);
        let status = acq.process_frame(&bad);
        assert_eq!(status, ProcessFrameStatus::Invalid);
        assert_eq!(acq.frames_processed(), 0);
        assert!(acq.last_error().contains("negative file offset"));
    }

    #[test]
    fn wrong_rank_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pools = DataBlockPools::default();
        let mut acq = acquisition();
        acq.acquisition_id = "test_acq".to_string();
        acq.file_path = dir.path().to_path_buf();
        acq.concurrent_processes = 4;
        acq.concurrent_rank = 0;
        acq.frames_per_block = 1000;
        acq.dataset_defs.insert("data".to_string(), image_def("data"));
        acq.start().unwrap();

        // Offset 1000 belongs to rank 1
        let misrouted = frame(&pools, 1000, 0);
        assert_eq!(acq.process_frame(&misrouted), ProcessFrameStatus::Invalid);
        assert_eq!(acq.frames_processed(), 0);
        assert!(acq.last_error().contains("unexpected frame"));
    }

    #[test]
    fn write_series_to_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let pools = DataBlockPools::default();
        let mut acq = acquisition();
        acq.acquisition_id = "series".to_string();
        acq.file_extension = "fpc".to_string();
        acq.file_path = dir.path().to_path_buf();
        acq.frames_to_write = 3;
        acq.total_frames = 3;
        acq.dataset_defs.insert("data".to_string(), image_def("data"));
        acq.start().unwrap();

        assert_eq!(
            acq.process_frame(&frame(&pools, 0, 0)),
            ProcessFrameStatus::Ok
        );
        assert_eq!(
            acq.process_frame(&frame(&pools, 1, 0)),
            ProcessFrameStatus::Ok
        );
        assert_eq!(
            acq.process_frame(&frame(&pools, 2, 0)),
            ProcessFrameStatus::Complete
        );
        assert_eq!(acq.frames_processed(), 3);
        assert_eq!(acq.frames_written(), 3);
        acq.stop();

        // Filenames are 1-indexed with a six digit suffix
        let path = dir.path().join("series_000001.fpc");
        let mut reader = crate::container::ContainerReader::open(&path).unwrap();
        assert_eq!(reader.dataset_frames("data"), 3);
        assert_eq!(reader.read_frame("data", 1).unwrap(), vec![1u8; 32]);
    }

    #[test]
    fn parameter_dataset_companion_write() {
        let dir = tempfile::tempdir().unwrap();
        let pools = DataBlockPools::default();
        let mut acq = acquisition();
        acq.acquisition_id = "params".to_string();
        acq.file_path = dir.path().to_path_buf();
        acq.dataset_defs.insert("data".to_string(), image_def("data"));
        acq.dataset_defs.insert(
            "uid".to_string(),
            DatasetDefinition {
                name: "uid".to_string(),
                data_type: DataType::U64,
                frame_dimensions: vec![],
                chunk_dimensions: vec![1],
                ..DatasetDefinition::default()
            },
        );
        acq.start().unwrap();

        let mut f = frame(&pools, 0, 0);
        f.meta_data_mut().set_parameter("uid", ParamValue::U64(777));
        assert_eq!(acq.process_frame(&f), ProcessFrameStatus::Ok);
        acq.stop();

        let reader =
            crate::container::ContainerReader::open(&dir.path().join("params_000001")).unwrap();
        assert_eq!(reader.parameter("uid", 0).unwrap(), 777u64.to_ne_bytes());
    }

    #[test]
    fn skipped_file_indices_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let pools = DataBlockPools::default();
        let mut acq = acquisition();
        acq.acquisition_id = "gappy".to_string();
        acq.file_path = dir.path().to_path_buf();
        acq.frames_per_block = 1;
        acq.blocks_per_file = 1;
        acq.dataset_defs.insert("data".to_string(), image_def("data"));
        acq.start().unwrap();

        assert_eq!(acq.process_frame(&frame(&pools, 0, 0)), ProcessFrameStatus::Ok);
        // Jump to offset 3: files for indices 1 and 2 must be created blank
        assert_eq!(acq.process_frame(&frame(&pools, 3, 0)), ProcessFrameStatus::Ok);
        acq.stop();

        for suffix in 1..=4 {
            let path = dir.path().join(format!("gappy_{suffix:06}"));
            assert!(path.exists(), "expected file {}", path.display());
        }
        let reader =
            crate::container::ContainerReader::open(&dir.path().join("gappy_000002")).unwrap();
        assert_eq!(reader.dataset_frames("data"), 0, "gap file holds no chunks");
    }

    #[test]
    fn master_dataset_gates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let pools = DataBlockPools::default();
        let mut acq = acquisition();
        acq.acquisition_id = "master".to_string();
        acq.file_path = dir.path().to_path_buf();
        acq.master_frame = "data".to_string();
        acq.dataset_defs.insert("data".to_string(), image_def("data"));
        acq.dataset_defs.insert("monitor".to_string(), image_def("monitor"));
        acq.start().unwrap();

        let mut monitor_meta = FrameMetaData::new(
            "monitor",
            DataType::U16,
            "master",
            vec![4, 4],
            CompressionType::None,
        );
        monitor_meta.frame_offset = 0;
        let monitor_frame =
            Frame::from_data_block(0, monitor_meta, pools.take(32), &[2u8; 32]);

        assert_eq!(acq.process_frame(&monitor_frame), ProcessFrameStatus::Ok);
        assert_eq!(acq.frames_processed(), 0, "non-master frames don't count");

        assert_eq!(acq.process_frame(&frame(&pools, 0, 0)), ProcessFrameStatus::Ok);
        assert_eq!(acq.frames_processed(), 1);
        acq.stop();
    }

    #[test]
    fn filename_generation() {
        let mut acq = acquisition();
        acq.acquisition_id = "scan_42".to_string();
        acq.file_extension = ".h5".to_string();
        assert_eq!(acq.generate_filename(0), "scan_42_000001.h5");
        assert_eq!(acq.generate_filename(41), "scan_42_000042.h5");
        acq.configured_filename = "override".to_string();
        assert_eq!(acq.generate_filename(0), "override_000001.h5");
        acq.configured_filename.clear();
        acq.acquisition_id.clear();
        assert_eq!(acq.generate_filename(0), "");
    }
}
