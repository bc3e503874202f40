// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistence plugin. Terminates the chain (always connected over a
//! blocking edge so file writes see frames in upstream order), drives the
//! acquisition engine and owns the watchdog covering the container calls.

use crate::acquisition::{Acquisition, ProcessFrameStatus};
use crate::container::DatasetDefinition;
use crate::frame::Frame;
use crate::meta::MetaPublisher;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use crate::watchdog::WatchdogTimer;
use framepipe_common::error::ConfigError;
use framepipe_common::{CompressionType, DataType};
use framepipe_ipc::IpcMessage;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const CONFIG_PROCESS_NUMBER: &str = "process/number";
pub const CONFIG_PROCESS_RANK: &str = "process/rank";
pub const CONFIG_PROCESS_BLOCKSIZE: &str = "process/frames_per_block";
pub const CONFIG_PROCESS_BLOCKS_PER_FILE: &str = "process/blocks_per_file";
pub const CONFIG_PROCESS_ALIGNMENT_THRESHOLD: &str = "process/alignment_threshold";
pub const CONFIG_PROCESS_ALIGNMENT_VALUE: &str = "process/alignment_value";
pub const CONFIG_FILE_PATH: &str = "file/path";
pub const CONFIG_FILE_NAME: &str = "file/name";
pub const CONFIG_FILE_EXTENSION: &str = "file/extension";
pub const CONFIG_DATASET: &str = "dataset";
pub const CONFIG_FRAMES: &str = "frames";
pub const CONFIG_ACQUISITION_ID: &str = "acquisition_id";
pub const CONFIG_MASTER_DATASET: &str = "master";
pub const CONFIG_WRITE: &str = "write";

const COMMAND_START_WRITING: &str = "start_writing";
const COMMAND_STOP_WRITING: &str = "stop_writing";

pub struct FileWriterPlugin {
    acquisition: Acquisition,
    writing: bool,
    frames_written_total: u64,
    /// Watchdog expiries land here asynchronously; drained into the plugin
    /// error list on the worker thread.
    async_errors: Arc<Mutex<Vec<String>>>,
    _watchdog: Arc<WatchdogTimer>,
}

impl FileWriterPlugin {
    pub fn new(meta: MetaPublisher) -> FileWriterPlugin {
        let async_errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = async_errors.clone();
        let watchdog = Arc::new(WatchdogTimer::new(Box::new(move |msg| {
            if let Ok(mut errors) = sink.lock() {
                errors.push(msg);
            }
        })));
        let mut acquisition = Acquisition::new(meta);
        acquisition.watchdog = Some(watchdog.clone());
        FileWriterPlugin {
            acquisition,
            writing: false,
            frames_written_total: 0,
            async_errors,
            _watchdog: watchdog,
        }
    }

    fn drain_async_errors(&self, ctx: &PluginContext<'_>) {
        if let Ok(mut errors) = self.async_errors.lock() {
            for error in errors.drain(..) {
                ctx.set_error(error);
            }
        }
    }

    fn start_writing(&mut self) -> Result<(), ConfigError> {
        if self.writing {
            return Ok(());
        }
        self.acquisition.start().map_err(ConfigError::new)?;
        self.writing = true;
        info!("file writing started for acquisition {}", self.acquisition.acquisition_id);
        Ok(())
    }

    fn stop_writing(&mut self) {
        if self.writing {
            self.acquisition.stop();
            self.writing = false;
            info!("file writing stopped");
        }
    }

    fn parse_dataset_definitions(&mut self, datasets: &Value) -> Result<(), ConfigError> {
        let Some(map) = datasets.as_object() else {
            return Err(ConfigError::new("dataset config must be an object"));
        };
        for (name, spec) in map {
            let mut def = DatasetDefinition {
                name: name.clone(),
                ..DatasetDefinition::default()
            };
            if let Some(datatype) = spec.get("datatype").and_then(|v| v.as_str()) {
                def.data_type = DataType::parse(datatype)
                    .ok_or_else(|| ConfigError::new(format!("unknown datatype: {datatype}")))?;
            }
            if let Some(dims) = spec.get("dims").and_then(|v| v.as_array()) {
                def.frame_dimensions = dims
                    .iter()
                    .map(|d| d.as_u64().unwrap_or(0))
                    .collect();
            }
            if let Some(chunks) = spec.get("chunks").and_then(|v| v.as_array()) {
                def.chunk_dimensions = chunks
                    .iter()
                    .map(|d| d.as_u64().unwrap_or(0))
                    .collect();
            } else {
                // Default chunking: one image per chunk
                let mut chunks = vec![1];
                chunks.extend_from_slice(&def.frame_dimensions);
                def.chunk_dimensions = chunks;
            }
            if let Some(compression) = spec.get("compression").and_then(|v| v.as_str()) {
                def.compression = CompressionType::parse(compression).ok_or_else(|| {
                    ConfigError::new(format!("unknown compression: {compression}"))
                })?;
            }
            if let Some(level) = spec.get("blosc_level").and_then(|v| v.as_u64()) {
                def.blosc_level = level as u32;
            }
            if let Some(shuffle) = spec.get("blosc_shuffle").and_then(|v| v.as_u64()) {
                def.blosc_shuffle = shuffle as u32;
            }
            if let Some(compressor) = spec.get("blosc_compressor").and_then(|v| v.as_u64()) {
                def.blosc_compressor = compressor as u32;
            }
            if let Some(indexes) = spec.get("indexes").and_then(|v| v.as_bool()) {
                def.create_low_high_indexes = indexes;
            }
            debug!("dataset definition added: {name}");
            self.acquisition.dataset_defs.insert(name.clone(), def);
        }
        Ok(())
    }
}

impl FrameProcessorPlugin for FileWriterPlugin {
    fn process_frame(&mut self, frame: Arc<Frame>, ctx: &PluginContext<'_>) {
        self.drain_async_errors(ctx);
        if !self.writing {
            debug!("dropping frame {} as writing is not enabled", frame.frame_number());
            return;
        }

        let status = self.acquisition.process_frame(&frame);
        match status {
            ProcessFrameStatus::Ok => {
                self.frames_written_total += 1;
                let _ = ctx.push(frame);
            }
            ProcessFrameStatus::Complete => {
                self.frames_written_total += 1;
                info!("acquisition complete, stopping file writing");
                self.stop_writing();
                let _ = ctx.push(frame);
            }
            ProcessFrameStatus::CompleteMissingFrames => {
                self.frames_written_total += 1;
                ctx.set_warning("acquisition complete with missing frames");
                self.stop_writing();
                let _ = ctx.push(frame);
            }
            ProcessFrameStatus::Invalid => {
                // The error is recorded and processing continues with
                // subsequent frames; the frame itself is dropped.
                ctx.set_error(self.acquisition.last_error().to_string());
            }
        }
        self.drain_async_errors(ctx);
    }

    fn process_end_of_acquisition(&mut self, ctx: &PluginContext<'_>) {
        debug!("end of acquisition reached, closing files");
        self.stop_writing();
        self.drain_async_errors(ctx);
    }

    fn configure(
        &mut self,
        config: &IpcMessage,
        _reply: &mut IpcMessage,
        _ctx: &PluginContext<'_>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = config.get_param(CONFIG_PROCESS_NUMBER).and_then(|v| v.as_u64()) {
            self.acquisition.concurrent_processes = v.max(1);
        }
        if let Some(v) = config.get_param(CONFIG_PROCESS_RANK).and_then(|v| v.as_u64()) {
            self.acquisition.concurrent_rank = v;
        }
        if let Some(v) = config.get_param(CONFIG_PROCESS_BLOCKSIZE).and_then(|v| v.as_u64()) {
            self.acquisition.frames_per_block = v.max(1);
        }
        if let Some(v) = config
            .get_param(CONFIG_PROCESS_BLOCKS_PER_FILE)
            .and_then(|v| v.as_u64())
        {
            self.acquisition.blocks_per_file = v;
        }
        if let Some(v) = config
            .get_param(CONFIG_PROCESS_ALIGNMENT_THRESHOLD)
            .and_then(|v| v.as_u64())
        {
            self.acquisition.alignment_threshold = v;
        }
        if let Some(v) = config
            .get_param(CONFIG_PROCESS_ALIGNMENT_VALUE)
            .and_then(|v| v.as_u64())
        {
            self.acquisition.alignment_value = v;
        }
        if let Some(v) = config.get_param(CONFIG_FILE_PATH).and_then(|v| v.as_str()) {
            self.acquisition.file_path = v.into();
        }
        if let Some(v) = config.get_param(CONFIG_FILE_NAME).and_then(|v| v.as_str()) {
            self.acquisition.configured_filename = v.to_string();
        }
        if let Some(v) = config.get_param(CONFIG_FILE_EXTENSION).and_then(|v| v.as_str()) {
            self.acquisition.file_extension = v.to_string();
        }
        if let Some(datasets) = config.get_param(CONFIG_DATASET) {
            let datasets = datasets.clone();
            self.parse_dataset_definitions(&datasets)?;
        }
        if let Some(v) = config.get_param(CONFIG_FRAMES).and_then(|v| v.as_u64()) {
            self.acquisition.frames_to_write = v;
            self.acquisition.total_frames = v;
        }
        if let Some(v) = config.get_param(CONFIG_ACQUISITION_ID).and_then(|v| v.as_str()) {
            self.acquisition.acquisition_id = v.to_string();
        }
        if let Some(v) = config.get_param(CONFIG_MASTER_DATASET).and_then(|v| v.as_str()) {
            self.acquisition.master_frame = v.to_string();
        }
        if let Some(write) = config.get_param(CONFIG_WRITE).and_then(|v| v.as_bool()) {
            if write {
                self.start_writing()?;
            } else {
                self.stop_writing();
            }
        }
        Ok(())
    }

    fn request_configuration(&self, reply: &mut IpcMessage) {
        reply.set_param(CONFIG_PROCESS_NUMBER, json!(self.acquisition.concurrent_processes));
        reply.set_param(CONFIG_PROCESS_RANK, json!(self.acquisition.concurrent_rank));
        reply.set_param(CONFIG_PROCESS_BLOCKSIZE, json!(self.acquisition.frames_per_block));
        reply.set_param(
            CONFIG_PROCESS_BLOCKS_PER_FILE,
            json!(self.acquisition.blocks_per_file),
        );
        reply.set_param(
            CONFIG_FILE_PATH,
            json!(self.acquisition.file_path.display().to_string()),
        );
        reply.set_param(CONFIG_FILE_NAME, json!(self.acquisition.configured_filename));
        reply.set_param(CONFIG_FILE_EXTENSION, json!(self.acquisition.file_extension));
        reply.set_param(CONFIG_FRAMES, json!(self.acquisition.frames_to_write));
        reply.set_param(CONFIG_ACQUISITION_ID, json!(self.acquisition.acquisition_id));
        reply.set_param(CONFIG_MASTER_DATASET, json!(self.acquisition.master_frame));
        reply.set_param(CONFIG_WRITE, json!(self.writing));
    }

    fn execute(&mut self, command: &str, _reply: &mut IpcMessage) -> Result<(), ConfigError> {
        match command {
            COMMAND_START_WRITING => self.start_writing(),
            COMMAND_STOP_WRITING => {
                self.stop_writing();
                Ok(())
            }
            other => {
                warn!("submitted command not supported: {other}");
                Err(ConfigError::new(format!(
                    "submitted command not supported: {other}"
                )))
            }
        }
    }

    fn commands(&self) -> Vec<String> {
        vec![
            COMMAND_START_WRITING.to_string(),
            COMMAND_STOP_WRITING.to_string(),
        ]
    }

    fn status(&self, status: &mut IpcMessage) {
        status.set_param("hdf/writing", json!(self.writing));
        status.set_param("hdf/frames_processed", json!(self.acquisition.frames_processed()));
        status.set_param("hdf/frames_written", json!(self.acquisition.frames_written()));
        status.set_param(
            "hdf/frames_written_total",
            json!(self.frames_written_total),
        );
        status.set_param(
            "hdf/acquisition_id",
            json!(self.acquisition.acquisition_id),
        );
        let last_error = self.acquisition.last_error();
        if !last_error.is_empty() {
            status.set_param("hdf/last_error", json!(last_error));
        }
        let durations = self.acquisition.call_durations();
        status.set_param("hdf/timing/write_last", json!(durations.write.last_us));
        status.set_param("hdf/timing/write_max", json!(durations.write.max_us));
        status.set_param("hdf/timing/write_mean", json!(durations.write.mean_us));
        status.set_param("hdf/timing/flush_last", json!(durations.flush.last_us));
        status.set_param("hdf/timing/create_last", json!(durations.create.last_us));
        status.set_param("hdf/timing/close_last", json!(durations.close.last_us));
    }

    fn reset_statistics(&mut self) -> bool {
        self.frames_written_total = 0;
        true
    }
}
