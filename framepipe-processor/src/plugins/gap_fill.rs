// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gap-fill plugin: re-grids a detector image composed of chips into a
//! larger frame with inter-chip gaps filled with zeros, one row copy per
//! chip row.

use crate::frame::Frame;
use crate::metadata::FrameMetaData;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use crate::pool::DataBlockPools;
use framepipe_common::error::ConfigError;
use framepipe_ipc::IpcMessage;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, trace};

pub const CONFIG_GRID_SIZE: &str = "grid_size";
pub const CONFIG_CHIP_SIZE: &str = "chip_size";
pub const CONFIG_GRID_X_GAPS: &str = "x_gaps";
pub const CONFIG_GRID_Y_GAPS: &str = "y_gaps";

pub struct GapFillPlugin {
    pools: DataBlockPools,
    grid: Vec<usize>,
    chip: Vec<usize>,
    gaps_x: Vec<usize>,
    gaps_y: Vec<usize>,
}

impl GapFillPlugin {
    pub fn new(pools: DataBlockPools) -> GapFillPlugin {
        GapFillPlugin {
            pools,
            grid: Vec::new(),
            chip: Vec::new(),
            gaps_x: Vec::new(),
            gaps_y: Vec::new(),
        }
    }

    /// Check the grid, chip and gap configuration against the incoming
    /// frame's dimensions.
    fn configuration_valid(&self, frame: &Frame, ctx: &PluginContext<'_>) -> bool {
        if self.grid.len() != 2 || self.chip.len() != 2 {
            ctx.set_error("gap fill - grid and chip sizes must both be configured");
            return false;
        }
        let dims = &frame.meta_data().dimensions;
        if dims.len() != 2 {
            ctx.set_error("gap fill - frames must be two dimensional");
            return false;
        }
        if dims[0] as usize != self.grid[0] * self.chip[0] {
            ctx.set_error(format!(
                "gap fill - inconsistent frame dimension[0] => {} compared with \
                 (grid[0] x chip[0]) => {}",
                dims[0],
                self.grid[0] * self.chip[0]
            ));
            return false;
        }
        if dims[1] as usize != self.grid[1] * self.chip[1] {
            ctx.set_error(format!(
                "gap fill - inconsistent frame dimension[1] => {} compared with \
                 (grid[1] x chip[1]) => {}",
                dims[1],
                self.grid[1] * self.chip[1]
            ));
            return false;
        }
        if self.gaps_x.len() != self.grid[1] + 1 {
            ctx.set_error(format!(
                "gap fill - grid size [1] => {} requires {} x gap values, {} specified",
                self.grid[1],
                self.grid[1] + 1,
                self.gaps_x.len()
            ));
            return false;
        }
        if self.gaps_y.len() != self.grid[0] + 1 {
            ctx.set_error(format!(
                "gap fill - grid size [0] => {} requires {} y gap values, {} specified",
                self.grid[0],
                self.grid[0] + 1,
                self.gaps_y.len()
            ));
            return false;
        }
        true
    }

    /// Copy each chip row into its gapped destination offset; untouched
    /// destination pixels stay zero.
    fn insert_gaps(&self, frame: &Frame) -> Frame {
        let dims = &frame.meta_data().dimensions;
        let element_size = frame.meta_data().data_type.size();

        let img_x: usize =
            self.grid[1] * self.chip[1] + self.gaps_x.iter().sum::<usize>();
        let img_y: usize =
            self.grid[0] * self.chip[0] + self.gaps_y.iter().sum::<usize>();
        trace!("gapped image size: {img_y} x {img_x}");

        let mut gapped = vec![0u8; img_x * img_y * element_size];
        let source = frame.image();

        let mut current_offset_y = 0;
        for y_index in 0..self.grid[0] {
            current_offset_y += self.gaps_y[y_index];
            for y_row in 0..self.chip[0] {
                let current_src_row = y_index * self.chip[0] + y_row;
                let current_dest_row = current_src_row + current_offset_y;
                let mut current_offset_x = 0;
                for x_index in 0..self.grid[1] {
                    current_offset_x += self.gaps_x[x_index];

                    let src_offset =
                        (current_src_row * dims[1] as usize + x_index * self.chip[1])
                            * element_size;
                    let dest_offset = (current_dest_row * img_x
                        + current_offset_x
                        + x_index * self.chip[1])
                        * element_size;
                    let row_bytes = self.chip[1] * element_size;
                    gapped[dest_offset..dest_offset + row_bytes]
                        .copy_from_slice(&source[src_offset..src_offset + row_bytes]);
                }
            }
        }

        let mut meta = frame.meta_data().clone();
        meta.dimensions = vec![img_y as u64, img_x as u64];
        let block = self.pools.take(gapped.len());
        Frame::from_data_block(frame.frame_number(), meta, block, &gapped)
    }
}

impl FrameProcessorPlugin for GapFillPlugin {
    fn process_frame(&mut self, frame: Arc<Frame>, ctx: &PluginContext<'_>) {
        trace!("gap fill processing frame {}", frame.frame_number());
        if self.configuration_valid(&frame, ctx) {
            let gapped = self.insert_gaps(&frame);
            if let Err(e) = ctx.push(Arc::new(gapped)) {
                ctx.set_error(e.to_string());
            }
        }
    }

    fn configure(
        &mut self,
        config: &IpcMessage,
        _reply: &mut IpcMessage,
        _ctx: &PluginContext<'_>,
    ) -> Result<(), ConfigError> {
        if let Some(grid) = config.get_param(CONFIG_GRID_SIZE) {
            self.grid = parse_usize_list(grid, CONFIG_GRID_SIZE)?;
            debug!("grid size set to {:?}", self.grid);
        }
        if let Some(chip) = config.get_param(CONFIG_CHIP_SIZE) {
            self.chip = parse_usize_list(chip, CONFIG_CHIP_SIZE)?;
            debug!("chip size set to {:?}", self.chip);
        }
        if let Some(gaps) = config.get_param(CONFIG_GRID_X_GAPS) {
            self.gaps_x = parse_usize_list(gaps, CONFIG_GRID_X_GAPS)?;
            debug!("x gaps set to {:?}", self.gaps_x);
        }
        if let Some(gaps) = config.get_param(CONFIG_GRID_Y_GAPS) {
            self.gaps_y = parse_usize_list(gaps, CONFIG_GRID_Y_GAPS)?;
            debug!("y gaps set to {:?}", self.gaps_y);
        }
        Ok(())
    }

    fn request_configuration(&self, reply: &mut IpcMessage) {
        reply.set_param(CONFIG_GRID_SIZE, json!(self.grid));
        reply.set_param(CONFIG_CHIP_SIZE, json!(self.chip));
        reply.set_param(CONFIG_GRID_X_GAPS, json!(self.gaps_x));
        reply.set_param(CONFIG_GRID_Y_GAPS, json!(self.gaps_y));
    }
}

fn parse_usize_list(value: &serde_json::Value, name: &str) -> Result<Vec<usize>, ConfigError> {
    value
        .as_array()
        .ok_or_else(|| ConfigError::new(format!("{name} must be an array")))?
        .iter()
        .map(|v| {
            v.as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| ConfigError::new(format!("{name} entries must be unsigned")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaPublisher;
    use crate::plugin::PluginHandle;
    use framepipe_common::{CompressionType, DataType};
    use framepipe_ipc::{MsgType, MsgVal};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct CapturePlugin {
        captured: Arc<Mutex<Vec<Arc<Frame>>>>,
    }

    impl FrameProcessorPlugin for CapturePlugin {
        fn process_frame(&mut self, frame: Arc<Frame>, _ctx: &PluginContext<'_>) {
            self.captured.lock().unwrap().push(frame);
        }
    }

    fn u16_frame(pools: &DataBlockPools, rows: u64, cols: u64, values: &[u16]) -> Arc<Frame> {
        let meta = FrameMetaData::new(
            "data",
            DataType::U16,
            "acq",
            vec![rows, cols],
            CompressionType::None,
        );
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Arc::new(Frame::from_data_block(
            0,
            meta,
            pools.take(bytes.len()),
            &bytes,
        ))
    }

    #[test]
    fn fills_gaps_with_zeroed_grid() {
        let pools = DataBlockPools::default();
        let (meta, _rx) = MetaPublisher::new();
        let gap_fill = PluginHandle::new(
            "gap_fill",
            Box::new(GapFillPlugin::new(pools.clone())),
            meta.clone(),
        );
        let captured = Arc::new(Mutex::new(Vec::new()));
        let capture = PluginHandle::new(
            "capture",
            Box::new(CapturePlugin {
                captured: captured.clone(),
            }),
            meta,
        );
        gap_fill.register_callback("capture", capture, true);

        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param(CONFIG_GRID_SIZE, json!([3, 4]));
        config.set_param(CONFIG_CHIP_SIZE, json!([1, 1]));
        config.set_param(CONFIG_GRID_X_GAPS, json!([1, 2, 3, 2, 1]));
        config.set_param(CONFIG_GRID_Y_GAPS, json!([1, 2, 2, 1]));
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        gap_fill.configure(&config, &mut reply).unwrap();

        let input: Vec<u16> = (1..=12).collect();
        gap_fill.callback(u16_frame(&pools, 3, 4, &input));

        let frames = captured.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let output = &frames[0];
        assert_eq!(output.meta_data().dimensions, vec![9, 13]);

        let bytes = output.image();
        let pixel = |row: usize, col: usize| -> u16 {
            let index = (row * 13 + col) * 2;
            u16::from_ne_bytes([bytes[index], bytes[index + 1]])
        };

        // Chip rows land at rows 1, 4, 7 and columns 1, 4, 8, 11
        let dest_rows = [1, 4, 7];
        let dest_cols = [1, 4, 8, 11];
        for (r, &dest_row) in dest_rows.iter().enumerate() {
            for (c, &dest_col) in dest_cols.iter().enumerate() {
                assert_eq!(
                    pixel(dest_row, dest_col),
                    input[r * 4 + c],
                    "input pixel ({r},{c}) misplaced"
                );
            }
        }

        // Everything else is gap fill
        let mut non_zero = 0;
        for row in 0..9 {
            for col in 0..13 {
                if pixel(row, col) != 0 {
                    non_zero += 1;
                    assert!(dest_rows.contains(&row) && dest_cols.contains(&col));
                }
            }
        }
        assert_eq!(non_zero, 12);
    }

    #[test]
    fn mismatched_dimensions_set_error() {
        let pools = DataBlockPools::default();
        let (meta, _rx) = MetaPublisher::new();
        let gap_fill = PluginHandle::new(
            "gap_fill",
            Box::new(GapFillPlugin::new(pools.clone())),
            meta,
        );
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param(CONFIG_GRID_SIZE, json!([2, 2]));
        config.set_param(CONFIG_CHIP_SIZE, json!([2, 2]));
        config.set_param(CONFIG_GRID_X_GAPS, json!([1, 1, 1]));
        config.set_param(CONFIG_GRID_Y_GAPS, json!([1, 1, 1]));
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        gap_fill.configure(&config, &mut reply).unwrap();

        // 3x4 frame against a 4x4 grid x chip
        let input: Vec<u16> = (0..12).collect();
        gap_fill.callback(u16_frame(&pools, 3, 4, &input));
        assert!(!gap_fill.errors().is_empty());
    }

    #[test]
    fn sentinel_passes_through_untouched() {
        let pools = DataBlockPools::default();
        let (meta, _rx) = MetaPublisher::new();
        let gap_fill = PluginHandle::new(
            "gap_fill",
            Box::new(GapFillPlugin::new(pools)),
            meta.clone(),
        );
        let forwarded = Arc::new(AtomicUsize::new(0));
        let count = forwarded.clone();
        gap_fill.register_listener(
            "tail",
            Arc::new(move |frame| {
                if frame.end_of_acquisition_flag() {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        gap_fill.start();
        gap_fill.queue().add(Arc::new(Frame::end_of_acquisition()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while forwarded.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
        gap_fill.stop();
    }
}
