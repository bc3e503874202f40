// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame value types. A frame couples metadata with one of three backing
//! stores: an owned data block from the pool, a borrowed buffer in the
//! shared arena, or nothing at all for the end-of-acquisition sentinel.
//! Wrapper frames republish a view over another frame without copying.

use crate::metadata::FrameMetaData;
use crate::pool::DataBlockHandle;
use crossbeam_channel::Sender;
use framepipe_ipc::SharedBufferManager;
use std::sync::Arc;
use tracing::trace;

/// Notification sent on the release path when the last reference to a
/// shared-buffer frame drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRelease {
    pub frame_number: u64,
    pub buffer_id: usize,
}

/// Borrow of one buffer in the shared arena. Dropping the last clone of the
/// owning frame sends exactly one release notification.
pub struct SharedBufferRef {
    manager: Arc<SharedBufferManager>,
    buffer_id: usize,
    frame_number: u64,
    release: Sender<FrameRelease>,
}

impl SharedBufferRef {
    pub fn new(
        manager: Arc<SharedBufferManager>,
        buffer_id: usize,
        frame_number: u64,
        release: Sender<FrameRelease>,
    ) -> SharedBufferRef {
        SharedBufferRef {
            manager,
            buffer_id,
            frame_number,
            release,
        }
    }

    fn data(&self) -> &[u8] {
        // SAFETY: the processor holds logical ownership of this buffer from
        // the frame-ready notification until the release is sent on drop.
        unsafe { self.manager.buffer(self.buffer_id).unwrap_or(&[]) }
    }
}

impl Drop for SharedBufferRef {
    fn drop(&mut self) {
        trace!(
            "releasing shared buffer {} for frame {}",
            self.buffer_id,
            self.frame_number
        );
        let _ = self.release.send(FrameRelease {
            frame_number: self.frame_number,
            buffer_id: self.buffer_id,
        });
    }
}

enum Backing {
    DataBlock(DataBlockHandle),
    SharedBuffer(SharedBufferRef),
    Wrapper(Arc<Frame>),
    Sentinel,
}

pub struct Frame {
    frame_number: u64,
    meta: FrameMetaData,
    image_offset: usize,
    image_size: usize,
    outer_chunk_size: u64,
    backing: Backing,
}

impl Frame {
    /// Frame backed by an owned data block; the block returns to its pool
    /// when the last reference drops.
    pub fn from_data_block(
        frame_number: u64,
        meta: FrameMetaData,
        mut block: DataBlockHandle,
        data: &[u8],
    ) -> Frame {
        block.copy_from(data);
        let image_size = data.len();
        Frame {
            frame_number,
            meta,
            image_offset: 0,
            image_size,
            outer_chunk_size: 1,
            backing: Backing::DataBlock(block),
        }
    }

    /// Frame backed by a pooled block already holding its payload.
    pub fn from_block(frame_number: u64, meta: FrameMetaData, block: DataBlockHandle) -> Frame {
        let image_size = block.size();
        Frame {
            frame_number,
            meta,
            image_offset: 0,
            image_size,
            outer_chunk_size: 1,
            backing: Backing::DataBlock(block),
        }
    }

    /// Frame borrowing a buffer from the shared arena. `image_offset` skips
    /// the receiver's reassembly header so the payload is read in place.
    pub fn from_shared_buffer(
        frame_number: u64,
        meta: FrameMetaData,
        buffer: SharedBufferRef,
        image_offset: usize,
    ) -> Frame {
        let image_size = meta.image_bytes();
        Frame {
            frame_number,
            meta,
            image_offset,
            image_size,
            outer_chunk_size: 1,
            backing: Backing::SharedBuffer(buffer),
        }
    }

    /// Read-only view over `parent` with independent metadata and image
    /// offset; used to republish sub-images without copying.
    pub fn wrap(parent: Arc<Frame>, meta: FrameMetaData, image_offset: usize) -> Frame {
        let image_size = meta.image_bytes();
        Frame {
            frame_number: parent.frame_number,
            meta,
            image_offset,
            image_size,
            outer_chunk_size: parent.outer_chunk_size,
            backing: Backing::Wrapper(parent),
        }
    }

    /// Zero-payload frame that flushes the plugin chain without stopping it.
    pub fn end_of_acquisition() -> Frame {
        Frame {
            frame_number: 0,
            meta: FrameMetaData::default(),
            image_offset: 0,
            image_size: 0,
            outer_chunk_size: 1,
            backing: Backing::Sentinel,
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn set_frame_number(&mut self, frame_number: u64) {
        self.frame_number = frame_number;
    }

    pub fn meta_data(&self) -> &FrameMetaData {
        &self.meta
    }

    pub fn meta_data_mut(&mut self) -> &mut FrameMetaData {
        &mut self.meta
    }

    pub fn image_offset(&self) -> usize {
        self.image_offset
    }

    pub fn set_image_offset(&mut self, offset: usize) {
        self.image_offset = offset;
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// For compressed frames the payload is smaller than the dimensions
    /// imply, so the producer records the actual byte count.
    pub fn set_image_size(&mut self, size: usize) {
        self.image_size = size;
    }

    pub fn outer_chunk_size(&self) -> u64 {
        self.outer_chunk_size
    }

    pub fn set_outer_chunk_size(&mut self, outer_chunk_size: u64) {
        self.outer_chunk_size = outer_chunk_size.max(1);
    }

    pub fn end_of_acquisition_flag(&self) -> bool {
        matches!(self.backing, Backing::Sentinel)
    }

    /// Whole backing store, header bytes included.
    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::DataBlock(block) => block.data(),
            Backing::SharedBuffer(buffer) => buffer.data(),
            Backing::Wrapper(parent) => parent.data(),
            Backing::Sentinel => &[],
        }
    }

    pub fn data_size(&self) -> usize {
        self.data().len()
    }

    /// Image payload: the backing store from `image_offset` for
    /// `image_size` bytes.
    pub fn image(&self) -> &[u8] {
        let data = self.data();
        let start = self.image_offset.min(data.len());
        let end = (start + self.image_size).min(data.len());
        &data[start..end]
    }

    /// A frame is pushable when both its data type and compression are
    /// known; sentinel frames bypass this check.
    pub fn is_valid(&self) -> bool {
        self.meta.data_type != framepipe_common::DataType::Unknown
            && self.meta.compression != framepipe_common::CompressionType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DataBlockPools;
    use framepipe_common::{CompressionType, DataType};

    fn meta(dims: Vec<u64>) -> FrameMetaData {
        FrameMetaData::new("data", DataType::U16, "acq", dims, CompressionType::None)
    }

    #[test]
    fn data_block_frame_copies_payload() {
        let pools = DataBlockPools::default();
        let payload: Vec<u8> = (0..24).collect();
        let frame = Frame::from_data_block(7, meta(vec![3, 4]), pools.take(24), &payload);
        assert_eq!(frame.frame_number(), 7);
        assert_eq!(frame.data(), payload.as_slice());
        assert_eq!(frame.image(), payload.as_slice());
        assert!(frame.is_valid());
    }

    #[test]
    fn image_offset_skips_header() {
        let pools = DataBlockPools::default();
        let mut payload = vec![0xEEu8; 8];
        payload.extend((0..24).collect::<Vec<u8>>());
        let mut frame = Frame::from_data_block(1, meta(vec![3, 4]), pools.take(32), &payload);
        frame.set_image_offset(8);
        frame.set_image_size(24);
        assert_eq!(frame.image_offset(), 8);
        assert_eq!(frame.image().len(), 24);
        assert_eq!(frame.image()[0], 0);
        // The pointer relation the plugins rely on
        assert_eq!(
            frame.image().as_ptr() as usize - frame.data().as_ptr() as usize,
            frame.image_offset()
        );
    }

    #[test]
    fn sentinel_has_no_payload() {
        let frame = Frame::end_of_acquisition();
        assert!(frame.end_of_acquisition_flag());
        assert!(frame.data().is_empty());
        assert_eq!(frame.image_size(), 0);
    }

    #[test]
    fn invalid_without_known_types() {
        let pools = DataBlockPools::default();
        let mut m = meta(vec![2]);
        m.data_type = DataType::Unknown;
        let frame = Frame::from_data_block(0, m, pools.take(4), &[0, 1, 2, 3]);
        assert!(!frame.is_valid());
    }

    #[test]
    fn wrapper_delegates_data() {
        let pools = DataBlockPools::default();
        let payload: Vec<u8> = (0..32).collect();
        let parent = Arc::new(Frame::from_data_block(
            3,
            meta(vec![4, 4]),
            pools.take(32),
            &payload,
        ));

        let mut sub_meta = meta(vec![2, 4]);
        sub_meta.dataset_name = "sub".to_string();
        let wrapper = Frame::wrap(parent.clone(), sub_meta, 16);
        assert_eq!(wrapper.frame_number(), 3);
        assert_eq!(wrapper.data(), payload.as_slice());
        assert_eq!(wrapper.image(), &payload[16..]);
        assert_eq!(wrapper.meta_data().dataset_name, "sub");
        // Parent metadata untouched
        assert_eq!(parent.meta_data().dataset_name, "data");
    }

    #[test]
    fn shared_buffer_release_on_last_drop() {
        let name = format!("/fp_frame_{}", std::process::id());
        let manager =
            Arc::new(SharedBufferManager::create(&name, 4096, 1024, true).unwrap());
        // SAFETY: test owns the buffer.
        unsafe {
            manager.buffer_mut(2).unwrap()[..4].copy_from_slice(&[9, 9, 9, 9]);
        }
        let (tx, rx) = crossbeam_channel::unbounded();

        let frame = Arc::new(Frame::from_shared_buffer(
            11,
            meta(vec![2]),
            SharedBufferRef::new(manager, 2, 11, tx),
            0,
        ));
        let copy = frame.clone();
        assert_eq!(&copy.data()[..4], &[9, 9, 9, 9]);

        drop(frame);
        assert!(rx.try_recv().is_err(), "release must wait for the last drop");
        drop(copy);
        assert_eq!(
            rx.try_recv().unwrap(),
            FrameRelease {
                frame_number: 11,
                buffer_id: 2
            }
        );
        assert!(rx.try_recv().is_err(), "release is sent exactly once");
    }
}
