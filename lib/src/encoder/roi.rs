//! Regions of interest, turned into per-block QP tables.
use std::io;

use thiserror::Error;

use crate::memory::Mapping;
use crate::module::Roi;
use crate::settings::Codec;
use crate::{Rect, Resolution};

/// Largest QP delta a region can carry.
pub const MAX_QP_DELTA: i8 = 31;

/// Size in pixels of the square blocks a QP table has one entry for.
pub fn block_size(codec: Codec) -> u32 {
    match codec {
        Codec::Avc => 16,
        Codec::Hevc => 32,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoiError {
    #[error("region {0} is outside of the picture")]
    OutOfPicture(Rect),
    #[error("QP delta {0} is out of range")]
    QpDelta(i8),
}

/// Regions of interest of the pictures to encode. Regions added later take
/// precedence where they overlap earlier ones.
#[derive(Debug, Clone)]
pub struct RoiTable {
    resolution: Resolution,
    block_size: u32,
    regions: Vec<Roi>,
}

impl RoiTable {
    pub fn new(resolution: Resolution, block_size: u32) -> Self {
        RoiTable {
            resolution,
            block_size: block_size.max(1),
            regions: Vec::new(),
        }
    }

    pub fn add(&mut self, roi: Roi) -> Result<(), RoiError> {
        if !roi.rect.fits(self.resolution) || roi.rect.width == 0 || roi.rect.height == 0 {
            return Err(RoiError::OutOfPicture(roi.rect));
        }
        if !(-MAX_QP_DELTA..=MAX_QP_DELTA).contains(&roi.qp_delta) {
            return Err(RoiError::QpDelta(roi.qp_delta));
        }
        self.regions.push(roi);
        Ok(())
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Blocks per row and per column.
    fn blocks(&self) -> (u32, u32) {
        (
            self.resolution.width.div_ceil(self.block_size),
            self.resolution.height.div_ceil(self.block_size),
        )
    }

    /// Size in bytes of the QP table: one signed byte per block, in raster
    /// order.
    pub fn size(&self) -> usize {
        let (columns, rows) = self.blocks();
        columns as usize * rows as usize
    }

    /// QP deltas of every block.
    pub fn table(&self) -> Vec<i8> {
        let (columns, rows) = self.blocks();
        let mut table = vec![0i8; self.size()];
        for roi in &self.regions {
            let Rect {
                left,
                top,
                width,
                height,
            } = roi.rect;
            // Blocks touched by the region, even partially.
            let first_column = left / self.block_size;
            let last_column = ((left + width - 1) / self.block_size).min(columns - 1);
            let first_row = top / self.block_size;
            let last_row = ((top + height - 1) / self.block_size).min(rows - 1);
            for row in first_row..=last_row {
                let start = (row * columns) as usize;
                table[start + first_column as usize..=start + last_column as usize]
                    .fill(roi.qp_delta);
            }
        }
        table
    }

    /// Writes the table at the start of `mapping`.
    pub fn fill(&self, mapping: &Mapping) -> io::Result<()> {
        let bytes: Vec<u8> = self.table().into_iter().map(|d| d as u8).collect();
        mapping.write_at(0, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn roi(left: u32, top: u32, width: u32, height: u32, qp_delta: i8) -> Roi {
        Roi {
            rect: Rect::new(left, top, width, height),
            qp_delta,
        }
    }

    #[test]
    fn regions_cover_touched_blocks() {
        let mut table = RoiTable::new(Resolution::new(64, 48), 16);
        assert_eq!(table.size(), 12);
        table.add(roi(8, 0, 16, 16, -4)).unwrap();
        #[rustfmt::skip]
        let expected = vec![
            -4, -4, 0, 0,
             0,  0, 0, 0,
             0,  0, 0, 0,
        ];
        assert_eq!(table.table(), expected);

        // Later regions win.
        table.add(roi(16, 0, 48, 48, 2)).unwrap();
        #[rustfmt::skip]
        let expected = vec![
            -4, 2, 2, 2,
             0, 2, 2, 2,
             0, 2, 2, 2,
        ];
        assert_eq!(table.table(), expected);

        table.clear();
        assert!(table.is_empty());
        assert!(table.table().iter().all(|d| *d == 0));
    }

    #[test]
    fn partial_blocks() {
        // 40x20 in 32x32 blocks: 2x1 blocks, the last ones partial.
        let mut table = RoiTable::new(Resolution::new(40, 20), 32);
        table.add(roi(36, 10, 4, 10, 5)).unwrap();
        assert_eq!(table.table(), vec![0, 5]);
    }

    #[test]
    fn invalid_regions() {
        let mut table = RoiTable::new(Resolution::new(64, 64), 32);
        assert_eq!(
            table.add(roi(32, 32, 64, 16, 1)),
            Err(RoiError::OutOfPicture(Rect::new(32, 32, 64, 16)))
        );
        assert_eq!(
            table.add(roi(0, 0, 0, 16, 1)),
            Err(RoiError::OutOfPicture(Rect::new(0, 0, 0, 16)))
        );
        assert_eq!(table.add(roi(0, 0, 16, 16, 40)), Err(RoiError::QpDelta(40)));
        assert!(table.is_empty());
    }

    #[test]
    fn fill_writes_signed_bytes() {
        let mut table = RoiTable::new(Resolution::new(32, 16), 16);
        table.add(roi(0, 0, 16, 16, -1)).unwrap();
        let mapping = Mapping::Memory(Arc::new(Mutex::new(vec![9u8; 4])));
        table.fill(&mapping).unwrap();
        assert_eq!(mapping.to_vec(0, 4).unwrap(), vec![0xff, 0, 9, 9]);
    }
}
