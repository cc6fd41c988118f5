//! SPAD layout: which photodetector elements feed which measurement channel.
//!
//! Each of the two user SPAD maps is exchanged with the device as one config
//! page. The enable mask is bit-packed (one bit per element) and the channel map
//! nibble-packed (two elements per byte), row-major over an 18x10 array.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::{MAX_SPAD_SIZE, MAX_SPAD_XSIZE, MAX_SPAD_YSIZE};
use crate::error::{Result, TofError};

const MASK_BYTES: usize = MAX_SPAD_SIZE.div_ceil(8);
const MAP_BYTES: usize = MAX_SPAD_SIZE.div_ceil(2);

/// Number of SPAD maps the device keeps.
pub const SPAD_MAP_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SpadPageRaw {
    pub page_id: u8,
    pub reserved: u8,
    pub xoff_q1: i8,
    pub yoff_q1: i8,
    pub xsize: u8,
    pub ysize: u8,
    pub mask: [u8; MASK_BYTES],
    pub map: [u8; MAP_BYTES],
}

pub const SPAD_PAGE_SIZE: usize = size_of::<SpadPageRaw>();

/// Geometry of one SPAD map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpadConfig {
    /// Horizontal offset in half-SPAD units
    pub xoff_q1: i8,
    /// Vertical offset in half-SPAD units
    pub yoff_q1: i8,
    pub xsize: u8,
    pub ysize: u8,
    /// Enable flag per element, row-major, `MAX_SPAD_SIZE` entries
    pub spad_mask: Vec<u8>,
    /// Channel id per element, row-major, `MAX_SPAD_SIZE` entries
    pub spad_map: Vec<u8>,
}

impl Default for SpadConfig {
    fn default() -> Self {
        Self {
            xoff_q1: 0,
            yoff_q1: 0,
            xsize: MAX_SPAD_XSIZE,
            ysize: MAX_SPAD_YSIZE,
            spad_mask: vec![0; MAX_SPAD_SIZE],
            spad_map: vec![0; MAX_SPAD_SIZE],
        }
    }
}

impl SpadConfig {
    pub fn from_page(raw: &SpadPageRaw) -> Self {
        let spad_mask = (0..MAX_SPAD_SIZE)
            .map(|i| (raw.mask[i / 8] >> (i % 8)) & 1)
            .collect();
        let spad_map = (0..MAX_SPAD_SIZE)
            .map(|i| (raw.map[i / 2] >> ((i % 2) * 4)) & 0x0F)
            .collect();
        Self {
            xoff_q1: raw.xoff_q1,
            yoff_q1: raw.yoff_q1,
            xsize: raw.xsize,
            ysize: raw.ysize,
            spad_mask,
            spad_map,
        }
    }

    pub fn to_page(&self, page_id: u8) -> Result<SpadPageRaw> {
        self.validate()?;
        let mut raw = SpadPageRaw {
            page_id,
            reserved: 0,
            xoff_q1: self.xoff_q1,
            yoff_q1: self.yoff_q1,
            xsize: self.xsize,
            ysize: self.ysize,
            mask: [0; MASK_BYTES],
            map: [0; MAP_BYTES],
        };
        for (i, &enabled) in self.spad_mask.iter().enumerate() {
            if enabled != 0 {
                raw.mask[i / 8] |= 1 << (i % 8);
            }
        }
        for (i, &channel) in self.spad_map.iter().enumerate() {
            raw.map[i / 2] |= (channel & 0x0F) << ((i % 2) * 4);
        }
        Ok(raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.xsize > MAX_SPAD_XSIZE || self.ysize > MAX_SPAD_YSIZE {
            return Err(TofError::InvalidInput(format!(
                "SPAD size {}x{} exceeds {}x{}",
                self.xsize, self.ysize, MAX_SPAD_XSIZE, MAX_SPAD_YSIZE
            )));
        }
        if self.spad_mask.len() != MAX_SPAD_SIZE || self.spad_map.len() != MAX_SPAD_SIZE {
            return Err(TofError::InvalidInput(format!(
                "SPAD mask/map must have {} entries",
                MAX_SPAD_SIZE
            )));
        }
        if let Some(bad) = self.spad_map.iter().find(|&&c| c > 0x0F) {
            return Err(TofError::InvalidInput(format!("SPAD channel {} does not fit 4 bits", bad)));
        }
        Ok(())
    }

    /// Format `values` as `ysize` rows of `xsize` space-separated entries.
    pub fn format_grid(&self, values: &[u8]) -> String {
        let mut out = String::new();
        for row in 0..self.ysize as usize {
            for col in 0..self.xsize as usize {
                let v = values.get(row * self.xsize as usize + col).copied().unwrap_or(0);
                out.push_str(&format!("{} ", v));
            }
            out.push('\n');
        }
        out
    }
}

/// Both SPAD maps.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpadLayout {
    pub configs: [SpadConfig; SPAD_MAP_COUNT],
}
