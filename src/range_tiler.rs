//! Range Tiler
//!
//! Maps a client's byte window onto the fixed tile grid of a remote object.
//! A response never spans more than one tile; clients ask again for the rest.

use crate::error::{ProxyError, Result};
use crate::models::{ByteRange, RangeRequest, TileSpec};
use tracing::debug;

/// The part of one tile that answers a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileWindow {
    /// Tile containing the first requested byte
    pub tile: TileSpec,
    /// First byte served
    pub request_start: u64,
    /// Last byte served; never past the tile end
    pub response_end: u64,
    /// Total object size, when known
    pub total_size: Option<u64>,
}

/// Calculator for the tile grid
#[derive(Debug, Clone, Copy)]
pub struct RangeTiler {
    tile_size: u64,
}

impl RangeTiler {
    /// Create a tiler; a zero tile size is treated as one byte
    pub fn new(tile_size: u64) -> Self {
        RangeTiler {
            tile_size: tile_size.max(1),
        }
    }

    pub fn tile_size(&self) -> u64 {
        self.tile_size
    }

    /// Start offset and index of the tile containing byte `start`
    pub fn tile_for(&self, start: u64) -> (u64, u64) {
        let index = start / self.tile_size;
        (index * self.tile_size, index)
    }

    /// Last byte of the tile starting at `tile_start`, clamped to the object end
    pub fn tile_end(&self, tile_start: u64, total_size: Option<u64>) -> u64 {
        let end = tile_start.saturating_add(self.tile_size - 1);
        match total_size {
            Some(total) if total > 0 => end.min(total - 1),
            _ => end,
        }
    }

    /// Last byte served, given the tile end and an optional requested end
    pub fn clamp_to_requested(&self, tile_end: u64, requested_end: Option<u64>) -> u64 {
        match requested_end {
            Some(end) => end.min(tile_end),
            None => tile_end,
        }
    }

    /// Resolve a request onto its tile
    ///
    /// Returns `UnsatisfiableRange` when the start lies at or past a known end.
    pub fn window(&self, range: RangeRequest, total_size: Option<u64>) -> Result<TileWindow> {
        if let Some(total) = total_size {
            if range.start >= total {
                debug!("Range start {} is beyond total size {}", range.start, total);
                return Err(ProxyError::UnsatisfiableRange {
                    start: range.start,
                    total,
                });
            }
        }

        let (tile_start, index) = self.tile_for(range.start);
        let tile_end = self.tile_end(tile_start, total_size);
        let response_end = self.clamp_to_requested(tile_end, range.end);

        debug!(
            "Request {}-{:?} maps to tile {} ({}-{}), serving {}-{}",
            range.start, range.end, index, tile_start, tile_end, range.start, response_end
        );

        Ok(TileWindow {
            tile: TileSpec {
                index,
                range: ByteRange::new(tile_start, tile_end)?,
            },
            request_start: range.start,
            response_end,
            total_size,
        })
    }
}
