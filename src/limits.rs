//! Negotiable size/buffering caps with element-wise minimum merge.

use serde::{Deserialize, Serialize};

/// Negotiated (or advertised) limits for a master connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_frame: u32,
    pub max_chunk: u32,
    pub max_reorder_buffer: u32,
}

impl Limits {
    /// Permissive defaults used before any master has advertised limits.
    pub const UNBOUNDED: Limits = Limits {
        max_frame: u32::MAX,
        max_chunk: u32::MAX,
        max_reorder_buffer: u32::MAX,
    };

    /// Element-wise minimum of two limit sets.
    pub fn merge_min(a: Limits, b: Limits) -> Limits {
        Limits {
            max_frame: a.max_frame.min(b.max_frame),
            max_chunk: a.max_chunk.min(b.max_chunk),
            max_reorder_buffer: a.max_reorder_buffer.min(b.max_reorder_buffer),
        }
    }

    /// Fold `merge_min` over a non-empty sequence.
    pub fn fold_min(values: impl IntoIterator<Item = Limits>) -> Option<Limits> {
        let mut iter = values.into_iter();
        let first = iter.next()?;
        Some(iter.fold(first, Limits::merge_min))
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits::UNBOUNDED
    }
}
