// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Dirty bitmaps: per-node records of which ranges were written.
//!
//! Each bit covers `granularity` bytes of the node. A bitmap belongs to
//! exactly one node and is only reached through that node's state lock;
//! callers always get copies.

pub mod bitset;
mod ops;

use bitflags::bitflags;
use serde::Serialize;

pub use self::bitset::BitSet;
pub use self::ops::{
    add, clear, default_granularity, disable, enable, merge, query, remove, restore,
    MergeSource,
};
pub(crate) use self::ops::{release, set_enabled, set_flags, store_persistent};
use crate::{div_round_up, Error, Result};

pub const MIN_GRANULARITY: u32 = 512;
pub const MAX_NAME_LEN: usize = 1023;

bitflags! {
    /// Conditions a bitmap must not be in for an operation to go ahead.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BitmapCheck: u32 {
        const BUSY = 1 << 0;
        const READ_ONLY = 1 << 1;
        const INCONSISTENT = 1 << 2;

        const DEFAULT = Self::BUSY.bits() | Self::READ_ONLY.bits() | Self::INCONSISTENT.bits();
        /// Changing whether a bitmap records doesn't modify its contents.
        const ALLOW_RO = Self::BUSY.bits() | Self::INCONSISTENT.bits();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyBitmap {
    name: Option<String>,
    granularity: u32,
    size: u64,
    bits: BitSet,
    disabled: bool,
    persistent: bool,
    busy: bool,
    readonly: bool,
    inconsistent: bool,
    skip_store: bool,
}

impl DirtyBitmap {
    /// Empty, enabled bitmap covering `size` bytes.
    pub fn new(name: Option<&str>, granularity: u32, size: u64) -> Self {
        DirtyBitmap {
            name: name.map(str::to_string),
            granularity,
            size,
            bits: BitSet::new(div_round_up(size, u64::from(granularity))),
            disabled: false,
            persistent: false,
            busy: false,
            readonly: false,
            inconsistent: false,
            skip_store: false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.disabled = !enabled;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    /// Marks a bitmap loaded from storage that wasn't stored cleanly.
    pub fn set_inconsistent(&mut self) {
        self.inconsistent = true;
        self.disabled = true;
        self.persistent = true;
    }

    pub fn skip_store(&self) -> bool {
        self.skip_store
    }

    pub fn set_skip_store(&mut self, skip: bool) {
        self.skip_store = skip;
    }

    /// Marks every chunk overlapping `[offset, offset + bytes)`.
    pub fn mark(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let g = u64::from(self.granularity);
        let first = offset / g;
        let last = (offset.saturating_add(bytes) - 1) / g;
        self.bits.set_range(first, last - first + 1);
    }

    /// Resets the chunks covering `[offset, offset + bytes)`.
    pub fn reset(&mut self, offset: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let g = u64::from(self.granularity);
        let first = offset / g;
        let last = (offset.saturating_add(bytes) - 1) / g;
        self.bits.reset_range(first, last - first + 1);
    }

    pub fn is_dirty(&self, offset: u64) -> bool {
        self.bits.get(offset / u64::from(self.granularity))
    }

    /// Indices of the dirty chunks, ascending.
    pub fn dirty_chunks(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.iter_set()
    }

    /// Number of dirty bytes.
    pub fn count(&self) -> u64 {
        let g = u64::from(self.granularity);
        self.bits
            .iter_set()
            .map(|chunk| std::cmp::min(g, self.size - chunk * g))
            .sum()
    }

    pub fn bits(&self) -> &BitSet {
        &self.bits
    }

    /// Replaces the contents, e.g. when loading from storage.
    pub fn set_bits(&mut self, bits: BitSet) -> Result<()> {
        if bits.len() != self.bits.len() {
            return Err(Error::InvalidArgument(format!(
                "Bitmap '{}' has {} chunks, not {}",
                self.display_name(),
                self.bits.len(),
                bits.len()
            )));
        }
        self.bits = bits;
        Ok(())
    }

    pub fn check(&self, flags: BitmapCheck) -> Result<()> {
        if flags.contains(BitmapCheck::BUSY) && self.busy {
            return Err(Error::Busy(format!(
                "Bitmap '{}' is currently in use by another operation and cannot be used",
                self.display_name()
            )));
        }
        if flags.contains(BitmapCheck::READ_ONLY) && self.readonly {
            return Err(Error::ReadOnly(format!(
                "Bitmap '{}' is readonly and cannot be modified",
                self.display_name()
            )));
        }
        if flags.contains(BitmapCheck::INCONSISTENT) && self.inconsistent {
            return Err(Error::InvalidArgument(format!(
                "Bitmap '{}' is inconsistent and cannot be used; \
                 try block-dirty-bitmap-remove to delete it",
                self.display_name()
            )));
        }
        Ok(())
    }

    /// Clears every bit and hands back the previous contents.
    pub fn clear(&mut self) -> BitSet {
        let empty = BitSet::new(self.bits.len());
        std::mem::replace(&mut self.bits, empty)
    }

    pub fn restore(&mut self, backup: BitSet) {
        self.bits = backup;
    }

    /// Bitmaps covering the same number of bytes can be merged whatever
    /// their granularities.
    pub fn can_merge(&self, src: &DirtyBitmap) -> bool {
        self.size == src.size
    }

    /// Sets every chunk overlapping a range dirty in `src`.
    pub fn merge_from(&mut self, src: &DirtyBitmap) -> Result<()> {
        if !self.can_merge(src) {
            return Err(Error::InvalidArgument(
                "Bitmaps are incompatible and can't be merged".to_string(),
            ));
        }

        if self.granularity == src.granularity {
            self.bits.union_with(&src.bits);
        } else {
            let g = u64::from(src.granularity);
            for chunk in src.bits.iter_set() {
                let offset = chunk * g;
                self.mark(offset, std::cmp::min(g, self.size - offset));
            }
        }
        Ok(())
    }
}

/// What `query-block` style listings report about one bitmap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BitmapInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub granularity: u32,
    pub count: u64,
    pub recording: bool,
    pub busy: bool,
    pub persistent: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub inconsistent: bool,
}

impl From<&DirtyBitmap> for BitmapInfo {
    fn from(bitmap: &DirtyBitmap) -> Self {
        BitmapInfo {
            name: bitmap.name.clone(),
            granularity: bitmap.granularity,
            count: bitmap.count(),
            recording: bitmap.is_enabled(),
            busy: bitmap.busy,
            persistent: bitmap.persistent,
            inconsistent: bitmap.inconsistent,
        }
    }
}
