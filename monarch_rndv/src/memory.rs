/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Memory primitives shared by every stage of the rendezvous engine.
//!
//! - `MemoryType`: where a buffer lives (host or an accelerator).
//! - `MemTypeSet`: a set of memory types, used for domain capabilities.
//! - `Bitmap`: a 64-bit index set. Memory-domain maps and lane maps are both
//!   bitmaps; domain maps additionally define the order of the per-domain key
//!   blobs inside a packed remote key.
//! - `Buffer`: a contiguous region of the address space seen by the transport.
//! - `MemHandle`: the result of registering a `Buffer` with a set of domains.

use serde::Deserialize;
use serde::Serialize;

/// Maximum number of memory domains a remote key may describe.
pub const MAX_MDS: usize = 16;

/// Maximum number of lanes on one endpoint.
pub const MAX_LANES: usize = 8;

pub type MdIndex = usize;
pub type LaneIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemoryType {
    Host = 0,
    Cuda = 1,
    CudaManaged = 2,
    Rocm = 3,
}

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Host,
        MemoryType::Cuda,
        MemoryType::CudaManaged,
        MemoryType::Rocm,
    ];

    pub fn is_host(self) -> bool {
        self == MemoryType::Host
    }

    /// Host memory and managed memory can be dereferenced by the CPU.
    pub fn is_cpu_accessible(self) -> bool {
        matches!(self, MemoryType::Host | MemoryType::CudaManaged)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<MemoryType> {
        MemoryType::ALL.into_iter().find(|m| m.tag() == tag)
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryType::Host => "host",
            MemoryType::Cuda => "cuda",
            MemoryType::CudaManaged => "cuda-managed",
            MemoryType::Rocm => "rocm",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemTypeSet(u8);

impl MemTypeSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn of(types: &[MemoryType]) -> Self {
        Self(types.iter().fold(0, |acc, t| acc | (1 << t.tag())))
    }

    pub fn with(mut self, mem_type: MemoryType) -> Self {
        self.0 |= 1 << mem_type.tag();
        self
    }

    pub fn contains(self, mem_type: MemoryType) -> bool {
        self.0 & (1 << mem_type.tag()) != 0
    }

    pub fn contains_all(self, other: MemTypeSet) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A set of small indices stored as a 64-bit mask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bitmap(u64);

pub type MdMap = Bitmap;
pub type LaneMap = Bitmap;

impl Bitmap {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn bit(index: usize) -> Self {
        Self(1u64 << index)
    }

    pub fn contains(self, index: usize) -> bool {
        index < 64 && self.0 & (1u64 << index) != 0
    }

    pub fn insert(&mut self, index: usize) {
        self.0 |= 1u64 << index;
    }

    pub fn remove(&mut self, index: usize) {
        self.0 &= !(1u64 << index);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn intersects(self, other: Bitmap) -> bool {
        self.0 & other.0 != 0
    }

    pub fn and(self, other: Bitmap) -> Bitmap {
        Bitmap(self.0 & other.0)
    }

    /// Lowest set index.
    pub fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Position of `index` among the set bits, counting from the lowest.
    ///
    /// For a domain map this is where the domain's key blob sits in the
    /// packed key. Only meaningful when `index` is set.
    pub fn index_of(self, index: usize) -> usize {
        let below = if index >= 64 {
            self.0
        } else {
            self.0 & ((1u64 << index) - 1)
        };
        below.count_ones() as usize
    }

    /// The highest set index, if any.
    pub fn last(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros() as usize)
        }
    }

    /// Set indices in ascending order.
    pub fn iter(self) -> BitmapIter {
        BitmapIter(self.0)
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromIterator<usize> for Bitmap {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut map = Bitmap::empty();
        for index in iter {
            map.insert(index);
        }
        map
    }
}

pub struct BitmapIter(u64);

impl Iterator for BitmapIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(index)
    }
}

/// A contiguous region in the transport's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    pub addr: u64,
    pub length: usize,
    pub mem_type: MemoryType,
}

impl Buffer {
    pub fn new(addr: u64, length: usize, mem_type: MemoryType) -> Self {
        Self {
            addr,
            length,
            mem_type,
        }
    }

    /// The sub-region `[offset, offset + length)` of this buffer.
    pub fn slice(&self, offset: usize, length: usize) -> Buffer {
        debug_assert!(offset + length <= self.length);
        Buffer {
            addr: self.addr + offset as u64,
            length,
            mem_type: self.mem_type,
        }
    }
}

/// A buffer registered with one or more local memory domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemHandle {
    pub id: u64,
    pub buffer: Buffer,
    pub md_map: MdMap,
}
