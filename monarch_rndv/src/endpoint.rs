/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lane and endpoint configuration consumed by the rendezvous engine.
//!
//! The connection layer decides which lanes an endpoint has and what each
//! lane can do; this module only describes that table. An `EpConfig` is
//! immutable once installed on an endpoint. Reconfiguring an endpoint
//! installs a new `EpConfig` with a different `index`, which invalidates
//! every remote key resolution cached against the old one.

use serde::Deserialize;
use serde::Serialize;

use crate::error::RndvError;
use crate::memory::Bitmap;
use crate::memory::LaneIndex;
use crate::memory::MAX_LANES;
use crate::memory::MAX_MDS;
use crate::memory::MdIndex;
use crate::memory::MdMap;
use crate::memory::MemTypeSet;
use crate::memory::MemoryType;

pub type EpId = u64;

/// Capabilities of one local memory domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdAttr {
    /// `reg_mem_types` - Memory types this domain can register.
    pub reg_mem_types: MemTypeSet,
    /// `access_mem_types` - Memory types this domain can access without registration.
    pub access_mem_types: MemTypeSet,
    /// `need_rkey` - Whether remote access through this domain needs a remote key.
    pub need_rkey: bool,
    /// `rkey_ptr` - Whether remote keys of this domain can be mapped to a local pointer.
    pub rkey_ptr: bool,
}

impl MdAttr {
    /// A network domain that registers the given memory types.
    pub fn network(reg: &[MemoryType]) -> Self {
        Self {
            reg_mem_types: MemTypeSet::of(reg),
            access_mem_types: MemTypeSet::of(reg),
            need_rkey: true,
            rkey_ptr: false,
        }
    }

    /// A local copy domain that reaches `mem_types` without keys.
    pub fn copy(mem_types: &[MemoryType]) -> Self {
        Self {
            reg_mem_types: MemTypeSet::empty(),
            access_mem_types: MemTypeSet::of(mem_types),
            need_rkey: false,
            rkey_ptr: false,
        }
    }
}

/// Size limits of zero-copy operations on one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZcopyLimits {
    pub min: usize,
    pub max: usize,
    /// Preferred alignment of each operation.
    pub align: usize,
    /// Transfers longer than this start with a short chunk that aligns the
    /// remainder of a misaligned buffer. Never below `align`.
    pub align_mtu: usize,
}

impl ZcopyLimits {
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            align: 1,
            align_mtu: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// `md_index` - Local memory domain of the lane, `None` for lanes without one.
    pub md_index: Option<MdIndex>,
    /// `dst_md_index` - Remote memory domain the lane writes to or reads from.
    pub dst_md_index: MdIndex,
    /// `bandwidth` - Estimated bandwidth in bytes per second.
    pub bandwidth: f64,
    pub get_zcopy: Option<ZcopyLimits>,
    pub put_zcopy: Option<ZcopyLimits>,
    /// `max_short` - Largest short active message, 0 if unsupported.
    pub max_short: usize,
    /// `max_bcopy` - Largest buffered-copy active message, 0 if unsupported.
    pub max_bcopy: usize,
}

impl LaneConfig {
    pub fn can_send_am(&self, size: usize) -> bool {
        (self.max_short > 0 && self.max_short >= size) || (self.max_bcopy > 0 && self.max_bcopy >= size)
    }
}

/// Direction of a zero-copy RMA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RmaOp {
    Get,
    Put,
}

/// Aggregated rendezvous zero-copy thresholds of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RndvZcopy {
    pub min: usize,
    pub max: usize,
    /// Whether a message above `max` may be split into several operations.
    pub split: bool,
}

impl RndvZcopy {
    pub fn supports(&self, length: usize) -> bool {
        length >= self.min && (length <= self.max || self.split)
    }
}

/// Per-endpoint lane table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpConfig {
    /// `index` - Identity of this configuration; remote key caches key on it.
    pub index: u32,
    pub lanes: Vec<LaneConfig>,
    /// `am_lane` - Lane carrying control messages.
    pub am_lane: LaneIndex,
    /// `rma_lanes` - Lanes usable for single remote memory operations, in priority order.
    pub rma_lanes: Vec<LaneIndex>,
    /// `rma_bw_lanes` - Bandwidth lanes used for rendezvous bulk transfer.
    pub rma_bw_lanes: Vec<LaneIndex>,
    /// `rkey_ptr_dst_mds` - Remote domains whose keys can be mapped to a local pointer.
    pub rkey_ptr_dst_mds: MdMap,
    /// `rndv_split` - Whether transfers above the zero-copy maximum may be split.
    pub rndv_split: bool,
}

impl EpConfig {
    pub fn validate(&self, mds: &[MdAttr]) -> Result<(), RndvError> {
        if self.lanes.is_empty() || self.lanes.len() > MAX_LANES {
            return Err(RndvError::InvalidConfig(format!(
                "endpoint config {} has {} lanes, expected 1..={}",
                self.index,
                self.lanes.len(),
                MAX_LANES
            )));
        }
        let all = self
            .rma_lanes
            .iter()
            .chain(self.rma_bw_lanes.iter())
            .chain(std::iter::once(&self.am_lane));
        for &lane in all {
            if lane >= self.lanes.len() {
                return Err(RndvError::InvalidConfig(format!(
                    "endpoint config {} references lane {} out of {}",
                    self.index,
                    lane,
                    self.lanes.len()
                )));
            }
        }
        for (i, lane) in self.lanes.iter().enumerate() {
            if lane.dst_md_index >= MAX_MDS || lane.md_index.is_some_and(|md| md >= mds.len()) {
                return Err(RndvError::InvalidConfig(format!(
                    "lane {} of endpoint config {} names an unknown memory domain",
                    i, self.index
                )));
            }
            for limits in [lane.get_zcopy, lane.put_zcopy].into_iter().flatten() {
                if limits.align == 0
                    || limits.align_mtu < limits.align
                    || limits.max < limits.min
                    || limits.max == 0
                {
                    return Err(RndvError::InvalidConfig(format!(
                        "lane {} of endpoint config {} has bad zero-copy limits {:?}",
                        i, self.index, limits
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn lane(&self, lane: LaneIndex) -> &LaneConfig {
        &self.lanes[lane]
    }

    pub fn limits(&self, lane: LaneIndex, op: RmaOp) -> Option<ZcopyLimits> {
        let config = &self.lanes[lane];
        match op {
            RmaOp::Get => config.get_zcopy,
            RmaOp::Put => config.put_zcopy,
        }
    }

    /// Bandwidth lanes that support zero-copy `op`, in configuration order.
    pub fn rndv_lanes(&self, op: RmaOp) -> Vec<LaneIndex> {
        self.rma_bw_lanes
            .iter()
            .copied()
            .filter(|&lane| self.limits(lane, op).is_some())
            .collect()
    }

    /// Thresholds for zero-copy `op` across all rendezvous lanes, or `None`
    /// if no lane supports it.
    pub fn rndv_zcopy(&self, op: RmaOp) -> Option<RndvZcopy> {
        let lanes = self.rndv_lanes(op);
        let mut limits = lanes.iter().filter_map(|&lane| self.limits(lane, op));
        let first = limits.next()?;
        let (min, max) = limits.fold((first.min, first.max), |(min, max), l| {
            (min.max(l.min), max.min(l.max))
        });
        if max == 0 {
            return None;
        }
        Some(RndvZcopy {
            min,
            max,
            split: self.rndv_split,
        })
    }

    /// Local domains of the bandwidth lanes.
    pub fn rma_bw_md_map(&self) -> MdMap {
        self.rma_bw_lanes
            .iter()
            .filter_map(|&lane| self.lanes[lane].md_index)
            .collect::<Bitmap>()
    }

    /// Local domains of the bandwidth lanes that can register `mem_type`.
    pub fn reg_md_map(&self, mds: &[MdAttr], mem_type: MemoryType) -> MdMap {
        self.rma_bw_md_map()
            .iter()
            .filter(|&md| mds[md].reg_mem_types.contains(mem_type))
            .collect()
    }
}
