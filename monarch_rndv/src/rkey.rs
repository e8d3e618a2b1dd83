/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Remote Keys
//!
//! A remote key describes a peer buffer that is reachable through one or
//! more of the peer's memory domains.
//!
//! ## Packed layout
//!
//! ```text
//! +--------+----------------+-----------------------------------------+
//! | u8     | u64 (LE)       | for each set bit, ascending:            |
//! | memory | domain bitmap  |   u16 (LE) blob length, blob bytes      |
//! | type   |                |                                         |
//! +--------+----------------+-----------------------------------------+
//! ```
//!
//! The number of blobs equals the population count of the bitmap. Nothing
//! after the bitmap sits at a fixed offset; decoding walks the bits in order.
//!
//! ## Lifetime
//!
//! An `Rkey` is created by `Rkey::unpack` and owned by exactly one request.
//! `Rkey::destroy` consumes the key and hands every per-domain blob back to
//! the transport, so a key cannot be destroyed twice. Dropping a key that was
//! never destroyed leaks the per-domain handles and is reported as a warning.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::endpoint::EpConfig;
use crate::endpoint::MdAttr;
use crate::error::RndvError;
use crate::memory::Bitmap;
use crate::memory::LaneIndex;
use crate::memory::LaneMap;
use crate::memory::MAX_MDS;
use crate::memory::MdIndex;
use crate::memory::MdMap;
use crate::memory::MemoryType;
use crate::transport::Transport;

const HEADER_LEN: usize = 1 + 8;

/// How single remote operations on a resolved key are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmaKind {
    /// The lane performs zero-copy remote memory access.
    Zcopy,
    /// The lane only supports buffered copies.
    Bcopy,
}

/// Result of resolving a key against one endpoint configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RkeyCache {
    pub ep_cfg_index: u32,
    pub rma_lane: Option<LaneIndex>,
    pub rma_key: Option<Bytes>,
    pub kind: RmaKind,
    pub max_put_short: usize,
}

/// How one lane reaches the memory behind a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaneReach {
    /// The lane's domain needs no remote key.
    NoKey,
    /// The lane uses the blob at this position in the key.
    Key(usize),
    Unreachable,
}

/// Decides whether `lane` of `ep` can reach memory of `mem_type` described by
/// `rkey`. With no key, only lanes whose domain needs none qualify.
pub(crate) fn lane_reach(
    rkey: Option<&Rkey>,
    ep: &EpConfig,
    mds: &[MdAttr],
    lane: LaneIndex,
    mem_type: MemoryType,
) -> LaneReach {
    let config = ep.lane(lane);
    if let Some(md) = config.md_index {
        let attr = &mds[md];
        if !attr.need_rkey {
            let accessible = match rkey {
                None => true,
                Some(key) => attr.access_mem_types.contains(mem_type) && key.mem_type == mem_type,
            };
            if accessible {
                return LaneReach::NoKey;
            }
        }
        if !attr.reg_mem_types.contains(mem_type) {
            return LaneReach::Unreachable;
        }
    }
    match rkey {
        Some(key) if key.md_map.contains(config.dst_md_index) => {
            LaneReach::Key(key.md_map.index_of(config.dst_md_index))
        }
        _ => LaneReach::Unreachable,
    }
}

/// Packs per-domain key blobs into the wire layout described in the module
/// docs. Blobs may be given in any order; they are written by ascending
/// domain index.
pub fn pack(mem_type: MemoryType, keys: &[(MdIndex, Bytes)]) -> Result<Bytes, RndvError> {
    let mut sorted: Vec<&(MdIndex, Bytes)> = keys.iter().collect();
    sorted.sort_by_key(|(md, _)| *md);

    let mut md_map = MdMap::empty();
    let mut len = HEADER_LEN;
    for (md, blob) in &sorted {
        if *md >= MAX_MDS {
            return Err(RndvError::InvalidKey(format!(
                "memory domain {} exceeds the maximum of {}",
                md, MAX_MDS
            )));
        }
        if md_map.contains(*md) {
            return Err(RndvError::InvalidKey(format!(
                "memory domain {} packed twice",
                md
            )));
        }
        if blob.len() > u16::MAX as usize {
            return Err(RndvError::InvalidKey(format!(
                "key blob of {} bytes for domain {} is too large",
                blob.len(),
                md
            )));
        }
        md_map.insert(*md);
        len += 2 + blob.len();
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(mem_type.tag());
    buf.put_u64_le(md_map.bits());
    for (_, blob) in sorted {
        buf.put_u16_le(blob.len() as u16);
        buf.put_slice(blob);
    }
    Ok(buf.freeze())
}

/// A peer buffer reachable through a set of the peer's memory domains.
pub struct Rkey {
    mem_type: MemoryType,
    md_map: MdMap,
    keys: Vec<Bytes>,
    cache: Option<RkeyCache>,
    destroyed: bool,
}

impl std::fmt::Debug for Rkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rkey")
            .field("mem_type", &self.mem_type)
            .field("md_map", &self.md_map)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Rkey {
    /// Decodes a packed key.
    ///
    /// # Errors
    ///
    /// Returns `RndvError::InvalidKey` if the buffer is truncated, carries an
    /// unknown memory type, names a domain beyond `MAX_MDS`, or has bytes
    /// left over after the last blob.
    pub fn unpack(packed: Bytes) -> Result<Rkey, RndvError> {
        let mut buf = packed;
        if buf.remaining() < HEADER_LEN {
            return Err(RndvError::InvalidKey(format!(
                "packed key of {} bytes is shorter than its header",
                buf.remaining()
            )));
        }
        let tag = buf.get_u8();
        let mem_type = MemoryType::from_tag(tag)
            .ok_or_else(|| RndvError::InvalidKey(format!("unknown memory type tag {}", tag)))?;
        let md_map = Bitmap::from_bits(buf.get_u64_le());
        if md_map.last().is_some_and(|md| md >= MAX_MDS) {
            return Err(RndvError::InvalidKey(format!(
                "domain map {:?} exceeds the maximum of {} domains",
                md_map, MAX_MDS
            )));
        }

        let mut keys = Vec::with_capacity(md_map.count());
        for md in md_map.iter() {
            if buf.remaining() < 2 {
                return Err(RndvError::InvalidKey(format!(
                    "packed key ends before the blob of domain {}",
                    md
                )));
            }
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(RndvError::InvalidKey(format!(
                    "blob of domain {} claims {} bytes, {} left",
                    md,
                    len,
                    buf.remaining()
                )));
            }
            keys.push(buf.split_to(len));
        }
        if buf.has_remaining() {
            return Err(RndvError::InvalidKey(format!(
                "{} trailing bytes after the last key blob",
                buf.remaining()
            )));
        }

        Ok(Rkey {
            mem_type,
            md_map,
            keys,
            cache: None,
            destroyed: false,
        })
    }

    pub fn mem_type(&self) -> MemoryType {
        self.mem_type
    }

    pub fn md_map(&self) -> MdMap {
        self.md_map
    }

    /// The blob at `position` in bitmap order.
    pub fn key_at(&self, position: usize) -> Option<&Bytes> {
        self.keys.get(position)
    }

    /// The blob of remote domain `md`, if the key has one.
    pub fn key_for_md(&self, md: MdIndex) -> Option<&Bytes> {
        if self.md_map.contains(md) {
            self.keys.get(self.md_map.index_of(md))
        } else {
            None
        }
    }

    /// Domains in ascending order paired with their blobs.
    pub fn iter(&self) -> impl Iterator<Item = (MdIndex, &Bytes)> + '_ {
        self.md_map.iter().zip(self.keys.iter())
    }

    /// Finds the first lane of `lanes`, skipping `ignore`, that reaches the
    /// key's memory. Returns the lane and the blob it needs; `None` as the
    /// blob means the lane's domain needs no key.
    ///
    /// `ignore` lets callers alternate lanes, e.g. to send fenced
    /// acknowledgments on a lane other than the one last used.
    pub fn find_rma_lane(
        &self,
        ep: &EpConfig,
        mds: &[MdAttr],
        mem_type: MemoryType,
        lanes: &[LaneIndex],
        ignore: LaneMap,
    ) -> Option<(LaneIndex, Option<Bytes>)> {
        lanes
            .iter()
            .copied()
            .filter(|&lane| !ignore.contains(lane))
            .find_map(|lane| match lane_reach(Some(self), ep, mds, lane, mem_type) {
                LaneReach::NoKey => Some((lane, None)),
                LaneReach::Key(position) => Some((lane, self.keys.get(position).cloned())),
                LaneReach::Unreachable => None,
            })
    }

    /// Resolves the key against `ep`'s current configuration.
    ///
    /// A second call against the same configuration index returns the cached
    /// result without looking at the lanes again. Unreachable results are
    /// cached too.
    ///
    /// # Errors
    ///
    /// Returns `RndvError::Unreachable` if no RMA lane of `ep` can address
    /// any domain of the key.
    pub fn resolve(&mut self, ep: &EpConfig, mds: &[MdAttr]) -> Result<&RkeyCache, RndvError> {
        let stale = self
            .cache
            .as_ref()
            .map_or(true, |cache| cache.ep_cfg_index != ep.index);
        if stale {
            let found = self.find_rma_lane(ep, mds, self.mem_type, &ep.rma_lanes, LaneMap::empty());
            let cache = match found {
                Some((lane, key)) => {
                    let config = ep.lane(lane);
                    let kind = if config.put_zcopy.is_some() || config.get_zcopy.is_some() {
                        RmaKind::Zcopy
                    } else {
                        RmaKind::Bcopy
                    };
                    RkeyCache {
                        ep_cfg_index: ep.index,
                        rma_lane: Some(lane),
                        rma_key: key,
                        kind,
                        max_put_short: config.max_short,
                    }
                }
                None => RkeyCache {
                    ep_cfg_index: ep.index,
                    rma_lane: None,
                    rma_key: None,
                    kind: RmaKind::Bcopy,
                    max_put_short: 0,
                },
            };
            tracing::trace!(
                "[rkey] resolved {:?} against endpoint config {}: lane {:?}",
                self.md_map,
                ep.index,
                cache.rma_lane
            );
            self.cache = Some(cache);
        }
        self.cached_for(ep)
    }

    /// The cached resolution, valid only for the configuration it was
    /// computed against.
    ///
    /// # Errors
    ///
    /// `RndvError::EndpointMismatch` if the key was resolved against another
    /// configuration (or never resolved), `RndvError::Unreachable` if the
    /// cached resolution found no lane.
    pub fn cached_for(&self, ep: &EpConfig) -> Result<&RkeyCache, RndvError> {
        match &self.cache {
            Some(cache) if cache.ep_cfg_index == ep.index => {
                if cache.rma_lane.is_none() {
                    Err(RndvError::Unreachable {
                        cfg_index: ep.index,
                    })
                } else {
                    Ok(cache)
                }
            }
            Some(cache) => Err(RndvError::EndpointMismatch {
                cached: cache.ep_cfg_index,
                current: ep.index,
            }),
            None => Err(RndvError::EndpointMismatch {
                cached: u32::MAX,
                current: ep.index,
            }),
        }
    }

    /// Releases every per-domain handle through the transport.
    pub fn destroy<T: Transport + ?Sized>(self, transport: &mut T) {
        self.destroy_with(|md, key| transport.release_rkey(md, key));
    }

    pub(crate) fn destroy_with(mut self, mut release: impl FnMut(MdIndex, &Bytes)) {
        for (md, key) in self.md_map.iter().zip(self.keys.iter()) {
            release(md, key);
        }
        self.destroyed = true;
    }
}

impl Drop for Rkey {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(
                "[rkey] key for domains {:?} dropped without destroy, leaking {} handles",
                self.md_map,
                self.keys.len()
            );
        }
    }
}
