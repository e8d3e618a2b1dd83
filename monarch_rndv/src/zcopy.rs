/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Zero-copy striping.
//!
//! One transfer is cut into chunks and spread over the lanes that reach the
//! peer buffer. Each lane gets a share of the transfer proportional to its
//! bandwidth; lanes much slower than the fastest are left out. Chunks are
//! issued round robin over the selected lanes, one chunk per step, and the
//! request completes when every chunk is issued and every outstanding
//! operation has reported back.

use bytes::Bytes;

use crate::endpoint::EpConfig;
use crate::endpoint::MdAttr;
use crate::endpoint::RmaOp;
use crate::memory::Bitmap;
use crate::memory::LaneIndex;
use crate::memory::LaneMap;
use crate::memory::MAX_LANES;
use crate::memory::MemoryType;
use crate::request::Progress;
use crate::request::RequestHandle;
use crate::request::RequestKind;
use crate::request::RmaPhase;
use crate::request::RmaPurpose;
use crate::rkey::LaneReach;
use crate::rkey::Rkey;
use crate::rkey::lane_reach;
use crate::transport::Issued;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::worker::Worker;

/// Bytes moved per lane index.
pub(crate) type LaneBytes = [usize; MAX_LANES];

#[derive(Debug, Clone)]
pub(crate) struct StripeLane {
    pub lane: LaneIndex,
    /// Key blob for the lane's remote domain, `None` if the lane needs none.
    pub key: Option<Bytes>,
    /// Share of the transfer relative to an even split.
    pub scale: f64,
    pub align: usize,
    pub align_mtu: usize,
    pub bytes: usize,
}

/// The lanes one transfer is striped over, and the round-robin cursor.
#[derive(Debug, Clone)]
pub(crate) struct StripeLanes {
    slots: Vec<StripeLane>,
    all: Bitmap,
    avail: Bitmap,
    pub min_zcopy: usize,
    pub max_zcopy: usize,
}

impl StripeLanes {
    pub fn empty() -> Self {
        Self {
            slots: Vec::new(),
            all: Bitmap::empty(),
            avail: Bitmap::empty(),
            min_zcopy: 0,
            max_zcopy: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next chunk goes to.
    pub fn current(&self) -> usize {
        self.avail.first().unwrap_or(0)
    }

    pub fn slot(&self, slot: usize) -> &StripeLane {
        &self.slots[slot]
    }

    /// Records `length` bytes on `slot` and moves to the next lane,
    /// starting over after the last one.
    pub fn advance(&mut self, slot: usize, length: usize) {
        self.slots[slot].bytes += length;
        let bits = self.avail.bits();
        self.avail = Bitmap::from_bits(bits & bits.wrapping_sub(1));
        if self.avail.is_empty() {
            self.avail = self.all;
        }
    }

    pub fn lanes(&self) -> LaneMap {
        self.slots.iter().map(|s| s.lane).collect()
    }

    pub fn lane_bytes(&self) -> LaneBytes {
        let mut bytes = [0; MAX_LANES];
        for slot in &self.slots {
            bytes[slot.lane] += slot.bytes;
        }
        bytes
    }

    /// The same lane selection with the cursor and byte counts reset, for
    /// another transfer through the same key.
    pub fn fresh(&self) -> StripeLanes {
        let mut lanes = self.clone();
        for slot in &mut lanes.slots {
            slot.bytes = 0;
        }
        lanes.avail = lanes.all;
        lanes
    }
}

/// Selects the lanes of `ep` that can run zero-copy `op` against the memory
/// behind `rkey`, with local memory of `mem_type`. Lanes whose bandwidth is
/// below the fastest lane's divided by `max_ratio` are dropped when more
/// than one lane qualifies.
pub(crate) fn init_lane_map(
    ep: &EpConfig,
    mds: &[MdAttr],
    rkey: Option<&Rkey>,
    mem_type: MemoryType,
    op: RmaOp,
    max_ratio: f64,
) -> StripeLanes {
    let Some(zcopy) = ep.rndv_zcopy(op) else {
        return StripeLanes::empty();
    };

    let mut candidates = Vec::new();
    for lane in ep.rndv_lanes(op) {
        let Some(limits) = ep.limits(lane, op) else {
            continue;
        };
        let key = match lane_reach(rkey, ep, mds, lane, mem_type) {
            LaneReach::NoKey => None,
            LaneReach::Key(position) => match rkey.and_then(|k| k.key_at(position)) {
                Some(blob) => Some(blob.clone()),
                None => continue,
            },
            LaneReach::Unreachable => continue,
        };
        candidates.push((lane, key, limits));
    }

    if candidates.len() > 1 {
        let max_bw = candidates
            .iter()
            .map(|(lane, _, _)| ep.lane(*lane).bandwidth)
            .fold(0.0, f64::max);
        candidates.retain(|(lane, _, _)| ep.lane(*lane).bandwidth / max_bw >= 1.0 / max_ratio);
    }

    let total_bw: f64 = candidates
        .iter()
        .map(|(lane, _, _)| ep.lane(*lane).bandwidth)
        .sum();
    let count = candidates.len() as f64;
    let slots: Vec<StripeLane> = candidates
        .into_iter()
        .map(|(lane, key, limits)| StripeLane {
            lane,
            key,
            scale: if total_bw > 0.0 {
                ep.lane(lane).bandwidth * count / total_bw
            } else {
                1.0
            },
            align: limits.align.max(1),
            align_mtu: limits.align_mtu,
            bytes: 0,
        })
        .collect();
    let all: Bitmap = (0..slots.len()).collect();
    StripeLanes {
        slots,
        all,
        avail: all,
        min_zcopy: zcopy.min,
        max_zcopy: zcopy.max,
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Adjusts a proposed chunk so that it stays within `[min, max]` and never
/// leaves a nonzero tail shorter than `min`: a short tail is folded into the
/// chunk if it still fits under `max`, otherwise the chunk gives back
/// `max(min, align)` bytes so the next round is long enough.
///
/// The result is always between 1 and the bytes remaining after `offset`.
pub(crate) fn adjust_zcopy_length(
    min: usize,
    max: usize,
    align: usize,
    send_length: usize,
    offset: usize,
    length: usize,
) -> usize {
    let remaining = send_length - offset;
    let mut result = length.max(min).min(max);
    let tail = send_length.saturating_sub(offset + result);
    if tail != 0 && tail < min {
        if result < max.saturating_sub(tail) {
            result += tail;
        } else {
            result = result.saturating_sub(min.max(align));
        }
    }
    result.clamp(1, remaining.max(1))
}

/// Length of the chunk `slot` carries at `offset` of a transfer of `length`
/// bytes starting at `addr`.
pub(crate) fn chunk_length(
    lanes: &StripeLanes,
    slot: usize,
    addr: u64,
    length: usize,
    offset: usize,
) -> usize {
    let stripe = &lanes.slots[slot];
    let misalign = (addr % stripe.align as u64) as usize;
    let proposed = if offset == 0 && misalign > 0 && length > stripe.align_mtu {
        stripe.align_mtu - misalign
    } else {
        let share = ((length / lanes.count()) as f64 * stripe.scale) as usize;
        align_up(share, stripe.align).min(length - offset)
    };
    adjust_zcopy_length(
        lanes.min_zcopy,
        lanes.max_zcopy,
        stripe.align,
        length,
        offset,
        proposed,
    )
}

/// The `(lane, offset, length)` sequence a transfer is cut into.
#[cfg(test)]
pub(crate) fn plan_chunks(
    lanes: &StripeLanes,
    addr: u64,
    length: usize,
) -> Vec<(LaneIndex, usize, usize)> {
    let mut lanes = lanes.fresh();
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < length {
        let slot = lanes.current();
        let len = chunk_length(&lanes, slot, addr, length, offset);
        chunks.push((lanes.slot(slot).lane, offset, len));
        lanes.advance(slot, len);
        offset += len;
    }
    chunks
}

impl<T: Transport> Worker<T> {
    /// Issues the next chunk of a striped transfer.
    pub(crate) fn progress_rma(&mut self, h: RequestHandle) -> Progress {
        let Some(req) = self.requests.get_mut(h) else {
            return Progress::Done;
        };
        let RequestKind::Rma(rma) = &mut req.kind else {
            return Progress::Done;
        };

        if req.offset < req.buffer.length {
            let slot = rma.lanes.current();
            let length = chunk_length(&rma.lanes, slot, req.buffer.addr, req.buffer.length, req.offset);
            let local = req.buffer.slice(req.offset, length);
            let remote = rma.remote_address + req.offset as u64;
            let stripe = rma.lanes.slot(slot);
            let lane = stripe.lane;
            let result = match rma.op {
                RmaOp::Get => self.transport.get_zcopy(
                    req.ep,
                    lane,
                    local,
                    remote,
                    stripe.key.as_ref(),
                    h.token(),
                ),
                RmaOp::Put => self.transport.put_zcopy(
                    req.ep,
                    lane,
                    local,
                    remote,
                    stripe.key.as_ref(),
                    h.token(),
                ),
            };
            match result {
                Ok(issued) => {
                    tracing::trace!(
                        "[rndv] req {} {:?} offset {} len {} lane {} remote {:#x}",
                        h,
                        rma.op,
                        req.offset,
                        length,
                        lane,
                        remote
                    );
                    if issued == Issued::InProgress {
                        req.completion_count += 1;
                    }
                    rma.lanes.advance(slot, length);
                    req.offset += length;
                }
                Err(TransportError::NoResource { .. }) => return self.no_resource(h, lane),
                Err(e) => {
                    tracing::warn!(
                        "[rndv] req {} {:?} on lane {} failed: {}",
                        h,
                        rma.op,
                        lane,
                        e
                    );
                    req.fast_forward(e.status());
                }
            }
            if req.offset < req.buffer.length {
                return Progress::InProgress;
            }
        }

        if req.completion_count > 0 {
            return Progress::Done;
        }
        self.rma_data_done(h)
    }

    /// Every chunk is issued and complete: acknowledge a PUT, or hand the
    /// result to the parent.
    fn rma_data_done(&mut self, h: RequestHandle) -> Progress {
        let Some(req) = self.requests.get_mut(h) else {
            return Progress::Done;
        };
        let RequestKind::Rma(rma) = &mut req.kind else {
            return Progress::Done;
        };
        match rma.purpose {
            RmaPurpose::SendPut { rreq_id, .. } => {
                let Some(config) = self.endpoints.get(&req.ep).map(|ep| ep.config.clone()) else {
                    self.finish_child(h);
                    return Progress::Done;
                };
                let ack = crate::ack::AckState::new(
                    rreq_id,
                    req.status,
                    rma.lanes.lane_bytes(),
                    req.buffer.length,
                    &config,
                    self.config.put_force_flush,
                );
                rma.phase = RmaPhase::Ack(ack);
                Progress::InProgress
            }
            RmaPurpose::RecvGet | RmaPurpose::FragLeg => {
                tracing::trace!(
                    "[rndv] req {} {:?} of {} bytes done: {}",
                    h,
                    rma.op,
                    req.buffer.length,
                    req.status
                );
                self.finish_child(h);
                Progress::Done
            }
        }
    }
}
