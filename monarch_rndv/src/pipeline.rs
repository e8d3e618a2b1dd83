/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Staged transfers.
//!
//! Memory the network cannot reach (device memory on either side) moves
//! through pooled host fragments. A pipeline cuts its range into fragments
//! and gives each one a staging fragment and two legs:
//!
//! | plan | first leg | second leg |
//! |---|---|---|
//! | get then copy | GET from the peer into staging | copy staging into the user buffer |
//! | rtr then copy | peer PUTs into staging after a fragment RTR | copy staging into the user buffer |
//! | copy then put | copy the user buffer into staging | PUT staging to the peer |
//! | put | PUT host memory directly | |
//!
//! Copy legs are RMA operations on the local endpoint registered for the
//! user buffer's memory type. Fragments finish in any order; the pipeline
//! finishes once every fragment has been issued and has reported back.
//! When the staging pool is dry the pipeline parks itself and resumes once
//! a fragment is released.

use crate::ack::AckState;
use crate::endpoint::EpConfig;
use crate::endpoint::EpId;
use crate::endpoint::RmaOp;
use crate::error::RndvError;
use crate::error::Status;
use crate::memory::Buffer;
use crate::memory::MAX_LANES;
use crate::memory::MemoryType;
use crate::proto::RndvMessage;
use crate::proto::RtrHdr;
use crate::request::FragLeg;
use crate::request::FragPlan;
use crate::request::FragState;
use crate::request::PipelineCursor;
use crate::request::PipelineKind;
use crate::request::Progress;
use crate::request::PutPipelineState;
use crate::request::RecvStage;
use crate::request::RecvState;
use crate::request::Request;
use crate::request::RequestHandle;
use crate::request::RequestKind;
use crate::request::RmaPhase;
use crate::request::RmaPurpose;
use crate::request::RmaState;
use crate::rkey;
use crate::rkey::Rkey;
use crate::transport::Transport;
use crate::worker::ChildDone;
use crate::worker::Worker;
use crate::zcopy::LaneBytes;
use crate::zcopy::StripeLanes;
use crate::zcopy::adjust_zcopy_length;
use crate::zcopy::init_lane_map;

/// Length of the fragment starting at `offset`. Fragments are at most
/// `max` long; when the tail would be shorter than `min`, the fragment
/// before it gives up `min` bytes.
pub(crate) fn fragment_length(offset: usize, total: usize, max: usize, min: usize) -> usize {
    adjust_zcopy_length(min, max, 1, total, offset, total - offset)
}

fn cursor_mut(kind: &mut RequestKind) -> Option<&mut PipelineCursor> {
    match kind {
        RequestKind::Recv(RecvState {
            stage: RecvStage::Pipeline(cursor),
            ..
        }) => Some(cursor),
        RequestKind::PutPipeline(pipeline) => Some(&mut pipeline.cursor),
        _ => None,
    }
}

/// Everything a fragment leg needs, copied out of the request.
struct Leg {
    ep: EpId,
    parent: Option<RequestHandle>,
    plan: FragPlan,
    leg: FragLeg,
    /// Offset of the fragment in its pipeline's range.
    offset: usize,
    region: Buffer,
    staging: Option<Buffer>,
    remote_address: u64,
    lanes: Option<StripeLanes>,
}

impl<T: Transport> Worker<T> {
    fn pipeline_cursor(&mut self, h: RequestHandle) -> Option<&mut PipelineCursor> {
        self.requests
            .get_mut(h)
            .and_then(|req| cursor_mut(&mut req.kind))
    }

    /// Lanes a sender pipeline PUTs over, or `None` if a PUT pipeline is not
    /// possible towards this peer.
    pub(crate) fn put_pipeline_lanes(
        &self,
        config: &EpConfig,
        rkey: Option<&Rkey>,
        mem_type: MemoryType,
    ) -> Option<StripeLanes> {
        if !self.has_host_bw_lane(config) {
            return None;
        }
        if !mem_type.is_host() && self.mem_type_ep(mem_type).is_none() {
            return None;
        }
        config.rndv_zcopy(RmaOp::Put)?;
        // Fragments leave from host memory: the user buffer or staging.
        let lanes = init_lane_map(
            config,
            &self.mds,
            rkey,
            MemoryType::Host,
            RmaOp::Put,
            self.config.multi_lane_max_ratio,
        );
        (!lanes.is_empty()).then_some(lanes)
    }

    /// PUTs one RTR range in fragments.
    pub(crate) fn start_put_pipeline(
        &mut self,
        h: RequestHandle,
        ep: EpId,
        rtr: &RtrHdr,
        range: Buffer,
        rkey: Option<Rkey>,
        lanes: StripeLanes,
    ) {
        let cursor = PipelineCursor {
            kind: PipelineKind::SendPut,
            total: range.length,
            next_offset: 0,
            remaining: range.length,
            max_frag: self.config.frag_size.min(lanes.max_zcopy),
            min_frag: lanes.min_zcopy,
            remote_address: rtr.address,
            lanes: Some(lanes),
            in_flight: 0,
            status: Status::Ok,
            issuing: false,
        };
        let mut child = Request::new(
            ep,
            Some(h),
            range,
            RequestKind::PutPipeline(PutPipelineState {
                rreq_id: rtr.rreq_id,
                fragment: rtr.fragment,
                cursor,
                lane_bytes: [0; MAX_LANES],
                ack: None,
            }),
        );
        child.rkey = rkey;
        let child = self.requests.insert(child);
        tracing::debug!(
            "[rndv] req {} pipelines {} bytes of {} memory through {}",
            h,
            range.length,
            range.mem_type,
            child
        );
        self.drive(child);
    }

    /// Issues fragments until the range is covered, staging runs out or an
    /// error stops the pipeline.
    pub(crate) fn progress_pipeline(&mut self, h: RequestHandle) -> Progress {
        match self.pipeline_cursor(h) {
            Some(cursor) => cursor.issuing = true,
            None => return Progress::Done,
        }
        self.issue_fragments(h);
        let Some(cursor) = self.pipeline_cursor(h) else {
            return Progress::Done;
        };
        cursor.issuing = false;
        if (cursor.issued_all() || !cursor.status.is_ok()) && cursor.in_flight == 0 {
            return self.pipeline_done(h);
        }
        Progress::Done
    }

    fn issue_fragments(&mut self, h: RequestHandle) {
        loop {
            let Some(req) = self.requests.get(h) else {
                return;
            };
            let cursor = match &req.kind {
                RequestKind::Recv(RecvState {
                    stage: RecvStage::Pipeline(cursor),
                    ..
                }) => cursor,
                RequestKind::PutPipeline(pipeline) => &pipeline.cursor,
                _ => return,
            };
            if cursor.issued_all() || !cursor.status.is_ok() {
                return;
            }
            let offset = cursor.next_offset;
            let length = fragment_length(offset, cursor.total, cursor.max_frag, cursor.min_frag);
            let plan = match cursor.kind {
                PipelineKind::RecvGet => FragPlan::GetThenCopy,
                PipelineKind::RecvRtr => FragPlan::RtrThenCopy,
                PipelineKind::SendPut if req.buffer.mem_type.is_host() => FragPlan::Put,
                PipelineKind::SendPut => FragPlan::CopyThenPut,
            };
            let remote_address = cursor.remote_address + offset as u64;
            let lanes = cursor.lanes.as_ref().map(StripeLanes::fresh);
            let (ep, region) = (req.ep, req.buffer.slice(offset, length));

            let staging = if plan == FragPlan::Put {
                None
            } else {
                match self.staging.acquire(&mut self.transport) {
                    Ok(Some(fragment)) => Some(fragment),
                    Ok(None) => {
                        self.defer(h);
                        return;
                    }
                    Err(e) => {
                        tracing::error!("[rndv] req {} cannot get a staging fragment: {}", h, e);
                        if let Some(cursor) = self.pipeline_cursor(h) {
                            cursor.status = cursor.status.merge(e.status());
                        }
                        return;
                    }
                }
            };
            if let Some(cursor) = self.pipeline_cursor(h) {
                cursor.next_offset += length;
                cursor.in_flight += 1;
            }

            let mut frag = Request::new(
                ep,
                Some(h),
                region,
                RequestKind::Frag(FragState {
                    plan,
                    offset,
                    leg: FragState::first_leg(plan),
                    leg_started: false,
                    received: 0,
                    remote_address,
                    lanes,
                    lane_bytes: [0; MAX_LANES],
                }),
            );
            frag.staging = staging;
            let f = self.requests.insert(frag);
            tracing::trace!(
                "[rndv] req {} fragment {} at offset {} len {} ({:?})",
                h,
                f,
                offset,
                length,
                plan
            );
            self.drive(f);
        }
    }

    /// Closes a pipeline whose fragments have all reported back.
    fn pipeline_done(&mut self, h: RequestHandle) -> Progress {
        let Some(req) = self.requests.get_mut(h) else {
            return Progress::Done;
        };
        let ep = req.ep;
        match &mut req.kind {
            RequestKind::Recv(RecvState {
                stage: RecvStage::Pipeline(cursor),
                ..
            }) => {
                let status = cursor.status;
                tracing::debug!("[rndv] req {} pipeline of {} bytes done: {}", h, cursor.total, status);
                self.finish_recv(h, status, true);
                Progress::Done
            }
            RequestKind::PutPipeline(pipeline) => {
                let Some(config) = self.endpoints.get(&ep).map(|ep| ep.config.clone()) else {
                    self.finish_child(h);
                    return Progress::Done;
                };
                let status = pipeline.cursor.status.merge(req.status);
                pipeline.ack = Some(AckState::new(
                    pipeline.rreq_id,
                    status,
                    pipeline.lane_bytes,
                    pipeline.cursor.total,
                    &config,
                    self.config.put_force_flush,
                ));
                Progress::InProgress
            }
            _ => Progress::Done,
        }
    }

    pub(crate) fn pipeline_fragment_done(&mut self, parent: RequestHandle, done: ChildDone) {
        let Some(req) = self.requests.get_mut(parent) else {
            return;
        };
        if let RequestKind::PutPipeline(pipeline) = &mut req.kind {
            for (sum, bytes) in pipeline.lane_bytes.iter_mut().zip(done.lane_bytes) {
                *sum += bytes;
            }
        }
        let Some(cursor) = cursor_mut(&mut req.kind) else {
            return;
        };
        cursor.in_flight = cursor.in_flight.saturating_sub(1);
        cursor.remaining = cursor.remaining.saturating_sub(done.length);
        cursor.status = cursor.status.merge(done.status);
        tracing::trace!(
            "[rndv] req {} fragment of {} bytes done, {} bytes remaining: {}",
            parent,
            done.length,
            cursor.remaining,
            done.status
        );
        if !cursor.issuing {
            self.drive(parent);
        }
    }

    /// Starts the current leg of a fragment.
    pub(crate) fn progress_frag(&mut self, h: RequestHandle) -> Progress {
        let Some(req) = self.requests.get_mut(h) else {
            return Progress::Done;
        };
        let RequestKind::Frag(frag) = &mut req.kind else {
            return Progress::Done;
        };
        if frag.leg_started {
            return Progress::Done;
        }
        frag.leg_started = true;
        let leg = Leg {
            ep: req.ep,
            parent: req.parent,
            plan: frag.plan,
            leg: frag.leg,
            offset: frag.offset,
            region: req.buffer,
            staging: req
                .staging
                .as_ref()
                .map(|fragment| fragment.buffer.slice(0, req.buffer.length)),
            remote_address: frag.remote_address,
            lanes: frag.lanes.clone(),
        };
        let started = match leg.leg {
            FragLeg::Network => self.start_network_leg(h, leg),
            FragLeg::Copy => self.start_copy_leg(h, leg),
        };
        if let Err(e) = started {
            tracing::warn!("[rndv] req {} fragment leg failed to start: {}", h, e);
            self.frag_leg_done(h, e.status(), [0; MAX_LANES]);
        }
        Progress::Done
    }

    fn staging_of(&self, leg: &Leg) -> Result<Buffer, RndvError> {
        leg.staging.ok_or(RndvError::PoolExhausted {
            capacity: self.config.max_staging_frags,
        })
    }

    fn start_network_leg(&mut self, h: RequestHandle, leg: Leg) -> Result<(), RndvError> {
        let (op, local) = match leg.plan {
            FragPlan::RtrThenCopy => return self.send_fragment_rtr(h, &leg),
            FragPlan::GetThenCopy => (RmaOp::Get, self.staging_of(&leg)?),
            FragPlan::CopyThenPut => (RmaOp::Put, self.staging_of(&leg)?),
            FragPlan::Put => (RmaOp::Put, leg.region),
        };
        let Some(lanes) = leg.lanes else {
            return Err(RndvError::Unreachable {
                cfg_index: self.ep_config(leg.ep)?.index,
            });
        };
        self.start_leg_rma(h, leg.ep, op, local, leg.remote_address, lanes);
        Ok(())
    }

    /// Asks the sender to PUT one fragment into staging.
    fn send_fragment_rtr(&mut self, h: RequestHandle, leg: &Leg) -> Result<(), RndvError> {
        let staging = self.staging_of(leg)?;
        let sreq_id = match leg.parent.and_then(|parent| self.requests.get(parent)) {
            Some(Request {
                kind: RequestKind::Recv(recv),
                ..
            }) => recv.sreq_id,
            _ => return Err(RndvError::UnknownRequest(h.to_wire())),
        };
        let keys = match self.requests.get(h).and_then(|req| req.staging.as_ref()) {
            Some(fragment) => self.transport.pack_memh(self.staging.memh(fragment))?,
            None => return Err(RndvError::UnknownRequest(h.to_wire())),
        };
        let rtr = RndvMessage::Rtr(RtrHdr {
            sreq_id,
            rreq_id: h.to_wire(),
            address: staging.addr,
            size: leg.region.length as u64,
            offset: leg.offset as u64,
            fragment: true,
            rkey: Some(rkey::pack(MemoryType::Host, &keys)?),
        });
        tracing::trace!(
            "[rndv] req {} fragment rtr for {} bytes at {}",
            h,
            leg.region.length,
            leg.offset
        );
        self.send_ctrl(leg.ep, Some(h), &rtr)
    }

    /// Moves a fragment between staging and the user buffer on the local
    /// endpoint of the user buffer's memory type.
    fn start_copy_leg(&mut self, h: RequestHandle, leg: Leg) -> Result<(), RndvError> {
        let staging = self.staging_of(&leg)?;
        let mem_type = leg.region.mem_type;
        let copy_ep = self.mem_type_ep(mem_type).ok_or_else(|| {
            RndvError::InvalidConfig(format!("no copy endpoint for {} memory", mem_type))
        })?;
        let config = self.ep_config(copy_ep)?;
        // Receive side writes staging out, send side reads into staging.
        let op = match leg.plan {
            FragPlan::CopyThenPut => RmaOp::Get,
            _ => RmaOp::Put,
        };
        let lanes = init_lane_map(
            &config,
            &self.mds,
            None,
            MemoryType::Host,
            op,
            self.config.multi_lane_max_ratio,
        );
        if lanes.is_empty() {
            return Err(RndvError::Unreachable {
                cfg_index: config.index,
            });
        }
        self.start_leg_rma(h, copy_ep, op, staging, leg.region.addr, lanes);
        Ok(())
    }

    fn start_leg_rma(
        &mut self,
        h: RequestHandle,
        ep: EpId,
        op: RmaOp,
        local: Buffer,
        remote_address: u64,
        lanes: StripeLanes,
    ) {
        let child = self.requests.insert(Request::new(
            ep,
            Some(h),
            local,
            RequestKind::Rma(RmaState {
                op,
                remote_address,
                lanes,
                purpose: RmaPurpose::FragLeg,
                phase: RmaPhase::Data,
            }),
        ));
        self.drive(child);
    }

    /// Records the end of a fragment's current leg and starts the next one.
    pub(crate) fn frag_leg_done(&mut self, h: RequestHandle, status: Status, lane_bytes: LaneBytes) {
        let Some(req) = self.requests.get_mut(h) else {
            return;
        };
        req.status = req.status.merge(status);
        let ok = req.status.is_ok();
        let RequestKind::Frag(frag) = &mut req.kind else {
            return;
        };
        if frag.leg == FragLeg::Network {
            for (sum, bytes) in frag.lane_bytes.iter_mut().zip(lane_bytes) {
                *sum += bytes;
            }
        }
        match FragState::next_leg(frag.plan, frag.leg).filter(|_| ok) {
            Some(next) => {
                frag.leg = next;
                frag.leg_started = false;
                self.drive(h);
            }
            None => self.finish_child(h),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn tile(total: usize, max: usize, min: usize) -> Vec<(usize, usize)> {
        let mut fragments = Vec::new();
        let mut offset = 0;
        while offset < total {
            let length = fragment_length(offset, total, max, min);
            fragments.push((offset, length));
            offset += length;
        }
        fragments
    }

    #[test]
    fn test_even_split() {
        assert_eq!(
            tile(1 << 20, 256 << 10, 0),
            vec![
                (0, 256 << 10),
                (256 << 10, 256 << 10),
                (512 << 10, 256 << 10),
                (768 << 10, 256 << 10)
            ]
        );
    }

    #[test]
    fn test_short_tail_borrows_from_previous_fragment() {
        // 900 = 400 + 400 + 100, but 100 < min: the second fragment gives
        // up `min` bytes so the last one is long enough.
        assert_eq!(tile(900, 400, 150), vec![(0, 400), (400, 250), (650, 250)]);
    }

    proptest! {
        #[test]
        fn test_fragments_tile_the_range(
            total in 1usize..(8 << 20),
            max in 4096usize..(1 << 20),
            min_div in 2usize..16,
        ) {
            let min = max / min_div;
            let fragments = tile(total, max, min);
            let mut next = 0;
            for (i, &(offset, length)) in fragments.iter().enumerate() {
                prop_assert_eq!(offset, next);
                prop_assert!(length <= max, "fragment {} is {} bytes", i, length);
                prop_assert!(length >= min.min(total));
                next = offset + length;
            }
            prop_assert_eq!(next, total);
        }
    }
}
