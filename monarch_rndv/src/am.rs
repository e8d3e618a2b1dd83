/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! DATA fallback for RTR ranges no zero-copy PUT can reach. The sender
//! copies the range into active messages on the control lane; the receiver
//! writes each payload at its offset.

use crate::endpoint::EpConfig;
use crate::endpoint::EpId;
use crate::error::RndvError;
use crate::error::Status;
use crate::memory::Buffer;
use crate::memory::MAX_LANES;
use crate::proto::DataHdr;
use crate::proto::RndvMessage;
use crate::proto::RtrHdr;
use crate::proto::data_header_size;
use crate::request::AmSendState;
use crate::request::FragLeg;
use crate::request::FragPlan;
use crate::request::Progress;
use crate::request::RecvStage;
use crate::request::Request;
use crate::request::RequestHandle;
use crate::request::RequestKind;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::worker::Worker;

impl<T: Transport> Worker<T> {
    /// Streams `range` to the receiver of `rtr` as DATA messages.
    pub(crate) fn start_am_send(
        &mut self,
        h: RequestHandle,
        ep: EpId,
        config: &EpConfig,
        rtr: &RtrHdr,
        range: Buffer,
    ) {
        let lane = config.am_lane;
        let max_bcopy = config.lane(lane).max_bcopy;
        if max_bcopy <= data_header_size() || !range.mem_type.is_cpu_accessible() {
            tracing::warn!(
                "[rndv] req {} has no path for {} bytes of {} memory",
                h,
                range.length,
                range.mem_type
            );
            self.reject_rtr(ep, rtr, Status::Unreachable);
            self.complete_request(h, Status::Unreachable);
            return;
        }
        let child = self.requests.insert(Request::new(
            ep,
            Some(h),
            range,
            RequestKind::AmSend(AmSendState {
                rreq_id: rtr.rreq_id,
                lane,
                max_payload: max_bcopy - data_header_size(),
            }),
        ));
        tracing::debug!("[rndv] req {} streams {} bytes through {}", h, range.length, child);
        self.drive(child);
    }

    /// Sends the next DATA message.
    pub(crate) fn progress_am_send(&mut self, h: RequestHandle) -> Progress {
        let Some(req) = self.requests.get_mut(h) else {
            return Progress::Done;
        };
        let RequestKind::AmSend(am) = &req.kind else {
            return Progress::Done;
        };
        let (lane, rreq_id, max_payload) = (am.lane, am.rreq_id, am.max_payload);

        if req.offset < req.buffer.length {
            let length = max_payload.min(req.buffer.length - req.offset);
            let sent = self
                .transport
                .load(req.buffer.addr + req.offset as u64, length)
                .map_err(RndvError::from)
                .and_then(|payload| {
                    RndvMessage::Data(DataHdr {
                        rreq_id,
                        offset: req.offset as u64,
                        payload,
                    })
                    .encode()
                })
                .and_then(|data| self.transport.am_send(req.ep, lane, data).map_err(RndvError::from));
            match sent {
                Ok(()) => {
                    tracing::trace!(
                        "[rndv] req {} data offset {} len {} to {:#x}",
                        h,
                        req.offset,
                        length,
                        rreq_id
                    );
                    req.advance(length);
                }
                Err(RndvError::Transport(TransportError::NoResource { .. })) => {
                    return self.no_resource(h, lane);
                }
                Err(e) => {
                    tracing::warn!("[rndv] req {} data send failed: {}", h, e);
                    req.fast_forward(e.status());
                }
            }
            if req.offset < req.buffer.length {
                return Progress::InProgress;
            }
        }

        self.finish_child(h);
        Progress::Done
    }

    pub(crate) fn handle_data(&mut self, ep: EpId, data: DataHdr) -> Result<(), RndvError> {
        enum Filled {
            Recv,
            Frag,
        }

        let h = RequestHandle::from_wire(data.rreq_id);
        let Some(req) = self.requests.get_mut(h) else {
            tracing::warn!("[rndv] ep {} data for stale req {:#x}", ep, data.rreq_id);
            return Ok(());
        };
        let offset = data.offset as usize;
        let length = data.payload.len();
        let (target, limit, filled) = match &req.kind {
            RequestKind::Recv(recv) if matches!(recv.stage, RecvStage::RtrSent) => {
                (req.buffer.addr, recv.size, Filled::Recv)
            }
            RequestKind::Frag(frag)
                if frag.plan == FragPlan::RtrThenCopy && frag.leg == FragLeg::Network =>
            {
                match &req.staging {
                    Some(fragment) => (fragment.buffer.addr, req.buffer.length, Filled::Frag),
                    None => return Err(RndvError::UnknownRequest(data.rreq_id)),
                }
            }
            other => {
                tracing::warn!("[rndv] ep {} data for {} {} in wrong state", ep, other.name(), h);
                return Ok(());
            }
        };
        if offset.checked_add(length).map_or(true, |end| end > limit) {
            tracing::error!(
                "[rndv] req {} data at {} len {} overruns {} bytes",
                h,
                offset,
                length,
                limit
            );
            return Err(RndvError::Truncated {
                announced: offset.saturating_add(length),
                capacity: limit,
            });
        }

        if let Err(e) = self.transport.store(target + offset as u64, &data.payload) {
            tracing::warn!("[rndv] req {} cannot store data: {}", h, e);
            req.status = req.status.merge(e.status());
        }
        let received = match &mut req.kind {
            RequestKind::Recv(recv) => {
                recv.received += length;
                recv.received
            }
            RequestKind::Frag(frag) => {
                frag.received += length;
                frag.received
            }
            _ => 0,
        };
        tracing::trace!("[rndv] req {} data offset {} len {}", h, offset, length);
        if received < limit {
            return Ok(());
        }
        match filled {
            Filled::Recv => self.finish_recv(h, Status::Ok, true),
            Filled::Frag => self.frag_leg_done(h, Status::Ok, [0; MAX_LANES]),
        }
        Ok(())
    }
}
