/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Acknowledging a PUT to its receiver.
//!
//! The receiver may only touch the data once every byte put is remotely
//! visible. Two ways get there:
//!
//! - **Flush then ack**: flush every lane that carried data, wait for the
//!   flushes, then send one ATP for the whole range on the control lane.
//! - **Fenced ack**: on every lane that carried data, fence and send an ATP
//!   for that lane's bytes on the lane itself. The fence orders the ATP
//!   behind the data, so no round trip is needed. Only possible when every
//!   such lane can carry the ATP.
//!
//! The receiver sums ATP sizes and completes once the whole range is acked,
//! so a fenced ack over several lanes still closes the transfer exactly once.

use crate::endpoint::EpConfig;
use crate::error::Status;
use crate::memory::LaneMap;
use crate::proto::AckHdr;
use crate::proto::RndvMessage;
use crate::proto::ack_wire_size;
use crate::request::Progress;
use crate::request::RequestHandle;
use crate::request::RequestKind;
use crate::request::RmaPhase;
use crate::transport::Issued;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::worker::Worker;
use crate::zcopy::LaneBytes;

#[derive(Debug, Clone)]
pub(crate) struct AckState {
    /// The peer request the ATP goes to.
    pub req_id: u64,
    pub status: Status,
    pub fenced: bool,
    /// Lanes still to flush.
    pub flush_map: LaneMap,
    /// Lanes still to carry a fenced ATP.
    pub atp_map: LaneMap,
    pub lane_bytes: LaneBytes,
    pub total: usize,
}

impl AckState {
    pub fn new(
        req_id: u64,
        status: Status,
        lane_bytes: LaneBytes,
        total: usize,
        ep: &EpConfig,
        force_flush: bool,
    ) -> Self {
        let used: LaneMap = lane_bytes
            .iter()
            .enumerate()
            .filter(|(_, bytes)| **bytes > 0)
            .map(|(lane, _)| lane)
            .collect();
        let fenced = !force_flush
            && !used.is_empty()
            && used.iter().all(|lane| ep.lane(lane).can_send_am(ack_wire_size()));
        Self {
            req_id,
            status,
            fenced,
            flush_map: if fenced { LaneMap::empty() } else { used },
            atp_map: if fenced { used } else { LaneMap::empty() },
            lane_bytes,
            total,
        }
    }

    fn atp(&self, size: usize) -> RndvMessage {
        RndvMessage::Atp(AckHdr {
            req_id: self.req_id,
            status: self.status,
            size: size as u64,
        })
    }
}

fn ack_state(kind: &mut RequestKind) -> Option<&mut AckState> {
    match kind {
        RequestKind::Rma(rma) => match &mut rma.phase {
            RmaPhase::Ack(ack) => Some(ack),
            RmaPhase::Data => None,
        },
        RequestKind::PutPipeline(pipeline) => pipeline.ack.as_mut(),
        _ => None,
    }
}

impl<T: Transport> Worker<T> {
    /// Advances the acknowledgment of a finished PUT.
    pub(crate) fn progress_ack(&mut self, h: RequestHandle) -> Progress {
        let Some(req) = self.requests.get_mut(h) else {
            return Progress::Done;
        };
        let ep = req.ep;
        let Some(ack) = ack_state(&mut req.kind) else {
            return Progress::Done;
        };

        if ack.fenced {
            while let Some(lane) = ack.atp_map.first() {
                if let Err(e) = self.transport.fence(ep, lane) {
                    if let TransportError::NoResource { .. } = e {
                        return self.no_resource(h, lane);
                    }
                    tracing::warn!("[rndv] req {} fence on lane {} failed: {}", h, lane, e);
                    ack.status = ack.status.merge(e.status());
                }
                let data = match ack.atp(ack.lane_bytes[lane]).encode() {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::error!("[rndv] req {} cannot encode atp: {}", h, e);
                        ack.atp_map.remove(lane);
                        continue;
                    }
                };
                match self.transport.am_send(ep, lane, data) {
                    Ok(()) => {
                        tracing::debug!(
                            "[rndv] req {} fenced atp of {} bytes on lane {} to {:#x}",
                            h,
                            ack.lane_bytes[lane],
                            lane,
                            ack.req_id
                        );
                    }
                    Err(TransportError::NoResource { .. }) => return self.no_resource(h, lane),
                    Err(e) => {
                        tracing::warn!("[rndv] req {} atp on lane {} failed: {}", h, lane, e);
                    }
                }
                ack.atp_map.remove(lane);
            }
        } else {
            while let Some(lane) = ack.flush_map.first() {
                match self.transport.flush(ep, lane, h.token()) {
                    Ok(Issued::Done) => {}
                    Ok(Issued::InProgress) => req.completion_count += 1,
                    Err(TransportError::NoResource { .. }) => return self.no_resource(h, lane),
                    Err(e) => {
                        tracing::warn!("[rndv] req {} flush on lane {} failed: {}", h, lane, e);
                        ack.status = ack.status.merge(e.status());
                    }
                }
                ack.flush_map.remove(lane);
            }
            if req.completion_count > 0 {
                return Progress::Done;
            }
            // Flush completions may have carried errors.
            let status = ack.status.merge(req.status);
            ack.status = status;
            let message = ack.atp(ack.total);
            tracing::debug!(
                "[rndv] req {} flushed, atp of {} bytes to {:#x}: {}",
                h,
                ack.total,
                ack.req_id,
                status
            );
            if let Err(e) = self.send_ctrl(ep, Some(h), &message) {
                tracing::warn!("[rndv] req {} cannot send atp: {}", h, e);
            }
        }

        self.finish_child(h);
        Progress::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::LaneConfig;
    use crate::endpoint::ZcopyLimits;
    use crate::memory::MAX_LANES;
    use crate::memory::MdMap;

    fn config(max_short: &[usize]) -> EpConfig {
        let lanes: Vec<_> = max_short
            .iter()
            .enumerate()
            .map(|(i, &short)| LaneConfig {
                md_index: Some(i),
                dst_md_index: i,
                bandwidth: 1e9,
                get_zcopy: None,
                put_zcopy: Some(ZcopyLimits::new(1, 1 << 30)),
                max_short: short,
                max_bcopy: 0,
            })
            .collect();
        let all: Vec<usize> = (0..lanes.len()).collect();
        EpConfig {
            index: 1,
            lanes,
            am_lane: 0,
            rma_lanes: all.clone(),
            rma_bw_lanes: all,
            rkey_ptr_dst_mds: MdMap::empty(),
            rndv_split: true,
        }
    }

    fn bytes(per_lane: &[(usize, usize)]) -> LaneBytes {
        let mut bytes = [0; MAX_LANES];
        for &(lane, n) in per_lane {
            bytes[lane] = n;
        }
        bytes
    }

    #[test]
    fn test_fenced_when_all_used_lanes_carry_am() {
        let ep = config(&[256, 0, 256]);
        let ack = AckState::new(7, Status::Ok, bytes(&[(0, 100), (2, 50)]), 150, &ep, false);
        assert!(ack.fenced);
        assert_eq!(ack.atp_map.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(ack.flush_map.is_empty());
    }

    #[test]
    fn test_flush_when_a_used_lane_cannot_carry_am() {
        let ep = config(&[256, 0, 256]);
        let ack = AckState::new(7, Status::Ok, bytes(&[(0, 100), (1, 50)]), 150, &ep, false);
        assert!(!ack.fenced);
        assert_eq!(ack.flush_map.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(ack.atp_map.is_empty());
    }

    #[test]
    fn test_force_flush_and_empty_transfer() {
        let ep = config(&[256, 256]);
        let forced = AckState::new(7, Status::Ok, bytes(&[(0, 10), (1, 10)]), 20, &ep, true);
        assert!(!forced.fenced);
        let empty = AckState::new(7, Status::Ok, bytes(&[]), 0, &ep, false);
        assert!(!empty.fenced);
        assert!(empty.flush_map.is_empty());
    }
}
