/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-flight requests.
//!
//! Requests live in a `RequestArena` owned by the worker and are addressed by
//! `RequestHandle`s. A handle carries the generation of its slot, so a handle
//! (or a wire id minted from one) that outlives its request never aliases a
//! newer request in the same slot.
//!
//! Sub-requests point at their parent by handle. A parent never holds
//! references into its children; it only counts them, so children can be
//! freed in any order.

use serde::Deserialize;
use serde::Serialize;

use crate::ack::AckState;
use crate::endpoint::EpId;
use crate::endpoint::RmaOp;
use crate::error::Status;
use crate::memory::Buffer;
use crate::memory::LaneIndex;
use crate::memory::MemHandle;
use crate::proto::RtsOrigin;
use crate::rkey::Rkey;
use crate::staging::StagingFragment;
use crate::transport::CompletionToken;
use crate::zcopy::LaneBytes;
use crate::zcopy::StripeLanes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestHandle {
    index: u32,
    generation: u32,
}

impl RequestHandle {
    /// The id sent to the peer, which echoes it back in replies.
    pub fn to_wire(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_wire(id: u64) -> Self {
        Self {
            index: id as u32,
            generation: (id >> 32) as u32,
        }
    }

    pub(crate) fn token(self) -> CompletionToken {
        CompletionToken(self.to_wire())
    }

    pub(crate) fn from_token(token: CompletionToken) -> Self {
        Self::from_wire(token.0)
    }
}

impl std::fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}.{:x}", self.index, self.generation)
    }
}

/// How a request reacts to further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Nothing left to issue right now (finished, waiting on completions,
    /// or parked on another lane's pending queue).
    Done,
    /// More can be issued immediately.
    InProgress,
    /// Still queued on the lane it was retried from.
    NoResource,
}

pub(crate) struct SendState {
    pub stage: SendStage,
    /// Bytes of RTR ranges fully delivered.
    pub delivered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendStage {
    /// RTS sent, no RTR or ATS yet.
    RtsSent,
    /// Data handed over; the ATS closes the transfer.
    AwaitAts,
}

pub(crate) struct RecvState {
    pub origin: RtsOrigin,
    pub tag: u64,
    /// The peer's send request, known once an RTS matched.
    pub sreq_id: u64,
    /// Announced message size.
    pub size: usize,
    pub stage: RecvStage,
    /// Bytes confirmed by ATP or DATA.
    pub received: usize,
}

pub(crate) enum RecvStage {
    Posted,
    /// A striped GET child is reading the message.
    GetZcopy,
    /// Copying from a mapped peer pointer, one segment per progress call.
    RkeyPtr { remote_ptr: u64 },
    /// RTR sent; the peer PUTs or streams DATA.
    RtrSent,
    /// Data arrives through staging fragments.
    Pipeline(PipelineCursor),
}

/// Which way a pipeline moves data and how its fragments are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineKind {
    /// Receiver GETs each fragment into staging, then copies it out.
    RecvGet,
    /// Receiver sends one RTR per staging fragment.
    RecvRtr,
    /// Sender PUTs each fragment, staging it first when the source is not
    /// host memory.
    SendPut,
}

/// Issue and completion bookkeeping of a fragmented transfer.
#[derive(Debug, Clone)]
pub(crate) struct PipelineCursor {
    pub kind: PipelineKind,
    pub total: usize,
    /// Start of the next fragment to issue.
    pub next_offset: usize,
    /// Bytes whose final leg has not completed.
    pub remaining: usize,
    pub max_frag: usize,
    /// Minimum fragment length; the tail is folded so no fragment but the
    /// whole transfer is shorter than this.
    pub min_frag: usize,
    pub remote_address: u64,
    /// Lanes for the network leg, derived once from the parent's key.
    pub lanes: Option<StripeLanes>,
    pub in_flight: usize,
    pub status: Status,
    /// Set while the pipeline issues fragments, so fragments finishing
    /// inline do not re-enter it.
    pub issuing: bool,
}

impl PipelineCursor {
    pub fn issued_all(&self) -> bool {
        self.next_offset == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragPlan {
    /// GET from the peer into staging, then copy into the user buffer.
    GetThenCopy,
    /// The peer fills staging after a fragment RTR, then copy into the user buffer.
    RtrThenCopy,
    /// Copy the user buffer into staging, then PUT to the peer.
    CopyThenPut,
    /// PUT straight from host memory.
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragLeg {
    Network,
    Copy,
}

pub(crate) struct FragState {
    pub plan: FragPlan,
    /// Offset of this fragment in the parent's range.
    pub offset: usize,
    pub leg: FragLeg,
    /// Whether the current leg has been issued.
    pub leg_started: bool,
    /// Bytes the peer confirmed for an RTR fragment.
    pub received: usize,
    /// Peer address of the fragment's first byte, for GET and PUT legs.
    pub remote_address: u64,
    pub lanes: Option<StripeLanes>,
    /// Bytes the network leg moved per lane.
    pub lane_bytes: LaneBytes,
}

impl FragState {
    /// The leg that starts the fragment.
    pub fn first_leg(plan: FragPlan) -> FragLeg {
        match plan {
            FragPlan::GetThenCopy | FragPlan::RtrThenCopy | FragPlan::Put => FragLeg::Network,
            FragPlan::CopyThenPut => FragLeg::Copy,
        }
    }

    /// The leg after `leg`, or `None` if `leg` completes the fragment.
    pub fn next_leg(plan: FragPlan, leg: FragLeg) -> Option<FragLeg> {
        match (plan, leg) {
            (FragPlan::GetThenCopy | FragPlan::RtrThenCopy, FragLeg::Network) => Some(FragLeg::Copy),
            (FragPlan::CopyThenPut, FragLeg::Copy) => Some(FragLeg::Network),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RmaPurpose {
    /// Whole-message GET for the parent receive.
    RecvGet,
    /// PUT of one RTR range for the parent send, closed with ATP.
    SendPut { rreq_id: u64, fragment: bool },
    /// One leg of the parent fragment.
    FragLeg,
}

pub(crate) enum RmaPhase {
    Data,
    Ack(AckState),
}

pub(crate) struct RmaState {
    pub op: RmaOp,
    pub remote_address: u64,
    pub lanes: StripeLanes,
    pub purpose: RmaPurpose,
    pub phase: RmaPhase,
}

pub(crate) struct PutPipelineState {
    pub rreq_id: u64,
    pub fragment: bool,
    pub cursor: PipelineCursor,
    /// Bytes put per lane, summed over finished fragments.
    pub lane_bytes: LaneBytes,
    pub ack: Option<AckState>,
}

/// DATA stream for one RTR range when no zero-copy path exists.
pub(crate) struct AmSendState {
    pub rreq_id: u64,
    pub lane: LaneIndex,
    pub max_payload: usize,
}

/// A control message waiting for send resources.
pub(crate) struct CtrlState {
    pub lane: LaneIndex,
    pub data: bytes::Bytes,
    pub name: &'static str,
}

pub(crate) enum RequestKind {
    Send(SendState),
    Recv(RecvState),
    Rma(RmaState),
    Frag(FragState),
    PutPipeline(PutPipelineState),
    AmSend(AmSendState),
    Ctrl(CtrlState),
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Send(_) => "send",
            RequestKind::Recv(_) => "recv",
            RequestKind::Rma(_) => "rma",
            RequestKind::Frag(_) => "frag",
            RequestKind::PutPipeline(_) => "put-pipeline",
            RequestKind::AmSend(_) => "am-send",
            RequestKind::Ctrl(_) => "ctrl",
        }
    }
}

pub(crate) struct Request {
    pub ep: EpId,
    pub parent: Option<RequestHandle>,
    /// Local memory this request moves; `offset` counts progress through it.
    pub buffer: Buffer,
    pub offset: usize,
    /// Outstanding transport operations.
    pub completion_count: usize,
    pub status: Status,
    pub memh: Option<MemHandle>,
    pub rkey: Option<Rkey>,
    pub staging: Option<StagingFragment>,
    /// Lane whose pending queue currently holds this request.
    pub pending_lane: Option<LaneIndex>,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(ep: EpId, parent: Option<RequestHandle>, buffer: Buffer, kind: RequestKind) -> Self {
        Self {
            ep,
            parent,
            buffer,
            offset: 0,
            completion_count: 0,
            status: Status::Ok,
            memh: None,
            rkey: None,
            staging: None,
            pending_lane: None,
            kind,
        }
    }

    pub fn advance(&mut self, length: usize) {
        self.offset += length;
        debug_assert!(self.offset <= self.buffer.length);
    }

    /// Jumps to the end after a hard failure so the request completes with
    /// `status` once outstanding operations drain.
    pub fn fast_forward(&mut self, status: Status) {
        self.status = self.status.merge(status);
        self.offset = self.buffer.length;
    }
}

enum Slot {
    Vacant { generation: u32 },
    Occupied { generation: u32, request: Request },
}

pub(crate) struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    /// Generation given to newly created slots.
    seed: u32,
}

impl RequestArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            // Random so ids from an earlier worker incarnation do not validate.
            seed: rand::random::<u32>(),
        }
    }

    pub fn insert(&mut self, request: Request) -> RequestHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { generation, .. } => generation.wrapping_add(1),
            };
            *slot = Slot::Occupied {
                generation,
                request,
            };
            return RequestHandle { index, generation };
        }
        let index = self.slots.len() as u32;
        let generation = self.seed;
        self.slots.push(Slot::Occupied {
            generation,
            request,
        });
        RequestHandle { index, generation }
    }

    pub fn get(&self, handle: RequestHandle) -> Option<&Request> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied {
                generation,
                request,
            }) if *generation == handle.generation => Some(request),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied {
                generation,
                request,
            }) if *generation == handle.generation => Some(request),
            _ => None,
        }
    }

    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: RequestHandle) -> Option<Request> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let next = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
                let Slot::Occupied { request, .. } = std::mem::replace(slot, next) else {
                    return None;
                };
                self.free.push(handle.index);
                self.live -= 1;
                Some(request)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn handles(&self) -> Vec<RequestHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(RequestHandle {
                    index: index as u32,
                    generation: *generation,
                }),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }
}
