/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Loopback transport for tests.
//!
//! A `Fabric` is one simulated address space shared by any number of
//! sides. Each side is a `Transport` with its own event queue; endpoints of
//! two sides are linked so active messages sent on one arrive on the other.
//! RMA operations move bytes at issue time and report completion through
//! the issuing side's event queue, where tests may hold them back and
//! release them in any order. Every operation and message is recorded.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::RndvConfig;
use crate::endpoint::EpConfig;
use crate::endpoint::EpId;
use crate::endpoint::LaneConfig;
use crate::endpoint::MdAttr;
use crate::endpoint::ZcopyLimits;
use crate::error::Status;
use crate::memory::Buffer;
use crate::memory::LaneIndex;
use crate::memory::MdIndex;
use crate::memory::MdMap;
use crate::memory::MemHandle;
use crate::memory::MemoryType;
use crate::proto::RndvMessage;
use crate::request::RequestHandle;
use crate::transport::CompletionToken;
use crate::transport::Issued;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::TransportEvent;
use crate::worker::Completion;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Put,
    Flush,
    Fence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub side: usize,
    pub ep: EpId,
    pub lane: LaneIndex,
    pub kind: OpKind,
    pub length: usize,
}

/// An active message as the receiving side saw it.
#[derive(Debug, Clone)]
pub struct Sent {
    pub from: usize,
    pub lane: LaneIndex,
    pub message: RndvMessage,
}

struct Region {
    data: Vec<u8>,
    mem_type: MemoryType,
}

#[derive(Default)]
struct SideState {
    events: VecDeque<TransportEvent>,
    hold_completions: bool,
    held: Vec<TransportEvent>,
    /// Failures still to inject per lane.
    no_resource: HashMap<(EpId, LaneIndex), usize>,
    /// Hard RMA failures still to inject per lane.
    failures: HashMap<(EpId, LaneIndex), usize>,
    rkey_ptr: bool,
}

#[derive(Default)]
struct FabricState {
    regions: BTreeMap<u64, Region>,
    next_addr: u64,
    sides: Vec<SideState>,
    links: HashMap<(usize, EpId), (usize, EpId)>,
    registrations: HashSet<u64>,
    next_memh: u64,
    released_rkeys: usize,
    ops: Vec<Op>,
    sent: Vec<Sent>,
    discarded: Vec<(usize, EpId)>,
}

impl FabricState {
    fn side(&mut self, index: usize) -> &mut SideState {
        if self.sides.len() <= index {
            self.sides.resize_with(index + 1, SideState::default);
        }
        &mut self.sides[index]
    }

    fn region(&mut self, addr: u64, length: usize) -> Result<(&mut Region, usize), TransportError> {
        let bad = TransportError::BadAddress { addr, length };
        let (base, region) = self.regions.range_mut(..=addr).next_back().ok_or(bad.clone())?;
        let offset = (addr - *base) as usize;
        if offset + length > region.data.len() {
            return Err(bad);
        }
        Ok((region, offset))
    }

    fn read(&mut self, addr: u64, length: usize) -> Result<Vec<u8>, TransportError> {
        let (region, offset) = self.region(addr, length)?;
        Ok(region.data[offset..offset + length].to_vec())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        let (region, offset) = self.region(addr, data.len())?;
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn take_no_resource(&mut self, side: usize, ep: EpId, lane: LaneIndex) -> bool {
        let state = self.side(side);
        match state.no_resource.get_mut(&(ep, lane)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                state.events.push_back(TransportEvent::LaneReady { ep, lane });
                true
            }
            _ => false,
        }
    }

    fn take_failure(&mut self, side: usize, ep: EpId, lane: LaneIndex) -> bool {
        match self.side(side).failures.get_mut(&(ep, lane)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn complete(&mut self, side: usize, token: CompletionToken) {
        let state = self.side(side);
        let event = TransportEvent::Completion {
            token,
            status: Status::Ok,
        };
        if state.hold_completions {
            state.held.push(event);
        } else {
            state.events.push_back(event);
        }
    }
}

#[derive(Clone, Default)]
pub struct Fabric {
    state: Rc<RefCell<FabricState>>,
}

impl Fabric {
    pub fn new() -> Self {
        let fabric = Self::default();
        fabric.state.borrow_mut().next_addr = 0x10_0000;
        fabric
    }

    pub fn side(&self, index: usize) -> Side {
        self.state.borrow_mut().side(index);
        Side {
            state: self.state.clone(),
            index,
        }
    }

    /// Links endpoint `ep_a` of side `a` with endpoint `ep_b` of side `b`.
    pub fn connect(&self, a: usize, ep_a: EpId, b: usize, ep_b: EpId) {
        let mut state = self.state.borrow_mut();
        state.links.insert((a, ep_a), (b, ep_b));
        state.links.insert((b, ep_b), (a, ep_a));
    }

    /// Allocates a buffer filled with a pattern derived from `seed`.
    pub fn buffer(&self, length: usize, mem_type: MemoryType, seed: u8) -> Buffer {
        let mut side = self.side(0);
        let buffer = side.alloc(length, mem_type).unwrap();
        let data: Vec<u8> = (0..length)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        self.state.borrow_mut().write(buffer.addr, &data).unwrap();
        buffer
    }

    pub fn read(&self, buffer: Buffer) -> Vec<u8> {
        self.state
            .borrow_mut()
            .read(buffer.addr, buffer.length)
            .unwrap()
    }

    pub fn live_registrations(&self) -> usize {
        self.state.borrow().registrations.len()
    }

    pub fn released_rkeys(&self) -> usize {
        self.state.borrow().released_rkeys
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.borrow().ops.clone()
    }

    /// Bytes moved by `kind` operations of `side`, per lane.
    pub fn bytes_per_lane(&self, side: usize, kind: OpKind) -> BTreeMap<LaneIndex, usize> {
        let mut bytes = BTreeMap::new();
        for op in self.ops() {
            if op.side == side && op.kind == kind {
                *bytes.entry(op.lane).or_insert(0) += op.length;
            }
        }
        bytes
    }

    /// Messages sent by `from`.
    pub fn sent_by(&self, from: usize) -> Vec<Sent> {
        self.state
            .borrow()
            .sent
            .iter()
            .filter(|sent| sent.from == from)
            .cloned()
            .collect()
    }

    /// Number of `name` messages sent by `from`.
    pub fn count(&self, from: usize, name: &str) -> usize {
        self.sent_by(from)
            .iter()
            .filter(|sent| sent.message.name() == name)
            .count()
    }

    pub fn inject_no_resource(&self, side: usize, ep: EpId, lane: LaneIndex, failures: usize) {
        self.state
            .borrow_mut()
            .side(side)
            .no_resource
            .insert((ep, lane), failures);
    }

    /// Makes the next `failures` RMA operations on `lane` fail at issue.
    pub fn inject_failure(&self, side: usize, ep: EpId, lane: LaneIndex, failures: usize) {
        self.state
            .borrow_mut()
            .side(side)
            .failures
            .insert((ep, lane), failures);
    }

    pub fn hold_completions(&self, side: usize, hold: bool) {
        self.state.borrow_mut().side(side).hold_completions = hold;
    }

    pub fn held_completions(&self, side: usize) -> usize {
        self.state.borrow_mut().side(side).held.len()
    }

    /// Delivers held completions of `side`, newest first.
    pub fn release_held_reversed(&self, side: usize) {
        let mut state = self.state.borrow_mut();
        let side = state.side(side);
        while let Some(event) = side.held.pop() {
            side.events.push_back(event);
        }
    }

    /// Delivers held completions of `side` in issue order, the one at
    /// `index` carrying `status`.
    pub fn release_held_failing(&self, side: usize, index: usize, status: Status) {
        let mut state = self.state.borrow_mut();
        let side = state.side(side);
        for (i, mut event) in side.held.drain(..).enumerate() {
            if i == index {
                if let TransportEvent::Completion { status: held, .. } = &mut event {
                    *held = status;
                }
            }
            side.events.push_back(event);
        }
    }

    pub fn enable_rkey_ptr(&self, side: usize) {
        self.state.borrow_mut().side(side).rkey_ptr = true;
    }

    pub fn discarded(&self) -> Vec<(usize, EpId)> {
        self.state.borrow().discarded.clone()
    }
}

pub struct Side {
    state: Rc<RefCell<FabricState>>,
    index: usize,
}

impl Side {
    fn record(&self, ep: EpId, lane: LaneIndex, kind: OpKind, length: usize) {
        self.state.borrow_mut().ops.push(Op {
            side: self.index,
            ep,
            lane,
            kind,
            length,
        });
    }

    fn rma(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        kind: OpKind,
        local: Buffer,
        remote_addr: u64,
        token: CompletionToken,
    ) -> Result<Issued, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.take_no_resource(self.index, ep, lane) {
            return Err(TransportError::NoResource { lane });
        }
        if state.take_failure(self.index, ep, lane) {
            return Err(TransportError::Failed(format!("{:?} on lane {} failed", kind, lane)));
        }
        let (src, dst) = match kind {
            OpKind::Get => (remote_addr, local.addr),
            _ => (local.addr, remote_addr),
        };
        let data = state.read(src, local.length)?;
        state.write(dst, &data)?;
        state.complete(self.index, token);
        drop(state);
        self.record(ep, lane, kind, local.length);
        Ok(Issued::InProgress)
    }
}

impl Transport for Side {
    fn alloc(&mut self, length: usize, mem_type: MemoryType) -> Result<Buffer, TransportError> {
        let mut state = self.state.borrow_mut();
        let addr = state.next_addr;
        // Keep regions apart so overruns hit unmapped space.
        state.next_addr += (length as u64).div_ceil(4096) * 4096 + 4096;
        state.regions.insert(
            addr,
            Region {
                data: vec![0; length],
                mem_type,
            },
        );
        Ok(Buffer::new(addr, length, mem_type))
    }

    fn free(&mut self, buffer: Buffer) {
        self.state.borrow_mut().regions.remove(&buffer.addr);
    }

    fn register(&mut self, buffer: Buffer, md_map: MdMap) -> Result<MemHandle, TransportError> {
        let mut state = self.state.borrow_mut();
        let (region, _) = state.region(buffer.addr, buffer.length)?;
        if region.mem_type != buffer.mem_type {
            return Err(TransportError::BadAddress {
                addr: buffer.addr,
                length: buffer.length,
            });
        }
        state.next_memh += 1;
        let id = state.next_memh;
        state.registrations.insert(id);
        Ok(MemHandle { id, buffer, md_map })
    }

    fn deregister(&mut self, memh: MemHandle) {
        self.state.borrow_mut().registrations.remove(&memh.id);
    }

    fn pack_memh(&self, memh: &MemHandle) -> Result<Vec<(MdIndex, Bytes)>, TransportError> {
        Ok(memh
            .md_map
            .iter()
            .map(|md| (md, Bytes::from(format!("memh{}@md{}", memh.id, md))))
            .collect())
    }

    fn release_rkey(&mut self, _md: MdIndex, _key: &Bytes) {
        self.state.borrow_mut().released_rkeys += 1;
    }

    fn get_zcopy(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        local: Buffer,
        remote_addr: u64,
        _rkey: Option<&Bytes>,
        token: CompletionToken,
    ) -> Result<Issued, TransportError> {
        self.rma(ep, lane, OpKind::Get, local, remote_addr, token)
    }

    fn put_zcopy(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        local: Buffer,
        remote_addr: u64,
        _rkey: Option<&Bytes>,
        token: CompletionToken,
    ) -> Result<Issued, TransportError> {
        self.rma(ep, lane, OpKind::Put, local, remote_addr, token)
    }

    fn am_send(&mut self, ep: EpId, lane: LaneIndex, data: Bytes) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.take_no_resource(self.index, ep, lane) {
            return Err(TransportError::NoResource { lane });
        }
        let (peer, peer_ep) = *state
            .links
            .get(&(self.index, ep))
            .ok_or_else(|| TransportError::Failed(format!("ep {} is not connected", ep)))?;
        let message = RndvMessage::decode(&data)
            .map_err(|e| TransportError::Failed(format!("undecodable message: {}", e)))?;
        state.sent.push(Sent {
            from: self.index,
            lane,
            message,
        });
        state
            .side(peer)
            .events
            .push_back(TransportEvent::Message { ep: peer_ep, data });
        Ok(())
    }

    fn flush(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        token: CompletionToken,
    ) -> Result<Issued, TransportError> {
        self.state.borrow_mut().complete(self.index, token);
        self.record(ep, lane, OpKind::Flush, 0);
        Ok(Issued::InProgress)
    }

    fn fence(&mut self, ep: EpId, lane: LaneIndex) -> Result<(), TransportError> {
        self.record(ep, lane, OpKind::Fence, 0);
        Ok(())
    }

    fn rkey_ptr(&self, _md: MdIndex, _key: &Bytes, remote_addr: u64) -> Result<u64, TransportError> {
        let state = self.state.borrow();
        if state.sides[self.index].rkey_ptr {
            Ok(remote_addr)
        } else {
            Err(TransportError::Unsupported("rkey_ptr".to_string()))
        }
    }

    fn copy(&mut self, dst: u64, src: u64, length: usize) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        let data = state.read(src, length)?;
        state.write(dst, &data)
    }

    fn load(&self, addr: u64, length: usize) -> Result<Bytes, TransportError> {
        Ok(Bytes::from(self.state.borrow_mut().read(addr, length)?))
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        self.state.borrow_mut().write(addr, data)
    }

    fn discard(&mut self, ep: EpId) {
        let mut state = self.state.borrow_mut();
        state.links.remove(&(self.index, ep));
        state.discarded.push((self.index, ep));
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.state.borrow_mut().side(self.index).events.pop_front()
    }
}

pub const SENDER: usize = 0;
pub const RECEIVER: usize = 1;
/// Endpoint id both sides use for each other.
pub const PEER_EP: EpId = 7;
pub const CUDA_COPY_EP: EpId = 100;

/// Two network domains and a local copy domain that reaches device memory.
pub fn mds() -> Vec<MdAttr> {
    vec![
        MdAttr::network(&[MemoryType::Host]),
        MdAttr::network(&[MemoryType::Host]),
        MdAttr::copy(&[MemoryType::Host, MemoryType::Cuda]),
    ]
}

pub fn network_lane(md: MdIndex, bandwidth: f64) -> LaneConfig {
    LaneConfig {
        md_index: Some(md),
        dst_md_index: md,
        bandwidth,
        get_zcopy: Some(ZcopyLimits::new(1, 1 << 30)),
        put_zcopy: Some(ZcopyLimits::new(1, 1 << 30)),
        max_short: 256,
        max_bcopy: 8192,
    }
}

pub fn ep_config(index: u32, lanes: Vec<LaneConfig>) -> EpConfig {
    let all: Vec<LaneIndex> = (0..lanes.len()).collect();
    EpConfig {
        index,
        lanes,
        am_lane: 0,
        rma_lanes: all.clone(),
        rma_bw_lanes: all,
        rkey_ptr_dst_mds: MdMap::empty(),
        rndv_split: true,
    }
}

pub fn single_lane() -> EpConfig {
    ep_config(1, vec![network_lane(0, 1e9)])
}

/// Two lanes with a 3:1 bandwidth ratio.
pub fn dual_lane() -> EpConfig {
    ep_config(2, vec![network_lane(0, 3e9), network_lane(1, 1e9)])
}

pub fn cuda_copy_config() -> EpConfig {
    let mut lane = network_lane(2, 20e9);
    lane.max_short = 0;
    lane.max_bcopy = 0;
    ep_config(100, vec![lane])
}

/// A sender and a receiver worker on one fabric.
pub struct Pair {
    pub fabric: Fabric,
    pub sender: Worker<Side>,
    pub receiver: Worker<Side>,
}

impl Pair {
    pub fn new(sender: RndvConfig, receiver: RndvConfig, ep: EpConfig) -> Self {
        Self::with_configs(sender, ep.clone(), receiver, ep)
    }

    pub fn with_configs(
        sender_config: RndvConfig,
        sender_ep: EpConfig,
        receiver_config: RndvConfig,
        receiver_ep: EpConfig,
    ) -> Self {
        let fabric = Fabric::new();
        fabric.connect(SENDER, PEER_EP, RECEIVER, PEER_EP);
        let mut sender = Worker::new(sender_config, mds(), fabric.side(SENDER)).unwrap();
        let mut receiver = Worker::new(receiver_config, mds(), fabric.side(RECEIVER)).unwrap();
        sender.add_endpoint(PEER_EP, sender_ep).unwrap();
        receiver.add_endpoint(PEER_EP, receiver_ep).unwrap();
        Self {
            fabric,
            sender,
            receiver,
        }
    }

    /// Installs device-memory copy endpoints on both sides.
    pub fn with_cuda_copy(mut self) -> Self {
        for worker in [&mut self.sender, &mut self.receiver] {
            worker
                .add_mem_type_endpoint(CUDA_COPY_EP, MemoryType::Cuda, cuda_copy_config())
                .unwrap();
        }
        self
    }

    /// Progresses both workers until neither has events or pointer copies
    /// left.
    pub fn settle(&mut self) {
        for _ in 0..100_000 {
            let events = self.sender.progress() + self.receiver.progress();
            let copying =
                !self.sender.rkey_ptr_queue.is_empty() || !self.receiver.rkey_ptr_queue.is_empty();
            if events == 0 && !copying {
                return;
            }
        }
        panic!("workers did not settle");
    }

    /// Sends `send` to a receive posted on `recv` and settles.
    pub fn transfer(&mut self, send: Buffer, recv: Buffer) -> (Completion, Completion) {
        let rreq = self.receiver.post_recv(recv, 0x42);
        let sreq = self.sender.send(PEER_EP, send, 0x42).unwrap();
        self.settle();
        (self.completion(true, sreq), self.completion(false, rreq))
    }

    pub fn completion(&mut self, sender: bool, h: RequestHandle) -> Completion {
        let worker = if sender {
            &mut self.sender
        } else {
            &mut self.receiver
        };
        worker
            .take_completion(h)
            .unwrap_or_else(|| panic!("{} did not complete", h))
    }
}

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
