/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! RTS/RTR negotiation.
//!
//! The sender registers its buffer, packs a remote key and announces the
//! message with an RTS. The receiver picks a scheme for it, in order:
//!
//! 1. empty messages and truncated ones are answered with an ATS at once;
//! 2. direct pointer access to the sender's memory, copied in segments;
//! 3. a striped GET of the whole message;
//! 4. a staged pipeline when the receive memory is not host memory and the
//!    network cannot reach it directly;
//! 5. an RTR asking the sender to PUT (or stream DATA) into the buffer.
//!
//! On RTR the sender PUTs the requested range, pipelines it through staging
//! fragments, or falls back to DATA messages.

use bytes::Bytes;

use crate::config::RndvMode;
use crate::endpoint::EpConfig;
use crate::endpoint::EpId;
use crate::endpoint::RmaOp;
use crate::error::RndvError;
use crate::error::Status;
use crate::memory::Buffer;
use crate::memory::MAX_LANES;
use crate::memory::MemTypeSet;
use crate::memory::MemoryType;
use crate::proto::AckHdr;
use crate::proto::RndvMessage;
use crate::proto::RtrHdr;
use crate::proto::RtsHdr;
use crate::proto::RtsOrigin;
use crate::request::PipelineCursor;
use crate::request::PipelineKind;
use crate::request::RecvStage;
use crate::request::RecvState;
use crate::request::Request;
use crate::request::RequestHandle;
use crate::request::RequestKind;
use crate::request::RmaPhase;
use crate::request::RmaPurpose;
use crate::request::RmaState;
use crate::request::SendStage;
use crate::request::SendState;
use crate::rkey;
use crate::rkey::Rkey;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::worker::ChildDone;
use crate::worker::UNMATCHED;
use crate::worker::Worker;
use crate::zcopy::init_lane_map;

impl<T: Transport> Worker<T> {
    /// Starts a tagged send of `buffer` to `ep`.
    ///
    /// # Returns
    /// A handle whose completion reports once the receiver acknowledged the
    /// whole message.
    pub fn send(&mut self, ep: EpId, buffer: Buffer, tag: u64) -> Result<RequestHandle, RndvError> {
        self.start_send(ep, buffer, RtsOrigin::Tag, tag)
    }

    /// Starts an active-message send; `id` is matched against
    /// `post_am_recv`.
    pub fn send_am(&mut self, ep: EpId, buffer: Buffer, id: u64) -> Result<RequestHandle, RndvError> {
        self.start_send(ep, buffer, RtsOrigin::Am, id)
    }

    /// Posts a receive for the next message sent with `tag`.
    pub fn post_recv(&mut self, buffer: Buffer, tag: u64) -> RequestHandle {
        self.post(buffer, RtsOrigin::Tag, tag)
    }

    /// Posts a receive for the next active message with `id`.
    pub fn post_am_recv(&mut self, buffer: Buffer, id: u64) -> RequestHandle {
        self.post(buffer, RtsOrigin::Am, id)
    }

    fn start_send(
        &mut self,
        ep: EpId,
        buffer: Buffer,
        origin: RtsOrigin,
        tag: u64,
    ) -> Result<RequestHandle, RndvError> {
        let config = self.ep_config(ep)?;
        let mut memh = None;
        let mut packed = None;
        let mut address = 0;
        if self.config.rndv_mode != RndvMode::PutZcopy && buffer.length > 0 {
            let md_map = config.reg_md_map(&self.mds, buffer.mem_type);
            if !md_map.is_empty() {
                let handle = self.transport.register(buffer, md_map)?;
                let keys = match self.transport.pack_memh(&handle) {
                    Ok(keys) => keys,
                    Err(e) => {
                        self.transport.deregister(handle);
                        return Err(e.into());
                    }
                };
                match rkey::pack(buffer.mem_type, &keys) {
                    Ok(key) => packed = Some(key),
                    Err(e) => {
                        self.transport.deregister(handle);
                        return Err(e);
                    }
                }
                address = buffer.addr;
                memh = Some(handle);
            }
        }

        let mut req = Request::new(
            ep,
            None,
            buffer,
            RequestKind::Send(SendState {
                stage: SendStage::RtsSent,
                delivered: 0,
            }),
        );
        req.memh = memh;
        let h = self.requests.insert(req);
        let rts = RndvMessage::Rts(RtsHdr {
            ep_id: ep,
            sreq_id: h.to_wire(),
            size: buffer.length as u64,
            origin,
            tag,
            address,
            rkey: packed,
        });
        if let Err(e) = self.send_ctrl(ep, Some(h), &rts) {
            if let Some(mut req) = self.requests.remove(h) {
                self.release_resources(&mut req);
            }
            return Err(e);
        }
        tracing::debug!(
            "[rndv] req {} rts of {} bytes to ep {} (address {:#x})",
            h,
            buffer.length,
            ep,
            address
        );
        Ok(h)
    }

    fn post(&mut self, buffer: Buffer, origin: RtsOrigin, tag: u64) -> RequestHandle {
        let h = self.requests.insert(Request::new(
            UNMATCHED,
            None,
            buffer,
            RequestKind::Recv(RecvState {
                origin,
                tag,
                sreq_id: 0,
                size: 0,
                stage: RecvStage::Posted,
                received: 0,
            }),
        ));
        let pos = self
            .unexpected
            .iter()
            .position(|(_, rts)| rts.origin == origin && rts.tag == tag);
        let matched = pos.and_then(|pos| self.unexpected.remove(pos));
        match matched {
            Some((ep, rts)) => {
                tracing::debug!("[rndv] req {} matched unexpected rts {:#x}", h, rts.sreq_id);
                if let Err(e) = self.receive(h, ep, rts) {
                    tracing::error!("[rndv] req {} cannot start receive: {}", h, e);
                    self.complete_request(h, e.status());
                }
            }
            None => self.posted.push_back(h),
        }
        h
    }

    pub(crate) fn handle_rts(&mut self, ep: EpId, rts: RtsHdr) -> Result<(), RndvError> {
        let requests = &self.requests;
        self.posted.retain(|h| requests.contains(*h));
        let pos = self.posted.iter().position(|&h| {
            matches!(
                self.requests.get(h).map(|req| &req.kind),
                Some(RequestKind::Recv(recv)) if recv.origin == rts.origin && recv.tag == rts.tag
            )
        });
        let Some(h) = pos.and_then(|pos| self.posted.remove(pos)) else {
            tracing::debug!(
                "[rndv] ep {} rts {:#x} with tag {:#x} is unexpected",
                ep,
                rts.sreq_id,
                rts.tag
            );
            self.unexpected.push_back((ep, rts));
            return Ok(());
        };
        if let Err(e) = self.receive(h, ep, rts) {
            self.complete_request(h, e.status());
            return Err(e);
        }
        Ok(())
    }

    /// Picks the transfer scheme for a matched RTS.
    fn receive(&mut self, h: RequestHandle, ep: EpId, rts: RtsHdr) -> Result<(), RndvError> {
        let config = self.ep_config(ep)?;
        let size = rts.size as usize;
        let Some(req) = self.requests.get_mut(h) else {
            return Err(RndvError::UnknownRequest(h.to_wire()));
        };
        let RequestKind::Recv(recv) = &mut req.kind else {
            return Err(RndvError::UnknownRequest(h.to_wire()));
        };
        req.ep = ep;
        recv.sreq_id = rts.sreq_id;
        recv.size = size;
        let buffer = req.buffer;
        tracing::debug!(
            "[rndv] req {} rts {:#x} of {} bytes from ep {} (address {:#x})",
            h,
            rts.sreq_id,
            size,
            ep,
            rts.address
        );

        if size == 0 {
            self.finish_recv(h, Status::Ok, true);
            return Ok(());
        }
        if size > buffer.length {
            let e = RndvError::Truncated {
                announced: size,
                capacity: buffer.length,
            };
            tracing::warn!("[rndv] req {} {}", h, e);
            self.finish_recv(h, e.status(), true);
            return Ok(());
        }

        let mut rkey = match rts.rkey {
            Some(packed) if rts.address != 0 => match self.unpack_rkey(&config, packed) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::error!("[rndv] req {} rts {:#x} carries a bad key: {}", h, rts.sreq_id, e);
                    self.finish_recv(h, e.status(), true);
                    return Ok(());
                }
            },
            _ => None,
        };
        let mode = self.config.rndv_mode;
        let ratio = self.config.multi_lane_max_ratio;

        if let Some(key) = rkey.as_ref() {
            let shared = key.md_map().and(config.rkey_ptr_dst_mds).first();
            if mode == RndvMode::Auto && buffer.mem_type.is_cpu_accessible() {
                if let Some(md) = shared {
                    let mapped = match key.key_for_md(md) {
                        Some(blob) => self.transport.rkey_ptr(md, blob, rts.address),
                        None => Err(TransportError::Unsupported(format!("no key for md {}", md))),
                    };
                    match mapped {
                        Ok(remote_ptr) => {
                            tracing::debug!("[rndv] req {} reads through md {} pointer", h, md);
                            if let Some(req) = self.requests.get_mut(h) {
                                req.rkey = rkey.take();
                                if let RequestKind::Recv(recv) = &mut req.kind {
                                    recv.stage = RecvStage::RkeyPtr { remote_ptr };
                                }
                            }
                            self.rkey_ptr_queue.push_back(h);
                        }
                        Err(e) => {
                            tracing::warn!("[rndv] req {} cannot map peer memory: {}", h, e);
                            if let Some(key) = rkey.take() {
                                key.destroy(&mut self.transport);
                            }
                            self.finish_recv(h, e.status(), true);
                        }
                    }
                    return Ok(());
                }
            }
        }

        let mut get_failed = false;
        let get = config.rndv_zcopy(RmaOp::Get);
        if rkey.is_some() && mode != RndvMode::PutZcopy && get.is_some_and(|z| z.supports(size)) {
            let lanes = init_lane_map(
                &config,
                &self.mds,
                rkey.as_ref(),
                buffer.mem_type,
                RmaOp::Get,
                ratio,
            );
            let region = buffer.slice(0, size);
            let registered = if lanes.is_empty() {
                None
            } else {
                let md_map = config.reg_md_map(&self.mds, buffer.mem_type);
                if md_map.is_empty() {
                    Some(None)
                } else {
                    match self.transport.register(region, md_map) {
                        Ok(memh) => Some(Some(memh)),
                        Err(e) => {
                            tracing::warn!("[rndv] req {} cannot register for get: {}", h, e);
                            None
                        }
                    }
                }
            };
            match registered {
                Some(memh) => {
                    if let Some(req) = self.requests.get_mut(h) {
                        req.memh = memh;
                        req.rkey = rkey.take();
                        if let RequestKind::Recv(recv) = &mut req.kind {
                            recv.stage = RecvStage::GetZcopy;
                        }
                    }
                    let child = self.requests.insert(Request::new(
                        ep,
                        Some(h),
                        region,
                        RequestKind::Rma(RmaState {
                            op: RmaOp::Get,
                            remote_address: rts.address,
                            lanes,
                            purpose: RmaPurpose::RecvGet,
                            phase: RmaPhase::Data,
                        }),
                    ));
                    tracing::debug!("[rndv] req {} gets {} bytes through {}", h, size, child);
                    self.drive(child);
                    return Ok(());
                }
                None => {
                    tracing::debug!("[rndv] req {} cannot get from peer memory", h);
                    if let Some(key) = rkey.take() {
                        key.destroy(&mut self.transport);
                    }
                    get_failed = true;
                }
            }
        }

        let remote_mem_type = rkey.as_ref().map(|key| key.mem_type());
        if mode == RndvMode::Auto
            && !buffer.mem_type.is_host()
            && self.recv_pipeline_needed(&config, buffer.mem_type, remote_mem_type, get_failed)
        {
            let put_pipeline = rkey.is_none()
                || get.map_or(true, |z| size < z.min)
                || get_failed;
            if !put_pipeline {
                let lanes = init_lane_map(
                    &config,
                    &self.mds,
                    rkey.as_ref(),
                    MemoryType::Host,
                    RmaOp::Get,
                    ratio,
                );
                if let (false, Some(get)) = (lanes.is_empty(), get) {
                    let cursor = PipelineCursor {
                        kind: PipelineKind::RecvGet,
                        total: size,
                        next_offset: 0,
                        remaining: size,
                        max_frag: self.config.frag_size.min(get.max),
                        min_frag: get.min,
                        remote_address: rts.address,
                        lanes: Some(lanes),
                        in_flight: 0,
                        status: Status::Ok,
                        issuing: false,
                    };
                    self.start_recv_pipeline(h, cursor, rkey.take());
                    return Ok(());
                }
            }
            if let Some(key) = rkey.take() {
                key.destroy(&mut self.transport);
            }
            let cursor = PipelineCursor {
                kind: PipelineKind::RecvRtr,
                total: size,
                next_offset: 0,
                remaining: size,
                max_frag: self.config.frag_size,
                min_frag: 0,
                remote_address: 0,
                lanes: None,
                in_flight: 0,
                status: Status::Ok,
                issuing: false,
            };
            self.start_recv_pipeline(h, cursor, None);
            return Ok(());
        }

        if let Some(key) = rkey.take() {
            key.destroy(&mut self.transport);
        }
        self.send_rtr(h, ep, &config, buffer.slice(0, size), rts.sreq_id, get_failed)
    }

    /// Unpacks a peer key and resolves it against the endpoint. A key no
    /// lane reaches is still returned; the scheme selection falls back on it.
    fn unpack_rkey(&self, config: &EpConfig, packed: Bytes) -> Result<Rkey, RndvError> {
        let mut key = Rkey::unpack(packed)?;
        if let Err(e) = key.resolve(config, &self.mds) {
            tracing::debug!("[rndv] peer key not reachable by rma lanes: {}", e);
        }
        Ok(key)
    }

    fn start_recv_pipeline(&mut self, h: RequestHandle, cursor: PipelineCursor, rkey: Option<Rkey>) {
        tracing::debug!(
            "[rndv] req {} pipelines {} bytes in fragments of up to {} ({:?})",
            h,
            cursor.total,
            cursor.max_frag,
            cursor.kind
        );
        if let Some(req) = self.requests.get_mut(h) {
            req.rkey = rkey;
            if let RequestKind::Recv(recv) = &mut req.kind {
                recv.stage = RecvStage::Pipeline(cursor);
            }
        }
        self.drive(h);
    }

    /// Whether the receive must go through host staging fragments.
    fn recv_pipeline_needed(
        &self,
        config: &EpConfig,
        mem_type: MemoryType,
        remote_mem_type: Option<MemoryType>,
        get_failed: bool,
    ) -> bool {
        if self.mem_type_ep(mem_type).is_none() || !self.has_host_bw_lane(config) {
            return false;
        }
        if get_failed {
            return true;
        }
        let mut needed = MemTypeSet::empty().with(mem_type);
        if let Some(remote) = remote_mem_type {
            needed = needed.with(remote);
        }
        !config
            .rma_bw_md_map()
            .iter()
            .any(|md| self.mds[md].reg_mem_types.contains_all(needed))
    }

    /// Whether some bandwidth lane can move host memory.
    pub(crate) fn has_host_bw_lane(&self, config: &EpConfig) -> bool {
        config.rma_bw_lanes.iter().any(|&lane| {
            config
                .lane(lane)
                .md_index
                .is_some_and(|md| self.mds[md].access_mem_types.contains(MemoryType::Host))
        })
    }

    /// Asks the sender to deliver `region`. The buffer is registered and
    /// advertised unless a GET of the sender's memory already failed.
    fn send_rtr(
        &mut self,
        h: RequestHandle,
        ep: EpId,
        config: &EpConfig,
        region: Buffer,
        sreq_id: u64,
        get_failed: bool,
    ) -> Result<(), RndvError> {
        let mut memh = None;
        let mut packed = None;
        if !get_failed {
            let md_map = config.reg_md_map(&self.mds, region.mem_type);
            if !md_map.is_empty() {
                let handle = self.transport.register(region, md_map)?;
                let key = self
                    .transport
                    .pack_memh(&handle)
                    .map_err(RndvError::from)
                    .and_then(|keys| rkey::pack(region.mem_type, &keys));
                match key {
                    Ok(key) => {
                        packed = Some(key);
                        memh = Some(handle);
                    }
                    Err(e) => {
                        self.transport.deregister(handle);
                        return Err(e);
                    }
                }
            }
        }
        let address = if packed.is_some() { region.addr } else { 0 };
        if let Some(req) = self.requests.get_mut(h) {
            req.memh = memh;
            if let RequestKind::Recv(recv) = &mut req.kind {
                recv.stage = RecvStage::RtrSent;
            }
        }
        let rtr = RndvMessage::Rtr(RtrHdr {
            sreq_id,
            rreq_id: h.to_wire(),
            address,
            size: region.length as u64,
            offset: 0,
            fragment: false,
            rkey: packed,
        });
        tracing::debug!(
            "[rndv] req {} rtr for {} bytes (address {:#x})",
            h,
            region.length,
            address
        );
        self.send_ctrl(ep, Some(h), &rtr)
    }

    /// Completes a receive, telling the sender with an ATS when `ats` is set.
    pub(crate) fn finish_recv(&mut self, h: RequestHandle, status: Status, ats: bool) {
        let Some(req) = self.requests.get(h) else {
            return;
        };
        let RequestKind::Recv(recv) = &req.kind else {
            return;
        };
        let (ep, sreq_id, size) = (req.ep, recv.sreq_id, recv.size);
        let status = req.status.merge(status);
        if ats {
            let ats = RndvMessage::Ats(AckHdr {
                req_id: sreq_id,
                status,
                size: size as u64,
            });
            if let Err(e) = self.send_ctrl(ep, None, &ats) {
                tracing::warn!("[rndv] req {} cannot send ats: {}", h, e);
            }
        }
        self.complete_request(h, status);
    }

    pub(crate) fn recv_child_done(&mut self, parent: RequestHandle, done: ChildDone) {
        tracing::debug!(
            "[rndv] req {} got {} bytes: {}",
            parent,
            done.length,
            done.status
        );
        self.finish_recv(parent, done.status, true);
    }

    /// Copies one segment through the mapped pointer of the oldest
    /// rkey-pointer receive.
    pub(crate) fn progress_rkey_ptr(&mut self) {
        let Some(&h) = self.rkey_ptr_queue.front() else {
            return;
        };
        let seg_size = self.config.rkey_ptr_seg_size;
        let Some(req) = self.requests.get_mut(h) else {
            self.rkey_ptr_queue.pop_front();
            return;
        };
        let RequestKind::Recv(RecvState {
            stage: RecvStage::RkeyPtr { remote_ptr },
            size,
            ..
        }) = &req.kind
        else {
            self.rkey_ptr_queue.pop_front();
            return;
        };
        let (remote_ptr, size) = (*remote_ptr, *size);
        if req.offset < size {
            let length = seg_size.min(size - req.offset);
            let dst = req.buffer.addr + req.offset as u64;
            match self.transport.copy(dst, remote_ptr + req.offset as u64, length) {
                Ok(()) => {
                    tracing::trace!("[rndv] req {} copied {} bytes at offset {}", h, length, req.offset);
                    req.advance(length);
                }
                Err(e) => {
                    tracing::warn!("[rndv] req {} pointer copy failed: {}", h, e);
                    req.fast_forward(e.status());
                }
            }
        }
        if req.offset >= size {
            self.rkey_ptr_queue.pop_front();
            self.finish_recv(h, Status::Ok, true);
        }
    }

    pub(crate) fn handle_rtr(&mut self, ep: EpId, rtr: RtrHdr) -> Result<(), RndvError> {
        let h = RequestHandle::from_wire(rtr.sreq_id);
        let buffer = match self.requests.get(h) {
            Some(Request {
                buffer,
                kind: RequestKind::Send(_),
                ..
            }) => *buffer,
            _ => {
                tracing::warn!("[rndv] ep {} rtr for stale send {:#x}", ep, rtr.sreq_id);
                self.reject_rtr(ep, &rtr, Status::Canceled);
                return Ok(());
            }
        };
        let config = self.ep_config(ep)?;
        let (offset, size) = (rtr.offset as usize, rtr.size as usize);
        if offset.checked_add(size).map_or(true, |end| end > buffer.length) {
            let e = RndvError::Truncated {
                announced: offset.saturating_add(size),
                capacity: buffer.length,
            };
            tracing::error!("[rndv] req {} rtr out of range: {}", h, e);
            self.reject_rtr(ep, &rtr, e.status());
            self.complete_request(h, e.status());
            return Ok(());
        }

        let rkey = match rtr.rkey.clone() {
            Some(packed) if rtr.address != 0 => match self.unpack_rkey(&config, packed) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::error!("[rndv] req {} rtr carries a bad key: {}", h, e);
                    self.reject_rtr(ep, &rtr, e.status());
                    self.complete_request(h, e.status());
                    return Ok(());
                }
            },
            _ => None,
        };
        if let Some(RequestKind::Send(send)) = self.requests.get_mut(h).map(|req| &mut req.kind) {
            send.stage = SendStage::AwaitAts;
        }
        tracing::debug!(
            "[rndv] req {} rtr {:#x} for {} bytes at {} (address {:#x}{})",
            h,
            rtr.rreq_id,
            size,
            offset,
            rtr.address,
            if rtr.fragment { ", fragment" } else { "" }
        );

        let range = buffer.slice(offset, size);
        let mode = self.config.rndv_mode;
        let is_pipeline =
            (!buffer.mem_type.is_host() || buffer.length != size) && mode != RndvMode::PutZcopy;
        if rtr.address != 0 && is_pipeline {
            if let Some(lanes) = self.put_pipeline_lanes(&config, rkey.as_ref(), buffer.mem_type) {
                self.start_put_pipeline(h, ep, &rtr, range, rkey, lanes);
                return Ok(());
            }
        }

        if rtr.address != 0
            && mode != RndvMode::GetZcopy
            && config.rndv_zcopy(RmaOp::Put).is_some_and(|z| z.supports(size))
        {
            let lanes = init_lane_map(
                &config,
                &self.mds,
                rkey.as_ref(),
                buffer.mem_type,
                RmaOp::Put,
                self.config.multi_lane_max_ratio,
            );
            if !lanes.is_empty() {
                let mut child = Request::new(
                    ep,
                    Some(h),
                    range,
                    RequestKind::Rma(RmaState {
                        op: RmaOp::Put,
                        remote_address: rtr.address,
                        lanes,
                        purpose: RmaPurpose::SendPut {
                            rreq_id: rtr.rreq_id,
                            fragment: rtr.fragment,
                        },
                        phase: RmaPhase::Data,
                    }),
                );
                child.rkey = rkey;
                let child = self.requests.insert(child);
                tracing::debug!("[rndv] req {} puts {} bytes through {}", h, size, child);
                self.drive(child);
                return Ok(());
            }
        }

        if let Some(key) = rkey {
            key.destroy(&mut self.transport);
        }
        self.start_am_send(h, ep, &config, &rtr, range);
        Ok(())
    }

    /// Closes the receiver's range of `rtr` with a failed ATP. The receive
    /// (or fragment) waiting on that range completes with `status`.
    pub(crate) fn reject_rtr(&mut self, ep: EpId, rtr: &RtrHdr, status: Status) {
        let atp = RndvMessage::Atp(AckHdr {
            req_id: rtr.rreq_id,
            status,
            size: rtr.size,
        });
        if let Err(e) = self.send_ctrl(ep, None, &atp) {
            tracing::warn!("[rndv] ep {} cannot reject rtr {:#x}: {}", ep, rtr.rreq_id, e);
        }
    }

    pub(crate) fn send_child_done(&mut self, parent: RequestHandle, done: ChildDone) {
        if !done.status.is_ok() {
            self.complete_request(parent, done.status);
            return;
        }
        let Some(RequestKind::Send(send)) = self.requests.get_mut(parent).map(|req| &mut req.kind)
        else {
            return;
        };
        if !done.acked {
            tracing::trace!("[rndv] req {} handed over {} bytes, waits for ats", parent, done.length);
            send.stage = SendStage::AwaitAts;
            return;
        }
        send.delivered += done.length;
        let delivered = send.delivered;
        let Some(length) = self.requests.get(parent).map(|req| req.buffer.length) else {
            return;
        };
        if delivered >= length {
            self.complete_request(parent, Status::Ok);
        }
    }

    pub(crate) fn handle_ats(&mut self, ep: EpId, ack: AckHdr) -> Result<(), RndvError> {
        let h = RequestHandle::from_wire(ack.req_id);
        match self.requests.get(h).map(|req| &req.kind) {
            Some(RequestKind::Send(_)) => {
                tracing::debug!("[rndv] req {} ats for {} bytes: {}", h, ack.size, ack.status);
                self.complete_request(h, ack.status);
            }
            _ => tracing::warn!("[rndv] ep {} ats for stale send {:#x}", ep, ack.req_id),
        }
        Ok(())
    }

    pub(crate) fn handle_atp(&mut self, ep: EpId, ack: AckHdr) -> Result<(), RndvError> {
        enum Acked {
            Recv,
            Frag,
            Pending,
            Stale,
        }

        let h = RequestHandle::from_wire(ack.req_id);
        let acked = match self.requests.get_mut(h) {
            Some(req) => {
                let length = req.buffer.length;
                req.status = req.status.merge(ack.status);
                match &mut req.kind {
                    RequestKind::Recv(recv) if matches!(recv.stage, RecvStage::RtrSent) => {
                        recv.received += ack.size as usize;
                        if recv.received >= recv.size || !ack.status.is_ok() {
                            Acked::Recv
                        } else {
                            Acked::Pending
                        }
                    }
                    RequestKind::Frag(frag) => {
                        frag.received += ack.size as usize;
                        if frag.received >= length || !ack.status.is_ok() {
                            Acked::Frag
                        } else {
                            Acked::Pending
                        }
                    }
                    _ => Acked::Stale,
                }
            }
            None => Acked::Stale,
        };
        tracing::debug!("[rndv] req {} atp for {} bytes: {}", h, ack.size, ack.status);
        match acked {
            Acked::Recv => self.finish_recv(h, ack.status, false),
            Acked::Frag => self.frag_leg_done(h, ack.status, [0; MAX_LANES]),
            Acked::Pending => {}
            Acked::Stale => tracing::warn!("[rndv] ep {} atp for stale req {:#x}", ep, ack.req_id),
        }
        Ok(())
    }
}
