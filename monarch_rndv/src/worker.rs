/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Worker
//!
//! A `Worker` owns everything one progress context needs: the transport,
//! the endpoints, the request arena, the staging pool and the queues that
//! park requests until something changes. All state changes happen inside
//! calls on the worker, so no locking is needed; a caller that shares a
//! worker across threads wraps it in one mutex.
//!
//! ## Progress
//!
//! `progress()` drains a bounded batch of transport events:
//!
//! - completions decrement the owning request's outstanding count;
//! - messages run the protocol handlers;
//! - a lane reporting free resources retries the requests parked on it, in
//!   order, until one of them runs out again.
//!
//! It then copies one rkey-pointer segment and resumes pipelines that were
//! waiting for staging fragments.
//!
//! ## Request trees
//!
//! Sub-requests (striped RMA, fragments, fragment legs, queued control
//! messages) point at their parent by handle. A child that finishes
//! releases its own remote key, registration and staging fragment, then
//! reports to its parent. Only top-level sends and receives are visible to
//! the user, through `take_completion`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::config::RndvConfig;
use crate::endpoint::EpConfig;
use crate::endpoint::EpId;
use crate::endpoint::MdAttr;
use crate::error::RndvError;
use crate::error::Status;
use crate::memory::Buffer;
use crate::memory::LaneIndex;
use crate::memory::MAX_LANES;
use crate::memory::MdMap;
use crate::memory::MemoryType;
use crate::proto::RndvMessage;
use crate::proto::RtsHdr;
use crate::request::CtrlState;
use crate::request::Progress;
use crate::request::RecvStage;
use crate::request::RecvState;
use crate::request::Request;
use crate::request::RequestArena;
use crate::request::RequestHandle;
use crate::request::RequestKind;
use crate::request::RmaPhase;
use crate::request::RmaPurpose;
use crate::staging::StagingPool;
use crate::staging::StagingStats;
use crate::transport::CompletionToken;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::TransportEvent;
use crate::zcopy::LaneBytes;

/// Endpoint id of a receive that has not matched an RTS yet.
pub(crate) const UNMATCHED: EpId = EpId::MAX;

pub(crate) struct Endpoint {
    pub config: Arc<EpConfig>,
    /// Set for the local copy endpoints of pipeline legs.
    pub mem_type: Option<MemoryType>,
}

/// Outcome of a top-level send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub status: Status,
    /// Bytes of the message: the send length, or for a receive the announced
    /// size capped at the posted buffer.
    pub length: usize,
}

/// What a finished sub-request reports to its parent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildDone {
    pub status: Status,
    pub length: usize,
    pub lane_bytes: LaneBytes,
    /// The child closed its range with an ATP, so no ATS follows for it.
    pub acked: bool,
}

enum Step {
    Rma,
    Ack,
    Frag,
    Pipeline,
    AmSend,
    Ctrl,
    Idle,
}

enum ParentKind {
    Recv,
    Send,
    Frag,
    Pipeline,
}

pub struct Worker<T: Transport> {
    pub(crate) config: RndvConfig,
    pub(crate) transport: T,
    pub(crate) mds: Vec<MdAttr>,
    pub(crate) endpoints: HashMap<EpId, Endpoint>,
    pub(crate) mem_type_eps: HashMap<MemoryType, EpId>,
    pub(crate) requests: RequestArena,
    pub(crate) staging: StagingPool,
    pub(crate) pending: HashMap<(EpId, LaneIndex), VecDeque<RequestHandle>>,
    /// Pipelines waiting for a staging fragment.
    pub(crate) deferred: VecDeque<RequestHandle>,
    pub(crate) rkey_ptr_queue: VecDeque<RequestHandle>,
    /// Receives waiting for an RTS, in posting order.
    pub(crate) posted: VecDeque<RequestHandle>,
    /// RTS messages that arrived before a matching receive.
    pub(crate) unexpected: VecDeque<(EpId, RtsHdr)>,
    completed: HashMap<RequestHandle, Completion>,
}

impl<T: Transport> Worker<T> {
    /// Creates a worker over `transport`. `mds` describes the local memory
    /// domains that lane configurations refer to by index.
    pub fn new(config: RndvConfig, mds: Vec<MdAttr>, transport: T) -> Result<Self, RndvError> {
        config.validate()?;
        let staging_mds: MdMap = mds
            .iter()
            .enumerate()
            .filter(|(_, md)| md.need_rkey && md.reg_mem_types.contains(MemoryType::Host))
            .map(|(i, _)| i)
            .collect();
        let staging = StagingPool::new(
            config.frag_size,
            config.max_staging_frags,
            config.staging_grow_frags,
            staging_mds,
        );
        tracing::debug!("[rndv] worker created with {}", config);
        Ok(Self {
            config,
            transport,
            mds,
            endpoints: HashMap::new(),
            mem_type_eps: HashMap::new(),
            requests: RequestArena::new(),
            staging,
            pending: HashMap::new(),
            deferred: VecDeque::new(),
            rkey_ptr_queue: VecDeque::new(),
            posted: VecDeque::new(),
            unexpected: VecDeque::new(),
            completed: HashMap::new(),
        })
    }

    pub fn config(&self) -> &RndvConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Installs a connected endpoint.
    pub fn add_endpoint(&mut self, id: EpId, config: EpConfig) -> Result<(), RndvError> {
        self.insert_endpoint(id, config, None)
    }

    /// Installs the local copy endpoint pipelines use to move data between
    /// staging fragments and memory of `mem_type`.
    pub fn add_mem_type_endpoint(
        &mut self,
        id: EpId,
        mem_type: MemoryType,
        config: EpConfig,
    ) -> Result<(), RndvError> {
        self.insert_endpoint(id, config, Some(mem_type))?;
        self.mem_type_eps.insert(mem_type, id);
        Ok(())
    }

    fn insert_endpoint(
        &mut self,
        id: EpId,
        config: EpConfig,
        mem_type: Option<MemoryType>,
    ) -> Result<(), RndvError> {
        if id == UNMATCHED || self.endpoints.contains_key(&id) {
            return Err(RndvError::InvalidConfig(format!(
                "endpoint id {} is reserved or already in use",
                id
            )));
        }
        config.validate(&self.mds)?;
        tracing::debug!(
            "[rndv] ep {} added with config {} ({} lanes)",
            id,
            config.index,
            config.lanes.len()
        );
        self.endpoints.insert(
            id,
            Endpoint {
                config: Arc::new(config),
                mem_type,
            },
        );
        Ok(())
    }

    /// Replaces the lane configuration of an endpoint. Remote keys resolved
    /// against the old configuration are resolved again on next use.
    pub fn reconfigure_endpoint(&mut self, id: EpId, config: EpConfig) -> Result<(), RndvError> {
        config.validate(&self.mds)?;
        let endpoint = self
            .endpoints
            .get_mut(&id)
            .ok_or(RndvError::UnknownEndpoint(id))?;
        if endpoint.config.index == config.index {
            return Err(RndvError::InvalidConfig(format!(
                "new configuration of ep {} reuses index {}",
                id, config.index
            )));
        }
        tracing::debug!(
            "[rndv] ep {} reconfigured from config {} to {}",
            id,
            endpoint.config.index,
            config.index
        );
        endpoint.config = Arc::new(config);
        Ok(())
    }

    /// Tears down an endpoint. Every request tree touching it is canceled:
    /// resources are released, top-level requests complete with
    /// `Status::Canceled`, and queued work is dropped. Returns the number of
    /// requests canceled.
    pub fn close_endpoint(&mut self, id: EpId) -> Result<usize, RndvError> {
        let endpoint = self
            .endpoints
            .remove(&id)
            .ok_or(RndvError::UnknownEndpoint(id))?;
        if let Some(mem_type) = endpoint.mem_type {
            self.mem_type_eps.remove(&mem_type);
        }

        let handles = self.requests.handles();
        let doomed_roots: HashSet<RequestHandle> = handles
            .iter()
            .copied()
            .filter(|&h| self.requests.get(h).is_some_and(|req| req.ep == id))
            .map(|h| self.root_of(h))
            .collect();
        let doomed: HashSet<RequestHandle> = handles
            .into_iter()
            .filter(|&h| doomed_roots.contains(&self.root_of(h)))
            .collect();

        for &h in &doomed {
            let Some(mut req) = self.requests.remove(h) else {
                continue;
            };
            self.release_resources(&mut req);
            if req.parent.is_none() {
                if let RequestKind::Send(_) | RequestKind::Recv(_) = req.kind {
                    self.completed.insert(
                        h,
                        Completion {
                            status: Status::Canceled,
                            length: 0,
                        },
                    );
                }
            }
        }

        for queue in self.pending.values_mut() {
            queue.retain(|h| !doomed.contains(h));
        }
        self.pending
            .retain(|(ep, _), queue| *ep != id && !queue.is_empty());
        self.deferred.retain(|h| !doomed.contains(h));
        self.rkey_ptr_queue.retain(|h| !doomed.contains(h));
        self.unexpected.retain(|(ep, _)| *ep != id);
        self.transport.discard(id);

        tracing::info!(
            "[rndv] ep {} closed, canceled {} requests",
            id,
            doomed.len()
        );
        Ok(doomed.len())
    }

    fn root_of(&self, h: RequestHandle) -> RequestHandle {
        let mut current = h;
        while let Some(parent) = self.requests.get(current).and_then(|req| req.parent) {
            if !self.requests.contains(parent) {
                break;
            }
            current = parent;
        }
        current
    }

    /// Runs one round of progress. Returns the number of transport events
    /// handled.
    pub fn progress(&mut self) -> usize {
        let mut events = 0;
        while events < self.config.max_events_per_progress {
            let Some(event) = self.transport.poll() else {
                break;
            };
            events += 1;
            match event {
                TransportEvent::Completion { token, status } => self.on_completion(token, status),
                TransportEvent::Message { ep, data } => {
                    if let Err(e) = self.handle_message(ep, data) {
                        tracing::error!("[rndv] ep {} dropped message: {}", ep, e);
                    }
                }
                TransportEvent::LaneReady { ep, lane } => self.dispatch_pending(ep, lane),
            }
        }
        self.progress_rkey_ptr();
        self.resume_deferred();
        events
    }

    /// Takes the completion of a finished top-level request.
    pub fn take_completion(&mut self, h: RequestHandle) -> Option<Completion> {
        self.completed.remove(&h)
    }

    /// Whether `h` is still in flight.
    pub fn is_active(&self, h: RequestHandle) -> bool {
        self.requests.contains(h)
    }

    /// Progresses the worker until `h` completes.
    ///
    /// # Arguments
    /// * `h` - A handle returned by `send` or `post_recv`.
    /// * `timeout` - How long to keep progressing.
    ///
    /// # Returns
    /// The request's completion, or an error if it does not complete in time
    /// or is unknown.
    pub async fn wait_for_completion(
        &mut self,
        h: RequestHandle,
        timeout: Duration,
    ) -> Result<Completion, anyhow::Error> {
        let start_time = tokio::time::Instant::now();
        while start_time.elapsed() < timeout {
            if let Some(completion) = self.take_completion(h) {
                tracing::debug!("[rndv] req {} completed: {}", h, completion.status);
                return Ok(completion);
            }
            if !self.requests.contains(h) {
                return Err(anyhow::anyhow!("[rndv] req {} is not in flight", h));
            }
            if self.progress() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        if let Some(completion) = self.take_completion(h) {
            return Ok(completion);
        }
        tracing::error!("timed out while waiting on request completion");
        Err(anyhow::anyhow!(
            "[rndv] req {} did not complete within {:?}",
            h,
            timeout
        ))
    }

    pub fn staging_stats(&self) -> StagingStats {
        self.staging.stats()
    }

    /// Requests in flight, sub-requests included.
    pub fn active_requests(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn ep_config(&self, ep: EpId) -> Result<Arc<EpConfig>, RndvError> {
        self.endpoints
            .get(&ep)
            .map(|endpoint| endpoint.config.clone())
            .ok_or(RndvError::UnknownEndpoint(ep))
    }

    pub(crate) fn mem_type_ep(&self, mem_type: MemoryType) -> Option<EpId> {
        self.mem_type_eps.get(&mem_type).copied()
    }

    /// Runs the request's handler once.
    pub(crate) fn step(&mut self, h: RequestHandle) -> Progress {
        let step = match self.requests.get(h).map(|req| &req.kind) {
            Some(RequestKind::Rma(rma)) => match &rma.phase {
                RmaPhase::Data => Step::Rma,
                RmaPhase::Ack(_) => Step::Ack,
            },
            Some(RequestKind::PutPipeline(pipeline)) => {
                if pipeline.ack.is_some() {
                    Step::Ack
                } else {
                    Step::Pipeline
                }
            }
            Some(RequestKind::Recv(RecvState {
                stage: RecvStage::Pipeline(_),
                ..
            })) => Step::Pipeline,
            Some(RequestKind::Frag(_)) => Step::Frag,
            Some(RequestKind::AmSend(_)) => Step::AmSend,
            Some(RequestKind::Ctrl(_)) => Step::Ctrl,
            Some(RequestKind::Send(_)) | Some(RequestKind::Recv(_)) | None => Step::Idle,
        };
        match step {
            Step::Rma => self.progress_rma(h),
            Step::Ack => self.progress_ack(h),
            Step::Frag => self.progress_frag(h),
            Step::Pipeline => self.progress_pipeline(h),
            Step::AmSend => self.progress_am_send(h),
            Step::Ctrl => self.progress_ctrl(h),
            Step::Idle => Progress::Done,
        }
    }

    /// Steps the request until it has nothing more to issue.
    pub(crate) fn drive(&mut self, h: RequestHandle) -> Progress {
        loop {
            match self.step(h) {
                Progress::InProgress => continue,
                other => return other,
            }
        }
    }

    /// Handles a lane without send resources. A request retried from that
    /// very lane reports `NoResource` so the dispatcher keeps it at the head
    /// of the queue; otherwise the request is parked on the lane.
    pub(crate) fn no_resource(&mut self, h: RequestHandle, lane: LaneIndex) -> Progress {
        let Some(req) = self.requests.get_mut(h) else {
            return Progress::Done;
        };
        if req.pending_lane == Some(lane) {
            return Progress::NoResource;
        }
        req.pending_lane = Some(lane);
        tracing::trace!(
            "[rndv] req {} {} waits for lane {} of ep {}",
            h,
            req.kind.name(),
            lane,
            req.ep
        );
        self.pending.entry((req.ep, lane)).or_default().push_back(h);
        Progress::Done
    }

    fn dispatch_pending(&mut self, ep: EpId, lane: LaneIndex) {
        loop {
            let Some(h) = self
                .pending
                .get_mut(&(ep, lane))
                .and_then(|queue| queue.pop_front())
            else {
                break;
            };
            if !self.requests.contains(h) {
                continue;
            }
            match self.drive(h) {
                Progress::NoResource => {
                    self.pending.entry((ep, lane)).or_default().push_front(h);
                    break;
                }
                Progress::Done | Progress::InProgress => {
                    if let Some(req) = self.requests.get_mut(h) {
                        if req.pending_lane == Some(lane) {
                            req.pending_lane = None;
                        }
                    }
                }
            }
        }
        if self
            .pending
            .get(&(ep, lane))
            .is_some_and(|queue| queue.is_empty())
        {
            self.pending.remove(&(ep, lane));
        }
    }

    fn on_completion(&mut self, token: CompletionToken, status: Status) {
        let h = RequestHandle::from_token(token);
        let Some(req) = self.requests.get_mut(h) else {
            tracing::trace!("[rndv] completion for stale req {}", h);
            return;
        };
        if req.completion_count == 0 {
            tracing::warn!("[rndv] req {} got an unexpected completion", h);
            return;
        }
        req.completion_count -= 1;
        if !status.is_ok() {
            tracing::warn!("[rndv] req {} {} completed with {}", h, req.kind.name(), status);
            req.fast_forward(status);
        }
        if req.completion_count == 0 && req.pending_lane.is_none() {
            self.drive(h);
        }
    }

    fn handle_message(&mut self, ep: EpId, data: Bytes) -> Result<(), RndvError> {
        if !self.endpoints.contains_key(&ep) {
            return Err(RndvError::UnknownEndpoint(ep));
        }
        let message = RndvMessage::decode(&data)?;
        tracing::debug!("[rndv] ep {} received {}", ep, message.name());
        match message {
            RndvMessage::Rts(rts) => self.handle_rts(ep, rts),
            RndvMessage::Rtr(rtr) => self.handle_rtr(ep, rtr),
            RndvMessage::Data(data) => self.handle_data(ep, data),
            RndvMessage::Ats(ack) => self.handle_ats(ep, ack),
            RndvMessage::Atp(ack) => self.handle_atp(ep, ack),
        }
    }

    /// Sends a control message on the endpoint's control lane. Without
    /// send resources, the message is queued behind the lane and sent when
    /// the lane is ready; `owner` ties it to the request that produced it.
    pub(crate) fn send_ctrl(
        &mut self,
        ep: EpId,
        owner: Option<RequestHandle>,
        message: &RndvMessage,
    ) -> Result<(), RndvError> {
        let lane = self.ep_config(ep)?.am_lane;
        let data = message.encode()?;
        let queued = self
            .pending
            .get(&(ep, lane))
            .is_some_and(|queue| !queue.is_empty());
        if !queued {
            match self.transport.am_send(ep, lane, data.clone()) {
                Ok(()) => {
                    tracing::debug!("[rndv] ep {} sent {}", ep, message.name());
                    return Ok(());
                }
                Err(TransportError::NoResource { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let h = self.requests.insert(Request::new(
            ep,
            owner,
            Buffer::new(0, 0, MemoryType::Host),
            RequestKind::Ctrl(CtrlState {
                lane,
                data,
                name: message.name(),
            }),
        ));
        tracing::debug!("[rndv] ep {} {} queued as {}", ep, message.name(), h);
        self.no_resource(h, lane);
        Ok(())
    }

    fn progress_ctrl(&mut self, h: RequestHandle) -> Progress {
        let Some(req) = self.requests.get(h) else {
            return Progress::Done;
        };
        let RequestKind::Ctrl(ctrl) = &req.kind else {
            return Progress::Done;
        };
        let (ep, lane, name) = (req.ep, ctrl.lane, ctrl.name);
        match self.transport.am_send(ep, lane, ctrl.data.clone()) {
            Ok(()) => tracing::debug!("[rndv] ep {} sent queued {}", ep, name),
            Err(TransportError::NoResource { .. }) => return self.no_resource(h, lane),
            Err(e) => tracing::warn!("[rndv] ep {} dropped queued {}: {}", ep, name, e),
        }
        self.requests.remove(h);
        Progress::Done
    }

    /// Parks a pipeline until a staging fragment is released.
    pub(crate) fn defer(&mut self, h: RequestHandle) {
        if !self.deferred.contains(&h) {
            tracing::trace!("[rndv] req {} waits for a staging fragment", h);
            self.deferred.push_back(h);
        }
    }

    fn resume_deferred(&mut self) {
        let deferred: Vec<RequestHandle> = self.deferred.drain(..).collect();
        for h in deferred {
            if self.requests.contains(h) {
                self.drive(h);
            }
        }
    }

    /// Gives back everything `req` owns.
    pub(crate) fn release_resources(&mut self, req: &mut Request) {
        if let Some(rkey) = req.rkey.take() {
            rkey.destroy(&mut self.transport);
        }
        if let Some(memh) = req.memh.take() {
            self.transport.deregister(memh);
        }
        if let Some(fragment) = req.staging.take() {
            self.staging.release(fragment);
        }
    }

    /// Retires a sub-request and reports its outcome to its parent.
    pub(crate) fn finish_child(&mut self, h: RequestHandle) {
        let Some(mut req) = self.requests.remove(h) else {
            return;
        };
        self.release_resources(&mut req);
        let lane_bytes = match &req.kind {
            RequestKind::Rma(rma) => rma.lanes.lane_bytes(),
            RequestKind::Frag(frag) => frag.lane_bytes,
            RequestKind::PutPipeline(pipeline) => pipeline.lane_bytes,
            _ => [0; MAX_LANES],
        };
        let status = match &req.kind {
            RequestKind::Rma(rma) => match &rma.phase {
                RmaPhase::Ack(ack) => ack.status.merge(req.status),
                RmaPhase::Data => req.status,
            },
            RequestKind::PutPipeline(pipeline) => pipeline
                .ack
                .as_ref()
                .map_or(req.status, |ack| ack.status.merge(req.status)),
            _ => req.status,
        };
        let acked = match &req.kind {
            RequestKind::Rma(rma) => matches!(
                rma.purpose,
                RmaPurpose::SendPut {
                    fragment: false,
                    ..
                }
            ),
            RequestKind::PutPipeline(pipeline) => !pipeline.fragment,
            _ => false,
        };
        let done = ChildDone {
            status,
            length: req.buffer.length,
            lane_bytes,
            acked,
        };
        if let Some(parent) = req.parent {
            self.on_child_done(parent, done);
        }
    }

    fn on_child_done(&mut self, parent: RequestHandle, done: ChildDone) {
        let kind = match self.requests.get(parent).map(|req| &req.kind) {
            Some(RequestKind::Recv(RecvState {
                stage: RecvStage::Pipeline(_),
                ..
            }))
            | Some(RequestKind::PutPipeline(_)) => ParentKind::Pipeline,
            Some(RequestKind::Recv(_)) => ParentKind::Recv,
            Some(RequestKind::Send(_)) => ParentKind::Send,
            Some(RequestKind::Frag(_)) => ParentKind::Frag,
            Some(other) => {
                tracing::warn!("[rndv] req {} {} cannot own children", parent, other.name());
                return;
            }
            None => {
                tracing::trace!("[rndv] parent {} already gone", parent);
                return;
            }
        };
        match kind {
            ParentKind::Recv => self.recv_child_done(parent, done),
            ParentKind::Send => self.send_child_done(parent, done),
            ParentKind::Frag => self.frag_leg_done(parent, done.status, done.lane_bytes),
            ParentKind::Pipeline => self.pipeline_fragment_done(parent, done),
        }
    }

    /// Retires a top-level request and publishes its completion.
    pub(crate) fn complete_request(&mut self, h: RequestHandle, status: Status) {
        let Some(mut req) = self.requests.remove(h) else {
            return;
        };
        self.release_resources(&mut req);
        let length = match &req.kind {
            RequestKind::Recv(recv) => recv.size.min(req.buffer.length),
            _ => req.buffer.length,
        };
        let status = req.status.merge(status);
        tracing::debug!(
            "[rndv] req {} {} of {} bytes completed: {}",
            h,
            req.kind.name(),
            length,
            status
        );
        self.completed.insert(h, Completion { status, length });
    }
}

impl<T: Transport> Drop for Worker<T> {
    fn drop(&mut self) {
        for h in self.requests.handles() {
            if let Some(mut req) = self.requests.remove(h) {
                self.release_resources(&mut req);
            }
        }
        self.staging.destroy(&mut self.transport);
    }
}
