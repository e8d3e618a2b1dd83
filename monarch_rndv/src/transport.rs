/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The transport seam.
//!
//! The rendezvous engine never touches a device itself. It drives a
//! `Transport`, which bundles three external services:
//!
//! 1. **Memory registration**: allocate, register and deregister buffers,
//!    and produce the per-domain key blobs that go into a packed remote key.
//! 2. **RMA verbs**: zero-copy get/put, active-message send, flush and fence
//!    on a given lane of a given endpoint.
//! 3. **Events**: completions of earlier operations, incoming active
//!    messages, and lanes that have send resources again.
//!
//! Operations that complete asynchronously take a `CompletionToken` and
//! report back through `TransportEvent::Completion` from `poll()`.

use bytes::Bytes;

use crate::endpoint::EpId;
use crate::error::Status;
use crate::memory::Buffer;
use crate::memory::LaneIndex;
use crate::memory::MdIndex;
use crate::memory::MdMap;
use crate::memory::MemHandle;
use crate::memory::MemoryType;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no send resources on lane {lane}")]
    NoResource { lane: LaneIndex },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("address range {addr:#x}+{length} is not accessible")]
    BadAddress { addr: u64, length: usize },

    #[error("transport failure: {0}")]
    Failed(String),
}

impl TransportError {
    pub fn status(&self) -> Status {
        match self {
            TransportError::NoResource { .. } => Status::NoResource,
            TransportError::Unsupported(_) => Status::Unreachable,
            TransportError::BadAddress { .. } | TransportError::Failed(_) => {
                Status::TransportFailure
            }
        }
    }
}

/// How an accepted operation proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issued {
    /// Finished before returning; no completion event follows.
    Done,
    /// A `TransportEvent::Completion` carrying the token follows.
    InProgress,
}

/// Opaque value echoed back with a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Completion {
        token: CompletionToken,
        status: Status,
    },
    /// An active message arrived on local endpoint `ep`.
    Message { ep: EpId, data: Bytes },
    /// `lane` of `ep` has send resources again.
    LaneReady { ep: EpId, lane: LaneIndex },
}

pub trait Transport {
    /// Allocates a buffer of `length` bytes of `mem_type`.
    fn alloc(&mut self, length: usize, mem_type: MemoryType) -> Result<Buffer, TransportError>;

    fn free(&mut self, buffer: Buffer);

    /// Registers `buffer` with the domains in `md_map`.
    fn register(&mut self, buffer: Buffer, md_map: MdMap) -> Result<MemHandle, TransportError>;

    fn deregister(&mut self, memh: MemHandle);

    /// Per-domain key blobs that let a peer access `memh`.
    fn pack_memh(&self, memh: &MemHandle) -> Result<Vec<(MdIndex, Bytes)>, TransportError>;

    /// Releases the handle a peer key blob was unpacked into.
    fn release_rkey(&mut self, md: MdIndex, key: &Bytes);

    /// Reads `local.length` bytes at `remote_addr` into `local`.
    fn get_zcopy(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        local: Buffer,
        remote_addr: u64,
        rkey: Option<&Bytes>,
        token: CompletionToken,
    ) -> Result<Issued, TransportError>;

    /// Writes `local` to `remote_addr`.
    fn put_zcopy(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        local: Buffer,
        remote_addr: u64,
        rkey: Option<&Bytes>,
        token: CompletionToken,
    ) -> Result<Issued, TransportError>;

    /// Sends one active message; the payload is copied before returning.
    fn am_send(&mut self, ep: EpId, lane: LaneIndex, data: Bytes) -> Result<(), TransportError>;

    /// Completes once every operation issued so far on the lane is remotely visible.
    fn flush(
        &mut self,
        ep: EpId,
        lane: LaneIndex,
        token: CompletionToken,
    ) -> Result<Issued, TransportError>;

    /// Orders operations issued after the fence behind those issued before it.
    fn fence(&mut self, ep: EpId, lane: LaneIndex) -> Result<(), TransportError>;

    /// Maps a peer address to a local pointer through a key of domain `md`.
    fn rkey_ptr(&self, md: MdIndex, key: &Bytes, remote_addr: u64) -> Result<u64, TransportError>;

    /// Copies between two CPU-accessible local ranges.
    fn copy(&mut self, dst: u64, src: u64, length: usize) -> Result<(), TransportError>;

    /// Reads CPU-accessible local memory, for buffered-copy sends.
    fn load(&self, addr: u64, length: usize) -> Result<Bytes, TransportError>;

    /// Writes CPU-accessible local memory, for buffered-copy receives.
    fn store(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Drops outstanding work of a torn-down endpoint. Completions of dropped
    /// operations may still be reported and are ignored by the worker.
    fn discard(&mut self, _ep: EpId) {}

    fn poll(&mut self) -> Option<TransportEvent>;
}
