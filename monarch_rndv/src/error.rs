/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Errors raised inside the rendezvous engine and the completion status
//! that travels in acknowledgments.

use serde::Deserialize;
use serde::Serialize;

use crate::endpoint::EpId;
use crate::transport::TransportError;

/// Completion status of a transfer.
///
/// This is the only error channel visible outside the engine: it is
/// delivered with a request's completion and echoed to the peer in
/// ATS/ATP messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    MessageTruncated,
    Unreachable,
    InvalidKey,
    Canceled,
    NoResource,
    TransportFailure,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Keeps the first error seen; `Ok` never overwrites an error.
    pub fn merge(self, other: Status) -> Status {
        if self.is_ok() { other } else { self }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::MessageTruncated => "message truncated",
            Status::Unreachable => "destination is unreachable",
            Status::InvalidKey => "invalid remote key",
            Status::Canceled => "canceled",
            Status::NoResource => "no resources are available",
            Status::TransportFailure => "transport failure",
        };
        write!(f, "{}", s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RndvError {
    #[error("invalid remote key: {0}")]
    InvalidKey(String),

    #[error("remote memory unreachable through endpoint config {cfg_index}")]
    Unreachable { cfg_index: u32 },

    #[error("message truncated: announced {announced} bytes, receive buffer holds {capacity}")]
    Truncated { announced: usize, capacity: usize },

    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EpId),

    #[error("unknown or stale request id {0:#x}")]
    UnknownRequest(u64),

    #[error("rkey resolved for endpoint config {cached}, endpoint uses config {current}")]
    EndpointMismatch { cached: u32, current: u32 },

    #[error("staging pool exhausted: {capacity} fragments in flight")]
    PoolExhausted { capacity: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("request canceled")]
    Canceled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

impl RndvError {
    /// The status reported to the request owner (and the peer) for this error.
    pub fn status(&self) -> Status {
        match self {
            RndvError::InvalidKey(_) | RndvError::Codec(_) => Status::InvalidKey,
            RndvError::Unreachable { .. } | RndvError::UnknownEndpoint(_) => Status::Unreachable,
            RndvError::Truncated { .. } => Status::MessageTruncated,
            RndvError::PoolExhausted { .. } => Status::NoResource,
            RndvError::Canceled => Status::Canceled,
            RndvError::Transport(e) => e.status(),
            RndvError::UnknownRequest(_)
            | RndvError::EndpointMismatch { .. }
            | RndvError::InvalidConfig(_) => Status::TransportFailure,
        }
    }
}
