/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rendezvous wire messages.
//!
//! Every control message travels as one active message whose body is the
//! bincode encoding of `RndvMessage`. Request ids are the wire form of the
//! sender's `RequestHandle` and are only ever interpreted by the side that
//! minted them.

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

use crate::endpoint::EpId;
use crate::error::RndvError;
use crate::error::Status;

/// Who produced the message being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtsOrigin {
    /// A tagged send, matched against posted receives by tag.
    Tag,
    /// An active-message send; `tag` carries the message id.
    Am,
}

/// Request-To-Send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtsHdr {
    pub ep_id: EpId,
    pub sreq_id: u64,
    pub size: u64,
    pub origin: RtsOrigin,
    pub tag: u64,
    /// Sender buffer address, 0 when the receiver may not read it directly.
    pub address: u64,
    pub rkey: Option<Bytes>,
}

/// Request-To-Receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtrHdr {
    pub sreq_id: u64,
    pub rreq_id: u64,
    /// Receiver buffer address, 0 when the sender may not write it directly.
    pub address: u64,
    pub size: u64,
    pub offset: u64,
    /// The RTR covers one staging fragment of a larger receive.
    pub fragment: bool,
    pub rkey: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataHdr {
    pub rreq_id: u64,
    /// Offset relative to the start of the range the RTR asked for.
    pub offset: u64,
    pub payload: Bytes,
}

/// ATS and ATP body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckHdr {
    pub req_id: u64,
    pub status: Status,
    /// Bytes acknowledged by this message.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum RndvMessage {
    Rts(RtsHdr),
    Rtr(RtrHdr),
    Data(DataHdr),
    /// Ack-to-sender.
    Ats(AckHdr),
    /// Ack-to-put-sender.
    Atp(AckHdr),
}

impl RndvMessage {
    pub fn encode(&self) -> Result<Bytes, RndvError> {
        Ok(bincode::serialize(self)?.into())
    }

    pub fn decode(data: &[u8]) -> Result<Self, RndvError> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RndvMessage::Rts(_) => "rts",
            RndvMessage::Rtr(_) => "rtr",
            RndvMessage::Data(_) => "data",
            RndvMessage::Ats(_) => "ats",
            RndvMessage::Atp(_) => "atp",
        }
    }
}

/// Encoded size of an ATP, used to decide whether a lane can carry one.
pub fn ack_wire_size() -> usize {
    let probe = RndvMessage::Atp(AckHdr {
        req_id: u64::MAX,
        status: Status::TransportFailure,
        size: u64::MAX,
    });
    bincode::serialized_size(&probe).map_or(usize::MAX, |size| size as usize)
}

/// Encoded size of a DATA message without its payload bytes.
pub fn data_header_size() -> usize {
    let probe = RndvMessage::Data(DataHdr {
        rreq_id: u64::MAX,
        offset: u64::MAX,
        payload: Bytes::new(),
    });
    bincode::serialized_size(&probe).map_or(usize::MAX, |size| size as usize)
}
