/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rendezvous protocol engine for large messages over RMA-capable
//! transports: remote key handling, RTS/RTR negotiation, bandwidth-weighted
//! striping over lanes, staged pipelines for device memory, and the ATS/ATP
//! acknowledgment protocol.

mod ack;
mod am;
mod config;
mod endpoint;
mod error;
mod memory;
mod negotiate;
mod pipeline;
pub mod proto;
mod request;
pub mod rkey;
mod staging;
mod transport;
mod worker;
mod zcopy;

pub use config::*;
pub use endpoint::*;
pub use error::*;
pub use memory::*;
pub use request::RequestHandle;
pub use staging::StagingStats;
pub use transport::*;
pub use worker::Completion;
pub use worker::Worker;

#[cfg(test)]
mod test_utils;
