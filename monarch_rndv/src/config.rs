/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Worker-wide rendezvous configuration.

use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RndvError;

/// Restricts which rendezvous schemes a worker may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RndvMode {
    /// Pick per message from memory types, capabilities and thresholds.
    Auto,
    /// Only receiver-initiated GET; the sender always advertises its address.
    GetZcopy,
    /// Only sender-initiated PUT; the sender never advertises its address.
    PutZcopy,
}

impl FromStr for RndvMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RndvMode::Auto),
            "get_zcopy" | "get" => Ok(RndvMode::GetZcopy),
            "put_zcopy" | "put" => Ok(RndvMode::PutZcopy),
            other => Err(anyhow::anyhow!("unknown rendezvous mode '{}'", other)),
        }
    }
}

/// Represents rendezvous protocol configuration for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RndvConfig {
    /// `rndv_mode` - Which schemes negotiation is allowed to choose.
    pub rndv_mode: RndvMode,
    /// `frag_size` - Size of one staging fragment in bytes.
    pub frag_size: usize,
    /// `rkey_ptr_seg_size` - Bytes copied per progress call on the rkey-pointer path.
    pub rkey_ptr_seg_size: usize,
    /// `multi_lane_max_ratio` - Lanes slower than the fastest lane by more than
    /// this factor are not used for striping.
    pub multi_lane_max_ratio: f64,
    /// `put_force_flush` - Always flush every lane before sending ATP, even
    /// when the lanes could carry a fenced ATP themselves.
    pub put_force_flush: bool,
    /// `max_staging_frags` - Capacity of the staging pool, in fragments.
    pub max_staging_frags: usize,
    /// `staging_grow_frags` - Fragments allocated per pool growth step.
    pub staging_grow_frags: usize,
    /// `max_events_per_progress` - Transport events drained by one `progress()` call.
    pub max_events_per_progress: usize,
}

impl Default for RndvConfig {
    fn default() -> Self {
        Self {
            rndv_mode: RndvMode::Auto,
            frag_size: 512 * 1024,
            rkey_ptr_seg_size: 512 * 1024,
            multi_lane_max_ratio: 4.0,
            put_force_flush: false,
            max_staging_frags: 128,
            staging_grow_frags: 8,
            max_events_per_progress: 64,
        }
    }
}

impl RndvConfig {
    /// Create a configuration from defaults overridden by `MONARCH_RNDV_*`
    /// environment variables.
    ///
    /// Recognized variables: `MONARCH_RNDV_MODE`, `MONARCH_RNDV_FRAG_SIZE`,
    /// `MONARCH_RNDV_RKEY_PTR_SEG_SIZE`, `MONARCH_RNDV_MULTI_LANE_MAX_RATIO`,
    /// `MONARCH_RNDV_PUT_FORCE_FLUSH`, `MONARCH_RNDV_MAX_STAGING_FRAGS`.
    ///
    /// # Errors
    ///
    /// Fails if a variable is set to a value that does not parse, or if the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, anyhow::Error> {
        fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
        {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|e| anyhow::anyhow!("{}={:?}: {}", name, raw, e)),
            }
        }

        let mut config = Self::default();
        if let Some(mode) = parse::<RndvMode>(&lookup, "MONARCH_RNDV_MODE")? {
            config.rndv_mode = mode;
        }
        if let Some(v) = parse(&lookup, "MONARCH_RNDV_FRAG_SIZE")? {
            config.frag_size = v;
        }
        if let Some(v) = parse(&lookup, "MONARCH_RNDV_RKEY_PTR_SEG_SIZE")? {
            config.rkey_ptr_seg_size = v;
        }
        if let Some(v) = parse(&lookup, "MONARCH_RNDV_MULTI_LANE_MAX_RATIO")? {
            config.multi_lane_max_ratio = v;
        }
        if let Some(v) = parse(&lookup, "MONARCH_RNDV_PUT_FORCE_FLUSH")? {
            config.put_force_flush = v;
        }
        if let Some(v) = parse(&lookup, "MONARCH_RNDV_MAX_STAGING_FRAGS")? {
            config.max_staging_frags = v;
        }
        config
            .validate()
            .context("invalid rendezvous configuration from environment")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RndvError> {
        if self.frag_size == 0 {
            return Err(RndvError::InvalidConfig("frag_size must be non-zero".into()));
        }
        if self.rkey_ptr_seg_size == 0 {
            return Err(RndvError::InvalidConfig(
                "rkey_ptr_seg_size must be non-zero".into(),
            ));
        }
        if !(self.multi_lane_max_ratio >= 1.0) {
            return Err(RndvError::InvalidConfig(format!(
                "multi_lane_max_ratio must be at least 1, got {}",
                self.multi_lane_max_ratio
            )));
        }
        if self.max_staging_frags == 0 || self.staging_grow_frags == 0 {
            return Err(RndvError::InvalidConfig(
                "staging pool needs room for at least one fragment".into(),
            ));
        }
        if self.max_events_per_progress == 0 {
            return Err(RndvError::InvalidConfig(
                "max_events_per_progress must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for RndvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RndvConfig {{ rndv_mode: {:?}, frag_size: {}, rkey_ptr_seg_size: {}, multi_lane_max_ratio: {}, put_force_flush: {}, max_staging_frags: {}, staging_grow_frags: {}, max_events_per_progress: {} }}",
            self.rndv_mode,
            self.frag_size,
            self.rkey_ptr_seg_size,
            self.multi_lane_max_ratio,
            self.put_force_flush,
            self.max_staging_frags,
            self.staging_grow_frags,
            self.max_events_per_progress,
        )
    }
}
