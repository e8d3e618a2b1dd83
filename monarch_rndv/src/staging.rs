/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pooled host-memory staging fragments.
//!
//! The pool grows in chunks of `grow` fragments. Every chunk is one host
//! allocation registered once with the staging domains; fragments are fixed
//! size slices of a chunk and share its registration. The pool never holds
//! more than `capacity` fragments. When every fragment is in use `acquire`
//! returns `None` and the caller waits for a fragment to come back.

use serde::Deserialize;
use serde::Serialize;

use crate::error::RndvError;
use crate::memory::Buffer;
use crate::memory::MdMap;
use crate::memory::MemHandle;
use crate::memory::MemoryType;
use crate::transport::Transport;

/// A fragment checked out of the pool. Must be handed back with `release`.
#[derive(Debug, PartialEq, Eq)]
pub struct StagingFragment {
    pub buffer: Buffer,
    chunk: usize,
}

struct Chunk {
    buffer: Buffer,
    memh: MemHandle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingStats {
    /// Fragments carved out of allocated chunks.
    pub allocated: usize,
    pub in_use: usize,
    /// Largest `in_use` seen.
    pub high_watermark: usize,
}

pub(crate) struct StagingPool {
    frag_size: usize,
    capacity: usize,
    grow: usize,
    md_map: MdMap,
    chunks: Vec<Chunk>,
    free: Vec<StagingFragment>,
    stats: StagingStats,
}

impl StagingPool {
    pub fn new(frag_size: usize, capacity: usize, grow: usize, md_map: MdMap) -> Self {
        Self {
            frag_size,
            capacity,
            grow: grow.max(1),
            md_map,
            chunks: Vec::new(),
            free: Vec::new(),
            stats: StagingStats::default(),
        }
    }

    /// Takes a fragment, growing the pool if it is below capacity.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot allocate or register a new chunk, or
    /// if the pool cannot hold even one fragment.
    pub fn acquire<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<Option<StagingFragment>, RndvError> {
        if self.free.is_empty() {
            if self.capacity == 0 {
                return Err(RndvError::PoolExhausted { capacity: 0 });
            }
            if self.stats.allocated < self.capacity {
                let count = self.grow.min(self.capacity - self.stats.allocated);
                self.grow_by(transport, count)?;
            }
        }
        let Some(fragment) = self.free.pop() else {
            tracing::trace!(
                "[staging] pool exhausted with {} fragments in use",
                self.stats.in_use
            );
            return Ok(None);
        };
        self.stats.in_use += 1;
        self.stats.high_watermark = self.stats.high_watermark.max(self.stats.in_use);
        Ok(Some(fragment))
    }

    fn grow_by<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        count: usize,
    ) -> Result<(), RndvError> {
        let buffer = transport.alloc(self.frag_size * count, MemoryType::Host)?;
        let memh = match transport.register(buffer, self.md_map) {
            Ok(memh) => memh,
            Err(e) => {
                transport.free(buffer);
                return Err(e.into());
            }
        };
        let chunk = self.chunks.len();
        // Reverse so fragments come out in address order.
        for i in (0..count).rev() {
            self.free.push(StagingFragment {
                buffer: buffer.slice(i * self.frag_size, self.frag_size),
                chunk,
            });
        }
        self.chunks.push(Chunk { buffer, memh });
        self.stats.allocated += count;
        tracing::debug!(
            "[staging] grew pool by {} fragments of {} bytes at {:#x}",
            count,
            self.frag_size,
            buffer.addr
        );
        Ok(())
    }

    pub fn release(&mut self, fragment: StagingFragment) {
        debug_assert!(fragment.chunk < self.chunks.len());
        self.stats.in_use -= 1;
        self.free.push(fragment);
    }

    /// Registration covering `fragment`.
    pub fn memh(&self, fragment: &StagingFragment) -> &MemHandle {
        &self.chunks[fragment.chunk].memh
    }

    pub fn stats(&self) -> StagingStats {
        self.stats
    }

    /// Deregisters and frees every chunk. Fragments still checked out become invalid.
    pub fn destroy<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if self.stats.in_use > 0 {
            tracing::warn!(
                "[staging] destroying pool with {} fragments in use",
                self.stats.in_use
            );
        }
        self.free.clear();
        for chunk in self.chunks.drain(..) {
            transport.deregister(chunk.memh);
            transport.free(chunk.buffer);
        }
        self.stats = StagingStats::default();
    }
}
