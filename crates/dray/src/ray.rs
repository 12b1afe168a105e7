// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ray traversal state.
//!
//! A [`RayState`] is the unit of work shipped between workers: a camera or
//! bounce ray together with its film sample, its remaining BVH traversal
//! stack, and its accumulated radiance terms. Rays are owned by exactly one
//! queue at a time and move between queues by value.

use crate::error::{Error, Result};
use crate::protocol::wire::{put_f32, put_i32, put_u16, put_u32, put_u64, put_u8, Chunk};

/// Worker identity assigned by the coordinator (non-zero once assigned;
/// id 0 is the coordinator itself in the peer table).
pub type WorkerId = u64;

/// Opaque treelet identity; the unit of scene partitioning.
pub type TreeletId = u32;

const FLAG_TRACK: u8 = 1 << 0;
const FLAG_SHADOW: u8 = 1 << 1;
const FLAG_HIT: u8 = 1 << 2;

/// One entry of the traversal stack: a BVH node within a treelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeletNode {
    pub treelet: TreeletId,
    pub node: u32,
}

/// Film sample this ray contributes to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleInfo {
    /// Globally unique sample id; doubles as the path id.
    pub id: u64,
    /// Sample index within the pixel.
    pub num: u32,
    pub pixel: (i32, i32),
    pub p_film: (f32, f32),
    pub weight: f32,
}

/// Traversal state of one ray.
#[derive(Debug, Clone, PartialEq)]
pub struct RayState {
    /// Sampled into the per-ray action trace.
    pub track: bool,
    /// Inter-worker transfers this ray has undergone.
    pub hop: u16,
    /// Wire (re-)transmissions since the last receive.
    pub tick: u16,
    pub sample: SampleInfo,
    pub origin: [f32; 3],
    pub direction: [f32; 3],
    pub t_max: f32,
    /// Path throughput.
    pub beta: [f32; 3],
    /// Direct-light contribution under evaluation.
    pub ld: [f32; 3],
    pub remaining_bounces: u32,
    pub is_shadow_ray: bool,
    pub hit: bool,
    /// Treelet where the current hit was found; meaningful only when `hit`.
    pub hit_treelet: TreeletId,
    /// BVH nodes still to test, innermost last. Empty means traversal is
    /// complete.
    pub to_visit: Vec<TreeletNode>,
}

impl RayState {
    /// Path identity: one sample traces exactly one path.
    pub fn path_id(&self) -> u64 {
        self.sample.id
    }

    pub fn to_visit_empty(&self) -> bool {
        self.to_visit.is_empty()
    }

    pub fn to_visit_top(&self) -> Option<TreeletNode> {
        self.to_visit.last().copied()
    }

    /// The treelet this ray's traversal currently sits in: the top of the
    /// stack, or the hit treelet once traversal has completed with a hit.
    pub fn current_treelet(&self) -> TreeletId {
        self.to_visit
            .last()
            .map(|node| node.treelet)
            .unwrap_or(self.hit_treelet)
    }

    /// Reset traversal to the scene root (treelet 0, node 0).
    pub fn start_trace(&mut self) {
        self.hit = false;
        self.hit_treelet = 0;
        self.to_visit.clear();
        self.to_visit.push(TreeletNode { treelet: 0, node: 0 });
    }

    /// Final contribution `beta * ld`, component-wise.
    pub fn contribution(&self) -> [f32; 3] {
        [
            self.beta[0] * self.ld[0],
            self.beta[1] * self.ld[1],
            self.beta[2] * self.ld[2],
        ]
    }

    /// Serialized size, for trace logs and packet budgeting.
    pub fn serialized_size(&self) -> usize {
        // flags + hop + tick + bounces + hit_treelet
        1 + 2 + 2 + 4 + 4
            // sample
            + 8 + 4 + 8 + 8 + 4
            // origin + direction + t_max + beta + ld
            + 12 + 12 + 4 + 12 + 12
            // stack
            + 2 + self.to_visit.len() * 8
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());

        let mut flags = 0u8;
        if self.track {
            flags |= FLAG_TRACK;
        }
        if self.is_shadow_ray {
            flags |= FLAG_SHADOW;
        }
        if self.hit {
            flags |= FLAG_HIT;
        }
        put_u8(&mut buf, flags);
        put_u16(&mut buf, self.hop);
        put_u16(&mut buf, self.tick);
        put_u32(&mut buf, self.remaining_bounces);
        put_u32(&mut buf, self.hit_treelet);

        put_u64(&mut buf, self.sample.id);
        put_u32(&mut buf, self.sample.num);
        put_i32(&mut buf, self.sample.pixel.0);
        put_i32(&mut buf, self.sample.pixel.1);
        put_f32(&mut buf, self.sample.p_film.0);
        put_f32(&mut buf, self.sample.p_film.1);
        put_f32(&mut buf, self.sample.weight);

        for c in self.origin {
            put_f32(&mut buf, c);
        }
        for c in self.direction {
            put_f32(&mut buf, c);
        }
        put_f32(&mut buf, self.t_max);
        for c in self.beta {
            put_f32(&mut buf, c);
        }
        for c in self.ld {
            put_f32(&mut buf, c);
        }

        put_u16(&mut buf, self.to_visit.len() as u16);
        for node in &self.to_visit {
            put_u32(&mut buf, node.treelet);
            put_u32(&mut buf, node.node);
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut chunk = Chunk::new(data);

        let flags = chunk.u8()?;
        let hop = chunk.u16()?;
        let tick = chunk.u16()?;
        let remaining_bounces = chunk.u32()?;
        let hit_treelet = chunk.u32()?;

        let sample = SampleInfo {
            id: chunk.u64()?,
            num: chunk.u32()?,
            pixel: (chunk.i32()?, chunk.i32()?),
            p_film: (chunk.f32()?, chunk.f32()?),
            weight: chunk.f32()?,
        };

        let origin = [chunk.f32()?, chunk.f32()?, chunk.f32()?];
        let direction = [chunk.f32()?, chunk.f32()?, chunk.f32()?];
        let t_max = chunk.f32()?;
        let beta = [chunk.f32()?, chunk.f32()?, chunk.f32()?];
        let ld = [chunk.f32()?, chunk.f32()?, chunk.f32()?];

        let stack_len = chunk.u16()? as usize;
        let mut to_visit = Vec::with_capacity(stack_len);
        for _ in 0..stack_len {
            to_visit.push(TreeletNode {
                treelet: chunk.u32()?,
                node: chunk.u32()?,
            });
        }

        if !chunk.is_empty() {
            return Err(Error::Protocol("trailing bytes after ray record"));
        }

        Ok(Self {
            track: flags & FLAG_TRACK != 0,
            hop,
            tick,
            sample,
            origin,
            direction,
            t_max,
            beta,
            ld,
            remaining_bounces,
            is_shadow_ray: flags & FLAG_SHADOW != 0,
            hit: flags & FLAG_HIT != 0,
            hit_treelet,
            to_visit,
        })
    }
}

impl Default for RayState {
    fn default() -> Self {
        Self {
            track: false,
            hop: 0,
            tick: 0,
            sample: SampleInfo {
                id: 0,
                num: 0,
                pixel: (0, 0),
                p_film: (0.0, 0.0),
                weight: 1.0,
            },
            origin: [0.0; 3],
            direction: [0.0, 0.0, 1.0],
            t_max: f32::INFINITY,
            beta: [1.0; 3],
            ld: [0.0; 3],
            remaining_bounces: 0,
            is_shadow_ray: false,
            hit: false,
            hit_treelet: 0,
            to_visit: Vec::new(),
        }
    }
}
