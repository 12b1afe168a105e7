// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The tracing seam.
//!
//! The intersection engine and the shading logic are external collaborators;
//! the runtime consumes them through [`Tracer`]. It is a capability set
//! (advance a traversal, expand a hit into new rays), not an identity.

use crate::ray::RayState;
use crate::scene::SceneContext;

/// Result of shading a hit.
#[derive(Debug, Default)]
pub struct ShadeResult {
    /// Bounce and shadow rays spawned by the hit.
    pub rays: Vec<RayState>,
    /// True when this hit completes the ray's path.
    pub path_finished: bool,
}

/// Trace/shade capability over the locally loaded treelets.
pub trait Tracer {
    /// Advance the ray's traversal through the local BVH. On return exactly
    /// one of: the ray hit something, its stack is non-empty (continues in
    /// another treelet), or it terminated.
    fn trace(&self, ray: RayState, scene: &SceneContext) -> RayState;

    /// Shade a completed hit: spawn bounce/shadow rays and report whether
    /// the path is finished.
    fn shade(&self, ray: RayState, scene: &SceneContext) -> ShadeResult;
}

/// Tracer used when no intersection engine is wired in: every traversal
/// completes immediately with a miss, so all rays finish with zero radiance.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn trace(&self, mut ray: RayState, _scene: &SceneContext) -> RayState {
        ray.to_visit.clear();
        ray.hit = false;
        ray
    }

    fn shade(&self, _ray: RayState, _scene: &SceneContext) -> ShadeResult {
        ShadeResult {
            rays: Vec::new(),
            path_finished: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_tracer_terminates_traversal() {
        let mut ray = RayState::default();
        ray.start_trace();

        let traced = NullTracer.trace(ray, &SceneContext::new());
        assert!(traced.to_visit_empty());
        assert!(!traced.hit);
    }

    #[test]
    fn test_null_tracer_shade_finishes_path() {
        let result = NullTracer.shade(RayState::default(), &SceneContext::new());
        assert!(result.rays.is_empty());
        assert!(result.path_finished);
    }
}
