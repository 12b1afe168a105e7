// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scene context: the camera, sampling parameters, and light inventory the
//! runtime needs to generate and finish rays.
//!
//! The intersection engine owns the full scene; the worker only keeps what
//! ray generation and bookkeeping require. Objects are loaded from the
//! storage backend under the well-known keys `CAMERA`, `SAMPLER`, `LIGHTS`.

use crate::error::Result;
use crate::protocol::records::Bounds2i;
use crate::protocol::wire::{put_u32, Chunk};
use crate::ray::{RayState, SampleInfo};
use crate::storage::StorageBackend;

/// Default path depth when the sampler object does not override it.
pub const DEFAULT_MAX_DEPTH: u32 = 5;

/// A camera ray produced for one (pixel, sample) pair.
#[derive(Debug, Clone, Copy)]
pub struct CameraRay {
    pub p_film: (f32, f32),
    pub weight: f32,
    pub origin: [f32; 3],
    pub direction: [f32; 3],
}

/// Process-wide scene state, passed by reference to the handlers that need
/// it (never a module-level singleton).
#[derive(Debug)]
pub struct SceneContext {
    pub sample_bounds: Bounds2i,
    pub samples_per_pixel: u32,
    pub max_depth: u32,
    pub light_count: u32,
    initialized: bool,
}

impl SceneContext {
    /// An empty context; rays cannot be generated until `initialize` ran.
    pub fn new() -> Self {
        Self {
            sample_bounds: Bounds2i {
                x_min: 0,
                y_min: 0,
                x_max: 0,
                y_max: 0,
            },
            samples_per_pixel: 1,
            max_depth: DEFAULT_MAX_DEPTH,
            light_count: 0,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Load camera, sampler and lights from the backend. Idempotent.
    ///
    /// `samples_override` > 0 replaces the sampler's own samples-per-pixel.
    pub fn initialize(
        &mut self,
        backend: &dyn StorageBackend,
        samples_override: u32,
    ) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        let camera = backend.get("CAMERA")?;
        let mut chunk = Chunk::new(&camera);
        self.sample_bounds = Bounds2i {
            x_min: chunk.i32()?,
            y_min: chunk.i32()?,
            x_max: chunk.i32()?,
            y_max: chunk.i32()?,
        };

        let sampler = backend.get("SAMPLER")?;
        let mut chunk = Chunk::new(&sampler);
        self.samples_per_pixel = chunk.u32()?;
        self.max_depth = chunk.u32().unwrap_or(DEFAULT_MAX_DEPTH);

        if samples_override > 0 {
            self.samples_per_pixel = samples_override;
        }

        self.light_count = match backend.get("LIGHTS") {
            Ok(lights) => Chunk::new(&lights).u32().unwrap_or(0),
            Err(_) => 0,
        };

        self.initialized = true;
        log::info!(
            "[SCENE] initialized bounds=({},{})..({},{}) spp={} depth={} lights={}",
            self.sample_bounds.x_min,
            self.sample_bounds.y_min,
            self.sample_bounds.x_max,
            self.sample_bounds.y_max,
            self.samples_per_pixel,
            self.max_depth,
            self.light_count
        );
        Ok(())
    }

    /// Encode a camera object for this context's bounds (used by tests and
    /// local scene preparation).
    pub fn encode_camera(bounds: Bounds2i) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&bounds.x_min.to_be_bytes());
        buf.extend_from_slice(&bounds.y_min.to_be_bytes());
        buf.extend_from_slice(&bounds.x_max.to_be_bytes());
        buf.extend_from_slice(&bounds.y_max.to_be_bytes());
        buf
    }

    /// Encode a sampler object.
    pub fn encode_sampler(samples_per_pixel: u32, max_depth: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, samples_per_pixel);
        put_u32(&mut buf, max_depth);
        buf
    }

    /// Deterministic pinhole camera ray for one (pixel, sample) pair.
    pub fn camera_ray(&self, pixel: (i32, i32), sample: u32) -> CameraRay {
        let width = (self.sample_bounds.x_max - self.sample_bounds.x_min).max(1) as f32;
        let height = (self.sample_bounds.y_max - self.sample_bounds.y_min).max(1) as f32;

        // Stratify the sample inside the pixel along a fixed diagonal.
        let offset = (sample as f32 + 0.5) / self.samples_per_pixel.max(1) as f32;
        let p_film = (pixel.0 as f32 + offset, pixel.1 as f32 + offset);

        let ndc_x = (p_film.0 - self.sample_bounds.x_min as f32) / width * 2.0 - 1.0;
        let ndc_y = (p_film.1 - self.sample_bounds.y_min as f32) / height * 2.0 - 1.0;

        let len = (ndc_x * ndc_x + ndc_y * ndc_y + 1.0).sqrt();
        CameraRay {
            p_film,
            weight: 1.0,
            origin: [0.0; 3],
            direction: [ndc_x / len, ndc_y / len, 1.0 / len],
        }
    }

    /// Build the initial [`RayState`] for one (pixel, sample) pair.
    pub fn starting_ray(&self, pixel: (i32, i32), sample: u32) -> RayState {
        let camera_ray = self.camera_ray(pixel, sample);
        let extent_x = (self.sample_bounds.x_max - self.sample_bounds.x_min).max(1) as i64;
        let sample_id = ((pixel.0 as i64 - self.sample_bounds.x_min as i64)
            + (pixel.1 as i64 - self.sample_bounds.y_min as i64) * extent_x)
            as u64
            * self.samples_per_pixel as u64
            + sample as u64;

        let mut ray = RayState {
            sample: SampleInfo {
                id: sample_id,
                num: sample,
                pixel,
                p_film: camera_ray.p_film,
                weight: camera_ray.weight,
            },
            origin: camera_ray.origin,
            direction: camera_ray.direction,
            remaining_bounces: self.max_depth,
            ..RayState::default()
        };
        ray.start_trace();
        ray
    }
}

impl Default for SceneContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileBackend;
    use crate::storage::StorageBackend as _;

    fn test_backend(bounds: Bounds2i, spp: u32) -> FileBackend {
        let dir = std::env::temp_dir().join(format!(
            "dray-scene-{}-{}",
            std::process::id(),
            spp
        ));
        let backend = FileBackend::new(&dir);
        backend
            .put("CAMERA", &SceneContext::encode_camera(bounds))
            .expect("camera");
        backend
            .put("SAMPLER", &SceneContext::encode_sampler(spp, 4))
            .expect("sampler");
        backend
    }

    #[test]
    fn test_initialize_reads_objects() {
        let bounds = Bounds2i {
            x_min: 0,
            y_min: 0,
            x_max: 16,
            y_max: 8,
        };
        let backend = test_backend(bounds, 4);

        let mut scene = SceneContext::new();
        scene.initialize(&backend, 0).expect("initialize");
        assert!(scene.is_initialized());
        assert_eq!(scene.sample_bounds, bounds);
        assert_eq!(scene.samples_per_pixel, 4);
        assert_eq!(scene.max_depth, 4);
    }

    #[test]
    fn test_samples_override_wins() {
        let bounds = Bounds2i {
            x_min: 0,
            y_min: 0,
            x_max: 4,
            y_max: 4,
        };
        let backend = test_backend(bounds, 16);

        let mut scene = SceneContext::new();
        scene.initialize(&backend, 2).expect("initialize");
        assert_eq!(scene.samples_per_pixel, 2);
    }

    #[test]
    fn test_starting_ray_ids_are_unique_per_sample() {
        let mut scene = SceneContext::new();
        scene.sample_bounds = Bounds2i {
            x_min: 0,
            y_min: 0,
            x_max: 8,
            y_max: 8,
        };
        scene.samples_per_pixel = 2;
        scene.initialized = true;

        let a = scene.starting_ray((1, 0), 0);
        let b = scene.starting_ray((1, 0), 1);
        let c = scene.starting_ray((2, 0), 0);
        assert_ne!(a.sample.id, b.sample.id);
        assert_ne!(b.sample.id, c.sample.id);
        assert_eq!(a.current_treelet(), 0, "fresh rays start at the root");
        assert!(!a.to_visit_empty());
    }

    #[test]
    fn test_camera_ray_is_normalized() {
        let mut scene = SceneContext::new();
        scene.sample_bounds = Bounds2i {
            x_min: 0,
            y_min: 0,
            x_max: 32,
            y_max: 32,
        };
        scene.samples_per_pixel = 1;
        scene.initialized = true;

        let ray = scene.camera_ray((31, 0), 0);
        let norm: f32 = ray.direction.iter().map(|c| c * c).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "direction must be unit length");
    }
}
