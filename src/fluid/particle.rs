//! Fluid particle storage, scene seeding and published frames.
//!
//! Particles live in parallel arrays indexed by a stable id. The set is sized
//! once at construction and never grows or shrinks.

use std::sync::Arc;

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};

use super::error::SetupError;

/// Parallel per-particle buffers owned by the solver.
#[derive(Clone, Debug, Default)]
pub struct ParticleSet {
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    /// Force accumulator. Cleared after every integration.
    pub forces: Vec<Vec3>,
    pub densities: Vec<f32>,
    pub pressures: Vec<f32>,
}

impl ParticleSet {
    /// Builds a set from matching position and velocity buffers.
    pub fn new(positions: Vec<Vec3>, velocities: Vec<Vec3>) -> Result<Self, SetupError> {
        if positions.is_empty() {
            return Err(SetupError::EmptyParticleSet);
        }
        if positions.len() != velocities.len() {
            return Err(SetupError::LengthMismatch {
                positions: positions.len(),
                velocities: velocities.len(),
            });
        }
        let count = positions.len();
        Ok(Self {
            positions,
            velocities,
            forces: vec![Vec3::ZERO; count],
            densities: vec![0.0; count],
            pressures: vec![0.0; count],
        })
    }

    /// Particles at rest on `block`'s lattice, all moving with `velocity`.
    pub fn from_block(block: &FluidBlock, velocity: Vec3) -> Result<Self, SetupError> {
        let positions = block.positions();
        let velocities = vec![velocity; positions.len()];
        Self::new(positions, velocities)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Sum of `mass * velocity` over every particle.
    pub fn momentum(&self, mass: f32) -> Vec3 {
        self.velocities.iter().copied().sum::<Vec3>() * mass
    }

    /// Index of the first particle with a non-finite position or velocity.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.positions
            .iter()
            .zip(&self.velocities)
            .position(|(p, v)| !p.is_finite() || !v.is_finite())
    }
}

/// A box of fluid seeded on a regular lattice.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidBlock {
    /// Center of the block.
    pub origin: Vec3,
    /// Edge lengths.
    pub size: Vec3,
    /// Particles per axis.
    pub cells: UVec3,
    /// Shift every other particle by half a lattice step on each axis.
    pub stagger: bool,
}

impl Default for FluidBlock {
    fn default() -> Self {
        Self {
            origin: Vec3::ZERO,
            size: Vec3::splat(2.0),
            cells: UVec3::splat(5),
            stagger: false,
        }
    }
}

impl FluidBlock {
    /// Cube of `cells³` particles with edge `size` centered on `origin`.
    pub fn cube(origin: Vec3, size: f32, cells: u32) -> Self {
        Self {
            origin,
            size: Vec3::splat(size),
            cells: UVec3::splat(cells),
            stagger: false,
        }
    }

    pub fn with_stagger(mut self, stagger: bool) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn count(&self) -> usize {
        self.cells.x as usize * self.cells.y as usize * self.cells.z as usize
    }

    /// Lattice step on each axis.
    pub fn step(&self) -> Vec3 {
        self.size / self.cells.max(UVec3::ONE).as_vec3()
    }

    /// Lattice positions, x-major then y then z.
    pub fn positions(&self) -> Vec<Vec3> {
        let min = self.origin - self.size * 0.5;
        let step = self.step();
        let mut positions = Vec::with_capacity(self.count());

        for x in 0..self.cells.x {
            for y in 0..self.cells.y {
                for z in 0..self.cells.z {
                    let mut position = min + step * UVec3::new(x, y, z).as_vec3();
                    if self.stagger && positions.len() % 2 == 0 {
                        position += step * 0.5;
                    }
                    positions.push(position);
                }
            }
        }

        positions
    }
}

/// Immutable snapshot of the particle buffers, published to consumers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleFrame {
    pub step: u64,
    /// Simulated time in seconds.
    pub time: f64,
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub densities: Vec<f32>,
    pub pressures: Vec<f32>,
}

impl ParticleFrame {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn copy_from(&mut self, particles: &ParticleSet, step: u64, time: f64) {
        self.step = step;
        self.time = time;
        self.positions.clear();
        self.positions.extend_from_slice(&particles.positions);
        self.velocities.clear();
        self.velocities.extend_from_slice(&particles.velocities);
        self.densities.clear();
        self.densities.extend_from_slice(&particles.densities);
        self.pressures.clear();
        self.pressures.extend_from_slice(&particles.pressures);
    }

    /// Largest particle speed in the frame.
    pub fn max_speed(&self) -> f32 {
        self.velocities
            .iter()
            .map(|v| v.length())
            .fold(0.0, f32::max)
    }

    pub fn mean_density(&self) -> f32 {
        if self.densities.is_empty() {
            return 0.0;
        }
        self.densities.iter().sum::<f32>() / self.densities.len() as f32
    }

    /// Interleaved vertex data ready for a GPU buffer upload.
    pub fn vertices(&self) -> Vec<ParticleVertex> {
        (0..self.len())
            .map(|i| {
                ParticleVertex::new(
                    self.positions[i],
                    self.velocities[i],
                    self.densities[i],
                    self.pressures[i],
                )
            })
            .collect()
    }
}

/// Double buffer for published frames.
///
/// The previous frame's allocation is reused once every consumer has dropped
/// its handle; otherwise a fresh frame is allocated and the consumer keeps
/// reading the old one undisturbed.
#[derive(Debug, Default)]
pub struct FrameBuffers {
    published: Option<Arc<ParticleFrame>>,
    allocations: usize,
}

impl FrameBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `particles` into a frame and publishes it.
    pub fn publish(&mut self, particles: &ParticleSet, step: u64, time: f64) -> Arc<ParticleFrame> {
        let mut frame = match self.published.take().map(Arc::try_unwrap) {
            Some(Ok(recycled)) => recycled,
            _ => {
                self.allocations += 1;
                ParticleFrame::default()
            }
        };
        frame.copy_from(particles, step, time);

        let frame = Arc::new(frame);
        self.published = Some(Arc::clone(&frame));
        frame
    }

    /// Most recently published frame.
    pub fn latest(&self) -> Option<&Arc<ParticleFrame>> {
        self.published.as_ref()
    }

    /// Number of frame allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

/// GPU-compatible particle layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ParticleVertex {
    /// Position (xyz) + density (w).
    pub position_density: [f32; 4],
    /// Velocity (xyz) + pressure (w).
    pub velocity_pressure: [f32; 4],
}

impl ParticleVertex {
    pub fn new(position: Vec3, velocity: Vec3, density: f32, pressure: f32) -> Self {
        Self {
            position_density: position.extend(density).to_array(),
            velocity_pressure: velocity.extend(pressure).to_array(),
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_slice(&self.position_density[..3])
    }

    pub fn velocity(&self) -> Vec3 {
        Vec3::from_slice(&self.velocity_pressure[..3])
    }
}
