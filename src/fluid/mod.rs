//! Smoothed Particle Hydrodynamics fluid simulation.
//!
//! # Architecture
//!
//! The simulation is structured in the following components:
//!
//! - [`kernel`]: Smoothing kernels (cubic B-spline, poly6, spiky)
//! - [`params`]: Material, solver, grid and scene parameters with RON loading
//! - [`particle`]: Particle buffers, lattice seeding and published frames
//! - [`spatial`]: Bucketed voxel grid for neighbor search
//! - [`boundary`]: Triangle-mesh boundary and contact response
//! - [`timestep`]: Simulation clock and adaptive timestep
//! - [`solver`]: Density, pressure, viscosity and integration pipeline
//! - [`sync`]: Rendezvous handshake between a worker and its consumer
//! - [`simulation`]: Solver, density and index tasks on worker threads
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use sph_fluid::fluid::prelude::*;
//!
//! let config = SimulationConfig::default();
//! let solver = FluidSolver::from_config(&config).unwrap();
//! let mut simulation = FluidSimulation::start(solver, config.sync).unwrap();
//!
//! if let Some(frame) = simulation.poll(Instant::now()).unwrap() {
//!     println!("step {}: max speed {}", frame.step, frame.max_speed());
//! }
//! simulation.shutdown().unwrap();
//! ```

pub mod boundary;
pub mod error;
pub mod kernel;
pub mod params;
pub mod particle;
pub mod simulation;
pub mod solver;
pub mod spatial;
pub mod sync;
pub mod timestep;

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::boundary::*;
    pub use super::error::*;
    pub use super::kernel::*;
    pub use super::params::*;
    pub use super::particle::*;
    pub use super::simulation::*;
    pub use super::solver::*;
    pub use super::spatial::*;
    pub use super::sync::*;
    pub use super::timestep::*;
}
