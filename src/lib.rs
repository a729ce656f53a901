//! SPH fluid simulation on the CPU.
//!
//! This library advances a Smoothed Particle Hydrodynamics fluid: particles
//! carry position, velocity, density and pressure; a voxel grid keeps
//! neighbor search sub-quadratic; a triangle mesh bounds the fluid.
//!
//! # Features
//!
//! - **SPH Solver**: Equation-of-state pressure with an optional predictive-corrective mode
//! - **Kernel Family**: Cubic B-spline, poly6 and spiky kernels with compact support
//! - **Voxel Grid**: Fixed-capacity buckets with neighborhood spill and utilization reports
//! - **Mesh Boundaries**: Swept triangle contacts with restitution and friction
//! - **Task Model**: Solver, density and index work on threads joined by rendezvous handoffs
//! - **Frame Export**: Immutable frames with a `Pod` vertex layout for GPU upload
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sph_fluid::prelude::*;
//!
//! let config = SimulationConfig::default();
//! let mut solver = FluidSolver::from_config(&config).unwrap();
//! for _ in 0..100 {
//!     solver.step().unwrap();
//! }
//! println!("t = {:.3}s", solver.timer().time);
//! ```
//!
//! # Architecture
//!
//! - [`fluid`]: Core fluid simulation module
//!   - [`fluid::kernel`]: Smoothing kernels
//!   - [`fluid::params`]: Simulation parameters and scene files
//!   - [`fluid::particle`]: Particle data structures
//!   - [`fluid::spatial`]: Voxel grid for neighbor search
//!   - [`fluid::boundary`]: Mesh boundary handling
//!   - [`fluid::solver`]: SPH solver
//!   - [`fluid::simulation`]: Threaded task orchestration

pub mod fluid;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::fluid::prelude::*;
}
