//! Weakly compressible SPH solver.
//!
//! One [`FluidSolver::step`] runs a fixed pipeline:
//! 1. refresh the voxel grid and cache per-particle neighbor lists
//! 2. estimate densities
//! 3. pressure from the equation of state (optionally corrected by the
//!    predictive-corrective loop)
//! 4. pressure gradient, viscosity and gravity forces
//! 5. boundary collisions
//! 6. semi-implicit Euler integration and timestep update
//!
//! Per-particle passes run on the rayon pool. Every pass writes only the slot
//! of the particle it is evaluating, so results do not depend on scheduling.

use std::sync::Arc;

use glam::Vec3;
use rayon::prelude::*;

use super::boundary::{BoundaryMesh, ContactResponse};
use super::error::{SetupError, SimulationError};
use super::kernel::{KernelSet, SmoothingKernel};
use super::params::{FluidMaterial, GridConfig, PressureSolver, SimulationConfig, SolverConfig};
use super::particle::{FrameBuffers, ParticleFrame, ParticleSet};
use super::spatial::{IndexReport, VoxelGrid};
use super::timestep::{StepPeaks, Timer, TimestepLimits};

/// Pairs closer than this are skipped; their direction is undefined.
const MIN_PAIR_DISTANCE: f32 = 1e-6;

/// Field that [`FluidSolver::interpolate`] can sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantityKind {
    Density,
    Pressure,
}

/// Densities computed against one particle frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DensityField {
    /// Step of the frame the densities were computed from.
    pub step: u64,
    pub densities: Vec<f32>,
}

/// Kernel-weighted density sums.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensityEstimator {
    kernel: SmoothingKernel,
    mass: f32,
    rest_density: f32,
}

impl DensityEstimator {
    pub fn new(kernel: SmoothingKernel, mass: f32, rest_density: f32) -> Self {
        Self {
            kernel,
            mass,
            rest_density,
        }
    }

    pub fn mass(&self) -> f32 {
        self.mass
    }

    /// Density of particle `i` from the `candidates` around it.
    ///
    /// The particle's own contribution is always counted once, whether or not
    /// `i` appears among the candidates. `prior` is the particle's last known
    /// density and tunes the kernel before summing.
    pub fn density(&self, i: usize, positions: &[Vec3], candidates: &[usize], prior: f32) -> f32 {
        let mut kernel = self.kernel;
        kernel.adjust(prior / self.rest_density);

        let xi = positions[i];
        let mut density = self.mass * kernel.weight(0.0);
        for &j in candidates {
            if j != i {
                density += self.mass * kernel.weight(xi.distance(positions[j]));
            }
        }
        density
    }

    /// Densities of every particle using the grid's sample lists.
    pub fn estimate(
        &self,
        positions: &[Vec3],
        prior: &[f32],
        grid: &VoxelGrid,
        step: u64,
    ) -> DensityField {
        let densities = (0..positions.len())
            .into_par_iter()
            .map(|i| {
                let candidates = grid.samples_for_particle(i, positions);
                let prior = prior
                    .get(i)
                    .copied()
                    .filter(|d| *d > 0.0)
                    .unwrap_or(self.rest_density);
                self.density(i, positions, &candidates, prior)
            })
            .collect();
        DensityField { step, densities }
    }
}

/// Summary of one solver step.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepReport {
    /// Number of completed steps, this one included.
    pub step: u64,
    /// Simulated time after the step.
    pub time: f64,
    /// Timestep the step used.
    pub dt: f32,
    pub peaks: StepPeaks,
    /// Pressure correction passes. Always 0 for the plain equation of state.
    pub pressure_iterations: u32,
    /// Boundary contacts resolved across all particles.
    pub contacts: usize,
}

/// SPH solver owning the particle buffers.
pub struct FluidSolver {
    material: FluidMaterial,
    config: SolverConfig,
    kernels: KernelSet,
    estimator: DensityEstimator,
    mass: f32,
    particles: ParticleSet,
    grid: Arc<VoxelGrid>,
    boundary: Arc<BoundaryMesh>,
    response: ContactResponse,
    timer: Timer,
    limits: TimestepLimits,
    /// Neighbors within kernel support, self excluded. Rebuilt every step.
    neighbors: Vec<Vec<usize>>,
    /// `|Σ∇W|² + Σ|∇W|²` over a rest lattice, for the predictive solver.
    pci_gradient_factor: f32,
}

impl FluidSolver {
    /// Validates the setup, builds the grid and computes baseline densities.
    pub fn new(
        material: FluidMaterial,
        config: SolverConfig,
        grid_config: &GridConfig,
        particles: ParticleSet,
        boundary: Arc<BoundaryMesh>,
    ) -> Result<Self, SetupError> {
        material.validate()?;
        if particles.is_empty() {
            return Err(SetupError::EmptyParticleSet);
        }
        if particles.positions.len() != particles.velocities.len() {
            return Err(SetupError::LengthMismatch {
                positions: particles.positions.len(),
                velocities: particles.velocities.len(),
            });
        }
        if boundary.face_count() == 0 {
            return Err(SetupError::EmptyMesh);
        }

        let kernels = KernelSet::new(
            config.interpolation_kernel,
            config.gradient_kernel,
            material.kernel_radius,
        );
        grid_config.validate(kernels.support(), material.rest_spacing())?;

        let mass = material.calibrated_mass(&kernels.interpolation);
        let estimator = DensityEstimator::new(kernels.interpolation, mass, material.rest_density);
        let grid_config = grid_config.packed_for(material.rest_spacing(), particles.len());
        let grid = Arc::new(VoxelGrid::build(&particles.positions, &grid_config)?);

        let limits = TimestepLimits {
            smoothing_radius: material.kernel_radius,
            speed_of_sound: material.speed_of_sound,
            courant: config.courant,
            force_factor: config.force_factor,
            min_dt: config.min_dt,
            max_dt: config.max_dt,
        };
        let timer = Timer::new(limits.stable_dt(StepPeaks::default()));
        let count = particles.len();

        let mut solver = Self {
            material,
            config,
            kernels,
            estimator,
            mass,
            particles,
            grid,
            boundary,
            response: ContactResponse::new(config.restitution, config.friction),
            timer,
            limits,
            neighbors: vec![Vec::new(); count],
            pci_gradient_factor: pci_gradient_factor(&kernels.gradient, material.rest_spacing()),
        };
        solver.gather_neighbors();
        solver.compute_densities();

        log::info!(
            "SPH solver ready: {} particles, mass {:.5}, dt {:.5}, {:?}",
            count,
            mass,
            solver.timer.dt,
            config.pressure_solver
        );
        Ok(solver)
    }

    /// Builds particles, boundary and solver from a scene description.
    pub fn from_config(config: &SimulationConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let particles = ParticleSet::from_block(&config.scene.fluid, config.scene.initial_velocity)?;
        let container = config.scene.container;
        let boundary = BoundaryMesh::box_mesh(container.size, container.origin)?;
        Self::new(
            config.material,
            config.solver,
            &config.grid,
            particles,
            Arc::new(boundary),
        )
    }

    /// Material the solver was built with.
    pub fn material(&self) -> &FluidMaterial {
        &self.material
    }

    /// Stepping options.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Density and gradient kernels in use.
    pub fn kernels(&self) -> &KernelSet {
        &self.kernels
    }

    /// Standalone density estimator sharing this solver's kernel and mass,
    /// for computing densities off the stepping thread.
    pub fn estimator(&self) -> DensityEstimator {
        self.estimator
    }

    /// Calibrated particle mass.
    pub fn mass(&self) -> f32 {
        self.mass
    }

    /// Current particle state.
    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }

    /// Neighbor index the next step will query.
    pub fn grid(&self) -> &Arc<VoxelGrid> {
        &self.grid
    }

    /// Static collision mesh.
    pub fn boundary(&self) -> &BoundaryMesh {
        &self.boundary
    }

    /// Simulated time and step count.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Neighbors gathered for particle `i` during the last step.
    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.neighbors[i]
    }

    /// Replaces the neighbor index with one refreshed elsewhere.
    pub fn adopt_grid(&mut self, grid: Arc<VoxelGrid>) {
        if grid.particle_count() == self.particles.len() {
            self.grid = grid;
        } else {
            log::warn!(
                "Ignoring voxel grid sized for {} particles (have {})",
                grid.particle_count(),
                self.particles.len()
            );
        }
    }

    /// Replaces densities with ones computed elsewhere.
    pub fn adopt_densities(&mut self, field: &DensityField) {
        if field.densities.len() == self.particles.len() {
            self.particles.densities.copy_from_slice(&field.densities);
        } else {
            log::warn!(
                "Ignoring density field with {} entries (have {})",
                field.densities.len(),
                self.particles.len()
            );
        }
    }

    /// Publishes the current state through `buffers`.
    pub fn publish(&self, buffers: &mut FrameBuffers) -> Arc<ParticleFrame> {
        buffers.publish(&self.particles, self.timer.steps, self.timer.time)
    }

    /// Runs the full pipeline for one step.
    pub fn step(&mut self) -> Result<StepReport, SimulationError> {
        self.refresh_index();
        self.gather_neighbors();
        self.compute_densities();
        self.finish_step()
    }

    /// Runs one step with the index and densities supplied from outside.
    ///
    /// The grid and densities last passed to [`Self::adopt_grid`] and
    /// [`Self::adopt_densities`] are used as they are.
    pub fn step_delegated(&mut self) -> Result<StepReport, SimulationError> {
        self.gather_neighbors();
        self.finish_step()
    }

    /// Refreshes the index, the neighbor lists and the densities in place.
    pub fn update_densities(&mut self) {
        self.refresh_index();
        self.gather_neighbors();
        self.compute_densities();
    }

    /// Re-buckets particles that changed cell.
    pub fn refresh_index(&mut self) -> IndexReport {
        Arc::make_mut(&mut self.grid).update(&self.particles.positions)
    }

    fn gather_neighbors(&mut self) {
        let grid = &self.grid;
        let positions = &self.particles.positions;
        let support_sq = self.kernels.support() * self.kernels.support();

        self.neighbors.par_iter_mut().enumerate().for_each(|(i, list)| {
            let xi = positions[i];
            list.clear();
            list.extend(
                grid.samples_for_particle(i, positions)
                    .into_iter()
                    .filter(|&j| j != i && xi.distance_squared(positions[j]) <= support_sq),
            );
        });
    }

    fn compute_densities(&mut self) {
        let estimator = &self.estimator;
        let neighbors = &self.neighbors;
        let rest = self.material.rest_density;
        let positions = &self.particles.positions;

        self.particles
            .densities
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, density)| {
                let prior = if *density > 0.0 { *density } else { rest };
                *density = estimator.density(i, positions, &neighbors[i], prior);
            });
    }

    /// Pressure for a density, and the density to carry forward.
    ///
    /// With clamping on, densities below rest become rest with zero pressure.
    pub fn equation_of_state(&self, density: f32) -> (f32, f32) {
        equation_of_state(&self.material, &self.config, density)
    }

    fn apply_equation_of_state(&mut self) {
        let material = &self.material;
        let config = &self.config;
        let ParticleSet {
            densities,
            pressures,
            ..
        } = &mut self.particles;

        densities
            .par_iter_mut()
            .zip(pressures.par_iter_mut())
            .for_each(|(density, pressure)| {
                (*density, *pressure) = equation_of_state(material, config, *density);
            });
    }

    fn finish_step(&mut self) -> Result<StepReport, SimulationError> {
        let dt = self.timer.dt;
        self.apply_equation_of_state();

        let pressure_iterations = match self.config.pressure_solver {
            PressureSolver::Eos => {
                self.accumulate_forces(true);
                0
            }
            PressureSolver::Predictive {
                max_iterations,
                tolerance,
            } => {
                self.accumulate_forces(false);
                self.predictive_correction(max_iterations, tolerance)
            }
        };

        let contacts = self.resolve_collisions();
        let peaks = self.integrate();

        if let Some(particle) = self.particles.first_non_finite() {
            let step = self.timer.steps + 1;
            log::error!("Simulation diverged at step {step}: particle {particle} is not finite");
            return Err(SimulationError::Diverged { step, particle });
        }

        self.timer.advance();
        self.timer.retune(&self.limits, peaks);

        Ok(StepReport {
            step: self.timer.steps,
            time: self.timer.time,
            dt,
            peaks,
            pressure_iterations,
            contacts,
        })
    }

    /// Fills the force accumulator with gravity, viscosity and, when
    /// `with_pressure`, the pressure gradient.
    fn accumulate_forces(&mut self, with_pressure: bool) {
        let gravity = self.config.gravity * self.mass;
        let pairs = Pairs {
            positions: &self.particles.positions,
            neighbors: &self.neighbors,
            kernel: &self.kernels.gradient,
            mass: self.mass,
        };
        let velocities = &self.particles.velocities;
        let densities = &self.particles.densities;
        let pressures = &self.particles.pressures;
        let viscosity = self.material.viscosity;

        self.particles
            .forces
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, force)| {
                let mut f = gravity + pairs.viscosity(i, velocities, densities, viscosity);
                if with_pressure {
                    f += pairs.pressure(i, densities, pressures);
                }
                *force = f;
            });
    }

    /// Predictive-corrective pressure iteration.
    ///
    /// Starts from zero pressure, predicts where the current forces take every
    /// particle, and raises pressure in proportion to the predicted density
    /// error until the largest relative error drops under `tolerance` or
    /// `max_iterations` passes have run. Returns the number of passes.
    fn predictive_correction(&mut self, max_iterations: u32, tolerance: f32) -> u32 {
        let n = self.particles.len();
        let dt = self.timer.dt;
        let mass = self.mass;
        let rest = self.material.rest_density;
        let clamp = self.config.clamp_negative_pressure;
        let beta = 2.0 * (dt * mass / rest).powi(2);
        let delta = if beta * self.pci_gradient_factor > 0.0 {
            1.0 / (beta * self.pci_gradient_factor)
        } else {
            0.0
        };

        let base_forces = &self.particles.forces;
        let positions = &self.particles.positions;
        let velocities = &self.particles.velocities;
        let neighbors = &self.neighbors;
        let estimator = &self.estimator;

        let mut pressures = vec![0.0f32; n];
        let mut pressure_forces = vec![Vec3::ZERO; n];
        let mut iterations = 0;

        for _ in 0..max_iterations {
            let predicted: Vec<Vec3> = (0..n)
                .into_par_iter()
                .map(|i| {
                    let v = velocities[i] + (base_forces[i] + pressure_forces[i]) * (dt / mass);
                    positions[i] + v * dt
                })
                .collect();
            let predicted_density: Vec<f32> = (0..n)
                .into_par_iter()
                .map(|i| estimator.density(i, &predicted, &neighbors[i], rest))
                .collect();

            let max_error = predicted_density
                .par_iter()
                .map(|rho| {
                    let error = (rho - rest) / rest;
                    if clamp {
                        error.max(0.0)
                    } else {
                        error.abs()
                    }
                })
                .reduce(|| 0.0, f32::max);
            if max_error < tolerance {
                break;
            }
            iterations += 1;

            pressures
                .par_iter_mut()
                .zip(&predicted_density)
                .for_each(|(p, rho)| {
                    *p += delta * (rho - rest);
                    if clamp {
                        *p = p.max(0.0);
                    }
                });

            let support_density: Vec<f32> = predicted_density.iter().map(|rho| rho.max(rest)).collect();
            let pairs = Pairs {
                positions: &predicted,
                neighbors,
                kernel: &self.kernels.gradient,
                mass,
            };
            pressure_forces
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, f)| *f = pairs.pressure(i, &support_density, &pressures));
        }

        log::trace!("Pressure correction ran {iterations} passes");
        for (force, extra) in self.particles.forces.iter_mut().zip(&pressure_forces) {
            *force += *extra;
        }
        self.particles.pressures = pressures;
        iterations
    }

    fn resolve_collisions(&mut self) -> usize {
        let boundary = &self.boundary;
        let response = &self.response;
        let dt = self.timer.dt;
        let radius = self.material.particle_radius;
        let ParticleSet {
            positions,
            velocities,
            forces,
            ..
        } = &mut self.particles;

        positions
            .par_iter_mut()
            .zip(velocities.par_iter_mut())
            .zip(forces.par_iter_mut())
            .map(|((position, velocity), force)| {
                boundary.resolve(position, velocity, force, dt, radius, response)
            })
            .sum()
    }

    /// Semi-implicit Euler. Clears the force accumulator.
    fn integrate(&mut self) -> StepPeaks {
        let dt = self.timer.dt;
        let inv_mass = 1.0 / self.mass;
        let ParticleSet {
            positions,
            velocities,
            forces,
            ..
        } = &mut self.particles;

        positions
            .par_iter_mut()
            .zip(velocities.par_iter_mut())
            .zip(forces.par_iter_mut())
            .map(|((position, velocity), force)| {
                let acceleration = *force * inv_mass;
                *velocity += acceleration * dt;
                *position += *velocity * dt;
                *force = Vec3::ZERO;
                StepPeaks {
                    max_speed: velocity.length(),
                    max_acceleration: acceleration.length(),
                }
            })
            .reduce(StepPeaks::default, StepPeaks::merge)
    }

    /// Samples a field at an arbitrary point.
    pub fn interpolate(&self, position: Vec3, kind: QuantityKind) -> f32 {
        let kernel = &self.kernels.interpolation;
        let particles = &self.particles;
        self.grid
            .samples_at(position)
            .into_iter()
            .filter(|&j| particles.densities[j] > 0.0)
            .map(|j| {
                let value = match kind {
                    QuantityKind::Density => particles.densities[j],
                    QuantityKind::Pressure => particles.pressures[j],
                };
                let volume = self.mass / particles.densities[j];
                volume * value * kernel.weight(position.distance(particles.positions[j]))
            })
            .sum()
    }
}

/// Neighbor pair sums over the cached lists.
struct Pairs<'a> {
    positions: &'a [Vec3],
    neighbors: &'a [Vec<usize>],
    kernel: &'a SmoothingKernel,
    mass: f32,
}

impl Pairs<'_> {
    /// Calls `f(j, distance, direction)` for every neighbor of `i` at a usable
    /// distance. `direction` points from `i` to `j`.
    #[inline]
    fn for_each(&self, i: usize, mut f: impl FnMut(usize, f32, Vec3)) {
        let xi = self.positions[i];
        let support = self.kernel.support();
        for &j in &self.neighbors[i] {
            let offset = self.positions[j] - xi;
            let distance = offset.length();
            if distance > MIN_PAIR_DISTANCE && distance <= support {
                f(j, distance, offset / distance);
            }
        }
    }

    /// Symmetric pressure-gradient force on particle `i`.
    fn pressure(&self, i: usize, densities: &[f32], pressures: &[f32]) -> Vec3 {
        let term_i = pressures[i] / (densities[i] * densities[i]);
        let mass_sq = self.mass * self.mass;
        let mut force = Vec3::ZERO;
        self.for_each(i, |j, distance, direction| {
            let term_j = pressures[j] / (densities[j] * densities[j]);
            force -= self.kernel.gradient(distance, direction) * (mass_sq * (term_i + term_j));
        });
        force
    }

    /// Laplacian viscosity force on particle `i`.
    fn viscosity(&self, i: usize, velocities: &[Vec3], densities: &[f32], viscosity: f32) -> Vec3 {
        if viscosity == 0.0 {
            return Vec3::ZERO;
        }
        let scale = viscosity * self.mass * self.mass;
        let mut force = Vec3::ZERO;
        self.for_each(i, |j, distance, _| {
            let laplacian = self.kernel.second_derivative(distance).max(0.0);
            let relative = velocities[j] - velocities[i];
            force += relative * (scale * laplacian / (densities[i] * densities[j]));
        });
        force
    }
}

fn equation_of_state(material: &FluidMaterial, config: &SolverConfig, density: f32) -> (f32, f32) {
    let rest = material.rest_density;
    if config.clamp_negative_pressure && density < rest {
        return (rest, 0.0);
    }

    let ratio = (density / rest).max(0.0);
    let mut pressure = material.stiffness() * (ratio.powf(material.eos_exponent) - 1.0);
    if pressure < 0.0 {
        pressure *= config.negative_pressure_scale;
    }
    if !pressure.is_finite() {
        pressure = 0.0;
    }
    (density, pressure)
}

/// `|Σ∇W|² + Σ|∇W|²` over the neighbors of a point in a cubic lattice.
fn pci_gradient_factor(kernel: &SmoothingKernel, spacing: f32) -> f32 {
    let reach = (kernel.support() / spacing).ceil() as i32;
    let mut sum = Vec3::ZERO;
    let mut sum_sq = 0.0;
    for x in -reach..=reach {
        for y in -reach..=reach {
            for z in -reach..=reach {
                let offset = Vec3::new(x as f32, y as f32, z as f32) * spacing;
                let distance = offset.length();
                if distance > MIN_PAIR_DISTANCE && distance <= kernel.support() {
                    let gradient = kernel.gradient(distance, offset / distance);
                    sum += gradient;
                    sum_sq += gradient.length_squared();
                }
            }
        }
    }
    sum.length_squared() + sum_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid::particle::FluidBlock;

    fn grid_config() -> GridConfig {
        GridConfig::default()
    }

    fn container() -> Arc<BoundaryMesh> {
        Arc::new(BoundaryMesh::box_mesh(Vec3::splat(10.0), Vec3::ZERO).unwrap())
    }

    /// `cells³` particles at rest on a lattice of the given spacing.
    fn lattice_solver(cells: u32, spacing: f32, h: f32, config: SolverConfig) -> FluidSolver {
        let material = FluidMaterial::default().with_radii(spacing * 0.5, h);
        let block = FluidBlock::cube(Vec3::ZERO, spacing * cells as f32, cells);
        let particles = ParticleSet::from_block(&block, Vec3::ZERO).unwrap();
        FluidSolver::new(material, config, &grid_config(), particles, container()).unwrap()
    }

    fn pair_solver(config: SolverConfig) -> FluidSolver {
        let particles = ParticleSet::new(
            vec![Vec3::ZERO, Vec3::new(0.3, 0.1, 0.0)],
            vec![Vec3::ZERO, Vec3::new(-1.0, 0.0, 0.5)],
        )
        .unwrap();
        FluidSolver::new(
            FluidMaterial::default(),
            config,
            &grid_config(),
            particles,
            container(),
        )
        .unwrap()
    }

    #[test]
    fn test_rest_lattice_density() {
        let solver = lattice_solver(7, 0.2, 0.125, SolverConfig::default());
        let center = (3 * 7 + 3) * 7 + 3;

        let position = solver.particles().positions[center];
        assert!((position - Vec3::splat(-0.1)).length() < 1e-5);
        let density = solver.particles().densities[center];
        assert!(
            (density - 1000.0).abs() < 5.0,
            "interior density {density} should be near rest"
        );
    }

    #[test]
    fn test_rest_lattice_density_with_default_material() {
        let solver = lattice_solver(7, 0.2, 0.25, SolverConfig::default());
        assert_eq!(solver.material(), &FluidMaterial::default());
        let center = (3 * 7 + 3) * 7 + 3;

        let density = solver.particles().densities[center];
        assert!(
            (density - 1000.0).abs() < 5.0,
            "interior density {density} should be near rest"
        );
        assert_eq!(solver.grid().last_report().spilled, 0);
    }

    #[test]
    fn test_setup_rejects_small_cells() {
        let particles = ParticleSet::new(vec![Vec3::ZERO], vec![Vec3::ZERO]).unwrap();
        let grid = GridConfig {
            resolution: 40,
            ..grid_config()
        };
        let err = FluidSolver::new(
            FluidMaterial::default(),
            SolverConfig::default(),
            &grid,
            particles,
            container(),
        )
        .err();
        assert!(matches!(err, Some(SetupError::CellsSmallerThanSupport { .. })));
    }

    #[test]
    fn test_pressure_forces_are_antisymmetric() {
        let config = SolverConfig::default().with_gravity(Vec3::ZERO);
        let mut solver = pair_solver(config);
        solver.particles.densities = vec![1010.0, 1030.0];
        solver.particles.pressures = vec![150.0, 420.0];
        solver.gather_neighbors();
        solver.accumulate_forces(true);

        let f0 = solver.particles.forces[0];
        let f1 = solver.particles.forces[1];
        assert!(f0.length() > 0.0);
        assert!((f0 + f1).length() < 1e-5 * f0.length());
        // Repulsive: particle 0 is pushed away from particle 1.
        assert!(f0.dot(Vec3::new(0.3, 0.1, 0.0)) < 0.0);
    }

    #[test]
    fn test_viscosity_damps_relative_motion() {
        let material = FluidMaterial::default().with_viscosity(1.0);
        let particles = ParticleSet::new(
            vec![Vec3::ZERO, Vec3::new(0.2, 0.0, 0.0)],
            vec![Vec3::ZERO, Vec3::Y],
        )
        .unwrap();
        let config = SolverConfig::default().with_gravity(Vec3::ZERO);
        let mut solver =
            FluidSolver::new(material, config, &grid_config(), particles, container()).unwrap();
        solver.particles.densities = vec![1000.0, 1000.0];
        solver.particles.pressures = vec![0.0, 0.0];
        solver.accumulate_forces(true);

        // Particle 0 is dragged along +y, particle 1 held back.
        assert!(solver.particles.forces[0].y > 0.0);
        assert!(solver.particles.forces[1].y < 0.0);
    }

    #[test]
    fn test_equation_of_state() {
        let solver = pair_solver(SolverConfig::default());
        assert_eq!(solver.equation_of_state(900.0), (1000.0, 0.0));
        assert_eq!(solver.equation_of_state(1000.0), (1000.0, 0.0));

        let (density, pressure) = solver.equation_of_state(1100.0);
        assert_eq!(density, 1100.0);
        let expected = solver.material().stiffness() * (1.1f32.powf(7.0) - 1.0);
        assert!((pressure - expected).abs() < 1e-3 * expected);

        // Slope at rest is c²: 1 kg/m³ over rest gives about c² Pa.
        let c_sq = solver.material().speed_of_sound.powi(2);
        let (_, pressure) = solver.equation_of_state(1001.0);
        assert!((pressure - c_sq).abs() < 0.01 * c_sq, "pressure {pressure}");

        let config = SolverConfig {
            clamp_negative_pressure: false,
            ..SolverConfig::default()
        };
        let solver = pair_solver(config);
        let (density, pressure) = solver.equation_of_state(900.0);
        assert_eq!(density, 900.0);
        assert!(pressure < 0.0);
    }

    #[test]
    fn test_falling_particle_stays_inside_box() {
        let particles = ParticleSet::new(vec![Vec3::new(0.3, -4.0, 0.2)], vec![Vec3::ZERO]).unwrap();
        let mut solver = FluidSolver::new(
            FluidMaterial::default(),
            SolverConfig::default(),
            &grid_config(),
            particles,
            container(),
        )
        .unwrap();

        let mut contacts = 0;
        while solver.timer().time < 1.5 {
            let report = solver.step().unwrap();
            contacts += report.contacts;
            assert!(solver.particles().positions[0].y >= -5.0);
        }

        assert!(contacts > 0);
        let y = solver.particles().positions[0].y;
        assert!(y < -4.8, "particle should settle on the floor, at {y}");
    }

    #[test]
    fn test_nan_velocity_is_reported_as_divergence() {
        let particles = ParticleSet::new(
            vec![Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)],
            vec![Vec3::new(f32::NAN, 0.0, 0.0), Vec3::ZERO],
        )
        .unwrap();
        let mut solver = FluidSolver::new(
            FluidMaterial::default(),
            SolverConfig::default(),
            &grid_config(),
            particles,
            container(),
        )
        .unwrap();

        assert_eq!(
            solver.step(),
            Err(SimulationError::Diverged {
                step: 1,
                particle: 0
            })
        );
    }

    #[test]
    fn test_predictive_solver_corrects_compressed_block() {
        let config = SolverConfig::default()
            .with_gravity(Vec3::ZERO)
            .with_pressure_solver(PressureSolver::predictive());
        // Rest spacing is 0.2; squeeze the lattice to 0.17.
        let material = FluidMaterial::default();
        let block = FluidBlock::cube(Vec3::ZERO, 0.17 * 6.0, 6);
        let particles = ParticleSet::from_block(&block, Vec3::ZERO).unwrap();
        let mut solver =
            FluidSolver::new(material, config, &grid_config(), particles, container()).unwrap();

        let report = solver.step().unwrap();
        assert!((1..=3).contains(&report.pressure_iterations));
        assert!(solver.particles().pressures.iter().any(|p| *p > 0.0));
        assert!(solver.particles().pressures.iter().all(|p| *p >= 0.0));
        assert!(solver.particles().first_non_finite().is_none());
    }

    #[test]
    fn test_interpolate_matches_particle_density() {
        let solver = lattice_solver(7, 0.2, 0.125, SolverConfig::default());
        let center = (3 * 7 + 3) * 7 + 3;
        let position = solver.particles().positions[center];

        let density = solver.interpolate(position, QuantityKind::Density);
        assert!((density - solver.particles().densities[center]).abs() < 1e-2);
        assert_eq!(solver.interpolate(position, QuantityKind::Pressure), 0.0);
        assert_eq!(solver.interpolate(Vec3::splat(4.0), QuantityKind::Density), 0.0);
    }

    #[test]
    fn test_adopted_densities_drive_pressure() {
        let config = SolverConfig::default().with_gravity(Vec3::ZERO);
        let mut solver = lattice_solver(3, 0.2, 0.25, config);
        let n = solver.particles().len();

        solver.adopt_densities(&DensityField {
            step: 0,
            densities: vec![1.0; n - 1],
        });
        assert_ne!(solver.particles().densities[0], 1.0);

        let compressed = DensityField {
            step: 0,
            densities: vec![1200.0; n],
        };
        solver.adopt_densities(&compressed);
        let grid = Arc::new(
            VoxelGrid::build(
                &solver.particles().positions,
                &grid_config().packed_for(0.2, solver.particles().len()),
            )
            .unwrap(),
        );
        solver.adopt_grid(grid);
        solver.step_delegated().unwrap();

        assert!(solver.particles().pressures.iter().all(|p| *p > 0.0));
    }

    #[test]
    fn test_density_estimator_matches_solver() {
        let solver = lattice_solver(4, 0.2, 0.25, SolverConfig::default());
        let particles = solver.particles();
        let field = solver
            .estimator()
            .estimate(&particles.positions, &particles.densities, solver.grid(), 7);

        assert_eq!(field.step, 7);
        for (a, b) in field.densities.iter().zip(&particles.densities) {
            assert!((a - b).abs() < 1e-2);
        }
    }
}
