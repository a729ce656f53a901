//! Fluid simulation parameters.
//!
//! [`FluidMaterial`] describes the fluid itself and is immutable once a solver
//! has been built from it. The remaining structs tune the solver, the neighbor
//! index and the task cadence, and [`SimulationConfig`] bundles all of them
//! with a scene description so a run can be loaded from a RON file.

use std::path::Path;
use std::time::Duration;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::error::{ConfigError, SetupError};
use super::kernel::{KernelShape, SmoothingKernel};
use super::particle::FluidBlock;

/// Physical description of the simulated fluid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidMaterial {
    /// Rest density of the fluid in kg/m³.
    pub rest_density: f32,

    /// Particle radius used for collisions. Rest spacing is twice this value.
    pub particle_radius: f32,

    /// Smoothing radius (h). Kernels reach out to 2h.
    pub kernel_radius: f32,

    /// Dynamic viscosity coefficient.
    pub viscosity: f32,

    /// Numerical speed of sound. Sets the stiffness of the equation of state
    /// and the acoustic timestep bound.
    pub speed_of_sound: f32,

    /// Exponent (gamma) of the Tait equation of state. 1 gives a linear law.
    pub eos_exponent: f32,
}

impl Default for FluidMaterial {
    fn default() -> Self {
        Self {
            rest_density: 1000.0,
            particle_radius: 0.1,
            kernel_radius: 0.25,
            viscosity: 0.01,
            speed_of_sound: 10.0,
            eos_exponent: 7.0,
        }
    }
}

impl FluidMaterial {
    /// Water-like defaults.
    pub fn water() -> Self {
        Self::default()
    }

    /// Thick, slow fluid.
    pub fn honey() -> Self {
        Self {
            rest_density: 1420.0,
            viscosity: 5.0,
            eos_exponent: 1.0,
            ..Self::default()
        }
    }

    pub fn with_radii(mut self, particle_radius: f32, kernel_radius: f32) -> Self {
        self.particle_radius = particle_radius;
        self.kernel_radius = kernel_radius;
        self
    }

    pub fn with_rest_density(mut self, rest_density: f32) -> Self {
        self.rest_density = rest_density;
        self
    }

    pub fn with_viscosity(mut self, viscosity: f32) -> Self {
        self.viscosity = viscosity;
        self
    }

    pub fn with_speed_of_sound(mut self, speed_of_sound: f32) -> Self {
        self.speed_of_sound = speed_of_sound;
        self
    }

    /// Rejects non-positive constants. Viscosity may be zero.
    pub fn validate(&self) -> Result<(), SetupError> {
        let positive = [
            ("rest_density", self.rest_density),
            ("particle_radius", self.particle_radius),
            ("kernel_radius", self.kernel_radius),
            ("speed_of_sound", self.speed_of_sound),
            ("eos_exponent", self.eos_exponent),
        ];
        for (field, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(SetupError::NonPositiveMaterial { field, value });
            }
        }
        if !(self.viscosity >= 0.0 && self.viscosity.is_finite()) {
            return Err(SetupError::NonPositiveMaterial {
                field: "viscosity",
                value: self.viscosity,
            });
        }
        Ok(())
    }

    /// Distance between lattice neighbors at rest.
    pub fn rest_spacing(&self) -> f32 {
        2.0 * self.particle_radius
    }

    /// Tait bulk modulus `rho0 c² / gamma`. The pressure slope at rest is
    /// `c²` for every exponent.
    pub fn stiffness(&self) -> f32 {
        self.rest_density * self.speed_of_sound * self.speed_of_sound / self.eos_exponent
    }

    /// Particle mass for which a cubic lattice at rest spacing sums to the
    /// rest density under `kernel`.
    pub fn calibrated_mass(&self, kernel: &SmoothingKernel) -> f32 {
        let weight_sum = lattice_weight_sum(kernel, self.rest_spacing());
        if weight_sum > 0.0 {
            self.rest_density / weight_sum
        } else {
            self.rest_density * self.rest_spacing().powi(3)
        }
    }
}

/// Sum of `kernel` weights from a lattice point to every lattice point within
/// support, itself included.
pub(crate) fn lattice_weight_sum(kernel: &SmoothingKernel, spacing: f32) -> f32 {
    let reach = (kernel.support() / spacing).ceil() as i32;
    let mut sum = 0.0;
    for x in -reach..=reach {
        for y in -reach..=reach {
            for z in -reach..=reach {
                let offset = Vec3::new(x as f32, y as f32, z as f32) * spacing;
                sum += kernel.weight(offset.length());
            }
        }
    }
    sum
}

/// Lattice points at spacing `spacing` that fit in a cube of edge `edge`.
fn lattice_points_in(edge: f32, spacing: f32) -> usize {
    if !(spacing > 0.0) {
        return usize::MAX;
    }
    let per_axis = (edge / spacing).floor() as usize + 1;
    per_axis.saturating_pow(3)
}

/// How pressure is obtained from density each step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum PressureSolver {
    /// Explicit equation of state evaluated once per step.
    #[default]
    Eos,
    /// Predictive-corrective iteration on top of the equation of state.
    Predictive {
        /// Upper bound on correction passes per step.
        max_iterations: u32,
        /// Relative density error below which iteration stops.
        tolerance: f32,
    },
}

impl PressureSolver {
    pub fn predictive() -> Self {
        PressureSolver::Predictive {
            max_iterations: 3,
            tolerance: 0.01,
        }
    }
}

/// Solver tuning that is not a property of the fluid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Gravity acceleration vector.
    pub gravity: Vec3,

    /// Normal restitution on boundary contact. 0 sticks, 1 bounces fully.
    pub restitution: f32,

    /// Coulomb-style tangential damping on boundary contact.
    pub friction: f32,

    /// Clamp densities below rest to rest with zero pressure.
    pub clamp_negative_pressure: bool,

    /// Multiplier on tensile pressure when clamping is disabled.
    pub negative_pressure_scale: f32,

    pub pressure_solver: PressureSolver,

    /// Kernel used for density and field interpolation.
    pub interpolation_kernel: KernelShape,

    /// Kernel used for the pressure gradient and viscosity Laplacian.
    pub gradient_kernel: KernelShape,

    /// Courant factor applied to the acoustic and velocity bounds.
    pub courant: f32,

    /// Factor applied to the acceleration bound `sqrt(h / a_max)`.
    pub force_factor: f32,

    /// Timestep bounds in seconds.
    pub min_dt: f32,
    pub max_dt: f32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            restitution: 0.45,
            friction: 0.1,
            clamp_negative_pressure: true,
            negative_pressure_scale: 0.001,
            pressure_solver: PressureSolver::Eos,
            interpolation_kernel: KernelShape::CubicBSpline,
            gradient_kernel: KernelShape::Spiky,
            courant: 0.4,
            force_factor: 0.25,
            min_dt: 1e-5,
            max_dt: 0.01,
        }
    }
}

impl SolverConfig {
    pub fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_pressure_solver(mut self, pressure_solver: PressureSolver) -> Self {
        self.pressure_solver = pressure_solver;
        self
    }

    pub fn with_kernels(mut self, interpolation: KernelShape, gradient: KernelShape) -> Self {
        self.interpolation_kernel = interpolation;
        self.gradient_kernel = gradient;
        self
    }

    pub fn with_boundary_response(mut self, restitution: f32, friction: f32) -> Self {
        self.restitution = restitution;
        self.friction = friction;
        self
    }
}

/// Voxel grid layout.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Cells per axis.
    pub resolution: u32,

    /// Grid covers `[-half_extent, half_extent]` on every axis.
    pub half_extent: f32,

    /// Bucket width is `ceil(load_factor * particles / cells)`. Fluids that
    /// sit in a small part of the grid need a large factor.
    pub load_factor: f32,

    /// Upper bound on candidates returned per neighbor query. Must cover a
    /// 3x3x3 block of cells packed at rest spacing.
    pub sample_cap: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            resolution: 16,
            half_extent: 5.0,
            load_factor: 200.0,
            sample_cap: 1024,
        }
    }
}

impl GridConfig {
    pub fn cell_width(&self) -> f32 {
        2.0 * self.half_extent / self.resolution.max(1) as f32
    }

    pub fn cell_count(&self) -> usize {
        (self.resolution as usize).pow(3)
    }

    pub fn with_sample_cap(mut self, sample_cap: usize) -> Self {
        self.sample_cap = sample_cap;
        self
    }

    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Checks the layout against the kernel support `2h` and the fluid's
    /// rest spacing.
    pub fn validate(&self, kernel_support: f32, rest_spacing: f32) -> Result<(), SetupError> {
        self.validate_layout()?;
        let cell_width = self.cell_width();
        if cell_width < kernel_support {
            return Err(SetupError::CellsSmallerThanSupport {
                cell_width,
                support: kernel_support,
            });
        }
        let required = self.neighborhood_population(rest_spacing);
        if self.sample_cap < required {
            return Err(SetupError::SampleCapTooSmall {
                sample_cap: self.sample_cap,
                required,
            });
        }
        Ok(())
    }

    /// Most particles one cell holds when packed at `rest_spacing`.
    pub fn cell_population(&self, rest_spacing: f32) -> usize {
        lattice_points_in(self.cell_width(), rest_spacing)
    }

    /// Most particles a 3x3x3 block of cells holds when packed at
    /// `rest_spacing`.
    pub fn neighborhood_population(&self, rest_spacing: f32) -> usize {
        lattice_points_in(3.0 * self.cell_width(), rest_spacing)
    }

    /// Raises the load factor until a bucket fits a cell packed at
    /// `rest_spacing`, so a fluid at rest never spills.
    pub fn packed_for(mut self, rest_spacing: f32, particle_count: usize) -> Self {
        let needed = self.cell_population(rest_spacing) as f32 * self.cell_count() as f32
            / particle_count.max(1) as f32;
        if self.load_factor < needed {
            log::debug!(
                "Raising grid load factor from {} to {needed} for rest spacing {rest_spacing}",
                self.load_factor
            );
            self.load_factor = needed;
        }
        self
    }

    /// Checks the layout on its own.
    pub fn validate_layout(&self) -> Result<(), SetupError> {
        if self.resolution == 0 {
            return Err(SetupError::ZeroResolution);
        }
        if !(self.half_extent > 0.0 && self.half_extent.is_finite()) {
            return Err(SetupError::NonPositiveExtent(self.half_extent));
        }
        if self.sample_cap == 0 {
            return Err(SetupError::ZeroSampleCap);
        }
        if !(self.load_factor > 0.0) {
            return Err(SetupError::NonPositiveMaterial {
                field: "load_factor",
                value: self.load_factor,
            });
        }
        Ok(())
    }
}

/// How often the consumer hands off with each task, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Solver frames, roughly 24 per second.
    pub frame_interval: f64,
    pub density_interval: f64,
    pub index_interval: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frame_interval: 0.04166,
            density_interval: 0.01,
            index_interval: 0.09,
        }
    }
}

impl SyncConfig {
    pub fn frame(&self) -> Duration {
        Duration::from_secs_f64(self.frame_interval.max(0.0))
    }

    pub fn density(&self) -> Duration {
        Duration::from_secs_f64(self.density_interval.max(0.0))
    }

    pub fn index(&self) -> Duration {
        Duration::from_secs_f64(self.index_interval.max(0.0))
    }

    /// Hands off with every task on every poll.
    pub fn immediate() -> Self {
        Self {
            frame_interval: 0.0,
            density_interval: 0.0,
            index_interval: 0.0,
        }
    }
}

/// Axis-aligned box used as the boundary mesh.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxSpec {
    pub size: Vec3,
    pub origin: Vec3,
}

impl Default for BoxSpec {
    fn default() -> Self {
        Self {
            size: Vec3::splat(10.0),
            origin: Vec3::ZERO,
        }
    }
}

/// Initial particle layout and container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub fluid: FluidBlock,
    pub initial_velocity: Vec3,
    pub container: BoxSpec,
}

/// Everything needed to start a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub material: FluidMaterial,
    pub solver: SolverConfig,
    pub grid: GridConfig,
    pub sync: SyncConfig,
    pub scene: SceneConfig,
}

impl SimulationConfig {
    pub fn with_material(mut self, material: FluidMaterial) -> Self {
        self.material = material;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_grid(mut self, grid: GridConfig) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_scene(mut self, scene: SceneConfig) -> Self {
        self.scene = scene;
        self
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        self.material.validate()?;
        self.grid
            .validate(2.0 * self.material.kernel_radius, self.material.rest_spacing())
    }

    pub fn from_ron_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    /// Loads and validates a RON scene file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_ron_str(&contents)?;
        log::info!("Loaded simulation config from {:?}", path.as_ref());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path.as_ref(), self.to_ron_string()?)?;
        log::debug!("Saved simulation config to {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(SimulationConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_material_rejects_zero_radius() {
        let material = FluidMaterial::default().with_radii(0.0, 0.25);
        assert_eq!(
            material.validate(),
            Err(SetupError::NonPositiveMaterial {
                field: "particle_radius",
                value: 0.0
            })
        );
    }

    #[test]
    fn test_grid_rejects_cells_smaller_than_support() {
        let grid = GridConfig {
            resolution: 40,
            half_extent: 5.0,
            ..GridConfig::default()
        };
        assert!(matches!(
            grid.validate(0.5, 0.2),
            Err(SetupError::CellsSmallerThanSupport { .. })
        ));
        assert_eq!(GridConfig::default().validate(0.5, 0.2), Ok(()));
    }

    #[test]
    fn test_grid_rejects_cap_below_neighborhood() {
        // Cells of 0.625 at spacing 0.2: 4 points per cell edge, 10 per block edge.
        let grid = GridConfig::default().with_sample_cap(30);
        assert_eq!(grid.cell_population(0.2), 64);
        assert_eq!(grid.neighborhood_population(0.2), 1000);
        assert_eq!(
            grid.validate(0.5, 0.2),
            Err(SetupError::SampleCapTooSmall {
                sample_cap: 30,
                required: 1000
            })
        );
    }

    #[test]
    fn test_packed_grid_fits_rest_cell() {
        let grid = GridConfig::default().packed_for(0.2, 343);
        let bucket = (grid.load_factor * 343.0 / grid.cell_count() as f32).ceil() as usize;
        assert!(bucket >= 64);

        // Already roomy configs are left alone.
        let roomy = GridConfig::default().with_load_factor(5000.0);
        assert_eq!(roomy.packed_for(0.2, 343), roomy);
    }

    #[test]
    fn test_calibrated_mass_reproduces_rest_density() {
        let material = FluidMaterial::default();
        let kernel = SmoothingKernel::cubic_b_spline(material.kernel_radius);
        let mass = material.calibrated_mass(&kernel);
        let density = mass * lattice_weight_sum(&kernel, material.rest_spacing());
        assert!((density - material.rest_density).abs() < 1e-2);
    }

    #[test]
    fn test_ron_round_trip_preserves_config() {
        let config = SimulationConfig::default()
            .with_material(FluidMaterial::honey())
            .with_solver(SolverConfig::default().with_pressure_solver(PressureSolver::predictive()));
        let text = config.to_ron_string().unwrap();
        let parsed = SimulationConfig::from_ron_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_ron_falls_back_to_defaults() {
        let config = SimulationConfig::from_ron_str("(material: (viscosity: 0.5))").unwrap();
        assert_eq!(config.material.viscosity, 0.5);
        assert_eq!(config.material.rest_density, 1000.0);
        assert_eq!(config.grid, GridConfig::default());
    }

    #[test]
    fn test_invalid_ron_reports_setup_error() {
        let err = SimulationConfig::from_ron_str("(grid: (resolution: 0))").unwrap_err();
        assert!(matches!(err, ConfigError::Setup(SetupError::ZeroResolution)));
    }

    #[test]
    fn test_bundled_dam_break_scene_loads() {
        let config =
            SimulationConfig::from_ron_str(include_str!("../../scenes/dam_break.ron")).unwrap();
        assert_eq!(config.scene.fluid.count(), 640);
        let spacing = Vec3::splat(config.material.rest_spacing());
        assert!(config.scene.fluid.step().abs_diff_eq(spacing, 1e-6));
        assert_eq!(config.solver.pressure_solver, PressureSolver::Eos);
    }
}
