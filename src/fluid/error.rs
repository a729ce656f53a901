//! Error types for setup, stepping and configuration.

use thiserror::Error;

/// Contract violations caught while building a simulation.
///
/// None of these can happen once a solver has been constructed; the hot
/// path relies on them having been rejected here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetupError {
    #[error("particle set is empty")]
    EmptyParticleSet,
    #[error("particle buffers disagree in length: {positions} positions, {velocities} velocities")]
    LengthMismatch { positions: usize, velocities: usize },
    #[error("boundary mesh has no triangles")]
    EmptyMesh,
    #[error("boundary mesh vertex count {0} is not a multiple of 3")]
    IncompleteTriangle(usize),
    #[error("boundary triangle {0} has zero area")]
    DegenerateTriangle(usize),
    #[error("material field `{field}` must be positive (got {value})")]
    NonPositiveMaterial { field: &'static str, value: f32 },
    #[error("grid resolution must be at least 1")]
    ZeroResolution,
    #[error("grid half extent must be positive (got {0})")]
    NonPositiveExtent(f32),
    #[error("grid cell width {cell_width} is smaller than kernel support {support}")]
    CellsSmallerThanSupport { cell_width: f32, support: f32 },
    #[error("neighbor sample cap must be at least 1")]
    ZeroSampleCap,
    #[error("neighbor sample cap {sample_cap} is below the {required} particles a rest-packed neighborhood holds")]
    SampleCapTooSmall { sample_cap: usize, required: usize },
}

/// Failures raised while a simulation is running.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    /// A position or velocity became NaN after integration.
    #[error("simulation diverged at step {step}: particle {particle} is not finite")]
    Diverged { step: u64, particle: usize },
    #[error("{task} task panicked")]
    TaskPanicked { task: &'static str },
    #[error("{task} task hung up before the handshake completed")]
    Disconnected { task: &'static str },
    #[error("failed to start {task} task: {reason}")]
    Spawn { task: &'static str, reason: String },
}

/// Failures loading or saving a scene description.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] ron::Error),
    #[error("invalid config: {0}")]
    Setup(#[from] SetupError),
}
