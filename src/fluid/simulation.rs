//! Threaded simulation driven by a consumer-paced handshake.
//!
//! Three worker threads run beside the consumer:
//!
//! - the solver task advances the particles one step per handoff,
//! - the density task re-estimates densities from the latest frame,
//! - the index task re-buckets the voxel grid for the latest frame.
//!
//! Each worker parks at a rendezvous after every unit of work. The consumer
//! calls [`FluidSimulation::poll`] on its own cadence; a task whose sync
//! interval has elapsed is met at its rendezvous, its output is taken and it
//! is resumed with fresh input. Workers only ever exchange immutable
//! snapshots, so nothing is shared mutably across threads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::error::SimulationError;
use super::params::SyncConfig;
use super::particle::{FrameBuffers, ParticleFrame};
use super::solver::{DensityEstimator, DensityField, FluidSolver, StepReport};
use super::spatial::VoxelGrid;
use super::sync::{rendezvous, Command, Consumer, Disconnected, Producer, Synced};

const SOLVER_TASK: &str = "solver";
const DENSITY_TASK: &str = "density";
const INDEX_TASK: &str = "index";

type TaskResult = Result<(), SimulationError>;

/// What the solver task hands over after a step.
#[derive(Clone, Debug)]
pub struct SolverOutput {
    pub frame: Arc<ParticleFrame>,
    pub report: StepReport,
}

/// Results from the helper tasks for the solver's next step.
#[derive(Clone, Debug, Default)]
pub struct SolverFeed {
    pub grid: Option<Arc<VoxelGrid>>,
    pub densities: Option<DensityField>,
}

impl SolverFeed {
    fn apply(self, solver: &mut FluidSolver) {
        if let Some(grid) = self.grid {
            solver.adopt_grid(grid);
        }
        if let Some(field) = self.densities {
            solver.adopt_densities(&field);
        }
    }
}

/// Input for one density estimate.
#[derive(Clone, Debug)]
pub struct DensityFeed {
    pub frame: Arc<ParticleFrame>,
    pub grid: Arc<VoxelGrid>,
}

/// A worker thread and the consumer end of its rendezvous.
struct Task<Out, In> {
    name: &'static str,
    consumer: Consumer<Out, In>,
    handle: Option<JoinHandle<TaskResult>>,
    /// Outcome once the thread has been joined.
    result: Option<TaskResult>,
    interval: Duration,
    last_sync: Option<Instant>,
}

impl<Out, In> Task<Out, In>
where
    Out: Send + 'static,
    In: Send + 'static,
{
    fn spawn<F>(name: &'static str, interval: Duration, body: F) -> Result<Self, SimulationError>
    where
        F: FnOnce(Producer<Out, In>) -> TaskResult + Send + 'static,
    {
        let (producer, consumer) = rendezvous();
        let handle = thread::Builder::new()
            .name(format!("sph-{name}"))
            .spawn(move || body(producer))
            .map_err(|err| SimulationError::Spawn {
                task: name,
                reason: err.to_string(),
            })?;
        log::debug!("Started {name} task (sync every {interval:?})");

        Ok(Self {
            name,
            consumer,
            handle: Some(handle),
            result: None,
            interval,
            last_sync: None,
        })
    }
}

impl<Out, In> Task<Out, In> {
    fn is_due(&self, now: Instant) -> bool {
        self.last_sync
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Waits for the worker's next sync point.
    ///
    /// A worker that has hung up is joined and its own error is returned.
    fn receive(&mut self) -> Result<Synced<'_, Out, In>, SimulationError> {
        let Self {
            name,
            consumer,
            handle,
            result,
            ..
        } = self;
        match consumer.receive() {
            Ok(synced) => Ok(synced),
            Err(Disconnected) => Err(match settle(*name, handle, result) {
                Err(err) => err,
                Ok(()) => SimulationError::Disconnected { task: *name },
            }),
        }
    }

    /// Stops the worker if it is still running and joins it.
    fn stop(&mut self) -> TaskResult {
        if self.handle.is_some() {
            if let Ok(synced) = self.consumer.receive() {
                let _ = synced.stop();
            }
        }
        settle(self.name, &mut self.handle, &mut self.result)
    }
}

fn settle(
    name: &'static str,
    handle: &mut Option<JoinHandle<TaskResult>>,
    result: &mut Option<TaskResult>,
) -> TaskResult {
    if let Some(handle) = handle.take() {
        let outcome = handle.join().unwrap_or_else(|_| {
            log::error!("{name} task panicked");
            Err(SimulationError::TaskPanicked { task: name })
        });
        *result = Some(outcome);
    }
    result
        .clone()
        .unwrap_or(Err(SimulationError::Disconnected { task: name }))
}

/// A fluid solver running on worker threads.
pub struct FluidSimulation {
    solver: Task<SolverOutput, SolverFeed>,
    density: Task<DensityField, DensityFeed>,
    index: Task<Arc<VoxelGrid>, Arc<ParticleFrame>>,
    frame: Arc<ParticleFrame>,
    grid: Arc<VoxelGrid>,
    /// Helper results not yet handed to the solver.
    pending_grid: Option<Arc<VoxelGrid>>,
    pending_densities: Option<DensityField>,
    last_report: Option<StepReport>,
    frames: u64,
    stopped: bool,
}

impl FluidSimulation {
    /// Moves `solver` onto its own thread and starts the helper tasks.
    pub fn start(solver: FluidSolver, sync: SyncConfig) -> Result<Self, SimulationError> {
        let mut buffers = FrameBuffers::new();
        let frame = solver.publish(&mut buffers);
        let grid = Arc::clone(solver.grid());
        let estimator = solver.estimator();
        let particles = solver.particles().len();

        let index_grid = Arc::clone(&grid);
        let index = Task::spawn(INDEX_TASK, sync.index(), move |producer| {
            run_index(index_grid, producer)
        })?;

        let feed = DensityFeed {
            frame: Arc::clone(&frame),
            grid: Arc::clone(&grid),
        };
        let density = Task::spawn(DENSITY_TASK, sync.density(), move |producer| {
            run_density(estimator, feed, producer)
        })?;

        let solver = Task::spawn(SOLVER_TASK, sync.frame(), move |producer| {
            run_solver(solver, buffers, producer)
        })?;

        log::info!("Fluid simulation started with {particles} particles");
        Ok(Self {
            solver,
            density,
            index,
            frame,
            grid,
            pending_grid: None,
            pending_densities: None,
            last_report: None,
            frames: 0,
            stopped: false,
        })
    }

    /// Meets every task whose sync interval has elapsed at `now`.
    ///
    /// Returns the solver's new frame when the solver was due. Blocks while a
    /// due task finishes its current unit of work.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Arc<ParticleFrame>>, SimulationError> {
        if self.index.is_due(now) {
            let mut synced = self.index.receive()?;
            if let Some(grid) = synced.take_output() {
                self.pending_grid = Some(Arc::clone(&grid));
                self.grid = grid;
            }
            synced
                .resume(Arc::clone(&self.frame))
                .map_err(|_| SimulationError::Disconnected { task: INDEX_TASK })?;
            self.index.last_sync = Some(now);
        }

        if self.density.is_due(now) {
            let mut synced = self.density.receive()?;
            if let Some(field) = synced.take_output() {
                self.pending_densities = Some(field);
            }
            let feed = DensityFeed {
                frame: Arc::clone(&self.frame),
                grid: Arc::clone(&self.grid),
            };
            synced
                .resume(feed)
                .map_err(|_| SimulationError::Disconnected { task: DENSITY_TASK })?;
            self.density.last_sync = Some(now);
        }

        if !self.solver.is_due(now) {
            return Ok(None);
        }

        let mut synced = self.solver.receive()?;
        let output = synced.take_output();
        let feed = SolverFeed {
            grid: self.pending_grid.take(),
            densities: self.pending_densities.take(),
        };
        synced
            .resume(feed)
            .map_err(|_| SimulationError::Disconnected { task: SOLVER_TASK })?;
        self.solver.last_sync = Some(now);

        Ok(output.map(|SolverOutput { frame, report }| {
            self.frames += 1;
            self.last_report = Some(report);
            self.frame = Arc::clone(&frame);
            log::trace!(
                "Frame {} at step {} (t = {:.4}s, dt = {:.5})",
                self.frames,
                report.step,
                report.time,
                report.dt
            );
            frame
        }))
    }

    /// Most recent frame taken from the solver.
    pub fn latest_frame(&self) -> &Arc<ParticleFrame> {
        &self.frame
    }

    /// Most recent grid taken from the index task.
    pub fn grid(&self) -> &Arc<VoxelGrid> {
        &self.grid
    }

    pub fn last_report(&self) -> Option<StepReport> {
        self.last_report
    }

    /// Frames received so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Stops every task and waits for it.
    ///
    /// Returns the solver task's outcome. Helper failures are logged.
    pub fn shutdown(mut self) -> Result<(), SimulationError> {
        self.stop_all()
    }

    fn stop_all(&mut self) -> TaskResult {
        let solver = self.solver.stop();
        for (name, result) in [(INDEX_TASK, self.index.stop()), (DENSITY_TASK, self.density.stop())] {
            if let Err(err) = result {
                log::warn!("{name} task ended with an error: {err}");
            }
        }
        if !self.stopped {
            log::info!("Fluid simulation stopped after {} frames", self.frames);
            self.stopped = true;
        }
        solver
    }
}

impl Drop for FluidSimulation {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.stop_all();
        }
    }
}

fn run_solver(
    mut solver: FluidSolver,
    mut buffers: FrameBuffers,
    producer: Producer<SolverOutput, SolverFeed>,
) -> TaskResult {
    loop {
        let report = solver.step_delegated()?;
        let frame = solver.publish(&mut buffers);
        match producer.sync(SolverOutput { frame, report }) {
            Ok(Command::Continue(feed)) => feed.apply(&mut solver),
            Ok(Command::Stop) => {
                log::debug!(
                    "Solver task stopping at step {} ({} frame allocations)",
                    solver.timer().steps,
                    buffers.allocations()
                );
                return Ok(());
            }
            Err(Disconnected) => return Err(SimulationError::Disconnected { task: SOLVER_TASK }),
        }
    }
}

fn run_density(
    estimator: DensityEstimator,
    mut feed: DensityFeed,
    producer: Producer<DensityField, DensityFeed>,
) -> TaskResult {
    loop {
        let frame = &feed.frame;
        let field = estimator.estimate(&frame.positions, &frame.densities, &feed.grid, frame.step);
        match producer.sync(field) {
            Ok(Command::Continue(next)) => feed = next,
            Ok(Command::Stop) => return Ok(()),
            Err(Disconnected) => return Err(SimulationError::Disconnected { task: DENSITY_TASK }),
        }
    }
}

fn run_index(
    mut grid: Arc<VoxelGrid>,
    producer: Producer<Arc<VoxelGrid>, Arc<ParticleFrame>>,
) -> TaskResult {
    loop {
        match producer.sync(Arc::clone(&grid)) {
            Ok(Command::Continue(frame)) => {
                let report = Arc::make_mut(&mut grid).update(&frame.positions);
                log::trace!("Index refreshed for step {}: {report:?}", frame.step);
            }
            Ok(Command::Stop) => return Ok(()),
            Err(Disconnected) => return Err(SimulationError::Disconnected { task: INDEX_TASK }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid::boundary::BoundaryMesh;
    use crate::fluid::params::{FluidMaterial, GridConfig, SolverConfig};
    use crate::fluid::particle::{FluidBlock, ParticleSet};
    use glam::Vec3;

    fn grid_config() -> GridConfig {
        GridConfig::default()
    }

    fn block_solver() -> FluidSolver {
        let block = FluidBlock::cube(Vec3::new(0.0, -3.0, 0.0), 1.0, 4);
        let particles = ParticleSet::from_block(&block, Vec3::ZERO).unwrap();
        let boundary = BoundaryMesh::box_mesh(Vec3::splat(10.0), Vec3::ZERO).unwrap();
        FluidSolver::new(
            FluidMaterial::default(),
            SolverConfig::default(),
            &grid_config(),
            particles,
            Arc::new(boundary),
        )
        .unwrap()
    }

    #[test]
    fn test_each_handoff_delivers_next_step() {
        let mut simulation = FluidSimulation::start(block_solver(), SyncConfig::immediate()).unwrap();

        for expected in 1..=5 {
            let frame = simulation.poll(Instant::now()).unwrap().unwrap();
            assert_eq!(frame.step, expected);
            assert_eq!(frame.len(), 64);
            assert!(frame.positions.iter().all(|p| p.is_finite()));
        }
        assert_eq!(simulation.frames(), 5);
        assert_eq!(simulation.last_report().map(|r| r.step), Some(5));
        assert_eq!(simulation.shutdown(), Ok(()));
    }

    #[test]
    fn test_poll_waits_for_interval() {
        let sync = SyncConfig {
            frame_interval: 10.0,
            density_interval: 10.0,
            index_interval: 10.0,
        };
        let mut simulation = FluidSimulation::start(block_solver(), sync).unwrap();
        let start = Instant::now();

        assert!(simulation.poll(start).unwrap().is_some());
        assert!(simulation.poll(start + Duration::from_secs(1)).unwrap().is_none());
        let frame = simulation
            .poll(start + Duration::from_secs(11))
            .unwrap()
            .unwrap();
        assert_eq!(frame.step, 2);
        assert_eq!(simulation.shutdown(), Ok(()));
    }

    #[test]
    fn test_divergence_ends_simulation() {
        let particles = ParticleSet::new(
            vec![Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)],
            vec![Vec3::new(f32::NAN, 0.0, 0.0), Vec3::ZERO],
        )
        .unwrap();
        let boundary = BoundaryMesh::box_mesh(Vec3::splat(10.0), Vec3::ZERO).unwrap();
        let solver = FluidSolver::new(
            FluidMaterial::default(),
            SolverConfig::default(),
            &grid_config(),
            particles,
            Arc::new(boundary),
        )
        .unwrap();
        let mut simulation = FluidSimulation::start(solver, SyncConfig::immediate()).unwrap();

        let expected = SimulationError::Diverged {
            step: 1,
            particle: 0,
        };
        assert_eq!(simulation.poll(Instant::now()), Err(expected.clone()));
        assert_eq!(simulation.shutdown(), Err(expected));
    }

    #[test]
    fn test_helper_results_reach_solver() {
        let mut simulation = FluidSimulation::start(block_solver(), SyncConfig::immediate()).unwrap();

        let mut last = None;
        for _ in 0..4 {
            last = simulation.poll(Instant::now()).unwrap();
        }
        let frame = last.unwrap();
        assert!(frame.densities.iter().all(|d| *d > 0.0 && d.is_finite()));
        assert_eq!(simulation.grid().particle_count(), 64);
        assert_eq!(simulation.grid().last_report().unplaced, 0);
        simulation.shutdown().unwrap();
    }

    #[test]
    fn test_drop_stops_tasks() {
        let mut simulation = FluidSimulation::start(block_solver(), SyncConfig::immediate()).unwrap();
        simulation.poll(Instant::now()).unwrap();
        // Joins every worker; a hang here would stall the test.
        drop(simulation);
    }
}
