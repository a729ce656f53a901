//! Headless SPH harness.
//!
//! Runs a scene on worker threads and plays the consumer, logging frame
//! statistics as frames arrive.
//!
//! Usage: `sph_fluid [scene.ron] [frames]`. Without a scene file the built-in
//! default block drop is used. Set `RUST_LOG=debug` for index diagnostics.

use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use sph_fluid::prelude::*;

const DEFAULT_FRAMES: u64 = 240;
/// Longest the consumer sleeps between polls.
const IDLE: Duration = Duration::from_millis(2);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SimulationConfig::load(&path)?,
        None => {
            log::info!("No scene given, using the default block drop");
            SimulationConfig::default()
        }
    };
    let frames = match args.next() {
        Some(count) => count.parse()?,
        None => DEFAULT_FRAMES,
    };

    let solver = FluidSolver::from_config(&config)?;
    let mass = solver.mass();
    let mut simulation = FluidSimulation::start(solver, config.sync)?;
    let started = Instant::now();

    while simulation.frames() < frames {
        let frame = match simulation.poll(Instant::now()) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                thread::sleep(IDLE);
                continue;
            }
            Err(err) => {
                simulation.shutdown().ok();
                return Err(err.into());
            }
        };

        if simulation.frames() % 24 == 0 {
            let momentum = frame.velocities.iter().copied().sum::<glam::Vec3>() * mass;
            log::info!(
                "frame {:4} step {:5} t={:.3}s | max speed {:.3} | mean density {:.1} | momentum {:.3} | index {:.1}%",
                simulation.frames(),
                frame.step,
                frame.time,
                frame.max_speed(),
                frame.mean_density(),
                momentum.length(),
                simulation.grid().utilization() * 100.0
            );
        }
    }

    let report = simulation.last_report();
    simulation.shutdown()?;
    if let Some(report) = report {
        log::info!(
            "Finished {} frames ({} steps, t={:.3}s) in {:.2?}",
            frames,
            report.step,
            report.time,
            started.elapsed()
        );
    }
    Ok(())
}
