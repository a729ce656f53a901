//! Bucketed voxel grid for neighbor search.
//!
//! The grid splits `[-half_extent, half_extent]³` into `resolution³` cells,
//! each with a fixed number of particle slots. A reverse map from particle id
//! to slot keeps relocation O(1). Particles that find no free slot in their
//! cell spill into the 27-cell neighborhood. A spilled particle keeps its
//! neighbor slot while its own cell stays full; if the whole neighborhood is
//! full it keeps its previous slot until a later update succeeds.

use glam::{IVec3, UVec3, Vec3};

use super::error::SetupError;
use super::params::GridConfig;

/// Marks an empty slot.
const EMPTY: u32 = u32::MAX;

/// Placement ratio below which an update is logged as degraded.
const UTILIZATION_WARNING: f32 = 0.9;

/// Offsets of the 3x3x3 neighborhood, in scan order.
static NEIGHBOR_OFFSETS: [IVec3; 27] = {
    let mut offsets = [IVec3::ZERO; 27];
    let mut i = 0;
    while i < 27 {
        offsets[i] = IVec3::new(i as i32 / 9 - 1, (i as i32 / 3) % 3 - 1, i as i32 % 3 - 1);
        i += 1;
    }
    offsets
};

/// A particle's position in the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Linear cell index.
    pub cell: usize,
    /// Bucket slot within the cell.
    pub index: usize,
}

/// Outcome of one [`VoxelGrid::update`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Particles sitting in their own cell or a neighbor of it.
    pub placed: usize,
    /// Particles that moved to a new slot during this update.
    pub relocated: usize,
    /// Particles placed in a neighbor because their own cell was full.
    pub spilled: usize,
    /// Particles left in a stale slot, or in none.
    pub unplaced: usize,
}

impl IndexReport {
    /// Particles the update looked at.
    pub fn total(&self) -> usize {
        self.placed + self.unplaced
    }

    /// Fraction of particles placed. An empty grid counts as fully placed.
    pub fn utilization(&self) -> f32 {
        if self.total() == 0 {
            1.0
        } else {
            self.placed as f32 / self.total() as f32
        }
    }
}

/// Uniform voxel grid with fixed-width buckets.
#[derive(Clone, Debug)]
pub struct VoxelGrid {
    resolution: u32,
    half_extent: f32,
    cell_width: f32,
    /// Slots per cell.
    bucket_width: usize,
    sample_cap: usize,
    /// `cells * bucket_width` particle ids, [`EMPTY`] where free.
    slots: Vec<u32>,
    /// Reverse map, particle id to slot.
    occupancy: Vec<Option<Slot>>,
    last_report: IndexReport,
}

impl VoxelGrid {
    /// Allocates an empty grid sized for `particle_count` particles.
    pub fn new(config: &GridConfig, particle_count: usize) -> Result<Self, SetupError> {
        config.validate_layout()?;
        if particle_count == 0 {
            return Err(SetupError::EmptyParticleSet);
        }

        let cells = config.cell_count();
        let bucket_width =
            ((config.load_factor * particle_count as f32 / cells as f32).ceil() as usize).max(1);

        Ok(Self {
            resolution: config.resolution,
            half_extent: config.half_extent,
            cell_width: config.cell_width(),
            bucket_width,
            sample_cap: config.sample_cap,
            slots: vec![EMPTY; cells * bucket_width],
            occupancy: vec![None; particle_count],
            last_report: IndexReport::default(),
        })
    }

    /// Allocates a grid and places every particle in it.
    pub fn build(positions: &[Vec3], config: &GridConfig) -> Result<Self, SetupError> {
        let mut grid = Self::new(config, positions.len())?;
        grid.update(positions);
        log::debug!(
            "Voxel grid {}³ with {} slots per cell ({} KiB)",
            grid.resolution,
            grid.bucket_width,
            grid.storage_bytes() / 1024
        );
        Ok(grid)
    }

    /// Cells per axis.
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Edge length of one cell.
    pub fn cell_width(&self) -> f32 {
        self.cell_width
    }

    /// Slots per cell.
    pub fn bucket_width(&self) -> usize {
        self.bucket_width
    }

    /// Upper bound on candidates per query.
    pub fn sample_cap(&self) -> usize {
        self.sample_cap
    }

    pub fn cell_count(&self) -> usize {
        (self.resolution as usize).pow(3)
    }

    /// Number of particles the grid was sized for.
    pub fn particle_count(&self) -> usize {
        self.occupancy.len()
    }

    /// Slot held by particle `id`, if any.
    pub fn slot_of(&self, id: usize) -> Option<Slot> {
        self.occupancy.get(id).copied().flatten()
    }

    /// Report from the most recent update.
    pub fn last_report(&self) -> IndexReport {
        self.last_report
    }

    /// Placement ratio of the last update.
    pub fn utilization(&self) -> f32 {
        self.last_report.utilization()
    }

    /// Bytes held by the bucket array and the reverse map.
    pub fn storage_bytes(&self) -> usize {
        self.slots.len() * std::mem::size_of::<u32>()
            + self.occupancy.len() * std::mem::size_of::<Option<Slot>>()
    }

    /// Integer cell coordinates for a position. Positions on or past the
    /// upper face land in the last cell.
    pub fn cell_coords(&self, position: Vec3) -> UVec3 {
        let shifted = position.clamp(Vec3::splat(-self.half_extent), Vec3::splat(self.half_extent))
            + Vec3::splat(self.half_extent);
        (shifted / self.cell_width)
            .as_uvec3()
            .min(UVec3::splat(self.resolution - 1))
    }

    /// Linear cell index for a position. Positions outside the grid clamp to
    /// its boundary cells.
    pub fn hash(&self, position: Vec3) -> usize {
        self.linear(self.cell_coords(position))
    }

    fn linear(&self, coords: UVec3) -> usize {
        let res = self.resolution as usize;
        (coords.x as usize * res + coords.y as usize) * res + coords.z as usize
    }

    fn coords(&self, cell: usize) -> IVec3 {
        let res = self.resolution as usize;
        IVec3::new(
            (cell / (res * res)) as i32,
            ((cell / res) % res) as i32,
            (cell % res) as i32,
        )
    }

    /// Whether `a` lies in the 3x3x3 block centered on `b`.
    fn adjacent(&self, a: usize, b: usize) -> bool {
        (self.coords(a) - self.coords(b)).abs().max_element() <= 1
    }

    /// The in-bounds cells around `cell`, excluding `cell` itself.
    fn neighbor_cells(&self, cell: usize) -> impl Iterator<Item = usize> + '_ {
        let center = self.coords(cell);
        let res = self.resolution as i32;
        NEIGHBOR_OFFSETS
            .iter()
            .filter(|offset| **offset != IVec3::ZERO)
            .map(move |offset| center + *offset)
            .filter(move |c| c.cmpge(IVec3::ZERO).all() && c.cmplt(IVec3::splat(res)).all())
            .map(|c| self.linear(c.as_uvec3()))
    }

    fn bucket(&self, cell: usize) -> &[u32] {
        let start = cell * self.bucket_width;
        &self.slots[start..start + self.bucket_width]
    }

    fn free_slot(&self, cell: usize) -> Option<Slot> {
        self.bucket(cell)
            .iter()
            .position(|&id| id == EMPTY)
            .map(|index| Slot { cell, index })
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut u32 {
        &mut self.slots[slot.cell * self.bucket_width + slot.index]
    }

    /// Re-buckets every particle whose cell changed.
    ///
    /// `positions` must hold one entry per particle the grid was built for.
    pub fn update(&mut self, positions: &[Vec3]) -> IndexReport {
        debug_assert_eq!(positions.len(), self.occupancy.len());
        let mut report = IndexReport::default();

        for (id, &position) in positions.iter().enumerate().take(self.occupancy.len()) {
            let target = self.hash(position);
            let current = self.occupancy[id];
            if current.is_some_and(|slot| slot.cell == target) {
                report.placed += 1;
                continue;
            }

            let own = self.free_slot(target);
            if own.is_none() && current.is_some_and(|slot| self.adjacent(slot.cell, target)) {
                // Already spilled next door and the own cell is still full.
                report.placed += 1;
                report.spilled += 1;
                continue;
            }

            let (free, spilled) = match own {
                Some(slot) => (Some(slot), false),
                None => (
                    self.neighbor_cells(target).find_map(|cell| self.free_slot(cell)),
                    true,
                ),
            };

            match free {
                Some(slot) => {
                    if let Some(old) = current {
                        *self.slot_mut(old) = EMPTY;
                    }
                    *self.slot_mut(slot) = id as u32;
                    self.occupancy[id] = Some(slot);
                    report.placed += 1;
                    report.relocated += 1;
                    if spilled {
                        report.spilled += 1;
                    }
                }
                None => {
                    report.unplaced += 1;
                    log::debug!("Particle {id} found no free slot near cell {target}");
                }
            }
        }

        if report.unplaced > 0 {
            log::warn!(
                "Voxel grid could not place {} of {} particles; their neighbor lists are stale",
                report.unplaced,
                report.total()
            );
        }
        if report.utilization() < UTILIZATION_WARNING {
            log::warn!(
                "Voxel grid utilization {:.1}% is below {:.0}%",
                report.utilization() * 100.0,
                UTILIZATION_WARNING * 100.0
            );
        }

        self.last_report = report;
        report
    }

    /// Candidates from `cell` and then its neighbors, up to the sample cap.
    pub fn samples_in_cell(&self, cell: usize) -> Vec<usize> {
        let mut samples = Vec::with_capacity(self.sample_cap);
        let cells = std::iter::once(cell).chain(self.neighbor_cells(cell));
        for cell in cells {
            for &id in self.bucket(cell) {
                if samples.len() == self.sample_cap {
                    return samples;
                }
                if id != EMPTY {
                    samples.push(id as usize);
                }
            }
        }
        samples
    }

    /// Candidates around particle `id`, centered on the cell it is stored in.
    ///
    /// Includes `id` itself. Not sorted by distance.
    pub fn samples_for_particle(&self, id: usize, positions: &[Vec3]) -> Vec<usize> {
        let cell = match self.slot_of(id) {
            Some(slot) => slot.cell,
            None => self.hash(positions[id]),
        };
        self.samples_in_cell(cell)
    }

    /// Candidates around an arbitrary point.
    pub fn samples_at(&self, position: Vec3) -> Vec<usize> {
        self.samples_in_cell(self.hash(position))
    }
}
