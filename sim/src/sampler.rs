//! The sampling engine, synchronous half.
//!
//! Advances the simulation one tick at a time and captures every
//! `sampling_interval`-th tick into the chunk encoder. Buffers are taken,
//! not copied: per-sample allocation stays proportional to changed cells
//! plus living organisms, never the grid volume.

use crate::simulation::Simulation;
use primordia_chunk::{ChunkEncoder, SampleInput};
use primordia_error::{Error, ErrorKind};
use primordia_types::{ChangedCell, OrganismState, PluginState, Tick, TickDataChunk};

/// Sampling cadence and cooperative scheduling knobs.
#[derive(Debug, Clone, Default)]
pub struct SamplerConfig {
    /// Capture every n-th tick, at least 1
    pub sampling_interval: u64,
    /// Yield to the scheduler every n-th tick, 0 to disable
    pub yield_interval: u64,
    /// Ticks at which the engine parks itself until resumed
    pub pause_ticks: Vec<Tick>,
}

/// Couples the stepper with the chunk encoder.
pub struct Sampler {
    simulation: Simulation,
    encoder: ChunkEncoder,
    sampling_interval: u64,
    organisms_buf: Vec<OrganismState>,
    plugins_buf: Vec<PluginState>,
    changed_buf: Vec<ChangedCell>,
}

impl Sampler {
    /// Builds a sampler; a zero sampling interval is a configuration error.
    pub fn new(
        simulation: Simulation,
        encoder: ChunkEncoder,
        sampling_interval: u64,
    ) -> Result<Sampler, Error> {
        if sampling_interval < 1 {
            return Err(ErrorKind::ConfigInvalid.other("sampling_interval must be >= 1"));
        }
        Ok(Sampler {
            simulation,
            encoder,
            sampling_interval,
            organisms_buf: Vec::new(),
            plugins_buf: Vec::new(),
            changed_buf: Vec::new(),
        })
    }

    /// The wrapped simulation.
    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// Mutable simulation access for seeding.
    pub fn simulation_mut(&mut self) -> &mut Simulation {
        &mut self.simulation
    }

    /// The next tick to execute.
    pub fn current_tick(&self) -> Tick {
        self.simulation.current_tick()
    }

    /// Runs one tick; captures it when the cadence says so and returns the
    /// chunk the capture completed, if any.
    pub fn advance(&mut self) -> Option<TickDataChunk> {
        let tick = self.simulation.current_tick();
        self.simulation.tick();
        if tick % self.sampling_interval != 0 {
            return None;
        }

        self.simulation
            .collect_organism_states(tick, &mut self.organisms_buf);
        self.simulation.collect_plugin_states(&mut self.plugins_buf);
        let rng_state = self.simulation.rng_state();
        self.simulation
            .world_mut()
            .drain_changed_cells_into(&mut self.changed_buf);

        let input = SampleInput {
            tick,
            changed_cells: std::mem::take(&mut self.changed_buf),
            organisms: std::mem::take(&mut self.organisms_buf),
            plugins: std::mem::take(&mut self.plugins_buf),
            rng_state,
        };

        let Sampler {
            simulation,
            encoder,
            ..
        } = self;
        encoder.capture(input, || {
            let mut cells = Vec::new();
            simulation.world().occupied_cells_into(&mut cells);
            cells
        })
    }
}
