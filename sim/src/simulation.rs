//! The simulation stepper.

use crate::instruction::InstructionSet;
use crate::plugin::{Capabilities, PlannedInstruction, Plugin, TickContext};
use crate::rng::DeterministicRandom;
use primordia_error::{Error, ErrorKind};
use primordia_logger::{debug, warn};
use primordia_organism::{genome_hash, Organism, OrganismLimits, RestoreSpec};
use primordia_runtime::ErrorLog;
use primordia_types::{MoleculeType, OrganismState, PluginState, Tick, TickData};
use primordia_world::World;
use std::sync::Arc;

/// The deterministic engine core: world, organisms, plugins and the random
/// provider, advanced one tick at a time by its owning thread.
///
/// A tick runs (a) planned-instruction interceptors, (b) one instruction
/// per living organism in registration order, (c) tick plugins, (d) birth
/// and death handling. Plugin failures are recorded and isolated.
pub struct Simulation {
    run_id: String,
    world: World,
    organisms: Vec<Organism>,
    plugins: Vec<Box<dyn Plugin>>,
    tick_plugins: Vec<usize>,
    intercept_plugins: Vec<usize>,
    birth_plugins: Vec<usize>,
    death_plugins: Vec<usize>,
    random: DeterministicRandom,
    instruction_set: Box<dyn InstructionSet>,
    skip_cap: usize,
    next_organism_id: u32,
    tick: Tick,
    error_log: Arc<ErrorLog>,
}

impl Simulation {
    /// Creates an engine over `world`, seeding the random provider once.
    pub fn new(
        run_id: String,
        world: World,
        instruction_set: Box<dyn InstructionSet>,
        seed: i64,
        skip_cap: usize,
    ) -> Simulation {
        Simulation {
            run_id,
            world,
            organisms: Vec::new(),
            plugins: Vec::new(),
            tick_plugins: Vec::new(),
            intercept_plugins: Vec::new(),
            birth_plugins: Vec::new(),
            death_plugins: Vec::new(),
            random: DeterministicRandom::seeded(seed),
            instruction_set,
            skip_cap,
            next_organism_id: 1,
            tick: 0,
            error_log: Arc::new(ErrorLog::default()),
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The next tick to execute.
    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    /// The grid.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable grid access for seeding.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// All organisms in registration order.
    pub fn organisms(&self) -> &[Organism] {
        &self.organisms
    }

    /// Looks an organism up by id.
    pub fn organism(&self, id: u32) -> Option<&Organism> {
        self.organisms.iter().find(|o| o.id() == id)
    }

    /// Number of organisms still alive.
    pub fn living_count(&self) -> usize {
        self.organisms.iter().filter(|o| !o.is_dead()).count()
    }

    /// Operational error log shared with the runtime.
    pub fn error_log(&self) -> Arc<ErrorLog> {
        Arc::clone(&self.error_log)
    }

    /// Registers a plugin instance; one instance may occupy several
    /// capability lists but is serialised once per sample.
    pub fn register_plugin(&mut self, plugin: Box<dyn Plugin>) {
        let Capabilities {
            tick,
            intercept,
            birth,
            death,
        } = plugin.capabilities();
        let index = self.plugins.len();
        self.plugins.push(plugin);
        if tick {
            self.tick_plugins.push(index);
        }
        if intercept {
            self.intercept_plugins.push(index);
        }
        if birth {
            self.birth_plugins.push(index);
        }
        if death {
            self.death_plugins.push(index);
        }
    }

    /// Places a new organism and claims its initial cell.
    pub fn spawn_organism(
        &mut self,
        program_id: &str,
        position: Vec<i32>,
        initial_energy: i64,
        limits: OrganismLimits,
    ) -> Result<u32, Error> {
        if position.len() != self.world.shape().rank() {
            return Err(ErrorKind::ConfigInvalid.other(format!(
                "placement rank {} does not match world rank {}",
                position.len(),
                self.world.shape().rank()
            )));
        }
        let id = self.next_organism_id;
        self.next_organism_id += 1;
        if !self.world.set_owner(id, &position) {
            return Err(ErrorKind::ConfigInvalid
                .other(format!("placement {:?} outside the world", position)));
        }
        self.organisms.push(Organism::new(
            id,
            None,
            program_id.to_string(),
            position,
            self.tick,
            initial_energy,
            limits,
        ));
        Ok(id)
    }

    /// Primes a fresh engine from a resume snapshot: grid cells, organisms
    /// rebuilt through their restore records, plugin state blobs and the
    /// random provider. The engine resumes at the tick after the snapshot.
    ///
    /// Only a pristine engine (no ticks run, no organisms) can be primed;
    /// plugins must already be registered so their state can be restored.
    pub fn prime_from_snapshot(
        &mut self,
        snapshot: &TickData,
        limits: &OrganismLimits,
    ) -> Result<(), Error> {
        if self.tick != 0 || !self.organisms.is_empty() {
            return Err(ErrorKind::ConfigInvalid.other("resume priming needs a pristine engine"));
        }
        for cell in &snapshot.cells {
            self.world.apply_cell(cell);
        }
        // the primed state is the baseline, not a change
        self.world.reset_change_tracking();

        for state in &snapshot.organisms {
            let organism = RestoreSpec::new(state.clone()).build(limits.clone())?;
            self.next_organism_id = self.next_organism_id.max(organism.id() + 1);
            self.organisms.push(organism);
        }

        for plugin_state in &snapshot.plugins {
            let plugin = self
                .plugins
                .iter_mut()
                .find(|p| p.name() == plugin_state.plugin_class)
                .ok_or_else(|| {
                    ErrorKind::ConfigInvalid.other(format!(
                        "resume snapshot references unregistered plugin {}",
                        plugin_state.plugin_class
                    ))
                })?;
            plugin.restore_state(&plugin_state.state_blob)?;
        }

        if !snapshot.rng_state.is_empty() {
            self.random = DeterministicRandom::from_state_bytes(&snapshot.rng_state)?;
        }
        self.tick = snapshot.tick_number + 1;
        Ok(())
    }

    /// Executes one tick.
    pub fn tick(&mut self) {
        let current = self.tick;
        let mut births: Vec<Organism> = Vec::new();

        // (a) planned-instruction interceptors
        if !self.intercept_plugins.is_empty() {
            let planned: Vec<PlannedInstruction> = self
                .organisms
                .iter()
                .filter(|o| !o.is_dead())
                .map(|o| PlannedInstruction {
                    organism_id: o.id(),
                    opcode: self.world.molecule(o.ip()),
                    ip: o.ip().to_vec(),
                })
                .collect();
            let Simulation {
                world,
                organisms,
                plugins,
                random,
                next_organism_id,
                error_log,
                intercept_plugins,
                ..
            } = self;
            let mut ctx = TickContext::new(
                current,
                world,
                organisms,
                &mut births,
                random,
                next_organism_id,
            );
            for &index in intercept_plugins.iter() {
                if let Err(e) = plugins[index].intercept(&mut ctx, &planned) {
                    record_plugin_failure(error_log, plugins[index].name(), current, &e);
                }
            }
        }

        // (b) one instruction per living organism, registration order
        for index in 0..self.organisms.len() {
            self.step_organism(index, current);
        }

        // (c) tick plugins see the post-step environment
        {
            let Simulation {
                world,
                organisms,
                plugins,
                random,
                next_organism_id,
                error_log,
                tick_plugins,
                ..
            } = self;
            let mut ctx = TickContext::new(
                current,
                world,
                organisms,
                &mut births,
                random,
                next_organism_id,
            );
            for &index in tick_plugins.iter() {
                if let Err(e) = plugins[index].on_tick(&mut ctx) {
                    record_plugin_failure(error_log, plugins[index].name(), current, &e);
                }
            }
        }

        // (d) births buffered during the tick land now, then deaths clean up
        let born_ids: Vec<u32> = births.iter().map(|o| o.id()).collect();
        self.organisms.append(&mut births);
        for id in born_ids {
            debug!("organism {} born at tick {}", id, current);
            self.run_lifecycle_hooks(current, id, LifecycleHook::Birth);
        }

        let dead_ids: Vec<u32> = self
            .organisms
            .iter()
            .filter(|o| o.death_tick() == Some(current))
            .map(|o| o.id())
            .collect();
        for id in dead_ids {
            self.world.clear_ownership_for(id);
            debug!("organism {} died at tick {}", id, current);
            self.run_lifecycle_hooks(current, id, LifecycleHook::Death);
        }

        self.tick += 1;
    }

    fn step_organism(&mut self, index: usize, tick: Tick) {
        {
            let organism = &mut self.organisms[index];
            if organism.is_dead() {
                return;
            }
            organism.reset_tick_state();
        }

        // fetch, skipping non-code cells up to the stall cap
        let mut scanned = 0usize;
        let opcode = loop {
            let molecule = {
                let organism = &self.organisms[index];
                self.world.molecule(organism.ip())
            };
            if molecule.mol_type() == MoleculeType::Code {
                break molecule;
            }
            if scanned >= self.skip_cap {
                self.organisms[index].recover_from_stall();
                return;
            }
            self.organisms[index].advance_ip();
            scanned += 1;
        };

        let organism_id = self.organisms[index].id();
        let mut organism_rng = self.random.for_organism(organism_id);
        let organism = &mut self.organisms[index];
        match self
            .instruction_set
            .execute(opcode, organism, &mut self.world, &mut organism_rng, tick)
        {
            Ok(execution) => {
                let cost = execution.energy_cost;
                let entropy = execution.entropy_delta;
                organism.record_execution(execution);
                organism.add_entropy(entropy);
                if cost > 0 && !organism.consume_energy(cost) {
                    organism.kill("energy exhausted", tick);
                    return;
                }
                organism.advance_ip();
            }
            Err(e) => {
                if organism.logging_enabled() {
                    debug!("organism {} instruction failed: {}", organism_id, e);
                }
                organism.fail(e.reason());
            }
        }
    }

    fn run_lifecycle_hooks(&mut self, tick: Tick, organism_id: u32, hook: LifecycleHook) {
        let mut births: Vec<Organism> = Vec::new();
        let Simulation {
            world,
            organisms,
            plugins,
            random,
            next_organism_id,
            error_log,
            birth_plugins,
            death_plugins,
            ..
        } = self;
        let indices = match hook {
            LifecycleHook::Birth => birth_plugins,
            LifecycleHook::Death => death_plugins,
        };
        let mut ctx = TickContext::new(
            tick,
            world,
            organisms,
            &mut births,
            random,
            next_organism_id,
        );
        for &index in indices.iter() {
            let result = match hook {
                LifecycleHook::Birth => plugins[index].on_birth(&mut ctx, organism_id),
                LifecycleHook::Death => plugins[index].on_death(&mut ctx, organism_id),
            };
            if let Err(e) = result {
                record_plugin_failure(error_log, plugins[index].name(), tick, &e);
            }
        }
        // lifecycle hooks may not spawn recursively
        if !births.is_empty() {
            warn!("{} births from lifecycle hooks dropped", births.len());
        }
    }

    /// Serializes every organism alive at `sampled_tick`, including the
    /// ones that died during it, reusing `buf`.
    pub fn collect_organism_states(&self, sampled_tick: Tick, buf: &mut Vec<OrganismState>) {
        buf.clear();
        for organism in &self.organisms {
            if organism.is_dead() && organism.death_tick() != Some(sampled_tick) {
                continue;
            }
            let hash = genome_hash(&self.world, organism.id(), organism.initial_position());
            buf.push(organism.to_state(hash));
        }
    }

    /// Serializes each unique plugin instance exactly once, reusing `buf`.
    pub fn collect_plugin_states(&self, buf: &mut Vec<PluginState>) {
        buf.clear();
        for plugin in &self.plugins {
            buf.push(PluginState {
                plugin_class: plugin.name().to_string(),
                state_blob: plugin.save_state(),
            });
        }
    }

    /// Serialized random provider state.
    pub fn rng_state(&self) -> Vec<u8> {
        self.random.state_bytes()
    }
}

#[derive(Clone, Copy)]
enum LifecycleHook {
    Birth,
    Death,
}

fn record_plugin_failure(error_log: &ErrorLog, name: &str, tick: Tick, error: &Error) {
    warn!("plugin {} failed at tick {}: {}", name, tick, error);
    error_log.push(ErrorKind::PluginFailed.other(format!("{} at tick {}: {}", name, tick, error)));
}
