//! Plugins.
//!
//! A plugin is one instance implementing any subset of the capability set
//! {tick, intercept, birth, death}; it is registered by name through the
//! factory table at startup and serialised exactly once per sample no
//! matter how many capability lists it occupies. Plugin failures are
//! isolated: the hook's error is recorded and the tick continues.

use crate::rng::DeterministicRandom;
use primordia_error::{Error, ErrorKind};
use primordia_organism::Organism;
use primordia_types::{Molecule, Tick};
use primordia_world::World;
use std::collections::HashMap;

/// Which hooks a plugin participates in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Runs after the organisms stepped
    pub tick: bool,
    /// Sees the planned instructions before they execute
    pub intercept: bool,
    /// Invoked for every organism added this tick
    pub birth: bool,
    /// Invoked for every organism that died this tick
    pub death: bool,
}

/// The instruction an organism is about to execute.
#[derive(Debug, Clone)]
pub struct PlannedInstruction {
    /// Executing organism
    pub organism_id: u32,
    /// Fetched molecule
    pub opcode: Molecule,
    /// Where it was fetched from
    pub ip: Vec<i32>,
}

/// Mutable view of the simulation handed to plugin hooks.
///
/// The context replaces any back-pointer from organisms to the simulation:
/// randomness and the tick number come in as arguments.
pub struct TickContext<'a> {
    /// Tick being executed
    pub tick: Tick,
    /// The grid
    pub world: &'a mut World,
    /// All organisms in registration order
    pub organisms: &'a mut Vec<Organism>,
    /// Organisms to add at end of tick
    pub births: &'a mut Vec<Organism>,
    /// The deterministic random provider
    pub random: &'a mut DeterministicRandom,
    next_organism_id: &'a mut u32,
}

impl<'a> TickContext<'a> {
    pub(crate) fn new(
        tick: Tick,
        world: &'a mut World,
        organisms: &'a mut Vec<Organism>,
        births: &'a mut Vec<Organism>,
        random: &'a mut DeterministicRandom,
        next_organism_id: &'a mut u32,
    ) -> TickContext<'a> {
        TickContext {
            tick,
            world,
            organisms,
            births,
            random,
            next_organism_id,
        }
    }

    /// Allocates an organism id for a birth.
    pub fn reserve_organism_id(&mut self) -> u32 {
        let id = *self.next_organism_id;
        *self.next_organism_id += 1;
        id
    }
}

/// A simulation plugin. Default hook implementations do nothing, so a
/// plugin only overrides the hooks matching its capabilities.
pub trait Plugin: Send {
    /// Registered name, also the `plugin_class` of the serialized state.
    fn name(&self) -> &str;

    /// Capability subset this instance participates in.
    fn capabilities(&self) -> Capabilities;

    /// Environment manipulation after the organisms stepped.
    fn on_tick(&mut self, _ctx: &mut TickContext) -> Result<(), Error> {
        Ok(())
    }

    /// Observes (or vetoes, by mutating organisms) planned instructions.
    fn intercept(
        &mut self,
        _ctx: &mut TickContext,
        _planned: &[PlannedInstruction],
    ) -> Result<(), Error> {
        Ok(())
    }

    /// One organism was added this tick.
    fn on_birth(&mut self, _ctx: &mut TickContext, _organism_id: u32) -> Result<(), Error> {
        Ok(())
    }

    /// One organism died this tick.
    fn on_death(&mut self, _ctx: &mut TickContext, _organism_id: u32) -> Result<(), Error> {
        Ok(())
    }

    /// Opaque state blob captured per sample; the pipeline is a courier.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Restores state captured by `save_state`, invoked when the engine is
    /// primed from a resume snapshot. The default ignores the blob.
    fn restore_state(&mut self, _state: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// Factory signature: options come straight from the configuration.
pub type PluginFactory = fn(&serde_json::Value) -> Result<Box<dyn Plugin>, Error>;

/// Startup factory table mapping plugin names to constructors.
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = PluginRegistry {
            factories: HashMap::new(),
        };
        registry.register("energy-drain", EnergyDrainPlugin::from_options);
        registry
    }
}

impl PluginRegistry {
    /// A registry preloaded with the built-in plugins.
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// Registers a factory under `name`.
    pub fn register<S: ToString>(&mut self, name: S, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiates a plugin; unknown names are configuration errors.
    pub fn build(&self, name: &str, options: &serde_json::Value) -> Result<Box<dyn Plugin>, Error> {
        match self.factories.get(name) {
            Some(factory) => factory(options),
            None => Err(ErrorKind::ConfigInvalid.other(format!("unknown plugin: {}", name))),
        }
    }
}

/// Built-in environment plugin charging every living organism a fixed
/// energy cost per tick and killing the ones that cannot pay.
pub struct EnergyDrainPlugin {
    cost_per_tick: i64,
    drained_total: u64,
}

impl EnergyDrainPlugin {
    /// Creates the plugin with a fixed per-tick cost.
    pub fn new(cost_per_tick: i64) -> EnergyDrainPlugin {
        EnergyDrainPlugin {
            cost_per_tick,
            drained_total: 0,
        }
    }

    fn from_options(options: &serde_json::Value) -> Result<Box<dyn Plugin>, Error> {
        let cost = options
            .get("costPerTick")
            .and_then(|v| v.as_i64())
            .unwrap_or(1);
        if cost < 0 {
            return Err(ErrorKind::ConfigInvalid.other("costPerTick must be non-negative"));
        }
        Ok(Box::new(EnergyDrainPlugin::new(cost)))
    }
}

impl Plugin for EnergyDrainPlugin {
    fn name(&self) -> &str {
        "energy-drain"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tick: true,
            death: true,
            ..Capabilities::default()
        }
    }

    fn on_tick(&mut self, ctx: &mut TickContext) -> Result<(), Error> {
        let tick = ctx.tick;
        for organism in ctx.organisms.iter_mut() {
            if organism.is_dead() {
                continue;
            }
            if organism.consume_energy(self.cost_per_tick) {
                self.drained_total += self.cost_per_tick as u64;
            } else {
                organism.kill("energy exhausted", tick);
            }
        }
        Ok(())
    }

    fn save_state(&self) -> Vec<u8> {
        self.drained_total.to_le_bytes().to_vec()
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), Error> {
        let bytes: [u8; 8] = state
            .try_into()
            .map_err(|_| ErrorKind::DeserializationFailed.other("energy-drain state size"))?;
        self.drained_total = u64::from_le_bytes(bytes);
        Ok(())
    }
}
