//! Simulation stepper and sampling engine.
//!
//! One tick runs in four phases: planned-instruction interceptors, one
//! instruction per living organism, tick plugins, then birth and death
//! handling. The sampler wraps the stepper, captures every
//! `sampling_interval`-th tick into the chunk encoder and pushes finished
//! chunks into the tick-data queue with blocking backpressure.

mod instruction;
mod plugin;
mod rng;
mod sampler;
mod sampler_service;
mod simulation;

pub use instruction::{BasicInstructionSet, InstructionSet};
pub use plugin::{
    Capabilities, EnergyDrainPlugin, PlannedInstruction, Plugin, PluginRegistry, TickContext,
};
pub use rng::DeterministicRandom;
pub use sampler::{Sampler, SamplerConfig};
pub use sampler_service::SamplerService;
pub use simulation::Simulation;
