//! Instruction execution seam.
//!
//! The concrete instruction set is an external collaborator; the stepper
//! only needs a way to execute the fetched molecule and learn what it cost.
//! A small built-in set ships for tests and the default profile: enough to
//! walk, mark territory, move data through the stack and grow structure at
//! the active data pointer.

use primordia_error::{Error, ErrorKind};
use primordia_organism::{Organism, DATA_REG_BASE};
use primordia_types::{LastExecution, Molecule, MoleculeType, RegValue, Tick};
use primordia_world::World;
use rand_chacha::ChaCha8Rng;

/// Executes single instructions for the stepper.
pub trait InstructionSet: Send {
    /// Executes `opcode` for `organism`. The instruction pointer still sits
    /// on the fetched molecule; the stepper advances it afterwards.
    fn execute(
        &self,
        opcode: Molecule,
        organism: &mut Organism,
        world: &mut World,
        random: &mut ChaCha8Rng,
        tick: Tick,
    ) -> Result<LastExecution, Error>;
}

const OP_NOP: i32 = 0;
const OP_TURN: i32 = 1;
const OP_MARK: i32 = 2;
const OP_PUSH: i32 = 3;
const OP_POP: i32 = 4;
const OP_SETDP: i32 = 5;
const OP_GROW: i32 = 6;
const OP_HARVEST: i32 = 7;

const GROW_COST: i64 = 2;
const GROW_ENTROPY: i64 = 1;

/// The built-in instruction set.
pub struct BasicInstructionSet {
    /// Energy charged per executed instruction on top of op-specific costs.
    pub base_cost: i64,
}

impl Default for BasicInstructionSet {
    fn default() -> Self {
        BasicInstructionSet { base_cost: 0 }
    }
}

impl BasicInstructionSet {
    fn done(&self, opcode_id: i32, extra_cost: i64) -> LastExecution {
        LastExecution {
            opcode_id: opcode_id as u32,
            raw_arguments: Vec::new(),
            energy_cost: self.base_cost + extra_cost,
            entropy_delta: 0,
            pre_registers: Vec::new(),
        }
    }

    /// Reads the DATA molecule ahead of the instruction pointer and leaves
    /// the pointer on it, so the stepper's advance skips the operand.
    fn fetch_operand(&self, organism: &mut Organism, world: &World) -> Result<Molecule, Error> {
        organism.advance_ip();
        let operand = world.molecule(organism.ip());
        if operand.mol_type() != MoleculeType::Data {
            return Err(ErrorKind::InstructionFailed.other(format!(
                "operand at {:?} is not data",
                organism.ip()
            )));
        }
        Ok(operand)
    }
}

impl InstructionSet for BasicInstructionSet {
    fn execute(
        &self,
        opcode: Molecule,
        organism: &mut Organism,
        world: &mut World,
        _random: &mut ChaCha8Rng,
        _tick: Tick,
    ) -> Result<LastExecution, Error> {
        let value = opcode.value();
        match value {
            OP_NOP => Ok(self.done(OP_NOP, 0)),
            OP_TURN => {
                // rotate the direction vector one axis forward
                let mut dv = organism.dv().to_vec();
                dv.rotate_right(1);
                organism.set_dv(dv);
                Ok(self.done(OP_TURN, 0))
            }
            OP_MARK => {
                let ip = organism.ip().to_vec();
                let current = world.molecule(&ip);
                world.set_molecule(current.with_marker(organism.marker()), organism.id(), &ip);
                Ok(self.done(OP_MARK, 0))
            }
            OP_PUSH => {
                let operand = self.fetch_operand(organism, world)?;
                organism.push_data(RegValue::Int(i64::from(operand.value())));
                let mut execution = self.done(OP_PUSH, 0);
                execution.raw_arguments.push(operand.value());
                Ok(execution)
            }
            OP_POP => {
                let before = organism.read_register(DATA_REG_BASE);
                let popped = organism.pop_data();
                organism.write_register(DATA_REG_BASE, popped);
                let mut execution = self.done(OP_POP, 0);
                execution.pre_registers.push((DATA_REG_BASE, before));
                Ok(execution)
            }
            OP_SETDP => {
                let here = organism.ip().to_vec();
                organism.set_active_data_pointer(here);
                Ok(self.done(OP_SETDP, 0))
            }
            OP_GROW => {
                let target = organism.active_data_pointer().to_vec();
                if !world.molecule(&target).is_empty() || world.owner(&target) != 0 {
                    return Err(ErrorKind::InstructionFailed
                        .other(format!("grow target {:?} is occupied", target)));
                }
                world.set_molecule(
                    Molecule::pack(0, MoleculeType::Structure, 1),
                    organism.id(),
                    &target,
                );
                let mut execution = self.done(OP_GROW, GROW_COST);
                execution.entropy_delta = GROW_ENTROPY;
                Ok(execution)
            }
            OP_HARVEST => {
                let target = organism.active_data_pointer().to_vec();
                let molecule = world.molecule(&target);
                if molecule.mol_type() != MoleculeType::Energy {
                    return Err(ErrorKind::InstructionFailed
                        .other(format!("nothing to harvest at {:?}", target)));
                }
                organism.add_energy(i64::from(molecule.value()));
                world.set_molecule(Molecule::EMPTY, 0, &target);
                Ok(self.done(OP_HARVEST, 0))
            }
            unknown => Err(ErrorKind::InstructionFailed.other(format!(
                "unknown opcode {} at {:?}",
                unknown,
                organism.ip()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordia_organism::OrganismLimits;
    use primordia_types::{Shape, Topology};
    use rand::SeedableRng;

    fn setup() -> (World, Organism, ChaCha8Rng) {
        let world = World::new(Shape::new(vec![8, 8], Topology::Bounded).unwrap());
        let organism = Organism::new(
            1,
            None,
            "prog".to_string(),
            vec![1, 1],
            0,
            10,
            OrganismLimits::default(),
        );
        (world, organism, ChaCha8Rng::seed_from_u64(0))
    }

    fn exec(
        set: &BasicInstructionSet,
        op: i32,
        organism: &mut Organism,
        world: &mut World,
        rng: &mut ChaCha8Rng,
    ) -> Result<LastExecution, Error> {
        set.execute(
            Molecule::pack(0, MoleculeType::Code, op),
            organism,
            world,
            rng,
            0,
        )
    }

    #[test]
    fn turn_rotates_the_direction_vector() {
        let (mut world, mut organism, mut rng) = setup();
        let set = BasicInstructionSet::default();
        assert_eq!(organism.dv(), &[1, 0]);
        exec(&set, OP_TURN, &mut organism, &mut world, &mut rng).unwrap();
        assert_eq!(organism.dv(), &[0, 1]);
    }

    #[test]
    fn push_consumes_a_data_operand_then_pop_lands_in_register_zero() {
        let (mut world, mut organism, mut rng) = setup();
        let set = BasicInstructionSet::default();
        // operand sits ahead of the instruction pointer
        world.set_molecule(Molecule::pack(0, MoleculeType::Data, 77), 0, &[2, 1]);

        let execution = exec(&set, OP_PUSH, &mut organism, &mut world, &mut rng).unwrap();
        assert_eq!(execution.raw_arguments, vec![77]);
        assert_eq!(organism.ip(), &[2, 1]);

        let execution = exec(&set, OP_POP, &mut organism, &mut world, &mut rng).unwrap();
        assert_eq!(execution.pre_registers, vec![(DATA_REG_BASE, RegValue::Int(0))]);
        assert_eq!(organism.read_register(DATA_REG_BASE), RegValue::Int(77));
    }

    #[test]
    fn push_without_data_operand_fails() {
        let (mut world, mut organism, mut rng) = setup();
        let set = BasicInstructionSet::default();
        let err = exec(&set, OP_PUSH, &mut organism, &mut world, &mut rng).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstructionFailed);
    }

    #[test]
    fn grow_builds_structure_at_the_data_pointer() {
        let (mut world, mut organism, mut rng) = setup();
        let set = BasicInstructionSet::default();
        exec(&set, OP_SETDP, &mut organism, &mut world, &mut rng).unwrap();
        assert_eq!(organism.active_data_pointer(), &[1, 1]);

        let execution = exec(&set, OP_GROW, &mut organism, &mut world, &mut rng).unwrap();
        assert_eq!(execution.energy_cost, GROW_COST);
        assert_eq!(execution.entropy_delta, GROW_ENTROPY);
        assert_eq!(world.owner(&[1, 1]), 1);
        assert_eq!(
            world.molecule(&[1, 1]).mol_type(),
            MoleculeType::Structure
        );

        // the target is occupied now
        let err = exec(&set, OP_GROW, &mut organism, &mut world, &mut rng).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstructionFailed);
    }

    #[test]
    fn harvest_absorbs_energy_and_clears_the_cell() {
        let (mut world, mut organism, mut rng) = setup();
        let set = BasicInstructionSet::default();
        world.set_molecule(Molecule::pack(0, MoleculeType::Energy, 40), 0, &[1, 1]);
        exec(&set, OP_SETDP, &mut organism, &mut world, &mut rng).unwrap();

        exec(&set, OP_HARVEST, &mut organism, &mut world, &mut rng).unwrap();
        assert_eq!(organism.energy(), 50);
        assert!(world.molecule(&[1, 1]).is_empty());
        assert_eq!(world.owner(&[1, 1]), 0);
    }

    #[test]
    fn unknown_opcode_is_an_instruction_failure() {
        let (mut world, mut organism, mut rng) = setup();
        let set = BasicInstructionSet::default();
        let err = exec(&set, 99, &mut organism, &mut world, &mut rng).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstructionFailed);
    }
}
