//! Organism restoration from a serialized state record.
//!
//! Restoration is a single immutable record validated as a whole at build
//! time; there is no mutator chain to leave an organism half-initialised.

use crate::organism::{Organism, OrganismLimits};
use primordia_error::{Error, ErrorKind};
use primordia_types::OrganismState;

/// An immutable construction record for a restored organism.
#[derive(Debug, Clone)]
pub struct RestoreSpec {
    state: OrganismState,
}

impl RestoreSpec {
    /// Wraps a serialized state record.
    pub fn new(state: OrganismState) -> RestoreSpec {
        RestoreSpec { state }
    }

    /// Validates the record against the VM limits and builds the organism.
    pub fn build(self, limits: OrganismLimits) -> Result<Organism, Error> {
        let state = &self.state;
        let rank = state.initial_position.len();
        if rank == 0 {
            return Err(invalid("initial position is empty"));
        }
        for (name, coord) in [
            ("ip", &state.ip),
            ("dv", &state.dv),
            ("ip_before_fetch", &state.ip_before_fetch),
            ("dv_before_fetch", &state.dv_before_fetch),
        ] {
            if coord.len() != rank {
                return Err(invalid(format!("{} rank mismatch", name)));
            }
        }
        if state.data_pointers.len() != limits.data_pointers
            || state.data_pointers.iter().any(|dp| dp.len() != rank)
        {
            return Err(invalid("data pointer layout mismatch"));
        }
        if state.active_data_pointer as usize >= limits.data_pointers {
            return Err(invalid("active data pointer out of range"));
        }
        if state.data_registers.len() != limits.data_registers
            || state.proc_registers.len() != limits.proc_registers
            || state.formal_param_registers.len() != limits.formal_params
            || state.location_registers.len() != limits.location_registers
        {
            return Err(invalid("register bank size mismatch"));
        }
        if state.data_stack.len() > limits.data_stack_depth
            || state.location_stack.len() > limits.location_stack_depth
            || state.call_stack.len() > limits.call_stack_depth
        {
            return Err(invalid("stack depth exceeds limits"));
        }
        if state.marker > 0xF {
            return Err(invalid("marker wider than 4 bits"));
        }
        if state.energy < 0 || state.energy > limits.max_energy {
            return Err(invalid("energy outside the clamp range"));
        }
        if state.entropy < 0 {
            return Err(invalid("negative entropy"));
        }
        Ok(Organism::from_state(self.state, limits))
    }
}

fn invalid<S: std::fmt::Display>(reason: S) -> Error {
    ErrorKind::ConfigInvalid.other(format!("organism restore: {}", reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordia_types::RegValue;

    fn state() -> OrganismState {
        let limits = OrganismLimits::default();
        OrganismState {
            id: 9,
            parent_id: Some(2),
            birth_tick: 40,
            program_id: "prog".to_string(),
            energy: 50,
            entropy: 1,
            marker: 0xA,
            genome_hash: 0,
            ip: vec![3, 3],
            initial_position: vec![1, 1],
            dv: vec![0, 1],
            data_pointers: vec![vec![0, 0]; limits.data_pointers],
            active_data_pointer: 1,
            data_registers: vec![RegValue::default(); limits.data_registers],
            proc_registers: vec![RegValue::default(); limits.proc_registers],
            formal_param_registers: vec![RegValue::default(); limits.formal_params],
            location_registers: vec![RegValue::default(); limits.location_registers],
            data_stack: vec![RegValue::Int(4)],
            location_stack: vec![vec![2, 2]],
            call_stack: Vec::new(),
            is_dead: false,
            instruction_failed: false,
            failure_reason: None,
            failure_call_stack: None,
            last_execution: None,
            ip_before_fetch: vec![3, 3],
            dv_before_fetch: vec![0, 1],
        }
    }

    #[test]
    fn valid_spec_builds() {
        let org = RestoreSpec::new(state())
            .build(OrganismLimits::default())
            .unwrap();
        assert_eq!(org.id(), 9);
        assert_eq!(org.ip(), &[3, 3]);
        assert_eq!(org.energy(), 50);
        assert_eq!(org.marker(), 0xA);
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let mut bad = state();
        bad.dv = vec![1];
        let err = match RestoreSpec::new(bad).build(OrganismLimits::default()) {
            Err(err) => err,
            Ok(_) => panic!("expected rank mismatch to be rejected"),
        };
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn oversized_stack_is_rejected() {
        let mut bad = state();
        bad.data_stack = vec![RegValue::Int(0); OrganismLimits::default().data_stack_depth + 1];
        assert!(RestoreSpec::new(bad).build(OrganismLimits::default()).is_err());
    }
}
