//! Serialized organism and plugin state records.

use serde::{Deserialize, Serialize};

/// A value held in a register or on the data stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegValue {
    /// Scalar
    Int(i64),
    /// Coordinate vector
    Vector(Vec<i32>),
}

impl Default for RegValue {
    fn default() -> Self {
        RegValue::Int(0)
    }
}

/// One frame of the organism call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcFrame {
    /// Name of the called procedure
    pub proc_name: String,
    /// Instruction pointer to restore on return
    pub absolute_return_ip: Vec<i32>,
    /// Instruction pointer of the call site
    pub absolute_call_ip: Vec<i32>,
    /// Procedure register bank snapshot taken at call time
    pub saved_proc_registers: Vec<RegValue>,
    /// Formal parameter bank snapshot taken at call time
    pub saved_formal_params: Vec<RegValue>,
    /// Formal parameter slot to caller register id bindings
    pub formal_param_bindings: Vec<(u32, u32)>,
}

/// What the last executed instruction did, for failure forensics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExecution {
    /// Opcode identifier
    pub opcode_id: u32,
    /// Raw argument molecules as fetched
    pub raw_arguments: Vec<i32>,
    /// Energy charged for the execution
    pub energy_cost: i64,
    /// Entropy produced (or consumed) by the execution
    pub entropy_delta: i64,
    /// Register values observed before execution, by flat register id
    pub pre_registers: Vec<(u32, RegValue)>,
}

/// Full serialized organism VM state for one sampled tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganismState {
    /// Organism id, also the owner id of its cells
    pub id: u32,
    /// Parent organism, if born rather than seeded
    pub parent_id: Option<u32>,
    /// Tick the organism appeared
    pub birth_tick: u64,
    /// Program artifact the organism was compiled from
    pub program_id: String,
    /// Energy register, clamped to `[0, max_energy]`
    pub energy: i64,
    /// Entropy register, clamped non-negative
    pub entropy: i64,
    /// 4-bit marker register
    pub marker: u8,
    /// Genome digest, see the organism crate
    pub genome_hash: i64,
    /// Instruction pointer
    pub ip: Vec<i32>,
    /// Position the organism was created at
    pub initial_position: Vec<i32>,
    /// Direction vector
    pub dv: Vec<i32>,
    /// Data pointers
    pub data_pointers: Vec<Vec<i32>>,
    /// Index of the active data pointer
    pub active_data_pointer: u32,
    /// Data register bank
    pub data_registers: Vec<RegValue>,
    /// Procedure register bank
    pub proc_registers: Vec<RegValue>,
    /// Formal parameter register bank
    pub formal_param_registers: Vec<RegValue>,
    /// Location register bank
    pub location_registers: Vec<RegValue>,
    /// Data stack, bottom first
    pub data_stack: Vec<RegValue>,
    /// Location stack, bottom first
    pub location_stack: Vec<Vec<i32>>,
    /// Call stack, outermost frame first
    pub call_stack: Vec<ProcFrame>,
    /// Whether the organism has died
    pub is_dead: bool,
    /// Whether the instruction of this tick failed
    pub instruction_failed: bool,
    /// Failure reason when `instruction_failed`
    pub failure_reason: Option<String>,
    /// Procedure names on the call stack when the failure happened
    pub failure_call_stack: Option<Vec<String>>,
    /// Execution record of the last instruction
    pub last_execution: Option<LastExecution>,
    /// Instruction pointer before this tick's fetch
    pub ip_before_fetch: Vec<i32>,
    /// Direction vector before this tick's fetch
    pub dv_before_fetch: Vec<i32>,
}

/// Opaque plugin state captured once per sampled tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginState {
    /// Registered plugin name
    pub plugin_class: String,
    /// Plugin-owned state bytes, the core is only a courier
    pub state_blob: Vec<u8>,
}
