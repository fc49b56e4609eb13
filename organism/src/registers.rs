//! Flat register id addressing.
//!
//! Register ids are flat integers: the data bank starts at 0, the other
//! banks sit at fixed offsets. An id resolves to `(bank, slot)`; slots past
//! the configured bank capacity are invalid and trip the failure flag of the
//! accessing organism.

/// Offset between consecutive bank bases.
pub const REGISTER_BANK_STRIDE: u32 = 1000;
/// Base id of the data register bank.
pub const DATA_REG_BASE: u32 = 0;
/// Base id of the procedure register bank.
pub const PROC_REG_BASE: u32 = REGISTER_BANK_STRIDE;
/// Base id of the formal parameter bank.
pub const FORMAL_REG_BASE: u32 = 2 * REGISTER_BANK_STRIDE;
/// Base id of the location register bank.
pub const LOCATION_REG_BASE: u32 = 3 * REGISTER_BANK_STRIDE;

/// The four organism register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterBank {
    /// General data registers
    Data,
    /// Procedure-scoped registers, saved and restored around calls
    Proc,
    /// Formal parameters of the active procedure
    FormalParam,
    /// Location registers holding coordinates
    Location,
}

impl RegisterBank {
    /// Splits a flat register id into bank and slot.
    pub fn resolve(id: u32) -> Option<(RegisterBank, usize)> {
        let bank = match id / REGISTER_BANK_STRIDE {
            0 => RegisterBank::Data,
            1 => RegisterBank::Proc,
            2 => RegisterBank::FormalParam,
            3 => RegisterBank::Location,
            _ => return None,
        };
        Some((bank, (id % REGISTER_BANK_STRIDE) as usize))
    }

    /// The flat id of `slot` in this bank.
    pub fn flat_id(self, slot: usize) -> u32 {
        let base = match self {
            RegisterBank::Data => DATA_REG_BASE,
            RegisterBank::Proc => PROC_REG_BASE,
            RegisterBank::FormalParam => FORMAL_REG_BASE,
            RegisterBank::Location => LOCATION_REG_BASE,
        };
        base + slot as u32
    }
}
