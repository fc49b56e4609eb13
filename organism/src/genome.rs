//! Genome digest.
//!
//! The genome of an organism is the multiset of non-DATA molecules it owns,
//! keyed by position relative to where it was born. The digest is invariant
//! under whole-genome translation (on a torus) and under uniform relabelling
//! of LABEL/LABELREF values, which is what the anchor normalisation buys.

use primordia_types::{lex_cmp, Molecule, MoleculeType, OwnerId};
use primordia_world::World;
use sha2::{Digest, Sha256};

/// Computes the 64-bit genome digest of `owner`'s cells.
///
/// Entries are relative positions against `initial_position`; on a torus
/// each component is wrapped to the shortest signed distance with the even
/// half-way point canonicalised positive. Among the LABEL entries the one
/// with the lexicographically smallest position anchors the normalisation:
/// its value bits are XOR-ed into every LABEL and LABELREF value. Entries
/// are then sorted and fed to SHA-256 as big-endian words; the first eight
/// digest bytes, big-endian signed, are the hash. An empty genome hashes
/// to 0.
pub fn genome_hash(world: &World, owner: OwnerId, initial_position: &[i32]) -> i64 {
    let shape = world.shape();
    let mut entries: Vec<(Vec<i32>, Molecule)> = Vec::new();
    for index in world.cells_of(owner) {
        let molecule = world.molecule_at(index);
        if molecule.mol_type() == MoleculeType::Data {
            continue;
        }
        let coord = shape.unflatten(index as usize);
        let delta: Vec<i32> = coord
            .iter()
            .zip(initial_position)
            .map(|(c, o)| c - o)
            .collect();
        entries.push((shape.wrap_delta(&delta), molecule));
    }
    if entries.is_empty() {
        return 0;
    }

    let anchor_mask = entries
        .iter()
        .filter(|(_, m)| m.mol_type() == MoleculeType::Label)
        .min_by(|a, b| lex_cmp(&a.0, &b.0))
        .map(|(_, m)| m.value_bits());
    if let Some(mask) = anchor_mask {
        for (_, molecule) in entries.iter_mut() {
            match molecule.mol_type() {
                MoleculeType::Label | MoleculeType::LabelRef => {
                    *molecule = molecule.xor_value_bits(mask);
                }
                _ => {}
            }
        }
    }

    entries.sort_by(|a, b| lex_cmp(&a.0, &b.0).then(a.1.raw().cmp(&b.1.raw())));

    let mut hasher = Sha256::new();
    for (rel, molecule) in &entries {
        for &component in rel {
            hasher.update(i64::from(component).to_be_bytes());
        }
        hasher.update(u64::from(molecule.raw()).to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(word)
}
