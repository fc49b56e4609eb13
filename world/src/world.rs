use primordia_types::{ChangeTracker, ChangedCell, Molecule, OwnerId, Shape};
use std::collections::{BTreeSet, HashMap};

/// Callback invoked whenever a molecule is written, so an external label
/// index can stay current. Opaque to the grid.
pub trait LabelIndexHook: Send {
    /// A molecule at `index` changed from `old` to `new`.
    fn molecule_written(&mut self, index: u32, old: Molecule, new: Molecule);
}

/// The grid environment.
///
/// Two parallel dense arrays (`grid` for packed molecules, `owner_grid` for
/// owner ids) addressed by precomputed row-major strides, with sparse
/// occupancy, per-owner and change indices maintained on every mutation.
pub struct World {
    shape: Shape,
    grid: Vec<u32>,
    owner_grid: Vec<u32>,
    occupied: BTreeSet<u32>,
    cells_by_owner: HashMap<OwnerId, BTreeSet<u32>>,
    changed: ChangeTracker,
    label_hook: Option<Box<dyn LabelIndexHook>>,
}

impl World {
    /// Creates an empty world of the given shape.
    pub fn new(shape: Shape) -> World {
        let volume = shape.volume();
        World {
            shape,
            grid: vec![0; volume],
            owner_grid: vec![0; volume],
            occupied: BTreeSet::new(),
            cells_by_owner: HashMap::new(),
            changed: ChangeTracker::new(volume),
            label_hook: None,
        }
    }

    /// Installs the label index hook.
    pub fn set_label_hook(&mut self, hook: Box<dyn LabelIndexHook>) {
        self.label_hook = Some(hook);
    }

    /// The world shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Total cell count.
    pub fn total_cells(&self) -> u32 {
        self.shape.volume() as u32
    }

    /// Reads the molecule at `coord`; out-of-bounds reads yield the empty
    /// cell in a bounded world.
    pub fn molecule(&self, coord: &[i32]) -> Molecule {
        match self.shape.flatten(coord) {
            Some(i) => Molecule::from_raw(self.grid[i]),
            None => Molecule::EMPTY,
        }
    }

    /// Reads the owner at `coord`; out-of-bounds reads yield 0.
    pub fn owner(&self, coord: &[i32]) -> OwnerId {
        match self.shape.flatten(coord) {
            Some(i) => self.owner_grid[i],
            None => 0,
        }
    }

    /// Reads the molecule at a flat index.
    pub fn molecule_at(&self, index: u32) -> Molecule {
        Molecule::from_raw(self.grid[index as usize])
    }

    /// Reads the owner at a flat index.
    pub fn owner_at(&self, index: u32) -> OwnerId {
        self.owner_grid[index as usize]
    }

    /// Writes both planes of the cell at `coord`.
    ///
    /// Returns false when the coordinate falls outside a bounded world; no
    /// state changes in that case.
    pub fn set_molecule(&mut self, molecule: Molecule, owner: OwnerId, coord: &[i32]) -> bool {
        match self.shape.flatten(coord) {
            Some(i) => {
                self.write_cell(i as u32, molecule, owner);
                true
            }
            None => false,
        }
    }

    /// Writes only the owner plane of the cell at `coord`; the change is
    /// still tracked.
    pub fn set_owner(&mut self, owner: OwnerId, coord: &[i32]) -> bool {
        match self.shape.flatten(coord) {
            Some(i) => {
                let molecule = Molecule::from_raw(self.grid[i]);
                self.write_cell(i as u32, molecule, owner);
                true
            }
            None => false,
        }
    }

    fn write_cell(&mut self, index: u32, molecule: Molecule, owner: OwnerId) {
        let i = index as usize;
        let old_molecule = Molecule::from_raw(self.grid[i]);
        let old_owner = self.owner_grid[i];
        if old_molecule == molecule && old_owner == owner {
            return;
        }

        self.grid[i] = molecule.raw();
        self.owner_grid[i] = owner;

        if old_owner != owner {
            if old_owner != 0 {
                self.detach_from_owner(old_owner, index);
            }
            if owner != 0 {
                self.cells_by_owner.entry(owner).or_default().insert(index);
            }
        }

        if molecule.is_empty() && owner == 0 {
            self.occupied.remove(&index);
        } else {
            self.occupied.insert(index);
        }

        self.changed.mark(index);

        if old_molecule != molecule {
            if let Some(hook) = self.label_hook.as_mut() {
                hook.molecule_written(index, old_molecule, molecule);
            }
        }
    }

    fn detach_from_owner(&mut self, owner: OwnerId, index: u32) {
        if let Some(set) = self.cells_by_owner.get_mut(&owner) {
            set.remove(&index);
            if set.is_empty() {
                self.cells_by_owner.remove(&owner);
            }
        }
    }

    /// Reassigns every cell of `from` whose marker equals `marker_match` to
    /// `to`, clearing the marker bits. Returns the number of cells moved.
    pub fn transfer_ownership(&mut self, from: OwnerId, to: OwnerId, marker_match: u8) -> usize {
        let candidates: Vec<u32> = match self.cells_by_owner.get(&from) {
            Some(set) => set
                .iter()
                .copied()
                .filter(|&i| Molecule::from_raw(self.grid[i as usize]).marker() == marker_match)
                .collect(),
            None => return 0,
        };
        for &index in &candidates {
            let molecule = Molecule::from_raw(self.grid[index as usize]).without_marker();
            self.write_cell(index, molecule, to);
        }
        candidates.len()
    }

    /// Orphans every cell of `owner` whose marker equals `marker_match`.
    pub fn clear_markers_for(&mut self, owner: OwnerId, marker_match: u8) -> usize {
        self.transfer_ownership(owner, 0, marker_match)
    }

    /// Releases every cell owned by `owner`: owner goes to 0 and marker bits
    /// are cleared. Invoked when an organism dies.
    pub fn clear_ownership_for(&mut self, owner: OwnerId) {
        let indices: Vec<u32> = match self.cells_by_owner.get(&owner) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };
        for index in indices {
            let molecule = Molecule::from_raw(self.grid[index as usize]).without_marker();
            self.write_cell(index, molecule, 0);
        }
    }

    /// Whether no cell inside the cube of side `2 * radius + 1` centred at
    /// `center` has an owner. Out-of-bounds cells count as unowned.
    pub fn is_area_unowned(&self, center: &[i32], radius: i32) -> bool {
        debug_assert!(radius >= 0);
        let rank = self.shape.rank();
        let mut offset = vec![-radius; rank];
        let mut probe = vec![0i32; rank];
        loop {
            for (i, (c, o)) in center.iter().zip(&offset).enumerate() {
                probe[i] = c + o;
            }
            if self.owner(&probe) != 0 {
                return false;
            }
            // odometer step over the cube
            let mut axis = rank;
            loop {
                if axis == 0 {
                    return true;
                }
                axis -= 1;
                offset[axis] += 1;
                if offset[axis] <= radius {
                    break;
                }
                offset[axis] = -radius;
            }
        }
    }

    /// Iterates the occupied flat indices in ascending order.
    pub fn for_each_occupied_index<F: FnMut(u32)>(&self, mut consumer: F) {
        for &i in &self.occupied {
            consumer(i);
        }
    }

    /// Number of occupied cells.
    pub fn occupied_len(&self) -> usize {
        self.occupied.len()
    }

    /// Flat indices owned by `owner`, ascending.
    pub fn cells_of(&self, owner: OwnerId) -> Vec<u32> {
        self.cells_by_owner
            .get(&owner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Collects every occupied cell, sorted by flat index, into `buf`.
    pub fn occupied_cells_into(&self, buf: &mut Vec<ChangedCell>) {
        buf.clear();
        buf.reserve(self.occupied.len());
        for &index in &self.occupied {
            buf.push(ChangedCell {
                index,
                molecule: self.grid[index as usize],
                owner: self.owner_grid[index as usize],
            });
        }
    }

    /// The dirty flat indices since the last reset, ascending; the tracker
    /// is left untouched.
    pub fn changed_indices(&self) -> Vec<u32> {
        self.changed.sorted_indices()
    }

    /// Clears change tracking without reading it.
    pub fn reset_change_tracking(&mut self) {
        self.changed.drain_sorted();
    }

    /// Moves the tracked changes into `buf` as sorted cells and resets the
    /// tracker. Cleared cells appear with molecule 0 and owner 0.
    pub fn drain_changed_cells_into(&mut self, buf: &mut Vec<ChangedCell>) {
        buf.clear();
        let indices = self.changed.drain_sorted();
        buf.reserve(indices.len());
        for index in indices {
            buf.push(ChangedCell {
                index,
                molecule: self.grid[index as usize],
                owner: self.owner_grid[index as usize],
            });
        }
    }

    /// Number of cells dirty since the last reset.
    pub fn changed_len(&self) -> usize {
        self.changed.len()
    }

    /// Applies a wire cell record directly, used by replay.
    pub fn apply_cell(&mut self, cell: &ChangedCell) {
        self.write_cell(cell.index, Molecule::from_raw(cell.molecule), cell.owner);
    }
}
