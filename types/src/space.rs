//! Grid space math: shapes, strides and topology.

use primordia_error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Largest supported cell count, flat indices must fit in a signed 32-bit.
pub const MAX_VOLUME: u64 = i32::MAX as u64;

/// World edge behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    /// Reads past the edge yield the empty cell
    #[serde(alias = "BOUNDED")]
    Bounded,
    /// Coordinates wrap modulo the shape on every axis
    #[serde(alias = "TORUS")]
    Torus,
}

/// An n-dimensional dense grid shape with precomputed row-major strides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<i32>,
    strides: Vec<usize>,
    volume: usize,
    topology: Topology,
}

impl Shape {
    /// Builds a shape, validating dimensions and the total cell count.
    pub fn new(dims: Vec<i32>, topology: Topology) -> Result<Shape, Error> {
        if dims.is_empty() {
            return Err(ErrorKind::ConfigInvalid.other("environment shape is empty"));
        }
        if let Some(d) = dims.iter().find(|d| **d < 1) {
            return Err(ErrorKind::ConfigInvalid.other(format!("non-positive dimension {}", d)));
        }
        let mut volume: u64 = 1;
        for d in &dims {
            volume = volume.saturating_mul(*d as u64);
            if volume > MAX_VOLUME {
                return Err(ErrorKind::ConfigInvalid
                    .other(format!("world of shape {:?} exceeds {} cells", dims, MAX_VOLUME)));
            }
        }
        let mut strides = vec![1usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1] as usize;
        }
        Ok(Shape {
            dims,
            strides,
            volume: volume as usize,
            topology,
        })
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Per-axis sizes.
    pub fn dims(&self) -> &[i32] {
        &self.dims
    }

    /// Total cell count.
    pub fn volume(&self) -> usize {
        self.volume
    }

    /// The edge behaviour.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Normalises a coordinate to a flat index.
    ///
    /// On a torus every coordinate resolves; in a bounded world an
    /// out-of-range coordinate returns `None`.
    pub fn flatten(&self, coord: &[i32]) -> Option<usize> {
        debug_assert_eq!(coord.len(), self.dims.len());
        let mut index = 0usize;
        for (i, &c) in coord.iter().enumerate() {
            let s = self.dims[i];
            let c = match self.topology {
                Topology::Torus => c.rem_euclid(s),
                Topology::Bounded => {
                    if c < 0 || c >= s {
                        return None;
                    }
                    c
                }
            };
            index += c as usize * self.strides[i];
        }
        Some(index)
    }

    /// Expands a flat index back into a coordinate.
    pub fn unflatten(&self, index: usize) -> Vec<i32> {
        debug_assert!(index < self.volume);
        let mut rest = index;
        let mut coord = Vec::with_capacity(self.dims.len());
        for stride in &self.strides {
            coord.push((rest / stride) as i32);
            rest %= stride;
        }
        coord
    }

    /// Reduces a displacement to the shortest signed distance per axis.
    ///
    /// Only meaningful on a torus: each component lands in `(-s/2, s/2]`,
    /// with the ambiguous half-way point of even axes canonicalised to the
    /// positive side. Bounded worlds return the displacement unchanged.
    pub fn wrap_delta(&self, delta: &[i32]) -> Vec<i32> {
        match self.topology {
            Topology::Bounded => delta.to_vec(),
            Topology::Torus => delta
                .iter()
                .zip(&self.dims)
                .map(|(&d, &s)| {
                    let mut d = d.rem_euclid(s);
                    if i64::from(d) * 2 > i64::from(s) {
                        d -= s;
                    }
                    d
                })
                .collect(),
        }
    }
}

/// Lexicographic comparison of coordinates of equal rank.
pub fn lex_cmp(a: &[i32], b: &[i32]) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
