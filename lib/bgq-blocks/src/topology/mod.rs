// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Torus coordinates and the midplane grid.

mod grid;

pub use grid::{
    midplane_location, nodeboard_location, nodeboard_suffix, MidplaneDescription, MidplaneUnit,
    TopologyGrid,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of torus dimensions (A, B, C, D).
pub const SYSTEM_DIMENSIONS: usize = 4;

/// Per-dimension extent of the machine, in midplanes.
pub type Extents = [u16; SYSTEM_DIMENSIONS];

/// Per-dimension size of a block, in midplanes.
pub type Geometry = [u16; SYSTEM_DIMENSIONS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    A,
    B,
    C,
    D,
}

impl Dimension {
    pub const ALL: [Dimension; SYSTEM_DIMENSIONS] =
        [Dimension::A, Dimension::B, Dimension::C, Dimension::D];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Wiring of a block along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Mesh,
    #[default]
    Torus,
}

/// Midplane coordinate. Ordered lexicographically, A first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Coord(pub [u16; SYSTEM_DIMENSIONS]);

impl Coord {
    pub const fn new(a: u16, b: u16, c: u16, d: u16) -> Self {
        Self([a, b, c, d])
    }

    pub fn get(&self, dim: Dimension) -> u16 {
        self.0[dim.index()]
    }

    /// Whether the coordinate lies inside `extents`.
    pub fn within(&self, extents: &Extents) -> bool {
        self.0.iter().zip(extents.iter()).all(|(v, e)| v < e)
    }

    /// Parse the base-36 rendering produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u16; SYSTEM_DIMENSIONS];
        let mut chars = s.chars();
        for slot in out.iter_mut() {
            *slot = chars.next()?.to_digit(36)? as u16;
        }
        if chars.next().is_some() {
            return None;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for v in self.0 {
            let c = char::from_digit(v as u32, 36)
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or('?');
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Lazy walk over every coordinate inside `extents`, in lexicographic order.
///
/// The iterator is restartable through [`CoordIter::restart`].
#[derive(Debug, Clone)]
pub struct CoordIter {
    extents: Extents,
    next: Option<Coord>,
}

impl CoordIter {
    pub fn new(extents: Extents) -> Self {
        let next = extents.iter().all(|&e| e > 0).then(Coord::default);
        Self { extents, next }
    }

    pub fn restart(&mut self) {
        *self = Self::new(self.extents);
    }
}

impl Iterator for CoordIter {
    type Item = Coord;

    fn next(&mut self) -> Option<Coord> {
        let current = self.next?;
        let mut advanced = current;
        self.next = None;
        for dim in (0..SYSTEM_DIMENSIONS).rev() {
            advanced.0[dim] += 1;
            if advanced.0[dim] < self.extents[dim] {
                self.next = Some(advanced);
                break;
            }
            advanced.0[dim] = 0;
        }
        Some(current)
    }
}
