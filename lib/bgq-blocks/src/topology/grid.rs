// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;

use bgq_config::MachineConfig;
use serde::{Deserialize, Serialize};

use super::{Coord, CoordIter, Extents};

/// What the control system reports about one midplane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidplaneDescription {
    pub location: String,
    /// Nodeboard locations indexed by nodeboard ordinal.
    pub nodeboards: Vec<String>,
}

/// One midplane of the torus and its reservation state.
#[derive(Debug, Clone)]
pub struct MidplaneUnit {
    coord: Coord,
    location: String,
    nodeboards: Vec<String>,
    pub(crate) used: bool,
    pub(crate) removable: bool,
    pub(crate) ionodes_in_use: u64,
}

impl MidplaneUnit {
    fn new(coord: Coord, description: MidplaneDescription) -> Self {
        Self {
            coord,
            location: description.location,
            nodeboards: description.nodeboards,
            used: false,
            removable: false,
            ionodes_in_use: 0,
        }
    }

    pub fn coord(&self) -> Coord {
        self.coord
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn nodeboards(&self) -> &[String] {
        &self.nodeboards
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    /// Bitmap of I/O nodes claimed by small blocks.
    pub fn ionodes_in_use(&self) -> u64 {
        self.ionodes_in_use
    }

    pub fn carries_small_blocks(&self) -> bool {
        self.ionodes_in_use != 0
    }

    /// Eligible as part of a full block.
    pub fn is_available(&self) -> bool {
        !self.used && !self.removable && !self.carries_small_blocks()
    }
}

/// Fixed 4-D grid of midplane units.
///
/// Coordinates the hardware did not describe have no unit.
#[derive(Debug, Clone)]
pub struct TopologyGrid {
    extents: Extents,
    units: Vec<Option<MidplaneUnit>>,
    by_location: HashMap<String, Coord>,
    by_nodeboard: HashMap<String, (Coord, u16)>,
}

impl TopologyGrid {
    /// Build the grid by describing every coordinate inside `extents`.
    pub fn build<E>(
        extents: Extents,
        mut describe: impl FnMut(&Coord) -> Result<Option<MidplaneDescription>, E>,
    ) -> Result<Self, E> {
        let mut grid = Self {
            extents,
            units: Vec::new(),
            by_location: HashMap::new(),
            by_nodeboard: HashMap::new(),
        };

        for coord in CoordIter::new(extents) {
            let unit = describe(&coord)?.map(|desc| MidplaneUnit::new(coord, desc));
            if let Some(unit) = &unit {
                grid.by_location.insert(unit.location.clone(), coord);
                for (ordinal, nb) in unit.nodeboards.iter().enumerate() {
                    grid.by_nodeboard.insert(nb.clone(), (coord, ordinal as u16));
                }
            }
            grid.units.push(unit);
        }

        Ok(grid)
    }

    /// Fully populated grid with generated location names.
    pub fn synthetic(extents: Extents, machine: &MachineConfig) -> Self {
        let result = Self::build(extents, |coord| {
            Ok::<_, Infallible>(Some(synthetic_description(coord, &extents, machine)))
        });
        match result {
            Ok(grid) => grid,
            Err(never) => match never {},
        }
    }

    pub fn extents(&self) -> Extents {
        self.extents
    }

    fn index(&self, coord: &Coord) -> Option<usize> {
        if !coord.within(&self.extents) {
            return None;
        }
        let idx = coord
            .0
            .iter()
            .zip(self.extents.iter())
            .fold(0usize, |acc, (&v, &e)| acc * e as usize + v as usize);
        Some(idx)
    }

    pub fn coord_to_unit(&self, coord: &Coord) -> Option<&MidplaneUnit> {
        self.index(coord).and_then(|i| self.units[i].as_ref())
    }

    pub(crate) fn coord_to_unit_mut(&mut self, coord: &Coord) -> Option<&mut MidplaneUnit> {
        let i = self.index(coord)?;
        self.units[i].as_mut()
    }

    pub fn unit_at_location(&self, location: &str) -> Option<&MidplaneUnit> {
        self.by_location
            .get(location)
            .and_then(|coord| self.coord_to_unit(coord))
    }

    /// Midplane and ordinal of a nodeboard location.
    pub fn nodeboard_at_location(&self, location: &str) -> Option<(Coord, u16)> {
        self.by_nodeboard.get(location).copied()
    }

    /// Mark units removable so the next search skips them.
    ///
    /// With `except` set, every unit *not* listed is marked instead.
    pub fn mark_removable(&mut self, coords: &[Coord], except: bool) {
        let listed: HashSet<Coord> = coords.iter().copied().collect();
        for unit in self.units.iter_mut().flatten() {
            if listed.contains(&unit.coord) != except {
                unit.removable = true;
            }
        }
    }

    pub fn reset_removable_flags(&mut self) {
        for unit in self.units.iter_mut().flatten() {
            unit.removable = false;
        }
    }

    /// Drop every reservation and removable mark.
    pub(crate) fn clear_reservations(&mut self) {
        for unit in self.units.iter_mut().flatten() {
            unit.used = false;
            unit.removable = false;
            unit.ionodes_in_use = 0;
        }
    }

    pub fn coords(&self) -> CoordIter {
        CoordIter::new(self.extents)
    }

    /// Units that exist, in coordinate order.
    pub fn units(&self) -> impl Iterator<Item = &MidplaneUnit> {
        self.units.iter().flatten()
    }

    pub fn midplane_count(&self) -> usize {
        self.units().count()
    }
}

/// Generated location of a midplane: rack from A/B, midplane index from C/D.
pub fn midplane_location(coord: &Coord, extents: &Extents) -> String {
    let [a, b, c, d] = coord.0;
    format!("R{a:X}{b:X}-M{}", c as u32 * extents[3] as u32 + d as u32)
}

pub fn nodeboard_location(midplane: &str, ordinal: u16) -> String {
    format!("{midplane}-N{ordinal:02}")
}

/// Two-digit numeric suffix of a nodeboard location (`R00-M0-N04` -> 4).
pub fn nodeboard_suffix(location: &str) -> Option<u16> {
    let start = location.len().checked_sub(2)?;
    location.get(start..)?.parse().ok()
}

fn synthetic_description(
    coord: &Coord,
    extents: &Extents,
    machine: &MachineConfig,
) -> MidplaneDescription {
    let location = midplane_location(coord, extents);
    let nodeboards = (0..machine.nodecards_per_midplane)
        .map(|i| nodeboard_location(&location, i))
        .collect();
    MidplaneDescription {
        location,
        nodeboards,
    }
}
