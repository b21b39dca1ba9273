// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Full-block search over the torus.

use std::collections::BTreeSet;

use crate::block::BlockShape;
use crate::topology::{
    Connectivity, Coord, CoordIter, Extents, Geometry, TopologyGrid, SYSTEM_DIMENSIONS,
};

/// Every geometry with `count` midplanes that fits `extents`, smallest
/// bounding geometry first (max extent, then sum, then lexicographic).
pub(super) fn candidate_geometries(count: usize, extents: &Extents) -> Vec<Geometry> {
    let mut out: Vec<Geometry> = CoordIter::new(*extents)
        .map(|c| c.0.map(|v| v + 1))
        .filter(|g| g.iter().map(|&v| v as usize).product::<usize>() == count)
        .collect();
    out.sort_by_key(|g| {
        let max = g.iter().copied().max().unwrap_or(0);
        let sum: u32 = g.iter().map(|&v| v as u32).sum();
        (max, sum, *g)
    });
    out
}

/// First placement of any geometry, in order, at `start` or at every
/// coordinate when no start is requested.
pub(super) fn find_placement(
    grid: &TopologyGrid,
    geometries: &[Geometry],
    start: Option<Coord>,
    connectivity: &[Connectivity; SYSTEM_DIMENSIONS],
) -> Option<BlockShape> {
    for geometry in geometries {
        let starts: Box<dyn Iterator<Item = Coord>> = match start {
            Some(s) => Box::new(std::iter::once(s)),
            None => Box::new(grid.coords()),
        };
        for s in starts {
            if let Some(shape) = try_box(grid, s, geometry, connectivity) {
                return Some(shape);
            }
        }
    }
    None
}

fn try_box(
    grid: &TopologyGrid,
    start: Coord,
    geometry: &Geometry,
    connectivity: &[Connectivity; SYSTEM_DIMENSIONS],
) -> Option<BlockShape> {
    let extents = grid.extents();
    if !start.within(&extents)
        || geometry
            .iter()
            .zip(extents.iter())
            .any(|(&g, &e)| g == 0 || g > e)
    {
        return None;
    }

    let mut midplanes = Vec::new();
    let mut offsets = [0u16; SYSTEM_DIMENSIONS];
    if !walk(grid, &start, geometry, &extents, 0, &mut offsets, &mut midplanes) {
        return None;
    }
    let passthrough = passthrough(grid, &start, geometry, connectivity, &extents, &midplanes)?;

    midplanes.sort();
    Some(BlockShape::Full {
        midplanes,
        passthrough,
        start,
        geometry: *geometry,
        connectivity: *connectivity,
    })
}

/// Visit the box dimension by dimension, bailing out at the first
/// unavailable unit.
fn walk(
    grid: &TopologyGrid,
    start: &Coord,
    geometry: &Geometry,
    extents: &Extents,
    dim: usize,
    offsets: &mut [u16; SYSTEM_DIMENSIONS],
    out: &mut Vec<Coord>,
) -> bool {
    if dim == SYSTEM_DIMENSIONS {
        let coord = wrap(start, offsets, extents);
        return match grid.coord_to_unit(&coord) {
            Some(unit) if unit.is_available() => {
                out.push(coord);
                true
            }
            _ => false,
        };
    }
    for off in 0..geometry[dim] {
        offsets[dim] = off;
        if !walk(grid, start, geometry, extents, dim + 1, offsets, out) {
            return false;
        }
    }
    true
}

fn wrap(start: &Coord, offsets: &[u16; SYSTEM_DIMENSIONS], extents: &Extents) -> Coord {
    let mut c = [0u16; SYSTEM_DIMENSIONS];
    for dim in 0..SYSTEM_DIMENSIONS {
        c[dim] = (start.0[dim] + offsets[dim]) % extents[dim];
    }
    Coord(c)
}

/// Midplanes that close each partial torus ring. All must be available.
fn passthrough(
    grid: &TopologyGrid,
    start: &Coord,
    geometry: &Geometry,
    connectivity: &[Connectivity; SYSTEM_DIMENSIONS],
    extents: &Extents,
    midplanes: &[Coord],
) -> Option<Vec<Coord>> {
    let mut out = BTreeSet::new();
    for dim in 0..SYSTEM_DIMENSIONS {
        let (g, e) = (geometry[dim], extents[dim]);
        if connectivity[dim] != Connectivity::Torus || g <= 1 || g >= e {
            continue;
        }
        // one slice of the box, pushed around the rest of the ring
        for slice in midplanes.iter().filter(|c| c.0[dim] == start.0[dim]) {
            for r in g..e {
                let mut coord = *slice;
                coord.0[dim] = (start.0[dim] + r) % e;
                match grid.coord_to_unit(&coord) {
                    Some(unit) if unit.is_available() => {
                        out.insert(coord);
                    }
                    _ => return None,
                }
            }
        }
    }
    Some(out.into_iter().collect())
}

/// Start and geometry of the smallest wrap-aware box around `coords`.
pub(super) fn bounding_box(coords: &BTreeSet<Coord>, extents: &Extents) -> (Coord, Geometry) {
    let mut start = [0u16; SYSTEM_DIMENSIONS];
    let mut geometry = [1u16; SYSTEM_DIMENSIONS];
    for dim in 0..SYSTEM_DIMENSIONS {
        let values: Vec<u16> = coords
            .iter()
            .map(|c| c.0[dim])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
            continue;
        };
        let extent = extents[dim];

        // the largest empty arc of the ring lies outside the box; the
        // arc across the wrap point wins ties
        let mut gap = (first + extent) - last - 1;
        let mut begin = first;
        for pair in values.windows(2) {
            let inner = pair[1] - pair[0] - 1;
            if inner > gap {
                gap = inner;
                begin = pair[1];
            }
        }
        start[dim] = begin;
        geometry[dim] = extent - gap;
    }
    (Coord(start), geometry)
}
