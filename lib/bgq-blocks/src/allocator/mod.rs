// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block placement on the midplane grid.
//!
//! The allocator owns the grid lock. It never calls the control system and
//! never takes the block-set lock.

mod search;
mod small;

use std::collections::BTreeSet;
use std::fmt;

use bgq_config::{LayoutMode, MachineConfig};
use derive_builder::Builder;
use parking_lot::Mutex;

use crate::block::{Block, BlockId, BlockShape, IonodeRange};
use crate::error::{BlockError, Result};
use crate::facade::{BlockCreateSpec, HardwareBlock};
use crate::topology::{
    nodeboard_suffix, Connectivity, Coord, Extents, Geometry, TopologyGrid, SYSTEM_DIMENSIONS,
};

/// What a caller asks the allocator for.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct PlacementRequest {
    #[builder(default, setter(into, strip_option))]
    pub block_id: Option<BlockId>,

    /// Compute nodes wanted. Ignored for full blocks when `geometry` is set.
    #[builder(default)]
    pub node_count: u32,

    /// Explicit size per dimension, in midplanes.
    #[builder(default, setter(strip_option))]
    pub geometry: Option<Geometry>,

    #[builder(default, setter(strip_option))]
    pub start: Option<Coord>,

    #[builder(default)]
    pub connectivity: [Connectivity; SYSTEM_DIMENSIONS],

    /// Carve the block out of a single midplane.
    #[builder(default)]
    pub small: bool,

    #[builder(default, setter(into, strip_option))]
    pub boot_image: Option<String>,
}

impl fmt::Display for PlacementRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.geometry {
            Some(g) => write!(f, "geometry {}x{}x{}x{}", g[0], g[1], g[2], g[3])?,
            None => write!(f, "{} cnodes", self.node_count)?,
        }
        if self.small {
            write!(f, " (small)")?;
        }
        if let Some(start) = self.start {
            write!(f, " at {start}")?;
        }
        Ok(())
    }
}

/// Reservation that is released on drop unless committed.
pub struct PendingReservation<'a> {
    allocator: &'a BlockAllocator,
    shape: BlockShape,
    committed: bool,
}

impl<'a> PendingReservation<'a> {
    fn new(allocator: &'a BlockAllocator, shape: BlockShape) -> Self {
        Self {
            allocator,
            shape,
            committed: false,
        }
    }

    pub fn shape(&self) -> &BlockShape {
        &self.shape
    }

    /// Keep the reservation.
    pub fn commit(mut self) -> BlockShape {
        self.committed = true;
        self.shape.clone()
    }
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(midplanes = ?self.shape.midplanes(), "rolling back reservation");
            self.allocator.release(&self.shape);
        }
    }
}

impl fmt::Debug for PendingReservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReservation")
            .field("shape", &self.shape)
            .field("committed", &self.committed)
            .finish()
    }
}

pub struct BlockAllocator {
    grid: Mutex<TopologyGrid>,
    machine: MachineConfig,
    allow_overlap: bool,
}

impl BlockAllocator {
    pub fn new(grid: TopologyGrid, machine: MachineConfig, layout: LayoutMode) -> Self {
        Self {
            grid: Mutex::new(grid),
            machine,
            allow_overlap: layout == LayoutMode::Overlap,
        }
    }

    pub fn extents(&self) -> Extents {
        self.grid.lock().extents()
    }

    pub fn machine(&self) -> &MachineConfig {
        &self.machine
    }

    pub fn allows_overlap(&self) -> bool {
        self.allow_overlap
    }

    /// Copy of the grid, flags included.
    pub fn snapshot(&self) -> TopologyGrid {
        self.grid.lock().clone()
    }

    /// Find and reserve a placement for `request`.
    pub fn allocate(&self, request: &PlacementRequest) -> Result<PendingReservation<'_>> {
        let mut grid = self.grid.lock();
        let shape = if request.small {
            small::place(&grid, request, &self.machine)?
        } else {
            self.place_full(&grid, request)?
        };
        apply(&mut grid, &shape, false, &self.machine).map_err(|detail| {
            BlockError::InvalidRequest(format!("placement for {request} not reservable: {detail}"))
        })?;
        drop(grid);

        tracing::debug!(%request, midplanes = ?shape.midplanes(), "placement found");
        Ok(PendingReservation::new(self, shape))
    }

    /// Reserve an explicitly given shape.
    pub fn reserve(&self, id: &BlockId, shape: &BlockShape) -> Result<PendingReservation<'_>> {
        let mut grid = self.grid.lock();
        apply(&mut grid, shape, self.allow_overlap, &self.machine).map_err(|detail| {
            BlockError::PlacementExhausted {
                request: format!("block {id}: {detail}"),
            }
        })?;
        drop(grid);
        Ok(PendingReservation::new(self, shape.clone()))
    }

    /// Re-mark the reservation of a persisted block.
    pub fn restore(&self, block: &Block) -> Result<()> {
        let mut grid = self.grid.lock();
        apply(&mut grid, block.shape(), self.allow_overlap, &self.machine)
            .map_err(|detail| BlockError::inconsistency(block.id(), detail))
    }

    pub fn release(&self, shape: &BlockShape) {
        let mut grid = self.grid.lock();
        match shape {
            BlockShape::Full {
                midplanes,
                passthrough,
                ..
            } => {
                for coord in midplanes.iter().chain(passthrough.iter()) {
                    if let Some(unit) = grid.coord_to_unit_mut(coord) {
                        unit.used = false;
                    }
                }
            }
            BlockShape::Small {
                midplane, ionodes, ..
            } => {
                if let Some(unit) = grid.coord_to_unit_mut(midplane) {
                    unit.ionodes_in_use &= !ionodes.mask();
                }
            }
        }
    }

    /// Drop every reservation and re-apply `shapes`.
    ///
    /// Used in overlap layout, where one midplane may back several blocks.
    pub fn rebuild<'s>(&self, shapes: impl IntoIterator<Item = &'s BlockShape>) {
        let mut grid = self.grid.lock();
        grid.clear_reservations();
        for shape in shapes {
            if let Err(detail) = apply(&mut grid, shape, true, &self.machine) {
                tracing::warn!(midplanes = ?shape.midplanes(), "cannot re-apply reservation: {detail}");
            }
        }
    }

    /// Map a hardware block back onto the grid and reserve it.
    ///
    /// Full blocks are re-placed with the search restricted to the reported
    /// midplanes; the result must reproduce the hardware's midplane set.
    pub fn adopt(&self, hw: &HardwareBlock) -> Result<BlockShape> {
        let id = BlockId::from(hw.name.as_str());
        let mut grid = self.grid.lock();
        let shape = if hw.small {
            self.adopt_small(&grid, &id, hw)?
        } else {
            adopt_full(&grid, &id, hw)?
        };
        apply(&mut grid, &shape, self.allow_overlap, &self.machine)
            .map_err(|detail| BlockError::inconsistency(&id, detail))?;
        tracing::info!(block_id = %id, midplanes = ?shape.midplanes(), "adopted block");
        Ok(shape)
    }

    fn adopt_small(&self, grid: &TopologyGrid, id: &BlockId, hw: &HardwareBlock) -> Result<BlockShape> {
        let first = hw
            .nodeboards
            .first()
            .ok_or_else(|| BlockError::inconsistency(id, "small block without nodeboards"))?;
        let (midplane, _) = grid
            .nodeboard_at_location(first)
            .ok_or_else(|| BlockError::inconsistency(id, format!("unknown nodeboard {first}")))?;
        let suffix = nodeboard_suffix(first).ok_or_else(|| {
            BlockError::inconsistency(id, format!("nodeboard {first} has no numeric suffix"))
        })?;

        let ionodes = IonodeRange::from_nodeboards(suffix, hw.nodeboards.len() as u16, &self.machine);
        if !ionodes.fits(self.machine.ionodes_per_midplane) {
            return Err(BlockError::inconsistency(
                id,
                format!("I/O nodes {ionodes} exceed the midplane"),
            ));
        }
        tracing::debug!(block_id = %id, %ionodes, "small block uses ionodes");
        Ok(BlockShape::Small {
            midplane,
            nodeboards: hw.nodeboards.clone(),
            ionodes,
        })
    }

    /// Control-system description of a shape.
    pub fn create_spec(&self, id: &BlockId, shape: &BlockShape) -> Result<BlockCreateSpec> {
        let grid = self.grid.lock();
        let locate = |coords: &[Coord]| -> Result<Vec<String>> {
            coords
                .iter()
                .map(|c| {
                    grid.coord_to_unit(c)
                        .map(|u| u.location().to_string())
                        .ok_or_else(|| BlockError::inconsistency(id, format!("no midplane at {c}")))
                })
                .collect()
        };
        Ok(match shape {
            BlockShape::Full {
                midplanes,
                passthrough,
                connectivity,
                ..
            } => BlockCreateSpec::Full {
                midplanes: locate(midplanes)?,
                passthrough: locate(passthrough)?,
                connectivity: *connectivity,
            },
            BlockShape::Small { nodeboards, .. } => BlockCreateSpec::Small {
                nodeboards: nodeboards.clone(),
            },
        })
    }

    fn place_full(&self, grid: &TopologyGrid, request: &PlacementRequest) -> Result<BlockShape> {
        let extents = grid.extents();
        let geometries = match request.geometry {
            Some(g) => {
                if g.iter().zip(extents.iter()).any(|(&g, &e)| g == 0 || g > e) {
                    return Err(BlockError::InvalidRequest(format!(
                        "geometry {g:?} does not fit a machine of {extents:?}"
                    )));
                }
                vec![g]
            }
            None => {
                if request.node_count == 0 {
                    return Err(BlockError::InvalidRequest(
                        "node count must be positive".to_string(),
                    ));
                }
                let wanted = request
                    .node_count
                    .div_ceil(self.machine.cnodes_per_midplane()) as usize;
                rounded_geometries(wanted, &extents)
            }
        };

        search::find_placement(grid, &geometries, request.start, &request.connectivity).ok_or_else(
            || BlockError::PlacementExhausted {
                request: request.to_string(),
            },
        )
    }
}

/// Geometries for the smallest midplane count at or above `wanted` that
/// forms a box on this machine.
fn rounded_geometries(wanted: usize, extents: &Extents) -> Vec<Geometry> {
    let capacity: usize = extents.iter().map(|&e| e as usize).product();
    (wanted..=capacity)
        .map(|count| search::candidate_geometries(count, extents))
        .find(|geometries| !geometries.is_empty())
        .unwrap_or_default()
}

fn adopt_full(grid: &TopologyGrid, id: &BlockId, hw: &HardwareBlock) -> Result<BlockShape> {
    let to_coords = |locations: &[String]| -> Result<BTreeSet<Coord>> {
        locations
            .iter()
            .map(|loc| {
                grid.unit_at_location(loc)
                    .map(|u| u.coord())
                    .ok_or_else(|| BlockError::inconsistency(id, format!("unknown midplane {loc}")))
            })
            .collect()
    };
    let coords = to_coords(&hw.midplanes)?;
    let passthrough = to_coords(&hw.passthrough)?;
    if coords.is_empty() {
        return Err(BlockError::inconsistency(id, "block reports no midplanes"));
    }

    let extents = grid.extents();
    let (start, geometry) = search::bounding_box(&coords, &extents);

    let mut scratch = grid.clone();
    scratch.clear_reservations();
    let keep: Vec<Coord> = coords.union(&passthrough).copied().collect();
    scratch.mark_removable(&keep, true);
    let found = search::find_placement(&scratch, &[geometry], Some(start), &hw.connectivity);
    scratch.reset_removable_flags();

    let shape = found.ok_or_else(|| {
        BlockError::inconsistency(id, "unable to rebuild the block in the wiring")
    })?;
    let placed: BTreeSet<Coord> = shape.midplanes().into_iter().collect();
    if placed != coords {
        return Err(BlockError::inconsistency(
            id,
            format!("search placed {placed:?} but hardware reports {coords:?}"),
        ));
    }
    Ok(shape)
}

/// Mark the flags of `shape` on the grid. Checks everything before marking.
fn apply(
    grid: &mut TopologyGrid,
    shape: &BlockShape,
    allow_overlap: bool,
    machine: &MachineConfig,
) -> std::result::Result<(), String> {
    match shape {
        BlockShape::Full {
            midplanes,
            passthrough,
            ..
        } => {
            for coord in midplanes.iter().chain(passthrough.iter()) {
                let unit = grid
                    .coord_to_unit(coord)
                    .ok_or_else(|| format!("no midplane at {coord}"))?;
                if !allow_overlap && (unit.is_used() || unit.carries_small_blocks()) {
                    return Err(format!("midplane {coord} is already in use"));
                }
            }
            for coord in midplanes.iter().chain(passthrough.iter()) {
                if let Some(unit) = grid.coord_to_unit_mut(coord) {
                    unit.used = true;
                }
            }
        }
        BlockShape::Small {
            midplane, ionodes, ..
        } => {
            if !ionodes.fits(machine.ionodes_per_midplane) {
                return Err(format!("I/O nodes {ionodes} exceed the midplane"));
            }
            let unit = grid
                .coord_to_unit_mut(midplane)
                .ok_or_else(|| format!("no midplane at {midplane}"))?;
            if !allow_overlap && (unit.used || unit.ionodes_in_use & ionodes.mask() != 0) {
                return Err(format!("I/O nodes {ionodes} on {midplane} are already in use"));
            }
            unit.ionodes_in_use |= ionodes.mask();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::HardwareStatus;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn allocator(extents: Extents) -> BlockAllocator {
        let machine = MachineConfig::default();
        BlockAllocator::new(
            TopologyGrid::synthetic(extents, &machine),
            machine,
            LayoutMode::Dynamic,
        )
    }

    fn full(count: u32) -> PlacementRequest {
        PlacementRequestBuilder::default()
            .node_count(count * 512)
            .build()
            .unwrap()
    }

    fn small(cnodes: u32) -> PlacementRequest {
        PlacementRequestBuilder::default()
            .node_count(cnodes)
            .small(true)
            .build()
            .unwrap()
    }

    fn used(allocator: &BlockAllocator) -> usize {
        allocator.snapshot().units().filter(|u| u.is_used()).count()
    }

    #[test]
    fn test_allocate_single_midplane() {
        let allocator = allocator([2, 2, 2, 2]);
        let reservation = allocator.allocate(&full(1)).unwrap();
        let shape = reservation.commit();
        assert_eq!(shape.midplanes(), vec![Coord::new(0, 0, 0, 0)]);
        assert_eq!(used(&allocator), 1);

        let next = allocator.allocate(&full(1)).unwrap().commit();
        assert_eq!(next.midplanes(), vec![Coord::new(0, 0, 0, 1)]);
    }

    #[test]
    fn test_uncommitted_reservation_rolls_back() {
        let allocator = allocator([2, 2, 2, 2]);
        {
            let reservation = allocator.allocate(&full(4)).unwrap();
            assert_eq!(reservation.shape().midplanes().len(), 4);
            assert_eq!(used(&allocator), 4);
        }
        assert_eq!(used(&allocator), 0);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = allocator([1, 1, 1, 2]);
        let _a = allocator.allocate(&full(1)).unwrap().commit();
        let _b = allocator.allocate(&full(1)).unwrap().commit();
        let err = allocator.allocate(&full(1)).unwrap_err();
        assert!(matches!(err, BlockError::PlacementExhausted { .. }));
    }

    #[test]
    fn test_count_without_box_rounds_up() {
        let square = allocator([2, 2, 2, 2]);
        let shape = square.allocate(&full(3)).unwrap().commit();
        assert_eq!(shape.midplanes().len(), 4);

        let line = allocator([1, 1, 1, 4]);
        assert!(matches!(
            line.allocate(&full(5)),
            Err(BlockError::PlacementExhausted { .. })
        ));
    }

    #[test]
    fn test_explicit_geometry_and_start() {
        let allocator = allocator([2, 2, 2, 2]);
        let request = PlacementRequestBuilder::default()
            .geometry([1, 1, 2, 1])
            .start(Coord::new(1, 1, 0, 1))
            .build()
            .unwrap();
        let shape = allocator.allocate(&request).unwrap().commit();
        assert_eq!(
            shape.midplanes(),
            vec![Coord::new(1, 1, 0, 1), Coord::new(1, 1, 1, 1)]
        );

        let too_big = PlacementRequestBuilder::default()
            .geometry([3, 1, 1, 1])
            .build()
            .unwrap();
        assert!(matches!(
            allocator.allocate(&too_big),
            Err(BlockError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_partial_torus_reserves_passthrough() {
        let allocator = allocator([1, 1, 1, 4]);
        let request = PlacementRequestBuilder::default()
            .geometry([1, 1, 1, 2])
            .build()
            .unwrap();
        let shape = allocator.allocate(&request).unwrap().commit();
        assert_eq!(shape.midplanes().len(), 2);
        assert_eq!(
            shape.passthrough(),
            &[Coord::new(0, 0, 0, 2), Coord::new(0, 0, 0, 3)]
        );
        assert_eq!(used(&allocator), 4);

        let mesh = PlacementRequestBuilder::default()
            .geometry([1, 1, 1, 2])
            .connectivity([Connectivity::Mesh; 4])
            .build()
            .unwrap();
        allocator.release(&shape);
        let shape = allocator.allocate(&mesh).unwrap().commit();
        assert!(shape.passthrough().is_empty());
        assert_eq!(used(&allocator), 2);
    }

    #[test]
    fn test_small_block_ionodes() {
        let allocator = allocator([1, 1, 1, 1]);
        let shape = allocator.allocate(&small(256)).unwrap().commit();
        match &shape {
            BlockShape::Small {
                nodeboards,
                ionodes,
                ..
            } => {
                assert_eq!(nodeboards.len(), 8);
                assert_eq!(nodeboards[0], "R00-M0-N00");
                assert_eq!(
                    *ionodes,
                    IonodeRange {
                        start: 0,
                        offset: 1
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        let grid = allocator.snapshot();
        assert_eq!(
            grid.coord_to_unit(&Coord::new(0, 0, 0, 0))
                .unwrap()
                .ionodes_in_use(),
            0b11
        );

        let second = allocator.allocate(&small(128)).unwrap().commit();
        match second {
            BlockShape::Small {
                nodeboards,
                ionodes,
                ..
            } => {
                assert_eq!(nodeboards[0], "R00-M0-N08");
                assert_eq!(ionodes.start, 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        // midplane carries small blocks, so no full block fits
        assert!(matches!(
            allocator.allocate(&full(1)),
            Err(BlockError::PlacementExhausted { .. })
        ));
    }

    #[test]
    fn test_small_request_bounds() {
        let allocator = allocator([1, 1, 1, 1]);
        assert!(matches!(
            allocator.allocate(&small(16)),
            Err(BlockError::InvalidRequest(_))
        ));
        assert!(matches!(
            allocator.allocate(&small(512)),
            Err(BlockError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_adopt_reproduces_placement() {
        let allocator = allocator([2, 2, 2, 2]);
        let request = PlacementRequestBuilder::default()
            .geometry([1, 2, 1, 2])
            .start(Coord::new(1, 0, 1, 0))
            .connectivity([
                Connectivity::Torus,
                Connectivity::Mesh,
                Connectivity::Torus,
                Connectivity::Mesh,
            ])
            .build()
            .unwrap();
        let shape = allocator.allocate(&request).unwrap().commit();
        let id = BlockId::from("RMP1");
        let spec = allocator.create_spec(&id, &shape).unwrap();
        allocator.release(&shape);

        let (midplanes, passthrough, connectivity) = match spec {
            BlockCreateSpec::Full {
                midplanes,
                passthrough,
                connectivity,
            } => (midplanes, passthrough, connectivity),
            other => panic!("unexpected {other:?}"),
        };
        let hw = HardwareBlock {
            name: "RMP1".to_string(),
            status: HardwareStatus::Free,
            midplanes,
            passthrough,
            nodeboards: vec![],
            connectivity,
            cnode_count: 2048,
            boot_image: None,
            small: false,
        };
        let adopted = allocator.adopt(&hw).unwrap();
        assert_eq!(adopted, shape);
        assert_eq!(used(&allocator), 4);
    }

    #[test]
    fn test_adopt_wrapped_block() {
        let allocator = allocator([1, 1, 1, 4]);
        let hw = HardwareBlock {
            name: "RMPwrap".to_string(),
            status: HardwareStatus::Free,
            midplanes: vec!["R00-M3".to_string(), "R00-M0".to_string()],
            passthrough: vec![],
            nodeboards: vec![],
            connectivity: [Connectivity::Mesh; 4],
            cnode_count: 1024,
            boot_image: None,
            small: false,
        };
        match allocator.adopt(&hw).unwrap() {
            BlockShape::Full {
                start, geometry, ..
            } => {
                assert_eq!(start, Coord::new(0, 0, 0, 3));
                assert_eq!(geometry, [1, 1, 1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_adopt_inconsistent_block() {
        let allocator = allocator([1, 1, 2, 2]);
        // an L shape is no box
        let hw = HardwareBlock {
            name: "RMPbad".to_string(),
            status: HardwareStatus::Free,
            midplanes: vec![
                "R00-M0".to_string(),
                "R00-M1".to_string(),
                "R00-M2".to_string(),
            ],
            passthrough: vec![],
            nodeboards: vec![],
            connectivity: [Connectivity::Mesh; 4],
            cnode_count: 1536,
            boot_image: None,
            small: false,
        };
        let err = allocator.adopt(&hw).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(used(&allocator), 0);

        let unknown = HardwareBlock {
            midplanes: vec!["R99-M0".to_string()],
            ..hw
        };
        assert!(allocator.adopt(&unknown).unwrap_err().is_fatal());
    }

    #[test]
    fn test_adopt_small_block() {
        let allocator = allocator([1, 1, 1, 1]);
        let hw = HardwareBlock {
            name: "RMPsmall".to_string(),
            status: HardwareStatus::Initialized,
            midplanes: vec!["R00-M0".to_string()],
            passthrough: vec![],
            nodeboards: (4..8).map(|i| format!("R00-M0-N{i:02}")).collect(),
            connectivity: [Connectivity::Mesh; 4],
            cnode_count: 128,
            boot_image: None,
            small: true,
        };
        match allocator.adopt(&hw).unwrap() {
            BlockShape::Small { ionodes, .. } => {
                assert_eq!(
                    ionodes,
                    IonodeRange {
                        start: 1,
                        offset: 0
                    }
                )
            }
            other => panic!("unexpected {other:?}"),
        }
        // overlapping adoption is inconsistent outside overlap layout
        let err = allocator.adopt(&hw).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_overlap_layout_rebuild() {
        let machine = MachineConfig::default();
        let allocator = BlockAllocator::new(
            TopologyGrid::synthetic([1, 1, 1, 1], &machine),
            machine.clone(),
            LayoutMode::Overlap,
        );
        let shape = BlockShape::Full {
            midplanes: vec![Coord::new(0, 0, 0, 0)],
            passthrough: vec![],
            start: Coord::new(0, 0, 0, 0),
            geometry: [1, 1, 1, 1],
            connectivity: [Connectivity::Torus; 4],
        };
        allocator.reserve(&BlockId::from("A"), &shape).unwrap().commit();
        let b = allocator.reserve(&BlockId::from("B"), &shape).unwrap().commit();
        allocator.rebuild([&b]);
        assert_eq!(used(&allocator), 1);
        allocator.rebuild(std::iter::empty::<&BlockShape>());
        assert_eq!(used(&allocator), 0);
    }

    fn shapes_disjoint(shapes: &[BlockShape]) -> bool {
        let mut midplanes = BTreeSet::new();
        let mut ionodes: std::collections::HashMap<Coord, u64> = Default::default();
        for shape in shapes {
            match shape {
                BlockShape::Full {
                    midplanes: mps,
                    passthrough,
                    ..
                } => {
                    for c in mps.iter().chain(passthrough.iter()) {
                        if !midplanes.insert(*c) || ionodes.contains_key(c) {
                            return false;
                        }
                    }
                }
                BlockShape::Small {
                    midplane,
                    ionodes: range,
                    ..
                } => {
                    if midplanes.contains(midplane) {
                        return false;
                    }
                    let bits = ionodes.entry(*midplane).or_default();
                    if *bits & range.mask() != 0 {
                        return false;
                    }
                    *bits |= range.mask();
                }
            }
        }
        true
    }

    proptest! {
        #[test]
        fn prop_concurrent_allocations_are_disjoint(
            requests in prop::collection::vec((any::<bool>(), 1u32..=4), 1..16)
        ) {
            let allocator = Arc::new(allocator([2, 2, 2, 2]));
            let shapes: Vec<BlockShape> = std::thread::scope(|scope| {
                let handles: Vec<_> = requests
                    .iter()
                    .map(|&(is_small, n)| {
                        let allocator = allocator.clone();
                        scope.spawn(move || {
                            let request = if is_small { small(n * 64) } else { full(n) };
                            allocator.allocate(&request).ok().map(PendingReservation::commit)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .filter_map(|h| h.join().ok().flatten())
                    .collect()
            });
            prop_assert!(shapes_disjoint(&shapes));
        }

        #[test]
        fn prop_fitting_geometry_never_exhausts(
            g in (1u16..=2, 1u16..=3, 1u16..=2, 1u16..=4)
        ) {
            let allocator = allocator([2, 3, 2, 4]);
            let count = (g.0 * g.1 * g.2 * g.3) as u32;
            let by_count = allocator.allocate(&full(count));
            prop_assert!(by_count.is_ok());
            drop(by_count);

            let request = PlacementRequestBuilder::default()
                .geometry([g.0, g.1, g.2, g.3])
                .build()
                .unwrap();
            prop_assert!(allocator.allocate(&request).is_ok());
        }

        #[test]
        fn prop_any_count_below_capacity_is_placed(count in 1u32..=48) {
            let allocator = allocator([2, 3, 2, 4]);
            let shape = allocator.allocate(&full(count));
            prop_assert!(shape.is_ok());
            let midplanes = shape.map(|r| r.commit().midplanes().len()).unwrap_or(0);
            prop_assert!(midplanes >= count as usize);
        }
    }
}
