// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sub-midplane ("small") block placement.
//!
//! A midplane's I/O nodes are split into segments; each segment backs
//! `max(1, nodecards / ionodes)` nodeboards. A small block takes a contiguous
//! run of free segments on the first midplane that has one.

use bgq_config::MachineConfig;

use super::PlacementRequest;
use crate::block::{BlockShape, IonodeRange};
use crate::error::{BlockError, Result};
use crate::topology::{nodeboard_suffix, TopologyGrid};

pub(super) fn place(
    grid: &TopologyGrid,
    request: &PlacementRequest,
    machine: &MachineConfig,
) -> Result<BlockShape> {
    let per_nodeboard = machine.cnodes_per_nodecard;
    let per_midplane = machine.cnodes_per_midplane();
    if request.node_count < per_nodeboard || request.node_count >= per_midplane {
        return Err(BlockError::InvalidRequest(format!(
            "small block of {} cnodes must be at least {per_nodeboard} and below {per_midplane}",
            request.node_count
        )));
    }

    let nodecards = machine.nodecards_per_midplane;
    let segment = (nodecards / machine.ionodes_per_midplane).max(1);
    let wanted = request.node_count.div_ceil(per_nodeboard) as u16;
    let nodeboards = wanted.div_ceil(segment) * segment;
    if nodeboards >= nodecards {
        return Err(BlockError::InvalidRequest(format!(
            "small block of {} cnodes rounds up to a full midplane",
            request.node_count
        )));
    }

    for unit in grid.units() {
        if request.start.is_some_and(|s| s != unit.coord()) {
            continue;
        }
        if unit.is_used() || unit.is_removable() {
            continue;
        }

        let mut first = 0u16;
        while first + nodeboards <= nodecards {
            let end = (first + nodeboards) as usize;
            if let Some(boards) = unit.nodeboards().get(first as usize..end) {
                let suffix = nodeboard_suffix(&boards[0]).unwrap_or(first);
                let ionodes = IonodeRange::from_nodeboards(suffix, nodeboards, machine);
                if ionodes.fits(machine.ionodes_per_midplane)
                    && unit.ionodes_in_use() & ionodes.mask() == 0
                {
                    return Ok(BlockShape::Small {
                        midplane: unit.coord(),
                        nodeboards: boards.to_vec(),
                        ionodes,
                    });
                }
            }
            first += segment;
        }
    }

    Err(BlockError::PlacementExhausted {
        request: request.to_string(),
    })
}
