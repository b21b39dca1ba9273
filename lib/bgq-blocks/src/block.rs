// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block model: identity, shape, lifecycle state and job assignments.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

use bgq_config::MachineConfig;
use chrono::{NaiveDateTime, Timelike};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::topology::{Connectivity, Coord, Extents, Geometry, SYSTEM_DIMENSIONS};

/// Block name as known to the control system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for BlockId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Contiguous I/O-node range of a small block.
///
/// Covers `start..=start + offset`; `offset` is the inclusive end offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IonodeRange {
    pub start: u16,
    pub offset: u16,
}

impl IonodeRange {
    /// Derive the range from the first nodeboard's numeric suffix and the
    /// number of nodeboards in the block.
    pub fn from_nodeboards(first_suffix: u16, nodeboards: u16, machine: &MachineConfig) -> Self {
        let io = machine.ionodes_per_midplane as u32;
        let nc = machine.nodecards_per_midplane as u32;
        let start = first_suffix as u32 * io / nc;
        let offset = (nodeboards as u32 * io / nc).saturating_sub(1);
        Self {
            start: start as u16,
            offset: offset as u16,
        }
    }

    /// Number of I/O nodes covered.
    pub fn width(&self) -> u16 {
        self.offset + 1
    }

    pub fn last(&self) -> u16 {
        self.start + self.offset
    }

    /// Bitmap of the covered I/O nodes.
    pub fn mask(&self) -> u64 {
        let ones = (1u128 << self.width()) - 1;
        (ones << self.start) as u64
    }

    /// Whether the range fits inside a midplane with `ionodes` I/O nodes.
    pub fn fits(&self, ionodes: u16) -> bool {
        (self.last() as u32) < ionodes as u32
    }
}

impl fmt::Display for IonodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.last())
        }
    }
}

/// Physical extent of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlockShape {
    Full {
        /// Reserved midplanes, ordered.
        midplanes: Vec<Coord>,
        /// Midplanes only used to close a partial torus ring.
        passthrough: Vec<Coord>,
        start: Coord,
        geometry: Geometry,
        connectivity: [Connectivity; SYSTEM_DIMENSIONS],
    },
    Small {
        midplane: Coord,
        nodeboards: Vec<String>,
        ionodes: IonodeRange,
    },
}

impl BlockShape {
    pub fn is_small(&self) -> bool {
        matches!(self, Self::Small { .. })
    }

    /// Midplanes that hold compute nodes of this block.
    pub fn midplanes(&self) -> Vec<Coord> {
        match self {
            Self::Full { midplanes, .. } => midplanes.clone(),
            Self::Small { midplane, .. } => vec![*midplane],
        }
    }

    pub fn passthrough(&self) -> &[Coord] {
        match self {
            Self::Full { passthrough, .. } => passthrough,
            Self::Small { .. } => &[],
        }
    }

    pub fn cnode_count(&self, machine: &MachineConfig) -> u32 {
        match self {
            Self::Full { midplanes, .. } => midplanes.len() as u32 * machine.cnodes_per_midplane(),
            Self::Small { nodeboards, .. } => nodeboards.len() as u32 * machine.cnodes_per_nodecard,
        }
    }

    /// Scheduler node-name range covered by the block.
    pub fn node_range(&self, prefix: &str, extents: &Extents) -> String {
        match self {
            Self::Small { midplane, .. } => format!("{prefix}{midplane}"),
            Self::Full {
                midplanes,
                start,
                geometry,
                ..
            } => {
                if midplanes.len() == 1 {
                    return format!("{prefix}{start}");
                }
                let mut end = [0u16; SYSTEM_DIMENSIONS];
                for dim in 0..SYSTEM_DIMENSIONS {
                    let extent = extents[dim].max(1);
                    end[dim] = (start.0[dim] + geometry[dim].max(1) - 1) % extent;
                }
                format!("{prefix}[{start}x{}]", Coord(end))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Free,
    Booting,
    Ready,
    Freeing,
    Removed,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Booting => "booting",
            Self::Ready => "ready",
            Self::Freeing => "freeing",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: u32,
    pub user: String,
}

/// A tracked block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) shape: BlockShape,
    pub(crate) cnode_count: u32,
    pub(crate) cpu_count: u32,
    pub(crate) state: BlockState,
    /// Sticky until cleared administratively.
    pub(crate) error: bool,
    pub(crate) boot_pending: bool,
    pub(crate) jobs: Vec<JobAssignment>,
    pub(crate) authorized_users: BTreeSet<String>,
    #[serde(skip)]
    pub(crate) users_synced: bool,
    pub(crate) boot_image: Option<String>,
    pub(crate) node_range: String,
}

impl Block {
    pub fn new(id: BlockId, shape: BlockShape, machine: &MachineConfig, extents: &Extents) -> Self {
        let cnode_count = shape.cnode_count(machine);
        let node_range = shape.node_range(&machine.node_prefix, extents);
        Self {
            id,
            shape,
            cnode_count,
            cpu_count: cnode_count * machine.cpus_per_cnode,
            state: BlockState::Free,
            error: false,
            boot_pending: false,
            jobs: Vec::new(),
            authorized_users: BTreeSet::new(),
            users_synced: false,
            boot_image: None,
            node_range,
        }
    }

    pub fn with_boot_image(mut self, image: Option<String>) -> Self {
        self.boot_image = image;
        self
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn shape(&self) -> &BlockShape {
        &self.shape
    }

    pub fn is_small(&self) -> bool {
        self.shape.is_small()
    }

    pub fn cnode_count(&self) -> u32 {
        self.cnode_count
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn boot_pending(&self) -> bool {
        self.boot_pending
    }

    pub fn jobs(&self) -> &[JobAssignment] {
        &self.jobs
    }

    pub fn authorized_users(&self) -> &BTreeSet<String> {
        &self.authorized_users
    }

    pub fn boot_image(&self) -> Option<&str> {
        self.boot_image.as_deref()
    }

    pub fn node_range(&self) -> &str {
        &self.node_range
    }

    /// Owners of the assigned jobs, minus `exclude`.
    pub(crate) fn job_owners(&self, exclude: &str) -> BTreeSet<String> {
        self.jobs
            .iter()
            .filter(|job| job.user != exclude)
            .map(|job| job.user.clone())
            .collect()
    }
}

/// Generates `<prefix><DD><Mon><HH><MM><SS><mmm>` block ids.
///
/// Never emits the same id twice: when the clock has not moved past the last
/// issued timestamp the millisecond component is advanced instead.
#[derive(Debug)]
pub struct BlockIdGenerator {
    prefix: String,
    last: Mutex<Option<NaiveDateTime>>,
}

impl BlockIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            last: Mutex::new(None),
        }
    }

    pub fn next_id(&self) -> BlockId {
        self.next_at(chrono::Local::now().naive_local())
    }

    fn next_at(&self, now: NaiveDateTime) -> BlockId {
        let millis = now.nanosecond() / 1_000_000 * 1_000_000;
        let now = now.with_nanosecond(millis).unwrap_or(now);

        let mut last = self.last.lock();
        let stamp = match *last {
            Some(prev) if now <= prev => prev + chrono::TimeDelta::milliseconds(1),
            _ => now,
        };
        *last = Some(stamp);

        BlockId(format!("{}{}", self.prefix, stamp.format("%d%b%H%M%S%3f")))
    }
}
