// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-system facade.
//!
//! [`ControlSystem`] is the synchronous seam to the hardware control system.
//! [`Bridge`] wraps an implementation, owns its initialization state and
//! translates every failure into a [`crate::BlockError`] in one place.
//! [`EmulatedControlSystem`] is an in-memory implementation for machines
//! without a hardware bridge and for tests.

mod bridge;
mod emulated;

pub use bridge::{Bridge, FacadeState, FACADE_TARGET};
pub use emulated::EmulatedControlSystem;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::topology::MidplaneDescription;
use crate::topology::{Connectivity, Coord, Extents, SYSTEM_DIMENSIONS};

/// Input error codes reported by the control system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputCode {
    BlockNotFound,
    InvalidBlockState,
    UserAlreadyExists,
    UserNotFound,
    InvalidLocation,
    DuplicateBlock,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeErrorKind {
    Input(InputCode),
    Runtime,
    Database,
    Internal,
    Unknown,
}

impl fmt::Display for FacadeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(code) => write!(f, "input ({code:?})"),
            Self::Runtime => f.write_str("runtime"),
            Self::Database => f.write_str("database"),
            Self::Internal => f.write_str("internal"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A failed control-system call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error from {op}: {message}")]
pub struct FacadeError {
    pub kind: FacadeErrorKind,
    pub op: &'static str,
    pub message: String,
    pub block: Option<String>,
}

impl FacadeError {
    pub fn new(kind: FacadeErrorKind, op: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            op,
            message: message.into(),
            block: None,
        }
    }

    pub fn input(code: InputCode, op: &'static str, message: impl Into<String>) -> Self {
        Self::new(FacadeErrorKind::Input(code), op, message)
    }

    pub fn with_block(mut self, block: impl Into<String>) -> Self {
        self.block = Some(block.into());
        self
    }

    pub fn is_input(&self, code: InputCode) -> bool {
        self.kind == FacadeErrorKind::Input(code)
    }
}

/// Handle to a block that has been created but not yet added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u64);

/// Physical description of a block to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockCreateSpec {
    Full {
        midplanes: Vec<String>,
        passthrough: Vec<String>,
        connectivity: [Connectivity; SYSTEM_DIMENSIONS],
    },
    Small {
        nodeboards: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoLinkSummary {
    pub connected: u32,
    pub unconnected: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoConnectivity {
    pub connected: bool,
    /// Locations of midplanes without I/O links.
    pub unconnected: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareStatus {
    Free,
    Allocated,
    Booting,
    Initialized,
    Terminating,
    Error,
}

/// A block as listed by the control system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareBlock {
    pub name: String,
    pub status: HardwareStatus,
    pub midplanes: Vec<String>,
    pub passthrough: Vec<String>,
    pub nodeboards: Vec<String>,
    pub connectivity: [Connectivity; SYSTEM_DIMENSIONS],
    pub cnode_count: u32,
    pub boot_image: Option<String>,
    pub small: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareJobStatus {
    Setup,
    Loading,
    Starting,
    Running,
    Cleanup,
    Terminated,
    Error,
}

impl HardwareJobStatus {
    /// Statuses of jobs that still occupy a block.
    pub const ACTIVE: [HardwareJobStatus; 5] = [
        HardwareJobStatus::Setup,
        HardwareJobStatus::Loading,
        HardwareJobStatus::Starting,
        HardwareJobStatus::Running,
        HardwareJobStatus::Cleanup,
    ];
}

/// A job running on the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareJob {
    pub id: u64,
    pub block: String,
    pub status: HardwareJobStatus,
    /// Scheduler job that launched it, if known.
    pub scheduler_job_id: Option<u32>,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockFilter {
    /// Include midplane, nodeboard and passthrough locations.
    pub extended_info: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub block: String,
    pub statuses: Vec<HardwareJobStatus>,
    pub job_id: Option<u32>,
}

impl JobFilter {
    /// Jobs on `block` that have not finished, optionally one scheduler job.
    pub fn active(block: impl Into<String>, job_id: Option<u32>) -> Self {
        Self {
            block: block.into(),
            statuses: HardwareJobStatus::ACTIVE.to_vec(),
            job_id,
        }
    }

    pub fn matches(&self, job: &HardwareJob) -> bool {
        job.block == self.block
            && self.statuses.contains(&job.status)
            && self
                .job_id
                .map_or(true, |id| job.scheduler_job_id == Some(id))
    }
}

/// Synchronous interface to the hardware control system.
///
/// State transitions (`initiate_boot`, `initiate_free`) normally complete
/// asynchronously and are observed through `list_blocks`.
pub trait ControlSystem: Send + Sync {
    fn init(&self, properties: Option<&Path>) -> Result<(), FacadeError>;

    /// Whether transitions finish within the initiating call.
    fn completes_synchronously(&self) -> bool {
        false
    }

    fn machine_size(&self) -> Result<Extents, FacadeError>;

    fn describe_midplane(&self, coord: &Coord)
        -> Result<Option<MidplaneDescription>, FacadeError>;

    fn create_block(&self, spec: &BlockCreateSpec) -> Result<BlockHandle, FacadeError>;

    fn set_block_name(&self, handle: &BlockHandle, name: &str) -> Result<(), FacadeError>;

    fn set_boot_image(&self, handle: &BlockHandle, image: &str) -> Result<(), FacadeError>;

    fn add_block(&self, handle: &BlockHandle, owner: &str) -> Result<(), FacadeError>;

    fn initiate_boot(&self, block: &str) -> Result<(), FacadeError>;

    fn initiate_free(&self, block: &str) -> Result<(), FacadeError>;

    fn remove_block(&self, block: &str) -> Result<(), FacadeError>;

    fn check_io_links_summary(&self, block: &str) -> Result<IoLinkSummary, FacadeError>;

    fn is_io_connected(&self, block: &str) -> Result<IoConnectivity, FacadeError>;

    fn get_users(&self, block: &str) -> Result<Vec<String>, FacadeError>;

    fn add_user(&self, block: &str, user: &str) -> Result<(), FacadeError>;

    fn remove_user(&self, block: &str, user: &str) -> Result<(), FacadeError>;

    fn is_authorized(&self, block: &str, user: &str) -> Result<bool, FacadeError>;

    fn list_blocks(&self, filter: &BlockFilter) -> Result<Vec<HardwareBlock>, FacadeError>;

    fn list_jobs_on_block(&self, filter: &JobFilter) -> Result<Vec<HardwareJob>, FacadeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(block: &str, status: HardwareJobStatus, scheduler_job_id: Option<u32>) -> HardwareJob {
        HardwareJob {
            id: 1,
            block: block.to_string(),
            status,
            scheduler_job_id,
            user: "alice".to_string(),
        }
    }

    #[test]
    fn test_job_filter_active() {
        let filter = JobFilter::active("RMP1", None);
        assert!(filter.matches(&job("RMP1", HardwareJobStatus::Running, Some(7))));
        assert!(filter.matches(&job("RMP1", HardwareJobStatus::Cleanup, None)));
        assert!(!filter.matches(&job("RMP1", HardwareJobStatus::Terminated, Some(7))));
        assert!(!filter.matches(&job("RMP2", HardwareJobStatus::Running, Some(7))));
    }

    #[test]
    fn test_job_filter_by_scheduler_job() {
        let filter = JobFilter::active("RMP1", Some(7));
        assert!(filter.matches(&job("RMP1", HardwareJobStatus::Running, Some(7))));
        assert!(!filter.matches(&job("RMP1", HardwareJobStatus::Running, Some(8))));
        assert!(!filter.matches(&job("RMP1", HardwareJobStatus::Running, None)));
    }

    #[test]
    fn test_facade_error_display() {
        let err = FacadeError::input(InputCode::BlockNotFound, "remove_block", "no such block")
            .with_block("RMP1");
        assert!(err.is_input(InputCode::BlockNotFound));
        assert_eq!(
            err.to_string(),
            "input (BlockNotFound) error from remove_block: no such block"
        );
        assert_eq!(err.block.as_deref(), Some("RMP1"));
    }
}
