// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::block::{BlockId, BlockState};
use crate::facade::{FacadeError, FacadeErrorKind};

pub type Result<T, E = BlockError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("no placement available for {request}")]
    PlacementExhausted { request: String },

    /// Scheduler state and hardware disagree in a way that cannot be
    /// repaired automatically. Fatal.
    #[error("configuration inconsistency on block {block_id}: {detail}")]
    ConfigInconsistency { block_id: BlockId, detail: String },

    #[error("block {block_id} has no I/O links on [{}]", .unconnected.join(", "))]
    IoLinkUnavailable {
        block_id: BlockId,
        unconnected: Vec<String>,
    },

    #[error(transparent)]
    Facade(#[from] FacadeError),

    #[error("{op} failed with an unknown error")]
    OperationFailed {
        op: &'static str,
        block_id: Option<BlockId>,
    },

    #[error("user sync failed on block {block_id}: {source}")]
    UserSync {
        block_id: BlockId,
        #[source]
        source: Box<BlockError>,
    },

    #[error("block {0} not found")]
    BlockNotFound(BlockId),

    #[error("cannot {op} block {block_id} while {state}")]
    InvalidState {
        block_id: BlockId,
        state: BlockState,
        op: &'static str,
    },

    #[error("block {0} is in error; clear the error first")]
    BlockInError(BlockId),

    #[error("block {block_id} still has {count} job(s) assigned")]
    JobsStillAssigned { block_id: BlockId, count: usize },

    #[error("job {job_id} is already assigned to block {block_id}")]
    DuplicateJob { block_id: BlockId, job_id: u32 },

    #[error("owner of job {job_id} is unknown")]
    UnknownJobOwner { job_id: u32 },

    #[error("block id {0} is already in use")]
    BlockIdInUse(BlockId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl BlockError {
    /// Only a configuration inconsistency stops the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigInconsistency { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Facade(err) => matches!(
                err.kind,
                FacadeErrorKind::Runtime | FacadeErrorKind::Database | FacadeErrorKind::Internal
            ),
            _ => false,
        }
    }

    pub(crate) fn inconsistency(block_id: &BlockId, detail: impl Into<String>) -> Self {
        Self::ConfigInconsistency {
            block_id: block_id.clone(),
            detail: detail.into(),
        }
    }
}
