// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collaborators supplied by the host scheduler.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::block::Block;

/// Read lock on the host scheduler's job table.
///
/// `post_job` holds it for reading while resetting a block on behalf of a job.
pub type JobLock = Arc<parking_lot::RwLock<()>>;

/// Callbacks into the host scheduler.
pub trait SchedulerHooks: Send + Sync {
    /// A job's block failed to boot.
    fn job_failed(&self, job_id: u32);

    /// Take the nodes in `node_range` out of service.
    fn drain_nodes(&self, node_range: &str, reason: &str);

    /// Owner of a scheduler job, if the scheduler knows it.
    fn job_owner(&self, job_id: u32) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SchedulerHooks for NoopHooks {
    fn job_failed(&self, job_id: u32) {
        tracing::debug!(job_id, "job failure not forwarded");
    }

    fn drain_nodes(&self, node_range: &str, reason: &str) {
        tracing::debug!(node_range, reason, "drain not forwarded");
    }

    fn job_owner(&self, _job_id: u32) -> Option<String> {
        None
    }
}

/// Persistence of the tracked block set.
pub trait BlockStore: Send + Sync {
    fn save(&self, blocks: &[Block]) -> anyhow::Result<()>;

    fn load(&self) -> anyhow::Result<Vec<Block>>;
}

/// Keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl BlockStore for NullStore {
    fn save(&self, _blocks: &[Block]) -> anyhow::Result<()> {
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<Block>> {
        Ok(Vec::new())
    }
}

/// Block set as a JSON document.
///
/// Writes go to a sibling temporary file that is renamed over the state
/// file, so a crash never leaves a truncated document behind.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl BlockStore for JsonFileStore {
    fn save(&self, blocks: &[Block]) -> anyhow::Result<()> {
        let tmp = self.temp_path();
        let json = serde_json::to_vec_pretty(blocks).context("serializing block state")?;
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(&json)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), self.path.display()))?;
        tracing::debug!(path = %self.path.display(), blocks = blocks.len(), "block state saved");
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<Block>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", self.path.display()))
    }
}
