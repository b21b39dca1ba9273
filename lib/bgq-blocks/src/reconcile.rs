// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inventory reconciliation.
//!
//! Brings the tracked block set in line with what the control system
//! reports: unknown managed blocks are adopted, states follow the hardware,
//! and blocks that disappeared are dropped or reported depending on the
//! layout mode.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::block::{Block, BlockId, BlockState};
use crate::error::{BlockError, Result};
use crate::facade::{BlockFilter, HardwareBlock, HardwareStatus};
use crate::manager::BlockManager;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: Vec<BlockId>,
    pub updated: Vec<BlockId>,
    pub dropped: Vec<BlockId>,
    pub missing: Vec<BlockId>,
    /// Hardware blocks outside the managed prefix.
    pub ignored: Vec<String>,
}

impl ReconcileReport {
    /// Nothing but ignored blocks.
    pub fn is_quiet(&self) -> bool {
        self.adopted.is_empty()
            && self.updated.is_empty()
            && self.dropped.is_empty()
            && self.missing.is_empty()
    }

    /// Whether the tracked set differs from before the pass.
    pub fn changed(&self) -> bool {
        !(self.adopted.is_empty() && self.updated.is_empty() && self.dropped.is_empty())
    }
}

pub struct ReconciliationEngine {
    manager: Arc<BlockManager>,
}

impl ReconciliationEngine {
    pub fn new(manager: Arc<BlockManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    /// Load the persisted block set, re-mark its reservations, then
    /// reconcile against the hardware.
    pub fn startup(&self) -> Result<ReconcileReport> {
        let manager = &self.manager;
        let saved = manager.store.load().map_err(BlockError::Persistence)?;
        {
            let mut blocks = manager.blocks.lock();
            for mut block in saved {
                if blocks.contains_key(&block.id) {
                    tracing::warn!(block_id = %block.id, "duplicate block in saved state");
                    continue;
                }
                manager.allocator.restore(&block)?;
                block.users_synced = false;
                blocks.insert(block.id.clone(), block);
            }
            tracing::info!(restored = blocks.len(), "block state loaded");
        }
        self.reconcile()
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let manager = &self.manager;
        let config = &manager.config;
        let inventory = manager.bridge.invoke("list_blocks", None, |cs| {
            cs.list_blocks(&BlockFilter {
                extended_info: true,
            })
        })?;

        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();
        let mut blocks = manager.blocks.lock();

        for hw in &inventory {
            let id = BlockId::from(hw.name.as_str());
            if !id.has_prefix(&config.block_prefix) {
                report.ignored.push(hw.name.clone());
                continue;
            }
            seen.insert(id.clone());

            let adopted = !blocks.contains_key(&id);
            if adopted {
                let shape = manager.allocator.adopt(hw)?;
                let block = Block::new(
                    id.clone(),
                    shape,
                    manager.allocator.machine(),
                    &manager.allocator.extents(),
                );
                blocks.insert(id.clone(), block);
                report.adopted.push(id.clone());
            }
            if let Some(block) = blocks.get_mut(&id) {
                if self.apply_status(block, hw) && !adopted {
                    report.updated.push(id);
                }
            }
        }

        let vanished: Vec<BlockId> = blocks
            .keys()
            .filter(|id| id.has_prefix(&config.block_prefix) && !seen.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            if manager.is_dynamic() {
                if let Some(block) = blocks.shift_remove(&id) {
                    manager.release_shape(&blocks, &block.shape);
                    tracing::info!(block_id = %id, "block left the inventory, dropped");
                    report.dropped.push(id);
                }
            } else {
                tracing::warn!(block_id = %id, layout = %config.layout, "block missing from the inventory");
                report.missing.push(id);
            }
        }

        if report.changed() {
            manager.persist(&blocks);
        }
        if !report.is_quiet() {
            tracing::info!(
                adopted = report.adopted.len(),
                updated = report.updated.len(),
                dropped = report.dropped.len(),
                missing = report.missing.len(),
                "inventory reconciled"
            );
        }
        Ok(report)
    }

    /// Fold one hardware status into a tracked block. Returns whether
    /// anything changed.
    fn apply_status(&self, block: &mut Block, hw: &HardwareBlock) -> bool {
        let before = (
            block.state,
            block.error,
            block.boot_pending,
            block.boot_image.clone(),
        );

        match hw.status {
            HardwareStatus::Free => block.state = BlockState::Free,
            HardwareStatus::Allocated | HardwareStatus::Booting => {
                block.state = BlockState::Booting;
                block.boot_pending = true;
            }
            HardwareStatus::Initialized => block.state = BlockState::Ready,
            HardwareStatus::Terminating => block.state = BlockState::Freeing,
            HardwareStatus::Error => block.error = true,
        }

        if block.boot_pending {
            match hw.status {
                HardwareStatus::Initialized => block.boot_pending = false,
                HardwareStatus::Free => {
                    block.boot_pending = false;
                    block.error = true;
                    tracing::error!(block_id = %block.id, "boot failed, block is free again");
                    for job in &block.jobs {
                        self.manager.hooks.job_failed(job.job_id);
                    }
                }
                _ => {}
            }
        }

        if self.manager.config.recover {
            if let Some(image) = &hw.boot_image {
                block.boot_image = Some(image.clone());
            }
        }

        let after = (
            block.state,
            block.error,
            block.boot_pending,
            block.boot_image.clone(),
        );
        if before != after {
            tracing::debug!(block_id = %block.id, state = %block.state, error = block.error, "block updated");
        }
        before != after
    }
}

/// Runs [`ReconciliationEngine::reconcile`] on an interval.
pub struct ReconcileDaemon {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
}

impl ReconcileDaemon {
    pub fn new(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Interval taken from the manager's poll configuration.
    pub fn from_config(engine: Arc<ReconciliationEngine>) -> Self {
        let interval = engine.manager().config().poll.reconcile_interval();
        Self::new(engine, interval)
    }

    /// Reconcile until `cancel` fires. Returns the error of a fatal pass.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "reconcile daemon started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("reconcile daemon stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let engine = self.engine.clone();
            let result = match tokio::task::spawn_blocking(move || engine.reconcile()).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "reconcile worker failed");
                    continue;
                }
            };
            match result {
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "fatal inconsistency, stopping reconciliation");
                    return Err(err);
                }
                Err(err) => tracing::warn!(error = %err, "reconcile failed"),
            }
        }
    }
}
