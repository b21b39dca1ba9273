// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block lifecycle on the hardware.
//!
//! Every operation runs under the block-set lock. The allocator's grid lock
//! is only taken below it, and never across a control-system call.

mod post_job;
mod users;

pub use users::UserSyncReport;

use std::sync::Arc;

use bgq_config::BgqConfig;
use derive_builder::Builder;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::allocator::{BlockAllocator, PlacementRequest};
use crate::block::{Block, BlockId, BlockIdGenerator, BlockShape, BlockState, JobAssignment};
use crate::error::{BlockError, Result};
use crate::facade::{Bridge, ControlSystem, InputCode};
use crate::hooks::{BlockStore, JobLock, NoopHooks, NullStore, SchedulerHooks};

pub(crate) type BlockSet = IndexMap<BlockId, Block>;

#[derive(Builder)]
#[builder(
    name = "BlockManagerBuilder",
    pattern = "owned",
    build_fn(private, name = "build_params")
)]
pub struct BlockManagerParams {
    bridge: Arc<Bridge>,

    allocator: Arc<BlockAllocator>,

    #[builder(default)]
    config: BgqConfig,

    #[builder(default = "Arc::new(NoopHooks)")]
    hooks: Arc<dyn SchedulerHooks>,

    #[builder(default = "Arc::new(NullStore)")]
    store: Arc<dyn BlockStore>,

    /// Shared with the host scheduler.
    #[builder(default)]
    job_lock: JobLock,
}

impl BlockManagerBuilder {
    /// Bridge, grid and allocator for `control`, configured from `config`.
    ///
    /// Initializes the control system and reads the machine topology.
    pub fn for_control_system(control: Arc<dyn ControlSystem>, config: BgqConfig) -> Result<Self> {
        let bridge = Arc::new(Bridge::new(control, &config.bridge));
        let grid = bridge.topology(&config.machine)?;
        let allocator = Arc::new(BlockAllocator::new(
            grid,
            config.machine.clone(),
            config.layout,
        ));
        Ok(Self::default()
            .bridge(bridge)
            .allocator(allocator)
            .config(config))
    }

    pub fn build(self) -> anyhow::Result<BlockManager> {
        let params = self
            .build_params()
            .map_err(|e| anyhow::anyhow!("Failed to build block manager: {e}"))?;
        Ok(BlockManager {
            ids: BlockIdGenerator::new(params.config.block_prefix.clone()),
            bridge: params.bridge,
            allocator: params.allocator,
            config: params.config,
            hooks: params.hooks,
            store: params.store,
            job_lock: params.job_lock,
            blocks: Mutex::new(IndexMap::new()),
        })
    }
}

pub struct BlockManager {
    pub(crate) bridge: Arc<Bridge>,
    pub(crate) allocator: Arc<BlockAllocator>,
    pub(crate) config: BgqConfig,
    pub(crate) hooks: Arc<dyn SchedulerHooks>,
    pub(crate) store: Arc<dyn BlockStore>,
    job_lock: JobLock,
    pub(crate) blocks: Mutex<BlockSet>,
    ids: BlockIdGenerator,
}

impl BlockManager {
    pub fn builder() -> BlockManagerBuilder {
        BlockManagerBuilder::default()
    }

    pub fn config(&self) -> &BgqConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn job_lock(&self) -> &JobLock {
        &self.job_lock
    }

    /// Place a new block and create it on the hardware.
    ///
    /// The reservation is only kept when the hardware create succeeds (or is
    /// tolerated on a sub-midplane system).
    pub fn allocate(&self, request: &PlacementRequest) -> Result<Block> {
        let mut blocks = self.blocks.lock();
        let id = match &request.block_id {
            Some(id) if blocks.contains_key(id) => return Err(BlockError::BlockIdInUse(id.clone())),
            Some(id) => id.clone(),
            None => self.fresh_id(&blocks),
        };

        let reservation = self.allocator.allocate(request)?;
        let image = request
            .boot_image
            .clone()
            .or_else(|| self.config.boot_image.clone());
        let block = Block::new(
            id,
            reservation.shape().clone(),
            self.allocator.machine(),
            &self.allocator.extents(),
        )
        .with_boot_image(image);

        self.create_on_hardware(&block)?;
        reservation.commit();

        tracing::info!(
            block_id = %block.id,
            node_range = %block.node_range,
            cnodes = block.cnode_count,
            "block allocated"
        );
        blocks.insert(block.id.clone(), block.clone());
        self.persist(&blocks);
        Ok(block)
    }

    /// Create an already shaped block on the hardware and track it.
    pub fn create(&self, block: Block) -> Result<Block> {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(&block.id) {
            return Err(BlockError::BlockIdInUse(block.id));
        }
        let reservation = self.allocator.reserve(&block.id, &block.shape)?;

        let mut block = block;
        block.state = BlockState::Free;
        block.boot_pending = false;
        self.create_on_hardware(&block)?;
        reservation.commit();

        tracing::info!(block_id = %block.id, node_range = %block.node_range, "block created");
        blocks.insert(block.id.clone(), block.clone());
        self.persist(&blocks);
        Ok(block)
    }

    fn fresh_id(&self, blocks: &BlockSet) -> BlockId {
        loop {
            let id = self.ids.next_id();
            if !blocks.contains_key(&id) {
                return id;
            }
        }
    }

    fn create_on_hardware(&self, block: &Block) -> Result<()> {
        match self.create_steps(block) {
            Ok(()) => Ok(()),
            Err(err) if self.config.sub_midplane_system => {
                tracing::warn!(
                    block_id = %block.id,
                    error = %err,
                    "create failed on a sub-midplane system; tracking the block anyway"
                );
                Ok(())
            }
            Err(err) if !block.is_small() => {
                tracing::error!(block_id = %block.id, error = %err, "full block create failed");
                Err(BlockError::inconsistency(
                    &block.id,
                    format!("hardware refused a full block: {err}"),
                ))
            }
            Err(err) => Err(err),
        }
    }

    fn create_steps(&self, block: &Block) -> Result<()> {
        let id = &block.id;
        let name = id.as_str();
        let spec = self.allocator.create_spec(id, &block.shape)?;

        tracing::info!(block_id = name, ?spec, "creating block");
        let handle = self
            .bridge
            .invoke("create_block", Some(id), |cs| cs.create_block(&spec))?;
        self.bridge
            .invoke("set_block_name", Some(id), |cs| cs.set_block_name(&handle, name))?;
        if let Some(image) = block.boot_image() {
            self.bridge
                .invoke("set_boot_image", Some(id), |cs| cs.set_boot_image(&handle, image))?;
        }
        self.bridge.invoke("add_block", Some(id), |cs| {
            cs.add_block(&handle, &self.config.scheduler_user)
        })
    }

    /// Boot a free block after checking its I/O links and users.
    pub fn boot(&self, id: &BlockId) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = get_mut(&mut blocks, id)?;
        if block.error {
            return Err(BlockError::BlockInError(id.clone()));
        }
        if block.state != BlockState::Free {
            return Err(BlockError::InvalidState {
                block_id: id.clone(),
                state: block.state,
                op: "boot",
            });
        }

        self.check_io_links(id)?;
        if let Err(err) = self.sync_block_users(block) {
            tracing::warn!(block_id = %id, error = %err, "user sync failed, booting anyway");
        }

        tracing::info!(block_id = %id, image = ?block.boot_image, "booting block");
        self.bridge
            .invoke("initiate_boot", Some(id), |cs| cs.initiate_boot(id.as_str()))?;
        if self.bridge.completes_synchronously() {
            block.state = BlockState::Ready;
            block.boot_pending = false;
        } else {
            block.state = BlockState::Booting;
            block.boot_pending = true;
        }
        self.persist(&blocks);
        Ok(())
    }

    fn check_io_links(&self, id: &BlockId) -> Result<()> {
        let summary = self.bridge.invoke("check_io_links_summary", Some(id), |cs| {
            cs.check_io_links_summary(id.as_str())
        })?;
        tracing::debug!(
            block_id = %id,
            connected = summary.connected,
            unconnected = summary.unconnected,
            "I/O link summary"
        );

        let connectivity = self
            .bridge
            .invoke("is_io_connected", Some(id), |cs| cs.is_io_connected(id.as_str()))?;
        if connectivity.connected && connectivity.unconnected.is_empty() {
            return Ok(());
        }
        tracing::error!(
            block_id = %id,
            unconnected = ?connectivity.unconnected,
            "block has midplanes without I/O links"
        );
        Err(BlockError::IoLinkUnavailable {
            block_id: id.clone(),
            unconnected: connectivity.unconnected,
        })
    }

    pub fn free(&self, id: &BlockId) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = get_mut(&mut blocks, id)?;
        self.free_block(block)?;
        self.persist(&blocks);
        Ok(())
    }

    pub(crate) fn free_block(&self, block: &mut Block) -> Result<()> {
        if block.state == BlockState::Free {
            return Ok(());
        }
        let id = &block.id;
        tracing::info!(block_id = %id, state = %block.state, "freeing block");
        self.bridge.invoke_tolerating(
            "initiate_free",
            Some(id),
            &[InputCode::InvalidBlockState],
            |cs| cs.initiate_free(id.as_str()),
        )?;
        block.state = if self.bridge.completes_synchronously() {
            BlockState::Free
        } else {
            BlockState::Freeing
        };
        block.boot_pending = false;
        Ok(())
    }

    /// Remove a free, job-less block from the hardware and stop tracking it.
    pub fn remove(&self, id: &BlockId) -> Result<Block> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get(id)
            .ok_or_else(|| BlockError::BlockNotFound(id.clone()))?;
        if !block.jobs.is_empty() {
            return Err(BlockError::JobsStillAssigned {
                block_id: id.clone(),
                count: block.jobs.len(),
            });
        }
        if block.state != BlockState::Free {
            return Err(BlockError::InvalidState {
                block_id: id.clone(),
                state: block.state,
                op: "remove",
            });
        }

        tracing::info!(block_id = %id, "removing block");
        self.bridge.invoke_tolerating(
            "remove_block",
            Some(id),
            &[InputCode::BlockNotFound],
            |cs| cs.remove_block(id.as_str()),
        )?;

        let mut block = blocks
            .shift_remove(id)
            .ok_or_else(|| BlockError::BlockNotFound(id.clone()))?;
        self.release_shape(&blocks, &block.shape);
        block.state = BlockState::Removed;
        self.persist(&blocks);
        Ok(block)
    }

    /// Return the grid reservation of a block that is no longer in `blocks`.
    pub(crate) fn release_shape(&self, blocks: &BlockSet, shape: &BlockShape) {
        if self.allocator.allows_overlap() {
            self.allocator.rebuild(blocks.values().map(|b| &b.shape));
        } else {
            self.allocator.release(shape);
        }
    }

    /// Record a scheduler job on a block. The owner is asked from the
    /// scheduler when not given.
    pub fn assign_job(&self, id: &BlockId, job_id: u32, user: Option<&str>) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = get_mut(&mut blocks, id)?;
        if block.jobs.iter().any(|job| job.job_id == job_id) {
            return Err(BlockError::DuplicateJob {
                block_id: id.clone(),
                job_id,
            });
        }
        let user = match user {
            Some(user) => user.to_string(),
            None => self
                .hooks
                .job_owner(job_id)
                .ok_or(BlockError::UnknownJobOwner { job_id })?,
        };

        tracing::debug!(block_id = %id, job_id, %user, "job assigned");
        block.jobs.push(JobAssignment { job_id, user });
        block.users_synced = false;
        self.persist(&blocks);
        Ok(())
    }

    /// Forget a job. Returns whether it was assigned.
    pub fn release_job(&self, id: &BlockId, job_id: u32) -> Result<bool> {
        let mut blocks = self.blocks.lock();
        let block = get_mut(&mut blocks, id)?;
        let before = block.jobs.len();
        block.jobs.retain(|job| job.job_id != job_id);
        let released = block.jobs.len() != before;
        if released {
            tracing::debug!(block_id = %id, job_id, "job released");
            block.users_synced = false;
            self.persist(&blocks);
        }
        Ok(released)
    }

    /// Clear the sticky error flag.
    pub fn clear_error(&self, id: &BlockId) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let block = get_mut(&mut blocks, id)?;
        if block.error {
            tracing::info!(block_id = %id, "error cleared");
            block.error = false;
            self.persist(&blocks);
        }
        Ok(())
    }

    pub fn block(&self, id: &BlockId) -> Option<Block> {
        self.blocks.lock().get(id).cloned()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Save the tracked set. Failures are logged; the in-memory set stays
    /// authoritative.
    pub(crate) fn persist(&self, blocks: &BlockSet) {
        let snapshot: Vec<Block> = blocks.values().cloned().collect();
        if let Err(err) = self.store.save(&snapshot) {
            tracing::error!(error = %err, "failed to persist block state");
        }
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        self.config.layout.is_dynamic()
    }
}

pub(crate) fn get_mut<'a>(blocks: &'a mut BlockSet, id: &BlockId) -> Result<&'a mut Block> {
    blocks
        .get_mut(id)
        .ok_or_else(|| BlockError::BlockNotFound(id.clone()))
}
