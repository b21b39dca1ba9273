// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixtures for tests: an emulated machine wired to a manager and engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bgq_config::BgqConfig;
use derive_builder::Builder;
use parking_lot::Mutex;

use crate::allocator::{PlacementRequest, PlacementRequestBuilder};
use crate::block::Block;
use crate::facade::EmulatedControlSystem;
use crate::hooks::{BlockStore, SchedulerHooks};
use crate::manager::{BlockManager, BlockManagerBuilder};
use crate::reconcile::ReconciliationEngine;
use crate::topology::{Coord, Extents};

#[derive(Builder)]
#[builder(
    name = "TestSystemBuilder",
    pattern = "owned",
    build_fn(private, name = "build_params")
)]
pub struct TestSystemParams {
    #[builder(default = "[2, 2, 2, 2]")]
    extents: Extents,

    #[builder(default)]
    config: BgqConfig,

    /// Hardware transitions complete inside the initiating call.
    #[builder(default = "true")]
    synchronous: bool,

    /// Midplanes the control system does not describe.
    #[builder(default)]
    missing: Vec<Coord>,

    #[builder(default, setter(strip_option))]
    store: Option<Arc<dyn BlockStore>>,
}

impl TestSystemBuilder {
    pub fn build(self) -> anyhow::Result<TestSystem> {
        let params = self
            .build_params()
            .map_err(|e| anyhow::anyhow!("Failed to build test system: {e}"))?;

        let mut control = EmulatedControlSystem::new(params.extents, &params.config.machine);
        if !params.synchronous {
            control = control.deferred();
        }
        for coord in params.missing {
            control = control.without_midplane(coord);
        }
        let control = Arc::new(control);
        let hooks = Arc::new(RecordingHooks::default());
        let store: Arc<dyn BlockStore> = match params.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::default()),
        };

        let manager = Arc::new(
            BlockManagerBuilder::for_control_system(control.clone(), params.config)?
                .hooks(hooks.clone())
                .store(store.clone())
                .build()?,
        );
        let engine = Arc::new(ReconciliationEngine::new(manager.clone()));
        Ok(TestSystem {
            control,
            manager,
            engine,
            hooks,
            store,
        })
    }
}

pub struct TestSystem {
    pub control: Arc<EmulatedControlSystem>,
    pub manager: Arc<BlockManager>,
    pub engine: Arc<ReconciliationEngine>,
    pub hooks: Arc<RecordingHooks>,
    pub store: Arc<dyn BlockStore>,
}

/// Records every callback.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    failed: Mutex<Vec<u32>>,
    drained: Mutex<Vec<(String, String)>>,
    owners: Mutex<HashMap<u32, String>>,
}

impl RecordingHooks {
    pub fn set_owner(&self, job_id: u32, user: &str) {
        self.owners.lock().insert(job_id, user.to_string());
    }

    pub fn failed_jobs(&self) -> Vec<u32> {
        self.failed.lock().clone()
    }

    /// `(node_range, reason)` of every drain.
    pub fn drained(&self) -> Vec<(String, String)> {
        self.drained.lock().clone()
    }
}

impl SchedulerHooks for RecordingHooks {
    fn job_failed(&self, job_id: u32) {
        self.failed.lock().push(job_id);
    }

    fn drain_nodes(&self, node_range: &str, reason: &str) {
        self.drained
            .lock()
            .push((node_range.to_string(), reason.to_string()));
    }

    fn job_owner(&self, job_id: u32) -> Option<String> {
        self.owners.lock().get(&job_id).cloned()
    }
}

/// Keeps the last saved block set in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<Vec<Block>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        Self {
            blocks: Mutex::new(blocks),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl BlockStore for MemoryStore {
    fn save(&self, blocks: &[Block]) -> anyhow::Result<()> {
        *self.blocks.lock() = blocks.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<Block>> {
        Ok(self.blocks.lock().clone())
    }
}

/// Full block of `midplanes` midplanes (512 cnodes each).
pub fn full_request(midplanes: u32) -> PlacementRequest {
    PlacementRequestBuilder::default()
        .node_count(midplanes * 512)
        .build()
        .unwrap_or_else(|e| panic!("invalid request: {e}"))
}

pub fn small_request(cnodes: u32) -> PlacementRequest {
    PlacementRequestBuilder::default()
        .node_count(cnodes)
        .small(true)
        .build()
        .unwrap_or_else(|e| panic!("invalid request: {e}"))
}
