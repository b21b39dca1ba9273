// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use bgq_config::{BridgeConfig, MachineConfig};
use parking_lot::Mutex;

use super::{ControlSystem, FacadeError, FacadeErrorKind, InputCode};
use crate::block::BlockId;
use crate::error::{BlockError, Result};
use crate::topology::TopologyGrid;

/// Tracing target of every control-system call.
pub const FACADE_TARGET: &str = "bgq_blocks::facade";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    Uninitialized,
    Ready,
}

/// Owns a [`ControlSystem`] and its initialization state.
pub struct Bridge {
    control: Arc<dyn ControlSystem>,
    state: Mutex<FacadeState>,
    properties: Option<PathBuf>,
}

impl Bridge {
    pub fn new(control: Arc<dyn ControlSystem>, config: &BridgeConfig) -> Self {
        Self {
            control,
            state: Mutex::new(FacadeState::Uninitialized),
            properties: config.properties_file.clone(),
        }
    }

    pub fn state(&self) -> FacadeState {
        *self.state.lock()
    }

    /// Initialize the control system once. Later calls are no-ops.
    pub fn ensure_initialized(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == FacadeState::Ready {
            return Ok(());
        }
        let result = self.control.init(self.properties.as_deref());
        translate("init", None, result)?;
        *state = FacadeState::Ready;
        tracing::info!(target: FACADE_TARGET, properties = ?self.properties, "control system initialized");
        Ok(())
    }

    pub fn completes_synchronously(&self) -> bool {
        self.control.completes_synchronously()
    }

    /// Run one control-system call, translating its failure.
    pub fn invoke<T>(
        &self,
        op: &'static str,
        block: Option<&BlockId>,
        call: impl FnOnce(&dyn ControlSystem) -> std::result::Result<T, FacadeError>,
    ) -> Result<T> {
        self.ensure_initialized()?;
        tracing::trace!(target: FACADE_TARGET, op, block_id = ?block.map(BlockId::as_str), "calling");
        translate(op, block, call(self.control.as_ref()))
    }

    /// Like [`Bridge::invoke`], but input errors with one of the `benign`
    /// codes are logged at debug and reported as `Ok(None)`.
    pub fn invoke_tolerating<T>(
        &self,
        op: &'static str,
        block: Option<&BlockId>,
        benign: &[InputCode],
        call: impl FnOnce(&dyn ControlSystem) -> std::result::Result<T, FacadeError>,
    ) -> Result<Option<T>> {
        self.ensure_initialized()?;
        match call(self.control.as_ref()) {
            Ok(value) => Ok(Some(value)),
            Err(err) if benign.iter().any(|code| err.is_input(*code)) => {
                tracing::debug!(
                    target: FACADE_TARGET,
                    op,
                    block_id = ?block.map(BlockId::as_str),
                    "ignoring benign error: {}",
                    err.message
                );
                Ok(None)
            }
            Err(err) => translate(op, block, Err(err)),
        }
    }

    /// Build the topology grid from the machine size and per-midplane
    /// descriptions.
    pub fn topology(&self, machine: &MachineConfig) -> Result<TopologyGrid> {
        let extents = self.invoke("machine_size", None, |cs| cs.machine_size())?;
        let grid = TopologyGrid::build(extents, |coord| {
            self.invoke("describe_midplane", None, |cs| cs.describe_midplane(coord))
        })?;

        for unit in grid.units() {
            if unit.nodeboards().len() != machine.nodecards_per_midplane as usize {
                tracing::warn!(
                    target: FACADE_TARGET,
                    "midplane {} reports {} nodeboards, expected {}",
                    unit.location(),
                    unit.nodeboards().len(),
                    machine.nodecards_per_midplane
                );
            }
        }
        tracing::info!(
            target: FACADE_TARGET,
            ?extents,
            midplanes = grid.midplane_count(),
            "machine topology loaded"
        );
        Ok(grid)
    }
}

fn translate<T>(
    op: &'static str,
    block: Option<&BlockId>,
    result: std::result::Result<T, FacadeError>,
) -> Result<T> {
    let err = match result {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let block_id = block.map(BlockId::as_str);
    match err.kind {
        FacadeErrorKind::Unknown => {
            tracing::error!(target: FACADE_TARGET, block_id, "Unknown error from {op}");
            Err(BlockError::OperationFailed {
                op,
                block_id: block.cloned(),
            })
        }
        kind => {
            tracing::error!(target: FACADE_TARGET, block_id, %kind, "{op} failed: {}", err.message);
            let err = match (err.block.is_none(), block) {
                (true, Some(id)) => err.with_block(id.as_str()),
                _ => err,
            };
            Err(BlockError::Facade(err))
        }
    }
}
