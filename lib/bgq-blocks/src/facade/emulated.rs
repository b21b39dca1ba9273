// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory control system.
//!
//! Stands in for the hardware bridge on machines without one. Transitions
//! complete inside the initiating call unless built with
//! [`EmulatedControlSystem::deferred`], in which case they stay in progress
//! until [`EmulatedControlSystem::complete_transitions`] runs. Failures can be
//! injected per operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use bgq_config::MachineConfig;
use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{
    BlockCreateSpec, BlockFilter, BlockHandle, ControlSystem, FacadeError, FacadeErrorKind,
    HardwareBlock, HardwareJob, HardwareJobStatus, HardwareStatus, InputCode, IoConnectivity,
    IoLinkSummary, JobFilter, MidplaneDescription,
};
use crate::topology::{
    midplane_location, nodeboard_location, Connectivity, Coord, CoordIter, Extents,
    SYSTEM_DIMENSIONS,
};

struct PendingBlock {
    spec: BlockCreateSpec,
    name: Option<String>,
    image: Option<String>,
}

struct EmulatedBlock {
    hw: HardwareBlock,
    users: BTreeSet<String>,
}

#[derive(Default)]
struct EmulatedState {
    extents: Extents,
    midplanes: BTreeMap<Coord, MidplaneDescription>,
    /// nodeboard location -> midplane location
    nodeboard_owner: HashMap<String, String>,
    pending: HashMap<u64, PendingBlock>,
    next_handle: u64,
    blocks: IndexMap<String, EmulatedBlock>,
    jobs: Vec<HardwareJob>,
    next_job: u64,
    one_shot: HashMap<&'static str, VecDeque<FacadeErrorKind>>,
    persistent: HashMap<&'static str, FacadeErrorKind>,
    io_unconnected: HashMap<String, Vec<String>>,
    calls: Vec<&'static str>,
}

impl EmulatedState {
    /// Record the call and fire any injected failure.
    fn enter(&mut self, op: &'static str) -> Result<(), FacadeError> {
        self.calls.push(op);
        let injected = self
            .one_shot
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.persistent.get(op).copied());
        match injected {
            Some(kind) => Err(FacadeError::new(kind, op, "injected failure")),
            None => Ok(()),
        }
    }

    fn block_mut(&mut self, op: &'static str, name: &str) -> Result<&mut EmulatedBlock, FacadeError> {
        self.blocks.get_mut(name).ok_or_else(|| {
            FacadeError::input(InputCode::BlockNotFound, op, format!("block {name} not found"))
                .with_block(name)
        })
    }

    fn pending_mut(
        &mut self,
        op: &'static str,
        handle: &BlockHandle,
    ) -> Result<&mut PendingBlock, FacadeError> {
        self.pending.get_mut(&handle.0).ok_or_else(|| {
            FacadeError::input(InputCode::Other, op, format!("unknown handle {}", handle.0))
        })
    }

    fn is_midplane(&self, location: &str) -> bool {
        self.midplanes.values().any(|mp| mp.location == location)
    }
}

pub struct EmulatedControlSystem {
    machine: MachineConfig,
    synchronous: bool,
    state: Mutex<EmulatedState>,
}

impl EmulatedControlSystem {
    /// A fully populated machine of the given extents.
    pub fn new(extents: Extents, machine: &MachineConfig) -> Self {
        let mut state = EmulatedState {
            extents,
            ..Default::default()
        };
        for coord in CoordIter::new(extents) {
            let location = midplane_location(&coord, &extents);
            let nodeboards: Vec<String> = (0..machine.nodecards_per_midplane)
                .map(|i| nodeboard_location(&location, i))
                .collect();
            for nb in &nodeboards {
                state.nodeboard_owner.insert(nb.clone(), location.clone());
            }
            state.midplanes.insert(
                coord,
                MidplaneDescription {
                    location,
                    nodeboards,
                },
            );
        }
        Self {
            machine: machine.clone(),
            synchronous: true,
            state: Mutex::new(state),
        }
    }

    /// Transitions stay in progress until [`Self::complete_transitions`].
    pub fn deferred(mut self) -> Self {
        self.synchronous = false;
        self
    }

    /// Leave a midplane undescribed, as on a partial system.
    pub fn without_midplane(self, coord: Coord) -> Self {
        {
            let mut state = self.state.lock();
            if let Some(mp) = state.midplanes.remove(&coord) {
                for nb in mp.nodeboards {
                    state.nodeboard_owner.remove(&nb);
                }
            }
        }
        self
    }

    /// Finish every in-progress boot and free.
    pub fn complete_transitions(&self) {
        let mut state = self.state.lock();
        for block in state.blocks.values_mut() {
            block.hw.status = match block.hw.status {
                HardwareStatus::Allocated | HardwareStatus::Booting => HardwareStatus::Initialized,
                HardwareStatus::Terminating => HardwareStatus::Free,
                other => other,
            };
        }
    }

    pub fn set_status(&self, block: &str, status: HardwareStatus) {
        if let Some(b) = self.state.lock().blocks.get_mut(block) {
            b.hw.status = status;
        }
    }

    /// Place a block directly into the inventory, as if created elsewhere.
    pub fn insert_block(&self, hw: HardwareBlock) {
        self.state.lock().blocks.insert(
            hw.name.clone(),
            EmulatedBlock {
                hw,
                users: BTreeSet::new(),
            },
        );
    }

    /// Make a block vanish from the inventory.
    pub fn drop_block(&self, block: &str) -> Option<HardwareBlock> {
        self.state.lock().blocks.shift_remove(block).map(|b| b.hw)
    }

    pub fn hardware_block(&self, block: &str) -> Option<HardwareBlock> {
        self.state.lock().blocks.get(block).map(|b| b.hw.clone())
    }

    pub fn block_names(&self) -> Vec<String> {
        self.state.lock().blocks.keys().cloned().collect()
    }

    pub fn users(&self, block: &str) -> Vec<String> {
        self.state
            .lock()
            .blocks
            .get(block)
            .map(|b| b.users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Start a hardware job on `block`. Returns the hardware job id.
    pub fn add_job(&self, block: &str, scheduler_job_id: Option<u32>, user: &str) -> u64 {
        let mut state = self.state.lock();
        state.next_job += 1;
        let id = state.next_job;
        state.jobs.push(HardwareJob {
            id,
            block: block.to_string(),
            status: HardwareJobStatus::Running,
            scheduler_job_id,
            user: user.to_string(),
        });
        id
    }

    pub fn set_job_status(&self, job: u64, status: HardwareJobStatus) {
        if let Some(j) = self.state.lock().jobs.iter_mut().find(|j| j.id == job) {
            j.status = status;
        }
    }

    pub fn finish_job(&self, job: u64) {
        self.state.lock().jobs.retain(|j| j.id != job);
    }

    pub fn set_io_unconnected(&self, block: &str, midplanes: Vec<String>) {
        self.state
            .lock()
            .io_unconnected
            .insert(block.to_string(), midplanes);
    }

    /// Fail the next call of `op`.
    pub fn fail_next(&self, op: &'static str, kind: FacadeErrorKind) {
        self.state
            .lock()
            .one_shot
            .entry(op)
            .or_default()
            .push_back(kind);
    }

    /// Fail every call of `op` until [`Self::clear_failures`].
    pub fn fail_always(&self, op: &'static str, kind: FacadeErrorKind) {
        self.state.lock().persistent.insert(op, kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.one_shot.clear();
        state.persistent.clear();
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn describe(&self, state: &EmulatedState, pending: PendingBlock, name: String) -> HardwareBlock {
        match pending.spec {
            BlockCreateSpec::Full {
                midplanes,
                passthrough,
                connectivity,
            } => HardwareBlock {
                name,
                status: HardwareStatus::Free,
                cnode_count: midplanes.len() as u32 * self.machine.cnodes_per_midplane(),
                midplanes,
                passthrough,
                nodeboards: Vec::new(),
                connectivity,
                boot_image: pending.image,
                small: false,
            },
            BlockCreateSpec::Small { nodeboards } => {
                let midplanes = nodeboards
                    .first()
                    .and_then(|nb| state.nodeboard_owner.get(nb))
                    .cloned()
                    .into_iter()
                    .collect();
                HardwareBlock {
                    name,
                    status: HardwareStatus::Free,
                    cnode_count: nodeboards.len() as u32 * self.machine.cnodes_per_nodecard,
                    midplanes,
                    passthrough: Vec::new(),
                    nodeboards,
                    connectivity: [Connectivity::Mesh; SYSTEM_DIMENSIONS],
                    boot_image: pending.image,
                    small: true,
                }
            }
        }
    }
}

impl ControlSystem for EmulatedControlSystem {
    fn init(&self, _properties: Option<&Path>) -> Result<(), FacadeError> {
        self.state.lock().enter("init")
    }

    fn completes_synchronously(&self) -> bool {
        self.synchronous
    }

    fn machine_size(&self) -> Result<Extents, FacadeError> {
        let mut state = self.state.lock();
        state.enter("machine_size")?;
        Ok(state.extents)
    }

    fn describe_midplane(
        &self,
        coord: &Coord,
    ) -> Result<Option<MidplaneDescription>, FacadeError> {
        let mut state = self.state.lock();
        state.enter("describe_midplane")?;
        Ok(state.midplanes.get(coord).cloned())
    }

    fn create_block(&self, spec: &BlockCreateSpec) -> Result<BlockHandle, FacadeError> {
        const OP: &str = "create_block";
        let mut state = self.state.lock();
        state.enter(OP)?;

        let unknown = match spec {
            BlockCreateSpec::Full {
                midplanes,
                passthrough,
                ..
            } => midplanes
                .iter()
                .chain(passthrough.iter())
                .find(|loc| !state.is_midplane(loc))
                .cloned(),
            BlockCreateSpec::Small { nodeboards } => nodeboards
                .iter()
                .find(|loc| !state.nodeboard_owner.contains_key(*loc))
                .cloned(),
        };
        if let Some(loc) = unknown {
            return Err(FacadeError::input(
                InputCode::InvalidLocation,
                OP,
                format!("unknown location {loc}"),
            ));
        }

        state.next_handle += 1;
        let handle = state.next_handle;
        state.pending.insert(
            handle,
            PendingBlock {
                spec: spec.clone(),
                name: None,
                image: None,
            },
        );
        Ok(BlockHandle(handle))
    }

    fn set_block_name(&self, handle: &BlockHandle, name: &str) -> Result<(), FacadeError> {
        let mut state = self.state.lock();
        state.enter("set_block_name")?;
        state.pending_mut("set_block_name", handle)?.name = Some(name.to_string());
        Ok(())
    }

    fn set_boot_image(&self, handle: &BlockHandle, image: &str) -> Result<(), FacadeError> {
        let mut state = self.state.lock();
        state.enter("set_boot_image")?;
        state.pending_mut("set_boot_image", handle)?.image = Some(image.to_string());
        Ok(())
    }

    fn add_block(&self, handle: &BlockHandle, _owner: &str) -> Result<(), FacadeError> {
        const OP: &str = "add_block";
        let mut state = self.state.lock();
        state.enter(OP)?;

        let name = state
            .pending_mut(OP, handle)?
            .name
            .clone()
            .ok_or_else(|| FacadeError::input(InputCode::Other, OP, "block has no name"))?;
        if state.blocks.contains_key(&name) {
            return Err(FacadeError::input(
                InputCode::DuplicateBlock,
                OP,
                format!("block {name} already exists"),
            )
            .with_block(name));
        }
        let Some(pending) = state.pending.remove(&handle.0) else {
            return Err(FacadeError::input(InputCode::Other, OP, "unknown handle"));
        };
        let hw = self.describe(&state, pending, name.clone());
        state.blocks.insert(
            name,
            EmulatedBlock {
                hw,
                users: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn initiate_boot(&self, block: &str) -> Result<(), FacadeError> {
        const OP: &str = "initiate_boot";
        let synchronous = self.synchronous;
        let mut state = self.state.lock();
        state.enter(OP)?;
        let b = state.block_mut(OP, block)?;
        if b.hw.status != HardwareStatus::Free {
            return Err(FacadeError::input(
                InputCode::InvalidBlockState,
                OP,
                format!("block {block} is {:?}", b.hw.status),
            )
            .with_block(block));
        }
        b.hw.status = if synchronous {
            HardwareStatus::Initialized
        } else {
            HardwareStatus::Booting
        };
        Ok(())
    }

    fn initiate_free(&self, block: &str) -> Result<(), FacadeError> {
        const OP: &str = "initiate_free";
        let synchronous = self.synchronous;
        let mut state = self.state.lock();
        state.enter(OP)?;
        let b = state.block_mut(OP, block)?;
        if b.hw.status == HardwareStatus::Free {
            return Err(FacadeError::input(
                InputCode::InvalidBlockState,
                OP,
                format!("block {block} is already free"),
            )
            .with_block(block));
        }
        b.hw.status = if synchronous {
            HardwareStatus::Free
        } else {
            HardwareStatus::Terminating
        };
        state.jobs.retain(|j| j.block != block);
        Ok(())
    }

    fn remove_block(&self, block: &str) -> Result<(), FacadeError> {
        const OP: &str = "remove_block";
        let mut state = self.state.lock();
        state.enter(OP)?;
        let b = state.block_mut(OP, block)?;
        if b.hw.status != HardwareStatus::Free {
            return Err(FacadeError::input(
                InputCode::InvalidBlockState,
                OP,
                format!("block {block} is {:?}", b.hw.status),
            )
            .with_block(block));
        }
        state.blocks.shift_remove(block);
        Ok(())
    }

    fn check_io_links_summary(&self, block: &str) -> Result<IoLinkSummary, FacadeError> {
        const OP: &str = "check_io_links_summary";
        let mut state = self.state.lock();
        state.enter(OP)?;
        let total = state.block_mut(OP, block)?.hw.midplanes.len() as u32;
        let unconnected = state
            .io_unconnected
            .get(block)
            .map_or(0, |mps| mps.len() as u32);
        Ok(IoLinkSummary {
            connected: total.saturating_sub(unconnected),
            unconnected,
        })
    }

    fn is_io_connected(&self, block: &str) -> Result<IoConnectivity, FacadeError> {
        const OP: &str = "is_io_connected";
        let mut state = self.state.lock();
        state.enter(OP)?;
        state.block_mut(OP, block)?;
        let unconnected = state.io_unconnected.get(block).cloned().unwrap_or_default();
        Ok(IoConnectivity {
            connected: unconnected.is_empty(),
            unconnected,
        })
    }

    fn get_users(&self, block: &str) -> Result<Vec<String>, FacadeError> {
        let mut state = self.state.lock();
        state.enter("get_users")?;
        Ok(state
            .block_mut("get_users", block)?
            .users
            .iter()
            .cloned()
            .collect())
    }

    fn add_user(&self, block: &str, user: &str) -> Result<(), FacadeError> {
        const OP: &str = "add_user";
        let mut state = self.state.lock();
        state.enter(OP)?;
        if !state.block_mut(OP, block)?.users.insert(user.to_string()) {
            return Err(FacadeError::input(
                InputCode::UserAlreadyExists,
                OP,
                format!("{user} already authorized"),
            )
            .with_block(block));
        }
        Ok(())
    }

    fn remove_user(&self, block: &str, user: &str) -> Result<(), FacadeError> {
        const OP: &str = "remove_user";
        let mut state = self.state.lock();
        state.enter(OP)?;
        if !state.block_mut(OP, block)?.users.remove(user) {
            return Err(FacadeError::input(
                InputCode::UserNotFound,
                OP,
                format!("{user} not authorized"),
            )
            .with_block(block));
        }
        Ok(())
    }

    fn is_authorized(&self, block: &str, user: &str) -> Result<bool, FacadeError> {
        const OP: &str = "is_authorized";
        let mut state = self.state.lock();
        state.enter(OP)?;
        Ok(state.block_mut(OP, block)?.users.contains(user))
    }

    fn list_blocks(&self, filter: &BlockFilter) -> Result<Vec<HardwareBlock>, FacadeError> {
        let mut state = self.state.lock();
        state.enter("list_blocks")?;
        Ok(state
            .blocks
            .values()
            .map(|b| {
                let mut hw = b.hw.clone();
                if !filter.extended_info {
                    hw.midplanes.clear();
                    hw.passthrough.clear();
                    hw.nodeboards.clear();
                }
                hw
            })
            .collect())
    }

    fn list_jobs_on_block(&self, filter: &JobFilter) -> Result<Vec<HardwareJob>, FacadeError> {
        const OP: &str = "list_jobs_on_block";
        let mut state = self.state.lock();
        state.enter(OP)?;
        state.block_mut(OP, &filter.block)?;
        Ok(state
            .jobs
            .iter()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> EmulatedControlSystem {
        EmulatedControlSystem::new([1, 1, 1, 2], &MachineConfig::default())
    }

    fn create(control: &EmulatedControlSystem, name: &str) {
        let handle = control
            .create_block(&BlockCreateSpec::Full {
                midplanes: vec!["R00-M0".to_string()],
                passthrough: vec![],
                connectivity: [Connectivity::Torus; 4],
            })
            .unwrap();
        control.set_block_name(&handle, name).unwrap();
        control.add_block(&handle, "slurm").unwrap();
    }

    #[test]
    fn test_create_and_list() {
        let control = control();
        create(&control, "RMP1");

        let blocks = control
            .list_blocks(&BlockFilter {
                extended_info: true,
            })
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].midplanes, vec!["R00-M0".to_string()]);
        assert_eq!(blocks[0].cnode_count, 512);
        assert_eq!(blocks[0].status, HardwareStatus::Free);

        let brief = control.list_blocks(&BlockFilter::default()).unwrap();
        assert!(brief[0].midplanes.is_empty());
    }

    #[test]
    fn test_unknown_location_rejected() {
        let control = control();
        let err = control
            .create_block(&BlockCreateSpec::Small {
                nodeboards: vec!["R77-M0-N00".to_string()],
            })
            .unwrap_err();
        assert!(err.is_input(InputCode::InvalidLocation));
    }

    #[test]
    fn test_duplicate_block() {
        let control = control();
        create(&control, "RMP1");
        let handle = control
            .create_block(&BlockCreateSpec::Small {
                nodeboards: vec!["R00-M1-N00".to_string()],
            })
            .unwrap();
        control.set_block_name(&handle, "RMP1").unwrap();
        let err = control.add_block(&handle, "slurm").unwrap_err();
        assert!(err.is_input(InputCode::DuplicateBlock));
    }

    #[test]
    fn test_deferred_transitions() {
        let control = control().deferred();
        create(&control, "RMP1");
        control.initiate_boot("RMP1").unwrap();
        assert_eq!(
            control.hardware_block("RMP1").unwrap().status,
            HardwareStatus::Booting
        );
        control.complete_transitions();
        assert_eq!(
            control.hardware_block("RMP1").unwrap().status,
            HardwareStatus::Initialized
        );

        control.initiate_free("RMP1").unwrap();
        assert_eq!(
            control.hardware_block("RMP1").unwrap().status,
            HardwareStatus::Terminating
        );
        control.complete_transitions();
        assert_eq!(
            control.hardware_block("RMP1").unwrap().status,
            HardwareStatus::Free
        );
        let err = control.initiate_free("RMP1").unwrap_err();
        assert!(err.is_input(InputCode::InvalidBlockState));
    }

    #[test]
    fn test_user_errors() {
        let control = control();
        create(&control, "RMP1");
        control.add_user("RMP1", "alice").unwrap();
        assert!(control
            .add_user("RMP1", "alice")
            .unwrap_err()
            .is_input(InputCode::UserAlreadyExists));
        assert!(control.is_authorized("RMP1", "alice").unwrap());
        control.remove_user("RMP1", "alice").unwrap();
        assert!(control
            .remove_user("RMP1", "alice")
            .unwrap_err()
            .is_input(InputCode::UserNotFound));
    }

    #[test]
    fn test_injected_failures() {
        let control = control();
        control.fail_next("machine_size", FacadeErrorKind::Database);
        assert_eq!(
            control.machine_size().unwrap_err().kind,
            FacadeErrorKind::Database
        );
        assert!(control.machine_size().is_ok());

        control.fail_always("machine_size", FacadeErrorKind::Internal);
        assert!(control.machine_size().is_err());
        assert!(control.machine_size().is_err());
        control.clear_failures();
        assert!(control.machine_size().is_ok());
        assert_eq!(control.call_count("machine_size"), 5);
    }

    #[test]
    fn test_jobs_filtering() {
        let control = control();
        create(&control, "RMP1");
        let job = control.add_job("RMP1", Some(42), "alice");
        let filter = JobFilter::active("RMP1", Some(42));
        assert_eq!(control.list_jobs_on_block(&filter).unwrap().len(), 1);

        control.set_job_status(job, HardwareJobStatus::Terminated);
        assert!(control.list_jobs_on_block(&filter).unwrap().is_empty());

        let err = control
            .list_jobs_on_block(&JobFilter::active("RMP9", None))
            .unwrap_err();
        assert!(err.is_input(InputCode::BlockNotFound));
    }
}
