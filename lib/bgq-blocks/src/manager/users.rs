// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use super::{get_mut, BlockManager};
use crate::block::{Block, BlockId};
use crate::error::{BlockError, Result};
use crate::facade::InputCode;

/// Users changed by one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl UserSyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl BlockManager {
    /// Make the block's authorized users match the owners of its jobs.
    ///
    /// The scheduler's service account is left alone. Nothing is sent to the
    /// control system when the last sync is still current.
    pub fn sync_users(&self, id: &BlockId) -> Result<UserSyncReport> {
        let mut blocks = self.blocks.lock();
        let block = get_mut(&mut blocks, id)?;
        let report = self.sync_block_users(block)?;
        if !report.is_empty() {
            self.persist(&blocks);
        }
        Ok(report)
    }

    pub(super) fn sync_block_users(&self, block: &mut Block) -> Result<UserSyncReport> {
        let desired = block.job_owners(&self.config.scheduler_user);
        if block.users_synced && block.authorized_users == desired {
            tracing::debug!(block_id = %block.id, "users already in sync");
            return Ok(UserSyncReport::default());
        }

        let report = self
            .push_users(&block.id, &desired)
            .map_err(|source| BlockError::UserSync {
                block_id: block.id.clone(),
                source: Box::new(source),
            })?;
        block.authorized_users = desired;
        block.users_synced = true;
        Ok(report)
    }

    fn push_users(&self, id: &BlockId, desired: &BTreeSet<String>) -> Result<UserSyncReport> {
        let name = id.as_str();
        let service = self.config.scheduler_user.as_str();
        let current = self
            .bridge
            .invoke("get_users", Some(id), |cs| cs.get_users(name))?;

        let mut report = UserSyncReport::default();
        for user in current
            .iter()
            .filter(|u| u.as_str() != service && !desired.contains(u.as_str()))
        {
            tracing::info!(block_id = name, user = %user, "removing user");
            let removed = self.bridge.invoke_tolerating(
                "remove_user",
                Some(id),
                &[InputCode::UserNotFound],
                |cs| cs.remove_user(name, user),
            )?;
            if removed.is_some() {
                report.removed.push(user.clone());
            }
        }

        for user in desired.iter().filter(|u| !current.contains(u)) {
            if self
                .bridge
                .invoke("is_authorized", Some(id), |cs| cs.is_authorized(name, user))?
            {
                continue;
            }
            tracing::info!(block_id = name, user = %user, "adding user");
            let added = self.bridge.invoke_tolerating(
                "add_user",
                Some(id),
                &[InputCode::UserAlreadyExists],
                |cs| cs.add_user(name, user),
            )?;
            if added.is_some() {
                report.added.push(user.clone());
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::BlockError;
    use crate::facade::{ControlSystem, FacadeErrorKind};
    use crate::testing::{full_request, TestSystemBuilder};

    #[test]
    fn test_sync_is_idempotent() {
        let system = TestSystemBuilder::default().build().unwrap();
        let id = system.manager.allocate(&full_request(1)).unwrap().id().clone();
        system.manager.assign_job(&id, 1, Some("alice")).unwrap();
        system.manager.assign_job(&id, 2, Some("bob")).unwrap();

        let report = system.manager.sync_users(&id).unwrap();
        assert_eq!(report.added, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(system.control.users(id.as_str()), vec!["alice", "bob"]);

        system.control.clear_calls();
        let again = system.manager.sync_users(&id).unwrap();
        assert!(again.is_empty());
        assert!(system.control.calls().is_empty());
    }

    #[test]
    fn test_job_change_invalidates_cache() {
        let system = TestSystemBuilder::default().build().unwrap();
        let id = system.manager.allocate(&full_request(1)).unwrap().id().clone();
        system.manager.assign_job(&id, 1, Some("alice")).unwrap();
        system.manager.sync_users(&id).unwrap();

        system.manager.release_job(&id, 1).unwrap();
        system.manager.assign_job(&id, 2, Some("carol")).unwrap();
        let report = system.manager.sync_users(&id).unwrap();
        assert_eq!(report.added, vec!["carol".to_string()]);
        assert_eq!(report.removed, vec!["alice".to_string()]);
        assert_eq!(
            system
                .manager
                .block(&id)
                .unwrap()
                .authorized_users()
                .iter()
                .collect::<Vec<_>>(),
            vec!["carol"]
        );
    }

    #[test]
    fn test_service_account_untouched() {
        let system = TestSystemBuilder::default().build().unwrap();
        let id = system.manager.allocate(&full_request(1)).unwrap().id().clone();
        system.control.add_user(id.as_str(), "slurm").unwrap();
        system.manager.assign_job(&id, 1, Some("slurm")).unwrap();
        system.manager.assign_job(&id, 2, Some("dave")).unwrap();

        system.manager.sync_users(&id).unwrap();
        assert_eq!(system.control.users(id.as_str()), vec!["dave", "slurm"]);

        system.manager.release_job(&id, 2).unwrap();
        let report = system.manager.sync_users(&id).unwrap();
        assert_eq!(report.removed, vec!["dave".to_string()]);
        assert_eq!(system.control.users(id.as_str()), vec!["slurm"]);
    }

    #[test]
    fn test_sync_failure_is_wrapped() {
        let system = TestSystemBuilder::default().build().unwrap();
        let id = system.manager.allocate(&full_request(1)).unwrap().id().clone();
        system.manager.assign_job(&id, 1, Some("alice")).unwrap();
        system
            .control
            .fail_next("get_users", FacadeErrorKind::Internal);

        let err = system.manager.sync_users(&id).unwrap_err();
        assert!(matches!(err, BlockError::UserSync { .. }));
        // the cache stays invalid, so the next sync retries
        assert_eq!(
            system.manager.sync_users(&id).unwrap().added,
            vec!["alice".to_string()]
        );
    }
}
