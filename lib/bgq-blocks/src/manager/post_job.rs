// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cleanup after a scheduler job ends.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use super::{get_mut, BlockManager, BlockSet};
use crate::block::BlockId;
use crate::error::Result;
use crate::facade::{InputCode, JobFilter};

const DRAIN_REASON: &str = "Couldn't remove job";

impl BlockManager {
    /// Wait for the hardware jobs of `job_id` (or all jobs) to leave the
    /// block, then reset it.
    ///
    /// Blocks the calling thread while polling. No lock is held during the
    /// wait.
    pub fn post_job(&self, id: &BlockId, job_id: Option<u32>) -> Result<()> {
        if !self.wait_for_jobs(id, job_id) {
            self.drain(id);
        }

        let _job_guard = job_id.map(|_| self.job_lock.read());
        let mut blocks = self.blocks.lock();
        if !blocks.contains_key(id) {
            if self.is_dynamic() {
                tracing::debug!(block_id = %id, "block already gone after job");
            } else {
                tracing::warn!(block_id = %id, "block vanished while its job finished");
            }
            return Ok(());
        }
        self.reset_locked(&mut blocks, id, job_id)
    }

    /// [`BlockManager::post_job`] on a blocking worker thread.
    ///
    /// Must be called from within a tokio runtime.
    pub fn post_job_detached(
        self: &Arc<Self>,
        id: BlockId,
        job_id: Option<u32>,
    ) -> JoinHandle<Result<()>> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.post_job(&id, job_id))
    }

    /// Drop `job_id` (or every job), re-sync users and free the block once
    /// nothing is left on it.
    pub fn reset(&self, id: &BlockId, job_id: Option<u32>) -> Result<()> {
        let mut blocks = self.blocks.lock();
        self.reset_locked(&mut blocks, id, job_id)
    }

    fn reset_locked(&self, blocks: &mut BlockSet, id: &BlockId, job_id: Option<u32>) -> Result<()> {
        let block = get_mut(blocks, id)?;
        match job_id {
            Some(job_id) => block.jobs.retain(|job| job.job_id != job_id),
            None => block.jobs.clear(),
        }
        block.users_synced = false;
        if let Err(err) = self.sync_block_users(block) {
            tracing::warn!(block_id = %id, error = %err, "user sync failed during reset");
        }

        let result = if block.jobs.is_empty() {
            self.free_block(block)
        } else {
            tracing::debug!(block_id = %id, remaining = block.jobs.len(), "jobs remain, not freeing");
            Ok(())
        };
        self.persist(blocks);
        result
    }

    /// Poll until no matching hardware job is active. Returns false when the
    /// drain window ran out first.
    fn wait_for_jobs(&self, id: &BlockId, job_id: Option<u32>) -> bool {
        let filter = JobFilter::active(id.as_str(), job_id);
        let interval = self.config.poll.job_poll_interval();
        let deadline = self
            .config
            .poll
            .job_drain_timeout()
            .map(|timeout| Instant::now() + timeout);

        loop {
            let polled = self.bridge.invoke_tolerating(
                "list_jobs_on_block",
                Some(id),
                &[InputCode::BlockNotFound],
                |cs| cs.list_jobs_on_block(&filter),
            );
            match polled {
                Ok(None) => return true,
                Ok(Some(jobs)) if jobs.is_empty() => return true,
                Ok(Some(jobs)) => {
                    tracing::debug!(block_id = %id, ?job_id, remaining = jobs.len(), "waiting for jobs");
                }
                Err(err) => {
                    tracing::warn!(block_id = %id, error = %err, "polling jobs failed");
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            std::thread::sleep(interval);
        }
    }

    fn drain(&self, id: &BlockId) {
        let node_range = self.blocks.lock().get(id).map(|b| b.node_range.clone());
        match node_range {
            Some(range) => {
                tracing::error!(block_id = %id, node_range = %range, "jobs did not finish, draining nodes");
                self.hooks.drain_nodes(&range, DRAIN_REASON);
            }
            None => tracing::warn!(block_id = %id, "jobs did not finish on an untracked block"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use bgq_config::BgqConfig;

    use crate::block::BlockState;
    use crate::facade::HardwareJobStatus;
    use crate::testing::{full_request, TestSystemBuilder};

    fn fast_config(drain_timeout_secs: Option<u64>) -> BgqConfig {
        let mut config = BgqConfig::default();
        config.poll.job_poll_interval_ms = 10;
        config.poll.job_drain_timeout_secs = drain_timeout_secs;
        config
    }

    #[test]
    fn test_reset_frees_when_last_job_leaves() {
        let system = TestSystemBuilder::default().build().unwrap();
        let id = system.manager.allocate(&full_request(1)).unwrap().id().clone();
        system.manager.assign_job(&id, 1, Some("alice")).unwrap();
        system.manager.assign_job(&id, 2, Some("bob")).unwrap();
        system.manager.boot(&id).unwrap();

        system.manager.reset(&id, Some(1)).unwrap();
        let block = system.manager.block(&id).unwrap();
        assert_eq!(block.state(), BlockState::Ready);
        assert_eq!(system.control.users(id.as_str()), vec!["bob"]);

        system.manager.reset(&id, Some(2)).unwrap();
        let block = system.manager.block(&id).unwrap();
        assert_eq!(block.state(), BlockState::Free);
        assert!(block.jobs().is_empty());
        assert!(system.control.users(id.as_str()).is_empty());
    }

    #[test]
    fn test_post_job_waits_for_running_job() {
        let system = TestSystemBuilder::default()
            .config(fast_config(None))
            .build()
            .unwrap();
        let id = system.manager.allocate(&full_request(1)).unwrap().id().clone();
        system.manager.assign_job(&id, 5, Some("alice")).unwrap();
        system.manager.boot(&id).unwrap();
        let hw_job = system.control.add_job(id.as_str(), Some(5), "alice");

        thread::scope(|s| {
            let waiter = s.spawn(|| system.manager.post_job(&id, Some(5)));
            thread::sleep(Duration::from_millis(100));
            assert_eq!(system.control.call_count("initiate_free"), 0);
            assert_eq!(
                system.manager.block(&id).unwrap().state(),
                BlockState::Ready
            );

            system
                .control
                .set_job_status(hw_job, HardwareJobStatus::Terminated);
            waiter.join().unwrap().unwrap();
        });

        assert_eq!(system.manager.block(&id).unwrap().state(), BlockState::Free);
        assert!(system.hooks.drained().is_empty());
    }

    #[test]
    fn test_drain_timeout_drains_nodes() {
        let system = TestSystemBuilder::default()
            .config(fast_config(Some(0)))
            .build()
            .unwrap();
        let block = system.manager.allocate(&full_request(1)).unwrap();
        let id = block.id().clone();
        system.manager.boot(&id).unwrap();
        system.control.add_job(id.as_str(), None, "alice");

        system.manager.post_job(&id, None).unwrap();
        assert_eq!(
            system.hooks.drained(),
            vec![(block.node_range().to_string(), "Couldn't remove job".to_string())]
        );
    }

    #[test]
    fn test_post_job_on_vanished_block() {
        let system = TestSystemBuilder::default()
            .config(fast_config(None))
            .build()
            .unwrap();
        let id = crate::block::BlockId::from("RMPgone");
        system.manager.post_job(&id, Some(3)).unwrap();
    }
}
