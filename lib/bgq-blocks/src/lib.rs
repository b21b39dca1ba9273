// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block allocation and reconciliation for Blue Gene/Q.
//!
//! - Midplane grid of the 4-D torus with per-unit reservation flags
//! - Placement of full (multi-midplane) and small (sub-midplane) blocks
//! - Block lifecycle on the hardware through a [`facade::ControlSystem`]
//! - Periodic reconciliation against the hardware inventory

pub mod allocator;
pub mod block;
pub mod error;
pub mod facade;
pub mod hooks;
pub mod logging;
pub mod manager;
pub mod reconcile;
pub mod topology;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use allocator::{BlockAllocator, PendingReservation, PlacementRequest, PlacementRequestBuilder};
pub use block::{Block, BlockId, BlockIdGenerator, BlockShape, BlockState, IonodeRange, JobAssignment};
pub use error::{BlockError, Result};
pub use facade::{Bridge, ControlSystem, EmulatedControlSystem, FacadeError, FacadeErrorKind};
pub use hooks::{BlockStore, JobLock, JsonFileStore, NoopHooks, NullStore, SchedulerHooks};
pub use manager::{BlockManager, BlockManagerBuilder, UserSyncReport};
pub use reconcile::{ReconcileDaemon, ReconcileReport, ReconciliationEngine};
pub use topology::{Connectivity, Coord, TopologyGrid};
