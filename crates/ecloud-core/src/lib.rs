// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! eCloud Core - Resource Sync Orchestration Engine
//!
//! This crate keeps locally recorded cloud resources (routers, networks,
//! volumes, instances, ...) in sync with the remote systems that realise
//! them. Every mutation opens a unit of work (a *task*) and runs an ordered
//! chain of remote steps through a durable queue; callers get the task back
//! immediately and poll it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Controller (HTTP layer)                            │
//! │                   handlers::handle_save / ...                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       ResourceLifecycle                                 │
//! │   Saving/Creating/Created/Saved/Deleting/Deleted reactions              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ begin_*/complete/fail                      │ start chain
//!           ▼                                            ▼
//! ┌───────────────────────┐                  ┌─────────────────────────────┐
//! │    ResourceSync       │◄─────────────────│       ChainExecutor         │
//! │  (capability contract)│   fail/complete  │  Success / Release / Fail   │
//! └───────────────────────┘                  └─────────────────────────────┘
//!      │ sync.<id> lock          │                         ▲
//!      ▼                         ▼                         │ claim due jobs
//! ┌─────────────┐      ┌──────────────────────────┐   ┌──────────┐
//! │ LockManager │      │ Persistence (Pg/SQLite)  │◄──│  Worker  │ x N
//! │ Redis / mem │      │ resources, tasks, queue  │   └──────────┘
//! └─────────────┘      └──────────────────────────┘
//! ```
//!
//! # Task Status
//!
//! | Status | Description |
//! |--------|-------------|
//! | `in-progress` | Chain running; the resource refuses other mutations |
//! | `complete` | Chain finished; remote state matches local state |
//! | `failed` | A step failed or ran out of retries; `failure_reason` says why |
//!
//! A resource with no tasks is implicitly `complete`. A resource whose only
//! task (its create) failed refuses updates until forced; it can still be
//! deleted.
//!
//! # Step Outcomes
//!
//! | Outcome | Effect |
//! |---------|--------|
//! | `Success` | Next step enqueued; after the last, task completed |
//! | `Release(delay)` | Step redelivered after `delay` until `max_attempts` is reached |
//! | `Fail(reason)` | Task failed with `reason`; later steps never run |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ECLOUD_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `ECLOUD_REDIS_URL` | No | - | Redis for distributed locks |
//! | `ECLOUD_WORKER_COUNT` | No | `4` | Queue workers |
//! | `ECLOUD_WORKER_POLL_INTERVAL_MS` | No | `1000` | Queue poll interval |
//! | `ECLOUD_WORKER_BATCH_SIZE` | No | `10` | Jobs claimed per poll |
//! | `ECLOUD_JOB_LEASE_SECS` | No | `300` | Lease before a claimed job is redelivered |
//! | `ECLOUD_SYNC_LOCK_TTL_SECS` | No | `60` | Sync lock TTL |
//! | `ECLOUD_SYNC_LOCK_WAIT_SECS` | No | `60` | Sync lock wait |

#![deny(missing_docs)]

/// Job chains, steps and the chain executor.
pub mod chain;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with HTTP status mapping.
pub mod error;

/// Controller-boundary handlers.
pub mod handlers;

/// Lifecycle events, reactions and two-phase delete.
pub mod lifecycle;

/// Per-resource lock managers.
pub mod lock;

/// Embedded database migrations.
pub mod migrations;

/// Persistence layer for resources, tasks and the job queue.
pub mod persistence;

/// Chain factories by resource kind.
pub mod registry;

/// Resource kinds and identifiers.
pub mod resource;

/// Embeddable runtime.
pub mod runtime;

/// Capability contract.
pub mod sync;

/// Task types and statuses.
pub mod task;

/// Queue worker.
pub mod worker;

pub use chain::{
    ChainExecutor, Step, StepContext, StepError, StepOutcome, StepRegistry, StepSpec,
};
pub use config::Config;
pub use error::{ApiError, BusyReason, CoreError, Result};
pub use lifecycle::{
    DeleteOutcome, HookContext, HookOutcome, HookRegistry, LifecycleEvent, ParentSyncGate,
    Reaction, ResourceLifecycle,
};
pub use lock::{LockHandle, LockManager};
pub use persistence::{Persistence, ResourceRecord, TaskRecord};
pub use registry::{ChainFactory, ChainRegistry};
pub use resource::ResourceKind;
pub use runtime::EngineRuntime;
pub use sync::ResourceSync;
pub use task::{SyncStatus, TaskStatus, TaskType};
