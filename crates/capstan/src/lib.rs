/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Capstan core engine.
//!
//! Capstan is a distributed task scheduling and execution platform. This
//! crate contains the execution and coordination engine shared by the
//! control binary (`capstan-ctl`) and the worker binary (`capstan-agent`):
//!
//! - [`executor`] — runs a single shell command with timeout supervision,
//!   preferring a pseudo-terminal on POSIX when output is merged
//! - [`livelog`] — per-run streaming log collector with UTF-8-safe framing,
//!   subscriber fan-out, and zlib/base64 finalization
//! - [`scheduler`] — bounded-queue worker pool with rate limiting and
//!   per-run cancellation
//! - [`cron`] — 6-field cron dispatcher evaluated in a fixed +08:00 zone
//! - [`coordinator`] — binds the scheduler and cron dispatcher to the
//!   persistent task/log model and the per-task concurrency policy
//! - [`remote`] — dispatch of agent-bound runs with result-waiter rendezvous
//! - [`gateway`] — control-side manager for long-lived agent connections
//! - [`repository`] — the storage contract the engine reads and writes
//!   through, plus an in-memory implementation
//!
//! HTTP request handling, authentication, and the administrative UI live
//! outside this crate; so does relational persistence, which only appears
//! here through the [`repository::Repository`] contract.

pub mod config;
pub mod coordinator;
pub mod cron;
pub mod error;
pub mod executor;
pub mod frames;
pub mod gateway;
pub mod livelog;
pub mod models;
pub mod remote;
pub mod repository;
pub mod scheduler;
pub mod sink;

pub use error::CapstanError;
pub use models::{Agent, AgentStatus, KeepPolicy, Task, TaskKind, TaskLog, TriggerKind};
pub use scheduler::{
    ExecutionRequest, ExecutionResult, RunStatus, RunType, Scheduler, SchedulerConfig,
    SchedulerEventHandler,
};
