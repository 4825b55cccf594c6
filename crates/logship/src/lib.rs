// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logship
//!
//! Core of a log collection agent. Sessions wire sources to sinks (optionally
//! through pipes), and every source that reads files keeps a durable bookmark so
//! restarts neither drop nor replay data.
//!
//! ## Architecture
//!
//! ```text
//!   SessionManager ── config file ──> Session
//!                                       │
//!            ┌──────────────────────────┼───────────────────────┐
//!            v                          v                       v
//!    DirectorySource ──envelopes──> Pipe (opt) ──envelopes──> Sink
//!            ^                                                  │
//!            │ on_bookmark_callback                 bookmark_callback
//!            │                                                  │
//!            └──────────── FileBookmarkStore <──────────────────┘
//!                           (flush loop, FIFO callback loop)
//! ```
//!
//! - [`bookmark`]: durable position storage and the acknowledgement queue
//! - [`sources`]: directory tailing source and record parsers
//! - [`pipeline`]: envelopes and the push-based publisher/subscriber contract
//! - [`session`] / [`session_manager`]: pipeline lifecycle and hot reload

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

/// Durable bookmark storage and acknowledgement queue
pub mod bookmark;

/// Agent and session configuration
pub mod config;

/// Credential providers available to sinks
pub mod credentials;

/// Preconditions a source needs before it can run
pub mod dependency;

/// Error taxonomy shared across the crate
pub mod error;

/// Log line formatter for the tracing subscriber
pub mod logger;

/// Reusable periodic-execution helper
pub mod periodic;

/// Key/value store persisting values across restarts
pub mod parameter_store;

/// Envelopes and the source/pipe/sink contract
pub mod pipeline;

/// Built-in pipes
pub mod pipes;

/// Plugin capability trait, context and factory registry
pub mod plugin;

/// One configured source→pipe→sink graph
pub mod session;

/// Config discovery and session reconciliation
pub mod session_manager;

/// Built-in sinks
pub mod sinks;

/// Built-in sources
pub mod sources;

/// Counters and the periodic counter reporter
pub mod telemetry;

/// Default capacity of the bookmark acknowledgement queue.
pub const CALLBACK_QUEUE_CAPACITY: usize = 1000;
