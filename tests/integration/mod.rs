//! Integration test suite for labforge.
//!
//! These tests drive the public API end to end: scheduling, retries,
//! component tracking, rollback and cleanup working together.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency order, concurrency bound, cycle rejection
//! - `retry`: attempt counts and backoff delays
//! - `rollback`: component and full system rollback
//! - `cleanup`: idempotent and confirmed cleanup
//! - `scenarios`: complete deployment runs through the orchestrator
//!
//! Commands are closures or plain `sh -c` scripts, so nothing here needs
//! docker or a cluster.

mod fixtures;

mod cleanup;
mod retry;
mod rollback;
mod scenarios;
mod scheduling;
