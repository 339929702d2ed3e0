//! Integration test suite for convoy.
//!
//! These tests drive the ledger, scheduler, coordinator and supervisor
//! together against real temporary git repositories.
//!
//! # Test Categories
//!
//! - `scheduling`: batch selection over ledger snapshots
//! - `ledger_recovery`: durable state and supervisor restarts
//! - `merging`: priority-ordered merges and conflicts
//! - `health`: dead and silent workers, restart budget
//! - `supervisor_e2e`: full runs from task submission to merged baseline
//!
//! Workers are `sh -c` scripts speaking the stdout report protocol, so no
//! agent binary is needed.

mod fixtures;

mod health;
mod ledger_recovery;
mod merging;
mod scheduling;
mod supervisor_e2e;
