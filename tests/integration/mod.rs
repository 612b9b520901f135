//! Integration test suite for conductor.
//!
//! These tests drive the orchestrator end to end with scripted workers and
//! check runners, so no external agent CLI is ever started.
//!
//! # Test Categories
//!
//! - `scenarios`: the reference runs (retry escalation, sequential dispatch,
//!   timeouts, budget exhaustion)
//! - `dispatch`: concurrency limit and fault isolation under load
//! - `recovery`: failure classification through a full run
//! - `persistence`: snapshots, resume and git commits

mod fixtures;

mod dispatch;
mod persistence;
mod recovery;
mod scenarios;
