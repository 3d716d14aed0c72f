//! Integration test suite for MemNexus.
//!
//! These tests drive plans through the public API: planning, the engine,
//! the agent pool and the intervention system working together.
//!
//! # Test Categories
//!
//! - `planning`: Plan files, strategy resolution, structural errors, analysis
//! - `engine_e2e`: Full plan execution
//! - `capacity`: Per-role capacity enforcement
//! - `cascade`: Failure propagation
//! - `interventions`: Approvals, decisions, expiry and policies
//! - `review`: Review gates and waivers
//! - `control`: Pause, resume and cancel
//!
//! # CI Compatibility
//!
//! A scripted agent stands in for real agents; no network access is needed.


mod capacity;
mod cascade;
mod interventions;
mod planning;
mod review;
