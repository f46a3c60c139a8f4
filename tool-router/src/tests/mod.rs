//! Unit tests for the tool router
//!
//! This module contains tests that exercise several components together.

pub mod error_tests;
pub mod harness_tests;
pub mod router_tests;
