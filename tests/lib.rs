//! Shared infrastructure for Strand integration tests.

pub mod fixtures;
