//! src/dataloader/common/mod.rs
//!
//! Utilities shared by the single-threaded and multi-worker loading paths.

pub mod seed;
pub mod thread;
