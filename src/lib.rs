//! Kiln - distributed stage-cached image builder
//!
//! Builds multi-image container projects stage by stage. Every stage is
//! identified by a signature over its inputs and everything before it, and
//! builders on one host or across a cluster share finished stages through a
//! stages storage cache guarded by per-stage locks.

pub mod builder;
pub mod cli;
pub mod config;
pub mod conveyor;
pub mod error;
pub mod stage;
pub mod storage;
pub mod tag;
pub mod ui;

pub use error::{KilnError, KilnResult};
