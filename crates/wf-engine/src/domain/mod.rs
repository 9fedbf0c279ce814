//! Domain Models
//!
//! Process definitions, the compiled graph used for dispatch, and runtime instances.
//! Ids are UUID v4 strings.

pub mod process;
pub mod graph;
pub mod instance;
pub mod escalation;

pub use process::*;
pub use graph::*;
pub use instance::*;
pub use escalation::*;
