//! Command implementations for the siphon binary.

pub mod claim;
pub mod context;
pub mod error;
pub mod jobs;
pub mod kind;
pub mod output;
pub mod sink;
pub mod status;
pub mod sync;
