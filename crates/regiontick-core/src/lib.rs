//! `regiontick-core`: shared vocabulary for the regiontick scheduler:
//! execution-context ids, target descriptors, ownership answers, threading
//! model selection, and configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::RegiontickConfig;
pub use error::{CoreError, Result};
pub use types::{
    ChunkPos, ContextId, EntityId, ModelSelection, Ownership, Target, ThreadingModel, WorldId,
};
