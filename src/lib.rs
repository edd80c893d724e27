pub mod cache;
pub mod cli;
pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod indexer;
pub mod metrics;
pub mod scan;
pub mod search;
pub mod utils;

pub use config::{ModelIdentity, Opts};
pub use embed::{BuiltinLoader, Embedder, ModelLoader};
pub use engine::{Engine, EngineEvent, EngineHandle, IndexStatus, Query};
pub use error::{Error, Result};
pub use search::IndexSnapshot;
