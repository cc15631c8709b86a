mod builder;
mod config;
pub mod embedding;
mod search;
mod store;

pub use builder::*;
pub use config::*;
pub use embedding::{EmbeddingBackend, EmbeddingService, ExtractionMode};
pub use search::*;
pub use store::*;
