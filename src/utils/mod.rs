//! Вспомогательные модули

pub mod artifacts;
pub mod logger;
pub mod process;

pub use artifacts::ArtifactStore;
pub use logger::init_logger;
