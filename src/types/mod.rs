pub mod cluster;

// Re-export cluster types
pub use cluster::*;
