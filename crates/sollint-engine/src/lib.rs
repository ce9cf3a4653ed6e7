pub mod analyzer;
pub mod engine;

pub use analyzer::*;
pub use engine::*;

pub use async_trait::async_trait;
