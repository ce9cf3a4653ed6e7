pub mod clock;
pub mod config_manager;
pub mod error;

pub use clock::*;
pub use config_manager::*;
pub use error::*;
