mod catalog;
mod executor;
mod pool;
mod procedures;
mod registry;
mod transaction;

pub use catalog::*;
pub use executor::*;
pub use pool::{create_pool, spawn_idle_sweep};
pub use procedures::*;
pub use registry::*;
pub use transaction::*;
