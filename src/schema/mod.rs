//! Schema module - Configuration, spatial unit and BMP records for scenario optimization.

mod bmp;
mod config;
mod evolution;
mod scenario;
mod units;

pub use bmp::*;
pub use config::*;
pub use evolution::*;
pub use scenario::*;
pub use units::*;
