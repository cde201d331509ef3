//! Vehicle catalogs and CAN frame sources for Candle

pub mod candump;
pub mod demo;
pub mod nissan_leaf;

pub use candump::CandumpSource;
pub use demo::DemoSource;

use candle_core::VehicleDefinition;

/// Keys of every built-in catalog
pub const CATALOGS: &[&str] = &[nissan_leaf::KEY];

/// Look up a built-in catalog by key
pub fn catalog(key: &str) -> Option<VehicleDefinition> {
    match key {
        nissan_leaf::KEY => Some(nissan_leaf::definition()),
        _ => None,
    }
}
