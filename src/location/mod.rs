pub mod geohash;
pub mod update;

pub use geohash::{BatchKey, KeyDeriver};
pub use update::{DriverId, DriverStatus, LocationUpdate, Priority, RegionId, ValidationError};
