pub mod memory;
pub mod traits;

pub use memory::MemoryCache;
pub use traits::{CacheCommand, CacheError, CachePipeline, LocationCache};

use crate::location::DriverStatus;

pub fn driver_location_key(driver_id: &str) -> String {
    format!("driver:location:{}", driver_id)
}

pub fn region_drivers_key(region_id: &str) -> String {
    format!("region:drivers:{}", region_id)
}

pub fn status_key(status: &DriverStatus) -> String {
    format!("status:{}", status.as_str())
}

pub fn demand_density_key(region_id: &str) -> String {
    format!("demand:density:{}", region_id)
}
