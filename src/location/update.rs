use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DriverId = String;
pub type RegionId = String;

/// Delivery priority attached to an update by the upstream decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Emergency,
}

impl Priority {
    /// High and emergency updates are flushed on the short deadline.
    pub fn is_elevated(self) -> bool {
        self >= Priority::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Emergency => "emergency",
        }
    }
}

/// Driver state reported upstream. Unrecognised values are carried
/// through as `Other` so they still land in their own status set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DriverStatus {
    Online,
    Offline,
    Busy,
    OnTrip,
    Other(String),
}

impl DriverStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DriverStatus::Online => "online",
            DriverStatus::Offline => "offline",
            DriverStatus::Busy => "busy",
            DriverStatus::OnTrip => "on_trip",
            DriverStatus::Other(s) => s,
        }
    }
}

impl From<String> for DriverStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "online" => DriverStatus::Online,
            "offline" => DriverStatus::Offline,
            "busy" => DriverStatus::Busy,
            "on_trip" => DriverStatus::OnTrip,
            _ => DriverStatus::Other(s),
        }
    }
}

impl From<DriverStatus> for String {
    fn from(status: DriverStatus) -> Self {
        match status {
            DriverStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

/// A single decoded position fix for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub driver_id: DriverId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub status: DriverStatus,
    pub is_available: bool,
    /// Epoch milliseconds at which the fix was taken
    pub timestamp: i64,
    pub region_id: RegionId,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("region id is empty")]
    EmptyRegion,

    #[error("driver id is empty")]
    EmptyDriver,

    #[error("status is empty")]
    EmptyStatus,

    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

impl LocationUpdate {
    /// Check the ingestion constraints. NaN coordinates fail the range check.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.region_id.trim().is_empty() {
            return Err(ValidationError::EmptyRegion);
        }
        if self.driver_id.trim().is_empty() {
            return Err(ValidationError::EmptyDriver);
        }
        if self.status.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyStatus);
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::LatitudeOutOfRange(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }

    pub fn is_emergency(&self) -> bool {
        self.priority == Priority::Emergency
    }
}

#[cfg(test)]
pub(crate) fn sample_update(driver_id: &str, timestamp: i64) -> LocationUpdate {
    LocationUpdate {
        driver_id: driver_id.to_string(),
        latitude: 40.7128,
        longitude: -74.0060,
        accuracy: Some(5.0),
        bearing: None,
        speed: Some(11.5),
        address: None,
        status: DriverStatus::Online,
        is_available: true,
        timestamp,
        region_id: "nyc".to_string(),
        priority: Priority::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_boundaries() {
        let mut update = sample_update("d1", 1);
        update.latitude = 90.0;
        update.longitude = -180.0;
        assert!(update.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut update = sample_update("d1", 1);
        update.region_id = "  ".to_string();
        assert_eq!(update.validate(), Err(ValidationError::EmptyRegion));

        let mut update = sample_update("d1", 1);
        update.latitude = 90.5;
        assert!(matches!(update.validate(), Err(ValidationError::LatitudeOutOfRange(_))));

        let mut update = sample_update("d1", 1);
        update.longitude = f64::NAN;
        assert!(matches!(update.validate(), Err(ValidationError::LongitudeOutOfRange(_))));
    }

    #[test]
    fn test_json_shape_is_camel_case() {
        let json = r#"{
            "driverId": "d9",
            "latitude": 1.5,
            "longitude": 2.5,
            "status": "on_trip",
            "isAvailable": false,
            "timestamp": 1700000000000,
            "regionId": "sf"
        }"#;
        let update: LocationUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.driver_id, "d9");
        assert_eq!(update.status, DriverStatus::OnTrip);
        assert_eq!(update.priority, Priority::Normal);

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["isAvailable"], false);
        assert!(value.get("accuracy").is_none());
    }

    #[test]
    fn test_unknown_status_is_carried_through() {
        let json = r#"{
            "driverId": "d9",
            "latitude": 1.5,
            "longitude": 2.5,
            "status": "break",
            "isAvailable": false,
            "timestamp": 1700000000000,
            "regionId": "sf"
        }"#;
        let update: LocationUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.status, DriverStatus::Other("break".to_string()));
        assert!(update.validate().is_ok());
        assert_eq!(serde_json::to_value(&update).unwrap()["status"], "break");

        let mut blank = update;
        blank.status = DriverStatus::from(" ".to_string());
        assert_eq!(blank.validate(), Err(ValidationError::EmptyStatus));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(!Priority::Normal.is_elevated());
        assert!(Priority::High.is_elevated());
        assert!(Priority::Emergency > Priority::High);
    }
}
