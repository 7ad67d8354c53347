use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{AppError, ErrorKind};

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(TripId);
typed_id!(UserId);
typed_id!(OrgId);
typed_id!(OperatorId);
typed_id!(AssetId);
typed_id!(EvidenceId);

impl EvidenceId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Authenticated driver, resolved by the shell's auth provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverIdentity {
    pub user_id: UserId,
    pub org_id: OrgId,
}

impl DriverIdentity {
    pub fn new(user_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            org_id: OrgId::new(org_id),
        }
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

// --- Coordinates ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

/// Validated latitude/longitude pair.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    lat: f64,
    lng: f64,
}

impl LatLon {
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lat, lng })
    }

    #[must_use]
    pub fn lat(&self) -> f64 {
        self.lat
    }

    #[must_use]
    pub fn lng(&self) -> f64 {
        self.lng
    }
}

// --- Trip status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum TripStatus {
    #[default]
    Pending,
    Requested,
    InProgress,
    Completed,
}

impl TripStatus {
    /// Accepts every spelling the backend has used across revisions.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "pending" | "scheduled" => Some(Self::Pending),
            "requested" | "accepted" => Some(Self::Requested),
            "in_progress" | "inprogress" | "started" => Some(Self::InProgress),
            "completed" | "complete" | "done" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Spelling the backend expects in `t_status`.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Requested => "Requested",
            Self::InProgress => "In-Progress",
            Self::Completed => "Completed",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Requested => "Requested",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// --- Trip ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct Place {
    pub query: Option<String>,
    pub coordinates: Option<LatLon>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub status: TripStatus,
    pub kind: Option<String>,
    pub origin: Place,
    pub destination: Place,
    pub distance: Option<String>,
    pub duration: Option<String>,
    pub operator_id: Option<OperatorId>,
    pub asset_id: Option<AssetId>,
    pub start_date: Option<String>,
}

impl Trip {
    pub fn new(id: impl Into<String>, status: TripStatus) -> Self {
        Self {
            id: TripId::new(id),
            status,
            kind: None,
            origin: Place::default(),
            destination: Place::default(),
            distance: None,
            duration: None,
            operator_id: None,
            asset_id: None,
            start_date: None,
        }
    }

    #[must_use]
    pub fn with_assignment(mut self, operator_id: impl Into<String>, asset_id: impl Into<String>) -> Self {
        self.operator_id = Some(OperatorId::new(operator_id));
        self.asset_id = Some(AssetId::new(asset_id));
        self
    }

    /// Origin→destination as a GeoJSON line for the map widget.
    #[must_use]
    pub fn route_feature(&self) -> Option<geojson::Feature> {
        let from = self.origin.coordinates?;
        let to = self.destination.coordinates?;

        let geometry = geojson::Geometry::new(geojson::Value::LineString(vec![
            vec![from.lng(), from.lat()],
            vec![to.lng(), to.lat()],
        ]));

        let mut properties = geojson::JsonObject::new();
        properties.insert("trip_id".into(), self.id.0.clone().into());
        properties.insert("status".into(), self.status.as_wire().into());
        if let Some(query) = &self.origin.query {
            properties.insert("origin".into(), query.clone().into());
        }
        if let Some(query) = &self.destination.query {
            properties.insert("destination".into(), query.clone().into());
        }

        Some(geojson::Feature {
            bbox: None,
            geometry: Some(geometry),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        })
    }
}

/// Backend number-or-string scalar (`"5.66"` and `5.66` both occur).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => n.as_f64(),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TripRecordError {
    #[error("trip {id}: unknown status {status:?}")]
    UnknownStatus { id: String, status: String },
    #[error("trip {id}: {field} is not a number")]
    NotANumber { id: String, field: &'static str },
    #[error("trip {id}: {source}")]
    Coordinate {
        id: String,
        #[source]
        source: CoordinateError,
    },
}

/// Trip as the backend lists it.
#[derive(Clone, Debug, Deserialize)]
pub struct TripRecord {
    id: Scalar,
    #[serde(default)]
    t_status: String,
    #[serde(default)]
    t_type: Option<String>,
    #[serde(default)]
    t_origin_place_query: Option<String>,
    #[serde(default)]
    t_destination_place_query: Option<String>,
    #[serde(default)]
    t_start_lat: Option<Scalar>,
    #[serde(default)]
    t_start_long: Option<Scalar>,
    #[serde(default)]
    t_end_lat: Option<Scalar>,
    #[serde(default)]
    t_end_long: Option<Scalar>,
    #[serde(default)]
    t_distance: Option<Scalar>,
    #[serde(default)]
    t_duration: Option<Scalar>,
    #[serde(default)]
    t_operator_id: Option<Scalar>,
    #[serde(default)]
    t_asset_id: Option<Scalar>,
    #[serde(default)]
    t_start_date: Option<String>,
}

fn coordinate_pair(
    id: &str,
    lat: Option<&Scalar>,
    lng: Option<&Scalar>,
    fields: (&'static str, &'static str),
) -> Result<Option<LatLon>, TripRecordError> {
    let (Some(lat), Some(lng)) = (lat, lng) else {
        return Ok(None);
    };
    let lat = lat.as_f64().ok_or_else(|| TripRecordError::NotANumber {
        id: id.to_string(),
        field: fields.0,
    })?;
    let lng = lng.as_f64().ok_or_else(|| TripRecordError::NotANumber {
        id: id.to_string(),
        field: fields.1,
    })?;
    LatLon::new(lat, lng)
        .map(Some)
        .map_err(|source| TripRecordError::Coordinate {
            id: id.to_string(),
            source,
        })
}

impl TryFrom<TripRecord> for Trip {
    type Error = TripRecordError;

    fn try_from(record: TripRecord) -> Result<Self, Self::Error> {
        let id = record.id.into_string();
        let status =
            TripStatus::from_wire(&record.t_status).ok_or_else(|| TripRecordError::UnknownStatus {
                id: id.clone(),
                status: record.t_status.clone(),
            })?;

        let origin = coordinate_pair(
            &id,
            record.t_start_lat.as_ref(),
            record.t_start_long.as_ref(),
            ("t_start_lat", "t_start_long"),
        )?;
        let destination = coordinate_pair(
            &id,
            record.t_end_lat.as_ref(),
            record.t_end_long.as_ref(),
            ("t_end_lat", "t_end_long"),
        )?;

        Ok(Trip {
            id: TripId(id),
            status,
            kind: record.t_type,
            origin: Place {
                query: record.t_origin_place_query,
                coordinates: origin,
            },
            destination: Place {
                query: record.t_destination_place_query,
                coordinates: destination,
            },
            distance: record.t_distance.map(Scalar::into_string),
            duration: record.t_duration.map(Scalar::into_string),
            operator_id: record.t_operator_id.map(|s| OperatorId(s.into_string())),
            asset_id: record.t_asset_id.map(|s| AssetId(s.into_string())),
            start_date: record.t_start_date,
        })
    }
}

/// Fuel credited by the backend in answer to a fuel request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FuelAllocation {
    pub trip_id: TripId,
    pub quantity: f64,
}
