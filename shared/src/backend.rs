//! Backend contract for trip status, odometer evidence, fuel and location pings.
//!
//! `RestBackend` in `capabilities::http` is the production implementation;
//! tests substitute an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::evidence::{EvidencePurpose, EvidenceRecord, Reading};
use crate::model::{AssetId, DriverIdentity, FuelAllocation, OperatorId, TripId, TripStatus};
use crate::capture::ImageBlob;
use crate::AppResult;

/// Body of `POST /trips/{org}/{user}/{trip}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdateBody {
    pub id: TripId,
    pub t_status: &'static str,
    pub or_purpose: EvidencePurpose,
    pub or_odometer_image: String,
    pub or_odometer_reading: Option<Reading>,
    pub or_latitude: Option<f64>,
    pub or_longitude: Option<f64>,
    pub or_captured_at: u64,
}

impl StatusUpdateBody {
    #[must_use]
    pub fn new(trip_id: &TripId, status: TripStatus, evidence: &EvidenceRecord) -> Self {
        Self {
            id: trip_id.clone(),
            t_status: status.as_wire(),
            or_purpose: evidence.purpose(),
            or_odometer_image: evidence.image().to_data_url(),
            or_odometer_reading: evidence.reading().cloned(),
            or_latitude: evidence.location().map(|l| l.lat()),
            or_longitude: evidence.location().map(|l| l.lng()),
            or_captured_at: evidence.captured_at().0,
        }
    }
}

/// Body of `POST /trips/odometer/{org}/{user}` for mid-trip readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OdometerBody {
    pub or_trip_id: TripId,
    pub or_operator_id: Option<OperatorId>,
    pub or_asset_id: Option<AssetId>,
    pub or_purpose: EvidencePurpose,
    pub or_odometer_image: String,
    pub or_odometer_reading: Option<Reading>,
    pub or_latitude: Option<f64>,
    pub or_longitude: Option<f64>,
    pub or_captured_at: u64,
}

impl OdometerBody {
    #[must_use]
    pub fn new(
        trip_id: &TripId,
        operator_id: Option<&OperatorId>,
        asset_id: Option<&AssetId>,
        evidence: &EvidenceRecord,
    ) -> Self {
        Self {
            or_trip_id: trip_id.clone(),
            or_operator_id: operator_id.cloned(),
            or_asset_id: asset_id.cloned(),
            or_purpose: evidence.purpose(),
            or_odometer_image: evidence.image().to_data_url(),
            or_odometer_reading: evidence.reading().cloned(),
            or_latitude: evidence.location().map(|l| l.lat()),
            or_longitude: evidence.location().map(|l| l.lng()),
            or_captured_at: evidence.captured_at().0,
        }
    }
}

/// Multipart fields of `POST /fuel/create`. The image travels as a file part.
#[derive(Debug, Clone, PartialEq)]
pub struct FuelRequest {
    pub created_by: String,
    pub organization_id: String,
    pub operator_id: Option<OperatorId>,
    pub asset_id: Option<AssetId>,
    pub trip_id: TripId,
    pub reading_note: String,
    pub image: ImageBlob,
}

impl FuelRequest {
    #[must_use]
    pub fn new(
        identity: &DriverIdentity,
        trip_id: &TripId,
        operator_id: Option<&OperatorId>,
        asset_id: Option<&AssetId>,
        evidence: &EvidenceRecord,
    ) -> Self {
        Self {
            created_by: identity.user_id.to_string(),
            organization_id: identity.org_id.to_string(),
            operator_id: operator_id.cloned(),
            asset_id: asset_id.cloned(),
            trip_id: trip_id.clone(),
            reading_note: evidence
                .reading()
                .map(ToString::to_string)
                .unwrap_or_default(),
            image: evidence.image().clone(),
        }
    }

    /// Text fields in the order the fuel form posts them.
    #[must_use]
    pub fn text_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("f_created_by", self.created_by.clone()),
            ("f_organization_id", self.organization_id.clone()),
        ];
        if let Some(operator) = &self.operator_id {
            fields.push(("f_operator_id", operator.to_string()));
        }
        if let Some(asset) = &self.asset_id {
            fields.push(("f_asset_id", asset.to_string()));
        }
        fields.push(("f_trip_id", self.trip_id.to_string()));
        fields.push(("f_reading_note", self.reading_note.clone()));
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FuelResponse {
    pub fuel_allocated: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocationPing {
    pub lat: f64,
    pub lng: f64,
    pub purpose: EvidencePurpose,
}

impl LocationPing {
    #[must_use]
    pub fn continuous(location: crate::model::LatLon) -> Self {
        Self {
            lat: location.lat(),
            lng: location.lng(),
            purpose: EvidencePurpose::Continuous,
        }
    }
}

#[async_trait]
pub trait TripBackend: Send + Sync {
    /// Records that fail to parse are skipped, not fatal.
    async fn list_trips(&self, identity: &DriverIdentity) -> AppResult<Vec<crate::model::Trip>>;

    async fn update_trip(
        &self,
        identity: &DriverIdentity,
        trip_id: &TripId,
        body: &StatusUpdateBody,
    ) -> AppResult<()>;

    async fn record_odometer(&self, identity: &DriverIdentity, body: &OdometerBody)
        -> AppResult<()>;

    async fn request_fuel(
        &self,
        identity: &DriverIdentity,
        request: &FuelRequest,
    ) -> AppResult<FuelAllocation>;

    async fn ping_location(
        &self,
        identity: &DriverIdentity,
        trip_id: &TripId,
        ping: &LocationPing,
    ) -> AppResult<()>;
}
