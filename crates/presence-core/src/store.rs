//! Persistence collaborator and reference image source contracts.

use crate::types::{
    AttendanceEvent, HistoryEntry, ImageRef, NewAttendanceEvent, PersonId, Zone, ZoneId,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Durable owner of zones, reference images and the attendance log.
///
/// Each call is treated as atomic by the pipeline; callers do not retry.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn find_zone(&self, zone_id: ZoneId) -> Result<Option<Zone>, StoreError>;

    async fn list_zones(&self) -> Result<Vec<Zone>, StoreError>;

    /// Location of the person's reference face image, if one was registered.
    async fn reference_image(&self, person_id: PersonId) -> Result<Option<ImageRef>, StoreError>;

    /// Append an event to the log and return it with its assigned id.
    async fn create_event(&self, event: NewAttendanceEvent) -> Result<AttendanceEvent, StoreError>;

    /// All events of `person_id`, newest first, joined with zone names.
    async fn history(&self, person_id: PersonId) -> Result<Vec<HistoryEntry>, StoreError>;
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("reference image not found: {0}")]
    NotFound(String),
    #[error("fetching reference image failed: {0}")]
    Transport(String),
}

/// Fetches the encoded bytes of a reference image.
#[async_trait]
pub trait ReferenceImageSource: Send + Sync {
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError>;
}
