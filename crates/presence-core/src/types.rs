use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a registered person.
pub type PersonId = i64;

/// Identifier of an authorized zone.
pub type ZoneId = i64;

/// Location of a person's reference face image (URL or filesystem path).
pub type ImageRef = String;

/// Fixed-length face descriptor produced by the extraction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model that produced this descriptor (e.g., "dlib_resnet_v1").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Returns `None` when the descriptors differ in length or are empty,
    /// since they cannot have come from the same model.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Option<f32> {
        if self.values.is_empty() || self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

/// A single grayscale image handed to the descriptor extractor.
///
/// Live camera frames and decoded reference images share this shape; raw
/// pixels are never inspected by the pipeline itself.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Decode an encoded image (PNG, JPEG, ...) into a grayscale frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let gray = image::load_from_memory(bytes)?.to_luma8();
        let (width, height) = gray.dimensions();
        Ok(Self {
            data: gray.into_raw(),
            width,
            height,
            sequence: 0,
            is_dark: false,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish_non_exhaustive()
    }
}

/// A registered circular zone inside which attendance may be recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    #[serde(rename = "latitude")]
    pub center_latitude: f64,
    #[serde(rename = "longitude")]
    pub center_longitude: f64,
    #[serde(rename = "radius")]
    pub radius_meters: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ZoneError {
    #[error("zone radius must be a positive number of meters, got {0}")]
    InvalidRadius(f64),
    #[error("zone center is not a valid coordinate: ({0}, {1})")]
    InvalidCenter(f64, f64),
}

impl Zone {
    /// Build a zone, enforcing `radius_meters > 0` and a valid center.
    pub fn new(
        id: ZoneId,
        name: impl Into<String>,
        center_latitude: f64,
        center_longitude: f64,
        radius_meters: f64,
    ) -> Result<Self, ZoneError> {
        if !(radius_meters.is_finite() && radius_meters > 0.0) {
            return Err(ZoneError::InvalidRadius(radius_meters));
        }
        if !crate::geofence::is_valid_coordinate(center_latitude, center_longitude) {
            return Err(ZoneError::InvalidCenter(center_latitude, center_longitude));
        }
        Ok(Self {
            id,
            name: name.into(),
            center_latitude,
            center_longitude,
            radius_meters,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseKindError {
    kind: &'static str,
    value: String,
}

/// Direction of an attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Checkin,
    Checkout,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkin => "checkin",
            Self::Checkout => "checkout",
        }
    }
}

impl FromStr for CheckType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkin" => Ok(Self::Checkin),
            "checkout" => Ok(Self::Checkout),
            other => Err(ParseKindError {
                kind: "check type",
                value: other.to_string(),
            }),
        }
    }
}

/// Work session an attendance event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Morning,
    Noon,
    Afternoon,
    Evening,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Noon => "noon",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
        }
    }
}

impl FromStr for SessionType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "morning" => Ok(Self::Morning),
            "noon" => Ok(Self::Noon),
            "afternoon" => Ok(Self::Afternoon),
            "evening" => Ok(Self::Evening),
            other => Err(ParseKindError {
                kind: "session type",
                value: other.to_string(),
            }),
        }
    }
}

/// An attendance event about to be appended to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendanceEvent {
    pub person_id: PersonId,
    pub zone_id: ZoneId,
    pub check_type: CheckType,
    pub session_type: SessionType,
    pub latitude: f64,
    pub longitude: f64,
    pub verified: bool,
    pub timestamp: DateTime<Utc>,
}

/// A committed, immutable attendance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvent {
    pub id: i64,
    pub person_id: PersonId,
    pub zone_id: ZoneId,
    pub check_type: CheckType,
    pub session_type: SessionType,
    pub latitude: f64,
    pub longitude: f64,
    pub verified: bool,
    pub timestamp: DateTime<Utc>,
}

impl AttendanceEvent {
    pub fn from_new(id: i64, event: NewAttendanceEvent) -> Self {
        Self {
            id,
            person_id: event.person_id,
            zone_id: event.zone_id,
            check_type: event.check_type,
            session_type: event.session_type,
            latitude: event.latitude,
            longitude: event.longitude,
            verified: event.verified,
            timestamp: event.timestamp,
        }
    }
}

/// An attendance event joined with the name of its zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub event: AttendanceEvent,
    pub location_name: String,
}

/// Caller identity for one request, derived from its bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub person_id: PersonId,
    pub role: Option<String>,
}

/// Role name carried by administrator tokens.
pub const ADMIN_ROLE: &str = "admin";

impl SessionContext {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

/// What a person claims when submitting attendance.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceClaim {
    pub zone_id: ZoneId,
    pub check_type: CheckType,
    pub session_type: SessionType,
    pub claimed_latitude: f64,
    pub claimed_longitude: f64,
}

/// Result of comparing a live descriptor against the reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub matched: bool,
    pub distance: f32,
    pub threshold: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Descriptor::new(vec![0.1, 0.2, 0.3]);
        assert_eq!(a.euclidean_distance(&a.clone()), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        let d = a.euclidean_distance(&b).unwrap();
        assert!((d - 5.0).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_euclidean_distance_length_mismatch() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
        assert_eq!(Descriptor::new(vec![]).euclidean_distance(&Descriptor::new(vec![])), None);
    }

    #[test]
    fn test_zone_rejects_non_positive_radius() {
        assert_eq!(
            Zone::new(1, "hq", 13.7563, 100.5018, 0.0),
            Err(ZoneError::InvalidRadius(0.0))
        );
        assert!(Zone::new(1, "hq", 13.7563, 100.5018, -5.0).is_err());
        assert!(Zone::new(1, "hq", 13.7563, 100.5018, f64::NAN).is_err());
        assert!(Zone::new(1, "hq", 91.0, 100.5018, 200.0).is_err());
        assert!(Zone::new(1, "hq", 13.7563, 100.5018, 200.0).is_ok());
    }

    #[test]
    fn test_kinds_parse_and_serialize() {
        assert_eq!("checkin".parse::<CheckType>(), Ok(CheckType::Checkin));
        assert_eq!("evening".parse::<SessionType>(), Ok(SessionType::Evening));
        assert!("lunch".parse::<SessionType>().is_err());
        assert_eq!(serde_json::to_string(&CheckType::Checkout).unwrap(), "\"checkout\"");
        assert_eq!(
            serde_json::from_str::<SessionType>("\"noon\"").unwrap(),
            SessionType::Noon
        );
    }

    #[test]
    fn test_frame_decode_png() {
        let img = image::GrayImage::from_pixel(3, 2, image::Luma([200u8]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(frame.data, vec![200u8; 6]);
    }

    #[test]
    fn test_frame_decode_garbage() {
        assert!(Frame::decode(b"not an image").is_err());
    }
}
