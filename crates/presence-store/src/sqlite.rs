//! `AttendanceStore` backed by a single SQLite file.
//!
//! All statements run on the `tokio-rusqlite` background thread. Timestamps
//! are stored as RFC 3339 UTC strings with microsecond precision so they sort
//! lexicographically.

use crate::schema;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use presence_core::types::ZoneError;
use presence_core::{
    AttendanceEvent, AttendanceStore, HistoryEntry, ImageRef, NewAttendanceEvent, PersonId,
    StoreError, Zone, ZoneId,
};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

/// A registered person as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub role: Option<String>,
    pub face_image: Option<ImageRef>,
}

/// Errors from the operator-facing write helpers.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    InvalidZone(#[from] ZoneError),
    #[error("person {0} not found")]
    PersonNotFound(PersonId),
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).await.map_err(db_error)?;
        let store = Self::bootstrap(conn).await?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(db_error)?;
        Self::bootstrap(conn).await
    }

    async fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            schema::bootstrap(conn).map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))
        })
        .await
        .map_err(db_error)?;
        Ok(Self { conn })
    }

    /// Register a new zone after checking its center and radius.
    pub async fn add_zone(
        &self,
        name: &str,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
    ) -> Result<Zone, AdminError> {
        let draft = Zone::new(0, name, latitude, longitude, radius_meters)?;
        let row = draft.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO zones (name, latitude, longitude, radius) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        row.name,
                        row.center_latitude,
                        row.center_longitude,
                        row.radius_meters
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(db_error)?;

        tracing::info!(zone_id = id, name, radius_meters, "zone registered");
        Ok(Zone { id, ..draft })
    }

    pub async fn add_person(
        &self,
        name: &str,
        role: Option<&str>,
        face_image: Option<&str>,
    ) -> Result<Person, StoreError> {
        let person = Person {
            id: 0,
            name: name.to_string(),
            role: role.map(str::to_string),
            face_image: face_image.map(str::to_string),
        };
        let row = person.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO persons (name, role, face_image) VALUES (?1, ?2, ?3)",
                    params![row.name, row.role, row.face_image],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(db_error)?;

        tracing::info!(person_id = id, name, "person registered");
        Ok(Person { id, ..person })
    }

    /// Replace the person's reference image wholesale.
    pub async fn set_face_image(
        &self,
        person_id: PersonId,
        image: &str,
    ) -> Result<(), AdminError> {
        let image = image.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE persons SET face_image = ?1 WHERE id = ?2",
                    params![image, person_id],
                )?)
            })
            .await
            .map_err(db_error)?;

        if updated == 0 {
            return Err(AdminError::PersonNotFound(person_id));
        }
        tracing::info!(person_id, "reference image replaced");
        Ok(())
    }

    pub async fn find_person(&self, person_id: PersonId) -> Result<Option<Person>, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, role, face_image FROM persons WHERE id = ?1",
                        params![person_id],
                        person_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(db_error)
    }

    pub async fn list_persons(&self) -> Result<Vec<Person>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, role, face_image FROM persons ORDER BY id")?;
                let persons = stmt
                    .query_map([], person_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(persons)
            })
            .await
            .map_err(db_error)
    }
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn find_zone(&self, zone_id: ZoneId) -> Result<Option<Zone>, StoreError> {
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, latitude, longitude, radius FROM zones WHERE id = ?1",
                        params![zone_id],
                        zone_from_row,
                    )
                    .optional()?)
            })
            .await
            .map_err(db_error)
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT id, name, latitude, longitude, radius FROM zones ORDER BY id")?;
                let zones = stmt
                    .query_map([], zone_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(zones)
            })
            .await
            .map_err(db_error)
    }

    async fn reference_image(&self, person_id: PersonId) -> Result<Option<ImageRef>, StoreError> {
        let image: Option<Option<String>> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT face_image FROM persons WHERE id = ?1",
                        params![person_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
            .map_err(db_error)?;

        Ok(image.flatten().filter(|s| !s.trim().is_empty()))
    }

    async fn create_event(&self, event: NewAttendanceEvent) -> Result<AttendanceEvent, StoreError> {
        let event = NewAttendanceEvent {
            timestamp: event.timestamp.trunc_subsecs(6),
            ..event
        };
        let row = event.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance \
                     (person_id, zone_id, check_type, session_type, latitude, longitude, verified, timestamp) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.person_id,
                        row.zone_id,
                        row.check_type.as_str(),
                        row.session_type.as_str(),
                        row.latitude,
                        row.longitude,
                        row.verified,
                        format_timestamp(&row.timestamp),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(db_error)?;

        tracing::debug!(
            event_id = id,
            person_id = event.person_id,
            zone_id = event.zone_id,
            "attendance event stored"
        );
        Ok(AttendanceEvent::from_new(id, event))
    }

    async fn history(&self, person_id: PersonId) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.person_id, a.zone_id, a.check_type, a.session_type, \
                            a.latitude, a.longitude, a.verified, a.timestamp, z.name \
                     FROM attendance a JOIN zones z ON z.id = a.zone_id \
                     WHERE a.person_id = ?1 \
                     ORDER BY a.timestamp DESC, a.id DESC",
                )?;
                let rows = stmt
                    .query_map(params![person_id], |row| {
                        Ok((EventRow::from_row(row)?, row.get::<_, String>(9)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_error)?;

        rows.into_iter()
            .map(|(row, location_name)| {
                Ok(HistoryEntry {
                    event: row.into_event()?,
                    location_name,
                })
            })
            .collect()
    }
}

/// Raw attendance row; enum and timestamp columns are parsed afterwards.
struct EventRow {
    id: i64,
    person_id: PersonId,
    zone_id: ZoneId,
    check_type: String,
    session_type: String,
    latitude: f64,
    longitude: f64,
    verified: bool,
    timestamp: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            person_id: row.get(1)?,
            zone_id: row.get(2)?,
            check_type: row.get(3)?,
            session_type: row.get(4)?,
            latitude: row.get(5)?,
            longitude: row.get(6)?,
            verified: row.get(7)?,
            timestamp: row.get(8)?,
        })
    }

    fn into_event(self) -> Result<AttendanceEvent, StoreError> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("attendance {}: {what}: {e}", self.id))
        };
        Ok(AttendanceEvent {
            id: self.id,
            person_id: self.person_id,
            zone_id: self.zone_id,
            check_type: self
                .check_type
                .parse()
                .map_err(|e| corrupt("check_type", &e))?,
            session_type: self
                .session_type
                .parse()
                .map_err(|e| corrupt("session_type", &e))?,
            latitude: self.latitude,
            longitude: self.longitude,
            verified: self.verified,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .map_err(|e| corrupt("timestamp", &e))?
                .with_timezone(&Utc),
        })
    }
}

fn zone_from_row(row: &Row<'_>) -> rusqlite::Result<Zone> {
    Ok(Zone {
        id: row.get(0)?,
        name: row.get(1)?,
        center_latitude: row.get(2)?,
        center_longitude: row.get(3)?,
        radius_meters: row.get(4)?,
    })
}

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        face_image: row.get(3)?,
    })
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn db_error(e: tokio_rusqlite::Error) -> StoreError {
    tracing::warn!(error = %e, "database operation failed");
    StoreError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use presence_core::{CheckType, SessionType};

    fn event_at(person_id: PersonId, zone_id: ZoneId, ts: DateTime<Utc>) -> NewAttendanceEvent {
        NewAttendanceEvent {
            person_id,
            zone_id,
            check_type: CheckType::Checkin,
            session_type: SessionType::Morning,
            latitude: 13.7563,
            longitude: 100.5018,
            verified: true,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_zones_roundtrip_and_missing_zone() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let hq = store.add_zone("HQ", 13.7563, 100.5018, 200.0).await.unwrap();
        let annex = store.add_zone("Annex", 13.75, 100.49, 50.0).await.unwrap();

        assert_eq!(store.find_zone(hq.id).await.unwrap(), Some(hq.clone()));
        assert_eq!(store.find_zone(9999).await.unwrap(), None);
        assert_eq!(store.list_zones().await.unwrap(), vec![hq, annex]);
    }

    #[tokio::test]
    async fn test_add_zone_rejects_invalid_radius() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let err = store.add_zone("bad", 13.0, 100.0, 0.0).await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidZone(ZoneError::InvalidRadius(_))));
        assert!(store.list_zones().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reference_image_lookup() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let alice = store
            .add_person("alice", None, Some("https://img.example/alice.jpg"))
            .await
            .unwrap();
        let bob = store.add_person("bob", Some("admin"), None).await.unwrap();

        assert_eq!(
            store.reference_image(alice.id).await.unwrap().as_deref(),
            Some("https://img.example/alice.jpg")
        );
        assert_eq!(store.reference_image(bob.id).await.unwrap(), None);
        assert_eq!(store.reference_image(4242).await.unwrap(), None);

        store.set_face_image(bob.id, "/srv/faces/bob.png").await.unwrap();
        assert_eq!(
            store.reference_image(bob.id).await.unwrap().as_deref(),
            Some("/srv/faces/bob.png")
        );
        let bob = store.find_person(bob.id).await.unwrap().unwrap();
        assert_eq!(bob.role.as_deref(), Some("admin"));
        assert_eq!(bob.face_image.as_deref(), Some("/srv/faces/bob.png"));
        assert_eq!(store.find_person(4242).await.unwrap(), None);
        assert!(matches!(
            store.set_face_image(4242, "x.png").await,
            Err(AdminError::PersonNotFound(4242))
        ));
    }

    #[tokio::test]
    async fn test_history_newest_first_with_zone_name() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let hq = store.add_zone("HQ", 13.7563, 100.5018, 200.0).await.unwrap();
        let annex = store.add_zone("Annex", 13.75, 100.49, 50.0).await.unwrap();
        let alice = store.add_person("alice", None, None).await.unwrap();
        let bob = store.add_person("bob", None, None).await.unwrap();

        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let first = store.create_event(event_at(alice.id, hq.id, t0)).await.unwrap();
        let second = store
            .create_event(event_at(alice.id, annex.id, t0 + Duration::hours(4)))
            .await
            .unwrap();
        store
            .create_event(event_at(bob.id, hq.id, t0 + Duration::hours(1)))
            .await
            .unwrap();

        let history = store.history(alice.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, second);
        assert_eq!(history[0].location_name, "Annex");
        assert_eq!(history[1].event, first);
        assert_eq!(history[1].location_name, "HQ");
    }

    #[tokio::test]
    async fn test_create_event_roundtrips_subsecond_timestamp() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let hq = store.add_zone("HQ", 13.7563, 100.5018, 200.0).await.unwrap();
        let alice = store.add_person("alice", None, None).await.unwrap();

        let created = store
            .create_event(event_at(alice.id, hq.id, Utc::now()))
            .await
            .unwrap();
        let history = store.history(alice.id).await.unwrap();
        assert_eq!(history[0].event, created);
        assert!(created.verified);
    }

    #[tokio::test]
    async fn test_create_event_unknown_zone_is_storage_error() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let alice = store.add_person("alice", None, None).await.unwrap();
        let err = store
            .create_event(event_at(alice.id, 77, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
