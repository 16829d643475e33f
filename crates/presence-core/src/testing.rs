//! Scripted collaborators for exercising the pipeline without hardware,
//! models or a database.

use crate::capture::{CaptureDevice, CaptureError, CaptureStream};
use crate::extractor::{DescriptorExtractor, ExtractError, ModelLoader};
use crate::store::{AttendanceStore, FetchError, ReferenceImageSource, StoreError};
use crate::types::{
    AttendanceEvent, Descriptor, Frame, HistoryEntry, ImageRef, NewAttendanceEvent, PersonId,
    Zone, ZoneId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Width of images produced by [`reference_png`]; live frames are narrower.
pub const REFERENCE_WIDTH: u32 = 8;
pub const LIVE_WIDTH: u32 = 4;

/// A 4-dimensional descriptor at `offset` from the origin along one axis.
pub fn descriptor_at(offset: f32) -> Descriptor {
    Descriptor::new(vec![offset, 0.0, 0.0, 0.0])
}

fn png(shade: u8) -> Vec<u8> {
    let img = image::GrayImage::from_pixel(REFERENCE_WIDTH, REFERENCE_WIDTH, image::Luma([shade]));
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

/// Encoded reference image bytes.
pub fn reference_png() -> Vec<u8> {
    png(128)
}

/// Different reference image bytes, as after re-registration.
pub fn reference_png_variant() -> Vec<u8> {
    png(96)
}

pub fn live_frame(sequence: u32, is_dark: bool) -> Frame {
    let shade = if is_dark { 0 } else { 140 };
    Frame {
        data: vec![shade; (LIVE_WIDTH * LIVE_WIDTH) as usize],
        width: LIVE_WIDTH,
        height: LIVE_WIDTH,
        sequence,
        is_dark,
    }
}

/// Returns fixed descriptors: one for reference-sized images, one for live frames.
pub struct ScriptedExtractor {
    reference: Option<Descriptor>,
    live: Option<Descriptor>,
    reference_calls: AtomicUsize,
    live_calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(reference: Option<Descriptor>, live: Option<Descriptor>) -> Self {
        Self {
            reference,
            live,
            reference_calls: AtomicUsize::new(0),
            live_calls: AtomicUsize::new(0),
        }
    }

    pub fn reference_calls(&self) -> usize {
        self.reference_calls.load(Ordering::SeqCst)
    }

    pub fn live_calls(&self) -> usize {
        self.live_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DescriptorExtractor for ScriptedExtractor {
    async fn extract(&self, frame: &Frame) -> Result<Option<Descriptor>, ExtractError> {
        if frame.width == REFERENCE_WIDTH {
            self.reference_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reference.clone())
        } else {
            self.live_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.live.clone())
        }
    }
}

/// Hands out a [`ScriptedExtractor`], optionally failing the first loads.
pub struct MockLoader {
    extractor: Arc<ScriptedExtractor>,
    loads: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MockLoader {
    pub fn new(extractor: Arc<ScriptedExtractor>) -> Self {
        Self {
            extractor,
            loads: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for MockLoader {
    async fn load(&self) -> Result<Arc<dyn DescriptorExtractor>, ExtractError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExtractError::ModelNotFound("models/mock.onnx".into()));
        }
        Ok(self.extractor.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraBehavior {
    /// Every frame is a lit live frame.
    Frames,
    /// `next_frame` never completes.
    Hang,
    /// `start` fails as if permission were denied.
    Unavailable,
    /// The stream starts but the first frame fails.
    FailOnFrame,
    /// The first `n` frames are dark.
    DarkThenLit(usize),
}

/// Camera that counts active tracks, so tests can observe release.
pub struct MockCamera {
    behavior: CameraBehavior,
    active: Arc<AtomicUsize>,
    starts: AtomicUsize,
    served: Arc<AtomicUsize>,
}

impl MockCamera {
    pub fn new(behavior: CameraBehavior) -> Self {
        Self {
            behavior,
            active: Arc::new(AtomicUsize::new(0)),
            starts: AtomicUsize::new(0),
            served: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Streams started and not yet stopped.
    pub fn active_tracks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn frames_served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for MockCamera {
    async fn start(&self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        if self.behavior == CameraBehavior::Unavailable {
            return Err(CaptureError::PermissionDenied("mock camera".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            behavior: self.behavior,
            active: self.active.clone(),
            served: self.served.clone(),
            stopped: false,
        }))
    }

    fn describe(&self) -> String {
        "mock camera".into()
    }
}

struct MockStream {
    behavior: CameraBehavior,
    active: Arc<AtomicUsize>,
    served: Arc<AtomicUsize>,
    stopped: bool,
}

#[async_trait]
impl CaptureStream for MockStream {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.stopped {
            return Err(CaptureError::Stopped);
        }
        match self.behavior {
            CameraBehavior::Hang => std::future::pending::<Result<Frame, CaptureError>>().await,
            CameraBehavior::FailOnFrame => Err(CaptureError::CaptureFailed("mock read".into())),
            CameraBehavior::Frames | CameraBehavior::Unavailable => {
                let seq = self.served.fetch_add(1, Ordering::SeqCst) as u32;
                Ok(live_frame(seq, false))
            }
            CameraBehavior::DarkThenLit(dark) => {
                let seq = self.served.fetch_add(1, Ordering::SeqCst);
                Ok(live_frame(seq as u32, seq < dark))
            }
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Reference images held in memory, keyed by their reference string.
#[derive(Default)]
pub struct MemoryReferenceSource {
    images: Mutex<HashMap<ImageRef, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryReferenceSource {
    pub fn insert(&self, image: &str, bytes: Vec<u8>) {
        self.images.lock().unwrap().insert(image.to_string(), bytes);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceImageSource for MemoryReferenceSource {
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(image.clone()))
    }
}

/// In-memory attendance store that records how it was used.
#[derive(Default)]
pub struct MemoryStore {
    zones: Mutex<Vec<Zone>>,
    references: Mutex<HashMap<PersonId, ImageRef>>,
    events: Mutex<Vec<AttendanceEvent>>,
    zone_lookups: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn add_zone(&self, zone: Zone) {
        self.zones.lock().unwrap().push(zone);
    }

    pub fn set_reference(&self, person_id: PersonId, image: &str) {
        self.references
            .lock()
            .unwrap()
            .insert(person_id, image.to_string());
    }

    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn zone_lookups(&self) -> usize {
        self.zone_lookups.load(Ordering::SeqCst)
    }

    /// Make every subsequent `create_event` fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn find_zone(&self, zone_id: ZoneId) -> Result<Option<Zone>, StoreError> {
        self.zone_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .zones
            .lock()
            .unwrap()
            .iter()
            .find(|z| z.id == zone_id)
            .cloned())
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, StoreError> {
        Ok(self.zones.lock().unwrap().clone())
    }

    async fn reference_image(&self, person_id: PersonId) -> Result<Option<ImageRef>, StoreError> {
        Ok(self.references.lock().unwrap().get(&person_id).cloned())
    }

    async fn create_event(&self, event: NewAttendanceEvent) -> Result<AttendanceEvent, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("disk I/O error".into()));
        }
        let mut events = self.events.lock().unwrap();
        let created = AttendanceEvent::from_new(events.len() as i64 + 1, event);
        events.push(created.clone());
        Ok(created)
    }

    async fn history(&self, person_id: PersonId) -> Result<Vec<HistoryEntry>, StoreError> {
        let zones = self.zones.lock().unwrap().clone();
        let mut entries: Vec<HistoryEntry> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.person_id == person_id)
            .map(|e| HistoryEntry {
                location_name: zones
                    .iter()
                    .find(|z| z.id == e.zone_id)
                    .map(|z| z.name.clone())
                    .unwrap_or_default(),
                event: e.clone(),
            })
            .collect();
        entries.sort_by(|a, b| {
            b.event
                .timestamp
                .cmp(&a.event.timestamp)
                .then(b.event.id.cmp(&a.event.id))
        });
        Ok(entries)
    }
}
