//! Latest-frame hub: one single-slot buffer per camera.
//!
//! The stream worker is the only writer of its slot; HTTP handlers are the
//! readers. Publication replaces the slot contents atomically under a short
//! write lock, and readers clone the cheap [`Bytes`] handle out of the lock
//! before doing any I/O. Memory use is bounded at one encoded frame per
//! camera.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;

use tally_types::CamName;

/// One published, encoded annotated frame.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    /// Encoded JPEG bytes.
    pub bytes: Bytes,
    /// Capture timestamp of the source frame.
    pub ts: DateTime<Utc>,
    /// Monotonic per-camera sequence number.
    pub seq: u64,
    /// Wall-clock instant of publication; frame age is measured from this.
    pub published_at: Instant,
}

impl PublishedFrame {
    pub fn age(&self) -> std::time::Duration {
        self.published_at.elapsed()
    }
}

#[derive(Default)]
struct Slot {
    latest: RwLock<Option<PublishedFrame>>,
}

/// Per-camera single-slot frame store. The camera set is fixed at startup.
pub struct FrameHub {
    slots: BTreeMap<CamName, Slot>,
}

impl FrameHub {
    pub fn new<I: IntoIterator<Item = CamName>>(cameras: I) -> Self {
        Self {
            slots: cameras.into_iter().map(|c| (c, Slot::default())).collect(),
        }
    }

    pub fn contains(&self, cam: &CamName) -> bool {
        self.slots.contains_key(cam)
    }

    /// Publish a new frame, returning its sequence number.
    ///
    /// Publications are strictly monotonic per camera: a frame whose
    /// timestamp precedes the slot's current frame is dropped rather than
    /// published out of order.
    pub fn publish(&self, cam: &CamName, bytes: Bytes, ts: DateTime<Utc>) -> Option<u64> {
        let slot = match self.slots.get(cam) {
            Some(s) => s,
            None => {
                warn!(camera = %cam, "publish to unknown camera");
                return None;
            }
        };

        let mut latest = slot.latest.write();
        let seq = match latest.as_ref() {
            Some(prev) if ts < prev.ts => {
                warn!(camera = %cam, "dropping out-of-order frame");
                return None;
            }
            Some(prev) => prev.seq + 1,
            None => 1,
        };
        *latest = Some(PublishedFrame {
            bytes,
            ts,
            seq,
            published_at: Instant::now(),
        });
        Some(seq)
    }

    /// Snapshot of the newest frame for `cam`, if any was ever published.
    pub fn latest(&self, cam: &CamName) -> Option<PublishedFrame> {
        self.slots.get(cam).and_then(|s| s.latest.read().clone())
    }
}
