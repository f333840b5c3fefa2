//! Pure mapping from a release to an external event payload.
//!
//! No I/O and no side effects; everything the calendar client needs is in
//! the returned [`EventPayload`], including the release fingerprint that
//! makes the idempotency lookup possible.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{Release, ReleaseType, Work, WorkKind};

/// Reminder offsets, in minutes before the event.
pub const DEFAULT_REMINDER_MINUTES: [u32; 2] = [60, 1440];

/// Everything needed to create or update one external calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Event title, e.g. "Frieren Episode 5".
    pub summary: String,
    /// Human-readable body: platform and source link.
    pub description: String,
    /// Single all-day date.
    pub date: NaiveDate,
    /// Category colour key, derived from the work kind.
    pub color_id: String,
    /// Deterministic identity key, stored in the event's private metadata.
    pub fingerprint: String,
    /// Reminder offsets in minutes before the event.
    pub reminder_minutes: Vec<u32>,
}

/// Colour key for a work kind.
///
/// Google colorId values: 7 is "Peacock" (blue), 10 is "Basil" (green).
fn color_for_kind(kind: WorkKind) -> &'static str {
    match kind {
        WorkKind::Anime => "7",
        WorkKind::Manga => "10",
    }
}

/// Build the event payload for one release.
pub fn build_event(work: &Work, release: &Release) -> EventPayload {
    let summary = match release.release_type {
        ReleaseType::Episode => format!("{} Episode {}", work.title, release.number),
        ReleaseType::Volume => format!("{} Vol. {}", work.title, release.number),
    };

    let mut description = format!("Platform: {}", release.platform);
    if let Some(url) = &release.source_url {
        description.push('\n');
        description.push_str(url);
    }

    EventPayload {
        summary,
        description,
        date: release.release_date,
        color_id: color_for_kind(work.kind).to_string(),
        fingerprint: release.fingerprint(),
        reminder_minutes: DEFAULT_REMINDER_MINUTES.to_vec(),
    }
}
