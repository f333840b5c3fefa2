//! Domain types for works and their releases.
//!
//! A [`Work`] is a tracked series (anime or manga); a [`Release`] is one
//! dated unit of it (an episode or a volume) on a given platform. Both are
//! owned by the release repository -- the sync engine reads them and never
//! mutates them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Kind of tracked work. Drives event categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Anime,
    Manga,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Anime => "anime",
            WorkKind::Manga => "manga",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anime" => Some(WorkKind::Anime),
            "manga" => Some(WorkKind::Manga),
            _ => None,
        }
    }
}

/// A tracked series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: i64,
    pub title: String,
    pub kind: WorkKind,
}

/// Type of a release unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    Episode,
    Volume,
}

impl ReleaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::Episode => "episode",
            ReleaseType::Volume => "volume",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episode" => Some(ReleaseType::Episode),
            "volume" => Some(ReleaseType::Volume),
            _ => None,
        }
    }
}

/// One dated release of a work.
///
/// Natural identity is `(work_id, release_type, number, platform,
/// release_date)`; `id` is the repository's surrogate key. The `cancelled`
/// flag is set upstream when a release is withdrawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub work_id: i64,
    pub release_type: ReleaseType,
    pub number: u32,
    pub platform: String,
    pub release_date: NaiveDate,
    pub source_url: Option<String>,
    pub cancelled: bool,
}

impl Release {
    /// Deterministic identity key embedded in external events.
    ///
    /// Format: `"<work_id>-<release_type>-<number>"`, e.g. `"1-episode-5"`.
    /// Used to find an event created by a prior attempt whose result was
    /// never recorded locally.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}-{}-{}",
            self.work_id,
            self.release_type.as_str(),
            self.number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(work_id: i64, release_type: ReleaseType, number: u32) -> Release {
        Release {
            id: 1,
            work_id,
            release_type,
            number,
            platform: "X".to_string(),
            release_date: NaiveDate::from_ymd_opt(2025, 12, 20).unwrap(),
            source_url: None,
            cancelled: false,
        }
    }

    #[test]
    fn fingerprint_format() {
        let r = release(1, ReleaseType::Episode, 5);
        assert_eq!(r.fingerprint(), "1-episode-5");

        let r = release(42, ReleaseType::Volume, 12);
        assert_eq!(r.fingerprint(), "42-volume-12");
    }

    #[test]
    fn fingerprint_ignores_platform_and_date() {
        let mut a = release(7, ReleaseType::Episode, 3);
        let mut b = release(7, ReleaseType::Episode, 3);
        a.platform = "X".to_string();
        b.platform = "Y".to_string();
        b.release_date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn release_type_parse_roundtrip() {
        for rt in [ReleaseType::Episode, ReleaseType::Volume] {
            assert_eq!(ReleaseType::parse(rt.as_str()), Some(rt));
        }
        assert_eq!(ReleaseType::parse("chapter"), None);
    }

    #[test]
    fn work_kind_parse_roundtrip() {
        for kind in [WorkKind::Anime, WorkKind::Manga] {
            assert_eq!(WorkKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(WorkKind::parse(""), None);
    }
}
