//! Release subcommand: the operator-facing input surface of the repository.

use std::sync::Arc;

use clap::Subcommand;
use releasecal_core::model::{ReleaseType, WorkKind};
use releasecal_core::storage::releases::{NewRelease, SqliteReleaseRepository};
use releasecal_core::storage::Database;

/// Release actions.
#[derive(Subcommand)]
pub enum ReleaseAction {
    /// Record a newly discovered release
    Add {
        /// Work identifier from the upstream source
        #[arg(long)]
        work_id: i64,
        /// Work title
        #[arg(long)]
        title: String,
        /// Work kind (anime, manga)
        #[arg(long, default_value = "anime")]
        kind: String,
        /// Release type (episode, volume)
        #[arg(long, default_value = "episode")]
        release_type: String,
        /// Episode or volume number
        #[arg(long)]
        number: u32,
        /// Platform the release appears on
        #[arg(long)]
        platform: String,
        /// Release date (YYYY-MM-DD)
        #[arg(long)]
        date: String,
        /// Source URL
        #[arg(long)]
        url: Option<String>,
    },
    /// List known releases, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Mark a release cancelled upstream
    Cancel { release_id: i64 },
    /// Move a release to a new date
    Reschedule {
        release_id: i64,
        /// New release date (YYYY-MM-DD)
        date: String,
    },
}

/// Run the release command.
pub fn run(action: ReleaseAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open()?);
    let repo = SqliteReleaseRepository::new(db);

    match action {
        ReleaseAction::Add {
            work_id,
            title,
            kind,
            release_type,
            number,
            platform,
            date,
            url,
        } => {
            let work_kind = WorkKind::parse(&kind)
                .ok_or_else(|| format!("unknown work kind '{kind}' (anime, manga)"))?;
            let release_type = ReleaseType::parse(&release_type).ok_or_else(|| {
                format!("unknown release type '{release_type}' (episode, volume)")
            })?;

            let id = repo.insert(&NewRelease {
                work_id,
                work_title: title,
                work_kind,
                release_type,
                number,
                platform,
                release_date: date.parse()?,
                source_url: url,
            })?;
            println!("Release created: #{id}");
        }
        ReleaseAction::List { limit, json } => {
            let releases = repo.list(limit)?;
            if json {
                let items: Vec<serde_json::Value> = releases
                    .iter()
                    .map(|(work, release)| {
                        serde_json::json!({
                            "id": release.id,
                            "work": work.title,
                            "kind": work.kind.as_str(),
                            "type": release.release_type.as_str(),
                            "number": release.number,
                            "platform": release.platform,
                            "date": release.release_date.to_string(),
                            "cancelled": release.cancelled,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if releases.is_empty() {
                println!("No releases recorded.");
            } else {
                for (work, release) in releases {
                    let cancelled = if release.cancelled { " (cancelled)" } else { "" };
                    println!(
                        "#{} {} {} {} [{}] on {}{}",
                        release.id,
                        work.title,
                        release.release_type.as_str(),
                        release.number,
                        release.platform,
                        release.release_date,
                        cancelled,
                    );
                }
            }
        }
        ReleaseAction::Cancel { release_id } => {
            if repo.mark_cancelled(release_id)? {
                println!("Release #{release_id} marked cancelled.");
            } else {
                println!("Release #{release_id} not found.");
            }
        }
        ReleaseAction::Reschedule { release_id, date } => {
            if repo.reschedule(release_id, date.parse()?)? {
                println!("Release #{release_id} moved to {date}.");
            } else {
                println!("Release #{release_id} not found.");
            }
        }
    }
    Ok(())
}
