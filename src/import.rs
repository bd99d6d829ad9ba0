//! Bulk import of play records on a background thread.
//!
//! Each record is its own queued write, so readers and interactive edits
//! interleave with the import and a cancelled import keeps whatever it
//! already committed.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use serde::Serialize;
use thiserror::Error;

use crate::profile::{Handle, ProfileError, ProfileEvent, Shared, validate_play};
use crate::store::models::PlayEvent;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid import file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read a JSON array of play records.
pub fn read_import_file(path: &Path) -> Result<Vec<PlayEvent>, ImportError> {
    let contents = std::fs::read_to_string(path)?;
    parse_plays(&contents)
}

pub fn parse_plays(json: &str) -> Result<Vec<PlayEvent>, ImportError> {
    Ok(serde_json::from_str(json)?)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub imported: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Set when the import stopped early because the store stopped accepting writes.
    pub aborted: Option<String>,
}

/// A running import.
pub struct ImportHandle {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<ImportSummary>>,
}

impl ImportHandle {
    /// Ask the import to stop after the record it is applying.
    pub fn cancel(&self) {
        self.shared.cancel_import.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Block until the import ends.
    pub fn wait(mut self) -> ImportSummary {
        let Some(worker) = self.worker.take() else {
            return ImportSummary::default();
        };
        worker.join().unwrap_or_else(|_| ImportSummary {
            aborted: Some("import worker panicked".into()),
            ..ImportSummary::default()
        })
    }
}

pub(crate) fn spawn(
    handle: Handle,
    mut plays: Vec<PlayEvent>,
) -> Result<ImportHandle, ProfileError> {
    let shared = Arc::clone(&handle.shared);
    if shared.importing.swap(true, Ordering::SeqCst) {
        return Err(ProfileError::StoreBusy("an import is already running".into()));
    }
    // Sessions are built in play order
    plays.sort_by_key(|play| play.played_at.timestamp());
    shared.cancel_import.store(false, Ordering::SeqCst);
    log::info!("Importing {} plays", plays.len());

    let worker = std::thread::spawn(move || run(handle, plays));
    Ok(ImportHandle {
        shared,
        worker: Some(worker),
    })
}

fn run(handle: Handle, plays: Vec<PlayEvent>) -> ImportSummary {
    let shared = Arc::clone(&handle.shared);
    let total = plays.len();
    let mut summary = ImportSummary {
        total,
        ..ImportSummary::default()
    };

    for (i, play) in plays.into_iter().enumerate() {
        if shared.cancel_import.load(Ordering::SeqCst) {
            log::info!("Import cancelled after {} of {} plays", i, total);
            summary.cancelled = true;
            break;
        }

        let outcome = validate_play(&play).and_then(|()| handle.write(false, move |ed| ed.add_play(&play)));
        match outcome {
            Ok(_) => summary.imported += 1,
            Err(
                e @ (ProfileError::StoreUnavailable(_)
                | ProfileError::MigrationFailed { .. }
                | ProfileError::StoreBusy(_)),
            ) => {
                log::error!("Import stopped at record {}: {}", i + 1, e);
                summary.aborted = Some(e.to_string());
                break;
            }
            Err(e) => {
                log::warn!("Skipping import record {}: {}", i + 1, e);
                summary.failed += 1;
            }
        }
        shared.emit(ProfileEvent::ImportProgress((i + 1) as f64 / total as f64));
    }

    shared.importing.store(false, Ordering::SeqCst);
    log::info!(
        "Import finished: {} imported, {} failed",
        summary.imported,
        summary.failed
    );
    shared.emit(ProfileEvent::ImportFinished(summary.clone()));
    if summary.imported > 0 {
        shared.emit(ProfileEvent::DidUpdate);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Profile, ProfileConfig};
    use chrono::{DateTime, FixedOffset};

    const T0: i64 = 1_700_000_000;

    fn at(offset: i64) -> DateTime<FixedOffset> {
        let utc = FixedOffset::east_opt(0).unwrap();
        DateTime::from_timestamp(T0 + offset, 0).unwrap().with_timezone(&utc)
    }

    fn plays(n: usize) -> Vec<PlayEvent> {
        (0..n)
            .map(|i| PlayEvent::new(format!("Track {i}"), "X", Some("LP"), 100, at(i as i64 * 120)))
            .collect()
    }

    #[test]
    fn test_parse_plays() {
        let json = r#"[
            {"title": "A", "artist": "X", "duration": 180, "played_at": "2024-03-01T23:30:00-05:00"},
            {"title": "B", "artist": "X", "album": "LP", "duration": 60,
             "played_at": "2024-03-01T23:35:00-05:00", "rating": 4}
        ]"#;
        let plays = parse_plays(json).unwrap();
        assert_eq!(plays.len(), 2);
        assert_eq!(plays[0].album, None);
        assert_eq!(plays[1].rating, Some(4));
        assert_eq!(plays[1].played_at.offset().local_minus_utc(), -5 * 3600);

        assert!(matches!(parse_plays("{\"title\": 1}"), Err(ImportError::Json(_))));
    }

    #[test]
    fn test_import_reports_progress_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(ProfileConfig::new(dir.path().join("p.db")));
        let mut rx = profile.subscribe();

        let mut batch = plays(4);
        batch.push(PlayEvent::new("", "X", None, 10, at(10_000)));
        let summary = profile.start_import(batch).unwrap().wait();
        assert_eq!(summary.imported, 4);
        assert_eq!(summary.failed, 1);
        assert!(!summary.cancelled);
        assert!(!profile.import_in_progress());

        let mut progress = Vec::new();
        let mut finished = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProfileEvent::ImportProgress(p) => progress.push(p),
                ProfileEvent::ImportFinished(s) => finished = Some(s),
                _ => {}
            }
        }
        assert_eq!(progress.len(), 5);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last().copied(), Some(1.0));
        assert_eq!(finished, Some(summary));

        let sessions = profile.all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].counters.play_count, 4);
        assert!(profile.check().unwrap().is_empty());
    }

    #[test]
    fn test_second_import_is_busy_and_cancel_keeps_committed_items() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(ProfileConfig::new(dir.path().join("p.db")));

        // Hold the writer so the cancel lands before the import gets going
        let (open_gate, gate) = std::sync::mpsc::channel::<()>();
        profile
            .handle
            .enqueue(move |_| {
                let _ = gate.recv();
            })
            .unwrap();

        let running = profile.start_import(plays(500)).unwrap();
        assert!(profile.import_in_progress());
        assert!(matches!(
            profile.start_import(plays(1)),
            Err(ProfileError::StoreBusy(_))
        ));

        running.cancel();
        open_gate.send(()).unwrap();
        let summary = running.wait();
        assert!(summary.cancelled);
        assert!(summary.imported <= 1, "imported {}", summary.imported);
        assert!(!profile.import_in_progress());

        let stored: u64 = profile
            .all_sessions()
            .unwrap()
            .iter()
            .map(|s| s.counters.play_count)
            .sum();
        assert_eq!(stored, summary.imported as u64);
        assert!(profile.check().unwrap().is_empty());

        // A new import may start once the old one is done
        let summary = profile.start_import(plays(2)).unwrap().wait();
        assert!(!summary.cancelled);
        assert_eq!(summary.imported, 2);
    }

    #[test]
    fn test_unsorted_import_respects_session_gap() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(ProfileConfig {
            session_gap: std::time::Duration::from_secs(300),
            ..ProfileConfig::new(dir.path().join("p.db"))
        });

        let batch = vec![
            PlayEvent::new("Late", "X", None, 100, at(86_400)),
            PlayEvent::new("Early", "X", None, 100, at(0)),
            PlayEvent::new("Late 2", "X", None, 100, at(86_520)),
        ];
        let summary = profile.start_import(batch).unwrap().wait();
        assert_eq!(summary.imported, 3);

        let sessions = profile.all_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!((sessions[0].started_at, sessions[0].ended_at), (T0 + 86_400, T0 + 86_620));
        assert_eq!(sessions[0].counters.play_count, 2);
        assert_eq!((sessions[1].started_at, sessions[1].ended_at), (T0, T0 + 100));
        assert!(profile.check().unwrap().is_empty());
    }

    #[test]
    fn test_out_of_range_duration_is_counted_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(ProfileConfig::new(dir.path().join("p.db")));

        let mut batch = plays(2);
        batch.push(PlayEvent::new("Forever", "X", None, u64::MAX, at(300)));
        let summary = profile.start_import(batch).unwrap().wait();
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.aborted, None);
        assert!(profile.check().unwrap().is_empty());
    }
}
