use crate::counters::{Delta, Histogram, Target, apply_delta, bump_bucket};
use crate::store::models::{
    Counters, HistoryEvent, HistoryId, HourCount, PlayTime, RatingCount, Session, SessionId,
    SessionItem, SessionSong, Song, SongId,
};
use crate::store::queries::{
    delete_history, delete_session, get_history, get_session, insert_history, insert_session,
    latest_session, session_around, session_from_row, widen_session,
};
use crate::store::{Result, Store};
use rusqlite::{Connection, params};
use std::time::Duration;

/// Groups plays into gap-bounded listening sessions and keeps each session's
/// counters and rating/hour histograms in step with its membership.
#[derive(Debug, Clone, Copy)]
pub struct SessionManager {
    gap: i64,
}

impl SessionManager {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap: gap.as_secs() as i64,
        }
    }

    pub fn gap_secs(&self) -> i64 {
        self.gap
    }

    /// Session for a live play starting at `at`.
    ///
    /// The most recently ended session is extended when its end plus the gap
    /// reaches `at`; otherwise a new session is opened at `at`. A play from
    /// before that session started is bucketed like a historical one.
    pub fn resolve_session(&self, conn: &Connection, at: i64) -> Result<SessionId> {
        if let Some(latest) = latest_session(conn)? {
            if at < latest.started_at - self.gap {
                return self.resolve_historical_session(conn, at);
            }
            if latest.ended_at + self.gap >= at {
                log::debug!("Extending {} (ended {}) for play at {}", latest.id, latest.ended_at, at);
                return Ok(latest.id);
            }
        }
        let id = insert_session(conn, at, at)?;
        log::info!("Opened {id} at {at}");
        Ok(id)
    }

    /// Session for a manually added historical play.
    ///
    /// Joins the latest session whose bounds widened by the gap contain `at`,
    /// otherwise opens a new one. Existing sessions are never merged, even if
    /// the new play bridges two of them.
    pub fn resolve_historical_session(&self, conn: &Connection, at: i64) -> Result<SessionId> {
        if let Some(session) = session_around(conn, at, self.gap)? {
            return Ok(session.id);
        }
        let id = insert_session(conn, at, at)?;
        log::info!("Opened {id} for historical play at {at}");
        Ok(id)
    }

    /// Record one play of `song` in `session`: history row, session bounds,
    /// session counters and both histogram buckets. The song's own chain is
    /// the caller's to update.
    pub fn attach_history_event(
        &self,
        conn: &Connection,
        session: SessionId,
        song: &Song,
        played_at: PlayTime,
        duration: u64,
    ) -> Result<HistoryEvent> {
        let rating = song.rating.unwrap_or(0);
        let id = insert_history(conn, song.id, session, played_at, duration, rating)?;
        let event = get_history(conn, id)?;

        widen_session(conn, session, played_at.unix, event.ended_at())?;
        apply_delta(conn, Target::Session(session), Delta::of_event(&event))?;
        bump_bucket(conn, Histogram::Rating, session, event.rating, 1)?;
        bump_bucket(conn, Histogram::Hour, session, event.hour, 1)?;
        Ok(event)
    }

    /// Inverse of [`attach_history_event`](Self::attach_history_event).
    /// Returns true when the session became empty and was deleted.
    pub fn detach_history_event(&self, conn: &Connection, event: &HistoryEvent) -> Result<bool> {
        let session = event.session_id;
        apply_delta(conn, Target::Session(session), -Delta::of_event(event))?;
        bump_bucket(conn, Histogram::Rating, session, event.rating, -1)?;
        bump_bucket(conn, Histogram::Hour, session, event.hour, -1)?;
        delete_history(conn, event.id)?;

        if get_session(conn, session)?.counters.play_count == 0 {
            delete_session(conn, session)?;
            log::info!("Deleted empty {session}");
            return Ok(true);
        }
        Ok(false)
    }
}

/// Every session, most recent first.
pub fn all_sessions(conn: &Connection) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(
        "SELECT id, started_at, ended_at, play_count, play_time
         FROM sessions ORDER BY ended_at DESC, id DESC",
    )?;
    let sessions = stmt
        .query_map([], session_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(sessions)
}

/// The plays of a session in play order.
pub fn songs_for_session(conn: &Connection, id: SessionId) -> Result<Vec<SessionSong>> {
    get_session(conn, id)?;
    let mut stmt = conn.prepare(
        "SELECT h.id, h.song_id, s.title, a.name, al.name, h.played_at, h.duration
         FROM history h
         JOIN songs s ON s.id = h.song_id
         JOIN artists a ON a.id = s.artist_id
         LEFT JOIN albums al ON al.id = s.album_id
         WHERE h.session_id = ?1
         ORDER BY h.played_at, h.id",
    )?;
    let songs = stmt
        .query_map(params![id.0], |row| {
            Ok(SessionSong {
                history_id: HistoryId(row.get(0)?),
                song_id: SongId(row.get(1)?),
                title: row.get(2)?,
                artist: row.get(3)?,
                album: row.get(4)?,
                played_at: row.get(5)?,
                duration: row.get::<_, i64>(6)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(songs)
}

/// Rating histogram of a session, lowest rating first.
pub fn ratings_for_session(conn: &Connection, id: SessionId) -> Result<Vec<RatingCount>> {
    get_session(conn, id)?;
    let mut stmt = conn.prepare(
        "SELECT rating, count FROM session_ratings WHERE session_id = ?1 ORDER BY rating",
    )?;
    let ratings = stmt
        .query_map(params![id.0], |row| {
            Ok(RatingCount {
                rating: row.get::<_, i64>(0)? as u8,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ratings)
}

/// Hour-of-day histogram of a session, midnight first.
pub fn hours_for_session(conn: &Connection, id: SessionId) -> Result<Vec<HourCount>> {
    get_session(conn, id)?;
    let mut stmt = conn.prepare(
        "SELECT hour, count FROM session_hours WHERE session_id = ?1 ORDER BY hour",
    )?;
    let hours = stmt
        .query_map(params![id.0], |row| {
            Ok(HourCount {
                hour: row.get::<_, i64>(0)? as u8,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(hours)
}

/// Artists heard in a session, most played first.
pub fn artists_for_session(conn: &Connection, id: SessionId) -> Result<Vec<SessionItem>> {
    session_items(
        conn,
        id,
        "SELECT a.name, COUNT(*), SUM(h.duration)
         FROM history h
         JOIN songs s ON s.id = h.song_id
         JOIN artists a ON a.id = s.artist_id
         WHERE h.session_id = ?1
         GROUP BY a.id
         ORDER BY COUNT(*) DESC, SUM(h.duration) DESC, a.name",
    )
}

/// Albums heard in a session, most played first. Plays without an album are skipped.
pub fn albums_for_session(conn: &Connection, id: SessionId) -> Result<Vec<SessionItem>> {
    session_items(
        conn,
        id,
        "SELECT al.name, COUNT(*), SUM(h.duration)
         FROM history h
         JOIN songs s ON s.id = h.song_id
         JOIN albums al ON al.id = s.album_id
         WHERE h.session_id = ?1
         GROUP BY al.id
         ORDER BY COUNT(*) DESC, SUM(h.duration) DESC, al.name",
    )
}

fn session_items(conn: &Connection, id: SessionId, sql: &str) -> Result<Vec<SessionItem>> {
    get_session(conn, id)?;
    let mut stmt = conn.prepare(sql)?;
    let items = stmt
        .query_map(params![id.0], |row| {
            Ok(SessionItem {
                name: row.get(0)?,
                counters: Counters {
                    play_count: row.get::<_, i64>(1)? as u64,
                    play_time: row.get::<_, i64>(2)? as u64,
                },
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

impl Store {
    pub fn all_sessions(&self) -> Result<Vec<Session>> {
        all_sessions(&self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::store::queries::{find_or_create_artist, find_or_create_song, get_song};

    const T0: i64 = 1_700_000_000;

    fn manager() -> SessionManager {
        SessionManager::new(Duration::from_secs(300))
    }

    fn utc(unix: i64) -> PlayTime {
        PlayTime { unix, utc_offset: 0 }
    }

    fn play(store: &Store, mgr: &SessionManager, title: &str, at: i64, duration: u64) -> HistoryEvent {
        let artist = find_or_create_artist(&store.conn, "X").unwrap();
        let song_id = find_or_create_song(&store.conn, title, artist, None).unwrap();
        let song = get_song(&store.conn, song_id).unwrap();
        let session = mgr.resolve_session(&store.conn, at).unwrap();
        mgr.attach_history_event(&store.conn, session, &song, utc(at), duration).unwrap()
    }

    #[test]
    fn test_plays_within_gap_share_a_session() {
        let store = Store::open_in_memory().unwrap();
        let mgr = manager();
        let a = play(&store, &mgr, "A", T0, 180);
        let b = play(&store, &mgr, "B", T0 + 60, 200);
        assert_eq!(a.session_id, b.session_id);

        let sessions = store.all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].started_at, T0);
        assert_eq!(sessions[0].ended_at, T0 + 260);
        assert_eq!(sessions[0].counters.play_count, 2);
        assert_eq!(sessions[0].counters.play_time, 380);

        let songs = songs_for_session(&store.conn, a.session_id).unwrap();
        let titles: Vec<_> = songs.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[test]
    fn test_gap_boundary_is_inclusive() {
        let store = Store::open_in_memory().unwrap();
        let mgr = manager();
        let a = play(&store, &mgr, "A", T0, 100);
        // Ends at T0+100; exactly G later still joins
        let b = play(&store, &mgr, "B", T0 + 100 + 300, 100);
        assert_eq!(a.session_id, b.session_id);
        // One second past G opens a new session
        let c = play(&store, &mgr, "C", T0 + 500 + 301, 100);
        assert_ne!(b.session_id, c.session_id);

        let sessions = store.all_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, c.session_id, "most recent first");
    }

    #[test]
    fn test_play_older_than_latest_session_does_not_join_it() {
        let store = Store::open_in_memory().unwrap();
        let mgr = manager();
        let late = play(&store, &mgr, "Late", T0 + 86_400, 100);
        let early = play(&store, &mgr, "Early", T0, 100);
        assert_ne!(late.session_id, early.session_id);
        // Within the gap before the start still joins
        let lead_in = play(&store, &mgr, "Lead-in", T0 + 86_400 - 250, 100);
        assert_eq!(lead_in.session_id, late.session_id);

        let sessions = store.all_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].started_at, T0 + 86_400 - 250);
        assert_eq!(sessions[0].ended_at, T0 + 86_500);
        assert_eq!(sessions[1].started_at, T0);
        assert_eq!(sessions[1].ended_at, T0 + 100);
    }

    #[test]
    fn test_bucketing_is_deterministic() {
        let offsets = [0, 50, 300, 1_000, 1_100, 5_000, 5_250, 5_500];
        let boundaries = || {
            let store = Store::open_in_memory().unwrap();
            let mgr = manager();
            for (i, off) in offsets.iter().enumerate() {
                play(&store, &mgr, &format!("S{i}"), T0 + off, 30);
            }
            store
                .all_sessions()
                .unwrap()
                .into_iter()
                .map(|s| (s.started_at, s.ended_at, s.counters.play_count))
                .collect::<Vec<_>>()
        };
        let first = boundaries();
        assert_eq!(first, boundaries());
        assert_eq!(
            first,
            vec![
                (T0 + 5_000, T0 + 5_530, 3),
                (T0 + 1_000, T0 + 1_130, 2),
                (T0, T0 + 330, 3),
            ]
        );
    }

    #[test]
    fn test_histograms_track_membership() {
        let store = Store::open_in_memory().unwrap();
        let mgr = manager();
        let a = play(&store, &mgr, "A", T0, 60);
        play(&store, &mgr, "B", T0 + 100, 60);

        let hours = hours_for_session(&store.conn, a.session_id).unwrap();
        let total: u64 = hours.iter().map(|h| h.count).sum();
        assert_eq!(total, 2);
        // 1700000000 is 22:13 UTC
        assert_eq!(hours, vec![HourCount { hour: 22, count: 2 }]);

        let ratings = ratings_for_session(&store.conn, a.session_id).unwrap();
        assert_eq!(ratings, vec![RatingCount { rating: 0, count: 2 }]);
    }

    #[test]
    fn test_detach_last_play_deletes_session() {
        let store = Store::open_in_memory().unwrap();
        let mgr = manager();
        let a = play(&store, &mgr, "A", T0, 60);
        let b = play(&store, &mgr, "B", T0 + 100, 60);

        assert!(!mgr.detach_history_event(&store.conn, &a).unwrap());
        let session = get_session(&store.conn, b.session_id).unwrap();
        assert_eq!(session.counters.play_count, 1);
        // Bounds never shrink on removal
        assert_eq!(session.started_at, T0);

        assert!(mgr.detach_history_event(&store.conn, &b).unwrap());
        assert!(store.all_sessions().unwrap().is_empty());
        assert!(matches!(
            hours_for_session(&store.conn, b.session_id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_historical_play_joins_surrounding_session() {
        let store = Store::open_in_memory().unwrap();
        let mgr = manager();
        let a = play(&store, &mgr, "A", T0, 60);
        play(&store, &mgr, "B", T0 + 10_000, 60);

        // Just before the first session starts, within the gap
        let joined = mgr.resolve_historical_session(&store.conn, T0 - 200).unwrap();
        assert_eq!(joined, a.session_id);
        // Far from both sessions
        let fresh = mgr.resolve_historical_session(&store.conn, T0 + 5_000).unwrap();
        assert_ne!(fresh, a.session_id);
        assert_eq!(store.all_sessions().unwrap().len(), 3);
    }

    #[test]
    fn test_artists_for_session_aggregates_plays() {
        let store = Store::open_in_memory().unwrap();
        let mgr = manager();
        let a = play(&store, &mgr, "A", T0, 60);
        play(&store, &mgr, "B", T0 + 70, 90);

        let artists = artists_for_session(&store.conn, a.session_id).unwrap();
        assert_eq!(artists.len(), 1);
        assert_eq!(artists[0].name, "X");
        assert_eq!(artists[0].counters.play_count, 2);
        assert_eq!(artists[0].counters.play_time, 150);
        assert!(albums_for_session(&store.conn, a.session_id).unwrap().is_empty());
    }
}
