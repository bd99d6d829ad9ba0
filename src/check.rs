//! Reconstruction check: rebuild every aggregate from the live history and
//! compare it with what the incremental write path stored.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use rayon::prelude::*;
use rusqlite::Connection;

use crate::store::Result;
use crate::store::models::{AlbumId, ArtistId, Counters, SessionId, SongId};
use crate::store::queries::{all_albums, all_artists, all_history, all_songs};
use crate::sessions::all_sessions;

/// One stored value that disagrees with the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    pub entity: String,
    pub field: &'static str,
    pub stored: u64,
    pub expected: u64,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: stored {}, expected {}",
            self.entity, self.field, self.stored, self.expected
        )
    }
}

/// Aggregates rebuilt from history, partial per rayon worker then merged.
#[derive(Default)]
struct Rebuilt {
    songs: HashMap<SongId, Counters>,
    sessions: HashMap<SessionId, Counters>,
    ratings: HashMap<(SessionId, u8), u64>,
    hours: HashMap<(SessionId, u8), u64>,
}

impl Rebuilt {
    fn merge(mut self, other: Rebuilt) -> Rebuilt {
        merge_counters(&mut self.songs, other.songs);
        merge_counters(&mut self.sessions, other.sessions);
        for (k, n) in other.ratings {
            *self.ratings.entry(k).or_default() += n;
        }
        for (k, n) in other.hours {
            *self.hours.entry(k).or_default() += n;
        }
        self
    }
}

fn merge_counters<K: Eq + Hash>(into: &mut HashMap<K, Counters>, from: HashMap<K, Counters>) {
    for (k, c) in from {
        add(into.entry(k).or_default(), c);
    }
}

fn add(into: &mut Counters, c: Counters) {
    into.play_count += c.play_count;
    into.play_time += c.play_time;
}

/// Compare every stored counter and histogram bucket against the history.
/// An empty result means the store is consistent.
pub fn verify(conn: &Connection) -> Result<Vec<Discrepancy>> {
    let history = all_history(conn)?;
    let rebuilt = history
        .par_iter()
        .fold(Rebuilt::default, |mut acc, event| {
            let play = Counters {
                play_count: 1,
                play_time: event.duration,
            };
            add(acc.songs.entry(event.song_id).or_default(), play);
            add(acc.sessions.entry(event.session_id).or_default(), play);
            *acc.ratings.entry((event.session_id, event.rating)).or_default() += 1;
            *acc.hours.entry((event.session_id, event.hour)).or_default() += 1;
            acc
        })
        .reduce(Rebuilt::default, Rebuilt::merge);

    let mut found = Vec::new();
    let mut artists: HashMap<ArtistId, Counters> = HashMap::new();
    let mut albums: HashMap<AlbumId, Counters> = HashMap::new();

    for song in all_songs(conn)? {
        let expected = rebuilt.songs.get(&song.id).copied().unwrap_or_default();
        compare(&mut found, song.id, song.counters, expected);
        add(artists.entry(song.artist_id).or_default(), expected);
        if let Some(album) = song.album_id {
            add(albums.entry(album).or_default(), expected);
        }
    }
    for artist in all_artists(conn)? {
        let expected = artists.get(&artist.id).copied().unwrap_or_default();
        compare(&mut found, artist.id, artist.counters, expected);
    }
    for album in all_albums(conn)? {
        let expected = albums.get(&album.id).copied().unwrap_or_default();
        compare(&mut found, album.id, album.counters, expected);
    }

    let sessions = all_sessions(conn)?;
    for session in &sessions {
        let expected = rebuilt.sessions.get(&session.id).copied().unwrap_or_default();
        compare(&mut found, session.id, session.counters, expected);
        // A session lives exactly as long as it has plays
        if expected.play_count == 0 {
            found.push(Discrepancy {
                entity: session.id.to_string(),
                field: "exists",
                stored: 1,
                expected: 0,
            });
        }
    }
    for (id, _) in rebuilt.sessions.iter().filter(|(id, _)| !sessions.iter().any(|s| s.id == **id)) {
        found.push(Discrepancy {
            entity: id.to_string(),
            field: "exists",
            stored: 0,
            expected: 1,
        });
    }

    compare_buckets(&mut found, "rating", stored_buckets(conn, "session_ratings", "rating")?, &rebuilt.ratings);
    compare_buckets(&mut found, "hour", stored_buckets(conn, "session_hours", "hour")?, &rebuilt.hours);

    if !found.is_empty() {
        log::warn!("Consistency check found {} discrepancies", found.len());
    }
    Ok(found)
}

fn compare(found: &mut Vec<Discrepancy>, entity: impl fmt::Display, stored: Counters, expected: Counters) {
    if stored.play_count != expected.play_count {
        found.push(Discrepancy {
            entity: entity.to_string(),
            field: "play_count",
            stored: stored.play_count,
            expected: expected.play_count,
        });
    }
    if stored.play_time != expected.play_time {
        found.push(Discrepancy {
            entity: entity.to_string(),
            field: "play_time",
            stored: stored.play_time,
            expected: expected.play_time,
        });
    }
}

fn stored_buckets(conn: &Connection, table: &str, column: &str) -> Result<HashMap<(SessionId, u8), u64>> {
    let mut stmt = conn.prepare(&format!("SELECT session_id, {column}, count FROM {table}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                (SessionId(row.get(0)?), row.get::<_, i64>(1)? as u8),
                row.get::<_, i64>(2)? as u64,
            ))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

fn compare_buckets(
    found: &mut Vec<Discrepancy>,
    kind: &'static str,
    stored: HashMap<(SessionId, u8), u64>,
    expected: &HashMap<(SessionId, u8), u64>,
) {
    let mut keys: Vec<_> = stored.keys().chain(expected.keys()).copied().collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        let s = stored.get(&key).copied().unwrap_or(0);
        let e = expected.get(&key).copied().unwrap_or(0);
        if s != e {
            found.push(Discrepancy {
                entity: format!("{} {kind} {}", key.0, key.1),
                field: "bucket",
                stored: s,
                expected: e,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::store::migrate::tests::seed_v1;

    #[test]
    fn test_empty_store_is_consistent() {
        let store = Store::open_in_memory().unwrap();
        assert!(verify(&store.conn).unwrap().is_empty());
    }

    #[test]
    fn test_migrated_store_is_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("v1.db")).unwrap();
        seed_v1(&store, false);
        store.migrate().unwrap();
        assert!(verify(&store.conn).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_counter_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("p.db")).unwrap();
        seed_v1(&store, true);
        store.migrate().unwrap();
        store
            .conn
            .execute("UPDATE artists SET play_count = play_count + 1", [])
            .unwrap();
        store
            .conn
            .execute("UPDATE session_hours SET count = 5", [])
            .unwrap();

        let found = verify(&store.conn).unwrap();
        assert!(found.iter().any(|d| d.field == "play_count" && d.entity.starts_with("artist")));
        assert!(found.iter().any(|d| d.field == "bucket" && d.stored == 5 && d.expected == 2));
        assert_eq!(found.len(), 2);
    }
}
