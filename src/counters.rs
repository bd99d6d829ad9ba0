//! Paired increment/decrement of the (count, time) counters.
//!
//! Aggregates are never recomputed on the write path. Every play adds a
//! [`Delta`] along its ownership chain (song, artist, album) and to its
//! session; every removal applies the negated delta. A delta that would take
//! any counter below zero aborts the enclosing transaction.

use crate::store::models::{AlbumId, ArtistId, HistoryEvent, SessionId, Song, SongId};
use crate::store::{Result, StoreError};
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::ops::Neg;

/// Signed change to a (count, time) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub count: i64,
    pub time: i64,
}

impl Delta {
    /// One play of `seconds`.
    pub fn play(seconds: u64) -> Self {
        Self {
            count: 1,
            time: i64::try_from(seconds).unwrap_or(i64::MAX),
        }
    }

    /// Everything currently recorded on a song.
    pub fn of_song(song: &Song) -> Self {
        Self {
            count: song.counters.play_count as i64,
            time: song.counters.play_time as i64,
        }
    }

    pub fn of_event(event: &HistoryEvent) -> Self {
        Self::play(event.duration)
    }

    pub fn is_zero(&self) -> bool {
        self.count == 0 && self.time == 0
    }
}

impl Neg for Delta {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            count: -self.count,
            time: -self.time,
        }
    }
}

/// A row carrying counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Song(SongId),
    Artist(ArtistId),
    Album(AlbumId),
    Session(SessionId),
}

impl Target {
    fn table(&self) -> &'static str {
        match self {
            Self::Song(_) => "songs",
            Self::Artist(_) => "artists",
            Self::Album(_) => "albums",
            Self::Session(_) => "sessions",
        }
    }

    fn id(&self) -> i64 {
        match self {
            Self::Song(id) => id.0,
            Self::Artist(id) => id.0,
            Self::Album(id) => id.0,
            Self::Session(id) => id.0,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Song(id) => id.fmt(f),
            Self::Artist(id) => id.fmt(f),
            Self::Album(id) => id.fmt(f),
            Self::Session(id) => id.fmt(f),
        }
    }
}

/// Song -> artist -> album: the path a play's counters propagate along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain {
    pub song: SongId,
    pub artist: ArtistId,
    pub album: Option<AlbumId>,
}

impl Chain {
    pub fn of(song: &Song) -> Self {
        Self {
            song: song.id,
            artist: song.artist_id,
            album: song.album_id,
        }
    }

    fn targets(&self) -> impl Iterator<Item = Target> {
        [
            Some(Target::Song(self.song)),
            Some(Target::Artist(self.artist)),
            self.album.map(Target::Album),
        ]
        .into_iter()
        .flatten()
    }
}

/// Add `delta` to one row's counters.
pub fn apply_delta(conn: &Connection, target: Target, delta: Delta) -> Result<()> {
    if delta.is_zero() {
        return Ok(());
    }
    let table = target.table();
    let changed = conn.execute(
        &format!(
            "UPDATE {table} SET play_count = play_count + ?1, play_time = play_time + ?2
             WHERE id = ?3 AND play_count + ?1 >= 0 AND play_time + ?2 >= 0"
        ),
        params![delta.count, delta.time, target.id()],
    )?;
    if changed == 1 {
        return Ok(());
    }

    let exists: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE id = ?1"),
            params![target.id()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::NotFound(target.to_string()));
    }
    let msg = format!(
        "applying ({:+}, {:+}s) would drive {} below zero",
        delta.count, delta.time, target
    );
    log::error!("{msg}");
    Err(StoreError::Invariant(msg))
}

/// Apply `delta` to every link of the chain. Callers run this inside the
/// operation's transaction, so a failure on any link rolls back all of them.
pub fn apply_chain(conn: &Connection, chain: Chain, delta: Delta) -> Result<()> {
    for target in chain.targets() {
        apply_delta(conn, target, delta)?;
    }
    Ok(())
}

/// Move an effect from one chain to another: `-delta` on `old`, then
/// `+delta` on `new`. Links shared by both chains net to zero.
pub fn reverse_and_reapply(conn: &Connection, old: Chain, new: Chain, delta: Delta) -> Result<()> {
    apply_chain(conn, old, -delta)?;
    apply_chain(conn, new, delta)
}

/// Per-session histogram tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Histogram {
    Rating,
    Hour,
}

impl Histogram {
    fn table(&self) -> (&'static str, &'static str) {
        match self {
            Self::Rating => ("session_ratings", "rating"),
            Self::Hour => ("session_hours", "hour"),
        }
    }
}

/// Add `delta` to one histogram bucket. Buckets that reach zero are removed.
pub fn bump_bucket(
    conn: &Connection,
    histogram: Histogram,
    session: SessionId,
    bucket: u8,
    delta: i64,
) -> Result<()> {
    let (table, column) = histogram.table();
    if delta > 0 {
        conn.execute(
            &format!(
                "INSERT INTO {table} (session_id, {column}, count) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id, {column}) DO UPDATE SET count = count + excluded.count"
            ),
            params![session.0, bucket, delta],
        )?;
        return Ok(());
    }
    if delta == 0 {
        return Ok(());
    }

    let changed = conn.execute(
        &format!(
            "UPDATE {table} SET count = count + ?3
             WHERE session_id = ?1 AND {column} = ?2 AND count + ?3 >= 0"
        ),
        params![session.0, bucket, delta],
    )?;
    if changed == 0 {
        let msg = format!("{column} bucket {bucket} of {session} would go below zero");
        log::error!("{msg}");
        return Err(StoreError::Invariant(msg));
    }
    conn.execute(
        &format!("DELETE FROM {table} WHERE session_id = ?1 AND {column} = ?2 AND count = 0"),
        params![session.0, bucket],
    )?;
    Ok(())
}
