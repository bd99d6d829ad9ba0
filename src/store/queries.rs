use super::models::{
    Album, AlbumId, Artist, ArtistId, Counters, HistoryEvent, HistoryId, PlayTime, Session,
    SessionId, Song, SongId,
};
use super::{Result, Store, StoreError};
use crate::names::{clean_name, name_key};
use rusqlite::{Connection, OptionalExtension, Row, params};

// Every function here takes a plain `&Connection` so it can run either on the
// store connection or inside a transaction (which derefs to one).

fn counters(row: &Row, count_idx: usize) -> rusqlite::Result<Counters> {
    Ok(Counters {
        play_count: row.get::<_, i64>(count_idx)? as u64,
        play_time: row.get::<_, i64>(count_idx + 1)? as u64,
    })
}

const ARTIST_COLUMNS: &str = "id, name, play_count, play_time";

fn artist_from_row(row: &Row) -> rusqlite::Result<Artist> {
    Ok(Artist {
        id: ArtistId(row.get(0)?),
        name: row.get(1)?,
        counters: counters(row, 2)?,
    })
}

const ALBUM_COLUMNS: &str = "id, name, artist_id, play_count, play_time";

fn album_from_row(row: &Row) -> rusqlite::Result<Album> {
    Ok(Album {
        id: AlbumId(row.get(0)?),
        name: row.get(1)?,
        artist_id: row.get::<_, Option<i64>>(2)?.map(ArtistId),
        counters: counters(row, 3)?,
    })
}

const SONG_COLUMNS: &str =
    "id, title, artist_id, album_id, play_count, play_time, rating, duration, last_played, user_override";

fn song_from_row(row: &Row) -> rusqlite::Result<Song> {
    Ok(Song {
        id: SongId(row.get(0)?),
        title: row.get(1)?,
        artist_id: ArtistId(row.get(2)?),
        album_id: row.get::<_, Option<i64>>(3)?.map(AlbumId),
        counters: counters(row, 4)?,
        rating: row.get::<_, Option<i64>>(6)?.map(|r| r as u8),
        duration: row.get::<_, i64>(7)? as u64,
        last_played: row.get(8)?,
        user_override: row.get(9)?,
    })
}

const SESSION_COLUMNS: &str = "id, started_at, ended_at, play_count, play_time";

pub(crate) fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: SessionId(row.get(0)?),
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        counters: counters(row, 3)?,
    })
}

const HISTORY_COLUMNS: &str = "id, song_id, session_id, played_at, utc_offset, duration, rating, hour";

fn history_from_row(row: &Row) -> rusqlite::Result<HistoryEvent> {
    Ok(HistoryEvent {
        id: HistoryId(row.get(0)?),
        song_id: SongId(row.get(1)?),
        session_id: SessionId(row.get(2)?),
        played_at: PlayTime {
            unix: row.get(3)?,
            utc_offset: row.get(4)?,
        },
        duration: row.get::<_, i64>(5)? as u64,
        rating: row.get::<_, i64>(6)? as u8,
        hour: row.get::<_, i64>(7)? as u8,
    })
}

// ---- artists ----

pub fn get_artist(conn: &Connection, id: ArtistId) -> Result<Artist> {
    conn.query_row(
        &format!("SELECT {ARTIST_COLUMNS} FROM artists WHERE id = ?1"),
        params![id.0],
        artist_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

pub fn find_artist(conn: &Connection, name: &str) -> Result<Option<Artist>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ARTIST_COLUMNS} FROM artists WHERE name_key = ?1 ORDER BY id LIMIT 1"),
            params![name_key(name)],
            artist_from_row,
        )
        .optional()?)
}

pub fn find_or_create_artist(conn: &Connection, name: &str) -> Result<ArtistId> {
    if let Some(artist) = find_artist(conn, name)? {
        return Ok(artist.id);
    }
    conn.execute(
        "INSERT INTO artists (name, name_key) VALUES (?1, ?2)",
        params![clean_name(name), name_key(name)],
    )?;
    let id = ArtistId(conn.last_insert_rowid());
    log::debug!("Created {id} ({name})");
    Ok(id)
}

pub fn set_artist_name(conn: &Connection, id: ArtistId, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE artists SET name = ?1, name_key = ?2 WHERE id = ?3",
        params![clean_name(name), name_key(name), id.0],
    )?;
    Ok(())
}

pub fn delete_artist(conn: &Connection, id: ArtistId) -> Result<()> {
    conn.execute("DELETE FROM artists WHERE id = ?1", params![id.0])?;
    Ok(())
}

pub fn songs_of_artist(conn: &Connection, id: ArtistId) -> Result<Vec<Song>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SONG_COLUMNS} FROM songs WHERE artist_id = ?1 ORDER BY id"
    ))?;
    let songs = stmt
        .query_map(params![id.0], song_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(songs)
}

pub fn albums_of_artist(conn: &Connection, id: ArtistId) -> Result<Vec<Album>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALBUM_COLUMNS} FROM albums WHERE artist_id = ?1 ORDER BY id"
    ))?;
    let albums = stmt
        .query_map(params![id.0], album_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(albums)
}

// ---- albums ----

pub fn get_album(conn: &Connection, id: AlbumId) -> Result<Album> {
    conn.query_row(
        &format!("SELECT {ALBUM_COLUMNS} FROM albums WHERE id = ?1"),
        params![id.0],
        album_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

pub fn find_album(conn: &Connection, name: &str, artist: Option<ArtistId>) -> Result<Option<Album>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ALBUM_COLUMNS} FROM albums
                 WHERE name_key = ?1 AND artist_id IS ?2 ORDER BY id LIMIT 1"
            ),
            params![name_key(name), artist.map(|a| a.0)],
            album_from_row,
        )
        .optional()?)
}

pub fn find_or_create_album(conn: &Connection, name: &str, artist: Option<ArtistId>) -> Result<AlbumId> {
    if let Some(album) = find_album(conn, name, artist)? {
        return Ok(album.id);
    }
    conn.execute(
        "INSERT INTO albums (name, name_key, artist_id) VALUES (?1, ?2, ?3)",
        params![clean_name(name), name_key(name), artist.map(|a| a.0)],
    )?;
    let id = AlbumId(conn.last_insert_rowid());
    log::debug!("Created {id} ({name})");
    Ok(id)
}

pub fn set_album_name(conn: &Connection, id: AlbumId, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE albums SET name = ?1, name_key = ?2 WHERE id = ?3",
        params![clean_name(name), name_key(name), id.0],
    )?;
    Ok(())
}

pub fn set_album_artist(conn: &Connection, id: AlbumId, artist: Option<ArtistId>) -> Result<()> {
    conn.execute(
        "UPDATE albums SET artist_id = ?1 WHERE id = ?2",
        params![artist.map(|a| a.0), id.0],
    )?;
    Ok(())
}

pub fn delete_album(conn: &Connection, id: AlbumId) -> Result<()> {
    conn.execute("DELETE FROM albums WHERE id = ?1", params![id.0])?;
    Ok(())
}

pub fn songs_of_album(conn: &Connection, id: AlbumId) -> Result<Vec<Song>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SONG_COLUMNS} FROM songs WHERE album_id = ?1 ORDER BY id"
    ))?;
    let songs = stmt
        .query_map(params![id.0], song_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(songs)
}

// ---- songs ----

pub fn get_song(conn: &Connection, id: SongId) -> Result<Song> {
    conn.query_row(
        &format!("SELECT {SONG_COLUMNS} FROM songs WHERE id = ?1"),
        params![id.0],
        song_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

pub fn find_song(
    conn: &Connection,
    title: &str,
    artist: ArtistId,
    album: Option<AlbumId>,
) -> Result<Option<Song>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SONG_COLUMNS} FROM songs
                 WHERE name_key = ?1 AND artist_id = ?2 AND album_id IS ?3
                 ORDER BY id LIMIT 1"
            ),
            params![name_key(title), artist.0, album.map(|a| a.0)],
            song_from_row,
        )
        .optional()?)
}

pub fn find_or_create_song(
    conn: &Connection,
    title: &str,
    artist: ArtistId,
    album: Option<AlbumId>,
) -> Result<SongId> {
    if let Some(song) = find_song(conn, title, artist, album)? {
        return Ok(song.id);
    }
    conn.execute(
        "INSERT INTO songs (title, name_key, artist_id, album_id) VALUES (?1, ?2, ?3, ?4)",
        params![clean_name(title), name_key(title), artist.0, album.map(|a| a.0)],
    )?;
    let id = SongId(conn.last_insert_rowid());
    log::debug!("Created {id} ({title})");
    Ok(id)
}

/// Record the per-play attributes that are not counters.
pub fn note_song_played(
    conn: &Connection,
    id: SongId,
    rating: Option<u8>,
    duration: u64,
    played_at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE songs SET
            rating = COALESCE(?1, rating),
            duration = ?2,
            last_played = MAX(COALESCE(last_played, ?3), ?3)
         WHERE id = ?4",
        params![rating.map(i64::from), duration as i64, played_at, id.0],
    )?;
    Ok(())
}

/// Recompute `last_played` from the remaining history of a song.
pub fn refresh_last_played(conn: &Connection, id: SongId) -> Result<()> {
    conn.execute(
        "UPDATE songs SET last_played = (SELECT MAX(played_at) FROM history WHERE song_id = ?1)
         WHERE id = ?1",
        params![id.0],
    )?;
    Ok(())
}

pub fn set_song_title(conn: &Connection, id: SongId, title: &str) -> Result<()> {
    conn.execute(
        "UPDATE songs SET title = ?1, name_key = ?2, user_override = 1 WHERE id = ?3",
        params![clean_name(title), name_key(title), id.0],
    )?;
    Ok(())
}

pub fn set_song_rating(conn: &Connection, id: SongId, rating: Option<u8>) -> Result<()> {
    conn.execute(
        "UPDATE songs SET rating = ?1, user_override = 1 WHERE id = ?2",
        params![rating.map(i64::from), id.0],
    )?;
    Ok(())
}

pub fn set_song_parents(
    conn: &Connection,
    id: SongId,
    artist: ArtistId,
    album: Option<AlbumId>,
) -> Result<()> {
    conn.execute(
        "UPDATE songs SET artist_id = ?1, album_id = ?2 WHERE id = ?3",
        params![artist.0, album.map(|a| a.0), id.0],
    )?;
    Ok(())
}

/// Carry the non-counter attributes of `from` over to `into` before `from`
/// is folded into it.
pub fn absorb_song_attributes(conn: &Connection, from: &Song, into: SongId) -> Result<()> {
    conn.execute(
        "UPDATE songs SET
            rating = COALESCE(rating, ?1),
            last_played = NULLIF(MAX(COALESCE(last_played, 0), COALESCE(?2, 0)), 0),
            user_override = MAX(user_override, ?3)
         WHERE id = ?4",
        params![
            from.rating.map(i64::from),
            from.last_played,
            from.user_override,
            into.0
        ],
    )?;
    Ok(())
}

pub fn delete_song(conn: &Connection, id: SongId) -> Result<()> {
    conn.execute("DELETE FROM songs WHERE id = ?1", params![id.0])?;
    Ok(())
}

pub fn count_songs_of_artist(conn: &Connection, id: ArtistId) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM songs WHERE artist_id = ?1",
        params![id.0],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub fn count_songs_of_album(conn: &Connection, id: AlbumId) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM songs WHERE album_id = ?1",
        params![id.0],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

// ---- merge targets ----

/// Another artist sharing `name`'s matching key, if any.
pub fn find_other_artist(conn: &Connection, name: &str, except: ArtistId) -> Result<Option<Artist>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ARTIST_COLUMNS} FROM artists WHERE name_key = ?1 AND id != ?2
                 ORDER BY id LIMIT 1"
            ),
            params![name_key(name), except.0],
            artist_from_row,
        )
        .optional()?)
}

/// Another album of `artist` sharing `name`'s matching key, if any.
pub fn find_other_album(
    conn: &Connection,
    name: &str,
    artist: Option<ArtistId>,
    except: AlbumId,
) -> Result<Option<Album>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ALBUM_COLUMNS} FROM albums
                 WHERE name_key = ?1 AND artist_id IS ?2 AND id != ?3 ORDER BY id LIMIT 1"
            ),
            params![name_key(name), artist.map(|a| a.0), except.0],
            album_from_row,
        )
        .optional()?)
}

/// Another song with the same key, artist and album, if any.
pub fn find_other_song(
    conn: &Connection,
    title: &str,
    artist: ArtistId,
    album: Option<AlbumId>,
    except: SongId,
) -> Result<Option<Song>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SONG_COLUMNS} FROM songs
                 WHERE name_key = ?1 AND artist_id = ?2 AND album_id IS ?3 AND id != ?4
                 ORDER BY id LIMIT 1"
            ),
            params![name_key(title), artist.0, album.map(|a| a.0), except.0],
            song_from_row,
        )
        .optional()?)
}

// ---- sessions ----

pub fn get_session(conn: &Connection, id: SessionId) -> Result<Session> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
        params![id.0],
        session_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

/// The session with the latest end time (ties go to the newest session).
pub fn latest_session(conn: &Connection) -> Result<Option<Session>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY ended_at DESC, id DESC LIMIT 1"),
            [],
            session_from_row,
        )
        .optional()?)
}

/// The latest session whose bounds, widened by `gap` on both sides, contain `at`.
pub fn session_around(conn: &Connection, at: i64, gap: i64) -> Result<Option<Session>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE started_at - ?2 <= ?1 AND ended_at + ?2 >= ?1
                 ORDER BY ended_at DESC, id DESC LIMIT 1"
            ),
            params![at, gap],
            session_from_row,
        )
        .optional()?)
}

pub fn insert_session(conn: &Connection, started_at: i64, ended_at: i64) -> Result<SessionId> {
    conn.execute(
        "INSERT INTO sessions (started_at, ended_at) VALUES (?1, ?2)",
        params![started_at, ended_at],
    )?;
    Ok(SessionId(conn.last_insert_rowid()))
}

/// Grow a session's bounds to cover `[start, end]`. Bounds never shrink.
pub fn widen_session(conn: &Connection, id: SessionId, start: i64, end: i64) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET started_at = MIN(started_at, ?1), ended_at = MAX(ended_at, ?2)
         WHERE id = ?3",
        params![start, end, id.0],
    )?;
    Ok(())
}

pub fn delete_session(conn: &Connection, id: SessionId) -> Result<()> {
    conn.execute("DELETE FROM session_ratings WHERE session_id = ?1", params![id.0])?;
    conn.execute("DELETE FROM session_hours WHERE session_id = ?1", params![id.0])?;
    conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.0])?;
    Ok(())
}

// ---- history ----

pub fn get_history(conn: &Connection, id: HistoryId) -> Result<HistoryEvent> {
    conn.query_row(
        &format!("SELECT {HISTORY_COLUMNS} FROM history WHERE id = ?1"),
        params![id.0],
        history_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

pub fn insert_history(
    conn: &Connection,
    song: SongId,
    session: SessionId,
    played_at: PlayTime,
    duration: u64,
    rating: u8,
) -> Result<HistoryId> {
    conn.execute(
        "INSERT INTO history (song_id, session_id, played_at, utc_offset, duration, rating, hour)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            song.0,
            session.0,
            played_at.unix,
            played_at.utc_offset,
            duration as i64,
            rating,
            played_at.hour()
        ],
    )?;
    Ok(HistoryId(conn.last_insert_rowid()))
}

pub fn delete_history(conn: &Connection, id: HistoryId) -> Result<()> {
    conn.execute("DELETE FROM history WHERE id = ?1", params![id.0])?;
    Ok(())
}

/// Live history of one song, oldest first.
pub fn history_for_song(conn: &Connection, id: SongId) -> Result<Vec<HistoryEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {HISTORY_COLUMNS} FROM history WHERE song_id = ?1 ORDER BY played_at, id"
    ))?;
    let events = stmt
        .query_map(params![id.0], history_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Point every play of `from` at `into`. Session membership is unchanged.
pub fn move_history(conn: &Connection, from: SongId, into: SongId) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE history SET song_id = ?1 WHERE song_id = ?2",
        params![into.0, from.0],
    )?)
}

/// Every live play, for the consistency check.
pub fn all_history(conn: &Connection) -> Result<Vec<HistoryEvent>> {
    let mut stmt = conn.prepare(&format!("SELECT {HISTORY_COLUMNS} FROM history ORDER BY id"))?;
    let events = stmt
        .query_map([], history_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

pub fn all_songs(conn: &Connection) -> Result<Vec<Song>> {
    let mut stmt = conn.prepare(&format!("SELECT {SONG_COLUMNS} FROM songs ORDER BY id"))?;
    let songs = stmt
        .query_map([], song_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(songs)
}

pub fn all_artists(conn: &Connection) -> Result<Vec<Artist>> {
    let mut stmt = conn.prepare(&format!("SELECT {ARTIST_COLUMNS} FROM artists ORDER BY id"))?;
    let artists = stmt
        .query_map([], artist_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(artists)
}

pub fn all_albums(conn: &Connection) -> Result<Vec<Album>> {
    let mut stmt = conn.prepare(&format!("SELECT {ALBUM_COLUMNS} FROM albums ORDER BY id"))?;
    let albums = stmt
        .query_map([], album_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(albums)
}

/// Read-only entity lookups on the store connection.
impl Store {
    pub fn song(&self, id: SongId) -> Result<Song> {
        get_song(&self.conn, id)
    }

    pub fn artist(&self, id: ArtistId) -> Result<Artist> {
        get_artist(&self.conn, id)
    }

    pub fn album(&self, id: AlbumId) -> Result<Album> {
        get_album(&self.conn, id)
    }

    pub fn find_artist(&self, name: &str) -> Result<Option<Artist>> {
        find_artist(&self.conn, name)
    }

    pub fn history_for_song(&self, id: SongId) -> Result<Vec<HistoryEvent>> {
        history_for_song(&self.conn, id)
    }
}
