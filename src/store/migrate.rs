use super::{CURRENT_VERSION, Result, Store, StoreError, read_version, write_version};
use crate::names::name_key;
use rusqlite::{Connection, params};

/// Where a store is in its open/migrate lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationState {
    Unopened,
    VersionDetected(u32),
    /// Running the step that produces version `step`.
    Migrating { from: u32, step: u32 },
    Migrated { from: u32, to: u32 },
    /// No migration was needed.
    Current(u32),
    /// `version` is the last fully committed version.
    Failed { version: u32, message: String },
}

/// One schema step, K -> K+1. The step body and the marker update commit in
/// the same transaction, so an interrupted step leaves the marker at K.
pub struct MigrationStep {
    pub to: u32,
    pub name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

impl MigrationStep {
    pub fn from(&self) -> u32 {
        self.to - 1
    }
}

pub const STEPS: &[MigrationStep] = &[
    MigrationStep { to: 1, name: "base schema", apply: migrate_v1 },
    MigrationStep { to: 2, name: "per-session rating and hour caches", apply: migrate_v2 },
    MigrationStep { to: 3, name: "matching keys and manual overrides", apply: migrate_v3 },
];

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub steps_run: Vec<u32>,
}

impl MigrationReport {
    pub fn was_needed(&self) -> bool {
        !self.steps_run.is_empty()
    }
}

impl Store {
    /// Bring the store to the current version.
    pub fn migrate(&self) -> Result<MigrationReport> {
        self.migrate_to(CURRENT_VERSION, |_| {})
    }

    /// Run every step between the detected version and `target`, reporting
    /// each state transition to `on_state`.
    ///
    /// Steps already reflected in the marker are skipped, so running this on a
    /// store that is already at `target` does nothing.
    pub fn migrate_to(
        &self,
        target: u32,
        mut on_state: impl FnMut(&MigrationState),
    ) -> Result<MigrationReport> {
        let from = read_version(&self.conn)?;
        on_state(&MigrationState::VersionDetected(from));

        let mut report = MigrationReport {
            from,
            to: from,
            steps_run: Vec::new(),
        };

        if from >= target {
            on_state(&MigrationState::Current(from));
            return Ok(report);
        }

        for step in STEPS.iter().filter(|s| s.from() >= from && s.to <= target) {
            on_state(&MigrationState::Migrating { from, step: step.to });
            log::info!("Migrating store v{} -> v{}: {}", step.from(), step.to, step.name);

            if let Err(e) = self.run_step(step) {
                let message = e.to_string();
                log::error!("Migration step v{} failed: {}", step.to, message);
                on_state(&MigrationState::Failed {
                    version: report.to,
                    message: message.clone(),
                });
                return Err(StoreError::Migration {
                    version: step.to,
                    message,
                });
            }

            report.to = step.to;
            report.steps_run.push(step.to);
        }

        on_state(&MigrationState::Migrated { from, to: report.to });
        Ok(report)
    }

    fn run_step(&self, step: &MigrationStep) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        (step.apply)(&tx)?;
        write_version(&tx, step.to)?;
        tx.commit()?;
        Ok(())
    }
}

/// V1: entities, sessions and play history with denormalized counters
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS artists (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            play_count  INTEGER NOT NULL DEFAULT 0 CHECK (play_count >= 0),
            play_time   INTEGER NOT NULL DEFAULT 0 CHECK (play_time >= 0)
        );

        CREATE TABLE IF NOT EXISTS albums (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            -- NULL = various artists
            artist_id   INTEGER REFERENCES artists(id) ON DELETE SET NULL,
            play_count  INTEGER NOT NULL DEFAULT 0 CHECK (play_count >= 0),
            play_time   INTEGER NOT NULL DEFAULT 0 CHECK (play_time >= 0)
        );

        CREATE TABLE IF NOT EXISTS songs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            title       TEXT NOT NULL,
            artist_id   INTEGER NOT NULL REFERENCES artists(id),
            album_id    INTEGER REFERENCES albums(id),
            play_count  INTEGER NOT NULL DEFAULT 0 CHECK (play_count >= 0),
            play_time   INTEGER NOT NULL DEFAULT 0 CHECK (play_time >= 0),
            rating      INTEGER CHECK (rating BETWEEN 0 AND 5),
            duration    INTEGER NOT NULL DEFAULT 0,
            last_played INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_songs_artist ON songs(artist_id);
        CREATE INDEX IF NOT EXISTS idx_songs_album ON songs(album_id);
        CREATE INDEX IF NOT EXISTS idx_albums_artist ON albums(artist_id);

        CREATE TABLE IF NOT EXISTS sessions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at  INTEGER NOT NULL,
            ended_at    INTEGER NOT NULL,
            play_count  INTEGER NOT NULL DEFAULT 0 CHECK (play_count >= 0),
            play_time   INTEGER NOT NULL DEFAULT 0 CHECK (play_time >= 0)
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_ended ON sessions(ended_at);

        CREATE TABLE IF NOT EXISTS history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            song_id     INTEGER NOT NULL REFERENCES songs(id),
            session_id  INTEGER NOT NULL REFERENCES sessions(id),
            played_at   INTEGER NOT NULL,
            utc_offset  INTEGER NOT NULL DEFAULT 0,
            duration    INTEGER NOT NULL CHECK (duration >= 0)
        );

        CREATE INDEX IF NOT EXISTS idx_history_song ON history(song_id);
        CREATE INDEX IF NOT EXISTS idx_history_session ON history(session_id, played_at);
        ",
    )?;
    Ok(())
}

/// V2: rating-at-play and hour-of-day on history, plus the per-session
/// histograms derived from them
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        ALTER TABLE history ADD COLUMN rating INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE history ADD COLUMN hour INTEGER NOT NULL DEFAULT 0;

        UPDATE history SET
            rating = COALESCE((SELECT s.rating FROM songs s WHERE s.id = history.song_id), 0),
            hour = (((played_at + utc_offset) % 86400 + 86400) % 86400) / 3600;

        CREATE TABLE session_ratings (
            session_id  INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            rating      INTEGER NOT NULL,
            count       INTEGER NOT NULL CHECK (count >= 0),
            PRIMARY KEY (session_id, rating)
        );

        CREATE TABLE session_hours (
            session_id  INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            hour        INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
            count       INTEGER NOT NULL CHECK (count >= 0),
            PRIMARY KEY (session_id, hour)
        );

        INSERT INTO session_ratings (session_id, rating, count)
            SELECT session_id, rating, COUNT(*) FROM history GROUP BY session_id, rating;

        INSERT INTO session_hours (session_id, hour, count)
            SELECT session_id, hour, COUNT(*) FROM history GROUP BY session_id, hour;
        ",
    )?;
    Ok(())
}

/// V3: normalized matching keys (computed here, not in SQL) and the manual
/// override flag on songs
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        ALTER TABLE artists ADD COLUMN name_key TEXT NOT NULL DEFAULT '';
        ALTER TABLE albums ADD COLUMN name_key TEXT NOT NULL DEFAULT '';
        ALTER TABLE songs ADD COLUMN name_key TEXT NOT NULL DEFAULT '';
        ALTER TABLE songs ADD COLUMN user_override INTEGER NOT NULL DEFAULT 0;
        ",
    )?;

    backfill_keys(conn, "artists", "name")?;
    backfill_keys(conn, "albums", "name")?;
    backfill_keys(conn, "songs", "title")?;

    conn.execute_batch(
        "
        CREATE INDEX idx_artists_key ON artists(name_key);
        CREATE INDEX idx_albums_key ON albums(name_key, artist_id);
        CREATE INDEX idx_songs_key ON songs(name_key, artist_id, album_id);
        ",
    )?;
    Ok(())
}

fn backfill_keys(conn: &Connection, table: &str, column: &str) -> Result<()> {
    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(&format!("SELECT id, {column} FROM {table}"))?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut update = conn.prepare(&format!("UPDATE {table} SET name_key = ?1 WHERE id = ?2"))?;
    for (id, name) in &rows {
        update.execute(params![name_key(name), id])?;
    }
    log::debug!("Backfilled {} matching keys in {}", rows.len(), table);
    Ok(())
}
