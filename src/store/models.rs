use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, " #{}"), self.0)
            }
        }
    };
}

entity_id!(SongId, "song");
entity_id!(ArtistId, "artist");
entity_id!(AlbumId, "album");
entity_id!(SessionId, "session");
entity_id!(HistoryId, "play");

/// Target of a rename or remove edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityId {
    Song(SongId),
    Artist(ArtistId),
    Album(AlbumId),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Song(id) => id.fmt(f),
            Self::Artist(id) => id.fmt(f),
            Self::Album(id) => id.fmt(f),
        }
    }
}

/// The (count, time) pair carried by songs, artists, albums and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counters {
    pub play_count: u64,
    /// Seconds.
    pub play_time: u64,
}

/// One completed play as reported by the scrobble layer or an import file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayEvent {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    /// Seconds actually played.
    pub duration: u64,
    /// Start of the play in the listener's local offset.
    pub played_at: DateTime<FixedOffset>,
    #[serde(default)]
    pub rating: Option<u8>,
}

impl PlayEvent {
    pub fn new(
        title: impl Into<String>,
        artist: impl Into<String>,
        album: Option<&str>,
        duration: u64,
        played_at: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: album.map(str::to_string),
            duration,
            played_at,
            rating: None,
        }
    }

    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }
}

/// Wall-clock position of a play: unix seconds plus the listener's UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayTime {
    pub unix: i64,
    pub utc_offset: i32,
}

impl PlayTime {
    pub fn from_datetime(dt: &DateTime<FixedOffset>) -> Self {
        Self {
            unix: dt.timestamp(),
            utc_offset: dt.offset().local_minus_utc(),
        }
    }

    /// Hour of day (0-23) in the listener's wall clock.
    pub fn hour(&self) -> u8 {
        self.to_datetime().hour() as u8
    }

    pub fn to_datetime(&self) -> DateTime<FixedOffset> {
        let utc = DateTime::from_timestamp(self.unix, 0).unwrap_or_default();
        let offset = FixedOffset::east_opt(self.utc_offset).unwrap_or(Utc.fix());
        utc.with_timezone(&offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artist {
    pub id: ArtistId,
    pub name: String,
    pub counters: Counters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Album {
    pub id: AlbumId,
    pub name: String,
    /// `None` for various-artists compilations.
    pub artist_id: Option<ArtistId>,
    pub counters: Counters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub id: SongId,
    pub title: String,
    pub artist_id: ArtistId,
    pub album_id: Option<AlbumId>,
    pub counters: Counters,
    pub rating: Option<u8>,
    /// Seconds played on the most recent play; used for manually added plays.
    pub duration: u64,
    pub last_played: Option<i64>,
    /// Set by rename and manual rating; protects the song from auto-deletion.
    pub user_override: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub id: HistoryId,
    pub song_id: SongId,
    pub session_id: SessionId,
    pub played_at: PlayTime,
    pub duration: u64,
    /// Rating bucket recorded at play time (0 = unrated).
    pub rating: u8,
    pub hour: u8,
}

impl HistoryEvent {
    pub fn ended_at(&self) -> i64 {
        self.played_at.unix.saturating_add_unsigned(self.duration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub started_at: i64,
    pub ended_at: i64,
    pub counters: Counters,
}

/// One play inside a session, in play order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSong {
    pub history_id: HistoryId,
    pub song_id: SongId,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub played_at: i64,
    pub duration: u64,
}

/// Per-session aggregate row for an artist or album.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionItem {
    pub name: String,
    pub counters: Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatingCount {
    pub rating: u8,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HourCount {
    pub hour: u8,
    pub count: u64,
}

/// Highest valid rating value.
pub const MAX_RATING: u8 = 5;

/// Longest single play accepted, in seconds.
pub const MAX_PLAY_SECONDS: u64 = 24 * 60 * 60;
