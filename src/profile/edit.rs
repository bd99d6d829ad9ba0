//! Transactional edit operations.
//!
//! An [`Editor`] borrows the connection of one open transaction. Every method
//! leaves the counters consistent with the live history on success; on error
//! the caller drops the transaction and nothing is visible.

use chrono::{DateTime, FixedOffset};
use rusqlite::Connection;

use crate::config::EmptyParentPolicy;
use crate::counters::{Chain, Delta, apply_chain, reverse_and_reapply};
use crate::sessions::SessionManager;
use crate::store::models::{
    Album, AlbumId, Artist, ArtistId, EntityId, HistoryId, PlayEvent, PlayTime, Song, SongId,
};
use crate::store::queries::{
    absorb_song_attributes, albums_of_artist, count_songs_of_album, count_songs_of_artist,
    delete_album, delete_artist, delete_song, find_album, find_or_create_album,
    find_or_create_artist, find_or_create_song, find_other_album, find_other_artist,
    find_other_song, find_song, get_album, get_artist, get_history, get_song, history_for_song,
    move_history, note_song_played, refresh_last_played, set_album_artist, set_album_name,
    set_artist_name, set_song_parents, set_song_rating, set_song_title, songs_of_album,
    songs_of_artist,
};
use crate::store::{Result, StoreError};

/// Deletion policy for entities left without plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditPolicy {
    pub empty_parents: EmptyParentPolicy,
    /// Keep a song with zero plays when it was renamed or rated by hand.
    pub retain_overridden_songs: bool,
}

impl Default for EditPolicy {
    fn default() -> Self {
        Self {
            empty_parents: EmptyParentPolicy::Delete,
            retain_overridden_songs: true,
        }
    }
}

pub struct Editor<'a> {
    conn: &'a Connection,
    sessions: SessionManager,
    policy: EditPolicy,
}

impl<'a> Editor<'a> {
    pub fn new(conn: &'a Connection, sessions: SessionManager, policy: EditPolicy) -> Self {
        Self {
            conn,
            sessions,
            policy,
        }
    }

    /// Record a live play, creating the song, artist and album on first sight.
    pub fn add_play(&self, event: &PlayEvent) -> Result<HistoryId> {
        let conn = self.conn;
        let artist = find_or_create_artist(conn, &event.artist)?;
        let album = match event.album.as_deref().filter(|name| !name.trim().is_empty()) {
            Some(name) => Some(find_or_create_album(conn, name, Some(artist))?),
            None => None,
        };
        let song_id = find_or_create_song(conn, &event.title, artist, album)?;

        let at = PlayTime::from_datetime(&event.played_at);
        note_song_played(conn, song_id, event.rating, event.duration, at.unix)?;
        let song = get_song(conn, song_id)?;

        let session = self.sessions.resolve_session(conn, at.unix)?;
        let history = self
            .sessions
            .attach_history_event(conn, session, &song, at, event.duration)?;
        apply_chain(conn, Chain::of(&song), Delta::play(event.duration))?;

        log::debug!("Recorded {} of {} in {}", history.id, song.id, session);
        Ok(history.id)
    }

    /// Add manual plays of an existing song, one per timestamp. Each play
    /// lasts the song's remembered duration.
    pub fn add_history_events(
        &self,
        dates: &[DateTime<FixedOffset>],
        song_id: SongId,
    ) -> Result<Vec<HistoryId>> {
        let conn = self.conn;
        let song = get_song(conn, song_id)?;
        let chain = Chain::of(&song);

        let mut added = Vec::with_capacity(dates.len());
        for date in dates {
            let at = PlayTime::from_datetime(date);
            let session = self.sessions.resolve_historical_session(conn, at.unix)?;
            let history = self
                .sessions
                .attach_history_event(conn, session, &song, at, song.duration)?;
            apply_chain(conn, chain, Delta::play(song.duration))?;
            added.push(history.id);
        }
        refresh_last_played(conn, song_id)?;
        log::info!("Added {} historical plays of {}", added.len(), song_id);
        Ok(added)
    }

    /// Remove one play of `song_id`. The song goes with its last play unless
    /// the override policy keeps it.
    pub fn remove_history_event(&self, id: HistoryId, song_id: SongId) -> Result<()> {
        let conn = self.conn;
        let event = get_history(conn, id)?;
        if event.song_id != song_id {
            return Err(StoreError::NotFound(format!("{id} of {song_id}")));
        }
        let song = get_song(conn, song_id)?;

        self.sessions.detach_history_event(conn, &event)?;
        apply_chain(conn, Chain::of(&song), -Delta::of_event(&event))?;
        refresh_last_played(conn, song_id)?;

        let song = get_song(conn, song_id)?;
        if song.counters.play_count == 0 {
            if song.user_override && self.policy.retain_overridden_songs {
                log::debug!("Keeping overridden {} with no plays", song.id);
            } else {
                delete_song(conn, song.id)?;
                log::info!("Deleted {} with its last play", song.id);
                self.prune_parents(song.artist_id, song.album_id)?;
            }
        }
        Ok(())
    }

    /// Cascading removal of a song, album or artist and all their plays.
    pub fn remove_object(&self, entity: EntityId) -> Result<()> {
        match entity {
            EntityId::Song(id) => {
                let song = get_song(self.conn, id)?;
                self.remove_song(&song)?;
                self.prune_parents(song.artist_id, song.album_id)
            }
            EntityId::Album(id) => self.remove_album(id),
            EntityId::Artist(id) => self.remove_artist(id),
        }
    }

    fn remove_song(&self, song: &Song) -> Result<()> {
        let chain = Chain::of(song);
        for event in history_for_song(self.conn, song.id)? {
            self.sessions.detach_history_event(self.conn, &event)?;
            apply_chain(self.conn, chain, -Delta::of_event(&event))?;
        }
        delete_song(self.conn, song.id)?;
        log::info!("Removed {} ({})", song.id, song.title);
        Ok(())
    }

    fn remove_album(&self, id: AlbumId) -> Result<()> {
        let album = get_album(self.conn, id)?;
        let mut artists = Vec::new();
        for song in songs_of_album(self.conn, id)? {
            self.remove_song(&song)?;
            if !artists.contains(&song.artist_id) {
                artists.push(song.artist_id);
            }
        }
        delete_album(self.conn, id)?;
        log::info!("Removed {} ({})", id, album.name);

        if let Some(credited) = album.artist_id {
            if !artists.contains(&credited) {
                artists.push(credited);
            }
        }
        for artist in artists {
            self.prune_artist(artist)?;
        }
        Ok(())
    }

    fn remove_artist(&self, id: ArtistId) -> Result<()> {
        let artist = get_artist(self.conn, id)?;
        let mut albums = Vec::new();
        for song in songs_of_artist(self.conn, id)? {
            self.remove_song(&song)?;
            if let Some(album) = song.album_id {
                if !albums.contains(&album) {
                    albums.push(album);
                }
            }
        }
        // The artist's own albums go when empty; compilations it was credited
        // on lose the credit
        for album in albums_of_artist(self.conn, id)? {
            if count_songs_of_album(self.conn, album.id)? == 0 {
                delete_album(self.conn, album.id)?;
                albums.retain(|a| *a != album.id);
            }
        }
        delete_artist(self.conn, id)?;
        log::info!("Removed {} ({})", id, artist.name);

        for album in albums {
            self.prune_album(album)?;
        }
        Ok(())
    }

    fn prune_parents(&self, artist: ArtistId, album: Option<AlbumId>) -> Result<()> {
        if let Some(album) = album {
            self.prune_album(album)?;
        }
        self.prune_artist(artist)
    }

    fn prune_album(&self, id: AlbumId) -> Result<()> {
        if self.policy.empty_parents == EmptyParentPolicy::Retain {
            return Ok(());
        }
        if count_songs_of_album(self.conn, id)? == 0 {
            delete_album(self.conn, id)?;
            log::debug!("Deleted empty {id}");
        }
        Ok(())
    }

    fn prune_artist(&self, id: ArtistId) -> Result<()> {
        if self.policy.empty_parents == EmptyParentPolicy::Retain {
            return Ok(());
        }
        if count_songs_of_artist(self.conn, id)? == 0 && albums_of_artist(self.conn, id)?.is_empty() {
            delete_artist(self.conn, id)?;
            log::debug!("Deleted empty {id}");
        }
        Ok(())
    }

    /// Rename an entity. When the new name matches another entity of the same
    /// kind, the renamed one is folded into it and the survivor is returned.
    pub fn rename(&self, entity: EntityId, name: &str) -> Result<EntityId> {
        match entity {
            EntityId::Song(id) => self.rename_song(id, name).map(EntityId::Song),
            EntityId::Album(id) => self.rename_album(id, name).map(EntityId::Album),
            EntityId::Artist(id) => self.rename_artist(id, name).map(EntityId::Artist),
        }
    }

    fn rename_song(&self, id: SongId, title: &str) -> Result<SongId> {
        let song = get_song(self.conn, id)?;
        set_song_title(self.conn, id, title)?;
        match find_other_song(self.conn, title, song.artist_id, song.album_id, id)? {
            Some(twin) => {
                let renamed = get_song(self.conn, id)?;
                self.merge_song(&renamed, &twin)?;
                set_song_title(self.conn, twin.id, title)?;
                Ok(twin.id)
            }
            None => Ok(id),
        }
    }

    fn rename_album(&self, id: AlbumId, name: &str) -> Result<AlbumId> {
        let album = get_album(self.conn, id)?;
        match find_other_album(self.conn, name, album.artist_id, id)? {
            Some(twin) => {
                self.merge_album(&album, &twin)?;
                set_album_name(self.conn, twin.id, name)?;
                Ok(twin.id)
            }
            None => {
                set_album_name(self.conn, id, name)?;
                Ok(id)
            }
        }
    }

    fn rename_artist(&self, id: ArtistId, name: &str) -> Result<ArtistId> {
        let artist = get_artist(self.conn, id)?;
        match find_other_artist(self.conn, name, id)? {
            Some(twin) => {
                self.merge_artist(&artist, &twin)?;
                // Source row is gone, so the exact name is free
                set_artist_name(self.conn, twin.id, name)?;
                Ok(twin.id)
            }
            None => {
                set_artist_name(self.conn, id, name)?;
                Ok(id)
            }
        }
    }

    /// Fold `src` into `dst`: counters move chain to chain, plays are
    /// repointed and `src` is deleted.
    fn merge_song(&self, src: &Song, dst: &Song) -> Result<()> {
        reverse_and_reapply(self.conn, Chain::of(src), Chain::of(dst), Delta::of_song(src))?;
        let moved = move_history(self.conn, src.id, dst.id)?;
        absorb_song_attributes(self.conn, src, dst.id)?;
        delete_song(self.conn, src.id)?;
        log::info!("Merged {} into {} ({moved} plays)", src.id, dst.id);
        Ok(())
    }

    /// Move `song` under new parents, or into the song already living there.
    fn rehome_song(&self, song: &Song, artist: ArtistId, album: Option<AlbumId>) -> Result<()> {
        match find_song(self.conn, &song.title, artist, album)? {
            Some(twin) if twin.id != song.id => self.merge_song(song, &twin),
            _ => {
                let target = Chain {
                    song: song.id,
                    artist,
                    album,
                };
                reverse_and_reapply(self.conn, Chain::of(song), target, Delta::of_song(song))?;
                set_song_parents(self.conn, song.id, artist, album)
            }
        }
    }

    fn merge_album(&self, src: &Album, dst: &Album) -> Result<()> {
        for song in songs_of_album(self.conn, src.id)? {
            self.rehome_song(&song, song.artist_id, Some(dst.id))?;
        }
        self.ensure_drained(get_album(self.conn, src.id)?.counters.play_count, &src.id)?;
        delete_album(self.conn, src.id)?;
        log::info!("Merged {} into {}", src.id, dst.id);
        Ok(())
    }

    fn merge_artist(&self, src: &Artist, dst: &Artist) -> Result<()> {
        for album in albums_of_artist(self.conn, src.id)? {
            match find_album(self.conn, &album.name, Some(dst.id))? {
                Some(twin) => self.merge_album(&album, &twin)?,
                None => set_album_artist(self.conn, album.id, Some(dst.id))?,
            }
        }
        for song in songs_of_artist(self.conn, src.id)? {
            self.rehome_song(&song, dst.id, song.album_id)?;
        }
        self.ensure_drained(get_artist(self.conn, src.id)?.counters.play_count, &src.id)?;
        delete_artist(self.conn, src.id)?;
        log::info!("Merged {} ({}) into {} ({})", src.id, src.name, dst.id, dst.name);
        Ok(())
    }

    fn ensure_drained(&self, remaining: u64, what: &dyn std::fmt::Display) -> Result<()> {
        if remaining == 0 {
            return Ok(());
        }
        let msg = format!("{what} still holds {remaining} plays after merge");
        log::error!("{msg}");
        Err(StoreError::Invariant(msg))
    }

    /// Set or clear a song's rating by hand. Plays already recorded keep the
    /// rating they were made with.
    pub fn set_rating(&self, song_id: SongId, rating: Option<u8>) -> Result<()> {
        get_song(self.conn, song_id)?;
        set_song_rating(self.conn, song_id, rating)
    }
}
