pub mod edit;
pub mod events;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::check::{Discrepancy, verify};
use crate::import::{self, ImportHandle};
use crate::sessions::{
    SessionManager, albums_for_session, all_sessions, artists_for_session, hours_for_session,
    ratings_for_session, songs_for_session,
};
use crate::store::migrate::MigrationState;
use crate::store::models::{
    Album, AlbumId, Artist, ArtistId, EntityId, HistoryEvent, HistoryId, HourCount,
    MAX_PLAY_SECONDS, MAX_RATING, PlayEvent, RatingCount, Session, SessionId, SessionItem,
    SessionSong, Song, SongId,
};
use crate::store::queries::{find_artist, get_album, get_artist, get_song, history_for_song};
use crate::store::{CURRENT_VERSION, Store, StoreError};
use edit::{EditPolicy, Editor};
pub use events::ProfileEvent;

/// How many notifications a slow subscriber may fall behind before losing the oldest.
const EVENT_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("{0} not found")]
    EntityNotFound(String),
    #[error("Store busy: {0}")]
    StoreBusy(String),
    #[error("Store left at version {version}: {message}")]
    MigrationFailed { version: u32, message: String },
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ProfileError {
    fn from(e: StoreError) -> Self {
        if e.is_store_level() {
            return Self::StoreUnavailable(e.to_string());
        }
        match e {
            StoreError::NotFound(what) => Self::EntityNotFound(what),
            StoreError::Invariant(msg) => Self::InvariantViolation(msg),
            StoreError::Migration { version, message } => Self::MigrationFailed {
                version: version.saturating_sub(1),
                message,
            },
            other => Self::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProfileError>;

#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub db_path: PathBuf,
    /// Older store files to adopt when `db_path` does not exist yet.
    pub legacy_db_paths: Vec<PathBuf>,
    pub session_gap: Duration,
    pub policy: EditPolicy,
}

impl ProfileConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            legacy_db_paths: Vec::new(),
            session_gap: Duration::from_secs(30 * 60),
            policy: EditPolicy::default(),
        }
    }
}

/// Operational state of the facade.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileState {
    Opening,
    Migrating { from: u32, step: u32 },
    Ready,
    /// A migration failed and the store sits at `version`. Until
    /// acknowledged every operation fails; afterwards reads the old schema
    /// can serve are allowed again.
    Downlevel {
        version: u32,
        message: String,
        acknowledged: bool,
    },
    /// The store could not be opened or hit a store-level failure.
    Unavailable(String),
    Resetting,
}

type Job = Box<dyn FnOnce(&Shared) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Shared {
    config: ProfileConfig,
    sessions: SessionManager,
    store: Mutex<Option<Store>>,
    state: Mutex<ProfileState>,
    migration: Mutex<MigrationState>,
    version: AtomicU32,
    pub(crate) importing: AtomicBool,
    pub(crate) cancel_import: AtomicBool,
    closing: AtomicBool,
    events: broadcast::Sender<ProfileEvent>,
}

impl Shared {
    /// Fire-and-forget: nobody listening is fine.
    pub(crate) fn emit(&self, event: ProfileEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self) -> ProfileState {
        lock(&self.state).clone()
    }

    fn set_state(&self, state: ProfileState) {
        log::debug!("Profile state -> {state:?}");
        *lock(&self.state) = state;
    }

    fn check_writable(&self) -> Result<()> {
        match &*lock(&self.state) {
            ProfileState::Ready => Ok(()),
            ProfileState::Downlevel { version, message, .. } => Err(ProfileError::MigrationFailed {
                version: *version,
                message: message.clone(),
            }),
            other => Err(not_operational(other)),
        }
    }

    fn check_readable(&self, min_version: u32) -> Result<()> {
        match &*lock(&self.state) {
            ProfileState::Ready => Ok(()),
            ProfileState::Downlevel {
                version,
                acknowledged: true,
                ..
            } if *version >= min_version => Ok(()),
            ProfileState::Downlevel { version, message, acknowledged } => {
                let message = if *acknowledged {
                    format!("needs version {min_version}; {message}")
                } else {
                    message.clone()
                };
                Err(ProfileError::MigrationFailed {
                    version: *version,
                    message,
                })
            }
            other => Err(not_operational(other)),
        }
    }

    /// Run `op` in one transaction on the writer thread.
    fn transact<T>(&self, op: impl FnOnce(&Editor) -> crate::store::Result<T>) -> Result<T> {
        self.check_writable()?;
        let guard = lock(&self.store);
        let Some(store) = guard.as_ref() else {
            return Err(ProfileError::StoreUnavailable("store is closed".into()));
        };
        let result = (|| -> crate::store::Result<T> {
            let tx = store.conn.unchecked_transaction()?;
            let value = op(&Editor::new(&tx, self.sessions, self.config.policy))?;
            tx.commit()?;
            Ok(value)
        })();
        drop(guard);
        result.map_err(|e| self.classify(e))
    }

    fn read<T>(
        &self,
        min_version: u32,
        op: impl FnOnce(&Connection) -> crate::store::Result<T>,
    ) -> Result<T> {
        // A running migration holds the store until its outcome is recorded
        let guard = lock(&self.store);
        self.check_readable(min_version)?;
        let Some(store) = guard.as_ref() else {
            return Err(ProfileError::StoreUnavailable("store is closed".into()));
        };
        let result = op(&store.conn);
        drop(guard);
        result.map_err(|e| self.classify(e))
    }

    /// Store-level failures take the store out of service.
    fn classify(&self, e: StoreError) -> ProfileError {
        if e.is_store_level() {
            log::error!("Store failure, closing store: {e}");
            lock(&self.store).take();
            self.set_state(ProfileState::Unavailable(e.to_string()));
        }
        e.into()
    }

    fn fail_open(&self, e: &StoreError) {
        log::error!("Could not open {}: {e}", self.config.db_path.display());
        lock(&self.store).take();
        self.set_state(ProfileState::Unavailable(e.to_string()));
    }

    /// Open the store file. Returns true when a migration still has to run.
    fn open_store(&self) -> bool {
        if let Err(e) = adopt_legacy(&self.config) {
            self.fail_open(&e);
            return false;
        }
        let opened = Store::open(&self.config.db_path).and_then(|store| {
            let version = store.version()?;
            Ok((store, version))
        });
        let (store, version) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.fail_open(&e);
                return false;
            }
        };
        *lock(&self.migration) = MigrationState::VersionDetected(version);

        if version == 0 {
            // Fresh file: create the schema without migration notifications
            if let Err(e) = store.migrate() {
                self.fail_open(&e);
                return false;
            }
            self.version.store(CURRENT_VERSION, Ordering::SeqCst);
            *lock(&self.migration) = MigrationState::Current(CURRENT_VERSION);
            *lock(&self.store) = Some(store);
            self.set_state(ProfileState::Ready);
            log::info!("Created store at {}", self.config.db_path.display());
            return false;
        }

        self.version.store(version, Ordering::SeqCst);
        *lock(&self.store) = Some(store);
        if version >= CURRENT_VERSION {
            *lock(&self.migration) = MigrationState::Current(version);
            self.set_state(ProfileState::Ready);
            return false;
        }
        self.set_state(ProfileState::Migrating {
            from: version,
            step: version + 1,
        });
        true
    }

    /// Migrate the open store to the current version. Runs on the writer.
    fn run_migration(&self) {
        let guard = lock(&self.store);
        let Some(store) = guard.as_ref() else {
            return;
        };
        let from = self.version.load(Ordering::SeqCst);
        self.set_state(ProfileState::Migrating {
            from,
            step: from + 1,
        });
        self.emit(ProfileEvent::WillMigrate {
            from,
            to: CURRENT_VERSION,
        });

        let result = store.migrate_to(CURRENT_VERSION, |state| {
            if let MigrationState::Migrating { from, step } = state {
                self.set_state(ProfileState::Migrating {
                    from: *from,
                    step: *step,
                });
                self.emit(ProfileEvent::MigrateStep {
                    from: *from,
                    step: *step,
                });
            }
            *lock(&self.migration) = state.clone();
        });
        let committed = store.version().unwrap_or(from);
        self.version.store(committed, Ordering::SeqCst);
        let event = match result {
            Ok(report) => {
                log::info!("Store migrated v{} -> v{}", report.from, report.to);
                self.set_state(ProfileState::Ready);
                ProfileEvent::DidMigrate {
                    from,
                    to: report.to,
                }
            }
            Err(e) => {
                let error = e.to_string();
                log::error!("Store left at v{committed}: {error}");
                self.set_state(ProfileState::Downlevel {
                    version: committed,
                    message: error.clone(),
                    acknowledged: false,
                });
                ProfileEvent::MigrateFailed {
                    from,
                    to: CURRENT_VERSION,
                    error,
                }
            }
        };
        drop(guard);
        self.emit(event);
    }

    /// Move the store file aside and start over with an empty one.
    fn reset_store(&self) -> Result<Option<PathBuf>> {
        self.set_state(ProfileState::Resetting);
        self.emit(ProfileEvent::WillReset);
        // Dropping the store closes the connection and checkpoints the WAL
        lock(&self.store).take();

        let path = &self.config.db_path;
        let backup = match move_aside(path) {
            Ok(backup) => backup,
            Err(e) => {
                let e = StoreError::from(e);
                self.fail_open(&e);
                return Err(e.into());
            }
        };

        let fresh = Store::open(path).and_then(|store| {
            store.migrate()?;
            Ok(store)
        });
        match fresh {
            Ok(store) => {
                *lock(&self.store) = Some(store);
                self.version.store(CURRENT_VERSION, Ordering::SeqCst);
                *lock(&self.migration) = MigrationState::Current(CURRENT_VERSION);
                self.set_state(ProfileState::Ready);
                if let Some(backup) = &backup {
                    log::info!("Previous store kept at {}", backup.display());
                }
                self.emit(ProfileEvent::DidReset);
                Ok(backup)
            }
            Err(e) => {
                self.fail_open(&e);
                Err(e.into())
            }
        }
    }
}

fn not_operational(state: &ProfileState) -> ProfileError {
    match state {
        ProfileState::Unavailable(reason) => ProfileError::StoreUnavailable(reason.clone()),
        ProfileState::Migrating { from, step } => {
            ProfileError::StoreBusy(format!("migrating v{from} (step {step})"))
        }
        ProfileState::Resetting => ProfileError::StoreBusy("reset in progress".into()),
        ProfileState::Opening => ProfileError::StoreBusy("store is opening".into()),
        ProfileState::Ready | ProfileState::Downlevel { .. } => {
            ProfileError::StoreBusy(format!("unexpected state {state:?}"))
        }
    }
}

/// Copy the first existing legacy store into place. The legacy file itself
/// is never modified.
fn adopt_legacy(config: &ProfileConfig) -> crate::store::Result<()> {
    if config.db_path.exists() {
        return Ok(());
    }
    let Some(legacy) = config.legacy_db_paths.iter().find(|p| p.is_file()) else {
        return Ok(());
    };
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(legacy, &config.db_path)?;
    log::info!(
        "Adopted legacy store {} as {}",
        legacy.display(),
        config.db_path.display()
    );
    Ok(())
}

/// Rename `path` (and its WAL side files) to the first free `<name>.bak`,
/// `<name>.bak.1`, ... Returns the backup path, or None if there was no file.
fn move_aside(path: &Path) -> std::io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut backup = PathBuf::from(format!("{}.bak", path.display()));
    let mut n = 1;
    while backup.exists() {
        backup = PathBuf::from(format!("{}.bak.{n}", path.display()));
        n += 1;
    }
    std::fs::rename(path, &backup)?;
    for suffix in ["-wal", "-shm"] {
        let side = PathBuf::from(format!("{}{suffix}", path.display()));
        if side.exists() {
            std::fs::rename(&side, format!("{}{suffix}", backup.display()))?;
        }
    }
    Ok(Some(backup))
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ProfileError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(())
}

fn validate_rating(rating: Option<u8>) -> Result<()> {
    match rating {
        Some(r) if r > MAX_RATING => Err(ProfileError::InvalidInput(format!(
            "rating {r} is out of range 0-{MAX_RATING}"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn validate_play(play: &PlayEvent) -> Result<()> {
    validate_name("title", &play.title)?;
    validate_name("artist", &play.artist)?;
    if play.duration > MAX_PLAY_SECONDS {
        return Err(ProfileError::InvalidInput(format!(
            "duration {}s exceeds {MAX_PLAY_SECONDS}s",
            play.duration
        )));
    }
    validate_rating(play.rating)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Cloneable access to the writer queue, shared with background workers.
#[derive(Clone)]
pub(crate) struct Handle {
    pub(crate) shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Job>,
}

impl Handle {
    /// Queue a job without waiting for it.
    pub(crate) fn enqueue(&self, job: impl FnOnce(&Shared) + Send + 'static) -> Result<()> {
        self.queue
            .send(Box::new(job))
            .map_err(|_| ProfileError::StoreUnavailable("profile writer has stopped".into()))
    }

    /// Queue a job and block until the writer has run it.
    fn submit<T: Send + 'static>(
        &self,
        job: impl FnOnce(&Shared) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(move |shared| {
            // A panicking job rolls back its transaction and fails only its caller
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(shared))).unwrap_or_else(
                |payload| {
                    let message = panic_message(payload.as_ref());
                    log::error!("Profile job panicked: {message}");
                    Err(ProfileError::InvariantViolation(format!("job panicked: {message}")))
                },
            );
            let _ = tx.send(outcome);
        })?;
        rx.blocking_recv()
            .map_err(|_| ProfileError::StoreUnavailable("profile writer dropped the request".into()))?
    }

    /// Reads run on the caller's thread. While a migration is pending they
    /// queue behind it instead.
    fn read<T: Send + 'static>(
        &self,
        min_version: u32,
        op: impl FnOnce(&Connection) -> crate::store::Result<T> + Send + 'static,
    ) -> Result<T> {
        if matches!(self.shared.state(), ProfileState::Migrating { .. }) {
            return self.submit(move |shared| shared.read(min_version, op));
        }
        self.shared.read(min_version, op)
    }

    /// One mutation, one transaction. `notify` controls the DidUpdate event.
    pub(crate) fn write<T: Send + 'static>(
        &self,
        notify: bool,
        op: impl FnOnce(&Editor) -> crate::store::Result<T> + Send + 'static,
    ) -> Result<T> {
        self.submit(move |shared| {
            let value = shared.transact(op)?;
            if notify {
                shared.emit(ProfileEvent::DidUpdate);
            }
            Ok(value)
        })
    }

    /// A mutation bracketed by the edit lifecycle notifications.
    fn edit<T: Send + 'static>(
        &self,
        entity: EntityId,
        op: impl FnOnce(&Editor) -> crate::store::Result<T> + Send + 'static,
    ) -> Result<T> {
        self.submit(move |shared| {
            shared.emit(ProfileEvent::WillEditObject(entity));
            match shared.transact(op) {
                Ok(value) => {
                    shared.emit(ProfileEvent::DidEditObject(entity));
                    shared.emit(ProfileEvent::DidUpdate);
                    Ok(value)
                }
                Err(e) => {
                    log::warn!("Edit of {entity} failed: {e}");
                    shared.emit(ProfileEvent::FailedEditObject {
                        entity,
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        })
    }
}

/// The listening-history profile: owns the store, serializes every mutation
/// through one writer thread and broadcasts [`ProfileEvent`]s.
pub struct Profile {
    pub(crate) handle: Handle,
    writer: Option<JoinHandle<()>>,
}

impl Profile {
    /// Open the profile at `config.db_path`.
    ///
    /// Never fails outright: a store that cannot be opened leaves the profile
    /// in [`ProfileState::Unavailable`], recoverable with [`reset`](Self::reset).
    /// An old store is migrated on the writer thread; operations issued
    /// meanwhile queue behind it.
    pub fn open(config: ProfileConfig) -> Self {
        Self::open_subscribed(config).0
    }

    /// Like [`open`](Self::open), with a subscription taken before the
    /// migration (if any) starts.
    pub fn open_subscribed(config: ProfileConfig) -> (Self, broadcast::Receiver<ProfileEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            sessions: SessionManager::new(config.session_gap),
            config,
            store: Mutex::new(None),
            state: Mutex::new(ProfileState::Opening),
            migration: Mutex::new(MigrationState::Unopened),
            version: AtomicU32::new(0),
            importing: AtomicBool::new(false),
            cancel_import: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            events,
        });

        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        let worker = Arc::clone(&shared);
        let writer = std::thread::spawn(move || {
            while let Some(job) = jobs.blocking_recv() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&worker))) {
                    log::error!("Profile job panicked: {}", panic_message(payload.as_ref()));
                }
                if worker.closing.load(Ordering::SeqCst) {
                    break;
                }
            }
            log::debug!("Profile writer stopped");
        });

        let profile = Self {
            handle: Handle { shared, queue },
            writer: Some(writer),
        };
        if profile.handle.shared.open_store()
            && profile.handle.enqueue(|shared| shared.run_migration()).is_err()
        {
            log::error!("Profile writer stopped before migration could run");
        }
        (profile, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProfileEvent> {
        self.handle.shared.events.subscribe()
    }

    pub fn state(&self) -> ProfileState {
        self.handle.shared.state()
    }

    pub fn migration_state(&self) -> MigrationState {
        lock(&self.handle.shared.migration).clone()
    }

    pub fn db_path(&self) -> &Path {
        &self.handle.shared.config.db_path
    }

    pub fn is_version2(&self) -> bool {
        self.handle.shared.version.load(Ordering::SeqCst) >= 2
    }

    pub fn is_version3(&self) -> bool {
        self.handle.shared.version.load(Ordering::SeqCst) >= 3
    }

    pub fn import_in_progress(&self) -> bool {
        self.handle.shared.importing.load(Ordering::SeqCst)
    }

    /// Block until every job queued so far has run.
    pub fn wait_idle(&self) -> Result<()> {
        self.handle.submit(|_| Ok(()))
    }

    // ---- mutations ----

    pub fn add_play(&self, play: PlayEvent) -> Result<HistoryId> {
        validate_play(&play)?;
        self.handle.write(true, move |ed| ed.add_play(&play))
    }

    /// Rename an entity; returns the surviving entity when the rename merged
    /// it into an existing one.
    pub fn rename(&self, entity: EntityId, name: &str) -> Result<EntityId> {
        validate_name("name", name)?;
        let name = name.to_string();
        self.handle.edit(entity, move |ed| ed.rename(entity, &name))
    }

    pub fn remove_object(&self, entity: EntityId) -> Result<()> {
        self.handle.edit(entity, move |ed| ed.remove_object(entity))
    }

    pub fn add_history_events(
        &self,
        dates: Vec<DateTime<FixedOffset>>,
        song: SongId,
    ) -> Result<Vec<HistoryId>> {
        self.handle
            .edit(EntityId::Song(song), move |ed| ed.add_history_events(&dates, song))
    }

    pub fn remove_history_event(&self, event: HistoryId, song: SongId) -> Result<()> {
        self.handle
            .edit(EntityId::Song(song), move |ed| ed.remove_history_event(event, song))
    }

    pub fn set_rating(&self, song: SongId, rating: Option<u8>) -> Result<()> {
        validate_rating(rating)?;
        self.handle
            .edit(EntityId::Song(song), move |ed| ed.set_rating(song, rating))
    }

    /// Apply `plays` in the background, one committed play at a time.
    pub fn start_import(&self, plays: Vec<PlayEvent>) -> Result<ImportHandle> {
        import::spawn(self.handle.clone(), plays)
    }

    // ---- lifecycle ----

    /// Run the failed migration again.
    pub fn retry_migration(&self) -> Result<()> {
        self.handle.submit(|shared| {
            match shared.state() {
                ProfileState::Ready => return Ok(()),
                ProfileState::Downlevel { .. } => shared.run_migration(),
                other => return Err(not_operational(&other)),
            }
            shared.check_writable()
        })
    }

    /// Accept a store left downlevel by a failed migration, re-enabling the
    /// reads its schema supports. Returns false if there was nothing to accept.
    pub fn acknowledge_downlevel(&self) -> bool {
        let mut state = lock(&self.handle.shared.state);
        match &mut *state {
            ProfileState::Downlevel { version, acknowledged, .. } => {
                log::warn!("Continuing with store at v{version}");
                *acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Set the current store file aside and start a fresh, empty one.
    /// Returns where the old file went.
    pub fn reset(&self) -> Result<Option<PathBuf>> {
        self.handle.shared.cancel_import.store(true, Ordering::SeqCst);
        self.handle.submit(|shared| shared.reset_store())
    }

    // ---- reads ----

    pub fn all_sessions(&self) -> Result<Vec<Session>> {
        self.handle.read(1, all_sessions)
    }

    pub fn songs_for_session(&self, id: SessionId) -> Result<Vec<SessionSong>> {
        self.handle.read(1, move |conn| songs_for_session(conn, id))
    }

    pub fn ratings_for_session(&self, id: SessionId) -> Result<Vec<RatingCount>> {
        self.handle.read(2, move |conn| ratings_for_session(conn, id))
    }

    pub fn hours_for_session(&self, id: SessionId) -> Result<Vec<HourCount>> {
        self.handle.read(2, move |conn| hours_for_session(conn, id))
    }

    pub fn artists_for_session(&self, id: SessionId) -> Result<Vec<SessionItem>> {
        self.handle.read(1, move |conn| artists_for_session(conn, id))
    }

    pub fn albums_for_session(&self, id: SessionId) -> Result<Vec<SessionItem>> {
        self.handle.read(1, move |conn| albums_for_session(conn, id))
    }

    pub fn history_for_song(&self, id: SongId) -> Result<Vec<HistoryEvent>> {
        self.handle.read(2, move |conn| history_for_song(conn, id))
    }

    pub fn song(&self, id: SongId) -> Result<Song> {
        self.handle.read(3, move |conn| get_song(conn, id))
    }

    pub fn artist(&self, id: ArtistId) -> Result<Artist> {
        self.handle.read(1, move |conn| get_artist(conn, id))
    }

    pub fn album(&self, id: AlbumId) -> Result<Album> {
        self.handle.read(1, move |conn| get_album(conn, id))
    }

    pub fn find_artist(&self, name: &str) -> Result<Option<Artist>> {
        let name = name.to_string();
        self.handle.read(3, move |conn| find_artist(conn, &name))
    }

    /// Rebuild every aggregate from history and list what disagrees.
    pub fn check(&self) -> Result<Vec<Discrepancy>> {
        self.handle.read(CURRENT_VERSION, verify)
    }
}

impl Drop for Profile {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        shared.cancel_import.store(true, Ordering::SeqCst);
        shared.closing.store(true, Ordering::SeqCst);
        // Wake the writer so it sees the flag
        let _ = self.handle.enqueue(|_| {});
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::error!("Profile writer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrate::tests::seed_v1;

    const T0: i64 = 1_700_000_000;

    fn at(offset: i64) -> DateTime<FixedOffset> {
        let utc = FixedOffset::east_opt(0).unwrap();
        DateTime::from_timestamp(T0 + offset, 0).unwrap().with_timezone(&utc)
    }

    fn config(dir: &tempfile::TempDir) -> ProfileConfig {
        ProfileConfig {
            session_gap: Duration::from_secs(300),
            ..ProfileConfig::new(dir.path().join("profile.db"))
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ProfileEvent>) -> Vec<ProfileEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn song_of(profile: &Profile, id: HistoryId) -> SongId {
        let sessions = profile.all_sessions().unwrap();
        sessions
            .iter()
            .flat_map(|s| profile.songs_for_session(s.id).unwrap())
            .find(|s| s.history_id == id)
            .map(|s| s.song_id)
            .unwrap()
    }

    /// V1 file with a table the V2 step also wants to create.
    fn blocked_v1(path: &Path) {
        let store = Store::open(path).unwrap();
        seed_v1(&store, true);
        store
            .conn
            .execute_batch("CREATE TABLE session_hours (x INTEGER);")
            .unwrap();
    }

    #[test]
    fn test_fresh_profile_is_ready_at_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let (profile, mut rx) = Profile::open_subscribed(config(&dir));
        assert_eq!(profile.state(), ProfileState::Ready);
        assert!(profile.is_version2() && profile.is_version3());
        assert_eq!(profile.migration_state(), MigrationState::Current(CURRENT_VERSION));
        profile.wait_idle().unwrap();
        assert!(drain(&mut rx).is_empty(), "no migration notifications for a fresh file");
    }

    #[test]
    fn test_play_then_remove_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(config(&dir));
        let mut rx = profile.subscribe();

        let a = profile.add_play(PlayEvent::new("A", "X", None, 180, at(0))).unwrap();
        profile.add_play(PlayEvent::new("B", "X", None, 200, at(60))).unwrap();
        assert_eq!(drain(&mut rx), vec![ProfileEvent::DidUpdate, ProfileEvent::DidUpdate]);

        let sessions = profile.all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(profile.songs_for_session(sessions[0].id).unwrap().len(), 2);
        let artist = profile.find_artist("X").unwrap().unwrap();
        assert_eq!(artist.counters.play_count, 2);
        assert_eq!(artist.counters.play_time, 380);

        let song_a = song_of(&profile, a);
        profile.remove_history_event(a, song_a).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                ProfileEvent::WillEditObject(EntityId::Song(song_a)),
                ProfileEvent::DidEditObject(EntityId::Song(song_a)),
                ProfileEvent::DidUpdate,
            ]
        );

        assert_eq!(profile.all_sessions().unwrap()[0].counters.play_count, 1);
        assert_eq!(profile.artist(artist.id).unwrap().counters.play_count, 1);
        assert!(matches!(profile.song(song_a), Err(ProfileError::EntityNotFound(_))));
        assert!(profile.check().unwrap().is_empty());
    }

    #[test]
    fn test_rename_merge_through_facade() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(config(&dir));
        profile.add_play(PlayEvent::new("Help!", "The Beatles", None, 140, at(0))).unwrap();
        profile.add_play(PlayEvent::new("Something", "Beatles", None, 180, at(9_000))).unwrap();

        let src = profile.find_artist("The Beatles").unwrap().unwrap();
        let dst = profile.find_artist("beatles").unwrap().unwrap();
        let survivor = profile.rename(EntityId::Artist(src.id), "Beatles").unwrap();
        assert_eq!(survivor, EntityId::Artist(dst.id));

        let merged = profile.artist(dst.id).unwrap();
        assert_eq!(merged.counters.play_count, 2);
        assert_eq!(merged.counters.play_time, 320);
        assert!(profile.find_artist("The Beatles").unwrap().is_none());
    }

    #[test]
    fn test_failed_edit_is_reported_and_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(config(&dir));
        let mut rx = profile.subscribe();

        let missing = EntityId::Album(AlbumId(77));
        let err = profile.remove_object(missing).unwrap_err();
        assert!(matches!(err, ProfileError::EntityNotFound(_)));
        let events = drain(&mut rx);
        assert_eq!(events[0], ProfileEvent::WillEditObject(missing));
        assert!(matches!(
            &events[1],
            ProfileEvent::FailedEditObject { entity, .. } if *entity == missing
        ));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_invalid_input_is_rejected_before_queueing() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(config(&dir));
        let err = profile.add_play(PlayEvent::new("  ", "X", None, 10, at(0))).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidInput(_)));
        let err = profile
            .add_play(PlayEvent::new("A", "X", None, 10, at(0)).with_rating(9))
            .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidInput(_)));
        assert!(profile.all_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_out_of_range_duration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(config(&dir));
        let err = profile
            .add_play(PlayEvent::new("A", "X", None, i64::MAX as u64, at(0)))
            .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidInput(_)));
        let err = profile
            .add_play(PlayEvent::new("A", "X", None, MAX_PLAY_SECONDS + 1, at(0)))
            .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidInput(_)));

        profile
            .add_play(PlayEvent::new("A", "X", None, MAX_PLAY_SECONDS, at(0)))
            .unwrap();
        assert_eq!(profile.state(), ProfileState::Ready);
        assert!(profile.check().unwrap().is_empty());
    }

    #[test]
    fn test_writer_survives_a_panicking_job() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(config(&dir));
        profile.add_play(PlayEvent::new("A", "X", None, 10, at(0))).unwrap();

        let err = profile
            .handle
            .write(true, |ed| -> crate::store::Result<()> {
                ed.add_play(&PlayEvent::new("B", "X", None, 10, at(20)))?;
                panic!("job blew up");
            })
            .unwrap_err();
        assert!(matches!(err, ProfileError::InvariantViolation(_)));

        // The half-done transaction rolled back and the queue still runs
        assert_eq!(profile.state(), ProfileState::Ready);
        profile.add_play(PlayEvent::new("C", "X", None, 10, at(40))).unwrap();
        let sessions = profile.all_sessions().unwrap();
        let titles: Vec<_> = profile
            .songs_for_session(sessions[0].id)
            .unwrap()
            .into_iter()
            .map(|s| s.title)
            .collect();
        assert_eq!(titles, vec!["A", "C"]);
        assert!(profile.check().unwrap().is_empty());
    }

    #[test]
    fn test_reads_wait_for_a_running_migration() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let store = Store::open(&cfg.db_path).unwrap();
            seed_v1(&store, true);
        }

        let profile = Profile::open(cfg);
        // No wait_idle: these queue behind the migration
        let sessions = profile.all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(profile.hours_for_session(sessions[0].id).unwrap()[0].count, 2);
        assert_eq!(profile.state(), ProfileState::Ready);
        assert!(profile.is_version3());
    }

    #[test]
    fn test_legacy_store_is_copied_and_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("toplists.data");
        {
            let store = Store::open(&legacy).unwrap();
            seed_v1(&store, false);
        }
        let mut cfg = config(&dir);
        cfg.legacy_db_paths = vec![dir.path().join("missing.data"), legacy.clone()];

        let (profile, mut rx) = Profile::open_subscribed(cfg);
        profile.wait_idle().unwrap();
        assert_eq!(profile.state(), ProfileState::Ready);
        assert!(profile.is_version3());
        assert_eq!(
            drain(&mut rx),
            vec![
                ProfileEvent::WillMigrate { from: 1, to: 3 },
                ProfileEvent::MigrateStep { from: 1, step: 2 },
                ProfileEvent::MigrateStep { from: 1, step: 3 },
                ProfileEvent::DidMigrate { from: 1, to: 3 },
            ]
        );
        let sessions = profile.all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(profile.hours_for_session(sessions[0].id).unwrap()[0].count, 2);
        assert!(profile.check().unwrap().is_empty());
        drop(profile);

        // The legacy file is untouched
        let old = Store::open(&legacy).unwrap();
        assert_eq!(old.version().unwrap(), 1);
    }

    #[test]
    fn test_failed_migration_requires_acknowledgment() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        blocked_v1(&cfg.db_path);

        let (profile, mut rx) = Profile::open_subscribed(cfg);
        profile.wait_idle().unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0], ProfileEvent::WillMigrate { from: 1, to: 3 });
        assert_eq!(events[1], ProfileEvent::MigrateStep { from: 1, step: 2 });
        assert!(matches!(
            &events[2],
            ProfileEvent::MigrateFailed { from: 1, to: 3, .. }
        ));
        assert!(!profile.is_version2());
        assert!(matches!(
            profile.state(),
            ProfileState::Downlevel { version: 1, acknowledged: false, .. }
        ));

        // Nothing works until the caller accepts the old version
        assert!(matches!(
            profile.all_sessions(),
            Err(ProfileError::MigrationFailed { version: 1, .. })
        ));
        assert!(profile.acknowledge_downlevel());
        let sessions = profile.all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(profile.songs_for_session(sessions[0].id).unwrap().len(), 2);
        assert!(matches!(
            profile.ratings_for_session(sessions[0].id),
            Err(ProfileError::MigrationFailed { .. })
        ));
        assert!(matches!(
            profile.add_play(PlayEvent::new("A", "X", None, 10, at(0))),
            Err(ProfileError::MigrationFailed { .. })
        ));

        // Still blocked on retry
        assert!(matches!(
            profile.retry_migration(),
            Err(ProfileError::MigrationFailed { version: 1, .. })
        ));
    }

    #[test]
    fn test_reset_recovers_from_failed_migration() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let db_path = cfg.db_path.clone();
        blocked_v1(&db_path);

        let profile = Profile::open(cfg);
        profile.wait_idle().unwrap();
        let mut rx = profile.subscribe();

        let backup = profile.reset().unwrap().unwrap();
        assert_eq!(backup, dir.path().join("profile.db.bak"));
        assert_eq!(drain(&mut rx), vec![ProfileEvent::WillReset, ProfileEvent::DidReset]);
        assert_eq!(profile.state(), ProfileState::Ready);
        assert!(profile.is_version3());
        assert!(profile.all_sessions().unwrap().is_empty());
        profile.add_play(PlayEvent::new("A", "X", None, 10, at(0))).unwrap();
        drop(profile);

        // Old data kept as it was
        let old = Store::open(&backup).unwrap();
        assert_eq!(old.version().unwrap(), 1);
        assert_eq!(old.all_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_unreadable_store_is_unavailable_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        std::fs::write(&cfg.db_path, vec![0x5a; 4096]).unwrap();

        let profile = Profile::open(cfg);
        assert!(matches!(profile.state(), ProfileState::Unavailable(_)));
        assert!(matches!(profile.all_sessions(), Err(ProfileError::StoreUnavailable(_))));
        assert!(matches!(
            profile.add_play(PlayEvent::new("A", "X", None, 10, at(0))),
            Err(ProfileError::StoreUnavailable(_))
        ));

        profile.reset().unwrap();
        assert_eq!(profile.state(), ProfileState::Ready);
        profile.add_play(PlayEvent::new("A", "X", None, 10, at(0))).unwrap();
        assert_eq!(profile.all_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_history_edits_keep_aggregates_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::open(config(&dir));

        // Deterministic pseudo-random workload
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move |n: u64| {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            (seed >> 33) % n
        };
        let titles = ["A", "B", "C", "D"];
        let artists = ["X", "Y"];
        let mut live: Vec<(HistoryId, SongId)> = Vec::new();
        let mut clock = 0;

        for _ in 0..60 {
            clock += next(900) as i64;
            match next(4) {
                0 if !live.is_empty() => {
                    let (event, song) = live.remove(next(live.len() as u64) as usize);
                    profile.remove_history_event(event, song).unwrap();
                    live.retain(|(_, s)| profile.song(*s).is_ok());
                }
                1 if !live.is_empty() => {
                    let song = live[next(live.len() as u64) as usize].1;
                    let ids = profile
                        .add_history_events(vec![at(clock - 5_000), at(clock + 50)], song)
                        .unwrap();
                    live.extend(ids.into_iter().map(|id| (id, song)));
                }
                _ => {
                    let title = titles[next(titles.len() as u64) as usize];
                    let artist = artists[next(artists.len() as u64) as usize];
                    let play = PlayEvent::new(title, artist, Some("LP"), 60 + next(240), at(clock))
                        .with_rating(next(6) as u8);
                    let id = profile.add_play(play).unwrap();
                    live.push((id, song_of(&profile, id)));
                }
            }
            assert!(profile.check().unwrap().is_empty());
        }
        for session in profile.all_sessions().unwrap() {
            let hours: u64 = profile.hours_for_session(session.id).unwrap().iter().map(|h| h.count).sum();
            let ratings: u64 = profile.ratings_for_session(session.id).unwrap().iter().map(|r| r.count).sum();
            assert_eq!(hours, session.counters.play_count);
            assert_eq!(ratings, session.counters.play_count);
        }
    }
}
