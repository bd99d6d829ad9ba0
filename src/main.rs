use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use listenlog::import::read_import_file;
use listenlog::profile::{Profile, ProfileEvent, ProfileState};
use listenlog::store::models::{
    AlbumId, ArtistId, Counters, EntityId, HistoryId, PlayEvent, SessionId, SongId,
};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "listenlog", version, about = "Listening history: play counts, sessions and edits")]
struct Cli {
    /// Path to the SQLite store
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Keep using a store a failed migration left at an older version
    #[arg(long, global = true)]
    accept_downlevel: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Song,
    Artist,
    Album,
}

impl Kind {
    fn entity(self, id: i64) -> EntityId {
        match self {
            Self::Song => EntityId::Song(SongId(id)),
            Self::Artist => EntityId::Artist(ArtistId(id)),
            Self::Album => EntityId::Album(AlbumId(id)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Record a completed play
    Play {
        title: String,
        artist: String,

        #[arg(long)]
        album: Option<String>,

        /// Seconds played
        #[arg(short, long)]
        duration: u64,

        /// Start of the play (RFC 3339, default now)
        #[arg(long)]
        at: Option<String>,

        /// Rating 0-5
        #[arg(short, long)]
        rating: Option<u8>,
    },

    /// Rename a song, artist or album (merges into an existing match)
    Rename {
        #[arg(value_enum)]
        kind: Kind,
        id: i64,
        name: String,
    },

    /// Remove a song, artist or album and all of its plays
    Remove {
        #[arg(value_enum)]
        kind: Kind,
        id: i64,
    },

    /// Add past plays of a song
    AddHistory {
        song_id: i64,

        /// Play start times (RFC 3339)
        #[arg(required = true)]
        dates: Vec<String>,
    },

    /// Remove one play of a song
    RemoveHistory { play_id: i64, song_id: i64 },

    /// Set or clear a song's rating
    Rate {
        song_id: i64,

        /// Rating 0-5; omit to clear
        rating: Option<u8>,
    },

    /// List listening sessions, most recent first
    Sessions {
        /// Number of results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show one session's plays, artists, albums and histograms
    Session { id: i64 },

    /// Show every play of a song
    History { song_id: i64 },

    /// Import plays from a JSON file
    Import { file: PathBuf },

    /// Rebuild all aggregates from history and report mismatches
    Check,

    /// Retry a failed migration
    Migrate,

    /// Show store state and version
    Status,

    /// Move the current store aside and start a fresh one
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = listenlog::config::AppConfig::load();

    // Resolve store path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(listenlog::config::default_db_path);
    log::info!("Store: {}", db_path.display());

    let profile = Profile::open(config.profile_config(db_path));
    // Let any pending migration finish before the command runs
    profile.wait_idle().context("Profile writer stopped")?;
    if cli.accept_downlevel {
        profile.acknowledge_downlevel();
    }

    match cli.command {
        Commands::Play { title, artist, album, duration, at, rating } => {
            let played_at = match at {
                Some(s) => parse_time(&s)?,
                None => {
                    let now = Local::now();
                    now.with_timezone(now.offset())
                }
            };
            let mut play = PlayEvent::new(title, artist, album.as_deref(), duration, played_at);
            play.rating = rating;
            let id = profile.add_play(play).context("Failed to record play")?;
            println!("Recorded {}", id);
        }

        Commands::Rename { kind, id, name } => {
            let entity = kind.entity(id);
            let survivor = profile.rename(entity, &name).context("Rename failed")?;
            if survivor == entity {
                println!("Renamed {} to \"{}\"", entity, name);
            } else {
                println!("Merged {} into {} (\"{}\")", entity, survivor, name);
            }
        }

        Commands::Remove { kind, id } => {
            let entity = kind.entity(id);
            profile.remove_object(entity).context("Remove failed")?;
            println!("Removed {}", entity);
        }

        Commands::AddHistory { song_id, dates } => {
            let dates = dates
                .iter()
                .map(|s| parse_time(s))
                .collect::<Result<Vec<_>>>()?;
            let ids = profile
                .add_history_events(dates, SongId(song_id))
                .context("Adding history failed")?;
            println!("Added {} plays of {}", ids.len(), SongId(song_id));
        }

        Commands::RemoveHistory { play_id, song_id } => {
            profile
                .remove_history_event(HistoryId(play_id), SongId(song_id))
                .context("Removing play failed")?;
            println!("Removed {}", HistoryId(play_id));
        }

        Commands::Rate { song_id, rating } => {
            profile
                .set_rating(SongId(song_id), rating)
                .context("Rating failed")?;
            match rating {
                Some(r) => println!("Rated {} {}/5", SongId(song_id), r),
                None => println!("Cleared rating of {}", SongId(song_id)),
            }
        }

        Commands::Sessions { limit } => {
            let sessions = profile.all_sessions().context("Query failed")?;
            if sessions.is_empty() {
                println!("No sessions yet.");
                return Ok(());
            }
            println!("{:>6}  {:<16}  {:<16}  {:>6} {:>9}", "ID", "Start", "End", "Plays", "Time");
            for s in sessions.iter().take(limit) {
                println!(
                    "{:>6}  {:<16}  {:<16}  {:>6} {:>9}",
                    s.id.0,
                    fmt_time(s.started_at),
                    fmt_time(s.ended_at),
                    s.counters.play_count,
                    fmt_duration(s.counters.play_time)
                );
            }
            if sessions.len() > limit {
                println!("({} more)", sessions.len() - limit);
            }
        }

        Commands::Session { id } => {
            let id = SessionId(id);
            let songs = profile.songs_for_session(id).context("Query failed")?;
            println!("{}:", id);
            for s in &songs {
                println!(
                    "  {:<16}  {:<30} {:<25} {:<25} {:>6}",
                    fmt_time(s.played_at),
                    truncate(&s.title, 30),
                    truncate(&s.artist, 25),
                    truncate(s.album.as_deref().unwrap_or("-"), 25),
                    fmt_duration(s.duration)
                );
            }

            println!();
            println!("Artists:");
            for item in profile.artists_for_session(id).context("Query failed")? {
                print_item(&item.name, item.counters);
            }
            println!("Albums:");
            for item in profile.albums_for_session(id).context("Query failed")? {
                print_item(&item.name, item.counters);
            }

            match (profile.ratings_for_session(id), profile.hours_for_session(id)) {
                (Ok(ratings), Ok(hours)) => {
                    let ratings: Vec<String> = ratings
                        .iter()
                        .map(|r| format!("{}★×{}", r.rating, r.count))
                        .collect();
                    let hours: Vec<String> = hours
                        .iter()
                        .map(|h| format!("{:02}h×{}", h.hour, h.count))
                        .collect();
                    println!("Ratings: {}", ratings.join("  "));
                    println!("Hours:   {}", hours.join("  "));
                }
                (Err(e), _) | (_, Err(e)) => println!("Histograms unavailable: {}", e),
            }
        }

        Commands::History { song_id } => {
            let song = profile.song(SongId(song_id)).context("Query failed")?;
            let history = profile
                .history_for_song(song.id)
                .context("Query failed")?;
            println!(
                "{} \"{}\": {} plays, {} total",
                song.id,
                song.title,
                song.counters.play_count,
                fmt_duration(song.counters.play_time)
            );
            for event in history {
                println!(
                    "  {:>8}  {}  {:>6}  {}",
                    event.id.0,
                    event.played_at.to_datetime().format("%Y-%m-%d %H:%M %:z"),
                    fmt_duration(event.duration),
                    event.session_id
                );
            }
        }

        Commands::Import { file } => {
            let plays = read_import_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let total = plays.len() as u64;

            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) ({eta}) {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
            );
            pb.set_message("Importing...");

            let mut rx = profile.subscribe();
            let import = profile.start_import(plays).context("Import failed to start")?;
            loop {
                match rx.blocking_recv() {
                    Ok(ProfileEvent::ImportProgress(p)) => {
                        pb.set_position((p * total as f64).round() as u64)
                    }
                    Ok(ProfileEvent::ImportFinished(_)) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
            let summary = import.wait();
            pb.finish_with_message("done");

            println!(
                "Import complete: {} imported, {} failed",
                summary.imported, summary.failed
            );
            if let Some(reason) = summary.aborted {
                anyhow::bail!("Import stopped early: {}", reason);
            }
        }

        Commands::Check => {
            let found = profile.check().context("Check failed")?;
            if found.is_empty() {
                println!("All aggregates match the play history.");
            } else {
                for d in &found {
                    println!("  {}", d);
                }
                anyhow::bail!("{} discrepancies found", found.len());
            }
        }

        Commands::Migrate => {
            profile.retry_migration().context("Migration failed")?;
            println!("Store is at the current version.");
        }

        Commands::Status => {
            println!("Store:    {}", profile.db_path().display());
            let state = match profile.state() {
                ProfileState::Ready => "ready".to_string(),
                ProfileState::Downlevel { version, message, acknowledged } => format!(
                    "downlevel at v{} ({}){}",
                    version,
                    message,
                    if acknowledged { ", accepted" } else { "" }
                ),
                ProfileState::Unavailable(reason) => format!("unavailable ({})", reason),
                other => format!("{:?}", other),
            };
            println!("State:    {}", state);
            println!(
                "Version:  {}",
                if profile.is_version3() {
                    "3"
                } else if profile.is_version2() {
                    "2"
                } else {
                    "1 or older"
                }
            );
            if let Ok(sessions) = profile.all_sessions() {
                let plays: u64 = sessions.iter().map(|s| s.counters.play_count).sum();
                println!("Sessions: {}", sessions.len());
                println!("Plays:    {}", plays);
            }
        }

        Commands::Reset => {
            match profile.reset().context("Reset failed")? {
                Some(backup) => println!("Previous store moved to {}", backup.display()),
                None => println!("Started a fresh store."),
            }
        }
    }

    Ok(())
}

fn parse_time(s: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).with_context(|| format!("Invalid timestamp \"{}\"", s))
}

fn fmt_time(unix: i64) -> String {
    match Local.timestamp_opt(unix, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => unix.to_string(),
    }
}

fn fmt_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

fn print_item(name: &str, counters: Counters) {
    println!(
        "  {:<30} {:>4} plays {:>9}",
        truncate(name, 30),
        counters.play_count,
        fmt_duration(counters.play_time)
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let t: String = s.chars().take(max - 1).collect();
        format!("{}…", t)
    }
}
