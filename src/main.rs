mod artwork;
mod auth;
mod config;
mod controller;
mod device;
mod error;
mod logging;
mod model;
mod notify;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use artwork::{ArtworkResolver, CatalogArtwork, DeviceArtwork};
use auth::{FileTokenStore, PkceHandshake, TokenStore};
use config::AppConfig;
use controller::{Engine, EngineContext, EngineHandle};
use model::{
    ClipFile, ClipRecord, SpotifyConnector, format_time, lookup_track, parse_track_link, sort_clips,
};

const HELP: &str = "\
commands:
  auth                 start browser authorization
  callback <url>       hand the redirect URL back
  connect | disconnect | reconnect
  add <uri|link>       append a whole track as a clip
  reload               re-read the clip file
  play <n> | next | prev | toggle | stop
  status               show connection and playback state
  artwork <n>          resolve album art for clip n
  quit";

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = logging::init_logging() {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    tracing::info!("=== loop-deck starting ===");

    let config = AppConfig::from_env();
    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(&config.token_file));
    let context = EngineContext::new(store.clone(), config.engine.clone());

    let (engine, handle) = Engine::new(
        context,
        Box::new(PkceHandshake::new(&config.client_id, &config.redirect_uri)),
        Arc::new(SpotifyConnector::new(config.preferred_device.clone())),
    );
    let engine_task = tokio::spawn(engine.run());

    let clip_file = ClipFile::new(&config.clips_file);
    let mut clips = load_clip_file(&clip_file);
    handle.load_clips(clips.clone());

    let http = reqwest::Client::new();
    let resolver = ArtworkResolver::new(
        Arc::new(DeviceArtwork::new(
            handle.device(),
            handle.subscribe_connection(),
            http.clone(),
        )),
        Arc::new(CatalogArtwork::new(http, store.clone())),
    );

    spawn_notification_printer(&handle);

    println!("loop-deck: {} clips from {}", clips.len(), clip_file.path().display());
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let argument = parts.next();

        match command {
            "auth" => {
                if let Err(e) = handle.authorize().await {
                    println!("authorization unavailable: {}", e);
                }
            }
            "callback" => match argument {
                Some(payload) => {
                    if !handle.handle_auth_callback(payload).await {
                        println!("callback not accepted");
                    }
                }
                None => println!("usage: callback <url>"),
            },
            "connect" => handle.connect(),
            "disconnect" => handle.disconnect(),
            "reconnect" => handle.reconnect_if_needed(),
            "add" => match argument {
                Some(input) => {
                    if let Err(e) = add_track(input, store.as_ref(), &clip_file, &mut clips).await {
                        tracing::warn!(error = format!("{:#}", e), "Add track failed");
                        println!("{}", e);
                    } else {
                        handle.load_clips(clips.clone());
                    }
                }
                None => println!("usage: add <uri|link>"),
            },
            "reload" => {
                clips = load_clip_file(&clip_file);
                handle.load_clips(clips.clone());
                println!("{} clips", clips.len());
            }
            "play" => match argument.and_then(|n| n.parse::<usize>().ok()) {
                Some(n) => handle.play_from_index(n),
                None => println!("usage: play <n>"),
            },
            "next" => handle.play_next(),
            "prev" => handle.play_previous(),
            "toggle" => handle.toggle_play_pause(),
            "stop" => handle.stop(),
            "status" => print_status(&handle, &clips),
            "artwork" => {
                let sorted = sort_clips(clips.clone());
                match argument
                    .and_then(|n| n.parse::<usize>().ok())
                    .and_then(|n| sorted.get(n))
                {
                    Some(clip) => match resolver.fetch_artwork(&clip.track_uri).await {
                        Some(art) => println!("{} ({} bytes)", art.url, art.bytes.len()),
                        None => println!("no artwork"),
                    },
                    None => println!("usage: artwork <n>"),
                }
            }
            "quit" | "exit" => break,
            "help" => println!("{}", HELP),
            other => println!("unknown command: {}", other),
        }
    }

    handle.shutdown();
    if let Err(e) = engine_task.await {
        tracing::error!(error = %e, "Engine task failed");
    }
    tracing::info!("=== loop-deck exited ===");
    Ok(())
}

fn load_clip_file(clip_file: &ClipFile) -> Vec<ClipRecord> {
    match clip_file.load() {
        Ok(clips) => clips,
        Err(e) => {
            tracing::error!(path = %clip_file.path().display(), error = %e, "Failed to read clip file");
            println!("could not read {}: {}", clip_file.path().display(), e);
            Vec::new()
        }
    }
}

/// Append the track behind `input` as a full-length clip and save the file.
async fn add_track(
    input: &str,
    store: &dyn TokenStore,
    clip_file: &ClipFile,
    clips: &mut Vec<ClipRecord>,
) -> Result<()> {
    let uri = parse_track_link(input).context("Invalid Spotify URI or link")?;
    let credential = store.load().context("Authorize with Spotify first")?;
    let track = lookup_track(&credential, &uri)
        .await
        .context("Could not fetch track. Check the URI.")?;

    let clip = ClipRecord::from_track(track, clips.len() as i64);
    let mut updated = clips.clone();
    updated.push(clip.clone());
    clip_file.save(&updated)?;
    *clips = updated;
    println!("added {} - {}", clip.artist_name, clip.track_name);
    Ok(())
}

fn spawn_notification_printer(handle: &EngineHandle) {
    let mut notices = handle.notifications().subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("! {}", notice.message);
        }
    });
}

fn print_status(handle: &EngineHandle, clips: &[ClipRecord]) {
    let device_live = handle
        .device()
        .borrow()
        .as_ref()
        .is_some_and(|device| device.is_connected());
    println!(
        "connection: {}{}{}",
        handle.connection_state(),
        if handle.is_busy() { " (busy)" } else { "" },
        if device_live { "" } else { " (no live device)" },
    );
    if let Some(error) = handle.last_error() {
        println!("last error: {}", error);
    }
    if let Some(notice) = handle.notifications().current() {
        println!("notice: {}", notice);
    }

    let status = handle.status();
    for (i, clip) in sort_clips(clips.to_vec()).iter().enumerate() {
        let marker = if status.current_index == Some(i) { ">" } else { " " };
        println!(
            "{} {:>2}. {} - {} [{}] {}",
            marker,
            i,
            clip.artist_name,
            clip.track_name,
            clip.trim_range_display(),
            format_time(clip.effective_duration_ms()),
        );
    }

    if let Some(clip) = &status.current_clip {
        println!(
            "{} {} / {}{}{}",
            if status.is_playing { "playing" } else { "paused" },
            format_time(handle.display_position(Instant::now())),
            format_time(clip.stop_position_ms),
            if status.can_go_previous { "  [prev]" } else { "" },
            if status.can_go_next { "  [next]" } else { "" },
        );
    }
    if let Some(snapshot) = handle.current_snapshot() {
        println!(
            "device: {} - {} at {}",
            snapshot.artist_name,
            snapshot.track_name,
            format_time(snapshot.position_ms)
        );
    }
}
