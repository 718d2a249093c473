//! Process wiring: builds the player from settings and drives it from stdin.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use audio_player::playback::CpalSink;
use audio_player::{AudioSink, NullSink, PlaybackDevice, device};
use crossbeam_channel::select;
use streamplay_types::{PlaybackStatus, Track};

use crate::cli::{Args, Command};
use crate::config::{RateMode, Settings};
use crate::media::HttpMediaServer;
use crate::play_queue::Direction;
use crate::player::Player;
use crate::report::{HttpReporter, Reporter};

const HISTORY_SHOWN: usize = 10;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for (i, name) in device::output_device_names(&host)?.iter().enumerate() {
        println!("{i}: {name}");
    }
    Ok(())
}

/// Fold command-line overrides into the file settings.
pub fn apply_args(mut settings: Settings, args: &Args) -> Settings {
    if let Some(device) = args.device.clone() {
        settings.audio.device = Some(device);
    }
    if let Some(volume) = args.volume {
        settings.audio.initial_volume = volume.min(100);
    }
    if args.resample {
        settings.audio.rate_policy = RateMode::Resample;
    }
    if args.no_report {
        settings.player.disable_playback_reporting = true;
    }
    settings
}

/// Assemble device, media server and reporter into a player (not yet started).
pub fn build_player(settings: &Settings, null_output: bool) -> Result<Player> {
    let stream_url = settings
        .server
        .stream_url
        .clone()
        .ok_or_else(|| anyhow!("server.stream_url is not set"))?;

    let mut server = HttpMediaServer::new(stream_url, settings.buffer_config());
    if let Some(url) = settings.server.album_url.clone() {
        server = server.with_album_url(url);
    }
    if let Some(url) = settings.server.artist_url.clone() {
        server = server.with_artist_url(url);
    }
    for (name, value) in settings.headers() {
        server = server.with_header(name, value);
    }

    let reporter: Option<Arc<dyn Reporter>> = match settings.server.report_url.clone() {
        Some(url) if !settings.player.disable_playback_reporting => {
            let mut reporter = HttpReporter::new(url);
            for (name, value) in settings.headers() {
                reporter = reporter.with_header(name, value);
            }
            tracing::info!(session = %reporter.session_id(), "progress reporting enabled");
            Some(Arc::new(reporter))
        }
        _ => None,
    };

    let playback = settings.playback_config();
    let sink: Arc<dyn AudioSink> = if null_output {
        tracing::info!("null output");
        Arc::new(NullSink::realtime())
    } else {
        Arc::new(CpalSink::new(playback.device.clone(), playback.device_buffer_ms))
    };
    let device = PlaybackDevice::new(sink, playback);
    device.set_volume(settings.audio.initial_volume);

    Player::new(device, Arc::new(server), reporter, settings.player_config())
}

/// Read a JSON array of tracks.
pub fn load_playlist(path: &Path) -> Result<Vec<Track>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read playlist {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parse playlist {:?}", path))
}

/// A line typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Toggle,
    Pause,
    Resume,
    Stop,
    Next,
    Previous,
    Volume(u8),
    Mute,
    Shuffle(bool),
    Queue,
    History,
    Remove(usize),
    Up(usize),
    Down(usize),
    Clear,
    Status,
    Quit,
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        bail!("empty command");
    };
    let arg = words.next();
    let index = || -> Result<usize> {
        let raw = arg.ok_or_else(|| anyhow!("{verb} needs an index"))?;
        raw.parse().with_context(|| format!("bad index {raw:?}"))
    };
    let cmd = match verb.to_ascii_lowercase().as_str() {
        "toggle" | "p" => ConsoleCommand::Toggle,
        "pause" => ConsoleCommand::Pause,
        "resume" | "play" => ConsoleCommand::Resume,
        "stop" => ConsoleCommand::Stop,
        "next" | "n" => ConsoleCommand::Next,
        "prev" | "previous" => ConsoleCommand::Previous,
        "vol" | "volume" => {
            let raw = arg.ok_or_else(|| anyhow!("vol needs a percentage"))?;
            let percent: u8 = raw.parse().with_context(|| format!("bad volume {raw:?}"))?;
            ConsoleCommand::Volume(percent)
        }
        "mute" => ConsoleCommand::Mute,
        "shuffle" => match arg {
            Some("on") => ConsoleCommand::Shuffle(true),
            Some("off") => ConsoleCommand::Shuffle(false),
            _ => bail!("shuffle takes on|off"),
        },
        "queue" | "q" => ConsoleCommand::Queue,
        "history" => ConsoleCommand::History,
        "rm" => ConsoleCommand::Remove(index()?),
        "up" => ConsoleCommand::Up(index()?),
        "down" => ConsoleCommand::Down(index()?),
        "clear" => ConsoleCommand::Clear,
        "status" | "s" => ConsoleCommand::Status,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command {other:?}"),
    };
    Ok(cmd)
}

/// Apply `cmd`; returns `false` when the console should exit.
pub fn execute(player: &Player, cmd: ConsoleCommand) -> bool {
    match cmd {
        ConsoleCommand::Toggle => player.play_pause(),
        ConsoleCommand::Pause => player.pause(),
        ConsoleCommand::Resume => player.resume(),
        ConsoleCommand::Stop => player.stop_media(),
        ConsoleCommand::Next => player.next(),
        ConsoleCommand::Previous => player.previous(),
        ConsoleCommand::Volume(percent) => player.set_volume(percent),
        ConsoleCommand::Mute => player.toggle_mute(),
        ConsoleCommand::Shuffle(on) => player.set_shuffle(on),
        ConsoleCommand::Queue => print_tracks("queue", &player.queue()),
        ConsoleCommand::History => print_tracks("history", &player.history(HISTORY_SHOWN)),
        ConsoleCommand::Remove(i) => player.remove_song(i),
        ConsoleCommand::Up(i) => {
            if !player.reorder(i, Direction::Earlier) {
                println!("cannot move {i} up");
            }
        }
        ConsoleCommand::Down(i) => {
            if !player.reorder(i, Direction::Later) {
                println!("cannot move {i} down");
            }
        }
        ConsoleCommand::Clear => player.clear_queue(false),
        ConsoleCommand::Status => println!("{}", describe(&player.status())),
        ConsoleCommand::Quit => return false,
    }
    true
}

fn print_tracks(label: &str, tracks: &[Track]) {
    println!("{label} ({} tracks)", tracks.len());
    for (i, t) in tracks.iter().enumerate() {
        println!("{i:>3}  {}  [{}:{:02}]", t.name, t.duration_secs / 60, t.duration_secs % 60);
    }
}

/// One-line summary of a status snapshot.
pub fn describe(status: &PlaybackStatus) -> String {
    let Some(track) = status.track.as_ref() else {
        return format!("stopped  vol {}%{}", status.volume, if status.muted { " (muted)" } else { "" });
    };
    let secs = status.elapsed_ms / 1000;
    let mut line = format!(
        "{} {}  {}:{:02}/{}:{:02}  vol {}%",
        if status.paused { "paused " } else { "playing" },
        track.name,
        secs / 60,
        secs % 60,
        track.duration_secs / 60,
        track.duration_secs % 60,
        status.volume,
    );
    if let Some(artist) = status.artist.as_ref() {
        line.push_str(&format!("  by {}", artist.name));
    }
    if status.muted {
        line.push_str(" (muted)");
    }
    if status.shuffle {
        line.push_str(" (shuffle)");
    }
    line
}

/// Build and start the player, then read console commands until quit, EOF or ctrl-c.
pub fn run(settings: Settings, args: &Args) -> Result<()> {
    let settings = apply_args(settings, args);
    let player = build_player(&settings, args.null_output)?;
    player.add_status_callback(|status| {
        if status.action == streamplay_types::AudioAction::TimeUpdate {
            return;
        }
        tracing::info!(action = ?status.action, "{}", describe(status));
    });
    player.start().context("start player")?;

    if let Some(Command::Play { playlist, shuffle }) = &args.cmd {
        let tracks = load_playlist(playlist)?;
        tracing::info!(count = tracks.len(), "queueing playlist");
        player.add_songs(&tracks);
        if *shuffle {
            player.set_shuffle(true);
        }
    }

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    let (line_tx, line_rx) = crossbeam_channel::unbounded::<String>();
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn console thread")?;

    loop {
        select! {
            recv(interrupt_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            recv(line_rx) -> line => {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(cmd) => {
                        if !execute(&player, cmd) {
                            break;
                        }
                    }
                    Err(e) => println!("{e:#}"),
                }
            }
        }
    }

    player.stop().context("stop player")?;
    Ok(())
}
