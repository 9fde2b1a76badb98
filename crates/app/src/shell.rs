//! Line-oriented front end driving a [`ProjectSession`].

use std::io::{BufRead, Write};

use loopstation_core::{
    PlayAllOutcome, ProjectId, ProjectSession, ProjectStore, RecordingOutcome,
};

const HELP: &str = "\
commands:
  record                start recording onto the first free track
  stop                  stop recording
  play [n]              play track n, or every track
  pause [n]             stop track n, or every track
  playall               toggle play all / stop all
  stopall               stop every track
  volume <n> <0..1>     set the volume of track n
  mute <n> | unmute <n> mute or unmute track n
  clear <n>             clear track n
  clearall              clear every track (asks first)
  save <name>           save the project
  load <id>             load a saved project
  list                  list saved projects
  status                show the tracks
  help                  show this text
  quit                  leave";

#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Record,
    Stop,
    Play(Option<usize>),
    Pause(Option<usize>),
    TogglePlayAll,
    Volume(usize, f32),
    Mute(usize, bool),
    Clear(usize),
    ClearAll,
    Save(String),
    Load(ProjectId),
    List,
    Status,
    Help,
    Quit,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_ascii_lowercase();
        let rest: Vec<&str> = words.collect();

        let parsed = match (command.as_str(), rest.as_slice()) {
            ("record" | "rec", []) => Self::Record,
            ("stop", []) => Self::Stop,
            ("play", []) => Self::Play(None),
            ("play", [n]) => Self::Play(Some(track_number(n)?)),
            ("pause", []) => Self::Pause(None),
            ("pause", [n]) => Self::Pause(Some(track_number(n)?)),
            ("stopall", []) => Self::Pause(None),
            ("playall", []) => Self::TogglePlayAll,
            ("volume" | "vol", [n, v]) => {
                let volume = v
                    .parse::<f32>()
                    .map_err(|_| format!("`{v}` is not a volume"))?;
                Self::Volume(track_number(n)?, volume)
            }
            ("mute", [n]) => Self::Mute(track_number(n)?, true),
            ("unmute", [n]) => Self::Mute(track_number(n)?, false),
            ("clear", [n]) => Self::Clear(track_number(n)?),
            ("clearall", []) => Self::ClearAll,
            ("save", [_, ..]) => Self::Save(rest.join(" ")),
            ("load", [id]) => Self::Load(
                id.parse()
                    .map_err(|_| format!("`{id}` is not a project id"))?,
            ),
            ("list", []) => Self::List,
            ("status", []) => Self::Status,
            ("help" | "?", []) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            ("", _) => return Err(String::new()),
            _ => return Err(format!("unrecognised command `{}`, try `help`", line.trim())),
        };
        Ok(parsed)
    }
}

fn track_number(text: &str) -> Result<usize, String> {
    text.parse()
        .map_err(|_| format!("`{text}` is not a track number"))
}

/// Reads commands until `quit` or end of input.
///
/// Expected conditions (full station, nothing to play, ...) are printed as
/// status lines; only failures writing to `output` end the loop early.
pub fn run<S, R, W>(
    session: &mut ProjectSession<S>,
    mut input: R,
    mut output: W,
) -> loopstation_core::Result<()>
where
    S: ProjectStore,
    R: BufRead,
    W: Write,
{
    writeln!(
        output,
        "Loop station ready, {} tracks. Type `help`.",
        session.station().track_count()
    )?;

    let mut line = String::new();
    loop {
        write!(output, "> ")?;
        output.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }

        let command = match ShellCommand::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                if !message.is_empty() {
                    writeln!(output, "{message}")?;
                }
                continue;
            }
        };

        if command == ShellCommand::Quit {
            break;
        }
        if command == ShellCommand::ClearAll && !confirm(&mut input, &mut output)? {
            writeln!(output, "Nothing cleared.")?;
            continue;
        }

        match execute(session, command) {
            Ok(message) => writeln!(output, "{message}")?,
            Err(err) if err.is_status() => writeln!(output, "{err}")?,
            Err(err) => {
                tracing::error!(error = %err, "command failed");
                writeln!(output, "Error: {err}")?;
            }
        }
    }
    Ok(())
}

fn confirm<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
) -> loopstation_core::Result<bool> {
    write!(output, "This will delete all recorded loops. Are you sure? [y/N] ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn execute<S: ProjectStore>(
    session: &mut ProjectSession<S>,
    command: ShellCommand,
) -> loopstation_core::Result<String> {
    let station = session.station_mut();
    let message = match command {
        ShellCommand::Record => {
            let track = station.start_recording()?;
            format!("Recording to Track {track}...")
        }
        ShellCommand::Stop => match station.stop_recording()? {
            RecordingOutcome::Stored { track, bytes } => {
                format!("Recording saved to Track {track} ({bytes} bytes)")
            }
            RecordingOutcome::Empty => "Nothing was recorded.".to_string(),
            RecordingOutcome::NotRecording => "Not recording.".to_string(),
        },
        ShellCommand::Play(Some(n)) => {
            station.play_track(n)?;
            format!("Track {n} playing")
        }
        ShellCommand::Play(None) => describe_play_all(&station.play_all()?),
        ShellCommand::Pause(Some(n)) => {
            station.stop_track(n)?;
            format!("Track {n} stopped")
        }
        ShellCommand::Pause(None) => {
            station.stop_all()?;
            "All tracks stopped".to_string()
        }
        ShellCommand::TogglePlayAll => match station.toggle_play_all()? {
            Some(outcome) => describe_play_all(&outcome),
            None => "All tracks stopped".to_string(),
        },
        ShellCommand::Volume(n, volume) => {
            station.set_track_volume(n, volume)?;
            format!("Track {n} volume {:.0}%", station.track(n)?.volume() * 100.0)
        }
        ShellCommand::Mute(n, muted) => {
            station.set_track_muted(n, muted)?;
            format!("Track {n} {}", if muted { "muted" } else { "unmuted" })
        }
        ShellCommand::Clear(n) => {
            station.clear_track(n)?;
            format!("Track {n} cleared")
        }
        ShellCommand::ClearAll => {
            session.clear_all();
            "All tracks cleared".to_string()
        }
        ShellCommand::Save(name) => {
            session.save(&name)?;
            format!("Project '{}' saved successfully!", name.trim())
        }
        ShellCommand::Load(id) => {
            let info = session.load(id)?;
            format!("Project '{}' loaded successfully!", info.name)
        }
        ShellCommand::List => {
            let projects = session.list()?;
            if projects.is_empty() {
                "No saved projects found!".to_string()
            } else {
                projects
                    .iter()
                    .map(|p| format!("{:>4}  {p}", p.id))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        ShellCommand::Status => status(session),
        ShellCommand::Help => HELP.to_string(),
        ShellCommand::Quit => String::new(),
    };
    Ok(message)
}

fn describe_play_all(outcome: &PlayAllOutcome) -> String {
    let mut lines = Vec::new();
    if !outcome.playing.is_empty() {
        lines.push(format!("Playing tracks {:?}", outcome.playing));
    }
    for (track, err) in &outcome.failed {
        lines.push(format!("Track {track} could not start: {err}"));
    }
    lines.join("\n")
}

fn status<S: ProjectStore>(session: &ProjectSession<S>) -> String {
    let station = session.station();
    let mut lines = Vec::new();
    if let Some(project) = session.current_project() {
        lines.push(format!("Project: {} (#{})", project.name, project.id));
    }
    if let Some(track) = station.recording_target() {
        lines.push(format!("Recording to Track {track}"));
    }
    for track in station.tracks() {
        let state = match (track.has_audio(), track.is_playing()) {
            (false, _) => "empty".to_string(),
            (true, playing) => format!(
                "{:.2}s {}{} vol {:.0}%",
                track.duration().as_secs_f32(),
                if playing { "playing" } else { "stopped" },
                if track.is_muted() { " muted" } else { "" },
                track.volume() * 100.0
            ),
        };
        lines.push(format!("Track {}: {state}", track.number()));
    }
    lines.join("\n")
}
