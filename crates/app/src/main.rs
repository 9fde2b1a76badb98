mod shell;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use loopstation_core::{
    backend_from_config, BackendKind, JsonProjectStore, LoopStation, ProjectSession, ProjectStore,
    StationConfig,
};
use tracing_subscriber::EnvFilter;

fn main() -> loopstation_core::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Devices => run_devices(&config),
        Commands::Projects => run_projects(&config),
        Commands::Run => run_shell(&config),
    }
}

fn resolve_config(cli: &Cli) -> loopstation_core::Result<StationConfig> {
    let mut config = match &cli.config {
        Some(path) => StationConfig::load(path)?,
        None => StationConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.audio.backend = backend;
    }
    if let Some(tracks) = cli.tracks {
        config.track_count = tracks;
    }
    if let Some(dir) = &cli.project_dir {
        config.project_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn run_devices(config: &StationConfig) -> loopstation_core::Result<()> {
    let backend = backend_from_config(&config.audio)?;
    for device in backend.devices()? {
        let marker = if device.is_default { "*" } else { " " };
        println!("{marker} {:?}\t{}", device.role, device.name);
    }
    Ok(())
}

fn run_projects(config: &StationConfig) -> loopstation_core::Result<()> {
    let store = JsonProjectStore::open(config.resolved_project_dir()?)?;
    let projects = store.list_projects()?;
    if projects.is_empty() {
        println!("No saved projects found!");
    }
    for project in projects {
        println!("{:>4}  {project}", project.id);
    }
    Ok(())
}

fn run_shell(config: &StationConfig) -> loopstation_core::Result<()> {
    let backend = backend_from_config(&config.audio)?;
    let project_dir = config.resolved_project_dir()?;
    tracing::info!(
        backend = backend.name(),
        tracks = config.track_count,
        projects = %project_dir.display(),
        "starting loop station"
    );

    let station = LoopStation::new(backend, config.track_count)?;
    let store = JsonProjectStore::open(project_dir)?;
    let mut session = ProjectSession::new(station, store);

    let stdin = std::io::stdin();
    shell::run(&mut session, stdin.lock(), std::io::stdout())?;

    session.station_mut().shutdown();
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-track live loop station", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Audio backend to open devices on (cpal or memory).
    #[arg(short, long, global = true)]
    backend: Option<BackendKind>,
    /// Number of tracks in the station.
    #[arg(short, long, global = true)]
    tracks: Option<usize>,
    /// Directory projects are saved to.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the audio devices of the selected backend.
    Devices,
    /// List saved projects, most recently modified first.
    Projects,
    /// Start the station and read commands from stdin.
    Run,
}
