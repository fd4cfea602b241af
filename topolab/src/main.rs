use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::{builder::PossibleValuesParser, Parser};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tracing_subscriber::EnvFilter;

use topolab_sim::{
    console,
    scenario::Scenario,
    shutdown::{listen_for_signals, Shutdown},
    Backend, Emulation, EmulationConfig, Error, LinuxBackend, Params, RecordingBackend, ScenarioRegistry,
    BUILTIN_SCENARIOS,
};

#[derive(Parser, Debug)]
#[command(name = "topolab", version, about = "Run a virtual network topology in Linux namespaces")]
struct Cli {
    /// Scenario to run
    #[arg(long, value_parser = PossibleValuesParser::new(BUILTIN_SCENARIOS))]
    config: String,

    /// Link loss percentage on the s1-s2 backbone (required for scenario d)
    #[arg(long)]
    loss: Option<f64>,

    /// Record the commands instead of running them, then print them
    #[arg(long)]
    dry_run: bool,

    /// Prefix every command with sudo
    #[arg(long)]
    sudo: bool,

    /// Terminal program, with optional arguments, launched inside nodes
    #[arg(long, env = "TOPOLAB_TERMINAL", default_value = "xterm")]
    terminal: String,

    /// Don't launch the scenario's terminals
    #[arg(long)]
    no_terminals: bool,
}

impl Cli {
    fn emulation_config(&self) -> EmulationConfig {
        EmulationConfig {
            terminal: self.terminal.split_whitespace().map(str::to_string).collect(),
            launch_terminals: !self.no_terminals,
            sudo: self.sudo,
            ..Default::default()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to initialize tokio: {e}");
            return ExitCode::from(2);
        }
    };

    let result = rt.block_on(run(cli));

    // A pending stdin read never completes on its own.
    rt.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let scenario = ScenarioRegistry::builtin().select(&cli.config, &Params { loss: cli.loss })?;
    let config = cli.emulation_config();

    if cli.dry_run {
        return dry_run(scenario, config).await;
    }

    let backend = Arc::new(LinuxBackend::new(cli.sudo));
    if !backend.is_privileged() {
        tracing::warn!("not running as root and --sudo not given, host commands will likely fail");
    }

    // Installed before anything touches the host, so an early signal still tears down.
    let shutdown = Shutdown::new();
    let signals = match listen_for_signals(shutdown.clone()) {
        Ok(listener) => Some(tokio::spawn(listener)),
        Err(e) => {
            tracing::warn!(%e, "failed to install signal handlers");
            None
        }
    };

    let mut emulation = Emulation::new(backend, config);
    let result = session(
        &mut emulation,
        scenario,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        &shutdown,
    )
    .await;

    shutdown.trigger();
    if let Some(signals) = signals {
        if let Err(e) = signals.await {
            tracing::warn!(%e, "signal listener crashed");
        }
    }

    emulation.teardown().await;
    result
}

/// Starts `scenario` and hands it to the console, unless `shutdown` fires first.
async fn session<B, R, W>(
    emulation: &mut Emulation<B>,
    scenario: Scenario,
    input: R,
    output: W,
    shutdown: &Shutdown,
) -> Result<(), Error>
where
    B: Backend,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    emulation.load(scenario)?;
    if !emulation.start_until(shutdown).await? {
        tracing::warn!("interrupted while starting, tearing down");
        return Ok(());
    }

    emulation.enter_interactive()?;
    println!("topology '{}' is up, type 'help' for commands", emulation.scenario());
    console::run(emulation, input, output, shutdown).await
}

/// Runs the whole lifecycle against the recording backend and prints what would have run.
async fn dry_run(scenario: Scenario, config: EmulationConfig) -> Result<(), Error> {
    let backend = Arc::new(RecordingBackend::new());
    let mut emulation = Emulation::new(Arc::clone(&backend), config);
    emulation.load(scenario)?;

    let result = emulation.start().await;
    emulation.teardown().await;

    for cmd in backend.commands() {
        println!("{cmd}");
    }
    for cmd in backend.spawned() {
        println!("{cmd} &");
    }

    result
}
