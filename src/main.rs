use clap::{Parser, Subcommand, ValueEnum};
use commerce_autopilot::config::Config;
use commerce_autopilot::modules::{register_modules, Adapters};
use commerce_autopilot::state::AppState;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Commerce autopilot - guarded automation for marketplace price and stock writes
#[derive(Parser, Debug)]
#[command(name = "commerce-autopilot", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the state directory from the configuration
    #[arg(short, long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Schedule the configured modules and run until interrupted
    Run {
        /// Seconds between status log lines
        #[arg(long, default_value_t = 300)]
        status_interval: u64,
    },
    /// Print autonomy, kill switch, lane, job and health status as JSON
    Status,
    /// Clear a tripped pricing kill switch
    ResetKillSwitch,
    /// Override or reset the autonomy gate
    Autonomy {
        #[arg(value_enum)]
        mode: AutonomyMode,
    },
    /// List persisted job definitions
    Jobs,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AutonomyMode {
    /// Force autonomous execution on
    On,
    /// Force autonomous execution off
    Off,
    /// Drop the manual override, follow the score
    Auto,
    /// Zero the score and clear history
    Reset,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(dir) = &args.state_dir {
        config.state_dir = dir.clone();
    }
    Ok(config)
}

async fn run(state: AppState, status_interval: u64) -> Result<(), Box<dyn std::error::Error>> {
    let adapters = Adapters::from_config(&state.config)?;
    let registered = register_modules(&state, &adapters)?;
    let scheduled = state.agent.start()?;
    info!(registered, scheduled, "agent loop running");

    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let drained = state.lane.drain();
                info!(drained, "shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                let status = state.gate.status();
                let lane = state.lane.stats();
                let totals = state.agent.metrics().totals();
                info!(
                    autonomous = status.autonomous,
                    net_score = status.net_score,
                    kill_switch = state.kill_switch.is_active(),
                    queue = lane.queue_length,
                    runs = totals.runs_total,
                    failed = totals.runs_failed,
                    "status"
                );
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let state = AppState::open(config)?;

    match args.command {
        Command::Run { status_interval } => {
            info!(state_dir = %state.config.state_dir.display(), "commerce autopilot starting");
            run(state, status_interval).await?;
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&state.status())?);
        }
        Command::ResetKillSwitch => {
            let before = state.kill_switch.state();
            state.pricing.reset_kill_switch()?;
            match before.reason {
                Some(reason) if before.active => println!("kill switch reset (was: {})", reason),
                _ => println!("kill switch was not active"),
            }
        }
        Command::Autonomy { mode } => {
            match mode {
                AutonomyMode::On => state.gate.set_autonomous_mode(true)?,
                AutonomyMode::Off => state.gate.set_autonomous_mode(false)?,
                AutonomyMode::Auto => state.gate.clear_override()?,
                AutonomyMode::Reset => state.gate.reset()?,
            }
            println!("{}", serde_json::to_string_pretty(&state.gate.status())?);
        }
        Command::Jobs => {
            let jobs = state.scheduler.load_definitions()?;
            if jobs.is_empty() {
                println!("no persisted jobs");
            }
            for job in jobs {
                println!("{:<20} {:<16} {}", job.name, job.cron_expression, job.message);
            }
        }
    }

    Ok(())
}
