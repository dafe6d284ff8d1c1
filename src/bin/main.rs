//! Process entry point: parse arguments, load configuration, install the
//! tracing subscriber, and run the orchestrator until interrupted.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netslice_ctrl::config::Config;
use netslice_ctrl::orchestrator::{NullStatsTransport, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "netslice-ctrl", about = "Adaptive per-flow QoS control plane")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_FILE", default_value = "configs/default.yml")]
    config: std::path::PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(flows = config.flows.len(), "configuration loaded");

    // The OpenFlow transport is an external collaborator this crate does not
    // implement; running standalone wires in a stub that only logs requests.
    let (_tx, rx) = mpsc::channel();
    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(NullStatsTransport)));

    let active = Arc::new(AtomicBool::new(true));

    {
        let active = Arc::clone(&active);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown signal received");
            active.store(false, std::sync::atomic::Ordering::SeqCst);
        }) {
            error!(error = %e, "failed to install signal handler");
            return ExitCode::FAILURE;
        }
    }

    let mut handles = orchestrator.spawn_loops(Arc::clone(&active));

    {
        let orchestrator = Arc::clone(&orchestrator);
        let active = Arc::clone(&active);
        handles.push(std::thread::spawn(move || {
            orchestrator.dispatch_events(rx, active);
        }));
    }

    // Shutdown is driven entirely by `active`; SIGINT/SIGTERM clear it via
    // the handler installed above, which stops every loop, after which
    // `orchestrator.shutdown()` below purges switch flow entries.
    for handle in handles {
        if handle.join().is_err() {
            error!("a control loop panicked");
        }
    }

    orchestrator.shutdown();
    ExitCode::SUCCESS
}
