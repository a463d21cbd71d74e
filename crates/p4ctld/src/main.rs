//! p4ctld daemon entry point.
//!
//! Parses the command line, validates startup artifacts, wires the
//! transport, and runs the controller lifecycle until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use p4ctl_common::{ElectionId, PipelineDescriptor};
use p4ctld::config::{self, DaemonConfig, ThresholdRule};
use p4ctld::controller::{Controller, RunSummary};
use p4ctld::emulated::{EmulatedSwitch, EmulatedTransport};

#[derive(Debug, Parser)]
#[command(name = "p4ctld", about = "P4Runtime-style control-plane session manager")]
struct Args {
    /// Pipeline descriptor produced by the compiler.
    #[arg(long, default_value = "build/ecn.p4info.json")]
    p4info: PathBuf,

    /// Compiled forwarding-program artifact.
    #[arg(long = "bmv2-json", default_value = "build/ecn.json")]
    bmv2_json: PathBuf,

    /// Queue-depth threshold installed as the config table's default
    /// action.
    #[arg(long, default_value_t = config::DEFAULT_THRESHOLD)]
    threshold: u64,

    /// Device inventory file; defaults to the built-in s1..s3
    /// topology.
    #[arg(long)]
    devices: Option<PathBuf>,

    /// Bound in seconds on each individual device wait.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Directory for per-device request logs.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Low word of the mastership election id.
    #[arg(long, default_value_t = 1)]
    election_id: u64,
}

/// Initialize tracing/logging.
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

async fn run(args: Args) -> anyhow::Result<RunSummary> {
    let config = DaemonConfig {
        p4info_path: args.p4info,
        artifact_path: args.bmv2_json,
        devices_path: args.devices,
        threshold: args.threshold,
        threshold_rule: ThresholdRule::default(),
        request_timeout: Duration::from_secs(args.timeout_secs),
        election_id: ElectionId::new(0, args.election_id),
        log_dir: Some(args.log_dir),
    };
    config.validate()?;

    let descriptor = Arc::new(PipelineDescriptor::load(&config.p4info_path)?);
    let artifact = config::read_artifact(&config.artifact_path)?;
    let devices = config.devices()?;
    let batches = config::build_batches(&config, &devices, &descriptor)?;
    info!(devices = devices.len(), "Startup artifacts loaded");

    // The emulated transport stands in for the gRPC client layer; a
    // production build registers a tonic-backed transport here.
    let transport = EmulatedTransport::new();
    for device in &devices {
        transport.add_switch(device.address.clone(), EmulatedSwitch::new(device.device_id));
    }

    let identities = devices.iter().map(|d| d.identity()).collect();
    let mut controller = Controller::new(
        Arc::new(transport),
        descriptor,
        artifact,
        identities,
        batches,
        config.election_id,
    )
    .with_request_timeout(config.request_timeout);
    if let Some(log_dir) = &config.log_dir {
        controller = controller.with_log_dir(log_dir);
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt; shutting down");
            trigger.cancel();
        }
    });

    Ok(controller.run(shutdown).await)
}

fn report(summary: &RunSummary) {
    for device in &summary.devices {
        match &device.degraded {
            Some(e) => warn!(
                device = %device.device,
                stage = device.stage_reached.as_str(),
                error = %e,
                "Device degraded"
            ),
            None => info!(
                device = %device.device,
                stage = device.stage_reached.as_str(),
                role = device.role.as_str(),
                "Device finished"
            ),
        }
        for failure in &device.install_failures {
            warn!(device = %device.device, error = %failure, "Entry rejected");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    info!("--- Starting p4ctld ---");

    let args = Args::parse();
    match run(args).await {
        Ok(summary) => {
            report(&summary);
            if summary.succeeded() {
                info!("p4ctld exiting normally");
                ExitCode::SUCCESS
            } else {
                error!("No device completed rule installation");
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "p4ctld startup failed");
            ExitCode::FAILURE
        }
    }
}
