//! Bridge Peer - either side of a bridge-ipc duplex session.
//!
//! `bridge-peer app` plays the main application: it hosts the events the
//! bridge reports and prints what it got. `bridge-peer bridge` plays the
//! bridge: it announces itself, simulates the requested action, and signals
//! completion.

mod app;
mod bridge;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bridge-peer")]
#[command(about = "Demonstration peer for bridge-ipc sessions")]
struct Args {
    #[command(subcommand)]
    role: Role,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Act as the bridge launched by the application
    Bridge {
        /// Session id shared with the application
        #[arg(long, default_value = "")]
        pipe_id: String,

        /// What the bridge was asked to do
        #[arg(short = 'v', long, value_enum, default_value = "send_receive")]
        action: Action,

        /// Project path reported by obtain actions
        #[arg(short, long)]
        project: Option<String>,

        /// Seconds the simulated work takes
        #[arg(long, default_value = "5")]
        seconds: u64,
    },

    /// Act as the main application waiting on a bridge
    App {
        /// Session id to host the bridge's endpoint under
        #[arg(long)]
        pipe_id: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum Action {
    AboutFlexBridge,
    SendReceive,
    SendReceiveLift,
    Obtain,
    ObtainLift,
    ViewNotes,
    ViewNotesLift,
    CheckForUpdates,
    UndoExportLift,
    MoveLift,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.role {
        Role::Bridge {
            pipe_id,
            action,
            project,
            seconds,
        } => bridge::run(&pipe_id, action, project.as_deref(), seconds).await,
        Role::App { pipe_id } => app::run(&pipe_id).await,
    }
}
