//! Bridge role.

use std::time::Duration;

use anyhow::{bail, Result};
use bridge_ipc::{BridgeConnection, LaunchOptions};
use tracing::{debug, info, warn};

use crate::Action;

pub async fn run(pipe_id: &str, action: Action, project: Option<&str>, seconds: u64) -> Result<()> {
    info!("Bridge peer started ({:?})", action);
    let options = LaunchOptions::new().with("-pipeID", pipe_id);

    let mut conn = match BridgeConnection::init(&options).await {
        Ok(conn) => conn,
        Err(e) if e.is_already_running() => bail!("A bridge is already running for this session"),
        Err(e) => return Err(e.into()),
    };
    if !conn.is_connected() {
        warn!("Application is not listening; running standalone");
    }

    // Notification failures are not fatal; the application may be gone.
    match action {
        Action::SendReceive => {
            simulate_work("S/R", seconds).await;
            report("workComplete", conn.signal_work_complete(true).await);
        }
        Action::SendReceiveLift => {
            simulate_work("S/RL", seconds).await;
        }
        Action::Obtain | Action::ObtainLift => {
            let sent = match project {
                Some(path) => conn.send_project_name(Some(path)).await,
                None => conn.tell_no_new_project().await,
            };
            report("setProjectName", sent);
            report("workComplete", conn.signal_work_complete(project.is_some()).await);
        }
        Action::AboutFlexBridge
        | Action::ViewNotes
        | Action::ViewNotesLift
        | Action::CheckForUpdates
        | Action::UndoExportLift
        | Action::MoveLift => {}
    }

    info!("Bridge peer closing its connections");
    conn.close();
    Ok(())
}

fn report(operation: &str, result: bridge_ipc::Result<()>) {
    if let Err(e) = result {
        debug!("{} not delivered: {}", operation, e);
    }
}

async fn simulate_work(label: &str, seconds: u64) {
    for step in 1..=seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        info!("{}... ({}/{})", label, step, seconds);
    }
}
