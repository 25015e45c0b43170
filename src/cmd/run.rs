//! In-process pipeline run (`testforge run <url>`).

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;

use testforge::config::Config;
use testforge::pipeline::models::{RunRequest, RunStatus};
use testforge::pipeline::runner::spawn_instance_heartbeat;
use testforge::pipeline::server::{build_runner, open_database};
use testforge::pipeline::ws::WsMessage;
use testforge::ui::RunProgressUI;

use crate::RunArgs;

/// Exit code for a run cancelled with Ctrl+C.
const CANCELLED_EXIT_CODE: i32 = 130;

fn request(args: &RunArgs) -> RunRequest {
    RunRequest {
        url: args.url.clone(),
        mode: Some(args.mode.clone()),
        story: args.story.clone(),
        preset: args.preset.clone(),
        browser_visibility: Some(if args.headed { "headed" } else { "headless" }.to_string()),
        auto_heal: Some(!args.no_heal),
        max_heal_attempts: args.max_heal_attempts,
        scenario: args.scenario.clone(),
    }
}

/// Run one pipeline to completion and return the process exit code.
pub async fn cmd_run(config: &Config, args: &RunArgs) -> Result<i32> {
    let db = open_database(config)?;
    let heartbeat = spawn_instance_heartbeat(db.clone(), config.runner_settings().lease, false);
    let runner = build_runner(config, db)?;
    let run = runner.start(&request(args)).await?;
    let run_id = run.id;
    let mut ui = RunProgressUI::new(&run);

    if let Some(mut rx) = runner.hub().subscribe(run_id) {
        let mut finished = ui.apply_message(&WsMessage::Snapshot {
            run: runner.snapshot(run_id).await?,
        });
        let mut cancel_requested = false;
        while !finished {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Ok(text) => finished = ui.apply(&text),
                    Err(RecvError::Lagged(_)) => {
                        let run = runner.snapshot(run_id).await?;
                        finished = ui.apply_message(&WsMessage::Snapshot { run });
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                    cancel_requested = true;
                    eprintln!("Cancelling run {}...", run_id);
                    // The run may finish on its own before the request lands.
                    if let Err(e) = runner.cancel(run_id).await {
                        tracing::debug!(run_id = %run_id, error = %e, "Cancel request ignored");
                    }
                }
            }
        }
    }

    let run = runner.wait(run_id).await?;
    heartbeat.abort();
    Ok(match run.status {
        RunStatus::Cancelled => CANCELLED_EXIT_CODE,
        _ => run.exit_code.unwrap_or(1),
    })
}
