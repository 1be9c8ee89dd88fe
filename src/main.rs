use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use filmeto_pipeline::config::PipelineConfig;
use filmeto_pipeline::project::{Project, ProjectEvent};
use filmeto_pipeline::task::{TaskEvent, TaskOptions};

const REPORTER_DRAIN: Duration = Duration::from_secs(5);

/// Install the subscriber. The returned guard flushes the log file on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("FILMETO_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "filmeto-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

/// Finished tasks go to stdout as one JSON object per line.
fn report(ev: &ProjectEvent) {
    match &ev.event {
        TaskEvent::Created(task) => {
            tracing::debug!(item = ev.item, task_id = %task.id(), "Task created");
        }
        TaskEvent::Progress { task_id, snapshot } => {
            tracing::info!(
                item = ev.item,
                task_id = %task_id,
                percent = snapshot.percent,
                "{}",
                snapshot.log
            );
        }
        TaskEvent::Finished(result) => {
            let line = json!({
                "item": ev.item,
                "task_id": result.task.id(),
                "status": if result.result.is_success() { "success" } else { "error" },
                "image_path": result.image_path().map(|p| p.display().to_string()),
                "video_path": result.video_path().map(|p| p.display().to_string()),
                "error": result.result.error(),
            });
            println!("{line}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = init_tracing();

    let Some(project_dir) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("Usage: filmeto-pipeline <project_dir>");
        eprintln!("  Reads one JSON task-options object per stdin line, e.g.");
        eprintln!("  {{\"tool\": \"text2img\", \"prompt\": \"a lighthouse at dusk\"}}");
        std::process::exit(2);
    };

    let config = PipelineConfig::from_env()?;

    eprintln!("Filmeto pipeline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Project: {}", project_dir.display());
    eprintln!("   Backend: {}", config.comfyui.base_url);
    eprintln!("   Workflows: {}", config.workflows_dir.display());

    let project = Project::open(&project_dir, &config).await;
    project.start().await?;

    let mut events = project.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => report(&ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event reporter lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TaskOptions>(line) {
                    Ok(options) => {
                        if let Err(e) = project.submit_task(options).await {
                            tracing::error!(error = %e, "Failed to submit task");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring line that is not a JSON object"),
                }
            }
            Ok(None) => break, // EOF
            Err(e) => {
                tracing::error!("Error reading stdin: {}", e);
                break;
            }
        }
    }

    project.join().await;
    project.stop().await;
    // Dropping the project closes every event channel, so the reporter
    // drains what is left and exits on its own.
    drop(project);
    if tokio::time::timeout(REPORTER_DRAIN, reporter).await.is_err() {
        tracing::warn!(?REPORTER_DRAIN, "Event reporter did not finish, exiting anyway");
    }
    Ok(())
}
