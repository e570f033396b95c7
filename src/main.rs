use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stepguide::browser::{BrowserSession, ChromeHost};
use stepguide::config::{Cli, Command, RunArgs};
use stepguide::coordinator::Coordinator;
use stepguide::engine::EngineLinks;
use stepguide::panel::{self, Controls, PanelState};
use stepguide::sink::ProgressSink;
use stepguide::{JsonFileStore, ProgressStore, SettingsStore, TaskCatalog};

struct Stores {
    catalog: Arc<TaskCatalog>,
    progress: Arc<dyn ProgressStore>,
    settings: Arc<SettingsStore>,
}

impl Stores {
    fn controls(&self) -> Controls {
        Controls::new(self.progress.clone(), self.settings.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepguide=info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.common.data_dir();
    let stores = Stores {
        catalog: Arc::new(TaskCatalog::from_path(&cli.common.catalog)),
        progress: Arc::new(JsonFileStore::in_dir(&data_dir)),
        settings: Arc::new(SettingsStore::in_dir(&data_dir)),
    };

    match cli.command {
        Command::Run(args) => run(args, data_dir, stores).await,
        Command::Tasks => {
            let tasks = stores.catalog.tasks().await?;
            for task in tasks {
                let done = stores.settings.is_completed(&task.id).await?;
                println!(
                    "{:<20} {:<40} {:>2} steps{}",
                    task.id,
                    task.title,
                    task.total_steps(),
                    if done { "  (completed)" } else { "" }
                );
            }
            Ok(())
        }
        Command::Status => status(&stores).await,
        Command::Select { task_id } => {
            if stores.catalog.get(&task_id).await?.is_none() {
                bail!("unknown task '{}'", task_id);
            }
            stores.controls().select(&task_id).await?;
            println!("Selected '{}' at step 1.", task_id);
            Ok(())
        }
        Command::Reset => {
            match stores.controls().reset().await? {
                Some(task_id) => println!("Reset '{}' to step 1.", task_id),
                None => println!("No active task."),
            }
            Ok(())
        }
        Command::Clear => {
            stores.controls().clear().await?;
            println!("Cleared the active task.");
            Ok(())
        }
    }
}

async fn status(stores: &Stores) -> Result<()> {
    let state = stores.progress.load().await?;
    let Some(task_id) = state.active_task_id else {
        println!("No active task.");
        return Ok(());
    };
    let Some(task) = stores.catalog.get(&task_id).await? else {
        println!("Active task '{}' is not in the catalog.", task_id);
        return Ok(());
    };
    println!("{} ({})", task.title, task_id);
    match task.step(state.step_index) {
        Some(step) => println!(
            "Step {}/{}: {}",
            state.step_index + 1,
            task.total_steps(),
            step.instruction
        ),
        None => println!("All {} steps done.", task.total_steps()),
    }
    if let Some(url) = &task.start_url {
        println!("Runs on pages under {}", url);
    }
    Ok(())
}

async fn run(args: RunArgs, data_dir: PathBuf, stores: Stores) -> Result<()> {
    info!(data_dir = %data_dir.display(), "starting");

    let (notices, _) = broadcast::channel(64);
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (navigation_tx, navigation_rx) = mpsc::channel(32);
    let (request_tx, request_rx) = mpsc::channel(32);

    // Chrome can take a while to come up
    let options = args.browser_options(&data_dir);
    let session = tokio::task::spawn_blocking(move || BrowserSession::launch(&options))
        .await
        .context("browser launch panicked")??;

    let links = EngineLinks {
        store: stores.progress.clone(),
        progress: progress_tx,
        notices: notices.clone(),
    };
    let host = Arc::new(ChromeHost::new(session.tab.clone(), links, args.engine_config())?);

    let coordinator = Coordinator::new(
        host.clone(),
        stores.progress.clone(),
        stores.settings.clone(),
        stores.catalog.clone(),
        notices.clone(),
    )
    .with_sink(ProgressSink::new(), args.sink_overrides());

    let panel_state = PanelState {
        requests: request_tx,
        notices,
        store: stores.progress.clone(),
        catalog: stores.catalog.clone(),
        host: host.clone(),
        controls: stores.controls(),
    };
    let completion = panel::spawn_completion_watch(panel_state.clone());
    panel::serve(panel_state, args.port)
        .await
        .context("starting the panel")?;

    let watcher = host.clone().watch_navigation(navigation_tx, args.poll_interval());

    tokio::select! {
        _ = coordinator.run(navigation_rx, progress_rx, request_rx) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }

    watcher.abort();
    completion.abort();
    drop(session);
    Ok(())
}
