use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::browser::BrowserOptions;
use crate::catalog::CATALOG_FILE;
use crate::coordinator::SinkOverrides;
use crate::engine::{DEFAULT_REVEAL_DELAY, DEFAULT_SETTLE_DELAY, EngineConfig};

pub const DEFAULT_PORT: u16 = 3000;
const APP_DIR: &str = "stepguide";
const PROFILE_DIR: &str = "chrome-profile";

#[derive(Debug, Parser)]
#[command(name = "stepguide", about = "Guides a user through web labs step by step")]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Drive Chrome, serve the panel and follow the active task
    Run(RunArgs),
    /// List the task catalog
    Tasks,
    /// Show the active task and step
    Status,
    /// Make a task active, starting at its first step
    Select { task_id: String },
    /// Restart the active task from its first step
    Reset,
    /// Forget the active task
    Clear,
}

#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    /// Task catalog (JSON, keyed by task id)
    #[arg(long, env = "STEPGUIDE_CATALOG", default_value = CATALOG_FILE, global = true)]
    pub catalog: PathBuf,
    /// Where progress and settings are kept
    #[arg(long, env = "STEPGUIDE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,
}

impl CommonArgs {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR)
        })
    }
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// DevTools endpoint of a running Chrome to attach to
    #[arg(long, env = "STEPGUIDE_CHROME_URL")]
    pub chrome_url: Option<String>,
    #[arg(long, env = "STEPGUIDE_CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,
    #[arg(long, env = "STEPGUIDE_HEADLESS")]
    pub headless: bool,
    /// First port tried for the panel
    #[arg(long, env = "STEPGUIDE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[arg(long, env = "STEPGUIDE_SETTLE_MS", default_value_t = DEFAULT_SETTLE_DELAY.as_millis() as u64)]
    pub settle_ms: u64,
    #[arg(long, env = "STEPGUIDE_REVEAL_MS", default_value_t = DEFAULT_REVEAL_DELAY.as_millis() as u64)]
    pub reveal_ms: u64,
    /// How often the tab is polled for navigations
    #[arg(long, env = "STEPGUIDE_POLL_MS", default_value_t = 250)]
    pub poll_ms: u64,
    /// Progress logging endpoint; overrides settings.json
    #[arg(long, env = "STEPGUIDE_SINK_URL")]
    pub sink_url: Option<String>,
    /// Identifier sent with progress reports; overrides settings.json
    #[arg(long, env = "STEPGUIDE_USER_ID")]
    pub user_id: Option<String>,
}

impl RunArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            settle_delay: Duration::from_millis(self.settle_ms),
            reveal_delay: Duration::from_millis(self.reveal_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(10))
    }

    pub fn sink_overrides(&self) -> SinkOverrides {
        SinkOverrides {
            url: self.sink_url.clone(),
            user_id: self.user_id.clone(),
        }
    }

    pub fn browser_options(&self, data_dir: &std::path::Path) -> BrowserOptions {
        BrowserOptions {
            debug_url: self.chrome_url.clone(),
            headless: self.headless,
            chrome_path: self.chrome_path.clone(),
            profile_dir: data_dir.join(PROFILE_DIR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_match_engine_defaults() {
        let cli = Cli::try_parse_from(["stepguide", "run"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.engine_config();
        assert_eq!(config.settle_delay, DEFAULT_SETTLE_DELAY);
        assert_eq!(config.reveal_delay, DEFAULT_REVEAL_DELAY);
        assert_eq!(args.port, DEFAULT_PORT);
    }

    #[test]
    fn data_dir_flag_wins() {
        let cli = Cli::try_parse_from(["stepguide", "status", "--data-dir", "/tmp/sg"]).unwrap();
        assert_eq!(cli.common.data_dir(), PathBuf::from("/tmp/sg"));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn select_takes_a_task_id() {
        let cli = Cli::try_parse_from(["stepguide", "select", "lab1"]).unwrap();
        assert!(matches!(cli.command, Command::Select { task_id } if task_id == "lab1"));
    }
}
