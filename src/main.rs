//! Lane scheduler CLI.
//!
//! `run` executes one lane's scheduler in the foreground; `supervise` runs
//! the heartbeat supervisor for one lane; `start`/`stop`/`status` manage
//! supervisors across lanes; `init` scaffolds a config; `validate` checks
//! config and task files without running anything.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};

use lanekeeper::core::task::Owner;
use lanekeeper::exit_codes;
use lanekeeper::io::agent::CliAgentRunner;
use lanekeeper::io::config::{
    Defaults, LaneConfig, LanePaths, LanesFile, load_lanes, write_lanes,
};
use lanekeeper::io::store::load_tasks;
use lanekeeper::io::validate::CommandValidator;
use lanekeeper::logging;
use lanekeeper::manager;
use lanekeeper::scheduler::{RunEnd, Scheduler};
use lanekeeper::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "lanekeeper",
    version,
    about = "Lane-based scheduler driving task queues through coding-agent CLIs"
)]
struct Cli {
    /// Path to the lanes configuration file.
    #[arg(long, global = true, default_value = "lanes.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold a lanes.toml and an example task file.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check the config and every lane's task file without running anything.
    Validate,
    /// Run one lane's scheduler in the foreground until it finishes.
    Run {
        /// Lane id from the config file.
        #[arg(long)]
        lane: String,
    },
    /// Supervise one lane's scheduler, restarting it on crash or stale heartbeat.
    Supervise {
        /// Lane id from the config file.
        #[arg(long)]
        lane: String,
    },
    /// Start detached supervisors for lanes (all lanes when none named).
    Start {
        /// Lane ids to start; repeatable.
        #[arg(long = "lane")]
        lanes: Vec<String>,
        /// Clear a fresh pause marker instead of refusing.
        #[arg(short, long)]
        force: bool,
    },
    /// Pause lanes and terminate their supervisors and schedulers.
    Stop {
        /// Lane ids to stop; repeatable.
        #[arg(long = "lane")]
        lanes: Vec<String>,
    },
    /// Report each lane's processes, heartbeat, and task counts as JSON.
    Status {
        /// Lane ids to report; repeatable.
        #[arg(long = "lane")]
        lanes: Vec<String>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => {
            cmd_init(&cli.config, force)?;
            Ok(exit_codes::OK)
        }
        Command::Validate => {
            cmd_validate(&cli.config)?;
            Ok(exit_codes::OK)
        }
        Command::Run { lane } => cmd_run(&cli.config, &lane),
        Command::Supervise { lane } => cmd_supervise(&cli.config, &lane),
        Command::Start { lanes, force } => {
            let file = load_lanes(&cli.config)?;
            manager::start(&file, &cli.config, &lanes, force)?;
            Ok(exit_codes::OK)
        }
        Command::Stop { lanes } => {
            let file = load_lanes(&cli.config)?;
            manager::stop(&file, &lanes)?;
            Ok(exit_codes::OK)
        }
        Command::Status { lanes } => {
            let file = load_lanes(&cli.config)?;
            let statuses = manager::status(&file, &lanes, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            config_path.display()
        );
    }
    let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let lane = LaneConfig {
        id: "impl".to_string(),
        owner: Owner::Claude,
        dir: base.join("lanes/impl"),
        repo: base.clone(),
        planning_repo: None,
        tasks_file: None,
    };
    let paths = LanePaths::new(&lane);
    let file = LanesFile {
        defaults: Defaults::default(),
        lanes: vec![lane],
    };
    write_lanes(config_path, &file)?;

    if force || !paths.tasks_path.exists() {
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create lane directory {}", paths.dir.display()))?;
        fs::write(&paths.tasks_path, EXAMPLE_TASKS)
            .with_context(|| format!("write {}", paths.tasks_path.display()))?;
    }
    println!("wrote {}", config_path.display());
    println!("wrote {}", paths.tasks_path.display());
    Ok(())
}

const EXAMPLE_TASKS: &str = r#"[
  {
    "id": "example-1",
    "owner": "claude",
    "priority": 1,
    "title": "Replace me with a real task",
    "description": "Describe the work and how to verify it.",
    "acceptance": ["cargo test passes"]
  }
]
"#;

fn cmd_validate(config_path: &Path) -> Result<()> {
    let file = load_lanes(config_path)?;
    for lane in &file.lanes {
        let paths = LanePaths::new(lane);
        let tasks = load_tasks(&paths.tasks_path)
            .with_context(|| format!("lane '{}'", lane.id))?;
        println!("lane '{}': {} tasks ok", lane.id, tasks.len());
    }
    println!("{} ok", config_path.display());
    Ok(())
}

fn cmd_run(config_path: &Path, lane_id: &str) -> Result<i32> {
    let file = load_lanes(config_path)?;
    let lane = file.lane(lane_id)?;
    let defaults = &file.defaults;
    let validator = CommandValidator::new(
        defaults.validation.clone(),
        std::time::Duration::from_secs(defaults.validation_timeout_secs),
        defaults.output_limit_bytes,
        std::time::Duration::from_secs(defaults.heartbeat_tick_secs),
    );
    let runner = CliAgentRunner;
    let scheduler = Scheduler::new(lane, defaults, &runner, &validator);
    let end = scheduler.run()?;
    Ok(match end {
        RunEnd::AllDone => exit_codes::OK,
        RunEnd::Stalled => exit_codes::STALLED,
        RunEnd::MaxCycles => exit_codes::MAX_CYCLES,
    })
}

fn cmd_supervise(config_path: &Path, lane_id: &str) -> Result<i32> {
    let file = load_lanes(config_path)?;
    let lane = file.lane(lane_id)?;
    let supervisor = Supervisor::new(lane, &file.defaults, config_path);
    supervisor.supervise()
}
