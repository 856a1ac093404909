use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Result, eyre};
use std::collections::BTreeMap;
use std::path::PathBuf;
use suitesched::branch::FixedMilestone;
use suitesched::config::{load_task_file, tasks_from_config};
use suitesched::services::{ManifestSource, SuiteRequest, SuiteScheduler};
use suitesched::{
    Field, Filter, Journal, LabConfig, MilestoneResolver, ResolutionError, SchedulingError, SuiteArgs, SuiteSpec,
    TaskEnv, Trigger,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "suitesched")]
#[command(about = "Test-suite scheduling and result reconciliation for a device test lab")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a task file and report every rule it defines
    Validate {
        /// Task file
        #[arg(short, long)]
        config: PathBuf,

        /// Tip-of-tree milestone for `tot` branch specs
        #[arg(long)]
        tot: Option<u32>,
    },

    /// Show which suites each rule would schedule for a board's new builds
    Plan {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        board: String,

        /// New builds as BRANCH=BUILD, e.g. R33=lumpy-release/R33-4680.0.0
        #[arg(long = "build", value_parser = parse_branch_build)]
        builds: Vec<(String, String)>,

        #[arg(long)]
        tot: Option<u32>,

        /// Only plan rules attached to this event
        #[arg(long)]
        trigger: Option<Trigger>,

        /// Bypass the scheduler's duplicate check
        #[arg(long)]
        force: bool,
    },

    /// Print recorded status-log entries
    Journal {
        /// Journal directory (default: from config)
        #[arg(short, long)]
        store: Option<PathBuf>,

        #[arg(long)]
        job: Option<i64>,

        #[arg(long)]
        test: Option<String>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        status: Option<String>,

        /// Extra filters as FIELD<op>VALUE, e.g. timestamp>=1393668000
        #[arg(short, long)]
        filter: Vec<Filter>,
    },

    /// Rebuild the journal index from its log
    Reindex {
        #[arg(short, long)]
        store: Option<PathBuf>,
    },
}

fn parse_branch_build(raw: &str) -> Result<(String, String)> {
    let (branch, build) = raw
        .split_once('=')
        .ok_or_else(|| eyre!("expected BRANCH=BUILD, got {}", raw))?;
    Ok((branch.trim().to_string(), build.trim().to_string()))
}

/// Resolves `tot` only when a milestone was given on the command line
struct CommandLineTot(Option<u32>);

impl MilestoneResolver for CommandLineTot {
    fn tot_milestone(&self) -> Result<u32, ResolutionError> {
        match self.0 {
            Some(tot) => FixedMilestone(tot).tot_milestone(),
            None => Err(ResolutionError::TotUnavailable("pass --tot to resolve tot specs".to_string())),
        }
    }
}

/// Plans never look up manifests; rules needing a companion build report it instead
struct NoManifests;

impl ManifestSource for NoManifests {
    fn latest_manifest(&self, board: &str, build_type: &str, milestone: Option<u32>) -> Result<(u32, String), ResolutionError> {
        Err(ResolutionError::NoManifest {
            board: board.to_string(),
            build_type: build_type.to_string(),
            milestone,
        })
    }
}

/// Validates and prints each request instead of creating a job
struct PrintingScheduler;

impl SuiteScheduler for PrintingScheduler {
    fn schedule_suite(&self, request: &SuiteRequest) -> Result<bool, SchedulingError> {
        SuiteSpec::new(SuiteArgs::from(request)).map_err(|e| SchedulingError::Dedup(e.to_string()))?;
        println!(
            "  {} {} for {} (pool {}, priority {})",
            "would schedule".green(),
            request.suite.bold(),
            request.cros_build,
            request.pool.as_deref().unwrap_or("None"),
            request.priority.value()
        );
        if let Some(fw) = &request.firmware_rw_build {
            println!("    firmware_rw_build {}", fw);
        }
        if let Some(source) = &request.test_source_build {
            println!("    test_source_build {}", source);
        }
        Ok(true)
    }
}

fn colored_status(code: &str) -> String {
    let bare = code.strip_prefix("END ").unwrap_or(code);
    match bare {
        "GOOD" => code.green().to_string(),
        "WARN" => code.yellow().to_string(),
        "FAIL" | "ERROR" | "ABORT" => code.red().to_string(),
        "TEST_NA" => code.dimmed().to_string(),
        _ => code.to_string(),
    }
}

fn main() -> Result<()> {
    // Setup tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let lab = LabConfig::load_default()?;

    match cli.command {
        Commands::Validate { config, tot } => {
            let sections = load_task_file(&config)?;
            let (tasks, errors) = tasks_from_config(&sections, &CommandLineTot(tot));
            for task in &tasks {
                println!("{} {}", "ok".green(), task);
            }
            for (section, e) in &errors {
                println!("{} [{}] {}", "error".red(), section, e);
            }
            if !errors.is_empty() {
                return Err(eyre!("{} of {} sections are invalid", errors.len(), sections.len()));
            }
        }
        Commands::Plan {
            config,
            board,
            builds,
            tot,
            trigger,
            force,
        } => {
            let resolver = CommandLineTot(tot);
            let sections = load_task_file(&config)?;
            let (tasks, errors) = tasks_from_config(&sections, &resolver);
            for (section, e) in &errors {
                println!("{} [{}] {}", "skipping".yellow(), section, e);
            }

            let mut branch_builds: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (branch, build) in builds {
                branch_builds.entry(branch).or_default().push(build);
            }

            let env = TaskEnv {
                scheduler: &PrintingScheduler,
                manifests: &NoManifests,
                milestones: &resolver,
            };
            for task in tasks.iter().filter(|t| trigger.is_none_or(|tr| t.trigger == tr)) {
                println!("{}", task.name.bold());
                let report = task.schedule_matching(env, &branch_builds, &board, force)?;
                if let Some(reason) = &report.skipped {
                    println!("  {} {}", "skipped".yellow(), reason);
                }
                for (build, e) in &report.errors {
                    println!("  {} {}: {}", "rejected".red(), build, e);
                }
            }
        }
        Commands::Journal {
            store,
            job,
            test,
            host,
            status,
            filter,
        } => {
            let journal = Journal::open(store.unwrap_or_else(|| lab.journal_dir()))?;
            let mut filters = filter;
            if let Some(job) = job {
                filters.push(Filter::eq(Field::JobId, job));
            }
            if let Some(test) = test {
                filters.push(Filter::eq(Field::TestName, test));
            }
            if let Some(host) = host {
                filters.push(Filter::eq(Field::Hostname, host));
            }
            if let Some(status) = status {
                filters.push(Filter::eq(Field::Status, status));
            }

            for entry in journal.list(&filters)? {
                let line = entry.render();
                let rest = line.strip_prefix(entry.status_code.as_str()).unwrap_or(&line);
                println!("{}{}", colored_status(&entry.status_code), rest);
            }
        }
        Commands::Reindex { store } => {
            let mut journal = Journal::open(store.unwrap_or_else(|| lab.journal_dir()))?;
            let count = journal.reindex()?;
            info!(count, "Reindex complete");
            println!("Reindexed {} entries", count);
        }
    }

    Ok(())
}
