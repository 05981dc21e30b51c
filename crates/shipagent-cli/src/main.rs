use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use shipagent_core::{LaunchSpec, ShipAgent};
use shipagent_events::EventKind;
use uuid::Uuid;

mod progress;

#[derive(Parser, Debug)]
#[command(name = "shipagent", version = version())]
#[command(about = "Natural-language batch shipment processing")]
struct Cli {
    /// Directory for the ShipAgent state store and runtime lock.
    #[arg(long, default_value = ".shipagent")]
    state_dir: PathBuf,

    /// Directory to look for `.shipagent.toml` in.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Carrier subprocess program to launch.
    #[arg(long, default_value = "shipagent-carrier-adapter")]
    carrier_program: String,

    /// Extra argument to pass to the carrier subprocess (repeatable).
    #[arg(long = "carrier-arg")]
    carrier_args: Vec<String>,

    /// Data-source subprocess program to launch.
    #[arg(long, default_value = "shipagent-data-adapter")]
    data_source_program: String,

    /// Extra argument to pass to the data-source subprocess (repeatable).
    #[arg(long = "data-source-arg")]
    data_source_args: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new job against the live data source.
    Submit {
        /// The operator's natural-language command text, stored verbatim.
        command_text: String,
        /// Carrier service code to use for every row (e.g. `ground`, `priority`).
        #[arg(long)]
        service_code: String,
        /// Optional WHERE-clause filter fragment, validated against the
        /// source schema and signed before it reaches the job.
        #[arg(long)]
        filter: Option<String>,
        /// Human-readable summary of the filter, shown alongside approval prompts.
        #[arg(long, default_value = "")]
        filter_summary: String,
    },
    /// Materialize rows for a job and rate every row without shipping.
    Preview { job_id: Uuid },
    /// Re-preview a previewed job with a new filter, bumping its generation.
    Refine {
        job_id: Uuid,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long, default_value = "")]
        filter_summary: String,
    },
    /// Approve a previewed job, printing the single-use execution token.
    Approve { job_id: Uuid },
    /// Execute an approved job with its approval token.
    Execute {
        job_id: Uuid,
        #[arg(long)]
        token: String,
        /// Stop dispatching new rows after the first failure.
        #[arg(long)]
        fail_fast: bool,
    },
    /// Cancel a job from any non-terminal state.
    Cancel { job_id: Uuid },
    /// Resume interrupted jobs left running or half-materialized at the last crash.
    Recover,
    /// Tail the event bus, optionally scoped to one job, until `--timeout` elapses.
    Tail {
        job_id: Option<Uuid>,
        #[arg(long, default_value = "5m")]
        timeout: String,
    },
    /// Print resolved configuration and environment diagnostics.
    Doctor,
    /// Emit a shell completion script for the given shell, to stdout.
    Completions { shell: Shell },
}

fn version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("SHIPAGENT_GIT_SHA"),
        ", ",
        env!("SHIPAGENT_RUSTC_VERSION"),
        ")"
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.cmd {
        clap_complete::generate(*shell, &mut Cli::command(), "shipagent", &mut std::io::stdout());
        return Ok(());
    }

    let launch = LaunchSpec {
        carrier_program: cli.carrier_program.clone(),
        carrier_args: cli.carrier_args.clone(),
        data_source_program: cli.data_source_program.clone(),
        data_source_args: cli.data_source_args.clone(),
    };
    let agent = ShipAgent::open(&cli.state_dir, &cli.config_dir, launch).context("starting shipagent")?;

    match cli.cmd {
        Commands::Submit {
            command_text,
            service_code,
            filter,
            filter_summary,
        } => {
            let spec = filter
                .map(|where_sql| agent.compile_filter(&where_sql, &filter_summary))
                .transpose()
                .context("compiling filter")?;
            let job = agent
                .coordinator()
                .submit(&command_text, &service_code, spec)
                .context("submitting job")?;
            print_job(&job);
        }
        Commands::Preview { job_id } => {
            let job = agent.coordinator().preview(job_id).context("previewing job")?;
            print_job(&job);
        }
        Commands::Refine {
            job_id,
            filter,
            filter_summary,
        } => {
            let spec = filter
                .map(|where_sql| agent.compile_filter(&where_sql, &filter_summary))
                .transpose()
                .context("compiling filter")?;
            let job = agent.coordinator().refine(job_id, spec).context("refining job")?;
            print_job(&job);
        }
        Commands::Approve { job_id } => {
            let (job, token) = agent.coordinator().approve(job_id).context("approving job")?;
            print_job(&job);
            println!("approval_token: {token}");
        }
        Commands::Execute {
            job_id,
            token,
            fail_fast,
        } => {
            let job = agent
                .coordinator()
                .execute(job_id, &token, fail_fast)
                .context("executing job")?;
            print_job(&job);
        }
        Commands::Cancel { job_id } => {
            let job = agent.coordinator().cancel(job_id).context("cancelling job")?;
            print_job(&job);
        }
        Commands::Recover => {
            let jobs = agent.coordinator().recover().context("recovering jobs")?;
            println!("recovered {} job(s)", jobs.len());
            for job in &jobs {
                print_job(job);
            }
        }
        Commands::Tail { job_id, timeout } => {
            let timeout = humantime::parse_duration(&timeout).context("invalid --timeout")?;
            run_tail(&agent, job_id, timeout);
        }
        Commands::Doctor => {
            run_doctor(&agent);
        }
        Commands::Completions { .. } => unreachable!("handled before agent startup"),
    }

    Ok(())
}

fn print_job(job: &shipagent_types::Job) {
    println!("job_id:       {}", job.id);
    println!("status:       {:?}", job.status);
    println!("generation:   {}", job.generation);
    println!(
        "rows:         total={} succeeded={} failed={} skipped={}",
        job.total_rows, job.succeeded_rows, job.failed_rows, job.skipped_rows
    );
    println!("cost_minor_units: {}", job.cost_minor_units);
}

fn run_tail(agent: &ShipAgent, job_id: Option<Uuid>, timeout: Duration) {
    let subscriber = agent.subscribe();
    let deadline = std::time::Instant::now() + timeout;
    let mut reporter = progress::ProgressReporter::new(0);
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(event) = subscriber.recv(remaining) else {
            break;
        };
        if let Some(scope) = job_id {
            if event.job_id != scope {
                continue;
            }
        }
        if matches!(event.kind, EventKind::JobCompleted | EventKind::JobFailed) {
            reporter.on_event(&event);
            break;
        }
        reporter.on_event(&event);
    }
    reporter.finish();
}

fn run_doctor(agent: &ShipAgent) {
    println!("shipagent {}", version());
    let config = agent.config();
    println!("batch_concurrency:   {}", config.batch_concurrency());
    println!("preview_max_rows:    {}", config.preview_max_rows());
    println!("warning_rows_policy: {:?}", config.warning_rows_policy());
    println!("labels_output_dir:   {}", config.labels_output_dir().display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_includes_package_version() {
        assert!(version().starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn cli_parses_submit_with_filter() {
        let cli = Cli::parse_from([
            "shipagent",
            "submit",
            "ship everything over 5kg via ground",
            "--service-code",
            "ground",
            "--filter",
            "weight_grams > 5000",
        ]);
        match cli.cmd {
            Commands::Submit {
                service_code,
                filter,
                ..
            } => {
                assert_eq!(service_code, "ground");
                assert_eq!(filter.as_deref(), Some("weight_grams > 5000"));
            }
            other => panic!("expected Submit, got {other:?}"),
        }
    }

    #[test]
    fn cli_parses_execute_flags() {
        let job_id = Uuid::new_v4();
        let cli = Cli::parse_from([
            "shipagent",
            "execute",
            &job_id.to_string(),
            "--token",
            "abc123",
            "--fail-fast",
        ]);
        match cli.cmd {
            Commands::Execute {
                job_id: parsed,
                token,
                fail_fast,
            } => {
                assert_eq!(parsed, job_id);
                assert_eq!(token, "abc123");
                assert!(fail_fast);
            }
            other => panic!("expected Execute, got {other:?}"),
        }
    }

    #[test]
    fn cli_parses_completions_shell() {
        let cli = Cli::parse_from(["shipagent", "completions", "zsh"]);
        match cli.cmd {
            Commands::Completions { shell } => assert_eq!(shell, Shell::Zsh),
            other => panic!("expected Completions, got {other:?}"),
        }
    }

    #[test]
    fn completions_generate_without_panicking() {
        let mut buf = Vec::new();
        clap_complete::generate(Shell::Bash, &mut Cli::command(), "shipagent", &mut buf);
        assert!(!buf.is_empty());
    }
}
