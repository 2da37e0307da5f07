pub mod admin;
pub mod jobs;
pub mod runs;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::daemon::{self, Catalog};
use crate::models::job::DEFAULT_TIMEZONE;
use crate::models::{CommandType, Identity, JobKey, JobMode};

/// cronctl - operator tooling for the cron job catalog
#[derive(Parser, Debug)]
#[command(
    name = "cronctl",
    version,
    about = "cronctl - operator tooling for the cron job catalog"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory path
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// User to act as
    #[arg(short = 'u', long, default_value = "postgres", global = true)]
    pub user: String,

    /// Act with administrator privilege
    #[arg(long, global = true)]
    pub superuser: bool,

    /// Open the catalog read-only, as a standby node would
    #[arg(long, global = true)]
    pub standby: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the catalog tables
    Init {
        /// Owner of the catalog (defaults to --user)
        #[arg(long)]
        owner: Option<String>,

        /// Skip the job attributes table
        #[arg(long = "without-job-ext")]
        without_job_ext: bool,

        /// Skip the run details table
        #[arg(long = "without-run-details")]
        without_run_details: bool,
    },

    /// Schedule a job, or update the caller's job of the same name
    Schedule {
        /// Cron schedule expression (5-field)
        schedule: String,

        /// Command to run
        command: String,

        /// Job name (unique per user)
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Execution mode: single, timing, asap, next or fixed
        #[arg(long, default_value = JobMode::Next.as_str())]
        mode: String,

        /// Timezone offset in hours, -12 to 12
        #[arg(long, default_value = DEFAULT_TIMEZONE, allow_hyphen_values = true)]
        timezone: String,

        /// Command type: sql or native
        #[arg(long = "command-type", default_value = CommandType::Sql.as_str())]
        command_type: String,
    },

    /// Remove a job
    Unschedule {
        /// Job id, or name of one of the caller's jobs
        job: String,
    },

    /// Let the scheduler fire a job again
    Activate {
        /// Job id or name
        job: String,
    },

    /// Keep a job but stop the scheduler from firing it
    Deactivate {
        /// Job id or name
        job: String,
    },

    /// List all jobs
    Jobs {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded runs, newest first
    Runs {
        /// Only runs of this job id
        #[arg(long)]
        job: Option<i64>,

        /// Show last N runs
        #[arg(long, default_value_t = 20)]
        last: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fail runs interrupted by a restart
    Reconcile,

    /// Purge runs beyond the retention cap
    Retention,

    /// Grant a table privilege to a user
    Grant {
        /// User receiving the privilege
        grantee: String,

        /// SELECT, INSERT, UPDATE or DELETE
        privilege: String,

        /// Table: job, job_ext or job_run_details
        #[arg(long, default_value = "job")]
        table: String,
    },

    /// Run the maintenance loop in the foreground, logging due jobs
    Watch,
}

/// Interpret a job argument: all digits is an id, anything else a name.
pub fn parse_job_key(job: &str) -> JobKey {
    match job.parse::<i64>() {
        Ok(id) => JobKey::Id(id),
        Err(_) => JobKey::Name(job.to_string()),
    }
}

impl Cli {
    pub fn caller(&self) -> Identity {
        Identity {
            name: self.user.clone(),
            superuser: self.superuser,
        }
    }

    fn open_catalog(&self) -> anyhow::Result<Catalog> {
        let config = daemon::load_config(self.config.as_deref())?;
        let data_dir = daemon::resolve_data_dir(self.data_dir.as_deref());
        Catalog::open(config, &data_dir, self.standby).context("Failed to open catalog")
    }
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let command = match &cli.command {
        Some(command) => command,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
    };

    let catalog = cli.open_catalog()?;
    let log_file = catalog.config.log_file.clone();
    let _guard = if cli.verbose || matches!(command, Commands::Watch) {
        daemon::init_logging(cli.verbose, log_file.as_deref())?
    } else {
        None
    };
    let caller = cli.caller();

    match command {
        Commands::Init {
            owner,
            without_job_ext,
            without_run_details,
        } => admin::cmd_init(
            &catalog,
            owner.as_deref().unwrap_or(&cli.user),
            !*without_job_ext,
            !*without_run_details,
        ),
        Commands::Schedule {
            schedule,
            command,
            name,
            mode,
            timezone,
            command_type,
        } => jobs::cmd_schedule(
            &catalog,
            &caller,
            name.as_deref(),
            schedule,
            command,
            mode,
            timezone,
            command_type,
        ),
        Commands::Unschedule { job } => jobs::cmd_unschedule(&catalog, &caller, job),
        Commands::Activate { job } => jobs::cmd_set_active(&catalog, &caller, job, true),
        Commands::Deactivate { job } => jobs::cmd_set_active(&catalog, &caller, job, false),
        Commands::Jobs { json } => jobs::cmd_jobs(&catalog, *json),
        Commands::Runs { job, last, json } => runs::cmd_runs(&catalog, *job, *last, *json),
        Commands::Reconcile => runs::cmd_reconcile(&catalog),
        Commands::Retention => runs::cmd_retention(&catalog),
        Commands::Grant {
            grantee,
            privilege,
            table,
        } => admin::cmd_grant(&catalog, &caller, grantee, privilege, table),
        Commands::Watch => daemon::run_foreground(&catalog).await,
    }
}
