// CLI run commands: runs, reconcile, retention

use chrono::{DateTime, Utc};

use crate::daemon::Catalog;

fn format_time(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// cronctl runs
pub fn cmd_runs(
    catalog: &Catalog,
    job: Option<i64>,
    last: usize,
    json: bool,
) -> anyhow::Result<()> {
    let runs = catalog.tracker.list_runs(job, last)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<8}{:<8}{:<12}{:<21}{:<21}MESSAGE",
        "RUN", "JOB", "STATUS", "STARTED", "ENDED"
    );
    for run in &runs {
        println!(
            "{:<8}{:<8}{:<12}{:<21}{:<21}{}",
            run.run_id,
            run.job_id,
            run.status,
            format_time(run.start_time),
            format_time(run.end_time),
            run.return_message.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// cronctl reconcile
pub fn cmd_reconcile(catalog: &Catalog) -> anyhow::Result<()> {
    let failed = catalog.tracker.reconcile_after_restart()?;
    println!("Marked {} interrupted run(s) as failed.", failed);
    Ok(())
}

/// cronctl retention
pub fn cmd_retention(catalog: &Catalog) -> anyhow::Result<()> {
    let purged = catalog.tracker.enforce_retention()?;
    println!(
        "Purged {} run(s); keeping at most {}.",
        purged,
        catalog.tracker.retention()
    );
    Ok(())
}
