// CLI job commands: schedule, unschedule, activate, deactivate, jobs

use super::parse_job_key;
use crate::daemon::Catalog;
use crate::models::{Identity, Job, ScheduleRequest};

/// Shorten `text` to `width` characters, marking the cut with "...".
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let kept: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}

/// cronctl schedule
#[allow(clippy::too_many_arguments)]
pub fn cmd_schedule(
    catalog: &Catalog,
    caller: &Identity,
    name: Option<&str>,
    schedule: &str,
    command: &str,
    mode: &str,
    timezone: &str,
    command_type: &str,
) -> anyhow::Result<()> {
    let mut request = ScheduleRequest::new(schedule, command)
        .mode(mode)
        .timezone(timezone)
        .command_type(command_type);
    if let Some(name) = name {
        request = request.named(name);
    }

    let job_id = catalog.registrar.schedule(caller, &request)?;
    println!("Scheduled job {}.", job_id);
    if let Some(name) = name {
        println!("  Name:     {}", name);
    }
    println!("  Schedule: {}", schedule);
    println!("  Owner:    {}", caller.name);
    Ok(())
}

/// cronctl unschedule
pub fn cmd_unschedule(catalog: &Catalog, caller: &Identity, job: &str) -> anyhow::Result<()> {
    let key = parse_job_key(job);
    catalog.registrar.unschedule(caller, &key)?;
    println!("Unscheduled {}.", key);
    Ok(())
}

/// cronctl activate / deactivate
pub fn cmd_set_active(
    catalog: &Catalog,
    caller: &Identity,
    job: &str,
    active: bool,
) -> anyhow::Result<()> {
    let key = parse_job_key(job);
    catalog.registrar.set_active(caller, &key, active)?;
    println!(
        "{} {}.",
        if active { "Activated" } else { "Deactivated" },
        key
    );
    Ok(())
}

fn print_jobs(jobs: &[Job]) {
    println!(
        "{:<8}{:<16}{:<16}{:<12}{:<8}{:<8}{:<6}{:<8}COMMAND",
        "ID", "NAME", "SCHEDULE", "USER", "ACTIVE", "MODE", "TZ", "TYPE"
    );
    for job in jobs {
        println!(
            "{:<8}{:<16}{:<16}{:<12}{:<8}{:<8}{:<6}{:<8}{}",
            job.job_id,
            truncate(job.job_name.as_deref().unwrap_or("-"), 15),
            truncate(&job.schedule_text, 15),
            truncate(&job.user_name, 11),
            job.active,
            job.mode,
            job.timezone,
            job.command_type,
            truncate(&job.command, 40)
        );
    }
}

/// cronctl jobs
pub fn cmd_jobs(catalog: &Catalog, json: bool) -> anyhow::Result<()> {
    let jobs = catalog.cache.list_jobs()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    print_jobs(&jobs);
    Ok(())
}
