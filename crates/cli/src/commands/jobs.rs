//! jobs command - Persisted jobs
//!
//! Jobs interrupted with Ctrl-C are kept in `jobs.json` inside the state
//! directory. They can be listed, resumed in the foreground, or canceled.

use clap::Subcommand;
use comfy_table::Cell;
use nb_core::{Job, JobId, JobStatus, Progress};
use serde::Serialize;

use super::transfer::{self, JobOutput};
use super::Context;
use crate::exit_code::ExitCode;
use crate::output::human_size;

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// List persisted jobs
    List,

    /// Resume a paused job in the foreground
    Resume {
        /// Job id as shown by `nb jobs list`
        id: String,
    },

    /// Cancel a paused job and release what it left behind
    Cancel {
        /// Job id as shown by `nb jobs list`
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct JobsOutput {
    jobs: Vec<JobOutput>,
}

pub async fn execute(cmd: JobsCommands, ctx: &Context) -> ExitCode {
    match cmd {
        JobsCommands::List => execute_list(ctx).await,
        JobsCommands::Resume { id } => match parse_id(&id, ctx) {
            Ok(id) => execute_resume(id, ctx).await,
            Err(code) => code,
        },
        JobsCommands::Cancel { id } => match parse_id(&id, ctx) {
            Ok(id) => execute_cancel(id, ctx).await,
            Err(code) => code,
        },
    }
}

fn parse_id(id: &str, ctx: &Context) -> Result<JobId, ExitCode> {
    id.parse().map_err(|e: nb_core::Error| {
        ctx.formatter.error(&e.to_string());
        ExitCode::UsageError
    })
}

async fn execute_list(ctx: &Context) -> ExitCode {
    let Some(store) = ctx.state_store() else {
        ctx.formatter.error("No state directory available");
        return ExitCode::UsageError;
    };
    let jobs: Vec<Job> = match store.load().await {
        Ok(Some(document)) => document.jobs.into_iter().map(|p| p.job).collect(),
        Ok(None) => Vec::new(),
        Err(e) => return ctx.fail("Failed to read job state", &e),
    };

    if ctx.formatter.is_json() {
        ctx.formatter.json(&JobsOutput {
            jobs: jobs.iter().map(JobOutput::from).collect(),
        });
        return ExitCode::Success;
    }
    if jobs.is_empty() {
        ctx.formatter.println("No persisted jobs.");
        return ExitCode::Success;
    }

    let mut table = ctx
        .formatter
        .table(&["ID", "KIND", "STATUS", "PROGRESS", "SOURCE", "DESTINATION"]);
    for job in &jobs {
        table.add_row(vec![
            Cell::new(ctx.formatter.style_name(&job.id.to_string())),
            Cell::new(job.kind),
            Cell::new(job.status),
            Cell::new(progress_text(&job.progress)),
            Cell::new(&job.source),
            Cell::new(
                job.destination
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
        ]);
    }
    ctx.formatter.println(&table.to_string());
    ExitCode::Success
}

fn progress_text(progress: &Progress) -> String {
    let done = human_size(progress.bytes_transferred);
    match (progress.bytes_total, progress.fraction()) {
        (Some(total), Some(fraction)) => {
            format!("{done} / {} ({:.0}%)", human_size(total), fraction * 100.0)
        }
        _ => done,
    }
}

async fn execute_resume(id: JobId, ctx: &Context) -> ExitCode {
    let engine = ctx.engine();
    if let Err(e) = engine.restore_state().await {
        return ctx.fail("Failed to restore jobs", &e);
    }
    let job = match engine.get_job(id).await {
        Ok(job) => job,
        Err(e) => return ctx.fail("Cannot resume", &e),
    };
    if job.status != JobStatus::Paused {
        ctx.formatter
            .error(&format!("Job {id} is {} and cannot be resumed", job.status));
        return ExitCode::UsageError;
    }
    if let Err(e) = engine.resume_job(id).await {
        return ctx.fail("Failed to resume job", &e);
    }
    tracing::info!(job_id = %id, "Resumed job");
    transfer::follow(ctx, &engine, id, job.source.name()).await
}

async fn execute_cancel(id: JobId, ctx: &Context) -> ExitCode {
    let engine = ctx.engine();
    if let Err(e) = engine.restore_state().await {
        return ctx.fail("Failed to restore jobs", &e);
    }
    if let Err(e) = engine.cancel_job(id).await {
        return ctx.fail("Failed to cancel job", &e);
    }
    let code = match engine.wait_for(id).await {
        Ok(job) => {
            if ctx.formatter.is_json() {
                ctx.formatter.json(&JobOutput::from(&job));
            } else {
                ctx.formatter.success(&format!("Canceled job {id}"));
            }
            ExitCode::Success
        }
        Err(e) => ctx.fail("Failed to cancel job", &e),
    };
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "Failed to persist job state");
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_text() {
        let progress = Progress {
            bytes_transferred: 512,
            bytes_total: Some(2048),
            ..Default::default()
        };
        assert_eq!(progress_text(&progress), "512 B / 2 KiB (25%)");

        let unknown = Progress {
            bytes_transferred: 4096,
            ..Default::default()
        };
        assert_eq!(progress_text(&unknown), "4 KiB");
    }
}
