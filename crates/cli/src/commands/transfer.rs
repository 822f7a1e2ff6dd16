//! Running a job in the foreground
//!
//! Progress events drive a bar until the job is terminal. Ctrl-C pauses a
//! pausable job and persists it for `nb jobs resume`; other jobs are
//! canceled.

use nb_core::{Job, JobEngine, JobEvent, JobId, JobStatus};
use serde::Serialize;

use super::Context;
use crate::exit_code::ExitCode;
use crate::output::{TransferProgress, human_size};

#[derive(Debug, Serialize)]
pub(crate) struct JobOutput {
    job_id: String,
    kind: String,
    status: JobStatus,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<String>,
    bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&Job> for JobOutput {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            kind: job.kind.to_string(),
            status: job.status,
            source: job.source.to_string(),
            destination: job.destination.as_ref().map(ToString::to_string),
            bytes_transferred: job.progress.bytes_transferred,
            strategy: job.plan.as_ref().map(|p| p.strategy.name().to_string()),
            error: job.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Follow `id` to completion, then shut the engine down
pub(crate) async fn follow(ctx: &Context, engine: &JobEngine, id: JobId, label: &str) -> ExitCode {
    let progress = TransferProgress::new(&ctx.formatter, label);
    let bar = progress.clone();
    let subscription = engine
        .subscribe(move |event| {
            if let JobEvent::Progress { id: event_id, progress } = event
                && *event_id == id
            {
                bar.update(progress);
            }
        })
        .await;
    if let Err(e) = &subscription {
        tracing::warn!(error = %e, "Progress updates unavailable");
    }

    let finished = tokio::select! {
        job = engine.wait_for(id) => job.map(Some),
        _ = tokio::signal::ctrl_c() => Ok(None),
    };
    drop(subscription);
    progress.finish();

    let code = match finished {
        Ok(Some(job)) => report(ctx, &job),
        Ok(None) => interrupt(ctx, engine, id).await,
        Err(e) => ctx.fail("Job engine failed", &e),
    };
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "Failed to persist job state");
    }
    code
}

async fn interrupt(ctx: &Context, engine: &JobEngine, id: JobId) -> ExitCode {
    let job = match engine.get_job(id).await {
        Ok(job) => job,
        Err(e) => return ctx.fail("Job engine failed", &e),
    };
    if job.pausable {
        // shutdown pauses the job and writes it to jobs.json
        ctx.formatter.warning(&format!(
            "Interrupted; paused job {id}. Resume with `nb jobs resume {id}`"
        ));
        if ctx.formatter.is_json() {
            let mut output = JobOutput::from(&job);
            output.status = JobStatus::Paused;
            ctx.formatter.json(&output);
        }
        return ExitCode::Interrupted;
    }

    if let Err(e) = engine.cancel_job(id).await {
        return ctx.fail("Failed to cancel job", &e);
    }
    let job = engine.wait_for(id).await.unwrap_or(job);
    ctx.formatter
        .warning(&format!("Interrupted; canceled job {id} ({})", job.status));
    if ctx.formatter.is_json() {
        ctx.formatter.json(&JobOutput::from(&job));
    }
    ExitCode::Interrupted
}

fn report(ctx: &Context, job: &Job) -> ExitCode {
    if ctx.formatter.is_json() {
        ctx.formatter.json(&JobOutput::from(job));
    }
    match job.status {
        JobStatus::Completed => {
            let what = match &job.destination {
                Some(dest) => format!("{} -> {dest}", job.source),
                None => job.source.to_string(),
            };
            let bytes = job.progress.bytes_transferred;
            if bytes > 0 {
                ctx.formatter.success(&format!(
                    "{} {what} ({})",
                    capitalize(&job.kind.to_string()),
                    human_size(bytes)
                ));
            } else {
                ctx.formatter
                    .success(&format!("{} {what}", capitalize(&job.kind.to_string())));
            }
            ExitCode::Success
        }
        JobStatus::Canceled => {
            ctx.formatter.warning(&format!("Job {} was canceled", job.id));
            ExitCode::Interrupted
        }
        _ => {
            let (kind, message) = job
                .error
                .as_ref()
                .map(|e| (Some(e.kind), e.message.clone()))
                .unwrap_or_else(|| (None, format!("job ended as {}", job.status)));
            if !ctx.formatter.is_json() {
                ctx.formatter
                    .error_with_kind(&format!("{} failed: {message}", job.kind), kind);
            }
            kind.map(ExitCode::from).unwrap_or(ExitCode::GeneralError)
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("upload"), "Upload");
        assert_eq!(capitalize(""), "");
    }
}
