//! cp and mv commands - Transfer an object through the job engine

use clap::Args;
use nb_core::{JobDefinition, JobKind, JobOptions, ResourceUri, Scheme};

use super::{Context, parse_location, transfer};
use crate::exit_code::ExitCode;

#[derive(Args, Debug)]
pub struct CpArgs {
    /// Source object (URI or local path)
    pub source: String,

    /// Destination object, or a directory ending in `/`
    pub destination: String,

    /// Fail instead of replacing an existing destination
    #[arg(long)]
    pub no_overwrite: bool,

    /// Skip the checksum comparison after the transfer
    #[arg(long)]
    pub no_verify: bool,

    /// Content type for the destination (guessed from the name by default)
    #[arg(long)]
    pub content_type: Option<String>,
}

/// Job kind for a transfer between two locations
fn transfer_kind(source: &ResourceUri, destination: &ResourceUri, is_move: bool) -> JobKind {
    if is_move {
        return JobKind::Move;
    }
    match (source.scheme(), destination.scheme()) {
        (Scheme::Local, Scheme::Local) => JobKind::Copy,
        (Scheme::Local, _) => JobKind::Upload,
        (_, Scheme::Local) => JobKind::Download,
        _ => JobKind::Copy,
    }
}

/// Append the source name when the destination is a directory
fn resolve_destination(
    source: &ResourceUri,
    destination: ResourceUri,
) -> nb_core::Result<ResourceUri> {
    let is_local_dir = destination
        .local_path()
        .is_some_and(|path| path.is_dir());
    if destination.is_dir() || is_local_dir {
        destination.as_dir().join(source.name())
    } else {
        Ok(destination)
    }
}

fn definition(
    kind: JobKind,
    source: ResourceUri,
    destination: ResourceUri,
    options: JobOptions,
) -> JobDefinition {
    let definition = match kind {
        JobKind::Move => JobDefinition::move_to(source, destination),
        JobKind::Upload => JobDefinition::upload(source, destination),
        JobKind::Download => JobDefinition::download(source, destination),
        _ => JobDefinition::copy(source, destination),
    };
    definition.with_options(options)
}

pub async fn execute(args: CpArgs, is_move: bool, ctx: &Context) -> ExitCode {
    let (source, destination) = match (
        parse_location(&args.source),
        parse_location(&args.destination),
    ) {
        (Ok(s), Ok(d)) => (s, d),
        (Err(e), _) => {
            ctx.formatter.error(&format!("Invalid source: {e}"));
            return ExitCode::UsageError;
        }
        (_, Err(e)) => {
            ctx.formatter.error(&format!("Invalid destination: {e}"));
            return ExitCode::UsageError;
        }
    };
    if source.is_dir() {
        ctx.formatter
            .error("Directory transfers are not supported; copy objects individually");
        return ExitCode::UnsupportedFeature;
    }
    let destination = match resolve_destination(&source, destination) {
        Ok(d) => d,
        Err(e) => {
            ctx.formatter.error(&format!("Invalid destination: {e}"));
            return ExitCode::UsageError;
        }
    };
    if let Err(code) = ctx
        .provider(&source)
        .and_then(|_| ctx.provider(&destination))
    {
        return code;
    }

    let kind = transfer_kind(&source, &destination, is_move);
    let options = JobOptions {
        overwrite: !args.no_overwrite,
        verify: !args.no_verify,
        content_type: args.content_type,
        ..Default::default()
    };

    let engine = ctx.engine();
    if let Err(e) = engine.restore_state().await {
        tracing::debug!(error = %e, "No persisted jobs restored");
    }
    let job = match engine
        .create_job(definition(kind, source, destination, options))
        .await
    {
        Ok(job) => job,
        Err(e) => return ctx.fail("Failed to create job", &e),
    };
    tracing::info!(job_id = %job.id, %kind, "Started transfer");

    transfer::follow(ctx, &engine, job.id, job.source.name()).await
}
