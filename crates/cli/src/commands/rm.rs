//! rm command - Remove objects and directories

use clap::Args;
use nb_core::Error;
use serde::Serialize;

use super::{Context, parse_location};
use crate::exit_code::ExitCode;

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Objects or directories to remove (URIs or local paths)
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Remove directories with their contents
    #[arg(short, long)]
    pub recursive: bool,

    /// Ignore targets that do not exist
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct RmOutput {
    deleted: Vec<String>,
    failed: Vec<RmFailure>,
}

#[derive(Debug, Serialize)]
struct RmFailure {
    uri: String,
    error: String,
}

pub async fn execute(args: RmArgs, ctx: &Context) -> ExitCode {
    let mut output = RmOutput {
        deleted: Vec::new(),
        failed: Vec::new(),
    };
    let mut exit = ExitCode::Success;

    for path in &args.paths {
        let uri = match parse_location(path) {
            Ok(uri) => uri,
            Err(e) => {
                ctx.formatter.error(&format!("Invalid path '{path}': {e}"));
                return ExitCode::UsageError;
            }
        };
        let provider = match ctx.provider(&uri) {
            Ok(p) => p,
            Err(code) => return code,
        };

        // Directories given without a trailing slash
        let target = if uri.is_dir() {
            uri
        } else {
            match provider.stat(&uri).await {
                Ok(item) if item.is_directory => uri.as_dir(),
                _ => uri,
            }
        };

        match provider.delete(&target, args.recursive).await {
            Ok(()) => {
                tracing::info!(uri = %target, "Removed");
                ctx.formatter.success(&format!("Removed {target}"));
                output.deleted.push(target.to_string());
            }
            Err(Error::NotFound(_)) if args.force => {}
            Err(e) => {
                let hint = if matches!(e, Error::DirectoryNotEmpty(_)) {
                    " (use -r)"
                } else {
                    ""
                };
                exit = ctx.fail(&format!("Failed to remove {target}{hint}"), &e);
                output.failed.push(RmFailure {
                    uri: target.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    if ctx.formatter.is_json() {
        ctx.formatter.json(&output);
    }
    exit
}
