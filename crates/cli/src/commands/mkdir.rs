//! mkdir command - Create a directory

use clap::Args;
use serde::Serialize;

use super::{Context, parse_location};
use crate::exit_code::ExitCode;

#[derive(Args, Debug)]
pub struct MkdirArgs {
    /// Directory to create (URI or local path)
    pub path: String,
}

#[derive(Debug, Serialize)]
struct MkdirOutput {
    success: bool,
    uri: String,
}

pub async fn execute(args: MkdirArgs, ctx: &Context) -> ExitCode {
    let uri = match parse_location(&args.path) {
        Ok(uri) => uri.as_dir(),
        Err(e) => {
            ctx.formatter.error(&format!("Invalid path: {e}"));
            return ExitCode::UsageError;
        }
    };
    let provider = match ctx.provider(&uri) {
        Ok(p) => p,
        Err(code) => return code,
    };
    if let Err(e) = provider.mkdir(&uri).await {
        return ctx.fail(&format!("Failed to create {uri}"), &e);
    }

    if ctx.formatter.is_json() {
        ctx.formatter.json(&MkdirOutput {
            success: true,
            uri: uri.to_string(),
        });
    } else {
        ctx.formatter
            .success(&format!("Created {}", ctx.formatter.style_dir(&uri.to_string())));
    }
    ExitCode::Success
}
