//! stat command - Show object metadata

use clap::Args;
use serde::Serialize;

use super::ls::ObjectEntry;
use super::{Context, parse_location};
use crate::exit_code::ExitCode;
use crate::output::human_size;

#[derive(Args, Debug)]
pub struct StatArgs {
    /// Object or directory (URI or local path)
    pub path: String,
}

#[derive(Debug, Serialize)]
struct StatOutput {
    #[serde(flatten)]
    entry: ObjectEntry,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    metadata: std::collections::BTreeMap<String, String>,
}

pub async fn execute(args: StatArgs, ctx: &Context) -> ExitCode {
    let uri = match parse_location(&args.path) {
        Ok(uri) => uri,
        Err(e) => {
            ctx.formatter.error(&format!("Invalid path: {e}"));
            return ExitCode::UsageError;
        }
    };
    let provider = match ctx.provider(&uri) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let item = match provider.stat(&uri).await {
        Ok(item) => item,
        Err(e) => return ctx.fail(&format!("Failed to stat {uri}"), &e),
    };

    let metadata = item
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let output = StatOutput {
        entry: ObjectEntry::from(&item),
        metadata,
    };
    if ctx.formatter.is_json() {
        ctx.formatter.json(&output);
        return ExitCode::Success;
    }

    let f = &ctx.formatter;
    let line = |key: &str, value: &str| {
        f.println(&format!("{} {value}", f.style_key(&format!("{key:<10}"))));
    };
    line("URI:", &item.uri.to_string());
    line("Type:", if item.is_directory { "directory" } else { "object" });
    if let Some(size) = item.size {
        line("Size:", &format!("{} ({size} bytes)", human_size(size)));
    }
    if let Some(modified) = item.last_modified {
        line("Modified:", &modified.to_string());
    }
    if let Some(etag) = &item.etag {
        line("ETag:", etag);
    }
    if let Some(checksum) = &item.content_checksum {
        line("Checksum:", &format!("{}:{}", checksum.algorithm, checksum.value));
    }
    for (key, value) in &output.metadata {
        line("Meta:", &format!("{key}={value}"));
    }
    ExitCode::Success
}
