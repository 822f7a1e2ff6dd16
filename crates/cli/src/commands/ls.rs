//! ls command - List objects and directories

use clap::Args;
use nb_core::{Error, ObjectDescriptor, ResourceUri, transfer::list_all};
use serde::Serialize;

use super::{Context, parse_location};
use crate::exit_code::ExitCode;
use crate::output::human_size;

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Location to list (URI or local path)
    #[arg(default_value = ".")]
    pub path: String,

    /// List everything below the location
    #[arg(short, long)]
    pub recursive: bool,
}

/// Object entry as printed in JSON
#[derive(Debug, Serialize)]
pub(crate) struct ObjectEntry {
    uri: String,
    name: String,
    is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_human: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl From<&ObjectDescriptor> for ObjectEntry {
    fn from(item: &ObjectDescriptor) -> Self {
        Self {
            uri: item.uri.to_string(),
            name: item.name.clone(),
            is_dir: item.is_directory,
            size_bytes: item.size,
            size_human: item.size.map(human_size),
            last_modified: item.last_modified.map(|t| t.to_string()),
            etag: item.etag.clone(),
            checksum: item
                .content_checksum
                .as_ref()
                .map(|c| format!("{}:{}", c.algorithm, c.value)),
        }
    }
}

#[derive(Debug, Serialize)]
struct LsOutput {
    location: String,
    items: Vec<ObjectEntry>,
    total_objects: usize,
    total_size_bytes: u64,
}

pub async fn execute(args: LsArgs, ctx: &Context) -> ExitCode {
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

    // A path without a trailing slash may still name a directory
    let listing = if uri.is_dir() {
        list_all(provider.as_ref(), &uri, args.recursive).await
    } else {
        match provider.stat(&uri).await {
            Ok(item) if !item.is_directory => Ok(vec![item]),
            Ok(_) | Err(Error::NotFound(_)) => {
                list_dir(provider.as_ref(), &uri.as_dir(), args.recursive).await
            }
            Err(e) => Err(e),
        }
    };
    let items = match listing {
        Ok(items) => items,
        Err(e) => return ctx.fail(&format!("Failed to list {uri}"), &e),
    };

    let total_objects = items.iter().filter(|i| !i.is_directory).count();
    let total_size_bytes: u64 = items.iter().filter_map(|i| i.size).sum();

    if ctx.formatter.is_json() {
        ctx.formatter.json(&LsOutput {
            location: uri.to_string(),
            items: items.iter().map(ObjectEntry::from).collect(),
            total_objects,
            total_size_bytes,
        });
        return ExitCode::Success;
    }

    if items.is_empty() {
        ctx.formatter.println("No objects found.");
        return ExitCode::Success;
    }
    let mut table = ctx.formatter.table(&["MODIFIED", "SIZE", "NAME"]);
    for item in &items {
        let mut row = ctx.formatter.object_row(item);
        if args.recursive
            && let Some(relative) = item.uri.relative_to(&uri.as_dir())
        {
            let name = if item.is_directory {
                ctx.formatter.style_dir(relative)
            } else {
                relative.to_string()
            };
            row[2] = comfy_table::Cell::new(name);
        }
        table.add_row(row);
    }
    ctx.formatter.println(&table.to_string());
    ctx.formatter.println(&format!(
        "{} objects, {}",
        total_objects,
        human_size(total_size_bytes)
    ));
    ExitCode::Success
}

/// List a directory that `stat` could not find; an empty prefix is missing
async fn list_dir(
    provider: &dyn nb_core::ObjectStore,
    dir: &ResourceUri,
    recursive: bool,
) -> nb_core::Result<Vec<ObjectDescriptor>> {
    let items = list_all(provider, dir, recursive).await?;
    if items.is_empty() && dir.scheme().is_prefix_based() {
        return Err(Error::NotFound(dir.to_string()));
    }
    Ok(items)
}
