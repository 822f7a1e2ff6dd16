//! Streaming helpers shared by providers
//!
//! These back the default `get`/`put` implementations of [`ObjectStore`]
//! and are generic over the store so they work for trait objects too.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::checksum::{ChecksumAlgorithm, MultiHasher};
use crate::error::{Error, Result};
use crate::traits::{ListOptions, ObjectDescriptor, ObjectStore, PutOptions};
use crate::uri::ResourceUri;

/// Suffix of partially written local files
pub const STAGING_SUFFIX: &str = ".nbpart";

/// Path of the hidden staging file used while writing `dest`
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = dest.file_name() {
        name.push(file_name);
    }
    name.push(STAGING_SUFFIX);
    dest.with_file_name(name)
}

/// Whether a directory entry name belongs to an in-progress local write
pub fn is_staging_name(name: &str) -> bool {
    name.len() > 1 + STAGING_SUFFIX.len()
        && name.starts_with('.')
        && name.ends_with(STAGING_SUFFIX)
}

/// Content type derived from the file extension
pub fn guess_content_type(path: &str) -> Option<String> {
    mime_guess::from_path(path).first().map(|m| m.essence_str().to_string())
}

/// Follow page tokens until the listing is exhausted
pub async fn list_all<S>(
    store: &S,
    uri: &ResourceUri,
    recursive: bool,
) -> Result<Vec<ObjectDescriptor>>
where
    S: ObjectStore + ?Sized,
{
    let mut options = ListOptions {
        recursive,
        ..Default::default()
    };
    let mut items = Vec::new();
    loop {
        let page = store.list(uri, &options).await?;
        items.extend(page.items);
        match page.next_page_token {
            Some(token) => options.page_token = Some(token),
            None => break,
        }
    }
    Ok(items)
}

/// Stream an object into a local file via a staging file
///
/// The staging file is renamed over `dest` only after all bytes were
/// written and synced, and removed on failure.
pub async fn download_to_path<S>(store: &S, uri: &ResourceUri, dest: &Path) -> Result<u64>
where
    S: ObjectStore + ?Sized,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = staging_path(dest);

    let result = async {
        let mut stream = store.open_read(uri, 0).await?;
        let mut file = tokio::fs::File::create(&staging).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok::<u64, Error>(written)
    }
    .await;

    match result {
        Ok(written) => {
            tokio::fs::rename(&staging, dest).await?;
            tracing::debug!(%uri, path = %dest.display(), bytes = written, "Downloaded object");
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&staging).await;
            Err(e)
        }
    }
}

/// Upload a local file through an upload session, verifying the result
pub async fn upload_from_path<S>(
    store: &S,
    src: &Path,
    dest: &ResourceUri,
    options: &PutOptions,
) -> Result<ObjectDescriptor>
where
    S: ObjectStore + ?Sized,
{
    let file = tokio::fs::File::open(src).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(src.display().to_string()),
        _ => Error::Io(e),
    })?;
    let size = file.metadata().await?.len();

    let mut options = options.clone();
    options.size_hint.get_or_insert(size);
    if options.content_type.is_none() {
        options.content_type = guess_content_type(&src.to_string_lossy());
    }

    let mut algorithms = vec![ChecksumAlgorithm::Blake3];
    algorithms.extend(store.native_checksum());
    let mut hasher = MultiHasher::new(&algorithms);

    let mut session = store.begin_upload(dest, &options).await?;
    let capacity = session.chunk_size().clamp(64 * 1024, 8 * 1024 * 1024) as usize;
    let mut stream = ReaderStream::with_capacity(file, capacity);

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = session.abort().await;
                return Err(e.into());
            }
        };
        hasher.update(&chunk);
        if let Err(e) = session.write_chunk(chunk).await {
            let _ = session.abort().await;
            return Err(e);
        }
    }

    let digests = hasher.finalize();
    let descriptor = session.finish(&digests).await?;

    if let Err(e) = digests
        .verify(descriptor.content_checksum.as_ref())
        .into_result(&dest.to_string())
    {
        let _ = store.delete(dest, false).await;
        return Err(e);
    }

    tracing::debug!(%dest, bytes = size, "Uploaded file");
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path() {
        let p = staging_path(Path::new("/tmp/out/report.pdf"));
        assert_eq!(p, PathBuf::from("/tmp/out/.report.pdf.nbpart"));
        assert!(is_staging_name(".report.pdf.nbpart"));
        assert!(!is_staging_name("report.pdf.nbpart"));
        assert!(!is_staging_name(".nbpart"));
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("a/b/photo.png").as_deref(), Some("image/png"));
        assert_eq!(guess_content_type("noext"), None);
    }
}
