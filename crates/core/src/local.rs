//! Local filesystem provider
//!
//! Maps `file://` URIs onto absolute paths. Uploads are written to a
//! hidden `.<name>.nbpart` staging file that is renamed into place when the
//! session finishes, so readers never observe a partial file.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use jiff::Timestamp;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::checksum::{ChecksumAlgorithm, Digests};
use crate::error::{Error, Result};
use crate::traits::{
    ByteStream, ListOptions, ListPage, ObjectDescriptor, ObjectStore, PutOptions, UploadSession,
};
use crate::transfer::{is_staging_name, staging_path};
use crate::uri::{ResourceUri, Scheme};

const DEFAULT_PAGE_SIZE: usize = 1000;
const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Local filesystem storage provider
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> Self {
        Self
    }
}

fn path_of(uri: &ResourceUri) -> Result<PathBuf> {
    uri.local_path()
        .ok_or_else(|| Error::InvalidUri(format!("Not a local URI: {uri}")))
}

fn map_io(e: std::io::Error, what: &Path) -> Error {
    let what = what.display().to_string();
    match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(what),
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(what),
        std::io::ErrorKind::DirectoryNotEmpty => Error::DirectoryNotEmpty(what),
        _ => Error::Io(e),
    }
}

fn timestamp(modified: std::io::Result<SystemTime>) -> Option<Timestamp> {
    modified.ok().and_then(|t| Timestamp::try_from(t).ok())
}

fn descriptor_for(path: &Path, meta: &std::fs::Metadata) -> Result<ObjectDescriptor> {
    let uri = ResourceUri::from_local_path(path)?;
    let descriptor = if meta.is_dir() {
        ObjectDescriptor::directory(uri)
    } else {
        ObjectDescriptor::object(uri, meta.len())
    };
    Ok(descriptor.with_last_modified(timestamp(meta.modified())))
}

fn decode_page_token(token: &str) -> Result<String> {
    hex::decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| Error::InvalidPageToken(token.to_string()))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| map_io(e, parent))?;
    }
    Ok(())
}

/// Collect the entries below `root`, descending when `recursive`
async fn walk(root: &Path, recursive: bool) -> Result<Vec<ObjectDescriptor>> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut read_dir = fs::read_dir(&dir).await.map_err(|e| map_io(e, &dir))?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if is_staging_name(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_dir() && recursive {
                pending.push(path);
                continue;
            }
            entries.push(descriptor_for(&path, &meta)?);
        }
    }

    Ok(entries)
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    fn native_checksum(&self) -> Option<ChecksumAlgorithm> {
        None
    }

    async fn list(&self, uri: &ResourceUri, options: &ListOptions) -> Result<ListPage> {
        let root = path_of(uri)?;
        let base = uri.as_dir();
        let after = options
            .page_token
            .as_deref()
            .map(decode_page_token)
            .transpose()?;

        let mut entries = walk(&root, options.recursive).await?;
        entries.retain(|d| {
            let relative = d.uri.relative_to(&base).unwrap_or_default();
            let matches_prefix = options
                .prefix
                .as_deref()
                .is_none_or(|p| relative.starts_with(p));
            let past_cursor = after.as_deref().is_none_or(|a| d.uri.path() > a);
            matches_prefix && past_cursor
        });
        entries.sort_by(|a, b| a.uri.path().cmp(b.uri.path()));

        let page_size = options.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let next_page_token = if entries.len() > page_size {
            entries.truncate(page_size);
            entries.last().map(|d| hex::encode(d.uri.path()))
        } else {
            None
        };

        Ok(ListPage {
            items: entries,
            next_page_token,
        })
    }

    async fn stat(&self, uri: &ResourceUri) -> Result<ObjectDescriptor> {
        let path = path_of(uri)?;
        let meta = fs::metadata(&path).await.map_err(|e| map_io(e, &path))?;
        descriptor_for(&path, &meta)
    }

    async fn open_read(&self, uri: &ResourceUri, offset: u64) -> Result<ByteStream> {
        let path = path_of(uri)?;
        let mut file = fs::File::open(&path).await.map_err(|e| map_io(e, &path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        let stream = ReaderStream::with_capacity(file, 256 * 1024);
        Ok(Box::pin(stream.map(|r| r.map_err(Error::from))))
    }

    async fn begin_upload(
        &self,
        dest: &ResourceUri,
        options: &PutOptions,
    ) -> Result<Box<dyn UploadSession>> {
        let dest = path_of(dest)?;
        ensure_parent(&dest).await?;
        let staging = staging_path(&dest);
        let file = fs::File::create(&staging)
            .await
            .map_err(|e| map_io(e, &staging))?;

        Ok(Box::new(LocalUploadSession {
            dest,
            staging,
            file,
            committed: 0,
            chunk_size: options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        }))
    }

    fn resumable_uploads(&self) -> bool {
        true
    }

    async fn resume_upload(
        &self,
        dest: &ResourceUri,
        token: &str,
    ) -> Result<Box<dyn UploadSession>> {
        let dest = path_of(dest)?;
        let staging = PathBuf::from(token);
        if staging != staging_path(&dest) {
            return Err(Error::InvalidJobState(format!(
                "resume token {token} does not belong to {}",
                dest.display()
            )));
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&staging)
            .await
            .map_err(|e| map_io(e, &staging))?;
        let committed = file.seek(std::io::SeekFrom::End(0)).await?;
        debug!(path = %staging.display(), committed, "Reattached to staging file");

        Ok(Box::new(LocalUploadSession {
            dest,
            staging,
            file,
            committed,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }))
    }

    async fn delete(&self, uri: &ResourceUri, recursive: bool) -> Result<()> {
        let path = path_of(uri)?;
        let meta = fs::metadata(&path).await.map_err(|e| map_io(e, &path))?;
        let result = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_dir(&path).await
            }
        } else {
            fs::remove_file(&path).await
        };
        result.map_err(|e| map_io(e, &path))?;
        debug!(path = %path.display(), recursive, "Deleted");
        Ok(())
    }

    async fn copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor> {
        let from = path_of(src)?;
        let to = path_of(dest)?;
        let meta = fs::metadata(&from).await.map_err(|e| map_io(e, &from))?;
        if meta.is_dir() {
            return Err(Error::NotSupported(format!(
                "directory copy of {src}; copy its entries instead"
            )));
        }

        ensure_parent(&to).await?;
        let staging = staging_path(&to);
        if let Err(e) = fs::copy(&from, &staging).await {
            let _ = fs::remove_file(&staging).await;
            return Err(map_io(e, &from));
        }
        fs::rename(&staging, &to).await.map_err(|e| map_io(e, &to))?;
        self.stat(dest).await
    }

    async fn move_object(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor> {
        let from = path_of(src)?;
        let to = path_of(dest)?;
        ensure_parent(&to).await?;

        match fs::rename(&from, &to).await {
            Ok(()) => self.stat(dest).await,
            Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
                let descriptor = self.copy(src, dest).await?;
                self.delete(src, false).await?;
                Ok(descriptor)
            }
            Err(e) => Err(map_io(e, &from)),
        }
    }

    fn native_rename(&self) -> bool {
        true
    }

    async fn mkdir(&self, uri: &ResourceUri) -> Result<()> {
        let path = path_of(uri)?;
        fs::create_dir_all(&path).await.map_err(|e| map_io(e, &path))
    }
}

/// Upload session writing into a staging file
struct LocalUploadSession {
    dest: PathBuf,
    staging: PathBuf,
    file: fs::File,
    committed: u64,
    chunk_size: u64,
}

#[async_trait]
impl UploadSession for LocalUploadSession {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn resume_token(&self) -> Option<String> {
        Some(self.staging.to_string_lossy().into_owned())
    }

    async fn write_chunk(&mut self, data: Bytes) -> Result<u64> {
        self.file.write_all(&data).await?;
        self.file.flush().await?;
        self.committed += data.len() as u64;
        Ok(self.committed)
    }

    async fn query_committed(&mut self) -> Result<u64> {
        self.file.flush().await?;
        let len = fs::metadata(&self.staging).await?.len();
        self.file.seek(std::io::SeekFrom::Start(len)).await?;
        self.committed = len;
        Ok(len)
    }

    async fn finish(self: Box<Self>, _digests: &Digests) -> Result<ObjectDescriptor> {
        let LocalUploadSession {
            dest,
            staging,
            mut file,
            ..
        } = *self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &dest)
            .await
            .map_err(|e| map_io(e, &dest))?;

        let meta = fs::metadata(&dest).await?;
        descriptor_for(&dest, &meta)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let LocalUploadSession { file, staging, .. } = *self;
        drop(file);
        match fs::remove_file(&staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::list_all;

    fn uri(path: &Path) -> ResourceUri {
        ResourceUri::from_local_path(path).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"hello local").await.unwrap();

        let store = LocalStore::new();
        let dest = uri(&dir.path().join("nested/dest.txt"));
        let descriptor = store.put(&src, &dest, &PutOptions::default()).await.unwrap();
        assert_eq!(descriptor.size, Some(11));
        assert!(!staging_path(&dir.path().join("nested/dest.txt")).exists());

        let out = dir.path().join("out.txt");
        let n = store.get(&dest, &out).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(fs::read(&out).await.unwrap(), b"hello local");
    }

    #[tokio::test]
    async fn test_list_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            fs::write(dir.path().join(name), b"x").await.unwrap();
        }
        fs::create_dir(dir.path().join("sub")).await.unwrap();
        fs::write(dir.path().join("sub/d.txt"), b"x").await.unwrap();

        let store = LocalStore::new();
        let base = uri(dir.path()).as_dir();
        let options = ListOptions {
            page_size: Some(2),
            ..Default::default()
        };
        let first = store.list(&base, &options).await.unwrap();
        let names: Vec<_> = first.items.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let second = store
            .list(&base, &options.clone().with_page_token(first.next_page_token))
            .await
            .unwrap();
        let names: Vec<_> = second.items.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["c.txt", "sub"]);
        assert!(second.items[1].is_directory);
        assert!(second.next_page_token.is_none());

        let all = list_all(&store, &base, true).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|d| !d.is_directory));
    }

    #[tokio::test]
    async fn test_invalid_page_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new();
        let options = ListOptions {
            page_token: Some("not-hex".into()),
            ..Default::default()
        };
        let err = store.list(&uri(dir.path()), &options).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPageToken(_)));
    }

    #[tokio::test]
    async fn test_delete_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).await.unwrap();
        fs::write(sub.join("f"), b"x").await.unwrap();

        let store = LocalStore::new();
        let err = store.delete(&uri(&sub), false).await.unwrap_err();
        assert!(matches!(err, Error::DirectoryNotEmpty(_)));

        store.delete(&uri(&sub), true).await.unwrap();
        assert!(!store.exists(&uri(&sub)).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_upload_from_staging() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new();
        let dest = uri(&dir.path().join("big.bin"));

        let mut session = store
            .begin_upload(&dest, &PutOptions::default())
            .await
            .unwrap();
        session.write_chunk(Bytes::from_static(b"hello ")).await.unwrap();
        let token = session.resume_token().unwrap();
        drop(session);

        let mut session = store.resume_upload(&dest, &token).await.unwrap();
        assert_eq!(session.committed(), 6);
        session.write_chunk(Bytes::from_static(b"world")).await.unwrap();
        let descriptor = session.finish(&Digests::default()).await.unwrap();
        assert_eq!(descriptor.size, Some(11));
        assert_eq!(
            fs::read(dir.path().join("big.bin")).await.unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_list_keeps_user_files_with_staging_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.nbpart"), b"mine").await.unwrap();
        let store = LocalStore::new();
        let mut session = store
            .begin_upload(&uri(&dir.path().join("big.bin")), &PutOptions::default())
            .await
            .unwrap();
        session.write_chunk(Bytes::from_static(b"partial")).await.unwrap();

        let all = list_all(&store, &uri(dir.path()).as_dir(), false).await.unwrap();
        let names: Vec<_> = all.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["notes.nbpart"]);
        assert!(dir.path().join(".big.bin.nbpart").exists());
        session.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new();
        let a = dir.path().join("a.txt");
        fs::write(&a, b"abc").await.unwrap();

        let b = uri(&dir.path().join("moved/b.txt"));
        store.move_object(&uri(&a), &b).await.unwrap();
        assert!(!a.exists());
        assert_eq!(store.stat(&b).await.unwrap().size, Some(3));

        let err = store.stat(&uri(&a)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
