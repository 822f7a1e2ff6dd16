//! Transfer executor
//!
//! Runs one job at a time on behalf of the engine: plans the transfer,
//! drives the chosen strategy against the providers, checkpoints resumable
//! progress, verifies checksums and cleans up after cancellation.
//!
//! Every provider call runs under the configured deadline and is retried
//! with backoff when the error is transient.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::checksum::{ChecksumAlgorithm, Digests, HashCursor, Verification};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::job::{
    CheckpointLog, CheckpointWriter, Job, JobContext, JobKind, JobRunner, ResumeCheckpoint,
    RunOutcome,
};
use crate::planner::{Strategy, TransferPlan};
use crate::registry::ProviderRegistry;
use crate::retry::{PollBackoff, calculate_backoff, retry_with_backoff, with_deadline};
use crate::traits::{
    CopyState, ObjectDescriptor, ObjectStore, PartInfo, PutOptions, UploadSession,
};
use crate::transfer::guess_content_type;
use crate::uri::ResourceUri;

/// Where a run stopped
#[derive(Debug)]
enum Step {
    Done,
    Paused(Option<ResumeCheckpoint>),
}

fn check_canceled(ctx: &JobContext) -> Result<()> {
    if ctx.is_canceled() {
        Err(Error::Canceled)
    } else {
        Ok(())
    }
}

fn part_range(part_number: u32, part_size: u64, total: u64) -> Range<u64> {
    let start = u64::from(part_number - 1) * part_size;
    start..(start + part_size).min(total)
}

/// Executes copy, move, upload, download, delete and mkdir jobs
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    registry: ProviderRegistry,
    config: EngineConfig,
    checkpoints: Option<CheckpointLog>,
}

impl TransferExecutor {
    pub fn new(
        registry: ProviderRegistry,
        config: EngineConfig,
        checkpoints: Option<CheckpointLog>,
    ) -> Self {
        Self {
            registry,
            config,
            checkpoints,
        }
    }

    fn call_timeout(&self) -> Duration {
        self.config.call_timeout()
    }

    /// Run a provider call with deadline and retry
    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.call_timeout();
        retry_with_backoff(
            &self.config.retry,
            || with_deadline(deadline, op()),
            Error::is_retryable,
        )
        .await
    }

    fn checkpoint_writer(
        &self,
        ctx: &JobContext,
        previous: Option<&ResumeCheckpoint>,
    ) -> CheckpointWriter {
        CheckpointWriter::new(
            self.checkpoints.clone(),
            ctx.id(),
            self.config.checkpoint.clone(),
            previous,
        )
    }

    async fn logged_checkpoint(&self, ctx: &JobContext) -> Option<ResumeCheckpoint> {
        let log = self.checkpoints.as_ref()?;
        match log.latest(ctx.id()).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!(job_id = %ctx.id(), error = %e, "Failed to read checkpoint log");
                None
            }
        }
    }

    async fn forget_checkpoints(&self, job: &Job) {
        if let Some(log) = &self.checkpoints
            && let Err(e) = log.remove(job.id).await
        {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to remove checkpoint log");
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Step> {
        let job = ctx.job();
        match job.kind {
            JobKind::Delete => {
                let store = self.registry.resolve(&job.source)?;
                self.call(|| store.delete(&job.source, job.options.recursive))
                    .await?;
                Ok(Step::Done)
            }
            JobKind::Mkdir => {
                let store = self.registry.resolve(&job.source)?;
                self.call(|| store.mkdir(&job.source)).await?;
                Ok(Step::Done)
            }
            JobKind::Copy | JobKind::Move | JobKind::Upload | JobKind::Download => {
                self.transfer(ctx).await
            }
        }
    }

    async fn transfer(&self, ctx: &JobContext) -> Result<Step> {
        let job = ctx.job();
        let src = &job.source;
        let dst = job.destination()?;
        let source = self.registry.resolve(src)?;
        let dest = self.registry.resolve(dst)?;

        let plan = match &job.plan {
            Some(plan) => plan.clone(),
            None => {
                let info = self.call(|| source.stat(src)).await?;
                if info.is_directory {
                    return Err(Error::NotSupported(format!(
                        "{src} is a directory; transfer its entries as separate jobs"
                    )));
                }
                if !job.options.overwrite && self.call(|| dest.exists(dst)).await? {
                    return Err(Error::General(format!("{dst} already exists")));
                }
                let plan = TransferPlan::compute(
                    source.scheme(),
                    dest.scheme(),
                    info.size.unwrap_or(0),
                    dest.resumable_uploads(),
                    &self.config.planner,
                );
                ctx.report_plan(plan.clone());
                plan
            }
        };
        let size = plan.inputs.source_size;
        tracing::debug!(job_id = %job.id, strategy = plan.label(), size, "Executing transfer");

        if job.kind == JobKind::Move && plan.inputs.same_provider && source.native_rename() {
            check_canceled(ctx)?;
            self.call(|| source.move_object(src, dst)).await?;
            ctx.report_progress(size, Some("renamed".to_string()));
            return Ok(Step::Done);
        }

        let checkpoint =
            ResumeCheckpoint::newest(ctx.checkpoint().cloned(), self.logged_checkpoint(ctx).await);

        let step = match &plan.strategy {
            Strategy::AtomicCopy { iterative: false } => {
                self.atomic_copy(ctx, source.as_ref(), src, dst, size).await?
            }
            Strategy::AtomicCopy { iterative: true } => {
                self.rewrite_copy(ctx, source.as_ref(), src, dst, size, checkpoint)
                    .await?
            }
            Strategy::MultipartCopy {
                part_size,
                part_count,
                part_concurrency,
            } => {
                let layout = PartLayout {
                    part_size: *part_size,
                    part_count: *part_count,
                    concurrency: *part_concurrency,
                    total: size,
                };
                self.multipart_copy(ctx, source.as_ref(), src, dst, layout, checkpoint)
                    .await?
            }
            Strategy::AsyncCopyPoll {
                initial_poll_ms,
                max_poll_ms,
            } => {
                let backoff = PollBackoff::new(
                    Duration::from_millis(*initial_poll_ms),
                    Duration::from_millis(*max_poll_ms),
                );
                self.async_copy(ctx, source.as_ref(), src, dst, size, backoff)
                    .await?
            }
            Strategy::StreamThroughClient {
                chunk_size,
                resumable,
            } => {
                let endpoints = Endpoints {
                    source: source.as_ref(),
                    dest: dest.as_ref(),
                    src,
                    dst,
                };
                let checkpoint = if *resumable { checkpoint } else { None };
                self.stream(ctx, endpoints, size, *chunk_size, checkpoint)
                    .await?
            }
            Strategy::NotSupported { reason } => {
                return Err(Error::NotSupported(reason.clone()));
            }
        };

        if let Step::Paused(_) = step {
            return Ok(step);
        }

        if job.kind == JobKind::Move {
            check_canceled(ctx)?;
            self.call(|| source.delete(src, false)).await?;
            tracing::debug!(job_id = %job.id, %src, "Removed move source");
        }
        Ok(Step::Done)
    }

    /// Compare a server-side copy result with the source
    async fn verify_copy(
        &self,
        ctx: &JobContext,
        store: &dyn ObjectStore,
        src: &ResourceUri,
        descriptor: &ObjectDescriptor,
        expected_size: u64,
    ) -> Result<()> {
        if let Some(size) = descriptor.size
            && size != expected_size
        {
            return Err(Error::IntegrityMismatch(format!(
                "{}: expected {expected_size} bytes, found {size}",
                descriptor.uri
            )));
        }
        if !ctx.job().options.verify {
            return Ok(());
        }

        let source_info = self.call(|| store.stat(src)).await?;
        match (&source_info.content_checksum, &descriptor.content_checksum) {
            (Some(expected), Some(actual))
                if expected.algorithm == actual.algorithm && expected.value != actual.value =>
            {
                Err(Error::IntegrityMismatch(format!(
                    "{}: expected {expected}, found {actual}",
                    descriptor.uri
                )))
            }
            (Some(_), Some(_)) => Ok(()),
            _ => {
                tracing::debug!(uri = %descriptor.uri, "Server-side copy has no comparable checksum");
                Ok(())
            }
        }
    }

    async fn atomic_copy(
        &self,
        ctx: &JobContext,
        store: &dyn ObjectStore,
        src: &ResourceUri,
        dst: &ResourceUri,
        size: u64,
    ) -> Result<Step> {
        check_canceled(ctx)?;
        let descriptor = self.call(|| store.copy(src, dst)).await?;
        self.verify_copy(ctx, store, src, &descriptor, size).await?;
        ctx.report_progress(size, None);
        Ok(Step::Done)
    }

    async fn rewrite_copy(
        &self,
        ctx: &JobContext,
        store: &dyn ObjectStore,
        src: &ResourceUri,
        dst: &ResourceUri,
        size: u64,
        checkpoint: Option<ResumeCheckpoint>,
    ) -> Result<Step> {
        let Some(rewrite) = store.rewrite_copy() else {
            return self.atomic_copy(ctx, store, src, dst, size).await;
        };

        let mut writer = self.checkpoint_writer(ctx, checkpoint.as_ref());
        let mut token = checkpoint.as_ref().and_then(|c| c.provider_resume_token.clone());
        let mut rewritten = checkpoint.as_ref().map_or(0, |c| c.bytes_committed);

        loop {
            check_canceled(ctx)?;
            if ctx.is_pause_requested() {
                let checkpoint = writer.record(rewritten, token.clone()).await?;
                ctx.report_checkpoint(checkpoint.clone());
                return Ok(Step::Paused(Some(checkpoint)));
            }

            let status = self
                .call(|| rewrite.rewrite(src, dst, token.clone()))
                .await?;
            rewritten = status.bytes_rewritten;
            ctx.report_progress(rewritten, None);

            if status.done {
                let descriptor = match status.descriptor {
                    Some(descriptor) => descriptor,
                    None => self.call(|| store.stat(dst)).await?,
                };
                self.verify_copy(ctx, store, src, &descriptor, size).await?;
                return Ok(Step::Done);
            }

            token = status.token;
            if let Some(checkpoint) = writer.maybe_record(rewritten, token.clone()).await? {
                ctx.report_checkpoint(checkpoint);
            }
        }
    }

    async fn multipart_copy(
        &self,
        ctx: &JobContext,
        store: &dyn ObjectStore,
        src: &ResourceUri,
        dst: &ResourceUri,
        layout: PartLayout,
        checkpoint: Option<ResumeCheckpoint>,
    ) -> Result<Step> {
        let multipart = store.multipart_copy().ok_or_else(|| {
            Error::NotSupported(format!("{} has no multipart copy", store.scheme()))
        })?;
        let mut writer = self.checkpoint_writer(ctx, checkpoint.as_ref());

        // Committed parts come from the backend, never from the checkpoint alone
        let mut done: BTreeMap<u32, PartInfo> = BTreeMap::new();
        let resumed = match checkpoint.and_then(|c| c.provider_resume_token) {
            Some(upload_id) => match self.call(|| multipart.list_parts(dst, &upload_id)).await {
                Ok(listed) => {
                    for part in listed {
                        let expected =
                            part_range(part.part_number, layout.part_size, layout.total);
                        if u64::from(part.part_number) <= layout.part_count
                            && part.size == expected.end - expected.start
                        {
                            done.insert(part.part_number, part);
                        }
                    }
                    tracing::info!(job_id = %ctx.id(), parts = done.len(), "Resuming multipart copy");
                    Some(upload_id)
                }
                // Finalized before the engine saw it, or expired on the backend
                Err(Error::NotFound(_)) => {
                    if self
                        .finalized_copy(ctx, store, src, dst, layout.total)
                        .await?
                    {
                        return Ok(Step::Done);
                    }
                    tracing::info!(job_id = %ctx.id(), upload_id = %upload_id, "Multipart upload is gone, starting over");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let upload_id = match resumed {
            Some(upload_id) => upload_id,
            None => {
                check_canceled(ctx)?;
                let upload_id = self.call(|| multipart.create_multipart(dst)).await?;
                let checkpoint = writer.record(0, Some(upload_id.clone())).await?;
                ctx.report_checkpoint(checkpoint);
                upload_id
            }
        };

        let mut committed: u64 = done.values().map(|p| p.size).sum();
        ctx.report_progress(committed, None);

        let pending: Vec<(u32, Range<u64>)> = (1..=layout.part_count as u32)
            .filter(|n| !done.contains_key(n))
            .map(|n| (n, part_range(n, layout.part_size, layout.total)))
            .collect();

        // No new part starts after a pause or cancel; parts in flight finish
        let mut failure = None;
        {
            let upload_id = upload_id.as_str();
            let mut parts = futures::stream::iter(pending)
                .take_while(|_| {
                    futures::future::ready(!ctx.is_canceled() && !ctx.is_pause_requested())
                })
                .map(|(part_number, range)| async move {
                    self.call(|| {
                        multipart.copy_part(src, dst, upload_id, part_number, range.clone())
                    })
                    .await
                })
                .buffer_unordered(layout.concurrency.max(1));

            while let Some(result) = parts.next().await {
                match result {
                    Ok(part) => {
                        committed += part.size;
                        done.insert(part.part_number, part);
                        ctx.report_progress(committed, None);
                        if let Some(checkpoint) = writer
                            .maybe_record(committed, Some(upload_id.to_string()))
                            .await?
                        {
                            ctx.report_checkpoint(checkpoint);
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if ctx.is_canceled() || failure.is_some() {
            if let Err(e) = multipart.abort_multipart(dst, &upload_id).await {
                tracing::warn!(job_id = %ctx.id(), error = %e, "Failed to abort multipart copy");
            }
            return Err(failure.unwrap_or(Error::Canceled));
        }
        if (done.len() as u64) < layout.part_count {
            let checkpoint = writer.record(committed, Some(upload_id)).await?;
            ctx.report_checkpoint(checkpoint.clone());
            return Ok(Step::Paused(Some(checkpoint)));
        }

        let parts: Vec<PartInfo> = done.into_values().collect();
        let descriptor = self
            .call(|| multipart.complete_multipart(dst, &upload_id, parts.clone()))
            .await?;
        self.verify_copy(ctx, store, src, &descriptor, layout.total)
            .await?;
        ctx.report_progress(layout.total, None);
        Ok(Step::Done)
    }

    /// Whether `dst` already holds the finished copy of `src`
    async fn finalized_copy(
        &self,
        ctx: &JobContext,
        store: &dyn ObjectStore,
        src: &ResourceUri,
        dst: &ResourceUri,
        total: u64,
    ) -> Result<bool> {
        let descriptor = match self.call(|| store.stat(dst)).await {
            Ok(descriptor) => descriptor,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if descriptor.is_directory || descriptor.size != Some(total) {
            return Ok(false);
        }
        self.verify_copy(ctx, store, src, &descriptor, total).await?;
        tracing::info!(job_id = %ctx.id(), dst = %dst, "Multipart copy was already completed");
        ctx.report_progress(total, None);
        Ok(true)
    }

    async fn async_copy(
        &self,
        ctx: &JobContext,
        store: &dyn ObjectStore,
        src: &ResourceUri,
        dst: &ResourceUri,
        size: u64,
        mut backoff: PollBackoff,
    ) -> Result<Step> {
        let copier = store.async_copy().ok_or_else(|| {
            Error::NotSupported(format!("{} has no asynchronous copy", store.scheme()))
        })?;

        check_canceled(ctx)?;
        let before = self.call(|| store.stat(src)).await?;
        let handle = self.call(|| copier.start_copy(src, dst)).await?;
        let expected_etag = handle.source_etag.clone().or(before.etag);

        loop {
            let status = self
                .call(|| copier.copy_status(dst, &handle.copy_id))
                .await?;
            ctx.report_progress(status.bytes_copied, status.description.clone());

            if let (Some(expected), Some(current)) = (&expected_etag, &status.source_etag)
                && expected != current
            {
                if let Err(e) = copier.abort_copy(dst, &handle.copy_id).await {
                    tracing::warn!(job_id = %ctx.id(), error = %e, "Failed to abort copy");
                }
                return Err(Error::IntegrityMismatch(format!(
                    "{src} changed during copy (etag {expected} -> {current})"
                )));
            }

            match status.state {
                CopyState::Success => break,
                CopyState::Pending => {}
                CopyState::Failed => {
                    return Err(Error::EmbeddedCopy {
                        message: status
                            .description
                            .unwrap_or_else(|| "copy failed".to_string()),
                        retryable: false,
                    });
                }
                CopyState::Aborted => {
                    return Err(Error::General(format!("copy to {dst} was aborted")));
                }
            }

            tokio::select! {
                _ = ctx.cancel_token().cancelled() => {
                    if let Err(e) = copier.abort_copy(dst, &handle.copy_id).await {
                        tracing::warn!(job_id = %ctx.id(), error = %e, "Failed to abort copy");
                    }
                    return Err(Error::Canceled);
                }
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }

        let after = self.call(|| store.stat(src)).await?;
        if let (Some(expected), Some(current)) = (&expected_etag, &after.etag)
            && expected != current
        {
            if let Err(e) = store.delete(dst, false).await {
                tracing::warn!(job_id = %ctx.id(), dst = %dst, error = %e, "Failed to remove stale copy");
            }
            return Err(Error::IntegrityMismatch(format!(
                "{src} changed during copy (etag {expected} -> {current})"
            )));
        }

        let descriptor = self.call(|| store.stat(dst)).await?;
        self.verify_copy(ctx, store, src, &descriptor, size).await?;
        ctx.report_progress(size, None);
        Ok(Step::Done)
    }

    fn algorithms(&self, endpoints: &Endpoints<'_>) -> Vec<ChecksumAlgorithm> {
        let mut algorithms = vec![self.config.checksum];
        if self.config.legacy_checksum {
            algorithms.push(ChecksumAlgorithm::Md5);
        }
        algorithms.extend(endpoints.source.native_checksum());
        algorithms.extend(endpoints.dest.native_checksum());
        algorithms
    }

    /// Hash the first `committed` bytes of the source again
    async fn rebuild_hash(
        &self,
        endpoints: &Endpoints<'_>,
        committed: u64,
        algorithms: &[ChecksumAlgorithm],
    ) -> Result<HashCursor> {
        let mut cursor = HashCursor::new(algorithms);
        if committed == 0 {
            return Ok(cursor);
        }

        let mut reader = self
            .call(|| endpoints.source.open_read(endpoints.src, 0))
            .await?;
        while cursor.offset() < committed {
            let chunk = with_deadline(self.call_timeout(), async {
                reader.next().await.transpose()
            })
            .await?
            .ok_or_else(|| {
                Error::IntegrityMismatch(format!(
                    "{} is shorter than the {committed} bytes already uploaded",
                    endpoints.src
                ))
            })?;
            let wanted = (committed - cursor.offset()).min(chunk.len() as u64) as usize;
            let offset = cursor.offset();
            cursor.update_at(offset, &chunk[..wanted])?;
        }
        tracing::debug!(src = %endpoints.src, committed, "Rebuilt checksum state for resume");
        Ok(cursor)
    }

    /// Open a fresh session or reattach to the checkpointed one
    async fn open_session(
        &self,
        ctx: &JobContext,
        endpoints: &Endpoints<'_>,
        options: &PutOptions,
        checkpoint: Option<&ResumeCheckpoint>,
    ) -> Result<(Box<dyn UploadSession>, bool)> {
        if let Some(token) = checkpoint.and_then(|c| c.provider_resume_token.as_deref()) {
            let deadline = self.call_timeout();
            let resumed = async {
                let mut session =
                    with_deadline(deadline, endpoints.dest.resume_upload(endpoints.dst, token))
                        .await?;
                with_deadline(deadline, session.query_committed()).await?;
                Ok::<_, Error>(session)
            }
            .await;
            match resumed {
                Ok(session) => return Ok((session, true)),
                Err(e) => {
                    tracing::warn!(
                        job_id = %ctx.id(),
                        error = %e,
                        "Upload session could not be resumed, starting over"
                    );
                }
            }
        }

        let session = self
            .call(|| endpoints.dest.begin_upload(endpoints.dst, options))
            .await?;
        Ok((session, false))
    }

    async fn stream(
        &self,
        ctx: &JobContext,
        endpoints: Endpoints<'_>,
        size: u64,
        chunk_size: u64,
        checkpoint: Option<ResumeCheckpoint>,
    ) -> Result<Step> {
        let job = ctx.job();
        let algorithms = self.algorithms(&endpoints);
        let options = PutOptions {
            content_type: job
                .options
                .content_type
                .clone()
                .or_else(|| guess_content_type(endpoints.dst.path())),
            size_hint: Some(size),
            chunk_size: Some(chunk_size),
            ..Default::default()
        };

        let (mut session, resumed) = self
            .open_session(ctx, &endpoints, &options, checkpoint.as_ref())
            .await?;
        let mut writer = self.checkpoint_writer(ctx, checkpoint.as_ref());
        if !resumed && endpoints.dest.resumable_uploads() {
            let checkpoint = writer.record(0, session.resume_token()).await?;
            ctx.report_checkpoint(checkpoint);
        }

        let result = self
            .pump(ctx, &endpoints, session.as_mut(), &mut writer, &algorithms)
            .await;
        let (digests, bytes) = match result {
            Ok(Pumped::Finished { digests, bytes }) => (digests, bytes),
            Ok(Pumped::Paused) => {
                let checkpoint = writer
                    .record(session.committed(), session.resume_token())
                    .await?;
                ctx.report_checkpoint(checkpoint.clone());
                return Ok(Step::Paused(Some(checkpoint)));
            }
            Err(e) => {
                if let Err(abort_err) = session.abort().await {
                    tracing::warn!(job_id = %ctx.id(), error = %abort_err, "Failed to abort upload");
                }
                return Err(e);
            }
        };

        if bytes != size {
            if let Err(e) = session.abort().await {
                tracing::warn!(job_id = %ctx.id(), error = %e, "Failed to abort upload");
            }
            return Err(Error::IntegrityMismatch(format!(
                "{}: expected {size} bytes, read {bytes}",
                endpoints.src
            )));
        }

        let descriptor = with_deadline(self.call_timeout(), session.finish(&digests)).await?;
        self.verify_stream(ctx, &endpoints, &digests, &descriptor, bytes)
            .await?;
        ctx.report_progress(size, None);
        Ok(Step::Done)
    }

    /// Move bytes from the source into the session until EOF or interruption
    async fn pump(
        &self,
        ctx: &JobContext,
        endpoints: &Endpoints<'_>,
        session: &mut dyn UploadSession,
        writer: &mut CheckpointWriter,
        algorithms: &[ChecksumAlgorithm],
    ) -> Result<Pumped> {
        let deadline = self.call_timeout();
        let retry = &self.config.retry;
        let mut offset = session.committed();
        let mut cursor = self.rebuild_hash(endpoints, offset, algorithms).await?;
        let mut failures = 0u32;

        'reopen: loop {
            let mut reader = match with_deadline(
                deadline,
                endpoints.source.open_read(endpoints.src, offset),
            )
            .await
            {
                Ok(reader) => reader,
                Err(e) if e.is_retryable() && failures + 1 < retry.max_attempts => {
                    failures += 1;
                    tokio::time::sleep(calculate_backoff(retry, failures)).await;
                    continue 'reopen;
                }
                Err(e) => return Err(e),
            };

            loop {
                check_canceled(ctx)?;
                if ctx.is_pause_requested() {
                    return Ok(Pumped::Paused);
                }

                let step = async {
                    let chunk = with_deadline(deadline, async { reader.next().await.transpose() })
                        .await?;
                    let Some(chunk) = chunk else {
                        return Ok(None);
                    };
                    cursor.update_at(offset, &chunk)?;
                    let len = chunk.len() as u64;
                    let committed = with_deadline(deadline, session.write_chunk(chunk)).await?;
                    Ok::<_, Error>(Some((len, committed)))
                }
                .await;

                match step {
                    Ok(Some((len, committed))) => {
                        failures = 0;
                        offset += len;
                        ctx.report_progress(offset, None);
                        if let Some(checkpoint) =
                            writer.maybe_record(committed, session.resume_token()).await?
                        {
                            ctx.report_checkpoint(checkpoint);
                        }
                    }
                    Ok(None) => break 'reopen,
                    Err(e) if e.is_retryable() && failures + 1 < retry.max_attempts => {
                        failures += 1;
                        tracing::debug!(
                            job_id = %ctx.id(),
                            offset,
                            attempt = failures,
                            error = %e,
                            "Transfer interrupted, re-syncing with destination"
                        );
                        tokio::time::sleep(calculate_backoff(retry, failures)).await;
                        offset = self.resync(session, failures).await?;
                        continue 'reopen;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(Pumped::Finished {
            digests: cursor.finalize(),
            bytes: offset,
        })
    }

    /// Ask the destination for its committed offset, retrying transient failures
    async fn resync(&self, session: &mut dyn UploadSession, mut failures: u32) -> Result<u64> {
        let retry = &self.config.retry;
        loop {
            match with_deadline(self.call_timeout(), session.query_committed()).await {
                Ok(committed) => return Ok(committed),
                Err(e) if e.is_retryable() && failures + 1 < retry.max_attempts => {
                    failures += 1;
                    tokio::time::sleep(calculate_backoff(retry, failures)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete a destination that failed verification
    async fn reject(&self, endpoints: &Endpoints<'_>, message: String) -> Error {
        if let Err(e) = endpoints.dest.delete(endpoints.dst, false).await {
            tracing::warn!(dst = %endpoints.dst, error = %e, "Failed to remove corrupt destination");
        }
        Error::IntegrityMismatch(message)
    }

    /// Verify a streamed transfer against the destination, then the source
    async fn verify_stream(
        &self,
        ctx: &JobContext,
        endpoints: &Endpoints<'_>,
        digests: &Digests,
        descriptor: &ObjectDescriptor,
        bytes: u64,
    ) -> Result<()> {
        if let Some(actual) = descriptor.size
            && actual != bytes
        {
            let message = format!(
                "{}: wrote {bytes} bytes, destination reports {actual}",
                endpoints.dst
            );
            return Err(self.reject(endpoints, message).await);
        }
        if !ctx.job().options.verify {
            return Ok(());
        }

        match digests.verify(descriptor.content_checksum.as_ref()) {
            Verification::Match => return Ok(()),
            Verification::Mismatch { expected, actual } => {
                let message = format!(
                    "{}: destination reports {expected}, computed {actual}",
                    endpoints.dst
                );
                return Err(self.reject(endpoints, message).await);
            }
            Verification::Unverified => {}
        }

        let source_info = self
            .call(|| endpoints.source.stat(endpoints.src))
            .await?;
        match digests.verify(source_info.content_checksum.as_ref()) {
            Verification::Match => Ok(()),
            Verification::Mismatch { expected, actual } => {
                let message = format!(
                    "{}: source reports {expected}, computed {actual}",
                    endpoints.src
                );
                Err(self.reject(endpoints, message).await)
            }
            Verification::Unverified => {
                tracing::warn!(
                    src = %endpoints.src,
                    dst = %endpoints.dst,
                    "Neither side reported a comparable checksum; transfer not verified"
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PartLayout {
    part_size: u64,
    part_count: u64,
    concurrency: usize,
    total: u64,
}

struct Endpoints<'a> {
    source: &'a dyn ObjectStore,
    dest: &'a dyn ObjectStore,
    src: &'a ResourceUri,
    dst: &'a ResourceUri,
}

enum Pumped {
    Finished { digests: Digests, bytes: u64 },
    Paused,
}

#[async_trait]
impl JobRunner for TransferExecutor {
    async fn run(&self, ctx: JobContext) -> RunOutcome {
        let result = self.execute(&ctx).await;
        let job = ctx.job();
        match result {
            Ok(Step::Done) => {
                self.forget_checkpoints(job).await;
                RunOutcome::Completed
            }
            Ok(Step::Paused(checkpoint)) => RunOutcome::Paused(checkpoint),
            Err(Error::Canceled) => {
                self.forget_checkpoints(job).await;
                RunOutcome::Canceled
            }
            Err(e) => {
                self.forget_checkpoints(job).await;
                RunOutcome::Failed(e)
            }
        }
    }

    async fn discard(&self, job: Job, checkpoint: Option<ResumeCheckpoint>) -> Result<()> {
        let token = checkpoint.and_then(|c| c.provider_resume_token);
        if let (Some(plan), Some(token), Some(dst)) = (&job.plan, token, &job.destination) {
            let dest = self.registry.resolve(dst)?;
            match &plan.strategy {
                Strategy::StreamThroughClient {
                    resumable: true, ..
                } => match dest.resume_upload(dst, &token).await {
                    Ok(session) => session.abort().await?,
                    Err(e) => {
                        tracing::debug!(job_id = %job.id, error = %e, "No upload session left to abort");
                    }
                },
                Strategy::MultipartCopy { .. } => {
                    if let Some(multipart) = dest.multipart_copy() {
                        multipart.abort_multipart(dst, &token).await?;
                    }
                }
                _ => {}
            }
        }
        self.forget_checkpoints(&job).await;
        tracing::debug!(job_id = %job.id, "Discarded paused job");
        Ok(())
    }
}
