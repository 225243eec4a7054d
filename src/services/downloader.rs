use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::{AssetError, Result};
use crate::models::{
    self, CacheEvent, CancelToken, Costume, FileOutcome, FileProgress, FileSpec, LinkMode,
    MaterializeOutcome, ModelProgress, ProgressUpdate,
};
use crate::services::api_client::DownloadOpen;
use crate::services::cache_manager::AtomicFile;
use crate::services::{ApiClient, AssetCache, CostumeService};

pub const MANIFEST_FILE: &str = "model.json";

pub type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Serializes every progress emission through one mutex so concurrent
/// workers never interleave inside the caller's callback.
#[derive(Clone)]
struct ProgressReporter {
    sink: Arc<Mutex<Option<ProgressSink>>>,
}

impl ProgressReporter {
    fn new(sink: Option<ProgressSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    fn emit_file(&self, file: &str, bytes_done: u64, bytes_total: Option<u64>) {
        self.emit(ProgressUpdate {
            file: Some(FileProgress {
                file: file.to_string(),
                bytes_done,
                bytes_total,
            }),
            model: None,
        });
    }

    fn emit_model(&self, files_done: usize, files_total: usize) {
        self.emit(ProgressUpdate {
            file: None,
            model: Some(ModelProgress {
                files_done,
                files_total,
            }),
        });
    }

    fn emit(&self, update: ProgressUpdate) {
        if let Ok(guard) = self.sink.lock() {
            if let Some(sink) = guard.as_ref() {
                sink(update);
            }
        }
    }
}

/// Drives one costume's full file set to completion under a bounded worker
/// pool, then writes the generated manifest.
#[derive(Clone)]
pub struct Downloader {
    api: ApiClient,
    assets: Option<AssetCache>,
    costumes: CostumeService,
    max_workers: usize,
    link_mode: LinkMode,
}

impl Downloader {
    pub fn new(
        api: ApiClient,
        assets: Option<AssetCache>,
        costumes: CostumeService,
        settings: &Settings,
    ) -> Self {
        Self {
            api,
            assets,
            costumes,
            max_workers: settings.max_workers.max(1),
            link_mode: settings.link_mode,
        }
    }

    /// Build the costume from remote metadata, then download it.
    pub async fn fetch_costume(
        &self,
        bundle: &str,
        root_dir: &Path,
        overwrite: bool,
        cancel: CancelToken,
        progress: Option<ProgressSink>,
    ) -> Result<PathBuf> {
        let costume = self.costumes.build_costume(bundle).await?;
        self.download_costume(&costume, root_dir, overwrite, cancel, progress)
            .await
    }

    pub async fn download_costume(
        &self,
        costume: &Costume,
        root_dir: &Path,
        overwrite: bool,
        cancel: CancelToken,
        progress: Option<ProgressSink>,
    ) -> Result<PathBuf> {
        let session = Uuid::new_v4();
        if costume.name.contains('/') {
            return Err(AssetError::PathSecurity(format!(
                "costume name is not a single path segment: {}",
                costume.name
            )));
        }
        let model_dir = models::secure_join(root_dir, &costume.name)?;
        std::fs::create_dir_all(&model_dir)?;

        let total = costume.files.len();
        tracing::info!(
            "costume download started session_id={} costume={} files={}",
            session,
            costume.name,
            total
        );

        let reporter = ProgressReporter::new(progress);
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let (tx, mut rx) =
            mpsc::channel::<std::result::Result<(usize, FileOutcome), AssetError>>(total.max(1));

        for (index, spec) in costume.files.iter().cloned().enumerate() {
            let downloader = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let reporter = reporter.clone();
            let model_dir = model_dir.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| AssetError::Config("worker pool closed".to_string()))?;
                    downloader
                        .download_one(&spec, &model_dir, overwrite, &cancel, &reporter)
                        .await
                }
                .await;
                let _ = tx.send(result.map(|outcome| (index, outcome))).await;
            });
        }
        drop(tx);

        let mut failure: Option<AssetError> = None;
        let mut done = 0usize;
        while let Some(result) = rx.recv().await {
            match result {
                Ok((_, outcome)) => {
                    done += 1;
                    reporter.emit_model(done, total);
                    tracing::debug!(
                        "file finished session_id={} outcome={:?} ({}/{})",
                        session,
                        outcome,
                        done,
                        total
                    );
                }
                Err(err) => {
                    if failure.is_none() {
                        // first failure wins; stop work that has not started yet
                        cancel.cancel();
                        failure = Some(err);
                    } else if !err.is_cancelled() {
                        tracing::warn!(
                            "additional file failure session_id={}: {}",
                            session,
                            err
                        );
                    }
                }
            }
        }

        if let Some(err) = failure {
            tracing::warn!(
                "costume download failed session_id={} costume={}: {}",
                session,
                costume.name,
                err
            );
            return Err(err);
        }

        let missing = missing_required(costume, &model_dir);
        if !missing.is_empty() {
            return Err(AssetError::MissingFiles(missing));
        }

        let manifest = CostumeService::render_model_json(costume, &model_dir);
        let text = serde_json::to_string_pretty(&manifest)?;
        let manifest_path = model_dir.join(MANIFEST_FILE);
        let mut file = AtomicFile::begin(&manifest_path)?;
        file.write_chunk(text.as_bytes())?;
        file.commit()?;

        tracing::info!(
            "costume download finished session_id={} costume={} dir={}",
            session,
            costume.name,
            model_dir.display()
        );
        Ok(model_dir)
    }

    async fn download_one(
        &self,
        spec: &FileSpec,
        model_dir: &Path,
        overwrite: bool,
        cancel: &CancelToken,
        reporter: &ProgressReporter,
    ) -> Result<FileOutcome> {
        cancel.check()?;
        // the path gate runs before any network or filesystem work
        let dest = models::secure_join(model_dir, &spec.dest)?;
        if dest.exists() && !overwrite {
            tracing::debug!("destination exists, skipping file={}", spec.dest);
            return Ok(FileOutcome::Skipped);
        }

        let url = self.api.asset_url(&spec.source.bundle, &spec.source.file);
        match &self.assets {
            Some(assets) => {
                let api = self.api.clone();
                let open_url = url.clone();
                let allow_not_found = spec.optional;
                let file_label = spec.dest.clone();
                let file_reporter = reporter.clone();
                let result = assets
                    .get_or_download(
                        &spec.source,
                        move || async move { api.open_download(&open_url, allow_not_found).await },
                        spec.optional,
                        cancel,
                        move |done, total| file_reporter.emit_file(&file_label, done, total),
                    )
                    .await?;

                match result.event {
                    CacheEvent::MissingOptional => Ok(FileOutcome::MissingOptional),
                    event => {
                        let cache_path = result.path.ok_or_else(|| {
                            AssetError::Config("cache result carries no path".to_string())
                        })?;
                        let outcome =
                            assets.materialize_to(&cache_path, &dest, self.link_mode, overwrite)?;
                        tracing::debug!(
                            "file materialized file={} cache_event={:?} outcome={:?}",
                            spec.dest,
                            event,
                            outcome
                        );
                        Ok(match outcome {
                            MaterializeOutcome::Linked => FileOutcome::Linked,
                            MaterializeOutcome::Copied => FileOutcome::Copied,
                            MaterializeOutcome::Skipped => FileOutcome::Skipped,
                        })
                    }
                }
            }
            None => {
                // cache layer disabled: stream straight into the destination
                cancel.check()?;
                match self.api.open_download(&url, spec.optional).await? {
                    DownloadOpen::NotFound => Ok(FileOutcome::MissingOptional),
                    DownloadOpen::Stream(mut stream) => {
                        let total = stream.total_bytes();
                        let mut file = AtomicFile::begin(&dest)?;
                        let mut done = 0u64;
                        while let Some(chunk) = stream.next_chunk().await? {
                            cancel.check()?;
                            file.write_chunk(&chunk)?;
                            done += chunk.len() as u64;
                            reporter.emit_file(&spec.dest, done, total);
                        }
                        file.commit()?;
                        tracing::debug!("file downloaded directly file={} bytes={}", spec.dest, done);
                        Ok(FileOutcome::DirectDownload)
                    }
                }
            }
        }
    }
}

fn missing_required(costume: &Costume, model_dir: &Path) -> Vec<String> {
    costume
        .files
        .iter()
        .filter(|spec| !spec.optional)
        .filter(|spec| !model_dir.join(&spec.dest).is_file())
        .map(|spec| spec.dest.clone())
        .collect()
}
