use crate::database::BundleState;
use crate::download::{DownloadProgress, TransferId, UpdateState};
use crate::task::{Loaded, Step, TaskContext, TaskEnv, TaskStateMachine};
use crate::LoadError;
use std::path::PathBuf;

enum DownloadPhase {
    Start,
    // Group was paused when the task started, nothing has been requested yet
    Paused,
    Transferring(TransferId),
    Verifying(TransferId),
    Done,
}

/// Fetches one bundle into the read-write root: transfer into a temp file (resuming a partial one),
/// verify length then checksum, and publish by replacing the final file with the temp file.
pub struct DownloadTask {
    bundle: String,
    group: String,
    url: String,
    final_path: PathBuf,
    temp_path: PathBuf,
    expected_length: u64,
    expected_checksum: String,
    previous_state: BundleState,
    attempts: u32,
    max_attempts: u32,
    downloaded: u64,
    phase: DownloadPhase,
}

impl DownloadTask {
    pub fn new(bundle: String) -> Self {
        DownloadTask {
            bundle,
            group: String::default(),
            url: String::default(),
            final_path: PathBuf::default(),
            temp_path: PathBuf::default(),
            expected_length: 0,
            expected_checksum: String::default(),
            previous_state: BundleState::Missing,
            attempts: 0,
            max_attempts: 1,
            downloaded: 0,
            phase: DownloadPhase::Start,
        }
    }

    fn start_attempt(
        &mut self,
        ctx: &mut TaskContext,
    ) -> Step {
        self.attempts += 1;
        log::debug!(
            "Download of {} attempt {}/{}",
            self.bundle,
            self.attempts,
            self.max_attempts
        );

        if let Some(info) = ctx.database.bundle_mut(&self.bundle) {
            info.state = BundleState::Downloading;
        }
        ctx.downloads.set_update_state(
            &self.bundle,
            &self.group,
            UpdateState::Updating,
            self.expected_length,
        );

        // Left complete by a transfer that was stopped before it could be published
        let partial_length = self.temp_file_length();
        if partial_length > 0 && partial_length >= self.expected_length {
            log::debug!(
                "{:?} already holds {} bytes, verifying it",
                self.temp_path,
                partial_length
            );
            self.downloaded = partial_length;
            let id = ctx.downloads.start_verify(self.temp_path.clone());
            self.phase = DownloadPhase::Verifying(id);
            return Step::Pending;
        }

        let id = ctx
            .downloads
            .start_transfer(self.url.clone(), self.temp_path.clone());
        self.phase = DownloadPhase::Transferring(id);
        Step::Pending
    }

    fn temp_file_length(&self) -> u64 {
        std::fs::metadata(&self.temp_path)
            .map(|x| x.len())
            .unwrap_or(0)
    }

    fn report_progress(
        &mut self,
        ctx: &mut TaskContext,
        id: TransferId,
    ) {
        if let Some((delta, downloaded)) = ctx.downloads.take_progress(id) {
            self.downloaded = downloaded;
            ctx.downloads.report_progress(DownloadProgress {
                bundle: self.bundle.clone(),
                group: self.group.clone(),
                delta,
                downloaded,
                total: self.expected_length,
            });
        }
    }

    fn attempt_failed(
        &mut self,
        ctx: &mut TaskContext,
        error: LoadError,
    ) -> Step {
        if self.attempts < self.max_attempts {
            log::warn!(
                "Download of {} failed on attempt {}, retrying: {}",
                self.bundle,
                self.attempts,
                error
            );
            return self.start_attempt(ctx);
        }

        log::error!(
            "Download of {} failed after {} attempts: {}",
            self.bundle,
            self.attempts,
            error
        );
        self.restore_state(ctx);
        ctx.downloads.set_update_state(
            &self.bundle,
            &self.group,
            UpdateState::Failed,
            self.expected_length,
        );
        self.phase = DownloadPhase::Done;
        Step::Finished(Err(LoadError::TransferFailed {
            bundle: self.bundle.clone(),
            reason: error.to_string(),
        }))
    }

    fn restore_state(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        if let Some(info) = ctx.database.bundle_mut(&self.bundle) {
            info.state = self.previous_state;
        }
        ctx.database.refresh_bundle_state(&self.bundle, &*ctx.io);
    }

    fn discard_temp_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            log::warn!("Could not delete {:?}: {}", self.temp_path, e);
        }
    }

    fn publish(&mut self) -> std::io::Result<()> {
        if self.final_path.exists() {
            std::fs::remove_file(&self.final_path)?;
        }
        std::fs::rename(&self.temp_path, &self.final_path)
    }

    fn on_verified(
        &mut self,
        ctx: &mut TaskContext,
        length: u64,
        checksum: String,
    ) -> Step {
        if length != self.expected_length {
            self.discard_temp_file();
            let error = LoadError::StringError(format!(
                "downloaded {} bytes, expected {}",
                length, self.expected_length
            ));
            return self.attempt_failed(ctx, error);
        }

        if checksum != self.expected_checksum {
            self.discard_temp_file();
            let error = LoadError::ChecksumMismatch {
                bundle: self.bundle.clone(),
                expected: self.expected_checksum.clone(),
                actual: checksum,
            };
            return self.attempt_failed(ctx, error);
        }

        if let Err(e) = self.publish() {
            log::error!("Could not publish {:?}: {}", self.final_path, e);
            return self.attempt_failed(ctx, e.into());
        }

        if let Some(info) = ctx.database.bundle_mut(&self.bundle) {
            info.state = BundleState::InReadWrite;
            info.local_path = self.final_path.clone();
        }
        ctx.downloads.set_update_state(
            &self.bundle,
            &self.group,
            UpdateState::Updated,
            self.expected_length,
        );
        log::info!("Bundle {} downloaded to {:?}", self.bundle, self.final_path);
        self.phase = DownloadPhase::Done;
        Step::Finished(Ok(Loaded::Downloaded(self.bundle.clone())))
    }
}

impl TaskStateMachine for DownloadTask {
    fn run(
        &mut self,
        ctx: &mut TaskContext,
        _env: &mut TaskEnv,
    ) -> Step {
        let base_url = match &ctx.config.download_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                return Step::Finished(Err(LoadError::TransferFailed {
                    bundle: self.bundle.clone(),
                    reason: "no download url is configured".to_string(),
                }))
            }
        };

        let (manifest, state) = match ctx.database.get_or_create_bundle_info(&self.bundle, &*ctx.io) {
            Ok(info) if info.is_external => {
                return Step::Finished(Err(LoadError::TransferFailed {
                    bundle: self.bundle.clone(),
                    reason: "external files cannot be downloaded".to_string(),
                }))
            }
            Ok(info) => (info.manifest.clone(), info.state),
            Err(e) => return Step::Finished(Err(e)),
        };

        let roots = ctx.database.roots();
        self.final_path = roots.read_write_path(&manifest);
        self.temp_path = cask_base::storage_path::download_temp_path(&self.final_path);
        self.url = format!(
            "{}/{}",
            base_url,
            cask_base::storage_path::bundle_relative_file_name(
                &manifest.name,
                &manifest.hash,
                roots.append_hash_to_name
            )
        );
        self.group = manifest.group;
        self.expected_length = manifest.length;
        self.expected_checksum = manifest.checksum;
        self.previous_state = state;
        self.max_attempts = 1 + ctx.config.max_download_retries;

        ctx.downloads.set_update_state(
            &self.bundle,
            &self.group,
            UpdateState::Waiting,
            self.expected_length,
        );

        // Only checked here, a transfer in flight is never interrupted by a pause
        if ctx.downloads.is_group_paused(&self.group) {
            log::debug!("Download of {} waiting on paused group '{}'", self.bundle, self.group);
            self.phase = DownloadPhase::Paused;
            return Step::Pending;
        }

        self.start_attempt(ctx)
    }

    fn update(
        &mut self,
        ctx: &mut TaskContext,
        _env: &mut TaskEnv,
    ) -> Step {
        match self.phase {
            DownloadPhase::Start | DownloadPhase::Done => Step::Pending,
            DownloadPhase::Paused => {
                if ctx.downloads.is_group_paused(&self.group) {
                    Step::Pending
                } else {
                    self.start_attempt(ctx)
                }
            }
            DownloadPhase::Transferring(id) => {
                self.report_progress(ctx, id);
                match ctx.downloads.take_transfer_result(id) {
                    None => Step::Pending,
                    Some(Err(e)) => {
                        // Partial bytes stay in the temp file so the next attempt resumes, unless
                        // there are already more than the bundle can hold
                        if self.temp_file_length() > self.expected_length {
                            self.discard_temp_file();
                        }
                        self.attempt_failed(ctx, e)
                    }
                    Some(Ok(length)) => {
                        log::debug!("Transfer of {} finished with {} bytes", self.bundle, length);
                        let id = ctx.downloads.start_verify(self.temp_path.clone());
                        self.phase = DownloadPhase::Verifying(id);
                        Step::Pending
                    }
                }
            }
            DownloadPhase::Verifying(id) => match ctx.downloads.take_verify_result(id) {
                None => Step::Pending,
                Some(Err(e)) => {
                    self.discard_temp_file();
                    self.attempt_failed(ctx, e)
                }
                Some(Ok((length, checksum))) => self.on_verified(ctx, length, checksum),
            },
        }
    }

    fn abandon(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        log::debug!("Download of {} abandoned", self.bundle);
        match self.phase {
            DownloadPhase::Transferring(id) | DownloadPhase::Verifying(id) => {
                ctx.downloads.abandon(id);
                self.restore_state(ctx);
            }
            _ => {}
        }
        if ctx.downloads.update_info(&self.bundle).is_some() {
            ctx.downloads.set_update_state(
                &self.bundle,
                &self.group,
                UpdateState::Failed,
                self.expected_length,
            );
        }
        self.phase = DownloadPhase::Done;
    }

    fn progress(&self) -> f32 {
        match self.phase {
            DownloadPhase::Done => 1.0,
            DownloadPhase::Verifying(_) => 0.99,
            _ if self.expected_length == 0 => 0.0,
            _ => (self.downloaded as f32 / self.expected_length as f32).min(0.99),
        }
    }
}
