//! Backup driver: mirror every claimed bucket into its backup target.

use crate::{
    mirror::{PairReport, RunOptions, mirror_bucket},
    models::bucket::BucketPair,
    pipeline::RunControl,
    services::{
        registry::{ClaimRegistry, CredentialResolver, RegistryError, TargetProvisioner},
        status_board::{JobPhase, PairSummary, StatusBoard},
        storage::StorageFactory,
    },
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("listing bucket pairs failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("bucket pairs {} failed", .0.join(", "))]
    PairsFailed(Vec<String>),
}

pub struct BackupJob {
    registry: Arc<dyn ClaimRegistry>,
    resolver: Arc<dyn CredentialResolver>,
    provisioner: Arc<dyn TargetProvisioner>,
    factory: Arc<dyn StorageFactory>,
    options: RunOptions,
    board: StatusBoard,
}

impl BackupJob {
    pub fn new(
        registry: Arc<dyn ClaimRegistry>,
        resolver: Arc<dyn CredentialResolver>,
        provisioner: Arc<dyn TargetProvisioner>,
        factory: Arc<dyn StorageFactory>,
        options: RunOptions,
    ) -> Self {
        Self {
            registry,
            resolver,
            provisioner,
            factory,
            options,
            board: StatusBoard::new(),
        }
    }

    pub fn with_status_board(mut self, board: StatusBoard) -> Self {
        self.board = board;
        self
    }

    pub fn status_board(&self) -> &StatusBoard {
        &self.board
    }

    /// Mirror every pair. One pair failing never stops the others; the error
    /// names all failed pairs.
    pub async fn run(&self, control: &RunControl) -> Result<Vec<PairReport>, BackupError> {
        let pairs = match self.registry.list_bucket_pairs().await {
            Ok(pairs) => pairs,
            Err(err) => {
                self.board.set_phase(JobPhase::Failed);
                return Err(err.into());
            }
        };
        info!(pairs = pairs.len(), "starting backup");
        self.board.set_phase(JobPhase::Running);

        let mut reports = Vec::with_capacity(pairs.len());
        let mut failed = Vec::new();

        for pair in &pairs {
            if control.is_draining() || control.is_aborted() {
                warn!(pair = %pair.source, "backup stopping, pair not attempted");
                failed.push(pair.source.to_string());
                continue;
            }

            match self.backup_pair(pair, control).await {
                Ok(report) if report.is_success() => reports.push(report),
                Ok(report) => {
                    failed.push(pair.source.to_string());
                    reports.push(report);
                }
                Err(err) => {
                    error!(source = %pair.source, target = %pair.target, error = %err, "backup of pair failed");
                    self.board.pair_finished(PairSummary {
                        name: pair.source.to_string(),
                        passes: 0,
                        uploaded: 0,
                        skipped: 0,
                        failed_keys: 0,
                        success: false,
                        error: Some(err.to_string()),
                    });
                    failed.push(pair.source.to_string());
                }
            }
        }

        if failed.is_empty() {
            self.board.set_phase(JobPhase::Succeeded);
            info!(pairs = reports.len(), "backup complete");
            Ok(reports)
        } else {
            self.board.set_phase(JobPhase::Failed);
            Err(BackupError::PairsFailed(failed))
        }
    }

    async fn backup_pair(
        &self,
        pair: &BucketPair,
        control: &RunControl,
    ) -> Result<PairReport, RegistryError> {
        info!(source = %pair.source, target = %pair.target, "working on bucket pair");

        let source_details = self.resolver.resolve(&pair.source).await?;
        self.provisioner.ensure_target(&pair.target).await?;
        let target_details = self.resolver.resolve(&pair.target).await?;

        let source = self.factory.open(&source_details).await?;
        let target = self.factory.open(&target_details).await?;

        Ok(mirror_bucket(
            &pair.source.to_string(),
            source,
            target,
            &self.options,
            control,
            Some(&self.board),
        )
        .await)
    }
}
