//! Drives datasets through reading, encoding, writing and verification.
/*
 * Copyright 2022-2025 Crown Copyright
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use crate::{
    config::ConfigError,
    context::IngestContext,
    dataset::Dataset,
    encoder::EncodeError,
    reader::{ReadError, read_csv},
    schema::DatasetSchema,
    target::StorageTarget,
    verifier::{self, VerificationError, VerificationResult},
    writer::{PartitionedWriter, WriteError, WriteSummary},
};
use log::{error, info, warn};
use num_format::{Locale, ToFormattedString};
use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Rows shown in the preview of read back data.
pub const PREVIEW_ROWS: usize = 3;

/// Rows of each source dataset logged once it has been read.
pub const SOURCE_PREVIEW_ROWS: usize = 5;

/// Exit code of a successful run.
pub const EXIT_SUCCESS: u8 = 0;

/// Steps a dataset goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuring,
    Reading,
    Encoding,
    Writing,
    Verifying,
}

impl Stage {
    /// Process exit code reported when this stage fails.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Configuring => 2,
            Self::Reading => 3,
            Self::Encoding => 4,
            Self::Writing => 5,
            Self::Verifying => 6,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Configuring => "configuring",
            Self::Reading => "reading",
            Self::Encoding => "encoding",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Running(Stage),
    Succeeded,
    Failed(Stage),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Verify(#[from] VerificationError),
}

/// A dataset that failed, the stage it failed in and why.
#[derive(Error, Debug)]
#[error("dataset \"{dataset}\" failed while {stage}: {source}")]
pub struct PipelineError {
    pub dataset: String,
    pub stage: Stage,
    #[source]
    pub source: IngestError,
}

impl PipelineError {
    /// Process exit code for this failure.
    ///
    /// Configuration problems map to the configuring code wherever they are
    /// found. Everything else maps to the code of the stage that failed.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match &self.source {
            IngestError::Config(_)
            | IngestError::Write(WriteError::Config(_))
            | IngestError::Verify(VerificationError::Config(_)) => Stage::Configuring.exit_code(),
            _ => self.stage.exit_code(),
        }
    }

    /// True if the dataset could not be read. Jobs with more datasets carry on
    /// after such failures.
    #[must_use]
    pub fn is_read_error(&self) -> bool {
        matches!(self.source, IngestError::Read(_))
    }
}

/// One dataset to ingest.
#[derive(Debug, Clone)]
pub struct DatasetJob {
    pub name: String,
    pub csv: PathBuf,
    pub schema: Arc<DatasetSchema>,
    pub target: StorageTarget,
}

impl Display for DatasetJob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dataset \"{}\" from {} to {}",
            self.name,
            self.csv.display(),
            self.target
        )
    }
}

/// Outcome of ingesting one dataset.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub dataset: String,
    pub rows_read: usize,
    pub write: WriteSummary,
    pub verification: VerificationResult,
    /// First rows of the read back data as a text table
    pub preview: String,
    pub elapsed: Duration,
}

impl Display for IngestReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dataset \"{}\": read {} rows, {}, verified {} rows in {:.3} seconds",
            self.dataset,
            self.rows_read.to_formatted_string(&Locale::en),
            self.write,
            self.verification
                .observed_rows
                .to_formatted_string(&Locale::en),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Runs the stages of ingestion for one dataset at a time, recording each state
/// it passes through.
///
/// A failed run is never resumed. Running the same job again is the recovery
/// path and is idempotent under [`crate::WriteMode::Overwrite`].
#[derive(Debug)]
pub struct Pipeline<'a> {
    ctx: &'a IngestContext,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl<'a> Pipeline<'a> {
    #[must_use]
    pub fn new(ctx: &'a IngestContext) -> Self {
        Self {
            ctx,
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// States of the latest run, starting from [`PipelineState::Idle`].
    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn reset(&mut self) {
        self.state = PipelineState::Idle;
        self.history = vec![PipelineState::Idle];
    }

    fn enter(&mut self, state: PipelineState) {
        self.state = state;
        self.history.push(state);
    }

    fn fail(
        &mut self,
        job: &DatasetJob,
        stage: Stage,
        source: impl Into<IngestError>,
    ) -> PipelineError {
        self.enter(PipelineState::Failed(stage));
        let err = PipelineError {
            dataset: job.name.clone(),
            stage,
            source: source.into(),
        };
        error!("{err}");
        err
    }

    fn configure(&mut self, job: &DatasetJob) -> Result<(), PipelineError> {
        self.enter(PipelineState::Running(Stage::Configuring));
        job.target
            .validate_for(&job.name, &job.schema)
            .and_then(|()| self.ctx.store_for(&job.target).map(|_| ()))
            .map_err(|e| self.fail(job, Stage::Configuring, e))
    }

    fn read(&mut self, job: &DatasetJob) -> Result<Dataset, PipelineError> {
        self.enter(PipelineState::Running(Stage::Reading));
        let dataset = read_csv(
            &job.name,
            &job.csv,
            job.schema.clone(),
            self.ctx.options().csv(),
        )
        .map_err(|e| self.fail(job, Stage::Reading, e))?;
        info!("Schema of dataset \"{}\":\n{}", job.name, dataset.schema());
        match dataset.preview(SOURCE_PREVIEW_ROWS) {
            Ok(preview) => info!("First rows of dataset \"{}\":\n{preview}", job.name),
            Err(e) => warn!("Can't preview dataset \"{}\": {e}", job.name),
        }
        Ok(dataset)
    }

    /// Read, encode, write and verify one dataset.
    ///
    /// # Errors
    /// The first stage to fail stops the run and is named in the error.
    pub async fn run(&mut self, job: &DatasetJob) -> Result<IngestReport, PipelineError> {
        self.reset();
        let started = Instant::now();
        info!("Ingesting {job}");
        self.configure(job)?;
        let dataset = self.read(job)?;

        self.enter(PipelineState::Running(Stage::Encoding));
        let writer = PartitionedWriter::new(self.ctx);
        let encoded = writer
            .encode(&dataset, &job.target)
            .map_err(|e| self.fail(job, Stage::Encoding, e))?;

        self.enter(PipelineState::Running(Stage::Writing));
        let write = match writer.upload(&encoded, &job.target).await {
            Ok(summary) => summary,
            Err(e) => return Err(self.fail(job, Stage::Writing, e)),
        };
        drop(encoded);

        self.enter(PipelineState::Running(Stage::Verifying));
        let (verification, preview) = match self.verify_dataset(&dataset, &job.target).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(job, Stage::Verifying, e)),
        };

        self.enter(PipelineState::Succeeded);
        let report = IngestReport {
            dataset: job.name.clone(),
            rows_read: dataset.num_rows(),
            write,
            verification,
            preview,
            elapsed: started.elapsed(),
        };
        info!("Finished {report}");
        Ok(report)
    }

    /// Check a dataset already written to the job's target against its CSV
    /// source without writing anything.
    ///
    /// # Errors
    /// If configuration, reading or verification fails.
    pub async fn verify_only(
        &mut self,
        job: &DatasetJob,
    ) -> Result<(VerificationResult, String), PipelineError> {
        self.reset();
        info!("Verifying {job}");
        self.configure(job)?;
        let dataset = self.read(job)?;
        self.enter(PipelineState::Running(Stage::Verifying));
        match self.verify_dataset(&dataset, &job.target).await {
            Ok(outcome) => {
                self.enter(PipelineState::Succeeded);
                Ok(outcome)
            }
            Err(e) => Err(self.fail(job, Stage::Verifying, e)),
        }
    }

    async fn verify_dataset(
        &self,
        dataset: &Dataset,
        target: &StorageTarget,
    ) -> Result<(VerificationResult, String), VerificationError> {
        let read_back = verifier::read_back(self.ctx, target).await?;
        let result = verifier::check(dataset, &read_back)?;
        let preview = read_back
            .dataset
            .preview(PREVIEW_ROWS)
            .map_err(|source| VerificationError::Rebuild {
                location: target.location().to_string(),
                source,
            })?;
        info!(
            "Verified dataset \"{}\": {} rows, schema match {}",
            dataset.name(),
            result.observed_rows.to_formatted_string(&Locale::en),
            result.schema_match
        );
        Ok((result, preview))
    }
}

/// Results of a job of one or more datasets.
#[derive(Debug, Default)]
pub struct JobOutcome {
    pub reports: Vec<IngestReport>,
    pub failures: Vec<PipelineError>,
    /// Datasets not attempted because an earlier one failed
    pub skipped: Vec<String>,
}

impl JobOutcome {
    /// Exit code of the first failure, or success.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.failures
            .first()
            .map_or(EXIT_SUCCESS, PipelineError::exit_code)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ingest every dataset in turn.
///
/// A dataset that can't be read is reported and the job moves on to the next
/// one. Any other failure stops the job.
pub async fn run_all(ctx: &IngestContext, jobs: &[DatasetJob]) -> JobOutcome {
    let mut outcome = JobOutcome::default();
    let mut pipeline = Pipeline::new(ctx);
    let mut remaining = jobs.iter();
    for job in remaining.by_ref() {
        match pipeline.run(job).await {
            Ok(report) => outcome.reports.push(report),
            Err(e) if e.is_read_error() => {
                error!("Skipping dataset \"{}\"", job.name);
                outcome.failures.push(e);
            }
            Err(e) => {
                outcome.failures.push(e);
                break;
            }
        }
    }
    outcome.skipped = remaining.map(|job| job.name.clone()).collect();
    if !outcome.skipped.is_empty() {
        error!(
            "Not ingesting {} after an earlier failure",
            outcome.skipped.join(", ")
        );
    }
    info!(
        "Job finished: {} of {} datasets ingested",
        outcome.reports.len(),
        jobs.len()
    );
    outcome
}
