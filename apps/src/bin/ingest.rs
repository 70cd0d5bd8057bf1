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
use apps::{
    CsvArgs, StoreArgs, WriteArgs, config_failure, init_logging, load_schema, print_section,
};
use clap::Parser;
use human_panic::setup_panic;
use ingest_core::{
    ConfigError, DatasetJob, IngestContext, IngestOptions, JobFile, ObjectStoreConfig,
    StorageTarget, run_all,
};
use log::info;
use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;
use std::{path::PathBuf, process::ExitCode, sync::Arc};

/// Ingests CSV datasets into an object store as Hive style partitioned Parquet.
///
/// Each dataset is read under an explicit schema, written below its target location in one
/// directory per value of the partition column, then read back and verified. Give either a
/// job file listing datasets or a single dataset on the command line.
#[derive(Parser, Debug)]
#[command(author, version)]
struct CmdLineArgs {
    /// JSON job file listing the datasets to ingest
    #[arg(short = 'j', long, conflicts_with_all = ["csv", "target", "partition_column", "schema"])]
    job: Option<PathBuf>,
    /// CSV file to ingest
    #[arg(long, required_unless_present = "job")]
    csv: Option<PathBuf>,
    /// Target location: `s3://<bucket>/<path>`, `file:///<path>` or a local directory
    #[arg(short = 't', long, required_unless_present = "job")]
    target: Option<String>,
    /// Column to partition by
    #[arg(short = 'p', long, required_unless_present = "job")]
    partition_column: Option<String>,
    /// Built-in schema name (employees, sales) or schema file path
    #[arg(short = 's', long, required_unless_present = "job")]
    schema: Option<String>,
    /// Dataset name, defaults to the CSV file name without extension
    #[arg(short = 'n', long)]
    name: Option<String>,
    #[command(flatten)]
    store: StoreArgs,
    #[command(flatten)]
    csv_format: CsvArgs,
    #[command(flatten)]
    write: WriteArgs,
}

/// Everything needed to start a run.
struct RunPlan {
    store: Option<ObjectStoreConfig>,
    options: IngestOptions,
    jobs: Vec<DatasetJob>,
}

fn plan(args: &CmdLineArgs) -> Result<RunPlan, ConfigError> {
    let builder = args
        .write
        .to_builder()
        .csv(args.csv_format.to_options()?);
    let cli_store = args.store.to_config();
    if let Some(job_path) = &args.job {
        let job = JobFile::load(job_path)?;
        return Ok(RunPlan {
            store: cli_store.or_else(|| job.object_store.clone()),
            options: job.options(builder)?,
            jobs: job.dataset_jobs()?,
        });
    }

    let missing = |flag: &str| ConfigError::InvalidOption(format!("--{flag} is required"));
    let csv = args.csv.clone().ok_or_else(|| missing("csv"))?;
    let target = args.target.as_deref().ok_or_else(|| missing("target"))?;
    let column = args
        .partition_column
        .clone()
        .ok_or_else(|| missing("partition-column"))?;
    let schema = load_schema(args.schema.as_deref().ok_or_else(|| missing("schema"))?)?;
    let name = args.name.clone().unwrap_or_else(|| {
        csv.file_stem()
            .map_or_else(|| "dataset".into(), |s| s.to_string_lossy().into_owned())
    });
    let target = StorageTarget::parse(target, column)?;
    target.validate_for(&name, &schema)?;
    Ok(RunPlan {
        store: cli_store,
        options: builder.build()?,
        jobs: vec![DatasetJob {
            name,
            csv,
            schema: Arc::new(schema),
            target,
        }],
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> color_eyre::Result<ExitCode> {
    // Install coloured errors
    color_eyre::install()?;

    // Install human readable panics
    setup_panic!();

    // Install and configure environment logger
    init_logging();

    let args = CmdLineArgs::parse();

    let plan = match plan(&args) {
        Ok(plan) => plan,
        Err(e) => return Ok(config_failure(&e)),
    };
    let ctx = match IngestContext::new(plan.store.as_ref(), plan.options) {
        Ok(ctx) => ctx,
        Err(e) => return Ok(config_failure(&e)),
    };

    let outcome = run_all(&ctx, &plan.jobs).await;
    ctx.shutdown();

    for report in &outcome.reports {
        print_section(
            &format!("Dataset \"{}\" read back (first rows)", report.dataset),
            &report.preview,
        );
        println!(
            "{} {} rows in {} partitions, {} files, run {}",
            "Verified".green().bold(),
            report
                .verification
                .observed_rows
                .to_formatted_string(&Locale::en),
            report.write.partitions + report.write.kept_partitions,
            report.write.files,
            report.write.run_id
        );
    }
    for failure in &outcome.failures {
        eprintln!("{} {failure}", "Failed:".red().bold());
    }
    if !outcome.skipped.is_empty() {
        eprintln!(
            "{} {}",
            "Not attempted:".yellow().bold(),
            outcome.skipped.join(", ")
        );
    }
    info!(
        "Ingested {} of {} datasets",
        outcome.reports.len(),
        plan.jobs.len()
    );
    Ok(ExitCode::from(outcome.exit_code()))
}
