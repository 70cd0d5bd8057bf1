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
use apps::{CsvArgs, StoreArgs, config_failure, init_logging, load_schema, print_section};
use clap::Parser;
use human_panic::setup_panic;
use ingest_core::{
    ConfigError, DatasetJob, IngestContext, IngestOptionsBuilder, Pipeline, RetryPolicy,
    StorageTarget,
};
use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;
use std::{path::PathBuf, process::ExitCode, sync::Arc};

/// Verifies a dataset already written to an object store against its CSV source.
///
/// The committed partitions are read back, the partition column is restored from the
/// directory names and the row count and columns are compared with the CSV file read under
/// the same schema. Nothing is written.
#[derive(Parser, Debug)]
#[command(author, version)]
struct CmdLineArgs {
    /// CSV file the dataset was ingested from
    csv: PathBuf,
    /// Location the dataset was written to
    target: String,
    /// Column the dataset is partitioned by
    #[arg(short = 'p', long)]
    partition_column: String,
    /// Built-in schema name (employees, sales) or schema file path
    #[arg(short = 's', long)]
    schema: String,
    /// Dataset name, defaults to the CSV file name without extension
    #[arg(short = 'n', long)]
    name: Option<String>,
    /// Attempts per object store request
    #[arg(long, default_value = "4")]
    retry_attempts: u32,
    #[command(flatten)]
    store: StoreArgs,
    #[command(flatten)]
    csv_format: CsvArgs,
}

fn setup(args: &CmdLineArgs) -> Result<(IngestContext, DatasetJob), ConfigError> {
    let schema = load_schema(&args.schema)?;
    let name = args.name.clone().unwrap_or_else(|| {
        args.csv
            .file_stem()
            .map_or_else(|| "dataset".into(), |s| s.to_string_lossy().into_owned())
    });
    let target = StorageTarget::parse(&args.target, args.partition_column.clone())?;
    let options = IngestOptionsBuilder::new()
        .csv(args.csv_format.to_options()?)
        .retry(RetryPolicy {
            max_attempts: args.retry_attempts,
            ..RetryPolicy::default()
        })
        .build()?;
    let ctx = IngestContext::new(args.store.to_config().as_ref(), options)?;
    Ok((
        ctx,
        DatasetJob {
            name,
            csv: args.csv.clone(),
            schema: Arc::new(schema),
            target,
        },
    ))
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

    let (ctx, job) = match setup(&args) {
        Ok(setup) => setup,
        Err(e) => return Ok(config_failure(&e)),
    };

    let result = Pipeline::new(&ctx).verify_only(&job).await;
    ctx.shutdown();

    match result {
        Ok((verification, preview)) => {
            print_section(&format!("Dataset \"{}\" read back (first rows)", job.name), &preview);
            println!(
                "{} {} of {} rows, schema match {}",
                "Verified".green().bold(),
                verification
                    .observed_rows
                    .to_formatted_string(&Locale::en),
                verification
                    .expected_rows
                    .to_formatted_string(&Locale::en),
                verification.schema_match
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{} {e}", "Verification failed:".red().bold());
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}
