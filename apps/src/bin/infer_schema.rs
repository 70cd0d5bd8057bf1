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
use apps::{CsvArgs, EXIT_CONFIG, config_failure, init_logging, print_section};
use clap::Parser;
use human_panic::setup_panic;
use ingest_core::{Stage, infer_schema};
use log::info;
use owo_colors::OwoColorize;
use std::{path::PathBuf, process::ExitCode};

/// Infers a schema from a CSV file and saves it for later ingestion runs.
///
/// Inference happens once: the saved file is passed to `ingest --schema` and is never
/// re-inferred. An existing schema file is only replaced with `--force`.
#[derive(Parser, Debug)]
#[command(author, version)]
struct CmdLineArgs {
    /// CSV file to inspect
    csv: PathBuf,
    /// Schema file to write
    #[arg(short = 'o', long)]
    output: PathBuf,
    /// Rows to inspect, all rows if not given
    #[arg(short = 'r', long)]
    max_records: Option<usize>,
    /// Replace an existing schema file
    #[arg(short = 'f', long)]
    force: bool,
    #[command(flatten)]
    csv_format: CsvArgs,
}

fn main() -> color_eyre::Result<ExitCode> {
    // Install coloured errors
    color_eyre::install()?;

    // Install human readable panics
    setup_panic!();

    // Install and configure environment logger
    init_logging();

    let args = CmdLineArgs::parse();

    let options = match args.csv_format.to_options() {
        Ok(options) => options,
        Err(e) => return Ok(config_failure(&e)),
    };
    if args.output.exists() && !args.force {
        eprintln!(
            "{} {} already exists, use --force to replace it",
            "Not inferring:".red().bold(),
            args.output.display()
        );
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    let schema = match infer_schema(&args.csv, &options, args.max_records) {
        Ok(schema) => schema,
        Err(e) => {
            eprintln!("{} {e}", "Could not infer schema:".red().bold());
            return Ok(ExitCode::from(Stage::Reading.exit_code()));
        }
    };
    schema.save(&args.output)?;
    info!(
        "Saved schema of {} columns to {}",
        schema.len(),
        args.output.display()
    );
    print_section("Inferred schema", &schema.to_string());
    Ok(ExitCode::SUCCESS)
}
