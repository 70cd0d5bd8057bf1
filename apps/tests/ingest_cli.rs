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

use assert_cmd::prelude::*;
use color_eyre::eyre::Result;
use predicates::prelude::*; // Used for writing assertions
use std::{path::Path, process::Command}; // Run programs
use tempfile::tempdir;

const EMPLOYEES: &str = "employee_id,name,department,salary,hire_date\n\
    1,Alice,Engineering,85000.0,2020-01-15\n\
    2,Bob,Sales,62000.5,2019-03-01\n\
    3,Carol,Engineering,91000.0,2021-07-19\n\
    4,Dan,HR,45000.0,2022-11-30\n";

fn command(bin: &str) -> Result<Command> {
    let mut cmd = Command::cargo_bin(bin)?;
    for var in [
        "INGEST_S3_ENDPOINT",
        "INGEST_S3_ACCESS_KEY",
        "INGEST_S3_SECRET_KEY",
        "INGEST_S3_REGION",
        "INGEST_S3_PATH_STYLE",
        "INGEST_S3_ALLOW_HTTP",
    ] {
        cmd.env_remove(var);
    }
    Ok(cmd)
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("UTF-8 temp path")
}

#[test]
fn unknown_schema_is_config_error() -> Result<()> {
    let mut cmd = command("ingest")?;
    cmd.args([
        "--csv",
        "/tmp/employees.csv",
        "--target",
        "/tmp/warehouse/employees",
        "--partition-column",
        "department",
        "--schema",
        "customers",
    ]);
    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("customers"));
    Ok(())
}

#[test]
fn unknown_partition_column_is_config_error() -> Result<()> {
    let mut cmd = command("ingest")?;
    cmd.args([
        "--csv",
        "/tmp/employees.csv",
        "--target",
        "/tmp/warehouse/employees",
        "--partition-column",
        "team",
        "--schema",
        "employees",
    ]);
    cmd.assert()
        .code(2)
        .stderr(predicate::str::contains("partition column \"team\""));
    Ok(())
}

#[test]
fn s3_target_without_credentials_is_config_error() -> Result<()> {
    let dir = tempdir()?;
    let csv = dir.path().join("employees.csv");
    std::fs::write(&csv, EMPLOYEES)?;
    let mut cmd = command("ingest")?;
    cmd.args([
        "--csv",
        path_str(&csv),
        "--target",
        "s3a://spark-data/employees",
        "--partition-column",
        "department",
        "--schema",
        "employees",
    ]);
    cmd.assert().code(2);
    Ok(())
}

#[test]
fn bad_value_is_read_error() -> Result<()> {
    let dir = tempdir()?;
    let csv = dir.path().join("employees.csv");
    std::fs::write(
        &csv,
        format!("{EMPLOYEES}five,Eve,HR,50000.0,2023-05-05\n"),
    )?;
    let target = dir.path().join("warehouse");
    let mut cmd = command("ingest")?;
    cmd.args([
        "--csv",
        path_str(&csv),
        "--target",
        path_str(&target),
        "--partition-column",
        "department",
        "--schema",
        "employees",
    ]);
    cmd.assert()
        .code(3)
        .stderr(predicate::str::contains("failed while reading"))
        .stderr(predicate::str::is_match(
            r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3} \[ERROR\] ",
        )?);
    assert!(!target.exists());
    Ok(())
}

#[test]
fn ingests_and_verifies_local_target() -> Result<()> {
    let dir = tempdir()?;
    let csv = dir.path().join("employees.csv");
    std::fs::write(&csv, EMPLOYEES)?;
    let target = dir.path().join("warehouse");
    let mut cmd = command("ingest")?;
    cmd.args([
        "--csv",
        path_str(&csv),
        "--target",
        path_str(&target),
        "--partition-column",
        "department",
        "--schema",
        "employees",
    ]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Verified"))
        .stdout(predicate::str::contains("Alice"));
    assert!(target.join("_manifest.json").is_file());
    assert!(target.join("department=Engineering").is_dir());

    let mut verify = command("verify")?;
    verify.args([
        path_str(&csv),
        path_str(&target),
        "--partition-column",
        "department",
        "--schema",
        "employees",
    ]);
    verify.assert().success();
    Ok(())
}

#[test]
fn verifying_empty_target_fails() -> Result<()> {
    let dir = tempdir()?;
    let csv = dir.path().join("employees.csv");
    std::fs::write(&csv, EMPLOYEES)?;
    let mut cmd = command("verify")?;
    cmd.args([
        path_str(&csv),
        path_str(&dir.path().join("nothing")),
        "--partition-column",
        "department",
        "--schema",
        "employees",
    ]);
    cmd.assert()
        .code(6)
        .stderr(predicate::str::contains("no committed dataset"));
    Ok(())
}

#[test]
fn job_file_runs_every_dataset() -> Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join("employees.csv"), EMPLOYEES)?;
    std::fs::write(dir.path().join("broken.csv"), "id,name\n1,x\n")?;
    let warehouse = dir.path().join("warehouse");
    let job = dir.path().join("job.json");
    std::fs::write(
        &job,
        format!(
            r#"{{"datasets": [
                {{"name": "broken", "csv": "broken.csv", "target": "{0}/broken",
                  "partition_column": "department", "schema": "employees"}},
                {{"name": "employees", "csv": "employees.csv", "target": "{0}/employees",
                  "partition_column": "department", "schema": "employees"}}
            ]}}"#,
            path_str(&warehouse)
        ),
    )?;
    let mut cmd = command("ingest")?;
    cmd.args(["--job", path_str(&job)]);
    cmd.assert()
        .code(3)
        .stdout(predicate::str::contains("Verified"))
        .stderr(predicate::str::contains("dataset \"broken\""));
    assert!(warehouse.join("employees/_manifest.json").is_file());
    Ok(())
}

#[test]
fn infers_schema_once() -> Result<()> {
    let dir = tempdir()?;
    let csv = dir.path().join("employees.csv");
    std::fs::write(&csv, EMPLOYEES)?;
    let output = dir.path().join("employees.schema.json");

    let mut cmd = command("infer_schema")?;
    cmd.args([path_str(&csv), "--output", path_str(&output)]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("|-- salary: float"));
    let saved = std::fs::read_to_string(&output)?;
    assert!(saved.contains("\"hire_date\""));
    assert!(saved.contains("\"date\""));

    let mut again = command("infer_schema")?;
    again.args([path_str(&csv), "--output", path_str(&output)]);
    again
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--force"));
    Ok(())
}
