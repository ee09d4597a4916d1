use std::io::Write;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::NamedTempFile;

fn write_scenario(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    write!(file, "{contents}").expect("failed to write scenario");
    file
}

#[test]
fn validate_reports_a_well_formed_scenario() {
    let file = write_scenario(r#"<scenario name="ok"><step name="a" exec="true" /></scenario>"#);

    Command::cargo_bin("stc")
        .unwrap()
        .arg(file.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(contains("compiled"));
}

#[test]
fn validate_reports_a_dependency_cycle() {
    let file = write_scenario(
        r#"
<scenario name="cyclic">
  <step name="a" exec="true" requires="b" />
  <step name="b" exec="true" requires="a" />
</scenario>
"#,
    );

    Command::cargo_bin("stc")
        .unwrap()
        .arg(file.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(contains("cycle"));
}

#[test]
fn run_executes_a_linear_chain_and_exits_zero() {
    let file = write_scenario(
        r#"
<scenario name="linear">
  <step name="a" exec="true" />
  <step name="b" exec="true" requires="a" />
</scenario>
"#,
    );

    Command::cargo_bin("stc")
        .unwrap()
        .arg(file.path())
        .arg("run")
        .assert()
        .success()
        .stdout(contains("a"))
        .stdout(contains("b"));
}

#[test]
fn run_exits_nonzero_on_step_failure() {
    let file = write_scenario(r#"<scenario name="fails"><step name="a" exec="false" /></scenario>"#);

    Command::cargo_bin("stc")
        .unwrap()
        .arg(file.path())
        .arg("run")
        .assert()
        .failure();
}

#[test]
fn list_replays_the_status_record_from_the_last_run() {
    let file = write_scenario(
        r#"
<scenario name="listing">
  <step name="a" exec="true" />
  <step name="b" exec="true" requires="a" />
</scenario>
"#,
    );

    Command::cargo_bin("stc").unwrap().arg(file.path()).arg("run").assert().success();

    Command::cargo_bin("stc")
        .unwrap()
        .arg(file.path())
        .arg("list")
        .assert()
        .success()
        .stdout(contains("SUCCEEDED"))
        .stdout(contains("a"))
        .stdout(contains("b"));
}

#[test]
fn list_failed_replays_only_failed_events() {
    let file = write_scenario(
        r#"
<scenario name="listing-failed">
  <step name="a" exec="true" />
  <step name="b" exec="false" requires="a" />
</scenario>
"#,
    );

    Command::cargo_bin("stc").unwrap().arg(file.path()).arg("run").assert().failure();

    Command::cargo_bin("stc")
        .unwrap()
        .arg(file.path())
        .arg("listFailed")
        .assert()
        .success()
        .stdout(contains("b"));
}

#[test]
fn missing_scenario_file_is_a_fatal_error() {
    Command::cargo_bin("stc")
        .unwrap()
        .arg("/no/such/scenario.xml")
        .arg("validate")
        .assert()
        .failure();
}
