use assert_cmd::Command;
use predicates::prelude::*;

const VALID_POLICY: &str = r#"{
  "bundles": [
    {
      "namespace": "default",
      "name": "main",
      "bundleType": "agent",
      "line": 1,
      "arguments": [],
      "promiseTypes": [
        {
          "line": 2,
          "name": "reports",
          "contexts": [
            {
              "name": "any",
              "promises": [
                { "line": 3, "promiser": "hello", "attributes": [] }
              ]
            }
          ]
        }
      ]
    }
  ],
  "bodies": [
    {
      "namespace": "default",
      "name": "control",
      "bodyType": "common",
      "line": 10,
      "arguments": [],
      "contexts": [
        {
          "name": "any",
          "attributes": [
            {
              "line": 11,
              "lval": "bundlesequence",
              "rval": { "type": "list", "value": [ { "type": "string", "value": "main" } ] }
            }
          ]
        }
      ]
    }
  ]
}"#;

fn warden() -> Command {
    Command::cargo_bin("warden").unwrap()
}

#[test]
fn check_accepts_a_valid_policy() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("policy.json");
    std::fs::write(&policy, VALID_POLICY).unwrap();

    warden()
        .arg("check")
        .arg(&policy)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn check_reports_validation_errors() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("policy.json");
    // A reserved bundle name is a semantic error.
    let bad = VALID_POLICY.replace("\"name\": \"main\"", "\"name\": \"this\"");
    std::fs::write(&policy, bad).unwrap();

    warden()
        .arg("check")
        .arg(&policy)
        .assert()
        .failure()
        .stderr(predicate::str::contains("reserved"));
}

#[test]
fn check_rejects_malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("policy.json");
    std::fs::write(&policy, "{ not json").unwrap();

    warden().arg("check").arg(&policy).assert().failure();
}

#[test]
fn show_policy_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("policy.json");
    std::fs::write(&policy, VALID_POLICY).unwrap();

    let output = warden()
        .arg("show-policy")
        .arg(&policy)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    // Emitted JSON is itself a loadable, identical policy.
    let emitted = dir.path().join("emitted.json");
    std::fs::write(&emitted, &output).unwrap();
    warden()
        .arg("show-policy")
        .arg(&emitted)
        .assert()
        .success()
        .stdout(String::from_utf8(output).unwrap());
}

#[test]
fn run_evaluates_reports() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("policy.json");
    std::fs::write(&policy, VALID_POLICY).unwrap();

    warden()
        .arg("--workdir")
        .arg(dir.path().join("workdir"))
        .arg("run")
        .arg(&policy)
        .assert()
        .success()
        .stdout(predicate::str::contains("outcome: noop"));
}

#[test]
fn run_honours_defined_classes() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("policy.json");
    // Guard the report behind a class supplied on the command line.
    let guarded = VALID_POLICY.replace("\"name\": \"any\",", "\"name\": \"maintenance\",");
    std::fs::write(&policy, guarded).unwrap();

    warden()
        .arg("--workdir")
        .arg(dir.path().join("workdir"))
        .arg("run")
        .arg(&policy)
        .arg("--define")
        .arg("maintenance")
        .assert()
        .success();
}
