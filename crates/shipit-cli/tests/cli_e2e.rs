use std::fs;
use std::path::Path;

use assert_cmd::Command;
use insta::assert_snapshot;
use predicates::str::contains;
use serde_json::Value;
use tempfile::tempdir;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

fn shipit_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("shipit"));
    cmd.current_dir(dir).arg("--dir").arg(dir).env_remove("SHIPIT_ENCRYPT_KEY");
    cmd
}

fn normalize_output(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            if line.starts_with("plan_id: ") {
                "plan_id: <PLAN_ID>".to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn stdout_of(cmd: &mut Command) -> String {
    let out = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(out).expect("utf8")
}

/// Apply shipment `test-group` with `env` as its first environment.
fn seed(dir: &Path, env: &str) {
    let tree = format!(r#"{{"name": "test-group", "group": "tests", "environments": [{env}]}}"#);
    write_file(&dir.join("shipment.json"), &tree);
    shipit_cmd(dir).arg("apply").arg("shipment.json").assert().success();
}

#[test]
fn apply_creates_then_reports_no_changes() {
    let td = tempdir().expect("tempdir");
    write_file(
        &td.path().join("shipment.json"),
        r#"{"name": "test-group", "group": "tests", "environments": [
            {"name": "bar", "envVars": [{"name": "PORT", "value": 80}]}
        ]}"#,
    );

    let first = stdout_of(shipit_cmd(td.path()).arg("apply").arg("shipment.json"));
    assert!(first.starts_with("status: 201\n"));
    assert!(first.contains("summary: 3 to create, 0 to update, 0 unchanged, 0 to delete"));
    assert!(first.contains("audit_rows: 1"));
    assert!(td.path().join(".shipit/store.json").exists());

    let second = stdout_of(shipit_cmd(td.path()).arg("apply").arg("shipment.json"));
    assert!(second.starts_with("status: 200\n"));
    assert!(second.contains("summary: 0 to create, 0 to update, 3 unchanged, 0 to delete"));
    assert!(second.contains("audit_rows: 0"));
}

#[test]
fn plan_command_snapshot() {
    let td = tempdir().expect("tempdir");
    seed(td.path(), r#"{"name": "bar", "envVars": [{"name": "DEL", "value": "remove"}]}"#);
    write_file(
        &td.path().join("bar.json"),
        r#"{"name": "bar", "envVars": [{"name": "PORT", "value": 80}]}"#,
    );

    let stdout = stdout_of(
        shipit_cmd(td.path())
            .arg("plan")
            .arg("bar.json")
            .arg("--shipment")
            .arg("test-group"),
    );
    assert_snapshot!(
        normalize_output(&stdout),
        @r#"
plan_id: <PLAN_ID>
summary: 1 to create, 0 to update, 1 unchanged, 1 to delete

  1. destroy env_var test-group-bar-DEL
  2. upsert environment test-group-bar (unchanged)
  3. upsert env_var test-group-bar-PORT (created)
"#
    );

    let show = stdout_of(shipit_cmd(td.path()).arg("show").arg("test-group").arg("--env").arg("bar"));
    assert!(show.contains("DEL"), "plan must not write");
}

#[test]
fn show_redacts_hidden_values_unless_revealed() {
    let td = tempdir().expect("tempdir");
    seed(
        td.path(),
        r#"{"name": "bar", "envVars": [{"name": "SECRET", "value": "s3cr3t", "type": "hidden"}]}"#,
    );

    let hidden = stdout_of(shipit_cmd(td.path()).arg("show").arg("test-group").arg("--env").arg("bar"));
    assert!(hidden.contains("*******"));
    assert!(!hidden.contains("s3cr3t"));

    let revealed = stdout_of(
        shipit_cmd(td.path())
            .arg("show")
            .arg("test-group")
            .arg("--env")
            .arg("bar")
            .arg("--reveal"),
    );
    assert!(revealed.contains("s3cr3t"));
}

#[test]
fn envs_are_listed_by_name() {
    let td = tempdir().expect("tempdir");
    seed(td.path(), r#"{"name": "test2"}"#);
    for name in ["test0", "test1"] {
        write_file(&td.path().join("env.json"), &format!(r#"{{"name": "{name}"}}"#));
        shipit_cmd(td.path())
            .arg("apply")
            .arg("env.json")
            .arg("--shipment")
            .arg("test-group")
            .assert()
            .success();
    }

    let stdout = stdout_of(shipit_cmd(td.path()).arg("envs").arg("test-group"));
    assert_snapshot!(stdout.trim_end(), @r#"
test0
test1
test2
"#);
}

#[test]
fn logs_hide_secret_diffs_from_anonymous_readers() {
    let td = tempdir().expect("tempdir");
    seed(td.path(), r#"{"name": "bar"}"#);

    let anonymous = stdout_of(shipit_cmd(td.path()).arg("logs").arg("test-group").arg("bar"));
    assert!(anonymous.contains("cli test-group [hidden]"));
    assert!(anonymous.contains(r#""*******""#));

    let revealed = stdout_of(
        shipit_cmd(td.path())
            .arg("--user")
            .arg("alice")
            .arg("logs")
            .arg("test-group")
            .arg("bar")
            .arg("--reveal"),
    );
    assert!(revealed.contains(r#""op":"add""#));
}

#[test]
fn token_resolves_to_its_environment() {
    let td = tempdir().expect("tempdir");
    seed(td.path(), r#"{"name": "bar"}"#);

    let shown = stdout_of(
        shipit_cmd(td.path())
            .arg("show")
            .arg("test-group")
            .arg("--env")
            .arg("bar")
            .arg("--reveal"),
    );
    let env: Value = serde_json::from_str(&shown).expect("json");
    let token = env["buildToken"].as_str().expect("token").to_string();

    let stdout = stdout_of(shipit_cmd(td.path()).arg("token").arg(&token));
    assert_eq!(stdout.trim_end(), "test-group/bar");

    shipit_cmd(td.path())
        .arg("token")
        .arg("nope")
        .assert()
        .failure()
        .stderr(contains("no environment has this build token"));
}

#[test]
fn invalid_tree_reports_every_field_error() {
    let td = tempdir().expect("tempdir");
    write_file(
        &td.path().join("bad.json"),
        r#"{"name": "test-group", "environments": [{"name": "bar", "containers": [{"name": "web"}]}]}"#,
    );

    shipit_cmd(td.path())
        .arg("apply")
        .arg("bad.json")
        .assert()
        .failure()
        .stderr(contains("[error] group: is required"))
        .stderr(contains("[error] environments[0].containers[0].image: is required"))
        .stderr(contains("status 422"));
    assert!(!td.path().join(".shipit/store.json").exists());
}

#[test]
fn environment_of_missing_shipment_is_not_found() {
    let td = tempdir().expect("tempdir");
    write_file(&td.path().join("env.json"), r#"{"name": "bar"}"#);

    shipit_cmd(td.path())
        .arg("apply")
        .arg("env.json")
        .arg("--shipment")
        .arg("missing")
        .assert()
        .failure()
        .stderr(contains("[warn] rolling back environment `missing-bar`"))
        .stderr(contains("status 404"));
}

#[test]
fn config_file_sets_store_path_and_encryption() {
    let td = tempdir().expect("tempdir");
    write_file(
        &td.path().join(".shipit.toml"),
        r#"
[encryption]
enabled = true
passphrase = "cli-secret"

[engine]
max_concurrency = 2
transaction_timeout = "10s"

[store]
path = "state/shipit.json"
"#,
    );
    seed(
        td.path(),
        r#"{"name": "bar", "envVars": [{"name": "SECRET", "value": "plain-text-value", "type": "hidden"}]}"#,
    );

    let snapshot = fs::read_to_string(td.path().join("state/shipit.json")).expect("store");
    assert!(snapshot.contains("shipit.store.v1"));
    assert!(!snapshot.contains("plain-text-value"));

    let revealed = stdout_of(
        shipit_cmd(td.path())
            .arg("show")
            .arg("test-group")
            .arg("--env")
            .arg("bar")
            .arg("--reveal"),
    );
    assert!(revealed.contains("plain-text-value"));
}

#[test]
fn invalid_timeout_is_rejected() {
    let td = tempdir().expect("tempdir");
    shipit_cmd(td.path())
        .arg("--timeout")
        .arg("soon")
        .arg("envs")
        .arg("test-group")
        .assert()
        .failure()
        .stderr(contains("invalid duration: soon"));
}
