#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use pinstore::storage::{Dataset, PinRecord};
use pinstore::{PinId, PropId};
use serde_json::Value as Json;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    data: PathBuf,
}

impl Fixture {
    /// Six PINs: even ids in class 1, odd ids in class 2, property 1 = id * 10
    /// and property 3 referencing the next PIN.
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut dataset = Dataset::default();
        for id in 1..=6u64 {
            let mut record = PinRecord::new(id)
                .with_class(if id % 2 == 0 { 1 } else { 2 })
                .with_prop(1, (id * 10) as i64);
            if id < 6 {
                record = record.with_prop(3, PinId(id + 1));
            }
            dataset.pins.push(record);
        }
        dataset.indexes.push(PropId(1));
        let data = dir.path().join("pins.json");
        fs::write(&data, serde_json::to_string(&dataset).expect("dataset json")).expect("write data");
        Self { dir, data }
    }

    fn file(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, body).expect("write fixture file");
        path
    }

    fn query(&self, body: &str) -> PathBuf {
        self.file("query.json", body)
    }
}

fn stdout_of(args: &[&str], data: &Path, query: &Path) -> String {
    let output = cargo_bin_cmd!("pinq")
        .env_remove("PINSTORE_QUERY_CONFIG")
        .arg("--data")
        .arg(data)
        .args(args)
        .arg("--query")
        .arg(query)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(output).expect("utf8 stdout")
}

const EVEN_WITH_P1: &str = r#"{
    "var": "simple",
    "sources": [{"source": "class", "class": 1}],
    "props": [1]
}"#;

#[test]
fn run_prints_json_lines() {
    let fixture = Fixture::new();
    let query = fixture.query(EVEN_WITH_P1);
    let out = stdout_of(&["--format", "json", "run"], &fixture.data, &query);
    let rows: Vec<Json> = out
        .lines()
        .map(|line| serde_json::from_str(line).expect("json row"))
        .collect();
    assert_eq!(rows.len(), 3);
    let ids: Vec<u64> = rows
        .iter()
        .map(|row| row["slots"][0]["id"].as_u64().expect("id"))
        .collect();
    assert_eq!(ids, vec![2, 4, 6]);
    assert_eq!(rows[1]["slots"][0]["props"]["1"]["v"], 40);
}

#[test]
fn run_text_honors_skip_and_limit() {
    let fixture = Fixture::new();
    let query = fixture.query(EVEN_WITH_P1);
    let out = stdout_of(&["run", "--skip", "1", "--limit", "1"], &fixture.data, &query);
    assert_eq!(out, "4 p1=40\n");
}

#[test]
fn run_count_reports_rows() {
    let fixture = Fixture::new();
    let query = fixture.query(
        r#"{"var": "set_op", "kind": "union", "inputs": [
            {"var": "simple", "sources": [{"source": "class", "class": 1}]},
            {"var": "simple", "sources": [{"source": "ids", "ids": [1, 3, 99]}]}
        ]}"#,
    );
    let out = stdout_of(&["--format", "json", "run", "--count"], &fixture.data, &query);
    let json: Json = serde_json::from_str(out.trim()).expect("count json");
    assert_eq!(json["count"], 5);
}

#[test]
fn run_join_emits_both_slots() {
    let fixture = Fixture::new();
    let query = fixture.query(
        r#"{"var": "join", "kind": "inner",
            "left": {"var": "simple", "sources": [{"source": "class", "class": 2}]},
            "right": {"var": "simple", "sources": [{"source": "class", "class": 1}]},
            "conds": [{"left": {"prop": 3}, "right_slot": 0, "right": "id"}]
        }"#,
    );
    let out = stdout_of(&["--format", "json", "run"], &fixture.data, &query);
    let pairs: Vec<(u64, u64)> = out
        .lines()
        .map(|line| {
            let row: Json = serde_json::from_str(line).expect("json row");
            let id = |slot: usize| row["slots"][slot]["id"].as_u64().expect("slot id");
            (id(0), id(1))
        })
        .collect();
    assert_eq!(pairs, vec![(1, 2), (3, 4), (5, 6)]);
}

#[test]
fn run_reads_params() {
    let fixture = Fixture::new();
    let query = fixture.query(
        r#"{"var": "simple", "sources": [{"source": "param", "index": 0}], "props": [1]}"#,
    );
    let params = r#"[[{"t": "Ref", "v": 5}]]"#;
    let out = stdout_of(&["run", "--params", params], &fixture.data, &query);
    assert_eq!(out, "5 p1=50\n");
}

#[test]
fn explain_prints_plan_and_fingerprint() {
    let fixture = Fixture::new();
    let query = fixture.query(
        r#"{"var": "simple",
            "sources": [{"source": "class", "class": 1}],
            "predicate": {"cmp": {"op": "gt", "lhs": {"prop": {"slot": 0, "prop": 1}}, "rhs": {"lit": {"t": "Int", "v": 25}}}}
        }"#,
    );
    let plain = stdout_of(&["explain"], &fixture.data, &query);
    assert!(plain.starts_with("Filter"), "{plain}");
    assert!(plain.contains("ClassScan [class=1]"), "{plain}");
    assert!(plain.contains("25"), "{plain}");
    assert!(plain.lines().last().unwrap().starts_with("fingerprint: "), "{plain}");

    let redacted = stdout_of(&["explain", "--redact"], &fixture.data, &query);
    assert!(redacted.contains("predicate=?"), "{redacted}");
    assert!(!redacted.contains("25"), "{redacted}");
    assert_eq!(plain.lines().last(), redacted.lines().last());
}

#[test]
fn explain_json_has_plan_tree() {
    let fixture = Fixture::new();
    let query = fixture.query(EVEN_WITH_P1);
    let out = stdout_of(&["--format", "json", "explain"], &fixture.data, &query);
    let json: Json = serde_json::from_str(out.trim()).expect("explain json");
    assert!(json["plan"]["op"].is_string());
    assert_eq!(json["fingerprint"].as_str().map(str::len), Some(16));
    assert!(json["operators"].as_u64().is_some_and(|n| n >= 1));
}

#[test]
fn profile_env_reports_operator_counters() {
    let fixture = Fixture::new();
    let query = fixture.query(EVEN_WITH_P1);
    let output = cargo_bin_cmd!("pinq")
        .env_remove("PINSTORE_QUERY_CONFIG")
        .env("PINSTORE_PROFILE", "1")
        .arg("--data")
        .arg(&fixture.data)
        .args(["run", "--query"])
        .arg(&query)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 3, "{stdout}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("profile build: calls=1"), "{stderr}");
    assert!(stderr.contains("profile scan: calls="), "{stderr}");
}

#[test]
fn config_from_env_limits_operators() {
    let fixture = Fixture::new();
    let query = fixture.query(
        r#"{"var": "set_op", "kind": "union", "inputs": [
            {"var": "simple", "sources": [{"source": "class", "class": 1}]},
            {"var": "simple", "sources": [{"source": "class", "class": 2}]}
        ]}"#,
    );
    let config = fixture.file("limits.toml", "max_operators = 2\n");
    let output = cargo_bin_cmd!("pinq")
        .env("PINSTORE_QUERY_CONFIG", &config)
        .arg("--data")
        .arg(&fixture.data)
        .args(["run", "--query"])
        .arg(&query)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("error: plan exceeds 2 operators"), "{stderr}");
}

#[test]
fn unknown_config_key_is_rejected() {
    let fixture = Fixture::new();
    let query = fixture.query(EVEN_WITH_P1);
    let config = fixture.file("bad.toml", "max_operatorz = 3\n");
    cargo_bin_cmd!("pinq")
        .arg("--config")
        .arg(&config)
        .arg("--data")
        .arg(&fixture.data)
        .args(["run", "--query"])
        .arg(&query)
        .assert()
        .failure();
}

#[test]
fn malformed_query_fails_cleanly() {
    let fixture = Fixture::new();
    let query = fixture.query(r#"{"var": "nope"}"#);
    let output = cargo_bin_cmd!("pinq")
        .env_remove("PINSTORE_QUERY_CONFIG")
        .arg("--data")
        .arg(&fixture.data)
        .args(["run", "--query"])
        .arg(&query)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("error: invalid query"), "{stderr}");
}
