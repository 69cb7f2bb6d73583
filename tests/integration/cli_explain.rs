#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use sylva::query::builder::{arith, call, eq, var, Flwor, int};
use sylva::query::value::ArithOp;
use sylva::query::{Item, QueryDocument};
use tempfile::TempDir;

fn write_document(dir: &TempDir, name: &str, document: &QueryDocument) -> PathBuf {
    let path = dir.path().join(format!("{name}.json"));
    fs::write(&path, serde_json::to_vec_pretty(document).expect("serializes")).expect("write plan");
    path
}

fn ints(values: &[i64]) -> Vec<Item> {
    values.iter().copied().map(Item::Int).collect()
}

/// `for $x in $s let $v := (for $y in $t where $y = $x return $y) return count($v)`
fn correlated_count(dir: &TempDir) -> PathBuf {
    let inner = Flwor::new()
        .for_("y", var("t"))
        .where_(eq(var("y"), var("x")))
        .return_(var("y"))
        .expect("inner builds");
    let plan = Flwor::new()
        .for_("x", var("s"))
        .let_("v", inner)
        .return_(call("count", [var("v")]))
        .expect("outer builds");
    let mut bindings = BTreeMap::new();
    bindings.insert("s".to_owned(), ints(&[1, 2, 3]));
    bindings.insert("t".to_owned(), ints(&[3, 1, 1]));
    write_document(dir, "correlated", &QueryDocument { bindings, plan })
}

fn stdout_json(args: &[&str], plan: &PathBuf) -> Value {
    let output = cargo_bin_cmd!("sylva")
        .args(args)
        .arg(plan)
        .env_remove("SYLVA_CONFIG")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn explain_text_lists_rewrites_and_operators() {
    let dir = TempDir::new().expect("tempdir");
    let plan = correlated_count(&dir);
    let output = cargo_bin_cmd!("sylva")
        .args(["explain", "--unnest"])
        .arg(&plan)
        .env_remove("SYLVA_CONFIG")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Rewrites:"), "{text}");
    assert!(text.contains("unnest"), "{text}");
    assert!(text.contains("Join strategy=hash"), "{text}");
    assert!(text.contains("plan_hash="), "{text}");
}

#[test]
fn explain_json_reports_the_operator_tree() {
    let dir = TempDir::new().expect("tempdir");
    let plan = correlated_count(&dir);
    let json = stdout_json(&["--format", "json", "explain", "--redact"], &plan);
    assert_eq!(json["explain"]["plan"]["op"], "Return");
    assert!(json["explain"]["plan_hash"].is_string());
    assert_eq!(json["externals"], serde_json::json!(["s", "t"]));
    assert!(json["rewrites"]["passes"].is_array());
}

#[test]
fn run_agrees_with_and_without_unnesting() {
    let dir = TempDir::new().expect("tempdir");
    let plan = correlated_count(&dir);
    let nested = stdout_json(&["--format", "json", "run"], &plan);
    let unnested = stdout_json(&["--format", "json", "run", "--unnest"], &plan);
    assert_eq!(nested["items"], unnested["items"]);
    let counts: Vec<i64> = nested["items"]
        .as_array()
        .expect("items")
        .iter()
        .map(|item| item["v"].as_i64().expect("integer"))
        .collect();
    assert_eq!(counts, vec![2, 0, 1]);
    assert_eq!(unnested["stats"]["hash_joins"], 1);
}

#[test]
fn config_file_enables_unnesting() {
    let dir = TempDir::new().expect("tempdir");
    let plan = correlated_count(&dir);
    let config = dir.path().join("config.toml");
    fs::write(&config, "[optimizer]\nunnest = true\n").expect("write config");
    let output = cargo_bin_cmd!("sylva")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "run"])
        .arg(&plan)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["stats"]["hash_joins"], 1);
}

#[test]
fn dead_let_is_reported_as_skipped() {
    let dir = TempDir::new().expect("tempdir");
    let plan = Flwor::new()
        .for_("a", var("s"))
        .let_("c", arith(ArithOp::Mul, var("a"), int(2)))
        .return_(var("a"))
        .expect("builds");
    let mut bindings = BTreeMap::new();
    bindings.insert("s".to_owned(), ints(&[4, 5]));
    let path = write_document(&dir, "dead-let", &QueryDocument { bindings, plan });
    let json = stdout_json(&["--format", "json", "run"], &path);
    assert_eq!(json["stats"]["let_evaluations"], 0);
    assert_eq!(json["stats"]["skipped_lets"], 2);
}

#[test]
fn malformed_document_fails() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("broken.json");
    fs::write(&path, "{\"plan\": 3}").expect("write");
    cargo_bin_cmd!("sylva")
        .arg("explain")
        .arg(&path)
        .env_remove("SYLVA_CONFIG")
        .assert()
        .failure();
}
