//! Integration tests driving the compiled `tscope` binary end to end
//! against a temporary config, database, and report corpus.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

const CATALOG_TOML: &str = r#"
[[techniques]]
id = "T1059.001"
name = "PowerShell"
tactic = "Execution"
triggers = ["powershell"]

[[techniques]]
id = "T1566"
name = "Phishing"
tactic = "Initial Access"
triggers = ["phishing"]

[[techniques]]
id = "T1110"
name = "Brute Force"
tactic = "Credential Access"
triggers = ["brute force", "failed login"]
"#;

struct TestEnv {
    _tmp: TempDir,
    config_path: PathBuf,
    reports_dir: PathBuf,
}

fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    std::fs::create_dir_all(root.join("data")).unwrap();
    std::fs::write(root.join("data/techniques.toml"), CATALOG_TOML).unwrap();

    let reports_dir = root.join("reports");
    std::fs::create_dir_all(&reports_dir).unwrap();
    std::fs::write(
        reports_dir.join("bruteforce.log"),
        "Repeated failed login attempts from 203.0.113.17 against the vpn gateway.\n\
         The brute force pattern continued for two hours before lockout.\n",
    )
    .unwrap();
    std::fs::write(
        reports_dir.join("phishing.txt"),
        "A phishing email was reported by three users.\n\
         The lure site portal-login[.]example[.]net harvested credentials.\n",
    )
    .unwrap();
    std::fs::write(reports_dir.join("notes.md"), "# Notes\nnot a report format\n").unwrap();

    let config = format!(
        "[db]\npath = \"{}\"\n\n[catalog]\npath = \"{}\"\n",
        root.join("data/threatscope.db").display(),
        root.join("data/techniques.toml").display(),
    );
    let config_path = root.join("threatscope.toml");
    std::fs::write(&config_path, config).unwrap();

    TestEnv {
        _tmp: tmp,
        config_path,
        reports_dir,
    }
}

/// Run `tscope` with the test config, returning (stdout, stderr, success).
fn run_tscope(config: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_tscope"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to spawn tscope");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_init_creates_database_and_is_idempotent() {
    let env = setup();
    let (stdout, stderr, ok) = run_tscope(&env.config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));

    let (_, stderr, ok) = run_tscope(&env.config_path, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_directory_respects_globs() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    let (stdout, stderr, ok) = run_tscope(
        &env.config_path,
        &["ingest", env.reports_dir.to_str().unwrap()],
    );
    assert!(ok, "ingest failed: {}", stderr);
    // notes.md is filtered out by the default include globs.
    assert!(stdout.contains("files found: 2"), "stdout: {}", stdout);
    assert!(stdout.contains("documents ingested: 2"), "stdout: {}", stdout);
    assert!(stdout.contains("chunks written:"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_ingest_dry_run_touches_nothing() {
    let env = setup();

    // No init: a dry run must not need (or create) the database.
    let (stdout, stderr, ok) = run_tscope(
        &env.config_path,
        &["ingest", env.reports_dir.to_str().unwrap(), "--dry-run"],
    );
    assert!(ok, "dry run failed: {}", stderr);
    assert!(stdout.contains("ingest (dry-run)"));
    assert!(stdout.contains("files found: 2"));
    assert!(stdout.contains("would ingest:"));
    assert!(!env._tmp.path().join("data/threatscope.db").exists());
}

#[test]
fn test_ingest_limit_truncates_batch() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    let (stdout, stderr, ok) = run_tscope(
        &env.config_path,
        &["ingest", env.reports_dir.to_str().unwrap(), "--limit", "1"],
    );
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("files found: 2"));
    assert!(stdout.contains("documents ingested: 1"));
}

#[test]
fn test_reingest_skips_unchanged_documents() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);
    let dir = env.reports_dir.to_str().unwrap().to_string();

    run_tscope(&env.config_path, &["ingest", &dir]);
    let (stdout, stderr, ok) = run_tscope(&env.config_path, &["ingest", &dir]);
    assert!(ok, "re-ingest failed: {}", stderr);
    assert!(stdout.contains("documents ingested: 0"), "stdout: {}", stdout);
    assert!(stdout.contains("unchanged (skipped): 2"), "stdout: {}", stdout);
}

#[test]
fn test_explicit_unsupported_file_is_reported_not_fatal() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    // An explicitly named file bypasses the globs, then fails format
    // detection; the batch still completes.
    let notes = env.reports_dir.join("notes.md");
    let (stdout, stderr, ok) = run_tscope(
        &env.config_path,
        &["ingest", notes.to_str().unwrap()],
    );
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("files found: 1"));
    assert!(stdout.contains("documents ingested: 0"));
    assert!(stdout.contains("failures: 1"));
    assert!(stdout.contains("notes.md"));
    assert!(stdout.contains("unsupported format"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_get_missing_document_fails() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    let (_, stderr, ok) = run_tscope(&env.config_path, &["get", "no-such-id"]);
    assert!(!ok);
    assert!(stderr.contains("document not found"), "stderr: {}", stderr);
}

#[test]
fn test_delete_missing_document_fails() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    let (_, stderr, ok) = run_tscope(&env.config_path, &["delete", "no-such-id"]);
    assert!(!ok);
    assert!(stderr.contains("document not found"), "stderr: {}", stderr);
}

#[test]
fn test_search_without_index_returns_no_results() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);
    run_tscope(
        &env.config_path,
        &["ingest", env.reports_dir.to_str().unwrap()],
    );

    // Embedding is disabled in the test config, so nothing was indexed;
    // search degrades to an empty result, not an error.
    let (stdout, stderr, ok) = run_tscope(&env.config_path, &["search", "brute force"]);
    assert!(ok, "search failed: {}", stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_embed_commands_require_a_provider() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    let (_, stderr, ok) = run_tscope(&env.config_path, &["embed", "pending"]);
    assert!(!ok);
    assert!(
        stderr.contains("embedding provider is disabled"),
        "stderr: {}",
        stderr
    );

    let (_, stderr, ok) = run_tscope(&env.config_path, &["embed", "rebuild"]);
    assert!(!ok);
    assert!(stderr.contains("embedding provider is disabled"));
}

#[test]
fn test_ask_without_generation_provider_fails() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    let (_, stderr, ok) = run_tscope(&env.config_path, &["ask", "what happened?"]);
    assert!(!ok);
    assert!(
        stderr.contains("generation provider is disabled"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_iocs_lists_extracted_indicators() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);
    run_tscope(
        &env.config_path,
        &["ingest", env.reports_dir.to_str().unwrap()],
    );

    let (stdout, stderr, ok) = run_tscope(&env.config_path, &["iocs"]);
    assert!(ok, "iocs failed: {}", stderr);
    assert!(stdout.contains("203.0.113.17"));
    // Stored refanged, not as written in the report.
    assert!(stdout.contains("portal-login.example.net"));

    let (stdout, _, ok) = run_tscope(&env.config_path, &["iocs", "--ioc-type", "domain"]);
    assert!(ok);
    assert!(stdout.contains("portal-login.example.net"));
    assert!(!stdout.contains("203.0.113.17"));
}

#[test]
fn test_iocs_empty_database() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);

    let (stdout, _, ok) = run_tscope(&env.config_path, &["iocs"]);
    assert!(ok);
    assert!(stdout.contains("No indicators stored."));
}

#[test]
fn test_techniques_reports_catalog_and_counts() {
    let env = setup();
    run_tscope(&env.config_path, &["init"]);
    run_tscope(
        &env.config_path,
        &["ingest", env.reports_dir.to_str().unwrap()],
    );

    let (stdout, stderr, ok) = run_tscope(&env.config_path, &["techniques"]);
    assert!(ok, "techniques failed: {}", stderr);
    assert!(stdout.contains("T1110"));
    assert!(stdout.contains("Brute Force"));
    assert!(stdout.contains("T1566"));
    // Catalog entries with no sightings still appear.
    assert!(stdout.contains("T1059.001"));
}

#[test]
fn test_analyze_reports_techniques_and_iocs_without_db() {
    let env = setup();

    // Analyze reads the file directly; no init, no database.
    let file = env.reports_dir.join("phishing.txt");
    let (stdout, stderr, ok) = run_tscope(&env.config_path, &["analyze", file.to_str().unwrap()]);
    assert!(ok, "analyze failed: {}", stderr);
    assert!(stdout.contains("analyze"));
    assert!(stdout.contains("format: txt"));
    assert!(stdout.contains("T1566"));
    assert!(stdout.contains("portal-login.example.net"));
    assert!(stdout.trim_end().ends_with("ok"));
}
