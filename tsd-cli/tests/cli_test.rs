//! Runs the `tsd` binary on commands that need no network

use anyhow::Result;
use std::process::Command;
use tempfile::TempDir;

fn tsd(dir: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tsd"));
    cmd.current_dir(dir.path())
        .args(["--cache-dir"])
        .arg(dir.path().join("cache"))
        .env_remove("TSD_GITHUB_TOKEN")
        .env_remove("GITHUB_TOKEN");
    cmd
}

#[test]
fn test_cache_key_is_stable_and_sharded() -> Result<()> {
    let dir = TempDir::new()?;
    let url = "https://raw.githubusercontent.com/borisyankov/DefinitelyTyped/abc/jquery/jquery.d.ts";

    let first = tsd(&dir).args(["cache-key", url]).output()?;
    let second = tsd(&dir).args(["cache-key", url]).output()?;
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    assert_eq!(first.stdout, second.stdout);

    let stdout = String::from_utf8(first.stdout)?;
    let mut lines = stdout.lines();
    let key = lines.next().unwrap_or_default();
    let location = lines.next().unwrap_or_default();
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert!(location.ends_with(&format!("{}/{}", &key[..2], key)));
    assert!(location.contains("raw"));
    Ok(())
}

#[test]
fn test_api_urls_use_the_api_cache() -> Result<()> {
    let dir = TempDir::new()?;
    let output = tsd(&dir)
        .args(["cache-key", "https://api.github.com/rate_limit"])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.lines().nth(1).unwrap_or_default().contains("api"));
    Ok(())
}

#[test]
fn test_offline_query_with_empty_cache_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let output = tsd(&dir)
        .args(["--cache-mode", "offline", "query", "jquery"])
        .output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Not in cache"), "stderr: {stderr}");
    // nothing was installed or saved
    assert!(!dir.path().join("typings").exists());
    assert!(!dir.path().join("tsd.json").exists());
    Ok(())
}

#[test]
fn test_reinstall_without_config_is_a_no_op() -> Result<()> {
    let dir = TempDir::new()?;
    let output = tsd(&dir)
        .args(["--cache-mode", "offline", "reinstall"])
        .output()?;

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Nothing installed"));
    Ok(())
}

#[test]
fn test_invalid_cache_mode_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let output = tsd(&dir).args(["--cache-mode", "sometimes", "rate"]).output()?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid cache mode"));
    Ok(())
}
