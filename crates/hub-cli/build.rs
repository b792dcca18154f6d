use std::process::Command;

use time::OffsetDateTime;

/// Exports `HUB_BUILD` (`<commit>[-dirty], <date>`) for `--version`.
fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    for tracked in ["../../.git/HEAD", "../../.git/index"] {
        println!("cargo:rerun-if-changed={tracked}");
    }

    let commit = match git(&["rev-parse", "--short=10", "HEAD"]) {
        Some(sha) if is_dirty() => format!("{sha}-dirty"),
        Some(sha) => sha,
        None => "untracked".to_string(),
    };
    println!("cargo:rustc-env=HUB_BUILD={commit}, {}", build_day());
}

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    Some(text.trim().to_string())
}

fn is_dirty() -> bool {
    git(&["status", "--porcelain", "--untracked-files=no"]).is_some_and(|s| !s.is_empty())
}

/// Calendar day of the build; honours reproducible-build timestamps.
fn build_day() -> String {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
        .date()
        .to_string()
}
