use crate::runner::{render_command, CommandRunner};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to run tar: {0}")]
    Launch(#[source] io::Error),
    #[error("`{command}` exited with status {status_code}: {stderr}")]
    Failed {
        command: String,
        status_code: i32,
        stderr: String,
    },
    #[error("archive {} is empty", .0.display())]
    Empty(PathBuf),
}

fn run_tar<R: CommandRunner>(runner: &R, args: &[String]) -> Result<Vec<u8>, ArchiveError> {
    let output = runner.run("tar", args).map_err(ArchiveError::Launch)?;
    if !output.success() {
        return Err(ArchiveError::Failed {
            command: render_command("tar", args),
            status_code: output.status_code,
            stderr: output.stderr_text(),
        });
    }
    Ok(output.stdout)
}

fn normalize_tar_entry_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    if stripped.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

/// True when every entry lives under one shared top-level directory.
fn has_single_top_level_dir(entries: &[String]) -> bool {
    let mut top: Option<&str> = None;
    let mut saw_nested = false;
    for entry in entries {
        let mut parts = entry.splitn(2, '/');
        let first = parts.next().unwrap_or("");
        if first.is_empty() {
            continue;
        }
        if parts.next().is_some() {
            saw_nested = true;
        }
        match top {
            None => top = Some(first),
            Some(existing) if existing != first => return false,
            Some(_) => {}
        }
    }
    saw_nested && top.is_some()
}

fn list_entries<R: CommandRunner>(runner: &R, archive: &Path) -> Result<Vec<String>, ArchiveError> {
    let args = vec!["-tzf".to_string(), archive.to_string_lossy().to_string()];
    let stdout = run_tar(runner, &args)?;
    Ok(String::from_utf8_lossy(&stdout)
        .lines()
        .filter_map(normalize_tar_entry_path)
        .collect())
}

/// Unpacks a gzip tarball into `dest`, dropping a single wrapping directory if present.
pub fn extract_tarball<R: CommandRunner>(
    runner: &R,
    archive: &Path,
    dest: &Path,
) -> Result<(), ArchiveError> {
    let entries = list_entries(runner, archive)?;
    if entries.is_empty() {
        return Err(ArchiveError::Empty(archive.to_path_buf()));
    }
    let mut args = vec![
        "-xzf".to_string(),
        archive.to_string_lossy().to_string(),
        "-C".to_string(),
        dest.to_string_lossy().to_string(),
    ];
    if has_single_top_level_dir(&entries) {
        args.push("--strip-components".to_string());
        args.push("1".to_string());
    }
    run_tar(runner, &args)?;
    Ok(())
}
