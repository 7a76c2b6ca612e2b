//! Mirror manager (C7): keeps a local bare mirror of the encrypted
//! remote under `<CR git dir>/incrypt/<sha1(url)>/`. Fetched and
//! pushed via subprocess `git`, the same way the rest of this crate
//! shells out to `git` plumbing it has no reason to reimplement --
//! letting native git handle whatever transport (ssh, https, ...) the
//! url requires.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

use crate::error::IncryptError;
use crate::util;

/// The hex digest used to scope both the local mirror's directory and
/// the shadow ref namespace to a particular remote URL.
pub fn url_hash(url: &str) -> String {
    hex::encode(Sha1::digest(url.as_bytes()))
}

pub fn mirror_path(cr_git_dir: &Path, url: &str) -> PathBuf {
    cr_git_dir.join("incrypt").join(url_hash(url))
}

fn git_dir_command(path: &Path) -> std::process::Command {
    let mut cmd = util::git_command();
    cmd.arg("--git-dir").arg(path);
    cmd
}

fn run(path: &Path, args: &[&str], failure_context: &str) -> Result<()> {
    let mut cmd = git_dir_command(path);
    cmd.args(args);
    util::execute_subprocess(&mut cmd)
        .map_err(|e| IncryptError::TransportFailure(format!("{failure_context}: {e:#}")))?;
    Ok(())
}

/// Opens the local mirror, cloning it from `url` first if this is the
/// first time this remote has been used in this cleartext repository.
pub fn open(cr_git_dir: &Path, url: &str) -> Result<git2::Repository> {
    let path = mirror_path(cr_git_dir, url);
    if path.join("HEAD").is_file() {
        return git2::Repository::open_bare(&path)
            .with_context(|| format!("opening existing mirror at {}", path.display()));
    }

    std::fs::create_dir_all(
        path.parent()
            .expect("mirror path always has an incrypt/ parent"),
    )
    .context("creating incrypt mirror directory")?;

    let mut cmd = util::git_command();
    cmd.args(["clone", "--bare", "--mirror"]).arg(url).arg(&path);
    util::execute_subprocess(&mut cmd)
        .map_err(|e| IncryptError::TransportFailure(format!("cloning {url}: {e:#}")))?;

    git2::Repository::open_bare(&path)
        .with_context(|| format!("opening freshly cloned mirror at {}", path.display()))
}

/// Refreshes every ref in the local mirror from the remote's current
/// state, including deletions (`--prune`).
pub fn fetch(path: &Path) -> Result<()> {
    run(path, &["fetch", "--prune", "origin"], "fetching the encrypted remote")
}

/// Pushes `refspecs` (already-formatted `src:dst`, or `:dst` for a
/// deletion) to the remote. Atomic mode is the default: either every
/// ref update lands or none does, so a partial failure never leaves
/// the metadata record out of sync with the ref it describes.
pub fn push(path: &Path, refspecs: &[String]) -> Result<()> {
    if refspecs.is_empty() {
        return Ok(());
    }
    let mut args = vec!["push", "--atomic", "origin"];
    args.extend(refspecs.iter().map(String::as_str));
    run(path, &args, "pushing to the encrypted remote")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_path_is_deterministic_and_scoped_by_url() {
        let cr_dir = Path::new("/repo/.git");
        let a = mirror_path(cr_dir, "https://example.com/a.git");
        let b = mirror_path(cr_dir, "https://example.com/b.git");
        assert_ne!(a, b);
        assert_eq!(a, mirror_path(cr_dir, "https://example.com/a.git"));
        assert!(a.starts_with(cr_dir.join("incrypt")));
    }
}
