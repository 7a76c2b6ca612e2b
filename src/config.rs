//! Configuration (ambient stack): the handful of `git config` keys
//! git-incrypt reads off the remote it's invoked for, plus the
//! environment variables the remote-helper protocol hands it.

use std::path::PathBuf;

use anyhow::{Context, Result};

const DEFAULT_KEYTOOL: &str = "gpg";

/// Parsed from the environment `git remote-ext` style invocation sets
/// up for every remote helper.
pub struct Args {
    pub git_dir: PathBuf,
}

impl Args {
    pub fn from_env() -> Result<Args> {
        let git_dir = std::env::var_os("GIT_DIR")
            .context("GIT_DIR is not set -- git-remote-incrypt must be invoked by git as a remote helper")?;
        Ok(Args {
            git_dir: PathBuf::from(git_dir),
        })
    }
}

/// Per-remote configuration read from `remote.<name>.incrypt-*`.
pub struct Config {
    /// External key-management tool used to wrap/unwrap the symmetric
    /// key (`remote.<name>.incrypt-keytool`, default `gpg`).
    pub keytool: String,
    /// Whether to emit `git2`-style transfer progress to stderr while
    /// mirroring (`remote.<name>.incrypt-progress`, default enabled).
    pub progress: bool,
    /// Key-management recipients to (re-)wrap the symmetric key for on
    /// every push (`remote.<name>.incrypt-recipient`, multi-valued).
    pub recipients: Vec<String>,
}

impl Config {
    pub fn read(config: &git2::Config, remote_name: &str) -> Result<Config> {
        let keytool =
            read_string(config, remote_name, "keytool")?.unwrap_or_else(|| DEFAULT_KEYTOOL.to_string());
        let progress = read_bool(config, remote_name, "progress")?.unwrap_or(true);
        let recipients = read_multivar(config, remote_name, "recipient")?;
        Ok(Config {
            keytool,
            progress,
            recipients,
        })
    }
}

fn read_multivar(config: &git2::Config, remote_name: &str, key: &str) -> Result<Vec<String>> {
    let mut values = Vec::new();
    let entries = config
        .entries(Some(&key_path(remote_name, key)))
        .with_context(|| format!("reading {}", key_path(remote_name, key)))?;
    for entry in &entries {
        let entry = entry?;
        if let Some(value) = entry.value() {
            values.push(value.to_string());
        }
    }
    Ok(values)
}

fn key_path(remote_name: &str, key: &str) -> String {
    format!("remote.{remote_name}.incrypt-{key}")
}

fn read_string(config: &git2::Config, remote_name: &str, key: &str) -> Result<Option<String>> {
    match config.get_string(&key_path(remote_name, key)) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", key_path(remote_name, key))),
    }
}

fn read_bool(config: &git2::Config, remote_name: &str, key: &str) -> Result<Option<bool>> {
    match config.get_bool(&key_path(remote_name, key)) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", key_path(remote_name, key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with(entries: &[(&str, &str)]) -> (TempDir, git2::Config) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gitconfig");
        let mut config = git2::Config::open(&path).unwrap();
        for (key, value) in entries {
            config.set_str(key, value).unwrap();
        }
        (dir, config)
    }

    #[test]
    fn defaults_apply_when_unset() {
        let (_dir, config) = config_with(&[]);
        let parsed = Config::read(&config, "origin").unwrap();
        assert_eq!(parsed.keytool, "gpg");
        assert!(parsed.progress);
    }

    #[test]
    fn reads_overrides_scoped_to_remote_name() {
        let (_dir, config) = config_with(&[
            ("remote.origin.incrypt-keytool", "age"),
            ("remote.origin.incrypt-progress", "false"),
        ]);
        let parsed = Config::read(&config, "origin").unwrap();
        assert_eq!(parsed.keytool, "age");
        assert!(!parsed.progress);

        let other = Config::read(&config, "other").unwrap();
        assert_eq!(other.keytool, "gpg");
    }

    #[test]
    fn reads_multiple_recipients_in_insertion_order() {
        let (dir, _config) = config_with(&[]);
        let path = dir.path().join("gitconfig");
        let mut config = git2::Config::open(&path).unwrap();
        config
            .set_multivar("remote.origin.incrypt-recipient", "^$", "alice@example.com")
            .unwrap();
        config
            .set_multivar("remote.origin.incrypt-recipient", "^$", "bob@example.com")
            .unwrap();

        let parsed = Config::read(&config, "origin").unwrap();
        assert_eq!(parsed.recipients, vec!["alice@example.com", "bob@example.com"]);
    }
}
