use std::ffi::OsString;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;

struct Environment {
    ssh_agent_pid: Option<OsString>,
    ssh_auth_sock: Option<OsString>,
    git_ssh_command: Option<OsString>,
    git_ssh: Option<OsString>,
    git_askpass: Option<OsString>,
}

impl Environment {
    fn new() -> Environment {
        Environment {
            ssh_agent_pid: std::env::var_os("SSH_AGENT_PID"),
            ssh_auth_sock: std::env::var_os("SSH_AUTH_SOCK"),
            git_ssh_command: std::env::var_os("GIT_SSH_COMMAND"),
            git_ssh: std::env::var_os("GIT_SSH"),
            git_askpass: std::env::var_os("GIT_ASKPASS"),
        }
    }

    fn apply(&self, cmd: &mut std::process::Command) {
        Self::maybe_set(cmd, "SSH_AGENT_PID", self.ssh_agent_pid.as_ref());
        Self::maybe_set(cmd, "SSH_AUTH_SOCK", self.ssh_auth_sock.as_ref());
        Self::maybe_set(cmd, "GIT_SSH_COMMAND", self.git_ssh_command.as_ref());
        Self::maybe_set(cmd, "GIT_SSH", self.git_ssh.as_ref());
        Self::maybe_set(cmd, "GIT_ASKPASS", self.git_askpass.as_ref());
    }

    fn maybe_set(cmd: &mut std::process::Command, key: &str, value: Option<&OsString>) {
        if let Some(value) = value {
            cmd.env(key, value);
        }
    }
}

static CELL: OnceCell<Environment> = OnceCell::new();

/// A `git` invocation with a clean environment plus whatever transport
/// variables (SSH agent, askpass, ...) the parent process was given --
/// used to clone/fetch/push the encrypted mirror under the hood.
pub fn git_command() -> std::process::Command {
    let environment = CELL.get_or_init(Environment::new);
    let mut cmd = std::process::Command::new("git");
    cmd.env_clear().env("GIT_CONFIG_NOSYSTEM", "");
    environment.apply(&mut cmd);
    cmd
}

pub fn peel_reference_to_commit<'a>(
    repo: &'a git2::Repository,
    ref_name: &str,
) -> Result<Option<git2::Commit<'a>>> {
    match repo.find_reference(ref_name) {
        Ok(r) => {
            let commit_oid = r
                .resolve()
                .with_context(|| format!("resolving reference {ref_name}"))?
                .target()
                .with_context(|| format!("reference {ref_name} has no direct target"))?;
            let commit = repo
                .find_commit(commit_oid)
                .with_context(|| format!("finding commit {commit_oid}"))?;
            Ok(Some(commit))
        }
        Err(e) => {
            if e.code() != git2::ErrorCode::NotFound {
                return Err(e).with_context(|| format!("looking up reference {ref_name}"));
            }
            Ok(None)
        }
    }
}

pub fn open_create_bare_repository(path: &Path) -> Result<git2::Repository> {
    match git2::Repository::open_bare(path) {
        Ok(r) => Ok(r),
        Err(_) => git2::Repository::init_bare(path)
            .with_context(|| format!("initializing bare repository in {}", path.display())),
    }
}

fn debug_stream_message<S: Read>(stream: Option<S>, name: &'static str) -> Result<String> {
    match stream {
        Some(mut s) => {
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).with_context(|| format!("reading {name}"))?;
            match std::str::from_utf8(&buf) {
                Ok(m) => Ok(m.to_string()),
                Err(_) => Ok(format!("<non-utf8 {name}: {buf:?}>")),
            }
        }
        None => Ok(format!("<no {name}>")),
    }
}

pub fn execute_subprocess(command: &mut std::process::Command) -> Result<std::process::Output> {
    let output = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(anyhow::Error::msg(format!(
            "subprocess failed.\n---STDOUT---\n{}\n\n---STDERR---\n{}\n",
            debug_stream_message(Some(output.stdout.as_slice()), "stdout")?,
            debug_stream_message(Some(output.stderr.as_slice()), "stderr")?,
        )))
    }
}
