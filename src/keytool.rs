//! External key-management subprocess wrapper. The 48-byte symmetric
//! key is never stored in the clear anywhere; it is wrapped and
//! unwrapped by shelling out to a configurable key-management tool
//! (default `gpg`), the same way the rest of this crate shells out to
//! `git` for plumbing it has no reason to reimplement.

use std::io::Write as _;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::error::IncryptError;

/// Wraps `plaintext` (the raw symmetric key) for every recipient so
/// that any one of their private keys can unwrap it later.
pub fn wrap(tool: &str, recipients: &[String], plaintext: &[u8]) -> Result<Vec<u8>> {
    if recipients.is_empty() {
        anyhow::bail!("at least one recipient is required to wrap a key");
    }

    let mut args = vec!["-q".to_string(), "--batch".to_string(), "-e".to_string()];
    for recipient in recipients {
        args.push("-r".to_string());
        args.push(recipient.clone());
    }

    run(tool, &args, plaintext).with_context(|| format!("wrapping key with `{tool}`"))
}

/// Unwraps a previously wrapped key. Whichever recipient's private key
/// the local keyring holds is used implicitly by the tool itself; this
/// crate never learns which one.
pub fn unwrap(tool: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let args = ["-q", "--batch", "-d"];
    run(tool, &args, ciphertext).with_context(|| format!("unwrapping key with `{tool}`"))
}

fn run(tool: &str, args: &[impl AsRef<std::ffi::OsStr>], input: &[u8]) -> Result<Vec<u8>> {
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning key-management tool `{tool}`"))?;

    child
        .stdin
        .take()
        .expect("piped stdin")
        .write_all(input)
        .context("writing key material to key-management tool")?;

    let output = child
        .wait_with_output()
        .context("waiting for key-management tool")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IncryptError::KeyToolFailure(format!(
            "`{tool}` exited with {status}: {stderr}",
            status = output.status,
            stderr = stderr.trim(),
        ))
        .into());
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_rejects_empty_recipient_list() {
        let err = wrap("gpg", &[], b"key material").expect_err("must fail");
        assert!(err.to_string().contains("recipient"));
    }

    #[test]
    fn run_reports_nonzero_exit_as_key_tool_failure() {
        // `false` always exits non-zero and ignores its arguments.
        let err = run("false", &["-q"], b"").expect_err("must fail");
        assert!(err.downcast_ref::<IncryptError>().is_some() || err.to_string().contains("false"));
    }
}
