//! Remote-helper loop (C8): speaks the git remote-helper protocol on
//! stdin/stdout. stdout is the protocol channel, so every diagnostic
//! this crate emits goes to stderr via `log` instead -- writing
//! anything else to stdout would corrupt the protocol stream.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::str::FromStr;

use anyhow::{Context, Result};
use git2::{Oid, Repository};
use log::{debug, warn};

use crate::config::Config;
use crate::decrypt;
use crate::encrypt;
use crate::metadata::{self, MetaData};
use crate::mirror;
use crate::objectmap::ObjectMap;
use crate::refname;
use crate::util;

const METADATA_REF: &str = "refs/heads/_";

struct FetchSpec {
    oid: Oid,
}

struct PushSpec {
    force: bool,
    src: Option<String>,
    dst: String,
}

fn parse_fetch(line: &str) -> Result<FetchSpec> {
    let mut parts = line.trim_end().splitn(3, ' ');
    parts.next(); // "fetch"
    let oid = parts.next().context("fetch command missing an object id")?;
    Ok(FetchSpec {
        oid: Oid::from_str(oid).with_context(|| format!("parsing fetch object id {oid:?}"))?,
    })
}

fn parse_push(line: &str) -> Result<PushSpec> {
    let spec = line
        .trim_end()
        .strip_prefix("push ")
        .context("malformed push command")?;
    let (force, spec) = match spec.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, spec),
    };
    let (src, dst) = spec
        .split_once(':')
        .with_context(|| format!("push spec {spec:?} is missing ':'"))?;
    Ok(PushSpec {
        force,
        src: if src.is_empty() { None } else { Some(src.to_string()) },
        dst: dst.to_string(),
    })
}

/// Runs the protocol loop for `remote_name`/`url` until stdin closes.
pub fn run(cr: &Repository, remote_name: &str, url: &str) -> Result<()> {
    let git_config = cr.config()?;
    let config = Config::read(&git_config, remote_name)?;

    let mirror_path = mirror::mirror_path(cr.path(), url);
    let mut er: Option<Repository> = None;
    let mut fetched_once = false;

    // Opening (and possibly cloning) the mirror touches the network,
    // so it's deferred until a command that actually needs it --
    // `capabilities` in particular must answer without any of that.
    macro_rules! ensure_mirror {
        () => {{
            if er.is_none() {
                er = Some(mirror::open(cr.path(), url)?);
            }
            er.as_ref().expect("just initialized")
        }};
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    let mut lines = stdin.lock().lines();

    loop {
        let Some(line) = lines.next() else { break };
        let line = line?;

        if line.is_empty() {
            continue;
        } else if line == "capabilities" {
            writeln!(stdout, "fetch")?;
            writeln!(stdout, "push")?;
            writeln!(stdout, "option")?;
            writeln!(stdout)?;
        } else if let Some(rest) = line.strip_prefix("option ") {
            handle_option(rest, &mut stdout)?;
        } else if line == "list" || line == "list for-push" {
            let er = ensure_mirror!();
            if !fetched_once {
                mirror::fetch(&mirror_path)?;
                fetched_once = true;
            }
            handle_list(cr, er, url, &config, &mut stdout)?;
        } else if line.starts_with("fetch ") {
            let mut batch = vec![parse_fetch(&line)?];
            while let Some(next) = peek_continuation(&mut lines, "fetch ")? {
                batch.push(parse_fetch(&next)?);
            }
            let er = ensure_mirror!();
            handle_fetch(cr, er, &config, &batch)?;
            writeln!(stdout)?;
        } else if line.starts_with("push ") {
            let mut batch = vec![parse_push(&line)?];
            while let Some(next) = peek_continuation(&mut lines, "push ")? {
                batch.push(parse_push(&next)?);
            }
            let er = ensure_mirror!();
            handle_push(cr, er, &mirror_path, &config, &batch, &mut stdout)?;
            writeln!(stdout)?;
        } else {
            warn!("ignoring unrecognized remote-helper command: {line:?}");
        }
        stdout.flush()?;
    }

    Ok(())
}

/// Consumes the next line if it continues the same batched command
/// (matching `prefix`), stopping (without consuming) at the blank
/// terminator line.
fn peek_continuation(lines: &mut std::io::Lines<std::io::StdinLock<'_>>, prefix: &str) -> Result<Option<String>> {
    match lines.next() {
        Some(line) => {
            let line = line?;
            if line.is_empty() {
                Ok(None)
            } else if line.starts_with(prefix) {
                Ok(Some(line))
            } else {
                anyhow::bail!("expected a blank line or another {prefix:?} command, got {line:?}")
            }
        }
        None => Ok(None),
    }
}

fn handle_option(rest: &str, stdout: &mut impl Write) -> Result<()> {
    match rest.split(' ').next() {
        Some("progress") | Some("verbosity") | Some("atomic") | Some("followtags") => {
            writeln!(stdout, "ok")?
        }
        _ => writeln!(stdout, "unsupported")?,
    }
    Ok(())
}

/// `refs/incrypt/<hash>/...` is how `list` exposes ER tips as cleartext
/// references the host VCS can see without needing its own namespace
/// for "things this remote helper manages". Creating one requires the
/// cleartext commit it points at to already be in the CR -- see
/// `decrypt::decrypt_tips` below -- so the CR never holds a dangling
/// shadow tip.
fn shadow_prefix(url: &str) -> String {
    format!("refs/incrypt/{}/", mirror::url_hash(url))
}

fn handle_list(cr: &Repository, er: &Repository, url: &str, config: &Config, stdout: &mut impl Write) -> Result<()> {
    let meta = match metadata::read(er, &config.keytool) {
        Ok(meta) => meta,
        Err(e) => {
            debug!("treating remote as empty: {e:#}");
            writeln!(stdout)?;
            return Ok(());
        }
    };

    let prefix = shadow_prefix(url);
    let mut crypt_to_clear: HashMap<Oid, Oid> = ObjectMap::load_for_fetch(cr, &meta);

    let default_ref_name = format!("refs/heads/{}", meta.default_branch);
    let mut saw_default = false;
    let mut live_shadows: Vec<String> = Vec::new();

    for reference in er.references()? {
        let reference = reference?;
        let Some(name) = reference.name() else { continue };
        if name == METADATA_REF {
            continue;
        }
        let Some(clear_name) = refname::decrypt_ref(name, &meta.key) else {
            continue; // not one of ours
        };
        let Some(wrapper_id) = reference.target() else { continue };

        let clear_id = match decrypt::decrypt_tips(er, cr, &meta.key, &mut crypt_to_clear, &[wrapper_id]) {
            Ok(ids) => ids[0],
            Err(e) => {
                warn!("skipping {clear_name}: {e:#}");
                continue;
            }
        };

        let shadow_name = format!("{prefix}{clear_name}");
        cr.reference(&shadow_name, clear_id, true, "git-incrypt shadow ref")
            .with_context(|| format!("updating shadow ref {shadow_name}"))?;
        live_shadows.push(shadow_name);

        writeln!(stdout, "{clear_id} {clear_name}")?;
        saw_default |= clear_name == default_ref_name;
    }

    prune_stale_shadows(cr, &prefix, &live_shadows)?;

    if saw_default {
        writeln!(stdout, "@{default_ref_name} HEAD")?;
    }
    writeln!(stdout)?;
    Ok(())
}

/// Deletes any shadow ref under `prefix` that wasn't just (re)written,
/// i.e. no longer corresponds to a ref on the encrypted remote.
fn prune_stale_shadows(cr: &Repository, prefix: &str, live: &[String]) -> Result<()> {
    for reference in cr.references_glob(&format!("{prefix}**"))? {
        let mut reference = reference?;
        let Some(name) = reference.name().map(str::to_string) else { continue };
        if !live.contains(&name) {
            reference.delete().with_context(|| format!("deleting stale shadow ref {name}"))?;
        }
    }
    Ok(())
}

fn handle_fetch(cr: &Repository, er: &Repository, config: &Config, batch: &[FetchSpec]) -> Result<()> {
    let meta = metadata::read(er, &config.keytool)?;
    let mut crypt_to_clear: HashMap<Oid, Oid> = ObjectMap::load_for_fetch(cr, &meta);

    let mut clear_tip_to_wrapper: HashMap<Oid, Oid> = HashMap::new();
    for reference in er.references()? {
        let reference = reference?;
        if reference.name() == Some(METADATA_REF) {
            continue;
        }
        let Some(wrapper_id) = reference.target() else { continue };
        if let Ok(clear_id) = decrypt::peek_tip(er, cr, &meta.key, wrapper_id) {
            clear_tip_to_wrapper.insert(clear_id, wrapper_id);
        }
    }

    let wrappers: Vec<Oid> = batch
        .iter()
        .filter_map(|spec| clear_tip_to_wrapper.get(&spec.oid).copied())
        .collect();

    if wrappers.is_empty() {
        return Ok(());
    }
    decrypt::decrypt_tips(er, cr, &meta.key, &mut crypt_to_clear, &wrappers)?;
    Ok(())
}

fn handle_push(
    cr: &Repository,
    er: &Repository,
    mirror_path: &std::path::Path,
    config: &Config,
    batch: &[PushSpec],
    stdout: &mut impl Write,
) -> Result<()> {
    let mut meta = metadata::read(er, &config.keytool)?;
    let mut map = ObjectMap::load_for_push(er, &meta);

    let mut refspecs = Vec::new();
    for spec in batch {
        let result = push_one(cr, er, &meta, &mut map, spec);
        match result {
            Ok(refspec) => {
                writeln!(stdout, "ok {}", spec.dst)?;
                refspecs.push(refspec);
            }
            Err(e) => writeln!(stdout, "error {} {}", spec.dst, format_single_line(&e))?,
        }
    }

    if refspecs.is_empty() {
        return Ok(());
    }

    meta.records = map.into_records();
    metadata::write(er, &config.keytool, &config.recipients, &meta)?;
    refspecs.push(format!("{METADATA_REF}:{METADATA_REF}"));

    mirror::push(mirror_path, &refspecs)
}

fn push_one(cr: &Repository, er: &Repository, meta: &MetaData, map: &mut ObjectMap, spec: &PushSpec) -> Result<String> {
    let dst_ref = refname::encrypt_ref(&spec.dst, &meta.key);

    let Some(src) = &spec.src else {
        return Ok(format!(":{dst_ref}"));
    };

    let clear_id = cr
        .revparse_single(src)
        .with_context(|| format!("resolving push source {src:?}"))?
        .id();

    if !spec.force {
        check_fast_forward(cr, er, meta, &dst_ref, clear_id)?;
    }

    let wrapper_id = encrypt::encrypt_tips(cr, er, &meta.key, &meta.template, map, &[clear_id])?[0];
    let prefix = if spec.force { "+" } else { "" };
    Ok(format!("{prefix}{wrapper_id}:{dst_ref}"))
}

fn check_fast_forward(cr: &Repository, er: &Repository, meta: &MetaData, dst_ref: &str, new_clear_id: Oid) -> Result<()> {
    let Some(existing) = util::peel_reference_to_commit(er, dst_ref)? else {
        return Ok(()); // new ref, nothing to fast-forward over
    };
    let old_wrapper = existing.id();
    let Ok(old_clear) = decrypt::peek_tip(er, cr, &meta.key, old_wrapper) else {
        return Ok(());
    };
    if old_clear == new_clear_id || cr.graph_descendant_of(new_clear_id, old_clear).unwrap_or(false) {
        Ok(())
    } else {
        anyhow::bail!("non-fast-forward")
    }
}

fn format_single_line(e: &anyhow::Error) -> String {
    e.to_string().replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn fake_keytool(dir: &std::path::Path) -> String {
        let path = dir.join("fake-keytool");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "exec cat").unwrap();
        drop(file);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_str().unwrap().to_string()
    }

    fn bare_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        (dir, repo)
    }

    fn commit(repo: &Repository, parent: Option<&git2::Commit>, content: &str) -> Oid {
        let mut builder = repo.treebuilder(None).unwrap();
        let blob = repo.blob(content.as_bytes()).unwrap();
        builder.insert("f", blob, git2::FileMode::Blob.into()).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = git2::Signature::now("A", "a@example.com").unwrap();
        let parents: Vec<&git2::Commit> = parent.into_iter().collect();
        repo.commit(None, &sig, &sig, "c\n", &tree, &parents).unwrap()
    }

    #[test]
    fn parse_fetch_extracts_the_object_id() {
        let spec = parse_fetch("fetch 0123456789012345678901234567890123456789 refs/heads/main").unwrap();
        assert_eq!(spec.oid, Oid::from_str("0123456789012345678901234567890123456789").unwrap());
    }

    #[test]
    fn parse_push_splits_force_src_and_dst() {
        let normal = parse_push("push refs/heads/a:refs/heads/b").unwrap();
        assert!(!normal.force);
        assert_eq!(normal.src.as_deref(), Some("refs/heads/a"));
        assert_eq!(normal.dst, "refs/heads/b");

        let forced = parse_push("push +refs/heads/a:refs/heads/b").unwrap();
        assert!(forced.force);

        let deletion = parse_push("push :refs/heads/b").unwrap();
        assert_eq!(deletion.src, None);
        assert_eq!(deletion.dst, "refs/heads/b");
    }

    #[test]
    fn push_one_rejects_non_fast_forward_without_force() {
        let (_kdir, keytool) = {
            let d = TempDir::new().unwrap();
            let k = fake_keytool(d.path());
            (d, k)
        };
        let (_er_dir, er) = bare_repo();
        let (_cr_dir, cr) = bare_repo();

        let template = metadata::build_template("A", "a@example.com", 0, &[]);
        let meta = metadata::init(&er, &keytool, &["x@example.com".to_string()], &template, "main").unwrap();

        let first = commit(&cr, None, "1");
        let mut map = ObjectMap::load_for_push(&er, &meta);
        let spec = PushSpec { force: false, src: Some(format!("{first}")), dst: "refs/heads/main".to_string() };
        let wrapper = push_one(&cr, &er, &meta, &mut map, &spec).unwrap();
        let wrapper_id: Oid = wrapper.split(':').next().unwrap().parse().unwrap();
        let dst_ref = refname::encrypt_ref("refs/heads/main", &meta.key);
        er.reference(&dst_ref, wrapper_id, true, "test").unwrap();

        // An unrelated commit, not a descendant of `first`.
        let sibling = commit(&cr, None, "2");
        let sibling_spec = PushSpec { force: false, src: Some(format!("{sibling}")), dst: "refs/heads/main".to_string() };
        let err = push_one(&cr, &er, &meta, &mut map, &sibling_spec).expect_err("must reject");
        assert!(err.to_string().contains("non-fast-forward"));

        // The same sibling with force set must succeed.
        let forced_spec = PushSpec { force: true, src: Some(format!("{sibling}")), dst: "refs/heads/main".to_string() };
        assert!(push_one(&cr, &er, &meta, &mut map, &forced_spec).is_ok());
    }

    #[test]
    fn push_one_allows_a_genuine_fast_forward() {
        let (_kdir, keytool) = {
            let d = TempDir::new().unwrap();
            let k = fake_keytool(d.path());
            (d, k)
        };
        let (_er_dir, er) = bare_repo();
        let (_cr_dir, cr) = bare_repo();

        let template = metadata::build_template("A", "a@example.com", 0, &[]);
        let meta = metadata::init(&er, &keytool, &["x@example.com".to_string()], &template, "main").unwrap();

        let first = commit(&cr, None, "1");
        let first_commit = cr.find_commit(first).unwrap();
        let mut map = ObjectMap::load_for_push(&er, &meta);
        let spec = PushSpec { force: false, src: Some(format!("{first}")), dst: "refs/heads/main".to_string() };
        let wrapper = push_one(&cr, &er, &meta, &mut map, &spec).unwrap();
        let wrapper_id: Oid = wrapper.split(':').next().unwrap().parse().unwrap();
        let dst_ref = refname::encrypt_ref("refs/heads/main", &meta.key);
        er.reference(&dst_ref, wrapper_id, true, "test").unwrap();

        let second = commit(&cr, Some(&first_commit), "2");
        let second_spec = PushSpec { force: false, src: Some(format!("{second}")), dst: "refs/heads/main".to_string() };
        assert!(push_one(&cr, &er, &meta, &mut map, &second_spec).is_ok());
    }
}
