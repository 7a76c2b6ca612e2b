//! `git-remote-incrypt`: the remote helper git invokes as
//! `git-remote-incrypt <remote-name> <url>` for any remote whose URL
//! is prefixed `incrypt::`. Speaks the remote-helper protocol on
//! stdin/stdout against the cleartext repository found via `GIT_DIR`.

use anyhow::{Context, Result};
use clap::{App, Arg};
use git_incrypt::{config, helper};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run() {
        eprintln!("git-remote-incrypt: error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = App::new("git-remote-incrypt")
        .about("git remote helper for incrypt:: encrypted remotes")
        .arg(Arg::from_usage("-d, --debug 'Dump the metadata record and object map instead of speaking the protocol'"))
        .arg(Arg::from_usage("<NAME> 'Remote name'"))
        .arg(Arg::from_usage("<URL> 'Encrypted remote URL'"))
        .get_matches();

    let remote_name = matches.value_of("NAME").expect("required");
    let url = matches
        .value_of("URL")
        .expect("required")
        .strip_prefix("incrypt::")
        .unwrap_or_else(|| matches.value_of("URL").expect("required"));

    let args = config::Args::from_env()?;
    let cr = git2::Repository::open(&args.git_dir)
        .with_context(|| format!("opening cleartext repository at {}", args.git_dir.display()))?;

    if matches.is_present("debug") {
        return do_debug_dump(&cr, remote_name, url);
    }

    helper::run(&cr, remote_name, url)
}

fn do_debug_dump(cr: &git2::Repository, remote_name: &str, url: &str) -> Result<()> {
    let git_config = cr.config()?;
    let config = config::Config::read(&git_config, remote_name)?;
    let er = git_incrypt::mirror::open(cr.path(), url)?;

    match git_incrypt::metadata::read(&er, &config.keytool) {
        Ok(meta) => {
            println!("default branch: {}", meta.default_branch);
            println!("template bytes: {}", meta.template.len());
            println!("object map entries: {}", meta.records.len());
        }
        Err(e) => println!("no metadata record: {e:#}"),
    }
    Ok(())
}
