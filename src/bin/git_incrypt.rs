//! `git-incrypt`: the companion CLI to `git-remote-incrypt`, used to
//! bootstrap a fresh encrypted remote and inspect or regenerate its
//! remote-helper configuration.

use anyhow::{Context, Result};
use clap::{App, Arg, SubCommand};
use git_incrypt::metadata;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run() {
        eprintln!("git-incrypt: error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = App::new("git-incrypt")
        .about("Bootstraps and manages encrypted git remotes")
        .subcommand(
            SubCommand::with_name("init")
                .about("Initializes a fresh encrypted remote in the current repository's working tree")
                .arg(Arg::from_usage("-n, --name=[NAME] 'Commit author/committer name for wrapper commits'"))
                .arg(Arg::from_usage("-e, --email=[EMAIL] 'Commit author/committer email for wrapper commits'"))
                .arg(Arg::from_usage("-d, --date=[EPOCH] 'Commit timestamp (seconds since epoch) for wrapper commits'"))
                .arg(Arg::from_usage("-m, --message=[MSG]... 'Commit message line for wrapper commits (repeatable)'"))
                .arg(Arg::from_usage("-b, --branch=[NAME] 'Default branch name announced as HEAD'").default_value("main"))
                .arg(Arg::from_usage("-k, --keytool=[TOOL] 'External key-management tool'").default_value("gpg"))
                .arg(Arg::from_usage("<PATH> 'Bare repository to initialize as the encrypted remote'"))
                .arg(Arg::from_usage("<RECIPIENT>... 'Key-management recipients able to unwrap the symmetric key'")),
        )
        .subcommand(
            SubCommand::with_name("generate-configuration")
                .about("Prints a [remote] stanza suitable for .git/config")
                .arg(Arg::from_usage("<NAME> 'Remote name'"))
                .arg(Arg::from_usage("<URL> 'Encrypted remote URL'")),
        )
        .get_matches();

    match matches.subcommand() {
        ("init", Some(sub)) => cmd_init(sub),
        ("generate-configuration", Some(sub)) => cmd_generate_configuration(sub),
        _ => {
            eprintln!("usage: git-incrypt <init|generate-configuration> ...");
            std::process::exit(2);
        }
    }
}

fn cmd_init(sub: &clap::ArgMatches) -> Result<()> {
    let path = sub.value_of("PATH").expect("required");
    let name = sub.value_of("name").unwrap_or("git-incrypt");
    let email = sub.value_of("email").unwrap_or("git-incrypt@localhost");
    let date: i64 = match sub.value_of("date") {
        Some(v) => v.parse().context("--date must be an integer epoch timestamp")?,
        None => 0,
    };
    let messages: Vec<String> = sub
        .values_of("message")
        .map(|v| v.map(str::to_string).collect())
        .unwrap_or_default();
    let default_branch = sub.value_of("branch").expect("has a default");
    let keytool = sub.value_of("keytool").expect("has a default");
    let recipients: Vec<String> = sub
        .values_of("RECIPIENT")
        .expect("required")
        .map(str::to_string)
        .collect();

    let repo = git_incrypt::util::open_create_bare_repository(std::path::Path::new(path))
        .with_context(|| format!("opening or creating {path}"))?;

    let template = metadata::build_template(name, email, date, &messages);
    metadata::init(&repo, keytool, &recipients, &template, default_branch)
        .context("writing the initial metadata record")?;

    println!("Initialized encrypted remote at {path}");
    println!("Recipients: {}", recipients.join(", "));
    Ok(())
}

fn cmd_generate_configuration(sub: &clap::ArgMatches) -> Result<()> {
    let name = sub.value_of("NAME").expect("required");
    let url = sub.value_of("URL").expect("required");
    println!("[remote \"{name}\"]");
    println!("\turl = {url}");
    println!("\tvcs = incrypt");
    println!("\t# Optional overrides, all under remote.{name}.*:");
    println!("\t# incrypt-keytool = gpg");
    println!("\t# incrypt-progress = true");
    println!("\t# incrypt-recipient = you@example.com");
    Ok(())
}
