//! kdbx - inspect, list and re-save KeePass databases
//!
//! Provides:
//! - `info`: header summary, no credentials needed
//! - `list`: group tree with entry titles
//! - `show`: fields of one entry
//! - `resave`: re-encrypt with fresh keys, optionally converting the format

mod config;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use kdbx_core::{
    Credentials, Database, FieldValue, FormatVersion, GroupTreeNode, Header, KdfParams,
    ProgressEvent, Uuid,
};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "kdbx", version, about = "Inspect and re-save KDBX databases")]
struct Cli {
    /// Configuration file (defaults to kdbx-tool.toml, config.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the outer header without decrypting
    Info { path: PathBuf },
    /// Print the group tree and entry titles
    List {
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Print the fields of one entry, found by UUID or title
    Show {
        #[command(flatten)]
        unlock: Unlock,
        entry: String,
        /// Print protected values instead of masking them
        #[arg(long)]
        reveal: bool,
    },
    /// Decode and write the database again with fresh keys
    Resave {
        #[command(flatten)]
        unlock: Unlock,
        /// Write here instead of replacing the input
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Target format: 3.1, 4.0 or 4.1
        #[arg(long)]
        format: Option<String>,
    },
}

#[derive(Args)]
struct Unlock {
    path: PathBuf,
    /// Key file combined with the password
    #[arg(long)]
    keyfile: Option<PathBuf>,
    #[arg(long, env = "KDBX_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Unlock with the key file alone
    #[arg(long, requires = "keyfile")]
    no_password: bool,
}

impl Unlock {
    fn credentials(&self) -> anyhow::Result<Credentials> {
        let mut credentials = Credentials::new();
        if !self.no_password {
            let password = match &self.password {
                Some(password) => password.clone(),
                None => rpassword::prompt_password("Password: ")
                    .context("reading password from the terminal")?,
            };
            credentials = credentials.with_password(&password);
        }
        if let Some(path) = &self.keyfile {
            let contents = std::fs::read(path)
                .with_context(|| format!("reading key file {}", path.display()))?;
            credentials = credentials.with_key_file(&contents)?;
        }
        Ok(credentials)
    }

    fn open(&self, config: &Config) -> anyhow::Result<(Database, Credentials)> {
        let data = std::fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let credentials = self.credentials()?;
        let db = Database::open_with(&data, &credentials, &config.codec, &log_progress)
            .with_context(|| format!("opening {}", self.path.display()))?;
        Ok((db, credentials))
    }
}

fn log_progress(event: ProgressEvent) -> ControlFlow<()> {
    tracing::trace!("{:?}", event);
    ControlFlow::Continue(())
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kdbx_tool=info,kdbx_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Info { path } => info(&path),
        Command::List { unlock } => list(&unlock, &config),
        Command::Show {
            unlock,
            entry,
            reveal,
        } => show(&unlock, &config, &entry, reveal),
        Command::Resave {
            unlock,
            output,
            format,
        } => resave(&unlock, &config, output.as_deref(), format.or(config.save.format.clone())),
    }
}

fn info(path: &Path) -> anyhow::Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let header = Header::read(&data)?;

    println!("Version:     KDBX {}", header.version);
    println!("Cipher:      {:?}", header.cipher);
    println!("Compression: {:?}", header.compression);
    match &header.kdf {
        KdfParams::Aes { rounds, .. } => println!("KDF:         AES-KDF, {} rounds", rounds),
        KdfParams::Argon2 {
            variant,
            memory,
            iterations,
            parallelism,
            ..
        } => println!(
            "KDF:         {:?}, {} KiB, {} iterations, {} lanes",
            variant,
            memory / 1024,
            iterations,
            parallelism
        ),
    }
    Ok(())
}

fn list(unlock: &Unlock, config: &Config) -> anyhow::Result<()> {
    let (db, _) = unlock.open(config)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    print_group(&db, &db.group_tree(), 0, &mut out)?;
    Ok(())
}

fn print_group(
    db: &Database,
    node: &GroupTreeNode,
    depth: usize,
    out: &mut impl Write,
) -> std::io::Result<()> {
    let indent = "  ".repeat(depth);
    writeln!(out, "{}{}/", indent, node.name)?;
    for entry in db.entries_in_group(&node.uuid) {
        if entry.username().is_empty() {
            writeln!(out, "{}  {}", indent, entry.title())?;
        } else {
            writeln!(out, "{}  {} ({})", indent, entry.title(), entry.username())?;
        }
    }
    for child in &node.children {
        print_group(db, child, depth + 1, out)?;
    }
    Ok(())
}

fn show(unlock: &Unlock, config: &Config, selector: &str, reveal: bool) -> anyhow::Result<()> {
    let (db, _) = unlock.open(config)?;

    let entry = match selector.parse::<Uuid>() {
        Ok(uuid) => db.get_entry(&uuid),
        Err(_) => {
            let mut matches = db.entries_in_order().into_iter().filter(|e| e.title() == selector);
            let first = matches.next();
            if first.is_some() && matches.next().is_some() {
                bail!("more than one entry is titled {:?}; use its UUID", selector);
            }
            first
        }
    };
    let Some(entry) = entry else {
        bail!("no entry matches {:?}", selector);
    };

    println!("UUID: {}", entry.uuid);
    if let Some(group) = entry.parent_group {
        println!("Group: {}", db.group_path(&group).join("/"));
    }
    for field in entry.fields() {
        match &field.value {
            FieldValue::Plain(text) => println!("{}: {}", field.key, text),
            FieldValue::Protected(value) if reveal => {
                println!("{}: {}", field.key, db.reveal(value)?.as_str())
            }
            FieldValue::Protected(_) => println!("{}: ********", field.key),
        }
    }
    if !entry.tags.is_empty() {
        println!("Tags: {}", entry.tags.join(", "));
    }
    for attachment in &entry.attachments {
        let size = db.attachment_data(&attachment.binary).map_or(0, |d| d.len());
        println!("Attachment: {} ({} bytes)", attachment.name, size);
    }
    println!("History: {} revisions", entry.history.len());
    Ok(())
}

fn resave(
    unlock: &Unlock,
    config: &Config,
    output: Option<&Path>,
    format: Option<String>,
) -> anyhow::Result<()> {
    let (db, credentials) = unlock.open(config)?;

    let mut policy = db.policy().clone();
    if let Some(format) = format {
        policy.version = format.parse::<FormatVersion>()?;
        if policy.version.major < 4 {
            if !matches!(policy.kdf, KdfParams::Aes { .. }) {
                tracing::info!("KDBX {} requires AES-KDF; switching KDF", policy.version);
                policy.kdf = KdfParams::default_aes();
            }
            policy.public_custom_data = None;
        }
    }

    let data = db.save_with(&policy, &credentials, &config.codec, &log_progress)?;

    let target = output.unwrap_or(&unlock.path);
    if output.is_none() && config.save.backup {
        let backup = backup_path(target);
        std::fs::copy(target, &backup)
            .with_context(|| format!("writing backup {}", backup.display()))?;
        tracing::info!("Kept previous file as {}", backup.display());
    }
    write_atomically(target, &data)?;
    tracing::info!("Wrote KDBX {} to {}", policy.version, target.display());
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Write through a temporary file in the target directory, then rename over it
fn write_atomically(target: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(target)
        .with_context(|| format!("replacing {}", target.display()))?;
    Ok(())
}
