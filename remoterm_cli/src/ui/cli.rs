use std::io::{stdout, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use log::{info, warn};
use remoterm_core::core::ConnectionPhase;
use remoterm_core::storage::{AuthMethod, ConnectionProfile, FileProfileStore, ProfileRepository};
use remoterm_core::sync::{SyncOutcome, SyncStrategy};
use remoterm_core::{ClientConfig, HttpProfileApi, ProfileSyncEngine, RemoteTerminal};
use tokio::io::{self, AsyncReadExt};

const CTRL_A: u8 = 0x01;
const CTRL_C: u8 = 0x03;

/// Restores the terminal mode even when the session loop bails out early.
struct RawModeGuard;

impl RawModeGuard {
    /// Disables line-buffering and echo on all supported platforms.
    fn enable() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "remoterm", version, subcommand_required = true)]
pub struct Args {
    /// Configuration file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Profile directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub profiles_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open an interactive shell through the backend
    Connect {
        /// Profile id or name
        #[arg(long)]
        profile: String,
        /// Override the backend URL from the configuration
        #[arg(long)]
        url: Option<String>,
    },
    /// Manage saved connection profiles
    Profiles {
        #[command(subcommand)]
        action: ProfilesAction,
    },
    /// Reconcile local profiles with the remote profile API
    Sync {
        /// upload-local, download-remote or merge (default from configuration)
        #[arg(long)]
        strategy: Option<SyncStrategy>,
        /// Only report differences, write nothing
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfilesAction {
    /// List saved profiles
    List,
    /// Save a new profile
    Add(NewProfile),
    /// Delete a profile by id
    Remove { id: String },
}

#[derive(ClapArgs, Debug)]
pub struct NewProfile {
    #[arg(long)]
    name: String,
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = 22)]
    port: u16,
    #[arg(long)]
    username: String,
    /// Password authentication
    #[arg(long, conflicts_with = "key")]
    password: Option<String>,
    /// Private key authentication
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    passphrase: Option<String>,
    #[arg(long, default_value = "")]
    description: String,
    /// Comma separated
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
}

pub async fn run_cli(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    let store = match &args.profiles_dir {
        Some(dir) => FileProfileStore::with_dir(dir)?,
        None => FileProfileStore::new()?,
    };

    match args.command {
        Command::Connect { profile, url } => {
            let mut config = config;
            if let Some(url) = url {
                config.backend.url = url;
            }
            run_connect(&config, &store, &profile).await
        }
        Command::Profiles { action } => run_profiles(&store, action).await,
        Command::Sync { strategy, check } => run_sync(&config, store, strategy, check).await,
    }
}

async fn find_profile(store: &FileProfileStore, key: &str) -> Result<ConnectionProfile> {
    if let Some(p) = store.get(key).await? {
        return Ok(p);
    }
    store
        .list()
        .await?
        .into_iter()
        .find(|p| p.name == key)
        .ok_or_else(|| anyhow!("no profile with id or name '{key}'"))
}

async fn run_profiles(store: &FileProfileStore, action: ProfilesAction) -> Result<()> {
    match action {
        ProfilesAction::List => {
            let profiles = store.list().await?;
            if profiles.is_empty() {
                println!("No profiles in {}", store.dir().display());
            }
            for p in profiles {
                println!(
                    "{}  {:<20} {}@{}:{}  [{}]",
                    p.id,
                    p.name,
                    p.username,
                    p.host,
                    p.port,
                    p.tags.join(",")
                );
            }
        }
        ProfilesAction::Add(new) => {
            let auth = match (new.password, new.key) {
                (_, Some(key_path)) => AuthMethod::PrivateKey {
                    key_path,
                    passphrase: new.passphrase,
                },
                (Some(password), None) => AuthMethod::Password { password },
                (None, None) => bail!("either --password or --key is required"),
            };
            let mut profile = ConnectionProfile::new(new.name, new.host, new.port, new.username, auth);
            profile.description = new.description;
            profile.tags = new.tags;
            profile.validate()?;
            store.upsert(&profile).await?;
            println!("Saved profile {}", profile.id);
        }
        ProfilesAction::Remove { id } => {
            if store.delete(&id).await? {
                println!("Removed profile {id}");
            } else {
                bail!("no profile with id '{id}'");
            }
        }
    }
    Ok(())
}

async fn run_sync(
    config: &ClientConfig,
    store: FileProfileStore,
    strategy: Option<SyncStrategy>,
    check: bool,
) -> Result<()> {
    let api_url = config
        .sync
        .api_url
        .clone()
        .ok_or_else(|| anyhow!("sync.api_url is not configured"))?;
    let remote = HttpProfileApi::new(&api_url, config.sync.token.clone())?;
    let engine = ProfileSyncEngine::new(Arc::new(store), Arc::new(remote), &config.sync);

    if check {
        match engine.sync().await? {
            SyncOutcome::Completed(_) => println!("Profiles are in sync."),
            SyncOutcome::Conflict(diff) => {
                println!("Only local:   {:?}", diff.local_only);
                println!("Only remote:  {:?}", diff.server_only);
                println!("Conflicting:  {:?}", diff.conflicts);
            }
        }
        return Ok(());
    }

    let result = engine.full_sync(strategy).await?;
    if result.success {
        println!("Synced {} profile(s).", result.synced_count);
        Ok(())
    } else {
        bail!(
            "sync stopped after {} profile(s): {}",
            result.synced_count,
            result.error.unwrap_or_default()
        )
    }
}

/// Runs the interactive loop for one session.
///
/// Keystrokes go to the session as terminal input, Ctrl+C as a control
/// command. It exits when the user types Ctrl+A followed by 'x'.
async fn run_connect(config: &ClientConfig, store: &FileProfileStore, key: &str) -> Result<()> {
    let mut profile = find_profile(store, key).await?;
    let client = RemoteTerminal::new(config)?;

    info!("Connecting to {} via {}", profile.host, config.backend.url);
    client.connect(profile.clone()).await?;
    profile.mark_connected();
    if let Err(e) = store.upsert(&profile).await {
        warn!("Could not record the connection time: {}", e);
    }

    let sessions = client.sessions().clone();
    let id = sessions.create_session(Some(&profile)).await?;
    let mut output = sessions.subscribe(&id)?;

    // -> echo to the user's terminal
    tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            let _ = stdout().write_all(chunk.as_bytes());
            let _ = stdout().flush();
        }
    });

    let mut states = client.connection().subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match &state.phase {
                ConnectionPhase::Reconnecting { delay, .. } => {
                    warn!("Link lost, reconnecting in {:?} (attempt {})", delay, state.attempt)
                }
                ConnectionPhase::Error => {
                    if let Some(e) = &state.last_error {
                        warn!("{}", e);
                        for hint in &e.suggestions {
                            warn!("  - {}", hint);
                        }
                    }
                }
                phase => info!("Connection {:?}", phase),
            }
        }
    });

    if let Ok((cols, rows)) = terminal::size() {
        sessions.resize_terminal(&id, cols, rows).await?;
    }

    info!("Enable raw mode. Press Ctrl+A then 'x' to exit the program.");
    let raw = RawModeGuard::enable()?;

    let mut last_was_ctrl_a = false;
    let mut buf = [0u8; 1024];
    // bytes not sent yet, including a character split across reads
    let mut pending = Vec::with_capacity(buf.len());
    let mut stdin = io::stdin();
    'input: loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &ch in &buf[..n] {
            if ch == CTRL_A {
                last_was_ctrl_a = true;
                continue;
            }
            if last_was_ctrl_a && ch == b'x' {
                break 'input;
            }
            last_was_ctrl_a = false;
            if ch == CTRL_C {
                flush_input(&sessions, &id, &mut pending).await;
                if let Err(e) = sessions.send_terminal_control(&id, "SIGINT").await {
                    warn!("Could not interrupt: {}", e);
                }
                continue;
            }
            pending.push(ch);
        }
        flush_input(&sessions, &id, &mut pending).await;
    }

    drop(raw);
    info!("Exiting...");
    client.shutdown().await;
    info!("Terminal mode restored.");
    Ok(())
}

async fn flush_input(
    sessions: &remoterm_core::TerminalSessionService,
    id: &str,
    pending: &mut Vec<u8>,
) {
    let text = take_utf8(pending);
    if text.is_empty() {
        return;
    }
    // input typed while the link is down is dropped, not queued
    if let Err(e) = sessions.send_terminal_data(id, &text).await {
        warn!("Input dropped: {}", e);
    }
}

/// Takes the decodable part of `buf`. A character cut off by the end of a
/// read stays in `buf`; bytes that can never be valid become U+FFFD.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buf) {
            Ok(text) => {
                out.push_str(text);
                buf.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&buf[..valid]).unwrap_or_default());
                match e.error_len() {
                    None => {
                        buf.drain(..valid);
                        return out;
                    }
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        buf.drain(..valid + bad);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_characters_wait_for_the_next_read() {
        let bytes = "ls ü€".as_bytes();
        let mut pending = bytes[..bytes.len() - 1].to_vec();
        assert_eq!(take_utf8(&mut pending), "ls ü");
        assert_eq!(pending, &bytes[bytes.len() - 3..bytes.len() - 1]);

        pending.push(bytes[bytes.len() - 1]);
        assert_eq!(take_utf8(&mut pending), "€");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut pending = vec![b'a', 0xff, b'b'];
        assert_eq!(take_utf8(&mut pending), "a\u{fffd}b");
        assert!(pending.is_empty());
    }
}
