//! # sigil
//!
//! Headless Sigil client: connects to the relay, keeps the local cache in
//! sync and reads commands from stdin.
//!
//! ```text
//! /open <address>     switch to the dialog with <address> and load history
//! /send <text>        send <text> to the current dialog
//! /room <id>          join a room and switch to it
//! /more [count]       load older messages
//! /typing             send a typing signal to the current dialog
//! /ttl <seconds>      disappearing timer for the current dialog (0 = off)
//! /block <address>    /unblock <address>
//! /delete <address>   remove a contact (its messages stay)
//! /show               print the current timeline
//! /contacts           list contacts
//! /quit
//! <text>              same as /send
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use sigil_engine::{ttl_secs, EngineConfig, SessionHandle, TracingObserver};
use sigil_shared::{Address, DialogId, Identity};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("sigil=info,sigil_engine=debug,sigil_net=debug,sigil_store=info,warn")
            }),
        )
        .init();

    info!("Starting Sigil client v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    info!(?config, "Loaded configuration");

    let address = match std::env::var("SIGIL_ADDRESS") {
        Ok(a) if !a.trim().is_empty() => Address::new(a.trim()),
        _ => bail!("SIGIL_ADDRESS must name the wallet address to run as"),
    };
    let key_path = match std::env::var("SIGIL_KEY_PATH") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => sigil_store::default_data_dir()?.join("identity.key"),
    };
    let identity = load_or_create_identity(&key_path, address)?;
    info!(
        address = %identity.address(),
        public_key = %hex::encode(identity.public_key().as_bytes()),
        "Identity ready"
    );

    let session = sigil_engine::open_session(identity, config).await?;
    session.set_observer(Arc::new(TracingObserver));

    let mut current: Option<DialogId> = None;
    let mut peer: Option<Address> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(&session, line.trim(), &mut current, &mut peer).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(error = %e, "command failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.shutdown().await?;
    info!("Sigil client stopped");
    Ok(())
}

fn load_or_create_identity(path: &Path, address: Address) -> anyhow::Result<Identity> {
    if path.exists() {
        let hex_secret = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return Ok(Identity::from_secret_hex(address, &hex_secret)?);
    }
    let identity = Identity::generate(address)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, identity.secret_hex())
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Generated new encryption key");
    Ok(identity)
}

/// Returns `Ok(false)` when the user asked to quit.
async fn run_command(
    session: &SessionHandle,
    line: &str,
    current: &mut Option<DialogId>,
    peer: &mut Option<Address>,
) -> anyhow::Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
    let arg = arg.trim();

    match cmd {
        "/quit" => return Ok(false),
        "/open" => {
            let address = Address::new(arg);
            let dialog_id = session.dialog_with(&address);
            let loaded = session.open_dialog(dialog_id.clone()).await?;
            session.set_active_dialog(Some(dialog_id.clone())).await?;
            info!(dialog = %dialog_id, loaded, "Dialog opened");
            *current = Some(dialog_id);
            *peer = Some(address);
        }
        "/room" => {
            let dialog_id = DialogId::room(arg);
            session.join_room(arg).await?;
            session.open_dialog(dialog_id.clone()).await?;
            session.set_active_dialog(Some(dialog_id.clone())).await?;
            *current = Some(dialog_id);
            *peer = None;
        }
        "/more" => {
            let dialog_id = current.clone().context("no dialog open")?;
            let count = if arg.is_empty() { 50 } else { arg.parse()? };
            let loaded = session.load_more(dialog_id, count).await?;
            info!(loaded, "Older messages loaded");
        }
        "/typing" => {
            let dialog_id = current.clone().context("no dialog open")?;
            session.send_typing(dialog_id).await?;
        }
        "/ttl" => {
            let dialog_id = current.clone().context("no dialog open")?;
            session.set_disappearing(dialog_id, ttl_secs(arg.parse()?)).await?;
        }
        "/block" => session.block(Address::new(arg)).await?,
        "/unblock" => session.unblock(Address::new(arg)).await?,
        "/delete" => {
            let removed = session.delete_contact(Address::new(arg)).await?;
            info!(address = arg, removed, "Contact deleted");
        }
        "/show" => {
            let dialog_id = current.clone().context("no dialog open")?;
            if let Some(view) = session.timeline(dialog_id).await? {
                for m in &view.messages {
                    println!(
                        "[{}] {} {}: {}",
                        m.timestamp.format("%H:%M:%S"),
                        m.status.as_str(),
                        m.sender.short(),
                        m.plaintext.as_deref().unwrap_or_default()
                    );
                }
            }
        }
        "/contacts" => {
            for c in session.contacts().await? {
                println!(
                    "{} {} unread={}{}",
                    c.address,
                    c.display_name.as_deref().unwrap_or("-"),
                    c.unread,
                    if c.blocked { " blocked" } else { "" }
                );
            }
        }
        "/send" => send_text(session, current, peer, arg).await?,
        _ if cmd.starts_with('/') => bail!("unknown command {cmd}"),
        _ => send_text(session, current, peer, line).await?,
    }
    Ok(true)
}

async fn send_text(
    session: &SessionHandle,
    current: &Option<DialogId>,
    peer: &Option<Address>,
    text: &str,
) -> anyhow::Result<()> {
    let dialog_id = current.as_ref().context("no dialog open")?;
    let id = match (dialog_id.room_id(), peer) {
        (Some(room_id), _) => session.send_room_message(room_id, text, None).await?,
        (None, Some(address)) => session.send_message(address.clone(), text, None).await?,
        (None, None) => bail!("no recipient for the current dialog"),
    };
    info!(id = %id, "Message queued");
    Ok(())
}
