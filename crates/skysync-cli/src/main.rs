//! skysync - command-line host for the skysync session and offline cache
//! engine.
//!
//! Signs accounts in and out, reads through the persisted cache and queues
//! mutations for replay against the protocol service.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use skysync_core::queue::DrainReport;
use skysync_core::{
    CacheKey, Config, Connectivity, CredentialCipher, Did, FileStorage, Freshness, Invalidation,
    Operation, Query, SyncClient, XrpcService,
};

// ============================================================================
// Constants
// ============================================================================

/// OS keychain service holding the credential encryption key
const KEYRING_SERVICE: &str = "skysync";

/// Salt for passphrase-derived credential keys
const PASSPHRASE_SALT: &[u8] = b"skysync.credential-store.v1";

/// How often to check whether a background revalidation has finished
const REVALIDATION_POLL_MS: u64 = 50;

const USAGE: &str = "\
Usage: skysync <command> [args]

Commands:
  login [identifier]                  Sign in (password from SKYSYNC_PASSWORD or prompt)
  logout [did]                        Sign out the given or active account
  accounts                            List signed-in accounts
  switch <did>                        Make another account active
  get <nsid> [key=value ...]          Read through the cache
  post <nsid> <json> [--invalidate <domain>]
                                      Queue a mutation and replay it
  queue                               Show queued mutations
  retry <seq>                         Requeue a failed mutation
  sweep                               Evict expired cache entries";

/// Initialize the tracing subscriber: stderr plus a daily log file.
///
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "skysync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;
    if let Some(service) = env_var("SKYSYNC_SERVICE") {
        config.service_url = service;
    }

    let _guard = init_tracing(config.log_dir().ok().as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    if command == "help" || command == "--help" || command == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    info!(command = %command, service = %config.service_url, "skysync starting");
    let client = open_client(&config).await?;
    let rest = &args[1..];

    let result = match command.as_str() {
        "login" => login(&client, &mut config, rest.first().cloned()).await,
        "logout" => logout(&client, rest.first()).await,
        "accounts" => {
            list_accounts(&client);
            Ok(())
        }
        "switch" => {
            let did = rest.first().context("switch needs an account DID")?;
            client.switch_active(&Did::new(did.as_str())).await?;
            println!("Active account: {}", did);
            Ok(())
        }
        "get" => get(&client, rest).await,
        "post" => post(&client, rest).await,
        "queue" => {
            show_queue(&client).await;
            Ok(())
        }
        "retry" => retry(&client, rest.first()).await,
        "sweep" => {
            let report = client.sweep().await?;
            println!(
                "Evicted {} entries, rescheduled {} revalidations",
                report.evicted.len(),
                report.revalidations_scheduled
            );
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    };

    client.stop().await;
    result
}

async fn open_client(config: &Config) -> Result<SyncClient> {
    let service = XrpcService::with_timeout(&config.service_url, config.policy.request_timeout())
        .context("Failed to create HTTP client")?;
    let data_dir = config.data_dir()?;
    let storage = FileStorage::new(data_dir.join("store"))
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    let cipher = match env_var("SKYSYNC_PASSPHRASE") {
        Some(passphrase) => CredentialCipher::from_passphrase(&passphrase, PASSPHRASE_SALT)?,
        None => CredentialCipher::from_keyring(KEYRING_SERVICE)
            .context("OS keychain unavailable; set SKYSYNC_PASSPHRASE instead")?,
    };

    let client = SyncClient::builder(Arc::new(service), Arc::new(storage), cipher)
        .connectivity(Connectivity::new(!config.offline_mode))
        .policy(config.policy.clone())
        .open()
        .await
        .context("Failed to load stored sessions")?;
    Ok(client)
}

fn prompt_identifier() -> Result<String> {
    print!("Handle or email: ");
    io::stdout().flush()?;

    let mut identifier = String::new();
    io::stdin().read_line(&mut identifier)?;
    Ok(identifier.trim().to_string())
}

fn active_did(client: &SyncClient) -> Result<Did> {
    client
        .active_account()
        .context("Not signed in. Run `skysync login` first.")
}

async fn login(client: &SyncClient, config: &mut Config, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier
        .or_else(|| env_var("SKYSYNC_IDENTIFIER"))
        .or_else(|| config.last_identifier.clone())
    {
        Some(identifier) => identifier,
        None => prompt_identifier()?,
    };
    let password = match env_var("SKYSYNC_PASSWORD") {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ")?,
    };
    if identifier.is_empty() || password.is_empty() {
        bail!("Identifier and password required");
    }

    let account = client.sign_in(&identifier, &password, true).await?;
    println!("Signed in as {} ({})", account.display_name(), account.did);

    config.last_identifier = Some(identifier);
    config.save()?;
    Ok(())
}

async fn logout(client: &SyncClient, did: Option<&String>) -> Result<()> {
    let did = match did {
        Some(did) => Did::new(did.as_str()),
        None => active_did(client)?,
    };
    client.sign_out(&did).await?;
    println!("Signed out {}", did);
    Ok(())
}

fn list_accounts(client: &SyncClient) {
    let accounts = client.accounts();
    if accounts.is_empty() {
        println!("No accounts signed in");
        return;
    }
    let active = client.active_account();
    for account in accounts {
        let marker = if active.as_ref() == Some(&account.did) { "*" } else { " " };
        let state = client.sessions().state(&account.did);
        println!(
            "{} {:<30} {:<40} {:?}",
            marker,
            account.display_name(),
            account.did,
            state
        );
    }
}

/// Parse `key=value` arguments into an operation and its cache key.
fn parse_query(nsid: &str, params: &[String]) -> Result<(Operation, CacheKey)> {
    let mut operation = Operation::query(nsid);
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("Expected key=value, got {}", param))?;
        operation = operation.param(key, value);
    }
    let segments: Vec<String> = operation
        .params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let key = CacheKey::new(nsid, &segments);
    Ok((operation, key))
}

async fn get(client: &SyncClient, args: &[String]) -> Result<()> {
    let nsid = args.first().context("get needs an NSID")?;
    let (operation, key) = parse_query(nsid, &args[1..])?;
    let mut query = Query::new(key.clone(), operation);
    if let Some(did) = client.active_account() {
        query = query.as_account(did);
    }

    let lookup = client.fetch(&query).await?;
    let now = chrono::Utc::now();
    if let Some(entry) = lookup.entry.as_ref() {
        let label = match lookup.freshness {
            Freshness::Fresh => "fresh",
            Freshness::StaleButUsable => "stale",
            Freshness::Absent => "absent",
        };
        eprintln!("[{} v{}, fetched {}]", label, entry.version, entry.age_display(now));
        println!("{}", serde_json::to_string_pretty(&entry.value)?);
    }

    // Give a background revalidation the chance to land before exiting
    if lookup.freshness == Freshness::StaleButUsable {
        let deadline = client.policy().request_timeout();
        let waited = tokio::time::timeout(deadline, async {
            while client.cache().is_revalidating(&key) {
                tokio::time::sleep(Duration::from_millis(REVALIDATION_POLL_MS)).await;
            }
        })
        .await;
        if waited.is_ok() && client.get(&key).freshness == Freshness::Fresh {
            eprintln!("[revalidated]");
        }
    }
    Ok(())
}

fn print_drain(report: &DrainReport) {
    if report.busy {
        println!("Replay already in progress");
        return;
    }
    for seq in &report.confirmed {
        println!("#{} confirmed", seq);
    }
    for seq in &report.failed {
        println!("#{} failed (see `skysync queue`)", seq);
    }
    if report.paused {
        println!("Replay paused: sign in again to continue");
    }
    if report.discarded > 0 {
        println!("{} mutations discarded, account is signed out", report.discarded);
    }
}

async fn post(client: &SyncClient, args: &[String]) -> Result<()> {
    let nsid = args.first().context("post needs an NSID")?;
    let body = args.get(1).context("post needs a JSON body")?;
    let body: serde_json::Value = serde_json::from_str(body).context("Body is not valid JSON")?;

    let mut invalidates = Invalidation::none();
    let mut flags = args[2..].iter();
    while let Some(flag) = flags.next() {
        match flag.as_str() {
            "--invalidate" => {
                let domain = flags.next().context("--invalidate needs a domain")?;
                invalidates = invalidates.domain(domain.as_str());
            }
            other => bail!("Unknown flag: {}", other),
        }
    }

    let did = active_did(client)?;
    let item = client
        .mutate(Operation::procedure(nsid.as_str(), body), invalidates, Some(&did))
        .await?;
    println!("Queued #{} for {}", item.seq, did);

    if client.connectivity().is_online() {
        print_drain(&client.drain(&did).await?);
    }
    Ok(())
}

async fn show_queue(client: &SyncClient) {
    let accounts = client.queue().accounts().await;
    let mut shown = 0;
    for did in accounts {
        for item in client.pending_mutations(&did).await {
            shown += 1;
            println!(
                "{} #{:<4} {:<10} attempts={} {}{}",
                did,
                item.seq,
                item.status.label(),
                item.attempts,
                item.operation,
                item.last_error
                    .as_deref()
                    .map(|e| format!("  ({})", e))
                    .unwrap_or_default()
            );
        }
    }
    if shown == 0 {
        println!("Queue is empty");
    }
}

async fn retry(client: &SyncClient, seq: Option<&String>) -> Result<()> {
    let seq: u64 = seq
        .context("retry needs a sequence number")?
        .parse()
        .context("Sequence number must be an integer")?;
    let did = active_did(client)?;
    client.retry_mutation(&did, seq).await?;
    println!("Requeued #{}", seq);
    if client.connectivity().is_online() {
        print_drain(&client.drain(&did).await?);
    }
    Ok(())
}
