//! Siberian backup CLI - Command line interface for backup storage.
//!
//! This tool lists, uploads, downloads and deletes backup archives across
//! the configured storage providers, and walks through provider setup.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use siberian_backup::StorageManager;
use siberian_common::{
    format_size, key_basename, BackupName, JsonFileStore, ProviderId, TracingSink, UploadMetadata,
};
use siberian_storage::gdrive::{consent_url, ProxyPayload, DEFAULT_PROXY_URL};

#[derive(Parser)]
#[command(name = "siberian-backup")]
#[command(about = "Siberian backup storage management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (default: <config dir>/siberian-backup/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory holding freshly built archives.
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List backups across every provider, or the files of one provider.
    List {
        /// Only list this provider.
        #[arg(short, long)]
        provider: Option<ProviderId>,

        /// Key prefix (with --provider).
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Upload an archive.
    Upload {
        #[arg(short, long)]
        provider: ProviderId,

        /// Archive to upload.
        #[arg(short, long)]
        file: PathBuf,

        /// Destination key (default: the file name).
        #[arg(short, long)]
        key: Option<String>,

        /// Mark the backup as produced by the scheduler.
        #[arg(long)]
        scheduled: bool,

        /// Protect the backup from deletion.
        #[arg(long)]
        locked: bool,

        #[arg(long)]
        description: Option<String>,
    },

    /// Download an archive.
    Download {
        #[arg(short, long)]
        provider: ProviderId,

        #[arg(short, long)]
        key: String,

        /// Destination file path.
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Delete an archive.
    Delete {
        #[arg(short, long)]
        provider: ProviderId,

        #[arg(short, long)]
        key: String,
    },

    /// Check the connection to a provider.
    Test {
        #[arg(short, long)]
        provider: ProviderId,
    },

    /// Show provider settings, or configure one provider.
    Configure {
        provider: Option<ProviderId>,

        /// Field assignment, repeatable.
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        fields: Vec<String>,
    },

    /// Print the Google Drive consent URL.
    AuthUrl {
        /// URL the proxy redirects to once consent is given.
        #[arg(short, long)]
        callback: String,

        #[arg(long, default_value = DEFAULT_PROXY_URL)]
        proxy_url: String,
    },

    /// Finish Google Drive authorization from the callback URL.
    AuthCallback {
        /// Full callback URL, including its query string.
        url: String,

        /// Backup folder name on the Drive.
        #[arg(long)]
        folder_name: Option<String>,

        #[arg(long)]
        proxy_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = open_manager(cli.settings.as_deref(), cli.backup_dir.as_deref())?;

    match cli.command {
        Commands::List { provider, prefix } => cmd_list(&manager, provider, &prefix).await,

        Commands::Upload {
            provider,
            file,
            key,
            scheduled,
            locked,
            description,
        } => {
            let metadata = UploadMetadata {
                backup_type: None,
                scheduled,
                locked,
                description,
            };
            cmd_upload(&manager, provider, &file, key, metadata).await
        }

        Commands::Download {
            provider,
            key,
            dest,
        } => cmd_download(&manager, provider, &key, &dest).await,

        Commands::Delete { provider, key } => cmd_delete(&manager, provider, &key).await,

        Commands::Test { provider } => cmd_test(&manager, provider).await,

        Commands::Configure { provider, fields } => cmd_configure(&manager, provider, &fields),

        Commands::AuthUrl {
            callback,
            proxy_url,
        } => {
            println!("{}", consent_url(&proxy_url, &callback, chrono::Utc::now()));
            Ok(())
        }

        Commands::AuthCallback {
            url,
            folder_name,
            proxy_url,
        } => cmd_auth_callback(&manager, &url, folder_name, proxy_url),
    }
}

fn settings_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let dir = dirs::config_dir().context("No configuration directory on this system")?;
    Ok(dir.join("siberian-backup").join("settings.json"))
}

fn open_manager(settings: Option<&Path>, backup_dir: Option<&Path>) -> Result<StorageManager> {
    let path = settings_path(settings)?;
    let store = JsonFileStore::open(&path)
        .with_context(|| format!("Failed to open settings at {}", path.display()))?;
    let manager = StorageManager::from_settings(Arc::new(store), Arc::new(TracingSink))
        .context("Failed to load providers")?;
    Ok(match backup_dir {
        Some(dir) => manager.with_backup_dir(dir),
        None => manager,
    })
}

/// List backups.
async fn cmd_list(manager: &StorageManager, provider: Option<ProviderId>, prefix: &str) -> Result<()> {
    if let Some(provider) = provider {
        let files = manager
            .list_files(provider, prefix)
            .await
            .with_context(|| format!("Failed to list {}", provider))?;
        if files.is_empty() {
            println!("No backups on {}.", provider);
        }
        for file in files {
            println!(
                "  {}  {:>12}  {}",
                file.modified.format("%Y-%m-%d %H:%M"),
                format_size(file.size),
                file.key
            );
        }
        return Ok(());
    }

    let records = manager
        .get_all_backups()
        .await
        .context("Failed to collect backups")?;
    if records.is_empty() {
        println!("No backups found.");
        return Ok(());
    }
    for record in records {
        let storages: Vec<&str> = record.storages.iter().map(|s| s.as_str()).collect();
        println!(
            "  {}  {:<6} {:>12}  [{}]{}",
            record.filename,
            record.backup_type.as_str(),
            record.size_display,
            storages.join(", "),
            if record.locked { "  locked" } else { "" }
        );
    }
    Ok(())
}

/// Upload an archive.
async fn cmd_upload(
    manager: &StorageManager,
    provider: ProviderId,
    file: &Path,
    key: Option<String>,
    mut metadata: UploadMetadata,
) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .context("Source path has no usable file name")?
            .to_string(),
    };
    metadata.backup_type = BackupName::parse(key_basename(&key)).map(|name| name.kind);

    info!("Uploading {} to {} as {}", file.display(), provider, key);
    let result = manager
        .upload_file(provider, file, &key, &metadata)
        .await
        .context("Upload failed")?;

    println!("Uploaded {} ({} bytes)", result.key, result.size);
    if let Some(id) = result.remote_id {
        println!("  Remote id: {}", id);
    }
    Ok(())
}

/// Download an archive.
async fn cmd_download(manager: &StorageManager, provider: ProviderId, key: &str, dest: &Path) -> Result<()> {
    manager
        .download_file(provider, key, dest)
        .await
        .context("Download failed")?;
    println!("Downloaded {} to {}", key, dest.display());
    Ok(())
}

/// Delete an archive.
async fn cmd_delete(manager: &StorageManager, provider: ProviderId, key: &str) -> Result<()> {
    manager
        .delete_file(provider, key)
        .await
        .context("Delete failed")?;
    println!("Deleted {} from {}", key, provider);
    Ok(())
}

async fn cmd_test(manager: &StorageManager, provider: ProviderId) -> Result<()> {
    manager
        .test_connection(provider)
        .await
        .with_context(|| format!("Connection to {} failed", provider))?;
    println!("Connection to {} OK", provider);
    Ok(())
}

/// Parse `FIELD=VALUE` assignments into a raw configuration object.
fn parse_fields(fields: &[String]) -> Result<Value> {
    let mut raw = Map::new();
    for field in fields {
        let (name, value) = field
            .split_once('=')
            .with_context(|| format!("Expected FIELD=VALUE, got '{}'", field))?;
        raw.insert(name.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(raw))
}

fn cmd_configure(manager: &StorageManager, provider: Option<ProviderId>, fields: &[String]) -> Result<()> {
    let Some(provider) = provider else {
        for schema in manager.provider_schemas()? {
            let state = if schema.configured { "configured" } else { "not configured" };
            println!("{} ({}): {}", schema.id, schema.name, state);
            for field in schema.fields {
                let marker = if field.required { "*" } else { " " };
                println!("  {}{:<20} {}", marker, field.name, field.label);
            }
        }
        return Ok(());
    };

    let raw = parse_fields(fields)?;
    manager
        .configure(provider, &raw)
        .with_context(|| format!("Invalid configuration for {}", provider))?;
    println!("Saved configuration for {}", provider);
    Ok(())
}

fn cmd_auth_callback(
    manager: &StorageManager,
    url: &str,
    folder_name: Option<String>,
    proxy_url: Option<String>,
) -> Result<()> {
    let bundle = ProxyPayload::from_callback_url(url)
        .and_then(|payload| payload.open())
        .context("Could not read the authorization result")?;
    let refresh_token = bundle
        .refresh_token
        .context("The proxy did not return a refresh token")?;

    let mut raw = Map::new();
    raw.insert("refresh_token".into(), Value::String(refresh_token));
    raw.insert("access_token".into(), Value::String(bundle.access_token));
    if let Some(expires_in) = bundle.expires_in {
        raw.insert("expires_in".into(), Value::from(expires_in));
    }
    if let Some(email) = bundle.email.clone() {
        raw.insert("email".into(), Value::String(email));
    }
    if let Some(folder_name) = folder_name {
        raw.insert("folder_name".into(), Value::String(folder_name));
    }
    if let Some(proxy_url) = proxy_url {
        raw.insert("proxy_url".into(), Value::String(proxy_url));
    }

    manager
        .configure(ProviderId::Gdrive, &Value::Object(raw))
        .context("Failed to save Google Drive authorization")?;
    match bundle.email {
        Some(email) => println!("Google Drive authorized for {}", email),
        None => println!("Google Drive authorized"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let raw = parse_fields(&["bucket=backups".into(), "prefix=a=b".into()]).unwrap();
        assert_eq!(raw["bucket"], "backups");
        assert_eq!(raw["prefix"], "a=b");
        assert!(parse_fields(&["bucket".into()]).is_err());
    }

    #[test]
    fn test_cli_parses_provider_ids() {
        let cli = Cli::try_parse_from(["siberian-backup", "test", "--provider", "gcs"]).unwrap();
        assert!(matches!(cli.command, Commands::Test { provider: ProviderId::Gcs }));
        assert!(Cli::try_parse_from(["siberian-backup", "test", "--provider", "ftp"]).is_err());
    }
}
