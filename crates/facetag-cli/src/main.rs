use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facetag.Reconciler1",
    default_service = "org.facetag.Reconciler1",
    default_path = "/org/facetag/Reconciler1"
)]
trait Reconciler {
    async fn person_saved(&self, current: &str, previous: &str) -> zbus::Result<String>;
    async fn content_saved(&self, content: &str) -> zbus::Result<String>;
    async fn entity_deleted(&self, entity_type: &str, entity_id: &str) -> zbus::Result<String>;
    async fn train(&self) -> zbus::Result<()>;
    async fn training_status(&self) -> zbus::Result<String>;
    async fn queue_status(&self) -> zbus::Result<String>;
    async fn run_queues(&self) -> zbus::Result<String>;
    async fn reset(&self) -> zbus::Result<u64>;
    async fn submit_missing(&self, people: &str) -> zbus::Result<String>;
    async fn requeue_all(&self, people: &str) -> zbus::Result<String>;
    async fn take_tag_updates(&self) -> zbus::Result<String>;
    async fn progress(&self, total: u64) -> zbus::Result<String>;
    async fn list_people(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facetag", about = "Drive the facetag face reconciliation daemon")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Start training the person group
    Train,
    /// Show the last training result
    TrainingStatus,
    /// Show pending items per queue
    Queues,
    /// Drain every queue once
    RunQueues,
    /// Delete the remote person group and all local mappings
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Sync a person entity read from a JSON file ("-" for stdin)
    SyncPerson {
        file: PathBuf,
        /// JSON file holding the previous revision of the person
        #[arg(long)]
        previous: Option<PathBuf>,
    },
    /// Detect and identify faces on a content entity read from a JSON file
    Detect { file: PathBuf },
    /// Report a deleted entity
    Delete { entity_type: String, entity_id: String },
    /// Sync every person in a JSON array that is not mapped yet
    SubmitMissing { file: PathBuf },
    /// Reset, then queue every person in a JSON array for resubmission
    RequeueAll {
        file: PathBuf,
        #[arg(long)]
        yes: bool,
    },
    /// Print and clear pending tag updates
    TagUpdates,
    /// Show how many local people are mapped
    Progress {
        /// Number of local people
        #[arg(short, long)]
        total: u64,
    },
    /// List people in the remote person group
    People,
}

fn read_json(path: &Path) -> Result<String> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?
    };
    serde_json::from_str::<serde_json::Value>(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(text)
}

/// Stdin can only be read once, so at most one input may be `-`.
fn ensure_single_stdin<'p>(paths: impl IntoIterator<Item = &'p Path>) -> Result<()> {
    if paths.into_iter().filter(|p| *p == Path::new("-")).count() > 1 {
        bail!("only one input can be read from stdin (\"-\")");
    }
    Ok(())
}

/// Pretty-print a JSON reply, falling back to the raw text.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = ReconcilerProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected to facetagd");

    let reply = match cli.command {
        Commands::Status => proxy.status().await?,
        Commands::Train => {
            proxy.train().await?;
            println!("training started");
            return Ok(());
        }
        Commands::TrainingStatus => proxy.training_status().await?,
        Commands::Queues => proxy.queue_status().await?,
        Commands::RunQueues => proxy.run_queues().await?,
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes the remote person group; pass --yes to confirm");
            }
            let rows = proxy.reset().await?;
            println!("reset complete, {rows} mappings removed");
            return Ok(());
        }
        Commands::SyncPerson { file, previous } => {
            ensure_single_stdin(std::iter::once(file.as_path()).chain(previous.as_deref()))?;
            let current = read_json(&file)?;
            let previous = previous.as_deref().map(read_json).transpose()?.unwrap_or_default();
            proxy.person_saved(&current, &previous).await?
        }
        Commands::Detect { file } => proxy.content_saved(&read_json(&file)?).await?,
        Commands::Delete { entity_type, entity_id } => proxy.entity_deleted(&entity_type, &entity_id).await?,
        Commands::SubmitMissing { file } => proxy.submit_missing(&read_json(&file)?).await?,
        Commands::RequeueAll { file, yes } => {
            if !yes {
                bail!("requeue-all resets the remote person group first; pass --yes to confirm");
            }
            proxy.requeue_all(&read_json(&file)?).await?
        }
        Commands::TagUpdates => proxy.take_tag_updates().await?,
        Commands::Progress { total } => proxy.progress(total).await?,
        Commands::People => proxy.list_people().await?,
    };
    println!("{}", pretty(&reply));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_requires_flag_value() {
        let cli = Cli::try_parse_from(["facetag", "reset"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: false }));
        let cli = Cli::try_parse_from(["facetag", "--system", "reset", "--yes"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Reset { yes: true }));
    }

    #[test]
    fn test_sync_person_with_previous() {
        let cli = Cli::try_parse_from(["facetag", "sync-person", "jane.json", "--previous", "old.json"]).unwrap();
        match cli.command {
            Commands::SyncPerson { file, previous } => {
                assert_eq!(file, PathBuf::from("jane.json"));
                assert_eq!(previous, Some(PathBuf::from("old.json")));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_progress_needs_total() {
        assert!(Cli::try_parse_from(["facetag", "progress"]).is_err());
        let cli = Cli::try_parse_from(["facetag", "progress", "-t", "12"]).unwrap();
        assert!(matches!(cli.command, Commands::Progress { total: 12 }));
    }

    #[test]
    fn test_stdin_used_for_one_input_at_most() {
        let stdin = Path::new("-");
        let file = Path::new("jane.json");
        assert!(ensure_single_stdin([stdin, file]).is_ok());
        assert!(ensure_single_stdin([file, file]).is_ok());
        assert!(ensure_single_stdin([stdin]).is_ok());
        let err = ensure_single_stdin([stdin, stdin]).unwrap_err();
        assert!(err.to_string().contains("stdin"));
    }

    #[test]
    fn test_pretty_falls_back_to_raw() {
        assert_eq!(pretty("not json"), "not json");
        assert_eq!(pretty(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_read_json_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!("facetag-cli-{}.json", std::process::id()));
        std::fs::write(&path, "{ nope").unwrap();
        assert!(read_json(&path).is_err());
        std::fs::write(&path, r#"{"id":"1"}"#).unwrap();
        assert_eq!(read_json(&path).unwrap(), r#"{"id":"1"}"#);
        std::fs::remove_file(&path).unwrap();
    }
}
