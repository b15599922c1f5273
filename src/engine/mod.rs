use serde_json::{json, Value};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

mod cursor;
mod persist;
mod scheduler;
mod store;

pub use cursor::{CursorManager, Page};
pub use persist::Persistence;
pub use scheduler::Scheduler;
pub use store::{entries_from_json, sanitize_table_name, Record, RecordStore};

use crate::error::{StoreError, StoreResult};
use crate::protocol::{Command, CommandKind, InitSource, Request, Response};

/// Identity of one client connection, assigned by the listener.
pub type ConnectionId = u64;

/// Process-wide admission gate shared by the scheduler and the exporter.
/// Write commands hold the exclusive side; exports hold the shared side.
pub type Gate = Arc<RwLock<()>>;

/// Where a command came from and where late notices for it are delivered.
///
/// The outbox is the originating connection's response channel. Sending on
/// it after the connection has gone away silently drops the message.
#[derive(Clone, Debug)]
pub struct Origin {
    pub id: ConnectionId,
    outbox: Option<mpsc::UnboundedSender<Response>>,
}

impl Origin {
    pub fn new(id: ConnectionId, outbox: mpsc::UnboundedSender<Response>) -> Self {
        Self { id, outbox: Some(outbox) }
    }

    /// An origin with no connection behind it (tests, internal callers).
    pub fn detached(id: ConnectionId) -> Self {
        Self { id, outbox: None }
    }

    fn notify(&self, response: Response) {
        if let Some(outbox) = &self.outbox {
            let _ = outbox.send(response);
        }
    }
}

/// A command on its way through the scheduler.
///
/// Requests that fail validation still travel as envelopes so their error
/// response is produced in scheduling order like any other.
#[derive(Debug)]
pub struct Envelope {
    pub name: String,
    pub command: StoreResult<Command>,
    pub origin: Origin,
}

impl Envelope {
    pub fn new(request: &Request, origin: Origin) -> Self {
        Self { name: request.name(), command: request.command(), origin }
    }

    pub fn from_command(name: &str, command: Command, origin: Origin) -> Self {
        Self { name: name.to_string(), command: Ok(command), origin }
    }

    pub fn kind(&self) -> CommandKind {
        match &self.command {
            Ok(cmd) => cmd.kind(),
            Err(_) => CommandKind::Read,
        }
    }
}

/// Executes commands against the working copy.
///
/// The Engine ties together the three stateful pieces of the server:
///
/// ```text
///                 ┌──────────────┐
///   Envelope ───► │    Engine    │ ───► Response
///                 └──────┬───────┘
///        ┌───────────────┼────────────────┐
///  ┌─────▼──────┐ ┌──────▼───────┐ ┌──────▼──────┐
///  │RecordStore │ │CursorManager │ │ Persistence │
///  │ (SQLite)   │ │ (per conn)   │ │ (snapshots) │
///  └────────────┘ └──────────────┘ └─────────────┘
/// ```
///
/// It does no admission control of its own; ordering and exclusion are the
/// [`Scheduler`]'s job. Every outcome, including engine and I/O failures,
/// comes back as a [`Response`].
pub struct Engine {
    store: Arc<RecordStore>,
    cursors: CursorManager,
    persistence: Arc<Persistence>,
    gate: Gate,
}

impl Engine {
    /// Creates the in-memory working copy and merges the snapshot at
    /// `dump_path` into it, if one exists.
    ///
    /// A snapshot that exists but cannot be read fails startup rather than
    /// being silently overwritten by the first export.
    pub async fn open(dump_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Arc::new(RecordStore::open_in_memory()?);
        let gate: Gate = Arc::new(RwLock::new(()));
        let persistence = Arc::new(Persistence::new(store.clone(), gate.clone(), dump_path.into()));
        persistence.load().await?;
        info!(table = %store.active_table(), "engine opened");
        Ok(Self { store, cursors: CursorManager::new(), persistence, gate })
    }

    pub fn gate(&self) -> Gate {
        self.gate.clone()
    }

    pub fn persistence(&self) -> Arc<Persistence> {
        self.persistence.clone()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn cursors(&self) -> &CursorManager {
        &self.cursors
    }

    /// Tears down per-connection state once a connection is gone.
    pub fn release_connection(&self, id: ConnectionId) {
        self.cursors.release(id);
    }

    /// Runs one envelope to completion and always yields exactly one response.
    pub async fn execute(&self, envelope: Envelope) -> Response {
        let Envelope { name, command, origin } = envelope;
        let result = match command {
            Ok(command) => self.run(&name, command, &origin).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| Response::error(&name, &e))
    }

    async fn run(&self, name: &str, command: Command, origin: &Origin) -> StoreResult<Response> {
        let data = match command {
            Command::Use { table } => {
                let t = self.blocking(move |s| s.use_table(&table)).await?;
                json!(format!("Switched to {}", t))
            }
            Command::Drop { table } => {
                let t = self.blocking(move |s| s.drop_table(&table)).await?;
                json!(format!("Dropped {}", t))
            }
            Command::Tables => serde_json::to_value(self.blocking(|s| s.tables()).await?)?,
            Command::Set { key, value } => {
                self.blocking(move |s| s.set(&key, &value)).await?;
                json!("OK")
            }
            Command::Get { key } => Value::String(self.blocking(move |s| s.get(&key)).await?),
            Command::Delete { key } => {
                self.blocking(move |s| s.delete(&key)).await?;
                json!("Deleted")
            }
            Command::Clear => {
                self.blocking(|s| s.clear()).await?;
                json!("Store cleared")
            }
            Command::Search { scope, pattern } => {
                serde_json::to_value(self.blocking(move |s| s.search(scope, &pattern)).await?)?
            }
            Command::List { page_size: None } => serde_json::to_value(self.blocking(|s| s.list()).await?)?,
            Command::List { page_size: Some(n) } => {
                let snapshot = self.blocking(|s| s.list()).await?;
                let page = self.cursors.open(origin.id, snapshot, n);
                return Ok(Response::page(name, serde_json::to_value(page.records)?, page.pagination));
            }
            Command::Next => {
                let page = self.cursors.advance(origin.id);
                return Ok(Response::page(name, serde_json::to_value(page.records)?, page.pagination));
            }
            Command::Init { source } => {
                let doc = match source {
                    InitSource::File(path) => read_json_file(path).await?,
                    InitSource::Inline(doc) => doc,
                };
                let entries = entries_from_json(&doc)?;
                self.blocking(move |s| s.replace_all(&entries)).await?;
                json!("Initialized")
            }
            Command::Load { path } => {
                let entries = entries_from_json(&read_json_file(path).await?)?;
                self.blocking(move |s| s.upsert_all(&entries)).await?;
                json!("Loaded")
            }
            Command::Dump => {
                self.spawn_dump(origin.clone());
                json!("Syncing...")
            }
            Command::Sql { statement } => {
                let rows = self.blocking(move |s| s.query_raw(&statement)).await?;
                Value::Array(rows.into_iter().map(Value::Object).collect())
            }
        };
        Ok(Response::success(name, data))
    }

    /// Starts an export without waiting for it. The originating connection
    /// gets a follow-up notice with the outcome.
    fn spawn_dump(&self, origin: Origin) {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            let outcome = match persistence.export().await {
                Ok(()) => {
                    info!(path = %persistence.path().display(), conn = origin.id, "snapshot written on request");
                    Ok("Persisted to disk.".to_string())
                }
                Err(e) => {
                    warn!(path = %persistence.path().display(), error = %e, "requested snapshot failed");
                    Err(e.to_string())
                }
            };
            origin.notify(Response::notice("dump", outcome));
        });
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&RecordStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(&self.store, f).await
    }
}

/// Moves a synchronous store call onto the blocking pool.
///
/// A panic inside `f` surfaces as `StoreError::Internal` instead of
/// unwinding into the caller.
pub(crate) async fn run_blocking<T, F>(store: &Arc<RecordStore>, f: F) -> StoreResult<T>
where
    F: FnOnce(&RecordStore) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?
}

async fn read_json_file(path: PathBuf) -> StoreResult<Value> {
    let bytes = tokio::fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}
