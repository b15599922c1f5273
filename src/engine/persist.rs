use std::{
    ffi::OsString,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{run_blocking, store::RecordStore, Gate};
use crate::error::{StoreError, StoreResult};

/// Keeps the durable snapshot file in step with the in-memory working copy.
///
/// ## Export protocol
/// ```text
/// shared gate ──► remove stale <path>.tmp ──► VACUUM INTO <path>.tmp ──► rename over <path>
/// ```
/// The rename is the commit point: readers of `<path>` only ever see a
/// complete image, either the previous one or the new one.
///
/// ## Coordination
/// - Exports take the shared side of the scheduler gate, so they never run
///   while a write command is in flight.
/// - Exports are serialized among themselves: a timer tick and an explicit
///   `dump` never write the temporary file at the same time.
pub struct Persistence {
    store: Arc<RecordStore>,
    gate: Gate,
    path: PathBuf,
    exporting: AsyncMutex<()>,
}

impl Persistence {
    pub fn new(store: Arc<RecordStore>, gate: Gate, path: PathBuf) -> Self {
        Self { store, gate, path, exporting: AsyncMutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merges a prior snapshot into the working copy, if one exists.
    ///
    /// Rows already in the working copy win. Called once at startup, before
    /// the listener accepts connections.
    ///
    /// ## Returns
    /// * `Ok(n)` - Rows merged (0 when no snapshot exists)
    /// * `Err(_)` - The snapshot exists but could not be read
    pub async fn load(&self) -> StoreResult<usize> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no snapshot found, starting empty");
            return Ok(0);
        }
        let path = self.path.clone();
        let merged = run_blocking(&self.store, move |store| store.merge_from(&path)).await?;
        info!(path = %self.path.display(), rows = merged, "snapshot loaded");
        Ok(merged)
    }

    /// Writes a full, consistent snapshot of the working copy.
    pub async fn export(&self) -> StoreResult<()> {
        let _serial = self.exporting.lock().await;
        let _gate = self.gate.read().await;
        let path = self.path.clone();
        run_blocking(&self.store, move |store| export_atomically(store, &path)).await?;
        debug!(path = %self.path.display(), "snapshot written");
        Ok(())
    }

    /// Starts the periodic export timer.
    ///
    /// Failures are logged and otherwise ignored; no client waits on a timer
    /// tick. The first tick fires one full `every` after start.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.export().await {
                    warn!(path = %self.path.display(), error = %e, "periodic snapshot failed");
                }
            }
        })
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".tmp");
    PathBuf::from(s)
}

fn remove_if_present(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn export_atomically(store: &RecordStore, path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let tmp = temp_path(path);
    remove_if_present(&tmp)?;
    if let Err(e) = store.export_to(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::RwLock;

    fn persistence(dir: &Path) -> (Arc<RecordStore>, Persistence) {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let gate: Gate = Arc::new(RwLock::new(()));
        let p = Persistence::new(store.clone(), gate, dir.join("nested").join("data.sqlite"));
        (store, p)
    }

    #[tokio::test]
    async fn export_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, p) = persistence(dir.path());

        store.set("a", "1").unwrap();
        p.export().await.unwrap();
        store.set("b", "2").unwrap();
        store.delete("a").unwrap();
        p.export().await.unwrap();
        assert!(!temp_path(p.path()).exists());

        let fresh = Arc::new(RecordStore::open_in_memory().unwrap());
        let reload = Persistence::new(fresh.clone(), Arc::new(RwLock::new(())), p.path().to_path_buf());
        assert_eq!(reload.load().await.unwrap(), 1);
        assert_eq!(fresh.get("b").unwrap(), "2");
        assert!(fresh.get("a").is_err());
    }

    #[tokio::test]
    async fn stale_temp_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (store, p) = persistence(dir.path());
        fs::create_dir_all(p.path().parent().unwrap()).unwrap();
        fs::write(temp_path(p.path()), b"garbage from a crashed export").unwrap();

        store.set("k", "v").unwrap();
        p.export().await.unwrap();
        assert!(p.path().exists());
    }

    #[tokio::test]
    async fn load_without_snapshot_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (store, p) = persistence(dir.path());
        assert_eq!(p.load().await.unwrap(), 0);
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_waits_for_exclusive_gate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let gate: Gate = Arc::new(RwLock::new(()));
        let p = Arc::new(Persistence::new(store, gate.clone(), dir.path().join("data.sqlite")));

        let held = gate.clone().write_owned().await;
        let task = tokio::spawn({
            let p = p.clone();
            async move { p.export().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!p.path().exists());

        drop(held);
        task.await.unwrap().unwrap();
        assert!(p.path().exists());
    }
}
