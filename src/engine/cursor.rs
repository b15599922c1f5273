use parking_lot::Mutex;
use std::collections::HashMap;

use super::store::Record;
use super::ConnectionId;
use crate::protocol::Pagination;

/// Paging state over one materialized, point-in-time result set.
///
/// The snapshot is copied out of the store when the cursor is opened, so
/// later writes never shift page boundaries. `next_index` only grows and
/// never passes `snapshot.len()`.
#[derive(Debug)]
struct Cursor {
    snapshot: Vec<Record>,
    page_size: usize,
    next_index: usize,
}

impl Cursor {
    fn new(snapshot: Vec<Record>, page_size: usize) -> Self {
        Self { snapshot, page_size: page_size.max(1), next_index: 0 }
    }

    fn is_exhausted(&self) -> bool {
        self.next_index >= self.snapshot.len()
    }

    fn take_page(&mut self) -> Page {
        let end = (self.next_index + self.page_size).min(self.snapshot.len());
        let records = self.snapshot[self.next_index..end].to_vec();
        self.next_index = end;
        Page::new(records, self.next_index, self.snapshot.len())
    }
}

/// One batch of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    pub pagination: Pagination,
}

impl Page {
    fn new(records: Vec<Record>, delivered: usize, total: usize) -> Self {
        Self {
            records,
            pagination: Pagination {
                progress: format!("{}/{}", delivered, total),
                has_more: delivered < total,
            },
        }
    }

    /// The well-defined answer to `next` when no cursor is open.
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, 0)
    }
}

/// Owns every open cursor, keyed by connection.
///
/// ## State machine (per connection)
/// ```text
///   Idle --open--> Active --advance--> Active ... --advance--> Idle
///     \                                                      (exhausted)
///      `--advance--> Idle (empty page, hasMore=false)
/// ```
/// Opening a cursor while one is active supersedes it. Exhausted cursors are
/// dropped as soon as their last page is handed out, and `release` tears
/// down whatever is left when the connection closes.
#[derive(Default)]
pub struct CursorManager {
    cursors: Mutex<HashMap<ConnectionId, Cursor>>,
}

impl CursorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a cursor for `conn` and returns its first page.
    pub fn open(&self, conn: ConnectionId, snapshot: Vec<Record>, page_size: usize) -> Page {
        let mut cursors = self.cursors.lock();
        let mut cursor = Cursor::new(snapshot, page_size);
        let page = cursor.take_page();
        if cursor.is_exhausted() {
            cursors.remove(&conn);
        } else {
            cursors.insert(conn, cursor);
        }
        page
    }

    /// Returns the next page for `conn`, or an empty page when idle.
    pub fn advance(&self, conn: ConnectionId) -> Page {
        let mut cursors = self.cursors.lock();
        let Some(cursor) = cursors.get_mut(&conn) else {
            return Page::empty();
        };
        let page = cursor.take_page();
        if cursor.is_exhausted() {
            cursors.remove(&conn);
        }
        page
    }

    /// Drops the cursor of a closed connection. Returns whether one existed.
    pub fn release(&self, conn: ConnectionId) -> bool {
        self.cursors.lock().remove(&conn).is_some()
    }

    pub fn is_active(&self, conn: ConnectionId) -> bool {
        self.cursors.lock().contains_key(&conn)
    }

    /// Number of open cursors across all connections.
    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record { key: format!("k{:03}", i), value: i.to_string() }).collect()
    }

    #[test]
    fn pages_cover_snapshot_exactly_once() {
        let mgr = CursorManager::new();
        let snapshot = records(7);
        let mut seen = Vec::new();

        let mut page = mgr.open(1, snapshot.clone(), 3);
        let mut pages = 1;
        loop {
            assert!(page.records.len() <= 3);
            seen.extend(page.records.clone());
            if !page.pagination.has_more {
                break;
            }
            page = mgr.advance(1);
            pages += 1;
        }

        assert_eq!(pages, 3);
        assert_eq!(page.pagination.progress, "7/7");
        assert_eq!(seen, snapshot);
        assert!(!mgr.is_active(1));
    }

    #[test]
    fn progress_counts_delivered_records() {
        let mgr = CursorManager::new();
        let first = mgr.open(9, records(5), 2);
        assert_eq!(first.pagination, Pagination { progress: "2/5".into(), has_more: true });
        let second = mgr.advance(9);
        assert_eq!(second.pagination.progress, "4/5");
        let last = mgr.advance(9);
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.pagination, Pagination { progress: "5/5".into(), has_more: false });
    }

    #[test]
    fn idle_advance_is_empty_not_error() {
        let mgr = CursorManager::new();
        let page = mgr.advance(4);
        assert!(page.records.is_empty());
        assert_eq!(page.pagination, Pagination { progress: "0/0".into(), has_more: false });

        mgr.open(4, records(2), 2);
        let after = mgr.advance(4);
        assert!(after.records.is_empty());
        assert!(!after.pagination.has_more);
    }

    #[test]
    fn empty_snapshot_never_installs_cursor() {
        let mgr = CursorManager::new();
        let page = mgr.open(2, Vec::new(), 10);
        assert!(page.records.is_empty());
        assert_eq!(page.pagination.progress, "0/0");
        assert!(mgr.is_empty());
    }

    #[test]
    fn cursors_are_per_connection_and_superseded() {
        let mgr = CursorManager::new();
        mgr.open(1, records(10), 2);
        mgr.open(2, records(4), 1);
        assert_eq!(mgr.len(), 2);

        let fresh = mgr.open(1, records(3), 2);
        assert_eq!(fresh.pagination.progress, "2/3");
        assert_eq!(mgr.advance(2).pagination.progress, "2/4");

        assert!(mgr.release(1));
        assert!(!mgr.release(1));
        assert_eq!(mgr.len(), 1);
    }
}
