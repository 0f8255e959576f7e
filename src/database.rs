//! The `Database` handle: the public entry point into a single page file,
//! tying the page pool and the B-tree algorithms to a tracked root page.

use std::path::Path;
use std::sync::Mutex;

use tracing::{info, info_span, warn};

use crate::btree;
use crate::error::{err, Error};
use crate::page::NodeImage;
use crate::pool::PagePool;

struct Inner {
    pool: PagePool,
    root: u32,
}

/// A single open key/value database backed by one page file.
///
/// The engine itself assumes a single owner operating synchronously (see
/// the crate's concurrency model), but the handle wraps its state behind a
/// `Mutex` the way the teacher wraps its table state, so it is `Send` and
/// `Sync` and a future multi-session front-end can share one handle
/// without redesigning it. Contention is not expected in normal use; a
/// poisoned lock (a panic while held) surfaces as a [`Error::Corruption`]
/// rather than being silently recovered.
pub struct Database {
    inner: Mutex<Inner>,
}

impl Database {
    /// Creates a new database file of `total_bytes`, with an empty root
    /// leaf, and opens it.
    pub fn create<P: AsRef<Path>>(path: P, total_bytes: u64) -> Result<Self, Error> {
        let path = path.as_ref();
        let _span = info_span!("db_create", path = %path.display(), total_bytes).entered();

        let mut pool = PagePool::create(path, total_bytes)?;
        let root_page = pool.alloc()?;
        let root = NodeImage::new(pool.page_size(), pool.k(), root_page, 0, true);
        pool.write_node(&root)?;
        pool.write_meta_root(root_page)?;

        info!(root_page, "database created");
        Ok(Database {
            inner: Mutex::new(Inner {
                pool,
                root: root_page,
            }),
        })
    }

    /// Reopens an existing database file, recovering its current root page.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let _span = info_span!("db_open", path = %path.display()).entered();

        let pool = PagePool::open(path)?;
        let root = pool.read_meta_root()?;

        info!(root_page = root, "database opened");
        Ok(Database {
            inner: Mutex::new(Inner { pool, root }),
        })
    }

    /// Flushes and releases the underlying file. Equivalent to dropping the
    /// handle, but surfaces I/O errors from the final sync instead of
    /// discarding them.
    pub fn close(self) -> Result<(), Error> {
        info!("closing database");
        let inner = self
            .inner
            .into_inner()
            .map_err(|_| err!(Corruption, "database lock was poisoned"))?;
        inner.pool.sync()
    }

    /// Looks up `key`, returning `None` if it is absent.
    pub fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let inner = self.lock()?;
        let result = btree::search(&inner.pool, inner.root, key);
        if let Err(e) = &result {
            warn!(error = %e, "search failed");
        }
        result
    }

    /// Inserts `key`/`value`, overwriting any existing value for `key`.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let root = inner.root;
        let result = btree::insert(&mut inner.pool, root, key, value);
        if let Err(e) = &result {
            warn!(error = %e, "insert failed");
        }
        result
    }

    /// Deletes `key`. Deleting a key that is not present is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock()?;
        let root = inner.root;
        let new_root = btree::delete(&mut inner.pool, root, key)?;
        if new_root != inner.root {
            info!(old_root = inner.root, new_root, "tree shrank, root changed");
            inner.root = new_root;
            inner.pool.write_meta_root(new_root)?;
        }
        Ok(())
    }

    /// Writes a human-readable dump of the tree to stderr. Diagnostic only;
    /// not part of the engine's on-disk contract.
    pub fn debug_dump(&self) -> Result<(), Error> {
        let inner = self.lock()?;
        eprintln!(
            "page_size={} k={} n_pages={}",
            inner.pool.page_size(),
            inner.pool.k(),
            inner.pool.n_pages()
        );
        dump_node(&inner.pool, inner.root, 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, Error> {
        self.inner
            .lock()
            .map_err(|_| err!(Corruption, "database lock was poisoned"))
    }
}

fn dump_node(pool: &PagePool, page: u32, depth: usize) -> Result<(), Error> {
    let node = pool.read_node(page)?;
    let indent = "  ".repeat(depth);
    if node.is_leaf() {
        let keys: Vec<String> = (0..node.n_keys())
            .map(|i| key_to_string(&node.key(i)))
            .collect();
        eprintln!(
            "{}leaf@{} parent={} k={} {:?}",
            indent,
            page,
            node.parent_page(),
            node.k(),
            keys
        );
    } else {
        eprintln!(
            "{}internal@{} parent={} k={}",
            indent,
            page,
            node.parent_page(),
            node.k()
        );
        for i in 0..node.n_keys() {
            dump_node(pool, node.chld(i), depth + 1)?;
            eprintln!("{}  -- {} --", indent, key_to_string(&node.key(i)));
        }
        dump_node(pool, node.chld(node.n_keys()), depth + 1)?;
    }
    Ok(())
}

fn key_to_string(key: &[u8]) -> String {
    let trimmed = key.split(|&b| b == 0).next().unwrap_or(&[]);
    String::from_utf8_lossy(trimmed).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn create_open_insert_search_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path(), 256 * 1024).unwrap();
        db.insert(b"hello", b"world").unwrap();
        assert_eq!(db.search(b"hello").unwrap(), Some(b"world".to_vec()));
        db.close().unwrap();

        let db = Database::open(file.path()).unwrap();
        assert_eq!(db.search(b"hello").unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn delete_then_reopen_preserves_root_after_shrink() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path(), 256 * 1024).unwrap();
        for i in 0..20 {
            let k = format!("key{i}");
            db.insert(k.as_bytes(), k.as_bytes()).unwrap();
        }
        for i in 0..20 {
            let k = format!("key{i}");
            db.delete(k.as_bytes()).unwrap();
        }
        db.close().unwrap();

        let db = Database::open(file.path()).unwrap();
        assert_eq!(db.search(b"key0").unwrap(), None);
    }

    #[test]
    fn search_missing_key_returns_none_not_error() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path(), 64 * 1024).unwrap();
        assert_eq!(db.search(b"nope").unwrap(), None);
    }

    #[test]
    fn handle_is_shareable_across_threads() {
        use std::sync::Arc;

        let file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::create(file.path(), 256 * 1024).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    let k = format!("thread{t}");
                    db.insert(k.as_bytes(), k.as_bytes()).unwrap();
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        for t in 0..4 {
            let k = format!("thread{t}");
            assert_eq!(db.search(k.as_bytes()).unwrap(), Some(k.into_bytes()));
        }
    }
}
