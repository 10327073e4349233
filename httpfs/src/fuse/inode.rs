//! Inode <-> path table for the raw FUSE protocol.
//!
//! The backend only knows paths, the kernel only knows inode numbers. Every
//! reply that hands an inode to the kernel (lookup, create, mkdir, ...)
//! takes a reference; `forget` drops them and evicts the node at zero.
//! Unlinked nodes stay resolvable by number but lose their path.

use std::collections::HashMap;
use std::sync::Mutex;

pub const ROOT_INODE: u64 = 1;

#[derive(Debug)]
struct Node {
    path: Option<String>,
    nlookup: u64,
}

#[derive(Debug)]
struct Table {
    nodes: HashMap<u64, Node>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl Table {
    fn ino_of(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.nodes.insert(
            ino,
            Node {
                path: Some(path.to_string()),
                nlookup: 0,
            },
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    fn detach(&mut self, path: &str) {
        if let Some(ino) = self.by_path.remove(path)
            && let Some(node) = self.nodes.get_mut(&ino)
        {
            node.path = None;
            if node.nlookup == 0 && ino != ROOT_INODE {
                self.nodes.remove(&ino);
            }
        }
    }
}

#[derive(Debug)]
pub struct InodeTable {
    table: Mutex<Table>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                path: Some("/".to_string()),
                nlookup: u64::MAX,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert("/".to_string(), ROOT_INODE);
        Self {
            table: Mutex::new(Table {
                nodes,
                by_path,
                next: ROOT_INODE + 1,
            }),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Path currently bound to `ino`; `None` once it was unlinked or forgotten.
    pub fn path(&self, ino: u64) -> Option<String> {
        self.table().nodes.get(&ino).and_then(|n| n.path.clone())
    }

    /// Inode for `path` plus one kernel reference.
    pub fn lookup(&self, path: &str) -> u64 {
        let mut table = self.table();
        let ino = table.ino_of(path);
        if let Some(node) = table.nodes.get_mut(&ino) {
            node.nlookup = node.nlookup.saturating_add(1);
        }
        ino
    }

    /// Inode for `path` without a kernel reference, for plain readdir entries.
    pub fn peek(&self, path: &str) -> u64 {
        self.table().ino_of(path)
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut table = self.table();
        let Some(node) = table.nodes.get_mut(&ino) else {
            return;
        };
        node.nlookup = node.nlookup.saturating_sub(nlookup);
        if node.nlookup == 0
            && let Some(node) = table.nodes.remove(&ino)
            && let Some(path) = node.path
        {
            table.by_path.remove(&path);
        }
    }

    /// Drops the path binding after unlink/rmdir.
    pub fn detach(&self, path: &str) {
        self.table().detach(path);
    }

    /// Rebinds `from` and everything below it to `to`. A node already at
    /// `to` was replaced by the rename and loses its path.
    pub fn rename(&self, from: &str, to: &str) {
        let mut table = self.table();
        table.detach(to);

        let prefix = format!("{}/", from.trim_end_matches('/'));
        let moved: Vec<(String, u64)> = table
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            table.by_path.remove(&old);
            let new = format!("{to}{}", &old[from.len()..]);
            if let Some(node) = table.nodes.get_mut(&ino) {
                node.path = Some(new.clone());
            }
            table.by_path.insert(new, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.table().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
