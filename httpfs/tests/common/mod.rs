#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use httpfs::error::TransportError;
use httpfs::wire::transport::Transport;
use httpfs::wire::{BincodeCodec, Codec, Reply, Request, Stat, Timespec, Value, Verb};

#[derive(Clone, Debug)]
pub struct Node {
    pub stat: Stat,
    pub data: Vec<u8>,
    pub target: Option<String>,
}

impl Node {
    fn file(mode: u32, data: Vec<u8>) -> Self {
        Self {
            stat: Stat {
                mode: libc::S_IFREG as u32 | (mode & 0o7777),
                size: data.len() as u64,
                nlink: 1,
                ..Default::default()
            },
            data,
            target: None,
        }
    }

    fn dir(mode: u32) -> Self {
        Self {
            stat: Stat {
                mode: libc::S_IFDIR as u32 | (mode & 0o7777),
                nlink: 2,
                ..Default::default()
            },
            data: Vec::new(),
            target: None,
        }
    }
}

/// In-memory backend speaking the bincode wire format.
#[derive(Default)]
pub struct MemBackend {
    nodes: Mutex<BTreeMap<String, Node>>,
    log: Mutex<Vec<Request>>,
}

impl MemBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend
            .nodes
            .lock()
            .unwrap()
            .insert("/".to_string(), Node::dir(0o755));
        backend
    }

    pub fn with_file(self, path: &str, data: &[u8]) -> Self {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::file(0o644, data.to_vec()));
        self
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(path).cloned()
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.operation == verb.as_str())
            .count()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    fn handle(&self, req: &Request) -> Reply {
        let verb = match req.verb() {
            Ok(v) => v,
            Err(_) => return Reply::failure(-libc::ENOSYS),
        };
        let mut nodes = self.nodes.lock().unwrap();
        let args = &req.args;
        let path = match args.first() {
            Some(Value::Str(p)) => p.clone(),
            _ => return Reply::failure(-libc::EINVAL),
        };
        let enoent = Reply::failure(-libc::ENOENT);

        match verb {
            Verb::Getattr => match nodes.get(&path) {
                Some(node) => Reply::new(0, vec![Value::Stat(node.stat.clone())]),
                None => enoent,
            },
            Verb::Readdir => {
                let prefix = if path == "/" {
                    "/".to_string()
                } else {
                    format!("{path}/")
                };
                let names = nodes
                    .keys()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                    .map(str::to_string)
                    .collect();
                Reply::new(0, vec![Value::Names(names)])
            }
            Verb::Readlink => match nodes.get(&path).and_then(|n| n.target.clone()) {
                Some(target) => Reply::new(0, vec![Value::Str(target)]),
                None => Reply::failure(-libc::EINVAL),
            },
            Verb::Truncate => match (nodes.get_mut(&path), int(args, 1)) {
                (Some(node), Some(size)) => {
                    node.data.resize(size as usize, 0);
                    node.stat.size = size as u64;
                    Reply::new(0, vec![])
                }
                _ => enoent,
            },
            Verb::Chown => match nodes.get_mut(&path) {
                Some(node) => {
                    node.stat.uid = int(args, 1).unwrap_or(0) as u32;
                    node.stat.gid = int(args, 2).unwrap_or(0) as u32;
                    Reply::new(0, vec![])
                }
                None => enoent,
            },
            Verb::Chmod => match nodes.get_mut(&path) {
                Some(node) => {
                    let mode = int(args, 1).unwrap_or(0) as u32;
                    node.stat.mode = (node.stat.mode & libc::S_IFMT as u32) | (mode & 0o7777);
                    Reply::new(0, vec![])
                }
                None => enoent,
            },
            Verb::Read => match (nodes.get(&path), int(args, 1), int(args, 2)) {
                (Some(node), Some(offset), Some(len)) => {
                    let start = (offset as usize).min(node.data.len());
                    let end = (start + len as usize).min(node.data.len());
                    let data = node.data[start..end].to_vec();
                    Reply::new(data.len() as i32, vec![Value::Bytes(data)])
                }
                _ => enoent,
            },
            Verb::Write => match (nodes.get_mut(&path), args.get(1), int(args, 2)) {
                (Some(node), Some(Value::Bytes(data)), Some(offset)) => {
                    let offset = offset as usize;
                    if node.data.len() < offset + data.len() {
                        node.data.resize(offset + data.len(), 0);
                    }
                    node.data[offset..offset + data.len()].copy_from_slice(data);
                    node.stat.size = node.data.len() as u64;
                    Reply::new(data.len() as i32, vec![])
                }
                _ => enoent,
            },
            Verb::Create => {
                let mode = int(args, 1).unwrap_or(0o644) as u32;
                nodes.insert(path, Node::file(mode, Vec::new()));
                Reply::new(0, vec![])
            }
            Verb::Utimens => match (nodes.get_mut(&path), args.get(1), args.get(2)) {
                (Some(node), Some(Value::Time(a)), Some(Value::Time(m))) => {
                    node.stat.atime = *a;
                    node.stat.mtime = *m;
                    Reply::new(0, vec![])
                }
                _ => enoent,
            },
            Verb::Unlink | Verb::Rmdir => match nodes.remove(&path) {
                Some(_) => Reply::new(0, vec![]),
                None => enoent,
            },
            Verb::Rename => match (nodes.remove(&path), string(args, 1)) {
                (Some(node), Some(dest)) => {
                    nodes.insert(dest, node);
                    Reply::new(0, vec![])
                }
                _ => enoent,
            },
            Verb::Link => match string(args, 1).and_then(|t| nodes.get(&t).cloned()) {
                Some(mut node) => {
                    node.stat.nlink += 1;
                    nodes.insert(path, node);
                    Reply::new(0, vec![])
                }
                None => enoent,
            },
            Verb::Symlink => {
                let target = string(args, 1).unwrap_or_default();
                let node = Node {
                    stat: Stat {
                        mode: libc::S_IFLNK as u32 | 0o777,
                        size: target.len() as u64,
                        nlink: 1,
                        mtime: Timespec::default(),
                        ..Default::default()
                    },
                    data: Vec::new(),
                    target: Some(target),
                };
                nodes.insert(path, node);
                Reply::new(0, vec![])
            }
            Verb::Mkdir => {
                let mode = int(args, 1).unwrap_or(0o755) as u32;
                nodes.insert(path, Node::dir(mode));
                Reply::new(0, vec![])
            }
        }
    }
}

fn int(args: &[Value], idx: usize) -> Option<i64> {
    match args.get(idx) {
        Some(Value::Int(v)) => Some(*v),
        _ => None,
    }
}

fn string(args: &[Value], idx: usize) -> Option<String> {
    match args.get(idx) {
        Some(Value::Str(v)) => Some(v.clone()),
        _ => None,
    }
}

#[async_trait]
impl Transport for MemBackend {
    async fn exchange(&self, body: Bytes) -> Result<Bytes, TransportError> {
        let codec = BincodeCodec;
        let req = codec
            .decode_request(&body)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        self.log.lock().unwrap().push(req.clone());
        let reply = self.handle(&req);
        codec
            .encode_reply(reply)
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}
