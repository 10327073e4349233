use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use regex::Regex;

use crate::error::{HttpFsError, Result};

/// Runtime options for one mount.
#[derive(Clone, Debug)]
pub struct MountConfig {
    /// Retry budget in seconds: one retry per second of timeout.
    pub timeout: u32,
    /// Block cache granularity in bytes; 0 disables the block cache.
    pub blocksize: usize,
    pub attr_cache: bool,
    /// Enables the block cache (still requires `blocksize > 0`).
    pub cache: bool,
    /// Paths matching this pattern bypass the block cache.
    pub nocache: Option<Regex>,
    /// Extra PEM CA certificate for https endpoints.
    pub certificate: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    pub quiet: bool,
    pub unprivileged: bool,
    pub allow_other: bool,
    pub retry_delay: Duration,
    pub unmount_attempts: u32,
    pub unmount_delay: Duration,
    /// How long the kernel may keep attributes we reply with.
    pub attr_ttl: Duration,
    pub attr_cache_capacity: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            timeout: 3600,
            blocksize: 1024 * 1024,
            attr_cache: false,
            cache: false,
            nocache: None,
            certificate: None,
            headers: Vec::new(),
            quiet: false,
            unprivileged: true,
            allow_other: false,
            retry_delay: Duration::from_secs(1),
            unmount_attempts: 10,
            unmount_delay: Duration::from_millis(100),
            attr_ttl: Duration::from_secs(1),
            attr_cache_capacity: 100_000,
        }
    }
}

impl MountConfig {
    /// Block size the block cache actually runs with; 0 when caching is off.
    pub fn effective_blocksize(&self) -> usize {
        if self.cache { self.blocksize } else { 0 }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "httpfs",
    version,
    about = "Mount a remote HTTP filesystem backend through FUSE"
)]
pub struct Args {
    /// Backend URL (http or https)
    pub endpoint: String,

    /// Empty directory to mount on
    pub mountpoint: PathBuf,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Seconds to keep retrying a failing request
    #[arg(short, long, default_value_t = 3600)]
    pub timeout: u32,

    /// Cache getattr results until the path is modified
    #[arg(long)]
    pub attrcache: bool,

    /// Enable the per-file block cache
    #[arg(long)]
    pub cache: bool,

    /// Block cache size, e.g. 4096, 512k, 1m
    #[arg(long, default_value = "1m", value_parser = parse_size)]
    pub blocksize: usize,

    /// Regex of paths that bypass the block cache
    #[arg(long)]
    pub nocache: Option<String>,

    /// PEM CA certificate given inline
    #[arg(long, env = "HTTPFS_CERT")]
    pub certraw: Option<String>,

    /// PEM CA certificate file
    #[arg(long)]
    pub certfile: Option<PathBuf>,

    /// Extra request header as name:value, may be repeated
    #[arg(long = "header", value_parser = parse_header, number_of_values = 1)]
    pub headers: Vec<(String, String)>,

    /// Let other users access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// Mount and unmount directly instead of through fusermount3
    #[arg(long)]
    pub privileged: bool,
}

impl Args {
    pub fn to_config(&self) -> Result<MountConfig> {
        let nocache = self
            .nocache
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| HttpFsError::InvalidConfig(format!("nocache pattern: {e}")))?;

        let certificate = match (&self.certraw, &self.certfile) {
            (Some(raw), _) => Some(raw.clone().into_bytes()),
            (None, Some(path)) => Some(std::fs::read(path).map_err(|e| {
                HttpFsError::InvalidConfig(format!("certificate {}: {e}", path.display()))
            })?),
            (None, None) => None,
        };

        Ok(MountConfig {
            timeout: self.timeout,
            blocksize: self.blocksize,
            attr_cache: self.attrcache,
            cache: self.cache,
            nocache,
            certificate,
            headers: self.headers.clone(),
            quiet: self.quiet,
            unprivileged: !self.privileged,
            allow_other: self.allow_other,
            ..Default::default()
        })
    }
}

/// Parses a byte count with an optional 1024-based `k`/`m`/`g` suffix
/// (`b`, `ib` also accepted, case-insensitive).
pub fn parse_size(s: &str) -> std::result::Result<usize, String> {
    let lower = s.trim().to_ascii_lowercase();
    let digits_end = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (num, unit) = lower.split_at(digits_end);
    let num: usize = num.parse().map_err(|_| format!("invalid size `{s}`"))?;
    let shift = match unit.trim() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        other => return Err(format!("unknown size unit `{other}` in `{s}`")),
    };
    num.checked_mul(1usize << shift)
        .ok_or_else(|| format!("size `{s}` is too large"))
}

fn parse_header(s: &str) -> std::result::Result<(String, String), Box<dyn Error + Send + Sync + 'static>> {
    let pos = s
        .find(':')
        .ok_or_else(|| format!("invalid name:value: no `:` found in `{s}`"))?;
    let name = s[..pos].trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{s}`").into());
    }
    Ok((name.to_string(), s[pos + 1..].trim().to_string()))
}
