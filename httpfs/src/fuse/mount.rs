//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Unprivileged mounts go through fusermount3, privileged ones use the
//!   mount syscall directly. Unmounting mirrors whichever was used.
//! - The rfuse3 raw session runs in its own task; its end is published on a
//!   watch channel so both [`Mount::closed`] and the unmounter can wait on it.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rfuse3::MountOptions;
use rfuse3::raw::Session;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::MountConfig;
use crate::error::{HttpFsError, Result};
use crate::shutdown::{ShutdownCoordinator, ShutdownState, Unmount};
use crate::fuse::HttpFuse;
use crate::vfs::HttpFs;
use crate::wire::transport::{HttpOptions, HttpTransport, Transport};

/// How long to wait for the session to wind down once the kernel let go.
const SESSION_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

fn mount_options(config: &MountConfig) -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("httpfs");
    mo.allow_other(config.allow_other);
    mo
}

/// Unmounts through fusermount3 or umount(2) and waits for the session task.
pub struct FuseUnmounter {
    mountpoint: PathBuf,
    unprivileged: bool,
    finished: watch::Receiver<bool>,
    detached: bool,
}

impl FuseUnmounter {
    pub fn new(mountpoint: PathBuf, unprivileged: bool, finished: watch::Receiver<bool>) -> Self {
        Self {
            mountpoint,
            unprivileged,
            finished,
            detached: false,
        }
    }

    async fn detach(&self) -> io::Result<()> {
        if self.unprivileged {
            let output = tokio::process::Command::new("fusermount3")
                .arg("-u")
                .arg(&self.mountpoint)
                .output()
                .await?;
            if !output.status.success() {
                return Err(io::Error::other(format!(
                    "fusermount3 -u exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Ok(())
        } else {
            umount(&self.mountpoint)
        }
    }
}

#[cfg(target_os = "linux")]
fn umount(mountpoint: &Path) -> io::Result<()> {
    nix::mount::umount(mountpoint).map_err(io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn umount(mountpoint: &Path) -> io::Result<()> {
    nix::mount::unmount(mountpoint, nix::mount::MntFlags::empty()).map_err(io::Error::from)
}

#[async_trait]
impl Unmount for FuseUnmounter {
    async fn unmount(&mut self) -> io::Result<()> {
        if *self.finished.borrow() {
            return Ok(());
        }
        // once the kernel let go, later attempts only wait for the session
        if !self.detached {
            self.detach().await?;
            self.detached = true;
        }
        match tokio::time::timeout(SESSION_EXIT_TIMEOUT, self.finished.wait_for(|done| *done)).await
        {
            Ok(_) => Ok(()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "fuse session did not exit after unmount",
            )),
        }
    }
}

/// A live mount. Dropping it does not unmount; call [`Mount::unmount`].
pub struct Mount {
    coordinator: ShutdownCoordinator<FuseUnmounter>,
    finished: watch::Receiver<bool>,
    mountpoint: PathBuf,
}

impl Mount {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn state(&self) -> ShutdownState {
        self.coordinator.state()
    }

    /// Fails outstanding calls, then unmounts with bounded retries.
    pub async fn unmount(&mut self) -> Result<()> {
        self.coordinator.shutdown().await
    }

    /// Resolves once the FUSE session has ended, e.g. after an external umount.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut finished = self.finished.clone();
        async move {
            let _ = finished.wait_for(|done| *done).await;
        }
    }
}

/// Mounts `endpoint` on `mountpoint` over HTTP(S).
pub async fn mount(
    endpoint: &str,
    mountpoint: impl AsRef<Path>,
    config: MountConfig,
) -> Result<Mount> {
    let options = HttpOptions {
        certificate: config.certificate.clone(),
        headers: config.headers.clone(),
    };
    let transport = HttpTransport::new(endpoint, &options)?;
    mount_with(Arc::new(transport), endpoint, mountpoint, config).await
}

/// Mounts with a caller supplied transport. `endpoint` is only used for messages.
pub async fn mount_with(
    transport: Arc<dyn Transport>,
    endpoint: &str,
    mountpoint: impl AsRef<Path>,
    config: MountConfig,
) -> Result<Mount> {
    let mountpoint = mountpoint.as_ref().to_path_buf();
    let unprivileged = config.unprivileged;
    let attempts = config.unmount_attempts;
    let delay = config.unmount_delay;
    let options = mount_options(&config);

    let fs = HttpFs::new(transport, config);
    let rpc = fs.rpc().clone();
    let fs = HttpFuse::new(fs);

    let session = Session::new(options);
    let mounted = if unprivileged {
        session.mount_with_unprivileged(fs, &mountpoint).await
    } else {
        session.mount(fs, &mountpoint).await
    };
    let handle = mounted.map_err(|source| HttpFsError::Mount {
        endpoint: endpoint.to_string(),
        mountpoint: mountpoint.clone(),
        source,
    })?;
    info!("mounted {endpoint} on {}", mountpoint.display());

    let (done_tx, finished) = watch::channel(false);
    let mp = mountpoint.clone();
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            error!("fuse session on {} ended with error: {e}", mp.display());
        }
        let _ = done_tx.send(true);
    });

    let unmounter = FuseUnmounter::new(mountpoint.clone(), unprivileged, finished.clone());
    let coordinator = ShutdownCoordinator::new(rpc, unmounter, mountpoint.clone(), attempts, delay);

    Ok(Mount {
        coordinator,
        finished,
        mountpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmounter(finished: watch::Receiver<bool>) -> FuseUnmounter {
        FuseUnmounter::new(PathBuf::from("/nonexistent/httpfs-mnt"), true, finished)
    }

    #[tokio::test]
    async fn test_finished_session_needs_no_detach() {
        let (_tx, rx) = watch::channel(true);
        let mut u = unmounter(rx);
        u.unmount().await.unwrap();
        assert!(!u.detached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_detach_only_waits_for_session() {
        let (tx, rx) = watch::channel(false);
        let mut u = unmounter(rx);
        // a previous attempt already detached; the session is just slow to exit
        u.detached = true;

        let err = u.unmount().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        tx.send(true).unwrap();
        u.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_detach_is_retried() {
        let (_tx, rx) = watch::channel(false);
        let mut u = unmounter(rx);
        assert!(u.unmount().await.is_err());
        assert!(!u.detached);
    }
}
