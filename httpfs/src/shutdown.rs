//! Shutdown coordinator
//!
//! `Running -> Stopping -> Unmounting -> Done`, or `Failed` once the unmount
//! retries are used up. Stopping fails every outstanding call so nothing
//! keeps the kernel waiting while the unmount is attempted.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::{HttpFsError, Result};
use crate::rpc::CallManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    Unmounting,
    Done,
    Failed,
}

/// The kernel-side unmount transaction. May fail and be retried.
#[async_trait]
pub trait Unmount: Send {
    async fn unmount(&mut self) -> io::Result<()>;
}

pub struct ShutdownCoordinator<U> {
    rpc: CallManager,
    unmounter: U,
    mountpoint: PathBuf,
    attempts: u32,
    delay: Duration,
    state: ShutdownState,
}

impl<U: Unmount> ShutdownCoordinator<U> {
    pub fn new(
        rpc: CallManager,
        unmounter: U,
        mountpoint: PathBuf,
        attempts: u32,
        delay: Duration,
    ) -> Self {
        Self {
            rpc,
            unmounter,
            mountpoint,
            attempts: attempts.max(1),
            delay,
            state: ShutdownState::Running,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Runs the whole sequence. Calling it again after `Done` is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.state() {
            ShutdownState::Done => return Ok(()),
            ShutdownState::Running => {
                self.state = ShutdownState::Stopping;
                let cancelled = self.rpc.shutdown();
                info!(cancelled, "stopped accepting filesystem calls");
            }
            _ => {}
        }

        self.state = ShutdownState::Unmounting;
        for attempt in 1..=self.attempts {
            match self.unmounter.unmount().await {
                Ok(()) => {
                    info!("unmounted {}", self.mountpoint.display());
                    self.state = ShutdownState::Done;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        "failed to unmount {}: {e}",
                        self.mountpoint.display()
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        self.state = ShutdownState::Failed;
        let mp = self.mountpoint.display();
        error!("could not unmount {mp} after {} attempts", self.attempts);
        error!("make sure no process has its working directory inside {mp}");
        error!("then run: fusermount -u {mp}");
        error!("if it is still busy, run: umount --lazy {mp}");
        Err(HttpFsError::UnmountFailed {
            mountpoint: self.mountpoint.clone(),
            attempts: self.attempts,
        })
    }
}
