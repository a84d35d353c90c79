//! Network namespace handles and scoped namespace switching.
//!
//! `setns(2)` changes the namespace of the calling thread only. Work that
//! must happen inside a target namespace therefore runs on a dedicated OS
//! thread spawned for that purpose ([`run_in_netns`]); pooled runtime
//! threads never carry a namespace override.

use std::future::Future;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ovncni_common::{CniError, CniResult};
use rustix::fs::{Mode, OFlags};
use rustix::thread::{LinkNameSpaceType, move_into_link_name_space};
use tokio::time::Instant;

/// Namespace of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Interval between namespace readiness polls.
const NETNS_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn ns_error(path: &Path, message: impl std::fmt::Display) -> CniError {
    CniError::Namespace {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

/// An open network namespace.
#[derive(Debug)]
pub struct NetnsHandle {
    path: PathBuf,
    fd: OwnedFd,
}

impl NetnsHandle {
    /// Open the namespace at `path` (`/var/run/netns/<name>`,
    /// `/proc/<pid>/ns/net`, ...).
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Namespace`] if the path cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> CniResult<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| ns_error(path, format!("failed to open: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            fd,
        })
    }

    /// The namespace of the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Namespace`] if procfs is unavailable.
    pub fn current() -> CniResult<Self> {
        Self::open(THREAD_NETNS)
    }

    /// Path the handle was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duplicate the handle so it can be moved to another thread.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Namespace`] if the descriptor cannot be duplicated.
    pub fn try_clone(&self) -> CniResult<Self> {
        Ok(Self {
            path: self.path.clone(),
            fd: self
                .fd
                .try_clone()
                .map_err(|e| ns_error(&self.path, format!("failed to duplicate: {e}")))?,
        })
    }

    /// Switch the calling thread into this namespace.
    ///
    /// The returned guard switches back when dropped. It is not `Send`:
    /// the restore must happen on the thread that entered.
    ///
    /// # Errors
    ///
    /// Returns [`CniError::Namespace`] if either namespace cannot be
    /// opened or entered.
    pub fn enter(&self) -> CniResult<NetnsGuard> {
        let original = Self::current()?;
        move_into_link_name_space(self.fd.as_fd(), Some(LinkNameSpaceType::Network))
            .map_err(|e| ns_error(&self.path, format!("setns failed: {e}")))?;
        tracing::trace!(netns = %self.path.display(), "Entered network namespace");
        Ok(NetnsGuard {
            original,
            _not_send: PhantomData,
        })
    }
}

impl AsFd for NetnsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NetnsHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Restores the thread's original namespace on drop.
#[derive(Debug)]
pub struct NetnsGuard {
    original: NetnsHandle,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) =
            move_into_link_name_space(self.original.fd.as_fd(), Some(LinkNameSpaceType::Network))
        {
            // The worker thread exits right after, taking the override with it.
            tracing::error!(error = %e, "Failed to restore original network namespace");
        }
    }
}

/// Run `f` inside `netns` on a dedicated thread with its own
/// current-thread runtime, and return its result.
///
/// # Errors
///
/// Returns [`CniError::Namespace`] if the namespace cannot be entered or
/// the worker dies, otherwise whatever `f` returns.
pub async fn run_in_netns<F, Fut, T>(netns: &NetnsHandle, f: F) -> CniResult<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = CniResult<T>>,
    T: Send + 'static,
{
    let target = netns.try_clone()?;
    let path = target.path.clone();
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::Builder::new()
        .name("netns-worker".into())
        .spawn(move || {
            let result = (|| -> CniResult<T> {
                let _guard = target.enter()?;
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(f())
            })();
            let _ = tx.send(result);
        })
        .map_err(|e| ns_error(&path, format!("failed to spawn worker: {e}")))?;

    rx.await
        .map_err(|_| ns_error(&path, "namespace worker exited without a result"))?
}

/// Wait until the namespace path exists.
///
/// Runtimes may hand over a namespace path before it is bind-mounted.
///
/// # Errors
///
/// Returns [`CniError::Timeout`] if the path does not appear in time.
pub async fn wait_for_netns(path: &Path, timeout: Duration) -> CniResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(CniError::Timeout {
                operation: format!("network namespace {}", path.display()),
                after: timeout,
            });
        }
        tokio::time::sleep(NETNS_POLL_INTERVAL).await;
    }
}
