// Process spawner module
// Launches the next generation with the listening socket in the recovery slot
#![allow(unsafe_code)]

use std::ffi::OsString;
use std::future::Future;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;

use super::listener::{ListenerHandle, LISTEN_FD};
use crate::error::{Error, Result};

/// Descriptor slot carrying the readiness channel back to the parent
pub const READY_FD: RawFd = 4;

/// Set to `1` in a spawned generation: recover the listener, don't bind
pub const RECOVER_ENV: &str = "HANDOFF_RECOVER";

/// Names the descriptor a spawned generation writes its readiness byte to
pub const READY_ENV: &str = "HANDOFF_READY_FD";

/// Command-line flag with the same meaning as [`RECOVER_ENV`]
pub const RECOVER_ARG: &str = "--graceful";

/// Staged descriptors are moved above this value before the fork so that
/// placing them into slots 3 and 4 can never clobber one another.
const STAGING_FD_FLOOR: RawFd = 10;

/// Whether this process was started by a previous generation.
pub fn recover_requested() -> bool {
    std::env::var(RECOVER_ENV).is_ok_and(|v| v == "1")
}

/// Transfers the listening socket to a successor generation.
///
/// Resolves to the successor's pid once it is accepting connections.
pub trait Handoff: Send + Sync {
    fn hand_off(&self, listener: &ListenerHandle) -> impl Future<Output = Result<u32>> + Send;
}

/// Spawns the next generation as a child process.
///
/// Single-flight: a second spawn while one is outstanding is rejected with
/// [`Error::SpawnInProgress`]. A failed attempt clears the flag so a later
/// restart can retry; a confirmed one keeps it set because this generation
/// is retiring.
#[derive(Debug)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    ready_timeout: Duration,
    in_progress: AtomicBool,
}

impl ProcessSpawner {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ready_timeout,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Re-exec the running binary with its own arguments plus [`RECOVER_ARG`].
    ///
    /// The executable path is resolved now, so a binary replaced on disk
    /// later is picked up by the next generation.
    pub fn for_current_exe(ready_timeout: Duration) -> Result<Self> {
        let program = std::env::current_exe()?;
        let mut args: Vec<OsString> = std::env::args_os()
            .skip(1)
            .filter(|a| a != RECOVER_ARG && a != "-g")
            .collect();
        args.push(RECOVER_ARG.into());
        Ok(Self::new(program, args, ready_timeout))
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Fork/exec the next generation with `handle` duplicated into
    /// [`LISTEN_FD`]. Does not wait for it to become ready.
    pub fn spawn_next_generation(&self, handle: &ListenerHandle) -> Result<PendingChild> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::SpawnInProgress);
        }

        self.launch(handle).inspect_err(|_| self.clear())
    }

    fn clear(&self) {
        self.in_progress.store(false, Ordering::Release);
    }

    fn launch(&self, handle: &ListenerHandle) -> Result<PendingChild> {
        let (ready_rx, ready_tx) =
            UnixStream::pair().map_err(|e| Error::Spawn(format!("readiness channel: {e}")))?;

        let listen_stage = stage_fd(handle.as_raw_fd())?;
        let ready_stage = stage_fd(ready_tx.as_raw_fd())?;
        drop(ready_tx);

        let listen_src = listen_stage.as_raw_fd();
        let ready_src = ready_stage.as_raw_fd();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(RECOVER_ENV, "1")
            .env(READY_ENV, READY_FD.to_string())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0);

        // SAFETY: the hook runs between fork and exec and only calls dup2,
        // which is async-signal-safe. dup2 leaves the targets without
        // FD_CLOEXEC, so both survive the exec.
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(listen_src, LISTEN_FD) == -1 || libc::dup2(ready_src, READY_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.program.display())))?;

        // The child holds its own copies now
        drop(listen_stage);
        drop(ready_stage);

        Ok(PendingChild {
            child,
            ready: ready_rx,
        })
    }
}

impl Handoff for ProcessSpawner {
    async fn hand_off(&self, listener: &ListenerHandle) -> Result<u32> {
        let pending = self.spawn_next_generation(listener)?;
        tracing::info!(pid = pending.pid(), "next generation launched, awaiting readiness");

        pending
            .confirm(self.ready_timeout)
            .await
            .inspect_err(|_| self.clear())
    }
}

/// A launched successor that has not yet confirmed it is accepting.
#[derive(Debug)]
pub struct PendingChild {
    child: Child,
    ready: UnixStream,
}

impl PendingChild {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the successor's readiness byte. On failure the successor is
    /// killed, so a half-started generation never keeps serving.
    pub async fn confirm(self, timeout: Duration) -> Result<u32> {
        let Self { mut child, ready } = self;
        let pid = child.id();

        match wait_ready(ready, timeout).await {
            Ok(()) => Ok(pid),
            Err(e) => {
                tokio::task::spawn_blocking(move || {
                    let _ = child.kill();
                    let _ = child.wait();
                });
                Err(e)
            }
        }
    }
}

async fn wait_ready(ready: UnixStream, timeout: Duration) -> Result<()> {
    ready.set_nonblocking(true)?;
    let mut ready = tokio::net::UnixStream::from_std(ready)?;
    let mut byte = [0u8; 1];

    match tokio::time::timeout(timeout, ready.read(&mut byte)).await {
        Ok(Ok(1)) => Ok(()),
        Ok(Ok(_)) => Err(Error::Spawn(
            "next generation exited before reporting readiness".to_string(),
        )),
        Ok(Err(e)) => Err(Error::Spawn(format!("readiness channel: {e}"))),
        Err(_) => Err(Error::Spawn(format!(
            "next generation not ready within {timeout:?}"
        ))),
    }
}

/// Duplicate `fd` above [`STAGING_FD_FLOOR`] with close-on-exec set.
fn stage_fd(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor or -1.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, STAGING_FD_FLOOR) };
    if dup == -1 {
        return Err(Error::Spawn(format!(
            "cannot duplicate fd {fd}: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: `dup` was just created by fcntl and has no other owner.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Tell the parent generation this process is accepting connections.
///
/// Returns `false` when the process was not spawned by a previous
/// generation. Call at most once.
pub fn notify_parent_ready() -> Result<bool> {
    let Some(fd) = std::env::var(READY_ENV)
        .ok()
        .and_then(|v| v.parse::<RawFd>().ok())
    else {
        return Ok(false);
    };

    // SAFETY: F_GETFD only reads descriptor flags and accepts any integer.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Ok(false);
    }

    // SAFETY: the parent placed the readiness channel in this slot and
    // nothing else in this process owns it; it is closed when dropped here.
    let mut channel = unsafe { UnixStream::from_raw_fd(fd) };
    channel.write_all(b"1")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::listener::acquire;

    fn handle() -> ListenerHandle {
        acquire("127.0.0.1:0".parse().unwrap(), false, None).unwrap()
    }

    fn sh(script: &str, ready_timeout: Duration) -> ProcessSpawner {
        ProcessSpawner::new("/bin/sh", ["-c", script], ready_timeout)
    }

    #[tokio::test]
    async fn child_confirms_readiness() {
        let spawner = sh("printf 1 >&4", Duration::from_secs(5));
        let pid = spawner.hand_off(&handle()).await.unwrap();
        assert!(pid > 0);
        assert!(spawner.is_in_progress());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn child_sees_listener_and_recover_marker() {
        let spawner = sh(
            "[ -S /proc/self/fd/3 ] && [ \"$HANDOFF_RECOVER\" = 1 ] && [ \"$HANDOFF_READY_FD\" = 4 ] && printf 1 >&4",
            Duration::from_secs(5),
        );
        spawner.hand_off(&handle()).await.unwrap();
    }

    #[tokio::test]
    async fn second_spawn_is_rejected_while_outstanding() {
        let spawner = sh("sleep 2", Duration::from_secs(5));
        let listener = handle();

        let pending = spawner.spawn_next_generation(&listener).unwrap();
        let err = spawner.spawn_next_generation(&listener).unwrap_err();
        assert!(matches!(err, Error::SpawnInProgress));

        drop(pending.confirm(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn child_exiting_without_readiness_fails() {
        let spawner = sh("exit 0", Duration::from_secs(5));
        let err = spawner.hand_off(&handle()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(!spawner.is_in_progress());
    }

    #[tokio::test]
    async fn slow_child_times_out_and_can_be_retried() {
        let spawner = sh("sleep 5", Duration::from_millis(100));
        let listener = handle();

        let err = spawner.hand_off(&listener).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(msg) if msg.contains("not ready")));
        assert!(!spawner.is_in_progress());

        // The flag was cleared, so a new attempt is allowed
        assert!(!matches!(
            spawner.hand_off(&listener).await,
            Err(Error::SpawnInProgress)
        ));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spawner = ProcessSpawner::new(
            "/nonexistent/handoff-server",
            Vec::<String>::new(),
            Duration::from_secs(1),
        );
        let err = spawner.hand_off(&handle()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(!spawner.is_in_progress());
    }

    /// Body of the generation spawned by `test_binary_recovers_and_reports_ready`.
    /// Does nothing when run as an ordinary test.
    #[test]
    fn readiness_child() {
        if !recover_requested() {
            return;
        }
        let inherited = acquire("127.0.0.1:0".parse().unwrap(), true, None).unwrap();
        assert!(inherited.is_inherited());
        assert!(notify_parent_ready().unwrap());
    }

    #[tokio::test]
    async fn test_binary_recovers_and_reports_ready() {
        let listener = handle();
        let spawner = ProcessSpawner::new(
            std::env::current_exe().unwrap(),
            [
                "server::spawner::tests::readiness_child",
                "--exact",
                "--test-threads=1",
                "--nocapture",
            ],
            Duration::from_secs(10),
        );

        let pid = spawner.hand_off(&listener).await.unwrap();
        assert!(pid > 0);
        assert!(spawner.is_in_progress());
    }

    #[test]
    fn notify_without_parent_is_noop() {
        if std::env::var_os(READY_ENV).is_none() {
            assert!(!notify_parent_ready().unwrap());
        }
    }
}
