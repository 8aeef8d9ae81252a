use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use bstore_fs::{remove_path, CancelToken, IoResultExt};
use tracing::{debug, info};
use url::Url;

use crate::error::{StageError, StageResult};

const CHUNK_SIZE: usize = 256 * 1024;
const GIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Lines of git's stderr kept in a clone error.
const STDERR_TAIL_LINES: usize = 20;

/// Fetches remote sources into the staging area.
///
/// Implementations must honor `cancel` (including its deadline) and must not
/// leave anything at `dest` claimed as complete on failure.
pub trait Transfer: Send + Sync {
    /// Download `url` to the file `dest`.
    fn download(&self, url: &Url, dest: &Path, cancel: &CancelToken) -> StageResult<()>;

    /// Clone the git repository at `url` into the directory `dest`.
    fn git_clone(&self, url: &Url, dest: &Path, cancel: &CancelToken) -> StageResult<()>;
}

/// Settings for [`NetworkTransfer`].
#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub git_program: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("bstore/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(30),
            git_program: PathBuf::from("git"),
        }
    }
}

/// HTTP downloads via `reqwest`, clones via the `git` executable.
pub struct NetworkTransfer {
    client: reqwest::blocking::Client,
    git_program: PathBuf,
}

impl NetworkTransfer {
    pub fn new(config: &TransferConfig) -> StageResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StageError::Transfer {
                url: String::new(),
                reason: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            git_program: config.git_program.clone(),
        })
    }
}

fn transfer_error(url: &Url, reason: impl ToString) -> StageError {
    StageError::Transfer {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

impl Transfer for NetworkTransfer {
    fn download(&self, url: &Url, dest: &Path, cancel: &CancelToken) -> StageResult<()> {
        cancel.check()?;
        info!(url = %url, dest = %dest.display(), "downloading");
        let mut request = self.client.get(url.clone());
        if let Some(remaining) = cancel.remaining() {
            request = request.timeout(remaining);
        }
        let mut response = request
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| transfer_error(url, e))?;

        let total = write_stream(&mut response, dest, cancel, |e| transfer_error(url, e))?;
        debug!(url = %url, bytes = total, "download complete");
        Ok(())
    }

    fn git_clone(&self, url: &Url, dest: &Path, cancel: &CancelToken) -> StageResult<()> {
        cancel.check()?;
        info!(url = %url, dest = %dest.display(), "cloning");
        let mut child = Command::new(&self.git_program)
            .args(["clone", "--quiet", "--"])
            .arg(url.as_str())
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| transfer_error(url, format!("cannot run {}: {e}", self.git_program.display())))?;

        // Drained concurrently so a chatty clone never blocks on a full pipe.
        let pipe = child.stderr.take();
        let drain = thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_string(&mut text);
            }
            text
        });

        loop {
            let status = match child.try_wait() {
                Ok(status) => status,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    remove_path(dest)?;
                    return Err(transfer_error(url, e));
                }
            };
            if let Some(status) = status {
                let stderr = drain.join().unwrap_or_default();
                if status.success() {
                    debug!(url = %url, "clone complete");
                    return Ok(());
                }
                remove_path(dest)?;
                return Err(transfer_error(
                    url,
                    format!("git clone exited with {status}: {}", stderr_tail(&stderr)),
                ));
            }
            if let Err(e) = cancel.check() {
                let _ = child.kill();
                let _ = child.wait();
                remove_path(dest)?;
                return Err(e.into());
            }
            thread::sleep(GIT_POLL_INTERVAL);
        }
    }
}

/// Copy `reader` into the new file `dest`, returning the byte count.
///
/// Any failure (read, write, flush or cancellation) removes `dest`.
fn write_stream<R, F>(reader: &mut R, dest: &Path, cancel: &CancelToken, read_error: F) -> StageResult<u64>
where
    R: Read,
    F: Fn(io::Error) -> StageError,
{
    let mut out = File::options()
        .write(true)
        .create_new(true)
        .open(dest)
        .at("create", dest)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    let result: StageResult<()> = loop {
        if let Err(e) = cancel.check() {
            break Err(e.into());
        }
        match reader.read(&mut buf) {
            Ok(0) => break out.flush().at("flush", dest).map_err(StageError::from),
            Ok(n) => {
                if let Err(e) = out.write_all(&buf[..n]).at("write", dest) {
                    break Err(e.into());
                }
                total += n as u64;
            }
            Err(e) => break Err(read_error(e)),
        }
    };
    if let Err(e) = result {
        drop(out);
        remove_path(dest)?;
        return Err(e);
    }
    Ok(total)
}

fn stderr_tail(stderr: &str) -> String {
    let mut tail: Vec<&str> = stderr.trim().lines().rev().take(STDERR_TAIL_LINES).collect();
    tail.reverse();
    tail.join("\n")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;

    /// In-process transfer serving canned bytes; records every call.
    #[derive(Default)]
    pub(crate) struct FakeTransfer {
        pub files: HashMap<String, Vec<u8>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeTransfer {
        pub fn with_file(mut self, url: &str, data: &[u8]) -> Self {
            self.files.insert(url.to_string(), data.to_vec());
            self
        }
    }

    impl Transfer for FakeTransfer {
        fn download(&self, url: &Url, dest: &Path, cancel: &CancelToken) -> StageResult<()> {
            cancel.check()?;
            self.calls.lock().unwrap().push(format!("download {url}"));
            let data = self
                .files
                .get(url.as_str())
                .ok_or_else(|| transfer_error(url, "404 Not Found"))?;
            fs::write(dest, data).at("write", dest)?;
            Ok(())
        }

        fn git_clone(&self, url: &Url, dest: &Path, cancel: &CancelToken) -> StageResult<()> {
            cancel.check()?;
            self.calls.lock().unwrap().push(format!("clone {url}"));
            fs::create_dir_all(dest.join(".git")).at("mkdir", dest)?;
            fs::write(dest.join("README"), url.as_str()).at("write", dest)?;
            Ok(())
        }
    }

    #[test]
    fn default_config_uses_git_on_path() {
        let config = TransferConfig::default();
        assert_eq!(config.git_program, PathBuf::from("git"));
        assert!(config.user_agent.starts_with("bstore/"));
    }

    #[test]
    fn network_transfer_builds() {
        assert!(NetworkTransfer::new(&TransferConfig::default()).is_ok());
    }

    #[test]
    fn missing_git_program_is_a_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = NetworkTransfer::new(&TransferConfig {
            git_program: dir.path().join("no-such-git"),
            ..TransferConfig::default()
        })
        .unwrap();
        let url = Url::parse("https://example.org/repo.git").unwrap();
        let err = transfer
            .git_clone(&url, &dir.path().join("repo"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, StageError::Transfer { .. }));
    }

    /// Yields `good` bytes, then fails.
    struct BrokenReader {
        good: usize,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.good == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"));
            }
            let n = self.good.min(buf.len());
            buf[..n].fill(b'x');
            self.good -= n;
            Ok(n)
        }
    }

    #[test]
    fn stream_is_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload");
        let mut reader: &[u8] = b"complete payload";
        let total = write_stream(&mut reader, &dest, &CancelToken::new(), |e| {
            StageError::Transfer { url: "test".into(), reason: e.to_string() }
        })
        .unwrap();
        assert_eq!(total, 16);
        assert_eq!(fs::read(&dest).unwrap(), b"complete payload");
    }

    #[test]
    fn interrupted_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload");
        let mut reader = BrokenReader { good: 3 * CHUNK_SIZE / 2 };
        let err = write_stream(&mut reader, &dest, &CancelToken::new(), |e| {
            StageError::Transfer { url: "test".into(), reason: e.to_string() }
        })
        .unwrap_err();
        assert!(matches!(err, StageError::Transfer { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn cancelled_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload");
        let token = CancelToken::new();
        token.cancel();
        let mut reader: &[u8] = b"never written";
        let err = write_stream(&mut reader, &dest, &token, |e| StageError::Transfer {
            url: "test".into(),
            reason: e.to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, StageError::Fs(bstore_fs::FsError::Cancelled)));
        assert!(!dest.exists());
    }

    #[cfg(unix)]
    #[test]
    fn noisy_failing_clone_does_not_hang() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join("fake-git");
        fs::write(
            &git,
            "#!/bin/sh\ni=0\nwhile [ $i -lt 5000 ]; do\n  echo \"fatal: line $i of a very long complaint\" >&2\n  i=$((i+1))\ndone\nexit 3\n",
        )
        .unwrap();
        fs::set_permissions(&git, fs::Permissions::from_mode(0o755)).unwrap();

        let transfer = NetworkTransfer::new(&TransferConfig {
            git_program: git,
            ..TransferConfig::default()
        })
        .unwrap();
        let url = Url::parse("https://example.org/repo.git").unwrap();
        let token = CancelToken::with_timeout(Duration::from_secs(60));
        let err = transfer
            .git_clone(&url, &dir.path().join("repo"), &token)
            .unwrap_err();
        let StageError::Transfer { reason, .. } = err else {
            panic!("expected a transfer error, got {err:?}");
        };
        assert!(reason.contains("line 4999"));
        assert!(!reason.contains("line 0 "));
    }

    #[test]
    fn cancelled_download_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = NetworkTransfer::new(&TransferConfig::default()).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let url = Url::parse("https://example.invalid/data").unwrap();
        let err = transfer
            .download(&url, &dir.path().join("data"), &token)
            .unwrap_err();
        assert!(matches!(err, StageError::Fs(bstore_fs::FsError::Cancelled)));
    }
}
