//! Advisory writer lock.
//!
//! A `chain.lock` file holding the writer's PID guards every write path, so
//! two processes cannot append to the same chain. A lock left behind by a
//! dead process is taken over on the next acquire.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::ChainError;

#[derive(Debug)]
pub struct ChainLock {
    path: PathBuf,
}

impl ChainLock {
    pub fn acquire(chain_dir: &Path) -> Result<Self, ChainError> {
        let path = chain_dir.join("chain.lock");
        // Two passes: the first may remove a stale lock, the second claims it.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_holder_pid(&path);
                    match holder {
                        Some(pid) if is_process_alive(pid) => {
                            return Err(ChainError::WriteLocked(pid));
                        }
                        _ => {
                            warn!(path = %path.display(), stale_pid = ?holder, "removing stale writer lock");
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ChainError::WriteLocked(read_holder_pid(&path).unwrap_or(0)))
    }
}

impl Drop for ChainLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence without delivering a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
