// Per-process client record. Owns the shared-memory arena budget that
// control blocks and PCM rings are charged against; 1 MiB of address space
// is good for about 32 tracks of 8 x 4 KiB buffers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

use crate::audio::server::AudioServer;
use crate::audio::types::{AudioError, AudioResult, Pid, CLIENT_ARENA_BYTES};

pub struct Client {
    pid: Pid,
    server: Weak<AudioServer>,
    used: AtomicUsize,
}

impl Client {
    pub(crate) fn new(server: Weak<AudioServer>, pid: Pid) -> Self {
        Client {
            pid,
            server,
            used: AtomicUsize::new(0),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Charge `bytes` against the arena; fails without side effects when
    /// the budget is exhausted.
    pub(crate) fn allocate(&self, bytes: usize) -> AudioResult<()> {
        let before = self.used.fetch_add(bytes, Ordering::AcqRel);
        if before + bytes > CLIENT_ARENA_BYTES {
            self.used.fetch_sub(bytes, Ordering::AcqRel);
            tracing::error!(
                "not enough arena memory for client {} (requested {} bytes)",
                self.pid,
                bytes
            );
            return Err(AudioError::NoMemory);
        }
        Ok(())
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.remove_client(self.pid);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pid", &self.pid)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}
