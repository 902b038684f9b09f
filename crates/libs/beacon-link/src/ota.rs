//! Firmware update session.
//!
//! `ota_begin` opens a write handle on the next free partition, `ota_chunk`
//! streams base64 chunks into it (each guarded by an additive checksum) and
//! `ota_end` validates the image and commits it as the boot target.
//!
//! ```text
//!   Idle/Error --begin--> Active --end ok--> Idle
//!                           |  \--end/boot fail--> Error
//!                           \--write fail / abort--> Idle
//! ```

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;

use crate::codec::{Arguments, Reply};
use crate::error::{HandlerError, StorageStep};
use crate::storage::{FlashStorage, PartitionId};

/// Largest decoded chunk accepted by `ota_chunk`.
pub const MAX_CHUNK_BYTES: usize = 3 * 1024;

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Error,
}

/// Snapshot of an active update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateProgress {
    pub partition: PartitionId,
    pub expected_total_bytes: u64,
    pub bytes_written: u64,
}

impl UpdateProgress {
    pub fn remaining(&self) -> u64 {
        self.expected_total_bytes - self.bytes_written
    }
}

/// Result of one accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub written: u64,
    pub total_written: u64,
    pub remaining: u64,
}

struct ActiveUpdate<H> {
    progress: UpdateProgress,
    handle: H,
}

enum Phase<H> {
    Idle,
    Active(ActiveUpdate<H>),
    Error,
}

/// Wrapping 32-bit sum of all bytes, as computed by the companion app.
pub fn additive_checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

/// The single update session of a dispatcher.
///
/// Owns the storage backend. The write handle only exists while the session
/// is active and is released on every path out of that state, including drop.
pub struct UpdateSession<S: FlashStorage> {
    storage: S,
    phase: Phase<S::Handle>,
}

impl<S: FlashStorage> UpdateSession<S> {
    pub fn new(storage: S) -> Self {
        Self { storage, phase: Phase::Idle }
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::Active(_) => SessionState::Active,
            Phase::Error => SessionState::Error,
        }
    }

    pub fn progress(&self) -> Option<UpdateProgress> {
        match &self.phase {
            Phase::Active(active) => Some(active.progress),
            _ => None,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.progress().map_or(0, |progress| progress.bytes_written)
    }

    pub fn expected_total_bytes(&self) -> Option<u64> {
        self.progress().map(|progress| progress.expected_total_bytes)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Open a write handle for an image of `size` bytes.
    pub fn begin(&mut self, size: u64) -> Result<PartitionId, HandlerError> {
        if size == 0 {
            return Err(HandlerError::invalid_field("size"));
        }
        if matches!(self.phase, Phase::Active(_)) {
            return Err(HandlerError::SessionActive);
        }
        let partition = self.storage.next_update_partition().ok_or(HandlerError::NoPartition)?;
        let handle = self
            .storage
            .begin(partition, size)
            .map_err(|source| HandlerError::storage(StorageStep::Begin, source))?;

        log::info!("ota: begin partition={} size={}", partition, size);
        self.phase = Phase::Active(ActiveUpdate {
            progress: UpdateProgress { partition, expected_total_bytes: size, bytes_written: 0 },
            handle,
        });
        Ok(partition)
    }

    /// Decode, verify and write one chunk.
    ///
    /// Every rejection before the storage write leaves the session untouched.
    /// A failed write aborts the session.
    pub fn write_chunk(
        &mut self,
        encoded: &str,
        checksum: u64,
    ) -> Result<ChunkProgress, HandlerError> {
        let Phase::Active(active) = &mut self.phase else {
            return Err(HandlerError::SessionInactive);
        };
        let data = BASE64_STANDARD.decode(encoded).map_err(|_| HandlerError::ChunkDecode)?;
        if data.is_empty() {
            return Err(HandlerError::ChunkDecode);
        }
        if data.len() > MAX_CHUNK_BYTES {
            return Err(HandlerError::ChunkTooLarge { len: data.len(), max: MAX_CHUNK_BYTES });
        }
        let len = data.len() as u64;
        let remaining = active.progress.remaining();
        if len > remaining {
            return Err(HandlerError::ChunkOverrun { len, remaining });
        }
        let calculated = additive_checksum(&data);
        if u64::from(calculated) != checksum {
            log::warn!(
                "ota: checksum mismatch expected={} calculated={} len={}",
                checksum,
                calculated,
                len
            );
            return Err(HandlerError::ChecksumMismatch { expected: checksum, calculated });
        }

        if let Err(source) = self.storage.write(&mut active.handle, &data) {
            log::warn!("ota: write failed, aborting update: {}", source);
            self.release_active(Phase::Idle);
            return Err(HandlerError::storage(StorageStep::Write, source));
        }

        active.progress.bytes_written += len;
        log::debug!(
            "ota: chunk written={} total={} remaining={}",
            len,
            active.progress.bytes_written,
            active.progress.remaining()
        );
        Ok(ChunkProgress {
            written: len,
            total_written: active.progress.bytes_written,
            remaining: active.progress.remaining(),
        })
    }

    /// Validate the image and make it the boot target.
    pub fn end(&mut self) -> Result<PartitionId, HandlerError> {
        let Phase::Active(active) = &mut self.phase else {
            return Err(HandlerError::SessionInactive);
        };
        let UpdateProgress { partition, expected_total_bytes, bytes_written } = active.progress;
        if bytes_written < expected_total_bytes {
            return Err(HandlerError::Incomplete {
                written: bytes_written,
                expected: expected_total_bytes,
            });
        }

        if let Err(source) = self.storage.end(&mut active.handle) {
            log::warn!("ota: end failed on {}: {}", partition, source);
            self.release_active(Phase::Error);
            return Err(HandlerError::storage(StorageStep::End, source));
        }
        self.release_active(Phase::Error);
        if let Err(source) = self.storage.set_boot_partition(partition) {
            log::warn!("ota: set boot partition {} failed: {}", partition, source);
            return Err(HandlerError::storage(StorageStep::SetBootPartition, source));
        }

        self.phase = Phase::Idle;
        log::info!("ota: complete partition={} size={}", partition, bytes_written);
        Ok(partition)
    }

    /// Drop an in-flight update. Returns `true` if one was active.
    pub fn abort(&mut self) -> bool {
        if !matches!(self.phase, Phase::Active(_)) {
            return false;
        }
        if let Some(progress) = self.progress() {
            log::info!(
                "ota: aborting update partition={} written={}/{}",
                progress.partition,
                progress.bytes_written,
                progress.expected_total_bytes
            );
        }
        self.release_active(Phase::Idle);
        true
    }

    fn release_active(&mut self, next: Phase<S::Handle>) {
        if let Phase::Active(active) = std::mem::replace(&mut self.phase, next) {
            self.storage.release(active.handle);
        }
    }

    pub fn rpc_begin(&mut self, args: &Arguments) -> Result<Reply, HandlerError> {
        let size = args
            .u64("size")
            .filter(|size| *size > 0)
            .ok_or_else(|| HandlerError::invalid_field("size"))?;
        let partition = self.begin(size)?;
        Ok(Reply::new()
            .with("status", "OTA begin successful")
            .with("partition", partition.label())
            .with("size", size))
    }

    pub fn rpc_chunk(&mut self, args: &Arguments) -> Result<Reply, HandlerError> {
        let chunk = args.str("chunk").ok_or_else(|| HandlerError::invalid_field("chunk"))?;
        let checksum =
            args.u64("checksum").ok_or_else(|| HandlerError::invalid_field("checksum"))?;
        let progress = self.write_chunk(chunk, checksum)?;
        Ok(Reply::new()
            .with("written", progress.written)
            .with("total_written", progress.total_written)
            .with("remaining", progress.remaining))
    }

    pub fn rpc_end(&mut self, _args: &Arguments) -> Result<Reply, HandlerError> {
        let partition = self.end()?;
        Ok(Reply::new().with("status", "OTA complete").with("partition", partition.label()))
    }
}

impl<S: FlashStorage> Drop for UpdateSession<S> {
    fn drop(&mut self) {
        self.release_active(Phase::Idle);
    }
}

impl<S: FlashStorage + std::fmt::Debug> std::fmt::Debug for UpdateSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSession")
            .field("state", &self.state())
            .field("progress", &self.progress())
            .field("storage", &self.storage)
            .finish()
    }
}
