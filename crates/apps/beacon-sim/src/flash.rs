//! Partition table backed by a directory on the host.
//!
//! Each slot is `ota_<n>.bin`. Images are streamed into `ota_<n>.bin.part` and
//! only renamed into place once finalized, so an interrupted update never
//! leaves a bootable-looking file behind. The running and boot selectors live
//! in `partitions.json`.

use beacon_link::storage::codes;
use beacon_link::{FlashStorage, PartitionId, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::FlashLayout;

const STATE_FILE: &str = "partitions.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlashState {
    running: u8,
    boot: u8,
    validated: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStatus {
    pub label: String,
    pub image_bytes: Option<u64>,
    pub validated: bool,
    pub running: bool,
    pub boot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashStatus {
    pub running: String,
    pub boot: String,
    pub partitions: Vec<PartitionStatus>,
}

#[derive(Debug)]
pub struct FileFlash {
    dir: PathBuf,
    capacity: u64,
    state: FlashState,
}

#[derive(Debug)]
pub struct FileHandle {
    partition: PartitionId,
    file: File,
    declared: u64,
    written: u64,
}

fn io_fault(err: io::Error) -> StorageError {
    StorageError::new(codes::FAIL, err.to_string())
}

impl FileFlash {
    /// Open (or initialise) the partition directory.
    pub fn open<P: AsRef<Path>>(dir: P, layout: &FlashLayout) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let slots = usize::from(layout.partitions);
        let state_path = dir.join(STATE_FILE);
        let mut state = if state_path.exists() {
            let raw = fs::read(&state_path)?;
            serde_json::from_slice::<FlashState>(&raw)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
        } else {
            FlashState { running: 0, boot: 0, validated: Vec::new() }
        };
        state.validated.resize(slots, false);
        if usize::from(state.running) >= slots || usize::from(state.boot) >= slots {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{STATE_FILE} references a partition outside the {slots}-slot layout"),
            ));
        }
        let flash = Self { dir, capacity: layout.partition_capacity, state };
        flash.persist()?;
        Ok(flash)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn image_path(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!("{partition}.bin"))
    }

    fn staging_path(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!("{partition}.bin.part"))
    }

    pub fn read_image(&self, partition: PartitionId) -> io::Result<Vec<u8>> {
        fs::read(self.image_path(partition))
    }

    pub fn boot_partition(&self) -> PartitionId {
        PartitionId(self.state.boot)
    }

    pub fn running_partition(&self) -> PartitionId {
        PartitionId(self.state.running)
    }

    /// Restart into the committed boot partition.
    pub fn reboot(&mut self) -> io::Result<()> {
        self.state.running = self.state.boot;
        self.persist()
    }

    pub fn status(&self) -> FlashStatus {
        let partitions = (0..self.state.validated.len())
            .filter_map(|index| u8::try_from(index).ok())
            .map(|index| {
                let partition = PartitionId(index);
                PartitionStatus {
                    label: partition.label(),
                    image_bytes: fs::metadata(self.image_path(partition)).ok().map(|meta| meta.len()),
                    validated: self.state.validated[usize::from(index)],
                    running: index == self.state.running,
                    boot: index == self.state.boot,
                }
            })
            .collect();
        FlashStatus {
            running: self.running_partition().label(),
            boot: self.boot_partition().label(),
            partitions,
        }
    }

    fn persist(&self) -> io::Result<()> {
        let raw = serde_json::to_vec_pretty(&self.state)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, raw)?;
        fs::rename(tmp, self.dir.join(STATE_FILE))
    }

    fn slot(&self, partition: PartitionId) -> Result<usize, StorageError> {
        let index = usize::from(partition.0);
        if index < self.state.validated.len() {
            Ok(index)
        } else {
            Err(StorageError::new(codes::INVALID_ARG, format!("no slot {partition}")))
        }
    }
}

impl FlashStorage for FileFlash {
    type Handle = FileHandle;

    fn next_update_partition(&mut self) -> Option<PartitionId> {
        let count = u8::try_from(self.state.validated.len()).ok()?;
        if count < 2 {
            return None;
        }
        Some(PartitionId((self.state.running + 1) % count))
    }

    fn begin(&mut self, partition: PartitionId, image_size: u64) -> Result<FileHandle, StorageError> {
        let index = self.slot(partition)?;
        if partition == self.running_partition() {
            return Err(StorageError::new(codes::INVALID_ARG, "cannot write running partition"));
        }
        if image_size > self.capacity {
            return Err(StorageError::new(
                codes::INVALID_SIZE,
                format!("image of {image_size} bytes exceeds slot capacity {}", self.capacity),
            ));
        }
        self.state.validated[index] = false;
        if self.state.boot == partition.0 {
            self.state.boot = self.state.running;
        }
        self.persist().map_err(io_fault)?;
        match fs::remove_file(self.image_path(partition)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_fault(err)),
        }
        let file = File::create(self.staging_path(partition)).map_err(io_fault)?;
        log::debug!("sim: erased {} for {} byte image", partition, image_size);
        Ok(FileHandle { partition, file, declared: image_size, written: 0 })
    }

    fn write(&mut self, handle: &mut FileHandle, data: &[u8]) -> Result<(), StorageError> {
        if handle.written + data.len() as u64 > self.capacity {
            return Err(StorageError::new(codes::INVALID_SIZE, "write past end of partition"));
        }
        handle.file.write_all(data).map_err(io_fault)?;
        handle.written += data.len() as u64;
        Ok(())
    }

    fn end(&mut self, handle: &mut FileHandle) -> Result<(), StorageError> {
        if handle.written == 0 || handle.written < handle.declared {
            return Err(StorageError::new(codes::VALIDATE_FAILED, "image incomplete"));
        }
        handle.file.sync_all().map_err(io_fault)?;
        let index = self.slot(handle.partition)?;
        fs::rename(self.staging_path(handle.partition), self.image_path(handle.partition))
            .map_err(io_fault)?;
        self.state.validated[index] = true;
        self.persist().map_err(io_fault)
    }

    fn release(&mut self, handle: FileHandle) {
        let staging = self.staging_path(handle.partition);
        drop(handle);
        match fs::remove_file(&staging) {
            Ok(()) => log::info!("sim: discarded unfinished image {}", staging.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("sim: failed to discard {}: {}", staging.display(), err),
        }
    }

    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), StorageError> {
        let index = self.slot(partition)?;
        if !self.state.validated[index] {
            return Err(StorageError::new(codes::INVALID_STATE, "partition holds no valid image"));
        }
        self.state.boot = partition.0;
        self.persist().map_err(io_fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FlashLayout {
        FlashLayout { partitions: 2, partition_capacity: 64 }
    }

    #[test]
    fn committed_image_survives_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut flash = FileFlash::open(dir.path(), &layout()).expect("open");
        let partition = flash.next_update_partition().expect("spare slot");
        let mut handle = flash.begin(partition, 4).expect("begin");
        flash.write(&mut handle, &[1, 2]).expect("write");
        flash.write(&mut handle, &[3, 4]).expect("write");
        flash.end(&mut handle).expect("end");
        flash.release(handle);
        flash.set_boot_partition(partition).expect("boot");

        let mut reopened = FileFlash::open(dir.path(), &layout()).expect("reopen");
        assert_eq!(reopened.boot_partition(), PartitionId(1));
        assert_eq!(reopened.read_image(PartitionId(1)).expect("image"), vec![1, 2, 3, 4]);
        reopened.reboot().expect("reboot");
        assert_eq!(reopened.running_partition(), PartitionId(1));
        assert_eq!(reopened.next_update_partition(), Some(PartitionId(0)));
    }

    #[test]
    fn released_partial_image_is_discarded() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut flash = FileFlash::open(dir.path(), &layout()).expect("open");
        let mut handle = flash.begin(PartitionId(1), 8).expect("begin");
        flash.write(&mut handle, &[9; 3]).expect("write");
        assert_eq!(
            flash.end(&mut handle).expect_err("short").code,
            codes::VALIDATE_FAILED
        );
        flash.release(handle);

        let status = flash.status();
        assert!(!status.partitions[1].validated);
        assert_eq!(status.partitions[1].image_bytes, None);
        assert!(!flash.staging_path(PartitionId(1)).exists());
        assert_eq!(
            flash.set_boot_partition(PartitionId(1)).expect_err("unvalidated").code,
            codes::INVALID_STATE
        );
    }

    #[test]
    fn running_partition_cannot_be_overwritten() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut flash = FileFlash::open(dir.path(), &layout()).expect("open");
        let err = flash.begin(PartitionId(0), 4).expect_err("running");
        assert_eq!(err.code, codes::INVALID_ARG);
        let err = flash.begin(PartitionId(1), 65).expect_err("capacity");
        assert_eq!(err.code, codes::INVALID_SIZE);
    }

    #[test]
    fn corrupt_state_file_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join(STATE_FILE), b"not json").expect("write");
        let err = FileFlash::open(dir.path(), &layout()).expect_err("corrupt");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
