// Append-only block log.
// Each record is `u32 length || signed block bytes || 8-byte checksum`, where the checksum
// is the first 8 bytes of doubleSHA256 over the block bytes. Records are never rewritten;
// readers locate them by byte offset through the height index.

use crate::core::SignedBlock;
use crate::error::{BlockchainError, Result};
use crate::utils::{double_sha256, Decode, Encode};
use log::{error, info};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const CHECKSUM_LEN: usize = 8;
const LEN_PREFIX: usize = 4;

pub struct ChainStore {
    file: File,
    path: PathBuf,
    // Offset the next record will be written at
    end: u64,
}

fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = double_sha256(bytes);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

impl ChainStore {
    pub fn open(path: &Path) -> Result<ChainStore> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                BlockchainError::Io(format!("Failed to open block log {}: {e}", path.display()))
            })?;
        let end = file.metadata()?.len();
        info!("Opened block log {} ({end} bytes)", path.display());
        Ok(ChainStore {
            file,
            path: path.to_path_buf(),
            end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Appends one record and returns the offset it was written at
    pub fn append(&mut self, block: &SignedBlock) -> Result<u64> {
        let bytes = block.to_bytes();
        let len = u32::try_from(bytes.len()).map_err(|_| {
            BlockchainError::Serialization(format!(
                "block {} too large for the log",
                block.get_height()
            ))
        })?;

        let mut record = Vec::with_capacity(LEN_PREFIX + bytes.len() + CHECKSUM_LEN);
        record.extend_from_slice(&len.to_be_bytes());
        record.extend_from_slice(&bytes);
        record.extend_from_slice(&checksum(&bytes));

        let offset = self.end;
        self.file.write_all(&record)?;
        self.file.flush()?;
        self.end += record.len() as u64;
        Ok(offset)
    }

    /// Forces appended records to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads the record at `offset`; a checksum mismatch is `CorruptStore`
    pub fn read(&mut self, offset: u64) -> Result<SignedBlock> {
        if offset + (LEN_PREFIX as u64) > self.end {
            return Err(BlockchainError::CorruptStore(format!(
                "offset {offset} is past the end of the log ({} bytes)",
                self.end
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; LEN_PREFIX];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as u64;
        if offset + LEN_PREFIX as u64 + len + CHECKSUM_LEN as u64 > self.end {
            return Err(BlockchainError::CorruptStore(format!(
                "record at offset {offset} overruns the log"
            )));
        }

        let mut bytes = vec![0u8; len as usize];
        self.file.read_exact(&mut bytes)?;
        let mut stored = [0u8; CHECKSUM_LEN];
        self.file.read_exact(&mut stored)?;

        if checksum(&bytes) != stored {
            error!("Checksum mismatch for block record at offset {offset}");
            return Err(BlockchainError::CorruptStore(format!(
                "checksum mismatch at offset {offset}"
            )));
        }
        SignedBlock::from_bytes(&bytes)
            .map_err(|e| BlockchainError::CorruptStore(format!("record at offset {offset}: {e}")))
    }
}
