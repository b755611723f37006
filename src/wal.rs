//! SHARDLINE - Append-Only Record File
//! CRC-framed append log used by the file engine (per-partition write log)
//! and by the local broker (durable topics).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, ShardError};

/// Bytes of framing around each payload: length prefix plus CRC.
const FRAME_OVERHEAD: usize = 8;

/// Append-only file of checksummed frames.
///
/// ## Binary Format (per frame)
/// ```text
/// [payload_len: 4 bytes (LE)][payload: N bytes][crc: 4 bytes (LE)]
/// ```
/// The CRC covers the length prefix and the payload.
pub struct WriteAheadLog {
    /// Path to the log file on disk.
    path: PathBuf,
    /// File handle opened for appending.
    file: File,
    /// fsync after every append.
    sync_writes: bool,
    /// Length of the file up to the last fully written frame.
    committed: u64,
    /// A failed append left bytes past `committed` that could not be cut off yet.
    needs_repair: bool,
}

impl WriteAheadLog {
    /// Open or create a log, returning it together with every intact frame already on disk.
    ///
    /// A torn frame at the tail (a crash mid-append) is cut off so later appends
    /// start on a clean boundary. A bad frame followed by more data is corruption.
    pub fn open(path: PathBuf, sync_writes: bool) -> Result<(Self, Vec<Vec<u8>>)> {
        let (frames, valid_len) = Self::recover(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            log::warn!(
                "truncating torn tail of {:?} ({} -> {} bytes)",
                path,
                on_disk,
                valid_len
            );
            file.set_len(valid_len)?;
        }

        Ok((
            Self {
                path,
                file,
                sync_writes,
                committed: valid_len,
                needs_repair: false,
            },
            frames,
        ))
    }

    /// Returns the path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of intact frames in the file.
    pub fn committed_len(&self) -> u64 {
        self.committed
    }

    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Append one frame.
    ///
    /// A failed append cuts the file back to the last intact frame, so a retry
    /// never lands behind a half-written one.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        if self.needs_repair {
            self.file.set_len(self.committed)?;
            self.needs_repair = false;
        }

        let encoded = Self::encode(payload);
        let written = self.file.write_all(&encoded).and_then(|()| {
            if self.sync_writes {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });

        match written {
            Ok(()) => {
                self.committed += encoded.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(cut) = self.file.set_len(self.committed) {
                    log::error!(
                        "cannot cut {:?} back to {} bytes after failed append: {}",
                        self.path,
                        self.committed,
                        cut
                    );
                    self.needs_repair = true;
                }
                Err(e.into())
            }
        }
    }

    fn recover(path: &Path) -> Result<(Vec<Vec<u8>>, u64)> {
        let mut buf = Vec::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_end(&mut buf)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        }

        let mut frames = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            let remaining = buf.len() - offset;
            if remaining < FRAME_OVERHEAD {
                break;
            }
            let len_bytes: [u8; 4] = [
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ];
            let len = u32::from_le_bytes(len_bytes) as usize;
            if remaining < len + FRAME_OVERHEAD {
                break;
            }

            let body_end = offset + 4 + len;
            let stored_crc = u32::from_le_bytes([
                buf[body_end],
                buf[body_end + 1],
                buf[body_end + 2],
                buf[body_end + 3],
            ]);
            if crc32fast::hash(&buf[offset..body_end]) != stored_crc {
                if body_end + 4 == buf.len() {
                    break;
                }
                return Err(ShardError::Corruption(format!(
                    "CRC mismatch in {:?} at offset {}",
                    path, offset
                )));
            }

            frames.push(buf[offset + 4..body_end].to_vec());
            offset = body_end + 4;
        }

        Ok((frames, offset as u64))
    }
}
