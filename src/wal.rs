//! Write-ahead log.
//!
//! Mini-transactions append one frame per modified page followed by a commit
//! frame; replay applies only frame groups whose commit made it to disk, so a
//! torn mini-transaction is invisible after recovery. The change buffer owns
//! one dedicated redo kind, [`WalRecord::BitmapInit`], which re-initializes a
//! bitmap page's bit area instead of carrying a full image.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use rustc_hash::FxHashMap;

use crate::page::PAGE_SIZE;
use crate::types::{Error, PageKey, PageNo, Result, SpaceId};

const WAL_MAGIC: &[u8; 8] = b"AMBRWAL\0";
const WAL_VERSION: u16 = 1;
pub(crate) const WAL_HEADER_SIZE: usize = 16;
const FRAME_HEADER_SIZE: usize = 32;

const FRAME_FLAG_COMMIT: u32 = 0x1;
const FRAME_FLAG_BITMAP_INIT: u32 = 0x2;

/// A single replayable redo record.
#[derive(Debug)]
pub enum WalRecord {
    /// Full after-image of one page.
    Page { key: PageKey, data: Vec<u8> },
    /// Re-initialize the bit area of a bitmap page.
    BitmapInit { key: PageKey },
}

#[derive(Debug)]
pub struct Wal {
    file: File,
    next_frame_number: u32,
    path: PathBuf,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut wal = Self {
            file,
            next_frame_number: 1,
            path,
        };

        let len = wal.file.metadata()?.len();
        if len == 0 {
            wal.write_header()?;
        } else {
            wal.validate_header()?;
        }
        Ok(wal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_page_frame(&mut self, key: PageKey, mtr_id: u64, image: &[u8]) -> Result<()> {
        if image.len() != PAGE_SIZE {
            return Err(Error::Invalid("WAL frame size does not match page size"));
        }
        self.append_frame(key, mtr_id, 0, image)
    }

    pub fn append_bitmap_init_frame(&mut self, key: PageKey, mtr_id: u64) -> Result<()> {
        let zeros = vec![0u8; PAGE_SIZE];
        self.append_frame(key, mtr_id, FRAME_FLAG_BITMAP_INIT, &zeros)
    }

    pub fn append_commit_frame(&mut self, mtr_id: u64) -> Result<()> {
        let zeros = vec![0u8; PAGE_SIZE];
        self.append_frame(PageKey::new(SpaceId(0), PageNo(0)), mtr_id, FRAME_FLAG_COMMIT, &zeros)
    }

    fn append_frame(&mut self, key: PageKey, mtr_id: u64, flags: u32, payload: &[u8]) -> Result<()> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        encode_frame_header(
            &mut header,
            key,
            self.next_frame_number,
            checksum_for(payload),
            mtr_id,
            flags,
        );
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.next_frame_number = self
            .next_frame_number
            .checked_add(1)
            .ok_or(Error::Corruption("WAL frame number overflow"))?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Discards every frame. Called after a checkpoint has made the space
    /// files current.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        self.next_frame_number = 1;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Replays committed frame groups in commit order. Returns the number of
    /// records applied. Groups without a commit frame are dropped silently;
    /// a torn tail frame ends the scan.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u32>
    where
        F: FnMut(WalRecord) -> Result<()>,
    {
        let mut applied = 0u32;
        let mut expected_frame = 1u32;

        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        let mut payload = vec![0u8; PAGE_SIZE];
        let mut pending: FxHashMap<u64, Vec<WalRecord>> = FxHashMap::default();

        loop {
            if !self.read_exact_or_eof(&mut header_buf)? {
                break;
            }
            let frame = decode_frame_header(&header_buf);
            if frame.number != expected_frame {
                return Err(Error::Corruption("WAL frame numbers out of sequence"));
            }
            expected_frame = expected_frame
                .checked_add(1)
                .ok_or(Error::Corruption("WAL frame number overflow"))?;

            if !self.read_exact_or_eof(&mut payload)? {
                // A torn final frame: everything before it is intact.
                break;
            }
            if checksum_for(&payload) != frame.checksum {
                return Err(Error::Corruption("WAL frame checksum mismatch"));
            }

            if frame.flags & FRAME_FLAG_COMMIT != 0 {
                if let Some(records) = pending.remove(&frame.mtr_id) {
                    for record in records {
                        apply(record)?;
                        applied = applied
                            .checked_add(1)
                            .ok_or(Error::Corruption("WAL record count overflow"))?;
                    }
                }
                continue;
            }

            let record = if frame.flags & FRAME_FLAG_BITMAP_INIT != 0 {
                WalRecord::BitmapInit { key: frame.key }
            } else {
                WalRecord::Page {
                    key: frame.key,
                    data: payload.clone(),
                }
            };
            pending.entry(frame.mtr_id).or_default().push(record);
        }

        self.next_frame_number = expected_frame;
        Ok(applied)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[..WAL_MAGIC.len()].copy_from_slice(WAL_MAGIC);
        header[8..10].copy_from_slice(&WAL_VERSION.to_be_bytes());
        header[10..14].copy_from_slice(&(PAGE_SIZE as u32).to_be_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn validate_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;
        if &header[..WAL_MAGIC.len()] != WAL_MAGIC {
            return Err(Error::Corruption("invalid WAL magic"));
        }
        if u16::from_be_bytes([header[8], header[9]]) != WAL_VERSION {
            return Err(Error::Corruption("unsupported WAL version"));
        }
        if u32::from_be_bytes([header[10], header[11], header[12], header[13]]) as usize
            != PAGE_SIZE
        {
            return Err(Error::Corruption("WAL page size differs from build"));
        }
        // Position next_frame_number after the existing frames.
        let len = self.file.metadata()?.len() as usize;
        let frame_len = FRAME_HEADER_SIZE + PAGE_SIZE;
        let complete = len.saturating_sub(WAL_HEADER_SIZE) / frame_len;
        self.next_frame_number = complete as u32 + 1;
        Ok(())
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                return Ok(false);
            }
            read += n;
        }
        Ok(true)
    }
}

struct FrameHeader {
    key: PageKey,
    number: u32,
    checksum: u32,
    mtr_id: u64,
    flags: u32,
}

fn encode_frame_header(
    buf: &mut [u8; FRAME_HEADER_SIZE],
    key: PageKey,
    number: u32,
    checksum: u32,
    mtr_id: u64,
    flags: u32,
) {
    buf[0..4].copy_from_slice(&key.space.0.to_be_bytes());
    buf[4..8].copy_from_slice(&key.page.0.to_be_bytes());
    buf[8..12].copy_from_slice(&number.to_be_bytes());
    buf[12..16].copy_from_slice(&checksum.to_be_bytes());
    buf[16..24].copy_from_slice(&mtr_id.to_be_bytes());
    buf[24..28].copy_from_slice(&flags.to_be_bytes());
}

fn decode_frame_header(buf: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
    FrameHeader {
        key: PageKey::new(
            SpaceId(u32::from_be_bytes(buf[0..4].try_into().unwrap())),
            PageNo(u32::from_be_bytes(buf[4..8].try_into().unwrap())),
        ),
        number: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        checksum: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        mtr_id: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
        flags: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
    }
}

fn checksum_for(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}
