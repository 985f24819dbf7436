//! File-backed storage medium — one checksummed container per block
//!
//! Each block lives in its own container file so a level clear is a file
//! delete and nothing shares fate across blocks. Every container carries a
//! CRC32C page table over its data region for silent-corruption detection
//! (bit rot on flash is a real failure mode in deployed cabinets).
//!
//! Container layout:
//!
//! ```text
//! [0..4]   magic:     "NVLT"
//! [4..6]   version:   u16 LE
//! [6..8]   page size: u16 LE
//! [8..12]  meta_len:  u32 LE
//! [12..16] meta_crc:  u32 LE   - CRC32C of the meta region
//! [16..20] data_len:  u32 LE   - logical data length
//! [20..24] data_cap:  u32 LE   - allocated data length (>= data_len)
//! [24..32] reserved
//! [32..]   meta, then one u32 CRC32C per page of capacity, then data
//! ```
//!
//! Writes land in place and refresh the covering page checksums. Anything
//! that reshapes a container — creation, growth past capacity, a meta of a
//! new length, defragmentation — goes through a temp file, durable sync,
//! atomic rename and directory sync, so a crash leaves either the old
//! container or the new one, never a torn hybrid. Shrinks only lower the
//! logical length; `defragment` reclaims the slack.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use nvault_core::error::{NvError, NvResult};
use nvault_core::medium::StorageMedium;

use crate::sync::durable_sync;

/// Magic bytes identifying NVault containers: "NVLT" in ASCII
const MAGIC: [u8; 4] = [0x4E, 0x56, 0x4C, 0x54];

/// Container format version
const CONTAINER_VERSION: u16 = 1;

/// Checksum granularity over the data region
const PAGE_SIZE: usize = 512;

/// Header size in bytes
const HEADER_LEN: usize = 32;

/// Container file extension
const EXTENSION: &str = "nvb";

/// Fixed-size container header.
#[derive(Debug, Clone, Copy)]
struct ContainerHeader {
    meta_len: u32,
    meta_crc: u32,
    data_len: u32,
    data_cap: u32,
}

impl ContainerHeader {
    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&CONTAINER_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(PAGE_SIZE as u16).to_le_bytes());
        buf[8..12].copy_from_slice(&self.meta_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.meta_crc.to_le_bytes());
        buf[16..20].copy_from_slice(&self.data_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.data_cap.to_le_bytes());
        // bytes 24..32 are reserved, already zero
        buf
    }

    fn from_bytes(path: &Path, buf: &[u8; HEADER_LEN]) -> NvResult<Self> {
        if buf[0..4] != MAGIC {
            return Err(NvError::CorruptContainer {
                path: path.to_path_buf(),
                offset: 0,
                reason: format!(
                    "bad magic {:02x}{:02x}{:02x}{:02x}",
                    buf[0], buf[1], buf[2], buf[3]
                ),
            });
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != CONTAINER_VERSION {
            return Err(NvError::CorruptContainer {
                path: path.to_path_buf(),
                offset: 4,
                reason: format!("unsupported container version {}", version),
            });
        }

        let page_size = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        if page_size != PAGE_SIZE {
            return Err(NvError::CorruptContainer {
                path: path.to_path_buf(),
                offset: 6,
                reason: format!("unexpected page size {}", page_size),
            });
        }

        let header = Self {
            meta_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            meta_crc: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            data_len: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            data_cap: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        };

        if header.data_len > header.data_cap {
            return Err(NvError::CorruptContainer {
                path: path.to_path_buf(),
                offset: 16,
                reason: format!(
                    "data length {} exceeds capacity {}",
                    header.data_len, header.data_cap
                ),
            });
        }

        Ok(header)
    }

    fn page_count(&self) -> usize {
        (self.data_cap as usize).div_ceil(PAGE_SIZE)
    }

    fn table_off(&self) -> u64 {
        (HEADER_LEN + self.meta_len as usize) as u64
    }

    fn data_off(&self) -> u64 {
        self.table_off() + (4 * self.page_count()) as u64
    }

    fn expected_file_len(&self) -> u64 {
        self.data_off() + self.data_cap as u64
    }
}

/// Checksummed per-block container files in one directory.
pub struct FileMedium {
    dir: PathBuf,
}

impl FileMedium {
    /// Open (creating if needed) a container directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> NvResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e, "failed to create container directory"))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn container_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", escape_name(name), EXTENSION))
    }

    /// Open an existing container and validate its header.
    fn open_container(&self, name: &str) -> NvResult<(File, ContainerHeader, PathBuf)> {
        let path = self.container_path(name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    NvError::BlockNotFound {
                        name: name.to_string(),
                    }
                } else {
                    io_error(&path, &e, "failed to open container")
                }
            })?;

        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .map_err(|e| io_error(&path, &e, "failed to read container header"))?;
        let header = ContainerHeader::from_bytes(&path, &buf)?;

        let file_len = file
            .metadata()
            .map_err(|e| io_error(&path, &e, "failed to stat container"))?
            .len();
        if file_len < header.expected_file_len() {
            return Err(NvError::CorruptContainer {
                path,
                offset: file_len,
                reason: format!(
                    "container truncated: {} bytes, need {}",
                    file_len,
                    header.expected_file_len()
                ),
            });
        }

        Ok((file, header, path))
    }

    /// Write a complete container image through a temp file and atomic
    /// rename, so a crash mid-rewrite never exposes a torn container.
    fn write_full_container(
        &self,
        path: &Path,
        header: &ContainerHeader,
        meta: &[u8],
        table: &[u32],
        data: &[u8],
    ) -> NvResult<()> {
        let tmp_path = path.with_extension(format!("{}.tmp", EXTENSION));

        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| io_error(&tmp_path, &e, "failed to create temp container"))?;

            let mut image =
                Vec::with_capacity(HEADER_LEN + meta.len() + 4 * table.len() + data.len());
            image.extend_from_slice(&header.to_bytes());
            image.extend_from_slice(meta);
            for crc in table {
                image.extend_from_slice(&crc.to_le_bytes());
            }
            image.extend_from_slice(data);

            tmp.write_all(&image)
                .map_err(|e| io_error(&tmp_path, &e, "failed to write temp container"))?;
            durable_sync(&tmp).map_err(|e| io_error(&tmp_path, &e, "failed to sync temp container"))?;
        }

        fs::rename(&tmp_path, path)
            .map_err(|e| io_error(path, &e, "failed to rename temp container into place"))?;
        self.sync_dir()?;
        Ok(())
    }

    fn sync_dir(&self) -> NvResult<()> {
        let dir = File::open(&self.dir)
            .map_err(|e| io_error(&self.dir, &e, "failed to open directory for sync"))?;
        durable_sync(&dir).map_err(|e| io_error(&self.dir, &e, "failed to sync directory"))
    }

    /// Recompute the checksum table entries covering `pages`, reading page
    /// contents back from the file.
    fn refresh_page_crcs(
        &self,
        file: &mut File,
        header: &ContainerHeader,
        path: &Path,
        pages: std::ops::RangeInclusive<usize>,
    ) -> NvResult<()> {
        for page in pages {
            let page_start = page * PAGE_SIZE;
            let extent = PAGE_SIZE.min(header.data_cap as usize - page_start);

            let mut page_bytes = vec![0u8; extent];
            file.seek(SeekFrom::Start(header.data_off() + page_start as u64))
                .map_err(|e| io_error(path, &e, "failed to seek page"))?;
            file.read_exact(&mut page_bytes)
                .map_err(|e| io_error(path, &e, "failed to read page back"))?;

            let crc = crc32c::crc32c(&page_bytes);
            file.seek(SeekFrom::Start(header.table_off() + (4 * page) as u64))
                .map_err(|e| io_error(path, &e, "failed to seek checksum table"))?;
            file.write_all(&crc.to_le_bytes())
                .map_err(|e| io_error(path, &e, "failed to update checksum table"))?;
        }
        Ok(())
    }

    /// Read the whole data region up to the logical length.
    fn read_data(&self, file: &mut File, header: &ContainerHeader, path: &Path) -> NvResult<Vec<u8>> {
        let mut data = vec![0u8; header.data_len as usize];
        file.seek(SeekFrom::Start(header.data_off()))
            .map_err(|e| io_error(path, &e, "failed to seek data region"))?;
        file.read_exact(&mut data)
            .map_err(|e| io_error(path, &e, "failed to read data region"))?;
        Ok(data)
    }

    fn read_meta_region(
        &self,
        file: &mut File,
        header: &ContainerHeader,
        path: &Path,
    ) -> NvResult<Vec<u8>> {
        let mut meta = vec![0u8; header.meta_len as usize];
        file.seek(SeekFrom::Start(HEADER_LEN as u64))
            .map_err(|e| io_error(path, &e, "failed to seek meta region"))?;
        file.read_exact(&mut meta)
            .map_err(|e| io_error(path, &e, "failed to read meta region"))?;
        Ok(meta)
    }

    /// Verify one container. Quick mode checks structure and the meta
    /// checksum; full mode additionally re-validates every data page.
    fn verify_container(&self, name: &str, full: bool) -> NvResult<bool> {
        let (mut file, header, path) = match self.open_container(name) {
            Ok(opened) => opened,
            Err(NvError::CorruptContainer { path, offset, reason }) => {
                warn!(container = %path.display(), offset, reason = %reason, "corrupt container header");
                return Ok(false);
            }
            Err(other) => return Err(other),
        };

        let meta = self.read_meta_region(&mut file, &header, &path)?;
        if crc32c::crc32c(&meta) != header.meta_crc {
            warn!(container = %path.display(), "meta checksum mismatch");
            return Ok(false);
        }

        if full {
            for page in 0..header.page_count() {
                let page_start = page * PAGE_SIZE;
                let extent = PAGE_SIZE.min(header.data_cap as usize - page_start);

                let mut page_bytes = vec![0u8; extent];
                file.seek(SeekFrom::Start(header.data_off() + page_start as u64))
                    .map_err(|e| io_error(&path, &e, "failed to seek page"))?;
                file.read_exact(&mut page_bytes)
                    .map_err(|e| io_error(&path, &e, "failed to read page"))?;

                let mut stored = [0u8; 4];
                file.seek(SeekFrom::Start(header.table_off() + (4 * page) as u64))
                    .map_err(|e| io_error(&path, &e, "failed to seek checksum table"))?;
                file.read_exact(&mut stored)
                    .map_err(|e| io_error(&path, &e, "failed to read checksum table"))?;

                if crc32c::crc32c(&page_bytes) != u32::from_le_bytes(stored) {
                    warn!(
                        container = %path.display(),
                        page,
                        "page checksum mismatch"
                    );
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

impl StorageMedium for FileMedium {
    fn create(&self, name: &str, meta: &[u8], len: usize) -> NvResult<()> {
        let path = self.container_path(name);
        if path.exists() {
            return Err(NvError::DuplicateBlock {
                name: name.to_string(),
            });
        }

        let header = ContainerHeader {
            meta_len: meta.len() as u32,
            meta_crc: crc32c::crc32c(meta),
            data_len: len as u32,
            data_cap: len as u32,
        };

        let data = vec![0u8; len];
        let table = zeroed_page_table(&header);
        self.write_full_container(&path, &header, meta, &table, &data)?;

        debug!(block = name, bytes = len, "created container");
        Ok(())
    }

    fn remove(&self, name: &str) -> NvResult<()> {
        let path = self.container_path(name);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NvError::BlockNotFound {
                    name: name.to_string(),
                }
            } else {
                io_error(&path, &e, "failed to remove container")
            }
        })?;
        self.sync_dir()
    }

    fn resize(&self, name: &str, len: usize) -> NvResult<()> {
        let (mut file, mut header, path) = self.open_container(name)?;
        let old_len = header.data_len as usize;
        if len == old_len {
            return Ok(());
        }

        if len <= header.data_cap as usize {
            if len > old_len {
                // Growing into slack left by an earlier shrink: the region
                // may hold stale bytes, and grown elements must read zero
                let zeros = vec![0u8; len - old_len];
                file.seek(SeekFrom::Start(header.data_off() + old_len as u64))
                    .map_err(|e| io_error(&path, &e, "failed to seek grow region"))?;
                file.write_all(&zeros)
                    .map_err(|e| io_error(&path, &e, "failed to zero grow region"))?;
                self.refresh_page_crcs(
                    &mut file,
                    &header,
                    &path,
                    (old_len / PAGE_SIZE)..=((len - 1) / PAGE_SIZE),
                )?;
            }

            header.data_len = len as u32;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| io_error(&path, &e, "failed to seek header"))?;
            file.write_all(&header.to_bytes())
                .map_err(|e| io_error(&path, &e, "failed to rewrite header"))?;
            durable_sync(&file).map_err(|e| io_error(&path, &e, "failed to sync after resize"))?;
            return Ok(());
        }

        // Growth past capacity reshapes the container
        let meta = self.read_meta_region(&mut file, &header, &path)?;
        let mut data = self.read_data(&mut file, &header, &path)?;
        data.resize(len, 0);
        drop(file);

        let new_header = ContainerHeader {
            meta_len: header.meta_len,
            meta_crc: header.meta_crc,
            data_len: len as u32,
            data_cap: len as u32,
        };
        let table = build_page_table(&new_header, &data);
        self.write_full_container(&path, &new_header, &meta, &table, &data)
    }

    fn read(&self, name: &str, offset: usize, len: usize) -> NvResult<Vec<u8>> {
        let (mut file, header, path) = self.open_container(name)?;
        check_bounds(name, &header, offset, len)?;

        let mut bytes = vec![0u8; len];
        file.seek(SeekFrom::Start(header.data_off() + offset as u64))
            .map_err(|e| io_error(&path, &e, "failed to seek data"))?;
        file.read_exact(&mut bytes)
            .map_err(|e| io_error(&path, &e, "failed to read data"))?;
        Ok(bytes)
    }

    fn write(&self, name: &str, offset: usize, bytes: &[u8]) -> NvResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let (mut file, header, path) = self.open_container(name)?;
        check_bounds(name, &header, offset, bytes.len())?;

        file.seek(SeekFrom::Start(header.data_off() + offset as u64))
            .map_err(|e| io_error(&path, &e, "failed to seek data"))?;
        file.write_all(bytes)
            .map_err(|e| io_error(&path, &e, "failed to write data"))?;

        self.refresh_page_crcs(
            &mut file,
            &header,
            &path,
            (offset / PAGE_SIZE)..=((offset + bytes.len() - 1) / PAGE_SIZE),
        )
    }

    fn flush(&self, name: &str) -> NvResult<()> {
        let (file, _, path) = self.open_container(name)?;
        durable_sync(&file).map_err(|e| io_error(&path, &e, "failed to sync container"))
    }

    fn read_meta(&self, name: &str) -> NvResult<Vec<u8>> {
        let (mut file, header, path) = self.open_container(name)?;
        self.read_meta_region(&mut file, &header, &path)
    }

    fn write_meta(&self, name: &str, meta: &[u8]) -> NvResult<()> {
        let (mut file, mut header, path) = self.open_container(name)?;

        if meta.len() == header.meta_len as usize {
            // Same length: update in place
            file.seek(SeekFrom::Start(HEADER_LEN as u64))
                .map_err(|e| io_error(&path, &e, "failed to seek meta region"))?;
            file.write_all(meta)
                .map_err(|e| io_error(&path, &e, "failed to write meta"))?;

            header.meta_crc = crc32c::crc32c(meta);
            file.seek(SeekFrom::Start(0))
                .map_err(|e| io_error(&path, &e, "failed to seek header"))?;
            file.write_all(&header.to_bytes())
                .map_err(|e| io_error(&path, &e, "failed to rewrite header"))?;
            return durable_sync(&file).map_err(|e| io_error(&path, &e, "failed to sync meta"));
        }

        // New length shifts every region: rewrite the container
        let data = {
            let mut data = vec![0u8; header.data_cap as usize];
            file.seek(SeekFrom::Start(header.data_off()))
                .map_err(|e| io_error(&path, &e, "failed to seek data region"))?;
            file.read_exact(&mut data)
                .map_err(|e| io_error(&path, &e, "failed to read data region"))?;
            data
        };
        drop(file);

        let new_header = ContainerHeader {
            meta_len: meta.len() as u32,
            meta_crc: crc32c::crc32c(meta),
            data_len: header.data_len,
            data_cap: header.data_cap,
        };
        let table = build_page_table(&new_header, &data);
        self.write_full_container(&path, &new_header, meta, &table, &data)
    }

    fn list(&self) -> NvResult<Vec<String>> {
        let mut names = Vec::new();

        let entries = fs::read_dir(&self.dir)
            .map_err(|e| io_error(&self.dir, &e, "failed to read container directory"))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, &e, "failed to read directory entry"))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match unescape_name(stem) {
                Some(name) => names.push(name),
                None => warn!(file = %path.display(), "skipping container with undecodable name"),
            }
        }

        Ok(names)
    }

    fn verify(&self, full: bool) -> NvResult<bool> {
        let mut ok = true;
        for name in self.list()? {
            if !self.verify_container(&name, full)? {
                ok = false;
            }
        }
        Ok(ok)
    }

    fn defragment(&self) -> NvResult<()> {
        // Crash leftovers from interrupted rewrites are dead weight
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| io_error(&self.dir, &e, "failed to read container directory"))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                debug!(file = %path.display(), "removing orphaned temp container");
                let _ = fs::remove_file(&path);
            }
        }

        // Compact containers carrying shrink slack
        for name in self.list()? {
            let (mut file, header, path) = self.open_container(&name)?;
            if header.data_cap == header.data_len {
                continue;
            }

            let meta = self.read_meta_region(&mut file, &header, &path)?;
            let data = self.read_data(&mut file, &header, &path)?;
            drop(file);

            let new_header = ContainerHeader {
                meta_len: header.meta_len,
                meta_crc: header.meta_crc,
                data_len: header.data_len,
                data_cap: header.data_len,
            };
            let table = build_page_table(&new_header, &data);
            self.write_full_container(&path, &new_header, &meta, &table, &data)?;

            debug!(
                block = %name,
                reclaimed = (header.data_cap - header.data_len),
                "compacted container"
            );
        }

        Ok(())
    }
}

fn check_bounds(name: &str, header: &ContainerHeader, offset: usize, len: usize) -> NvResult<()> {
    let end = offset.checked_add(len);
    match end {
        Some(end) if end <= header.data_len as usize => Ok(()),
        _ => Err(NvError::OutOfBounds {
            block: name.to_string(),
            offset,
            len,
            data_len: header.data_len as usize,
        }),
    }
}

/// Page table for a freshly zeroed data region.
fn zeroed_page_table(header: &ContainerHeader) -> Vec<u32> {
    let zeros = [0u8; PAGE_SIZE];
    let mut table = Vec::with_capacity(header.page_count());
    for page in 0..header.page_count() {
        let page_start = page * PAGE_SIZE;
        let extent = PAGE_SIZE.min(header.data_cap as usize - page_start);
        table.push(crc32c::crc32c(&zeros[..extent]));
    }
    table
}

/// Page table over an in-memory data image sized to the header's capacity.
fn build_page_table(header: &ContainerHeader, data: &[u8]) -> Vec<u32> {
    debug_assert_eq!(data.len(), header.data_cap as usize);
    let mut table = Vec::with_capacity(header.page_count());
    for page in 0..header.page_count() {
        let page_start = page * PAGE_SIZE;
        let extent = PAGE_SIZE.min(data.len() - page_start);
        table.push(crc32c::crc32c(&data[page_start..page_start + extent]));
    }
    table
}

/// Map a block name to a filesystem-safe stem. Alphanumerics, '_' and '-'
/// pass through; every other byte becomes %XX.
fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn unescape_name(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut chars = stem.bytes();
    while let Some(byte) = chars.next() {
        if byte == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok()
}

fn io_error(path: &Path, err: &std::io::Error, what: &str) -> NvError {
    NvError::Io {
        path: Some(path.to_path_buf()),
        kind: err.kind(),
        message: format!("{}: {}", what, err),
    }
}
