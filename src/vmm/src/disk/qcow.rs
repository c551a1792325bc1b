// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Sparse qcow (v1) image backend.
//!
//! Clusters are located through a two-level table walk: an in-memory copy of
//! the L1 table points at on-disk L2 tables, whose entries hold raw file
//! offsets. Unallocated clusters read as zeros; writes allocate clusters at
//! the end of the file and patch the tables on disk as they go.

use std::cmp;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// "QFI\xfb", big-endian.
const QCOW_MAGIC: u32 = 0x5146_49fb;
const QCOW1_VERSION: u32 = 1;

/// Compressed-cluster flag on an L2 entry.
const QCOW_OFLAG_COMPRESSED: u64 = 1 << 63;

// Header field offsets; all fields are big-endian.
const HEADER_LEN: usize = 48;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported qcow version {0}")]
    Version(u32),
    #[error("qcow backing files not supported")]
    BackingFile,
    #[error("encrypted qcow images not supported")]
    Encrypted,
    #[error("compressed qcow clusters not supported")]
    CompressedCluster,
    #[error("qcow image geometry invalid")]
    Geometry,
    #[error("write beyond end of qcow image")]
    OutOfBounds,
    #[error("qcow i/o failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct QcowState {
    virtual_size: u64,
    cluster_bits: u32,
    l2_bits: u32,
    l1_table_offset: u64,
    l1_table: Vec<u64>,
}

impl QcowState {
    /// Inspect the image header. `Ok(None)` means "not qcow, try the next
    /// probe"; a matching magic with unusable contents is a hard error.
    pub fn probe(file: &mut File) -> Result<Option<QcowState>> {
        let mut header = [0u8; HEADER_LEN];
        match file.read_exact_at(&mut header, 0) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }

        if be_u32(&header[0..4]) != QCOW_MAGIC {
            return Ok(None);
        }

        let version = be_u32(&header[4..8]);
        if version != QCOW1_VERSION {
            return Err(Error::Version(version));
        }
        if be_u64(&header[8..16]) != 0 {
            return Err(Error::BackingFile);
        }
        if be_u32(&header[36..40]) != 0 {
            return Err(Error::Encrypted);
        }

        let virtual_size = be_u64(&header[24..32]);
        let cluster_bits = u32::from(header[32]);
        let l2_bits = u32::from(header[33]);
        let l1_table_offset = be_u64(&header[40..48]);

        if virtual_size == 0
            || cluster_bits < 9
            || cluster_bits > 22
            || l2_bits == 0
            || l2_bits > 16
        {
            return Err(Error::Geometry);
        }

        let span = 1u64 << (cluster_bits + l2_bits);
        let l1_entries = (virtual_size + span - 1) / span;
        if l1_entries > (1 << 20) {
            return Err(Error::Geometry);
        }

        let mut raw = vec![0u8; l1_entries as usize * 8];
        file.read_exact_at(&mut raw, l1_table_offset)?;
        let l1_table = raw.chunks_exact(8).map(be_u64).collect();

        Ok(Some(QcowState {
            virtual_size,
            cluster_bits,
            l2_bits,
            l1_table_offset,
            l1_table,
        }))
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    fn l2_entries(&self) -> u64 {
        1 << self.l2_bits
    }

    fn l1_index(&self, offset: u64) -> usize {
        (offset >> (self.cluster_bits + self.l2_bits)) as usize
    }

    fn l2_index(&self, offset: u64) -> u64 {
        (offset >> self.cluster_bits) & (self.l2_entries() - 1)
    }

    /// Map a virtual byte offset to its file offset, or `None` when the
    /// cluster was never allocated.
    fn lookup(&self, file: &File, offset: u64) -> Result<Option<u64>> {
        let l2_offset = match self.l1_table.get(self.l1_index(offset)) {
            Some(0) | None => return Ok(None),
            Some(off) => *off,
        };

        let entry = read_be_u64_at(file, l2_offset + 8 * self.l2_index(offset))?;
        if entry == 0 {
            return Ok(None);
        }
        if entry & QCOW_OFLAG_COMPRESSED != 0 {
            return Err(Error::CompressedCluster);
        }

        Ok(Some(entry + (offset & (self.cluster_size() - 1))))
    }

    /// Map a virtual byte offset for writing, allocating the L2 table and
    /// the cluster as needed.
    fn ensure_allocated(&mut self, file: &File, offset: u64) -> Result<u64> {
        let l1_index = self.l1_index(offset);
        if l1_index >= self.l1_table.len() {
            return Err(Error::OutOfBounds);
        }

        let mut l2_offset = self.l1_table[l1_index];
        if l2_offset == 0 {
            // Fresh L2 table at end-of-file, zeroed, then hook it into L1 on
            // disk before anything points at it.
            l2_offset = file.metadata()?.len();
            let zeroes = vec![0u8; self.l2_entries() as usize * 8];
            file.write_all_at(&zeroes, l2_offset)?;
            write_be_u64_at(file, self.l1_table_offset + 8 * l1_index as u64, l2_offset)?;
            self.l1_table[l1_index] = l2_offset;
        }

        let l2_slot = l2_offset + 8 * self.l2_index(offset);
        let mut cluster = read_be_u64_at(file, l2_slot)?;
        if cluster & QCOW_OFLAG_COMPRESSED != 0 {
            return Err(Error::CompressedCluster);
        }
        if cluster == 0 {
            cluster = file.metadata()?.len();
            // set_len zero-fills, so a partial write below leaves the rest
            // of the cluster holding zeros.
            file.set_len(cluster + self.cluster_size())?;
            write_be_u64_at(file, l2_slot, cluster)?;
        }

        Ok(cluster + (offset & (self.cluster_size() - 1)))
    }

    fn read_at(&self, file: &File, mut offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            if offset >= self.virtual_size {
                break;
            }
            let in_cluster = offset & (self.cluster_size() - 1);
            let chunk = cmp::min(
                cmp::min(
                    (self.cluster_size() - in_cluster) as usize,
                    buf.len() - done,
                ),
                (self.virtual_size - offset) as usize,
            );

            match self.lookup(file, offset)? {
                Some(file_off) => file.read_exact_at(&mut buf[done..done + chunk], file_off)?,
                None => {
                    for b in &mut buf[done..done + chunk] {
                        *b = 0;
                    }
                }
            }

            done += chunk;
            offset += chunk as u64;
        }
        Ok(done)
    }

    fn write_at(&mut self, file: &File, mut offset: u64, buf: &[u8]) -> Result<usize> {
        if offset + buf.len() as u64 > self.virtual_size {
            return Err(Error::OutOfBounds);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let in_cluster = offset & (self.cluster_size() - 1);
            let chunk = cmp::min(
                (self.cluster_size() - in_cluster) as usize,
                buf.len() - done,
            );

            let file_off = self.ensure_allocated(file, offset)?;
            file.write_all_at(&buf[done..done + chunk], file_off)?;

            done += chunk;
            offset += chunk as u64;
        }
        Ok(done)
    }

    pub(crate) fn read_iov(
        &self,
        file: &File,
        mut offset: u64,
        iov: &[libc::iovec],
    ) -> Result<usize> {
        let mut total = 0;
        for v in iov {
            let buf = unsafe { std::slice::from_raw_parts_mut(v.iov_base as *mut u8, v.iov_len) };
            let n = self.read_at(file, offset, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
            offset += n as u64;
        }
        Ok(total)
    }

    pub(crate) fn write_iov(
        &mut self,
        file: &File,
        mut offset: u64,
        iov: &[libc::iovec],
    ) -> Result<usize> {
        let mut total = 0;
        for v in iov {
            let buf = unsafe { std::slice::from_raw_parts(v.iov_base as *const u8, v.iov_len) };
            let n = self.write_at(file, offset, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
            offset += n as u64;
        }
        Ok(total)
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn read_be_u64_at(file: &File, offset: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.read_exact_at(&mut buf, offset)?;
    Ok(u64::from_be_bytes(buf))
}

fn write_be_u64_at(file: &File, offset: u64, val: u64) -> Result<()> {
    file.write_all_at(&val.to_be_bytes(), offset)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Backend, DiskImage};
    use vmm_sys_util::tempfile::TempFile;

    const VIRTUAL_SIZE: u64 = 1 << 20;
    const CLUSTER_BITS: u8 = 12;
    const L2_BITS: u8 = 9;

    fn qcow1_image(version: u32) -> TempFile {
        let tmp = TempFile::new_with_prefix("/tmp/vmlet-test-qcow").unwrap();

        let mut header = Vec::new();
        header.extend_from_slice(&QCOW_MAGIC.to_be_bytes());
        header.extend_from_slice(&version.to_be_bytes());
        header.extend_from_slice(&0u64.to_be_bytes()); // backing file offset
        header.extend_from_slice(&0u32.to_be_bytes()); // backing file size
        header.extend_from_slice(&0u32.to_be_bytes()); // mtime
        header.extend_from_slice(&VIRTUAL_SIZE.to_be_bytes());
        header.push(CLUSTER_BITS);
        header.push(L2_BITS);
        header.extend_from_slice(&[0, 0]); // padding
        header.extend_from_slice(&0u32.to_be_bytes()); // crypt method
        header.extend_from_slice(&(HEADER_LEN as u64).to_be_bytes()); // l1 offset

        // One L1 entry covers the whole megabyte; leave it unallocated.
        header.extend_from_slice(&0u64.to_be_bytes());

        tmp.as_file().write_all_at(&header, 0).unwrap();
        tmp
    }

    #[test]
    fn test_probe_accepts_qcow1() {
        let tmp = qcow1_image(QCOW1_VERSION);
        let disk = DiskImage::open(tmp.as_path(), false).unwrap();
        assert!(matches!(disk.backend, Backend::Qcow(_)));
        assert_eq!(disk.size(), VIRTUAL_SIZE);
    }

    #[test]
    fn test_probe_rejects_unknown_version() {
        let tmp = qcow1_image(2);
        assert!(DiskImage::open(tmp.as_path(), false).is_err());
    }

    #[test]
    fn test_unallocated_reads_as_zeros() {
        let tmp = qcow1_image(QCOW1_VERSION);
        let disk = DiskImage::open(tmp.as_path(), false).unwrap();

        let mut buf = [0xffu8; 512];
        assert_eq!(disk.read_sector(7, &mut buf).unwrap(), 512);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_write_allocates_and_persists() {
        let tmp = qcow1_image(QCOW1_VERSION);

        {
            let mut disk = DiskImage::open(tmp.as_path(), false).unwrap();
            let pattern = [0xa5u8; 512];
            assert_eq!(disk.write_sector(5, &pattern).unwrap(), 512);

            let mut back = [0u8; 512];
            disk.read_sector(5, &mut back).unwrap();
            assert_eq!(back[..], pattern[..]);

            // Neighbouring sectors of the same cluster stay zero.
            disk.read_sector(4, &mut back).unwrap();
            assert!(back.iter().all(|b| *b == 0));
        }

        // The tables and data are on disk, not in dropped state.
        let disk = DiskImage::open(tmp.as_path(), false).unwrap();
        let mut back = [0u8; 512];
        disk.read_sector(5, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0xa5));
    }

    #[test]
    fn test_write_beyond_virtual_size() {
        let tmp = qcow1_image(QCOW1_VERSION);
        let mut disk = DiskImage::open(tmp.as_path(), false).unwrap();

        let buf = [0u8; 512];
        let last = VIRTUAL_SIZE >> 9;
        assert!(disk.write_sector(last, &buf).is_err());
    }

    #[test]
    fn test_cross_cluster_write() {
        let tmp = qcow1_image(QCOW1_VERSION);
        let mut disk = DiskImage::open(tmp.as_path(), false).unwrap();

        // 4K clusters; sector 7 + 1024 bytes straddles the first boundary.
        let pattern = [0x5au8; 1024];
        assert_eq!(disk.write_sector(7, &pattern).unwrap(), 1024);

        let mut back = [0u8; 1024];
        disk.read_sector(7, &mut back).unwrap();
        assert_eq!(back[..], pattern[..]);
    }
}
