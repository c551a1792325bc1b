// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Disk images: probing, backend dispatch and sector-granular I/O.
//!
//! Three backends cover the four image flavours: raw read-write files use
//! vectored positional I/O, read-only raw files and block devices share a
//! private copy-on-write mapping, and qcow images go through the sparse
//! translation layer. The vectored entry points accept every backend; for
//! the mapped ones they simply walk the iovecs.

pub mod qcow;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::warn;

pub const SECTOR_SHIFT: u64 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// `BLKGETSIZE64` from `linux/fs.h` (x86_64 layout).
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

/// Disk image errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot stat {0}: {1}")]
    Stat(PathBuf, io::Error),
    #[error("cannot open {0}: {1}")]
    Open(PathBuf, io::Error),
    #[error("cannot query block device size: {0}")]
    BlockDeviceSize(io::Error),
    #[error("cannot map disk image: {0}")]
    Mmap(io::Error),
    #[error("access beyond end of image: sector {sector}, {len} bytes")]
    OutOfBounds { sector: u64, len: usize },
    #[error("disk i/o failed: {0}")]
    Io(io::Error),
    #[error(transparent)]
    Qcow(#[from] qcow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A private copy-on-write mapping of an image. Writes land in anonymous
/// host pages and are never persisted.
pub(crate) struct MmapBacking {
    ptr: *mut u8,
    len: usize,
}

// The mapping is owned by the backing and only accessed through
// bounds-checked copies.
unsafe impl Send for MmapBacking {}
unsafe impl Sync for MmapBacking {}

impl MmapBacking {
    fn map_private(file: &File, len: usize) -> Result<MmapBacking> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Mmap(io::Error::last_os_error()));
        }
        Ok(MmapBacking {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.len as u64 {
            return Err(Error::OutOfBounds {
                sector: offset >> SECTOR_SHIFT,
                len: buf.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset as usize), buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.len as u64 {
            return Err(Error::OutOfBounds {
                sector: offset >> SECTOR_SHIFT,
                len: buf.len(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.add(offset as usize), buf.len())
        };
        Ok(())
    }

    fn read_iov(&self, mut offset: u64, iov: &[libc::iovec]) -> Result<usize> {
        let mut total = 0;
        for v in iov {
            let buf = unsafe { std::slice::from_raw_parts_mut(v.iov_base as *mut u8, v.iov_len) };
            self.read(offset, buf)?;
            offset += v.iov_len as u64;
            total += v.iov_len;
        }
        Ok(total)
    }

    fn write_iov(&self, mut offset: u64, iov: &[libc::iovec]) -> Result<usize> {
        let mut total = 0;
        for v in iov {
            let buf = unsafe { std::slice::from_raw_parts(v.iov_base as *const u8, v.iov_len) };
            self.write(offset, buf)?;
            offset += v.iov_len as u64;
            total += v.iov_len;
        }
        Ok(total)
    }
}

impl Drop for MmapBacking {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if ret < 0 {
            warn!(
                "munmap of disk image failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

pub(crate) enum Backend {
    /// Vectored positional I/O straight at the file.
    Raw,
    /// Copy-on-write mapping (read-only raw files and block devices).
    Mmap(MmapBacking),
    /// Sparse qcow translation.
    Qcow(qcow::QcowState),
}

/// An open disk image.
///
/// Teardown releases the backend state (for the mapped flavours, the
/// mapping) before the descriptor; both paths log instead of aborting.
pub struct DiskImage {
    // Field order matters: the backend must drop before the file.
    pub(crate) backend: Backend,
    file: File,
    size: u64,
}

impl DiskImage {
    /// Probe `path` and open the matching backend.
    ///
    /// Block-special paths are sized with `BLKGETSIZE64` and mapped
    /// copy-on-write. Regular files get the qcow probe first, then fall
    /// back to raw: vectored fd I/O when writable, a copy-on-write mapping
    /// when read-only.
    pub fn open(path: &Path, readonly: bool) -> Result<DiskImage> {
        let meta = fs::metadata(path).map_err(|e| Error::Stat(path.to_path_buf(), e))?;
        if meta.file_type().is_block_device() {
            return Self::open_blkdev(path);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)
            .map_err(|e| Error::Open(path.to_path_buf(), e))?;

        if let Some(state) = qcow::QcowState::probe(&mut file)? {
            let size = state.virtual_size();
            return Ok(DiskImage {
                file,
                size,
                backend: Backend::Qcow(state),
            });
        }

        // The raw fallback is unconditional: whatever the file holds (even
        // nothing), it is served at its current size.
        let size = meta.len();

        let backend = if readonly {
            // Non-persistent writes by design: the mapping is private, dirty
            // pages die with the process.
            Backend::Mmap(MmapBacking::map_private(&file, size as usize)?)
        } else {
            Backend::Raw
        };

        Ok(DiskImage {
            file,
            size,
            backend,
        })
    }

    fn open_blkdev(path: &Path) -> Result<DiskImage> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| Error::Open(path.to_path_buf(), e))?;

        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret < 0 {
            return Err(Error::BlockDeviceSize(io::Error::last_os_error()));
        }

        let backing = MmapBacking::map_private(&file, size as usize)?;
        Ok(DiskImage {
            file,
            size,
            backend: Backend::Mmap(backing),
        })
    }

    /// Logical image size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read sectors into host iovecs. A short count means end-of-image.
    pub fn read_sector_iov(&self, sector: u64, iov: &[libc::iovec]) -> Result<usize> {
        let offset = sector << SECTOR_SHIFT;
        match &self.backend {
            Backend::Raw => preadv_in_full(self.file.as_raw_fd(), iov, offset),
            Backend::Mmap(m) => m.read_iov(offset, iov),
            Backend::Qcow(state) => Ok(state.read_iov(&self.file, offset, iov)?),
        }
    }

    /// Write sectors from host iovecs. A short count means end-of-image.
    pub fn write_sector_iov(&mut self, sector: u64, iov: &[libc::iovec]) -> Result<usize> {
        let offset = sector << SECTOR_SHIFT;
        match &mut self.backend {
            Backend::Raw => pwritev_in_full(self.file.as_raw_fd(), iov, offset),
            Backend::Mmap(m) => m.write_iov(offset, iov),
            Backend::Qcow(state) => Ok(state.write_iov(&self.file, offset, iov)?),
        }
    }

    /// Read sectors into one contiguous buffer.
    pub fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.backend {
            Backend::Mmap(m) => {
                m.read(sector << SECTOR_SHIFT, buf)?;
                Ok(buf.len())
            }
            _ => {
                let iov = [libc::iovec {
                    iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                }];
                self.read_sector_iov(sector, &iov)
            }
        }
    }

    /// Write sectors from one contiguous buffer.
    pub fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<usize> {
        match &mut self.backend {
            Backend::Mmap(m) => {
                m.write(sector << SECTOR_SHIFT, buf)?;
                Ok(buf.len())
            }
            _ => {
                let iov = [libc::iovec {
                    iov_base: buf.as_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                }];
                self.write_sector_iov(sector, &iov)
            }
        }
    }

    /// Flush pending writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        match &self.backend {
            // Nothing to persist, the mapping is copy-on-write only.
            Backend::Mmap(_) => Ok(()),
            _ => self.file.sync_all().map_err(Error::Io),
        }
    }
}

// Full-transfer positional vectored I/O: partial transfers are retried
// until the byte count matches the iovec sum, EOF, or a hard error.

fn preadv_in_full(fd: libc::c_int, iov: &[libc::iovec], offset: u64) -> Result<usize> {
    vectored_in_full(iov, offset, |iovs, cnt, off| unsafe {
        libc::preadv(fd, iovs, cnt, off)
    })
}

fn pwritev_in_full(fd: libc::c_int, iov: &[libc::iovec], offset: u64) -> Result<usize> {
    vectored_in_full(iov, offset, |iovs, cnt, off| unsafe {
        libc::pwritev(fd, iovs, cnt, off)
    })
}

fn vectored_in_full<F>(iov: &[libc::iovec], offset: u64, mut op: F) -> Result<usize>
where
    F: FnMut(*const libc::iovec, libc::c_int, libc::off_t) -> libc::ssize_t,
{
    let mut iovs: Vec<libc::iovec> = iov.to_vec();
    let mut offset = offset;
    let mut total = 0usize;
    let mut cur = 0usize;

    while cur < iovs.len() {
        let ret = op(
            iovs[cur..].as_ptr(),
            (iovs.len() - cur) as libc::c_int,
            offset as libc::off_t,
        );
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        if ret == 0 {
            // End of file; report the short transfer.
            break;
        }

        let mut done = ret as usize;
        total += done;
        offset += done as u64;
        while cur < iovs.len() && done >= iovs[cur].iov_len {
            done -= iovs[cur].iov_len;
            cur += 1;
        }
        if cur < iovs.len() && done > 0 {
            iovs[cur].iov_base = unsafe { (iovs[cur].iov_base as *mut u8).add(done) } as *mut _;
            iovs[cur].iov_len -= done;
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempfile::TempFile;

    fn zeroed_image(len: u64) -> TempFile {
        let tmp = TempFile::new_with_prefix("/tmp/vmlet-test-disk").unwrap();
        tmp.as_file().set_len(len).unwrap();
        tmp
    }

    fn two_iovecs(buf: &[u8; 16]) -> [libc::iovec; 2] {
        [
            libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: 8,
            },
            libc::iovec {
                iov_base: unsafe { buf.as_ptr().add(8) } as *mut libc::c_void,
                iov_len: 8,
            },
        ]
    }

    #[test]
    fn test_raw_roundtrip_vectored() {
        let tmp = zeroed_image(1 << 20);
        let mut disk = DiskImage::open(tmp.as_path(), false).unwrap();
        assert!(matches!(disk.backend, Backend::Raw));
        assert_eq!(disk.size(), 1 << 20);

        let pattern = *b"ABCDEFGHIJKLMNOP";
        let iov = two_iovecs(&pattern);
        assert_eq!(disk.write_sector_iov(3, &iov).unwrap(), 16);

        let mut back = [0u8; 16];
        assert_eq!(disk.read_sector(3, &mut back).unwrap(), 16);
        assert_eq!(back, pattern);
    }

    #[test]
    fn test_readonly_mmap_is_cow() {
        let tmp = zeroed_image(1 << 20);

        {
            let mut disk = DiskImage::open(tmp.as_path(), true).unwrap();
            assert!(matches!(disk.backend, Backend::Mmap(_)));

            // The write takes effect in memory only.
            disk.write_sector(0, b"XYZ").unwrap();
            let mut back = [0u8; 3];
            disk.read_sector(0, &mut back).unwrap();
            assert_eq!(&back, b"XYZ");
        }

        // A fresh mapping sees the untouched file.
        let disk = DiskImage::open(tmp.as_path(), true).unwrap();
        let mut back = [0u8; 3];
        disk.read_sector(0, &mut back).unwrap();
        assert_eq!(back, [0, 0, 0]);
    }

    #[test]
    fn test_mmap_bounds_are_strict() {
        let tmp = zeroed_image(4 * SECTOR_SIZE);
        let mut disk = DiskImage::open(tmp.as_path(), true).unwrap();

        let buf = [0u8; 1024];
        assert!(matches!(
            disk.write_sector(3, &buf),
            Err(Error::OutOfBounds { .. })
        ));
        let mut rbuf = [0u8; 512];
        assert!(matches!(
            disk.read_sector(4, &mut rbuf),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_raw_short_read_at_eof() {
        let tmp = zeroed_image(2 * SECTOR_SIZE);
        let disk = DiskImage::open(tmp.as_path(), false).unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(disk.read_sector(2, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_empty_file_opens_as_raw() {
        let tmp = TempFile::new_with_prefix("/tmp/vmlet-test-disk").unwrap();
        let disk = DiskImage::open(tmp.as_path(), false).unwrap();
        assert!(matches!(disk.backend, Backend::Raw));
        assert_eq!(disk.size(), 0);

        // Every read is already past the end.
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_sector(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_missing_path() {
        assert!(matches!(
            DiskImage::open(Path::new("/nonexistent/vmlet-disk"), false),
            Err(Error::Stat(..))
        ));
    }
}
