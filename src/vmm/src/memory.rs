// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest physical memory: host-backed RAM allocation, kernel slot
//! registration, and flat guest-to-host address translation.

use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::path::Path;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::mmap::MmapRegionError;
use vm_memory::{
    FileOffset, GuestAddress, GuestMemory, GuestMemoryMmap, GuestRegionMmap, MmapRegion,
};

/// `HUGETLBFS_MAGIC` from `linux/magic.h`.
const HUGETLBFS_MAGIC: i64 = 0x958458f6;

/// Guest memory errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The hugetlbfs path could not be stat'ed.
    #[error("cannot statfs {0}: {1}")]
    HugetlbfsStatfs(String, std::io::Error),
    /// The given path is not backed by hugetlbfs.
    #[error("{0} is not a hugetlbfs mount")]
    NotHugetlbfs(String),
    /// The hugepage size does not fit the requested RAM size.
    #[error("hugetlbfs page size {0} unusable for {1} bytes of RAM")]
    HugePageSize(u64, u64),
    /// Creating the hugetlbfs backing file failed.
    #[error("cannot create hugetlbfs backing file: {0}")]
    HugetlbfsFile(std::io::Error),
    /// mmap of guest RAM failed.
    #[error("mmap of guest RAM failed: {0}")]
    Mmap(MmapRegionError),
    /// Building the guest memory regions failed.
    #[error("guest memory setup failed: {0}")]
    GuestRegion(vm_memory::mmap::Error),
    /// A new slot would overlap an already registered one.
    #[error("memory region {0:#x}+{1:#x} overlaps registered slot {2}")]
    SlotOverlap(u64, u64, u32),
    /// The KVM_SET_USER_MEMORY_REGION ioctl failed.
    #[error("KVM_SET_USER_MEMORY_REGION failed: {0}")]
    SetUserMemoryRegion(kvm_ioctls::Error),
    /// A guest physical address fell outside guest RAM.
    #[error("guest address {0:#x} outside guest RAM")]
    OutOfRange(u64),
}

/// Dedicated Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// A contiguous guest-physical region registered with the kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySlot {
    pub slot: u32,
    pub guest_phys: u64,
    pub size: u64,
    pub host_addr: u64,
}

/// Owner of the guest physical address space.
///
/// RAM is one flat region starting at guest physical zero, backed either by
/// an anonymous private mapping or by an unlinked hugetlbfs file.
#[derive(Debug)]
pub struct GuestRam {
    mem: GuestMemoryMmap,
    base: *mut u8,
    size: u64,
    slots: Vec<MemorySlot>,
}

// The mapping lives as long as `self` and is only handed out through
// bounds-checked translations.
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    /// Allocate guest RAM.
    ///
    /// With a hugetlbfs path, the backing is a uniquely named file on that
    /// mount, truncated to `size`, mapped private and unlinked right away.
    pub fn init(size: u64, hugetlbfs_path: Option<&Path>) -> Result<GuestRam> {
        let region = match hugetlbfs_path {
            Some(path) => Self::hugetlbfs_region(path, size)?,
            None => MmapRegion::build(
                None,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            )
            .map_err(Error::Mmap)?,
        };

        let region =
            GuestRegionMmap::new(region, GuestAddress(0)).map_err(Error::GuestRegion)?;
        let mem = GuestMemoryMmap::from_regions(vec![region]).map_err(Error::GuestRegion)?;
        let base = mem
            .get_host_address(GuestAddress(0))
            .map_err(|_| Error::OutOfRange(0))?;

        Ok(GuestRam {
            mem,
            base,
            size,
            slots: Vec::new(),
        })
    }

    fn hugetlbfs_region(path: &Path, size: u64) -> Result<MmapRegion> {
        let path_str = path.to_string_lossy().into_owned();
        let c_path = std::ffi::CString::new(path_str.clone())
            .map_err(|_| Error::NotHugetlbfs(path_str.clone()))?;

        let mut sfs: libc::statfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statfs(c_path.as_ptr(), &mut sfs) };
        if ret < 0 {
            return Err(Error::HugetlbfsStatfs(
                path_str,
                std::io::Error::last_os_error(),
            ));
        }
        if sfs.f_type != HUGETLBFS_MAGIC {
            return Err(Error::NotHugetlbfs(path_str));
        }
        if sfs.f_bsize == 0 || sfs.f_bsize as u64 > size {
            return Err(Error::HugePageSize(sfs.f_bsize as u64, size));
        }

        // mkstemp + immediate unlink: the mapping keeps the pages alive, the
        // name never outlives this function.
        let mut template = format!("{}/vmlet-ram-XXXXXX", path_str).into_bytes();
        template.push(0);
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(Error::HugetlbfsFile(std::io::Error::last_os_error()));
        }
        unsafe { libc::unlink(template.as_ptr() as *const libc::c_char) };

        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size).map_err(Error::HugetlbfsFile)?;

        MmapRegion::build(
            Some(FileOffset::new(file, 0)),
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_NORESERVE,
        )
        .map_err(Error::Mmap)
    }

    /// Assign the next slot id and submit the region to the kernel.
    ///
    /// KVM_SET_USER_MEMORY_REGION does not reject overlapping regions, so
    /// the overlap check happens here before the ioctl.
    pub fn register_mem(
        &mut self,
        vm_fd: &VmFd,
        guest_phys: u64,
        size: u64,
        host_addr: u64,
    ) -> Result<u32> {
        let slot = self.reserve_slot(guest_phys, size, host_addr)?;

        let region = kvm_userspace_memory_region {
            slot: slot.slot,
            flags: 0,
            guest_phys_addr: slot.guest_phys,
            memory_size: slot.size,
            userspace_addr: slot.host_addr,
        };
        // Safe because the slot registry guarantees non-overlapping regions
        // and the host range is owned by this mapping.
        unsafe { vm_fd.set_user_memory_region(region) }.map_err(Error::SetUserMemoryRegion)?;

        Ok(slot.slot)
    }

    /// Register the whole of guest RAM as slot 0.
    pub fn register_ram(&mut self, vm_fd: &VmFd) -> Result<u32> {
        let (size, host) = (self.size, self.base as u64);
        self.register_mem(vm_fd, 0, size, host)
    }

    // Slot bookkeeping: ids are dense from zero, guest ranges disjoint.
    fn reserve_slot(&mut self, guest_phys: u64, size: u64, host_addr: u64) -> Result<MemorySlot> {
        for other in &self.slots {
            let disjoint =
                guest_phys >= other.guest_phys + other.size || guest_phys + size <= other.guest_phys;
            if !disjoint {
                return Err(Error::SlotOverlap(guest_phys, size, other.slot));
            }
        }

        let slot = MemorySlot {
            slot: self.slots.len() as u32,
            guest_phys,
            size,
            host_addr,
        };
        self.slots.push(slot);
        Ok(slot)
    }

    /// Registered slots, in registration order.
    pub fn slots(&self) -> &[MemorySlot] {
        &self.slots
    }

    /// The `vm-memory` view of guest RAM, used for typed accesses.
    pub fn mem(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn host_base(&self) -> *mut u8 {
        self.base
    }

    /// Translate a guest physical address into a host pointer.
    pub fn guest_flat_to_host(&self, guest_phys: u64) -> Result<*mut u8> {
        if guest_phys >= self.size {
            return Err(Error::OutOfRange(guest_phys));
        }
        Ok(unsafe { self.base.add(guest_phys as usize) })
    }

    /// Whether a host pointer falls inside guest RAM.
    pub fn host_ptr_in_ram(&self, ptr: *const u8) -> bool {
        let base = self.base as usize;
        let p = ptr as usize;
        p >= base && p < base + self.size as usize
    }

    /// Build a host iovec covering `[guest_phys, guest_phys + len)`.
    pub fn iovec(&self, guest_phys: u64, len: u32) -> Result<libc::iovec> {
        if u64::from(len) > self.size || guest_phys > self.size - u64::from(len) {
            return Err(Error::OutOfRange(guest_phys));
        }
        Ok(libc::iovec {
            iov_base: self.guest_flat_to_host(guest_phys)? as *mut libc::c_void,
            iov_len: len as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    #[test]
    fn test_flat_translation() {
        let ram = GuestRam::init(MIB, None).unwrap();

        let base = ram.host_base();
        let p = ram.guest_flat_to_host(0x1234).unwrap();
        assert_eq!(p as usize, base as usize + 0x1234);

        assert!(ram.guest_flat_to_host(MIB).is_err());
        assert!(ram.guest_flat_to_host(u64::MAX).is_err());
    }

    #[test]
    fn test_host_ptr_in_ram() {
        let ram = GuestRam::init(MIB, None).unwrap();
        let base = ram.host_base();

        assert!(ram.host_ptr_in_ram(base));
        assert!(ram.host_ptr_in_ram(unsafe { base.add(MIB as usize - 1) }));
        assert!(!ram.host_ptr_in_ram(unsafe { base.add(MIB as usize) }));
    }

    #[test]
    fn test_slot_ids_dense_and_disjoint() {
        let mut ram = GuestRam::init(MIB, None).unwrap();

        let a = ram.reserve_slot(0, MIB, 0x1000).unwrap();
        let b = ram.reserve_slot(2 * MIB, MIB, 0x2000).unwrap();
        let c = ram.reserve_slot(MIB, MIB, 0x3000).unwrap();
        assert_eq!((a.slot, b.slot, c.slot), (0, 1, 2));

        // Overlap in guest physical space must be refused.
        assert!(matches!(
            ram.reserve_slot(MIB / 2, MIB, 0x4000),
            Err(Error::SlotOverlap(..))
        ));
        // A refused reservation must not burn a slot id.
        assert_eq!(ram.slots().len(), 3);
        assert_eq!(ram.reserve_slot(4 * MIB, MIB, 0x5000).unwrap().slot, 3);
    }

    #[test]
    fn test_iovec_bounds() {
        let ram = GuestRam::init(MIB, None).unwrap();

        let iov = ram.iovec(0x200, 0x400).unwrap();
        assert_eq!(iov.iov_len, 0x400);

        assert!(ram.iovec(MIB - 0x100, 0x200).is_err());
        assert!(ram.iovec(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_bad_hugetlbfs_path() {
        // /tmp is not hugetlbfs.
        let err = GuestRam::init(MIB, Some(Path::new("/tmp"))).unwrap_err();
        assert!(matches!(err, Error::NotHugetlbfs(_)));
    }
}
