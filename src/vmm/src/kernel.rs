// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

//! Kernel and initrd loading: bzImage first, flat binary as fallback.

use std::convert::TryInto;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use linux_loader::bootparam::{boot_params, setup_header};
use linux_loader::configurator::{linux::LinuxBootConfigurator, BootConfigurator, BootParams};
use linux_loader::loader::{self, bzimage::BzImage, load_cmdline, KernelLoader};
use log::warn;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

use crate::config::KernelConfig;
use crate::pagesize;

// x86_64 boot constants. See https://www.kernel.org/doc/Documentation/x86/boot.txt for the full
// documentation.
// Header field: `boot_flag`. Must contain 0xaa55. This is the closest thing old Linux kernels
// have to a magic number.
const KERNEL_BOOT_FLAG_MAGIC: u16 = 0xaa55;
// Header field: `header`. Must contain the magic number `HdrS` (0x5372_6448).
const KERNEL_HDR_MAGIC: u32 = 0x5372_6448;
// Header field: `type_of_loader`. Unless using a pre-registered bootloader (which we aren't), this
// field must be set to 0xff.
const KERNEL_LOADER_OTHER: u8 = 0xff;
// Header field: `kernel_alignment`. Alignment unit required by a relocatable kernel.
const KERNEL_MIN_ALIGNMENT_BYTES: u32 = 0x0100_0000;

// Start address for the EBDA (Extended Bios Data Area).
// See https://wiki.osdev.org/Memory_Map_(x86) for more information.
const EBDA_START: u64 = 0x0009_fc00;
// RAM memory type.
const E820_RAM: u32 = 1;

/// Address of the zeropage, where Linux kernel boot parameters are written.
pub(crate) const ZEROPG_START: u64 = 0x7000;

const HIMEM_START: u64 = 0x0010_0000; // 1 MB

/// Address where the kernel command line is written.
const CMDLINE_START: u64 = 0x0002_0000;

// The bzImage protected-mode code starts one sector past the load address.
const BZIMAGE_64BIT_ENTRY_OFFSET: u64 = 0x200;

/* RFC 1952 */
const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const CPIO_MAGIC: &[u8; 4] = b"0707";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to write boot parameters to guest memory.
    #[error("failed to write boot parameters: {0}")]
    BootConfigure(linux_loader::configurator::Error),
    /// Failed to load kernel.
    #[error("failed to load kernel: {0}")]
    KernelLoad(loader::Error),
    /// Failed to convert the kernel command line to a C string.
    #[error("failed to convert cmdline: {0}")]
    Cmdline(linux_loader::cmdline::Error),
    /// Neither loader accepted the image.
    #[error("{0} is not a valid bzImage or flat binary")]
    KernelFormat(PathBuf),
    /// Invalid E820 configuration.
    #[error("invalid E820 configuration")]
    E820Configuration,
    /// Highmem start address is past the guest memory end.
    #[error("highmem start address is past the guest memory end")]
    HimemStartPastMemEnd,
    /// I/O error.
    #[error("i/o error: {0}")]
    IO(io::Error),
    /// The initrd magic check failed.
    #[error("{0} is not an initrd")]
    InitrdCheck(PathBuf),
    /// Failed to load initramfs into guest memory.
    #[error("failed to load initramfs")]
    InitramfsLoad,
    /// No space for the initramfs in guest memory.
    #[error("no room for initramfs in guest memory")]
    InitramfsAddress,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the loaded kernel wants execution to start.
pub struct LoadedKernel {
    pub entry: GuestAddress,
}

pub struct InitramfsConfig {
    pub address: GuestAddress,
    pub size: usize,
}

fn add_e820_entry(
    params: &mut boot_params,
    addr: u64,
    size: u64,
    mem_type: u32,
) -> Result<()> {
    if params.e820_entries >= params.e820_table.len() as u8 {
        return Err(Error::E820Configuration);
    }

    params.e820_table[params.e820_entries as usize].addr = addr;
    params.e820_table[params.e820_entries as usize].size = size;
    params.e820_table[params.e820_entries as usize].type_ = mem_type;
    params.e820_entries += 1;

    Ok(())
}

/// Build boot parameters following the Linux boot protocol, carrying over
/// the setup header when the image had one.
fn build_bootparams(
    guest_memory: &GuestMemoryMmap,
    setup_hdr: Option<setup_header>,
    himem_start: GuestAddress,
) -> Result<boot_params> {
    let mut params = boot_params::default();

    if let Some(hdr) = setup_hdr {
        params.hdr = hdr;
    }
    params.hdr.boot_flag = KERNEL_BOOT_FLAG_MAGIC;
    params.hdr.header = KERNEL_HDR_MAGIC;
    params.hdr.type_of_loader = KERNEL_LOADER_OTHER;
    if params.hdr.kernel_alignment == 0 {
        params.hdr.kernel_alignment = KERNEL_MIN_ALIGNMENT_BYTES;
    }

    // Add an entry for EBDA itself.
    add_e820_entry(&mut params, 0, EBDA_START, E820_RAM)?;

    // Add entries for the usable RAM regions.
    let last_addr = guest_memory.last_addr();
    add_e820_entry(
        &mut params,
        himem_start.raw_value(),
        last_addr
            .checked_offset_from(himem_start)
            .ok_or(Error::HimemStartPastMemEnd)?,
        E820_RAM,
    )?;

    Ok(params)
}

/// The initrd may be gzipped or a plain cpio archive; anything else is a
/// configuration error.
fn initrd_check(file: &mut File) -> Result<bool> {
    let mut id = [0u8; 4];
    match file.read_exact(&mut id) {
        Ok(()) => {}
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(Error::IO(e)),
    }
    file.seek(SeekFrom::Start(0)).map_err(Error::IO)?;

    Ok((id[0] == GZIP_ID1 && id[1] == GZIP_ID2) || &id == CPIO_MAGIC)
}

fn load_flat_binary(
    guest_memory: &GuestMemoryMmap,
    kernel_image: &mut File,
) -> Result<GuestAddress> {
    let size = kernel_image.seek(SeekFrom::End(0)).map_err(Error::IO)? as usize;
    kernel_image.seek(SeekFrom::Start(0)).map_err(Error::IO)?;

    let load_addr = GuestAddress(HIMEM_START);
    guest_memory
        .read_from(load_addr, kernel_image, size)
        .map_err(|_| Error::InitramfsLoad)?;

    Ok(load_addr)
}

/// Set the guest kernel up: load the image, the command line, the optional
/// initramfs, and write the zero page.
pub fn kernel_setup(
    guest_memory: &GuestMemoryMmap,
    kernel: &KernelConfig,
    initramfs: Option<&PathBuf>,
) -> Result<LoadedKernel> {
    let mut kernel_image = File::open(&kernel.kernel_path).map_err(Error::IO)?;

    let (entry, setup_hdr) = match BzImage::load(
        guest_memory,
        None,
        &mut kernel_image,
        Some(GuestAddress(HIMEM_START)),
    ) {
        Ok(result) => (
            GuestAddress(result.kernel_load.raw_value() + BZIMAGE_64BIT_ENTRY_OFFSET),
            result.setup_header,
        ),
        Err(e) => {
            warn!(
                "{}: not a bzImage ({}), trying flat binary",
                kernel.kernel_path.display(),
                e
            );
            let entry = load_flat_binary(guest_memory, &mut kernel_image)
                .map_err(|_| Error::KernelFormat(kernel.kernel_path.clone()))?;
            (entry, None)
        }
    };

    // Generate boot parameters.
    let mut bootparams = build_bootparams(guest_memory, setup_hdr, GuestAddress(HIMEM_START))?;

    // Add the kernel command line to the boot parameters.
    bootparams.hdr.cmd_line_ptr = CMDLINE_START as u32;
    bootparams.hdr.cmdline_size = kernel
        .cmdline
        .as_cstring()
        .map_err(Error::Cmdline)?
        .as_bytes()
        .len() as u32
        + 1;

    // Load the kernel command line into guest memory.
    load_cmdline(
        guest_memory,
        GuestAddress(CMDLINE_START),
        &kernel.cmdline,
    )
    .map_err(Error::KernelLoad)?;

    // Load initramfs.
    if let Some(initramfs_path) = initramfs {
        let initramfs_load = load_initramfs(guest_memory, initramfs_path)?;
        bootparams.hdr.ramdisk_image = initramfs_load.address.raw_value() as u32;
        bootparams.hdr.ramdisk_size = initramfs_load.size as u32;
    }

    // Write the boot parameters in the zeropage.
    LinuxBootConfigurator::write_bootparams::<GuestMemoryMmap>(
        &BootParams::new::<boot_params>(&bootparams, GuestAddress(ZEROPG_START)),
        guest_memory,
    )
    .map_err(Error::BootConfigure)?;

    Ok(LoadedKernel { entry })
}

/// Place the initramfs at the top of lowmem, page aligned.
pub fn load_initramfs(guest_mem: &GuestMemoryMmap, path: &Path) -> Result<InitramfsConfig> {
    let mut initramfs = File::open(path).map_err(Error::IO)?;

    if !initrd_check(&mut initramfs)? {
        return Err(Error::InitrdCheck(path.to_path_buf()));
    }

    let size: usize = initramfs
        .seek(SeekFrom::End(0))
        .map_err(|_| Error::InitramfsLoad)?
        .try_into()
        .map_err(|_| Error::InitramfsLoad)?;
    initramfs
        .seek(SeekFrom::Start(0))
        .map_err(|_| Error::InitramfsLoad)?;

    let first_region = guest_mem
        .find_region(GuestAddress::new(0))
        .ok_or(Error::InitramfsAddress)?;
    let lowmem_size = first_region.len() as usize;

    if lowmem_size < size {
        return Err(Error::InitramfsAddress);
    }

    let aligned_addr: u64 = ((lowmem_size - size) & !(pagesize() - 1)) as u64;
    let address = GuestAddress(aligned_addr);

    guest_mem
        .read_from(address, &mut initramfs, size)
        .map_err(|_| Error::InitramfsLoad)?;

    Ok(InitramfsConfig { address, size })
}
