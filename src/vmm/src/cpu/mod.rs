// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! vCPU lifecycle: KVM vCPU creation, long-mode register bring-up and the
//! per-thread run loop.

use std::sync::{Arc, Mutex};

use kvm_bindings::{kvm_fpu, kvm_lapic_state, kvm_msr_entry, kvm_regs, CpuId, Msrs};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use log::{debug, error, info, warn};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use crate::devices::serial::SerialConsole;
use crate::memory::GuestRam;
use crate::virtio::mmio::{MmioTransport, MMIO_BASE, MMIO_SIZE};
use crate::VcpuRendezvous;

mod gdt;
use gdt::*;

/// Initial stack for the boot CPU.
const BOOT_STACK_POINTER: u64 = 0x8ff0;

// Initial pagetables.
const PML4_START: u64 = 0x9000;
const PDPTE_START: u64 = 0xa000;
const PDE_START: u64 = 0xb000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;

const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

// Model-specific registers primed at boot.
const MSR_IA32_TSC: u32 = 0x10;
const MSR_IA32_SYSENTER_CS: u32 = 0x174;
const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
const MSR_IA32_MISC_ENABLE: u32 = 0x1a0;
const MSR_STAR: u32 = 0xc000_0081;
const MSR_LSTAR: u32 = 0xc000_0082;
const MSR_CSTAR: u32 = 0xc000_0083;
const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;
const MSR_IA32_MISC_ENABLE_FAST_STRING: u64 = 0x1;

// Local APIC registers and delivery modes.
const APIC_LVT0: usize = 0x350;
const APIC_LVT1: usize = 0x360;
const APIC_MODE_EXTINT: u32 = 0x7;
const APIC_MODE_NMI: u32 = 0x4;

/// Errors encountered during vCPU operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to operate on guest memory: {0}")]
    GuestMemory(GuestMemoryError),
    #[error("error issuing an ioctl to KVM: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("failed to build MSR entries")]
    CreateMsrs,
    #[error("not all boot MSRs were written")]
    SetMsrsCount,
}

/// Dedicated Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// One virtual CPU and the device handles its run loop dispatches to.
pub(crate) struct Vcpu {
    pub index: u64,
    pub vcpu_fd: VcpuFd,

    ram: Arc<GuestRam>,
    serial: Arc<Mutex<SerialConsole>>,
    block: Option<Arc<Mutex<MmioTransport>>>,
    rendezvous: Arc<VcpuRendezvous>,
    exit_evt: EventFd,
}

impl Vcpu {
    pub fn new(
        vm_fd: &VmFd,
        index: u64,
        ram: Arc<GuestRam>,
        serial: Arc<Mutex<SerialConsole>>,
        block: Option<Arc<Mutex<MmioTransport>>>,
        rendezvous: Arc<VcpuRendezvous>,
        exit_evt: EventFd,
    ) -> Result<Self> {
        Ok(Vcpu {
            index,
            vcpu_fd: vm_fd.create_vcpu(index).map_err(Error::KvmIoctl)?,
            ram,
            serial,
            block,
            rendezvous,
            exit_evt,
        })
    }

    /// Set CPUID, patched with this vCPU's topology fields.
    pub fn configure_cpuid(&self, base_cpuid: &CpuId, num_cpus: u8) -> Result<()> {
        let mut cpuid = base_cpuid.clone();
        for entry in cpuid.as_mut_slice().iter_mut() {
            match entry.function {
                1 => {
                    // Initial APIC id and logical processor count live in EBX.
                    entry.ebx = (entry.ebx & 0x0000_ffff)
                        | (u32::from(num_cpus) << 16)
                        | ((self.index as u32) << 24);
                    if num_cpus > 1 {
                        entry.edx |= 1 << 28; // HTT
                    }
                }
                0xb => {
                    entry.edx = self.index as u32;
                }
                _ => (),
            }
        }
        self.vcpu_fd.set_cpuid2(&cpuid).map_err(Error::KvmIoctl)
    }

    /// Configure MSRs.
    pub fn configure_msrs(&self) -> Result<()> {
        let entries = [
            msr_entry(MSR_IA32_SYSENTER_CS, 0),
            msr_entry(MSR_IA32_SYSENTER_ESP, 0),
            msr_entry(MSR_IA32_SYSENTER_EIP, 0),
            msr_entry(MSR_STAR, 0),
            msr_entry(MSR_CSTAR, 0),
            msr_entry(MSR_KERNEL_GS_BASE, 0),
            msr_entry(MSR_SYSCALL_MASK, 0),
            msr_entry(MSR_LSTAR, 0),
            msr_entry(MSR_IA32_TSC, 0),
            msr_entry(MSR_IA32_MISC_ENABLE, MSR_IA32_MISC_ENABLE_FAST_STRING),
        ];
        let msrs = Msrs::from_entries(&entries).map_err(|_| Error::CreateMsrs)?;

        self.vcpu_fd
            .set_msrs(&msrs)
            .map_err(Error::KvmIoctl)
            .and_then(|written| {
                if written == entries.len() {
                    Ok(())
                } else {
                    Err(Error::SetMsrsCount)
                }
            })
    }

    /// Configure general purpose registers for the boot entry point.
    pub fn configure_regs(&self, entry: GuestAddress) -> Result<()> {
        let regs = kvm_regs {
            rflags: 0x0000_0000_0000_0002u64,
            rip: entry.raw_value(),
            rsp: BOOT_STACK_POINTER,
            rbp: BOOT_STACK_POINTER,
            // Must point to the zero page per the Linux boot ABI.
            rsi: crate::kernel::ZEROPG_START,
            ..Default::default()
        };
        self.vcpu_fd.set_regs(&regs).map_err(Error::KvmIoctl)
    }

    /// Configure segments and paging for 64-bit protected mode.
    pub fn configure_sregs(&self, guest_memory: &GuestMemoryMmap) -> Result<()> {
        let mut sregs = self.vcpu_fd.get_sregs().map_err(Error::KvmIoctl)?;

        let gdt_table: [u64; BOOT_GDT_MAX as usize] = [
            gdt_entry(0, 0, 0),            // NULL
            gdt_entry(0xa09b, 0, 0xfffff), // CODE
            gdt_entry(0xc093, 0, 0xfffff), // DATA
            gdt_entry(0x808b, 0, 0xfffff), // TSS
        ];

        let code_seg = kvm_segment_from_gdt(gdt_table[1], 1);
        let data_seg = kvm_segment_from_gdt(gdt_table[2], 2);
        let tss_seg = kvm_segment_from_gdt(gdt_table[3], 3);

        write_gdt_table(&gdt_table[..], guest_memory).map_err(Error::GuestMemory)?;
        sregs.gdt.base = BOOT_GDT_OFFSET;
        sregs.gdt.limit = std::mem::size_of_val(&gdt_table) as u16 - 1;

        write_idt_value(0, guest_memory).map_err(Error::GuestMemory)?;
        sregs.idt.base = BOOT_IDT_OFFSET;
        sregs.idt.limit = std::mem::size_of::<u64>() as u16 - 1;

        sregs.cs = code_seg;
        sregs.ds = data_seg;
        sregs.es = data_seg;
        sregs.fs = data_seg;
        sregs.gs = data_seg;
        sregs.ss = data_seg;
        sregs.tr = tss_seg;

        // 64-bit protected mode.
        sregs.cr0 |= X86_CR0_PE;
        sregs.efer |= EFER_LME | EFER_LMA;

        // Identity-map the first gigabyte with 2MB pages.
        let boot_pml4_addr = GuestAddress(PML4_START);
        let boot_pdpte_addr = GuestAddress(PDPTE_START);
        let boot_pde_addr = GuestAddress(PDE_START);

        guest_memory
            .write_obj(boot_pdpte_addr.raw_value() | 0x03, boot_pml4_addr)
            .map_err(Error::GuestMemory)?;
        guest_memory
            .write_obj(boot_pde_addr.raw_value() | 0x03, boot_pdpte_addr)
            .map_err(Error::GuestMemory)?;
        for i in 0..512 {
            guest_memory
                .write_obj((i << 21) + 0x83u64, boot_pde_addr.unchecked_add(i * 8))
                .map_err(Error::GuestMemory)?;
        }

        sregs.cr3 = boot_pml4_addr.raw_value();
        sregs.cr4 |= X86_CR4_PAE;
        sregs.cr0 |= X86_CR0_PG;

        self.vcpu_fd.set_sregs(&sregs).map_err(Error::KvmIoctl)
    }

    /// Configure FPU.
    pub fn configure_fpu(&self) -> Result<()> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.vcpu_fd.set_fpu(&fpu).map_err(Error::KvmIoctl)
    }

    /// Configure the LAPIC: LINT0 for external interrupts, LINT1 for NMI.
    pub fn configure_lapic(&self) -> Result<()> {
        let mut klapic = self.vcpu_fd.get_lapic().map_err(Error::KvmIoctl)?;

        let lvt_lint0 = get_klapic_reg(&klapic, APIC_LVT0);
        set_klapic_reg(
            &mut klapic,
            APIC_LVT0,
            set_apic_delivery_mode(lvt_lint0, APIC_MODE_EXTINT),
        );
        let lvt_lint1 = get_klapic_reg(&klapic, APIC_LVT1);
        set_klapic_reg(
            &mut klapic,
            APIC_LVT1,
            set_apic_delivery_mode(lvt_lint1, APIC_MODE_NMI),
        );

        self.vcpu_fd.set_lapic(&klapic).map_err(Error::KvmIoctl)
    }

    /// vCPU emulation loop.
    pub fn run(&mut self) {
        loop {
            if self.rendezvous.pause_requested() {
                self.rendezvous.notify_paused();
            }

            match self.vcpu_fd.run() {
                Ok(exit_reason) => match exit_reason {
                    VcpuExit::Shutdown | VcpuExit::Hlt => {
                        info!("vcpu{}: guest stopped", self.index);
                        if let Err(e) = self.exit_evt.write(1) {
                            error!("vcpu{}: failed to signal exit: {}", self.index, e);
                        }
                        break;
                    }

                    VcpuExit::IoOut(addr, data) => {
                        if SerialConsole::handles(addr) {
                            if let Err(e) = self.serial.lock().unwrap().pio_write(addr, data[0])
                            {
                                warn!("vcpu{}: serial write failed: {}", self.index, e);
                            }
                        } else {
                            debug!("vcpu{}: unhandled PIO write at {:#x}", self.index, addr);
                        }
                    }

                    VcpuExit::IoIn(addr, data) => {
                        if SerialConsole::handles(addr) {
                            data[0] = self.serial.lock().unwrap().pio_read(addr);
                        } else {
                            debug!("vcpu{}: unhandled PIO read at {:#x}", self.index, addr);
                        }
                    }

                    VcpuExit::MmioWrite(addr, data) => {
                        if let Some(block) = mmio_target(&self.block, addr) {
                            block
                                .lock()
                                .unwrap()
                                .handle_write(&self.ram, addr - MMIO_BASE, data);
                        } else {
                            debug!("vcpu{}: unhandled MMIO write at {:#x}", self.index, addr);
                        }
                    }

                    VcpuExit::MmioRead(addr, data) => {
                        if let Some(block) = mmio_target(&self.block, addr) {
                            block.lock().unwrap().handle_read(addr - MMIO_BASE, data);
                        } else {
                            debug!("vcpu{}: unhandled MMIO read at {:#x}", self.index, addr);
                        }
                    }

                    other => {
                        debug!("vcpu{}: unhandled VM-exit: {:?}", self.index, other);
                    }
                },

                // Kicked out of KVM_RUN, typically for a pause request.
                Err(ref e) if e.errno() == libc::EINTR => continue,

                Err(e) => {
                    error!("vcpu{}: emulation error: {}", self.index, e);
                    let _ = self.exit_evt.write(1);
                    break;
                }
            }
        }
    }
}

fn mmio_target(
    block: &Option<Arc<Mutex<MmioTransport>>>,
    addr: u64,
) -> Option<&Arc<Mutex<MmioTransport>>> {
    match block {
        Some(b) if addr >= MMIO_BASE && addr < MMIO_BASE + MMIO_SIZE => Some(b),
        _ => None,
    }
}

fn msr_entry(index: u32, data: u64) -> kvm_msr_entry {
    kvm_msr_entry {
        index,
        data,
        ..Default::default()
    }
}

fn get_klapic_reg(klapic: &kvm_lapic_state, reg_offset: usize) -> u32 {
    let bytes = &klapic.regs[reg_offset..reg_offset + 4];
    u32::from_le_bytes([
        bytes[0] as u8,
        bytes[1] as u8,
        bytes[2] as u8,
        bytes[3] as u8,
    ])
}

fn set_klapic_reg(klapic: &mut kvm_lapic_state, reg_offset: usize, value: u32) {
    for (dst, src) in klapic.regs[reg_offset..reg_offset + 4]
        .iter_mut()
        .zip(value.to_le_bytes().iter())
    {
        *dst = *src as i8;
    }
}

fn set_apic_delivery_mode(reg: u32, mode: u32) -> u32 {
    (reg & !0x700) | (mode << 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_klapic_reg_roundtrip() {
        let mut klapic = kvm_lapic_state::default();
        set_klapic_reg(&mut klapic, APIC_LVT0, 0xdead_beef);
        assert_eq!(get_klapic_reg(&klapic, APIC_LVT0), 0xdead_beef);
    }

    #[test]
    fn test_apic_delivery_mode() {
        assert_eq!(
            set_apic_delivery_mode(0x0000_0700, APIC_MODE_NMI),
            APIC_MODE_NMI << 8
        );
        assert_eq!(
            set_apic_delivery_mode(0xffff_ffff, APIC_MODE_EXTINT) & 0x700,
            APIC_MODE_EXTINT << 8
        );
    }
}
