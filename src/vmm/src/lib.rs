// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

//! A lightweight user-space hypervisor on top of KVM.
//!
//! The [`VMM`] owns the whole machine: the KVM handles, guest RAM, the vCPU
//! threads, the virtio block device and the per-instance control socket.
//! There are no module-scope singletons; everything threads through this
//! context.

use std::io::{self, stdin, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kvm_bindings::{kvm_pit_config, KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES, KVM_PIT_SPEAKER_DUMMY};
use kvm_ioctls::{Cap, Kvm, VmFd};
use log::{info, warn};
use vm_memory::GuestAddress;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::signal::{block_signal, register_signal_handler, Killable, SIGRTMIN};
use vmm_sys_util::terminal::Terminal;

pub mod config;
mod cpu;
mod devices;
pub mod disk;
mod epoll_context;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod virtio;

use config::VMMConfig;
use cpu::Vcpu;
use devices::serial::SerialConsole;
use epoll_context::{EpollContext, EPOLL_EVENTS_LEN, EXIT_EVENT, STDIN_EVENT};
use disk::DiskImage;
use ipc::VmIpc;
use memory::GuestRam;
use virtio::block::VirtioBlock;
use virtio::mmio::{MmioTransport, MMIO_BASE, MMIO_IRQ};

/// Capabilities the host kernel must provide; startup fails on the first
/// missing one.
const REQUIRED_CAPS: &[(Cap, &str)] = &[
    (Cap::UserMemory, "KVM_CAP_USER_MEMORY"),
    (Cap::Irqchip, "KVM_CAP_IRQCHIP"),
    (Cap::Hlt, "KVM_CAP_HLT"),
    (Cap::IrqRouting, "KVM_CAP_IRQ_ROUTING"),
    (Cap::IrqInjectStatus, "KVM_CAP_IRQ_INJECT_STATUS"),
    (Cap::Pit2, "KVM_CAP_PIT2"),
    (Cap::SetTssAddr, "KVM_CAP_SET_TSS_ADDR"),
    (Cap::ExtCpuid, "KVM_CAP_EXT_CPUID"),
    (Cap::CoalescedMmio, "KVM_CAP_COALESCED_MMIO"),
];

const TSS_ADDRESS: usize = 0xfffb_d000;

/// Serial console interrupt line.
const SERIAL_IRQ: u32 = 4;

const TIMER_INTERVAL_NS: i64 = 1_000_000; /* 1 msec */

/// VMM errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The running kernel speaks a different KVM API revision.
    #[error("KVM API version mismatch: host has {0}")]
    ApiVersion(i32),
    /// A required KVM extension is missing.
    #[error("unsupported KVM extension: {0}")]
    Capability(&'static str),
    /// Error issuing an ioctl to KVM.
    #[error("error issuing an ioctl to KVM: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    /// Guest memory error.
    #[error(transparent)]
    Memory(memory::Error),
    /// RAM size unusable with the fixed MMIO hole.
    #[error("guest RAM size {0:#x} overlaps the MMIO hole at {1:#x}")]
    RamSize(u64, u64),
    /// More vCPUs requested than the host supports.
    #[error("{0} vCPUs requested, host maximum is {1}")]
    VcpuCount(u8, usize),
    /// Kernel loading error.
    #[error(transparent)]
    Kernel(kernel::Error),
    /// Disk image error.
    #[error(transparent)]
    Disk(disk::Error),
    /// Instance socket error.
    #[error(transparent)]
    Ipc(ipc::Error),
    /// Configuration error.
    #[error(transparent)]
    Config(config::Error),
    /// vCPU error.
    #[error("vCPU error: {0}")]
    Vcpu(cpu::Error),
    /// Kernel command line error.
    #[error("kernel command line error: {0}")]
    Cmdline(linux_loader::cmdline::Error),
    /// Periodic timer setup failed.
    #[error("cannot arm the periodic timer: {0}")]
    Timer(io::Error),
    /// The VMM was run before being configured.
    #[error("the VMM is not fully configured")]
    NotConfigured,
    /// I/O error.
    #[error("i/o error: {0}")]
    IO(io::Error),
}

/// Dedicated [`Result`](https://doc.rust-lang.org/std/result/) type.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn pagesize() -> usize {
    // Safe, constant on any running system.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Counting rendezvous between the control thread and the vCPU threads.
///
/// `pause` raises the request flag and collects one eventfd credit per vCPU;
/// each vCPU checks in via [`notify_paused`](VcpuRendezvous::notify_paused)
/// and then parks on the condvar until the controller resumes. A parked vCPU
/// cannot leave before `resume_all`, and the controller cannot observe "all
/// paused" before every vCPU has checked in.
pub struct VcpuRendezvous {
    requested: AtomicBool,
    state: Mutex<bool>,
    resume: Condvar,
    notify: EventFd,
}

impl VcpuRendezvous {
    fn new() -> io::Result<VcpuRendezvous> {
        Ok(VcpuRendezvous {
            requested: AtomicBool::new(false),
            state: Mutex::new(false),
            resume: Condvar::new(),
            notify: EventFd::new(libc::EFD_NONBLOCK)?,
        })
    }

    /// Polled by vCPU threads on every exit from KVM_RUN.
    pub fn pause_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Check in as paused, then block until the controller resumes.
    pub fn notify_paused(&self) {
        if let Err(e) = self.notify.write(1) {
            warn!("failed notifying of paused vCPU: {}", e);
        }
        let mut pausing = self.state.lock().unwrap();
        while *pausing {
            pausing = self.resume.wait(pausing).unwrap();
        }
    }

    fn begin_pause(&self) {
        *self.state.lock().unwrap() = true;
        self.requested.store(true, Ordering::Release);
    }

    /// Collect eventfd credits until `count` vCPUs checked in. `kick` is
    /// re-issued every round so a vCPU that raced past the flag check still
    /// gets yanked out of KVM_RUN.
    fn await_paused<F: Fn()>(&self, count: u64, kick: F) -> io::Result<()> {
        let mut paused = 0u64;
        while paused < count {
            kick();
            match self.notify.read() {
                Ok(n) => paused += n,
                Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn resume_all(&self) {
        self.requested.store(false, Ordering::Release);
        *self.state.lock().unwrap() = false;
        self.resume.notify_all();
    }
}

pub struct VMM {
    kvm: Kvm,
    vm_fd: VmFd,
    recommended_vcpus: usize,
    max_vcpus: usize,

    ram: Option<Arc<GuestRam>>,
    serial: Arc<Mutex<SerialConsole>>,
    block: Option<Arc<Mutex<MmioTransport>>>,
    entry: Option<GuestAddress>,

    vcpus: Vec<Vcpu>,
    vcpu_handles: Vec<JoinHandle<()>>,
    rendezvous: Arc<VcpuRendezvous>,
    exit_evt: EventFd,

    ipc: Option<VmIpc>,
    timer: Option<libc::timer_t>,
}

impl VMM {
    /// Open the KVM device, validate it and create the VM.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;

        // The API version must match the one we compiled against, exactly.
        let version = kvm.get_api_version();
        if version != KVM_API_VERSION as i32 {
            return Err(Error::ApiVersion(version));
        }

        for &(cap, name) in REQUIRED_CAPS {
            if !kvm.check_extension(cap) {
                return Err(Error::Capability(name));
            }
        }

        // get_nr_vcpus() falls back to 4 when KVM_CAP_NR_VCPUS is absent,
        // get_max_vcpus() falls back to the recommended count.
        let recommended_vcpus = kvm.get_nr_vcpus();
        let max_vcpus = kvm.get_max_vcpus();

        let vm_fd = kvm.create_vm().map_err(Error::KvmIoctl)?;

        Ok(VMM {
            kvm,
            vm_fd,
            recommended_vcpus,
            max_vcpus,
            ram: None,
            serial: Arc::new(Mutex::new(SerialConsole::new().map_err(Error::IO)?)),
            block: None,
            entry: None,
            vcpus: Vec::new(),
            vcpu_handles: Vec::new(),
            rendezvous: Arc::new(VcpuRendezvous::new().map_err(Error::IO)?),
            exit_evt: EventFd::new(libc::EFD_NONBLOCK).map_err(Error::IO)?,
            ipc: None,
            timer: None,
        })
    }

    /// Plain capability query, for anything beyond the required set.
    pub fn supports(&self, cap: Cap) -> bool {
        self.kvm.check_extension(cap)
    }

    pub fn recommended_vcpus(&self) -> usize {
        self.recommended_vcpus
    }

    pub fn max_vcpus(&self) -> usize {
        self.max_vcpus
    }

    /// Configure the whole machine from `config`.
    pub fn configure(&mut self, mut config: VMMConfig) -> Result<()> {
        config.validate().map_err(Error::Config)?;
        if config.cpus as usize > self.max_vcpus {
            return Err(Error::VcpuCount(config.cpus, self.max_vcpus));
        }

        self.configure_memory(&config.memory)?;
        self.configure_io()?;

        if let Some(disk_cfg) = &config.disk {
            self.configure_disk(disk_cfg)?;
            // Tell the kernel where the transport window lives.
            config
                .kernel
                .cmdline
                .insert_str(format!(
                    "virtio_mmio.device=4K@{:#x}:{}",
                    MMIO_BASE, MMIO_IRQ
                ))
                .map_err(Error::Cmdline)?;
        }

        let ram = self.ram.as_ref().ok_or(Error::NotConfigured)?;
        let loaded =
            kernel::kernel_setup(ram.mem(), &config.kernel, config.initramfs.as_ref())
                .map_err(Error::Kernel)?;
        self.entry = Some(loaded.entry);

        self.configure_ipc(&config.name)?;
        self.configure_vcpus(config.cpus)?;

        Ok(())
    }

    fn configure_memory(&mut self, memory: &config::MemoryConfig) -> Result<()> {
        let size = memory.size_bytes();
        if size == 0 || size > MMIO_BASE {
            return Err(Error::RamSize(size, MMIO_BASE));
        }

        let mut ram =
            GuestRam::init(size, memory.hugetlbfs.as_deref()).map_err(Error::Memory)?;
        ram.register_ram(&self.vm_fd).map_err(Error::Memory)?;
        self.ram = Some(Arc::new(ram));
        Ok(())
    }

    fn configure_io(&mut self) -> Result<()> {
        self.vm_fd
            .set_tss_address(TSS_ADDRESS)
            .map_err(Error::KvmIoctl)?;

        // The in-kernel irqchip must exist before the vCPUs; it sets up the
        // virtual IOAPIC/PIC and the local APICs.
        self.vm_fd.create_irq_chip().map_err(Error::KvmIoctl)?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        self.vm_fd.create_pit2(pit_config).map_err(Error::KvmIoctl)?;

        let serial_evt = self.serial.lock().unwrap().eventfd().map_err(Error::IO)?;
        self.vm_fd
            .register_irqfd(&serial_evt, SERIAL_IRQ)
            .map_err(Error::KvmIoctl)?;

        Ok(())
    }

    fn configure_disk(&mut self, disk_cfg: &config::DiskConfig) -> Result<()> {
        let disk = DiskImage::open(&disk_cfg.path, disk_cfg.readonly).map_err(Error::Disk)?;
        info!(
            "disk: {} ({} bytes{})",
            disk_cfg.path.display(),
            disk.size(),
            if disk_cfg.readonly { ", read-only" } else { "" }
        );

        let irq_evt = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::IO)?;
        self.vm_fd
            .register_irqfd(&irq_evt, MMIO_IRQ)
            .map_err(Error::KvmIoctl)?;

        let device = VirtioBlock::new(disk);
        self.block = Some(Arc::new(Mutex::new(MmioTransport::new(device, irq_evt))));
        Ok(())
    }

    fn configure_ipc(&mut self, name: &str) -> Result<()> {
        let mut ipc = VmIpc::new(&ipc::control_dir(), name).map_err(Error::Ipc)?;
        ipc.register_handler(
            ipc::MSG_PID,
            Box::new(|stream, _type, _payload| {
                if let Err(e) = stream.write_all(&std::process::id().to_le_bytes()) {
                    warn!("ipc: failed sending pid: {}", e);
                }
            }),
        );
        ipc.start().map_err(Error::Ipc)?;
        self.ipc = Some(ipc);
        Ok(())
    }

    fn configure_vcpus(&mut self, num_vcpus: u8) -> Result<()> {
        let ram = self.ram.as_ref().ok_or(Error::NotConfigured)?.clone();
        let entry = self.entry.ok_or(Error::NotConfigured)?;

        let base_cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;

        for index in 0..num_vcpus {
            let vcpu = Vcpu::new(
                &self.vm_fd,
                index.into(),
                ram.clone(),
                self.serial.clone(),
                self.block.clone(),
                self.rendezvous.clone(),
                self.exit_evt.try_clone().map_err(Error::IO)?,
            )
            .map_err(Error::Vcpu)?;

            vcpu.configure_cpuid(&base_cpuid, num_vcpus)
                .map_err(Error::Vcpu)?;
            vcpu.configure_msrs().map_err(Error::Vcpu)?;
            vcpu.configure_regs(entry).map_err(Error::Vcpu)?;
            vcpu.configure_sregs(ram.mem()).map_err(Error::Vcpu)?;
            vcpu.configure_fpu().map_err(Error::Vcpu)?;
            vcpu.configure_lapic().map_err(Error::Vcpu)?;

            self.vcpus.push(vcpu);
        }

        Ok(())
    }

    /// Boot: spawn the vCPU threads and service the console until the guest
    /// stops.
    pub fn run(&mut self) -> Result<()> {
        if self.vcpus.is_empty() {
            return Err(Error::NotConfigured);
        }

        // The kick signal only exists to interrupt KVM_RUN; the handler has
        // nothing to do.
        extern "C" fn handle_kick(
            _num: libc::c_int,
            _info: *mut libc::siginfo_t,
            _v: *mut libc::c_void,
        ) {
        }
        register_signal_handler(SIGRTMIN() + 0, handle_kick)
            .map_err(|e| Error::IO(io::Error::new(io::ErrorKind::Other, format!("{:?}", e))))?;

        self.start_timer()?;

        if stdin().lock().set_raw_mode().is_err() {
            warn!("cannot put the terminal in raw mode");
        }

        for (index, mut vcpu) in self.vcpus.drain(..).enumerate() {
            let handle = thread::Builder::new()
                .name(format!("vcpu{}", index))
                .spawn(move || {
                    // The periodic tick belongs to the control thread.
                    if let Err(e) = block_signal(libc::SIGALRM) {
                        warn!("vcpu{}: cannot block SIGALRM: {:?}", index, e);
                    }
                    vcpu.run();
                })
                .map_err(Error::IO)?;
            self.vcpu_handles.push(handle);
        }

        let epoll = EpollContext::new().map_err(Error::IO)?;
        epoll.add_stdin().map_err(Error::IO)?;
        epoll
            .add_event(&self.exit_evt, EXIT_EVENT)
            .map_err(Error::IO)?;

        let mut events =
            vec![epoll::Event::new(epoll::Events::empty(), 0); EPOLL_EVENTS_LEN];

        loop {
            let num_events = match epoll::wait(epoll.as_raw_fd(), -1, &mut events[..]) {
                Ok(num_events) => num_events,
                // The periodic timer tick lands here.
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::IO(e)),
            };

            for event in events.iter().take(num_events) {
                match event.data {
                    STDIN_EVENT => {
                        let mut out = [0u8; 64];
                        match stdin().lock().read_raw(&mut out[..]) {
                            Ok(count) => {
                                if let Err(e) =
                                    self.serial.lock().unwrap().queue_input(&out[..count])
                                {
                                    warn!("cannot queue console input: {}", e);
                                }
                            }
                            Err(e) => warn!("cannot read from stdin: {}", e),
                        }
                    }
                    EXIT_EVENT => {
                        let _ = self.exit_evt.read();
                        info!("guest stopped, shutting down");
                        self.shutdown();
                        return Ok(());
                    }
                    _ => (),
                }
            }
        }
    }

    /// Freeze every vCPU. Returns once all of them are parked.
    pub fn pause(&self) -> Result<()> {
        if self.vcpu_handles.is_empty() {
            // Guest not running.
            return Ok(());
        }

        self.rendezvous.begin_pause();
        let handles = &self.vcpu_handles;
        self.rendezvous
            .await_paused(handles.len() as u64, || {
                for handle in handles.iter() {
                    if let Err(e) = handle.kill(SIGRTMIN() + 0) {
                        warn!("failed to kick vCPU: {:?}", e);
                    }
                }
            })
            .map_err(Error::IO)
    }

    /// Release the vCPUs parked by [`pause`](VMM::pause).
    pub fn resume(&self) {
        if !self.vcpu_handles.is_empty() {
            self.rendezvous.resume_all();
        }
    }

    // Periodic SIGALRM tick, directed at the control thread (the vCPU
    // threads keep it blocked). The handler must stay trivially
    // signal-safe.
    fn start_timer(&mut self) -> Result<()> {
        extern "C" fn handle_tick(_num: libc::c_int) {}

        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        sa.sa_sigaction = handle_tick as usize;
        sa.sa_flags = libc::SA_RESTART;
        let ret = unsafe { libc::sigaction(libc::SIGALRM, &sa, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(Error::Timer(io::Error::last_os_error()));
        }

        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = libc::SIGALRM;

        let mut timerid: libc::timer_t = std::ptr::null_mut();
        let ret = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timerid) };
        if ret < 0 {
            return Err(Error::Timer(io::Error::last_os_error()));
        }

        let interval = libc::timespec {
            tv_sec: (TIMER_INTERVAL_NS / 1_000_000_000) as libc::time_t,
            tv_nsec: (TIMER_INTERVAL_NS % 1_000_000_000) as libc::c_long,
        };
        let its = libc::itimerspec {
            it_interval: interval,
            it_value: interval,
        };
        let ret = unsafe { libc::timer_settime(timerid, 0, &its, std::ptr::null_mut()) };
        if ret < 0 {
            unsafe { libc::timer_delete(timerid) };
            return Err(Error::Timer(io::Error::last_os_error()));
        }

        self.timer = Some(timerid);
        Ok(())
    }

    fn stop_timer(&mut self) {
        if let Some(timerid) = self.timer.take() {
            let ret = unsafe { libc::timer_delete(timerid) };
            if ret < 0 {
                warn!("timer_delete failed: {}", io::Error::last_os_error());
            }
        }
    }

    /// Tear the instance down: timer, control socket, terminal. Guest RAM
    /// is released when the context drops.
    pub fn shutdown(&mut self) {
        self.stop_timer();
        if let Some(mut ipc) = self.ipc.take() {
            ipc.stop();
        }
        let _ = stdin().lock().set_canon_mode();
    }
}

impl Drop for VMM {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn kvm_available() -> bool {
        Path::new("/dev/kvm").exists()
    }

    #[test]
    fn test_pause_rendezvous() {
        let rendezvous = Arc::new(VcpuRendezvous::new().unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let notified = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let r = rendezvous.clone();
            let stop = stop.clone();
            let notified = notified.clone();
            threads.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if r.pause_requested() {
                        notified.fetch_add(1, Ordering::SeqCst);
                        r.notify_paused();
                    }
                    thread::yield_now();
                }
            }));
        }

        rendezvous.begin_pause();
        rendezvous.await_paused(4, || {}).unwrap();
        // The rendezvous cannot complete before all four checked in, and
        // parked vCPUs cannot check in twice.
        assert_eq!(notified.load(Ordering::SeqCst), 4);

        rendezvous.resume_all();
        stop.store(true, Ordering::Relaxed);
        for t in threads {
            t.join().unwrap();
        }
        // No spurious second round of check-ins after the resume.
        assert_eq!(notified.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_platform_gate() {
        if !kvm_available() {
            return;
        }

        let vmm = VMM::new().unwrap();
        assert!(vmm.recommended_vcpus() >= 1);
        assert!(vmm.max_vcpus() >= vmm.recommended_vcpus());
        assert!(vmm.supports(Cap::UserMemory));
    }

    #[test]
    fn test_pause_without_guest_is_noop() {
        if !kvm_available() {
            return;
        }

        let vmm = VMM::new().unwrap();
        vmm.pause().unwrap();
        vmm.resume();
    }
}
