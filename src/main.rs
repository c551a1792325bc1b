use clap::Parser;
use vmm::config::{KernelConfig, VMMConfig};
use vmm::{ipc, VMM};

#[derive(Parser)]
#[clap(version = "0.1", author = "vmlet authors")]
struct VmletOpts {
    /// Linux kernel path (bzImage or flat binary)
    #[clap(short, long)]
    kernel: Option<String>,

    /// Kernel command line override
    #[clap(long)]
    cmdline: Option<String>,

    /// Initramfs path
    #[clap(short, long)]
    initramfs: Option<String>,

    /// Number of virtual CPUs assigned to the guest
    #[clap(short, long, default_value = "1")]
    cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    #[clap(short, long, default_value = "512")]
    memory: u32,

    /// Disk image path (raw, qcow or block device)
    #[clap(short, long)]
    disk: Option<String>,

    /// Open the disk image read-only (writes are discarded on exit)
    #[clap(long)]
    readonly: bool,

    /// Back guest RAM with a hugetlbfs mount
    #[clap(long)]
    hugetlbfs: Option<String>,

    /// Instance name, also names the control socket
    #[clap(short, long)]
    name: Option<String>,

    /// List running instances and exit
    #[clap(short, long)]
    list: bool,

    /// A level of verbosity, and can be used multiple times
    #[clap(short, long, action=clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug)]
pub enum Error {
    /// No kernel was given on the command line.
    MissingKernel,

    Config(vmm::config::Error),

    List(vmm::ipc::Error),

    VmmNew(vmm::Error),

    VmmConfigure(vmm::Error),

    VmmRun(vmm::Error),
}

fn list_instances() -> Result<(), Error> {
    let dir = ipc::control_dir();
    if !dir.exists() {
        return Ok(());
    }

    ipc::enumerate_instances(&dir, |name, stream| {
        let mut stream = stream;
        let pid = ipc::request_pid(&mut stream)?;
        println!("{}\t{}", name, pid);
        Ok(())
    })
    .map_err(Error::List)
}

fn main() -> Result<(), Error> {
    let opts: VmletOpts = VmletOpts::parse();

    env_logger::Builder::new()
        .filter_level(match opts.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    if opts.list {
        return list_instances();
    }

    let kernel_path = opts.kernel.ok_or(Error::MissingKernel)?;
    let kernel = KernelConfig::new(kernel_path, opts.cmdline).map_err(Error::Config)?;

    let config = VMMConfig::builder(opts.cpus, opts.memory)
        .kernel(kernel)
        .initramfs(opts.initramfs)
        .disk(opts.disk, opts.readonly)
        .hugetlbfs(opts.hugetlbfs)
        .name(opts.name)
        .build();

    // Create a new VMM
    let mut vmm = VMM::new().map_err(Error::VmmNew)?;

    vmm.configure(config).map_err(Error::VmmConfigure)?;

    // Run the VMM
    vmm.run().map_err(Error::VmmRun)?;

    Ok(())
}
