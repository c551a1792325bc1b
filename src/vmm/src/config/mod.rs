use linux_loader::cmdline::Cmdline;
use std::convert::TryFrom;
use std::path::PathBuf;

mod builder;
pub use builder::VMMConfigBuilder;

const KERNEL_CMDLINE_CAPACITY: usize = 4096;
// Default command line
const KERNEL_CMDLINE_DEFAULT: &str = "console=ttyS0 i8042.nokbd reboot=k panic=1 pci=off";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel configuration error: {0}")]
    KernelConfig(String),
    #[error("instance name {0:?} is not usable")]
    InstanceName(String),
    #[error("guest needs at least one vCPU")]
    NoVcpus,
}

/// VMM configuration.
#[derive(Debug, Default)]
pub struct VMMConfig {
    /// Linux kernel configuration
    pub kernel: KernelConfig,

    /// Optional initramfs path
    pub initramfs: Option<PathBuf>,

    /// Number of virtual CPUs assigned to the guest
    pub cpus: u8,

    /// Guest memory configuration
    pub memory: MemoryConfig,

    /// Optional disk image
    pub disk: Option<DiskConfig>,

    /// Instance name; also names the control socket
    pub name: String,
}

impl VMMConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.cpus == 0 {
            return Err(Error::NoVcpus);
        }
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::InstanceName(self.name.clone()));
        }
        Ok(())
    }
}

/// Guest RAM sizing.
#[derive(Debug)]
pub struct MemoryConfig {
    /// Memory amount (in MBytes) assigned to the guest
    pub size_mib: u32,

    /// Optional hugetlbfs mount backing guest RAM
    pub hugetlbfs: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            size_mib: 512,
            hugetlbfs: None,
        }
    }
}

impl MemoryConfig {
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.size_mib) << 20
    }
}

/// A disk image attached to the guest.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskConfig {
    /// Path to the image or block device
    pub path: PathBuf,

    /// Open the image read-only (writes stay in host memory)
    pub readonly: bool,
}

/// Store the current state of the kernel & its command line
/// arguments
#[derive(Clone, Debug, PartialEq)]
pub struct KernelConfig {
    /// Path to the kernel binary
    pub kernel_path: PathBuf,

    /// Command line arguments for kernel binary run
    pub cmdline: Cmdline,
}

impl TryFrom<String> for KernelConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(value);
        let kernel = KernelConfig {
            kernel_path: path.clone(),
            ..Default::default()
        };

        if !path.exists() {
            return Err(Error::KernelConfig("File does not exist".to_string()));
        }

        Ok(kernel)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            kernel_path: PathBuf::default(),
            // We define the highest capacity of CMD line so we don't have overflow problems
            cmdline: KernelConfig::default_cmdline(),
        }
    }
}

impl KernelConfig {
    pub fn new(path: String, cfg_cmdline: Option<String>) -> Result<Self, Error> {
        let mut cmdline = Cmdline::new(KERNEL_CMDLINE_CAPACITY);
        cmdline
            .insert_str(cfg_cmdline.unwrap_or_else(|| KERNEL_CMDLINE_DEFAULT.to_string()))
            .map_err(|_| Error::KernelConfig("Capacity error on kernel cmdline".to_string()))?;

        let mut kernel: KernelConfig = TryFrom::try_from(path)?;
        kernel.cmdline = cmdline;

        Ok(kernel)
    }

    pub fn default_cmdline() -> Cmdline {
        let mut cmd = Cmdline::new(KERNEL_CMDLINE_CAPACITY);

        // Safe `unwrap` as sufficient capacity
        cmd.insert_str(KERNEL_CMDLINE_DEFAULT).unwrap();
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn test_success_try_from_kernelconfig() {
        let valid_path = String::from("./Cargo.toml");
        let kernel: Result<KernelConfig, Error> = valid_path.try_into();
        assert!(kernel.is_ok())
    }

    #[test]
    fn test_success_new_kernelconfig() {
        let valid_path = String::from("./Cargo.toml");
        let kernel = KernelConfig::new(valid_path.clone(), None);
        assert!(kernel.is_ok());
        {
            let kernel = kernel.unwrap();
            assert_eq!(kernel.kernel_path.to_str().unwrap(), valid_path);
        }
    }

    #[test]
    fn test_fail_new_kernelconfig() {
        // This is an invalid file
        let valid_path = String::from("./Cargo.tomle");
        let kernel = KernelConfig::new(valid_path, None);
        assert!(kernel.is_err());
    }

    #[test]
    fn test_success_new_with_cmd_kernelconfig() {
        // As we know Cargo.toml exists, we ensure a OK result
        let valid_path = String::from("./Cargo.toml");
        let cmdline = String::from(KERNEL_CMDLINE_DEFAULT);
        let kernel = KernelConfig::new(valid_path.clone(), Some(cmdline.clone()));
        assert!(kernel.is_ok());

        {
            let kernel = kernel.unwrap();
            assert_eq!(kernel.cmdline.as_cstring().unwrap().to_str().unwrap(), cmdline);
            assert_eq!(kernel.kernel_path.to_str().unwrap(), valid_path);
        }
    }

    #[test]
    fn test_validate_rejects_zero_vcpus() {
        let config = VMMConfig {
            cpus: 0,
            name: "guest".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::NoVcpus)));
    }

    #[test]
    fn test_validate_rejects_bad_name() {
        let config = VMMConfig {
            cpus: 1,
            name: "../escape".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InstanceName(_))));
    }
}
