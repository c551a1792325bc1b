use crate::config::{DiskConfig, MemoryConfig, VMMConfig};
use std::path::PathBuf;

impl VMMConfig {
    /// Create the builder to generate a vmm config
    pub fn builder(num_vcpus: u8, mem_size_mb: u32) -> VMMConfigBuilder {
        VMMConfigBuilder::new(num_vcpus, mem_size_mb)
    }
}

/// See VMMConfig for explanation about these options
#[derive(Debug, Default)]
pub struct VMMConfigBuilder {
    config: VMMConfig,
}

impl VMMConfigBuilder {
    pub fn new(num_vcpus: u8, mem_size_mb: u32) -> Self {
        VMMConfigBuilder {
            config: VMMConfig {
                cpus: num_vcpus,
                memory: MemoryConfig {
                    size_mib: mem_size_mb,
                    hugetlbfs: None,
                },
                name: format!("guest-{}", std::process::id()),
                ..Default::default()
            },
        }
    }

    /// This method should be called when config is done, it generates the needed config
    pub fn build(self) -> VMMConfig {
        self.config
    }

    pub fn kernel(mut self, kernel: crate::config::KernelConfig) -> Self {
        self.config.kernel = kernel;
        self
    }

    pub fn initramfs(mut self, initramfs: Option<String>) -> Self {
        self.config.initramfs = initramfs.map(PathBuf::from);
        self
    }

    pub fn disk(mut self, path: Option<String>, readonly: bool) -> Self {
        self.config.disk = path.map(|p| DiskConfig {
            path: PathBuf::from(p),
            readonly,
        });
        self
    }

    pub fn hugetlbfs(mut self, path: Option<String>) -> Self {
        self.config.memory.hugetlbfs = path.map(PathBuf::from);
        self
    }

    pub fn name(mut self, name: Option<String>) -> Self {
        if let Some(name) = name {
            self.config.name = name;
        }
        self
    }
}
