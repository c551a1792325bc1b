// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtio block device: drains request chains from its queue and runs them
//! against a [`DiskImage`](crate::disk::DiskImage).

use std::mem;

use log::warn;
use virtio_bindings::bindings::virtio_blk::{
    virtio_blk_outhdr, VIRTIO_BLK_F_FLUSH, VIRTIO_BLK_F_SEG_MAX, VIRTIO_BLK_S_IOERR,
    VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID,
    VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT, VIRTIO_F_VERSION_1,
};
use virtio_bindings::bindings::virtio_ring::VIRTIO_RING_F_EVENT_IDX;

use crate::disk::{DiskImage, SECTOR_SHIFT};
use crate::memory::GuestRam;
use crate::virtio::queue::{DescriptorChain, VirtQueue};
use crate::virtio::{config_window, ConfigField};

pub const QUEUE_SIZE: u16 = 256;

/// Serial returned for VIRTIO_BLK_T_GET_ID, padded to 20 bytes.
const DISK_ID: &[u8] = b"vmlet-disk";
const DISK_ID_LEN: usize = 20;

pub struct VirtioBlock {
    disk: DiskImage,
    pub queue: VirtQueue,
    config: Vec<u8>,
}

impl VirtioBlock {
    pub fn new(disk: DiskImage) -> VirtioBlock {
        let capacity = disk.size() >> SECTOR_SHIFT;
        VirtioBlock {
            disk,
            queue: VirtQueue::new(QUEUE_SIZE),
            config: Self::config_space(capacity),
        }
    }

    /// Feature bits offered to the driver.
    pub fn features() -> u64 {
        (1 << u64::from(VIRTIO_F_VERSION_1))
            | (1 << u64::from(VIRTIO_RING_F_EVENT_IDX))
            | (1 << u64::from(VIRTIO_BLK_F_SEG_MAX))
            | (1 << u64::from(VIRTIO_BLK_F_FLUSH))
    }

    // struct virtio_blk_config, as far as the offered features expose it.
    fn config_space(capacity_sectors: u64) -> Vec<u8> {
        let mut config = Vec::new();
        config.extend_from_slice(&capacity_sectors.to_le_bytes());
        config.extend_from_slice(&0u32.to_le_bytes()); // size_max
        config.extend_from_slice(&u32::from(QUEUE_SIZE - 2).to_le_bytes()); // seg_max
        config.extend_from_slice(&[0u8; 4]); // geometry
        config.extend_from_slice(&512u32.to_le_bytes()); // blk_size
        config
    }

    /// Read from the device's configuration window.
    ///
    /// The MSI-X and high-feature prefixes are decoded first; on the MMIO
    /// transport both are absent, so every offset lands in the
    /// device-specific space.
    pub fn read_config(&self, offset: u64, data: &mut [u8], msix: bool, features_hi: bool) {
        match config_window(offset, msix, features_hi) {
            ConfigField::Msix | ConfigField::FeaturesHigh => {
                // Not backed on this transport.
                for b in data.iter_mut() {
                    *b = 0;
                }
            }
            ConfigField::Device(off) => {
                for (i, b) in data.iter_mut().enumerate() {
                    *b = self
                        .config
                        .get(off as usize + i)
                        .copied()
                        .unwrap_or(0);
                }
            }
        }
    }

    /// Drain the queue, completing every available request. Returns whether
    /// the guest should be interrupted.
    pub fn process_queue(&mut self, ram: &GuestRam) -> bool {
        loop {
            let head = match self.queue.pop(ram) {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    warn!("block: dropping broken available ring: {}", e);
                    break;
                }
            };

            let chain = match self.queue.chain(ram, head) {
                Ok(chain) => chain,
                Err(e) => {
                    // Refuse the request; the ring itself stays usable.
                    warn!("block: dropping malformed request: {}", e);
                    let _ = self.queue.publish(ram, head, 0);
                    continue;
                }
            };

            let status_iov = match chain.in_iovs().last() {
                Some(v) if v.iov_len >= 1 => *v,
                _ => {
                    warn!("block: request without status descriptor");
                    let _ = self.queue.publish(ram, head, 0);
                    continue;
                }
            };

            let (status, data_len) = self.execute(&chain);
            // Safe: the chain walk validated this iovec against guest RAM.
            unsafe { *(status_iov.iov_base as *mut u8) = status };

            if let Err(e) = self.queue.publish(ram, head, data_len + 1) {
                warn!("block: failed to publish completion: {}", e);
            }
        }

        self.queue.should_signal(ram).unwrap_or(false)
    }

    fn execute(&mut self, chain: &DescriptorChain) -> (u8, u32) {
        let outs = chain.out_iovs();
        let ins = chain.in_iovs();

        if outs.is_empty() || outs[0].iov_len < mem::size_of::<virtio_blk_outhdr>() {
            return (VIRTIO_BLK_S_IOERR as u8, 0);
        }
        // Safe: the header iovec was validated by the chain walk and is at
        // least as large as the header.
        let hdr =
            unsafe { std::ptr::read_unaligned(outs[0].iov_base as *const virtio_blk_outhdr) };

        let data_in = &ins[..ins.len() - 1];

        match hdr.type_ {
            VIRTIO_BLK_T_IN => {
                let expected = iov_size(data_in);
                if !self.in_bounds(hdr.sector, expected) {
                    return (VIRTIO_BLK_S_IOERR as u8, 0);
                }
                match self.disk.read_sector_iov(hdr.sector, data_in) {
                    Ok(n) if n == expected => (VIRTIO_BLK_S_OK as u8, n as u32),
                    Ok(n) => {
                        warn!("block: short read: {} of {} bytes", n, expected);
                        (VIRTIO_BLK_S_IOERR as u8, 0)
                    }
                    Err(e) => {
                        warn!("block: read failed: {}", e);
                        (VIRTIO_BLK_S_IOERR as u8, 0)
                    }
                }
            }
            VIRTIO_BLK_T_OUT => {
                let data_out = &outs[1..];
                let expected = iov_size(data_out);
                if !self.in_bounds(hdr.sector, expected) {
                    return (VIRTIO_BLK_S_IOERR as u8, 0);
                }
                match self.disk.write_sector_iov(hdr.sector, data_out) {
                    Ok(n) if n == expected => (VIRTIO_BLK_S_OK as u8, 0),
                    Ok(n) => {
                        warn!("block: short write: {} of {} bytes", n, expected);
                        (VIRTIO_BLK_S_IOERR as u8, 0)
                    }
                    Err(e) => {
                        warn!("block: write failed: {}", e);
                        (VIRTIO_BLK_S_IOERR as u8, 0)
                    }
                }
            }
            VIRTIO_BLK_T_FLUSH => match self.disk.flush() {
                Ok(()) => (VIRTIO_BLK_S_OK as u8, 0),
                Err(e) => {
                    warn!("block: flush failed: {}", e);
                    (VIRTIO_BLK_S_IOERR as u8, 0)
                }
            },
            VIRTIO_BLK_T_GET_ID => {
                let dst = match data_in.first() {
                    Some(v) => *v,
                    None => return (VIRTIO_BLK_S_IOERR as u8, 0),
                };
                let mut id = [0u8; DISK_ID_LEN];
                id[..DISK_ID.len()].copy_from_slice(DISK_ID);
                let n = DISK_ID_LEN.min(dst.iov_len);
                // Safe: validated by the chain walk.
                unsafe { std::ptr::copy_nonoverlapping(id.as_ptr(), dst.iov_base as *mut u8, n) };
                (VIRTIO_BLK_S_OK as u8, n as u32)
            }
            other => {
                warn!("block: unsupported request type {}", other);
                (VIRTIO_BLK_S_UNSUPP as u8, 0)
            }
        }
    }

    fn in_bounds(&self, sector: u64, len: usize) -> bool {
        (sector << SECTOR_SHIFT)
            .checked_add(len as u64)
            .map(|end| end <= self.disk.size())
            .unwrap_or(false)
    }
}

fn iov_size(iov: &[libc::iovec]) -> usize {
    iov.iter().map(|v| v.iov_len).sum()
}
