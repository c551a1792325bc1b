// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtio MMIO transport (device register window, version 2).

use log::warn;
use vm_memory::GuestAddress;
use vmm_sys_util::eventfd::EventFd;

use crate::memory::GuestRam;
use crate::virtio::block::{VirtioBlock, QUEUE_SIZE};
use crate::virtio::has_feature;
use virtio_bindings::bindings::virtio_ring::VIRTIO_RING_F_EVENT_IDX;

/// Guest physical placement of the transport window.
pub const MMIO_BASE: u64 = 0xd000_0000;
pub const MMIO_SIZE: u64 = 0x1000;
/// GSI used for completion interrupts.
pub const MMIO_IRQ: u32 = 5;

const MMIO_MAGIC: u32 = 0x7472_6976; // "virt"
const MMIO_VERSION: u32 = 2;
const DEVICE_ID_BLOCK: u32 = 2;
const VENDOR_ID: u32 = 0x564d_4c54;

// Register offsets within the window.
const REG_MAGIC: u64 = 0x00;
const REG_VERSION: u64 = 0x04;
const REG_DEVICE_ID: u64 = 0x08;
const REG_VENDOR_ID: u64 = 0x0c;
const REG_DEVICE_FEATURES: u64 = 0x10;
const REG_DEVICE_FEATURES_SEL: u64 = 0x14;
const REG_DRIVER_FEATURES: u64 = 0x20;
const REG_DRIVER_FEATURES_SEL: u64 = 0x24;
const REG_QUEUE_SEL: u64 = 0x30;
const REG_QUEUE_NUM_MAX: u64 = 0x34;
const REG_QUEUE_NUM: u64 = 0x38;
const REG_QUEUE_READY: u64 = 0x44;
const REG_QUEUE_NOTIFY: u64 = 0x50;
const REG_INTERRUPT_STATUS: u64 = 0x60;
const REG_INTERRUPT_ACK: u64 = 0x64;
const REG_STATUS: u64 = 0x70;
const REG_QUEUE_DESC_LOW: u64 = 0x80;
const REG_QUEUE_DESC_HIGH: u64 = 0x84;
const REG_QUEUE_DRIVER_LOW: u64 = 0x90;
const REG_QUEUE_DRIVER_HIGH: u64 = 0x94;
const REG_QUEUE_DEVICE_LOW: u64 = 0xa0;
const REG_QUEUE_DEVICE_HIGH: u64 = 0xa4;
const REG_CONFIG_GENERATION: u64 = 0xfc;
const REG_CONFIG: u64 = 0x100;

/// Used-buffer notification bit in InterruptStatus.
const INTERRUPT_USED_RING: u32 = 1;

pub struct MmioTransport {
    device: VirtioBlock,
    irq: EventFd,
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    queue_sel: u32,
    interrupt_status: u32,
    status: u32,
}

impl MmioTransport {
    pub fn new(device: VirtioBlock, irq: EventFd) -> MmioTransport {
        MmioTransport {
            device,
            irq,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            queue_sel: 0,
            interrupt_status: 0,
            status: 0,
        }
    }

    pub fn handle_read(&mut self, offset: u64, data: &mut [u8]) {
        if offset >= REG_CONFIG {
            self.device
                .read_config(offset - REG_CONFIG, data, false, false);
            return;
        }

        if data.len() != 4 {
            warn!("mmio: {}-byte register read at {:#x}", data.len(), offset);
            return;
        }

        let value = match offset {
            REG_MAGIC => MMIO_MAGIC,
            REG_VERSION => MMIO_VERSION,
            REG_DEVICE_ID => DEVICE_ID_BLOCK,
            REG_VENDOR_ID => VENDOR_ID,
            REG_DEVICE_FEATURES => match self.device_features_sel {
                0 => VirtioBlock::features() as u32,
                1 => (VirtioBlock::features() >> 32) as u32,
                _ => 0,
            },
            REG_QUEUE_NUM_MAX => {
                if self.queue_sel == 0 {
                    u32::from(QUEUE_SIZE)
                } else {
                    0
                }
            }
            REG_QUEUE_READY => self.device.queue.ready as u32,
            REG_INTERRUPT_STATUS => self.interrupt_status,
            REG_STATUS => self.status,
            REG_CONFIG_GENERATION => 0,
            _ => {
                warn!("mmio: read of unhandled register {:#x}", offset);
                0
            }
        };
        data.copy_from_slice(&value.to_le_bytes());
    }

    pub fn handle_write(&mut self, ram: &GuestRam, offset: u64, data: &[u8]) {
        if offset >= REG_CONFIG {
            // The block config space carries no driver-writable fields.
            warn!("mmio: ignoring config write at {:#x}", offset);
            return;
        }

        if data.len() != 4 {
            warn!("mmio: {}-byte register write at {:#x}", data.len(), offset);
            return;
        }
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

        match offset {
            REG_DEVICE_FEATURES_SEL => self.device_features_sel = value,
            REG_DRIVER_FEATURES => {
                let shift = 32 * u64::from(self.driver_features_sel);
                if shift < 64 {
                    self.driver_features = (self.driver_features
                        & !(0xffff_ffffu64 << shift))
                        | (u64::from(value) << shift);
                }
            }
            REG_DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            REG_QUEUE_SEL => self.queue_sel = value,
            REG_QUEUE_NUM => {
                if let Err(e) = self.device.queue.set_size(value as u16) {
                    warn!("mmio: {}", e);
                }
            }
            REG_QUEUE_READY => {
                self.device.queue.ready = value == 1;
                self.device.queue.event_idx =
                    has_feature(self.driver_features, VIRTIO_RING_F_EVENT_IDX);
            }
            REG_QUEUE_NOTIFY => self.kick(ram),
            REG_INTERRUPT_ACK => self.interrupt_status &= !value,
            REG_STATUS => {
                if value == 0 {
                    // Device reset.
                    self.device.queue.ready = false;
                    self.interrupt_status = 0;
                    self.driver_features = 0;
                }
                self.status = value;
            }
            REG_QUEUE_DESC_LOW => set_low(&mut self.device.queue.desc_table, value),
            REG_QUEUE_DESC_HIGH => set_high(&mut self.device.queue.desc_table, value),
            REG_QUEUE_DRIVER_LOW => set_low(&mut self.device.queue.avail_ring, value),
            REG_QUEUE_DRIVER_HIGH => set_high(&mut self.device.queue.avail_ring, value),
            REG_QUEUE_DEVICE_LOW => set_low(&mut self.device.queue.used_ring, value),
            REG_QUEUE_DEVICE_HIGH => set_high(&mut self.device.queue.used_ring, value),
            _ => warn!("mmio: write of unhandled register {:#x}", offset),
        }
    }

    fn kick(&mut self, ram: &GuestRam) {
        if !self.device.queue.ready {
            warn!("mmio: kick on a queue that is not ready");
            return;
        }
        if self.device.process_queue(ram) {
            self.interrupt_status |= INTERRUPT_USED_RING;
            if let Err(e) = self.irq.write(1) {
                warn!("mmio: failed to signal guest irq: {}", e);
            }
        }
    }
}

fn set_low(addr: &mut GuestAddress, value: u32) {
    *addr = GuestAddress((addr.0 & !0xffff_ffff) | u64::from(value));
}

fn set_high(addr: &mut GuestAddress, value: u32) {
    *addr = GuestAddress((addr.0 & 0xffff_ffff) | (u64::from(value) << 32));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskImage;
    use vmm_sys_util::tempfile::TempFile;

    fn test_transport() -> (MmioTransport, TempFile) {
        let tmp = TempFile::new_with_prefix("/tmp/vmlet-test-mmio").unwrap();
        tmp.as_file().set_len(8 * 512).unwrap();
        let disk = DiskImage::open(tmp.as_path(), false).unwrap();
        let irq = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        (MmioTransport::new(VirtioBlock::new(disk), irq), tmp)
    }

    fn read_reg(t: &mut MmioTransport, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        t.handle_read(offset, &mut data);
        u32::from_le_bytes(data)
    }

    fn write_reg(t: &mut MmioTransport, ram: &GuestRam, offset: u64, value: u32) {
        t.handle_write(ram, offset, &value.to_le_bytes());
    }

    #[test]
    fn test_identity_registers() {
        let (mut t, _tmp) = test_transport();
        assert_eq!(read_reg(&mut t, REG_MAGIC), MMIO_MAGIC);
        assert_eq!(read_reg(&mut t, REG_VERSION), 2);
        assert_eq!(read_reg(&mut t, REG_DEVICE_ID), DEVICE_ID_BLOCK);
        assert_eq!(read_reg(&mut t, REG_QUEUE_NUM_MAX), u32::from(QUEUE_SIZE));
    }

    #[test]
    fn test_feature_words() {
        let (mut t, _tmp) = test_transport();
        let ram = GuestRam::init(1 << 20, None).unwrap();

        let low = read_reg(&mut t, REG_DEVICE_FEATURES);
        write_reg(&mut t, &ram, REG_DEVICE_FEATURES_SEL, 1);
        let high = read_reg(&mut t, REG_DEVICE_FEATURES);

        let features = u64::from(high) << 32 | u64::from(low);
        assert_eq!(features, VirtioBlock::features());
    }

    #[test]
    fn test_queue_setup_and_reset() {
        let (mut t, _tmp) = test_transport();
        let ram = GuestRam::init(1 << 20, None).unwrap();

        write_reg(&mut t, &ram, REG_QUEUE_NUM, 128);
        write_reg(&mut t, &ram, REG_QUEUE_DESC_LOW, 0x1000);
        write_reg(&mut t, &ram, REG_QUEUE_DESC_HIGH, 0x1);
        write_reg(&mut t, &ram, REG_QUEUE_DRIVER_LOW, 0x2000);
        write_reg(&mut t, &ram, REG_QUEUE_DEVICE_LOW, 0x3000);
        write_reg(&mut t, &ram, REG_QUEUE_READY, 1);

        assert_eq!(t.device.queue.size(), 128);
        assert_eq!(t.device.queue.desc_table, GuestAddress(0x1_0000_1000));
        assert_eq!(t.device.queue.avail_ring, GuestAddress(0x2000));
        assert_eq!(t.device.queue.used_ring, GuestAddress(0x3000));
        assert_eq!(read_reg(&mut t, REG_QUEUE_READY), 1);

        // Writing zero to Status resets the transport.
        write_reg(&mut t, &ram, REG_STATUS, 0);
        assert_eq!(read_reg(&mut t, REG_QUEUE_READY), 0);
    }

    #[test]
    fn test_interrupt_ack_clears_status() {
        let (mut t, _tmp) = test_transport();
        let ram = GuestRam::init(1 << 20, None).unwrap();

        t.interrupt_status = INTERRUPT_USED_RING;
        assert_eq!(read_reg(&mut t, REG_INTERRUPT_STATUS), 1);
        write_reg(&mut t, &ram, REG_INTERRUPT_ACK, 1);
        assert_eq!(read_reg(&mut t, REG_INTERRUPT_STATUS), 0);
    }

    #[test]
    fn test_config_read_capacity() {
        let (mut t, _tmp) = test_transport();

        let mut data = [0u8; 8];
        t.handle_read(REG_CONFIG, &mut data);
        assert_eq!(u64::from_le_bytes(data), 8);
    }
}
