// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Split virtqueue engine (virtio 1.0).
//!
//! The ring lives in guest RAM. The guest driver owns the descriptor table
//! and the available ring; this side only ever writes the used ring. 16-bit
//! ring indices wrap modulo 2^16, slot positions are `idx % N`.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use virtio_bindings::bindings::virtio_ring::{
    VRING_DESC_F_INDIRECT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE,
};
use vm_memory::{Address, ByteValued, Bytes, GuestAddress};

use crate::memory::GuestRam;

pub const VIRTQ_DESC_F_NEXT: u16 = VRING_DESC_F_NEXT as u16;
pub const VIRTQ_DESC_F_WRITE: u16 = VRING_DESC_F_WRITE as u16;
pub const VIRTQ_DESC_F_INDIRECT: u16 = VRING_DESC_F_INDIRECT as u16;

/// Hard ceiling on the ring size, per the virtio spec.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Queue engine errors. Every one of these means the request is refused and
/// dropped; none of them may take the hypervisor down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("descriptor index {0} out of range")]
    InvalidDescriptorIndex(u16),
    #[error("descriptor chain longer than the ring")]
    ChainTooLong,
    #[error("descriptor range {0:#x}+{1} outside guest RAM")]
    InvalidDescriptorAddress(u64, u32),
    #[error("indirect descriptors not supported")]
    IndirectDescriptor,
    #[error("device-readable descriptor after device-writable one")]
    OutAfterIn,
    #[error("invalid queue size {0}")]
    InvalidQueueSize(u16),
    #[error("guest memory access failed: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One entry of the guest-resident descriptor table.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

// Safe because Descriptor is a plain-old-data repr(C) struct.
unsafe impl ByteValued for Descriptor {}

/// One entry of the used ring.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UsedElem {
    id: u32,
    len: u32,
}

unsafe impl ByteValued for UsedElem {}

/// One guest-submitted request: the head index plus the chain's host iovecs
/// in chain order, device-readable entries first.
#[derive(Debug)]
pub struct DescriptorChain {
    pub head: u16,
    pub iov: Vec<libc::iovec>,
    pub out_count: u16,
    pub in_count: u16,
}

impl DescriptorChain {
    /// Device-readable (guest-to-host) iovecs.
    pub fn out_iovs(&self) -> &[libc::iovec] {
        &self.iov[..self.out_count as usize]
    }

    /// Device-writable (host-to-guest) iovecs.
    pub fn in_iovs(&self) -> &[libc::iovec] {
        &self.iov[self.out_count as usize..]
    }
}

/// Host-side handle over one guest split ring.
pub struct VirtQueue {
    size: u16,
    pub ready: bool,
    /// Whether VIRTIO_RING_F_EVENT_IDX was negotiated.
    pub event_idx: bool,
    pub desc_table: GuestAddress,
    pub avail_ring: GuestAddress,
    pub used_ring: GuestAddress,
    next_avail: Wrapping<u16>,
    last_used_signalled: Wrapping<u16>,
}

impl VirtQueue {
    pub fn new(size: u16) -> VirtQueue {
        VirtQueue {
            size,
            ready: false,
            event_idx: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            last_used_signalled: Wrapping(0),
        }
    }

    /// Set the ring size chosen by the driver: a power of two, at most
    /// [`MAX_QUEUE_SIZE`].
    pub fn set_size(&mut self, size: u16) -> Result<()> {
        if size == 0 || size > MAX_QUEUE_SIZE || !size.is_power_of_two() {
            return Err(Error::InvalidQueueSize(size));
        }
        self.size = size;
        Ok(())
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    fn desc_at(&self, ram: &GuestRam, idx: u16) -> Result<Descriptor> {
        if idx >= self.size {
            return Err(Error::InvalidDescriptorIndex(idx));
        }
        let addr = self.desc_table.unchecked_add(u64::from(idx) * 16);
        Ok(ram.mem().read_obj(addr)?)
    }

    /// Consume the next available head index, if any.
    pub fn pop(&mut self, ram: &GuestRam) -> Result<Option<u16>> {
        let mem = ram.mem();
        let avail_idx: u16 = mem.read_obj(self.avail_ring.unchecked_add(2))?;
        if self.next_avail.0 == avail_idx {
            return Ok(None);
        }

        // The avail.idx load must complete before the ring slot load; the
        // guest publishes the slot before bumping the index.
        fence(Ordering::SeqCst);

        let slot = self
            .avail_ring
            .unchecked_add(4 + 2 * u64::from(self.next_avail.0 % self.size));
        let head: u16 = mem.read_obj(slot)?;
        if head >= self.size {
            return Err(Error::InvalidDescriptorIndex(head));
        }

        self.next_avail += Wrapping(1);
        Ok(Some(head))
    }

    /// Walk the chain starting at `head` into host iovecs, packed layout:
    /// iovecs in chain order with the device-readable ones first, plus the
    /// out/in counts.
    pub fn chain(&self, ram: &GuestRam, head: u16) -> Result<DescriptorChain> {
        let mut iov = Vec::new();
        let (mut out_count, mut in_count) = (0u16, 0u16);

        let mut idx = head;
        let mut steps = 0u16;
        loop {
            // A malicious chain can loop; the walk is bounded by the ring
            // size.
            if steps == self.size {
                return Err(Error::ChainTooLong);
            }
            steps += 1;

            let desc = self.desc_at(ram, idx)?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(Error::IndirectDescriptor);
            }

            let vec = ram
                .iovec(desc.addr, desc.len)
                .map_err(|_| Error::InvalidDescriptorAddress(desc.addr, desc.len))?;
            if desc.flags & VIRTQ_DESC_F_WRITE != 0 {
                in_count += 1;
            } else {
                if in_count > 0 {
                    return Err(Error::OutAfterIn);
                }
                out_count += 1;
            }
            iov.push(vec);

            if desc.flags & VIRTQ_DESC_F_NEXT != 0 {
                idx = desc.next;
            } else {
                break;
            }
        }

        Ok(DescriptorChain {
            head,
            iov,
            out_count,
            in_count,
        })
    }

    /// Walk the chain starting at `head` into two independent iovec arrays,
    /// `(out, in)`, each in chain order.
    pub fn chain_inout(
        &self,
        ram: &GuestRam,
        head: u16,
    ) -> Result<(Vec<libc::iovec>, Vec<libc::iovec>)> {
        let mut out_iov = Vec::new();
        let mut in_iov = Vec::new();

        let mut idx = head;
        let mut steps = 0u16;
        loop {
            if steps == self.size {
                return Err(Error::ChainTooLong);
            }
            steps += 1;

            let desc = self.desc_at(ram, idx)?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(Error::IndirectDescriptor);
            }

            let vec = ram
                .iovec(desc.addr, desc.len)
                .map_err(|_| Error::InvalidDescriptorAddress(desc.addr, desc.len))?;
            if desc.flags & VIRTQ_DESC_F_WRITE != 0 {
                in_iov.push(vec);
            } else {
                out_iov.push(vec);
            }

            if desc.flags & VIRTQ_DESC_F_NEXT != 0 {
                idx = desc.next;
            } else {
                break;
            }
        }

        Ok((out_iov, in_iov))
    }

    /// Complete `head`, crediting `len` written bytes to the guest.
    pub fn publish(&mut self, ram: &GuestRam, head: u16, len: u32) -> Result<()> {
        let mem = ram.mem();
        let used_idx: u16 = mem.read_obj(self.used_ring.unchecked_add(2))?;

        let slot = self
            .used_ring
            .unchecked_add(4 + 8 * u64::from(used_idx % self.size));
        mem.write_obj(
            UsedElem {
                id: u32::from(head),
                len,
            },
            slot,
        )?;

        // The element store must be visible before the index store: the
        // guest reads the slot only after seeing the new index.
        fence(Ordering::SeqCst);

        mem.write_obj(used_idx.wrapping_add(1), self.used_ring.unchecked_add(2))?;

        // And the index store before any signalling decision, so the guest
        // never takes an interrupt for an index it cannot yet see.
        fence(Ordering::SeqCst);

        Ok(())
    }

    /// Whether the guest should be interrupted, per the event-index
    /// convention. Updates the signalled cursor iff the answer is yes.
    pub fn should_signal(&mut self, ram: &GuestRam) -> Result<bool> {
        let mem = ram.mem();
        let new: u16 = mem.read_obj(self.used_ring.unchecked_add(2))?;

        if !self.event_idx {
            self.last_used_signalled = Wrapping(new);
            return Ok(true);
        }

        // used_event lives right after the available ring entries.
        let event: u16 = mem.read_obj(
            self.avail_ring
                .unchecked_add(4 + 2 * u64::from(self.size)),
        )?;
        let old = self.last_used_signalled.0;

        let signal = new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old);
        if signal {
            self.last_used_signalled = Wrapping(new);
        }
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestAddress;

    const DESC_TABLE: u64 = 0x1000;
    const AVAIL_RING: u64 = 0x2000;
    const USED_RING: u64 = 0x3000;
    const QUEUE_SIZE: u16 = 16;

    fn test_ram() -> GuestRam {
        GuestRam::init(1 << 20, None).unwrap()
    }

    fn test_queue() -> VirtQueue {
        let mut vq = VirtQueue::new(QUEUE_SIZE);
        vq.desc_table = GuestAddress(DESC_TABLE);
        vq.avail_ring = GuestAddress(AVAIL_RING);
        vq.used_ring = GuestAddress(USED_RING);
        vq.ready = true;
        vq.event_idx = true;
        vq
    }

    fn write_desc(ram: &GuestRam, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let desc = Descriptor {
            addr,
            len,
            flags,
            next,
        };
        ram.mem()
            .write_obj(desc, GuestAddress(DESC_TABLE + u64::from(idx) * 16))
            .unwrap();
    }

    fn set_avail(ram: &GuestRam, idx: u16, entries: &[u16]) {
        for (i, head) in entries.iter().enumerate() {
            ram.mem()
                .write_obj(
                    *head,
                    GuestAddress(AVAIL_RING + 4 + 2 * (i as u64 % u64::from(QUEUE_SIZE))),
                )
                .unwrap();
        }
        ram.mem()
            .write_obj(idx, GuestAddress(AVAIL_RING + 2))
            .unwrap();
    }

    fn used_idx(ram: &GuestRam) -> u16 {
        ram.mem().read_obj(GuestAddress(USED_RING + 2)).unwrap()
    }

    fn set_used_event(ram: &GuestRam, val: u16) {
        ram.mem()
            .write_obj(
                val,
                GuestAddress(AVAIL_RING + 4 + 2 * u64::from(QUEUE_SIZE)),
            )
            .unwrap();
    }

    #[test]
    fn test_set_size() {
        let mut vq = VirtQueue::new(QUEUE_SIZE);
        vq.set_size(256).unwrap();
        assert_eq!(vq.size(), 256);
        assert!(vq.set_size(0).is_err());
        assert!(vq.set_size(24).is_err());
        assert!(vq.set_size(MAX_QUEUE_SIZE).is_ok());
    }

    #[test]
    fn test_pop_empty_and_order() {
        let ram = test_ram();
        let mut vq = test_queue();

        assert!(vq.pop(&ram).unwrap().is_none());

        set_avail(&ram, 2, &[5, 9]);
        assert_eq!(vq.pop(&ram).unwrap(), Some(5));
        assert_eq!(vq.pop(&ram).unwrap(), Some(9));
        assert!(vq.pop(&ram).unwrap().is_none());
    }

    #[test]
    fn test_pop_rejects_bogus_head() {
        let ram = test_ram();
        let mut vq = test_queue();

        set_avail(&ram, 1, &[QUEUE_SIZE]);
        assert!(matches!(
            vq.pop(&ram),
            Err(Error::InvalidDescriptorIndex(_))
        ));
    }

    #[test]
    fn test_chain_partition() {
        let ram = test_ram();
        let vq = test_queue();

        // head -> mid -> tail: one device-readable, two device-writable.
        write_desc(&ram, 0, 0x4000, 16, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&ram, 1, 0x5000, 512, VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT, 2);
        write_desc(&ram, 2, 0x6000, 1, VIRTQ_DESC_F_WRITE, 0);

        let chain = vq.chain(&ram, 0).unwrap();
        assert_eq!(chain.out_count, 1);
        assert_eq!(chain.in_count, 2);
        assert_eq!(chain.iov.len(), 3);
        assert_eq!(
            u64::from(chain.out_count) + u64::from(chain.in_count),
            chain.iov.len() as u64
        );

        // Order preserved: head, mid, tail.
        let base = ram.host_base() as usize;
        assert_eq!(chain.iov[0].iov_base as usize, base + 0x4000);
        assert_eq!(chain.iov[1].iov_base as usize, base + 0x5000);
        assert_eq!(chain.iov[2].iov_base as usize, base + 0x6000);
        assert_eq!(chain.out_iovs().len(), 1);
        assert_eq!(chain.in_iovs().len(), 2);
    }

    #[test]
    fn test_chain_inout_split_layout() {
        let ram = test_ram();
        let vq = test_queue();

        write_desc(&ram, 3, 0x4000, 16, VIRTQ_DESC_F_NEXT, 4);
        write_desc(&ram, 4, 0x5000, 32, VIRTQ_DESC_F_WRITE, 0);

        let (out_iov, in_iov) = vq.chain_inout(&ram, 3).unwrap();
        assert_eq!(out_iov.len(), 1);
        assert_eq!(in_iov.len(), 1);
        assert_eq!(out_iov[0].iov_len, 16);
        assert_eq!(in_iov[0].iov_len, 32);
    }

    #[test]
    fn test_chain_loop_is_bounded() {
        let ram = test_ram();
        let vq = test_queue();

        // 0 -> 1 -> 0 -> ... never terminates on its own.
        write_desc(&ram, 0, 0x4000, 8, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&ram, 1, 0x5000, 8, VIRTQ_DESC_F_NEXT, 0);

        assert!(matches!(vq.chain(&ram, 0), Err(Error::ChainTooLong)));
    }

    #[test]
    fn test_chain_refuses_bad_address() {
        let ram = test_ram();
        let vq = test_queue();

        write_desc(&ram, 0, u64::MAX - 0x100, 512, 0, 0);
        assert!(matches!(
            vq.chain(&ram, 0),
            Err(Error::InvalidDescriptorAddress(..))
        ));
    }

    #[test]
    fn test_chain_refuses_indirect() {
        let ram = test_ram();
        let vq = test_queue();

        write_desc(&ram, 0, 0x4000, 16, VIRTQ_DESC_F_INDIRECT, 0);
        assert!(matches!(vq.chain(&ram, 0), Err(Error::IndirectDescriptor)));
    }

    #[test]
    fn test_publish_is_monotonic() {
        let ram = test_ram();
        let mut vq = test_queue();

        let initial = used_idx(&ram);
        for i in 0..5u16 {
            vq.publish(&ram, i, 512).unwrap();
            assert_eq!(used_idx(&ram), initial.wrapping_add(i + 1));
        }

        // The published element count matches the index delta.
        assert_eq!(used_idx(&ram).wrapping_sub(initial), 5);

        // Element 0 landed in slot 0 with the right id and length.
        let elem: u64 = ram.mem().read_obj(GuestAddress(USED_RING + 4)).unwrap();
        assert_eq!(elem & 0xffff_ffff, 0);
        assert_eq!(elem >> 32, 512);
    }

    #[test]
    fn test_event_index_signalling() {
        let ram = test_ram();
        let mut vq = test_queue();

        // Guest asked to be told when the used index passes 15; the last
        // interrupt happened at 10 and the ring is already at 12.
        vq.last_used_signalled = Wrapping(10);
        set_used_event(&ram, 15);
        ram.mem()
            .write_obj(12u16, GuestAddress(USED_RING + 2))
            .unwrap();

        let mut fired = Vec::new();
        for head in 0..4u16 {
            vq.publish(&ram, head, 0).unwrap();
            if vq.should_signal(&ram).unwrap() {
                fired.push(used_idx(&ram));
            }
        }

        // Exactly one interrupt, exactly when the index first reached 16.
        assert_eq!(fired, vec![16]);
        assert_eq!(vq.last_used_signalled.0, 16);

        // No new publish, no new interrupt.
        assert!(!vq.should_signal(&ram).unwrap());
    }

    #[test]
    fn test_signal_unconditional_without_event_idx() {
        let ram = test_ram();
        let mut vq = test_queue();
        vq.event_idx = false;

        vq.publish(&ram, 0, 0).unwrap();
        assert!(vq.should_signal(&ram).unwrap());
        assert_eq!(vq.last_used_signalled.0, used_idx(&ram));
    }
}
