//! Copyin/Copyout - Kernel Access to User Virtual Memory
//!
//! System calls move data between kernel buffers and a process's virtual
//! memory through `MemoryAccessor`. Transfers go one page at a time:
//! 1. Translate the page, faulting it in if it is not resident.
//! 2. Pin its frame so no concurrent eviction can pick it mid-copy.
//! 3. Copy the part of the request inside this page.
//! 4. Unpin.
//!
//! A bad address never fails the caller. The transfer stops at the first
//! page that cannot be translated (outside the address space, a write to
//! a read-only page, or a fault that could not be resolved) and reports
//! the bytes moved so far.

use alloc::string::String;
use alloc::vec;

use crate::types::{Access, Ppn, Vpn};
use crate::vm::context::KernelMemoryContext;
use crate::vm::vm_map::AddressSpace;
use crate::vm::vm_page::PinOutcome;

/// Reads and writes one address space's memory on behalf of the kernel
pub struct MemoryAccessor<'a> {
    ctx: &'a KernelMemoryContext,
    space: &'a AddressSpace,
}

impl<'a> MemoryAccessor<'a> {
    pub fn new(ctx: &'a KernelMemoryContext, space: &'a AddressSpace) -> Self {
        Self { ctx, space }
    }

    /// Copy `length` bytes at `vaddr` into `data[offset..]`
    ///
    /// The request is clamped to the end of `data`. Returns the number of
    /// bytes copied.
    pub fn read_virtual_memory(
        &self,
        vaddr: usize,
        data: &mut [u8],
        offset: usize,
        length: usize,
    ) -> usize {
        let length = clamp(data.len(), offset, length);
        let memory = self.ctx.memory();
        self.transfer(vaddr, length, Access::Read, |ppn, page_offset, done, amount| {
            let dst = &mut data[offset + done..offset + done + amount];
            memory.read(ppn, page_offset, dst);
        })
    }

    /// Copy `length` bytes from `data[offset..]` to `vaddr`
    ///
    /// The request is clamped to the end of `data`. Returns the number of
    /// bytes copied; pages written are marked dirty.
    pub fn write_virtual_memory(
        &self,
        vaddr: usize,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> usize {
        let length = clamp(data.len(), offset, length);
        let memory = self.ctx.memory();
        self.transfer(vaddr, length, Access::Write, |ppn, page_offset, done, amount| {
            let src = &data[offset + done..offset + done + amount];
            memory.write(ppn, page_offset, src);
        })
    }

    /// Fill `data` from `vaddr`
    pub fn read(&self, vaddr: usize, data: &mut [u8]) -> usize {
        let length = data.len();
        self.read_virtual_memory(vaddr, data, 0, length)
    }

    /// Store `data` at `vaddr`
    pub fn write(&self, vaddr: usize, data: &[u8]) -> usize {
        self.write_virtual_memory(vaddr, data, 0, data.len())
    }

    /// Read a NUL-terminated string of at most `max_length` bytes
    ///
    /// Returns `None` if no terminator is found within `max_length + 1`
    /// bytes. Invalid UTF-8 is replaced.
    pub fn read_virtual_memory_string(&self, vaddr: usize, max_length: usize) -> Option<String> {
        // Nothing past the end of the address space can be read anyway
        let window = max_length.saturating_add(1).min(self.space.size());
        let mut bytes = vec![0u8; window];
        let read = self.read(vaddr, &mut bytes);
        let end = bytes[..read].iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    fn transfer(
        &self,
        vaddr: usize,
        length: usize,
        access: Access,
        mut copy: impl FnMut(Ppn, usize, usize, usize),
    ) -> usize {
        let page_size = self.space.page_size();
        let mut done = 0;

        while done < length {
            let Some(addr) = vaddr.checked_add(done) else {
                break;
            };
            let Some(vpn) = self.space.page_of(addr) else {
                log::warn!(
                    "{}: address {:#x} outside {} pages",
                    self.space.id(),
                    addr,
                    self.space.num_pages()
                );
                break;
            };
            let page_offset = self.space.offset_of(addr);
            let amount = (page_size - page_offset).min(length - done);

            let Some(ppn) = self.pin_page(vpn, access) else {
                break;
            };
            copy(ppn, page_offset, done, amount);
            self.ctx.unpin(ppn);
            done += amount;
        }
        done
    }

    /// Pin the frame backing `vpn`, faulting it in first if needed
    fn pin_page(&self, vpn: Vpn, access: Access) -> Option<Ppn> {
        let frames = self.ctx.frames();
        let handler = self.ctx.fault_handler(self.space);
        loop {
            match frames.pin_resident(self.space.id(), vpn, access) {
                Ok(PinOutcome::Pinned(ppn)) => return Some(ppn),
                Ok(PinOutcome::ReadOnly) => {
                    log::warn!("{}: write to read-only page {} refused", self.space.id(), vpn);
                    return None;
                }
                // Fault it in; it may be evicted again before the retry
                Ok(PinOutcome::NotResident) => {
                    if let Err(err) = handler.handle_fault(vpn) {
                        log::warn!("{}: page {} unavailable: {}", self.space.id(), vpn, err);
                        return None;
                    }
                }
                Err(err) => {
                    log::warn!("{}: {}", self.space.id(), err);
                    return None;
                }
            }
        }
    }
}

fn clamp(len: usize, offset: usize, length: usize) -> usize {
    length.min(len.saturating_sub(offset))
}
