/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Helpers for driving the CPU emulation engine.
//!
//! The engine itself (Unicorn) is an external collaborator: it provides
//! register access, memory mapping with permissions, memory/code hooks and
//! `emu_start`/`emu_stop`. Everything here is a thin, typed seam so the rest
//! of the crate can speak in guest terms (32-bit addresses, R0–R3, pages).

use crate::error::Result;
use unicorn_engine::unicorn_const::Prot;
use unicorn_engine::{RegisterARM, Unicorn};

/// Guest page size. Segment mapping, the kernel sentinel and the unmapped
/// memory auto-mapper all work at this granularity.
pub const PAGE_SIZE: u32 = 0x1000;

/// Round an address down to the start of its page.
pub fn align_to_page(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// Round a size or end address up to page granularity.
pub fn round_to_page(size: u32) -> u32 {
    align_to_page(size.wrapping_add(PAGE_SIZE - 1))
}

/// Host-side equivalents, for aligning host buffers that back guest pages.
pub fn align_host_to_page(addr: usize) -> usize {
    addr & !(PAGE_SIZE as usize - 1)
}

/// Mach-O VM protection bits.
const VM_PROT_READ: u32 = 0x1;
const VM_PROT_WRITE: u32 = 0x2;
const VM_PROT_EXECUTE: u32 = 0x4;

/// Translate a Mach-O segment's VM protection to engine permissions.
pub fn prot_from_vm_prot(vm_prot: u32) -> Prot {
    let mut prot = Prot::NONE;
    if vm_prot & VM_PROT_READ != 0 {
        prot |= Prot::READ;
    }
    if vm_prot & VM_PROT_WRITE != 0 {
        prot |= Prot::WRITE;
    }
    if vm_prot & VM_PROT_EXECUTE != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

/// Read a general-purpose register. `n` is the register number, 0..=12.
pub fn read_gpr<D>(uc: &Unicorn<D>, n: u32) -> Result<u32> {
    debug_assert!(n <= 12);
    let reg = RegisterARM::R0 as i32 + n as i32;
    Ok(uc.reg_read(reg)? as u32)
}

/// Write a general-purpose register. `n` is the register number, 0..=12.
pub fn write_gpr<D>(uc: &mut Unicorn<D>, n: u32, value: u32) -> Result<()> {
    debug_assert!(n <= 12);
    let reg = RegisterARM::R0 as i32 + n as i32;
    uc.reg_write(reg, value as u64)?;
    Ok(())
}

pub fn read_sp<D>(uc: &Unicorn<D>) -> Result<u32> {
    Ok(uc.reg_read(RegisterARM::SP)? as u32)
}
pub fn write_sp<D>(uc: &mut Unicorn<D>, value: u32) -> Result<()> {
    uc.reg_write(RegisterARM::SP, value as u64)?;
    Ok(())
}

pub fn read_lr<D>(uc: &Unicorn<D>) -> Result<u32> {
    Ok(uc.reg_read(RegisterARM::LR)? as u32)
}
pub fn write_lr<D>(uc: &mut Unicorn<D>, value: u32) -> Result<()> {
    uc.reg_write(RegisterARM::LR, value as u64)?;
    Ok(())
}

/// Read a 32-bit word from guest memory.
pub fn read_u32<D>(uc: &Unicorn<D>, addr: u32) -> Result<u32> {
    let mut buf = [0u8; 4];
    uc.mem_read(addr as u64, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Map fresh engine-owned memory at a fixed guest address.
pub fn map_memory<D>(uc: &mut Unicorn<D>, addr: u32, size: u32, prot: Prot) -> Result<()> {
    uc.mem_map(addr as u64, size as usize, prot)?;
    Ok(())
}

/// Splice a host buffer into the guest address space, so that host code and
/// guest code observe the same bytes.
///
/// Safety: `host` must be page-aligned, at least `size` bytes, and must stay
/// valid (and un-moved) for the lifetime of the engine. Library images and
/// the guest stack satisfy this by being leaked.
#[allow(unused_unsafe)]
pub unsafe fn map_host_memory<D>(
    uc: &mut Unicorn<D>,
    addr: u32,
    size: u32,
    prot: Prot,
    host: *mut u8,
) -> Result<()> {
    unsafe {
        uc.mem_map_ptr(addr as u64, size as usize, prot, host.cast())?;
    }
    Ok(())
}

/// Allocate a leaked, page-aligned, zeroed host buffer used to back guest
/// pages. Guest pages live for the process lifetime, so there is no
/// deallocation path.
pub fn alloc_host_pages(size: u32) -> Result<*mut u8> {
    let layout =
        std::alloc::Layout::from_size_align(size as usize, PAGE_SIZE as usize).map_err(|_| {
            crate::error::Error::Allocation("guest pages")
        })?;
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(crate::error::Error::Allocation("guest pages"));
    }
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(align_to_page(0x1fff), 0x1000);
        assert_eq!(align_to_page(0x2000), 0x2000);
        assert_eq!(round_to_page(0x1001), 0x2000);
        assert_eq!(round_to_page(0x1000), 0x1000);
        assert_eq!(round_to_page(0), 0);
    }

    #[test]
    fn vm_prot_translation() {
        assert_eq!(prot_from_vm_prot(0), Prot::NONE);
        assert_eq!(prot_from_vm_prot(0x1), Prot::READ);
        assert_eq!(prot_from_vm_prot(0x3), Prot::READ | Prot::WRITE);
        assert_eq!(prot_from_vm_prot(0x5), Prot::READ | Prot::EXEC);
    }
}
