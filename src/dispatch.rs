/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The fetch-protection dispatcher.
//!
//! Host libraries are mapped into the guest space non-executable, so every
//! guest jump into one faults here. The fault address tells us which library
//! was called; from there the call is routed to a precompiled wrapper, to a
//! hand-written guest wrapper found through the wrapper index, or (for
//! simple Objective-C methods) to a dynamically marshaled native call.

use crate::caller::DynamicCaller;
use crate::cpu;
use crate::dyld::{self, LibraryKind, KERNEL_ADDR};
use crate::error::{Error, Result};
use crate::executor::{self, Emu};
use crate::objc::TypeDecoder;

/// Fetch-protection hook body. Returning `false` is fatal for the emulation,
/// which is what we want for genuinely unmapped or unroutable fetches.
pub fn handle_fetch_prot(uc: &mut Emu, addr: u32) -> bool {
    // The code hook routes missed faults here by hand; if both it and the
    // engine's own fault report fire for one crossing, dispatch only once.
    if executor::boundary_pending(uc) {
        return true;
    }
    match fetch_prot_inner(uc, addr) {
        Ok(handled) => handled,
        Err(err) => {
            log!("fetch at {:#x} failed: {}", addr, err);
            false
        }
    }
}

fn fetch_prot_inner(uc: &mut Emu, addr: u32) -> Result<bool> {
    // Check that the target address is in some loaded library.
    let Some(lib_id) = uc.get_data().dyld.lookup(addr) else {
        if addr == KERNEL_ADDR {
            log_dbg!("executing kernel at {:#x} (as protected)", addr);
            executor::return_to_kernel(uc)?;
            return Ok(true);
        }
        log!("unmapped address {:#x} fetched", addr);
        return Ok(false);
    };

    let mut target = addr;
    let mut target_lib = lib_id;
    let wrapper = uc.get_data().dyld.entry(lib_id).is_wrapper;

    // If the target is not a wrapper DLL, we must find and call the
    // corresponding wrapper instead.
    if !wrapper {
        let (lib_path, lib_start) = {
            let entry = uc.get_data().dyld.entry(lib_id);
            (entry.path.clone(), entry.start_address)
        };
        let wrapper_path = dyld::wrapper_path_for(&lib_path);
        let Ok(wrapper_lib) = dyld::load(uc, &wrapper_path) else {
            log!("couldn't load companion wrapper {}", wrapper_path);
            return Ok(false);
        };

        let rva = addr - lib_start
            + uc.get_data().options.wrapper_rva_base_for(&lib_path);

        // Find the dylib with the corresponding wrapper.
        let dylib_name = {
            let wrapper_entry = uc.get_data().dyld.entry(wrapper_lib);
            let LibraryKind::HostDll(host) = &wrapper_entry.kind else {
                log!("{} is not a host library", wrapper_path);
                return Ok(false);
            };
            let Some(index) = host.module.wrapper_index() else {
                log!("{} has no wrapper index", wrapper_path);
                return Ok(false);
            };
            index
                .map
                .get(&rva)
                .and_then(|&string_idx| index.dylibs.get(string_idx).cloned())
        };

        let Some(dylib_name) = dylib_name else {
            // No precompiled wrapper. Maybe this is a simple Objective-C
            // method we can translate dynamically.
            let method_type = uc
                .get_data()
                .dyld
                .entry(lib_id)
                .method_type(addr)
                .map(str::to_string);
            if let Some(encoding) = method_type {
                return dynamic_translate(uc, lib_id, addr, &encoding);
            }

            log!(
                "{}",
                Error::MissingWrapperEntry {
                    rva,
                    wrapper: wrapper_path,
                }
            );
            return Ok(false);
        };

        let Ok(wrapper_dylib) = dyld::load(uc, &dylib_name) else {
            log!("couldn't load wrapper dylib {}", dylib_name);
            return Ok(false);
        };

        // Find the correct wrapper using its alias.
        let alias = dyld::wrapper_alias(rva);
        let Some(resolved) = uc.get_data().dyld.entry(wrapper_dylib).find_symbol(&alias)
        else {
            log!(
                "{}",
                Error::MissingWrapperAlias {
                    rva,
                    library: lib_path,
                }
            );
            return Ok(false);
        };
        target = resolved;
        target_lib = uc
            .get_data()
            .dyld
            .lookup(target & !1)
            .expect("symbol found in library wasn't found there in reverse lookup");

        log_dbg!(
            "fetch prot mem at {:#x} routed to {:#x} (not a wrapper)",
            addr,
            target
        );

        // A hand-written wrapper in a guest dylib is emulated code: just
        // jump to it, nothing to marshal.
        if uc.get_data().dyld.entry(target_lib).is_dylib() {
            executor::restart_at(uc, target)?;
            return Ok(true);
        }
    }

    // Wrapper ABI: R0 holds a pointer to the structure with the function's
    // arguments and return slot; the wrapper takes it as its one argument.
    let r0 = cpu::read_gpr(uc, 0)?;
    let native = uc.get_data().dyld.entry(target_lib).native_ptr(target);

    log_dbg!("fetch prot mem at {:#x}, calling wrapper", target);

    executor::continue_outside_emulation(
        uc,
        Box::new(move |uc| {
            let func: unsafe extern "C" fn(u32) = unsafe { std::mem::transmute(native) };
            unsafe { func(r0) };
            executor::return_to_emulation(uc)
        }),
    )?;
    Ok(true)
}

/// Marshal a call to a native Objective-C method implementation directly
/// from the guest's registers and stack, using its type encoding.
fn dynamic_translate(uc: &mut Emu, lib_id: usize, addr: u32, encoding: &str) -> Result<bool> {
    log_dbg!("dynamically handling method of type {}", encoding);

    let mut decoder = TypeDecoder::new(encoding);
    let returns = match decoder.next_type_size() {
        0 => false,
        4 => true,
        _ => {
            log!("{}", Error::UnsupportedReturnType);
            return Ok(false);
        }
    };

    let mut caller = DynamicCaller::new();
    while decoder.has_next() {
        let size = decoder.next_type_size();
        if size == TypeDecoder::INVALID_SIZE {
            return Ok(false);
        }
        caller.load_arg(uc, size)?;
    }

    let native = uc.get_data().dyld.entry(lib_id).native_ptr(addr);
    executor::continue_outside_emulation(
        uc,
        Box::new(move |uc| {
            if caller.call(uc, returns, native)? {
                executor::return_to_emulation(uc)?;
            }
            Ok(())
        }),
    )?;
    Ok(true)
}

/// Code hook. The engine sometimes fails to raise the fetch-protection
/// fault for a protected page (unicorn-engine#888); catch that case by
/// classifying the executing address and routing it by hand.
pub fn handle_code(uc: &mut Emu, addr: u32) {
    if executor::boundary_pending(uc) {
        return;
    }
    match uc.get_data().dyld.lookup(addr) {
        None => {
            if addr == KERNEL_ADDR {
                log_dbg!("executing kernel at {:#x}", addr);
                if let Err(err) = executor::return_to_kernel(uc) {
                    log!("{}", err);
                }
                return;
            }
            log!("unmapped address {:#x} executed", addr);
        }
        Some(lib_id) => {
            if !uc.get_data().dyld.entry(lib_id).is_dylib() {
                handle_fetch_prot(uc, addr);
            }
        }
    }
}

/// Memory-write hook: tracing only.
pub fn handle_mem_write(addr: u32, size: usize, value: i64) -> bool {
    log_dbg!("writing [{:#x}] := {:#x} ({})", addr, value, size);
    true
}

/// Unmapped read/write hook: map the page so emulation can continue. The
/// guest is probably poking at heap or other host-side objects we haven't
/// mirrored yet.
pub fn handle_mem_unmapped(uc: &mut Emu, addr: u32, size: usize) -> bool {
    log_dbg!("unmapped memory manipulation at {:#x} ({})", addr, size);

    let base = cpu::align_to_page(addr);
    let end = cpu::round_to_page(addr.wrapping_add(size.max(1) as u32));
    let map_size = end.wrapping_sub(base).max(cpu::PAGE_SIZE);
    match cpu::map_memory(
        uc,
        base,
        map_size,
        unicorn_engine::unicorn_const::Prot::READ | unicorn_engine::unicorn_const::Prot::WRITE,
    ) {
        Ok(()) => true,
        Err(err) => {
            log!("couldn't map memory at {:#x}: {}", base, err);
            false
        }
    }
}
