/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Callback trampolines: native function pointers that re-enter the
//! emulator.
//!
//! When a guest passes a function pointer to a native component (a
//! comparator, a completion handler), the native side needs something it can
//! call through a C ABI. [translate] mints such a pointer, backed by an FFI
//! closure whose handler writes the arguments into R0–R3 and drives the
//! emulator at the guest target.
//!
//! Closures are cached by `(target, type encoding)` and retained for the
//! process lifetime, like everything else the loader allocates.

use crate::cpu;
use crate::error::{Error, Result};
use crate::executor::{self, Emu};
use crate::objc::TypeDecoder;
use libffi::low::{
    closure_alloc, ffi_abi_FFI_DEFAULT_ABI, ffi_cif, ffi_type, prep_cif, prep_closure_mut, types,
};
use std::ffi::c_void;
use std::ptr::addr_of_mut;

/// Callbacks receive at most this many word arguments, one per register.
const MAX_ARGS: usize = 4;

struct Trampoline {
    cif: ffi_cif,
    arg_types: [*mut ffi_type; MAX_ARGS],
    returns: bool,
    argc: usize,
    addr: u32,
}

/// If `ptr` points to emulated code, return the address of a native thunk
/// that calls it; otherwise return `ptr` unchanged. Returns 0 when the
/// target is emulated but no usable method metadata exists for it.
pub fn translate(uc: &mut Emu, ptr: usize) -> Result<usize> {
    let target = {
        let guest_addr = u32::try_from(ptr).ok();
        let dyld = &uc.get_data().dyld;
        guest_addr.and_then(|addr| {
            let id = dyld.lookup(addr)?;
            dyld.entry(id).is_dylib().then_some((addr, id))
        })
    };
    let Some((addr, lib_id)) = target else {
        return Ok(ptr);
    };

    // The address points into an emulated library: the callback is guest
    // code. Simple methods can be bridged dynamically from their metadata.
    let Some(encoding) = uc
        .get_data()
        .dyld
        .entry(lib_id)
        .method_type(addr)
        .map(str::to_string)
    else {
        log!("{}", Error::CallbackNotFound);
        return Ok(0);
    };

    if let Some(&existing) = uc.get_data().trampolines.get(&(addr, encoding.clone())) {
        return Ok(existing);
    }

    log_dbg!("dynamically handling callback of type {}", encoding);

    let mut decoder = TypeDecoder::new(&encoding);
    let returns = match decoder.next_type_size() {
        0 => false,
        4 => true,
        _ => {
            log!("unsupported return type of callback");
            return Ok(0);
        }
    };

    let mut argc = 0;
    while decoder.has_next() {
        match decoder.next_type_size() {
            TypeDecoder::INVALID_SIZE => return Ok(0),
            4 => {
                if argc >= MAX_ARGS {
                    log!("callback has too many arguments");
                    return Ok(0);
                }
                argc += 1;
            }
            _ => {
                log!("unsupported callback argument type");
                return Ok(0);
            }
        }
    }

    let Some(code) = alloc_closure(addr, returns, argc) else {
        return Ok(0);
    };
    uc.get_data_mut()
        .trampolines
        .insert((addr, encoding), code);
    Ok(code)
}

/// Allocate and prepare one FFI closure for a guest target. The closure and
/// its record are deliberately never freed.
#[allow(unused_unsafe)]
fn alloc_closure(addr: u32, returns: bool, argc: usize) -> Option<usize> {
    let (uint32_ty, void_ty) =
        unsafe { (addr_of_mut!(types::uint32), addr_of_mut!(types::void)) };

    let trampoline: *mut Trampoline = Box::into_raw(Box::new(Trampoline {
        // Zeroed is fine here: prep_cif fills the record in.
        cif: unsafe { std::mem::zeroed() },
        arg_types: [uint32_ty; MAX_ARGS],
        returns,
        argc,
        addr,
    }));

    let (closure, code) = closure_alloc();
    if closure.is_null() {
        log!("couldn't allocate closure");
        return None;
    }

    let rtype: *mut ffi_type = if returns { uint32_ty } else { void_ty };
    unsafe {
        let cif = std::ptr::addr_of_mut!((*trampoline).cif);
        let arg_types = std::ptr::addr_of_mut!((*trampoline).arg_types) as *mut *mut ffi_type;
        if prep_cif(cif, ffi_abi_FFI_DEFAULT_ABI, argc, rtype, arg_types).is_err() {
            log!("{}", Error::Closure("couldn't prepare CIF".into()));
            return None;
        }
        if prep_closure_mut(closure, cif, handle_trampoline, trampoline, code).is_err() {
            log!("{}", Error::Closure("couldn't prepare closure".into()));
            return None;
        }
    }
    Some(code.0 as usize)
}

/// The closure handler: native code just called a trampoline. Move the
/// arguments into guest registers, run the guest function, and surface its
/// R0 as the native return value.
unsafe extern "C" fn handle_trampoline(
    _cif: &ffi_cif,
    result: &mut u32,
    args: *const *const c_void,
    trampoline: &mut Trampoline,
) {
    let returns = trampoline.returns;
    let argc = trampoline.argc;
    let addr = trampoline.addr;

    log_dbg!(
        "handling trampoline (arguments: {}, {})",
        argc,
        if returns { "returns" } else { "void" }
    );

    let outcome = executor::with_active_emu(|uc| -> Result<()> {
        for i in 0..argc {
            let word = unsafe { *(*args.add(i)).cast::<u32>() };
            cpu::write_gpr(uc, i as u32, word)?;
        }

        executor::execute_addr(uc, addr)?;

        if returns {
            *result = cpu::read_gpr(uc, 0)?;
        }
        Ok(())
    });

    match outcome {
        None => log!("trampoline invoked with no active emulation"),
        Some(Err(err)) => log!("trampoline execution failed: {}", err),
        Some(Ok(())) => (),
    }
}
