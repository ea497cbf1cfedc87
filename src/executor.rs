/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The emulation driver: owns the engine handle and the cooperative handoff
//! between emulated and native execution.
//!
//! A hook must never re-enter the engine's `start`; anything that could do
//! that is deferred through the continuation slot and runs at the top of the
//! driving loop, after the engine has fully stopped. The kernel sentinel page
//! (non-executable, never overlapping a library) gives top-level guest
//! returns a distinguished address to fault at.

use crate::cpu;
use crate::dispatch;
use crate::dyld::{self, Dyld, LibraryKind, KERNEL_ADDR, STACK_BASE, STACK_SIZE};
use crate::error::{Error, Result};
use crate::options::Options;
use std::cell::Cell;
use std::collections::HashMap;
use unicorn_engine::unicorn_const::{Arch, HookType, Mode, Prot};
use unicorn_engine::Unicorn;

/// The engine handle. All core state hangs off it as its data, so hook
/// callbacks can reach the registry and the run state.
pub type Emu = Unicorn<'static, Environment>;

/// A deferred closure, run once after the engine stops. The only legal place
/// to invoke code that may itself re-enter emulation.
pub type Continuation = Box<dyn FnOnce(&mut Emu) -> Result<()>>;

/// Everything the core tracks besides the engine itself.
pub struct Environment {
    pub dyld: Dyld,
    pub options: Options,
    pub(crate) run: RunState,
    /// Allocated callback trampolines, keyed by target and type encoding so
    /// repeated translations of one callback share a closure.
    pub(crate) trampolines: HashMap<(u32, String), usize>,
}

#[derive(Default)]
pub(crate) struct RunState {
    /// True iff the engine is emulating code right now.
    running: bool,
    /// Restart the driving loop once the engine stops, at `restart_addr` if
    /// set, else at the current link register.
    restart: bool,
    restart_addr: Option<u32>,
    continuation: Option<Continuation>,
    /// Saved link registers, one per nested `execute` frame.
    lr_stack: Vec<u32>,
    /// Hooks installed and stack mapped.
    prepared: bool,
}

/// Construct the engine with a fresh environment and the kernel sentinel
/// page mapped.
pub fn new_emu(options: Options) -> Result<Emu> {
    let env = Environment {
        dyld: Dyld::new(),
        options,
        run: RunState::default(),
        trampolines: HashMap::new(),
    };
    let mut uc = Unicorn::new_with_data(Arch::ARM, Mode::LITTLE_ENDIAN, env)?;
    cpu::map_memory(&mut uc, KERNEL_ADDR, cpu::PAGE_SIZE, Prot::NONE)?;
    Ok(uc)
}

/// One-time setup: map the guest stack and install the four hooks. Hook
/// `handle_fetch_prot` handles calls across the ABI boundary; it works
/// thanks to host libraries being mapped as non-executable.
fn prepare(uc: &mut Emu) -> Result<()> {
    if uc.get_data().run.prepared {
        return Ok(());
    }

    let stack = cpu::alloc_host_pages(STACK_SIZE)?;
    unsafe {
        cpu::map_host_memory(uc, STACK_BASE, STACK_SIZE, Prot::READ | Prot::WRITE, stack)?;
    }
    // Reserve a few bytes of scratch above the stack pointer so diagnostic
    // code can peek past the top without faulting.
    cpu::write_sp(uc, STACK_BASE + STACK_SIZE - 12)?;

    // Hook ranges of (1, 0) mean "everywhere".
    uc.add_mem_hook(HookType::MEM_FETCH_PROT, 1, 0, |uc, _ty, addr, _size, _val| {
        dispatch::handle_fetch_prot(uc, addr as u32)
    })?;
    uc.add_code_hook(1, 0, |uc, addr, _size| {
        dispatch::handle_code(uc, addr as u32);
    })?;
    uc.add_mem_hook(HookType::MEM_WRITE, 1, 0, |_uc, _ty, addr, size, value| {
        dispatch::handle_mem_write(addr as u32, size, value)
    })?;
    uc.add_mem_hook(
        HookType::MEM_READ_UNMAPPED | HookType::MEM_WRITE_UNMAPPED,
        1,
        0,
        |uc, _ty, addr, size, _val| dispatch::handle_mem_unmapped(uc, addr as u32, size),
    )?;

    uc.get_data_mut().run.prepared = true;
    Ok(())
}

/// Run a loaded guest binary from its entry point: set up the stack and
/// hooks, run the guest runtime initializers, then hand control to the
/// entry point.
pub fn execute_module(uc: &mut Emu, id: dyld::LibId) -> Result<()> {
    let (entry_point, header) = {
        let entry = uc.get_data().dyld.entry(id);
        let LibraryKind::Dylib(data) = &entry.kind else {
            log!("we can only execute guest binaries");
            return Err(Error::InvalidBinaryType(entry.path.clone()));
        };
        let header = entry
            .find_symbol("__mh_execute_header")
            .unwrap_or(entry.start_address);
        (data.entry_point, header)
    };

    prepare(uc)?;

    // Initialize the binary with the host-side runtime, the way the guest's
    // own startup code would have. Best-effort: a stripped-down host package
    // may not ship these.
    if let Err(err) = dyld::call_host_function(uc, "libdyld.dll", "_dyld_initialize", Some(header))
    {
        log!("couldn't initialize dyld runtime: {}", err);
    }
    if let Err(err) = dyld::call_host_function(uc, "libobjc.dll", "_objc_init", None) {
        log!("couldn't initialize Objective-C runtime: {}", err);
    }

    let Some(entry_point) = entry_point else {
        log!("binary has no entry point");
        return Err(Error::UnsupportedBinary("binary has no entry point"));
    };
    execute_addr(uc, entry_point)
}

/// Run guest code at `addr` until it returns to this call. Re-entrant: a
/// native function invoked from a continuation may call back in here, one
/// more saved link register deep.
pub fn execute_addr(uc: &mut Emu, addr: u32) -> Result<()> {
    prepare(uc)?;

    log_dbg!("starting emulation at {:#x}", addr);

    // Save LR, then point the return address at the kernel sentinel so a
    // top-level `bx lr` faults back to us.
    let saved_lr = cpu::read_lr(uc)?;
    uc.get_data_mut().run.lr_stack.push(saved_lr);
    cpu::write_lr(uc, KERNEL_ADDR)?;

    let _active = ActiveEmuGuard::publish(uc);

    let mut addr = addr;
    loop {
        uc.get_data_mut().run.running = true;
        uc.emu_start(addr as u64, 0, 0, 0)?;
        assert!(
            !uc.get_data().run.running,
            "flag `running` was not updated correctly"
        );

        let continuation = uc.get_data_mut().run.continuation.take();
        if let Some(continuation) = continuation {
            continuation(uc)?;
        }

        let restart = {
            let run = &mut uc.get_data_mut().run;
            if run.restart {
                run.restart = false;
                Some(run.restart_addr.take())
            } else {
                None
            }
        };
        match restart {
            // Continue where we left off.
            Some(Some(target)) => addr = target,
            Some(None) => addr = cpu::read_lr(uc)?,
            None => break,
        }
    }
    Ok(())
}

/// Handle the guest's top-level return: restore the saved link register and
/// stop the engine for good.
pub fn return_to_kernel(uc: &mut Emu) -> Result<()> {
    let lr = uc.get_data_mut().run.lr_stack.pop();
    let Some(lr) = lr else {
        log!("kernel return with an empty return stack");
        return Err(Error::UnmappedFetch(KERNEL_ADDR));
    };
    cpu::write_lr(uc, lr)?;

    uc.emu_stop()?;
    uc.get_data_mut().run.running = false;
    Ok(())
}

/// Resume emulation at the current link register once the driving loop gets
/// control back. The engine must already be stopped.
pub fn return_to_emulation(uc: &mut Emu) -> Result<()> {
    let lr = cpu::read_lr(uc)?;
    log_dbg!("returning to {:#x}", lr);

    assert!(!uc.get_data().run.running);
    uc.get_data_mut().run.restart = true;
    Ok(())
}

/// Like [return_to_emulation], but resume at an explicit address instead of
/// the link register, stopping the engine first. Used for direct jumps out
/// of a hook, where the engine would otherwise retry the faulting fetch.
pub fn restart_at(uc: &mut Emu, addr: u32) -> Result<()> {
    uc.emu_stop()?;
    let run = &mut uc.get_data_mut().run;
    run.running = false;
    run.restart = true;
    run.restart_addr = Some(addr);
    Ok(())
}

/// Defer a closure to run after the engine stops, at the top of the driving
/// loop. This is the only way to invoke code that may itself re-enter the
/// engine; calling `start` from inside a hook is not allowed.
pub fn continue_outside_emulation(uc: &mut Emu, continuation: Continuation) -> Result<()> {
    {
        let run = &mut uc.get_data_mut().run;
        assert!(
            run.continuation.is_none(),
            "only one continuation is supported"
        );
        run.continuation = Some(continuation);
    }
    uc.emu_stop()?;
    uc.get_data_mut().run.running = false;
    Ok(())
}

/// Current depth of the return-address stack, equal to the number of active
/// `execute` frames.
pub fn return_stack_depth(uc: &Emu) -> usize {
    uc.get_data().run.lr_stack.len()
}

/// Whether this stop cycle already produced a boundary action (the engine
/// was stopped, a continuation is pending, or a restart was requested). A
/// second hook observing the same fault must not dispatch it again.
pub(crate) fn boundary_pending(uc: &Emu) -> bool {
    let run = &uc.get_data().run;
    !run.running || run.continuation.is_some() || run.restart
}

// There is exactly one OS thread; control alternates between the engine's
// dispatch and native code invoked from continuations. Native code holding a
// trampoline has no way to receive the engine handle through its (foreign)
// signature, so the handle is published here for the duration of `execute`.
thread_local! {
    static ACTIVE_EMU: Cell<*mut Emu> = const { Cell::new(std::ptr::null_mut()) };
}

pub(crate) struct ActiveEmuGuard {
    prev: *mut Emu,
}

impl ActiveEmuGuard {
    pub(crate) fn publish(uc: &mut Emu) -> ActiveEmuGuard {
        let prev = ACTIVE_EMU.with(|slot| slot.replace(uc));
        ActiveEmuGuard { prev }
    }
}

impl Drop for ActiveEmuGuard {
    fn drop(&mut self) {
        ACTIVE_EMU.with(|slot| slot.set(self.prev));
    }
}

/// Hand the active engine handle to `f`, or fail if no `execute` frame is
/// live on this thread.
///
/// Safety: the engine is stopped while native code runs, and nothing else
/// touches the handle until the callee returns; the single-threaded
/// cooperative model makes the reborrow sound in practice.
pub(crate) fn with_active_emu<R>(f: impl FnOnce(&mut Emu) -> R) -> Option<R> {
    let ptr = ACTIVE_EMU.with(|slot| slot.get());
    if ptr.is_null() {
        return None;
    }
    Some(f(unsafe { &mut *ptr }))
}
