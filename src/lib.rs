/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! machsim is the cross-ABI execution core of a user-mode compatibility
//! layer: it runs ARM32 Mach-O binaries inside a CPU emulation engine while
//! satisfying their framework calls with host-native re-implementations.
//!
//! In various places, the terms "guest" and "host" are used to distinguish
//! between the emulated program (the "guest") and the process running the
//! emulator (the "host"). For example:
//! - The guest is a 32-bit program, so a "guest pointer" is 32 bits.
//! - The host can access both guest memory and host memory; guest dylib
//!   images and the guest stack are host-backed so both sides observe the
//!   same bytes.
//! - A "guest function" is emulated Arm code, usually from the app binary or
//!   one of its dylibs.
//! - A "host function" is native code in a host library.
//!
//! Control crosses the boundary in both directions. Guest→host: host
//! libraries are mapped into the guest address space non-executable, so a
//! guest call into one faults into the dispatcher, which routes it to a
//! wrapper or marshals it dynamically. Host→guest: a native component can
//! [Emulator::call_back] a guest function pointer, or obtain a native thunk
//! for one with [Emulator::translate].

#[macro_use]
mod log;

mod caller;
mod cpu;
mod dispatch;
pub mod dyld;
pub mod error;
mod executor;
pub mod host;
pub mod mach_o;
pub mod objc;
pub mod options;
mod trampoline;

pub use caller::CallArgs;
pub use dyld::{LibId, LibraryEntry, LibraryKind, KERNEL_ADDR};
pub use error::{Error, Result};
pub use host::{HostModule, NativeModule, WrapperIndex, MACH_HEADER_SYMBOL, WRAPPER_INDEX_SYMBOL};
pub use objc::TypeDecoder;
pub use options::Options;

/// The execution core: one guest address space, one engine, one registry of
/// loaded libraries. Single-threaded and cooperative; libraries, guest
/// pages and trampolines live as long as the process.
pub struct Emulator {
    uc: executor::Emu,
}

impl Emulator {
    pub fn new(options: Options) -> Result<Emulator> {
        Ok(Emulator {
            uc: executor::new_emu(options)?,
        })
    }

    /// Load a binary (guest Mach-O or host-native library) by path,
    /// together with everything it references. Idempotent per path.
    pub fn load(&mut self, path: &str) -> Result<LibId> {
        dyld::load(&mut self.uc, path)
    }

    /// Load a guest binary from memory, registered under `path`.
    pub fn load_mach_o_bytes(&mut self, path: &str, bytes: &[u8]) -> Result<LibId> {
        dyld::load_mach_o_bytes(&mut self.uc, path, bytes)
    }

    /// Register a host module the embedder constructed itself, mapping its
    /// image range into the guest space like any loaded host library.
    pub fn register_host_module(
        &mut self,
        path: &str,
        module: Box<dyn HostModule>,
    ) -> Result<LibId> {
        dyld::register_host_module(&mut self.uc, path, module)
    }

    pub fn library(&self, id: LibId) -> &LibraryEntry {
        self.uc.get_data().dyld.entry(id)
    }

    /// Find the loaded library containing a guest address.
    pub fn lookup(&self, addr: u32) -> Option<LibId> {
        self.uc.get_data().dyld.lookup(addr)
    }

    /// Run a loaded guest binary from its entry point.
    pub fn execute_module(&mut self, id: LibId) -> Result<()> {
        executor::execute_module(&mut self.uc, id)
    }

    /// Run guest code at `addr` until its top-level return.
    pub fn execute(&mut self, addr: u32) -> Result<()> {
        executor::execute_addr(&mut self.uc, addr)
    }

    /// Call a function pointer received from the guest. Emulated targets run
    /// with the arguments placed in R0–R3; native targets are called
    /// directly.
    pub fn call_back<A: CallArgs>(&mut self, fp: usize, args: A) -> Result<()> {
        caller::call_back(&mut self.uc, fp, args)
    }

    /// Like [Self::call_back], reading the callee's R0 afterwards.
    pub fn call_back_r<A: CallArgs>(&mut self, fp: usize, args: A) -> Result<u32> {
        caller::call_back_r(&mut self.uc, fp, args)
    }

    /// Exchange a guest function pointer for a callable native thunk; native
    /// pointers pass through unchanged. Returns 0 when the target is guest
    /// code without usable method metadata.
    pub fn translate(&mut self, ptr: usize) -> Result<usize> {
        trampoline::translate(&mut self.uc, ptr)
    }

    /// Run host code that may invoke guest callbacks (trampolines) outside
    /// any emulation frame. Host functions called *during* emulation don't
    /// need this; the core is already active there.
    pub fn run_native<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let _active = executor::ActiveEmuGuard::publish(&mut self.uc);
        f()
    }

    /// Read a general-purpose guest register.
    pub fn gpr(&self, n: u32) -> Result<u32> {
        cpu::read_gpr(&self.uc, n)
    }

    /// Write a general-purpose guest register.
    pub fn set_gpr(&mut self, n: u32, value: u32) -> Result<()> {
        cpu::write_gpr(&mut self.uc, n, value)
    }

    /// Read a 32-bit word from guest memory.
    pub fn read_u32(&self, addr: u32) -> Result<u32> {
        cpu::read_u32(&self.uc, addr)
    }

    /// Depth of the saved-return-address stack; zero whenever no `execute`
    /// frame is live.
    pub fn return_stack_depth(&self) -> usize {
        executor::return_stack_depth(&self.uc)
    }
}
