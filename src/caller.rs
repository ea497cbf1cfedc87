/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Argument marshaling across the ABI boundary, in both directions.
//!
//! Guest→native: [DynamicCaller] reads arguments the way the guest placed
//! them (R0–R3, then the stack) and invokes a native function of matching
//! arity. Native→guest: [call_back] writes arguments into guest registers
//! and drives the emulator until the callee's top-level return.

use crate::cpu;
use crate::error::{Error, Result};
use crate::executor::{self, Emu};

/// Number of words passed in registers before the AAPCS spills to the stack.
const REG_ARGS: u32 = 4;

/// Collects guest arguments and forwards them to a native function.
pub struct DynamicCaller {
    reg_id: u32,
    args: Vec<u32>,
}

impl DynamicCaller {
    pub fn new() -> DynamicCaller {
        DynamicCaller {
            reg_id: 0,
            args: Vec::new(),
        }
    }

    /// Collect the next argument of `size` bytes, one 32-bit word at a time:
    /// first from R0–R3, then from the guest stack.
    pub fn load_arg(&mut self, uc: &mut Emu, size: usize) -> Result<()> {
        let mut remaining = size;
        while remaining > 0 {
            if self.reg_id < REG_ARGS {
                let word = cpu::read_gpr(uc, self.reg_id)?;
                self.reg_id += 1;
                self.args.push(word);
            } else {
                let sp = cpu::read_sp(uc)?;
                let slot = sp + (self.args.len() as u32 - REG_ARGS) * 4;
                let word = cpu::read_u32(uc, slot)?;
                self.args.push(word);
            }
            remaining = remaining.saturating_sub(4);
        }
        Ok(())
    }

    /// Invoke the native function at `native` with the collected words,
    /// writing the return value (if any) back into R0. Returns `false` if
    /// the call could not be made.
    pub fn call(&self, uc: &mut Emu, returns: bool, native: usize) -> Result<bool> {
        let Some(ret) = (unsafe { native_call(native, &self.args, returns) }) else {
            return Ok(false);
        };
        if let Some(ret) = ret {
            cpu::write_gpr(uc, 0, ret)?;
        }
        Ok(true)
    }
}

macro_rules! word_ty {
    ($arg:expr) => {
        u32
    };
}

/// Call a native C function by arity. Up to six word arguments are
/// supported; more is a reportable error. Returns `None` when the call was
/// not made, `Some(None)` for a void call, `Some(Some(r))` otherwise.
///
/// Safety: `native` must be a C function taking `args.len()` word arguments.
pub(crate) unsafe fn native_call(
    native: usize,
    args: &[u32],
    returns: bool,
) -> Option<Option<u32>> {
    macro_rules! dispatch {
        ($( $n:literal => ( $($idx:tt),* ) ),* $(,)?) => {
            match args.len() {
                $(
                    $n => {
                        if returns {
                            let func: unsafe extern "C" fn($(word_ty!($idx)),*) -> u32 =
                                std::mem::transmute(native);
                            Some(Some(func($(args[$idx]),*)))
                        } else {
                            let func: unsafe extern "C" fn($(word_ty!($idx)),*) =
                                std::mem::transmute(native);
                            func($(args[$idx]),*);
                            Some(None)
                        }
                    }
                )*
                _ => {
                    log!("{}", Error::TooManyArguments);
                    None
                }
            }
        };
    }
    dispatch! {
        0 => (),
        1 => (0),
        2 => (0, 1),
        3 => (0, 1, 2),
        4 => (0, 1, 2, 3),
        5 => (0, 1, 2, 3, 4),
        6 => (0, 1, 2, 3, 4, 5),
    }
}

/// Argument packs for [call_back]. Implemented for word tuples up to the
/// four registers the callback convention can carry; longer packs don't
/// exist, so the limit holds at compile time.
pub trait CallArgs {
    fn words(&self) -> Vec<u32>;
}

macro_rules! impl_call_args {
    ( $( ($($name:ident : $idx:tt),*) ),* $(,)? ) => {
        $(
            impl CallArgs for ($(word_ty!($name),)*) {
                fn words(&self) -> Vec<u32> {
                    vec![$(self.$idx),*]
                }
            }
        )*
    };
}

impl_call_args! {
    (),
    (a: 0),
    (a: 0, b: 1),
    (a: 0, b: 1, c: 2),
    (a: 0, b: 1, c: 2, d: 3),
}

/// Call a function pointer a native component received from the guest. If
/// `fp` is emulated code, its arguments are placed in R0–R3 and the emulator
/// drives it to completion; otherwise it must be ordinary native code and is
/// called directly.
pub fn call_back<A: CallArgs>(uc: &mut Emu, fp: usize, args: A) -> Result<()> {
    let words = args.words();

    let guest_target = u32::try_from(fp).ok().and_then(|addr| {
        let dyld = &uc.get_data().dyld;
        let id = dyld.lookup(addr)?;
        dyld.entry(id).is_dylib().then_some(addr)
    });

    match guest_target {
        Some(addr) => {
            for (i, &word) in words.iter().enumerate() {
                cpu::write_gpr(uc, i as u32, word)?;
            }
            executor::execute_addr(uc, addr)
        }
        None => {
            // Not inside any emulated library, so it must be native
            // executable code.
            unsafe { native_call(fp, &words, false) };
            Ok(())
        }
    }
}

/// Like [call_back], but the callee returns a value, fetched from R0 after
/// the call.
pub fn call_back_r<A: CallArgs>(uc: &mut Emu, fp: usize, args: A) -> Result<u32> {
    call_back(uc, fp, args)?;
    cpu::read_gpr(uc, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn sum3(a: u32, b: u32, c: u32) -> u32 {
        a.wrapping_add(b).wrapping_add(c)
    }

    #[test]
    fn native_call_dispatches_by_arity() {
        let ret = unsafe { native_call(sum3 as usize, &[1, 2, 3], true) };
        assert_eq!(ret, Some(Some(6)));
    }

    #[test]
    fn native_call_rejects_seven_arguments() {
        let ret = unsafe { native_call(sum3 as usize, &[0; 7], true) };
        assert_eq!(ret, None);
    }

    #[test]
    fn call_args_word_packs() {
        assert_eq!(().words(), Vec::<u32>::new());
        assert_eq!((7u32,).words(), vec![7]);
        assert_eq!((1u32, 2u32, 3u32, 4u32).words(), vec![1, 2, 3, 4]);
    }
}
