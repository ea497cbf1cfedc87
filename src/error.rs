/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Error types for the execution core.
//!
//! Load and dispatch errors are best-effort: callers log them and carry on
//! where the emulated program can still make progress. Engine errors are
//! fatal and abort emulation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Load errors
    #[error("invalid binary type: {0}")]
    InvalidBinaryType(String),
    #[error("could not parse Mach-O file: {0}")]
    MachOParse(String),
    #[error("unsupported binary: {0}")]
    UnsupportedBinary(&'static str),
    #[error("overlapping segments (after rounding to page size)")]
    OverlappingSegments,
    #[error("unsupported relocation")]
    UnsupportedRelocation,
    #[error("unsupported binding info")]
    UnsupportedBinding,
    #[error("external symbol {symbol} from library {library} couldn't be resolved")]
    MissingSymbol { symbol: String, library: String },
    #[error("invalid file: {0}")]
    FileNotFound(String),
    #[error("couldn't load host library {path}: {reason}")]
    HostLoader { path: String, reason: String },

    // Dispatch errors
    #[error("unmapped address {0:#x} fetched")]
    UnmappedFetch(u32),
    #[error("cannot find RVA {rva:#x} in wrapper index of {wrapper}")]
    MissingWrapperEntry { rva: u32, wrapper: String },
    #[error("cannot find wrapper for {rva:#x} in {library}")]
    MissingWrapperAlias { rva: u32, library: String },
    #[error("callback not found")]
    CallbackNotFound,
    #[error("unsupported type encoding")]
    UnsupportedTypeEncoding,
    #[error("unsupported return type")]
    UnsupportedReturnType,
    #[error("function has too many arguments")]
    TooManyArguments,

    // Resource errors
    #[error("couldn't allocate memory for {0}")]
    Allocation(&'static str),
    #[error("couldn't prepare FFI closure: {0}")]
    Closure(String),

    // Emulator-engine errors (fatal)
    #[error("emulation engine failure: {0:?}")]
    Engine(unicorn_engine::unicorn_const::uc_error),
}

impl From<unicorn_engine::unicorn_const::uc_error> for Error {
    fn from(err: unicorn_engine::unicorn_const::uc_error) -> Error {
        Error::Engine(err)
    }
}
