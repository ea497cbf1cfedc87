/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Host-native library loading.
//!
//! Host libraries are re-implementations of the guest's frameworks, compiled
//! for the host and loaded with the host OS's own loader. The core never
//! executes them under emulation; it only needs their image extent (so the
//! loader can map them into the guest address space, non-executable), their
//! exported symbols, and the wrapper index if they carry one.
//!
//! [HostModule] is the seam: the real implementation sits on `libloading`,
//! and embedders (and the test suite) can provide their own modules backed by
//! plain Rust functions.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Exported name of a wrapper DLL's index record.
pub const WRAPPER_INDEX_SYMBOL: &str = "?Idx@@3UWrapperIndex@@A";

/// Exported by host DLLs that masquerade as guest dylibs; its address is the
/// embedded Mach-O header, where the library's effective range begins.
pub const MACH_HEADER_SYMBOL: &str = "_mh_dylib_header";

/// A wrapper DLL's index: which guest dylib holds the wrapper for each RVA of
/// the wrapped library.
pub struct WrapperIndex {
    /// Guest RVA → index into [Self::dylibs].
    pub map: HashMap<u32, usize>,
    pub dylibs: Vec<String>,
}

/// One loaded host-native module.
pub trait HostModule {
    /// Host address of the image's first byte.
    fn base(&self) -> usize;
    /// Image size in bytes.
    fn size(&self) -> usize;
    /// Host address of an exported symbol.
    fn symbol(&self, name: &str) -> Option<usize>;
    /// The wrapper index, for wrapper DLLs.
    fn wrapper_index(&self) -> Option<&WrapperIndex> {
        None
    }
    /// Type encoding of the method at `rva`, if the module carries method
    /// metadata for its exports.
    fn method_type(&self, _rva: u32) -> Option<&str> {
        None
    }
}

/// [HostModule] implementation over the host OS's dynamic loader.
pub struct NativeModule {
    lib: libloading::Library,
    base: usize,
    size: usize,
    wrapper_index: Option<WrapperIndex>,
}

impl NativeModule {
    pub fn open(path: &Path) -> Result<NativeModule> {
        let lib = unsafe { libloading::Library::new(path) }.map_err(|e| Error::HostLoader {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let (base, size) = module_extent(path)?;
        let mut module = NativeModule {
            lib,
            base,
            size,
            wrapper_index: None,
        };
        if let Some(idx) = module.symbol(WRAPPER_INDEX_SYMBOL) {
            // Safety: the record's layout is the wrapper-generator contract;
            // a malformed record is rejected by the bounds checks below.
            module.wrapper_index = unsafe { parse_wrapper_index(idx as *const u8) };
        }
        Ok(module)
    }
}

impl HostModule for NativeModule {
    fn base(&self) -> usize {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn symbol(&self, name: &str) -> Option<usize> {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        let sym = unsafe { self.lib.get::<*mut std::ffi::c_void>(&bytes) }.ok()?;
        Some(*sym as usize)
    }

    fn wrapper_index(&self) -> Option<&WrapperIndex> {
        self.wrapper_index.as_ref()
    }
}

/// Deserialize the index record a wrapper DLL exports under
/// [WRAPPER_INDEX_SYMBOL]:
///
/// ```text
/// u32 entry_count
/// u32 strings_len
/// entry_count × { u32 rva, u32 dylib_index }
/// strings_len bytes of NUL-terminated dylib paths, in index order
/// ```
unsafe fn parse_wrapper_index(ptr: *const u8) -> Option<WrapperIndex> {
    let read_u32 = |offset: usize| -> u32 {
        let mut buf = [0u8; 4];
        std::ptr::copy_nonoverlapping(ptr.add(offset), buf.as_mut_ptr(), 4);
        u32::from_le_bytes(buf)
    };

    let entry_count = read_u32(0) as usize;
    let strings_len = read_u32(4) as usize;
    // An index over every export of a large framework stays well under this.
    if entry_count > 0x10_0000 || strings_len > 0x10_0000 {
        log!("implausible wrapper index ({} entries)", entry_count);
        return None;
    }

    let mut map = HashMap::with_capacity(entry_count);
    for i in 0..entry_count {
        let rva = read_u32(8 + i * 8);
        let dylib = read_u32(8 + i * 8 + 4) as usize;
        map.insert(rva, dylib);
    }

    let strings_base = 8 + entry_count * 8;
    let strings = std::slice::from_raw_parts(ptr.add(strings_base), strings_len);
    let dylibs: Vec<String> = strings
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();

    for &dylib in map.values() {
        if dylib >= dylibs.len() {
            log!("wrapper index references missing dylib string {}", dylib);
            return None;
        }
    }

    Some(WrapperIndex { map, dylibs })
}

/// Find out where a loaded module lies in memory: (base, image size).
#[cfg(windows)]
fn module_extent(path: &Path) -> Result<(usize, usize)> {
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows_sys::Win32::System::ProcessStatus::{K32GetModuleInformation, MODULEINFO};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let host_error = |reason: &str| Error::HostLoader {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let mut wide: Vec<u16> = path.as_os_str().to_string_lossy().encode_utf16().collect();
    wide.push(0);
    let module = unsafe { GetModuleHandleW(wide.as_ptr()) };
    if module == 0 {
        return Err(host_error("couldn't find loaded module handle"));
    }

    let mut info = MODULEINFO {
        lpBaseOfDll: std::ptr::null_mut(),
        SizeOfImage: 0,
        EntryPoint: std::ptr::null_mut(),
    };
    let ok = unsafe {
        K32GetModuleInformation(
            GetCurrentProcess(),
            module,
            &mut info,
            std::mem::size_of::<MODULEINFO>() as u32,
        )
    };
    if ok == 0 {
        return Err(host_error("couldn't load module information"));
    }
    Ok((info.lpBaseOfDll as usize, info.SizeOfImage as usize))
}

#[cfg(target_os = "linux")]
fn module_extent(path: &Path) -> Result<(usize, usize)> {
    use std::os::unix::ffi::OsStrExt;

    let host_error = |reason: &str| Error::HostLoader {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    // The dynamic linker's link map has the load bias; the image extent comes
    // from the file's own program headers.
    #[repr(C)]
    struct LinkMap {
        l_addr: usize,
        l_name: *mut libc::c_char,
        l_ld: *mut libc::c_void,
        l_next: *mut LinkMap,
        l_prev: *mut LinkMap,
    }
    const RTLD_DI_LINKMAP: libc::c_int = 2;

    let mut cpath = path.as_os_str().as_bytes().to_vec();
    cpath.push(0);
    // RTLD_NOLOAD: retrieve the handle of the already-loaded module.
    let handle = unsafe {
        libc::dlopen(
            cpath.as_ptr().cast(),
            libc::RTLD_LAZY | libc::RTLD_NOLOAD,
        )
    };
    if handle.is_null() {
        return Err(host_error("couldn't find loaded module handle"));
    }
    let mut link_map: *mut LinkMap = std::ptr::null_mut();
    let rc = unsafe {
        libc::dlinfo(
            handle,
            RTLD_DI_LINKMAP,
            (&mut link_map as *mut *mut LinkMap).cast(),
        )
    };
    let base = if rc == 0 && !link_map.is_null() {
        unsafe { (*link_map).l_addr }
    } else {
        unsafe { libc::dlclose(handle) };
        return Err(host_error("couldn't read link map"));
    };
    unsafe { libc::dlclose(handle) };

    let bytes = std::fs::read(path).map_err(|e| host_error(&e.to_string()))?;
    let elf = goblin::elf::Elf::parse(&bytes).map_err(|e| host_error(&e.to_string()))?;
    let mut low = u64::MAX;
    let mut high = 0u64;
    for ph in &elf.program_headers {
        if ph.p_type != goblin::elf::program_header::PT_LOAD {
            continue;
        }
        low = low.min(ph.p_vaddr);
        high = high.max(ph.p_vaddr + ph.p_memsz);
    }
    if low == u64::MAX {
        return Err(host_error("module has no loadable segments"));
    }
    Ok((base + low as usize, (high - low) as usize))
}

#[cfg(not(any(windows, target_os = "linux")))]
fn module_extent(path: &Path) -> Result<(usize, usize)> {
    Err(Error::HostLoader {
        path: path.display().to_string(),
        reason: "module information is not available on this platform".to_string(),
    })
}

/// Does this buffer start like a PE file?
pub fn is_pe(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && &bytes[..2] == b"MZ"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_index_round_trip() {
        let mut record = Vec::new();
        let strings = b"Foundation.dylib\0UIKit.dylib\0";
        record.extend_from_slice(&2u32.to_le_bytes());
        record.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        record.extend_from_slice(&0x1000u32.to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&0x2040u32.to_le_bytes());
        record.extend_from_slice(&1u32.to_le_bytes());
        record.extend_from_slice(strings);

        let idx = unsafe { parse_wrapper_index(record.as_ptr()) }.unwrap();
        assert_eq!(idx.dylibs.len(), 2);
        assert_eq!(idx.map[&0x1000], 0);
        assert_eq!(idx.dylibs[idx.map[&0x2040]], "UIKit.dylib");
    }

    #[test]
    fn wrapper_index_rejects_bad_string_reference() {
        let mut record = Vec::new();
        record.extend_from_slice(&1u32.to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&0x1000u32.to_le_bytes());
        record.extend_from_slice(&7u32.to_le_bytes());

        assert!(unsafe { parse_wrapper_index(record.as_ptr()) }.is_none());
    }

    #[test]
    fn pe_magic() {
        assert!(is_pe(b"MZ\x90\0"));
        assert!(!is_pe(&0xfeedfaceu32.to_le_bytes()));
    }
}
