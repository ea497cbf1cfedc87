/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Dynamic loader and library registry.
//!
//! Guest Mach-O binaries and host-native libraries share one 32-bit guest
//! address space, owned by this module. Guest dylibs are loaded into leaked
//! host buffers and spliced into the engine at an allocated guest range, so
//! host and guest observe the same bytes; host libraries have their images
//! mapped into guest space **readable and writable but never executable**.
//! That non-executable mapping is what turns every guest call into a host
//! library into a fetch-protection fault the dispatcher can intercept.
//!
//! Libraries are created lazily on first reference and live for the process
//! lifetime; nothing is ever unloaded.

use crate::cpu;
use crate::error::{Error, Result};
use crate::executor::Emu;
use crate::host::{self, HostModule, NativeModule};
use crate::mach_o::{self, MachO};
use crate::objc::{self, MethodTypeTable};
use std::collections::HashMap;
use std::path::Path;
use unicorn_engine::unicorn_const::Prot;

/// Guest address-space layout. The kernel sentinel takes the top page, the
/// guest stack sits directly below it, and library allocations grow upward
/// from [LIB_SPACE_BASE]. The sentinel page must never overlap any library.
pub const KERNEL_ADDR: u32 = 0xffff_f000;
pub const STACK_SIZE: u32 = 8 * 1024 * 1024;
pub const STACK_BASE: u32 = KERNEL_ADDR - STACK_SIZE;
const LIB_SPACE_BASE: u32 = 0x0100_0000;

/// Index into the registry. Stable for the process lifetime.
pub type LibId = usize;

/// Alias under which a guest dylib exports a hand-written wrapper for the
/// host-library function at the given RVA.
pub fn wrapper_alias(rva: u32) -> String {
    format!("$__ipaSim_wraps_{}", rva)
}

/// Companion wrapper DLL path for a host library:
/// `gen/<stem>.wrapper.dll`.
pub fn wrapper_path_for(lib_path: &str) -> String {
    let stem = Path::new(lib_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("gen/{}.wrapper.dll", stem)
}

pub struct DylibData {
    pub bin: MachO,
    /// Offset between preferred and actual (guest) addresses.
    pub slide: u32,
    /// Leaked host buffer backing the whole image span.
    pub host_base: usize,
    pub method_types: MethodTypeTable,
    /// Slid entry-point address, if the binary declares one.
    pub entry_point: Option<u32>,
}

pub struct HostDllData {
    pub module: Box<dyn HostModule>,
    /// Host address corresponding to `start_address` (the image base, or the
    /// `_mh_dylib_header` export for Mach-O posers).
    pub host_start: usize,
    pub mach_o_poser: bool,
}

pub enum LibraryKind {
    Dylib(DylibData),
    HostDll(HostDllData),
}

pub struct LibraryEntry {
    pub path: String,
    pub start_address: u32,
    pub size: u32,
    /// Host DLLs under `gen/` named `*.wrapper.dll` contain precompiled
    /// calling-convention shims rather than re-implementations.
    pub is_wrapper: bool,
    pub kind: LibraryKind,
}

impl LibraryEntry {
    pub fn is_in_range(&self, addr: u32) -> bool {
        addr >= self.start_address && addr - self.start_address < self.size
    }

    pub fn is_dylib(&self) -> bool {
        matches!(self.kind, LibraryKind::Dylib(_))
    }

    fn host_start(&self) -> usize {
        match &self.kind {
            LibraryKind::Dylib(d) => d.host_base,
            LibraryKind::HostDll(h) => h.host_start,
        }
    }

    /// Host pointer equivalent of a guest address inside this library.
    pub fn native_ptr(&self, guest_addr: u32) -> usize {
        debug_assert!(self.is_in_range(guest_addr));
        self.host_start() + (guest_addr - self.start_address) as usize
    }

    /// Guest address equivalent of a host pointer inside this library's
    /// image, if it is inside.
    pub fn guest_addr_of(&self, host_ptr: usize) -> Option<u32> {
        let offset = host_ptr.checked_sub(self.host_start())?;
        if offset < self.size as usize {
            Some(self.start_address + offset as u32)
        } else {
            None
        }
    }

    /// Resolve an exported symbol to its guest address.
    pub fn find_symbol(&self, name: &str) -> Option<u32> {
        match &self.kind {
            LibraryKind::Dylib(d) => d
                .bin
                .exported_symbols
                .get(name)
                .map(|&addr| addr.wrapping_add(d.slide)),
            LibraryKind::HostDll(h) => {
                let host = h.module.symbol(name)?;
                self.guest_addr_of(host)
            }
        }
    }

    /// Type encoding of the method at a guest address, if known.
    pub fn method_type(&self, guest_addr: u32) -> Option<&str> {
        match &self.kind {
            LibraryKind::Dylib(d) => d.method_types.get(guest_addr),
            LibraryKind::HostDll(h) => {
                h.module.method_type(guest_addr - self.start_address)
            }
        }
    }
}

pub struct Dyld {
    entries: Vec<LibraryEntry>,
    by_path: HashMap<String, LibId>,
    next_base: u32,
}

impl Dyld {
    pub fn new() -> Dyld {
        Dyld {
            entries: Vec::new(),
            by_path: HashMap::new(),
            next_base: LIB_SPACE_BASE,
        }
    }

    pub fn entry(&self, id: LibId) -> &LibraryEntry {
        &self.entries[id]
    }

    /// Find the library whose range contains `addr`. Linear scan: the
    /// registry holds tens of libraries at most.
    pub fn lookup(&self, addr: u32) -> Option<LibId> {
        self.entries.iter().position(|e| e.is_in_range(addr))
    }

    /// Find the library whose host image contains `ptr`.
    pub fn lookup_host(&self, ptr: usize) -> Option<LibId> {
        self.entries
            .iter()
            .position(|e| e.guest_addr_of(ptr).is_some())
    }

    /// Reserve a page-aligned guest range for a new library image.
    fn alloc_guest_range(&mut self, size: u32) -> Result<u32> {
        let size = size
            .checked_add(cpu::PAGE_SIZE - 1)
            .map(cpu::align_to_page)
            .ok_or(Error::Allocation("guest address space"))?;
        let base = self.next_base;
        let Some(end) = base.checked_add(size) else {
            return Err(Error::Allocation("guest address space"));
        };
        if end > STACK_BASE {
            return Err(Error::Allocation("guest address space"));
        }
        // Leave a guard page between images so stray pointer arithmetic in
        // one library cannot silently land in the next.
        self.next_base = end + cpu::PAGE_SIZE;
        Ok(base)
    }

    fn insert(&mut self, entry: LibraryEntry) -> LibId {
        debug_assert!(self
            .entries
            .iter()
            .all(|e| e.start_address >= entry.start_address + entry.size
                || entry.start_address >= e.start_address + e.size));
        let id = self.entries.len();
        self.by_path.insert(entry.path.clone(), id);
        self.entries.push(entry);
        id
    }

    /// Resolve a guest-style path. Anything starting with `/` (e.g.
    /// `/System/Library/Frameworks/Foundation.framework/Foundation`) is
    /// rewritten to the package-relative `gen/...` location. Returns the
    /// resolved path and whether it is package-relative.
    pub fn resolve_path(path: &str) -> (String, bool) {
        if let Some(rest) = path.strip_prefix('/') {
            let resolved = format!("gen/{}", rest);
            #[cfg(windows)]
            let resolved = resolved.replace('/', "\\");
            (resolved, true)
        } else {
            (path.to_string(), Path::new(path).is_relative())
        }
    }

    fn is_wrapper_path(resolved: &str, relative: bool) -> bool {
        relative
            && (resolved.starts_with("gen/") || resolved.starts_with("gen\\"))
            && resolved.ends_with(".wrapper.dll")
    }
}

/// Load a binary, guest or host, into the unified address space. Idempotent:
/// a second load of the same path returns the existing entry.
pub(crate) fn load(uc: &mut Emu, path: &str) -> Result<LibId> {
    let (resolved, relative) = Dyld::resolve_path(path);

    if let Some(&id) = uc.get_data().dyld.by_path.get(&resolved) {
        return Ok(id);
    }

    log_dbg!("loading library {}...", resolved);

    let bytes = std::fs::read(&resolved).map_err(|_| Error::FileNotFound(resolved.clone()))?;

    if mach_o::is_mach_o(&bytes) {
        load_mach_o_common(uc, resolved, relative, &bytes)
    } else if host::is_pe(&bytes) {
        let module = NativeModule::open(Path::new(&resolved))?;
        register_host_module_common(uc, resolved, relative, Box::new(module))
    } else {
        let err = Error::InvalidBinaryType(resolved);
        log!("{}", err);
        Err(err)
    }
}

/// Load a guest binary that is already in memory. The registry key is
/// `path`; nothing is read from the file system.
pub(crate) fn load_mach_o_bytes(uc: &mut Emu, path: &str, bytes: &[u8]) -> Result<LibId> {
    let (resolved, relative) = Dyld::resolve_path(path);
    if let Some(&id) = uc.get_data().dyld.by_path.get(&resolved) {
        return Ok(id);
    }
    load_mach_o_common(uc, resolved, relative, bytes)
}

/// Register a host module the embedder constructed itself (host frameworks
/// that are linked in rather than loaded, test doubles). The module's image
/// range is mapped into the guest space like any loaded host DLL.
pub(crate) fn register_host_module(
    uc: &mut Emu,
    path: &str,
    module: Box<dyn HostModule>,
) -> Result<LibId> {
    let (resolved, relative) = Dyld::resolve_path(path);
    if let Some(&id) = uc.get_data().dyld.by_path.get(&resolved) {
        return Ok(id);
    }
    register_host_module_common(uc, resolved, relative, module)
}

fn load_mach_o_common(
    uc: &mut Emu,
    resolved: String,
    relative: bool,
    bytes: &[u8],
) -> Result<LibId> {
    let bin = MachO::from_bytes(bytes)?;

    // Segments must slide together, so compute the union of their ranges.
    // Each segment's bounds are taken at page granularity, as the engine
    // requires and the real loader does anyway.
    let mut lo = u32::MAX;
    let mut hi = 0u32;
    let mut rounded: Vec<(u32, u32)> = Vec::new();
    for seg in &bin.segments {
        let seg_lo = cpu::align_to_page(seg.vmaddr);
        let seg_hi = seg
            .vmaddr
            .checked_add(seg.vmsize)
            .map(cpu::round_to_page)
            .ok_or(Error::OverlappingSegments)?;
        if rounded.iter().any(|&(a, b)| seg_lo < b && a < seg_hi) {
            return Err(Error::OverlappingSegments);
        }
        rounded.push((seg_lo, seg_hi));
        lo = lo.min(seg_lo);
        hi = hi.max(seg_hi);
    }
    if lo >= hi {
        return Err(Error::MachOParse("binary has no loadable segments".into()));
    }
    let span = hi - lo;

    let host_base = cpu::alloc_host_pages(span)?;
    let (guest_start, slide) = {
        let dyld = &mut uc.get_data_mut().dyld;
        let guest_start = dyld.alloc_guest_range(span)?;
        (guest_start, guest_start.wrapping_sub(lo))
    };

    log_dbg!(
        "{}: image {:#x}..{:#x}, slide {:#x}",
        resolved,
        guest_start,
        guest_start + span,
        slide
    );

    // Copy segment contents into the slid image and map them with the
    // permissions the binary asks for. PROT_NONE segments have nothing to
    // copy.
    let image = unsafe { std::slice::from_raw_parts_mut(host_base, span as usize) };
    for seg in &bin.segments {
        let prot = cpu::prot_from_vm_prot(seg.initprot);
        if prot != Prot::NONE && seg.filesize > 0 {
            let file_end = seg
                .fileoff
                .checked_add(seg.filesize)
                .ok_or_else(|| Error::MachOParse(format!("segment {:?} overflows", seg.name)))?;
            let src = bytes
                .get(seg.fileoff as usize..file_end as usize)
                .ok_or_else(|| {
                    Error::MachOParse(format!("segment {:?} is outside the file", seg.name))
                })?;
            let dst_off = (seg.vmaddr - lo) as usize;
            image[dst_off..dst_off + src.len()].copy_from_slice(src);
            // The tail up to the virtual size stays zero-filled.
        }

        let map_lo = cpu::align_to_page(seg.vmaddr);
        let map_size = cpu::round_to_page(seg.vmaddr + seg.vmsize) - map_lo;
        let host_ptr = unsafe { host_base.add((map_lo - lo) as usize) };
        unsafe {
            cpu::map_host_memory(uc, map_lo.wrapping_add(slide), map_size, prot, host_ptr)?;
        }
    }

    // Rebase: slide every pointer slot the binary records, leaving null
    // words untouched so that null pointers stay null.
    if slide != 0 {
        for &va in &bin.rebases {
            let Some(offset) = va.checked_sub(lo).map(|o| o as usize) else {
                log!("relocation target out of range");
                continue;
            };
            if offset + 4 > span as usize {
                log!("relocation target out of range");
                continue;
            }
            let val = u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap());
            if val != 0 {
                image[offset..offset + 4]
                    .copy_from_slice(&val.wrapping_add(slide).to_le_bytes());
            }
        }
    }

    // Register before touching dependencies so that dependency cycles
    // resolve to this entry instead of recursing forever.
    let entry_point = bin.entry_point_addr.map(|a| a.wrapping_add(slide));
    let dynamic_libraries = bin.dynamic_libraries.clone();
    let bindings = bin.bindings.clone();
    let sections = bin.sections.clone();
    let id = uc.get_data_mut().dyld.insert(LibraryEntry {
        path: resolved.clone(),
        start_address: guest_start,
        size: span,
        is_wrapper: Dyld::is_wrapper_path(&resolved, relative),
        kind: LibraryKind::Dylib(DylibData {
            bin,
            slide,
            host_base: host_base as usize,
            method_types: MethodTypeTable::default(),
            entry_point,
        }),
    });

    // Load referenced libraries.
    for lib in &dynamic_libraries {
        if let Err(err) = load(uc, lib) {
            log!("couldn't load referenced library {}: {}", lib, err);
        }
    }

    // Bind external symbols.
    for binding in &bindings {
        if !mach_o::supported_binding(binding) {
            log!("{} for {}", Error::UnsupportedBinding, binding.symbol);
            continue;
        }
        if binding.lib_ordinal <= 0 {
            log!(
                "flat-namespace symbols are not supported yet ({})",
                binding.symbol
            );
            continue;
        }
        let Some(lib_name) = dynamic_libraries.get(binding.lib_ordinal as usize - 1) else {
            log!("binding {} has an invalid library ordinal", binding.symbol);
            continue;
        };
        let lib_id = match load(uc, lib_name) {
            Ok(lib_id) => lib_id,
            Err(_) => {
                log!("symbol's library {} couldn't be loaded", lib_name);
                continue;
            }
        };
        let Some(sym_addr) = uc.get_data().dyld.entry(lib_id).find_symbol(&binding.symbol)
        else {
            log!(
                "external symbol {} from library {} couldn't be resolved",
                binding.symbol,
                lib_name
            );
            continue;
        };

        let target = binding.address.wrapping_add(slide);
        let Some(offset) = target.checked_sub(guest_start).map(|o| o as usize) else {
            log!("binding target out of range");
            continue;
        };
        if offset + 4 > span as usize {
            log!("binding target out of range");
            continue;
        }
        image[offset..offset + 4].copy_from_slice(&sym_addr.to_le_bytes());
    }

    // With pointers final, collect the Objective-C method metadata that
    // dynamic translation and callback trampolines rely on.
    let table = {
        let view = objc::ImageView {
            bytes: unsafe { std::slice::from_raw_parts(host_base, span as usize) },
            guest_base: guest_start,
        };
        objc::scan_method_types(&view, &sections, slide)
    };
    let dyld = &mut uc.get_data_mut().dyld;
    if let LibraryKind::Dylib(data) = &mut dyld.entries[id].kind {
        data.method_types = table;
    }

    Ok(id)
}

fn register_host_module_common(
    uc: &mut Emu,
    resolved: String,
    relative: bool,
    module: Box<dyn HostModule>,
) -> Result<LibId> {
    let base = module.base();
    let image_size = module.size();

    // Host DLLs that pose as guest dylibs begin at their embedded Mach-O
    // header rather than at the PE image base.
    let (host_start, size, mach_o_poser) = match module.symbol(host::MACH_HEADER_SYMBOL) {
        Some(hdr) if hdr >= base && hdr - base < image_size => {
            (hdr, image_size - (hdr - base), true)
        }
        _ => (base, image_size, false),
    };

    let host_lo = cpu::align_host_to_page(host_start);
    let head = (host_start - host_lo) as u32;
    let map_size = cpu::round_to_page(
        u32::try_from(size).map_err(|_| Error::Allocation("guest address space"))? + head,
    );

    let guest_lo = uc.get_data_mut().dyld.alloc_guest_range(map_size)?;

    // Readable and writable, but never executable: every guest jump into
    // this image must fault into the dispatcher.
    unsafe {
        cpu::map_host_memory(
            uc,
            guest_lo,
            map_size,
            Prot::READ | Prot::WRITE,
            host_lo as *mut u8,
        )?;
    }

    let start_address = guest_lo + head;
    log_dbg!(
        "{}: host image at {:#x}..{:#x} (poser: {})",
        resolved,
        start_address,
        start_address as u64 + size as u64,
        mach_o_poser
    );

    let id = uc.get_data_mut().dyld.insert(LibraryEntry {
        path: resolved.clone(),
        start_address,
        size: size as u32,
        is_wrapper: Dyld::is_wrapper_path(&resolved, relative),
        kind: LibraryKind::HostDll(HostDllData {
            module,
            host_start,
            mach_o_poser,
        }),
    });
    Ok(id)
}

/// Load a host library and call one of its exported functions natively, with
/// up to one word argument. Used for guest runtime initialization.
pub(crate) fn call_host_function(uc: &mut Emu, lib: &str, func: &str, arg: Option<u32>) -> Result<()> {
    let id = load(uc, lib)?;
    let dyld = &uc.get_data().dyld;
    let entry = dyld.entry(id);
    let guest_addr = entry.find_symbol(func).ok_or(Error::MissingSymbol {
        symbol: func.to_string(),
        library: lib.to_string(),
    })?;
    let native = entry.native_ptr(guest_addr);
    unsafe {
        match arg {
            Some(arg) => {
                let f: unsafe extern "C" fn(u32) = std::mem::transmute(native);
                f(arg)
            }
            None => {
                let f: unsafe extern "C" fn() = std::mem::transmute(native);
                f()
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_resolution() {
        let (resolved, relative) =
            Dyld::resolve_path("/System/Library/Frameworks/Foundation.framework/Foundation");
        assert!(relative);
        #[cfg(not(windows))]
        assert_eq!(
            resolved,
            "gen/System/Library/Frameworks/Foundation.framework/Foundation"
        );
        #[cfg(windows)]
        assert_eq!(
            resolved,
            "gen\\System\\Library\\Frameworks\\Foundation.framework\\Foundation"
        );

        let (resolved, relative) = Dyld::resolve_path("gen/libobjc.dll");
        assert!(relative);
        assert_eq!(resolved, "gen/libobjc.dll");
    }

    #[test]
    fn wrapper_recognition() {
        assert!(Dyld::is_wrapper_path("gen/UIKit.wrapper.dll", true));
        assert!(Dyld::is_wrapper_path("gen\\UIKit.wrapper.dll", true));
        assert!(!Dyld::is_wrapper_path("gen/UIKit.dll", true));
        assert!(!Dyld::is_wrapper_path("UIKit.wrapper.dll", true));
        assert!(!Dyld::is_wrapper_path("gen/UIKit.wrapper.dll", false));
    }

    #[test]
    fn wrapper_path_derivation() {
        assert_eq!(wrapper_path_for("gen/libfoo.dll"), "gen/libfoo.wrapper.dll");
        assert_eq!(wrapper_path_for("libbar.dll"), "gen/libbar.wrapper.dll");
    }

    #[test]
    fn alias_naming() {
        assert_eq!(wrapper_alias(4096), "$__ipaSim_wraps_4096");
    }

    #[test]
    fn guest_ranges_stay_disjoint_and_bounded() {
        let mut dyld = Dyld::new();
        let a = dyld.alloc_guest_range(0x1001).unwrap();
        let b = dyld.alloc_guest_range(0x1000).unwrap();
        assert!(a + 0x2000 <= b);
        assert_eq!(a % cpu::PAGE_SIZE, 0);
        assert_eq!(b % cpu::PAGE_SIZE, 0);
        assert!(dyld.alloc_guest_range(u32::MAX).is_err());
    }

    #[test]
    fn library_range_translation() {
        let entry = LibraryEntry {
            path: "gen/test.dll".to_string(),
            start_address: 0x0200_0000,
            size: 0x2000,
            is_wrapper: false,
            kind: LibraryKind::HostDll(HostDllData {
                module: Box::new(EmptyModule),
                host_start: 0x7000_0000,
                mach_o_poser: false,
            }),
        };
        assert!(entry.is_in_range(0x0200_0000));
        assert!(entry.is_in_range(0x0200_1fff));
        assert!(!entry.is_in_range(0x0200_2000));
        assert_eq!(entry.native_ptr(0x0200_0010), 0x7000_0010);
        assert_eq!(entry.guest_addr_of(0x7000_0010), Some(0x0200_0010));
        assert_eq!(entry.guest_addr_of(0x7000_2000), None);
    }

    struct EmptyModule;
    impl HostModule for EmptyModule {
        fn base(&self) -> usize {
            0x7000_0000
        }
        fn size(&self) -> usize {
            0x2000
        }
        fn symbol(&self, _name: &str) -> Option<usize> {
            None
        }
    }
}
