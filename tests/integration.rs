//! End-to-end tests driving the real emulation engine with hand-built
//! ARM32 Mach-O binaries and in-process host modules.

use machsim::{Emulator, HostModule, Options, WrapperIndex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

// A32 instructions used by the test binaries.
const MOV_R0_42: u32 = 0xe3a0_002a; // mov r0, #42
const ADD_R0_R0_1: u32 = 0xe280_0001; // add r0, r0, #1
const ADD_R0_R0_R1: u32 = 0xe080_0001; // add r0, r0, r1
const ADD_R0_R0_R2: u32 = 0xe080_0002; // add r0, r0, r2
const STR_R0_R1: u32 = 0xe581_0000; // str r0, [r1]
const BX_LR: u32 = 0xe12f_ff1e; // bx lr

fn words(instrs: &[u32]) -> Vec<u8> {
    instrs.iter().flat_map(|i| i.to_le_bytes()).collect()
}

// ============================================================================
// Mach-O builder
// ============================================================================

/// File offset (and unslid address) of the test binary's code.
const CODE_ADDR: u32 = 0x400;

const MH_MAGIC: u32 = 0xfeed_face;
const CPU_TYPE_ARM: u32 = 12;
const MH_DYLIB: u32 = 0x6;
const MH_SPLIT_SEGS: u32 = 0x20;
const LC_SEGMENT: u32 = 0x1;
const LC_SYMTAB: u32 = 0x2;
const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;

#[derive(Default)]
struct BinSpec<'a> {
    code: &'a [u8],
    flags: u32,
    /// Exported symbols: name → unslid address.
    exports: &'a [(&'a str, u32)],
    /// Declare an Objective-C method at [CODE_ADDR] with this encoding.
    objc_method: Option<&'a str>,
    /// Extra 32-bit slots written at (offset, value) and registered for
    /// rebasing.
    rebase_slots: &'a [(u32, u32)],
}

fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

fn put_u32(file: &mut [u8], offset: u32, value: u32) {
    let offset = offset as usize;
    file[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_bytes(file: &mut [u8], offset: u32, bytes: &[u8]) {
    let offset = offset as usize;
    file[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn put_name(file: &mut [u8], offset: u32, name: &str) {
    assert!(name.len() <= 16);
    put_bytes(file, offset, name.as_bytes());
}

/// Build a one-segment ARM32 dylib in a 4 KiB file. Code sits at
/// [CODE_ADDR]; optional Objective-C metadata describes one method whose IMP
/// is the code. All embedded pointers carry proper rebase records.
fn build_dylib(spec: BinSpec) -> Vec<u8> {
    let mut file = vec![0u8; 0x1000];
    let mut rebase_slots: Vec<u32> = Vec::new();

    // Segment + section table.
    let seg_cmd_size: u32 = 56 + 2 * 68;
    let sizeofcmds: u32 = seg_cmd_size + 24 + 48;

    put_u32(&mut file, 0, MH_MAGIC);
    put_u32(&mut file, 4, CPU_TYPE_ARM);
    put_u32(&mut file, 8, 9); // cpusubtype: ARMv7
    put_u32(&mut file, 12, MH_DYLIB);
    put_u32(&mut file, 16, 3); // ncmds
    put_u32(&mut file, 20, sizeofcmds);
    put_u32(&mut file, 24, spec.flags);

    let seg = 28;
    put_u32(&mut file, seg, LC_SEGMENT);
    put_u32(&mut file, seg + 4, seg_cmd_size);
    put_name(&mut file, seg + 8, "__APP");
    put_u32(&mut file, seg + 24, 0); // vmaddr
    put_u32(&mut file, seg + 28, 0x1000); // vmsize
    put_u32(&mut file, seg + 32, 0); // fileoff
    put_u32(&mut file, seg + 36, 0x1000); // filesize
    put_u32(&mut file, seg + 40, 0x7); // maxprot
    put_u32(&mut file, seg + 44, 0x7); // initprot
    put_u32(&mut file, seg + 48, 2); // nsects

    let text_sect = seg + 56;
    put_name(&mut file, text_sect, "__text");
    put_name(&mut file, text_sect + 16, "__APP");
    put_u32(&mut file, text_sect + 32, CODE_ADDR); // addr
    put_u32(&mut file, text_sect + 36, 0x100); // size
    put_u32(&mut file, text_sect + 40, CODE_ADDR); // offset
    put_u32(&mut file, text_sect + 44, 2); // align

    let objc_sect = text_sect + 68;
    put_name(&mut file, objc_sect, "__objc_classlist");
    put_name(&mut file, objc_sect + 16, "__APP");
    put_u32(&mut file, objc_sect + 32, 0x600);
    put_u32(&mut file, objc_sect + 36, 4);
    put_u32(&mut file, objc_sect + 40, 0x600);
    put_u32(&mut file, objc_sect + 44, 2);

    let symtab = seg + seg_cmd_size;
    put_u32(&mut file, symtab, LC_SYMTAB);
    put_u32(&mut file, symtab + 4, 24);
    put_u32(&mut file, symtab + 8, 0x800); // symoff
    put_u32(&mut file, symtab + 12, spec.exports.len() as u32);
    put_u32(&mut file, symtab + 16, 0x900); // stroff
    put_u32(&mut file, symtab + 20, 0x100); // strsize

    let dyld_info = symtab + 24;
    put_u32(&mut file, dyld_info, LC_DYLD_INFO_ONLY);
    put_u32(&mut file, dyld_info + 4, 48);
    put_u32(&mut file, dyld_info + 8, 0xa00); // rebase_off, size patched below

    put_bytes(&mut file, CODE_ADDR, spec.code);

    if let Some(encoding) = spec.objc_method {
        // classlist entry → class_t → class_ro_t → method_list_t.
        put_u32(&mut file, 0x600, 0x610);
        put_u32(&mut file, 0x610 + 16, 0x630); // class_t.data
        put_u32(&mut file, 0x630 + 20, 0x660); // class_ro_t.baseMethods
        put_u32(&mut file, 0x660, 12); // entsize
        put_u32(&mut file, 0x664, 1); // count
        put_u32(&mut file, 0x668, 0); // method_t.name
        put_u32(&mut file, 0x66c, 0x6a0); // method_t.types
        put_u32(&mut file, 0x670, CODE_ADDR); // method_t.imp
        put_bytes(&mut file, 0x6a0, encoding.as_bytes());
        rebase_slots.extend([0x600, 0x620, 0x644, 0x66c, 0x670]);
    }

    for &(offset, value) in spec.rebase_slots {
        put_u32(&mut file, offset, value);
        rebase_slots.push(offset);
    }

    // Symbol table: one 12-byte nlist per export, names in the strtab.
    let mut strtab = vec![0u8];
    for (i, &(name, value)) in spec.exports.iter().enumerate() {
        let nlist = 0x800 + i as u32 * 12;
        put_u32(&mut file, nlist, strtab.len() as u32); // n_strx
        file[nlist as usize + 4] = 0x0f; // n_type: N_SECT | N_EXT
        file[nlist as usize + 5] = 1; // n_sect: __text
        put_u32(&mut file, nlist + 8, value);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    put_bytes(&mut file, 0x900, &strtab);

    // Rebase opcodes: pointer type, then one SET_SEGMENT_AND_OFFSET + rebase
    // per slot.
    let mut stream = vec![0x11u8];
    for slot in rebase_slots {
        stream.push(0x20);
        uleb(&mut stream, slot as u64);
        stream.push(0x51);
    }
    stream.push(0);
    put_u32(&mut file, dyld_info + 12, stream.len() as u32);
    put_bytes(&mut file, 0xa00, &stream);

    file
}

// ============================================================================
// In-process host modules
// ============================================================================

/// Host module backed by plain process memory: a claimed image range, a
/// symbol list, optionally a wrapper index and per-RVA method encodings.
struct TestModule {
    base: usize,
    size: usize,
    symbols: Vec<(String, usize)>,
    index: Option<WrapperIndex>,
    method_types: HashMap<u32, String>,
}

impl TestModule {
    fn covering(ptr: usize) -> TestModule {
        TestModule {
            base: ptr & !0xfff,
            size: 0x2000,
            symbols: Vec::new(),
            index: None,
            method_types: HashMap::new(),
        }
    }
}

impl HostModule for TestModule {
    fn base(&self) -> usize {
        self.base
    }
    fn size(&self) -> usize {
        self.size
    }
    fn symbol(&self, name: &str) -> Option<usize> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, addr)| addr)
    }
    fn wrapper_index(&self) -> Option<&WrapperIndex> {
        self.index.as_ref()
    }
    fn method_type(&self, rva: u32) -> Option<&str> {
        self.method_types.get(&rva).map(String::as_str)
    }
}

/// Page-aligned process memory standing in for a DLL image that has no real
/// code of its own.
#[repr(align(4096))]
struct PageBuf([u8; 0x2000]);

fn emulator() -> Emulator {
    Emulator::new(Options::default()).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn guest_returns_forty_two_at_top_level() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[MOV_R0_42, BX_LR]),
        ..Default::default()
    });
    let id = emu.load_mach_o_bytes("app42.dylib", &bin).unwrap();
    let start = emu.library(id).start_address;

    assert_eq!(emu.return_stack_depth(), 0);
    emu.execute(start + CODE_ADDR).unwrap();
    assert_eq!(emu.gpr(0).unwrap(), 42);
    assert_eq!(emu.return_stack_depth(), 0);
}

#[test]
fn loads_are_idempotent_and_ranges_disjoint() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[BX_LR]),
        ..Default::default()
    });
    let a = emu.load_mach_o_bytes("a.dylib", &bin).unwrap();
    let b = emu.load_mach_o_bytes("b.dylib", &bin).unwrap();
    let a_again = emu.load_mach_o_bytes("a.dylib", &bin).unwrap();
    assert_eq!(a, a_again);
    assert_ne!(a, b);

    let (lib_a, lib_b) = (emu.library(a), emu.library(b));
    let disjoint = lib_a.start_address + lib_a.size <= lib_b.start_address
        || lib_b.start_address + lib_b.size <= lib_a.start_address;
    assert!(disjoint);
}

#[test]
fn split_segs_binaries_are_rejected() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[BX_LR]),
        flags: MH_SPLIT_SEGS,
        ..Default::default()
    });
    assert!(emu.load_mach_o_bytes("split.dylib", &bin).is_err());
}

#[test]
fn rebase_slides_pointers_but_preserves_null() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[BX_LR]),
        rebase_slots: &[(0x6f0, 0), (0x6f4, CODE_ADDR)],
        ..Default::default()
    });
    let id = emu.load_mach_o_bytes("rebase.dylib", &bin).unwrap();
    let start = emu.library(id).start_address;
    assert_ne!(start, 0, "test binary must actually slide");

    assert_eq!(emu.read_u32(start + 0x6f0).unwrap(), 0);
    assert_eq!(emu.read_u32(start + 0x6f4).unwrap(), start + CODE_ADDR);
}

static WRAPPER_ARG: AtomicU32 = AtomicU32::new(0);
extern "C" fn wrapper_entry(marshal: u32) {
    WRAPPER_ARG.store(marshal, Ordering::SeqCst);
}

#[test]
fn wrapper_invocation_passes_r0_and_returns() {
    let mut emu = emulator();
    let module = TestModule::covering(wrapper_entry as usize);
    let base = module.base;
    let id = emu
        .register_host_module("gen/libw.wrapper.dll", Box::new(module))
        .unwrap();
    let lib = emu.library(id);
    assert!(lib.is_wrapper);
    let guest = lib.start_address + (wrapper_entry as usize - base) as u32;

    emu.set_gpr(0, 0xdead_beef).unwrap();
    emu.execute(guest).unwrap();

    assert_eq!(WRAPPER_ARG.load(Ordering::SeqCst), 0xdead_beef);
    assert_eq!(emu.gpr(0).unwrap(), 0xdead_beef);
    assert_eq!(emu.return_stack_depth(), 0);
}

extern "C" fn add3(a: u32, b: u32, c: u32) -> u32 {
    a.wrapping_add(b).wrapping_add(c)
}

static BAR_WRAPPER_IMG: PageBuf = PageBuf([0; 0x2000]);

#[test]
fn dynamic_translation_marshals_a_method_call() {
    let mut emu = emulator();

    let mut module = TestModule::covering(add3 as usize);
    let rva = (add3 as usize - module.base) as u32;
    module
        .method_types
        .insert(rva, "i16@0:4i8".to_string());
    let id = emu
        .register_host_module("gen/libbar.dll", Box::new(module))
        .unwrap();
    let guest = emu.library(id).start_address + rva;

    // The companion wrapper exists but its index knows nothing about this
    // address, forcing the dynamic-translation fallback.
    let mut wrapper = TestModule::covering(BAR_WRAPPER_IMG.0.as_ptr() as usize);
    wrapper.index = Some(WrapperIndex {
        map: HashMap::new(),
        dylibs: Vec::new(),
    });
    emu.register_host_module("gen/libbar.wrapper.dll", Box::new(wrapper))
        .unwrap();

    emu.set_gpr(0, 1).unwrap();
    emu.set_gpr(1, 2).unwrap();
    emu.set_gpr(2, 3).unwrap();
    emu.execute(guest).unwrap();

    assert_eq!(emu.gpr(0).unwrap(), 6);
}

static FOO_IMG: PageBuf = PageBuf([0; 0x2000]);
static FOO_WRAPPER_IMG: PageBuf = PageBuf([0; 0x2000]);

#[test]
fn wrapper_index_routes_to_guest_alias() {
    let mut emu = emulator();

    // The hand-written wrapper: a guest dylib exporting the alias for RVA
    // 4096 of libfoo.
    let bin = build_dylib(BinSpec {
        code: &words(&[ADD_R0_R0_1, BX_LR]),
        exports: &[("$__ipaSim_wraps_4096", CODE_ADDR)],
        ..Default::default()
    });
    emu.load_mach_o_bytes("wrap.dylib", &bin).unwrap();

    let foo = TestModule::covering(FOO_IMG.0.as_ptr() as usize);
    let foo_id = emu
        .register_host_module("gen/libfoo.dll", Box::new(foo))
        .unwrap();
    let foo_start = emu.library(foo_id).start_address;

    let mut wrapper = TestModule::covering(FOO_WRAPPER_IMG.0.as_ptr() as usize);
    wrapper.index = Some(WrapperIndex {
        map: HashMap::from([(4096, 0)]),
        dylibs: vec!["wrap.dylib".to_string()],
    });
    emu.register_host_module("gen/libfoo.wrapper.dll", Box::new(wrapper))
        .unwrap();

    // Offset 0 of libfoo is RVA 4096 in the wrapper index's terms.
    emu.set_gpr(0, 41).unwrap();
    emu.execute(foo_start).unwrap();

    // The guest wrapper ran under emulation with R0 intact.
    assert_eq!(emu.gpr(0).unwrap(), 42);
}

#[test]
fn unmapped_write_is_mapped_and_execution_continues() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[STR_R0_R1, BX_LR]),
        ..Default::default()
    });
    let id = emu.load_mach_o_bytes("store.dylib", &bin).unwrap();
    let start = emu.library(id).start_address;

    emu.set_gpr(0, 0xcafe_babe).unwrap();
    emu.set_gpr(1, 0x5000_0000).unwrap();
    emu.execute(start + CODE_ADDR).unwrap();

    assert_eq!(emu.read_u32(0x5000_0000).unwrap(), 0xcafe_babe);
}

#[test]
fn translated_callback_round_trips() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[ADD_R0_R0_R1, ADD_R0_R0_R2, BX_LR]),
        objc_method: Some("i16@0:4i8"),
        ..Default::default()
    });
    let id = emu.load_mach_o_bytes("cb.dylib", &bin).unwrap();
    let start = emu.library(id).start_address;
    let imp = start + CODE_ADDR;

    // The metadata scan saw the rebased method list.
    assert_eq!(emu.library(id).method_type(imp), Some("i16@0:4i8"));

    let thunk = emu.translate(imp as usize).unwrap();
    assert_ne!(thunk, 0);
    assert_ne!(thunk, imp as usize);

    let func: extern "C" fn(u32, u32, u32) -> u32 =
        unsafe { std::mem::transmute(thunk) };
    let result = emu.run_native(|| func(1, 2, 3));
    assert_eq!(result, 6);

    // Translations are cached per target and encoding.
    assert_eq!(emu.translate(imp as usize).unwrap(), thunk);
}

#[test]
fn translate_passes_native_pointers_through() {
    let mut emu = emulator();
    let native = add3 as usize;
    assert_eq!(emu.translate(native).unwrap(), native);
}

#[test]
fn translate_without_metadata_reports_missing_callback() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[BX_LR]),
        ..Default::default()
    });
    let id = emu.load_mach_o_bytes("plain.dylib", &bin).unwrap();
    let start = emu.library(id).start_address;
    assert_eq!(emu.translate((start + CODE_ADDR) as usize).unwrap(), 0);
}

#[test]
fn call_back_drives_guest_code() {
    let mut emu = emulator();
    let bin = build_dylib(BinSpec {
        code: &words(&[ADD_R0_R0_R1, ADD_R0_R0_R2, BX_LR]),
        ..Default::default()
    });
    let id = emu.load_mach_o_bytes("cb2.dylib", &bin).unwrap();
    let fp = (emu.library(id).start_address + CODE_ADDR) as usize;

    let result = emu.call_back_r(fp, (7u32, 8u32, 9u32)).unwrap();
    assert_eq!(result, 24);
    assert_eq!(emu.return_stack_depth(), 0);
}
