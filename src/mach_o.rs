/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reading of Mach-O files, the executable and library format on iPhone OS.
//!
//! Implemented using the mach_object crate. All usage of that crate should be
//! confined to this module. The goal is to read the Mach-O binary exactly
//! once, storing any information we'll need later: segments, the symbol
//! table, referenced libraries, and the dyldinfo rebase/bind records.
//!
//! The rebase and bind opcode streams are interpreted here directly; the
//! parsing crate only hands us their file offsets.

use crate::error::{Error, Result};
use mach_object::{DyLib, LoadCommand, MachCommand, OFile, Symbol, SymbolIter};
use std::collections::HashMap;
use std::io::{Cursor, Seek, SeekFrom};

// Header constants not re-exported by the parsing crate.
const MH_EXECUTE: u32 = 0x2;
const MH_DYLIB: u32 = 0x6;
const MH_BUNDLE: u32 = 0x8;
const MH_SPLIT_SEGS: u32 = 0x20;
const MH_PIE: u32 = 0x0020_0000;

/// One load-command segment, in unslid (preferred-address) terms.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    /// Mach-O VM protection bits (`VM_PROT_*`).
    pub initprot: u32,
}

/// One section, kept for the Objective-C metadata scan.
#[derive(Debug, Clone)]
pub struct Section {
    pub segname: String,
    pub sectname: String,
    pub addr: u32,
    pub size: u32,
}

/// Which dyldinfo stream a binding record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindClass {
    Standard,
    Lazy,
    Weak,
}

/// A resolved-at-load external reference: "write the address of `symbol`
/// (from the library at `lib_ordinal`) at `address`".
#[derive(Debug, Clone)]
pub struct Binding {
    /// Unslid virtual address of the pointer slot.
    pub address: u32,
    pub symbol: String,
    /// One-based index into [MachO::dynamic_libraries]; zero or negative
    /// values are the flat-namespace special ordinals.
    pub lib_ordinal: i64,
    /// `BIND_TYPE_*`; only pointer (1) is supported downstream.
    pub bind_type: u8,
    pub addend: i64,
    pub class: BindClass,
}

pub struct MachO {
    /// Unslid virtual address of the entry point, if any.
    pub entry_point_addr: Option<u32>,
    pub segments: Vec<Segment>,
    pub sections: Vec<Section>,
    /// Install names of libraries this binary links against, in order.
    /// Binding ordinals index into this list (one-based).
    pub dynamic_libraries: Vec<String>,
    /// Unslid virtual addresses of 32-bit words that must be slid.
    pub rebases: Vec<u32>,
    pub bindings: Vec<Binding>,
    /// Defined (exported) symbols: name → unslid virtual address.
    pub exported_symbols: HashMap<String, u32>,
}

/// Does this buffer start like a 32-bit little-endian Mach-O file?
pub fn is_mach_o(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && u32::from_le_bytes(bytes[..4].try_into().unwrap()) == 0xfeed_face
}

impl MachO {
    /// Whether the file's segments may be placed anywhere (dylib, bundle, or
    /// position-independent executable). Everything else must load at its
    /// preferred address, which a shared guest address space cannot offer.
    fn can_segments_slide(filetype: u32, flags: u32) -> bool {
        filetype == MH_DYLIB
            || filetype == MH_BUNDLE
            || (filetype == MH_EXECUTE && flags & MH_PIE != 0)
    }

    /// Parse a Mach-O binary (provided as `bytes`) and return a struct
    /// containing everything the loader needs. Nothing is mapped here.
    pub fn from_bytes(bytes: &[u8]) -> Result<MachO> {
        let mut cursor = Cursor::new(bytes);

        let file = OFile::parse(&mut cursor)
            .map_err(|_| Error::MachOParse("could not parse Mach-O file".into()))?;

        let (header, commands) = match file {
            OFile::MachFile { header, commands } => (header, commands),
            OFile::FatFile { .. } => {
                return Err(Error::UnsupportedBinary("fat binaries are not supported"));
            }
            OFile::ArFile { .. } | OFile::SymDef { .. } => {
                return Err(Error::UnsupportedBinary("not an executable or library"));
            }
        };

        if header.cputype != mach_object::CPU_TYPE_ARM {
            return Err(Error::UnsupportedBinary("expected ARM binary"));
        }
        if header.is_bigend() {
            return Err(Error::UnsupportedBinary("binary is not little-endian"));
        }
        if header.is_64bit() {
            return Err(Error::UnsupportedBinary("binary is not 32-bit"));
        }
        // Segments must be continuous so that one slide moves them together.
        if header.flags & MH_SPLIT_SEGS != 0 {
            return Err(Error::UnsupportedBinary("MH_SPLIT_SEGS not supported"));
        }
        if !Self::can_segments_slide(header.filetype, header.flags) {
            return Err(Error::UnsupportedBinary("the binary is not slideable"));
        }

        let mut macho = MachO {
            entry_point_addr: None,
            segments: Vec::new(),
            sections: Vec::new(),
            dynamic_libraries: Vec::new(),
            rebases: Vec::new(),
            bindings: Vec::new(),
            exported_symbols: HashMap::new(),
        };

        let mut all_sections = Vec::new();
        let mut entry_file_offset: Option<u32> = None;
        let mut dyld_info: Option<(u32, u32, u32, u32, u32, u32, u32, u32)> = None;

        for MachCommand(command, _size) in commands {
            match command {
                LoadCommand::Segment {
                    segname,
                    vmaddr,
                    vmsize,
                    fileoff,
                    filesize,
                    initprot,
                    sections,
                    ..
                } => {
                    if filesize > vmsize {
                        return Err(Error::MachOParse(format!(
                            "segment {:?} file size exceeds VM size",
                            segname
                        )));
                    }
                    macho.segments.push(Segment {
                        name: segname,
                        vmaddr: vmaddr as u32,
                        vmsize: vmsize as u32,
                        fileoff: fileoff as u32,
                        filesize: filesize as u32,
                        initprot: initprot as u32,
                    });
                    for section in &sections {
                        macho.sections.push(Section {
                            segname: section.segname.clone(),
                            sectname: section.sectname.clone(),
                            addr: section.addr as u32,
                            size: section.size as u32,
                        });
                    }
                    all_sections.extend_from_slice(&sections);
                }
                LoadCommand::SymTab {
                    symoff,
                    nsyms,
                    stroff,
                    strsize,
                } => {
                    if cursor.seek(SeekFrom::Start(symoff.into())).is_ok() {
                        let mut cursor = cursor.clone();
                        let symbols = SymbolIter::new(
                            &mut cursor,
                            all_sections.clone(),
                            nsyms,
                            stroff,
                            strsize,
                            /* big endian: */ false,
                            /* 64-bit: */ false,
                        );
                        for symbol in symbols {
                            if let Symbol::Debug { .. } = symbol {
                                continue;
                            }
                            if let Symbol::Defined {
                                name: Some(name),
                                entry,
                                ..
                            } = symbol
                            {
                                if name == "start" {
                                    macho.entry_point_addr = Some(entry as u32);
                                }
                                macho
                                    .exported_symbols
                                    .insert(name.to_string(), entry as u32);
                            }
                        }
                    }
                }
                LoadCommand::EncryptionInfo { id, .. } => {
                    if id != 0 {
                        return Err(Error::UnsupportedBinary("the binary is encrypted"));
                    }
                }
                LoadCommand::LoadDyLib(DyLib { name, .. }) => {
                    macho.dynamic_libraries.push(name.1.clone());
                }
                LoadCommand::EntryPoint { entryoff, .. } => {
                    entry_file_offset = Some(entryoff as u32);
                }
                LoadCommand::DyldInfo {
                    rebase_off,
                    rebase_size,
                    bind_off,
                    bind_size,
                    weak_bind_off,
                    weak_bind_size,
                    lazy_bind_off,
                    lazy_bind_size,
                    ..
                } => {
                    dyld_info = Some((
                        rebase_off,
                        rebase_size,
                        bind_off,
                        bind_size,
                        weak_bind_off,
                        weak_bind_size,
                        lazy_bind_off,
                        lazy_bind_size,
                    ));
                }
                _ => (),
            }
        }

        // The entry-point command's offset is relative to the file start,
        // which coincides with __TEXT for every binary we accept.
        if let Some(entryoff) = entry_file_offset {
            let text = macho
                .segments
                .iter()
                .find(|seg| seg.name == "__TEXT")
                .map_or(0, |seg| seg.vmaddr);
            macho.entry_point_addr = Some(text.wrapping_add(entryoff));
        }

        if let Some((
            rebase_off,
            rebase_size,
            bind_off,
            bind_size,
            weak_bind_off,
            weak_bind_size,
            lazy_bind_off,
            lazy_bind_size,
        )) = dyld_info
        {
            fn stream(bytes: &[u8], off: u32, size: u32) -> &[u8] {
                bytes
                    .get(off as usize..off as usize + size as usize)
                    .unwrap_or_default()
            }
            macho.rebases = parse_rebase_info(stream(bytes, rebase_off, rebase_size), &macho.segments);
            macho.bindings.extend(parse_bind_info(
                stream(bytes, bind_off, bind_size),
                &macho.segments,
                BindClass::Standard,
            ));
            macho.bindings.extend(parse_bind_info(
                stream(bytes, weak_bind_off, weak_bind_size),
                &macho.segments,
                BindClass::Weak,
            ));
            macho.bindings.extend(parse_bind_info(
                stream(bytes, lazy_bind_off, lazy_bind_size),
                &macho.segments,
                BindClass::Lazy,
            ));
        }

        Ok(macho)
    }
}

/// Read a ULEB128-encoded unsigned integer, advancing `pos`.
fn read_uleb128(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}

/// Read a SLEB128-encoded signed integer, advancing `pos`.
fn read_sleb128(data: &[u8], pos: &mut usize) -> Option<i64> {
    let mut result = 0i64;
    let mut shift = 0;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7f) as i64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Some(result);
        }
    }
}

/// Read a NUL-terminated string, advancing `pos` past the terminator.
fn read_cstr(data: &[u8], pos: &mut usize) -> Option<String> {
    let start = *pos;
    while *data.get(*pos)? != 0 {
        *pos += 1;
    }
    let s = String::from_utf8_lossy(&data[start..*pos]).into_owned();
    *pos += 1;
    s.into()
}

const REBASE_TYPE_POINTER: u8 = 1;
const BIND_TYPE_POINTER: u8 = 1;

/// Pointer size of the guest, which scales the `*_IMM_SCALED` opcodes and the
/// implicit slot advance after each rebase/bind.
const PTR_SIZE: u64 = 4;

fn seg_addr(segments: &[Segment], seg_index: u8, offset: u64) -> Option<u32> {
    let seg = segments.get(seg_index as usize)?;
    let addr = (seg.vmaddr as u64).checked_add(offset)?;
    u32::try_from(addr).ok()
}

/// Interpret a `rebase_off` opcode stream into the unslid addresses of the
/// pointer slots that must be slid.
fn parse_rebase_info(data: &[u8], segments: &[Segment]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut rebase_type = 0u8;
    let mut seg_index = 0u8;
    let mut offset = 0u64;

    let mut emit = |seg_index: u8, offset: u64, rebase_type: u8, out: &mut Vec<u32>| {
        // Text-relative rebase kinds are PC-relative fixups we can't apply.
        if rebase_type != REBASE_TYPE_POINTER {
            log!("{} (type {})", Error::UnsupportedRelocation, rebase_type);
            return;
        }
        match seg_addr(segments, seg_index, offset) {
            Some(addr) => out.push(addr),
            None => log!("relocation target out of range"),
        }
    };

    while pos < data.len() {
        let opcode = data[pos];
        pos += 1;
        let imm = opcode & 0x0f;
        match opcode & 0xf0 {
            0x00 => break, // REBASE_OPCODE_DONE
            0x10 => rebase_type = imm,
            0x20 => {
                // SET_SEGMENT_AND_OFFSET_ULEB
                seg_index = imm;
                let Some(uleb) = read_uleb128(data, &mut pos) else {
                    break;
                };
                offset = uleb;
            }
            0x30 => {
                // ADD_ADDR_ULEB
                let Some(uleb) = read_uleb128(data, &mut pos) else {
                    break;
                };
                offset = offset.wrapping_add(uleb);
            }
            0x40 => {
                // ADD_ADDR_IMM_SCALED
                offset = offset.wrapping_add(imm as u64 * PTR_SIZE);
            }
            0x50 => {
                // DO_REBASE_IMM_TIMES
                for _ in 0..imm {
                    emit(seg_index, offset, rebase_type, &mut out);
                    offset += PTR_SIZE;
                }
            }
            0x60 => {
                // DO_REBASE_ULEB_TIMES
                let Some(count) = read_uleb128(data, &mut pos) else {
                    break;
                };
                for _ in 0..count {
                    emit(seg_index, offset, rebase_type, &mut out);
                    offset += PTR_SIZE;
                }
            }
            0x70 => {
                // DO_REBASE_ADD_ADDR_ULEB
                emit(seg_index, offset, rebase_type, &mut out);
                let Some(uleb) = read_uleb128(data, &mut pos) else {
                    break;
                };
                offset = offset.wrapping_add(uleb) + PTR_SIZE;
            }
            0x80 => {
                // DO_REBASE_ULEB_TIMES_SKIPPING_ULEB
                let Some(count) = read_uleb128(data, &mut pos) else {
                    break;
                };
                let Some(skip) = read_uleb128(data, &mut pos) else {
                    break;
                };
                for _ in 0..count {
                    emit(seg_index, offset, rebase_type, &mut out);
                    offset = offset.wrapping_add(skip) + PTR_SIZE;
                }
            }
            _ => {
                log!("unknown rebase opcode {:#04x}", opcode);
                break;
            }
        }
    }
    out
}

/// Interpret a bind opcode stream into [Binding] records. `class` tags which
/// stream this is; in the lazy stream, `BIND_OPCODE_DONE` merely separates
/// entries, so it does not terminate interpretation there.
fn parse_bind_info(data: &[u8], segments: &[Segment], class: BindClass) -> Vec<Binding> {
    let mut out = Vec::new();
    let mut pos = 0;

    let mut symbol = String::new();
    let mut lib_ordinal = 0i64;
    let mut bind_type = 0u8;
    let mut addend = 0i64;
    let mut seg_index = 0u8;
    let mut offset = 0u64;

    macro_rules! emit {
        () => {
            match seg_addr(segments, seg_index, offset) {
                Some(address) => out.push(Binding {
                    address,
                    symbol: symbol.clone(),
                    lib_ordinal,
                    bind_type,
                    addend,
                    class,
                }),
                None => log!("binding target out of range"),
            }
        };
    }

    while pos < data.len() {
        let opcode = data[pos];
        pos += 1;
        let imm = opcode & 0x0f;
        match opcode & 0xf0 {
            0x00 => {
                // BIND_OPCODE_DONE
                if class != BindClass::Lazy {
                    break;
                }
            }
            0x10 => lib_ordinal = imm as i64, // SET_DYLIB_ORDINAL_IMM
            0x20 => {
                // SET_DYLIB_ORDINAL_ULEB
                let Some(uleb) = read_uleb128(data, &mut pos) else {
                    break;
                };
                lib_ordinal = uleb as i64;
            }
            0x30 => {
                // SET_DYLIB_SPECIAL_IMM: sign-extended special ordinals
                // (self / main executable / flat lookup), all non-positive.
                lib_ordinal = if imm == 0 { 0 } else { (imm as i64) - 16 };
            }
            0x40 => {
                // SET_SYMBOL_TRAILING_FLAGS_IMM
                let Some(name) = read_cstr(data, &mut pos) else {
                    break;
                };
                symbol = name;
            }
            0x50 => bind_type = imm, // SET_TYPE_IMM
            0x60 => {
                // SET_ADDEND_SLEB
                let Some(sleb) = read_sleb128(data, &mut pos) else {
                    break;
                };
                addend = sleb;
            }
            0x70 => {
                // SET_SEGMENT_AND_OFFSET_ULEB
                seg_index = imm;
                let Some(uleb) = read_uleb128(data, &mut pos) else {
                    break;
                };
                offset = uleb;
            }
            0x80 => {
                // ADD_ADDR_ULEB
                let Some(uleb) = read_uleb128(data, &mut pos) else {
                    break;
                };
                offset = offset.wrapping_add(uleb);
            }
            0x90 => {
                // DO_BIND
                emit!();
                offset += PTR_SIZE;
            }
            0xa0 => {
                // DO_BIND_ADD_ADDR_ULEB
                emit!();
                let Some(uleb) = read_uleb128(data, &mut pos) else {
                    break;
                };
                offset = offset.wrapping_add(uleb) + PTR_SIZE;
            }
            0xb0 => {
                // DO_BIND_ADD_ADDR_IMM_SCALED
                emit!();
                offset = offset.wrapping_add(imm as u64 * PTR_SIZE) + PTR_SIZE;
            }
            0xc0 => {
                // DO_BIND_ULEB_TIMES_SKIPPING_ULEB
                let Some(count) = read_uleb128(data, &mut pos) else {
                    break;
                };
                let Some(skip) = read_uleb128(data, &mut pos) else {
                    break;
                };
                for _ in 0..count {
                    emit!();
                    offset = offset.wrapping_add(skip) + PTR_SIZE;
                }
            }
            _ => {
                log!("unknown bind opcode {:#04x}", opcode);
                break;
            }
        }
    }
    out
}

pub fn supported_binding(binding: &Binding) -> bool {
    (binding.class == BindClass::Standard || binding.class == BindClass::Lazy)
        && binding.bind_type == BIND_TYPE_POINTER
        && binding.addend == 0
}
