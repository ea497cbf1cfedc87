/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Objective-C method metadata.
//!
//! Two things live here: the decoder for Objective-C type-encoding strings
//! (`"i16@0:4i8"` and friends), and the scan that walks a loaded image's
//! class and category lists to build an `IMP address → type encoding` table.
//! The dispatcher uses that table to marshal calls for which no precompiled
//! wrapper exists, and the trampoline allocator uses it in the other
//! direction for callbacks.
//!
//! The structure layouts are the 32-bit "objc2" ABI used on iPhone OS. A
//! useful cross-check for the layouts is what Ghidra shows for `class_t`,
//! `class_ro_t` and `method_list_t` in app binaries.

use crate::mach_o::Section;
use std::collections::HashMap;

/// Decoder for Objective-C type-encoding strings, yielding byte sizes.
///
/// The first decoded type is the return type; the rest are argument types.
/// Trailing ASCII digits (stack-offset hints) are skipped after each type.
pub struct TypeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> TypeDecoder<'a> {
    /// Sentinel returned for encodings the decoder does not understand.
    pub const INVALID_SIZE: usize = usize::MAX;

    pub fn new(encoding: &'a str) -> TypeDecoder<'a> {
        TypeDecoder {
            bytes: encoding.as_bytes(),
            pos: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.bytes.len()
    }

    /// Size in bytes of the next type in the encoding, or
    /// [Self::INVALID_SIZE]. Advances past the type and its offset digits.
    pub fn next_type_size(&mut self) -> usize {
        let result = self.next_type_size_impl();

        // Skip the last character of the type, then its offset digits.
        self.pos += 1;
        while matches!(self.bytes.get(self.pos), Some(b'0'..=b'9')) {
            self.pos += 1;
        }

        result
    }

    fn next_type_size_impl(&mut self) -> usize {
        match self.bytes.get(self.pos) {
            Some(b'v') => 0,
            Some(b'c' | b'@' | b':' | b'i' | b'I' | b'f') => 4,
            Some(b'^') => {
                // Pointer to anything is still just a pointer.
                self.pos += 1;
                self.next_type_size_impl();
                4
            }
            Some(b'{') => {
                // Skip the struct's name.
                self.pos += 1;
                loop {
                    match self.bytes.get(self.pos) {
                        Some(b'=') => break,
                        Some(_) => self.pos += 1,
                        None => {
                            log!("struct type ended unexpectedly");
                            return Self::INVALID_SIZE;
                        }
                    }
                }
                self.pos += 1;

                // Sum the field sizes (the struct can also be empty).
                let mut total = 0;
                while self.bytes.get(self.pos) != Some(&b'}') {
                    let size = self.next_type_size();
                    if size == Self::INVALID_SIZE {
                        return Self::INVALID_SIZE;
                    }
                    total += size;
                }
                total
            }
            _ => {
                log!("{}", crate::error::Error::UnsupportedTypeEncoding);
                Self::INVALID_SIZE
            }
        }
    }
}

/// `IMP address → type-encoding string`, for every method an image defines.
/// Addresses are slid and have the Thumb bit stripped.
#[derive(Default)]
pub struct MethodTypeTable {
    types: HashMap<u32, String>,
}

impl MethodTypeTable {
    pub fn get(&self, addr: u32) -> Option<&str> {
        self.types.get(&(addr & !1)).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn insert(&mut self, imp: u32, encoding: String) {
        self.types.insert(imp & !1, encoding);
    }
}

/// Read-only view of a loaded (slid, rebased) image: a host slice plus the
/// guest address of its first byte.
pub struct ImageView<'a> {
    pub bytes: &'a [u8],
    pub guest_base: u32,
}

impl<'a> ImageView<'a> {
    fn read_u32(&self, addr: u32) -> Option<u32> {
        let offset = addr.checked_sub(self.guest_base)? as usize;
        let bytes = self.bytes.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn cstr_at(&self, addr: u32) -> Option<String> {
        let start = addr.checked_sub(self.guest_base)? as usize;
        let mut end = start;
        while *self.bytes.get(end)? != 0 {
            end += 1;
        }
        Some(String::from_utf8_lossy(&self.bytes[start..end]).into_owned())
    }
}

// Offsets within the 32-bit runtime structures.
const CLASS_T_ISA: u32 = 0;
const CLASS_T_DATA: u32 = 16;
const CLASS_RO_T_BASE_METHODS: u32 = 20;
const CATEGORY_T_INSTANCE_METHODS: u32 = 8;
const CATEGORY_T_CLASS_METHODS: u32 = 12;

// The class's data field carries runtime flags in its low bits.
const FAST_DATA_MASK: u32 = !0x3;

/// Walk an image's `__objc_classlist` and `__objc_catlist` sections and
/// collect every method's type encoding. Everything is best-effort: a
/// malformed or unexpected structure skips that entry, never fails the load.
pub fn scan_method_types(
    image: &ImageView,
    sections: &[Section],
    slide: u32,
) -> MethodTypeTable {
    let mut table = MethodTypeTable::default();

    for section in sections {
        let is_classlist = section.sectname == "__objc_classlist";
        let is_catlist = section.sectname == "__objc_catlist";
        if !is_classlist && !is_catlist {
            continue;
        }

        let base = section.addr.wrapping_add(slide);
        let count = section.size / 4;
        for i in 0..count {
            let Some(ptr) = image.read_u32(base + i * 4) else {
                break;
            };
            if ptr == 0 {
                continue;
            }
            if is_classlist {
                scan_class(image, ptr, &mut table);
            } else {
                scan_category(image, ptr, &mut table);
            }
        }
    }

    table
}

fn scan_class(image: &ImageView, class: u32, table: &mut MethodTypeTable) {
    scan_class_methods(image, class, table);
    // The metaclass (via isa) holds the class methods.
    if let Some(isa) = image.read_u32(class + CLASS_T_ISA) {
        scan_class_methods(image, isa, table);
    }
}

fn scan_class_methods(image: &ImageView, class: u32, table: &mut MethodTypeTable) {
    let Some(data) = image.read_u32(class + CLASS_T_DATA) else {
        return;
    };
    let ro = data & FAST_DATA_MASK;
    let Some(methods) = image.read_u32(ro + CLASS_RO_T_BASE_METHODS) else {
        return;
    };
    if methods != 0 {
        scan_method_list(image, methods, table);
    }
}

fn scan_category(image: &ImageView, category: u32, table: &mut MethodTypeTable) {
    for field in [CATEGORY_T_INSTANCE_METHODS, CATEGORY_T_CLASS_METHODS] {
        let Some(methods) = image.read_u32(category + field) else {
            continue;
        };
        if methods != 0 {
            scan_method_list(image, methods, table);
        }
    }
}

fn scan_method_list(image: &ImageView, list: u32, table: &mut MethodTypeTable) {
    // method_list_t: entsize_and_flags, count, then `count` method_t entries
    // of `entsize` bytes each: { name (SEL), types (char *), imp }.
    let Some(entsize_and_flags) = image.read_u32(list) else {
        return;
    };
    let entsize = entsize_and_flags & !0x3;
    let Some(count) = image.read_u32(list + 4) else {
        return;
    };
    if entsize < 12 {
        log!("unexpected method entry size {}", entsize);
        return;
    }

    for i in 0..count {
        let method = list + 8 + i * entsize;
        let Some(types_ptr) = image.read_u32(method + 4) else {
            return;
        };
        let Some(imp) = image.read_u32(method + 8) else {
            return;
        };
        let Some(encoding) = image.cstr_at(types_ptr) else {
            continue;
        };
        table.insert(imp, encoding);
    }
}
