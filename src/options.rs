/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Management of embedder-configurable options.

use std::collections::HashMap;

/// Options affecting how binaries are loaded and dispatched. The embedder
/// fills this in before constructing an [crate::Emulator].
#[derive(Debug, Clone)]
pub struct Options {
    /// The value added to a host-library offset before looking it up in a
    /// wrapper index. Wrapper generators emit indices relative to the image's
    /// first section rather than its base, so this defaults to one page.
    pub wrapper_rva_base: u32,
    /// Per-library overrides of [Self::wrapper_rva_base], keyed by the
    /// resolved library path.
    pub wrapper_rva_base_overrides: HashMap<String, u32>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            wrapper_rva_base: 0x1000,
            wrapper_rva_base_overrides: HashMap::new(),
        }
    }
}

impl Options {
    /// Look up the wrapper-index RVA base for a library path.
    pub fn wrapper_rva_base_for(&self, path: &str) -> u32 {
        self.wrapper_rva_base_overrides
            .get(path)
            .copied()
            .unwrap_or(self.wrapper_rva_base)
    }
}
