// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Palette (CLUT) management.
//!
//! Keeps two fixed 16 KiB buffers: the palette bytes as loaded from guest
//! memory, and a host-order converted copy for the 16-bit formats. The
//! palette hash doubles as a cache-key component, so it is computed here
//! alongside conversion. Also detects the "alpha-linear" palette shape
//! (fonts: alpha ramp in the low nibble, one shared color) that unlocks a
//! table-free 4-bit decode.

use rupsp_common::GuestMemory;

use crate::convert::{clut_dest_format, convert_colors};
use crate::gpu_state::{GpuState, PaletteFormat};
use crate::hash;

/// Palette buffer capacity in u32 words (16 KiB).
pub const CLUT_BUF_ENTRIES: usize = 4096;

/// Sentinel for "no format converted yet".
const CLUT_FORMAT_DIRTY: u32 = 0xFFFF_FFFF;

pub struct ClutManager {
    raw: Box<[u32; CLUT_BUF_ENTRIES]>,
    converted: Box<[u32; CLUT_BUF_ENTRIES]>,
    /// Which buffer the decoders should index: false = raw (8888), true =
    /// converted (16-bit formats).
    use_converted: bool,
    /// Bytes loaded by the last CLUT load command.
    total_bytes: u32,
    /// `clutformat` register value the conversion was done for.
    last_format: u32,
    hash: u32,
    alpha_linear: bool,
    alpha_linear_color: u16,
}

impl ClutManager {
    pub fn new() -> Self {
        Self {
            raw: Box::new([0; CLUT_BUF_ENTRIES]),
            converted: Box::new([0; CLUT_BUF_ENTRIES]),
            use_converted: false,
            total_bytes: 0,
            last_format: CLUT_FORMAT_DIRTY,
            hash: 0,
            alpha_linear: false,
            alpha_linear_color: 0,
        }
    }

    /// Copy palette bytes from the guest CLUT address. Bytes outside valid
    /// guest memory load as 0xFF. Marks the conversion stale.
    pub fn load(&mut self, gstate: &GpuState, mem: &dyn GuestMemory) {
        let addr = gstate.clut_address();
        self.total_bytes = gstate.clut_load_bytes().min((CLUT_BUF_ENTRIES * 4) as u32);
        let dst = &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.raw[..])
            [..self.total_bytes as usize];
        let copied = if mem.is_valid_address(addr) {
            mem.read_into(dst, addr)
        } else {
            log::warn!("texcache: CLUT load from invalid address 0x{addr:08X}");
            0
        };
        dst[copied..].fill(0xFF);
        self.last_format = CLUT_FORMAT_DIRTY;
    }

    /// Whether the converted buffer is stale for the current register value.
    pub fn needs_update(&self, gstate: &GpuState) -> bool {
        self.last_format != gstate.clutformat
    }

    /// Rehash and (for 16-bit formats) re-convert the palette for the
    /// current `clutformat`. Idempotent for an unchanged palette.
    pub fn update(&mut self, gstate: &GpuState) {
        let format = gstate.clut_palette_format();
        let base_bytes = gstate.clut_index_start() * format.entry_size();
        // Entries before the index start were loaded by an earlier command;
        // include them so offset palettes hash distinctly.
        let extended_bytes =
            (self.total_bytes + base_bytes).min((CLUT_BUF_ENTRIES * 4) as u32) as usize;

        let raw_bytes = bytemuck::cast_slice::<u32, u8>(&self.raw[..]);
        self.hash = hash::clut_hash(&raw_bytes[..extended_bytes]);

        if format != PaletteFormat::Abgr8888 {
            convert_colors(
                &mut self.converted[..],
                &raw_bytes[..extended_bytes],
                clut_dest_format(format),
                extended_bytes / 2,
            );
            self.use_converted = true;
        } else {
            self.use_converted = false;
        }

        self.detect_alpha_linear(gstate, format);
        self.last_format = gstate.clutformat;
    }

    /// Fonts typically use an ABGR4444 palette whose entry `i` is
    /// `color | i`: alpha ramps linearly and the color nibbles are shared.
    /// Such palettes decode 4-bit indices with a single OR.
    fn detect_alpha_linear(&mut self, gstate: &GpuState, format: PaletteFormat) {
        self.alpha_linear = false;
        self.alpha_linear_color = 0;
        if format != PaletteFormat::Abgr4444 || !gstate.is_clut_index_simple() {
            return;
        }
        let mut clut = [0u16; 16];
        clut.copy_from_slice(&self.clut16()[..16]);
        self.alpha_linear = true;
        self.alpha_linear_color = clut[15] & 0xFFF0;
        for i in 0..16 {
            if (clut[i] & 0xF) as usize != i {
                self.alpha_linear = false;
                break;
            }
            // Entry 0 is invisible; its color nibbles don't matter.
            if i != 0 && (clut[i] & 0xFFF0) != self.alpha_linear_color {
                self.alpha_linear = false;
                break;
            }
        }
    }

    /// Current palette as 16-bit host-order entries.
    pub fn clut16(&self) -> &[u16] {
        let buf: &[u32] = if self.use_converted {
            &self.converted[..]
        } else {
            &self.raw[..]
        };
        bytemuck::cast_slice(buf)
    }

    /// Current palette as 32-bit entries (ABGR8888 palettes only).
    pub fn clut32(&self) -> &[u32] {
        if self.use_converted {
            &self.converted[..]
        } else {
            &self.raw[..]
        }
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn alpha_linear(&self) -> bool {
        self.alpha_linear
    }

    pub fn alpha_linear_color(&self) -> u16 {
        self.alpha_linear_color
    }
}

impl Default for ClutManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rupsp_common::memory::{FlatMemory, RAM_BASE};

    fn gstate_with_clut(addr: u32, bytes: u32, clutformat: u32) -> GpuState {
        let mut gs = GpuState::default();
        gs.clutaddr = addr;
        gs.clutloadbytes = bytes;
        gs.clutformat = clutformat;
        gs
    }

    /// clutformat for a simple-index palette of the given format.
    fn simple_format(fmt: u32) -> u32 {
        fmt | (0xFF << 8)
    }

    #[test]
    fn test_load_from_invalid_address_fills_ff() {
        let mem = FlatMemory::new();
        let gs = gstate_with_clut(0x0300_0000, 64, simple_format(3));
        let mut clut = ClutManager::new();
        clut.load(&gs, &mem);
        clut.update(&gs);
        assert!(clut.clut32()[..16].iter().all(|&c| c == 0xFFFF_FFFF));
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut mem = FlatMemory::new();
        for i in 0..64u32 {
            mem.write_u32(RAM_BASE + i * 4, 0x0101_0101 * i).unwrap();
        }
        let gs = gstate_with_clut(RAM_BASE, 256, simple_format(2));
        let mut clut = ClutManager::new();
        clut.load(&gs, &mem);

        clut.update(&gs);
        let h1 = clut.hash();
        let c1: Vec<u16> = clut.clut16()[..128].to_vec();
        clut.update(&gs);
        assert_eq!(clut.hash(), h1);
        assert_eq!(&clut.clut16()[..128], &c1[..]);
    }

    #[test]
    fn test_hash_covers_index_start_offset() {
        let mut mem = FlatMemory::new();
        for i in 0..64u32 {
            mem.write_u32(RAM_BASE + i * 4, i).unwrap();
        }
        let gs0 = gstate_with_clut(RAM_BASE, 64, simple_format(3));
        // Same load, but indices start 16 entries in.
        let gs1 = gstate_with_clut(RAM_BASE, 64, 3 | (0xFF << 8) | (1 << 16));
        let mut clut = ClutManager::new();
        clut.load(&gs0, &mem);
        clut.update(&gs0);
        let h0 = clut.hash();
        clut.update(&gs1);
        assert_ne!(clut.hash(), h0);
    }

    #[test]
    fn test_16bit_palettes_are_converted() {
        let mut mem = FlatMemory::new();
        // Guest BGR565 value with red in the low bits.
        mem.write_u32(RAM_BASE, 0x0000_001F).unwrap();
        for i in 1..16u32 {
            mem.write_u32(RAM_BASE + i * 4, 0).unwrap();
        }
        let gs = gstate_with_clut(RAM_BASE, 64, simple_format(0));
        let mut clut = ClutManager::new();
        clut.load(&gs, &mem);
        clut.update(&gs);
        assert_eq!(clut.clut16()[0], 0xF800);
    }

    #[test]
    fn test_alpha_linear_detection() {
        let mut mem = FlatMemory::new();
        // Guest ABGR4444 palette: host entry must become 0x4560 | i, so the
        // guest entry is its nibble reverse: 0x654_0 | i<<12... build from
        // the host value by reversing nibbles.
        for i in 0..16u16 {
            let host = 0x4560 | i;
            let guest = ((host & 0xF) << 12)
                | ((host & 0xF0) << 4)
                | ((host & 0xF00) >> 4)
                | ((host & 0xF000) >> 12);
            mem.write_bytes(RAM_BASE + i as u32 * 2, &guest.to_le_bytes())
                .unwrap();
        }
        let gs = gstate_with_clut(RAM_BASE, 32, simple_format(2));
        let mut clut = ClutManager::new();
        clut.load(&gs, &mem);
        clut.update(&gs);
        assert!(clut.alpha_linear());
        assert_eq!(clut.alpha_linear_color(), 0x4560);

        // Breaking one color nibble disables the fast path.
        let host = 0x9990u16 | 5;
        let guest = ((host & 0xF) << 12)
            | ((host & 0xF0) << 4)
            | ((host & 0xF00) >> 4)
            | ((host & 0xF000) >> 12);
        mem.write_bytes(RAM_BASE + 5 * 2, &guest.to_le_bytes()).unwrap();
        clut.load(&gs, &mem);
        clut.update(&gs);
        assert!(!clut.alpha_linear());
    }

    #[test]
    fn test_alpha_linear_requires_simple_index() {
        let mut mem = FlatMemory::new();
        for i in 0..16u16 {
            let host = 0x1230 | i;
            let guest = ((host & 0xF) << 12)
                | ((host & 0xF0) << 4)
                | ((host & 0xF00) >> 4)
                | ((host & 0xF000) >> 12);
            mem.write_bytes(RAM_BASE + i as u32 * 2, &guest.to_le_bytes())
                .unwrap();
        }
        // Index shift of 4 disqualifies the palette.
        let gs = gstate_with_clut(RAM_BASE, 32, 2 | (4 << 2) | (0xFF << 8));
        let mut clut = ClutManager::new();
        clut.load(&gs, &mem);
        clut.update(&gs);
        assert!(!clut.alpha_linear());
    }
}
