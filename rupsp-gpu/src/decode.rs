// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest texture decoding.
//!
//! Turns one mip level of a guest texture (any format, swizzled or linear)
//! into host-order pixels in scratch memory. The decoders monomorphize over
//! the palette index width so the inner loops never branch on format.
//!
//! Output rows are packed to the texture width: when the guest row stride
//! exceeds the width, rows are rectified into the rearrange buffer (or in
//! place when shrinking). A linear ABGR8888 image whose stride equals its
//! width borrows guest memory directly.

use rupsp_common::GuestMemory;

use crate::clut::ClutManager;
use crate::convert::{
    clut_dest_format, convert_colors, convert_colors_in_place, DecodedFormat,
};
use crate::dxt::{
    decode_dxt1_block, decode_dxt3_block, decode_dxt5_block, expand5, expand6, Dxt1Block,
    Dxt3Block, Dxt5Block,
};
use crate::gpu_state::{GpuState, TextureFormat};
use crate::unswizzle::{swizzled_size, unswizzle};

/// Opacity classification of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaStatus {
    /// Mixed or unscanned alpha.
    Unknown,
    /// Every pixel is fully opaque or fully transparent.
    Simple,
    /// Every pixel is fully opaque.
    Full,
}

/// Decode scratch. Buffers only ever grow; the initial sizes cover a
/// 512x512 ABGR8888 texture without reallocation.
pub struct ScratchBuffers {
    /// 32-bit pixels, and the unswizzle target.
    pub tmp32: Vec<u32>,
    /// 16-bit pixels two per word; doubles as a second 32-bit buffer when
    /// the unswizzle target is occupied.
    pub tmp16: Vec<u32>,
    /// Row rectification target when rows grow.
    pub rearrange: Vec<u32>,
}

impl ScratchBuffers {
    pub fn new() -> Self {
        Self {
            tmp32: vec![0; 1024 * 512],
            tmp16: vec![0; 1024 * 512 / 2],
            rearrange: vec![0; 1024 * 512],
        }
    }
}

impl Default for ScratchBuffers {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure(buf: &mut Vec<u32>, words: usize) {
    if buf.len() < words {
        buf.resize(words, 0);
    }
}

/// One decoded mip level. `data` borrows scratch or guest memory.
pub struct DecodedLevel<'a> {
    pub data: &'a [u8],
    pub format: DecodedFormat,
    /// Pixels per row of `data` (the texture width, rounded up to 4 for DXT).
    pub width: u32,
    pub height: u32,
}

// ── Palette indexing ─────────────────────────────────────────────────────

/// Palette index source, monomorphized per index width.
trait ClutIndex: Copy {
    const SIZE: usize;
    fn load(src: &[u8], i: usize) -> u32;
}

impl ClutIndex for u8 {
    const SIZE: usize = 1;
    #[inline]
    fn load(src: &[u8], i: usize) -> u32 {
        src[i] as u32
    }
}

impl ClutIndex for u16 {
    const SIZE: usize = 2;
    #[inline]
    fn load(src: &[u8], i: usize) -> u32 {
        u16::from_le_bytes([src[i * 2], src[i * 2 + 1]]) as u32
    }
}

impl ClutIndex for u32 {
    const SIZE: usize = 4;
    #[inline]
    fn load(src: &[u8], i: usize) -> u32 {
        u32::from_le_bytes([src[i * 4], src[i * 4 + 1], src[i * 4 + 2], src[i * 4 + 3]])
    }
}

fn de_index_texture<I: ClutIndex, C: Copy>(
    dest: &mut [C],
    src: &[u8],
    clut: &[C],
    gstate: &GpuState,
) {
    if gstate.is_clut_index_simple() {
        for (i, d) in dest.iter_mut().enumerate() {
            *d = clut[(I::load(src, i) & 0xFF) as usize];
        }
    } else {
        for (i, d) in dest.iter_mut().enumerate() {
            *d = clut[gstate.transform_clut_index(I::load(src, i)) as usize];
        }
    }
}

/// 4-bit indices: each source byte yields two pixels, low nibble first.
fn de_index_texture4<C: Copy>(dest: &mut [C], src: &[u8], clut: &[C], gstate: &GpuState) {
    if gstate.is_clut_index_simple() {
        for (i, pair) in dest.chunks_exact_mut(2).enumerate() {
            let index = src[i] as u32;
            pair[0] = clut[(index & 0xF) as usize];
            pair[1] = clut[(index >> 4) as usize];
        }
    } else {
        for (i, pair) in dest.chunks_exact_mut(2).enumerate() {
            let index = src[i] as u32;
            pair[0] = clut[gstate.transform_clut_index(index & 0xF) as usize];
            pair[1] = clut[gstate.transform_clut_index(index >> 4) as usize];
        }
    }
}

/// Alpha-linear palettes collapse the lookup to an OR with the shared color.
fn de_index_texture4_alpha_linear(dest: &mut [u16], src: &[u8], color: u16) {
    for (i, pair) in dest.chunks_exact_mut(2).enumerate() {
        let index = src[i] as u16;
        pair[0] = color | (index & 0xF);
        pair[1] = color | (index >> 4);
    }
}

// ── Level decoding ───────────────────────────────────────────────────────

/// Which scratch buffer holds the decoded pixels.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Out {
    Tmp16,
    Tmp32,
    Rearrange,
}

/// Decode one mip level. `bufw` is the raw per-level stride (the format
/// minimums are applied here). Returns `None` when guest data is missing,
/// which the caller treats as a null-texture bind.
pub fn decode_texture_level<'a>(
    scratch: &'a mut ScratchBuffers,
    clut: &ClutManager,
    gstate: &GpuState,
    mem: &'a dyn GuestMemory,
    format: TextureFormat,
    level: usize,
    bufw: u32,
) -> Option<DecodedLevel<'a>> {
    let ScratchBuffers {
        tmp32,
        tmp16,
        rearrange,
    } = scratch;

    let texaddr = gstate.texture_address(level);
    let w = gstate.texture_width(level) as usize;
    let h = gstate.texture_height(level) as usize;
    let swizzled = gstate.is_texture_swizzled();

    match format {
        TextureFormat::Clut4 => {
            let bufw = (bufw as usize).max(32);
            let pixels = bufw * h;
            let dst_fmt = clut_dest_format(gstate.clut_palette_format());
            let share_clut = gstate.mipmaps_share_clut();
            // Without sharing, each level indexes 16 entries further in.
            let clut_offset = if share_clut { 0 } else { level * 16 };
            let out;

            if swizzled {
                let raw = mem.slice(texaddr, swizzled_size(bufw as u32 / 2, h as u32))?;
                unswizzle(tmp32, raw, bufw as u32 / 2, h as u32);
                let src: &[u8] = bytemuck::cast_slice(&tmp32[..]);
                ensure(tmp16, pixels);
                if dst_fmt == DecodedFormat::Abgr8888 {
                    de_index_texture4(&mut tmp16[..pixels], src, &clut.clut32()[clut_offset..], gstate);
                } else {
                    let dest: &mut [u16] = bytemuck::cast_slice_mut(&mut tmp16[..]);
                    if clut.alpha_linear() && share_clut {
                        de_index_texture4_alpha_linear(
                            &mut dest[..pixels],
                            src,
                            clut.alpha_linear_color(),
                        );
                    } else {
                        de_index_texture4(
                            &mut dest[..pixels],
                            src,
                            &clut.clut16()[clut_offset..],
                            gstate,
                        );
                    }
                }
                out = Out::Tmp16;
            } else {
                let src = mem.slice(texaddr, (pixels / 2) as u32)?;
                if dst_fmt == DecodedFormat::Abgr8888 {
                    ensure(tmp32, pixels);
                    de_index_texture4(&mut tmp32[..pixels], src, &clut.clut32()[clut_offset..], gstate);
                    out = Out::Tmp32;
                } else {
                    ensure(tmp16, (pixels + 1) / 2);
                    let dest: &mut [u16] = bytemuck::cast_slice_mut(&mut tmp16[..]);
                    if clut.alpha_linear() && share_clut {
                        de_index_texture4_alpha_linear(
                            &mut dest[..pixels],
                            src,
                            clut.alpha_linear_color(),
                        );
                    } else {
                        de_index_texture4(
                            &mut dest[..pixels],
                            src,
                            &clut.clut16()[clut_offset..],
                            gstate,
                        );
                    }
                    out = Out::Tmp16;
                }
            }
            Some(finish(tmp16, tmp32, rearrange, out, dst_fmt, w, bufw, h))
        }

        TextureFormat::Clut8 => decode_indexed::<u8>(
            tmp32, tmp16, rearrange, clut, gstate, mem, texaddr, w, h,
            (bufw as usize).max(8), swizzled,
        ),
        TextureFormat::Clut16 => decode_indexed::<u16>(
            tmp32, tmp16, rearrange, clut, gstate, mem, texaddr, w, h,
            (bufw as usize).max(8), swizzled,
        ),
        TextureFormat::Clut32 => decode_indexed::<u32>(
            tmp32, tmp16, rearrange, clut, gstate, mem, texaddr, w, h,
            (bufw as usize).max(4), swizzled,
        ),

        TextureFormat::Rgb565 | TextureFormat::Abgr1555 | TextureFormat::Abgr4444 => {
            let bufw = (bufw as usize).max(8);
            let pixels = bufw * h;
            let dst_fmt = match format {
                TextureFormat::Rgb565 => DecodedFormat::Rgb565,
                TextureFormat::Abgr1555 => DecodedFormat::Abgr1555,
                _ => DecodedFormat::Abgr4444,
            };
            let out;
            if swizzled {
                let raw = mem.slice(texaddr, swizzled_size(bufw as u32 * 2, h as u32))?;
                unswizzle(tmp32, raw, bufw as u32 * 2, h as u32);
                convert_colors_in_place(tmp32, dst_fmt, pixels);
                out = Out::Tmp32;
            } else {
                let src = mem.slice(texaddr, (pixels * 2) as u32)?;
                ensure(tmp16, (pixels + 1) / 2);
                convert_colors(tmp16, src, dst_fmt, pixels);
                out = Out::Tmp16;
            }
            Some(finish(tmp16, tmp32, rearrange, out, dst_fmt, w, bufw, h))
        }

        TextureFormat::Abgr8888 => {
            let bufw = (bufw as usize).max(4);
            if swizzled {
                let raw = mem.slice(texaddr, swizzled_size(bufw as u32 * 4, h as u32))?;
                unswizzle(tmp32, raw, bufw as u32 * 4, h as u32);
            } else if w == bufw {
                // Already in host order and packed: borrow the guest bytes.
                let src = mem.slice(texaddr, (w * h * 4) as u32)?;
                return Some(DecodedLevel {
                    data: src,
                    format: DecodedFormat::Abgr8888,
                    width: w as u32,
                    height: h as u32,
                });
            } else {
                let src = mem.slice(texaddr, (bufw * h * 4) as u32)?;
                ensure(tmp32, bufw * h);
                convert_colors(tmp32, src, DecodedFormat::Abgr8888, bufw * h);
            }
            Some(finish(
                tmp16,
                tmp32,
                rearrange,
                Out::Tmp32,
                DecodedFormat::Abgr8888,
                w,
                bufw,
                h,
            ))
        }

        TextureFormat::Dxt1 | TextureFormat::Dxt3 | TextureFormat::Dxt5 => {
            let bufw = (bufw as usize).max(4);
            let block_bytes = if format == TextureFormat::Dxt1 { 8 } else { 16 };
            let blocks_x = bufw / 4;
            let blocks_y = (h + 3) / 4;
            let src = mem.slice(texaddr, (blocks_x * blocks_y * block_bytes) as u32)?;

            let rounded_h = (h + 3) & !3;
            ensure(tmp32, bufw * rounded_h);
            let minw = bufw.min(w);
            for y in (0..h).step_by(4) {
                let mut block_index = (y / 4) * blocks_x;
                for x in (0..minw).step_by(4) {
                    let dst = &mut tmp32[y * bufw + x..];
                    let b = &src[block_index * block_bytes..];
                    match format {
                        TextureFormat::Dxt1 => {
                            decode_dxt1_block(dst, bufw, &Dxt1Block::from_bytes(b), false)
                        }
                        TextureFormat::Dxt3 => {
                            decode_dxt3_block(dst, bufw, &Dxt3Block::from_bytes(b))
                        }
                        _ => decode_dxt5_block(dst, bufw, &Dxt5Block::from_bytes(b)),
                    }
                    block_index += 1;
                }
            }
            // DXT always decodes whole blocks.
            let w = (w + 3) & !3;
            Some(finish(
                tmp16,
                tmp32,
                rearrange,
                Out::Tmp32,
                DecodedFormat::Abgr8888,
                w,
                bufw,
                h,
            ))
        }
    }
}

/// CLUT8/16/32 bodies share everything except the index width.
#[allow(clippy::too_many_arguments)]
fn decode_indexed<'a, I: ClutIndex>(
    tmp32: &'a mut Vec<u32>,
    tmp16: &'a mut Vec<u32>,
    rearrange: &'a mut Vec<u32>,
    clut: &ClutManager,
    gstate: &GpuState,
    mem: &dyn GuestMemory,
    texaddr: u32,
    w: usize,
    h: usize,
    bufw: usize,
    swizzled: bool,
) -> Option<DecodedLevel<'a>> {
    let pixels = bufw * h;
    let dst_fmt = clut_dest_format(gstate.clut_palette_format());
    let out;

    if swizzled {
        let row_bytes = (bufw * I::SIZE) as u32;
        let raw = mem.slice(texaddr, swizzled_size(row_bytes, h as u32))?;
        unswizzle(tmp32, raw, row_bytes, h as u32);
        let src: &[u8] = bytemuck::cast_slice(&tmp32[..]);
        ensure(tmp16, pixels);
        if dst_fmt == DecodedFormat::Abgr8888 {
            de_index_texture::<I, u32>(&mut tmp16[..pixels], src, clut.clut32(), gstate);
        } else {
            let dest: &mut [u16] = bytemuck::cast_slice_mut(&mut tmp16[..]);
            de_index_texture::<I, u16>(&mut dest[..pixels], src, clut.clut16(), gstate);
        }
        out = Out::Tmp16;
    } else {
        let src = mem.slice(texaddr, (pixels * I::SIZE) as u32)?;
        if dst_fmt == DecodedFormat::Abgr8888 {
            ensure(tmp32, pixels);
            de_index_texture::<I, u32>(&mut tmp32[..pixels], src, clut.clut32(), gstate);
            out = Out::Tmp32;
        } else {
            ensure(tmp16, (pixels + 1) / 2);
            let dest: &mut [u16] = bytemuck::cast_slice_mut(&mut tmp16[..]);
            de_index_texture::<I, u16>(&mut dest[..pixels], src, clut.clut16(), gstate);
            out = Out::Tmp16;
        }
    }
    Some(finish(tmp16, tmp32, rearrange, out, dst_fmt, w, bufw, h))
}

/// Rectify rows to `w` pixels and hand out the final byte slice.
#[allow(clippy::too_many_arguments)]
fn finish<'a>(
    tmp16: &'a mut Vec<u32>,
    tmp32: &'a mut Vec<u32>,
    rearrange: &'a mut Vec<u32>,
    mut out: Out,
    format: DecodedFormat,
    w: usize,
    bufw: usize,
    h: usize,
) -> DecodedLevel<'a> {
    let ps = format.bytes_per_pixel();

    if w != bufw {
        let in_row = bufw * ps;
        let out_row = w * ps;
        if w > bufw {
            ensure(rearrange, (out_row * h + 3) / 4);
            let src_bytes: &[u8] = match out {
                Out::Tmp16 => bytemuck::cast_slice(&tmp16[..]),
                Out::Tmp32 => bytemuck::cast_slice(&tmp32[..]),
                Out::Rearrange => unreachable!(),
            };
            let dst_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut rearrange[..]);
            for y in 0..h {
                // Rows grow: bytes past in_row stay whatever the previous
                // decode left there, same as the hardware sampling past the
                // stride.
                dst_bytes[y * out_row..y * out_row + in_row]
                    .copy_from_slice(&src_bytes[y * in_row..(y + 1) * in_row]);
            }
            out = Out::Rearrange;
        } else {
            let buf: &mut [u8] = match out {
                Out::Tmp16 => bytemuck::cast_slice_mut(&mut tmp16[..]),
                Out::Tmp32 => bytemuck::cast_slice_mut(&mut tmp32[..]),
                Out::Rearrange => unreachable!(),
            };
            for y in 1..h {
                buf.copy_within(y * in_row..y * in_row + out_row, y * out_row);
            }
        }
    }

    let bytes = w * h * ps;
    let data: &[u8] = match out {
        Out::Tmp16 => &bytemuck::cast_slice(&tmp16[..])[..bytes],
        Out::Tmp32 => &bytemuck::cast_slice(&tmp32[..])[..bytes],
        Out::Rearrange => &bytemuck::cast_slice(&rearrange[..])[..bytes],
    };
    DecodedLevel {
        data,
        format,
        width: w as u32,
        height: h as u32,
    }
}

// ── Alpha classification ─────────────────────────────────────────────────

/// Scan decoded pixels and classify their alpha channel.
pub fn check_alpha(data: &[u8], format: DecodedFormat, num_pixels: usize) -> AlphaStatus {
    let mut hit_zero = 0u32;

    match format {
        DecodedFormat::Abgr4444 => {
            for chunk in data.chunks(4).take((num_pixels + 1) / 2) {
                if chunk.len() == 4 {
                    let c = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let a = c & 0x000F_000F;
                    hit_zero |= a ^ 0x000F_000F;
                    if a != 0x000F_000F && a != 0x0000_000F && a != 0x000F_0000 && a != 0 {
                        return AlphaStatus::Unknown;
                    }
                } else {
                    let a = u16::from_le_bytes([chunk[0], chunk[1]]) & 0xF;
                    hit_zero |= (a ^ 0xF) as u32;
                    if a != 0xF && a != 0 {
                        return AlphaStatus::Unknown;
                    }
                }
            }
        }
        DecodedFormat::Abgr1555 => {
            for chunk in data.chunks(4).take((num_pixels + 1) / 2) {
                if chunk.len() == 4 {
                    let c = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    hit_zero |= (c & 0x0001_0001) ^ 0x0001_0001;
                } else {
                    let c = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                    hit_zero |= (c & 1) ^ 1;
                }
            }
        }
        DecodedFormat::Rgb565 => {
            // No alpha channel.
        }
        DecodedFormat::Abgr8888 => {
            for chunk in data.chunks_exact(4).take(num_pixels) {
                let c = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let a = c & 0xFF00_0000;
                hit_zero |= a ^ 0xFF00_0000;
                if a != 0xFF00_0000 && a != 0 {
                    return AlphaStatus::Unknown;
                }
            }
        }
    }

    if hit_zero != 0 {
        AlphaStatus::Simple
    } else {
        AlphaStatus::Full
    }
}

// ── Debug decode ─────────────────────────────────────────────────────────

/// Decode the currently-programmed texture fully to ARGB8888 for debug UI
/// display. Returns false when the texture cannot be decoded.
pub fn decode_texture_debug(
    output: &mut Vec<u32>,
    scratch: &mut ScratchBuffers,
    clut: &ClutManager,
    gstate: &GpuState,
    mem: &dyn GuestMemory,
) -> bool {
    let texaddr = gstate.texture_address(0);
    if !mem.is_valid_address(texaddr) {
        return false;
    }
    let format = match TextureFormat::from_raw(gstate.texture_format_raw()) {
        Some(f) => f,
        None => return false,
    };
    let bufw = gstate.level_buf_width(0);

    let level = match decode_texture_level(scratch, clut, gstate, mem, format, 0, bufw) {
        Some(level) => level,
        None => return false,
    };

    let w = level.width as usize;
    let h = level.height as usize;
    output.clear();
    output.reserve(w * h);

    match level.format {
        DecodedFormat::Abgr4444 => {
            for chunk in level.data.chunks_exact(2).take(w * h) {
                let val = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                let r = ((val >> 12) & 0xF) * 17;
                let g = ((val >> 8) & 0xF) * 17;
                let b = ((val >> 4) & 0xF) * 17;
                let a = (val & 0xF) * 17;
                output.push((a << 24) | (r << 16) | (g << 8) | b);
            }
        }
        DecodedFormat::Abgr1555 => {
            for chunk in level.data.chunks_exact(2).take(w * h) {
                let val = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                let r = expand5(((val >> 11) & 0x1F) as i32) as u32;
                let g = expand5(((val >> 6) & 0x1F) as i32) as u32;
                let b = expand5(((val >> 1) & 0x1F) as i32) as u32;
                let a = (val & 1) * 255;
                output.push((a << 24) | (r << 16) | (g << 8) | b);
            }
        }
        DecodedFormat::Rgb565 => {
            for chunk in level.data.chunks_exact(2).take(w * h) {
                let val = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                let r = expand5(((val >> 11) & 0x1F) as i32) as u32;
                let g = expand6(((val >> 5) & 0x3F) as i32) as u32;
                let b = expand5((val & 0x1F) as i32) as u32;
                output.push(0xFF00_0000 | (r << 16) | (g << 8) | b);
            }
        }
        DecodedFormat::Abgr8888 => {
            for chunk in level.data.chunks_exact(4).take(w * h) {
                let val = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // ABGR bytes -> ARGB word: swap the red and blue channels.
                output.push(
                    (val & 0xFF00_0000)
                        | ((val & 0x00FF_0000) >> 16)
                        | (val & 0x0000_FF00)
                        | ((val & 0x0000_00FF) << 16),
                );
            }
        }
    }
    true
}
