// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! PSP texture unswizzling.
//!
//! Swizzled textures store texels in 16-byte × 8-row blocks, blocks in
//! row-major order. [`unswizzle`] rebuilds linear rows into a u32 scratch
//! buffer. Rows narrower than one block (8/4/2/1 bytes) interleave multiple
//! image rows inside each block row and get dedicated sub-paths.

/// Block width in bytes.
const BLOCK_W: u32 = 16;
/// Block height in rows.
const BLOCK_H: u32 = 8;

#[inline]
fn word_at(src: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]])
}

/// Number of source bytes a swizzled image occupies: height rounds up to a
/// whole block row.
pub fn swizzled_size(row_width_bytes: u32, height: u32) -> u32 {
    let byc = ((height + BLOCK_H - 1) / BLOCK_H).max(1);
    row_width_bytes.max(BLOCK_W) * BLOCK_H * byc
}

/// De-interleave a swizzled image into `dst` as linear rows with a pitch of
/// `row_width_bytes`. `dst` grows if needed and is never shrunk.
///
/// `src` must hold at least [`swizzled_size`] bytes.
pub fn unswizzle(dst: &mut Vec<u32>, src: &[u8], row_width_bytes: u32, height: u32) {
    let byc = (((height + BLOCK_H - 1) / BLOCK_H).max(1)) as usize;
    let row_width = row_width_bytes as usize;

    let out_words = (row_width.max(4) * byc * BLOCK_H as usize + 3) / 4;
    if dst.len() < out_words {
        dst.resize(out_words, 0);
    }

    let mut s = 0usize;
    match row_width {
        w if w >= BLOCK_W as usize => {
            let pitch = row_width / 4;
            let bxc = row_width / BLOCK_W as usize;
            for by in 0..byc {
                for bx in 0..bxc {
                    for n in 0..BLOCK_H as usize {
                        let d = (by * BLOCK_H as usize + n) * pitch + bx * 4;
                        for k in 0..4 {
                            dst[d + k] = word_at(src, s);
                            s += 4;
                        }
                    }
                }
            }
        }
        8 => {
            // Two words of payload, two words of neighbor rows to skip.
            let mut d = 0usize;
            for _ in 0..byc {
                for _ in 0..BLOCK_H as usize {
                    dst[d] = word_at(src, s);
                    dst[d + 1] = word_at(src, s + 4);
                    d += 2;
                    s += 16;
                }
            }
        }
        4 => {
            let mut d = 0usize;
            for _ in 0..byc {
                for _ in 0..BLOCK_H as usize {
                    dst[d] = word_at(src, s);
                    d += 1;
                    s += 16;
                }
            }
        }
        2 => {
            // Each output word packs two image rows of 2 bytes each.
            let mut d = 0usize;
            for _ in 0..byc {
                for _ in 0..4 {
                    let n1 = u16::from_le_bytes([src[s], src[s + 1]]) as u32;
                    let n2 = u16::from_le_bytes([src[s + 16], src[s + 17]]) as u32;
                    dst[d] = n1 | (n2 << 16);
                    d += 1;
                    s += 32;
                }
            }
        }
        1 => {
            // Each output word packs four image rows of 1 byte each.
            let mut d = 0usize;
            for _ in 0..byc {
                for _ in 0..2 {
                    let n1 = src[s] as u32;
                    let n2 = src[s + 16] as u32;
                    let n3 = src[s + 32] as u32;
                    let n4 = src[s + 48] as u32;
                    dst[d] = n1 | (n2 << 8) | (n3 << 16) | (n4 << 24);
                    d += 1;
                    s += 64;
                }
            }
        }
        _ => {
            log::error!("texcache: unswizzle with unsupported row width {row_width}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build the swizzled form of a linear image: block (bx, by) holds rows
    /// `by*8..by*8+8` of byte columns `bx*16..bx*16+16`, row-major. Rows
    /// narrower than a block pad each 16-byte block row with zeros.
    fn swizzle_reference(linear: &[u8], row_width: usize, height: usize) -> Vec<u8> {
        let byc = ((height + 7) / 8).max(1);
        let bxc = (row_width.max(16)) / 16;
        let mut out = Vec::new();
        for by in 0..byc {
            for bx in 0..bxc {
                for n in 0..8 {
                    let y = by * 8 + n;
                    for k in 0..16 {
                        let x = bx * 16 + k;
                        let idx = y * row_width + x;
                        out.push(if x < row_width && idx < linear.len() {
                            linear[idx]
                        } else {
                            0
                        });
                    }
                }
            }
        }
        out
    }

    fn as_bytes(words: &[u32], len: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(len);
        for w in words {
            v.extend_from_slice(&w.to_le_bytes());
        }
        v.truncate(len);
        v
    }

    #[test]
    fn test_unswizzle_wide_rows() {
        // 32 bytes per row, 16 rows: 2x2 blocks.
        let row_width = 32;
        let height = 16;
        let linear: Vec<u8> = (0..row_width * height).map(|i| (i % 251) as u8).collect();
        let swizzled = swizzle_reference(&linear, row_width, height);

        let mut dst = Vec::new();
        unswizzle(&mut dst, &swizzled, row_width as u32, height as u32);
        assert_eq!(as_bytes(&dst, linear.len()), linear);
    }

    #[test]
    fn test_unswizzle_single_block() {
        let row_width = 16;
        let height = 8;
        let linear: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let swizzled = swizzle_reference(&linear, row_width, height);
        assert_eq!(swizzled, linear); // one block is already linear

        let mut dst = Vec::new();
        unswizzle(&mut dst, &swizzled, 16, 8);
        assert_eq!(as_bytes(&dst, 128), linear);
    }

    #[test]
    fn test_unswizzle_narrow_rows() {
        for row_width in [8usize, 4, 2, 1] {
            let height = 16;
            let linear: Vec<u8> = (0..row_width * height).map(|i| (i * 7 + 3) as u8).collect();
            let swizzled = swizzle_reference(&linear, row_width, height);

            let mut dst = Vec::new();
            unswizzle(&mut dst, &swizzled, row_width as u32, height as u32);
            assert_eq!(
                as_bytes(&dst, linear.len()),
                linear,
                "row width {row_width}"
            );
        }
    }

    #[test]
    fn test_unswizzle_rounds_height_to_block() {
        // Height 5 still consumes a full 8-row block of source data.
        assert_eq!(swizzled_size(16, 5), 16 * 8);
        let src = vec![0u8; 16 * 8];
        let mut dst = Vec::new();
        unswizzle(&mut dst, &src, 16, 5);
        assert!(dst.len() >= 16 * 8 / 4);
    }

    #[test]
    fn test_scratch_never_shrinks() {
        let mut dst = vec![0u32; 4096];
        let src = vec![0u8; 16 * 8];
        unswizzle(&mut dst, &src, 16, 8);
        assert_eq!(dst.len(), 4096);
    }
}
