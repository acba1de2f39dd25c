// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Content hashes for texture identity.
//!
//! Three tiers, cheapest first: [`mini_hash`] reads one word and acts as a
//! per-lookup tripwire, [`quick_tex_hash`] folds the whole level-0 image,
//! and [`clut_hash`] is a real digest over palette bytes (palettes are
//! small and their hash doubles as a cache-key component, so collisions
//! there are far more costly than on image data).
//!
//! All of these are fixed functions of their input bytes: the values are
//! stored in cache entries and compared across frames, so any change here
//! invalidates every comparison.

/// Multiplier for the weak palette hash.
const CLUT_QUICK_PRIME: u32 = 2_246_822_519;

/// Digest seed for the full palette hash.
const CLUT_HASH_SEED: u32 = 0xC010_8888;

#[inline]
fn word_at(data: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]])
}

/// First 32-bit word of the texture, zero-extended if fewer than 4 bytes
/// are available.
pub fn mini_hash(data: &[u8]) -> u32 {
    let mut w = [0u8; 4];
    let n = data.len().min(4);
    w[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(w)
}

/// Fold an image region into 32 bits.
///
/// Defined lane-wise so scalar and SIMD renditions cannot disagree: 32-byte
/// chunks maintain four u32 lanes (add words 0..4, xor words 4..8), the
/// lanes sum at the end, and tail words alternate add/xor into lane 0.
/// A trailing partial word is zero-extended and added. Empty input hashes
/// to 0.
pub fn quick_tex_hash(data: &[u8]) -> u32 {
    let mut lanes = [0u32; 4];

    let mut chunks = data.chunks_exact(32);
    for chunk in &mut chunks {
        for j in 0..4 {
            lanes[j] = lanes[j].wrapping_add(word_at(chunk, j * 4));
        }
        for j in 0..4 {
            lanes[j] ^= word_at(chunk, 16 + j * 4);
        }
    }

    let tail = chunks.remainder();
    let mut words = tail.chunks_exact(4);
    for (i, w) in (&mut words).enumerate() {
        if i % 2 == 0 {
            lanes[0] = lanes[0].wrapping_add(word_at(w, 0));
        } else {
            lanes[0] ^= word_at(w, 0);
        }
    }
    let last = words.remainder();
    if !last.is_empty() {
        lanes[0] = lanes[0].wrapping_add(mini_hash(last));
    }

    lanes[0]
        .wrapping_add(lanes[1])
        .wrapping_add(lanes[2])
        .wrapping_add(lanes[3])
}

/// Weak multiply-add fold over palette bytes. CLUTs load in multiples of
/// 32 bytes, so the input is always word-aligned in length.
pub fn quick_clut_hash(data: &[u8]) -> u32 {
    debug_assert!(data.len() % 32 == 0, "CLUT sizes are multiples of 32 bytes");
    let mut hash = 0u32;
    for w in data.chunks_exact(4) {
        hash = hash.wrapping_add(word_at(w, 0).wrapping_mul(CLUT_QUICK_PRIME));
    }
    hash
}

/// Full palette digest. Seeded CRC32: good enough mixing to serve as the
/// palette's identity in cache keys.
pub fn clut_hash(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(CLUT_HASH_SEED);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mini_hash_reads_first_word() {
        assert_eq!(mini_hash(&[0x78, 0x56, 0x34, 0x12, 0xFF]), 0x1234_5678);
        assert_eq!(mini_hash(&[0x78, 0x56]), 0x0000_5678);
        assert_eq!(mini_hash(&[]), 0);
    }

    #[test]
    fn test_quick_tex_hash_empty_is_zero() {
        assert_eq!(quick_tex_hash(&[]), 0);
    }

    #[test]
    fn test_quick_tex_hash_lane_definition() {
        // One full 32-byte chunk: words 0..4 added, 4..8 xored, lanes summed.
        let mut data = [0u8; 32];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let w: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut expect = 0u32;
        for j in 0..4 {
            expect = expect.wrapping_add(w[j].wrapping_add(0) ^ w[4 + j]);
        }
        assert_eq!(quick_tex_hash(&data), expect);
    }

    #[test]
    fn test_quick_tex_hash_tail_words() {
        // 8-byte input: add then xor into lane 0.
        let data = [1, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(quick_tex_hash(&data), 1 ^ 2);
        // Partial trailing word is zero-extended and added.
        let data = [1, 0, 0, 0, 0xAB];
        assert_eq!(quick_tex_hash(&data), 1 + 0xAB);
    }

    #[test]
    fn test_quick_tex_hash_detects_single_pixel_change() {
        let mut data = vec![0x5Au8; 256];
        let a = quick_tex_hash(&data);
        data[137] ^= 0x01;
        assert_ne!(quick_tex_hash(&data), a);
    }

    #[test]
    fn test_quick_clut_hash() {
        let zeros = [0u8; 32];
        assert_eq!(quick_clut_hash(&zeros), 0);

        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(quick_clut_hash(&one), CLUT_QUICK_PRIME);
    }

    #[test]
    fn test_clut_hash_is_stable_and_sensitive() {
        let data: Vec<u8> = (0..64).collect();
        let h = clut_hash(&data);
        assert_eq!(clut_hash(&data), h);

        let mut swapped = data.clone();
        swapped.swap(0, 1);
        assert_ne!(clut_hash(&swapped), h);

        // Order matters, unlike the quick fold which is word-commutative.
        assert_ne!(clut_hash(&data[..32]), clut_hash(&data[32..]));
    }
}
