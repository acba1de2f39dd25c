// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Texture upscaler seam.
//!
//! The actual scaling filter lives outside the texture path; the cache only
//! needs a pure resample function. Returning `None` keeps the original
//! pixels.

use crate::convert::DecodedFormat;

pub trait TextureScaler {
    /// Scale `data` by `factor`. Returns the scaled pixels and their new
    /// dimensions, or `None` to keep the input unscaled.
    fn scale(
        &mut self,
        data: &[u8],
        format: DecodedFormat,
        width: u32,
        height: u32,
        factor: u32,
    ) -> Option<(Vec<u8>, u32, u32)>;
}

/// Identity scaler.
pub struct NoScaler;

impl TextureScaler for NoScaler {
    fn scale(
        &mut self,
        _data: &[u8],
        _format: DecodedFormat,
        _width: u32,
        _height: u32,
        _factor: u32,
    ) -> Option<(Vec<u8>, u32, u32)> {
        None
    }
}
