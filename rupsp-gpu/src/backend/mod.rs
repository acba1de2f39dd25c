// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host GPU backend abstraction.
//!
//! The texture cache talks to the host 3D API through this trait: texture
//! object lifecycle, image uploads, sampler parameters, and binding a
//! framebuffer's color attachment as a texture. Any backend that can
//! service these primitives works; sampler setters have no-op defaults so
//! minimal backends only implement what they support.

use thiserror::Error;

use crate::convert::DecodedFormat;

pub mod null_backend;

/// Opaque host texture object. 0 is the null texture.
pub type TextureHandle = u32;

/// Upload failure. Out-of-memory is the only error the cache recovers from
/// (low-memory mode, decimate, retry once); anything else is fatal to the
/// upload but not to the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("host is out of texture memory")]
    OutOfMemory,
}

/// Minification filter, indexed by the guest's 3-bit filter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinFilter {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

impl MinFilter {
    /// Guest encoding: bit 0 = linear, bits 1..3 = mip mode (0 = none).
    /// Indices 2 and 3 alias 0 and 1 on hardware.
    pub fn from_index(index: u32) -> Self {
        match index & 7 {
            0 | 2 => Self::Nearest,
            1 | 3 => Self::Linear,
            4 => Self::NearestMipmapNearest,
            5 => Self::LinearMipmapNearest,
            6 => Self::NearestMipmapLinear,
            _ => Self::LinearMipmapLinear,
        }
    }
}

/// Magnification filter, guest bit 8 of `texfilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagFilter {
    Nearest,
    Linear,
}

impl MagFilter {
    pub fn from_index(index: u32) -> Self {
        if index & 1 != 0 {
            Self::Linear
        } else {
            Self::Nearest
        }
    }
}

/// Trait for host texture backends.
///
/// All sampler state applies to the currently bound texture, GL-style.
pub trait TextureBackend {
    fn name(&self) -> &str;

    /// Allocate a texture object.
    fn gen_texture(&mut self) -> TextureHandle;

    /// Destroy a texture object.
    fn delete_texture(&mut self, texture: TextureHandle);

    /// Bind a texture (0 binds the null texture).
    fn bind_texture_2d(&mut self, texture: TextureHandle);

    /// Upload a full mip level to the bound texture.
    fn tex_image_2d(
        &mut self,
        level: u32,
        format: DecodedFormat,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<(), UploadError>;

    /// Replace the pixels of an existing mip level in place.
    fn tex_sub_image_2d(
        &mut self,
        level: u32,
        format: DecodedFormat,
        width: u32,
        height: u32,
        data: &[u8],
    );

    /// Generate mip levels below the base image.
    fn generate_mipmap(&mut self) {}

    /// Bind framebuffer `fbo`'s color attachment to texture unit `unit`.
    fn bind_color_as_texture(&mut self, _fbo: u32, _unit: u32) {}

    // ── Sampler and transfer state ──────────────────────────────────────

    fn set_min_filter(&mut self, _filter: MinFilter) {}
    fn set_mag_filter(&mut self, _filter: MagFilter) {}
    fn set_clamp_s(&mut self, _clamp: bool) {}
    fn set_clamp_t(&mut self, _clamp: bool) {}
    fn set_lod_bias(&mut self, _bias: f32) {}
    fn set_max_level(&mut self, _level: u32) {}
    fn set_anisotropy(&mut self, _level: f32) {}
    fn set_unpack_alignment(&mut self, _align: u32) {}

    /// Largest anisotropy factor the host supports.
    fn max_anisotropy(&self) -> f32 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_filter_table() {
        assert_eq!(MinFilter::from_index(0), MinFilter::Nearest);
        assert_eq!(MinFilter::from_index(1), MinFilter::Linear);
        assert_eq!(MinFilter::from_index(2), MinFilter::Nearest);
        assert_eq!(MinFilter::from_index(5), MinFilter::LinearMipmapNearest);
        assert_eq!(MinFilter::from_index(7), MinFilter::LinearMipmapLinear);
    }

    #[test]
    fn test_mag_filter() {
        assert_eq!(MagFilter::from_index(0), MagFilter::Nearest);
        assert_eq!(MagFilter::from_index(1), MagFilter::Linear);
    }
}
