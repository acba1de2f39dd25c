// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Global emulator settings, populated by the frontend.
#[derive(Debug, Clone)]
pub struct Settings {
    // Renderer
    pub rendering_mode: RenderingMode,
    pub texture_filtering: TextureFiltering,
    pub mipmap_enabled: bool,
    /// Anisotropy exponent: the renderer requests `1 << level` samples.
    pub anisotropy_level: u32,
    /// Texture upscale factor. 1 or 0 disables the upscaler.
    pub texture_scaling_level: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rendering_mode: RenderingMode::Buffered,
            texture_filtering: TextureFiltering::Auto,
            mipmap_enabled: true,
            anisotropy_level: 0,
            texture_scaling_level: 1,
        }
    }
}

/// Framebuffer rendering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderingMode {
    NonBuffered,
    Buffered,
    Software,
}

impl RenderingMode {
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => Self::NonBuffered,
            1 => Self::Buffered,
            2 => Self::Software,
            _ => Self::Buffered,
        }
    }
}

/// Texture filtering override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFiltering {
    /// Use whatever the game asks for.
    Auto,
    /// Force nearest-neighbor sampling.
    Nearest,
    /// Force linear sampling.
    Linear,
    /// Force linear sampling only while a video is playing.
    LinearVideo,
}

impl TextureFiltering {
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => Self::Auto,
            1 => Self::Nearest,
            2 => Self::Linear,
            3 => Self::LinearVideo,
            _ => Self::Auto,
        }
    }
}
