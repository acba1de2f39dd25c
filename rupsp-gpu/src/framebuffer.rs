// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Virtual framebuffer descriptors.
//!
//! The framebuffer manager owns the real render targets; the texture cache
//! only sees these descriptors via [`FramebufferNotification`]s and keeps
//! its own registry of them. Cache entries refer to framebuffers by `id`
//! (a non-owning handle), never by reference, and every destroy
//! notification must reach the cache so it can detach.

/// Non-owning framebuffer identity. 0 means "no framebuffer".
pub type FramebufferId = u32;

/// Framebuffer usage bits.
pub const FB_USAGE_DISPLAYED_ON_SCREEN: u32 = 1;
pub const FB_USAGE_RENDER_COLOR: u32 = 2;
pub const FB_USAGE_TEXTURE: u32 = 4;

/// Color format of a render target, numbered like the guest's draw formats
/// (and like the matching direct texture formats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FramebufferFormat {
    Rgb565 = 0,
    Abgr1555 = 1,
    Abgr4444 = 2,
    Abgr8888 = 3,
}

/// Descriptor of a render target known to the rasterizer.
#[derive(Debug, Clone)]
pub struct VirtualFramebuffer {
    pub id: FramebufferId,
    /// Guest address of the color buffer (VRAM offset, without the 0x04000000 bit).
    pub fb_address: u32,
    /// Row stride in pixels.
    pub fb_stride: u32,
    pub width: u32,
    pub height: u32,
    pub format: FramebufferFormat,
    /// Frame counter of the last draw into this framebuffer.
    pub last_frame_render: u32,
    /// Frame counter of the last time it was sampled or displayed.
    pub last_frame_used: u32,
    pub usage_flags: u32,
    /// Host FBO object, 0 if none was created (non-buffered rendering).
    pub fbo: u32,
}

/// Lifecycle messages from the framebuffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferNotification {
    Created,
    Updated,
    Destroyed,
}
