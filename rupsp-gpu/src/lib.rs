// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU rasterizer backend for rupsp.
//!
//! The centerpiece is the [`TextureCache`]: given the guest GPU's texture
//! registers it produces a bound, decoded host texture for the next draw,
//! reusing previous decodes whenever the guest bytes haven't changed and
//! rerouting sampling to render targets for render-to-texture.

pub mod backend;
pub mod clut;
pub mod convert;
pub mod decode;
pub mod dxt;
pub mod framebuffer;
pub mod gpu_state;
pub mod hash;
pub mod scale;
pub mod stats;
pub mod texture_cache;
pub mod unswizzle;

pub use texture_cache::{InvalidationType, TextureCache, TrustStatus};
