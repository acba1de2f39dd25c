// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Null texture backend — uploads are dropped on the floor.
//!
//! Used for headless runs and bring-up. Handles are still allocated
//! uniquely so the cache's ownership bookkeeping stays meaningful.

use super::{TextureBackend, TextureHandle, UploadError};
use crate::convert::DecodedFormat;

pub struct NullBackend {
    next_handle: TextureHandle,
}

impl NullBackend {
    pub fn new() -> Self {
        Self { next_handle: 1 }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn gen_texture(&mut self) -> TextureHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn delete_texture(&mut self, _texture: TextureHandle) {}

    fn bind_texture_2d(&mut self, _texture: TextureHandle) {}

    fn tex_image_2d(
        &mut self,
        _level: u32,
        _format: DecodedFormat,
        _width: u32,
        _height: u32,
        _data: &[u8],
    ) -> Result<(), UploadError> {
        Ok(())
    }

    fn tex_sub_image_2d(
        &mut self,
        _level: u32,
        _format: DecodedFormat,
        _width: u32,
        _height: u32,
        _data: &[u8],
    ) {
    }
}
