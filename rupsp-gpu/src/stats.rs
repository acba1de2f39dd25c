// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Frame-level GPU counters.

/// Counters the GPU updates as it runs. `num_flips` is the monotonic frame
/// counter every cache aging decision is based on.
#[derive(Debug, Clone, Default)]
pub struct GpuStats {
    pub num_flips: u32,
    pub num_texture_invalidations: u32,
    pub num_textures_decoded: u32,
}
