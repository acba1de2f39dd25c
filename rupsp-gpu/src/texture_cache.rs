// SPDX-FileCopyrightText: 2026 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Texture cache.
//!
//! Every draw call asks the cache for the texture the guest has currently
//! programmed. The cache hashes the guest bytes to decide whether a cached
//! host texture is still valid, decodes and uploads when it is not, and
//! reroutes sampling to a live render target when the guest is texturing
//! from previously rendered output.
//!
//! Hash cost is managed by a per-entry trust ladder: entries start out
//! HASHING (periodic full rehash with exponential backoff), drop to
//! UNRELIABLE when a rehash catches a change, and climb back after a quiet
//! stretch. RELIABLE entries skip rehashing entirely, which is only sound
//! while every guest write triggers an `invalidate` call.
//!
//! Entries displaced by aliasing or palette thrash get a second chance in a
//! content-hash-keyed secondary cache before their host texture dies.

use std::borrow::Cow;
use std::collections::BTreeMap;

use rupsp_common::memory::VRAM_BASE;
use rupsp_common::settings::{RenderingMode, Settings, TextureFiltering};
use rupsp_common::GuestMemory;

use crate::backend::{MagFilter, MinFilter, TextureBackend, TextureHandle, UploadError};
use crate::clut::ClutManager;
use crate::decode::{
    check_alpha, decode_texture_debug, decode_texture_level, AlphaStatus, ScratchBuffers,
};
use crate::framebuffer::{
    FramebufferFormat, FramebufferId, FramebufferNotification, VirtualFramebuffer,
    FB_USAGE_TEXTURE,
};
use crate::gpu_state::{DrawFlags, GpuState, TextureFormat, SKIPDRAW_BAD_FB_TEXTURE};
use crate::hash;
use crate::scale::{NoScaler, TextureScaler};
use crate::stats::GpuStats;

/// Entries unseen for this many frames are evicted.
pub const TEXTURE_KILL_AGE: u32 = 200;
pub const TEXTURE_KILL_AGE_LOWMEM: u32 = 60;
/// Second-chance entries age out faster. Not used in low-memory mode,
/// where the whole secondary cache empties.
pub const TEXTURE_SECOND_KILL_AGE: u32 = 100;
/// Frames between eviction sweeps. Prime, to stay off other decimation
/// cadences.
pub const TEXCACHE_DECIMATION_INTERVAL: u32 = 13;

/// Quiet frames before an UNRELIABLE entry goes back to HASHING.
const FRAMES_REGAIN_TRUST: u32 = 256;
/// Full-rehash backoff cap.
const MAX_FRAMES_UNTIL_FULL_HASH: u32 = 2048;
/// Widest plausible texture, in bytes. Invalidation ranges this far around
/// the touched bytes because entries understate their own size.
const LARGEST_TEXTURE_SIZE: u32 = 512 * 512 * 4;
/// How many rows below a framebuffer's start a texture may begin and still
/// count as sampling that framebuffer.
const MAX_SUBAREA_Y_OFFSET: u32 = 32;

/// Per-entry rehash trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// Periodically rehashed with exponential backoff.
    Hashing,
    /// Never rehashed; external invalidation is the only escape.
    Reliable,
    /// Recently caught changing; rehashed aggressively.
    Unreliable,
}

/// What kind of guest write an invalidation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationType {
    /// Ordinary write: rehash at the next lookup.
    Normal,
    /// Write that rarely lands in textures; keep some accumulated trust.
    Safe,
    /// Blanket invalidation: only hint, don't force rehash.
    All,
}

#[derive(Debug, Clone)]
struct TexCacheEntry {
    addr: u32,
    /// Deliberately half the real byte length, to shrink the invalidation
    /// blast radius.
    size_in_ram: u32,
    format: TextureFormat,
    dim: u16,
    max_level: u32,
    buf_w: u32,
    mini_hash: u32,
    full_hash: u32,
    clut_hash: u32,
    texture: TextureHandle,
    framebuffer: FramebufferId,
    /// Incremental invalidation counter; -1 flags a known-bad framebuffer
    /// attachment that must bind null.
    invalid_hint: i32,
    num_invalidated: u32,
    num_frames: u32,
    last_frame: u32,
    frames_until_next_full_hash: u32,
    trust: TrustStatus,
    alpha: AlphaStatus,
    // Last sampler state programmed for this entry's texture.
    min_filt: Option<u32>,
    mag_filt: Option<u32>,
    s_clamp: Option<bool>,
    t_clamp: Option<bool>,
    lod_bias: f32,
}

impl Default for TexCacheEntry {
    fn default() -> Self {
        Self {
            addr: 0,
            size_in_ram: 0,
            format: TextureFormat::Rgb565,
            dim: 0,
            max_level: 0,
            buf_w: 0,
            mini_hash: 0,
            full_hash: 0,
            clut_hash: 0,
            texture: 0,
            framebuffer: 0,
            invalid_hint: 0,
            num_invalidated: 0,
            num_frames: 0,
            last_frame: 0,
            frames_until_next_full_hash: 0,
            trust: TrustStatus::Hashing,
            alpha: AlphaStatus::Unknown,
            min_filt: None,
            mag_filt: None,
            s_clamp: None,
            t_clamp: None,
            lod_bias: 0.0,
        }
    }
}

impl TexCacheEntry {
    fn matches(&self, dim: u16, format: TextureFormat, max_level: u32) -> bool {
        self.dim == dim && self.format == format && self.max_level == max_level
    }

    fn second_key(&self) -> u64 {
        self.full_hash as u64 | ((self.clut_hash as u64) << 32)
    }
}

/// One-shot warning latches, so broken content logs once instead of every
/// frame.
#[derive(Default)]
struct ReportLatches {
    unknown_format: bool,
    bad_bufw: bool,
    diff_format_exact: bool,
    diff_format_clut: bool,
    subarea: bool,
}

pub struct TextureCache<B: TextureBackend> {
    cache: BTreeMap<u64, TexCacheEntry>,
    second_cache: BTreeMap<u64, TexCacheEntry>,
    fb_cache: Vec<VirtualFramebuffer>,
    scratch: ScratchBuffers,
    clut: ClutManager,
    backend: B,
    scaler: Box<dyn TextureScaler>,
    pub settings: Settings,
    pub stats: GpuStats,
    pub draw_flags: DrawFlags,
    last_bound_texture: Option<TextureHandle>,
    clear_cache_next_frame: bool,
    low_memory_mode: bool,
    decimation_counter: u32,
    num_videos: u32,
    max_anisotropy: f32,
    report: ReportLatches,
}

impl<B: TextureBackend> TextureCache<B> {
    pub fn new(backend: B, settings: Settings) -> Self {
        let max_anisotropy = backend.max_anisotropy();
        Self {
            cache: BTreeMap::new(),
            second_cache: BTreeMap::new(),
            fb_cache: Vec::new(),
            scratch: ScratchBuffers::new(),
            clut: ClutManager::new(),
            backend,
            scaler: Box::new(NoScaler),
            settings,
            stats: GpuStats::default(),
            draw_flags: DrawFlags::default(),
            last_bound_texture: None,
            clear_cache_next_frame: false,
            low_memory_mode: false,
            decimation_counter: TEXCACHE_DECIMATION_INTERVAL,
            num_videos: 0,
            max_anisotropy,
            report: ReportLatches::default(),
        }
    }

    /// Install the upscale filter.
    pub fn set_scaler(&mut self, scaler: Box<dyn TextureScaler>) {
        self.scaler = scaler;
    }

    /// Number of videos currently decoding, for the "linear during FMV"
    /// filtering preference.
    pub fn set_video_count(&mut self, count: u32) {
        self.num_videos = count;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ── Frame lifecycle ─────────────────────────────────────────────────

    /// Run once per frame before any draws: executes a queued full clear,
    /// or ticks the decimation counter.
    pub fn start_frame(&mut self) {
        self.last_bound_texture = None;
        if self.clear_cache_next_frame {
            self.clear(true);
            self.clear_cache_next_frame = false;
        } else {
            self.decimation_counter -= 1;
            if self.decimation_counter == 0 {
                self.decimation_counter = TEXCACHE_DECIMATION_INTERVAL;
                self.decimate();
            }
        }
    }

    /// Queue a full clear for the next `start_frame`.
    pub fn clear_next_frame(&mut self) {
        self.clear_cache_next_frame = true;
    }

    /// Drop everything, optionally releasing the host textures.
    pub fn clear(&mut self, delete_them: bool) {
        self.backend.bind_texture_2d(0);
        self.last_bound_texture = None;
        if delete_them {
            for entry in self.cache.values().chain(self.second_cache.values()) {
                if entry.texture != 0 {
                    log::debug!("texcache: deleting texture {}", entry.texture);
                    self.backend.delete_texture(entry.texture);
                }
            }
        }
        if !self.cache.is_empty() || !self.second_cache.is_empty() {
            log::info!(
                "texcache: cleared {} textures",
                self.cache.len() + self.second_cache.len()
            );
            self.cache.clear();
            self.second_cache.clear();
        }
    }

    /// Age-based eviction over both caches.
    fn decimate(&mut self) {
        self.backend.bind_texture_2d(0);
        self.last_bound_texture = None;
        Self::decimate_parts(
            &mut self.cache,
            &mut self.second_cache,
            &mut self.backend,
            self.low_memory_mode,
            self.stats.num_flips,
        );
    }

    fn decimate_parts(
        cache: &mut BTreeMap<u64, TexCacheEntry>,
        second_cache: &mut BTreeMap<u64, TexCacheEntry>,
        backend: &mut B,
        low_memory: bool,
        num_flips: u32,
    ) {
        let kill_age = if low_memory {
            TEXTURE_KILL_AGE_LOWMEM
        } else {
            TEXTURE_KILL_AGE
        };
        cache.retain(|_, entry| {
            if entry.last_frame + kill_age < num_flips {
                if entry.texture != 0 {
                    backend.delete_texture(entry.texture);
                }
                false
            } else {
                true
            }
        });
        second_cache.retain(|_, entry| {
            if low_memory || entry.last_frame + TEXTURE_SECOND_KILL_AGE < num_flips {
                if entry.texture != 0 {
                    backend.delete_texture(entry.texture);
                }
                false
            } else {
                true
            }
        });
    }

    // ── Invalidation ────────────────────────────────────────────────────

    /// Guest bytes `[addr, addr + size)` changed (or might have).
    pub fn invalidate(&mut self, addr: u32, size: u32, invalidation: InvalidationType) {
        let addr = addr & 0x0FFF_FFFF;
        let addr_end = addr.saturating_add(size);

        // Entries understate their size, so range generously around the
        // written bytes.
        let start_key = (addr.saturating_sub(LARGEST_TEXTURE_SIZE) as u64) << 32;
        let end_key = (addr_end.saturating_add(LARGEST_TEXTURE_SIZE) as u64) << 32;
        let stats = &mut self.stats;
        for entry in self.cache.range_mut(start_key..end_key).map(|(_, e)| e) {
            let tex_end = entry.addr + entry.size_in_ram;
            if entry.addr < addr_end && addr < tex_end {
                if entry.trust == TrustStatus::Reliable {
                    entry.trust = TrustStatus::Hashing;
                }
                if invalidation == InvalidationType::All {
                    entry.invalid_hint += 1;
                } else {
                    stats.num_texture_invalidations += 1;
                    entry.num_frames = if invalidation == InvalidationType::Safe {
                        256
                    } else {
                        0
                    };
                    entry.frames_until_next_full_hash = 0;
                }
            }
        }
    }

    /// Demote every RELIABLE entry and hint the rest.
    pub fn invalidate_all(&mut self) {
        for entry in self.cache.values_mut() {
            if entry.trust == TrustStatus::Reliable {
                entry.trust = TrustStatus::Hashing;
            }
            entry.invalid_hint += 1;
        }
    }

    // ── Framebuffer aliasing ────────────────────────────────────────────

    /// The rasterizer created, redrew, or destroyed a render target.
    pub fn notify_framebuffer(
        &mut self,
        address: u32,
        framebuffer: &VirtualFramebuffer,
        msg: FramebufferNotification,
    ) {
        // Textures sampling a framebuffer live in VRAM.
        let cache_key = ((address | VRAM_BASE) as u64) << 32;
        // A CLUT or a subarea offset lands inside this key range.
        let cache_key_end =
            cache_key + (((framebuffer.fb_stride * MAX_SUBAREA_Y_OFFSET) as u64) << 32);

        match msg {
            FramebufferNotification::Created | FramebufferNotification::Updated => {
                match self.fb_cache.iter_mut().find(|f| f.id == framebuffer.id) {
                    Some(existing) => *existing = framebuffer.clone(),
                    None => self.fb_cache.push(framebuffer.clone()),
                }
                let TextureCache {
                    ref mut cache,
                    ref fb_cache,
                    ref mut report,
                    ref settings,
                    ..
                } = *self;
                for (key, entry) in cache.range_mut(cache_key..cache_key_end) {
                    attach_framebuffer(
                        report,
                        settings,
                        fb_cache,
                        entry,
                        address | VRAM_BASE,
                        framebuffer,
                        *key == cache_key,
                    );
                }
            }
            FramebufferNotification::Destroyed => {
                self.fb_cache.retain(|f| f.id != framebuffer.id);
                for (_, entry) in self.cache.range_mut(cache_key..cache_key_end) {
                    if entry.framebuffer == framebuffer.id {
                        entry.framebuffer = 0;
                    }
                }
            }
        }
    }

    /// Bind a framebuffer alias instead of decoded pixels.
    fn set_texture_framebuffer(&mut self, entry: &mut TexCacheEntry, gstate: &GpuState) {
        let TextureCache {
            ref mut fb_cache,
            ref mut backend,
            ref mut draw_flags,
            ref settings,
            ref stats,
            num_videos,
            ..
        } = *self;

        let fb = match fb_cache.iter_mut().find(|f| f.id == entry.framebuffer) {
            Some(fb) => fb,
            None => {
                log::warn!(
                    "texcache: entry at 0x{:08X} references missing framebuffer {}",
                    entry.addr,
                    entry.framebuffer
                );
                entry.framebuffer = 0;
                backend.bind_texture_2d(0);
                return;
            }
        };

        fb.usage_flags |= FB_USAGE_TEXTURE;
        let buffered = settings.rendering_mode != RenderingMode::NonBuffered;
        if buffered {
            // An attach that was flagged invalid binds null rather than
            // sampling with the wrong color interpretation.
            if fb.fbo != 0 && entry.invalid_hint != -1 {
                backend.bind_color_as_texture(fb.fbo, 0);
                fb.last_frame_used = stats.num_flips;
            } else {
                backend.bind_texture_2d(0);
                draw_flags.skip_draw_reason |= SKIPDRAW_BAD_FB_TEXTURE;
            }
            update_sampling_params(backend, settings, num_videos, gstate, entry, false);
            draw_flags.cur_texture_width = fb.width;
            draw_flags.cur_texture_height = fb.height;
            draw_flags.flip_texture = true;
            draw_flags.texture_full_alpha = fb.format == FramebufferFormat::Rgb565;
        } else {
            fb.fbo = 0;
            backend.bind_texture_2d(0);
        }
    }

    // ── Palette entry points ────────────────────────────────────────────

    /// The guest executed a CLUT load command.
    pub fn load_clut(&mut self, gstate: &GpuState, mem: &dyn GuestMemory) {
        self.clut.load(gstate, mem);
    }

    /// Re-convert and re-hash the palette for the current `clutformat`.
    pub fn update_current_clut(&mut self, gstate: &GpuState) {
        self.clut.update(gstate);
    }

    // ── The main lookup ─────────────────────────────────────────────────

    /// Bind the texture for the upcoming draw, decoding if needed.
    pub fn set_texture(&mut self, gstate: &GpuState, mem: &dyn GuestMemory) {
        let texaddr = gstate.texture_address(0);
        if !mem.is_valid_address(texaddr) {
            log::warn!("texcache: invalid texture address 0x{texaddr:08X}");
            self.backend.bind_texture_2d(0);
            self.last_bound_texture = None;
            return;
        }

        let format = match TextureFormat::from_raw(gstate.texture_format_raw()) {
            Some(f) => f,
            None => {
                if !self.report.unknown_format {
                    self.report.unknown_format = true;
                    log::error!(
                        "texcache: unknown texture format {}",
                        gstate.texture_format_raw()
                    );
                }
                TextureFormat::Rgb565
            }
        };

        let mut cache_key = (texaddr as u64) << 32;
        let clut_hash = if format.is_indexed() {
            // The palette format register can change after the load.
            if self.clut.needs_update(gstate) {
                self.clut.update(gstate);
            }
            let h = self.clut.hash() ^ gstate.clutformat;
            cache_key |= h as u64;
            h
        } else {
            0
        };

        let w = gstate.texture_width(0);
        let h = gstate.texture_height(0);
        let bufw = gstate.level_buf_width(0);
        let mut max_level = gstate.texture_max_level();
        let dim = gstate.texture_dim(0);

        let mini = hash::mini_hash(mem.slice(texaddr, 4).unwrap_or(&[]));
        let mut full_hash = 0u32;

        self.draw_flags.flip_texture = false;
        self.draw_flags.skip_draw_reason &= !SKIPDRAW_BAD_FB_TEXTURE;
        let mut replace_images = false;

        let mut entry = match self.cache.remove(&cache_key) {
            Some(mut entry) => {
                if entry.framebuffer != 0 {
                    self.set_texture_framebuffer(&mut entry, gstate);
                    entry.last_frame = self.stats.num_flips;
                    self.last_bound_texture = None;
                    self.cache.insert(cache_key, entry);
                    return;
                }

                let mut matched = entry.matches(dim, format, max_level);
                let mut rehash = entry.trust == TrustStatus::Unreliable;
                let mut do_delete = true;

                if matched {
                    if entry.last_frame != self.stats.num_flips {
                        entry.num_frames += 1;
                    }
                    if entry.frames_until_next_full_hash == 0 {
                        // Textures are usually static: back off the rehash
                        // cadence the longer one survives.
                        entry.frames_until_next_full_hash =
                            entry.num_frames.min(MAX_FRAMES_UNTIL_FULL_HASH);
                        rehash = true;
                    } else {
                        entry.frames_until_next_full_hash -= 1;
                    }

                    // Heavily hinted entries get rechecked, small ones sooner.
                    if entry.invalid_hint > 180 || (entry.invalid_hint > 15 && dim <= 0x909) {
                        entry.invalid_hint = 0;
                        rehash = true;
                    }

                    let mut hash_fail = false;
                    if mini != entry.mini_hash {
                        full_hash = quick_hash_region(mem, texaddr, bufw, h, format);
                        hash_fail = true;
                        rehash = false;
                    }

                    if rehash && entry.trust != TrustStatus::Reliable {
                        full_hash = quick_hash_region(mem, texaddr, bufw, h, format);
                        if full_hash != entry.full_hash {
                            hash_fail = true;
                        } else if entry.trust == TrustStatus::Unreliable
                            && entry.num_frames > FRAMES_REGAIN_TRUST
                        {
                            entry.trust = TrustStatus::Hashing;
                        }
                    }

                    if hash_fail {
                        matched = false;
                        entry.trust = TrustStatus::Unreliable;
                        entry.num_frames = 0;

                        // A texture that keeps getting overwritten may be
                        // ping-ponging between a few contents; check the
                        // second-chance cache before paying for a decode.
                        if entry.num_invalidated > 2
                            && entry.num_invalidated < 128
                            && !self.low_memory_mode
                        {
                            let second_key = full_hash as u64 | ((clut_hash as u64) << 32);
                            let second_hit = self
                                .second_cache
                                .get(&second_key)
                                .is_some_and(|se| se.matches(dim, format, max_level));
                            if second_hit {
                                if entry.num_invalidated > 8 {
                                    entry.num_invalidated -= 1;
                                }
                                self.cache.insert(cache_key, entry);
                                self.bind_second_chance(second_key, gstate);
                                return;
                            } else {
                                // Park this content under its own hashes; it
                                // may come straight back.
                                let demote_key = entry.second_key();
                                let mut demoted = entry.clone();
                                demoted.framebuffer = 0;
                                if let Some(evicted) = self.second_cache.insert(demote_key, demoted)
                                {
                                    if evicted.texture != 0 && evicted.texture != entry.texture {
                                        self.backend.delete_texture(evicted.texture);
                                    }
                                }
                                entry.texture = 0;
                                do_delete = false;
                            }
                        }
                    }
                }

                if matched {
                    entry.last_frame = self.stats.num_flips;
                    if Some(entry.texture) != self.last_bound_texture {
                        self.backend.bind_texture_2d(entry.texture);
                        self.last_bound_texture = Some(entry.texture);
                        self.draw_flags.texture_full_alpha = entry.alpha == AlphaStatus::Full;
                    }
                    update_sampling_params(
                        &mut self.backend,
                        &self.settings,
                        self.num_videos,
                        gstate,
                        &mut entry,
                        false,
                    );
                    log::trace!("texcache: hit at 0x{texaddr:08X}");
                    self.cache.insert(cache_key, entry);
                    return;
                }

                entry.num_invalidated += 1;
                self.stats.num_texture_invalidations += 1;
                log::debug!("texcache: texture at 0x{texaddr:08X} changed, reloading");
                if do_delete {
                    if entry.max_level == max_level
                        && entry.dim == dim
                        && entry.format == format
                        && self.settings.texture_scaling_level <= 1
                    {
                        // Same geometry: refill the existing host texture
                        // instead of recreating it.
                        replace_images = true;
                    } else {
                        if Some(entry.texture) == self.last_bound_texture {
                            self.last_bound_texture = None;
                        }
                        if entry.texture != 0 {
                            self.backend.delete_texture(entry.texture);
                            entry.texture = 0;
                        }
                    }
                }
                if entry.trust == TrustStatus::Reliable {
                    entry.trust = TrustStatus::Hashing;
                }
                entry
            }
            None => {
                log::debug!("texcache: miss at 0x{texaddr:08X}, decoding");
                TexCacheEntry::default()
            }
        };

        if (bufw == 0 || (gstate.texbufwidth[0] & 0xF800) != 0)
            && texaddr >= rupsp_common::memory::USER_MEMORY_BASE
            && !self.report.bad_bufw
        {
            self.report.bad_bufw = true;
            log::warn!(
                "texcache: texture with unexpected bufw (full=0x{:X})",
                gstate.texbufwidth[0] & 0xFFFF
            );
        }

        // Set up the entry for decode.
        entry.addr = texaddr;
        entry.mini_hash = mini;
        entry.format = format;
        entry.last_frame = self.stats.num_flips;
        entry.framebuffer = 0;
        entry.max_level = max_level;
        entry.lod_bias = 0.0;
        entry.dim = dim;
        entry.buf_w = bufw;
        // Underestimate on purpose: a full-size estimate would catch far
        // more invalidations than it avoids stale pixels.
        entry.size_in_ram =
            ((format.bits_per_pixel() as u64 * bufw as u64 * h as u64 / 2) / 8) as u32;
        entry.full_hash = if full_hash == 0 {
            quick_hash_region(mem, texaddr, bufw, h, format)
        } else {
            full_hash
        };
        entry.clut_hash = clut_hash;

        self.draw_flags.cur_texture_width = w;
        self.draw_flags.cur_texture_height = h;

        // Render-to-texture check before touching pixel data.
        {
            let TextureCache {
                ref fb_cache,
                ref mut report,
                ref settings,
                ..
            } = *self;
            for fb in fb_cache {
                let key_start = ((fb.fb_address | VRAM_BASE) as u64) << 32;
                let key_end =
                    key_start + (((fb.fb_stride * MAX_SUBAREA_Y_OFFSET) as u64) << 32);
                if cache_key >= key_start && cache_key < key_end {
                    attach_framebuffer(
                        report,
                        settings,
                        fb_cache,
                        &mut entry,
                        fb.fb_address | VRAM_BASE,
                        fb,
                        cache_key == key_start,
                    );
                }
            }
        }

        if entry.framebuffer != 0 {
            self.set_texture_framebuffer(&mut entry, gstate);
            entry.last_frame = self.stats.num_flips;
            self.last_bound_texture = None;
            self.cache.insert(cache_key, entry);
            return;
        }

        if !replace_images {
            entry.texture = self.backend.gen_texture();
        }
        self.backend.bind_texture_2d(entry.texture);
        self.last_bound_texture = Some(entry.texture);

        // Drop mip levels whose data isn't actually there.
        for level in 1..=max_level as usize {
            if !mem.is_valid_address(gstate.texture_address(level)) {
                max_level = level as u32 - 1;
                break;
            }
        }
        entry.max_level = max_level;

        if self.settings.mipmap_enabled {
            // Games often omit the lower levels, so host-generated mips are
            // more predictable than whatever lives at those addresses.
            self.load_texture_level(&mut entry, gstate, mem, 0, replace_images);
            if max_level > 0 {
                self.backend.generate_mipmap();
            }
        } else {
            self.load_texture_level(&mut entry, gstate, mem, 0, replace_images);
            self.backend.set_max_level(0);
        }

        let aniso = (1u32 << self.settings.anisotropy_level) as f32;
        self.backend.set_anisotropy(aniso.min(self.max_anisotropy));

        update_sampling_params(
            &mut self.backend,
            &self.settings,
            self.num_videos,
            gstate,
            &mut entry,
            true,
        );

        self.draw_flags.texture_full_alpha = entry.alpha == AlphaStatus::Full;
        self.cache.insert(cache_key, entry);
    }

    /// Rebind a second-chance entry that matched the current content.
    fn bind_second_chance(&mut self, second_key: u64, gstate: &GpuState) {
        let TextureCache {
            ref mut second_cache,
            ref mut backend,
            ref mut draw_flags,
            ref mut last_bound_texture,
            ref settings,
            ref stats,
            num_videos,
            ..
        } = *self;
        let entry = match second_cache.get_mut(&second_key) {
            Some(entry) => entry,
            None => return,
        };
        entry.last_frame = stats.num_flips;
        if Some(entry.texture) != *last_bound_texture {
            backend.bind_texture_2d(entry.texture);
            *last_bound_texture = Some(entry.texture);
            draw_flags.texture_full_alpha = entry.alpha == AlphaStatus::Full;
        }
        update_sampling_params(backend, settings, num_videos, gstate, entry, false);
    }

    /// Decode one level and upload it.
    fn load_texture_level(
        &mut self,
        entry: &mut TexCacheEntry,
        gstate: &GpuState,
        mem: &dyn GuestMemory,
        level: usize,
        replace_images: bool,
    ) {
        let bufw = gstate.level_buf_width(level);
        let decoded = match decode_texture_level(
            &mut self.scratch,
            &self.clut,
            gstate,
            mem,
            entry.format,
            level,
            bufw,
        ) {
            Some(d) => d,
            None => {
                log::error!(
                    "texcache: level {level} of texture at 0x{:08X} has no backing data",
                    entry.addr
                );
                return;
            }
        };

        self.stats.num_textures_decoded += 1;
        self.backend
            .set_unpack_alignment(decoded.format.byte_align());

        let mut scale_factor = self.settings.texture_scaling_level;
        // The kernel's own UI texture stays unscaled.
        if entry.addr > 0x0500_0000 && entry.addr < 0x0880_0000 {
            scale_factor = 1;
        }

        let mut data: Cow<[u8]> = Cow::Borrowed(decoded.data);
        let mut w = decoded.width;
        let mut h = decoded.height;
        if scale_factor > 1 && entry.num_invalidated == 0 {
            if let Some((scaled, sw, sh)) =
                self.scaler
                    .scale(&data, decoded.format, w, h, scale_factor)
            {
                data = Cow::Owned(scaled);
                w = sw;
                h = sh;
            }
        }

        // Textures that keep churning skip the alpha scan and stay Unknown.
        entry.alpha = if entry.num_invalidated == 0 {
            check_alpha(&data, decoded.format, (w * h) as usize)
        } else {
            AlphaStatus::Unknown
        };

        if replace_images {
            self.backend
                .tex_sub_image_2d(level as u32, decoded.format, w, h, &data);
        } else if let Err(UploadError::OutOfMemory) =
            self.backend
                .tex_image_2d(level as u32, decoded.format, w, h, &data)
        {
            log::warn!("texcache: host out of memory, entering low-memory mode");
            self.low_memory_mode = true;
            Self::decimate_parts(
                &mut self.cache,
                &mut self.second_cache,
                &mut self.backend,
                true,
                self.stats.num_flips,
            );
            // Decimation may disturb the binding; restore it for the retry.
            self.backend.bind_texture_2d(entry.texture);
            self.last_bound_texture = Some(entry.texture);
            if self
                .backend
                .tex_image_2d(level as u32, decoded.format, w, h, &data)
                .is_err()
            {
                log::error!("texcache: upload failed twice, giving up on this texture");
            }
        }
    }

    /// Decode the current texture to ARGB8888 for debug display.
    pub fn decode_texture_argb(
        &mut self,
        output: &mut Vec<u32>,
        gstate: &GpuState,
        mem: &dyn GuestMemory,
    ) -> bool {
        decode_texture_debug(output, &mut self.scratch, &self.clut, gstate, mem)
    }
}

/// Quick-hash the backing bytes of a texture image.
fn quick_hash_region(
    mem: &dyn GuestMemory,
    addr: u32,
    bufw: u32,
    h: u32,
    format: TextureFormat,
) -> u32 {
    let size = (format.bits_per_pixel() as u64 * bufw as u64 * h as u64 / 8).min(u32::MAX as u64);
    let avail = mem.valid_extent(addr).min(size as u32);
    match mem.slice(addr, avail) {
        Some(data) => hash::quick_tex_hash(data),
        None => 0,
    }
}

/// Sampler translation with per-entry memoization.
fn update_sampling_params<B: TextureBackend>(
    backend: &mut B,
    settings: &Settings,
    num_videos: u32,
    gstate: &GpuState,
    entry: &mut TexCacheEntry,
    force: bool,
) {
    let mut min_filt = gstate.texfilter & 7;
    let mut mag_filt = (gstate.texfilter >> 8) & 1;
    let s_clamp = gstate.is_tex_coord_clamped_s();
    let t_clamp = gstate.is_tex_coord_clamped_t();

    // Both encodings lock the LOD to level 0.
    let no_mip = matches!(gstate.texlevel & 0xFF_FFFF, 0x00_0001 | 0x10_0001);

    if entry.max_level == 0 {
        // No mip levels were uploaded; don't let the host sample them.
        min_filt &= 1;
    } else {
        // Sign and direction of the guest bias are unverified; keep it off.
        let lod_bias = 0.0;
        if force || entry.lod_bias != lod_bias {
            backend.set_lod_bias(lod_bias);
            entry.lod_bias = lod_bias;
        }
    }

    let force_linear = settings.texture_filtering == TextureFiltering::Linear
        || (settings.texture_filtering == TextureFiltering::LinearVideo && num_videos > 0);
    if force_linear && !gstate.is_color_test_enabled() {
        mag_filt |= 1;
        min_filt |= 1;
    }
    if settings.texture_filtering == TextureFiltering::Nearest {
        mag_filt &= !1;
        min_filt &= !1;
    }
    if !settings.mipmap_enabled || no_mip {
        mag_filt &= 1;
        min_filt &= 1;
    }

    if force || entry.min_filt != Some(min_filt) {
        backend.set_min_filter(MinFilter::from_index(min_filt));
        entry.min_filt = Some(min_filt);
    }
    if force || entry.mag_filt != Some(mag_filt) {
        backend.set_mag_filter(MagFilter::from_index(mag_filt));
        entry.mag_filt = Some(mag_filt);
    }
    if force || entry.s_clamp != Some(s_clamp) {
        backend.set_clamp_s(s_clamp);
        entry.s_clamp = Some(s_clamp);
    }
    if force || entry.t_clamp != Some(t_clamp) {
        backend.set_clamp_t(t_clamp);
        entry.t_clamp = Some(t_clamp);
    }
}

/// Attach `fb` to `entry` if the address relationship and formats allow it.
fn attach_framebuffer(
    report: &mut ReportLatches,
    settings: &Settings,
    fb_cache: &[VirtualFramebuffer],
    entry: &mut TexCacheEntry,
    address: u32,
    fb: &VirtualFramebuffer,
    exact_match: bool,
) {
    let formats_equal = entry.format as u8 == fb.format as u8;

    if exact_match {
        log::debug!("texcache: render-to-texture detected at 0x{address:08X}");
        if entry.framebuffer == 0 {
            if !formats_equal {
                if !report.diff_format_exact {
                    report.diff_format_exact = true;
                    log::warn!(
                        "texcache: render-to-texture with different formats {:?} != {:?}",
                        entry.format,
                        fb.format
                    );
                }
                attach_framebuffer_invalid(entry, fb);
            } else {
                attach_framebuffer_valid(fb_cache, entry, fb);
            }
        }
    } else if settings.rendering_mode == RenderingMode::NonBuffered
        || settings.rendering_mode == RenderingMode::Buffered
    {
        // Some games render into a texture they then sample with a CLUT.
        let compat_format = formats_equal
            || (fb.format == FramebufferFormat::Abgr8888 && entry.format == TextureFormat::Clut32)
            || (fb.format != FramebufferFormat::Abgr8888 && entry.format == TextureFormat::Clut16);

        if entry.buf_w != 0 && fb.fb_stride == entry.buf_w && compat_format {
            if !formats_equal {
                if !report.diff_format_clut {
                    report.diff_format_clut = true;
                    log::warn!(
                        "texcache: render-to-texture with different formats {:?} != {:?} at 0x{address:08X}",
                        entry.format,
                        fb.format
                    );
                }
                attach_framebuffer_valid(fb_cache, entry, fb);
            } else if (entry.addr - address) / entry.buf_w < fb.height {
                if !report.subarea {
                    report.subarea = true;
                    log::warn!(
                        "texcache: render to area containing texture at 0x{address:08X}"
                    );
                }
                // TODO: track the y offset; until then this samples from
                // the framebuffer's top-left.
                attach_framebuffer_valid(fb_cache, entry, fb);
            }
        }
    }
}

fn attach_framebuffer_valid(
    fb_cache: &[VirtualFramebuffer],
    entry: &mut TexCacheEntry,
    fb: &VirtualFramebuffer,
) {
    let has_invalid = entry.framebuffer == 0 || entry.invalid_hint == -1;
    let current_render = fb_cache
        .iter()
        .find(|f| f.id == entry.framebuffer)
        .map_or(0, |f| f.last_frame_render);
    let has_older = entry.framebuffer != 0 && current_render < fb.last_frame_render;
    if has_invalid || has_older {
        entry.framebuffer = fb.id;
        entry.invalid_hint = 0;
    }
}

fn attach_framebuffer_invalid(entry: &mut TexCacheEntry, fb: &VirtualFramebuffer) {
    if entry.framebuffer == 0 || entry.framebuffer == fb.id {
        entry.framebuffer = fb.id;
        entry.invalid_hint = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FramebufferFormat;
    use rupsp_common::memory::{FlatMemory, RAM_BASE};

    struct RecordingBackend {
        next_handle: TextureHandle,
        binds: Vec<TextureHandle>,
        deleted: Vec<TextureHandle>,
        gen_count: u32,
        tex_image_calls: u32,
        tex_sub_calls: u32,
        mipmap_calls: u32,
        min_filter_calls: u32,
        fbo_binds: Vec<u32>,
        fail_uploads: u32,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                next_handle: 1,
                binds: Vec::new(),
                deleted: Vec::new(),
                gen_count: 0,
                tex_image_calls: 0,
                tex_sub_calls: 0,
                mipmap_calls: 0,
                min_filter_calls: 0,
                fbo_binds: Vec::new(),
                fail_uploads: 0,
            }
        }
    }

    impl TextureBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        fn gen_texture(&mut self) -> TextureHandle {
            self.gen_count += 1;
            let handle = self.next_handle;
            self.next_handle += 1;
            handle
        }

        fn delete_texture(&mut self, texture: TextureHandle) {
            self.deleted.push(texture);
        }

        fn bind_texture_2d(&mut self, texture: TextureHandle) {
            self.binds.push(texture);
        }

        fn tex_image_2d(
            &mut self,
            _level: u32,
            _format: crate::convert::DecodedFormat,
            _width: u32,
            _height: u32,
            _data: &[u8],
        ) -> Result<(), UploadError> {
            self.tex_image_calls += 1;
            if self.fail_uploads > 0 {
                self.fail_uploads -= 1;
                return Err(UploadError::OutOfMemory);
            }
            Ok(())
        }

        fn tex_sub_image_2d(
            &mut self,
            _level: u32,
            _format: crate::convert::DecodedFormat,
            _width: u32,
            _height: u32,
            _data: &[u8],
        ) {
            self.tex_sub_calls += 1;
        }

        fn generate_mipmap(&mut self) {
            self.mipmap_calls += 1;
        }

        fn bind_color_as_texture(&mut self, fbo: u32, _unit: u32) {
            self.fbo_binds.push(fbo);
        }

        fn set_min_filter(&mut self, _filter: MinFilter) {
            self.min_filter_calls += 1;
        }

        fn max_anisotropy(&self) -> f32 {
            16.0
        }
    }

    fn new_cache() -> TextureCache<RecordingBackend> {
        TextureCache::new(RecordingBackend::new(), Settings::default())
    }

    fn gstate_for(addr: u32, format: u32, log2_w: u32, log2_h: u32, bufw: u32) -> GpuState {
        let mut gs = GpuState::default();
        gs.texaddr[0] = addr & 0x00FF_FFF0;
        gs.texbufwidth[0] = bufw | ((addr >> 8) & 0x000F_0000);
        gs.texsize[0] = log2_w | (log2_h << 8);
        gs.texformat = format;
        gs.clutformat = 3 | (0xFF << 8);
        gs
    }

    fn fill_8888(mem: &mut FlatMemory, addr: u32, pixels: u32) {
        let mut bytes = Vec::with_capacity(pixels as usize * 4);
        for i in 0..pixels {
            bytes.extend_from_slice(&(0xFF00_0000u32 | i).to_le_bytes());
        }
        mem.write_bytes(addr, &bytes).unwrap();
    }

    #[test]
    fn test_stable_texture_decodes_once() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 64 * 64);
        let gs = gstate_for(RAM_BASE, 3, 6, 6, 64);
        let mut cache = new_cache();

        for frame in 0..60 {
            cache.stats.num_flips = frame;
            cache.start_frame();
            cache.set_texture(&gs, &mem);
        }

        assert_eq!(cache.backend.tex_image_calls, 1);
        assert_eq!(cache.stats.num_textures_decoded, 1);
        assert_eq!(cache.backend.gen_count, 1);
        assert_eq!(cache.cache.len(), 1);
        // Fully opaque pixels were noticed on the decode.
        assert!(cache.draw_flags.texture_full_alpha);
    }

    #[test]
    fn test_second_lookup_in_frame_skips_bind() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();

        cache.start_frame();
        cache.set_texture(&gs, &mem);
        let binds_after_first = cache.backend.binds.len();
        let filters_after_first = cache.backend.min_filter_calls;
        cache.set_texture(&gs, &mem);

        // The second identical lookup neither rebinds nor reprograms.
        assert_eq!(cache.backend.binds.len(), binds_after_first);
        assert_eq!(cache.backend.min_filter_calls, filters_after_first);
        assert_eq!(cache.stats.num_textures_decoded, 1);
    }

    #[test]
    fn test_sampler_reprogrammed_on_filter_change() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let mut gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();

        cache.start_frame();
        cache.set_texture(&gs, &mem);
        let filters = cache.backend.min_filter_calls;

        gs.texfilter = 1; // switch min filter to linear
        cache.set_texture(&gs, &mem);
        assert_eq!(cache.backend.min_filter_calls, filters + 1);
    }

    #[test]
    fn test_self_modifying_texture_redecodes() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();

        for frame in 0..10 {
            mem.write_u32(RAM_BASE, 0x1000 + frame).unwrap();
            cache.stats.num_flips = frame;
            cache.start_frame();
            cache.invalidate(RAM_BASE, 16 * 16 * 4, InvalidationType::Normal);
            cache.set_texture(&gs, &mem);
        }

        // Re-decoded on every modified frame; trust never rises.
        assert_eq!(cache.stats.num_textures_decoded, 10);
        let entry = cache.cache.values().next().unwrap();
        assert_ne!(entry.trust, TrustStatus::Reliable);
        // Churning textures don't get alpha-scanned.
        assert_eq!(entry.alpha, AlphaStatus::Unknown);
        // Early re-uploads reuse the same host texture in place.
        assert!(cache.backend.tex_sub_calls >= 3);
    }

    #[test]
    fn test_clut_swap_keeps_both_entries() {
        let mut mem = FlatMemory::new();
        let clut_addr = RAM_BASE + 0x8000;
        let idx: Vec<u8> = (0..64).map(|i| (i % 16) as u8).collect();
        mem.write_bytes(RAM_BASE, &idx).unwrap();

        let mut gs = gstate_for(RAM_BASE, 5, 3, 3, 8); // 8x8 CLUT8
        gs.clutformat = 2 | (0xFF << 8);
        gs.clutaddr = clut_addr;
        gs.clutloadbytes = 32;

        let mut cache = new_cache();
        for frame in 0..6 {
            let palette_byte = if frame % 2 == 0 { 0x11 } else { 0x77 };
            mem.write_bytes(clut_addr, &[palette_byte; 32]).unwrap();
            cache.load_clut(&gs, &mem);
            cache.stats.num_flips = frame as u32;
            cache.start_frame();
            cache.set_texture(&gs, &mem);
        }

        // One entry per palette, each decoded exactly once.
        assert_eq!(cache.cache.len(), 2);
        assert_eq!(cache.stats.num_textures_decoded, 2);
    }

    fn test_framebuffer(id: u32, address: u32, fbo: u32) -> VirtualFramebuffer {
        VirtualFramebuffer {
            id,
            fb_address: address,
            fb_stride: 64,
            width: 64,
            height: 64,
            format: FramebufferFormat::Abgr8888,
            last_frame_render: 0,
            last_frame_used: 0,
            usage_flags: 0,
            fbo,
        }
    }

    #[test]
    fn test_render_to_texture_binds_framebuffer() {
        let mem = FlatMemory::new();
        let fb_offset = 0x088000;
        let texaddr = VRAM_BASE | fb_offset;
        let gs = gstate_for(texaddr, 3, 6, 6, 64);
        let mut cache = new_cache();

        let fb = test_framebuffer(7, fb_offset, 42);
        cache.notify_framebuffer(fb_offset, &fb, FramebufferNotification::Created);

        cache.start_frame();
        cache.set_texture(&gs, &mem);

        assert_eq!(cache.backend.fbo_binds, vec![42]);
        assert_eq!(cache.backend.tex_image_calls, 0);
        assert_eq!(cache.stats.num_textures_decoded, 0);
        assert!(cache.draw_flags.flip_texture);
        // The framebuffer now knows it's being sampled.
        assert!(cache.fb_cache[0].usage_flags & FB_USAGE_TEXTURE != 0);

        // Subsequent lookups take the framebuffer path straight away.
        cache.set_texture(&gs, &mem);
        assert_eq!(cache.backend.fbo_binds, vec![42, 42]);
        assert_eq!(cache.stats.num_textures_decoded, 0);
    }

    #[test]
    fn test_framebuffer_destroy_detaches() {
        let mem = FlatMemory::new();
        let fb_offset = 0x088000;
        let texaddr = VRAM_BASE | fb_offset;
        let gs = gstate_for(texaddr, 3, 6, 6, 64);
        let mut cache = new_cache();

        let fb = test_framebuffer(7, fb_offset, 42);
        cache.notify_framebuffer(fb_offset, &fb, FramebufferNotification::Created);
        cache.start_frame();
        cache.set_texture(&gs, &mem);
        assert!(cache.cache.values().any(|e| e.framebuffer == 7));

        cache.notify_framebuffer(fb_offset, &fb, FramebufferNotification::Destroyed);
        assert!(cache.fb_cache.is_empty());
        assert!(cache.cache.values().all(|e| e.framebuffer == 0));
    }

    #[test]
    fn test_mismatched_framebuffer_format_skips_draw() {
        let mem = FlatMemory::new();
        let fb_offset = 0x088000;
        let texaddr = VRAM_BASE | fb_offset;
        let gs = gstate_for(texaddr, 0, 6, 6, 64); // RGB565 texture
        let mut cache = new_cache();

        let fb = test_framebuffer(9, fb_offset, 43); // ABGR8888 framebuffer
        cache.notify_framebuffer(fb_offset, &fb, FramebufferNotification::Created);
        cache.start_frame();
        cache.set_texture(&gs, &mem);

        // Invalid attach: null texture and a skip-draw flag, no fbo bind.
        assert!(cache.backend.fbo_binds.is_empty());
        assert!(cache.draw_flags.skip_draw_reason & SKIPDRAW_BAD_FB_TEXTURE != 0);
        assert_eq!(*cache.backend.binds.last().unwrap(), 0);
    }

    #[test]
    fn test_thrash_promotes_from_second_chance() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();

        let mut decodes_at_frame5 = 0;
        for frame in 0..16 {
            let tag = if frame % 2 == 0 { 0xAAAA_AAAA } else { 0xBBBB_BBBB };
            mem.write_u32(RAM_BASE, tag).unwrap();
            cache.stats.num_flips = frame;
            cache.start_frame();
            cache.set_texture(&gs, &mem);
            if frame == 5 {
                decodes_at_frame5 = cache.stats.num_textures_decoded;
            }
        }

        // The displaced content was parked in the secondary cache and
        // every later reappearance rebinds it without decoding.
        assert_eq!(cache.second_cache.len(), 1);
        assert_eq!(cache.stats.num_textures_decoded, decodes_at_frame5);

        // Both host textures are alive: one in each cache.
        let primary = cache.cache.values().next().unwrap();
        let second = cache.second_cache.values().next().unwrap();
        assert_ne!(primary.texture, second.texture);
        assert!(cache.backend.deleted.is_empty());
    }

    #[test]
    fn test_decimation_evicts_everything() {
        let mut mem = FlatMemory::new();
        let mut cache = new_cache();

        for i in 0..100u32 {
            let addr = RAM_BASE + i * 0x400;
            fill_8888(&mut mem, addr, 8 * 8);
            let gs = gstate_for(addr, 3, 3, 3, 8);
            cache.set_texture(&gs, &mem);
        }
        assert_eq!(cache.cache.len(), 100);

        cache.stats.num_flips = TEXTURE_KILL_AGE + TEXCACHE_DECIMATION_INTERVAL + 2;
        for _ in 0..TEXCACHE_DECIMATION_INTERVAL {
            cache.start_frame();
        }

        assert!(cache.cache.is_empty());
        assert!(cache.second_cache.is_empty());
        assert_eq!(cache.backend.deleted.len(), 100);
    }

    #[test]
    fn test_invalidate_respects_boundaries() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 64 * 64);
        let gs = gstate_for(RAM_BASE, 3, 6, 6, 64);
        let mut cache = new_cache();
        cache.start_frame();
        cache.set_texture(&gs, &mem);

        let key = *cache.cache.keys().next().unwrap();
        let size_in_ram = cache.cache[&key].size_in_ram;
        cache.cache.get_mut(&key).unwrap().trust = TrustStatus::Reliable;

        // Ends exactly at the entry start: untouched.
        cache.invalidate(RAM_BASE - 16, 16, InvalidationType::Normal);
        assert_eq!(cache.cache[&key].trust, TrustStatus::Reliable);

        // Starts exactly at the entry end: untouched.
        cache.invalidate(RAM_BASE + size_in_ram, 64, InvalidationType::Normal);
        assert_eq!(cache.cache[&key].trust, TrustStatus::Reliable);

        // Overlapping write demotes and forces a rehash.
        cache.invalidate(RAM_BASE + 4, 8, InvalidationType::Normal);
        assert_eq!(cache.cache[&key].trust, TrustStatus::Hashing);
        assert_eq!(cache.cache[&key].frames_until_next_full_hash, 0);
    }

    #[test]
    fn test_invalidate_safe_keeps_some_trust() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();
        cache.start_frame();
        cache.set_texture(&gs, &mem);

        cache.invalidate(RAM_BASE, 64, InvalidationType::Safe);
        let entry = cache.cache.values().next().unwrap();
        assert_eq!(entry.num_frames, 256);

        cache.invalidate(RAM_BASE, 64, InvalidationType::Normal);
        let entry = cache.cache.values().next().unwrap();
        assert_eq!(entry.num_frames, 0);
    }

    #[test]
    fn test_invalidate_all_demotes_reliable() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();
        cache.start_frame();
        cache.set_texture(&gs, &mem);

        let key = *cache.cache.keys().next().unwrap();
        cache.cache.get_mut(&key).unwrap().trust = TrustStatus::Reliable;
        cache.invalidate_all();
        assert_eq!(cache.cache[&key].trust, TrustStatus::Hashing);
        assert_eq!(cache.cache[&key].invalid_hint, 1);
    }

    #[test]
    fn test_oom_enters_low_memory_and_retries_once() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();
        cache.backend.fail_uploads = 1;

        cache.start_frame();
        cache.set_texture(&gs, &mem);

        assert!(cache.low_memory_mode);
        assert_eq!(cache.backend.tex_image_calls, 2);
    }

    #[test]
    fn test_unknown_format_coerces_to_565() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let mut gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        gs.texformat = 12;
        let mut cache = new_cache();

        cache.start_frame();
        cache.set_texture(&gs, &mem);

        assert_eq!(cache.stats.num_textures_decoded, 1);
        let entry = cache.cache.values().next().unwrap();
        assert_eq!(entry.format, TextureFormat::Rgb565);
        assert!(cache.report.unknown_format);
    }

    #[test]
    fn test_invalid_address_binds_null() {
        let mem = FlatMemory::new();
        let gs = gstate_for(0x0300_0000, 3, 4, 4, 16);
        let mut cache = new_cache();

        cache.start_frame();
        cache.set_texture(&gs, &mem);

        assert_eq!(cache.backend.binds, vec![0]);
        assert_eq!(cache.backend.gen_count, 0);
        assert!(cache.cache.is_empty());
    }

    #[test]
    fn test_clear_next_frame_runs_deferred() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        let mut cache = new_cache();
        cache.start_frame();
        cache.set_texture(&gs, &mem);
        assert_eq!(cache.cache.len(), 1);

        cache.clear_next_frame();
        cache.start_frame();
        assert!(cache.cache.is_empty());
        assert_eq!(cache.backend.deleted.len(), 1);
    }

    #[test]
    fn test_mipmapped_texture_generates_host_mips() {
        let mut mem = FlatMemory::new();
        fill_8888(&mut mem, RAM_BASE, 16 * 16);
        let mut gs = gstate_for(RAM_BASE, 3, 4, 4, 16);
        gs.texmode = 2 << 16; // two extra levels
        for level in 1..3 {
            gs.texaddr[level] = gs.texaddr[0];
            gs.texbufwidth[level] = gs.texbufwidth[0];
            gs.texsize[level] = gs.texsize[0];
        }
        let mut cache = new_cache();

        cache.start_frame();
        cache.set_texture(&gs, &mem);

        // Level 0 decoded once; the rest come from the host generator.
        assert_eq!(cache.stats.num_textures_decoded, 1);
        assert_eq!(cache.backend.mipmap_calls, 1);
    }
}
