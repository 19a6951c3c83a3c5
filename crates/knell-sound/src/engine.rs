// engine.rs — channel scheduler and lifecycle
//
// All state lives on the SoundEngine value; the backend driver and the
// world-state client are passed into each operation. Backend callbacks
// (channel_ended, channel_virtual_changed) are methods the host invokes on
// the game thread.

use std::collections::HashMap;

use log::error;
use rand::Rng;

use knell_common::math::{distance_squared, Vec3};

use crate::backend::{SoundBackend, SoundClient};
use crate::cache::LoadBuffer;
use crate::channel::{ChanId, ChannelPool, SoundChan};
use crate::registry::{RandomSoundList, SfxInfo, MAX_LINK_DEPTH, NO_LINK};
use crate::types::{
    ChanFlags, Listener, LumpNum, Rolloff, RolloffKind, SfxFlags, SoundSource, StartFlags,
    VoiceHandle, CHAN_AUTO, DEFAULT_PITCH,
};

pub struct SoundEngine {
    pub(crate) sfx: Vec<SfxInfo>,
    pub(crate) rnd: Vec<RandomSoundList>,
    pub(crate) resid_map: HashMap<i32, u32>,
    pub(crate) sound_curve: Vec<u8>,
    pub(crate) global_rolloff: Rolloff,
    pub(crate) channels: ChannelPool,
    pub(crate) listener: Listener,
    pub(crate) paused: bool,
    pub(crate) restart_evictions_at: i32,
    pub(crate) enabled: bool,
    /// Lump substituted for sounds that are missing or failed to decode.
    pub(crate) empty_lump: LumpNum,
}

impl Default for SoundEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundEngine {
    pub fn new() -> Self {
        SoundEngine {
            // Entry 0 is the reserved null sound.
            sfx: vec![SfxInfo::new("", -1, 0, -1)],
            rnd: Vec::new(),
            resid_map: HashMap::new(),
            sound_curve: Vec::new(),
            global_rolloff: Rolloff::default(),
            channels: ChannelPool::new(),
            listener: Listener::default(),
            paused: false,
            restart_evictions_at: 0,
            enabled: true,
            empty_lump: -1,
        }
    }

    /// Frees every channel and installs the custom rolloff curve and the
    /// empty-sound sentinel lump.
    pub fn init(&mut self, sound_curve: Vec<u8>, empty_lump: LumpNum) {
        for id in self.channels.active() {
            self.channels.return_channel(id);
        }
        self.sound_curve = sound_curve;
        self.empty_lump = empty_lump;
    }

    /// Drops all playback and definitions back to the empty registry.
    pub fn clear(&mut self, backend: &mut dyn SoundBackend) {
        self.stop_all_channels(backend);
        self.unload_all_sounds(backend);
        self.sfx.truncate(1);
        self.resid_map.clear();
        self.rnd.clear();
    }

    pub fn shutdown(&mut self, backend: &mut dyn SoundBackend) {
        self.stop_all_channels(backend);
    }

    pub fn set_listener(&mut self, listener: Listener) {
        self.listener = listener;
    }

    /// Fence: no eviction restart is attempted before this time.
    pub fn set_restart_time(&mut self, time: i32) {
        self.restart_evictions_at = time;
    }

    pub fn set_paused(&mut self, on: bool) {
        self.paused = on;
    }

    /// Globally enables or disables sound starts.
    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    pub fn global_rolloff_mut(&mut self) -> &mut Rolloff {
        &mut self.global_rolloff
    }

    pub fn is_listener(&self, source: &SoundSource) -> bool {
        match (source, self.listener.listener_object) {
            (SoundSource::Actor(id), Some(obj)) => *id == obj,
            _ => false,
        }
    }

    pub fn chan(&self, id: ChanId) -> &SoundChan {
        self.channels.chan(id)
    }

    // ============================================================
    // StartSound
    // ============================================================

    /// Schedules a sound onto a channel. `channel` carries the emitter slot
    /// in its low bits and CHAN_* modifier flags above them. Zero
    /// attenuation plays 2D at the listener; positive attenuation scales
    /// distance for 3D playback. Returns the channel id, or None when the
    /// start was refused or the sound was dropped by policy.
    #[allow(clippy::too_many_arguments)]
    pub fn start_sound(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        source: SoundSource,
        channel: i32,
        sound_id: u32,
        volume: f32,
        attenuation: f32,
        forced_rolloff: Option<Rolloff>,
        spitch: f32,
    ) -> Option<ChanId> {
        if sound_id == 0 || sound_id as usize >= self.sfx.len() || volume <= 0.0 || !self.enabled
        {
            return None;
        }

        let org_id = sound_id;
        let mut chanflags = ChanFlags::from_bits_truncate((channel & !7) as u32);
        let mut channel = channel & 7;

        let (pos, vel) = client.calc_pos_vel(&source, channel, chanflags);
        if !client.validate_pos_vel(&source, &pos, &vel) {
            return None;
        }

        let mut sound_id = sound_id;
        let sfx = &self.sfx[sound_id as usize];

        // Scale volume by the sound's own setting.
        let volume = (volume * sfx.volume).min(1.0);
        if volume <= 0.0 {
            return None;
        }

        // A link must not contribute the referenced sound's NearLimit, so
        // these are latched before resolution.
        let mut near_limit = sfx.near_limit;
        let mut limit_range = sfx.limit_range;
        let pitch_mask = sfx.pitch_mask;
        let mut rolloff = sfx.rolloff;
        let mut attenuation = attenuation;

        // Resolve random headers and aliases.
        let mut depth = 0;
        while self.sfx[sound_id as usize].link != NO_LINK {
            if depth >= MAX_LINK_DEPTH {
                error!(
                    "sound link chain too deep starting at '{}'",
                    self.sfx[org_id as usize].name
                );
                return None;
            }
            depth += 1;
            let sfx = &self.sfx[sound_id as usize];
            if sfx.flags.contains(SfxFlags::RANDOM_HEADER) {
                // Random sounds attenuate based on the header as well as the
                // chosen sound.
                attenuation *= sfx.attenuation;
                sound_id = self.pick_replacement(sound_id);
            } else {
                sound_id = sfx.link;
            }
            if near_limit < 0 {
                near_limit = self.sfx[sound_id as usize].near_limit;
                limit_range = self.sfx[sound_id as usize].limit_range;
            }
            if rolloff.is_unset() {
                rolloff = self.sfx[sound_id as usize].rolloff;
            }
        }

        attenuation *= self.sfx[sound_id as usize].attenuation;

        // A rolloff passed by the caller overrides the sound's own, unless
        // itself unset; an unset result falls back to the global default.
        if let Some(forced) = forced_rolloff {
            if !forced.is_unset() {
                rolloff = forced;
            }
        }
        if rolloff.is_unset() {
            rolloff = self.global_rolloff;
        }

        // A singular sound that is already audible gets parked, not played.
        if self.sfx[sound_id as usize].flags.contains(SfxFlags::SINGULAR)
            && self.check_singular(sound_id)
        {
            chanflags |= ChanFlags::EVICTED;
        }

        // Unpositioned sounds and the listener's own are never limited.
        if source.is_none() || self.is_listener(&source) {
            near_limit = 0;
        }

        if near_limit > 0 {
            let limit_actor = match source {
                SoundSource::Actor(_) => Some(source),
                _ => None,
            };
            if self.check_sound_limit(
                client,
                sound_id,
                &pos,
                near_limit,
                limit_range,
                limit_actor,
                channel,
            ) {
                chanflags |= ChanFlags::EVICTED;
            }
        }

        // A blocked non-loop is dropped here; a blocked loop is parked below
        // so it can eventually play for real.
        if chanflags.contains(ChanFlags::EVICTED) && !chanflags.contains(ChanFlags::LOOP) {
            return None;
        }

        let mut buffer = LoadBuffer::default();
        let canonical = self.load_sound(sound_id, backend, client, &mut buffer);

        // The empty sound never plays.
        if self.sfx[canonical as usize].lumpnum == self.empty_lump {
            return None;
        }

        let basepriority = if source.is_none() || self.is_listener(&source) {
            80
        } else {
            0
        };

        let mut seen = 0i32;
        if !source.is_none() && channel == CHAN_AUTO {
            // Probe slot 0 first, then walk down from 7.
            if self.is_channel_used(&source, 0, &mut seen) {
                channel = 7;
                while channel > 0 {
                    if !self.is_channel_used(&source, channel, &mut seen) {
                        break;
                    }
                    channel -= 1;
                }
                if channel == 0 {
                    return None;
                }
            }
        }

        // Whatever this emitter is playing on the selected slot stops now.
        if !source.is_none() && self.is_channel_used(&source, channel, &mut seen) {
            let existing = self.channels.active().into_iter().find(|&id| {
                let chan = self.channels.chan(id);
                chan.source == source && chan.ent_channel == channel
            });
            if let Some(id) = existing {
                self.stop_channel(backend, id);
            }
        }

        // A non-loop started while paused would only be heard after
        // unpausing, which would sound wrong.
        if self.paused
            && !chanflags.intersects(ChanFlags::LOOP | ChanFlags::UI | ChanFlags::NOPAUSE)
        {
            return None;
        }

        let pitch = if pitch_mask != 0 {
            let mut rng = rand::thread_rng();
            DEFAULT_PITCH - (rng.gen::<u8>() & pitch_mask) as i32
                + (rng.gen::<u8>() & pitch_mask) as i32
        } else {
            DEFAULT_PITCH
        };

        let mut chan_id = if chanflags.contains(ChanFlags::EVICTED) {
            None
        } else {
            let mut startflags = StartFlags::empty();
            if chanflags.contains(ChanFlags::LOOP) {
                startflags |= StartFlags::LOOP;
            }
            if chanflags.contains(ChanFlags::AREA) {
                startflags |= StartFlags::AREA;
            }
            if chanflags.intersects(ChanFlags::UI | ChanFlags::NOPAUSE) {
                startflags |= StartFlags::NOPAUSE;
            }
            if chanflags.contains(ChanFlags::UI) {
                startflags |= StartFlags::NOREVERB;
            }

            let voice = if attenuation > 0.0 {
                self.load_sound_3d(canonical, backend, client, &buffer);
                match self.sfx[canonical as usize].data3d {
                    Some(handle) => backend.start_sound_3d(
                        handle,
                        &self.listener,
                        volume,
                        &rolloff,
                        attenuation,
                        pitch,
                        basepriority,
                        pos,
                        vel,
                        channel,
                        startflags,
                        0,
                    ),
                    None => None,
                }
            } else {
                match self.sfx[canonical as usize].data {
                    Some(handle) => backend.start_sound(handle, volume, pitch, startflags, 0),
                    None => None,
                }
            };
            voice.map(|voice| self.channels.get_channel(Some(voice)))
        };

        // The backend refused (or policy parked the sound): a loop keeps a
        // bookkeeping channel so it can be restarted later.
        if chan_id.is_none() && chanflags.contains(ChanFlags::LOOP) {
            let id = self.channels.get_channel(None);
            self.channels.chan_mut(id).start_time = backend.mark_start_time();
            chanflags |= ChanFlags::EVICTED;
            chan_id = Some(id);
        }

        if attenuation > 0.0 {
            chanflags |= ChanFlags::IS3D | ChanFlags::JUSTSTARTED;
        } else {
            chanflags |= ChanFlags::LISTENERZ | ChanFlags::JUSTSTARTED;
        }

        if let Some(id) = chan_id {
            let chan = self.channels.chan_mut(id);
            chan.sound_id = sound_id;
            chan.org_id = org_id;
            chan.ent_channel = channel;
            chan.volume = volume;
            chan.flags |= chanflags;
            chan.near_limit = near_limit;
            chan.limit_range = limit_range;
            chan.pitch = pitch;
            chan.priority = basepriority;
            chan.distance_scale = attenuation;
            chan.rolloff = rolloff;
            chan.source = source;
            if spitch > 0.0 {
                self.set_pitch(backend, id, spitch);
            }
        }

        chan_id
    }

    // ============================================================
    // Policy checks
    // ============================================================

    /// True when an audible copy of this sound is already playing.
    pub(crate) fn check_singular(&self, sound_id: u32) -> bool {
        self.channels.active().into_iter().any(|id| {
            let chan = self.channels.chan(id);
            !chan.is_evicted() && chan.sound_id == sound_id
        })
    }

    /// True when `near_limit` copies of the sound already play within
    /// `limit_range` (squared) of `pos`. An actor restarting its own sound
    /// on the same slot is never limited.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn check_sound_limit(
        &self,
        client: &mut dyn SoundClient,
        sound_id: u32,
        pos: &Vec3,
        near_limit: i16,
        limit_range: f32,
        actor: Option<SoundSource>,
        channel: i32,
    ) -> bool {
        let mut count = 0;
        for id in self.channels.active() {
            if count >= near_limit as i32 {
                break;
            }
            let chan = self.channels.chan(id);
            if chan.is_evicted() || chan.sound_id != sound_id {
                continue;
            }
            if let Some(src) = actor {
                if chan.ent_channel == channel && chan.source == src {
                    return false;
                }
            }
            let (chan_pos, _) = client.calc_pos_vel(&chan.source, chan.ent_channel, chan.flags);
            if distance_squared(&chan_pos, pos) <= limit_range {
                count += 1;
            }
        }
        count >= near_limit as i32
    }

    /// True when the slot is taken on this emitter. Fills `seen` with a
    /// bitmask of the emitter's occupied slots so repeated probes are O(1).
    pub(crate) fn is_channel_used(
        &self,
        source: &SoundSource,
        channel: i32,
        seen: &mut i32,
    ) -> bool {
        if *seen & (1 << channel) != 0 {
            return true;
        }
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if chan.source == *source {
                *seen |= 1 << chan.ent_channel;
                if chan.ent_channel == channel {
                    return true;
                }
            }
        }
        false
    }

    // ============================================================
    // Stopping and channel queries
    // ============================================================

    /// Stops one channel. With a live voice the channel is marked
    /// forgettable and the ended path retires it; parked channels retire
    /// directly.
    pub fn stop_channel(&mut self, backend: &mut dyn SoundBackend, id: ChanId) {
        let voice = self.channels.chan(id).sys_channel;
        match voice {
            Some(voice) => {
                {
                    let chan = self.channels.chan_mut(id);
                    // Eviction keeps the channel data; a plain stop forgets it.
                    if !chan.flags.contains(ChanFlags::EVICTED) {
                        chan.flags |= ChanFlags::FORGETTABLE;
                        if matches!(chan.source, SoundSource::Actor(_)) {
                            chan.source = SoundSource::None;
                        }
                    }
                }
                backend.stop_voice(voice);
                self.channel_ended(backend, voice);
            }
            None => self.channels.return_channel(id),
        }
    }

    /// Stops origin-less sounds playing on `channel` (-1 for any slot).
    pub fn stop_sound(&mut self, backend: &mut dyn SoundBackend, channel: i32) {
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if chan.source.is_none() && (chan.ent_channel == channel || channel < 0) {
                self.stop_channel(backend, id);
            }
        }
    }

    /// Stops one emitter's sounds on `channel` (-1 for any slot).
    pub fn stop_sound_from(
        &mut self,
        backend: &mut dyn SoundBackend,
        source: SoundSource,
        channel: i32,
    ) {
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if chan.source == source && (chan.ent_channel == channel || channel < 0) {
                self.stop_channel(backend, id);
            }
        }
    }

    pub fn stop_all_channels(&mut self, backend: &mut dyn SoundBackend) {
        for id in self.channels.active() {
            self.stop_channel(backend, id);
        }
        backend.update_sounds();
    }

    /// Moves sounds from one emitter to another. With no destination,
    /// non-looping sounds become unattached at `optpos` and looping sounds
    /// stop.
    pub fn relink_sound(
        &mut self,
        backend: &mut dyn SoundBackend,
        from: SoundSource,
        to: Option<SoundSource>,
        optpos: Option<Vec3>,
    ) {
        if from.is_none() {
            return;
        }
        for id in self.channels.active() {
            if self.channels.chan(id).source != from {
                continue;
            }
            match to {
                Some(dest) => self.channels.chan_mut(id).source = dest,
                None => {
                    let looping = self.channels.chan(id).flags.contains(ChanFlags::LOOP);
                    match optpos {
                        Some(point) if !looping => {
                            self.channels.chan_mut(id).source = SoundSource::Unattached(point);
                        }
                        _ => self.stop_channel(backend, id),
                    }
                }
            }
        }
    }

    pub fn change_sound_volume(
        &mut self,
        backend: &mut dyn SoundBackend,
        source: SoundSource,
        channel: i32,
        volume: f32,
    ) {
        let volume = volume.clamp(0.0, 1.0);
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if chan.source == source && (chan.ent_channel == channel || channel == -1) {
                if let Some(voice) = chan.sys_channel {
                    backend.channel_volume(voice, volume);
                }
                self.channels.chan_mut(id).volume = volume;
                return;
            }
        }
    }

    pub fn change_sound_pitch(
        &mut self,
        backend: &mut dyn SoundBackend,
        source: SoundSource,
        channel: i32,
        pitch: f32,
    ) {
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if chan.source == source && chan.ent_channel == channel {
                self.set_pitch(backend, id, pitch);
                return;
            }
        }
    }

    /// Applies a float pitch to a channel; the stored integer pitch stays in
    /// backend units around 128.
    pub fn set_pitch(&mut self, backend: &mut dyn SoundBackend, id: ChanId, pitch: f32) {
        if let Some(voice) = self.channels.chan(id).sys_channel {
            backend.channel_pitch(voice, pitch.max(0.0001));
        }
        self.channels.chan_mut(id).pitch = ((DEFAULT_PITCH as f32 * pitch) as i32).max(1);
    }

    /// Is this emitter playing `sound_id` (as originally requested)?
    pub fn get_sound_playing_info(&self, source: SoundSource, sound_id: u32) -> bool {
        sound_id != 0
            && self.channels.active().into_iter().any(|id| {
                let chan = self.channels.chan(id);
                chan.org_id == sound_id && chan.source == source
            })
    }

    /// Is this emitter playing anything on `channel` (0 = any)? A nonzero
    /// `sound_id` restricts the match to that sound.
    pub fn is_source_playing_something(
        &self,
        source: SoundSource,
        channel: i32,
        sound_id: u32,
    ) -> bool {
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if chan.source == source && (channel == 0 || chan.ent_channel == channel) {
                return sound_id == 0 || chan.org_id == sound_id;
            }
        }
        false
    }

    /// The channels worth persisting: everything active that is neither
    /// forgettable nor UI.
    pub fn all_active_channels(&self) -> Vec<ChanId> {
        self.channels
            .active()
            .into_iter()
            .filter(|&id| {
                !self
                    .channels
                    .chan(id)
                    .flags
                    .intersects(ChanFlags::FORGETTABLE | ChanFlags::UI)
            })
            .collect()
    }

    /// Diagnostic listing of audible channels.
    pub fn list_sound_channels(&self, client: &mut dyn SoundClient) -> String {
        let mut output = String::new();
        let mut count = 0;
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if !chan.is_evicted() {
                let (pos, _) = client.calc_pos_vel(&chan.source, chan.ent_channel, chan.flags);
                output.push_str(&format!(
                    "{} at ({:.5}, {:.5}, {:.5})\n",
                    self.get_sound_name(chan.sound_id),
                    pos[0],
                    pos[1],
                    pos[2]
                ));
                count += 1;
            }
        }
        output.push_str(&format!("{} sounds playing\n", count));
        output
    }

    // ============================================================
    // Eviction and restart
    // ============================================================

    /// Releases every backend voice while keeping all channel state, so the
    /// whole soundscape can be restarted later.
    pub fn evict_all_channels(&mut self, backend: &mut dyn SoundBackend) {
        for id in self.channels.active() {
            if self.channels.chan(id).is_evicted() {
                continue;
            }
            self.channels.chan_mut(id).flags |= ChanFlags::EVICTED;
            if let Some(voice) = self.channels.chan(id).sys_channel {
                if !self.channels.chan(id).flags.contains(ChanFlags::ABSTIME) {
                    let position = backend.get_position(voice);
                    let chan = self.channels.chan_mut(id);
                    chan.start_time = position;
                    chan.flags |= ChanFlags::ABSTIME;
                }
                backend.stop_voice(voice);
                self.channel_ended(backend, voice);
            }
        }
    }

    /// Restarts as many evicted channels as possible, oldest first so the
    /// original play order is preserved. Non-loops that still cannot start
    /// are retired; ones that did start become forgettable so the next
    /// eviction retires instead of parking them.
    pub fn restore_evicted_channels(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
    ) {
        for id in self.channels.active_oldest_first() {
            let flags = self.channels.chan(id).flags;
            if flags.contains(ChanFlags::EVICTED) {
                self.restart_channel(backend, client, id);
                let flags = self.channels.chan(id).flags;
                if !flags.contains(ChanFlags::LOOP) {
                    if flags.contains(ChanFlags::EVICTED) {
                        // Still evicted and not looping? Forget about it.
                        self.channels.return_channel(id);
                    } else if !flags.contains(ChanFlags::JUSTSTARTED) {
                        self.channels.chan_mut(id).flags |= ChanFlags::FORGETTABLE;
                    }
                }
            } else if self.channels.chan(id).sys_channel.is_none()
                && flags.contains(ChanFlags::FORGETTABLE)
                && !flags.contains(ChanFlags::LOOP)
            {
                self.channels.return_channel(id);
            }
        }
    }

    /// One restart attempt for an evicted channel. Re-runs the singular and
    /// near-limit policy, reloads the resource, and asks the backend to
    /// start with the stored parameters. On failure the channel stays
    /// parked.
    fn restart_channel(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        id: ChanId,
    ) {
        debug_assert!(self.channels.chan(id).flags.contains(ChanFlags::EVICTED));

        let sound_id = self.channels.chan(id).sound_id;
        if self.sfx[sound_id as usize].flags.contains(SfxFlags::SINGULAR)
            && self.check_singular(sound_id)
        {
            return;
        }

        let mut buffer = LoadBuffer::default();
        let canonical = self.load_sound(sound_id, backend, client, &mut buffer);
        if self.sfx[canonical as usize].lumpnum == self.empty_lump {
            return;
        }

        let chan = self.channels.chan(id).clone();
        let old_flags = chan.flags;

        let mut startflags = StartFlags::empty();
        if chan.flags.contains(ChanFlags::LOOP) {
            startflags |= StartFlags::LOOP;
        }
        if chan.flags.contains(ChanFlags::AREA) {
            startflags |= StartFlags::AREA;
        }
        if chan.flags.intersects(ChanFlags::UI | ChanFlags::NOPAUSE) {
            startflags |= StartFlags::NOPAUSE;
        }
        if chan.flags.contains(ChanFlags::ABSTIME) {
            startflags |= StartFlags::ABSTIME;
        }

        let voice = if chan.flags.contains(ChanFlags::IS3D) {
            let (pos, vel) = client.calc_pos_vel(&chan.source, chan.ent_channel, chan.flags);
            if !client.validate_pos_vel(&chan.source, &pos, &vel) {
                return;
            }
            if chan.near_limit > 0
                && self.check_sound_limit(
                    client,
                    chan.sound_id,
                    &pos,
                    chan.near_limit,
                    chan.limit_range,
                    None,
                    0,
                )
            {
                return;
            }
            self.load_sound_3d(canonical, backend, client, &buffer);
            self.channels
                .chan_mut(id)
                .flags
                .remove(ChanFlags::EVICTED | ChanFlags::ABSTIME);
            match self.sfx[canonical as usize].data3d {
                Some(handle) => backend.start_sound_3d(
                    handle,
                    &self.listener,
                    chan.volume,
                    &chan.rolloff,
                    chan.distance_scale,
                    chan.pitch,
                    chan.priority,
                    pos,
                    vel,
                    chan.ent_channel,
                    startflags,
                    chan.start_time,
                ),
                None => None,
            }
        } else {
            self.channels
                .chan_mut(id)
                .flags
                .remove(ChanFlags::EVICTED | ChanFlags::ABSTIME);
            match self.sfx[canonical as usize].data {
                Some(handle) => {
                    backend.start_sound(handle, chan.volume, chan.pitch, startflags, chan.start_time)
                }
                None => None,
            }
        };

        match voice {
            Some(voice) => self.channels.chan_mut(id).sys_channel = Some(voice),
            None => self.channels.chan_mut(id).flags = old_flags,
        }
    }

    // ============================================================
    // Periodic update
    // ============================================================

    /// Per-tick refresh: 3D parameters for audible channels, listener push,
    /// backend housekeeping, and — once `time` passes the restart fence —
    /// another go at evicted channels.
    pub fn update_sounds(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        time: i32,
    ) {
        for id in self.channels.active() {
            let chan = self.channels.chan(id);
            if chan.flags & (ChanFlags::EVICTED | ChanFlags::IS3D) == ChanFlags::IS3D {
                let (pos, vel) = client.calc_pos_vel(&chan.source, chan.ent_channel, chan.flags);
                if client.validate_pos_vel(&chan.source, &pos, &vel) {
                    if let Some(voice) = chan.sys_channel {
                        let area = chan.flags.contains(ChanFlags::AREA);
                        backend.update_sound_params_3d(&self.listener, voice, area, pos, vel);
                    }
                }
            }
            self.channels
                .chan_mut(id)
                .flags
                .remove(ChanFlags::JUSTSTARTED);
        }

        backend.update_listener(&self.listener);
        backend.update_sounds();

        if time >= self.restart_evictions_at {
            self.restart_evictions_at = 0;
            self.restore_evicted_channels(backend, client);
        }
    }

    /// Device reset: release every voice, then try to bring the soundscape
    /// back on whatever the backend can start now.
    pub fn reset(&mut self, backend: &mut dyn SoundBackend, client: &mut dyn SoundClient) {
        self.evict_all_channels(backend);
        self.restore_evicted_channels(backend, client);
    }

    // ============================================================
    // Backend callbacks
    // ============================================================

    /// A voice stopped on the backend. Forgettable channels retire; loops
    /// and already-evicted channels park; anything else parks only when the
    /// playback position shows it had not finished.
    pub fn channel_ended(&mut self, backend: &mut dyn SoundBackend, voice: VoiceHandle) {
        let Some(id) = self.channels.find_by_voice(voice) else {
            return;
        };
        let flags = self.channels.chan(id).flags;
        let evicted = if flags.contains(ChanFlags::FORGETTABLE) {
            false
        } else if flags.intersects(ChanFlags::LOOP | ChanFlags::EVICTED) {
            true
        } else {
            let position = backend.get_position(voice);
            let length = self
                .sound_data(self.channels.chan(id).sound_id)
                .map_or(0, |handle| backend.get_sample_length(handle));
            if position == 0 {
                flags.contains(ChanFlags::JUSTSTARTED)
            } else {
                position < length
            }
        };
        if evicted {
            let chan = self.channels.chan_mut(id);
            chan.flags |= ChanFlags::EVICTED;
            chan.sys_channel = None;
        } else {
            self.channels.return_channel(id);
        }
    }

    /// The backend demoted or promoted a voice between real and virtual.
    pub fn channel_virtual_changed(&mut self, voice: VoiceHandle, is_virtual: bool) {
        if let Some(id) = self.channels.find_by_voice(voice) {
            let chan = self.channels.chan_mut(id);
            if is_virtual {
                chan.flags |= ChanFlags::VIRTUAL;
            } else {
                chan.flags.remove(ChanFlags::VIRTUAL);
            }
        }
    }

    // ============================================================
    // Rolloff
    // ============================================================

    /// Volume factor for a distance: 1 below the minimum, 0 at or past the
    /// maximum (logarithmic rolloff never cuts off), curve-shaped between.
    pub fn get_rolloff(&self, rolloff: &Rolloff, distance: f32) -> f32 {
        if distance <= rolloff.min_distance {
            return 1.0;
        }
        if rolloff.kind == RolloffKind::Log {
            return rolloff.min_distance
                / (rolloff.min_distance + rolloff.factor * (distance - rolloff.min_distance));
        }
        if distance >= rolloff.max_distance {
            return 0.0;
        }
        let volume =
            (rolloff.max_distance - distance) / (rolloff.max_distance - rolloff.min_distance);
        match rolloff.kind {
            RolloffKind::Linear => volume,
            RolloffKind::Custom if !self.sound_curve.is_empty() => {
                let index = (self.sound_curve.len() as f32 * (1.0 - volume)) as usize;
                self.sound_curve[index.min(self.sound_curve.len() - 1)] as f32 / 127.0
            }
            _ => (10f32.powf(volume) - 1.0) / 9.0,
        }
    }
}

// ============================================================
// Tests
// ============================================================
