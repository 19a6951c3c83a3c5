// snapshot.rs — savegame image of the live channel list
//
// Sounds are written oldest first so that loading recreates them in the
// order they were originally started. Loaded channels come back parked
// (evicted, no backend voice); the restart fence is armed so the next
// update pass brings the loops back without the game noticing.

use knell_common::serializer::Serializer;

use crate::backend::SoundBackend;
use crate::channel::ChanId;
use crate::engine::SoundEngine;
use crate::types::{ChanFlags, RolloffKind, SoundSource, DEFAULT_PITCH};

fn rolloff_code(kind: RolloffKind) -> i32 {
    match kind {
        RolloffKind::Doom => 0,
        RolloffKind::Linear => 1,
        RolloffKind::Log => 2,
        RolloffKind::Custom => 3,
    }
}

fn rolloff_from_code(code: i32) -> RolloffKind {
    match code {
        1 => RolloffKind::Linear,
        2 => RolloffKind::Log,
        3 => RolloffKind::Custom,
        _ => RolloffKind::Doom,
    }
}

fn source_code(source: &SoundSource) -> i32 {
    match source {
        SoundSource::None => 0,
        SoundSource::Actor(_) => 1,
        SoundSource::Sector(_) => 2,
        SoundSource::Polyobj(_) => 3,
        SoundSource::Unattached(_) => 4,
    }
}

impl SoundEngine {
    /// Writes or restores the channel list. On write, forgettable and UI
    /// channels are left out. On read, current playback stops, every saved
    /// channel comes back parked, and `restart_at` arms the restart fence.
    pub fn serialize_channels(
        &mut self,
        arc: &mut Serializer,
        backend: &mut dyn SoundBackend,
        restart_at: i32,
    ) {
        if arc.is_writing() {
            let ids = self.all_active_channels();
            if !ids.is_empty() {
                arc.begin_array(Some("sounds"));
                for &id in ids.iter().rev() {
                    self.serialize_channel(arc, id);
                }
                arc.end_array();
            }
        } else {
            self.stop_all_channels(backend);
            if arc.begin_array(Some("sounds")) {
                let count = arc.array_size();
                for _ in 0..count {
                    let id = self.channels.get_channel(None);
                    self.channels.chan_mut(id).flags = ChanFlags::EVICTED;
                    self.serialize_channel(arc, id);
                }
                arc.end_array();
            }
            self.restart_evictions_at = restart_at;
        }
    }

    fn serialize_channel(&mut self, arc: &mut Serializer, id: ChanId) {
        arc.begin_object(None);

        // Sound ids persist by name so a changed registry still resolves.
        let mut sound_name = self.get_sound_name(self.channels.chan(id).sound_id).to_string();
        let mut org_name = self.get_sound_name(self.channels.chan(id).org_id).to_string();
        arc.value(Some("soundid"), &mut sound_name, None);
        arc.value(Some("orgid"), &mut org_name, None);

        let mut chan = self.channels.chan(id).clone();
        arc.value(Some("volume"), &mut chan.volume, None)
            .value(Some("distancescale"), &mut chan.distance_scale, None)
            .value(Some("pitch"), &mut chan.pitch, Some(&DEFAULT_PITCH))
            .value(Some("priority"), &mut chan.priority, Some(&0))
            .value(Some("nearlimit"), &mut chan.near_limit, Some(&0i16))
            .value(Some("limitrange"), &mut chan.limit_range, Some(&0.0f32))
            .value(Some("entchannel"), &mut chan.ent_channel, Some(&0))
            .value(Some("starttime"), &mut chan.start_time, Some(&0u64));

        let mut flag_bits = chan.flags.bits();
        arc.value(Some("flags"), &mut flag_bits, None);

        let mut kind = rolloff_code(chan.rolloff.kind);
        arc.value(Some("rollofftype"), &mut kind, Some(&0))
            .value(Some("rolloffmin"), &mut chan.rolloff.min_distance, Some(&0.0f32))
            .value(Some("rolloffmax"), &mut chan.rolloff.max_distance, Some(&0.0f32))
            .value(Some("rollofffactor"), &mut chan.rolloff.factor, Some(&0.0f32));

        let mut source_type = source_code(&chan.source);
        arc.value(Some("sourcetype"), &mut source_type, Some(&0));

        if arc.is_writing() {
            match chan.source {
                SoundSource::Actor(mut emitter)
                | SoundSource::Sector(mut emitter)
                | SoundSource::Polyobj(mut emitter) => {
                    arc.value(Some("source"), &mut emitter, None);
                }
                SoundSource::Unattached(mut point) => {
                    arc.begin_array(Some("point"));
                    for coord in point.iter_mut() {
                        arc.value(None, coord, None);
                    }
                    arc.end_array();
                }
                SoundSource::None => {}
            }
        } else {
            chan.source = match source_type {
                1 | 2 | 3 => {
                    let mut emitter = 0u32;
                    arc.value(Some("source"), &mut emitter, None);
                    match source_type {
                        1 => SoundSource::Actor(emitter),
                        2 => SoundSource::Sector(emitter),
                        _ => SoundSource::Polyobj(emitter),
                    }
                }
                4 => {
                    let mut point = [0.0f32; 3];
                    if arc.begin_array(Some("point")) {
                        for coord in point.iter_mut() {
                            arc.value(None, coord, None);
                        }
                        arc.end_array();
                    }
                    SoundSource::Unattached(point)
                }
                _ => SoundSource::None,
            };

            chan.rolloff.kind = rolloff_from_code(kind);
            // Restored channels are parked until the restart fence passes.
            chan.flags = ChanFlags::from_bits_truncate(flag_bits) | ChanFlags::EVICTED;
            chan.sys_channel = None;
            chan.sound_id = self.find_sound(&sound_name);
            chan.org_id = self.find_sound(&org_name);
            *self.channels.chan_mut(id) = chan;
        }

        arc.end_object();
    }
}
