// mock.rs — scripted backend and client doubles for tests

use std::collections::HashMap;

use knell_common::math::{vector_is_finite, Vec3};

use crate::backend::{DecodedSound, SoundBackend, SoundClient};
use crate::types::{
    EmitterId, Listener, LumpNum, Rolloff, SoundHandle, SoundSource, StartFlags, VoiceHandle,
};

/// One decode request seen by the mock.
pub struct LoadRecord {
    pub kind: &'static str,
    pub rate: i32,
    pub len: usize,
}

/// One voice start seen by the mock.
pub struct StartRecord {
    pub voice: u32,
    pub handle: SoundHandle,
    pub volume: f32,
    pub pitch: i32,
    pub flags: StartFlags,
    pub three_d: bool,
    pub pos: Vec3,
    pub start_time: u64,
}

#[derive(Default)]
pub struct MockBackend {
    next_handle: u32,
    next_voice: u32,
    pub loads: Vec<LoadRecord>,
    pub handle_bytes: HashMap<u32, usize>,
    pub refuse_decodes: bool,
    pub refuse_starts: bool,
    pub starts: Vec<StartRecord>,
    pub stops: Vec<u32>,
    pub unloads: Vec<u32>,
    pub pitches: Vec<(u32, f32)>,
    /// Playback positions reported per voice.
    pub positions: HashMap<u32, u64>,
    pub ms_per_byte: u64,
    pub clock: u64,
    pub updates_3d: usize,
    pub listener_updates: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(&mut self, kind: &'static str, rate: i32, len: usize) -> DecodedSound {
        self.loads.push(LoadRecord { kind, rate, len });
        if self.refuse_decodes {
            return DecodedSound::default();
        }
        self.next_handle += 1;
        self.handle_bytes.insert(self.next_handle, len);
        DecodedSound {
            handle: Some(SoundHandle(self.next_handle)),
            spatial: kind == "generic",
        }
    }

    fn start(&mut self, record: StartRecord) -> Option<VoiceHandle> {
        if self.refuse_starts {
            return None;
        }
        self.next_voice += 1;
        let voice = VoiceHandle(self.next_voice);
        self.starts.push(StartRecord {
            voice: voice.0,
            ..record
        });
        Some(voice)
    }
}

impl SoundBackend for MockBackend {
    fn start_sound(
        &mut self,
        handle: SoundHandle,
        volume: f32,
        pitch: i32,
        flags: StartFlags,
        start_time: u64,
    ) -> Option<VoiceHandle> {
        self.start(StartRecord {
            voice: 0,
            handle,
            volume,
            pitch,
            flags,
            three_d: false,
            pos: [0.0; 3],
            start_time,
        })
    }

    fn start_sound_3d(
        &mut self,
        handle: SoundHandle,
        _listener: &Listener,
        volume: f32,
        _rolloff: &Rolloff,
        _distance_scale: f32,
        pitch: i32,
        _priority: i32,
        pos: Vec3,
        _vel: Vec3,
        _ent_channel: i32,
        flags: StartFlags,
        start_time: u64,
    ) -> Option<VoiceHandle> {
        self.start(StartRecord {
            voice: 0,
            handle,
            volume,
            pitch,
            flags,
            three_d: true,
            pos,
            start_time,
        })
    }

    fn stop_voice(&mut self, voice: VoiceHandle) {
        self.stops.push(voice.0);
    }

    fn channel_volume(&mut self, _voice: VoiceHandle, _volume: f32) {}

    fn channel_pitch(&mut self, voice: VoiceHandle, pitch: f32) {
        self.pitches.push((voice.0, pitch));
    }

    fn update_sound_params_3d(
        &mut self,
        _listener: &Listener,
        _voice: VoiceHandle,
        _area: bool,
        _pos: Vec3,
        _vel: Vec3,
    ) {
        self.updates_3d += 1;
    }

    fn update_listener(&mut self, _listener: &Listener) {
        self.listener_updates += 1;
    }

    fn get_position(&self, voice: VoiceHandle) -> u64 {
        self.positions.get(&voice.0).copied().unwrap_or(0)
    }

    fn get_sample_length(&self, handle: SoundHandle) -> u64 {
        self.handle_bytes.get(&handle.0).copied().unwrap_or(0) as u64
    }

    fn get_ms_length(&self, handle: SoundHandle) -> u64 {
        self.get_sample_length(handle) * self.ms_per_byte
    }

    fn mark_start_time(&mut self) -> u64 {
        self.clock
    }

    fn load_sound(&mut self, data: &[u8], _monoize: bool) -> DecodedSound {
        self.decode("generic", 0, data.len())
    }

    fn load_sound_voc(&mut self, data: &[u8], _monoize: bool) -> DecodedSound {
        self.decode("voc", 0, data.len())
    }

    fn load_sound_raw(
        &mut self,
        data: &[u8],
        rate: i32,
        _channels: i32,
        _bits: i32,
        _loop_start: i32,
        _monoize: bool,
    ) -> DecodedSound {
        self.decode("raw", rate, data.len())
    }

    fn unload_sound(&mut self, handle: SoundHandle) {
        self.unloads.push(handle.0);
    }
}

#[derive(Default)]
pub struct MockClient {
    pub lumps: HashMap<LumpNum, Vec<u8>>,
    pub positions: HashMap<EmitterId, Vec3>,
    pub veto: bool,
    pub reads: usize,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SoundClient for MockClient {
    fn calc_pos_vel(
        &mut self,
        source: &SoundSource,
        _ent_channel: i32,
        _flags: crate::types::ChanFlags,
    ) -> (Vec3, Vec3) {
        let pos = match source {
            SoundSource::Unattached(point) => *point,
            SoundSource::Actor(id) | SoundSource::Sector(id) | SoundSource::Polyobj(id) => {
                self.positions.get(id).copied().unwrap_or([0.0; 3])
            }
            SoundSource::None => [0.0; 3],
        };
        (pos, [0.0; 3])
    }

    fn validate_pos_vel(&mut self, _source: &SoundSource, pos: &Vec3, vel: &Vec3) -> bool {
        !self.veto && vector_is_finite(pos) && vector_is_finite(vel)
    }

    fn read_sound(&mut self, lump: LumpNum) -> Vec<u8> {
        self.reads += 1;
        self.lumps.get(&lump).cloned().unwrap_or_default()
    }
}

/// DMX blob: (3, 0) magic, LE rate, LE sample count, then samples.
pub fn dmx_blob(rate: u16, samples: u32) -> Vec<u8> {
    let mut buf = vec![3u8, 0];
    buf.extend_from_slice(&rate.to_le_bytes());
    buf.extend_from_slice(&samples.to_le_bytes());
    buf.extend(std::iter::repeat(0x80u8).take(samples as usize));
    buf
}

/// Minimal Creative Voice File blob.
pub fn voc_blob(samples: usize) -> Vec<u8> {
    let mut buf = b"Creative Voice File\x1a".to_vec();
    buf.extend(std::iter::repeat(0x80u8).take(samples));
    buf
}
