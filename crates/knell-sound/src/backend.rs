// backend.rs — interfaces to the system audio driver and the game client
//
// The engine never talks to hardware or to world state directly; both sides
// are trait objects handed into each operation. The backend runs the voices
// and decoders, the client supplies emitter positions and lump bytes.

use knell_common::math::Vec3;

use crate::types::{
    ChanFlags, Listener, LumpNum, Rolloff, SoundHandle, SoundSource, StartFlags, VoiceHandle,
};

/// Result of a backend decode. `spatial` is set when the handle is already
/// usable for 3D playback, in which case the engine aliases it instead of
/// decoding a second copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodedSound {
    pub handle: Option<SoundHandle>,
    pub spatial: bool,
}

/// The system audio driver. Voice starts may be refused (out of voices,
/// device lost); the engine parks looping sounds and drops one-shots.
pub trait SoundBackend {
    /// A null driver loads nothing and plays nothing.
    fn is_null(&self) -> bool {
        false
    }

    fn start_sound(
        &mut self,
        handle: SoundHandle,
        volume: f32,
        pitch: i32,
        flags: StartFlags,
        start_time: u64,
    ) -> Option<VoiceHandle>;

    #[allow(clippy::too_many_arguments)]
    fn start_sound_3d(
        &mut self,
        handle: SoundHandle,
        listener: &Listener,
        volume: f32,
        rolloff: &Rolloff,
        distance_scale: f32,
        pitch: i32,
        priority: i32,
        pos: Vec3,
        vel: Vec3,
        ent_channel: i32,
        flags: StartFlags,
        start_time: u64,
    ) -> Option<VoiceHandle>;

    fn stop_voice(&mut self, voice: VoiceHandle);
    fn channel_volume(&mut self, voice: VoiceHandle, volume: f32);
    fn channel_pitch(&mut self, voice: VoiceHandle, pitch: f32);
    fn update_sound_params_3d(
        &mut self,
        listener: &Listener,
        voice: VoiceHandle,
        area: bool,
        pos: Vec3,
        vel: Vec3,
    );
    fn update_listener(&mut self, listener: &Listener);
    /// Per-frame backend housekeeping.
    fn update_sounds(&mut self) {}

    /// Playback position of a voice, in samples.
    fn get_position(&self, voice: VoiceHandle) -> u64;
    /// Length of a decoded sound, in samples.
    fn get_sample_length(&self, handle: SoundHandle) -> u64;
    /// Length of a decoded sound, in milliseconds.
    fn get_ms_length(&self, handle: SoundHandle) -> u64;
    /// Current output clock, recorded on channels parked before they ever
    /// reached the backend.
    fn mark_start_time(&mut self) -> u64;

    // ---- Decoders. Pure byte-to-handle conversions. ----

    /// Generic decode; the backend sniffs the container format.
    fn load_sound(&mut self, data: &[u8], monoize: bool) -> DecodedSound;
    /// Decode from bytes the engine already read for the 2D pass.
    fn load_sound_buffered(&mut self, data: &[u8], monoize: bool) -> DecodedSound {
        self.load_sound(data, monoize)
    }
    fn load_sound_voc(&mut self, data: &[u8], monoize: bool) -> DecodedSound;
    fn load_sound_raw(
        &mut self,
        data: &[u8],
        rate: i32,
        channels: i32,
        bits: i32,
        loop_start: i32,
        monoize: bool,
    ) -> DecodedSound;
    fn unload_sound(&mut self, handle: SoundHandle);
}

/// World-state callbacks the engine needs from its host.
pub trait SoundClient {
    /// Position and velocity for a source. Called every time a 3D channel
    /// starts or refreshes.
    fn calc_pos_vel(&mut self, source: &SoundSource, ent_channel: i32, flags: ChanFlags)
        -> (Vec3, Vec3);

    /// Lets the host veto bad positions. The default lets everything pass.
    fn validate_pos_vel(&mut self, _source: &SoundSource, _pos: &Vec3, _vel: &Vec3) -> bool {
        true
    }

    /// Raw bytes for a lump.
    fn read_sound(&mut self, lump: LumpNum) -> Vec<u8>;
}

/// Backend that refuses everything; used when audio is disabled.
pub struct NullBackend;

impl SoundBackend for NullBackend {
    fn is_null(&self) -> bool {
        true
    }
    fn start_sound(
        &mut self,
        _handle: SoundHandle,
        _volume: f32,
        _pitch: i32,
        _flags: StartFlags,
        _start_time: u64,
    ) -> Option<VoiceHandle> {
        None
    }
    fn start_sound_3d(
        &mut self,
        _handle: SoundHandle,
        _listener: &Listener,
        _volume: f32,
        _rolloff: &Rolloff,
        _distance_scale: f32,
        _pitch: i32,
        _priority: i32,
        _pos: Vec3,
        _vel: Vec3,
        _ent_channel: i32,
        _flags: StartFlags,
        _start_time: u64,
    ) -> Option<VoiceHandle> {
        None
    }
    fn stop_voice(&mut self, _voice: VoiceHandle) {}
    fn channel_volume(&mut self, _voice: VoiceHandle, _volume: f32) {}
    fn channel_pitch(&mut self, _voice: VoiceHandle, _pitch: f32) {}
    fn update_sound_params_3d(
        &mut self,
        _listener: &Listener,
        _voice: VoiceHandle,
        _area: bool,
        _pos: Vec3,
        _vel: Vec3,
    ) {
    }
    fn update_listener(&mut self, _listener: &Listener) {}
    fn get_position(&self, _voice: VoiceHandle) -> u64 {
        0
    }
    fn get_sample_length(&self, _handle: SoundHandle) -> u64 {
        0
    }
    fn get_ms_length(&self, _handle: SoundHandle) -> u64 {
        0
    }
    fn mark_start_time(&mut self) -> u64 {
        0
    }
    fn load_sound(&mut self, _data: &[u8], _monoize: bool) -> DecodedSound {
        DecodedSound::default()
    }
    fn load_sound_voc(&mut self, _data: &[u8], _monoize: bool) -> DecodedSound {
        DecodedSound::default()
    }
    fn load_sound_raw(
        &mut self,
        _data: &[u8],
        _rate: i32,
        _channels: i32,
        _bits: i32,
        _loop_start: i32,
        _monoize: bool,
    ) -> DecodedSound {
        DecodedSound::default()
    }
    fn unload_sound(&mut self, _handle: SoundHandle) {}
}
