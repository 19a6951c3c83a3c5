// types.rs — public constants, flags, and small shared types

use bitflags::bitflags;
use knell_common::math::Vec3;

/// Neutral pitch. Randomized pitches vary around this value.
pub const DEFAULT_PITCH: i32 = 128;

// Sound attenuation values.
pub const ATTN_NONE: f32 = 0.0; // full volume everywhere
pub const ATTN_NORM: f32 = 1.0;
pub const ATTN_IDLE: f32 = 1.001;
pub const ATTN_STATIC: f32 = 3.0; // diminishes very rapidly with distance

// Per-emitter channel slots. Slot 0 (AUTO) searches for a free slot;
// slots 1..7 always override whatever that slot is playing.
pub const CHAN_AUTO: i32 = 0;
pub const CHAN_WEAPON: i32 = 1;
pub const CHAN_VOICE: i32 = 2;
pub const CHAN_ITEM: i32 = 3;
pub const CHAN_BODY: i32 = 4;

// Modifier flags, or'ed into the channel argument above the slot bits.
pub const CHAN_LISTENERZ: i32 = 8;
pub const CHAN_MAYBE_LOCAL: i32 = 16;
pub const CHAN_UI: i32 = 32; // not recorded in savegames
pub const CHAN_NOPAUSE: i32 = 64; // keeps playing while the game is paused
pub const CHAN_AREA: i32 = 128; // plays from all around the listener
pub const CHAN_LOOP: i32 = 256;

bitflags! {
    /// Internal channel state. The low bits are free for engine use because
    /// the public slot bits are stripped off before these are stored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChanFlags: u32 {
        const IS3D        = 1;    // started with 3D positioning
        const EVICTED     = 2;    // backend voice released, state retained
        const FORGETTABLE = 4;    // retire instead of parking when the voice stops
        const LISTENERZ   = 8;
        const MAYBE_LOCAL = 16;
        const UI          = 32;
        const NOPAUSE     = 64;
        const AREA        = 128;
        const LOOP        = 256;
        const JUSTSTARTED = 512;  // not yet seen by an update pass
        const ABSTIME     = 1024; // start_time is an absolute backend position
        const VIRTUAL     = 2048; // backend demoted the voice to virtual
    }
}

bitflags! {
    /// Per-sound registry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SfxFlags: u16 {
        const RANDOM_HEADER  = 1;   // link indexes the random-list table
        const LOAD_RAW       = 2;   // raw PCM at `raw_rate`
        const SIXTEEN_BIT    = 4;
        const USED           = 8;
        const SINGULAR       = 16;  // at most one active instance
        const TENTATIVE      = 32;  // created by name before any lump was seen
        const PLAYER_RESERVE = 64;
        const PLAYER_SILENT  = 128; // intentionally silent player sound
    }
}

bitflags! {
    /// Flags handed to the backend when a voice starts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StartFlags: u32 {
        const LOOP     = 1;
        const AREA     = 2;
        const NOPAUSE  = 4;
        const NOREVERB = 8;
        const ABSTIME  = 16; // resume from the recorded start time
    }
}

/// Volume-vs-distance curve selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloffKind {
    /// Linear distance with a logarithmic volume scale.
    #[default]
    Doom,
    /// Linear distance, linear volume.
    Linear,
    /// Standard hardware-style logarithmic rolloff; never fully silent.
    Log,
    /// Volume looked up from the sound curve table.
    Custom,
}

/// Rolloff descriptor. `min_distance == 0` means unset; the resolved sound's
/// or the global rolloff applies instead.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rolloff {
    pub kind: RolloffKind,
    pub min_distance: f32,
    pub max_distance: f32,
    pub factor: f32,
}

impl Rolloff {
    pub fn is_unset(&self) -> bool {
        self.min_distance == 0.0
    }
}

/// Opaque handle to a decoded sound owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoundHandle(pub u32);

/// Opaque handle to a playing backend voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceHandle(pub u32);

/// Loader lump handle. -1 means absent.
pub type LumpNum = i32;

/// Identifies an emitter owned by the client (actor, sector, polyobject).
pub type EmitterId = u32;

/// What a channel is attached to. The variant is the tag the engine matches
/// on; `Unattached` carries its fixed point directly.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SoundSource {
    #[default]
    None,
    Actor(EmitterId),
    Sector(EmitterId),
    Polyobj(EmitterId),
    Unattached(Vec3),
}

impl SoundSource {
    pub fn is_none(&self) -> bool {
        matches!(self, SoundSource::None)
    }

    pub fn emitter(&self) -> Option<EmitterId> {
        match self {
            SoundSource::Actor(id) | SoundSource::Sector(id) | SoundSource::Polyobj(id) => {
                Some(*id)
            }
            _ => None,
        }
    }
}

/// The virtual observer handed to the 3D backend.
#[derive(Debug, Clone, Default)]
pub struct Listener {
    pub position: Vec3,
    pub velocity: Vec3,
    pub angle: f32,
    pub underwater: bool,
    pub valid: bool,
    /// Actor the listener rides on, if any; sounds from it are never
    /// distance-limited.
    pub listener_object: Option<EmitterId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_flag_layout() {
        // The wire layout of the channel argument is load-bearing: slots in
        // the low 3 bits, flags above.
        assert_eq!(CHAN_AUTO, 0);
        assert_eq!(CHAN_LISTENERZ, 8);
        assert_eq!(CHAN_MAYBE_LOCAL, 16);
        assert_eq!(CHAN_UI, 32);
        assert_eq!(CHAN_NOPAUSE, 64);
        assert_eq!(CHAN_AREA, 128);
        assert_eq!(CHAN_LOOP, 256);
        // Shared bits line up between the public layout and ChanFlags.
        assert_eq!(ChanFlags::LOOP.bits() as i32, CHAN_LOOP);
        assert_eq!(ChanFlags::UI.bits() as i32, CHAN_UI);
        assert_eq!(ChanFlags::AREA.bits() as i32, CHAN_AREA);
    }

    #[test]
    fn test_source_equality_includes_point() {
        let a = SoundSource::Unattached([1.0, 2.0, 3.0]);
        let b = SoundSource::Unattached([1.0, 2.0, 3.0]);
        let c = SoundSource::Unattached([1.0, 2.0, 4.0]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(SoundSource::Actor(1), SoundSource::Sector(1));
    }

    #[test]
    fn test_rolloff_unset() {
        assert!(Rolloff::default().is_unset());
        let set = Rolloff {
            min_distance: 200.0,
            ..Default::default()
        };
        assert!(!set.is_unset());
    }
}
