// knell-sound — channel-based game sound engine.
//
// A fixed-policy scheduler maps logical sound starts onto backend voices:
// link/random resolution, singular and near-limit policies, per-emitter
// channel slots, eviction with later restart, and a savegame snapshot of the
// live channel list.

pub mod backend;
pub mod cache;
pub mod channel;
pub mod engine;
pub mod registry;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod mock;

pub use backend::{DecodedSound, NullBackend, SoundBackend, SoundClient};
pub use cache::LoadBuffer;
pub use channel::{ChanId, SoundChan};
pub use engine::SoundEngine;
pub use registry::{RandomSoundList, SfxInfo, NO_LINK};
pub use types::{
    ChanFlags, EmitterId, Listener, LumpNum, Rolloff, RolloffKind, SfxFlags, SoundHandle,
    SoundSource, StartFlags, VoiceHandle,
};
