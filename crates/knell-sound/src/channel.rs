// channel.rs — playback channels and the active/free channel lists

use knell_common::math::Vec3;

use crate::types::{ChanFlags, Rolloff, SoundSource, VoiceHandle, DEFAULT_PITCH};

/// One playback slot. Lives in the pool's active list while playing or
/// parked, in the free list otherwise. The backend voice handle is non-null
/// exactly while the sound is audible on the backend.
#[derive(Debug, Clone)]
pub struct SoundChan {
    /// Sound actually playing, after link/random resolution.
    pub sound_id: u32,
    /// Sound the caller asked for.
    pub org_id: u32,
    pub volume: f32,
    pub pitch: i32,
    pub ent_channel: i32,
    pub priority: i32,
    pub near_limit: i16,
    pub limit_range: f32,
    pub source: SoundSource,
    pub distance_scale: f32,
    pub rolloff: Rolloff,
    pub flags: ChanFlags,
    /// Playback position in samples; absolute when ABSTIME is set.
    pub start_time: u64,
    pub sys_channel: Option<VoiceHandle>,
}

impl Default for SoundChan {
    fn default() -> Self {
        SoundChan {
            sound_id: 0,
            org_id: 0,
            volume: 0.0,
            pitch: DEFAULT_PITCH,
            ent_channel: 0,
            priority: 0,
            near_limit: 0,
            limit_range: 0.0,
            source: SoundSource::None,
            distance_scale: 0.0,
            rolloff: Rolloff::default(),
            flags: ChanFlags::empty(),
            start_time: 0,
            sys_channel: None,
        }
    }
}

impl SoundChan {
    pub fn is_evicted(&self) -> bool {
        self.flags.contains(ChanFlags::EVICTED)
    }

    pub fn point(&self) -> Option<Vec3> {
        match self.source {
            SoundSource::Unattached(pt) => Some(pt),
            _ => None,
        }
    }
}

/// Stable channel slot index into the pool.
pub type ChanId = usize;

struct Slot {
    prev: usize,
    next: usize,
    chan: SoundChan,
}

// Sentinel slots. Every real channel is linked into exactly one of the two
// rings at all times.
const ACTIVE: usize = 0;
const FREE: usize = 1;

/// Growable arena of channels threaded onto two sentinel-headed doubly
/// linked rings: active (playing or parked) and free. New channels link in
/// at the head of the active ring, so walking head to tail is newest first.
pub struct ChannelPool {
    slots: Vec<Slot>,
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPool {
    pub fn new() -> Self {
        let mut pool = ChannelPool { slots: Vec::new() };
        for sentinel in [ACTIVE, FREE] {
            pool.slots.push(Slot {
                prev: sentinel,
                next: sentinel,
                chan: SoundChan::default(),
            });
        }
        pool
    }

    fn unlink(&mut self, id: ChanId) {
        let (prev, next) = (self.slots[id].prev, self.slots[id].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    fn link_head(&mut self, head: usize, id: ChanId) {
        let first = self.slots[head].next;
        self.slots[id].prev = head;
        self.slots[id].next = first;
        self.slots[first].prev = id;
        self.slots[head].next = id;
    }

    /// Pops a free channel (or grows the arena), resets it, and links it at
    /// the head of the active ring.
    pub fn get_channel(&mut self, sys_channel: Option<VoiceHandle>) -> ChanId {
        let id = if self.slots[FREE].next != FREE {
            let id = self.slots[FREE].next;
            self.unlink(id);
            id
        } else {
            self.slots.push(Slot {
                prev: 0,
                next: 0,
                chan: SoundChan::default(),
            });
            self.slots.len() - 1
        };
        self.slots[id].chan = SoundChan::default();
        self.slots[id].chan.sys_channel = sys_channel;
        self.link_head(ACTIVE, id);
        id
    }

    /// Retires a channel: wipes it and moves it to the free ring.
    pub fn return_channel(&mut self, id: ChanId) {
        self.unlink(id);
        self.slots[id].chan = SoundChan::default();
        self.link_head(FREE, id);
    }

    pub fn chan(&self, id: ChanId) -> &SoundChan {
        &self.slots[id].chan
    }

    pub fn chan_mut(&mut self, id: ChanId) -> &mut SoundChan {
        &mut self.slots[id].chan
    }

    /// Active channel ids, newest first. Collected up front so callers can
    /// retire channels while iterating.
    pub fn active(&self) -> Vec<ChanId> {
        let mut ids = Vec::new();
        let mut id = self.slots[ACTIVE].next;
        while id != ACTIVE {
            ids.push(id);
            id = self.slots[id].next;
        }
        ids
    }

    /// Active channel ids oldest first — the order the sounds were started.
    pub fn active_oldest_first(&self) -> Vec<ChanId> {
        let mut ids = Vec::new();
        let mut id = self.slots[ACTIVE].prev;
        while id != ACTIVE {
            ids.push(id);
            id = self.slots[id].prev;
        }
        ids
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut id = self.slots[FREE].next;
        while id != FREE {
            count += 1;
            id = self.slots[id].next;
        }
        count
    }

    /// Finds the active channel that owns a backend voice.
    pub fn find_by_voice(&self, voice: VoiceHandle) -> Option<ChanId> {
        self.active()
            .into_iter()
            .find(|&id| self.slots[id].chan.sys_channel == Some(voice))
    }
}
