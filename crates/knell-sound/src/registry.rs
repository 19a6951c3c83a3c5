// registry.rs — the sound definition table
//
// Logical names map to sfx entries through a chained hash living inside the
// table itself (`next`/`index` per entry). Entry 0 is the reserved null
// sound. Random headers link into a side table of choice lists.

use std::hash::Hasher;

use log::error;
use rand::Rng;

use crate::engine::SoundEngine;
use crate::types::{LumpNum, Rolloff, SfxFlags, SoundHandle};

/// Terminal link value.
pub const NO_LINK: u32 = u32::MAX;

/// Link chains and random picks give up after this many steps; authored
/// data with deeper chains is an error, not a reason to spin.
pub(crate) const MAX_LINK_DEPTH: u32 = 32;

/// One logical sound: its resource mapping, playback policy, and cached
/// decoded handles.
#[derive(Debug, Clone)]
pub struct SfxInfo {
    /// Logical name; compared case-insensitively.
    pub name: String,
    pub lumpnum: LumpNum,
    /// Hash chain: `index` is the bucket head stored on the entry whose
    /// position matches the bucket, `next` continues the chain.
    pub next: u32,
    pub index: u32,
    pub volume: f32,
    pub resource_id: i32,
    pub pitch_mask: u8,
    /// Max nearby copies. 0 = unlimited, negative = inherit from the
    /// resolved link target.
    pub near_limit: i16,
    /// Squared distance for the near limit.
    pub limit_range: f32,
    pub flags: SfxFlags,
    /// Sample rate used when LOAD_RAW is set.
    pub raw_rate: i32,
    /// -1 means no explicit loop point.
    pub loop_start: i32,
    /// Index of the linked sound, or into the random table when
    /// RANDOM_HEADER is set. NO_LINK terminates.
    pub link: u32,
    pub rolloff: Rolloff,
    /// Multiplies the attenuation passed to start_sound.
    pub attenuation: f32,
    pub data: Option<SoundHandle>,
    pub data3d: Option<SoundHandle>,
}

impl SfxInfo {
    pub(crate) fn new(name: &str, lump: LumpNum, pitch_mask: u8, resid: i32) -> Self {
        SfxInfo {
            name: name.to_string(),
            lumpnum: lump,
            next: 0,
            index: 0,
            volume: 1.0,
            resource_id: resid,
            pitch_mask,
            near_limit: 2,
            limit_range: 256.0 * 256.0,
            flags: SfxFlags::empty(),
            raw_rate: 0,
            loop_start: -1,
            link: NO_LINK,
            rolloff: Rolloff::default(),
            attenuation: 1.0,
            data: None,
            data3d: None,
        }
    }
}

/// Choices for one random header, picked uniformly.
#[derive(Debug, Clone, Default)]
pub struct RandomSoundList {
    pub choices: Vec<u32>,
    pub owner: u32,
}

fn sound_hash(name: &str) -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for b in name.bytes() {
        hasher.write_u8(b.to_ascii_lowercase());
    }
    hasher.finish() as u32
}

impl SoundEngine {
    /// Appends a new sound mapping with default policy. The hash is not
    /// rebuilt; call `hash_sounds` after bulk loading.
    pub fn add_sound_lump(&mut self, name: &str, lump: LumpNum, pitch_mask: u8, resid: i32) -> u32 {
        let index = self.sfx.len() as u32;
        self.sfx.push(SfxInfo::new(name, lump, pitch_mask, resid));
        if resid >= 0 {
            self.resid_map.insert(resid, index);
        }
        index
    }

    /// Rebuilds the name hash chains over the whole table.
    pub fn hash_sounds(&mut self) {
        self.sfx.shrink_to_fit();
        let size = self.sfx.len() as u32;

        for sfx in self.sfx.iter_mut() {
            sfx.index = 0;
        }
        for i in 1..size {
            let bucket = (sound_hash(&self.sfx[i as usize].name) % size) as usize;
            self.sfx[i as usize].next = self.sfx[bucket].index;
            self.sfx[bucket].index = i;
        }
        self.rnd.shrink_to_fit();
    }

    /// Hash lookup by logical name. Returns 0 when not found.
    pub fn find_sound(&self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let bucket = (sound_hash(name) % self.sfx.len() as u32) as usize;
        let mut i = self.sfx[bucket].index;
        while i != 0 && !self.sfx[i as usize].name.eq_ignore_ascii_case(name) {
            i = self.sfx[i as usize].next;
        }
        i
    }

    /// Linear-scan lookup, valid before the hash is built.
    pub fn find_sound_no_hash(&self, name: &str) -> u32 {
        for i in 1..self.sfx.len() {
            if self.sfx[i].name.eq_ignore_ascii_case(name) {
                return i as u32;
            }
        }
        0
    }

    pub fn find_sound_by_resid(&self, resid: i32) -> u32 {
        self.resid_map.get(&resid).copied().unwrap_or(0)
    }

    pub fn find_sound_by_lump(&self, lump: LumpNum) -> u32 {
        if lump != -1 {
            for i in 1..self.sfx.len() {
                if self.sfx[i].lumpnum == lump {
                    return i as u32;
                }
            }
        }
        0
    }

    /// Lookup that creates a lumpless tentative entry when the name is
    /// unknown, so forward references resolve once the real sound loads.
    pub fn find_sound_tentative(&mut self, name: &str) -> u32 {
        let id = self.find_sound_no_hash(name);
        if id != 0 {
            return id;
        }
        let id = self.add_sound_lump(name, -1, 0, -1);
        self.sfx[id as usize].flags |= SfxFlags::TENTATIVE;
        id
    }

    /// Reserves a random list, makes `owner` a random header over it, and
    /// defers the owner's near limit to whichever child gets picked.
    pub fn add_random_sound(&mut self, owner: u32, choices: Vec<u32>) {
        let index = self.rnd.len() as u32;
        self.rnd.push(RandomSoundList { choices, owner });
        let sfx = &mut self.sfx[owner as usize];
        sfx.link = index;
        sfx.flags |= SfxFlags::RANDOM_HEADER;
        sfx.near_limit = -1;
    }

    /// Resolves random headers to a concrete sound, one uniform pick per
    /// level. Bounded; a chain deeper than the cap is reported and the last
    /// id reached is returned.
    pub fn pick_replacement(&self, refid: u32) -> u32 {
        let mut id = refid;
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_LINK_DEPTH {
            let sfx = &self.sfx[id as usize];
            if !sfx.flags.contains(SfxFlags::RANDOM_HEADER) {
                return id;
            }
            let list = &self.rnd[sfx.link as usize];
            if list.choices.is_empty() {
                return id;
            }
            id = list.choices[rng.gen_range(0..list.choices.len())];
        }
        error!(
            "random sound chain too deep starting at '{}'",
            self.sfx[refid as usize].name
        );
        id
    }

    pub fn get_sound_name(&self, id: u32) -> &str {
        if id == 0 {
            return "";
        }
        self.sfx
            .get(id as usize)
            .map_or("", |sfx| sfx.name.as_str())
    }

    pub fn num_sounds(&self) -> usize {
        self.sfx.len()
    }

    pub fn sfx(&self, id: u32) -> &SfxInfo {
        &self.sfx[id as usize]
    }

    /// Mutable access for definition loaders that patch policy fields
    /// (volume, singular, limits) after `add_sound_lump`.
    pub fn sfx_mut(&mut self, id: u32) -> &mut SfxInfo {
        &mut self.sfx[id as usize]
    }

    pub fn mark_used(&mut self, id: u32) {
        if let Some(sfx) = self.sfx.get_mut(id as usize) {
            sfx.flags |= SfxFlags::USED;
        }
    }

    pub fn mark_all_unused(&mut self) {
        for sfx in self.sfx.iter_mut() {
            sfx.flags.remove(SfxFlags::USED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(names: &[&str]) -> SoundEngine {
        let mut engine = SoundEngine::new();
        for (i, name) in names.iter().enumerate() {
            engine.add_sound_lump(name, i as i32 + 10, 0, -1);
        }
        engine.hash_sounds();
        engine
    }

    #[test]
    fn test_find_sound_case_insensitive() {
        let engine = engine_with(&["weapons/rocket", "world/drip", "monster/sight"]);
        let id = engine.find_sound("WEAPONS/ROCKET");
        assert_ne!(id, 0);
        assert_eq!(engine.get_sound_name(id), "weapons/rocket");
        assert_eq!(engine.find_sound("missing/sound"), 0);
    }

    #[test]
    fn test_entry_zero_is_reserved() {
        let engine = engine_with(&["a"]);
        assert_eq!(engine.get_sound_name(0), "");
        assert_eq!(engine.find_sound(""), 0);
    }

    #[test]
    fn test_add_sound_lump_defaults() {
        let mut engine = SoundEngine::new();
        let id = engine.add_sound_lump("world/quake", 42, 7, 123);
        let sfx = engine.sfx(id);
        assert_eq!(sfx.volume, 1.0);
        assert_eq!(sfx.attenuation, 1.0);
        assert_eq!(sfx.near_limit, 2);
        assert_eq!(sfx.limit_range, 65536.0);
        assert_eq!(sfx.loop_start, -1);
        assert_eq!(sfx.link, NO_LINK);
        assert_eq!(sfx.pitch_mask, 7);
        assert!(sfx.rolloff.is_unset());
        assert_eq!(engine.find_sound_by_resid(123), id);
    }

    #[test]
    fn test_find_sound_by_lump() {
        let engine = engine_with(&["a", "b"]);
        assert_ne!(engine.find_sound_by_lump(11), 0);
        assert_eq!(engine.find_sound_by_lump(-1), 0);
        assert_eq!(engine.find_sound_by_lump(999), 0);
    }

    #[test]
    fn test_tentative_entry_created_once() {
        let mut engine = engine_with(&["a"]);
        let id = engine.find_sound_tentative("future/sound");
        assert!(engine.sfx(id).flags.contains(SfxFlags::TENTATIVE));
        assert_eq!(engine.sfx(id).lumpnum, -1);
        assert_eq!(engine.find_sound_tentative("FUTURE/SOUND"), id);
    }

    #[test]
    fn test_add_random_sound_defers_near_limit() {
        let mut engine = engine_with(&["header", "a", "b"]);
        let header = engine.find_sound("header");
        let a = engine.find_sound("a");
        let b = engine.find_sound("b");
        engine.add_random_sound(header, vec![a, b]);

        let sfx = engine.sfx(header);
        assert!(sfx.flags.contains(SfxFlags::RANDOM_HEADER));
        assert_eq!(sfx.near_limit, -1);
        assert_eq!(sfx.link, 0);
    }

    #[test]
    fn test_pick_replacement_resolves_nested_headers() {
        let mut engine = engine_with(&["outer", "inner", "leaf1", "leaf2"]);
        let outer = engine.find_sound("outer");
        let inner = engine.find_sound("inner");
        let leaf1 = engine.find_sound("leaf1");
        let leaf2 = engine.find_sound("leaf2");
        engine.add_random_sound(inner, vec![leaf1, leaf2]);
        engine.add_random_sound(outer, vec![inner]);

        for _ in 0..20 {
            let picked = engine.pick_replacement(outer);
            assert!(picked == leaf1 || picked == leaf2);
        }
        // Non-headers return themselves.
        assert_eq!(engine.pick_replacement(leaf1), leaf1);
    }

    #[test]
    fn test_pick_replacement_caps_cycles() {
        let mut engine = engine_with(&["x", "y"]);
        let x = engine.find_sound("x");
        let y = engine.find_sound("y");
        // Authored-data error: two headers picking each other.
        engine.add_random_sound(x, vec![y]);
        engine.add_random_sound(y, vec![x]);
        // Must terminate.
        let picked = engine.pick_replacement(x);
        assert!(picked == x || picked == y);
    }

    #[test]
    fn test_hash_rebuild_after_growth() {
        let mut engine = engine_with(&["a"]);
        engine.add_sound_lump("late/sound", 99, 0, -1);
        // Not findable through the hash until rebuilt.
        engine.hash_sounds();
        assert_ne!(engine.find_sound("late/sound"), 0);
    }

    #[test]
    fn test_mark_all_unused() {
        let mut engine = engine_with(&["a", "b"]);
        engine.mark_used(1);
        engine.mark_used(2);
        engine.mark_all_unused();
        assert!(!engine.sfx(1).flags.contains(SfxFlags::USED));
        assert!(!engine.sfx(2).flags.contains(SfxFlags::USED));
    }
}
