// cache.rs — decoded-sound cache, dedup, and format dispatch
//
// Decoded handles live on the sfx entries themselves. Loading chases the
// cheap paths first: already decoded, then another entry with the same lump
// (which becomes a link), then an actual read + decode. A sound that fails
// to decode falls back to the empty sentinel lump and is retried once.

use log::debug;

use crate::backend::{DecodedSound, SoundBackend, SoundClient};
use crate::engine::SoundEngine;
use crate::registry::{MAX_LINK_DEPTH, NO_LINK};
use crate::types::SfxFlags;

/// Raw lump bytes kept from the 2D load so the 3D load does not hit the
/// loader a second time.
#[derive(Debug, Default)]
pub struct LoadBuffer {
    pub(crate) bytes: Vec<u8>,
}

/// DMX header: (3, 0) magic, 16-bit LE rate, 32-bit LE sample count, data at
/// offset 8. A zero rate means the standard 11025 Hz.
fn dmx_header(data: &[u8]) -> Option<(usize, i32)> {
    if data.len() > 8 && data[0] == 3 && data[1] == 0 {
        let len = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if len >= 0 && (len as usize) <= data.len() - 8 {
            let mut rate = u16::from_le_bytes([data[2], data[3]]) as i32;
            if rate == 0 {
                rate = 11025;
            }
            return Some((len as usize, rate));
        }
    }
    None
}

impl SoundEngine {
    /// Content-dispatched decode for one sfx entry's bytes.
    fn decode_sound(
        &self,
        backend: &mut dyn SoundBackend,
        id: u32,
        data: &[u8],
        monoize: bool,
        buffered: bool,
    ) -> DecodedSound {
        if data.len() <= 8 {
            return DecodedSound::default();
        }
        let sfx = &self.sfx[id as usize];
        if data.starts_with(b"Creative Voice File") {
            backend.load_sound_voc(data, monoize)
        } else if sfx.flags.contains(SfxFlags::LOAD_RAW) {
            backend.load_sound_raw(data, sfx.raw_rate, 1, 8, sfx.loop_start, monoize)
        } else if let Some((len, rate)) = dmx_header(data) {
            backend.load_sound_raw(&data[8..8 + len], rate, 1, 8, sfx.loop_start, monoize)
        } else if buffered {
            backend.load_sound_buffered(data, monoize)
        } else {
            backend.load_sound(data, monoize)
        }
    }

    /// Ensures `id` has a decoded 2D handle. Returns the canonical entry
    /// index: when another entry already holds this lump decoded, this entry
    /// becomes a link to it and the canonical index is returned instead.
    pub fn load_sound(
        &mut self,
        id: u32,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        buffer: &mut LoadBuffer,
    ) -> u32 {
        if backend.is_null() {
            return id;
        }
        while self.sfx[id as usize].data.is_none() {
            // Missing lumps play as the empty sound.
            if self.sfx[id as usize].lumpnum == -1 {
                self.sfx[id as usize].lumpnum = self.empty_lump;
            }

            let lump = self.sfx[id as usize].lumpnum;
            let dup = (0..self.sfx.len()).find(|&i| {
                i != id as usize
                    && self.sfx[i].data.is_some()
                    && self.sfx[i].link == NO_LINK
                    && self.sfx[i].lumpnum == lump
            });
            if let Some(canonical) = dup {
                debug!(
                    "linked '{}' to '{}' ({})",
                    self.sfx[id as usize].name, self.sfx[canonical].name, canonical
                );
                self.sfx[id as usize].link = canonical as u32;
                // Keep this entry's rolloff meaningful rather than falling
                // through to the linked sound's settings.
                if self.sfx[id as usize].rolloff.is_unset() {
                    self.sfx[id as usize].rolloff = self.global_rolloff;
                }
                return canonical as u32;
            }

            debug!("loading sound '{}' ({})", self.sfx[id as usize].name, id);
            let data = client.read_sound(lump);
            if data.len() > 8 {
                let snd = self.decode_sound(backend, id, &data, false, false);
                buffer.bytes = data;
                self.sfx[id as usize].data = snd.handle;
                if snd.spatial {
                    self.sfx[id as usize].data3d = snd.handle;
                }
            }

            if self.sfx[id as usize].data.is_none() {
                if self.sfx[id as usize].lumpnum != self.empty_lump {
                    self.sfx[id as usize].lumpnum = self.empty_lump;
                    continue;
                }
            }
            break;
        }
        id
    }

    /// Ensures `id` has a decoded handle usable for 3D playback. Reuses the
    /// bytes from the matching `load_sound` call when available.
    pub fn load_sound_3d(
        &mut self,
        id: u32,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        buffer: &LoadBuffer,
    ) {
        if backend.is_null() || self.sfx[id as usize].data3d.is_some() {
            return;
        }
        let buffered = !buffer.bytes.is_empty();
        let data = if buffered {
            buffer.bytes.clone()
        } else {
            client.read_sound(self.sfx[id as usize].lumpnum)
        };
        if data.len() <= 8 {
            return;
        }
        let snd = self.decode_sound(backend, id, &data, true, buffered);
        self.sfx[id as usize].data3d = snd.handle;
    }

    /// Releases both decoded handles, once each when they alias.
    pub fn unload_sound(&mut self, backend: &mut dyn SoundBackend, id: u32) {
        let sfx = &mut self.sfx[id as usize];
        if let Some(data3d) = sfx.data3d {
            if sfx.data != Some(data3d) {
                backend.unload_sound(data3d);
            }
        }
        if let Some(data) = sfx.data {
            backend.unload_sound(data);
        }
        sfx.data = None;
        sfx.data3d = None;
    }

    pub fn unload_all_sounds(&mut self, backend: &mut dyn SoundBackend) {
        for id in 0..self.sfx.len() {
            self.unload_sound(backend, id as u32);
        }
    }

    /// Precaches one sound, chasing links and expanding random headers.
    pub fn cache_sound(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        id: u32,
    ) {
        if backend.is_null() {
            return;
        }
        if self.sfx[id as usize].flags.contains(SfxFlags::PLAYER_RESERVE) {
            return;
        }
        let mut id = id;
        let mut depth = 0;
        while !self.sfx[id as usize].flags.contains(SfxFlags::RANDOM_HEADER)
            && self.sfx[id as usize].link != NO_LINK
            && depth < MAX_LINK_DEPTH
        {
            id = self.sfx[id as usize].link;
            depth += 1;
        }
        if self.sfx[id as usize].flags.contains(SfxFlags::RANDOM_HEADER) {
            self.cache_random_sound(backend, client, id);
        } else {
            // The use is not known yet, so cache both formats.
            let mut buffer = LoadBuffer::default();
            let canonical = self.load_sound(id, backend, client, &mut buffer);
            self.load_sound_3d(canonical, backend, client, &buffer);
            self.sfx[id as usize].flags |= SfxFlags::USED;
        }
    }

    /// Precaches every sound a random header might pick.
    pub fn cache_random_sound(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        id: u32,
    ) {
        if !self.sfx[id as usize].flags.contains(SfxFlags::RANDOM_HEADER) {
            return;
        }
        let choices = self.rnd[self.sfx[id as usize].link as usize].choices.clone();
        for choice in choices {
            self.mark_used(choice);
            self.cache_sound(backend, client, choice);
        }
    }

    /// Loads everything marked used and unloads the rest, keeping whatever
    /// an active channel currently references.
    pub fn cache_marked_sounds(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
    ) {
        // Don't unload sounds that are playing right now.
        for id in self.channels.active() {
            let sound_id = self.channels.chan(id).sound_id;
            self.mark_used(sound_id);
        }
        for i in 1..self.sfx.len() as u32 {
            if self.sfx[i as usize].flags.contains(SfxFlags::USED) {
                self.cache_sound(backend, client, i);
            }
        }
        for i in 1..self.sfx.len() as u32 {
            if !self.sfx[i as usize].flags.contains(SfxFlags::USED)
                && self.sfx[i as usize].link == NO_LINK
            {
                self.unload_sound(backend, i);
            }
        }
    }

    /// Length of a sound in milliseconds, chasing links; random headers
    /// report their longest choice.
    pub fn get_ms_length(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        sound: u32,
    ) -> u64 {
        self.ms_length_at(backend, client, sound, 0)
    }

    fn ms_length_at(
        &mut self,
        backend: &mut dyn SoundBackend,
        client: &mut dyn SoundClient,
        sound: u32,
        depth: u32,
    ) -> u64 {
        if sound as usize >= self.sfx.len() || depth > MAX_LINK_DEPTH {
            return 0;
        }
        let sfx = &self.sfx[sound as usize];
        if sfx.link != NO_LINK {
            if sfx.flags.contains(SfxFlags::RANDOM_HEADER) {
                // All choices have to be loaded to find the longest one.
                let choices = self.rnd[sfx.link as usize].choices.clone();
                return choices
                    .into_iter()
                    .map(|choice| self.ms_length_at(backend, client, choice, depth + 1))
                    .max()
                    .unwrap_or(0);
            }
            let link = sfx.link;
            return self.ms_length_at(backend, client, link, depth + 1);
        }
        let mut buffer = LoadBuffer::default();
        let canonical = self.load_sound(sound, backend, client, &mut buffer);
        match self.sfx[canonical as usize].data {
            Some(handle) => backend.get_ms_length(handle),
            None => 0,
        }
    }

    /// Follows links until a decoded 2D handle is found.
    pub(crate) fn sound_data(&self, id: u32) -> Option<crate::types::SoundHandle> {
        let mut id = id as usize;
        for _ in 0..MAX_LINK_DEPTH {
            if id >= self.sfx.len() {
                return None;
            }
            if let Some(handle) = self.sfx[id].data {
                return Some(handle);
            }
            if self.sfx[id].link == NO_LINK {
                return None;
            }
            id = self.sfx[id].link as usize;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{dmx_blob, voc_blob, MockBackend, MockClient};

    const EMPTY_LUMP: i32 = 900;

    fn setup() -> (SoundEngine, MockBackend, MockClient) {
        let mut engine = SoundEngine::new();
        engine.init(Vec::new(), EMPTY_LUMP);
        let backend = MockBackend::new();
        let mut client = MockClient::new();
        client.lumps.insert(EMPTY_LUMP, vec![0u8; 4]); // too short to decode
        (engine, backend, client)
    }

    #[test]
    fn test_dmx_dispatch_reads_rate() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("world/drip", 10, 0, -1);
        client.lumps.insert(10, dmx_blob(22050, 100));

        let mut buffer = LoadBuffer::default();
        let canonical = engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        assert_eq!(canonical, id);
        assert!(engine.sfx(id).data.is_some());
        let load = backend.loads.last().unwrap();
        assert_eq!(load.kind, "raw");
        assert_eq!(load.rate, 22050);
        assert_eq!(load.len, 100);
    }

    #[test]
    fn test_dmx_zero_rate_defaults() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("world/drip", 10, 0, -1);
        client.lumps.insert(10, dmx_blob(0, 64));

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        assert_eq!(backend.loads.last().unwrap().rate, 11025);
    }

    #[test]
    fn test_voc_dispatch() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("misc/voc", 11, 0, -1);
        client.lumps.insert(11, voc_blob(50));

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        assert_eq!(backend.loads.last().unwrap().kind, "voc");
    }

    #[test]
    fn test_raw_flag_dispatch() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("misc/raw", 12, 0, -1);
        engine.sfx_mut(id).flags |= SfxFlags::LOAD_RAW;
        engine.sfx_mut(id).raw_rate = 8000;
        client.lumps.insert(12, vec![0x40u8; 64]);

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        let load = backend.loads.last().unwrap();
        assert_eq!(load.kind, "raw");
        assert_eq!(load.rate, 8000);
    }

    #[test]
    fn test_generic_fallback_dispatch() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("misc/ogg", 13, 0, -1);
        client.lumps.insert(13, vec![b'O', b'g', b'g', b'S', 0, 0, 0, 0, 0, 0]);

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        assert_eq!(backend.loads.last().unwrap().kind, "generic");
        // The generic decoder reported a 3D-capable handle, so it aliases.
        assert_eq!(engine.sfx(id).data, engine.sfx(id).data3d);
    }

    #[test]
    fn test_dedup_links_same_lump() {
        let (mut engine, mut backend, mut client) = setup();
        let a = engine.add_sound_lump("first", 20, 0, -1);
        let b = engine.add_sound_lump("alias", 20, 0, -1);
        client.lumps.insert(20, dmx_blob(11025, 32));

        let mut buffer = LoadBuffer::default();
        let ca = engine.load_sound(a, &mut backend, &mut client, &mut buffer);
        assert_eq!(ca, a);

        let mut buffer = LoadBuffer::default();
        let cb = engine.load_sound(b, &mut backend, &mut client, &mut buffer);
        assert_eq!(cb, a);
        assert_eq!(engine.sfx(b).link, a);
        assert!(engine.sfx(b).data.is_none());
        // Only one decode happened.
        assert_eq!(backend.loads.len(), 1);
    }

    #[test]
    fn test_missing_lump_substitutes_empty() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("ghost", -1, 0, -1);

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        assert_eq!(engine.sfx(id).lumpnum, EMPTY_LUMP);
        assert!(engine.sfx(id).data.is_none());
    }

    #[test]
    fn test_decode_failure_retries_with_empty() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("broken", 30, 0, -1);
        // Big enough to attempt, but the mock refuses to decode it.
        client.lumps.insert(30, vec![0xEE; 32]);
        backend.refuse_decodes = true;

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        assert_eq!(engine.sfx(id).lumpnum, EMPTY_LUMP);
        assert!(engine.sfx(id).data.is_none());
    }

    #[test]
    fn test_load_sound_3d_reuses_buffer() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("world/drip", 10, 0, -1);
        client.lumps.insert(10, dmx_blob(11025, 16));

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        let reads_before = client.reads;
        engine.load_sound_3d(id, &mut backend, &mut client, &buffer);
        assert!(engine.sfx(id).data3d.is_some());
        assert_eq!(client.reads, reads_before);
    }

    #[test]
    fn test_unload_aliased_handles_once() {
        let (mut engine, mut backend, mut client) = setup();
        let id = engine.add_sound_lump("misc/ogg", 13, 0, -1);
        client.lumps.insert(13, vec![0x10u8; 32]);

        let mut buffer = LoadBuffer::default();
        engine.load_sound(id, &mut backend, &mut client, &mut buffer);
        assert_eq!(engine.sfx(id).data, engine.sfx(id).data3d);
        engine.unload_sound(&mut backend, id);
        assert_eq!(backend.unloads.len(), 1);
        assert!(engine.sfx(id).data.is_none());
        assert!(engine.sfx(id).data3d.is_none());
    }

    #[test]
    fn test_cache_marked_sounds_unloads_unused() {
        let (mut engine, mut backend, mut client) = setup();
        let keep = engine.add_sound_lump("keep", 40, 0, -1);
        let drop_ = engine.add_sound_lump("drop", 41, 0, -1);
        client.lumps.insert(40, dmx_blob(11025, 8));
        client.lumps.insert(41, dmx_blob(11025, 8));

        let mut buffer = LoadBuffer::default();
        engine.load_sound(keep, &mut backend, &mut client, &mut buffer);
        let mut buffer = LoadBuffer::default();
        engine.load_sound(drop_, &mut backend, &mut client, &mut buffer);

        engine.mark_all_unused();
        engine.mark_used(keep);
        engine.cache_marked_sounds(&mut backend, &mut client);
        assert!(engine.sfx(keep).data.is_some());
        assert!(engine.sfx(drop_).data.is_none());
    }

    #[test]
    fn test_get_ms_length_longest_random_choice() {
        let (mut engine, mut backend, mut client) = setup();
        let header = engine.add_sound_lump("header", -1, 0, -1);
        let short = engine.add_sound_lump("short", 50, 0, -1);
        let long = engine.add_sound_lump("long", 51, 0, -1);
        engine.add_random_sound(header, vec![short, long]);
        client.lumps.insert(50, dmx_blob(11025, 16));
        client.lumps.insert(51, dmx_blob(11025, 64));
        backend.ms_per_byte = 10;

        let ms = engine.get_ms_length(&mut backend, &mut client, header);
        assert_eq!(ms, 640);
    }
}
