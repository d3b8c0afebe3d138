/*
    ALICE-Replica
    Copyright (C) 2026 Moroya Sakamoto

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as
    published by the Free Software Foundation, either version 3 of the
    License, or (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Wire protocol - snapshot payloads, fragments, input packets
//!
//! Three snapshot encodings trade bandwidth against recovery latency:
//! **full** (first contact / catastrophic loss), **delta** (dirty words
//! since the peer's acked tick), **multi-tick** (OR of dirty maps
//! across the catch-up window, bounded by the ring; beyond it, full).
//! Records are `-1`-sentinel terminated; oversized payloads fragment
//! across datagrams and reassemble idempotently.
//!
//! The snapshot payload is a hand-rolled little-endian stream because
//! it splices by dirty word; the structured envelopes around it (and
//! the client's input packet) go through bitcode like every other
//! ALICE message.

use crate::entity::{ConnectionId, EntityRef, PrefabId};
use crate::interest::ConnectionInterest;
use crate::tick::Tick;
use crate::world::WorldState;
use crate::{ReplicaError, Result};
use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// First byte of every snapshot fragment.
pub const SNAPSHOT_TAG: u8 = 0xA7;

/// Record terminator shared by meta and state sections.
pub const SENTINEL: i32 = -1;

// ============================================================================
// Byte cursor
// ============================================================================

/// Append-only little-endian writer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    #[inline]
    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Bounds-checked little-endian reader.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(ReplicaError::MalformedPacket("truncated payload"));
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ============================================================================
// Snapshot payload
// ============================================================================

/// Which of the three encodings a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMode {
    Full,
    Delta,
    MultiTick,
}

/// Reassembled-payload header, field-for-field on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayloadHeader {
    /// Last input author tick the server accepted from this client.
    pub last_acked_client_tick: Tick,
    /// Last input target tick the server accepted from this client.
    pub last_client_target_tick: Tick,
    /// Server-measured arrival jitter, for the client's clock.
    pub inter_packet_delta: f64,
    pub is_multi: bool,
    pub is_full: bool,
}

/// One decoded metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaRecord {
    pub meta_id: u16,
    pub entity_ref: EntityRef,
    pub prefab: PrefabId,
    pub input_source: ConnectionId,
    pub destroyed: bool,
}

/// One decoded per-entity state run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub meta_id: u16,
    pub words: Vec<(u16, u32)>,
}

/// Fully decoded snapshot payload plus its fragment-header tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPayload {
    pub author_tick: Tick,
    pub header: PayloadHeader,
    pub metas: Vec<MetaRecord>,
    pub states: Vec<StateRecord>,
}

/// Pick the cheapest encoding the ring still supports for a peer.
#[must_use]
pub fn choose_mode(world: &WorldState, acked: Tick, needs_full: bool) -> PacketMode {
    if needs_full || !acked.is_valid() {
        return PacketMode::Full;
    }
    let now = world.current.tick;
    let behind = now - acked;
    if behind <= 1 {
        return PacketMode::Delta;
    }
    // changes of tick x live in ring[x+1] for x < now; the whole
    // window acked+1 .. now-1 must still be stamped
    for x in (acked.0 + 1)..now.0 {
        if world.history(Tick(x + 1)).is_none() {
            return PacketMode::Full;
        }
    }
    PacketMode::MultiTick
}

/// Dirty-word OR across the catch-up window for one entity.
///
/// Returns `None` when the entity did not exist across the whole
/// window (it entered mid-window and must be sent in full).
fn multi_tick_dirty(world: &WorldState, meta_id: u16, acked: Tick) -> Option<Vec<u32>> {
    let current = &world.current;
    if !current.slot(meta_id).is_valid() {
        return Some(Vec::new());
    }
    let mut acc: Vec<u32> = current.dirty_words(meta_id).to_vec();
    let now = current.tick;
    for x in (acked.0 + 1)..now.0 {
        let snap = world.history(Tick(x + 1))?;
        if !snap.slot(meta_id).is_valid() || snap.meta(meta_id).entity_ref != current.meta(meta_id).entity_ref {
            return None;
        }
        for (i, d) in snap.dirty_words(meta_id).iter().enumerate() {
            if *d != 0 {
                if let Some(slot) = acc.get_mut(i) {
                    *slot = 1;
                }
            }
        }
    }
    Some(acc)
}

fn put_meta_record(w: &mut ByteWriter, meta_id: u16, rec: &crate::snapshot::EntityMeta, destroyed: bool) {
    w.put_i32(i32::from(meta_id));
    w.put_i32(rec.entity_ref.0);
    w.put_i32(i32::from(rec.prefab.0));
    w.put_i32(rec.input_source.0);
    w.put_bool(destroyed);
}

fn put_state_record(w: &mut ByteWriter, meta_id: u16, words: impl Iterator<Item = (u16, u32)>) {
    w.put_i32(i32::from(meta_id));
    for (idx, value) in words {
        w.put_i32(i32::from(idx));
        w.put_u32(value);
    }
    w.put_i32(SENTINEL);
}

/// Encode one connection's view of the current tick.
///
/// The caller already updated `interest` for this tick and chose the
/// mode; `acked` is only read in multi-tick mode.
#[must_use]
pub fn encode_snapshot(
    world: &WorldState,
    interest: &ConnectionInterest,
    header: &PayloadHeader,
    mode: PacketMode,
    acked: Tick,
) -> Vec<u8> {
    let snap = &world.current;
    let mut w = ByteWriter::new();
    w.put_i32(header.last_acked_client_tick.0);
    w.put_i32(header.last_client_target_tick.0);
    w.put_f64(header.inter_packet_delta);
    w.put_bool(mode == PacketMode::MultiTick);
    w.put_bool(mode == PacketMode::Full);

    let mut visible: Vec<u16> = interest.visible().collect();
    visible.sort_unstable();

    // which entities are announced in full this packet
    let announce_full = |meta_id: u16| -> bool {
        mode == PacketMode::Full || interest.entered().contains(&meta_id)
    };

    // --- meta section ---
    match mode {
        PacketMode::Full => {
            for &meta_id in &visible {
                let meta = snap.meta(meta_id);
                if meta.is_valid() && !meta.destroyed {
                    put_meta_record(&mut w, meta_id, meta, false);
                }
            }
        }
        PacketMode::Delta | PacketMode::MultiTick => {
            // destroys whose carrying datagram may have been lost ride
            // again, ahead of any re-announcement of a recycled slot
            for removal in interest.pending_removals() {
                let meta = crate::snapshot::EntityMeta {
                    entity_ref: removal.entity_ref,
                    prefab: removal.prefab,
                    input_source: removal.input_source,
                    destroyed: true,
                };
                put_meta_record(&mut w, removal.meta_id, &meta, true);
            }
            for &meta_id in &visible {
                let meta = snap.meta(meta_id);
                if !meta.is_valid() {
                    continue;
                }
                let meta_changed = if mode == PacketMode::Delta {
                    snap.is_meta_dirty(meta_id)
                } else {
                    // conservative across the window: re-announce when any
                    // window snapshot flagged it, or the window is gone
                    window_meta_dirty(world, meta_id, acked)
                };
                if meta_changed || announce_full(meta_id) {
                    put_meta_record(&mut w, meta_id, meta, meta.destroyed);
                }
            }
            // exit records: sent once more so the peer can unload
            for &meta_id in interest.left() {
                let meta = snap.meta(meta_id);
                if meta.is_valid() {
                    put_meta_record(&mut w, meta_id, meta, true);
                }
            }
        }
    }
    w.put_i32(SENTINEL);

    // --- state section ---
    for &meta_id in &visible {
        let meta = snap.meta(meta_id);
        if !meta.is_valid() || !snap.slot(meta_id).is_valid() {
            continue;
        }
        if mode == PacketMode::Full || announce_full(meta_id) {
            if meta.destroyed {
                continue;
            }
            let words = snap.state_words(meta_id);
            put_state_record(
                &mut w,
                meta_id,
                words.iter().enumerate().map(|(i, &v)| (i as u16, v)),
            );
            continue;
        }
        match mode {
            PacketMode::Delta => {
                if snap.has_dirty_state(meta_id) {
                    put_state_record(&mut w, meta_id, snap.changed_words(meta_id));
                }
            }
            PacketMode::MultiTick => {
                match multi_tick_dirty(world, meta_id, acked) {
                    Some(mask) if mask.iter().any(|&d| d != 0) => {
                        let words = snap.state_words(meta_id);
                        put_state_record(
                            &mut w,
                            meta_id,
                            mask.iter()
                                .enumerate()
                                .filter(|(_, &d)| d != 0)
                                .map(|(i, _)| (i as u16, words[i])),
                        );
                    }
                    Some(_) => {}
                    // re-entered or spawned inside the window: full resend
                    None => {
                        let words = snap.state_words(meta_id);
                        put_state_record(
                            &mut w,
                            meta_id,
                            words.iter().enumerate().map(|(i, &v)| (i as u16, v)),
                        );
                    }
                }
            }
            PacketMode::Full => unreachable!(),
        }
    }
    w.put_i32(SENTINEL);
    w.into_bytes()
}

fn window_meta_dirty(world: &WorldState, meta_id: u16, acked: Tick) -> bool {
    if world.current.is_meta_dirty(meta_id) {
        return true;
    }
    let now = world.current.tick;
    for x in (acked.0 + 1)..now.0 {
        match world.history(Tick(x + 1)) {
            Some(snap) if snap.is_meta_dirty(meta_id) => return true,
            Some(_) => {}
            None => return true,
        }
    }
    false
}

/// Decode a reassembled payload.
///
/// # Errors
/// `MalformedPacket` on truncation or out-of-range indices; the caller
/// drops the packet.
pub fn decode_snapshot(author_tick: Tick, payload: &[u8]) -> Result<SnapshotPayload> {
    let mut r = ByteReader::new(payload);
    let header = PayloadHeader {
        last_acked_client_tick: Tick(r.get_i32()?),
        last_client_target_tick: Tick(r.get_i32()?),
        inter_packet_delta: r.get_f64()?,
        is_multi: r.get_bool()?,
        is_full: r.get_bool()?,
    };

    let mut metas = Vec::new();
    loop {
        let meta_id = r.get_i32()?;
        if meta_id == SENTINEL {
            break;
        }
        let meta_id =
            u16::try_from(meta_id).map_err(|_| ReplicaError::MalformedPacket("meta id range"))?;
        metas.push(MetaRecord {
            meta_id,
            entity_ref: EntityRef(r.get_i32()?),
            prefab: PrefabId(
                u16::try_from(r.get_i32()?)
                    .map_err(|_| ReplicaError::MalformedPacket("prefab id range"))?,
            ),
            input_source: ConnectionId(r.get_i32()?),
            destroyed: r.get_bool()?,
        });
    }

    let mut states = Vec::new();
    loop {
        let meta_id = r.get_i32()?;
        if meta_id == SENTINEL {
            break;
        }
        let meta_id =
            u16::try_from(meta_id).map_err(|_| ReplicaError::MalformedPacket("meta id range"))?;
        let mut words = Vec::new();
        loop {
            let idx = r.get_i32()?;
            if idx == SENTINEL {
                break;
            }
            let idx =
                u16::try_from(idx).map_err(|_| ReplicaError::MalformedPacket("word idx range"))?;
            words.push((idx, r.get_u32()?));
        }
        states.push(StateRecord { meta_id, words });
    }

    Ok(SnapshotPayload {
        author_tick,
        header,
        metas,
        states,
    })
}

// ============================================================================
// Fragmentation
// ============================================================================

const FRAGMENT_HEADER_BYTES: usize = 1 + 4 + 4 + 4 + 2 + 1;

/// Split a payload into MTU-sized datagrams, each self-describing:
/// `[tag][authorTick][fragmentBytes][priorFragmentBytes][index][isLast]`.
#[must_use]
pub fn fragment_payload(author_tick: Tick, payload: &[u8], max_payload_bytes: usize) -> Vec<Vec<u8>> {
    let chunk = max_payload_bytes.saturating_sub(FRAGMENT_HEADER_BYTES).max(1);
    let total = payload.len().max(1);
    let count = total.div_ceil(chunk);
    let mut out = Vec::with_capacity(count);
    let mut offset = 0usize;
    for index in 0..count {
        let len = chunk.min(payload.len() - offset);
        let mut w = ByteWriter::new();
        w.put_u8(SNAPSHOT_TAG);
        w.put_i32(author_tick.0);
        w.put_i32(len as i32);
        w.put_i32(offset as i32);
        w.put_i16(index as i16);
        w.put_bool(index + 1 == count);
        let mut bytes = w.into_bytes();
        bytes.extend_from_slice(&payload[offset..offset + len]);
        out.push(bytes);
        offset += len;
    }
    out
}

/// Ceiling on a reassembled payload when no tighter limit is supplied.
/// Wire offsets are attacker-controlled; nothing may size a buffer off
/// them unchecked.
pub const MAX_REASSEMBLED_BYTES: usize = 1 << 20;

/// Reassembles fragments of the newest authored tick. Duplicate
/// fragments are dropped idempotently; an older tick's stragglers are
/// ignored outright.
#[derive(Debug)]
pub struct FragmentBuffer {
    tick: Tick,
    buf: Vec<u8>,
    received: Vec<bool>,
    last_index: Option<i16>,
    max_bytes: usize,
}

impl Default for FragmentBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_REASSEMBLED_BYTES)
    }

    /// Cap the reassembled payload at `max_bytes`; fragments claiming
    /// offsets beyond it are rejected before any allocation.
    #[must_use]
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            tick: Tick::INVALID,
            buf: Vec::new(),
            received: Vec::new(),
            last_index: None,
            max_bytes,
        }
    }

    /// Feed one datagram. Returns the complete `(author_tick, payload)`
    /// once every fragment of the newest tick has arrived.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<(Tick, Vec<u8>)>> {
        let mut r = ByteReader::new(datagram);
        let tag = r.get_u8()?;
        if tag != SNAPSHOT_TAG {
            return Err(ReplicaError::MalformedPacket("bad protocol tag"));
        }
        let author_tick = Tick(r.get_i32()?);
        let len = r.get_i32()?;
        let prior = r.get_i32()?;
        let index = r.get_i16()?;
        let is_last = r.get_bool()?;
        if len < 0 || prior < 0 || index < 0 || r.remaining() != len as usize {
            return Err(ReplicaError::MalformedPacket("bad fragment header"));
        }
        if prior as usize + len as usize > self.max_bytes {
            return Err(ReplicaError::MalformedPacket("payload exceeds size limit"));
        }

        if author_tick < self.tick {
            log::trace!("dropping straggler fragment for {author_tick}");
            return Ok(None);
        }
        if author_tick > self.tick {
            self.tick = author_tick;
            self.buf.clear();
            self.received.clear();
            self.last_index = None;
        }

        let idx = index as usize;
        if self.received.len() <= idx {
            self.received.resize(idx + 1, false);
        }
        if self.received[idx] {
            log::trace!("dropping duplicate fragment {index} for {author_tick}");
            return Ok(None);
        }
        self.received[idx] = true;
        if is_last {
            self.last_index = Some(index);
        }

        let start = prior as usize;
        let end = start + len as usize;
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(r.take(len as usize)?);

        if let Some(last) = self.last_index {
            let complete = self.received.len() == last as usize + 1
                && self.received.iter().all(|&r| r);
            if complete {
                let payload = std::mem::take(&mut self.buf);
                self.received.clear();
                self.last_index = None;
                return Ok(Some((self.tick, payload)));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// Client input packet
// ============================================================================

/// One input on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct WireInput {
    pub author_tick: Tick,
    pub target_tick: Tick,
    pub alpha: f32,
    pub remote_from_tick: Tick,
    pub blocks: Vec<WireInputBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct WireInputBlock {
    pub type_id: i16,
    pub payload: Vec<u8>,
}

/// Client → server datagram: an ack plus every unacknowledged input.
///
/// Unlike the snapshot payload, nothing here is spliced by dirty word,
/// so this direction rides the derived compact codec instead of a
/// hand-rolled layout. The field order mirrors the byte stream it
/// replaces: loss flag, newest applied author tick, then each input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct InputPacket {
    /// Set when the client detected snapshot loss since its last send.
    pub lost_packet: bool,
    /// Newest authoritative tick the client has applied.
    pub last_author_tick: Tick,
    pub inputs: Vec<WireInput>,
}

impl InputPacket {
    /// Serialize with bincode (compatible encoding).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Serialize with bitcode (compact encoding used on the wire).
    #[must_use]
    pub fn to_compact_bytes(&self) -> Vec<u8> {
        bitcode::encode(self)
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    #[must_use]
    pub fn from_compact_bytes(bytes: &[u8]) -> Option<Self> {
        bitcode::decode(bytes).ok()
    }
}

// ============================================================================
// Bandwidth statistics
// ============================================================================

/// Running totals for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct BandwidthStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub full_packets: u64,
    pub delta_packets: u64,
    pub multi_packets: u64,
}

impl BandwidthStats {
    pub fn record_send(&mut self, mode: PacketMode, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
        match mode {
            PacketMode::Full => self.full_packets += 1,
            PacketMode::Delta => self.delta_packets += 1,
            PacketMode::MultiTick => self.multi_packets += 1,
        }
    }

    /// Count an unclassified send (input packets, control traffic).
    pub fn record_send_raw(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_receive(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Average bytes per sent packet.
    #[must_use]
    pub fn bytes_per_packet(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.bytes_sent as f64 / self.packets_sent as f64
        }
    }

    /// Ratio of raw world bytes to bytes actually sent.
    #[must_use]
    pub fn compression_ratio(&self, raw_world_bytes: u64) -> f64 {
        if self.bytes_sent == 0 {
            0.0
        } else {
            raw_world_bytes as f64 / self.bytes_sent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use crate::snapshot::EntityMeta;

    fn entity_meta(entity_ref: i32) -> EntityMeta {
        EntityMeta {
            entity_ref: EntityRef(entity_ref),
            prefab: PrefabId(1),
            input_source: ConnectionId::NONE,
            destroyed: false,
        }
    }

    fn ring_world() -> WorldState {
        let cfg = ReplicaConfig {
            max_entities: 4,
            state_words: 4,
            history_depth: 8,
            ..ReplicaConfig::default()
        };
        let mut world = WorldState::new(&cfg);
        world.current.init(Tick(0));
        world.current.alloc_entity(0, entity_meta(1), 4).unwrap();
        world
    }

    #[test]
    fn test_byte_cursor_round_trip() {
        let mut w = ByteWriter::new();
        w.put_u8(7);
        w.put_bool(true);
        w.put_i16(-300);
        w.put_i32(-1);
        w.put_u32(0xDEAD_BEEF);
        w.put_f64(0.25);
        let bytes = w.into_bytes();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_i16().unwrap(), -300);
        assert_eq!(r.get_i32().unwrap(), SENTINEL);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_f64().unwrap(), 0.25);
        assert_eq!(r.remaining(), 0);
        assert!(r.get_u8().is_err());
    }

    #[test]
    fn test_fragment_round_trip_with_duplicates() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let frags = fragment_payload(Tick(9), &payload, 1200);
        assert!(frags.len() >= 3);

        let mut buf = FragmentBuffer::new();
        // out of order + duplicate
        assert!(buf.push(&frags[1]).unwrap().is_none());
        assert!(buf.push(&frags[1]).unwrap().is_none()); // dup dropped
        assert!(buf.push(&frags[frags.len() - 1]).unwrap().is_none());
        let mut done = None;
        for f in &frags[..frags.len() - 1] {
            if let Some(d) = buf.push(f).unwrap() {
                done = Some(d);
            }
        }
        let (tick, reassembled) = done.expect("payload should complete");
        assert_eq!(tick, Tick(9));
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_fragment_buffer_prefers_newer_tick() {
        let old = fragment_payload(Tick(5), &[1, 2, 3], 1200);
        let new = fragment_payload(Tick(6), &[9, 9], 1200);
        let mut buf = FragmentBuffer::new();
        let (tick, payload) = buf.push(&new[0]).unwrap().unwrap();
        assert_eq!(tick, Tick(6));
        assert_eq!(payload, vec![9, 9]);
        // straggler from the older tick is ignored
        assert!(buf.push(&old[0]).unwrap().is_none());
    }

    #[test]
    fn test_forged_fragment_offset_is_rejected() {
        let mut w = ByteWriter::new();
        w.put_u8(SNAPSHOT_TAG);
        w.put_i32(3); // author tick
        w.put_i32(4); // fragment bytes
        w.put_i32(1 << 30); // claimed prior bytes
        w.put_i16(1);
        w.put_bool(false);
        let mut bytes = w.into_bytes();
        bytes.extend_from_slice(&[0, 0, 0, 0]);

        let mut buf = FragmentBuffer::new();
        let err = buf.push(&bytes).unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedPacket(_)));

        // legitimate traffic still reassembles afterwards
        let frags = fragment_payload(Tick(4), &[1, 2, 3], 1200);
        assert!(buf.push(&frags[0]).unwrap().is_some());
    }

    #[test]
    fn test_choose_mode_per_peer_lag() {
        let mut world = ring_world();
        for t in 1..=6 {
            world.begin_tick(Tick(t));
        }
        assert_eq!(choose_mode(&world, Tick::INVALID, false), PacketMode::Full);
        assert_eq!(choose_mode(&world, Tick(6), true), PacketMode::Full);
        assert_eq!(choose_mode(&world, Tick(6), false), PacketMode::Delta);
        assert_eq!(choose_mode(&world, Tick(5), false), PacketMode::Delta);
        assert_eq!(choose_mode(&world, Tick(3), false), PacketMode::MultiTick);
    }

    #[test]
    fn test_choose_mode_falls_back_beyond_ring() {
        let mut world = ring_world();
        for t in 1..=12 {
            world.begin_tick(Tick(t));
        }
        // window slots for an ack this old were overwritten
        assert_eq!(choose_mode(&world, Tick(2), false), PacketMode::Full);
        assert_eq!(choose_mode(&world, Tick(9), false), PacketMode::MultiTick);
    }

    #[test]
    fn test_multi_tick_dirty_ors_the_window() {
        let mut world = ring_world();
        world.begin_tick(Tick(1));
        world.current.write_word(0, 1, 5);
        world.begin_tick(Tick(2));
        world.current.write_word(0, 2, 6);
        world.begin_tick(Tick(3));
        world.current.write_word(0, 3, 7);

        let mask = multi_tick_dirty(&world, 0, Tick(0)).unwrap();
        let changed: Vec<u32> = mask.iter().map(|&d| u32::from(d != 0)).collect();
        assert_eq!(changed, vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_multi_tick_entry_forces_full_record() {
        let mut world = ring_world();
        world.begin_tick(Tick(1));
        world.begin_tick(Tick(2));
        // second entity appears mid-window
        world.current.alloc_entity(1, entity_meta(2), 4).unwrap();
        world.begin_tick(Tick(3));

        assert!(multi_tick_dirty(&world, 1, Tick(0)).is_none());
        // an entity alive across the whole window keeps its mask
        assert!(multi_tick_dirty(&world, 0, Tick(0)).is_some());
    }

    #[test]
    fn test_input_packet_encodings() {
        let packet = InputPacket {
            lost_packet: false,
            last_author_tick: Tick(41),
            inputs: vec![WireInput {
                author_tick: Tick(42),
                target_tick: Tick(43),
                alpha: 0.5,
                remote_from_tick: Tick(40),
                blocks: vec![WireInputBlock {
                    type_id: 1,
                    payload: vec![1, 2, 3],
                }],
            }],
        };
        let compact = packet.to_compact_bytes();
        let wide = packet.to_bytes();
        assert_eq!(InputPacket::from_compact_bytes(&compact).unwrap(), packet);
        assert_eq!(InputPacket::from_bytes(&wide).unwrap(), packet);
        assert!(compact.len() <= wide.len());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        assert!(decode_snapshot(Tick(1), &[0, 1, 2]).is_err());
    }

    #[test]
    fn test_bandwidth_stats() {
        let mut stats = BandwidthStats::default();
        stats.record_send(PacketMode::Full, 100);
        stats.record_send(PacketMode::Delta, 20);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.full_packets, 1);
        assert_eq!(stats.delta_packets, 1);
        assert!((stats.bytes_per_packet() - 60.0).abs() < f64::EPSILON);
        assert!(stats.compression_ratio(1200) > 9.0);
    }
}
