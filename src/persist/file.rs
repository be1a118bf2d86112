//! Fixed-slot persistence file (§4.C): header, free/saved linked lists, commit
//! discipline, and crash recovery.

use super::backend::FileBackend;
use crate::error::PersistenceError;
use crate::wire::cursor::{write_u32, write_u64};

pub const VERSION_CURRENT: u32 = 3;
pub const VERSION_LEGACY: u32 = 1;

pub const HEADER_SIZE: u64 = 36;
pub const SLOT_HEADER_SIZE: u64 = 28;

pub const TRANSMITTED: u32 = 0x1;

/// Offset of a slot within the file; `0` is reserved as the "no slot" terminator
/// because the header occupies offset 0.
pub type SlotOffset = u32;

#[derive(Debug, Clone, Copy)]
struct Header {
    version: u32,
    max_msg_count: u32,
    max_msg_length: u32,
    current_msg_count: u32,
    last_out_seq: u32,
    last_in_seq: u32,
    free_list_head: u32,
    saved_list_head: u32,
    flags: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = Vec::with_capacity(HEADER_SIZE as usize);
        write_u32(&mut out, self.version);
        write_u32(&mut out, self.max_msg_count);
        write_u32(&mut out, self.max_msg_length);
        write_u32(&mut out, self.current_msg_count);
        write_u32(&mut out, self.last_out_seq);
        write_u32(&mut out, self.last_in_seq);
        write_u32(&mut out, self.free_list_head);
        write_u32(&mut out, self.saved_list_head);
        write_u32(&mut out, self.flags);
        let mut arr = [0u8; HEADER_SIZE as usize];
        arr.copy_from_slice(&out);
        arr
    }

    fn decode(buf: &[u8]) -> Self {
        let u = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Header {
            version: u(0),
            max_msg_count: u(4),
            max_msg_length: u(8),
            current_msg_count: u(12),
            last_out_seq: u(16),
            last_in_seq: u(20),
            free_list_head: u(24),
            saved_list_head: u(28),
            flags: u(32),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    next: u32,
    flags: u32,
    length: u32,
    time_queued: u64,
    timeout: u64,
    payload: Vec<u8>,
}

impl Slot {
    fn empty(max_len: u32) -> Self {
        Slot { next: 0, flags: 0, length: 0, time_queued: 0, timeout: 0, payload: vec![0; max_len as usize] }
    }

    fn encode(&self, max_len: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(SLOT_HEADER_SIZE as usize + max_len as usize);
        write_u32(&mut out, self.next);
        write_u32(&mut out, self.flags);
        write_u32(&mut out, self.length);
        write_u64(&mut out, self.time_queued);
        write_u64(&mut out, self.timeout);
        out.extend_from_slice(&self.payload[..self.length.min(max_len) as usize]);
        out.resize(SLOT_HEADER_SIZE as usize + max_len as usize, 0);
        out
    }

    fn decode(buf: &[u8], max_len: u32) -> Self {
        let next = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let flags = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let time_queued = u64::from_be_bytes(buf[12..20].try_into().unwrap());
        let timeout = u64::from_be_bytes(buf[20..28].try_into().unwrap());
        let payload_end = (SLOT_HEADER_SIZE as usize + max_len as usize).min(buf.len());
        let payload = buf[SLOT_HEADER_SIZE as usize..payload_end].to_vec();
        Slot { next, flags, length, time_queued, timeout, payload }
    }
}

/// A message recovered from the saved list on reopen.
#[derive(Debug, Clone)]
pub struct RecoveredMessage {
    pub slot: SlotOffset,
    pub transmitted: bool,
    pub seq: Option<u32>,
    pub payload: Vec<u8>,
    pub time_queued: u64,
    pub timeout: u64,
}

pub struct PersistFile<B: FileBackend> {
    backend: B,
    header: Header,
    /// In-memory cache of the saved list in order, rebuilt by walking the on-disk
    /// list at open time and kept in sync on every save/free.
    saved_order: Vec<SlotOffset>,
}

impl<B: FileBackend> PersistFile<B> {
    fn slot_offset(header: &Header, index: u32) -> SlotOffset {
        (HEADER_SIZE + index as u64 * (SLOT_HEADER_SIZE + header.max_msg_length as u64)) as u32
    }

    fn slot_size(&self) -> u64 {
        SLOT_HEADER_SIZE + self.header.max_msg_length as u64
    }

    fn read_slot(&mut self, offset: SlotOffset) -> Result<Slot, PersistenceError> {
        let size = self.slot_size();
        let mut buf = vec![0u8; size as usize];
        self.backend.read_at(offset as u64, &mut buf)?;
        Ok(Slot::decode(&buf, self.header.max_msg_length))
    }

    fn write_slot(&mut self, offset: SlotOffset, slot: &Slot) -> Result<(), PersistenceError> {
        let buf = slot.encode(self.header.max_msg_length);
        self.backend.write_at(offset as u64, &buf)
    }

    fn write_header(&mut self) -> Result<(), PersistenceError> {
        let buf = self.header.encode();
        self.backend.write_at(0, &buf)
    }

    /// Opens an existing persistence file, or creates a new one populated with a
    /// fully-linked free list.
    pub fn open(mut backend: B, max_msg_count: u32, max_msg_length: u32) -> Result<Self, PersistenceError> {
        backend.try_lock_exclusive()?;
        let len = backend.len()?;

        let header = if len == 0 {
            let header = Header {
                version: VERSION_CURRENT,
                max_msg_count,
                max_msg_length,
                current_msg_count: 0,
                last_out_seq: 0,
                last_in_seq: 0,
                free_list_head: if max_msg_count > 0 {
                    Self::slot_offset(
                        &Header {
                            version: VERSION_CURRENT,
                            max_msg_count,
                            max_msg_length,
                            current_msg_count: 0,
                            last_out_seq: 0,
                            last_in_seq: 0,
                            free_list_head: 0,
                            saved_list_head: 0,
                            flags: 0,
                        },
                        0,
                    )
                } else {
                    0
                },
                saved_list_head: 0,
                flags: 0,
            };
            let total_len = HEADER_SIZE + max_msg_count as u64 * (SLOT_HEADER_SIZE + max_msg_length as u64);
            backend.set_len(total_len)?;
            backend.write_at(0, &header.encode())?;

            let mut pf = PersistFile { backend, header, saved_order: Vec::new() };
            for i in 0..max_msg_count {
                let offset = Self::slot_offset(&pf.header, i);
                let next = if i + 1 < max_msg_count { Self::slot_offset(&pf.header, i + 1) } else { 0 };
                let slot = Slot { next, ..Slot::empty(max_msg_length) };
                pf.write_slot(offset, &slot)?;
            }
            pf.backend.sync_data()?;
            return Ok(pf);
        } else {
            let mut hbuf = [0u8; HEADER_SIZE as usize];
            backend.read_at(0, &mut hbuf)?;
            Header::decode(&hbuf)
        };

        if header.version == VERSION_LEGACY {
            return Err(PersistenceError::UnsupportedVersion(VERSION_LEGACY));
        }
        if header.version != VERSION_CURRENT {
            return Err(PersistenceError::UnsupportedVersion(header.version));
        }

        let mut pf = PersistFile { backend, header, saved_order: Vec::new() };
        pf.rebuild_saved_order()?;
        pf.validate_link_counts()?;
        Ok(pf)
    }

    fn rebuild_saved_order(&mut self) -> Result<(), PersistenceError> {
        self.saved_order.clear();
        let mut cur = self.header.saved_list_head;
        while cur != 0 {
            self.saved_order.push(cur);
            let slot = self.read_slot(cur)?;
            cur = slot.next;
        }
        Ok(())
    }

    fn count_free(&mut self) -> Result<u32, PersistenceError> {
        let mut count = 0u32;
        let mut cur = self.header.free_list_head;
        while cur != 0 {
            count += 1;
            let slot = self.read_slot(cur)?;
            cur = slot.next;
        }
        Ok(count)
    }

    fn validate_link_counts(&mut self) -> Result<(), PersistenceError> {
        let free = self.count_free()?;
        let saved = self.saved_order.len() as u32;
        if free + saved != self.header.max_msg_count {
            tracing::error!(free, saved, max = self.header.max_msg_count, "recovery link mismatch");
            return Err(PersistenceError::RecoveryInconsistency {
                free,
                saved,
                max: self.header.max_msg_count,
            });
        }
        Ok(())
    }

    /// Saves `payload` to the head of the free list and moves it to the tail of the
    /// saved list. Returns the slot's offset as a durable back-reference.
    pub fn save(
        &mut self,
        payload: &[u8],
        time_queued: u64,
        timeout: u64,
    ) -> Result<SlotOffset, PersistenceError> {
        if payload.len() as u32 > self.header.max_msg_length {
            return Err(PersistenceError::MessageTooLarge(
                payload.len() as u32,
                self.header.max_msg_length,
            ));
        }
        let offset = self.header.free_list_head;
        if offset == 0 {
            return Err(PersistenceError::PersistenceFull(self.header.max_msg_count));
        }
        let free_next = self.read_slot(offset)?.next;

        let mut slot = Slot::empty(self.header.max_msg_length);
        slot.next = 0;
        slot.flags = 0;
        slot.length = payload.len() as u32;
        slot.time_queued = time_queued;
        slot.timeout = timeout;
        slot.payload[..payload.len()].copy_from_slice(payload);
        self.write_slot(offset, &slot)?;
        self.backend.sync_data()?;

        if let Some(&tail) = self.saved_order.last() {
            let mut tail_slot = self.read_slot(tail)?;
            tail_slot.next = offset;
            self.write_slot(tail, &tail_slot)?;
        } else {
            self.header.saved_list_head = offset;
        }
        self.saved_order.push(offset);

        self.header.free_list_head = free_next;
        self.header.current_msg_count += 1;
        self.write_header()?;
        self.backend.sync_data()?;

        tracing::debug!(slot = offset, free = free_next, saved = self.saved_order.len(), "persistence save");
        Ok(offset)
    }

    /// Marks the slot transmitted and assigns it the next sequence number.
    pub fn transmit_update(&mut self, slot: SlotOffset) -> Result<u32, PersistenceError> {
        let mut s = self.read_slot(slot)?;
        let seq = self.header.last_out_seq + 1;
        s.flags |= TRANSMITTED;
        // The slot itself only needs the TRANSMITTED bit; the assigned sequence
        // number is re-derived from saved-list position on recovery (see `recover`),
        // per the formula in §4.C.
        self.write_slot(slot, &s)?;
        self.header.last_out_seq = seq;
        self.write_header()?;
        self.backend.sync_data()?;
        tracing::debug!(slot, seq, "persistence transmit_update");
        Ok(seq)
    }

    /// Frees a slot (message acked by peer): moves it from saved list to free list.
    pub fn free(&mut self, slot: SlotOffset) -> Result<(), PersistenceError> {
        let pos = self
            .saved_order
            .iter()
            .position(|&s| s == slot)
            .ok_or(PersistenceError::InvalidSlot(slot))?;
        self.saved_order.remove(pos);

        if pos == 0 {
            self.header.saved_list_head = self.saved_order.first().copied().unwrap_or(0);
        } else {
            let prev = self.saved_order[pos - 1];
            let mut prev_slot = self.read_slot(prev)?;
            prev_slot.next = self.saved_order.get(pos).copied().unwrap_or(0);
            self.write_slot(prev, &prev_slot)?;
        }

        let mut freed = Slot::empty(self.header.max_msg_length);
        freed.next = self.header.free_list_head;
        self.write_slot(slot, &freed)?;
        self.backend.sync_data()?;

        self.header.free_list_head = slot;
        self.header.current_msg_count = self.header.current_msg_count.saturating_sub(1);
        self.write_header()?;
        self.backend.sync_data()?;

        tracing::debug!(slot, saved = self.saved_order.len(), "persistence free");
        Ok(())
    }

    pub fn set_last_in_seq(&mut self, seq: u32) -> Result<(), PersistenceError> {
        self.header.last_in_seq = seq;
        self.write_header()?;
        self.backend.sync_data()
    }

    pub fn last_out_seq(&self) -> u32 {
        self.header.last_out_seq
    }

    pub fn last_in_seq(&self) -> u32 {
        self.header.last_in_seq
    }

    pub fn max_msg_count(&self) -> u32 {
        self.header.max_msg_count
    }

    pub fn max_msg_length(&self) -> u32 {
        self.header.max_msg_length
    }

    pub fn current_msg_count(&self) -> u32 {
        self.header.current_msg_count
    }

    /// Walks the saved list and derives sequence numbers for transmitted messages
    /// using the formula in §4.C: `last_out_seq - transmitted_count + position`.
    pub fn recover(&mut self) -> Result<Vec<RecoveredMessage>, PersistenceError> {
        let mut raw = Vec::with_capacity(self.saved_order.len());
        for &offset in &self.saved_order.clone() {
            raw.push((offset, self.read_slot(offset)?));
        }

        let transmitted_count = raw.iter().filter(|(_, s)| s.flags & TRANSMITTED != 0).count() as u32;
        let mut out = Vec::with_capacity(raw.len());
        let mut transmitted_position = 0u32;
        for (offset, slot) in raw {
            let transmitted = slot.flags & TRANSMITTED != 0;
            let seq = if transmitted {
                let seq = self.header.last_out_seq - transmitted_count + transmitted_position;
                transmitted_position += 1;
                Some(seq)
            } else {
                None
            };
            out.push(RecoveredMessage {
                slot: offset,
                transmitted,
                seq,
                payload: slot.payload[..slot.length as usize].to_vec(),
                time_queued: slot.time_queued,
                timeout: slot.timeout,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::backend::MemoryBackend;

    fn open(max_count: u32, max_len: u32) -> PersistFile<MemoryBackend> {
        PersistFile::open(MemoryBackend::new(), max_count, max_len).unwrap()
    }

    #[test]
    fn fresh_file_has_full_free_list() {
        let mut pf = open(4, 64);
        assert_eq!(pf.count_free().unwrap(), 4);
        assert_eq!(pf.saved_order.len(), 0);
    }

    #[test]
    fn save_moves_slot_to_saved_list() {
        let mut pf = open(4, 64);
        let slot = pf.save(b"hello", 100, 0).unwrap();
        assert_eq!(pf.count_free().unwrap(), 3);
        assert_eq!(pf.saved_order, vec![slot]);
    }

    #[test]
    fn free_saved_invariant_holds_across_operations() {
        let mut pf = open(4, 64);
        let s1 = pf.save(b"a", 1, 0).unwrap();
        let s2 = pf.save(b"b", 2, 0).unwrap();
        let s3 = pf.save(b"c", 3, 0).unwrap();
        assert_eq!(pf.count_free().unwrap() + pf.saved_order.len() as u32, 4);
        pf.transmit_update(s1).unwrap();
        pf.transmit_update(s2).unwrap();
        pf.transmit_update(s3).unwrap();
        pf.free(s2).unwrap();
        assert_eq!(pf.count_free().unwrap() + pf.saved_order.len() as u32, 4);
        assert_eq!(pf.saved_order, vec![s1, s3]);
    }

    #[test]
    fn persistence_full_when_free_list_exhausted() {
        let mut pf = open(1, 64);
        pf.save(b"a", 1, 0).unwrap();
        let err = pf.save(b"b", 2, 0).unwrap_err();
        assert!(matches!(err, PersistenceError::PersistenceFull(_)));
    }

    #[test]
    fn oversize_message_is_rejected() {
        let mut pf = open(4, 8);
        let err = pf.save(b"this is too long", 1, 0).unwrap_err();
        assert!(matches!(err, PersistenceError::MessageTooLarge(_, _)));
    }

    #[test]
    fn recovery_derives_sequence_numbers_for_transmitted_prefix() {
        let backend = MemoryBackend::new();
        let mut pf = PersistFile::open(backend, 4, 64).unwrap();
        let s1 = pf.save(b"a", 1, 0).unwrap();
        let s2 = pf.save(b"b", 2, 0).unwrap();
        let s3 = pf.save(b"c", 3, 0).unwrap();
        pf.transmit_update(s1).unwrap();
        pf.transmit_update(s2).unwrap();
        pf.transmit_update(s3).unwrap();
        // Simulate ack for seq=1 (s1) only, then "crash": drop pf, keep backend bytes.
        pf.free(s1).unwrap();

        let recovered = pf.recover().unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].seq, Some(2));
        assert_eq!(recovered[1].seq, Some(3));
    }
}
