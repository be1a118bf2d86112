//! Type-erases [`PersistFile`](crate::persist::PersistFile) so a [`super::Substream`]
//! doesn't need to carry the backend generic through the whole engine.

use crate::error::PersistenceError;
use crate::persist::{FileBackend, PersistFile, RecoveredMessage, SlotOffset};

pub trait PersistentQueue: Send {
    fn save(&mut self, payload: &[u8], time_queued: u64, timeout: u64) -> Result<SlotOffset, PersistenceError>;
    fn transmit_update(&mut self, slot: SlotOffset) -> Result<u32, PersistenceError>;
    fn free(&mut self, slot: SlotOffset) -> Result<(), PersistenceError>;
    fn set_last_in_seq(&mut self, seq: u32) -> Result<(), PersistenceError>;
    fn last_out_seq(&self) -> u32;
    fn last_in_seq(&self) -> u32;
    fn recover(&mut self) -> Result<Vec<RecoveredMessage>, PersistenceError>;
}

impl<B: FileBackend> PersistentQueue for PersistFile<B> {
    fn save(&mut self, payload: &[u8], time_queued: u64, timeout: u64) -> Result<SlotOffset, PersistenceError> {
        PersistFile::save(self, payload, time_queued, timeout)
    }

    fn transmit_update(&mut self, slot: SlotOffset) -> Result<u32, PersistenceError> {
        PersistFile::transmit_update(self, slot)
    }

    fn free(&mut self, slot: SlotOffset) -> Result<(), PersistenceError> {
        PersistFile::free(self, slot)
    }

    fn set_last_in_seq(&mut self, seq: u32) -> Result<(), PersistenceError> {
        PersistFile::set_last_in_seq(self, seq)
    }

    fn last_out_seq(&self) -> u32 {
        PersistFile::last_out_seq(self)
    }

    fn last_in_seq(&self) -> u32 {
        PersistFile::last_in_seq(self)
    }

    fn recover(&mut self) -> Result<Vec<RecoveredMessage>, PersistenceError> {
        PersistFile::recover(self)
    }
}
