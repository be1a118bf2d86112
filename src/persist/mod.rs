//! Persistence store (§4.C): fixed-slot file format, free/saved linked lists, commit
//! discipline, and crash recovery.

pub mod backend;
pub mod file;

pub use backend::{FileBackend, MemoryBackend, StdFileBackend};
pub use file::{PersistFile, RecoveredMessage, SlotOffset, TRANSMITTED};
