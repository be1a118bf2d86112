//! Message fragmentation and reassembly (§4.A fragmentation header, §4.E).
//!
//! The underlying reliability layer delivers bytes strictly in order, so at most
//! one reassembly is ever in flight per direction and fragments always arrive in
//! ascending `fragment_number` order — this is a plain concatenator, not a
//! reorder buffer.

use crate::error::{CodecError, Result};
use crate::wire::header::FragmentHeader;

pub struct Fragmenter {
    max_fragment_size: usize,
}

impl Fragmenter {
    pub fn new(max_fragment_size: usize) -> Self {
        Fragmenter { max_fragment_size }
    }

    /// Splits `payload` into wire-ready `(header, chunk)` pairs. A payload that
    /// fits in one fragment yields a single unfragmented chunk (`header = None`).
    pub fn split(
        &self,
        message_id: u16,
        container_type: u8,
        payload: &[u8],
    ) -> Vec<(Option<FragmentHeader>, Vec<u8>)> {
        if payload.len() <= self.max_fragment_size || payload.is_empty() {
            return vec![(None, payload.to_vec())];
        }
        payload
            .chunks(self.max_fragment_size)
            .enumerate()
            .map(|(i, chunk)| {
                (
                    Some(FragmentHeader {
                        total_length: payload.len() as u32,
                        // 1-based: the first fragment carries `fragment_number = 1`.
                        fragment_number: (i + 1) as u32,
                        message_id,
                        container_type,
                    }),
                    chunk.to_vec(),
                )
            })
            .collect()
    }
}

#[derive(Debug)]
struct InProgress {
    message_id: u16,
    container_type: u8,
    total_length: u32,
    next_fragment: u32,
    buf: Vec<u8>,
}

/// Reassembles the single in-progress fragmented inbound message for one
/// direction of one tunnel.
#[derive(Debug, Default)]
pub struct Reassembler {
    in_progress: Option<InProgress>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment. Returns the completed `(container_type, payload)` once
    /// the fragment carrying the last chunk arrives.
    pub fn accept(&mut self, fragment: &FragmentHeader, chunk: &[u8]) -> Result<Option<(u8, Vec<u8>)>> {
        match self.in_progress.as_mut() {
            Some(p) if p.message_id == fragment.message_id => {
                if fragment.fragment_number != p.next_fragment {
                    return Err(CodecError::decode("fragment_number", "fragment arrived out of order").into());
                }
                p.buf.extend_from_slice(chunk);
                p.next_fragment += 1;
            }
            _ => {
                if fragment.fragment_number != 1 {
                    return Err(CodecError::decode("fragment_number", "first fragment missing").into());
                }
                self.in_progress = Some(InProgress {
                    message_id: fragment.message_id,
                    container_type: fragment.container_type,
                    total_length: fragment.total_length,
                    next_fragment: 2,
                    buf: chunk.to_vec(),
                });
            }
        }

        let done = self.in_progress.as_ref().map(|p| p.buf.len() as u32 >= p.total_length).unwrap_or(false);
        if done {
            let p = self.in_progress.take().unwrap();
            Ok(Some((p.container_type, p.buf)))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_not_fragmented() {
        let f = Fragmenter::new(1024);
        let parts = f.split(1, 130, b"short");
        assert_eq!(parts.len(), 1);
        assert!(parts[0].0.is_none());
    }

    #[test]
    fn large_payload_splits_and_reassembles() {
        let f = Fragmenter::new(4);
        let payload: Vec<u8> = (0..17u8).collect();
        let parts = f.split(7, 130, &payload);
        assert!(parts.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for (header, chunk) in &parts {
            let header = header.as_ref().expect("fragmented");
            result = reassembler.accept(header, chunk).unwrap();
        }
        let (container_type, buf) = result.unwrap();
        assert_eq!(container_type, 130);
        assert_eq!(buf, payload);
    }

    #[test]
    fn out_of_order_fragment_is_rejected() {
        let f = Fragmenter::new(4);
        let payload: Vec<u8> = (0..9u8).collect();
        let parts = f.split(1, 130, &payload);
        let mut reassembler = Reassembler::new();
        let (h2, c2) = &parts[1];
        assert!(reassembler.accept(h2.as_ref().unwrap(), c2).is_err());
    }
}
