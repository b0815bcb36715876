//! Reassembly of object data split over several LOAD frames.
//!
//! A DUMP reply may arrive as one LOAD or as a run of fragments. Each
//! fragment carries the running checksum of all encoded data so far, so the
//! last fragment's checksum covers the whole transfer. How fragments are
//! ordered is left to a [`ReassemblyStrategy`].

use std::fmt;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::error::{K2Error, Result};
use crate::message::{Load, ObjectKind};
use crate::protocol::wire_format::{running_checksum, WHOLE_OBJECT};
use crate::protocol::EncodingFormat;

/// Outcome of feeding one fragment to a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More fragments are expected.
    Incomplete,
    /// The transfer holds all its data.
    Complete,
}

/// A DUMP reply in the middle of being received.
#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    kind: ObjectKind,
    slot: u16,
    base_offset: u32,
    expected_len: Option<usize>,
    form: Option<EncodingFormat>,
    data: BytesMut,
    checksum: u8,
    fragments: usize,
}

impl ChunkedTransfer {
    /// Start a transfer. `expected_len` of `None` means the size is unknown.
    pub fn new(kind: ObjectKind, slot: u16, base_offset: u32, expected_len: Option<usize>) -> Self {
        Self {
            kind,
            slot,
            base_offset,
            expected_len,
            form: None,
            data: BytesMut::with_capacity(expected_len.unwrap_or(0)),
            checksum: 0,
            fragments: 0,
        }
    }

    /// Transfer for a DUMP request; a whole-object DUMP has no declared length.
    pub fn for_dump(kind: ObjectKind, slot: u16, offset: u32, size: u32) -> Self {
        let expected_len = if size == WHOLE_OBJECT {
            None
        } else {
            Some(size as usize)
        };
        Self::new(kind, slot, offset, expected_len)
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn base_offset(&self) -> u32 {
        self.base_offset
    }

    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.data.len()
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Offset the next in-order fragment must start at.
    pub fn next_offset(&self) -> usize {
        self.base_offset as usize + self.data.len()
    }

    /// Fold a fragment's checksum into the transfer and append its data.
    ///
    /// Fails when the fragment's running checksum disagrees with the data
    /// seen so far, or when it would overrun the declared length.
    pub fn append(&mut self, fragment: &Load) -> Result<()> {
        let expected = running_checksum(self.checksum, &[fragment.encoded_sum()]);
        if fragment.checksum != expected {
            return Err(K2Error::TransferFailed(format!(
                "{} {} fragment {} checksum 0x{:02X}, expected 0x{:02X}",
                self.kind, self.slot, self.fragments, fragment.checksum, expected
            )));
        }

        if let Some(limit) = self.expected_len {
            if self.data.len() + fragment.data.len() > limit {
                return Err(K2Error::TransferFailed(format!(
                    "{} {} overran the declared {} bytes",
                    self.kind, self.slot, limit
                )));
            }
        }

        self.checksum = expected;
        self.form.get_or_insert(fragment.form);
        self.data.extend_from_slice(&fragment.data);
        self.fragments += 1;
        Ok(())
    }

    /// True once the declared length has been received.
    pub fn is_filled(&self) -> bool {
        self.expected_len == Some(self.data.len())
    }

    /// Turn the completed transfer into one LOAD carrying all the data.
    pub fn finish(self) -> Load {
        let form = self.form.unwrap_or(EncodingFormat::BitStream);
        Load::new(
            self.kind,
            self.slot,
            self.base_offset,
            form,
            self.data.freeze(),
        )
    }
}

/// How fragments of one transfer are put together.
pub trait ReassemblyStrategy: Send + Sync + fmt::Debug {
    /// Feed one fragment. An error aborts the transfer.
    fn accept(&self, transfer: &mut ChunkedTransfer, fragment: &Load) -> Result<Progress>;
}

/// Fragments must arrive at consecutive offsets.
///
/// Completes at the declared length, or on the first fragment when no length
/// was declared.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialOffsets;

impl ReassemblyStrategy for SequentialOffsets {
    fn accept(&self, transfer: &mut ChunkedTransfer, fragment: &Load) -> Result<Progress> {
        let offset = fragment.offset as usize;
        if offset != transfer.next_offset() {
            return Err(K2Error::TransferFailed(format!(
                "{} {} fragment at offset {}, expected {}",
                transfer.kind(),
                transfer.slot(),
                offset,
                transfer.next_offset()
            )));
        }

        transfer.append(fragment)?;

        if transfer.expected_len().is_none() || transfer.is_filled() {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Incomplete)
        }
    }
}

/// Fragments are concatenated as they arrive, offsets ignored.
///
/// Completes at the declared length or on an empty end-marker fragment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrivalOrder;

impl ReassemblyStrategy for ArrivalOrder {
    fn accept(&self, transfer: &mut ChunkedTransfer, fragment: &Load) -> Result<Progress> {
        if fragment.data.is_empty() {
            transfer.append(fragment)?;
            return match transfer.expected_len() {
                Some(limit) if transfer.received() < limit => Err(K2Error::TransferFailed(format!(
                    "{} {} ended after {} of {} bytes",
                    transfer.kind(),
                    transfer.slot(),
                    transfer.received(),
                    limit
                ))),
                _ => Ok(Progress::Complete),
            };
        }

        transfer.append(fragment)?;

        if transfer.is_filled() {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Incomplete)
        }
    }
}

/// Serializable choice of reassembly strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassemblyMode {
    #[default]
    SequentialOffsets,
    ArrivalOrder,
}

impl ReassemblyMode {
    pub fn strategy(self) -> Box<dyn ReassemblyStrategy> {
        match self {
            ReassemblyMode::SequentialOffsets => Box::new(SequentialOffsets),
            ReassemblyMode::ArrivalOrder => Box::new(ArrivalOrder),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fragment(offset: u32, data: &'static [u8], previous: Option<u8>) -> Load {
        let load = Load::new(
            ObjectKind::Program,
            125,
            offset,
            EncodingFormat::BitStream,
            Bytes::from_static(data),
        );
        match previous {
            Some(previous) => load.continuing(previous),
            None => load,
        }
    }

    #[test]
    fn test_sequential_reassembles_in_order() {
        let mut transfer = ChunkedTransfer::new(ObjectKind::Program, 125, 0, Some(6));
        let first = fragment(0, b"abc", None);
        let second = fragment(3, b"def", Some(first.checksum));

        assert_eq!(SequentialOffsets.accept(&mut transfer, &first).unwrap(), Progress::Incomplete);
        assert_eq!(SequentialOffsets.accept(&mut transfer, &second).unwrap(), Progress::Complete);

        let load = transfer.finish();
        assert_eq!(&load.data[..], b"abcdef");
        assert_eq!(load.offset, 0);
    }

    #[test]
    fn test_sequential_rejects_gap() {
        let mut transfer = ChunkedTransfer::new(ObjectKind::Program, 125, 0, Some(6));
        let first = fragment(0, b"abc", None);
        let skipped = fragment(4, b"ef", Some(first.checksum));

        SequentialOffsets.accept(&mut transfer, &first).unwrap();
        assert!(matches!(
            SequentialOffsets.accept(&mut transfer, &skipped),
            Err(K2Error::TransferFailed(_))
        ));
    }

    #[test]
    fn test_sequential_without_length_completes_on_first() {
        let mut transfer = ChunkedTransfer::for_dump(ObjectKind::Program, 125, 0, WHOLE_OBJECT);
        assert_eq!(transfer.expected_len(), None);
        let only = fragment(0, b"whole", None);
        assert_eq!(SequentialOffsets.accept(&mut transfer, &only).unwrap(), Progress::Complete);
    }

    #[test]
    fn test_running_checksum_must_continue() {
        let mut transfer = ChunkedTransfer::new(ObjectKind::Program, 125, 0, Some(6));
        let first = fragment(0, b"abc", None);
        // Second fragment checksummed on its own instead of continuing.
        let second = fragment(3, b"def", None);

        SequentialOffsets.accept(&mut transfer, &first).unwrap();
        assert!(matches!(
            SequentialOffsets.accept(&mut transfer, &second),
            Err(K2Error::TransferFailed(_))
        ));
    }

    #[test]
    fn test_overrun_fails() {
        let mut transfer = ChunkedTransfer::new(ObjectKind::Program, 125, 0, Some(2));
        let too_long = fragment(0, b"abc", None);
        assert!(matches!(
            ArrivalOrder.accept(&mut transfer, &too_long),
            Err(K2Error::TransferFailed(_))
        ));
    }

    #[test]
    fn test_arrival_order_end_marker() {
        let mut transfer = ChunkedTransfer::new(ObjectKind::Program, 125, 0, None);
        let first = fragment(9, b"ab", None);
        let second = fragment(0, b"cd", Some(first.checksum));
        let end = fragment(0, b"", Some(second.checksum));

        assert_eq!(ArrivalOrder.accept(&mut transfer, &first).unwrap(), Progress::Incomplete);
        assert_eq!(ArrivalOrder.accept(&mut transfer, &second).unwrap(), Progress::Incomplete);
        assert_eq!(ArrivalOrder.accept(&mut transfer, &end).unwrap(), Progress::Complete);
        assert_eq!(&transfer.finish().data[..], b"abcd");
    }

    #[test]
    fn test_arrival_order_short_end_fails() {
        let mut transfer = ChunkedTransfer::new(ObjectKind::Program, 125, 0, Some(4));
        let first = fragment(0, b"ab", None);
        let end = fragment(0, b"", Some(first.checksum));

        ArrivalOrder.accept(&mut transfer, &first).unwrap();
        assert!(ArrivalOrder.accept(&mut transfer, &end).is_err());
    }

    #[test]
    fn test_mode_serde() {
        let mode: ReassemblyMode = serde_json::from_str("\"arrival_order\"").unwrap();
        assert_eq!(mode, ReassemblyMode::ArrivalOrder);
        assert_eq!(ReassemblyMode::default(), ReassemblyMode::SequentialOffsets);
    }
}
