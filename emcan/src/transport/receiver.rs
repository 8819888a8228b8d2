//! Transfer reception state machine
//!
//! Re-assembles transfers from protocol frames: the complementary parser of
//! the transfer sender. One receiver tracks one active session (one source
//! node); a subscription that must follow several chattering sources at once
//! relies on CAN arbitration keeping multi-frame transfers contiguous, and
//! frames from other sources are ignored while an assembly is in progress.
//!
//! Rules:
//!
//! 1. Anonymous transfers are always single-frame and are delivered without
//!    duplicate tracking (an anonymous source has no session identity).
//! 2. A start-of-transfer frame repeating the transfer ID of the previously
//!    completed transfer within the transfer-ID timeout is a duplicate and
//!    is dropped.
//! 3. The first frame of a multi-frame transfer carries the little-endian
//!    transfer CRC prefix; a first frame shorter than the prefix stops the
//!    assembly.
//! 4. Every non-initial frame must flip the toggle bit; a repeated or
//!    skipped toggle indicates a lost or duplicated frame and stops the
//!    assembly.
//! 5. The end-of-transfer frame completes the assembly only when the CRC
//!    computed over the signature and the payload matches the prefix.
//! 6. An assembly not completed within the timeout is abandoned; the next
//!    start-of-transfer begins a fresh one.

use crate::core::crc::{Crc16, Crc32, Crc48};
use crate::core::{DataTypeDescriptor, DataTypeSignature, NodeId, TransferId, TransferPriority};
use crate::time::{Duration, Instant};
use crate::transport::frame::RxFrame;
use crate::transport::TransferCrcKind;

/// Default transfer-ID timeout; also bounds multi-frame assembly duration.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(2);

/// Completed incoming transfer, payload delivered through the caller buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceivedTransfer {
    pub src: Option<NodeId>,
    pub transfer_id: TransferId,
    pub priority: TransferPriority,
    pub timestamp: Instant,
    pub length: usize,
}

#[derive(Debug, Clone, Copy)]
enum CrcState {
    Crc16(Crc16),
    Crc32(Crc32),
    Crc48(Crc48),
}

impl CrcState {
    fn new(signature: DataTypeSignature, kind: TransferCrcKind) -> Self {
        match kind {
            TransferCrcKind::Crc16 => CrcState::Crc16(signature.to_crc16()),
            TransferCrcKind::Crc32 => CrcState::Crc32(signature.to_crc32()),
            TransferCrcKind::Crc48 => CrcState::Crc48(signature.to_crc48()),
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        match self {
            CrcState::Crc16(crc) => crc.add_bytes(bytes),
            CrcState::Crc32(crc) => crc.add_bytes(bytes),
            CrcState::Crc48(crc) => crc.add_bytes(bytes),
        }
    }

    fn get(&self) -> u64 {
        match self {
            CrcState::Crc16(crc) => crc.get().into(),
            CrcState::Crc32(crc) => crc.get().into(),
            CrcState::Crc48(crc) => crc.get(),
        }
    }
}

#[derive(Debug)]
struct Assembly {
    transfer_id: TransferId,
    priority: TransferPriority,
    sot_timestamp: Instant,
    /// Toggle value expected on the next frame.
    toggle: bool,
    expected_crc: u64,
    crc: CrcState,
    length: usize,
}

#[derive(Debug)]
struct Session {
    src: NodeId,
    assembly: Option<Assembly>,
    last_transfer: Option<(TransferId, Instant)>,
}

/// Single-session transfer re-assembler for one data type
// TODO: a small per-source assembly pool would lift the single-session
// limitation for subscriptions with many concurrent multi-frame publishers
#[derive(Debug)]
pub struct TransferReceiver {
    signature: DataTypeSignature,
    crc_kind: TransferCrcKind,
    timeout: Duration,
    session: Option<Session>,
}

impl TransferReceiver {
    pub fn new(descriptor: &DataTypeDescriptor, crc_kind: TransferCrcKind) -> Self {
        Self::with_timeout(descriptor, crc_kind, DEFAULT_TRANSFER_TIMEOUT)
    }

    pub fn with_timeout(
        descriptor: &DataTypeDescriptor,
        crc_kind: TransferCrcKind,
        timeout: Duration,
    ) -> Self {
        Self {
            signature: descriptor.signature,
            crc_kind,
            timeout,
            session: None,
        }
    }

    /// Feeds one protocol frame in; returns the completed transfer, if any.
    /// The payload is written into `buffer`; a transfer longer than the
    /// buffer is discarded.
    pub fn push_frame(&mut self, buffer: &mut [u8], rx: &RxFrame) -> Option<ReceivedTransfer> {
        let frame = &rx.frame;
        let now = rx.timestamp;

        let Some(src) = frame.src() else {
            // Anonymous transfers are single-frame by construction.
            let length = frame.payload().len().min(buffer.len());
            if length < frame.payload().len() {
                return None;
            }
            buffer[..length].copy_from_slice(frame.payload());
            return Some(ReceivedTransfer {
                src: None,
                transfer_id: frame.transfer_id(),
                priority: frame.priority(),
                timestamp: now,
                length,
            });
        };

        if !self.accept_source(src, frame.is_start_of_transfer(), now) {
            return None;
        }
        let session = unwrap!(self.session.as_mut());

        if frame.is_start_of_transfer() {
            if let Some((last_id, last_ts)) = session.last_transfer {
                let duplicate =
                    frame.transfer_id() == last_id && now <= last_ts + self.timeout;
                if duplicate {
                    return None;
                }
            }
            session.assembly = None;

            if frame.is_end_of_transfer() {
                // Single-frame transfer.
                let payload = frame.payload();
                if payload.len() > buffer.len() {
                    return None;
                }
                buffer[..payload.len()].copy_from_slice(payload);
                session.last_transfer = Some((frame.transfer_id(), now));
                return Some(ReceivedTransfer {
                    src: Some(src),
                    transfer_id: frame.transfer_id(),
                    priority: frame.priority(),
                    timestamp: now,
                    length: payload.len(),
                });
            }

            // First frame of a multi-frame transfer: CRC prefix, then payload.
            let prefix_length = self.crc_kind.prefix_length();
            let content = frame.payload();
            if content.len() <= prefix_length {
                return None;
            }
            let mut expected_crc = 0u64;
            for (shift, &byte) in content[..prefix_length].iter().enumerate() {
                expected_crc |= u64::from(byte) << (8 * shift);
            }

            let payload = &content[prefix_length..];
            if payload.len() > buffer.len() {
                return None;
            }
            let mut crc = CrcState::new(self.signature, self.crc_kind);
            crc.add_bytes(payload);
            buffer[..payload.len()].copy_from_slice(payload);

            session.assembly = Some(Assembly {
                transfer_id: frame.transfer_id(),
                priority: frame.priority(),
                sot_timestamp: now,
                toggle: true,
                expected_crc,
                crc,
                length: payload.len(),
            });
            return None;
        }

        // Continuation frame.
        let Some(assembly) = session.assembly.as_ref() else {
            return None;
        };
        let payload = frame.payload();
        let sequenced = frame.transfer_id() == assembly.transfer_id
            && frame.toggle() == assembly.toggle
            && now <= assembly.sot_timestamp + self.timeout
            && !payload.is_empty();
        let overflows = assembly.length + payload.len() > buffer.len();
        if !sequenced || overflows {
            session.assembly = None;
            return None;
        }

        let assembly = unwrap!(session.assembly.as_mut());
        buffer[assembly.length..assembly.length + payload.len()].copy_from_slice(payload);
        assembly.crc.add_bytes(payload);
        assembly.length += payload.len();
        assembly.toggle = !assembly.toggle;

        if !frame.is_end_of_transfer() {
            return None;
        }

        let assembly = unwrap!(session.assembly.take());
        let crc_mask = (1u64 << (8 * self.crc_kind.prefix_length() as u32)) - 1;
        if assembly.crc.get() & crc_mask != assembly.expected_crc {
            return None;
        }

        session.last_transfer = Some((assembly.transfer_id, assembly.sot_timestamp));
        Some(ReceivedTransfer {
            src: Some(src),
            transfer_id: assembly.transfer_id,
            priority: assembly.priority,
            timestamp: assembly.sot_timestamp,
            length: assembly.length,
        })
    }

    /// Binds the active session to `src`, switching sources only when the
    /// current session is idle, timed out, or the newcomer starts a transfer
    /// while the session has nothing in flight.
    fn accept_source(&mut self, src: NodeId, sot: bool, now: Instant) -> bool {
        match self.session.as_mut() {
            None => {
                if !sot {
                    return false;
                }
                self.session = Some(Session {
                    src,
                    assembly: None,
                    last_transfer: None,
                });
                true
            }
            Some(session) if session.src == src => true,
            Some(session) => {
                if let Some(assembly) = &session.assembly {
                    if now <= assembly.sot_timestamp + self.timeout {
                        // Busy with another source.
                        return false;
                    }
                }
                if !sot {
                    return false;
                }
                *session = Session {
                    src,
                    assembly: None,
                    last_transfer: None,
                };
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataTypeId, TransferType};
    use crate::transport::frame::Frame;

    const DESCRIPTOR: DataTypeDescriptor = DataTypeDescriptor::new(
        DataTypeId::new(42),
        DataTypeSignature::new(0x1122_3344_5566_7788),
    );

    fn ts(millis: u64) -> Instant {
        Instant::MIN + Duration::from_millis(millis)
    }

    fn frame(
        tid: u8,
        sot: bool,
        eot: bool,
        toggle: bool,
        payload: &[u8],
        timestamp: Instant,
    ) -> RxFrame {
        let mut frame = Frame::new(
            DataTypeId::new(42),
            TransferType::MessageBroadcast,
            Some(NodeId::new(9).unwrap()),
            None,
            TransferId::new(tid).unwrap(),
        );
        frame.set_start_of_transfer(sot);
        frame.set_end_of_transfer(eot);
        if toggle {
            frame.flip_toggle();
        }
        frame.set_payload(payload);
        RxFrame { frame, timestamp }
    }

    fn crc_prefix(payload: &[u8]) -> [u8; 2] {
        let mut crc = DESCRIPTOR.signature.to_crc16();
        crc.add_bytes(payload);
        crc.get().to_le_bytes()
    }

    #[test]
    fn test_single_frame_transfer() {
        let mut receiver = TransferReceiver::new(&DESCRIPTOR, TransferCrcKind::Crc16);
        let mut buffer = [0u8; 16];

        let received = receiver
            .push_frame(&mut buffer, &frame(3, true, true, false, b"hello!.", ts(10)))
            .unwrap();
        assert_eq!(received.length, 7);
        assert_eq!(received.transfer_id, TransferId::new(3).unwrap());
        assert_eq!(&buffer[..7], b"hello!.");
    }

    #[test]
    fn test_two_frame_transfer() {
        let payload: [u8; 10] = core::array::from_fn(|i| i as u8 + 1);
        let prefix = crc_prefix(&payload);

        let mut first = [0u8; 7];
        first[..2].copy_from_slice(&prefix);
        first[2..].copy_from_slice(&payload[..5]);

        let mut receiver = TransferReceiver::new(&DESCRIPTOR, TransferCrcKind::Crc16);
        let mut buffer = [0u8; 16];

        assert!(receiver
            .push_frame(&mut buffer, &frame(0, true, false, false, &first, ts(0)))
            .is_none());
        let received = receiver
            .push_frame(&mut buffer, &frame(0, false, true, true, &payload[5..], ts(1)))
            .unwrap();
        assert_eq!(received.length, 10);
        assert_eq!(&buffer[..10], &payload);
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let payload: [u8; 10] = core::array::from_fn(|i| i as u8 + 1);
        let mut prefix = crc_prefix(&payload);
        prefix[0] ^= 0x01;

        let mut first = [0u8; 7];
        first[..2].copy_from_slice(&prefix);
        first[2..].copy_from_slice(&payload[..5]);

        let mut receiver = TransferReceiver::new(&DESCRIPTOR, TransferCrcKind::Crc16);
        let mut buffer = [0u8; 16];

        assert!(receiver
            .push_frame(&mut buffer, &frame(0, true, false, false, &first, ts(0)))
            .is_none());
        assert!(receiver
            .push_frame(&mut buffer, &frame(0, false, true, true, &payload[5..], ts(1)))
            .is_none());
    }

    #[test]
    fn test_duplicate_transfer_suppressed() {
        let mut receiver = TransferReceiver::new(&DESCRIPTOR, TransferCrcKind::Crc16);
        let mut buffer = [0u8; 16];

        let single = frame(7, true, true, false, &[0xaa], ts(10));
        assert!(receiver.push_frame(&mut buffer, &single).is_some());
        assert!(receiver.push_frame(&mut buffer, &single).is_none());

        // Past the timeout the same transfer ID denotes a new transfer.
        let late = frame(7, true, true, false, &[0xaa], ts(10_000));
        assert!(receiver.push_frame(&mut buffer, &late).is_some());
    }

    #[test]
    fn test_repeated_toggle_stops_assembly() {
        let payload: [u8; 10] = core::array::from_fn(|i| i as u8 + 1);
        let prefix = crc_prefix(&payload);

        let mut first = [0u8; 7];
        first[..2].copy_from_slice(&prefix);
        first[2..].copy_from_slice(&payload[..5]);

        let mut receiver = TransferReceiver::new(&DESCRIPTOR, TransferCrcKind::Crc16);
        let mut buffer = [0u8; 16];

        assert!(receiver
            .push_frame(&mut buffer, &frame(0, true, false, false, &first, ts(0)))
            .is_none());
        // Toggle not flipped: dropped frame suspected, assembly stops.
        assert!(receiver
            .push_frame(&mut buffer, &frame(0, false, true, false, &payload[5..], ts(1)))
            .is_none());
        // The would-be final frame no longer completes anything.
        assert!(receiver
            .push_frame(&mut buffer, &frame(0, false, true, true, &payload[5..], ts(2)))
            .is_none());
    }

    #[test]
    fn test_assembly_timeout() {
        let payload: [u8; 10] = core::array::from_fn(|i| i as u8 + 1);
        let prefix = crc_prefix(&payload);

        let mut first = [0u8; 7];
        first[..2].copy_from_slice(&prefix);
        first[2..].copy_from_slice(&payload[..5]);

        let mut receiver = TransferReceiver::new(&DESCRIPTOR, TransferCrcKind::Crc16);
        let mut buffer = [0u8; 16];

        assert!(receiver
            .push_frame(&mut buffer, &frame(0, true, false, false, &first, ts(0)))
            .is_none());
        assert!(receiver
            .push_frame(
                &mut buffer,
                &frame(0, false, true, true, &payload[5..], ts(5_000))
            )
            .is_none());
    }

    #[test]
    fn test_anonymous_transfer_delivered() {
        let mut receiver = TransferReceiver::new(&DESCRIPTOR, TransferCrcKind::Crc16);
        let mut buffer = [0u8; 16];

        let mut anonymous = Frame::new(
            DataTypeId::new(42),
            TransferType::MessageBroadcast,
            None,
            None,
            TransferId::new(0).unwrap(),
        );
        anonymous.set_start_of_transfer(true);
        anonymous.set_end_of_transfer(true);
        anonymous.set_payload(&[0x01, 0x02]);

        let rx = RxFrame {
            frame: anonymous,
            timestamp: ts(5),
        };
        let received = receiver.push_frame(&mut buffer, &rx).unwrap();
        assert_eq!(received.src, None);
        assert_eq!(received.length, 2);
    }
}
