//! Lockstep wire format: on-wire types for all cluster communication.
//!
//! These types ARE the protocol. Every field and every byte of padding is
//! part of the wire format; the sizes in the table below are load-bearing
//! and guarded by compile-time asserts.
//!
//! All types are #[repr(C, packed)] for deterministic layout and use
//! zerocopy derives for safe, allocation-free serialization. Multi-byte
//! integers are native byte order: every node of a cluster runs the same
//! executable on the same platform, so there is no endianness negotiation.
//!
//! A datagram is `[MessageType: u8][fixed header][optional payload]`. Only
//! FrameData-class messages carry a payload; its length is
//! `min(data_length - datagram_data_offset, max datagram payload)`.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::WireError;

// ── Message types ────────────────────────────────────────────────────────────

/// Discriminator byte leading every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RegisteringWithEmitter = 1,
    RepeaterRegistered = 2,
    FrameData = 3,
    RetransmitFrameData = 4,
    RepeaterWaitingToStartFrame = 5,
    EmitterWaitingToStartFrame = 6,
    PropagateQuit = 7,
    QuitReceived = 8,
    SurveyRepeaters = 9,
    RepeatersSurveyAnswer = 10,
    RetransmitReceivedFrameData = 11,
    RetransmittedReceivedFrameData = 12,
}

/// Number of distinct message types, for per-type counter arrays.
pub const MESSAGE_TYPE_COUNT: usize = 12;

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RegisteringWithEmitter),
            2 => Some(Self::RepeaterRegistered),
            3 => Some(Self::FrameData),
            4 => Some(Self::RetransmitFrameData),
            5 => Some(Self::RepeaterWaitingToStartFrame),
            6 => Some(Self::EmitterWaitingToStartFrame),
            7 => Some(Self::PropagateQuit),
            8 => Some(Self::QuitReceived),
            9 => Some(Self::SurveyRepeaters),
            10 => Some(Self::RepeatersSurveyAnswer),
            11 => Some(Self::RetransmitReceivedFrameData),
            12 => Some(Self::RetransmittedReceivedFrameData),
            _ => None,
        }
    }

    /// Zero-based index for counter arrays.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// Does this message kind carry a trailing payload after the header?
    pub fn carries_payload(self) -> bool {
        matches!(
            self,
            Self::FrameData | Self::RetransmittedReceivedFrameData
        )
    }
}

// ── Node identity ────────────────────────────────────────────────────────────

/// One-byte node identifier. 0 is reserved for the emitter by convention.
pub type NodeId = u8;

// ── Headers ──────────────────────────────────────────────────────────────────

/// Sent by a repeater (repeatedly) until the emitter acknowledges it.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RegisteringWithEmitter {
    /// Identifier the repeater was configured with.
    pub node_id: NodeId,
    /// IPv4 address of the repeater, in network octet order.
    pub ip_address_bytes: [u8; 4],
}

assert_eq_size!(RegisteringWithEmitter, [u8; 5]);

/// Emitter's answer to RegisteringWithEmitter.
///
/// A repeater only consumes answers matching its own node id and address;
/// everything else is left for other repeaters. accepted == 0 means the
/// registration was rejected, which is fatal for the repeater.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RepeaterRegistered {
    pub node_id: NodeId,
    pub ip_address_bytes: [u8; 4],
    /// 1 = accepted, 0 = rejected.
    pub accepted: u8,
}

assert_eq_size!(RepeaterRegistered, [u8; 6]);

/// One fragment of a frame's state blob. Payload bytes follow the header.
///
/// Wire size: 20 bytes (header only).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameData {
    /// Index of the frame this fragment belongs to.
    pub frame_index: u64,
    /// Total length of the complete frame blob, across all datagrams.
    pub data_length: u32,
    /// Position of this datagram in the fragment sequence.
    pub datagram_index: u32,
    /// Byte offset of this datagram's payload within the frame blob.
    pub datagram_data_offset: u32,
}

assert_eq_size!(FrameData, [u8; 20]);

/// Repeater's request for re-sending datagrams it is missing.
///
/// Requests the half-open datagram range [start, end).
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RetransmitFrameData {
    pub frame_index: u64,
    pub datagram_index_start: u32,
    pub datagram_index_end: u32,
}

assert_eq_size!(RetransmitFrameData, [u8; 16]);

/// Repeater's "ready for frame N" signal.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RepeaterWaitingToStartFrame {
    pub frame_index: u64,
    pub node_id: NodeId,
    /// 0 signals the switch to hardware sync: the emitter must stop
    /// waiting on this repeater from the next frame on.
    pub will_use_network_sync_on_next_frame: u8,
}

assert_eq_size!(RepeaterWaitingToStartFrame, [u8; 10]);

/// Broadcast by the emitter while it waits on repeaters.
///
/// A repeater whose bit is still set re-sends its
/// RepeaterWaitingToStartFrame; a cleared bit is the implicit
/// acknowledgement that the emitter heard it.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EmitterWaitingToStartFrame {
    pub frame_index: u64,
    /// 256-bit node set, one bit per NodeId, as four 64-bit words.
    pub waiting_on: [u64; 4],
}

assert_eq_size!(EmitterWaitingToStartFrame, [u8; 40]);

/// Orders every node receiving it to shut down its frame loop.
///
/// The struct has no information; one padding byte keeps the message at
/// the minimum wire size.
///
/// Wire size: 1 byte.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PropagateQuit {
    pub padding: u8,
}

assert_eq_size!(PropagateQuit, [u8; 1]);

/// Repeater's acknowledgement that it received PropagateQuit.
///
/// Wire size: 1 byte.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct QuitReceived {
    pub node_id: NodeId,
}

assert_eq_size!(QuitReceived, [u8; 1]);

/// Asks every repeater to report its current sync status.
///
/// Wire size: 1 byte.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SurveyRepeaters {
    pub padding: u8,
}

assert_eq_size!(SurveyRepeaters, [u8; 1]);

/// Repeater's answer to SurveyRepeaters.
///
/// A set of these answers is enough for an emitter to skip the greeting
/// handshake entirely: presence and sync mode are already known.
///
/// Wire size: 14 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RepeatersSurveyAnswer {
    pub node_id: NodeId,
    pub ip_address_bytes: [u8; 4],
    pub last_received_frame_index: u64,
    /// 0 once the repeater has switched to hardware sync.
    pub still_use_network_sync: u8,
}

assert_eq_size!(RepeatersSurveyAnswer, [u8; 14]);

/// Asks a specific repeater to re-send the frame data it received.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RetransmitReceivedFrameData {
    pub node_id: NodeId,
    pub frame_index: u64,
}

assert_eq_size!(RetransmitReceivedFrameData, [u8; 9]);

/// A repeater's re-send of received frame data. Same layout as FrameData,
/// distinct type so it never collides with the emitter's own stream.
///
/// Wire size: 20 bytes (header only).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RetransmittedReceivedFrameData {
    pub frame_index: u64,
    pub data_length: u32,
    pub datagram_index: u32,
    pub datagram_data_offset: u32,
}

assert_eq_size!(RetransmittedReceivedFrameData, [u8; 20]);

// ── Message union ─────────────────────────────────────────────────────────────

/// A parsed datagram: header plus (for FrameData-class kinds) its payload.
#[derive(Debug, Clone)]
pub enum Message {
    RegisteringWithEmitter(RegisteringWithEmitter),
    RepeaterRegistered(RepeaterRegistered),
    FrameData(FrameData, bytes::Bytes),
    RetransmitFrameData(RetransmitFrameData),
    RepeaterWaitingToStartFrame(RepeaterWaitingToStartFrame),
    EmitterWaitingToStartFrame(EmitterWaitingToStartFrame),
    PropagateQuit(PropagateQuit),
    QuitReceived(QuitReceived),
    SurveyRepeaters(SurveyRepeaters),
    RepeatersSurveyAnswer(RepeatersSurveyAnswer),
    RetransmitReceivedFrameData(RetransmitReceivedFrameData),
    RetransmittedReceivedFrameData(RetransmittedReceivedFrameData, bytes::Bytes),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RegisteringWithEmitter(_) => MessageType::RegisteringWithEmitter,
            Message::RepeaterRegistered(_) => MessageType::RepeaterRegistered,
            Message::FrameData(_, _) => MessageType::FrameData,
            Message::RetransmitFrameData(_) => MessageType::RetransmitFrameData,
            Message::RepeaterWaitingToStartFrame(_) => MessageType::RepeaterWaitingToStartFrame,
            Message::EmitterWaitingToStartFrame(_) => MessageType::EmitterWaitingToStartFrame,
            Message::PropagateQuit(_) => MessageType::PropagateQuit,
            Message::QuitReceived(_) => MessageType::QuitReceived,
            Message::SurveyRepeaters(_) => MessageType::SurveyRepeaters,
            Message::RepeatersSurveyAnswer(_) => MessageType::RepeatersSurveyAnswer,
            Message::RetransmitReceivedFrameData(_) => MessageType::RetransmitReceivedFrameData,
            Message::RetransmittedReceivedFrameData(_, _) => {
                MessageType::RetransmittedReceivedFrameData
            }
        }
    }

    /// Parse one datagram (type byte, header, optional payload).
    ///
    /// Truncated headers and unknown type bytes are errors; the caller
    /// decides whether that is fatal (it never is on the receive path,
    /// where malformed datagrams are counted and dropped).
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let (&type_byte, rest) = datagram
            .split_first()
            .ok_or(WireError::EmptyDatagram)?;
        let message_type =
            MessageType::from_u8(type_byte).ok_or(WireError::UnknownMessageType(type_byte))?;

        fn header<H: FromBytes>(message_type: MessageType, rest: &[u8]) -> Result<H, WireError> {
            H::read_from_prefix(rest).ok_or(WireError::TruncatedHeader {
                message_type: message_type as u8,
                got: rest.len(),
            })
        }

        Ok(match message_type {
            MessageType::RegisteringWithEmitter => {
                Message::RegisteringWithEmitter(header(message_type, rest)?)
            }
            MessageType::RepeaterRegistered => {
                Message::RepeaterRegistered(header(message_type, rest)?)
            }
            MessageType::FrameData => {
                let h: FrameData = header(message_type, rest)?;
                let payload = bytes::Bytes::copy_from_slice(&rest[std::mem::size_of::<FrameData>()..]);
                Message::FrameData(h, payload)
            }
            MessageType::RetransmitFrameData => {
                Message::RetransmitFrameData(header(message_type, rest)?)
            }
            MessageType::RepeaterWaitingToStartFrame => {
                Message::RepeaterWaitingToStartFrame(header(message_type, rest)?)
            }
            MessageType::EmitterWaitingToStartFrame => {
                Message::EmitterWaitingToStartFrame(header(message_type, rest)?)
            }
            MessageType::PropagateQuit => Message::PropagateQuit(header(message_type, rest)?),
            MessageType::QuitReceived => Message::QuitReceived(header(message_type, rest)?),
            MessageType::SurveyRepeaters => Message::SurveyRepeaters(header(message_type, rest)?),
            MessageType::RepeatersSurveyAnswer => {
                Message::RepeatersSurveyAnswer(header(message_type, rest)?)
            }
            MessageType::RetransmitReceivedFrameData => {
                Message::RetransmitReceivedFrameData(header(message_type, rest)?)
            }
            MessageType::RetransmittedReceivedFrameData => {
                let h: RetransmittedReceivedFrameData = header(message_type, rest)?;
                let payload = bytes::Bytes::copy_from_slice(
                    &rest[std::mem::size_of::<RetransmittedReceivedFrameData>()..],
                );
                Message::RetransmittedReceivedFrameData(h, payload)
            }
        })
    }

    /// Node id this message originated from, for kinds that carry one.
    /// FrameData-class messages only ever come from the emitter and
    /// carry no sender id.
    pub fn source_node_id(&self) -> Option<NodeId> {
        match self {
            Message::RegisteringWithEmitter(h) => Some(h.node_id),
            Message::RepeaterRegistered(h) => Some(h.node_id),
            Message::RepeaterWaitingToStartFrame(h) => Some(h.node_id),
            Message::QuitReceived(h) => Some(h.node_id),
            Message::RepeatersSurveyAnswer(h) => Some(h.node_id),
            _ => None,
        }
    }
}

/// Serialize a datagram: type byte, header bytes, optional payload.
pub fn encode_datagram(
    message_type: MessageType,
    header: &impl AsBytes,
    payload: &[u8],
) -> Vec<u8> {
    let header_bytes = header.as_bytes();
    let mut datagram = Vec::with_capacity(1 + header_bytes.len() + payload.len());
    datagram.push(message_type as u8);
    datagram.extend_from_slice(header_bytes);
    datagram.extend_from_slice(payload);
    datagram
}

// ── Tests ─────────────────────────────────────────────────────────────────────
