//! Wire protocol to the grading server

pub mod codec;
pub mod manager;
pub mod packets;

pub use codec::{decode_frame, encode_frame, read_frame, write_frame, MAX_FRAME_SIZE};
pub use manager::{ConnectionInterrupter, PacketManager, PacketSender};
pub use packets::{CaseStatus, InboundPacket, OutboundPacket, SubmissionRequest};
