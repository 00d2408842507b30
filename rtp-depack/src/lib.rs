//! RTP reassembly layer: reorder/raw queues (§4.B), per-codec depacketizers
//! (§4.C), and RTCP parse/build (§4.D.8). Kept free of any socket or RTSP
//! concept so it composes underneath `rtsp-client` the same way the
//! teacher's `net/rtp` sits underneath `net/rtsp`.

pub mod depacket;
pub mod error;
pub mod packet;
pub mod queues;
pub mod rtcp;

pub use depacket::{
    AacHbrConfig, AacLatmState, AmrKind, AsfState, CalculateAbsDon, CalculateDonDiff,
    CalculateDonDistance, Depacketizer, H264Config, Vc1State,
};
pub use error::{DepackError, DepackResult};
pub use packet::{parse_rtp_header, RtpPacket, SequenceTracker};
pub use queues::{
    PacketFlags, RawQueue, ReassembledPacket, ReorderList, RAW_QUEUE_THRESHOLD_AAC,
    RAW_QUEUE_THRESHOLD_AMR, RAW_QUEUE_THRESHOLD_DEFAULT,
};
pub use rtcp::{
    build_receiver_report, parse_rtcp, AppPacket, ReceiverReportBlock, RtcpPacket, SdesChunk,
    SdesField, SenderReport,
};
