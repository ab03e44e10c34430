//! `agsco` Constants
//!
//! Limits, default values and profile-specific parameters used throughout
//! the library.

use crate::codec::pkt_types;

/// Maximum number of Hands-Free peers with a Service Control Block.
pub const MAX_AG_PEERS: usize = 6;

/// Depth of the serialized event queues feeding the processor task.
pub const EVENT_QUEUE_DEPTH: usize = 8;

/// Codec negotiation timeout in milliseconds.
pub const CODEC_NEGOTIATION_TIMEOUT_MS: u32 = 3000;

/// Controller handle value meaning "no synchronous connection".
pub const INVALID_SCO_INDEX: u16 = 0xFFFF;

/// Default packet-type mask for synchronous connections: every SCO format,
/// EV3, and all EDR formats except 2-EV3 disabled.
pub const DEFAULT_SCO_PKT_TYPES: u16 = pkt_types::SCO_LINK_ONLY
    | pkt_types::EV3
    | pkt_types::NO_3_EV3
    | pkt_types::NO_2_EV5
    | pkt_types::NO_3_EV5;

/// Hands-Free Profile version 1.5, the first to allow eSCO.
pub const HFP_VERSION_1_5: u16 = 0x0105;

/// Hands-Free Profile version 1.6, the first with codec negotiation.
pub const HFP_VERSION_1_6: u16 = 0x0106;

/// Hands-Free Profile version 1.7.
pub const HFP_VERSION_1_7: u16 = 0x0107;

/// Outbound frame size handed to the host codec when audio is routed over
/// HCI.
pub const SCO_OUT_FRAME_SIZE: usize = 120;

/// Capacity of a single synchronous audio frame buffer.
pub const SCO_FRAME_CAPACITY: usize = 240;
