#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines, clippy::large_enum_variant)]

// This mod MUST come first so the log shims are visible crate-wide.
#[macro_use]
mod fmt;

mod address;
pub mod api;
pub mod callout;
pub mod codec;
pub mod constants;
pub mod controller;
mod processor;
pub mod scb;
pub mod sco;

use constants::{CODEC_NEGOTIATION_TIMEOUT_MS, DEFAULT_SCO_PKT_TYPES, EVENT_QUEUE_DEPTH};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

pub use address::BluetoothAddress;
pub use callout::{AgCallout, AudioState, ScoFrame, ScoObserver, SetupResult};
pub use codec::{EscoParameters, MsbcParameterSet, ScoCodec};
pub use controller::{ConnRequestParams, LinkParams, ScoIndex, SyncController};
pub use processor::sco_event_processor;
pub use scb::{AgFeatures, PeerFeatures, ScbHandle, ServiceControlBlock};
pub use sco::{ScoManager, ScoState};

pub(crate) static REQUEST_CHANNEL: Channel<CriticalSectionRawMutex, ScoRequest, EVENT_QUEUE_DEPTH> =
    Channel::new();

pub(crate) static RESPONSE_CHANNEL: Channel<
    CriticalSectionRawMutex,
    ScoResponse,
    EVENT_QUEUE_DEPTH,
> = Channel::new();

pub(crate) static CONTROLLER_CHANNEL: Channel<
    CriticalSectionRawMutex,
    ControllerSignal,
    EVENT_QUEUE_DEPTH,
> = Channel::new();

/// Errors surfaced by the audio link API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScoError {
    /// A device address string or byte slice was malformed.
    InvalidAddress,
    /// No Service Control Block behind the given handle.
    UnknownPeer,
    /// Every Service Control Block is in use.
    PoolExhausted,
    /// An event queue was full; the posted event was dropped.
    QueueFull,
    /// The processor answered a request with the wrong response kind.
    UnexpectedResponse,
}

/// Static configuration of the audio link core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AgScoConfig {
    /// Packet-type mask for CVSD connections, see
    /// [`codec::pkt_types`].
    pub sco_pkt_types: u16,
    /// Codec negotiation timeout in milliseconds.
    pub codec_negotiation_timeout_ms: u32,
    /// Enable mSBC support and the codec negotiation state.
    pub wideband_enabled: bool,
    /// Route audio frames over HCI through the host instead of a hardware
    /// PCM interface.
    pub audio_routed_through_host: bool,
}

impl Default for AgScoConfig {
    fn default() -> Self {
        Self {
            sco_pkt_types: DEFAULT_SCO_PKT_TYPES,
            codec_negotiation_timeout_ms: CODEC_NEGOTIATION_TIMEOUT_MS,
            wideband_enabled: true,
            audio_routed_through_host: false,
        }
    }
}

/// Application requests posted to the processor task.
#[derive(Debug, Clone)]
pub enum ScoRequest {
    /// Create a Service Control Block for a peer.
    RegisterPeer {
        /// Peer device address.
        addr: BluetoothAddress,
        /// Identifier of the owning application.
        app_id: u8,
    },
    /// Free a peer's Service Control Block.
    UnregisterPeer(ScbHandle),
    /// The peer's service-level connection came up.
    ServiceConnected {
        /// Affected peer.
        handle: ScbHandle,
        /// Local feature bits.
        features: AgFeatures,
        /// Peer feature bits.
        peer_features: PeerFeatures,
        /// Peer Hands-Free profile version.
        peer_version: u16,
    },
    /// The peer's service-level connection went down.
    ServiceDisconnected(ScbHandle),
    /// Change the preferred codec for a peer.
    SetCodecPreference {
        /// Affected peer.
        handle: ScbHandle,
        /// New preference.
        codec: ScoCodec,
    },
    /// Open an accept slot for a peer.
    Listen(ScbHandle),
    /// Bring up audio to a peer.
    Open(ScbHandle),
    /// Close a peer's audio connection.
    Close(ScbHandle),
    /// Tear down everything for a peer.
    Shutdown(ScbHandle),
    /// The platform finished its pre-connection setup.
    OpenContinue {
        /// Affected peer.
        handle: ScbHandle,
        /// Setup outcome.
        result: SetupResult,
    },
    /// The AT layer reports the peer's answer to codec selection.
    CodecNegotiationResult {
        /// Affected peer.
        handle: ScbHandle,
        /// Whether the peer confirmed the selected codec.
        ok: bool,
    },
    /// Query whether the peer owns an open audio connection.
    IsOpen(ScbHandle),
    /// Query whether an attempt for the peer is in flight.
    IsOpening(ScbHandle),
}

/// Responses from the processor task.
#[derive(Debug, Clone)]
pub enum ScoResponse {
    /// A peer was registered under this handle.
    Registered(ScbHandle),
    /// The request was carried out.
    Ack,
    /// Answer to a query request.
    Status(bool),
    /// The request failed.
    Error(ScoError),
}

/// Controller callbacks posted to the processor task.
#[derive(Debug, Clone)]
pub enum ControllerSignal {
    /// A synchronous connection completed.
    ConnComplete(ScoIndex),
    /// A synchronous connection disconnected or an attempt failed.
    DiscComplete(ScoIndex),
    /// A peer asked for a synchronous connection.
    ConnRequest(ScoIndex, ConnRequestParams),
    /// The controller renegotiated eSCO link parameters.
    LinkChange(ScoIndex, LinkParams),
    /// Outbound audio frames are waiting at the host codec.
    OutboundReady,
    /// One inbound audio frame from the controller.
    InboundData(ScoFrame),
}
