//! Call-out interfaces to the surrounding Audio Gateway.
//!
//! The core owns no audio routing, power management or AT signalling of its
//! own. Everything it needs from the platform flows through [`AgCallout`];
//! everything it reports upward flows through [`ScoObserver`].

use crate::address::BluetoothAddress;
use crate::codec::ScoCodec;
use crate::constants::SCO_FRAME_CAPACITY;
use crate::scb::ScbHandle;

/// One synchronous audio frame, owned by whoever holds it last.
pub type ScoFrame = heapless::Vec<u8, SCO_FRAME_CAPACITY>;

/// Result of the platform's pre-connection audio setup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupResult {
    /// Setup completed, continue with the connection.
    #[default]
    Success,
    /// Setup failed; the attempt is abandoned or the peer rejected.
    Failed,
}

/// Audio path states reported to the platform around a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AudioState {
    /// A connection attempt is being prepared. The platform must finish any
    /// vendor-specific setup and then call
    /// [`crate::api::open_continue`] to resume.
    Setup,
    /// The link is up and carrying audio.
    On,
    /// The link closed.
    Off,
    /// The link closed to make room for a transfer to another peer.
    OffTransfer,
}

/// Upward observer for audio connection events.
///
/// Exactly one `audio_close` follows every `audio_open` for the same
/// handle.
pub trait ScoObserver {
    /// An audio connection to the peer behind `handle` is up.
    fn audio_open(&mut self, handle: ScbHandle, app_id: u8);

    /// The audio connection to the peer behind `handle` is down, or an
    /// attempt for it failed for good.
    fn audio_close(&mut self, handle: ScbHandle, app_id: u8);
}

/// Platform call-outs invoked while driving the link.
pub trait AgCallout {
    /// Audio path state change for a peer. `codec` is the codec of the
    /// current attempt or link when one is selected.
    fn audio_state(
        &mut self,
        handle: ScbHandle,
        app_id: u8,
        state: AudioState,
        codec: Option<ScoCodec>,
    );

    /// Send the codec-selection command to the peer. The AT layer reports
    /// the outcome through [`crate::api::codec_negotiation_result`].
    fn send_codec_selection(&mut self, handle: ScbHandle, codec: ScoCodec);

    /// Keep the link in active power mode while a connection is set up.
    fn set_busy(&mut self, app_id: u8, peer: BluetoothAddress);

    /// A synchronous connection is about to use the bandwidth; suspend
    /// competing audio (A2DP) if any.
    fn sco_in_use(&mut self, app_id: u8, peer: BluetoothAddress);

    /// The synchronous connection released the bandwidth; competing audio
    /// may resume.
    fn sco_released(&mut self, app_id: u8, peer: BluetoothAddress);

    /// A synchronous connection opened.
    fn sco_opened(&mut self, app_id: u8, peer: BluetoothAddress);

    /// A synchronous connection closed.
    fn sco_closed(&mut self, app_id: u8, peer: BluetoothAddress);

    /// Open the host-side codec for a link routed over HCI. Outbound frames
    /// are announced through [`crate::api::sco_data_ready_cback`] and
    /// collected with [`AgCallout::pull_outbound`].
    fn host_audio_open(&mut self, handle: ScbHandle, frame_size: usize);

    /// Close the host-side codec.
    fn host_audio_close(&mut self);

    /// Next outbound frame ready for the controller, if any.
    fn pull_outbound(&mut self) -> Option<ScoFrame>;

    /// Deliver one inbound frame to the host-side codec.
    fn push_inbound(&mut self, frame: ScoFrame);
}
