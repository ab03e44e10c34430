//! Controller adapter for synchronous connections.
//!
//! The core drives the controller's SCO/eSCO machinery through the
//! [`SyncController`] trait instead of talking HCI directly. A production
//! implementation wraps the platform's controller driver (for example a
//! `bt-hci` based transport); tests substitute a recording fake.
//!
//! Every method is fire and forget: completion is reported later through
//! the controller callback entry points in [`crate::api`].

use crate::address::BluetoothAddress;
use crate::callout::ScoFrame;
use crate::codec::{CodingFormat, EscoParameters, ScoDataPath};

/// Controller-side handle for a pending or open synchronous connection.
pub type ScoIndex = u16;

/// Outcome of a synchronous-connection create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CreateStatus {
    /// The controller accepted the request; a connection-complete or
    /// disconnect-complete event follows.
    Started,
    /// The request was rejected outright.
    ImmediateFail,
}

/// Outcome of a synchronous-connection removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RemoveStatus {
    /// Teardown started; a disconnect-complete event follows.
    Started,
    /// No connection was up for this handle.
    AlreadyGone,
    /// The handle does not map to a known peer.
    UnknownAddr,
}

/// Response to a peer-initiated connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnResponse {
    /// Accept the request.
    Accept,
    /// Reject, no resources available on the host.
    RejectResources,
}

/// Link type announced in a peer connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkType {
    /// Plain SCO.
    Sco,
    /// eSCO.
    Esco,
}

/// Data carried by a peer-initiated connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnRequestParams {
    /// Requesting peer.
    pub peer: BluetoothAddress,
    /// Requested link type.
    pub link_type: LinkType,
}

/// Renegotiated parameters reported by an eSCO link-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkParams {
    /// Transmission interval in slots.
    pub transmission_interval: u8,
    /// Retransmission window in slots.
    pub retransmission_window: u8,
    /// Receive packet length in bytes.
    pub rx_packet_length: u16,
    /// Transmit packet length in bytes.
    pub tx_packet_length: u16,
}

/// Capability set the core requires from the Bluetooth controller.
pub trait SyncController {
    /// Initiate a synchronous connection when `is_originator` is true, or
    /// prepare an accept slot for the peer otherwise. Returns the controller
    /// handle for the attempt and whether it started.
    fn create_sync(
        &mut self,
        peer: BluetoothAddress,
        is_originator: bool,
        packet_types: u16,
    ) -> (ScoIndex, CreateStatus);

    /// Request teardown of a pending or open connection.
    fn remove_sync(&mut self, idx: ScoIndex) -> RemoveStatus;

    /// Accept or reject a pending peer-initiated connection request.
    /// `params` may be absent on a reject issued before any parameters were
    /// selected.
    fn respond_conn_request(
        &mut self,
        idx: ScoIndex,
        response: ConnResponse,
        params: Option<&EscoParameters>,
    );

    /// Set the default parameters for the next originated connection.
    fn set_esco_mode(&mut self, params: &EscoParameters);

    /// Subscribe to connection-request and link-change events for a handle.
    fn register_link_events(&mut self, idx: ScoIndex);

    /// Peer address behind a controller handle, if known.
    fn read_peer_addr(&self, idx: ScoIndex) -> Option<BluetoothAddress>;

    /// Whether the controller supports the enhanced synchronous-connection
    /// setup. When it does, voice-setting writes are skipped because the
    /// enhanced command carries the coding format itself.
    fn supports_enhanced_setup(&self) -> bool;

    /// Legacy voice-settings write, required before a create on controllers
    /// without enhanced setup.
    fn write_voice_settings(&mut self, format: CodingFormat);

    /// Route synchronous audio data over the given path. Only called when
    /// audio is routed through the host; a PCM-wired platform may make this
    /// a no-op.
    fn config_audio_path(&mut self, path: ScoDataPath, enable: bool);

    /// Submit one outbound audio frame on an open connection.
    fn write_audio(&mut self, idx: ScoIndex, frame: ScoFrame);
}
