//! `agsco` API functions.
//!
//! The async functions post requests on the static channels and wait for the
//! processor task's response; they can be called from any task. The
//! `*_cback` functions are the synchronous entry points for the controller
//! driver's callbacks; they post and return immediately, so they are safe to
//! call from contexts that must not block.

use crate::callout::{ScoFrame, SetupResult};
use crate::codec::ScoCodec;
use crate::controller::{ConnRequestParams, LinkParams, ScoIndex};
use crate::scb::{AgFeatures, PeerFeatures, ScbHandle};
use crate::{
    ControllerSignal, ScoError, ScoRequest, ScoResponse, CONTROLLER_CHANNEL, REQUEST_CHANNEL,
    RESPONSE_CHANNEL,
};

async fn request(request: ScoRequest) -> ScoResponse {
    REQUEST_CHANNEL.sender().send(request).await;
    RESPONSE_CHANNEL.receiver().receive().await
}

async fn request_ack(req: ScoRequest) -> Result<(), ScoError> {
    match request(req).await {
        ScoResponse::Ack => Ok(()),
        ScoResponse::Error(e) => Err(e),
        _ => Err(ScoError::UnexpectedResponse),
    }
}

async fn request_status(req: ScoRequest) -> Result<bool, ScoError> {
    match request(req).await {
        ScoResponse::Status(value) => Ok(value),
        ScoResponse::Error(e) => Err(e),
        _ => Err(ScoError::UnexpectedResponse),
    }
}

fn post(signal: ControllerSignal) -> Result<(), ScoError> {
    CONTROLLER_CHANNEL.try_send(signal).map_err(|_| {
        warn!("controller event queue full, signal dropped");
        ScoError::QueueFull
    })
}

/// Create a Service Control Block for a peer and return its handle.
///
/// # Errors
/// Returns [`ScoError::PoolExhausted`] when every block is in use.
pub async fn register_peer(
    addr: crate::BluetoothAddress,
    app_id: u8,
) -> Result<ScbHandle, ScoError> {
    match request(ScoRequest::RegisterPeer { addr, app_id }).await {
        ScoResponse::Registered(handle) => Ok(handle),
        ScoResponse::Error(e) => Err(e),
        _ => Err(ScoError::UnexpectedResponse),
    }
}

/// Free a peer's Service Control Block.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn unregister_peer(handle: ScbHandle) -> Result<(), ScoError> {
    request_ack(ScoRequest::UnregisterPeer(handle)).await
}

/// Record that the peer's service-level connection came up, with the
/// capabilities learned during the handshake.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn service_connected(
    handle: ScbHandle,
    features: AgFeatures,
    peer_features: PeerFeatures,
    peer_version: u16,
) -> Result<(), ScoError> {
    request_ack(ScoRequest::ServiceConnected {
        handle,
        features,
        peer_features,
        peer_version,
    })
    .await
}

/// Record that the peer's service-level connection went down. Call this
/// before [`shutdown`] so no fresh accept slot is opened for the peer.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn service_disconnected(handle: ScbHandle) -> Result<(), ScoError> {
    request_ack(ScoRequest::ServiceDisconnected(handle)).await
}

/// Change the preferred codec for a peer. A change forces a fresh
/// negotiation before the next connection.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn set_codec_preference(handle: ScbHandle, codec: ScoCodec) -> Result<(), ScoError> {
    request_ack(ScoRequest::SetCodecPreference { handle, codec }).await
}

/// Open an accept slot for the peer.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn listen(handle: ScbHandle) -> Result<(), ScoError> {
    request_ack(ScoRequest::Listen(handle)).await
}

/// Bring up audio to the peer. When another peer owns the link this becomes
/// a transfer.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn open(handle: ScbHandle) -> Result<(), ScoError> {
    request_ack(ScoRequest::Open(handle)).await
}

/// Close the peer's audio connection, if one is pending or open.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn close(handle: ScbHandle) -> Result<(), ScoError> {
    request_ack(ScoRequest::Close(handle)).await
}

/// Tear down everything for the peer.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn shutdown(handle: ScbHandle) -> Result<(), ScoError> {
    request_ack(ScoRequest::Shutdown(handle)).await
}

/// Resume a paused connection attempt once the platform's pre-connection
/// setup finished. Invoked in answer to the
/// [`AudioState::Setup`](crate::AudioState::Setup) call-out.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn open_continue(handle: ScbHandle, result: SetupResult) -> Result<(), ScoError> {
    request_ack(ScoRequest::OpenContinue { handle, result }).await
}

/// Deliver the peer's answer to the codec selection command.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn codec_negotiation_result(handle: ScbHandle, ok: bool) -> Result<(), ScoError> {
    request_ack(ScoRequest::CodecNegotiationResult { handle, ok }).await
}

/// Whether the peer owns an open audio connection.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn is_open(handle: ScbHandle) -> Result<bool, ScoError> {
    request_status(ScoRequest::IsOpen(handle)).await
}

/// Whether an attempt for the peer is in flight.
///
/// # Errors
/// Returns [`ScoError::UnknownPeer`] for an unknown handle.
pub async fn is_opening(handle: ScbHandle) -> Result<bool, ScoError> {
    request_status(ScoRequest::IsOpening(handle)).await
}

/// Controller callback: a synchronous connection completed.
///
/// # Errors
/// Returns [`ScoError::QueueFull`] when the event queue is full.
pub fn sco_conn_cback(idx: ScoIndex) -> Result<(), ScoError> {
    post(ControllerSignal::ConnComplete(idx))
}

/// Controller callback: a synchronous connection disconnected or an attempt
/// failed.
///
/// # Errors
/// Returns [`ScoError::QueueFull`] when the event queue is full.
pub fn sco_disc_cback(idx: ScoIndex) -> Result<(), ScoError> {
    post(ControllerSignal::DiscComplete(idx))
}

/// Controller callback: a peer asked for a synchronous connection.
///
/// # Errors
/// Returns [`ScoError::QueueFull`] when the event queue is full.
pub fn esco_conn_req_cback(idx: ScoIndex, params: ConnRequestParams) -> Result<(), ScoError> {
    post(ControllerSignal::ConnRequest(idx, params))
}

/// Controller callback: eSCO link parameters were renegotiated.
///
/// # Errors
/// Returns [`ScoError::QueueFull`] when the event queue is full.
pub fn esco_link_change_cback(idx: ScoIndex, params: LinkParams) -> Result<(), ScoError> {
    post(ControllerSignal::LinkChange(idx, params))
}

/// Host codec callback: outbound audio frames are ready to send.
///
/// # Errors
/// Returns [`ScoError::QueueFull`] when the event queue is full.
pub fn sco_data_ready_cback() -> Result<(), ScoError> {
    post(ControllerSignal::OutboundReady)
}

/// Controller callback: one inbound audio frame arrived.
///
/// # Errors
/// Returns [`ScoError::QueueFull`] when the event queue is full; the frame
/// is dropped in that case.
pub fn sco_in_data_cback(frame: ScoFrame) -> Result<(), ScoError> {
    post(ControllerSignal::InboundData(frame))
}
