//! Audio link management.
//!
//! [`ScoManager`] is the synchronous core of the crate. It owns the Service
//! Control Block registry, the global link state, the controller adapter and
//! the platform call-outs, and it translates application requests and
//! controller callbacks into state machine events. All of its methods are
//! meant to run on one serialized event loop (see
//! [`crate::sco_event_processor`]); nothing here blocks or locks.

mod machine;
mod negotiation;

pub use machine::{ScoEvent, ScoState};

use crate::address::BluetoothAddress;
use crate::callout::{AgCallout, AudioState, ScoFrame, ScoObserver, SetupResult};
use crate::codec::{CodingFormat, MsbcParameterSet, ScoCodec, ScoDataPath};
use crate::constants::{INVALID_SCO_INDEX, SCO_OUT_FRAME_SIZE};
use crate::controller::{
    ConnRequestParams, ConnResponse, LinkParams, ScoIndex, SyncController,
};
use crate::scb::{AgFeatures, PeerFeatures, ScbHandle, ScbRegistry};
use crate::{AgScoConfig, ControllerSignal, ScoError, ScoRequest, ScoResponse};

use machine::{attempt_msbc_safe_settings, cvsd_attempt_params};

/// Global link control state, shared by every Service Control Block.
#[derive(Debug)]
pub(crate) struct ScoControl {
    /// Current machine state.
    pub state: ScoState,
    /// Owner of the active attempt or link.
    pub curr_scb: Option<ScbHandle>,
    /// Target of a pending transfer.
    pub xfer_scb: Option<ScbHandle>,
    /// Controller handle of the active attempt.
    pub cur_idx: ScoIndex,
    /// Whether the last attempt was locally initiated.
    pub is_local: bool,
    /// Peer request cached for a deferred accept during transfer.
    pub conn_data: Option<ConnRequestParams>,
    /// Result of the platform's pre-connection setup.
    pub set_audio_status: SetupResult,
    /// Peer whose codec negotiation timer is running.
    pub nego_pending: Option<ScbHandle>,
}

impl ScoControl {
    const fn new() -> Self {
        Self {
            state: ScoState::Shutdown,
            curr_scb: None,
            xfer_scb: None,
            cur_idx: INVALID_SCO_INDEX,
            is_local: false,
            conn_data: None,
            set_audio_status: SetupResult::Success,
            nego_pending: None,
        }
    }
}

/// The audio link core: registry, state machine and dispatcher in one
/// place, driven from a single event loop.
pub struct ScoManager<C, CO, OB> {
    pub(crate) config: AgScoConfig,
    pub(crate) registry: ScbRegistry,
    pub(crate) sco: ScoControl,
    pub(crate) controller: C,
    pub(crate) callout: CO,
    pub(crate) observer: OB,
}

impl<C, CO, OB> ScoManager<C, CO, OB>
where
    C: SyncController,
    CO: AgCallout,
    OB: ScoObserver,
{
    /// Create a manager around a controller and the platform call-outs.
    pub fn new(config: AgScoConfig, controller: C, callout: CO, observer: OB) -> Self {
        Self {
            config,
            registry: ScbRegistry::new(),
            sco: ScoControl::new(),
            controller,
            callout,
            observer,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &AgScoConfig {
        &self.config
    }

    /// Current machine state.
    #[must_use]
    pub fn state(&self) -> ScoState {
        self.sco.state
    }

    fn ensure_known(&self, handle: ScbHandle) -> Result<(), ScoError> {
        if self.registry.get(handle).is_some() {
            Ok(())
        } else {
            Err(ScoError::UnknownPeer)
        }
    }

    // ------------------------------------------------------------------
    // Peer management
    // ------------------------------------------------------------------

    /// Create a Service Control Block for a peer.
    ///
    /// # Errors
    /// Returns [`ScoError::PoolExhausted`] when every block is in use.
    pub fn register_peer(
        &mut self,
        addr: BluetoothAddress,
        app_id: u8,
    ) -> Result<ScbHandle, ScoError> {
        self.registry
            .alloc(addr, app_id)
            .ok_or(ScoError::PoolExhausted)
    }

    /// Free a peer's Service Control Block. When the peer owns the active
    /// link or attempt, the link is removed from the controller and the
    /// observer sees the balancing audio-close before the block goes away.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn unregister_peer(&mut self, handle: ScbHandle) -> Result<(), ScoError> {
        let Some(scb) = self.registry.get(handle).copied() else {
            return Err(ScoError::UnknownPeer);
        };

        if self.sco.curr_scb == Some(handle) {
            // Freeing the owner of the link would strand the machine and
            // leak the controller connection; wind the link down first.
            if scb.sco_idx != INVALID_SCO_INDEX {
                self.controller.remove_sync(scb.sco_idx);
            }
            if self.sco.state != ScoState::Shutdown && self.sco.state != ScoState::Listening {
                // The audio session ends here as far as the observer can
                // tell; the disconnect event will find no owner.
                self.observer.audio_close(handle, scb.app_id);
            }
            // A transfer that was waiting on this link cannot be served.
            if let Some(xfer) = self.sco.xfer_scb.take() {
                if self.sco.conn_data.take().is_some() && xfer != handle {
                    let idx = self
                        .registry
                        .get(xfer)
                        .map_or(INVALID_SCO_INDEX, |scb| scb.sco_idx);
                    if idx != INVALID_SCO_INDEX {
                        self.controller
                            .respond_conn_request(idx, ConnResponse::RejectResources, None);
                        if let Some(scb) = self.registry.get_mut(xfer) {
                            scb.sco_idx = INVALID_SCO_INDEX;
                        }
                    }
                }
            }
            self.sco.conn_data = None;
            self.sco.curr_scb = None;
            self.sco.cur_idx = INVALID_SCO_INDEX;
            self.sco.state = if self.registry.other_in_use(handle) {
                ScoState::Listening
            } else {
                ScoState::Shutdown
            };
        }

        if self.sco.xfer_scb == Some(handle) {
            self.sco.xfer_scb = None;
            self.sco.conn_data = None;
        }
        if self.sco.nego_pending == Some(handle) {
            self.sco.nego_pending = None;
        }
        self.registry.free(handle);
        Ok(())
    }

    /// Record that the peer's service-level connection came up, with the
    /// capabilities learned during the handshake.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn service_connected(
        &mut self,
        handle: ScbHandle,
        features: AgFeatures,
        peer_features: PeerFeatures,
        peer_version: u16,
    ) -> Result<(), ScoError> {
        let scb = self.registry.get_mut(handle).ok_or(ScoError::UnknownPeer)?;
        scb.svc_conn = true;
        scb.features = features;
        scb.peer_features = peer_features;
        scb.peer_version = peer_version;
        Ok(())
    }

    /// Record that the peer's service-level connection went down.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn service_disconnected(&mut self, handle: ScbHandle) -> Result<(), ScoError> {
        let scb = self.registry.get_mut(handle).ok_or(ScoError::UnknownPeer)?;
        scb.svc_conn = false;
        Ok(())
    }

    /// Change the preferred codec for a peer. A change forces a fresh
    /// negotiation before the next connection.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn set_codec_preference(
        &mut self,
        handle: ScbHandle,
        codec: ScoCodec,
    ) -> Result<(), ScoError> {
        let scb = self.registry.get_mut(handle).ok_or(ScoError::UnknownPeer)?;
        if scb.sco_codec != codec {
            scb.sco_codec = codec;
            scb.codec_updated = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Application entry points
    // ------------------------------------------------------------------

    /// Open an accept slot for the peer.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn sco_listen(&mut self, handle: ScbHandle) -> Result<(), ScoError> {
        self.ensure_known(handle)?;
        self.sco_event(handle, ScoEvent::Listen);
        Ok(())
    }

    /// Bring up audio to the peer. When another peer owns the link this
    /// becomes a transfer.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn sco_open(&mut self, handle: ScbHandle) -> Result<(), ScoError> {
        self.ensure_known(handle)?;
        let event = if self.sco.curr_scb.is_some() && self.sco.curr_scb != Some(handle) {
            ScoEvent::Transfer
        } else {
            ScoEvent::Open
        };
        self.sco_event(handle, event);
        Ok(())
    }

    /// Close the peer's audio connection, if one is pending or open.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn sco_close(&mut self, handle: ScbHandle) -> Result<(), ScoError> {
        self.ensure_known(handle)?;
        let has_sco = self
            .registry
            .get(handle)
            .is_some_and(|scb| scb.sco_idx != INVALID_SCO_INDEX);
        // No connection exists yet during negotiation, but the attempt still
        // has to be wound back.
        let negotiating =
            self.config.wideband_enabled && self.sco.state == ScoState::CodecNegotiation;
        if has_sco || negotiating {
            self.sco_event(handle, ScoEvent::Close);
        } else {
            debug!("close with no connection (scb {})", handle);
        }
        Ok(())
    }

    /// Tear down everything for the peer. Callers mark the service-level
    /// connection down first, so no fresh accept slot is opened for it.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn sco_shutdown(&mut self, handle: ScbHandle) -> Result<(), ScoError> {
        self.ensure_known(handle)?;
        self.sco_event(handle, ScoEvent::Shutdown);
        Ok(())
    }

    /// Resume a paused attempt once the platform's pre-connection setup
    /// finished.
    ///
    /// # Errors
    /// Returns [`ScoError::UnknownPeer`] for an unknown handle.
    pub fn ci_sco_open_continue(
        &mut self,
        handle: ScbHandle,
        result: SetupResult,
    ) -> Result<(), ScoError> {
        self.ensure_known(handle)?;
        self.sco.set_audio_status = result;
        self.sco_event(handle, ScoEvent::OpenPending);
        Ok(())
    }

    /// Whether the peer owns an open audio connection.
    #[must_use]
    pub fn is_open(&self, handle: ScbHandle) -> bool {
        self.sco.state == ScoState::Open && self.sco.curr_scb == Some(handle)
    }

    /// Whether an attempt for the peer is in flight.
    #[must_use]
    pub fn is_opening(&self, handle: ScbHandle) -> bool {
        self.sco.state == ScoState::Opening && self.sco.curr_scb == Some(handle)
    }

    // ------------------------------------------------------------------
    // Controller events
    // ------------------------------------------------------------------

    /// A synchronous connection completed.
    pub fn on_conn_complete(&mut self, idx: ScoIndex) {
        // Prefer the block driving the current attempt, then the peer
        // address behind the handle.
        let handle = match self.sco.curr_scb {
            Some(h) if self.registry.get(h).is_some() => Some(h),
            _ => self
                .controller
                .read_peer_addr(idx)
                .and_then(|addr| self.registry.by_addr(addr))
                .filter(|&h| self.registry.get(h).is_some_and(|scb| scb.svc_conn)),
        };

        match handle {
            Some(handle) => self.conn_open_flow(handle),
            None => {
                // Nobody owns this connection; tear it down and reset.
                warn!("connection complete with no owner (idx {})", idx);
                self.sco.curr_scb = None;
                self.sco.state = ScoState::Shutdown;
                self.controller.remove_sync(idx);
            }
        }
    }

    /// A synchronous connection disconnected, or an attempt failed.
    pub fn on_disc_complete(&mut self, idx: ScoIndex) {
        let handle = match self.sco.curr_scb {
            Some(h) => match self.registry.get(h) {
                // An invalid stored index matches anything: the attempt may
                // have failed before the controller assigned a handle.
                Some(scb) if scb.sco_idx == idx || scb.sco_idx == INVALID_SCO_INDEX => Some(h),
                Some(_) => {
                    debug!("disconnect for non-active connection ignored (idx {})", idx);
                    return;
                }
                None => None,
            },
            None => None,
        };

        let Some(handle) = handle else {
            debug!("disconnect complete with no matching scb (idx {})", idx);
            // The block may already be gone; reset to a clean shutdown.
            if let Some(curr) = self.sco.curr_scb.take() {
                if let Some(scb) = self.registry.get_mut(curr) {
                    scb.sco_idx = INVALID_SCO_INDEX;
                }
                self.sco.state = ScoState::Shutdown;
            }
            return;
        };

        if self.config.audio_routed_through_host {
            // Hand the transport back to PCM and shut the host codec.
            self.controller.config_audio_path(ScoDataPath::Pcm, true);
            self.callout.host_audio_close();
        }

        if self.config.wideband_enabled
            && self
                .registry
                .get(handle)
                .is_some_and(|scb| scb.inuse_codec == Some(ScoCodec::Msbc))
        {
            if !self.controller.supports_enhanced_setup() {
                self.controller.write_voice_settings(CodingFormat::Cvsd);
            }
            // A failed wideband originate steps down the ladder: T2, then
            // T1, then narrowband.
            if self.is_opening(handle) {
                if let Some(scb) = self.registry.get_mut(handle) {
                    if scb.codec_msbc_settings == MsbcParameterSet::T2 {
                        debug!("msbc t2 failed, retrying with t1 (scb {})", handle);
                        scb.codec_msbc_settings = MsbcParameterSet::T1;
                    } else {
                        debug!("msbc failed, falling back to cvsd (scb {})", handle);
                        scb.codec_fallback = true;
                    }
                }
            }
        }

        if let Some(scb) = self.registry.get_mut(handle) {
            scb.inuse_codec = None;
        }
        self.conn_close_flow(handle);
    }

    /// A peer asked for a synchronous connection.
    pub fn on_conn_request(&mut self, idx: ScoIndex, params: ConnRequestParams) {
        let handle = self
            .registry
            .by_addr(params.peer)
            .filter(|&h| self.registry.get(h).is_some_and(|scb| scb.svc_conn));

        let Some(handle) = handle else {
            warn!("rejecting connection request, no service for peer (idx {})", idx);
            self.controller
                .respond_conn_request(idx, ConnResponse::RejectResources, None);
            return;
        };

        if let Some(scb) = self.registry.get_mut(handle) {
            scb.sco_idx = idx;
        }

        if self.sco.curr_scb.is_none() {
            debug!("accepting connection request (idx {})", idx);
            self.sco_conn_rsp(handle, Some(&params));
            self.sco.state = ScoState::Opening;
            self.sco.curr_scb = Some(handle);
            self.sco.cur_idx = idx;
        } else {
            // A second headset preempts the active link: stash the request
            // and close the current connection first.
            debug!("connection request while active, starting transfer (idx {})", idx);
            self.sco.xfer_scb = Some(handle);
            self.sco.conn_data = Some(params);
            self.sco.state = ScoState::TransferAccept;

            let removing = match self.sco.curr_scb {
                Some(curr) => self.remove_sco(curr, true),
                None => false,
            };
            if !removing {
                warn!("nothing to remove, accepting transfer immediately (idx {})", idx);
                self.sco.xfer_scb = None;
                self.sco.conn_data = None;
                self.sco_conn_rsp(handle, Some(&params));
                // There is no close event to resume on, so answer right away.
                let response_params = self.registry.get(handle).map(cvsd_attempt_params);
                self.controller.respond_conn_request(
                    idx,
                    ConnResponse::Accept,
                    response_params.as_ref(),
                );
                // The accepted attempt must be the one the machine tracks,
                // or the upcoming connection-complete is attributed to the
                // peer that just went away.
                self.sco.state = ScoState::Opening;
                self.sco.curr_scb = Some(handle);
                self.sco.cur_idx = idx;
            }
        }
    }

    /// The controller renegotiated eSCO link parameters.
    pub fn on_link_change(&mut self, idx: ScoIndex, params: LinkParams) {
        debug!(
            "esco link change (idx {}): interval {} rtx {} rx {} tx {}",
            idx,
            params.transmission_interval,
            params.retransmission_window,
            params.rx_packet_length,
            params.tx_packet_length,
        );
    }

    /// Outbound audio frames are waiting at the host codec. Drained to the
    /// controller while the link is open, dropped otherwise.
    pub fn on_outbound_ready(&mut self) {
        if !self.config.audio_routed_through_host {
            return;
        }
        while let Some(frame) = self.callout.pull_outbound() {
            let idx = self
                .sco
                .curr_scb
                .and_then(|h| self.registry.get(h))
                .map(|scb| scb.sco_idx);
            if self.sco.state == ScoState::Open {
                if let Some(idx) = idx {
                    self.controller.write_audio(idx, frame);
                    continue;
                }
            }
            // Not open: the frame is released here.
            drop(frame);
        }
    }

    /// Forward one inbound audio frame to the host codec.
    pub fn on_inbound_audio(&mut self, frame: ScoFrame) {
        self.callout.push_inbound(frame);
    }

    // ------------------------------------------------------------------
    // Queue-facing dispatch
    // ------------------------------------------------------------------

    /// Dispatch one controller signal.
    pub fn handle_signal(&mut self, signal: ControllerSignal) {
        match signal {
            ControllerSignal::ConnComplete(idx) => self.on_conn_complete(idx),
            ControllerSignal::DiscComplete(idx) => self.on_disc_complete(idx),
            ControllerSignal::ConnRequest(idx, params) => self.on_conn_request(idx, params),
            ControllerSignal::LinkChange(idx, params) => self.on_link_change(idx, params),
            ControllerSignal::OutboundReady => self.on_outbound_ready(),
            ControllerSignal::InboundData(frame) => self.on_inbound_audio(frame),
        }
    }

    /// Dispatch one application request and produce its response.
    pub fn handle_request(&mut self, request: ScoRequest) -> ScoResponse {
        fn ack(result: Result<(), ScoError>) -> ScoResponse {
            match result {
                Ok(()) => ScoResponse::Ack,
                Err(e) => ScoResponse::Error(e),
            }
        }

        match request {
            ScoRequest::RegisterPeer { addr, app_id } => {
                match self.register_peer(addr, app_id) {
                    Ok(handle) => ScoResponse::Registered(handle),
                    Err(e) => ScoResponse::Error(e),
                }
            }
            ScoRequest::UnregisterPeer(handle) => ack(self.unregister_peer(handle)),
            ScoRequest::ServiceConnected {
                handle,
                features,
                peer_features,
                peer_version,
            } => ack(self.service_connected(handle, features, peer_features, peer_version)),
            ScoRequest::ServiceDisconnected(handle) => ack(self.service_disconnected(handle)),
            ScoRequest::SetCodecPreference { handle, codec } => {
                ack(self.set_codec_preference(handle, codec))
            }
            ScoRequest::Listen(handle) => ack(self.sco_listen(handle)),
            ScoRequest::Open(handle) => ack(self.sco_open(handle)),
            ScoRequest::Close(handle) => ack(self.sco_close(handle)),
            ScoRequest::Shutdown(handle) => ack(self.sco_shutdown(handle)),
            ScoRequest::OpenContinue { handle, result } => {
                ack(self.ci_sco_open_continue(handle, result))
            }
            ScoRequest::CodecNegotiationResult { handle, ok } => {
                match self.ensure_known(handle) {
                    Ok(()) => {
                        self.sco_codec_nego(handle, ok);
                        ScoResponse::Ack
                    }
                    Err(e) => ScoResponse::Error(e),
                }
            }
            ScoRequest::IsOpen(handle) => ScoResponse::Status(self.is_open(handle)),
            ScoRequest::IsOpening(handle) => ScoResponse::Status(self.is_opening(handle)),
        }
    }

    // ------------------------------------------------------------------
    // Connection open/close flows
    // ------------------------------------------------------------------

    fn conn_open_flow(&mut self, handle: ScbHandle) {
        self.sco_event(handle, ScoEvent::ConnOpen);

        let Some(scb) = self.registry.get(handle).copied() else {
            return;
        };
        self.callout.sco_opened(scb.app_id, scb.peer_addr);
        self.callout
            .audio_state(handle, scb.app_id, AudioState::On, scb.inuse_codec);
        if self.config.audio_routed_through_host {
            self.callout.host_audio_open(handle, SCO_OUT_FRAME_SIZE);
        }
        self.observer.audio_open(handle, scb.app_id);

        if let Some(scb) = self.registry.get_mut(handle) {
            scb.retry_with_sco_only = false;
        }
        if self.config.wideband_enabled {
            // T2 becomes the preference again for the next wideband attempt.
            if let Some(scb) = self.registry.get_mut(handle) {
                scb.codec_msbc_settings = MsbcParameterSet::T2;
            }
        }
    }

    fn conn_close_flow(&mut self, handle: ScbHandle) {
        self.sco.curr_scb = None;
        if let Some(scb) = self.registry.get_mut(handle) {
            scb.sco_idx = INVALID_SCO_INDEX;
        }
        let Some(scb) = self.registry.get(handle).copied() else {
            return;
        };

        let wbs = self.config.wideband_enabled;
        if wbs && ((scb.codec_fallback && scb.svc_conn) || attempt_msbc_safe_settings(&scb)) {
            // The failed attempt has a weaker configuration left to try.
            self.sco_event(handle, ScoEvent::Reopen);
        } else if scb.retry_with_sco_only && scb.svc_conn {
            debug!("esco failed, retrying with sco packet types (scb {})", handle);
            self.create_sco(handle, true);
        } else {
            let state = if self.sco.xfer_scb.is_some() {
                AudioState::OffTransfer
            } else {
                AudioState::Off
            };
            self.callout
                .audio_state(handle, scb.app_id, state, scb.inuse_codec);
            self.sco_event(handle, ScoEvent::ConnClose);
            self.callout.sco_closed(scb.app_id, scb.peer_addr);
            self.callout.sco_released(scb.app_id, scb.peer_addr);
            self.observer.audio_close(handle, scb.app_id);
            if wbs {
                if let Some(scb) = self.registry.get_mut(handle) {
                    scb.codec_msbc_settings = MsbcParameterSet::T2;
                }
            }
        }

        if let Some(scb) = self.registry.get_mut(handle) {
            scb.retry_with_sco_only = false;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{addr, connected_peer, manager, CoEvent, CtrlOp, TestManager};
    use super::ScoState;
    use crate::callout::{AudioState, ScoFrame, SetupResult};
    use crate::codec::{pkt_types, EscoParameters, MsbcParameterSet, ScoCodec};
    use crate::constants::{DEFAULT_SCO_PKT_TYPES, HFP_VERSION_1_5, INVALID_SCO_INDEX};
    use crate::controller::{ConnRequestParams, ConnResponse, LinkType, ScoIndex};
    use crate::scb::{AgFeatures, PeerFeatures, ScbHandle};
    use crate::AgScoConfig;

    fn request_from(last: u8) -> ConnRequestParams {
        ConnRequestParams {
            peer: addr(last),
            link_type: LinkType::Esco,
        }
    }

    /// Drive a peer from Listening to Open over CVSD and return the
    /// controller index of the link.
    fn open_cvsd(m: &mut TestManager, handle: ScbHandle) -> ScoIndex {
        m.sco_listen(handle).unwrap();
        m.sco_open(handle).unwrap();
        assert_eq!(m.state(), ScoState::Opening);
        m.ci_sco_open_continue(handle, SetupResult::Success).unwrap();
        let idx = m.controller.last_created();
        m.controller.connected = Some(idx);
        m.on_conn_complete(idx);
        assert_eq!(m.state(), ScoState::Open);
        idx
    }

    #[test]
    fn test_basic_open_cvsd() {
        let mut m = manager(AgScoConfig::default());
        let a = m.register_peer(addr(0xA1), 1).unwrap();
        // HFP 1.5 peer without codec negotiation.
        m.service_connected(
            a,
            AgFeatures(AgFeatures::ESCO),
            PeerFeatures(PeerFeatures::ESCO),
            HFP_VERSION_1_5,
        )
        .unwrap();

        assert_eq!(m.state(), ScoState::Shutdown);
        m.sco_listen(a).unwrap();
        assert_eq!(m.state(), ScoState::Listening);
        assert!(matches!(
            m.controller.ops[0],
            CtrlOp::Create {
                originator: false,
                ..
            }
        ));

        // No codec change pending: negotiation is skipped straight through.
        m.sco_open(a).unwrap();
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(m.sco.curr_scb, Some(a));
        assert!(m.is_opening(a));
        assert!(m.callout.events.contains(&CoEvent::AudioState {
            handle: a,
            state: AudioState::Setup,
            codec: Some(ScoCodec::Cvsd),
        }));

        m.ci_sco_open_continue(a, SetupResult::Success).unwrap();
        let idx = m.controller.last_created();
        assert!(m.controller.ops.contains(&CtrlOp::Create {
            peer: addr(0xA1),
            originator: true,
            packet_types: EscoParameters::cvsd().packet_types,
        }));

        m.on_conn_complete(idx);
        assert_eq!(m.state(), ScoState::Open);
        assert!(m.is_open(a));
        assert_eq!(m.observer.opens.as_slice(), &[(a, 1)]);
        assert!(m.observer.closes.is_empty());
    }

    #[test]
    fn test_originate_packet_types_use_configured_mask() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA1, 1);

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        m.ci_sco_open_continue(a, SetupResult::Success).unwrap();

        // CVSD originate advertises the configured mask with 3-EV3 disabled.
        assert!(m
            .controller
            .ops
            .iter()
            .any(|op| matches!(op, CtrlOp::SetEscoMode(mask)
                if *mask == DEFAULT_SCO_PKT_TYPES | pkt_types::NO_3_EV3)));
    }

    #[test]
    fn test_msbc_t2_falls_back_to_t1() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA2, 2);
        m.set_codec_preference(a, ScoCodec::Msbc).unwrap();

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        assert_eq!(m.state(), ScoState::CodecNegotiation);
        assert_eq!(m.negotiation_pending(), Some(a));
        assert!(m.callout.events.contains(&CoEvent::CodecSelection {
            handle: a,
            codec: ScoCodec::Msbc,
        }));

        // Peer confirms the codec.
        m.sco_codec_nego(a, true);
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(m.negotiation_pending(), None);

        m.ci_sco_open_continue(a, SetupResult::Success).unwrap();
        let first = m.controller.last_created();
        assert!(m.controller.ops.contains(&CtrlOp::Create {
            peer: addr(0xA2),
            originator: true,
            packet_types: EscoParameters::msbc_t2().packet_types,
        }));

        // Controller rejects T2. The codec itself is already agreed, so the
        // retry passes straight through negotiation into a fresh attempt
        // with the safe settings.
        m.on_disc_complete(first);
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(
            m.registry.get(a).unwrap().codec_msbc_settings,
            MsbcParameterSet::T1
        );

        m.ci_sco_open_continue(a, SetupResult::Success).unwrap();
        let second = m.controller.last_created();
        assert!(m.controller.ops.contains(&CtrlOp::Create {
            peer: addr(0xA2),
            originator: true,
            packet_types: EscoParameters::msbc_t1().packet_types,
        }));

        m.on_conn_complete(second);
        assert_eq!(m.state(), ScoState::Open);
        // The preference resets to T2 once a link is up.
        assert_eq!(
            m.registry.get(a).unwrap().codec_msbc_settings,
            MsbcParameterSet::T2
        );
        assert_eq!(m.observer.opens.len(), 1);
    }

    #[test]
    fn test_msbc_never_retries_with_sco_only() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA3, 3);
        m.set_codec_preference(a, ScoCodec::Msbc).unwrap();

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        m.sco_codec_nego(a, true);
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(m.registry.get(a).unwrap().inuse_codec, Some(ScoCodec::Msbc));
        assert!(!m.registry.get(a).unwrap().retry_with_sco_only);
    }

    #[test]
    fn test_transfer_to_second_peer() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA4, 4);
        let b = connected_peer(&mut m, 0xB4, 5);

        let a_idx = open_cvsd(&mut m, a);

        // B rings in while A owns the link.
        let b_idx = 0x40;
        m.on_conn_request(b_idx, request_from(0xB4));
        assert_eq!(m.state(), ScoState::TransferAccept);
        assert_eq!(m.sco.xfer_scb, Some(b));
        assert!(m.controller.ops.contains(&CtrlOp::Remove(a_idx)));

        // A's link goes down; B's stashed request is accepted and A goes
        // back to listening.
        m.controller.connected = None;
        m.on_disc_complete(a_idx);
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(m.sco.curr_scb, Some(b));
        assert_eq!(m.sco.xfer_scb, None);
        assert_eq!(m.observer.closes.as_slice(), &[(a, 4)]);
        assert!(m.callout.events.contains(&CoEvent::AudioState {
            handle: a,
            state: AudioState::OffTransfer,
            codec: None,
        }));
        // A is listening again.
        let listen_for_a = m
            .controller
            .ops
            .iter()
            .filter(|op| matches!(op, CtrlOp::Create { peer, originator: false, .. } if *peer == addr(0xA4)))
            .count();
        assert_eq!(listen_for_a, 2);

        // The deferred accept goes out once the platform setup finishes.
        m.ci_sco_open_continue(b, SetupResult::Success).unwrap();
        assert!(m.controller.ops.contains(&CtrlOp::Respond {
            idx: b_idx,
            response: ConnResponse::Accept,
        }));

        m.on_conn_complete(b_idx);
        assert!(m.is_open(b));
        assert_eq!(m.observer.opens.as_slice(), &[(a, 4), (b, 5)]);
    }

    #[test]
    fn test_transfer_with_nothing_to_remove_accepts_immediately() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA5, 6);
        let b = connected_peer(&mut m, 0xB5, 7);

        open_cvsd(&mut m, a);
        // The controller already lost the link without telling us.
        m.controller.connected = None;

        m.on_conn_request(0x41, request_from(0xB5));
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(m.sco.curr_scb, Some(b));
        assert_eq!(m.sco.xfer_scb, None);
        assert!(m.controller.ops.contains(&CtrlOp::Respond {
            idx: 0x41,
            response: ConnResponse::Accept,
        }));
        assert_eq!(m.registry.get(b).unwrap().sco_idx, 0x41);

        // The accepted connection comes up for the right peer.
        m.controller.connected = Some(0x41);
        m.on_conn_complete(0x41);
        assert_eq!(m.state(), ScoState::Open);
        assert!(m.is_open(b));
        assert_eq!(m.observer.opens.last(), Some(&(b, 7)));
    }

    #[test]
    fn test_shutdown_while_opening() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA6, 8);

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        m.ci_sco_open_continue(a, SetupResult::Success).unwrap();
        let idx = m.controller.last_created();
        assert_eq!(m.state(), ScoState::Opening);

        // The service connection drops before the link comes up.
        m.service_disconnected(a).unwrap();
        m.sco_shutdown(a).unwrap();
        assert_eq!(m.state(), ScoState::ShuttingDown);

        // The link comes up anyway and is torn right back down.
        m.controller.connected = Some(idx);
        m.on_conn_complete(idx);
        assert_eq!(m.state(), ScoState::ShuttingDown);
        assert!(m.controller.ops.contains(&CtrlOp::Remove(idx)));

        m.controller.connected = None;
        m.on_disc_complete(idx);
        assert_eq!(m.state(), ScoState::Shutdown);
        assert_eq!(m.sco.curr_scb, None);
        // Every open was balanced by a close.
        assert_eq!(m.observer.opens.len(), m.observer.closes.len());
    }

    #[test]
    fn test_codec_negotiation_timeout() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA7, 9);
        m.set_codec_preference(a, ScoCodec::Msbc).unwrap();

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        assert_eq!(m.state(), ScoState::CodecNegotiation);
        assert_eq!(m.negotiation_pending(), Some(a));
        assert!(m.callout.events.contains(&CoEvent::Busy));

        m.on_negotiation_timeout(a);
        assert_eq!(m.state(), ScoState::Listening);
        assert_eq!(m.negotiation_pending(), None);
        assert_eq!(m.observer.closes.as_slice(), &[(a, 9)]);
    }

    #[test]
    fn test_stale_negotiation_timeout_is_noop() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA8, 10);
        m.set_codec_preference(a, ScoCodec::Msbc).unwrap();

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        m.sco_codec_nego(a, true);
        assert_eq!(m.state(), ScoState::Opening);

        // The timer fires after the answer already arrived.
        m.on_negotiation_timeout(a);
        assert_eq!(m.state(), ScoState::Opening);
        assert!(m.observer.closes.is_empty());
    }

    #[test]
    fn test_negotiation_timer_cleared_on_transfer_out_of_codec_state() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xA9, 11);
        let b = connected_peer(&mut m, 0xB9, 12);
        m.set_codec_preference(a, ScoCodec::Msbc).unwrap();

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        assert_eq!(m.negotiation_pending(), Some(a));

        // Opening toward B while A negotiates is a transfer request.
        m.sco_open(b).unwrap();
        assert_eq!(m.state(), ScoState::TransferOriginate);
        assert_eq!(m.negotiation_pending(), None);
    }

    #[test]
    fn test_reject_on_resources() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xAA, 13);
        m.sco_listen(a).unwrap();
        let state = m.state();

        // Request from a peer with no service-level connection.
        m.on_conn_request(0x50, request_from(0x77));
        assert_eq!(m.state(), state);
        assert!(m.controller.ops.contains(&CtrlOp::Respond {
            idx: 0x50,
            response: ConnResponse::RejectResources,
        }));
    }

    #[test]
    fn test_round_trip_returns_to_listening() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xAB, 14);

        let idx = open_cvsd(&mut m, a);

        m.sco_close(a).unwrap();
        assert_eq!(m.state(), ScoState::Closing);

        m.controller.connected = None;
        m.on_disc_complete(idx);
        assert_eq!(m.state(), ScoState::Listening);
        assert_eq!(m.sco.curr_scb, None);
        assert_eq!(m.sco.xfer_scb, None);
        // The peer is back on a fresh accept slot.
        assert_eq!(
            m.registry.get(a).unwrap().sco_idx,
            m.controller.last_created()
        );
        assert_eq!(m.observer.opens.len(), 1);
        assert_eq!(m.observer.closes.len(), 1);
        assert!(m.callout.events.contains(&CoEvent::ScoReleased));
    }

    #[test]
    fn test_out_of_table_events_are_ignored() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xAC, 15);

        // Open before anything is listening.
        m.sco_open(a).unwrap();
        assert_eq!(m.state(), ScoState::Shutdown);
        assert!(m.controller.ops.is_empty());

        // Close with no connection is swallowed before the machine.
        m.sco_close(a).unwrap();
        assert_eq!(m.state(), ScoState::Shutdown);
    }

    #[test]
    fn test_unknown_conn_complete_recovers_to_shutdown() {
        let mut m = manager(AgScoConfig::default());
        connected_peer(&mut m, 0xAD, 16);

        m.on_conn_complete(0x99);
        assert_eq!(m.state(), ScoState::Shutdown);
        assert_eq!(m.sco.curr_scb, None);
        assert!(m.controller.ops.contains(&CtrlOp::Remove(0x99)));
    }

    #[test]
    fn test_disc_with_invalid_stored_index_matches_anyway() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xAE, 17);

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        // The attempt is paused before the controller assigned a handle.
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(m.registry.get(a).unwrap().sco_idx, INVALID_SCO_INDEX);

        m.on_disc_complete(0x42);
        // Treated as the failure of the current eSCO attempt, which is
        // retried once with plain SCO packet types.
        assert_eq!(m.state(), ScoState::Opening);
        assert!(!m.registry.get(a).unwrap().retry_with_sco_only);
        let setups = m
            .callout
            .events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    CoEvent::AudioState {
                        state: AudioState::Setup,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(setups, 2);
    }

    #[test]
    fn test_disc_for_other_connection_is_ignored() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xAF, 18);

        let idx = open_cvsd(&mut m, a);
        m.on_disc_complete(idx + 17);
        assert_eq!(m.state(), ScoState::Open);
        assert!(m.is_open(a));
    }

    #[test]
    fn test_outbound_frames_flow_only_when_open() {
        let config = AgScoConfig {
            audio_routed_through_host: true,
            ..AgScoConfig::default()
        };
        let mut m = manager(config);
        let a = connected_peer(&mut m, 0xB0, 19);

        // Frames before the link is up are dropped.
        let mut frame = ScoFrame::new();
        frame.extend_from_slice(&[0u8; 48]).unwrap();
        m.callout.outbound.push_back(frame.clone()).ok();
        m.on_outbound_ready();
        assert!(!m
            .controller
            .ops
            .iter()
            .any(|op| matches!(op, CtrlOp::WriteAudio(_))));

        let idx = open_cvsd(&mut m, a);
        assert!(m.callout.events.contains(&CoEvent::HostOpen(a)));

        m.callout.outbound.push_back(frame.clone()).ok();
        m.callout.outbound.push_back(frame).ok();
        m.on_outbound_ready();
        let written = m
            .controller
            .ops
            .iter()
            .filter(|op| matches!(op, CtrlOp::WriteAudio(i) if *i == idx))
            .count();
        assert_eq!(written, 2);
    }

    #[test]
    fn test_inbound_frames_are_forwarded() {
        let config = AgScoConfig {
            audio_routed_through_host: true,
            ..AgScoConfig::default()
        };
        let mut m = manager(config);

        let mut frame = ScoFrame::new();
        frame.extend_from_slice(&[0u8; 60]).unwrap();
        m.on_inbound_audio(frame);
        assert_eq!(m.callout.inbound_lens.as_slice(), &[60]);
    }

    #[test]
    fn test_narrowband_only_wideband_disabled() {
        let config = AgScoConfig {
            wideband_enabled: false,
            ..AgScoConfig::default()
        };
        let mut m = manager(config);
        let a = connected_peer(&mut m, 0xB1, 20);
        // A wideband preference is ignored without wideband support.
        m.set_codec_preference(a, ScoCodec::Msbc).unwrap();

        m.sco_listen(a).unwrap();
        m.sco_open(a).unwrap();
        // No negotiation state: straight to the attempt.
        assert_eq!(m.state(), ScoState::Opening);
        assert_eq!(m.registry.get(a).unwrap().inuse_codec, Some(ScoCodec::Cvsd));
    }

    #[test]
    fn test_unregister_active_peer_tears_down_link() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xB7, 24);
        let b = connected_peer(&mut m, 0xB8, 25);

        let idx = open_cvsd(&mut m, a);

        m.unregister_peer(a).unwrap();
        assert!(m.controller.ops.contains(&CtrlOp::Remove(idx)));
        assert_eq!(m.sco.curr_scb, None);
        // B still has a block, so the machine returns to listening.
        assert_eq!(m.state(), ScoState::Listening);
        assert_eq!(m.observer.closes.as_slice(), &[(a, 24)]);
        assert!(m.registry.get(b).is_some());

        // The late disconnect for the removed link finds no owner and
        // changes nothing.
        m.controller.connected = None;
        m.on_disc_complete(idx);
        assert_eq!(m.state(), ScoState::Listening);
        assert_eq!(m.observer.closes.len(), 1);
    }

    #[test]
    fn test_unregister_last_active_peer_resets_to_shutdown() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xBA, 26);

        let idx = open_cvsd(&mut m, a);

        m.unregister_peer(a).unwrap();
        assert!(m.controller.ops.contains(&CtrlOp::Remove(idx)));
        assert_eq!(m.state(), ScoState::Shutdown);
        assert_eq!(m.observer.opens.len(), m.observer.closes.len());
    }

    #[test]
    fn test_shutdown_from_listening_is_immediate() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xB2, 21);

        m.sco_listen(a).unwrap();
        assert_eq!(m.state(), ScoState::Listening);

        m.service_disconnected(a).unwrap();
        m.sco_shutdown(a).unwrap();
        assert_eq!(m.state(), ScoState::Shutdown);
        assert_eq!(m.sco.curr_scb, None);
    }

    #[test]
    fn test_shutdown_keeps_listening_for_remaining_peer() {
        let mut m = manager(AgScoConfig::default());
        let a = connected_peer(&mut m, 0xB3, 22);
        let b = connected_peer(&mut m, 0xB6, 23);

        m.sco_listen(a).unwrap();
        m.sco_listen(b).unwrap();

        m.service_disconnected(a).unwrap();
        m.sco_shutdown(a).unwrap();
        // B still has a service connection, so the machine keeps listening.
        assert_eq!(m.state(), ScoState::Listening);
    }
}
