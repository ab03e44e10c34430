//! The audio link state machine.
//!
//! One global state machine controls the lifecycle of the single active
//! SCO/eSCO link: listening, codec negotiation, originate and accept,
//! transfer between peers, teardown and shutdown. Controller progress is
//! reported back as `ConnOpen`/`ConnClose` events, so every long-running
//! operation is expressed as a pair of transitions rather than a wait.
//!
//! Event and state combinations outside the transition table are logged
//! and ignored; they are never fatal.

use crate::callout::{AgCallout, AudioState, ScoObserver, SetupResult};
use crate::codec::{
    pkt_types, CodingFormat, EscoParameters, MsbcParameterSet, RetransmissionEffort, ScoCodec,
};
use crate::constants::{HFP_VERSION_1_5, INVALID_SCO_INDEX};
use crate::controller::{ConnResponse, CreateStatus, RemoveStatus, SyncController};
use crate::scb::{AgFeatures, PeerFeatures, ScbHandle, ServiceControlBlock};

use super::ScoManager;

/// States of the audio link state machine.
///
/// `CodecNegotiation` is only reachable when wideband support is enabled in
/// the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScoState {
    /// No listening connections, no link.
    Shutdown,
    /// Accept slots open for the registered peers.
    Listening,
    /// Codec agreement with the peer is in progress.
    CodecNegotiation,
    /// A connection attempt is in flight.
    Opening,
    /// A close was requested while the attempt is still in flight.
    OpeningClosePending,
    /// A peer request preempted the active link; waiting for the active
    /// link to close before accepting.
    TransferAccept,
    /// The link is up.
    Open,
    /// Teardown is in flight.
    Closing,
    /// A reopen was requested while teardown is in flight.
    ClosingOpenPending,
    /// The active link is closing to make room for an originate to the
    /// transfer target.
    TransferOriginate,
    /// Tearing everything down.
    ShuttingDown,
}

/// Events driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScoEvent {
    /// Open an accept slot for a peer.
    Listen,
    /// Originate a connection to a peer.
    Open,
    /// The platform finished its pre-connection setup.
    OpenPending,
    /// Move the link to another peer.
    Transfer,
    /// Codec negotiation finished.
    CodecDone,
    /// Retry the failed attempt with the next weaker codec configuration.
    Reopen,
    /// Close the link.
    Close,
    /// Tear down everything for a peer.
    Shutdown,
    /// The controller reports the link up.
    ConnOpen,
    /// The controller reports the link down.
    ConnClose,
}

/// CVSD parameters for one attempt, degraded to short-latency SCO when
/// either side lacks eSCO support.
pub(crate) fn cvsd_attempt_params(scb: &ServiceControlBlock) -> EscoParameters {
    let mut params = EscoParameters::cvsd();
    if !scb.features.supports(AgFeatures::ESCO) || !scb.peer_features.supports(PeerFeatures::ESCO)
    {
        params.max_latency_ms = 10;
        params.retransmission_effort = RetransmissionEffort::Power;
    }
    params
}

/// Whether the next wideband attempt for this block should use the T1 safe
/// settings.
pub(crate) fn attempt_msbc_safe_settings(scb: &ServiceControlBlock) -> bool {
    scb.svc_conn
        && scb.sco_codec == ScoCodec::Msbc
        && scb.codec_msbc_settings == MsbcParameterSet::T1
}

impl<C, CO, OB> ScoManager<C, CO, OB>
where
    C: SyncController,
    CO: AgCallout,
    OB: ScoObserver,
{
    /// Run one event through the state machine.
    pub(crate) fn sco_event(&mut self, handle: ScbHandle, event: ScoEvent) {
        if self.registry.get(handle).is_none() {
            warn!("sco event {:?} for unknown scb {}", event, handle);
            return;
        }

        let in_state = self.sco.state;
        debug!("sco event {:?} in state {:?} (scb {})", event, in_state, handle);

        // Negotiation is kicked off after the transition completes, the way
        // the state is left decides whether it happens at all.
        let mut negotiate: Option<ScbHandle> = None;
        let wbs = self.config.wideband_enabled;

        match in_state {
            ScoState::Shutdown => match event {
                ScoEvent::Listen => {
                    self.create_sco(handle, false);
                    self.sco.state = ScoState::Listening;
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::Listening => match event {
                ScoEvent::Listen => {
                    // Additional accept slot for a second peer.
                    self.create_sco(handle, false);
                }
                ScoEvent::Open => {
                    self.remove_sco(handle, false);
                    if wbs {
                        self.sco.state = ScoState::CodecNegotiation;
                        negotiate = Some(handle);
                    } else {
                        self.create_sco(handle, true);
                        self.sco.state = ScoState::Opening;
                    }
                }
                ScoEvent::Shutdown => {
                    self.remove_sco(handle, false);
                    if self.sco.curr_scb == Some(handle) {
                        self.sco.curr_scb = None;
                    }
                    if !self.registry.other_in_use(handle) {
                        self.sco.state = ScoState::Shutdown;
                    }
                }
                ScoEvent::Close => {
                    // Keep listening for the active service connection.
                    self.ignore(in_state, event);
                }
                ScoEvent::ConnClose => {
                    self.create_sco(handle, false);
                    self.sco.state = ScoState::Listening;
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::CodecNegotiation => match event {
                ScoEvent::Listen => {
                    self.create_sco(handle, false);
                }
                ScoEvent::CodecDone => {
                    self.create_sco(handle, true);
                    self.sco.state = ScoState::Opening;
                }
                ScoEvent::Transfer => {
                    self.sco.xfer_scb = Some(handle);
                    self.sco.state = ScoState::TransferOriginate;
                }
                ScoEvent::Shutdown => {
                    self.remove_sco(handle, false);
                    if self.sco.curr_scb == Some(handle) {
                        self.sco.curr_scb = None;
                    }
                    if !self.registry.other_in_use(handle) {
                        self.sco.state = ScoState::Shutdown;
                    }
                }
                ScoEvent::Close => {
                    // The attempt never reached the controller.
                    self.sco.state = ScoState::Listening;
                }
                ScoEvent::ConnClose => {
                    self.create_sco(handle, false);
                    self.sco.state = ScoState::Listening;
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::Opening => match event {
                ScoEvent::Listen => {
                    if self.sco.curr_scb != Some(handle) {
                        self.create_sco(handle, false);
                    }
                }
                ScoEvent::Reopen => {
                    if wbs {
                        self.sco.state = ScoState::CodecNegotiation;
                        negotiate = Some(handle);
                    } else {
                        self.ignore(in_state, event);
                    }
                }
                ScoEvent::OpenPending => {
                    let is_local = self.sco.is_local;
                    self.create_pending_sco(handle, is_local);
                }
                ScoEvent::Transfer => {
                    self.sco.xfer_scb = Some(handle);
                    self.sco.state = ScoState::TransferOriginate;
                }
                ScoEvent::Close => {
                    self.sco.state = ScoState::OpeningClosePending;
                }
                ScoEvent::Shutdown => {
                    if self.sco.curr_scb != Some(handle) {
                        self.remove_sco(handle, false);
                    } else {
                        self.sco.state = ScoState::ShuttingDown;
                    }
                }
                ScoEvent::ConnOpen => {
                    self.sco.state = ScoState::Open;
                }
                ScoEvent::ConnClose => {
                    self.create_sco(handle, false);
                    self.sco.state = ScoState::Listening;
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::OpeningClosePending => match event {
                ScoEvent::Transfer => {
                    self.sco.xfer_scb = Some(handle);
                    self.sco.state = ScoState::TransferOriginate;
                }
                ScoEvent::Open => {
                    // The close was withdrawn before anything happened.
                    self.sco.state = ScoState::Opening;
                }
                ScoEvent::Shutdown => {
                    if self.sco.curr_scb != Some(handle) {
                        self.remove_sco(handle, false);
                    } else {
                        self.sco.state = ScoState::ShuttingDown;
                    }
                }
                ScoEvent::ConnOpen => {
                    // The link came up after all; close it.
                    self.remove_sco(handle, true);
                    self.sco.state = ScoState::Closing;
                }
                ScoEvent::ConnClose => {
                    self.sco.state = ScoState::Listening;
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::TransferAccept => match event {
                ScoEvent::Close => {
                    self.remove_sco(handle, true);
                    self.sco.state = ScoState::Closing;
                }
                ScoEvent::Shutdown => {
                    self.remove_sco(handle, false);
                    self.sco.state = ScoState::ShuttingDown;
                }
                ScoEvent::ConnClose => {
                    // The old link is gone: put its peer back in listen mode
                    // and accept the stashed request.
                    self.create_sco(handle, false);
                    if let Some(xfer) = self.sco.xfer_scb.take() {
                        let request = self.sco.conn_data.take();
                        self.sco_conn_rsp(xfer, request.as_ref());
                        self.sco.state = ScoState::Opening;
                        self.sco.curr_scb = Some(xfer);
                        self.sco.cur_idx = self
                            .registry
                            .get(xfer)
                            .map_or(INVALID_SCO_INDEX, |scb| scb.sco_idx);
                    }
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::Open => match event {
                ScoEvent::Listen => {
                    if self.sco.curr_scb != Some(handle) {
                        self.create_sco(handle, false);
                    }
                }
                ScoEvent::Transfer => {
                    if let Some(curr) = self.sco.curr_scb {
                        self.remove_sco(curr, true);
                    }
                    self.sco.xfer_scb = Some(handle);
                    self.sco.state = ScoState::TransferOriginate;
                }
                ScoEvent::Close => {
                    if self.remove_sco(handle, true) {
                        self.sco.state = ScoState::Closing;
                    }
                }
                ScoEvent::Shutdown => {
                    self.remove_sco(handle, false);
                    if self.sco.curr_scb == Some(handle) {
                        self.sco.state = ScoState::ShuttingDown;
                    }
                }
                ScoEvent::ConnClose => {
                    // Peer closed the link; go back to listening.
                    self.create_sco(handle, false);
                    self.sco.state = ScoState::Listening;
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::Closing => match event {
                ScoEvent::Listen => {
                    if self.sco.curr_scb != Some(handle) {
                        self.create_sco(handle, false);
                    }
                }
                ScoEvent::Open => {
                    self.sco.state = ScoState::ClosingOpenPending;
                }
                ScoEvent::Transfer => {
                    self.sco.xfer_scb = Some(handle);
                    self.sco.state = ScoState::TransferOriginate;
                }
                ScoEvent::Shutdown => {
                    if self.sco.curr_scb != Some(handle) {
                        self.remove_sco(handle, false);
                    } else {
                        self.sco.state = ScoState::ShuttingDown;
                    }
                }
                ScoEvent::ConnClose => {
                    self.create_sco(handle, false);
                    self.sco.state = ScoState::Listening;
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::ClosingOpenPending => match event {
                ScoEvent::Close => {
                    self.sco.state = ScoState::Closing;
                }
                ScoEvent::Shutdown => {
                    self.sco.state = ScoState::ShuttingDown;
                }
                ScoEvent::ConnClose => {
                    if wbs {
                        self.sco.state = ScoState::CodecNegotiation;
                        negotiate = Some(handle);
                    } else {
                        self.create_sco(handle, true);
                        self.sco.state = ScoState::Opening;
                    }
                }
                ScoEvent::Listen => {
                    if self.sco.curr_scb != Some(handle) {
                        self.create_sco(handle, false);
                    }
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::TransferOriginate => match event {
                ScoEvent::ConnOpen => {
                    // The link came up while we were trying to close it for
                    // the transfer; close it again.
                    self.remove_sco(handle, true);
                }
                ScoEvent::Close => {
                    self.sco.xfer_scb = None;
                    self.sco.state = ScoState::Closing;
                }
                ScoEvent::Shutdown => {
                    self.sco.xfer_scb = None;
                    self.sco.state = ScoState::ShuttingDown;
                }
                ScoEvent::ConnClose => {
                    // Old link gone: old peer back to listen, transfer target
                    // out of listen, then originate to it.
                    self.create_sco(handle, false);
                    if let Some(xfer) = self.sco.xfer_scb.take() {
                        self.remove_sco(xfer, false);
                        if wbs {
                            self.sco.state = ScoState::CodecNegotiation;
                            negotiate = Some(xfer);
                        } else {
                            self.create_sco(xfer, true);
                            self.sco.state = ScoState::Opening;
                        }
                    }
                }
                _ => self.ignore(in_state, event),
            },

            ScoState::ShuttingDown => match event {
                ScoEvent::ConnOpen => {
                    // Late arrival; close it and wait for the close event.
                    self.remove_sco(handle, true);
                }
                ScoEvent::ConnClose => {
                    if self.registry.other_in_use(handle) {
                        self.sco.state = ScoState::Listening;
                    } else {
                        self.sco.state = ScoState::Shutdown;
                    }

                    // If the peer's service connection survives, keep an
                    // accept slot open for it.
                    if self.registry.get(handle).is_some_and(|scb| scb.svc_conn) {
                        self.create_sco(handle, false);
                        self.sco.state = ScoState::Listening;
                    }

                    if self.sco.curr_scb == Some(handle) {
                        if let Some(scb) = self.registry.get_mut(handle) {
                            scb.sco_idx = INVALID_SCO_INDEX;
                        }
                        self.sco.curr_scb = None;
                    }
                }
                ScoEvent::Listen => {
                    if self.sco.curr_scb != Some(handle) {
                        self.create_sco(handle, false);
                    }
                }
                ScoEvent::Shutdown => {
                    if self.registry.other_in_use(handle) {
                        self.sco.state = ScoState::Listening;
                    } else {
                        self.sco.state = ScoState::Shutdown;
                    }
                    if self.sco.curr_scb == Some(handle) {
                        if let Some(scb) = self.registry.get_mut(handle) {
                            scb.sco_idx = INVALID_SCO_INDEX;
                        }
                        self.sco.curr_scb = None;
                    }
                }
                _ => self.ignore(in_state, event),
            },
        }

        // The negotiation timer is only valid inside CodecNegotiation.
        if self.sco.state != ScoState::CodecNegotiation {
            self.sco.nego_pending = None;
        }

        if self.sco.state != in_state {
            debug!("sco state {:?} -> {:?} on {:?}", in_state, self.sco.state, event);
        }

        if let Some(scb) = negotiate {
            self.codec_negotiate(scb);
        }
    }

    fn ignore(&self, state: ScoState, event: ScoEvent) {
        warn!("ignoring sco event {:?} in state {:?}", event, state);
    }

    /// Prepare a connection for a peer: an accept slot when
    /// `is_originator` is false, otherwise the setup phase of an originate.
    /// The originate itself is issued by [`Self::create_pending_sco`] once
    /// the platform reports its pre-connection setup done.
    pub(crate) fn create_sco(&mut self, handle: ScbHandle, is_originator: bool) {
        let Some(scb) = self.registry.get(handle).copied() else {
            return;
        };
        if scb.sco_idx != INVALID_SCO_INDEX {
            warn!("create: sco index {} already in use (scb {})", scb.sco_idx, handle);
            return;
        }

        let wbs = self.config.wideband_enabled;
        let mut esco_codec = ScoCodec::Cvsd;
        if wbs
            && scb.sco_codec == ScoCodec::Msbc
            && !scb.codec_fallback
            && !scb.retry_with_sco_only
        {
            esco_codec = ScoCodec::Msbc;
        }
        if wbs && scb.codec_fallback {
            if let Some(scb) = self.registry.get_mut(handle) {
                scb.codec_fallback = false;
                // The codec changed under the peer's feet; the attempt after
                // this one must renegotiate.
                scb.codec_updated = true;
            }
        }

        let mut params = EscoParameters::for_codec(esco_codec, scb.codec_msbc_settings);
        if esco_codec == ScoCodec::Cvsd {
            // 3-EV3 is not allowed for CVSD (erratum 2363).
            params.packet_types = self.config.sco_pkt_types | pkt_types::NO_3_EV3;
            if !scb.features.supports(AgFeatures::ESCO)
                || !scb.peer_features.supports(PeerFeatures::ESCO)
            {
                params.max_latency_ms = 10;
                params.retransmission_effort = RetransmissionEffort::Power;
            }
        }

        if is_originator {
            self.sco.is_local = true;

            // eSCO is only attempted against HFP 1.5 or later peers.
            if scb.peer_version >= HFP_VERSION_1_5 && !scb.retry_with_sco_only {
                self.controller.set_esco_mode(&params);
                let esco_requested = (params.packet_types & pkt_types::ESCO_LINK_ONLY) != 0
                    || (params.packet_types
                        & !(pkt_types::ESCO_LINK_ONLY | pkt_types::SCO_LINK_ONLY))
                        == pkt_types::NO_EDR_ESCO;
                if esco_requested {
                    // mSBC must never fall back to plain SCO.
                    let retry = esco_codec != ScoCodec::Msbc;
                    if let Some(scb) = self.registry.get_mut(handle) {
                        scb.retry_with_sco_only = retry;
                    }
                }
            } else {
                if scb.retry_with_sco_only {
                    debug!("retrying with SCO only (scb {})", handle);
                }
                if let Some(scb) = self.registry.get_mut(handle) {
                    scb.retry_with_sco_only = false;
                }
                self.controller.set_esco_mode(&params);
            }

            self.sco.curr_scb = Some(handle);
            // The preference may change while the link is open; remember what
            // this attempt actually uses.
            if let Some(scb) = self.registry.get_mut(handle) {
                scb.inuse_codec = Some(esco_codec);
            }
            self.callout.sco_in_use(scb.app_id, scb.peer_addr);

            // The platform finishes vendor-specific setup and resumes through
            // open_continue, which delivers OpenPending.
            self.callout
                .audio_state(handle, scb.app_id, AudioState::Setup, Some(esco_codec));
        } else {
            if let Some(scb) = self.registry.get_mut(handle) {
                scb.retry_with_sco_only = false;
            }
            let (idx, status) =
                self.controller
                    .create_sync(scb.peer_addr, false, params.packet_types);
            debug!("create listen (scb {}): idx {} status {:?}", handle, idx, status);
            if status == CreateStatus::Started {
                if let Some(scb) = self.registry.get_mut(handle) {
                    scb.sco_idx = idx;
                }
                self.controller.register_link_events(idx);
            }
        }
    }

    /// Issue the deferred controller commands for an attempt, once the
    /// platform's pre-connection setup reported back. Originates to the peer
    /// when the attempt is locally initiated, otherwise answers the peer's
    /// pending request.
    pub(crate) fn create_pending_sco(&mut self, handle: ScbHandle, is_local: bool) {
        let Some(scb) = self.registry.get(handle).copied() else {
            return;
        };
        let esco_codec = scb.inuse_codec;
        self.sco.curr_scb = Some(handle);
        self.sco.cur_idx = scb.sco_idx;

        if is_local {
            if self.sco.set_audio_status != SetupResult::Success {
                // Setup failed; fall back to listening for this peer.
                self.sco.state = ScoState::Listening;
                self.create_sco(handle, false);
                return;
            }

            let params = if esco_codec == Some(ScoCodec::Msbc) {
                if self.config.wideband_enabled
                    && scb.codec_msbc_settings == MsbcParameterSet::T2
                {
                    EscoParameters::msbc_t2()
                } else {
                    EscoParameters::msbc_t1()
                }
            } else {
                cvsd_attempt_params(&scb)
            };

            // Legacy controllers need the voice settings written up front.
            if self.config.wideband_enabled && !self.controller.supports_enhanced_setup() {
                let format = if esco_codec == Some(ScoCodec::Msbc) {
                    CodingFormat::Transparent
                } else {
                    CodingFormat::Cvsd
                };
                self.controller.write_voice_settings(format);
            }
            if self.config.audio_routed_through_host {
                self.controller.config_audio_path(params.input_data_path, true);
            }

            let (idx, status) =
                self.controller
                    .create_sync(scb.peer_addr, true, params.packet_types);
            debug!("create originate (scb {}): idx {} status {:?}", handle, idx, status);
            if status == CreateStatus::Started {
                if let Some(scb) = self.registry.get_mut(handle) {
                    scb.sco_idx = idx;
                }
                self.sco.cur_idx = idx;
            }
        } else {
            let params = cvsd_attempt_params(&scb);
            let response = if self.sco.set_audio_status == SetupResult::Success {
                ConnResponse::Accept
            } else {
                ConnResponse::RejectResources
            };
            self.controller
                .respond_conn_request(scb.sco_idx, response, Some(&params));
        }
    }

    /// Request teardown of a peer's connection. With `only_active`, only the
    /// connection driving the current attempt is removed. Returns whether a
    /// removal actually started.
    pub(crate) fn remove_sco(&mut self, handle: ScbHandle, only_active: bool) -> bool {
        let Some(scb) = self.registry.get(handle).copied() else {
            return false;
        };
        if scb.sco_idx == INVALID_SCO_INDEX {
            return false;
        }
        if only_active && scb.sco_idx != self.sco.cur_idx {
            return false;
        }

        let status = self.controller.remove_sync(scb.sco_idx);
        debug!("remove (scb {}): idx {} status {:?}", handle, scb.sco_idx, status);
        match status {
            RemoveStatus::Started => {
                // A connection is coming down; the close event must find it.
                self.sco.curr_scb = Some(handle);
                true
            }
            RemoveStatus::AlreadyGone | RemoveStatus::UnknownAddr => {
                if let Some(scb) = self.registry.get_mut(handle) {
                    scb.sco_idx = INVALID_SCO_INDEX;
                }
                false
            }
        }
    }

    /// Set up the accept of a peer-initiated connection request. The actual
    /// controller response follows on `OpenPending`, after the platform's
    /// pre-connection setup.
    pub(crate) fn sco_conn_rsp(
        &mut self,
        handle: ScbHandle,
        request: Option<&crate::controller::ConnRequestParams>,
    ) {
        let Some(scb) = self.registry.get(handle).copied() else {
            return;
        };
        self.sco.is_local = false;
        if let Some(request) = request {
            debug!("preparing accept of {:?} request (scb {})", request.link_type, handle);
        }

        if matches!(
            self.sco.state,
            ScoState::Listening | ScoState::TransferOriginate | ScoState::TransferAccept
        ) {
            self.callout.sco_in_use(scb.app_id, scb.peer_addr);
            // A peer-initiated connection is always narrowband.
            self.callout
                .audio_state(handle, scb.app_id, AudioState::Setup, Some(ScoCodec::Cvsd));
            if self.config.audio_routed_through_host {
                let params = cvsd_attempt_params(&scb);
                self.controller.config_audio_path(params.input_data_path, true);
            }
        }

        if let Some(scb) = self.registry.get_mut(handle) {
            scb.inuse_codec = None;
        }
    }
}
