//! Peer codec negotiation.
//!
//! Before a wideband originate, the gateway and the peer must agree on a
//! codec. The negotiator sends the codec-selection command through the AT
//! layer and waits, bounded by a one-shot timer, for the peer's
//! confirmation. Negotiation is skipped entirely when nothing changed since
//! the last agreement or the peer cannot negotiate.
//!
//! The negotiator owns no state beyond the timer flag; the state machine
//! decides what "done" means in each state.

use crate::callout::{AgCallout, ScoObserver};
use crate::scb::{PeerFeatures, ScbHandle};
use crate::controller::SyncController;

use super::machine::ScoEvent;
use super::ScoManager;

impl<C, CO, OB> ScoManager<C, CO, OB>
where
    C: SyncController,
    CO: AgCallout,
    OB: ScoObserver,
{
    /// Start codec negotiation for a peer, or skip it when the previous
    /// agreement still stands.
    pub(crate) fn codec_negotiate(&mut self, handle: ScbHandle) {
        self.sco.curr_scb = Some(handle);
        let Some(scb) = self.registry.get(handle).copied() else {
            return;
        };

        if (scb.codec_updated || scb.codec_fallback)
            && scb.peer_features.supports(PeerFeatures::CODEC_NEGOTIATION)
        {
            // Hold the link in active power mode until the connection is up.
            self.callout.set_busy(scb.app_id, scb.peer_addr);
            self.callout.send_codec_selection(handle, scb.sco_codec);

            // The processor task turns this into the negotiation deadline.
            self.sco.nego_pending = Some(handle);
        } else {
            debug!("codec unchanged, skipping negotiation (scb {})", handle);
            self.sco_codec_nego(handle, true);
        }
    }

    /// Deliver the peer's answer (or lack of one) to the state machine. On
    /// success the codec is considered agreed until the preference changes
    /// again; on failure the attempt is abandoned.
    pub fn sco_codec_nego(&mut self, handle: ScbHandle, ok: bool) {
        self.sco.nego_pending = None;

        if ok {
            if let Some(scb) = self.registry.get_mut(handle) {
                // Subsequent connections skip negotiation.
                scb.codec_updated = false;
            }
            self.sco_event(handle, ScoEvent::CodecDone);
        } else {
            self.sco_event(handle, ScoEvent::Close);
        }
    }

    /// Negotiation deadline expired. A stale expiry, delivered after the
    /// answer already arrived, is a no-op.
    pub fn on_negotiation_timeout(&mut self, handle: ScbHandle) {
        if self.sco.nego_pending != Some(handle) {
            debug!("stale negotiation timeout (scb {})", handle);
            return;
        }
        warn!("codec negotiation timed out (scb {})", handle);

        let app_id = self.registry.get(handle).map(|scb| scb.app_id);
        self.sco_codec_nego(handle, false);

        if let Some(app_id) = app_id {
            self.observer.audio_close(handle, app_id);
        }
    }

    /// Peer whose negotiation timer should be running, if any. The processor
    /// task polls this after every event to keep the deadline in step.
    #[must_use]
    pub fn negotiation_pending(&self) -> Option<ScbHandle> {
        self.sco.nego_pending
    }
}
