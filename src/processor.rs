//! Processor task.
//!
//! One task owns the whole audio link core and serializes everything that
//! can touch it: application requests, controller callbacks and the codec
//! negotiation deadline. Because each event runs to completion here, the
//! core itself needs no locks and never blocks.

use embassy_futures::select::{select3, Either3};
use embassy_time::{Duration, Instant, Timer};

use crate::callout::{AgCallout, ScoObserver};
use crate::controller::SyncController;
use crate::scb::ScbHandle;
use crate::sco::ScoManager;
use crate::{AgScoConfig, CONTROLLER_CHANNEL, REQUEST_CHANNEL, RESPONSE_CHANNEL};

/// Run the audio link core.
///
/// Controller callbacks take priority over application requests, and the
/// codec negotiation deadline is kept in step with the core after every
/// event.
pub async fn sco_event_processor<C, CO, OB>(
    controller: C,
    callout: CO,
    observer: OB,
    config: AgScoConfig,
) -> !
where
    C: SyncController,
    CO: AgCallout,
    OB: ScoObserver,
{
    let timeout = Duration::from_millis(u64::from(config.codec_negotiation_timeout_ms));
    let mut manager = ScoManager::new(config, controller, callout, observer);

    let signal_rx = CONTROLLER_CHANNEL.receiver();
    let request_rx = REQUEST_CHANNEL.receiver();
    let response_tx = RESPONSE_CHANNEL.sender();

    let mut deadline: Option<(ScbHandle, Instant)> = None;

    loop {
        let negotiation_timer = async {
            match deadline {
                Some((_, at)) => Timer::at(at).await,
                None => core::future::pending().await,
            }
        };

        let event =
            select3(signal_rx.receive(), request_rx.receive(), negotiation_timer).await;
        match event {
            Either3::First(signal) => {
                manager.handle_signal(signal);
            }
            Either3::Second(request) => {
                let response = manager.handle_request(request);
                response_tx.send(response).await;
            }
            Either3::Third(()) => {
                if let Some((handle, _)) = deadline.take() {
                    manager.on_negotiation_timeout(handle);
                }
            }
        }

        // Keep the one-shot negotiation timer in step with the core.
        deadline = match (manager.negotiation_pending(), deadline) {
            (Some(handle), None) => Some((handle, Instant::now() + timeout)),
            (Some(handle), Some((armed, at))) => {
                if handle == armed {
                    Some((armed, at))
                } else {
                    Some((handle, Instant::now() + timeout))
                }
            }
            (None, _) => None,
        };
    }
}
