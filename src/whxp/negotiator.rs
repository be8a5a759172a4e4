//! Session description negotiation
//!
//! Creates the local offer, posts it to the WHIP/WHEP endpoint and applies
//! the answer. Failures other than `405` are retried after a fixed backoff
//! for as long as the connection is not closed; the `closed` state on the
//! watch channel is the only thing that stops the loop.

use super::engine::{ConnectionState, PeerConnection};
use super::signaling::{resolve_location, SignalingTransport};
use super::WhxpError;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default pause between failed attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Result of one negotiation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Answer applied; carries the `Location` of the session resource
    Established(Option<String>),
    /// Endpoint refused the method (HTTP 405)
    Rejected(WhxpError),
    /// Connection closed before an answer was applied
    Aborted,
    /// A description could not be created or applied
    Failed(WhxpError),
}

impl NegotiationOutcome {
    pub fn location(&self) -> Option<&str> {
        match self {
            NegotiationOutcome::Established(location) => location.as_deref(),
            _ => None,
        }
    }
}

/// Offer/answer driver with retry
#[derive(Clone)]
pub struct Negotiator {
    signaling: Arc<dyn SignalingTransport>,
    backoff: Duration,
    offer_committed: Option<Arc<AtomicBool>>,
}

impl Negotiator {
    pub fn new(signaling: Arc<dyn SignalingTransport>, backoff: Duration) -> Self {
        Self {
            signaling,
            backoff,
            offer_committed: None,
        }
    }

    /// Raise `flag` once the local offer of a cycle has been committed
    pub fn with_offer_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.offer_committed = Some(flag);
        self
    }

    /// Run one negotiation cycle against `endpoint`.
    ///
    /// The offer is created and committed once; every retry resends the
    /// same committed text.
    pub async fn negotiate(
        &self,
        connection: &dyn PeerConnection,
        mut state: watch::Receiver<ConnectionState>,
        endpoint: &str,
        token: &str,
    ) -> NegotiationOutcome {
        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                error!("Failed to create offer for {}: {}", endpoint, e);
                return NegotiationOutcome::Failed(e);
            }
        };
        let offer = match connection.set_local_description(&offer).await {
            Ok(committed) => committed,
            Err(e) => {
                error!("Failed to commit local offer for {}: {}", endpoint, e);
                return NegotiationOutcome::Failed(e);
            }
        };
        if let Some(flag) = &self.offer_committed {
            flag.store(true, Ordering::SeqCst);
        }
        debug!("whxp client offer sdp:\n{}", offer);

        let mut attempt: u32 = 0;
        while !is_closed(&state) {
            attempt += 1;
            match self.signaling.post_offer(endpoint, token, &offer).await {
                Ok(response) if response.status == 201 => {
                    if is_closed(&state) {
                        info!("Connection closed while {} answered, releasing session", endpoint);
                        self.release(endpoint, response.location.as_deref()).await;
                        return NegotiationOutcome::Aborted;
                    }
                    debug!("whxp client answer sdp:\n{}", response.body);
                    if let Err(e) = connection.set_remote_description(&response.body).await {
                        error!("Failed to apply answer from {}: {}", endpoint, e);
                        self.release(endpoint, response.location.as_deref()).await;
                        return NegotiationOutcome::Failed(e);
                    }
                    if response.location.is_none() {
                        warn!("{} answered without a Location header, teardown will skip DELETE", endpoint);
                    }
                    info!("Negotiated with {} after {} attempt(s)", endpoint, attempt);
                    return NegotiationOutcome::Established(response.location);
                }
                Ok(response) if response.status == 405 => {
                    let err = WhxpError::Configuration(format!(
                        "{} answered 405 Method Not Allowed, update the URL passed into the WHIP or WHEP client",
                        endpoint
                    ));
                    error!("{}", err);
                    return NegotiationOutcome::Rejected(err);
                }
                Ok(response) => {
                    let err = WhxpError::TransientSignaling(format!(
                        "{} answered {}: {}",
                        endpoint,
                        response.status,
                        response.body.trim()
                    ));
                    error!("Attempt {}: {}", attempt, err);
                }
                Err(e) => {
                    error!("Attempt {}: {}", attempt, e);
                }
            }

            if !self.wait_backoff(&mut state).await {
                break;
            }
        }

        info!("Negotiation with {} stopped, connection closed", endpoint);
        NegotiationOutcome::Aborted
    }

    /// Sleep for the backoff. Returns `false` if the connection closed first.
    async fn wait_backoff(&self, state: &mut watch::Receiver<ConnectionState>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => true,
            _ = state.wait_for(|s| *s == ConnectionState::Closed) => false,
        }
    }

    /// Best-effort DELETE of a resource whose answer was never applied
    async fn release(&self, endpoint: &str, location: Option<&str>) {
        let Some(location) = location else {
            return;
        };
        let url = match resolve_location(endpoint, location) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot release session {}: {}", location, e);
                return;
            }
        };
        match self.signaling.delete_session(&url).await {
            Ok(status) => debug!("Released unused session {} ({})", url, status),
            Err(e) => warn!("Failed to release unused session {}: {}", url, e),
        }
    }
}

fn is_closed(state: &watch::Receiver<ConnectionState>) -> bool {
    *state.borrow() == ConnectionState::Closed
}
