//! Reassembly ledger: the protocol state machine without any I/O
//!
//! Outgoing requests, keyed by request id:
//!
//! ```text
//! NoRequest -> RequestSent -> AwaitingResponse -> ResponseReady -> Reassembled
//! ```
//!
//! `RequestSent` means created here but not yet seen on the relay; `AwaitingResponse`
//! means the relay has echoed it back. Incoming requests from other devices go
//! `RequestObserved -> Responded`.
//!
//! Every transition is [`ReassemblyLedger::apply`]. Closed request ids and consumed
//! response ids are remembered, so replaying any relay snapshot is a no-op.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::domain::{DeviceId, ProtocolConfig, RequestId, ResponseId};
use crate::protocol::{ReassemblyRequest, ReassemblyResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    NoRequest,
    RequestSent,
    AwaitingResponse,
    ResponseReady,
    Reassembled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    RequestObserved,
    Responded,
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    /// This device built and published a request
    RequestCreated(ReassemblyRequest),
    /// A request was seen on the relay (from any device)
    RequestObserved(ReassemblyRequest),
    /// A response was seen on the relay
    ResponseObserved(ReassemblyResponse),
    /// This device answered an incoming request
    Responded(RequestId),
    /// A filled response was turned into the secret
    Finished(ResponseId),
    /// A filled response failed to open; its request goes back to waiting
    ResponseRejected(ResponseId),
    /// Drop everything whose request timestamp is no longer fresh at `now`
    Expired { now: u64, config: ProtocolConfig },
}

/// A self-originated request together with the response that answers it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilledResponse {
    pub request: ReassemblyRequest,
    pub response: ReassemblyResponse,
}

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDiff {
    /// Other devices' requests seen for the first time
    pub incoming: Vec<RequestId>,
    /// Own requests confirmed on the relay
    pub echoed: Vec<RequestId>,
    /// Responses now ready to finish
    pub filled: Vec<ResponseId>,
    /// Request ids dropped for age
    pub expired: Vec<RequestId>,
}

impl ReconcileDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty()
            && self.echoed.is_empty()
            && self.filled.is_empty()
            && self.expired.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Outgoing {
    request: ReassemblyRequest,
    echoed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Incoming {
    request: ReassemblyRequest,
    responded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyLedger {
    self_device: DeviceId,
    outgoing: BTreeMap<RequestId, Outgoing>,
    incoming: BTreeMap<RequestId, Incoming>,
    filled: BTreeMap<ResponseId, FilledResponse>,
    closed: BTreeSet<RequestId>,
    consumed: BTreeSet<ResponseId>,
    reassembled: BTreeSet<RequestId>,
}

impl ReassemblyLedger {
    #[must_use]
    pub fn new(self_device: DeviceId) -> Self {
        Self {
            self_device,
            outgoing: BTreeMap::new(),
            incoming: BTreeMap::new(),
            filled: BTreeMap::new(),
            closed: BTreeSet::new(),
            consumed: BTreeSet::new(),
            reassembled: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn self_device(&self) -> DeviceId {
        self.self_device
    }

    /// Returns the state after `event`
    #[must_use]
    pub fn apply(mut self, event: LedgerEvent) -> Self {
        match event {
            LedgerEvent::RequestCreated(request) => {
                if request.requester == self.self_device
                    && !self.closed.contains(&request.uuid)
                    && !self.outgoing.contains_key(&request.uuid)
                {
                    debug!(request = %request.uuid, "request sent");
                    self.outgoing.insert(
                        request.uuid,
                        Outgoing {
                            request,
                            echoed: false,
                        },
                    );
                }
            }
            LedgerEvent::RequestObserved(request) => self.observe_request(request),
            LedgerEvent::ResponseObserved(response) => self.observe_response(response),
            LedgerEvent::Responded(request_id) => {
                if let Some(incoming) = self.incoming.get_mut(&request_id) {
                    debug!(request = %request_id, "responded");
                    incoming.responded = true;
                }
            }
            LedgerEvent::Finished(response_id) => {
                if let Some(filled) = self.filled.remove(&response_id) {
                    debug!(response = %response_id, "reassembled");
                    self.consumed.insert(response_id);
                    self.reassembled.insert(filled.request.uuid);
                }
            }
            LedgerEvent::ResponseRejected(response_id) => {
                if let Some(filled) = self.filled.remove(&response_id) {
                    debug!(response = %response_id, "response rejected, request reopened");
                    self.consumed.insert(response_id);
                    self.closed.remove(&filled.request.uuid);
                    self.outgoing.insert(
                        filled.request.uuid,
                        Outgoing {
                            request: filled.request,
                            echoed: true,
                        },
                    );
                }
            }
            LedgerEvent::Expired { now, config } => {
                self.expire(now, &config);
            }
        }
        self
    }

    fn observe_request(&mut self, request: ReassemblyRequest) {
        if self.closed.contains(&request.uuid) || self.reassembled.contains(&request.uuid) {
            return;
        }

        if request.requester == self.self_device {
            match self.outgoing.get_mut(&request.uuid) {
                Some(outgoing) => outgoing.echoed = true,
                None => {
                    debug!(request = %request.uuid, "recovered own request from relay");
                    self.outgoing.insert(
                        request.uuid,
                        Outgoing {
                            request,
                            echoed: true,
                        },
                    );
                }
            }
        } else if !self.incoming.contains_key(&request.uuid) {
            debug!(request = %request.uuid, requester = %request.requester, "request observed");
            self.incoming.insert(
                request.uuid,
                Incoming {
                    request,
                    responded: false,
                },
            );
        }
    }

    fn observe_response(&mut self, response: ReassemblyResponse) {
        if self.consumed.contains(&response.uuid) || self.filled.contains_key(&response.uuid) {
            return;
        }
        if response.responder == self.self_device {
            return;
        }
        let matches = self.outgoing.get(&response.request_id).is_some_and(|o| {
            o.request.secret_id == response.secret_id
        });
        if !matches {
            return;
        }

        if let Some(outgoing) = self.outgoing.remove(&response.request_id) {
            debug!(request = %response.request_id, response = %response.uuid, "response ready");
            self.closed.insert(response.request_id);
            self.filled.insert(
                response.uuid,
                FilledResponse {
                    request: outgoing.request,
                    response,
                },
            );
        }
    }

    fn expire(&mut self, now: u64, config: &ProtocolConfig) {
        let stale_out: Vec<RequestId> = self
            .outgoing
            .iter()
            .filter(|(_, o)| !config.is_fresh(o.request.timestamp, now))
            .map(|(id, _)| *id)
            .collect();
        for id in stale_out {
            debug!(request = %id, "own request expired");
            self.outgoing.remove(&id);
            self.closed.insert(id);
        }

        let stale_in: Vec<RequestId> = self
            .incoming
            .iter()
            .filter(|(_, i)| !config.is_fresh(i.request.timestamp, now))
            .map(|(id, _)| *id)
            .collect();
        for id in stale_in {
            self.incoming.remove(&id);
            self.closed.insert(id);
        }

        let stale_filled: Vec<ResponseId> = self
            .filled
            .iter()
            .filter(|(_, f)| !config.is_fresh(f.request.timestamp, now))
            .map(|(id, _)| *id)
            .collect();
        for id in stale_filled {
            debug!(response = %id, "filled response expired");
            self.filled.remove(&id);
            self.consumed.insert(id);
        }
    }

    /// Folds one relay snapshot into the ledger, then expires stale entries
    ///
    /// Requests are applied before responses so a response can match a request first
    /// seen in the same snapshot.
    #[must_use]
    pub fn reconcile(
        self,
        requests: Vec<ReassemblyRequest>,
        responses: Vec<ReassemblyResponse>,
        now: u64,
        config: ProtocolConfig,
    ) -> (Self, ReconcileDiff) {
        let incoming_before: BTreeSet<RequestId> = self.incoming.keys().copied().collect();
        let echoed_before: BTreeSet<RequestId> = self
            .outgoing
            .iter()
            .filter(|(_, o)| o.echoed)
            .map(|(id, _)| *id)
            .collect();
        let filled_before: BTreeSet<ResponseId> = self.filled.keys().copied().collect();
        let closed_before = self.closed.clone();

        let mut ledger = self;
        for request in requests {
            ledger = ledger.apply(LedgerEvent::RequestObserved(request));
        }
        let seen_echoed: Vec<RequestId> = ledger
            .outgoing
            .iter()
            .filter(|(id, o)| o.echoed && !echoed_before.contains(id))
            .map(|(id, _)| *id)
            .collect();
        for response in responses {
            ledger = ledger.apply(LedgerEvent::ResponseObserved(response));
        }
        let filled_now: BTreeSet<RequestId> =
            ledger.filled.values().map(|f| f.request.uuid).collect();

        ledger = ledger.apply(LedgerEvent::Expired { now, config });

        let diff = ReconcileDiff {
            incoming: ledger
                .incoming
                .keys()
                .filter(|id| !incoming_before.contains(id))
                .copied()
                .collect(),
            echoed: seen_echoed
                .into_iter()
                .filter(|id| ledger.outgoing.contains_key(id) || filled_now.contains(id))
                .collect(),
            filled: ledger
                .filled
                .keys()
                .filter(|id| !filled_before.contains(id))
                .copied()
                .collect(),
            expired: ledger
                .closed
                .iter()
                .filter(|id| !closed_before.contains(id) && !filled_now.contains(id))
                .copied()
                .collect(),
        };
        (ledger, diff)
    }

    #[must_use]
    pub fn outgoing_state(&self, request_id: &RequestId) -> OutgoingState {
        if self.reassembled.contains(request_id) {
            return OutgoingState::Reassembled;
        }
        if self.filled.values().any(|f| f.request.uuid == *request_id) {
            return OutgoingState::ResponseReady;
        }
        match self.outgoing.get(request_id) {
            Some(o) if o.echoed => OutgoingState::AwaitingResponse,
            Some(_) => OutgoingState::RequestSent,
            None => OutgoingState::NoRequest,
        }
    }

    #[must_use]
    pub fn incoming_state(&self, request_id: &RequestId) -> Option<IncomingState> {
        self.incoming.get(request_id).map(|i| {
            if i.responded {
                IncomingState::Responded
            } else {
                IncomingState::RequestObserved
            }
        })
    }

    /// Own requests still waiting for a response
    pub fn self_open_requests(&self) -> impl Iterator<Item = &ReassemblyRequest> {
        self.outgoing.values().map(|o| &o.request)
    }

    /// Other devices' requests not yet answered by this device
    pub fn others_open_requests(&self) -> impl Iterator<Item = &ReassemblyRequest> {
        self.incoming
            .values()
            .filter(|i| !i.responded)
            .map(|i| &i.request)
    }

    /// Responses ready to finish
    pub fn filled_responses(&self) -> impl Iterator<Item = &FilledResponse> {
        self.filled.values()
    }

    #[must_use]
    pub fn filled(&self, response_id: &ResponseId) -> Option<&FilledResponse> {
        self.filled.get(response_id)
    }

    /// An unanswered request from another device
    #[must_use]
    pub fn open_incoming(&self, request_id: &RequestId) -> Option<&ReassemblyRequest> {
        self.incoming
            .get(request_id)
            .filter(|i| !i.responded)
            .map(|i| &i.request)
    }

    /// Whether `request_id` was closed, expired or reassembled; re-observing it is a no-op
    #[must_use]
    pub fn is_settled(&self, request_id: &RequestId) -> bool {
        self.closed.contains(request_id) || self.reassembled.contains(request_id)
    }

    /// Drops settled ids that are absent from the latest relay snapshot
    ///
    /// Requests still answered by a filled response stay closed whether or not the
    /// relay returned them.
    #[must_use]
    pub fn forget_absent(
        mut self,
        requests: &BTreeSet<RequestId>,
        responses: &BTreeSet<ResponseId>,
    ) -> Self {
        let filled: BTreeSet<RequestId> = self.filled.values().map(|f| f.request.uuid).collect();
        let before = self.closed.len() + self.reassembled.len() + self.consumed.len();

        self.closed
            .retain(|id| requests.contains(id) || filled.contains(id));
        self.reassembled.retain(|id| requests.contains(id));
        self.consumed.retain(|id| responses.contains(id));

        let forgotten = before - (self.closed.len() + self.reassembled.len() + self.consumed.len());
        if forgotten > 0 {
            debug!(forgotten, "forgot settled ids no longer on the relay");
        }
        self
    }

    /// Ids of own requests that could still be answered
    #[must_use]
    pub fn outgoing_ids(&self) -> Vec<RequestId> {
        self.outgoing.keys().copied().collect()
    }
}
