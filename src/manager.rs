//! Secret lifecycle and reassembly driver
//!
//! [`SecretManager`] owns this device's view of the world: the secrets it holds a share
//! of, and the [`ReassemblyLedger`]. It is the only code that talks to the relay, the
//! key store and local persistence on behalf of the protocol.
//!
//! Every share at rest is a self-envelope: sealed to this device's key-agreement key and
//! signed by its own signing key, whether the share was created here or received.
//!
//! Nothing here runs in the background. Callers decide when to invoke
//! [`SecretManager::refresh_secrets`] and [`SecretManager::refresh_reassembly`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::codec::{self, fields};
use crate::domain::{CharsetOptions, DeviceId, ProtocolConfig, RequestId, ResponseId, SecretId};
use crate::envelope::{self, EncryptedEnvelope};
use crate::error::{Error, Result, StoreError};
use crate::identity::IdentityDirectory;
use crate::keys::DeviceKeys;
use crate::protocol::{
    FilledResponse, LedgerEvent, ReassemblyLedger, ReassemblyRequest, ReassemblyResponse,
    ReconcileDiff, Rejection,
};
use crate::relay::{Predicate, RecordType, Relay};
use crate::sharing::{
    FieldElement, SharePoint, decode_share_value, encode_share_value, participant_x, reassemble,
    split_for_devices,
};
use crate::store::{SecretStore, load_json, save_json};

/// Local store key for the list of known secret ids
pub const SECRETS_KEY: &str = "secrets";

fn secret_key(secret_id: &SecretId) -> String {
    format!("secret.{secret_id}")
}

/// A share of a new secret on its way to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareTransferPacket {
    pub uuid: Uuid,
    pub secret_id: SecretId,
    pub title: String,
    pub recipient: DeviceId,
    pub sender: DeviceId,
    pub envelope: EncryptedEnvelope,
}

/// A secret this device holds a share of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSecret {
    pub secret_id: SecretId,
    pub title: String,
    self_envelope: EncryptedEnvelope,
}

impl LocalSecret {
    /// This device's share, sealed to itself
    #[must_use]
    pub fn self_envelope(&self) -> &EncryptedEnvelope {
        &self.self_envelope
    }
}

pub struct SecretManager<R, K, S> {
    relay: R,
    keys: K,
    store: S,
    config: ProtocolConfig,
    clock: Arc<dyn Clock>,
    secrets: BTreeMap<SecretId, LocalSecret>,
    ledger: ReassemblyLedger,
}

impl<R, K, S> SecretManager<R, K, S>
where
    R: Relay,
    K: DeviceKeys,
    S: SecretStore,
{
    /// Restores the local secret index from `store`
    ///
    /// The reassembly ledger starts empty; the next
    /// [`refresh_reassembly`](SecretManager::refresh_reassembly) recovers this device's
    /// own outstanding requests from the relay.
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the index lists a secret whose entry is missing or
    /// unreadable
    pub fn load(relay: R, keys: K, store: S) -> Result<Self> {
        let ids: Vec<SecretId> = load_json(&store, SECRETS_KEY)?.unwrap_or_default();
        let mut secrets = BTreeMap::new();
        for id in ids {
            let key = secret_key(&id);
            let secret: LocalSecret =
                load_json(&store, &key)?.ok_or(StoreError::Corrupt(key))?;
            secrets.insert(id, secret);
        }
        debug!(secrets = secrets.len(), "loaded secret index");

        let ledger = ReassemblyLedger::new(keys.identity().device_id);
        Ok(Self {
            relay,
            keys,
            store,
            config: ProtocolConfig::default(),
            clock: Arc::new(SystemClock),
            secrets,
            ledger,
        })
    }

    #[must_use]
    pub fn with_config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn self_id(&self) -> DeviceId {
        self.keys.identity().device_id
    }

    pub fn keys(&self) -> &K {
        &self.keys
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &ReassemblyLedger {
        &self.ledger
    }

    pub fn secrets(&self) -> impl Iterator<Item = &LocalSecret> {
        self.secrets.values()
    }

    #[must_use]
    pub fn secret(&self, secret_id: &SecretId) -> Option<&LocalSecret> {
        self.secrets.get(secret_id)
    }

    pub fn self_open_requests(&self) -> impl Iterator<Item = &ReassemblyRequest> {
        self.ledger.self_open_requests()
    }

    pub fn others_open_requests(&self) -> impl Iterator<Item = &ReassemblyRequest> {
        self.ledger.others_open_requests()
    }

    pub fn filled_responses(&self) -> impl Iterator<Item = &FilledResponse> {
        self.ledger.filled_responses()
    }

    fn transition(&mut self, event: LedgerEvent) {
        let fresh = ReassemblyLedger::new(self.ledger.self_device());
        let ledger = std::mem::replace(&mut self.ledger, fresh);
        self.ledger = ledger.apply(event);
    }

    fn persist_secret(&mut self, secret: LocalSecret) -> Result<()> {
        save_json(&self.store, &secret_key(&secret.secret_id), &secret)?;
        self.secrets.insert(secret.secret_id, secret);
        let ids: Vec<SecretId> = self.secrets.keys().copied().collect();
        save_json(&self.store, SECRETS_KEY, &ids)?;
        Ok(())
    }

    fn open_own_share(&self, secret_id: &SecretId, agreement: &K::Agreement) -> Result<FieldElement> {
        let secret = self
            .secrets
            .get(secret_id)
            .ok_or(Error::UnknownSecret(*secret_id))?;
        let plaintext = envelope::open(
            &secret.self_envelope,
            agreement,
            &self.keys.identity().signing_key,
        )?;
        Ok(decode_share_value(&plaintext)?)
    }

    /// Splits a fresh secret across this device and `participants`
    ///
    /// This device is always included. Every other participant gets its share as a
    /// [`ShareTransferPacket`] on the relay; this device's share is only persisted
    /// locally. Packets are published before anything is persisted, so a relay failure
    /// leaves no half-created secret behind on this device.
    ///
    /// # Errors
    /// - [`Error::UnknownDevice`] if a participant is missing from `directory`
    /// - a sharing error if fewer than two distinct devices take part
    /// - collaborator errors from the key store, relay or local store
    pub async fn create_secret<D>(
        &mut self,
        title: &str,
        participants: &[DeviceId],
        directory: &D,
    ) -> Result<SecretId>
    where
        D: IdentityDirectory + ?Sized,
    {
        let me = self.keys.identity().clone();

        let mut recipients = BTreeMap::new();
        for device in participants.iter().filter(|d| **d != me.device_id) {
            let identity = directory
                .identity(device)
                .ok_or(Error::UnknownDevice(*device))?;
            recipients.insert(*device, identity.encryption_key);
        }

        let mut devices: Vec<DeviceId> = recipients.keys().copied().collect();
        devices.push(me.device_id);
        let shares = split_for_devices(&devices)?;
        let own = shares
            .get(&me.device_id)
            .ok_or(Error::UnknownDevice(me.device_id))?;

        let secret_id = SecretId::new_random();
        let signer = self.keys.signer("Create a new secret").await?;

        let mut packets = Vec::with_capacity(recipients.len());
        for (device, recipient_key) in &recipients {
            let point = shares.get(device).ok_or(Error::UnknownDevice(*device))?;
            let envelope =
                envelope::seal(&encode_share_value(&point.y), recipient_key, &signer)?;
            packets.push(ShareTransferPacket {
                uuid: Uuid::new_v4(),
                secret_id,
                title: title.to_string(),
                recipient: *device,
                sender: me.device_id,
                envelope,
            });
        }
        let self_envelope =
            envelope::seal(&encode_share_value(&own.y), &me.encryption_key, &signer)?;

        for packet in &packets {
            self.relay.save(packet.to_record()).await?;
            debug!(secret = %secret_id, recipient = %packet.recipient, "share packet published");
        }

        self.persist_secret(LocalSecret {
            secret_id,
            title: title.to_string(),
            self_envelope,
        })?;
        info!(secret = %secret_id, devices = devices.len(), "secret created");
        Ok(secret_id)
    }

    /// Takes in a share addressed to this device
    ///
    /// The share is opened against the sender's signing key, checked to be a valid
    /// field element, and resealed to this device before it is stored. Returns
    /// `Ok(None)` when the secret is already known.
    ///
    /// # Errors
    /// - [`Error::NotAddressedToSelf`] if the packet is for another device
    /// - [`Error::UnknownDevice`] if the sender is not in `directory`
    /// - envelope and share-decoding errors for forged or corrupt packets
    /// - collaborator errors from the key store or local store
    pub async fn receive_share<D>(
        &mut self,
        packet: &ShareTransferPacket,
        directory: &D,
    ) -> Result<Option<SecretId>>
    where
        D: IdentityDirectory + ?Sized,
    {
        let me = self.keys.identity().clone();
        if packet.recipient != me.device_id {
            return Err(Error::NotAddressedToSelf(packet.recipient));
        }
        if self.secrets.contains_key(&packet.secret_id) {
            debug!(secret = %packet.secret_id, "share already held");
            return Ok(None);
        }
        let sender = directory
            .identity(&packet.sender)
            .ok_or(Error::UnknownDevice(packet.sender))?;

        let agreement = self.keys.key_agreement("Receive a new secret share").await?;
        let plaintext = envelope::open(&packet.envelope, &agreement, &sender.signing_key)?;
        decode_share_value(&plaintext)?;

        let signer = self.keys.signer("Store a new secret share").await?;
        let self_envelope = envelope::seal(&plaintext, &me.encryption_key, &signer)?;

        self.persist_secret(LocalSecret {
            secret_id: packet.secret_id,
            title: packet.title.clone(),
            self_envelope,
        })?;
        info!(secret = %packet.secret_id, sender = %packet.sender, "share received");
        Ok(Some(packet.secret_id))
    }

    /// Pulls share packets addressed to this device and receives the new ones
    ///
    /// Malformed, forged or undecryptable packets are logged and skipped.
    ///
    /// # Errors
    /// Returns relay, key-store and local-store failures
    pub async fn refresh_secrets<D>(&mut self, directory: &D) -> Result<Vec<SecretId>>
    where
        D: IdentityDirectory + ?Sized,
    {
        let me = self.self_id();
        let records = self
            .relay
            .query(
                RecordType::ShareTransferPacket,
                &Predicate::equals(fields::RECIPIENT_DEVICE_ID, me),
            )
            .await?;
        let packets: Vec<ShareTransferPacket> = codec::decode_all(&records);

        let mut received = Vec::new();
        for packet in packets {
            match self.receive_share(&packet, directory).await {
                Ok(Some(id)) => received.push(id),
                Ok(None) => {}
                Err(e) if e.is_record_fault() => {
                    warn!(packet = %packet.uuid, error = %e, "skipping share packet");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(received)
    }

    /// Publishes a signed request for other devices' shares of `secret_id`
    ///
    /// # Errors
    /// - [`Error::UnknownSecret`] if this device holds no share of the secret
    /// - collaborator errors from the key store or relay
    pub async fn request_reassembly(&mut self, secret_id: SecretId) -> Result<RequestId> {
        if !self.secrets.contains_key(&secret_id) {
            return Err(Error::UnknownSecret(secret_id));
        }

        let signer = self.keys.signer("Request secret reassembly").await?;
        let request =
            ReassemblyRequest::create(secret_id, self.self_id(), self.clock.now(), &signer)?;
        self.relay.save(request.to_record()).await?;

        let uuid = request.uuid;
        self.transition(LedgerEvent::RequestCreated(request));
        info!(request = %uuid, secret = %secret_id, "reassembly requested");
        Ok(uuid)
    }

    /// Answers another device's open request with this device's share
    ///
    /// The request is admitted again at response time: freshness first, then the
    /// requester's signature.
    ///
    /// # Errors
    /// - [`Error::UnknownRequest`] if `request_id` is not an unanswered request from
    ///   another device
    /// - [`Error::StaleRequest`] or [`Error::InvalidSignature`] if admission fails
    /// - [`Error::UnknownSecret`] if this device holds no share of the secret
    /// - envelope and collaborator errors
    pub async fn respond<D>(&mut self, request_id: RequestId, directory: &D) -> Result<ResponseId>
    where
        D: IdentityDirectory + ?Sized,
    {
        let request = self
            .ledger
            .open_incoming(&request_id)
            .cloned()
            .ok_or(Error::UnknownRequest(request_id))?;
        request.admit_or_err(self.clock.now(), &self.config, directory)?;

        let secret = self
            .secrets
            .get(&request.secret_id)
            .ok_or(Error::UnknownSecret(request.secret_id))?;
        let requester = directory
            .identity(&request.requester)
            .ok_or(Error::UnknownDevice(request.requester))?;

        let agreement = self
            .keys
            .key_agreement("Unlock share for another device")
            .await?;
        let plaintext = envelope::open(
            &secret.self_envelope,
            &agreement,
            &self.keys.identity().signing_key,
        )?;

        let signer = self.keys.signer("Send share to another device").await?;
        let envelope = envelope::seal(&plaintext, &requester.encryption_key, &signer)?;

        let response = ReassemblyResponse {
            uuid: ResponseId::new_random(),
            request_id,
            secret_id: request.secret_id,
            responder: self.self_id(),
            envelope,
        };
        self.relay.save(response.to_record()).await?;

        self.transition(LedgerEvent::Responded(request_id));
        info!(request = %request_id, response = %response.uuid, "responded to reassembly request");
        Ok(response.uuid)
    }

    /// Reconstructs the secret from a filled response and this device's own share
    ///
    /// Freshness is checked again here, so an old response cannot revive an expired
    /// exchange. A response whose envelope fails to open is dropped and its request goes
    /// back to waiting for another response.
    ///
    /// The response envelope's signature covers its ciphertext and keys but not the
    /// secret id. A relay that replays an older response from the same responder to
    /// this device, relabelled for another secret, yields a wrong value here rather
    /// than an error.
    ///
    /// # Errors
    /// - [`Error::UnknownResponse`] if `response_id` does not fill an open request
    /// - [`Error::StaleRequest`] if the request has aged out
    /// - [`Error::UnknownDevice`] if the responder is not in `directory`
    /// - envelope, sharing and collaborator errors
    pub async fn finish<D>(
        &mut self,
        response_id: ResponseId,
        directory: &D,
        options: CharsetOptions,
    ) -> Result<Zeroizing<String>>
    where
        D: IdentityDirectory + ?Sized,
    {
        let filled = self
            .ledger
            .filled(&response_id)
            .cloned()
            .ok_or(Error::UnknownResponse(response_id))?;
        let FilledResponse { request, response } = filled;

        let now = self.clock.now();
        if !self.config.is_fresh(request.timestamp, now) {
            self.transition(LedgerEvent::Expired {
                now,
                config: self.config,
            });
            return Err(Error::StaleRequest(request.uuid));
        }

        let responder = directory
            .identity(&response.responder)
            .ok_or(Error::UnknownDevice(response.responder))?;
        if !self.secrets.contains_key(&request.secret_id) {
            return Err(Error::UnknownSecret(request.secret_id));
        }

        let agreement = self.keys.key_agreement("Finish secret reassembly").await?;

        let theirs = envelope::open(&response.envelope, &agreement, &responder.signing_key)
            .map_err(Error::from)
            .and_then(|plaintext| Ok(decode_share_value(&plaintext)?));
        let theirs = match theirs {
            Ok(value) => value,
            Err(e) => {
                warn!(response = %response_id, error = %e, "discarding response that failed to open");
                self.transition(LedgerEvent::ResponseRejected(response_id));
                return Err(e);
            }
        };
        let own = self.open_own_share(&request.secret_id, &agreement)?;

        let their_point = SharePoint {
            x: participant_x(&response.responder),
            y: theirs,
        };
        let own_point = SharePoint {
            x: participant_x(&self.self_id()),
            y: own,
        };
        let shown = reassemble(&their_point, &own_point)?.stringify(options)?;

        self.transition(LedgerEvent::Finished(response_id));
        info!(request = %request.uuid, secret = %request.secret_id, "secret reassembled");
        Ok(shown)
    }

    /// Pulls requests and responses from the relay and folds them into the ledger
    ///
    /// Every request, this device's own included, must pass admission and name a
    /// secret held here to be folded in. Ids the ledger has already settled are not
    /// checked again. Responses are only fetched for this device's own requests, and
    /// must come from a known device. Settled ids the relay no longer returns are
    /// forgotten.
    ///
    /// # Errors
    /// Returns relay failures; bad records are logged and skipped
    pub async fn refresh_reassembly<D>(&mut self, directory: &D) -> Result<ReconcileDiff>
    where
        D: IdentityDirectory + ?Sized,
    {
        let me = self.self_id();
        let now = self.clock.now();

        let records = self
            .relay
            .query(RecordType::ReassemblyRequest, &Predicate::All)
            .await?;
        let snapshot = codec::decode_all::<ReassemblyRequest>(&records);
        let seen_requests: BTreeSet<RequestId> = snapshot.iter().map(|r| r.uuid).collect();

        let mut own_ids = self.ledger.outgoing_ids();
        let mut requests = Vec::new();
        for request in snapshot {
            if self.ledger.is_settled(&request.uuid) {
                // Keeps the answers to settled own requests in the response snapshot
                if request.requester == me {
                    own_ids.push(request.uuid);
                }
                continue;
            }
            match request.admit(now, &self.config, directory) {
                Ok(()) => {}
                Err(Rejection::Stale) => {
                    debug!(request = %request.uuid, "skipping stale reassembly request");
                    continue;
                }
                Err(rejection) => {
                    warn!(request = %request.uuid, requester = %request.requester, ?rejection, "skipping reassembly request");
                    continue;
                }
            }
            if !self.secrets.contains_key(&request.secret_id) {
                debug!(request = %request.uuid, secret = %request.secret_id, "skipping request for a secret not held here");
                continue;
            }
            if request.requester == me {
                own_ids.push(request.uuid);
            }
            requests.push(request);
        }
        own_ids.sort();
        own_ids.dedup();

        let responses: Vec<ReassemblyResponse> = if own_ids.is_empty() {
            Vec::new()
        } else {
            let records = self
                .relay
                .query(
                    RecordType::ReassemblyResponse,
                    &Predicate::one_of(fields::REQUEST_ID, own_ids),
                )
                .await?;
            codec::decode_all::<ReassemblyResponse>(&records)
                .into_iter()
                .filter(|response| {
                    let known = directory.identity(&response.responder).is_some();
                    if !known {
                        warn!(response = %response.uuid, responder = %response.responder, "skipping response from unknown device");
                    }
                    known
                })
                .collect()
        };

        let seen_responses: BTreeSet<ResponseId> = responses.iter().map(|r| r.uuid).collect();

        let fresh = ReassemblyLedger::new(me);
        let ledger = std::mem::replace(&mut self.ledger, fresh);
        let (ledger, diff) = ledger.reconcile(requests, responses, now, self.config);
        self.ledger = ledger.forget_absent(&seen_requests, &seen_responses);

        if !diff.is_empty() {
            info!(
                incoming = diff.incoming.len(),
                filled = diff.filled.len(),
                expired = diff.expired.len(),
                "reassembly state changed"
            );
        }
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::{ErrorKind, KeyError};
    use crate::identity::Directory;
    use crate::keys::SoftwareKeys;
    use crate::protocol::OutgoingState;
    use crate::relay::MemoryRelay;
    use crate::store::MemoryStore;
    use p256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    const NOW: u64 = 1_700_000_000;

    type Manager = SecretManager<MemoryRelay, SoftwareKeys, MemoryStore>;

    fn manager(relay: &MemoryRelay, name: &str, clock: &Arc<FixedClock>) -> Manager {
        SecretManager::load(relay.clone(), SoftwareKeys::generate(name), MemoryStore::new())
            .unwrap()
            .with_clock(clock.clone())
    }

    fn directory_of(managers: &[&Manager]) -> Directory {
        let mut directory = Directory::new(managers[0].keys().identity().clone());
        for m in &managers[1..] {
            directory.insert(m.keys().identity().clone());
        }
        directory
    }

    #[tokio::test]
    async fn test_create_secret_publishes_packets_for_others_only() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let b = manager(&relay, "b", &clock);
        let c = manager(&relay, "c", &clock);
        let directory = directory_of(&[&a, &b, &c]);

        let id = a
            .create_secret("bank-pin", &[b.self_id(), c.self_id()], &directory)
            .await
            .unwrap();

        assert_eq!(relay.count(RecordType::ShareTransferPacket), 2);
        assert_eq!(a.secret(&id).unwrap().title, "bank-pin");
    }

    #[tokio::test]
    async fn test_create_secret_needs_a_second_device() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let directory = directory_of(&[&a]);
        let me = a.self_id();

        let err = a.create_secret("solo", &[me], &directory).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn test_create_secret_rejects_unknown_participant() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let directory = directory_of(&[&a]);
        let stranger = DeviceId::new_random();

        let err = a
            .create_secret("x", &[stranger], &directory)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(d) if d == stranger));
        assert_eq!(relay.count(RecordType::ShareTransferPacket), 0);
    }

    #[tokio::test]
    async fn test_receive_share_rejects_packets_for_other_devices() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let b = manager(&relay, "b", &clock);
        let mut c = manager(&relay, "c", &clock);
        let directory = directory_of(&[&a, &b, &c]);

        a.create_secret("x", &[b.self_id()], &directory)
            .await
            .unwrap();
        let records = relay
            .query(RecordType::ShareTransferPacket, &Predicate::All)
            .await
            .unwrap();
        let packet = ShareTransferPacket::try_from(&records[0]).unwrap();

        let err = c.receive_share(&packet, &directory).await.unwrap_err();
        assert!(matches!(err, Error::NotAddressedToSelf(_)));
    }

    #[tokio::test]
    async fn test_denied_key_surfaces_from_request() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let b = manager(&relay, "b", &clock);
        let directory = directory_of(&[&a, &b]);
        let id = a
            .create_secret("x", &[b.self_id()], &directory)
            .await
            .unwrap();

        a.keys().set_locked(true);
        let err = a.request_reassembly(id).await.unwrap_err();
        assert!(matches!(err, Error::Keys(KeyError::Denied { .. })));
        assert_eq!(relay.count(RecordType::ReassemblyRequest), 0);
    }

    #[tokio::test]
    async fn test_request_for_unknown_secret_fails() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let err = a
            .request_reassembly(SecretId::new_random())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSecret(_)));
    }

    #[tokio::test]
    async fn test_secret_index_survives_reload() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let keys = SoftwareKeys::generate("a");
        let store = MemoryStore::new();
        let peer = manager(&relay, "b", &clock);

        let mut a = SecretManager::load(relay.clone(), keys, store).unwrap();
        let mut directory = Directory::new(a.keys().identity().clone());
        directory.insert(peer.keys().identity().clone());
        let id = a
            .create_secret("wifi", &[peer.self_id()], &directory)
            .await
            .unwrap();

        let SecretManager { keys, store, .. } = a;
        let reloaded = SecretManager::load(relay, keys, store).unwrap();
        assert_eq!(reloaded.secret(&id).map(|s| s.title.as_str()), Some("wifi"));
    }

    #[tokio::test]
    async fn test_offline_relay_is_a_collaborator_error() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let directory = directory_of(&[&a]);
        relay.set_offline(true);

        let err = a.refresh_reassembly(&directory).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collaborator);
    }

    #[tokio::test]
    async fn test_own_request_signed_by_another_key_is_not_adopted() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let b = manager(&relay, "b", &clock);
        let directory = directory_of(&[&a, &b]);
        let held = a
            .create_secret("x", &[b.self_id()], &directory)
            .await
            .unwrap();

        let impostor = SigningKey::random(&mut OsRng);
        for secret_id in [held, SecretId::new_random()] {
            let forged = ReassemblyRequest::create(secret_id, a.self_id(), NOW, &impostor).unwrap();
            relay.save(forged.to_record()).await.unwrap();
        }

        let diff = a.refresh_reassembly(&directory).await.unwrap();
        assert!(diff.is_empty());
        assert_eq!(a.self_open_requests().count(), 0);
        assert!(a.ledger().outgoing_ids().is_empty());
    }

    #[tokio::test]
    async fn test_own_request_for_unheld_secret_is_not_adopted() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let directory = directory_of(&[&a]);

        let signer = a.keys().signer("test").await.unwrap();
        let request =
            ReassemblyRequest::create(SecretId::new_random(), a.self_id(), NOW, &signer).unwrap();
        relay.save(request.to_record()).await.unwrap();

        a.refresh_reassembly(&directory).await.unwrap();
        assert_eq!(
            a.ledger().outgoing_state(&request.uuid),
            OutgoingState::NoRequest
        );
    }

    #[tokio::test]
    async fn test_requests_for_secrets_not_held_are_not_listed() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let mut b = manager(&relay, "b", &clock);
        let mut c = manager(&relay, "c", &clock);
        let directory = directory_of(&[&a, &b, &c]);

        let secret_id = a
            .create_secret("x", &[b.self_id()], &directory)
            .await
            .unwrap();
        b.refresh_secrets(&directory).await.unwrap();
        let request_id = b.request_reassembly(secret_id).await.unwrap();

        c.refresh_reassembly(&directory).await.unwrap();
        assert_eq!(c.others_open_requests().count(), 0);
        assert!(matches!(
            c.respond(request_id, &directory).await.unwrap_err(),
            Error::UnknownRequest(id) if id == request_id
        ));

        a.refresh_reassembly(&directory).await.unwrap();
        assert_eq!(a.others_open_requests().count(), 1);
    }

    #[tokio::test]
    async fn test_expired_request_is_settled_and_not_rechecked() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let mut b = manager(&relay, "b", &clock);
        let directory = directory_of(&[&a, &b]);

        let secret_id = a
            .create_secret("x", &[b.self_id()], &directory)
            .await
            .unwrap();
        b.refresh_secrets(&directory).await.unwrap();
        let request_id = b.request_reassembly(secret_id).await.unwrap();
        a.refresh_reassembly(&directory).await.unwrap();

        clock.advance(3001);
        let diff = a.refresh_reassembly(&directory).await.unwrap();
        assert_eq!(diff.expired, vec![request_id]);
        assert!(a.ledger().is_settled(&request_id));

        let diff = a.refresh_reassembly(&directory).await.unwrap();
        assert!(diff.is_empty());
        assert!(a.ledger().is_settled(&request_id));
    }

    #[tokio::test]
    async fn test_replayed_response_for_another_secret_is_not_detected() {
        let relay = MemoryRelay::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let mut a = manager(&relay, "a", &clock);
        let mut b = manager(&relay, "b", &clock);
        let directory = directory_of(&[&a, &b]);

        let first = a
            .create_secret("first", &[b.self_id()], &directory)
            .await
            .unwrap();
        let second = a
            .create_secret("second", &[b.self_id()], &directory)
            .await
            .unwrap();
        b.refresh_secrets(&directory).await.unwrap();

        let request_id = b.request_reassembly(first).await.unwrap();
        a.refresh_reassembly(&directory).await.unwrap();
        let response_id = a.respond(request_id, &directory).await.unwrap();
        b.refresh_reassembly(&directory).await.unwrap();
        let shown = b
            .finish(response_id, &directory, CharsetOptions::default())
            .await
            .unwrap();

        // The relay relabels A's old answer for B's next request
        let later = b.request_reassembly(second).await.unwrap();
        let records = relay
            .query(RecordType::ReassemblyResponse, &Predicate::All)
            .await
            .unwrap();
        let mut replayed = ReassemblyResponse::try_from(&records[0]).unwrap();
        replayed.uuid = ResponseId::new_random();
        replayed.request_id = later;
        replayed.secret_id = second;
        relay.save(replayed.to_record()).await.unwrap();

        let diff = b.refresh_reassembly(&directory).await.unwrap();
        assert_eq!(diff.filled, vec![replayed.uuid]);
        let wrong = b
            .finish(replayed.uuid, &directory, CharsetOptions::default())
            .await
            .unwrap();
        assert_ne!(wrong.as_str(), shown.as_str());
    }
}
