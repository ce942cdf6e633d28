//! In-process doubles for the delivery collaborators: a scripted transport,
//! a key directory backed by a map and a toy session cipher.

use nostr::{Keys, PublicKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cipher::CiphertextMessage;
use crate::transport::{GroupEnvelope, GroupSendResponse, SendMessageResponse, TransportResult};
use crate::{
    CipherError, DeliveryConfig, DeliveryPlanner, DeliveryPlannerOptions, DeviceAddress,
    EnvelopeType, IdentityKey, InMemoryStorage, KeyDirectory, OutgoingMessageList, PreKeyBundle,
    Result, SealedSenderAccess, SendEvents, SendResult, SenderCertificate, ServiceAddress,
    SessionCipher, SessionRecord, StorageSessionStore, Transport, TransportError,
};

/// A remote device with a real identity key pair.
#[derive(Debug, Clone)]
pub struct TestDevice {
    pub address: DeviceAddress,
    pub keys: Keys,
    pub registration_id: u32,
}

impl TestDevice {
    pub fn new(address: ServiceAddress, device_id: u32) -> Self {
        Self {
            address: address.device(device_id),
            keys: Keys::generate(),
            registration_id: rand::random::<u16>() as u32 + 1,
        }
    }

    pub fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            device_id: self.address.device_id,
            registration_id: self.registration_id,
            identity_key: self.keys.public_key(),
            pre_key_id: Some(1),
            signed_pre_key: vec![1; 32],
            signed_pre_key_signature: vec![2; 64],
        }
    }

    /// A bundle the cipher refuses to process.
    pub fn malformed_bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            signed_pre_key_signature: Vec::new(),
            ..self.bundle()
        }
    }
}

pub fn sealed_access(sender: ServiceAddress, expires_at_ms: u64) -> SealedSenderAccess {
    SealedSenderAccess::new(
        SenderCertificate {
            sender,
            sender_device_id: 1,
            sender_identity: Keys::generate().public_key(),
            expires_at_ms,
        },
        vec![7; 16],
    )
}

/// Counts session encryptions. The first message on a session is a
/// pre-key message, later ones are whisper messages.
#[derive(Default)]
pub struct TestCipher {
    distrusted: Mutex<HashSet<PublicKey>>,
    encryptions: AtomicUsize,
}

impl TestCipher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distrust(&self, identity: IdentityKey) {
        self.distrusted.lock().unwrap().insert(identity);
    }

    pub fn trust(&self, identity: &IdentityKey) {
        self.distrusted.lock().unwrap().remove(identity);
    }

    pub fn encryptions(&self) -> usize {
        self.encryptions.load(Ordering::SeqCst)
    }
}

fn counter(session: &SessionRecord) -> u32 {
    let mut bytes = [0u8; 4];
    if session.state.len() >= 4 {
        bytes.copy_from_slice(&session.state[..4]);
    }
    u32::from_le_bytes(bytes)
}

impl SessionCipher for TestCipher {
    fn process_pre_key_bundle(
        &self,
        address: &DeviceAddress,
        bundle: &PreKeyBundle,
    ) -> std::result::Result<SessionRecord, CipherError> {
        if bundle.signed_pre_key_signature.is_empty() {
            return Err(CipherError::InvalidKey("missing signature".to_string()));
        }
        if !self.is_trusted_identity(address, &bundle.identity_key) {
            return Err(CipherError::UntrustedIdentity {
                address: address.clone(),
                identity_key: bundle.identity_key,
            });
        }
        Ok(SessionRecord::new(
            bundle.identity_key,
            bundle.registration_id,
            0u32.to_le_bytes().to_vec(),
        ))
    }

    fn encrypt(
        &self,
        _address: &DeviceAddress,
        session: &mut SessionRecord,
        plaintext: &[u8],
    ) -> std::result::Result<CiphertextMessage, CipherError> {
        let n = counter(session);
        session.state = (n + 1).to_le_bytes().to_vec();
        self.encryptions.fetch_add(1, Ordering::SeqCst);

        let mut body = n.to_le_bytes().to_vec();
        body.extend_from_slice(plaintext);
        Ok(CiphertextMessage {
            message_type: if n == 0 {
                EnvelopeType::PreKey
            } else {
                EnvelopeType::Whisper
            },
            body,
        })
    }

    fn is_trusted_identity(&self, _address: &DeviceAddress, identity: &IdentityKey) -> bool {
        !self.distrusted.lock().unwrap().contains(identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFetch {
    pub address: ServiceAddress,
    pub device_id: Option<u32>,
    pub sealed: bool,
}

/// Bundles by recipient, with optional scripted failures.
#[derive(Default)]
pub struct StaticKeyDirectory {
    bundles: Mutex<HashMap<ServiceAddress, Vec<PreKeyBundle>>>,
    failures: Mutex<HashMap<ServiceAddress, VecDeque<TransportError>>>,
    reject_sealed: Mutex<bool>,
    fetches: Mutex<Vec<KeyFetch>>,
}

impl StaticKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, device: &TestDevice) {
        self.publish_bundle(&device.address.address, device.bundle());
    }

    pub fn publish_bundle(&self, address: &ServiceAddress, bundle: PreKeyBundle) {
        let mut bundles = self.bundles.lock().unwrap();
        let entry = bundles.entry(address.clone()).or_default();
        entry.retain(|b| b.device_id != bundle.device_id);
        entry.push(bundle);
    }

    pub fn fail_next(&self, address: &ServiceAddress, error: TransportError) {
        self.failures
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_default()
            .push_back(error);
    }

    /// Answer every sealed fetch with `Unauthorized`.
    pub fn reject_sealed(&self) {
        *self.reject_sealed.lock().unwrap() = true;
    }

    pub fn fetches(&self) -> Vec<KeyFetch> {
        self.fetches.lock().unwrap().clone()
    }
}

impl KeyDirectory for StaticKeyDirectory {
    fn fetch_pre_key_bundles(
        &self,
        address: &ServiceAddress,
        device_id: Option<u32>,
        access: Option<&SealedSenderAccess>,
    ) -> TransportResult<Vec<PreKeyBundle>> {
        self.fetches.lock().unwrap().push(KeyFetch {
            address: address.clone(),
            device_id,
            sealed: access.is_some(),
        });

        if access.is_some() && *self.reject_sealed.lock().unwrap() {
            return Err(TransportError::Unauthorized);
        }
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(|q| q.pop_front())
        {
            return Err(error);
        }

        let bundles = self.bundles.lock().unwrap();
        let Some(all) = bundles.get(address) else {
            return Err(TransportError::Unregistered(address.identifier()));
        };
        Ok(all
            .iter()
            .filter(|b| device_id.map_or(true, |d| b.device_id == d))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEnvelope {
    pub list: OutgoingMessageList,
    pub sealed: bool,
}

/// Records every call and answers from per-recipient scripts. Unscripted
/// calls succeed.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<ServiceAddress, VecDeque<TransportResult<SendMessageResponse>>>>,
    persistent: Mutex<HashMap<ServiceAddress, TransportError>>,
    group_responses: Mutex<VecDeque<TransportResult<GroupSendResponse>>>,
    sent: Mutex<Vec<SentEnvelope>>,
    group_sent: Mutex<Vec<GroupEnvelope>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(
        &self,
        recipient: &ServiceAddress,
        response: TransportResult<SendMessageResponse>,
    ) {
        self.responses
            .lock()
            .unwrap()
            .entry(recipient.clone())
            .or_default()
            .push_back(response);
    }

    /// Every call for `recipient` fails with `error`.
    pub fn always_fail(&self, recipient: &ServiceAddress, error: TransportError) {
        self.persistent
            .lock()
            .unwrap()
            .insert(recipient.clone(), error);
    }

    pub fn push_group_response(&self, response: TransportResult<GroupSendResponse>) {
        self.group_responses.lock().unwrap().push_back(response);
    }

    pub fn sent(&self) -> Vec<SentEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &ServiceAddress) -> Vec<SentEnvelope> {
        self.sent()
            .into_iter()
            .filter(|s| s.list.destination == *recipient)
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn group_sent(&self) -> Vec<GroupEnvelope> {
        self.group_sent.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send_envelope(
        &self,
        list: &OutgoingMessageList,
        access: Option<&SealedSenderAccess>,
    ) -> TransportResult<SendMessageResponse> {
        self.sent.lock().unwrap().push(SentEnvelope {
            list: list.clone(),
            sealed: access.is_some(),
        });

        if let Some(error) = self.persistent.lock().unwrap().get(&list.destination) {
            return Err(error.clone());
        }
        if let Some(response) = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&list.destination)
            .and_then(|q| q.pop_front())
        {
            return response;
        }
        Ok(SendMessageResponse {
            sent_unidentified: access.is_some(),
            needs_sync: false,
        })
    }

    fn send_group_envelope(
        &self,
        envelope: &GroupEnvelope,
        _access: Option<&SealedSenderAccess>,
    ) -> TransportResult<GroupSendResponse> {
        self.group_sent.lock().unwrap().push(envelope.clone());
        self.group_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(GroupSendResponse::default()))
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    pub encrypted: AtomicUsize,
    pub sent: AtomicUsize,
    pub sync_sent: AtomicUsize,
    pub sender_key_shared: AtomicUsize,
    pub completed: Mutex<Vec<SendResult>>,
}

impl SendEvents for RecordingEvents {
    fn on_encrypted(&self) {
        self.encrypted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sync_sent(&self) {
        self.sync_sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sender_key_shared(&self) {
        self.sender_key_shared.fetch_add(1, Ordering::SeqCst);
    }

    fn on_recipient_complete(&self, result: &SendResult) {
        self.completed.lock().unwrap().push(result.clone());
    }
}

/// A planner wired to in-memory doubles.
pub struct TestNetwork {
    pub local: ServiceAddress,
    pub storage: Arc<InMemoryStorage>,
    pub sessions: Arc<StorageSessionStore>,
    pub directory: Arc<StaticKeyDirectory>,
    pub transport: Arc<ScriptedTransport>,
    pub cipher: Arc<TestCipher>,
    pub planner: Arc<DeliveryPlanner>,
}

impl TestNetwork {
    pub fn new() -> Result<Self> {
        Self::with_config(DeliveryConfig::default())
    }

    pub fn with_config(config: DeliveryConfig) -> Result<Self> {
        Self::build(ServiceAddress::random(), 1, config)
    }

    pub fn build(local: ServiceAddress, local_device_id: u32, config: DeliveryConfig) -> Result<Self> {
        let storage = Arc::new(InMemoryStorage::new());
        let sessions = Arc::new(StorageSessionStore::new(storage.clone()));
        let directory = Arc::new(StaticKeyDirectory::new());
        let transport = Arc::new(ScriptedTransport::new());
        let cipher = Arc::new(TestCipher::new());

        let planner = Arc::new(DeliveryPlanner::new(DeliveryPlannerOptions {
            local_address: local.clone(),
            local_device_id,
            sessions: sessions.clone(),
            key_directory: directory.clone(),
            transport: transport.clone(),
            cipher: cipher.clone(),
            storage: storage.clone(),
            config,
        })?);

        Ok(Self {
            local,
            storage,
            sessions,
            directory,
            transport,
            cipher,
            planner,
        })
    }

    /// Publishes a bundle for `device_id` and returns the device.
    pub fn remote_device(&self, address: &ServiceAddress, device_id: u32) -> TestDevice {
        let device = TestDevice::new(address.clone(), device_id);
        self.directory.publish(&device);
        device
    }

    /// Publishes a bundle and also establishes a live session with it.
    pub fn connected_device(&self, address: &ServiceAddress, device_id: u32) -> Result<TestDevice> {
        use crate::SessionStore;

        let device = self.remote_device(address, device_id);
        let record = self
            .cipher
            .process_pre_key_bundle(&device.address, &device.bundle())?;
        self.sessions.store_session(&device.address, record)?;
        Ok(device)
    }
}
