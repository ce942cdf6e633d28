use secure_delivery::test_utils::{sealed_access, TestNetwork};
use secure_delivery::utils::now_millis;
use secure_delivery::{
    DeliveryConfig, EnvelopeContent, NoopSendEvents, ServiceAddress, StorageAdapter,
    TransportError,
};
use secure_delivery_runtime::ledger::Terminal;
use secure_delivery_runtime::test_utils::{FixedCertificates, FixedRotator};
use secure_delivery_runtime::{
    CertificatePrecondition, DeliveryContext, DeliveryJob, DeliveryJobData, DeliveryJobFactory,
    DeliveryLedger, DeliveryServices, JobManager, JobState, MemoryRecorder, PreKeyPrecondition,
    Recorded, DELIVERY_JOB_FACTORY_KEY,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

fn config() -> DeliveryConfig {
    DeliveryConfig {
        min_backoff_ms: 1,
        max_backoff_ms: 5,
        max_attempts: 3,
        ..DeliveryConfig::default()
    }
}

struct Harness {
    net: TestNetwork,
    recorder: Arc<MemoryRecorder>,
    ledger: Arc<DeliveryLedger>,
    certificates: Arc<FixedCertificates>,
    services: Arc<DeliveryServices>,
    manager: JobManager,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(config())
    }

    fn with_config(config: DeliveryConfig) -> Self {
        let net = TestNetwork::with_config(config.clone()).unwrap();
        let storage: Arc<dyn StorageAdapter> = net.storage.clone();
        let manager = JobManager::from_config(&config, Some(storage.clone()));
        let recorder = Arc::new(MemoryRecorder::new());
        let ledger = Arc::new(DeliveryLedger::new(storage));
        let certificates = Arc::new(FixedCertificates::new(
            net.local.clone(),
            now_millis() + 30 * DAY_MS,
        ));
        let services = Arc::new(DeliveryServices {
            planner: net.planner.clone(),
            ledger: ledger.clone(),
            recorder: recorder.clone(),
            precondition: None,
            certificates: Some(Arc::new(CertificatePrecondition::new(
                Arc::new(DeliveryContext::new(now_millis())),
                manager.handle(),
                certificates.clone(),
                &config,
            ))),
            events: Arc::new(NoopSendEvents),
        });
        manager.register_factory(
            DELIVERY_JOB_FACTORY_KEY,
            Arc::new(DeliveryJobFactory {
                services: services.clone(),
            }),
        );
        Self {
            net,
            recorder,
            ledger,
            certificates,
            services,
            manager,
        }
    }

    fn send(&self, data: DeliveryJobData) -> JobState {
        let id = DeliveryJob::new(data, self.services.clone())
            .enqueue(&self.manager, None)
            .unwrap();
        self.manager.wait_for(&id, WAIT).unwrap()
    }
}

fn content() -> EnvelopeContent {
    EnvelopeContent::new(b"hello".to_vec(), 1_700_000_000_000)
}

#[test]
fn delivered_message_is_marked_sent() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();

    let state = h.send(DeliveryJobData::individual("m1", vec![bob.clone()], content()));

    assert_eq!(state, JobState::Succeeded);
    assert_eq!(h.ledger.terminal("m1").unwrap(), Some(Terminal::Sent));
    assert_eq!(h.recorder.sent_to("m1"), vec![bob]);
    assert_eq!(h.recorder.permanent_failures("m1"), 0);
}

#[test]
fn network_failure_is_retried() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();
    h.net
        .transport
        .push_response(&bob, Err(TransportError::Network("reset".to_string())));

    let state = h.send(DeliveryJobData::individual("m1", vec![bob.clone()], content()));

    assert_eq!(state, JobState::Succeeded);
    assert_eq!(h.net.transport.sent_to(&bob).len(), 2);
    assert_eq!(h.ledger.terminal("m1").unwrap(), Some(Terminal::Sent));
}

#[test]
fn server_rejection_fails_once_and_is_not_resent() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();
    h.net
        .transport
        .push_response(&bob, Err(TransportError::ServerRejected));

    let state = h.send(DeliveryJobData::individual("m1", vec![bob.clone()], content()));
    assert_eq!(state, JobState::PermanentlyFailed);
    assert_eq!(h.net.transport.sent_to(&bob).len(), 1);
    assert_eq!(h.ledger.terminal("m1").unwrap(), Some(Terminal::Failed));
    assert_eq!(h.recorder.permanent_failures("m1"), 1);

    let again = h.send(DeliveryJobData::individual("m1", vec![bob.clone()], content()));
    assert_eq!(again, JobState::Succeeded);
    assert_eq!(h.net.transport.sent_to(&bob).len(), 1);
    assert_eq!(h.recorder.permanent_failures("m1"), 1);
}

#[test]
fn attempt_budget_exhaustion_records_one_failure() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();
    h.net
        .transport
        .always_fail(&bob, TransportError::Network("down".to_string()));

    let state = h.send(DeliveryJobData::individual("m1", vec![bob.clone()], content()));

    assert_eq!(state, JobState::PermanentlyFailed);
    assert_eq!(h.net.transport.sent_to(&bob).len(), 3);
    assert_eq!(h.recorder.permanent_failures("m1"), 1);
    assert_eq!(h.ledger.terminal("m1").unwrap(), Some(Terminal::Failed));
}

#[test]
fn identity_mismatch_is_recorded_and_permanent() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    let device = h.net.remote_device(&bob, 1);
    h.net.cipher.distrust(device.keys.public_key());

    let state = h.send(DeliveryJobData::individual("m1", vec![bob.clone()], content()));

    assert_eq!(state, JobState::PermanentlyFailed);
    let events = h.recorder.events();
    assert!(events.iter().any(|e| matches!(
        e,
        Recorded::IdentityMismatch { recipient, identity_key, .. }
            if *recipient == bob && *identity_key == device.keys.public_key()
    )));
    assert!(events.contains(&Recorded::IdentityRefresh(bob.clone())));
    assert_eq!(h.recorder.permanent_failures("m1"), 1);
    assert_eq!(h.net.transport.sent_count(), 0);
}

#[test]
fn partial_success_with_unregistered_recipient_is_sent() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    let gone = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();

    let state = h.send(DeliveryJobData::individual(
        "m1",
        vec![bob.clone(), gone.clone()],
        content(),
    ));

    assert_eq!(state, JobState::Succeeded);
    assert_eq!(h.recorder.sent_to("m1"), vec![bob]);
    assert!(h.recorder.events().contains(&Recorded::Unregistered {
        message_id: "m1".to_string(),
        recipient: gone,
    }));
}

#[test]
fn only_unregistered_recipients_is_permanent() {
    let h = Harness::new();
    let gone = ServiceAddress::random();

    let state = h.send(DeliveryJobData::individual("m1", vec![gone], content()));

    assert_eq!(state, JobState::PermanentlyFailed);
    assert_eq!(h.ledger.terminal("m1").unwrap(), Some(Terminal::Failed));
}

#[test]
fn retry_only_covers_pending_recipients() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    let carol = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();
    h.net.connected_device(&carol, 1).unwrap();
    h.net
        .transport
        .push_response(&carol, Err(TransportError::Network("reset".to_string())));

    let state = h.send(DeliveryJobData::individual(
        "m1",
        vec![bob.clone(), carol.clone()],
        content(),
    ));

    assert_eq!(state, JobState::Succeeded);
    assert_eq!(h.net.transport.sent_to(&bob).len(), 1);
    assert_eq!(h.net.transport.sent_to(&carol).len(), 2);
    let mut sent = h.recorder.sent_to("m1");
    sent.sort_by_key(|a| a.identifier());
    let mut expected = vec![bob, carol];
    expected.sort_by_key(|a| a.identifier());
    assert_eq!(sent, expected);
}

#[test]
fn unregistered_account_fails_without_sending() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();
    h.recorder.set_registered(false);

    let state = h.send(DeliveryJobData::individual("m1", vec![bob], content()));

    assert_eq!(state, JobState::PermanentlyFailed);
    assert_eq!(h.net.transport.sent_count(), 0);
    assert_eq!(h.net.directory.fetches().len(), 0);
    assert_eq!(h.recorder.permanent_failures("m1"), 1);
    assert_eq!(h.ledger.terminal("m1").unwrap(), Some(Terminal::Failed));
}

#[test]
fn expiring_certificate_is_renewed_before_sealed_send() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();
    let expiring = sealed_access(h.net.local.clone(), now_millis() + 60_000);

    let state = h.send(
        DeliveryJobData::individual("m1", vec![bob.clone()], content())
            .with_access(bob.clone(), expiring),
    );

    assert_eq!(state, JobState::Succeeded);
    assert_eq!(h.certificates.calls(), 1);
    let sent = h.net.transport.sent_to(&bob);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].sealed);
}

#[test]
fn expiring_certificate_without_renewal_is_never_sent_unsealed() {
    let h = Harness::new();
    let bob = ServiceAddress::random();
    h.net.connected_device(&bob, 1).unwrap();
    let services = Arc::new(DeliveryServices {
        planner: h.net.planner.clone(),
        ledger: h.ledger.clone(),
        recorder: h.recorder.clone(),
        precondition: None,
        certificates: None,
        events: Arc::new(NoopSendEvents),
    });
    let data = DeliveryJobData::individual("m1", vec![bob.clone()], content())
        .with_access(bob, sealed_access(h.net.local.clone(), now_millis() + 60_000));

    let id = DeliveryJob::new(data, services).enqueue(&h.manager, None).unwrap();

    assert_eq!(h.manager.wait_for(&id, WAIT), Some(JobState::PermanentlyFailed));
    assert_eq!(h.net.transport.sent_count(), 0);
    assert_eq!(h.recorder.permanent_failures("m1"), 1);
}

#[test]
fn stale_signed_pre_key_is_refreshed_before_sending() {
    let config = config();
    let net = TestNetwork::with_config(config.clone()).unwrap();
    let storage: Arc<dyn StorageAdapter> = net.storage.clone();
    let manager = JobManager::from_config(&config, None);
    let now = now_millis();
    let rotator = Arc::new(FixedRotator::new(now));
    let context = Arc::new(DeliveryContext::new(now.saturating_sub(30 * DAY_MS)));
    let precondition = Arc::new(PreKeyPrecondition::new(
        context.clone(),
        manager.handle(),
        rotator.clone(),
        &config,
    ));
    let recorder = Arc::new(MemoryRecorder::new());
    let services = Arc::new(DeliveryServices {
        planner: net.planner.clone(),
        ledger: Arc::new(DeliveryLedger::new(storage)),
        recorder: recorder.clone(),
        precondition: Some(precondition),
        certificates: None,
        events: Arc::new(NoopSendEvents),
    });

    let bob = ServiceAddress::random();
    net.connected_device(&bob, 1).unwrap();
    let id = DeliveryJob::new(
        DeliveryJobData::individual("m1", vec![bob.clone()], content()),
        services.clone(),
    )
    .enqueue(&manager, None)
    .unwrap();

    assert_eq!(manager.wait_for(&id, WAIT), Some(JobState::Succeeded));
    assert_eq!(rotator.calls(), 1);
    assert_eq!(context.last_rotation_ms(), now);
    assert_eq!(recorder.sent_to("m1"), vec![bob.clone()]);

    let second = DeliveryJob::new(
        DeliveryJobData::individual("m2", vec![bob], content()),
        services,
    )
    .enqueue(&manager, None)
    .unwrap();
    assert_eq!(manager.wait_for(&second, WAIT), Some(JobState::Succeeded));
    assert_eq!(rotator.calls(), 1);
}

#[test]
fn interrupted_delivery_resumes_after_restart() {
    let slow = DeliveryConfig {
        min_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
        ..config()
    };
    let first = Harness::with_config(slow);
    let bob = ServiceAddress::random();
    first.net.connected_device(&bob, 1).unwrap();
    first
        .net
        .transport
        .push_response(&bob, Err(TransportError::Network("reset".to_string())));

    let id = DeliveryJob::new(
        DeliveryJobData::individual("m1", vec![bob.clone()], content()),
        first.services.clone(),
    )
    .enqueue(&first.manager, None)
    .unwrap();

    let deadline = Instant::now() + WAIT;
    while first.manager.state(&id) != Some(JobState::Retrying) {
        assert!(Instant::now() < deadline, "delivery never started retrying");
        thread::sleep(Duration::from_millis(5));
    }
    let Harness {
        net,
        recorder,
        ledger,
        services,
        manager,
        ..
    } = first;
    drop(manager);

    let storage: Arc<dyn StorageAdapter> = net.storage.clone();
    let restarted = JobManager::from_config(&config(), Some(storage));
    restarted.register_factory(DELIVERY_JOB_FACTORY_KEY, Arc::new(DeliveryJobFactory { services }));
    assert_eq!(restarted.resume().unwrap(), 1);

    assert_eq!(restarted.wait_for(&id, WAIT), Some(JobState::Succeeded));
    assert_eq!(net.transport.sent_to(&bob).len(), 2);
    assert_eq!(ledger.terminal("m1").unwrap(), Some(Terminal::Sent));
    assert_eq!(recorder.sent_to("m1"), vec![bob]);
}
