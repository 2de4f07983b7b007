//! End-to-end scenario tests.
//!
//! Each test walks one complete flow across subsystems: registration
//! through token refresh, envelope submission through paged retrieval,
//! out-of-order ratchet delivery, the group membership lifecycle, router
//! migration, and auth rate limiting.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use murmur_core::auth::{AuthService, RateLimiter, SecondFactor, TokenIssuer};
use murmur_core::crypto::password::PasswordHasher;
use murmur_core::crypto::{DoubleRatchet, EphemeralKeypair, IdentityKeypair, SharedSecret};
use murmur_core::error::Error;
use murmur_core::messaging::{Envelope, MessagingService};
use murmur_core::net::{
    AdaptiveRouter, MigrationEvent, RouteMetrics, TransportDescriptor, TransportKind,
};
use murmur_core::storage::Database;

const REMOTE: &str = "198.51.100.7:40000";

fn shared_db() -> Arc<Mutex<Database>> {
    Arc::new(Mutex::new(Database::open_in_memory().expect("open db")))
}

fn auth_service(db: Arc<Mutex<Database>>) -> AuthService {
    AuthService::new(
        db,
        PasswordHasher::new(1, 64, 1, 32),
        TokenIssuer::new([3u8; 32], "murmur", Duration::from_secs(30 * 60)),
        SecondFactor::new(8, 5),
        Duration::from_secs(30 * 24 * 3600),
    )
}

/// Build the `hex(salt):hex(derived)` proof a client submits.
fn password_proof(password: &str, salt: &[u8]) -> Vec<u8> {
    let derived = PasswordHasher::new(1, 64, 1, 32)
        .hash(password.as_bytes(), salt)
        .expect("derive proof");
    format!("{}:{}", hex::encode(salt), hex::encode(&*derived)).into_bytes()
}

async fn current_second_code(db: &Arc<Mutex<Database>>, username: &str, now: i64) -> String {
    let user = db
        .lock()
        .await
        .find_user_by_username(username)
        .expect("query user")
        .expect("user exists");
    SecondFactor::new(8, 5).code_at(&user.second_factor_secret, now)
}

/// S1: register, log in, refresh.
#[tokio::test]
async fn test_register_login_refresh_flow() {
    let db = shared_db();
    let auth = auth_service(db.clone());
    let now = 1_700_000_000;

    let salt = [0u8; 16];
    let proof = password_proof("hunter2", &salt);
    let user_id = auth
        .register(REMOTE, "alice", &proof, &[0x11; 32])
        .await
        .expect("register");

    let code = current_second_code(&db, "alice", now).await;
    let login = auth
        .login(REMOTE, "alice", &proof, "d1", &code, now)
        .await
        .expect("login");
    assert_eq!(login.expires_at, now + 30 * 60);

    let claims = auth
        .verify_access(&login.access, now + 60)
        .expect("verify access");
    assert_eq!(claims.sub, user_id);
    assert_eq!(claims.device_id, "d1");

    let refreshed = auth
        .refresh(REMOTE, &login.refresh, "d1", now + 10 * 60)
        .await
        .expect("refresh");
    assert_eq!(refreshed.expires_at, now + 10 * 60 + 30 * 60);
    assert!(auth
        .verify_access(&refreshed.access, now + 11 * 60)
        .is_ok());
}

/// S2: envelope round-trip through the queue.
#[tokio::test]
async fn test_envelope_round_trip() {
    let db = shared_db();
    let auth = auth_service(db.clone());
    let messaging = MessagingService::new(db.clone());

    let identity = IdentityKeypair::generate();
    let proof = password_proof("hunter2", &[0u8; 16]);
    let alice_id = auth
        .register(REMOTE, "alice", &proof, &identity.public_key_bytes())
        .await
        .expect("register");

    let mut envelope = Envelope {
        conversation_id: "c1".to_string(),
        message_id: "m1".to_string(),
        ciphertext: vec![0xAA],
        signature: Vec::new(),
        sent_at_unix: 1_700_000_000,
        sender_id: alice_id,
    };
    envelope.sign(&identity);
    let bytes = envelope.encode().expect("encode");

    messaging.send(&bytes).await.expect("send");

    let page = messaging.pull_page("c1", 0, 10).await.expect("pull");
    assert_eq!(page.envelopes, vec![bytes]);
    assert_eq!(page.next_since, 1_700_000_000);
    assert!(!page.has_more);
}

/// S3: out-of-order ratchet delivery.
#[test]
fn test_out_of_order_ratchet() {
    let bob_prekey = EphemeralKeypair::generate();
    let secret_bytes = murmur_core::crypto::random_bytes::<32>();

    let mut alice = DoubleRatchet::init_initiator(
        &SharedSecret::from_bytes(secret_bytes),
        bob_prekey.public_key(),
    )
    .expect("init alice");
    let mut bob = DoubleRatchet::init_responder(&SharedSecret::from_bytes(secret_bytes), bob_prekey);

    let (h1, c1) = alice.encrypt(b"m1", b"c1").expect("encrypt m1");
    let (h2, c2) = alice.encrypt(b"m2", b"c1").expect("encrypt m2");
    let (h3, c3) = alice.encrypt(b"m3", b"c1").expect("encrypt m3");

    // Bob receives m3 first, then m1, then m2.
    assert_eq!(bob.decrypt(&h3, &c3, b"c1").expect("decrypt m3"), b"m3");
    assert_eq!(bob.decrypt(&h1, &c1, b"c1").expect("decrypt m1"), b"m1");
    assert_eq!(bob.decrypt(&h2, &c2, b"c1").expect("decrypt m2"), b"m2");
}

/// S4: group lifecycle with role checks and rotation.
#[tokio::test]
async fn test_group_lifecycle() {
    use murmur_core::groups::GroupService;
    use murmur_core::storage::UserRecord;

    let db = shared_db();
    let groups = GroupService::new(db.clone());

    let alice = IdentityKeypair::generate();
    let bob = IdentityKeypair::generate();
    let carol = IdentityKeypair::generate();
    {
        let guard = db.lock().await;
        for (id, key) in [("alice", &alice), ("bob", &bob), ("carol", &carol)] {
            guard
                .create_user(&UserRecord {
                    id: id.to_string(),
                    username: id.to_string(),
                    server_salt: vec![0; 16],
                    password_hash: vec![0; 32],
                    public_key: key.public_key_bytes().to_vec(),
                    second_factor_secret: vec![0; 32],
                    created_at: 0,
                })
                .expect("create user");
        }
    }

    let group = groups
        .create_group("alice", "g", &alice.public_key_bytes())
        .await
        .expect("create group");
    assert_eq!(group.key_version, 1);

    groups
        .add_member(&group.id, "bob", "alice", &bob.public_key_bytes())
        .await
        .expect("alice adds bob");

    assert!(matches!(
        groups
            .add_member(&group.id, "carol", "bob", &carol.public_key_bytes())
            .await,
        Err(Error::NotAuthorized)
    ));

    groups
        .remove_member(&group.id, "bob", "alice")
        .await
        .expect("alice removes bob");

    let version = groups
        .rotate_group_key(&group.id, "alice")
        .await
        .expect("rotate");

    let members = groups
        .get_group_members(&group.id, "alice")
        .await
        .expect("members");
    assert!(!members.is_empty());
    assert!(members.iter().all(|m| m.key_version == version));
}

/// S5: router migration when a faster transport appears.
#[test]
fn test_router_migration() {
    let router = AdaptiveRouter::new(Duration::from_secs(60), Duration::from_millis(200));
    router.add_transport(TransportDescriptor {
        id: "tcp".to_string(),
        kind: TransportKind::Tcp,
        endpoint: "127.0.0.1:4000".to_string(),
        priority: 3,
    });
    router.add_transport(TransportDescriptor {
        id: "quic".to_string(),
        kind: TransportKind::Quic,
        endpoint: "127.0.0.1:4001".to_string(),
        priority: 1,
    });

    let slow = RouteMetrics {
        latency: Duration::from_millis(200),
        packet_loss: 0.01,
        jitter: Duration::from_millis(5),
        stability: 0.95,
        blocking_risk: 0.1,
        load: 0.3,
    };
    let fast = RouteMetrics {
        latency: Duration::from_millis(20),
        ..slow.clone()
    };

    router.update_metrics("tcp", RouteMetrics {
        latency: Duration::from_millis(50),
        ..slow.clone()
    });
    router.update_metrics("quic", slow);

    let event = router.migrate_if_better().expect("initial selection");
    assert_eq!(event.to, "tcp");

    // The probe cycle improves quic's latency; the router migrates.
    router.update_metrics("quic", fast);
    let event = router.migrate_if_better().expect("migration");
    assert_eq!(
        event,
        MigrationEvent {
            from: Some("tcp".to_string()),
            to: "quic".to_string()
        }
    );

    let snapshot = router.metrics_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|entry| entry.metrics.is_some()));
}

/// S6: the 61st login in a minute is limited; other methods are not.
#[tokio::test]
async fn test_rate_limit_only_affects_auth() {
    let db = shared_db();
    let auth = auth_service(db.clone()).with_rate_limiter(RateLimiter::new(60, Duration::from_secs(60)));
    let messaging = MessagingService::new(db.clone());

    let identity = IdentityKeypair::generate();
    let proof = password_proof("hunter2", &[0u8; 16]);
    let alice_id = auth
        .register(REMOTE, "alice", &proof, &identity.public_key_bytes())
        .await
        .expect("register");

    // 59 more auth hits from the same address (register consumed one).
    for _ in 0..59 {
        let _ = auth
            .login(REMOTE, "alice", b"bad:proof", "d1", "WRONG", 0)
            .await;
    }

    let result = auth.login(REMOTE, "alice", b"bad:proof", "d1", "WRONG", 0).await;
    assert!(matches!(result, Err(Error::RateLimited)));

    // Non-auth traffic from the same address still flows.
    let mut envelope = Envelope {
        conversation_id: "c1".to_string(),
        message_id: "m1".to_string(),
        ciphertext: vec![0xAA],
        signature: Vec::new(),
        sent_at_unix: 1_700_000_000,
        sender_id: alice_id,
    };
    envelope.sign(&identity);
    messaging
        .send(&envelope.encode().expect("encode"))
        .await
        .expect("send unaffected by auth limit");
}
