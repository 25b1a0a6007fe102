use std::sync::Arc;

use parley_crypto::signal::{CiphertextMessage, CiphertextMessageType, PreKeyStore};
use parley_crypto::CryptoError;
use parley_keys::{
    claim_bundle, Device, KeyDirectory, KeysConfig, MemoryKeyDirectory, MemoryKeychain,
};
use tempfile::TempDir;

fn config(dir: &TempDir, name: &str) -> KeysConfig {
    let root = dir.path().join(name);
    std::fs::create_dir_all(&root).unwrap();
    KeysConfig {
        database_path: root.join("keys.db").to_string_lossy().into_owned(),
        vault_dir: root,
        ..KeysConfig::default()
    }
}

fn memory_device(dir: &TempDir, name: &str, directory: Arc<MemoryKeyDirectory>) -> Device {
    Device::with_keychain(
        &config(dir, name),
        Arc::new(MemoryKeychain::new()),
        directory,
    )
    .unwrap()
}

fn wire(message: &CiphertextMessage) -> (Vec<u8>, u8) {
    (message.serialize().to_vec(), message.message_type() as u8)
}

#[tokio::test]
async fn first_contact_then_reply() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(MemoryKeyDirectory::new());
    let alice = memory_device(&dir, "alice", directory.clone());
    let bob = memory_device(&dir, "bob", directory.clone());

    // Alice publishes a bundle offering one-time prekey 7.
    alice.keys().ensure_identity_keys().unwrap();
    alice.keys().generate_one_time_prekeys(1, Some(7)).unwrap();
    let published = alice.keys().create_device_key_bundle(1).unwrap();
    assert_eq!(published.prekey.as_ref().map(|p| p.id), Some(7));
    directory.publish("alice", &published).await.unwrap();

    bob.keys().ensure_identity_keys().unwrap();
    let claimed = claim_bundle(directory.as_ref(), "alice", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.prekey.as_ref().map(|p| p.id), Some(7));
    assert!(directory.document("alice", 1).unwrap()["preKeyId"].is_null());

    bob.sessions()
        .build_session_for_remote("alice", &claimed)
        .await
        .unwrap();
    assert!(bob.sessions().has_session("alice", 1).await.unwrap());

    let hello = bob.sessions().encrypt_text("alice", 1, "hello").await.unwrap();
    assert_eq!(hello.message_type(), CiphertextMessageType::PreKey);
    let (bytes, kind) = wire(&hello);
    let text = alice
        .sessions()
        .decrypt_text("bob", 1, &bytes, kind)
        .await
        .unwrap();
    assert_eq!(text, "hello");

    // The one-time prekey is gone after the handshake.
    assert!(!alice.store().contains_prekey(7).unwrap());

    let reply = alice
        .sessions()
        .encrypt_text("bob", 1, "hi back")
        .await
        .unwrap();
    assert_eq!(reply.message_type(), CiphertextMessageType::Whisper);
    let (bytes, kind) = wire(&reply);
    assert_eq!(
        bob.sessions()
            .decrypt_text("alice", 1, &bytes, kind)
            .await
            .unwrap(),
        "hi back"
    );

    // Bob's session is acknowledged now.
    let next = bob.sessions().encrypt_text("alice", 1, "ok").await.unwrap();
    assert_eq!(next.message_type(), CiphertextMessageType::Whisper);
}

#[tokio::test]
async fn replayed_message_is_a_duplicate() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(MemoryKeyDirectory::new());
    let alice = memory_device(&dir, "alice", directory.clone());
    let bob = memory_device(&dir, "bob", directory.clone());

    assert!(alice.initializer().initialize_device_if_needed("alice").await);
    assert!(bob.initializer().initialize_device_if_needed("bob").await);

    let built = bob
        .sessions()
        .build_sessions_with_user(directory.as_ref(), "alice")
        .await
        .unwrap();
    assert_eq!(built, 1);

    let msg = bob.sessions().encrypt_text("alice", 1, "once").await.unwrap();
    let (bytes, kind) = wire(&msg);
    alice
        .sessions()
        .decrypt_text("bob", 1, &bytes, kind)
        .await
        .unwrap();

    let err = alice
        .sessions()
        .decrypt_text("bob", 1, &bytes, kind)
        .await
        .unwrap_err();
    assert!(err.is_duplicate());
}

#[tokio::test]
async fn whisper_without_session_is_rejected() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(MemoryKeyDirectory::new());
    let alice = memory_device(&dir, "alice", directory.clone());
    let bob = memory_device(&dir, "bob", directory.clone());

    assert!(alice.initializer().initialize_device_if_needed("alice").await);
    assert!(bob.initializer().initialize_device_if_needed("bob").await);
    bob.sessions()
        .build_sessions_with_user(directory.as_ref(), "alice")
        .await
        .unwrap();

    let first = bob.sessions().encrypt_text("alice", 1, "one").await.unwrap();
    let (bytes, kind) = wire(&first);
    alice
        .sessions()
        .decrypt_text("bob", 1, &bytes, kind)
        .await
        .unwrap();
    let reply = alice.sessions().encrypt_text("bob", 1, "two").await.unwrap();
    let (bytes, kind) = wire(&reply);
    bob.sessions()
        .decrypt_text("alice", 1, &bytes, kind)
        .await
        .unwrap();

    let whisper = bob.sessions().encrypt_text("alice", 1, "three").await.unwrap();
    assert_eq!(whisper.message_type(), CiphertextMessageType::Whisper);

    alice.sessions().delete_session("bob", 1).await.unwrap();
    let (bytes, kind) = wire(&whisper);
    let err = alice
        .sessions()
        .decrypt_text("bob", 1, &bytes, kind)
        .await
        .unwrap_err();
    assert!(matches!(err.as_crypto(), Some(CryptoError::NoSession(_))));
}

#[tokio::test]
async fn sessions_and_identity_survive_restart() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(MemoryKeyDirectory::new());
    let alice_config = config(&dir, "alice");
    let bob_config = config(&dir, "bob");

    let alice = Device::open(&alice_config, "alice-pass", directory.clone()).unwrap();
    assert!(alice.initializer().initialize_device_if_needed("alice").await);
    let fingerprint = alice.keys().identity_fingerprint().unwrap();

    let bob = Device::open(&bob_config, "bob-pass", directory.clone()).unwrap();
    assert!(bob.initializer().initialize_device_if_needed("bob").await);
    bob.sessions()
        .build_sessions_with_user(directory.as_ref(), "alice")
        .await
        .unwrap();
    let hello = bob.sessions().encrypt_text("alice", 1, "before").await.unwrap();
    let (bytes, kind) = wire(&hello);
    alice
        .sessions()
        .decrypt_text("bob", 1, &bytes, kind)
        .await
        .unwrap();

    drop(alice);
    let alice = Device::open(&alice_config, "alice-pass", directory.clone()).unwrap();
    assert_eq!(alice.keys().identity_fingerprint().unwrap(), fingerprint);
    assert!(alice.sessions().has_session("bob", 1).await.unwrap());

    // Bootstrap after restart keeps the existing identity.
    assert!(alice.initializer().initialize_device_if_needed("alice").await);
    assert_eq!(alice.keys().identity_fingerprint().unwrap(), fingerprint);

    let later = bob.sessions().encrypt_text("alice", 1, "after").await.unwrap();
    let (bytes, kind) = wire(&later);
    assert_eq!(
        alice
            .sessions()
            .decrypt_text("bob", 1, &bytes, kind)
            .await
            .unwrap(),
        "after"
    );
}

#[tokio::test]
async fn wrong_vault_passphrase_fails_to_open() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(MemoryKeyDirectory::new());
    let cfg = config(&dir, "alice");

    let alice = Device::open(&cfg, "right", directory.clone()).unwrap();
    assert!(alice.initializer().initialize_device_if_needed("alice").await);
    drop(alice);

    assert!(Device::open(&cfg, "wrong", directory).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_traffic_from_two_senders() {
    let dir = TempDir::new().unwrap();
    let directory = Arc::new(MemoryKeyDirectory::new());
    let alice = Arc::new(memory_device(&dir, "alice", directory.clone()));
    let bob = Arc::new(memory_device(&dir, "bob", directory.clone()));
    let carol = Arc::new(memory_device(&dir, "carol", directory.clone()));

    for (device, user) in [(&alice, "alice"), (&bob, "bob"), (&carol, "carol")] {
        assert!(device.initializer().initialize_device_if_needed(user).await);
    }
    for sender in [&bob, &carol] {
        sender
            .sessions()
            .build_sessions_with_user(directory.as_ref(), "alice")
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for (sender, name) in [(bob.clone(), "bob"), (carol.clone(), "carol")] {
        for i in 0..8 {
            let sender = sender.clone();
            let alice = alice.clone();
            tasks.push(tokio::spawn(async move {
                let msg = sender
                    .sessions()
                    .encrypt_text("alice", 1, &format!("{name}-{i}"))
                    .await
                    .unwrap();
                let (bytes, kind) = wire(&msg);
                alice.sessions().decrypt_text(name, 1, &bytes, kind).await
            }));
        }
    }

    let mut received = Vec::new();
    for task in tasks {
        received.push(task.await.unwrap().unwrap());
    }
    assert_eq!(received.len(), 16);
    assert!(received.iter().any(|m| m == "bob-7"));
    assert!(received.iter().any(|m| m == "carol-0"));
}
