use muster::core::MusterError;
use muster::core::keyring::{KEY_LEN, Keyring};

fn key(fill: u8) -> Vec<u8> {
    vec![fill; KEY_LEN]
}

#[tokio::test]
async fn test_keyring_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyring.json");

    let mut keyring = Keyring::load(&path).await.unwrap();
    assert!(keyring.primary().is_none());

    keyring.install(key(1)).await.unwrap();
    keyring.install(key(2)).await.unwrap();
    assert_eq!(keyring.primary(), Some(key(1).as_slice()));
    assert_eq!(keyring.keys().len(), 2);

    // Reload from disk: same order, primary first.
    let reloaded = Keyring::load(&path).await.unwrap();
    assert_eq!(reloaded.primary(), Some(key(1).as_slice()));
    assert_eq!(reloaded.keys(), keyring.keys());
}

#[tokio::test]
async fn test_use_key_promotes_to_primary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyring.json");
    let mut keyring = Keyring::load(&path).await.unwrap();
    keyring.install(key(1)).await.unwrap();
    keyring.install(key(2)).await.unwrap();

    keyring.use_key(&key(2)).await.unwrap();
    assert_eq!(keyring.primary(), Some(key(2).as_slice()));

    let reloaded = Keyring::load(&path).await.unwrap();
    assert_eq!(reloaded.primary(), Some(key(2).as_slice()));
}

#[tokio::test]
async fn test_primary_key_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyring.json");
    let mut keyring = Keyring::load(&path).await.unwrap();
    keyring.install(key(1)).await.unwrap();
    keyring.install(key(2)).await.unwrap();

    let err = keyring.remove(&key(1)).await.unwrap_err();
    assert!(matches!(err, MusterError::InvalidRequest(_)));
    keyring.remove(&key(2)).await.unwrap();
    assert_eq!(keyring.keys().len(), 1);
}

#[tokio::test]
async fn test_wrong_key_length_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyring.json");
    let mut keyring = Keyring::load(&path).await.unwrap();
    let err = keyring.install(vec![0u8; 7]).await.unwrap_err();
    assert!(matches!(err, MusterError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_duplicate_install_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyring.json");
    let mut keyring = Keyring::load(&path).await.unwrap();
    keyring.install(key(1)).await.unwrap();
    keyring.install(key(1)).await.unwrap();
    assert_eq!(keyring.keys().len(), 1);
}
