use std::sync::Arc;

use genevault::{
    CloudKey, CloudKeyBackend, FileKeyStore, KeyManager, KeyMaterial, KeyStore, KmsConfig,
    KmsProvider, VaultError,
};
use tempfile::TempDir;

fn manager_over(dir: &TempDir, master: &KeyMaterial) -> Arc<KeyManager<dyn KeyStore>> {
    let store: Arc<dyn KeyStore> = Arc::new(
        FileKeyStore::open(dir.path().join("keys.json"), master).expect("open key store"),
    );
    Arc::new(KeyManager::new(store))
}

#[tokio::test]
async fn local_backend_round_trips_against_durable_keys() {
    let dir = TempDir::new().expect("tempdir");
    let master = KeyMaterial::random();

    let blob = {
        let backend =
            CloudKeyBackend::from_config(&KmsConfig::local(), manager_over(&dir, &master)).await;
        assert_eq!(backend.provider(), KmsProvider::Local);
        backend
            .encrypt("health_data_key", b"blood_type:O+")
            .await
            .expect("encrypt")
    };

    // a second backend over the same key document reads the first one's blob
    let backend =
        CloudKeyBackend::from_config(&KmsConfig::local(), manager_over(&dir, &master)).await;
    let plaintext = backend
        .decrypt("health_data_key", &blob)
        .await
        .expect("decrypt");
    assert_eq!(plaintext, b"blood_type:O+");
}

#[tokio::test]
async fn local_keys_are_raw_material() {
    let dir = TempDir::new().expect("tempdir");
    let master = KeyMaterial::random();
    let backend =
        CloudKeyBackend::from_config(&KmsConfig::local(), manager_over(&dir, &master)).await;

    let key = backend.get_key("dna_data_key").await.expect("get key");
    match key {
        CloudKey::Material(material) => assert_eq!(material.as_bytes().len(), 32),
        CloudKey::Path(path) => panic!("local backend returned a path: {path}"),
    }
}

#[tokio::test]
async fn tampered_blobs_fail_decryption() {
    let dir = TempDir::new().expect("tempdir");
    let master = KeyMaterial::random();
    let backend =
        CloudKeyBackend::from_config(&KmsConfig::local(), manager_over(&dir, &master)).await;

    let blob = backend
        .encrypt("health_data_key", b"vitals: ok")
        .await
        .expect("encrypt");
    let err = backend
        .decrypt("health_data_key", b"garbage blob")
        .await
        .expect_err("garbage must fail");
    assert!(matches!(err, VaultError::DecryptionFailed(_)));
    // untampered blob still reads fine afterwards
    backend
        .decrypt("health_data_key", &blob)
        .await
        .expect("decrypt");
}

#[tokio::test]
async fn selected_cloud_provider_without_settings_stays_selected_but_unavailable() {
    let dir = TempDir::new().expect("tempdir");
    let master = KeyMaterial::random();

    for provider in [KmsProvider::Aws, KmsProvider::Azure, KmsProvider::Gcp] {
        let mut config = KmsConfig::local();
        config.provider = provider;
        let backend = CloudKeyBackend::from_config(&config, manager_over(&dir, &master)).await;

        // selection sticks: no silent fallback to the local key source
        assert_eq!(backend.provider(), provider);
        assert!(!backend.is_available());

        let err = backend
            .generate_key("health_data_key")
            .await
            .expect_err("unavailable backend must refuse");
        assert!(matches!(err, VaultError::BackendUnavailable(_)));
        let err = backend
            .decrypt("health_data_key", b"anything")
            .await
            .expect_err("unavailable backend must refuse");
        assert!(matches!(err, VaultError::BackendUnavailable(_)));
    }
}

#[tokio::test]
async fn unrecognized_selector_falls_back_to_local() {
    let dir = TempDir::new().expect("tempdir");
    let master = KeyMaterial::random();

    let mut config = KmsConfig::local();
    config.provider = KmsProvider::from_config_value("some-unknown-vendor");
    let backend = CloudKeyBackend::from_config(&config, manager_over(&dir, &master)).await;
    assert_eq!(backend.provider(), KmsProvider::Local);
    assert!(backend.is_available());
}
