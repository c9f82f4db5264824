use anyhow::Result;

use crate::config::{Config, Role, StoreBackend};

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLUSTER_NAME".into(), "ESPRESSO_STORAGE".into()),
        ("ROLE".into(), "participant".into()),
        ("INSTANCE_HOST".into(), "localhost".into()),
        ("INSTANCE_PORT".into(), "12918".into()),
        ("STORE_BACKEND".into(), "memory".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(
        config.cluster_name == "ESPRESSO_STORAGE",
        "unexpected value parsed for CLUSTER_NAME, got {}, expected {}",
        config.cluster_name,
        "ESPRESSO_STORAGE"
    );
    assert!(config.role == Role::Participant, "unexpected value parsed for ROLE, got {:?}, expected {:?}", config.role, Role::Participant);
    assert!(
        config.instance_host == "localhost",
        "unexpected value parsed for INSTANCE_HOST, got {}, expected {}",
        config.instance_host,
        "localhost"
    );
    assert!(
        config.instance_port == 12918,
        "unexpected value parsed for INSTANCE_PORT, got {}, expected {}",
        config.instance_port,
        "12918"
    );
    assert!(
        config.store_backend == StoreBackend::Memory,
        "unexpected value parsed for STORE_BACKEND, got {:?}, expected {:?}",
        config.store_backend,
        StoreBackend::Memory
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLUSTER_NAME".into(), "ESPRESSO_STORAGE".into()),
        ("ROLE".into(), "combined".into()),
        ("INSTANCE_HOST".into(), "localhost".into()),
        ("INSTANCE_PORT".into(), "12918".into()),
    ])?;

    assert!(config.role == Role::Combined, "unexpected value parsed for ROLE, got {:?}, expected {:?}", config.role, Role::Combined);
    assert!(
        config.store_backend == StoreBackend::Memory,
        "unexpected default for STORE_BACKEND, got {:?}, expected {:?}",
        config.store_backend,
        StoreBackend::Memory
    );

    Ok(())
}
