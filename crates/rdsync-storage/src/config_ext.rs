//! Typed config entries: a serde value stored as JSON under the `value` key.

use rdsync_core::{RdsyncError, RdsyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::accessor::{ConfigMap, StorageAccessor};

const VALUE_KEY: &str = "value";

fn decode<T: DeserializeOwned>(name: &str, config: &ConfigMap) -> RdsyncResult<T> {
    let raw = config
        .get(VALUE_KEY)
        .ok_or_else(|| RdsyncError::Config(format!("config {name} has no value")))?;
    serde_json::from_str(raw).map_err(|e| RdsyncError::Config(format!("config {name}: {e}")))
}

pub async fn try_get_config_value<T: DeserializeOwned>(
    storage: &dyn StorageAccessor,
    name: &str,
) -> RdsyncResult<Option<T>> {
    match storage.get_config(name).await? {
        Some(config) => decode(name, &config).map(Some),
        None => Ok(None),
    }
}

pub async fn get_config_value<T: DeserializeOwned>(
    storage: &dyn StorageAccessor,
    name: &str,
) -> RdsyncResult<T> {
    try_get_config_value(storage, name)
        .await?
        .ok_or_else(|| RdsyncError::Config(format!("config {name} not found")))
}

pub async fn set_config_value<T: Serialize>(
    storage: &dyn StorageAccessor,
    name: &str,
    value: &T,
) -> RdsyncResult<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| RdsyncError::Config(format!("config {name}: {e}")))?;
    let mut config = ConfigMap::new();
    config.insert(VALUE_KEY.to_string(), json);
    storage.set_config(name, &config).await
}

/// Typed values of every config entry under `prefix`. Entries that fail to
/// decode are an error, not skipped.
pub async fn config_values_with_prefix<T: DeserializeOwned>(
    storage: &dyn StorageAccessor,
    prefix: &str,
    skip: usize,
    take: usize,
) -> RdsyncResult<Vec<T>> {
    storage
        .configs_with_prefix(prefix, skip, take)
        .await?
        .iter()
        .map(|(name, config)| decode(name, config))
        .collect()
}
