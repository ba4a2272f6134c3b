#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const VAULT_SERVICE_NAME: &str = "geocode-backfill";
pub const PROVIDER_KEY_ALIAS: &str = "provider-api-key";

/// OS keychain access for the provider credential, so the key does not have
/// to live in the environment of an unattended run.
#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    #[cfg(test)]
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn get(&self, account: &str) -> AppResult<Option<SecretString>> {
        let secret = match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Some(SecretString::from(value)),
                    Err(keyring::Error::NoEntry) => None,
                    Err(err) => return Err(AppError::from(err)),
                }
            }
            #[cfg(test)]
            SecretBackend::Memory(store) => store.lock().get(account).cloned(),
        };
        debug!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            found = secret.is_some(),
            "looked up secret"
        );
        Ok(secret)
    }

    pub fn store(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
            }
            #[cfg(test)]
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
            }
        }
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "stored secret in secure backend"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_is_none() {
        let vault = SecretVault::in_memory();
        assert!(vault.get(PROVIDER_KEY_ALIAS).unwrap().is_none());
    }

    #[test]
    fn stored_secret_is_returned() {
        let vault = SecretVault::in_memory();
        vault
            .store(PROVIDER_KEY_ALIAS, &SecretString::from("ak-test".to_string()))
            .unwrap();

        let loaded = vault.get(PROVIDER_KEY_ALIAS).unwrap().unwrap();
        assert_eq!(loaded.expose_secret(), "ak-test");
    }
}
