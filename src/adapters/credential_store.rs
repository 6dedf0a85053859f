use std::collections::HashMap;

use eyre::{Result, WrapErr};
use http::HeaderName;

use crate::{
    config::models::{AuthConfig, DEFAULT_CREDENTIAL_HEADER},
    ports::credential_store::CredentialStore,
};

/// Credential store backed by the API keys listed in configuration.
///
/// The secret → identity table is built once and never changes.
#[derive(Debug, Clone)]
pub struct StaticCredentialStore {
    header: HeaderName,
    label: String,
    keys: HashMap<String, String>,
}

impl StaticCredentialStore {
    /// Build a store from `secret → identity` pairs. Pairs with an empty secret or
    /// identity are dropped.
    pub fn new<I, S, T>(header: &str, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let header = header.trim();
        let header = if header.is_empty() {
            DEFAULT_CREDENTIAL_HEADER
        } else {
            header
        };
        let label = header.to_string();
        let header = HeaderName::from_bytes(header.as_bytes())
            .wrap_err_with(|| format!("invalid credential header name '{header}'"))?;

        let keys = pairs
            .into_iter()
            .map(|(secret, id)| (secret.into(), id.into()))
            .filter(|(secret, id)| !secret.is_empty() && !id.is_empty())
            .collect();

        Ok(Self {
            header,
            label,
            keys,
        })
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let store = Self::new(
            &config.header,
            config
                .keys
                .iter()
                .map(|key| (key.secret.clone(), key.id.clone())),
        )?;
        tracing::info!(
            header = %store.label,
            keys = store.len(),
            "Loaded API keys"
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl CredentialStore for StaticCredentialStore {
    fn header_name(&self) -> &HeaderName {
        &self.header
    }

    fn header_label(&self) -> &str {
        &self.label
    }

    fn lookup(&self, secret: &str) -> Option<String> {
        self.keys.get(secret.trim()).cloned()
    }
}
