//! Secure storage for the USPTO API key.
//!
//! Uses the platform credential store (Keychain on macOS, Credential
//! Manager on Windows, Secret Service on Linux) via the keyring crate.
//! The key never touches the database or any config file.

use thiserror::Error;
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "PatentStatusTracker";
const API_KEY_ENTRY: &str = "uspto_api_key";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credential store error: {0}")]
    Keyring(String),
}

/// Credential store for the USPTO API key.
pub struct Credentials;

impl Credentials {
    fn entry() -> Result<keyring::Entry, CredentialsError> {
        keyring::Entry::new(SERVICE_NAME, API_KEY_ENTRY)
            .map_err(|e| CredentialsError::Keyring(e.to_string()))
    }

    /// Store the API key, replacing any existing one.
    pub fn store_api_key(api_key: &str) -> Result<(), CredentialsError> {
        Self::entry()?
            .set_password(api_key)
            .map_err(|e| CredentialsError::Keyring(e.to_string()))
    }

    /// Retrieve the API key, or `None` if no key has been stored.
    ///
    /// The returned value is zeroed when dropped.
    pub fn get_api_key() -> Result<Option<Zeroizing<String>>, CredentialsError> {
        match Self::entry()?.get_password() {
            Ok(key) => Ok(Some(Zeroizing::new(key))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialsError::Keyring(e.to_string())),
        }
    }

    /// Delete the stored API key. Deleting a missing key is not an error.
    pub fn delete_api_key() -> Result<(), CredentialsError> {
        match Self::entry()?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialsError::Keyring(e.to_string())),
        }
    }

    /// Check whether an API key is stored.
    pub fn has_api_key() -> bool {
        matches!(Self::get_api_key(), Ok(Some(_)))
    }
}
