//! Encrypted-at-rest storage for OAuth credentials
//!
//! Credentials are serialized to JSON and sealed with AES-256-GCM. The key is
//! generated once per installation and stored unencrypted next to the
//! ciphertext, so this only keeps tokens away from casual disk inspection.
//! Anyone who can read the data directory can decrypt them.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{Error, Result};

const KEY_FILE: &str = "encryption.key";
const CREDENTIALS_FILE: &str = "dropbox_tokens.enc";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// OAuth credentials for the remote store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Encrypted credential file plus its key file
pub struct CredentialVault {
    cipher: Aes256Gcm,
    file_path: PathBuf,
    lock: RwLock<()>,
}

impl CredentialVault {
    /// Open the vault in `dir`, generating the installation key on first use.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let key = load_or_generate_key(&dir.join(KEY_FILE))?;
        let cipher = Aes256Gcm::new(&key);

        Ok(Self {
            cipher,
            file_path: dir.join(CREDENTIALS_FILE),
            lock: RwLock::new(()),
        })
    }

    /// Encrypt and persist `credentials`, replacing any previous record.
    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        let _guard = self.lock.write();

        let plaintext = serde_json::to_vec(credentials)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| Error::Encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        write_private(&self.file_path, &sealed)?;
        debug!("Saved credentials expiring at {}", credentials.expires_at);
        Ok(())
    }

    /// Load the stored credentials, `None` if nothing has been saved.
    pub fn load(&self) -> Result<Option<Credentials>> {
        let _guard = self.lock.read();

        let sealed = match fs::read(&self.file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if sealed.len() < NONCE_LEN {
            return Err(Error::Encryption("Ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Encryption(format!("Decryption failed: {}", e)))?;

        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Remove the stored credentials. Deleting nothing is not an error.
    pub fn delete(&self) -> Result<()> {
        let _guard = self.lock.write();

        match fs::remove_file(&self.file_path) {
            Ok(()) => {
                info!("Deleted stored credentials");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn load_or_generate_key(path: &Path) -> Result<Key<Aes256Gcm>> {
    match fs::read(path) {
        Ok(bytes) => {
            if bytes.len() != KEY_LEN {
                return Err(Error::Encryption(format!(
                    "Key file {} has {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    KEY_LEN
                )));
            }
            Ok(*Key::<Aes256Gcm>::from_slice(&bytes))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let key = Aes256Gcm::generate_key(&mut OsRng);
            write_private(path, &key)?;
            info!("Generated new credential key at {}", path.display());
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
