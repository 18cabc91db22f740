//! Ed25519 approval signing keys.
//!
//! Key material lives under the agent's `keys/` directory: `keyring.json`
//! holds public records and the current key id; each private scalar is
//! AEAD-encrypted under an Argon2id-derived key in `<key_id>.key`. Signing
//! requires an explicit [`ApprovalKeyManager::unlock`]; verification never
//! does.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use aes_gcm::Aes256Gcm;
use aes_gcm::Key;
use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use argon2::Argon2;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AutopoiesisErr;
use crate::error::Result;
use crate::util::utc_now_epoch;

const KEYRING_FILENAME: &str = "keyring.json";
const KDF_NAME: &str = "argon2id";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    key_id: String,
    public_key_hex: String,
    created_at: i64,
    #[serde(default)]
    revoked_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Keyring {
    #[serde(default)]
    current_key_id: Option<String>,
    #[serde(default)]
    keys: Vec<KeyRecord>,
}

/// On-disk form of one encrypted private key.
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    kdf: String,
    salt_hex: String,
    nonce_hex: String,
    ciphertext_hex: String,
}

struct KeyState {
    keyring: Keyring,
    /// Private scalar cached in process memory after a successful unlock.
    unlocked: Option<SigningKey>,
}

pub struct ApprovalKeyManager {
    keys_dir: PathBuf,
    state: Mutex<KeyState>,
}

impl ApprovalKeyManager {
    /// Open (or start) the keyring under `keys_dir`. The directory is
    /// created; the keyring file is only written once a key exists.
    pub fn open(keys_dir: impl Into<PathBuf>) -> Result<Self> {
        let keys_dir = keys_dir.into();
        std::fs::create_dir_all(&keys_dir)?;
        let keyring_path = keys_dir.join(KEYRING_FILENAME);
        let keyring = if keyring_path.is_file() {
            let raw = std::fs::read_to_string(&keyring_path)?;
            serde_json::from_str(&raw)?
        } else {
            Keyring::default()
        };
        Ok(Self {
            keys_dir,
            state: Mutex::new(KeyState {
                keyring,
                unlocked: None,
            }),
        })
    }

    /// Whether a current signing key exists. This is the worker-side
    /// "approval unlocked" gate: envelope creation only needs the public
    /// current key id.
    pub fn has_keys(&self) -> bool {
        self.lock_state().keyring.current_key_id.is_some()
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_state().unlocked.is_some()
    }

    pub fn current_key_id(&self) -> Result<String> {
        self.lock_state()
            .keyring
            .current_key_id
            .clone()
            .ok_or(AutopoiesisErr::KeyringMissing)
    }

    /// Generate the first keypair, encrypting the private scalar under
    /// `passphrase`. Fails if a key already exists.
    pub fn create_initial_key(&self, passphrase: &str) -> Result<String> {
        {
            let state = self.lock_state();
            if state.keyring.current_key_id.is_some() {
                return Err(AutopoiesisErr::KeyringExists);
            }
        }
        self.generate_key(passphrase)
    }

    /// Generate a new keypair and mark it current. Prior public keys stay in
    /// the keyring so old envelopes remain verifiable.
    pub fn rotate(&self, passphrase: &str) -> Result<String> {
        // Rotation proves knowledge of the passphrase by unlocking the
        // current key first.
        self.unlock(passphrase)?;
        self.generate_key(passphrase)
    }

    /// Decrypt the current private key and cache it for signing.
    pub fn unlock(&self, passphrase: &str) -> Result<()> {
        let key_id = self.current_key_id()?;
        let raw = std::fs::read_to_string(self.key_file_path(&key_id))?;
        let encrypted: EncryptedKeyFile = serde_json::from_str(&raw)?;
        let salt = decode_hex_field(&encrypted.salt_hex)?;
        let nonce = decode_hex_field(&encrypted.nonce_hex)?;
        let ciphertext = decode_hex_field(&encrypted.ciphertext_hex)?;
        if nonce.len() != 12 {
            return Err(AutopoiesisErr::BadPassphrase);
        }

        let kek = derive_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| AutopoiesisErr::BadPassphrase)?;
        let scalar: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| AutopoiesisErr::BadPassphrase)?;

        let mut state = self.lock_state();
        state.unlocked = Some(SigningKey::from_bytes(&scalar));
        Ok(())
    }

    /// Drop the cached private key.
    pub fn lock(&self) {
        self.lock_state().unlocked = None;
    }

    /// Sign `payload` with the unlocked current key; hex signature out.
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let state = self.lock_state();
        let key = state.unlocked.as_ref().ok_or(AutopoiesisErr::LockedKey)?;
        let signature: Signature = key.sign(payload);
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Resolve a verifying key from the keyring. Never requires unlock.
    pub fn resolve_public_key(&self, key_id: &str) -> Option<VerifyingKey> {
        let state = self.lock_state();
        let record = state.keyring.keys.iter().find(|k| k.key_id == key_id)?;
        let bytes = hex::decode(&record.public_key_hex).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }

    /// Verify `sig_hex` over `payload` with the named key. Never requires
    /// unlock; any malformed input verifies false.
    pub fn verify_signature(&self, key_id: &str, payload: &[u8], sig_hex: &str) -> bool {
        let Some(public_key) = self.resolve_public_key(key_id) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        public_key.verify(payload, &signature).is_ok()
    }

    fn generate_key(&self, passphrase: &str) -> Result<String> {
        let mut rng = rand::rng();
        let scalar: [u8; 32] = rng.random();
        let salt: [u8; 16] = rng.random();
        let nonce: [u8; 12] = rng.random();

        let signing_key = SigningKey::from_bytes(&scalar);
        let key_id = Uuid::new_v4().to_string();

        let kek = derive_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), scalar.as_ref())
            .map_err(|_| AutopoiesisErr::BadPassphrase)?;

        let key_file = EncryptedKeyFile {
            kdf: KDF_NAME.to_string(),
            salt_hex: hex::encode(salt),
            nonce_hex: hex::encode(nonce),
            ciphertext_hex: hex::encode(ciphertext),
        };
        write_private_file(
            &self.key_file_path(&key_id),
            &serde_json::to_string_pretty(&key_file)?,
        )?;

        let mut state = self.lock_state();
        state.keyring.keys.push(KeyRecord {
            key_id: key_id.clone(),
            public_key_hex: hex::encode(signing_key.verifying_key().to_bytes()),
            created_at: utc_now_epoch(),
            revoked_at: None,
        });
        state.keyring.current_key_id = Some(key_id.clone());
        write_private_file(
            &self.keys_dir.join(KEYRING_FILENAME),
            &serde_json::to_string_pretty(&state.keyring)?,
        )?;
        state.unlocked = Some(signing_key);
        Ok(key_id)
    }

    fn key_file_path(&self, key_id: &str) -> PathBuf {
        self.keys_dir.join(format!("{key_id}.key"))
    }

    // Poisoned mutex means a panic mid-mutation; propagating the panic is
    // the only sound option.
    #[allow(clippy::unwrap_used)]
    fn lock_state(&self) -> std::sync::MutexGuard<'_, KeyState> {
        self.state.lock().unwrap()
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|_| AutopoiesisErr::BadPassphrase)?;
    Ok(out)
}

fn decode_hex_field(raw: &str) -> Result<Vec<u8>> {
    hex::decode(raw).map_err(|_| AutopoiesisErr::BadPassphrase)
}

/// Write key material with owner-only permissions.
fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn manager() -> (tempfile::TempDir, ApprovalKeyManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ApprovalKeyManager::open(dir.path().join("keys")).unwrap();
        (dir, manager)
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let (_dir, manager) = manager();
        let key_id = manager.create_initial_key("hunter2").unwrap();
        let sig = manager.sign(b"payload").unwrap();
        assert!(manager.verify_signature(&key_id, b"payload", &sig));
        assert!(!manager.verify_signature(&key_id, b"tampered", &sig));
    }

    #[test]
    fn sign_fails_when_locked() {
        let (dir, manager) = manager();
        manager.create_initial_key("hunter2").unwrap();
        drop(manager);

        let reopened = ApprovalKeyManager::open(dir.path().join("keys")).unwrap();
        assert!(matches!(
            reopened.sign(b"payload"),
            Err(AutopoiesisErr::LockedKey)
        ));
        reopened.unlock("hunter2").unwrap();
        assert!(reopened.sign(b"payload").is_ok());
    }

    #[test]
    fn bad_passphrase_is_rejected() {
        let (dir, manager) = manager();
        manager.create_initial_key("hunter2").unwrap();
        drop(manager);

        let reopened = ApprovalKeyManager::open(dir.path().join("keys")).unwrap();
        assert!(matches!(
            reopened.unlock("wrong"),
            Err(AutopoiesisErr::BadPassphrase)
        ));
    }

    #[test]
    fn rotation_keeps_old_keys_verifiable() {
        let (_dir, manager) = manager();
        let old_id = manager.create_initial_key("hunter2").unwrap();
        let old_sig = manager.sign(b"payload").unwrap();

        let new_id = manager.rotate("hunter2").unwrap();
        assert_ne!(old_id, new_id);
        assert_eq!(manager.current_key_id().unwrap(), new_id);
        assert!(manager.verify_signature(&old_id, b"payload", &old_sig));
    }

    #[test]
    fn double_init_is_refused() {
        let (_dir, manager) = manager();
        manager.create_initial_key("hunter2").unwrap();
        assert!(matches!(
            manager.create_initial_key("hunter2"),
            Err(AutopoiesisErr::KeyringExists)
        ));
    }

    #[test]
    fn verification_never_requires_unlock() {
        let (dir, manager) = manager();
        let key_id = manager.create_initial_key("hunter2").unwrap();
        let sig = manager.sign(b"payload").unwrap();
        drop(manager);

        let reopened = ApprovalKeyManager::open(dir.path().join("keys")).unwrap();
        assert!(!reopened.is_unlocked());
        assert!(reopened.verify_signature(&key_id, b"payload", &sig));
    }
}
