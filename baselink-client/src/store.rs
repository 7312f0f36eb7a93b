//! File-backed key storage: the app's static noise keypair and the set of
//! base static keys the user has verified. One TOML file under the config
//! dir; shared by every session, so access is serialized here.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use baselink_core::identity::{Keypair, PublicKey};
use baselink_core::pairing::PairingStore;
use serde::{Deserialize, Serialize};

const STORE_FILE: &str = "keystore.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    /// Hex-encoded X25519 static secret of this app.
    app_static_secret: Option<String>,
    /// Hex-encoded static public keys of bases that completed pairing.
    #[serde(default)]
    trusted_base_keys: Vec<String>,
}

pub struct KeyStore {
    path: PathBuf,
    inner: Mutex<StoreFile>,
}

impl KeyStore {
    /// Open (or start fresh in) `dir`. A corrupt file is logged and treated
    /// as empty; the worst case is re-generating a key and re-pairing.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(STORE_FILE);
        let inner = match std::fs::read_to_string(&path) {
            Ok(s) => match toml::from_str::<StoreFile>(&s) {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!("ignoring unparseable key store {}: {err}", path.display());
                    StoreFile::default()
                }
            },
            Err(_) => StoreFile::default(),
        };
        Self {
            path,
            inner: Mutex::new(inner),
        }
    }

    /// The app's long-term keypair. Generated and persisted on first call;
    /// a failed write is logged and the key lives only for this process.
    pub fn app_keypair(&self) -> Keypair {
        let mut inner = self.inner.lock().expect("key store lock poisoned");
        if let Some(stored) = inner.app_static_secret.as_ref().and_then(decode_key) {
            return Keypair::from_secret_bytes(stored);
        }
        let keypair = Keypair::generate();
        tracing::info!("generated new app static keypair");
        inner.app_static_secret = Some(hex::encode(keypair.secret_bytes()));
        if let Err(err) = save(&self.path, &inner) {
            tracing::error!("could not store app static keypair: {err}");
        }
        keypair
    }
}

impl PairingStore for KeyStore {
    fn contains(&self, key: &PublicKey) -> bool {
        let inner = self.inner.lock().expect("key store lock poisoned");
        let encoded = hex::encode(key.as_bytes());
        inner.trusted_base_keys.iter().any(|k| *k == encoded)
    }

    fn add(&self, key: &PublicKey) -> Result<(), std::io::Error> {
        let mut inner = self.inner.lock().expect("key store lock poisoned");
        let encoded = hex::encode(key.as_bytes());
        if !inner.trusted_base_keys.contains(&encoded) {
            inner.trusted_base_keys.push(encoded);
        }
        save(&self.path, &inner)
    }
}

fn decode_key(encoded: &String) -> Option<[u8; 32]> {
    let bytes = hex::decode(encoded).ok()?;
    bytes.try_into().ok()
}

fn save(path: &Path, file: &StoreFile) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(file)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    std::fs::write(path, body)
}
