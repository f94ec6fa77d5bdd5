//! Bucket encryption for heap files.
//!
//! Key hierarchy: the password goes through Argon2id (parameters stored in
//! the header) to 64 bytes of key material. The first half is the AES-KW
//! key-encryption key; the SHA-256 of the second half is stored so a wrong
//! password is caught before any bucket is touched. The KEK wraps a random
//! 64-byte master key, which is the AES-256-XTS key for bucket data. Each
//! bucket is one XTS sector tweaked with its heap index.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::KeyInit;
use aes::Aes256;
use aes_kw::Kek;
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngExt;
use sha2::{Digest, Sha256};
use xts_mode::{get_tweak_default, Xts128};

use crate::{HeapError, KdfParams};

const MASTER_KEY_LEN: usize = 64;
const SALT_LEN: usize = 16;
const KEK_LEN: usize = 32;
const VERIFIER_LEN: usize = 32;
/// AES-KW adds one 8-byte integrity block.
const WRAPPED_KEY_LEN: usize = MASTER_KEY_LEN + 8;

/// XTS cannot encrypt a sector shorter than one AES block.
pub(crate) const MIN_ENCRYPTED_BUCKET_SIZE: usize = 16;

/// Serialized size of [`EncryptionConfig`]:
/// salt | m_cost u32 | t_cost u32 | p_cost u8 | verifier | wrapped master key.
pub(crate) const ENCRYPTION_CONFIG_SIZE: usize =
    SALT_LEN + 4 + 4 + 1 + VERIFIER_LEN + WRAPPED_KEY_LEN;

/// What a heap header records about its encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncryptionConfig {
    salt: [u8; SALT_LEN],
    kdf: KdfParams,
    verifier: [u8; VERIFIER_LEN],
    wrapped_key: [u8; WRAPPED_KEY_LEN],
}

impl EncryptionConfig {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCRYPTION_CONFIG_SIZE);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.kdf.m_cost.to_le_bytes());
        out.extend_from_slice(&self.kdf.t_cost.to_le_bytes());
        // create() refuses p_cost above u8::MAX
        out.push(self.kdf.p_cost as u8);
        out.extend_from_slice(&self.verifier);
        out.extend_from_slice(&self.wrapped_key);
        out
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self, HeapError> {
        if data.len() < ENCRYPTION_CONFIG_SIZE {
            return Err(HeapError::IoError(format!(
                "encryption config is {} bytes, need {}",
                data.len(),
                ENCRYPTION_CONFIG_SIZE
            )));
        }
        let (salt, rest) = data.split_at(SALT_LEN);
        let (m_cost, rest) = rest.split_at(4);
        let (t_cost, rest) = rest.split_at(4);
        let (p_cost, rest) = rest.split_at(1);
        let (verifier, rest) = rest.split_at(VERIFIER_LEN);
        let wrapped_key = &rest[..WRAPPED_KEY_LEN];

        Ok(EncryptionConfig {
            salt: fixed(salt),
            kdf: KdfParams {
                m_cost: u32::from_le_bytes(fixed(m_cost)),
                t_cost: u32::from_le_bytes(fixed(t_cost)),
                p_cost: p_cost[0] as u32,
            },
            verifier: fixed(verifier),
            wrapped_key: fixed(wrapped_key),
        })
    }
}

/// Copy a slice whose length is already known to be `N`.
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// KEK plus password verifier, both derived from the password.
struct KeyMaterial {
    kek: [u8; KEK_LEN],
    verifier: [u8; VERIFIER_LEN],
}

impl KeyMaterial {
    fn derive(password: &[u8], salt: &[u8; SALT_LEN], kdf: &KdfParams) -> Result<Self, HeapError> {
        let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(KEK_LEN + 32))
            .map_err(|e| HeapError::Configuration(format!("argon2id params: {}", e)))?;
        let mut derived = [0u8; KEK_LEN + 32];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(password, salt, &mut derived)
            .map_err(|e| HeapError::IoError(format!("argon2id derivation failed: {}", e)))?;

        Ok(KeyMaterial {
            kek: fixed(&derived[..KEK_LEN]),
            verifier: Sha256::digest(&derived[KEK_LEN..]).into(),
        })
    }
}

/// Unlocked XTS cipher for one heap. Shared between device clones behind an
/// `Arc`, so Argon2id only runs once per open.
pub(crate) struct HeapCipher {
    master_key: [u8; MASTER_KEY_LEN],
    xts: Xts128<Aes256>,
}

impl std::fmt::Debug for HeapCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapCipher").finish_non_exhaustive()
    }
}

impl HeapCipher {
    /// Set up encryption for a new heap: random salt and master key, wrapped
    /// under a password-derived KEK.
    pub(crate) fn create(password: &[u8], kdf: &KdfParams) -> Result<(EncryptionConfig, Self), HeapError> {
        if kdf.p_cost > u8::MAX as u32 {
            return Err(HeapError::Configuration(format!(
                "argon2id parallelism {} is above {}",
                kdf.p_cost,
                u8::MAX
            )));
        }
        let mut rng = rand::rng();
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt);
        let mut master_key = [0u8; MASTER_KEY_LEN];
        rng.fill(&mut master_key);

        let keys = KeyMaterial::derive(password, &salt, kdf)?;
        let mut wrapped_key = [0u8; WRAPPED_KEY_LEN];
        Kek::from(keys.kek)
            .wrap(&master_key, &mut wrapped_key)
            .map_err(|e| HeapError::IoError(format!("AES-KW wrap failed: {:?}", e)))?;

        let config = EncryptionConfig {
            salt,
            kdf: *kdf,
            verifier: keys.verifier,
            wrapped_key,
        };
        Ok((config, Self::from_master_key(master_key)))
    }

    /// Check `password` against `config` and recover the master key.
    pub(crate) fn unlock(config: &EncryptionConfig, password: &[u8]) -> Result<Self, HeapError> {
        let keys = KeyMaterial::derive(password, &config.salt, &config.kdf)?;
        if keys.verifier != config.verifier {
            return Err(HeapError::WrongPassword(
                "password does not match this heap".to_string(),
            ));
        }
        let mut master_key = [0u8; MASTER_KEY_LEN];
        Kek::from(keys.kek)
            .unwrap(&config.wrapped_key, &mut master_key)
            .map_err(|_| HeapError::WrongPassword("AES-KW unwrap failed".to_string()))?;
        Ok(Self::from_master_key(master_key))
    }

    fn from_master_key(master_key: [u8; MASTER_KEY_LEN]) -> Self {
        let (data_key, tweak_key) = master_key.split_at(MASTER_KEY_LEN / 2);
        let xts = Xts128::new(
            Aes256::new(GenericArray::from_slice(data_key)),
            Aes256::new(GenericArray::from_slice(tweak_key)),
        );
        HeapCipher { master_key, xts }
    }

    pub(crate) fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Encrypt consecutive buckets in place; chunk `i` of `data` is bucket
    /// `first_bucket + i`.
    pub(crate) fn encrypt_run(&self, data: &mut [u8], bucket_size: usize, first_bucket: u64) {
        self.xts
            .encrypt_area(data, bucket_size, first_bucket as u128, get_tweak_default);
    }

    pub(crate) fn decrypt_run(&self, data: &mut [u8], bucket_size: usize, first_bucket: u64) {
        self.xts
            .decrypt_area(data, bucket_size, first_bucket as u128, get_tweak_default);
    }
}
