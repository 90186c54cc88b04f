//! Application settings repository with encrypted values
//!
//! Plain settings live in the `value` column; secrets are sealed with
//! AES-256-GCM under a key derived from the configured passphrase and a
//! per-database salt. Exactly one of `value` / `encrypted_value` is populated
//! for any setting that has a value.

use crate::error::{AppError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use tracing::debug;

const SALT_SETTING: &str = "Encryption.Salt";
const PBKDF2_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;

/// Default system prompt for plain chat turns
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer using the provided \
knowledge context when it is present; when the context is empty, say that no relevant \
information was found before answering from general knowledge.";

/// Extended instructions used when the caller opts into coding guidance
const DEFAULT_CODING_PROMPT: &str = "You are a helpful assistant for software engineers. Answer \
using the provided knowledge context when it is present, preserve code blocks verbatim with \
their language tags, and prefer concrete, runnable examples.";

/// Derive the settings key, creating the per-database salt on first open.
pub(crate) async fn bootstrap_encryption(pool: &SqlitePool, passphrase: &str) -> Result<[u8; 32]> {
    let existing = sqlx::query("SELECT value FROM app_settings WHERE name = ?1")
        .bind(SALT_SETTING)
        .fetch_optional(pool)
        .await?;

    let salt: Vec<u8> = match existing.and_then(|row| row.get::<Option<String>, _>("value")) {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(|e| AppError::Config(format!("Corrupt encryption salt: {e}")))?,
        None => {
            let salt = Aes256Gcm::generate_key(OsRng).to_vec();
            let encoded = base64::engine::general_purpose::STANDARD.encode(&salt);
            sqlx::query(
                "INSERT INTO app_settings (name, value, is_encrypted, category, data_type) \
                 VALUES (?1, ?2, 0, 'Security', 'String')",
            )
            .bind(SALT_SETTING)
            .bind(&encoded)
            .execute(pool)
            .await?;
            debug!("Generated settings encryption salt");
            salt
        }
    };

    Ok(derive_key(passphrase, &salt))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Seal a value: random nonce prepended to the AES-GCM ciphertext.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| AppError::Config("Settings encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed value produced by [`encrypt`].
pub fn decrypt(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(AppError::Config("Sealed value too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| AppError::Config("Settings decryption failed".to_string()))
}

/// Chunking parameters resolved from settings
#[derive(Debug, Clone, Copy)]
pub struct ChunkingSettings {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub hard_char_cap: usize,
    pub max_code_fence_size: usize,
}

/// Repository over the `app_settings` table
#[derive(Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
    key: [u8; 32],
}

impl SettingsStore {
    pub(crate) fn new(pool: SqlitePool, key: [u8; 32]) -> Self {
        Self { pool, key }
    }

    /// Insert the default rows the service expects; existing rows are kept.
    pub async fn seed_defaults(&self) -> Result<()> {
        let defaults: &[(&str, &str, &str, &str)] = &[
            ("ChunkCharacterLimit", "4000", "Ingestion", "Integer"),
            ("ChunkOverlap", "200", "Ingestion", "Integer"),
            ("MaxCodeFenceSize", "6000", "Ingestion", "Integer"),
            ("TokenizerEncoding", "cl100k_base", "Ingestion", "String"),
            ("SystemPrompt", DEFAULT_SYSTEM_PROMPT, "Chat", "String"),
            ("SystemPromptWithCoding", DEFAULT_CODING_PROMPT, "Chat", "String"),
            ("Temperature", "0.7", "Chat", "String"),
            ("ChatMaxTurns", "10", "Chat", "Integer"),
            ("AgentMaxIterations", "5", "Chat", "Integer"),
            ("ContextDelimiter", "\n---\n", "Chat", "String"),
            ("Retrieval.K", "8", "Retrieval", "Integer"),
            ("Retrieval.MinScore", "0.6", "Retrieval", "String"),
            ("AnalyticsCacheTtlSeconds", "30", "Analytics", "Integer"),
            ("RealtimeMaxQueue", "256", "Analytics", "Integer"),
        ];

        for (name, default_value, category, data_type) in defaults {
            sqlx::query(
                "INSERT OR IGNORE INTO app_settings (name, value, is_encrypted, category, data_type, default_value) \
                 VALUES (?1, NULL, 0, ?2, ?3, ?4)",
            )
            .bind(name)
            .bind(category)
            .bind(data_type)
            .bind(default_value)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Resolve a plain setting, falling back to its seeded default.
    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, default_value FROM app_settings WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|row| {
            row.get::<Option<String>, _>("value")
                .or_else(|| row.get::<Option<String>, _>("default_value"))
        }))
    }

    pub async fn get_or(&self, name: &str, fallback: &str) -> Result<String> {
        Ok(self.get(name).await?.unwrap_or_else(|| fallback.to_string()))
    }

    pub async fn get_i64(&self, name: &str, fallback: i64) -> Result<i64> {
        Ok(self
            .get(name)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback))
    }

    pub async fn get_f32(&self, name: &str, fallback: f32) -> Result<f32> {
        Ok(self
            .get(name)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback))
    }

    /// Set a plain value; clears any encrypted payload for the name.
    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (name, value, is_encrypted, category, data_type) \
             VALUES (?1, ?2, 0, 'General', 'String') \
             ON CONFLICT(name) DO UPDATE SET value = ?2, encrypted_value = NULL, is_encrypted = 0",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seal and store a secret; clears any plain value for the name.
    pub async fn set_encrypted(&self, name: &str, plaintext: &str, category: &str) -> Result<()> {
        let sealed = encrypt(&self.key, plaintext.as_bytes())?;
        sqlx::query(
            "INSERT INTO app_settings (name, encrypted_value, is_encrypted, category, data_type) \
             VALUES (?1, ?2, 1, ?3, 'String') \
             ON CONFLICT(name) DO UPDATE SET encrypted_value = ?2, value = NULL, is_encrypted = 1, category = ?3",
        )
        .bind(name)
        .bind(&sealed)
        .bind(category)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retrieve and open a secret stored with [`set_encrypted`].
    pub async fn get_encrypted(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT encrypted_value FROM app_settings WHERE name = ?1 AND is_encrypted = 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row.and_then(|row| row.get::<Option<Vec<u8>>, _>("encrypted_value")) {
            Some(sealed) => {
                let plain = decrypt(&self.key, &sealed)?;
                Ok(Some(String::from_utf8(plain).map_err(|e| {
                    AppError::Config(format!("Encrypted setting is not UTF-8: {e}"))
                })?))
            }
            None => Ok(None),
        }
    }

    /// Current chunking parameters. The character limit doubles as the hard
    /// cap; token budgets assume roughly four characters per token.
    pub async fn chunking(&self) -> Result<ChunkingSettings> {
        let char_limit = self.get_i64("ChunkCharacterLimit", 4000).await?.max(64) as usize;
        let overlap = self.get_i64("ChunkOverlap", 200).await?.max(0) as usize;
        let fence = self.get_i64("MaxCodeFenceSize", 6000).await?.max(256) as usize;

        Ok(ChunkingSettings {
            max_tokens: (char_limit / 4).max(16),
            overlap_tokens: (overlap / 4).min(char_limit / 8),
            hard_char_cap: char_limit,
            max_code_fence_size: fence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_defaults_resolve_without_explicit_value() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let settings = db.settings();

        assert_eq!(settings.get_i64("Retrieval.K", 0).await.unwrap(), 8);
        assert_eq!(
            settings.get_f32("Retrieval.MinScore", 0.0).await.unwrap(),
            0.6
        );
        assert_eq!(settings.get_i64("ChatMaxTurns", 0).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_set_overrides_default() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let settings = db.settings();

        settings.set("Retrieval.K", "3").await.unwrap();
        assert_eq!(settings.get_i64("Retrieval.K", 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip_via_store() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let settings = db.settings();

        settings
            .set_encrypted("OpenAi.ApiKey", "sk-secret", "Providers")
            .await
            .unwrap();
        let value = settings.get_encrypted("OpenAi.ApiKey").await.unwrap();
        assert_eq!(value.as_deref(), Some("sk-secret"));

        // The plain column stays empty for encrypted settings
        let row = sqlx::query("SELECT value, is_encrypted FROM app_settings WHERE name = 'OpenAi.ApiKey'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let plain: Option<String> = row.get("value");
        let flagged: i64 = row.get("is_encrypted");
        assert!(plain.is_none());
        assert_eq!(flagged, 1);
    }

    #[tokio::test]
    async fn test_chunking_settings_derivation() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let chunking = db.settings().chunking().await.unwrap();
        assert_eq!(chunking.hard_char_cap, 4000);
        assert_eq!(chunking.max_tokens, 1000);
        assert_eq!(chunking.max_code_fence_size, 6000);
    }

    proptest! {
        #[test]
        fn prop_encrypt_decrypt_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = derive_key("passphrase", b"0123456789abcdef");
            let sealed = encrypt(&key, &data).unwrap();
            let opened = decrypt(&key, &sealed).unwrap();
            prop_assert_eq!(opened, data);
        }

        #[test]
        fn prop_decrypt_rejects_wrong_key(data in proptest::collection::vec(any::<u8>(), 1..128)) {
            let key = derive_key("passphrase", b"0123456789abcdef");
            let other = derive_key("different", b"0123456789abcdef");
            let sealed = encrypt(&key, &data).unwrap();
            prop_assert!(decrypt(&other, &sealed).is_err());
        }
    }
}
