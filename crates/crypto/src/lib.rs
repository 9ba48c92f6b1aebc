//! mcpgw-crypto - 会话记录的认证加密
//!
//! 密钥在构造时由配置的密钥经 Argon2id（固定的应用级盐）派生一次，
//! 加密使用 AES-256-GCM，IV 为 16 字节。
//!
//! 记录格式：`hex(IV[16] || tag[16] || ciphertext)`

use aes_gcm::{
    AesGcm,
    aead::{AeadInPlace, KeyInit, consts::U16, generic_array::GenericArray},
    aes::Aes256,
};
use argon2::Argon2;
use mcpgw_errors::{AppError, AppResult, Severity};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, de::DeserializeOwned};

/// AES-256-GCM，16 字节 nonce
type SessionCipher = AesGcm<Aes256, U16>;

/// IV 长度
pub const IV_LEN: usize = 16;
/// 认证标签长度
pub const TAG_LEN: usize = 16;
/// 密钥最小长度（字符）
pub const MIN_SECRET_LEN: usize = 32;

/// 固定的应用级盐：同一密钥在任何实例上派生出相同的加密密钥
const KDF_SALT: &[u8] = b"mcpgw.session-store.kdf.v1";

/// 完整性校验失败时的错误码
pub const INTEGRITY_ERROR_CODE: &str = "INTEGRITY_CHECK_FAILED";

/// 加密服务
///
/// 启动时创建一次，由上层组装代码注入到需要它的存储后端。
#[derive(Clone)]
pub struct CryptoService {
    cipher: SessionCipher,
}

impl std::fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoService").finish_non_exhaustive()
    }
}

impl CryptoService {
    /// 从配置的密钥派生加密密钥
    ///
    /// 密钥短于 32 个字符时返回 Configuration 错误（不可重试）。
    pub fn new(secret: &SecretString) -> AppResult<Self> {
        let secret = secret.expose_secret();
        if secret.chars().count() < MIN_SECRET_LEN {
            return Err(AppError::configuration(format!(
                "Encryption secret must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }

        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(secret.as_bytes(), KDF_SALT, &mut key)
            .map_err(|e| AppError::configuration(format!("Key derivation failed: {}", e)))?;

        let cipher = SessionCipher::new_from_slice(&key)
            .map_err(|e| AppError::configuration(format!("Invalid key length: {}", e)))?;
        key.fill(0);

        tracing::debug!("Session encryption key derived");
        Ok(Self { cipher })
    }

    /// 加密，返回十六进制编码的记录
    pub fn encrypt(&self, plaintext: &[u8]) -> AppResult<String> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| AppError::storage("Encryption failed"))?;

        let mut record = Vec::with_capacity(IV_LEN + TAG_LEN + buffer.len());
        record.extend_from_slice(&iv);
        record.extend_from_slice(&tag);
        record.extend_from_slice(&buffer);
        Ok(hex::encode(record))
    }

    /// 解密并校验认证标签
    ///
    /// 格式错误或标签校验失败都返回 Storage 错误；标签失败为 Critical。
    pub fn decrypt(&self, encoded: &str) -> AppResult<Vec<u8>> {
        let record = hex::decode(encoded.trim())
            .map_err(|e| AppError::storage(format!("Malformed encrypted record: {}", e)))?;
        if record.len() < IV_LEN + TAG_LEN {
            return Err(AppError::storage(format!(
                "Malformed encrypted record: {} bytes is shorter than IV and tag",
                record.len()
            )));
        }

        let (iv, rest) = record.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let mut buffer = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| {
                AppError::storage("Integrity check failed: record was tampered with or the key changed")
                    .with_severity(Severity::Critical)
                    .with_code(INTEGRITY_ERROR_CODE)
            })?;

        Ok(buffer)
    }

    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> AppResult<String> {
        let plaintext = serde_json::to_vec(value)
            .map_err(|e| AppError::storage(format!("Failed to serialize record: {}", e)))?;
        self.encrypt(&plaintext)
    }

    pub fn decrypt_json<T: DeserializeOwned>(&self, encoded: &str) -> AppResult<T> {
        let plaintext = self.decrypt(encoded)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::storage(format!("Failed to deserialize record: {}", e)))
    }
}

/// 判断错误是否为完整性校验失败
pub fn is_integrity_failure(err: &AppError) -> bool {
    err.code() == Some(INTEGRITY_ERROR_CODE)
}
