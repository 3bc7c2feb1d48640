use std::fmt;

use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;

use crate::{Error, Result};

pub const BACKUP_KEY_PREFIX: &str = "MBK1:";
pub const KEY_LEN: usize = 32;

const BACKUP_ID_INFO: &[u8] = b"msgbackup.backup_id.v1";
const MESSAGE_BACKUP_KEYS_INFO: &[u8] = b"msgbackup.message_backup_keys.v1";
const BACKUP_ID_LEN: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct BackupKey([u8; KEY_LEN]);

impl BackupKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn encode(&self) -> String {
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0);
        format!("{BACKUP_KEY_PREFIX}{b64}")
    }

    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .trim()
            .strip_prefix(BACKUP_KEY_PREFIX)
            .ok_or_else(|| Error::InvalidConfig {
                message: "invalid backup key (missing MBK1: prefix)".to_string(),
            })?;

        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(rest.as_bytes())
            .map_err(|e| Error::InvalidConfig {
                message: format!("invalid backup key (bad base64url): {e}"),
            })?;
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidConfig {
            message: "invalid backup key (wrong length)".to_string(),
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId(pub Uuid);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key material returned by the secure-value-recovery exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct ForwardSecrecyToken([u8; KEY_LEN]);

impl ForwardSecrecyToken {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidConfig {
            message: format!(
                "forward secrecy token must be {KEY_LEN} bytes (got {})",
                bytes.len()
            ),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ForwardSecrecyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ForwardSecrecyToken(<redacted>)")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct MessageBackupKeys {
    pub cipher_key: [u8; KEY_LEN],
    pub mac_key: [u8; KEY_LEN],
}

impl fmt::Debug for MessageBackupKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageBackupKeys(<redacted>)")
    }
}

impl MessageBackupKeys {
    pub fn derive(
        backup_key: &BackupKey,
        account_id: &AccountId,
        forward_secrecy_token: Option<&ForwardSecrecyToken>,
    ) -> Result<Self> {
        let backup_id = derive_backup_id(backup_key, account_id)?;

        let salt = forward_secrecy_token.map(|t| t.as_bytes().as_slice());
        let hk = Hkdf::<Sha256>::new(salt, backup_key.as_bytes());
        let mut info = Vec::with_capacity(MESSAGE_BACKUP_KEYS_INFO.len() + BACKUP_ID_LEN);
        info.extend_from_slice(MESSAGE_BACKUP_KEYS_INFO);
        info.extend_from_slice(&backup_id);

        let mut okm = [0u8; KEY_LEN * 2];
        hk.expand(&info, &mut okm).map_err(|_| Error::Crypto)?;

        let mut mac_key = [0u8; KEY_LEN];
        let mut cipher_key = [0u8; KEY_LEN];
        mac_key.copy_from_slice(&okm[..KEY_LEN]);
        cipher_key.copy_from_slice(&okm[KEY_LEN..]);
        Ok(Self {
            cipher_key,
            mac_key,
        })
    }
}

fn derive_backup_id(backup_key: &BackupKey, account_id: &AccountId) -> Result<[u8; BACKUP_ID_LEN]> {
    let hk = Hkdf::<Sha256>::new(None, backup_key.as_bytes());
    let mut info = Vec::with_capacity(BACKUP_ID_INFO.len() + 16);
    info.extend_from_slice(BACKUP_ID_INFO);
    info.extend_from_slice(account_id.0.as_bytes());

    let mut out = [0u8; BACKUP_ID_LEN];
    hk.expand(&info, &mut out).map_err(|_| Error::Crypto)?;
    Ok(out)
}

/// Everything the decode boundary needs to recover the cipher and MAC keys.
#[derive(Debug, Clone)]
pub struct BackupCredentials {
    pub backup_key: BackupKey,
    pub account_id: AccountId,
    pub forward_secrecy_token: Option<ForwardSecrecyToken>,
}

impl BackupCredentials {
    pub fn derive_keys(&self) -> Result<MessageBackupKeys> {
        MessageBackupKeys::derive(
            &self.backup_key,
            &self.account_id,
            self.forward_secrecy_token.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbk1_round_trip() {
        let key = BackupKey::from_bytes([7u8; 32]);
        let s = key.encode();
        assert!(s.starts_with(BACKUP_KEY_PREFIX));
        assert_eq!(BackupKey::parse(&s).unwrap(), key);
        assert!(BackupKey::parse("nope").is_err());
        assert!(BackupKey::parse("MBK1:AAAA").is_err());
    }

    #[test]
    fn derived_keys_depend_on_token_and_account() {
        let key = BackupKey::from_bytes([1u8; 32]);
        let a = AccountId(Uuid::from_u128(1));
        let b = AccountId(Uuid::from_u128(2));
        let token = ForwardSecrecyToken::from_bytes([9u8; 32]);

        let plain = MessageBackupKeys::derive(&key, &a, None).unwrap();
        let with_token = MessageBackupKeys::derive(&key, &a, Some(&token)).unwrap();
        let other_account = MessageBackupKeys::derive(&key, &b, Some(&token)).unwrap();

        assert_ne!(plain, with_token);
        assert_ne!(with_token, other_account);
        assert_ne!(with_token.cipher_key, with_token.mac_key);
        assert_eq!(
            with_token,
            MessageBackupKeys::derive(&key, &a, Some(&token)).unwrap()
        );
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = BackupKey::from_bytes([3u8; 32]);
        assert!(!format!("{key:?}").contains('3'));
    }
}
