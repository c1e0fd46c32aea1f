//! Authentication plugins.
//!
//! Implements the three password plugins MySQL and MariaDB servers hand out:
//!
//! - `mysql_native_password` (SHA1-based, pre-8.0 default):
//!   `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
//! - `caching_sha2_password` (SHA256-based, 8.0+ default):
//!   `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed)`,
//!   with a full-auth fallback over RSA when the server has no cached entry
//! - `sha256_password`: RSA-encrypted password, plaintext over TLS
//!
//! plus `mysql_clear_password` for completeness. [`AuthSession`] carries the
//! per-connection plugin state so the connection state machine only shuttles
//! packets: it calls [`AuthSession::initial_response`] once and feeds every
//! auth-more payload through [`AuthSession::handle_more`], sending whatever
//! comes back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// In-band signal bytes used by caching_sha2_password.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Server: cached entry matched, OK follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Server: run the full exchange
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Server seeds are 20 bytes; anything longer is a trailing NUL.
const SCRAMBLE_LENGTH: usize = 20;

/// Compute the mysql_native_password response.
///
/// Empty passwords answer with an empty token.
pub fn mysql_native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = &seed[..seed.len().min(SCRAMBLE_LENGTH)];

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the caching_sha2_password fast-auth response.
pub fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // Servers send a 20-byte scramble with a trailing NUL
    let seed = if seed.len() == 21 && seed.last() == Some(&0) {
        &seed[..SCRAMBLE_LENGTH]
    } else {
        seed
    };
    let seed = &seed[..seed.len().min(SCRAMBLE_LENGTH)];

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let password_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash);
    let hash_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// XOR the NUL-terminated password with the repeating seed.
///
/// This masked form is what gets RSA-encrypted during full authentication.
pub fn xor_password_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut data = password.as_bytes().to_vec();
    data.push(0);
    if !seed.is_empty() {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= seed[i % seed.len()];
        }
    }
    data
}

/// The password with its NUL terminator, for secure channels.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut data = password.as_bytes().to_vec();
    data.push(0);
    data
}

/// RSA-encrypt the seed-masked password under the server's public key.
///
/// MySQL 8.0.5+ uses OAEP for caching_sha2_password; sha256_password keeps
/// PKCS#1 v1.5.
pub fn rsa_encrypt_password(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(Error::Auth("server sent an empty auth seed".to_string()));
    }

    let masked = xor_password_with_seed(password, &seed[..seed.len().min(SCRAMBLE_LENGTH)]);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| Error::Auth(format!("server public key is not valid PEM: {e}")))?;

    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::Auth(format!("failed to parse server RSA public key: {e}")))?;

    let encrypted = if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &masked)
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &masked)
    };

    encrypted.map_err(|e| Error::Auth(format!("RSA encryption failed: {e}")))
}

/// Generate cryptographically secure random bytes.
pub fn generate_nonce(length: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Process-wide cache of server RSA public keys (PEM), keyed by endpoint.
///
/// Read-mostly: a key is fetched once per server and reused by every later
/// full-auth exchange, saving a round trip. Injectable so tests can run
/// against a private instance.
#[derive(Debug, Default)]
pub struct RsaKeyCache {
    keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl RsaKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared process-wide instance.
    pub fn global() -> Arc<RsaKeyCache> {
        static GLOBAL: OnceLock<Arc<RsaKeyCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(RsaKeyCache::new())))
    }

    pub fn get(&self, endpoint: &str) -> Option<Vec<u8>> {
        self.keys.lock().expect("rsa key cache poisoned").get(endpoint).cloned()
    }

    pub fn insert(&self, endpoint: String, pem: Vec<u8>) {
        self.keys.lock().expect("rsa key cache poisoned").insert(endpoint, pem);
    }
}

/// The plugins this client can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    MysqlNativePassword,
    CachingSha2Password,
    Sha256Password,
    MysqlClearPassword,
}

impl PluginKind {
    /// Resolve a plugin by its handshake name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            // Pre-4.1 servers leave the name empty
            "" | plugins::MYSQL_NATIVE_PASSWORD => Ok(PluginKind::MysqlNativePassword),
            plugins::CACHING_SHA2_PASSWORD => Ok(PluginKind::CachingSha2Password),
            plugins::SHA256_PASSWORD => Ok(PluginKind::Sha256Password),
            plugins::MYSQL_CLEAR_PASSWORD => Ok(PluginKind::MysqlClearPassword),
            other => Err(Error::UnsupportedAuthPlugin(other.to_string())),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            PluginKind::MysqlNativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            PluginKind::CachingSha2Password => plugins::CACHING_SHA2_PASSWORD,
            PluginKind::Sha256Password => plugins::SHA256_PASSWORD,
            PluginKind::MysqlClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
        }
    }
}

/// What the state machine should do after feeding a packet to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthStep {
    /// Send these bytes as the next auth packet and keep reading
    Respond(Vec<u8>),
    /// Nothing to send; the next packet is the final OK/ERR
    Done,
}

/// Per-connection authentication state.
///
/// `secure` means the channel already protects the password: TLS is active
/// or the transport is a Unix socket.
#[derive(Debug)]
pub struct AuthSession {
    kind: PluginKind,
    password: String,
    seed: Vec<u8>,
    secure: bool,
    awaiting_rsa_key: bool,
    endpoint: String,
    key_cache: Arc<RsaKeyCache>,
}

impl AuthSession {
    pub fn new(
        kind: PluginKind,
        password: impl Into<String>,
        seed: Vec<u8>,
        secure: bool,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            password: password.into(),
            seed,
            secure,
            awaiting_rsa_key: false,
            endpoint: endpoint.into(),
            key_cache: RsaKeyCache::global(),
        }
    }

    /// Swap the global RSA key cache for a private one.
    pub fn with_key_cache(mut self, cache: Arc<RsaKeyCache>) -> Self {
        self.key_cache = cache;
        self
    }

    pub const fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Re-enter with a different plugin after an auth-switch request.
    pub fn switch(&mut self, kind: PluginKind, seed: Vec<u8>) {
        self.kind = kind;
        self.seed = seed;
        self.awaiting_rsa_key = false;
    }

    /// The auth response carried in the handshake response packet.
    pub fn initial_response(&self) -> Vec<u8> {
        match self.kind {
            PluginKind::MysqlNativePassword => {
                mysql_native_password(&self.password, &self.seed)
            }
            PluginKind::CachingSha2Password => {
                caching_sha2_password(&self.password, &self.seed)
            }
            PluginKind::Sha256Password => {
                if self.password.is_empty() {
                    vec![0]
                } else if self.secure {
                    cleartext_password(&self.password)
                } else {
                    // Ask for the server's public key
                    vec![0x01]
                }
            }
            PluginKind::MysqlClearPassword => cleartext_password(&self.password),
        }
    }

    /// Feed the body of an auth-more packet (the 0x01 marker stripped).
    pub fn handle_more(&mut self, data: &[u8]) -> Result<AuthStep> {
        if self.awaiting_rsa_key {
            self.awaiting_rsa_key = false;
            let pem = data.to_vec();
            self.key_cache.insert(self.endpoint.clone(), pem.clone());
            let encrypted = self.encrypt_password(&pem)?;
            return Ok(AuthStep::Respond(encrypted));
        }

        match self.kind {
            PluginKind::CachingSha2Password => match data.first().copied() {
                Some(caching_sha2::FAST_AUTH_SUCCESS) => Ok(AuthStep::Done),
                Some(caching_sha2::PERFORM_FULL_AUTH) => self.full_auth(),
                other => Err(Error::Auth(format!(
                    "unexpected caching_sha2_password signal: {other:?}"
                ))),
            },
            PluginKind::Sha256Password => {
                // The server answered our key request with its PEM
                let pem = data.to_vec();
                self.key_cache.insert(self.endpoint.clone(), pem.clone());
                let encrypted = self.encrypt_password(&pem)?;
                Ok(AuthStep::Respond(encrypted))
            }
            _ => Err(Error::Auth(format!(
                "plugin {} received unexpected auth data",
                self.kind.name()
            ))),
        }
    }

    /// The caching_sha2_password full exchange.
    fn full_auth(&mut self) -> Result<AuthStep> {
        if self.secure {
            // The channel already hides the bytes
            return Ok(AuthStep::Respond(cleartext_password(&self.password)));
        }

        if let Some(pem) = self.key_cache.get(&self.endpoint) {
            let encrypted = self.encrypt_password(&pem)?;
            return Ok(AuthStep::Respond(encrypted));
        }

        self.awaiting_rsa_key = true;
        Ok(AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
    }

    fn encrypt_password(&self, pem: &[u8]) -> Result<Vec<u8>> {
        let use_oaep = self.kind == PluginKind::CachingSha2Password;
        rsa_encrypt_password(&self.password, &self.seed, pem, use_oaep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mysql_native_password_empty() {
        assert!(mysql_native_password("", &[0; 20]).is_empty());
    }

    #[test]
    fn test_mysql_native_password_length_and_determinism() {
        let seed = [
            0x3d, 0x4c, 0x5e, 0x2f, 0x1a, 0x0b, 0x7c, 0x8d, 0x9e, 0xaf, 0x10, 0x21, 0x32, 0x43,
            0x54, 0x65, 0x76, 0x87, 0x98, 0xa9,
        ];
        let token = mysql_native_password("secret", &seed);
        assert_eq!(token.len(), 20);
        assert_eq!(token, mysql_native_password("secret", &seed));
        assert_ne!(token, mysql_native_password("other", &seed));
    }

    #[test]
    fn test_caching_sha2_password_length() {
        let token = caching_sha2_password("secret", &[0; 20]);
        assert_eq!(token.len(), 32);
        assert!(caching_sha2_password("", &[0; 20]).is_empty());
    }

    #[test]
    fn test_caching_sha2_seed_nul_stripped() {
        let mut seed = vec![7u8; 20];
        let bare = caching_sha2_password("secret", &seed);
        seed.push(0);
        assert_eq!(caching_sha2_password("secret", &seed), bare);
    }

    #[test]
    fn test_xor_password_with_seed_reversible() {
        let seed = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let masked = xor_password_with_seed("test", &seed);
        assert_eq!(masked.len(), 5);

        let recovered: Vec<u8> = masked
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ seed[i % seed.len()])
            .collect();
        assert_eq!(&recovered[..4], b"test");
        assert_eq!(recovered[4], 0);
    }

    #[test]
    fn test_generate_nonce() {
        let a = generate_nonce(20);
        let b = generate_nonce(20);
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }

    #[test]
    fn test_plugin_resolution() {
        assert_eq!(
            PluginKind::from_name("mysql_native_password").unwrap(),
            PluginKind::MysqlNativePassword
        );
        assert_eq!(
            PluginKind::from_name("").unwrap(),
            PluginKind::MysqlNativePassword
        );
        assert_eq!(
            PluginKind::from_name("caching_sha2_password").unwrap(),
            PluginKind::CachingSha2Password
        );
        assert!(matches!(
            PluginKind::from_name("dialog"),
            Err(Error::UnsupportedAuthPlugin(_))
        ));
    }

    #[test]
    fn test_session_fast_auth_success() {
        let mut session = AuthSession::new(
            PluginKind::CachingSha2Password,
            "pw",
            vec![1; 20],
            false,
            "localhost:3306",
        )
        .with_key_cache(Arc::new(RsaKeyCache::new()));

        assert_eq!(session.initial_response().len(), 32);
        assert_eq!(
            session.handle_more(&[caching_sha2::FAST_AUTH_SUCCESS]).unwrap(),
            AuthStep::Done
        );
    }

    #[test]
    fn test_session_full_auth_over_secure_channel() {
        let mut session = AuthSession::new(
            PluginKind::CachingSha2Password,
            "pw",
            vec![1; 20],
            true,
            "localhost:3306",
        )
        .with_key_cache(Arc::new(RsaKeyCache::new()));

        let step = session
            .handle_more(&[caching_sha2::PERFORM_FULL_AUTH])
            .unwrap();
        assert_eq!(step, AuthStep::Respond(b"pw\0".to_vec()));
    }

    #[test]
    fn test_session_full_auth_requests_key_once() {
        let cache = Arc::new(RsaKeyCache::new());
        let mut session = AuthSession::new(
            PluginKind::CachingSha2Password,
            "pw",
            vec![1; 20],
            false,
            "db:3306",
        )
        .with_key_cache(Arc::clone(&cache));

        let step = session
            .handle_more(&[caching_sha2::PERFORM_FULL_AUTH])
            .unwrap();
        assert_eq!(
            step,
            AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY])
        );
    }

    #[test]
    fn test_session_switch_resets_plugin() {
        let mut session = AuthSession::new(
            PluginKind::CachingSha2Password,
            "pw",
            vec![1; 20],
            false,
            "db:3306",
        );
        session.switch(PluginKind::MysqlNativePassword, vec![2; 20]);
        assert_eq!(session.kind(), PluginKind::MysqlNativePassword);
        assert_eq!(session.initial_response().len(), 20);
    }

    #[test]
    fn test_clear_password_is_nul_terminated() {
        let session = AuthSession::new(
            PluginKind::MysqlClearPassword,
            "pw",
            vec![],
            true,
            "db:3306",
        );
        assert_eq!(session.initial_response(), b"pw\0".to_vec());
    }
}
