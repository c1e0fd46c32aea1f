//! TLS support.
//!
//! The MySQL TLS upgrade happens mid-handshake:
//!
//! 1. The server's handshake advertises `CLIENT_SSL`.
//! 2. The client sends a short SSLRequest packet (capabilities, max packet
//!    size, charset, 23 reserved bytes) with `CLIENT_SSL` set.
//! 3. The TLS handshake runs over the raw stream.
//! 4. The ordinary handshake response (and everything after) travels inside
//!    the TLS session.
//!
//! The sync connection wraps its stream in [`TlsStream`]; the async
//! connection builds a `tokio_rustls::TlsConnector` from the same
//! [`client_config`].

#![allow(clippy::cast_possible_truncation)]

use crate::config::{SslMode, TlsConfig};
use crate::error::{Error, Result};
use crate::protocol::{CapabilityFlags, PacketWriter};

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Build an SSLRequest packet.
///
/// Sent after the server handshake and before the TLS handshake; the layout
/// is the first 32 bytes of a handshake response with `CLIENT_SSL` set.
pub fn build_ssl_request_packet(
    client_caps: CapabilityFlags,
    max_packet_size: u32,
    charset_id: u8,
    sequence_id: u8,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le((client_caps | CapabilityFlags::SSL).bits());
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset_id);
    writer.write_zeros(23);
    writer.build_packet(sequence_id)
}

/// Whether the server advertises TLS support.
pub const fn server_supports_ssl(server_caps: CapabilityFlags) -> bool {
    server_caps.contains(CapabilityFlags::SSL)
}

/// Decide whether to upgrade, given the mode and the server's capabilities.
///
/// Returns `Ok(true)` to upgrade, `Ok(false)` to stay plaintext, and an
/// error when TLS is required but the server cannot do it.
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: CapabilityFlags) -> Result<bool> {
    let supported = server_supports_ssl(server_caps);
    match ssl_mode {
        SslMode::Disabled => Ok(false),
        SslMode::Preferred => Ok(supported),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if supported {
                Ok(true)
            } else {
                Err(Error::Tls(
                    "TLS required but the server does not support it".to_string(),
                ))
            }
        }
    }
}

/// Validate the certificate configuration against the mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls: &TlsConfig) -> Result<()> {
    // A client certificate needs its key regardless of mode
    if tls.client_cert_path.is_some() && tls.client_key_path.is_none() {
        return Err(Error::Tls(
            "client certificate configured without a client key".to_string(),
        ));
    }
    match ssl_mode {
        SslMode::Disabled | SslMode::Preferred | SslMode::Required => Ok(()),
        SslMode::VerifyCa | SslMode::VerifyIdentity => Ok(()),
    }
}

// ============================================================================
// rustls integration (feature-gated)
// ============================================================================

/// Build a rustls `ClientConfig` for the given mode.
///
/// `Preferred` and `Required` encrypt without verifying the peer, matching
/// MySQL's semantics for those modes (self-signed server certs are the
/// common case). `VerifyCa`/`VerifyIdentity` verify against the configured
/// CA, or the webpki root bundle when none is given.
#[cfg(feature = "tls")]
pub fn client_config(tls: &TlsConfig, ssl_mode: SslMode) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match ssl_mode {
        SslMode::Disabled => Err(Error::Tls(
            "TLS client config requested with SSL disabled".to_string(),
        )),
        SslMode::Preferred | SslMode::Required => build_no_verify_config(&provider, tls),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if let Some(ca_path) = &tls.ca_cert_path {
                build_custom_ca_config(&provider, tls, ca_path)
            } else {
                build_webpki_config(&provider, tls)
            }
        }
    }
}

/// A ClientConfig that accepts any server certificate.
#[cfg(feature = "tls")]
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Tls(format!("failed to set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier));

    add_client_auth(builder, tls)
}

/// A ClientConfig using the webpki root bundle.
#[cfg(feature = "tls")]
fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Tls(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls)
}

/// A ClientConfig trusting a custom CA certificate.
#[cfg(feature = "tls")]
fn build_custom_ca_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls: &TlsConfig,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig> {
    use std::fs::File;
    use std::io::BufReader;

    let ca_file = File::open(ca_path)
        .map_err(|e| Error::Tls(format!("failed to open CA certificate {ca_path:?}: {e}")))?;
    let mut reader = BufReader::new(ca_file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse CA certificate: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in CA file {ca_path:?}"
        )));
    }

    let mut root_store = rustls::RootCertStore::empty();
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| Error::Tls(format!("failed to add CA certificate: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Tls(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls)
}

#[cfg(feature = "tls")]
fn load_client_cert_and_key(
    tls: &TlsConfig,
) -> Result<
    Option<(
        Vec<rustls::pki_types::CertificateDer<'static>>,
        rustls::pki_types::PrivateKeyDer<'static>,
    )>,
> {
    use std::fs::File;
    use std::io::BufReader;

    let (Some(cert_path), Some(key_path)) = (&tls.client_cert_path, &tls.client_key_path) else {
        return Ok(None);
    };

    let cert_file = File::open(cert_path)
        .map_err(|e| Error::Tls(format!("failed to open client cert {cert_path:?}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse client certificate: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in client cert file {cert_path:?}"
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| Error::Tls(format!("failed to open client key {key_path:?}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Tls(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {key_path:?}")))?;

    Ok(Some((certs, key)))
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    match load_client_cert_and_key(tls)? {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::Tls(format!("failed to configure client auth: {e}"))),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Synchronous TLS stream over any `Read + Write` transport.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Wrap a connected stream and run the TLS handshake to completion.
    pub fn connect(
        mut stream: S,
        tls: &TlsConfig,
        server_name: &str,
        ssl_mode: SslMode,
    ) -> Result<Self> {
        let config = client_config(tls, ssl_mode)?;

        let sni = tls.server_name.as_deref().unwrap_or(server_name);
        let server_name = sni
            .to_string()
            .try_into()
            .map_err(|e| Error::Tls(format!("invalid server name {sni:?}: {e}")))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| Error::Tls(format!("failed to create TLS connection: {e}")))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| Error::Tls(format!("TLS handshake write error: {e}")))?;
            }
            if conn.wants_read() {
                conn.read_tls(&mut stream)
                    .map_err(|e| Error::Tls(format!("TLS handshake read error: {e}")))?;
                conn.process_new_packets()
                    .map_err(|e| Error::Tls(format!("TLS handshake error: {e}")))?;
            }
        }

        Ok(TlsStream { conn, stream })
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.conn.wants_read() {
                let n = self.conn.read_tls(&mut self.stream)?;
                if n == 0 {
                    return Ok(0);
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| std::io::Error::other(format!("TLS error: {e}")))?;
            } else {
                return Ok(0);
            }
        }
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ssl_request_packet() {
        let packet = build_ssl_request_packet(
            CapabilityFlags::DEFAULT_CLIENT,
            16 * 1024 * 1024,
            45,
            1,
        );

        // Header (4) + payload (32)
        assert_eq!(packet.len(), 36);
        assert_eq!(packet[0], 32);
        assert_eq!(packet[3], 1);

        let caps = CapabilityFlags::from_bits(u32::from_le_bytes([
            packet[4], packet[5], packet[6], packet[7],
        ]));
        assert!(caps.contains(CapabilityFlags::SSL));
        assert_eq!(packet[12], 45);
    }

    #[test]
    fn test_server_supports_ssl() {
        assert!(server_supports_ssl(CapabilityFlags::SSL));
        assert!(server_supports_ssl(
            CapabilityFlags::SSL | CapabilityFlags::PROTOCOL_41
        ));
        assert!(!server_supports_ssl(CapabilityFlags::PROTOCOL_41));
    }

    #[test]
    fn test_validate_ssl_mode() {
        let none = CapabilityFlags::empty();
        let ssl = CapabilityFlags::SSL;

        assert!(!validate_ssl_mode(SslMode::Disabled, ssl).unwrap());
        assert!(!validate_ssl_mode(SslMode::Preferred, none).unwrap());
        assert!(validate_ssl_mode(SslMode::Preferred, ssl).unwrap());
        assert!(validate_ssl_mode(SslMode::Required, none).is_err());
        assert!(validate_ssl_mode(SslMode::Required, ssl).unwrap());
        assert!(validate_ssl_mode(SslMode::VerifyCa, none).is_err());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, ssl).unwrap());
    }

    #[test]
    fn test_validate_tls_config() {
        let tls = TlsConfig::new();
        assert!(validate_tls_config(SslMode::Required, &tls).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &tls).is_ok());

        let cert_only = TlsConfig::new().client_cert("/path/client.pem");
        assert!(validate_tls_config(SslMode::Required, &cert_only).is_err());

        let cert_and_key = TlsConfig::new()
            .client_cert("/path/client.pem")
            .client_key("/path/client-key.pem");
        assert!(validate_tls_config(SslMode::Required, &cert_and_key).is_ok());
    }
}
