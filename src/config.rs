//! Connection configuration.
//!
//! [`Config`] covers everything negotiated at connect time: endpoint,
//! credentials, charset, TLS, compression, timeouts, and the extra client
//! capability bits. Pool-level knobs live in [`PoolOptions`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::charset;
use crate::protocol::CapabilityFlags;

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disabled,
    /// Prefer SSL if the server advertises it, fall back to plaintext
    Preferred,
    /// Require SSL, without certificate verification
    Required,
    /// Require SSL and verify the server certificate against the CA
    VerifyCa,
    /// Require SSL and verify the certificate matches the hostname
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disabled)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// TLS certificate configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA certificate path (PEM)
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate path (PEM), for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key path (PEM), for mutual TLS
    pub client_key_path: Option<PathBuf>,
    /// Override the server name used for SNI and verification
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Wire compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression
    #[default]
    None,
    /// zlib (CLIENT_COMPRESS)
    Zlib,
    /// zstd (CLIENT_ZSTD_COMPRESSION_ALGORITHM) with a compression level
    Zstd { level: i32 },
}

impl Compression {
    /// zstd with the default level.
    pub const fn zstd() -> Self {
        Compression::Zstd { level: 3 }
    }

    pub const fn is_enabled(self) -> bool {
        !matches!(self, Compression::None)
    }
}

/// Well-known Unix socket locations probed when connecting to localhost
/// without an explicit socket path.
const DEFAULT_UNIX_SOCKETS: &[&str] = &[
    "/var/lib/mysql/mysql.sock",
    "/var/run/mysql/mysql.sock",
    "/var/run/mysqld/mysqld.sock",
    "/var/run/mysql.sock",
    "/var/mysql/mysql.sock",
];

/// MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Unix socket path; used instead of TCP when set and the host is local
    pub unix_socket: Option<PathBuf>,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database to select at connect time
    pub database: Option<String>,
    /// Character set name (default: utf8mb4); `SET NAMES` runs after auth
    pub charset: String,
    /// `sql_mode` applied right after connecting
    pub sql_mode: Option<String>,
    /// Statement executed once the session is established
    pub init_command: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read timeout for the sync connection; async uses cancellation instead
    pub read_timeout: Option<Duration>,
    /// Write timeout for the sync connection
    pub write_timeout: Option<Duration>,
    /// Wire compression
    pub compression: Compression,
    /// SSL mode
    pub ssl_mode: SslMode,
    /// TLS certificates
    pub tls: TlsConfig,
    /// Allow answering LOCAL INFILE requests (off by default)
    pub local_infile: bool,
    /// Force a specific auth plugin instead of the server's default
    pub auth_plugin: Option<String>,
    /// Extra capability bits OR'd into the negotiated set
    pub client_flags: CapabilityFlags,
    /// Connection attributes sent when CLIENT_CONNECT_ATTRS is negotiated
    pub connect_attrs: HashMap<String, String>,
    /// Max packet size announced in the handshake response
    pub max_packet_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            unix_socket: None,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT.name.to_string(),
            sql_mode: None,
            init_command: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: None,
            write_timeout: None,
            compression: Compression::None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            local_infile: false,
            auth_plugin: None,
            client_flags: CapabilityFlags::empty(),
            connect_attrs: HashMap::new(),
            max_packet_size: 64 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_socket = Some(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn sql_mode(mut self, mode: impl Into<String>) -> Self {
        self.sql_mode = Some(mode.into());
        self
    }

    pub fn init_command(mut self, command: impl Into<String>) -> Self {
        self.init_command = Some(command.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Enable answering LOCAL INFILE requests.
    ///
    /// The server names the file; enabling this lets it read any file this
    /// process can open. Only enable against trusted servers.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    pub fn auth_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.auth_plugin = Some(plugin.into());
        self
    }

    pub fn client_flags(mut self, flags: CapabilityFlags) -> Self {
        self.client_flags = flags;
        self
    }

    pub fn connect_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_attrs.insert(key.into(), value.into());
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// The `host:port` address string for TCP connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the host names the local machine.
    pub fn is_local_host(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1" || self.host == "::1"
    }

    /// The Unix socket to use, if any: the configured path, or a well-known
    /// path probed when connecting to localhost on the default port.
    pub fn effective_unix_socket(&self) -> Option<PathBuf> {
        if let Some(path) = &self.unix_socket {
            return Some(path.clone());
        }
        if cfg!(unix) && self.host == "localhost" && self.port == 3306 {
            for candidate in DEFAULT_UNIX_SOCKETS {
                if Path::new(candidate).exists() {
                    return Some(PathBuf::from(candidate));
                }
            }
        }
        None
    }

    /// The numeric charset id sent in the handshake response.
    ///
    /// Unknown names fall back to the default charset; `SET NAMES` still runs
    /// with the configured name so the server has the final word.
    #[allow(clippy::cast_possible_truncation)]
    pub fn charset_id(&self) -> u8 {
        charset::by_name(&self.charset)
            .unwrap_or(charset::DEFAULT)
            .id as u8
    }

    /// Build the requested capability flags from the configuration.
    ///
    /// The effective set is this AND'ed with what the server advertises.
    pub fn capability_flags(&self) -> CapabilityFlags {
        let mut flags = CapabilityFlags::DEFAULT_CLIENT | self.client_flags;

        if self.database.is_some() {
            flags |= CapabilityFlags::CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= CapabilityFlags::SSL;
        }
        match self.compression {
            Compression::None => {}
            Compression::Zlib => flags |= CapabilityFlags::COMPRESS,
            Compression::Zstd { .. } => flags |= CapabilityFlags::ZSTD_COMPRESSION,
        }
        if self.local_infile {
            flags |= CapabilityFlags::LOCAL_FILES;
        }
        if !self.connect_attrs.is_empty() {
            flags |= CapabilityFlags::CONNECT_ATTRS;
        }

        flags
    }
}

/// Pool-level options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Idle connections kept open even when eviction runs
    pub minsize: usize,
    /// Upper bound on idle + in-use connections
    pub maxsize: usize,
    /// Max idle age before a connection is pinged on acquire; `None` never
    /// recycles
    pub pool_recycle: Option<Duration>,
    /// Log every statement at debug level
    pub echo: bool,
    /// How long `acquire` waits before giving up; `None` waits forever
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            minsize: 1,
            maxsize: 10,
            pool_recycle: None,
            echo: false,
            acquire_timeout: None,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minsize(mut self, n: usize) -> Self {
        self.minsize = n;
        self
    }

    pub fn maxsize(mut self, n: usize) -> Self {
        self.maxsize = n;
        self
    }

    pub fn pool_recycle(mut self, age: Duration) -> Self {
        self.pool_recycle = Some(age);
        self
    }

    pub fn echo(mut self, enabled: bool) -> Self {
        self.echo = enabled;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .host("db.example.com")
            .port(3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .charset("utf8mb4")
            .connect_timeout(Duration::from_secs(10))
            .ssl_mode(SslMode::Required)
            .compression(Compression::Zlib)
            .connect_attr("program_name", "myapp");

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 3307);
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.database.as_deref(), Some("testdb"));
        assert_eq!(config.socket_addr(), "db.example.com:3307");
        assert_eq!(config.ssl_mode, SslMode::Required);
    }

    #[test]
    fn test_capability_flags() {
        let config = Config::new().database("test").compression(Compression::Zlib);
        let flags = config.capability_flags();

        assert!(flags.contains(CapabilityFlags::CONNECT_WITH_DB));
        assert!(flags.contains(CapabilityFlags::COMPRESS));
        assert!(flags.contains(CapabilityFlags::PROTOCOL_41));
        assert!(flags.contains(CapabilityFlags::SECURE_CONNECTION));
        assert!(!flags.contains(CapabilityFlags::SSL));
        assert!(!flags.contains(CapabilityFlags::LOCAL_FILES));
    }

    #[test]
    fn test_zstd_sets_its_own_capability() {
        let config = Config::new().compression(Compression::zstd());
        let flags = config.capability_flags();
        assert!(flags.contains(CapabilityFlags::ZSTD_COMPRESSION));
        assert!(!flags.contains(CapabilityFlags::COMPRESS));
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert!(!SslMode::Disabled.should_try_ssl());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::Required.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
    }

    #[test]
    fn test_charset_id_fallback() {
        let config = Config::new().charset("no_such_charset");
        assert_eq!(config.charset_id(), crate::charset::DEFAULT.id as u8);
    }

    #[test]
    fn test_pool_options() {
        let opts = PoolOptions::new()
            .minsize(2)
            .maxsize(5)
            .pool_recycle(Duration::from_secs(60))
            .echo(true);
        assert_eq!(opts.minsize, 2);
        assert_eq!(opts.maxsize, 5);
        assert_eq!(opts.pool_recycle, Some(Duration::from_secs(60)));
        assert!(opts.echo);
    }
}
