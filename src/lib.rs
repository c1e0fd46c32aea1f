//! MySQL/MariaDB wire protocol client.
//!
//! This crate implements the MySQL client–server protocol from scratch and
//! provides:
//!
//! - Packet framing with sequence verification and 16 MiB splitting
//! - Authentication (`mysql_native_password`, `caching_sha2_password`,
//!   `sha256_password`, including the RSA full-auth exchange)
//! - Optional TLS upgrade (rustls) and wire compression (zlib / zstd)
//! - Text and binary query protocols with typed row values
//! - Prepared statements, long-data streaming, and cursor fetch
//! - LOAD DATA LOCAL INFILE streaming behind an explicit opt-in
//! - A synchronous connection, an async (tokio) connection, and a bounded
//!   async connection pool with FIFO fairness
//!
//! # Protocol overview
//!
//! MySQL frames every message with a 3-byte little-endian payload length and
//! a 1-byte sequence number; messages over 2^24 - 1 bytes split across
//! packets. One command runs at a time per connection, and every command
//! restarts the sequence at zero.
//!
//! # Example
//!
//! ```rust,ignore
//! use mywire::{Config, Connection};
//!
//! let config = Config::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = Connection::connect(config)?;
//! let result = conn.query("SELECT 42")?;
//! ```
//!
//! The async flavor mirrors the sync API:
//!
//! ```rust,ignore
//! use mywire::{AsyncConnection, Config, Pool, PoolOptions};
//!
//! let pool = Pool::connect(config, PoolOptions::new().maxsize(8)).await?;
//! let mut conn = pool.acquire().await?;
//! let rows = conn.query("SELECT id, name FROM users").await?;
//! ```

pub mod async_connection;
pub mod auth;
pub mod charset;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod row;
pub mod tls;
pub mod types;
pub mod value;

pub use async_connection::AsyncConnection;
pub use config::{Compression, Config, PoolOptions, SslMode, TlsConfig};
pub use connection::{Connection, ConnectionState, ResultSet, ServerInfo};
pub use error::{Error, Result};
pub use pool::{Pool, PoolStats, PooledConnection};
pub use protocol::prepared::PreparedStatement;
pub use row::{ColumnInfo, Row};
pub use types::{ColumnDef, FieldType};
pub use value::{Date, DateTime, TimeDelta, Value};
