//! Asynchronous MySQL connection on tokio.
//!
//! The protocol state machine is the one in [`crate::connection`]; this
//! module instantiates it over tokio's byte streams. Suspension points are
//! exactly the socket reads, socket writes, and the TLS handshake; packet
//! parsing never awaits once the bytes are in hand. Cancelling a future
//! mid-command leaves the wire in an unknown state, so a connection dropped
//! that way must not be reused; the pool enforces this by discarding
//! connections whose state is not `Idle`.

#![allow(clippy::cast_possible_truncation)]

use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, trace};

use crate::auth::{AuthSession, AuthStep, PluginKind};
#[cfg(feature = "compress")]
use crate::config::Compression;
use crate::config::Config;
use crate::connection::{
    ConnectionState, ResultSet, RowFormat, ServerInfo, build_handshake_response_payload,
    parse_handshake_payload,
};
use crate::error::{Error, Result};
use crate::protocol::prepared::{self, PreparedStatement, cursor_type};
use crate::protocol::rows::{column_info, parse_binary_row, parse_column_def, parse_text_row};
use crate::protocol::{
    CapabilityFlags, Command, MAX_PACKET_SIZE, OkPacket, PacketHeader, PacketReader, PacketType,
    PacketWriter, server_status,
};
use crate::types::{ColumnDef, interpolate_params};
use crate::value::Value;

#[cfg(feature = "compress")]
use crate::protocol::compress;

enum AsyncStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Transient state while the TLS upgrade swaps streams
    Detached,
}

impl AsyncStream {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            AsyncStream::Tcp(s) => s.read_exact(buf).await.map(|_| ()),
            #[cfg(unix)]
            AsyncStream::Unix(s) => s.read_exact(buf).await.map(|_| ()),
            #[cfg(feature = "tls")]
            AsyncStream::Tls(s) => s.read_exact(buf).await.map(|_| ()),
            AsyncStream::Detached => Err(std::io::Error::other("stream detached")),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            AsyncStream::Tcp(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            #[cfg(unix)]
            AsyncStream::Unix(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            #[cfg(feature = "tls")]
            AsyncStream::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            AsyncStream::Detached => Err(std::io::Error::other("stream detached")),
        }
    }
}

/// Byte transport with optional compressed framing, async flavor.
struct AsyncTransport {
    stream: AsyncStream,
    #[cfg(feature = "compress")]
    codec: Option<compress::Codec>,
    #[cfg(feature = "compress")]
    comp_seq: u8,
    #[cfg(feature = "compress")]
    read_buf: Vec<u8>,
    #[cfg(feature = "compress")]
    read_pos: usize,
}

impl AsyncTransport {
    fn new(stream: AsyncStream) -> Self {
        Self {
            stream,
            #[cfg(feature = "compress")]
            codec: None,
            #[cfg(feature = "compress")]
            comp_seq: 0,
            #[cfg(feature = "compress")]
            read_buf: Vec::new(),
            #[cfg(feature = "compress")]
            read_pos: 0,
        }
    }

    #[cfg(feature = "compress")]
    fn enable_compression(&mut self, codec: compress::Codec) {
        self.codec = Some(codec);
        self.comp_seq = 0;
    }

    fn reset_sequence(&mut self) {
        #[cfg(feature = "compress")]
        {
            self.comp_seq = 0;
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        #[cfg(feature = "compress")]
        if self.codec.is_some() {
            let mut filled = 0;
            while filled < buf.len() {
                if self.read_pos >= self.read_buf.len() {
                    self.refill_from_frame().await?;
                }
                let available = &self.read_buf[self.read_pos..];
                let n = available.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&available[..n]);
                self.read_pos += n;
                filled += n;
            }
            return Ok(());
        }

        self.stream.read_exact(buf).await?;
        Ok(())
    }

    #[cfg(feature = "compress")]
    async fn refill_from_frame(&mut self) -> Result<()> {
        let codec = self.codec.expect("refill without compression");

        let mut header_buf = [0u8; compress::COMPRESSED_HEADER_SIZE];
        self.stream.read_exact(&mut header_buf).await?;
        let header = compress::CompressedHeader::from_bytes(&header_buf);

        if header.sequence_id != self.comp_seq {
            return Err(Error::SequenceDesync {
                expected: self.comp_seq,
                actual: header.sequence_id,
            });
        }
        self.comp_seq = header.sequence_id.wrapping_add(1);

        let mut body = vec![0u8; header.compressed_length as usize];
        self.stream.read_exact(&mut body).await?;

        self.read_buf = compress::unwrap_frame(codec, &header, &body)?;
        self.read_pos = 0;
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        #[cfg(feature = "compress")]
        if let Some(codec) = self.codec {
            let frame = compress::build_frame(codec, bytes, self.comp_seq)?;
            self.comp_seq = self.comp_seq.wrapping_add(1);
            self.stream.write_all(&frame).await?;
            return Ok(());
        }

        self.stream.write_all(bytes).await?;
        Ok(())
    }
}

/// An asynchronous MySQL connection.
pub struct AsyncConnection {
    transport: AsyncTransport,
    state: ConnectionState,
    config: Config,
    server: Option<ServerInfo>,
    capabilities: CapabilityFlags,
    sequence_id: u8,
    status_flags: u16,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    more_results_pending: bool,
    /// When this connection was established; the pool uses it for recycling
    created_at: Instant,
}

impl std::fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("state", &self.state)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl AsyncConnection {
    /// Connect and authenticate, bounded by the configured connect timeout.
    pub async fn connect(config: Config) -> Result<Self> {
        let timeout = config.connect_timeout;
        match tokio::time::timeout(timeout, Self::connect_inner(config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {timeout:?}"),
            ))),
        }
    }

    async fn connect_inner(config: Config) -> Result<Self> {
        let (stream, via_unix_socket) = open_stream(&config).await?;

        let mut conn = Self {
            transport: AsyncTransport::new(stream),
            state: ConnectionState::Connecting,
            config,
            server: None,
            capabilities: CapabilityFlags::empty(),
            sequence_id: 0,
            status_flags: 0,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            more_results_pending: false,
            created_at: Instant::now(),
        };

        match conn.handshake(via_unix_socket).await {
            Ok(()) => {}
            Err(e) => {
                conn.state = ConnectionState::Closed;
                return Err(e);
            }
        }

        conn.setup_session().await?;
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection can accept a command.
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Idle
    }

    pub fn connection_id(&self) -> u32 {
        self.server.as_ref().map_or(0, |s| s.connection_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.server_version.as_str())
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    /// Age of this connection, for pool recycling.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    // ------------------------------------------------------------------
    // Connect phase
    // ------------------------------------------------------------------

    async fn handshake(&mut self, via_unix_socket: bool) -> Result<()> {
        let payload = self.read_packet().await?;
        let server = parse_handshake_payload(&payload)?;
        debug!(
            server_version = %server.server_version,
            connection_id = server.connection_id,
            auth_plugin = %server.auth_plugin,
            "received server handshake"
        );

        let requested = self.config.capability_flags();
        let mut client_caps = requested & server.capabilities;
        if server.capabilities.contains(CapabilityFlags::PLUGIN_AUTH) {
            client_caps |= CapabilityFlags::PLUGIN_AUTH;
        }

        let use_tls = crate::tls::validate_ssl_mode(self.config.ssl_mode, server.capabilities)?;
        crate::tls::validate_tls_config(self.config.ssl_mode, &self.config.tls)?;

        if use_tls {
            self.upgrade_to_tls(client_caps).await?;
        }

        self.state = ConnectionState::Authenticating;

        let plugin = match &self.config.auth_plugin {
            Some(name) => PluginKind::from_name(name)?,
            None => PluginKind::from_name(&server.auth_plugin)?,
        };
        let secure = use_tls || via_unix_socket;
        let endpoint = self.config.socket_addr();
        let mut session = AuthSession::new(
            plugin,
            self.config.password.clone().unwrap_or_default(),
            server.auth_data.clone(),
            secure,
            endpoint,
        );

        self.capabilities = client_caps;
        self.server = Some(server);

        let response = build_handshake_response_payload(&self.config, client_caps, &session);
        self.write_packet(&response).await?;
        self.authenticate(&mut session).await?;

        #[cfg(feature = "compress")]
        self.enable_negotiated_compression();

        self.state = ConnectionState::Idle;
        debug!(connection_id = self.connection_id(), "connection established");
        Ok(())
    }

    #[cfg(feature = "compress")]
    fn enable_negotiated_compression(&mut self) {
        if self.capabilities.contains(CapabilityFlags::COMPRESS) {
            self.transport.enable_compression(compress::Codec::Zlib);
        } else if self.capabilities.contains(CapabilityFlags::ZSTD_COMPRESSION) {
            let level = match self.config.compression {
                Compression::Zstd { level } => level,
                _ => 3,
            };
            self.transport
                .enable_compression(compress::Codec::Zstd { level });
        }
    }

    async fn upgrade_to_tls(&mut self, client_caps: CapabilityFlags) -> Result<()> {
        #[cfg(feature = "tls")]
        {
            use std::sync::Arc;

            let packet = crate::tls::build_ssl_request_packet(
                client_caps,
                self.config.max_packet_size,
                self.config.charset_id(),
                self.sequence_id,
            );
            self.sequence_id = self.sequence_id.wrapping_add(1);
            self.transport.write_all(&packet).await?;

            let config = crate::tls::client_config(&self.config.tls, self.config.ssl_mode)?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

            let sni = self
                .config
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| self.config.host.clone());
            let server_name = rustls::pki_types::ServerName::try_from(sni.clone())
                .map_err(|e| Error::Tls(format!("invalid server name {sni:?}: {e}")))?;

            let old = std::mem::replace(&mut self.transport.stream, AsyncStream::Detached);
            let AsyncStream::Tcp(tcp) = old else {
                return Err(Error::Tls(
                    "TLS upgrade requires a plain TCP stream".to_string(),
                ));
            };
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::Tls(format!("TLS handshake failed: {e}")))?;
            self.transport.stream = AsyncStream::Tls(Box::new(tls));
            debug!("TLS session established");
            Ok(())
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = client_caps;
            Err(Error::Tls(
                "TLS requested but the crate was built without the `tls` feature".to_string(),
            ))
        }
    }

    async fn authenticate(&mut self, session: &mut AuthSession) -> Result<()> {
        loop {
            let payload = self.read_packet().await?;
            if payload.is_empty() {
                return Err(Error::protocol("empty authentication response"));
            }

            match payload[0] {
                0x00 => {
                    let mut reader = PacketReader::new(&payload);
                    if let Some(ok) = reader.parse_ok_packet() {
                        self.status_flags = ok.status_flags;
                    }
                    return Ok(());
                }
                0xFF => {
                    let mut reader = PacketReader::new(&payload);
                    let err = reader
                        .parse_err_packet()
                        .ok_or(Error::Truncated("auth error packet"))?;
                    return Err(Error::Auth(format!(
                        "{} (error {})",
                        err.error_message, err.error_code
                    )));
                }
                0xFE => {
                    let mut reader = PacketReader::new(&payload[1..]);
                    let plugin_name = reader
                        .read_null_string()
                        .ok_or(Error::Truncated("auth switch plugin name"))?;
                    let mut seed = reader.read_rest().to_vec();
                    if seed.last() == Some(&0) {
                        seed.pop();
                    }
                    debug!(plugin = %plugin_name, "auth switch requested");
                    session.switch(PluginKind::from_name(&plugin_name)?, seed);
                    let response = session.initial_response();
                    self.write_packet(&response).await?;
                }
                0x01 => match session.handle_more(&payload[1..])? {
                    AuthStep::Respond(bytes) => self.write_packet(&bytes).await?,
                    AuthStep::Done => {}
                },
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected auth packet starting with 0x{other:02X}"
                    )));
                }
            }
        }
    }

    async fn setup_session(&mut self) -> Result<()> {
        let charset = self.config.charset.clone();
        if !charset.is_empty() {
            self.query(&format!("SET NAMES {charset}")).await?;
        }
        if let Some(mode) = self.config.sql_mode.clone() {
            self.query_with_params("SET sql_mode = ?", &[Value::Text(mode)])
                .await?;
        }
        if let Some(command) = self.config.init_command.clone() {
            self.query(&command).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = self.read_packet_chunk().await?;
        if payload.len() == MAX_PACKET_SIZE {
            loop {
                let chunk = self.read_packet_chunk().await?;
                let last = chunk.len() < MAX_PACKET_SIZE;
                payload.extend_from_slice(&chunk);
                if last {
                    break;
                }
            }
        }
        Ok(payload)
    }

    async fn read_packet_chunk(&mut self) -> Result<Vec<u8>> {
        let mut header_buf = [0u8; PacketHeader::SIZE];
        match self.transport.read_exact(&mut header_buf).await {
            Ok(()) => {}
            Err(e) => return Err(self.fail(e)),
        }
        let header = PacketHeader::from_bytes(&header_buf);

        if header.sequence_id != self.sequence_id {
            let err = Error::SequenceDesync {
                expected: self.sequence_id,
                actual: header.sequence_id,
            };
            return Err(self.fail(err));
        }
        self.sequence_id = header.sequence_id.wrapping_add(1);

        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            match self.transport.read_exact(&mut payload).await {
                Ok(()) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(payload)
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut buffer = Vec::with_capacity(payload.len() + PacketHeader::SIZE);
        let mut offset = 0;
        loop {
            let chunk_len = (payload.len() - offset).min(MAX_PACKET_SIZE);
            let header = PacketHeader {
                payload_length: chunk_len as u32,
                sequence_id: self.sequence_id,
            };
            self.sequence_id = self.sequence_id.wrapping_add(1);
            buffer.extend_from_slice(&header.to_bytes());
            buffer.extend_from_slice(&payload[offset..offset + chunk_len]);
            offset += chunk_len;

            if offset >= payload.len() && chunk_len < MAX_PACKET_SIZE {
                break;
            }
            if offset == payload.len() && chunk_len == MAX_PACKET_SIZE {
                let header = PacketHeader {
                    payload_length: 0,
                    sequence_id: self.sequence_id,
                };
                self.sequence_id = self.sequence_id.wrapping_add(1);
                buffer.extend_from_slice(&header.to_bytes());
                break;
            }
        }

        match self.transport.write_all(&buffer).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.state = ConnectionState::Closed;
        }
        err
    }

    fn begin_command(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            _ => return Err(Error::ConnectionBusy),
        }
        self.sequence_id = 0;
        self.transport.reset_sequence();
        self.more_results_pending = false;
        self.state = ConnectionState::Command;
        Ok(())
    }

    async fn send_command(&mut self, command: Command, args: &[u8]) -> Result<()> {
        self.begin_command()?;
        let mut w = PacketWriter::with_capacity(1 + args.len());
        w.write_u8(command as u8);
        w.write_bytes(args);
        let payload = w.into_bytes();
        self.write_packet(&payload).await
    }

    // ------------------------------------------------------------------
    // Text protocol
    // ------------------------------------------------------------------

    /// Execute a statement, returning its first result set.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        trace!(sql, "COM_QUERY");
        self.send_command(Command::Query, sql.as_bytes()).await?;
        self.read_result_set(RowFormat::Text, true).await
    }

    /// Execute with client-side parameter substitution.
    pub async fn query_with_params(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let sql = interpolate_params(sql, params);
        self.query(&sql).await
    }

    /// Read the next result set after one with the more-results flag.
    pub async fn next_result(&mut self) -> Result<Option<ResultSet>> {
        if !self.more_results_pending {
            return Ok(None);
        }
        self.state = ConnectionState::Command;
        self.more_results_pending = false;
        // A LOCAL INFILE request at a result-set boundary has no sane
        // interpretation; it is rejected below
        self.read_result_set(RowFormat::Text, false).await.map(Some)
    }

    async fn read_result_set(&mut self, format: RowFormat, allow_infile: bool) -> Result<ResultSet> {
        let payload = self.read_packet().await?;
        if payload.is_empty() {
            return Err(self.fail(Error::protocol("empty response to command")));
        }

        match PacketType::from_first_byte(payload[0], payload.len()) {
            PacketType::Ok => {
                let mut reader = PacketReader::new(&payload);
                let ok = match reader.parse_ok_packet() {
                    Some(ok) => ok,
                    None => return Err(self.fail(Error::Truncated("OK packet"))),
                };
                self.finish_statement(ok.status_flags, ok.warnings);
                self.affected_rows = ok.affected_rows;
                self.last_insert_id = ok.last_insert_id;
                Ok(ResultSet::Ok(ok))
            }
            PacketType::Error => {
                let err = self.server_error(&payload);
                self.state = ConnectionState::Idle;
                Err(err)
            }
            PacketType::LocalInfile => {
                if !allow_infile {
                    return Err(self.fail(Error::protocol(
                        "LOCAL INFILE request at a result-set boundary",
                    )));
                }
                let filename = String::from_utf8_lossy(&payload[1..]).into_owned();
                self.handle_local_infile(&filename).await
            }
            PacketType::Eof if self.deprecate_eof() => {
                let mut reader = PacketReader::new(&payload);
                let ok = match reader.parse_ok_packet() {
                    Some(ok) => ok,
                    None => return Err(self.fail(Error::Truncated("OK packet"))),
                };
                self.finish_statement(ok.status_flags, ok.warnings);
                self.affected_rows = ok.affected_rows;
                self.last_insert_id = ok.last_insert_id;
                Ok(ResultSet::Ok(ok))
            }
            PacketType::Eof => Err(self.fail(Error::protocol(
                "unexpected EOF packet at result set start",
            ))),
            PacketType::Data => {
                let mut reader = PacketReader::new(&payload);
                let column_count = match reader.read_lenenc_int() {
                    Some(n) => n as usize,
                    None => return Err(self.fail(Error::Truncated("column count"))),
                };
                self.state = ConnectionState::ReadingRows;
                self.read_rows(column_count, format).await
            }
        }
    }

    async fn read_rows(&mut self, column_count: usize, format: RowFormat) -> Result<ResultSet> {
        let columns = self.read_column_defs(column_count).await?;
        let info = column_info(&columns);

        let mut rows = Vec::new();
        let (status_flags, warnings) = loop {
            let payload = self.read_packet().await?;
            if payload.is_empty() {
                return Err(self.fail(Error::protocol("empty row packet")));
            }

            if payload[0] == 0xFF {
                let err = self.server_error(&payload);
                self.state = ConnectionState::Idle;
                return Err(err);
            }
            if payload[0] == 0xFE && payload.len() < MAX_PACKET_SIZE {
                break self.parse_terminal(&payload)?;
            }

            let row = match format {
                RowFormat::Text => parse_text_row(&payload, &columns, &info),
                RowFormat::Binary => parse_binary_row(&payload, &columns, &info),
            };
            match row {
                Ok(row) => rows.push(row),
                Err(e) => return Err(self.fail(e)),
            }
        };

        trace!(rows = rows.len(), columns = columns.len(), "result set read");
        self.finish_statement(status_flags, warnings);

        Ok(ResultSet::Rows {
            columns,
            rows,
            status_flags,
            warnings,
        })
    }

    async fn read_column_defs(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet().await?;
            match parse_column_def(&payload) {
                Ok(col) => columns.push(col),
                Err(e) => return Err(self.fail(e)),
            }
        }

        if !self.deprecate_eof() && count > 0 {
            let payload = self.read_packet().await?;
            if payload.first() != Some(&0xFE) {
                return Err(self.fail(Error::protocol(
                    "expected EOF after column definitions",
                )));
            }
        }
        Ok(columns)
    }

    fn parse_terminal(&mut self, payload: &[u8]) -> Result<(u16, u16)> {
        let mut reader = PacketReader::new(payload);
        if self.deprecate_eof() {
            let ok = match reader.parse_ok_packet() {
                Some(ok) => ok,
                None => return Err(self.fail(Error::Truncated("terminal OK packet"))),
            };
            self.affected_rows = ok.affected_rows;
            self.last_insert_id = ok.last_insert_id;
            Ok((ok.status_flags, ok.warnings))
        } else {
            let eof = match reader.parse_eof_packet() {
                Some(eof) => eof,
                None => return Err(self.fail(Error::Truncated("EOF packet"))),
            };
            Ok((eof.status_flags, eof.warnings))
        }
    }

    fn finish_statement(&mut self, status_flags: u16, warnings: u16) {
        self.status_flags = status_flags;
        self.warnings = warnings;
        self.more_results_pending =
            status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0;
        self.state = ConnectionState::Idle;
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities.contains(CapabilityFlags::DEPRECATE_EOF)
    }

    fn server_error(&mut self, payload: &[u8]) -> Error {
        let mut reader = PacketReader::new(payload);
        match reader.parse_err_packet() {
            Some(err) => Error::server(err.error_code, err.sql_state, err.error_message),
            None => self.fail(Error::Truncated("ERR packet")),
        }
    }

    // ------------------------------------------------------------------
    // LOCAL INFILE
    // ------------------------------------------------------------------

    async fn handle_local_infile(&mut self, filename: &str) -> Result<ResultSet> {
        self.state = ConnectionState::InLocalInfile;

        if !self.config.local_infile {
            debug!(filename, "LOCAL INFILE denied by policy");
            self.write_packet(&[]).await?;
            return match self.read_final_ok().await {
                Ok(ok) => {
                    self.finish_statement(ok.status_flags, ok.warnings);
                    Err(Error::LocalInfileDenied(filename.to_string()))
                }
                Err(e) => Err(e),
            };
        }

        debug!(filename, "streaming LOCAL INFILE");
        let result = self.stream_local_file(filename).await;
        self.write_packet(&[]).await?;
        let ok = self.read_final_ok().await?;
        self.finish_statement(ok.status_flags, ok.warnings);
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        result?;
        Ok(ResultSet::Ok(ok))
    }

    async fn stream_local_file(&mut self, filename: &str) -> Result<()> {
        let mut file = tokio::fs::File::open(filename).await.map_err(Error::Io)?;
        let mut chunk = vec![0u8; MAX_PACKET_SIZE - PacketHeader::SIZE];
        loop {
            let n = file.read(&mut chunk).await.map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            let data = chunk[..n].to_vec();
            self.write_packet(&data).await?;
        }
        Ok(())
    }

    async fn read_final_ok(&mut self) -> Result<OkPacket> {
        let payload = self.read_packet().await?;
        match payload.first() {
            Some(0x00) => {
                let mut reader = PacketReader::new(&payload);
                match reader.parse_ok_packet() {
                    Some(ok) => Ok(ok),
                    None => Err(self.fail(Error::Truncated("OK packet"))),
                }
            }
            Some(0xFF) => {
                let err = self.server_error(&payload);
                self.state = ConnectionState::Idle;
                Err(err)
            }
            _ => Err(self.fail(Error::protocol("expected OK or ERR packet"))),
        }
    }

    // ------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------

    /// Prepare a statement.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        trace!(sql, "COM_STMT_PREPARE");
        self.begin_command()?;
        let packet = prepared::build_stmt_prepare_packet(sql, self.sequence_id);
        self.sequence_id = self.sequence_id.wrapping_add(1);
        match self.transport.write_all(&packet).await {
            Ok(()) => {}
            Err(e) => return Err(self.fail(e)),
        }

        let payload = self.read_packet().await?;
        if payload.first() == Some(&0xFF) {
            let err = self.server_error(&payload);
            self.state = ConnectionState::Idle;
            return Err(err);
        }

        let ok = match prepared::parse_stmt_prepare_ok(&payload) {
            Some(ok) => ok,
            None => return Err(self.fail(Error::Truncated("COM_STMT_PREPARE response"))),
        };

        let params = self.read_stmt_column_defs(ok.num_params as usize).await?;
        let columns = self.read_stmt_column_defs(ok.num_columns as usize).await?;

        self.state = ConnectionState::Idle;
        Ok(PreparedStatement::new(
            ok.statement_id,
            sql.to_string(),
            params,
            columns,
        ))
    }

    async fn read_stmt_column_defs(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut defs = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet().await?;
            match parse_column_def(&payload) {
                Ok(col) => defs.push(col),
                Err(e) => return Err(self.fail(e)),
            }
        }
        if !self.deprecate_eof() {
            let payload = self.read_packet().await?;
            if payload.first() != Some(&0xFE) {
                return Err(self.fail(Error::protocol(
                    "expected EOF after statement metadata",
                )));
            }
        }
        Ok(defs)
    }

    /// Execute a prepared statement.
    pub async fn execute(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        self.execute_inner(stmt, params, cursor_type::NO_CURSOR).await
    }

    /// Execute requesting a read-only server-side cursor; rows arrive via
    /// [`AsyncConnection::fetch`].
    pub async fn execute_with_cursor(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        self.execute_inner(stmt, params, cursor_type::READ_ONLY).await
    }

    async fn execute_inner(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
        cursor_flags: u8,
    ) -> Result<ResultSet> {
        if params.len() != stmt.param_count() {
            return Err(Error::BadParameterCount {
                expected: stmt.param_count(),
                actual: params.len(),
            });
        }

        trace!(
            statement_id = stmt.statement_id,
            params = params.len(),
            "COM_STMT_EXECUTE"
        );
        self.begin_command()?;

        let long_params = prepared::long_data_params(params);
        let mut long_data_sent = vec![false; params.len()];
        for (index, data) in &long_params {
            long_data_sent[*index as usize] = true;
            self.send_long_data(stmt.statement_id, *index, data).await?;
        }

        let packet = prepared::build_stmt_execute_packet(
            stmt.statement_id,
            params,
            cursor_flags,
            &long_data_sent,
            self.sequence_id,
        );
        self.sequence_id = self.sequence_id.wrapping_add(1);
        match self.transport.write_all(&packet).await {
            Ok(()) => {}
            Err(e) => return Err(self.fail(e)),
        }

        self.read_result_set(RowFormat::Binary, false).await
    }

    async fn send_long_data(
        &mut self,
        statement_id: u32,
        param_index: u16,
        data: &[u8],
    ) -> Result<()> {
        const CHUNK: usize = MAX_PACKET_SIZE - 64;
        for chunk in data.chunks(CHUNK) {
            let packet = prepared::build_stmt_send_long_data_packet(
                statement_id,
                param_index,
                chunk,
                self.sequence_id,
            );
            match self.transport.write_all(&packet).await {
                Ok(()) => {}
                Err(e) => return Err(self.fail(e)),
            }
            self.sequence_id = 0;
        }
        Ok(())
    }

    /// Fetch rows from an open server-side cursor.
    pub async fn fetch(&mut self, stmt: &PreparedStatement, num_rows: u32) -> Result<ResultSet> {
        trace!(statement_id = stmt.statement_id, num_rows, "COM_STMT_FETCH");
        self.begin_command()?;
        let packet =
            prepared::build_stmt_fetch_packet(stmt.statement_id, num_rows, self.sequence_id);
        self.sequence_id = self.sequence_id.wrapping_add(1);
        match self.transport.write_all(&packet).await {
            Ok(()) => {}
            Err(e) => return Err(self.fail(e)),
        }

        let columns = stmt.columns.clone();
        let info = column_info(&columns);
        self.state = ConnectionState::ReadingRows;

        let mut rows = Vec::new();
        let (status_flags, warnings) = loop {
            let payload = self.read_packet().await?;
            if payload.is_empty() {
                return Err(self.fail(Error::protocol("empty fetch packet")));
            }
            if payload[0] == 0xFF {
                let err = self.server_error(&payload);
                self.state = ConnectionState::Idle;
                return Err(err);
            }
            if payload[0] == 0xFE && payload.len() < MAX_PACKET_SIZE {
                break self.parse_terminal(&payload)?;
            }
            match parse_binary_row(&payload, &columns, &info) {
                Ok(row) => rows.push(row),
                Err(e) => return Err(self.fail(e)),
            }
        };

        self.finish_statement(status_flags, warnings);
        Ok(ResultSet::Rows {
            columns,
            rows,
            status_flags,
            warnings,
        })
    }

    /// Close a prepared statement. Fire-and-forget.
    pub async fn stmt_close(&mut self, stmt: PreparedStatement) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.begin_command()?;
        let packet = prepared::build_stmt_close_packet(stmt.statement_id, self.sequence_id);
        match self.transport.write_all(&packet).await {
            Ok(()) => {}
            Err(e) => return Err(self.fail(e)),
        }
        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Reset a prepared statement, discarding accumulated long data.
    pub async fn stmt_reset(&mut self, stmt: &PreparedStatement) -> Result<()> {
        self.send_command(Command::StmtReset, &stmt.statement_id.to_le_bytes())
            .await?;
        let ok = self.read_final_ok().await?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Utility commands
    // ------------------------------------------------------------------

    /// COM_PING.
    pub async fn ping(&mut self) -> Result<()> {
        self.send_command(Command::Ping, &[]).await?;
        let ok = self.read_final_ok().await?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    /// COM_INIT_DB: switch the default database.
    pub async fn select_db(&mut self, database: &str) -> Result<()> {
        self.send_command(Command::InitDb, database.as_bytes()).await?;
        let ok = self.read_final_ok().await?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    /// COM_PROCESS_KILL.
    pub async fn kill(&mut self, thread_id: u32) -> Result<()> {
        self.send_command(Command::ProcessKill, &thread_id.to_le_bytes())
            .await?;
        let ok = self.read_final_ok().await?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    /// Send COM_QUIT and drop the connection. Best effort.
    pub async fn close(mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.sequence_id = 0;
        self.transport.reset_sequence();
        let mut w = PacketWriter::with_capacity(1);
        w.write_u8(Command::Quit as u8);
        let payload = w.into_bytes();
        let _ = self.write_packet(&payload).await;
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

/// Open the TCP or Unix stream named by the config.
async fn open_stream(config: &Config) -> Result<(AsyncStream, bool)> {
    #[cfg(unix)]
    if config.is_local_host() {
        if let Some(path) = config.effective_unix_socket() {
            let stream = UnixStream::connect(&path).await.map_err(Error::Io)?;
            debug!(path = %path.display(), "connected via unix socket");
            return Ok((AsyncStream::Unix(stream), true));
        }
    }

    let stream = TcpStream::connect(config.socket_addr())
        .await
        .map_err(Error::Io)?;
    stream.set_nodelay(true).ok();
    debug!(addr = %config.socket_addr(), "connected via TCP");
    Ok((AsyncStream::Tcp(stream), false))
}
