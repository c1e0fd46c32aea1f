//! Synchronous MySQL connection.
//!
//! Owns the transport, the negotiated capabilities, and the protocol state
//! machine. One command is in flight at a time: entering a command resets
//! the packet sequence to zero, and the connection refuses further commands
//! until the whole response has been consumed.
//!
//! State transitions:
//!
//! ```text
//! Connecting -> (TLS upgrade?) -> Authenticating -> Idle
//! Idle -> Command -> { Idle | ReadingRows | InLocalInfile }
//! ReadingRows -> Idle            (terminal OK/EOF consumed)
//! InLocalInfile -> Idle          (file streamed, final OK/ERR read)
//! any fatal error -> Closed
//! ```

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use tracing::{debug, trace};

use crate::auth::{self, AuthSession, AuthStep, PluginKind};
use crate::config::{Compression, Config};
use crate::error::{Error, Result};
use crate::protocol::prepared::{self, PreparedStatement, cursor_type};
use crate::protocol::rows::{column_info, parse_binary_row, parse_column_def, parse_text_row};
use crate::protocol::{
    CapabilityFlags, Command, MAX_PACKET_SIZE, OkPacket, PacketHeader, PacketReader, PacketType,
    PacketWriter, server_status,
};
use crate::row::Row;
use crate::types::{ColumnDef, interpolate_params};
use crate::value::Value;

#[cfg(feature = "compress")]
use crate::protocol::compress;
#[cfg(feature = "tls")]
use crate::tls::TlsStream;

/// Connection state in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Awaiting the server handshake
    Connecting,
    /// Handshake received, authentication exchange in progress
    Authenticating,
    /// Ready for a command
    Idle,
    /// Command sent, awaiting the first response packet
    Command,
    /// Consuming a result set
    ReadingRows,
    /// Streaming a local file to the server
    InLocalInfile,
    /// Connection is gone; only `close` is valid
    Closed,
}

/// What the server told us about itself in the handshake.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Protocol version (always 10)
    pub protocol_version: u8,
    /// Server version string
    pub server_version: String,
    /// Connection (thread) id
    pub connection_id: u32,
    /// Server capability flags
    pub capabilities: CapabilityFlags,
    /// Server default collation id
    pub charset: u8,
    /// Server status flags at handshake
    pub status_flags: u16,
    /// Announced auth plugin
    pub auth_plugin: String,
    /// Auth seed (scramble)
    pub auth_data: Vec<u8>,
}

/// One result of a statement: either a row-less OK or a set of rows.
#[derive(Debug)]
pub enum ResultSet {
    /// Statement produced no rows (INSERT, UPDATE, DDL, ...)
    Ok(OkPacket),
    /// Statement produced rows
    Rows {
        columns: Vec<ColumnDef>,
        rows: Vec<Row>,
        status_flags: u16,
        warnings: u16,
    },
}

impl ResultSet {
    /// Rows, empty for OK results.
    pub fn rows(&self) -> &[Row] {
        match self {
            ResultSet::Ok(_) => &[],
            ResultSet::Rows { rows, .. } => rows,
        }
    }

    /// Consume into rows.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            ResultSet::Ok(_) => Vec::new(),
            ResultSet::Rows { rows, .. } => rows,
        }
    }

    /// Affected row count for OK results.
    pub fn affected_rows(&self) -> u64 {
        match self {
            ResultSet::Ok(ok) => ok.affected_rows,
            ResultSet::Rows { .. } => 0,
        }
    }

    /// Whether another result set follows.
    pub fn more_results(&self) -> bool {
        self.status_flags() & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    fn status_flags(&self) -> u16 {
        match self {
            ResultSet::Ok(ok) => ok.status_flags,
            ResultSet::Rows { status_flags, .. } => *status_flags,
        }
    }
}

// ============================================================================
// Transport: socket + optional TLS + optional compression
// ============================================================================

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient state while the TLS upgrade swaps streams
    Detached,
}

fn detached_error() -> std::io::Error {
    std::io::Error::other("stream detached during TLS upgrade")
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
            Stream::Detached => Err(detached_error()),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
            Stream::Detached => Err(detached_error()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
            Stream::Detached => Err(detached_error()),
        }
    }
}

/// Byte transport under the packet framer.
///
/// With compression active, reads refill an internal buffer one compressed
/// frame at a time and writes wrap each flush in a compressed frame; the
/// framer above never knows the difference.
struct Transport {
    stream: Stream,
    #[cfg(feature = "compress")]
    codec: Option<compress::Codec>,
    #[cfg(feature = "compress")]
    comp_seq: u8,
    #[cfg(feature = "compress")]
    read_buf: Vec<u8>,
    #[cfg(feature = "compress")]
    read_pos: usize,
}

impl Transport {
    fn new(stream: Stream) -> Self {
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

    /// Reset the compressed sequence alongside the packet sequence.
    fn reset_sequence(&mut self) {
        #[cfg(feature = "compress")]
        {
            self.comp_seq = 0;
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        #[cfg(feature = "compress")]
        if self.codec.is_some() {
            let mut filled = 0;
            while filled < buf.len() {
                if self.read_pos >= self.read_buf.len() {
                    self.refill_from_frame()?;
                }
                let available = &self.read_buf[self.read_pos..];
                let n = available.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&available[..n]);
                self.read_pos += n;
                filled += n;
            }
            return Ok(());
        }

        self.stream.read_exact(buf)?;
        Ok(())
    }

    #[cfg(feature = "compress")]
    fn refill_from_frame(&mut self) -> Result<()> {
        let codec = self.codec.expect("refill without compression");

        let mut header_buf = [0u8; compress::COMPRESSED_HEADER_SIZE];
        self.stream.read_exact(&mut header_buf)?;
        let header = compress::CompressedHeader::from_bytes(&header_buf);

        if header.sequence_id != self.comp_seq {
            return Err(Error::SequenceDesync {
                expected: self.comp_seq,
                actual: header.sequence_id,
            });
        }
        self.comp_seq = header.sequence_id.wrapping_add(1);

        let mut body = vec![0u8; header.compressed_length as usize];
        self.stream.read_exact(&mut body)?;

        self.read_buf = compress::unwrap_frame(codec, &header, &body)?;
        self.read_pos = 0;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        #[cfg(feature = "compress")]
        if let Some(codec) = self.codec {
            let frame = compress::build_frame(codec, bytes, self.comp_seq)?;
            self.comp_seq = self.comp_seq.wrapping_add(1);
            self.stream.write_all(&frame)?;
            self.stream.flush()?;
            return Ok(());
        }

        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A synchronous MySQL connection.
pub struct Connection {
    transport: Transport,
    state: ConnectionState,
    config: Config,
    server: Option<ServerInfo>,
    /// Negotiated capability set (client AND server)
    capabilities: CapabilityFlags,
    /// Next packet sequence id, both for reads and writes
    sequence_id: u8,
    status_flags: u16,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    /// Set when a terminal packet announced a following result set
    more_results_pending: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect and authenticate.
    pub fn connect(config: Config) -> Result<Self> {
        let (stream, via_unix_socket) = open_stream(&config)?;

        let mut conn = Self {
            transport: Transport::new(stream),
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
        };

        conn.handshake(via_unix_socket).map_err(|e| {
            conn.state = ConnectionState::Closed;
            e
        })?;

        conn.setup_session()?;
        Ok(conn)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connection (thread) id assigned by the server.
    pub fn connection_id(&self) -> u32 {
        self.server.as_ref().map_or(0, |s| s.connection_id)
    }

    /// Server version string.
    pub fn server_version(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.server_version.as_str())
    }

    /// Negotiated capability flags.
    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    /// Affected rows from the last statement.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Last insert id from the last statement.
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// Warning count from the last statement.
    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Whether the server reports an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    // ------------------------------------------------------------------
    // Connect phase
    // ------------------------------------------------------------------

    fn handshake(&mut self, via_unix_socket: bool) -> Result<()> {
        let server = self.read_handshake()?;
        debug!(
            server_version = %server.server_version,
            connection_id = server.connection_id,
            auth_plugin = %server.auth_plugin,
            "received server handshake"
        );

        let requested = self.config.capability_flags();
        let mut client_caps = requested & server.capabilities;
        // PLUGIN_AUTH rides along whenever the server can do it
        if server.capabilities.contains(CapabilityFlags::PLUGIN_AUTH) {
            client_caps |= CapabilityFlags::PLUGIN_AUTH;
        }

        let use_tls = crate::tls::validate_ssl_mode(self.config.ssl_mode, server.capabilities)?;
        crate::tls::validate_tls_config(self.config.ssl_mode, &self.config.tls)?;

        if self.config.compression.is_enabled() {
            let wanted = match self.config.compression {
                Compression::Zlib => CapabilityFlags::COMPRESS,
                Compression::Zstd { .. } => CapabilityFlags::ZSTD_COMPRESSION,
                Compression::None => unreachable!(),
            };
            if !client_caps.contains(wanted) {
                debug!("server does not support the requested compression, disabling");
            }
        }

        if use_tls {
            self.upgrade_to_tls(client_caps)?;
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

        self.send_handshake_response(&session)?;
        self.authenticate(&mut session)?;

        // Compression starts with the command phase
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

    /// Read and parse the v10 handshake packet.
    fn read_handshake(&mut self) -> Result<ServerInfo> {
        let payload = self.read_packet()?;
        parse_handshake_payload(&payload)
    }

    fn upgrade_to_tls(&mut self, client_caps: CapabilityFlags) -> Result<()> {
        #[cfg(feature = "tls")]
        {
            let packet = crate::tls::build_ssl_request_packet(
                client_caps,
                self.config.max_packet_size,
                self.config.charset_id(),
                self.sequence_id,
            );
            self.sequence_id = self.sequence_id.wrapping_add(1);
            self.transport.write_all(&packet)?;

            // Swap the plain TCP stream for the TLS session
            let old = std::mem::replace(&mut self.transport.stream, Stream::Detached);
            let Stream::Tcp(tcp) = old else {
                return Err(Error::Tls(
                    "TLS upgrade requires a plain TCP stream".to_string(),
                ));
            };
            let tls = TlsStream::connect(
                tcp,
                &self.config.tls,
                &self.config.host,
                self.config.ssl_mode,
            )?;
            self.transport.stream = Stream::Tls(Box::new(tls));
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

    /// Build and send the handshake response.
    fn send_handshake_response(&mut self, session: &AuthSession) -> Result<()> {
        let payload = build_handshake_response_payload(&self.config, self.capabilities, session);
        self.write_packet(&payload)
    }

    /// Drive the authentication exchange to its final OK.
    fn authenticate(&mut self, session: &mut AuthSession) -> Result<()> {
        loop {
            let payload = self.read_packet()?;
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
                    // AuthSwitchRequest: plugin name, NUL, new seed
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
                    self.write_packet(&response)?;
                }
                0x01 => {
                    // AuthMoreData
                    match session.handle_more(&payload[1..])? {
                        AuthStep::Respond(bytes) => self.write_packet(&bytes)?,
                        AuthStep::Done => {}
                    }
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected auth packet starting with 0x{other:02X}"
                    )));
                }
            }
        }
    }

    /// Post-auth session setup: charset, sql_mode, init_command.
    fn setup_session(&mut self) -> Result<()> {
        let charset = self.config.charset.clone();
        if !charset.is_empty() {
            self.query(&format!("SET NAMES {charset}"))?;
        }
        if let Some(mode) = self.config.sql_mode.clone() {
            self.query_with_params("SET sql_mode = ?", &[Value::Text(mode)])?;
        }
        if let Some(command) = self.config.init_command.clone() {
            self.query(&command)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------

    /// Read one logical packet, reassembling 16 MiB continuations.
    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = self.read_packet_chunk()?;
        if payload.len() == MAX_PACKET_SIZE {
            loop {
                let chunk = self.read_packet_chunk()?;
                let last = chunk.len() < MAX_PACKET_SIZE;
                payload.extend_from_slice(&chunk);
                if last {
                    break;
                }
            }
        }
        Ok(payload)
    }

    fn read_packet_chunk(&mut self) -> Result<Vec<u8>> {
        let mut header_buf = [0u8; PacketHeader::SIZE];
        self.transport.read_exact(&mut header_buf).map_err(|e| self.fail(e))?;
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
            self.transport.read_exact(&mut payload).map_err(|e| self.fail(e))?;
        }
        Ok(payload)
    }

    /// Frame and send one logical payload, stamping sequence ids.
    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
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
                // Terminating empty packet
                let header = PacketHeader {
                    payload_length: 0,
                    sequence_id: self.sequence_id,
                };
                self.sequence_id = self.sequence_id.wrapping_add(1);
                buffer.extend_from_slice(&header.to_bytes());
                break;
            }
        }

        self.transport.write_all(&buffer).map_err(|e| self.fail(e))
    }

    /// Mark the connection dead on fatal errors.
    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.state = ConnectionState::Closed;
        }
        err
    }

    /// Enter the command phase: sequence ids reset, state checked.
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

    fn send_command(&mut self, command: Command, args: &[u8]) -> Result<()> {
        self.begin_command()?;
        let mut w = PacketWriter::with_capacity(1 + args.len());
        w.write_u8(command as u8);
        w.write_bytes(args);
        self.write_packet(w.as_bytes())
    }

    // ------------------------------------------------------------------
    // Text protocol
    // ------------------------------------------------------------------

    /// Execute a statement, returning its first result set.
    pub fn query(&mut self, sql: &str) -> Result<ResultSet> {
        trace!(sql, "COM_QUERY");
        self.send_command(Command::Query, sql.as_bytes())?;
        self.read_result_set(RowFormat::Text, true)
    }

    /// Execute with client-side parameter substitution.
    pub fn query_with_params(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let sql = interpolate_params(sql, params);
        self.query(&sql)
    }

    /// Read the next result set after one with the more-results flag.
    pub fn next_result(&mut self) -> Result<Option<ResultSet>> {
        if !self.more_results_pending {
            return Ok(None);
        }
        self.state = ConnectionState::Command;
        self.more_results_pending = false;
        // A LOCAL INFILE request at a result-set boundary has no sane
        // interpretation; it is rejected below
        self.read_result_set(RowFormat::Text, false).map(Some)
    }

    /// Read one full result set; the command packet is already sent.
    fn read_result_set(&mut self, format: RowFormat, allow_infile: bool) -> Result<ResultSet> {
        let payload = self.read_packet()?;
        if payload.is_empty() {
            return Err(self.fail(Error::protocol("empty response to command")));
        }

        match PacketType::from_first_byte(payload[0], payload.len()) {
            PacketType::Ok => {
                let mut reader = PacketReader::new(&payload);
                let ok = reader
                    .parse_ok_packet()
                    .ok_or(Error::Truncated("OK packet"))
                    .map_err(|e| self.fail(e))?;
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
                self.handle_local_infile(&filename)
            }
            PacketType::Eof if self.deprecate_eof() => {
                // With EOF deprecated, a short 0xFE response is an OK packet
                let mut reader = PacketReader::new(&payload);
                let ok = reader
                    .parse_ok_packet()
                    .ok_or(Error::Truncated("OK packet"))
                    .map_err(|e| self.fail(e))?;
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
                let column_count = reader
                    .read_lenenc_int()
                    .ok_or(Error::Truncated("column count"))
                    .map_err(|e| self.fail(e))? as usize;
                self.state = ConnectionState::ReadingRows;
                self.read_rows(column_count, format)
            }
        }
    }

    /// Read column definitions and rows up to the terminal packet.
    fn read_rows(&mut self, column_count: usize, format: RowFormat) -> Result<ResultSet> {
        let columns = self.read_column_defs(column_count)?;
        let info = column_info(&columns);

        let mut rows = Vec::new();
        let (status_flags, warnings) = loop {
            let payload = self.read_packet()?;
            if payload.is_empty() {
                return Err(self.fail(Error::protocol("empty row packet")));
            }

            // Row packets may start with any byte (0x00 for binary rows, a
            // lenenc length for text rows); only 0xFF and a short-enough
            // 0xFE packet are not rows. A row whose first value needs an
            // 8-byte lenenc length is itself ≥ 16 MiB, so the length test
            // disambiguates.
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
            }
            .map_err(|e| self.fail(e))?;
            rows.push(row);
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

    fn read_column_defs(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet()?;
            columns.push(parse_column_def(&payload).map_err(|e| self.fail(e))?);
        }

        // Column list is followed by EOF on old servers
        if !self.deprecate_eof() && count > 0 {
            let payload = self.read_packet()?;
            if payload.first() != Some(&0xFE) {
                return Err(self.fail(Error::protocol(
                    "expected EOF after column definitions",
                )));
            }
        }
        Ok(columns)
    }

    /// Parse the packet terminating a row stream.
    ///
    /// Legacy servers send an EOF packet; with `CLIENT_DEPRECATE_EOF` the
    /// terminator is an OK packet wearing the 0xFE header byte.
    fn parse_terminal(&mut self, payload: &[u8]) -> Result<(u16, u16)> {
        let mut reader = PacketReader::new(payload);
        if self.deprecate_eof() {
            let ok = reader
                .parse_ok_packet()
                .ok_or(Error::Truncated("terminal OK packet"))
                .map_err(|e| self.fail(e))?;
            self.affected_rows = ok.affected_rows;
            self.last_insert_id = ok.last_insert_id;
            Ok((ok.status_flags, ok.warnings))
        } else {
            let eof = reader
                .parse_eof_packet()
                .ok_or(Error::Truncated("EOF packet"))
                .map_err(|e| self.fail(e))?;
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

    /// Answer a LOCAL INFILE request by streaming the named file.
    ///
    /// Without the opt-in only the empty terminator goes out, and the
    /// server's ERR is surfaced.
    fn handle_local_infile(&mut self, filename: &str) -> Result<ResultSet> {
        self.state = ConnectionState::InLocalInfile;

        if !self.config.local_infile {
            debug!(filename, "LOCAL INFILE denied by policy");
            self.write_packet(&[])?;
            return match self.read_final_ok() {
                Ok(ok) => {
                    self.finish_statement(ok.status_flags, ok.warnings);
                    Err(Error::LocalInfileDenied(filename.to_string()))
                }
                Err(e) => Err(e),
            };
        }

        debug!(filename, "streaming LOCAL INFILE");
        let result = self.stream_local_file(filename);
        // The terminator goes out even when the file could not be read, so
        // the exchange stays in sync
        self.write_packet(&[])?;
        let ok = self.read_final_ok()?;
        self.finish_statement(ok.status_flags, ok.warnings);
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        result?;
        Ok(ResultSet::Ok(ok))
    }

    fn stream_local_file(&mut self, filename: &str) -> Result<()> {
        let mut file = std::fs::File::open(filename).map_err(Error::Io)?;
        let mut chunk = vec![0u8; MAX_PACKET_SIZE - PacketHeader::SIZE];
        loop {
            let n = file.read(&mut chunk).map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            self.write_packet(&chunk[..n])?;
        }
        Ok(())
    }

    fn read_final_ok(&mut self) -> Result<OkPacket> {
        let payload = self.read_packet()?;
        match payload.first() {
            Some(0x00) => {
                let mut reader = PacketReader::new(&payload);
                reader
                    .parse_ok_packet()
                    .ok_or(Error::Truncated("OK packet"))
                    .map_err(|e| self.fail(e))
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
    // Prepared statements (binary protocol)
    // ------------------------------------------------------------------

    /// Prepare a statement.
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        trace!(sql, "COM_STMT_PREPARE");
        self.begin_command()?;
        let packet = prepared::build_stmt_prepare_packet(sql, self.sequence_id);
        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.transport.write_all(&packet).map_err(|e| self.fail(e))?;

        let payload = self.read_packet()?;
        if payload.first() == Some(&0xFF) {
            let err = self.server_error(&payload);
            self.state = ConnectionState::Idle;
            return Err(err);
        }

        let ok = prepared::parse_stmt_prepare_ok(&payload)
            .ok_or(Error::Truncated("COM_STMT_PREPARE response"))
            .map_err(|e| self.fail(e))?;

        let params = self.read_stmt_column_defs(ok.num_params as usize)?;
        let columns = self.read_stmt_column_defs(ok.num_columns as usize)?;

        self.state = ConnectionState::Idle;
        Ok(PreparedStatement::new(
            ok.statement_id,
            sql.to_string(),
            params,
            columns,
        ))
    }

    fn read_stmt_column_defs(&mut self, count: usize) -> Result<Vec<ColumnDef>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut defs = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet()?;
            defs.push(parse_column_def(&payload).map_err(|e| self.fail(e))?);
        }
        if !self.deprecate_eof() {
            let payload = self.read_packet()?;
            if payload.first() != Some(&0xFE) {
                return Err(self.fail(Error::protocol(
                    "expected EOF after statement metadata",
                )));
            }
        }
        Ok(defs)
    }

    /// Execute a prepared statement.
    pub fn execute(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        self.execute_inner(stmt, params, cursor_type::NO_CURSOR)
    }

    /// Execute requesting a read-only server-side cursor.
    ///
    /// When the terminal packet carries `SERVER_STATUS_CURSOR_EXISTS`, rows
    /// are not inline; fetch them with [`Connection::fetch`].
    pub fn execute_with_cursor(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        self.execute_inner(stmt, params, cursor_type::READ_ONLY)
    }

    fn execute_inner(
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

        // Oversized parameters go ahead of the execute packet
        let long_params = prepared::long_data_params(params);
        let mut long_data_sent = vec![false; params.len()];
        for (index, data) in &long_params {
            long_data_sent[*index as usize] = true;
            self.send_long_data(stmt.statement_id, *index, data)?;
        }

        let packet = prepared::build_stmt_execute_packet(
            stmt.statement_id,
            params,
            cursor_flags,
            &long_data_sent,
            self.sequence_id,
        );
        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.transport.write_all(&packet).map_err(|e| self.fail(e))?;

        let result = self.read_result_set(RowFormat::Binary, false)?;

        // With a cursor open, the server sends metadata only
        if let ResultSet::Rows { status_flags, .. } = &result {
            if status_flags & server_status::SERVER_STATUS_CURSOR_EXISTS != 0 {
                trace!(statement_id = stmt.statement_id, "server-side cursor opened");
            }
        }
        Ok(result)
    }

    /// COM_STMT_SEND_LONG_DATA chunks for one parameter. No response.
    fn send_long_data(&mut self, statement_id: u32, param_index: u16, data: &[u8]) -> Result<()> {
        // Leave room for the command header inside each packet
        const CHUNK: usize = MAX_PACKET_SIZE - 64;
        for chunk in data.chunks(CHUNK) {
            let packet = prepared::build_stmt_send_long_data_packet(
                statement_id,
                param_index,
                chunk,
                self.sequence_id,
            );
            self.transport.write_all(&packet).map_err(|e| self.fail(e))?;
            // Long-data packets restart their own sequence
            self.sequence_id = 0;
        }
        Ok(())
    }

    /// Fetch rows from an open server-side cursor.
    pub fn fetch(&mut self, stmt: &PreparedStatement, num_rows: u32) -> Result<ResultSet> {
        trace!(statement_id = stmt.statement_id, num_rows, "COM_STMT_FETCH");
        self.begin_command()?;
        let packet =
            prepared::build_stmt_fetch_packet(stmt.statement_id, num_rows, self.sequence_id);
        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.transport.write_all(&packet).map_err(|e| self.fail(e))?;

        // The response is rows (binary) straight away, terminated by EOF/OK
        let columns = stmt.columns.clone();
        let info = column_info(&columns);
        self.state = ConnectionState::ReadingRows;

        let mut rows = Vec::new();
        let (status_flags, warnings) = loop {
            let payload = self.read_packet()?;
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
            rows.push(parse_binary_row(&payload, &columns, &info).map_err(|e| self.fail(e))?);
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
    pub fn stmt_close(&mut self, stmt: PreparedStatement) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.begin_command()?;
        let packet = prepared::build_stmt_close_packet(stmt.statement_id, self.sequence_id);
        self.transport.write_all(&packet).map_err(|e| self.fail(e))?;
        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Reset a prepared statement, discarding accumulated long data.
    pub fn stmt_reset(&mut self, stmt: &PreparedStatement) -> Result<()> {
        self.send_command(
            Command::StmtReset,
            &stmt.statement_id.to_le_bytes(),
        )?;
        let ok = self.read_final_ok()?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Utility commands
    // ------------------------------------------------------------------

    /// COM_PING.
    pub fn ping(&mut self) -> Result<()> {
        self.send_command(Command::Ping, &[])?;
        let ok = self.read_final_ok()?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    /// COM_INIT_DB: switch the default database.
    pub fn select_db(&mut self, database: &str) -> Result<()> {
        self.send_command(Command::InitDb, database.as_bytes())?;
        let ok = self.read_final_ok()?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    /// COM_PROCESS_KILL: ask the server to kill a thread.
    pub fn kill(&mut self, thread_id: u32) -> Result<()> {
        self.send_command(Command::ProcessKill, &thread_id.to_le_bytes())?;
        let ok = self.read_final_ok()?;
        self.finish_statement(ok.status_flags, ok.warnings);
        Ok(())
    }

    /// Send COM_QUIT and drop the connection. Best effort.
    pub fn close(mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.sequence_id = 0;
        self.transport.reset_sequence();
        let mut w = PacketWriter::with_capacity(1);
        w.write_u8(Command::Quit as u8);
        let _ = self.write_packet(w.as_bytes());
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

/// Which row encoding the current result set uses.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RowFormat {
    Text,
    Binary,
}

/// Parse a v10 handshake payload. Shared by the sync and async connections.
pub(crate) fn parse_handshake_payload(payload: &[u8]) -> Result<ServerInfo> {
    let mut reader = PacketReader::new(payload);

    let protocol_version = reader
        .read_u8()
        .ok_or(Error::Truncated("protocol version"))?;
    if protocol_version != 10 {
        return Err(Error::protocol(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }

    let server_version = reader
        .read_null_string()
        .ok_or(Error::Truncated("server version"))?;
    let connection_id = reader
        .read_u32_le()
        .ok_or(Error::Truncated("connection id"))?;

    let auth_data_1 = reader
        .read_bytes(8)
        .ok_or(Error::Truncated("auth plugin data"))?
        .to_vec();
    reader.skip(1); // filler

    let caps_low = reader
        .read_u16_le()
        .ok_or(Error::Truncated("capability flags"))?;

    let charset = reader.read_u8().unwrap_or(0);
    let status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_high = reader.read_u16_le().unwrap_or(0);
    let capabilities = CapabilityFlags::from_words(caps_low, caps_high);

    let auth_data_len = if capabilities.contains(CapabilityFlags::PLUGIN_AUTH) {
        reader.read_u8().unwrap_or(0) as usize
    } else {
        reader.skip(1);
        0
    };
    reader.skip(10); // reserved

    let mut auth_data = auth_data_1;
    if capabilities.contains(CapabilityFlags::SECURE_CONNECTION) {
        let len2 = auth_data_len.saturating_sub(8).max(13);
        if let Some(part2) = reader.read_bytes(len2) {
            // The scramble tail carries a trailing NUL
            let part2 = if part2.last() == Some(&0) {
                &part2[..part2.len() - 1]
            } else {
                part2
            };
            auth_data.extend_from_slice(part2);
        }
    }

    let auth_plugin = if capabilities.contains(CapabilityFlags::PLUGIN_AUTH) {
        reader.read_null_string().unwrap_or_default()
    } else {
        auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
    };

    Ok(ServerInfo {
        protocol_version,
        server_version,
        connection_id,
        capabilities,
        charset,
        status_flags,
        auth_plugin,
        auth_data,
    })
}

/// Build a handshake response payload. Shared by the sync and async
/// connections.
pub(crate) fn build_handshake_response_payload(
    config: &Config,
    caps: CapabilityFlags,
    session: &AuthSession,
) -> Vec<u8> {
    let auth_response = session.initial_response();

    let mut w = PacketWriter::new();
    w.write_u32_le(caps.bits());
    w.write_u32_le(config.max_packet_size);
    w.write_u8(config.charset_id());
    w.write_zeros(23);
    w.write_null_string(&config.user);

    if caps.contains(CapabilityFlags::PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        w.write_lenenc_bytes(&auth_response);
    } else if caps.contains(CapabilityFlags::SECURE_CONNECTION) {
        w.write_u8(auth_response.len() as u8);
        w.write_bytes(&auth_response);
    } else {
        w.write_bytes(&auth_response);
        w.write_u8(0);
    }

    if caps.contains(CapabilityFlags::CONNECT_WITH_DB) {
        match &config.database {
            Some(db) => w.write_null_string(db),
            None => w.write_u8(0),
        }
    }

    if caps.contains(CapabilityFlags::PLUGIN_AUTH) {
        w.write_null_string(session.kind().name());
    }

    if caps.contains(CapabilityFlags::CONNECT_ATTRS) {
        let mut attrs = PacketWriter::new();
        for (key, value) in &config.connect_attrs {
            attrs.write_lenenc_string(key);
            attrs.write_lenenc_string(value);
        }
        w.write_lenenc_bytes(attrs.as_bytes());
    }

    if caps.contains(CapabilityFlags::ZSTD_COMPRESSION) {
        let level = match config.compression {
            Compression::Zstd { level } => level,
            _ => 3,
        };
        w.write_u8(level as u8);
    }

    w.into_bytes()
}

/// Open the TCP or Unix stream named by the config.
fn open_stream(config: &Config) -> Result<(Stream, bool)> {
    #[cfg(unix)]
    if config.is_local_host() {
        if let Some(path) = config.effective_unix_socket() {
            let stream = UnixStream::connect(&path).map_err(Error::Io)?;
            stream
                .set_read_timeout(config.read_timeout)
                .map_err(Error::Io)?;
            stream
                .set_write_timeout(config.write_timeout)
                .map_err(Error::Io)?;
            debug!(path = %path.display(), "connected via unix socket");
            return Ok((Stream::Unix(stream), true));
        }
    }

    use std::net::ToSocketAddrs;
    let addr = config
        .socket_addr()
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {}", config.socket_addr()),
            ))
        })?;

    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(Error::Io)?;
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(config.read_timeout)
        .map_err(Error::Io)?;
    stream
        .set_write_timeout(config.write_timeout)
        .map_err(Error::Io)?;
    debug!(addr = %addr, "connected via TCP");
    Ok((Stream::Tcp(stream), false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_set_accessors() {
        let ok = ResultSet::Ok(OkPacket {
            affected_rows: 3,
            last_insert_id: 10,
            status_flags: server_status::SERVER_MORE_RESULTS_EXISTS,
            warnings: 0,
            info: String::new(),
        });
        assert_eq!(ok.affected_rows(), 3);
        assert!(ok.rows().is_empty());
        assert!(ok.more_results());

        let rows = ResultSet::Rows {
            columns: vec![],
            rows: vec![],
            status_flags: 0,
            warnings: 0,
        };
        assert_eq!(rows.affected_rows(), 0);
        assert!(!rows.more_results());
    }

    #[test]
    fn test_states_are_distinct() {
        assert_ne!(ConnectionState::Idle, ConnectionState::Command);
        assert_ne!(ConnectionState::ReadingRows, ConnectionState::InLocalInfile);
    }

    /// Build a v10 handshake payload the way a MySQL 8 server does.
    fn synthetic_handshake(caps: CapabilityFlags, plugin: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36");
        w.write_u32_le(99); // connection id
        w.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]); // auth data part 1
        w.write_u8(0); // filler
        w.write_u16_le(caps.low_word());
        w.write_u8(255); // charset
        w.write_u16_le(2); // status flags
        w.write_u16_le(caps.high_word());
        w.write_u8(21); // auth data total length
        w.write_zeros(10); // reserved
        // part 2: 12 bytes + NUL (max(13, 21 - 8))
        w.write_bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        w.write_u8(0);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    #[test]
    fn test_parse_handshake_payload() {
        let caps = CapabilityFlags::DEFAULT_CLIENT
            | CapabilityFlags::SSL
            | CapabilityFlags::SECURE_CONNECTION
            | CapabilityFlags::PLUGIN_AUTH;
        let payload = synthetic_handshake(caps, "caching_sha2_password");
        let info = parse_handshake_payload(&payload).unwrap();

        assert_eq!(info.protocol_version, 10);
        assert_eq!(info.server_version, "8.0.36");
        assert_eq!(info.connection_id, 99);
        assert_eq!(info.auth_plugin, "caching_sha2_password");
        assert_eq!(info.auth_data.len(), 20);
        assert_eq!(info.auth_data[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(info.auth_data[8..], [9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        assert!(info.capabilities.contains(CapabilityFlags::SSL));
        assert_eq!(info.charset, 255);
        assert_eq!(info.status_flags, 2);
    }

    #[test]
    fn test_parse_handshake_rejects_other_protocols() {
        let mut payload = synthetic_handshake(CapabilityFlags::DEFAULT_CLIENT, "x");
        payload[0] = 9;
        assert!(parse_handshake_payload(&payload).is_err());
    }

    #[test]
    fn test_handshake_response_layout() {
        let config = Config::new()
            .user("root")
            .database("testdb")
            .charset("utf8mb4");
        let caps = CapabilityFlags::DEFAULT_CLIENT | CapabilityFlags::CONNECT_WITH_DB;
        let session = AuthSession::new(
            PluginKind::MysqlNativePassword,
            "",
            vec![0; 20],
            false,
            "localhost:3306",
        );

        let payload = build_handshake_response_payload(&config, caps, &session);
        let mut reader = PacketReader::new(&payload);

        assert_eq!(reader.read_u32_le(), Some(caps.bits()));
        assert_eq!(reader.read_u32_le(), Some(config.max_packet_size));
        assert_eq!(reader.read_u8(), Some(45)); // utf8mb4
        assert!(reader.skip(23));
        assert_eq!(reader.read_null_string().as_deref(), Some("root"));
        // Empty password: lenenc auth response of length 0
        assert_eq!(reader.read_lenenc_int(), Some(0));
        assert_eq!(reader.read_null_string().as_deref(), Some("testdb"));
        assert_eq!(
            reader.read_null_string().as_deref(),
            Some("mysql_native_password")
        );
        assert!(reader.is_empty());
    }
}
