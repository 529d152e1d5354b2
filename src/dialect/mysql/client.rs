//! Binlog Client
//!
//! Connects to MySQL or MariaDB as a replica and streams binlog events.

use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::config::RdbmsConfiguration;
use crate::error::{Error, Result};
use crate::position::BinlogPosition;

const DEFAULT_PORT: u16 = 3306;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PACKET_LEN: usize = 0xFF_FFFF;
/// Interval the server sends heartbeats at while idle, in nanoseconds
const HEARTBEAT_PERIOD_NS: u64 = 30_000_000_000;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

impl ConnectParams {
    pub fn from_config(config: &RdbmsConfiguration) -> Result<Self> {
        let url = reqwest::Url::parse(&config.connection_url()?)
            .map_err(|e| Error::Config(format!("invalid url {}: {}", config.display_address(), e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("url {} has no host", config.display_address())))?
            .to_string();
        let database = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|db| !db.is_empty())
            .map(str::to_string);

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            user: config
                .username
                .clone()
                .unwrap_or_else(|| url.username().to_string()),
            password: config
                .password
                .clone()
                .or_else(|| url.password().map(str::to_string))
                .unwrap_or_default(),
            database,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Replica identity derived from the job item key, stable across restarts
pub fn server_id_for(job_key: &str) -> u32 {
    // Keep clear of the small ids operators assign by hand
    1_000_000 + crc32fast::hash(job_key.as_bytes()) % 3_000_000_000
}

/// Initial handshake sent by the server
#[derive(Debug, Clone, PartialEq)]
struct Handshake {
    server_version: String,
    connection_id: u32,
    scramble: Vec<u8>,
    capabilities: u32,
    plugin: String,
}

/// Binlog replication client
pub struct BinlogClient {
    stream: BufStream<TcpStream>,
    sequence: u8,
    address: String,
    checksum: bool,
}

impl BinlogClient {
    /// Connect and authenticate
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        let address = params.address();
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Connection {
                address: address.clone(),
                reason: "timed out".into(),
            })?
            .map_err(|e| Error::Connection {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream: BufStream::new(stream),
            sequence: 0,
            address,
            checksum: false,
        };

        let packet = client.read_packet().await?;
        if packet.first() == Some(&0xFF) {
            return Err(Error::Connection {
                address: client.address.clone(),
                reason: server_error(&packet),
            });
        }
        let handshake = parse_handshake(&packet)?;
        tracing::debug!(
            "Connected to {} ({}), connection id {}",
            client.address,
            handshake.server_version,
            handshake.connection_id
        );

        client.authenticate(params, &handshake).await?;
        Ok(client)
    }

    async fn authenticate(&mut self, params: &ConnectParams, handshake: &Handshake) -> Result<()> {
        let plugin = if handshake.plugin.is_empty() {
            NATIVE_PASSWORD
        } else {
            handshake.plugin.as_str()
        };
        let auth = auth_response(plugin, &params.password, &handshake.scramble)?;

        let mut capabilities = CLIENT_LONG_PASSWORD
            | CLIENT_LONG_FLAG
            | CLIENT_PROTOCOL_41
            | CLIENT_TRANSACTIONS
            | CLIENT_SECURE_CONNECTION
            | CLIENT_MULTI_RESULTS
            | CLIENT_PLUGIN_AUTH;
        if params.database.is_some() {
            capabilities |= CLIENT_CONNECT_WITH_DB;
        }
        capabilities &= handshake.capabilities | CLIENT_CONNECT_WITH_DB;

        let mut response = BytesMut::new();
        response.put_u32_le(capabilities);
        response.put_u32_le(MAX_PACKET_LEN as u32);
        response.put_u8(45); // utf8mb4_general_ci
        response.put_bytes(0, 23);
        response.put_slice(params.user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth.len() as u8);
        response.put_slice(&auth);
        if let Some(database) = &params.database {
            response.put_slice(database.as_bytes());
            response.put_u8(0);
        }
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);
        self.write_packet(&response).await?;

        loop {
            let packet = self.read_packet().await?;
            match packet.first() {
                Some(0x00) => break,
                Some(0xFF) => {
                    return Err(Error::Config(format!(
                        "authentication as {} failed: {}",
                        params.user,
                        server_error(&packet)
                    )));
                }
                Some(0xFE) => {
                    // Auth switch: plugin name, then a fresh scramble
                    let rest = &packet[1..];
                    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                    let plugin = String::from_utf8_lossy(&rest[..end]).to_string();
                    let mut scramble = rest.get(end + 1..).unwrap_or_default().to_vec();
                    if scramble.last() == Some(&0) {
                        scramble.pop();
                    }
                    tracing::debug!("Server switched authentication to {}", plugin);
                    let auth = auth_response(&plugin, &params.password, &scramble)?;
                    self.write_packet(&auth).await?;
                }
                Some(0x01) => match packet.get(1) {
                    // Fast authentication succeeded, OK follows
                    Some(0x03) => continue,
                    Some(0x04) => {
                        return Err(Error::Config(format!(
                            "{} requires full authentication for {}; connect once with a \
                             client to populate the server's cache or use {}",
                            CACHING_SHA2_PASSWORD, params.user, NATIVE_PASSWORD
                        )));
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected auth continuation {:?}",
                            other
                        )));
                    }
                },
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected auth response {:?}",
                        other
                    )));
                }
            }
        }

        tracing::debug!("Authenticated to {} as {}", self.address, params.user);
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        read_packet(&mut self.stream, &mut self.sequence).await
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        write_packet(&mut self.stream, &mut self.sequence, payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn command(&mut self, payload: &[u8]) -> Result<()> {
        self.sequence = 0;
        self.write_packet(payload).await
    }

    /// Run a statement that returns no result set
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        let mut payload = BytesMut::with_capacity(sql.len() + 1);
        payload.put_u8(COM_QUERY);
        payload.put_slice(sql.as_bytes());
        self.command(&payload).await?;

        let packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(Error::Protocol(format!(
                "{} failed: {}",
                sql,
                server_error(&packet)
            ))),
            _ => Err(Error::Protocol(format!("{} returned a result set", sql))),
        }
    }

    /// Ask the server to checksum events and send heartbeats
    pub async fn prepare(&mut self, checksum: bool) -> Result<()> {
        if checksum {
            self.query("SET @master_binlog_checksum = @@global.binlog_checksum")
                .await?;
        }
        self.checksum = checksum;
        // MariaDB: announce GTID awareness so GTID events are sent
        self.query("SET @mariadb_slave_capability = 4").await?;
        self.query(&format!("SET @master_heartbeat_period = {}", HEARTBEAT_PERIOD_NS))
            .await?;
        Ok(())
    }

    pub async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        let mut payload = BytesMut::new();
        payload.put_u8(COM_REGISTER_SLAVE);
        payload.put_u32_le(server_id);
        payload.put_u8(0); // hostname length
        payload.put_u8(0); // user length
        payload.put_u8(0); // password length
        payload.put_u16_le(0); // port
        payload.put_u32_le(0); // replication rank
        payload.put_u32_le(0); // master_id
        self.command(&payload).await?;

        let packet = self.read_packet().await?;
        if packet.first() == Some(&0xFF) {
            return Err(Error::Protocol(format!(
                "Register slave failed: {}",
                server_error(&packet)
            )));
        }

        tracing::debug!("Registered as slave with server_id {}", server_id);
        Ok(())
    }

    pub async fn binlog_dump(&mut self, from: &BinlogPosition, server_id: u32) -> Result<()> {
        let offset = u32::try_from(from.position)
            .map_err(|_| Error::Position(from.to_string()))?;

        let mut payload = BytesMut::new();
        payload.put_u8(COM_BINLOG_DUMP);
        payload.put_u32_le(offset);
        payload.put_u16_le(0); // flags
        payload.put_u32_le(server_id);
        payload.put_slice(from.file_name.as_bytes());
        self.command(&payload).await?;

        tracing::debug!("Sent COM_BINLOG_DUMP for {}", from);
        Ok(())
    }

    /// Next raw event with the checksum removed, `None` at end of stream
    pub async fn next_event(&mut self) -> Result<Option<Vec<u8>>> {
        let packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => {
                let event = &packet[1..];
                let event = if self.checksum {
                    verify_checksum(event)?
                } else {
                    event
                };
                Ok(Some(event.to_vec()))
            }
            Some(0xFE) if packet.len() < 9 => {
                tracing::info!("Received EOF from binlog stream");
                Ok(None)
            }
            Some(0xFF) => Err(Error::Protocol(server_error(&packet))),
            other => Err(Error::Protocol(format!(
                "unexpected packet type {:?} in binlog stream",
                other
            ))),
        }
    }
}

/// Read one logical packet, joining continuation packets
async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R, sequence: &mut u8) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    loop {
        // Packet length (3 bytes) + sequence (1 byte)
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        *sequence = header[3].wrapping_add(1);

        let start = payload.len();
        payload.resize(start + len, 0);
        reader.read_exact(&mut payload[start..]).await?;
        if len < MAX_PACKET_LEN {
            return Ok(payload);
        }
    }
}

async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sequence: &mut u8,
    payload: &[u8],
) -> Result<()> {
    // A payload that fills the last packet exactly is followed by an empty one
    let mut offset = 0;
    loop {
        let chunk = &payload[offset..payload.len().min(offset + MAX_PACKET_LEN)];
        let mut packet = BytesMut::with_capacity(chunk.len() + 4);
        packet.put_uint_le(chunk.len() as u64, 3);
        packet.put_u8(*sequence);
        packet.put_slice(chunk);
        writer.write_all(&packet).await?;
        *sequence = sequence.wrapping_add(1);
        offset += chunk.len();
        if chunk.len() < MAX_PACKET_LEN {
            return Ok(());
        }
    }
}

fn parse_handshake(data: &[u8]) -> Result<Handshake> {
    let truncated = || Error::Protocol("Handshake too short".to_string());

    let protocol = *data.first().ok_or_else(truncated)?;
    if protocol != 10 {
        return Err(Error::Protocol(format!(
            "unsupported handshake protocol {}",
            protocol
        )));
    }

    let version_end = data[1..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(truncated)?
        + 1;
    let server_version = String::from_utf8_lossy(&data[1..version_end]).to_string();
    let mut pos = version_end + 1;

    let id = data.get(pos..pos + 4).ok_or_else(truncated)?;
    let connection_id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
    pos += 4;

    let mut scramble = data.get(pos..pos + 8).ok_or_else(truncated)?.to_vec();
    pos += 9; // auth-plugin-data-part-1 and filler

    let low = data.get(pos..pos + 2).ok_or_else(truncated)?;
    let mut capabilities = u16::from_le_bytes([low[0], low[1]]) as u32;
    pos += 2;

    let mut plugin = String::new();
    if data.len() > pos {
        // charset (1), status (2), capabilities upper (2), auth data length (1), reserved (10)
        let rest = data.get(pos..pos + 16).ok_or_else(truncated)?;
        capabilities |= (u16::from_le_bytes([rest[3], rest[4]]) as u32) << 16;
        let auth_len = rest[5] as usize;
        pos += 16;

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_len.saturating_sub(8).max(13);
            let part2 = data.get(pos..pos + part2_len).ok_or_else(truncated)?;
            // The last byte of part 2 is a terminator
            scramble.extend_from_slice(&part2[..part2_len - 1]);
            pos += part2_len;
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            let rest = data.get(pos..).unwrap_or_default();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            plugin = String::from_utf8_lossy(&rest[..end]).to_string();
        }
    }

    Ok(Handshake {
        server_version,
        connection_id,
        scramble,
        capabilities,
        plugin,
    })
}

fn auth_response(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    if password.is_empty() {
        return Ok(Vec::new());
    }
    match plugin {
        NATIVE_PASSWORD => Ok(scramble_native(password, scramble)),
        CACHING_SHA2_PASSWORD => Ok(scramble_caching_sha2(password, scramble)),
        other => Err(Error::Config(format!(
            "unsupported authentication plugin {}",
            other
        ))),
    }
}

/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
fn scramble_native(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize_reset();

    hasher.update(stage1);
    let stage2 = hasher.finalize_reset();

    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
fn scramble_caching_sha2(password: &str, scramble: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(scramble);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Error packet: code, optional SQL state marker, message
fn server_error(packet: &[u8]) -> String {
    if packet.len() < 3 {
        return "malformed error packet".to_string();
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]);
    let message = if packet.get(3) == Some(&b'#') && packet.len() >= 9 {
        &packet[9..]
    } else {
        &packet[3..]
    };
    format!("MySQL error {}: {}", code, String::from_utf8_lossy(message))
}

/// Strip and check the trailing CRC32 of an event
fn verify_checksum(event: &[u8]) -> Result<&[u8]> {
    if event.len() < 4 {
        return Err(Error::Protocol("event shorter than its checksum".into()));
    }
    let (body, tail) = event.split_at(event.len() - 4);
    let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::Protocol(format!(
            "event checksum mismatch: expected {:08x}, computed {:08x}",
            expected, actual
        )));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_packet(plugin: &str) -> Vec<u8> {
        let mut p = vec![10];
        p.extend_from_slice(b"8.0.36\0");
        p.extend_from_slice(&7u32.to_le_bytes());
        p.extend_from_slice(b"abcdefgh");
        p.push(0);
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        p.extend_from_slice(&(caps as u16).to_le_bytes());
        p.push(45);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        p.push(21);
        p.extend_from_slice(&[0u8; 10]);
        p.extend_from_slice(b"ijklmnopqrst\0");
        p.extend_from_slice(plugin.as_bytes());
        p.push(0);
        p
    }

    #[test]
    fn test_parse_handshake() {
        let handshake = parse_handshake(&handshake_packet(CACHING_SHA2_PASSWORD)).unwrap();
        assert_eq!(handshake.server_version, "8.0.36");
        assert_eq!(handshake.connection_id, 7);
        assert_eq!(handshake.scramble, b"abcdefghijklmnopqrst".to_vec());
        assert_eq!(handshake.plugin, CACHING_SHA2_PASSWORD);

        assert!(parse_handshake(&[9, 0]).is_err());
        assert!(parse_handshake(&handshake_packet(NATIVE_PASSWORD)[..12]).is_err());
    }

    #[test]
    fn test_auth_responses() {
        let scramble = b"abcdefghijklmnopqrst";
        assert!(auth_response(NATIVE_PASSWORD, "", scramble).unwrap().is_empty());
        assert_eq!(auth_response(NATIVE_PASSWORD, "secret", scramble).unwrap().len(), 20);
        assert_eq!(auth_response(CACHING_SHA2_PASSWORD, "secret", scramble).unwrap().len(), 32);
        assert_ne!(
            scramble_native("secret", scramble),
            scramble_native("secret", b"tsrqponmlkjihgfedcba")
        );
        assert!(matches!(
            auth_response("sha256_password", "secret", scramble),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_checksum_verification() {
        let body = b"event body".to_vec();
        let mut event = body.clone();
        event.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        assert_eq!(verify_checksum(&event).unwrap(), body.as_slice());

        let last = event.len() - 1;
        event[last] ^= 0xFF;
        assert!(verify_checksum(&event).is_err());
        assert!(verify_checksum(&[1, 2]).is_err());
    }

    #[test]
    fn test_server_error_message() {
        let mut packet = vec![0xFF];
        packet.extend_from_slice(&1236u16.to_le_bytes());
        packet.extend_from_slice(b"#HY000Could not find first log file");
        assert_eq!(
            server_error(&packet),
            "MySQL error 1236: Could not find first log file"
        );
    }

    #[tokio::test]
    async fn test_packet_framing() {
        let mut buf = Vec::new();
        let mut seq = 3;
        write_packet(&mut buf, &mut seq, b"hello").await.unwrap();
        assert_eq!(seq, 4);
        assert_eq!(&buf[..4], &[5, 0, 0, 3]);

        let mut reader = buf.as_slice();
        let mut seq = 0;
        assert_eq!(read_packet(&mut reader, &mut seq).await.unwrap(), b"hello");
        assert_eq!(seq, 4);
    }

    #[tokio::test]
    async fn test_continuation_packets_are_joined() {
        let big = vec![7u8; MAX_PACKET_LEN + 10];
        let mut buf = Vec::new();
        let mut seq = 0;
        write_packet(&mut buf, &mut seq, &big).await.unwrap();
        assert_eq!(seq, 2);

        let mut reader = buf.as_slice();
        let mut seq = 0;
        let payload = read_packet(&mut reader, &mut seq).await.unwrap();
        assert_eq!(payload.len(), big.len());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_connect_params() {
        let mut config = RdbmsConfiguration::new("jdbc:mysql://db.local:3307/shop?useSSL=false");
        config.username = Some("migrator".into());
        config.password = Some("pw".into());
        let params = ConnectParams::from_config(&config).unwrap();
        assert_eq!(params.address(), "db.local:3307");
        assert_eq!(params.user, "migrator");
        assert_eq!(params.password, "pw");
        assert_eq!(params.database.as_deref(), Some("shop"));

        let params =
            ConnectParams::from_config(&RdbmsConfiguration::new("mysql://root:x@localhost/"))
                .unwrap();
        assert_eq!(params.port, DEFAULT_PORT);
        assert_eq!(params.user, "root");
        assert_eq!(params.password, "x");
        assert!(params.database.is_none());
    }

    #[test]
    fn test_server_id_stable_and_offset() {
        assert_eq!(server_id_for("j1#0"), server_id_for("j1#0"));
        assert_ne!(server_id_for("j1#0"), server_id_for("j1#1"));
        assert!(server_id_for("j1#0") >= 1_000_000);
    }
}
