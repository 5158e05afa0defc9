//! Shared helpers for integration tests: a minimal MySQL client speaking the
//! raw wire protocol and a scripted executor factory.

#![allow(dead_code)]

use async_trait::async_trait;
use fake_sql_server::error::ProxyResult;
use fake_sql_server::executor::{ExecutorFactory, QueryExecutor, ResultSet};
use fake_sql_server::server::MysqlProxyServer;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const UTF8MB4_GENERAL_CI: u8 = 45;

const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;

const MYSQL_TYPE_VAR_STRING: u8 = 0xfd;

/// A result column as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientColumn {
    pub name: String,
    pub coltype: u8,
}

/// Server reply to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Err {
        code: u16,
        message: String,
    },
    Rows {
        columns: Vec<ClientColumn>,
        rows: Vec<Vec<Option<String>>>,
    },
}

impl Response {
    pub fn rows(&self) -> &[Vec<Option<String>>] {
        match self {
            Response::Rows { rows, .. } => rows,
            other => panic!("expected rows, got {other:?}"),
        }
    }

    pub fn columns(&self) -> &[ClientColumn] {
        match self {
            Response::Rows { columns, .. } => columns,
            other => panic!("expected rows, got {other:?}"),
        }
    }
}

fn io_err(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn read_lenenc_int(buf: &[u8], pos: &mut usize) -> io::Result<u64> {
    let first = *buf.get(*pos).ok_or_else(|| io_err("truncated lenenc int"))?;
    *pos += 1;
    let width = match first {
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        n => return Ok(u64::from(n)),
    };
    let bytes = buf
        .get(*pos..*pos + width)
        .ok_or_else(|| io_err("truncated lenenc int"))?;
    *pos += width;
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate() {
        value |= u64::from(*byte) << (8 * i);
    }
    Ok(value)
}

fn read_lenenc_str(buf: &[u8], pos: &mut usize) -> io::Result<String> {
    let len = read_lenenc_int(buf, pos)? as usize;
    let bytes = buf
        .get(*pos..*pos + len)
        .ok_or_else(|| io_err("truncated lenenc string"))?;
    *pos += len;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn take<const N: usize>(buf: &[u8], pos: &mut usize) -> io::Result<[u8; N]> {
    let bytes = buf
        .get(*pos..*pos + N)
        .ok_or_else(|| io_err("truncated binary value"))?;
    *pos += N;
    let mut raw = [0u8; N];
    raw.copy_from_slice(bytes);
    Ok(raw)
}

/// DATE, DATETIME and TIMESTAMP: a length byte followed by as many fields as fit.
fn read_binary_datetime(buf: &[u8], pos: &mut usize) -> io::Result<String> {
    let [len] = take::<1>(buf, pos)?;
    let body = buf
        .get(*pos..*pos + usize::from(len))
        .ok_or_else(|| io_err("truncated temporal value"))?;
    *pos += usize::from(len);
    if body.is_empty() {
        return Ok("0000-00-00".to_string());
    }
    let year = u16::from_le_bytes([body[0], body[1]]);
    let mut text = format!("{:04}-{:02}-{:02}", year, body[2], body[3]);
    if body.len() >= 7 {
        text.push_str(&format!(" {:02}:{:02}:{:02}", body[4], body[5], body[6]));
    }
    if body.len() >= 11 {
        let micros = u32::from_le_bytes([body[7], body[8], body[9], body[10]]);
        text.push_str(&format!(".{:06}", micros));
    }
    Ok(text)
}

fn write_lenenc_str(buf: &mut Vec<u8>, value: &str) {
    // Test values stay short.
    assert!(value.len() < 251);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
}

fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < 9
}

pub struct MysqlTestClient {
    stream: TcpStream,
}

impl MysqlTestClient {
    /// Connect with the given user and an empty password, without selecting a database.
    pub async fn connect(addr: SocketAddr, user: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Self { stream };

        let (_, handshake) = client.read_packet().await?;
        if handshake.first() != Some(&10) {
            return Err(io_err("unexpected handshake protocol version"));
        }

        let mut response = Vec::new();
        response.extend_from_slice(&(CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION).to_le_bytes());
        response.extend_from_slice(&(16u32 * 1024 * 1024).to_le_bytes());
        response.push(UTF8MB4_GENERAL_CI);
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(user.as_bytes());
        response.push(0);
        // zero-length auth response
        response.push(0);
        client.write_packet(1, &response).await?;

        let (seq, mut reply) = client.read_packet().await?;
        if reply.first() == Some(&0xfe) {
            // auth switch: answer with an empty password
            client.write_packet(seq.wrapping_add(1), &[]).await?;
            reply = client.read_packet().await?.1;
        }

        match Self::parse_ok_or_err(&reply) {
            Some(Response::Ok) => Ok(client),
            other => Err(io_err(format!("handshake failed: {other:?}"))),
        }
    }

    async fn read_packet(&mut self) -> io::Result<(u8, Vec<u8>)> {
        timeout(Duration::from_secs(10), async {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let mut payload = vec![0u8; len];
            self.stream.read_exact(&mut payload).await?;
            Ok::<_, io::Error>((header[3], payload))
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read_packet timed out"))?
    }

    async fn write_packet(&mut self, seq: u8, payload: &[u8]) -> io::Result<()> {
        let len = payload.len() as u32;
        let mut packet = Vec::with_capacity(payload.len() + 4);
        packet.extend_from_slice(&len.to_le_bytes()[..3]);
        packet.push(seq);
        packet.extend_from_slice(payload);
        self.stream.write_all(&packet).await?;
        self.stream.flush().await
    }

    async fn command(&mut self, command: u8, body: &[u8]) -> io::Result<()> {
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(command);
        payload.extend_from_slice(body);
        self.write_packet(0, &payload).await
    }

    /// Read an OK or ERR packet; anything else is returned as an empty result.
    async fn read_response_header(&mut self) -> io::Result<Response> {
        let (_, payload) = self.read_packet().await?;
        Self::parse_ok_or_err(&payload)
            .ok_or_else(|| io_err(format!("expected OK or ERR, got {:02x?}", payload.first())))
    }

    fn parse_ok_or_err(payload: &[u8]) -> Option<Response> {
        match payload.first() {
            Some(0x00) => Some(Response::Ok),
            Some(0xff) => {
                let code = u16::from_le_bytes([payload[1], payload[2]]);
                let rest = &payload[3..];
                // skip `#` and the SQL state
                let message = if rest.first() == Some(&b'#') {
                    &rest[6..]
                } else {
                    rest
                };
                Some(Response::Err {
                    code,
                    message: String::from_utf8_lossy(message).into_owned(),
                })
            }
            _ => None,
        }
    }

    async fn read_columns(&mut self, count: u64) -> io::Result<Vec<ClientColumn>> {
        let mut columns = Vec::new();
        for _ in 0..count {
            let (_, payload) = self.read_packet().await?;
            let mut pos = 0;
            for _ in 0..4 {
                // catalog, schema, table, org_table
                read_lenenc_str(&payload, &mut pos)?;
            }
            let name = read_lenenc_str(&payload, &mut pos)?;
            read_lenenc_str(&payload, &mut pos)?;
            // fixed length fields: 0x0c, charset u16, length u32, then the type
            pos += 1 + 2 + 4;
            let coltype = *payload.get(pos).ok_or_else(|| io_err("truncated column"))?;
            columns.push(ClientColumn { name, coltype });
        }
        if count > 0 {
            let (_, eof) = self.read_packet().await?;
            if !is_eof(&eof) {
                return Err(io_err("expected EOF after column definitions"));
            }
        }
        Ok(columns)
    }

    async fn read_result(&mut self, binary: bool) -> io::Result<Response> {
        let (_, payload) = self.read_packet().await?;
        if let Some(response) = Self::parse_ok_or_err(&payload) {
            return Ok(response);
        }

        let mut pos = 0;
        let count = read_lenenc_int(&payload, &mut pos)?;
        let columns = self.read_columns(count).await?;

        let mut rows = Vec::new();
        loop {
            let (_, payload) = self.read_packet().await?;
            if is_eof(&payload) {
                break;
            }
            if payload.first() == Some(&0xff) {
                return Self::parse_ok_or_err(&payload)
                    .ok_or_else(|| io_err("malformed error packet"));
            }
            rows.push(if binary {
                Self::parse_binary_row(&payload, &columns)?
            } else {
                Self::parse_text_row(&payload, columns.len())?
            });
        }
        Ok(Response::Rows { columns, rows })
    }

    fn parse_text_row(payload: &[u8], width: usize) -> io::Result<Vec<Option<String>>> {
        let mut pos = 0;
        let mut row = Vec::with_capacity(width);
        for _ in 0..width {
            if payload.get(pos) == Some(&0xfb) {
                pos += 1;
                row.push(None);
            } else {
                row.push(Some(read_lenenc_str(payload, &mut pos)?));
            }
        }
        Ok(row)
    }

    /// Binary rows, with numeric and temporal values rendered as the text
    /// protocol would send them.
    fn parse_binary_row(payload: &[u8], columns: &[ClientColumn]) -> io::Result<Vec<Option<String>>> {
        let bitmap_len = (columns.len() + 7 + 2) / 8;
        let bitmap = payload
            .get(1..1 + bitmap_len)
            .ok_or_else(|| io_err("truncated null bitmap"))?;
        let mut pos = 1 + bitmap_len;
        let mut row = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            let bit = index + 2;
            if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                row.push(None);
                continue;
            }
            let value = match column.coltype {
                0x01 => i8::from_le_bytes(take(payload, &mut pos)?).to_string(),
                0x02 | 0x0d => i16::from_le_bytes(take(payload, &mut pos)?).to_string(),
                0x03 | 0x09 => i32::from_le_bytes(take(payload, &mut pos)?).to_string(),
                0x08 => i64::from_le_bytes(take(payload, &mut pos)?).to_string(),
                0x04 => f32::from_le_bytes(take(payload, &mut pos)?).to_string(),
                0x05 => f64::from_le_bytes(take(payload, &mut pos)?).to_string(),
                0x07 | 0x0a | 0x0c => read_binary_datetime(payload, &mut pos)?,
                _ => read_lenenc_str(payload, &mut pos)?,
            };
            row.push(Some(value));
        }
        Ok(row)
    }

    /// Run a text query.
    pub async fn query(&mut self, sql: &str) -> io::Result<Response> {
        self.command(COM_QUERY, sql.as_bytes()).await?;
        self.read_result(false).await
    }

    /// Select a database with COM_INIT_DB.
    pub async fn init_db(&mut self, database: &str) -> io::Result<Response> {
        self.command(COM_INIT_DB, database.as_bytes()).await?;
        self.read_response_header().await
    }

    /// Prepare a statement, returning its id and parameter count.
    pub async fn prepare(&mut self, sql: &str) -> io::Result<Result<(u32, u16), Response>> {
        self.command(COM_STMT_PREPARE, sql.as_bytes()).await?;
        let (_, payload) = self.read_packet().await?;
        if payload.first() == Some(&0xff) {
            return Ok(Err(Self::parse_ok_or_err(&payload).unwrap_or(Response::Ok)));
        }
        let id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let columns = u16::from_le_bytes([payload[5], payload[6]]);
        let params = u16::from_le_bytes([payload[7], payload[8]]);
        self.read_columns(u64::from(params)).await?;
        self.read_columns(u64::from(columns)).await?;
        Ok(Ok((id, params)))
    }

    /// Execute a prepared statement with string parameters (`None` is NULL).
    pub async fn execute(&mut self, id: u32, params: &[Option<&str>]) -> io::Result<Response> {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_le_bytes());
        // no cursor, one iteration
        body.push(0);
        body.extend_from_slice(&1u32.to_le_bytes());
        if !params.is_empty() {
            let mut bitmap = vec![0u8; params.len().div_ceil(8)];
            for (index, param) in params.iter().enumerate() {
                if param.is_none() {
                    bitmap[index / 8] |= 1 << (index % 8);
                }
            }
            body.extend_from_slice(&bitmap);
            // new params bound
            body.push(1);
            for _ in params {
                body.push(MYSQL_TYPE_VAR_STRING);
                body.push(0);
            }
            for value in params.iter().flatten() {
                write_lenenc_str(&mut body, value);
            }
        }
        self.command(COM_STMT_EXECUTE, &body).await?;
        self.read_result(true).await
    }
}

type Responder = Arc<dyn Fn(&str) -> ProxyResult<Option<ResultSet>> + Send + Sync>;

/// Executor answering through a closure and recording every query.
pub struct ScriptedExecutor {
    responder: Responder,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        self.log.lock().unwrap().push(query.to_string());
        (self.responder)(query)
    }
}

/// Factory handing every connection a [`ScriptedExecutor`] sharing one log.
#[derive(Clone)]
pub struct ScriptedFactory {
    responder: Responder,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    pub fn new(
        responder: impl Fn(&str) -> ProxyResult<Option<ResultSet>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutorFactory for ScriptedFactory {
    type Executor = ScriptedExecutor;

    async fn create(&self) -> ProxyResult<ScriptedExecutor> {
        Ok(ScriptedExecutor {
            responder: self.responder.clone(),
            log: self.log.clone(),
        })
    }
}

/// Running server bound to an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<ProxyResult<()>>,
}

impl TestServer {
    pub async fn start<F: ExecutorFactory>(factory: F) -> Self {
        let server = MysqlProxyServer::bind("127.0.0.1", 0, factory).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(rx));
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub async fn connect(&self) -> MysqlTestClient {
        MysqlTestClient::connect(self.addr, "stub").await.unwrap()
    }

    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}
