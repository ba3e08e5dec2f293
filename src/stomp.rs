//! STOMP broker client.
//!
//! Speaks STOMP 1.2 over TCP so forwarded payloads reach consumers outside
//! this process (ActiveMQ, Artemis and RabbitMQ all expose a STOMP port).
//! A destination named `orders` maps to `/queue/orders`. Every send carries
//! a `receipt` header and only succeeds once the broker acknowledges it.

use crate::broker::{BrokerClient, BrokerError, Payload, QueueMessage, Subscription};
use crate::config::{BrokerSettings, ConnectionSettings};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Largest frame body accepted from the broker.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Value of `name`. A repeated header keeps its first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Wire form of the frame. A non-empty body always gets a
    /// `content-length` header so it may contain NUL octets.
    pub fn encode(&self) -> Vec<u8> {
        let escape = escapes_headers(&self.command);
        let mut out = Vec::with_capacity(self.command.len() + self.body.len() + 64);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');

        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

/// CONNECT and CONNECTED frames carry their headers unescaped.
fn escapes_headers(command: &str) -> bool {
    command != "CONNECT" && command != "CONNECTED"
}

fn escape_header(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            ':' => escaped.push_str("\\c"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_header(raw: &str) -> io::Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(invalid_data(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "frame truncated")
}

/// Read one line without its EOL. `None` on a clean end of stream.
async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    if line.pop() != Some(b'\n') {
        return Err(truncated());
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| invalid_data("frame header is not UTF-8"))
}

/// Read the next frame, skipping heart-beat EOLs.
/// Returns `None` when the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let command = loop {
        match read_line(reader).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let unescape = escapes_headers(&command);
    let mut frame = Frame::new(command);
    loop {
        let line = read_line(reader).await?.ok_or_else(truncated)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data(format!("malformed header line {line:?}")))?;
        if unescape {
            frame.headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            frame.headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = match frame.get("content-length") {
        Some(value) => Some(
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid_data(format!("invalid content-length {value:?}")))?,
        ),
        None => None,
    };

    match content_length {
        Some(length) => {
            if length > MAX_BODY_BYTES {
                return Err(invalid_data(format!("frame body of {length} bytes is too large")));
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            if reader.read_u8().await? != 0 {
                return Err(invalid_data("frame body not terminated by NUL"));
            }
            frame.body = body;
        }
        None => {
            let mut body = Vec::new();
            reader.read_until(0, &mut body).await?;
            if body.pop() != Some(0) {
                return Err(truncated());
            }
            frame.body = body;
        }
    }
    Ok(Some(frame))
}

fn error_message(frame: &Frame) -> String {
    match frame.get("message") {
        Some(message) => message.to_string(),
        None => {
            let body = String::from_utf8_lossy(&frame.body).trim().to_string();
            if body.is_empty() {
                "ERROR frame".to_string()
            } else {
                body
            }
        }
    }
}

fn io_error(e: io::Error) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

/// Broker path of a configured destination name.
pub fn queue_path(name: &str) -> String {
    format!("/queue/{name}")
}

/// An established STOMP session.
struct StompConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl StompConnection {
    fn from_stream(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    async fn open(settings: &ConnectionSettings) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| {
                BrokerError::Connection(format!("{}:{}: {e}", settings.host, settings.port))
            })?;
        let mut connection = Self::from_stream(stream);

        let mut connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", settings.host.as_str())
            .header("heart-beat", "0,0");
        if let Some(username) = &settings.username {
            connect = connect.header("login", username.as_str());
        }
        if let Some(password) = &settings.password {
            connect = connect.header("passcode", password.as_str());
        }
        connection.write(&connect).await?;

        match connection.read().await? {
            Some(frame) if frame.command == "CONNECTED" => {
                debug!(
                    host = %settings.host,
                    port = settings.port,
                    version = frame.get("version").unwrap_or("1.0"),
                    "STOMP session established"
                );
                Ok(connection)
            }
            Some(frame) if frame.command == "ERROR" => {
                Err(BrokerError::Rejected(error_message(&frame)))
            }
            Some(frame) => Err(BrokerError::Connection(format!(
                "unexpected {} frame while connecting",
                frame.command
            ))),
            None => Err(BrokerError::Connection(
                "connection closed while connecting".to_string(),
            )),
        }
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), BrokerError> {
        self.writer.write_all(&frame.encode()).await.map_err(io_error)
    }

    async fn read(&mut self) -> Result<Option<Frame>, BrokerError> {
        read_frame(&mut self.reader).await.map_err(io_error)
    }

    /// Write `frame` and wait until the broker acknowledges `receipt`.
    /// Frames arriving before the receipt are handed back in order.
    async fn request(&mut self, frame: &Frame, receipt: &str) -> Result<Vec<Frame>, BrokerError> {
        self.write(frame).await?;
        let mut early = Vec::new();
        loop {
            match self.read().await? {
                Some(reply)
                    if reply.command == "RECEIPT" && reply.get("receipt-id") == Some(receipt) =>
                {
                    return Ok(early)
                }
                Some(reply) if reply.command == "ERROR" => {
                    return Err(BrokerError::Rejected(error_message(&reply)))
                }
                Some(reply) => early.push(reply),
                None => {
                    return Err(BrokerError::Connection(
                        "connection closed by broker".to_string(),
                    ))
                }
            }
        }
    }
}

/// [`BrokerClient`] backed by a STOMP broker.
///
/// Sends share one producer session, reopened after any failure.
/// Each subscription runs on its own session.
pub struct StompBroker {
    connection: ConnectionSettings,
    destinations: HashSet<String>,
    capacity: usize,
    connect_timeout: Duration,
    producer: Mutex<Option<StompConnection>>,
    next_receipt: AtomicU64,
}

impl StompBroker {
    /// Open the producer session. Fails when the broker is unreachable or
    /// refuses the credentials.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let connect_timeout = settings.send_timeout();
        let producer = open_within(&settings.connection, connect_timeout).await?;
        info!(
            host = %settings.connection.host,
            port = settings.connection.port,
            destinations = settings.destinations.len(),
            "Connected to STOMP broker"
        );

        Ok(Self {
            connection: settings.connection.clone(),
            destinations: settings.destinations.iter().cloned().collect(),
            capacity: settings.queue_capacity.max(1),
            connect_timeout,
            producer: Mutex::new(Some(producer)),
            next_receipt: AtomicU64::new(0),
        })
    }

    fn check_destination(&self, name: &str) -> Result<(), BrokerError> {
        if self.destinations.contains(name) {
            Ok(())
        } else {
            Err(BrokerError::UnknownDestination(name.to_string()))
        }
    }

    fn receipt(&self, kind: &str) -> String {
        format!("{kind}-{}", self.next_receipt.fetch_add(1, Ordering::Relaxed))
    }

    async fn deliver(&self, frame: Frame, receipt: &str) -> Result<(), BrokerError> {
        let mut producer = self.producer.lock().await;

        // Taken out for the duration of the request: a session interrupted
        // mid-frame is dropped instead of being reused
        let mut connection = match producer.take() {
            Some(connection) => connection,
            None => {
                debug!("Reopening STOMP producer session");
                StompConnection::open(&self.connection).await?
            }
        };
        let early = connection.request(&frame, receipt).await?;
        for frame in early {
            debug!(command = %frame.command, "Ignoring frame on producer session");
        }

        *producer = Some(connection);
        Ok(())
    }
}

async fn open_within(
    settings: &ConnectionSettings,
    timeout: Duration,
) -> Result<StompConnection, BrokerError> {
    match tokio::time::timeout(timeout, StompConnection::open(settings)).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Connection(format!(
            "{}:{}: no CONNECTED frame within {}ms",
            settings.host,
            settings.port,
            timeout.as_millis()
        ))),
    }
}

#[async_trait]
impl BrokerClient for StompBroker {
    async fn send(&self, message: QueueMessage, timeout: Duration) -> Result<(), BrokerError> {
        let destination = message.destination;
        self.check_destination(&destination)?;

        let body = serde_json::to_vec(&Value::Object(message.payload))
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;
        let receipt = self.receipt("send");
        let frame = Frame::new("SEND")
            .header("destination", queue_path(&destination))
            .header("content-type", "application/json")
            .header("receipt", receipt.as_str())
            .with_body(body);

        match tokio::time::timeout(timeout, self.deliver(frame, &receipt)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                destination,
                timeout,
            }),
        }
    }

    async fn subscribe(&self, source: &str) -> Result<Subscription, BrokerError> {
        self.check_destination(source)?;

        let mut connection = open_within(&self.connection, self.connect_timeout).await?;
        let receipt = self.receipt("subscribe");
        let frame = Frame::new("SUBSCRIBE")
            .header("id", "0")
            .header("destination", queue_path(source))
            .header("ack", "auto")
            .header("receipt", receipt.as_str());
        let early = connection.request(&frame, &receipt).await?;

        let (sender, receiver) = mpsc::channel(self.capacity);
        tokio::spawn(pump(connection, source.to_string(), early, sender));
        debug!(source = %source, "Subscribed");
        Ok(Subscription::new(source, receiver))
    }
}

/// Move MESSAGE frames from the session into the subscription channel
/// until either side goes away.
async fn pump(
    mut connection: StompConnection,
    source: String,
    early: Vec<Frame>,
    sender: mpsc::Sender<QueueMessage>,
) {
    for frame in early {
        if !forward_frame(&source, frame, &sender).await {
            return;
        }
    }

    loop {
        let next = tokio::select! {
            _ = sender.closed() => break,
            next = connection.read() => next,
        };
        match next {
            Ok(Some(frame)) => {
                if !forward_frame(&source, frame, &sender).await {
                    break;
                }
            }
            Ok(None) => {
                info!(source = %source, "Broker closed the subscription");
                break;
            }
            Err(e) => {
                warn!(source = %source, error = %e, "Subscription failed");
                break;
            }
        }
    }

    let _ = connection.write(&Frame::new("DISCONNECT")).await;
}

/// Returns `false` once the subscription should end.
async fn forward_frame(source: &str, frame: Frame, sender: &mpsc::Sender<QueueMessage>) -> bool {
    match frame.command.as_str() {
        "MESSAGE" => match decode_payload(&frame.body) {
            Ok(payload) => sender
                .send(QueueMessage {
                    destination: source.to_string(),
                    payload,
                })
                .await
                .is_ok(),
            Err(reason) => {
                warn!(source = %source, reason = %reason, "Dropping undecodable message");
                true
            }
        },
        "ERROR" => {
            warn!(source = %source, error = %error_message(&frame), "Broker reported an error");
            false
        }
        other => {
            debug!(source = %source, command = %other, "Ignoring frame");
            true
        }
    }
}

fn decode_payload(body: &[u8]) -> Result<Payload, String> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}
