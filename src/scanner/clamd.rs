//! clamd client.
//!
//! # Responsibilities
//! - Reach clamd over TCP (`tcp://host:port`) or a Unix socket (`unix:/path`)
//! - Stream content with the null-delimited `zINSTREAM` command
//! - Map the reply line to a [`ScanOutcome`]
//! - Drain the reply channel before the connection is dropped
//!
//! # Wire Format
//! ```text
//! client: "zINSTREAM\0"
//! client: <u32 big-endian length><bytes>   (repeated)
//! client: <u32 0>                          (terminator)
//! clamd:  "stream: OK\0" | "stream: <signature> FOUND\0" | "<reason> ERROR\0"
//! ```

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use url::Url;

use crate::scanner::{ByteSource, ScanEngine, ScanError, ScanOutcome};

/// Port clamd listens on when a `tcp://` address omits it.
pub const DEFAULT_CLAMD_PORT: u16 = 3310;

/// Largest data segment sent in one length-prefixed frame.
const MAX_SEGMENT: usize = 64 * 1024;

/// Replies to `z`-prefixed commands are terminated by a NUL byte.
const REPLY_DELIMITER: u8 = b'\0';

/// Where the engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl EngineAddress {
    pub fn parse(address: &str) -> Result<Self, ScanError> {
        let invalid = |reason: String| ScanError::InvalidAddress {
            address: address.to_string(),
            reason,
        };

        let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid("missing host".to_string()))?;
                let port = url.port().unwrap_or(DEFAULT_CLAMD_PORT);
                Ok(EngineAddress::Tcp(format!("{host}:{port}")))
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(invalid("missing socket path".to_string()));
                }
                Ok(EngineAddress::Unix(PathBuf::from(path)))
            }
            other => Err(invalid(format!("unsupported scheme '{other}'"))),
        }
    }
}

trait EngineStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> EngineStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type Connection = Box<dyn EngineStream>;

/// Client for a clamd daemon. Opens one connection per call.
#[derive(Debug, Clone)]
pub struct ClamdClient {
    address: String,
    target: EngineAddress,
    timeout: Option<Duration>,
}

impl ClamdClient {
    pub fn new(address: &str) -> Result<Self, ScanError> {
        let target = EngineAddress::parse(address)?;
        tracing::debug!(address = %address, "Initialised clamd client");
        Ok(Self {
            address: address.to_string(),
            target,
            timeout: None,
        })
    }

    /// Bound every engine call. Expiry drops the connection.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn unavailable(&self, source: io::Error) -> ScanError {
        ScanError::EngineUnavailable {
            address: self.address.clone(),
            source,
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ScanError>
    where
        F: Future<Output = Result<T, ScanError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                self.unavailable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {}ms", limit.as_millis()),
                ))
            })?,
            None => call.await,
        }
    }

    async fn connect(&self) -> Result<Connection, ScanError> {
        let conn: Connection = match &self.target {
            EngineAddress::Tcp(addr) => Box::new(
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| self.unavailable(e))?,
            ),
            EngineAddress::Unix(path) => Box::new(
                UnixStream::connect(path)
                    .await
                    .map_err(|e| self.unavailable(e))?,
            ),
        };
        Ok(conn)
    }

    async fn command(&self, name: &str) -> Result<String, ScanError> {
        let mut conn = self.connect().await?;
        conn.write_all(format!("z{name}\0").as_bytes())
            .await
            .map_err(|e| self.unavailable(e))?;
        self.read_reply(&mut conn).await
    }

    async fn instream(&self, mut source: ByteSource<'_>) -> Result<ScanOutcome, ScanError> {
        tracing::debug!(address = %self.address, "Sending to clamd");
        let mut conn = self.connect().await?;
        conn.write_all(b"zINSTREAM\0")
            .await
            .map_err(|e| self.unavailable(e))?;

        let mut sent = 0u64;
        while let Some(chunk) = source.next().await {
            let chunk = chunk.map_err(ScanError::Source)?;
            for segment in chunk.chunks(MAX_SEGMENT) {
                if let Err(e) = write_segment(&mut conn, segment).await {
                    return self.early_reply(&mut conn, e).await;
                }
                sent += segment.len() as u64;
            }
        }

        if let Err(e) = conn.write_all(&0u32.to_be_bytes()).await {
            return self.early_reply(&mut conn, e).await;
        }
        conn.flush().await.map_err(|e| self.unavailable(e))?;

        let reply = self.read_reply(&mut conn).await?;
        let outcome = parse_reply(&reply);
        tracing::debug!(bytes = sent, reply = %reply, result = %outcome, "Result of scan");
        Ok(outcome)
    }

    /// clamd hangs up mid-stream when a limit is hit, leaving its reason on
    /// the socket.
    async fn early_reply(
        &self,
        conn: &mut Connection,
        error: io::Error,
    ) -> Result<ScanOutcome, ScanError> {
        match self.read_reply(conn).await {
            Ok(reply) => Ok(parse_reply(&reply)),
            Err(_) => Err(self.unavailable(error)),
        }
    }

    /// Read the first reply line, then drain whatever follows until the
    /// engine closes its side.
    async fn read_reply(&self, conn: &mut Connection) -> Result<String, ScanError> {
        let mut reader = BufReader::new(conn);
        let mut line = Vec::new();
        reader
            .read_until(REPLY_DELIMITER, &mut line)
            .await
            .map_err(|e| self.unavailable(e))?;

        match tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
            Ok(0) => {}
            Ok(extra) => tracing::debug!(bytes = extra, "Discarded trailing clamd output"),
            Err(e) => tracing::debug!(error = %e, "clamd connection ended while draining"),
        }

        let reply = String::from_utf8_lossy(&line)
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string();
        if reply.is_empty() {
            return Err(ScanError::EngineProtocolError(
                "clamd closed the connection without a reply".to_string(),
            ));
        }
        Ok(reply)
    }
}

#[async_trait]
impl ScanEngine for ClamdClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn scan_stream(&self, source: ByteSource<'_>) -> Result<ScanOutcome, ScanError> {
        self.bounded(self.instream(source)).await
    }

    async fn probe_liveness(&self) -> Result<(), ScanError> {
        let reply = self.bounded(self.command("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ScanError::EngineProtocolError(format!(
                "unexpected PING reply '{reply}'"
            )))
        }
    }

    async fn report_version(&self) -> Result<String, ScanError> {
        self.bounded(self.command("VERSION")).await
    }
}

async fn write_segment<W>(conn: &mut W, segment: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    conn.write_all(&(segment.len() as u32).to_be_bytes()).await?;
    conn.write_all(segment).await
}

/// Interpret a clamd reply line.
pub fn parse_reply(reply: &str) -> ScanOutcome {
    let verdict = reply
        .strip_prefix("stream:")
        .map(str::trim_start)
        .unwrap_or(reply);

    if verdict == "OK" {
        ScanOutcome::clean("OK")
    } else if let Some(signature) = verdict.strip_suffix(" FOUND") {
        ScanOutcome::infected(signature.trim())
    } else {
        ScanOutcome::engine_error(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanStatus;
    use bytes::Bytes;
    use futures_util::stream;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, UnixListener};
    use tokio::sync::oneshot;

    struct Received {
        command: String,
        segments: Vec<Vec<u8>>,
    }

    impl Received {
        fn payload(&self) -> Vec<u8> {
            self.segments.concat()
        }
    }

    fn source(data: &'static [u8]) -> ByteSource<'static> {
        stream::iter(
            data.chunks(3)
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn serve_one<S>(stream: S, reply: &str) -> Received
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut command = Vec::new();
        reader.read_until(b'\0', &mut command).await.unwrap();
        let command = String::from_utf8_lossy(&command)
            .trim_end_matches('\0')
            .to_string();

        let mut segments = Vec::new();
        if command == "zINSTREAM" {
            loop {
                let len = reader.read_u32().await.unwrap() as usize;
                if len == 0 {
                    break;
                }
                let mut segment = vec![0u8; len];
                reader.read_exact(&mut segment).await.unwrap();
                segments.push(segment);
            }
        }

        let mut stream = reader.into_inner();
        stream.write_all(reply.as_bytes()).await.unwrap();
        stream.write_all(b"\0").await.unwrap();
        stream.shutdown().await.unwrap();
        Received { command, segments }
    }

    async fn mock_clamd(reply: &'static str) -> (String, oneshot::Receiver<Received>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = tx.send(serve_one(socket, reply).await);
        });
        (format!("tcp://{addr}"), rx)
    }

    #[test]
    fn parses_addresses() {
        assert_eq!(
            EngineAddress::parse("tcp://localhost:3310").unwrap(),
            EngineAddress::Tcp("localhost:3310".into())
        );
        assert_eq!(
            EngineAddress::parse("tcp://av.example.com").unwrap(),
            EngineAddress::Tcp("av.example.com:3310".into())
        );
        assert_eq!(
            EngineAddress::parse("unix:/tmp/clamd.sock").unwrap(),
            EngineAddress::Unix("/tmp/clamd.sock".into())
        );
        assert_eq!(
            EngineAddress::parse("unix:///var/run/clamd.sock").unwrap(),
            EngineAddress::Unix("/var/run/clamd.sock".into())
        );
        assert!(EngineAddress::parse("http://localhost:3310").is_err());
        assert!(EngineAddress::parse("localhost").is_err());
    }

    #[test]
    fn parses_replies() {
        assert_eq!(parse_reply("stream: OK"), ScanOutcome::clean("OK"));
        assert_eq!(
            parse_reply("stream: Win.Test.EICAR_HDB-1 FOUND"),
            ScanOutcome::infected("Win.Test.EICAR_HDB-1")
        );
        assert_eq!(
            parse_reply("INSTREAM size limit exceeded. ERROR").status,
            ScanStatus::EngineError
        );
        assert_eq!(parse_reply("gibberish").status, ScanStatus::EngineError);
    }

    #[tokio::test]
    async fn clean_stream_is_framed_and_terminated() {
        let (address, received) = mock_clamd("stream: OK").await;
        let client = ClamdClient::new(&address).unwrap();

        let outcome = client.scan_stream(source(b"foo bar mcgrew")).await.unwrap();
        assert_eq!(outcome.status, ScanStatus::Clean);

        let received = received.await.unwrap();
        assert_eq!(received.command, "zINSTREAM");
        assert_eq!(received.payload(), b"foo bar mcgrew");
    }

    #[tokio::test]
    async fn infected_stream_reports_signature() {
        let (address, _received) = mock_clamd("stream: Eicar-Test-Signature FOUND").await;
        let client = ClamdClient::new(&address).unwrap();

        let outcome = client.scan_stream(source(b"X5O!P%@AP")).await.unwrap();
        assert!(outcome.is_infected());
        assert_eq!(outcome.description, "Eicar-Test-Signature");
    }

    #[tokio::test]
    async fn large_chunks_are_split_into_segments() {
        let (address, received) = mock_clamd("stream: OK").await;
        let client = ClamdClient::new(&address).unwrap();
        let data = vec![7u8; MAX_SEGMENT * 2 + 10];
        let body = stream::once(async move { Ok(Bytes::from(data)) }).boxed();

        client.scan_stream(body).await.unwrap();

        let received = received.await.unwrap();
        assert_eq!(received.segments.len(), 3);
        assert!(received.segments.iter().all(|s| s.len() <= MAX_SEGMENT));
        assert_eq!(received.payload().len(), MAX_SEGMENT * 2 + 10);
    }

    #[tokio::test]
    async fn scans_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clamd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve_one(socket, "stream: Eicar-Test-Signature FOUND").await;
        });

        let client = ClamdClient::new(&format!("unix:{}", path.display())).unwrap();
        let outcome = client.scan_stream(source(b"payload")).await.unwrap();
        assert!(outcome.is_infected());
    }

    #[tokio::test]
    async fn ping_and_version() {
        let (address, received) = mock_clamd("PONG").await;
        let client = ClamdClient::new(&address).unwrap();
        client.probe_liveness().await.unwrap();
        assert_eq!(received.await.unwrap().command, "zPING");

        let (address, received) = mock_clamd("ClamAV 1.2.1/27100/Mon Nov 13 09:27:01 2023").await;
        let client = ClamdClient::new(&address).unwrap();
        let version = client.report_version().await.unwrap();
        assert!(version.starts_with("ClamAV 1.2.1"));
        assert_eq!(received.await.unwrap().command, "zVERSION");
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ClamdClient::new(&format!("tcp://{addr}")).unwrap();
        let err = client.scan_stream(source(b"data")).await.unwrap_err();
        assert!(matches!(err, ScanError::EngineUnavailable { .. }));
    }

    #[tokio::test]
    async fn silent_close_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // "zINSTREAM\0", one 3-byte segment, terminator; then hang up unanswered.
            let expected = 10 + 4 + 3 + 4;
            let mut seen = 0;
            let mut buf = [0u8; 1024];
            while seen < expected {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen += n,
                }
            }
        });

        let client = ClamdClient::new(&format!("tcp://{addr}")).unwrap();
        let err = client.scan_stream(source(b"abc")).await.unwrap_err();
        assert!(matches!(err, ScanError::EngineProtocolError(_)));
    }

    #[tokio::test]
    async fn timed_out_scan_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            // Never answer; EOF means the client hung up.
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = closed_tx.send(());
        });

        let client = ClamdClient::new(&format!("tcp://{addr}"))
            .unwrap()
            .with_timeout(Some(Duration::from_millis(100)));
        let err = client.scan_stream(source(b"data")).await.unwrap_err();
        assert!(matches!(err, ScanError::EngineUnavailable { .. }));

        tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .expect("engine connection left open")
            .unwrap();
    }
}
