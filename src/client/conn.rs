//! The network endpoint: dials TCP, optionally upgrades to TLS, frames the
//! byte stream into lines, and hands out a cloneable single-writer sender.

use std::sync::Arc;

use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Framed};

use crate::config::Config;
use crate::error::Result;
use crate::proto::IrcCodec;

/// Object-safe alias for the two stream flavors (plain TCP and TLS), so the
/// rest of the client is generic over neither.
pub(crate) trait IrcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IrcStream for T {}

type FramedStream = Framed<Box<dyn IrcStream>, IrcCodec>;

/// An established connection, split into its read half and the shared sender.
pub struct Connection {
    pub(crate) reader: SplitStream<FramedStream>,
    pub(crate) sender: Sender,
}

impl Connection {
    /// Dials the configured server, upgrading to TLS when enabled.
    pub async fn dial(config: &Config) -> Result<Connection> {
        let (host, port) = config.server_host_port();
        log::info!("connecting to {}:{} (tls: {})", host, port, config.use_tls);
        let tcp = TcpStream::connect((host.as_str(), port)).await?;

        let stream: Box<dyn IrcStream> = if config.use_tls {
            let mut builder = native_tls::TlsConnector::builder();
            if config.tls_insecure_skip_verify {
                log::warn!("TLS certificate verification is disabled");
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
            let connector: tokio_native_tls::TlsConnector = builder.build()?.into();
            Box::new(connector.connect(&host, tcp).await?)
        } else {
            Box::new(tcp)
        };

        Ok(Connection::from_stream(stream))
    }

    /// Wraps an already-established stream. Tests use this with an in-memory
    /// duplex pipe.
    pub(crate) fn from_stream(stream: Box<dyn IrcStream>) -> Connection {
        let (sink, reader) = IrcCodec::new().framed(stream).split();
        Connection {
            reader,
            sender: Sender {
                writer: Arc::new(Mutex::new(sink)),
            },
        }
    }
}

/// The write half of the connection. Every line goes out atomically (line
/// plus CRLF) under the internal mutex; clones share that mutex.
#[derive(Clone)]
pub struct Sender {
    writer: Arc<Mutex<SplitSink<FramedStream, String>>>,
}

/// Longest line the sender will put on the wire, leaving room for CRLF
/// inside the 512-byte message limit.
const MAX_LINE_BYTES: usize = 510;

impl Sender {
    /// Writes one line, appending CRLF, and flushes. Lines that would
    /// exceed the 512-byte wire limit are refused, never emitted.
    pub async fn send_line<S: Into<String>>(&self, line: S) -> Result<()> {
        let line = line.into();
        if line.len() > MAX_LINE_BYTES {
            log::warn!(
                "refusing outbound line of {} bytes (limit {} plus CRLF)",
                line.len(),
                MAX_LINE_BYTES
            );
            return Err(crate::error::Error::BadInput(format!(
                "line exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }
        log::trace!(">> {}", line);
        let mut writer = self.writer.lock().await;
        writer.send(line).await
    }

    /// Closes the write half, which drops the socket.
    pub async fn shutdown(&self) {
        let _ = self.writer.lock().await.close().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    /// The far (server-side) end of an in-memory connection.
    pub(crate) struct FakeServer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        /// Sends one line to the client, CRLF-terminated.
        pub(crate) async fn push_line(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
        }

        /// Reads the next line the client wrote, terminator stripped.
        pub(crate) async fn next_line(&mut self) -> Option<String> {
            let mut line = String::new();
            match self.reader.read_line(&mut line).await {
                Ok(0) | Err(_) => None,
                Ok(_) => {
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    Some(line)
                }
            }
        }
    }

    /// Builds a client connection wired to an in-memory fake server.
    pub(crate) fn connection_pair() -> (Connection, FakeServer) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let conn = Connection::from_stream(Box::new(near));
        let (read_half, writer) = tokio::io::split(far);
        (
            conn,
            FakeServer {
                reader: BufReader::new(read_half),
                writer,
            },
        )
    }
}

#[cfg(test)]
mod test {
    use super::test_support::connection_pair;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn lines_round_trip_through_the_pipe() {
        let (mut conn, mut server) = connection_pair();

        conn.sender.send_line("NICK shipbot").await.unwrap();
        assert_eq!(server.next_line().await.as_deref(), Some("NICK shipbot"));

        server.push_line(":irc.x 001 shipbot :welcome").await;
        let line = conn.reader.next().await.unwrap().unwrap();
        assert_eq!(line, ":irc.x 001 shipbot :welcome");
    }

    #[tokio::test]
    async fn over_length_lines_are_refused_not_emitted() {
        let (conn, mut server) = connection_pair();
        let long = format!("PRIVMSG #x :{}", "y".repeat(600));
        assert!(matches!(
            conn.sender.send_line(long).await,
            Err(crate::error::Error::BadInput(_))
        ));

        // A line at the cap still goes out, and nothing preceded it.
        let max = "z".repeat(super::MAX_LINE_BYTES);
        conn.sender.send_line(max.clone()).await.unwrap();
        assert_eq!(server.next_line().await.as_deref(), Some(max.as_str()));
    }

    #[tokio::test]
    async fn concurrent_sends_stay_line_atomic() {
        let (conn, mut server) = connection_pair();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let sender = conn.sender.clone();
            tasks.push(tokio::spawn(async move {
                sender.send_line(format!("PRIVMSG #x :msg {}", i)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        for _ in 0..16 {
            let line = server.next_line().await.unwrap();
            assert!(line.starts_with("PRIVMSG #x :msg "));
        }
    }
}
