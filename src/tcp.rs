use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::dnscurve::DnsPacket;
use crate::engine::Engine;
use crate::error::{Leg, RelayError};

/// TCP 事务状态 / States of a TCP transaction. "Init" states move the 2-byte
/// length prefix, "More" states move the message itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    ExtReadingInit,
    ExtReadingMore,
    IntWritingInit,
    IntWritingMore,
    IntReadingInit,
    IntReadingMore,
    ExtWritingInit,
    ExtWritingMore,
}

impl TcpState {
    pub fn leg(self) -> Leg {
        match self {
            Self::ExtReadingInit | Self::ExtReadingMore | Self::ExtWritingInit | Self::ExtWritingMore => {
                Leg::External
            }
            _ => Leg::Internal,
        }
    }
}

enum Step {
    Continue,
    Finished,
}

/// One client connection. Queries are handled one at a time; after each
/// reply the connection goes back to waiting for the client.
pub struct TcpTransaction<S> {
    engine: Engine,
    peer: SocketAddr,
    client: S,
    upstream: Option<TcpStream>,
    buffer: Vec<u8>,
    prefix: [u8; 2],
    /// Bytes of the current prefix or message already transferred.
    at: usize,
    packet: Option<DnsPacket>,
    state: TcpState,
}

/// Reads once into `buf[*at..]`. EOF is reported as `Ok(false)`.
async fn read_some<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
    at: &mut usize,
) -> Result<bool, RelayError> {
    let n = stream.read(&mut buf[*at..]).await?;
    if n == 0 {
        return Ok(false);
    }
    *at += n;
    Ok(true)
}

/// Writes once from `buf[*at..]`.
async fn write_some<W: AsyncWrite + Unpin>(
    stream: &mut W,
    buf: &[u8],
    at: &mut usize,
    leg: Leg,
) -> Result<(), RelayError> {
    let n = stream.write(&buf[*at..]).await?;
    if n == 0 {
        return Err(RelayError::Closed(leg));
    }
    *at += n;
    Ok(())
}

impl<S: AsyncRead + AsyncWrite + Unpin> TcpTransaction<S> {
    pub fn new(engine: Engine, client: S, peer: SocketAddr) -> Self {
        Self {
            engine,
            peer,
            client,
            upstream: None,
            buffer: Vec::new(),
            prefix: [0u8; 2],
            at: 0,
            packet: None,
            state: TcpState::ExtReadingInit,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Runs until the client closes the connection or something fails. Every
    /// step that moves bytes rearms the timeout of the leg it is on.
    pub async fn run(mut self) -> Result<(), RelayError> {
        loop {
            let leg = self.state.leg();
            let wait = match leg {
                Leg::External => self.engine.config().tcp_timeout,
                Leg::Internal => self.engine.config().internal_timeout,
            };
            match time::timeout(wait, self.step()).await {
                Ok(Ok(Step::Continue)) => {}
                Ok(Ok(Step::Finished)) => {
                    debug!(target = "tcp", client = %self.peer, "client closed connection");
                    return Ok(());
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    debug!(target = "tcp", client = %self.peer, state = ?self.state, "timeout");
                    return Err(RelayError::Timeout(leg));
                }
            }
        }
    }

    /// 帧长度合法性：非零且不超过缓冲区
    fn expect_message(&mut self, next: TcpState) -> Result<(), RelayError> {
        let size = u16::from_be_bytes(self.prefix) as usize;
        if size == 0 {
            return Err(RelayError::ProtocolViolation("zero-length message"));
        }
        if size > self.engine.config().tcp_buffer_size {
            return Err(RelayError::ProtocolViolation("message exceeds buffer"));
        }
        debug!(target = "tcp", size, leg = %next.leg(), "about to receive message");
        self.buffer = vec![0u8; size];
        self.at = 0;
        self.state = next;
        Ok(())
    }

    fn begin_write(&mut self, next: TcpState) {
        self.prefix = (self.buffer.len() as u16).to_be_bytes();
        self.at = 0;
        self.state = next;
    }

    async fn step(&mut self) -> Result<Step, RelayError> {
        match self.state {
            TcpState::ExtReadingInit => {
                if !read_some(&mut self.client, &mut self.prefix, &mut self.at).await? {
                    if self.at == 0 {
                        return Ok(Step::Finished);
                    }
                    return Err(RelayError::Closed(Leg::External));
                }
                if self.at == self.prefix.len() {
                    self.expect_message(TcpState::ExtReadingMore)?;
                }
            }
            TcpState::ExtReadingMore => {
                if !read_some(&mut self.client, &mut self.buffer, &mut self.at).await? {
                    return Err(RelayError::Closed(Leg::External));
                }
                if self.at == self.buffer.len() {
                    let packet = self.engine.curve().analyze_query(&mut self.buffer)?;
                    debug!(
                        target = "tcp",
                        client = %self.peer,
                        format = ?packet.format,
                        txid = packet.external_txid(),
                        "query analysed"
                    );
                    self.packet = Some(packet);
                    self.begin_write(TcpState::IntWritingInit);
                }
            }
            TcpState::IntWritingInit => {
                if self.upstream.is_none() {
                    self.upstream = Some(self.engine.connect_upstream_tcp().await?);
                    let packet = self
                        .packet
                        .as_mut()
                        .ok_or(RelayError::Malformed("no query to forward"))?;
                    let txid = packet.assign_upstream_txid(&mut self.buffer);
                    debug!(
                        target = "tcp",
                        external_id = packet.external_txid(),
                        internal_id = txid,
                        "forwarding query to upstream"
                    );
                    // the id change does not alter the length prefix
                    return Ok(Step::Continue);
                }
                let upstream = self
                    .upstream
                    .as_mut()
                    .ok_or(RelayError::Closed(Leg::Internal))?;
                write_some(upstream, &self.prefix, &mut self.at, Leg::Internal).await?;
                if self.at == self.prefix.len() {
                    self.at = 0;
                    self.state = TcpState::IntWritingMore;
                }
            }
            TcpState::IntWritingMore => {
                let upstream = self
                    .upstream
                    .as_mut()
                    .ok_or(RelayError::Closed(Leg::Internal))?;
                write_some(upstream, &self.buffer, &mut self.at, Leg::Internal).await?;
                if self.at == self.buffer.len() {
                    upstream.flush().await?;
                    self.at = 0;
                    self.state = TcpState::IntReadingInit;
                }
            }
            TcpState::IntReadingInit => {
                let upstream = self
                    .upstream
                    .as_mut()
                    .ok_or(RelayError::Closed(Leg::Internal))?;
                if !read_some(upstream, &mut self.prefix, &mut self.at).await? {
                    return Err(RelayError::Closed(Leg::Internal));
                }
                if self.at == self.prefix.len() {
                    self.expect_message(TcpState::IntReadingMore)?;
                }
            }
            TcpState::IntReadingMore => {
                let upstream = self
                    .upstream
                    .as_mut()
                    .ok_or(RelayError::Closed(Leg::Internal))?;
                if !read_some(upstream, &mut self.buffer, &mut self.at).await? {
                    return Err(RelayError::Closed(Leg::Internal));
                }
                if self.at == self.buffer.len() {
                    // done with the upstream connection
                    self.upstream = None;
                    let mut packet = self
                        .packet
                        .take()
                        .ok_or(RelayError::Malformed("reply without a query"))?;
                    let curve = self.engine.curve();
                    curve.analyze_reply(&packet, &mut self.buffer)?;
                    let max_len = self.engine.config().tcp_buffer_size.min(u16::MAX as usize);
                    curve.build_reply(&mut packet, &mut self.buffer, max_len)?;
                    debug!(
                        target = "tcp",
                        client = %self.peer,
                        format = ?packet.format,
                        len = self.buffer.len(),
                        "sending reply"
                    );
                    self.begin_write(TcpState::ExtWritingInit);
                }
            }
            TcpState::ExtWritingInit => {
                write_some(&mut self.client, &self.prefix, &mut self.at, Leg::External).await?;
                if self.at == self.prefix.len() {
                    self.at = 0;
                    self.state = TcpState::ExtWritingMore;
                }
            }
            TcpState::ExtWritingMore => {
                write_some(&mut self.client, &self.buffer, &mut self.at, Leg::External).await?;
                if self.at == self.buffer.len() {
                    self.client.flush().await?;
                    self.at = 0;
                    self.buffer = Vec::new();
                    self.state = TcpState::ExtReadingInit;
                }
            }
        }
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnscurve::tests::{plain_query, streamlined_query};
    use crate::dnscurve::REPLY_MAGIC;
    use crate::crypto::{self, SecretKey};
    use crate::engine::tests::engine_for;
    use crate::proto_utils;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::net::TcpListener;

    /// Upstream answering each framed query with a fixed-size body so replies
    /// are large enough to need many small writes.
    async fn padded_upstream(padding: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut len = [0u8; 2];
                    stream.read_exact(&mut len).await?;
                    let mut msg = vec![0u8; u16::from_be_bytes(len) as usize];
                    stream.read_exact(&mut msg).await?;
                    msg[2] |= 0x80;
                    msg.extend((0..padding).map(|i| i as u8));
                    stream.write_all(&(msg.len() as u16).to_be_bytes()).await?;
                    stream.write_all(&msg).await?;
                    Ok::<_, std::io::Error>(())
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn partial_writes_deliver_identical_reply() {
        let upstream = padded_upstream(3000).await;
        let engine = engine_for(upstream, |_| {});
        let query = plain_query(0x5151, "www.example.com.");

        let (one, tiny) = tokio::join!(
            run_exchange(engine.clone(), 64 * 1024, &query),
            run_exchange(engine.clone(), 3, &query),
        );
        assert_eq!(one.len(), query.len() + 3000);
        assert_eq!(proto_utils::read_txid(&one), Some(0x5151));
        assert_eq!(one, tiny);
    }

    /// Client side of one exchange over an in-memory pipe of `pipe_size` bytes.
    async fn run_exchange(engine: Engine, pipe_size: usize, query: &[u8]) -> Vec<u8> {
        let (client, relay_side) = duplex(pipe_size);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(TcpTransaction::new(engine, relay_side, peer).run());

        let (mut rd, mut wr) = tokio::io::split(client);
        let mut framed = (query.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(query);

        let write = async move {
            wr.write_all(&framed).await.unwrap();
            wr
        };
        let read = async {
            let mut len = [0u8; 2];
            rd.read_exact(&mut len).await.unwrap();
            let mut reply = vec![0u8; u16::from_be_bytes(len) as usize];
            rd.read_exact(&mut reply).await.unwrap();
            reply
        };
        let (wr, reply) = futures::join!(write, read);
        drop(rd.unsplit(wr));
        task.await.unwrap().unwrap();
        reply
    }

    #[tokio::test]
    async fn streamlined_over_tcp() {
        let upstream = padded_upstream(0).await;
        let engine = engine_for(upstream, |_| {});
        let server_pk = engine.curve().public_key();
        let client_key = SecretKey::generate();
        let nonce = [0x44u8; 12];
        let inner = plain_query(0x0909, "www.example.com.");
        let query = streamlined_query(&client_key, &server_pk, &nonce, &inner);

        let reply = run_exchange(engine, 16, &query).await;
        assert_eq!(&reply[..8], REPLY_MAGIC);
        let mut full = [0u8; 24];
        full.copy_from_slice(&reply[8..32]);
        let shared = crypto::derive_shared_secret(&server_pk, &client_key);
        let opened = crypto::open(&shared, &full, &reply[32..]).unwrap();
        assert_eq!(proto_utils::read_txid(&opened), Some(0x0909));
    }

    #[tokio::test]
    async fn oversized_prefix_is_a_protocol_violation() {
        let engine = engine_for("127.0.0.1:9".parse().unwrap(), |cfg| cfg.tcp_buffer_size = 1024);
        let (mut client, relay_side) = duplex(64);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(TcpTransaction::new(engine, relay_side, peer).run());

        client.write_all(&2048u16.to_be_bytes()).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(RelayError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn zero_length_prefix_is_a_protocol_violation() {
        let engine = engine_for("127.0.0.1:9".parse().unwrap(), |_| {});
        let (mut client, relay_side) = duplex(64);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(TcpTransaction::new(engine, relay_side, peer).run());

        client.write_all(&[0, 0]).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(RelayError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn client_closing_mid_prefix_is_reported() {
        let engine = engine_for("127.0.0.1:9".parse().unwrap(), |_| {});
        let (mut client, relay_side) = duplex(64);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(TcpTransaction::new(engine, relay_side, peer).run());

        client.write_all(&[0]).await.unwrap();
        drop(client);
        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::Closed(Leg::External))
        ));
    }

    #[tokio::test]
    async fn idle_client_times_out() {
        let engine = engine_for("127.0.0.1:9".parse().unwrap(), |cfg| cfg.tcp_timeout_ms = 1000);
        let (_client, relay_side) = duplex(64);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let tx = TcpTransaction::new(engine, relay_side, peer);
        assert_eq!(tx.state(), TcpState::ExtReadingInit);
        let result = time::timeout(Duration::from_secs(3), tx.run()).await.unwrap();
        assert!(matches!(result, Err(RelayError::Timeout(Leg::External))));
    }

    #[tokio::test]
    async fn silent_upstream_hits_internal_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let engine = engine_for(upstream, |cfg| {
            cfg.internal_timeout_ms = 200;
            cfg.tcp_timeout_ms = 5000;
        });
        let (mut client, relay_side) = duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(TcpTransaction::new(engine, relay_side, peer).run());

        let query = plain_query(0x7777, "www.example.com.");
        client.write_all(&(query.len() as u16).to_be_bytes()).await.unwrap();
        client.write_all(&query).await.unwrap();

        let started = std::time::Instant::now();
        let result = time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(RelayError::Timeout(Leg::Internal))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn serves_sequential_queries_on_one_connection() {
        let upstream = padded_upstream(0).await;
        let engine = engine_for(upstream, |_| {});
        let (mut client, relay_side) = duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(TcpTransaction::new(engine, relay_side, peer).run());

        for id in [0x1111u16, 0x2222, 0x3333] {
            let query = plain_query(id, "www.example.com.");
            client.write_all(&(query.len() as u16).to_be_bytes()).await.unwrap();
            client.write_all(&query).await.unwrap();

            let mut len = [0u8; 2];
            client.read_exact(&mut len).await.unwrap();
            let mut reply = vec![0u8; u16::from_be_bytes(len) as usize];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(proto_utils::read_txid(&reply), Some(id));
            assert_eq!(&reply[3..], &query[3..]);
        }

        drop(client);
        assert!(matches!(task.await.unwrap(), Ok(())));
    }

    #[test]
    fn states_map_to_legs() {
        assert_eq!(TcpState::ExtReadingMore.leg(), Leg::External);
        assert_eq!(TcpState::ExtWritingInit.leg(), Leg::External);
        assert_eq!(TcpState::IntWritingInit.leg(), Leg::Internal);
        assert_eq!(TcpState::IntReadingMore.leg(), Leg::Internal);
    }
}
