use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::dnscurve::DnsPacket;
use crate::engine::Engine;
use crate::error::RelayError;

/// UDP 事务状态 / Where a UDP transaction currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    /// Query read from the client and analysed.
    ExtReading,
    /// Query sent upstream, waiting for the answer.
    IntWriting,
    /// Answer received from upstream.
    IntReading,
    /// Reply on its way back to the client.
    ExtWriting,
}

/// One client datagram's round trip through the relay.
pub struct UdpTransaction {
    engine: Engine,
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    buffer: Vec<u8>,
    packet: DnsPacket,
    retries: u8,
    state: UdpState,
}

impl UdpTransaction {
    /// Analyses the client's datagram. Malformed queries never become a transaction.
    pub fn accept(
        engine: Engine,
        listener: Arc<UdpSocket>,
        client: SocketAddr,
        mut datagram: Vec<u8>,
    ) -> Result<Self, RelayError> {
        let packet = engine.curve().analyze_query(&mut datagram)?;
        debug!(
            target = "udp",
            client = %client,
            format = ?packet.format,
            txid = packet.external_txid(),
            "query analysed"
        );
        Ok(Self {
            engine,
            listener,
            client,
            buffer: datagram,
            packet,
            retries: 0,
            state: UdpState::ExtReading,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> UdpState {
        self.state
    }

    /// Opens a fresh upstream socket and sends the query with a new id.
    async fn forward(&mut self) -> Result<UdpSocket, RelayError> {
        let upstream = self.engine.open_upstream_udp()?;
        self.state = UdpState::IntWriting;
        self.retries += 1;
        let txid = self.packet.assign_upstream_txid(&mut self.buffer);
        debug!(
            target = "udp",
            external_id = self.packet.external_txid(),
            internal_id = txid,
            attempt = self.retries,
            "forwarding query to upstream"
        );
        upstream.send_to(&self.buffer, self.engine.config().target).await?;
        Ok(upstream)
    }

    /// Drives the transaction to completion. The upstream socket of each
    /// attempt is dropped before the next one is opened.
    pub async fn run(mut self) -> Result<(), RelayError> {
        let target = self.engine.config().target;
        let tries = self.engine.config().udp_tries;
        let wait = self.engine.config().internal_timeout;
        let max_len = self.engine.config().udp_buffer_size;
        let mut reply = vec![0u8; max_len];

        let (len, from) = 'attempts: loop {
            let upstream = self.forward().await?;
            let deadline = Instant::now() + wait;
            // a failed receive keeps the attempt alive until its timer fires
            while let Ok(received) = time::timeout_at(deadline, upstream.recv_from(&mut reply)).await {
                match received {
                    Ok(received) => break 'attempts received,
                    Err(err) => {
                        debug!(target = "udp", error = %err, attempt = self.retries, "upstream receive failed");
                    }
                }
            }
            if self.retries >= tries {
                info!(target = "udp", client = %self.client, tries, "reached maximum number of UDP tries");
                return Err(RelayError::UpstreamTimeout { tries });
            }
            debug!(target = "udp", attempt = self.retries, "upstream timeout, retrying");
        };
        self.state = UdpState::IntReading;

        if from != target {
            warn!(target = "udp", from = %from, "reply is not coming from the target");
            return Err(RelayError::UpstreamMismatch {
                expected: target,
                got: from,
            });
        }

        reply.truncate(len);
        self.buffer = reply;
        let curve = self.engine.curve();
        curve.analyze_reply(&self.packet, &mut self.buffer)?;
        curve.build_reply(&mut self.packet, &mut self.buffer, max_len)?;

        self.state = UdpState::ExtWriting;
        self.listener.send_to(&self.buffer, self.client).await?;
        debug!(
            target = "udp",
            client = %self.client,
            format = ?self.packet.format,
            len = self.buffer.len(),
            "reply sent"
        );
        Ok(())
    }
}
