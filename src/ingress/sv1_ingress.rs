use std::net::SocketAddr;
use std::time::Duration;

use crate::{
    bridge::error::BridgeResult,
    shared::{error::Sv1IngressError, utils::AbortOnDrop},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{channel, Receiver, Sender},
};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

/// Binds the stratum listener and starts accepting miners. Every connection is handed to the
/// bridge as a pair of line channels. Returns the bound address.
pub async fn start(
    listen_address: SocketAddr,
    downstreams: Sender<(Sender<String>, Receiver<String>, SocketAddr)>,
    shutdown: CancellationToken,
) -> BridgeResult<(SocketAddr, AbortOnDrop)> {
    let listener = TcpListener::bind(listen_address).await?;
    let local_addr = listener.local_addr()?;
    info!("Stratum listener started on {}", local_addr);
    Ok((local_addr, listen_for_downstream(listener, downstreams, shutdown)))
}

fn listen_for_downstream(
    listener: TcpListener,
    downstreams: Sender<(Sender<String>, Receiver<String>, SocketAddr)>,
    shutdown: CancellationToken,
) -> AbortOnDrop {
    tokio::task::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("Try to connect {:#?}", addr);
                    Downstream::new(
                        stream,
                        crate::MAX_LEN_DOWN_MSG,
                        addr,
                        downstreams.clone(),
                        shutdown.clone(),
                    );
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
        info!("Stratum listener stopped");
    })
    .into()
}

struct Downstream {}

impl Downstream {
    pub fn new(
        stream: TcpStream,
        max_len_for_downstream_messages: u32,
        address: SocketAddr,
        downstreams: Sender<(Sender<String>, Receiver<String>, SocketAddr)>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let (send_to_bridge, recv) = channel(crate::DOWNSTREAM_BUFFER_SIZE);
            let (send, recv_from_bridge) = channel(crate::DOWNSTREAM_BUFFER_SIZE);
            if downstreams.send((send, recv, address)).await.is_err() {
                error!("Bridge dropped, refusing connection from {}", address);
                return;
            }
            let codec = LinesCodec::new_with_max_length(max_len_for_downstream_messages as usize);
            let framed = Framed::new(stream, codec);
            let reason = Self::start(framed, recv_from_bridge, send_to_bridge, shutdown).await;
            debug!("Connection {} closed: {}", address, reason);
        });
    }

    async fn start(
        framed: Framed<TcpStream, LinesCodec>,
        receiver: Receiver<String>,
        sender: Sender<String>,
        shutdown: CancellationToken,
    ) -> Sv1IngressError {
        let (writer, reader) = framed.split();
        // dropping the losing future closes its half of the socket
        tokio::select! {
            _ = shutdown.cancelled() => Sv1IngressError::Shutdown,
            result1 = Self::receive_from_downstream_and_relay_up(reader, sender) => result1,
            result2 = Self::receive_from_bridge_and_relay_down(writer, receiver) => result2,
        }
    }

    async fn receive_from_downstream_and_relay_up(
        mut recv: SplitStream<Framed<TcpStream, LinesCodec>>,
        send: Sender<String>,
    ) -> Sv1IngressError {
        while let Some(message) = recv.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!("Unreadable line from downstream: {}", e);
                    return Sv1IngressError::DownstreamDropped;
                }
            };
            if send.send(message).await.is_err() {
                return Sv1IngressError::SessionDropped;
            }
        }
        Sv1IngressError::DownstreamDropped
    }

    async fn receive_from_bridge_and_relay_down(
        mut send: SplitSink<Framed<TcpStream, LinesCodec>, String>,
        mut recv: Receiver<String>,
    ) -> Sv1IngressError {
        let write_timeout = Duration::from_secs(crate::WRITE_TIMEOUT_SECS);
        while let Some(message) = recv.recv().await {
            let message = message.replace(['\n', '\r'], "");
            match tokio::time::timeout(write_timeout, send.send(message)).await {
                Ok(Ok(())) => (),
                Ok(Err(_)) => {
                    warn!("Downstream dropped while trying to send message down");
                    return Sv1IngressError::DownstreamDropped;
                }
                Err(_) => return Sv1IngressError::WriteTimeout,
            }
        }
        Sv1IngressError::SessionDropped
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn relays_lines_both_ways() {
        let (tx, mut rx) = channel(4);
        let shutdown = CancellationToken::new();
        let (addr, _aborter) = start("127.0.0.1:0".parse().unwrap(), tx, shutdown.clone())
            .await
            .unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let (to_miner, mut from_miner, _) = rx.recv().await.unwrap();

        write_half.write_all(b"{\"id\":1}\n").await.unwrap();
        assert_eq!(from_miner.recv().await.unwrap(), "{\"id\":1}");

        to_miner.send("{\"id\":2}".to_string()).await.unwrap();
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"id\":2}");

        // dropping the bridge side closes the socket
        drop(to_miner);
        assert!(lines.next_line().await.unwrap().is_none());
        shutdown.cancel();
    }
}
