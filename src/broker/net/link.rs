use std::net::SocketAddr;

use quinn::{RecvStream, SendStream};
use tracing::{debug, debug_span, trace, Instrument};

use super::{
    dispatch::Dispatcher,
    error::TransportError,
    wire::{decode_frame, encode_frame, Request, Response, HEADER_LEN, MAX_FRAME},
};

/// A QUIC connection to one peer broker. Every call runs on its own
/// bidirectional stream, so calls on one link never block each other.
///
/// Can be cloned to obtain another handle to the same connection.
#[derive(Clone)]
pub struct Link {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
}

impl Link {
    pub async fn connect(
        endpoint: &quinn::Endpoint,
        remote_addr: SocketAddr,
        server_name: &str,
    ) -> Result<Self, TransportError> {
        let span = debug_span!("link", remote = %remote_addr);
        async move {
            debug!("establishing QUIC connection");
            let conn = endpoint.connect(remote_addr, server_name)?.await?;
            debug!("connected via QUIC");
            Ok(Link { conn, remote_addr })
        }
        .instrument(span)
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Sends `request` and waits for the peer's answer.
    pub async fn call(&self, request: &Request) -> Result<Response, TransportError> {
        let frame = encode_frame(request)?;
        let (mut send, mut recv) = self.conn.open_bi().await?;
        send.write_all(&frame).await?;
        send.finish().await?;
        trace!(verb = request.verb(), bytes = frame.len(), "request sent");
        let reply = recv.read_to_end(HEADER_LEN + MAX_FRAME).await?;
        decode_frame(&reply)
    }
}

/// Serves one incoming stream: reads a request, dispatches it and writes the
/// response back.
pub async fn answer(
    mut send: SendStream,
    mut recv: RecvStream,
    dispatcher: &Dispatcher,
) -> Result<(), TransportError> {
    let frame = recv.read_to_end(HEADER_LEN + MAX_FRAME).await?;
    let request: Request = decode_frame(&frame)?;
    let response = dispatcher.handle(request).await;
    send.write_all(&encode_frame(&response)?).await?;
    send.finish().await?;
    Ok(())
}
