//! Receive loop for the broadcast datagrams.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::{decode::decode_frame, types::MAX_DATAGRAM};

use super::handle::{RelayHandle, RuntimeError};

/// Binds the listening socket.
pub async fn bind(addr: &str) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    info!(addr = %socket.local_addr()?, "Reading broadcast datagrams");
    Ok(socket)
}

/// Reads datagrams until the relay stops.
///
/// Each datagram is first copied unchanged to `forward_to`, when set, then
/// decoded; records are handed to the persist stage. Returns
/// [`RuntimeError::ChannelClosed`] once the relay has shut down.
pub async fn run_listener(
    socket: UdpSocket,
    forward_to: Option<SocketAddr>,
    handle: RelayHandle,
) -> Result<(), RuntimeError> {
    if let Some(peer) = forward_to {
        info!(%peer, "forwarding every datagram");
    }

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "receive failed");
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        let datagram = &buf[..len];

        if let Some(peer) = forward_to {
            if let Err(err) = socket.send_to(datagram, peer).await {
                warn!(%peer, error = %err, "forwarding datagram failed");
            }
        }

        if let Some(record) = decode_frame(datagram) {
            debug!(%src, bytes = record.len(), "logged contact received");
            handle.submit(record).await?;
        }
    }
}
