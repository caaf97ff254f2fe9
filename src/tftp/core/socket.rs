use super::Packet;
use super::packet::MAX_PACKET_SIZE;
use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

/// Outcome of a bounded receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Raw bytes of one datagram and the address it came from.
    Datagram(Vec<u8>, SocketAddr),
    /// Nothing arrived before the timeout elapsed.
    TimedOut,
}

/// Socket `trait` is the datagram transport used by transfer sessions and
/// the listener. Receiving never blocks longer than the supplied timeout;
/// a quiet peer is reported as [`Received::TimedOut`] instead of an error.
pub trait Socket: Send + 'static {
    /// Sends a [`Packet`] to the specified remote address.
    fn send_to(&self, packet: &Packet, to: SocketAddr) -> anyhow::Result<()> {
        self.send_raw(&packet.serialize()?, to)
    }
    /// Sends already encoded bytes, used to retransmit a packet verbatim.
    fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> anyhow::Result<()>;
    /// Waits at most `timeout` for the next datagram from anyone.
    fn recv_from(&self, timeout: Duration) -> anyhow::Result<Received>;
    /// Returns the local address, which is the session's TID.
    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

impl Socket for UdpSocket {
    fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        UdpSocket::send_to(self, bytes, to)?;

        Ok(())
    }

    fn recv_from(&self, timeout: Duration) -> anyhow::Result<Received> {
        // A zero duration is rejected by set_read_timeout.
        let timeout = timeout.max(Duration::from_millis(1));
        self.set_read_timeout(Some(timeout))?;

        // One spare byte so an oversized datagram is not silently truncated
        // into a valid looking one.
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];
        match UdpSocket::recv_from(self, &mut buf) {
            Ok((amt, from)) => Ok(Received::Datagram(buf[..amt].to_vec(), from)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(Received::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}

impl<T: Socket + ?Sized> Socket for Box<T> {
    fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        (**self).send_raw(bytes, to)
    }

    fn recv_from(&self, timeout: Duration) -> anyhow::Result<Received> {
        (**self).recv_from(timeout)
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        (**self).local_addr()
    }
}
