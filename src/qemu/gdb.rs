//! Client side of the remote serial debug protocol exposed by the emulator's
//! debug stub (`-gdb tcp::1234`). Packets are `$<payload>#<checksum>` with an
//! 8-bit modular sum, acknowledged with `+`.

use crate::error::{Error, Result};
use crate::register::RegisterFile;
use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Memory transfers are split into requests of at most this many bytes.
pub const MEMORY_CHUNK: usize = 4096;

/// Default bound for a single packet receive.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound while waiting for a stop notification after `continue`.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

const ACK: u8 = b'+';
const NAK: u8 = b'-';
const BREAK: u8 = 0x03;

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Scan `buf` for the next complete packet. Leading ack/nak bytes are
/// consumed silently. Returns the payload and the number of bytes consumed,
/// or `None` when the packet is still incomplete.
fn parse_packet(buf: &[u8]) -> Result<Option<(String, usize)>> {
    let mut pos = 0;
    while pos < buf.len() && (buf[pos] == ACK || buf[pos] == NAK) {
        pos += 1;
    }
    let Some(start) = buf[pos..].iter().position(|b| *b == b'$') else {
        return Ok(None);
    };
    let start = pos + start;
    let Some(hash) = buf[start..].iter().position(|b| *b == b'#') else {
        return Ok(None);
    };
    let hash = start + hash;
    if buf.len() < hash + 3 {
        return Ok(None);
    }

    let payload = &buf[start + 1..hash];
    let want = u8::from_str_radix(
        std::str::from_utf8(&buf[hash + 1..hash + 3])
            .map_err(|_| Error::MalformedPacket("non-ascii checksum".into()))?,
        16,
    )
    .map_err(|_| Error::MalformedPacket("bad checksum digits".into()))?;
    let got = checksum(payload);
    if got != want {
        return Err(Error::ChecksumMismatch { got, want });
    }

    let payload = String::from_utf8(payload.to_vec())?;
    Ok(Some((payload, hash + 3)))
}

/// Remote-debug protocol client. Not internally synchronized: the owning
/// backend serializes access (the stub has no request multiplexing).
pub struct GdbClient {
    stream: Option<TcpStream>,
    rx: Vec<u8>,
    recv_timeout: Duration,
}

impl GdbClient {
    /// Connect to the debug stub at `addr`.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(connect_timeout))?
            .map_err(|e| Error::connection(format!("debug stub at {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(target: "gdb", "connected to debug stub at {addr}");
        Ok(GdbClient {
            stream: Some(stream),
            rx: Vec::new(),
            recv_timeout: RECV_TIMEOUT,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Override the per-packet receive bound (default [`RECV_TIMEOUT`]).
    pub fn set_recv_timeout(&mut self, bound: Duration) {
        self.recv_timeout = bound;
    }

    /// Close the connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(target: "gdb", "connection closed");
        }
        self.rx.clear();
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }

    /// Drop any acknowledgement bytes already sitting in the receive buffer.
    fn consume_pending_acks(&mut self) {
        let skip = self
            .rx
            .iter()
            .take_while(|b| **b == ACK || **b == NAK)
            .count();
        self.rx.drain(..skip);
    }

    async fn send_packet(&mut self, payload: &str) -> Result<()> {
        self.consume_pending_acks();
        let frame = format!("${payload}#{:02x}", checksum(payload.as_bytes()));
        trace!(target: "gdb", "-> {frame}");
        self.stream_mut()?.write_all(frame.as_bytes()).await?;
        Ok(())
    }

    /// Read the next complete packet, acknowledge it, and return its payload.
    pub async fn recv_packet(&mut self, bound: Duration) -> Result<String> {
        loop {
            match parse_packet(&self.rx)? {
                Some((payload, consumed)) => {
                    self.rx.drain(..consumed);
                    trace!(target: "gdb", "<- ${payload}");
                    self.stream_mut()?.write_all(&[ACK]).await?;
                    return Ok(payload);
                }
                None => {
                    let mut chunk = [0u8; 4096];
                    let n = timeout(bound, self.stream_mut()?.read(&mut chunk))
                        .await
                        .map_err(|_| Error::Timeout(bound))??;
                    if n == 0 {
                        return Err(Error::connection("debug stub closed the connection"));
                    }
                    self.rx.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    async fn transact(&mut self, cmd: &str) -> Result<String> {
        self.send_packet(cmd).await?;
        self.recv_packet(self.recv_timeout).await
    }

    /// Read `len` bytes of guest memory starting at linear address `addr`.
    /// Requests are chunked at [`MEMORY_CHUNK`] bytes and concatenated in
    /// order. A zero-length read returns empty without touching the wire.
    pub async fn read_memory(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(MEMORY_CHUNK);
            let reply = self.transact(&format!("m{cursor:x},{take:x}")).await?;
            if reply.starts_with('E') {
                return Err(Error::protocol(
                    "gdb",
                    format!("memory read failed at {cursor:#x}: {reply}"),
                ));
            }
            let bytes = hex::decode(&reply)
                .map_err(|e| Error::MalformedPacket(format!("memory reply: {e}")))?;
            if bytes.len() != take {
                warn!(target: "gdb", "short memory reply at {cursor:#x}: {} of {take} bytes", bytes.len());
            }
            out.extend_from_slice(&bytes);
            cursor += take as u32;
            remaining -= take;
        }
        Ok(out)
    }

    /// Write `data` to guest memory at linear address `addr`.
    pub async fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let reply = self
            .transact(&format!(
                "M{addr:x},{:x}:{}",
                data.len(),
                hex::encode(data)
            ))
            .await?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(Error::protocol(
                "gdb",
                format!("memory write failed at {addr:#x}: {reply}"),
            ))
        }
    }

    /// Full register dump (`g`): sixteen little-endian 32-bit words.
    pub async fn read_registers(&mut self) -> Result<RegisterFile> {
        let reply = self.transact("g").await?;
        if reply.starts_with('E') {
            return Err(Error::protocol("gdb", format!("register read failed: {reply}")));
        }
        if reply.len() < 16 * 8 {
            return Err(Error::MalformedPacket(format!(
                "register dump too short: {} hex chars",
                reply.len()
            )));
        }
        let bytes = hex::decode(&reply[..16 * 8])
            .map_err(|e| Error::MalformedPacket(format!("register dump: {e}")))?;
        let mut words = [0u32; 16];
        for (i, chunk) in bytes.chunks_exact(4).enumerate().take(16) {
            words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(RegisterFile::from_gdb_dump(&words))
    }

    /// Install a software execution breakpoint at `addr`.
    pub async fn set_breakpoint(&mut self, addr: u32) -> Result<()> {
        let reply = self.transact(&format!("Z0,{addr:x},1")).await?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(Error::protocol(
                "gdb",
                format!("breakpoint set at {addr:#x} failed: {reply}"),
            ))
        }
    }

    /// Remove a software execution breakpoint at `addr`.
    pub async fn remove_breakpoint(&mut self, addr: u32) -> Result<()> {
        let reply = self.transact(&format!("z0,{addr:x},1")).await?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(Error::protocol(
                "gdb",
                format!("breakpoint remove at {addr:#x} failed: {reply}"),
            ))
        }
    }

    /// Resume the guest. Fire-and-forget: the stop packet, if any, is
    /// collected later via [`GdbClient::wait_stop`].
    pub async fn cont(&mut self) -> Result<()> {
        self.send_packet("c").await
    }

    /// Interrupt the guest by sending the break byte.
    pub async fn stop(&mut self) -> Result<()> {
        self.stream_mut()?.write_all(&[BREAK]).await?;
        Ok(())
    }

    /// Wait for the next stop notification (e.g. `T05…` after a breakpoint
    /// hit or a break byte) and return its payload.
    pub async fn wait_stop(&mut self, bound: Duration) -> Result<String> {
        self.recv_packet(bound).await
    }

    /// Single-step one instruction; returns the stop packet payload.
    pub async fn step(&mut self) -> Result<String> {
        self.transact("s").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_modular_sum() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"OK"), 0x9a);
        // 0x4f + 0x4b = 0x9a, and wrap-around:
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn parses_complete_packet() {
        let (payload, consumed) = parse_packet(b"$OK#9a").unwrap().unwrap();
        assert_eq!(payload, "OK");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn skips_leading_acks() {
        let (payload, consumed) = parse_packet(b"++$OK#9a").unwrap().unwrap();
        assert_eq!(payload, "OK");
        assert_eq!(consumed, 8);
    }

    #[test]
    fn incomplete_packet_returns_none() {
        assert!(parse_packet(b"$OK").unwrap().is_none());
        assert!(parse_packet(b"$OK#9").unwrap().is_none());
    }

    #[test]
    fn rejects_bad_checksum() {
        assert!(matches!(
            parse_packet(b"$OK#00"),
            Err(Error::ChecksumMismatch { .. })
        ));
    }
}
