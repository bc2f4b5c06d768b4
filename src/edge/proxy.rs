//! PROXY protocol v1 (ASCII) and v2 (binary) header detection, per
//! spec.md §6: "auto-detected before the first SMTP byte". Only the
//! `PROXY`/`LOCAL` v2 commands and the IPv4/IPv6 v1 address forms are
//! handled; anything else is treated as "no proxy header" and the
//! connection's own peer address is used.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// If the connection opens with a PROXY protocol v1 or v2 header, consumes
/// it from the stream and returns the real peer address it carries.
/// Otherwise leaves the stream untouched (aside from a non-consuming peek)
/// and returns `None`.
pub async fn detect(stream: &mut TcpStream) -> std::io::Result<Option<SocketAddr>> {
    let mut probe = [0u8; 12];
    let peeked = peek_exact(stream, &mut probe).await?;
    if peeked == 12 && probe == V2_SIGNATURE {
        return read_v2(stream).await;
    }
    if peeked >= 5 && &probe[..5] == b"PROXY" {
        return read_v1(stream).await;
    }
    Ok(None)
}

/// Peeks at whatever is currently available, up to `buf.len()` bytes,
/// without consuming it. A client sending a PROXY header writes it as one
/// initial chunk, so a single peek is sufficient to detect it.
async fn peek_exact(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    stream.peek(buf).await
}

async fn read_v1(stream: &mut TcpStream) -> std::io::Result<Option<SocketAddr>> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") || line.len() > 107 {
            break;
        }
    }
    let text = String::from_utf8_lossy(&line);
    let text = text.trim_end();
    let mut parts = text.split(' ');
    match parts.next() {
        Some("PROXY") => {}
        _ => return Ok(None),
    }
    let _protocol = parts.next();
    let src_ip: Option<IpAddr> = parts.next().and_then(|s| s.parse().ok());
    let _dst_ip = parts.next();
    let src_port: Option<u16> = parts.next().and_then(|s| s.parse().ok());
    match (src_ip, src_port) {
        (Some(ip), Some(port)) => Ok(Some(SocketAddr::new(ip, port))),
        _ => Ok(None),
    }
}

async fn read_v2(stream: &mut TcpStream) -> std::io::Result<Option<SocketAddr>> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await?;
    let command = header[12] & 0x0F;
    let family = header[13] >> 4;
    let transport = header[13] & 0x0F;
    let len = u16::from_be_bytes([header[14], header[15]]) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    // command 0x0 is LOCAL (health checks / keepalives): no address to
    // recover, and nothing further to parse from `body`.
    if command != 0x1 || transport != 0x1 {
        return Ok(None);
    }

    match family {
        // AF_INET
        0x1 if body.len() >= 12 => {
            let src_ip = IpAddr::from([body[0], body[1], body[2], body[3]]);
            let src_port = u16::from_be_bytes([body[8], body[9]]);
            Ok(Some(SocketAddr::new(src_ip, src_port)))
        }
        // AF_INET6
        0x2 if body.len() >= 36 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[0..16]);
            let src_ip = IpAddr::from(octets);
            let src_port = u16::from_be_bytes([body[32], body[33]]);
            Ok(Some(SocketAddr::new(src_ip, src_port)))
        }
        _ => Ok(None),
    }
}

/// Writes a v1 PROXY header, used by `smtp::client`-side test fixtures that
/// exercise an edge configured to expect one.
#[allow(dead_code)]
pub async fn write_v1(stream: &mut TcpStream, src: SocketAddr, dst: SocketAddr) -> std::io::Result<()> {
    let proto = if src.is_ipv4() { "TCP4" } else { "TCP6" };
    let line = format!(
        "PROXY {proto} {} {} {} {}\r\n",
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    );
    stream.write_all(line.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn detects_v1_header_and_recovers_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_v1(
                &mut stream,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 54321),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 25),
            )
            .await
            .unwrap();
            stream
        });
        let (mut server, _) = listener.accept().await.unwrap();
        let recovered = detect(&mut server).await.unwrap();
        assert_eq!(
            recovered,
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 54321))
        );
        client.await.unwrap();
    }

    #[tokio::test]
    async fn passes_through_when_no_proxy_header_present() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"EHLO client.example\r\n").await.unwrap();
            stream
        });
        let (mut server, _) = listener.accept().await.unwrap();
        let recovered = detect(&mut server).await.unwrap();
        assert_eq!(recovered, None);
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"EHLO ");
        client.await.unwrap();
    }
}
