use std::io::IoSlice;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use hyper::upgrade::Upgraded;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

/// TCP-level attributes of an accepted or dialed connection, copied into
/// request extensions so the request pipeline can see where bytes came from.
#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

#[derive(Debug, Clone, Eq, PartialEq, Copy)]
pub enum Alpn {
	Http11,
	H2,
	Other,
}

impl From<&[u8]> for Alpn {
	fn from(value: &[u8]) -> Self {
		if value == b"h2" {
			Alpn::H2
		} else if value == b"http/1.1" {
			Alpn::Http11
		} else {
			Alpn::Other
		}
	}
}

#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
	pub server_name: Option<String>,
	pub negotiated_alpn: Option<Alpn>,
}

/// Handle to the raw file descriptor backing a connection, kept as a dup so a
/// rule can flip SO_LINGER to zero and turn the eventual close into an RST.
#[derive(Debug, Clone, Default)]
pub struct ConnectionControl {
	sock: Option<Arc<socket2::Socket>>,
}

impl ConnectionControl {
	pub fn reset_on_close(&self) {
		if let Some(sock) = &self.sock {
			let _ = sock.set_linger(Some(Duration::ZERO));
		}
	}
}

pub struct Socket {
	tcp: TcpConnectionInfo,
	tls: Option<TlsConnectionInfo>,
	ctrl: ConnectionControl,
	// Bytes already consumed from the wire (protocol peeking) that must be
	// replayed before the inner stream is read again.
	prefix: Bytes,
	inner: SocketKind,
}

pub enum SocketKind {
	Tcp(TcpStream),
	Tls(Box<TlsStream<Box<Socket>>>),
	Tunnel(TokioIo<Upgraded>),
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> anyhow::Result<Self> {
		stream.set_nodelay(true)?;
		let tcp = TcpConnectionInfo {
			peer_addr: to_canonical(stream.peer_addr()?),
			local_addr: to_canonical(stream.local_addr()?),
			start: Instant::now(),
		};
		// Dup the fd so the request pipeline can reach the socket options even
		// while hyper owns the stream.
		let std = stream.into_std()?;
		let ctrl = ConnectionControl {
			sock: std.try_clone().ok().map(|s| Arc::new(socket2::Socket::from(s))),
		};
		let stream = TcpStream::from_std(std)?;
		Ok(Socket {
			tcp,
			tls: None,
			ctrl,
			prefix: Bytes::new(),
			inner: SocketKind::Tcp(stream),
		})
	}

	pub fn from_tls(tls: TlsStream<Box<Socket>>) -> Self {
		let (tcp, ctrl) = {
			let inner = tls.get_ref().0;
			(inner.tcp.clone(), inner.ctrl.clone())
		};
		let info = {
			let (_, ssl) = tls.get_ref();
			let server_name = match &tls {
				TlsStream::Server(s) => {
					let (_, ssl) = s.get_ref();
					ssl.server_name().map(|s| s.to_string())
				},
				_ => None,
			};
			TlsConnectionInfo {
				server_name,
				negotiated_alpn: ssl.alpn_protocol().map(Alpn::from),
			}
		};
		Socket {
			tcp,
			tls: Some(info),
			ctrl,
			prefix: Bytes::new(),
			inner: SocketKind::Tls(Box::new(tls)),
		}
	}

	/// Wraps the byte stream recovered from a CONNECT upgrade. The control
	/// handle of the carrying connection is retained so reset semantics keep
	/// working inside tunnels.
	pub fn from_tunnel(upgraded: Upgraded, tcp: TcpConnectionInfo, ctrl: ConnectionControl) -> Self {
		Socket {
			tcp,
			tls: None,
			ctrl,
			prefix: Bytes::new(),
			inner: SocketKind::Tunnel(TokioIo::new(upgraded)),
		}
	}

	pub async fn dial(target: SocketAddr) -> anyhow::Result<Socket> {
		let res = TcpStream::connect(target).await?;
		Socket::from_tcp(res)
	}

	pub fn tcp(&self) -> &TcpConnectionInfo {
		&self.tcp
	}

	pub fn tls_info(&self) -> Option<&TlsConnectionInfo> {
		self.tls.as_ref()
	}

	pub fn ctrl(&self) -> ConnectionControl {
		self.ctrl.clone()
	}

	/// Reads a single byte ahead of the protocol handler. Returns `None` on a
	/// connection that closed without sending anything. The byte is replayed
	/// on the next read.
	pub async fn peek_byte(&mut self) -> std::io::Result<Option<u8>> {
		let mut byte = [0u8; 1];
		let n = self.read(&mut byte).await?;
		if n == 0 {
			return Ok(None);
		}
		let mut joined = BytesMut::with_capacity(1 + self.prefix.len());
		joined.extend_from_slice(&byte);
		joined.extend_from_slice(&self.prefix);
		self.prefix = joined.freeze();
		Ok(Some(byte[0]))
	}
}

impl Connection for Socket {
	fn connected(&self) -> Connected {
		let mut c = Connected::new();
		if self.tls.as_ref().and_then(|t| t.negotiated_alpn) == Some(Alpn::H2) {
			c = c.negotiated_h2();
		}
		c
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		if !self.prefix.is_empty() {
			let n = std::cmp::min(buf.remaining(), self.prefix.len());
			buf.put_slice(&self.prefix[..n]);
			self.prefix.advance(n);
			return Poll::Ready(Ok(()));
		}
		match &mut self.inner {
			SocketKind::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketKind::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
			SocketKind::Tunnel(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match &mut self.inner {
			SocketKind::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketKind::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
			SocketKind::Tunnel(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut self.inner {
			SocketKind::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			SocketKind::Tls(inner) => Pin::new(inner).poll_flush(cx),
			SocketKind::Tunnel(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut self.inner {
			SocketKind::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketKind::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
			SocketKind::Tunnel(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		match &mut self.inner {
			SocketKind::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketKind::Tls(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			SocketKind::Tunnel(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match &self.inner {
			SocketKind::Tcp(inner) => inner.is_write_vectored(),
			SocketKind::Tls(inner) => inner.is_write_vectored(),
			SocketKind::Tunnel(inner) => inner.is_write_vectored(),
		}
	}
}

fn to_canonical(addr: SocketAddr) -> SocketAddr {
	let ip = addr.ip().to_canonical();
	SocketAddr::from((ip, addr.port()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncWriteExt;
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn peeked_bytes_are_replayed() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let client = tokio::spawn(async move {
			let mut c = TcpStream::connect(addr).await.unwrap();
			c.write_all(b"hello").await.unwrap();
		});
		let (accepted, _) = listener.accept().await.unwrap();
		let mut sock = Socket::from_tcp(accepted).unwrap();
		assert_eq!(sock.peek_byte().await.unwrap(), Some(b'h'));
		let mut buf = [0u8; 5];
		sock.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");
		client.await.unwrap();
	}

	#[tokio::test]
	async fn empty_connection_peeks_none() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let client = tokio::spawn(async move {
			drop(TcpStream::connect(addr).await.unwrap());
		});
		let (accepted, _) = listener.accept().await.unwrap();
		let mut sock = Socket::from_tcp(accepted).unwrap();
		assert_eq!(sock.peek_byte().await.unwrap(), None);
		client.await.unwrap();
	}
}
