use tokio::io::{self, AsyncRead, AsyncWrite};

/// Splice two duplex streams together until either side closes or errors.
/// Returns the byte counts copied in each direction (client-to-origin,
/// origin-to-client), matching `tokio::io::copy_bidirectional`'s ordering.
///
/// Used to implement CONNECT tunneling: one side is the upgraded client
/// connection, the other the freshly dialed origin socket.
pub async fn splice<A, B>(mut a: A, mut b: B) -> io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	io::copy_bidirectional(&mut a, &mut b).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::{TcpListener, TcpStream};

	#[tokio::test]
	async fn splices_until_close() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 5];
			sock.read_exact(&mut buf).await.unwrap();
			sock.write_all(b"world").await.unwrap();
		});

		let client = TcpStream::connect(addr).await.unwrap();
		let (mut near, far) = tokio::io::duplex(64);
		near.write_all(b"hello").await.unwrap();

		let spliced = tokio::spawn(splice(far, client));
		let mut resp = [0u8; 5];
		near.read_exact(&mut resp).await.unwrap();
		assert_eq!(&resp, b"world");

		server.await.unwrap();
		drop(near);
		let _ = spliced.await.unwrap();
	}
}
