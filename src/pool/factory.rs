use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Byte stream the pool can hold. Closing a transport is dropping it.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Dials a new transport to `address`, honoring the dial timeout.
pub type Factory<T> =
    Arc<dyn Fn(String, Duration) -> BoxFuture<'static, io::Result<T>> + Send + Sync>;

/// Wrap an async closure as a [`Factory`].
pub fn factory_fn<T, F, Fut>(dial: F) -> Factory<T>
where
    F: Fn(String, Duration) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = io::Result<T>> + Send + 'static,
{
    Arc::new(move |address, dial_timeout| Box::pin(dial(address, dial_timeout)))
}

/// Plain TCP dialer used when no factory is supplied.
pub fn tcp_factory() -> Factory<TcpStream> {
    factory_fn(connect_tcp)
}

/// Create a new TCP connection with timeout
pub async fn connect_tcp(address: String, dial_timeout: Duration) -> io::Result<TcpStream> {
    match timeout(dial_timeout, TcpStream::connect(address.as_str())).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("Connection to {} timed out after {:?}", address, dial_timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_factory_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let factory = tcp_factory();
        let dial = tokio::spawn(factory(addr.to_string(), Duration::from_secs(5)));
        let (_server, _) = listener.accept().await.unwrap();

        let stream = dial.await.unwrap().unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn connection_timeout_works() {
        // TEST-NET-1 (non-routable); sandboxes may refuse it outright instead
        let start = std::time::Instant::now();
        let result = connect_tcp("192.0.2.1:9999".to_string(), Duration::from_millis(100)).await;

        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
