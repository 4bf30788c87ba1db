//! Byte streams a [`Connection`](crate::Connection) can run over.

use crate::config::{ConnectionAddr, ConnectionConfig};
use crate::{Error, Result};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

pub(crate) enum Transport {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    /// Opens the stream described by `config`, bounded by its connect timeout.
    pub(crate) async fn connect(config: &ConnectionConfig) -> Result<Transport> {
        let connect = Transport::open(config);

        let result = match config.connect_timeout() {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("Timeout connecting to server".to_string())),
            },
            None => connect.await,
        };

        result.map_err(|err| match err {
            Error::Connection(msg) => {
                Error::Connection(format!("Error connecting to {}. {msg}.", describe(config)))
            }
            other => other,
        })
    }

    async fn open(config: &ConnectionConfig) -> Result<Transport> {
        match &config.addr {
            ConnectionAddr::Tcp { host, port } => {
                let stream = tcp_connect(host, *port, config.socket_keepalive).await?;
                Ok(Transport::Tcp(stream))
            }
            #[cfg(feature = "tls")]
            ConnectionAddr::Tls { host, port, tls } => {
                let stream = tcp_connect(host, *port, config.socket_keepalive).await?;
                let connector = tls::connector(tls).await?;
                let stream = connector
                    .connect(host, stream)
                    .await
                    .map_err(|err| Error::Connection(err.to_string()))?;
                Ok(Transport::Tls(Box::new(stream)))
            }
            #[cfg(not(feature = "tls"))]
            ConnectionAddr::Tls { .. } => Err(Error::InvalidConfig(
                "TLS endpoints require the `tls` feature".to_string(),
            )),
            #[cfg(unix)]
            ConnectionAddr::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|err| Error::Connection(err.to_string()))?;
                Ok(Transport::Unix(stream))
            }
            #[cfg(not(unix))]
            ConnectionAddr::Unix(_) => Err(Error::InvalidConfig(
                "Unix domain sockets are not supported on this platform".to_string(),
            )),
        }
    }
}

async fn tcp_connect(host: &str, port: u16, keepalive: bool) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|err| Error::Connection(err.to_string()))?;

    stream
        .set_nodelay(true)
        .map_err(|err| Error::Connection(err.to_string()))?;
    if keepalive {
        socket2::SockRef::from(&stream)
            .set_keepalive(true)
            .map_err(|err| Error::Connection(err.to_string()))?;
    }
    debug!(host, port, keepalive, "tcp stream established");

    Ok(stream)
}

fn describe(config: &ConnectionConfig) -> String {
    match &config.addr {
        ConnectionAddr::Tcp { host, port } | ConnectionAddr::Tls { host, port, .. } => {
            format!("{host}:{port}")
        }
        ConnectionAddr::Unix(path) => format!("unix socket: {}", path.display()),
    }
}

#[cfg(feature = "tls")]
mod tls {
    use crate::config::{CertReqs, TlsOptions};
    use crate::{Error, Result};
    use native_tls::{Certificate, Identity, TlsConnector};

    fn tls_error(err: impl std::fmt::Display) -> Error {
        Error::Connection(format!("TLS setup failed: {err}"))
    }

    pub(super) async fn connector(opts: &TlsOptions) -> Result<tokio_native_tls::TlsConnector> {
        let mut builder = TlsConnector::builder();

        if opts.cert_reqs == CertReqs::None {
            builder.danger_accept_invalid_certs(true);
        }
        if !opts.check_hostname || opts.cert_reqs == CertReqs::None {
            builder.danger_accept_invalid_hostnames(true);
        }
        if let Some(path) = &opts.ca_certs {
            let pem = tokio::fs::read(path).await.map_err(tls_error)?;
            builder.add_root_certificate(Certificate::from_pem(&pem).map_err(tls_error)?);
        }
        if let (Some(cert), Some(key)) = (&opts.certfile, &opts.keyfile) {
            let cert = tokio::fs::read(cert).await.map_err(tls_error)?;
            let key = tokio::fs::read(key).await.map_err(tls_error)?;
            builder.identity(Identity::from_pkcs8(&cert, &key).map_err(tls_error)?);
        }

        Ok(builder.build().map_err(tls_error)?.into())
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}
