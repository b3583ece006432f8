/*!
Transport adapters: server URI parsing and connectors producing the byte
stream the engine's connection rides on.

Every transport, websocket included, is surfaced to the client event loop as
a plain `AsyncRead + AsyncWrite` object; the websocket adapter frames each
write as one binary message and flattens inbound binary messages back into a
byte stream.
 */

use crate::config::TlsOptions;
use crate::error::{MqttError, MqttResult};

use futures::{Sink, Stream};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::WebSocketStream;
use tungstenite::client::IntoClientRequest;
use tungstenite::Message;

/// Scheme of a broker URI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UriScheme {
    /// Plain TCP (`tcp://`)
    Tcp,

    /// TLS over TCP (`ssl://`)
    Ssl,

    /// Websocket (`ws://`), subprotocol `mqtt`
    Ws,

    /// Websocket over TLS (`wss://`)
    Wss,
}

impl UriScheme {
    pub(crate) fn uses_tls(&self) -> bool {
        matches!(self, UriScheme::Ssl | UriScheme::Wss)
    }

    pub(crate) fn uses_websocket(&self) -> bool {
        matches!(self, UriScheme::Ws | UriScheme::Wss)
    }
}

/// A parsed broker address.  The port is mandatory in the textual form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerUri {
    /// Transport selection.
    pub scheme: UriScheme,

    /// Broker host name or address.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Websocket upgrade path; `/mqtt` unless the URI says otherwise.
    pub path: String,
}

impl ServerUri {
    /// Parses `tcp://host:port`, `ssl://host:port`, `ws://host:port/mqtt`,
    /// or `wss://host:port/mqtt`.
    pub fn parse(uri: &str) -> MqttResult<ServerUri> {
        let (scheme_str, rest) = uri.split_once("://")
            .ok_or_else(|| MqttError::new_connection_establishment_failure(format!("server uri \"{}\" has no scheme", uri)))?;

        let scheme = match scheme_str {
            "tcp" => UriScheme::Tcp,
            "ssl" => UriScheme::Ssl,
            "ws" => UriScheme::Ws,
            "wss" => UriScheme::Wss,
            _ => {
                return Err(MqttError::new_connection_establishment_failure(
                    format!("unsupported server uri scheme \"{}\"", scheme_str)));
            }
        };

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], rest[index..].to_string()),
            None => (rest, String::new()),
        };

        if !path.is_empty() && !scheme.uses_websocket() {
            return Err(MqttError::new_connection_establishment_failure("path component is only valid for websocket uris"));
        }

        let (host, port_str) = authority.rsplit_once(':')
            .ok_or_else(|| MqttError::new_connection_establishment_failure(format!("server uri \"{}\" has no port", uri)))?;

        if host.is_empty() {
            return Err(MqttError::new_connection_establishment_failure(format!("server uri \"{}\" has no host", uri)));
        }

        let port: u16 = port_str.parse()
            .map_err(|_| MqttError::new_connection_establishment_failure(format!("server uri \"{}\" has an invalid port", uri)))?;

        let path = if scheme.uses_websocket() && path.is_empty() {
            "/mqtt".to_string()
        } else {
            path
        };

        Ok(ServerUri {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }
}

impl fmt::Display for ServerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            UriScheme::Tcp => "tcp",
            UriScheme::Ssl => "ssl",
            UriScheme::Ws => "ws",
            UriScheme::Wss => "wss",
        };

        write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

pub(crate) trait AsyncByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> AsyncByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// The byte channel one connection rides on.
pub(crate) type TransportStream = Box<dyn AsyncByteStream>;

/// Opens the transport described by the URI: TCP, then TLS if the scheme asks
/// for it, then the websocket upgrade if the scheme asks for that.
pub(crate) async fn connect_transport(uri: &ServerUri, tls_options: Option<&TlsOptions>) -> MqttResult<TransportStream> {
    let tcp_stream = TcpStream::connect((uri.host.as_str(), uri.port)).await
        .map_err(MqttError::new_connection_establishment_failure)?;
    tcp_stream.set_nodelay(true).map_err(MqttError::new_connection_establishment_failure)?;

    if uri.scheme.uses_tls() {
        let tls_options = tls_options
            .ok_or_else(|| MqttError::new_tls_error("tls uri requires tls options"))?;

        let server_name = rustls_pki_types::ServerName::try_from(uri.host.clone())?;
        let connector = TlsConnector::from(tls_options.config.clone());
        let tls_stream = connector.connect(server_name, tcp_stream).await
            .map_err(MqttError::new_connection_establishment_failure)?;

        if uri.scheme.uses_websocket() {
            Ok(Box::new(websocket_upgrade(uri, tls_stream).await?))
        } else {
            Ok(Box::new(tls_stream))
        }
    } else if uri.scheme.uses_websocket() {
        Ok(Box::new(websocket_upgrade(uri, tcp_stream).await?))
    } else {
        Ok(Box::new(tcp_stream))
    }
}

/// Performs the HTTP upgrade with subprotocol `mqtt` over an established
/// stream.
async fn websocket_upgrade<S>(uri: &ServerUri, stream: S) -> MqttResult<WsByteStream<S>>
    where S: AsyncRead + AsyncWrite + Send + Unpin {
    let scheme = if uri.scheme.uses_tls() { "wss" } else { "ws" };
    let request_uri = format!("{}://{}:{}{}", scheme, uri.host, uri.port, uri.path);

    let mut request = request_uri.into_client_request()?;
    request.headers_mut().insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        http::HeaderValue::from_static("mqtt"));

    let (websocket, _response) = tokio_tungstenite::client_async(request, stream).await?;

    Ok(WsByteStream::new(websocket))
}

/// Presents a websocket as an ordered byte stream.  Writes become single
/// binary frames; inbound binary frames are buffered and consumed as bytes.
pub(crate) struct WsByteStream<S> {
    websocket: WebSocketStream<S>,

    residual: Vec<u8>,
    residual_offset: usize,
}

impl<S> WsByteStream<S> where S: AsyncRead + AsyncWrite + Send + Unpin {
    fn new(websocket: WebSocketStream<S>) -> WsByteStream<S> {
        WsByteStream {
            websocket,
            residual: Vec::new(),
            residual_offset: 0,
        }
    }

    fn copy_residual(&mut self, buf: &mut ReadBuf<'_>) {
        let available = &self.residual[self.residual_offset..];
        let amount = available.len().min(buf.remaining());
        buf.put_slice(&available[..amount]);
        self.residual_offset += amount;

        if self.residual_offset == self.residual.len() {
            self.residual.clear();
            self.residual_offset = 0;
        }
    }
}

impl<S> AsyncRead for WsByteStream<S> where S: AsyncRead + AsyncWrite + Send + Unpin {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.residual_offset < this.residual.len() {
                this.copy_residual(buf);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.websocket).poll_next(cx) {
                Poll::Pending => {
                    return Poll::Pending;
                }
                Poll::Ready(None) => {
                    // closed for read; a zero-byte read signals EOF
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(error))) => {
                    return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, error)));
                }
                Poll::Ready(Some(Ok(message))) => {
                    match message {
                        Message::Binary(data) => {
                            this.residual = data;
                            this.residual_offset = 0;
                        }
                        Message::Close(_) => {
                            return Poll::Ready(Ok(()));
                        }
                        // pings are answered by the protocol layer on the
                        // next write; text and pong frames carry nothing
                        _ => {}
                    }
                }
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S> where S: AsyncRead + AsyncWrite + Send + Unpin {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        match Pin::new(&mut this.websocket).poll_ready(cx) {
            Poll::Pending => {
                return Poll::Pending;
            }
            Poll::Ready(Err(error)) => {
                return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, error)));
            }
            Poll::Ready(Ok(())) => {}
        }

        match Pin::new(&mut this.websocket).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(error) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, error))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        Pin::new(&mut this.websocket).poll_flush(cx)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        Pin::new(&mut this.websocket).poll_close(cx)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn uri_parse_tcp() {
        let uri = ServerUri::parse("tcp://broker.example.com:1883").unwrap();
        assert_eq!(uri.scheme, UriScheme::Tcp);
        assert_eq!(uri.host, "broker.example.com");
        assert_eq!(uri.port, 1883);
        assert_eq!(uri.to_string(), "tcp://broker.example.com:1883");
    }

    #[test]
    fn uri_parse_ssl() {
        let uri = ServerUri::parse("ssl://broker.example.com:8883").unwrap();
        assert_eq!(uri.scheme, UriScheme::Ssl);
        assert_eq!(uri.port, 8883);
    }

    #[test]
    fn uri_parse_websocket_with_and_without_path() {
        let uri = ServerUri::parse("ws://broker.example.com:8080/mqtt").unwrap();
        assert_eq!(uri.scheme, UriScheme::Ws);
        assert_eq!(uri.path, "/mqtt");

        let defaulted = ServerUri::parse("wss://broker.example.com:443").unwrap();
        assert_eq!(defaulted.scheme, UriScheme::Wss);
        assert_eq!(defaulted.path, "/mqtt");
    }

    #[test]
    fn uri_parse_rejects_missing_port() {
        assert_matches!(ServerUri::parse("tcp://broker.example.com"),
                        Err(MqttError::ConnectionEstablishmentFailure(_)));
    }

    #[test]
    fn uri_parse_rejects_unknown_scheme_and_missing_scheme() {
        assert_matches!(ServerUri::parse("mqtt://broker.example.com:1883"),
                        Err(MqttError::ConnectionEstablishmentFailure(_)));
        assert_matches!(ServerUri::parse("broker.example.com:1883"),
                        Err(MqttError::ConnectionEstablishmentFailure(_)));
    }

    #[test]
    fn uri_parse_rejects_path_on_tcp() {
        assert_matches!(ServerUri::parse("tcp://broker.example.com:1883/mqtt"),
                        Err(MqttError::ConnectionEstablishmentFailure(_)));
    }

    #[test]
    fn uri_parse_ipv6_style_host_uses_last_colon() {
        let uri = ServerUri::parse("tcp://::1:1883").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, 1883);
    }
}
