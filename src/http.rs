//! Minimal blocking HTTP/1.1 client used for the event stream and message posts.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid URL {0}")]
    InvalidUrl(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path and query, always starting with `/`.
    pub path: String,
}

impl Url {
    /// ```
    /// use mcp_link::http::{Scheme, Url};
    ///
    /// let url = Url::parse("https://127.0.0.1:31173/sse").unwrap();
    /// assert_eq!(url.scheme, Scheme::Https);
    /// assert_eq!(url.port, 31173);
    /// assert_eq!(url.path, "/sse");
    /// ```
    pub fn parse(input: &str) -> Result<Url, Error> {
        let invalid = || Error::InvalidUrl(input.to_owned());
        let (scheme, rest) = if let Some(rest) = input.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = input.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else {
            return Err(invalid());
        };
        let (authority, path) = match rest.find(['/', '?']) {
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, "/"),
        };
        let path = if path.starts_with('?') {
            format!("/{path}")
        } else {
            path.to_owned()
        };
        let default_port = match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // [::1]:8080
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None => default_port,
            };
            (host.to_owned(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_owned(), port.parse().map_err(|_| invalid())?),
                None => (authority.to_owned(), default_port),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Url {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Resolves an absolute URL or a server-relative path against this URL.
    pub fn resolve(&self, reference: &str) -> Result<Url, Error> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Url::parse(reference);
        }
        let path = if reference.starts_with('/') {
            reference.to_owned()
        } else {
            format!("/{reference}")
        };
        Ok(Url {
            path,
            ..self.clone()
        })
    }

    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match (self.scheme, self.port) {
            (Scheme::Http, 80) | (Scheme::Https, 443) => host,
            _ => format!("{host}:{}", self.port),
        }
    }
}

/// The control plane runs on localhost behind a self-signed certificate, so
/// the chain is not checked. Signatures still are.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_config() -> Result<Arc<rustls::ClientConfig>, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn socket(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => s.get_ref(),
        }
    }

    /// A handle that can shut this connection down from another thread.
    pub fn closer(&self) -> Result<Closer, Error> {
        Ok(Closer(self.socket().try_clone()?))
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// Shuts a connection down, unblocking whichever thread is reading it.
#[derive(Debug)]
pub struct Closer(TcpStream);

impl Closer {
    /// Applies to the shared socket, so it affects the owning stream too.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.0.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn close(&self) {
        // already-closed sockets report NotConnected
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

pub fn connect(url: &Url, timeout: Duration) -> Result<Stream, Error> {
    let mut last_error = None;
    let mut socket = None;
    for addr in (url.host.as_str(), url.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => {
                socket = Some(s);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let socket = match (socket, last_error) {
        (Some(s), _) => s,
        (None, Some(e)) => return Err(e.into()),
        (None, None) => return Err(Error::InvalidUrl(format!("{} did not resolve", url.host))),
    };
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;
    match url.scheme {
        Scheme::Http => Ok(Stream::Plain(socket)),
        Scheme::Https => {
            let name = ServerName::try_from(url.host.clone())
                .map_err(|_| Error::InvalidUrl(url.host.clone()))?;
            let connection = ClientConnection::new(tls_config()?, name)?;
            Ok(Stream::Tls(Box::new(StreamOwned::new(connection, socket))))
        }
    }
}

pub fn write_request<W: Write>(
    stream: &mut W,
    method: &str,
    url: &Url,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<(), Error> {
    let mut head = format!("{method} {} HTTP/1.1\r\nHost: {}\r\n", url.path, url.host_header());
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if let Some(body) = body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    if let Some(body) = body {
        stream.write_all(body)?;
    }
    stream.flush()?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }
}

pub fn read_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead, Error> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(Error::MalformedResponse("connection closed before status line".to_owned()));
    }
    let status_line = line.trim_end();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(Error::MalformedResponse(status_line.to_owned()));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::MalformedResponse(status_line.to_owned()))?;
    let reason = parts.next().unwrap_or_default().to_owned();

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(Error::MalformedResponse("connection closed inside headers".to_owned()));
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((key, value)) = header.split_once(':') {
            headers.push((key.trim().to_owned(), value.trim().to_owned()));
        }
    }
    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Decodes a `Transfer-Encoding: chunked` body.
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    remaining: u64,
    done: bool,
}

impl<R: BufRead> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        ChunkedReader {
            inner,
            remaining: 0,
            done: false,
        }
    }

    fn next_chunk(&mut self) -> std::io::Result<()> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            self.done = true;
            return Ok(());
        }
        let size = line.trim_end().split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size, 16).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad chunk size {size:?}"))
        })?;
        if size == 0 {
            // trailers
            loop {
                line.clear();
                if self.inner.read_line(&mut line)? == 0 || line.trim_end().is_empty() {
                    break;
                }
            }
            self.done = true;
        }
        self.remaining = size;
        Ok(())
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.remaining == 0 {
            if self.done {
                return Ok(0);
            }
            self.next_chunk()?;
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            self.done = true;
            return Ok(0);
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            let mut crlf = String::new();
            self.inner.read_line(&mut crlf)?;
        }
        Ok(n)
    }
}

/// A response body read line by line.
pub type Body = Box<dyn BufRead + Send>;

/// Wraps whatever follows the head in the right body decoder.
pub fn body_reader(head: &ResponseHead, reader: BufReader<Stream>) -> Body {
    if head.is_chunked() {
        Box::new(BufReader::new(ChunkedReader::new(reader)))
    } else {
        Box::new(reader)
    }
}

/// Posts a JSON document and returns the response status.
///
/// The body of the response is read (when sized) and discarded.
pub fn post_json(url: &Url, credential: &str, body: &[u8], timeout: Duration) -> Result<u16, Error> {
    let mut stream = connect(url, timeout)?;
    write_request(
        &mut stream,
        "POST",
        url,
        &[
            ("Content-Type", "application/json"),
            ("Authorization", credential),
            ("Connection", "close"),
        ],
        Some(body),
    )?;
    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader)?;
    if let Some(len) = head.content_length() {
        std::io::copy(&mut reader.by_ref().take(len), &mut std::io::sink())?;
    }
    Ok(head.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_urls() {
        let url = Url::parse("http://localhost:8080/messages/?session_id=abc").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/messages/?session_id=abc");

        let url = Url::parse("https://example.test").unwrap();
        assert_eq!(url.port, 443);
        assert_eq!(url.path, "/");

        let url = Url::parse("http://[::1]:9000/sse").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.host_header(), "[::1]:9000");

        assert!(Url::parse("ftp://x/").is_err());
        assert!(Url::parse("http://:80/").is_err());
        assert!(Url::parse("http://host:notaport/").is_err());
    }

    #[test]
    fn resolves_relative_message_endpoint() {
        let base = Url::parse("https://127.0.0.1:31173/sse").unwrap();
        let resolved = base.resolve("/messages/?session_id=abc").unwrap();
        assert_eq!(resolved.host, "127.0.0.1");
        assert_eq!(resolved.port, 31173);
        assert_eq!(resolved.path, "/messages/?session_id=abc");

        let absolute = base.resolve("http://other:1/m").unwrap();
        assert_eq!(absolute.host, "other");
    }

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(Url::parse("http://h/").unwrap().host_header(), "h");
        assert_eq!(Url::parse("http://h:81/").unwrap().host_header(), "h:81");
    }

    #[test]
    fn writes_request_with_content_length() {
        let url = Url::parse("http://127.0.0.1:5000/messages/?session_id=abc").unwrap();
        let mut out = Vec::new();
        write_request(&mut out, "POST", &url, &[("Authorization", "Bearer k")], Some(b"{}")).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /messages/?session_id=abc HTTP/1.1\r\nHost: 127.0.0.1:5000\r\n"));
        assert!(text.contains("Authorization: Bearer k\r\n"));
        assert!(text.ends_with("Content-Length: 2\r\n\r\n{}"));
    }

    #[test]
    fn reads_head() {
        let raw = "HTTP/1.1 202 Accepted\r\nContent-Length: 8\r\ncontent-type: text/plain\r\n\r\nAccepted";
        let mut reader = Cursor::new(raw.as_bytes());
        let head = read_head(&mut reader).unwrap();
        assert_eq!(head.status, 202);
        assert_eq!(head.reason, "Accepted");
        assert_eq!(head.header("Content-Type"), Some("text/plain"));
        assert_eq!(head.content_length(), Some(8));
        assert!(head.is_success());
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "Accepted");
    }

    #[test]
    fn rejects_garbage_status_line() {
        let mut reader = Cursor::new(b"SSH-2.0-OpenSSH\r\n\r\n".as_slice());
        assert!(matches!(read_head(&mut reader), Err(Error::MalformedResponse(_))));
    }

    #[test]
    fn decodes_chunked_body_across_chunk_boundaries() {
        let raw = "7\r\nevent: \r\n9;ext=1\r\nendpoint\n\r\n0\r\nTrailer: x\r\n\r\n";
        let mut reader = BufReader::new(ChunkedReader::new(Cursor::new(raw.as_bytes())));
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "event: endpoint\n");
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    }

    #[test]
    fn chunk_size_must_be_hex() {
        let mut reader = ChunkedReader::new(Cursor::new(b"zz\r\n".as_slice()));
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).is_err());
    }

    /// Serves one POST over TLS with a self-signed certificate and answers 202.
    fn tls_server() -> (Url, std::thread::JoinHandle<(String, Vec<u8>)>) {
        use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
        let cert = CertificateDer::from(include_bytes!("../tests/fixtures/localhost.cert.der").to_vec());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            include_bytes!("../tests/fixtures/localhost.key.der").to_vec(),
        ));
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("https://{}/messages/?session_id=t", listener.local_addr().unwrap())).unwrap();
        let server = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let connection = rustls::ServerConnection::new(Arc::new(config)).unwrap();
            let mut tls = StreamOwned::new(connection, socket);
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                tls.read_exact(&mut byte).unwrap();
                head.push(byte[0]);
            }
            let head = String::from_utf8(head).unwrap();
            let length: usize = head
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse().unwrap()))
                .unwrap();
            let mut body = vec![0u8; length];
            tls.read_exact(&mut body).unwrap();
            tls.write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n").unwrap();
            tls.conn.send_close_notify();
            tls.flush().unwrap();
            (head, body)
        });
        (url, server)
    }

    #[test]
    fn posts_over_tls_to_a_self_signed_server() {
        let (url, server) = tls_server();
        let status = post_json(&url, "Bearer tls", br#"{"jsonrpc":"2.0"}"#, Duration::from_secs(5)).unwrap();
        assert_eq!(status, 202);
        let (head, body) = server.join().unwrap();
        assert!(head.starts_with("POST /messages/?session_id=t HTTP/1.1"));
        assert!(head.contains("Authorization: Bearer tls"));
        assert_eq!(body, br#"{"jsonrpc":"2.0"}"#);
    }
}
