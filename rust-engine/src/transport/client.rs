//! Minimal SMTP submission client with STARTTLS and implicit TLS.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::warn;

use super::error::{Result, TransportError};
use super::response::Response;

const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as a protocol error.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn into_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let connector = tls_connector(accept_invalid_certs)?;
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|e| TransportError::Tls(format!("Invalid domain: {e}")))?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(TransportError::Tls("Connection is already TLS".to_string())),
        }
    }
}

fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        warn!(errors = certs.errors.len(), "smtp_native_certs_partially_loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any certificate. Only used when a sending profile opts out of
/// verification.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// One SMTP session.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Open a plain TCP connection. Call [`SmtpClient::read_greeting`] next.
    pub async fn connect(addr: &str, server_domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            connection: Some(Connection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.to_string(),
            accept_invalid_certs,
        })
    }

    /// Wrap the connection in TLS before any SMTP traffic (port 465).
    pub async fn connect_tls(addr: &str, server_domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        let mut client = Self::connect(addr, server_domain, accept_invalid_certs).await?;
        client.upgrade().await?;
        Ok(client)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.connection, Some(Connection::Tls(_)))
    }

    async fn upgrade(&mut self) -> Result<()> {
        let plain = self.connection.take().ok_or(TransportError::ConnectionClosed)?;
        self.connection = Some(plain.into_tls(&self.server_domain, self.accept_invalid_certs).await?);
        Ok(())
    }

    pub async fn read_greeting(&mut self) -> Result<Response> {
        let greeting = self.read_response().await?;
        expect(greeting, "greeting", &[220])
    }

    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.connection
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?
            .send(format!("{command}\r\n").as_bytes())
            .await?;
        self.read_response().await
    }

    /// EHLO, falling back to HELO for servers without ESMTP.
    pub async fn hello(&mut self, name: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {name}")).await?;
        if response.is_success() {
            return Ok(response);
        }
        let response = self.command(&format!("HELO {name}")).await?;
        expect(response, "HELO", &[250])
    }

    /// Issue STARTTLS and upgrade the connection.
    pub async fn starttls(&mut self) -> Result<()> {
        let response = self.command("STARTTLS").await?;
        expect(response, "STARTTLS", &[220])?;
        // Anything buffered before the handshake must not be trusted.
        self.buffer_pos = 0;
        self.upgrade().await
    }

    /// Authenticate with PLAIN when offered, otherwise LOGIN.
    pub async fn authenticate(&mut self, mechanisms: &[String], username: &str, password: &str) -> Result<()> {
        let response = if mechanisms.iter().any(|m| m == "PLAIN") || mechanisms.is_empty() {
            let credentials = BASE64.encode(format!("\0{username}\0{password}"));
            self.command(&format!("AUTH PLAIN {credentials}")).await?
        } else if mechanisms.iter().any(|m| m == "LOGIN") {
            let challenge = self.command("AUTH LOGIN").await?;
            expect(challenge, "AUTH LOGIN", &[334])?;
            let challenge = self.command(&BASE64.encode(username)).await?;
            expect(challenge, "AUTH LOGIN", &[334])?;
            self.command(&BASE64.encode(password)).await?
        } else {
            return Err(TransportError::Auth(format!(
                "No supported mechanism among {}",
                mechanisms.join(" ")
            )));
        };

        if response.code == 235 {
            Ok(())
        } else {
            Err(TransportError::Auth(format!("{} {}", response.code, response.message())))
        }
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<()> {
        let response = self.command(&format!("MAIL FROM:<{from}>")).await?;
        expect(response, "MAIL FROM", &[250]).map(|_| ())
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<()> {
        let response = self.command(&format!("RCPT TO:<{to}>")).await?;
        expect(response, "RCPT TO", &[250, 251]).map(|_| ())
    }

    /// DATA, then the dot-stuffed message and the terminating dot.
    pub async fn data(&mut self, message: &str) -> Result<Response> {
        let response = self.command("DATA").await?;
        expect(response, "DATA", &[354])?;

        let payload = dot_stuff(message);
        let connection = self.connection.as_mut().ok_or(TransportError::ConnectionClosed)?;
        connection.send(payload.as_bytes()).await?;
        if !payload.ends_with("\r\n") {
            connection.send(b"\r\n").await?;
        }
        connection.send(b".\r\n").await?;

        let response = self.read_response().await?;
        expect(response, "message body", &[250])
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(TransportError::Parse(format!(
                        "Reply too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self.connection.as_mut().ok_or(TransportError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

fn expect(response: Response, command: &'static str, codes: &[u16]) -> Result<Response> {
    if codes.contains(&response.code) {
        Ok(response)
    } else {
        Err(TransportError::Rejected {
            command,
            code: response.code,
            message: response.message(),
        })
    }
}

/// Normalise line endings to CRLF and escape lines starting with a dot.
pub(crate) fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 64);
    for (idx, line) in message.split('\n').enumerate() {
        if idx > 0 {
            out.push_str("\r\n");
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}
