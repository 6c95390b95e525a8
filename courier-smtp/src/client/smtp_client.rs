//! SMTP client with plain, implicit TLS and STARTTLS connections.

use courier_common::{incoming, outgoing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::client::TlsStream;

use super::{
    auth::{self, AuthMechanism},
    error::{ClientError, Result},
    response::{Capabilities, Response},
    tls,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
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
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };
    }
}

async fn handshake(
    stream: TcpStream,
    server_name: &str,
    accept_invalid_certs: bool,
) -> Result<Connection> {
    let stream = tls::connector(accept_invalid_certs)
        .connect(tls::server_name(server_name)?, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))?;

    Ok(Connection::Tls(Box::new(stream)))
}

/// One SMTP session against one server.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    filled: usize,
    server_name: String,
    accept_invalid_certs: bool,
    capabilities: Capabilities,
}

impl SmtpClient {
    fn with_connection(connection: Connection, server_name: String) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            filled: 0,
            server_name,
            accept_invalid_certs: false,
            capabilities: Capabilities::default(),
        }
    }

    /// Opens a plain TCP connection. Use [`Self::starttls`] to upgrade it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_name: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::with_connection(
            Connection::Plain(stream),
            server_name.into(),
        ))
    }

    /// Opens a connection that is TLS from the first byte (SMTPS, usually port 465).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the TLS handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_name: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let server_name = server_name.into();
        let stream = TcpStream::connect(addr).await?;
        let connection = handshake(stream, &server_name, accept_invalid_certs).await?;

        Ok(Self::with_connection(connection, server_name).accept_invalid_certs(accept_invalid_certs))
    }

    /// Sets whether to accept invalid TLS certificates on a later `STARTTLS`.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(Connection::Tls(_)))
    }

    /// Extensions from the most recent successful `EHLO`.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Reads the initial server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is malformed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{line}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await
    }

    /// Sends a command and reads the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");
        self.write_line(command).await?;
        self.read_response().await
    }

    /// Like [`Self::command`], but the line is never logged.
    async fn secret_command(&mut self, command: &str, shown: &str) -> Result<Response> {
        outgoing!("{shown}");
        self.write_line(command).await?;
        self.read_response().await
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        if response.is_success() {
            self.capabilities = Capabilities::from_ehlo(&response);
        }
        Ok(response)
    }

    /// Sends HELO, for servers that reject EHLO.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.capabilities = Capabilities::default();
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends STARTTLS and, on a 220 reply, upgrades the connection.
    ///
    /// The server forgets the session on upgrade, so EHLO has to be sent again.
    ///
    /// # Errors
    ///
    /// Returns an error if the command or the TLS handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Ok(response);
        }

        match self.connection.take() {
            Some(Connection::Plain(stream)) => {
                self.connection =
                    Some(handshake(stream, &self.server_name, self.accept_invalid_certs).await?);
                self.filled = 0;
                self.capabilities = Capabilities::default();
                Ok(response)
            }
            Some(tls @ Connection::Tls(_)) => {
                self.connection = Some(tls);
                Err(ClientError::TlsError("Connection is already TLS".to_string()))
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Authenticates with the best mechanism the server advertised.
    ///
    /// Returns the server's final reply; `235` means success.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthUnsupported`] when neither `PLAIN` nor `LOGIN` is on
    /// offer, or an I/O error.
    pub async fn authenticate(&mut self, username: &str, secret: &str) -> Result<Response> {
        let offered = self.capabilities.auth_mechanisms();
        let mechanism = AuthMechanism::choose(&offered).ok_or_else(|| {
            ClientError::AuthUnsupported(if offered.is_empty() {
                "none".to_string()
            } else {
                offered.join(" ")
            })
        })?;

        match mechanism {
            AuthMechanism::Plain => {
                let line = format!("AUTH PLAIN {}", auth::plain_token(username, secret));
                self.secret_command(&line, "AUTH PLAIN ****").await
            }
            AuthMechanism::Login => {
                let challenge = self.command("AUTH LOGIN").await?;
                if challenge.code != 334 {
                    return Ok(challenge);
                }

                let challenge = self.secret_command(&auth::encode(username), "****").await?;
                if challenge.code != 334 {
                    return Ok(challenge);
                }

                self.secret_command(&auth::encode(secret), "****").await
            }
        }
    }

    /// Sends `MAIL FROM`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// Sends `RCPT TO`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends `DATA`; the server should answer `354`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message, normalising line endings to CRLF and dot-stuffing lines
    /// that start with `.`, then the terminating `.` line.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let payload = dot_stuff(data);
        outgoing!("<{} bytes of message data>", payload.len());

        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(&payload)
            .await?;

        self.read_response().await
    }

    /// Sends `RSET` to abandon the current transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Sends `QUIT` and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
        response
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.filled])?
            {
                self.buffer.copy_within(consumed..self.filled, 0);
                self.filled -= consumed;

                incoming!("{response}");
                return Ok(response);
            }

            if self.filled == self.buffer.len() {
                let grown = self.buffer.len() * 2;
                if grown > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(grown, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.filled..]).await?;
            self.filled += n;
        }
    }
}

fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 5);

    if !data.is_empty() {
        let body = data.strip_suffix(b"\n").unwrap_or(data);
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b""), b".\r\n");
        assert_eq!(dot_stuff(b"hello"), b"hello\r\n.\r\n");
        assert_eq!(dot_stuff(b"a\nb\r\n"), b"a\r\nb\r\n.\r\n");
        assert_eq!(dot_stuff(b".hidden\r\n..\r\n"), b"..hidden\r\n...\r\n.\r\n");
    }

    /// Serves one scripted session: sends `greeting`, then answers each line read
    /// with the next reply, and returns every line the client sent.
    async fn scripted_server(replies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut seen = Vec::new();

            let mut replies = replies.into_iter();
            if let Some(greeting) = replies.next() {
                write.write_all(greeting.as_bytes()).await.unwrap();
            }

            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                seen.push(line.trim_end().to_string());
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn test_auth_plain_session() {
        let (addr, server) = scripted_server(vec![
            "220 relay.test ESMTP\r\n",
            "250-relay.test\r\n250 AUTH LOGIN PLAIN\r\n",
            "235 2.7.0 Authentication successful\r\n",
            "221 Bye\r\n",
        ])
        .await;

        let mut client = SmtpClient::connect(&addr, "relay.test").await.unwrap();
        assert_eq!(client.read_greeting().await.unwrap().code, 220);
        client.ehlo("client.test").await.unwrap();
        let response = client.authenticate("user", "pa55word").await.unwrap();
        assert_eq!(response.code, 235);
        client.quit().await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[0], "EHLO client.test");
        assert_eq!(seen[1], format!("AUTH PLAIN {}", auth::plain_token("user", "pa55word")));
        assert_eq!(seen[2], "QUIT");
    }

    #[tokio::test]
    async fn test_auth_login_session() {
        let (addr, server) = scripted_server(vec![
            "220 relay.test ESMTP\r\n",
            "250-relay.test\r\n250 AUTH LOGIN\r\n",
            "334 VXNlcm5hbWU6\r\n",
            "334 UGFzc3dvcmQ6\r\n",
            "535 5.7.8 Authentication credentials invalid\r\n",
        ])
        .await;

        let mut client = SmtpClient::connect(&addr, "relay.test").await.unwrap();
        client.read_greeting().await.unwrap();
        client.ehlo("client.test").await.unwrap();
        let response = client.authenticate("user", "wrong").await.unwrap();
        assert_eq!(response.code, 535);

        let seen = server.await.unwrap();
        assert_eq!(seen[1], "AUTH LOGIN");
        assert_eq!(seen[2], auth::encode("user"));
        assert_eq!(seen[3], auth::encode("wrong"));
    }

    #[tokio::test]
    async fn test_auth_without_advertised_mechanism() {
        let (addr, _server) = scripted_server(vec![
            "220 relay.test ESMTP\r\n",
            "250 relay.test\r\n",
        ])
        .await;

        let mut client = SmtpClient::connect(&addr, "relay.test").await.unwrap();
        client.read_greeting().await.unwrap();
        client.ehlo("client.test").await.unwrap();

        let err = client.authenticate("user", "secret").await.unwrap_err();
        assert!(matches!(err, ClientError::AuthUnsupported(ref offered) if offered == "none"));
    }

    #[tokio::test]
    async fn test_connection_closed_mid_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"220-partial\r\n").await.unwrap();
        });

        let mut client = SmtpClient::connect(&addr, "relay.test").await.unwrap();
        let err = client.read_greeting().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert!(err.is_transport());
    }
}
