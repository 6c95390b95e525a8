//! Scriptable SMTP relay for exercising the real SMTP transport.
//!
//! Speaks just enough ESMTP for a submission session: greeting, EHLO with a
//! configurable capability list, AUTH PLAIN/LOGIN, MAIL, RCPT, DATA and QUIT.
//! Every command line is recorded; AUTH payloads are recorded verbatim so tests can
//! check what went over the wire.

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct Config {
    greeting: Reply,
    capabilities: Vec<String>,
    auth: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    /// Stop answering once this many commands were read on a connection.
    hang_after: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.example.com ESMTP ready"),
            capabilities: vec!["mock.example.com".to_string(), "SIZE 10240000".to_string()],
            auth: Reply::new(235, "2.7.0 Authentication successful"),
            mail_from: Reply::new(250, "2.1.0 Ok"),
            rcpt_to: Reply::new(250, "2.1.5 Ok"),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "2.0.0 Ok: queued as 4F2A1"),
            hang_after: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    lines: Arc<RwLock<Vec<String>>>,
    messages: Arc<RwLock<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command line received, across all connections.
    pub async fn lines(&self) -> Vec<String> {
        self.lines.read().await.clone()
    }

    /// Message bodies received after DATA, still dot-stuffed.
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.read().await.clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<Config>,
        lines: Arc<RwLock<Vec<String>>>,
        messages: Arc<RwLock<Vec<Vec<u8>>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut count = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        if config.greeting.code != 220 {
            return Ok(());
        }

        loop {
            if config.hang_after.is_some_and(|limit| count >= limit) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            line.clear();
            match timeout(Duration::from_secs(10), reader.read_line(&mut line)).await {
                Ok(Ok(0)) | Err(_) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }

            count += 1;
            let command_line = line.trim_end().to_string();
            lines.write().await.push(command_line.clone());

            let verb = command_line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_uppercase();

            let response = match verb.as_str() {
                "EHLO" => ehlo_reply(&config.capabilities),
                "HELO" | "RSET" | "NOOP" => Reply::new(250, "Ok").to_bytes(),
                "AUTH" => {
                    let mut parts = command_line.split_whitespace().skip(1);
                    let mechanism = parts.next().unwrap_or_default().to_uppercase();
                    if mechanism == "LOGIN" {
                        for prompt in ["VXNlcm5hbWU6", "UGFzc3dvcmQ6"] {
                            writer.write_all(format!("334 {prompt}\r\n").as_bytes()).await?;
                            line.clear();
                            if reader.read_line(&mut line).await? == 0 {
                                return Ok(());
                            }
                            lines.write().await.push(line.trim_end().to_string());
                        }
                    }
                    config.auth.to_bytes()
                }
                "MAIL" => config.mail_from.to_bytes(),
                "RCPT" => config.rcpt_to.to_bytes(),
                "DATA" => {
                    writer.write_all(&config.data.to_bytes()).await?;
                    if config.data.code != 354 {
                        continue;
                    }

                    let mut body = Vec::new();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                        if line == ".\r\n" {
                            break;
                        }
                        body.extend_from_slice(line.as_bytes());
                    }
                    messages.write().await.push(body);
                    config.data_end.to_bytes()
                }
                "QUIT" => {
                    writer.write_all(&Reply::new(221, "Bye").to_bytes()).await?;
                    return Ok(());
                }
                _ => Reply::new(502, "5.5.2 Command not implemented").to_bytes(),
            };

            writer.write_all(&response).await?;
        }
    }
}

fn ehlo_reply(capabilities: &[String]) -> Vec<u8> {
    let mut response = String::new();
    let last = capabilities.len().saturating_sub(1);
    for (i, capability) in capabilities.iter().enumerate() {
        let separator = if i == last { ' ' } else { '-' };
        let _ = write!(response, "250{separator}{capability}\r\n");
    }
    response.into_bytes()
}

#[derive(Default)]
pub struct MockSmtpServerBuilder {
    config: Config,
}

impl MockSmtpServerBuilder {
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = Reply::new(code, message);
        self
    }

    /// Adds a capability line to the EHLO reply, e.g. `AUTH PLAIN LOGIN`.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.config.capabilities.push(capability.into());
        self
    }

    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth = Reply::new(code, message);
        self
    }

    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from = Reply::new(code, message);
        self
    }

    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to = Reply::new(code, message);
        self
    }

    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end = Reply::new(code, message);
        self
    }

    /// Goes silent after `commands` command lines on each connection.
    pub const fn with_hang_after(mut self, commands: usize) -> Self {
        self.config.hang_after = Some(commands);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let lines = Arc::new(RwLock::new(Vec::new()));
        let messages = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let lines = Arc::clone(&lines);
            let messages = Arc::clone(&messages);
            let connections = Arc::clone(&connections);
            let shutdown = Arc::clone(&shutdown);

            tokio::spawn(async move {
                while !shutdown.load(Ordering::Relaxed) {
                    let Ok(Ok((stream, _))) =
                        timeout(Duration::from_millis(100), listener.accept()).await
                    else {
                        continue;
                    };

                    connections.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let lines = Arc::clone(&lines);
                    let messages = Arc::clone(&messages);
                    tokio::spawn(async move {
                        let _ = MockSmtpServer::handle_client(stream, config, lines, messages).await;
                    });
                }
            });
        }

        Ok(MockSmtpServer {
            addr,
            lines,
            messages,
            connections,
            shutdown,
        })
    }
}
