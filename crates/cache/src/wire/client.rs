//! Lazily connected request/reply client

use super::command::Command;
use super::connection::Connection;
use super::reply::{self, Reply};
use crate::config::NetworkSettings;
use kvcache_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

static ERR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^-ERR\s+(.+?)\s*$").expect("error line pattern is valid"));
static ANY_ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^-\s*(.+?)\s*$").expect("error line pattern is valid"));

/// Protocol code of a rejected database selection
const SELECT_FAILED: u16 = 3;

/// Append the server's message from an error reply to `message`
///
/// `-ERR unknown command` and `-WRONGTYPE …` both contribute the text after
/// the marker; any other reply leaves `message` unchanged.
pub fn format_error(message: &str, reply: &str) -> String {
    let captured = ERR_LINE
        .captures(reply)
        .or_else(|| ANY_ERROR_LINE.captures(reply))
        .and_then(|captures| captures.get(1));
    match captured {
        Some(text) => format!("{message}: {}", text.as_str()),
        None => message.to_string(),
    }
}

/// One server session, connected on first use
///
/// A failed send or receive abandons the session: bytes of the interrupted
/// reply may still arrive, so every later call fails with a connectivity
/// error until [`WireClient::disconnect`] is called. A connect that fails is
/// retried by the next call.
#[derive(Debug)]
pub struct WireClient {
    host: String,
    port: u16,
    database: u32,
    timeout: Duration,
    connection: Option<Connection>,
    abandoned: bool,
}

impl WireClient {
    pub fn new(host: impl Into<String>, port: u16, database: u32, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            database,
            timeout,
            connection: None,
            abandoned: false,
        }
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self::new(
            settings.host.clone(),
            settings.port,
            settings.database,
            settings.timeout(),
        )
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Whether a failed exchange left the session unusable
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        if self.abandoned {
            return Err(Error::connectivity(
                self.endpoint(),
                "reuse session",
                io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "session abandoned after a failed exchange",
                ),
            ));
        }
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.open()?,
        };
        Ok(self.connection.insert(connection))
    }

    fn open(&self) -> Result<Connection> {
        let mut connection = Connection::connect(&self.host, self.port, self.timeout)?;
        if self.database != 0 {
            let select = Command::new("select").arg(self.database.to_string());
            connection.send(&select.to_bytes())?;
            let reply = receive(&mut connection, SELECT_FAILED, "select")?;
            if !reply.is_ok() {
                return Err(Error::protocol(
                    SELECT_FAILED,
                    "select",
                    format_error(
                        &format!("can not select database {}", self.database),
                        &reply.describe(),
                    ),
                ));
            }
            debug!(endpoint = %connection.endpoint(), database = self.database, "database selected");
        }
        Ok(connection)
    }

    /// Send one request line
    pub fn send(&mut self, command: &Command) -> Result<()> {
        debug!(command = command.name(), "sending command");
        let result = self.connection()?.send(&command.to_bytes());
        self.abandon_on_error(result)
    }

    /// Receive one complete reply
    ///
    /// `code` and `context` identify the call site in the protocol error
    /// raised for a malformed reply. Any receive error abandons the session.
    pub fn recv_reply(&mut self, code: u16, context: &'static str) -> Result<Reply> {
        let result = receive(self.connection()?, code, context);
        self.abandon_on_error(result)
    }

    fn abandon_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if let Some(connection) = self.connection.take() {
                warn!(endpoint = %connection.endpoint(), error = %e, "abandoning session");
            }
            self.abandoned = true;
        }
        result
    }

    /// Send `command` and receive its reply
    pub fn call(&mut self, command: &Command, code: u16, context: &'static str) -> Result<Reply> {
        self.send(command)?;
        self.recv_reply(code, context)
    }

    /// Close the connection; the next call connects again
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(endpoint = %connection.endpoint(), "disconnecting");
        }
        self.abandoned = false;
    }
}

fn receive(connection: &mut Connection, code: u16, context: &'static str) -> Result<Reply> {
    if !connection.has_line() {
        connection.read_until_terminator()?;
    }
    loop {
        match reply::parse(connection.buffered()) {
            Ok(Some((reply, used))) => {
                connection.consume(used);
                return Ok(reply);
            }
            Ok(None) => {
                connection.read_greedy()?;
            }
            Err(e) => {
                warn!(code, context, error = %e, "malformed reply");
                connection.discard_buffer();
                return Err(Error::protocol(
                    code,
                    context,
                    format!("server sent malformed response: {e}"),
                ));
            }
        }
    }
}
