//! Ingestion session: one thread per accepted connection.
//!
//! ```text
//! AWAITING_LOGIN --LOGIN ok--> ACTIVE --EOF / receive error--> TERMINATED
//!       |                                                          ^
//!       +------------- anything else (connection closed) ----------+
//! ```
//!
//! The login line is parsed and executed on the session thread itself, so
//! the acknowledgement does not wait behind queued work and the client key
//! is known before any other command is read. Every later line is parsed
//! and pushed to the command queue without waiting for its execution. While
//! the queue is full the session blocks and stops reading its socket.

use crate::connection::{Connection, LineReader};
use crate::directory::{ClientRecord, DirectoryError};
use crate::handlers::HandlerError;
use crate::protocol::{parse, Command, CommandKind, ParseError, Reply, LINE_SIZE};
use crate::server::Context;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Reasons a session ends before reaching the active state
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("connection closed before login")]
    Closed,
    #[error("invalid LOGIN message: {0}")]
    Parse(#[from] ParseError),
    #[error("first command must be LOGIN, got {0}")]
    NotLogin(CommandKind),
    #[error("login rejected: {0}")]
    Handler(#[from] HandlerError),
    #[error("registration failed: {0}")]
    Register(#[from] DirectoryError),
    #[error("unable to send login acknowledgement: {0}")]
    Send(#[source] io::Error),
}

/// A logged-in client being served.
pub struct Session {
    ctx: Arc<Context>,
    reader: LineReader<TcpStream>,
    client: Arc<ClientRecord>,
}

/// Serve one connection from login to disconnect.
pub fn run(ctx: Arc<Context>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();

    let session = match Session::login(ctx, stream) {
        Ok(session) => session,
        Err(e) => {
            warn!(peer = ?peer, error = %e, "Error in LOGIN, closing connection");
            return;
        }
    };

    debug!(peer = ?session.peer(), key = session.key(), "Session active");
    session.serve();
}

impl Session {
    /// AWAITING_LOGIN: read, run and acknowledge the LOGIN command.
    pub fn login(ctx: Arc<Context>, stream: TcpStream) -> Result<Self, SessionError> {
        let read_half = stream.try_clone().map_err(SessionError::Receive)?;
        let mut reader = LineReader::new(read_half, LINE_SIZE);

        let line = reader
            .read_line()
            .map_err(SessionError::Receive)?
            .ok_or(SessionError::Closed)?;

        let mut cmd = parse(&line, 0)?;
        if cmd.kind != CommandKind::Login {
            return Err(SessionError::NotLogin(cmd.kind));
        }
        cmd.connection = Some(Connection::new(stream));

        let (client, reply) = ctx.handlers.login(cmd)?;

        if let Err(e) = ctx.directory.insert(Arc::clone(&client)) {
            client.connection.close();
            return Err(e.into());
        }

        if let Err(e) = client.connection.send_reply(&reply) {
            if let Ok(client) = ctx.directory.remove(client.key) {
                client.connection.close();
            }
            return Err(SessionError::Send(e));
        }

        Ok(Self {
            ctx,
            reader,
            client,
        })
    }

    /// ACTIVE: forward commands until the client goes away, then TERMINATED.
    pub fn serve(mut self) {
        let key = self.client.key;

        loop {
            let line = match self.reader.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(name = %self.client.name, "Connection closed by client");
                    break;
                }
                Err(e) => {
                    warn!(name = %self.client.name, error = %e, "Receive failed");
                    break;
                }
            };

            match parse(&line, key) {
                Ok(cmd) => {
                    trace!(name = %self.client.name, kind = %cmd.kind, "Queueing command");
                    self.ctx.queue.enqueue(cmd);
                }
                Err(e) => {
                    warn!(name = %self.client.name, error = %e, "Unable to parse message");
                    if let Err(e) = self.client.connection.send_reply(&Reply::parse_error(key, &e)) {
                        warn!(name = %self.client.name, error = %e, "Unable to answer client");
                        break;
                    }
                }
            }
        }

        self.terminate();
    }

    /// Hand the client over for removal behind its pending commands.
    fn terminate(self) {
        debug!(name = %self.client.name, key = self.client.key, "Unregistering client");
        self.ctx.queue.enqueue(Command::unregister(self.client.key));
    }

    pub fn key(&self) -> u64 {
        self.client.key
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.client.connection.peer()
    }
}
