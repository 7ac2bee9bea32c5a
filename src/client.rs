//! Client sessions: line framing, command lists, idle parking and the
//! listener loop for TCP and Unix sockets.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command::{self, CommandContext, CommandResult};
use crate::config::Config;
use crate::idle::{SubSystem, flags_to_subsystems};
use crate::protocol::{self, Ack, AckError, MAX_LINE_LENGTH, changed_line};
use crate::system::System;

/// What a finished session asks of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Disconnect,
    Kill,
}

pub async fn run_server(
    system: Arc<Mutex<System>>,
    config: Arc<Config>,
    kill: UnboundedSender<()>,
) -> Result<()> {
    if config.bind_address.starts_with('/') {
        #[cfg(unix)]
        {
            let listener = tokio::net::UnixListener::bind(&config.bind_address)
                .wrap_err("Could not bind unix socket")
                .wrap_err_with(|| format!("path: {}", config.bind_address))?;
            info!("listening on {}", config.bind_address);
            loop {
                let (stream, _addr) = listener
                    .accept()
                    .await
                    .wrap_err("Could not accept connection")?;
                spawn_session(stream, &system, &config, &kill);
            }
        }
        #[cfg(not(unix))]
        bail!("unix socket addresses are not supported on this platform")
    } else {
        let address = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&address)
            .await
            .wrap_err("Could not bind TCP socket")
            .wrap_err_with(|| format!("address: {address}"))?;
        info!("listening on {address}");
        serve_listener(listener, system, config, kill).await
    }
}

/// Accept loop over an already-bound TCP listener.
pub async fn serve_listener(
    listener: TcpListener,
    system: Arc<Mutex<System>>,
    config: Arc<Config>,
    kill: UnboundedSender<()>,
) -> Result<()> {
    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .wrap_err("Could not accept connection")?;
        debug!("client connected from {addr}");
        spawn_session(stream, &system, &config, &kill);
    }
}

fn spawn_session<S>(
    stream: S,
    system: &Arc<Mutex<System>>,
    config: &Arc<Config>,
    kill: &UnboundedSender<()>,
) where
    S: tokio::io::AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let system = Arc::clone(system);
    let config = Arc::clone(config);
    let kill = kill.clone();
    task::spawn(async move {
        let (reader, writer) = tokio::io::split(stream);
        let reader = BufReader::new(reader);
        match handle_client(reader, writer, system, config).await {
            Ok(SessionEnd::Kill) => {
                let _ = kill.send(());
            }
            Ok(SessionEnd::Disconnect) => info!("client disconnected"),
            Err(error) => warn!("error handling client: {error:#}"),
        }
    });
}

struct Session {
    permission: u8,
    /// idle flags received but not yet reported
    pending_idle: u32,
    idle_rx: broadcast::Receiver<u32>,
    read_timeout: Duration,
    max_command_list_size: usize,
    max_output_buffer_size: usize,
}

impl Session {
    /// Pull everything the idle bus delivered while we were busy.
    fn drain_idle(&mut self) {
        loop {
            match self.idle_rx.try_recv() {
                Ok(flags) => self.pending_idle |= flags,
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    self.pending_idle = SubSystem::ALL;
                }
                Err(_) => break,
            }
        }
    }
}

async fn handle_client(
    mut reader: impl AsyncBufRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    system: Arc<Mutex<System>>,
    config: Arc<Config>,
) -> Result<SessionEnd> {
    writer
        .write_all(format!("OK MPD {}\n", protocol::VERSION).as_bytes())
        .await
        .wrap_err("Could not send greeting to client")?;

    let mut session = {
        let sys = system.lock().await;
        Session {
            permission: config.default_permission_mask(),
            pending_idle: 0,
            idle_rx: sys.idle.subscribe(),
            read_timeout: Duration::from_secs(config.connection_timeout.max(1)),
            max_command_list_size: config.max_command_list_size,
            max_output_buffer_size: config.max_output_buffer_size,
        }
    };

    loop {
        let Some(line) = next_line(&mut reader, session.read_timeout).await? else {
            return Ok(SessionEnd::Disconnect);
        };
        session.drain_idle();

        let response = if line == "command_list_begin" || line == "command_list_ok_begin" {
            let ok_mode = line == "command_list_ok_begin";
            match collect_command_list(&mut reader, &mut session).await? {
                Some(list) => run_command_list(&system, &mut session, list, ok_mode).await,
                None => return Ok(SessionEnd::Disconnect),
            }
        } else {
            let (name, args) = match split_command(&line) {
                Ok(split) => split,
                Err(error) => {
                    let reply = error.to_line("", 0);
                    writer.write_all(reply.as_bytes()).await?;
                    continue;
                }
            };

            if name == "idle" {
                match handle_idle(&mut reader, &mut writer, &mut session, &args).await? {
                    Some(()) => continue,
                    None => return Ok(SessionEnd::Disconnect),
                }
            } else if name == "noidle" {
                // not idling; just acknowledge
                Reply::ok(String::new())
            } else {
                run_single(&system, &mut session, &name, &args).await
            }
        };

        let body = match response {
            Reply::Body(body) => body,
            Reply::End(end) => {
                // flush the final OK before closing
                if end == SessionEnd::Kill {
                    let _ = writer.write_all(b"OK\n").await;
                }
                return Ok(end);
            }
        };

        if body.len() > session.max_output_buffer_size {
            bail!("response exceeds the output buffer limit, closing client");
        }
        debug!("reply: {} bytes", body.len());
        writer
            .write_all(body.as_bytes())
            .await
            .wrap_err("Failed to write response to client")?;
    }
}

/// The outcome of one request (single command or whole list): either a
/// response body ending in `OK`/`ACK`, or an order to end the session.
enum Reply {
    Body(String),
    End(SessionEnd),
}

impl Reply {
    fn ok(mut body: String) -> Self {
        body.push_str("OK\n");
        Reply::Body(body)
    }

    fn ack(error: &AckError, command: &str, index: usize) -> Self {
        Reply::Body(error.to_line(command, index))
    }
}

fn split_command(line: &str) -> Result<(String, Vec<String>), AckError> {
    let mut tokens = crate::protocol::tokenizer::tokenize(line)?;
    if tokens.is_empty() {
        return Err(AckError::new(Ack::Unknown, "No command given"));
    }
    let name = tokens.remove(0);
    Ok((name, tokens))
}

async fn run_single(
    system: &Arc<Mutex<System>>,
    session: &mut Session,
    name: &str,
    args: &[String],
) -> Reply {
    let mut sys = system.lock().await;
    let mut ctx = CommandContext {
        system: &mut *sys,
        permission: &mut session.permission,
    };
    match command::execute(&mut ctx, name, args) {
        Ok(CommandResult::Ok(body)) => Reply::ok(body),
        Ok(CommandResult::Close) => Reply::End(SessionEnd::Disconnect),
        Ok(CommandResult::Kill) => Reply::End(SessionEnd::Kill),
        Err(error) => Reply::ack(&error, name, 0),
    }
}

/// Read lines into a pending batch until `command_list_end`. `None` means
/// the client vanished mid-list.
async fn collect_command_list(
    reader: &mut (impl AsyncBufRead + Unpin),
    session: &mut Session,
) -> Result<Option<Vec<String>>> {
    let mut list = Vec::new();
    let mut total_bytes = 0;

    loop {
        let Some(line) = next_line(reader, session.read_timeout).await? else {
            return Ok(None);
        };
        if line == "command_list_end" {
            return Ok(Some(list));
        }
        total_bytes += line.len();
        if total_bytes > session.max_command_list_size {
            bail!("command list exceeds the size limit, closing client");
        }
        list.push(line);
    }
}

async fn run_command_list(
    system: &Arc<Mutex<System>>,
    session: &mut Session,
    list: Vec<String>,
    ok_mode: bool,
) -> Reply {
    // the whole batch runs under one lock, atomically from the clients'
    // point of view
    let mut sys = system.lock().await;
    let mut response = String::new();

    for (index, line) in list.iter().enumerate() {
        let (name, args) = match split_command(line) {
            Ok(split) => split,
            Err(error) => return Reply::Body(error.to_line("", index)),
        };
        if name == "command_list_begin" || name == "command_list_ok_begin" {
            let error = AckError::new(Ack::Arg, "command list already open");
            return Reply::Body(error.to_line(&name, index));
        }

        let mut ctx = CommandContext {
            system: &mut *sys,
            permission: &mut session.permission,
        };
        match command::execute(&mut ctx, &name, &args) {
            Ok(CommandResult::Ok(body)) => {
                response.push_str(&body);
                if ok_mode {
                    response.push_str("list_OK\n");
                }
            }
            Ok(CommandResult::Close) => return Reply::End(SessionEnd::Disconnect),
            Ok(CommandResult::Kill) => return Reply::End(SessionEnd::Kill),
            Err(error) => {
                // the batch aborts at the first failing command
                response.push_str(&error.to_line(&name, index));
                return Reply::Body(response);
            }
        }
    }

    response.push_str("OK\n");
    Reply::Body(response)
}

/// Park the session until a subscribed subsystem changes or the client
/// sends `noidle`. `None` means the connection ended.
async fn handle_idle(
    reader: &mut (impl AsyncBufRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    session: &mut Session,
    args: &[String],
) -> Result<Option<()>> {
    use futures_concurrency::prelude::*;

    let mask = if args.is_empty() {
        SubSystem::ALL
    } else {
        let mut mask = 0;
        for arg in args {
            let Ok(subsystem) = arg.parse::<SubSystem>() else {
                let error =
                    AckError::new(Ack::Arg, format!("Unrecognized idle event: {arg}"));
                writer.write_all(error.to_line("idle", 0).as_bytes()).await?;
                return Ok(Some(()));
            };
            mask |= subsystem.flag();
        }
        mask
    };

    debug!("entering idle mode");
    loop {
        session.drain_idle();
        let ready = session.pending_idle & mask;
        if ready != 0 {
            session.pending_idle &= !ready;
            let mut reply = String::new();
            for subsystem in flags_to_subsystems(ready) {
                reply.push_str(&changed_line(subsystem));
            }
            reply.push_str("OK\n");
            writer.write_all(reply.as_bytes()).await?;
            return Ok(Some(()));
        }

        enum Wake {
            Event(Result<u32, broadcast::error::RecvError>),
            Line(std::io::Result<Option<String>>),
        }

        // no timeout here: an idling client is deliberately quiet
        let next_line = read_raw_line(reader).map(Wake::Line);
        let next_event = session.idle_rx.recv().map(Wake::Event);

        match (next_line, next_event).race().await {
            Wake::Event(Ok(flags)) => {
                session.pending_idle |= flags;
            }
            Wake::Event(Err(broadcast::error::RecvError::Lagged(_))) => {
                session.pending_idle = SubSystem::ALL;
            }
            Wake::Event(Err(broadcast::error::RecvError::Closed)) => {
                return Ok(None);
            }
            Wake::Line(Ok(Some(line))) => {
                if line == "noidle" {
                    writer.write_all(b"OK\n").await?;
                    return Ok(Some(()));
                }
                // anything else during idle is a protocol violation
                warn!("client sent {line:?} while idling, closing");
                return Ok(None);
            }
            Wake::Line(Ok(None)) => return Ok(None),
            Wake::Line(Err(error)) => {
                return Err(error).wrap_err("Could not read from idling client");
            }
        }
    }
}

/// One request line, without the trailing (CR)LF, bounded by the line cap
/// and the connection timeout.
async fn next_line(
    reader: &mut (impl AsyncBufRead + Unpin),
    read_timeout: Duration,
) -> Result<Option<String>> {
    match timeout(read_timeout, read_raw_line(reader)).await {
        Ok(result) => result.wrap_err("Could not read from client"),
        Err(_elapsed) => bail!("client idle timeout"),
    }
}

async fn read_raw_line(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> std::io::Result<Option<String>> {
    let mut buffer = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            // EOF; a partial line is discarded
            return Ok(None);
        }

        match chunk.iter().position(|&b| b == b'\n') {
            Some(newline) => {
                buffer.extend_from_slice(&chunk[..newline]);
                reader.consume(newline + 1);
                break;
            }
            None => {
                let len = chunk.len();
                buffer.extend_from_slice(chunk);
                reader.consume(len);
            }
        }

        if buffer.len() > MAX_LINE_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request line too long",
            ));
        }
    }

    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    String::from_utf8(buffer)
        .map(Some)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "line is not UTF-8"))
}
