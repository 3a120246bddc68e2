//! Unix socket server and the Assuan dispatch loop.
//!
//! One task per accepted connection. A separate reader task feeds
//! complete lines into a channel so a running command can keep watching
//! the wire for CAN/BYE while it waits on its controller. Builtins
//! (INPUT, OUTPUT, MESSAGE, FILE, SENDER, RECIPIENT, OPTION, SESSION,
//! RESET, BYE, NOP) are handled inline; everything else goes through
//! the command registry. Collected per-command state is dropped after
//! every dispatched command.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Notify;

use crate::assuan::{self, AssuanError, InquireReply, Request};
use crate::command::CommandRegistry;
use crate::config::UiServerConfig;
use crate::controller::ControllerEvent;
use crate::engine::{
    agent_is_running, launch_agent, CertificateResolver, CryptoEngine, GpgAgentTransport, IoSpec,
};
use crate::error::{codes, CommandError, CommandResult};
use crate::session::{SessionData, SessionDataHandler};
use crate::watcher::{DeviceInfoWatcher, WatcherEvent};

const GREETING: &str = "uiserverd ready, pleased to meet you";

/// Shared collaborators handed to every connection.
pub struct Services {
    pub config: Arc<UiServerConfig>,
    pub engine: Arc<dyn CryptoEngine>,
    pub resolver: Arc<dyn CertificateResolver>,
    pub sessions: Arc<SessionDataHandler>,
}

// ============================================================================
// Connection state
// ============================================================================

/// One SENDER or RECIPIENT line. `--info` marks an address that only
/// informs certificate resolution and does not count as a real party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub address: String,
    pub informative: bool,
}

/// State the builtin commands collect ahead of an operation.
#[derive(Default)]
pub struct ConnState {
    pub inputs: Vec<IoSpec>,
    pub outputs: Vec<IoSpec>,
    pub messages: Vec<IoSpec>,
    pub files: Vec<PathBuf>,
    pub senders: Vec<Contact>,
    pub recipients: Vec<Contact>,
    pub options: HashMap<String, Option<String>>,
    pub session_id: Option<u32>,
    pub session_title: Option<String>,
}

impl ConnState {
    pub fn real_senders(&self) -> Vec<String> {
        self.senders
            .iter()
            .filter(|c| !c.informative)
            .map(|c| c.address.clone())
            .collect()
    }

    pub fn real_recipients(&self) -> Vec<String> {
        self.recipients
            .iter()
            .filter(|c| !c.informative)
            .map(|c| c.address.clone())
            .collect()
    }

    /// All sender addresses, informative ones included. Senders only
    /// ever hint at resolution, so they all count there.
    pub fn all_senders(&self) -> Vec<String> {
        self.senders.iter().map(|c| c.address.clone()).collect()
    }

    /// Drops what a single command consumes. Options and the session
    /// binding survive until RESET.
    fn clear_command_state(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
        self.messages.clear();
        self.files.clear();
        self.senders.clear();
        self.recipients.clear();
    }
}

pub struct Connection {
    lines: UnboundedReceiver<String>,
    writer: OwnedWriteHalf,
    pub(crate) services: Arc<Services>,
    pub(crate) state: ConnState,
    closing: bool,
}

impl Connection {
    pub(crate) fn new(stream: UnixStream, services: Arc<Services>) -> Connection {
        let (read_half, writer) = stream.into_split();
        Connection {
            lines: spawn_reader(read_half),
            writer,
            services,
            state: ConnState::default(),
            closing: false,
        }
    }

    pub fn engine(&self) -> Arc<dyn CryptoEngine> {
        Arc::clone(&self.services.engine)
    }

    pub fn resolver(&self) -> Arc<dyn CertificateResolver> {
        Arc::clone(&self.services.resolver)
    }

    pub fn config(&self) -> &UiServerConfig {
        &self.services.config
    }

    pub fn session_data(&self) -> Option<Arc<SessionData>> {
        self.state
            .session_id
            .map(|id| self.services.sessions.session_data(id))
    }

    pub fn session_title(&self) -> Option<String> {
        self.state
            .session_title
            .clone()
            .or_else(|| self.session_data().and_then(|data| data.title()))
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    pub async fn send_status(&mut self, keyword: &str, payload: &str) -> CommandResult<()> {
        let line = assuan::status_line(keyword, payload);
        self.write_line(&line).await?;
        Ok(())
    }

    pub async fn send_data(&mut self, data: &[u8]) -> CommandResult<()> {
        for line in assuan::data_lines(data) {
            self.write_line(&line).await?;
        }
        Ok(())
    }

    /// Asks the client for data. `None` means the client answered CAN.
    pub async fn inquire(&mut self, keyword: &str) -> CommandResult<Option<Vec<u8>>> {
        let line = assuan::inquire_line(keyword);
        self.write_line(&line).await?;
        let mut collected = Vec::new();
        loop {
            let Some(line) = self.lines.recv().await else {
                self.closing = true;
                return Err(CommandError::new(
                    codes::GENERAL,
                    "connection closed during inquire",
                ));
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match assuan::parse_inquire_reply(trimmed) {
                Ok(InquireReply::Data(mut chunk)) => collected.append(&mut chunk),
                Ok(InquireReply::End) => return Ok(Some(collected)),
                Ok(InquireReply::Can) => return Ok(None),
                Err(err) => {
                    return Err(CommandError::new(
                        codes::ASS_SYNTAX,
                        format!("bad inquire reply: {err}"),
                    ))
                }
            }
        }
    }

    /// Waits for the next controller event while keeping an eye on the
    /// wire: CAN and BYE from the client invoke `cancel`, which makes
    /// the controller settle with a canceled error. Further commands
    /// are refused until the running one settles.
    pub async fn next_controller_event(
        &mut self,
        rx: &mut UnboundedReceiver<ControllerEvent>,
        cancel: &(dyn Fn() + Send + Sync),
    ) -> CommandResult<ControllerEvent> {
        loop {
            if self.closing {
                return rx.recv().await.ok_or_else(|| {
                    CommandError::new(
                        codes::INTERNAL,
                        "controller went away without a terminal event",
                    )
                });
            }
            tokio::select! {
                event = rx.recv() => {
                    return event.ok_or_else(|| CommandError::new(
                        codes::INTERNAL,
                        "controller went away without a terminal event",
                    ));
                }
                line = self.lines.recv() => match line {
                    None => {
                        self.closing = true;
                        cancel();
                    }
                    Some(line) => {
                        let word = line.trim().to_ascii_uppercase();
                        if word == "CAN" {
                            debug!("client canceled the running command");
                            cancel();
                        } else if word == "BYE" {
                            self.closing = true;
                            cancel();
                        } else if !word.is_empty() && !word.starts_with('#') {
                            warn!("rejecting {word} while a command is running");
                            self.write_line(&assuan::err_line(
                                codes::ASS_NESTED_COMMANDS,
                                "Still processing previous command",
                            ))
                            .await?;
                        }
                    }
                }
            }
        }
    }

    pub(crate) async fn serve(mut self, registry: Arc<CommandRegistry>) {
        let greeting = assuan::ok_line(Some(GREETING));
        if self.write_line(&greeting).await.is_err() {
            return;
        }
        while !self.closing {
            let Some(line) = self.lines.recv().await else {
                break;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let request = match Request::parse(trimmed) {
                Ok(request) => request,
                Err(err) => {
                    let code = match err {
                        AssuanError::LineTooLong => codes::ASS_LINE_TOO_LONG,
                        _ => codes::ASS_SYNTAX,
                    };
                    if self
                        .write_line(&assuan::err_line(code, &err.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };
            let reply = match self.dispatch(&registry, &request).await {
                Ok(note) => assuan::ok_line(note.as_deref()),
                Err(err) => {
                    debug!("{} failed: {} ({})", request.name, err.message, err.code);
                    assuan::err_line(err.code, &err.message)
                }
            };
            if self.write_line(&reply).await.is_err() {
                break;
            }
        }
        if let Some(id) = self.state.session_id.take() {
            self.services.sessions.exit_session(id);
        }
        debug!("connection closed");
    }

    async fn dispatch(
        &mut self,
        registry: &CommandRegistry,
        request: &Request,
    ) -> CommandResult<Option<String>> {
        match request.name.as_str() {
            "INPUT" => {
                let spec = parse_io_spec(request)?;
                self.state.inputs.push(spec);
                Ok(None)
            }
            "OUTPUT" => {
                let spec = parse_io_spec(request)?;
                self.state.outputs.push(spec);
                Ok(None)
            }
            "MESSAGE" => {
                let spec = parse_io_spec(request)?;
                self.state.messages.push(spec);
                Ok(None)
            }
            "FILE" => {
                let Some(path) = request.positional().first() else {
                    return Err(CommandError::new(codes::MISSING_VALUE, "No file given"));
                };
                let path = PathBuf::from(path);
                if !path.is_absolute() {
                    return Err(CommandError::new(
                        codes::INV_ARG,
                        "Only absolute file paths are allowed",
                    ));
                }
                self.state.files.push(path);
                Ok(None)
            }
            "SENDER" | "RECIPIENT" => {
                let address = request.positional_joined();
                if address.is_empty() {
                    return Err(CommandError::new(codes::MISSING_VALUE, "No address given"));
                }
                let contact = Contact {
                    address,
                    informative: request.has_option("info"),
                };
                if request.name == "SENDER" {
                    self.state.senders.push(contact);
                } else {
                    self.state.recipients.push(contact);
                }
                Ok(None)
            }
            "OPTION" => {
                let raw = request.rest.trim().trim_start_matches("--");
                if raw.is_empty() {
                    return Err(CommandError::new(
                        codes::MISSING_VALUE,
                        "No option name given",
                    ));
                }
                let (name, value) = match assuan::split_keyval(raw) {
                    Some((name, value)) => (name, Some(value.to_owned())),
                    None => (raw, None),
                };
                self.state
                    .options
                    .insert(name.trim().to_ascii_lowercase(), value);
                Ok(None)
            }
            "SESSION" => {
                let Some(token) = request.positional().first() else {
                    return Err(CommandError::new(
                        codes::MISSING_VALUE,
                        "No session id given",
                    ));
                };
                let id: u32 = token
                    .parse()
                    .ok()
                    .filter(|id| *id > 0)
                    .ok_or_else(|| {
                        CommandError::new(codes::ASS_PARAMETER, "Invalid session id")
                    })?;
                let title = {
                    let rest = request.positional()[1..].join(" ");
                    (!rest.is_empty()).then_some(rest)
                };
                if self.state.session_id != Some(id) {
                    if let Some(old) = self.state.session_id.take() {
                        self.services.sessions.exit_session(old);
                    }
                    self.services.sessions.enter_session(id);
                }
                self.state.session_id = Some(id);
                self.state.session_title = title.clone();
                if title.is_some() {
                    self.services.sessions.session_data(id).set_title(title);
                }
                Ok(None)
            }
            "RESET" => {
                if let Some(id) = self.state.session_id.take() {
                    self.services.sessions.exit_session(id);
                }
                self.state = ConnState::default();
                Ok(None)
            }
            "BYE" => {
                self.closing = true;
                Ok(Some("closing connection".to_string()))
            }
            "NOP" => Ok(None),
            "CAN" => Err(CommandError::new(codes::UNEXPECTED, "Nothing to cancel")),
            name => match registry.get(name) {
                Some(handler) => {
                    debug!("dispatching {name}");
                    let result = handler.run(self, request).await;
                    self.state.clear_command_state();
                    result.map(|()| None)
                }
                None => Err(CommandError::new(
                    codes::ASS_UNKNOWN_CMD,
                    format!("Unknown command {name}"),
                )),
            },
        }
    }
}

fn spawn_reader(read_half: OwnedReadHalf) -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']).to_owned();
                    if tx.send(trimmed).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!("connection read failed: {err}");
                    break;
                }
            }
        }
    });
    rx
}

/// INPUT/OUTPUT/MESSAGE argument: only FILE=<absolute path> is
/// supported, descriptor passing is not available here.
fn parse_io_spec(request: &Request) -> CommandResult<IoSpec> {
    for token in request.positional() {
        if let Some((key, value)) = assuan::split_keyval(token) {
            match key.to_ascii_uppercase().as_str() {
                "FILE" => {
                    let path = PathBuf::from(value);
                    if !path.is_absolute() {
                        return Err(CommandError::new(
                            codes::INV_ARG,
                            "Only absolute file paths are allowed",
                        ));
                    }
                    return Ok(IoSpec::new(path));
                }
                "FD" => {
                    return Err(CommandError::new(
                        codes::NOT_IMPLEMENTED,
                        "FD passing is not supported, use FILE=",
                    ))
                }
                _ => {}
            }
        } else if token.eq_ignore_ascii_case("FD") {
            return Err(CommandError::new(
                codes::NOT_IMPLEMENTED,
                "FD passing is not supported, use FILE=",
            ));
        }
    }
    Err(CommandError::new(
        codes::MISSING_VALUE,
        "FILE=<path> argument missing",
    ))
}

// ============================================================================
// Peer verification
// ============================================================================

#[cfg(target_os = "linux")]
fn verify_peer(stream: &UnixStream) -> Result<()> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    let creds = getsockopt(&stream.as_fd(), PeerCredentials)
        .context("cannot read peer credentials")?;
    let own = nix::unistd::getuid().as_raw();
    if creds.uid() != own {
        bail!("unauthorized peer: expected uid {own}, got {}", creds.uid());
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn verify_peer(stream: &UnixStream) -> Result<()> {
    use nix::sys::socket::{getsockopt, sockopt::LocalPeerCred};
    let creds = getsockopt(&stream.as_fd(), LocalPeerCred)
        .context("cannot read peer credentials")?;
    let own = nix::unistd::getuid().as_raw();
    if creds.uid() != own {
        bail!("unauthorized peer: expected uid {own}, got {}", creds.uid());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn verify_peer(_stream: &UnixStream) -> Result<()> {
    Ok(())
}

// ============================================================================
// Server
// ============================================================================

pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn new() -> ShutdownSignal {
        ShutdownSignal {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

pub struct UiServer {
    services: Arc<Services>,
    registry: Arc<CommandRegistry>,
    listener: UnixListener,
    socket_path: PathBuf,
    shutdown: Arc<ShutdownSignal>,
}

impl UiServer {
    pub async fn bind(
        config: Arc<UiServerConfig>,
        engine: Arc<dyn CryptoEngine>,
        resolver: Arc<dyn CertificateResolver>,
    ) -> Result<UiServer> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create {}", config.data_dir.display()))?;
        let socket_path = config.socket_path();
        if socket_path.exists() {
            match UnixStream::connect(&socket_path).await {
                Ok(_) => bail!(
                    "another instance is already listening on {}",
                    socket_path.display()
                ),
                Err(_) => {
                    debug!("removing stale socket {}", socket_path.display());
                    std::fs::remove_file(&socket_path).with_context(|| {
                        format!("cannot remove stale socket {}", socket_path.display())
                    })?;
                }
            }
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("cannot bind {}", socket_path.display()))?;

        // Owner only, like the other GnuPG sockets.
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        let sessions = SessionDataHandler::new(&config.sessions);
        let services = Arc::new(Services {
            config,
            engine,
            resolver,
            sessions,
        });
        info!("listening on {}", socket_path.display());
        Ok(UiServer {
            services,
            registry: Arc::new(CommandRegistry::with_builtins()),
            listener,
            socket_path,
            shutdown: Arc::new(ShutdownSignal::new()),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.shutdown)
    }

    /// Accept loop. Runs until the shutdown signal fires.
    pub async fn run(self) -> Result<()> {
        let watcher = if self.services.config.watcher.enabled {
            let transport = Arc::new(GpgAgentTransport::new(
                self.services.config.agent.gpgconf.clone(),
            ));
            let (watcher, events) =
                DeviceInfoWatcher::start(&self.services.config.watcher, transport);
            tokio::spawn(forward_watcher_events(events, Arc::clone(&self.services)));
            Some(watcher)
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = self.shutdown.notify.notified() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => match verify_peer(&stream) {
                        Ok(()) => {
                            let conn = Connection::new(stream, Arc::clone(&self.services));
                            tokio::spawn(conn.serve(Arc::clone(&self.registry)));
                        }
                        Err(err) => warn!("rejecting connection: {err}"),
                    },
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
            if self.shutdown.flag.load(Ordering::SeqCst) {
                break;
            }
        }

        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        info!("server stopped");
        Ok(())
    }
}

async fn forward_watcher_events(
    mut events: UnboundedReceiver<WatcherEvent>,
    services: Arc<Services>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WatcherEvent::Status { payload } => info!("smartcard status: {payload}"),
            WatcherEvent::AgentStartRequested => {
                if !services.config.agent.autostart {
                    debug!("gpg-agent autostart disabled");
                    continue;
                }
                if agent_is_running() {
                    debug!("gpg-agent already running, not launching");
                    continue;
                }
                match launch_agent(&services.config.agent.gpgconf).await {
                    Ok(()) => info!("gpg-agent launched"),
                    Err(err) => warn!("cannot launch gpg-agent: {err}"),
                }
            }
        }
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) fn test_services(
    engine: Arc<dyn CryptoEngine>,
    resolver: Arc<dyn CertificateResolver>,
) -> Arc<Services> {
    let config = Arc::new(UiServerConfig::default_with_dir(&std::env::temp_dir()));
    let sessions = SessionDataHandler::new(&config.sessions);
    Arc::new(Services {
        config,
        engine,
        resolver,
        sessions,
    })
}

#[cfg(test)]
pub(crate) fn test_connection(services: Arc<Services>) -> (Connection, UnixStream) {
    let (ours, theirs) = UnixStream::pair().expect("socketpair");
    (Connection::new(ours, services), theirs)
}
