//! Boundaries to the crypto backend and to gpg-agent.
//!
//! The daemon itself never touches key material. Signing, encryption
//! and verification are delegated to a [`CryptoEngine`], certificate
//! lookup and user confirmation to a [`CertificateResolver`], and card
//! event monitoring to an [`AgentTransport`]. Production deployments
//! plug their backend in through these traits; the bundled
//! implementations are the null engine (refuses crypto work) and the
//! gpg-agent transport.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;

use crate::assuan::{parse_server_line, ServerLine};
use crate::error::{codes, CommandError};

// ============================================================================
// Common types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    OpenPgp,
    Cms,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenPgp => "OpenPGP",
            Protocol::Cms => "CMS",
        }
    }
}

impl FromStr for Protocol {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openpgp" => Ok(Protocol::OpenPgp),
            "cms" => Ok(Protocol::Cms),
            other => Err(CommandError::new(
                codes::INV_VALUE,
                format!("Invalid protocol \"{other}\""),
            )),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A certificate as the resolver hands it back. Carries just enough for
/// scheduling and reporting; the engine resolves fingerprints itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub fingerprint: String,
    pub user_id: String,
    pub protocol: Protocol,
    pub can_sign: bool,
    pub can_encrypt: bool,
    pub has_secret_key: bool,
}

/// A file-backed data source or sink of one crypto operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSpec {
    pub path: PathBuf,
    pub label: Option<String>,
}

impl IoSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        IoSpec {
            path: path.into(),
            label: None,
        }
    }

    /// Human readable name used in logs and error messages.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self.path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Sign { detached: bool },
    Encrypt,
    SignEncrypt,
    Decrypt,
    Verify,
    DecryptVerify,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Sign { .. } => "sign",
            TaskKind::Encrypt => "encrypt",
            TaskKind::SignEncrypt => "sign+encrypt",
            TaskKind::Decrypt => "decrypt",
            TaskKind::Verify => "verify",
            TaskKind::DecryptVerify => "decrypt+verify",
        }
    }
}

/// Everything the engine needs to run one atomic operation.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub protocol: Protocol,
    pub input: IoSpec,
    pub output: Option<IoSpec>,
    /// Signed text for detached verification.
    pub message: Option<IoSpec>,
    /// Non-empty for archive operations: the files to pack before the
    /// actual crypto step. `input.path` is their base directory then.
    pub archive_files: Vec<PathBuf>,
    pub signers: Vec<Certificate>,
    pub recipients: Vec<Certificate>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub audit_log: Option<String>,
    pub verification: Option<VerificationResult>,
}

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub all_valid: bool,
    pub signers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportResult {
    pub considered: u32,
    pub imported: u32,
    pub unchanged: u32,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine: {message}")]
    Failed { code: u32, message: String },

    #[error("engine: canceled")]
    Canceled,

    #[error("engine: backend unavailable: {0}")]
    Unavailable(String),
}

impl From<EngineError> for CommandError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Failed { code, message } => CommandError::new(code, message),
            EngineError::Canceled => CommandError::canceled(),
            EngineError::Unavailable(detail) => CommandError::new(codes::INTERNAL, detail),
        }
    }
}

/// The actual crypto backend.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    async fn execute(&self, spec: TaskSpec) -> Result<TaskOutput, EngineError>;

    async fn import_certificates(&self, files: &[PathBuf]) -> Result<ImportResult, EngineError>;
}

/// Engine used when no backend is configured: every operation is
/// refused, which surfaces as an INTERNAL error on the wire.
pub struct NullEngine;

#[async_trait]
impl CryptoEngine for NullEngine {
    async fn execute(&self, _spec: TaskSpec) -> Result<TaskOutput, EngineError> {
        Err(EngineError::Unavailable(
            "no crypto backend configured".to_owned(),
        ))
    }

    async fn import_certificates(&self, _files: &[PathBuf]) -> Result<ImportResult, EngineError> {
        Err(EngineError::Unavailable(
            "no crypto backend configured".to_owned(),
        ))
    }
}

// ============================================================================
// Certificate resolution
// ============================================================================

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resolve: canceled by user")]
    Canceled,

    #[error("resolve: {0}")]
    Failed(String),
}

impl From<ResolveError> for CommandError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Canceled => CommandError::canceled(),
            ResolveError::Failed(detail) => CommandError::new(codes::GENERAL, detail),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub protocol: Option<Protocol>,
    pub senders: Vec<String>,
    pub recipients: Vec<String>,
    pub signing: bool,
    pub encrypting: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedCertificates {
    pub protocol: Protocol,
    pub signers: Vec<Certificate>,
    pub recipients: Vec<Certificate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateUsage {
    SignOnly,
    EncryptOnly,
    AnyUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateFormat {
    OpenPgpOnly,
    CmsOnly,
    AnyFormat,
}

/// Constraints for an interactive certificate selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionFilter {
    pub multiple: bool,
    pub usage: CertificateUsage,
    pub format: CertificateFormat,
    pub secret_only: bool,
}

impl SelectionFilter {
    pub fn matches(&self, cert: &Certificate) -> bool {
        let usage_ok = match self.usage {
            CertificateUsage::SignOnly => cert.can_sign,
            CertificateUsage::EncryptOnly => cert.can_encrypt,
            CertificateUsage::AnyUsage => true,
        };
        let format_ok = match self.format {
            CertificateFormat::OpenPgpOnly => cert.protocol == Protocol::OpenPgp,
            CertificateFormat::CmsOnly => cert.protocol == Protocol::Cms,
            CertificateFormat::AnyFormat => true,
        };
        usage_ok && format_ok && (!self.secret_only || cert.has_secret_key)
    }
}

/// Resolves mail addresses to certificates, asking the user where the
/// deployment provides a way to do so.
#[async_trait]
pub trait CertificateResolver: Send + Sync {
    async fn resolve(&self, request: ResolveRequest) -> Result<ResolvedCertificates, ResolveError>;

    async fn select_certificates(
        &self,
        filter: SelectionFilter,
        preselected: Vec<String>,
    ) -> Result<Vec<Certificate>, ResolveError>;
}

/// Resolver used when none is configured.
pub struct NullCertificateResolver;

#[async_trait]
impl CertificateResolver for NullCertificateResolver {
    async fn resolve(
        &self,
        _request: ResolveRequest,
    ) -> Result<ResolvedCertificates, ResolveError> {
        Err(ResolveError::Failed(
            "no certificate resolver configured".to_owned(),
        ))
    }

    async fn select_certificates(
        &self,
        _filter: SelectionFilter,
        _preselected: Vec<String>,
    ) -> Result<Vec<Certificate>, ResolveError> {
        Err(ResolveError::Failed(
            "no certificate resolver configured".to_owned(),
        ))
    }
}

// ============================================================================
// Agent transport
// ============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("agent: connect failed: {0}")]
    ConnectFailed(String),

    #[error("agent: broken pipe")]
    BrokenPipe,

    #[error("agent: protocol error: {0}")]
    Protocol(String),
}

/// One protocol event on a running watch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchStep {
    Status { keyword: String, payload: String },
    /// The command finished; code 0 means a clean end of transaction.
    Finished { code: u32, description: String },
}

/// Client side connection factory towards gpg-agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn AgentWatch>, TransportError>;
}

/// A connected context with a long-running command on it.
#[async_trait]
pub trait AgentWatch: Send {
    async fn start(&mut self, command: &str) -> Result<(), TransportError>;

    async fn next(&mut self) -> Result<WatchStep, TransportError>;

    /// Best effort abort of the running command before teardown.
    async fn cancel(&mut self);
}

/// Talks libassuan to the real gpg-agent over its Unix socket.
pub struct GpgAgentTransport {
    gpgconf: PathBuf,
}

impl GpgAgentTransport {
    pub fn new(gpgconf: impl Into<PathBuf>) -> Self {
        GpgAgentTransport {
            gpgconf: gpgconf.into(),
        }
    }

    async fn socket_path(&self) -> Result<PathBuf, TransportError> {
        let output = Command::new(&self.gpgconf)
            .args(["--list-dirs", "agent-socket"])
            .output()
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("gpgconf: {e}")))?;
        if !output.status.success() {
            return Err(TransportError::ConnectFailed(
                "gpgconf --list-dirs failed".to_owned(),
            ));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if path.is_empty() {
            return Err(TransportError::ConnectFailed(
                "gpgconf reported no agent socket".to_owned(),
            ));
        }
        Ok(PathBuf::from(path))
    }
}

#[async_trait]
impl AgentTransport for GpgAgentTransport {
    async fn connect(&self) -> Result<Box<dyn AgentWatch>, TransportError> {
        let path = self.socket_path().await?;
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", path.display())))?;
        let mut watch = GpgAgentWatch {
            stream: BufReader::new(stream),
            line: String::new(),
        };
        // The agent greets with an OK line before accepting commands.
        match watch.read_server_line().await? {
            ServerLine::Ok(_) => Ok(Box::new(watch)),
            other => Err(TransportError::Protocol(format!(
                "unexpected greeting: {other:?}"
            ))),
        }
    }
}

struct GpgAgentWatch {
    stream: BufReader<UnixStream>,
    line: String,
}

impl GpgAgentWatch {
    async fn read_server_line(&mut self) -> Result<ServerLine, TransportError> {
        loop {
            self.line.clear();
            let n = self
                .stream
                .read_line(&mut self.line)
                .await
                .map_err(io_to_transport)?;
            if n == 0 {
                return Err(TransportError::BrokenPipe);
            }
            match parse_server_line(&self.line) {
                Ok(ServerLine::Comment(_)) => continue,
                Ok(line) => return Ok(line),
                Err(e) => return Err(TransportError::Protocol(e.to_string())),
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(io_to_transport)
    }
}

fn io_to_transport(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset => TransportError::BrokenPipe,
        _ => TransportError::Protocol(err.to_string()),
    }
}

#[async_trait]
impl AgentWatch for GpgAgentWatch {
    async fn start(&mut self, command: &str) -> Result<(), TransportError> {
        self.write_line(command).await
    }

    async fn next(&mut self) -> Result<WatchStep, TransportError> {
        loop {
            match self.read_server_line().await? {
                ServerLine::Status { keyword, payload } => {
                    return Ok(WatchStep::Status { keyword, payload });
                }
                ServerLine::Ok(_) => {
                    return Ok(WatchStep::Finished {
                        code: 0,
                        description: String::new(),
                    });
                }
                ServerLine::Err { code, description } => {
                    return Ok(WatchStep::Finished { code, description });
                }
                // We never answer inquiries on a watch connection.
                ServerLine::Inquire(_) => self.write_line("END").await?,
                ServerLine::Data(_) | ServerLine::Comment(_) => continue,
            }
        }
    }

    async fn cancel(&mut self) {
        let _ = self.write_line("BYE").await;
    }
}

// ============================================================================
// Agent process helpers
// ============================================================================

/// Check whether a gpg-agent process is alive on this machine.
pub fn agent_is_running() -> bool {
    let sys = sysinfo::System::new_all();
    sys.processes()
        .values()
        .any(|p| p.name().eq_ignore_ascii_case("gpg-agent"))
}

/// Ask gpgconf to launch the agent. Failure is logged, not fatal; the
/// watcher keeps retrying on its own schedule either way.
pub async fn launch_agent(gpgconf: &Path) -> anyhow::Result<()> {
    let status = Command::new(gpgconf)
        .args(["--launch", "gpg-agent"])
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("gpgconf --launch gpg-agent exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse_is_case_insensitive() {
        assert_eq!("OpenPGP".parse::<Protocol>().unwrap(), Protocol::OpenPgp);
        assert_eq!("cms".parse::<Protocol>().unwrap(), Protocol::Cms);
        let err = "smime".parse::<Protocol>().unwrap_err();
        assert_eq!(err.code, codes::INV_VALUE);
    }

    #[test]
    fn selection_filter_matches_usage_and_format() {
        let cert = Certificate {
            fingerprint: "AB12".into(),
            user_id: "alice@example.net".into(),
            protocol: Protocol::OpenPgp,
            can_sign: true,
            can_encrypt: false,
            has_secret_key: true,
        };
        let sign_only = SelectionFilter {
            multiple: false,
            usage: CertificateUsage::SignOnly,
            format: CertificateFormat::AnyFormat,
            secret_only: true,
        };
        assert!(sign_only.matches(&cert));

        let encrypt_cms = SelectionFilter {
            multiple: true,
            usage: CertificateUsage::EncryptOnly,
            format: CertificateFormat::CmsOnly,
            secret_only: false,
        };
        assert!(!encrypt_cms.matches(&cert));
    }

    #[tokio::test]
    async fn null_engine_refuses_work() {
        let engine = NullEngine;
        let spec = TaskSpec {
            kind: TaskKind::Encrypt,
            protocol: Protocol::OpenPgp,
            input: IoSpec::new("/tmp/in"),
            output: Some(IoSpec::new("/tmp/out")),
            message: None,
            archive_files: Vec::new(),
            signers: Vec::new(),
            recipients: Vec::new(),
        };
        let err = engine.execute(spec).await.unwrap_err();
        let cmd_err = CommandError::from(err);
        assert_eq!(cmd_err.code, codes::INTERNAL);
    }
}
