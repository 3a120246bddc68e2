//! Controller behind the *_FILES signing and encryption commands.
//!
//! File managers hand over a list of paths and an operation mode built
//! from the sign/encrypt bit pairs below. Certificates are resolved
//! first (interactively, through the configured resolver), then one
//! task runs per file, or a single archive task when archiving is
//! forced.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::{run_scheduled, ControllerEvent, EventPort};
use crate::engine::{
    CertificateResolver, CryptoEngine, IoSpec, Protocol, ResolveError, ResolveRequest, TaskKind,
    TaskSpec,
};
use crate::error::{codes, CommandError, CommandResult};
use crate::task::{Task, TaskResult};

/// Operation mode bits. The sign pair and the encrypt pair each encode
/// disallowed (0), allowed and preselected.
pub mod operation {
    pub const SIGN_DISALLOWED: u32 = 0;
    pub const SIGN_ALLOWED: u32 = 1;
    pub const SIGN_SELECTED: u32 = 2;
    pub const SIGN_MASK: u32 = 3;

    pub const ENCRYPT_DISALLOWED: u32 = 0;
    pub const ENCRYPT_ALLOWED: u32 = 4;
    pub const ENCRYPT_SELECTED: u32 = 8;
    pub const ENCRYPT_MASK: u32 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Pack all inputs into one archive before the crypto step.
    Forced,
    /// Per-file outputs; an archive would merely be permitted.
    Allowed,
}

pub struct SignEncryptFilesController {
    inner: Arc<FilesInner>,
}

struct FilesInner {
    engine: Arc<dyn CryptoEngine>,
    resolver: Arc<dyn CertificateResolver>,
    port: EventPort,
    state: Mutex<FilesState>,
}

struct FilesState {
    operation: u32,
    archive: ArchiveMode,
    protocol: Option<Protocol>,
    files: Vec<PathBuf>,
    session_title: Option<String>,
    results: Vec<TaskResult>,
    work_handle: Option<JoinHandle<()>>,
    started: bool,
    canceled: bool,
}

impl SignEncryptFilesController {
    pub fn new(engine: Arc<dyn CryptoEngine>, resolver: Arc<dyn CertificateResolver>) -> Self {
        SignEncryptFilesController {
            inner: Arc::new(FilesInner {
                engine,
                resolver,
                port: EventPort::new(),
                state: Mutex::new(FilesState {
                    operation: operation::SIGN_ALLOWED | operation::ENCRYPT_ALLOWED,
                    archive: ArchiveMode::Allowed,
                    protocol: None,
                    files: Vec::new(),
                    session_title: None,
                    results: Vec::new(),
                    work_handle: None,
                    started: false,
                    canceled: false,
                }),
            }),
        }
    }

    pub fn connect(&self, sender: UnboundedSender<ControllerEvent>) {
        self.inner.port.connect(sender);
    }

    pub fn set_operation_mode(&self, operation: u32) -> CommandResult<()> {
        use operation::*;
        let sign = operation & SIGN_MASK;
        let encrypt = operation & ENCRYPT_MASK;
        if operation & !(SIGN_MASK | ENCRYPT_MASK) != 0
            || sign == SIGN_MASK
            || encrypt == ENCRYPT_MASK
            || (sign == SIGN_DISALLOWED && encrypt == ENCRYPT_DISALLOWED)
        {
            return Err(CommandError::new(
                codes::INV_ARG,
                "invalid sign/encrypt operation mode",
            ));
        }
        self.inner.state.lock().unwrap().operation = operation;
        Ok(())
    }

    pub fn operation_mode(&self) -> u32 {
        self.inner.state.lock().unwrap().operation
    }

    pub fn set_archive_mode(&self, mode: ArchiveMode) {
        self.inner.state.lock().unwrap().archive = mode;
    }

    pub fn set_protocol(&self, protocol: Option<Protocol>) {
        self.inner.state.lock().unwrap().protocol = protocol;
    }

    pub fn set_session_title(&self, title: Option<String>) {
        self.inner.state.lock().unwrap().session_title = title;
    }

    pub fn set_files(&self, files: Vec<PathBuf>) -> CommandResult<()> {
        if files.is_empty() {
            return Err(CommandError::new(codes::INV_ARG, "No files given"));
        }
        self.inner.state.lock().unwrap().files = files;
        Ok(())
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.inner.state.lock().unwrap().results.clone()
    }

    /// Resolve certificates and run the whole batch. Terminal outcome
    /// arrives on the connected event queue.
    pub fn start(&self) -> CommandResult<()> {
        let (request, signing, encrypting) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.started {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "operation already started",
                ));
            }
            if state.files.is_empty() {
                return Err(CommandError::new(codes::INV_ARG, "No files given"));
            }
            state.started = true;

            let signing = state.operation & operation::SIGN_MASK == operation::SIGN_SELECTED;
            let encrypting =
                state.operation & operation::ENCRYPT_MASK == operation::ENCRYPT_SELECTED;
            (
                ResolveRequest {
                    protocol: state.protocol,
                    senders: Vec::new(),
                    recipients: Vec::new(),
                    signing,
                    encrypting,
                },
                signing,
                encrypting,
            )
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let resolved = match inner.resolver.resolve(request).await {
                Ok(resolved) => resolved,
                Err(ResolveError::Canceled) => {
                    inner.port.settle_error(codes::CANCELED, "User canceled");
                    return;
                }
                Err(err) => {
                    inner.port.settle_error(codes::GENERAL, err.to_string());
                    return;
                }
            };
            inner.port.emit_resolved();

            let tasks = {
                let mut state = inner.state.lock().unwrap();
                state.protocol = Some(resolved.protocol);
                build_tasks(
                    &state.files,
                    state.archive,
                    resolved.protocol,
                    signing,
                    encrypting,
                    &resolved.signers,
                    &resolved.recipients,
                    state.session_title.as_deref(),
                )
            };
            debug!("file batch resolved to {} task(s)", tasks.len());

            let (results, first_error) = run_scheduled(Arc::clone(&inner.engine), tasks).await;
            inner.state.lock().unwrap().results.extend(results);
            match first_error {
                Some(err) => inner.port.settle_error(err.code, err.message),
                None => inner.port.settle_done(),
            }
        });
        self.inner.state.lock().unwrap().work_handle = Some(handle);
        Ok(())
    }

    pub fn cancel(&self) {
        let handle = {
            let mut state = self.inner.state.lock().unwrap();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.work_handle.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.port.settle_error(codes::CANCELED, "User canceled");
    }
}

#[allow(clippy::too_many_arguments)]
fn build_tasks(
    files: &[PathBuf],
    archive: ArchiveMode,
    protocol: Protocol,
    signing: bool,
    encrypting: bool,
    signers: &[crate::engine::Certificate],
    recipients: &[crate::engine::Certificate],
    session_title: Option<&str>,
) -> Vec<Task> {
    let kind = if signing && encrypting {
        TaskKind::SignEncrypt
    } else if encrypting {
        TaskKind::Encrypt
    } else {
        // Plain file signing produces a detached signature.
        TaskKind::Sign { detached: true }
    };

    if archive == ArchiveMode::Forced {
        let base = files
            .first()
            .and_then(|f| f.parent())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S");
        let output = base.join(format!(
            "archive-{stamp}.tar.{}",
            output_extension(protocol, encrypting)
        ));
        let mut input = IoSpec::new(base.clone());
        input.label = Some(
            session_title
                .map(str::to_owned)
                .unwrap_or_else(|| format!("archive of {} file(s)", files.len())),
        );
        return vec![Task::new(TaskSpec {
            kind,
            protocol,
            input,
            output: Some(IoSpec::new(output)),
            message: None,
            archive_files: files.to_vec(),
            signers: signers.to_vec(),
            recipients: recipients.to_vec(),
        })];
    }

    files
        .iter()
        .map(|file| {
            let mut input = IoSpec::new(file.clone());
            if input.label.is_none() {
                input.label = session_title.map(str::to_owned);
            }
            let output = IoSpec::new(append_extension(
                file,
                output_extension(protocol, encrypting),
            ));
            Task::new(TaskSpec {
                kind,
                protocol,
                input,
                output: Some(output),
                message: None,
                archive_files: Vec::new(),
                signers: signers.to_vec(),
                recipients: recipients.to_vec(),
            })
        })
        .collect()
}

fn output_extension(protocol: Protocol, encrypting: bool) -> &'static str {
    match (protocol, encrypting) {
        (Protocol::OpenPgp, true) => "gpg",
        (Protocol::OpenPgp, false) => "sig",
        (Protocol::Cms, true) => "p7m",
        (Protocol::Cms, false) => "p7s",
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        Certificate, EngineError, ImportResult, ResolvedCertificates, SelectionFilter, TaskOutput,
    };
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn cert(fpr: &str, protocol: Protocol, secret: bool) -> Certificate {
        Certificate {
            fingerprint: fpr.to_owned(),
            user_id: format!("{fpr}@example.net"),
            protocol,
            can_sign: true,
            can_encrypt: true,
            has_secret_key: secret,
        }
    }

    struct PickEverything {
        protocol: Protocol,
    }

    #[async_trait]
    impl CertificateResolver for PickEverything {
        async fn resolve(
            &self,
            request: ResolveRequest,
        ) -> Result<ResolvedCertificates, ResolveError> {
            Ok(ResolvedCertificates {
                protocol: self.protocol,
                signers: if request.signing {
                    vec![cert("SELF", self.protocol, true)]
                } else {
                    Vec::new()
                },
                recipients: if request.encrypting {
                    vec![cert("PEER", self.protocol, false)]
                } else {
                    Vec::new()
                },
            })
        }

        async fn select_certificates(
            &self,
            _filter: SelectionFilter,
            _preselected: Vec<String>,
        ) -> Result<Vec<Certificate>, ResolveError> {
            Err(ResolveError::Failed("not used here".into()))
        }
    }

    struct RecordingEngine {
        specs: Mutex<Vec<TaskSpec>>,
    }

    #[async_trait]
    impl CryptoEngine for RecordingEngine {
        async fn execute(&self, spec: TaskSpec) -> Result<TaskOutput, EngineError> {
            self.specs.lock().unwrap().push(spec);
            Ok(TaskOutput::default())
        }

        async fn import_certificates(
            &self,
            _files: &[PathBuf],
        ) -> Result<ImportResult, EngineError> {
            Ok(ImportResult::default())
        }
    }

    fn controller(
        protocol: Protocol,
    ) -> (
        SignEncryptFilesController,
        Arc<RecordingEngine>,
        mpsc::UnboundedReceiver<ControllerEvent>,
    ) {
        let engine = Arc::new(RecordingEngine {
            specs: Mutex::new(Vec::new()),
        });
        let ctl = SignEncryptFilesController::new(
            engine.clone(),
            Arc::new(PickEverything { protocol }),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        ctl.connect(tx);
        (ctl, engine, rx)
    }

    async fn drain_to_terminal(rx: &mut mpsc::UnboundedReceiver<ControllerEvent>) -> ControllerEvent {
        loop {
            match rx.recv().await.expect("controller dropped channel") {
                ControllerEvent::CertificatesResolved => continue,
                terminal => return terminal,
            }
        }
    }

    #[test]
    fn operation_mode_rejects_nonsense() {
        let (ctl, _, _) = controller(Protocol::OpenPgp);
        assert!(ctl
            .set_operation_mode(operation::SIGN_MASK | operation::ENCRYPT_SELECTED)
            .is_err());
        assert!(ctl.set_operation_mode(0).is_err());
        assert!(ctl.set_operation_mode(1 << 6).is_err());
        ctl.set_operation_mode(operation::SIGN_SELECTED | operation::ENCRYPT_ALLOWED)
            .unwrap();
        assert_eq!(
            ctl.operation_mode(),
            operation::SIGN_SELECTED | operation::ENCRYPT_ALLOWED
        );
    }

    #[tokio::test]
    async fn per_file_encryption_names_outputs() {
        let (ctl, engine, mut rx) = controller(Protocol::OpenPgp);
        ctl.set_operation_mode(operation::SIGN_ALLOWED | operation::ENCRYPT_SELECTED)
            .unwrap();
        ctl.set_files(vec!["/docs/a.txt".into(), "/docs/b.pdf".into()])
            .unwrap();
        ctl.start().unwrap();

        assert_eq!(drain_to_terminal(&mut rx).await, ControllerEvent::Done);
        let specs = engine.specs.lock().unwrap();
        assert_eq!(specs.len(), 2);
        let mut outputs: Vec<_> = specs
            .iter()
            .map(|s| s.output.as_ref().unwrap().path.clone())
            .collect();
        outputs.sort();
        assert_eq!(
            outputs,
            vec![PathBuf::from("/docs/a.txt.gpg"), PathBuf::from("/docs/b.pdf.gpg")]
        );
        assert!(specs.iter().all(|s| s.kind == TaskKind::Encrypt));
        assert!(specs.iter().all(|s| s.archive_files.is_empty()));
    }

    #[tokio::test]
    async fn sign_only_produces_detached_signatures() {
        let (ctl, engine, mut rx) = controller(Protocol::Cms);
        ctl.set_operation_mode(operation::SIGN_SELECTED | operation::ENCRYPT_ALLOWED)
            .unwrap();
        ctl.set_files(vec!["/docs/contract.pdf".into()]).unwrap();
        ctl.start().unwrap();

        assert_eq!(drain_to_terminal(&mut rx).await, ControllerEvent::Done);
        let specs = engine.specs.lock().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].kind, TaskKind::Sign { detached: true });
        assert_eq!(
            specs[0].output.as_ref().unwrap().path,
            PathBuf::from("/docs/contract.pdf.p7s")
        );
        assert_eq!(specs[0].signers.len(), 1);
    }

    #[tokio::test]
    async fn forced_archive_packs_everything_into_one_task() {
        let (ctl, engine, mut rx) = controller(Protocol::OpenPgp);
        ctl.set_operation_mode(operation::SIGN_SELECTED | operation::ENCRYPT_SELECTED)
            .unwrap();
        ctl.set_archive_mode(ArchiveMode::Forced);
        ctl.set_files(vec!["/docs/a.txt".into(), "/docs/b.txt".into()])
            .unwrap();
        ctl.start().unwrap();

        assert_eq!(drain_to_terminal(&mut rx).await, ControllerEvent::Done);
        let specs = engine.specs.lock().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].kind, TaskKind::SignEncrypt);
        assert_eq!(specs[0].archive_files.len(), 2);
        let out = specs[0].output.as_ref().unwrap().path.to_string_lossy().into_owned();
        assert!(out.starts_with("/docs/archive-"), "got {out}");
        assert!(out.ends_with(".tar.gpg"), "got {out}");
    }

    #[tokio::test]
    async fn start_twice_is_a_conflict() {
        let (ctl, _, mut rx) = controller(Protocol::OpenPgp);
        ctl.set_operation_mode(operation::SIGN_ALLOWED | operation::ENCRYPT_SELECTED)
            .unwrap();
        ctl.set_files(vec!["/docs/a.txt".into()]).unwrap();
        ctl.start().unwrap();
        let err = ctl.start().unwrap_err();
        assert_eq!(err.code, codes::CONFLICT);
        drain_to_terminal(&mut rx).await;
    }
}
