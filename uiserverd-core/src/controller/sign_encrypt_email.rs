//! Controller behind SIGN, ENCRYPT and their PREP_* variants.
//!
//! The two-phase mail flow works against this type: PREP_ENCRYPT
//! creates it, kicks off certificate resolution and parks it in the
//! session. The later ENCRYPT reattaches, waits for resolution if it is
//! still running and then starts the actual encryption tasks. Signing
//! shares the controller so a mail client preparing sign+encrypt
//! resolves certificates once.

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::{run_scheduled, ControllerEvent, EventPort};
use crate::engine::{
    Certificate, CertificateResolver, CryptoEngine, IoSpec, Protocol, ResolveError,
    ResolveRequest,
};
use crate::error::{codes, CommandError, CommandResult};
use crate::task::{Task, TaskResult};

pub struct SignEncryptEmailController {
    inner: Arc<EmailInner>,
}

struct EmailInner {
    engine: Arc<dyn CryptoEngine>,
    resolver: Arc<dyn CertificateResolver>,
    port: EventPort,
    state: Mutex<EmailState>,
}

#[derive(Default)]
struct EmailState {
    session_title: Option<String>,
    protocol: Option<Protocol>,
    signing: bool,
    encrypting: bool,
    detached: bool,
    resolving: bool,
    resolved: bool,
    canceled: bool,
    signers: Vec<Certificate>,
    recipients: Vec<Certificate>,
    results: Vec<TaskResult>,
    resolve_handle: Option<JoinHandle<()>>,
    exec_handle: Option<JoinHandle<()>>,
}

impl SignEncryptEmailController {
    pub fn new(engine: Arc<dyn CryptoEngine>, resolver: Arc<dyn CertificateResolver>) -> Self {
        SignEncryptEmailController {
            inner: Arc::new(EmailInner {
                engine,
                resolver,
                port: EventPort::new(),
                state: Mutex::new(EmailState::default()),
            }),
        }
    }

    /// Attach the event queue of the command currently driving this
    /// controller, detaching whoever listened before.
    pub fn connect(&self, sender: UnboundedSender<ControllerEvent>) {
        self.inner.port.connect(sender);
    }

    pub fn set_session_title(&self, title: Option<String>) {
        self.inner.state.lock().unwrap().session_title = title;
    }

    pub fn set_signing(&self, signing: bool) {
        self.inner.state.lock().unwrap().signing = signing;
    }

    pub fn is_signing(&self) -> bool {
        self.inner.state.lock().unwrap().signing
    }

    pub fn set_encrypting(&self, encrypting: bool) {
        self.inner.state.lock().unwrap().encrypting = encrypting;
    }

    pub fn is_encrypting(&self) -> bool {
        self.inner.state.lock().unwrap().encrypting
    }

    pub fn set_detached_signature(&self, detached: bool) {
        self.inner.state.lock().unwrap().detached = detached;
    }

    pub fn set_protocol(&self, protocol: Option<Protocol>) {
        self.inner.state.lock().unwrap().protocol = protocol;
    }

    /// Pinned protocol; fixed once resolution succeeded.
    pub fn protocol(&self) -> Option<Protocol> {
        self.inner.state.lock().unwrap().protocol
    }

    pub fn are_certificates_resolved(&self) -> bool {
        self.inner.state.lock().unwrap().resolved
    }

    pub fn is_resolving(&self) -> bool {
        self.inner.state.lock().unwrap().resolving
    }

    /// Results of all tasks that ran, failed ones included.
    pub fn results(&self) -> Vec<TaskResult> {
        self.inner.state.lock().unwrap().results.clone()
    }

    /// Kick off certificate resolution. Runs at most once per
    /// controller; repeated calls are ignored.
    pub fn start_resolving_certificates(&self, senders: Vec<String>, recipients: Vec<String>) {
        let request = {
            let mut state = self.inner.state.lock().unwrap();
            if state.resolving || state.resolved {
                debug!("resolution already started, ignoring");
                return;
            }
            state.resolving = true;
            ResolveRequest {
                protocol: state.protocol,
                senders,
                recipients,
                signing: state.signing,
                encrypting: state.encrypting,
            }
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            match inner.resolver.resolve(request).await {
                Ok(resolved) => {
                    {
                        let mut state = inner.state.lock().unwrap();
                        state.protocol = Some(resolved.protocol);
                        state.signers = resolved.signers;
                        state.recipients = resolved.recipients;
                        state.resolving = false;
                        state.resolved = true;
                    }
                    inner.port.emit_resolved();
                }
                Err(ResolveError::Canceled) => {
                    inner.state.lock().unwrap().resolving = false;
                    inner.port.settle_error(codes::CANCELED, "User canceled");
                }
                Err(err) => {
                    inner.state.lock().unwrap().resolving = false;
                    inner.port.settle_error(codes::GENERAL, err.to_string());
                }
            }
        });
        self.inner.state.lock().unwrap().resolve_handle = Some(handle);
    }

    /// Start the signing half. Inputs and outputs must pair up; callers
    /// validate counts before we get here.
    pub fn start_signing(&self, inputs: Vec<IoSpec>, outputs: Vec<IoSpec>) -> CommandResult<()> {
        self.start_tasks(inputs, outputs, TaskFlavor::Sign)
    }

    /// Start the encryption half.
    pub fn start_encryption(&self, inputs: Vec<IoSpec>, outputs: Vec<IoSpec>) -> CommandResult<()> {
        self.start_tasks(inputs, outputs, TaskFlavor::Encrypt)
    }

    fn start_tasks(
        &self,
        inputs: Vec<IoSpec>,
        outputs: Vec<IoSpec>,
        flavor: TaskFlavor,
    ) -> CommandResult<()> {
        if inputs.len() != outputs.len() {
            return Err(CommandError::new(
                codes::INTERNAL,
                "input/output pairing broke between validation and start",
            ));
        }

        let tasks = {
            let state = self.inner.state.lock().unwrap();
            if !state.resolved {
                return Err(CommandError::new(
                    codes::INTERNAL,
                    "certificates are not resolved yet",
                ));
            }
            let protocol = state.protocol.ok_or_else(|| {
                CommandError::new(codes::INTERNAL, "resolution finished without a protocol")
            })?;

            inputs
                .into_iter()
                .zip(outputs)
                .map(|(mut input, output)| {
                    if input.label.is_none() {
                        input.label = state.session_title.clone();
                    }
                    match flavor {
                        TaskFlavor::Sign => Task::sign(
                            protocol,
                            input,
                            output,
                            state.signers.clone(),
                            state.detached,
                        ),
                        TaskFlavor::Encrypt => {
                            Task::encrypt(protocol, input, output, state.recipients.clone())
                        }
                    }
                })
                .collect::<Vec<_>>()
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let (results, first_error) = run_scheduled(Arc::clone(&inner.engine), tasks).await;
            inner.state.lock().unwrap().results.extend(results);
            match first_error {
                Some(err) => inner.port.settle_error(err.code, err.message),
                None => inner.port.settle_done(),
            }
        });
        self.inner.state.lock().unwrap().exec_handle = Some(handle);
        Ok(())
    }

    /// Abort whatever is in flight and settle with a cancellation
    /// error. Safe to call at any point in the life cycle.
    pub fn cancel(&self) {
        let (resolve_handle, exec_handle) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.resolving = false;
            (state.resolve_handle.take(), state.exec_handle.take())
        };
        if let Some(handle) = resolve_handle {
            handle.abort();
        }
        if let Some(handle) = exec_handle {
            handle.abort();
        }
        if !self.inner.port.is_settled() {
            warn!("sign/encrypt mail controller canceled");
        }
        self.inner.port.settle_error(codes::CANCELED, "User canceled");
    }
}

#[derive(Clone, Copy)]
enum TaskFlavor {
    Sign,
    Encrypt,
}
