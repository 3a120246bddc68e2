//! Controller behind DECRYPT, VERIFY and DECRYPT_VERIFY, in both the
//! mail and the file manager flavors.
//!
//! There is no certificate resolution phase here; the operation flags
//! pin what to do and the tasks go straight to execution. In file mode
//! output names and protocols are derived from the input extensions,
//! and a detached signature is verified against its data file when one
//! sits next to it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::{run_scheduled, ControllerEvent, EventPort};
use crate::engine::{CryptoEngine, IoSpec, Protocol};
use crate::error::{codes, CommandError, CommandResult};
use crate::task::{Task, TaskResult};

/// Decrypt/verify operation flags. "Forced" must happen, "implied"
/// happens when the payload calls for it.
pub mod flags {
    pub const DECRYPT_OFF: u32 = 0;
    pub const DECRYPT_FORCED: u32 = 0x01;
    pub const DECRYPT_IMPLIED: u32 = 0x02;
    pub const DECRYPT_MASK: u32 = 0x03;

    pub const VERIFY_OFF: u32 = 0;
    pub const VERIFY_FORCED: u32 = 0x10;
    pub const VERIFY_IMPLIED: u32 = 0x20;
    pub const VERIFY_MASK: u32 = 0x30;
}

pub struct DecryptVerifyController {
    inner: Arc<DvInner>,
}

struct DvInner {
    engine: Arc<dyn CryptoEngine>,
    port: EventPort,
    state: Mutex<DvState>,
}

struct DvState {
    operation: u32,
    protocol: Option<Protocol>,
    session_title: Option<String>,
    results: Vec<TaskResult>,
    work_handle: Option<JoinHandle<()>>,
    started: bool,
    canceled: bool,
}

impl DecryptVerifyController {
    pub fn new(engine: Arc<dyn CryptoEngine>) -> Self {
        DecryptVerifyController {
            inner: Arc::new(DvInner {
                engine,
                port: EventPort::new(),
                state: Mutex::new(DvState {
                    operation: flags::DECRYPT_FORCED | flags::VERIFY_IMPLIED,
                    protocol: None,
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

    pub fn set_operation(&self, operation: u32) -> CommandResult<()> {
        use flags::*;
        let decrypt = operation & DECRYPT_MASK;
        let verify = operation & VERIFY_MASK;
        if operation & !(DECRYPT_MASK | VERIFY_MASK) != 0
            || decrypt == DECRYPT_MASK
            || verify == VERIFY_MASK
            || (decrypt == DECRYPT_OFF && verify == VERIFY_OFF)
        {
            return Err(CommandError::new(
                codes::INV_ARG,
                "invalid decrypt/verify operation flags",
            ));
        }
        self.inner.state.lock().unwrap().operation = operation;
        Ok(())
    }

    pub fn operation(&self) -> u32 {
        self.inner.state.lock().unwrap().operation
    }

    pub fn set_protocol(&self, protocol: Option<Protocol>) {
        self.inner.state.lock().unwrap().protocol = protocol;
    }

    pub fn set_session_title(&self, title: Option<String>) {
        self.inner.state.lock().unwrap().session_title = title;
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.inner.state.lock().unwrap().results.clone()
    }

    /// Mail flavor: INPUT/OUTPUT/MESSAGE slots collected on the
    /// connection. Counts are validated by the commands; a detached
    /// verification pairs each input with its message.
    pub fn start_email(
        &self,
        inputs: Vec<IoSpec>,
        outputs: Vec<IoSpec>,
        messages: Vec<IoSpec>,
    ) -> CommandResult<()> {
        let tasks = {
            let state = self.inner.state.lock().unwrap();
            if state.started {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "operation already started",
                ));
            }
            let protocol = state.protocol.unwrap_or(Protocol::OpenPgp);
            let decrypting = state.operation & flags::DECRYPT_MASK != flags::DECRYPT_OFF;
            let verifying = state.operation & flags::VERIFY_MASK != flags::VERIFY_OFF;

            let mut tasks = Vec::with_capacity(inputs.len());
            if decrypting {
                if inputs.len() != outputs.len() {
                    return Err(CommandError::new(
                        codes::INTERNAL,
                        "input/output pairing broke between validation and start",
                    ));
                }
                for (mut input, output) in inputs.into_iter().zip(outputs) {
                    if input.label.is_none() {
                        input.label = state.session_title.clone();
                    }
                    tasks.push(if verifying {
                        Task::decrypt_verify(protocol, input, output)
                    } else {
                        Task::decrypt(protocol, input, output)
                    });
                }
            } else {
                // Verify only. With messages each input is a detached
                // signature over the paired message.
                if !messages.is_empty() && messages.len() != inputs.len() {
                    return Err(CommandError::new(
                        codes::INTERNAL,
                        "input/message pairing broke between validation and start",
                    ));
                }
                let mut outputs = outputs.into_iter();
                let mut messages = messages.into_iter();
                for mut input in inputs {
                    if input.label.is_none() {
                        input.label = state.session_title.clone();
                    }
                    tasks.push(match messages.next() {
                        Some(message) => Task::verify_detached(protocol, input, message),
                        None => Task::verify_opaque(protocol, input, outputs.next()),
                    });
                }
            }
            tasks
        };

        self.run(tasks);
        Ok(())
    }

    /// File manager flavor: everything is derived from the paths.
    pub fn start_files(&self, files: Vec<PathBuf>) -> CommandResult<()> {
        if files.is_empty() {
            return Err(CommandError::new(codes::INV_ARG, "No files given"));
        }
        let tasks = {
            let state = self.inner.state.lock().unwrap();
            if state.started {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "operation already started",
                ));
            }
            let decrypting = state.operation & flags::DECRYPT_MASK != flags::DECRYPT_OFF;
            let verifying = state.operation & flags::VERIFY_MASK != flags::VERIFY_OFF;

            files
                .into_iter()
                .map(|file| {
                    let protocol = state.protocol.unwrap_or_else(|| protocol_for(&file));
                    let input = IoSpec::new(file.clone());
                    if decrypting {
                        let output = IoSpec::new(plaintext_name(&file));
                        if verifying {
                            Task::decrypt_verify(protocol, input, output)
                        } else {
                            Task::decrypt(protocol, input, output)
                        }
                    } else if let Some(signed) = detached_data_for(&file) {
                        Task::verify_detached(protocol, input, IoSpec::new(signed))
                    } else {
                        Task::verify_opaque(protocol, input, None)
                    }
                })
                .collect::<Vec<_>>()
        };

        debug!("decrypt/verify batch holds {} task(s)", tasks.len());
        self.run(tasks);
        Ok(())
    }

    fn run(&self, tasks: Vec<Task>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.started = true;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let (results, first_error) = run_scheduled(Arc::clone(&inner.engine), tasks).await;
            inner.state.lock().unwrap().results.extend(results);
            match first_error {
                Some(err) => inner.port.settle_error(err.code, err.message),
                None => inner.port.settle_done(),
            }
        });
        self.inner.state.lock().unwrap().work_handle = Some(handle);
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

const OPENPGP_EXTENSIONS: [&str; 4] = ["gpg", "pgp", "asc", "sig"];
const CMS_EXTENSIONS: [&str; 2] = ["p7m", "p7s"];

fn protocol_for(path: &Path) -> Protocol {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if CMS_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => Protocol::Cms,
        _ => Protocol::OpenPgp,
    }
}

/// Output name for a decryption: strip the wrapper extension when we
/// know it, otherwise tack on ".out" rather than guessing.
fn plaintext_name(path: &Path) -> PathBuf {
    let known: bool = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            OPENPGP_EXTENSIONS.contains(&ext.as_str()) || CMS_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false);
    if known {
        path.with_extension("")
    } else {
        let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
        name.push(".out");
        path.with_file_name(name)
    }
}

/// A signature file next to its data file means detached verification.
fn detached_data_for(path: &Path) -> Option<PathBuf> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if ext != "sig" && ext != "asc" && ext != "p7s" {
        return None;
    }
    let data = path.with_extension("");
    if data.is_file() {
        Some(data)
    } else {
        None
    }
}
