//! Long-running operation controllers.
//!
//! A controller outlives the command that created it: PREP_ENCRYPT
//! parks one in the session so a later ENCRYPT can pick it up. All of
//! them follow the same life cycle (resolve certificates, execute
//! tasks, settle exactly once with done or error) and report through an
//! event channel owned by whichever command is currently attached.

pub mod checksum_create;
pub mod checksum_verify;
pub mod decrypt_verify;
pub mod sign_encrypt_email;
pub mod sign_encrypt_files;

pub use checksum_create::ChecksumCreateController;
pub use checksum_verify::ChecksumVerifyController;
pub use decrypt_verify::DecryptVerifyController;
pub use sign_encrypt_email::SignEncryptEmailController;
pub use sign_encrypt_files::SignEncryptFilesController;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;

use crate::engine::{CryptoEngine, Protocol};
use crate::error::CommandError;
use crate::task::{Task, TaskResult};

/// Events a controller posts to the attached command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Certificate resolution finished; execution may be started.
    CertificatesResolved,
    /// Terminal: every task finished without error.
    Done,
    /// Terminal: settled with the first error that occurred.
    Error { code: u32, message: String },
}

/// Connection point between a controller and the command currently
/// listening to it. Guarantees that exactly one terminal event leaves,
/// no matter how many tasks fail or how often cancel is called.
pub(crate) struct EventPort {
    sink: Mutex<Option<UnboundedSender<ControllerEvent>>>,
    settled: AtomicBool,
}

impl EventPort {
    pub fn new() -> Self {
        EventPort {
            sink: Mutex::new(None),
            settled: AtomicBool::new(false),
        }
    }

    /// Attach a command's event queue, replacing any previous listener.
    pub fn connect(&self, sender: UnboundedSender<ControllerEvent>) {
        *self.sink.lock().unwrap() = Some(sender);
    }

    pub fn emit_resolved(&self) {
        if let Some(sink) = &*self.sink.lock().unwrap() {
            let _ = sink.send(ControllerEvent::CertificatesResolved);
        }
    }

    pub fn settle_done(&self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sink) = &*self.sink.lock().unwrap() {
            let _ = sink.send(ControllerEvent::Done);
        }
    }

    pub fn settle_error(&self, code: u32, message: impl Into<String>) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = message.into();
        debug!("controller settled with error {code}: {message}");
        if let Some(sink) = &*self.sink.lock().unwrap() {
            let _ = sink.send(ControllerEvent::Error { code, message });
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

/// Drive a batch of tasks with at most one CMS and one OpenPGP task in
/// flight at any time. Completed results are kept in submission-ish
/// order of completion; the first error wins and later ones only get
/// logged. Dropping the future aborts whatever is still running.
pub(crate) async fn run_scheduled(
    engine: Arc<dyn CryptoEngine>,
    tasks: Vec<Task>,
) -> (Vec<TaskResult>, Option<CommandError>) {
    let mut runnable: VecDeque<Task> = tasks.into();
    let mut joinset: JoinSet<(Protocol, TaskResult)> = JoinSet::new();
    let mut cms_busy = false;
    let mut openpgp_busy = false;
    let mut completed = Vec::new();
    let mut first_error: Option<CommandError> = None;

    loop {
        // Fill whatever slots are free.
        while let Some(pos) = runnable.iter().position(|t| match t.protocol() {
            Protocol::Cms => !cms_busy,
            Protocol::OpenPgp => !openpgp_busy,
        }) {
            let task = runnable.remove(pos).expect("position came from iter");
            match task.protocol() {
                Protocol::Cms => cms_busy = true,
                Protocol::OpenPgp => openpgp_busy = true,
            }
            let engine = Arc::clone(&engine);
            joinset.spawn(async move {
                let protocol = task.protocol();
                let result = task.run(engine).await;
                (protocol, result)
            });
        }

        if joinset.is_empty() {
            break;
        }

        match joinset.join_next().await {
            Some(Ok((protocol, result))) => {
                match protocol {
                    Protocol::Cms => cms_busy = false,
                    Protocol::OpenPgp => openpgp_busy = false,
                }
                if let Some(err) = &result.error {
                    if first_error.is_none() {
                        first_error = Some(err.clone());
                    } else {
                        debug!("task {} failed after first error: {}", result.label, err);
                    }
                }
                completed.push(result);
            }
            Some(Err(join_err)) => {
                // A panicking task must not take the whole batch down.
                if first_error.is_none() {
                    first_error = Some(CommandError::unexpected(join_err));
                }
                cms_busy = false;
                openpgp_busy = false;
            }
            None => break,
        }
    }

    (completed, first_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EngineError, ImportResult, IoSpec, TaskOutput, TaskSpec,
    };
    use crate::error::codes;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    #[test]
    fn event_port_settles_exactly_once() {
        let port = EventPort::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        port.connect(tx);

        port.emit_resolved();
        port.settle_error(codes::GENERAL, "first");
        port.settle_error(codes::CONFLICT, "second");
        port.settle_done();

        assert_eq!(rx.try_recv().unwrap(), ControllerEvent::CertificatesResolved);
        assert_eq!(
            rx.try_recv().unwrap(),
            ControllerEvent::Error {
                code: codes::GENERAL,
                message: "first".to_owned()
            }
        );
        assert!(rx.try_recv().is_err(), "second terminal event must be swallowed");
        assert!(port.is_settled());
    }

    struct CountingEngine {
        active_cms: AtomicU32,
        active_pgp: AtomicU32,
        max_cms: AtomicU32,
        max_pgp: AtomicU32,
        fail_label: Option<String>,
    }

    impl CountingEngine {
        fn new(fail_label: Option<&str>) -> Self {
            CountingEngine {
                active_cms: AtomicU32::new(0),
                active_pgp: AtomicU32::new(0),
                max_cms: AtomicU32::new(0),
                max_pgp: AtomicU32::new(0),
                fail_label: fail_label.map(str::to_owned),
            }
        }
    }

    #[async_trait]
    impl CryptoEngine for CountingEngine {
        async fn execute(&self, spec: TaskSpec) -> Result<TaskOutput, EngineError> {
            let counter = match spec.protocol {
                Protocol::Cms => (&self.active_cms, &self.max_cms),
                Protocol::OpenPgp => (&self.active_pgp, &self.max_pgp),
            };
            let now = counter.0.fetch_add(1, Ordering::SeqCst) + 1;
            counter.1.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            counter.0.fetch_sub(1, Ordering::SeqCst);

            if self
                .fail_label
                .as_deref()
                .is_some_and(|l| spec.input.display_name().contains(l))
            {
                return Err(EngineError::Failed {
                    code: codes::GENERAL,
                    message: format!("failed on {}", spec.input.display_name()),
                });
            }
            Ok(TaskOutput::default())
        }

        async fn import_certificates(
            &self,
            _files: &[PathBuf],
        ) -> Result<ImportResult, EngineError> {
            Ok(ImportResult::default())
        }
    }

    fn encrypt_task(protocol: Protocol, name: &str) -> Task {
        Task::encrypt(
            protocol,
            IoSpec::new(format!("/in/{name}")),
            IoSpec::new(format!("/out/{name}")),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn scheduler_runs_one_task_per_protocol() {
        let engine = Arc::new(CountingEngine::new(None));
        let tasks = vec![
            encrypt_task(Protocol::OpenPgp, "a"),
            encrypt_task(Protocol::OpenPgp, "b"),
            encrypt_task(Protocol::Cms, "c"),
            encrypt_task(Protocol::Cms, "d"),
            encrypt_task(Protocol::OpenPgp, "e"),
        ];
        let (completed, err) = run_scheduled(engine.clone() as Arc<dyn CryptoEngine>, tasks).await;
        assert!(err.is_none());
        assert_eq!(completed.len(), 5);
        assert_eq!(engine.max_cms.load(Ordering::SeqCst), 1);
        assert_eq!(engine.max_pgp.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scheduler_keeps_first_error_and_finishes_rest() {
        let engine = Arc::new(CountingEngine::new(Some("b")));
        let tasks = vec![
            encrypt_task(Protocol::OpenPgp, "a"),
            encrypt_task(Protocol::OpenPgp, "b"),
            encrypt_task(Protocol::OpenPgp, "c"),
        ];
        let (completed, err) = run_scheduled(engine as Arc<dyn CryptoEngine>, tasks).await;
        assert_eq!(completed.len(), 3);
        let err = err.expect("one task failed");
        assert!(err.message.contains("/in/b"));
        assert_eq!(completed.iter().filter(|r| r.has_error()).count(), 1);
    }
}
