//! One atomic crypto operation bound to a single input.
//!
//! Controllers cut their work into tasks, one per input/output pair,
//! and feed them to the per-protocol scheduler. A task knows nothing
//! about sessions or the wire; it carries a [`TaskSpec`] to the engine
//! and wraps whatever comes back.

use std::sync::Arc;

use uuid::Uuid;

use crate::engine::{
    Certificate, CryptoEngine, IoSpec, Protocol, TaskKind, TaskOutput, TaskSpec,
};
use crate::error::CommandError;

#[derive(Debug, Clone)]
pub struct Task {
    id: Uuid,
    spec: TaskSpec,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Task {
            id: Uuid::new_v4(),
            spec,
        }
    }

    pub fn sign(
        protocol: Protocol,
        input: IoSpec,
        output: IoSpec,
        signers: Vec<Certificate>,
        detached: bool,
    ) -> Self {
        Task::new(TaskSpec {
            kind: TaskKind::Sign { detached },
            protocol,
            input,
            output: Some(output),
            message: None,
            archive_files: Vec::new(),
            signers,
            recipients: Vec::new(),
        })
    }

    pub fn encrypt(
        protocol: Protocol,
        input: IoSpec,
        output: IoSpec,
        recipients: Vec<Certificate>,
    ) -> Self {
        Task::new(TaskSpec {
            kind: TaskKind::Encrypt,
            protocol,
            input,
            output: Some(output),
            message: None,
            archive_files: Vec::new(),
            signers: Vec::new(),
            recipients,
        })
    }

    pub fn sign_encrypt(
        protocol: Protocol,
        input: IoSpec,
        output: IoSpec,
        signers: Vec<Certificate>,
        recipients: Vec<Certificate>,
    ) -> Self {
        Task::new(TaskSpec {
            kind: TaskKind::SignEncrypt,
            protocol,
            input,
            output: Some(output),
            message: None,
            archive_files: Vec::new(),
            signers,
            recipients,
        })
    }

    pub fn decrypt(protocol: Protocol, input: IoSpec, output: IoSpec) -> Self {
        Task::new(TaskSpec {
            kind: TaskKind::Decrypt,
            protocol,
            input,
            output: Some(output),
            message: None,
            archive_files: Vec::new(),
            signers: Vec::new(),
            recipients: Vec::new(),
        })
    }

    /// Verify an opaque signature; the payload goes to `output` if given.
    pub fn verify_opaque(protocol: Protocol, input: IoSpec, output: Option<IoSpec>) -> Self {
        Task::new(TaskSpec {
            kind: TaskKind::Verify,
            protocol,
            input,
            output,
            message: None,
            archive_files: Vec::new(),
            signers: Vec::new(),
            recipients: Vec::new(),
        })
    }

    /// Verify a detached signature over a separate signed text.
    pub fn verify_detached(protocol: Protocol, signature: IoSpec, message: IoSpec) -> Self {
        Task::new(TaskSpec {
            kind: TaskKind::Verify,
            protocol,
            input: signature,
            output: None,
            message: Some(message),
            archive_files: Vec::new(),
            signers: Vec::new(),
            recipients: Vec::new(),
        })
    }

    pub fn decrypt_verify(protocol: Protocol, input: IoSpec, output: IoSpec) -> Self {
        Task::new(TaskSpec {
            kind: TaskKind::DecryptVerify,
            protocol,
            input,
            output: Some(output),
            message: None,
            archive_files: Vec::new(),
            signers: Vec::new(),
            recipients: Vec::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.spec.kind
    }

    pub fn protocol(&self) -> Protocol {
        self.spec.protocol
    }

    pub fn label(&self) -> String {
        self.spec.input.display_name()
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// Run the operation to completion on the given engine. Never
    /// panics; failures land in the result's error slot.
    pub async fn run(&self, engine: Arc<dyn CryptoEngine>) -> TaskResult {
        let outcome = engine.execute(self.spec.clone()).await;
        match outcome {
            Ok(output) => TaskResult {
                task_id: self.id,
                label: self.label(),
                kind: self.spec.kind,
                protocol: self.spec.protocol,
                error: None,
                output,
            },
            Err(err) => TaskResult {
                task_id: self.id,
                label: self.label(),
                kind: self.spec.kind,
                protocol: self.spec.protocol,
                error: Some(CommandError::from(err)),
                output: TaskOutput::default(),
            },
        }
    }
}

/// What is left of a task once it ran.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub label: String,
    pub kind: TaskKind,
    pub protocol: Protocol,
    pub error: Option<CommandError>,
    pub output: TaskOutput,
}

impl TaskResult {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, ImportResult};
    use crate::error::codes;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct FailingEngine;

    #[async_trait]
    impl CryptoEngine for FailingEngine {
        async fn execute(&self, _spec: TaskSpec) -> Result<TaskOutput, EngineError> {
            Err(EngineError::Failed {
                code: codes::GENERAL,
                message: "decryption failed: no secret key".to_owned(),
            })
        }

        async fn import_certificates(
            &self,
            _files: &[PathBuf],
        ) -> Result<ImportResult, EngineError> {
            Ok(ImportResult::default())
        }
    }

    #[test]
    fn builders_pair_io_as_expected() {
        let task = Task::verify_detached(
            Protocol::OpenPgp,
            IoSpec::new("/mail/sig.asc"),
            IoSpec::new("/mail/body.txt"),
        );
        assert_eq!(task.kind(), TaskKind::Verify);
        assert!(task.spec().output.is_none());
        assert_eq!(
            task.spec().message.as_ref().map(|m| m.path.clone()),
            Some(PathBuf::from("/mail/body.txt"))
        );

        let task = Task::encrypt(
            Protocol::Cms,
            IoSpec::new("/mail/body.txt"),
            IoSpec::new("/mail/body.txt.p7m"),
            Vec::new(),
        );
        assert_eq!(task.protocol(), Protocol::Cms);
        assert!(task.spec().output.is_some());
    }

    #[tokio::test]
    async fn engine_failure_lands_in_result() {
        let task = Task::decrypt(
            Protocol::OpenPgp,
            IoSpec::new("/mail/secret.gpg"),
            IoSpec::new("/mail/secret.txt"),
        );
        let result = task.run(Arc::new(FailingEngine)).await;
        assert!(result.has_error());
        let err = result.error.unwrap();
        assert_eq!(err.code, codes::GENERAL);
        assert!(err.message.contains("no secret key"));
    }
}
