//! Assuan command handlers.
//!
//! Everything beyond the connection builtins is a handler registered in
//! the [`CommandRegistry`]. A handler validates the state collected on
//! the connection, drives a controller to its terminal event, and
//! leaves the final OK/ERR line to the dispatch loop. Commands that
//! share semantics and differ only in their operation flags are one
//! handler type registered several times.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::assuan::Request;
use crate::controller::ControllerEvent;
use crate::engine::Protocol;
use crate::error::{codes, CommandError, CommandResult};
use crate::server::Connection;

pub mod checksum;
pub mod echo;
pub mod email;
pub mod files;
pub mod select_certificate;

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()>;
}

pub struct CommandRegistry {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> CommandRegistry {
        CommandRegistry {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn CommandHandler>) {
        let name = handler.name();
        if self.handlers.insert(name, handler).is_some() {
            warn!("command {name} registered twice, keeping the last one");
        }
    }

    /// The full command set of the UI server.
    pub fn with_builtins() -> CommandRegistry {
        use crate::controller::decrypt_verify::flags;
        use crate::controller::sign_encrypt_files::operation;

        let mut registry = CommandRegistry::new();
        registry.register(Box::new(echo::EchoCommand));
        registry.register(Box::new(email::PrepEncryptCommand));
        registry.register(Box::new(email::EncryptCommand));
        registry.register(Box::new(email::PrepSignCommand));
        registry.register(Box::new(email::SignCommand));
        for (name, op) in [
            ("DECRYPT", flags::DECRYPT_FORCED),
            ("VERIFY", flags::VERIFY_FORCED),
            ("DECRYPT_VERIFY", flags::DECRYPT_FORCED | flags::VERIFY_IMPLIED),
        ] {
            registry.register(Box::new(email::DecryptVerifyEmailCommand::new(name, op)));
        }
        for (name, op) in [
            ("DECRYPT_FILES", flags::DECRYPT_FORCED),
            ("VERIFY_FILES", flags::VERIFY_IMPLIED),
            (
                "DECRYPT_VERIFY_FILES",
                flags::DECRYPT_IMPLIED | flags::VERIFY_IMPLIED,
            ),
        ] {
            registry.register(Box::new(files::DecryptVerifyFilesCommand::new(name, op)));
        }
        for (name, op) in [
            (
                "SIGN_ENCRYPT_FILES",
                operation::SIGN_SELECTED | operation::ENCRYPT_SELECTED,
            ),
            (
                "ENCRYPT_SIGN_FILES",
                operation::SIGN_SELECTED | operation::ENCRYPT_SELECTED,
            ),
            (
                "ENCRYPT_FILES",
                operation::ENCRYPT_SELECTED | operation::SIGN_ALLOWED,
            ),
            (
                "SIGN_FILES",
                operation::SIGN_SELECTED | operation::ENCRYPT_ALLOWED,
            ),
        ] {
            registry.register(Box::new(files::SignEncryptFilesCommand::new(name, op)));
        }
        registry.register(Box::new(files::ImportFilesCommand));
        registry.register(Box::new(checksum::ChecksumCreateFilesCommand));
        registry.register(Box::new(checksum::ChecksumVerifyFilesCommand));
        registry.register(Box::new(select_certificate::SelectCertificateCommand));
        registry
    }

    pub fn get(&self, name: &str) -> Option<&dyn CommandHandler> {
        self.handlers.get(name).map(|h| h.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        CommandRegistry::new()
    }
}

// ============================================================================
// Shared validation
// ============================================================================

/// Email mode commands work on INPUT/OUTPUT/MESSAGE slots and clash
/// with a connection that already collected FILE arguments.
pub(crate) fn require_email_mode(conn: &Connection, command: &str) -> CommandResult<()> {
    if !conn.state.files.is_empty() {
        return Err(CommandError::new(
            codes::CONFLICT,
            format!(
                "{command} is an email mode command, connection seems to be in filemanager mode"
            ),
        ));
    }
    Ok(())
}

pub(crate) fn require_file_mode(conn: &Connection, command: &str) -> CommandResult<()> {
    if !conn.state.inputs.is_empty()
        || !conn.state.outputs.is_empty()
        || !conn.state.messages.is_empty()
    {
        return Err(CommandError::new(
            codes::CONFLICT,
            format!(
                "{command} is a filemanager mode command, connection seems to be in email mode"
            ),
        ));
    }
    Ok(())
}

/// FILE arguments collected on the connection; every filemanager
/// command needs at least one.
pub(crate) fn require_files(conn: &Connection) -> CommandResult<Vec<PathBuf>> {
    if conn.state.files.is_empty() {
        return Err(CommandError::new(codes::ASS_NO_INPUT, "No files given"));
    }
    Ok(conn.state.files.clone())
}

pub(crate) fn requested_protocol(request: &Request) -> CommandResult<Option<Protocol>> {
    match request.option_value("protocol") {
        Some(value) => Ok(Some(value.parse()?)),
        None => Ok(None),
    }
}

// ============================================================================
// Controller driving
// ============================================================================

pub(crate) type ResolvedAction = Box<dyn FnOnce() -> CommandResult<()> + Send>;

/// Runs a started controller to its terminal event. With --nohup the
/// command detaches instead: the caller gets an immediate Ok and the
/// operation finishes on its own, reporting through the log only.
/// A CAN line from the client turns into `cancel`, which makes the
/// controller settle with a canceled error.
pub(crate) async fn drive_controller(
    conn: &mut Connection,
    request: &Request,
    label: &'static str,
    mut rx: UnboundedReceiver<ControllerEvent>,
    cancel: impl Fn() + Send + Sync + 'static,
    mut on_resolved: Option<ResolvedAction>,
) -> CommandResult<()> {
    if request.has_option("nohup") {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ControllerEvent::CertificatesResolved => {
                        if let Some(action) = on_resolved.take() {
                            if let Err(err) = action() {
                                warn!("{label}: detached operation failed to start: {err}");
                                return;
                            }
                        }
                    }
                    ControllerEvent::Done => {
                        info!("{label}: detached operation finished");
                        return;
                    }
                    ControllerEvent::Error { code, message } => {
                        warn!("{label}: detached operation failed: {code} {message}");
                        return;
                    }
                }
            }
        });
        return Ok(());
    }

    loop {
        match conn.next_controller_event(&mut rx, &cancel).await? {
            ControllerEvent::CertificatesResolved => {
                if let Some(action) = on_resolved.take() {
                    action()?;
                }
            }
            ControllerEvent::Done => return Ok(()),
            ControllerEvent::Error { code, message } => {
                return Err(CommandError::new(code, message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_full_command_set() {
        let registry = CommandRegistry::with_builtins();
        let names = registry.names();
        assert_eq!(names.len(), 19);
        for name in [
            "ECHO",
            "ENCRYPT",
            "PREP_ENCRYPT",
            "SIGN",
            "PREP_SIGN",
            "DECRYPT",
            "VERIFY",
            "DECRYPT_VERIFY",
            "DECRYPT_FILES",
            "VERIFY_FILES",
            "DECRYPT_VERIFY_FILES",
            "SIGN_ENCRYPT_FILES",
            "ENCRYPT_SIGN_FILES",
            "ENCRYPT_FILES",
            "SIGN_FILES",
            "IMPORT_FILES",
            "CHECKSUM_CREATE_FILES",
            "CHECKSUM_VERIFY_FILES",
            "SELECT_CERTIFICATE",
        ] {
            assert!(registry.get(name).is_some(), "missing {name}");
        }
        assert!(registry.get("HELP").is_none());
    }

    #[test]
    fn protocol_option_parses_both_spellings() {
        let request = Request::parse("ENCRYPT --protocol=CMS").unwrap();
        assert_eq!(requested_protocol(&request).unwrap(), Some(Protocol::Cms));
        let request = Request::parse("ENCRYPT --protocol=openpgp").unwrap();
        assert_eq!(
            requested_protocol(&request).unwrap(),
            Some(Protocol::OpenPgp)
        );
        let request = Request::parse("ENCRYPT").unwrap();
        assert_eq!(requested_protocol(&request).unwrap(), None);
        let request = Request::parse("ENCRYPT --protocol=smime").unwrap();
        assert!(requested_protocol(&request).is_err());
    }
}
