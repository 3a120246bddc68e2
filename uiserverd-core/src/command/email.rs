//! Email mode commands.
//!
//! PREP_ENCRYPT and PREP_SIGN resolve certificates ahead of time and
//! park the prepared controller in the session, where a later ENCRYPT
//! or SIGN picks it up. The decrypt/verify family shares one handler
//! registered under three names with different operation flags.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::assuan::Request;
use crate::controller::decrypt_verify::flags;
use crate::controller::{ControllerEvent, DecryptVerifyController, SignEncryptEmailController};
use crate::engine::IoSpec;
use crate::error::{codes, CommandError, CommandResult};
use crate::server::Connection;

use super::{
    drive_controller, require_email_mode, requested_protocol, CommandHandler, ResolvedAction,
};

// ============================================================================
// Validation helpers
// ============================================================================

fn require_io_pairs(conn: &Connection) -> CommandResult<(Vec<IoSpec>, Vec<IoSpec>)> {
    if conn.state.inputs.is_empty() {
        return Err(CommandError::new(
            codes::ASS_NO_INPUT,
            "At least one INPUT must be present",
        ));
    }
    if conn.state.outputs.is_empty() {
        return Err(CommandError::new(
            codes::ASS_NO_OUTPUT,
            "At least one OUTPUT must be present",
        ));
    }
    if conn.state.inputs.len() != conn.state.outputs.len() {
        return Err(CommandError::new(
            codes::CONFLICT,
            "INPUT/OUTPUT count mismatch",
        ));
    }
    Ok((conn.state.inputs.clone(), conn.state.outputs.clone()))
}

fn reject_messages(conn: &Connection, command: &str) -> CommandResult<()> {
    if !conn.state.messages.is_empty() {
        return Err(CommandError::new(
            codes::INV_VALUE,
            format!("MESSAGE command is not allowed before {command}"),
        ));
    }
    Ok(())
}

fn reject_io(conn: &Connection, command: &str) -> CommandResult<()> {
    if !conn.state.inputs.is_empty()
        || !conn.state.outputs.is_empty()
        || !conn.state.messages.is_empty()
    {
        return Err(CommandError::new(
            codes::CONFLICT,
            format!("INPUT/OUTPUT/MESSAGE may only be given after {command}"),
        ));
    }
    Ok(())
}

fn require_recipients(conn: &Connection) -> CommandResult<Vec<String>> {
    let recipients = conn.state.real_recipients();
    if recipients.is_empty() {
        return Err(CommandError::new(
            codes::MISSING_VALUE,
            "No recipients given, or only with --info",
        ));
    }
    Ok(recipients)
}

fn require_senders(conn: &Connection) -> CommandResult<Vec<String>> {
    let senders = conn.state.real_senders();
    if senders.is_empty() {
        return Err(CommandError::new(
            codes::MISSING_VALUE,
            "No senders given, or only with --info",
        ));
    }
    Ok(senders)
}

fn canceller(controller: &Arc<SignEncryptEmailController>) -> impl Fn() + Send + Sync + 'static {
    let controller = Arc::clone(controller);
    move || controller.cancel()
}

/// Takes the prepared controller out of the session if its flavor
/// matches; a mismatching one is put back untouched.
fn take_prepared(
    conn: &Connection,
    want_signing: bool,
) -> Option<Arc<SignEncryptEmailController>> {
    let data = conn.session_data()?;
    let controller = data.take_email_controller()?;
    let matches = if want_signing {
        controller.is_signing() && !controller.is_encrypting()
    } else {
        controller.is_encrypting()
    };
    if matches {
        Some(controller)
    } else {
        data.set_email_controller(controller);
        None
    }
}

fn park_in_session(conn: &Connection, controller: &Arc<SignEncryptEmailController>, name: &str) {
    match conn.session_data() {
        Some(data) => data.set_email_controller(Arc::clone(controller)),
        None => debug!("{name} without SESSION, the prepared state cannot be picked up later"),
    }
}

/// A follow-up command may not change what its PREP_* counterpart
/// already settled on.
fn check_reuse(
    conn: &Connection,
    request: &Request,
    controller: &SignEncryptEmailController,
    prep: &str,
) -> CommandResult<()> {
    if let Some(protocol) = requested_protocol(request)? {
        if controller.protocol() != Some(protocol) {
            return Err(CommandError::new(
                codes::CONFLICT,
                format!("Protocol given conflicts with protocol determined by {prep}"),
            ));
        }
    }
    if !conn.state.recipients.is_empty() {
        return Err(CommandError::new(
            codes::CONFLICT,
            format!("New recipients added after {prep} command"),
        ));
    }
    if !conn.state.senders.is_empty() {
        return Err(CommandError::new(
            codes::CONFLICT,
            format!("New senders added after {prep} command"),
        ));
    }
    Ok(())
}

// ============================================================================
// PREP_ENCRYPT / ENCRYPT
// ============================================================================

pub struct PrepEncryptCommand;

#[async_trait]
impl CommandHandler for PrepEncryptCommand {
    fn name(&self) -> &'static str {
        "PREP_ENCRYPT"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_email_mode(conn, "PREP_ENCRYPT")?;
        reject_io(conn, "PREP_ENCRYPT")?;
        require_recipients(conn)?;

        let controller = Arc::new(SignEncryptEmailController::new(
            conn.engine(),
            conn.resolver(),
        ));
        controller.set_encrypting(true);
        controller.set_signing(request.has_option("expect-sign"));
        controller.set_protocol(requested_protocol(request)?);
        controller.set_session_title(conn.session_title());

        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.connect(tx);
        controller.start_resolving_certificates(
            conn.state.all_senders(),
            conn.state.real_recipients(),
        );

        let cancel = canceller(&controller);
        loop {
            match conn.next_controller_event(&mut rx, &cancel).await? {
                ControllerEvent::CertificatesResolved => {
                    park_in_session(conn, &controller, "PREP_ENCRYPT");
                    return Ok(());
                }
                ControllerEvent::Done => return Ok(()),
                ControllerEvent::Error { code, message } => {
                    return Err(CommandError::new(code, message))
                }
            }
        }
    }
}

pub struct EncryptCommand;

#[async_trait]
impl CommandHandler for EncryptCommand {
    fn name(&self) -> &'static str {
        "ENCRYPT"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_email_mode(conn, "ENCRYPT")?;
        if !conn.state.real_senders().is_empty() {
            return Err(CommandError::new(
                codes::CONFLICT,
                "SENDER may not be given prior to ENCRYPT, except with --info",
            ));
        }
        let (inputs, outputs) = require_io_pairs(conn)?;
        reject_messages(conn, "ENCRYPT")?;

        let prepared = take_prepared(conn, false);
        let fresh = prepared.is_none();
        let controller = match prepared {
            Some(controller) => {
                if let Err(err) = check_reuse(conn, request, &controller, "PREP_ENCRYPT") {
                    // Leave the memento in place for a corrected retry.
                    park_in_session(conn, &controller, "ENCRYPT");
                    return Err(err);
                }
                controller
            }
            None => {
                require_recipients(conn)?;
                let controller = Arc::new(SignEncryptEmailController::new(
                    conn.engine(),
                    conn.resolver(),
                ));
                controller.set_encrypting(true);
                controller.set_signing(false);
                controller.set_protocol(requested_protocol(request)?);
                controller
            }
        };
        controller.set_session_title(conn.session_title());

        let (tx, rx) = mpsc::unbounded_channel();
        controller.connect(tx.clone());
        if fresh {
            controller.start_resolving_certificates(
                conn.state.all_senders(),
                conn.state.real_recipients(),
            );
        } else if controller.are_certificates_resolved() {
            // Resolution already happened under PREP_ENCRYPT; feed the
            // event to our own queue so the wait loop below fires.
            let _ = tx.send(ControllerEvent::CertificatesResolved);
        }

        let on_resolved: ResolvedAction = {
            let controller = Arc::clone(&controller);
            Box::new(move || controller.start_encryption(inputs, outputs))
        };
        drive_controller(
            conn,
            request,
            "ENCRYPT",
            rx,
            canceller(&controller),
            Some(on_resolved),
        )
        .await
    }
}

// ============================================================================
// PREP_SIGN / SIGN
// ============================================================================

pub struct PrepSignCommand;

#[async_trait]
impl CommandHandler for PrepSignCommand {
    fn name(&self) -> &'static str {
        "PREP_SIGN"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_email_mode(conn, "PREP_SIGN")?;
        reject_io(conn, "PREP_SIGN")?;
        require_senders(conn)?;

        let controller = Arc::new(SignEncryptEmailController::new(
            conn.engine(),
            conn.resolver(),
        ));
        controller.set_signing(true);
        controller.set_encrypting(false);
        controller.set_protocol(requested_protocol(request)?);
        controller.set_session_title(conn.session_title());

        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.connect(tx);
        controller.start_resolving_certificates(conn.state.all_senders(), Vec::new());

        let cancel = canceller(&controller);
        loop {
            match conn.next_controller_event(&mut rx, &cancel).await? {
                ControllerEvent::CertificatesResolved => {
                    if let Some(protocol) = controller.protocol() {
                        conn.send_status("PROTOCOL", protocol.as_str()).await?;
                    }
                    park_in_session(conn, &controller, "PREP_SIGN");
                    return Ok(());
                }
                ControllerEvent::Done => return Ok(()),
                ControllerEvent::Error { code, message } => {
                    return Err(CommandError::new(code, message))
                }
            }
        }
    }
}

pub struct SignCommand;

#[async_trait]
impl CommandHandler for SignCommand {
    fn name(&self) -> &'static str {
        "SIGN"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_email_mode(conn, "SIGN")?;
        if !conn.state.real_recipients().is_empty() {
            return Err(CommandError::new(
                codes::CONFLICT,
                "RECIPIENT may not be given prior to SIGN, except with --info",
            ));
        }
        let (inputs, outputs) = require_io_pairs(conn)?;
        reject_messages(conn, "SIGN")?;

        let prepared = take_prepared(conn, true);
        let fresh = prepared.is_none();
        let controller = match prepared {
            Some(controller) => {
                if let Err(err) = check_reuse(conn, request, &controller, "PREP_SIGN") {
                    park_in_session(conn, &controller, "SIGN");
                    return Err(err);
                }
                controller
            }
            None => {
                require_senders(conn)?;
                let controller = Arc::new(SignEncryptEmailController::new(
                    conn.engine(),
                    conn.resolver(),
                ));
                controller.set_signing(true);
                controller.set_encrypting(false);
                controller.set_protocol(requested_protocol(request)?);
                controller
            }
        };
        if request.has_option("detached") {
            controller.set_detached_signature(true);
        }
        controller.set_session_title(conn.session_title());

        let (tx, rx) = mpsc::unbounded_channel();
        controller.connect(tx.clone());
        if fresh {
            controller.start_resolving_certificates(conn.state.all_senders(), Vec::new());
        } else if controller.are_certificates_resolved() {
            let _ = tx.send(ControllerEvent::CertificatesResolved);
        }

        let on_resolved: ResolvedAction = {
            let controller = Arc::clone(&controller);
            Box::new(move || controller.start_signing(inputs, outputs))
        };
        drive_controller(
            conn,
            request,
            "SIGN",
            rx,
            canceller(&controller),
            Some(on_resolved),
        )
        .await
    }
}

// ============================================================================
// DECRYPT / VERIFY / DECRYPT_VERIFY
// ============================================================================

pub struct DecryptVerifyEmailCommand {
    name: &'static str,
    operation: u32,
}

impl DecryptVerifyEmailCommand {
    pub fn new(name: &'static str, operation: u32) -> DecryptVerifyEmailCommand {
        DecryptVerifyEmailCommand { name, operation }
    }
}

#[async_trait]
impl CommandHandler for DecryptVerifyEmailCommand {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_email_mode(conn, self.name)?;

        let mut operation = self.operation;
        if request.has_option("no-verify") {
            operation &= !flags::VERIFY_MASK;
        }
        let decrypting = operation & flags::DECRYPT_MASK != flags::DECRYPT_OFF;
        let verifying = operation & flags::VERIFY_MASK != flags::VERIFY_OFF;
        if !decrypting && !verifying {
            return Err(CommandError::new(
                codes::CONFLICT,
                format!("--no-verify cannot be used with {}", self.name),
            ));
        }

        let inputs = conn.state.inputs.clone();
        let outputs = conn.state.outputs.clone();
        let messages = conn.state.messages.clone();
        if inputs.is_empty() {
            return Err(CommandError::new(
                codes::ASS_NO_INPUT,
                "At least one INPUT must be present",
            ));
        }
        if decrypting {
            if !messages.is_empty() {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "MESSAGE is not allowed when decrypting",
                ));
            }
            if outputs.len() != inputs.len() {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "INPUT/OUTPUT count mismatch",
                ));
            }
        } else if !messages.is_empty() {
            // Detached: INPUT carries the signature, MESSAGE the text.
            if messages.len() != inputs.len() {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "INPUT/MESSAGE count mismatch",
                ));
            }
            if !outputs.is_empty() {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "OUTPUT is not allowed with detached signatures",
                ));
            }
        } else if !outputs.is_empty() && outputs.len() != inputs.len() {
            return Err(CommandError::new(
                codes::CONFLICT,
                "INPUT/OUTPUT count mismatch",
            ));
        }

        let controller = Arc::new(DecryptVerifyController::new(conn.engine()));
        controller.set_operation(operation)?;
        controller.set_protocol(requested_protocol(request)?);
        controller.set_session_title(conn.session_title());

        let (tx, rx) = mpsc::unbounded_channel();
        controller.connect(tx);
        controller.start_email(inputs, outputs, messages)?;

        let cancel = {
            let controller = Arc::clone(&controller);
            move || controller.cancel()
        };
        drive_controller(conn, request, self.name, rx, cancel, None).await
    }
}
