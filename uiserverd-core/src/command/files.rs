//! Filemanager mode commands working on FILE arguments.
//!
//! The sign/encrypt family and the decrypt/verify family are each one
//! handler registered under several names with different operation
//! flags. IMPORT_FILES goes straight to the engine.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::assuan::Request;
use crate::controller::decrypt_verify::flags;
use crate::controller::sign_encrypt_files::ArchiveMode;
use crate::controller::{DecryptVerifyController, SignEncryptFilesController};
use crate::error::{codes, CommandError, CommandResult};
use crate::server::Connection;

use super::{
    drive_controller, require_file_mode, require_files, requested_protocol, CommandHandler,
};

pub struct SignEncryptFilesCommand {
    name: &'static str,
    operation: u32,
}

impl SignEncryptFilesCommand {
    pub fn new(name: &'static str, operation: u32) -> SignEncryptFilesCommand {
        SignEncryptFilesCommand { name, operation }
    }
}

#[async_trait]
impl CommandHandler for SignEncryptFilesCommand {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_file_mode(conn, self.name)?;
        let files = require_files(conn)?;

        let controller = Arc::new(SignEncryptFilesController::new(
            conn.engine(),
            conn.resolver(),
        ));
        controller.set_operation_mode(self.operation)?;
        if request.has_option("archive") {
            controller.set_archive_mode(ArchiveMode::Forced);
        }
        controller.set_protocol(requested_protocol(request)?);
        controller.set_session_title(conn.session_title());
        controller.set_files(files)?;

        let (tx, rx) = mpsc::unbounded_channel();
        controller.connect(tx);
        controller.start()?;

        let cancel = {
            let controller = Arc::clone(&controller);
            move || controller.cancel()
        };
        drive_controller(conn, request, self.name, rx, cancel, None).await
    }
}

pub struct DecryptVerifyFilesCommand {
    name: &'static str,
    operation: u32,
}

impl DecryptVerifyFilesCommand {
    pub fn new(name: &'static str, operation: u32) -> DecryptVerifyFilesCommand {
        DecryptVerifyFilesCommand { name, operation }
    }
}

#[async_trait]
impl CommandHandler for DecryptVerifyFilesCommand {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_file_mode(conn, self.name)?;
        let files = require_files(conn)?;
        if request.has_option("archive") {
            return Err(CommandError::new(
                codes::INV_ARG,
                "--archive is not supported for decryption or verification",
            ));
        }

        let mut operation = self.operation;
        if request.has_option("no-verify") {
            operation &= !flags::VERIFY_MASK;
        }
        if operation & flags::DECRYPT_MASK == flags::DECRYPT_OFF
            && operation & flags::VERIFY_MASK == flags::VERIFY_OFF
        {
            return Err(CommandError::new(
                codes::CONFLICT,
                format!("--no-verify cannot be used with {}", self.name),
            ));
        }

        let controller = Arc::new(DecryptVerifyController::new(conn.engine()));
        controller.set_operation(operation)?;
        controller.set_protocol(requested_protocol(request)?);
        controller.set_session_title(conn.session_title());

        let (tx, rx) = mpsc::unbounded_channel();
        controller.connect(tx);
        controller.start_files(files)?;

        let cancel = {
            let controller = Arc::clone(&controller);
            move || controller.cancel()
        };
        drive_controller(conn, request, self.name, rx, cancel, None).await
    }
}

pub struct ImportFilesCommand;

#[async_trait]
impl CommandHandler for ImportFilesCommand {
    fn name(&self) -> &'static str {
        "IMPORT_FILES"
    }

    async fn run(&self, conn: &mut Connection, _request: &Request) -> CommandResult<()> {
        require_file_mode(conn, "IMPORT_FILES")?;
        let files = require_files(conn)?;

        let result = conn.engine().import_certificates(&files).await?;
        debug!(
            "import: {} considered, {} imported, {} unchanged",
            result.considered, result.imported, result.unchanged
        );
        conn.send_status(
            "IMPORT_RES",
            &format!(
                "{} {} {}",
                result.considered, result.imported, result.unchanged
            ),
        )
        .await?;
        Ok(())
    }
}
