//! CHECKSUM_CREATE_FILES and CHECKSUM_VERIFY_FILES.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc;

use crate::assuan::Request;
use crate::controller::{ChecksumCreateController, ChecksumVerifyController};
use crate::error::CommandResult;
use crate::server::Connection;

use super::{drive_controller, require_file_mode, require_files, CommandHandler};

pub struct ChecksumCreateFilesCommand;

#[async_trait]
impl CommandHandler for ChecksumCreateFilesCommand {
    fn name(&self) -> &'static str {
        "CHECKSUM_CREATE_FILES"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_file_mode(conn, "CHECKSUM_CREATE_FILES")?;
        let files = require_files(conn)?;

        let controller = Arc::new(ChecksumCreateController::new(&conn.config().checksums)?);
        controller.set_allow_addition(request.has_option("allow-addition"));
        controller.set_files(files)?;

        let (tx, rx) = mpsc::unbounded_channel();
        controller.connect(tx);
        controller.start()?;

        let cancel = {
            let controller = Arc::clone(&controller);
            move || controller.cancel()
        };
        drive_controller(conn, request, "CHECKSUM_CREATE_FILES", rx, cancel, None).await?;

        let report = controller.report();
        info!("wrote {} checksum file(s)", report.written.len());
        Ok(())
    }
}

pub struct ChecksumVerifyFilesCommand;

#[async_trait]
impl CommandHandler for ChecksumVerifyFilesCommand {
    fn name(&self) -> &'static str {
        "CHECKSUM_VERIFY_FILES"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        require_file_mode(conn, "CHECKSUM_VERIFY_FILES")?;
        let files = require_files(conn)?;

        let controller = Arc::new(ChecksumVerifyController::new(&conn.config().checksums)?);
        controller.set_files(files)?;

        let (tx, rx) = mpsc::unbounded_channel();
        controller.connect(tx);
        controller.start()?;

        let cancel = {
            let controller = Arc::clone(&controller);
            move || controller.cancel()
        };
        drive_controller(conn, request, "CHECKSUM_VERIFY_FILES", rx, cancel, None).await?;

        let report = controller.report();
        info!("verified {} file(s)", report.results.len());
        Ok(())
    }
}
