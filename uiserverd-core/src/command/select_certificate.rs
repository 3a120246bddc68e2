//! SELECT_CERTIFICATE, the interactive certificate picker.
//!
//! Options narrow the candidate set; naming neither --sign-only nor
//! --encrypt-only (or both) accepts certificates of any usage, and the
//! same fallback applies to the format options. Before the picker runs
//! the client is asked for fingerprints to preselect.

use async_trait::async_trait;

use crate::assuan::Request;
use crate::engine::{CertificateFormat, CertificateUsage, SelectionFilter};
use crate::error::{codes, CommandError, CommandResult};
use crate::server::Connection;

use super::CommandHandler;

pub struct SelectCertificateCommand;

#[async_trait]
impl CommandHandler for SelectCertificateCommand {
    fn name(&self) -> &'static str {
        "SELECT_CERTIFICATE"
    }

    async fn run(&self, conn: &mut Connection, request: &Request) -> CommandResult<()> {
        let sign = request.has_option("sign-only");
        let encrypt = request.has_option("encrypt-only");
        let usage = match (sign, encrypt) {
            (true, false) => CertificateUsage::SignOnly,
            (false, true) => CertificateUsage::EncryptOnly,
            _ => CertificateUsage::AnyUsage,
        };

        let openpgp = request.has_option("openpgp-only");
        let x509 = request.has_option("x509-only");
        let format = match (openpgp, x509) {
            (true, true) => {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "--openpgp-only and --x509-only are mutually exclusive",
                ))
            }
            (true, false) => CertificateFormat::OpenPgpOnly,
            (false, true) => CertificateFormat::CmsOnly,
            (false, false) => CertificateFormat::AnyFormat,
        };

        let filter = SelectionFilter {
            multiple: request.has_option("multi"),
            usage,
            format,
            secret_only: request.has_option("secret-only"),
        };

        // A client that answers CAN simply gets a picker with nothing
        // preselected.
        let mut preselected = Vec::new();
        if let Some(data) = conn.inquire("SELECTED_CERTIFICATES").await? {
            preselected.extend(
                String::from_utf8_lossy(&data)
                    .split_whitespace()
                    .map(str::to_owned),
            );
        }

        let selected = conn
            .resolver()
            .select_certificates(filter, preselected)
            .await?;

        let mut payload = String::new();
        for certificate in &selected {
            payload.push_str(&certificate.fingerprint);
            payload.push('\n');
        }
        conn.send_data(payload.as_bytes()).await
    }
}
