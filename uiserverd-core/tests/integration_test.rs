//! End-to-end tests driving a bound server over its Unix socket.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use uiserverd_core::engine::{
    Certificate, CertificateResolver, CryptoEngine, EngineError, ImportResult,
    NullCertificateResolver, NullEngine, Protocol, ResolveError, ResolveRequest,
    ResolvedCertificates, SelectionFilter, TaskOutput, TaskSpec,
};
use uiserverd_core::error::{bare_code, codes};
use uiserverd_core::server::ShutdownSignal;
use uiserverd_core::{UiServer, UiServerConfig};

// ============================================================================
// Harness
// ============================================================================

struct ScriptedEngine {
    executed: AtomicUsize,
}

#[async_trait]
impl CryptoEngine for ScriptedEngine {
    async fn execute(&self, _spec: TaskSpec) -> Result<TaskOutput, EngineError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(TaskOutput::default())
    }

    async fn import_certificates(&self, files: &[PathBuf]) -> Result<ImportResult, EngineError> {
        Ok(ImportResult {
            considered: files.len() as u32,
            imported: files.len() as u32,
            unchanged: 0,
        })
    }
}

struct ScriptedResolver;

#[async_trait]
impl CertificateResolver for ScriptedResolver {
    async fn resolve(&self, request: ResolveRequest) -> Result<ResolvedCertificates, ResolveError> {
        let cert = Certificate {
            fingerprint: "DEADBEEF".repeat(5),
            user_id: "Alice <alice@example.com>".to_owned(),
            protocol: Protocol::OpenPgp,
            can_sign: true,
            can_encrypt: true,
            has_secret_key: true,
        };
        Ok(ResolvedCertificates {
            protocol: request.protocol.unwrap_or(Protocol::OpenPgp),
            signers: if request.signing { vec![cert.clone()] } else { vec![] },
            recipients: if request.encrypting { vec![cert] } else { vec![] },
        })
    }

    async fn select_certificates(
        &self,
        _filter: SelectionFilter,
        _preselected: Vec<String>,
    ) -> Result<Vec<Certificate>, ResolveError> {
        Ok(vec![
            Certificate {
                fingerprint: "AAAA1111".to_owned(),
                user_id: "Alice <alice@example.com>".to_owned(),
                protocol: Protocol::OpenPgp,
                can_sign: true,
                can_encrypt: true,
                has_secret_key: true,
            },
            Certificate {
                fingerprint: "BBBB2222".to_owned(),
                user_id: "Bob <bob@example.com>".to_owned(),
                protocol: Protocol::OpenPgp,
                can_sign: true,
                can_encrypt: true,
                has_secret_key: false,
            },
        ])
    }
}

struct TestServer {
    socket: PathBuf,
    shutdown: Arc<ShutdownSignal>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

async fn start_server(
    engine: Arc<dyn CryptoEngine>,
    resolver: Arc<dyn CertificateResolver>,
) -> TestServer {
    let dir = TempDir::new().unwrap();
    let mut config = UiServerConfig::default_with_dir(dir.path());
    config.watcher.enabled = false;
    let server = UiServer::bind(Arc::new(config), engine, resolver)
        .await
        .expect("bind");
    let socket = server.socket_path().to_path_buf();
    let shutdown = server.shutdown_signal();
    let handle = tokio::spawn(server.run());
    TestServer {
        socket,
        shutdown,
        handle,
        _dir: dir,
    }
}

async fn scripted_server() -> (TestServer, Arc<ScriptedEngine>) {
    let engine = Arc::new(ScriptedEngine {
        executed: AtomicUsize::new(0),
    });
    let server = start_server(Arc::clone(&engine) as _, Arc::new(ScriptedResolver)).await;
    (server, engine)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &Path) -> Client {
        let stream = UnixStream::connect(path).await.expect("connect");
        let (read, writer) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(read),
            writer,
        };
        let greeting = client.read_line().await;
        assert!(greeting.starts_with("OK"), "unexpected greeting: {greeting}");
        client
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.expect("read");
        assert!(n > 0, "server closed the connection");
        line.trim_end().to_owned()
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write");
    }

    /// One command round trip: everything up to and including OK/ERR.
    async fn roundtrip(&mut self, line: &str) -> Vec<String> {
        self.send(line).await;
        let mut replies = Vec::new();
        loop {
            let reply = self.read_line().await;
            let done = reply.starts_with("OK") || reply.starts_with("ERR");
            replies.push(reply);
            if done {
                return replies;
            }
        }
    }

    async fn expect_ok(&mut self, line: &str) -> Vec<String> {
        let replies = self.roundtrip(line).await;
        let last = replies.last().unwrap();
        assert!(last.starts_with("OK"), "{line} failed: {replies:?}");
        replies
    }

    async fn expect_err(&mut self, line: &str, code: u32) {
        let replies = self.roundtrip(line).await;
        let last = replies.last().unwrap();
        let wire: u32 = last
            .split_whitespace()
            .nth(1)
            .and_then(|token| token.parse().ok())
            .unwrap_or_else(|| panic!("expected an ERR reply for {line}, got {last}"));
        assert_eq!(bare_code(wire), code, "unexpected error for {line}: {last}");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn echo_round_trip_and_bye() {
    let (server, _) = scripted_server().await;
    let mut client = Client::connect(&server.socket).await;

    let replies = client.expect_ok("ECHO hello over the wire").await;
    assert_eq!(replies[0], "D hello over the wire");

    let replies = client.expect_ok("BYE").await;
    assert_eq!(replies[0], "OK closing connection");
}

#[tokio::test]
async fn prep_encrypt_hands_over_to_a_second_connection() {
    let (server, engine) = scripted_server().await;

    let mut composer = Client::connect(&server.socket).await;
    composer.expect_ok("SESSION 21 mail composer").await;
    composer.expect_ok("RECIPIENT alice@example.com").await;
    composer.expect_ok("PREP_ENCRYPT").await;

    // Second connection joins the same session and encrypts without
    // repeating the recipients.
    let mut sender = Client::connect(&server.socket).await;
    sender.expect_ok("SESSION 21").await;
    sender.expect_ok("INPUT FILE=/tmp/mail-body.txt").await;
    sender.expect_ok("OUTPUT FILE=/tmp/mail-body.txt.asc").await;
    sender.expect_ok("ENCRYPT").await;

    assert_eq!(engine.executed.load(Ordering::SeqCst), 1);

    composer.expect_ok("BYE").await;
    sender.expect_ok("BYE").await;
    server.shutdown.signal();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn prep_sign_reports_protocol_and_sign_consumes_the_memento() {
    let (server, engine) = scripted_server().await;
    let mut client = Client::connect(&server.socket).await;

    client.expect_ok("SESSION 40").await;
    client.expect_ok("SENDER alice@example.com").await;
    let replies = client.expect_ok("PREP_SIGN").await;
    assert!(
        replies.contains(&"S PROTOCOL OpenPGP".to_owned()),
        "missing protocol status: {replies:?}"
    );

    client.expect_ok("INPUT FILE=/tmp/mail-body.txt").await;
    client.expect_ok("OUTPUT FILE=/tmp/mail-body.txt.sig").await;
    client.expect_ok("SIGN").await;

    assert_eq!(engine.executed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn encrypt_validation_errors_reach_the_wire() {
    let (server, _) = scripted_server().await;
    let mut client = Client::connect(&server.socket).await;

    // No recipients and no parked preparation.
    client.expect_ok("INPUT FILE=/tmp/a.txt").await;
    client.expect_ok("OUTPUT FILE=/tmp/a.txt.asc").await;
    client.expect_err("ENCRYPT", codes::MISSING_VALUE).await;

    // Failed commands clear their per-command state, so this starts
    // from a clean slate and trips over the missing INPUT instead.
    client.expect_ok("RECIPIENT alice@example.com").await;
    client.expect_err("ENCRYPT", codes::ASS_NO_INPUT).await;

    client
        .expect_err("INPUT FILE=relative/path.txt", codes::INV_ARG)
        .await;
    client.expect_err("INPUT FD=7", codes::NOT_IMPLEMENTED).await;
}

#[tokio::test]
async fn reset_drops_the_session_binding() {
    let (server, _) = scripted_server().await;
    let mut client = Client::connect(&server.socket).await;

    client.expect_ok("SESSION 31").await;
    client.expect_ok("RECIPIENT alice@example.com").await;
    client.expect_ok("PREP_ENCRYPT").await;
    client.expect_ok("RESET").await;

    // The parked preparation is no longer reachable and no recipients
    // are known on this connection anymore.
    client.expect_ok("INPUT FILE=/tmp/a.txt").await;
    client.expect_ok("OUTPUT FILE=/tmp/a.txt.asc").await;
    client.expect_err("ENCRYPT", codes::MISSING_VALUE).await;
}

#[tokio::test]
async fn malformed_lines_do_not_kill_the_connection() {
    let (server, _) = scripted_server().await;
    let mut client = Client::connect(&server.socket).await;

    client
        .expect_err("FROBNICATE", codes::ASS_UNKNOWN_CMD)
        .await;

    let oversized = format!("ECHO {}", "x".repeat(1200));
    client
        .expect_err(&oversized, codes::ASS_LINE_TOO_LONG)
        .await;

    client.expect_ok("NOP").await;
}

#[tokio::test]
async fn select_certificate_inquires_and_sends_the_selection() {
    let (server, _) = scripted_server().await;
    let mut client = Client::connect(&server.socket).await;

    client.send("SELECT_CERTIFICATE --multi").await;
    let inquiry = client.read_line().await;
    assert_eq!(inquiry, "INQUIRE SELECTED_CERTIFICATES");
    client.send("END").await;

    let data = client.read_line().await;
    assert_eq!(data, "D AAAA1111%0ABBBB2222%0A");
    let done = client.read_line().await;
    assert!(done.starts_with("OK"), "unexpected reply: {done}");
}

#[tokio::test]
async fn checksum_create_and_verify_files() {
    let server = start_server(Arc::new(NullEngine), Arc::new(NullCertificateResolver)).await;
    let work = TempDir::new().unwrap();
    let report = work.path().join("report.txt");
    let notes = work.path().join("notes.txt");
    fs::write(&report, b"quarterly numbers\n").unwrap();
    fs::write(&notes, b"meeting notes\n").unwrap();

    let mut client = Client::connect(&server.socket).await;
    client
        .expect_ok(&format!("FILE {}", report.display()))
        .await;
    client.expect_ok(&format!("FILE {}", notes.display())).await;
    client.expect_ok("CHECKSUM_CREATE_FILES").await;

    let sum_file = work.path().join("SHA256SUMS");
    let written = fs::read_to_string(&sum_file).unwrap();
    assert_eq!(written.lines().count(), 2);

    client
        .expect_ok(&format!("FILE {}", sum_file.display()))
        .await;
    client.expect_ok("CHECKSUM_VERIFY_FILES").await;

    fs::write(&notes, b"tampered notes\n").unwrap();
    client
        .expect_ok(&format!("FILE {}", work.path().display()))
        .await;
    client
        .expect_err("CHECKSUM_VERIFY_FILES", codes::GENERAL)
        .await;
}

#[tokio::test]
async fn import_files_reports_counts_over_the_wire() {
    let (server, _) = scripted_server().await;
    let mut client = Client::connect(&server.socket).await;

    client.expect_ok("FILE /tmp/alice.asc").await;
    client.expect_ok("FILE /tmp/bob.asc").await;
    let replies = client.expect_ok("IMPORT_FILES").await;
    assert!(
        replies.contains(&"S IMPORT_RES 2 2 0".to_owned()),
        "missing import status: {replies:?}"
    );
}

#[tokio::test]
async fn shutdown_signal_stops_the_server_and_removes_the_socket() {
    let (server, _) = scripted_server().await;

    // Make sure the accept loop is up before asking it to stop.
    let mut client = Client::connect(&server.socket).await;
    client.expect_ok("NOP").await;

    server.shutdown.signal();
    server.handle.await.unwrap().unwrap();
    assert!(!server.socket.exists());
}
