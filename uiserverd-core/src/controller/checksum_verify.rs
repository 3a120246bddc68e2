//! Controller behind CHECKSUM_VERIFY_FILES.
//!
//! Inputs are sum files, or directories that get scanned recursively
//! for sum files. Every listed entry is re-digested and compared. Like
//! the create side this runs on the blocking pool with a cancel flag
//! checked between files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::mpsc::UnboundedSender;

use super::{ControllerEvent, EventPort};
use crate::checksum::{
    definition_for_file_name, definitions_from_config, find_base_directories, parse_sum_file,
    ChecksumDefinition,
};
use crate::config::ChecksumConfig;
use crate::error::{codes, CommandError, CommandResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Ok,
    Mismatch,
    Unreadable(String),
}

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub sum_file: PathBuf,
    pub file_name: String,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ChecksumVerifyReport {
    pub results: Vec<VerifyResult>,
    pub errors: Vec<String>,
}

impl ChecksumVerifyReport {
    pub fn failed_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.status != FileStatus::Ok)
            .map(|r| r.file_name.as_str())
            .collect()
    }
}

pub struct ChecksumVerifyController {
    inner: Arc<VerifyInner>,
}

struct VerifyInner {
    definitions: Vec<Arc<ChecksumDefinition>>,
    port: EventPort,
    cancel_flag: AtomicBool,
    state: Mutex<VerifyState>,
}

#[derive(Default)]
struct VerifyState {
    files: Vec<PathBuf>,
    started: bool,
    report: ChecksumVerifyReport,
}

impl ChecksumVerifyController {
    pub fn new(config: &ChecksumConfig) -> CommandResult<Self> {
        Ok(ChecksumVerifyController {
            inner: Arc::new(VerifyInner {
                definitions: definitions_from_config(config)?,
                port: EventPort::new(),
                cancel_flag: AtomicBool::new(false),
                state: Mutex::new(VerifyState::default()),
            }),
        })
    }

    pub fn connect(&self, sender: UnboundedSender<ControllerEvent>) {
        self.inner.port.connect(sender);
    }

    pub fn set_files(&self, files: Vec<PathBuf>) -> CommandResult<()> {
        if files.is_empty() {
            return Err(CommandError::new(codes::INV_ARG, "No files given"));
        }
        self.inner.state.lock().unwrap().files = files;
        Ok(())
    }

    pub fn report(&self) -> ChecksumVerifyReport {
        self.inner.state.lock().unwrap().report.clone()
    }

    pub fn start(&self) -> CommandResult<()> {
        let files = {
            let mut state = self.inner.state.lock().unwrap();
            if state.started {
                return Err(CommandError::new(
                    codes::CONFLICT,
                    "operation already started",
                ));
            }
            if state.files.is_empty() {
                return Err(CommandError::new(codes::INV_ARG, "No files given"));
            }
            state.started = true;
            state.files.clone()
        };

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let report = inner.run_blocking(&files);
            let failed: Vec<String> = report
                .failed_names()
                .iter()
                .map(|s| s.to_string())
                .collect();
            let errors = report.errors.clone();
            inner.state.lock().unwrap().report = report;
            if inner.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            if !failed.is_empty() {
                inner.port.settle_error(
                    codes::GENERAL,
                    format!("Checksum mismatch: {}", failed.join(", ")),
                );
            } else if !errors.is_empty() {
                inner
                    .port
                    .settle_error(codes::GENERAL, errors.join("; "));
            } else {
                inner.port.settle_done();
            }
        });
        Ok(())
    }

    pub fn cancel(&self) {
        self.inner.cancel_flag.store(true, Ordering::SeqCst);
        self.inner.port.settle_error(codes::CANCELED, "User canceled");
    }
}

impl VerifyInner {
    fn canceled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    fn run_blocking(&self, files: &[PathBuf]) -> ChecksumVerifyReport {
        let mut report = ChecksumVerifyReport::default();

        for base in find_base_directories(files.iter().cloned()) {
            info!("verifying checksums under {}", base.display());
        }

        let mut sum_files = Vec::new();
        for file in files {
            if file.is_dir() {
                self.scan_for_sum_files(file, &mut sum_files, &mut report.errors);
            } else {
                match file.file_name().and_then(|n| n.to_str()) {
                    Some(name) if definition_for_file_name(&self.definitions, name).is_some() => {
                        sum_files.push(file.clone())
                    }
                    _ => report
                        .errors
                        .push(format!("Not a checksum file: {}", file.display())),
                }
            }
        }
        if sum_files.is_empty() && report.errors.is_empty() {
            report.errors.push("No checksum files found".to_string());
        }

        for sum_file in sum_files {
            if self.canceled() {
                return report;
            }
            self.verify_sum_file(&sum_file, &mut report);
        }

        let failed = report.failed_names().len();
        if failed == 0 {
            info!("checksum verification passed for {} file(s)", report.results.len());
        } else {
            warn!("checksum verification failed for {failed} file(s)");
        }
        report
    }

    /// Recursive scan for files whose name matches one of the checksum
    /// definitions.
    fn scan_for_sum_files(&self, dir: &Path, out: &mut Vec<PathBuf>, errors: &mut Vec<String>) {
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            if self.canceled() {
                return;
            }
            let listing = match fs::read_dir(&current) {
                Ok(l) => l,
                Err(err) => {
                    errors.push(format!("Cannot list {}: {err}", current.display()));
                    continue;
                }
            };
            for entry in listing.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if definition_for_file_name(&self.definitions, name).is_some() {
                        out.push(path);
                    }
                }
            }
        }
        out.sort();
    }

    fn verify_sum_file(&self, sum_file: &Path, report: &mut ChecksumVerifyReport) {
        let Some(name) = sum_file.file_name().and_then(|n| n.to_str()) else {
            report
                .errors
                .push(format!("Bad file name: {}", sum_file.display()));
            return;
        };
        let Some(definition) = definition_for_file_name(&self.definitions, name) else {
            report
                .errors
                .push(format!("No checksum definition matches {name}"));
            return;
        };
        let entries = match parse_sum_file(sum_file) {
            Ok(entries) => entries,
            Err(err) => {
                report
                    .errors
                    .push(format!("Cannot read {}: {err}", sum_file.display()));
                return;
            }
        };
        let dir = sum_file.parent().unwrap_or_else(|| Path::new("."));
        for entry in entries {
            if self.canceled() {
                return;
            }
            let path = dir.join(&entry.file_name);
            let status = match definition.algorithm.digest_file(&path) {
                Ok(actual) if actual.eq_ignore_ascii_case(&entry.checksum) => FileStatus::Ok,
                Ok(_) => FileStatus::Mismatch,
                Err(err) => FileStatus::Unreadable(err.to_string()),
            };
            report.results.push(VerifyResult {
                sum_file: sum_file.to_path_buf(),
                file_name: entry.file_name,
                status,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{write_sum_file, ChecksumAlgorithm, SumFileEntry};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn controller() -> (
        ChecksumVerifyController,
        mpsc::UnboundedReceiver<ControllerEvent>,
    ) {
        let ctl = ChecksumVerifyController::new(&ChecksumConfig::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        ctl.connect(tx);
        (ctl, rx)
    }

    fn write_sums_for(dir: &Path, names: &[&str]) {
        let entries: Vec<SumFileEntry> = names
            .iter()
            .map(|name| SumFileEntry {
                checksum: ChecksumAlgorithm::Sha256
                    .digest_file(&dir.join(name))
                    .unwrap(),
                binary: false,
                file_name: name.to_string(),
            })
            .collect();
        let definition = crate::checksum::definitions_from_config(&ChecksumConfig::default())
            .unwrap()
            .into_iter()
            .find(|d| d.id == "sha256sum")
            .unwrap();
        write_sum_file(dir, &definition, &entries).unwrap();
    }

    #[tokio::test]
    async fn matching_checksums_verify_clean() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("b.txt"), b"beta").unwrap();
        write_sums_for(dir.path(), &["a.txt", "b.txt"]);

        let (ctl, mut rx) = controller();
        ctl.set_files(vec![dir.path().join("SHA256SUMS")]).unwrap();
        ctl.start().unwrap();
        assert_eq!(rx.recv().await, Some(ControllerEvent::Done));
        assert!(ctl.report().failed_names().is_empty());
        assert_eq!(ctl.report().results.len(), 2);
    }

    #[tokio::test]
    async fn tampered_file_is_flagged() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        write_sums_for(dir.path(), &["a.txt"]);
        fs::write(dir.path().join("a.txt"), b"tampered").unwrap();

        let (ctl, mut rx) = controller();
        ctl.set_files(vec![dir.path().join("SHA256SUMS")]).unwrap();
        ctl.start().unwrap();
        match rx.recv().await {
            Some(ControllerEvent::Error { code, message }) => {
                assert_eq!(code, codes::GENERAL);
                assert!(message.contains("a.txt"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(ctl.report().results[0].status, FileStatus::Mismatch);
    }

    #[tokio::test]
    async fn directory_input_is_scanned_recursively() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("release").join("v2");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("pkg.bin"), b"payload").unwrap();
        write_sums_for(&nested, &["pkg.bin"]);

        let (ctl, mut rx) = controller();
        ctl.set_files(vec![dir.path().to_path_buf()]).unwrap();
        ctl.start().unwrap();
        assert_eq!(rx.recv().await, Some(ControllerEvent::Done));
        assert_eq!(ctl.report().results.len(), 1);
        assert_eq!(ctl.report().results[0].file_name, "pkg.bin");
    }

    #[tokio::test]
    async fn missing_listed_file_is_unreadable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        write_sums_for(dir.path(), &["a.txt"]);
        fs::remove_file(dir.path().join("a.txt")).unwrap();

        let (ctl, mut rx) = controller();
        ctl.set_files(vec![dir.path().join("SHA256SUMS")]).unwrap();
        ctl.start().unwrap();
        match rx.recv().await {
            Some(ControllerEvent::Error { message, .. }) => {
                assert!(message.contains("a.txt"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(
            ctl.report().results[0].status,
            FileStatus::Unreadable(_)
        ));
    }

    #[tokio::test]
    async fn plain_data_file_input_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("data.bin"), b"x").unwrap();

        let (ctl, mut rx) = controller();
        ctl.set_files(vec![dir.path().join("data.bin")]).unwrap();
        ctl.start().unwrap();
        match rx.recv().await {
            Some(ControllerEvent::Error { message, .. }) => {
                assert!(message.contains("Not a checksum file"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
