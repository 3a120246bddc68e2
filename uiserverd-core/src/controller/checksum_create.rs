//! Controller behind CHECKSUM_CREATE_FILES.
//!
//! Input is either a set of data files (fresh sum files get written
//! next to them) or a set of existing sum files (their directories get
//! re-checksummed). Digests are computed in-process; no engine is
//! involved. The directory walk runs on the blocking pool and checks a
//! cancel flag between files.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::mpsc::UnboundedSender;

use super::{ControllerEvent, EventPort};
use crate::checksum::{
    classify_files, definition_by_id, definition_for_file_name, definitions_from_config,
    parse_sum_file, write_sum_file, ChecksumDefinition, ChecksumInputs, SumFileEntry,
};
use crate::config::ChecksumConfig;
use crate::error::{codes, CommandError, CommandResult};

#[derive(Debug, Clone, Default)]
pub struct ChecksumCreateReport {
    pub written: Vec<PathBuf>,
    pub errors: Vec<String>,
}

pub struct ChecksumCreateController {
    inner: Arc<CreateInner>,
}

struct CreateInner {
    definitions: Vec<Arc<ChecksumDefinition>>,
    default_id: String,
    port: EventPort,
    cancel_flag: AtomicBool,
    state: Mutex<CreateState>,
}

#[derive(Default)]
struct CreateState {
    files: Vec<PathBuf>,
    allow_addition: bool,
    started: bool,
    report: ChecksumCreateReport,
}

impl ChecksumCreateController {
    pub fn new(config: &ChecksumConfig) -> CommandResult<Self> {
        Ok(ChecksumCreateController {
            inner: Arc::new(CreateInner {
                definitions: definitions_from_config(config)?,
                default_id: config.default_definition.clone(),
                port: EventPort::new(),
                cancel_flag: AtomicBool::new(false),
                state: Mutex::new(CreateState::default()),
            }),
        })
    }

    pub fn connect(&self, sender: UnboundedSender<ControllerEvent>) {
        self.inner.port.connect(sender);
    }

    pub fn set_allow_addition(&self, allow: bool) {
        self.inner.state.lock().unwrap().allow_addition = allow;
    }

    pub fn set_files(&self, files: Vec<PathBuf>) -> CommandResult<()> {
        if files.is_empty() {
            return Err(CommandError::new(codes::INV_ARG, "No files given"));
        }
        self.inner.state.lock().unwrap().files = files;
        Ok(())
    }

    pub fn report(&self) -> ChecksumCreateReport {
        self.inner.state.lock().unwrap().report.clone()
    }

    pub fn start(&self) -> CommandResult<()> {
        let (files, allow_addition) = {
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
            (state.files.clone(), state.allow_addition)
        };

        let inputs = classify_files(&files, &self.inner.definitions)?;

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let report = inner.run_blocking(inputs, allow_addition);
            let errors = report.errors.clone();
            inner.state.lock().unwrap().report = report;
            if inner.cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            if errors.is_empty() {
                inner.port.settle_done();
            } else {
                inner
                    .port
                    .settle_error(codes::GENERAL, errors.join("; "));
            }
        });
        Ok(())
    }

    pub fn cancel(&self) {
        self.inner.cancel_flag.store(true, Ordering::SeqCst);
        self.inner.port.settle_error(codes::CANCELED, "User canceled");
    }
}

impl CreateInner {
    fn canceled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    fn run_blocking(&self, inputs: ChecksumInputs, allow_addition: bool) -> ChecksumCreateReport {
        let mut report = ChecksumCreateReport::default();

        // Work list: per directory, the definition to use and the names
        // to checksum.
        let jobs: Vec<(PathBuf, Arc<ChecksumDefinition>, Vec<String>)> = match inputs {
            ChecksumInputs::DataFiles(files) => {
                let definition = match definition_by_id(&self.definitions, &self.default_id) {
                    Ok(d) => Arc::clone(d),
                    Err(err) => {
                        report.errors.push(err.message);
                        return report;
                    }
                };
                crate::checksum::group_by_directory(&files)
                    .into_iter()
                    .map(|(dir, names)| (dir, Arc::clone(&definition), names))
                    .collect()
            }
            ChecksumInputs::SumFiles(sum_files) => {
                let mut jobs = Vec::new();
                for sum_file in sum_files {
                    let Some(name) = sum_file.file_name().and_then(|n| n.to_str()) else {
                        report
                            .errors
                            .push(format!("Bad file name: {}", sum_file.display()));
                        continue;
                    };
                    let Some(definition) = definition_for_file_name(&self.definitions, name)
                    else {
                        report
                            .errors
                            .push(format!("No checksum definition matches {name}"));
                        continue;
                    };
                    let dir = sum_file
                        .parent()
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("."));
                    match self.names_for_sum_file(&sum_file, &dir, allow_addition) {
                        Ok(names) => jobs.push((dir, Arc::clone(definition), names)),
                        Err(err) => report.errors.push(err),
                    }
                }
                jobs
            }
        };

        for (dir, definition, names) in jobs {
            if self.canceled() {
                return report;
            }
            info!(
                "creating {} for {} file(s) in {}",
                definition.output_file,
                names.len(),
                dir.display()
            );
            let mut entries = Vec::with_capacity(names.len());
            for name in names {
                if self.canceled() {
                    return report;
                }
                let path = dir.join(&name);
                match definition.algorithm.digest_file(&path) {
                    Ok(checksum) => entries.push(SumFileEntry {
                        checksum,
                        binary: false,
                        file_name: name,
                    }),
                    Err(err) => {
                        warn!("cannot checksum {}: {err}", path.display());
                        report
                            .errors
                            .push(format!("Cannot read {}: {err}", path.display()));
                    }
                }
            }
            if entries.is_empty() {
                report
                    .errors
                    .push(format!("Nothing to checksum in {}", dir.display()));
                continue;
            }
            match write_sum_file(&dir, &definition, &entries) {
                Ok(path) => report.written.push(path),
                Err(err) => report.errors.push(format!(
                    "Cannot write {} in {}: {err}",
                    definition.output_file,
                    dir.display()
                )),
            }
        }
        report
    }

    /// Names to checksum when the input is an existing sum file: the
    /// listed entries, plus every other plain file in the directory
    /// when additions are allowed.
    fn names_for_sum_file(
        &self,
        sum_file: &PathBuf,
        dir: &PathBuf,
        allow_addition: bool,
    ) -> Result<Vec<String>, String> {
        let entries = parse_sum_file(sum_file)
            .map_err(|e| format!("Cannot read {}: {e}", sum_file.display()))?;
        let mut names: BTreeSet<String> =
            entries.into_iter().map(|e| e.file_name).collect();

        if allow_addition {
            let listing = fs::read_dir(dir)
                .map_err(|e| format!("Cannot list {}: {e}", dir.display()))?;
            for entry in listing.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if !file_type.is_file() {
                    continue;
                }
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                // Never checksum sum files themselves.
                if definition_for_file_name(&self.definitions, &name).is_some() {
                    continue;
                }
                names.insert(name);
            }
        }
        Ok(names.into_iter().collect())
    }
}
