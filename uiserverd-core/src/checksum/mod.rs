//! Checksum definitions and the GNU style sum file format.
//!
//! A definition ties a digest algorithm to the sum file it writes
//! (SHA256SUMS and friends) and to the name patterns it recognizes. The
//! format is the one sha256sum produces: one `<digest>  <name>` line
//! per file, with a leading backslash and escaped name when the name
//! contains backslashes or newlines.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use sha2::Digest;
use uuid::Uuid;

use crate::config::ChecksumConfig;
use crate::error::{codes, CommandError, CommandResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
    Blake3,
}

impl ChecksumAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" => Some(ChecksumAlgorithm::Sha512),
            "blake3" | "b3" => Some(ChecksumAlgorithm::Blake3),
            _ => None,
        }
    }

    /// Length of the hex rendering of one digest.
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha512 => 128,
            ChecksumAlgorithm::Blake3 => 64,
        }
    }

    /// Stream a file through the digest, returning lowercase hex.
    pub fn digest_file(&self, path: &Path) -> std::io::Result<String> {
        let mut reader = BufReader::new(fs::File::open(path)?);
        let mut buf = [0u8; 8192];
        match self {
            ChecksumAlgorithm::Sha256 => {
                let mut hasher = sha2::Sha256::new();
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
            ChecksumAlgorithm::Sha512 => {
                let mut hasher = sha2::Sha512::new();
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
            ChecksumAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hasher.finalize().to_hex().to_string())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChecksumDefinition {
    pub id: String,
    pub label: String,
    pub algorithm: ChecksumAlgorithm,
    /// Name of the sum file this definition writes.
    pub output_file: String,
    patterns: Vec<glob::Pattern>,
}

impl ChecksumDefinition {
    fn new(
        id: &str,
        label: &str,
        algorithm: ChecksumAlgorithm,
        output_file: &str,
        patterns: &[&str],
    ) -> Self {
        ChecksumDefinition {
            id: id.to_owned(),
            label: label.to_owned(),
            algorithm,
            output_file: output_file.to_owned(),
            patterns: patterns
                .iter()
                .map(|p| glob::Pattern::new(p).expect("built-in pattern is valid"))
                .collect(),
        }
    }

    /// Does `name` look like a sum file of this definition?
    pub fn matches_file_name(&self, name: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: false,
            ..Default::default()
        };
        self.patterns
            .iter()
            .any(|p| p.matches_with(name, options))
    }
}

lazy_static! {
    static ref BUILT_IN: Vec<Arc<ChecksumDefinition>> = vec![
        Arc::new(ChecksumDefinition::new(
            "sha256sum",
            "SHA-256 checksums",
            ChecksumAlgorithm::Sha256,
            "SHA256SUMS",
            &["SHA256SUMS", "sha256sum.txt", "*.sha256"],
        )),
        Arc::new(ChecksumDefinition::new(
            "sha512sum",
            "SHA-512 checksums",
            ChecksumAlgorithm::Sha512,
            "SHA512SUMS",
            &["SHA512SUMS", "sha512sum.txt", "*.sha512"],
        )),
        Arc::new(ChecksumDefinition::new(
            "b3sum",
            "BLAKE3 checksums",
            ChecksumAlgorithm::Blake3,
            "B3SUMS",
            &["B3SUMS", "*.b3"],
        )),
    ];
}

/// Built-in definitions plus whatever the config adds on top.
pub fn definitions_from_config(
    config: &ChecksumConfig,
) -> CommandResult<Vec<Arc<ChecksumDefinition>>> {
    let mut definitions = BUILT_IN.clone();
    for custom in &config.definitions {
        let algorithm = ChecksumAlgorithm::parse(&custom.algorithm).ok_or_else(|| {
            CommandError::new(
                codes::INV_ARG,
                format!("Unknown checksum algorithm \"{}\"", custom.algorithm),
            )
        })?;
        let mut patterns = Vec::with_capacity(custom.patterns.len());
        for raw in &custom.patterns {
            patterns.push(glob::Pattern::new(raw).map_err(|e| {
                CommandError::new(codes::INV_ARG, format!("Bad sum file pattern \"{raw}\": {e}"))
            })?);
        }
        definitions.push(Arc::new(ChecksumDefinition {
            id: custom.id.clone(),
            label: custom.label.clone(),
            algorithm,
            output_file: custom.output_file.clone(),
            patterns,
        }));
    }
    Ok(definitions)
}

/// The definition whose patterns claim this file name, if any.
pub fn definition_for_file_name<'a>(
    definitions: &'a [Arc<ChecksumDefinition>],
    name: &str,
) -> Option<&'a Arc<ChecksumDefinition>> {
    definitions.iter().find(|d| d.matches_file_name(name))
}

/// The definition picked for creating checksums.
pub fn definition_by_id<'a>(
    definitions: &'a [Arc<ChecksumDefinition>],
    id: &str,
) -> CommandResult<&'a Arc<ChecksumDefinition>> {
    definitions.iter().find(|d| d.id == id).ok_or_else(|| {
        CommandError::new(
            codes::INV_ARG,
            format!("No checksum definition with id \"{id}\""),
        )
    })
}

// ============================================================================
// Sum file format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumFileEntry {
    pub checksum: String,
    pub binary: bool,
    /// Plain file name, escapes already decoded.
    pub file_name: String,
}

lazy_static! {
    static ref SUM_LINE: Regex =
        Regex::new(r"^(\\?)([a-fA-F0-9]+) ([ *])([^\n]+)$").expect("sum line pattern is valid");
}

/// Parse one sum file. Lines that do not look like checksum lines are
/// skipped, matching what the coreutils tools do.
pub fn parse_sum_file(path: &Path) -> std::io::Result<Vec<SumFileEntry>> {
    let raw = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in raw.lines() {
        match SUM_LINE.captures(line) {
            Some(caps) => {
                let escaped = &caps[1] == "\\";
                let file_name = if escaped {
                    decode_escaped_name(&caps[4])
                } else {
                    caps[4].to_owned()
                };
                entries.push(SumFileEntry {
                    checksum: caps[2].to_ascii_lowercase(),
                    binary: &caps[3] == "*",
                    file_name,
                });
            }
            None => {
                if !line.trim().is_empty() {
                    debug!("skipping malformed checksum line: {line:?}");
                }
            }
        }
    }
    Ok(entries)
}

/// Write entries as a sum file into `dir`, atomically via a temp file.
pub fn write_sum_file(
    dir: &Path,
    definition: &ChecksumDefinition,
    entries: &[SumFileEntry],
) -> std::io::Result<PathBuf> {
    let mut content = String::new();
    for entry in entries {
        let (escaped, name) = encode_name(&entry.file_name);
        if escaped {
            content.push('\\');
        }
        content.push_str(&entry.checksum);
        content.push(' ');
        content.push(if entry.binary { '*' } else { ' ' });
        content.push_str(&name);
        content.push('\n');
    }

    let target = dir.join(&definition.output_file);
    let tmp = dir.join(format!("{}.{}.tmp", definition.output_file, Uuid::new_v4()));
    fs::write(&tmp, content)?;
    match fs::rename(&tmp, &target) {
        Ok(()) => Ok(target),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}

fn decode_escaped_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn encode_name(name: &str) -> (bool, String) {
    if !name.contains('\\') && !name.contains('\n') {
        return (false, name.to_owned());
    }
    let mut out = String::with_capacity(name.len() + 2);
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    (true, out)
}

// ============================================================================
// Input classification and grouping
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumInputs {
    SumFiles(Vec<PathBuf>),
    DataFiles(Vec<PathBuf>),
}

/// Sort the given files into sum files or data files. A mixture is an
/// error; the caller cannot sensibly mean both at once.
pub fn classify_files(
    files: &[PathBuf],
    definitions: &[Arc<ChecksumDefinition>],
) -> CommandResult<ChecksumInputs> {
    let mut sum_files = Vec::new();
    let mut data_files = Vec::new();
    for file in files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if definition_for_file_name(definitions, name).is_some() {
            sum_files.push(file.clone());
        } else {
            data_files.push(file.clone());
        }
    }
    match (sum_files.is_empty(), data_files.is_empty()) {
        (false, true) => Ok(ChecksumInputs::SumFiles(sum_files)),
        (true, false) => Ok(ChecksumInputs::DataFiles(data_files)),
        _ => Err(CommandError::new(
            codes::INV_ARG,
            "Cannot mix checksum files and other files",
        )),
    }
}

/// Group files by their parent directory, keeping names only.
pub fn group_by_directory(files: &[PathBuf]) -> BTreeMap<PathBuf, Vec<String>> {
    let mut groups: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for file in files {
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
            groups.entry(dir).or_default().push(name.to_owned());
        }
    }
    groups
}

/// Unique parent directories with descendants collapsed into their
/// ancestors, so a recursive verification visits each tree once.
pub fn find_base_directories(dirs: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut sorted: Vec<PathBuf> = dirs.into_iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut bases: Vec<PathBuf> = Vec::new();
    for dir in sorted {
        if !bases.iter().any(|base| dir.starts_with(base)) {
            bases.push(dir);
        }
    }
    bases
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn built_ins() -> Vec<Arc<ChecksumDefinition>> {
        definitions_from_config(&ChecksumConfig::default()).unwrap()
    }

    #[test]
    fn file_name_patterns_are_case_insensitive() {
        let defs = built_ins();
        assert_eq!(
            definition_for_file_name(&defs, "SHA256SUMS").unwrap().id,
            "sha256sum"
        );
        assert_eq!(
            definition_for_file_name(&defs, "sha256sums").unwrap().id,
            "sha256sum"
        );
        assert_eq!(
            definition_for_file_name(&defs, "release.sha512").unwrap().id,
            "sha512sum"
        );
        assert!(definition_for_file_name(&defs, "README.md").is_none());
    }

    #[test]
    fn known_sha256_answer() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("abc.txt");
        fs::write(&file, b"abc").unwrap();
        assert_eq!(
            ChecksumAlgorithm::Sha256.digest_file(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sum_file_round_trip_with_awkward_names() {
        let dir = TempDir::new().unwrap();
        let defs = built_ins();
        let definition = definition_by_id(&defs, "sha256sum").unwrap();
        let entries = vec![
            SumFileEntry {
                checksum: "aa".repeat(32),
                binary: false,
                file_name: "plain.txt".to_owned(),
            },
            SumFileEntry {
                checksum: "bb".repeat(32),
                binary: true,
                file_name: "back\\slash.bin".to_owned(),
            },
        ];
        let path = write_sum_file(dir.path(), definition, &entries).unwrap();
        assert_eq!(path.file_name().unwrap(), "SHA256SUMS");
        let parsed = parse_sum_file(&path).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("SHA256SUMS");
        fs::write(
            &path,
            format!("# comment\n{}  good.txt\nnot a checksum line\n", "cc".repeat(32)),
        )
        .unwrap();
        let parsed = parse_sum_file(&path).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].file_name, "good.txt");
    }

    #[test]
    fn classify_rejects_mixture() {
        let defs = built_ins();
        let err = classify_files(
            &["SHA256SUMS".into(), "data.bin".into()],
            &defs,
        )
        .unwrap_err();
        assert_eq!(err.code, codes::INV_ARG);

        assert_eq!(
            classify_files(&["a.bin".into(), "b.bin".into()], &defs).unwrap(),
            ChecksumInputs::DataFiles(vec!["a.bin".into(), "b.bin".into()])
        );
    }

    #[test]
    fn base_directories_collapse_children() {
        let bases = find_base_directories(vec![
            PathBuf::from("/data/release/sub"),
            PathBuf::from("/data/release"),
            PathBuf::from("/data/other"),
            PathBuf::from("/data/release/sub/deep"),
        ]);
        assert_eq!(
            bases,
            vec![PathBuf::from("/data/other"), PathBuf::from("/data/release")]
        );
    }

    #[test]
    fn config_definitions_are_validated() {
        let mut config = ChecksumConfig::default();
        config.definitions.push(crate::config::ChecksumDefinitionConfig {
            id: "md5sum".into(),
            label: "MD5".into(),
            algorithm: "md5".into(),
            output_file: "MD5SUMS".into(),
            patterns: vec!["MD5SUMS".into()],
        });
        let err = definitions_from_config(&config).unwrap_err();
        assert_eq!(err.code, codes::INV_ARG);
        assert!(err.message.contains("md5"));
    }
}
