//! Descriptor store: discovery and parsing of extension descriptors.
//!
//! # Responsibility
//! - Read raw descriptor bytes from a `DescriptorSource`.
//! - Parse them through a `DescriptorParser` into `RawDescriptor`s.
//! - Append the active installation profile to every scan.
//!
//! # Invariants
//! - Scanning never touches the registry.
//! - A missing or malformed descriptor is excluded, never fatal to a scan.
//! - The profile entry always carries `PROFILE_WEIGHT`.

use crate::model::extension::{
    validate_extension_id, Dependency, ExtensionId, ExtensionKind, ModelValidationError,
    RawDescriptor, PROFILE_WEIGHT,
};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extension of descriptor files found by `DirectoryDescriptorSource`.
pub const DESCRIPTOR_FILE_EXTENSION: &str = "info";

/// Scanned descriptors keyed by id.
pub type DescriptorSet = BTreeMap<ExtensionId, RawDescriptor>;

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9_.\-]+)\s*(\[\])?\s*=\s*(.*?)\s*$").expect("valid line regex")
});
static DEPENDENCY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9][a-z0-9._\-]*)\s*(?:\(\s*([^)]*?)\s*\))?$")
        .expect("valid dependency regex")
});

/// Descriptor text parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number, `0` for whole-document problems.
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "line {}: {}", self.line, self.message)
        }
    }
}

impl Error for ParseError {}

/// Descriptor load errors.
#[derive(Debug)]
pub enum DescriptorError {
    NotFound(ExtensionId),
    Io(io::Error),
    Parse {
        id: ExtensionId,
        source: ParseError,
    },
    Invalid {
        id: ExtensionId,
        source: ModelValidationError,
    },
    IdMismatch {
        listed: ExtensionId,
        parsed: ExtensionId,
    },
}

impl Display for DescriptorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "descriptor not found: {id}"),
            Self::Io(err) => write!(f, "descriptor source failed: {err}"),
            Self::Parse { id, source } => write!(f, "malformed descriptor `{id}`: {source}"),
            Self::Invalid { id, source } => write!(f, "invalid descriptor `{id}`: {source}"),
            Self::IdMismatch { listed, parsed } => {
                write!(f, "descriptor listed as `{listed}` declares id `{parsed}`")
            }
        }
    }
}

impl Error for DescriptorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotFound(_) | Self::IdMismatch { .. } => None,
            Self::Io(err) => Some(err),
            Self::Parse { source, .. } => Some(source),
            Self::Invalid { source, .. } => Some(source),
        }
    }
}

impl From<io::Error> for DescriptorError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Turns raw descriptor bytes into a `RawDescriptor`.
///
/// The id is supplied by the source (typically the file stem).
pub trait DescriptorParser: Send + Sync {
    fn parse(&self, id: &str, bytes: &[u8]) -> Result<RawDescriptor, ParseError>;
}

/// Lists and reads raw descriptor bytes.
pub trait DescriptorSource: Send + Sync {
    /// Returns every id this source can provide, sorted.
    fn list(&self) -> io::Result<Vec<ExtensionId>>;

    /// Reads one descriptor, `None` when the id is unknown.
    fn read(&self, id: &str) -> io::Result<Option<Vec<u8>>>;

    /// Reads every descriptor. Sources with an expensive `read` override this.
    ///
    /// Only a failure to list the source is returned as the outer error; a
    /// failed read is reported per entry.
    fn read_all(&self) -> io::Result<Vec<(ExtensionId, io::Result<Vec<u8>>)>> {
        let mut entries = Vec::new();
        for id in self.list()? {
            match self.read(&id) {
                Ok(Some(bytes)) => entries.push((id, Ok(bytes))),
                Ok(None) => {}
                Err(err) => entries.push((id, Err(err))),
            }
        }
        Ok(entries)
    }
}

/// Parser for line-based `key = value` descriptors.
///
/// `key[] = value` appends to a list, `;` and `#` start comment lines and
/// values may be quoted. Unknown keys are kept as metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoDescriptorParser;

impl DescriptorParser for InfoDescriptorParser {
    fn parse(&self, id: &str, bytes: &[u8]) -> Result<RawDescriptor, ParseError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| ParseError::at(0, format!("descriptor is not valid UTF-8: {err}")))?;

        let mut descriptor = RawDescriptor::new(id, "");
        let mut has_name = false;

        for (index, raw_line) in text.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }
            let captures = LINE_RE
                .captures(raw_line)
                .ok_or_else(|| ParseError::at(line_no, "expected `key = value`"))?;
            let key = &captures[1];
            let is_list = captures.get(2).is_some();
            let value = unquote(&captures[3]);

            match (key, is_list) {
                ("name", false) => {
                    descriptor.name = value.to_string();
                    has_name = true;
                }
                ("description", false) => descriptor.description = Some(value.to_string()),
                ("type", false) => {
                    descriptor.kind = ExtensionKind::parse(value).ok_or_else(|| {
                        ParseError::at(line_no, format!("unknown extension type `{value}`"))
                    })?;
                }
                ("version", false) => {
                    descriptor.version = Some(Version::parse(value).map_err(|err| {
                        ParseError::at(line_no, format!("invalid version `{value}`: {err}"))
                    })?);
                }
                ("dependencies", true) => {
                    descriptor
                        .dependencies
                        .push(parse_dependency(value, line_no)?);
                }
                ("required", false) => descriptor.required = parse_bool(value, line_no)?,
                ("weight", false) => descriptor.weight = parse_int(value, line_no)?,
                ("schema_version", false) => {
                    descriptor.schema_version = parse_int(value, line_no)?;
                }
                (key, true) => {
                    let entry = descriptor
                        .metadata
                        .entry(key.to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    match entry {
                        Value::Array(items) => items.push(Value::String(value.to_string())),
                        _ => {
                            return Err(ParseError::at(
                                line_no,
                                format!("key `{key}` is used both as value and as list"),
                            ));
                        }
                    }
                }
                (key, false) => {
                    descriptor
                        .metadata
                        .insert(key.to_string(), Value::String(value.to_string()));
                }
            }
        }

        if !has_name {
            return Err(ParseError::at(0, "missing required key `name`"));
        }
        Ok(descriptor)
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_dependency(value: &str, line_no: usize) -> Result<Dependency, ParseError> {
    let captures = DEPENDENCY_RE
        .captures(value)
        .ok_or_else(|| ParseError::at(line_no, format!("invalid dependency `{value}`")))?;
    let constraint = match captures.get(2) {
        Some(raw) if !raw.as_str().is_empty() => {
            Some(VersionReq::parse(raw.as_str()).map_err(|err| {
                ParseError::at(
                    line_no,
                    format!("invalid version constraint `{}`: {err}", raw.as_str()),
                )
            })?)
        }
        _ => None,
    };
    Ok(Dependency {
        id: captures[1].to_string(),
        constraint,
    })
}

fn parse_bool(value: &str, line_no: usize) -> Result<bool, ParseError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(ParseError::at(line_no, format!("invalid boolean `{other}`"))),
    }
}

fn parse_int(value: &str, line_no: usize) -> Result<i32, ParseError> {
    value
        .parse::<i32>()
        .map_err(|err| ParseError::at(line_no, format!("invalid integer `{value}`: {err}")))
}

/// Descriptor source reading `<id>.info` files below one root directory.
#[derive(Debug, Clone)]
pub struct DirectoryDescriptorSource {
    root: PathBuf,
}

impl DirectoryDescriptorSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps ids to descriptor paths; the first path in sorted walk order wins.
    ///
    /// Unreadable entries below the root are logged and skipped.
    fn locate(&self) -> io::Result<BTreeMap<ExtensionId, PathBuf>> {
        let mut found = BTreeMap::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => return Err(err.into()),
                Err(err) => {
                    warn!(
                        "event=descriptor_walk module=descriptor status=skipped path={} error={}",
                        err.path().map(|path| path.display().to_string()).unwrap_or_default(),
                        err
                    );
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(DESCRIPTOR_FILE_EXTENSION)
            {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if found.contains_key(id) {
                warn!(
                    "event=descriptor_duplicate module=descriptor status=skipped id={} path={}",
                    id,
                    path.display()
                );
                continue;
            }
            found.insert(id.to_string(), path.to_path_buf());
        }
        Ok(found)
    }
}

impl DescriptorSource for DirectoryDescriptorSource {
    fn list(&self) -> io::Result<Vec<ExtensionId>> {
        Ok(self.locate()?.into_keys().collect())
    }

    fn read(&self, id: &str) -> io::Result<Option<Vec<u8>>> {
        match self.locate()?.get(id) {
            Some(path) => std::fs::read(path).map(Some),
            None => Ok(None),
        }
    }

    fn read_all(&self) -> io::Result<Vec<(ExtensionId, io::Result<Vec<u8>>)>> {
        Ok(self
            .locate()?
            .into_iter()
            .map(|(id, path)| {
                let bytes = std::fs::read(&path);
                (id, bytes)
            })
            .collect())
    }
}

/// Descriptor source backed by an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryDescriptorSource {
    entries: BTreeMap<ExtensionId, Vec<u8>>,
}

impl MemoryDescriptorSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<ExtensionId>, text: impl Into<Vec<u8>>) {
        self.entries.insert(id.into(), text.into());
    }

    pub fn with(mut self, id: impl Into<ExtensionId>, text: impl Into<Vec<u8>>) -> Self {
        self.insert(id, text);
        self
    }
}

impl DescriptorSource for MemoryDescriptorSource {
    fn list(&self) -> io::Result<Vec<ExtensionId>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn read(&self, id: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.get(id).cloned())
    }
}

/// Descriptor store combining a source, a parser and the active profile.
pub struct DescriptorStore {
    source: Box<dyn DescriptorSource>,
    parser: Box<dyn DescriptorParser>,
    profile: Option<ExtensionId>,
}

impl DescriptorStore {
    pub fn new(source: impl DescriptorSource + 'static, parser: impl DescriptorParser + 'static) -> Self {
        Self {
            source: Box::new(source),
            parser: Box::new(parser),
            profile: None,
        }
    }

    /// Sets the active installation profile appended to every scan.
    pub fn with_profile(mut self, profile: impl Into<ExtensionId>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Loads and validates one descriptor.
    ///
    /// The active profile never reports `NotFound`: when it has no
    /// descriptor a minimal one is synthesized.
    pub fn load(&self, id: &str) -> Result<RawDescriptor, DescriptorError> {
        match self.source.read(id)? {
            Some(bytes) => self.parse_entry(id, &bytes),
            None if self.is_profile(id) => Ok(synthesized_profile(id)),
            None => Err(DescriptorError::NotFound(id.to_string())),
        }
    }

    /// Scans every descriptor the source lists.
    ///
    /// Malformed entries are logged and excluded; only a failure to list the
    /// source itself is returned as an error.
    pub fn scan_all(&self) -> Result<DescriptorSet, DescriptorError> {
        let mut descriptors = DescriptorSet::new();
        let mut skipped = 0usize;

        for (id, bytes) in self.source.read_all()? {
            let parsed = bytes
                .map_err(DescriptorError::from)
                .and_then(|bytes| self.parse_entry(&id, &bytes));
            match parsed {
                Ok(descriptor) => {
                    descriptors.insert(id, descriptor);
                }
                Err(err) => {
                    skipped += 1;
                    warn!(
                        "event=descriptor_scan module=descriptor status=skipped id={} error={}",
                        id, err
                    );
                }
            }
        }

        if let Some(profile) = self.profile.as_deref() {
            if !descriptors.contains_key(profile) && validate_extension_id(profile).is_ok() {
                descriptors.insert(profile.to_string(), synthesized_profile(profile));
            }
        }

        info!(
            "event=descriptor_scan module=descriptor status=ok count={} skipped={}",
            descriptors.len(),
            skipped
        );
        Ok(descriptors)
    }

    fn parse_entry(&self, id: &str, bytes: &[u8]) -> Result<RawDescriptor, DescriptorError> {
        let mut descriptor =
            self.parser
                .parse(id, bytes)
                .map_err(|source| DescriptorError::Parse {
                    id: id.to_string(),
                    source,
                })?;
        if descriptor.id != id {
            return Err(DescriptorError::IdMismatch {
                listed: id.to_string(),
                parsed: descriptor.id,
            });
        }
        if self.is_profile(id) {
            descriptor.kind = ExtensionKind::Profile;
            descriptor.weight = PROFILE_WEIGHT;
        }
        descriptor
            .validate()
            .map_err(|source| DescriptorError::Invalid {
                id: id.to_string(),
                source,
            })?;
        Ok(descriptor)
    }

    fn is_profile(&self, id: &str) -> bool {
        self.profile.as_deref() == Some(id)
    }
}

fn synthesized_profile(id: &str) -> RawDescriptor {
    let mut descriptor = RawDescriptor::new(id, id);
    descriptor.kind = ExtensionKind::Profile;
    descriptor.weight = PROFILE_WEIGHT;
    descriptor
}
