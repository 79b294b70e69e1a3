//! Extension descriptor and lifecycle record model.
//!
//! # Responsibility
//! - Define `RawDescriptor`, the parsed-once metadata of one extension.
//! - Define `ExtensionRecord`, the mutable persisted lifecycle state.
//!
//! # Invariants
//! - `schema_version == SCHEMA_UNINSTALLED` means "not installed".
//! - `status == Enabled` implies every transitive dependency is enabled.
//!   The lifecycle controller is the only writer that may break or restore
//!   this, and it never commits a state that violates it.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Stable identifier of one extension unit.
///
/// Kept as a type alias to make semantic intent explicit in signatures.
pub type ExtensionId = String;

/// Schema version sentinel for an extension that is not installed.
pub const SCHEMA_UNINSTALLED: i32 = -1;

/// Weight assigned to the active installation profile so it runs last.
pub const PROFILE_WEIGHT: i32 = 1000;

/// Kind of extension unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Module,
    Theme,
    Profile,
}

impl ExtensionKind {
    /// Stable string used in descriptors and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Theme => "theme",
            Self::Profile => "profile",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "module" => Some(Self::Module),
            "theme" => Some(Self::Theme),
            "profile" => Some(Self::Profile),
            _ => None,
        }
    }
}

/// Persisted activation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Disabled,
    Enabled,
}

/// Hooks that force an extension to load during early bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapHook {
    Boot,
    Exit,
    Watchdog,
    LanguageInit,
}

impl BootstrapHook {
    pub const ALL: [BootstrapHook; 4] = [
        BootstrapHook::Boot,
        BootstrapHook::Exit,
        BootstrapHook::Watchdog,
        BootstrapHook::LanguageInit,
    ];

    /// Hook name probed to decide whether an extension implements this kind.
    pub fn hook_name(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Exit => "exit",
            Self::Watchdog => "watchdog",
            Self::LanguageInit => "language_init",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.hook_name() == value)
    }
}

/// One declared dependency, optionally constrained to a version range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: ExtensionId,
    pub constraint: Option<VersionReq>,
}

impl Dependency {
    pub fn new(id: impl Into<ExtensionId>) -> Self {
        Self {
            id: id.into(),
            constraint: None,
        }
    }

    /// Returns whether `version` satisfies this dependency.
    ///
    /// A target that declares no version satisfies every constraint.
    pub fn accepts(&self, version: Option<&Version>) -> bool {
        match (&self.constraint, version) {
            (Some(req), Some(version)) => req.matches(version),
            _ => true,
        }
    }
}

/// Immutable parsed descriptor of one extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDescriptor {
    pub id: ExtensionId,
    /// Human-readable display name.
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: ExtensionKind,
    pub version: Option<Version>,
    /// Declared dependencies in declaration order, without duplicates.
    pub dependencies: Vec<Dependency>,
    /// Required extensions can never be disabled or uninstalled.
    pub required: bool,
    /// Schema version an install sets.
    pub schema_version: i32,
    /// Default weight for a freshly discovered record.
    pub weight: i32,
    /// Extra key/value metadata (asset paths and the like).
    pub metadata: BTreeMap<String, Value>,
}

impl RawDescriptor {
    /// Creates a module descriptor with defaults for every optional field.
    pub fn new(id: impl Into<ExtensionId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            kind: ExtensionKind::Module,
            version: None,
            dependencies: Vec::new(),
            required: false,
            schema_version: 0,
            weight: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Builder-style helper appending unconstrained dependencies.
    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExtensionId>,
    {
        for id in ids {
            let dependency = Dependency::new(id);
            if !self.depends_on(&dependency.id) {
                self.dependencies.push(dependency);
            }
        }
        self
    }

    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.iter().any(|dep| dep.id == id)
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|dep| dep.id.as_str())
    }

    /// Validates declaration-level invariants.
    pub fn validate(&self) -> Result<(), ModelValidationError> {
        validate_extension_id(&self.id)?;
        if self.name.trim().is_empty() {
            return Err(ModelValidationError::EmptyName(self.id.clone()));
        }
        let mut seen = BTreeSet::new();
        for dependency in &self.dependencies {
            validate_extension_id(&dependency.id)?;
            if dependency.id == self.id {
                return Err(ModelValidationError::SelfDependency(self.id.clone()));
            }
            if !seen.insert(dependency.id.as_str()) {
                return Err(ModelValidationError::DuplicateDependency(
                    dependency.id.clone(),
                ));
            }
        }
        if self.schema_version < 0 {
            return Err(ModelValidationError::InvalidSchemaVersion(
                self.schema_version,
            ));
        }
        Ok(())
    }
}

/// Mutable persisted lifecycle state of one extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub id: ExtensionId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExtensionKind,
    /// Owning engine or parent extension; empty for plain modules.
    pub owner: String,
    pub status: ExtensionStatus,
    /// `SCHEMA_UNINSTALLED` until the first install.
    pub schema_version: i32,
    pub weight: i32,
    pub bootstrap: BTreeSet<BootstrapHook>,
    /// Logical install time in epoch milliseconds, `None` while uninstalled.
    pub installed_at: Option<i64>,
    /// Logical time of the last lifecycle transition.
    pub changed_at: i64,
    /// Serialized descriptor snapshot taken at the last refresh.
    pub info: Value,
}

impl ExtensionRecord {
    /// Creates the record for a freshly discovered extension.
    ///
    /// # Invariants
    /// - Starts `Disabled` with `schema_version == SCHEMA_UNINSTALLED`.
    pub fn discovered(descriptor: &RawDescriptor) -> Self {
        let mut record = Self {
            id: descriptor.id.clone(),
            name: String::new(),
            kind: descriptor.kind,
            owner: String::new(),
            status: ExtensionStatus::Disabled,
            schema_version: SCHEMA_UNINSTALLED,
            weight: descriptor.weight,
            bootstrap: BTreeSet::new(),
            installed_at: None,
            changed_at: 0,
            info: Value::Null,
        };
        record.refresh_from(descriptor);
        record
    }

    /// Copies descriptor-derived columns, keeping lifecycle state untouched.
    pub fn refresh_from(&mut self, descriptor: &RawDescriptor) {
        self.name = descriptor.name.clone();
        self.kind = descriptor.kind;
        self.owner = descriptor
            .metadata
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.info = serde_json::to_value(descriptor).unwrap_or(Value::Null);
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ExtensionStatus::Enabled
    }

    pub fn is_installed(&self) -> bool {
        self.schema_version != SCHEMA_UNINSTALLED
    }

    /// Validates persisted-state invariants.
    pub fn validate(&self) -> Result<(), ModelValidationError> {
        validate_extension_id(&self.id)?;
        if self.schema_version < SCHEMA_UNINSTALLED {
            return Err(ModelValidationError::InvalidSchemaVersion(
                self.schema_version,
            ));
        }
        if self.is_enabled() && !self.is_installed() {
            return Err(ModelValidationError::EnabledButNotInstalled(
                self.id.clone(),
            ));
        }
        Ok(())
    }
}

/// Validates one extension id (`[a-z0-9]` start, `[a-z0-9._-]` body).
pub fn validate_extension_id(value: &str) -> Result<(), ModelValidationError> {
    if value.trim().is_empty() {
        return Err(ModelValidationError::EmptyId);
    }
    if !is_valid_extension_id(value) {
        return Err(ModelValidationError::InvalidId(value.to_string()));
    }
    Ok(())
}

fn is_valid_extension_id(value: &str) -> bool {
    let mut chars = value.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }

    let mut prev_separator = false;
    for c in chars {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prev_separator = false;
            continue;
        }
        if c == '.' || c == '_' || c == '-' {
            if prev_separator {
                return false;
            }
            prev_separator = true;
            continue;
        }
        return false;
    }
    !prev_separator
}

/// Model validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelValidationError {
    EmptyId,
    InvalidId(String),
    EmptyName(ExtensionId),
    SelfDependency(ExtensionId),
    DuplicateDependency(ExtensionId),
    InvalidSchemaVersion(i32),
    EnabledButNotInstalled(ExtensionId),
}

impl Display for ModelValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "extension id must not be empty"),
            Self::InvalidId(value) => write!(f, "extension id is invalid: {value}"),
            Self::EmptyName(id) => write!(f, "extension `{id}` has an empty name"),
            Self::SelfDependency(id) => write!(f, "extension `{id}` depends on itself"),
            Self::DuplicateDependency(id) => write!(f, "dependency is duplicated: {id}"),
            Self::InvalidSchemaVersion(value) => write!(f, "schema version is invalid: {value}"),
            Self::EnabledButNotInstalled(id) => {
                write!(f, "extension `{id}` is enabled but not installed")
            }
        }
    }
}

impl Error for ModelValidationError {}

#[cfg(test)]
mod tests {
    use super::{
        validate_extension_id, BootstrapHook, Dependency, ExtensionRecord, ExtensionStatus,
        ModelValidationError, RawDescriptor, SCHEMA_UNINSTALLED,
    };
    use semver::{Version, VersionReq};

    #[test]
    fn discovered_record_starts_disabled_and_uninstalled() {
        let descriptor = RawDescriptor::new("node", "Node");
        let record = ExtensionRecord::discovered(&descriptor);

        assert_eq!(record.status, ExtensionStatus::Disabled);
        assert_eq!(record.schema_version, SCHEMA_UNINSTALLED);
        assert!(!record.is_installed());
        assert_eq!(record.name, "Node");
        assert_eq!(record.info["id"], "node");
    }

    #[test]
    fn with_dependencies_deduplicates_in_declaration_order() {
        let descriptor =
            RawDescriptor::new("forum", "Forum").with_dependencies(["taxonomy", "node", "taxonomy"]);
        let ids: Vec<&str> = descriptor.dependency_ids().collect();
        assert_eq!(ids, vec!["taxonomy", "node"]);
    }

    #[test]
    fn rejects_self_dependency() {
        let descriptor = RawDescriptor::new("loop", "Loop").with_dependencies(["loop"]);
        assert_eq!(
            descriptor.validate().unwrap_err(),
            ModelValidationError::SelfDependency("loop".to_string())
        );
    }

    #[test]
    fn rejects_invalid_ids() {
        assert!(validate_extension_id("field_ui").is_ok());
        assert!(validate_extension_id("Field UI").is_err());
        assert!(validate_extension_id("trailing_").is_err());
        assert!(validate_extension_id("double__sep").is_err());
        assert_eq!(
            validate_extension_id("  ").unwrap_err(),
            ModelValidationError::EmptyId
        );
    }

    #[test]
    fn enabled_record_must_be_installed() {
        let mut record = ExtensionRecord::discovered(&RawDescriptor::new("node", "Node"));
        record.status = ExtensionStatus::Enabled;
        assert!(matches!(
            record.validate(),
            Err(ModelValidationError::EnabledButNotInstalled(_))
        ));
    }

    #[test]
    fn dependency_constraint_accepts_unversioned_targets() {
        let dependency = Dependency {
            id: "views".to_string(),
            constraint: Some(VersionReq::parse(">=1.2").expect("valid requirement")),
        };
        assert!(dependency.accepts(None));
        assert!(dependency.accepts(Some(&Version::new(1, 3, 0))));
        assert!(!dependency.accepts(Some(&Version::new(1, 1, 9))));
    }

    #[test]
    fn bootstrap_hook_names_roundtrip() {
        for kind in BootstrapHook::ALL {
            assert_eq!(BootstrapHook::parse(kind.hook_name()), Some(kind));
        }
        assert_eq!(BootstrapHook::parse("init"), None);
    }
}
