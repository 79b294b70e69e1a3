//! Extension registry and hook-dispatch runtime.
//! This crate is the single source of truth for extension lifecycle state.

pub mod config;
pub mod db;
pub mod extension;
pub mod hook;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, HostConfig};
pub use extension::descriptor::{
    DescriptorError, DescriptorParser, DescriptorSet, DescriptorSource, DescriptorStore,
    DirectoryDescriptorSource, InfoDescriptorParser, MemoryDescriptorSource, ParseError,
};
pub use extension::lifecycle::{
    LifecycleController, LifecycleError, LifecycleResult, NoopSchemaMigrator, SchemaMigrator,
};
pub use extension::registry::{
    ExtensionRegistry, ListKind, RefreshSummary, RegistryError, RegistryResult,
};
pub use extension::resolver::{DependencyResolver, ResolutionReport, ResolveError};
pub use hook::dispatch::{
    AlterTypes, DispatchError, DispatchResult, ErrorSink, HookDispatcher, LogErrorSink,
    MemoryErrorSink,
};
pub use hook::index::{HookIndex, Placement};
pub use hook::probe::{AlterContext, HookError, HookKind, HookProbe, HookResult, HookTable};
pub use logging::{init_from_config, init_logging, LogLevel, LogSettings, LoggingError};
pub use model::extension::{
    BootstrapHook, Dependency, ExtensionId, ExtensionKind, ExtensionRecord, ExtensionStatus,
    ModelValidationError, RawDescriptor, PROFILE_WEIGHT, SCHEMA_UNINSTALLED,
};
pub use repo::extension_repo::{
    ExtensionStore, MemoryExtensionStore, RepoError, RepoResult, SqliteExtensionStore,
};
pub use service::extension_host::{ExtensionHost, HostCollaborators, HostError, HostResult};

/// Minimal health-check API for embedding hosts.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
