//! CLI smoke and admin entry point.
//!
//! # Responsibility
//! - Without arguments, verify `modhost_core` linkage.
//! - With a config file, rescan descriptors and run one lifecycle command.
//!
//! Output is one line per extension or per changed id, for scripting.

use log::info;
use modhost_core::{
    init_from_config, ExtensionHost, HookTable, HostConfig, ListKind, LogErrorSink,
    NoopSchemaMigrator,
};
use std::process::ExitCode;
use std::sync::Arc;

const USAGE: &str = "usage: modhost_cli [config.json] [list|status|enable|disable|uninstall <ids...>]";

enum Command {
    List,
    Status,
    Enable(Vec<String>),
    Disable(Vec<String>),
    Uninstall(Vec<String>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Status => "status",
            Self::Enable(_) => "enable",
            Self::Disable(_) => "disable",
            Self::Uninstall(_) => "uninstall",
        }
    }

    fn parse(args: &[String]) -> Result<Self, String> {
        let Some((name, ids)) = args.split_first() else {
            return Ok(Self::List);
        };
        let ids = ids.to_vec();
        let needs_ids = |command: Self| {
            if ids.is_empty() {
                Err(format!("`{name}` needs at least one extension id"))
            } else {
                Ok(command)
            }
        };
        match name.as_str() {
            "list" => Ok(Self::List),
            "status" => Ok(Self::Status),
            "enable" => needs_ids(Self::Enable(ids.clone())),
            "disable" => needs_ids(Self::Disable(ids.clone())),
            "uninstall" => needs_ids(Self::Uninstall(ids.clone())),
            other => Err(format!("unknown command `{other}`")),
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((config_path, rest)) = args.split_first() else {
        println!("modhost_core ping={}", modhost_core::ping());
        println!("modhost_core version={}", modhost_core::core_version());
        return ExitCode::SUCCESS;
    };

    match run(config_path, rest) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("{USAGE}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &str, args: &[String]) -> Result<(), String> {
    let command = Command::parse(args)?;
    let config = HostConfig::from_file(config_path).map_err(|err| err.to_string())?;
    init_from_config(&config).map_err(|err| err.to_string())?;

    // No compiled-in hook implementations: lifecycle only.
    let host = ExtensionHost::from_config(
        &config,
        Arc::new(HookTable::new()),
        Arc::new(NoopSchemaMigrator),
        Arc::new(LogErrorSink),
    )
    .map_err(|err| err.to_string())?;
    host.rebuild().map_err(|err| err.to_string())?;

    let name = command.name();
    match command {
        Command::List => {
            for record in host
                .list_enabled(ListKind::All)
                .map_err(|err| err.to_string())?
            {
                println!("{}\t{}\t{}", record.id, record.weight, record.name);
            }
        }
        Command::Status => {
            for record in host
                .registry()
                .records()
                .map_err(|err| err.to_string())?
                .values()
            {
                let status = if record.is_enabled() {
                    "enabled"
                } else if record.is_installed() {
                    "disabled"
                } else {
                    "uninstalled"
                };
                println!("{}\t{}\t{}", record.id, record.kind.as_str(), status);
            }
        }
        Command::Enable(ids) => print_changed(host.enable(&ids, true).map_err(|err| err.to_string())?),
        Command::Disable(ids) => {
            print_changed(host.disable(&ids, false).map_err(|err| err.to_string())?)
        }
        Command::Uninstall(ids) => {
            print_changed(host.uninstall(&ids).map_err(|err| err.to_string())?)
        }
    }
    info!("event=cli_command module=cli status=ok command={}", name);
    Ok(())
}

fn print_changed(ids: Vec<String>) {
    for id in ids {
        println!("{id}");
    }
}
