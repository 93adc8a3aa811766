//! Configuration loading helpers for the Spindle CLI.
//!
//! Leading configuration flags are split off for `ortho_config` so the loader
//! only receives the flags it understands, while clap parses the command that
//! follows them.

use std::ffi::{OsStr, OsString};

use ortho_config::OrthoConfig;
use spindle_config::{CONFIG_CLI_FLAGS, Config};
use spindle_plugins::ManagerSettings;

use crate::AppError;

pub(crate) trait ConfigLoader {
    /// Loads configuration for the CLI.
    ///
    /// Configuration flags must appear before the command name. Flags after
    /// it belong to the command.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        Config::load_from_iter(args.iter().cloned()).map_err(AppError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

pub(crate) fn process_config_flag(argument: &OsStr) -> FlagAction {
    let argument_text = argument.to_string_lossy();
    if !argument_text.starts_with("--") {
        return FlagAction::Skip;
    }

    let (flag, has_inline_value) = argument_text
        .split_once('=')
        .map_or((argument_text.as_ref(), false), |(flag, _)| (flag, true));

    if CONFIG_CLI_FLAGS.contains(&flag) {
        return FlagAction::Include {
            needs_value: !has_inline_value,
        };
    }

    FlagAction::Skip
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_arguments: Vec<OsString>,
}

/// Splits `args` into the loader's arguments and clap's arguments. Both
/// halves keep the program name.
pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let Some((program, rest)) = args.split_first() else {
        return ConfigArgumentSplit {
            config_arguments: Vec::new(),
            command_arguments: Vec::new(),
        };
    };

    let mut config_arguments = vec![program.clone()];
    let mut remaining = rest.iter();
    let mut command_arguments = vec![program.clone()];

    while let Some(argument) = remaining.next() {
        match process_config_flag(argument) {
            FlagAction::Include { needs_value } => {
                config_arguments.push(argument.clone());
                if needs_value && let Some(value) = remaining.next() {
                    config_arguments.push(value.clone());
                }
            }
            FlagAction::Skip => {
                command_arguments.push(argument.clone());
                command_arguments.extend(remaining.cloned());
                break;
            }
        }
    }

    ConfigArgumentSplit {
        config_arguments,
        command_arguments,
    }
}

/// Maps resolved configuration onto the manager's tunables.
pub(crate) fn manager_settings(config: &Config) -> ManagerSettings {
    ManagerSettings {
        readiness_timeout: config.readiness_timeout(),
        probe_interval: config.probe_interval(),
        call_timeout: config.call_timeout(),
        grace_period: config.grace_period(),
        idle_threshold: config.idle_threshold(),
        reap_interval: config.reap_interval(),
        output_lines: config.output_buffer_lines(),
        ..ManagerSettings::new(config.plugins_dir().into_std_path_buf())
    }
}
