//! Command line arguments and user configuration bootstrap
//!
//! The first run populates `~/.openocd-launch/` with a working set of
//! templates: a gdbinit pair, an OpenOCD board config, and the launcher
//! template itself.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;

use crate::error::{ConfigError, Result};

/// Launcher template file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "openocd-launch.cfg";

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "openocd-launch")]
#[command(about = "Configuration driven launcher and remote control for OpenOCD debug sessions")]
#[command(version)]
pub struct Args {
    /// Section in the config file to run
    #[arg(value_name = "SECTION")]
    pub section: Option<String>,

    /// Target ELF image
    #[arg(value_name = "ELF")]
    pub elf: Option<PathBuf>,

    /// Config file (defaults to ~/.openocd-launch/openocd-launch.cfg)
    #[arg(short = 'c', value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// CPU clock frequency in Hz (used with ITM logging)
    #[arg(long, value_name = "FREQ")]
    pub fcpu: Option<u32>,

    /// Dry run: print the resolved commands without executing anything
    #[arg(short = 'd')]
    pub dry_run: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Log file path (defaults to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// User configuration directory, `~/.openocd-launch`
pub fn config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
    Ok(PathBuf::from(home).join(".openocd-launch"))
}

/// Populate the config directory with default templates if it is absent.
pub fn create_default_config(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    info!("creating default configuration in {}", dir.display());
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("gdbinit"), DEFAULT_GDBINIT)?;
    std::fs::write(dir.join("openocd_gdbinit"), DEFAULT_OPENOCD_GDBINIT)?;
    std::fs::write(dir.join("openocd.cfg"), DEFAULT_OPENOCD_CFG)?;
    std::fs::write(dir.join(CONFIG_FILE_NAME), DEFAULT_LAUNCH_CFG)?;
    Ok(())
}

/// Path of the default launcher template; the directory must exist.
pub fn default_config_file(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(CONFIG_FILE_NAME);
    if !path.is_file() {
        return Err(ConfigError::CannotOpenConfig(path.display().to_string()).into());
    }
    Ok(path)
}

const DEFAULT_GDBINIT: &str = "\
tui enable
layout split
focus cmd
set print pretty
set print asm-demangle on
set mem inaccessible-by-default off
set pagination off
compare-sections
b main
";

const DEFAULT_OPENOCD_GDBINIT: &str = "\
define restart
  mon reset halt
end

define rerun
  mon reset halt
  c
end
";

const DEFAULT_OPENOCD_CFG: &str = r#"source [find interface/cmsis-dap.cfg]

transport select swd
source [find target/stm32f4x.cfg]
reset_config none

proc itm_log { OUTPUT F_CPU {BAUDRATE 2000000} } {
	tpiu create itm.tpiu -dap [dap names] -ap-num 0 -protocol uart
	itm.tpiu configure -traceclk $F_CPU -pin-freq $BAUDRATE -output $OUTPUT
	itm.tpiu enable
	tpiu init
	itm port 0 on
}

proc program_device { SOURCE } {
	program $SOURCE verify
	reset run
	shutdown
}

init
"#;

const DEFAULT_LAUNCH_CFG: &str = r#"[DEFAULT]
config_path: @CONFIG@
# gdb defaults
config.1: gdbinit
config.2: openocd_gdbinit
gdb_executable: arm-none-eabi-gdb-py
gdb_args: -ex "target extended-remote :3333" -x @config.1@ -x @config.2@ @ELFFILE@
# openocd defaults
openocd_executable: openocd
config.ocd: openocd.cfg
openocd_args: -f @config.ocd@

# User defined keys
gdb_pipe_gui: -iex 'target extended | openocd -c \"gdb_port pipe\" -f @config.ocd@'
gdb_pipe: -iex 'target extended | openocd -c "gdb_port pipe" -f @config.ocd@'

# User sections
[program]
openocd_args: -f @config.ocd@ -c "program_device {@ELFFILE@}"
mode: openocd

[log-itm]
openocd_args: -f @config.ocd@ -c "itm_log @TMPFILE@ @FCPU@"
mode: openocd

[gdb]
mode: gdb_openocd

[gui]
gdb_executable: gdbgui
gdb_args: '--gdb-cmd=${DEFAULT:gdb_executable} -ex "target extended-remote :3333" -x @config.1@ -x @config.2@ @ELFFILE@'
mode: gdb_openocd

# Gnome-terminal log
[gdb-log]
gdb_args: ${gdb_pipe} -x @config.1@ -x @config.2@ -ex "set logging file @TMPFILE@" -ex "set logging on" @ELFFILE@
spawn_process: gnome-terminal -- bash -c "tail -f @TMPFILE@"
mode: gdb

[gdb-pipe]
gdb_args: ${gdb_pipe} -x @config.1@ -x @config.2@ @ELFFILE@
mode: gdb

[gui-pipe]
gdb_executable: gdbgui
gdb_args: --gdb-cmd="${DEFAULT:gdb_executable} ${gdb_pipe_gui} -x @config.1@ -x @config.2@ @ELFFILE@"
mode: gdb
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{resolve, SubstitutionContext};
    use crate::template::parse_section;

    #[test]
    fn test_args_parsing_defaults() {
        let args = Args::parse_from(["openocd-launch"]);
        assert!(args.section.is_none());
        assert!(args.elf.is_none());
        assert!(args.config.is_none());
        assert!(args.fcpu.is_none());
        assert!(!args.dry_run);
        assert_eq!(args.log_level, "warn");
    }

    #[test]
    fn test_args_parsing_with_options() {
        let args = Args::parse_from([
            "openocd-launch",
            "program",
            "firmware.elf",
            "-c",
            "custom.cfg",
            "--fcpu",
            "8000000",
            "-d",
        ]);
        assert_eq!(args.section.as_deref(), Some("program"));
        assert_eq!(args.elf.unwrap().to_str().unwrap(), "firmware.elf");
        assert_eq!(args.config.unwrap().to_str().unwrap(), "custom.cfg");
        assert_eq!(args.fcpu, Some(8_000_000));
        assert!(args.dry_run);
    }

    #[test]
    fn test_bootstrap_populates_templates_once() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(".openocd-launch");

        create_default_config(&dir).unwrap();
        for file in ["gdbinit", "openocd_gdbinit", "openocd.cfg", CONFIG_FILE_NAME] {
            assert!(dir.join(file).is_file(), "{file} missing");
        }

        // A second run leaves user edits alone.
        std::fs::write(dir.join("gdbinit"), "customized\n").unwrap();
        create_default_config(&dir).unwrap();
        let content = std::fs::read_to_string(dir.join("gdbinit")).unwrap();
        assert_eq!(content, "customized\n");

        assert_eq!(default_config_file(&dir).unwrap(), dir.join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_default_config_file_missing_fails() {
        let root = tempfile::tempdir().unwrap();
        let err = default_config_file(root.path()).unwrap_err();
        assert!(err.to_string().contains("cannot open config file"));
    }

    #[test]
    fn test_default_template_program_section_resolves() {
        let section = parse_section(DEFAULT_LAUNCH_CFG, "program").unwrap();
        let ctx = SubstitutionContext {
            config_dir: "/home/user/.openocd-launch".to_string(),
            image: "blink.elf".to_string(),
            fcpu: None,
        };
        let plan = resolve(&section, &ctx).unwrap();
        assert_eq!(plan.get("mode"), Some("openocd"));
        assert_eq!(
            plan.get("openocd_args"),
            Some(
                "-f /home/user/.openocd-launch/openocd.cfg -c \"program_device {blink.elf}\""
            )
        );
    }

    #[test]
    fn test_default_template_gdb_log_section_pairs_tmpfile() {
        let section = parse_section(DEFAULT_LAUNCH_CFG, "gdb-log").unwrap();
        let ctx = SubstitutionContext {
            config_dir: "/home/user/.openocd-launch".to_string(),
            image: "blink.elf".to_string(),
            fcpu: None,
        };
        let plan = resolve(&section, &ctx).unwrap();
        assert!(plan.has_temp_file());
        let tmp = plan.temp_file_path().unwrap().display().to_string();
        assert!(plan.get("gdb_args").unwrap().contains(&tmp));
        assert!(plan.spawn_process().unwrap().contains(&tmp));
        // The piped gdb arguments picked up the resolved board config.
        assert!(plan
            .get("gdb_args")
            .unwrap()
            .contains("/home/user/.openocd-launch/openocd.cfg"));
    }

    #[test]
    fn test_default_template_log_itm_requires_fcpu() {
        let section = parse_section(DEFAULT_LAUNCH_CFG, "log-itm").unwrap();
        let ctx = SubstitutionContext {
            config_dir: "/cfg".to_string(),
            image: String::new(),
            fcpu: None,
        };
        let err = resolve(&section, &ctx).unwrap_err();
        assert!(err.to_string().contains("--fcpu is missing"));
    }
}
