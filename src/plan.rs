//! Execution plan resolution and validation
//!
//! Turns the key/value pairs of a template section into a [`ResolvedPlan`]:
//! placeholders substituted, file-reference keys split out into a tag table,
//! and an optional temp file allocated for the `@TMPFILE@` pair. Validation
//! checks the plan against the mandatory keys of its execution mode and
//! verifies that every referenced file exists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::template::ConfigSection;

/// Replaced with the config file's directory
pub const CONFIG_TAG: &str = "@CONFIG@";
/// Replaced with the target firmware image path
pub const ELFFILE_TAG: &str = "@ELFFILE@";
/// Replaced with one shared temporary file path; usable in at most two values
pub const TMPFILE_TAG: &str = "@TMPFILE@";
/// Replaced with the `--fcpu` clock frequency
pub const FCPU_TAG: &str = "@FCPU@";

/// Keys with this prefix become `files` entries instead of `nodes` entries
const FILE_KEY_PREFIX: &str = "config.";

/// Tag pattern substituted by the third resolution pass
const FILE_TAG_PATTERN: &str = r"@config\.[a-z0-9]+@";

/// Execution mode selected by the `mode` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Background debug server plus foreground debugger
    GdbOpenocd,
    /// Debug server only (or a remote server sub-operation)
    Openocd,
    /// Foreground debugger only
    Gdb,
    /// Log streaming; not implemented
    Log,
}

impl Mode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "gdb_openocd" => Some(Mode::GdbOpenocd),
            "openocd" => Some(Mode::Openocd),
            "gdb" => Some(Mode::Gdb),
            "log" => Some(Mode::Log),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::GdbOpenocd => "gdb_openocd",
            Mode::Openocd => "openocd",
            Mode::Gdb => "gdb",
            Mode::Log => "log",
        }
    }

    /// Modes that involve the debug server, locally or remotely
    pub fn uses_server(&self) -> bool {
        !matches!(self, Mode::Gdb)
    }
}

/// Immutable inputs to resolution
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Directory of the config file, substituted for `@CONFIG@`
    pub config_dir: String,
    /// Firmware image path, substituted for `@ELFFILE@`
    pub image: String,
    /// Clock frequency, substituted for `@FCPU@`
    pub fcpu: Option<u32>,
}

/// Output of resolution: substituted key/value nodes plus the file table
#[derive(Debug)]
pub struct ResolvedPlan {
    /// Final value per key, excluding file-reference keys
    pub nodes: BTreeMap<String, String>,
    /// Bracketed tag to resolved file path
    pub files: BTreeMap<String, String>,
    /// Owns the `@TMPFILE@` allocation; the file lives as long as the plan
    tempfile: Option<NamedTempFile>,
}

impl ResolvedPlan {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.nodes.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Fetch a key the current operation cannot proceed without
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()).into())
    }

    pub fn has_temp_file(&self) -> bool {
        self.tempfile.is_some()
    }

    pub fn temp_file_path(&self) -> Option<&Path> {
        self.tempfile.as_ref().map(NamedTempFile::path)
    }

    pub fn mode(&self) -> Option<Mode> {
        self.get("mode").and_then(Mode::parse)
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.get("openocd_remote")
    }

    pub fn tls_disabled(&self) -> bool {
        self.get("tls_mode") == Some("disabled")
    }

    pub fn spawn_process(&self) -> Option<&str> {
        self.get("spawn_process")
    }

    pub fn openocd_executable(&self) -> Result<&str> {
        self.require("openocd_executable")
    }

    pub fn openocd_args(&self) -> Result<&str> {
        self.require("openocd_args")
    }

    pub fn gdb_executable(&self) -> Result<&str> {
        self.require("gdb_executable")
    }

    pub fn gdb_args(&self) -> Result<&str> {
        self.require("gdb_args")
    }

    /// Pre-shared key for the secure remote channel
    pub fn auth_key(&self) -> Result<&str> {
        self.require("cert_auth_key")
    }
}

/// Resolve a parsed section against the substitution context.
///
/// Placeholder misuse (`@TMPFILE@` in more than two values, `@FCPU@` without
/// a supplied frequency) is rejected before the temp file is allocated, so a
/// failed resolution leaves nothing behind.
pub fn resolve(section: &ConfigSection, ctx: &SubstitutionContext) -> Result<ResolvedPlan> {
    let tmpfile_uses = section
        .pairs
        .iter()
        .filter(|(_, value)| value.contains(TMPFILE_TAG))
        .count();
    if tmpfile_uses > 2 {
        return Err(ConfigError::TempFileMisuse.into());
    }
    if section.pairs.iter().any(|(_, v)| v.contains(FCPU_TAG)) && ctx.fcpu.is_none() {
        return Err(ConfigError::MissingFrequency.into());
    }

    let tempfile = if tmpfile_uses > 0 {
        let file = NamedTempFile::new()?;
        debug!("allocated temp file {}", file.path().display());
        Some(file)
    } else {
        None
    };
    let tmp_path = tempfile
        .as_ref()
        .map(|f| f.path().display().to_string())
        .unwrap_or_default();

    let mut nodes = BTreeMap::new();
    let mut files = BTreeMap::new();
    for (key, value) in &section.pairs {
        let mut value = value.replace(CONFIG_TAG, &ctx.config_dir);
        value = value.replace(ELFFILE_TAG, &ctx.image);
        if value.contains(TMPFILE_TAG) {
            value = value.replace(TMPFILE_TAG, &tmp_path);
        }
        if value.contains(FCPU_TAG) {
            // Pre-scan guarantees the frequency is present here.
            value = value.replace(FCPU_TAG, &ctx.fcpu.unwrap_or_default().to_string());
        }
        if is_file_reference(key) {
            files.insert(format!("@{key}@"), value);
        } else {
            nodes.insert(key.clone(), value);
        }
    }

    // Bare filenames in the file table are relative to the config directory.
    let base = nodes
        .get("config_path")
        .cloned()
        .unwrap_or_else(|| ctx.config_dir.clone());
    for value in files.values_mut() {
        if !value.contains('/') {
            *value = Path::new(&base).join(value.as_str()).display().to_string();
        }
    }

    // Replace file tags in node values with their resolved paths. Substitution
    // is keyed, so declaration order within the section is irrelevant.
    let tag_expr = Regex::new(FILE_TAG_PATTERN).expect("file tag pattern");
    for value in nodes.values_mut() {
        let tags: Vec<String> = tag_expr
            .find_iter(value)
            .map(|m| m.as_str().to_string())
            .collect();
        for tag in tags {
            let path = files
                .get(&tag)
                .ok_or_else(|| ConfigError::UnresolvedTag(tag.clone()))?;
            *value = value.replace(&tag, path);
        }
    }

    Ok(ResolvedPlan {
        nodes,
        files,
        tempfile,
    })
}

fn is_file_reference(key: &str) -> bool {
    key.strip_prefix(FILE_KEY_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}

/// Check the plan against the mandatory keys of its mode and return the mode.
///
/// The local server executable requirement is waived when a remote host is
/// configured; the remote agent supplies its own binary.
pub fn validate_configuration(plan: &ResolvedPlan, section: &str) -> Result<Mode> {
    let mode = plan
        .mode()
        .ok_or_else(|| ConfigError::ModeNotSpecified(section.to_string()))?;

    if mode == Mode::Gdb {
        let executable = plan.gdb_executable()?;
        plan.gdb_args()?;
        check_executable(executable)?;
    }
    if mode.uses_server() {
        plan.openocd_args()?;
        if plan.remote_host().is_none() {
            check_executable(plan.openocd_executable()?)?;
        }
    }
    Ok(mode)
}

/// Every resolved file reference must exist as a regular file.
pub fn validate_files(plan: &ResolvedPlan) -> Result<()> {
    for path in plan.files.values() {
        if !Path::new(path).is_file() {
            return Err(ConfigError::FileNotFound(path.clone()).into());
        }
    }
    Ok(())
}

fn check_executable(name: &str) -> Result<()> {
    if find_executable(name).is_none() {
        return Err(ConfigError::ExecutableNotFound(name.to_string()).into());
    }
    Ok(())
}

/// Find an executable on PATH (simple which implementation)
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var("PATH").ok()?;
    for dir in path_var.split(':') {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
