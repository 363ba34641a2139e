use anyhow::{Context, Result};
use log::info;
use std::{
    env,
    io::{BufRead, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::error::Error;
use crate::exports::ExportTable;

/// One-shot textual request/response channel into the located build
/// environment. Behind a trait so the export lister and demangler can be
/// exercised against canned output in tests.
pub trait ToolRunner {
    fn run(&self, request: &str) -> Result<String>;
}

/// A discovered Visual Studio installation.
pub struct ToolInstall {
    pub version: String,
    pub dev_cmd: PathBuf,
}

/// Runs batches of commands inside a `cmd.exe` that has sourced `VsDevCmd.bat`.
pub struct MsvcShell {
    dev_cmd: PathBuf,
}

impl MsvcShell {
    pub fn new(dev_cmd: PathBuf) -> Self {
        Self { dev_cmd }
    }
}

impl ToolRunner for MsvcShell {
    fn run(&self, request: &str) -> Result<String> {
        let mut child = Command::new("cmd.exe")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .context("failed to spawn cmd.exe")?;

        let mut input = format!("\"{}\"\n", self.dev_cmd.display());
        input.push_str(request);
        if !input.ends_with('\n') {
            input.push('\n');
        }

        child
            .stdin
            .take()
            .context("cmd.exe stdin was not captured")?
            .write_all(input.as_bytes())?;

        let output = child.wait_with_output()?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Asks dumpbin for the export table of the target binary.
pub fn dump_exports(runner: &dyn ToolRunner, target: &Path) -> Result<String> {
    runner.run(&format!("dumpbin /EXPORTS {}", target.display()))
}

/// Sends the batched undname request for every parsed export.
pub fn run_demangler(runner: &dyn ToolRunner, table: &ExportTable) -> Result<String> {
    runner.run(&table.demangle_request())
}

/// Finds every known Visual Studio installation and returns the path to its
/// `VsDevCmd.bat`, prompting the user to pick one when several exist.
pub fn locate_dev_cmd() -> Result<PathBuf> {
    let installs = known_installs();
    let stdin = std::io::stdin();
    select_install(installs, stdin.lock(), std::io::stdout())
}

fn known_installs() -> Vec<ToolInstall> {
    let program_files = env::var_os("ProgramFiles(x86)")
        .or_else(|| env::var_os("ProgramFiles"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Program Files (x86)"));
    let dev_cmd = Path::new("Common7").join("Tools").join("VsDevCmd.bat");

    let mut installs = Vec::new();

    for version in ["11.0", "12.0", "14.0"] {
        let candidate = program_files
            .join(format!("Microsoft Visual Studio {version}"))
            .join(&dev_cmd);
        if candidate.is_file() {
            info!("Found MSVC {version}");
            installs.push(ToolInstall {
                version: version.into(),
                dev_cmd: candidate,
            });
        }
    }

    // Post-2015 layout nests editions under a shared root.
    let modern_root = program_files.join("Microsoft Visual Studio");
    for version in ["2017", "2019"] {
        let candidate = modern_root.join(version).join("Community").join(&dev_cmd);
        if candidate.is_file() {
            info!("Found MSVC {version}");
            installs.push(ToolInstall {
                version: version.into(),
                dev_cmd: candidate,
            });
        }
    }

    installs
}

fn select_install(
    mut installs: Vec<ToolInstall>,
    input: impl BufRead,
    output: impl Write,
) -> Result<PathBuf> {
    match installs.len() {
        0 => Err(Error::ToolchainNotFound.into()),
        1 => Ok(installs.remove(0).dev_cmd),
        _ => {
            let index = prompt_selection(&installs, input, output)?;
            Ok(installs.remove(index).dev_cmd)
        }
    }
}

fn prompt_selection(
    installs: &[ToolInstall],
    mut input: impl BufRead,
    mut output: impl Write,
) -> Result<usize> {
    let mut menu = String::from("Select one of the following MSVC tools:\n");
    for (i, install) in installs.iter().enumerate() {
        menu.push_str(&format!(
            "    {}: MSVC {} ({})\n",
            i,
            install.version,
            install.dev_cmd.display()
        ));
    }

    loop {
        output.write_all(menu.as_bytes())?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(anyhow::anyhow!("stdin closed before a selection was made"));
        }
        match line.trim().parse::<usize>() {
            Ok(index) if index < installs.len() => return Ok(index),
            _ => continue,
        }
    }
}
