use anyhow::Result;
use clap::Parser;
use dll_proxy_gen::exports::ExportTable;
use dll_proxy_gen::msvc::{self, MsvcShell};
use dll_proxy_gen::proxy;
use log::info;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// Generates a Visual Studio proxy DLL project that forwards every export of
/// a target DLL through the renamed original
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the target DLL file
    target: PathBuf,
}

fn normalize_separators(path: &Path) -> PathBuf {
    if MAIN_SEPARATOR == '\\' {
        PathBuf::from(path.to_string_lossy().replace('/', "\\"))
    } else {
        path.to_path_buf()
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let target = normalize_separators(&cli.target);
    info!("Target: {}", target.display());

    let target_file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("failed to get a DLL name from the target path"))?
        .to_owned();

    let dev_cmd = msvc::locate_dev_cmd()?;
    let shell = MsvcShell::new(dev_cmd);

    info!("Dumping exports...");
    let dump = msvc::dump_exports(&shell, &target)?;
    let mut table = ExportTable::parse(&dump)?;

    info!("Demangling export names...");
    let response = msvc::run_demangler(&shell, &table)?;
    table.resolve_names(&response)?;
    for export in &table.exports {
        println!("{export}");
    }

    proxy::create_proxy_project(&table, &target_file_name, Path::new("build"))?;
    Ok(())
}
