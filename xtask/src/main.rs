//! A build and test assist program. To show the usage, run
//!
//! ```shell
//! cargo xtask
//! ```

#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use std::{
    env, fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc::channel,
    thread,
};

type DynError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(author, about, long_about = None)]
struct Cli {
    /// Build the hypervisor with the release profile
    #[arg(short, long)]
    release: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the hypervisor and boot it under QEMU's `ppce500` machine
    Qemu,
}

fn main() {
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Qemu => run_qemu(cli.release),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(-1);
    }
}

const TARGET: &str = "powerpc64-qoriq-hv";

fn run_qemu(release: bool) -> Result<(), DynError> {
    build_hypervisor(release)?;

    let kernel = binary_path(release);
    let mut qemu = Command::new("qemu-system-ppc64")
        .args([
            "-machine",
            "ppce500",
            "-cpu",
            "e5500",
            "-m",
            "512",
            "-nographic",
            "-kernel",
        ])
        .arg(&kernel)
        .stdout(Stdio::piped())
        .spawn()?;

    let reader = BufReader::new(qemu.stdout.take().unwrap());
    let _unused = thread::spawn(move || {
        reader
            .lines()
            .map_while(Result::ok)
            .for_each(|line| println!("{line}\r"));
    });

    let (tx, rx) = channel();
    ctrlc::set_handler(move || tx.send(()).unwrap())?;
    rx.recv()?;

    qemu.kill()?;
    Ok(())
}

fn build_hypervisor(release: bool) -> Result<(), DynError> {
    // Building qoriq-hv only is important because we are running xtask, which
    // cannot be overwritten while running.
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let mut command = Command::new(cargo);
    let _ = command.args(["build", "--package", "qoriq-hv"]);
    if release {
        let _ = command.arg("--release");
    }
    let ok = command.current_dir(project_root_dir()).status()?.success();
    if !ok {
        Err("cargo build failed")?;
    }
    Ok(())
}

fn project_root_dir() -> PathBuf {
    // Get the path to the xtask directory and resolve its parent directory.
    let root_dir = Path::new(&env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(1)
        .unwrap()
        .to_path_buf();
    fs::canonicalize(root_dir).unwrap()
}

fn binary_path(release: bool) -> PathBuf {
    let mut out_dir = project_root_dir();
    out_dir.extend(["target", TARGET]);
    out_dir.push(if release { "release" } else { "debug" });
    out_dir.push("qoriq-hv");
    out_dir
}
