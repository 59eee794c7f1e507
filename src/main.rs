use std::env::set_var;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use execute::Execute;
use fork::{fork, Fork};
use fuser::MountOption;
use log::*;
use nix::sys::signal;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};

use dbfs::utils::init_logs;
use dbfs::{DbFs, MOUNT_POINT};

/// Ask the kernel to detach a mountpoint via `fusermount -u`. Used when a
/// mount attempt finds the target busy and when SIGINT tears the daemon down.
fn fuse_unmount(mountpoint: &str) {
    info!("detaching {}", mountpoint);
    let mut cmd = execute::command_args!("fusermount", "-u", mountpoint);
    cmd.stdout(Stdio::piped());
    match cmd.execute_output() {
        Ok(out) => {
            let text = String::from_utf8_lossy(&out.stdout);
            let text = text.trim();
            if !text.is_empty() {
                info!("fusermount: {}", text);
            }
        }
        Err(e) => warn!("fusermount -u {} failed: {}", mountpoint, e),
    }
}

extern "C" fn on_sigint(_: i32) {
    // async-signal context: detach, say so, and go
    if let Ok(mountpoint) = MOUNT_POINT.read() {
        println!("[{}] SIGINT: detaching {}", std::process::id(), *mountpoint);
        fuse_unmount(&mountpoint);
    }
    std::process::exit(0);
}

fn install_sigint_handler() {
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(on_sigint),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    if let Err(e) = unsafe { signal::sigaction(signal::SIGINT, &action) } {
        warn!("could not install SIGINT handler: {}", e);
    }
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!([mountpoint] "Mountpoint to mount on").required(true))
        .arg(arg!(-f --front "Keep daemon running in front").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--format "Seed a fresh root before mounting").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-r --read_only "Mount as read only filesystem").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue)
            .required(false))
        .arg(
            arg!(-H --home <DIR> "Environment directory (defaults to $DB_HOME)")
                .required(false),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();
    let mountpoint = matches
        .get_one::<String>("mountpoint")
        .ok_or_else(|| anyhow!("mountpoint argument missing"))?;
    let home = match matches.get_one::<String>("home") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::var("DB_HOME")
            .map(PathBuf::from)
            .map_err(|_| anyhow!("DB_HOME not set, aborting"))?,
    };
    let path_mountpoint = fs::canonicalize(mountpoint)?;
    let abspath_mountpoint = path_mountpoint
        .to_str()
        .ok_or_else(|| anyhow!("mountpoint path is not valid UTF-8"))?;
    info!("Environment: {}", home.display());

    MOUNT_POINT
        .set(abspath_mountpoint.to_string())
        .map_err(|e| anyhow!("mount point registration failed: {:?}", e))?;
    install_sigint_handler();

    let read_only = matches.get_flag("read_only");
    let format = matches.get_flag("format");
    let options = [
        MountOption::FSName("dbfs".to_string()),
        if read_only { MountOption::RO } else { MountOption::RW },
    ];
    let retry_times = 3;
    match if matches.get_flag("front") { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("Daemon running at pid: {}", child);
            Ok(())
        }
        Ok(Fork::Child) => {
            match retry_with_index(Fixed::from_millis(100), |current_try| {
                info!("[try {}/{}] Mount to {}", current_try, retry_times, abspath_mountpoint);
                let dbfs = match DbFs::open(&home, true, true) {
                    Ok(dbfs) => dbfs,
                    Err(e) => return OperationResult::Err(format!("Environment open failed: {}", e)),
                };
                if format {
                    if let Err(e) = dbfs.format() {
                        return OperationResult::Err(format!("Format failed: {}", e));
                    }
                }
                let res = fuser::mount2(dbfs, abspath_mountpoint, &options);
                match res {
                    Ok(_) => {
                        info!("All Done.");
                        OperationResult::Ok(())
                    }
                    Err(e) => {
                        if current_try > retry_times {
                            OperationResult::Err(format!("Failed to mount after {} retries! Err: {}", retry_times, e))
                        } else {
                            fuse_unmount(abspath_mountpoint);
                            OperationResult::Retry("Failed to mount, detached stale mount and will retry".to_string())
                        }
                    }
                }
            }) {
                Ok(_) => Ok(()),
                Err(e) => Err(anyhow!("Mount failed with {}", e))
            }
        }
        Err(e) => Err(anyhow!("Fork returns error {}", e)),
    }
}
