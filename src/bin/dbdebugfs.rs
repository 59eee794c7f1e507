//! Interactive debug shell over an environment: walk the tree and inspect
//! inodes without mounting.

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::exit;

use chrono::{DateTime, NaiveDateTime, Utc};

use dbfs::codec::{DirStream, DBFS_ROOT_INO};
use dbfs::err::FsResult;
use dbfs::inode::InodeType;
use dbfs::utils::init_logs;
use dbfs::{DbFs, FsError};

fn print_help() {
    println!(
        "commands:\n\
         cd PATH\tChange current working directory to PATH\n\
         ls\t\tList the current directory\n\
         stat PATH\tPrint the inode behind PATH\n\
         exit\t\tExit program\n\
         help\t\tPrint summary of supported commands"
    );
}

/// Walk `path` from `cwd` (or the root for absolute paths), one lookup per
/// component. `.` and `..` resolve through the stored entries themselves.
fn resolve(dbfs: &DbFs, cwd: u64, path: &str) -> FsResult<u64> {
    let txn = dbfs.txn_begin()?;
    let mut ino = if path.starts_with('/') {
        DBFS_ROOT_INO
    } else {
        cwd
    };
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        ino = dbfs.dir_lookup(&txn, ino, comp)?;
    }
    txn.abort();
    Ok(ino)
}

fn op_cd(dbfs: &DbFs, cwd: u64, path: &str) -> FsResult<u64> {
    let ino_n = resolve(dbfs, cwd, path)?;
    let txn = dbfs.txn_begin()?;
    let ino = dbfs.inode_read(&txn, ino_n)?;
    txn.abort();
    if ino.itype != InodeType::Dir {
        return Err(FsError::NotDir);
    }
    Ok(ino_n)
}

fn op_ls(dbfs: &DbFs, cwd: u64) -> FsResult<()> {
    let txn = dbfs.txn_begin()?;
    let blob = dbfs.dir_read(&txn, cwd)?;
    for ent in DirStream::new(&blob) {
        let ent = ent?;
        println!("{:>8}  {}", ent.ino, ent.name);
    }
    txn.abort();
    Ok(())
}

fn fmt_time(secs: u64) -> String {
    let naive = NaiveDateTime::from_timestamp_opt(secs as i64, 0).unwrap_or_default();
    DateTime::<Utc>::from_utc(naive, Utc)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn op_stat(dbfs: &DbFs, cwd: u64, path: &str) -> FsResult<()> {
    let ino_n = resolve(dbfs, cwd, path)?;
    let txn = dbfs.txn_begin()?;
    let ino = dbfs.inode_read(&txn, ino_n)?;
    txn.abort();
    println!(
        "inode {}  type {:?}  mode {:o}  nlink {}  uid {}  gid {}",
        ino.raw.ino,
        ino.itype,
        ino.raw.mode & 0o7777,
        ino.raw.nlink,
        ino.raw.uid,
        ino.raw.gid
    );
    println!(
        "size {}  extents {}  version {}",
        ino.raw.size,
        ino.raw.n_extents(),
        ino.raw.version
    );
    println!(
        "ctime {}  atime {}  mtime {}",
        fmt_time(ino.raw.ctime),
        fmt_time(ino.raw.atime),
        fmt_time(ino.raw.mtime)
    );
    Ok(())
}

fn main_loop(dbfs: &DbFs) -> i32 {
    let mut cwd = DBFS_ROOT_INO;
    let stdin = io::stdin();
    loop {
        print!("dbdebugfs: ");
        io::stdout().flush().ok();
        let mut buf = String::new();
        match stdin.lock().read_line(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = buf.trim();
        if line.is_empty() {
            continue;
        }
        if line == "help" {
            print_help();
        } else if line == "exit" {
            break;
        } else if line == "ls" {
            if let Err(e) = op_ls(dbfs, cwd) {
                println!("error: {}", e);
            }
        } else if let Some(path) = line.strip_prefix("cd ") {
            match op_cd(dbfs, cwd, path.trim()) {
                Ok(ino) => cwd = ino,
                Err(e) => println!("error: {}", e),
            }
        } else if let Some(path) = line.strip_prefix("stat ") {
            if let Err(e) = op_stat(dbfs, cwd, path.trim()) {
                println!("error: {}", e);
            }
        } else {
            println!("error: unknown command");
        }
    }
    0
}

fn main() {
    init_logs();
    let home = match env::var("DB_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            eprintln!("DB_HOME not set, aborting");
            exit(1);
        }
    };
    let dbfs = match DbFs::open(&home, true, true) {
        Ok(dbfs) => dbfs,
        Err(e) => {
            eprintln!("dbdebugfs: {}", e);
            exit(1);
        }
    };
    exit(main_loop(&dbfs));
}
