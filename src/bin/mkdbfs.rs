//! Format a fresh store: seeds root inode 1 and its empty directory blob.

use std::env;
use std::path::PathBuf;
use std::process::exit;

use dbfs::utils::init_logs;
use dbfs::DbFs;

fn main() {
    init_logs();
    let home = match env::var("DB_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            eprintln!("DB_HOME not set, aborting");
            exit(1);
        }
    };
    let dbfs = match DbFs::open(&home, true, false) {
        Ok(dbfs) => dbfs,
        Err(e) => {
            eprintln!("mkdbfs open: {}", e);
            exit(1);
        }
    };
    if let Err(e) = dbfs.format() {
        eprintln!("mkdbfs: {}", e);
        exit(1);
    }
    if let Err(e) = dbfs.flush() {
        eprintln!("mkdbfs flush: {}", e);
        exit(1);
    }
    exit(0);
}
