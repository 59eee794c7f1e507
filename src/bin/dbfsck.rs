//! Open the environment with fatal recovery (torn log tails are replayed
//! and truncated) and exit.

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
    match DbFs::open(&home, true, true) {
        Ok(dbfs) => {
            let _ = dbfs.flush();
            exit(0);
        }
        Err(e) => {
            eprintln!("dbfsck: {}", e);
            exit(1);
        }
    }
}
