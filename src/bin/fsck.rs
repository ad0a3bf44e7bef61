use std::{fs::File, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use sectorfs::{storage::FileBackedStorage, volume::Volume};

#[derive(Parser)]
struct Args {
    /// disk image file
    disk_file: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let disk_file = File::options().read(true).open(args.disk_file)?;
    let storage = FileBackedStorage::new(disk_file);

    let volume = Volume::mount(storage)?;
    let report = volume.check()?;

    println!(
        "ok: {} sectors, {} free",
        report.num_sectors, report.num_free
    );

    Ok(())
}
