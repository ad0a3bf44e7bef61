use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sectorfs::disk_format::sector::{bytes_to_sectors, SectorNumber};
use sectorfs::storage::FileBackedStorage;
use sectorfs::volume::Volume;

#[derive(Parser)]
struct Args {
    /// disk image file
    disk_file: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lay out an empty volume on the disk
    Format {
        /// resize the disk image to this many sectors first, creating it if needed
        #[arg(long)]
        sectors: Option<usize>,
    },
    /// Create a file of a fixed length and print its inode number
    Create { length: usize },
    /// Write bytes into a file; files never grow, so writes stop at the end of the file
    Write {
        inum: SectorNumber,
        data: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Copy a file's contents to stdout
    Read {
        inum: SectorNumber,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// defaults to the rest of the file
        #[arg(long)]
        size: Option<usize>,
    },
    /// Print a file's length
    Stat { inum: SectorNumber },
    /// Delete a file
    Remove { inum: SectorNumber },
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    if let Command::Format { sectors } = args.command {
        let disk_file = File::options()
            .read(true)
            .write(true)
            .create(sectors.is_some())
            .truncate(false)
            .open(&args.disk_file)
            .context("unable to open disk file in read-write mode")?;
        let storage = FileBackedStorage::new(disk_file);
        if let Some(sectors) = sectors {
            storage.set_num_sectors(sectors)?;
        }

        let volume = Volume::format(storage)?;
        println!(
            "formatted {} sectors ({} free)",
            volume.num_sectors(),
            volume.num_free()
        );

        return Ok(());
    }

    let disk_file = File::options()
        .read(true)
        .write(true)
        .open(&args.disk_file)
        .context("unable to open disk file in read-write mode")?;
    let volume = Volume::mount(FileBackedStorage::new(disk_file))?;
    let inodes = volume.inodes();

    match args.command {
        Command::Format { .. } => unreachable!("handled above"),
        Command::Create { length } => {
            let inum = volume.create_file(length)?;
            volume.sync()?;
            println!("{inum}");
        }
        Command::Write { inum, data, offset } => {
            let inode = inodes.open(inum)?;
            let written = inodes.write_at(&inode, data.as_bytes(), offset);
            inodes.close(inode);

            println!("wrote {} of {} bytes", written?, data.len());
        }
        Command::Read { inum, offset, size } => {
            let inode = inodes.open(inum)?;
            let size = size.unwrap_or(inode.length().saturating_sub(offset));

            let mut buf = vec![0; size];
            let read = inodes.read_at(&inode, &mut buf, offset);
            inodes.close(inode);

            io::stdout().write_all(&buf[..read?])?;
        }
        Command::Stat { inum } => {
            let inode = inodes.open(inum)?;
            println!(
                "inode {}: {} bytes in {} sectors",
                inode.inumber(),
                inode.length(),
                bytes_to_sectors(inode.length())
            );
            inodes.close(inode);
        }
        Command::Remove { inum } => {
            let inode = inodes.open(inum)?;
            inode.remove();
            inodes.close(inode);
            volume.sync()?;
        }
    }

    Ok(())
}
