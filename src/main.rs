//! blobstore CLI - inspect blob storage files.

use anyhow::{bail, Context, Result};
use blobstore::storage::{
    BlobStore, StoreConfig, WriterDecides, STORAGE_MAGIC, STORAGE_VERSION,
};
use byteorder::{ByteOrder, LittleEndian};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// blobstore - inspect blob storage files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the raw storage header without opening the store
    Stats {
        /// Storage file to inspect
        file: PathBuf,
    },
    /// Open the store and list every record slot
    Scan {
        /// Storage file to scan
        file: PathBuf,
        /// Also print record payloads as lossy UTF-8
        #[arg(long)]
        payloads: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match args.command {
        Command::Stats { file } => stats(&file),
        Command::Scan { file, payloads } => scan(&file, payloads),
    }
}

/// The fixed header region, parsed straight off the file.
struct RawHeader {
    magic: [u8; 4],
    storage_version: u32,
    page_size: u32,
    file_status: u32,
    next_record_id: u32,
    records_allocated: u32,
    records_relocated: u32,
    records_deleted: u32,
    live_payload_bytes: u64,
    live_capacity_bytes: u64,
    data_format_version: u32,
}

fn read_raw_header(path: &Path) -> Result<RawHeader> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let mut buf = [0u8; 64];
    file.read_exact(&mut buf)
        .with_context(|| format!("{:?} is too short to hold a storage header", path))?;

    Ok(RawHeader {
        magic: [buf[0], buf[1], buf[2], buf[3]],
        storage_version: LittleEndian::read_u32(&buf[4..8]),
        page_size: LittleEndian::read_u32(&buf[8..12]),
        file_status: LittleEndian::read_u32(&buf[12..16]),
        next_record_id: LittleEndian::read_u32(&buf[16..20]),
        records_allocated: LittleEndian::read_u32(&buf[20..24]),
        records_relocated: LittleEndian::read_u32(&buf[24..28]),
        records_deleted: LittleEndian::read_u32(&buf[28..32]),
        live_payload_bytes: LittleEndian::read_u64(&buf[32..40]),
        live_capacity_bytes: LittleEndian::read_u64(&buf[40..48]),
        data_format_version: LittleEndian::read_u32(&buf[48..52]),
    })
}

fn stats(path: &Path) -> Result<()> {
    let header = read_raw_header(path)?;
    if header.magic != STORAGE_MAGIC {
        bail!("{:?} is not a blobstore file (bad magic word)", path);
    }

    println!("file:                  {}", path.display());
    println!("storage version:       {}", header.storage_version);
    println!("page size:             {}", header.page_size);
    println!(
        "closed properly:       {}",
        if header.file_status == 1 { "yes" } else { "no" }
    );
    println!("next record id:        {}", header.next_record_id);
    println!("records allocated:     {}", header.records_allocated);
    println!("records relocated:     {}", header.records_relocated);
    println!("records deleted:       {}", header.records_deleted);
    println!(
        "live records:          {}",
        header.records_allocated as i64
            - header.records_relocated as i64
            - header.records_deleted as i64
    );
    println!("live payload bytes:    {}", header.live_payload_bytes);
    println!("live capacity bytes:   {}", header.live_capacity_bytes);
    println!("data format version:   {}", header.data_format_version);
    Ok(())
}

fn scan(path: &Path, payloads: bool) -> Result<()> {
    let header = read_raw_header(path)?;
    if header.magic != STORAGE_MAGIC {
        bail!("{:?} is not a blobstore file (bad magic word)", path);
    }
    if header.storage_version != STORAGE_VERSION {
        bail!(
            "{:?} has storage version {}, this tool supports {}",
            path,
            header.storage_version,
            STORAGE_VERSION
        );
    }

    let config = StoreConfig {
        page_size: header.page_size as usize,
        ..StoreConfig::default()
    };
    let store = BlobStore::open(path, config, Box::new(WriterDecides::new(4096)?))
        .with_context(|| format!("Failed to open store: {:?}", path))?;

    if !store.was_closed_properly()? {
        log::warn!("{}: file was not closed properly", path.display());
    }

    let mut live = 0u32;
    let count = store.for_each(|id, capacity, length, payload| {
        if length >= 0 {
            live += 1;
            if payloads {
                println!(
                    "record {:>10}  capacity {:>6}  length {:>6}  {}",
                    id,
                    capacity,
                    length,
                    String::from_utf8_lossy(payload)
                );
            } else {
                println!("record {:>10}  capacity {:>6}  length {:>6}", id, capacity, length);
            }
        } else {
            println!("record {:>10}  capacity {:>6}  (deleted or moved)", id, capacity);
        }
        true
    })?;

    println!("{} record slots scanned, {} live", count, live);
    store.close()?;
    Ok(())
}
