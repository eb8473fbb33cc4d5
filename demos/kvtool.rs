//! Maintenance tool for flash image files holding a remanence region.
//!
//! The image file is a raw dump of the reserved flash region; `init`
//! creates one full of erased (0xFF) bytes. All other commands operate on
//! an existing image in place.

use anyhow::{bail, Context};
use clap::Parser;
use remanence::low_level::{self, BlockHeader, Record, RECORD_SIZE, SLOT_ERASED};
use remanence::{mount, FlashBus, Geometry};

#[derive(Parser)]
struct Kvtool {
    /// Block size in bytes (must match the target part's erase unit).
    #[clap(short, long, default_value_t = 64)]
    block_size: u32,

    /// Number of blocks in the region.
    #[clap(short = 'n', long, default_value_t = 16)]
    block_count: u32,

    #[clap(subcommand)]
    cmd: Cmd,

    image_file: std::path::PathBuf,
}

#[derive(Parser)]
enum Cmd {
    /// Create a new image file full of erased bytes.
    Init,
    /// Summarize the region: per-block headers and live occupancy.
    Info,
    /// Erase every block and write a fresh active header.
    Format,
    /// Write a key/value pair.
    Set { id: u8, value: u8 },
    /// Read the current value of a key.
    Get { id: u8 },
    /// Delete a key.
    Del { id: u8 },
    /// Hex-dump every block with decoded headers and records.
    Dump,
    /// Force a compaction cycle.
    Compact,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Kvtool::parse();

    let geometry = Geometry {
        base: 0,
        block_size: args.block_size,
        block_count: args.block_count,
    };
    if !geometry.check() {
        bail!(
            "bad geometry: {} blocks of {} bytes",
            args.block_count,
            args.block_size
        );
    }

    if let Cmd::Init = args.cmd {
        let blank = vec![0xFF; geometry.region_size() as usize];
        std::fs::write(&args.image_file, blank).with_context(|| {
            format!("creating image file {}", args.image_file.display())
        })?;
        println!(
            "created {} ({} blocks of {} bytes)",
            args.image_file.display(),
            geometry.block_count,
            geometry.block_size
        );
        return Ok(());
    }

    let mut img = ImageBus::open(&args.image_file, &geometry).with_context(|| {
        format!("opening image file {}", args.image_file.display())
    })?;

    match args.cmd {
        Cmd::Init => unreachable!(),
        Cmd::Info => {
            for index in 0..geometry.block_count {
                let header = low_level::read_header(&img, &geometry, index);
                let tail = low_level::log_tail(&img, &geometry, index);
                let used = (tail - BlockHeader::SIZE) / RECORD_SIZE;
                println!(
                    "block {index:2}: marker {} seq {:3} status {} ({} records)",
                    if header.marker_ok() { "ok " } else { "BAD" },
                    header.sequence,
                    match header.status() {
                        Some(s) => format!("{s:?}"),
                        None => format!("unknown ({:#04x})", header.status),
                    },
                    used,
                );
            }
            match low_level::find_active_block(&img, &geometry) {
                Some(active) => {
                    println!("active block: {active}");
                    println!(
                        "live records: {}",
                        low_level::count_live_ids(&img, &geometry, None)
                    );
                    println!(
                        "free bytes: {}",
                        low_level::free_space(&img, &geometry, active)
                    );
                }
                None => println!("no active block; image needs formatting"),
            }
        }
        Cmd::Format => {
            low_level::format(&mut img, &geometry)
                .map_err(|e| anyhow::anyhow!("format failed: {e:?}"))?;
            img.flush()?;
            println!("formatted");
        }
        Cmd::Set { id, value } => {
            with_store(img, |store| {
                match store.set(id, value) {
                    Ok(()) => println!("ok"),
                    Err(e) => println!("error: {e:?}"),
                }
            })?;
        }
        Cmd::Get { id } => {
            with_store(img, |store| {
                match store.get(id) {
                    Ok(value) => println!("{value} ({value:#04x})"),
                    Err(e) => println!("error: {e:?}"),
                }
            })?;
        }
        Cmd::Del { id } => {
            with_store(img, |store| {
                match store.delete(id) {
                    Ok(()) => println!("ok"),
                    Err(e) => println!("error: {e:?}"),
                }
            })?;
        }
        Cmd::Compact => {
            with_store(img, |store| {
                match store.compact() {
                    Ok(()) => println!("compacted; active block {}", store.active_block()),
                    Err(e) => println!("error: {e:?}"),
                }
            })?;
        }
        Cmd::Dump => {
            for index in 0..geometry.block_count {
                let header = low_level::read_header(&img, &geometry, index);
                println!(
                    "block {index} (seq {} status {:?}):",
                    header.sequence,
                    header.status()
                );

                let base = geometry.block_base(index);
                let block: Vec<u8> = (0..geometry.block_size)
                    .step_by(2)
                    .flat_map(|off| img.read_halfword(base + off).to_le_bytes())
                    .collect();
                println!("{}", pretty_hex::pretty_hex(&block));

                if !header.holds_live_data() {
                    println!();
                    continue;
                }
                let tail = low_level::log_tail(&img, &geometry, index);
                let mut offset = BlockHeader::SIZE;
                while offset < tail {
                    let raw = img.read_halfword(base + offset);
                    let record = Record::unpack(raw);
                    if record.is_live() {
                        println!(
                            "  +{offset:02}: id {:3} = {:3}",
                            record.id, record.value
                        );
                    } else if raw != SLOT_ERASED {
                        println!("  +{offset:02}: deleted (was {:3})", record.value);
                    }
                    offset += RECORD_SIZE;
                }
                println!();
            }
        }
    }

    Ok(())
}

fn with_store(
    img: ImageBus,
    body: impl FnOnce(&mut remanence::Store<ImageBus>),
) -> anyhow::Result<()> {
    let geometry = img.geometry;
    let mut store = match mount(img, geometry) {
        Ok(store) => store,
        Err(e) => bail!("could not mount: {:?}", e.cause()),
    };
    body(&mut store);
    store.into_bus().flush()?;
    Ok(())
}

/// File-backed flash bus. The whole image is held in memory and written
/// back with `flush`; faithful 1->0 programming semantics, but no busy
/// time or fault modelling.
struct ImageBus {
    path: std::path::PathBuf,
    mem: Vec<u8>,
    geometry: Geometry,
    locked: bool,
}

impl ImageBus {
    fn open(path: &std::path::Path, geometry: &Geometry) -> anyhow::Result<Self> {
        let mem = std::fs::read(path)?;
        if mem.len() != geometry.region_size() as usize {
            bail!(
                "image is {} bytes; geometry wants {}",
                mem.len(),
                geometry.region_size()
            );
        }
        Ok(Self {
            path: path.to_owned(),
            mem,
            geometry: *geometry,
            locked: true,
        })
    }

    fn flush(&self) -> anyhow::Result<()> {
        std::fs::write(&self.path, &self.mem)
            .with_context(|| format!("writing image file {}", self.path.display()))
    }
}

impl FlashBus for ImageBus {
    fn read_halfword(&self, addr: u32) -> u16 {
        let i = addr as usize;
        u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
    }

    fn unlock(&mut self) -> bool {
        self.locked = false;
        true
    }

    fn lock(&mut self) {
        self.locked = true;
    }

    fn start_erase(&mut self, addr: u32) {
        assert!(!self.locked);
        let i = addr as usize;
        self.mem[i..i + self.geometry.block_size as usize].fill(0xFF);
    }

    fn start_program(&mut self, addr: u32, value: u16) {
        assert!(!self.locked);
        let i = addr as usize;
        let bytes = value.to_le_bytes();
        self.mem[i] &= bytes[0];
        self.mem[i + 1] &= bytes[1];
    }

    fn busy(&self) -> bool {
        false
    }

    fn fault(&self) -> bool {
        false
    }
}
