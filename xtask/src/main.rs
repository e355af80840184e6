use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use quartzos_app_proto as proto;
use quartzos_app_proto::{encode_name, ApplicationHeader, Version};
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(author, version, about = "quartzOS build helper (xtask)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace.
    Build {
        /// Build profile, debug by default.
        #[arg(long, default_value = "debug")]
        profile: String,
    },
    /// Wrap a raw position-independent binary into a flashable bundle.
    Mkapp {
        /// The PIC binary, GOT data words last.
        #[arg(long)]
        bin: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "quartz")]
        company: String,
        /// Entry point offset inside the image.
        #[arg(long, value_parser = parse_u32)]
        entry_offset: u32,
        /// Image offset where the kernel writes the symbol-table pointer.
        #[arg(long, value_parser = parse_u32)]
        sym_addr: u32,
        /// Total in-memory footprint including BSS; defaults to the
        /// binary size (no BSS).
        #[arg(long, value_parser = parse_u32)]
        virtual_size: Option<u32>,
        /// A GOT word to relocate, as a byte offset into the image.
        /// Repeatable.
        #[arg(long = "reloc", value_parser = parse_u32)]
        relocs: Vec<u32>,
        #[arg(long, default_value_t = 0)]
        icon: u16,
        #[arg(long)]
        out: PathBuf,
    },
    /// Assemble bundles into a 32-slot flash image.
    Pack {
        #[arg(long)]
        out: PathBuf,
        /// slot=bundle pairs, e.g. `3=dist/tempus.app`.
        apps: Vec<String>,
    },
    /// Print every valid application header in a flash image.
    Show { image: PathBuf },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Build { profile } => build(&profile),
        Commands::Mkapp {
            bin,
            name,
            company,
            entry_offset,
            sym_addr,
            virtual_size,
            relocs,
            icon,
            out,
        } => mkapp(
            &bin,
            &name,
            &company,
            entry_offset,
            sym_addr,
            virtual_size,
            &relocs,
            icon,
            &out,
        ),
        Commands::Pack { out, apps } => pack(&out, &apps),
        Commands::Show { image } => show(&image),
    }
}

fn build(profile: &str) -> Result<()> {
    let sh = Shell::new()?;
    match profile {
        "release" => cmd!(sh, "cargo build --workspace --release").run()?,
        "debug" => cmd!(sh, "cargo build --workspace").run()?,
        other => bail!("unknown profile {other}"),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn mkapp(
    bin: &Path,
    name: &str,
    company: &str,
    entry_offset: u32,
    sym_addr: u32,
    virtual_size: Option<u32>,
    relocs: &[u32],
    icon: u16,
    out: &Path,
) -> Result<()> {
    let body = fs::read(bin).with_context(|| format!("reading {}", bin.display()))?;
    let app_size = u32::try_from(body.len()).context("binary too large")?;

    if name.len() >= proto::APP_NAME_MAX {
        bail!(
            "name {:?} exceeds {} bytes (terminator included)",
            name,
            proto::APP_NAME_MAX
        );
    }
    if entry_offset >= app_size {
        bail!("entry offset {entry_offset:#x} lies outside the binary");
    }
    for &r in relocs {
        if r >= app_size {
            bail!("relocation {r:#x} lies outside the binary");
        }
    }
    let virtual_size = virtual_size.unwrap_or(app_size);
    if virtual_size < app_size {
        bail!("virtual size {virtual_size:#x} smaller than the binary {app_size:#x}");
    }

    let header = ApplicationHeader {
        magic: proto::APP_MAGIC,
        sdk_version: Version::new(5, 19),
        app_version: Version::new(1, 0),
        app_size,
        offset: entry_offset,
        crc: proto::crc32::crc32_ieee(&body),
        name: encode_name(name),
        company: encode_name(company),
        icon_resource_id: icon,
        sym_table_addr: sym_addr,
        flags: 0,
        reloc_entries_count: relocs.len() as u32,
        virtual_size,
    };

    let mut hdr_buf = [0u8; proto::HEADER_SIZE];
    header.encode(&mut hdr_buf);
    let mut bundle = Vec::with_capacity(proto::HEADER_SIZE + body.len() + relocs.len() * 4);
    bundle.extend_from_slice(&hdr_buf);
    bundle.extend_from_slice(&body);
    for r in relocs {
        bundle.extend_from_slice(&r.to_le_bytes());
    }
    if bundle.len() > proto::SLOT_SIZE {
        bail!(
            "bundle is {} bytes, a slot holds {}",
            bundle.len(),
            proto::SLOT_SIZE
        );
    }

    fs::write(out, &bundle).with_context(|| format!("writing {}", out.display()))?;
    println!(
        "wrote {} ({} bytes, {} relocs, vsize {:#x})",
        out.display(),
        bundle.len(),
        relocs.len(),
        virtual_size
    );
    Ok(())
}

fn pack(out: &Path, apps: &[String]) -> Result<()> {
    let mut image = vec![0xFFu8; proto::SLOT_COUNT as usize * proto::SLOT_SIZE];
    for pair in apps {
        let (slot, path) = pair
            .split_once('=')
            .with_context(|| format!("expected slot=bundle, got {pair:?}"))?;
        let slot: usize = slot.parse().with_context(|| format!("bad slot in {pair:?}"))?;
        if slot >= proto::SLOT_COUNT as usize {
            bail!("slot {slot} out of range (0..{})", proto::SLOT_COUNT);
        }
        let bundle = fs::read(path).with_context(|| format!("reading {path}"))?;
        ApplicationHeader::parse(&bundle)
            .map_err(|e| anyhow!("{path}: not an app bundle: {e:?}"))?;
        if bundle.len() > proto::SLOT_SIZE {
            bail!("{path}: bundle exceeds the slot size");
        }
        let base = slot * proto::SLOT_SIZE;
        image[base..base + bundle.len()].copy_from_slice(&bundle);
    }
    fs::write(out, &image).with_context(|| format!("writing {}", out.display()))?;
    println!("wrote {} ({} slots)", out.display(), proto::SLOT_COUNT);
    Ok(())
}

fn show(image: &Path) -> Result<()> {
    let image = fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    for slot in 0..proto::SLOT_COUNT as usize {
        let base = slot * proto::SLOT_SIZE;
        let Some(bytes) = image.get(base..base + proto::HEADER_SIZE) else {
            break;
        };
        let Ok(header) = ApplicationHeader::parse(bytes) else {
            continue;
        };
        println!(
            "slot {:2}: {} v{}.{} by {} (sdk {}.{})",
            slot,
            header.name(),
            header.app_version.major,
            header.app_version.minor,
            header.company(),
            header.sdk_version.major,
            header.sdk_version.minor
        );
        println!(
            "         size {:#x} vsize {:#x} entry {:#x} sym {:#x} relocs {} crc {:#010x}",
            header.app_size,
            header.virtual_size,
            header.offset,
            header.sym_table_addr,
            header.reloc_entries_count,
            header.crc
        );
    }
    Ok(())
}
