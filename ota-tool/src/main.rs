use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use esp32_cloud_ota::{Crc32, UpdateRequest};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

const READ_CHUNK: usize = 4096;

#[derive(Parser)]
#[command(name = "ota-tool")]
#[command(about = "Prepare and check cloud OTA update commands", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the CRC32 of a firmware image
    Crc {
        /// Firmware file (.bin)
        firmware: PathBuf,
    },
    /// Print the update command payload for a hosted firmware image
    Request {
        /// URL the device will download the image from
        #[arg(short, long)]
        url: String,

        /// Local copy of the hosted image, used to compute the checksum
        #[arg(short, long)]
        firmware: Option<PathBuf>,

        /// Job id echoed back in the device status events
        #[arg(short, long)]
        job_id: Option<String>,
    },
    /// Download an image the way the device would and check its CRC32
    Check {
        /// URL of the hosted image
        url: String,

        /// Expected CRC32 in hex
        #[arg(short, long)]
        crc: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Crc { firmware } => file_crc(&firmware).map(|crc| {
            println!("{:08x}", crc);
        }),
        Commands::Request {
            url,
            firmware,
            job_id,
        } => build_request(&url, firmware.as_deref(), job_id).map(|json| {
            println!("{}", json);
        }),
        Commands::Check { url, crc } => check_hosted(&url, &crc),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Fold a reader into the checksum chunk by chunk, as the device does
fn stream_crc(mut reader: impl Read, pb: &ProgressBar) -> Result<(Crc32, u64)> {
    let mut crc = Crc32::new();
    let mut total = 0u64;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc = crc.update(&buf[..n]);
        total += n as u64;
        pb.inc(n as u64);
    }
    Ok((crc, total))
}

fn file_crc(path: &Path) -> Result<u32> {
    let file = File::open(path).with_context(|| format!("Firmware not found: {}", path.display()))?;
    let size = file.metadata()?.len();
    if size == 0 {
        bail!("Firmware file {} is empty", path.display());
    }

    let pb = progress_bar(size);
    let (crc, _) = stream_crc(file, &pb)?;
    pb.finish_and_clear();

    eprintln!(
        "   Firmware: {} bytes ({:.2} MB)",
        size,
        size as f64 / 1024.0 / 1024.0
    );
    Ok(crc.finalize())
}

fn build_request(url: &str, firmware: Option<&Path>, job_id: Option<String>) -> Result<String> {
    let crc = match firmware {
        Some(path) => Some(file_crc(path)?),
        None => {
            eprintln!(
                "{}",
                "⚠️  No firmware given, the device will skip checksum verification".yellow()
            );
            None
        }
    };

    let request = UpdateRequest::new(url, crc, job_id)?;
    Ok(request.to_json())
}

fn check_hosted(url: &str, expected: &str) -> Result<()> {
    let digits = expected.trim_start_matches("0x").trim_start_matches("0X");
    let expected = u32::from_str_radix(digits, 16)
        .with_context(|| format!("'{}' is not a hex CRC32", expected))?;

    println!("🔍 {} {}", "Downloading".cyan(), url);
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let response = client.get(url).send()?;
    if !response.status().is_success() {
        bail!("Server answered HTTP {}", response.status());
    }

    let pb = progress_bar(response.content_length().unwrap_or(0));
    let (crc, total) = stream_crc(response, &pb)?;
    pb.finish_and_clear();

    let actual = crc.finalize();
    if actual != expected {
        bail!(
            "Checksum mismatch after {} bytes: expected {:08x}, got {:08x}",
            total,
            expected,
            actual
        );
    }

    println!(
        "   {} {} bytes, crc {:08x} matches",
        "✅".green(),
        total,
        actual
    );
    Ok(())
}
