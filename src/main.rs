#![deny(rust_2018_idioms, rustdoc::broken_intra_doc_links)]

mod macros;

use forgeflash::{
    exploit::{AttemptState, Event},
    gpt::Gpt,
    session::DeviceConnector,
    usb::UsbConnector,
    Error, ExploitConfig, ExploitController, FfuImage, FirmwareImage, JsonProfileStore,
    WritePart,
};
use std::{
    fs::File,
    path::PathBuf,
    sync::{atomic::AtomicBool, mpsc},
    thread,
    time::Duration,
};
use tracing_subscriber::EnvFilter;

/// Custom flashing for phones that only accept signed images.
#[derive(argh::FromArgs)]
struct Arguments {
    /// print debug output of the exploit engine.
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// override the vendor ID of the phone.
    #[argh(option, short = 'V')]
    vendor_id: Option<u16>,
    /// override the product ID of the phone.
    #[argh(option, short = 'P')]
    product_id: Option<u16>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum Command {
    Flash(FlashArguments),
    Info(InfoArguments),
}

/// Write data to the phone using the signed headers of a firmware image.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "flash")]
struct FlashArguments {
    /// firmware image whose signed headers are replayed.
    #[argh(positional)]
    image: PathBuf,

    /// data to write, as `<start sector>:<file>`. May be repeated.
    #[argh(option, short = 'w', from_str_fn(parse_write))]
    write: Vec<(u32, PathBuf)>,

    /// file caching the parameters that worked for a device.
    #[argh(option, default = "PathBuf::from(\"profiles.json\")")]
    profiles: PathBuf,

    /// also search the backup buffer placement and a wider gap range.
    #[argh(switch)]
    experimental: bool,

    /// crash the phone on its way down so it does not commit its state.
    #[argh(switch)]
    suppress_commit: bool,

    /// loader used to recover a phone in emergency download mode.
    #[argh(option)]
    loader: Option<PathBuf>,

    /// gap size the search starts from.
    #[argh(option, from_str_fn(parse_number))]
    gap_estimate: Option<u32>,

    /// size of the forged header allocation.
    #[argh(option, from_str_fn(parse_number))]
    header_size: Option<u32>,

    /// chunk size the image is expected to use.
    #[argh(option, from_str_fn(parse_number))]
    chunk_size: Option<u32>,

    /// send every chunk on its own instead of merging identical ones.
    #[argh(switch)]
    no_dedup: bool,

    /// unhide the backdoor partition in the transmitted partition table.
    #[argh(switch)]
    enable_backdoor: bool,

    /// hide the backdoor partition in the transmitted partition table.
    #[argh(switch)]
    disable_backdoor: bool,
}

/// Show what the connected phone reports about itself.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "info")]
struct InfoArguments {
    /// size of the partition table chunk to read.
    #[argh(option, default = "0x20000", from_str_fn(parse_number))]
    chunk_size: u32,
}

fn parse_number(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid number {:?}: {}", value, err))
}

fn parse_write(value: &str) -> Result<(u32, PathBuf), String> {
    let (sector, path) = value
        .split_once(':')
        .ok_or_else(|| format!("expected <start sector>:<file>, got {:?}", value))?;
    Ok((parse_number(sector)?, PathBuf::from(path)))
}

fn main() {
    let args = argh::from_env::<Arguments>();

    match EnvFilter::builder().with_env_var("FORGEFLASH_LOG").try_from_env() {
        Ok(filter) => tracing_subscriber::fmt().with_env_filter(filter).init(),
        Err(_) => tracing_subscriber::fmt()
            .with_max_level(if args.verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            })
            .init(),
    }

    let connector = UsbConnector::new(args.vendor_id, args.product_id);
    let result = match args.command {
        Command::Flash(flash_args) => flash(connector, flash_args),
        Command::Info(info_args) => show_info(connector, info_args),
    };
    if let Err(err) = result {
        error!("Failed", "{}", err);
        std::process::exit(1);
    }
}

fn flash(connector: UsbConnector, args: FlashArguments) -> Result<(), Error> {
    info!("Reading", "firmware image {:?}...", args.image);
    let image = FfuImage::open(&args.image)?;
    ok!(
        "Read",
        "{} image for {} with {:#x}-byte chunks",
        image.firmware_version(),
        image.platform_id(),
        image.chunk_size()
    );

    let mut parts = Vec::with_capacity(args.write.len());
    for (sector, path) in &args.write {
        let label = path.display().to_string();
        parts.push(WritePart::new(*sector, File::open(path)?).with_label(label));
    }

    let mut builder = ExploitConfig::builder()
        .experimental(args.experimental)
        .suppress_commit(args.suppress_commit)
        .disable_dedup(args.no_dedup);
    if let Some(size) = args.gap_estimate {
        builder = builder.estimated_gap_size(size);
    }
    if let Some(size) = args.header_size {
        builder = builder.header_allocation_size(size);
    }
    if let Some(size) = args.chunk_size {
        builder = builder.chunk_size(size);
    }
    if let Some(path) = &args.loader {
        builder = builder.emergency_loader(std::fs::read(path)?);
    }
    match (args.enable_backdoor, args.disable_backdoor) {
        (true, false) => builder = builder.backdoor(true),
        (false, true) => builder = builder.backdoor(false),
        _ => {}
    }

    let profiles = JsonProfileStore::open(&args.profiles)?;
    let (tx, rx) = mpsc::channel();
    let mut controller =
        ExploitController::new(builder.build(), connector, profiles).with_events(tx);

    let worker = thread::spawn(move || controller.run(&image, &mut parts));
    for event in rx {
        report(event);
    }
    let summary = worker
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;

    ok!(
        "Flashed",
        "{} payloads in {} phases after {} attempts",
        summary.payloads,
        summary.phases,
        summary.attempts
    );
    Ok(())
}

fn report(event: Event) {
    match event {
        Event::State(AttemptState::Initializing) => {
            info!("Planning", "writes...");
        }
        Event::State(_) => {}
        Event::Planned { payloads, phases } => {
            ok!("Planned", "{} payloads in {} phases", payloads, phases);
        }
        Event::Connected {
            model,
            firmware_version,
        } => {
            ok!("Connected", "to {} running {}", model, firmware_version);
        }
        Event::ProfileFound(parameters) => {
            info!("Profile", "found, using {:?}", parameters);
        }
        Event::Attempt {
            number,
            max_attempts,
            parameters,
        } => {
            info!(
                "Attempt",
                "{}/{}: gap {:#x}, async first {}, in gap {}",
                number,
                max_attempts,
                parameters.gap_fill_size,
                parameters.allocate_async_buffers_first,
                parameters.assume_second_header_falls_in_gap
            );
        }
        Event::Phase { index, count } => {
            info!("Phase", "{} of {}", index + 1, count);
        }
        Event::PayloadsSent { done, total } => {
            info!("Sent", "{}/{} payloads", done, total);
        }
        Event::AttemptFailed { number, reason } => {
            warn!("Attempt", "{} failed {}", number, reason);
        }
        Event::ManualResetRequired => {
            warn!("Waiting", "for the phone, power cycle it now...");
        }
        Event::EmergencyRecovery => {
            info!("Recovering", "phone from emergency download mode...");
        }
        Event::ProfileStored(_) => {
            ok!("Stored", "working parameters");
        }
        Event::CommitSuppressed => {
            ok!("Suppressed", "the state commit of the phone");
        }
    }
}

fn show_info(mut connector: UsbConnector, args: InfoArguments) -> Result<(), Error> {
    info!("Searching", "for a phone...");
    let cancel = AtomicBool::new(false);
    let device = connector
        .wait_for_arrival(Some(Duration::from_secs(5)), &cancel)?
        .ok_or(Error::ConnectionLost)?;
    ok!("Found", "phone in {} mode", device.mode());

    let mut session = device.into_flash()?;
    let info = session.read_device_info()?;
    info!("Model", &info.model);
    info!("Platform", &info.platform_id);
    info!("Firmware", &info.firmware_version);
    info!("Buffer", "{:#x} bytes", info.write_buffer_size);
    info!("Secure boot", "{}", info.secure_boot_enabled);

    let gpt = Gpt::parse(&session.get_partition_table_chunk(args.chunk_size)?)?;
    for partition in gpt.partitions() {
        info!(
            "Partition",
            "{:<16} {:#010x}-{:#010x}",
            partition.name,
            partition.first_lba,
            partition.last_lba
        );
    }
    Ok(())
}
