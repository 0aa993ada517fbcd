use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use nfc_mrtd::Error;
use nfc_mrtd::adapter::{self, ReaderAdapter};
use nfc_mrtd::config::EngineConfig;
use nfc_mrtd::engine::{Engine, TracingObserver};
use nfc_mrtd::iso7816::card::CommunicationError;
use nfc_mrtd::lds::DataGroupContent;
use nfc_mrtd::mrz::{MrzData, MrzInfo};
use nfc_mrtd::passport::{AccessKey, AuthMethod, PassportData};
use nfc_mrtd::tag::NfcTag;
use nfc_mrtd::tag::ndef::Record;
use nfc_mrtd::tag::reader::{BlockData, TagContent};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;


#[derive(Clone, Debug, Parser)]
#[command(version, about = "Reads electronic passports and NFC tags")]
struct Opts {
    /// TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log more; repeat for trace output including APDUs.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Clone, Debug, Subcommand)]
enum Mode {
    /// Lists the readers the configured adapter can see.
    ListReaders,

    /// Waits for a passport and reads it.
    ReadPassport(ReadPassportOpts),

    /// Waits for a tag and reads it.
    ReadTag(WaitOpts),

    /// Parses a machine-readable zone and verifies its check digits.
    CheckMrz(CheckMrzOpts),
}

#[derive(Clone, Debug, Args)]
struct WaitOpts {
    /// Seconds to wait for a card.
    #[arg(short, long, default_value = "30")]
    timeout: u64,
}

#[derive(Clone, Debug, Args)]
struct ReadPassportOpts {
    /// File containing the complete machine-readable zone.
    #[arg(long = "mrz", conflicts_with_all = ["document_number", "can"])]
    mrz_path: Option<PathBuf>,

    #[arg(long, requires_all = ["birth", "expiry"], conflicts_with = "can")]
    document_number: Option<String>,

    /// Date of birth (YYMMDD, YYYYMMDD or YYYY-MM-DD).
    #[arg(long, requires = "document_number")]
    birth: Option<String>,

    /// Date of expiry (YYMMDD, YYYYMMDD or YYYY-MM-DD).
    #[arg(long, requires = "document_number")]
    expiry: Option<String>,

    /// Card access number printed on the document.
    #[arg(long)]
    can: Option<String>,

    /// Overrides the configured authentication method (bac, pace, auto).
    #[arg(long)]
    method: Option<AuthMethod>,

    #[command(flatten)]
    wait: WaitOpts,
}

#[derive(Clone, Debug, Args)]
struct CheckMrzOpts {
    /// File containing the machine-readable zone.
    path: PathBuf,
}


fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}


fn read_text(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path)
        .map(|text| text.trim().to_owned())
        .map_err(|e| Error::InvalidRequest(format!("failed to read {}: {}", path.display(), e)))
}


fn access_key(opts: &ReadPassportOpts) -> Result<AccessKey, Error> {
    if let Some(path) = &opts.mrz_path {
        return AccessKey::from_mrz_text(&read_text(path)?);
    }
    if let Some(can) = &opts.can {
        return AccessKey::can(can);
    }
    match (&opts.document_number, &opts.birth, &opts.expiry) {
        (Some(number), Some(birth), Some(expiry)) => Ok(AccessKey::from(MrzInfo::new(number, birth, expiry)?)),
        _ => Err(Error::InvalidRequest(
            "give --mrz, --can or --document-number with --birth and --expiry".to_owned(),
        )),
    }
}


/// Handles events until a tag matching `wanted` is in the field.
fn wait_for_tag<A: ReaderAdapter, F: Fn(&NfcTag) -> bool>(
    engine: &mut Engine<A>,
    timeout: Duration,
    wanted: F,
) -> Result<Vec<u8>, Error> {
    let deadline = Instant::now() + timeout;
    info!("waiting up to {} s for a card", timeout.as_secs());
    loop {
        let found = engine.present_uids()
            .into_iter()
            .find(|uid| engine.tag(uid).map_or(false, &wanted));
        if let Some(uid) = found {
            return Ok(uid);
        }

        let now = Instant::now();
        if now >= deadline {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            return Err(Error::from(CommunicationError::Timeout { timeout_ms }));
        }
        engine.run_once(deadline - now)?;
    }
}


fn start_engine(mut config: EngineConfig) -> Result<Engine<Box<dyn ReaderAdapter>>, Error> {
    // the tool decides itself what to read
    config.auto_read = false;
    let adapter = adapter::from_config(&config)?;
    let mut engine = Engine::new(adapter, config)?;
    engine.add_observer(TracingObserver);
    engine.start()?;
    Ok(engine)
}


fn list_readers(config: &EngineConfig) -> Result<(), Error> {
    let mut adapter = adapter::from_config(config)?;
    adapter.connect()?;
    let info = adapter.get_info();
    if let Err(e) = adapter.disconnect() {
        debug!("disconnecting failed: {}", e);
    }
    let info = info?;

    println!("adapter: {} ({})", info.adapter, info.version);
    println!("available: {}", info.available);
    for (key, value) in &info.details {
        println!("{}: {}", key, value);
    }
    let capabilities: Vec<String> = info.capabilities.iter()
        .map(|capability| format!("{:?}", capability))
        .collect();
    println!("capabilities: {}", capabilities.join(", "));
    if info.readers.is_empty() {
        println!("no readers");
    }
    for (i, reader) in info.readers.iter().enumerate() {
        println!("{}: {}", i, reader);
    }
    Ok(())
}


fn read_passport(mut config: EngineConfig, opts: &ReadPassportOpts) -> Result<(), Error> {
    let key = access_key(opts)?;
    if let Some(method) = opts.method {
        config.auth_method = method;
    }

    let mut engine = start_engine(config)?;
    engine.set_access_key(Some(key));
    let uid = wait_for_tag(&mut engine, Duration::from_secs(opts.wait.timeout), |tag| tag.tag_type.may_be_smart_card())?;
    let result = engine.read_passport(&uid);
    if let Err(e) = engine.stop() {
        debug!("stopping failed: {}", e);
    }
    print_passport(&result?);
    Ok(())
}


fn print_passport(data: &PassportData) {
    match data.authenticated {
        Some(method) => println!("access control: {:?}", method),
        None => println!("access control: none"),
    }
    match (&data.com, &data.com_error) {
        (Some(com), _) => {
            println!(
                "EF.COM: LDS {}, Unicode {}, data groups {:?}",
                com.lds_version.as_deref().unwrap_or("?"),
                com.unicode_version.as_deref().unwrap_or("?"),
                com.data_groups,
            );
        },
        (None, Some(e)) => println!("EF.COM: {}", e),
        (None, None) => {},
    }
    match (&data.sod, &data.sod_error) {
        (Some(sod), _) => println!("EF.SOD: {} bytes, SHA-256 {} (signature not verified)", sod.content_length, sod.sha256),
        (None, Some(e)) => println!("EF.SOD: {}", e),
        (None, None) => {},
    }

    for (number, group) in &data.data_groups {
        let group = match group {
            Ok(group) => group,
            Err(e) => {
                println!("DG{}: {}", number, e);
                continue;
            },
        };
        print!("DG{} ({}): ", number, group.name);
        match &group.content {
            DataGroupContent::Mrz(mrz) => {
                println!("{:?} {} {}", mrz.variant(), mrz.issuer(), mrz.name());
                println!("  document number: {}", mrz.document_number());
                println!("  nationality:     {}", mrz.nationality());
                println!("  date of birth:   {}", mrz.date_of_birth());
                println!("  sex:             {:?}", mrz.sex());
                println!("  date of expiry:  {}", mrz.date_of_expiry());
            },
            DataGroupContent::UnrecognizedMrz(text) => println!("unrecognized MRZ {:?}", text),
            DataGroupContent::Face { image, .. }
                    | DataGroupContent::Portrait(image)
                    | DataGroupContent::Signature(image) => {
                println!("{:?} image, {} bytes", image.format, image.size);
            },
            DataGroupContent::Fingerprints(fingerprints) => println!("{} fingerprints", fingerprints.len()),
            DataGroupContent::Text { fields, .. } => {
                println!();
                for (key, value) in fields {
                    println!("  {}: {}", key, value);
                }
            },
            DataGroupContent::PublicKey(key) => println!("{:?} public key, {} bytes", key.format, key.length),
            DataGroupContent::SecurityOptions(hex)|DataGroupContent::Raw(hex) => println!("{}", hex),
        }
    }
}


fn print_blocks(label: &str, blocks: &[BlockData]) {
    for block in blocks {
        match &block.data {
            Ok(data) => println!("{} {:3}: {}  {}", label, block.number, hex::encode_upper(data), block.ascii().unwrap_or_default()),
            Err(e) => println!("{} {:3}: {}", label, block.number, e),
        }
    }
}


fn print_records(records: &[Record]) {
    for record in records {
        match record.value() {
            Ok(value) => println!("NDEF: {}", value),
            Err(e) => println!("NDEF: {}", e),
        }
    }
}


fn read_tag(config: EngineConfig, opts: &WaitOpts) -> Result<(), Error> {
    let mut engine = start_engine(config)?;
    let uid = wait_for_tag(&mut engine, Duration::from_secs(opts.timeout), |_| true)?;
    let result = engine.read_tag(&uid);
    let tag = engine.tag(&uid).cloned();
    if let Err(e) = engine.stop() {
        debug!("stopping failed: {}", e);
    }
    let content = result?;

    if let Some(tag) = tag {
        println!("UID: {}", tag.uid_hex());
        println!("type: {} ({} bytes)", tag.tag_type, tag.capacity);
        println!("writable: {}, locked: {}", tag.is_writable, tag.is_locked);
    }
    match content {
        TagContent::Classic { sectors } => {
            for sector in &sectors {
                match &sector.blocks {
                    Ok(blocks) => print_blocks("block", blocks),
                    Err(e) => println!("sector {}: {}", sector.number, e),
                }
            }
        },
        TagContent::Type2 { pages, ndef, .. } => {
            print_blocks("page", &pages);
            match ndef {
                Some(Ok(records)) => print_records(&records),
                Some(Err(e)) => println!("NDEF: {}", e),
                None => println!("no NDEF message"),
            }
        },
        TagContent::Desfire(desfire) => {
            if let Some(version) = &desfire.version {
                println!("hardware: {:?}", version.hardware);
                println!("software: {:?}", version.software);
            }
            for application in &desfire.applications {
                println!("application {}", hex::encode_upper(application));
            }
            if let Some(e) = &desfire.error {
                println!("error: {}", e);
            }
        },
        TagContent::Generic { blocks } => print_blocks("block", &blocks),
        TagContent::Ndef { records } => print_records(&records),
    }
    Ok(())
}


fn check_mrz(opts: &CheckMrzOpts) -> Result<(), Error> {
    let text = read_text(&opts.path)?;
    let mrz = MrzData::parse_unchecked(&text)?;

    println!("layout:        {:?}", mrz.variant());
    println!("issuer:        {}", mrz.issuer());
    println!("name:          {}", mrz.name());
    println!("MRZ validity check:");
    println!("  document no.: {}", mrz.is_document_number_valid());
    println!("  birth date:   {}", mrz.is_date_of_birth_valid());
    println!("  expiry date:  {}", mrz.is_date_of_expiry_valid());
    match mrz.validate() {
        Ok(()) => println!("  overall:      true"),
        Err(e) => println!("  overall:      false ({})", e),
    }
    println!("MRZ information: {}", MrzInfo::from_mrz(&mrz).mrz_information());
    Ok(())
}


fn load_config(path: Option<&Path>) -> Result<EngineConfig, Error> {
    match path {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => Ok(EngineConfig::default()),
    }
}


fn run(opts: &Opts) -> Result<(), Error> {
    match &opts.mode {
        Mode::CheckMrz(check_opts) => check_mrz(check_opts),
        Mode::ListReaders => list_readers(&load_config(opts.config.as_deref())?),
        Mode::ReadPassport(read_opts) => read_passport(load_config(opts.config.as_deref())?, read_opts),
        Mode::ReadTag(wait_opts) => read_tag(load_config(opts.config.as_deref())?, wait_opts),
    }
}


fn main() -> ExitCode {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} error: {}", e.kind(), e);
            ExitCode::FAILURE
        },
    }
}
