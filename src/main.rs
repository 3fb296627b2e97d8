use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use obliterator_engine::algorithms::{SanitizationMethod, SanitizationRequest, SanitizationTier};
use obliterator_engine::config::EngineConfig;
use obliterator_engine::crypto::{
    key_fingerprint, verify_record, AttestationRecord, AttestationSigner, CertificateContext,
    Ed25519Signer,
};
use obliterator_engine::drives::{DeviceInventory, SimulatedBackend, SimulatedDevice};
use obliterator_engine::error::JobJournal;
use obliterator_engine::executor::{ControlMessage, JobOutcome};
use obliterator_engine::ui::{human_bytes, outcome_label, ProgressRenderer};
use obliterator_engine::verification::VerificationPolicy;
use obliterator_engine::{DeviceDescriptor, OperatorIdentity, SanitizationEngine, TechnologyClass};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "obliterator")]
#[command(about = "Secure erasure of storage media with signed erasure attestations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, global = true, env = "OBLITERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write JSON logs to a daily file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Work against in-memory devices instead of the host, e.g. `hdd:64MiB`
    #[arg(long = "simulate", global = true, value_name = "CLASS:SIZE")]
    simulate: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate devices
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show everything known about one device
    Inspect {
        device: String,

        #[arg(long)]
        json: bool,
    },

    /// List the sanitization methods in the catalog
    Methods {
        #[arg(long)]
        json: bool,
    },

    /// Erase a device, verify it, and write a signed attestation
    Wipe(WipeArgs),

    /// Check the signature of an attestation file
    VerifyAttestation {
        attestation: PathBuf,

        /// Hex-encoded public key the record must be signed with
        #[arg(long)]
        public_key: Option<String>,
    },

    /// Mark jobs interrupted by a crash or power loss as aborted
    Recover,

    /// Generate an Ed25519 signing key
    Keygen {
        /// Defaults to the configured signing key path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Tier {
    Clear,
    Purge,
}

impl From<Tier> for SanitizationTier {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Clear => SanitizationTier::Clear,
            Tier::Purge => SanitizationTier::Purge,
        }
    }
}

#[derive(Args)]
struct WipeArgs {
    device: String,

    #[arg(short, long, value_enum, default_value = "clear")]
    tier: Tier,

    /// Specific catalog method, e.g. purge/three-pass
    #[arg(short, long)]
    method: Option<String>,

    /// Accept that overwriting flash media cannot reach remapped blocks
    #[arg(long)]
    acknowledge_incomplete_overwrite: bool,

    /// Operator responsible for the job
    #[arg(long, env = "OBLITERATOR_OPERATOR")]
    operator: String,

    /// Where to write the attestation; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Read back every sector instead of sampling
    #[arg(long)]
    full_verify: bool,

    #[arg(long)]
    leave_hidden_exposed: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,

    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Args)]
struct ContextArgs {
    #[arg(long)]
    manufacturer: Option<String>,
    #[arg(long)]
    property_number: Option<String>,
    #[arg(long)]
    media_type: Option<String>,
    #[arg(long)]
    media_source: Option<String>,
    #[arg(long)]
    pre_confidentiality: Option<String>,
    #[arg(long)]
    post_confidentiality: Option<String>,
    #[arg(long)]
    destination: Option<String>,
}

impl ContextArgs {
    fn into_context(self) -> Option<CertificateContext> {
        let context = CertificateContext {
            manufacturer: self.manufacturer,
            property_number: self.property_number,
            media_type: self.media_type,
            media_source: self.media_source,
            pre_sanitization_confidentiality: self.pre_confidentiality,
            post_sanitization_confidentiality: self.post_confidentiality,
            post_sanitization_destination: self.destination,
        };
        (context != CertificateContext::default()).then_some(context)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.debug, cli.json_logs, cli.log_dir.as_deref())?;

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::List { json } => {
            list_devices(&inventory(&cli.simulate)?, json)?;
        }
        Commands::Inspect { device, json } => {
            let descriptor = inventory(&cli.simulate)?.inspect(&device)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&descriptor)?);
            } else {
                print_descriptor(&descriptor);
            }
        }
        Commands::Methods { json } => {
            list_methods(&config, json)?;
        }
        Commands::Wipe(args) => {
            let inventory = Arc::new(inventory(&cli.simulate)?);
            return wipe(inventory, &config, args, cli.json_logs).await;
        }
        Commands::VerifyAttestation {
            attestation,
            public_key,
        } => {
            return verify_attestation(&attestation, public_key.as_deref());
        }
        Commands::Recover => {
            recover(&config)?;
        }
        Commands::Keygen { output } => {
            keygen(&config, output)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn init_logging(debug: bool, json: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = if debug {
        EnvFilter::try_new("debug")
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))
    }
    .context("invalid log filter")?;

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "obliterator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(io::stderr)))
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(io::stderr)))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn inventory(simulate: &[String]) -> Result<DeviceInventory> {
    if !simulate.is_empty() {
        let backend = SimulatedBackend::new();
        for (index, spec) in simulate.iter().enumerate() {
            let (class, size) = parse_simulated(spec)?;
            backend.add(SimulatedDevice::builder(format!("sim:{}", index), class, size).build());
        }
        return Ok(DeviceInventory::new(Arc::new(backend)));
    }
    system_inventory()
}

#[cfg(target_os = "linux")]
fn system_inventory() -> Result<DeviceInventory> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("raw device access requires root; run with sudo or use --simulate");
    }
    Ok(DeviceInventory::system())
}

#[cfg(not(target_os = "linux"))]
fn system_inventory() -> Result<DeviceInventory> {
    bail!("host devices are only supported on Linux; use --simulate")
}

fn parse_simulated(spec: &str) -> Result<(TechnologyClass, u64)> {
    let (class, size) = spec
        .split_once(':')
        .with_context(|| format!("expected CLASS:SIZE, got '{}'", spec))?;
    let class: TechnologyClass = class.parse()?;
    let split = size
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(size.len());
    let (digits, unit) = size.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("bad size '{}'", size))?;
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        other => bail!("unknown size unit '{}'", other),
    };
    Ok((class, value * multiplier))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn list_devices(inventory: &DeviceInventory, json: bool) -> Result<()> {
    let devices = inventory.enumerate()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No devices detected.");
        return Ok(());
    }

    println!(
        "{:<16} {:<24} {:<18} {:<12} {:<10} {:<8}",
        "Device", "Model", "Serial", "Size", "Type", "Hidden"
    );
    println!("{}", "-".repeat(92));
    for d in &devices {
        let hidden = if d.has_hidden_region {
            human_bytes(d.hidden_bytes()).yellow().to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<16} {:<24} {:<18} {:<12} {:<10} {:<8}",
            d.device_id,
            truncate(&d.model, 24),
            truncate(&d.serial, 18),
            human_bytes(d.reported_capacity),
            d.technology.as_str(),
            hidden
        );
    }
    Ok(())
}

fn print_descriptor(d: &DeviceDescriptor) {
    println!("{}", "=".repeat(60));
    println!("Device:      {}", d.device_id.bold());
    println!("Model:       {}", d.model);
    println!("Serial:      {}", d.serial);
    if !d.bus_path.is_empty() {
        println!("Bus path:    {}", d.bus_path);
    }
    println!("Technology:  {}", d.technology);
    println!("Reported:    {} ({} bytes)", human_bytes(d.reported_capacity), d.reported_capacity);
    println!("Native:      {} ({} bytes)", human_bytes(d.native_capacity), d.native_capacity);
    println!("Sector size: {}", d.sector_size);
    if d.read_only {
        println!("{}", "Read-only".red());
    }
    if !d.firmware_erase.is_empty() {
        let names: Vec<String> = d.firmware_erase.iter().map(|f| f.to_string()).collect();
        println!("Firmware:    {}", names.join(", "));
    }
    for region in &d.hidden_regions {
        println!(
            "  {} {} at {} ({}){}",
            "⚠".yellow(),
            region.kind,
            region.offset,
            human_bytes(region.length),
            if region.locked { ", locked" } else { "" }
        );
    }
}

fn list_methods(config: &EngineConfig, json: bool) -> Result<()> {
    let registry = config.registry()?;
    let mut methods: Vec<&SanitizationMethod> = registry.methods().map(|m| m.as_ref()).collect();
    methods.sort_by(|a, b| a.id.cmp(&b.id));
    if json {
        println!("{}", serde_json::to_string_pretty(&methods)?);
        return Ok(());
    }
    for m in methods {
        let classes: Vec<&str> = m.technology_classes.iter().map(|c| c.as_str()).collect();
        println!("{}  {}", m.id.bold(), m.name);
        println!(
            "    {} | {} | {} pass(es) | {}",
            m.tier(),
            m.standard.reference,
            m.passes.len(),
            classes.join(", ")
        );
    }
    Ok(())
}

fn confirm(descriptor: &DeviceDescriptor, request: &SanitizationRequest) -> Result<bool> {
    eprintln!(
        "{} all data on {} ({} {}, serial {}) will be destroyed by {}.",
        "WARNING:".red().bold(),
        descriptor.device_id.bold(),
        human_bytes(descriptor.native_capacity),
        descriptor.technology,
        descriptor.serial,
        request
    );
    eprint!("Type the device id to continue: ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == descriptor.device_id)
}

async fn wipe(
    inventory: Arc<DeviceInventory>,
    config: &EngineConfig,
    args: WipeArgs,
    quiet: bool,
) -> Result<ExitCode> {
    let mut engine = SanitizationEngine::from_config(inventory, config)?;
    if let Some(context) = args.context.into_context() {
        engine = engine.with_certificate_context(context);
    }
    for entry in engine.recover_interrupted()? {
        tracing::warn!(job_id = %entry.job_id, device = %entry.device_id, "Previous job was interrupted");
    }

    let mut request = SanitizationRequest::new(args.tier.into());
    if let Some(method) = args.method {
        request = request.with_method(method);
    }
    if args.acknowledge_incomplete_overwrite {
        request = request.acknowledging_incomplete_overwrite();
    }

    let mut options = engine.options().clone();
    options.leave_hidden_exposed |= args.leave_hidden_exposed;
    if args.full_verify {
        options.verification = VerificationPolicy::full();
    }

    let descriptor = engine.inspect(&args.device)?;
    if !args.yes && !confirm(&descriptor, &request)? {
        eprintln!("Aborted; nothing was written.");
        return Ok(ExitCode::from(1));
    }

    let (job, target) = engine.prepare_with_options(
        &args.device,
        &request,
        OperatorIdentity::new(args.operator),
        options,
    )?;
    let mut handle = engine.start(job, target)?;

    let canceller = handle.canceller();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])?;
    let signal_handle = signals.handle();
    let signal_thread = std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            eprintln!("\nInterrupt received; stopping at the next chunk boundary...");
            let _ = canceller.send(ControlMessage::Cancel);
        }
    });

    let mut renderer = if quiet {
        ProgressRenderer::hidden()
    } else {
        ProgressRenderer::new()
    };
    while let Some(event) = handle.next_event().await {
        renderer.handle(&event);
    }
    renderer.finish();

    let executed = handle.finish().await?;
    signal_handle.close();
    let _ = signal_thread.join();

    let report = engine.complete(executed).await?;
    let outcome = report.outcome().unwrap_or(JobOutcome::Failed);
    eprintln!("{} {}", outcome_label(outcome), report.job.explain());
    if let Some(verification) = report.job.verification() {
        eprintln!(
            "verification: {} ({:.2}% coverage, {} mismatched, {} unreadable)",
            verification.verdict,
            verification.coverage_percent(),
            verification.sectors_mismatched,
            verification.sectors_unreadable
        );
    }

    match report.attestation {
        Some(Ok(record)) => {
            let text = record.to_json_pretty()?;
            match args.output {
                Some(ref path) => {
                    std::fs::write(path, text)
                        .with_context(|| format!("writing attestation to {}", path.display()))?;
                    eprintln!("attestation written to {}", path.display());
                }
                None => println!("{}", text),
            }
        }
        Some(Err(err)) => {
            eprintln!("{} {}", "attestation not issued:".yellow().bold(), err);
        }
        None => {}
    }

    Ok(match outcome {
        JobOutcome::Success => ExitCode::SUCCESS,
        JobOutcome::Partial => ExitCode::from(2),
        JobOutcome::Failed => ExitCode::from(1),
        JobOutcome::Aborted => ExitCode::from(130),
    })
}

fn verify_attestation(path: &Path, public_key: Option<&str>) -> Result<ExitCode> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let record = AttestationRecord::from_json(&text)?;
    let trusted = public_key
        .map(hex::decode)
        .transpose()
        .context("public key must be hex")?;

    match verify_record(&record, trusted.as_deref()) {
        Ok(()) => {
            let p = &record.payload;
            println!("{} certificate {}", "VALID".green().bold(), p.certificate_id);
            println!("  device:   {} ({} {})", p.device.device_id, p.device.model, p.device.serial);
            println!("  method:   {}", p.method.id);
            println!("  outcome:  {}", p.outcome);
            println!("  operator: {}", p.operator);
            println!("  signer:   {} [{}]", p.signer.identity, p.signer.key_fingerprint);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("{} {}", "INVALID".red().bold(), err);
            Ok(ExitCode::from(1))
        }
    }
}

fn recover(config: &EngineConfig) -> Result<()> {
    let Some(ref path) = config.journal_path else {
        bail!("no journal configured");
    };
    let mut journal = JobJournal::open(path)?;
    let recovered = journal.recover_interrupted()?;
    if recovered.is_empty() {
        println!("No interrupted jobs.");
    }
    for entry in recovered {
        println!(
            "{} job {} on {} ({}, operator {}) started {}",
            "aborted".red(),
            entry.job_id,
            entry.device_id,
            entry.method_id,
            entry.operator,
            entry.started_at.to_rfc3339()
        );
    }
    Ok(())
}

fn keygen(config: &EngineConfig, output: Option<PathBuf>) -> Result<()> {
    let path = output
        .or_else(|| config.signing_key_path.clone())
        .context("no output path and no configured signing key path")?;
    let pkcs8 = Ed25519Signer::generate_pkcs8()?;
    Ed25519Signer::write_pkcs8_file(&path, &pkcs8)?;
    let signer = Ed25519Signer::from_pkcs8(&pkcs8, config.signer_identity.clone())?;
    let public_key = signer.public_key();
    println!("key written to {}", path.display());
    println!("public key:  {}", hex::encode(&public_key));
    println!("fingerprint: {}", key_fingerprint(&public_key));
    Ok(())
}
