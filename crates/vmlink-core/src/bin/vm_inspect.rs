//! vm-inspect - dump the state of a running mixing engine
//!
//! Connects to the engine, performs one refresh of every channel and prints
//! the readable parameters plus the engine's output device list.
//!
//! ## Command line flags
//!
//! - `--simulate <standard|banana|potato>`: use the in-process engine simulator
//! - `--dll <path>`: load the remote library from an explicit path
//! - `--launch <standard|banana|potato>`: engine to start if it is not running

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use vmlink_core::{
    connect, DllEngine, EngineDevice, EngineVariant, MemoryEngine, ParamValue, RemoteEngine, ResourceEntity,
    Session, SessionOptions,
};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed command line
#[derive(Debug, Default)]
struct Args {
    simulate: Option<EngineVariant>,
    dll: Option<String>,
    launch: Option<EngineVariant>,
}

fn parse_variant(flag: &str, value: Option<String>) -> Result<EngineVariant> {
    let value = value.with_context(|| format!("{} expects an engine variant", flag))?;
    EngineVariant::from_name(&value).with_context(|| format!("Unknown engine variant '{}'", value))
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = Some(parse_variant(&arg, iter.next())?),
            "--launch" => args.launch = Some(parse_variant(&arg, iter.next())?),
            "--dll" => args.dll = Some(iter.next().context("--dll expects a path")?),
            other => bail!("Unexpected argument '{}'", other),
        }
    }
    Ok(args)
}

fn simulated_engine(variant: EngineVariant) -> Arc<MemoryEngine> {
    let engine = MemoryEngine::new(variant);
    engine.set_output_devices(vec![
        EngineDevice::wdm("Speakers (Realtek High Definition Audio)"),
        EngineDevice::wdm("Headphones (USB Audio)"),
    ]);
    engine.external_set("Bus[0].device.name", ParamValue::Text("Speakers (Realtek High Definition Audio)".into()));
    Arc::new(engine)
}

fn open_engine(args: &Args) -> Result<Arc<dyn RemoteEngine>> {
    if let Some(variant) = args.simulate {
        log::info!("vm-inspect: simulating a {} engine", variant);
        return Ok(simulated_engine(variant));
    }

    let engine = match &args.dll {
        Some(path) => DllEngine::load(path),
        None => DllEngine::load_default(),
    }
    .context("Failed to load the remote library")?;
    Ok(Arc::new(engine))
}

fn print_channel(resource: &ResourceEntity) {
    println!("  {} ({})", resource.key(), resource.label());
    for desc in resource.descriptors().readable(resource.variant()) {
        match resource.get(desc.property) {
            Ok(value) => println!("    {:<14} {}", desc.property, value),
            Err(e) => println!("    {:<14} <{}>", desc.property, e),
        }
    }
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    let engine = open_engine(&args)?;

    let variant = connect(engine.as_ref(), args.launch, LAUNCH_TIMEOUT).context("Failed to connect to the engine")?;
    let version = engine.version().context("Failed to read engine version")?;

    // One-shot refresh; close() joins the poll thread once it has run
    let mut session = Session::open(
        engine.clone(),
        SessionOptions {
            refresh_interval: None,
            ..Default::default()
        },
    )?;
    session.close();

    println!("Engine:  {} ({})", variant, version);
    println!();
    println!("Strips:");
    for strip in session.strips() {
        print_channel(strip);
    }
    println!();
    println!("Buses:");
    for bus in session.buses() {
        print_channel(bus);
    }
    println!();

    println!("Output devices:");
    let devices = engine.output_devices().context("Failed to list output devices")?;
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        println!("  [{:?}] {} {}", device.driver, device.name, device.hardware_id);
    }

    if let Err(e) = engine.logout() {
        log::warn!("vm-inspect: logout failed: {}", e);
    }
    Ok(())
}
