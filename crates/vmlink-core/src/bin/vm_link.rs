//! vm-link - headless engine ↔ OS device volume link
//!
//! Connects to the engine, links every physical bus and virtual strip to its
//! playback device and keeps them in sync until Enter is pressed (or for a
//! fixed time with `--seconds`). Per-device link state comes from the
//! settings file.
//!
//! ## Command line flags
//!
//! - `--simulate <standard|banana|potato>`: simulated engine and devices
//! - `--dll <path>`: load the remote library from an explicit path
//! - `--launch <standard|banana|potato>`: engine to start if it is not running
//! - `--settings <path>`: settings file (default: per-user config dir)
//! - `--seconds <n>`: run for `n` seconds instead of waiting for Enter

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vmlink_core::{
    connect, ChannelLink, DllEngine, EndpointBackend, EngineDevice, EngineVariant, LinkManager, MemoryEngine,
    ParamValue, Property, RemoteEngine, Session, SharedSettings, VirtualEndpoints, YamlSettingsStore,
};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Args {
    simulate: Option<EngineVariant>,
    dll: Option<String>,
    launch: Option<EngineVariant>,
    settings: Option<PathBuf>,
    seconds: Option<u64>,
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
            "--settings" => args.settings = Some(iter.next().context("--settings expects a path")?.into()),
            "--seconds" => {
                let value = iter.next().context("--seconds expects a number")?;
                args.seconds = Some(value.parse().with_context(|| format!("Invalid --seconds '{}'", value))?);
            }
            other => bail!("Unexpected argument '{}'", other),
        }
    }
    Ok(args)
}

/// Simulated engine plus matching playback devices
fn simulation(variant: EngineVariant) -> (Arc<MemoryEngine>, VirtualEndpoints) {
    let engine = MemoryEngine::new(variant);
    engine.set_output_devices(vec![EngineDevice::wdm("Speakers"), EngineDevice::wdm("Headphones")]);
    engine.external_set("Bus[0].device.name", ParamValue::Text("Speakers".into()));

    let endpoints = VirtualEndpoints::new();
    endpoints.add_device("{sim-speakers}", "Speakers");
    endpoints.add_device("{sim-headphones}", "Headphones");
    let layout = variant.layout();
    for index in 0..layout.counts().strips {
        if let Some(name) = layout.virtual_device_name(index) {
            endpoints.add_device(&format!("{{sim-strip-{}}}", index), name);
        }
    }
    (Arc::new(engine), endpoints)
}

#[cfg(target_os = "windows")]
fn start_os_links(session: &Session, settings: SharedSettings) -> Result<LinkManager> {
    let backend = || -> Box<dyn EndpointBackend> { Box::new(vmlink_core::MmDeviceBackend::new()) };
    Ok(LinkManager::start(session, backend, settings)?)
}

#[cfg(not(target_os = "windows"))]
fn start_os_links(_session: &Session, _settings: SharedSettings) -> Result<LinkManager> {
    bail!("OS endpoint volume is only supported on Windows; use --simulate")
}

fn print_link(link: &ChannelLink) {
    let resource = link.resource();
    let gain = resource.get(Property::Gain).ok().and_then(|v| v.as_f32());
    let mute = resource.get(Property::Mute).ok().and_then(|v| v.as_bool());
    println!(
        "  {:<24} device: {:<12} link: {:<5} gain: {:>6} dB  mute: {}",
        link.label(),
        link.current_device_id().unwrap_or_else(|| "-".into()),
        link.link_volume(),
        gain.map_or_else(|| "?".into(), |g| format!("{:.1}", g)),
        mute.map_or_else(|| "?".into(), |m| m.to_string()),
    );
}

fn wait_for_exit(seconds: Option<u64>) -> Result<()> {
    match seconds {
        Some(seconds) => std::thread::sleep(Duration::from_secs(seconds)),
        None => {
            println!("Linked. Press Enter to quit.");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).context("Failed to read stdin")?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    if args.simulate.is_none() && !cfg!(target_os = "windows") {
        bail!("OS endpoint volume is only supported on Windows; use --simulate");
    }

    let store = match &args.settings {
        Some(path) => YamlSettingsStore::new(path),
        None => YamlSettingsStore::at_default_path(),
    };
    log::info!("vm-link: settings at {:?}", store.path());
    let settings = SharedSettings::open(Arc::new(store));

    let (engine, endpoints): (Arc<dyn RemoteEngine>, Option<VirtualEndpoints>) = match args.simulate {
        Some(variant) => {
            log::info!("vm-link: simulating a {} engine", variant);
            let (engine, endpoints) = simulation(variant);
            let engine: Arc<dyn RemoteEngine> = engine;
            (engine, Some(endpoints))
        }
        None => {
            let engine = match &args.dll {
                Some(path) => DllEngine::load(path),
                None => DllEngine::load_default(),
            }
            .context("Failed to load the remote library")?;
            let engine: Arc<dyn RemoteEngine> = Arc::new(engine);
            (engine, None)
        }
    };

    let launch = args.launch.or(settings.get().engine_variant);
    let variant = connect(engine.as_ref(), launch, LAUNCH_TIMEOUT).context("Failed to connect to the engine")?;
    if settings.get().engine_variant != Some(variant) {
        settings.update(|s| s.engine_variant = Some(variant))?;
    }

    let mut session = Session::open(engine.clone(), settings.tuning().session_options())?;

    let mut manager = match &endpoints {
        Some(endpoints) => LinkManager::start(&session, || endpoints.backend(), settings.clone())?,
        None => start_os_links(&session, settings.clone())?,
    };

    wait_for_exit(args.seconds)?;

    println!("{} engine:", variant);
    for link in manager.links() {
        print_link(link);
    }

    manager.shutdown();
    session.close();
    if let Err(e) = engine.logout() {
        log::warn!("vm-link: logout failed: {}", e);
    }
    Ok(())
}
