//! vmsmith: provision and run Linux guest VMs.
//!
//! Thin command-line surface over the `vmsmith` library. The platform VM lives
//! in this process, so `start` stays in the foreground serving the platform
//! event loop until the guest stops or Ctrl-C requests a stop.

use std::io::{BufRead, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use vmsmith::config::Settings;
use vmsmith::hypervisor::VzHypervisor;
use vmsmith::paths::VmsmithPaths;
use vmsmith::vm::{RunState, Transition, VmDescriptor, VmHandle, VmInfo, ssh};
use vmsmith::{VmError, logging};

/// Time the foreground loop waits for Ctrl-C between run-loop slices.
const SIGNAL_TICK: Duration = Duration::from_millis(20);
/// Run-loop slice; the signal future is not polled while it runs.
const PUMP_SLICE: Duration = Duration::from_millis(30);

type Handle = VmHandle<VzHypervisor>;

/// Provision and run Linux guest VMs on macOS Virtualization.framework
#[derive(Parser, Debug)]
#[command(name = "vmsmith", version, about)]
struct Cli {
    /// Settings file (default: ~/.config/vmsmith/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log lifecycle progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether this host can run VMs
    Check,
    /// Create (or load) a VM configuration
    Create {
        name: String,
        /// CPU cores
        #[arg(short, long)]
        cpu: Option<u32>,
        /// Memory in GB
        #[arg(short, long)]
        memory: Option<u64>,
        /// Disk size in GB
        #[arg(short, long)]
        disk: Option<u64>,
        /// Linux installation ISO
        #[arg(short, long)]
        iso: Option<PathBuf>,
        /// SSH public key file (a key pair is generated when omitted)
        #[arg(long)]
        ssh_key: Option<PathBuf>,
        /// Build a cloud-init seed for unattended first boot
        #[arg(long)]
        auto_install: bool,
    },
    /// List VMs
    List {
        #[arg(long)]
        json: bool,
    },
    /// Start a VM and keep it running in the foreground
    Start { name: String },
    /// Stop a VM
    Stop { name: String },
    /// Show VM configuration and state
    Status {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete a VM and all of its files
    Delete {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Open an SSH session to a running VM
    Ssh {
        name: String,
        /// Guest user (default from settings)
        #[arg(short, long)]
        user: Option<String>,
        /// Private key (default: the VM's generated key, if any)
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
    /// Print the IP address of a running VM
    Ip { name: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = match &cli.config {
        Some(path) => Settings::load(path),
        None => Settings::load_default(),
    }
    .context("loading settings")?;
    let mut handle = VmHandle::new(VzHypervisor::new(), settings).context("resolving the VM root")?;

    match cli.command {
        Command::Check => check(&handle),
        Command::Create { name, cpu, memory, disk, iso, ssh_key, auto_install } => {
            let defaults = &handle.settings().defaults;
            let mut descriptor = VmDescriptor::with_defaults(&name, defaults);
            descriptor.cpus = cpu.unwrap_or(descriptor.cpus);
            descriptor.memory_gb = memory.unwrap_or(descriptor.memory_gb);
            descriptor.disk_gb = disk.unwrap_or(descriptor.disk_gb);
            descriptor.iso_path = iso;
            descriptor.auto_install = auto_install;
            if let Some(path) = ssh_key {
                let key = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading SSH public key {}", path.display()))?;
                descriptor.ssh_public_key = Some(key.trim().to_string());
            }
            create(&mut handle, &descriptor)
        }
        Command::List { json } => list(&handle, json),
        Command::Start { name } => start(&mut handle, &name),
        Command::Stop { name } => stop(&mut handle, &name),
        Command::Status { name, json } => status(&mut handle, &name, json),
        Command::Delete { name, force } => delete(&mut handle, &name, force),
        Command::Ssh { name, user, key } => ssh_session(&handle, &name, user, key),
        Command::Ip { name } => {
            let ip = discover(&handle, &name)?;
            println!("{ip}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn check(handle: &Handle) -> Result<ExitCode> {
    let support = handle.support();
    println!("{}", support.message);
    Ok(if support.supported { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn create(handle: &mut Handle, descriptor: &VmDescriptor) -> Result<ExitCode> {
    prepare_root(handle.root())?;
    let info = handle
        .build(descriptor)
        .with_context(|| format!("creating VM '{}'", descriptor.name))?;

    print_info(&info);
    if descriptor.auto_install && info.payload_image.is_none() {
        println!("Automatic install unavailable; install the guest interactively on first boot.");
    }
    println!("Start it with: vmsmith start {}", info.name);
    Ok(ExitCode::SUCCESS)
}

fn list(handle: &Handle, json: bool) -> Result<ExitCode> {
    let items = handle.list().context("listing VMs")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(ExitCode::SUCCESS);
    }
    if items.is_empty() {
        println!("No VMs found in {}", handle.root().display());
        println!("Create one with: vmsmith create <name>");
        return Ok(ExitCode::SUCCESS);
    }

    let width = items.iter().map(|i| i.name.len()).max().unwrap_or(4).max(4);
    println!("{:<width$}  {:>10}  PATH", "NAME", "SIZE");
    for item in &items {
        println!("{:<width$}  {:>10}  {}", item.name, human_size(item.size_bytes), item.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn start(handle: &mut Handle, name: &str) -> Result<ExitCode> {
    handle.load(name).with_context(|| format!("loading VM '{name}'"))?;

    match handle.start() {
        Transition::Accepted(done) => {
            println!("VM '{name}' is starting. Press Ctrl-C to stop it.");
            run_foreground(handle, name, done)
        }
        Transition::Refused(reason) => bail!("failed to start VM '{name}': {reason}"),
    }
}

fn stop(handle: &mut Handle, name: &str) -> Result<ExitCode> {
    handle.load(name).with_context(|| format!("loading VM '{name}'"))?;

    let state = handle.state();
    if !state.is_active() {
        println!("VM '{name}' is not running (state: {state})");
        return Ok(ExitCode::SUCCESS);
    }
    match handle.stop() {
        Transition::Accepted(_) => {
            println!("VM '{name}' is stopping");
            Ok(ExitCode::SUCCESS)
        }
        Transition::Refused(reason) => bail!("failed to stop VM '{name}': {reason}"),
    }
}

#[derive(Serialize)]
struct StatusReport {
    #[serde(flatten)]
    info: VmInfo,
    ip_address: Option<Ipv4Addr>,
}

fn status(handle: &mut Handle, name: &str, json: bool) -> Result<ExitCode> {
    let mut info = handle.load(name).with_context(|| format!("loading VM '{name}'"))?;
    info.state = handle.state();
    let report = StatusReport { ip_address: handle.discover_address(name), info };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_info(&report.info);
        match report.ip_address {
            Some(ip) => println!("IP address:   {ip}"),
            None => println!("IP address:   unknown"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn delete(handle: &mut Handle, name: &str, force: bool) -> Result<ExitCode> {
    let items = handle.list().context("listing VMs")?;
    let Some(item) = items.iter().find(|i| i.name == name) else {
        return Err(VmError::NotFound { name: name.to_string() }.into());
    };
    println!("Deleting {} ({})", item.path.display(), human_size(item.size_bytes));

    if !force && !confirm(&format!("Delete VM '{name}' and all its files? [y/N]: "))? {
        println!("Deletion cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    handle.delete(name).with_context(|| format!("deleting VM '{name}'"))?;
    println!("VM '{name}' deleted");
    Ok(ExitCode::SUCCESS)
}

fn ssh_session(handle: &Handle, name: &str, user: Option<String>, key: Option<PathBuf>) -> Result<ExitCode> {
    let ip = discover(handle, name)?;
    let key = key.or_else(|| ssh::default_key(&handle.working_dir(name)));
    if key.is_none() {
        warn!(vm = name, "no SSH key found, falling back to password login");
    }
    let user = user.unwrap_or_else(|| handle.settings().guest.user.clone());
    let args = ssh::ssh_args(&user, ip, key.as_deref());

    #[cfg(unix)]
    {
        let program = &handle.settings().tools.ssh;
        let err = ssh::exec(program, &args);
        Err(err).with_context(|| format!("executing {program}"))
    }
    #[cfg(not(unix))]
    {
        let _ = args;
        bail!("interactive SSH sessions require a Unix host")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Serve the platform event loop until the VM stops. Ctrl-C requests a stop.
fn run_foreground(
    handle: &mut Handle,
    name: &str,
    started: mpsc::Receiver<std::result::Result<(), String>>,
) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("creating runtime")?;

    let code = runtime.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut stopping = false;
        let mut start_settled = false;
        let mut seen = RunState::Created;

        loop {
            tokio::select! {
                _ = &mut ctrl_c, if !stopping => {
                    stopping = true;
                    match handle.stop() {
                        Transition::Accepted(_) => println!("Stopping VM '{name}'..."),
                        Transition::Refused(reason) => {
                            eprintln!("Stop refused: {reason}");
                            stopping = false;
                        }
                    }
                }
                _ = tokio::time::sleep(SIGNAL_TICK) => {}
            }

            handle.pump(PUMP_SLICE);

            if let Ok(result) = started.try_recv() {
                start_settled = true;
                if let Err(reason) = result {
                    eprintln!("VM '{name}' failed to start: {reason}");
                    return ExitCode::FAILURE;
                }
            }

            let state = handle.state();
            if state != seen {
                println!("VM '{name}': {state}");
                seen = state;
            }
            match state {
                RunState::Error => return ExitCode::FAILURE,
                RunState::Stopped if start_settled || stopping => return ExitCode::SUCCESS,
                _ => {}
            }
        }
    });
    Ok(code)
}

fn discover(handle: &Handle, name: &str) -> Result<Ipv4Addr> {
    if !handle.working_dir(name).is_dir() {
        return Err(VmError::NotFound { name: name.to_string() }.into());
    }
    match handle.discover_address(name) {
        Some(ip) => Ok(ip),
        None => bail!("no IP address found for VM '{name}' yet; it may still be booting, try again shortly"),
    }
}

fn prepare_root(root: &Path) -> Result<()> {
    match VmsmithPaths::resolve() {
        Some(paths) if paths.vms == root => paths.ensure().context("creating vmsmith directories"),
        _ => std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display())),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_info(info: &VmInfo) {
    println!("VM:           {}", info.name);
    println!("State:        {}", info.state);
    println!("CPUs:         {}", info.cpus);
    println!("Memory:       {} GB", info.memory_gb);
    println!("Disk:         {} GB ({})", info.disk_gb, info.disk_path.display());
    println!("MAC address:  {}", info.mac_address);
    println!("Directory:    {}", info.vm_dir.display());
    if let Some(iso) = &info.install_image {
        println!("Install ISO:  {}", iso.display());
    }
    if let Some(payload) = &info.payload_image {
        println!("Cloud-init:   {}", payload.display());
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} B") } else { format!("{value:.1} {}", UNITS[unit]) }
}
