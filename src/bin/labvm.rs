use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use labvm::daemon;
use labvm::ident::{derive, TapIndex};
use labvm::lab::load_lab;
use labvm::plan::plan_lab;
use labvm::preflight;
use labvm::profile::VmClass;
use labvm::readiness::ReadinessWaiter;
use labvm::registry::ResourceKey;
use labvm::switch::{self, OvsVsctl};
use labvm::Settings;

#[derive(Debug, Parser)]
#[command(name = "labvm", version, about = "Launch support for QEMU/KVM lab guests")]
struct Cli {
    /// Settings file (YAML)
    #[arg(long, global = true, env = "LABVM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the MAC, link-local address and console ports of a tap
    Derive {
        tap: TapIndex,
        #[arg(long, default_value = "linux")]
        class: VmClass,
        /// Link-local zone (SVI name)
        #[arg(long, conflicts_with = "ovs")]
        zone: Option<String>,
        /// Look the zone up on Open vSwitch
        #[arg(long)]
        ovs: bool,
        #[arg(long)]
        json: bool,
    },
    /// Identifiers and files for every VM of a lab
    Plan {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Parse and validate a lab file
    Validate {
        #[arg(long)]
        file: PathBuf,
    },
    /// Run the start-up checks for every VM of a lab
    Check {
        #[arg(long)]
        file: PathBuf,
        /// Directory holding the working copies
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
    },
    /// Print the ovs-vsctl changes a switch file needs
    SwitchPlan {
        #[arg(long)]
        file: PathBuf,
        /// Call ovs-vsctl directly instead of through sudo
        #[arg(long)]
        no_sudo: bool,
    },
    /// Wait for a Unix socket to appear
    Wait {
        socket: PathBuf,
        #[arg(long)]
        attempts: Option<u32>,
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// Claim taps and images for an owner
    Reserve {
        #[arg(long)]
        owner: String,
        #[arg(long = "tap")]
        taps: Vec<TapIndex>,
        #[arg(long = "image")]
        images: Vec<PathBuf>,
        /// Holder process, defaults to the calling shell
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Drop every claim of an owner
    Release {
        #[arg(long)]
        owner: String,
    },
    /// List current reservations
    List,
    /// Remove reservations whose holder is gone
    Prune,
    /// Serve the HTTP resource API
    Serve {
        #[arg(long, default_value_t = default_listen())]
        listen: SocketAddr,
    },
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, daemon::DEFAULT_PORT))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("labvm: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Derive {
            tap,
            class,
            zone,
            ovs,
            json,
        } => {
            let mut ids = derive(tap, &settings.mac_prefix, class.port_bases());
            let zone = match (zone, ovs) {
                (Some(zone), _) => Some(zone),
                (None, true) => Some(switch::zone_for_tap(&OvsVsctl::new(), tap).await?),
                (None, false) => None,
            };
            if let Some(zone) = zone {
                ids.link_local = ids.link_local.with_zone(zone);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&ids)?);
            } else {
                println!("interface: {}", ids.interface);
                println!("mac: {}", ids.mac);
                println!("link_local: {}", ids.link_local);
                println!("spice: {}", ids.spice_port);
                println!("telnet: {}", ids.telnet_port);
            }
        }
        Command::Plan { file, json } => {
            let lab = load_lab(&file)?;
            let work_dir = std::env::current_dir()?;
            let plans = plan_lab(&lab, &settings, &work_dir)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                for plan in &plans {
                    print!("{plan}");
                }
            }
        }
        Command::Validate { file } => {
            let lab = load_lab(&file)?;
            println!("valid: {} ({} vms)", file.display(), lab.kvm.vms.len());
        }
        Command::Check { file, work_dir } => {
            let lab = load_lab(&file)?;
            let registry = settings.registry();
            for vm in &lab.kvm.vms {
                preflight::check_vm(vm, &settings, &work_dir, &registry)?;
                println!("ok: {}", vm.name());
            }
        }
        Command::SwitchPlan { file, no_sudo } => {
            let switches = switch::load_switches(&file)?;
            let ovs = OvsVsctl::new().sudo(!no_sudo);
            let mut pending = 0;
            for decl in &switches.ovs.switches {
                for change in switch::plan_switch(&ovs, decl).await? {
                    pending += 1;
                    match change.command_line() {
                        Some(line) => println!("{line}"),
                        None => println!("# {change}"),
                    }
                }
            }
            if pending == 0 {
                println!("{}: no changes", file.display());
            }
        }
        Command::Wait {
            socket,
            attempts,
            interval,
        } => {
            let waiter = ReadinessWaiter::new(
                &socket,
                attempts.unwrap_or(settings.readiness.attempts),
                interval.unwrap_or(settings.readiness.interval),
            );
            waiter.await_ready().await?;
            println!("ready: {}", socket.display());
        }
        Command::Reserve {
            owner,
            taps,
            images,
            pid,
        } => {
            let keys: Vec<ResourceKey> = taps
                .into_iter()
                .map(ResourceKey::Tap)
                .chain(images.iter().map(|p| ResourceKey::image(p)))
                .collect();
            if keys.is_empty() {
                return Err("reserve requires at least one --tap or --image".into());
            }
            let pid = pid.unwrap_or_else(std::os::unix::process::parent_id);
            for r in settings.registry().reserve(&owner, &keys, pid)? {
                println!("reserved {} for {} (pid {})", r.key, r.owner, r.pid);
            }
        }
        Command::Release { owner } => {
            let count = settings.registry().release(&owner)?;
            println!("released {count} reservation(s) of {owner}");
        }
        Command::List => {
            for r in settings.registry().list()? {
                println!("{}\t{}\t{}", r.key, r.owner, r.pid);
            }
        }
        Command::Prune => {
            for r in settings.registry().prune()? {
                println!("pruned {} ({} pid {})", r.key, r.owner, r.pid);
            }
        }
        Command::Serve { listen } => daemon::serve(listen, settings.registry()).await?,
    }

    Ok(())
}
