use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use dnshape::{Config, IpfwConfig, RawParams, Reconciler};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dnshape")]
#[command(about = "Shape traffic to and from an address with ipfw and dummynet", version)]
struct Cli {
    /// Path of the ipfw binary. Defaults to $DNSHAPE_IPFW, then `ipfw`.
    #[arg(long, global = true)]
    ipfw: Option<PathBuf>,
    /// Run ipfw through sudo.
    #[arg(long, global = true)]
    sudo: bool,
    /// Log more, repeat for debug output. RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shape traffic to (down) and from (up) an address
    Set(SetArgs),
    /// Show the shaping of an address
    Get {
        /// IP address, MAC address or `any`
        address: String,
    },
    /// Remove all shaping of an address
    Clear {
        /// IP address, MAC address or `any`
        address: String,
    },
}

#[derive(Args, Debug)]
struct SetArgs {
    /// IP address, MAC address or `any`
    address: String,
    /// Bandwidth cap towards the address, in bit/s or `unlimited`
    #[arg(long, default_value = "")]
    down_bandwidth: String,
    /// Delay added towards the address, in ms
    #[arg(long, default_value = "")]
    down_delay: String,
    /// Packet loss rate towards the address, between 0 and 1
    #[arg(long, default_value = "")]
    down_loss: String,
    /// Bandwidth cap from the address, in bit/s or `unlimited`
    #[arg(long, default_value = "")]
    up_bandwidth: String,
    /// Delay added from the address, in ms
    #[arg(long, default_value = "")]
    up_delay: String,
    /// Packet loss rate from the address, between 0 and 1
    #[arg(long, default_value = "")]
    up_loss: String,
    /// Only validate the arguments, without touching ipfw
    #[arg(long)]
    check: bool,
}

impl SetArgs {
    fn down(&self) -> RawParams {
        RawParams::new()
            .bandwidth(&self.down_bandwidth)
            .delay(&self.down_delay)
            .loss(&self.down_loss)
    }

    fn up(&self) -> RawParams {
        RawParams::new().bandwidth(&self.up_bandwidth).delay(&self.up_delay).loss(&self.up_loss)
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut ipfw = IpfwConfig::from_env();
    if let Some(program) = cli.ipfw {
        ipfw = ipfw.program(program);
    }
    if cli.sudo {
        ipfw = ipfw.sudo(true);
    }

    let config = Config { ipfw, ..Config::default() };
    tracing::debug!(?config, "loaded configuration");

    let shaper = Reconciler::from_config(config);

    match cli.command {
        Command::Set(args) => {
            if args.check {
                shaper.validate(&args.address, &args.up())?;
                shaper.validate(&args.address, &args.down())?;
                println!("ok");
                return Ok(());
            }

            shaper
                .set(&args.address, &args.down(), &args.up())
                .with_context(|| format!("failed to shape {}", args.address))?;
        }
        Command::Get { address } => {
            let state = shaper.get(&address).with_context(|| format!("failed to read {address}"))?;
            println!("{state}");
        }
        Command::Clear { address } => {
            shaper.clear(&address).with_context(|| format!("failed to clear {address}"))?;
        }
    }

    Ok(())
}
