//! camgrid - manage the camera list and look cameras up on the network.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::AtomicBool;

use camgrid::ui::{Ui, UiMode};
use camgrid::{
    AddressResolver, CamgridConfig, CameraIdentity, FeedError, FeedRecord, FeedStore,
    HardwareAddress, SubnetResolver,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Output style: auto, plain or pretty.
    #[arg(long, default_value = "auto")]
    ui: UiMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured cameras.
    List,
    /// Add a camera by hardware address.
    Add {
        mac: String,
        user: String,
        secret: String,
    },
    /// Remove a camera by hardware address.
    Remove { mac: String },
    /// Scan the subnet once for a camera and print its address.
    Resolve { mac: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = CamgridConfig::load().context("load configuration")?;
    let store = FeedStore::new(&cfg.store_path);

    match args.command {
        Command::List => list(&store),
        Command::Add { mac, user, secret } => add(&store, &mac, &user, &secret),
        Command::Remove { mac } => remove(&store, &mac),
        Command::Resolve { mac } => resolve(&cfg, Ui::detect(args.ui), &mac),
    }
}

fn list(store: &FeedStore) -> Result<()> {
    let records = store.load()?;
    if records.is_empty() {
        println!("no cameras in {}", store.path().display());
    }
    for record in records {
        println!("{}\t{}", record.hardware_address, record.user_name);
    }
    Ok(())
}

fn add(store: &FeedStore, mac: &str, user: &str, secret: &str) -> Result<()> {
    let identity = CameraIdentity::parse(mac, user, secret)?;
    let mut records = store.load()?;
    if find(&records, &identity.hardware_address()).is_some() {
        return Err(FeedError::InvalidIdentity(format!(
            "{} is already registered",
            identity.hardware_address()
        ))
        .into());
    }
    records.push(FeedRecord::from(&identity));
    store.save(&records)?;
    println!("added {}", identity.hardware_address());
    Ok(())
}

fn remove(store: &FeedStore, mac: &str) -> Result<()> {
    let target: HardwareAddress = mac.parse()?;
    let mut records = store.load()?;
    match find(&records, &target) {
        Some(index) => {
            records.remove(index);
            store.save(&records)?;
            println!("removed {target}");
        }
        None => println!("{target} is not configured"),
    }
    Ok(())
}

fn resolve(cfg: &CamgridConfig, ui: Ui, mac: &str) -> Result<()> {
    let target: HardwareAddress = mac.parse()?;
    let resolver = SubnetResolver::system(cfg.subnet, cfg.probe_timeout);
    let stage = ui.stage(&format!("scanning {} hosts for {}", cfg.subnet.host_count(), target));
    match resolver.resolve(&target, &AtomicBool::new(false)) {
        Ok(address) => {
            stage.finish(address.to_string());
            println!("{address}");
        }
        Err(FeedError::AddressNotFound(_)) => {
            stage.finish("not found");
            println!("not found");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn find(records: &[FeedRecord], target: &HardwareAddress) -> Option<usize> {
    records.iter().position(|record| {
        record
            .hardware_address
            .parse::<HardwareAddress>()
            .map(|address| address == *target)
            .unwrap_or(false)
    })
}
