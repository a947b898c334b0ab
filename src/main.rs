use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use num_bigint::BigUint;
use serde::Serialize;

use simple_storage::{
    config::{init_tracing, DriverArgs, HostOptions},
    contracts::{parse_integer, StoredValue},
    driver,
    host::Host,
    ledger::LedgerSnapshot,
    tx::{generate_signing_key, signer_address, Address, BlockHash},
};

/// Operator CLI for the SimpleStorage counter on the local devnet ledger.
#[derive(Parser)]
#[command(name = "simple-storage", version)]
struct Cli {
    #[command(flatten)]
    host: HostOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an ed25519 keypair as sk.hex / pk.hex.
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Instantiate a new counter.
    Deploy,
    /// Write a value and wait for its confirmation.
    Store {
        address: Address,
        #[arg(value_parser = parse_integer)]
        value: BigUint,
    },
    /// Print the current value.
    Retrieve { address: Address },
    /// Deploy, read, write and read back in one go.
    Run(DriverArgs),
    /// Print a JSON summary of the ledger.
    Inspect,
}

#[derive(Serialize)]
struct ContractSummary {
    address: Address,
    deployer: Address,
    created_at: u64,
    value: StoredValue,
}

#[derive(Serialize)]
struct LedgerSummary {
    height: u64,
    last_block: Option<BlockHash>,
    state_root: String,
    accounts: usize,
    transactions: usize,
    contracts: Vec<ContractSummary>,
}

impl From<LedgerSnapshot> for LedgerSummary {
    fn from(snapshot: LedgerSnapshot) -> Self {
        LedgerSummary {
            height: snapshot.meta.height,
            last_block: snapshot.meta.last_block,
            state_root: hex::encode(snapshot.state_root),
            accounts: snapshot.accounts.len(),
            transactions: snapshot.receipts.len(),
            contracts: snapshot
                .contracts
                .into_iter()
                .map(|(address, instance)| ContractSummary {
                    address,
                    deployer: instance.deployer,
                    created_at: instance.created_at,
                    value: instance.storage.retrieve().clone(),
                })
                .collect(),
        }
    }
}

fn keygen(out_dir: PathBuf) -> anyhow::Result<()> {
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("cannot create {}", out_dir.display()))?;
    let sk = generate_signing_key();
    let pk = sk.verifying_key();
    fs::write(out_dir.join("sk.hex"), hex::encode(sk.to_bytes()))
        .context("cannot write sk.hex")?;
    fs::write(out_dir.join("pk.hex"), hex::encode(pk.as_bytes()))
        .context("cannot write pk.hex")?;
    println!("address: {}", signer_address(&sk));
    println!("keypair written → {}", out_dir.display());
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = cli.host;
    match cli.command {
        Command::Keygen { out_dir } => keygen(out_dir)?,
        Command::Deploy => {
            let host = options.connect().await?;
            let deployment = host.instantiate().await?;
            println!("SimpleStorage deployed to {}", deployment.address);
            println!(
                "tx {} (block {})",
                deployment.tx_hash, deployment.block_height
            );
        }
        Command::Store { address, value } => {
            let host = options.connect().await?;
            let pending = host.write(&address, value).await?;
            let confirmation = host.await_confirmation(pending).await?;
            println!(
                "stored: tx {} (block {}, {})",
                confirmation.tx_hash, confirmation.block_height, confirmation.block_hash
            );
        }
        Command::Retrieve { address } => {
            let host = options.connect().await?;
            println!("{}", host.read(&address).await?);
        }
        Command::Run(args) => {
            let host = options.connect().await?;
            let report = driver::run(&host, &args.into()).await?;
            println!("{report}");
        }
        Command::Inspect => {
            let host = options.connect().await?;
            let summary = LedgerSummary::from(host.snapshot().await);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}
