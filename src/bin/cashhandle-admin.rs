#![forbid(unsafe_code)]
//! Admin tool for the CashHandle store: rankings, dividends and demo data

use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cashhandle::bsv::BsvWallet;
use cashhandle::cli::{
    format_satoshis, open_database_from_config, overview_table, pending_table, rankings_table,
    report_table,
};
use cashhandle::demo::seed_demo;
use cashhandle::divvy::{DivvyService, DivvySettings, IncomingPayment};
use cashhandle::handcash::provider_from_config;

#[derive(Parser)]
#[command(name = "cashhandle-admin", version, about = "Administer a CashHandle store")]
struct Cli {
    /// Path to config.toml (defaults to ./config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tokens ranked by dividends paid
    Rankings,
    /// Dividend totals across the store
    Stats,
    /// Distributions waiting to be paid
    Pending,
    /// Record a payment received by a handle
    RecordPayment {
        handle: String,
        /// Amount in the currency's minor unit
        amount: u64,
        tx_id: String,
        #[arg(long, default_value = "BSV")]
        currency: String,
    },
    /// Pay out the pending distributions of a payment with the token owner's wallet
    Distribute { payment_id: String },
    /// Seed showcase tokens, holders and dividend history
    SeedDemo,
    /// Show the chain wallet address and balance
    Wallet,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let (config, db) = open_database_from_config(cli.config.as_deref())?;
    let db = Arc::new(db);

    let service = || -> Result<DivvyService, Box<dyn std::error::Error>> {
        Ok(DivvyService::new(
            Arc::clone(&db),
            provider_from_config(&config.handcash)?,
            DivvySettings::from(&config.divvy),
        ))
    };

    match cli.command {
        Command::Rankings => {
            let rankings = service()?.rankings()?;
            if rankings.is_empty() {
                println!("{}", "No tokens yet.".yellow());
            } else {
                println!("{}", rankings_table(&rankings));
            }
        }
        Command::Stats => {
            println!("{}", overview_table(&service()?.stats()?));
        }
        Command::Pending => {
            let pending = service()?.pending_distributions()?;
            if pending.is_empty() {
                println!("{}", "✅ Nothing pending.".green());
            } else {
                println!("{}", pending_table(&pending));
                println!("{} pending", pending.len().to_string().bold());
            }
        }
        Command::RecordPayment {
            handle,
            amount,
            tx_id,
            currency,
        } => {
            let recorded = service()?.record_payment(&IncomingPayment {
                handcash_handle: handle,
                amount,
                currency,
                tx_id,
                from_handle: None,
                timestamp: None,
            })?;
            println!(
                "{} {} ({} eligible holders, {} distributed, {} kept by the owner)",
                "✅ Recorded payment".green().bold(),
                recorded.payment.id.bright_white(),
                recorded.eligible_holders,
                recorded.payment.distributed_amount,
                recorded.payment.remaining_amount,
            );
        }
        Command::Distribute { payment_id } => {
            let payment = db
                .get_dividend_payment(&payment_id)?
                .ok_or("Dividend payment not found")?;
            let token = db.get_token(&payment.token_id)?.ok_or("Token not found")?;
            let owner = db.get_user(&token.owner_id)?.ok_or("Token owner not found")?;

            let report = service()?.distribute_as_owner(&owner, &payment_id).await?;
            println!("{}", report_table(&report));
            if report.failed > 0 {
                println!(
                    "{}",
                    format!("⚠️  {} payouts failed", report.failed).yellow()
                );
            }
        }
        Command::SeedDemo => {
            let report = seed_demo(&db)?;
            println!(
                "{} {} tokens created, {} already present, {} dividend payments",
                "🌱 Demo data:".green().bold(),
                report.tokens_created,
                report.tokens_skipped,
                report.payments_recorded,
            );
        }
        Command::Wallet => {
            let wallet = BsvWallet::from_config(&config.bsv);
            println!("{} {:?}", "Network:".cyan(), wallet.network());
            println!("{} {}", "Address:".cyan(), wallet.address());
            println!(
                "{} {}",
                "Balance:".cyan(),
                format_satoshis(wallet.balance()).bright_green()
            );
        }
    }

    Ok(())
}
