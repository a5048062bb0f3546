//! refnet - operational CLI for the referral network engine
//!
//! Stands in for the HTTP layer during development and admin work: seed the
//! tree, register members, confirm activations and inspect downlines.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use refnet_backend::models::{NewMember, Side};
use refnet_backend::{EngineConfig, MemberStore, ReferralEngine, TreeQueryService};

#[derive(Parser)]
#[command(name = "refnet", about = "Binary referral network engine")]
struct Cli {
    /// SQLite database path
    #[arg(long, env = "REFNET_DB", default_value = "refnet.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the schema and seed the plan catalog
    Init,
    /// Create the designated root member
    SeedRoot {
        #[arg(long, default_value = "Network")]
        first_name: String,
        #[arg(long, default_value = "Root")]
        last_name: String,
        #[arg(long, default_value = "root@refnet.local")]
        email: String,
    },
    /// Register a member under an introducer
    Register {
        #[arg(long)]
        introducer: i64,
        /// Preferred side: A or B
        #[arg(long)]
        side: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
    },
    /// Mark a member's email as verified
    Verify {
        member_id: i64,
    },
    /// Record a verified payment and run the activation walk
    Activate {
        member_id: i64,
        #[arg(long, default_value_t = 1)]
        plan: i64,
        /// Gateway reference; when given, the payment is recorded and
        /// confirmed through the transaction gate
        #[arg(long)]
        reference: Option<String>,
        /// Paid amount; defaults to the plan's product price
        #[arg(long)]
        amount: Option<f64>,
    },
    /// Print a member's downline as JSON
    Tree {
        member_id: i64,
        #[arg(long, default_value_t = 3)]
        depth: usize,
    },
    /// Request a withdrawal from a member's balance
    Withdraw {
        member_id: i64,
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        wallet: String,
    },
    /// Show a member's sales ledger
    Ledger {
        member_id: i64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let store = MemberStore::open(&cli.db).context("open member store")?;
    let engine = ReferralEngine::new(store.clone(), EngineConfig::from_env());

    // Notification side: subscribe before the command so post-commit events
    // can be handed off. Dispatch is fire-and-forget and never gates the
    // command's outcome.
    let mut notifications = engine.events().subscribe();

    match cli.command {
        Command::Init => {
            store.seed_plans().await?;
            info!("schema initialized and plan catalog seeded");
        }
        Command::SeedRoot {
            first_name,
            last_name,
            email,
        } => {
            store.seed_plans().await?;
            let member_id = engine.seed_root(&first_name, &last_name, &email).await?;
            println!("root member: {member_id}");
        }
        Command::Register {
            introducer,
            side,
            first_name,
            last_name,
            email,
        } => {
            let side = Side::from_str(&side).ok_or_else(|| anyhow!("side must be A or B"))?;
            let registered = engine
                .register(NewMember {
                    introducer_id: introducer,
                    referral_type: side,
                    first_name,
                    last_name,
                    email,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&registered)?);
        }
        Command::Verify { member_id } => {
            let changed = engine.mark_verified(member_id).await?;
            println!(
                "member {member_id}: {}",
                if changed { "verified" } else { "already verified" }
            );
        }
        Command::Activate {
            member_id,
            plan,
            reference,
            amount,
        } => {
            let result = match reference {
                Some(reference) => {
                    let amount = match amount {
                        Some(amount) => amount,
                        None => {
                            store
                                .get_plan(plan)
                                .await?
                                .ok_or_else(|| anyhow!("unknown plan {plan}"))?
                                .product_price
                        }
                    };
                    engine
                        .record_payment(&reference, member_id, plan, amount)
                        .await?;
                    engine.confirm_payment(&reference).await?
                }
                None => engine.on_plan_activated(member_id, plan).await?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Tree { member_id, depth } => {
            let tree = TreeQueryService::new(store.clone());
            let downline = tree.get_downline(member_id, depth).await?;
            println!("{}", serde_json::to_string_pretty(&downline)?);
        }
        Command::Withdraw {
            member_id,
            amount,
            wallet,
        } => {
            let withdrawal = engine.request_withdrawal(member_id, amount, &wallet).await?;
            println!("{}", serde_json::to_string_pretty(&withdrawal)?);
        }
        Command::Ledger { member_id, limit } => {
            let entries = store.list_ledger(member_id, limit).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    while let Ok(event) = notifications.try_recv() {
        info!(event = ?event, "notification dispatched");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_amount_is_optional_with_a_reference() {
        let cli = Cli::try_parse_from([
            "refnet", "activate", "7501", "--plan", "1", "--reference", "trx-1",
        ])
        .unwrap();
        match cli.command {
            Command::Activate {
                member_id,
                reference,
                amount,
                ..
            } => {
                assert_eq!(member_id, 7501);
                assert_eq!(reference.as_deref(), Some("trx-1"));
                // Unset on the command line: resolved from the plan price.
                assert_eq!(amount, None);
            }
            _ => panic!("parsed into the wrong subcommand"),
        }
    }

    #[test]
    fn activate_amount_override_is_honored() {
        let cli = Cli::try_parse_from([
            "refnet",
            "activate",
            "7501",
            "--reference",
            "trx-1",
            "--amount",
            "450.0",
        ])
        .unwrap();
        match cli.command {
            Command::Activate { amount, .. } => assert_eq!(amount, Some(450.0)),
            _ => panic!("parsed into the wrong subcommand"),
        }
    }
}
