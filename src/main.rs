//! HarvestPay - grower payment consolidation and cheque lifecycle CLI.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harvestpay_backend::engine::voiding::VoidRequest;
use harvestpay_backend::models::{to_amount, from_amount, PaymentMethod};
use harvestpay_backend::{Config, OpContext, PaymentEngine, PaymentStore};

#[derive(Parser)]
#[command(name = "harvestpay", about = "Grower payment consolidation engine")]
struct Cli {
    /// SQLite database path. Overrides DATABASE_PATH.
    #[arg(long, env = "DATABASE_PATH")]
    database: Option<String>,

    /// Operator recorded on every mutation. Overrides OPERATOR.
    #[arg(long, env = "OPERATOR")]
    operator: Option<String>,

    /// Emit results as JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a small demo dataset: two open batches and an active advance.
    Seed,
    /// Preview a distribution for the given batches without committing.
    Preview {
        /// Comma-separated batch ids.
        #[arg(long, value_delimiter = ',')]
        batches: Vec<String>,
        #[arg(long, default_value = "cheque")]
        method: String,
    },
    /// Build a distribution: one net instrument per grower, advances netted.
    Build {
        #[arg(long, value_delimiter = ',')]
        batches: Vec<String>,
        #[arg(long, default_value = "cheque")]
        method: String,
    },
    /// Issue an advance to a grower and cut its payout instrument.
    Advance {
        #[arg(long)]
        grower: i64,
        /// Dollar amount, e.g. 200.00.
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        reason: String,
    },
    /// List a grower's outstanding advances.
    Advances {
        #[arg(long)]
        grower: i64,
    },
    /// Print an instrument; completes the covered batch items.
    Print {
        #[arg(long)]
        instrument: String,
    },
    /// Reprint an already-printed instrument (audit-only).
    Reprint {
        #[arg(long)]
        instrument: String,
    },
    /// Mark a printed instrument delivered.
    Deliver {
        #[arg(long)]
        instrument: String,
        #[arg(long, default_value = "mail")]
        method: String,
    },
    /// Void one or more instruments.
    Void {
        /// Comma-separated instrument ids.
        #[arg(long, value_delimiter = ',')]
        instruments: Vec<String>,
        #[arg(long)]
        reason: String,
        /// Re-credit the advances this payment netted.
        #[arg(long)]
        reverse_deductions: bool,
        /// Revert covered batch items to pending.
        #[arg(long)]
        restore_batch: bool,
    },
    /// Place a stop payment on a printed cheque.
    Stop {
        #[arg(long)]
        instrument: String,
    },
    /// Show an instrument's audit trail.
    Audit {
        #[arg(long)]
        instrument: String,
    },
}

fn parse_method(s: &str) -> Result<PaymentMethod> {
    PaymentMethod::parse(s).ok_or_else(|| anyhow!("unknown payment method: {s}"))
}

async fn seed_demo(engine: &PaymentEngine, ctx: &OpContext) -> Result<()> {
    use harvestpay_backend::models::{
        BatchItem, BatchKind, BatchStatus, ItemStatus, PaymentBatch,
    };

    engine
        .store()
        .with_tx(|tx| {
            for (id, date) in [("b1", "2026-07-15"), ("b2", "2026-08-01")] {
                tx.insert_batch(&PaymentBatch {
                    id: id.into(),
                    kind: BatchKind::AllPending,
                    batch_date: date.into(),
                    crop_year: 2026,
                    status: BatchStatus::Open,
                })?;
            }
            for (id, batch_id, grower, cents) in [
                ("i1", "b1", 7, to_amount(150.0)),
                ("i2", "b2", 7, to_amount(100.0)),
                ("i3", "b1", 12, to_amount(80.0)),
            ] {
                tx.insert_batch_item(&BatchItem {
                    id: id.into(),
                    batch_id: batch_id.into(),
                    grower_no: grower,
                    amount: cents,
                    status: ItemStatus::Pending,
                })?;
            }
            Ok(())
        })
        .await?;
    engine
        .issue_advance(7, to_amount(200.0), "pre-harvest inputs", ctx)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db_path = cli.database.unwrap_or(config.database_path);
    let operator = cli.operator.unwrap_or(config.operator);

    let store = PaymentStore::new(&db_path)
        .with_context(|| format!("opening database at {db_path}"))?;
    let engine = PaymentEngine::new(store);
    let ctx = OpContext::new(operator, Utc::now());
    info!(db = %db_path, actor = %ctx.actor, "harvestpay started");

    match cli.command {
        Command::Seed => {
            seed_demo(&engine, &ctx).await?;
            println!("seeded demo batches b1, b2 and a $200.00 advance for grower 7");
        }
        Command::Preview { batches, method } => {
            let plan = engine
                .preview_distribution(&batches, parse_method(&method)?)
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(());
            }
            for item in &plan.items {
                println!(
                    "grower {:>6}  gross {:>10.2}  netted {:>10.2}  net {:>10.2}  from [{}]",
                    item.grower_no,
                    from_amount(item.gross),
                    from_amount(item.advance_netted),
                    from_amount(item.net),
                    item.sources.join(",")
                );
            }
            println!(
                "total: gross {:.2} netted {:.2} net {:.2} across {} growers",
                from_amount(plan.total_gross()),
                from_amount(plan.total_netted()),
                from_amount(plan.total_net()),
                plan.items.len()
            );
        }
        Command::Build { batches, method } => {
            let summary = engine
                .build_distribution(&batches, parse_method(&method)?, &ctx)
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            for line in &summary.lines {
                println!(
                    "grower {:>6}  net {:>10.2}  instrument {}",
                    line.grower_no,
                    from_amount(line.net),
                    line.instrument_id
                );
            }
            println!(
                "committed: gross {:.2} netted {:.2} net {:.2}",
                from_amount(summary.total_gross),
                from_amount(summary.total_netted),
                from_amount(summary.total_net)
            );
        }
        Command::Advance {
            grower,
            amount,
            reason,
        } => {
            let inst = engine
                .issue_advance(grower, to_amount(amount), &reason, &ctx)
                .await?;
            println!(
                "advance issued to grower {grower}: {:.2}, instrument {}",
                from_amount(inst.amount),
                inst.id
            );
        }
        Command::Advances { grower } => {
            let advances = engine.outstanding_advances(grower).await?;
            if advances.is_empty() {
                println!("grower {grower}: no outstanding advances");
            }
            for adv in advances {
                println!(
                    "{}  issued {:>10.2}  remaining {:>10.2}  {}",
                    adv.id,
                    from_amount(adv.amount),
                    from_amount(adv.remaining()),
                    adv.reason
                );
            }
        }
        Command::Print { instrument } => {
            let inst = engine.print_instrument(&instrument, &ctx).await?;
            println!("printed {} for {:.2}", inst.id, from_amount(inst.amount));
        }
        Command::Reprint { instrument } => {
            let inst = engine.reprint_instrument(&instrument, &ctx).await?;
            println!("reprinted {} for {:.2}", inst.id, from_amount(inst.amount));
        }
        Command::Deliver { instrument, method } => {
            let inst = engine.deliver_instrument(&instrument, &method, &ctx).await?;
            println!("delivered {} via {method}", inst.id);
        }
        Command::Void {
            instruments,
            reason,
            reverse_deductions,
            restore_batch,
        } => {
            let requests: Vec<VoidRequest> = instruments
                .iter()
                .map(|id| VoidRequest {
                    instrument_id: id.clone(),
                    reason: reason.clone(),
                    reverse_deductions,
                    restore_batch_status: restore_batch,
                })
                .collect();
            let outcome = engine.void_many(&requests, &ctx).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                if outcome.failed > 0 {
                    std::process::exit(1);
                }
                return Ok(());
            }
            for r in &outcome.results {
                let tag = if r.success { "ok " } else { "ERR" };
                println!("{tag} {}: {}", r.instrument_id, r.message);
            }
            println!("{} voided, {} failed", outcome.succeeded, outcome.failed);
            if outcome.failed > 0 {
                std::process::exit(1);
            }
        }
        Command::Stop { instrument } => {
            let inst = engine.stop_payment(&instrument, &ctx).await?;
            println!("stop payment placed on {}", inst.id);
        }
        Command::Audit { instrument } => {
            let trail = engine.audit_trail(&instrument).await?;
            if trail.is_empty() {
                println!("no audit events for {instrument}");
            }
            for event in trail {
                println!(
                    "{}  {:<16}  {:<10}  {}",
                    event.ts,
                    event.event.as_str(),
                    event.actor,
                    event.detail
                );
            }
        }
    }

    Ok(())
}
