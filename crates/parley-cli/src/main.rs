mod settings;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Context, Result, eyre};
use owo_colors::OwoColorize;
use tokio::sync::{mpsc, watch};

use parley_ipc::{BridgeConnector, BridgeProcess};
use parley_worker::{
    CampaignRequest, ConnectOutcome, CreditGrant, CredentialStore, DeliveryWorker,
    DispatchQueue, ParleyDb, ParleyService, SendRequest, SessionManager, WorkerEvent,
};

use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-tenant WhatsApp dispatch core")]
struct Args {
    /// Path to a TOML settings file
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Bridge directory (the one holding package.json)
    #[arg(long, env = "PARLEY_BRIDGE_DIR")]
    bridge_dir: Option<PathBuf>,

    /// Skip the menu and run until Ctrl-C
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .from_env_lossy()
                .add_directive("parley=info".parse()?)
                .add_directive("parley_worker=info".parse()?)
                .add_directive("parley_ipc=info".parse()?)
                .add_directive("parley_db=info".parse()?),
        )
        .init();

    let settings = Settings::load(args.config.as_deref())?;

    let bridge_dir = match args.bridge_dir.or_else(|| settings.bridge_dir.clone()) {
        Some(dir) => dir,
        None => find_bridge_dir()?,
    };
    println!("📁 Bridge directory: {}", bridge_dir.display());

    let db = Arc::new(
        ParleyDb::new_with_path(&settings.database_path()?)
            .await
            .wrap_err("Failed to open database")?,
    );

    let bridge = Arc::new(BridgeProcess::new(bridge_dir));
    bridge.start().await.wrap_err("Failed to start bridge")?;

    let (event_tx, mut event_rx) = mpsc::channel(1000);
    let sessions = SessionManager::new(
        Arc::clone(&db),
        Arc::new(BridgeConnector::new(Arc::clone(&bridge))),
        CredentialStore::new(settings.auth_dir()?),
        settings.session.clone(),
    )
    .with_events(event_tx.clone());

    let service = ParleyService::new(Arc::clone(&db), sessions.clone(), settings.delivery.clone());
    let worker = DeliveryWorker::new(
        DispatchQueue::new(Arc::clone(&db), settings.delivery.clone()),
        sessions.registry(),
        settings.delivery.clone(),
    )
    .with_events(event_tx);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_event(event);
        }
    });

    if let Err(e) = sessions.restore_sessions().await {
        tracing::error!("Failed to restore sessions: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let delivery = tokio::spawn(async move { worker.run(shutdown_rx).await });

    if args.headless {
        println!("{}", "Running headless, Ctrl-C to stop".dimmed());
        tokio::signal::ctrl_c().await?;
    } else {
        run_menu(&service).await?;
    }

    println!("👋 Shutting down...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = delivery.await {
        tracing::error!("Delivery worker panicked: {}", e);
    }
    sessions.shutdown().await;
    bridge.stop().await?;
    db.close().await;

    Ok(())
}

async fn run_menu(service: &ParleyService) -> Result<()> {
    loop {
        print_menu();
        let choice = read_line("Choice: ")?;

        let result = match choice.as_str() {
            "1" => create_tenant(service).await,
            "2" => list_tenants(service).await,
            "3" => grant_credits(service).await,
            "4" => connect(service).await,
            "5" => show_status(service).await,
            "6" => disconnect(service).await,
            "7" => send_message(service).await,
            "8" => create_campaign(service).await,
            "9" => campaign_history(service).await,
            "10" => message_history(service).await,
            "11" => issue_api_key(service).await,
            "0" => return Ok(()),
            _ => {
                println!("{}", "❌ Invalid choice".red());
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("{} {}", "❌".red(), e);
        }
    }
}

fn print_menu() {
    println!();
    println!("╔════════════════════════════════════╗");
    println!("║      PARLEY - WhatsApp dispatch    ║");
    println!("╠════════════════════════════════════╣");
    println!("║  1. Create Tenant                  ║");
    println!("║  2. List Tenants                   ║");
    println!("║  3. Grant Credits                  ║");
    println!("║  4. Connect (QR)                   ║");
    println!("║  5. Session Status                 ║");
    println!("║  6. Disconnect                     ║");
    println!("║  7. Send Message                   ║");
    println!("║  8. Create Campaign                ║");
    println!("║  9. Campaign History               ║");
    println!("║ 10. Message History                ║");
    println!("║ 11. Issue API Key                  ║");
    println!("║  0. Exit                           ║");
    println!("╚════════════════════════════════════╝");
}

fn handle_event(event: WorkerEvent) {
    match event {
        WorkerEvent::QrCode { tenant_id, qr } => {
            println!("\n📱 QR code for {}:", tenant_id.bold());
            print_qr_code(&qr);
        }
        WorkerEvent::Connected {
            tenant_id,
            phone_number,
        } => {
            println!(
                "\n{} {} (phone: {})",
                "✅ Connected:".green(),
                tenant_id,
                phone_number.unwrap_or_default()
            );
        }
        WorkerEvent::Disconnected { tenant_id, reason } => {
            println!("\n{} {} - {}", "❌ Disconnected:".red(), tenant_id, reason);
        }
        WorkerEvent::LoggedOut { tenant_id } => {
            println!("\n🚪 Logged out: {}", tenant_id);
        }
        WorkerEvent::ReconnectScheduled {
            tenant_id,
            attempt,
            delay_ms,
        } => {
            println!(
                "\n{}",
                format!("🔄 Reconnecting {tenant_id} in {delay_ms} ms (attempt {attempt})").yellow()
            );
        }
        WorkerEvent::SessionFailed { tenant_id, error } => {
            println!("\n{} {}: {}", "❌ Session failed:".red(), tenant_id, error);
        }
        WorkerEvent::MessageSent {
            tenant_id,
            job_id,
            recipient,
        } => {
            println!("\n📤 [{}] job {} sent to {}", tenant_id, job_id, recipient);
        }
        WorkerEvent::MessageFailed {
            tenant_id,
            job_id,
            error,
            will_retry,
        } => {
            let retry = if will_retry { " (will retry)" } else { "" };
            println!(
                "\n{} [{}] job {}: {}{}",
                "⚠️ Send failed".yellow(),
                tenant_id,
                job_id,
                error,
                retry
            );
        }
    }
}

fn print_qr_code(qr: &str) {
    if let Err(e) = qr2term::print_qr(qr) {
        eprintln!("Failed to print QR code: {}", e);
        println!("Raw QR data: {}", qr);
    }
}

async fn create_tenant(service: &ParleyService) -> Result<()> {
    let id = read_line("Tenant ID: ")?;
    let name = read_line("Business name: ")?;
    let tenant = service.create_tenant(&id, &name).await?;
    println!("✅ Created tenant: {} ({})", tenant.id, tenant.name);
    Ok(())
}

async fn list_tenants(service: &ParleyService) -> Result<()> {
    let tenants = service.list_tenants().await?;
    if tenants.is_empty() {
        println!("📭 No tenants found");
        return Ok(());
    }

    println!("\n📋 Tenants:");
    for tenant in tenants {
        println!(
            "  {} - {} | {} credits | session {} | {}",
            tenant.id.bold(),
            tenant.name,
            tenant.credits,
            tenant.session_status,
            tenant.account_status.dimmed()
        );
    }
    Ok(())
}

async fn grant_credits(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    let payment_id = read_line("Payment ID: ")?;
    let plan_id = read_line("Plan ID: ")?;
    let credits: i64 = read_line("Credits: ")?.parse().wrap_err("Credits must be a number")?;
    let validity_days: i64 = read_line("Validity (days): ")?
        .parse()
        .wrap_err("Validity must be a number")?;

    let applied = service
        .grant_credits(&CreditGrant {
            tenant_id,
            payment_id,
            plan_id,
            credits,
            validity_days,
        })
        .await?;

    if applied {
        println!("✅ Credits granted");
    } else {
        println!("{}", "Payment already processed, nothing changed".yellow());
    }
    Ok(())
}

async fn connect(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    println!("🔄 Connecting {}...", tenant_id);

    match service.connect(&tenant_id).await? {
        ConnectOutcome::QrCode(_) => println!("📱 Scan the QR code with WhatsApp"),
        ConnectOutcome::Connected => println!("{}", "✅ Already paired, connected".green()),
    }
    Ok(())
}

async fn show_status(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    let status = service.status(&tenant_id).await?;
    println!("📶 {}: {}", tenant_id, status.bold());
    Ok(())
}

async fn disconnect(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    service.disconnect(&tenant_id).await?;
    println!("🚪 Disconnected {}", tenant_id);
    Ok(())
}

async fn send_message(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    let recipient = read_line("To (phone number): ")?;
    let text = read_line("Message: ")?;
    let media_url = optional(read_line("Media URL (optional): ")?);

    let job_id = service
        .enqueue_send(SendRequest {
            tenant_id,
            recipient,
            text,
            media_url,
            file_path: None,
        })
        .await?;
    println!("📨 Queued as job {}", job_id);
    Ok(())
}

async fn create_campaign(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    let name = read_line("Campaign name: ")?;
    let recipients = read_line("Recipients (comma separated): ")?
        .split(',')
        .map(str::to_string)
        .collect();
    let text = read_line("Message: ")?;
    let media_url = optional(read_line("Media URL (optional): ")?);
    let delay_ms = match optional(read_line("Start in minutes (empty for now): ")?) {
        Some(minutes) => Some(
            minutes
                .parse::<i64>()
                .wrap_err("Minutes must be a number")?
                * 60_000,
        ),
        None => None,
    };

    let campaign = service
        .enqueue_campaign(CampaignRequest {
            tenant_id,
            name,
            recipients,
            text,
            media_url,
            file_path: None,
            scheduled_at: None,
            delay_ms,
        })
        .await?;

    println!(
        "📣 Campaign {} queued: {} messages, status {}",
        campaign.id, campaign.total_messages, campaign.status
    );
    Ok(())
}

async fn campaign_history(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    let campaigns = service.campaign_history(&tenant_id).await?;
    if campaigns.is_empty() {
        println!("📭 No campaigns found");
        return Ok(());
    }

    println!("\n📣 Campaigns ({}):", campaigns.len());
    for campaign in campaigns {
        println!(
            "  {} {} [{}] {}/{} sent, {} failed",
            format_millis(campaign.created_at).dimmed(),
            campaign.name.bold(),
            campaign.status,
            campaign.sent_count,
            campaign.total_messages,
            campaign.failed_count
        );
    }
    Ok(())
}

async fn message_history(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    let messages = service.message_history(&tenant_id).await?;
    if messages.is_empty() {
        println!("📭 No messages found");
        return Ok(());
    }

    println!("\n💬 Messages ({}):", messages.len());
    for message in messages {
        let detail = message.error_message.as_deref().unwrap_or(&message.content);
        println!(
            "  {} → {} [{}] {}",
            format_millis(message.created_at).dimmed(),
            message.recipient,
            message.status,
            detail
        );
    }
    Ok(())
}

async fn issue_api_key(service: &ParleyService) -> Result<()> {
    let tenant_id = read_line("Tenant ID: ")?;
    let key = service.issue_api_key(&tenant_id).await?;
    println!("🔑 API key: {}", key.bold());
    Ok(())
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn find_bridge_dir() -> Result<PathBuf> {
    let exe_path = std::env::current_exe()?;

    let mut current = exe_path.parent();
    while let Some(dir) = current {
        let bridge = dir.join("bridge");
        if bridge.join("package.json").exists() {
            return Ok(bridge);
        }
        current = dir.parent();
    }

    let bridge = std::env::current_dir()?.join("bridge");
    if bridge.join("package.json").exists() {
        return Ok(bridge);
    }

    Err(eyre!(
        "Could not find the bridge directory. Pass --bridge-dir or set bridge_dir in the settings file."
    ))
}
