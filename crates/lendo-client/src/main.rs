mod commands;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lendo_client::{AppConfig, LendingClient};
use lendo_core::{format_address, LendoError, LoanStatus, Notification, OperationKind, Severity};

use crate::commands::{Command, HELP};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, stdout is the interactive console
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lendo=info,lendo_client=info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .init();

    println!("================================================");
    println!("        LENDO - DeFi Lending & Borrowing        ");
    println!("================================================");

    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    match &config.wallet.rpc_url {
        Some(url) => println!("[CONFIG] Wallet RPC: {}", url),
        None => println!("[CONFIG] Wallet RPC: *** NOT SET - PLEASE SET LENDO__WALLET__RPC_URL ***"),
    }
    println!("[CONFIG] Lending contract: {}", config.ledger.contract_address);
    println!("[CONFIG] Auto-connect: {}", config.session.auto_connect);

    tracing::info!(
        contract = %config.ledger.contract_address,
        "Starting Lendo"
    );

    let client = LendingClient::from_config(&config)?;
    client.start().await;

    println!("Type 'help' for the list of commands.");
    print_status(&client);

    let mut notifications = client.watch_notifications();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = notifications.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = notifications.borrow_and_update().clone();
                if let Some(notification) = current {
                    print_notification(&notification);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => handle(&client, command).await,
                    Err(e) => println!("{}", e),
                }
            }
        }
    }

    client.shutdown().await;
    println!("Goodbye.");
    Ok(())
}

async fn handle(client: &LendingClient, command: Command) {
    match command {
        Command::Connect => {
            if let Ok(connection) = client.connect().await {
                println!(
                    "Connected: {} on chain {}",
                    format_address(&connection.identity),
                    connection.network_id
                );
            }
        }
        Command::Disconnect => {
            client.disconnect();
            println!("Disconnected.");
        }
        Command::Status => print_status(client),
        Command::Refresh => {
            if client.refresh().await.is_ok() {
                print_status(client);
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Submit { kind, input } => {
            client.set_draft(kind, input);
            let client = client.clone();
            // Operations run in the background; outcomes arrive as notifications
            tokio::spawn(async move {
                if let Err(LendoError::DuplicateOperation(kind)) = client.submit_draft(kind).await {
                    println!("A {} is already in progress.", kind);
                }
            });
        }
        Command::Quit => {}
    }
}

fn print_notification(notification: &Notification) {
    let tag = match notification.severity {
        Severity::Info => "INFO",
        Severity::Success => " OK ",
        Severity::Error => "FAIL",
    };
    println!("[{}] {}", tag, notification.message);
}

fn print_status(client: &LendingClient) {
    let session = client.session();
    println!("------------------------------------------------");
    match (session.identity, session.network_id) {
        (Some(identity), Some(chain_id)) if session.is_connected() => {
            println!("Account:        {}", format_address(&identity));
            println!("Network:        Chain ID: {}", chain_id);
        }
        _ => println!("Wallet:         {}", session.connection_state),
    }

    match client.snapshot() {
        Some(snapshot) => {
            println!("Pool balance:   {} ETH", snapshot.pool_balance);
            println!("Your deposits:  {} ETH", snapshot.lender_balance);
            println!("Interest rate:  {}%", snapshot.interest_rate_percent());
            let status = snapshot.loan_status();
            println!("Loan status:    {}", status);
            if let (Some(loan), true) = (&snapshot.loan, status != LoanStatus::NoLoan) {
                println!("  Collateral:   {} ETH", loan.collateral_amount);
                println!("  Borrowed:     {} ETH", loan.loan_amount);
            }
        }
        None if session.is_connected() => println!("Ledger:         loading..."),
        None => {}
    }

    for kind in OperationKind::ALL {
        if let Some(ticket) = client.ticket(kind) {
            let error = ticket
                .error
                .as_ref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default();
            println!("Last {:<20} {}{}", format!("{}:", kind), ticket.state, error);
        }
    }
    println!("------------------------------------------------");
}
