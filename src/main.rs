use anyhow::Context;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

use claim_tracker::config::{Action, TrackerConfig};
use claim_tracker::handlers::{CompositeEventHandler, ConsoleEventHandler, TelegramEventHandler};
use claim_tracker::models::{Address, Amount, TrackedAccount, TxPhase};
use claim_tracker::notifications::NotificationQueue;
use claim_tracker::providers::{InMemoryLedger, JsonRpcLedgerClient};
use claim_tracker::telegram_notifier::TelegramNotifier;
use claim_tracker::traits::RemoteLedgerClient;
use claim_tracker::tracker::{ClaimTracker, TransactionTicket};
use claim_tracker::utils::helper::parse_units;

/// Seed a process-local ledger so the binary runs without a node
fn demo_ledger(config: &TrackerConfig) -> anyhow::Result<(Arc<InMemoryLedger>, Vec<TrackedAccount>)> {
  let ledger = InMemoryLedger::with_block_time(Duration::from_millis(500)).into_shared();

  let mut accounts = config.tracked.clone();
  if accounts.is_empty() {
    accounts = vec![
      TrackedAccount::new(Address::from([0x11; 20]), Some("Demo claimer".to_string())),
      TrackedAccount::new(Address::from([0x22; 20]), Some("Demo empty".to_string())),
      TrackedAccount::new(Address::from([0x33; 20]), Some("Demo accumulator".to_string())),
    ];
  }

  let allocation = parse_units("1250", claim_tracker::AMOUNT_DECIMALS)?;
  for (i, account) in accounts.iter().enumerate() {
    if i % 2 == 0 {
      ledger.set_claimable(account.address, allocation);
    }
    ledger.set_balance(account.address, Amount::ZERO);
  }

  let signer = config
    .connected_account
    .or_else(|| accounts.first().map(|a| a.address));
  ledger.connect(signer);

  Ok((ledger, accounts))
}

fn build_ledger(config: &TrackerConfig) -> anyhow::Result<(Arc<dyn RemoteLedgerClient>, Vec<TrackedAccount>)> {
  match &config.rpc_url {
    Some(rpc_url) => {
      let distributor = config
        .distributor
        .context("DISTRIBUTOR_ADDRESS is required with LEDGER_RPC_URL")?;
      let token = config
        .token
        .context("TOKEN_ADDRESS is required with LEDGER_RPC_URL")?;

      info!("RPC URL: {}", rpc_url);
      info!("Distributor: {}", distributor);
      info!("Token: {}", token);

      let client = JsonRpcLedgerClient::new(
        rpc_url.clone(),
        distributor,
        token,
        config.connected_account,
      );
      let ledger: Arc<dyn RemoteLedgerClient> = Arc::new(client);
      Ok((ledger, config.tracked.clone()))
    }
    None => {
      warn!("LEDGER_RPC_URL not set, running against an in-memory demo ledger");
      let (ledger, accounts) = demo_ledger(config)?;
      let ledger: Arc<dyn RemoteLedgerClient> = ledger;
      Ok((ledger, accounts))
    }
  }
}

async fn run_action(tracker: &ClaimTracker, action: Action) -> anyhow::Result<()> {
  let ticket: TransactionTicket = match action {
    Action::Watch => return Ok(()),
    Action::Claim => tracker.submit_claim()?,
    Action::Transfer => tracker.submit_transfer_to_target()?,
  };

  info!("Transaction {} started, waiting for confirmations...", ticket.id());
  let status = ticket.wait().await;
  match status.phase {
    TxPhase::Confirmed => info!("Transaction {} confirmed", status.id),
    _ => warn!(
      "Transaction {} ended as {:?}: {}",
      status.id,
      status.phase,
      status
        .error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no error reported".to_string())
    ),
  }
  Ok(())
}

fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let level = std::env::var("LOG_LEVEL")
    .ok()
    .and_then(|s| LevelFilter::from_str(&s).ok())
    .unwrap_or(LevelFilter::INFO);

  // Initialize logging
  tracing_subscriber::fmt()
    .with_level(true)
    .with_target(false)
    .with_max_level(level)
    .with_file(true)
    .with_line_number(true)
    .init();

  tokio::runtime::Runtime::new()?.block_on(async {
    let config = TrackerConfig::from_env().context("failed to load configuration")?;

    info!("Initializing claim tracker v{}...", claim_tracker::VERSION);

    let (ledger, mut accounts) = build_ledger(&config)?;

    // The connected account has to be tracked for claim/transfer checks
    if let Some(signer) = ledger.signer() {
      info!("Connected account: {}", signer);
      if !accounts.iter().any(|a| a.address == signer) {
        accounts.push(TrackedAccount::new(signer, Some("Connected".to_string())));
      }
    }

    let mut composite = CompositeEventHandler::new();
    composite.add_handler(Arc::new(ConsoleEventHandler::new(config.token_symbol.clone())));

    let notifier = TelegramNotifier::new(config.telegram_token.clone(), config.telegram_chat_id.clone());
    if notifier.is_enabled() {
      info!("Telegram notifications enabled");
      composite.add_handler(Arc::new(TelegramEventHandler::new(notifier, config.token_symbol.clone())));
    } else {
      warn!("Telegram notifications disabled. Set TG_TOKEN and CHAT_ID in .env file to enable.");
    }
    let notifications = NotificationQueue::new(Arc::new(composite));

    let tracker = ClaimTracker::new(ledger, &config, Some(notifications.clone()));
    tracker.track(accounts);

    // Demo runs accumulate into the last tracked account
    if config.rpc_url.is_none() && tracker.target().is_none() {
      let signer = tracker.coordinator().connected_account();
      if let Some(last) = tracker.accounts().iter().rev().find(|a| Some(a.address) != signer) {
        tracker.select_target(last.address);
      }
    }

    tracker.refresh().await;
    tracker.log_summary();

    if let Err(e) = run_action(&tracker, config.action).await {
      error!("{} failed: {:#}", format!("{:?}", config.action).to_lowercase(), e);
    }

    let tracker_for_task = tracker.clone();
    let tick_interval = config.tick_interval;
    tokio::spawn(async move {
      tracker_for_task.start_polling(tick_interval).await;
    });

    info!("Claim tracker is running. Press Ctrl+C to stop.");

    // Keep the program running
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    notifications.shutdown();

    Ok(())
  })
}
