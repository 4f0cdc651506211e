//! icy-swap service entrypoint.
//!
//! Boot order: env + telemetry, config, Postgres (with migrations), chain
//! clients behind the endpoint pool, oracle, BTC sender, swap pipeline, the
//! background scheduler, and finally the axum server with graceful shutdown
//! on SIGTERM/SIGINT.

use alloy::primitives::{Address, U256};
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use icy_swap::chain::btc::wallet::{BtcSender, BtcWallet, PayoutSender};
use icy_swap::chain::btc::{BtcApi, EsploraPool};
use icy_swap::chain::evm::{EvmApi, EvmClient, EvmRpc};
use icy_swap::config::Config;
use icy_swap::endpoints::EndpointHealth;
use icy_swap::handlers::{self, AppState, EndpointHealthSource};
use icy_swap::indexer::{BtcTransactionIndexer, IcySwapIndexer, IcyTransferIndexer};
use icy_swap::jobs::{FnJob, JobError, JobSpec, JobStatusStore, Scheduler};
use icy_swap::oracle::price::PriceOracle;
use icy_swap::oracle::{AccountingClient, OracleService};
use icy_swap::store::Store;
use icy_swap::store::postgres::PgStore;
use icy_swap::swap::{SwapConfig, SwapService};
use icy_swap::telemetry::Telemetry;
use icy_swap::util::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::init();

    let config = Config::load()?;
    let network = config.network()?;
    let request_timeout = Duration::from_secs(config.request_timeout_secs);

    // Durable store; migrations run at boot, and the configured locked
    // treasury list is seeded into its table.
    let pg = PgStore::connect(config.database_url.as_str(), config.db_max_connections).await?;
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);
    for address in &config.icy_locked_treasury_addrs {
        store.upsert_locked_treasury(address).await?;
    }

    // Chain access, both sides behind the endpoint pool.
    let pool_config = config.pool_config();
    let btc_pool = Arc::new(EsploraPool::new(
        &config.blockstream_api_urls,
        pool_config.clone(),
    )?);
    let btc_api: Arc<dyn BtcApi> = btc_pool.clone();

    let icy_contract: Address = config.icy_contract_addr.parse()?;
    let swap_contract: Address = config.icy_swap_contract_addr.parse()?;
    let icy_treasury: Address = config.icy_treasury_addr.parse()?;
    let evm_client = Arc::new(
        EvmClient::connect(
            config.base_rpc_endpoint.as_str(),
            config.evm_signer_key.as_str(),
            icy_contract,
            swap_contract,
            config.evm_chain_id,
            Duration::from_secs(config.signature_ttl_secs),
        )
        .await?,
    );
    tracing::info!(signer = %evm_client.signer_address(), "evm client connected");
    let evm_rpc = Arc::new(EvmRpc::new(
        vec![(config.base_rpc_endpoint.to_string(), evm_client)],
        pool_config.clone(),
    ));
    let evm_api: Arc<dyn EvmApi> = evm_rpc.clone();

    // Pricing and the supply oracle.
    let price = Arc::new(PriceOracle::new(
        config.price_api_url.clone(),
        Duration::from_secs(config.price_cache_ttl_secs),
        request_timeout,
    )?);
    let accounting = match &config.accounting_api_url {
        Some(url) => Some(AccountingClient::new(url.clone(), request_timeout)?),
        None => None,
    };
    let oracle = Arc::new(OracleService::new(
        evm_api.clone(),
        btc_api.clone(),
        store.clone(),
        price.clone(),
        accounting,
        config.btc_treasury_address.clone(),
        Duration::from_secs(config.oracle_cache_ttl_secs),
        Duration::from_secs(config.oracle_fetch_timeout_secs),
    ));

    // Treasury wallet and payout sender.
    let wallet = BtcWallet::from_wif(config.wallet_wif.as_str(), network)?;
    let sender = Arc::new(BtcSender::new(
        wallet,
        btc_api.clone(),
        price.clone(),
        network,
        config.fee_target_blocks,
        config.max_tx_fee_usd,
    ));
    tracing::info!(wallet = %sender.wallet_address(), "btc treasury wallet loaded");
    let sender: Arc<dyn PayoutSender> = sender;

    // Indexers and the swap pipeline.
    let transfer_indexer = Arc::new(IcyTransferIndexer::new(
        store.clone(),
        evm_api.clone(),
        icy_treasury,
    ));
    let swap_indexer = Arc::new(IcySwapIndexer::new(store.clone(), evm_api.clone()));
    let btc_indexer = Arc::new(BtcTransactionIndexer::new(
        store.clone(),
        btc_api.clone(),
        config.btc_treasury_address.clone(),
    ));
    let swap_service = Arc::new(SwapService::new(
        store.clone(),
        oracle.clone(),
        sender,
        swap_indexer.clone(),
        SwapConfig {
            min_icy_swap: U256::from_str(&config.min_icy_swap_amount)?,
            slippage_tolerance: config.swap_slippage_tolerance,
            service_fee_rate: config.service_fee_rate,
            min_satoshi_fee: config.min_satoshi_fee,
            btc_network: network,
        },
    ));

    // Background jobs.
    let job_status = Arc::new(JobStatusStore::new());
    let mut scheduler = Scheduler::new(
        job_status.clone(),
        Duration::from_secs(config.stalled_threshold_secs),
        Duration::from_secs(24 * 3600),
    );
    let index_interval = Duration::from_secs(config.index_interval_secs);
    let job_timeout = Duration::from_secs(config.job_timeout_secs);

    let job_indexer = btc_indexer.clone();
    scheduler.register(JobSpec {
        name: "btc-transaction-indexer".to_string(),
        interval: index_interval,
        timeout: job_timeout,
        critical: true,
        uptime_webhook: config.uptime_webhook_btc_indexer_url.clone(),
        job: Arc::new(FnJob(move || {
            let indexer = job_indexer.clone();
            async move {
                indexer.run_once().await.map(|_| ()).map_err(JobError::from)
            }
        })),
    });
    let job_indexer = transfer_indexer.clone();
    scheduler.register(JobSpec {
        name: "icy-transfer-indexer".to_string(),
        interval: index_interval,
        timeout: job_timeout,
        critical: true,
        uptime_webhook: config.uptime_webhook_icy_indexer_url.clone(),
        job: Arc::new(FnJob(move || {
            let indexer = job_indexer.clone();
            async move {
                indexer.run_once().await.map(|_| ()).map_err(JobError::from)
            }
        })),
    });
    let job_indexer = swap_indexer.clone();
    scheduler.register(JobSpec {
        name: "icy-swap-indexer".to_string(),
        interval: index_interval,
        timeout: job_timeout,
        critical: true,
        uptime_webhook: None,
        job: Arc::new(FnJob(move || {
            let indexer = job_indexer.clone();
            async move {
                indexer.run_once().await.map(|_| ()).map_err(JobError::from)
            }
        })),
    });
    let job_swap = swap_service.clone();
    scheduler.register(JobSpec {
        name: "swap-processor".to_string(),
        interval: Duration::from_secs(config.swap_interval_secs),
        timeout: job_timeout,
        critical: true,
        uptime_webhook: config.uptime_webhook_swap_processor_url.clone(),
        job: Arc::new(FnJob(move || {
            let swap = job_swap.clone();
            async move {
                swap.process_pending()
                    .await
                    .map(|_| ())
                    .map_err(JobError::from)
            }
        })),
    });

    let shutdown = ShutdownSignal::try_new()?;
    let cancel = shutdown.token();
    let job_tracker = Arc::new(scheduler).spawn(cancel.clone());

    // HTTP surface.
    let health_btc = btc_pool.clone();
    let health_evm = evm_rpc.clone();
    let endpoint_health_sources: Vec<EndpointHealthSource> = vec![
        (
            "bitcoin_explorer",
            Arc::new(move || health_btc.endpoint_health())
                as Arc<dyn Fn() -> Vec<EndpointHealth> + Send + Sync>,
        ),
        (
            "evm_rpc",
            Arc::new(move || health_evm.endpoint_health())
                as Arc<dyn Fn() -> Vec<EndpointHealth> + Send + Sync>,
        ),
    ];
    let state = Arc::new(AppState {
        oracle: oracle.clone(),
        swap: swap_service,
        store: store.clone(),
        evm: evm_api.clone(),
        job_status: job_status.clone(),
        endpoint_health_sources,
        api_key: config
            .api_key
            .as_ref()
            .map(|key| key.as_str().to_string()),
        btc_network: network,
        min_icy_swap_amount: config.min_icy_swap_amount.clone(),
        service_fee_rate: config.service_fee_rate,
        info_timeout: Duration::from_secs(config.info_timeout_secs),
    });
    let router = handlers::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(environment = %config.environment, "listening on http://{addr}");

    let server_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await?;

    // Server is down; stop the jobs and let in-flight runs drain.
    cancel.cancel();
    job_tracker.wait().await;
    Ok(())
}
