use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::sync::watch;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use lattice_node::api::{self, AppState};
use lattice_node::config::{Args, NodeConfig};
use lattice_node::ledger::{Ledger, LedgerProcessor, SledStore, WorkPool};
use lattice_node::network::{PeerTable, UdpTransport};

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_all_accounts,
        api::handlers::get_account,
        api::handlers::get_pending,
        api::handlers::get_block,
        api::handlers::publish_block,
        api::handlers::send_funds,
        api::handlers::receive_funds,
        api::handlers::get_peers,
        api::handlers::create_keys,
        api::handlers::get_key_address
    ),
    components(
        schemas(
            api::schema::DateTimeUtc,
            api::schema::AccountResponse,
            api::schema::PendingResponse,
            api::schema::BlockResponse,
            api::schema::PublishResponse,
            api::schema::PeerResponse,
            api::handlers::PublishRequest,
            api::handlers::SendRequest,
            api::handlers::ReceiveRequest,
            api::handlers::KeyResponse,
            api::handlers::AddressResponse
        )
    ),
    tags(
        (name = "ledger", description = "Block-lattice ledger API endpoints")
    ),
    info(
        title = "Lattice Node API",
        version = "0.1.0",
        description = "Accounts, blocks and peers of a block-lattice ledger node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_args(Args::parse())?;
    info!("Starting {} node", config.network);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let store = Arc::new(SledStore::open(&config.data_dir)?);
    info!("Opened ledger at {}", config.data_dir.display());

    let ledger = Ledger::new(store, config.network, config.max_orphans)?;
    let reader = ledger.reader();
    let (sender, writer) = LedgerProcessor::spawn(ledger, config.channel_capacity)?;

    let peers = PeerTable::new(Some(config.local_endpoint()));
    for peer in &config.peers {
        peers.insert(*peer);
    }
    let transport = Arc::new(UdpTransport::bind(config.udp_bind, peers, sender.clone()).await?);

    let (stop, shutdown) = watch::channel(false);
    let receiver = tokio::spawn(transport.clone().run(shutdown.clone()));
    let keepalive = tokio::spawn(
        transport
            .clone()
            .run_keepalive(config.keepalive_interval, shutdown),
    );

    let work_pool = WorkPool::new(config.network.work_threshold());
    let state = web::Data::new(AppState {
        network: config.network,
        reader,
        ledger: sender.clone(),
        transport,
        work_pool: work_pool.clone(),
    });

    info!("Starting HTTP server at http://{}", config.http_bind);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind(config.http_bind)?
    .run()
    .await?;

    info!("Shutting down");
    if stop.send(true).is_err() {
        warn!("Network tasks already stopped");
    }
    work_pool.cancel_all();
    sender.shutdown().await;

    for task in [receiver, keepalive] {
        if let Err(err) = task.await {
            warn!("Network task failed: {}", err);
        }
    }

    tokio::task::spawn_blocking(move || writer.join())
        .await?
        .map_err(|_| anyhow::anyhow!("ledger writer panicked"))?;
    info!("Node stopped");

    Ok(())
}
