use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/accounts", web::get().to(handlers::get_all_accounts))
            .route("/accounts/send", web::post().to(handlers::send_funds))
            .route("/accounts/receive", web::post().to(handlers::receive_funds))
            .route("/accounts/{address}", web::get().to(handlers::get_account))
            .route("/accounts/{address}/pending", web::get().to(handlers::get_pending))
            .route("/blocks", web::post().to(handlers::publish_block))
            .route("/blocks/{hash}", web::get().to(handlers::get_block))
            .route("/peers", web::get().to(handlers::get_peers))
            .route("/keys/new", web::post().to(handlers::create_keys))
            .route("/keys/{public_key_hex}/address", web::get().to(handlers::get_key_address))
    );
}
