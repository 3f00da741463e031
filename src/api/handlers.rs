use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::schema::{AccountResponse, BlockResponse, PeerResponse, PendingResponse, PublishResponse};
use crate::ledger::{
    Account, AccountError, AddOutcome, Amount, Block, BlockHash, ErrorCategory, KeyPair,
    LedgerReader, LedgerSender, NetworkKind, PublicKey, WorkPool,
};
use crate::network::UdpTransport;

/// Everything the handlers share
pub struct AppState {
    pub network: NetworkKind,
    pub reader: LedgerReader,
    pub ledger: LedgerSender,
    pub transport: Arc<UdpTransport>,
    pub work_pool: WorkPool,
}

/// Data structure for the node state
pub type NodeData = web::Data<AppState>;

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({
        "error": message.to_string()
    }))
}

fn category_status(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::MalformedInput => StatusCode::BAD_REQUEST,
        ErrorCategory::InvalidProof => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::StateConflict => StatusCode::CONFLICT,
        ErrorCategory::ResourceExhaustion => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn account_error(err: AccountError) -> HttpResponse {
    let status = match &err {
        AccountError::Ledger(inner) => category_status(inner.category()),
        AccountError::SourceNotFound(_) => StatusCode::NOT_FOUND,
        AccountError::NoWork | AccountError::StaleWork => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::CONFLICT,
    };
    error_response(status, err)
}

fn parse_address(address: &str) -> Result<PublicKey, HttpResponse> {
    PublicKey::from_address(address)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, format!("Invalid address: {}", err)))
}

fn parse_private_key(private_key: &str) -> Result<KeyPair, HttpResponse> {
    let bytes = hex::decode(private_key).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "Invalid private key format. Must be a hex string.",
        )
    })?;

    KeyPair::from_private_key(&bytes)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, format!("Invalid private key: {}", err)))
}

/// Hands a block to the ledger writer and floods it to peers once linked
async fn submit_block(state: &AppState, block: Block) -> HttpResponse {
    let hash = block.hash();

    match state.ledger.submit(block.clone()).await {
        Ok(outcome) => {
            let status = match outcome {
                AddOutcome::Accepted { .. } => {
                    let sent = state.transport.publish(&block).await;
                    debug!("Published block {} to {} peer(s)", hash, sent);
                    StatusCode::CREATED
                }
                AddOutcome::AlreadyPresent { .. } => StatusCode::OK,
                AddOutcome::ParentMissing { .. } => StatusCode::ACCEPTED,
            };
            HttpResponse::build(status).json(PublishResponse::from(outcome))
        }
        Err(err) => {
            warn!("Block {} refused: {}", hash, err);
            error_response(category_status(err.category()), err)
        }
    }
}

/// Get all accounts
///
/// Returns every opened account chain
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = Vec<AccountResponse>),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_all_accounts(state: NodeData) -> impl Responder {
    match state.reader.accounts() {
        Ok(accounts) => {
            let response: Vec<AccountResponse> =
                accounts.into_iter().map(AccountResponse::from).collect();
            HttpResponse::Ok().json(response)
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

/// Get an account
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{address}",
    params(("address" = String, Path, description = "Account address")),
    responses(
        (status = 200, description = "Account retrieved successfully", body = AccountResponse),
        (status = 400, description = "Invalid address"),
        (status = 404, description = "Account not opened")
    )
)]
pub async fn get_account(state: NodeData, address: web::Path<String>) -> impl Responder {
    let account = match parse_address(&address) {
        Ok(account) => account,
        Err(response) => return response,
    };

    match state.reader.account(&account) {
        Ok(Some(info)) => HttpResponse::Ok().json(AccountResponse::from(info)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Account not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

/// Get pending sends for an account
///
/// Lists sends addressed to the account that it has not yet received
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{address}/pending",
    params(("address" = String, Path, description = "Account address")),
    responses(
        (status = 200, description = "Pending sends retrieved successfully", body = Vec<PendingResponse>),
        (status = 400, description = "Invalid address")
    )
)]
pub async fn get_pending(state: NodeData, address: web::Path<String>) -> impl Responder {
    let account = match parse_address(&address) {
        Ok(account) => account,
        Err(response) => return response,
    };

    match state.reader.pending(&account) {
        Ok(pending) => {
            let response: Vec<PendingResponse> =
                pending.into_iter().map(PendingResponse::from).collect();
            HttpResponse::Ok().json(response)
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

/// Get a block
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{hash}",
    params(("hash" = String, Path, description = "Block hash, 64 hex digits")),
    responses(
        (status = 200, description = "Block retrieved successfully", body = BlockResponse),
        (status = 400, description = "Invalid hash"),
        (status = 404, description = "Block not found")
    )
)]
pub async fn get_block(state: NodeData, hash: web::Path<String>) -> impl Responder {
    let hash = match BlockHash::from_hex(&hash) {
        Ok(hash) => hash,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid hash: {}", err)),
    };

    match state.reader.block(&hash) {
        Ok(Some(stored)) => HttpResponse::Ok().json(BlockResponse::from(stored)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Block not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

/// Request for the publish endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct PublishRequest {
    /// A signed block with work, tagged by `type`
    #[schema(value_type = Object)]
    pub block: Block,
}

/// Publish a block
///
/// Offers a signed block to the ledger and floods it to peers once linked
#[utoipa::path(
    post,
    path = "/api/v1/blocks",
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Block linked", body = PublishResponse),
        (status = 200, description = "Block already known", body = PublishResponse),
        (status = 202, description = "Block waiting for its parent", body = PublishResponse),
        (status = 400, description = "Malformed block"),
        (status = 409, description = "Block conflicts with the ledger"),
        (status = 422, description = "Invalid signature or work"),
        (status = 503, description = "Ledger unavailable")
    )
)]
pub async fn publish_block(state: NodeData, request: web::Json<PublishRequest>) -> impl Responder {
    submit_block(&state, request.into_inner().block).await
}

/// Request for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendRequest {
    /// The sender's private key (hex encoded, for signing)
    pub private_key: String,

    /// The recipient's address
    pub destination: String,

    /// Amount in raw units, as a decimal string
    pub amount: String,
}

/// Send funds
///
/// Builds, signs and publishes a send block for the key's account
#[utoipa::path(
    post,
    path = "/api/v1/accounts/send",
    request_body = SendRequest,
    responses(
        (status = 201, description = "Send linked", body = PublishResponse),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Insufficient funds or account not open")
    )
)]
pub async fn send_funds(state: NodeData, request: web::Json<SendRequest>) -> impl Responder {
    let keys = match parse_private_key(&request.private_key) {
        Ok(keys) => keys,
        Err(response) => return response,
    };
    let destination = match parse_address(&request.destination) {
        Ok(destination) => destination,
        Err(response) => return response,
    };
    let amount: Amount = match request.amount.parse() {
        Ok(amount) => amount,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };

    let mut account = match load_account(&state, keys) {
        Ok(account) => account,
        Err(response) => return response,
    };
    if let Err(err) = account.check_send(amount) {
        return account_error(err);
    }
    if let Err(response) = prepare_work(&state, &mut account).await {
        return response;
    }

    match account.send(destination, amount) {
        Ok(block) => submit_block(&state, block).await,
        Err(err) => account_error(err),
    }
}

/// Request for the receive endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ReceiveRequest {
    /// The receiver's private key (hex encoded, for signing)
    pub private_key: String,

    /// Hash of the pending send
    pub source: String,

    /// Representative to name when this opens the account; defaults to the account itself
    pub representative: Option<String>,
}

/// Receive funds
///
/// Receives a pending send, opening the account if this is its first block
#[utoipa::path(
    post,
    path = "/api/v1/accounts/receive",
    request_body = ReceiveRequest,
    responses(
        (status = 201, description = "Receive linked", body = PublishResponse),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Source not found"),
        (status = 409, description = "Send not receivable by this account")
    )
)]
pub async fn receive_funds(state: NodeData, request: web::Json<ReceiveRequest>) -> impl Responder {
    let keys = match parse_private_key(&request.private_key) {
        Ok(keys) => keys,
        Err(response) => return response,
    };
    let source = match BlockHash::from_hex(&request.source) {
        Ok(source) => source,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid source: {}", err)),
    };
    let representative = match &request.representative {
        Some(address) => match parse_address(address) {
            Ok(representative) => representative,
            Err(response) => return response,
        },
        None => keys.public_key(),
    };

    let mut account = match load_account(&state, keys) {
        Ok(account) => account,
        Err(response) => return response,
    };
    if let Err(response) = prepare_work(&state, &mut account).await {
        return response;
    }

    let built = if account.is_open() {
        account.receive(&state.reader, source)
    } else {
        account.open(&state.reader, source, representative)
    };

    match built {
        Ok(block) => submit_block(&state, block).await,
        Err(err) => account_error(err),
    }
}

fn load_account(state: &AppState, keys: KeyPair) -> Result<Account, HttpResponse> {
    Account::load(keys, &state.reader, state.network.work_threshold()).map_err(account_error)
}

/// Generates work for the account's next block
async fn prepare_work(state: &AppState, account: &mut Account) -> Result<(), HttpResponse> {
    match account.prepare_work(&state.work_pool).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Work generation was cancelled",
        )),
        Err(err) => Err(account_error(err)),
    }
}

/// Get known peers
#[utoipa::path(
    get,
    path = "/api/v1/peers",
    responses(
        (status = 200, description = "Peers retrieved successfully", body = Vec<PeerResponse>)
    )
)]
pub async fn get_peers(state: NodeData) -> impl Responder {
    let peers: Vec<PeerResponse> = state
        .transport
        .peers()
        .list()
        .into_iter()
        .map(PeerResponse::from)
        .collect();
    HttpResponse::Ok().json(peers)
}

/// Response for the new keys endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct KeyResponse {
    /// The public key (hex encoded)
    pub public_key: String,

    /// The account address
    pub address: String,

    /// The private key (hex encoded)
    pub private_key: String,
}

/// Create a new key pair
///
/// Creates a random key pair
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/keys/new",
    responses(
        (status = 201, description = "Key pair created successfully", body = KeyResponse)
    )
)]
pub async fn create_keys() -> impl Responder {
    let keys = KeyPair::generate();

    HttpResponse::Created().json(KeyResponse {
        public_key: keys.public_key().to_hex(),
        address: keys.address(),
        private_key: hex::encode(keys.export_private_key()),
    })
}

/// Response for the address endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct AddressResponse {
    pub public_key: String,
    pub address: String,
}

/// Get the address of a public key
#[utoipa::path(
    get,
    path = "/api/v1/keys/{public_key_hex}/address",
    params(("public_key_hex" = String, Path, description = "Public key, 64 hex digits")),
    responses(
        (status = 200, description = "Address derived successfully", body = AddressResponse),
        (status = 400, description = "Invalid public key")
    )
)]
pub async fn get_key_address(public_key_hex: web::Path<String>) -> impl Responder {
    match PublicKey::from_hex(&public_key_hex) {
        Ok(key) => HttpResponse::Ok().json(AddressResponse {
            public_key: key.to_hex(),
            address: key.address(),
        }),
        Err(err) => error_response(StatusCode::BAD_REQUEST, format!("Invalid public key: {}", err)),
    }
}
