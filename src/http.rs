//! HTTP observability and entry surface.
//!
//! - `GET  /health`          liveness check
//! - `GET  /status`          raffle snapshot
//! - `GET  /vault`           where stakes are deposited, and whether a deposit is required
//! - `GET  /players/{index}` participant by ticket index
//! - `GET  /metrics`         counters
//! - `POST /enter`           record a stake
//! - `POST /admin/recover`   abandon a stalled randomness request (needs `x-admin-token`)
//!
//! With on-chain payouts, `POST /enter` takes a `deposit_signature` instead of
//! trusting `amount`: the stake is what that transfer moved into the vault.

use std::str::FromStr;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;

use crate::deposit::{DepositError, DepositVerifier};
use crate::error::RaffleError;
use crate::oracle::RandomnessOracle;
use crate::payout::{Payout, VaultRpc};
use crate::service::RaffleService;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Shared state accessible from HTTP handlers.
pub struct AppState<O, P, R = Arc<RpcClient>> {
    pub service: Arc<RaffleService<O, P>>,
    /// Admin endpoints answer 403 when unset.
    pub admin_token: Option<String>,
    /// Set when winners are paid on-chain: every entry must then be backed
    /// by a deposit into the vault.
    pub deposits: Option<DepositVerifier<R>>,
}

#[derive(Debug, Deserialize)]
pub struct EnterRequest {
    /// Base58 player address.
    pub player: String,
    /// Stake in lamports. Required without deposits; with deposits, it must
    /// match the deposited amount when given.
    #[serde(default)]
    pub amount: Option<u64>,
    /// Base58 signature of the player's transfer into the vault.
    #[serde(default)]
    pub deposit_signature: Option<String>,
}

/// Register every route on an actix `App`.
pub fn routes<O, P, R>(cfg: &mut web::ServiceConfig)
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
    R: VaultRpc + 'static,
{
    cfg.route("/health", web::get().to(health))
        .route("/status", web::get().to(status::<O, P, R>))
        .route("/vault", web::get().to(vault::<O, P, R>))
        .route("/players/{index}", web::get().to(player::<O, P, R>))
        .route("/metrics", web::get().to(metrics::<O, P, R>))
        .route("/enter", web::post().to(enter::<O, P, R>))
        .route("/admin/recover", web::post().to(recover::<O, P, R>));
}

/// Liveness check: returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

async fn status<O, P, R>(data: web::Data<AppState<O, P, R>>) -> HttpResponse
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
    R: VaultRpc + 'static,
{
    HttpResponse::Ok().json(data.service.snapshot().await)
}

async fn vault<O, P, R>(data: web::Data<AppState<O, P, R>>) -> HttpResponse
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
    R: VaultRpc + 'static,
{
    HttpResponse::Ok().json(serde_json::json!({
        "vault": data.deposits.as_ref().map(|d| d.vault().to_string()),
        "deposit_required": data.deposits.is_some(),
    }))
}

async fn player<O, P, R>(data: web::Data<AppState<O, P, R>>, path: web::Path<usize>) -> HttpResponse
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
    R: VaultRpc + 'static,
{
    let index = path.into_inner();
    match data.service.player(index).await {
        Ok(participant) => HttpResponse::Ok().json(serde_json::json!({
            "index": index,
            "player": participant.player.to_string(),
            "amount": participant.amount,
        })),
        Err(e) => error_response(&e),
    }
}

async fn metrics<O, P, R>(data: web::Data<AppState<O, P, R>>) -> HttpResponse
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
    R: VaultRpc + 'static,
{
    HttpResponse::Ok().json(data.service.metrics().to_json())
}

async fn enter<O, P, R>(
    data: web::Data<AppState<O, P, R>>,
    body: web::Json<EnterRequest>,
) -> HttpResponse
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
    R: VaultRpc + 'static,
{
    let Ok(player) = Pubkey::from_str(&body.player) else {
        return bad_request(format!("invalid player address: {}", body.player));
    };

    let (amount, deposit) = match &data.deposits {
        None => match body.amount {
            Some(amount) => (amount, None),
            None => return bad_request("amount is required".into()),
        },
        Some(verifier) => {
            let Some(raw) = body.deposit_signature.as_deref() else {
                return bad_request("deposit_signature is required".into());
            };
            let Ok(signature) = Signature::from_str(raw) else {
                return bad_request(format!("invalid deposit signature: {raw}"));
            };
            let deposit = match verifier.claim(&player, &signature).await {
                Ok(deposit) => deposit,
                Err(e) => return deposit_error_response(&e),
            };
            if let Some(amount) = body.amount.filter(|a| *a != deposit.lamports) {
                verifier.release(&signature);
                return bad_request(format!(
                    "amount {amount} does not match the deposited {} lamports",
                    deposit.lamports
                ));
            }
            (deposit.lamports, Some(signature))
        }
    };

    match data.service.enter(player, amount).await {
        Ok(event) => HttpResponse::Ok().json(serde_json::json!({
            "player": event.player.to_string(),
            "amount": event.amount,
            "round": event.round,
            "deposit_signature": deposit.map(|s| s.to_string()),
        })),
        Err(e) => {
            // The deposit can fund a later attempt.
            if let (Some(verifier), Some(signature)) = (&data.deposits, deposit) {
                verifier.release(&signature);
            }
            error_response(&e)
        }
    }
}

async fn recover<O, P, R>(req: HttpRequest, data: web::Data<AppState<O, P, R>>) -> HttpResponse
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
    R: VaultRpc + 'static,
{
    let presented = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let authorized = matches!(
        (data.admin_token.as_deref(), presented),
        (Some(expected), Some(given)) if expected == given
    );
    if !authorized {
        return HttpResponse::Forbidden().json(serde_json::json!({"error": "forbidden"}));
    }

    match data.service.recover_stalled_request().await {
        Ok(event) => HttpResponse::Ok().json(serde_json::json!({
            "abandoned_request_id": event.request_id,
            "round": event.round,
        })),
        Err(e) => error_response(&e),
    }
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({"error": message}))
}

fn error_response(err: &RaffleError) -> HttpResponse {
    let body = serde_json::json!({"error": err.to_string()});
    match err {
        RaffleError::InsufficientStake { .. } | RaffleError::BalanceOverflow => {
            HttpResponse::BadRequest().json(body)
        }
        RaffleError::RaffleNotOpen | RaffleError::RecoveryNotAllowed(_) => {
            HttpResponse::Conflict().json(body)
        }
        RaffleError::PlayerIndexOutOfRange { .. } => HttpResponse::NotFound().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

fn deposit_error_response(err: &DepositError) -> HttpResponse {
    let body = serde_json::json!({"error": err.to_string()});
    match err {
        DepositError::AlreadyClaimed(_) => HttpResponse::Conflict().json(body),
        _ => HttpResponse::BadRequest().json(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::deposit::fixtures::record_transfer;
    use crate::metrics::Metrics;
    use crate::oracle::{LocalVrfOracle, PendingRandomness};
    use crate::payout::LedgerPayout;
    use crate::payout::fake::FakeRpc;
    use crate::raffle::Raffle;
    use crate::state::RaffleConfig;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use tokio::sync::mpsc;

    type TestState = AppState<LocalVrfOracle, LedgerPayout, Arc<FakeRpc>>;

    fn state(
        clock: Arc<ManualClock>,
        deposits: Option<DepositVerifier<Arc<FakeRpc>>>,
    ) -> (web::Data<TestState>, mpsc::Receiver<PendingRandomness>) {
        let config = RaffleConfig {
            entrance_fee: 10,
            interval: 30,
            key_hash: [0u8; 32],
            subscription_id: 1,
            callback_compute_limit: 500_000,
            request_confirmations: 0,
            recovery_timeout: Some(60),
        };
        let (oracle, rx) = LocalVrfOracle::new(1, 1, clock.clone(), 4);
        let service = RaffleService::new(
            Raffle::new(config, clock.now()),
            oracle,
            LedgerPayout::new(),
            clock,
            Arc::new(Metrics::new()),
        );
        let data = web::Data::new(AppState {
            service: Arc::new(service),
            admin_token: Some("secret".into()),
            deposits,
        });
        (data, rx)
    }

    macro_rules! app {
        ($data:expr) => {
            test::init_service(
                App::new()
                    .app_data($data.clone())
                    .configure(routes::<LocalVrfOracle, LedgerPayout, Arc<FakeRpc>>),
            )
            .await
        };
    }

    fn enter_request(body: serde_json::Value) -> test::TestRequest {
        test::TestRequest::post().uri("/enter").set_json(body)
    }

    #[actix_web::test]
    async fn enter_then_read_status_and_player() {
        let (data, _rx) = state(Arc::new(ManualClock::new(0)), None);
        let app = app!(data);
        let player = Pubkey::new_unique();

        let body = serde_json::json!({"player": player.to_string(), "amount": 10});
        let req = enter_request(body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/status").to_request();
        let status: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["phase"], "open");
        assert_eq!(status["num_players"], 1);
        assert_eq!(status["accumulated_balance"], 10);

        let req = test::TestRequest::get().uri("/players/0").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["player"], player.to_string());

        let req = test::TestRequest::get().uri("/players/1").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/vault").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["deposit_required"], false);
    }

    #[actix_web::test]
    async fn enter_rejections_map_to_client_errors() {
        let (data, _rx) = state(Arc::new(ManualClock::new(0)), None);
        let app = app!(data);

        let body = serde_json::json!({"player": "not-a-key", "amount": 10});
        let req = enter_request(body).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let player = Pubkey::new_unique().to_string();
        let req = enter_request(serde_json::json!({"player": player, "amount": 9})).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = enter_request(serde_json::json!({"player": player})).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn enter_while_closing_is_a_conflict() {
        let clock = Arc::new(ManualClock::new(0));
        let (data, _rx) = state(clock.clone(), None);
        let app = app!(data);

        data.service.enter(Pubkey::new_unique(), 10).await.unwrap();
        clock.advance(30);
        data.service.perform_upkeep().await.unwrap();

        let player = Pubkey::new_unique().to_string();
        let body = serde_json::json!({"player": player, "amount": 10});
        let req = enter_request(body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let status = data.service.snapshot().await;
        assert_eq!(status.num_players, 1);
        assert_eq!(status.accumulated_balance, 10);
    }

    #[actix_web::test]
    async fn deposit_backed_entry_stakes_what_reached_the_vault() {
        let rpc = Arc::new(FakeRpc::default());
        let vault = Pubkey::new_unique();
        let verifier = DepositVerifier::new(rpc.clone(), vault, 0);
        let (data, _rx) = state(Arc::new(ManualClock::new(0)), Some(verifier));
        let app = app!(data);
        let player = Pubkey::new_unique();
        let signature = record_transfer(&rpc, &player, &vault, 25);

        // A bare claim moves nothing.
        let req = enter_request(serde_json::json!({
            "player": player.to_string(),
            "amount": 5_000_000_000_000u64,
        })).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        // Nor does someone else's deposit.
        let req = enter_request(serde_json::json!({
            "player": Pubkey::new_unique().to_string(),
            "deposit_signature": signature.to_string(),
        })).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = enter_request(serde_json::json!({
            "player": player.to_string(),
            "amount": 5_000_000_000_000u64,
            "deposit_signature": signature.to_string(),
        })).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = enter_request(serde_json::json!({
            "player": player.to_string(),
            "deposit_signature": signature.to_string(),
        })).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["amount"], 25);
        assert_eq!(data.service.snapshot().await.accumulated_balance, 25);

        // The same deposit cannot fund a second entry.
        let req = enter_request(serde_json::json!({
            "player": player.to_string(),
            "deposit_signature": signature.to_string(),
        })).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);
        assert_eq!(data.service.snapshot().await.num_players, 1);

        let req = test::TestRequest::get().uri("/vault").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["vault"], vault.to_string());
        assert_eq!(body["deposit_required"], true);
    }

    #[actix_web::test]
    async fn deposit_for_a_refused_entry_stays_usable() {
        let clock = Arc::new(ManualClock::new(0));
        let rpc = Arc::new(FakeRpc::default());
        let vault = Pubkey::new_unique();
        let verifier = DepositVerifier::new(rpc.clone(), vault, 0);
        let (data, _rx) = state(clock.clone(), Some(verifier));
        let app = app!(data);

        data.service.enter(Pubkey::new_unique(), 10).await.unwrap();
        clock.advance(30);
        data.service.perform_upkeep().await.unwrap();

        let player = Pubkey::new_unique();
        let signature = record_transfer(&rpc, &player, &vault, 10);
        let req = enter_request(serde_json::json!({
            "player": player.to_string(),
            "deposit_signature": signature.to_string(),
        })).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let deposits = data.deposits.as_ref().unwrap();
        assert!(!deposits.is_claimed(&signature));
    }

    #[actix_web::test]
    async fn recover_requires_admin_token() {
        let clock = Arc::new(ManualClock::new(0));
        let (data, _rx) = state(clock.clone(), None);
        let app = app!(data);

        data.service.enter(Pubkey::new_unique(), 10).await.unwrap();
        clock.advance(30);
        data.service.perform_upkeep().await.unwrap();

        let req = test::TestRequest::post().uri("/admin/recover").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post()
            .uri("/admin/recover")
            .insert_header((ADMIN_TOKEN_HEADER, "secret"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        clock.advance(60);
        let req = test::TestRequest::post()
            .uri("/admin/recover")
            .insert_header((ADMIN_TOKEN_HEADER, "secret"))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["abandoned_request_id"], 1);
        assert_eq!(data.service.snapshot().await.pending_request_id, None);
    }
}
