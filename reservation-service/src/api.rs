use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use shared::*;
use std::sync::Arc;
use uuid::Uuid;

use crate::admin::{AdminCapability, AdminGate, AdminService};
use crate::availability::AvailabilityCalculator;
use crate::cart::CartService;
use crate::clock::Clock;
use crate::config::ServiceSettings;
use crate::error::ReservationError;
use crate::manager::ReservationManager;
use crate::store::ReservationStore;
use crate::sweeper::ExpirySweeper;
use crate::trigger::SweepTrigger;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
pub const ADMIN_ACTOR_HEADER: &str = "x-admin-actor";

#[derive(Clone)]
pub struct AppState {
    pub availability: AvailabilityCalculator,
    pub cart: CartService,
    pub admin: AdminService,
    pub admin_gate: AdminGate,
    pub sweeper: Arc<ExpirySweeper>,
    pub sweep_trigger: SweepTrigger,
}

impl AppState {
    pub fn new(store: Arc<dyn ReservationStore>, clock: Arc<dyn Clock>, settings: &ServiceSettings) -> Self {
        let manager = ReservationManager::new(store.clone(), clock.clone());
        let sweeper = Arc::new(ExpirySweeper::new(manager.clone(), settings.sweep));

        Self {
            availability: AvailabilityCalculator::new(store, clock),
            cart: CartService::new(manager.clone(), settings.reservation_ttl, settings.payment_window),
            admin: AdminService::new(manager),
            admin_gate: AdminGate::new(settings.admin_token.clone()),
            sweeper: sweeper.clone(),
            sweep_trigger: SweepTrigger::new(sweeper, settings.sweep_token.clone()),
        }
    }
}

/// An approved administrator, taken from the `x-admin-token` header.
pub struct Admin(pub AdminCapability);

#[async_trait]
impl FromRequestParts<AppState> for Admin {
    type Rejection = ReservationError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|value| value.to_str().ok());
        let token = header(ADMIN_TOKEN_HEADER).unwrap_or_default();
        let actor = header(ADMIN_ACTOR_HEADER).unwrap_or("admin");
        state.admin_gate.authorize(token, actor).map(Admin)
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/subjects/:subject_id/availability", get(get_availability))
        .route("/carts/:owner_id", get(view_cart).delete(clear_cart))
        .route("/carts/:owner_id/items", post(add_cart_item))
        .route(
            "/carts/:owner_id/items/:subject_id",
            put(update_cart_item).delete(remove_cart_item),
        )
        .route("/carts/:owner_id/checkout", post(checkout))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id/finalize", post(finalize_order))
        .route("/orders/:order_id/cancel", post(cancel_order))
        .route("/jobs/sweep", get(trigger_sweep).post(trigger_sweep))
        .route("/admin/subjects/:subject_id", put(upsert_subject))
        .route("/admin/subjects/:subject_id/restock", post(restock_subject))
        .route("/admin/reservations/:reservation_id/release", post(force_release))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn get_availability(
    State(state): State<AppState>,
    Path(subject_id): Path<Uuid>,
) -> Result<Json<AvailabilitySnapshot>, ReservationError> {
    Ok(Json(state.availability.snapshot(subject_id).await?))
}

pub async fn view_cart(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<CartView>, ReservationError> {
    Ok(Json(state.cart.view(owner_id).await?))
}

pub async fn add_cart_item(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Json(request): Json<AddCartItemRequest>,
) -> Result<Json<CartView>, ReservationError> {
    let cart = state
        .cart
        .add_item(owner_id, request.subject_type, request.subject_id, request.quantity)
        .await?;
    Ok(Json(cart))
}

pub async fn update_cart_item(
    State(state): State<AppState>,
    Path((owner_id, subject_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<UpdateCartItemRequest>,
) -> Result<Json<CartView>, ReservationError> {
    Ok(Json(state.cart.update_item(owner_id, subject_id, request.quantity).await?))
}

pub async fn remove_cart_item(
    State(state): State<AppState>,
    Path((owner_id, subject_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CartView>, ReservationError> {
    Ok(Json(state.cart.remove_item(owner_id, subject_id).await?))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<CartView>, ReservationError> {
    Ok(Json(state.cart.clear(owner_id).await?))
}

pub async fn checkout(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Order>), ReservationError> {
    let order = state.cart.place_order(owner_id).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ReservationError> {
    Ok(Json(state.cart.order(order_id).await?))
}

pub async fn finalize_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ReservationError> {
    Ok(Json(state.cart.finalize_order(order_id).await?))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ReservationError> {
    Ok(Json(state.cart.cancel_order(order_id).await?))
}

pub async fn trigger_sweep(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let authorization = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());

    match state.sweep_trigger.trigger(authorization).await {
        Ok(report) => Json(SweepResponse {
            success: true,
            released_count: report.released_count,
            cancelled_order_count: report.cancelled_order_count,
            failure_count: report.failures.len(),
        })
        .into_response(),
        Err(e) => {
            let status = match e {
                ReservationError::Unauthorized => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let body = SweepResponse {
                success: false,
                released_count: 0,
                cancelled_order_count: 0,
                failure_count: 0,
            };
            (status, Json(body)).into_response()
        }
    }
}

pub async fn upsert_subject(
    State(state): State<AppState>,
    Admin(cap): Admin,
    Path(subject_id): Path<Uuid>,
    Json(request): Json<UpsertSubjectRequest>,
) -> Result<Json<Subject>, ReservationError> {
    let subject = state
        .admin
        .upsert_subject(&cap, request.subject_type, subject_id, request.quantity_on_hand)
        .await?;
    Ok(Json(subject))
}

pub async fn restock_subject(
    State(state): State<AppState>,
    Admin(cap): Admin,
    Path(subject_id): Path<Uuid>,
    Json(request): Json<RestockRequest>,
) -> Result<Json<Subject>, ReservationError> {
    Ok(Json(state.admin.restock(&cap, subject_id, request.quantity).await?))
}

pub async fn force_release(
    State(state): State<AppState>,
    Admin(cap): Admin,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, ReservationError> {
    Ok(Json(state.admin.force_release(&cap, reservation_id).await?))
}
