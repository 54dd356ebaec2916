use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context};
use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    routing::{get, post},
    Json,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_sessions::{cookie::SameSite, Expiry, Session, SessionManagerLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth,
    conf::{self, Conf},
    data::Storage,
    docs::ApiDoc,
    error::{ApiError, ErrorResponse},
    quota::{self, Gate, Paywall},
    recipes::Generator,
    session::{self as sessions, MemoryStore},
    types::{
        self, CheckoutReq, Credentials, GenerateReq, GenerateResp, Me, OkResp,
        WebhookAck, WebhookEvent,
    },
};


type Payload<T> = Result<Json<T>, JsonRejection>;

#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub storage: Storage,
    pub sessions: MemoryStore,
    pub generator: Generator,
}

impl AppState {
    pub async fn new(conf: Conf) -> anyhow::Result<Self> {
        let storage =
            Storage::connect(&conf.database_url, conf.busy_timeout()?).await?;
        let generator = Generator::new(conf.generator.clone())?;
        // Fail at startup rather than on the first paywall or login.
        quota::paywall(&conf.quota, "")?;
        conf.session.inactivity()?;
        conf.session.sweep_period()?;
        Ok(Self {
            conf: Arc::new(conf),
            storage,
            sessions: MemoryStore::new(),
            generator,
        })
    }
}

pub fn router(state: AppState) -> anyhow::Result<axum::Router> {
    let cors = cors(&state.conf.cors_origins)?;
    let conf = &state.conf.session;
    let sessions = SessionManagerLayer::new(state.sessions.clone())
        .with_name(conf.cookie_name.clone())
        .with_path("/")
        .with_http_only(true)
        .with_same_site(SameSite::Lax)
        .with_secure(conf.cookie_secure)
        .with_expiry(Expiry::OnInactivity(conf.inactivity()?));
    let routes = axum::Router::new()
        .route("/health", get(health_check))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/generate", post(generate))
        .route("/checkout", post(checkout))
        .route("/webhook/payment", post(payment_webhook))
        .layer(sessions)
        .layer(cors)
        .route_layer(middleware::from_fn(|req: Request, next: Next| {
            REQ_ID.scope(ReqId::new(), next.run(req))
        }))
        .with_state(state);
    Ok(routes)
}

fn cors(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        // Credentials rule out a literal wildcard.
        AllowOrigin::mirror_request()
    } else {
        let origins = origins
            .iter()
            .map(|origin| {
                origin
                    .parse::<HeaderValue>()
                    .context(format!("Invalid CORS origin: {origin:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };
    let layer = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN])
        .allow_credentials(true);
    Ok(layer)
}

#[tracing::instrument(name = "server", skip_all)]
pub async fn run(conf: Conf) -> anyhow::Result<()> {
    tracing::info!(?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));
    let tls = conf.tls.clone();
    let sweep_period = conf.session.sweep_period()?;
    let state = AppState::new(conf).await?;
    let sweeper =
        tokio::spawn(state.sessions.clone().sweep_every(sweep_period));
    let service =
        router(state)?.into_make_service_with_connect_info::<SocketAddr>();

    match &tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            // XXX One MUST do this manual init of rustls provider when using
            //     more than a single dep which itself depends on rustls.
            //     Here we using 2:
            //     - axum_server
            //     - reqwest
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|crypto_provider| {
                    anyhow!(
                        "Failed to install default crypto provider: \
                        {crypto_provider:?}"
                    )
                })?;

            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            axum_server::bind_rustls(addr, config)
                .serve(service)
                .await?;
        }
    }

    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "Failed to listen for shutdown signal.");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down.");
}

#[tracing::instrument(skip_all, fields(req_id = %req_id()))]
#[utoipa::path(
    post,
    path = "/signup",
    request_body = Credentials,
    responses(
        (status = 200, description = "Account created", body = OkResp),
        (status = 400, description = "Missing username or password", body = ErrorResponse),
        (status = 409, description = "Username already exists", body = ErrorResponse),
    )
)]
pub async fn signup(
    State(state): State<AppState>,
    payload: Payload<Credentials>,
) -> Result<Json<OkResp>, ApiError> {
    let Json(creds) = payload?;
    auth::signup(
        &state.storage,
        state.conf.bcrypt_cost,
        &creds.username,
        &creds.password,
    )
    .await?;
    Ok(Json(types::ok()))
}

#[tracing::instrument(skip_all, fields(req_id = %req_id()))]
#[utoipa::path(
    post,
    path = "/login",
    request_body = Credentials,
    responses(
        (status = 200, description = "Logged in, session cookie set", body = OkResp),
        (status = 400, description = "Missing username or password", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
    )
)]
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    payload: Payload<Credentials>,
) -> Result<Json<OkResp>, ApiError> {
    let Json(creds) = payload?;
    let user =
        auth::login(&state.storage, &creds.username, &creds.password).await?;
    sessions::begin(&session, &user).await?;
    Ok(Json(OkResp {
        ok: true,
        username: Some(user.username),
    }))
}

#[tracing::instrument(skip_all, fields(req_id = %req_id()))]
#[utoipa::path(
    post,
    path = "/logout",
    responses(
        (status = 200, description = "Session cleared", body = OkResp),
    )
)]
pub async fn logout(session: Session) -> Result<Json<OkResp>, ApiError> {
    if let Some(user) = sessions::user(&session).await? {
        tracing::info!(user_id = user.user_id, "Logged out.");
    }
    sessions::end(&session).await?;
    Ok(Json(types::ok()))
}

#[tracing::instrument(skip_all, fields(req_id = %req_id()))]
#[utoipa::path(
    get,
    path = "/me",
    responses(
        (status = 200, description = "Current user and today's usage, or a null user", body = Me),
    )
)]
pub async fn me(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Me>, ApiError> {
    let user = sessions::user(&session).await?;
    let me = auth::current_user(&state.storage, user).await?;
    let body = match me {
        None => Me {
            user: None,
            used_today: None,
            limit: None,
        },
        Some(auth::Me { user, used_today }) => Me {
            user: Some(user.username),
            used_today: Some(used_today),
            limit: Some(state.conf.quota.daily_limit),
        },
    };
    Ok(Json(body))
}

#[tracing::instrument(skip_all, fields(req_id = %req_id()))]
#[utoipa::path(
    post,
    path = "/generate",
    request_body = GenerateReq,
    responses(
        (status = 200, description = "Recipes generated", body = GenerateResp),
        (status = 400, description = "No ingredients provided", body = ErrorResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse),
        (status = 402, description = "Daily limit reached", body = ErrorResponse),
        (status = 500, description = "Generation failed", body = ErrorResponse),
    )
)]
pub async fn generate(
    State(state): State<AppState>,
    session: Session,
    payload: Payload<GenerateReq>,
) -> Result<Json<GenerateResp>, ApiError> {
    let user = sessions::user(&session)
        .await?
        .ok_or_else(ApiError::auth_required)?;
    let Json(req) = payload?;
    if req.ingredients.trim().is_empty() {
        return Err(ApiError::BadRequest("no ingredients provided".to_string()));
    }
    let limit = state.conf.quota.daily_limit;
    let held =
        match quota::admit(&state.storage, &state.conf.quota, &user).await? {
            Gate::Admitted(held) => held,
            Gate::Paywall(paywall) => return Err(ApiError::LimitReached(paywall)),
        };
    tracing::info!(user_id = user.user_id, used = held.count(), "Generating.");
    // If this future is dropped while waiting, `held` gives the unit back.
    match state
        .generator
        .generate(&req.ingredients, &req.notes, req.limit)
        .await
    {
        Ok(recipes) => Ok(Json(GenerateResp {
            recipes,
            used_today: held.commit().count,
            limit,
        })),
        Err(error) => {
            held.release().await;
            Err(error.into())
        }
    }
}

#[tracing::instrument(skip_all, fields(req_id = %req_id()))]
#[utoipa::path(
    post,
    path = "/checkout",
    request_body = CheckoutReq,
    responses(
        (status = 200, description = "Checkout link (payment provider stub)", body = Paywall),
        (status = 401, description = "Not logged in", body = ErrorResponse),
    )
)]
pub async fn checkout(
    State(state): State<AppState>,
    session: Session,
    payload: Payload<CheckoutReq>,
) -> Result<Json<Paywall>, ApiError> {
    let user = sessions::user(&session)
        .await?
        .ok_or_else(ApiError::auth_required)?;
    let Json(req) = payload?;
    let paywall = quota::paywall(&state.conf.quota, &user.username)?;
    tracing::info!(
        user_id = user.user_id,
        email = ?req.email,
        requested = ?req.amount,
        amount = ?paywall.amount,
        "Checkout requested."
    );
    Ok(Json(paywall))
}

#[tracing::instrument(skip_all, fields(req_id = %req_id()))]
#[utoipa::path(
    post,
    path = "/webhook/payment",
    request_body = WebhookEvent,
    responses(
        (status = 200, description = "Event acknowledged (payment provider stub)", body = WebhookAck),
        (status = 400, description = "Malformed event", body = ErrorResponse),
    )
)]
pub async fn payment_webhook(
    payload: Payload<WebhookEvent>,
) -> Result<Json<WebhookAck>, ApiError> {
    let Json(event) = payload?;
    // TODO Verify the provider's signature before trusting any of this.
    if event.event == "charge.success" {
        let email = event
            .data
            .pointer("/customer/email")
            .and_then(serde_json::Value::as_str);
        tracing::info!(?email, "Payment succeeded.");
        Ok(Json(WebhookAck {
            status: "success".to_string(),
        }))
    } else {
        tracing::debug!(event = ?event.event, "Payment event ignored.");
        Ok(Json(WebhookAck {
            status: "ignored".to_string(),
        }))
    }
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Clone)]
struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    static REQ_ID: ReqId;
}

fn req_id() -> String {
    REQ_ID
        .try_with(|id| id.req_id.clone())
        .unwrap_or_default()
}
