use utoipa::OpenApi;

use crate::error::ErrorResponse;
use crate::quota::Paywall;
use crate::types::{
    CheckoutReq, Credentials, GenerateReq, GenerateResp, Me, OkResp, WebhookAck,
    WebhookEvent,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::signup,
        crate::server::login,
        crate::server::logout,
        crate::server::me,
        crate::server::generate,
        crate::server::checkout,
        crate::server::payment_webhook,
    ),
    components(
        schemas(
            Credentials,
            OkResp,
            Me,
            GenerateReq,
            GenerateResp,
            CheckoutReq,
            Paywall,
            WebhookEvent,
            WebhookAck,
            ErrorResponse,
        )
    ),
    tags(
        (name = "sufuria", description = "Sufuria API endpoints")
    ),
    info(
        title = "Sufuria API",
        version = "0.1",
        description = "Recipe suggestions behind a login and a daily quota. \
            The session token travels in a cookie set by /login.",
        license(
            name = "BSD-3-Clause"
        )
    )
)]
pub struct ApiDoc;
