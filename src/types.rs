use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema, Debug, Default)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct OkResp {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[must_use]
pub fn ok() -> OkResp {
    OkResp {
        ok: true,
        username: None,
    }
}

/// `user` is null for anonymous callers, and the rest is then absent.
#[derive(Serialize, ToSchema, Debug)]
pub struct Me {
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_today: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Deserialize, ToSchema, Debug)]
#[serde(default)]
pub struct GenerateReq {
    pub ingredients: String,
    pub notes: String,

    /// How many recipes to ask for.
    pub limit: u32,
}

impl Default for GenerateReq {
    fn default() -> Self {
        Self {
            ingredients: String::new(),
            notes: String::new(),
            limit: 3,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct GenerateResp {
    #[schema(value_type = Vec<Object>)]
    pub recipes: Vec<serde_json::Value>,

    /// Today's count right after this generation was admitted. Other
    /// generations for the same user still running at that moment are
    /// included, and any of them that later fails gives its unit back, so
    /// `/me` may then report less.
    pub used_today: u32,

    /// The daily limit.
    pub limit: u32,
}

#[derive(Deserialize, ToSchema, Debug, Default)]
#[serde(default)]
pub struct CheckoutReq {
    pub email: Option<String>,

    /// Logged only. The charged amount always comes from configuration.
    pub amount: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug, Default)]
#[serde(default)]
pub struct WebhookEvent {
    pub event: String,
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct WebhookAck {
    pub status: String,
}
