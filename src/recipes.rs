use std::{sync::LazyLock, time::Duration};

use anyhow::Context;
use regex::Regex;
use serde_json::Value;

use crate::{chat, conf::ConfGenerator};

const SYSTEM_PROMPT: &str = "You are a helpful recipe generator. \
    Given a short list of ingredients and optional dietary notes, \
    return a JSON object with a top-level 'recipes' array. \
    Each recipe must have: title (string), description (string), \
    ingredients (array of strings), steps (array of strings), \
    prep_minutes (integer), cook_minutes (integer). \
    Return only valid JSON and nothing else.";

// Greedy: from the first opening bracket to the last closing one.
static JSON_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(\{.*\}|\[.*\])")
        .unwrap_or_else(|error| unreachable!("Fat-fingered JSON pattern: {error}"))
});

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no ingredients provided")]
    NoIngredients,

    #[error("generator API key is not configured")]
    MissingApiKey,

    #[error("request to generator failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("generator responded with {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("generator response had no content")]
    EmptyResponse,

    #[error("model did not return JSON. Raw output:\n{raw}")]
    Parse { raw: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct Generator {
    client: reqwest::Client,
    conf: ConfGenerator,
}

impl Generator {
    pub fn new(conf: ConfGenerator) -> anyhow::Result<Self> {
        let timeout = Duration::try_from_secs_f32(conf.timeout)
            .context(format!("Invalid generator timeout: {}", conf.timeout))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, conf })
    }

    /// Asks the model for `count` recipes (clamped to the configured
    /// maximum) and returns the records it produced, as it produced them.
    #[tracing::instrument(skip_all, fields(count = count))]
    pub async fn generate(
        &self,
        ingredients: &str,
        notes: &str,
        count: u32,
    ) -> Result<Vec<Value>> {
        let ingredients = ingredients.trim();
        if ingredients.is_empty() {
            return Err(Error::NoIngredients);
        }
        if self.conf.api_key.is_empty() {
            return Err(Error::MissingApiKey);
        }
        let count = count.clamp(1, self.conf.max_recipes.max(1));
        let req = chat::Req {
            model: self.conf.model.clone(),
            messages: vec![
                chat::Msg::system(SYSTEM_PROMPT),
                chat::Msg::user(user_prompt(ingredients, notes.trim(), count)),
            ],
            temperature: Some(self.conf.temperature),
            max_tokens: Some(self.conf.max_tokens),
        };
        tracing::debug!(url = ?self.conf.api_url, model = ?req.model, "Requesting recipes.");
        let response = self
            .client
            .post(&self.conf.api_url)
            .bearer_auth(&self.conf.api_key)
            .json(&req)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(?status, ?body, "Generator request failed.");
            return Err(Error::Status { status, body });
        }
        let resp: chat::Resp = response.json().await?;
        let text = resp.first_content().ok_or(Error::EmptyResponse)?;
        let recipes = parse(text)?;
        tracing::info!(returned = recipes.len(), "Recipes generated.");
        Ok(recipes)
    }
}

fn user_prompt(ingredients: &str, notes: &str, count: u32) -> String {
    format!("Ingredients: {ingredients}\nNotes: {notes}\nReturn {count} recipes.")
}

/// Pulls the recipe list out of model output. Tolerates prose around the
/// JSON. A bare array is taken as the list itself.
pub fn parse(text: &str) -> Result<Vec<Value>> {
    let text = text.trim();
    let value = serde_json::from_str::<Value>(text)
        .ok()
        .filter(|value| value.is_object() || value.is_array())
        .or_else(|| {
            JSON_BLOCK
                .find(text)
                .and_then(|m| serde_json::from_str(m.as_str()).ok())
        })
        .ok_or_else(|| Error::Parse {
            raw: text.to_string(),
        })?;
    let recipes = match value {
        Value::Array(recipes) => recipes,
        Value::Object(mut object) => match object.remove("recipes") {
            Some(Value::Array(recipes)) => recipes,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    Ok(recipes)
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::json;

    use crate::conf::ConfGenerator;

    use super::{fake::Upstream, parse, Error, Generator};

    const TWO: &str = r#"{"recipes":[{"title":"Ugali"},{"title":"Sukuma"}]}"#;

    fn generator(url: &str) -> Generator {
        Generator::new(ConfGenerator {
            api_url: url.to_string(),
            api_key: "sk-test".to_string(),
            timeout: 2.0,
            max_recipes: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn parse_plain_object() {
        let recipes = parse(TWO).unwrap();
        assert_eq!(recipes, vec![json!({"title": "Ugali"}), json!({"title": "Sukuma"})]);
    }

    #[test]
    fn parse_preserves_records() {
        let record = json!({
            "title": "Githeri",
            "description": "Maize and beans",
            "ingredients": ["maize", "beans"],
            "steps": ["boil", "simmer"],
            "prep_minutes": 10,
            "cook_minutes": 90,
            "extra": {"spicy": false}
        });
        let text = json!({ "recipes": [record.clone()] }).to_string();
        assert_eq!(parse(&text).unwrap(), vec![record]);
    }

    #[test]
    fn parse_wrapped_in_prose() {
        let text = format!("Sure! Here you go:\n```json\n{TWO}\n```\nEnjoy.");
        assert_eq!(parse(&text).unwrap().len(), 2);
    }

    #[test]
    fn parse_bare_array() {
        let recipes = parse(r#"[{"title":"Chapati"}]"#).unwrap();
        assert_eq!(recipes, vec![json!({"title": "Chapati"})]);
    }

    #[test]
    fn parse_object_without_recipes() {
        assert!(parse(r#"{"dishes":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn parse_garbage() {
        let result = parse("I cannot help with that.");
        assert!(matches!(
            result,
            Err(Error::Parse { raw }) if raw == "I cannot help with that."
        ));
        assert!(matches!(parse("42"), Err(Error::Parse { .. })));
        assert!(matches!(parse("{not json}"), Err(Error::Parse { .. })));
    }

    #[tokio::test]
    async fn generate_round_trip() {
        let upstream = Upstream::start(StatusCode::OK, TWO).await;
        let recipes = generator(&upstream.url)
            .generate(" eggs, rice ", "vegetarian", 99)
            .await
            .unwrap();
        assert_eq!(recipes.len(), 2);
        assert_eq!(upstream.hits(), 1);
        assert_eq!(
            upstream.last_user_prompt().as_deref(),
            Some("Ingredients: eggs, rice\nNotes: vegetarian\nReturn 5 recipes.")
        );
    }

    #[tokio::test]
    async fn generate_fails_fast() {
        let upstream = Upstream::start(StatusCode::OK, TWO).await;
        let result = generator(&upstream.url).generate("  ", "", 3).await;
        assert!(matches!(result, Err(Error::NoIngredients)));

        let keyless = Generator::new(ConfGenerator {
            api_url: upstream.url.clone(),
            ..Default::default()
        })
        .unwrap();
        let result = keyless.generate("eggs", "", 3).await;
        assert!(matches!(result, Err(Error::MissingApiKey)));
        assert_eq!(upstream.hits(), 0);
    }

    #[tokio::test]
    async fn generate_upstream_status() {
        let upstream = Upstream::start(StatusCode::BAD_GATEWAY, "").await;
        let result = generator(&upstream.url).generate("eggs", "", 1).await;
        assert!(matches!(
            result,
            Err(Error::Status { status, .. }) if status == StatusCode::BAD_GATEWAY
        ));
    }

    #[tokio::test]
    async fn generate_non_json_output() {
        let upstream = Upstream::start(StatusCode::OK, "no recipes today").await;
        let result = generator(&upstream.url).generate("eggs", "", 1).await;
        assert!(matches!(result, Err(Error::Parse { .. })));
    }

    #[tokio::test]
    async fn generate_times_out() {
        let upstream =
            Upstream::start_with_delay(StatusCode::OK, TWO, Duration::from_secs(5))
                .await;
        let generator = Generator::new(ConfGenerator {
            api_url: upstream.url.clone(),
            api_key: "sk-test".to_string(),
            timeout: 0.2,
            ..Default::default()
        })
        .unwrap();
        let result = generator.generate("eggs", "", 1).await;
        assert!(matches!(result, Err(Error::Request(e)) if e.is_timeout()));
    }
}
