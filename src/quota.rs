use anyhow::Context;
use utoipa::ToSchema;

use crate::{
    conf::ConfQuota,
    data::{self, Reservation, Storage},
    session::SessionUser,
};

/// Where to send a user who has used up the free quota.
#[derive(serde::Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct Paywall {
    pub checkout_url: String,
    pub amount: String,
}

#[derive(Debug)]
pub enum Gate {
    Admitted(Held),
    Paywall(Paywall),
}

/// A unit of today's quota held while a generation runs. Unless committed
/// or released, it is released on drop, e.g. when the client goes away
/// and the request future is dropped mid-generation.
#[derive(Debug)]
#[must_use]
pub struct Held {
    storage: Storage,
    reservation: Reservation,
    settled: bool,
}

impl Held {
    /// Usage count for today, including this unit.
    pub fn count(&self) -> u32 {
        self.reservation.count
    }

    /// Keeps the unit spent.
    pub fn commit(mut self) -> Reservation {
        self.settled = true;
        self.reservation.clone()
    }

    /// Gives the unit back.
    pub async fn release(mut self) {
        self.settled = true;
        release(&self.storage, &self.reservation).await;
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let storage = self.storage.clone();
        let reservation = self.reservation.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::info!(?reservation, "Generation abandoned.");
                runtime.spawn(async move {
                    release(&storage, &reservation).await;
                });
            }
            Err(error) => {
                tracing::error!(
                    ?error,
                    user_id = reservation.user_id,
                    date = %reservation.date,
                    count = reservation.count,
                    "No runtime to release reservation."
                );
            }
        }
    }
}

pub fn paywall(conf: &ConfQuota, username: &str) -> anyhow::Result<Paywall> {
    let url = reqwest::Url::parse_with_params(
        &conf.checkout_base,
        &[("amount", conf.paywall_amount.as_str()), ("ref", username)],
    )
    .context(format!("Invalid checkout base URL: {:?}", conf.checkout_base))?;
    Ok(Paywall {
        checkout_url: url.to_string(),
        amount: conf.paywall_amount.clone(),
    })
}

/// Takes one unit of today's quota, or says where to pay if none is left.
#[tracing::instrument(skip_all, fields(user_id = user.user_id))]
pub async fn admit(
    storage: &Storage,
    conf: &ConfQuota,
    user: &SessionUser,
) -> anyhow::Result<Gate> {
    let date = data::today();
    match storage
        .usage_reserve(user.user_id, date, conf.daily_limit)
        .await?
    {
        Some(reservation) => {
            tracing::debug!(used = reservation.count, "Admitted.");
            Ok(Gate::Admitted(Held {
                storage: storage.clone(),
                reservation,
                settled: false,
            }))
        }
        None => {
            tracing::info!(limit = conf.daily_limit, "Daily limit reached.");
            Ok(Gate::Paywall(paywall(conf, &user.username)?))
        }
    }
}

/// Returns an unused unit of quota. On failure the user's count for that
/// date stays one too high; the log line carries what is needed to fix it.
pub async fn release(storage: &Storage, reservation: &Reservation) {
    if let Err(error) = storage.usage_release(reservation).await {
        tracing::error!(
            ?error,
            user_id = reservation.user_id,
            date = %reservation.date,
            count = reservation.count,
            "Failed to release reservation."
        );
    }
}
