//! Browser-style sign-in and batch login

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, ORIGIN, REFERER, SET_COOKIE, USER_AGENT,
};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::accounts::Account;
use crate::constants::{
    BROWSER_USER_AGENT, SEC_CH_UA, SIGNIN_ATTEMPTS, SIGNIN_REFERER, SIGNIN_RETRY_DELAY,
    SIGNIN_TIMEOUT, SITE_ORIGIN, TOKEN_COOKIE,
};
use crate::error::{Error, Result};

/// Pull the session token out of the response's `Set-Cookie` headers.
pub fn extract_token_from_set_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            (name.trim() == TOKEN_COOKIE && !value.trim().is_empty())
                .then(|| value.trim().to_string())
        })
}

pub struct SignInClient {
    http: reqwest::Client,
    url: String,
    attempts: u32,
    retry_delay: Duration,
}

impl SignInClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            attempts: SIGNIN_ATTEMPTS,
            retry_delay: SIGNIN_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sign in and return the session token.
    ///
    /// Transport failures are retried; a non-200 answer or a 200 without the
    /// token cookie is final for this account.
    pub async fn sign_in(&self, account: &Account) -> Result<String> {
        let body = json!({
            "email": account.email,
            "password": account.password.expose(),
        });

        let mut attempt = 1;
        let response = loop {
            let result = self
                .http
                .post(&self.url)
                .header(ACCEPT, "*/*")
                .header(ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9")
                .header(CONTENT_TYPE, "application/json")
                .header(ORIGIN, SITE_ORIGIN)
                .header(REFERER, SIGNIN_REFERER)
                .header(USER_AGENT, BROWSER_USER_AGENT)
                .header("sec-ch-ua", SEC_CH_UA)
                .header("sec-ch-ua-mobile", "?0")
                .header("sec-ch-ua-platform", "\"Windows\"")
                .header("sec-fetch-dest", "empty")
                .header("sec-fetch-mode", "cors")
                .header("sec-fetch-site", "same-origin")
                .timeout(SIGNIN_TIMEOUT)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) => break response,
                Err(e) if attempt < self.attempts => {
                    debug!(attempt, error = %e, "sign-in attempt failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(Error::Http(format!("sign-in request failed: {e}"))),
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            let body: String = body.chars().take(200).collect();
            return Err(Error::Rejected(format!("{status}: {body}")));
        }

        extract_token_from_set_cookie(response.headers()).ok_or(Error::MissingToken)
    }
}

/// Sign every account in, at most `max_workers` at a time.
///
/// Tokens come back in account order; accounts that fail are logged and
/// left out.
pub async fn login_all(
    client: Arc<SignInClient>,
    accounts: Vec<Account>,
    max_workers: usize,
) -> Vec<String> {
    let total = accounts.len();
    let permits = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = JoinSet::new();

    for (position, account) in accounts.into_iter().enumerate() {
        let client = client.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            match client.sign_in(&account).await {
                Ok(token) => Some((position, token)),
                Err(e) => {
                    warn!(email = %account.email, error = %e, "account sign-in failed");
                    None
                }
            }
        });
    }

    let mut slots: Vec<Option<String>> = vec![None; total];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some((position, token))) => slots[position] = Some(token),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "sign-in task aborted"),
        }
    }

    let tokens: Vec<String> = slots.into_iter().flatten().collect();
    info!(
        accounts = total,
        succeeded = tokens.len(),
        failed = total - tokens.len(),
        "batch login finished"
    );
    tokens
}
