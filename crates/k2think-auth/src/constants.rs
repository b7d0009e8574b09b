//! K2Think web endpoints and browser fingerprint

use std::time::Duration;

/// Sign-in endpoint of the K2Think web app
pub const SIGNIN_URL: &str = "https://www.k2think.ai/api/v1/auths/signin";

pub const SITE_ORIGIN: &str = "https://www.k2think.ai";

pub const SIGNIN_REFERER: &str = "https://www.k2think.ai/auth?mode=signin";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36 Edg/140.0.0.0";

pub const SEC_CH_UA: &str =
    "\"Chromium\";v=\"140\", \"Not=A?Brand\";v=\"24\", \"Microsoft Edge\";v=\"140\"";

/// Name of the session cookie carrying the bearer token
pub const TOKEN_COOKIE: &str = "token";

pub const SIGNIN_ATTEMPTS: u32 = 3;

pub const SIGNIN_RETRY_DELAY: Duration = Duration::from_secs(2);

pub const SIGNIN_TIMEOUT: Duration = Duration::from_secs(30);
