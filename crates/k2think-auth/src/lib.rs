//! K2Think account login
//!
//! Turns a file of K2Think accounts into a fresh set of bearer tokens for the
//! token pool. The web app has no token API, so each account signs in the way
//! the browser does and the session token is read back from `Set-Cookie`.
//!
//! Credential flow:
//! 1. `accounts::load_accounts()` reads one JSON account per line
//! 2. `login::SignInClient::sign_in()` posts the credentials and scrapes the cookie
//! 3. `login::login_all()` runs sign-ins concurrently, bounded by `max_workers`
//! 4. `source::AccountLoginSource` exposes the whole batch as a `CredentialSource`

pub mod accounts;
pub mod constants;
pub mod error;
pub mod login;
pub mod source;

pub use accounts::{Account, load_accounts, parse_accounts};
pub use error::{Error, Result};
pub use login::{SignInClient, extract_token_from_set_cookie, login_all};
pub use source::AccountLoginSource;
