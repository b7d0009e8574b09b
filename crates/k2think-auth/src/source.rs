//! Account logins as a pool credential source

use std::path::PathBuf;
use std::sync::Arc;

use token_pool::{CredentialSource, RefreshFuture};
use tracing::info;

use crate::accounts::load_accounts;
use crate::login::{SignInClient, login_all};

/// Re-reads the accounts file on every refresh so edits take effect without
/// a restart.
pub struct AccountLoginSource {
    accounts_file: PathBuf,
    client: Arc<SignInClient>,
    max_workers: usize,
}

impl AccountLoginSource {
    pub fn new(accounts_file: PathBuf, client: SignInClient, max_workers: usize) -> Self {
        Self {
            accounts_file,
            client: Arc::new(client),
            max_workers,
        }
    }

    async fn collect(&self) -> token_pool::Result<Vec<String>> {
        let accounts = load_accounts(&self.accounts_file)
            .await
            .map_err(|e| token_pool::Error::RefreshFailed(e.to_string()))?;
        if accounts.is_empty() {
            return Err(token_pool::Error::RefreshFailed(format!(
                "no usable accounts in {}",
                self.accounts_file.display()
            )));
        }

        info!(accounts = accounts.len(), workers = self.max_workers, "signing in accounts");
        Ok(login_all(self.client.clone(), accounts, self.max_workers).await)
    }
}

impl CredentialSource for AccountLoginSource {
    fn name(&self) -> &str {
        "k2think-login"
    }

    fn refresh(&self) -> RefreshFuture<'_> {
        Box::pin(self.collect())
    }
}
