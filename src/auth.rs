use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::{Extension, Json};
use chrono::Utc;
use pbkdf2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{Params, Pbkdf2};
use rand::rngs::OsRng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task;

use crate::models::{Account, Credentials, ACCOUNTS};
use crate::session::{TokenError, TokenMinter};
use crate::store::{to_fields, RecordStore, StoreError};
use crate::{created, proceeds, AppState, Error, Payload};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{0}")]
    Invalid(&'static str),

    #[error("account already exists")]
    Conflict,

    #[error("invalid credentials")]
    Unauthorized,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("stored account is unreadable: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("session token error: {0}")]
    Token(#[from] TokenError),

    #[error("hashing task failed: {0}")]
    Task(#[from] task::JoinError),
}

impl From<password_hash::Error> for VaultError {
    fn from(err: password_hash::Error) -> Self {
        VaultError::Hashing(err.to_string())
    }
}

/// PBKDF2-HMAC-SHA256 with a configurable round count. Hashes are PHC
/// strings, so verification reads the rounds back from the hash itself.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHashing {
    rounds: u32,
}

impl PasswordHashing {
    pub const DEFAULT_ROUNDS: u32 = 600_000;
    pub const MIN_ROUNDS: u32 = 1_000;

    pub fn new(rounds: u32) -> Self {
        Self {
            rounds: rounds.max(Self::MIN_ROUNDS),
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn hash(&self, password: &str) -> Result<String, VaultError> {
        let salt = SaltString::generate(&mut OsRng);
        let params = Params {
            rounds: self.rounds,
            output_length: 32,
        };
        let hash = Pbkdf2.hash_password_customized(
            password.as_bytes(),
            None,
            None,
            params,
            salt.as_salt(),
        )?;
        Ok(hash.to_string())
    }

    /// `Ok(false)` on mismatch; an unparseable stored hash is an error.
    pub fn verify(stored: &str, password: &str) -> Result<bool, VaultError> {
        let hash = PasswordHash::new(stored)?;
        match Pbkdf2.verify_password(password.as_bytes(), &hash) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for PasswordHashing {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ROUNDS)
    }
}

/// Verified against when the account does not exist, so an unknown email
/// costs the same hashing work as a wrong password.
const DECOY_PASSWORD: &str = "decoy-password-never-issued";

fn validate(email: &str, password: &str) -> Result<(), VaultError> {
    if email.is_empty() || password.is_empty() {
        return Err(VaultError::Invalid("missing email or password"));
    }
    Ok(())
}

/// Account provisioning and login over a record store.
pub struct CredentialVault {
    store: Arc<dyn RecordStore>,
    hashing: PasswordHashing,
    minter: Arc<dyn TokenMinter>,
    decoy: OnceCell<String>,
}

impl CredentialVault {
    pub fn new(
        store: Arc<dyn RecordStore>,
        hashing: PasswordHashing,
        minter: Arc<dyn TokenMinter>,
    ) -> Self {
        Self {
            store,
            hashing,
            minter,
            decoy: OnceCell::new(),
        }
    }

    /// PHC hash with the configured rounds, computed on first use.
    async fn decoy_hash(&self) -> Result<&str, VaultError> {
        let hashing = self.hashing;
        let decoy = self
            .decoy
            .get_or_try_init(|| async move {
                task::spawn_blocking(move || hashing.hash(DECOY_PASSWORD)).await?
            })
            .await?;
        Ok(decoy)
    }

    pub async fn provision(&self, email: &str, password: &str) -> Result<(), VaultError> {
        validate(email, password)?;

        let hashing = self.hashing;
        let secret = password.to_owned();
        let password_hash = task::spawn_blocking(move || hashing.hash(&secret)).await??;

        let account = Account {
            email: email.to_string(),
            password_hash,
            created_at: Some(Utc::now()),
        };
        match self.store.create(ACCOUNTS, email, to_fields(&account)?).await {
            Ok(()) => {
                log::info!("Provisioned account `{}`", email);
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => {
                log::debug!("Refused duplicate account `{}`", email);
                Err(VaultError::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<String, VaultError> {
        validate(email, password)?;

        let account: Option<Account> = match self.store.get(ACCOUNTS, email).await? {
            Some(doc) => Some(doc.decode()?),
            None => None,
        };
        let stored = match &account {
            Some(account) => account.password_hash.clone(),
            None => self.decoy_hash().await?.to_string(),
        };

        let secret = password.to_owned();
        let matches =
            task::spawn_blocking(move || PasswordHashing::verify(&stored, &secret)).await??;
        if account.is_none() {
            log::debug!("Login for unknown account `{}`", email);
            return Err(VaultError::Unauthorized);
        }
        if !matches {
            log::debug!("Password mismatch for `{}`", email);
            return Err(VaultError::Unauthorized);
        }

        let token = self.minter.mint(email)?;
        log::info!("Issued session for `{}`", email);
        Ok(token)
    }

    /// Sessions are stateless, so there is nothing to invalidate.
    pub fn logout(&self) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct Registered {
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedOut {}

fn credentials(body: Result<Json<Credentials>, JsonRejection>) -> Result<Credentials, Error> {
    body.map(|Json(creds)| creds).map_err(|rejection| {
        log::debug!("Rejected credentials payload: {}", rejection);
        Error::invalid("invalid request")
    })
}

pub async fn register(
    Extension(state): Extension<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Payload<Registered> {
    let creds = credentials(body)?;
    state
        .deadline(state.vault.provision(&creds.email, &creds.password))
        .await??;
    created(Registered { email: creds.email })
}

pub async fn login(
    Extension(state): Extension<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Payload<LoggedIn> {
    let creds = credentials(body)?;
    let token = state
        .deadline(state.vault.authenticate(&creds.email, &creds.password))
        .await??;
    proceeds(LoggedIn { token })
}

pub async fn logout(Extension(state): Extension<AppState>) -> Payload<LoggedOut> {
    state.vault.logout();
    proceeds(LoggedOut {})
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::session::HmacTokenMinter;
    use crate::store::testing::{CountingStore, fields};

    const TEST_ROUNDS: u32 = PasswordHashing::MIN_ROUNDS;

    /// Hands out `tok-0`, `tok-1`, ... and remembers who asked.
    #[derive(Default)]
    struct RecordingMinter {
        issued: Mutex<Vec<String>>,
    }

    impl TokenMinter for RecordingMinter {
        fn mint(&self, email: &str) -> Result<String, TokenError> {
            let mut issued = self.issued.lock().unwrap();
            issued.push(email.to_string());
            Ok(format!("tok-{}", issued.len() - 1))
        }
    }

    struct BrokenMinter;

    impl TokenMinter for BrokenMinter {
        fn mint(&self, _email: &str) -> Result<String, TokenError> {
            Err(TokenError::Encoding("entropy exhausted".to_string()))
        }
    }

    fn vault_with(store: Arc<CountingStore>, minter: Arc<dyn TokenMinter>) -> CredentialVault {
        CredentialVault::new(store, PasswordHashing::new(TEST_ROUNDS), minter)
    }

    fn vault(store: Arc<CountingStore>) -> CredentialVault {
        vault_with(store, Arc::new(HmacTokenMinter::new("test-secret")))
    }

    #[test]
    fn test_hash_roundtrip_and_mismatch() {
        let hashing = PasswordHashing::new(TEST_ROUNDS);
        let hash = hashing.hash("hunter2").unwrap();
        assert!(hash.starts_with("$pbkdf2-sha256$"));
        assert!(!hash.contains("hunter2"));
        assert!(PasswordHashing::verify(&hash, "hunter2").unwrap());
        assert!(!PasswordHashing::verify(&hash, "hunter3").unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let hashing = PasswordHashing::new(TEST_ROUNDS);
        assert_ne!(hashing.hash("same").unwrap(), hashing.hash("same").unwrap());
    }

    #[test]
    fn test_corrupt_stored_hash_is_an_error() {
        assert!(matches!(
            PasswordHashing::verify("not-a-phc-string", "pw"),
            Err(VaultError::Hashing(_))
        ));
    }

    #[test]
    fn test_rounds_have_a_floor() {
        assert_eq!(PasswordHashing::new(1).rounds(), PasswordHashing::MIN_ROUNDS);
        assert_eq!(
            PasswordHashing::default().rounds(),
            PasswordHashing::DEFAULT_ROUNDS
        );
    }

    #[tokio::test]
    async fn test_provision_twice_conflicts() {
        let store = Arc::new(CountingStore::new());
        let vault = vault(store.clone());

        vault.provision("a@x.com", "pw1").await.unwrap();
        assert!(matches!(
            vault.provision("a@x.com", "pw2").await,
            Err(VaultError::Conflict)
        ));

        let doc = store.inner.get("accounts", "a@x.com").await.unwrap().unwrap();
        let account: Account = doc.decode().unwrap();
        assert!(PasswordHashing::verify(&account.password_hash, "pw1").unwrap());
        assert!(account.created_at.is_some());
        assert!(store.inner.get("users", "a@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_input_never_touches_store() {
        let store = Arc::new(CountingStore::new());
        let vault = vault(store.clone());

        for (email, password) in [("", "pw"), ("a@x.com", ""), ("", "")] {
            assert!(matches!(
                vault.provision(email, password).await,
                Err(VaultError::Invalid(_))
            ));
            assert!(matches!(
                vault.authenticate(email, password).await,
                Err(VaultError::Invalid(_))
            ));
        }
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_authenticate_issues_token() {
        let store = Arc::new(CountingStore::new());
        let minter = Arc::new(RecordingMinter::default());
        let vault = vault_with(store, minter.clone());

        vault.provision("a@x.com", "pw1").await.unwrap();
        assert_eq!(vault.authenticate("a@x.com", "pw1").await.unwrap(), "tok-0");
        assert_eq!(*minter.issued.lock().unwrap(), vec!["a@x.com".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_email_and_wrong_password_look_the_same() {
        let store = Arc::new(CountingStore::new());
        let vault = vault(store);
        vault.provision("a@x.com", "pw1").await.unwrap();

        let wrong = Error::from(vault.authenticate("a@x.com", "wrong").await.unwrap_err());
        let unknown = Error::from(vault.authenticate("b@x.com", "pw1").await.unwrap_err());

        assert_eq!(wrong.status(), unknown.status());
        assert_eq!(
            serde_json::to_value(&wrong).unwrap(),
            serde_json::to_value(&unknown).unwrap()
        );
    }

    #[tokio::test]
    async fn test_minting_failure_is_not_downgraded() {
        let store = Arc::new(CountingStore::new());
        let vault = vault_with(store, Arc::new(BrokenMinter));
        vault.provision("a@x.com", "pw1").await.unwrap();

        assert!(matches!(
            vault.authenticate("a@x.com", "pw1").await,
            Err(VaultError::Token(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_account_is_a_generic_failure() {
        let store = Arc::new(CountingStore::new());
        store
            .inner
            .put(ACCOUNTS, "a@x.com", fields(json!({ "email": "a@x.com" })))
            .await;
        let vault = vault(store);

        assert!(matches!(
            vault.authenticate("a@x.com", "pw1").await,
            Err(VaultError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_tokens_for_repeated_logins_differ() {
        let store = Arc::new(CountingStore::new());
        let minter = Arc::new(HmacTokenMinter::new("test-secret"));
        let vault = vault_with(store, minter.clone());
        vault.provision("a@x.com", "pw1").await.unwrap();

        let first = vault.authenticate("a@x.com", "pw1").await.unwrap();
        let second = vault.authenticate("a@x.com", "pw1").await.unwrap();
        assert_ne!(first, second);
        assert!(minter.verify("a@x.com", &first));
        assert!(minter.verify("a@x.com", &second));
    }

    #[tokio::test]
    async fn test_unknown_email_runs_a_full_verification() {
        let store = Arc::new(CountingStore::new());
        let vault = CredentialVault::new(
            store,
            PasswordHashing::new(4_000),
            Arc::new(HmacTokenMinter::new("test-secret")),
        );
        assert!(vault.decoy.get().is_none());

        assert!(matches!(
            vault.authenticate("nobody@x.com", "pw1").await,
            Err(VaultError::Unauthorized)
        ));
        let decoy = vault.decoy.get().unwrap();
        let parsed = PasswordHash::new(decoy).unwrap();
        assert_eq!(parsed.algorithm.as_str(), "pbkdf2-sha256");
        assert_eq!(parsed.params.get_decimal("i"), Some(4_000));

        vault.authenticate("other@x.com", "pw2").await.unwrap_err();
        assert_eq!(vault.decoy.get().unwrap(), decoy);
    }

    async fn timed_failures(vault: &CredentialVault, email: &str) -> Duration {
        let start = Instant::now();
        for _ in 0..3 {
            vault.authenticate(email, "wrong").await.unwrap_err();
        }
        start.elapsed()
    }

    #[tokio::test]
    async fn test_unknown_email_costs_as_much_as_wrong_password() {
        let store = Arc::new(CountingStore::new());
        let vault = CredentialVault::new(
            store,
            PasswordHashing::new(50_000),
            Arc::new(HmacTokenMinter::new("test-secret")),
        );
        vault.provision("a@x.com", "pw1").await.unwrap();
        vault.authenticate("nobody@x.com", "pw1").await.unwrap_err();

        let wrong_password = timed_failures(&vault, "a@x.com").await;
        let unknown_email = timed_failures(&vault, "nobody@x.com").await;

        assert!(wrong_password > Duration::from_millis(1));
        assert!(
            unknown_email * 4 >= wrong_password,
            "unknown email took {:?}, wrong password took {:?}",
            unknown_email,
            wrong_password
        );
    }
}
