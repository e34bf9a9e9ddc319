use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, pending};
use identity_server::{
    auth::{
        service::{LinkRequest, LoginRequest, RegisterRequest},
        AuthService, LinkOutcome, Notifier,
    },
    db::{
        models::{NewIdentity, NewUser, OAuthIdentity, User},
        CredentialStore, IdentityLinkStore, MemoryStore,
    },
    error::{AppError, AuthError, StoreError},
    Result, Settings,
};
use mockall::mock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Verification { email: String, token: String },
    Reset { email: String, token: String },
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    fn last_token(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|sent| match sent {
            Sent::Verification { token, .. } | Sent::Reset { token, .. } => token.clone(),
        })
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_verification(&self, _user: &User, email: &str, token: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Verification {
            email: email.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    async fn send_password_reset(&self, _user: &User, email: &str, token: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Reset {
            email: email.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }
}

mock! {
    pub Store {}

    #[async_trait]
    impl CredentialStore for Store {
        async fn create_user(&self, new_user: NewUser) -> Result<User>;
        async fn find_by_username(&self, username: &str) -> Result<Option<User>>;
        async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>>;
        async fn find_by_email(&self, email: &str) -> Result<Option<User>>;
        async fn set_password_hash(&self, user_id: Uuid, password_hash: Option<String>) -> Result<User>;
        async fn record_login(&self, user_id: Uuid) -> Result<()>;
        async fn set_verification_token(&self, user_id: Uuid, token_hash: String) -> Result<()>;
        async fn consume_verification_token(&self, token_hash: &str) -> Result<User>;
        async fn set_reset_token(&self, user_id: Uuid, token_hash: String, expires_at: DateTime<Utc>) -> Result<()>;
        async fn consume_reset_token(&self, token_hash: &str, new_password_hash: String) -> Result<User>;
        async fn delete_user(&self, user_id: Uuid) -> Result<()>;
        async fn ping(&self) -> Result<()>;
    }

    #[async_trait]
    impl IdentityLinkStore for Store {
        async fn link_identity(&self, user_id: Uuid, identity: NewIdentity) -> Result<OAuthIdentity>;
        async fn create_user_with_identity(&self, new_user: NewUser, identity: NewIdentity) -> Result<(User, OAuthIdentity)>;
        async fn find_by_provider_identity(&self, provider: &str, provider_subject_id: &str) -> Result<Option<OAuthIdentity>>;
        async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OAuthIdentity>>;
        async fn unlink_identity(&self, user_id: Uuid, provider: &str) -> Result<User>;
    }
}

/// Never answers; every call runs into the service deadline.
struct StalledStore;

#[async_trait]
impl CredentialStore for StalledStore {
    async fn create_user(&self, _new_user: NewUser) -> Result<User> {
        pending().await
    }
    async fn find_by_username(&self, _username: &str) -> Result<Option<User>> {
        pending().await
    }
    async fn find_by_id(&self, _user_id: Uuid) -> Result<Option<User>> {
        pending().await
    }
    async fn find_by_email(&self, _email: &str) -> Result<Option<User>> {
        pending().await
    }
    async fn set_password_hash(&self, _user_id: Uuid, _password_hash: Option<String>) -> Result<User> {
        pending().await
    }
    async fn record_login(&self, _user_id: Uuid) -> Result<()> {
        pending().await
    }
    async fn set_verification_token(&self, _user_id: Uuid, _token_hash: String) -> Result<()> {
        pending().await
    }
    async fn consume_verification_token(&self, _token_hash: &str) -> Result<User> {
        pending().await
    }
    async fn set_reset_token(&self, _user_id: Uuid, _token_hash: String, _expires_at: DateTime<Utc>) -> Result<()> {
        pending().await
    }
    async fn consume_reset_token(&self, _token_hash: &str, _new_password_hash: String) -> Result<User> {
        pending().await
    }
    async fn delete_user(&self, _user_id: Uuid) -> Result<()> {
        pending().await
    }
    async fn ping(&self) -> Result<()> {
        pending().await
    }
}

#[async_trait]
impl IdentityLinkStore for StalledStore {
    async fn link_identity(&self, _user_id: Uuid, _identity: NewIdentity) -> Result<OAuthIdentity> {
        pending().await
    }
    async fn create_user_with_identity(&self, _new_user: NewUser, _identity: NewIdentity) -> Result<(User, OAuthIdentity)> {
        pending().await
    }
    async fn find_by_provider_identity(&self, _provider: &str, _provider_subject_id: &str) -> Result<Option<OAuthIdentity>> {
        pending().await
    }
    async fn list_for_user(&self, _user_id: Uuid) -> Result<Vec<OAuthIdentity>> {
        pending().await
    }
    async fn unlink_identity(&self, _user_id: Uuid, _provider: &str) -> Result<User> {
        pending().await
    }
}

fn test_settings() -> Settings {
    Settings::new_for_test().expect("Failed to load test config")
}

fn service_with(settings: &Settings, store: MemoryStore) -> AuthService {
    AuthService::from_settings(settings, Arc::new(store)).expect("Failed to build auth service")
}

fn service() -> (AuthService, MemoryStore) {
    let store = MemoryStore::new();
    (service_with(&test_settings(), store.clone()), store)
}

fn register_request(username: &str, password: &str, email: Option<&str>) -> RegisterRequest {
    RegisterRequest {
        username: username.to_string(),
        password: password.to_string(),
        email: email.map(str::to_string),
    }
}

fn login_request(username: &str, password: &str) -> LoginRequest {
    LoginRequest {
        username: username.to_string(),
        password: password.to_string(),
        remember_me: false,
    }
}

fn link_request(provider: &str, subject: &str, access_token: &str) -> LinkRequest {
    LinkRequest {
        provider: provider.to_string(),
        provider_subject_id: subject.to_string(),
        provider_email: Some(format!("{}@example.com", subject)),
        access_token: Some(access_token.to_string()),
        refresh_token: Some(format!("refresh-{}", access_token)),
        token_expires_at: None,
    }
}

fn assert_flags_consistent(user: &User) {
    assert_eq!(user.has_password(), !user.oauth_only());
    assert_eq!(user.has_password(), user.password_hash().is_some());
}

fn expect_auth_error<T: std::fmt::Debug>(result: Result<T>, expected: AuthError) {
    match result {
        Err(AppError::AuthError(actual)) => assert_eq!(actual, expected),
        other => panic!("expected {:?}, got {:?}", expected, other),
    }
}

fn expect_store_error<T: std::fmt::Debug>(result: Result<T>, expected: StoreError) {
    match result {
        Err(AppError::StoreError(actual)) => assert_eq!(actual, expected),
        other => panic!("expected {:?}, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn test_register_login_verify() {
    let (service, store) = service();

    let registered = service
        .register("10.0.0.1", register_request("alice", "password123", None))
        .await
        .unwrap();
    assert_eq!(registered.user.username, "alice");

    let session = service
        .login("10.0.0.1", login_request("alice", "password123"))
        .await
        .unwrap();
    let claims = service.verify(&session.token).unwrap();
    assert_eq!(claims.user_id().unwrap(), session.user.id);
    assert_eq!(claims.username, "alice");
    assert_eq!(claims.role, session.user.role);
    assert_eq!(session.expires_in, 24 * 3600);

    let user = store.find_by_username("alice").await.unwrap().unwrap();
    assert_flags_consistent(&user);
    assert!(user.has_password());
}

#[tokio::test]
async fn test_login_trims_username_like_register() {
    let (service, _) = service();
    let registered = service
        .register("c", register_request(" alice ", "password123", None))
        .await
        .unwrap();
    assert_eq!(registered.user.username, "alice");

    for username in [" alice ", " alice", "alice"] {
        let session = service
            .login("c", login_request(username, "password123"))
            .await
            .unwrap();
        assert_eq!(session.user.id, registered.user.id);
    }

    assert!(matches!(
        service.login("c", login_request("   ", "password123")).await,
        Err(AppError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_remember_me_extends_lifetime() {
    let (service, _) = service();
    service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap();

    let mut request = login_request("alice", "password123");
    request.remember_me = true;
    let session = service.login("c", request).await.unwrap();
    assert_eq!(session.expires_in, 30 * 24 * 3600);
}

#[tokio::test]
async fn test_register_rejects_invalid_input() {
    let (service, _) = service();

    for request in [
        register_request("", "password123", None),
        register_request("bob", "", None),
        register_request("bob", "short", None),
        register_request("bob", "password123", Some("not-an-email")),
    ] {
        assert!(matches!(
            service.register("c", request).await,
            Err(AppError::ValidationError(_))
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_single_winner() {
    let (service, _) = service();
    let service = Arc::new(service);

    let attempts = (0..8).map(|i| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .register(&format!("10.0.1.{}", i), register_request("contested", "password123", None))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.into_iter().filter(|r| r.is_err()) {
        expect_store_error(result, StoreError::DuplicateUsername);
    }
}

#[tokio::test]
async fn test_login_failures_are_indistinguishable() {
    let (service, _) = service();
    service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap();

    let wrong_password = service
        .login("c", login_request("alice", "wrong-password"))
        .await
        .unwrap_err();
    let unknown_user = service
        .login("c", login_request("nobody", "password123"))
        .await
        .unwrap_err();

    assert!(matches!(wrong_password, AppError::AuthError(AuthError::InvalidCredentials)));
    assert!(matches!(unknown_user, AppError::AuthError(AuthError::InvalidCredentials)));
    assert_eq!(wrong_password.code(), unknown_user.code());
    assert_eq!(wrong_password.to_string(), unknown_user.to_string());
}

#[tokio::test]
async fn test_rate_limit_precedes_credential_lookup() {
    let mut store = MockStore::new();
    store
        .expect_find_by_username()
        .times(5)
        .returning(|_| Ok(None));

    let service = AuthService::from_settings(&test_settings(), Arc::new(store)).unwrap();

    for _ in 0..5 {
        expect_auth_error(
            service.login("10.0.0.9", login_request("alice", "password123")).await,
            AuthError::InvalidCredentials,
        );
    }

    // The sixth attempt never reaches the store.
    match service.login("10.0.0.9", login_request("alice", "password123")).await {
        Err(AppError::AuthError(AuthError::RateLimited { retry_after_secs })) => {
            assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
        }
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rate_limit_is_per_client() {
    let (service, _) = service();
    for _ in 0..5 {
        let _ = service.login("10.0.0.1", login_request("alice", "x")).await;
    }
    expect_auth_error(
        service.login("10.0.0.2", login_request("alice", "x")).await,
        AuthError::InvalidCredentials,
    );
}

#[tokio::test]
async fn test_last_login_recorded() {
    let (service, store) = service();
    let registered = service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap();
    service.login("c", login_request("alice", "password123")).await.unwrap();

    let mut recorded = false;
    for _ in 0..50 {
        let user = store.find_by_id(registered.user.id).await.unwrap().unwrap();
        if user.last_login.is_some() {
            recorded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recorded);
}

#[tokio::test]
async fn test_clear_password_requires_identity() {
    let (service, store) = service();
    let session = service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap();
    let user_id = session.user.id;

    expect_store_error(
        service.clear_password(user_id, "password123").await,
        StoreError::LastCredentialRemoved,
    );
    let user = store.find_by_id(user_id).await.unwrap().unwrap();
    assert!(user.has_password());
    assert_flags_consistent(&user);

    let linked = service
        .link_oauth_identity(link_request("google", "g-1", "access-1"), Some(user_id))
        .await
        .unwrap();
    assert_eq!(linked.outcome, LinkOutcome::Linked);
    assert_eq!(linked.session.user.id, user_id);

    expect_auth_error(
        service.clear_password(user_id, "wrong-password").await,
        AuthError::InvalidCredentials,
    );

    let user = service.clear_password(user_id, "password123").await.unwrap();
    assert!(user.oauth_only());
    assert_flags_consistent(&user);

    // The last identity of an OAuth-only account cannot go.
    expect_store_error(
        service.unlink_identity(user_id, "google").await,
        StoreError::LastCredentialRemoved,
    );
    assert_eq!(service.list_identities(user_id).await.unwrap().len(), 1);

    expect_auth_error(
        service.login("c", login_request("alice", "password123")).await,
        AuthError::InvalidCredentials,
    );
}

#[tokio::test]
async fn test_set_password_rules() {
    let (service, _) = service();
    let session = service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap();
    let user_id = session.user.id;

    assert!(matches!(
        service.set_password(user_id, None, "newpassword").await,
        Err(AppError::ValidationError(_))
    ));
    expect_auth_error(
        service.set_password(user_id, Some("wrong"), "newpassword").await,
        AuthError::InvalidCredentials,
    );
    assert!(matches!(
        service.set_password(user_id, Some("password123"), "password123").await,
        Err(AppError::ValidationError(_))
    ));

    let user = service
        .set_password(user_id, Some("password123"), "newpassword")
        .await
        .unwrap();
    assert_flags_consistent(&user);
    service.login("c", login_request("alice", "newpassword")).await.unwrap();
}

#[tokio::test]
async fn test_oauth_first_link_creates_shell_user() {
    let (service, store) = service();

    let created = service
        .link_oauth_identity(link_request("GitHub", "octocat", "access-1"), None)
        .await
        .unwrap();
    assert_eq!(created.outcome, LinkOutcome::Created);
    assert_eq!(created.identity.provider, "github");
    assert_eq!(created.session.user.username, "octocat_github");

    let user = store.find_by_id(created.session.user.id).await.unwrap().unwrap();
    assert!(user.oauth_only());
    assert_flags_consistent(&user);

    // The same identity logs the same account in again.
    let again = service
        .link_oauth_identity(link_request("github", "octocat", "access-2"), None)
        .await
        .unwrap();
    assert_eq!(again.outcome, LinkOutcome::Authenticated);
    assert_eq!(again.session.user.id, user.id);

    // An OAuth-only account gains a password without presenting one.
    let user = service.set_password(user.id, None, "password123").await.unwrap();
    assert!(user.has_password());
    assert_flags_consistent(&user);
    service
        .login("c", login_request("octocat_github", "password123"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shell_username_collision_gets_suffix() {
    let (service, _) = service();
    service
        .register("c", register_request("octocat_github", "password123", None))
        .await
        .unwrap();

    let created = service
        .link_oauth_identity(link_request("github", "octocat", "access"), None)
        .await
        .unwrap();
    assert_eq!(created.outcome, LinkOutcome::Created);
    assert_ne!(created.session.user.username, "octocat_github");
    assert!(created.session.user.username.starts_with("octocat_github_"));
}

#[tokio::test]
async fn test_identity_belongs_to_one_account() {
    let (service, store) = service();
    let alice = service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap()
        .user;
    let bob = service
        .register("c", register_request("bob", "password123", None))
        .await
        .unwrap()
        .user;

    service
        .link_oauth_identity(link_request("google", "shared", "access-1"), Some(alice.id))
        .await
        .unwrap();

    // At the store the second claim is a conflict.
    let identity = NewIdentity {
        provider: "google".to_string(),
        provider_subject_id: "shared".to_string(),
        provider_email: None,
        access_token: None,
        refresh_token: None,
        token_expires_at: None,
    };
    expect_store_error(
        store.link_identity(bob.id, identity).await,
        StoreError::IdentityAlreadyLinked,
    );

    // Through the API the mapping wins: Bob's request logs Alice in.
    let response = service
        .link_oauth_identity(link_request("google", "shared", "access-2"), Some(bob.id))
        .await
        .unwrap();
    assert_eq!(response.outcome, LinkOutcome::Authenticated);
    assert_eq!(response.session.user.id, alice.id);
    assert!(service.list_identities(bob.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relink_same_account_refreshes_tokens() {
    let (service, _) = service();
    let alice = service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap()
        .user;

    let first = service
        .link_oauth_identity(link_request("google", "g-7", "access-1"), Some(alice.id))
        .await
        .unwrap();
    let second = service
        .link_oauth_identity(link_request("google", "g-7", "access-2"), Some(alice.id))
        .await
        .unwrap();
    assert_eq!(first.identity.id, second.identity.id);

    let identities = service.list_identities(alice.id).await.unwrap();
    assert_eq!(identities.len(), 1);
    // Stored encrypted.
    assert_ne!(identities[0].access_token.as_deref(), Some("access-2"));

    let tokens = service.provider_tokens(alice.id, "google").await.unwrap();
    assert_eq!(tokens.access_token.as_deref(), Some("access-2"));
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-access-2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_links_resolve_to_one_account() {
    let (service, _) = service();
    let service = Arc::new(service);

    let attempts = (0..8).map(|_| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .link_oauth_identity(link_request("github", "racer", "access"), None)
                .await
        })
    });
    let responses: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let owner = responses[0].session.user.id;
    assert!(responses.iter().all(|r| r.session.user.id == owner));
    assert_eq!(
        responses.iter().filter(|r| r.outcome == LinkOutcome::Created).count(),
        1
    );
    assert_eq!(service.list_identities(owner).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_link_rejects_bad_provider_input() {
    let (service, _) = service();
    assert!(matches!(
        service
            .link_oauth_identity(link_request("not a provider", "1", "a"), None)
            .await,
        Err(AppError::ValidationError(_))
    ));
    assert!(matches!(
        service.link_oauth_identity(link_request("google", "  ", "a"), None).await,
        Err(AppError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_password_reset_flow() {
    let notifier = Arc::new(RecordingNotifier::default());
    let store = MemoryStore::new();
    let service = service_with(&test_settings(), store.clone()).with_notifier(notifier.clone());

    service
        .register("c", register_request("alice", "password123", Some("alice@example.com")))
        .await
        .unwrap();
    let sent_before = notifier.count();

    // Unknown addresses get the same answer and no mail.
    service
        .request_password_reset("c", "nobody@example.com")
        .await
        .unwrap();
    assert_eq!(notifier.count(), sent_before);

    service
        .request_password_reset("c", "alice@example.com")
        .await
        .unwrap();
    let token = notifier.last_token().unwrap();

    // Only the digest is stored.
    let user = store.find_by_username("alice").await.unwrap().unwrap();
    assert_ne!(user.reset_token_hash.as_deref(), Some(token.as_str()));

    let user = service.reset_password("c", &token, "brand-new-pass").await.unwrap();
    assert_flags_consistent(&user);
    service
        .login("c", login_request("alice", "brand-new-pass"))
        .await
        .unwrap();

    expect_auth_error(
        service.reset_password("c", &token, "another-pass").await,
        AuthError::InvalidToken,
    );
}

#[tokio::test]
async fn test_expired_reset_token() {
    let mut settings = test_settings();
    settings.auth.reset_token_ttl_minutes = -1;
    let notifier = Arc::new(RecordingNotifier::default());
    let service = service_with(&settings, MemoryStore::new()).with_notifier(notifier.clone());

    service
        .register("c", register_request("alice", "password123", Some("alice@example.com")))
        .await
        .unwrap();
    service
        .request_password_reset("c", "alice@example.com")
        .await
        .unwrap();
    let token = notifier.last_token().unwrap();

    expect_auth_error(
        service.reset_password("c", &token, "brand-new-pass").await,
        AuthError::ExpiredToken,
    );
    // The expired token was burned as well.
    expect_auth_error(
        service.reset_password("c", &token, "brand-new-pass").await,
        AuthError::InvalidToken,
    );
    service
        .login("c", login_request("alice", "password123"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_email_verification_is_single_use() {
    let notifier = Arc::new(RecordingNotifier::default());
    let service = service_with(&test_settings(), MemoryStore::new()).with_notifier(notifier.clone());

    let session = service
        .register("c", register_request("alice", "password123", Some("alice@example.com")))
        .await
        .unwrap();
    let token = notifier.last_token().unwrap();
    let first = notifier.sent.lock().unwrap().first().cloned();
    assert_eq!(
        first,
        Some(Sent::Verification {
            email: "alice@example.com".to_string(),
            token: token.clone(),
        })
    );

    assert!(!service.profile(session.user.id).await.unwrap().email_verified);
    let user = service.verify_email("c", &token).await.unwrap();
    assert!(user.email_verified);
    assert!(service.profile(session.user.id).await.unwrap().email_verified);

    expect_auth_error(service.verify_email("c", &token).await, AuthError::InvalidToken);
    expect_auth_error(service.verify_email("c", "").await, AuthError::InvalidToken);
}

#[tokio::test]
async fn test_profile_lists_identities_in_link_order() {
    let (service, _) = service();
    let alice = service
        .register("c", register_request("alice", "password123", Some("alice@example.com")))
        .await
        .unwrap()
        .user;

    for (provider, subject) in [("google", "g-1"), ("github", "gh-1"), ("facebook", "fb-1")] {
        service
            .link_oauth_identity(link_request(provider, subject, "access"), Some(alice.id))
            .await
            .unwrap();
    }

    let profile = service.profile(alice.id).await.unwrap();
    assert_eq!(profile.username, "alice");
    assert!(profile.has_password);
    assert!(!profile.oauth_only);
    let providers: Vec<_> = profile.identities.iter().map(|i| i.provider.as_str()).collect();
    assert_eq!(providers, vec!["google", "github", "facebook"]);

    let json = serde_json::to_string(&profile).unwrap();
    assert!(!json.contains("password_hash"));
    assert!(!json.contains("access_token"));
}

#[tokio::test]
async fn test_delete_account() {
    let (service, store) = service();
    let session = service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap();
    let user_id = session.user.id;
    service
        .link_oauth_identity(link_request("google", "g-1", "access"), Some(user_id))
        .await
        .unwrap();

    assert!(matches!(
        service.delete_account(user_id, Some("password123"), "delete").await,
        Err(AppError::ValidationError(_))
    ));
    expect_auth_error(
        service.delete_account(user_id, Some("wrong"), "DELETE").await,
        AuthError::InvalidCredentials,
    );
    assert!(matches!(
        service.delete_account(user_id, None, "DELETE").await,
        Err(AppError::ValidationError(_))
    ));
    assert!(matches!(
        service.delete_account(user_id, Some(""), "DELETE").await,
        Err(AppError::ValidationError(_))
    ));

    service
        .delete_account(user_id, Some("password123"), "DELETE")
        .await
        .unwrap();
    assert!(store.find_by_id(user_id).await.unwrap().is_none());
    assert!(store
        .find_by_provider_identity("google", "g-1")
        .await
        .unwrap()
        .is_none());

    // Issued tokens outlive the account, but cannot be refreshed.
    assert!(service.verify(&session.token).is_ok());
    expect_auth_error(service.refresh(&session.token).await, AuthError::InvalidCredentials);
    expect_auth_error(service.profile(user_id).await, AuthError::InvalidCredentials);
}

#[tokio::test]
async fn test_refresh_issues_new_token() {
    let (service, _) = service();
    let session = service
        .register("c", register_request("alice", "password123", None))
        .await
        .unwrap();

    let refreshed = service.refresh(&session.token).await.unwrap();
    let claims = service.verify(&refreshed.token).unwrap();
    assert_eq!(claims.user_id().unwrap(), session.user.id);

    expect_auth_error(service.refresh("garbage").await, AuthError::MalformedToken);
}

#[test_log::test(tokio::test)]
async fn test_stalled_store_surfaces_unavailable() {
    let mut settings = test_settings();
    settings.database.operation_timeout_secs = 1;
    let service = AuthService::from_settings(&settings, Arc::new(StalledStore)).unwrap();

    let result = service.login("c", login_request("alice", "password123")).await;
    match result {
        Err(AppError::StoreError(StoreError::Unavailable(_))) => {}
        other => panic!("expected store unavailable, got {:?}", other),
    }

    let report = service.health().await;
    assert_eq!(report.status, "degraded");
    assert_eq!(report.store, "down");
}

#[test]
fn test_bridge_key_check() {
    let service = service_with(&test_settings(), MemoryStore::new());
    assert!(service.check_bridge_key(Some("test_bridge_key")).is_ok());
    expect_auth_error(
        service.check_bridge_key(Some("wrong")),
        AuthError::Forbidden("invalid bridge key".to_string()),
    );
    assert!(service.check_bridge_key(None).is_err());

    let mut settings = test_settings();
    settings.auth.bridge_key = None;
    let service = service_with(&settings, MemoryStore::new());
    expect_auth_error(
        service.check_bridge_key(Some("test_bridge_key")),
        AuthError::Forbidden("identity linking is disabled".to_string()),
    );
}

#[test]
fn test_production_rejects_development_secret() {
    let mut settings = test_settings();
    settings.environment = "production".to_string();
    settings.auth.token_encryption_key =
        Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string());
    settings.auth.jwt_secret = identity_server::config::DEVELOPMENT_JWT_SECRET.to_string();

    let result = AuthService::from_settings(&settings, Arc::new(MemoryStore::new()));
    assert!(matches!(result, Err(AppError::ConfigError(_))));

    settings.auth.jwt_secret = "a-real-production-secret".to_string();
    assert!(AuthService::from_settings(&settings, Arc::new(MemoryStore::new())).is_ok());

    // Outside production the built-in secret is still accepted.
    settings.environment = "development".to_string();
    settings.auth.jwt_secret = identity_server::config::DEVELOPMENT_JWT_SECRET.to_string();
    assert!(AuthService::from_settings(&settings, Arc::new(MemoryStore::new())).is_ok());
}
