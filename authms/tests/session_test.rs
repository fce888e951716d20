mod common;

use authms::config::TokenVariant;
use authms::db::CredentialStore;
use authms::models::{Group, LoginType};
use authms::services::SessionService;
use authms::utils::clock::Clock;
use chrono::Duration;
use common::{signed_config, TestApp};
use service_core::error::AppError;
use uuid::Uuid;

async fn logged_in(app: &TestApp, username: &str) -> (Uuid, String) {
    let user = app.register(LoginType::Username, username).await;
    let session = app
        .state
        .registration
        .login(&app.creds(), LoginType::Username, username, &TestApp::password(), "phone-1")
        .await
        .unwrap();
    assert_eq!(session.user.id, user.id);
    (user.id, session.token.token)
}

#[tokio::test]
async fn test_persisted_token_lifecycle() {
    // 1. Setup
    let app = TestApp::new();
    assert_eq!(app.state.sessions.variant(), TokenVariant::Persisted);
    assert!(app.state.gc.is_some());
    let (user_id, token) = logged_in(&app, "rita").await;
    assert_eq!(app.store.token_count().unwrap(), 1);

    // 2. Validate
    let claims = app.state.sessions.validate(&token).await.unwrap();
    assert_eq!(claims.user_id, user_id);
    assert_eq!(claims.device_id, "phone-1");
    assert_eq!(claims.expires_at - claims.issued_at, Duration::hours(24));

    // 3. Revoke, after which the token is unknown
    app.state.sessions.revoke(&token).await.unwrap();
    assert_eq!(app.store.token_count().unwrap(), 0);
    let err = app.state.sessions.validate(&token).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidToken(_)));

    let err = app.state.sessions.revoke(&token).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidToken(_)));
}

#[tokio::test]
async fn test_persisted_groups_are_read_live() {
    let app = TestApp::new();
    let (user_id, token) = logged_in(&app, "sam").await;
    let admin = app.admin_group().await;

    let claims = app.state.sessions.validate(&token).await.unwrap();
    assert!(!SessionService::authorize(&claims, &admin));

    let mut tx = app.store.begin().await.unwrap();
    tx.add_user_to_group(user_id, admin.id).await.unwrap();
    tx.commit().await.unwrap();

    let claims = app.state.sessions.validate(&token).await.unwrap();
    assert!(SessionService::authorize(&claims, &admin));

    let stranger = Group::new("auditors", 2, app.clock.now()).unwrap();
    assert!(!SessionService::authorize(&claims, &stranger));
}

#[tokio::test]
async fn test_expired_persisted_token_is_deleted_on_validate() {
    let app = TestApp::new();
    let (_, token) = logged_in(&app, "tara").await;

    app.clock.advance(Duration::hours(24));
    let err = app.state.sessions.validate(&token).await.unwrap_err();
    assert!(matches!(err, AppError::TokenExpired(_)));
    assert_eq!(app.store.token_count().unwrap(), 0);

    // Gone now, so a second attempt no longer knows it
    let err = app.state.sessions.validate(&token).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidToken(_)));
}

#[tokio::test]
async fn test_garbage_tokens_are_invalid() {
    let app = TestApp::new();

    for token in ["", "   ", "not-a-token"] {
        let err = app.state.sessions.validate(token).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidToken(_)), "{token:?}");
    }
}

#[tokio::test]
async fn test_signed_token_lifecycle() {
    // 1. Setup
    let app = TestApp::with_config(signed_config());
    assert_eq!(app.state.sessions.variant(), TokenVariant::Signed);
    // Nothing to collect, so no collector is wired
    assert!(app.state.gc.is_none());
    let (user_id, token) = logged_in(&app, "uma").await;

    // 2. Nothing is stored for signed tokens
    assert_eq!(app.store.token_count().unwrap(), 0);
    let claims = app.state.sessions.validate(&token).await.unwrap();
    assert_eq!(claims.user_id, user_id);
    assert_eq!(claims.expires_at - claims.issued_at, Duration::hours(1));

    // 3. Revocation is unsupported
    let err = app.state.sessions.revoke(&token).await.unwrap_err();
    assert!(err.is_not_implemented());
    app.state.sessions.validate(&token).await.unwrap();

    // 4. Tampering breaks the signature
    let mut tampered = token.clone();
    tampered.push('x');
    let err = app.state.sessions.validate(&tampered).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidToken(_)));

    // 5. Expiry follows the engine clock
    app.clock.advance(Duration::hours(1));
    let err = app.state.sessions.validate(&token).await.unwrap_err();
    assert!(matches!(err, AppError::TokenExpired(_)));
}

#[tokio::test]
async fn test_signed_token_carries_group_snapshot() {
    let app = TestApp::with_config(signed_config());
    let admin_token = app.admin_token("vera").await;
    let admin = app.admin_group().await;

    let claims = app.state.sessions.validate(&admin_token).await.unwrap();
    assert!(SessionService::authorize(&claims, &admin));
    assert!(claims.groups.iter().any(|g| g.name == "admin"));
}
