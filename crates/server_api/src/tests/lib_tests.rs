use super::*;

async fn test_ctx() -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    ApiContext {
        storage,
        auth: AuthConfig {
            jwt_secret: "test-secret".into(),
            token_ttl_seconds: 3600,
            bcrypt_cost: 4,
        },
    }
}

fn creds(user_id: &str, password: &str) -> Credentials {
    Credentials {
        user_id: user_id.into(),
        password: password.into(),
    }
}

#[tokio::test]
async fn signup_then_login_issues_verifiable_token() {
    let ctx = test_ctx().await;
    signup(&ctx, creds("alice", "hunter2")).await.expect("signup");

    let response = login(&ctx, creds("alice", "hunter2")).await.expect("login");
    let user = verify_token(&ctx.auth, &response.token).expect("verify");
    assert_eq!(user.user_id, UserId::from("alice"));
}

#[tokio::test]
async fn password_is_stored_hashed() {
    let ctx = test_ctx().await;
    signup(&ctx, creds("alice", "hunter2")).await.expect("signup");
    let hash = ctx
        .storage
        .password_hash_for(&UserId::from("alice"))
        .await
        .expect("lookup")
        .expect("user");
    assert_ne!(hash, "hunter2");
    assert!(bcrypt::verify("hunter2", &hash).expect("verify"));
}

#[tokio::test]
async fn duplicate_signup_is_a_conflict() {
    let ctx = test_ctx().await;
    signup(&ctx, creds("alice", "one")).await.expect("signup");
    let err = signup(&ctx, creds("alice", "two")).await.expect_err("conflict");
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn signup_validates_input() {
    let ctx = test_ctx().await;
    let err = signup(&ctx, creds("   ", "pw")).await.expect_err("empty id");
    assert_eq!(err.code, ErrorCode::Validation);
    let err = signup(&ctx, creds("alice", "")).await.expect_err("empty pw");
    assert_eq!(err.code, ErrorCode::Validation);
    let err = signup(&ctx, creds(&"x".repeat(65), "pw"))
        .await
        .expect_err("long id");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn login_rejects_unknown_user_and_wrong_password() {
    let ctx = test_ctx().await;
    signup(&ctx, creds("alice", "right")).await.expect("signup");

    let err = login(&ctx, creds("bob", "right")).await.expect_err("unknown");
    assert_eq!(err.code, ErrorCode::Unauthorized);
    let err = login(&ctx, creds("alice", "wrong")).await.expect_err("wrong pw");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn missing_attachment_is_not_found() {
    let ctx = test_ctx().await;
    let err = load_attachment(&ctx, &AttachmentId::from("nope"))
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);

    let id = ctx
        .storage
        .store_attachment(b"data", "a.txt", "text/plain")
        .await
        .expect("store");
    let loaded = load_attachment(&ctx, &id).await.expect("load");
    assert_eq!(loaded.bytes, b"data");
}
