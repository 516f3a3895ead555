use goose::prelude::*;
use std::env;

const DEFAULT_IDENTIFIER: &str = "https://loadtest.invalid/";

async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose_metrics = user.get("/healthz").await?;
    Ok(())
}

async fn get_login_form(user: &mut GooseUser) -> TransactionResult {
    let _goose_metrics = user.get("/openid/consumer").await?;
    Ok(())
}

/// Login with an identifier outside the allowlist; answered without any
/// provider traffic.
async fn get_unauthorized_login(user: &mut GooseUser) -> TransactionResult {
    let identifier =
        env::var("OPENID_IDENTIFIER").unwrap_or_else(|_| DEFAULT_IDENTIFIER.to_string());
    let path = format!("/openid/consumer/login?openid_identifier={identifier}");
    let request = GooseRequest::builder()
        .method(GooseMethod::Get)
        .path(path.as_str())
        .expect_status_code(401)
        .build();
    let _goose_metrics = user.request(request).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    if env::var("OPENID_IDENTIFIER").is_err() {
        println!("No OPENID_IDENTIFIER environment variable set, defaulting to '{DEFAULT_IDENTIFIER}'");
    }

    GooseAttack::initialize()?
        .register_scenario(
            scenario!("HealthCheck").register_transaction(transaction!(health_check)),
        )
        .register_scenario(
            scenario!("ConsumerPages")
                .register_transaction(transaction!(get_login_form))
                .register_transaction(transaction!(get_unauthorized_login)),
        )
        .execute()
        .await?;

    Ok(())
}
