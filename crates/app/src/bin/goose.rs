use goose::prelude::*;
use rand::Rng;
use serde_json::json;

const TARGET_LOOP_ITERATIONS: u32 = 200_000;

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

fn run_payload(language: &str, code: String) -> serde_json::Value {
    json!({
        "language": language,
        "code": code,
        "timeout": 10,
    })
}

fn python_program(a: u32, b: u32) -> String {
    format!(
        "total = 0\nfor i in range({TARGET_LOOP_ITERATIONS}):\n    total += i % 7\nprint({a} + {b})\n"
    )
}

fn bash_program(a: u32, b: u32) -> String {
    format!("echo $(({a} + {b}))\n")
}

async fn check_run(
    user: &mut GooseUser,
    payload: serde_json::Value,
    expected: String,
) -> TransactionResult {
    let mut goose = user.post_json("/v1/code_interpreter/run", &payload).await?;
    let response = goose
        .response
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    if !status.is_success() {
        return user.set_failure(
            &format!("status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return user.set_failure("invalid json", &mut goose.request, None, Some(&body)),
    };
    let output = parsed.get("output").and_then(|value| value.as_str());
    if output.map(str::trim) != Some(expected.as_str()) {
        return user.set_failure("unexpected output", &mut goose.request, None, Some(&body));
    }
    Ok(())
}

async fn python_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let (a, b) = {
        let mut rng = rand::rng();
        (rng.random_range(1..1_000), rng.random_range(1..1_000))
    };
    check_run(user, run_payload("python", python_program(a, b)), (a + b).to_string()).await
}

async fn bash_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let (a, b) = {
        let mut rng = rand::rng();
        (rng.random_range(1..1_000), rng.random_range(1..1_000))
    };
    check_run(user, run_payload("shell", bash_program(a, b)), (a + b).to_string()).await
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("code_interpreter_run")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(python_roundtrip).set_weight(3)?)
                .register_transaction(transaction!(bash_roundtrip)),
        )
        .execute()
        .await?;
    Ok(())
}
