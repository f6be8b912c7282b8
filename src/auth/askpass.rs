//! Credential callback: ask an HTTP endpoint for a username and password.

use std::time::Duration;

use tracing::debug;

use super::AuthError;

/// GET the askpass URL and parse the credentials out of its body.
///
/// The endpoint must answer 200 with `key=value` lines; `username` and
/// `password` are the recognized keys. Redirects are not followed.
pub async fn fetch_credentials(url: &str) -> Result<(String, String), AuthError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let resp = client.get(url).send().await?;
    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuthError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body = resp.text().await?;
    debug!("askpass URL answered");
    Ok(parse_credential_body(&body))
}

/// Parse `key=value` lines; the first `=` splits. Unknown keys are ignored.
fn parse_credential_body(body: &str) -> (String, String) {
    let mut username = String::new();
    let mut password = String::new();
    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "username" => username = value.to_string(),
            "password" => password = value.to_string(),
            _ => {}
        }
    }
    (username, password)
}
